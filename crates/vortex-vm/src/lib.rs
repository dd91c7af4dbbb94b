//! vortex-vm — Machine virtuelle d’exécution pour le langage Vortex
//!
//! Ce crate exécute le bytecode produit par l’émetteur Vortex (voir
//! `vortex-core`). Il expose :
//!
//! - un type [`Vm`] avec configuration par [`VmOptions`],
//! - un modèle de valeurs dynamique [`Value`] (identité, meta-flags, hooks),
//! - la boucle de dispatch (frames, closures, générateurs, try/catch),
//! - des **fonctions natives** (host functions) et un petit *stdlib*,
//! - un registre de valeurs **hissées** pour l’embarquement host,
//! - un système d’erreurs à deux canaux : [`ErrorObj`] (erreurs du langage,
//!   rattrapables) et [`VmError`] (fautes machine).
//!
//! ### Exemple d’utilisation
//!
//! ```no_run
//! use vortex_core::bytecode::read_chunk_file;
//! use vortex_vm::{Vm, VmOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let chunk = read_chunk_file("programme.vxc")?;
//! let mut vm = Vm::with_options(VmOptions::default().with_stdlib(true));
//! let result = vm.run_chunk(chunk)?;
//! println!("=> {result}");
//! # Ok(())
//! # }
//! ```
//!
//! ### Modèle d’exécution
//!
//! Mono-thread coopératif : une VM exécute une pile de frames ; les entrées
//! host (callbacks, hooks) construisent une frame éphémère et tournent
//! jusqu’à complétion. La ré-entrance d’une VM déjà en cours depuis le host
//! est refusée ([`VmError::Reentrancy`]).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

use std::path::PathBuf;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use vortex_core::bytecode::Chunk;

mod error;
mod eval;
mod frame;
mod imports;
mod value;

pub use error::{ErrorKind, ErrorObj, UncaughtError, VmError};
pub use frame::{CallFrame, LoopEntry, TryHandler};
pub use value::{
    gc, values_equal, vbool, verr, vlist, vnone, vnum, vstr, CellState, ClosureCell, FunctionObj,
    Gc, GeneratorState, Hook, Hooks, Meta, NativeFn, NativeObj, ObjectObj, TypeObj, Value,
    ValueKind,
};

use eval::{Flow, OpError};
use frame::CallFrame as Frame;

/// Résultat standard de la VM.
pub type VmResult<T> = Result<T, VmError>;

/// Options de construction / exécution de la VM.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Taille maximale de pile (valeurs). `None` = illimitée.
    pub stack_limit: Option<usize>,
    /// Profondeur maximale d’appels. `None` = illimitée.
    pub call_stack_limit: Option<usize>,
    /// Limite d’instructions (garde-fou anti-boucle infinie). `None` = pas
    /// de limite.
    pub step_limit: Option<u64>,
    /// Trace chaque opcode via `log::trace!`.
    pub trace: bool,
    /// Expose le petit *stdlib* (print, len, type_of…).
    pub stdlib: bool,
    /// Racine de résolution des imports (`-m` du front-end).
    pub modules_root: Option<PathBuf>,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            stack_limit: Some(1 << 20),      // ~1M valeurs
            call_stack_limit: Some(1 << 16), // ~65k frames
            step_limit: None,
            trace: false,
            stdlib: false,
            modules_root: None,
        }
    }
}

impl VmOptions {
    /// Active/désactive le *trace* des opcodes.
    pub fn with_trace(mut self, on: bool) -> Self {
        self.trace = on;
        self
    }
    /// Active/désactive le petit *stdlib*.
    pub fn with_stdlib(mut self, on: bool) -> Self {
        self.stdlib = on;
        self
    }
    /// Définit la limite d’instructions.
    pub fn with_step_limit(mut self, limit: Option<u64>) -> Self {
        self.step_limit = limit;
        self
    }
    /// Définit la limite de pile.
    pub fn with_stack_limit(mut self, limit: Option<usize>) -> Self {
        self.stack_limit = limit;
        self
    }
    /// Définit la limite de frames d’appel.
    pub fn with_call_stack_limit(mut self, limit: Option<usize>) -> Self {
        self.call_stack_limit = limit;
        self
    }
    /// Définit la racine de résolution des imports.
    pub fn with_modules_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.modules_root = Some(root.into());
        self
    }
}

/// Environnement *host* pour I/O.
pub trait Host {
    /// Impression utilisateur (native `print`).
    fn print(&mut self, s: &str);
}

/// Implémentation *host* par défaut (stdout du système).
#[derive(Default)]
pub struct DefaultHost;

impl Host for DefaultHost {
    fn print(&mut self, s: &str) {
        println!("{s}");
    }
}

/// Entrée du registre de valeurs hissées : identité d’origine + copie
/// promue, vivante tant que le host ne la libère pas.
#[derive(Debug, Clone)]
pub struct HoistEntry {
    /// Identité de la valeur d’origine (diagnostics).
    pub source_id: u64,
    /// Copie promue, détenue par le registre.
    pub value: Value,
}

/// Machine virtuelle.
pub struct Vm {
    /// Pile d’appels (frames).
    pub(crate) frames: Vec<Frame>,
    /// Pile d’opérandes et de locales.
    pub(crate) stack: Vec<Value>,
    /// Variables globales (nom → valeur).
    pub(crate) globals: ahash::AHashMap<String, Value>,
    /// Cache d’imports : chemin résolu → objet d’exports.
    pub(crate) imports: ahash::AHashMap<String, Value>,
    /// Registre de valeurs hissées (token → entrée).
    pub(crate) hoisted: ahash::AHashMap<u64, HoistEntry>,
    /// Cellules d’upvalues encore ouvertes sur la pile.
    pub(crate) open_cells: Vec<Gc<ClosureCell>>,
    /// Identités de valeurs dont un hook est en cours (anti-récursion).
    pub(crate) firing_hooks: ahash::AHashSet<u64>,
    pub(crate) options: VmOptions,
    pub(crate) steps: u64,
    next_hoist_token: u64,
    pub(crate) host: Box<dyn Host>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Crée une VM avec des options par défaut.
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    /// Crée une VM avec les options fournies.
    pub fn with_options(options: VmOptions) -> Self {
        let stdlib = options.stdlib;
        let mut vm = Self {
            frames: Vec::with_capacity(64),
            stack: Vec::with_capacity(1024),
            globals: ahash::AHashMap::new(),
            imports: ahash::AHashMap::new(),
            hoisted: ahash::AHashMap::new(),
            open_cells: Vec::new(),
            firing_hooks: ahash::AHashSet::new(),
            options,
            steps: 0,
            next_hoist_token: 0,
            host: Box::<DefaultHost>::default(),
        };
        if stdlib {
            vm.install_stdlib();
        }
        vm
    }

    /// Installe un hôte personnalisé.
    pub fn with_host(mut self, host: Box<dyn Host>) -> Self {
        self.host = host;
        self
    }

    /* --------------------------- Globales & natives --------------------------- */

    /// Déclare une globale.
    pub fn define_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    /// Récupère une globale.
    pub fn get_global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    /// Déclare une fonction native.
    pub fn define_native(&mut self, name: impl Into<String>, f: NativeFn) {
        let name = name.into();
        let v = Value::native(name.clone(), f);
        self.define_global(name, v);
    }

    /// Ajoute les natives de base : `print`, `len`, `type_of`, `str`,
    /// `clock_ms`, `rename`, `hoist`, `unhoist`.
    pub fn install_stdlib(&mut self) {
        self.define_native("print", native_print);
        self.define_native("len", native_len);
        self.define_native("type_of", native_type_of);
        self.define_native("str", native_str);
        self.define_native("clock_ms", native_clock_ms);
        self.define_native("rename", native_rename);
        self.define_native("hoist", native_hoist);
        self.define_native("unhoist", native_unhoist);
    }

    /* ------------------------------ Hissage ------------------------------ */

    /// Copie `value` dans le registre et renvoie un token stable et unique
    /// pour la durée de vie de la VM.
    pub fn hoist(&mut self, value: &Value) -> u64 {
        self.next_hoist_token += 1;
        let token = self.next_hoist_token;
        self.hoisted.insert(token, HoistEntry { source_id: value.id, value: value.clone() });
        token
    }

    /// La valeur hissée sous `token`, si encore enregistrée.
    pub fn hoisted_get(&self, token: u64) -> Option<&Value> {
        self.hoisted.get(&token).map(|e| &e.value)
    }

    /// Détruit la copie hissée. Renvoie la valeur si le token existait.
    pub fn unhoist(&mut self, token: u64) -> Option<Value> {
        self.hoisted.remove(&token).map(|e| e.value)
    }

    /* ------------------------------ Exécution ------------------------------ */

    /// Exécute une fonction de tête (zéro-arité, terminée par `Exit`) et
    /// renvoie le slot de résultat (ou `none`).
    pub fn run_function(&mut self, function: FunctionObj) -> VmResult<Value> {
        if !self.frames.is_empty() {
            return Err(VmError::Reentrancy);
        }
        self.stack.clear();
        self.open_cells.clear();
        self.firing_hooks.clear();
        self.steps = 0;

        let f = gc(function);
        Self::ensure_offsets(&f)?;
        let name = {
            let fr = f.borrow();
            if !fr.name.is_empty() {
                fr.name.clone()
            } else if !fr.import_path.is_empty() {
                fr.import_path.clone()
            } else {
                "<main>".to_string()
            }
        };
        self.frames.push(Frame::new(Rc::clone(&f), 0, name));

        let flow = match self.execute_until(0) {
            Ok(flow) => flow,
            Err(e) => {
                self.frames.clear();
                self.stack.clear();
                return Err(e);
            }
        };

        let result = match flow {
            Flow::Done | Flow::Exited => self.stack.pop().unwrap_or_else(Value::none),
        };
        self.frames.clear();
        self.stack.clear();
        self.open_cells.clear();
        Ok(result)
    }

    /// Enveloppe un chunk de tête dans une fonction zéro-arité et l’exécute.
    pub fn run_chunk(&mut self, chunk: Chunk) -> VmResult<Value> {
        let import_path = chunk.import_path.clone();
        self.run_function(FunctionObj { chunk, import_path, ..FunctionObj::default() })
    }

    /// Entrée host : appelle un callable précédemment obtenu, via une frame
    /// éphémère exécutée jusqu’à complétion.
    pub fn call_value(&mut self, callee: Value, args: Vec<Value>) -> VmResult<Value> {
        if !self.frames.is_empty() {
            return Err(VmError::Reentrancy);
        }
        self.stack.clear();
        let result = self.call_value_nested(callee, args);
        self.stack.clear();
        self.frames.clear();
        match result {
            Ok(v) => Ok(v),
            Err(OpError::Fatal(e)) => Err(e),
            Err(OpError::Raise(e)) => Err(VmError::Uncaught(UncaughtError {
                error: e,
                line: 0,
                file: String::new(),
                trace: vec!["<host call>".into()],
            })),
        }
    }
}

/* ------------------------------- Stdlib ------------------------------- */

fn native_print(vm: &mut Vm, args: Vec<Value>) -> Result<Value, ErrorObj> {
    let mut text = String::new();
    for (i, v) in args.iter().enumerate() {
        if i > 0 {
            text.push(' ');
        }
        text.push_str(&v.to_string());
    }
    vm.host.print(&text);
    Ok(vnone())
}

fn native_len(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, ErrorObj> {
    if args.len() != 1 {
        return Err(ErrorObj::arity_error("'len' attend 1 argument"));
    }
    eval::value_len(&args[0]).map(Value::number)
}

fn native_type_of(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, ErrorObj> {
    if args.len() != 1 {
        return Err(ErrorObj::arity_error("'type_of' attend 1 argument"));
    }
    Ok(vstr(args[0].type_name()))
}

fn native_str(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, ErrorObj> {
    if args.len() != 1 {
        return Err(ErrorObj::arity_error("'str' attend 1 argument"));
    }
    Ok(vstr(args[0].to_string()))
}

fn native_clock_ms(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, ErrorObj> {
    let ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    Ok(Value::number(ms as f64))
}

/// Copie une fonction sous un nouveau nom (utilitaire functools).
fn native_rename(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, ErrorObj> {
    if args.len() != 2 {
        return Err(ErrorObj::arity_error("'rename' attend 2 argument(s)"));
    }
    let f = args[0].as_function()?;
    let name = args[1].as_str()?;
    let mut renamed = f.borrow().clone();
    renamed.name = name.to_string();
    Ok(Value::function(renamed))
}

fn native_hoist(vm: &mut Vm, args: Vec<Value>) -> Result<Value, ErrorObj> {
    if args.len() != 1 {
        return Err(ErrorObj::arity_error("'hoist' attend 1 argument"));
    }
    let token = vm.hoist(&args[0]);
    Ok(Value::number(token as f64))
}

fn native_unhoist(vm: &mut Vm, args: Vec<Value>) -> Result<Value, ErrorObj> {
    if args.len() != 1 {
        return Err(ErrorObj::arity_error("'unhoist' attend 1 argument"));
    }
    let token = args[0].as_number()? as u64;
    Ok(vbool(vm.unhoist(token).is_some()))
}

/* ------------------------------- Tests ------------------------------- */
