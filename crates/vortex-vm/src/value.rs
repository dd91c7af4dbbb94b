//! value.rs — Modèle de valeurs dynamiques de la VM Vortex.
//!
//! Une [`Value`] porte :
//! - son **payload** typé ([`ValueKind`]) ;
//! - une **identité** monotone attribuée à la construction (les clones de
//!   handle partagent l’identité — elle sert de garde anti-récursion pour
//!   les hooks) ;
//! - des **meta-flags** ([`Meta`]) : `unpack`, `packer`, `is_const`,
//!   `temp_non_const` ;
//! - des **hooks** optionnels ([`Hooks`]) : observateurs `on_change` /
//!   `on_access`.
//!
//! Règle de partage : les scalaires (Number, Str, Bool, None) se copient par
//! valeur ; les composites (List, Type, Object, Function, Native, Pointer,
//! Error) se copient par handle (`Gc<T>` = `Rc<RefCell<T>>`).

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use vortex_core::bytecode::{CaptureDesc, Chunk, Constant, FunctionTemplate};

use crate::error::{ErrorKind, ErrorObj};
use crate::Vm;

/// Petit alias de GC coopératif basé sur `Rc<RefCell<T>>`.
pub type Gc<T> = Rc<RefCell<T>>;

/// Construit un handle partagé.
pub fn gc<T>(value: T) -> Gc<T> {
    Rc::new(RefCell::new(value))
}

/// Fonction native (host) : reçoit la VM et un vecteur d’arguments.
/// Une native signale l’échec en renvoyant `Err(ErrorObj)` (ou une
/// `Value` d’erreur) ; la VM déclenche alors le déroulage try/catch.
pub type NativeFn = fn(&mut Vm, Vec<Value>) -> Result<Value, ErrorObj>;

static VALUE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_value_id() -> u64 {
    VALUE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// Meta-flags portés par chaque valeur.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Meta {
    /// À étaler comme positionnels au prochain appel.
    pub unpack: bool,
    /// Ce paramètre absorbe les positionnels excédentaires dans une List.
    pub packer: bool,
    /// Mutation interdite.
    pub is_const: bool,
    /// Permission de mutation à usage unique (consommée à la prochaine
    /// écriture).
    pub temp_non_const: bool,
}

/// Observateur installé sur une variable.
#[derive(Debug, Clone)]
pub struct Hook {
    pub callable: Value,
    /// Nom symbolique (celui du callable, pour les diagnostics).
    pub name: String,
}

/// Hooks optionnels d’une valeur.
#[derive(Debug, Clone, Default)]
pub struct Hooks {
    pub on_change: Option<Box<Hook>>,
    pub on_access: Option<Box<Hook>>,
}

/// Valeur dynamique de la VM.
#[derive(Debug, Clone)]
pub struct Value {
    pub kind: ValueKind,
    pub id: u64,
    pub meta: Meta,
    pub hooks: Hooks,
}

/// Payload typé d’une valeur.
#[derive(Clone)]
pub enum ValueKind {
    Number(f64),
    Str(String),
    Bool(bool),
    List(Gc<Vec<Value>>),
    Type(Gc<TypeObj>),
    Object(Gc<ObjectObj>),
    Function(Gc<FunctionObj>),
    Native(Gc<NativeObj>),
    /// Échappatoire host : payload opaque partagé.
    Pointer(Rc<dyn Any>),
    /// Variante dédiée aux erreurs (détectable sans inspection de champs).
    Error(Gc<ErrorObj>),
    None,
}

/// Schéma de classe : nom + champs ordonnés + valeurs par défaut.
#[derive(Debug, Clone, Default)]
pub struct TypeObj {
    pub name: String,
    pub fields: Vec<String>,
    pub defaults: ahash::AHashMap<String, Value>,
}

/// Instance d’un [`TypeObj`] (ou objet anonyme). Les clés gardent l’ordre
/// d’insertion.
#[derive(Debug, Clone, Default)]
pub struct ObjectObj {
    pub type_of: Option<Gc<TypeObj>>,
    pub keys: Vec<String>,
    pub values: ahash::AHashMap<String, Value>,
}

impl ObjectObj {
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if !self.values.contains_key(&key) {
            self.keys.push(key.clone());
        }
        self.values.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Fonction native nommée.
pub struct NativeObj {
    pub name: String,
    pub function: NativeFn,
}

impl fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeObj({})", self.name)
    }
}

/// Cellule d’upvalue. Tant que la frame déclarante vit, la cellule pointe
/// son slot de pile (`Open`) ; au démontage de la frame, la valeur est
/// promue dans la cellule (`Closed`). Toutes les closures capturant le même
/// slot partagent la même cellule.
#[derive(Debug, Clone)]
pub struct ClosureCell {
    pub name: String,
    pub frame_name: String,
    pub is_local: bool,
    pub index: u32,
    pub state: CellState,
}

/// État d’une cellule d’upvalue.
#[derive(Debug, Clone)]
pub enum CellState {
    /// Slot absolu dans la pile de la VM.
    Open { slot: usize },
    /// Copie promue après démontage de la frame déclarante.
    Closed(Value),
}

/// État gelé d’un générateur suspendu par `Yield`.
#[derive(Debug, Clone)]
pub struct GeneratorState {
    pub ip: usize,
    pub instr_index: usize,
    /// Fenêtre de pile de la frame (locales + temporaires).
    pub window: Vec<Value>,
    /// Noms des locales, alignés sur le bas de la fenêtre.
    pub locals: Vec<String>,
}

/// Fonction compilée instanciée (gabarit + captures résolues + état
/// générateur + receveur lié).
#[derive(Debug, Clone, Default)]
pub struct FunctionObj {
    pub name: String,
    pub arity: u8,
    pub defaults: u8,
    pub params: Vec<String>,
    pub default_values: Vec<Value>,
    pub chunk: Chunk,
    /// Descripteurs de capture (résolus par `MakeClosure`).
    pub captures: Vec<CaptureDesc>,
    /// Cellules matérialisées, alignées sur `captures`.
    pub cells: Vec<Gc<ClosureCell>>,
    pub packer: bool,
    pub is_generator: bool,
    pub generator_init: bool,
    pub generator_done: bool,
    pub gen_state: Option<GeneratorState>,
    /// Receveur lié (méthode) ; `None` pour une fonction libre.
    pub receiver: Option<Box<Value>>,
    pub import_path: String,
}

impl FunctionObj {
    /// Instancie un gabarit du pool de constantes (sans résoudre les
    /// captures : c’est le rôle de `MakeClosure`).
    pub fn from_template(tpl: &FunctionTemplate) -> Self {
        Self {
            name: tpl.name.clone(),
            arity: tpl.arity,
            defaults: tpl.defaults,
            params: tpl.params.clone(),
            default_values: tpl.default_values.iter().map(Value::from_constant).collect(),
            chunk: tpl.chunk.clone(),
            captures: tpl.captures.clone(),
            cells: Vec::new(),
            packer: tpl.packer,
            is_generator: tpl.is_generator,
            generator_init: false,
            generator_done: false,
            gen_state: None,
            receiver: None,
            import_path: tpl.import_path.clone(),
        }
    }
}

/* --------------------------- Constructeurs --------------------------- */

impl Value {
    fn with_kind(kind: ValueKind) -> Self {
        Self { kind, id: next_value_id(), meta: Meta::default(), hooks: Hooks::default() }
    }

    pub fn number(x: f64) -> Self {
        Self::with_kind(ValueKind::Number(x))
    }

    pub fn str(s: impl Into<String>) -> Self {
        Self::with_kind(ValueKind::Str(s.into()))
    }

    pub fn bool(b: bool) -> Self {
        Self::with_kind(ValueKind::Bool(b))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Self::with_kind(ValueKind::List(gc(items)))
    }

    pub fn type_obj(t: TypeObj) -> Self {
        Self::with_kind(ValueKind::Type(gc(t)))
    }

    pub fn object(o: ObjectObj) -> Self {
        Self::with_kind(ValueKind::Object(gc(o)))
    }

    pub fn function(f: FunctionObj) -> Self {
        Self::with_kind(ValueKind::Function(gc(f)))
    }

    pub fn native(name: impl Into<String>, function: NativeFn) -> Self {
        Self::with_kind(ValueKind::Native(gc(NativeObj { name: name.into(), function })))
    }

    pub fn pointer(payload: Rc<dyn Any>) -> Self {
        Self::with_kind(ValueKind::Pointer(payload))
    }

    pub fn error(e: ErrorObj) -> Self {
        Self::with_kind(ValueKind::Error(gc(e)))
    }

    pub fn none() -> Self {
        Self::with_kind(ValueKind::None)
    }

    /// Convertit une constante du pool en valeur runtime.
    pub fn from_constant(c: &Constant) -> Self {
        match c {
            Constant::None => Self::none(),
            Constant::Bool(b) => Self::bool(*b),
            Constant::Number(x) => Self::number(*x),
            Constant::Str(s) => Self::str(s.clone()),
            Constant::Function(tpl) => Self::function(FunctionObj::from_template(tpl)),
        }
    }
}

/// Raccourcis façon “batteries incluses”.
pub fn vnum(x: f64) -> Value {
    Value::number(x)
}
pub fn vstr(s: impl Into<String>) -> Value {
    Value::str(s)
}
pub fn vbool(b: bool) -> Value {
    Value::bool(b)
}
pub fn vlist(items: Vec<Value>) -> Value {
    Value::list(items)
}
pub fn vnone() -> Value {
    Value::none()
}
pub fn verr(kind: ErrorKind, message: impl Into<String>) -> Value {
    Value::error(ErrorObj::new(kind, message))
}

/* ----------------------------- Inspection ----------------------------- */

impl Value {
    /// Nom du type, pour messages d’erreur et `type_of`.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            ValueKind::Number(_) => "Number",
            ValueKind::Str(_) => "String",
            ValueKind::Bool(_) => "Boolean",
            ValueKind::List(_) => "List",
            ValueKind::Type(_) => "Type",
            ValueKind::Object(_) => "Object",
            ValueKind::Function(_) => "Function",
            ValueKind::Native(_) => "Native",
            ValueKind::Pointer(_) => "Pointer",
            ValueKind::Error(_) => "Error",
            ValueKind::None => "None",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, ValueKind::Error(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, ValueKind::None)
    }

    /// Truthiness : `None`, `false`, `0` et `""` sont falsy.
    pub fn truthy(&self) -> bool {
        match &self.kind {
            ValueKind::None => false,
            ValueKind::Bool(b) => *b,
            ValueKind::Number(x) => *x != 0.0,
            ValueKind::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Attend un nombre, sinon TypeError.
    pub fn as_number(&self) -> Result<f64, ErrorObj> {
        match &self.kind {
            ValueKind::Number(x) => Ok(*x),
            _ => Err(ErrorObj::type_error(format!("Number attendu, trouvé {}", self.type_name()))),
        }
    }

    /// Attend une chaîne, sinon TypeError.
    pub fn as_str(&self) -> Result<&str, ErrorObj> {
        match &self.kind {
            ValueKind::Str(s) => Ok(s),
            _ => Err(ErrorObj::type_error(format!("String attendue, trouvé {}", self.type_name()))),
        }
    }

    /// Attend une liste, sinon TypeError.
    pub fn as_list(&self) -> Result<Gc<Vec<Value>>, ErrorObj> {
        match &self.kind {
            ValueKind::List(l) => Ok(Rc::clone(l)),
            _ => Err(ErrorObj::type_error(format!("List attendue, trouvé {}", self.type_name()))),
        }
    }

    /// Attend une fonction, sinon TypeError.
    pub fn as_function(&self) -> Result<Gc<FunctionObj>, ErrorObj> {
        match &self.kind {
            ValueKind::Function(f) => Ok(Rc::clone(f)),
            _ => Err(ErrorObj::type_error(format!("Function attendue, trouvé {}", self.type_name()))),
        }
    }

    /// Attend un objet, sinon TypeError.
    pub fn as_object(&self) -> Result<Gc<ObjectObj>, ErrorObj> {
        match &self.kind {
            ValueKind::Object(o) => Ok(Rc::clone(o)),
            _ => Err(ErrorObj::type_error(format!("Object attendu, trouvé {}", self.type_name()))),
        }
    }
}

/* ------------------------------ Égalité ------------------------------ */

/// Égalité structurelle pour scalaires, listes et objets ; identité de
/// handle pour fonctions, natives et pointeurs.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (&a.kind, &b.kind) {
        (ValueKind::None, ValueKind::None) => true,
        (ValueKind::Bool(x), ValueKind::Bool(y)) => x == y,
        (ValueKind::Number(x), ValueKind::Number(y)) => x == y,
        (ValueKind::Str(x), ValueKind::Str(y)) => x == y,
        (ValueKind::List(x), ValueKind::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_equal(a, b))
        }
        (ValueKind::Object(x), ValueKind::Object(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.keys == y.keys
                && x.keys.iter().all(|k| match (x.values.get(k), y.values.get(k)) {
                    (Some(a), Some(b)) => values_equal(a, b),
                    _ => false,
                })
        }
        (ValueKind::Type(x), ValueKind::Type(y)) => Rc::ptr_eq(x, y),
        (ValueKind::Function(x), ValueKind::Function(y)) => Rc::ptr_eq(x, y),
        (ValueKind::Native(x), ValueKind::Native(y)) => Rc::ptr_eq(x, y),
        (ValueKind::Pointer(x), ValueKind::Pointer(y)) => Rc::ptr_eq(x, y),
        (ValueKind::Error(x), ValueKind::Error(y)) => {
            Rc::ptr_eq(x, y) || *x.borrow() == *y.borrow()
        }
        _ => false,
    }
}

/* ----------------------------- Affichage ----------------------------- */

impl fmt::Debug for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Number(x) => write!(f, "Number({x})"),
            ValueKind::Str(s) => write!(f, "Str({s:?})"),
            ValueKind::Bool(b) => write!(f, "Bool({b})"),
            ValueKind::List(l) => write!(f, "List(len={})", l.borrow().len()),
            ValueKind::Type(t) => write!(f, "Type({})", t.borrow().name),
            ValueKind::Object(o) => write!(f, "Object(len={})", o.borrow().len()),
            ValueKind::Function(func) => {
                let func = func.borrow();
                write!(f, "Function({}/{})", func.name, func.arity)
            }
            ValueKind::Native(n) => write!(f, "Native({})", n.borrow().name),
            ValueKind::Pointer(_) => write!(f, "Pointer(<opaque>)"),
            ValueKind::Error(e) => write!(f, "Error({})", e.borrow()),
            ValueKind::None => write!(f, "None"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ValueKind::Number(x) => write!(f, "{x}"),
            ValueKind::Str(s) => write!(f, "{s}"),
            ValueKind::Bool(b) => write!(f, "{b}"),
            ValueKind::None => write!(f, "none"),
            ValueKind::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            ValueKind::Object(o) => {
                let o = o.borrow();
                write!(f, "{{")?;
                for (i, k) in o.keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match o.values.get(k) {
                        Some(v) => write!(f, "{k}: {v}")?,
                        None => write!(f, "{k}: <?>")?,
                    }
                }
                write!(f, "}}")
            }
            ValueKind::Type(t) => write!(f, "<type {}>", t.borrow().name),
            ValueKind::Function(func) => {
                let func = func.borrow();
                if func.name.is_empty() {
                    write!(f, "<fn anonymous/{}>", func.arity)
                } else {
                    write!(f, "<fn {}/{}>", func.name, func.arity)
                }
            }
            ValueKind::Native(n) => write!(f, "<native {}>", n.borrow().name),
            ValueKind::Pointer(_) => write!(f, "<pointer>"),
            ValueKind::Error(e) => write!(f, "{}", e.borrow()),
        }
    }
}

/* ------------------------------- Tests ------------------------------- */
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_monotonic_and_survives_clone() {
        let a = vnum(1.0);
        let b = vnum(1.0);
        assert!(b.id > a.id);
        let c = a.clone();
        assert_eq!(a.id, c.id);
    }

    #[test]
    fn scalars_copy_composites_share() {
        let l = vlist(vec![vnum(1.0)]);
        let l2 = l.clone();
        if let ValueKind::List(items) = &l.kind {
            items.borrow_mut().push(vnum(2.0));
        }
        if let ValueKind::List(items) = &l2.kind {
            assert_eq!(items.borrow().len(), 2, "le clone partage le handle");
        }
    }

    #[test]
    fn truthiness() {
        assert!(!vnone().truthy());
        assert!(!vbool(false).truthy());
        assert!(!vnum(0.0).truthy());
        assert!(!vstr("").truthy());
        assert!(vnum(3.0).truthy());
        assert!(vstr("x").truthy());
        assert!(vlist(vec![]).truthy());
    }

    #[test]
    fn structural_equality() {
        assert!(values_equal(&vnum(2.0), &vnum(2.0)));
        assert!(!values_equal(&vnum(2.0), &vstr("2")));
        let a = vlist(vec![vnum(1.0), vstr("x")]);
        let b = vlist(vec![vnum(1.0), vstr("x")]);
        assert!(values_equal(&a, &b));

        let mut o1 = ObjectObj::default();
        o1.insert("k", vnum(1.0));
        let mut o2 = ObjectObj::default();
        o2.insert("k", vnum(1.0));
        assert!(values_equal(&Value::object(o1), &Value::object(o2)));
    }

    #[test]
    fn object_keys_keep_insertion_order() {
        let mut o = ObjectObj::default();
        o.insert("b", vnum(1.0));
        o.insert("a", vnum(2.0));
        o.insert("b", vnum(3.0)); // remplace sans dupliquer la clé
        assert_eq!(o.keys, vec!["b".to_string(), "a".to_string()]);
        assert!(values_equal(o.get("b").expect("clé b"), &vnum(3.0)));
    }

    #[test]
    fn display_forms() {
        assert_eq!(vnum(7.0).to_string(), "7");
        assert_eq!(vstr("hi").to_string(), "hi");
        assert_eq!(vnone().to_string(), "none");
        assert_eq!(vlist(vec![vnum(1.0), vnum(2.0)]).to_string(), "[1, 2]");
    }
}
