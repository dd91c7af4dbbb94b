//! ops.rs — Définition des opcodes de la VM Vortex.
//!
//! Design goals :
//! - **Lisible** (bons noms, `Debug`/`Display` propres)
//! - **Stable sur le fil** : chaque variante porte son numéro d’opcode
//!   explicite. Le flux de code est un `Vec<u8>` : 1 octet d’opcode suivi
//!   d’opérandes à largeur variable (voir [`Op::operand_width`]).
//! - **Pratique** : helpers `mnemonic()`, `operand_width()`, `is_jump()`,
//!   `stack_effect()`…
//!
//! ⚠️ Compat : la numérotation est celle attendue par l’émetteur. Si tu
//! ajoutes un opcode, **ajoute-le en bas** avec le numéro suivant, jamais
//! au milieu.

use std::fmt;

/// Largeurs d’opérandes sur le fil.
///
/// - index (constante, table de noms, cellule de closure) : u32 big-endian
/// - saut relatif (compté en instructions, depuis l’instruction suivante) :
///   i32 big-endian
/// - cible absolue (index d’instruction) : u32 big-endian
/// - petit compteur inline (arité d’appel, taille de liste) : u8
pub const OPERAND_IDX: usize = 4;
/// Largeur d’un petit compteur inline (u8).
pub const OPERAND_COUNT: usize = 1;

/// Jeu d’instructions de la VM Vortex.
///
/// **Compat fil : ne pas réordonner. Ajouter les nouvelles variantes en bas.**
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    // ----- Retours & suspension -----
    Return = 0,              // dépile le résultat, détruit la frame
    Yield = 1,               // comme Return mais gèle la frame (générateur)

    // ----- Constantes & littéraux -----
    LoadConst = 2,           // push constants[u32]
    LoadThis = 3,            // push le receveur lié de la fonction courante

    // ----- Arith / logique -----
    Negate = 4,              // unaire (num)
    Add = 5,                 // num+num, str+str, list+list
    Subtract = 6,
    Multiply = 7,
    Divide = 8,              // ArithmeticError si diviseur nul
    Mod = 9,
    Pow = 10,
    And = 11,                // truthiness des deux opérandes -> Bool
    Or = 12,
    Not = 13,
    EqEq = 14,
    NotEq = 15,
    LtEq = 16,
    GtEq = 17,
    Lt = 18,
    Gt = 19,
    Range = 20,              // (a,b) -> liste d'entiers inclusifs

    // ----- Accès -----
    Dot = 21,                // pop objet, push champ constants[u32]

    // ----- Variables -----
    StoreVar = 22,           // déclare variables[u32] avec le sommet de pile
    Load = 23,               // push la locale variables[u32] (hook on_access)
    LoadGlobal = 24,         // globales puis exports importés
    LoadClosure = 25,        // push via la cellule u32 de la fonction courante
    Set = 26,                // rebinde locale puis globale (hook on_change)
    SetForce = 27,           // comme Set, ignore is_const
    SetProperty = 28,        // mutate objet.champ constants[u32]
    SetClosure = 29,         // écrit via la cellule u32

    // ----- Construction -----
    MakeClosure = 30,        // instancie constants[u32] + capture les upvalues
    MakeType = 31,           // u8 paires (nom, défaut) + nom du type
    MakeTyped = 32,          // vérifie valeur: instance du type
    MakeObject = 33,         // u8 paires clé/valeur
    MakeFunction = 34,       // instancie constants[u32] (sans captures)
    MakeConst = 35,          // is_const = true sur le sommet
    MakeNonConst = 36,       // lève is_const (temp_non_const sur une const)
    TypeDefaults = 37,       // fusionne les défauts du type dans l'objet

    // ----- Pile -----
    Pop = 38,
    PopClose = 39,           // ferme les upvalues visant ce slot, puis pop

    // ----- Contrôle -----
    JumpIfFalse = 40,        // i32 relatif (instructions), condition lue
    JumpIfTrue = 41,
    PopJumpIfFalse = 42,     // idem, consomme la condition
    PopJumpIfTrue = 43,
    Jump = 44,
    JumpBack = 45,           // distance positive vers l'arrière
    Exit = 46,               // fin d'exécution du chunk de tête
    Break = 47,              // saut avant + nettoyage sp de la boucle
    Continue = 48,           // saut arrière + nettoyage sp de la boucle

    // ----- Composites & accès indexé -----
    BuildList = 49,          // u8 éléments
    Accessor = 50,           // (conteneur, index) -> élément
    Len = 51,

    // ----- Appels -----
    Call = 52,               // u8 args ; pile = [callee, a0..aN-1]
    CallMethod = 53,         // u8 args ; pile = [callee, recv, a0..aN-1]

    // ----- Modules -----
    Import = 54,             // pop chemin Str, push objet d'exports

    // ----- Utilitaires de pile -----
    Unpack = 55,             // marque le sommet: à étaler au prochain appel
    RemovePush = 56,         // [.., a, b] -> [.., b]
    SwapTos = 57,            // échange les deux sommets

    // ----- Boucles -----
    Loop = 58,               // empile (start, sp) sur la pile de boucles
    LoopEnd = 59,
    Iter = 60,               // avance (collection, index, nom) ou saute u32

    // ----- Hooks -----
    HookOnChange = 61,       // attache le callable dépilé à variables[u32]
    HookClosureOnChange = 62,
    HookOnAccess = 63,
    HookClosureOnAccess = 64,

    // ----- Try / catch -----
    TryBegin = 65,           // handler (catch = u32 absolu, sp courant)
    TryEnd = 66,             // dépile le handler, fall-through
    CatchBegin = 67,         // lie l'erreur dépilée à variables[u32]
}

/// Arité maximale d’un appel (opérande u8).
pub const MAX_ARGC: u8 = u8::MAX;

/// Nombre d’opcodes définis (bornes de validation).
pub const OP_COUNT: u8 = 68;

impl Op {
    /// Décode un octet du flux. `None` si l’octet n’est pas un opcode.
    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte < OP_COUNT {
            // Sûr: l'enum est dense de 0 à OP_COUNT-1 (vérifié par test).
            Some(ALL_OPS[byte as usize])
        } else {
            None
        }
    }

    /// L’octet encodé sur le fil.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Mnémonique court (désassembleur, logs, messages d’erreur).
    pub fn mnemonic(&self) -> &'static str {
        use Op::*;
        match *self {
            Return => "ret",
            Yield => "yield",
            LoadConst => "ldc",
            LoadThis => "ldthis",
            Negate => "neg",
            Add => "add",
            Subtract => "sub",
            Multiply => "mul",
            Divide => "div",
            Mod => "mod",
            Pow => "pow",
            And => "and",
            Or => "or",
            Not => "not",
            EqEq => "eq",
            NotEq => "ne",
            LtEq => "le",
            GtEq => "ge",
            Lt => "lt",
            Gt => "gt",
            Range => "range",
            Dot => "dot",
            StoreVar => "stvar",
            Load => "ld",
            LoadGlobal => "ldg",
            LoadClosure => "ldclo",
            Set => "set",
            SetForce => "setf",
            SetProperty => "setp",
            SetClosure => "setclo",
            MakeClosure => "mkclo",
            MakeType => "mktype",
            MakeTyped => "mktyped",
            MakeObject => "mkobj",
            MakeFunction => "mkfun",
            MakeConst => "mkconst",
            MakeNonConst => "mknonconst",
            TypeDefaults => "tydef",
            Pop => "pop",
            PopClose => "popclose",
            JumpIfFalse => "jz",
            JumpIfTrue => "jnz",
            PopJumpIfFalse => "pjz",
            PopJumpIfTrue => "pjnz",
            Jump => "jmp",
            JumpBack => "jmpb",
            Exit => "exit",
            Break => "break",
            Continue => "continue",
            BuildList => "mklist",
            Accessor => "index",
            Len => "len",
            Call => "call",
            CallMethod => "callm",
            Import => "import",
            Unpack => "unpack",
            RemovePush => "nip",
            SwapTos => "swap",
            Loop => "loop",
            LoopEnd => "loopend",
            Iter => "iter",
            HookOnChange => "hkchg",
            HookClosureOnChange => "hkchgclo",
            HookOnAccess => "hkacc",
            HookClosureOnAccess => "hkaccclo",
            TryBegin => "try",
            TryEnd => "tryend",
            CatchBegin => "catch",
        }
    }

    /// Largeur (en octets) de l’opérande immédiat qui suit l’opcode.
    pub fn operand_width(&self) -> usize {
        use Op::*;
        match *self {
            // index u32 (constantes, table de noms, cellules)
            LoadConst | Dot | StoreVar | Load | LoadGlobal | LoadClosure | Set | SetForce
            | SetProperty | SetClosure | MakeClosure | MakeFunction | CatchBegin
            | HookOnChange | HookClosureOnChange | HookOnAccess | HookClosureOnAccess => OPERAND_IDX,
            // sauts relatifs i32 (en instructions)
            JumpIfFalse | JumpIfTrue | PopJumpIfFalse | PopJumpIfTrue | Jump | JumpBack
            | Break | Continue => OPERAND_IDX,
            // cibles absolues u32
            TryBegin | Iter => OPERAND_IDX,
            // petits compteurs u8
            Call | CallMethod | BuildList | MakeObject | MakeType => OPERAND_COUNT,
            _ => 0,
        }
    }

    /// L’instruction modifie-t-elle le pc (hors avance séquentielle) ?
    pub fn is_jump(&self) -> bool {
        use Op::*;
        matches!(
            *self,
            JumpIfFalse | JumpIfTrue | PopJumpIfFalse | PopJumpIfTrue | Jump | JumpBack
                | Break | Continue
        )
    }

    /// Variation **statique** de la profondeur de pile, si connue.
    ///
    /// `None` quand le delta dépend du runtime (appels, retours, opérandes
    /// comptés, itération…).
    pub fn stack_effect(&self) -> Option<i32> {
        use Op::*;
        match *self {
            LoadConst | LoadThis | Load | LoadGlobal | LoadClosure => Some(1),
            MakeFunction | MakeClosure => Some(1),
            Negate | Not | Dot | Len | MakeConst | MakeNonConst | Unpack => Some(0),
            Add | Subtract | Multiply | Divide | Mod | Pow | And | Or | EqEq | NotEq | Lt
            | LtEq | Gt | GtEq | Range | Accessor => Some(-1),
            Pop | PopClose | PopJumpIfFalse | PopJumpIfTrue | RemovePush
            | HookOnChange | HookClosureOnChange | HookOnAccess | HookClosureOnAccess => Some(-1),
            // CatchBegin lie l'erreur déjà en place comme locale : delta 0.
            SwapTos | Jump | JumpBack | JumpIfFalse | JumpIfTrue | Break | Continue | Loop
            | LoopEnd | TryBegin | TryEnd | StoreVar | CatchBegin | Exit => Some(0),
            Set | SetForce | SetClosure => Some(-1),
            SetProperty => Some(-1),           // (objet, valeur) -> valeur
            Import => Some(0),                 // chemin -> exports
            MakeTyped | TypeDefaults => Some(-1),
            Return | Yield | Call | CallMethod | BuildList | MakeObject | MakeType | Iter => None,
        }
    }
}

/// Table dense opcode -> variante (indexée par l’octet).
const ALL_OPS: [Op; OP_COUNT as usize] = [
    Op::Return, Op::Yield, Op::LoadConst, Op::LoadThis, Op::Negate, Op::Add, Op::Subtract,
    Op::Multiply, Op::Divide, Op::Mod, Op::Pow, Op::And, Op::Or, Op::Not, Op::EqEq, Op::NotEq,
    Op::LtEq, Op::GtEq, Op::Lt, Op::Gt, Op::Range, Op::Dot, Op::StoreVar, Op::Load,
    Op::LoadGlobal, Op::LoadClosure, Op::Set, Op::SetForce, Op::SetProperty, Op::SetClosure,
    Op::MakeClosure, Op::MakeType, Op::MakeTyped, Op::MakeObject, Op::MakeFunction, Op::MakeConst,
    Op::MakeNonConst, Op::TypeDefaults, Op::Pop, Op::PopClose, Op::JumpIfFalse, Op::JumpIfTrue,
    Op::PopJumpIfFalse, Op::PopJumpIfTrue, Op::Jump, Op::JumpBack, Op::Exit, Op::Break,
    Op::Continue, Op::BuildList, Op::Accessor, Op::Len, Op::Call, Op::CallMethod, Op::Import,
    Op::Unpack, Op::RemovePush, Op::SwapTos, Op::Loop, Op::LoopEnd, Op::Iter, Op::HookOnChange,
    Op::HookClosureOnChange, Op::HookOnAccess, Op::HookClosureOnAccess, Op::TryBegin, Op::TryEnd,
    Op::CatchBegin,
];

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/* ------------------------------- Tests ------------------------------- */
