//! chunk.rs — Représentation binaire d’un “chunk” de bytecode pour Vortex.
//!
//! - Flux de code `Vec<u8>` : opcodes 1 octet + opérandes big-endian
//! - Table de lignes parallèle **aux octets** (pas aux instructions)
//! - Pool de constantes (nombres, chaînes, bool, none, gabarits de fonction)
//!   avec dé-dupe basique des chaînes
//! - Tables de noms : variables locales déclarées + variables publiques
//!   (exports d’import)
//! - `instruction_offsets` : offsets de début de chaque instruction,
//!   recalculables à tout moment (la VM fait autorité et recalcule si vide)
//!
//! Dépendances attendues par le crate :
//!   serde = { version = "1", features = ["derive"] }
//!   bincode = "1"

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bytecode::ops::Op;

/// Erreurs de décodage / validation d’un chunk.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// Octet qui n’est pas un opcode connu.
    #[error("opcode inconnu 0x{byte:02x} à l'offset {offset}")]
    BadOpcode { byte: u8, offset: usize },
    /// Opérande coupé par la fin du flux.
    #[error("opérande tronqué pour {op} à l'offset {offset}")]
    TruncatedOperand { op: Op, offset: usize },
    /// Index de constante hors du pool.
    #[error("index de constante invalide {index} (pool: {len})")]
    BadConstIndex { index: u32, len: usize },
}

/// Constantes embarquées dans un chunk. Chaque entrée est un Number, une
/// Str, un Bool, None, ou un gabarit de fonction complet (avec son propre
/// chunk imbriqué).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,
    Bool(bool),
    Number(f64),
    Str(String),
    Function(FunctionTemplate),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::None => f.write_str("none"),
            Constant::Bool(b) => write!(f, "{b}"),
            Constant::Number(x) => {
                if x.is_nan() {
                    f.write_str("NaN")
                } else if x.is_infinite() {
                    f.write_str(if x.is_sign_positive() { "+Inf" } else { "-Inf" })
                } else {
                    write!(f, "{x}")
                }
            }
            Constant::Str(s) => {
                f.write_str("\"")?;
                for ch in s.chars() {
                    match ch {
                        '\\' => f.write_str("\\\\")?,
                        '"' => f.write_str("\\\"")?,
                        '\n' => f.write_str("\\n")?,
                        '\r' => f.write_str("\\r")?,
                        '\t' => f.write_str("\\t")?,
                        c if c.is_control() => write!(f, "\\u{{{:x}}}", c as u32)?,
                        c => write!(f, "{c}")?,
                    }
                }
                f.write_str("\"")
            }
            Constant::Function(t) => write!(f, "<fn {}/{}>", t.name, t.arity),
        }
    }
}

/// Descripteur de capture d’upvalue (résolu par `MakeClosure`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureDesc {
    /// Nom de la variable capturée (diagnostics).
    pub name: String,
    /// `is_local = true` : slot local de la frame déclarante ;
    /// sinon : index de cellule de la fonction englobante.
    pub index: u32,
    pub is_local: bool,
}

/// Gabarit de fonction compilée, tel que stocké dans le pool de constantes.
/// `MakeFunction` / `MakeClosure` l’instancient en objet fonction runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FunctionTemplate {
    pub name: String,
    /// Nombre de paramètres déclarés.
    pub arity: u8,
    /// Nombre de paramètres de queue avec valeur par défaut.
    pub defaults: u8,
    /// Noms des paramètres, dans l’ordre.
    pub params: Vec<String>,
    /// Valeurs par défaut, alignées sur les `defaults` derniers paramètres.
    pub default_values: Vec<Constant>,
    /// Captures à résoudre depuis la frame englobante.
    pub captures: Vec<CaptureDesc>,
    /// Le dernier paramètre formel absorbe les positionnels excédentaires.
    pub packer: bool,
    pub is_generator: bool,
    /// Corps compilé.
    pub chunk: Chunk,
    /// Chemin d’origine (résolution d’imports relatifs).
    pub import_path: String,
}

/// Pool de constantes avec dé-dupe des chaînes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstPool {
    values: Vec<Constant>,
    #[serde(skip)]
    str_index: ahash::AHashMap<String, u32>,
}

impl PartialEq for ConstPool {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl ConstPool {
    pub fn new() -> Self {
        Self { values: Vec::new(), str_index: ahash::AHashMap::new() }
    }

    pub fn add(&mut self, v: Constant) -> u32 {
        if let Constant::Str(s) = &v {
            if let Some(&idx) = self.str_index.get(s) {
                return idx;
            }
            let key = s.clone();
            let idx = self.push_raw(v);
            self.str_index.insert(key, idx);
            return idx;
        }
        self.push_raw(v)
    }

    fn push_raw(&mut self, v: Constant) -> u32 {
        let idx = self.values.len() as u32;
        self.values.push(v);
        idx
    }

    pub fn get(&self, idx: u32) -> Option<&Constant> {
        self.values.get(idx as usize)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Constant)> {
        self.values.iter().enumerate().map(|(i, v)| (i as u32, v))
    }

    /// Reconstruit l’index de dé-dupe (après désérialisation).
    pub(crate) fn rebuild_string_index(&mut self) {
        self.str_index.clear();
        for (i, v) in self.values.iter().enumerate() {
            if let Constant::Str(s) = v {
                self.str_index.entry(s.clone()).or_insert(i as u32);
            }
        }
    }
}

/// Le chunk complet : code + lignes + constantes + métadonnées.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chunk {
    /// Flux d’opcodes et d’opérandes.
    pub code: Vec<u8>,
    /// Ligne source de chaque octet de `code` (même longueur).
    pub lines: Vec<u32>,
    pub constants: ConstPool,
    /// Noms de variables déclarées dans la portée de ce chunk.
    pub variables: Vec<String>,
    /// Sous-ensemble de `variables` exposé à l’import.
    pub public_variables: Vec<String>,
    /// Chemin d’origine (résolution d’imports relatifs).
    pub import_path: String,
    /// Offsets de début d’instruction ; recalculé à la demande.
    #[serde(skip)]
    pub instruction_offsets: Vec<usize>,
}

// `instruction_offsets` est un état dérivé : il ne compte pas dans l'égalité.
impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
            && self.lines == other.lines
            && self.constants == other.constants
            && self.variables == other.variables
            && self.public_variables == other.public_variables
            && self.import_path == other.import_path
    }
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_import_path(path: impl Into<String>) -> Self {
        Self { import_path: path.into(), ..Self::default() }
    }

    /* ------------------------- Émission ------------------------- */

    /// Ajoute un octet brut au flux.
    pub fn add_code(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Ajoute un opcode sans opérande.
    pub fn add_op(&mut self, op: Op, line: u32) {
        self.add_code(op.as_byte(), line);
    }

    /// Ajoute un opcode suivi d’un opérande u32 big-endian.
    pub fn add_op_u32(&mut self, op: Op, operand: u32, line: u32) {
        self.add_code(op.as_byte(), line);
        for b in operand.to_be_bytes() {
            self.add_code(b, line);
        }
    }

    /// Ajoute un opcode suivi d’un opérande i32 big-endian (sauts relatifs).
    pub fn add_op_i32(&mut self, op: Op, operand: i32, line: u32) {
        self.add_code(op.as_byte(), line);
        for b in operand.to_be_bytes() {
            self.add_code(b, line);
        }
    }

    /// Ajoute un opcode suivi d’un compteur u8.
    pub fn add_op_u8(&mut self, op: Op, operand: u8, line: u32) {
        self.add_code(op.as_byte(), line);
        self.add_code(operand, line);
    }

    pub fn add_constant(&mut self, v: Constant) -> u32 {
        self.constants.add(v)
    }

    /// Raccourci : pool + `LoadConst`.
    pub fn add_constant_op(&mut self, v: Constant, line: u32) -> u32 {
        let idx = self.add_constant(v);
        self.add_op_u32(Op::LoadConst, idx, line);
        idx
    }

    /// Déclare un nom dans la table de variables, renvoie son index.
    pub fn add_variable(&mut self, name: impl Into<String>) -> u32 {
        let name = name.into();
        if let Some(pos) = self.variables.iter().position(|v| *v == name) {
            return pos as u32;
        }
        self.variables.push(name);
        (self.variables.len() - 1) as u32
    }

    /// Réécrit un opérande u32 patché après coup (sauts avant).
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    /* ------------------------- Lecture ------------------------- */

    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes: [u8; 4] = self.code.get(offset..offset + 4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn read_i32(&self, offset: usize) -> Option<i32> {
        let bytes: [u8; 4] = self.code.get(offset..offset + 4)?.try_into().ok()?;
        Some(i32::from_be_bytes(bytes))
    }

    pub fn constant(&self, idx: u32) -> Result<&Constant, ChunkError> {
        self.constants
            .get(idx)
            .ok_or(ChunkError::BadConstIndex { index: idx, len: self.constants.len() })
    }

    /// Ligne source de l’octet `offset` (0 si inconnue).
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /* --------------------- Offsets d'instructions --------------------- */

    /// Balaye le flux et renvoie l’offset de début de chaque instruction.
    ///
    /// La VM fait autorité : elle appelle ceci à l’entrée de frame quand
    /// l’émetteur a laissé la liste vide.
    pub fn scan_instruction_offsets(&self) -> Result<Vec<usize>, ChunkError> {
        let mut offsets = Vec::new();
        let mut off = 0usize;
        while off < self.code.len() {
            let byte = self.code[off];
            let op = Op::from_byte(byte).ok_or(ChunkError::BadOpcode { byte, offset: off })?;
            offsets.push(off);
            let next = off + 1 + op.operand_width();
            if next > self.code.len() {
                return Err(ChunkError::TruncatedOperand { op, offset: off });
            }
            off = next;
        }
        Ok(offsets)
    }

    /// Recalcule et mémorise `instruction_offsets`.
    pub fn compute_instruction_offsets(&mut self) -> Result<(), ChunkError> {
        self.instruction_offsets = self.scan_instruction_offsets()?;
        Ok(())
    }

    /// Reconstruit les index internes après désérialisation.
    pub fn rebuild_after_load(&mut self) -> Result<(), ChunkError> {
        self.constants.rebuild_string_index();
        self.compute_instruction_offsets()
    }
}

/* ------------------------------- Tests ------------------------------- */
