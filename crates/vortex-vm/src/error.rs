//! error.rs — Deux canaux d’erreurs pour la VM Vortex.
//!
//! - [`ErrorObj`] : erreurs **du langage**, valeurs de première classe.
//!   Elles déroulent la pile jusqu’à un handler try/catch ; non rattrapées,
//!   elles remontent en [`VmError::Uncaught`] avec fichier/ligne et la pile
//!   de noms de frames.
//! - [`VmError`] : fautes **machine** (pile pleine, chunk malformé, limite
//!   d’instructions…). Jamais rattrapables par le programme.

use std::fmt;

use vortex_core::bytecode::ChunkError;

/// Taxonomie des erreurs du langage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Opérande du mauvais type.
    Type,
    /// Mauvais nombre d’arguments.
    Arity,
    /// Index hors bornes.
    Index,
    /// Clé absente d’un objet.
    Key,
    /// Nom non lié.
    Name,
    /// Résolution ou chargement d’import impossible.
    Import,
    /// Division par zéro, erreur de domaine.
    Arithmetic,
    /// Écriture sur une valeur const.
    Const,
    /// Mauvaise reprise d’un générateur.
    Generator,
}

impl ErrorKind {
    /// Nom exposé au langage (champ `kind` des valeurs d’erreur).
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Type => "TypeError",
            ErrorKind::Arity => "ArityError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Key => "KeyError",
            ErrorKind::Name => "NameError",
            ErrorKind::Import => "ImportError",
            ErrorKind::Arithmetic => "ArithmeticError",
            ErrorKind::Const => "ConstError",
            ErrorKind::Generator => "GeneratorError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Erreur du langage : une valeur de première classe avec un message.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorObj {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorObj {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn arity_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Arity, message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Index, message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Key, message)
    }

    pub fn name_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Name, message)
    }

    pub fn import_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Import, message)
    }

    pub fn arithmetic_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Arithmetic, message)
    }

    pub fn const_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Const, message)
    }

    pub fn generator_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generator, message)
    }
}

impl fmt::Display for ErrorObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorObj {}

/// Erreur du langage non rattrapée, avec contexte source.
#[derive(Debug, Clone)]
pub struct UncaughtError {
    pub error: ErrorObj,
    /// Ligne source de l’instruction fautive (0 si inconnue).
    pub line: u32,
    /// Fichier d’origine du chunk fautif (chemin d’import).
    pub file: String,
    /// Pile de noms de frames, de la plus profonde à la plus haute.
    pub trace: Vec<String>,
}

impl fmt::Display for UncaughtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            write!(f, "{} (ligne {})", self.error, self.line)?;
        } else {
            write!(f, "{} ({}:{})", self.error, self.file, self.line)?;
        }
        for frame in &self.trace {
            write!(f, "\n  dans {frame}")?;
        }
        Ok(())
    }
}

/// Erreurs machine de la VM.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Empilement trop profond.
    #[error("stack overflow")]
    StackOverflow,
    /// Dépiler sous la base de la frame courante.
    #[error("stack underflow")]
    StackUnderflow,
    /// Trop de frames d’appel.
    #[error("call stack overflow")]
    CallStackOverflow,
    /// Garde-fou anti-boucle infinie.
    #[error("limite d'instructions atteinte ({0})")]
    StepLimit(u64),
    /// Flux de code illisible.
    #[error("chunk malformé: {0}")]
    MalformedChunk(#[from] ChunkError),
    /// Cible de saut hors de la table des instructions.
    #[error("saut hors table: instruction {target}")]
    BadJump { target: i64 },
    /// La VM tourne déjà sur ce thread.
    #[error("réentrance interdite: la VM est déjà en cours d'exécution")]
    Reentrancy,
    /// Erreur du langage non rattrapée (avec traceback).
    #[error("{0}")]
    Uncaught(UncaughtError),
}

impl VmError {
    /// L’`ErrorObj` sous-jacent, si l’échec vient du langage.
    pub fn uncaught(&self) -> Option<&ErrorObj> {
        match self {
            VmError::Uncaught(u) => Some(&u.error),
            _ => None,
        }
    }
}

/* ------------------------------- Tests ------------------------------- */
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names() {
        assert_eq!(ErrorKind::Type.name(), "TypeError");
        assert_eq!(ErrorKind::Arithmetic.name(), "ArithmeticError");
        assert_eq!(ErrorObj::index_error("0 hors bornes").to_string(), "IndexError: 0 hors bornes");
    }

    #[test]
    fn uncaught_renders_trace() {
        let u = UncaughtError {
            error: ErrorObj::name_error("x non lié"),
            line: 3,
            file: "main.vtx".into(),
            trace: vec!["inner".into(), "main.vtx".into()],
        };
        let s = u.to_string();
        assert!(s.contains("NameError"));
        assert!(s.contains("main.vtx:3"));
        assert!(s.contains("dans inner"));
    }
}
