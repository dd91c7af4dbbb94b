//! vortex-core — Cœur bytecode du langage Vortex
//!
//! Contient tout ce qu’il faut pour manipuler le bytecode Vortex, sans
//! dépendre de l’émetteur ni de la VM.
//!
//! ## Modules
//! - `bytecode::ops`    : jeu d’instructions `Op` (numérotation du fil).
//! - `bytecode::chunk`  : `Chunk` (code + lignes + constantes + noms),
//!   gabarits de fonctions `FunctionTemplate`, pool `ConstPool`.
//! - `bytecode::format` : conteneur disque `.vxc` (magic + version + hash).
//! - `bytecode::disasm` : désassembleur lisible (humain).
//!
//! L’émetteur (lexer/parser/générateur) est un collaborateur externe : il
//! produit des `Chunk`s ; la VM (`vortex-vm`) les exécute.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod bytecode;

// ---------- Reexports de confort ----------
pub use bytecode::{
    chunk::{CaptureDesc, Chunk, ChunkError, ConstPool, Constant, FunctionTemplate},
    ops::Op,
};

// ---------- Version ----------
/// Version du crate (lisible, via Cargo).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Renvoie une bannière de version (utile pour logs/outils).
pub fn version() -> String {
    format!("vortex-core {VERSION}")
}

// ---------- Prelude ----------
pub mod prelude {
    pub use crate::bytecode::{
        chunk::{CaptureDesc, Chunk, ChunkError, ConstPool, Constant, FunctionTemplate},
        disasm::disassemble,
        format::{chunk_from_bytes, chunk_to_bytes, read_chunk_file, write_chunk_file, FormatError},
        ops::Op,
    };
    pub use crate::version;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_banner() {
        assert!(version().starts_with("vortex-core "));
    }
}
