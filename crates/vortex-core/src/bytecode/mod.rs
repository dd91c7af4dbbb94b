//! bytecode — Conteneur `Chunk`, pool de constantes, opcodes `Op`,
//! format disque `.vxc` et désassembleur.

pub mod chunk;
pub mod disasm;
pub mod format;
pub mod ops;

pub use chunk::{CaptureDesc, Chunk, ChunkError, ConstPool, Constant, FunctionTemplate};
pub use format::{chunk_from_bytes, chunk_to_bytes, read_chunk_file, write_chunk_file, FormatError};
pub use ops::Op;
