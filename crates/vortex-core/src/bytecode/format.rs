//! format.rs — Conteneur disque `.vxc` pour un chunk Vortex compilé.
//!
//! Cadrage : `[magic "VXBC"][version u16 BE][hash FNV-1a-64 BE][corps bincode]`.
//! Le hash couvre le corps ; un octet corrompu fait échouer le chargement.
//!
//! - `chunk_to_bytes` / `chunk_from_bytes` : (dé)cadrage mémoire
//! - `write_chunk_file` / `read_chunk_file` : helpers fichiers
//!
//! Incrémente `FORMAT_VERSION` si la structure sérialisée change.

use std::path::Path;

use bincode::Options as _;

use crate::bytecode::chunk::{Chunk, ChunkError};

/// Magic file header.
pub const FORMAT_MAGIC: [u8; 4] = *b"VXBC";

/// Version du format de conteneur.
pub const FORMAT_VERSION: u16 = 1;

/// Taille du cadre avant le corps bincode.
const HEADER_LEN: usize = 4 + 2 + 8;

/// Erreurs de chargement / écriture d’un `.vxc`.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("fichier trop court ({0} octets)")]
    TooShort(usize),
    #[error("mauvais magic: {0:?}")]
    BadMagic([u8; 4]),
    #[error("mauvaise version: attendu {expected}, trouvé {found}")]
    BadVersion { expected: u16, found: u16 },
    #[error("hash invalide: attendu 0x{expected:016x}, trouvé 0x{found:016x}")]
    BadHash { expected: u64, found: u64 },
    #[error("chunk invalide: {0}")]
    Chunk(#[from] ChunkError),
}

fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new().with_fixint_encoding().with_little_endian()
}

/// Sérialise un chunk dans le cadre `.vxc`.
pub fn chunk_to_bytes(chunk: &Chunk) -> Result<Vec<u8>, FormatError> {
    let body = bincode_options().serialize(chunk)?;
    let hash = fnv1a_64(&body);

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&FORMAT_MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    out.extend_from_slice(&hash.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Décadre, vérifie magic/version/hash, reconstruit les index internes.
pub fn chunk_from_bytes(bytes: &[u8]) -> Result<Chunk, FormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::TooShort(bytes.len()));
    }
    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if magic != FORMAT_MAGIC {
        return Err(FormatError::BadMagic(magic));
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(FormatError::BadVersion { expected: FORMAT_VERSION, found: version });
    }
    let expected = u64::from_be_bytes([
        bytes[6], bytes[7], bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13],
    ]);
    let body = &bytes[HEADER_LEN..];
    let found = fnv1a_64(body);
    if expected != found {
        return Err(FormatError::BadHash { expected, found });
    }

    let mut chunk: Chunk = bincode_options().deserialize(body)?;
    chunk.rebuild_after_load()?;
    Ok(chunk)
}

/// Écrit un chunk dans un fichier `.vxc`.
pub fn write_chunk_file(chunk: &Chunk, path: impl AsRef<Path>) -> Result<(), FormatError> {
    let bytes = chunk_to_bytes(chunk)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Lit un chunk depuis un fichier `.vxc`.
pub fn read_chunk_file(path: impl AsRef<Path>) -> Result<Chunk, FormatError> {
    let bytes = std::fs::read(path)?;
    chunk_from_bytes(&bytes)
}

/* ------------------------------ FNV-1a ------------------------------ */

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// FNV-1a 64 bits, suffisant comme contrôle d’intégrité (pas crypto).
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut h = FNV_OFFSET_BASIS;
    for &b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/* ------------------------------- Tests ------------------------------- */
