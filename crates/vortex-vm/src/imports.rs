//! imports.rs — Résolution et cache des modules importés.
//!
//! `Import` dépile un chemin (Str), le résout contre le répertoire du chunk
//! courant puis la racine de modules configurée, charge le `.vxc` compilé,
//! exécute son niveau de tête dans une frame enfant et pousse l’objet des
//! `public_variables`. Le cache est par VM et par chemin résolu : le second
//! import d’un même module rend **le même objet** (identité partagée).

use std::path::{Path, PathBuf};
use std::rc::Rc;

use vortex_core::bytecode::{read_chunk_file, Chunk};

use crate::error::ErrorObj;
use crate::eval::{Flow, OpError, OpResult};
use crate::frame::CallFrame;
use crate::value::{gc, FunctionObj, ObjectObj, Value};
use crate::Vm;

/// Extension des chunks compilés.
const CHUNK_EXT: &str = "vxc";

impl Vm {
    pub(crate) fn op_import(&mut self) -> OpResult<()> {
        let path_v = self.pop()?;
        let path = path_v.as_str().map_err(OpError::Raise)?.to_string();

        let base_dir = {
            let frame = self.frames.last().expect("frame courante");
            let func = frame.function.borrow();
            Path::new(&func.chunk.import_path).parent().map(Path::to_path_buf)
        };
        let resolved = self.resolve_import(&path, base_dir)?;
        let key = resolved.to_string_lossy().into_owned();

        if let Some(exports) = self.imports.get(&key) {
            let v = exports.clone();
            return self.push(v);
        }

        log::debug!("import: chargement de {key}");
        let chunk = read_chunk_file(&resolved)
            .map_err(|e| ErrorObj::import_error(format!("chargement de '{path}': {e}")))?;
        let exports = self.run_module(chunk, &key)?;
        self.imports.insert(key, exports.clone());
        self.push(exports)
    }

    /// Essaie, dans l’ordre : répertoire du chunk courant, racine de
    /// modules configurée, répertoire courant. Ajoute `.vxc` si absent.
    fn resolve_import(&self, path: &str, base_dir: Option<PathBuf>) -> OpResult<PathBuf> {
        let with_ext = if Path::new(path).extension().is_some() {
            PathBuf::from(path)
        } else {
            PathBuf::from(format!("{path}.{CHUNK_EXT}"))
        };

        let mut candidates = Vec::with_capacity(3);
        if let Some(base) = base_dir {
            candidates.push(base.join(&with_ext));
        }
        if let Some(root) = &self.options.modules_root {
            candidates.push(root.join(&with_ext));
        }
        candidates.push(with_ext.clone());

        for c in candidates {
            if c.is_file() {
                return Ok(c.canonicalize().unwrap_or(c));
            }
        }
        Err(ErrorObj::import_error(format!("module introuvable: '{path}'")).into())
    }

    /// Exécute le niveau de tête d’un module et construit son objet
    /// d’exports depuis ses `public_variables`.
    fn run_module(&mut self, mut chunk: Chunk, key: &str) -> OpResult<Value> {
        if chunk.import_path.is_empty() {
            chunk.import_path = key.to_string();
        }
        let public = chunk.public_variables.clone();

        let func = gc(FunctionObj {
            name: format!("<module {key}>"),
            chunk,
            import_path: key.to_string(),
            ..FunctionObj::default()
        });
        Self::ensure_offsets(&func)?;

        let depth = self.frames.len();
        let frame_start = self.stack.len();
        self.frames.push(CallFrame::new(Rc::clone(&func), frame_start, key));

        let flow = self.execute_until(depth).map_err(OpError::Fatal)?;

        let mut exports = ObjectObj::default();
        if flow == Flow::Exited && self.frames.len() > depth {
            {
                let frame = self.frames.last().expect("frame du module");
                for name in &public {
                    if let Some(slot) = frame.local_slot(name) {
                        exports.insert(name.clone(), self.stack[slot].clone());
                    }
                }
            }
            self.close_cells_from(frame_start);
            self.stack.truncate(frame_start);
            self.frames.pop();
        }
        Ok(Value::object(exports))
    }
}
