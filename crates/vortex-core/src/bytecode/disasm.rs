//! disasm.rs — Désassembleur “lisible humain” pour Vortex.
//!
//! - 1 ligne par instruction : `offset (line) mnemonic operand`
//! - Annotation des index de constantes avec un aperçu de la valeur
//! - Destinations de saut résolues (`-> @offset`)
//! - Détection d’index invalides (`<invalid>`) plutôt que panique
//!
//! Aucune dépendance externe : pure std.

use std::fmt::Write as _;

use crate::bytecode::chunk::Chunk;
use crate::bytecode::ops::Op;

/// Désassemble `chunk` avec un en-tête titré.
pub fn disassemble(chunk: &Chunk, title: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== Disassemble: {title} ==");
    let _ = writeln!(
        out,
        "code={} octets   consts={}   variables={}   publics={}",
        chunk.code.len(),
        chunk.constants.len(),
        chunk.variables.len(),
        chunk.public_variables.len()
    );

    if !chunk.constants.is_empty() {
        let _ = writeln!(out, "\n# Const Pool");
        for (i, v) in chunk.constants.iter() {
            let _ = writeln!(out, "  [{i:03}] {v}");
        }
    }

    let _ = writeln!(out, "\n# Code");
    let offsets = match chunk.scan_instruction_offsets() {
        Ok(o) => o,
        Err(e) => {
            let _ = writeln!(out, "  <flux illisible: {e}>");
            return out;
        }
    };

    for (idx, &off) in offsets.iter().enumerate() {
        let line = chunk.line_for_offset(off);
        let op = Op::from_byte(chunk.code[off]).expect("offset validé par le scan");
        let _ = write!(out, "{off:05}  (line {line:>4})  {:<10}", op.mnemonic());
        render_operand(&mut out, chunk, &offsets, idx, off, op);
        let _ = writeln!(out);
    }

    out
}

fn render_operand(out: &mut String, chunk: &Chunk, offsets: &[usize], idx: usize, off: usize, op: Op) {
    use Op::*;
    match op {
        // Index du pool de constantes.
        LoadConst | Dot | SetProperty | MakeFunction | MakeClosure => {
            if let Some(k) = chunk.read_u32(off + 1) {
                match chunk.constants.get(k) {
                    Some(c) => { let _ = write!(out, "{k} /* {c} */"); }
                    None => { let _ = write!(out, "{k} <invalid>"); }
                }
            }
        }
        // Index de la table de noms.
        StoreVar | Load | LoadGlobal | Set | SetForce | CatchBegin | HookOnChange | HookOnAccess => {
            if let Some(k) = chunk.read_u32(off + 1) {
                match chunk.variables.get(k as usize) {
                    Some(name) => { let _ = write!(out, "{k} /* {name} */"); }
                    None => { let _ = write!(out, "{k} <invalid>"); }
                }
            }
        }
        // Cellules de closure.
        LoadClosure | SetClosure | HookClosureOnChange | HookClosureOnAccess => {
            if let Some(k) = chunk.read_u32(off + 1) {
                let _ = write!(out, "cell {k}");
            }
        }
        // Sauts relatifs (en instructions, depuis la suivante).
        Jump | JumpIfFalse | JumpIfTrue | PopJumpIfFalse | PopJumpIfTrue | Break | Continue
        | JumpBack => {
            if let Some(d) = chunk.read_i32(off + 1) {
                let delta = if op == JumpBack { -i64::from(d) } else { i64::from(d) };
                let target = idx as i64 + 1 + delta;
                match usize::try_from(target).ok().and_then(|t| offsets.get(t)) {
                    Some(&t_off) => { let _ = write!(out, "{d:+} -> @{t_off:05}"); }
                    None => { let _ = write!(out, "{d:+} <invalid>"); }
                }
            }
        }
        // Cibles absolues (index d'instruction).
        TryBegin | Iter => {
            if let Some(t) = chunk.read_u32(off + 1) {
                match offsets.get(t as usize) {
                    Some(&t_off) => { let _ = write!(out, "#{t} -> @{t_off:05}"); }
                    None => { let _ = write!(out, "#{t} <invalid>"); }
                }
            }
        }
        // Petits compteurs.
        Call | CallMethod | BuildList | MakeObject | MakeType => {
            if let Some(n) = chunk.read_u8(off + 1) {
                let _ = write!(out, "{n}");
            }
        }
        _ => {}
    }
}

/* ------------------------------- Tests ------------------------------- */
