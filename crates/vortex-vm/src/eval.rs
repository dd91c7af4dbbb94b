//! eval.rs — Boucle d’évaluation de la VM Vortex.
//!
//! Une seule boucle ([`Vm::execute_until`]) lit les opcodes de la frame
//! courante et dispatche. Tout passe par deux canaux d’erreur :
//! - `OpError::Raise(ErrorObj)` : erreur du langage, déroulée vers le
//!   handler try/catch le plus proche ;
//! - `OpError::Fatal(VmError)` : faute machine, arrêt immédiat.
//!
//! Les appels imbriqués (hooks, callbacks host, modules importés) relancent
//! `execute_until` à la profondeur courante ; `Exit` ne termine que la
//! boucle qui l’observe.

use std::rc::Rc;

use vortex_core::bytecode::{ChunkError, Constant, Op};

use crate::error::{ErrorObj, UncaughtError, VmError};
use crate::frame::{CallFrame, LoopEntry, TryHandler};
use crate::value::{
    gc, values_equal, CellState, ClosureCell, FunctionObj, Gc, GeneratorState, Hook, ObjectObj,
    TypeObj, Value, ValueKind,
};
use crate::Vm;

/// Issue d’une boucle d’exécution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Les frames sont redescendues à la profondeur de base.
    Done,
    /// Un `Exit` a été exécuté (la frame qui l’a émis reste en place).
    Exited,
}

/// Issue d’un pas de dispatch.
enum StepFlow {
    Continue,
    Exit,
}

/// Erreur levée par un handler d’opcode.
pub(crate) enum OpError {
    /// Erreur du langage, rattrapable par try/catch.
    Raise(ErrorObj),
    /// Faute machine, jamais rattrapable.
    Fatal(VmError),
}

impl From<ErrorObj> for OpError {
    fn from(e: ErrorObj) -> Self {
        OpError::Raise(e)
    }
}

impl From<VmError> for OpError {
    fn from(e: VmError) -> Self {
        OpError::Fatal(e)
    }
}

impl From<ChunkError> for OpError {
    fn from(e: ChunkError) -> Self {
        OpError::Fatal(VmError::MalformedChunk(e))
    }
}

pub(crate) type OpResult<T = ()> = Result<T, OpError>;

/// Résultat d’une affectation : de quoi déclencher `on_change` une fois
/// tous les emprunts relâchés.
struct AssignOutcome {
    hook: Option<Hook>,
    id: u64,
    old: Value,
    new_snapshot: Value,
}

/// Remplace le payload d’un slot en préservant son identité, sa constness
/// et ses hooks. `temp_non_const` est consommé par l’écriture.
fn apply_assignment(target: &mut Value, new: Value, force: bool) -> Result<AssignOutcome, ErrorObj> {
    if !force && target.meta.is_const && !target.meta.temp_non_const {
        return Err(ErrorObj::const_error("écriture sur une valeur const"));
    }
    let old = target.clone();
    target.kind = new.kind;
    target.meta.temp_non_const = false;
    Ok(AssignOutcome {
        hook: target.hooks.on_change.as_deref().cloned(),
        id: target.id,
        old,
        new_snapshot: target.clone(),
    })
}

/// Étale les arguments marqués `unpack` (des List) en positionnels.
fn expand_unpack(args: Vec<Value>) -> Result<Vec<Value>, ErrorObj> {
    if !args.iter().any(|a| a.meta.unpack) {
        return Ok(args);
    }
    let mut out = Vec::with_capacity(args.len());
    for a in args {
        if a.meta.unpack {
            match &a.kind {
                ValueKind::List(l) => {
                    for mut v in l.borrow().iter().cloned() {
                        v.meta.unpack = false;
                        out.push(v);
                    }
                }
                _ => {
                    return Err(ErrorObj::type_error(format!(
                        "unpack attend une List, trouvé {}",
                        a.type_name()
                    )))
                }
            }
        } else {
            out.push(a);
        }
    }
    Ok(out)
}

/// Longueur d’une valeur (`Len` et la native `len`).
pub(crate) fn value_len(v: &Value) -> Result<f64, ErrorObj> {
    match &v.kind {
        ValueKind::List(l) => Ok(l.borrow().len() as f64),
        ValueKind::Str(s) => Ok(s.chars().count() as f64),
        ValueKind::Object(o) => Ok(o.borrow().len() as f64),
        _ => Err(ErrorObj::type_error(format!("{} n'a pas de longueur", v.type_name()))),
    }
}

/// Résultat d’un opérateur binaire (fonction pure, sans accès pile).
fn binary_result(op: Op, a: &Value, b: &Value) -> Result<Value, ErrorObj> {
    use Op::*;
    let bad = |sym: &str| {
        ErrorObj::type_error(format!(
            "opérandes invalides pour '{sym}': {} et {}",
            a.type_name(),
            b.type_name()
        ))
    };
    match op {
        Add => match (&a.kind, &b.kind) {
            (ValueKind::Number(x), ValueKind::Number(y)) => Ok(Value::number(x + y)),
            (ValueKind::Str(x), ValueKind::Str(y)) => Ok(Value::str(format!("{x}{y}"))),
            (ValueKind::List(x), ValueKind::List(y)) => {
                let mut out = x.borrow().clone();
                out.extend(y.borrow().iter().cloned());
                Ok(Value::list(out))
            }
            _ => Err(bad("+")),
        },
        Subtract => match (&a.kind, &b.kind) {
            (ValueKind::Number(x), ValueKind::Number(y)) => Ok(Value::number(x - y)),
            _ => Err(bad("-")),
        },
        Multiply => match (&a.kind, &b.kind) {
            (ValueKind::Number(x), ValueKind::Number(y)) => Ok(Value::number(x * y)),
            _ => Err(bad("*")),
        },
        Divide => match (&a.kind, &b.kind) {
            (ValueKind::Number(x), ValueKind::Number(y)) => {
                if *y == 0.0 {
                    Err(ErrorObj::arithmetic_error("division par zéro"))
                } else {
                    Ok(Value::number(x / y))
                }
            }
            _ => Err(bad("/")),
        },
        Mod => match (&a.kind, &b.kind) {
            (ValueKind::Number(x), ValueKind::Number(y)) => {
                if *y == 0.0 {
                    Err(ErrorObj::arithmetic_error("modulo par zéro"))
                } else {
                    Ok(Value::number(x % y))
                }
            }
            _ => Err(bad("%")),
        },
        Pow => match (&a.kind, &b.kind) {
            (ValueKind::Number(x), ValueKind::Number(y)) => Ok(Value::number(x.powf(*y))),
            _ => Err(bad("^")),
        },
        And => Ok(Value::bool(a.truthy() && b.truthy())),
        Or => Ok(Value::bool(a.truthy() || b.truthy())),
        EqEq => Ok(Value::bool(values_equal(a, b))),
        NotEq => Ok(Value::bool(!values_equal(a, b))),
        Lt | LtEq | Gt | GtEq => {
            let ord = match (&a.kind, &b.kind) {
                (ValueKind::Number(x), ValueKind::Number(y)) => x.partial_cmp(y),
                (ValueKind::Str(x), ValueKind::Str(y)) => Some(x.cmp(y)),
                _ => return Err(bad("<")),
            };
            let Some(ord) = ord else {
                return Ok(Value::bool(false)); // NaN: toutes les comparaisons échouent
            };
            let r = match op {
                Lt => ord.is_lt(),
                LtEq => ord.is_le(),
                Gt => ord.is_gt(),
                _ => ord.is_ge(),
            };
            Ok(Value::bool(r))
        }
        Range => {
            let from = a.as_number()? as i64;
            let to = b.as_number()? as i64;
            let items: Vec<Value> = if from <= to {
                (from..=to).map(|i| Value::number(i as f64)).collect()
            } else {
                (to..=from).rev().map(|i| Value::number(i as f64)).collect()
            };
            Ok(Value::list(items))
        }
        _ => Err(ErrorObj::type_error(format!("'{op}' n'est pas un opérateur binaire"))),
    }
}

/// Nom symbolique d’un callable (diagnostics des hooks).
fn callable_name(v: &Value) -> String {
    match &v.kind {
        ValueKind::Function(f) => {
            let name = f.borrow().name.clone();
            if name.is_empty() { "<hook>".into() } else { name }
        }
        ValueKind::Native(n) => n.borrow().name.clone(),
        _ => "<hook>".into(),
    }
}

impl Vm {
    /* ----------------------------- Frames ----------------------------- */

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("frame courante")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("frame courante")
    }

    fn stack_floor(&self) -> usize {
        self.frames.last().map_or(0, |f| f.frame_start)
    }

    /* ------------------------------ Pile ------------------------------ */

    pub(crate) fn push(&mut self, v: Value) -> OpResult<()> {
        if let Some(max) = self.options.stack_limit {
            if self.stack.len() >= max {
                return Err(VmError::StackOverflow.into());
            }
        }
        self.stack.push(v);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> OpResult<Value> {
        if self.stack.len() <= self.stack_floor() {
            return Err(VmError::StackUnderflow.into());
        }
        Ok(self.stack.pop().expect("pile non vide"))
    }

    fn pop_many(&mut self, n: usize) -> OpResult<Vec<Value>> {
        if self.stack.len() < self.stack_floor() + n {
            return Err(VmError::StackUnderflow.into());
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn peek(&self, depth: usize) -> OpResult<&Value> {
        let idx = self
            .stack
            .len()
            .checked_sub(1 + depth)
            .filter(|i| *i >= self.stack_floor())
            .ok_or(VmError::StackUnderflow)?;
        Ok(&self.stack[idx])
    }

    fn peek_mut(&mut self) -> OpResult<&mut Value> {
        let floor = self.stack_floor();
        let idx = self
            .stack
            .len()
            .checked_sub(1)
            .filter(|i| *i >= floor)
            .ok_or(VmError::StackUnderflow)?;
        Ok(&mut self.stack[idx])
    }

    /* ------------------------- Lecture du flux ------------------------- */

    fn fetch_u8(&mut self, op: Op) -> OpResult<u8> {
        let frame = self.frames.last_mut().expect("frame courante");
        let func = Rc::clone(&frame.function);
        let func = func.borrow();
        let b = func
            .chunk
            .read_u8(frame.ip)
            .ok_or(ChunkError::TruncatedOperand { op, offset: frame.ip })?;
        frame.ip += 1;
        Ok(b)
    }

    fn fetch_u32(&mut self, op: Op) -> OpResult<u32> {
        let frame = self.frames.last_mut().expect("frame courante");
        let func = Rc::clone(&frame.function);
        let func = func.borrow();
        let v = func
            .chunk
            .read_u32(frame.ip)
            .ok_or(ChunkError::TruncatedOperand { op, offset: frame.ip })?;
        frame.ip += 4;
        Ok(v)
    }

    fn fetch_i32(&mut self, op: Op) -> OpResult<i32> {
        let frame = self.frames.last_mut().expect("frame courante");
        let func = Rc::clone(&frame.function);
        let func = func.borrow();
        let v = func
            .chunk
            .read_i32(frame.ip)
            .ok_or(ChunkError::TruncatedOperand { op, offset: frame.ip })?;
        frame.ip += 4;
        Ok(v)
    }

    /// Constante du chunk courant (index validé).
    fn chunk_constant(&self, k: u32) -> OpResult<Constant> {
        let func = self.frame().function.borrow();
        Ok(func.chunk.constant(k)?.clone())
    }

    /// Constante Str du chunk courant (noms de champs).
    fn constant_str(&self, k: u32) -> OpResult<String> {
        match self.chunk_constant(k)? {
            Constant::Str(s) => Ok(s),
            other => Err(ErrorObj::type_error(format!("nom de champ attendu, trouvé {other}")).into()),
        }
    }

    /// Nom de la table de variables du chunk courant.
    fn variable_name(&self, n: u32) -> OpResult<String> {
        let func = self.frame().function.borrow();
        func.chunk
            .variables
            .get(n as usize)
            .cloned()
            .ok_or_else(|| ErrorObj::name_error(format!("index de nom invalide: {n}")).into())
    }

    /* ------------------------------ Sauts ------------------------------ */

    /// Saute à `instr_index + delta` (l’index courant pointe déjà
    /// l’instruction suivante).
    fn jump_relative(&mut self, delta: i64) -> OpResult<()> {
        let target = self.frame().instr_index as i64 + delta;
        let t = usize::try_from(target).map_err(|_| VmError::BadJump { target })?;
        self.jump_absolute(t)
    }

    fn jump_absolute(&mut self, t: usize) -> OpResult<()> {
        let frame = self.frames.last_mut().expect("frame courante");
        let func = Rc::clone(&frame.function);
        let func = func.borrow();
        let offsets = &func.chunk.instruction_offsets;
        if t > offsets.len() {
            return Err(VmError::BadJump { target: t as i64 }.into());
        }
        // t == len : saut à la fin du flux (fin implicite).
        frame.ip = if t == offsets.len() { func.chunk.code.len() } else { offsets[t] };
        frame.instr_index = t;
        Ok(())
    }

    /* --------------------------- Boucle principale --------------------------- */

    /// Exécute jusqu’à redescendre à `base` frames ou rencontrer `Exit`.
    pub(crate) fn execute_until(&mut self, base: usize) -> Result<Flow, VmError> {
        loop {
            if self.frames.len() <= base {
                return Ok(Flow::Done);
            }
            self.steps += 1;
            if let Some(limit) = self.options.step_limit {
                if self.steps > limit {
                    return Err(VmError::StepLimit(limit));
                }
            }

            let byte_opt = {
                let frame = self.frames.last().expect("frame courante");
                let func = frame.function.borrow();
                func.chunk.code.get(frame.ip).copied()
            };

            let result = match byte_opt {
                None => {
                    // Fin implicite du flux : retour de none.
                    let r = match self.push(Value::none()) {
                        Ok(()) => self.op_return(),
                        Err(e) => Err(e),
                    };
                    r.map(|()| StepFlow::Continue)
                }
                Some(byte) => match Op::from_byte(byte) {
                    None => {
                        let offset = self.frame().ip;
                        return Err(VmError::MalformedChunk(ChunkError::BadOpcode { byte, offset }));
                    }
                    Some(op) => {
                        if self.options.trace {
                            let frame = self.frame();
                            log::trace!("[{}@{:04}] {}", frame.name, frame.ip, op.mnemonic());
                        }
                        {
                            let frame = self.frames.last_mut().expect("frame courante");
                            frame.ip += 1;
                            frame.instr_index += 1;
                        }
                        self.step(op)
                    }
                },
            };

            match result {
                Ok(StepFlow::Continue) => {}
                Ok(StepFlow::Exit) => return Ok(Flow::Exited),
                Err(OpError::Raise(e)) => self.unwind(e, base)?,
                Err(OpError::Fatal(e)) => return Err(e),
            }
        }
    }

    /// Un pas de dispatch.
    fn step(&mut self, op: Op) -> Result<StepFlow, OpError> {
        use Op::*;
        match op {
            Return => self.op_return()?,
            Yield => self.op_yield()?,
            LoadConst => {
                let k = self.fetch_u32(op)?;
                let c = self.chunk_constant(k)?;
                let v = Value::from_constant(&c);
                self.push(v)?;
            }
            LoadThis => self.op_load_this()?,
            Negate => {
                let v = self.pop()?;
                let x = v.as_number().map_err(OpError::Raise)?;
                self.push(Value::number(-x))?;
            }
            Not => {
                let v = self.pop()?;
                self.push(Value::bool(!v.truthy()))?;
            }
            Add | Subtract | Multiply | Divide | Mod | Pow | And | Or | EqEq | NotEq | LtEq
            | GtEq | Lt | Gt | Range => {
                let b = self.pop()?;
                let a = self.pop()?;
                let r = binary_result(op, &a, &b).map_err(OpError::Raise)?;
                self.push(r)?;
            }
            Dot => {
                let k = self.fetch_u32(op)?;
                self.op_dot(k)?;
            }
            StoreVar => {
                let n = self.fetch_u32(op)?;
                self.op_store_var(n)?;
            }
            Load => {
                let n = self.fetch_u32(op)?;
                self.op_load(n)?;
            }
            LoadGlobal => {
                let n = self.fetch_u32(op)?;
                self.op_load_global(n)?;
            }
            LoadClosure => {
                let i = self.fetch_u32(op)?;
                self.op_load_closure(i)?;
            }
            Set => {
                let n = self.fetch_u32(op)?;
                self.op_set(n, false)?;
            }
            SetForce => {
                let n = self.fetch_u32(op)?;
                self.op_set(n, true)?;
            }
            SetProperty => {
                let k = self.fetch_u32(op)?;
                self.op_set_property(k)?;
            }
            SetClosure => {
                let i = self.fetch_u32(op)?;
                self.op_set_closure(i)?;
            }
            MakeClosure => {
                let k = self.fetch_u32(op)?;
                self.op_make_function(k, true)?;
            }
            MakeFunction => {
                let k = self.fetch_u32(op)?;
                self.op_make_function(k, false)?;
            }
            MakeType => {
                let n = self.fetch_u8(op)?;
                self.op_make_type(n as usize)?;
            }
            MakeTyped => self.op_make_typed()?,
            MakeObject => {
                let n = self.fetch_u8(op)?;
                self.op_make_object(n as usize)?;
            }
            MakeConst => {
                self.peek_mut()?.meta.is_const = true;
            }
            MakeNonConst => {
                let top = self.peek_mut()?;
                if top.meta.is_const {
                    top.meta.temp_non_const = true;
                } else {
                    top.meta.is_const = false;
                }
            }
            TypeDefaults => self.op_type_defaults()?,
            Pop => self.op_pop(false)?,
            PopClose => self.op_pop(true)?,
            JumpIfFalse => {
                let d = self.fetch_i32(op)?;
                if !self.peek(0)?.truthy() {
                    self.jump_relative(i64::from(d))?;
                }
            }
            JumpIfTrue => {
                let d = self.fetch_i32(op)?;
                if self.peek(0)?.truthy() {
                    self.jump_relative(i64::from(d))?;
                }
            }
            PopJumpIfFalse => {
                let d = self.fetch_i32(op)?;
                let cond = self.pop()?;
                if !cond.truthy() {
                    self.jump_relative(i64::from(d))?;
                }
            }
            PopJumpIfTrue => {
                let d = self.fetch_i32(op)?;
                let cond = self.pop()?;
                if cond.truthy() {
                    self.jump_relative(i64::from(d))?;
                }
            }
            Jump => {
                let d = self.fetch_i32(op)?;
                self.jump_relative(i64::from(d))?;
            }
            JumpBack => {
                let d = self.fetch_i32(op)?;
                self.jump_relative(-i64::from(d))?;
            }
            Exit => return Ok(StepFlow::Exit),
            Break => {
                let d = self.fetch_i32(op)?;
                self.op_break_continue(i64::from(d))?;
            }
            Continue => {
                let d = self.fetch_i32(op)?;
                self.op_break_continue(-i64::from(d))?;
            }
            BuildList => {
                let n = self.fetch_u8(op)?;
                let items = self.pop_many(n as usize)?;
                self.push(Value::list(items))?;
            }
            Accessor => self.op_accessor()?,
            Len => {
                let v = self.pop()?;
                let len = value_len(&v).map_err(OpError::Raise)?;
                self.push(Value::number(len))?;
            }
            Call => {
                let n = self.fetch_u8(op)?;
                self.op_call(n as usize, false)?;
            }
            CallMethod => {
                let n = self.fetch_u8(op)?;
                self.op_call(n as usize, true)?;
            }
            Import => self.op_import()?,
            Unpack => {
                self.peek_mut()?.meta.unpack = true;
            }
            RemovePush => {
                let top = self.pop()?;
                let _under = self.pop()?;
                self.push(top)?;
            }
            SwapTos => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)?;
            }
            Loop => {
                let sp = self.stack.len();
                let frame = self.frame_mut();
                let start_instr = frame.instr_index;
                frame.loops.push(LoopEntry { start_instr, sp });
            }
            LoopEnd => {
                self.frame_mut().loops.pop();
            }
            Iter => {
                let t_end = self.fetch_u32(op)?;
                self.op_iter(t_end as usize)?;
            }
            HookOnChange => {
                let n = self.fetch_u32(op)?;
                self.op_hook_var(n, false)?;
            }
            HookOnAccess => {
                let n = self.fetch_u32(op)?;
                self.op_hook_var(n, true)?;
            }
            HookClosureOnChange => {
                let i = self.fetch_u32(op)?;
                self.op_hook_closure(i, false)?;
            }
            HookClosureOnAccess => {
                let i = self.fetch_u32(op)?;
                self.op_hook_closure(i, true)?;
            }
            TryBegin => {
                let d = self.fetch_u32(op)?;
                let sp = self.stack.len();
                self.frame_mut().try_handlers.push(TryHandler { catch_instr: d as usize, sp });
            }
            TryEnd => {
                // Pas d'erreur survenue : dépile le handler, fall-through.
                self.frame_mut().try_handlers.pop();
            }
            CatchBegin => {
                let n = self.fetch_u32(op)?;
                let name = self.variable_name(n)?;
                // L'erreur poussée par le déroulage occupe déjà le slot.
                self.frame_mut().locals.push(name);
            }
        }
        Ok(StepFlow::Continue)
    }

    /* --------------------------- Déroulage --------------------------- */

    /// Déroule `err` vers le handler try/catch le plus proche au-dessus de
    /// `base` ; sans handler, remonte en [`VmError::Uncaught`].
    fn unwind(&mut self, err: ErrorObj, base: usize) -> Result<(), VmError> {
        let (line, file) = self
            .frames
            .last()
            .map(|f| {
                let func = f.function.borrow();
                (func.chunk.line_for_offset(f.ip.saturating_sub(1)), func.import_path.clone())
            })
            .unwrap_or((0, String::new()));
        let trace: Vec<String> =
            self.frames.get(base..).unwrap_or(&[]).iter().rev().map(|f| f.name.clone()).collect();

        loop {
            if self.frames.len() <= base {
                return Err(VmError::Uncaught(UncaughtError { error: err, line, file, trace }));
            }
            let fi = self.frames.len() - 1;
            if let Some(h) = self.frames[fi].try_handlers.pop() {
                self.close_cells_from(h.sp);
                self.stack.truncate(h.sp);
                {
                    let frame = &mut self.frames[fi];
                    let keep = h.sp.saturating_sub(frame.frame_start);
                    frame.locals.truncate(keep);
                    frame.loops.retain(|l| l.sp <= h.sp);
                }
                match self.jump_absolute(h.catch_instr) {
                    Ok(()) => {}
                    Err(OpError::Fatal(e)) => return Err(e),
                    Err(OpError::Raise(_)) => {
                        return Err(VmError::BadJump { target: h.catch_instr as i64 })
                    }
                }
                self.stack.push(Value::error(err));
                return Ok(());
            }
            // Pas de handler dans cette frame : démontage.
            let fs = self.frames[fi].frame_start;
            self.close_cells_from(fs);
            self.stack.truncate(fs);
            self.frames.pop();
        }
    }

    /* ------------------------ Retours & générateurs ------------------------ */

    fn op_return(&mut self) -> OpResult<()> {
        let result = self.pop()?;
        // Primitive throw : retourner une valeur d'erreur la lève.
        if let ValueKind::Error(e) = &result.kind {
            return Err(OpError::Raise(e.borrow().clone()));
        }
        let (frame_start, func) = {
            let frame = self.frame();
            (frame.frame_start, Rc::clone(&frame.function))
        };
        {
            let mut func = func.borrow_mut();
            if func.is_generator {
                func.generator_done = true;
                func.gen_state = None;
            }
        }
        self.close_cells_from(frame_start);
        self.stack.truncate(frame_start);
        self.frames.pop();
        self.push(result)
    }

    fn op_yield(&mut self) -> OpResult<()> {
        let result = self.pop()?;
        let (frame_start, ip, instr_index, locals, func) = {
            let frame = self.frame();
            (
                frame.frame_start,
                frame.ip,
                frame.instr_index,
                frame.locals.clone(),
                Rc::clone(&frame.function),
            )
        };
        // Les cellules visant la fenêtre sont promues à la suspension.
        self.close_cells_from(frame_start);
        let window = self.stack[frame_start..].to_vec();
        {
            let mut func = func.borrow_mut();
            func.is_generator = true;
            func.generator_init = true;
            func.gen_state = Some(GeneratorState { ip, instr_index, window, locals });
        }
        self.stack.truncate(frame_start);
        self.frames.pop();
        self.push(result)
    }

    fn resume_generator(&mut self, f: Gc<FunctionObj>) -> OpResult<()> {
        let st = f
            .borrow_mut()
            .gen_state
            .take()
            .ok_or_else(|| ErrorObj::generator_error("générateur sans état de reprise"))?;
        if let Some(max) = self.options.call_stack_limit {
            if self.frames.len() >= max {
                return Err(VmError::CallStackOverflow.into());
            }
        }
        let frame_start = self.stack.len();
        for v in st.window {
            self.push(v)?;
        }
        let name = f.borrow().name.clone();
        let mut frame = CallFrame::new(Rc::clone(&f), frame_start, name);
        frame.ip = st.ip;
        frame.instr_index = st.instr_index;
        frame.locals = st.locals;
        self.frames.push(frame);
        Ok(())
    }

    /* ------------------------------ Appels ------------------------------ */

    fn op_call(&mut self, argc: usize, method: bool) -> OpResult<()> {
        let args = self.pop_many(argc)?;
        let receiver = if method { Some(self.pop()?) } else { None };
        let callee = self.pop()?;
        let args = expand_unpack(args).map_err(OpError::Raise)?;
        match &callee.kind {
            ValueKind::Function(f) => {
                let recv = receiver.or_else(|| f.borrow().receiver.as_deref().cloned());
                self.call_function(Rc::clone(f), recv, args)?;
                Ok(())
            }
            ValueKind::Native(n) => {
                let fptr = n.borrow().function;
                let result = fptr(self, args).map_err(OpError::Raise)?;
                if let ValueKind::Error(e) = &result.kind {
                    return Err(OpError::Raise(e.borrow().clone()));
                }
                self.push(result)
            }
            _ => Err(ErrorObj::type_error(format!("{} n'est pas appelable", callee.type_name()))
                .into()),
        }
    }

    /// Appelle une fonction compilée. Renvoie `true` si une frame a été
    /// poussée (faux pour un générateur épuisé, qui pousse `none`).
    pub(crate) fn call_function(
        &mut self,
        f: Gc<FunctionObj>,
        receiver: Option<Value>,
        args: Vec<Value>,
    ) -> OpResult<bool> {
        let (is_gen, init, done, has_state) = {
            let fr = f.borrow();
            (fr.is_generator, fr.generator_init, fr.generator_done, fr.gen_state.is_some())
        };
        if is_gen && done {
            // Générateur épuisé : chaque appel suivant rend none.
            self.push(Value::none())?;
            return Ok(false);
        }
        if is_gen && init && has_state {
            if !args.is_empty() {
                return Err(ErrorObj::arity_error(
                    "un générateur suspendu se reprend sans argument",
                )
                .into());
            }
            self.resume_generator(f)?;
            return Ok(true);
        }

        let bound = self.bind_args(&f, args)?;
        if let Some(max) = self.options.call_stack_limit {
            if self.frames.len() >= max {
                return Err(VmError::CallStackOverflow.into());
            }
        }
        Self::ensure_offsets(&f)?;

        let frame_start = self.stack.len();
        let (name, params) = {
            let fr = f.borrow();
            let name = if fr.name.is_empty() { "<anonymous>".to_string() } else { fr.name.clone() };
            (name, fr.params.clone())
        };
        for v in bound {
            self.push(v)?;
        }
        let mut frame = CallFrame::new(Rc::clone(&f), frame_start, name);
        frame.locals = params;
        frame.receiver = receiver;
        if is_gen {
            f.borrow_mut().generator_init = true;
        }
        self.frames.push(frame);
        Ok(true)
    }

    /// Fenêtre d’arité `A−D ≤ n ≤ A` après étalement, remplissage des
    /// défauts, collecte packer.
    fn bind_args(&self, f: &Gc<FunctionObj>, args: Vec<Value>) -> OpResult<Vec<Value>> {
        let (arity, defaults, packer, name, default_values) = {
            let fr = f.borrow();
            (
                fr.arity as usize,
                fr.defaults as usize,
                fr.packer,
                if fr.name.is_empty() { "<anonymous>".to_string() } else { fr.name.clone() },
                fr.default_values.clone(),
            )
        };

        if packer && arity > 0 {
            let fixed = arity - 1;
            let required = fixed.saturating_sub(defaults);
            if args.len() < required {
                return Err(ErrorObj::arity_error(format!(
                    "'{name}' attend au moins {required} argument(s), reçu {}",
                    args.len()
                ))
                .into());
            }
            let mut it = args.into_iter();
            let mut bound = Vec::with_capacity(arity);
            for i in 0..fixed {
                match it.next() {
                    Some(v) => bound.push(v),
                    None => {
                        let di = (i + defaults).saturating_sub(fixed);
                        bound.push(default_values.get(di).cloned().unwrap_or_else(Value::none));
                    }
                }
            }
            let rest: Vec<Value> = it.collect();
            let mut packed = Value::list(rest);
            packed.meta.packer = true;
            bound.push(packed);
            return Ok(bound);
        }

        let min = arity.saturating_sub(defaults);
        if args.len() < min || args.len() > arity {
            return Err(ErrorObj::arity_error(format!(
                "'{name}' attend entre {min} et {arity} argument(s), reçu {}",
                args.len()
            ))
            .into());
        }
        let mut bound = args;
        while bound.len() < arity {
            let di = (bound.len() + defaults).saturating_sub(arity);
            bound.push(default_values.get(di).cloned().unwrap_or_else(Value::none));
        }
        Ok(bound)
    }

    /// Entrée imbriquée : hooks et callbacks host.
    pub(crate) fn call_value_nested(&mut self, callee: Value, args: Vec<Value>) -> OpResult<Value> {
        match &callee.kind {
            ValueKind::Native(n) => {
                let fptr = n.borrow().function;
                let result = fptr(self, args).map_err(OpError::Raise)?;
                if let ValueKind::Error(e) = &result.kind {
                    return Err(OpError::Raise(e.borrow().clone()));
                }
                Ok(result)
            }
            ValueKind::Function(f) => {
                let depth = self.frames.len();
                let recv = f.borrow().receiver.as_deref().cloned();
                let pushed = self.call_function(Rc::clone(f), recv, args)?;
                if pushed {
                    self.execute_until(depth).map_err(OpError::Fatal)?;
                }
                self.pop()
            }
            _ => Err(ErrorObj::type_error(format!("{} n'est pas appelable", callee.type_name()))
                .into()),
        }
    }

    pub(crate) fn ensure_offsets(f: &Gc<FunctionObj>) -> Result<(), ChunkError> {
        let needs = {
            let fr = f.borrow();
            fr.chunk.instruction_offsets.is_empty() && !fr.chunk.code.is_empty()
        };
        if needs {
            f.borrow_mut().chunk.compute_instruction_offsets()?;
        }
        Ok(())
    }

    /* ----------------------------- Variables ----------------------------- */

    fn op_store_var(&mut self, n: u32) -> OpResult<()> {
        let name = self.variable_name(n)?;
        // Le sommet de pile devient le slot de la nouvelle locale.
        if self.stack.len() <= self.stack_floor() {
            return Err(VmError::StackUnderflow.into());
        }
        self.frame_mut().locals.push(name);
        Ok(())
    }

    fn op_load(&mut self, n: u32) -> OpResult<()> {
        let name = self.variable_name(n)?;
        let slot = self
            .frame()
            .local_slot(&name)
            .ok_or_else(|| ErrorObj::name_error(format!("nom non lié: '{name}'")))?;
        let val = self.stack[slot].clone();
        if let Some(h) = val.hooks.on_access.as_deref().cloned() {
            self.fire_hook(h, val.id, vec![val.clone()])?;
        }
        self.push(val)
    }

    fn op_load_global(&mut self, n: u32) -> OpResult<()> {
        let name = self.variable_name(n)?;
        // `on_access` est réservé à `Load` : pas de hook ici.
        if let Some(v) = self.globals.get(&name) {
            let val = v.clone();
            return self.push(val);
        }
        // Repli : exports des modules importés.
        let mut found: Option<Value> = None;
        for exports in self.imports.values() {
            if let ValueKind::Object(o) = &exports.kind {
                if let Some(v) = o.borrow().get(&name) {
                    found = Some(v.clone());
                    break;
                }
            }
        }
        if let Some(val) = found {
            return self.push(val);
        }
        Err(ErrorObj::name_error(format!("nom non lié: '{name}'")).into())
    }

    fn op_set(&mut self, n: u32, force: bool) -> OpResult<()> {
        let new = self.pop()?;
        let name = self.variable_name(n)?;
        if let Some(slot) = self.frame().local_slot(&name) {
            let outcome = apply_assignment(&mut self.stack[slot], new, force).map_err(OpError::Raise)?;
            if let Some(h) = outcome.hook {
                self.fire_hook(h, outcome.id, vec![outcome.new_snapshot, outcome.old])?;
            }
            return Ok(());
        }
        if let Some(entry) = self.globals.get_mut(&name) {
            let outcome = apply_assignment(entry, new, force).map_err(OpError::Raise)?;
            if let Some(h) = outcome.hook {
                self.fire_hook(h, outcome.id, vec![outcome.new_snapshot, outcome.old])?;
            }
            return Ok(());
        }
        Err(ErrorObj::name_error(format!("nom non lié: '{name}'")).into())
    }

    fn op_set_property(&mut self, k: u32) -> OpResult<()> {
        let value = self.pop()?;
        let target = self.pop()?;
        let field = self.constant_str(k)?;
        match &target.kind {
            ValueKind::Object(o) => {
                if target.meta.is_const && !target.meta.temp_non_const {
                    return Err(ErrorObj::const_error(format!(
                        "écriture du champ '{field}' sur un objet const"
                    ))
                    .into());
                }
                let old = o.borrow().get(&field).cloned().unwrap_or_else(Value::none);
                o.borrow_mut().insert(field, value.clone());
                if let Some(h) = target.hooks.on_change.as_deref().cloned() {
                    self.fire_hook(h, target.id, vec![value.clone(), old])?;
                }
                self.push(value)
            }
            _ => Err(ErrorObj::type_error(format!(
                "{} n'a pas de champs assignables",
                target.type_name()
            ))
            .into()),
        }
    }

    /* ------------------------------ Closures ------------------------------ */

    fn closure_cell(&self, i: u32) -> OpResult<Gc<ClosureCell>> {
        self.frame()
            .function
            .borrow()
            .cells
            .get(i as usize)
            .cloned()
            .ok_or_else(|| ErrorObj::name_error(format!("cellule de closure invalide: {i}")).into())
    }

    /// Valeur lue à travers une cellule (slot vivant ou copie promue).
    fn cell_value(&self, cell: &Gc<ClosureCell>) -> OpResult<Value> {
        let c = cell.borrow();
        match &c.state {
            CellState::Open { slot } => {
                self.stack.get(*slot).cloned().ok_or_else(|| VmError::StackUnderflow.into())
            }
            CellState::Closed(v) => Ok(v.clone()),
        }
    }

    fn op_load_closure(&mut self, i: u32) -> OpResult<()> {
        let cell = self.closure_cell(i)?;
        let val = self.cell_value(&cell)?;
        if let Some(h) = val.hooks.on_access.as_deref().cloned() {
            self.fire_hook(h, val.id, vec![val.clone()])?;
        }
        self.push(val)
    }

    fn op_set_closure(&mut self, i: u32) -> OpResult<()> {
        let new = self.pop()?;
        let cell = self.closure_cell(i)?;
        let is_open = matches!(cell.borrow().state, CellState::Open { .. });
        let outcome = if is_open {
            let slot = match cell.borrow().state {
                CellState::Open { slot } => slot,
                CellState::Closed(_) => 0,
            };
            if slot >= self.stack.len() {
                return Err(VmError::StackUnderflow.into());
            }
            apply_assignment(&mut self.stack[slot], new, false).map_err(OpError::Raise)?
        } else {
            let mut c = cell.borrow_mut();
            match &mut c.state {
                CellState::Closed(v) => apply_assignment(v, new, false).map_err(OpError::Raise)?,
                CellState::Open { .. } => return Err(VmError::StackUnderflow.into()),
            }
        };
        if let Some(h) = outcome.hook {
            self.fire_hook(h, outcome.id, vec![outcome.new_snapshot, outcome.old])?;
        }
        Ok(())
    }

    fn op_make_function(&mut self, k: u32, resolve_captures: bool) -> OpResult<()> {
        let c = self.chunk_constant(k)?;
        let Constant::Function(tpl) = c else {
            return Err(ErrorObj::type_error("gabarit de fonction attendu dans le pool").into());
        };
        let mut func = FunctionObj::from_template(&tpl);
        if func.import_path.is_empty() {
            func.import_path = self.frame().function.borrow().import_path.clone();
        }
        if resolve_captures {
            let (frame_start, frame_name, parent) = {
                let frame = self.frame();
                (frame.frame_start, frame.name.clone(), Rc::clone(&frame.function))
            };
            for cap in &tpl.captures {
                let cell = if cap.is_local {
                    let slot = frame_start + cap.index as usize;
                    self.find_or_open_cell(slot, &cap.name, &frame_name, cap.index)
                } else {
                    parent.borrow().cells.get(cap.index as usize).cloned().ok_or_else(|| {
                        ErrorObj::name_error(format!("capture invalide: '{}'", cap.name))
                    })?
                };
                func.cells.push(cell);
            }
        }
        self.push(Value::function(func))
    }

    /// Cherche une cellule ouverte sur `slot`, sinon en ouvre une.
    /// Les captures du même slot partagent la même cellule.
    fn find_or_open_cell(
        &mut self,
        slot: usize,
        name: &str,
        frame_name: &str,
        index: u32,
    ) -> Gc<ClosureCell> {
        for cell in &self.open_cells {
            if let CellState::Open { slot: s } = cell.borrow().state {
                if s == slot {
                    return Rc::clone(cell);
                }
            }
        }
        let cell = gc(ClosureCell {
            name: name.to_string(),
            frame_name: frame_name.to_string(),
            is_local: true,
            index,
            state: CellState::Open { slot },
        });
        self.open_cells.push(Rc::clone(&cell));
        cell
    }

    /// Promeut les cellules ouvertes dont le slot est `>= min_slot`.
    pub(crate) fn close_cells_from(&mut self, min_slot: usize) {
        let stack = &self.stack;
        self.open_cells.retain(|cell| {
            let mut c = cell.borrow_mut();
            match c.state {
                CellState::Open { slot } if slot >= min_slot => {
                    let v = stack.get(slot).cloned().unwrap_or_else(Value::none);
                    c.state = CellState::Closed(v);
                    false
                }
                CellState::Open { .. } => true,
                CellState::Closed(_) => false,
            }
        });
    }

    /// Promeut les cellules ouvertes sur exactement `slot` (`PopClose`).
    fn close_cells_at(&mut self, slot: usize) {
        let stack = &self.stack;
        self.open_cells.retain(|cell| {
            let mut c = cell.borrow_mut();
            match c.state {
                CellState::Open { slot: s } if s == slot => {
                    let v = stack.get(s).cloned().unwrap_or_else(Value::none);
                    c.state = CellState::Closed(v);
                    false
                }
                CellState::Open { .. } => true,
                CellState::Closed(_) => false,
            }
        });
    }

    /* --------------------------- Construction --------------------------- */

    fn op_make_type(&mut self, n: usize) -> OpResult<()> {
        let pairs = self.pop_many(2 * n)?;
        let name_v = self.pop()?;
        let name = name_v.as_str().map_err(OpError::Raise)?.to_string();
        let mut t = TypeObj { name, ..TypeObj::default() };
        for pair in pairs.chunks(2) {
            let key = pair[0].as_str().map_err(OpError::Raise)?.to_string();
            t.fields.push(key.clone());
            t.defaults.insert(key, pair[1].clone());
        }
        self.push(Value::type_obj(t))
    }

    fn op_make_object(&mut self, n: usize) -> OpResult<()> {
        let pairs = self.pop_many(2 * n)?;
        let mut o = ObjectObj::default();
        for pair in pairs.chunks(2) {
            let key = pair[0].as_str().map_err(OpError::Raise)?.to_string();
            o.insert(key, pair[1].clone());
        }
        self.push(Value::object(o))
    }

    fn op_type_defaults(&mut self) -> OpResult<()> {
        let obj_v = self.pop()?;
        let type_v = self.pop()?;
        let o = obj_v.as_object().map_err(OpError::Raise)?;
        let t = match &type_v.kind {
            ValueKind::Type(t) => Rc::clone(t),
            _ => {
                return Err(ErrorObj::type_error(format!(
                    "Type attendu, trouvé {}",
                    type_v.type_name()
                ))
                .into())
            }
        };
        let unknown: Option<String> = {
            let t_ref = t.borrow();
            let o_ref = o.borrow();
            o_ref.keys.iter().find(|k| !t_ref.fields.contains(k)).cloned()
        };
        if let Some(field) = unknown {
            let type_name = t.borrow().name.clone();
            return Err(ErrorObj::type_error(format!(
                "champ '{field}' inconnu du type {type_name}"
            ))
            .into());
        }
        {
            let t_ref = t.borrow();
            let mut o_ref = o.borrow_mut();
            for field in &t_ref.fields {
                if !o_ref.values.contains_key(field) {
                    let v = t_ref.defaults.get(field).cloned().unwrap_or_else(Value::none);
                    o_ref.insert(field.clone(), v);
                }
            }
            o_ref.type_of = Some(Rc::clone(&t));
        }
        self.push(obj_v)
    }

    fn op_make_typed(&mut self) -> OpResult<()> {
        let value = self.pop()?;
        let type_v = self.pop()?;
        let t = match &type_v.kind {
            ValueKind::Type(t) => Rc::clone(t),
            _ => {
                return Err(ErrorObj::type_error(format!(
                    "Type attendu, trouvé {}",
                    type_v.type_name()
                ))
                .into())
            }
        };
        let ok = match &value.kind {
            ValueKind::Object(o) => {
                o.borrow().type_of.as_ref().is_some_and(|ot| Rc::ptr_eq(ot, &t))
            }
            _ => false,
        };
        if !ok {
            let type_name = t.borrow().name.clone();
            return Err(ErrorObj::type_error(format!(
                "instance de {type_name} attendue, trouvé {}",
                value.type_name()
            ))
            .into());
        }
        self.push(value)
    }

    /* ----------------------------- Accesseurs ----------------------------- */

    fn op_load_this(&mut self) -> OpResult<()> {
        let v = {
            let frame = self.frame();
            frame
                .receiver
                .clone()
                .or_else(|| frame.function.borrow().receiver.as_deref().cloned())
                .unwrap_or_else(Value::none)
        };
        self.push(v)
    }

    fn op_dot(&mut self, k: u32) -> OpResult<()> {
        let field = self.constant_str(k)?;
        let obj_v = self.pop()?;
        let result = match &obj_v.kind {
            ValueKind::Object(o) => {
                let v = o.borrow().get(&field).cloned();
                match v {
                    Some(v) => {
                        // Lecture de méthode : lie le receveur.
                        if let ValueKind::Function(f) = &v.kind {
                            let mut bound = f.borrow().clone();
                            bound.receiver = Some(Box::new(obj_v.clone()));
                            Value::function(bound)
                        } else {
                            v
                        }
                    }
                    None => {
                        return Err(ErrorObj::key_error(format!("clé absente: '{field}'")).into())
                    }
                }
            }
            ValueKind::Error(e) => match field.as_str() {
                "message" => Value::str(e.borrow().message.clone()),
                "kind" => Value::str(e.borrow().kind.name()),
                _ => return Err(ErrorObj::key_error(format!("clé absente: '{field}'")).into()),
            },
            ValueKind::Type(t) => match field.as_str() {
                "name" => Value::str(t.borrow().name.clone()),
                _ => return Err(ErrorObj::key_error(format!("clé absente: '{field}'")).into()),
            },
            _ => {
                return Err(ErrorObj::type_error(format!(
                    "{} n'a pas de champs",
                    obj_v.type_name()
                ))
                .into())
            }
        };
        self.push(result)
    }

    fn op_accessor(&mut self) -> OpResult<()> {
        let index = self.pop()?;
        let container = self.pop()?;
        let result = match &container.kind {
            ValueKind::List(l) => {
                let l = l.borrow();
                let raw = index.as_number().map_err(OpError::Raise)? as i64;
                let len = l.len() as i64;
                let i = if raw < 0 { raw + len } else { raw };
                if i < 0 || i >= len {
                    return Err(ErrorObj::index_error(format!(
                        "index {raw} hors bornes (longueur {len})"
                    ))
                    .into());
                }
                l[i as usize].clone()
            }
            ValueKind::Str(s) => {
                let raw = index.as_number().map_err(OpError::Raise)? as i64;
                let len = s.chars().count() as i64;
                let i = if raw < 0 { raw + len } else { raw };
                if i < 0 || i >= len {
                    return Err(ErrorObj::index_error(format!(
                        "index {raw} hors bornes (longueur {len})"
                    ))
                    .into());
                }
                match s.chars().nth(i as usize) {
                    Some(c) => Value::str(c.to_string()),
                    None => Value::none(),
                }
            }
            ValueKind::Object(o) => {
                let key = index.as_str().map_err(OpError::Raise)?;
                match o.borrow().get(key) {
                    Some(v) => v.clone(),
                    None => {
                        return Err(ErrorObj::key_error(format!("clé absente: '{key}'")).into())
                    }
                }
            }
            _ => {
                return Err(ErrorObj::type_error(format!(
                    "{} n'est pas indexable",
                    container.type_name()
                ))
                .into())
            }
        };
        self.push(result)
    }

    /* ------------------------------- Pile ------------------------------- */

    fn op_pop(&mut self, close: bool) -> OpResult<()> {
        if self.stack.len() <= self.stack_floor() {
            return Err(VmError::StackUnderflow.into());
        }
        let idx = self.stack.len() - 1;
        if close {
            self.close_cells_at(idx);
        }
        self.stack.pop();
        // Si le slot était la dernière locale, son nom sort de portée.
        let frame = self.frame_mut();
        if !frame.locals.is_empty() && frame.frame_start + frame.locals.len() - 1 == idx {
            frame.locals.pop();
        }
        Ok(())
    }

    /* ----------------------------- Itération ----------------------------- */

    fn op_break_continue(&mut self, delta: i64) -> OpResult<()> {
        let entry = {
            let frame = self.frame_mut();
            let entry = if delta >= 0 { frame.loops.pop() } else { frame.loops.last().copied() };
            if let Some(e) = entry {
                let keep = e.sp.saturating_sub(frame.frame_start);
                frame.locals.truncate(keep);
            }
            entry
        };
        if let Some(e) = entry {
            self.close_cells_from(e.sp);
            self.stack.truncate(e.sp);
        }
        self.jump_relative(delta)
    }

    fn op_iter(&mut self, t_end: usize) -> OpResult<()> {
        let name_v = self.pop()?;
        let idx_v = self.pop()?;
        let coll = self.pop()?;
        let name = name_v.as_str().map_err(OpError::Raise)?.to_string();
        let i = idx_v.as_number().map_err(OpError::Raise)? as usize;
        let next: Option<Value> = match &coll.kind {
            ValueKind::List(l) => l.borrow().get(i).cloned(),
            ValueKind::Str(s) => s.chars().nth(i).map(|c| Value::str(c.to_string())),
            _ => {
                return Err(ErrorObj::type_error(format!(
                    "{} n'est pas itérable",
                    coll.type_name()
                ))
                .into())
            }
        };
        match next {
            Some(elem) => {
                // La liaison de boucle est déclarée avant la boucle par
                // l'émetteur : on rebinde le slot directement, sans passer
                // par le chemin d'affectation (`on_change` est réservé à
                // `Set`/`SetProperty`).
                let slot = self.frame().local_slot(&name).ok_or_else(|| {
                    ErrorObj::name_error(format!("liaison de boucle non déclarée: '{name}'"))
                })?;
                self.stack[slot].kind = elem.kind;
                self.push(coll)?;
                self.push(Value::number((i + 1) as f64))?;
                self.push(name_v)
            }
            None => self.jump_absolute(t_end),
        }
    }

    /* ------------------------------- Hooks ------------------------------- */

    /// Invoque un observateur avec garde anti-récursion sur l’identité de
    /// la valeur observée.
    fn fire_hook(&mut self, hook: Hook, target_id: u64, args: Vec<Value>) -> OpResult<()> {
        if self.firing_hooks.contains(&target_id) {
            return Ok(());
        }
        self.firing_hooks.insert(target_id);
        let result = self.call_value_nested(hook.callable.clone(), args);
        self.firing_hooks.remove(&target_id);
        result.map(|_| ())
    }

    fn op_hook_var(&mut self, n: u32, access: bool) -> OpResult<()> {
        let callable = self.pop()?;
        let hook = Hook { name: callable_name(&callable), callable };
        let name = self.variable_name(n)?;
        if let Some(slot) = self.frame().local_slot(&name) {
            let target = &mut self.stack[slot];
            if access {
                target.hooks.on_access = Some(Box::new(hook));
            } else {
                target.hooks.on_change = Some(Box::new(hook));
            }
            return Ok(());
        }
        if let Some(target) = self.globals.get_mut(&name) {
            if access {
                target.hooks.on_access = Some(Box::new(hook));
            } else {
                target.hooks.on_change = Some(Box::new(hook));
            }
            return Ok(());
        }
        Err(ErrorObj::name_error(format!("nom non lié: '{name}'")).into())
    }

    fn op_hook_closure(&mut self, i: u32, access: bool) -> OpResult<()> {
        let callable = self.pop()?;
        let hook = Hook { name: callable_name(&callable), callable };
        let cell = self.closure_cell(i)?;
        let open_slot = match cell.borrow().state {
            CellState::Open { slot } => Some(slot),
            CellState::Closed(_) => None,
        };
        match open_slot {
            Some(slot) => {
                let target = self
                    .stack
                    .get_mut(slot)
                    .ok_or(VmError::StackUnderflow)?;
                if access {
                    target.hooks.on_access = Some(Box::new(hook));
                } else {
                    target.hooks.on_change = Some(Box::new(hook));
                }
            }
            None => {
                let mut c = cell.borrow_mut();
                if let CellState::Closed(v) = &mut c.state {
                    if access {
                        v.hooks.on_access = Some(Box::new(hook));
                    } else {
                        v.hooks.on_change = Some(Box::new(hook));
                    }
                }
            }
        }
        Ok(())
    }
}
