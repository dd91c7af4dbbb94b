//! tests/integration.rs — batteries d’intégration pour vortex-vm
//!
//! Les chunks sont assemblés à la main (l’émetteur est un collaborateur
//! externe) : chaque scénario construit son bytecode via les helpers de
//! `vortex-core` puis vérifie le résultat de l’exécution.
//!
//! Astuce : lance en local avec :
//!   cargo test -p vortex-vm

use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use vortex_core::bytecode::{
    write_chunk_file, CaptureDesc, Chunk, Constant, FunctionTemplate, Op,
};
use vortex_vm::{
    values_equal, vnum, ErrorKind, ErrorObj, Host, Value, ValueKind, Vm, VmError, VmOptions,
};

// -----------------------------------------------------------------------------
// Helpers de test
// -----------------------------------------------------------------------------

fn temp_path(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    let pid = std::process::id();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("horloge")
        .as_nanos();
    p.push(format!("vortexvm_test_{pid}_{nanos}_{name}"));
    p
}

fn run(chunk: Chunk) -> Result<Value, VmError> {
    Vm::new().run_chunk(chunk)
}

fn run_ok(chunk: Chunk) -> Value {
    run(chunk).expect("exécution ok")
}

/// L’erreur du langage non rattrapée attendue.
fn run_uncaught(chunk: Chunk) -> ErrorObj {
    match run(chunk) {
        Err(VmError::Uncaught(u)) => u.error,
        other => panic!("attendu une erreur non rattrapée, trouvé {other:?}"),
    }
}

fn num(v: &Value) -> f64 {
    v.as_number().expect("Number attendu")
}

/// Hôte de capture pour tester `print`.
#[derive(Default, Clone)]
struct CaptureHost {
    buf: Rc<RefCell<String>>,
}

impl Host for CaptureHost {
    fn print(&mut self, s: &str) {
        self.buf.borrow_mut().push_str(s);
        self.buf.borrow_mut().push('\n');
    }
}

// -----------------------------------------------------------------------------
// Arithmétique & pile
// -----------------------------------------------------------------------------

#[test]
fn arithmetic_precedence_chunk() {
    // 1 + 2 * 3 → 7
    let mut c = Chunk::new();
    let k1 = c.add_constant(Constant::Number(1.0));
    let k2 = c.add_constant(Constant::Number(2.0));
    let k3 = c.add_constant(Constant::Number(3.0));
    c.add_op_u32(Op::LoadConst, k1, 1);
    c.add_op_u32(Op::LoadConst, k2, 1);
    c.add_op_u32(Op::LoadConst, k3, 1);
    c.add_op(Op::Multiply, 1);
    c.add_op(Op::Add, 1);
    c.add_op(Op::Exit, 1);

    assert_eq!(num(&run_ok(c)), 7.0);
}

#[test]
fn string_and_list_concat() {
    let mut c = Chunk::new();
    let ka = c.add_constant(Constant::Str("foo".into()));
    let kb = c.add_constant(Constant::Str("bar".into()));
    c.add_op_u32(Op::LoadConst, ka, 1);
    c.add_op_u32(Op::LoadConst, kb, 1);
    c.add_op(Op::Add, 1);
    c.add_op(Op::Exit, 1);
    assert_eq!(run_ok(c).to_string(), "foobar");

    let mut c = Chunk::new();
    let k1 = c.add_constant(Constant::Number(1.0));
    let k2 = c.add_constant(Constant::Number(2.0));
    c.add_op_u32(Op::LoadConst, k1, 1);
    c.add_op_u8(Op::BuildList, 1, 1);
    c.add_op_u32(Op::LoadConst, k2, 1);
    c.add_op_u8(Op::BuildList, 1, 1);
    c.add_op(Op::Add, 1);
    c.add_op(Op::Len, 1);
    c.add_op(Op::Exit, 1);
    assert_eq!(num(&run_ok(c)), 2.0);
}

#[test]
fn division_by_zero_raises_arithmetic_error() {
    let mut c = Chunk::new();
    let k1 = c.add_constant(Constant::Number(1.0));
    let k0 = c.add_constant(Constant::Number(0.0));
    c.add_op_u32(Op::LoadConst, k1, 1);
    c.add_op_u32(Op::LoadConst, k0, 1);
    c.add_op(Op::Divide, 1);
    c.add_op(Op::Exit, 1);

    let e = run_uncaught(c);
    assert_eq!(e.kind, ErrorKind::Arithmetic);
    assert!(e.message.contains("division"));
}

#[test]
fn range_builds_inclusive_lists() {
    let mut c = Chunk::new();
    let k1 = c.add_constant(Constant::Number(1.0));
    let k4 = c.add_constant(Constant::Number(4.0));
    c.add_op_u32(Op::LoadConst, k1, 1);
    c.add_op_u32(Op::LoadConst, k4, 1);
    c.add_op(Op::Range, 1);
    c.add_op(Op::Exit, 1);
    let v = run_ok(c);
    assert!(values_equal(&v, &Value::list(vec![vnum(1.0), vnum(2.0), vnum(3.0), vnum(4.0)])));

    // descendant
    let mut c = Chunk::new();
    let k3 = c.add_constant(Constant::Number(3.0));
    let k1 = c.add_constant(Constant::Number(1.0));
    c.add_op_u32(Op::LoadConst, k3, 1);
    c.add_op_u32(Op::LoadConst, k1, 1);
    c.add_op(Op::Range, 1);
    c.add_op(Op::Exit, 1);
    let v = run_ok(c);
    assert!(values_equal(&v, &Value::list(vec![vnum(3.0), vnum(2.0), vnum(1.0)])));
}

#[test]
fn swap_and_remove_push() {
    // [a, b] → SwapTos → [b, a] → RemovePush → [a]
    let mut c = Chunk::new();
    let ka = c.add_constant(Constant::Number(1.0));
    let kb = c.add_constant(Constant::Number(2.0));
    c.add_op_u32(Op::LoadConst, ka, 1);
    c.add_op_u32(Op::LoadConst, kb, 1);
    c.add_op(Op::SwapTos, 1);
    c.add_op(Op::RemovePush, 1);
    c.add_op(Op::Exit, 1);
    assert_eq!(num(&run_ok(c)), 1.0);
}

// -----------------------------------------------------------------------------
// Variables, accès indexé
// -----------------------------------------------------------------------------

#[test]
fn list_store_and_index() {
    // x = [10, 20, 30]; x[1] → 20
    let mut c = Chunk::new();
    let n_x = c.add_variable("x");
    for v in [10.0, 20.0, 30.0] {
        let k = c.add_constant(Constant::Number(v));
        c.add_op_u32(Op::LoadConst, k, 1);
    }
    c.add_op_u8(Op::BuildList, 3, 1);
    c.add_op_u32(Op::StoreVar, n_x, 1);
    c.add_op_u32(Op::Load, n_x, 2);
    let k1 = c.add_constant(Constant::Number(1.0));
    c.add_op_u32(Op::LoadConst, k1, 2);
    c.add_op(Op::Accessor, 2);
    c.add_op(Op::Exit, 2);

    assert_eq!(num(&run_ok(c)), 20.0);
}

#[test]
fn negative_index_wraps() {
    let mut c = Chunk::new();
    let ks = c.add_constant(Constant::Str("abc".into()));
    let km1 = c.add_constant(Constant::Number(-1.0));
    c.add_op_u32(Op::LoadConst, ks, 1);
    c.add_op_u32(Op::LoadConst, km1, 1);
    c.add_op(Op::Accessor, 1);
    c.add_op(Op::Exit, 1);
    assert_eq!(run_ok(c).to_string(), "c");
}

#[test]
fn empty_list_len_and_index_error() {
    let mut c = Chunk::new();
    c.add_op_u8(Op::BuildList, 0, 1);
    c.add_op(Op::Len, 1);
    c.add_op(Op::Exit, 1);
    assert_eq!(num(&run_ok(c)), 0.0);

    let mut c = Chunk::new();
    let k0 = c.add_constant(Constant::Number(0.0));
    c.add_op_u8(Op::BuildList, 0, 1);
    c.add_op_u32(Op::LoadConst, k0, 1);
    c.add_op(Op::Accessor, 1);
    c.add_op(Op::Exit, 1);
    assert_eq!(run_uncaught(c).kind, ErrorKind::Index);
}

#[test]
fn unbound_name_raises_name_error() {
    let mut c = Chunk::new();
    let n = c.add_variable("nope");
    c.add_op_u32(Op::Load, n, 1);
    c.add_op(Op::Exit, 1);
    assert_eq!(run_uncaught(c).kind, ErrorKind::Name);
}

// -----------------------------------------------------------------------------
// Constness
// -----------------------------------------------------------------------------

#[test]
fn const_rejects_set_but_not_set_force() {
    // c = const 1 ; c = 2 → ConstError
    let mut c = Chunk::new();
    let n = c.add_variable("c");
    let k1 = c.add_constant(Constant::Number(1.0));
    let k2 = c.add_constant(Constant::Number(2.0));
    c.add_op_u32(Op::LoadConst, k1, 1);
    c.add_op(Op::MakeConst, 1);
    c.add_op(Op::MakeConst, 1); // idempotent : le flag est booléen
    c.add_op_u32(Op::StoreVar, n, 1);
    c.add_op_u32(Op::LoadConst, k2, 2);
    c.add_op_u32(Op::Set, n, 2);
    c.add_op(Op::Exit, 2);
    assert_eq!(run_uncaught(c).kind, ErrorKind::Const);

    // SetForce passe outre
    let mut c = Chunk::new();
    let n = c.add_variable("c");
    let k1 = c.add_constant(Constant::Number(1.0));
    let k2 = c.add_constant(Constant::Number(2.0));
    c.add_op_u32(Op::LoadConst, k1, 1);
    c.add_op(Op::MakeConst, 1);
    c.add_op_u32(Op::StoreVar, n, 1);
    c.add_op_u32(Op::LoadConst, k2, 2);
    c.add_op_u32(Op::SetForce, n, 2);
    c.add_op_u32(Op::Load, n, 3);
    c.add_op(Op::Exit, 3);
    assert_eq!(num(&run_ok(c)), 2.0);
}

#[test]
fn make_non_const_grants_one_shot_mutation() {
    // c = const-avec-relâche 1 ; c = 2 (ok, consomme temp) ; c = 3 → ConstError
    let mut c = Chunk::new();
    let n = c.add_variable("c");
    let k1 = c.add_constant(Constant::Number(1.0));
    let k2 = c.add_constant(Constant::Number(2.0));
    let k3 = c.add_constant(Constant::Number(3.0));
    c.add_op_u32(Op::LoadConst, k1, 1);
    c.add_op(Op::MakeConst, 1);
    c.add_op(Op::MakeNonConst, 1); // permission à usage unique
    c.add_op_u32(Op::StoreVar, n, 1);
    c.add_op_u32(Op::LoadConst, k2, 2);
    c.add_op_u32(Op::Set, n, 2); // consomme temp_non_const
    c.add_op_u32(Op::LoadConst, k3, 3);
    c.add_op_u32(Op::Set, n, 3); // la const est toujours posée
    c.add_op(Op::Exit, 3);
    assert_eq!(run_uncaught(c).kind, ErrorKind::Const);

    // la première écriture est bien passée
    let mut c = Chunk::new();
    let n = c.add_variable("c");
    let k1 = c.add_constant(Constant::Number(1.0));
    let k2 = c.add_constant(Constant::Number(2.0));
    c.add_op_u32(Op::LoadConst, k1, 1);
    c.add_op(Op::MakeConst, 1);
    c.add_op(Op::MakeNonConst, 1);
    c.add_op_u32(Op::StoreVar, n, 1);
    c.add_op_u32(Op::LoadConst, k2, 2);
    c.add_op_u32(Op::Set, n, 2);
    c.add_op_u32(Op::Load, n, 3);
    c.add_op(Op::Exit, 3);
    assert_eq!(num(&run_ok(c)), 2.0);
}

// -----------------------------------------------------------------------------
// Appels, arité, packer, unpack
// -----------------------------------------------------------------------------

/// `fn somme(a, b, c = 10) { return a + b + c }`
fn somme_template() -> FunctionTemplate {
    let mut body = Chunk::new();
    let na = body.add_variable("a");
    let nb = body.add_variable("b");
    let nc = body.add_variable("c");
    body.add_op_u32(Op::Load, na, 1);
    body.add_op_u32(Op::Load, nb, 1);
    body.add_op(Op::Add, 1);
    body.add_op_u32(Op::Load, nc, 1);
    body.add_op(Op::Add, 1);
    body.add_op(Op::Return, 1);
    FunctionTemplate {
        name: "somme".into(),
        arity: 3,
        defaults: 1,
        params: vec!["a".into(), "b".into(), "c".into()],
        default_values: vec![Constant::Number(10.0)],
        chunk: body,
        ..FunctionTemplate::default()
    }
}

fn call_somme_with(args: &[f64]) -> Result<Value, VmError> {
    let mut c = Chunk::new();
    let kf = c.add_constant(Constant::Function(somme_template()));
    c.add_op_u32(Op::MakeFunction, kf, 1);
    for a in args {
        let k = c.add_constant(Constant::Number(*a));
        c.add_op_u32(Op::LoadConst, k, 1);
    }
    c.add_op_u8(Op::Call, args.len() as u8, 1);
    c.add_op(Op::Exit, 1);
    run(c)
}

#[test]
fn arity_window_with_defaults() {
    // A=3, D=1 : accepte 2..=3, rejette 1 et 4
    assert_eq!(num(&call_somme_with(&[1.0, 2.0]).expect("2 args ok")), 13.0);
    assert_eq!(num(&call_somme_with(&[1.0, 2.0, 3.0]).expect("3 args ok")), 6.0);
    for bad in [&[1.0][..], &[1.0, 2.0, 3.0, 4.0][..]] {
        match call_somme_with(bad) {
            Err(VmError::Uncaught(u)) => assert_eq!(u.error.kind, ErrorKind::Arity),
            other => panic!("attendu ArityError, trouvé {other:?}"),
        }
    }
}

#[test]
fn packer_collects_overflow() {
    // fn g(first, rest...) { return len(rest) }
    let mut body = Chunk::new();
    body.add_variable("first");
    let n_rest = body.add_variable("rest");
    body.add_op_u32(Op::Load, n_rest, 1);
    body.add_op(Op::Len, 1);
    body.add_op(Op::Return, 1);

    let tpl = FunctionTemplate {
        name: "g".into(),
        arity: 2,
        params: vec!["first".into(), "rest".into()],
        packer: true,
        chunk: body,
        ..FunctionTemplate::default()
    };

    let mut c = Chunk::new();
    let kf = c.add_constant(Constant::Function(tpl));
    c.add_op_u32(Op::MakeFunction, kf, 1);
    for v in [1.0, 2.0, 3.0, 4.0] {
        let k = c.add_constant(Constant::Number(v));
        c.add_op_u32(Op::LoadConst, k, 1);
    }
    c.add_op_u8(Op::Call, 4, 1);
    c.add_op(Op::Exit, 1);
    assert_eq!(num(&run_ok(c)), 3.0); // rest = [2, 3, 4]
}

#[test]
fn unpack_spreads_list_arguments() {
    let mut c = Chunk::new();
    let kf = c.add_constant(Constant::Function(somme_template()));
    c.add_op_u32(Op::MakeFunction, kf, 1);
    for v in [1.0, 2.0, 3.0] {
        let k = c.add_constant(Constant::Number(v));
        c.add_op_u32(Op::LoadConst, k, 1);
    }
    c.add_op_u8(Op::BuildList, 3, 1);
    c.add_op(Op::Unpack, 1);
    c.add_op_u8(Op::Call, 1, 1); // 1 argument marqué unpack → 3 positionnels
    c.add_op(Op::Exit, 1);
    assert_eq!(num(&run_ok(c)), 6.0);
}

#[test]
fn calling_a_number_is_a_type_error() {
    let mut c = Chunk::new();
    let k = c.add_constant(Constant::Number(5.0));
    c.add_op_u32(Op::LoadConst, k, 1);
    c.add_op_u8(Op::Call, 0, 1);
    c.add_op(Op::Exit, 1);
    assert_eq!(run_uncaught(c).kind, ErrorKind::Type);
}

// -----------------------------------------------------------------------------
// Closures
// -----------------------------------------------------------------------------

#[test]
fn closure_counter_survives_declaring_frame() {
    // f = () => { c = 0; return () => { c = c + 1; return c } }
    // g = f(); g(); g() → 2
    let mut inner = Chunk::new();
    let k1 = inner.add_constant(Constant::Number(1.0));
    inner.add_op_u32(Op::LoadClosure, 0, 2);
    inner.add_op_u32(Op::LoadConst, k1, 2);
    inner.add_op(Op::Add, 2);
    inner.add_op_u32(Op::SetClosure, 0, 2);
    inner.add_op_u32(Op::LoadClosure, 0, 2);
    inner.add_op(Op::Return, 2);
    let inner_tpl = FunctionTemplate {
        name: "inc".into(),
        captures: vec![CaptureDesc { name: "c".into(), index: 0, is_local: true }],
        chunk: inner,
        ..FunctionTemplate::default()
    };

    let mut outer = Chunk::new();
    let n_c = outer.add_variable("c");
    let k0 = outer.add_constant(Constant::Number(0.0));
    let k_inner = outer.add_constant(Constant::Function(inner_tpl));
    outer.add_op_u32(Op::LoadConst, k0, 1);
    outer.add_op_u32(Op::StoreVar, n_c, 1);
    outer.add_op_u32(Op::MakeClosure, k_inner, 2);
    outer.add_op(Op::Return, 2);
    let outer_tpl =
        FunctionTemplate { name: "f".into(), chunk: outer, ..FunctionTemplate::default() };

    let mut main = Chunk::new();
    let n_f = main.add_variable("f");
    let n_g = main.add_variable("g");
    let kf = main.add_constant(Constant::Function(outer_tpl));
    main.add_op_u32(Op::MakeFunction, kf, 1);
    main.add_op_u32(Op::StoreVar, n_f, 1);
    main.add_op_u32(Op::Load, n_f, 2);
    main.add_op_u8(Op::Call, 0, 2);
    main.add_op_u32(Op::StoreVar, n_g, 2);
    main.add_op_u32(Op::Load, n_g, 3);
    main.add_op_u8(Op::Call, 0, 3);
    main.add_op(Op::Pop, 3);
    main.add_op_u32(Op::Load, n_g, 4);
    main.add_op_u8(Op::Call, 0, 4);
    main.add_op(Op::Exit, 4);

    assert_eq!(num(&run_ok(main)), 2.0);
}

#[test]
fn two_closures_share_one_cell() {
    // f = () => { c = 0; return [() => { c = c + 1; return c },
    //                            () => { return c }] }
    // fns = f(); fns[0](); fns[0](); fns[1]() → 2
    let mut inc = Chunk::new();
    let k1 = inc.add_constant(Constant::Number(1.0));
    inc.add_op_u32(Op::LoadClosure, 0, 2);
    inc.add_op_u32(Op::LoadConst, k1, 2);
    inc.add_op(Op::Add, 2);
    inc.add_op_u32(Op::SetClosure, 0, 2);
    inc.add_op_u32(Op::LoadClosure, 0, 2);
    inc.add_op(Op::Return, 2);
    let inc_tpl = FunctionTemplate {
        name: "inc".into(),
        captures: vec![CaptureDesc { name: "c".into(), index: 0, is_local: true }],
        chunk: inc,
        ..FunctionTemplate::default()
    };

    let mut get = Chunk::new();
    get.add_op_u32(Op::LoadClosure, 0, 3);
    get.add_op(Op::Return, 3);
    let get_tpl = FunctionTemplate {
        name: "get".into(),
        captures: vec![CaptureDesc { name: "c".into(), index: 0, is_local: true }],
        chunk: get,
        ..FunctionTemplate::default()
    };

    let mut outer = Chunk::new();
    let n_c = outer.add_variable("c");
    let k0 = outer.add_constant(Constant::Number(0.0));
    let k_inc = outer.add_constant(Constant::Function(inc_tpl));
    let k_get = outer.add_constant(Constant::Function(get_tpl));
    outer.add_op_u32(Op::LoadConst, k0, 1);
    outer.add_op_u32(Op::StoreVar, n_c, 1);
    outer.add_op_u32(Op::MakeClosure, k_inc, 2);
    outer.add_op_u32(Op::MakeClosure, k_get, 3);
    outer.add_op_u8(Op::BuildList, 2, 4);
    outer.add_op(Op::Return, 4);
    let outer_tpl =
        FunctionTemplate { name: "f".into(), chunk: outer, ..FunctionTemplate::default() };

    let mut main = Chunk::new();
    let n_fns = main.add_variable("fns");
    let kf = main.add_constant(Constant::Function(outer_tpl));
    let k0 = main.add_constant(Constant::Number(0.0));
    let k1 = main.add_constant(Constant::Number(1.0));
    main.add_op_u32(Op::MakeFunction, kf, 1);
    main.add_op_u8(Op::Call, 0, 1);
    main.add_op_u32(Op::StoreVar, n_fns, 1);
    for _ in 0..2 {
        main.add_op_u32(Op::Load, n_fns, 2);
        main.add_op_u32(Op::LoadConst, k0, 2);
        main.add_op(Op::Accessor, 2);
        main.add_op_u8(Op::Call, 0, 2);
        main.add_op(Op::Pop, 2);
    }
    main.add_op_u32(Op::Load, n_fns, 3);
    main.add_op_u32(Op::LoadConst, k1, 3);
    main.add_op(Op::Accessor, 3);
    main.add_op_u8(Op::Call, 0, 3);
    main.add_op(Op::Exit, 3);

    assert_eq!(num(&run_ok(main)), 2.0);
}

// -----------------------------------------------------------------------------
// Générateurs
// -----------------------------------------------------------------------------

#[test]
fn generator_yields_then_none_when_done() {
    // gen = function*() { yield 1; yield 2 }
    // gen(); gen(); gen() → 1, 2, none ; gen() → none (toujours)
    let mut body = Chunk::new();
    let k1 = body.add_constant(Constant::Number(1.0));
    let k2 = body.add_constant(Constant::Number(2.0));
    body.add_op_u32(Op::LoadConst, k1, 1);
    body.add_op(Op::Yield, 1);
    // la reprise continue ici, pile de frame vide
    body.add_op_u32(Op::LoadConst, k2, 2);
    body.add_op(Op::Yield, 2);
    let tpl = FunctionTemplate {
        name: "gen".into(),
        is_generator: true,
        chunk: body,
        ..FunctionTemplate::default()
    };

    let mut main = Chunk::new();
    let n = main.add_variable("gen");
    let kf = main.add_constant(Constant::Function(tpl));
    main.add_op_u32(Op::MakeFunction, kf, 1);
    main.add_op_u32(Op::StoreVar, n, 1);
    for line in 2..6 {
        main.add_op_u32(Op::Load, n, line);
        main.add_op_u8(Op::Call, 0, line);
    }
    main.add_op_u8(Op::BuildList, 4, 6);
    main.add_op(Op::Exit, 6);

    let v = run_ok(main);
    let expected =
        Value::list(vec![vnum(1.0), vnum(2.0), Value::none(), Value::none()]);
    assert!(values_equal(&v, &expected), "trouvé {v}");
}

#[test]
fn generator_keeps_locals_across_yields() {
    // gen = function*() { c = 0; yield c; c = c + 1; yield c }
    let mut body = Chunk::new();
    let n_c = body.add_variable("c");
    let k0 = body.add_constant(Constant::Number(0.0));
    let k1 = body.add_constant(Constant::Number(1.0));
    body.add_op_u32(Op::LoadConst, k0, 1);
    body.add_op_u32(Op::StoreVar, n_c, 1);
    body.add_op_u32(Op::Load, n_c, 2);
    body.add_op(Op::Yield, 2);
    body.add_op_u32(Op::Load, n_c, 3);
    body.add_op_u32(Op::LoadConst, k1, 3);
    body.add_op(Op::Add, 3);
    body.add_op_u32(Op::Set, n_c, 3);
    body.add_op_u32(Op::Load, n_c, 4);
    body.add_op(Op::Yield, 4);
    let tpl = FunctionTemplate {
        name: "gen".into(),
        is_generator: true,
        chunk: body,
        ..FunctionTemplate::default()
    };

    let mut main = Chunk::new();
    let n = main.add_variable("gen");
    let kf = main.add_constant(Constant::Function(tpl));
    main.add_op_u32(Op::MakeFunction, kf, 1);
    main.add_op_u32(Op::StoreVar, n, 1);
    for line in 2..4 {
        main.add_op_u32(Op::Load, n, line);
        main.add_op_u8(Op::Call, 0, line);
    }
    main.add_op_u8(Op::BuildList, 2, 4);
    main.add_op(Op::Exit, 4);

    let v = run_ok(main);
    assert!(values_equal(&v, &Value::list(vec![vnum(0.0), vnum(1.0)])), "trouvé {v}");
}

#[test]
fn generator_that_never_yields_returns_and_finishes() {
    let mut body = Chunk::new();
    let k = body.add_constant(Constant::Number(42.0));
    body.add_op_u32(Op::LoadConst, k, 1);
    body.add_op(Op::Return, 1);
    let tpl = FunctionTemplate {
        name: "gen".into(),
        is_generator: true,
        chunk: body,
        ..FunctionTemplate::default()
    };

    let mut main = Chunk::new();
    let n = main.add_variable("gen");
    let kf = main.add_constant(Constant::Function(tpl));
    main.add_op_u32(Op::MakeFunction, kf, 1);
    main.add_op_u32(Op::StoreVar, n, 1);
    main.add_op_u32(Op::Load, n, 2);
    main.add_op_u8(Op::Call, 0, 2);
    main.add_op_u32(Op::Load, n, 3);
    main.add_op_u8(Op::Call, 0, 3);
    main.add_op_u8(Op::BuildList, 2, 3);
    main.add_op(Op::Exit, 3);

    // premier appel : la valeur du return ; ensuite : none (épuisé)
    let v = run_ok(main);
    assert!(values_equal(&v, &Value::list(vec![vnum(42.0), Value::none()])), "trouvé {v}");
}

// -----------------------------------------------------------------------------
// Try / catch
// -----------------------------------------------------------------------------

#[test]
fn try_catch_binds_error_and_reads_message() {
    // try { x = 1/0 } catch (e) { e.message } → contient "division"
    let mut c = Chunk::new();
    let n_e = c.add_variable("e");
    let k1 = c.add_constant(Constant::Number(1.0));
    let k0 = c.add_constant(Constant::Number(0.0));
    let k_msg = c.add_constant(Constant::Str("message".into()));
    // instructions : 0 TryBegin, 1 ldc, 2 ldc, 3 Divide, 4 Pop,
    //                5 TryEnd, 6 Jump(+3), 7 CatchBegin, 8 Load e, 9 Dot,
    //                10 Exit
    c.add_op_u32(Op::TryBegin, 7, 1);
    c.add_op_u32(Op::LoadConst, k1, 1);
    c.add_op_u32(Op::LoadConst, k0, 1);
    c.add_op(Op::Divide, 1);
    c.add_op(Op::Pop, 1);
    c.add_op(Op::TryEnd, 1);
    c.add_op_i32(Op::Jump, 3, 1);
    c.add_op_u32(Op::CatchBegin, n_e, 2);
    c.add_op_u32(Op::Load, n_e, 2);
    c.add_op_u32(Op::Dot, k_msg, 2);
    c.add_op(Op::Exit, 2);

    let v = run_ok(c);
    assert!(v.to_string().contains("division"), "trouvé {v}");
}

#[test]
fn try_end_without_error_falls_through() {
    // try { 5 } → pas d'erreur, le handler est dépilé, résultat 5
    let mut c = Chunk::new();
    let n_e = c.add_variable("e");
    let k5 = c.add_constant(Constant::Number(5.0));
    // 0 TryBegin, 1 ldc 5, 2 TryEnd, 3 Jump(+1), 4 CatchBegin, 5 Exit
    c.add_op_u32(Op::TryBegin, 4, 1);
    c.add_op_u32(Op::LoadConst, k5, 1);
    c.add_op(Op::TryEnd, 1);
    c.add_op_i32(Op::Jump, 1, 1);
    c.add_op_u32(Op::CatchBegin, n_e, 2);
    c.add_op(Op::Exit, 3);
    assert_eq!(num(&run_ok(c)), 5.0);
}

#[test]
fn unwinding_crosses_frames() {
    // boom() lève NameError ; l'appelant la rattrape
    let mut boom = Chunk::new();
    let n = boom.add_variable("jamais_lie");
    boom.add_op_u32(Op::Load, n, 1);
    boom.add_op(Op::Return, 1);
    let boom_tpl =
        FunctionTemplate { name: "boom".into(), chunk: boom, ..FunctionTemplate::default() };

    let mut c = Chunk::new();
    let n_e = c.add_variable("e");
    let kf = c.add_constant(Constant::Function(boom_tpl));
    let k_kind = c.add_constant(Constant::Str("kind".into()));
    // 0 TryBegin, 1 MakeFunction, 2 Call, 3 Pop, 4 TryEnd, 5 Jump(+3),
    // 6 CatchBegin, 7 Load e, 8 Dot kind, 9 Exit
    c.add_op_u32(Op::TryBegin, 6, 1);
    c.add_op_u32(Op::MakeFunction, kf, 1);
    c.add_op_u8(Op::Call, 0, 1);
    c.add_op(Op::Pop, 1);
    c.add_op(Op::TryEnd, 1);
    c.add_op_i32(Op::Jump, 3, 1);
    c.add_op_u32(Op::CatchBegin, n_e, 2);
    c.add_op_u32(Op::Load, n_e, 2);
    c.add_op_u32(Op::Dot, k_kind, 2);
    c.add_op(Op::Exit, 2);

    assert_eq!(run_ok(c).to_string(), "NameError");
}

#[test]
fn uncaught_error_carries_line_and_trace() {
    let mut boom = Chunk::new();
    let n = boom.add_variable("jamais_lie");
    boom.add_op_u32(Op::Load, n, 7);
    boom.add_op(Op::Return, 7);
    let boom_tpl =
        FunctionTemplate { name: "boom".into(), chunk: boom, ..FunctionTemplate::default() };

    let mut c = Chunk::new();
    let kf = c.add_constant(Constant::Function(boom_tpl));
    c.add_op_u32(Op::MakeFunction, kf, 1);
    c.add_op_u8(Op::Call, 0, 1);
    c.add_op(Op::Exit, 1);

    match run(c) {
        Err(VmError::Uncaught(u)) => {
            assert_eq!(u.error.kind, ErrorKind::Name);
            assert_eq!(u.line, 7);
            assert!(u.trace.iter().any(|f| f == "boom"), "trace: {:?}", u.trace);
        }
        other => panic!("attendu Uncaught, trouvé {other:?}"),
    }
}

#[test]
fn returning_an_error_value_raises_it() {
    // Une native qui renvoie une valeur d'erreur déclenche le déroulage.
    let mut c = Chunk::new();
    let n_e = c.add_variable("e");
    let n_fail = c.add_variable("fail");
    let k_kind = c.add_constant(Constant::Str("kind".into()));
    // 0 TryBegin, 1 LoadGlobal fail, 2 Call, 3 Pop, 4 TryEnd, 5 Jump(+3),
    // 6 CatchBegin, 7 Load e, 8 Dot kind, 9 Exit
    c.add_op_u32(Op::TryBegin, 6, 1);
    c.add_op_u32(Op::LoadGlobal, n_fail, 1);
    c.add_op_u8(Op::Call, 0, 1);
    c.add_op(Op::Pop, 1);
    c.add_op(Op::TryEnd, 1);
    c.add_op_i32(Op::Jump, 3, 1);
    c.add_op_u32(Op::CatchBegin, n_e, 2);
    c.add_op_u32(Op::Load, n_e, 2);
    c.add_op_u32(Op::Dot, k_kind, 2);
    c.add_op(Op::Exit, 2);

    let mut vm = Vm::new();
    vm.define_native("fail", |_vm, _args| {
        Ok(Value::error(ErrorObj::import_error("échec simulé")))
    });
    let v = vm.run_chunk(c).expect("rattrapé");
    assert_eq!(v.to_string(), "ImportError");
}

// -----------------------------------------------------------------------------
// Boucles & itération
// -----------------------------------------------------------------------------

#[test]
fn iter_sums_a_list() {
    // total = 0; for item in [1,2,3] { total = total + item } → 6
    let mut c = Chunk::new();
    let n_total = c.add_variable("total");
    let n_item = c.add_variable("item");
    let k0 = c.add_constant(Constant::Number(0.0));
    let k_none = c.add_constant(Constant::None);
    let k_name = c.add_constant(Constant::Str("item".into()));
    // 0 ldc 0, 1 StoreVar total, 2 ldc none, 3 StoreVar item,
    // 4..6 ldc 1 2 3, 7 BuildList, 8 ldc 0 (index), 9 ldc "item",
    // 10 Loop, 11 Iter #17, 12 Load total, 13 Load item, 14 Add,
    // 15 Set total, 16 JumpBack 6, 17 LoopEnd, 18 Load total, 19 Exit
    c.add_op_u32(Op::LoadConst, k0, 1);
    c.add_op_u32(Op::StoreVar, n_total, 1);
    c.add_op_u32(Op::LoadConst, k_none, 2);
    c.add_op_u32(Op::StoreVar, n_item, 2);
    for v in [1.0, 2.0, 3.0] {
        let k = c.add_constant(Constant::Number(v));
        c.add_op_u32(Op::LoadConst, k, 3);
    }
    c.add_op_u8(Op::BuildList, 3, 3);
    c.add_op_u32(Op::LoadConst, k0, 3);
    c.add_op_u32(Op::LoadConst, k_name, 3);
    c.add_op(Op::Loop, 3);
    c.add_op_u32(Op::Iter, 17, 3);
    c.add_op_u32(Op::Load, n_total, 4);
    c.add_op_u32(Op::Load, n_item, 4);
    c.add_op(Op::Add, 4);
    c.add_op_u32(Op::Set, n_total, 4);
    c.add_op_i32(Op::JumpBack, 6, 4);
    c.add_op(Op::LoopEnd, 5);
    c.add_op_u32(Op::Load, n_total, 6);
    c.add_op(Op::Exit, 6);

    assert_eq!(num(&run_ok(c)), 6.0);
}

#[test]
fn break_cleans_loop_stack() {
    // 0 Loop, 1 Break(+1), 2 LoopEnd, 3 ldc 42, 4 Exit
    let mut c = Chunk::new();
    let k = c.add_constant(Constant::Number(42.0));
    c.add_op(Op::Loop, 1);
    c.add_op_i32(Op::Break, 1, 1);
    c.add_op(Op::LoopEnd, 1);
    c.add_op_u32(Op::LoadConst, k, 2);
    c.add_op(Op::Exit, 2);
    assert_eq!(num(&run_ok(c)), 42.0);
}

#[test]
fn step_limit_stops_infinite_loops() {
    // 0: Jump(-1) → boucle sur soi
    let mut c = Chunk::new();
    c.add_op_i32(Op::Jump, -1, 1);
    c.add_op(Op::Exit, 1);
    let mut vm = Vm::with_options(VmOptions::default().with_step_limit(Some(1_000)));
    match vm.run_chunk(c) {
        Err(VmError::StepLimit(limit)) => assert_eq!(limit, 1_000),
        other => panic!("attendu StepLimit, trouvé {other:?}"),
    }
}

// -----------------------------------------------------------------------------
// Types & objets
// -----------------------------------------------------------------------------

fn point_chunk() -> (Chunk, u32, u32) {
    // Point = type { x = 0, y = 0 } ; p = Point{ x: 5 } (défauts fusionnés)
    let mut c = Chunk::new();
    let n_type = c.add_variable("Point");
    let n_p = c.add_variable("p");
    let k_name = c.add_constant(Constant::Str("Point".into()));
    let k_x = c.add_constant(Constant::Str("x".into()));
    let k_y = c.add_constant(Constant::Str("y".into()));
    let k0 = c.add_constant(Constant::Number(0.0));
    let k5 = c.add_constant(Constant::Number(5.0));
    c.add_op_u32(Op::LoadConst, k_name, 1);
    c.add_op_u32(Op::LoadConst, k_x, 1);
    c.add_op_u32(Op::LoadConst, k0, 1);
    c.add_op_u32(Op::LoadConst, k_y, 1);
    c.add_op_u32(Op::LoadConst, k0, 1);
    c.add_op_u8(Op::MakeType, 2, 1);
    c.add_op_u32(Op::StoreVar, n_type, 1);
    c.add_op_u32(Op::Load, n_type, 2);
    c.add_op_u32(Op::LoadConst, k_x, 2);
    c.add_op_u32(Op::LoadConst, k5, 2);
    c.add_op_u8(Op::MakeObject, 1, 2);
    c.add_op(Op::TypeDefaults, 2);
    c.add_op_u32(Op::StoreVar, n_p, 2);
    (c, n_type, n_p)
}

#[test]
fn type_defaults_fill_missing_fields() {
    let (mut c, _n_type, n_p) = point_chunk();
    let k_y = c.add_constant(Constant::Str("y".into()));
    c.add_op_u32(Op::Load, n_p, 3);
    c.add_op_u32(Op::Dot, k_y, 3);
    c.add_op(Op::Exit, 3);
    assert_eq!(num(&run_ok(c)), 0.0);
}

#[test]
fn set_property_mutates_shared_object() {
    let (mut c, _n_type, n_p) = point_chunk();
    let k_x = c.add_constant(Constant::Str("x".into()));
    let k7 = c.add_constant(Constant::Number(7.0));
    c.add_op_u32(Op::Load, n_p, 3);
    c.add_op_u32(Op::LoadConst, k7, 3);
    c.add_op_u32(Op::SetProperty, k_x, 3);
    c.add_op(Op::Pop, 3);
    c.add_op_u32(Op::Load, n_p, 4);
    c.add_op_u32(Op::Dot, k_x, 4);
    c.add_op(Op::Exit, 4);
    assert_eq!(num(&run_ok(c)), 7.0);
}

#[test]
fn make_typed_checks_instances() {
    // MakeTyped passe pour une instance, échoue pour un nombre
    let (mut c, n_type, n_p) = point_chunk();
    c.add_op_u32(Op::Load, n_type, 3);
    c.add_op_u32(Op::Load, n_p, 3);
    c.add_op(Op::MakeTyped, 3);
    c.add_op(Op::Pop, 3);
    let k9 = c.add_constant(Constant::Number(9.0));
    c.add_op_u32(Op::Load, n_type, 4);
    c.add_op_u32(Op::LoadConst, k9, 4);
    c.add_op(Op::MakeTyped, 4);
    c.add_op(Op::Exit, 4);
    assert_eq!(run_uncaught(c).kind, ErrorKind::Type);
}

#[test]
fn method_read_binds_receiver() {
    // o = { x: 5, getx: fn() { return this.x } } ; o.getx() → 5
    let mut body = Chunk::new();
    let k_x = body.add_constant(Constant::Str("x".into()));
    body.add_op(Op::LoadThis, 1);
    body.add_op_u32(Op::Dot, k_x, 1);
    body.add_op(Op::Return, 1);
    let tpl = FunctionTemplate { name: "getx".into(), chunk: body, ..FunctionTemplate::default() };

    let mut c = Chunk::new();
    let n_o = c.add_variable("o");
    let k_xname = c.add_constant(Constant::Str("x".into()));
    let k_getx = c.add_constant(Constant::Str("getx".into()));
    let k5 = c.add_constant(Constant::Number(5.0));
    let kf = c.add_constant(Constant::Function(tpl));
    c.add_op_u32(Op::LoadConst, k_xname, 1);
    c.add_op_u32(Op::LoadConst, k5, 1);
    c.add_op_u32(Op::LoadConst, k_getx, 1);
    c.add_op_u32(Op::MakeFunction, kf, 1);
    c.add_op_u8(Op::MakeObject, 2, 1);
    c.add_op_u32(Op::StoreVar, n_o, 1);
    c.add_op_u32(Op::Load, n_o, 2);
    c.add_op_u32(Op::Dot, k_getx, 2);
    c.add_op_u8(Op::Call, 0, 2);
    c.add_op(Op::Exit, 2);
    assert_eq!(num(&run_ok(c)), 5.0);
}

#[test]
fn call_method_binds_explicit_receiver() {
    // même getx, mais via CallMethod : [callee, receveur] puis 0 args
    let mut body = Chunk::new();
    let k_x = body.add_constant(Constant::Str("x".into()));
    body.add_op(Op::LoadThis, 1);
    body.add_op_u32(Op::Dot, k_x, 1);
    body.add_op(Op::Return, 1);
    let tpl = FunctionTemplate { name: "getx".into(), chunk: body, ..FunctionTemplate::default() };

    let mut c = Chunk::new();
    let n_o = c.add_variable("o");
    let n_m = c.add_variable("m");
    let k_xname = c.add_constant(Constant::Str("x".into()));
    let k5 = c.add_constant(Constant::Number(5.0));
    let kf = c.add_constant(Constant::Function(tpl));
    c.add_op_u32(Op::LoadConst, k_xname, 1);
    c.add_op_u32(Op::LoadConst, k5, 1);
    c.add_op_u8(Op::MakeObject, 1, 1);
    c.add_op_u32(Op::StoreVar, n_o, 1);
    c.add_op_u32(Op::MakeFunction, kf, 2);
    c.add_op_u32(Op::StoreVar, n_m, 2);
    c.add_op_u32(Op::Load, n_m, 3);
    c.add_op_u32(Op::Load, n_o, 3);
    c.add_op_u8(Op::CallMethod, 0, 3);
    c.add_op(Op::Exit, 3);
    assert_eq!(num(&run_ok(c)), 5.0);
}

// -----------------------------------------------------------------------------
// Hooks
// -----------------------------------------------------------------------------

fn record_hook(vm: &mut Vm, args: Vec<Value>) -> Result<Value, ErrorObj> {
    if let Some(log) = vm.get_global("hook_log") {
        let l = log.as_list()?;
        l.borrow_mut().push(Value::list(args));
    }
    Ok(Value::none())
}

#[test]
fn on_change_fires_with_new_and_old() {
    let mut c = Chunk::new();
    let n_x = c.add_variable("x");
    let n_rec = c.add_variable("rec");
    let k1 = c.add_constant(Constant::Number(1.0));
    let k5 = c.add_constant(Constant::Number(5.0));
    c.add_op_u32(Op::LoadConst, k1, 1);
    c.add_op_u32(Op::StoreVar, n_x, 1);
    c.add_op_u32(Op::LoadGlobal, n_rec, 2);
    c.add_op_u32(Op::HookOnChange, n_x, 2);
    c.add_op_u32(Op::LoadConst, k5, 3);
    c.add_op_u32(Op::Set, n_x, 3);
    c.add_op_u32(Op::Load, n_x, 4);
    c.add_op(Op::Exit, 4);

    let mut vm = Vm::new();
    let log = Value::list(vec![]);
    vm.define_global("hook_log", log.clone());
    vm.define_native("rec", record_hook);
    let v = vm.run_chunk(c).expect("run ok");
    assert_eq!(num(&v), 5.0);

    let entries = log.as_list().expect("liste");
    let entries = entries.borrow();
    assert_eq!(entries.len(), 1);
    // l'observateur reçoit (nouvelle, ancienne)
    assert!(values_equal(&entries[0], &Value::list(vec![vnum(5.0), vnum(1.0)])));
}

#[test]
fn on_access_fires_once_per_load() {
    // x + x → deux Load, deux invocations
    let mut c = Chunk::new();
    let n_x = c.add_variable("x");
    let n_rec = c.add_variable("rec");
    let k5 = c.add_constant(Constant::Number(5.0));
    c.add_op_u32(Op::LoadConst, k5, 1);
    c.add_op_u32(Op::StoreVar, n_x, 1);
    c.add_op_u32(Op::LoadGlobal, n_rec, 2);
    c.add_op_u32(Op::HookOnAccess, n_x, 2);
    c.add_op_u32(Op::Load, n_x, 3);
    c.add_op_u32(Op::Load, n_x, 3);
    c.add_op(Op::Add, 3);
    c.add_op(Op::Exit, 3);

    let mut vm = Vm::new();
    let log = Value::list(vec![]);
    vm.define_global("hook_log", log.clone());
    vm.define_native("rec", record_hook);
    let v = vm.run_chunk(c).expect("run ok");
    assert_eq!(num(&v), 10.0);

    let entries = log.as_list().expect("liste");
    assert_eq!(entries.borrow().len(), 2);
}

#[test]
fn load_global_does_not_fire_on_access() {
    // on_access est réservé à Load : LoadGlobal n'invoque pas l'observateur.
    let mut c = Chunk::new();
    let n_g = c.add_variable("g");
    let n_rec = c.add_variable("rec");
    c.add_op_u32(Op::LoadGlobal, n_rec, 1);
    c.add_op_u32(Op::HookOnAccess, n_g, 1);
    c.add_op_u32(Op::LoadGlobal, n_g, 2);
    c.add_op(Op::Exit, 2);

    let mut vm = Vm::new();
    let log = Value::list(vec![]);
    vm.define_global("hook_log", log.clone());
    vm.define_native("rec", record_hook);
    vm.define_global("g", vnum(7.0));
    let v = vm.run_chunk(c).expect("run ok");
    assert_eq!(num(&v), 7.0);

    let entries = log.as_list().expect("liste");
    assert!(entries.borrow().is_empty(), "LoadGlobal ne doit pas déclencher on_access");
}

#[test]
fn iter_rebind_does_not_fire_on_change() {
    // on_change est réservé à Set/SetProperty : l'avance d'itération
    // rebinde la liaison de boucle sans invoquer l'observateur.
    let mut c = Chunk::new();
    let n_total = c.add_variable("total");
    let n_item = c.add_variable("item");
    let n_rec = c.add_variable("rec");
    let k0 = c.add_constant(Constant::Number(0.0));
    let k_none = c.add_constant(Constant::None);
    let k_name = c.add_constant(Constant::Str("item".into()));
    // 0 ldc 0, 1 StoreVar total, 2 ldc none, 3 StoreVar item,
    // 4 LoadGlobal rec, 5 HookOnChange item,
    // 6..8 ldc 1 2 3, 9 BuildList, 10 ldc 0 (index), 11 ldc "item",
    // 12 Loop, 13 Iter #19, 14 Load total, 15 Load item, 16 Add,
    // 17 Set total, 18 JumpBack 6, 19 LoopEnd, 20 Load total, 21 Exit
    c.add_op_u32(Op::LoadConst, k0, 1);
    c.add_op_u32(Op::StoreVar, n_total, 1);
    c.add_op_u32(Op::LoadConst, k_none, 2);
    c.add_op_u32(Op::StoreVar, n_item, 2);
    c.add_op_u32(Op::LoadGlobal, n_rec, 3);
    c.add_op_u32(Op::HookOnChange, n_item, 3);
    for v in [1.0, 2.0, 3.0] {
        let k = c.add_constant(Constant::Number(v));
        c.add_op_u32(Op::LoadConst, k, 4);
    }
    c.add_op_u8(Op::BuildList, 3, 4);
    c.add_op_u32(Op::LoadConst, k0, 4);
    c.add_op_u32(Op::LoadConst, k_name, 4);
    c.add_op(Op::Loop, 4);
    c.add_op_u32(Op::Iter, 19, 4);
    c.add_op_u32(Op::Load, n_total, 5);
    c.add_op_u32(Op::Load, n_item, 5);
    c.add_op(Op::Add, 5);
    c.add_op_u32(Op::Set, n_total, 5);
    c.add_op_i32(Op::JumpBack, 6, 5);
    c.add_op(Op::LoopEnd, 6);
    c.add_op_u32(Op::Load, n_total, 7);
    c.add_op(Op::Exit, 7);

    let mut vm = Vm::new();
    let log = Value::list(vec![]);
    vm.define_global("hook_log", log.clone());
    vm.define_native("rec", record_hook);
    let v = vm.run_chunk(c).expect("run ok");
    assert_eq!(num(&v), 6.0);

    let entries = log.as_list().expect("liste");
    assert!(entries.borrow().is_empty(), "Iter ne doit pas déclencher on_change");
}

#[test]
fn hook_recursion_is_suppressed() {
    // le watcher réécrit gx depuis le hook : la garde coupe la récursion
    let mut watcher = Chunk::new();
    let n_gx = watcher.add_variable("gx");
    watcher.add_variable("nv");
    watcher.add_variable("ov");
    let k99 = watcher.add_constant(Constant::Number(99.0));
    watcher.add_op_u32(Op::LoadConst, k99, 1);
    watcher.add_op_u32(Op::Set, n_gx, 1);
    let tpl = FunctionTemplate {
        name: "watcher".into(),
        arity: 2,
        params: vec!["nv".into(), "ov".into()],
        chunk: watcher,
        ..FunctionTemplate::default()
    };

    let mut c = Chunk::new();
    let n_gx = c.add_variable("gx");
    let kf = c.add_constant(Constant::Function(tpl));
    let k5 = c.add_constant(Constant::Number(5.0));
    c.add_op_u32(Op::MakeFunction, kf, 1);
    c.add_op_u32(Op::HookOnChange, n_gx, 1);
    c.add_op_u32(Op::LoadConst, k5, 2);
    c.add_op_u32(Op::Set, n_gx, 2);
    c.add_op_u32(Op::LoadGlobal, n_gx, 3);
    c.add_op(Op::Exit, 3);

    let mut vm = Vm::new();
    vm.define_global("gx", vnum(1.0));
    let v = vm.run_chunk(c).expect("run ok (pas de boucle infinie)");
    assert_eq!(num(&v), 99.0);
}

// -----------------------------------------------------------------------------
// Imports
// -----------------------------------------------------------------------------

#[test]
fn import_exposes_publics_and_caches_identity() {
    let dir = temp_path("imports");
    fs::create_dir_all(&dir).expect("mkdir");

    // Module B : pi = 3.14, exporté
    let mut b = Chunk::new();
    let n_pi = b.add_variable("pi");
    let k_pi = b.add_constant(Constant::Number(3.14));
    b.add_op_u32(Op::LoadConst, k_pi, 1);
    b.add_op_u32(Op::StoreVar, n_pi, 1);
    b.add_op(Op::Exit, 1);
    b.public_variables.push("pi".into());
    write_chunk_file(&b, dir.join("B.vxc")).expect("écriture B.vxc");

    // Chunk A : importe B deux fois + lit B.pi
    let mut a = Chunk::with_import_path(dir.join("A.vtx").to_string_lossy().into_owned());
    let k_path = a.add_constant(Constant::Str("B".into()));
    let k_pi_name = a.add_constant(Constant::Str("pi".into()));
    a.add_op_u32(Op::LoadConst, k_path, 1);
    a.add_op(Op::Import, 1);
    a.add_op_u32(Op::LoadConst, k_path, 2);
    a.add_op(Op::Import, 2);
    a.add_op_u32(Op::LoadConst, k_path, 3);
    a.add_op(Op::Import, 3);
    a.add_op_u32(Op::Dot, k_pi_name, 3);
    a.add_op_u8(Op::BuildList, 3, 4);
    a.add_op(Op::Exit, 4);

    let v = run_ok(a);
    let ValueKind::List(items) = &v.kind else { panic!("attendu List, trouvé {v}") };
    let items = items.borrow();
    assert_eq!(items.len(), 3);
    assert!(values_equal(&items[2], &vnum(3.14)));
    match (&items[0].kind, &items[1].kind) {
        (ValueKind::Object(o1), ValueKind::Object(o2)) => {
            assert!(Rc::ptr_eq(o1, o2), "le cache doit rendre le même objet d'exports");
        }
        _ => panic!("attendu deux objets d'exports"),
    }

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn missing_import_raises_import_error() {
    let mut c = Chunk::new();
    let k = c.add_constant(Constant::Str("n_existe_pas".into()));
    c.add_op_u32(Op::LoadConst, k, 1);
    c.add_op(Op::Import, 1);
    c.add_op(Op::Exit, 1);
    assert_eq!(run_uncaught(c).kind, ErrorKind::Import);
}

// -----------------------------------------------------------------------------
// Host & stdlib
// -----------------------------------------------------------------------------

#[test]
fn print_goes_through_the_host() {
    let mut c = Chunk::new();
    let n_print = c.add_variable("print");
    let k = c.add_constant(Constant::Str("hello".into()));
    c.add_op_u32(Op::LoadGlobal, n_print, 1);
    c.add_op_u32(Op::LoadConst, k, 1);
    c.add_op_u8(Op::Call, 1, 1);
    c.add_op(Op::Exit, 1);

    let host = CaptureHost::default();
    let buf = host.buf.clone();
    let mut vm =
        Vm::with_options(VmOptions::default().with_stdlib(true)).with_host(Box::new(host));
    vm.run_chunk(c).expect("run ok");
    assert_eq!(buf.borrow().as_str(), "hello\n");
}

#[test]
fn host_callback_via_call_value() {
    // Le host rappelle une closure obtenue d'une exécution précédente.
    let mut body = Chunk::new();
    let n_x = body.add_variable("x");
    let k2 = body.add_constant(Constant::Number(2.0));
    body.add_op_u32(Op::Load, n_x, 1);
    body.add_op_u32(Op::LoadConst, k2, 1);
    body.add_op(Op::Multiply, 1);
    body.add_op(Op::Return, 1);
    let tpl = FunctionTemplate {
        name: "double".into(),
        arity: 1,
        params: vec!["x".into()],
        chunk: body,
        ..FunctionTemplate::default()
    };

    let mut c = Chunk::new();
    let kf = c.add_constant(Constant::Function(tpl));
    c.add_op_u32(Op::MakeFunction, kf, 1);
    c.add_op(Op::Exit, 1);

    let mut vm = Vm::new();
    let callback = vm.run_chunk(c).expect("run ok");
    let out = vm.call_value(callback, vec![vnum(21.0)]).expect("callback ok");
    assert_eq!(num(&out), 42.0);
}

#[test]
fn stdlib_rename_copies_function() {
    let mut body = Chunk::new();
    body.add_op(Op::Return, 1);
    let tpl = FunctionTemplate { name: "orig".into(), chunk: body, ..FunctionTemplate::default() };

    let mut c = Chunk::new();
    let n_rename = c.add_variable("rename");
    let kf = c.add_constant(Constant::Function(tpl));
    let k_name = c.add_constant(Constant::Str("copie".into()));
    c.add_op_u32(Op::LoadGlobal, n_rename, 1);
    c.add_op_u32(Op::MakeFunction, kf, 1);
    c.add_op_u32(Op::LoadConst, k_name, 1);
    c.add_op_u8(Op::Call, 2, 1);
    c.add_op(Op::Exit, 1);

    let mut vm = Vm::with_options(VmOptions::default().with_stdlib(true));
    let v = vm.run_chunk(c).expect("run ok");
    assert_eq!(v.to_string(), "<fn copie/0>");
}

#[test]
fn hoist_and_unhoist_natives() {
    let mut c = Chunk::new();
    let n_hoist = c.add_variable("hoist");
    let n_unhoist = c.add_variable("unhoist");
    let k = c.add_constant(Constant::Str("gardée".into()));
    c.add_op_u32(Op::LoadGlobal, n_hoist, 1);
    c.add_op_u32(Op::LoadConst, k, 1);
    c.add_op_u8(Op::Call, 1, 1); // token
    c.add_op_u32(Op::LoadGlobal, n_unhoist, 2);
    c.add_op(Op::SwapTos, 2);
    c.add_op_u8(Op::Call, 1, 2); // true
    c.add_op(Op::Exit, 2);

    let mut vm = Vm::with_options(VmOptions::default().with_stdlib(true));
    let v = vm.run_chunk(c).expect("run ok");
    assert!(v.truthy(), "unhoist doit trouver le token");
}

#[test]
fn string_helpers_via_natives() {
    let mut c = Chunk::new();
    let n_type_of = c.add_variable("type_of");
    let k = c.add_constant(Constant::Number(1.5));
    c.add_op_u32(Op::LoadGlobal, n_type_of, 1);
    c.add_op_u32(Op::LoadConst, k, 1);
    c.add_op_u8(Op::Call, 1, 1);
    c.add_op(Op::Exit, 1);
    let mut vm = Vm::with_options(VmOptions::default().with_stdlib(true));
    assert_eq!(vm.run_chunk(c).expect("run ok").to_string(), "Number");
}
