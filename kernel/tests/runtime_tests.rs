//! Managed-runtime integration suites: the execution-model properties
//! (dispatch, boxing, checked arithmetic, initializer protocol, async
//! builders) driven through the public runtime surface.

use std::sync::Arc;

use proton_kernel::jit::il::{self, MethodSig, Op, Value, ValueKind};
use proton_kernel::jit::interp::{self, ExecError};
use proton_kernel::rt::builder::{AsyncTaskOfBuilder, AsyncValueTaskOfBuilder, StateMachine, Step, ValueTask};
use proton_kernel::rt::task::{ManagedTask, TaskRef, TaskStatus};
use proton_kernel::rt::types::{TypeBuilder, TypeKind};
use proton_kernel::rt::{builtins, delegate::Delegate, exception};

fn expect_i32(result: Result<Option<Value>, ExecError>) -> i32 {
    match result {
        Ok(Some(Value::I32(v))) => v,
        other => panic!("expected i32, got {:?}", other),
    }
}

#[test]
fn compile_and_invoke_fib_semantics() {
    // `return Fib(10)` with the classic recursive definition is 55; the
    // interpreter carries the semantics and the compiler accepts the
    // same body.
    let fib = il::register_recursive("FibIT", MethodSig::new(1, true), 0, |me| {
        vec![
            Op::LoadArg(0),
            Op::ConstI32(2),
            Op::LtS,
            Op::BrFalse(6),
            Op::LoadArg(0),
            Op::Ret,
            Op::LoadArg(0),
            Op::ConstI32(1),
            Op::Sub,
            Op::Call(me),
            Op::LoadArg(0),
            Op::ConstI32(2),
            Op::Sub,
            Op::Call(me),
            Op::Add,
            Op::Ret,
        ]
    });
    assert_eq!(expect_i32(interp::call(fib, &[Value::I32(10)])), 55);
    assert_ne!(proton_kernel::jit::compile(fib).unwrap(), 0);
}

#[test]
fn before_field_init_defers_and_runs_exactly_once() {
    let ty = TypeBuilder::new("ITAnswer", TypeKind::Class)
        .static_field("Value", ValueKind::I32)
        .static_field("Runs", ValueKind::I32)
        .before_field_init()
        .define()
        .unwrap();
    let cctor = il::register_method(
        "ITAnswer..cctor",
        MethodSig::new(0, false),
        0,
        vec![
            Op::ConstI32(42),
            Op::StoreStatic(ty, 0),
            Op::LoadStatic(ty, 1),
            Op::ConstI32(1),
            Op::Add,
            Op::StoreStatic(ty, 1),
            Op::Ret,
        ],
        vec![],
        vec![],
        None,
    );
    proton_kernel::rt::types::get(ty).set_initializer(cctor);

    let read_a = il::register_method(
        "ITReadA",
        MethodSig::new(0, true),
        0,
        vec![Op::LoadStatic(ty, 0), Op::Ret],
        vec![],
        vec![],
        None,
    );
    let read_b = il::register_method(
        "ITReadB",
        MethodSig::new(0, true),
        0,
        vec![Op::LoadStatic(ty, 0), Op::Ret],
        vec![],
        vec![],
        None,
    );
    assert_eq!(expect_i32(interp::call(read_a, &[])), 42);
    assert_eq!(expect_i32(interp::call(read_b, &[])), 42);
    assert_eq!(proton_kernel::rt::types::get(ty).statics.lock()[1], 1);
}

#[test]
fn dispatch_properties_hold_across_a_three_level_chain() {
    let speak = |name: &str, value: i32| {
        il::register_method(
            name,
            MethodSig::new(1, true),
            0,
            vec![Op::ConstI32(value), Op::Ret],
            vec![],
            vec![],
            None,
        )
    };
    let base_m = speak("ITChain::Base.Speak", 1);
    let mid_m = speak("ITChain::Mid.Speak", 2);
    let base = TypeBuilder::new("ITChainBase", TypeKind::Class)
        .virtual_method(base_m)
        .define()
        .unwrap();
    let mid = TypeBuilder::new("ITChainMid", TypeKind::Class)
        .supertype(base)
        .override_method(0, mid_m)
        .define()
        .unwrap();
    // Leaf does not override: it inherits the mid override.
    let leaf = TypeBuilder::new("ITChainLeaf", TypeKind::Class)
        .supertype(mid)
        .define()
        .unwrap();

    let call_through = |ty| {
        il::register_method(
            "ITChainCall",
            MethodSig::new(0, true),
            0,
            vec![Op::NewObject(ty), Op::CallVirt(0, 1), Op::Ret],
            vec![],
            vec![],
            None,
        )
    };
    assert_eq!(expect_i32(interp::call(call_through(base), &[])), 1);
    assert_eq!(expect_i32(interp::call(call_through(mid), &[])), 2);
    // Most-derived override along the leaf's supertype chain.
    assert_eq!(expect_i32(interp::call(call_through(leaf), &[])), 2);
}

#[test]
fn explicit_and_implicit_interface_implementations_stay_distinct() {
    let explicit_m = il::register_method(
        "ITExpl::I.Get",
        MethodSig::new(1, true),
        0,
        vec![Op::ConstI32(10), Op::Ret],
        vec![],
        vec![],
        None,
    );
    let implicit_m = il::register_method(
        "ITExpl::Get",
        MethodSig::new(1, true),
        0,
        vec![Op::ConstI32(20), Op::Ret],
        vec![],
        vec![],
        None,
    );
    let iface_a = TypeBuilder::new("ITGetA", TypeKind::Interface)
        .interface_method("Get", None)
        .define()
        .unwrap();
    let iface_b = TypeBuilder::new("ITGetB", TypeKind::Interface)
        .interface_method("Get", None)
        .define()
        .unwrap();
    let t = TypeBuilder::new("ITGetImpl", TypeKind::Class)
        .implement(iface_a, vec![(0, explicit_m)])
        .implement(iface_b, vec![(0, implicit_m)])
        .define()
        .unwrap();

    let through = |iface| {
        il::register_method(
            "ITGetThrough",
            MethodSig::new(0, true),
            0,
            vec![
                Op::NewObject(t),
                Op::CallInterface(iface, 0, 1),
                Op::Ret,
            ],
            vec![],
            vec![],
            None,
        )
    };
    assert_eq!(expect_i32(interp::call(through(iface_a), &[])), 10);
    assert_eq!(expect_i32(interp::call(through(iface_b), &[])), 20);
}

#[test]
fn unbox_to_same_type_is_identity_and_mismatch_is_fatal() {
    builtins::ensure();
    let same = il::register_method(
        "ITBoxSame",
        MethodSig::new(0, true),
        0,
        vec![
            Op::ConstI32(-55),
            Op::Box(builtins::int32()),
            Op::Unbox(builtins::int32()),
            Op::Ret,
        ],
        vec![],
        vec![],
        None,
    );
    assert_eq!(expect_i32(interp::call(same, &[])), -55);

    let mismatch = il::register_method(
        "ITBoxMismatch",
        MethodSig::new(0, true),
        0,
        vec![
            Op::ConstI32(1),
            Op::Box(builtins::int32()),
            Op::Unbox(builtins::double()),
            Op::Ret,
        ],
        vec![],
        vec![],
        None,
    );
    match interp::call(mismatch, &[]) {
        Err(ExecError::Exception(exc)) => {
            assert_eq!(exc.type_of().id, builtins::invalid_cast_exception());
        }
        other => panic!("expected invalid-cast, got {:?}", other),
    }
}

#[test]
fn nullable_boxing_follows_the_flag() {
    builtins::ensure();
    let boxed = il::register_method(
        "ITNullableSome",
        MethodSig::new(0, true),
        0,
        vec![
            Op::ConstI32(5),
            Op::ConstI32(1), // has-value
            Op::BoxNullable(builtins::int32()),
            Op::Unbox(builtins::int32()),
            Op::Ret,
        ],
        vec![],
        vec![],
        None,
    );
    assert_eq!(expect_i32(interp::call(boxed, &[])), 5);

    let empty = il::register_method(
        "ITNullableNone",
        MethodSig::new(0, true),
        0,
        vec![
            Op::ConstI32(5),
            Op::ConstI32(0),
            Op::BoxNullable(builtins::int32()),
            Op::Ret,
        ],
        vec![],
        vec![],
        None,
    );
    assert_eq!(interp::call(empty, &[]).unwrap(), Some(Value::Null));
}

#[test]
fn checked_overflow_throws_and_unchecked_wraps() {
    let checked = il::register_method(
        "ITCheckedMax",
        MethodSig::new(0, true),
        0,
        vec![
            Op::ConstI32(i32::MAX),
            Op::ConstI32(1),
            Op::CheckedAdd,
            Op::Ret,
        ],
        vec![],
        vec![],
        None,
    );
    match interp::call(checked, &[]) {
        Err(ExecError::Exception(exc)) => {
            assert_eq!(exc.type_of().id, builtins::overflow_exception());
        }
        other => panic!("expected overflow, got {:?}", other),
    }

    let wrapping = il::register_method(
        "ITWrapMax",
        MethodSig::new(0, true),
        0,
        vec![Op::ConstI32(i32::MAX), Op::ConstI32(1), Op::Add, Op::Ret],
        vec![],
        vec![],
        None,
    );
    assert_eq!(expect_i32(interp::call(wrapping, &[])), i32::MIN);
}

#[test]
fn delegate_reassignment_is_observable_without_a_barrier() {
    let double = il::register_method(
        "ITDouble",
        MethodSig::new(1, true),
        0,
        vec![Op::LoadArg(0), Op::ConstI32(2), Op::Mul, Op::Ret],
        vec![],
        vec![],
        None,
    );
    let triple = il::register_method(
        "ITTriple",
        MethodSig::new(1, true),
        0,
        vec![Op::LoadArg(0), Op::ConstI32(3), Op::Mul, Op::Ret],
        vec![],
        vec![],
        None,
    );

    let mut d = Delegate::bound_static(double);
    let args = d.call_args(&[Value::I32(7)]);
    assert_eq!(expect_i32(interp::call(d.method, &args)), 14);

    d.rebind(triple, None);
    let args = d.call_args(&[Value::I32(7)]);
    assert_eq!(expect_i32(interp::call(d.method, &args)), 21);
}

#[test]
fn function_pointer_arguments_reach_the_callee_unchanged() {
    let pack = il::register_method(
        "ITPack",
        MethodSig::new(3, true),
        0,
        // a*1000000 + b*1000 + c, so argument order is observable.
        vec![
            Op::LoadArg(0),
            Op::ConstI32(1_000_000),
            Op::Mul,
            Op::LoadArg(1),
            Op::ConstI32(1000),
            Op::Mul,
            Op::Add,
            Op::LoadArg(2),
            Op::Add,
            Op::Ret,
        ],
        vec![],
        vec![],
        None,
    );
    let caller = il::register_method(
        "ITPackCall",
        MethodSig::new(0, true),
        0,
        vec![
            Op::ConstI32(1),
            Op::ConstI32(2),
            Op::ConstI32(3),
            Op::LoadFn(pack),
            Op::CallIndirect(3, true),
            Op::Ret,
        ],
        vec![],
        vec![],
        None,
    );
    assert_eq!(expect_i32(interp::call(caller, &[])), 1_002_003);
}

/// One-await machine used by the builder suites.
#[derive(Clone)]
struct AwaitOnce {
    state: i32,
    source: TaskRef,
}

impl StateMachine for AwaitOnce {
    fn move_next(&mut self) -> Step {
        match self.state {
            0 => {
                self.state = 1;
                Step::Await(Arc::clone(&self.source))
            }
            _ => match self.source.result() {
                Some(v) => Step::Done(Some(v)),
                None => Step::Done(None),
            },
        }
    }
}

#[test]
fn builder_suspends_then_completes_through_the_continuation() {
    let source = ManagedTask::pending();
    let builder = AsyncTaskOfBuilder::create();
    let mut machine = AwaitOnce {
        state: 0,
        source: Arc::clone(&source),
    };
    builder.start(&mut machine);
    assert_eq!(builder.task().status(), TaskStatus::Pending);

    source.complete(Some(Value::I64(7)));
    assert_eq!(builder.task().status(), TaskStatus::Succeeded);
    assert_eq!(builder.task().result(), Some(Value::I64(7)));
}

#[test]
fn value_task_inline_result_requires_no_suspension() {
    #[derive(Clone)]
    struct Immediate;
    impl StateMachine for Immediate {
        fn move_next(&mut self) -> Step {
            Step::Done(Some(Value::I64(11)))
        }
    }

    let builder = AsyncValueTaskOfBuilder::create();
    builder.start(&mut Immediate);
    match builder.value_task() {
        ValueTask::Inline(v) => assert_eq!(v, Some(Value::I64(11))),
        ValueTask::Pending(_) => panic!("no suspension occurred; result must be inline"),
    }
}

#[test]
fn canceled_awaitable_surfaces_its_token() {
    let token = builtins::new_cancellation_token();
    let source = ManagedTask::canceled(token);
    let exc = source.exception().expect("canceled task carries exception");
    assert_eq!(exception::cancellation_token_of(exc), Some(token));
    assert_eq!(source.status(), TaskStatus::Canceled);
}
