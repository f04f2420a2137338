//! Built-in runtime types.
//!
//! Registered once at runtime bring-up: the primitive value types used by
//! boxing, the root exception type, and the specialized exception types
//! the execution engine throws itself (overflow, invalid cast, null
//! reference, cancellation, aggregate).

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Once;

use crate::jit::il::ValueKind;
use crate::rt::types::{TypeBuilder, TypeId, TypeKind};

struct Builtins {
    int32: TypeId,
    int64: TypeId,
    double: TypeId,
    boolean: TypeId,
    exception: TypeId,
    overflow: TypeId,
    invalid_cast: TypeId,
    null_reference: TypeId,
    divide_by_zero: TypeId,
    type_init: TypeId,
    cancellation: TypeId,
    aggregate: TypeId,
}

static BUILTINS: Once<Builtins> = Once::new();

/// Field indices on the root exception type.
pub const EXC_FIELD_MESSAGE: usize = 0;
pub const EXC_FIELD_INNER: usize = 1;
/// Extra field on cancellation exceptions: the carried token id.
pub const EXC_FIELD_TOKEN: usize = 2;

fn define_all() -> Builtins {
    let prim = |name: &str, kind: ValueKind| {
        TypeBuilder::new(name, TypeKind::ValueType)
            .field("m_value", kind)
            .sealed()
            .define()
            .expect("primitive type definition cannot fail")
    };
    let int32 = prim("System.Int32", ValueKind::I32);
    let int64 = prim("System.Int64", ValueKind::I64);
    let double = prim("System.Double", ValueKind::F64);
    let boolean = prim("System.Boolean", ValueKind::I32);

    let exception = TypeBuilder::new("System.Exception", TypeKind::Class)
        // Interned message id and the inner-exception link.
        .field("_message", ValueKind::I64)
        .field("_inner", ValueKind::Ref)
        .define()
        .expect("exception type definition cannot fail");
    let derived = |name: &str| {
        TypeBuilder::new(name, TypeKind::Class)
            .supertype(exception)
            .define()
            .expect("exception subtype definition cannot fail")
    };
    let overflow = derived("System.OverflowException");
    let invalid_cast = derived("System.InvalidCastException");
    let null_reference = derived("System.NullReferenceException");
    let divide_by_zero = derived("System.DivideByZeroException");
    let type_init = derived("System.TypeInitializationException");
    let cancellation = TypeBuilder::new("System.OperationCanceledException", TypeKind::Class)
        .supertype(exception)
        .field("_token", ValueKind::I64)
        .define()
        .expect("exception subtype definition cannot fail");
    // Aggregate failures chain their children through the inner link.
    let aggregate = derived("System.AggregateException");

    Builtins {
        int32,
        int64,
        double,
        boolean,
        exception,
        overflow,
        invalid_cast,
        null_reference,
        divide_by_zero,
        type_init,
        cancellation,
        aggregate,
    }
}

/// Register the built-in types; idempotent.
pub fn ensure() {
    BUILTINS.call_once(define_all);
}

fn builtins() -> &'static Builtins {
    BUILTINS.call_once(define_all)
}

pub fn int32() -> TypeId {
    builtins().int32
}

pub fn int64() -> TypeId {
    builtins().int64
}

pub fn double() -> TypeId {
    builtins().double
}

pub fn boolean() -> TypeId {
    builtins().boolean
}

pub fn exception() -> TypeId {
    builtins().exception
}

pub fn overflow_exception() -> TypeId {
    builtins().overflow
}

pub fn invalid_cast_exception() -> TypeId {
    builtins().invalid_cast
}

pub fn null_reference_exception() -> TypeId {
    builtins().null_reference
}

pub fn divide_by_zero_exception() -> TypeId {
    builtins().divide_by_zero
}

pub fn type_init_exception() -> TypeId {
    builtins().type_init
}

pub fn cancellation_exception() -> TypeId {
    builtins().cancellation
}

pub fn aggregate_exception() -> TypeId {
    builtins().aggregate
}

/// Monotonic cancellation-token ids.
static NEXT_TOKEN: AtomicU32 = AtomicU32::new(1);

pub fn new_cancellation_token() -> u32 {
    NEXT_TOKEN.fetch_add(1, Ordering::AcqRel)
}
