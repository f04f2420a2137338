//! Exception objects.
//!
//! An exception is an ordinary managed object whose type derives from the
//! root exception type: a message (interned), an inner-exception link used
//! both for wrapped causes and for aggregate failure lists, and — on
//! cancellation exceptions — the carried token. The unwinding machinery
//! itself lives with the interpreter and the compiled-code trampolines;
//! this module is the object model they throw.

use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

use crate::jit::il::Value;
use crate::rt::builtins::{self, EXC_FIELD_INNER, EXC_FIELD_MESSAGE, EXC_FIELD_TOKEN};
use crate::rt::object::ObjRef;
use crate::rt::types::{self, TypeId};

/// Interned exception messages; slot 0 is the empty message.
static MESSAGES: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn intern(message: &str) -> u64 {
    let mut table = MESSAGES.lock();
    if table.is_empty() {
        table.push(String::new());
    }
    if message.is_empty() {
        return 0;
    }
    table.push(String::from(message));
    (table.len() - 1) as u64
}

/// Construct an exception object of `ty` (which must derive the root
/// exception type) carrying `message`.
pub fn new_exception(ty: TypeId, message: &str) -> ObjRef {
    builtins::ensure();
    debug_assert!(
        types::is_subtype(ty, builtins::exception()),
        "exception types derive System.Exception"
    );
    let obj = ObjRef::allocate(types::get(ty));
    obj.set_field(EXC_FIELD_MESSAGE, Value::I64(intern(message) as i64));
    obj
}

/// The message an exception was constructed with.
pub fn message_of(exc: ObjRef) -> String {
    let id = match exc.field(EXC_FIELD_MESSAGE) {
        Value::I64(v) => v as usize,
        _ => 0,
    };
    let table = MESSAGES.lock();
    table.get(id).cloned().unwrap_or_default()
}

/// Link `inner` as the cause of `exc`.
pub fn set_inner(exc: ObjRef, inner: ObjRef) {
    exc.set_field(EXC_FIELD_INNER, Value::Ref(inner));
}

/// The inner exception, if any.
pub fn inner_of(exc: ObjRef) -> Option<ObjRef> {
    match exc.field(EXC_FIELD_INNER) {
        Value::Ref(obj) => Some(obj),
        _ => None,
    }
}

/// Build an aggregate exception over `children`; they are threaded through
/// the inner links in order.
pub fn new_aggregate(message: &str, children: &[ObjRef]) -> ObjRef {
    let agg = new_exception(builtins::aggregate_exception(), message);
    let mut cursor = agg;
    for &child in children {
        set_inner(cursor, child);
        cursor = child;
    }
    agg
}

/// Flatten an aggregate's inner list.
pub fn inner_list(exc: ObjRef) -> Vec<ObjRef> {
    let mut out = Vec::new();
    let mut cursor = inner_of(exc);
    while let Some(e) = cursor {
        out.push(e);
        cursor = inner_of(e);
    }
    out
}

// Constructors for the exceptions the execution engine itself raises.

pub fn overflow(operation: &str) -> ObjRef {
    new_exception(builtins::overflow_exception(), operation)
}

pub fn invalid_cast(message: &str) -> ObjRef {
    new_exception(builtins::invalid_cast_exception(), message)
}

pub fn null_reference() -> ObjRef {
    new_exception(builtins::null_reference_exception(), "null reference")
}

/// Cancellation carries its token so an await site can tell which source
/// fired.
pub fn cancellation(token: u32) -> ObjRef {
    let exc = new_exception(builtins::cancellation_exception(), "operation canceled");
    exc.set_field(EXC_FIELD_TOKEN, Value::I64(token as i64));
    exc
}

pub fn cancellation_token_of(exc: ObjRef) -> Option<u32> {
    if exc.type_of().id != builtins::cancellation_exception() {
        return None;
    }
    match exc.field(EXC_FIELD_TOKEN) {
        Value::I64(v) => Some(v as u32),
        _ => None,
    }
}
