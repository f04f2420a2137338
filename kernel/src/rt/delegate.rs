//! Delegates and function pointers.
//!
//! A delegate binds a code pointer with an optional receiver; invocation
//! passes the bound receiver as the first argument when present. Closures
//! with captures become a heap-allocated environment record referenced by
//! the receiver field. A bare function pointer has no receiver and is an
//! indirect call with the arguments as given.
//!
//! Re-binding replaces both fields; within a single thread the new pair is
//! observed together (the two-word store is not torn across a call made by
//! the same thread).

use alloc::vec::Vec;

use crate::jit::il::{MethodId, Value};
use crate::rt::object::ObjRef;

/// `{code, receiver}` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delegate {
    pub method: MethodId,
    pub receiver: Option<ObjRef>,
}

impl Delegate {
    /// Bind a static method: no receiver.
    pub fn bound_static(method: MethodId) -> Self {
        Self {
            method,
            receiver: None,
        }
    }

    /// Bind an instance method (or a closure body with its environment
    /// record as the receiver).
    pub fn bound(method: MethodId, receiver: ObjRef) -> Self {
        Self {
            method,
            receiver: Some(receiver),
        }
    }

    /// Replace both fields.
    pub fn rebind(&mut self, method: MethodId, receiver: Option<ObjRef>) {
        self.method = method;
        self.receiver = receiver;
    }

    /// The argument vector the callee actually sees: the receiver, when
    /// bound, is prepended as argument 0.
    pub fn call_args(&self, args: &[Value]) -> Vec<Value> {
        let mut out = Vec::with_capacity(args.len() + 1);
        if let Some(receiver) = self.receiver {
            out.push(Value::Ref(receiver));
        }
        out.extend_from_slice(args);
        out
    }
}
