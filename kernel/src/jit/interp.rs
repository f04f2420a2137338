//! Bytecode interpreter.
//!
//! The reference execution vehicle: it implements the exact semantics the
//! compiled code must match (checked arithmetic, dispatch, type-init
//! triggers, handler-range unwinding) over the same [`Method`]
//! representation, and carries bootstrap execution before the code buffer
//! is live. Handler clauses are listed inner-to-outer in method bodies,
//! so a linear scan finds the innermost cover first.

use alloc::vec::Vec;

use crate::error::KernelError;
use crate::jit::il::{self, HandlerKind, Method, MethodId, Op, Value};
use crate::rt::builtins;
use crate::rt::exception;
use crate::rt::object::{self, ObjRef};
use crate::rt::typeinit::{self, InitOutcome};
use crate::rt::types;

/// How a managed execution can fail.
#[derive(Debug)]
pub enum ExecError {
    /// A managed exception escaped the outermost frame given to `call`.
    Exception(ObjRef),
    /// The engine itself met malformed or unsupported bytecode.
    Engine(KernelError),
}

pub type ExecResult<T> = Result<T, ExecError>;

fn engine(err: KernelError) -> ExecError {
    ExecError::Engine(err)
}

fn throw(exc: ObjRef) -> ExecError {
    ExecError::Exception(exc)
}

/// Run a type's initializer if its sentinel demands it; a Faulted sentinel
/// re-raises on every subsequent use.
pub fn ensure_type_initialized(ty: types::TypeId) -> ExecResult<()> {
    let desc = types::get(ty);
    let Some(init) = desc.initializer() else {
        return Ok(());
    };
    let outcome = typeinit::ensure(desc, || match call(init, &[]) {
        Ok(_) => Ok(()),
        Err(ExecError::Exception(exc)) => Err(exc),
        Err(ExecError::Engine(_)) => Err(exception::new_exception(
            builtins::exception(),
            "engine fault in type initializer",
        )),
    });
    match outcome {
        InitOutcome::Ready => Ok(()),
        InitOutcome::Faulted(inner) => {
            let exc =
                exception::new_exception(builtins::type_init_exception(), &desc.name);
            if let Some(inner) = inner {
                exception::set_inner(exc, inner);
            }
            Err(throw(exc))
        }
    }
}

/// Invoke a method with `args`, returning its result value if the
/// signature declares one.
pub fn call(method: MethodId, args: &[Value]) -> ExecResult<Option<Value>> {
    let m = il::method(method);
    if args.len() != m.sig.params as usize {
        return Err(engine(KernelError::InvalidArgument { name: "args" }));
    }
    // Types not flagged before-field-init initialize on any method entry.
    if let Some(ty) = m.declaring_type {
        if !types::get(ty).before_field_init {
            ensure_type_initialized(ty)?;
        }
    }
    Frame::new(m, args).run()
}

/// In-flight unwind bookkeeping while a finally/fault body runs.
enum Control {
    /// An exception is travelling; resume the handler scan at this clause
    /// index when the current handler body ends.
    Unwinding {
        exc: ObjRef,
        from_pc: usize,
        resume_idx: usize,
    },
    /// A `leave` is travelling towards `target`.
    Leaving {
        target: usize,
        from_pc: usize,
        resume_idx: usize,
    },
}

struct Frame<'m> {
    m: &'m Method,
    stack: Vec<Value>,
    locals: Vec<Value>,
    args: Vec<Value>,
    pc: usize,
    control: Vec<Control>,
    /// Exceptions of the catch handlers currently being executed,
    /// innermost last; `rethrow` re-raises the top one.
    active_catches: Vec<ObjRef>,
}

impl<'m> Frame<'m> {
    fn new(m: &'m Method, args: &[Value]) -> Self {
        Self {
            m,
            stack: Vec::new(),
            locals: alloc::vec![Value::Null; m.locals as usize],
            args: args.to_vec(),
            pc: 0,
            control: Vec::new(),
            active_catches: Vec::new(),
        }
    }

    fn pop(&mut self) -> ExecResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| engine(KernelError::UnsupportedBytecode {
                opcode: "stack underflow",
            }))
    }

    fn pop_obj(&mut self) -> ExecResult<ObjRef> {
        match self.pop()? {
            Value::Ref(obj) => Ok(obj),
            Value::Null => Err(throw(exception::null_reference())),
            _ => Err(engine(KernelError::UnsupportedBytecode {
                opcode: "reference expected",
            })),
        }
    }

    fn pop_args(&mut self, count: usize) -> ExecResult<Vec<Value>> {
        let mut out = alloc::vec![Value::Null; count];
        for slot in out.iter_mut().rev() {
            *slot = self.pop()?;
        }
        Ok(out)
    }

    /// Route `exc` starting at handler clause `start_idx`. Returns false
    /// when no clause in this frame takes it.
    fn dispatch_exception(&mut self, exc: ObjRef, from_pc: usize, start_idx: usize) -> bool {
        for idx in start_idx..self.m.handlers.len() {
            let h = self.m.handlers[idx];
            if !h.covers(from_pc) {
                continue;
            }
            match h.kind {
                HandlerKind::Catch(ty) if types::is_instance(exc.type_of().id, ty) => {
                    self.stack.clear();
                    self.stack.push(Value::Ref(exc));
                    self.active_catches.push(exc);
                    self.pc = h.handler_start;
                    return true;
                }
                HandlerKind::Catch(_) => {}
                HandlerKind::Finally | HandlerKind::Fault => {
                    self.control.push(Control::Unwinding {
                        exc,
                        from_pc,
                        resume_idx: idx + 1,
                    });
                    self.stack.clear();
                    self.pc = h.handler_start;
                    return true;
                }
            }
        }
        false
    }

    /// Route a `leave` towards `target`, running intervening finally
    /// bodies (not fault bodies) one at a time.
    fn dispatch_leave(&mut self, target: usize, from_pc: usize, start_idx: usize) {
        // Leaving a catch handler body closes its scope.
        let closing = self
            .m
            .handlers
            .iter()
            .filter(|h| {
                matches!(h.kind, HandlerKind::Catch(_))
                    && from_pc >= h.handler_start
                    && from_pc < h.handler_end
                    && !(target >= h.handler_start && target < h.handler_end)
            })
            .count();
        for _ in 0..closing {
            self.active_catches.pop();
        }
        for idx in start_idx..self.m.handlers.len() {
            let h = self.m.handlers[idx];
            if h.kind != HandlerKind::Finally {
                continue;
            }
            let leaving_try = h.covers(from_pc) && !h.covers(target);
            if leaving_try {
                self.control.push(Control::Leaving {
                    target,
                    from_pc,
                    resume_idx: idx + 1,
                });
                self.stack.clear();
                self.pc = h.handler_start;
                return;
            }
        }
        self.pc = target;
    }

    fn run(mut self) -> ExecResult<Option<Value>> {
        loop {
            if self.pc >= self.m.body.len() {
                return Err(engine(KernelError::UnsupportedBytecode {
                    opcode: "fell off method body",
                }));
            }
            let op = self.m.body[self.pc];
            self.pc += 1;
            match self.step(op) {
                Ok(Some(ret)) => return Ok(ret),
                Ok(None) => {}
                Err(ExecError::Exception(exc)) => {
                    // pc already advanced; the faulting site is pc - 1.
                    self.pc -= 1;
                    let at = self.pc;
                    if !self.dispatch_exception(exc, at, 0) {
                        return Err(throw(exc));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Execute one op. `Ok(Some(..))` is a method return.
    #[allow(clippy::too_many_lines)]
    fn step(&mut self, op: Op) -> ExecResult<Option<Option<Value>>> {
        match op {
            Op::ConstI32(v) => self.stack.push(Value::I32(v)),
            Op::ConstI64(v) => self.stack.push(Value::I64(v)),
            Op::ConstF64(v) => self.stack.push(Value::F64(v)),
            Op::ConstNull => self.stack.push(Value::Null),
            Op::LoadArg(i) => {
                let v = *self
                    .args
                    .get(i as usize)
                    .ok_or_else(|| engine(KernelError::InvalidArgument { name: "arg index" }))?;
                self.stack.push(v);
            }
            Op::LoadLocal(i) => {
                let v = *self
                    .locals
                    .get(i as usize)
                    .ok_or_else(|| engine(KernelError::InvalidArgument { name: "local index" }))?;
                self.stack.push(v);
            }
            Op::StoreLocal(i) => {
                let v = self.pop()?;
                *self
                    .locals
                    .get_mut(i as usize)
                    .ok_or_else(|| engine(KernelError::InvalidArgument { name: "local index" }))? =
                    v;
            }
            Op::Dup => {
                let v = *self.stack.last().ok_or_else(|| {
                    engine(KernelError::UnsupportedBytecode {
                        opcode: "dup on empty stack",
                    })
                })?;
                self.stack.push(v);
            }
            Op::Pop => {
                self.pop()?;
            }

            Op::Add => self.binary_int(i32::wrapping_add, i64::wrapping_add, Some(|a, b| a + b))?,
            Op::Sub => self.binary_int(i32::wrapping_sub, i64::wrapping_sub, Some(|a, b| a - b))?,
            Op::Mul => self.binary_int(i32::wrapping_mul, i64::wrapping_mul, Some(|a, b| a * b))?,
            Op::DivS => self.divide(false)?,
            Op::DivU => self.divide(true)?,
            Op::RemS => {
                let (a, b) = self.pop_pair()?;
                let v = match (a, b) {
                    (Value::I32(a), Value::I32(b)) => {
                        if b == 0 {
                            return Err(throw(exception::new_exception(
                                builtins::divide_by_zero_exception(),
                                "remainder by zero",
                            )));
                        }
                        Value::I32(a.wrapping_rem(b))
                    }
                    (Value::I64(a), Value::I64(b)) => {
                        if b == 0 {
                            return Err(throw(exception::new_exception(
                                builtins::divide_by_zero_exception(),
                                "remainder by zero",
                            )));
                        }
                        Value::I64(a.wrapping_rem(b))
                    }
                    _ => return Err(self.type_mismatch("rem")),
                };
                self.stack.push(v);
            }
            Op::CheckedAdd => self.checked(i32::checked_add, i64::checked_add, "checked add")?,
            Op::CheckedSub => self.checked(i32::checked_sub, i64::checked_sub, "checked sub")?,
            Op::CheckedMul => self.checked(i32::checked_mul, i64::checked_mul, "checked mul")?,
            Op::CheckedConvI32 => {
                let v = self.pop()?;
                let wide = match v {
                    Value::I64(v) => v,
                    Value::I32(v) => v as i64,
                    _ => return Err(self.type_mismatch("conv")),
                };
                let narrowed = i32::try_from(wide).map_err(|_| {
                    throw(exception::overflow("checked conversion to int32"))
                })?;
                self.stack.push(Value::I32(narrowed));
            }
            Op::ConvI32 => {
                let v = self.pop()?;
                let wide = match v {
                    Value::I64(v) => v,
                    Value::I32(v) => v as i64,
                    _ => return Err(self.type_mismatch("conv")),
                };
                self.stack.push(Value::I32(wide as i32));
            }
            Op::ConvI64 => {
                let v = self.pop()?;
                let wide = match v {
                    Value::I32(v) => v as i64,
                    Value::I64(v) => v,
                    _ => return Err(self.type_mismatch("conv")),
                };
                self.stack.push(Value::I64(wide));
            }
            Op::ConvF64 => {
                let v = self.pop()?;
                let f = match v {
                    Value::I32(v) => v as f64,
                    Value::I64(v) => v as f64,
                    Value::F64(v) => v,
                    _ => return Err(self.type_mismatch("conv")),
                };
                self.stack.push(Value::F64(f));
            }
            Op::ConvI64FromF64 => {
                let v = self.pop()?;
                let f = match v {
                    Value::F64(v) => v,
                    _ => return Err(self.type_mismatch("conv")),
                };
                self.stack.push(Value::I64(f as i64));
            }
            Op::Neg => {
                let v = self.pop()?;
                let out = match v {
                    Value::I32(v) => Value::I32(v.wrapping_neg()),
                    Value::I64(v) => Value::I64(v.wrapping_neg()),
                    Value::F64(v) => Value::F64(-v),
                    _ => return Err(self.type_mismatch("neg")),
                };
                self.stack.push(out);
            }

            Op::And => self.binary_int(|a, b| a & b, |a, b| a & b, None)?,
            Op::Or => self.binary_int(|a, b| a | b, |a, b| a | b, None)?,
            Op::Xor => self.binary_int(|a, b| a ^ b, |a, b| a ^ b, None)?,
            Op::Not => {
                let v = self.pop()?;
                let out = match v {
                    Value::I32(v) => Value::I32(!v),
                    Value::I64(v) => Value::I64(!v),
                    _ => return Err(self.type_mismatch("not")),
                };
                self.stack.push(out);
            }
            Op::Shl => self.shift(|a, s| a.wrapping_shl(s), |a, s| a.wrapping_shl(s))?,
            Op::ShrS => self.shift(|a, s| a.wrapping_shr(s), |a, s| a.wrapping_shr(s))?,
            Op::ShrU => self.shift(
                |a, s| (a as u32).wrapping_shr(s) as i32,
                |a, s| (a as u64).wrapping_shr(s) as i64,
            )?,

            Op::Eq => self.compare(|o| o == core::cmp::Ordering::Equal, false)?,
            Op::Ne => self.compare(|o| o != core::cmp::Ordering::Equal, false)?,
            Op::LtS => self.compare(|o| o == core::cmp::Ordering::Less, false)?,
            Op::LeS => self.compare(|o| o != core::cmp::Ordering::Greater, false)?,
            Op::GtS => self.compare(|o| o == core::cmp::Ordering::Greater, false)?,
            Op::GeS => self.compare(|o| o != core::cmp::Ordering::Less, false)?,
            Op::LtU => self.compare(|o| o == core::cmp::Ordering::Less, true)?,
            Op::GeU => self.compare(|o| o != core::cmp::Ordering::Less, true)?,

            Op::Br(target) => self.pc = target,
            Op::BrTrue(target) => {
                if self.pop()?.is_true() {
                    self.pc = target;
                }
            }
            Op::BrFalse(target) => {
                if !self.pop()?.is_true() {
                    self.pc = target;
                }
            }
            Op::Leave(target) => {
                let from = self.pc - 1;
                self.dispatch_leave(target, from, 0);
            }
            Op::EndFinally => match self.control.pop() {
                Some(Control::Unwinding {
                    exc,
                    from_pc,
                    resume_idx,
                }) => {
                    if !self.dispatch_exception(exc, from_pc, resume_idx) {
                        return Err(throw(exc));
                    }
                }
                Some(Control::Leaving {
                    target,
                    from_pc,
                    resume_idx,
                }) => self.dispatch_leave(target, from_pc, resume_idx),
                None => {
                    return Err(engine(KernelError::UnsupportedBytecode {
                        opcode: "endfinally outside handler",
                    }))
                }
            },
            Op::Ret => {
                if self.m.sig.returns {
                    let v = self.pop()?;
                    return Ok(Some(Some(v)));
                }
                return Ok(Some(None));
            }

            Op::Call(target) => {
                let callee = il::method(target);
                let args = self.pop_args(callee.sig.params as usize)?;
                let ret = call(target, &args)?;
                if let Some(v) = ret {
                    self.stack.push(v);
                }
            }
            Op::CallVirt(slot, argc) => {
                let receiver = self.peek_receiver(argc)?;
                let target = types::resolve_virtual(receiver.type_of().id, slot)
                    .ok_or_else(|| {
                        engine(KernelError::UnsupportedBytecode {
                            opcode: "virtual slot out of range",
                        })
                    })?;
                let args = self.pop_args(argc as usize)?;
                let ret = call(target, &args)?;
                if let Some(v) = ret {
                    self.stack.push(v);
                }
            }
            Op::CallInterface(iface, slot, argc) => {
                let receiver = self.peek_receiver(argc)?;
                let table = types::interface_table(receiver.type_of().id, iface)
                    .ok_or_else(|| {
                        throw(exception::invalid_cast("interface not implemented"))
                    })?;
                let target = *table.get(slot as usize).ok_or_else(|| {
                    engine(KernelError::UnsupportedBytecode {
                        opcode: "interface slot out of range",
                    })
                })?;
                let args = self.pop_args(argc as usize)?;
                let ret = call(target, &args)?;
                if let Some(v) = ret {
                    self.stack.push(v);
                }
            }
            Op::CallExtern(idx) => {
                let name = *self.m.externs.get(idx as usize).ok_or_else(|| {
                    engine(KernelError::UnsupportedBytecode {
                        opcode: "extern index out of range",
                    })
                })?;
                let export = crate::bridge::lookup(name)
                    .ok_or_else(|| engine(KernelError::UnknownExport { name }))?;
                let args = self.pop_args(export.params as usize)?;
                let ret = (export.invoke)(&args).map_err(engine)?;
                if let Some(v) = ret {
                    self.stack.push(v);
                }
            }
            Op::CallIndirect(argc, _returns) => {
                let target = match self.pop()? {
                    Value::Fn(m) => m,
                    _ => return Err(self.type_mismatch("calli target")),
                };
                let args = self.pop_args(argc as usize)?;
                let ret = call(target, &args)?;
                if let Some(v) = ret {
                    self.stack.push(v);
                }
            }
            Op::LoadFn(m) => self.stack.push(Value::Fn(m)),

            Op::NewObject(ty) => {
                let desc = types::get(ty);
                if !desc.before_field_init {
                    ensure_type_initialized(ty)?;
                }
                self.stack.push(Value::Ref(ObjRef::allocate(desc)));
            }
            Op::LoadField(i) => {
                let obj = self.pop_obj()?;
                self.stack.push(obj.field(i as usize));
            }
            Op::StoreField(i) => {
                let value = self.pop()?;
                let obj = self.pop_obj()?;
                obj.set_field(i as usize, value);
            }
            Op::LoadStatic(ty, slot) => {
                ensure_type_initialized(ty)?;
                let desc = types::get(ty);
                let kind = desc
                    .static_fields
                    .get(slot as usize)
                    .ok_or_else(|| {
                        engine(KernelError::UnsupportedBytecode {
                            opcode: "static slot out of range",
                        })
                    })?
                    .kind;
                let raw = desc.statics.lock()[slot as usize];
                self.stack.push(object::decode(kind, raw));
            }
            Op::StoreStatic(ty, slot) => {
                ensure_type_initialized(ty)?;
                let value = self.pop()?;
                let desc = types::get(ty);
                let mut statics = desc.statics.lock();
                *statics.get_mut(slot as usize).ok_or_else(|| {
                    engine(KernelError::UnsupportedBytecode {
                        opcode: "static slot out of range",
                    })
                })? = object::encode(value);
            }
            Op::Box(ty) => {
                let v = self.pop()?;
                self.stack.push(Value::Ref(object::box_value(ty, v)));
            }
            Op::BoxNullable(ty) => {
                let has = self.pop()?.is_true();
                let v = self.pop()?;
                self.stack.push(object::box_nullable(ty, has, v));
            }
            Op::Unbox(ty) => {
                let obj = self.pop_obj()?;
                match object::unbox(obj, ty) {
                    Ok(v) => self.stack.push(v),
                    Err(actual) => {
                        return Err(throw(exception::invalid_cast(&actual.name)));
                    }
                }
            }
            Op::CastClass(ty) => {
                let v = self.pop()?;
                match v {
                    Value::Null => self.stack.push(Value::Null),
                    Value::Ref(obj) if types::is_instance(obj.type_of().id, ty) => {
                        self.stack.push(v)
                    }
                    Value::Ref(obj) => {
                        return Err(throw(exception::invalid_cast(&obj.type_of().name)))
                    }
                    _ => return Err(self.type_mismatch("castclass")),
                }
            }
            Op::IsInst(ty) => {
                let v = self.pop()?;
                match v {
                    Value::Ref(obj) if types::is_instance(obj.type_of().id, ty) => {
                        self.stack.push(v)
                    }
                    _ => self.stack.push(Value::Null),
                }
            }

            Op::Throw => {
                let exc = self.pop_obj()?;
                return Err(throw(exc));
            }
            Op::Rethrow => {
                let exc = *self.active_catches.last().ok_or_else(|| {
                    engine(KernelError::UnsupportedBytecode {
                        opcode: "rethrow outside catch",
                    })
                })?;
                return Err(throw(exc));
            }

            Op::Breakpoint => {
                log::debug!("breakpoint in {} at {}", self.m.name, self.pc - 1);
            }
            Op::Nop => {}
        }
        Ok(None)
    }

    /// The receiver of a virtual or interface call: argument 0, which sits
    /// deepest in the argument group of `argc` values.
    fn peek_receiver(&self, argc: u8) -> ExecResult<ObjRef> {
        if argc == 0 || self.stack.len() < argc as usize {
            return Err(engine(KernelError::UnsupportedBytecode {
                opcode: "call without receiver",
            }));
        }
        match self.stack[self.stack.len() - argc as usize] {
            Value::Ref(obj) => Ok(obj),
            Value::Null => Err(throw(exception::null_reference())),
            _ => Err(engine(KernelError::UnsupportedBytecode {
                opcode: "receiver is not a reference",
            })),
        }
    }

    fn type_mismatch(&self, opcode: &'static str) -> ExecError {
        let _ = opcode;
        engine(KernelError::UnsupportedBytecode {
            opcode: "operand type mismatch",
        })
    }

    fn pop_pair(&mut self) -> ExecResult<(Value, Value)> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    fn binary_int(
        &mut self,
        f32op: fn(i32, i32) -> i32,
        f64op: fn(i64, i64) -> i64,
        float: Option<fn(f64, f64) -> f64>,
    ) -> ExecResult<()> {
        let (a, b) = self.pop_pair()?;
        let out = match (a, b) {
            (Value::I32(a), Value::I32(b)) => Value::I32(f32op(a, b)),
            (Value::I64(a), Value::I64(b)) => Value::I64(f64op(a, b)),
            (Value::I32(a), Value::I64(b)) => Value::I64(f64op(a as i64, b)),
            (Value::I64(a), Value::I32(b)) => Value::I64(f64op(a, b as i64)),
            (Value::F64(a), Value::F64(b)) => match float {
                Some(f) => Value::F64(f(a, b)),
                None => return Err(self.type_mismatch("float bitop")),
            },
            _ => return Err(self.type_mismatch("binary")),
        };
        self.stack.push(out);
        Ok(())
    }

    fn checked(
        &mut self,
        f32op: fn(i32, i32) -> Option<i32>,
        f64op: fn(i64, i64) -> Option<i64>,
        what: &'static str,
    ) -> ExecResult<()> {
        let (a, b) = self.pop_pair()?;
        let out = match (a, b) {
            (Value::I32(a), Value::I32(b)) => {
                Value::I32(f32op(a, b).ok_or_else(|| throw(exception::overflow(what)))?)
            }
            (Value::I64(a), Value::I64(b)) => {
                Value::I64(f64op(a, b).ok_or_else(|| throw(exception::overflow(what)))?)
            }
            _ => return Err(self.type_mismatch("checked")),
        };
        self.stack.push(out);
        Ok(())
    }

    fn divide(&mut self, unsigned: bool) -> ExecResult<()> {
        let (a, b) = self.pop_pair()?;
        let out = match (a, b) {
            (Value::I32(a), Value::I32(b)) => {
                if b == 0 {
                    return Err(throw(exception::new_exception(
                        builtins::divide_by_zero_exception(),
                        "division by zero",
                    )));
                }
                if unsigned {
                    Value::I32(((a as u32) / (b as u32)) as i32)
                } else {
                    Value::I32(a.wrapping_div(b))
                }
            }
            (Value::I64(a), Value::I64(b)) => {
                if b == 0 {
                    return Err(throw(exception::new_exception(
                        builtins::divide_by_zero_exception(),
                        "division by zero",
                    )));
                }
                if unsigned {
                    Value::I64(((a as u64) / (b as u64)) as i64)
                } else {
                    Value::I64(a.wrapping_div(b))
                }
            }
            (Value::F64(a), Value::F64(b)) => Value::F64(a / b),
            _ => return Err(self.type_mismatch("div")),
        };
        self.stack.push(out);
        Ok(())
    }

    fn shift(&mut self, f32op: fn(i32, u32) -> i32, f64op: fn(i64, u32) -> i64) -> ExecResult<()> {
        let (a, b) = self.pop_pair()?;
        let shift = match b {
            Value::I32(v) => v as u32,
            Value::I64(v) => v as u32,
            _ => return Err(self.type_mismatch("shift")),
        };
        let out = match a {
            Value::I32(v) => Value::I32(f32op(v, shift)),
            Value::I64(v) => Value::I64(f64op(v, shift)),
            _ => return Err(self.type_mismatch("shift")),
        };
        self.stack.push(out);
        Ok(())
    }

    fn compare(
        &mut self,
        pred: fn(core::cmp::Ordering) -> bool,
        unsigned: bool,
    ) -> ExecResult<()> {
        let (a, b) = self.pop_pair()?;
        let ordering = match (a, b) {
            (Value::I32(a), Value::I32(b)) => {
                if unsigned {
                    (a as u32).cmp(&(b as u32))
                } else {
                    a.cmp(&b)
                }
            }
            (Value::I64(a), Value::I64(b)) => {
                if unsigned {
                    (a as u64).cmp(&(b as u64))
                } else {
                    a.cmp(&b)
                }
            }
            (Value::I32(a), Value::I64(b)) => (a as i64).cmp(&b),
            (Value::I64(a), Value::I32(b)) => a.cmp(&(b as i64)),
            (Value::F64(a), Value::F64(b)) => a
                .partial_cmp(&b)
                .unwrap_or(core::cmp::Ordering::Greater),
            (Value::Null, Value::Null) => core::cmp::Ordering::Equal,
            (Value::Ref(a), Value::Ref(b)) => (a.as_ptr() as usize).cmp(&(b.as_ptr() as usize)),
            (Value::Null, Value::Ref(_)) => core::cmp::Ordering::Less,
            (Value::Ref(_), Value::Null) => core::cmp::Ordering::Greater,
            _ => return Err(self.type_mismatch("compare")),
        };
        self.stack.push(Value::I32(pred(ordering) as i32));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::il::{HandlerRange, MethodSig};
    use crate::rt::types::{TypeBuilder, TypeKind};
    use crate::jit::il::ValueKind;

    fn expect_i32(result: ExecResult<Option<Value>>) -> i32 {
        match result {
            Ok(Some(Value::I32(v))) => v,
            other => panic!("expected i32 result, got {:?}", other),
        }
    }

    fn caught_type(result: ExecResult<Option<Value>>) -> types::TypeId {
        match result {
            Err(ExecError::Exception(exc)) => exc.type_of().id,
            other => panic!("expected escaped exception, got {:?}", other),
        }
    }

    #[test]
    fn recursive_fib_of_ten_is_55() {
        let fib = il::register_recursive(
            "Fib",
            MethodSig::new(1, true),
            0,
            |me| {
                alloc::vec![
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
            },
        );
        assert_eq!(expect_i32(call(fib, &[Value::I32(10)])), 55);
        assert_eq!(expect_i32(call(fib, &[Value::I32(1)])), 1);
    }

    #[test]
    fn checked_add_overflows_and_unchecked_wraps() {
        let checked = il::register_method(
            "CheckedAddMax",
            MethodSig::new(0, true),
            0,
            alloc::vec![
                Op::ConstI32(i32::MAX),
                Op::ConstI32(1),
                Op::CheckedAdd,
                Op::Ret,
            ],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        assert_eq!(
            caught_type(call(checked, &[])),
            builtins::overflow_exception()
        );

        let wrapping = il::register_method(
            "WrappingAddMax",
            MethodSig::new(0, true),
            0,
            alloc::vec![Op::ConstI32(i32::MAX), Op::ConstI32(1), Op::Add, Op::Ret],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        assert_eq!(expect_i32(call(wrapping, &[])), i32::MIN);
    }

    #[test]
    fn checked_narrowing_conversion_throws() {
        let narrowing = il::register_method(
            "NarrowTooBig",
            MethodSig::new(0, true),
            0,
            alloc::vec![
                Op::ConstI64(1 << 40),
                Op::CheckedConvI32,
                Op::Ret,
            ],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        assert_eq!(
            caught_type(call(narrowing, &[])),
            builtins::overflow_exception()
        );
    }

    #[test]
    fn catch_handler_receives_the_exception() {
        builtins::ensure();
        // try { throw overflow } catch (Overflow) { return 7 }
        let thrower = il::register_method(
            "ThrowOverflowHelper",
            MethodSig::new(0, true),
            0,
            alloc::vec![
                Op::ConstI32(i32::MAX),
                Op::ConstI32(1),
                Op::CheckedAdd,
                Op::Ret,
            ],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        let body = alloc::vec![
            // 0..2 try
            Op::Call(thrower),
            Op::Pop,
            Op::Leave(5),
            // 3..5 handler: exception is on the stack
            Op::Pop,
            Op::Leave(5),
            // 5: after
            Op::ConstI32(7),
            Op::Ret,
        ];
        let handlers = alloc::vec![HandlerRange {
            kind: HandlerKind::Catch(builtins::overflow_exception()),
            try_start: 0,
            try_end: 3,
            handler_start: 3,
            handler_end: 5,
        }];
        let m = il::register_method(
            "CatchOverflow",
            MethodSig::new(0, true),
            0,
            body,
            handlers,
            alloc::vec![],
            None,
        );
        assert_eq!(expect_i32(call(m, &[])), 7);
    }

    #[test]
    fn finally_runs_on_both_paths() {
        builtins::ensure();
        let flag_ty = TypeBuilder::new("FinallyFlag", TypeKind::Class)
            .static_field("Count", ValueKind::I32)
            .define()
            .unwrap();
        let bump_flag = alloc::vec![
            Op::LoadStatic(flag_ty, 0),
            Op::ConstI32(1),
            Op::Add,
            Op::StoreStatic(flag_ty, 0),
        ];

        // Normal path: try { } finally { Count += 1 } then return Count.
        let mut body = alloc::vec![Op::Nop, Op::Leave(2 + bump_flag.len() + 1)];
        let handler_start = body.len();
        body.extend(bump_flag.iter().copied());
        body.push(Op::EndFinally);
        body.push(Op::LoadStatic(flag_ty, 0));
        body.push(Op::Ret);
        let handlers = alloc::vec![HandlerRange {
            kind: HandlerKind::Finally,
            try_start: 0,
            try_end: 2,
            handler_start,
            handler_end: handler_start + bump_flag.len() + 1,
        }];
        let normal = il::register_method(
            "FinallyNormal",
            MethodSig::new(0, true),
            0,
            body,
            handlers,
            alloc::vec![],
            None,
        );
        assert_eq!(expect_i32(call(normal, &[])), 1);

        // Exceptional path: try { throw } finally { Count += 1 }; the
        // exception still escapes but the finally observably ran.
        let mut body = alloc::vec![
            Op::ConstI32(i32::MAX),
            Op::ConstI32(1),
            Op::CheckedAdd,
            Op::Ret,
        ];
        let handler_start = body.len();
        body.extend(bump_flag.iter().copied());
        body.push(Op::EndFinally);
        let handlers = alloc::vec![HandlerRange {
            kind: HandlerKind::Finally,
            try_start: 0,
            try_end: 4,
            handler_start,
            handler_end: handler_start + bump_flag.len() + 1,
        }];
        let exceptional = il::register_method(
            "FinallyExceptional",
            MethodSig::new(0, true),
            0,
            body,
            handlers,
            alloc::vec![],
            None,
        );
        assert_eq!(
            caught_type(call(exceptional, &[])),
            builtins::overflow_exception()
        );
        let count = crate::rt::types::get(flag_ty).statics.lock()[0];
        assert_eq!(count, 2);
    }

    #[test]
    fn rethrow_preserves_the_original_exception() {
        builtins::ensure();
        // try { throw } catch (Exception) { rethrow } -- the escaping
        // object is the original, not a copy.
        let body = alloc::vec![
            Op::ConstI32(i32::MAX),
            Op::ConstI32(1),
            Op::CheckedAdd,
            Op::Ret,
            // handler
            Op::Pop,
            Op::Rethrow,
        ];
        let handlers = alloc::vec![HandlerRange {
            kind: HandlerKind::Catch(builtins::exception()),
            try_start: 0,
            try_end: 4,
            handler_start: 4,
            handler_end: 6,
        }];
        let m = il::register_method(
            "RethrowIt",
            MethodSig::new(0, true),
            0,
            body,
            handlers,
            alloc::vec![],
            None,
        );
        match call(m, &[]) {
            Err(ExecError::Exception(exc)) => {
                assert_eq!(exc.type_of().id, builtins::overflow_exception());
                assert_eq!(exception::message_of(exc), "checked add");
            }
            other => panic!("expected rethrown exception, got {:?}", other),
        }
    }

    #[test]
    fn static_initializer_runs_once_for_two_readers() {
        // A type with { static int Value; static int Runs; } whose
        // initializer stores 42 and bumps Runs; flagged before-field-init.
        let ty = TypeBuilder::new("AnswerHolder", TypeKind::Class)
            .static_field("Value", ValueKind::I32)
            .static_field("Runs", ValueKind::I32)
            .before_field_init()
            .define()
            .unwrap();
        let cctor = il::register_method(
            "AnswerHolder..cctor",
            MethodSig::new(0, false),
            0,
            alloc::vec![
                Op::ConstI32(42),
                Op::StoreStatic(ty, 0),
                Op::LoadStatic(ty, 1),
                Op::ConstI32(1),
                Op::Add,
                Op::StoreStatic(ty, 1),
                Op::Ret,
            ],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        crate::rt::types::get(ty).set_initializer(cctor);

        let reader = |name: &str| {
            il::register_method(
                name,
                MethodSig::new(0, true),
                0,
                alloc::vec![Op::LoadStatic(ty, 0), Op::Ret],
                alloc::vec![],
                alloc::vec![],
                None,
            )
        };
        let first = reader("ReadAnswerA");
        let second = reader("ReadAnswerB");
        assert_eq!(expect_i32(call(first, &[])), 42);
        assert_eq!(expect_i32(call(second, &[])), 42);
        // The initializer body executed exactly once.
        assert_eq!(crate::rt::types::get(ty).statics.lock()[1], 1);
    }

    #[test]
    fn virtual_dispatch_selects_most_derived_override() {
        let base_speak = il::register_method(
            "VBase::Speak",
            MethodSig::new(1, true),
            0,
            alloc::vec![Op::ConstI32(1), Op::Ret],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        let derived_speak = il::register_method(
            "VDerived::Speak",
            MethodSig::new(1, true),
            0,
            alloc::vec![Op::ConstI32(2), Op::Ret],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        let base = TypeBuilder::new("VBase", TypeKind::Class)
            .virtual_method(base_speak)
            .define()
            .unwrap();
        let derived = TypeBuilder::new("VDerived", TypeKind::Class)
            .supertype(base)
            .override_method(0, derived_speak)
            .define()
            .unwrap();

        let call_speak = |ty| {
            il::register_method(
                "CallSpeak",
                MethodSig::new(0, true),
                0,
                alloc::vec![Op::NewObject(ty), Op::CallVirt(0, 1), Op::Ret],
                alloc::vec![],
                alloc::vec![],
                None,
            )
        };
        assert_eq!(expect_i32(call(call_speak(base), &[])), 1);
        // Static type Base, dynamic type Derived: the override wins.
        assert_eq!(expect_i32(call(call_speak(derived), &[])), 2);
    }

    #[test]
    fn interface_dispatch_uses_the_pair_table() {
        let impl_m = il::register_method(
            "CImpl::Area",
            MethodSig::new(1, true),
            0,
            alloc::vec![Op::ConstI32(9), Op::Ret],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        let default_m = il::register_method(
            "IShape::Name.default",
            MethodSig::new(1, true),
            0,
            alloc::vec![Op::ConstI32(77), Op::Ret],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        let iface = TypeBuilder::new("IShape2", TypeKind::Interface)
            .interface_method("Area", None)
            .interface_method("Name", Some(default_m))
            .define()
            .unwrap();
        let concrete = TypeBuilder::new("CShape2", TypeKind::Class)
            .implement(iface, alloc::vec![(0, impl_m)])
            .define()
            .unwrap();

        let call_slot = |slot| {
            il::register_method(
                "CallShapeSlot",
                MethodSig::new(0, true),
                0,
                alloc::vec![
                    Op::NewObject(concrete),
                    Op::CallInterface(iface, slot, 1),
                    Op::Ret,
                ],
                alloc::vec![],
                alloc::vec![],
                None,
            )
        };
        assert_eq!(expect_i32(call(call_slot(0), &[])), 9);
        // Slot 1 falls through to the interface's default body.
        assert_eq!(expect_i32(call(call_slot(1), &[])), 77);
    }

    #[test]
    fn box_unbox_round_trip_and_mismatch() {
        builtins::ensure();
        let round = il::register_method(
            "BoxRoundTrip",
            MethodSig::new(0, true),
            0,
            alloc::vec![
                Op::ConstI32(123),
                Op::Box(builtins::int32()),
                Op::Unbox(builtins::int32()),
                Op::Ret,
            ],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        assert_eq!(expect_i32(call(round, &[])), 123);

        let mismatch = il::register_method(
            "BoxMismatch",
            MethodSig::new(0, true),
            0,
            alloc::vec![
                Op::ConstI32(123),
                Op::Box(builtins::int32()),
                Op::Unbox(builtins::int64()),
                Op::Ret,
            ],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        assert_eq!(
            caught_type(call(mismatch, &[])),
            builtins::invalid_cast_exception()
        );
    }

    #[test]
    fn function_pointer_call_passes_arguments_unchanged() {
        let target = il::register_method(
            "SubtractPair",
            MethodSig::new(2, true),
            0,
            alloc::vec![Op::LoadArg(0), Op::LoadArg(1), Op::Sub, Op::Ret],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        let caller = il::register_method(
            "CallThroughPointer",
            MethodSig::new(0, true),
            0,
            alloc::vec![
                Op::ConstI32(50),
                Op::ConstI32(8),
                Op::LoadFn(target),
                Op::CallIndirect(2, true),
                Op::Ret,
            ],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        assert_eq!(expect_i32(call(caller, &[])), 42);
    }

    #[test]
    fn null_receiver_raises_null_reference() {
        builtins::ensure();
        let m = il::register_method(
            "NullFieldLoad",
            MethodSig::new(0, true),
            0,
            alloc::vec![Op::ConstNull, Op::LoadField(0), Op::Ret],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        assert_eq!(
            caught_type(call(m, &[])),
            builtins::null_reference_exception()
        );
    }

    #[test]
    fn division_by_zero_raises() {
        builtins::ensure();
        let m = il::register_method(
            "DivZero",
            MethodSig::new(0, true),
            0,
            alloc::vec![Op::ConstI32(5), Op::ConstI32(0), Op::DivS, Op::Ret],
            alloc::vec![],
            alloc::vec![],
            None,
        );
        assert_eq!(
            caught_type(call(m, &[])),
            builtins::divide_by_zero_exception()
        );
    }
}
