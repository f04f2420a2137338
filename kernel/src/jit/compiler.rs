//! Single-pass bytecode-to-native compiler.
//!
//! The first call-site reference to a method compiles it to completion:
//! one linear walk over the body drives the [`Emitter`], call sites to
//! not-yet-compiled methods get rel32 placeholders that are patched once
//! the callee's address exists, extern call sites are bound to the
//! kernel-bridge entry point at compile time (a direct call, no run-time
//! indirection), and checked arithmetic branches into the shared
//! throw-overflow trampoline. The compiler is re-entrant per thread:
//! compiling a callee (including a self-recursive one) from inside a
//! compilation is the normal path.
//!
//! Evaluation-stack discipline: every IL stack slot is one 8-byte machine
//! stack slot; locals and spilled arguments live in the frame below RBP.
//! Virtual and interface call sites resolve the receiver through runtime
//! helper calls (the helper compiles the target on demand and returns its
//! entry), the same function-pointer-table shape the managed/native
//! boundary uses everywhere else. Methods carrying exception handler
//! ranges execute through the interpreter thunk behind a native-callable
//! frame, so unwinding stays in one place.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::jit::code_buffer::{CodeBuffer, DEFAULT_CAPACITY};
use crate::jit::emitter::{Cond, Emitter, MemSize, PatchSite, Reg, Width};
use crate::jit::il::{self, Method, MethodId, Op};
use crate::jit::x64::X64Emitter;
use crate::jit::interp;
use crate::rt::exception;
use crate::rt::object::{self, ObjRef};
use crate::rt::types;

static COMPILED: Mutex<BTreeMap<MethodId, usize>> = Mutex::new(BTreeMap::new());
static BUFFER: Mutex<Option<CodeBuffer>> = Mutex::new(None);

/// Reserve the code buffer. Idempotent; later calls keep the first
/// reservation.
pub fn init(capacity: usize) -> KernelResult<()> {
    let mut buffer = BUFFER.lock();
    if buffer.is_none() {
        *buffer = Some(CodeBuffer::new(capacity)?);
    }
    Ok(())
}

fn ensure_buffer() -> KernelResult<()> {
    init(DEFAULT_CAPACITY)
}

/// A call-site or immediate that still needs an absolute target.
enum FixTarget {
    /// rel32 call to another managed method.
    Call(MethodId),
    /// rel32 call to a native entry (bridge export or runtime helper).
    CallNative(usize),
    /// 64-bit immediate holding a managed method's entry (`ldftn`).
    LoadAddr(MethodId),
}

enum FixSite {
    Rel32(PatchSite),
    Abs64(usize),
}

struct Fix {
    site: FixSite,
    target: FixTarget,
}

/// Compile a method on first use and publish its callable entry point.
pub fn compile(method: MethodId) -> KernelResult<usize> {
    if let Some(&addr) = COMPILED.lock().get(&method) {
        return Ok(addr);
    }
    ensure_buffer()?;

    let m = il::method(method);
    let mut e = X64Emitter::new();
    let fixes = lower(m, &mut e)?;
    let bytes = e.finish();

    let (offset, addr) = {
        let mut buffer = BUFFER.lock();
        let buffer = buffer.as_mut().expect("buffer initialized above");
        let offset = buffer.append(&bytes)?;
        (offset, buffer.addr(offset))
    };

    // Publish before resolving callees so recursion (self or mutual)
    // terminates; the first publisher wins a racing duplicate.
    {
        let mut compiled = COMPILED.lock();
        if let Some(&existing) = compiled.get(&method) {
            return Ok(existing);
        }
        compiled.insert(method, addr);
    }

    // Resolve outstanding call targets, compiling callees on demand.
    for fix in fixes {
        let target = match fix.target {
            FixTarget::Call(mid) | FixTarget::LoadAddr(mid) => compile(mid)?,
            FixTarget::CallNative(a) => a,
        };
        let mut buffer = BUFFER.lock();
        let buffer = buffer.as_mut().expect("buffer initialized above");
        match fix.site {
            FixSite::Rel32(site) => buffer.patch_rel32(offset + site.0, target)?,
            FixSite::Abs64(at) => buffer.patch_abs64(offset + at, target)?,
        }
    }

    // Publication: the range is sealed (icache-synchronized, write
    // permission retired) before any caller can reach the pointer.
    BUFFER
        .lock()
        .as_mut()
        .expect("buffer initialized above")
        .seal();
    Ok(addr)
}

/// Entry point of the `throw` trampoline the backend wires into lowered
/// `throw` sites.
pub fn throw_entry_point() -> usize {
    jit_throw as usize
}

/// Entry point of the `rethrow` trampoline.
pub fn rethrow_entry_point() -> usize {
    jit_rethrow as usize
}

// ---------------------------------------------------------------------------
// Frame layout
// ---------------------------------------------------------------------------
// [rbp - 8*(1+i)]               local i
// [rbp - 8*(locals + 1 + i)]    argument i (spilled at entry)

fn local_off(i: u16) -> i32 {
    -8 * (1 + i as i32)
}

fn arg_off(m: &Method, i: u16) -> i32 {
    -8 * (m.locals as i32 + 1 + i as i32)
}

fn frame_bytes(m: &Method) -> u32 {
    8 * (m.locals as u32 + m.sig.params as u32)
}

/// Lower one method body. Returns the unresolved call sites.
fn lower<E: Emitter>(m: &Method, e: &mut E) -> KernelResult<Vec<Fix>> {
    let mut fixes = Vec::new();
    let token = e.prologue(frame_bytes(m));

    if m.sig.params as u8 > e.conv().register_args {
        return Err(KernelError::UnsupportedBytecode {
            opcode: "stack-passed parameters",
        });
    }
    for i in 0..m.sig.params {
        e.store(Reg::Rbp, arg_off(m, i as u16), e.arg_reg(i), MemSize::B8);
    }

    // Protected regions execute through the interpreter thunk: the frame
    // is native-callable, the unwinder stays in one place.
    if !m.handlers.is_empty() {
        e.mov_imm(Reg::Rdi, m.id.0 as i64);
        // Reversed argument array: lowest address holds the last argument.
        e.lea(
            Reg::Rsi,
            Reg::Rbp,
            -8 * (m.locals as i32 + m.sig.params as i32),
        );
        e.mov_imm(Reg::Rdx, m.sig.params as i64);
        e.mov_imm(Reg::Rax, interp_thunk as usize as i64);
        e.call_reg(Reg::Rax);
        e.epilogue(token);
        e.ret();
        return Ok(fixes);
    }

    // One label per instruction index so any branch target binds.
    let labels: Vec<_> = (0..m.body.len()).map(|_| e.new_label()).collect();
    let overflow = e.new_label();
    let mut overflow_used = false;

    for (pc, op) in m.body.iter().enumerate() {
        e.bind(labels[pc]);
        match *op {
            Op::ConstI32(v) => {
                e.mov_imm(Reg::Rax, v as i64);
                e.push(Reg::Rax);
            }
            Op::ConstI64(v) => {
                e.mov_imm(Reg::Rax, v);
                e.push(Reg::Rax);
            }
            Op::ConstF64(v) => {
                e.mov_imm(Reg::Rax, v.to_bits() as i64);
                e.push(Reg::Rax);
            }
            Op::ConstNull => {
                e.zero(Reg::Rax);
                e.push(Reg::Rax);
            }
            Op::LoadArg(i) => {
                e.load(Reg::Rax, Reg::Rbp, arg_off(m, i), MemSize::B8, false);
                e.push(Reg::Rax);
            }
            Op::LoadLocal(i) => {
                e.load(Reg::Rax, Reg::Rbp, local_off(i), MemSize::B8, false);
                e.push(Reg::Rax);
            }
            Op::StoreLocal(i) => {
                e.pop(Reg::Rax);
                e.store(Reg::Rbp, local_off(i), Reg::Rax, MemSize::B8);
            }
            Op::Dup => {
                e.pop(Reg::Rax);
                e.push(Reg::Rax);
                e.push(Reg::Rax);
            }
            Op::Pop => e.pop(Reg::Rax),

            Op::Add => binary(e, Emitter::add),
            Op::Sub => binary(e, Emitter::sub),
            Op::Mul => binary(e, Emitter::mul),
            Op::And => binary(e, Emitter::and),
            Op::Or => binary(e, Emitter::or),
            Op::Xor => binary(e, Emitter::xor),
            Op::DivS => {
                e.pop(Reg::Rcx);
                e.pop(Reg::Rax);
                e.div_signed(Reg::Rcx);
                e.push(Reg::Rax);
            }
            Op::DivU => {
                e.pop(Reg::Rcx);
                e.pop(Reg::Rax);
                e.div_unsigned(Reg::Rcx);
                e.push(Reg::Rax);
            }
            Op::RemS => {
                e.pop(Reg::Rcx);
                e.pop(Reg::Rax);
                e.div_signed(Reg::Rcx);
                e.push(Reg::Rdx);
            }
            Op::CheckedAdd => {
                overflow_used = true;
                e.pop(Reg::Rcx);
                e.pop(Reg::Rax);
                e.checked_add(Reg::Rax, Reg::Rcx, overflow);
                e.push(Reg::Rax);
            }
            Op::CheckedSub => {
                overflow_used = true;
                e.pop(Reg::Rcx);
                e.pop(Reg::Rax);
                e.checked_sub(Reg::Rax, Reg::Rcx, overflow);
                e.push(Reg::Rax);
            }
            Op::CheckedMul => {
                overflow_used = true;
                e.pop(Reg::Rcx);
                e.pop(Reg::Rax);
                e.checked_mul(Reg::Rax, Reg::Rcx, overflow);
                e.push(Reg::Rax);
            }
            Op::CheckedConvI32 => {
                overflow_used = true;
                e.pop(Reg::Rax);
                // The value survives narrowing iff sign-extending its low
                // half reproduces it.
                e.mov_reg(Reg::Rcx, Reg::Rax);
                e.shl_imm(Reg::Rcx, 32);
                e.shr_signed_imm(Reg::Rcx, 32);
                e.cmp(Reg::Rcx, Reg::Rax, Width::W64);
                e.jcc(Cond::Ne, overflow);
                e.push(Reg::Rax);
            }
            Op::ConvI32 => {
                e.pop(Reg::Rax);
                e.shl_imm(Reg::Rax, 32);
                e.shr_signed_imm(Reg::Rax, 32);
                e.push(Reg::Rax);
            }
            Op::ConvI64 => {
                // Already carried at full width.
                e.nop();
            }
            Op::ConvF64 => {
                e.pop(Reg::Rax);
                e.push(Reg::Rax);
                e.cvt_int_to_float(crate::jit::emitter::FReg::Xmm0, Reg::Rax);
                e.fstore(Reg::Rsp, 0, crate::jit::emitter::FReg::Xmm0, true);
            }
            Op::ConvI64FromF64 => {
                e.fload(crate::jit::emitter::FReg::Xmm0, Reg::Rsp, 0, true);
                e.cvt_float_to_int(Reg::Rax, crate::jit::emitter::FReg::Xmm0);
                e.store(Reg::Rsp, 0, Reg::Rax, MemSize::B8);
            }
            Op::Neg => {
                e.pop(Reg::Rax);
                e.neg(Reg::Rax);
                e.push(Reg::Rax);
            }
            Op::Not => {
                e.pop(Reg::Rax);
                e.not(Reg::Rax);
                e.push(Reg::Rax);
            }
            Op::Shl => shift(e, Emitter::shl),
            Op::ShrS => shift(e, Emitter::shr_signed),
            Op::ShrU => shift(e, Emitter::shr_unsigned),

            Op::Eq => compare(e, Cond::Eq),
            Op::Ne => compare(e, Cond::Ne),
            Op::LtS => compare(e, Cond::Lt),
            Op::LeS => compare(e, Cond::Le),
            Op::GtS => compare(e, Cond::Gt),
            Op::GeS => compare(e, Cond::Ge),
            Op::LtU => compare(e, Cond::Below),
            Op::GeU => compare(e, Cond::AboveEq),

            Op::Br(t) => e.jmp(labels[t]),
            Op::BrTrue(t) => {
                e.pop(Reg::Rax);
                e.test(Reg::Rax, Reg::Rax);
                e.jcc(Cond::Ne, labels[t]);
            }
            Op::BrFalse(t) => {
                e.pop(Reg::Rax);
                e.test(Reg::Rax, Reg::Rax);
                e.jcc(Cond::Eq, labels[t]);
            }
            // Without protected regions a leave is a plain branch, and
            // endfinally is unreachable.
            Op::Leave(t) => e.jmp(labels[t]),
            Op::EndFinally => e.breakpoint(),

            Op::Ret => {
                if m.sig.returns {
                    e.pop(Reg::Rax);
                }
                e.epilogue(token);
                e.ret();
            }

            Op::Call(mid) => {
                let callee = il::method(mid);
                emit_args(e, callee.sig.params)?;
                let site = e.call_rel32();
                fixes.push(Fix {
                    site: FixSite::Rel32(site),
                    target: FixTarget::Call(mid),
                });
                if callee.sig.returns {
                    e.push(Reg::Rax);
                }
            }
            Op::CallVirt(slot, argc) => {
                // Resolve through the runtime: receiver -> vtable entry,
                // compiled on demand.
                e.load(
                    Reg::Rdi,
                    Reg::Rsp,
                    8 * (argc as i32 - 1),
                    MemSize::B8,
                    false,
                );
                e.mov_imm(Reg::Rsi, slot as i64);
                e.mov_imm(Reg::Rax, rt_resolve_virtual as usize as i64);
                e.call_reg(Reg::Rax);
                e.mov_reg(Reg::R10, Reg::Rax);
                emit_args(e, argc)?;
                e.call_reg(Reg::R10);
                // Virtual sites push the result slot uniformly; a void
                // site's producer follows with a pop.
                e.push(Reg::Rax);
            }
            Op::CallInterface(iface, slot, argc) => {
                e.load(
                    Reg::Rdi,
                    Reg::Rsp,
                    8 * (argc as i32 - 1),
                    MemSize::B8,
                    false,
                );
                e.mov_imm(Reg::Rsi, iface as i64);
                e.mov_imm(Reg::Rdx, slot as i64);
                e.mov_imm(Reg::Rax, rt_resolve_interface as usize as i64);
                e.call_reg(Reg::Rax);
                e.mov_reg(Reg::R10, Reg::Rax);
                emit_args(e, argc)?;
                e.call_reg(Reg::R10);
                // Interface methods in this engine always produce a value
                // or none uniformly; push the result slot regardless and
                // let `pop` discard it when the site is void.
                e.push(Reg::Rax);
            }
            Op::CallExtern(idx) => {
                let name = *m.externs.get(idx as usize).ok_or(
                    KernelError::UnsupportedBytecode {
                        opcode: "extern index out of range",
                    },
                )?;
                // Bound at compile time; a direct call is emitted.
                let export = crate::bridge::lookup(name)
                    .ok_or(KernelError::UnknownExport { name })?;
                emit_args(e, export.params)?;
                let site = e.call_rel32();
                fixes.push(Fix {
                    site: FixSite::Rel32(site),
                    target: FixTarget::CallNative(export.native),
                });
                if export.returns {
                    e.push(Reg::Rax);
                }
            }
            Op::CallIndirect(argc, returns) => {
                e.pop(Reg::R10);
                emit_args(e, argc)?;
                e.call_reg(Reg::R10);
                if returns {
                    e.push(Reg::Rax);
                }
            }
            Op::LoadFn(mid) => {
                // movabs rax, <entry>; patched once the target exists.
                let imm_at = e.offset() + 2;
                e.mov_imm(Reg::Rax, 0);
                fixes.push(Fix {
                    site: FixSite::Abs64(imm_at),
                    target: FixTarget::LoadAddr(mid),
                });
                e.push(Reg::Rax);
            }

            Op::NewObject(ty) => {
                e.mov_imm(Reg::Rdi, ty as i64);
                call_helper(e, rt_new_object as usize);
                e.push(Reg::Rax);
            }
            Op::LoadField(i) => {
                e.pop(Reg::Rax);
                e.load(Reg::Rax, Reg::Rax, 8 + 8 * i as i32, MemSize::B8, false);
                e.push(Reg::Rax);
            }
            Op::StoreField(i) => {
                e.pop(Reg::Rcx);
                e.pop(Reg::Rax);
                e.store(Reg::Rax, 8 + 8 * i as i32, Reg::Rcx, MemSize::B8);
            }
            Op::LoadStatic(ty, slot) => {
                e.mov_imm(Reg::Rdi, ty as i64);
                e.mov_imm(Reg::Rsi, slot as i64);
                call_helper(e, rt_load_static as usize);
                e.push(Reg::Rax);
            }
            Op::StoreStatic(ty, slot) => {
                e.pop(Reg::Rdx);
                e.mov_imm(Reg::Rdi, ty as i64);
                e.mov_imm(Reg::Rsi, slot as i64);
                call_helper(e, rt_store_static as usize);
            }
            Op::Box(ty) => {
                e.pop(Reg::Rsi);
                e.mov_imm(Reg::Rdi, ty as i64);
                call_helper(e, rt_box as usize);
                e.push(Reg::Rax);
            }
            Op::BoxNullable(ty) => {
                e.pop(Reg::Rdx);
                e.pop(Reg::Rsi);
                e.mov_imm(Reg::Rdi, ty as i64);
                call_helper(e, rt_box_nullable as usize);
                e.push(Reg::Rax);
            }
            Op::Unbox(ty) => {
                e.pop(Reg::Rdi);
                e.mov_imm(Reg::Rsi, ty as i64);
                call_helper(e, rt_unbox as usize);
                e.push(Reg::Rax);
            }
            Op::CastClass(ty) => {
                e.pop(Reg::Rdi);
                e.mov_imm(Reg::Rsi, ty as i64);
                call_helper(e, rt_cast_class as usize);
                e.push(Reg::Rax);
            }
            Op::IsInst(ty) => {
                e.pop(Reg::Rdi);
                e.mov_imm(Reg::Rsi, ty as i64);
                call_helper(e, rt_is_inst as usize);
                e.push(Reg::Rax);
            }

            Op::Throw => {
                e.pop(Reg::Rdi);
                call_helper(e, jit_throw as usize);
            }
            Op::Rethrow => {
                call_helper(e, jit_rethrow as usize);
            }

            Op::Breakpoint => e.breakpoint(),
            Op::Nop => e.nop(),
        }
    }

    if overflow_used {
        e.bind(overflow);
        e.mov_imm(Reg::Rax, jit_throw_overflow as usize as i64);
        e.call_reg(Reg::Rax);
    }
    // Safety net: a verified body always returns before this point.
    e.breakpoint();
    Ok(fixes)
}

fn binary<E: Emitter>(e: &mut E, op: fn(&mut E, Reg, Reg)) {
    e.pop(Reg::Rcx);
    e.pop(Reg::Rax);
    op(e, Reg::Rax, Reg::Rcx);
    e.push(Reg::Rax);
}

fn shift<E: Emitter>(e: &mut E, op: fn(&mut E, Reg)) {
    e.pop(Reg::Rcx);
    e.pop(Reg::Rax);
    op(e, Reg::Rax);
    e.push(Reg::Rax);
}

fn compare<E: Emitter>(e: &mut E, cond: Cond) {
    e.pop(Reg::Rcx);
    e.pop(Reg::Rax);
    e.cmp(Reg::Rax, Reg::Rcx, Width::W64);
    e.setcc(cond, Reg::Rax);
    e.push(Reg::Rax);
}

/// Pop `argc` stack values into the integer argument registers, last
/// argument first.
fn emit_args<E: Emitter>(e: &mut E, argc: u8) -> KernelResult<()> {
    if argc > e.conv().register_args {
        return Err(KernelError::UnsupportedBytecode {
            opcode: "stack-passed arguments",
        });
    }
    for i in (0..argc).rev() {
        e.pop(e.arg_reg(i));
    }
    Ok(())
}

fn call_helper<E: Emitter>(e: &mut E, helper: usize) {
    e.mov_imm(Reg::Rax, helper as i64);
    e.call_reg(Reg::Rax);
}

// ---------------------------------------------------------------------------
// Runtime helpers reachable from compiled code
// ---------------------------------------------------------------------------

/// Virtual dispatch: receiver's type, vtable slot, compile on demand.
extern "C" fn rt_resolve_virtual(receiver: u64, slot: u64) -> u64 {
    // SAFETY: compiled code passes object references it received from the
    // allocator.
    let Some(obj) = (unsafe { ObjRef::from_ptr(receiver as *mut u8) }) else {
        return 0;
    };
    let Some(target) = types::resolve_virtual(obj.type_of().id, slot as u16) else {
        return 0;
    };
    compile(target).unwrap_or(0) as u64
}

/// Interface dispatch through the (type, interface) table.
extern "C" fn rt_resolve_interface(receiver: u64, iface: u64, slot: u64) -> u64 {
    // SAFETY: as above.
    let Some(obj) = (unsafe { ObjRef::from_ptr(receiver as *mut u8) }) else {
        return 0;
    };
    let Some(table) = types::interface_table(obj.type_of().id, iface as u32) else {
        return 0;
    };
    let Some(&target) = table.get(slot as usize) else {
        return 0;
    };
    compile(target).unwrap_or(0) as u64
}

extern "C" fn rt_new_object(ty: u64) -> u64 {
    let desc = types::get(ty as u32);
    ObjRef::allocate(desc).as_ptr() as u64
}

extern "C" fn rt_box(ty: u64, raw: u64) -> u64 {
    let desc = types::get(ty as u32);
    let value = object::decode(desc.fields[0].kind, raw);
    object::box_value(ty as u32, value).as_ptr() as u64
}

extern "C" fn rt_box_nullable(ty: u64, raw: u64, has: u64) -> u64 {
    let desc = types::get(ty as u32);
    let value = object::decode(desc.fields[0].kind, raw);
    match object::box_nullable(ty as u32, has != 0, value) {
        crate::jit::il::Value::Ref(obj) => obj.as_ptr() as u64,
        _ => 0,
    }
}

extern "C" fn rt_unbox(obj: u64, ty: u64) -> u64 {
    // SAFETY: compiled code passes live object references.
    let Some(obj) = (unsafe { ObjRef::from_ptr(obj as *mut u8) }) else {
        jit_throw_null_reference();
    };
    match object::unbox(obj, ty as u32) {
        Ok(value) => object::encode(value),
        Err(actual) => {
            let exc = exception::invalid_cast(&actual.name);
            jit_throw(exc.as_ptr() as u64)
        }
    }
}

extern "C" fn rt_cast_class(obj: u64, ty: u64) -> u64 {
    if obj == 0 {
        return 0; // null passes a castclass
    }
    // SAFETY: compiled code passes live object references.
    let objref = unsafe { ObjRef::from_ptr(obj as *mut u8) }.expect("checked non-null");
    if types::is_instance(objref.type_of().id, ty as u32) {
        obj
    } else {
        let exc = exception::invalid_cast(&objref.type_of().name);
        jit_throw(exc.as_ptr() as u64)
    }
}

extern "C" fn rt_is_inst(obj: u64, ty: u64) -> u64 {
    if obj == 0 {
        return 0;
    }
    // SAFETY: compiled code passes live object references.
    let objref = unsafe { ObjRef::from_ptr(obj as *mut u8) }.expect("checked non-null");
    if types::is_instance(objref.type_of().id, ty as u32) {
        obj
    } else {
        0
    }
}

/// Static reads from compiled code share the interpreter's initializer
/// trigger: first touch of a non-literal static runs the initializer.
extern "C" fn rt_load_static(ty: u64, slot: u64) -> u64 {
    let _ = interp::ensure_type_initialized(ty as u32);
    let desc = types::get(ty as u32);
    desc.statics.lock()[slot as usize]
}

extern "C" fn rt_store_static(ty: u64, slot: u64, raw: u64) {
    let _ = interp::ensure_type_initialized(ty as u32);
    let desc = types::get(ty as u32);
    desc.statics.lock()[slot as usize] = raw;
}

/// The interpreter thunk behind methods with protected regions. `argv`
/// points at the lowest-addressed slot of the reversed argument spill.
extern "C" fn interp_thunk(method_id: u64, argv: *const u64, argc: u64) -> u64 {
    let mut args = Vec::with_capacity(argc as usize);
    for j in 0..argc as usize {
        // SAFETY: the caller spilled exactly `argc` slots.
        let raw = unsafe { argv.add(argc as usize - 1 - j).read() };
        args.push(crate::jit::il::Value::I64(raw as i64));
    }
    match interp::call(MethodId(method_id as u32), &args) {
        Ok(Some(v)) => object::encode(v),
        Ok(None) => 0,
        Err(interp::ExecError::Exception(exc)) => jit_throw(exc.as_ptr() as u64),
        Err(interp::ExecError::Engine(err)) => {
            log::error!("engine fault in managed frame: {}", err);
            jit_fatal("engine fault")
        }
    }
}

// ---------------------------------------------------------------------------
// Exception trampolines
// ---------------------------------------------------------------------------
// Compiled frames carry no native unwind tables: a throw that reaches
// one of these trampolines is past every managed handler (handler-owning
// frames run through the interpreter thunk above, which dispatches its
// own clauses). Per the unhandled-exception policy that terminates the
// thread; on the boot thread it halts the machine after logging.

extern "C" fn jit_throw(exc: u64) -> ! {
    // SAFETY: throw sites pass exception object references.
    if let Some(obj) = unsafe { ObjRef::from_ptr(exc as *mut u8) } {
        log::error!(
            "unhandled {}: {}",
            obj.type_of().name,
            exception::message_of(obj)
        );
    }
    jit_fatal("unhandled managed exception")
}

extern "C" fn jit_rethrow() -> ! {
    jit_fatal("rethrow outside managed handler frame")
}

/// Shared trampoline target of every checked-arithmetic overflow branch:
/// construct the overflow error object, then enter the throw path.
extern "C" fn jit_throw_overflow() -> ! {
    let exc = exception::overflow("checked arithmetic");
    jit_throw(exc.as_ptr() as u64)
}

fn jit_throw_null_reference() -> ! {
    let exc = exception::null_reference();
    jit_throw(exc.as_ptr() as u64)
}

fn jit_fatal(reason: &str) -> ! {
    #[cfg(target_os = "none")]
    {
        if crate::sched::current_thread_id().is_some() {
            log::error!("terminating thread: {}", reason);
            crate::sched::exit_thread(-1);
        }
        log::error!("fatal on boot thread: {}", reason);
        crate::arch::halt_forever();
    }
    #[cfg(not(target_os = "none"))]
    panic!("managed execution fault: {}", reason);
}
