//! Architecture-neutral code-emitter interface.
//!
//! The single-pass compiler drives this trait; an implementation encodes
//! real machine instructions into an internal buffer. Call sites that
//! target a not-yet-known address are emitted with a zero placeholder and
//! patched once the target is resolved. The calling-convention report
//! (register argument count, shadow space, stack alignment) is what the
//! compiler keys argument marshalling on.

/// General-purpose registers, numbered with their hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    pub const fn num(self) -> u8 {
        self as u8
    }
}

/// SSE registers for float loads/stores and arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FReg {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
}

/// Memory operand width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemSize {
    B1,
    B2,
    B4,
    B8,
}

/// Comparison width for `cmp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W32,
    W64,
}

/// The closed condition set for conditional jumps and set-on-condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    // Signed
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Unsigned
    Below,
    BelowEq,
    Above,
    AboveEq,
}

/// A forward-referencable position in the emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub u32);

/// Byte offset of a rel32 placeholder awaiting a target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite(pub usize);

/// Token minted by `prologue` and consumed by `epilogue`; carries the
/// stack adjustment so the two stay paired.
#[derive(Debug, Clone, Copy)]
#[must_use = "the epilogue must consume the frame token"]
pub struct FrameToken {
    pub frame_bytes: u32,
}

/// Calling-convention report.
#[derive(Debug, Clone, Copy)]
pub struct CallConv {
    /// Arguments passed in registers; the rest go on the stack in
    /// declaration order.
    pub register_args: u8,
    /// Callee-reserved spill area at the stack top (zero on System-V).
    pub shadow_space: u32,
    /// Required stack alignment at call sites.
    pub stack_align: u32,
}

/// Architecture code emitter.
///
/// Every method is one linear emission: labels forward-reference within
/// it, `finish` resolves them and hands back the bytes plus any call
/// sites that still need absolute targets.
pub trait Emitter {
    fn conv(&self) -> CallConv;
    /// Register carrying integer argument `index`.
    fn arg_reg(&self, index: u8) -> Reg;

    fn new_label(&mut self) -> Label;
    fn bind(&mut self, label: Label);
    /// Current emission offset in bytes.
    fn offset(&self) -> usize;

    fn prologue(&mut self, local_bytes: u32) -> FrameToken;
    fn epilogue(&mut self, token: FrameToken);

    // Moves and memory
    fn mov_reg(&mut self, dst: Reg, src: Reg);
    /// Wide immediate load.
    fn mov_imm(&mut self, dst: Reg, imm: i64);
    /// Zero idiom.
    fn zero(&mut self, dst: Reg);
    /// Sized load with sign or zero extension.
    fn load(&mut self, dst: Reg, base: Reg, offset: i32, size: MemSize, signed: bool);
    fn store(&mut self, base: Reg, offset: i32, src: Reg, size: MemSize);
    fn lea(&mut self, dst: Reg, base: Reg, offset: i32);

    // Integer arithmetic
    fn add(&mut self, dst: Reg, src: Reg);
    fn sub(&mut self, dst: Reg, src: Reg);
    fn mul(&mut self, dst: Reg, src: Reg);
    /// Signed division of RDX:RAX by `divisor`, with the sign-extend
    /// prelude; quotient lands in RAX.
    fn div_signed(&mut self, divisor: Reg);
    /// Unsigned division; RDX is zeroed first.
    fn div_unsigned(&mut self, divisor: Reg);

    // Bitwise and shifts
    fn and(&mut self, dst: Reg, src: Reg);
    fn or(&mut self, dst: Reg, src: Reg);
    fn xor(&mut self, dst: Reg, src: Reg);
    fn not(&mut self, dst: Reg);
    fn neg(&mut self, dst: Reg);
    /// Shifts by the CL register.
    fn shl(&mut self, dst: Reg);
    fn shr_signed(&mut self, dst: Reg);
    fn shr_unsigned(&mut self, dst: Reg);
    fn shl_imm(&mut self, dst: Reg, amount: u8);
    fn shr_signed_imm(&mut self, dst: Reg, amount: u8);
    fn shr_unsigned_imm(&mut self, dst: Reg, amount: u8);

    // Flags and control flow
    fn cmp(&mut self, a: Reg, b: Reg, width: Width);
    fn test(&mut self, a: Reg, b: Reg);
    /// Materialize a condition into `dst` as 0/1.
    fn setcc(&mut self, cond: Cond, dst: Reg);
    fn jcc(&mut self, cond: Cond, label: Label);
    fn jmp(&mut self, label: Label);
    fn call_reg(&mut self, target: Reg);
    /// Near call with a zero placeholder; the returned site is patched
    /// when the target address is known.
    fn call_rel32(&mut self) -> PatchSite;
    fn ret(&mut self);
    fn push(&mut self, src: Reg);
    fn pop(&mut self, dst: Reg);

    // Floating point
    fn fload(&mut self, dst: FReg, base: Reg, offset: i32, double: bool);
    fn fstore(&mut self, base: Reg, offset: i32, src: FReg, double: bool);
    fn fadd(&mut self, dst: FReg, src: FReg);
    fn fsub(&mut self, dst: FReg, src: FReg);
    fn fmul(&mut self, dst: FReg, src: FReg);
    fn fdiv(&mut self, dst: FReg, src: FReg);
    fn cvt_int_to_float(&mut self, dst: FReg, src: Reg);
    fn cvt_float_to_int(&mut self, dst: Reg, src: FReg);

    // Checked arithmetic: perform the operation, then branch to
    // `overflow` when the overflow flag is set.
    fn checked_add(&mut self, dst: Reg, src: Reg, overflow: Label);
    fn checked_sub(&mut self, dst: Reg, src: Reg, overflow: Label);
    fn checked_mul(&mut self, dst: Reg, src: Reg, overflow: Label);

    fn breakpoint(&mut self);
    fn nop(&mut self);
}
