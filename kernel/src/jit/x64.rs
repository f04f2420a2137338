//! x86-64 emitter.
//!
//! System-V flavored: six register arguments (RDI, RSI, RDX, RCX, R8,
//! R9), no shadow space, 16-byte call alignment. Memory operands are
//! encoded base + disp32 throughout; RSP/R12 bases get their mandatory
//! SIB byte. Labels are rel32 fixups resolved in `finish`.

use alloc::vec::Vec;

use crate::jit::emitter::{
    CallConv, Cond, Emitter, FrameToken, FReg, Label, MemSize, PatchSite, Reg, Width,
};

const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Condition-code nibble for the 0F 8x / 0F 9x opcode families.
fn cc_nibble(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x4,
        Cond::Ne => 0x5,
        Cond::Lt => 0xC,
        Cond::Le => 0xE,
        Cond::Gt => 0xF,
        Cond::Ge => 0xD,
        Cond::Below => 0x2,
        Cond::BelowEq => 0x6,
        Cond::Above => 0x7,
        Cond::AboveEq => 0x3,
    }
}

/// Overflow condition for the checked-arithmetic branches.
const CC_OVERFLOW: u8 = 0x0;

pub struct X64Emitter {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    /// (label, rel32 offset) fixups resolved at finish.
    fixups: Vec<(Label, usize)>,
}

impl X64Emitter {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Resolve label fixups and return the finished bytes.
    pub fn finish(mut self) -> Vec<u8> {
        for (label, site) in self.fixups {
            let target = self.labels[label.0 as usize]
                .expect("unbound label at finish");
            let rel = (target as i64 - (site as i64 + 4)) as i32;
            self.code[site..site + 4].copy_from_slice(&rel.to_le_bytes());
        }
        self.code
    }

    fn byte(&mut self, b: u8) {
        self.code.push(b);
    }

    fn bytes(&mut self, bs: &[u8]) {
        self.code.extend_from_slice(bs);
    }

    fn imm32(&mut self, v: i32) {
        self.bytes(&v.to_le_bytes());
    }

    /// REX prefix; emitted when W is set or an extended register is used.
    fn rex(&mut self, w: bool, reg: u8, rm: u8) {
        let b = 0x40
            | ((w as u8) << 3)
            | (((reg >> 3) & 1) << 2)
            | ((rm >> 3) & 1);
        if b != 0x40 || w {
            self.byte(b);
        }
    }

    fn rex_force(&mut self, w: bool, reg: u8, rm: u8) {
        let b = 0x40
            | ((w as u8) << 3)
            | (((reg >> 3) & 1) << 2)
            | ((rm >> 3) & 1);
        self.byte(b);
    }

    /// ModRM register-direct form.
    fn modrm_reg(&mut self, reg: u8, rm: u8) {
        self.byte(0xC0 | ((reg & 7) << 3) | (rm & 7));
    }

    /// ModRM memory form `[base + disp32]`, with the SIB byte RSP/R12
    /// demand.
    fn modrm_mem(&mut self, reg: u8, base: u8, disp: i32) {
        if base & 7 == 4 {
            self.byte(0x84 | ((reg & 7) << 3));
            self.byte(0x24); // SIB: no index, base = rsp/r12
        } else {
            self.byte(0x80 | ((reg & 7) << 3) | (base & 7));
        }
        self.imm32(disp);
    }

    /// rel32 placeholder; returns its byte offset.
    fn placeholder32(&mut self) -> usize {
        let at = self.code.len();
        self.imm32(0);
        at
    }

    fn jump_cc(&mut self, cc: u8, label: Label) {
        self.byte(0x0F);
        self.byte(0x80 | cc);
        let site = self.placeholder32();
        self.fixups.push((label, site));
    }

    /// Binary ALU op, 64-bit register-register: `opcode /r`.
    fn alu(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.rex(true, src.num(), dst.num());
        self.byte(opcode);
        self.modrm_reg(src.num(), dst.num());
    }

    /// Current emitted length (also exposed through the trait).
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

impl Default for X64Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter for X64Emitter {
    fn conv(&self) -> CallConv {
        CallConv {
            register_args: 6,
            shadow_space: 0,
            stack_align: 16,
        }
    }

    fn arg_reg(&self, index: u8) -> Reg {
        ARG_REGS[index as usize]
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    fn bind(&mut self, label: Label) {
        let at = self.code.len();
        self.labels[label.0 as usize] = Some(at);
    }

    fn offset(&self) -> usize {
        self.code.len()
    }

    fn prologue(&mut self, local_bytes: u32) -> FrameToken {
        // Keep the frame 16-byte aligned: rbp push re-aligns, locals round
        // up.
        let frame_bytes = (local_bytes + 15) & !15;
        self.push(Reg::Rbp);
        self.mov_reg(Reg::Rbp, Reg::Rsp);
        if frame_bytes > 0 {
            // sub rsp, imm32
            self.rex(true, 5, Reg::Rsp.num());
            self.byte(0x81);
            self.modrm_reg(5, Reg::Rsp.num());
            self.imm32(frame_bytes as i32);
        }
        FrameToken { frame_bytes }
    }

    fn epilogue(&mut self, token: FrameToken) {
        let _ = token.frame_bytes;
        // mov rsp, rbp; pop rbp
        self.mov_reg(Reg::Rsp, Reg::Rbp);
        self.pop(Reg::Rbp);
    }

    fn mov_reg(&mut self, dst: Reg, src: Reg) {
        self.alu(0x89, dst, src);
    }

    fn mov_imm(&mut self, dst: Reg, imm: i64) {
        // movabs dst, imm64
        self.rex_force(true, 0, dst.num());
        self.byte(0xB8 | (dst.num() & 7));
        self.bytes(&imm.to_le_bytes());
    }

    fn zero(&mut self, dst: Reg) {
        // xor dst, dst (32-bit form zero-extends)
        self.rex(false, dst.num(), dst.num());
        self.byte(0x31);
        self.modrm_reg(dst.num(), dst.num());
    }

    fn load(&mut self, dst: Reg, base: Reg, offset: i32, size: MemSize, signed: bool) {
        match (size, signed) {
            (MemSize::B8, _) => {
                self.rex_force(true, dst.num(), base.num());
                self.byte(0x8B);
                self.modrm_mem(dst.num(), base.num(), offset);
            }
            (MemSize::B4, false) => {
                self.rex(false, dst.num(), base.num());
                self.byte(0x8B);
                self.modrm_mem(dst.num(), base.num(), offset);
            }
            (MemSize::B4, true) => {
                // movsxd
                self.rex_force(true, dst.num(), base.num());
                self.byte(0x63);
                self.modrm_mem(dst.num(), base.num(), offset);
            }
            (MemSize::B2, false) => {
                self.rex(false, dst.num(), base.num());
                self.bytes(&[0x0F, 0xB7]);
                self.modrm_mem(dst.num(), base.num(), offset);
            }
            (MemSize::B2, true) => {
                self.rex_force(true, dst.num(), base.num());
                self.bytes(&[0x0F, 0xBF]);
                self.modrm_mem(dst.num(), base.num(), offset);
            }
            (MemSize::B1, false) => {
                self.rex(false, dst.num(), base.num());
                self.bytes(&[0x0F, 0xB6]);
                self.modrm_mem(dst.num(), base.num(), offset);
            }
            (MemSize::B1, true) => {
                self.rex_force(true, dst.num(), base.num());
                self.bytes(&[0x0F, 0xBE]);
                self.modrm_mem(dst.num(), base.num(), offset);
            }
        }
    }

    fn store(&mut self, base: Reg, offset: i32, src: Reg, size: MemSize) {
        match size {
            MemSize::B8 => {
                self.rex_force(true, src.num(), base.num());
                self.byte(0x89);
                self.modrm_mem(src.num(), base.num(), offset);
            }
            MemSize::B4 => {
                self.rex(false, src.num(), base.num());
                self.byte(0x89);
                self.modrm_mem(src.num(), base.num(), offset);
            }
            MemSize::B2 => {
                self.byte(0x66);
                self.rex(false, src.num(), base.num());
                self.byte(0x89);
                self.modrm_mem(src.num(), base.num(), offset);
            }
            MemSize::B1 => {
                // Byte stores from RSP/RBP/RSI/RDI need a REX prefix to
                // select the low byte instead of the legacy high byte.
                self.rex_force(false, src.num(), base.num());
                self.byte(0x88);
                self.modrm_mem(src.num(), base.num(), offset);
            }
        }
    }

    fn lea(&mut self, dst: Reg, base: Reg, offset: i32) {
        self.rex_force(true, dst.num(), base.num());
        self.byte(0x8D);
        self.modrm_mem(dst.num(), base.num(), offset);
    }

    fn add(&mut self, dst: Reg, src: Reg) {
        self.alu(0x01, dst, src);
    }

    fn sub(&mut self, dst: Reg, src: Reg) {
        self.alu(0x29, dst, src);
    }

    fn mul(&mut self, dst: Reg, src: Reg) {
        // imul dst, src
        self.rex_force(true, dst.num(), src.num());
        self.bytes(&[0x0F, 0xAF]);
        self.modrm_reg(dst.num(), src.num());
    }

    fn div_signed(&mut self, divisor: Reg) {
        // cqo: sign-extend RAX into RDX:RAX, then idiv
        self.bytes(&[0x48, 0x99]);
        self.rex(true, 7, divisor.num());
        self.byte(0xF7);
        self.modrm_reg(7, divisor.num());
    }

    fn div_unsigned(&mut self, divisor: Reg) {
        self.zero(Reg::Rdx);
        self.rex(true, 6, divisor.num());
        self.byte(0xF7);
        self.modrm_reg(6, divisor.num());
    }

    fn and(&mut self, dst: Reg, src: Reg) {
        self.alu(0x21, dst, src);
    }

    fn or(&mut self, dst: Reg, src: Reg) {
        self.alu(0x09, dst, src);
    }

    fn xor(&mut self, dst: Reg, src: Reg) {
        self.alu(0x31, dst, src);
    }

    fn not(&mut self, dst: Reg) {
        self.rex(true, 2, dst.num());
        self.byte(0xF7);
        self.modrm_reg(2, dst.num());
    }

    fn neg(&mut self, dst: Reg) {
        self.rex(true, 3, dst.num());
        self.byte(0xF7);
        self.modrm_reg(3, dst.num());
    }

    fn shl(&mut self, dst: Reg) {
        self.rex(true, 4, dst.num());
        self.byte(0xD3);
        self.modrm_reg(4, dst.num());
    }

    fn shr_signed(&mut self, dst: Reg) {
        self.rex(true, 7, dst.num());
        self.byte(0xD3);
        self.modrm_reg(7, dst.num());
    }

    fn shr_unsigned(&mut self, dst: Reg) {
        self.rex(true, 5, dst.num());
        self.byte(0xD3);
        self.modrm_reg(5, dst.num());
    }

    fn shl_imm(&mut self, dst: Reg, amount: u8) {
        self.rex(true, 4, dst.num());
        self.byte(0xC1);
        self.modrm_reg(4, dst.num());
        self.byte(amount);
    }

    fn shr_signed_imm(&mut self, dst: Reg, amount: u8) {
        self.rex(true, 7, dst.num());
        self.byte(0xC1);
        self.modrm_reg(7, dst.num());
        self.byte(amount);
    }

    fn shr_unsigned_imm(&mut self, dst: Reg, amount: u8) {
        self.rex(true, 5, dst.num());
        self.byte(0xC1);
        self.modrm_reg(5, dst.num());
        self.byte(amount);
    }

    fn cmp(&mut self, a: Reg, b: Reg, width: Width) {
        match width {
            Width::W64 => self.alu(0x39, a, b),
            Width::W32 => {
                self.rex(false, b.num(), a.num());
                self.byte(0x39);
                self.modrm_reg(b.num(), a.num());
            }
        }
    }

    fn test(&mut self, a: Reg, b: Reg) {
        self.rex(true, b.num(), a.num());
        self.byte(0x85);
        self.modrm_reg(b.num(), a.num());
    }

    fn setcc(&mut self, cond: Cond, dst: Reg) {
        // setcc dst8 (REX so RSP..RDI select their low byte), then widen.
        self.rex_force(false, 0, dst.num());
        self.byte(0x0F);
        self.byte(0x90 | cc_nibble(cond));
        self.modrm_reg(0, dst.num());
        // movzx dst, dst8
        self.rex_force(true, dst.num(), dst.num());
        self.bytes(&[0x0F, 0xB6]);
        self.modrm_reg(dst.num(), dst.num());
    }

    fn jcc(&mut self, cond: Cond, label: Label) {
        self.jump_cc(cc_nibble(cond), label);
    }

    fn jmp(&mut self, label: Label) {
        self.byte(0xE9);
        let site = self.placeholder32();
        self.fixups.push((label, site));
    }

    fn call_reg(&mut self, target: Reg) {
        self.rex(false, 2, target.num());
        self.byte(0xFF);
        self.modrm_reg(2, target.num());
    }

    fn call_rel32(&mut self) -> PatchSite {
        self.byte(0xE8);
        PatchSite(self.placeholder32())
    }

    fn ret(&mut self) {
        self.byte(0xC3);
    }

    fn push(&mut self, src: Reg) {
        self.rex(false, 0, src.num());
        self.byte(0x50 | (src.num() & 7));
    }

    fn pop(&mut self, dst: Reg) {
        self.rex(false, 0, dst.num());
        self.byte(0x58 | (dst.num() & 7));
    }

    fn fload(&mut self, dst: FReg, base: Reg, offset: i32, double: bool) {
        self.byte(if double { 0xF2 } else { 0xF3 });
        self.rex(false, dst as u8, base.num());
        self.bytes(&[0x0F, 0x10]);
        self.modrm_mem(dst as u8, base.num(), offset);
    }

    fn fstore(&mut self, base: Reg, offset: i32, src: FReg, double: bool) {
        self.byte(if double { 0xF2 } else { 0xF3 });
        self.rex(false, src as u8, base.num());
        self.bytes(&[0x0F, 0x11]);
        self.modrm_mem(src as u8, base.num(), offset);
    }

    fn fadd(&mut self, dst: FReg, src: FReg) {
        self.bytes(&[0xF2, 0x0F, 0x58]);
        self.modrm_reg(dst as u8, src as u8);
    }

    fn fsub(&mut self, dst: FReg, src: FReg) {
        self.bytes(&[0xF2, 0x0F, 0x5C]);
        self.modrm_reg(dst as u8, src as u8);
    }

    fn fmul(&mut self, dst: FReg, src: FReg) {
        self.bytes(&[0xF2, 0x0F, 0x59]);
        self.modrm_reg(dst as u8, src as u8);
    }

    fn fdiv(&mut self, dst: FReg, src: FReg) {
        self.bytes(&[0xF2, 0x0F, 0x5E]);
        self.modrm_reg(dst as u8, src as u8);
    }

    fn cvt_int_to_float(&mut self, dst: FReg, src: Reg) {
        // cvtsi2sd xmm, r64
        self.byte(0xF2);
        self.rex_force(true, dst as u8, src.num());
        self.bytes(&[0x0F, 0x2A]);
        self.modrm_reg(dst as u8, src.num());
    }

    fn cvt_float_to_int(&mut self, dst: Reg, src: FReg) {
        // cvttsd2si r64, xmm
        self.byte(0xF2);
        self.rex_force(true, dst.num(), src as u8);
        self.bytes(&[0x0F, 0x2C]);
        self.modrm_reg(dst.num(), src as u8);
    }

    fn checked_add(&mut self, dst: Reg, src: Reg, overflow: Label) {
        self.add(dst, src);
        self.jump_cc(CC_OVERFLOW, overflow);
    }

    fn checked_sub(&mut self, dst: Reg, src: Reg, overflow: Label) {
        self.sub(dst, src);
        self.jump_cc(CC_OVERFLOW, overflow);
    }

    fn checked_mul(&mut self, dst: Reg, src: Reg, overflow: Label) {
        self.mul(dst, src);
        self.jump_cc(CC_OVERFLOW, overflow);
    }

    fn breakpoint(&mut self) {
        self.byte(0xCC);
    }

    fn nop(&mut self) {
        self.byte(0x90);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_imm_is_movabs() {
        let mut e = X64Emitter::new();
        e.mov_imm(Reg::Rax, 0x1122_3344_5566_7788);
        assert_eq!(
            e.finish(),
            alloc::vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn zero_idiom_is_xor32() {
        let mut e = X64Emitter::new();
        e.zero(Reg::Rax);
        assert_eq!(e.finish(), alloc::vec![0x31, 0xC0]);
    }

    #[test]
    fn add_and_ret_encode() {
        let mut e = X64Emitter::new();
        e.add(Reg::Rax, Reg::Rcx);
        e.ret();
        assert_eq!(e.finish(), alloc::vec![0x48, 0x01, 0xC8, 0xC3]);
    }

    #[test]
    fn signed_division_has_sign_extend_prelude() {
        let mut e = X64Emitter::new();
        e.div_signed(Reg::Rcx);
        // cqo; idiv rcx
        assert_eq!(e.finish(), alloc::vec![0x48, 0x99, 0x48, 0xF7, 0xF9]);
    }

    #[test]
    fn load_with_rsp_base_uses_sib() {
        let mut e = X64Emitter::new();
        e.load(Reg::Rax, Reg::Rsp, 8, MemSize::B8, false);
        assert_eq!(
            e.finish(),
            alloc::vec![0x48, 0x8B, 0x84, 0x24, 0x08, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn extended_registers_get_rex_bits() {
        let mut e = X64Emitter::new();
        e.mov_reg(Reg::R8, Reg::R15);
        // REX.WRB 89 /r
        assert_eq!(e.finish(), alloc::vec![0x4D, 0x89, 0xF8]);
    }

    #[test]
    fn forward_label_resolves_to_rel32() {
        let mut e = X64Emitter::new();
        let target = e.new_label();
        e.jmp(target);
        e.nop();
        e.bind(target);
        e.ret();
        // jmp rel32 over one nop: displacement 1.
        assert_eq!(
            e.finish(),
            alloc::vec![0xE9, 0x01, 0x00, 0x00, 0x00, 0x90, 0xC3]
        );
    }

    #[test]
    fn conditional_jump_backward() {
        let mut e = X64Emitter::new();
        let top = e.new_label();
        e.bind(top);
        e.nop();
        e.jcc(Cond::Ne, top);
        let code = e.finish();
        // jne rel32 back over the nop + its own 6 bytes: -7.
        assert_eq!(&code[1..3], &[0x0F, 0x85]);
        assert_eq!(&code[3..7], &(-7i32).to_le_bytes());
    }

    #[test]
    fn call_rel32_leaves_zero_placeholder() {
        let mut e = X64Emitter::new();
        let site = e.call_rel32();
        assert_eq!(site.0, 1);
        let code = e.finish();
        assert_eq!(code, alloc::vec![0xE8, 0, 0, 0, 0]);
    }

    #[test]
    fn checked_add_branches_on_overflow() {
        let mut e = X64Emitter::new();
        let overflow = e.new_label();
        e.checked_add(Reg::Rax, Reg::Rcx, overflow);
        e.ret();
        e.bind(overflow);
        e.breakpoint();
        let code = e.finish();
        // add; jo rel32 (=1, over the ret); ret; int3
        assert_eq!(&code[0..3], &[0x48, 0x01, 0xC8]);
        assert_eq!(&code[3..5], &[0x0F, 0x80]);
        assert_eq!(&code[5..9], &1i32.to_le_bytes());
        assert_eq!(code[9], 0xC3);
        assert_eq!(code[10], 0xCC);
    }

    #[test]
    fn prologue_epilogue_pair_frames_the_stack() {
        let mut e = X64Emitter::new();
        let token = e.prologue(24);
        e.epilogue(token);
        e.ret();
        let code = e.finish();
        // push rbp; mov rbp, rsp; sub rsp, 32 (rounded); mov rsp, rbp;
        // pop rbp; ret
        assert_eq!(
            code,
            alloc::vec![
                0x55, // push rbp
                0x48, 0x89, 0xE5, // mov rbp, rsp
                0x48, 0x81, 0xEC, 0x20, 0x00, 0x00, 0x00, // sub rsp, 32
                0x48, 0x89, 0xEC, // mov rsp, rbp
                0x5D, // pop rbp
                0xC3, // ret
            ]
        );
    }

    #[test]
    fn calling_convention_report() {
        let e = X64Emitter::new();
        let conv = e.conv();
        assert_eq!(conv.register_args, 6);
        assert_eq!(conv.shadow_space, 0);
        assert_eq!(conv.stack_align, 16);
        assert_eq!(e.arg_reg(0), Reg::Rdi);
        assert_eq!(e.arg_reg(3), Reg::Rcx);
    }
}
