//! x86-64 instruction encoder
//!
//! A small assembler producing position-independent machine code into a
//! byte buffer: REX/ModRM/SIB encoding, rel32 labels, and exactly the
//! instruction selection the tier-0 code generator needs. Memory operands
//! are `[base + disp]` only; disp8 is used when it fits.

/// General purpose registers in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
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
    fn low(self) -> u8 {
        self as u8 & 7
    }

    fn ext(self) -> bool {
        self as u8 >= 8
    }

    /// Register number for stackmap records.
    pub fn number(self) -> u8 {
        self as u8
    }
}

/// SSE registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Fpr {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
}

impl Fpr {
    fn low(self) -> u8 {
        self as u8 & 7
    }
}

/// Condition codes for `jcc`/`setcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    /// The negated condition.
    pub fn negate(self) -> Cond {
        // Flipping the low bit negates every x86 condition
        let raw = self as u8 ^ 1;
        // Safety-free conversion through match
        [
            Cond::O,
            Cond::No,
            Cond::B,
            Cond::Ae,
            Cond::E,
            Cond::Ne,
            Cond::Be,
            Cond::A,
            Cond::S,
            Cond::Ns,
            Cond::P,
            Cond::Np,
            Cond::L,
            Cond::Ge,
            Cond::Le,
            Cond::G,
        ][raw as usize]
    }
}

/// A forward-referenced code position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// What a recorded rel32 is measured against.
#[derive(Debug, Clone, Copy)]
enum FixBase {
    /// End of the 4-byte field (ordinary rel32 operands).
    NextField,
    /// A bound label (jump-table entries relative to the table base).
    Label(Label),
}

struct Fixup {
    at: usize,
    target: Label,
    base: FixBase,
}

/// The assembler.
#[derive(Default)]
pub struct Asm {
    buf: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Asm {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current code offset.
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    /// Allocate an unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label at the current offset.
    pub fn bind(&mut self, label: Label) {
        assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.buf.len());
    }

    /// Offset a label was bound at.
    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels[label.0]
    }

    /// Patch fixups and return the finished bytes.
    pub fn finish(mut self) -> Vec<u8> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.target.0].expect("unbound label");
            let base = match fixup.base {
                FixBase::NextField => fixup.at as i64 + 4,
                FixBase::Label(l) => self.labels[l.0].expect("unbound base label") as i64,
            };
            let rel = target as i64 - base;
            let rel32 = i32::try_from(rel).expect("branch out of range");
            self.buf[fixup.at..fixup.at + 4].copy_from_slice(&rel32.to_le_bytes());
        }
        self.buf
    }

    fn rel32_fixup(&mut self, target: Label) {
        self.fixups.push(Fixup {
            at: self.buf.len(),
            target,
            base: FixBase::NextField,
        });
        self.imm32(0);
    }

    // ===== Byte-level helpers =====

    fn byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn bytes(&mut self, bs: &[u8]) {
        self.buf.extend_from_slice(bs);
    }

    fn imm32(&mut self, v: i32) {
        self.bytes(&v.to_le_bytes());
    }

    fn rex(&mut self, w: bool, r: bool, b: bool) {
        let mut rex = 0x40u8;
        if w {
            rex |= 8;
        }
        if r {
            rex |= 4;
        }
        if b {
            rex |= 1;
        }
        self.byte(rex);
    }

    /// REX where any extension or width forces the prefix; 8-bit ops on
    /// rsp/rbp/rsi/rdi also need it to address sil/dil.
    fn rex_opt(&mut self, w: bool, r: bool, b: bool, force: bool) {
        if w || r || b || force {
            self.rex(w, r, b);
        }
    }

    fn modrm(&mut self, md: u8, reg: u8, rm: u8) {
        self.byte((md << 6) | (reg << 3) | rm);
    }

    /// ModRM+SIB+disp for a `[base + disp]` operand with `reg` in the reg
    /// field.
    fn mem(&mut self, reg: u8, base: Reg, disp: i32) {
        let rm = base.low();
        let need_sib = rm == 4; // rsp/r12
        let small = i8::try_from(disp).is_ok();
        // rbp/r13 with mod=00 would mean rip-relative, so always use a disp
        let md = if disp == 0 && rm != 5 {
            0
        } else if small {
            1
        } else {
            2
        };
        self.modrm(md, reg, rm);
        if need_sib {
            self.byte(0x24); // scale=0, index=none, base=rsp/r12
        }
        match md {
            1 => self.byte(disp as i8 as u8),
            2 => self.imm32(disp),
            _ => {}
        }
    }

    // ===== Moves =====

    /// `mov dst, src`
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.ext(), dst.ext());
        self.byte(0x89);
        self.modrm(3, src.low(), dst.low());
    }

    /// `mov dst, imm` (64-bit immediate when it does not fit i32)
    pub fn mov_ri(&mut self, dst: Reg, imm: i64) {
        if let Ok(v) = i32::try_from(imm) {
            self.rex(true, false, dst.ext());
            self.byte(0xC7);
            self.modrm(3, 0, dst.low());
            self.imm32(v);
        } else {
            self.rex(true, false, dst.ext());
            self.byte(0xB8 + dst.low());
            self.bytes(&imm.to_le_bytes());
        }
    }

    /// `mov dst, [base + disp]` (64-bit load)
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.ext(), base.ext());
        self.byte(0x8B);
        self.mem(dst.low(), base, disp);
    }

    /// `mov [base + disp], src` (64-bit store)
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex(true, src.ext(), base.ext());
        self.byte(0x89);
        self.mem(src.low(), base, disp);
    }

    /// `mov [base + disp], imm32` (sign-extended 64-bit store)
    pub fn mov_mi(&mut self, base: Reg, disp: i32, imm: i32) {
        self.rex(true, false, base.ext());
        self.byte(0xC7);
        self.mem(0, base, disp);
        self.imm32(imm);
    }

    /// Load of `size` bytes, zero-extended (1, 2, 4) or full (8).
    pub fn load_zx(&mut self, size: u8, dst: Reg, base: Reg, disp: i32) {
        match size {
            1 => {
                self.rex_opt(false, dst.ext(), base.ext(), false);
                self.bytes(&[0x0F, 0xB6]);
                self.mem(dst.low(), base, disp);
            }
            2 => {
                self.rex_opt(false, dst.ext(), base.ext(), false);
                self.bytes(&[0x0F, 0xB7]);
                self.mem(dst.low(), base, disp);
            }
            4 => {
                // 32-bit mov zero-extends
                self.rex_opt(false, dst.ext(), base.ext(), false);
                self.byte(0x8B);
                self.mem(dst.low(), base, disp);
            }
            8 => self.mov_rm(dst, base, disp),
            _ => unreachable!("bad load size"),
        }
    }

    /// Load of `size` bytes, sign-extended to 64 bits.
    pub fn load_sx(&mut self, size: u8, dst: Reg, base: Reg, disp: i32) {
        match size {
            1 => {
                self.rex(true, dst.ext(), base.ext());
                self.bytes(&[0x0F, 0xBE]);
                self.mem(dst.low(), base, disp);
            }
            2 => {
                self.rex(true, dst.ext(), base.ext());
                self.bytes(&[0x0F, 0xBF]);
                self.mem(dst.low(), base, disp);
            }
            4 => {
                self.rex(true, dst.ext(), base.ext());
                self.byte(0x63); // movsxd
                self.mem(dst.low(), base, disp);
            }
            8 => self.mov_rm(dst, base, disp),
            _ => unreachable!("bad load size"),
        }
    }

    /// Store of the low `size` bytes of `src`.
    pub fn store(&mut self, size: u8, base: Reg, disp: i32, src: Reg) {
        match size {
            1 => {
                // REX needed for sil/dil/spl/bpl
                let force = matches!(src, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi);
                self.rex_opt(false, src.ext(), base.ext(), force);
                self.byte(0x88);
                self.mem(src.low(), base, disp);
            }
            2 => {
                self.byte(0x66);
                self.rex_opt(false, src.ext(), base.ext(), false);
                self.byte(0x89);
                self.mem(src.low(), base, disp);
            }
            4 => {
                self.rex_opt(false, src.ext(), base.ext(), false);
                self.byte(0x89);
                self.mem(src.low(), base, disp);
            }
            8 => self.mov_mr(base, disp, src),
            _ => unreachable!("bad store size"),
        }
    }

    /// Sign-extend the low 32 bits of a register into 64 (`movsxd`).
    pub fn sext32(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst.ext(), src.ext());
        self.byte(0x63);
        self.modrm(3, dst.low(), src.low());
    }

    /// Zero-extend the low 32 bits (`mov r32, r32`).
    pub fn zext32(&mut self, dst: Reg, src: Reg) {
        self.rex_opt(false, src.ext(), dst.ext(), false);
        self.byte(0x89);
        self.modrm(3, src.low(), dst.low());
    }

    /// Sign- or zero-extend a sub-register into 64 bits.
    pub fn extend(&mut self, size: u8, signed: bool, dst: Reg, src: Reg) {
        match (size, signed) {
            (1, true) => {
                self.rex(true, dst.ext(), src.ext());
                self.bytes(&[0x0F, 0xBE]);
                self.modrm(3, dst.low(), src.low());
            }
            (1, false) => {
                self.rex(true, dst.ext(), src.ext());
                self.bytes(&[0x0F, 0xB6]);
                self.modrm(3, dst.low(), src.low());
            }
            (2, true) => {
                self.rex(true, dst.ext(), src.ext());
                self.bytes(&[0x0F, 0xBF]);
                self.modrm(3, dst.low(), src.low());
            }
            (2, false) => {
                self.rex(true, dst.ext(), src.ext());
                self.bytes(&[0x0F, 0xB7]);
                self.modrm(3, dst.low(), src.low());
            }
            (4, true) => self.sext32(dst, src),
            (4, false) => self.zext32(dst, src),
            (8, _) => {
                if dst != src {
                    self.mov_rr(dst, src)
                }
            }
            _ => unreachable!("bad extend size"),
        }
    }

    // ===== Integer ALU =====

    fn alu_rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.rex(true, src.ext(), dst.ext());
        self.byte(opcode);
        self.modrm(3, src.low(), dst.low());
    }

    fn alu_ri(&mut self, slash: u8, dst: Reg, imm: i32) {
        self.rex(true, false, dst.ext());
        self.byte(0x81);
        self.modrm(3, slash, dst.low());
        self.imm32(imm);
    }

    /// `add dst, src`
    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x01, dst, src);
    }

    /// `add dst, imm32`
    pub fn add_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(0, dst, imm);
    }

    /// `sub dst, src`
    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x29, dst, src);
    }

    /// `sub dst, imm32`
    pub fn sub_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(5, dst, imm);
    }

    /// `and dst, src`
    pub fn and_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x21, dst, src);
    }

    /// `and dst, imm32`
    pub fn and_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(4, dst, imm);
    }

    /// `or dst, src`
    pub fn or_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x09, dst, src);
    }

    /// `xor dst, src`
    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x31, dst, src);
    }

    /// `cmp dst, src`
    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x39, dst, src);
    }

    /// `cmp dst, imm32`
    pub fn cmp_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_ri(7, dst, imm);
    }

    /// `cmp [base + disp], imm32` (32-bit compare)
    pub fn cmp32_mi(&mut self, base: Reg, disp: i32, imm: i32) {
        self.rex_opt(false, false, base.ext(), false);
        self.byte(0x81);
        self.mem(7, base, disp);
        self.imm32(imm);
    }

    /// `imul dst, src`
    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst.ext(), src.ext());
        self.bytes(&[0x0F, 0xAF]);
        self.modrm(3, dst.low(), src.low());
    }

    /// `cqo` (sign-extend rax into rdx:rax)
    pub fn cqo(&mut self) {
        self.bytes(&[0x48, 0x99]);
    }

    /// `xor edx, edx` (zero rdx for unsigned division)
    pub fn zero_rdx(&mut self) {
        self.bytes(&[0x31, 0xD2]);
    }

    /// `idiv src` (rdx:rax / src)
    pub fn idiv(&mut self, src: Reg) {
        self.rex(true, false, src.ext());
        self.byte(0xF7);
        self.modrm(3, 7, src.low());
    }

    /// `div src` (unsigned)
    pub fn div(&mut self, src: Reg) {
        self.rex(true, false, src.ext());
        self.byte(0xF7);
        self.modrm(3, 6, src.low());
    }

    /// `neg dst`
    pub fn neg(&mut self, dst: Reg) {
        self.rex(true, false, dst.ext());
        self.byte(0xF7);
        self.modrm(3, 3, dst.low());
    }

    /// `not dst`
    pub fn not(&mut self, dst: Reg) {
        self.rex(true, false, dst.ext());
        self.byte(0xF7);
        self.modrm(3, 2, dst.low());
    }

    /// Shift by `cl`: 4 = shl, 5 = shr, 7 = sar.
    pub fn shift_cl(&mut self, slash: u8, dst: Reg) {
        self.rex(true, false, dst.ext());
        self.byte(0xD3);
        self.modrm(3, slash, dst.low());
    }

    /// Shift by an immediate: 4 = shl, 5 = shr, 7 = sar.
    pub fn shift_imm(&mut self, slash: u8, dst: Reg, imm: u8) {
        self.rex(true, false, dst.ext());
        self.byte(0xC1);
        self.modrm(3, slash, dst.low());
        self.byte(imm);
    }

    /// `test dst, src`
    pub fn test_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x85, dst, src);
    }

    /// `setcc dst8` then zero-extend to 64 bits.
    pub fn setcc_zx(&mut self, cond: Cond, dst: Reg) {
        let force = matches!(dst, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi);
        self.rex_opt(false, false, dst.ext(), force);
        self.bytes(&[0x0F, 0x90 + cond as u8]);
        self.modrm(3, 0, dst.low());
        self.extend(1, false, dst, dst);
    }

    /// `lea dst, [base + disp]`
    pub fn lea(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.ext(), base.ext());
        self.byte(0x8D);
        self.mem(dst.low(), base, disp);
    }

    // ===== Control flow =====

    /// `jcc label`
    pub fn jcc(&mut self, cond: Cond, target: Label) {
        self.bytes(&[0x0F, 0x80 + cond as u8]);
        self.rel32_fixup(target);
    }

    /// `jmp label`
    pub fn jmp(&mut self, target: Label) {
        self.byte(0xE9);
        self.rel32_fixup(target);
    }

    /// `jmp reg`
    pub fn jmp_r(&mut self, target: Reg) {
        self.rex_opt(false, false, target.ext(), false);
        self.byte(0xFF);
        self.modrm(3, 4, target.low());
    }

    /// `call label`
    pub fn call(&mut self, target: Label) {
        self.byte(0xE8);
        self.rel32_fixup(target);
    }

    /// `lea dst, [rip + label]`: position-independent address of a label.
    pub fn lea_rip(&mut self, dst: Reg, target: Label) {
        self.rex(true, dst.ext(), false);
        self.byte(0x8D);
        self.modrm(0, dst.low(), 5);
        self.rel32_fixup(target);
    }

    /// Emit a 4-byte jump-table entry: `target - base`.
    pub fn table_entry(&mut self, target: Label, base: Label) {
        self.fixups.push(Fixup {
            at: self.buf.len(),
            target,
            base: FixBase::Label(base),
        });
        self.imm32(0);
    }

    /// `call reg`
    pub fn call_r(&mut self, target: Reg) {
        self.rex_opt(false, false, target.ext(), false);
        self.byte(0xFF);
        self.modrm(3, 2, target.low());
    }

    /// `call [base + disp]`
    pub fn call_m(&mut self, base: Reg, disp: i32) {
        self.rex_opt(false, false, base.ext(), false);
        self.byte(0xFF);
        self.mem(2, base, disp);
    }

    /// `ret`
    pub fn ret(&mut self) {
        self.byte(0xC3);
    }

    /// `ret imm16` (callee pops its arguments)
    pub fn ret_imm(&mut self, bytes: u16) {
        self.byte(0xC2);
        self.bytes(&bytes.to_le_bytes());
    }

    /// `push reg`
    pub fn push(&mut self, reg: Reg) {
        self.rex_opt(false, false, reg.ext(), false);
        self.byte(0x50 + reg.low());
    }

    /// `pop reg`
    pub fn pop(&mut self, reg: Reg) {
        self.rex_opt(false, false, reg.ext(), false);
        self.byte(0x58 + reg.low());
    }

    /// `ud2`: unreachable marker after no-return helper calls.
    pub fn ud2(&mut self) {
        self.bytes(&[0x0F, 0x0B]);
    }

    // ===== SSE =====

    /// `movq xmm, reg`
    pub fn movq_xr(&mut self, dst: Fpr, src: Reg) {
        self.byte(0x66);
        self.rex(true, false, src.ext());
        self.bytes(&[0x0F, 0x6E]);
        self.modrm(3, dst.low(), src.low());
    }

    /// `movq reg, xmm`
    pub fn movq_rx(&mut self, dst: Reg, src: Fpr) {
        self.byte(0x66);
        self.rex(true, false, dst.ext());
        self.bytes(&[0x0F, 0x7E]);
        self.modrm(3, src.low(), dst.low());
    }

    fn sse_op(&mut self, prefix: u8, opcode: u8, dst: Fpr, src: Fpr) {
        self.byte(prefix);
        self.bytes(&[0x0F, opcode]);
        self.modrm(3, dst.low(), src.low());
    }

    /// Scalar float arithmetic: `op dst, src`. `double` picks sd vs ss.
    pub fn float_arith(&mut self, op: FloatOp, double: bool, dst: Fpr, src: Fpr) {
        let prefix = if double { 0xF2 } else { 0xF3 };
        let opcode = match op {
            FloatOp::Add => 0x58,
            FloatOp::Sub => 0x5C,
            FloatOp::Mul => 0x59,
            FloatOp::Div => 0x5E,
        };
        self.sse_op(prefix, opcode, dst, src);
    }

    /// `ucomisd`/`ucomiss dst, src`
    pub fn ucomis(&mut self, double: bool, dst: Fpr, src: Fpr) {
        if double {
            self.byte(0x66);
        }
        self.bytes(&[0x0F, 0x2E]);
        self.modrm(3, dst.low(), src.low());
    }

    /// `cvtsi2sd`/`cvtsi2ss xmm, r64`
    pub fn cvt_int_to_float(&mut self, double: bool, dst: Fpr, src: Reg) {
        self.byte(if double { 0xF2 } else { 0xF3 });
        self.rex(true, false, src.ext());
        self.bytes(&[0x0F, 0x2A]);
        self.modrm(3, dst.low(), src.low());
    }

    /// `cvttsd2si`/`cvttss2si r64, xmm` (truncating)
    pub fn cvt_float_to_int(&mut self, double: bool, dst: Reg, src: Fpr) {
        self.byte(if double { 0xF2 } else { 0xF3 });
        self.rex(true, dst.ext(), false);
        self.bytes(&[0x0F, 0x2C]);
        self.modrm(3, dst.low(), src.low());
    }

    /// `cvtsd2ss` / `cvtss2sd`
    pub fn cvt_float_to_float(&mut self, from_double: bool, dst: Fpr, src: Fpr) {
        self.sse_op(if from_double { 0xF2 } else { 0xF3 }, 0x5A, dst, src);
    }

    // ===== Atomics =====

    /// `lock cmpxchg [base + disp], src` (compare rax, exchange with src)
    pub fn lock_cmpxchg(&mut self, base: Reg, disp: i32, src: Reg) {
        self.byte(0xF0);
        self.rex(true, src.ext(), base.ext());
        self.bytes(&[0x0F, 0xB1]);
        self.mem(src.low(), base, disp);
    }

    /// `lock xadd [base + disp], src`
    pub fn lock_xadd(&mut self, base: Reg, disp: i32, src: Reg) {
        self.byte(0xF0);
        self.rex(true, src.ext(), base.ext());
        self.bytes(&[0x0F, 0xC1]);
        self.mem(src.low(), base, disp);
    }

    /// `mfence`
    pub fn mfence(&mut self) {
        self.bytes(&[0x0F, 0xAE, 0xF0]);
    }
}

/// Scalar float operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}
