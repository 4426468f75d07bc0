//! Method bodies: code, locals, exception regions
//!
//! Bodies carry raw instruction bytes; [`InstrReader`] decodes them one
//! instruction at a time and [`InstrWriter`] builds them (used by the
//! runtime's intrinsic bodies and throughout the test suites).
//!
//! Branch operands are relative to the offset of the *next* instruction.

use crate::opcode::{Opcode, PrimKind};
use crate::module::Token;
use crate::sig::TypeSig;
use thiserror::Error;

/// What kind of handler an exception region attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EhKind {
    /// Catch by type: handler runs when the thrown type is assignable to it.
    Catch(Token),
    /// Filter: a funclet decides at search time whether the handler runs.
    Filter {
        /// Offset of the filter funclet. The funclet ends at `handler_offset`.
        filter_offset: u32,
    },
    /// Finally: runs whenever control leaves the try, normally or not.
    Finally,
    /// Fault: runs only when control leaves the try on an exception.
    Fault,
}

/// One protected region of a method body.
///
/// Regions are listed innermost-first, the order in which the dispatcher
/// examines them.
#[derive(Debug, Clone)]
pub struct EhRegion {
    /// Handler kind.
    pub kind: EhKind,
    /// Start of the protected range.
    pub try_offset: u32,
    /// Length of the protected range.
    pub try_len: u32,
    /// Start of the handler funclet.
    pub handler_offset: u32,
    /// Length of the handler funclet.
    pub handler_len: u32,
}

impl EhRegion {
    /// Whether `offset` lies in the protected range.
    pub fn protects(&self, offset: u32) -> bool {
        offset >= self.try_offset && offset < self.try_offset + self.try_len
    }

    /// Whether `offset` lies in the handler (or filter) funclet.
    pub fn handles_at(&self, offset: u32) -> bool {
        let in_handler = offset >= self.handler_offset && offset < self.handler_offset + self.handler_len;
        let in_filter = match self.kind {
            EhKind::Filter { filter_offset } => {
                offset >= filter_offset && offset < self.handler_offset
            }
            _ => false,
        };
        in_handler || in_filter
    }
}

/// A method body.
#[derive(Debug, Clone, Default)]
pub struct MethodBody {
    /// Upper bound on evaluation stack depth, computed by the producer.
    pub max_stack: u16,
    /// Local variable signatures. Locals are zero-initialized.
    pub locals: Vec<TypeSig>,
    /// Raw instruction bytes.
    pub code: Vec<u8>,
    /// Protected regions, innermost first.
    pub eh: Vec<EhRegion>,
}

/// Operand of a decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// Argument or local index
    Slot(u16),
    /// 32-bit integer immediate
    I32(i32),
    /// 64-bit integer immediate
    I64(i64),
    /// 32-bit float immediate
    F32(f32),
    /// 64-bit float immediate
    F64(f64),
    /// Metadata token
    Token(Token),
    /// Element token plus rank, for multi-dimension allocation
    TokenRank(Token, u8),
    /// Primitive kind, for conversions and indirect access
    Kind(PrimKind),
    /// Branch target as an absolute code offset (already rebased)
    Target(u32),
    /// Jump table of absolute code offsets
    Switch(Vec<u32>),
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    /// Offset of the opcode byte.
    pub offset: u32,
    /// Offset of the following instruction.
    pub next_offset: u32,
    /// The opcode.
    pub op: Opcode,
    /// The operand.
    pub operand: Operand,
}

/// Instruction decoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Byte does not decode to an opcode.
    #[error("unknown opcode {byte:#04x} at offset {offset}")]
    UnknownOpcode {
        /// The undecodable byte.
        byte: u8,
        /// Offset of the byte.
        offset: u32,
    },

    /// Operand bytes run past the end of the body.
    #[error("truncated instruction at offset {0}")]
    Truncated(u32),

    /// Operand byte is not a primitive kind.
    #[error("invalid primitive kind {byte:#04x} at offset {offset}")]
    BadPrimKind {
        /// The invalid operand byte.
        byte: u8,
        /// Offset of the instruction.
        offset: u32,
    },

    /// A branch target lands outside the body or into an operand.
    #[error("branch target {target} out of range at offset {offset}")]
    BadTarget {
        /// The absolute target offset.
        target: i64,
        /// Offset of the branching instruction.
        offset: u32,
    },
}

/// Streaming decoder over a body's instruction bytes.
pub struct InstrReader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> InstrReader<'a> {
    /// Create a reader over raw instruction bytes.
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, pos: 0 }
    }

    /// Current offset into the code.
    pub fn offset(&self) -> u32 {
        self.pos as u32
    }

    /// Whether the reader has consumed all bytes.
    pub fn at_end(&self) -> bool {
        self.pos >= self.code.len()
    }

    /// Position the reader at an absolute offset.
    pub fn seek(&mut self, offset: u32) {
        self.pos = offset as usize;
    }

    /// Decode the instruction at the current offset and advance.
    pub fn next_instr(&mut self) -> Result<Instr, DecodeError> {
        let offset = self.pos as u32;
        let byte = self.read_u8(offset)?;
        let op = Opcode::from_u8(byte).ok_or(DecodeError::UnknownOpcode { byte, offset })?;

        use Opcode::*;
        let operand = match op {
            LdcI4 => Operand::I32(self.read_u32(offset)? as i32),
            LdcI8 => Operand::I64(self.read_u64(offset)? as i64),
            LdcR4 => Operand::F32(f32::from_bits(self.read_u32(offset)?)),
            LdcR8 => Operand::F64(f64::from_bits(self.read_u64(offset)?)),
            LdArg | StArg | LdLoc | StLoc | LdLocA => Operand::Slot(self.read_u16(offset)?),
            LdStr | Call | CallVirt | CallI | NewObj | NewArr | LdElem | StElem | LdFld
            | StFld | LdSFld | StSFld | Box | Unbox | CastClass | IsInst | LdFtn | LdVirtFtn => {
                Operand::Token(Token(self.read_u32(offset)?))
            }
            NewArrMulti => {
                let token = Token(self.read_u32(offset)?);
                let rank = self.read_u8(offset)?;
                Operand::TokenRank(token, rank)
            }
            Conv | ConvOvf | LdInd | StInd => {
                let byte = self.read_u8(offset)?;
                let kind = PrimKind::from_u8(byte)
                    .ok_or(DecodeError::BadPrimKind { byte, offset })?;
                Operand::Kind(kind)
            }
            Br | BrTrue | BrFalse | Beq | Bne | Blt | BltUn | Ble | BleUn | Bgt | BgtUn | Bge
            | BgeUn | Leave => {
                let rel = self.read_u32(offset)? as i32;
                Operand::Target(self.rebase(offset, rel)?)
            }
            Switch => {
                let count = self.read_u32(offset)?;
                let mut rels = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    rels.push(self.read_u32(offset)? as i32);
                }
                let end = self.pos as u32;
                let mut targets = Vec::with_capacity(rels.len());
                for rel in rels {
                    let target = end as i64 + rel as i64;
                    if target < 0 || target > self.code.len() as i64 {
                        return Err(DecodeError::BadTarget { target, offset });
                    }
                    targets.push(target as u32);
                }
                Operand::Switch(targets)
            }
            _ => Operand::None,
        };

        Ok(Instr {
            offset,
            next_offset: self.pos as u32,
            op,
            operand,
        })
    }

    /// Convert a relative branch operand to an absolute offset.
    fn rebase(&self, offset: u32, rel: i32) -> Result<u32, DecodeError> {
        let target = self.pos as i64 + rel as i64;
        if target < 0 || target > self.code.len() as i64 {
            return Err(DecodeError::BadTarget { target, offset });
        }
        Ok(target as u32)
    }

    fn read_u8(&mut self, at: u32) -> Result<u8, DecodeError> {
        let b = *self.code.get(self.pos).ok_or(DecodeError::Truncated(at))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self, at: u32) -> Result<u16, DecodeError> {
        let end = self.pos + 2;
        let bytes = self.code.get(self.pos..end).ok_or(DecodeError::Truncated(at))?;
        self.pos = end;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u32(&mut self, at: u32) -> Result<u32, DecodeError> {
        let end = self.pos + 4;
        let bytes = self.code.get(self.pos..end).ok_or(DecodeError::Truncated(at))?;
        self.pos = end;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&mut self, at: u32) -> Result<u64, DecodeError> {
        let end = self.pos + 8;
        let bytes = self.code.get(self.pos..end).ok_or(DecodeError::Truncated(at))?;
        self.pos = end;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }
}

/// A forward-reference label handed out by [`InstrWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Builder for instruction streams with label-based branch patching.
#[derive(Default)]
pub struct InstrWriter {
    code: Vec<u8>,
    // (patch site, label) pairs for rel32 operands
    fixups: Vec<(usize, Label)>,
    labels: Vec<Option<u32>>,
}

impl InstrWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current code offset.
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    /// Allocate an unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the current offset.
    pub fn bind(&mut self, label: Label) {
        assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len() as u32);
    }

    /// Emit an operand-less instruction.
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.code.push(op as u8);
        self
    }

    /// Emit an instruction with a slot operand.
    pub fn slot(&mut self, op: Opcode, index: u16) -> &mut Self {
        self.code.push(op as u8);
        self.code.extend_from_slice(&index.to_le_bytes());
        self
    }

    /// Emit `LdcI4`.
    pub fn ldc_i4(&mut self, value: i32) -> &mut Self {
        self.code.push(Opcode::LdcI4 as u8);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Emit `LdcI8`.
    pub fn ldc_i8(&mut self, value: i64) -> &mut Self {
        self.code.push(Opcode::LdcI8 as u8);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Emit `LdcR8`.
    pub fn ldc_r8(&mut self, value: f64) -> &mut Self {
        self.code.push(Opcode::LdcR8 as u8);
        self.code.extend_from_slice(&value.to_bits().to_le_bytes());
        self
    }

    /// Emit an instruction with a token operand.
    pub fn token(&mut self, op: Opcode, token: Token) -> &mut Self {
        self.code.push(op as u8);
        self.code.extend_from_slice(&token.0.to_le_bytes());
        self
    }

    /// Emit an instruction with a primitive-kind operand.
    pub fn kind(&mut self, op: Opcode, kind: PrimKind) -> &mut Self {
        self.code.push(op as u8);
        self.code.push(kind as u8);
        self
    }

    /// Emit a branch to a label.
    pub fn branch(&mut self, op: Opcode, target: Label) -> &mut Self {
        self.code.push(op as u8);
        self.fixups.push((self.code.len(), target));
        self.code.extend_from_slice(&0i32.to_le_bytes());
        self
    }

    /// Emit a switch over labels.
    pub fn switch(&mut self, targets: &[Label]) -> &mut Self {
        self.code.push(Opcode::Switch as u8);
        self.code
            .extend_from_slice(&(targets.len() as u32).to_le_bytes());
        for &target in targets {
            self.fixups.push((self.code.len(), target));
            self.code.extend_from_slice(&0i32.to_le_bytes());
        }
        self
    }

    /// Emit `NewArrMulti`.
    pub fn newarr_multi(&mut self, element: Token, rank: u8) -> &mut Self {
        self.code.push(Opcode::NewArrMulti as u8);
        self.code.extend_from_slice(&element.0.to_le_bytes());
        self.code.push(rank);
        self
    }

    /// Patch all fixups and return the finished instruction bytes.
    ///
    /// Relative operands are computed against the end of their instruction;
    /// for `Switch` that is the end of the whole jump table.
    pub fn finish(mut self) -> Vec<u8> {
        // Group switch fixups by their instruction end: every rel32 patched
        // here is relative to the end of the operand block it sits in, which
        // for single-target branches is site + 4. For switch tables the end
        // is the end of the last entry; find it by scanning forward over
        // adjacent fixup sites.
        let mut i = 0;
        while i < self.fixups.len() {
            // Find the run of contiguous fixup sites (a switch table)
            let mut j = i;
            while j + 1 < self.fixups.len() && self.fixups[j + 1].0 == self.fixups[j].0 + 4 {
                j += 1;
            }
            let end = self.fixups[j].0 + 4;
            for &(site, label) in &self.fixups[i..=j] {
                let target = self.labels[label.0].expect("unbound label");
                let rel = target as i64 - end as i64;
                self.code[site..site + 4].copy_from_slice(&(rel as i32).to_le_bytes());
            }
            i = j + 1;
        }
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_constants() {
        let mut w = InstrWriter::new();
        w.ldc_i4(7).ldc_i8(-1).ldc_r8(2.5).op(Opcode::Ret);
        let code = w.finish();

        let mut r = InstrReader::new(&code);
        assert_eq!(r.next_instr().unwrap().operand, Operand::I32(7));
        assert_eq!(r.next_instr().unwrap().operand, Operand::I64(-1));
        assert_eq!(r.next_instr().unwrap().operand, Operand::F64(2.5));
        assert_eq!(r.next_instr().unwrap().op, Opcode::Ret);
        assert!(r.at_end());
    }

    #[test]
    fn test_branch_label_patching() {
        // ldc.i4 0; brtrue L; ldc.i4 1; ret; L: ldc.i4 2; ret
        let mut w = InstrWriter::new();
        let l = w.label();
        w.ldc_i4(0);
        w.branch(Opcode::BrTrue, l);
        w.ldc_i4(1).op(Opcode::Ret);
        w.bind(l);
        w.ldc_i4(2).op(Opcode::Ret);
        let code = w.finish();

        let mut r = InstrReader::new(&code);
        r.next_instr().unwrap();
        let br = r.next_instr().unwrap();
        // Target is the bound offset of L
        match br.operand {
            Operand::Target(t) => {
                let mut r2 = InstrReader::new(&code);
                r2.seek(t);
                assert_eq!(r2.next_instr().unwrap().operand, Operand::I32(2));
            }
            other => panic!("expected target, got {other:?}"),
        }
    }

    #[test]
    fn test_backward_branch() {
        let mut w = InstrWriter::new();
        let top = w.label();
        w.bind(top);
        w.op(Opcode::Nop);
        w.branch(Opcode::Br, top);
        let code = w.finish();

        let mut r = InstrReader::new(&code);
        r.next_instr().unwrap();
        let br = r.next_instr().unwrap();
        assert_eq!(br.operand, Operand::Target(0));
    }

    #[test]
    fn test_switch_targets() {
        let mut w = InstrWriter::new();
        let (a, b) = (w.label(), w.label());
        w.ldc_i4(1);
        w.switch(&[a, b]);
        w.bind(a);
        w.op(Opcode::Nop);
        w.bind(b);
        w.op(Opcode::Ret);
        let code = w.finish();

        let mut r = InstrReader::new(&code);
        r.next_instr().unwrap();
        let sw = r.next_instr().unwrap();
        match sw.operand {
            Operand::Switch(targets) => {
                assert_eq!(targets.len(), 2);
                assert_eq!(targets[1], targets[0] + 1); // b is one Nop after a
            }
            other => panic!("expected switch, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_body() {
        let code = [Opcode::LdcI4 as u8, 0x01];
        let mut r = InstrReader::new(&code);
        assert!(matches!(r.next_instr(), Err(DecodeError::Truncated(0))));
    }

    #[test]
    fn test_unknown_opcode() {
        let code = [0xEE];
        let mut r = InstrReader::new(&code);
        assert!(matches!(
            r.next_instr(),
            Err(DecodeError::UnknownOpcode { byte: 0xEE, .. })
        ));
    }

    #[test]
    fn test_eh_region_ranges() {
        let region = EhRegion {
            kind: EhKind::Finally,
            try_offset: 4,
            try_len: 8,
            handler_offset: 12,
            handler_len: 4,
        };
        assert!(region.protects(4));
        assert!(region.protects(11));
        assert!(!region.protects(12));
        assert!(region.handles_at(12));
        assert!(!region.handles_at(16));
    }
}
