//! Flow analysis: basic blocks and the evaluation stack model
//!
//! Phase 1 of compilation. Splits the body into basic blocks at branch
//! targets and exception-region boundaries, computes successors, and
//! propagates the evaluation stack shape (depth and per-slot kind) to
//! every block entry, verifying that merges agree. Exception handler
//! blocks enter with exactly one pushed exception reference.

use super::{BodyEnv, JitError, SlotKind};
use argon_bytecode::body::{EhKind, Instr, InstrReader, MethodBody, Operand};
use argon_bytecode::Opcode;
use rustc_hash::FxHashMap;

/// Index of a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// Why a block is entered from outside normal flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRole {
    /// Ordinary flow.
    Normal,
    /// Catch handler funclet: enters with the exception on the stack.
    CatchEntry,
    /// Filter funclet: enters with the exception on the stack.
    FilterEntry,
    /// Finally or fault funclet: enters with an empty stack.
    FinallyEntry,
}

/// A basic block.
#[derive(Debug)]
pub struct Block {
    /// Block id (index into the block vector).
    pub id: BlockId,
    /// Bytecode offset of the first instruction.
    pub start: u32,
    /// Bytecode offset just past the last instruction.
    pub end: u32,
    /// Indices into the decoded instruction vector.
    pub instrs: std::ops::Range<usize>,
    /// Successor blocks.
    pub succs: Vec<BlockId>,
    /// Evaluation stack on entry, bottom first.
    pub entry_stack: Vec<SlotKind>,
    /// How the block is entered.
    pub role: EntryRole,
    /// Whether the entry state has been computed.
    pub reached: bool,
}

/// The result of flow analysis.
#[derive(Debug)]
pub struct FlowGraph {
    /// All decoded instructions, in offset order.
    pub instrs: Vec<Instr>,
    /// Basic blocks ordered by start offset.
    pub blocks: Vec<Block>,
    /// Map from bytecode offset to the block starting there.
    pub block_at: FxHashMap<u32, BlockId>,
    /// Deepest evaluation stack observed anywhere in the method.
    pub max_depth: usize,
}

impl FlowGraph {
    /// The block starting exactly at `offset`.
    pub fn block_starting_at(&self, offset: u32) -> Option<&Block> {
        self.block_at.get(&offset).map(|id| &self.blocks[id.0 as usize])
    }
}

/// Run flow analysis over a method body.
pub fn analyze(body: &MethodBody, env: &dyn BodyEnv) -> Result<FlowGraph, JitError> {
    let instrs = decode_all(body)?;
    let leaders = find_leaders(body, &instrs);
    let (mut blocks, block_at) = build_blocks(body, &instrs, &leaders);
    compute_successors(&instrs, &mut blocks, &block_at);
    let max_depth = propagate_stacks(body, &instrs, &mut blocks, &block_at, env)?;
    Ok(FlowGraph {
        instrs,
        blocks,
        block_at,
        max_depth,
    })
}

fn decode_all(body: &MethodBody) -> Result<Vec<Instr>, JitError> {
    let mut reader = InstrReader::new(&body.code);
    let mut instrs = Vec::new();
    while !reader.at_end() {
        instrs.push(reader.next_instr()?);
    }
    Ok(instrs)
}

fn find_leaders(body: &MethodBody, instrs: &[Instr]) -> Vec<u32> {
    let mut leaders: Vec<u32> = vec![0];
    for (i, instr) in instrs.iter().enumerate() {
        match &instr.operand {
            Operand::Target(t) => leaders.push(*t),
            Operand::Switch(ts) => leaders.extend_from_slice(ts),
            _ => {}
        }
        // The instruction after a terminator or conditional branch starts
        // a block
        if (instr.op.is_terminator() || instr.op.is_conditional_branch())
            && i + 1 < instrs.len()
        {
            leaders.push(instr.next_offset);
        }
    }
    for region in &body.eh {
        leaders.push(region.try_offset);
        leaders.push(region.try_offset + region.try_len);
        leaders.push(region.handler_offset);
        if let EhKind::Filter { filter_offset } = region.kind {
            leaders.push(filter_offset);
        }
    }
    leaders.sort_unstable();
    leaders.dedup();
    leaders.retain(|&l| (l as usize) < body.code.len());
    leaders
}

fn build_blocks(
    body: &MethodBody,
    instrs: &[Instr],
    leaders: &[u32],
) -> (Vec<Block>, FxHashMap<u32, BlockId>) {
    let mut block_at = FxHashMap::default();
    let mut blocks = Vec::with_capacity(leaders.len());
    let offset_to_index: FxHashMap<u32, usize> = instrs
        .iter()
        .enumerate()
        .map(|(i, ins)| (ins.offset, i))
        .collect();

    for (bi, &start) in leaders.iter().enumerate() {
        let end = leaders.get(bi + 1).copied().unwrap_or(body.code.len() as u32);
        let first = offset_to_index[&start];
        let mut last = first;
        while last < instrs.len() && instrs[last].next_offset <= end {
            last += 1;
        }
        let id = BlockId(bi as u32);
        block_at.insert(start, id);

        // Entry role from EH regions (innermost-first order wins)
        let mut role = EntryRole::Normal;
        for region in &body.eh {
            if region.handler_offset == start {
                role = match region.kind {
                    EhKind::Catch(_) => EntryRole::CatchEntry,
                    EhKind::Filter { .. } => EntryRole::CatchEntry,
                    EhKind::Finally | EhKind::Fault => EntryRole::FinallyEntry,
                };
                break;
            }
            if let EhKind::Filter { filter_offset } = region.kind {
                if filter_offset == start {
                    role = EntryRole::FilterEntry;
                    break;
                }
            }
        }

        blocks.push(Block {
            id,
            start,
            end,
            instrs: first..last,
            succs: Vec::new(),
            entry_stack: Vec::new(),
            role,
            reached: false,
        });
    }
    (blocks, block_at)
}

fn compute_successors(
    instrs: &[Instr],
    blocks: &mut [Block],
    block_at: &FxHashMap<u32, BlockId>,
) {
    for bi in 0..blocks.len() {
        let Some(last) = blocks[bi].instrs.clone().last().map(|i| &instrs[i]) else {
            continue;
        };
        let mut succs = Vec::new();
        match (&last.op, &last.operand) {
            (Opcode::Br, Operand::Target(t)) | (Opcode::Leave, Operand::Target(t)) => {
                succs.extend(block_at.get(t).copied());
            }
            (op, Operand::Target(t)) if op.is_conditional_branch() => {
                succs.extend(block_at.get(t).copied());
                if bi + 1 < blocks.len() {
                    succs.push(BlockId((bi + 1) as u32));
                }
            }
            (Opcode::Switch, Operand::Switch(ts)) => {
                for t in ts {
                    succs.extend(block_at.get(t).copied());
                }
                if bi + 1 < blocks.len() {
                    succs.push(BlockId((bi + 1) as u32));
                }
            }
            (Opcode::Ret, _)
            | (Opcode::Throw, _)
            | (Opcode::Rethrow, _)
            | (Opcode::EndFinally, _)
            | (Opcode::EndFilter, _) => {}
            _ => {
                // Fallthrough
                if bi + 1 < blocks.len() {
                    succs.push(BlockId((bi + 1) as u32));
                }
            }
        }
        succs.dedup();
        blocks[bi].succs = succs;
    }
}

/// Worklist propagation of the abstract stack to every reachable block.
fn propagate_stacks(
    body: &MethodBody,
    instrs: &[Instr],
    blocks: &mut Vec<Block>,
    block_at: &FxHashMap<u32, BlockId>,
    env: &dyn BodyEnv,
) -> Result<usize, JitError> {
    let mut worklist: Vec<BlockId> = Vec::new();
    let mut max_depth = 0usize;

    // Method entry
    blocks[0].entry_stack = Vec::new();
    blocks[0].reached = true;
    worklist.push(BlockId(0));

    // Funclet entries are roots of their own flow
    for block in blocks.iter_mut() {
        let seed = match block.role {
            EntryRole::Normal => continue,
            EntryRole::CatchEntry | EntryRole::FilterEntry => vec![SlotKind::Ref],
            EntryRole::FinallyEntry => Vec::new(),
        };
        block.entry_stack = seed;
        block.reached = true;
        worklist.push(block.id);
    }

    while let Some(id) = worklist.pop() {
        let block = &blocks[id.0 as usize];
        let mut stack = block.entry_stack.clone();
        let range = block.instrs.clone();
        let succs = block.succs.clone();
        let mut leaves = false;

        max_depth = max_depth.max(stack.len());
        for instr in &instrs[range] {
            if instr.op == Opcode::Leave {
                leaves = true;
            }
            step(&mut stack, instr, env)?;
            max_depth = max_depth.max(stack.len());
        }

        // Leave empties the evaluation stack before branching
        let out_stack = if leaves { Vec::new() } else { stack };

        for succ in succs {
            let succ_block = &mut blocks[succ.0 as usize];
            if !succ_block.reached {
                succ_block.entry_stack = out_stack.clone();
                succ_block.reached = true;
                worklist.push(succ);
            } else {
                // Merge must agree in depth and shape
                if succ_block.entry_stack.len() != out_stack.len()
                    || !succ_block
                        .entry_stack
                        .iter()
                        .zip(out_stack.iter())
                        .all(|(a, b)| a.merges_with(*b))
                {
                    return Err(JitError::StackMismatch(succ_block.start));
                }
            }
        }
        let _ = block_at;
    }
    let _ = body;
    Ok(max_depth)
}

fn pop(stack: &mut Vec<SlotKind>, at: u32) -> Result<SlotKind, JitError> {
    stack.pop().ok_or(JitError::StackUnderflow(at))
}

fn expect_int(kind: SlotKind, at: u32) -> Result<SlotKind, JitError> {
    if kind.is_int() {
        Ok(kind)
    } else {
        Err(JitError::TypeMismatch {
            offset: at,
            what: "integer operand expected",
        })
    }
}

/// Abstract transfer function of a single instruction.
fn step(stack: &mut Vec<SlotKind>, instr: &Instr, env: &dyn BodyEnv) -> Result<(), JitError> {
    use Opcode::*;
    let at = instr.offset;
    match instr.op {
        Nop | Volatile => {}
        Pop => {
            pop(stack, at)?;
        }
        Dup => {
            let top = *stack.last().ok_or(JitError::StackUnderflow(at))?;
            stack.push(top);
        }
        LdNull => stack.push(SlotKind::Ref),
        LdcI4 => stack.push(SlotKind::I32),
        LdcI8 => stack.push(SlotKind::I64),
        LdcR4 => stack.push(SlotKind::F32),
        LdcR8 => stack.push(SlotKind::F64),
        LdStr => stack.push(SlotKind::Ref),

        LdArg | LdLoc => {
            let slot = match instr.operand {
                Operand::Slot(s) => s as usize,
                _ => unreachable!(),
            };
            let kinds = if instr.op == LdArg {
                env.arg_kinds()
            } else {
                env.local_kinds()
            };
            let kind = *kinds.get(slot).ok_or(JitError::TypeMismatch {
                offset: at,
                what: "slot index out of range",
            })?;
            stack.push(kind);
        }
        StArg | StLoc => {
            let slot = match instr.operand {
                Operand::Slot(s) => s as usize,
                _ => unreachable!(),
            };
            let kinds = if instr.op == StArg {
                env.arg_kinds()
            } else {
                env.local_kinds()
            };
            let expected = *kinds.get(slot).ok_or(JitError::TypeMismatch {
                offset: at,
                what: "slot index out of range",
            })?;
            let got = pop(stack, at)?;
            if !got.merges_with(expected) {
                return Err(JitError::TypeMismatch {
                    offset: at,
                    what: "store kind mismatch",
                });
            }
        }
        LdLocA => stack.push(SlotKind::ByRef),

        Add | Sub | Mul | Div | DivUn | Rem | RemUn => {
            let b = pop(stack, at)?;
            let a = pop(stack, at)?;
            if !a.merges_with(b) || !(a.is_int() || a.is_float()) {
                return Err(JitError::TypeMismatch {
                    offset: at,
                    what: "numeric operands expected",
                });
            }
            if matches!(instr.op, DivUn | RemUn) && !a.is_int() {
                return Err(JitError::TypeMismatch {
                    offset: at,
                    what: "integer operands expected",
                });
            }
            stack.push(a);
        }
        AddOvf | SubOvf | MulOvf | And | Or | Xor => {
            let b = pop(stack, at)?;
            let a = expect_int(pop(stack, at)?, at)?;
            if !a.merges_with(b) {
                return Err(JitError::TypeMismatch {
                    offset: at,
                    what: "matching integer operands expected",
                });
            }
            stack.push(a);
        }
        Shl | Shr | ShrUn => {
            let shift = expect_int(pop(stack, at)?, at)?;
            let value = expect_int(pop(stack, at)?, at)?;
            let _ = shift;
            stack.push(value);
        }
        Neg => {
            let a = pop(stack, at)?;
            if !(a.is_int() || a.is_float()) {
                return Err(JitError::TypeMismatch {
                    offset: at,
                    what: "numeric operand expected",
                });
            }
            stack.push(a);
        }
        Not => {
            let a = expect_int(pop(stack, at)?, at)?;
            stack.push(a);
        }
        Ceq | Cgt | CgtUn | Clt | CltUn => {
            let b = pop(stack, at)?;
            let a = pop(stack, at)?;
            let comparable = a.merges_with(b)
                && !matches!(a, SlotKind::Val(_));
            if !comparable {
                return Err(JitError::TypeMismatch {
                    offset: at,
                    what: "comparable operands expected",
                });
            }
            stack.push(SlotKind::I32);
        }

        Conv | ConvOvf => {
            let kind = match instr.operand {
                Operand::Kind(k) => k,
                _ => unreachable!(),
            };
            let a = pop(stack, at)?;
            if !(a.is_int() || a.is_float()) {
                return Err(JitError::TypeMismatch {
                    offset: at,
                    what: "numeric operand expected",
                });
            }
            stack.push(prim_slot(kind));
        }
        LdInd => {
            let kind = match instr.operand {
                Operand::Kind(k) => k,
                _ => unreachable!(),
            };
            match pop(stack, at)? {
                SlotKind::ByRef => {}
                _ => {
                    return Err(JitError::TypeMismatch {
                        offset: at,
                        what: "byref expected",
                    })
                }
            }
            stack.push(prim_slot(kind));
        }
        StInd => {
            let _value = pop(stack, at)?;
            match pop(stack, at)? {
                SlotKind::ByRef => {}
                _ => {
                    return Err(JitError::TypeMismatch {
                        offset: at,
                        what: "byref expected",
                    })
                }
            }
        }

        Br | Leave => {}
        BrTrue | BrFalse => {
            let a = pop(stack, at)?;
            if matches!(a, SlotKind::Val(_) | SlotKind::F32 | SlotKind::F64) {
                return Err(JitError::TypeMismatch {
                    offset: at,
                    what: "integer or reference condition expected",
                });
            }
        }
        Beq | Bne | Blt | BltUn | Ble | BleUn | Bgt | BgtUn | Bge | BgeUn => {
            let b = pop(stack, at)?;
            let a = pop(stack, at)?;
            if !a.merges_with(b) || matches!(a, SlotKind::Val(_)) {
                return Err(JitError::TypeMismatch {
                    offset: at,
                    what: "comparable operands expected",
                });
            }
        }
        Switch => {
            expect_int(pop(stack, at)?, at)?;
        }
        Ret => {
            if let Some(expected) = env.ret_kind() {
                let got = pop(stack, at)?;
                if !got.merges_with(expected) {
                    return Err(JitError::TypeMismatch {
                        offset: at,
                        what: "return kind mismatch",
                    });
                }
            }
            if !stack.is_empty() {
                return Err(JitError::TypeMismatch {
                    offset: at,
                    what: "stack not empty at return",
                });
            }
        }

        Call | CallVirt => {
            let token = match instr.operand {
                Operand::Token(t) => t,
                _ => unreachable!(),
            };
            let md = env.method(token)?;
            for _ in 0..md.sig.arg_count() {
                pop(stack, at)?;
            }
            push_ret(stack, md.sig.ret);
        }
        CallI => {
            let token = match instr.operand {
                Operand::Token(t) => t,
                _ => unreachable!(),
            };
            let sig = env.signature(token)?;
            expect_int(pop(stack, at)?, at)?; // function pointer
            for _ in 0..sig.arg_count() {
                pop(stack, at)?;
            }
            push_ret(stack, sig.ret);
        }
        NewObj => {
            let token = match instr.operand {
                Operand::Token(t) => t,
                _ => unreachable!(),
            };
            let ctor = env.method(token)?;
            for _ in 0..ctor.sig.params.len() {
                pop(stack, at)?;
            }
            stack.push(SlotKind::Ref);
        }
        NewArr => {
            expect_int(pop(stack, at)?, at)?;
            stack.push(SlotKind::Ref);
        }
        NewArrMulti => {
            let rank = match instr.operand {
                Operand::TokenRank(_, r) => r,
                _ => unreachable!(),
            };
            for _ in 0..rank {
                expect_int(pop(stack, at)?, at)?;
            }
            stack.push(SlotKind::Ref);
        }
        LdLen => {
            match pop(stack, at)? {
                SlotKind::Ref => {}
                _ => {
                    return Err(JitError::TypeMismatch {
                        offset: at,
                        what: "array reference expected",
                    })
                }
            }
            stack.push(SlotKind::I64);
        }
        LdElem => {
            let token = match instr.operand {
                Operand::Token(t) => t,
                _ => unreachable!(),
            };
            let elem = env.type_desc(token)?;
            expect_int(pop(stack, at)?, at)?;
            pop(stack, at)?;
            stack.push(super::slot_kind_of(elem));
        }
        StElem => {
            pop(stack, at)?; // value
            expect_int(pop(stack, at)?, at)?;
            pop(stack, at)?; // array
        }
        LdFld => {
            let token = match instr.operand {
                Operand::Token(t) => t,
                _ => unreachable!(),
            };
            let field = env.field(token)?;
            pop(stack, at)?; // receiver (ref or byref)
            stack.push(super::slot_kind_of(field.ty));
        }
        StFld => {
            let _ = match instr.operand {
                Operand::Token(t) => env.field(t)?,
                _ => unreachable!(),
            };
            pop(stack, at)?; // value
            pop(stack, at)?; // receiver
        }
        LdSFld => {
            let field = match instr.operand {
                Operand::Token(t) => env.field(t)?,
                _ => unreachable!(),
            };
            stack.push(super::slot_kind_of(field.ty));
        }
        StSFld => {
            let _ = match instr.operand {
                Operand::Token(t) => env.field(t)?,
                _ => unreachable!(),
            };
            pop(stack, at)?;
        }
        Box => {
            pop(stack, at)?;
            stack.push(SlotKind::Ref);
        }
        Unbox => {
            let token = match instr.operand {
                Operand::Token(t) => t,
                _ => unreachable!(),
            };
            let target = env.type_desc(token)?;
            match pop(stack, at)? {
                SlotKind::Ref => {}
                _ => {
                    return Err(JitError::TypeMismatch {
                        offset: at,
                        what: "reference expected",
                    })
                }
            }
            stack.push(super::slot_kind_of(target));
        }
        CastClass | IsInst => {
            match pop(stack, at)? {
                SlotKind::Ref => {}
                _ => {
                    return Err(JitError::TypeMismatch {
                        offset: at,
                        what: "reference expected",
                    })
                }
            }
            stack.push(SlotKind::Ref);
        }
        LdFtn => stack.push(SlotKind::I64),
        LdVirtFtn => {
            match pop(stack, at)? {
                SlotKind::Ref => {}
                _ => {
                    return Err(JitError::TypeMismatch {
                        offset: at,
                        what: "reference expected",
                    })
                }
            }
            stack.push(SlotKind::I64);
        }

        Throw => {
            match pop(stack, at)? {
                SlotKind::Ref => {}
                _ => {
                    return Err(JitError::TypeMismatch {
                        offset: at,
                        what: "exception reference expected",
                    })
                }
            }
        }
        Rethrow => {}
        EndFinally => {
            if !stack.is_empty() {
                return Err(JitError::TypeMismatch {
                    offset: at,
                    what: "stack not empty at endfinally",
                });
            }
        }
        EndFilter => {
            expect_int(pop(stack, at)?, at)?;
        }
    }
    Ok(())
}

fn prim_slot(kind: argon_bytecode::PrimKind) -> SlotKind {
    use argon_bytecode::PrimKind::*;
    match kind {
        I8 | U8 => SlotKind::I64,
        R4 => SlotKind::F32,
        R8 => SlotKind::F64,
        Ref => SlotKind::Ref,
        _ => SlotKind::I32,
    }
}

fn push_ret(stack: &mut Vec<SlotKind>, ret: &'static crate::types::TypeDesc) {
    use crate::types::{Prim, TypeKind};
    if matches!(ret.kind, TypeKind::Primitive(Prim::Void)) {
        return;
    }
    stack.push(super::slot_kind_of(ret));
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon_bytecode::body::InstrWriter;
    use argon_bytecode::{MethodBody, Opcode};

    pub(crate) struct TestEnv {
        pub args: Vec<SlotKind>,
        pub locals: Vec<SlotKind>,
        pub ret: Option<SlotKind>,
    }

    impl BodyEnv for TestEnv {
        fn arg_kinds(&self) -> &[SlotKind] {
            &self.args
        }
        fn local_kinds(&self) -> &[SlotKind] {
            &self.locals
        }
        fn ret_kind(&self) -> Option<SlotKind> {
            self.ret
        }
        fn method(&self, t: argon_bytecode::Token) -> Result<&'static crate::types::MethodDesc, JitError> {
            Err(JitError::Unresolved(t.0))
        }
        fn signature(&self, t: argon_bytecode::Token) -> Result<crate::types::ResolvedSig, JitError> {
            Err(JitError::Unresolved(t.0))
        }
        fn field(&self, t: argon_bytecode::Token) -> Result<super::super::FieldRef, JitError> {
            Err(JitError::Unresolved(t.0))
        }
        fn type_desc(&self, t: argon_bytecode::Token) -> Result<&'static crate::types::TypeDesc, JitError> {
            Err(JitError::Unresolved(t.0))
        }
        fn string_literal(&self, t: argon_bytecode::Token) -> Result<usize, JitError> {
            Err(JitError::Unresolved(t.0))
        }
        fn array_type(
            &self,
            element: &'static crate::types::TypeDesc,
            _rank: u8,
        ) -> &'static crate::types::TypeDesc {
            element
        }
        fn box_type(
            &self,
            value: &'static crate::types::TypeDesc,
        ) -> &'static crate::types::TypeDesc {
            value
        }
        fn is_delegate(&self, _td: &'static crate::types::TypeDesc) -> bool {
            false
        }
    }

    fn body(code: Vec<u8>) -> MethodBody {
        MethodBody {
            max_stack: 16,
            locals: vec![],
            code,
            eh: vec![],
        }
    }

    #[test]
    fn test_straight_line_blocks() {
        let mut w = InstrWriter::new();
        w.ldc_i4(1).ldc_i4(2).op(Opcode::Add).op(Opcode::Ret);
        let env = TestEnv {
            args: vec![],
            locals: vec![],
            ret: Some(SlotKind::I32),
        };
        let graph = analyze(&body(w.finish()), &env).unwrap();
        assert_eq!(graph.blocks.len(), 1);
        assert!(graph.blocks[0].entry_stack.is_empty());
    }

    #[test]
    fn test_branch_splits_blocks_and_merges_stack() {
        // arg0 ? x=1 : x=2; ret x
        let mut w = InstrWriter::new();
        let else_l = w.label();
        let join = w.label();
        w.slot(Opcode::LdArg, 0);
        w.branch(Opcode::BrFalse, else_l);
        w.ldc_i4(1);
        w.branch(Opcode::Br, join);
        w.bind(else_l);
        w.ldc_i4(2);
        w.bind(join);
        w.op(Opcode::Ret);
        let env = TestEnv {
            args: vec![SlotKind::I32],
            locals: vec![],
            ret: Some(SlotKind::I32),
        };
        let graph = analyze(&body(w.finish()), &env).unwrap();
        assert_eq!(graph.blocks.len(), 4);
        // Join block entered with one i32
        let join_block = graph.blocks.last().unwrap();
        assert_eq!(join_block.entry_stack.len(), 1);
        assert!(join_block.entry_stack[0].merges_with(SlotKind::I32));
    }

    #[test]
    fn test_inconsistent_merge_rejected() {
        // One path pushes i32, the other pushes i64
        let mut w = InstrWriter::new();
        let else_l = w.label();
        let join = w.label();
        w.slot(Opcode::LdArg, 0);
        w.branch(Opcode::BrFalse, else_l);
        w.ldc_i4(1);
        w.branch(Opcode::Br, join);
        w.bind(else_l);
        w.ldc_i8(2);
        w.bind(join);
        w.op(Opcode::Pop);
        w.op(Opcode::Ret);
        let env = TestEnv {
            args: vec![SlotKind::I32],
            locals: vec![],
            ret: None,
        };
        let err = analyze(&body(w.finish()), &env).unwrap_err();
        assert!(matches!(err, JitError::StackMismatch(_)));
    }

    #[test]
    fn test_stack_underflow_rejected() {
        let mut w = InstrWriter::new();
        w.op(Opcode::Add).op(Opcode::Ret);
        let env = TestEnv {
            args: vec![],
            locals: vec![],
            ret: None,
        };
        let err = analyze(&body(w.finish()), &env).unwrap_err();
        assert!(matches!(err, JitError::StackUnderflow(0)));
    }

    #[test]
    fn test_handler_block_enters_with_exception() {
        // try { nop } catch { pop } + ret, with a leave out of the try
        let mut w = InstrWriter::new();
        let after = w.label();
        w.op(Opcode::Nop);
        w.branch(Opcode::Leave, after);
        let handler_start = w.offset();
        w.op(Opcode::Pop);
        w.branch(Opcode::Leave, after);
        w.bind(after);
        w.op(Opcode::Ret);
        let code = w.finish();

        let mut b = body(code);
        b.eh.push(argon_bytecode::EhRegion {
            kind: argon_bytecode::EhKind::Catch(argon_bytecode::Token::type_def(0)),
            try_offset: 0,
            try_len: handler_start,
            handler_offset: handler_start,
            handler_len: b.code.len() as u32 - handler_start - 1,
        });
        let env = TestEnv {
            args: vec![],
            locals: vec![],
            ret: None,
        };
        let graph = analyze(&b, &env).unwrap();
        let handler = graph.block_starting_at(handler_start).unwrap();
        assert_eq!(handler.role, EntryRole::CatchEntry);
        assert_eq!(handler.entry_stack.len(), 1);
    }

    #[test]
    fn test_back_edge_loop_reaches_fixed_point() {
        // i = 10; while (i) i = i - 1; ret
        let mut w = InstrWriter::new();
        let top = w.label();
        let exit = w.label();
        w.ldc_i4(10);
        w.slot(Opcode::StLoc, 0);
        w.bind(top);
        w.slot(Opcode::LdLoc, 0);
        w.branch(Opcode::BrFalse, exit);
        w.slot(Opcode::LdLoc, 0);
        w.ldc_i4(1);
        w.op(Opcode::Sub);
        w.slot(Opcode::StLoc, 0);
        w.branch(Opcode::Br, top);
        w.bind(exit);
        w.op(Opcode::Ret);
        let mut b = body(w.finish());
        b.locals = vec![argon_bytecode::TypeSig::I4];
        let env = TestEnv {
            args: vec![],
            locals: vec![SlotKind::I32],
            ret: None,
        };
        let graph = analyze(&b, &env).unwrap();
        assert!(graph.blocks.iter().all(|b| b.reached));
    }
}
