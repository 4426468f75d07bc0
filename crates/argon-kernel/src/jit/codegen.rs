//! Per-block code generation
//!
//! Phase 2 and 3 of compilation: walk each basic block once over its
//! instructions, maintaining a concrete operand stack whose entries live
//! in fixed frame slots, and emit x86-64 through the [`Asm`] encoder.
//! Safepoints (call returns and back-edge polls) record stackmap entries
//! as they are emitted; exception regions are rebased from bytecode
//! offsets to native offsets at the end.
//!
//! The operand-stack discipline is deliberately simple: every abstract
//! stack entry is materialized in its frame temp between instructions,
//! and no managed reference is ever live in a register across a
//! safepoint. Stackmaps therefore enumerate frame slots (plus the
//! occasional interior pointer), and the GC can rewrite them in place.

use super::analysis::{EntryRole, FlowGraph};
use super::emit::{Asm, Cond, FloatOp, Fpr, Label, Reg};
use super::tables::{
    EhEntry, EhTable, HandlerKind, RefLocation, SafepointEntry, SlotRef, StackMap,
};
use super::trampoline::{padded_arg_bytes, CTX_FLAGS, CTX_HELPERS, CTX_REG, EXCEPTION_REG};
use super::{BodyEnv, JitError, SlotKind};
use crate::fault::FaultKind;
use crate::helper_offset;
use crate::types::{MethodDesc, Prim, TypeDesc, TypeKind};
use argon_bytecode::body::{EhKind, Instr, MethodBody, Operand};
use argon_bytecode::{Opcode, PrimKind};
use rustc_hash::FxHashMap;
use std::mem::offset_of;

const MD_ENTRY_OFF: i32 = offset_of!(MethodDesc, entry) as i32;
const TD_VTABLE_RAW_OFF: i32 = offset_of!(TypeDesc, vtable_raw) as i32;
const OBJ_LENGTH_OFF: i32 = crate::types::LENGTH_OFFSET as i32;

/// Result of generating one method.
#[derive(Debug)]
pub struct CodegenOutput {
    /// Finished machine code (entry at offset 0).
    pub code: Vec<u8>,
    /// Frame size below the saved frame pointer.
    pub frame_size: u32,
    /// Stackmap entries.
    pub stackmap: StackMap,
    /// EH table in native PC space.
    pub eh: EhTable,
    /// Number of safepoints recorded.
    pub safepoints: usize,
}

struct RaiseSite {
    entry: Label,
    kind: FaultKind,
    site: Label,
}

struct SwitchTable {
    table: Label,
    targets: Vec<Label>,
}

pub(super) struct Codegen<'a> {
    asm: Asm,
    env: &'a dyn BodyEnv,
    body: &'a MethodBody,
    graph: &'a FlowGraph,
    block_labels: Vec<Label>,
    // Frame layout
    local_offsets: Vec<u32>,
    locals_bytes: u32,
    max_stack: usize,
    frame_size: u32,
    arg_count: usize,
    // Walk state
    stack: Vec<SlotKind>,
    volatile_pending: bool,
    current_block_start: u32,
    // Outputs
    safepoints: Vec<SafepointEntry>,
    raises: Vec<RaiseSite>,
    switch_tables: Vec<SwitchTable>,
    native_starts: FxHashMap<u32, u32>,
}

/// Generate machine code for an analyzed method body.
pub fn generate(
    body: &MethodBody,
    graph: &FlowGraph,
    env: &dyn BodyEnv,
) -> Result<CodegenOutput, JitError> {
    let mut gen = Codegen::new(body, graph, env);
    gen.emit_prologue();
    gen.emit_blocks()?;
    let body_end = gen.asm.offset() as u32;
    gen.emit_out_of_line();
    gen.finish(body_end)
}

impl<'a> Codegen<'a> {
    fn new(body: &'a MethodBody, graph: &'a FlowGraph, env: &'a dyn BodyEnv) -> Self {
        let mut local_offsets = Vec::with_capacity(env.local_kinds().len());
        let mut running = 0u32;
        for kind in env.local_kinds() {
            running += kind.frame_bytes();
            local_offsets.push(running);
        }
        let max_stack = graph.max_depth.max(body.max_stack as usize);
        // locals + eval temps + 8 scratch qwords, 16-byte aligned
        let raw = running + 8 * max_stack as u32 + 64;
        let frame_size = (raw + 15) & !15;
        Self {
            asm: Asm::new(),
            env,
            body,
            graph,
            block_labels: Vec::new(),
            local_offsets,
            locals_bytes: running,
            max_stack,
            frame_size,
            arg_count: env.arg_kinds().len(),
            stack: Vec::new(),
            volatile_pending: false,
            current_block_start: 0,
            safepoints: Vec::new(),
            raises: Vec::new(),
            switch_tables: Vec::new(),
            native_starts: FxHashMap::default(),
        }
    }

    // ===== Frame addressing =====

    fn arg_off(&self, index: usize) -> i32 {
        16 + 8 * index as i32
    }

    fn local_off(&self, index: usize) -> i32 {
        -(self.local_offsets[index] as i32)
    }

    fn slot_off(&self, index: usize) -> i32 {
        -((self.locals_bytes + 8 * (index as u32 + 1)) as i32)
    }

    fn scratch_off(&self, index: usize) -> i32 {
        -((self.locals_bytes + 8 * self.max_stack as u32 + 8 * (index as u32 + 1)) as i32)
    }

    fn push_kind(&mut self, kind: SlotKind) -> Result<usize, JitError> {
        if let SlotKind::Val(td) = kind {
            if !matches!(td.size, 1 | 2 | 4 | 8) {
                return Err(JitError::TypeMismatch {
                    offset: self.current_block_start,
                    what: "value type too large for the evaluation stack",
                });
            }
        }
        self.stack.push(kind);
        Ok(self.stack.len() - 1)
    }

    fn pop1(&mut self) -> (SlotKind, usize) {
        let kind = self.stack.pop().expect("codegen stack underflow");
        (kind, self.stack.len())
    }

    fn top_index(&self) -> usize {
        self.stack.len() - 1
    }

    fn load_slot(&mut self, index: usize, reg: Reg) {
        let off = self.slot_off(index);
        self.asm.mov_rm(reg, Reg::Rbp, off);
    }

    fn store_slot(&mut self, index: usize, reg: Reg) {
        let off = self.slot_off(index);
        self.asm.mov_mr(Reg::Rbp, off, reg);
    }

    // ===== Safepoints and faults =====

    /// Record a stackmap entry at the current offset (a call return
    /// address). `extra` adds references parked in scratch slots.
    fn record_safepoint(&mut self, extra: &[SlotRef]) {
        let mut refs = Vec::new();
        for (i, kind) in self.env.arg_kinds().iter().enumerate() {
            push_ref_slot(&mut refs, *kind, self.arg_off(i));
        }
        for (i, kind) in self.env.local_kinds().iter().enumerate() {
            push_ref_slot(&mut refs, *kind, self.local_off(i));
        }
        for (i, kind) in self.stack.clone().iter().enumerate() {
            push_ref_slot(&mut refs, *kind, self.slot_off(i));
        }
        refs.extend_from_slice(extra);
        self.safepoints.push(SafepointEntry {
            code_offset: self.asm.offset() as u32,
            refs,
        });
    }

    /// `call` through the helper table.
    fn helper_call(&mut self, table_off: i32) {
        self.asm.mov_rm(Reg::Rax, CTX_REG, CTX_HELPERS);
        self.asm.call_m(Reg::Rax, table_off);
    }

    /// Bind a label at the current site (the faulting PC for EH lookup).
    fn site_label(&mut self) -> Label {
        let l = self.asm.label();
        self.asm.bind(l);
        l
    }

    /// Conditional jump to an out-of-line fault raise. The check site
    /// becomes a safepoint: the dispatcher may run managed filters (and
    /// the GC may walk this frame) with this PC on the stack.
    fn raise_jcc(&mut self, cond: Cond, kind: FaultKind) {
        let site = self.site_label();
        self.record_safepoint(&[]);
        let entry = self.asm.label();
        self.asm.jcc(cond, entry);
        self.raises.push(RaiseSite { entry, kind, site });
    }

    /// Null check the reference in `reg`.
    fn null_check(&mut self, reg: Reg) {
        self.asm.test_rr(reg, reg);
        self.raise_jcc(Cond::E, FaultKind::NullReference);
    }

    /// Emit the safepoint poll sequence (flag test + conditional slow
    /// call). Clobbers flags and scratch registers.
    fn emit_poll(&mut self) {
        let skip = self.asm.label();
        self.asm.cmp32_mi(CTX_REG, CTX_FLAGS, 0);
        self.asm.jcc(Cond::E, skip);
        self.asm.mov_rr(Reg::Rdi, CTX_REG);
        self.asm.mov_rr(Reg::Rsi, Reg::Rbp);
        let site = self.asm.label();
        self.asm.lea_rip(Reg::Rdx, site);
        self.helper_call(helper_offset!(safepoint_poll));
        self.asm.bind(site);
        self.record_safepoint(&[]);
        self.asm.bind(skip);
    }

    // ===== Prologue / epilogue =====

    fn emit_prologue(&mut self) {
        self.asm.push(Reg::Rbp);
        self.asm.mov_rr(Reg::Rbp, Reg::Rsp);
        self.asm.sub_ri(Reg::Rsp, self.frame_size as i32);
        // Zero-initialize locals; reference locals must never hold garbage
        if !self.local_offsets.is_empty() {
            self.asm.xor_rr(Reg::Rax, Reg::Rax);
            for (i, kind) in self.env.local_kinds().to_vec().iter().enumerate() {
                let base = self.local_off(i);
                let words = kind.frame_bytes() / 8;
                for w in 0..words {
                    self.asm.mov_mr(Reg::Rbp, base + 8 * w as i32, Reg::Rax);
                }
            }
        }
    }

    fn emit_return(&mut self) {
        if let Some(kind) = self.env.ret_kind() {
            let top = self.top_index();
            self.load_slot(top, Reg::Rax);
            if kind.is_float() {
                self.asm.movq_xr(Fpr::Xmm0, Reg::Rax);
            }
            self.stack.pop();
        }
        self.asm.mov_rr(Reg::Rsp, Reg::Rbp);
        self.asm.pop(Reg::Rbp);
        self.asm.ret_imm(padded_arg_bytes(self.arg_count) as u16);
    }

    // ===== Block driver =====

    fn emit_blocks(&mut self) -> Result<(), JitError> {
        let graph = self.graph;
        for _ in 0..graph.blocks.len() {
            let l = self.asm.label();
            self.block_labels.push(l);
        }

        for bi in 0..graph.blocks.len() {
            let block = &graph.blocks[bi];
            self.asm.bind(self.block_labels[bi]);
            self.native_starts
                .insert(block.start, self.asm.offset() as u32);
            if !block.reached {
                continue;
            }
            self.stack = block.entry_stack.clone();
            self.current_block_start = block.start;

            // Funclets are called with a return address on the stack;
            // realign and capture the incoming exception where expected.
            match block.role {
                EntryRole::FinallyEntry => {
                    self.asm.push(Reg::Rax);
                }
                EntryRole::FilterEntry => {
                    self.asm.push(Reg::Rax);
                    self.store_slot(0, EXCEPTION_REG);
                }
                EntryRole::CatchEntry => {
                    self.store_slot(0, EXCEPTION_REG);
                }
                EntryRole::Normal => {}
            }

            for ii in block.instrs.clone() {
                let instr = &graph.instrs[ii];
                self.emit_instr(instr)?;
            }
        }
        Ok(())
    }

    fn block_label_at(&self, il_offset: u32) -> Label {
        let id = self.graph.block_at[&il_offset];
        self.block_labels[id.0 as usize]
    }

    /// Poll before a branch whose target is a back-edge.
    fn maybe_poll_back_edge(&mut self, from: u32, target: u32) {
        if target <= from {
            self.emit_poll();
        }
    }

    // ===== Out-of-line material =====

    fn emit_out_of_line(&mut self) {
        let raises = std::mem::take(&mut self.raises);
        for raise in &raises {
            self.asm.bind(raise.entry);
            self.asm.mov_rr(Reg::Rdi, CTX_REG);
            self.asm.mov_ri(Reg::Rsi, raise.kind.code() as i64);
            self.asm.mov_rr(Reg::Rdx, Reg::Rbp);
            self.asm.lea_rip(Reg::Rcx, raise.site);
            self.helper_call(helper_offset!(raise_fault));
            self.asm.ud2();
        }
        let tables = std::mem::take(&mut self.switch_tables);
        for st in &tables {
            self.asm.bind(st.table);
            for &target in &st.targets {
                self.asm.table_entry(target, st.table);
            }
        }
    }

    fn finish(mut self, body_end: u32) -> Result<CodegenOutput, JitError> {
        // Rebase exception regions into native PC space
        let mut eh_entries = Vec::with_capacity(self.body.eh.len());
        for region in &self.body.eh {
            let native_of = |il: u32, me: &Self| -> u32 {
                me.native_starts.get(&il).copied().unwrap_or(body_end)
            };
            let kind = match region.kind {
                EhKind::Catch(token) => HandlerKind::Catch(self.env.type_desc(token)?),
                EhKind::Filter { filter_offset } => HandlerKind::Filter {
                    filter_pc: native_of(filter_offset, &self),
                },
                EhKind::Finally => HandlerKind::Finally,
                EhKind::Fault => HandlerKind::Fault,
            };
            eh_entries.push(EhEntry {
                try_start: native_of(region.try_offset, &self),
                try_end: native_of(region.try_offset + region.try_len, &self),
                handler_pc: native_of(region.handler_offset, &self),
                kind,
            });
        }

        let safepoint_count = self.safepoints.len();
        let code = self.asm.finish();
        Ok(CodegenOutput {
            code,
            frame_size: self.frame_size,
            stackmap: StackMap::new(self.safepoints),
            eh: EhTable::new(eh_entries),
            safepoints: safepoint_count,
        })
    }

    // ===== Instruction emission =====

    fn emit_instr(&mut self, instr: &Instr) -> Result<(), JitError> {
        use Opcode::*;
        match instr.op {
            Nop => {}
            Volatile => self.volatile_pending = true,
            Pop => {
                self.stack.pop();
            }
            Dup => {
                let top = self.top_index();
                self.load_slot(top, Reg::Rax);
                let kind = self.stack[top];
                let new = self.push_kind(kind)?;
                self.store_slot(new, Reg::Rax);
            }
            LdNull => {
                let j = self.push_kind(SlotKind::Ref)?;
                self.asm.xor_rr(Reg::Rax, Reg::Rax);
                self.store_slot(j, Reg::Rax);
            }
            LdcI4 => {
                let v = match instr.operand {
                    Operand::I32(v) => v,
                    _ => unreachable!(),
                };
                let j = self.push_kind(SlotKind::I32)?;
                let off = self.slot_off(j);
                self.asm.mov_mi(Reg::Rbp, off, v);
            }
            LdcI8 => {
                let v = match instr.operand {
                    Operand::I64(v) => v,
                    _ => unreachable!(),
                };
                let j = self.push_kind(SlotKind::I64)?;
                self.asm.mov_ri(Reg::Rax, v);
                self.store_slot(j, Reg::Rax);
            }
            LdcR4 => {
                let v = match instr.operand {
                    Operand::F32(v) => v,
                    _ => unreachable!(),
                };
                let j = self.push_kind(SlotKind::F32)?;
                self.asm.mov_ri(Reg::Rax, v.to_bits() as i64);
                self.store_slot(j, Reg::Rax);
            }
            LdcR8 => {
                let v = match instr.operand {
                    Operand::F64(v) => v,
                    _ => unreachable!(),
                };
                let j = self.push_kind(SlotKind::F64)?;
                self.asm.mov_ri(Reg::Rax, v.to_bits() as i64);
                self.store_slot(j, Reg::Rax);
            }
            LdStr => {
                let token = token_of(instr);
                let addr = self.env.string_literal(token)?;
                let j = self.push_kind(SlotKind::Ref)?;
                self.asm.mov_ri(Reg::Rax, addr as i64);
                self.store_slot(j, Reg::Rax);
            }

            LdArg | LdLoc => {
                let slot = slot_of(instr) as usize;
                let (kind, src) = if instr.op == LdArg {
                    (self.env.arg_kinds()[slot], self.arg_off(slot))
                } else {
                    (self.env.local_kinds()[slot], self.local_off(slot))
                };
                self.asm.mov_rm(Reg::Rax, Reg::Rbp, src);
                let j = self.push_kind(kind)?;
                self.store_slot(j, Reg::Rax);
            }
            StArg | StLoc => {
                let slot = slot_of(instr) as usize;
                let dst = if instr.op == StArg {
                    self.arg_off(slot)
                } else {
                    self.local_off(slot)
                };
                let top = self.top_index();
                self.load_slot(top, Reg::Rax);
                self.asm.mov_mr(Reg::Rbp, dst, Reg::Rax);
                self.stack.pop();
            }
            LdLocA => {
                let slot = slot_of(instr) as usize;
                let off = self.local_off(slot);
                self.asm.lea(Reg::Rax, Reg::Rbp, off);
                let j = self.push_kind(SlotKind::ByRef)?;
                self.store_slot(j, Reg::Rax);
            }

            Add | Sub | Mul | Div | DivUn | Rem | RemUn | AddOvf | SubOvf | MulOvf | And
            | Or | Xor | Shl | Shr | ShrUn => self.emit_binop(instr.op)?,
            Neg => {
                let top = self.top_index();
                let kind = self.stack[top];
                if kind.is_float() {
                    // 0.0 - x
                    self.asm.xor_rr(Reg::Rax, Reg::Rax);
                    self.asm.movq_xr(Fpr::Xmm0, Reg::Rax);
                    self.load_slot(top, Reg::Rax);
                    self.asm.movq_xr(Fpr::Xmm1, Reg::Rax);
                    self.asm.float_arith(
                        FloatOp::Sub,
                        matches!(kind, SlotKind::F64),
                        Fpr::Xmm0,
                        Fpr::Xmm1,
                    );
                    self.asm.movq_rx(Reg::Rax, Fpr::Xmm0);
                } else {
                    self.load_slot(top, Reg::Rax);
                    self.asm.neg(Reg::Rax);
                    if matches!(kind, SlotKind::I32) {
                        self.asm.sext32(Reg::Rax, Reg::Rax);
                    }
                }
                self.store_slot(top, Reg::Rax);
            }
            Not => {
                let top = self.top_index();
                self.load_slot(top, Reg::Rax);
                self.asm.not(Reg::Rax);
                if matches!(self.stack[top], SlotKind::I32) {
                    self.asm.sext32(Reg::Rax, Reg::Rax);
                }
                self.store_slot(top, Reg::Rax);
            }
            Ceq | Cgt | CgtUn | Clt | CltUn => self.emit_compare(instr.op)?,

            Conv => self.emit_conv(kind_operand(instr), false)?,
            ConvOvf => self.emit_conv(kind_operand(instr), true)?,
            LdInd => {
                let prim = kind_operand(instr);
                let top = self.top_index();
                self.load_slot(top, Reg::Rax);
                self.stack.pop();
                self.emit_load_prim(prim, Reg::Rax);
                let j = self.push_kind(prim_slot_kind(prim))?;
                self.store_slot(j, Reg::Rax);
                self.volatile_pending = false;
            }
            StInd => {
                let prim = kind_operand(instr);
                let value = self.top_index();
                self.load_slot(value, Reg::Rcx);
                self.load_slot(value - 1, Reg::Rax);
                self.asm.store(prim.size() as u8, Reg::Rax, 0, Reg::Rcx);
                if self.volatile_pending {
                    self.asm.mfence();
                    self.volatile_pending = false;
                }
                self.stack.pop();
                self.stack.pop();
            }

            Br => {
                let target = target_of(instr);
                self.maybe_poll_back_edge(instr.offset, target);
                let l = self.block_label_at(target);
                self.asm.jmp(l);
            }
            BrTrue | BrFalse => {
                let target = target_of(instr);
                self.maybe_poll_back_edge(instr.offset, target);
                let top = self.top_index();
                self.load_slot(top, Reg::Rax);
                self.stack.pop();
                self.asm.test_rr(Reg::Rax, Reg::Rax);
                let l = self.block_label_at(target);
                let cond = if instr.op == BrTrue { Cond::Ne } else { Cond::E };
                self.asm.jcc(cond, l);
            }
            Beq | Bne | Blt | BltUn | Ble | BleUn | Bgt | BgtUn | Bge | BgeUn => {
                self.emit_branch_cmp(instr)?;
            }
            Switch => {
                let targets = match &instr.operand {
                    Operand::Switch(ts) => ts.clone(),
                    _ => unreachable!(),
                };
                if targets.iter().any(|&t| t <= instr.offset) {
                    self.emit_poll();
                }
                let top = self.top_index();
                self.load_slot(top, Reg::Rax);
                self.stack.pop();
                let done = self.asm.label();
                self.asm.cmp_ri(Reg::Rax, targets.len() as i32);
                self.asm.jcc(Cond::Ae, done);
                let table = self.asm.label();
                self.asm.lea_rip(Reg::R10, table);
                self.asm.shift_imm(4, Reg::Rax, 2);
                self.asm.mov_rr(Reg::Rcx, Reg::R10);
                self.asm.add_rr(Reg::Rcx, Reg::Rax);
                self.asm.load_sx(4, Reg::Rdx, Reg::Rcx, 0);
                self.asm.add_rr(Reg::Rdx, Reg::R10);
                self.asm.jmp_r(Reg::Rdx);
                self.asm.bind(done);
                let labels: Vec<Label> =
                    targets.iter().map(|&t| self.block_label_at(t)).collect();
                self.switch_tables.push(SwitchTable {
                    table,
                    targets: labels,
                });
            }
            Ret => self.emit_return(),

            Call => {
                let md = self.env.method(token_of(instr))?;
                self.emit_call_md(md, CallForm::Direct)?;
            }
            CallVirt => {
                let md = self.env.method(token_of(instr))?;
                self.emit_call_md(md, CallForm::Virtual)?;
            }
            CallI => self.emit_calli(instr)?,
            NewObj => self.emit_newobj(instr)?,
            NewArr => {
                let elem = self.env.type_desc(token_of(instr))?;
                let array_td = self.env.array_type(elem, 1);
                let top = self.top_index();
                self.asm.mov_rr(Reg::Rdi, CTX_REG);
                self.asm.mov_ri(Reg::Rsi, array_td as *const TypeDesc as i64);
                self.load_slot(top, Reg::Rdx);
                self.asm.mov_rr(Reg::Rcx, Reg::Rbp);
                let site = self.asm.label();
                self.asm.lea_rip(Reg::R8, site);
                self.helper_call(helper_offset!(alloc_array));
                self.asm.bind(site);
                self.stack.pop();
                self.record_safepoint(&[]);
                let j = self.push_kind(SlotKind::Ref)?;
                self.store_slot(j, Reg::Rax);
            }
            NewArrMulti => {
                let (token, rank) = match instr.operand {
                    Operand::TokenRank(t, r) => (t, r),
                    _ => unreachable!(),
                };
                let elem = self.env.type_desc(token)?;
                let array_td = self.env.array_type(elem, rank);
                // Copy the dims into scratch, lowest dimension first
                let depth = self.stack.len();
                for i in 0..rank as usize {
                    self.load_slot(depth - rank as usize + i, Reg::Rax);
                    let off = self.scratch_off(i);
                    self.asm.mov_mr(Reg::Rbp, off, Reg::Rax);
                }
                self.asm.mov_rr(Reg::Rdi, CTX_REG);
                self.asm.mov_ri(Reg::Rsi, array_td as *const TypeDesc as i64);
                self.asm.lea(Reg::Rdx, Reg::Rbp, self.scratch_off(0));
                self.asm.mov_ri(Reg::Rcx, rank as i64);
                self.asm.mov_rr(Reg::R8, Reg::Rbp);
                let site = self.asm.label();
                self.asm.lea_rip(Reg::R9, site);
                self.helper_call(helper_offset!(alloc_multi_array));
                self.asm.bind(site);
                for _ in 0..rank {
                    self.stack.pop();
                }
                self.record_safepoint(&[]);
                let j = self.push_kind(SlotKind::Ref)?;
                self.store_slot(j, Reg::Rax);
            }
            LdLen => {
                let top = self.top_index();
                self.load_slot(top, Reg::Rax);
                self.stack.pop();
                self.null_check(Reg::Rax);
                self.asm.mov_rm(Reg::Rax, Reg::Rax, OBJ_LENGTH_OFF);
                let j = self.push_kind(SlotKind::I64)?;
                self.store_slot(j, Reg::Rax);
            }
            LdElem => {
                let elem = self.env.type_desc(token_of(instr))?;
                self.emit_element_addr(elem)?;
                // rax = element address
                self.emit_load_sized(elem, Reg::Rax, 0);
                let j = self.push_kind(super::slot_kind_of(elem))?;
                self.store_slot(j, Reg::Rax);
            }
            StElem => {
                let elem = self.env.type_desc(token_of(instr))?;
                let value = self.top_index();
                // Pop the value from the model but keep its slot readable
                let value_off = self.slot_off(value);
                self.stack.pop();
                self.emit_element_addr(elem)?;
                if elem.is_reference_like() {
                    // Covariant store check, then the store
                    self.asm.mov_mr(Reg::Rbp, self.scratch_off(7), Reg::Rax);
                    self.asm.mov_rr(Reg::Rdi, CTX_REG);
                    // array ref was consumed by emit_element_addr; it kept a
                    // copy in scratch6
                    self.asm.mov_rm(Reg::Rsi, Reg::Rbp, self.scratch_off(6));
                    self.asm.mov_rm(Reg::Rdx, Reg::Rbp, value_off);
                    self.asm.mov_rr(Reg::Rcx, Reg::Rbp);
                    let site = self.asm.label();
                    self.asm.lea_rip(Reg::R8, site);
                    self.helper_call(helper_offset!(stelem_check));
                    self.asm.bind(site);
                    self.record_safepoint(&[]);
                    self.asm.mov_rm(Reg::Rax, Reg::Rbp, self.scratch_off(7));
                }
                self.asm.mov_rm(Reg::Rcx, Reg::Rbp, value_off);
                self.emit_store_sized(elem, Reg::Rax, 0, Reg::Rcx);
            }
            LdFld => {
                let field = self.env.field(token_of(instr))?;
                let (recv_kind, top) = (self.stack[self.top_index()], self.top_index());
                match recv_kind {
                    SlotKind::Val(_) => {
                        // The slot itself holds the value; take its address
                        let off = self.slot_off(top);
                        self.asm.lea(Reg::Rax, Reg::Rbp, off);
                    }
                    _ => self.load_slot(top, Reg::Rax),
                }
                self.stack.pop();
                if matches!(recv_kind, SlotKind::Ref) {
                    self.null_check(Reg::Rax);
                }
                self.emit_load_sized(field.ty, Reg::Rax, field.offset as i32);
                let j = self.push_kind(super::slot_kind_of(field.ty))?;
                self.store_slot(j, Reg::Rax);
                self.volatile_pending = false;
            }
            StFld => {
                let field = self.env.field(token_of(instr))?;
                let value = self.top_index();
                self.load_slot(value, Reg::Rcx);
                self.load_slot(value - 1, Reg::Rax);
                let recv_kind = self.stack[value - 1];
                if matches!(recv_kind, SlotKind::Ref) {
                    self.null_check(Reg::Rax);
                }
                self.emit_store_sized(field.ty, Reg::Rax, field.offset as i32, Reg::Rcx);
                if self.volatile_pending {
                    self.asm.mfence();
                    self.volatile_pending = false;
                }
                self.stack.pop();
                self.stack.pop();
            }
            LdSFld => {
                let field = self.env.field(token_of(instr))?;
                let addr = field.static_base + field.offset as usize;
                self.asm.mov_ri(Reg::Rax, addr as i64);
                self.emit_load_sized(field.ty, Reg::Rax, 0);
                let j = self.push_kind(super::slot_kind_of(field.ty))?;
                self.store_slot(j, Reg::Rax);
                self.volatile_pending = false;
            }
            StSFld => {
                let field = self.env.field(token_of(instr))?;
                let addr = field.static_base + field.offset as usize;
                let top = self.top_index();
                self.load_slot(top, Reg::Rcx);
                self.asm.mov_ri(Reg::Rax, addr as i64);
                self.emit_store_sized(field.ty, Reg::Rax, 0, Reg::Rcx);
                if self.volatile_pending {
                    self.asm.mfence();
                    self.volatile_pending = false;
                }
                self.stack.pop();
            }
            Box => {
                let td = self.env.type_desc(token_of(instr))?;
                if td.is_reference_like() {
                    // Boxing a reference is the identity
                    return Ok(());
                }
                let box_td = self.env.box_type(td);
                let top = self.top_index();
                self.asm.mov_rr(Reg::Rdi, CTX_REG);
                self.asm.mov_ri(Reg::Rsi, box_td as *const TypeDesc as i64);
                self.asm.lea(Reg::Rdx, Reg::Rbp, self.slot_off(top));
                self.asm.mov_rr(Reg::Rcx, Reg::Rbp);
                let site = self.asm.label();
                self.asm.lea_rip(Reg::R8, site);
                self.helper_call(helper_offset!(box_value));
                self.asm.bind(site);
                self.stack.pop();
                self.record_safepoint(&[]);
                let j = self.push_kind(SlotKind::Ref)?;
                self.store_slot(j, Reg::Rax);
            }
            Unbox => {
                let td = self.env.type_desc(token_of(instr))?;
                let top = self.top_index();
                self.asm.mov_rr(Reg::Rdi, CTX_REG);
                self.load_slot(top, Reg::Rsi);
                self.asm.mov_ri(Reg::Rdx, td as *const TypeDesc as i64);
                self.asm.mov_rr(Reg::Rcx, Reg::Rbp);
                let site = self.asm.label();
                self.asm.lea_rip(Reg::R8, site);
                self.helper_call(helper_offset!(unbox_value));
                self.asm.bind(site);
                self.stack.pop();
                self.record_safepoint(&[]);
                // rax = payload address
                self.emit_load_sized(td, Reg::Rax, 0);
                let j = self.push_kind(super::slot_kind_of(td))?;
                self.store_slot(j, Reg::Rax);
            }
            CastClass | IsInst => {
                let td = self.env.type_desc(token_of(instr))?;
                let top = self.top_index();
                self.asm.mov_rr(Reg::Rdi, CTX_REG);
                self.load_slot(top, Reg::Rsi);
                self.asm.mov_ri(Reg::Rdx, td as *const TypeDesc as i64);
                if instr.op == CastClass {
                    self.asm.mov_rr(Reg::Rcx, Reg::Rbp);
                    let site = self.asm.label();
                    self.asm.lea_rip(Reg::R8, site);
                    self.helper_call(helper_offset!(cast_class));
                    self.asm.bind(site);
                    self.record_safepoint(&[]);
                } else {
                    self.helper_call(helper_offset!(is_inst));
                }
                self.stack.pop();
                let j = self.push_kind(SlotKind::Ref)?;
                self.store_slot(j, Reg::Rax);
            }
            LdFtn => {
                let md = self.env.method(token_of(instr))?;
                let j = self.push_kind(SlotKind::I64)?;
                self.asm.mov_ri(Reg::Rax, md as *const MethodDesc as i64);
                self.asm.mov_rm(Reg::Rax, Reg::Rax, MD_ENTRY_OFF);
                self.store_slot(j, Reg::Rax);
            }
            LdVirtFtn => {
                let md = self.env.method(token_of(instr))?;
                let top = self.top_index();
                self.load_slot(top, Reg::Rax);
                self.stack.pop();
                self.null_check(Reg::Rax);
                self.emit_vtable_resolve(md)?;
                // rcx = target MethodDesc
                self.asm.mov_rm(Reg::Rax, Reg::Rcx, MD_ENTRY_OFF);
                let j = self.push_kind(SlotKind::I64)?;
                self.store_slot(j, Reg::Rax);
            }

            Throw => {
                let top = self.top_index();
                self.load_slot(top, Reg::Rsi);
                self.stack.pop();
                self.asm.test_rr(Reg::Rsi, Reg::Rsi);
                self.raise_jcc(Cond::E, FaultKind::NullReference);
                self.asm.mov_rr(Reg::Rdi, CTX_REG);
                self.asm.mov_rr(Reg::Rdx, Reg::Rbp);
                let site = self.site_label();
                self.record_safepoint(&[]);
                self.asm.lea_rip(Reg::Rcx, site);
                self.helper_call(helper_offset!(throw_exception));
                self.asm.ud2();
            }
            Rethrow => {
                self.asm.mov_rr(Reg::Rdi, CTX_REG);
                self.asm.mov_rr(Reg::Rsi, Reg::Rbp);
                let site = self.site_label();
                self.record_safepoint(&[]);
                self.asm.lea_rip(Reg::Rdx, site);
                self.helper_call(helper_offset!(rethrow));
                self.asm.ud2();
            }
            Leave => {
                let target = target_of(instr);
                // Run finally funclets for every region being exited,
                // innermost first. The funclets share this frame.
                let body = self.body;
                for region in &body.eh {
                    let in_try = region.protects(instr.offset) || region.handles_at(instr.offset);
                    let exits = !region.protects(target) && !region.handles_at(target);
                    if in_try && exits && matches!(region.kind, EhKind::Finally) {
                        let l = self.block_label_at(region.handler_offset);
                        self.asm.call(l);
                    }
                }
                self.stack.clear();
                self.maybe_poll_back_edge(instr.offset, target);
                let l = self.block_label_at(target);
                self.asm.jmp(l);
            }
            EndFinally => {
                self.asm.pop(Reg::Rcx);
                self.asm.ret();
            }
            EndFilter => {
                let top = self.top_index();
                self.load_slot(top, Reg::Rax);
                self.stack.pop();
                self.asm.pop(Reg::Rcx);
                self.asm.ret();
            }
        }
        Ok(())
    }

    // ===== Arithmetic =====

    fn emit_binop(&mut self, op: Opcode) -> Result<(), JitError> {
        use Opcode::*;
        let b = self.top_index();
        let a = b - 1;
        let kind = self.stack[a];

        if kind.is_float() {
            let double = matches!(kind, SlotKind::F64);
            match op {
                Add | Sub | Mul | Div => {
                    self.load_slot(a, Reg::Rax);
                    self.asm.movq_xr(Fpr::Xmm0, Reg::Rax);
                    self.load_slot(b, Reg::Rax);
                    self.asm.movq_xr(Fpr::Xmm1, Reg::Rax);
                    let fop = match op {
                        Add => FloatOp::Add,
                        Sub => FloatOp::Sub,
                        Mul => FloatOp::Mul,
                        _ => FloatOp::Div,
                    };
                    self.asm.float_arith(fop, double, Fpr::Xmm0, Fpr::Xmm1);
                    self.asm.movq_rx(Reg::Rax, Fpr::Xmm0);
                }
                Rem => {
                    self.load_slot(a, Reg::Rax);
                    self.asm.movq_xr(Fpr::Xmm0, Reg::Rax);
                    self.load_slot(b, Reg::Rax);
                    self.asm.movq_xr(Fpr::Xmm1, Reg::Rax);
                    let off = if double {
                        helper_offset!(float_rem64)
                    } else {
                        helper_offset!(float_rem32)
                    };
                    self.helper_call(off);
                    self.asm.movq_rx(Reg::Rax, Fpr::Xmm0);
                }
                _ => {
                    return Err(JitError::TypeMismatch {
                        offset: self.current_block_start,
                        what: "integer operation on floats",
                    })
                }
            }
            self.stack.pop();
            let top = self.top_index();
            self.store_slot(top, Reg::Rax);
            return Ok(());
        }

        let is32 = matches!(kind, SlotKind::I32);
        self.load_slot(a, Reg::Rax);
        self.load_slot(b, Reg::Rcx);
        match op {
            Add => self.asm.add_rr(Reg::Rax, Reg::Rcx),
            Sub => self.asm.sub_rr(Reg::Rax, Reg::Rcx),
            Mul => self.asm.imul_rr(Reg::Rax, Reg::Rcx),
            And => self.asm.and_rr(Reg::Rax, Reg::Rcx),
            Or => self.asm.or_rr(Reg::Rax, Reg::Rcx),
            Xor => self.asm.xor_rr(Reg::Rax, Reg::Rcx),
            Shl | Shr | ShrUn => {
                let mask = if is32 { 31 } else { 63 };
                self.asm.and_ri(Reg::Rcx, mask);
                if op == ShrUn && is32 {
                    self.asm.zext32(Reg::Rax, Reg::Rax);
                }
                let slash = match op {
                    Shl => 4,
                    ShrUn => 5,
                    _ => 7,
                };
                self.asm.shift_cl(slash, Reg::Rax);
            }
            AddOvf | SubOvf | MulOvf => {
                match op {
                    AddOvf => self.asm.add_rr(Reg::Rax, Reg::Rcx),
                    SubOvf => self.asm.sub_rr(Reg::Rax, Reg::Rcx),
                    _ => self.asm.imul_rr(Reg::Rax, Reg::Rcx),
                }
                if is32 {
                    // Result must round-trip through 32 bits
                    self.asm.sext32(Reg::Rdx, Reg::Rax);
                    self.asm.cmp_rr(Reg::Rdx, Reg::Rax);
                    self.raise_jcc(Cond::Ne, FaultKind::Overflow);
                } else {
                    self.raise_jcc(Cond::O, FaultKind::Overflow);
                }
            }
            Div | Rem => {
                // Divide-by-zero, then INT_MIN / -1
                self.asm.test_rr(Reg::Rcx, Reg::Rcx);
                self.raise_jcc(Cond::E, FaultKind::DivideByZero);
                let min = if is32 { i32::MIN as i64 } else { i64::MIN };
                self.asm.mov_ri(Reg::Rdx, min);
                self.asm.cmp_rr(Reg::Rax, Reg::Rdx);
                let ok = self.asm.label();
                self.asm.jcc(Cond::Ne, ok);
                self.asm.cmp_ri(Reg::Rcx, -1);
                self.raise_jcc(Cond::E, FaultKind::Overflow);
                self.asm.bind(ok);
                self.asm.cqo();
                self.asm.idiv(Reg::Rcx);
                if op == Rem {
                    self.asm.mov_rr(Reg::Rax, Reg::Rdx);
                }
            }
            DivUn | RemUn => {
                self.asm.test_rr(Reg::Rcx, Reg::Rcx);
                self.raise_jcc(Cond::E, FaultKind::DivideByZero);
                if is32 {
                    self.asm.zext32(Reg::Rax, Reg::Rax);
                    self.asm.zext32(Reg::Rcx, Reg::Rcx);
                }
                self.asm.zero_rdx();
                self.asm.div(Reg::Rcx);
                if op == RemUn {
                    self.asm.mov_rr(Reg::Rax, Reg::Rdx);
                }
            }
            _ => unreachable!(),
        }
        if is32 {
            self.asm.sext32(Reg::Rax, Reg::Rax);
        }
        self.stack.pop();
        let top = self.top_index();
        self.store_slot(top, Reg::Rax);
        Ok(())
    }

    fn emit_compare(&mut self, op: Opcode) -> Result<(), JitError> {
        use Opcode::*;
        let b = self.top_index();
        let a = b - 1;
        let kind = self.stack[a];

        if kind.is_float() {
            let double = matches!(kind, SlotKind::F64);
            // Operand order and condition chosen so NaN compares false for
            // the ordered forms and true for the unordered-greater/less
            let (first, second, cond) = match op {
                Ceq => (a, b, Cond::E),
                Cgt => (a, b, Cond::A),
                CltUn => (a, b, Cond::B),
                Clt => (b, a, Cond::A),
                CgtUn => (b, a, Cond::B),
                _ => unreachable!(),
            };
            self.load_slot(first, Reg::Rax);
            self.asm.movq_xr(Fpr::Xmm0, Reg::Rax);
            self.load_slot(second, Reg::Rax);
            self.asm.movq_xr(Fpr::Xmm1, Reg::Rax);
            self.asm.ucomis(double, Fpr::Xmm0, Fpr::Xmm1);
            if op == Ceq {
                // Equal and ordered
                self.asm.setcc_zx(Cond::E, Reg::Rax);
                self.asm.setcc_zx(Cond::Np, Reg::Rcx);
                self.asm.and_rr(Reg::Rax, Reg::Rcx);
            } else {
                self.asm.setcc_zx(cond, Reg::Rax);
            }
        } else {
            self.load_slot(a, Reg::Rax);
            self.load_slot(b, Reg::Rcx);
            self.asm.cmp_rr(Reg::Rax, Reg::Rcx);
            let cond = match op {
                Ceq => Cond::E,
                Cgt => Cond::G,
                CgtUn => Cond::A,
                Clt => Cond::L,
                CltUn => Cond::B,
                _ => unreachable!(),
            };
            self.asm.setcc_zx(cond, Reg::Rax);
        }
        self.stack.pop();
        self.stack.pop();
        let j = self.push_kind(SlotKind::I32)?;
        self.store_slot(j, Reg::Rax);
        Ok(())
    }

    fn emit_branch_cmp(&mut self, instr: &Instr) -> Result<(), JitError> {
        use Opcode::*;
        let target = target_of(instr);
        self.maybe_poll_back_edge(instr.offset, target);
        let b = self.top_index();
        let a = b - 1;
        let kind = self.stack[a];
        let l = self.block_label_at(target);

        if kind.is_float() {
            let double = matches!(kind, SlotKind::F64);
            // (first, second, cond, or-parity)
            let (first, second, cond) = match instr.op {
                Beq => (a, b, Cond::E),
                Bne => (a, b, Cond::Ne),
                Blt => (b, a, Cond::A),
                BltUn => (a, b, Cond::B),
                Bgt => (a, b, Cond::A),
                BgtUn => (b, a, Cond::B),
                Ble => (b, a, Cond::Ae),
                BleUn => (a, b, Cond::Be),
                Bge => (a, b, Cond::Ae),
                BgeUn => (b, a, Cond::Be),
                _ => unreachable!(),
            };
            self.load_slot(first, Reg::Rax);
            self.asm.movq_xr(Fpr::Xmm0, Reg::Rax);
            self.load_slot(second, Reg::Rax);
            self.asm.movq_xr(Fpr::Xmm1, Reg::Rax);
            self.asm.ucomis(double, Fpr::Xmm0, Fpr::Xmm1);
            match instr.op {
                Beq => {
                    // Taken only when ordered and equal
                    let skip = self.asm.label();
                    self.asm.jcc(Cond::P, skip);
                    self.asm.jcc(Cond::E, l);
                    self.asm.bind(skip);
                }
                Bne => {
                    // Taken when unordered or not equal
                    self.asm.jcc(Cond::P, l);
                    self.asm.jcc(Cond::Ne, l);
                }
                _ => self.asm.jcc(cond, l),
            }
        } else {
            self.load_slot(a, Reg::Rax);
            self.load_slot(b, Reg::Rcx);
            self.asm.cmp_rr(Reg::Rax, Reg::Rcx);
            let cond = match instr.op {
                Beq => Cond::E,
                Bne => Cond::Ne,
                Blt => Cond::L,
                BltUn => Cond::B,
                Ble => Cond::Le,
                BleUn => Cond::Be,
                Bgt => Cond::G,
                BgtUn => Cond::A,
                Bge => Cond::Ge,
                BgeUn => Cond::Ae,
                _ => unreachable!(),
            };
            self.asm.jcc(cond, l);
        }
        self.stack.pop();
        self.stack.pop();
        Ok(())
    }

    fn emit_conv(&mut self, target: PrimKind, checked: bool) -> Result<(), JitError> {
        if target == PrimKind::Ref {
            return Err(JitError::TypeMismatch {
                offset: self.current_block_start,
                what: "conversion to a reference",
            });
        }
        let top = self.top_index();
        let from = self.stack[top];

        if from.is_float() {
            let double = matches!(from, SlotKind::F64);
            match target {
                PrimKind::R4 => {
                    self.load_slot(top, Reg::Rax);
                    self.asm.movq_xr(Fpr::Xmm0, Reg::Rax);
                    if double {
                        self.asm.cvt_float_to_float(true, Fpr::Xmm0, Fpr::Xmm0);
                    }
                    self.asm.movq_rx(Reg::Rax, Fpr::Xmm0);
                    self.replace_top(SlotKind::F32)?;
                }
                PrimKind::R8 => {
                    self.load_slot(top, Reg::Rax);
                    self.asm.movq_xr(Fpr::Xmm0, Reg::Rax);
                    if !double {
                        self.asm.cvt_float_to_float(false, Fpr::Xmm0, Fpr::Xmm0);
                    }
                    self.asm.movq_rx(Reg::Rax, Fpr::Xmm0);
                    self.replace_top(SlotKind::F64)?;
                }
                _ if checked => {
                    // Range-checked float-to-int goes through the runtime
                    self.asm.mov_rr(Reg::Rdi, CTX_REG);
                    self.load_slot(top, Reg::Rsi);
                    self.asm.mov_ri(Reg::Rdx, double as i64);
                    self.asm.mov_ri(Reg::Rcx, target as u8 as i64);
                    self.asm.mov_rr(Reg::R8, Reg::Rbp);
                    let site = self.asm.label();
                    self.asm.lea_rip(Reg::R9, site);
                    self.helper_call(helper_offset!(conv_float_to_int_ovf));
                    self.asm.bind(site);
                    self.record_safepoint(&[]);
                    self.replace_top(prim_slot_kind(target))?;
                }
                _ => {
                    self.load_slot(top, Reg::Rax);
                    self.asm.movq_xr(Fpr::Xmm0, Reg::Rax);
                    self.asm.cvt_float_to_int(double, Reg::Rax, Fpr::Xmm0);
                    self.emit_int_truncate(target);
                    self.replace_top(prim_slot_kind(target))?;
                }
            }
            let new_top = self.top_index();
            self.store_slot(new_top, Reg::Rax);
            return Ok(());
        }

        // Integer source
        self.load_slot(top, Reg::Rax);
        match target {
            PrimKind::R4 => {
                self.asm.cvt_int_to_float(false, Fpr::Xmm0, Reg::Rax);
                self.asm.movq_rx(Reg::Rax, Fpr::Xmm0);
                self.replace_top(SlotKind::F32)?;
            }
            PrimKind::R8 => {
                self.asm.cvt_int_to_float(true, Fpr::Xmm0, Reg::Rax);
                self.asm.movq_rx(Reg::Rax, Fpr::Xmm0);
                self.replace_top(SlotKind::F64)?;
            }
            _ => {
                if checked {
                    self.emit_int_range_check(target);
                }
                self.emit_int_truncate(target);
                self.replace_top(prim_slot_kind(target))?;
            }
        }
        let new_top = self.top_index();
        self.store_slot(new_top, Reg::Rax);
        Ok(())
    }

    fn replace_top(&mut self, kind: SlotKind) -> Result<(), JitError> {
        self.stack.pop();
        self.push_kind(kind)?;
        Ok(())
    }

    /// Truncate/extend `rax` to the canonical 64-bit form of `target`.
    fn emit_int_truncate(&mut self, target: PrimKind) {
        use PrimKind::*;
        match target {
            I1 => self.asm.extend(1, true, Reg::Rax, Reg::Rax),
            U1 => self.asm.extend(1, false, Reg::Rax, Reg::Rax),
            I2 => self.asm.extend(2, true, Reg::Rax, Reg::Rax),
            U2 => self.asm.extend(2, false, Reg::Rax, Reg::Rax),
            // 32-bit slots are canonically sign-extended
            I4 | U4 => self.asm.sext32(Reg::Rax, Reg::Rax),
            I8 => {}
            U8 => {}
            R4 | R8 | Ref => unreachable!(),
        }
    }

    /// Signed range check of `rax` against the target's bounds.
    fn emit_int_range_check(&mut self, target: PrimKind) {
        use PrimKind::*;
        let bounds = match target {
            I1 => Some((i8::MIN as i64, i8::MAX as i64)),
            U1 => Some((0, u8::MAX as i64)),
            I2 => Some((i16::MIN as i64, i16::MAX as i64)),
            U2 => Some((0, u16::MAX as i64)),
            I4 => Some((i32::MIN as i64, i32::MAX as i64)),
            U4 => Some((0, u32::MAX as i64)),
            U8 => Some((0, i64::MAX)),
            I8 => None,
            R4 | R8 | Ref => None,
        };
        if let Some((lo, hi)) = bounds {
            self.asm.mov_ri(Reg::Rdx, lo);
            self.asm.cmp_rr(Reg::Rax, Reg::Rdx);
            self.raise_jcc(Cond::L, FaultKind::Overflow);
            self.asm.mov_ri(Reg::Rdx, hi);
            self.asm.cmp_rr(Reg::Rax, Reg::Rdx);
            self.raise_jcc(Cond::G, FaultKind::Overflow);
        }
    }

    // ===== Memory access by type =====

    /// Load a primitive of `prim` kind from `[rax]` into `rax` in
    /// canonical slot form.
    fn emit_load_prim(&mut self, prim: PrimKind, base: Reg) {
        use PrimKind::*;
        match prim {
            I1 => self.asm.load_sx(1, Reg::Rax, base, 0),
            U1 => self.asm.load_zx(1, Reg::Rax, base, 0),
            I2 => self.asm.load_sx(2, Reg::Rax, base, 0),
            U2 => self.asm.load_zx(2, Reg::Rax, base, 0),
            I4 | U4 => self.asm.load_sx(4, Reg::Rax, base, 0),
            R4 => self.asm.load_zx(4, Reg::Rax, base, 0),
            I8 | U8 | R8 | Ref => self.asm.mov_rm(Reg::Rax, base, 0),
        }
    }

    /// Load a value of type `ty` from `[base + disp]` into `rax` in
    /// canonical slot form.
    fn emit_load_sized(&mut self, ty: &'static TypeDesc, base: Reg, disp: i32) {
        match ty.kind {
            TypeKind::Primitive(p) => match p {
                Prim::I1 => self.asm.load_sx(1, Reg::Rax, base, disp),
                Prim::Bool | Prim::U1 => self.asm.load_zx(1, Reg::Rax, base, disp),
                Prim::I2 => self.asm.load_sx(2, Reg::Rax, base, disp),
                Prim::Char | Prim::U2 => self.asm.load_zx(2, Reg::Rax, base, disp),
                Prim::I4 | Prim::U4 => self.asm.load_sx(4, Reg::Rax, base, disp),
                Prim::R4 => self.asm.load_zx(4, Reg::Rax, base, disp),
                _ => self.asm.mov_rm(Reg::Rax, base, disp),
            },
            TypeKind::Value => {
                let size = ty.size.max(1).next_power_of_two().min(8) as u8;
                self.asm.load_zx(size, Reg::Rax, base, disp);
            }
            _ => self.asm.mov_rm(Reg::Rax, base, disp),
        }
    }

    /// Store `src` (canonical slot form) as a value of type `ty` at
    /// `[base + disp]`.
    fn emit_store_sized(&mut self, ty: &'static TypeDesc, base: Reg, disp: i32, src: Reg) {
        let size: u8 = match ty.kind {
            TypeKind::Primitive(p) => p.size().max(1) as u8,
            TypeKind::Value => ty.size.max(1).next_power_of_two().min(8) as u8,
            _ => 8,
        };
        self.asm.store(size, base, disp, src);
    }

    /// Pops index and array from the stack; leaves the checked element
    /// address in `rax` and the array reference in scratch slot 6.
    fn emit_element_addr(&mut self, elem: &'static TypeDesc) -> Result<(), JitError> {
        let size = elem.inline_size();
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(JitError::TypeMismatch {
                offset: self.current_block_start,
                what: "unsupported array element size",
            });
        }
        let index = self.top_index();
        let array = index - 1;
        self.load_slot(array, Reg::Rax);
        self.null_check(Reg::Rax);
        self.load_slot(index, Reg::Rcx);
        // Unsigned compare rejects negative indexes as well
        self.asm.mov_rm(Reg::Rdx, Reg::Rax, OBJ_LENGTH_OFF);
        self.asm.cmp_rr(Reg::Rcx, Reg::Rdx);
        self.raise_jcc(Cond::Ae, FaultKind::IndexOutOfRange);
        // Keep the array ref readable for store checks
        let scratch6 = self.scratch_off(6);
        self.asm.mov_mr(Reg::Rbp, scratch6, Reg::Rax);
        // rax = array + elements_offset + index * size
        self.asm.shift_imm(4, Reg::Rcx, size.trailing_zeros() as u8);
        self.asm.add_rr(Reg::Rax, Reg::Rcx);
        self.asm.add_ri(Reg::Rax, 24); // single-dimension elements offset
        self.stack.pop();
        self.stack.pop();
        Ok(())
    }

    /// Resolve the vtable slot of a virtual `md` for the receiver in
    /// `rax`; leaves the target MethodDesc in `rcx`.
    fn emit_vtable_resolve(&mut self, md: &'static MethodDesc) -> Result<(), JitError> {
        let slot = md.slot().ok_or(JitError::TypeMismatch {
            offset: self.current_block_start,
            what: "virtual call to method without a slot",
        })?;
        self.asm.mov_rm(Reg::Rcx, Reg::Rax, 0);
        self.asm.and_ri(Reg::Rcx, -16);
        self.asm.mov_rm(Reg::Rcx, Reg::Rcx, TD_VTABLE_RAW_OFF);
        self.asm.mov_rm(Reg::Rcx, Reg::Rcx, (slot * 8) as i32);
        Ok(())
    }

    // ===== Calls =====

    fn emit_call_md(&mut self, md: &'static MethodDesc, form: CallForm) -> Result<(), JitError> {
        use argon_bytecode::module::MethodFlags;

        // Delegate Invoke routes through the runtime
        if md.flags.contains(MethodFlags::INTRINSIC)
            && self.env.is_delegate(md.declaring())
            && md.name == "Invoke"
        {
            return self.emit_delegate_invoke(md);
        }
        if md.flags.contains(MethodFlags::INTRINSIC) {
            return self.emit_intrinsic(md);
        }

        let argc = md.sig.arg_count();
        let depth = self.stack.len();
        let first_arg = depth - argc;

        let virtual_dispatch = matches!(form, CallForm::Virtual)
            && md.flags.contains(MethodFlags::VIRTUAL);
        let iface = virtual_dispatch
            && matches!(md.declaring().kind, TypeKind::Interface);

        if matches!(form, CallForm::Virtual) {
            self.load_slot(first_arg, Reg::Rax);
            self.null_check(Reg::Rax);
        }

        if iface {
            // Resolve the implementation first; the helper consults the
            // receiver's interface map
            let iface_td = md.declaring();
            let index = md.slot().unwrap_or(0);
            self.asm.mov_rr(Reg::Rdi, CTX_REG);
            self.load_slot(first_arg, Reg::Rsi);
            self.asm.mov_ri(Reg::Rdx, iface_td as *const TypeDesc as i64);
            self.asm.mov_ri(Reg::Rcx, index as i64);
            self.asm.mov_rr(Reg::R8, Reg::Rbp);
            let site = self.asm.label();
            self.asm.lea_rip(Reg::R9, site);
            self.helper_call(helper_offset!(interface_entry));
            self.asm.bind(site);
            self.record_safepoint(&[]);
            self.asm.mov_rr(Reg::R11, Reg::Rax);
        } else if virtual_dispatch {
            self.load_slot(first_arg, Reg::Rax);
            self.emit_vtable_resolve(md)?;
            self.asm.mov_rm(Reg::R11, Reg::Rcx, MD_ENTRY_OFF);
        }

        // Build the outgoing argument area
        let padded = padded_arg_bytes(argc);
        if padded > 0 {
            self.asm.sub_ri(Reg::Rsp, padded as i32);
        }
        for i in 0..argc {
            self.load_slot(first_arg + i, Reg::R10);
            self.asm.mov_mr(Reg::Rsp, 8 * i as i32, Reg::R10);
        }

        if iface || virtual_dispatch {
            self.asm.call_r(Reg::R11);
        } else {
            self.asm.mov_ri(Reg::Rax, md as *const MethodDesc as i64);
            self.asm.call_m(Reg::Rax, MD_ENTRY_OFF);
        }
        self.stack.truncate(first_arg);
        self.record_safepoint(&[]);
        self.push_call_result(md.sig.ret)?;
        Ok(())
    }

    fn push_call_result(&mut self, ret: &'static TypeDesc) -> Result<(), JitError> {
        if matches!(ret.kind, TypeKind::Primitive(Prim::Void)) {
            return Ok(());
        }
        let kind = super::slot_kind_of(ret);
        if kind.is_float() {
            self.asm.movq_rx(Reg::Rax, Fpr::Xmm0);
        }
        let j = self.push_kind(kind)?;
        self.store_slot(j, Reg::Rax);
        Ok(())
    }

    fn emit_calli(&mut self, instr: &Instr) -> Result<(), JitError> {
        let sig = self.env.signature(token_of(instr))?;
        let argc = sig.arg_count();
        let ftn = self.top_index();
        let first_arg = ftn - argc;

        self.load_slot(ftn, Reg::R11);
        let padded = padded_arg_bytes(argc);
        if padded > 0 {
            self.asm.sub_ri(Reg::Rsp, padded as i32);
        }
        for i in 0..argc {
            self.load_slot(first_arg + i, Reg::R10);
            self.asm.mov_mr(Reg::Rsp, 8 * i as i32, Reg::R10);
        }
        self.asm.call_r(Reg::R11);
        self.stack.truncate(first_arg);
        self.record_safepoint(&[]);
        self.push_call_result(sig.ret)?;
        Ok(())
    }

    fn emit_newobj(&mut self, instr: &Instr) -> Result<(), JitError> {
        let ctor = self.env.method(token_of(instr))?;
        let td = ctor.declaring();
        let params = ctor.sig.params.len();
        let depth = self.stack.len();
        let first_param = depth - params;

        if self.env.is_delegate(td) {
            // (target, ftn) constructor becomes a runtime call
            self.asm.mov_rr(Reg::Rdi, CTX_REG);
            self.asm.mov_ri(Reg::Rsi, td as *const TypeDesc as i64);
            self.load_slot(first_param, Reg::Rdx);
            self.load_slot(first_param + 1, Reg::Rcx);
            self.asm.mov_rr(Reg::R8, Reg::Rbp);
            let site = self.asm.label();
            self.asm.lea_rip(Reg::R9, site);
            self.helper_call(helper_offset!(delegate_create));
            self.asm.bind(site);
            self.stack.truncate(first_param);
            self.record_safepoint(&[]);
            let j = self.push_kind(SlotKind::Ref)?;
            self.store_slot(j, Reg::Rax);
            return Ok(());
        }

        // Allocate, park the reference in scratch0, then run the ctor
        self.asm.mov_rr(Reg::Rdi, CTX_REG);
        self.asm.mov_ri(Reg::Rsi, td as *const TypeDesc as i64);
        self.asm.mov_rr(Reg::Rdx, Reg::Rbp);
        let site = self.asm.label();
        self.asm.lea_rip(Reg::Rcx, site);
        self.helper_call(helper_offset!(alloc_object));
        self.asm.bind(site);
        self.record_safepoint(&[]);
        let scratch0 = self.scratch_off(0);
        self.asm.mov_mr(Reg::Rbp, scratch0, Reg::Rax);

        let argc = params + 1;
        let padded = padded_arg_bytes(argc);
        self.asm.sub_ri(Reg::Rsp, padded as i32);
        self.asm.mov_rm(Reg::R10, Reg::Rbp, scratch0);
        self.asm.mov_mr(Reg::Rsp, 0, Reg::R10);
        for i in 0..params {
            self.load_slot(first_param + i, Reg::R10);
            self.asm.mov_mr(Reg::Rsp, 8 * (i + 1) as i32, Reg::R10);
        }
        self.asm.mov_ri(Reg::Rax, ctor as *const MethodDesc as i64);
        self.asm.call_m(Reg::Rax, MD_ENTRY_OFF);
        self.stack.truncate(first_param);
        self.record_safepoint(&[SlotRef {
            loc: RefLocation::Frame(scratch0),
            interior: false,
        }]);
        let j = self.push_kind(SlotKind::Ref)?;
        self.asm.mov_rm(Reg::Rax, Reg::Rbp, scratch0);
        self.store_slot(j, Reg::Rax);
        Ok(())
    }

    fn emit_delegate_invoke(&mut self, md: &'static MethodDesc) -> Result<(), JitError> {
        let params = md.sig.params.len();
        let depth = self.stack.len();
        let delegate = depth - params - 1;

        self.load_slot(delegate, Reg::Rsi);
        self.asm.test_rr(Reg::Rsi, Reg::Rsi);
        self.raise_jcc(Cond::E, FaultKind::NullReference);
        self.asm.mov_rr(Reg::Rdi, CTX_REG);
        // Arguments live contiguously in the eval temps; the helper
        // receives the address of the topmost (lowest) slot and indexes
        // backwards.
        if params > 0 {
            let off = self.slot_off(depth - 1);
            self.asm.lea(Reg::Rdx, Reg::Rbp, off);
        } else {
            self.asm.xor_rr(Reg::Rdx, Reg::Rdx);
        }
        self.asm.mov_ri(Reg::Rcx, params as i64);
        self.asm.mov_rr(Reg::R8, Reg::Rbp);
        let site = self.asm.label();
        self.asm.lea_rip(Reg::R9, site);
        self.helper_call(helper_offset!(delegate_invoke));
        self.asm.bind(site);
        // The delegate and its argument slots stay in the stackmap: the
        // helper re-reads them per multicast node, so a collection during
        // one invocation must keep rewriting them.
        self.record_safepoint(&[]);
        self.stack.truncate(delegate);
        self.push_call_result(md.sig.ret)?;
        Ok(())
    }

    /// Runtime-intrinsic methods with inline expansions: interlocked
    /// operations. Signatures are fixed by the system module.
    fn emit_intrinsic(&mut self, md: &'static MethodDesc) -> Result<(), JitError> {
        match md.name.as_str() {
            // CompareExchange(location: byref, value, comparand) -> original
            "CompareExchange" => {
                let comparand = self.top_index();
                let value = comparand - 1;
                let location = comparand - 2;
                self.load_slot(comparand, Reg::Rax);
                self.load_slot(value, Reg::Rcx);
                self.load_slot(location, Reg::Rdx);
                self.asm.lock_cmpxchg(Reg::Rdx, 0, Reg::Rcx);
                self.stack.truncate(location);
                self.push_call_result(md.sig.ret)?;
                Ok(())
            }
            // Add(location: byref, value) -> new value
            "InterlockedAdd" => {
                let value = self.top_index();
                let location = value - 1;
                self.load_slot(value, Reg::Rcx);
                self.load_slot(location, Reg::Rdx);
                self.asm.mov_rr(Reg::Rax, Reg::Rcx);
                self.asm.lock_xadd(Reg::Rdx, 0, Reg::Rax);
                self.asm.add_rr(Reg::Rax, Reg::Rcx);
                self.stack.truncate(location);
                self.push_call_result(md.sig.ret)?;
                Ok(())
            }
            // MemoryBarrier()
            "MemoryBarrier" => {
                self.asm.mfence();
                Ok(())
            }
            // StartThread(delegate) -> thread id
            "StartThread" => {
                let top = self.top_index();
                self.asm.mov_rr(Reg::Rdi, CTX_REG);
                self.load_slot(top, Reg::Rsi);
                self.asm.mov_rr(Reg::Rdx, Reg::Rbp);
                let site = self.asm.label();
                self.asm.lea_rip(Reg::Rcx, site);
                self.helper_call(helper_offset!(thread_start));
                self.asm.bind(site);
                self.stack.pop();
                self.record_safepoint(&[]);
                self.push_call_result(md.sig.ret)?;
                Ok(())
            }
            // JoinThread(id, timeout ms) -> 0 signaled / 1 timed out
            "JoinThread" => {
                let timeout = self.top_index();
                self.asm.mov_rr(Reg::Rdi, CTX_REG);
                self.load_slot(timeout - 1, Reg::Rsi);
                self.load_slot(timeout, Reg::Rdx);
                self.asm.mov_rr(Reg::Rcx, Reg::Rbp);
                let site = self.asm.label();
                self.asm.lea_rip(Reg::R8, site);
                self.helper_call(helper_offset!(thread_join));
                self.asm.bind(site);
                self.stack.pop();
                self.stack.pop();
                self.record_safepoint(&[]);
                self.push_call_result(md.sig.ret)?;
                Ok(())
            }
            // YieldThread()
            "YieldThread" => {
                self.asm.mov_rr(Reg::Rdi, CTX_REG);
                self.asm.mov_rr(Reg::Rsi, Reg::Rbp);
                let site = self.asm.label();
                self.asm.lea_rip(Reg::Rdx, site);
                self.helper_call(helper_offset!(thread_yield));
                self.asm.bind(site);
                self.record_safepoint(&[]);
                Ok(())
            }
            // Sleep(ms)
            "Sleep" => {
                let top = self.top_index();
                self.asm.mov_rr(Reg::Rdi, CTX_REG);
                self.load_slot(top, Reg::Rsi);
                self.asm.mov_rr(Reg::Rdx, Reg::Rbp);
                let site = self.asm.label();
                self.asm.lea_rip(Reg::Rcx, site);
                self.helper_call(helper_offset!(thread_sleep));
                self.asm.bind(site);
                self.stack.pop();
                self.record_safepoint(&[]);
                Ok(())
            }
            _ => Err(JitError::TypeMismatch {
                offset: self.current_block_start,
                what: "unknown intrinsic",
            }),
        }
    }
}

/// How a call site dispatches.
enum CallForm {
    Direct,
    Virtual,
}

fn push_ref_slot(refs: &mut Vec<SlotRef>, kind: SlotKind, off: i32) {
    match kind {
        SlotKind::Ref => refs.push(SlotRef {
            loc: RefLocation::Frame(off),
            interior: false,
        }),
        SlotKind::ByRef => refs.push(SlotRef {
            loc: RefLocation::Frame(off),
            interior: true,
        }),
        SlotKind::Val(td) if !td.ref_offsets().is_empty() => {
            // A value type small enough for a slot with references inside
            // is a single reference field
            refs.push(SlotRef {
                loc: RefLocation::Frame(off),
                interior: false,
            });
        }
        _ => {}
    }
}

fn token_of(instr: &Instr) -> argon_bytecode::Token {
    match instr.operand {
        Operand::Token(t) => t,
        _ => unreachable!("token operand expected"),
    }
}

fn slot_of(instr: &Instr) -> u16 {
    match instr.operand {
        Operand::Slot(s) => s,
        _ => unreachable!("slot operand expected"),
    }
}

fn target_of(instr: &Instr) -> u32 {
    match instr.operand {
        Operand::Target(t) => t,
        _ => unreachable!("target operand expected"),
    }
}

fn kind_operand(instr: &Instr) -> PrimKind {
    match instr.operand {
        Operand::Kind(k) => k,
        _ => unreachable!("kind operand expected"),
    }
}

fn prim_slot_kind(kind: PrimKind) -> SlotKind {
    use PrimKind::*;
    match kind {
        I8 | U8 => SlotKind::I64,
        R4 => SlotKind::F32,
        R8 => SlotKind::F64,
        Ref => SlotKind::Ref,
        _ => SlotKind::I32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::analysis::analyze;
    use crate::types::{ResolvedSig, TypeRegistry};
    use argon_bytecode::body::InstrWriter;
    use argon_bytecode::{MethodBody, Token};
    use once_cell::sync::Lazy;

    static REGISTRY: Lazy<TypeRegistry> = Lazy::new(TypeRegistry::new);

    struct TestEnv {
        args: Vec<SlotKind>,
        locals: Vec<SlotKind>,
        ret: Option<SlotKind>,
    }

    impl super::super::BodyEnv for TestEnv {
        fn arg_kinds(&self) -> &[SlotKind] {
            &self.args
        }
        fn local_kinds(&self) -> &[SlotKind] {
            &self.locals
        }
        fn ret_kind(&self) -> Option<SlotKind> {
            self.ret
        }
        fn method(&self, t: Token) -> Result<&'static MethodDesc, JitError> {
            Err(JitError::Unresolved(t.0))
        }
        fn signature(&self, t: Token) -> Result<ResolvedSig, JitError> {
            Err(JitError::Unresolved(t.0))
        }
        fn field(&self, t: Token) -> Result<super::super::FieldRef, JitError> {
            Err(JitError::Unresolved(t.0))
        }
        fn type_desc(&self, _t: Token) -> Result<&'static TypeDesc, JitError> {
            Ok(REGISTRY.object())
        }
        fn string_literal(&self, t: Token) -> Result<usize, JitError> {
            Err(JitError::Unresolved(t.0))
        }
        fn array_type(&self, element: &'static TypeDesc, rank: u8) -> &'static TypeDesc {
            REGISTRY.array_of(element, rank)
        }
        fn box_type(&self, value: &'static TypeDesc) -> &'static TypeDesc {
            REGISTRY.box_of(value)
        }
        fn is_delegate(&self, _td: &'static TypeDesc) -> bool {
            false
        }
    }

    fn compile(code: Vec<u8>, env: &TestEnv) -> CodegenOutput {
        let body = MethodBody {
            max_stack: 16,
            locals: vec![],
            code,
            eh: vec![],
        };
        let graph = analyze(&body, env).unwrap();
        generate(&body, &graph, env).unwrap()
    }

    #[test]
    fn test_simple_method_shape() {
        let mut w = InstrWriter::new();
        w.ldc_i4(2).ldc_i4(3).op(Opcode::Add).op(Opcode::Ret);
        let env = TestEnv {
            args: vec![],
            locals: vec![],
            ret: Some(SlotKind::I32),
        };
        let out = compile(w.finish(), &env);
        // push rbp prologue, ret imm16 epilogue
        assert_eq!(out.code[0], 0x55);
        assert!(out.code.windows(3).any(|win| win[0] == 0xC2));
        assert_eq!(out.frame_size % 16, 0);
    }

    #[test]
    fn test_back_edge_emits_poll_and_safepoint() {
        // while (local0) local0 = local0 - 1
        let mut w = InstrWriter::new();
        let top = w.label();
        let exit = w.label();
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
        let env = TestEnv {
            args: vec![],
            locals: vec![SlotKind::I32],
            ret: None,
        };
        let out = compile(w.finish(), &env);
        // cmp dword [r14 + 0], 0 = 41 81 3E imm32
        assert!(
            out.code.windows(3).any(|win| win == [0x41, 0x81, 0x3E]),
            "poll sequence missing"
        );
        assert_eq!(out.stackmap.len(), 1);
        assert_eq!(out.safepoints, 1);
    }

    #[test]
    fn test_div_emits_fault_checks() {
        let mut w = InstrWriter::new();
        w.slot(Opcode::LdArg, 0);
        w.slot(Opcode::LdArg, 1);
        w.op(Opcode::Div);
        w.op(Opcode::Ret);
        let env = TestEnv {
            args: vec![SlotKind::I32, SlotKind::I32],
            locals: vec![],
            ret: Some(SlotKind::I32),
        };
        let out = compile(w.finish(), &env);
        // idiv present, and out-of-line raises end in ud2
        assert!(out.code.windows(2).any(|win| win == [0x0F, 0x0B]), "no ud2");
        assert!(
            out.code.windows(3).any(|win| win == [0x48, 0xF7, 0xF9]),
            "no idiv rcx"
        );
    }

    #[test]
    fn test_ref_local_appears_in_stackmap() {
        // Loop with a poll; the ref local must be reported
        let mut w = InstrWriter::new();
        let top = w.label();
        let exit = w.label();
        w.bind(top);
        w.slot(Opcode::LdLoc, 1);
        w.branch(Opcode::BrFalse, exit);
        w.branch(Opcode::Br, top);
        w.bind(exit);
        w.op(Opcode::Ret);
        let env = TestEnv {
            args: vec![],
            locals: vec![SlotKind::Ref, SlotKind::I32],
            ret: None,
        };
        let out = compile(w.finish(), &env);
        let entry = &out.stackmap.entries()[0];
        let has_ref = entry.refs.iter().any(|r| {
            matches!(r.loc, RefLocation::Frame(off) if off == -8) && !r.interior
        });
        assert!(has_ref, "ref local (rbp-8) not in stackmap: {entry:?}");
    }

    #[test]
    fn test_eh_table_rebased_to_native() {
        // try { nop; leave } catch { pop; leave } ; ret
        let mut w = InstrWriter::new();
        let after = w.label();
        w.op(Opcode::Nop);
        w.branch(Opcode::Leave, after);
        let handler = w.offset();
        w.op(Opcode::Pop);
        w.branch(Opcode::Leave, after);
        w.bind(after);
        w.op(Opcode::Ret);
        let code = w.finish();
        let code_len = code.len() as u32;

        let body = MethodBody {
            max_stack: 8,
            locals: vec![],
            code,
            eh: vec![argon_bytecode::EhRegion {
                kind: argon_bytecode::EhKind::Catch(Token::type_def(0)),
                try_offset: 0,
                try_len: handler,
                handler_offset: handler,
                handler_len: code_len - handler - 1,
            }],
        };
        let env = TestEnv {
            args: vec![],
            locals: vec![],
            ret: None,
        };
        let graph = analyze(&body, &env).unwrap();
        let out = generate(&body, &graph, &env).unwrap();
        let rows = out.eh.entries();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].try_start < rows[0].try_end);
        assert!(rows[0].handler_pc >= rows[0].try_end);
        assert!(matches!(rows[0].kind, HandlerKind::Catch(_)));
    }

    #[test]
    fn test_switch_emits_table() {
        let mut w = InstrWriter::new();
        let (a, b) = (w.label(), w.label());
        w.slot(Opcode::LdArg, 0);
        w.switch(&[a, b]);
        w.bind(a);
        w.ldc_i4(1).op(Opcode::Ret);
        w.bind(b);
        w.ldc_i4(2).op(Opcode::Ret);
        let env = TestEnv {
            args: vec![SlotKind::I32],
            locals: vec![],
            ret: Some(SlotKind::I32),
        };
        let out = compile(w.finish(), &env);
        // Indirect jump through the table
        assert!(out.code.windows(2).any(|win| win == [0xFF, 0xE2]), "no jmp rdx");
    }

    #[test]
    fn test_oversized_value_on_stack_rejected() {
        let big = crate::types::registry_leak_for_tests(crate::types::TypeDesc::shell(
            "Big".into(),
            crate::types::TypeKind::Value,
            24,
            8,
            None,
        ));
        let mut w = InstrWriter::new();
        w.slot(Opcode::LdLoc, 0);
        w.op(Opcode::Pop);
        w.op(Opcode::Ret);
        let env = TestEnv {
            args: vec![],
            locals: vec![SlotKind::Val(big)],
            ret: None,
        };
        let body = MethodBody {
            max_stack: 8,
            locals: vec![],
            code: w.finish(),
            eh: vec![],
        };
        let graph = analyze(&body, &env).unwrap();
        let err = generate(&body, &graph, &env).unwrap_err();
        assert!(matches!(err, JitError::TypeMismatch { .. }));
    }
}
