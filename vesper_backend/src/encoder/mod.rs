//! Final encoding: register-allocated IR to machine bytes.
//!
//! The [`Encoder`] walks the instruction list front to back, letting the
//! per-ISA [`EncoderMd`] emit bytes for each instruction, then patches
//! intra-function branch displacements once every label's offset is
//! known. Cross-buffer references (jump-table entries, bailout helper
//! addresses) cannot be finalized here (the code's base address is only
//! known after installation), so they are returned as fixup lists for the
//! installer to resolve.

pub mod eh_frame;
pub mod pdata;
pub mod x64;
pub mod xdata;

use rustc_hash::FxHashMap;

use crate::bailout::BailOutKind;
use crate::error::{CodeGenError, CodeGenResult};
use crate::ir::{InstrId, IrFunc, OpCode};
use crate::regalloc::AllocationMap;

pub use x64::X64EncoderMd;

/// The encoder for the build target.
pub type NativeEncoderMd = X64EncoderMd;

/// A machine-code buffer under construction.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    /// Current emit offset.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Append one byte.
    #[inline]
    pub fn push(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    /// Append a little-endian u32.
    #[inline]
    pub fn push_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a little-endian u64.
    #[inline]
    pub fn push_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Overwrite a previously emitted u32.
    pub fn patch_u32(&mut self, offset: u32, value: u32) {
        let offset = offset as usize;
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// The emitted bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// A pending rel32 branch displacement.
#[derive(Debug, Clone, Copy)]
pub struct BranchReloc {
    /// Offset of the 4-byte displacement field.
    pub patch_offset: u32,
    /// Label the branch targets.
    pub target: InstrId,
}

/// A jump table whose entries need absolute addresses at install time.
#[derive(Debug, Clone)]
pub struct JumpTableFixup {
    /// Offset of the imm64 holding the table's address.
    pub imm64_patch_offset: u32,
    /// Offset of the table itself within the buffer.
    pub table_offset: u32,
    /// Labels of the table's entries, in slot order.
    pub entry_labels: Vec<InstrId>,
}

/// A site that transfers to the bailout helper at runtime.
#[derive(Debug, Clone, Copy)]
pub struct BailOutSite {
    /// Offset of the imm64 helper-address slot.
    pub imm64_patch_offset: u32,
    /// Byte-code offset to resume interpretation at.
    pub byte_code_offset: u32,
    /// Why the site bails.
    pub kind: BailOutKind,
}

/// Everything the installer needs: bytes plus unresolved references.
#[derive(Debug)]
pub struct EncodeResult {
    /// The emitted machine code (jump tables appended at the end).
    pub code: Vec<u8>,
    /// Buffer offset of every label instruction.
    pub label_offsets: FxHashMap<InstrId, u32>,
    /// Jump tables awaiting absolute entry addresses.
    pub jump_tables: Vec<JumpTableFixup>,
    /// Bailout transfer sites awaiting the helper address.
    pub bailout_sites: Vec<BailOutSite>,
}

/// Per-ISA encoding backend.
pub trait EncoderMd {
    /// Emit machine bytes for one instruction.
    fn encode_instr(&self, ctx: &mut EncodeContext<'_>, id: InstrId) -> CodeGenResult<()>;
}

/// Shared state handed to the ISA backend per instruction.
pub struct EncodeContext<'a> {
    /// The function being encoded.
    pub func: &'a IrFunc,
    /// Symbol placements.
    pub allocs: &'a AllocationMap,
    /// Output buffer.
    pub buffer: &'a mut CodeBuffer,
    /// rel32 fields to patch once labels are placed.
    pub branch_relocs: &'a mut Vec<BranchReloc>,
    /// Jump tables to lay out after the code.
    pub jump_tables: &'a mut Vec<JumpTableFixup>,
    /// Bailout transfer sites.
    pub bailout_sites: &'a mut Vec<BailOutSite>,
}

/// Drives the ISA backend over a function and resolves local branches.
pub struct Encoder<Md: EncoderMd> {
    md: Md,
}

impl<Md: EncoderMd> Encoder<Md> {
    /// Create an encoder over an ISA backend.
    pub fn new(md: Md) -> Self {
        Encoder { md }
    }

    /// Encode a register-allocated function.
    pub fn encode(&self, func: &IrFunc, allocs: &AllocationMap) -> CodeGenResult<EncodeResult> {
        let mut buffer = CodeBuffer::default();
        let mut label_offsets = FxHashMap::default();
        let mut branch_relocs = Vec::new();
        let mut jump_tables = Vec::new();
        let mut bailout_sites = Vec::new();

        for id in func.arena.iter() {
            if func.arena.instr(id).opcode == OpCode::Label {
                label_offsets.insert(id, buffer.offset());
                continue;
            }
            let mut ctx = EncodeContext {
                func,
                allocs,
                buffer: &mut buffer,
                branch_relocs: &mut branch_relocs,
                jump_tables: &mut jump_tables,
                bailout_sites: &mut bailout_sites,
            };
            self.md.encode_instr(&mut ctx, id)?;
        }

        // Lay out jump tables after the body, eight bytes per entry;
        // entries are patched with absolute addresses at install time.
        for table in &mut jump_tables {
            table.table_offset = buffer.offset();
            for _ in &table.entry_labels {
                buffer.push_u64(0);
            }
        }

        // Resolve intra-function branches.
        for reloc in &branch_relocs {
            let target = *label_offsets
                .get(&reloc.target)
                .ok_or(CodeGenError::UnsupportedOpcode("branch to unplaced label"))?;
            // rel32 is relative to the end of the displacement field.
            let next = reloc.patch_offset + 4;
            buffer.patch_u32(reloc.patch_offset, target.wrapping_sub(next));
        }

        Ok(EncodeResult {
            code: buffer.into_bytes(),
            label_offsets,
            jump_tables,
            bailout_sites,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IRType, Instr, IrFunc, Opnd};
    use crate::regalloc::{build_lifetimes, LinearScan, X64LinearScanMd};
    use vesper_core::config::PhaseFlags;

    fn encode_func(func: &mut IrFunc) -> EncodeResult {
        func.number_instrs();
        let lifetimes = build_lifetimes(func);
        let md = X64LinearScanMd;
        let phases = PhaseFlags::new();
        let (allocs, _) = LinearScan::new(&md, &phases).allocate(func, lifetimes);
        Encoder::new(X64EncoderMd).encode(func, &allocs).expect("encode")
    }

    #[test]
    fn test_ret_and_nop() {
        let mut func = IrFunc::new();
        func.arena.append(Instr::new(OpCode::Nop));
        func.arena.append(Instr::new(OpCode::Ret));
        let result = encode_func(&mut func);
        assert_eq!(result.code, vec![0x90, 0xC3]);
    }

    #[test]
    fn test_backward_branch_displacement() {
        let mut func = IrFunc::new();
        let label = func.arena.append(Instr::new(OpCode::Label));
        func.arena.append(Instr::new(OpCode::Br).with_target(label));
        let result = encode_func(&mut func);
        // jmp rel32 at offset 0: E9 followed by -5.
        assert_eq!(result.code[0], 0xE9);
        assert_eq!(
            i32::from_le_bytes(result.code[1..5].try_into().unwrap()),
            -5
        );
    }

    #[test]
    fn test_forward_branch_displacement() {
        let mut func = IrFunc::new();
        let label = func.arena.alloc_detached(Instr::new(OpCode::Label));
        func.arena.append(Instr::new(OpCode::Br).with_target(label));
        func.arena.append(Instr::new(OpCode::Nop));
        func.arena.append_detached(label);
        func.arena.append(Instr::new(OpCode::Ret));
        let result = encode_func(&mut func);
        // jmp (5 bytes) skips the nop: displacement 1.
        assert_eq!(result.code[0], 0xE9);
        assert_eq!(i32::from_le_bytes(result.code[1..5].try_into().unwrap()), 1);
        assert_eq!(*result.code.last().unwrap(), 0xC3);
        assert_eq!(result.label_offsets[&label], 6);
    }

    #[test]
    fn test_mov_imm_uses_allocated_register() {
        let mut func = IrFunc::new();
        let a = func.new_sym(IRType::Int32);
        func.arena.append(
            Instr::new(OpCode::Ld)
                .with_dst(Opnd::reg(a, IRType::Int32))
                .with_src1(Opnd::int32(7)),
        );
        func.arena.append(Instr::new(OpCode::Ret));
        let result = encode_func(&mut func);
        // mov r32, imm32 (B8+rd) for a low register, no REX.
        assert_eq!(result.code[0] & 0xF8, 0xB8);
        assert_eq!(u32::from_le_bytes(result.code[1..5].try_into().unwrap()), 7);
    }

    #[test]
    fn test_conditional_branch_emits_cmp_then_jcc() {
        let mut func = IrFunc::new();
        let a = func.new_sym(IRType::Int32);
        func.arena.append(
            Instr::new(OpCode::Ld)
                .with_dst(Opnd::reg(a, IRType::Int32))
                .with_src1(Opnd::int32(1)),
        );
        let label = func.arena.alloc_detached(Instr::new(OpCode::Label));
        func.arena.append(
            Instr::new(OpCode::BrEq)
                .with_src1(Opnd::reg(a, IRType::Int32))
                .with_src2(Opnd::int32(2))
                .with_target(label),
        );
        func.arena.append_detached(label);
        func.arena.append(Instr::new(OpCode::Ret));
        let result = encode_func(&mut func);

        // Somewhere in the stream: cmp r/m32, imm32 (81 /7) then je
        // rel32 (0F 84).
        let code = &result.code;
        let cmp_pos = code.windows(1).position(|w| w[0] == 0x81).expect("cmp");
        assert_eq!(code[cmp_pos + 1] >> 3 & 0x7, 7);
        let jcc_pos = code.windows(2).position(|w| w == [0x0F, 0x84]).expect("je");
        // Branch lands exactly at the label (end of jcc).
        let disp = i32::from_le_bytes(code[jcc_pos + 2..jcc_pos + 6].try_into().unwrap());
        assert_eq!(disp, 0);
    }

    #[test]
    fn test_bailout_site_recorded() {
        let mut func = IrFunc::new();
        let mut bail = Instr::new(OpCode::BailOut);
        bail.bail_out_kind = Some(BailOutKind::ExpectingInteger);
        bail.byte_code_offset = 42;
        func.arena.append(bail);
        let result = encode_func(&mut func);
        assert_eq!(result.bailout_sites.len(), 1);
        assert_eq!(result.bailout_sites[0].byte_code_offset, 42);
        assert_eq!(result.bailout_sites[0].kind, BailOutKind::ExpectingInteger);
        // The imm64 slot is inside the emitted code.
        assert!((result.bailout_sites[0].imm64_patch_offset as usize) < result.code.len());
    }

    #[test]
    fn test_jump_table_layout() {
        let mut func = IrFunc::new();
        let a = func.new_sym(IRType::Int32);
        func.arena.append(
            Instr::new(OpCode::Ld)
                .with_dst(Opnd::reg(a, IRType::Int32))
                .with_src1(Opnd::int32(0)),
        );
        let l0 = func.arena.alloc_detached(Instr::new(OpCode::Label));
        let l1 = func.arena.alloc_detached(Instr::new(OpCode::Label));
        let mut multi = Instr::new(OpCode::MultiBr).with_src1(Opnd::reg(a, IRType::Int32));
        multi.multi_targets.push(l0);
        multi.multi_targets.push(l1);
        func.arena.append(multi);
        func.arena.append_detached(l0);
        func.arena.append(Instr::new(OpCode::Ret));
        func.arena.append_detached(l1);
        func.arena.append(Instr::new(OpCode::Ret));

        let result = encode_func(&mut func);
        assert_eq!(result.jump_tables.len(), 1);
        let table = &result.jump_tables[0];
        assert_eq!(table.entry_labels, vec![l0, l1]);
        // Table sits after the code body, 8 bytes per entry.
        assert_eq!(result.code.len() as u32, table.table_offset + 16);
    }
}
