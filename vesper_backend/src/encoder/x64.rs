//! x64 machine encoding.
//!
//! Emits the x64 subset the lowered IR uses: REX-prefixed ALU forms,
//! moves (register, immediate, and RBP-relative spill slots), compare
//! plus conditional branch pairs, indirect jumps through jump tables, and
//! the bailout transfer sequence. Spilled operands are staged through the
//! scratch register (R11), which the allocator never hands out.
//!
//! Instruction format: `[REX] [opcode] [ModR/M] [disp] [imm]`.

use crate::error::{CodeGenError, CodeGenResult};
use crate::ir::{Instr, InstrId, OpCode, Opnd};
use crate::regalloc::{Allocation, Reg};

use super::{BailOutSite, BranchReloc, EncodeContext, EncoderMd, JumpTableFixup};

/// Scratch register used for spill staging and absolute jumps.
const SCRATCH: u8 = 11; // r11

/// Spill slots live below the frame pointer.
#[inline]
fn spill_disp(slot: u32) -> i32 {
    -8 * (slot as i32 + 1)
}

#[inline]
fn rex(w: bool, r: u8, x: u8, b: u8) -> u8 {
    0x40 | ((w as u8) << 3) | ((r >> 3) << 2) | ((x >> 3) << 1) | (b >> 3)
}

#[inline]
fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
    (mod_ << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Condition-code nibble for the `0F 8x` jcc family.
fn cc_of(opcode: OpCode) -> Option<u8> {
    Some(match opcode {
        OpCode::BrEq => 0x4,
        OpCode::BrNeq => 0x5,
        OpCode::BrLt => 0xC,
        OpCode::BrGe => 0xD,
        OpCode::BrLe => 0xE,
        OpCode::BrGt => 0xF,
        _ => return None,
    })
}

/// x64 backend for the [`Encoder`](super::Encoder).
#[derive(Debug, Clone, Copy, Default)]
pub struct X64EncoderMd;

enum Resolved {
    /// Value is in a register.
    Reg(u8),
    /// Value is an int constant.
    Imm(i64),
    /// Value lives in a spill slot.
    Spill(u32),
}

impl X64EncoderMd {
    fn resolve(ctx: &EncodeContext<'_>, opnd: &Opnd) -> CodeGenResult<Resolved> {
        match opnd {
            Opnd::Reg { sym, .. } => match ctx.allocs.get(*sym) {
                Some(Allocation::Reg(Reg(enc))) => Ok(Resolved::Reg(enc)),
                Some(Allocation::Spill(slot)) => Ok(Resolved::Spill(slot)),
                None => Err(CodeGenError::UnsupportedOpcode("unallocated symbol")),
            },
            Opnd::IntConst { value, .. } => Ok(Resolved::Imm(*value)),
            Opnd::AddrConst { value, .. } => Ok(Resolved::Imm(*value as i64)),
            _ => Err(CodeGenError::UnsupportedOpcode("operand kind")),
        }
    }

    /// Load a resolved value into a register, staging spills/immediates
    /// through the scratch register if needed. Returns the register.
    fn value_to_reg(ctx: &mut EncodeContext<'_>, value: &Resolved) -> u8 {
        match value {
            Resolved::Reg(enc) => *enc,
            Resolved::Imm(imm) => {
                Self::emit_mov_imm(ctx, SCRATCH, *imm);
                SCRATCH
            }
            Resolved::Spill(slot) => {
                Self::emit_spill_load(ctx, SCRATCH, *slot);
                SCRATCH
            }
        }
    }

    fn emit_mov_imm(ctx: &mut EncodeContext<'_>, dst: u8, imm: i64) {
        let buffer = &mut *ctx.buffer;
        if let Ok(imm32) = u32::try_from(imm) {
            // mov r32, imm32 zero-extends.
            if dst >= 8 {
                buffer.push(rex(false, 0, 0, dst));
            }
            buffer.push(0xB8 | (dst & 7));
            buffer.push_u32(imm32);
        } else {
            // mov r64, imm64
            buffer.push(rex(true, 0, 0, dst));
            buffer.push(0xB8 | (dst & 7));
            buffer.push_u64(imm as u64);
        }
    }

    fn emit_mov_rr(ctx: &mut EncodeContext<'_>, dst: u8, src: u8) {
        let buffer = &mut *ctx.buffer;
        buffer.push(rex(true, src, 0, dst));
        buffer.push(0x89); // mov r/m64, r64
        buffer.push(modrm(0b11, src, dst));
    }

    /// `mov reg, [rbp + disp32]`
    fn emit_spill_load(ctx: &mut EncodeContext<'_>, dst: u8, slot: u32) {
        let buffer = &mut *ctx.buffer;
        buffer.push(rex(true, dst, 0, 5));
        buffer.push(0x8B);
        buffer.push(modrm(0b10, dst, 5));
        buffer.push_u32(spill_disp(slot) as u32);
    }

    /// `mov [rbp + disp32], reg`
    fn emit_spill_store(ctx: &mut EncodeContext<'_>, src: u8, slot: u32) {
        let buffer = &mut *ctx.buffer;
        buffer.push(rex(true, src, 0, 5));
        buffer.push(0x89);
        buffer.push(modrm(0b10, src, 5));
        buffer.push_u32(spill_disp(slot) as u32);
    }

    /// ALU op `r/m64, r64` by opcode byte.
    fn emit_alu_rr(ctx: &mut EncodeContext<'_>, opcode: u8, dst: u8, src: u8) {
        let buffer = &mut *ctx.buffer;
        buffer.push(rex(true, src, 0, dst));
        buffer.push(opcode);
        buffer.push(modrm(0b11, src, dst));
    }

    /// ALU op `r/m32, imm32` through the `81 /n` group.
    fn emit_alu_imm(ctx: &mut EncodeContext<'_>, group_index: u8, dst: u8, imm: i32) {
        let buffer = &mut *ctx.buffer;
        if dst >= 8 {
            buffer.push(rex(false, 0, 0, dst));
        }
        buffer.push(0x81);
        buffer.push(modrm(0b11, group_index, dst));
        buffer.push_u32(imm as u32);
    }

    fn emit_cmp(ctx: &mut EncodeContext<'_>, instr: &Instr) -> CodeGenResult<()> {
        let src1 = Self::resolve(ctx, instr.src1.as_ref().ok_or(missing("src1"))?)?;
        let src2 = Self::resolve(ctx, instr.src2.as_ref().ok_or(missing("src2"))?)?;
        let lhs = Self::value_to_reg(ctx, &src1);
        match src2 {
            Resolved::Imm(imm) => {
                let imm = i32::try_from(imm)
                    .map_err(|_| CodeGenError::UnsupportedOpcode("wide cmp immediate"))?;
                Self::emit_alu_imm(ctx, 7, lhs, imm);
            }
            other => {
                let rhs = Self::value_to_reg(ctx, &other);
                Self::emit_alu_rr(ctx, 0x39, lhs, rhs);
            }
        }
        Ok(())
    }

    fn emit_branch(ctx: &mut EncodeContext<'_>, instr: &Instr) -> CodeGenResult<()> {
        let target = instr
            .target
            .ok_or(CodeGenError::UnsupportedOpcode("branch without target"))?;

        if instr.opcode == OpCode::Br {
            ctx.buffer.push(0xE9);
            let patch_offset = ctx.buffer.offset();
            ctx.buffer.push_u32(0);
            ctx.branch_relocs.push(BranchReloc { patch_offset, target });
            return Ok(());
        }

        // Conditional: cmp then jcc.
        Self::emit_cmp(ctx, instr)?;
        let cc = cc_of(instr.opcode).ok_or(CodeGenError::UnsupportedOpcode("condition"))?;
        ctx.buffer.push(0x0F);
        ctx.buffer.push(0x80 | cc);
        let patch_offset = ctx.buffer.offset();
        ctx.buffer.push_u32(0);
        ctx.branch_relocs.push(BranchReloc { patch_offset, target });
        Ok(())
    }

    fn emit_multi_br(ctx: &mut EncodeContext<'_>, instr: &Instr) -> CodeGenResult<()> {
        if instr.multi_targets.is_empty() {
            return Err(CodeGenError::UnsupportedOpcode("unresolved jump table"));
        }
        let index = match Self::resolve(ctx, instr.src1.as_ref().ok_or(missing("src1"))?)? {
            Resolved::Reg(enc) => enc,
            other => Self::value_to_reg(ctx, &other),
        };

        // mov r11, imm64 (table address, patched at install)
        ctx.buffer.push(rex(true, 0, 0, SCRATCH));
        ctx.buffer.push(0xB8 | (SCRATCH & 7));
        let imm64_patch_offset = ctx.buffer.offset();
        ctx.buffer.push_u64(0);

        // jmp qword ptr [r11 + index*8]
        ctx.buffer.push(rex(false, 0, index, SCRATCH));
        ctx.buffer.push(0xFF);
        ctx.buffer.push(modrm(0b00, 4, 4)); // opcode /4, SIB follows
        ctx.buffer.push(((3u8) << 6) | ((index & 7) << 3) | (SCRATCH & 7));

        ctx.jump_tables.push(JumpTableFixup {
            imm64_patch_offset,
            table_offset: 0, // laid out after the body
            entry_labels: instr.multi_targets.to_vec(),
        });
        Ok(())
    }

    fn emit_bailout(ctx: &mut EncodeContext<'_>, instr: &Instr) {
        // mov r11, imm64 (helper address, patched at install); call r11.
        ctx.buffer.push(rex(true, 0, 0, SCRATCH));
        ctx.buffer.push(0xB8 | (SCRATCH & 7));
        let imm64_patch_offset = ctx.buffer.offset();
        ctx.buffer.push_u64(0);
        ctx.buffer.push(rex(false, 0, 0, SCRATCH));
        ctx.buffer.push(0xFF);
        ctx.buffer.push(modrm(0b11, 2, SCRATCH));

        ctx.bailout_sites.push(BailOutSite {
            imm64_patch_offset,
            byte_code_offset: instr.byte_code_offset,
            kind: instr.bail_out_kind.unwrap_or(crate::bailout::BailOutKind::Shared),
        });
    }

    fn emit_binop(ctx: &mut EncodeContext<'_>, instr: &Instr) -> CodeGenResult<()> {
        let (rr_opcode, imm_group) = match instr.opcode {
            OpCode::Add => (0x01, 0),
            OpCode::Or => (0x09, 1),
            OpCode::And => (0x21, 4),
            OpCode::Sub => (0x29, 5),
            OpCode::Xor => (0x31, 6),
            _ => return Err(CodeGenError::UnsupportedOpcode("binop")),
        };

        let dst_opnd = instr.dst.as_ref().ok_or(missing("dst"))?;
        let dst = Self::resolve(ctx, dst_opnd)?;
        let src1 = Self::resolve(ctx, instr.src1.as_ref().ok_or(missing("src1"))?)?;
        let src2 = Self::resolve(ctx, instr.src2.as_ref().ok_or(missing("src2"))?)?;

        // Two-address form: dst = src1 op src2 becomes mov dst, src1
        // then op dst, src2.
        let work = match &dst {
            Resolved::Reg(enc) => *enc,
            Resolved::Spill(_) => SCRATCH,
            Resolved::Imm(_) => return Err(CodeGenError::UnsupportedOpcode("constant dst")),
        };
        match src1 {
            Resolved::Reg(enc) if enc == work => {}
            other => {
                let src = Self::value_to_reg(ctx, &other);
                if src != work {
                    Self::emit_mov_rr(ctx, work, src);
                }
            }
        }
        match src2 {
            Resolved::Imm(imm) => {
                let imm = i32::try_from(imm)
                    .map_err(|_| CodeGenError::UnsupportedOpcode("wide immediate"))?;
                Self::emit_alu_imm(ctx, imm_group, work, imm);
            }
            other => {
                let src = Self::value_to_reg(ctx, &other);
                Self::emit_alu_rr(ctx, rr_opcode, work, src);
            }
        }
        if let Resolved::Spill(slot) = dst {
            Self::emit_spill_store(ctx, work, slot);
        }
        Ok(())
    }

    fn emit_ld(ctx: &mut EncodeContext<'_>, instr: &Instr) -> CodeGenResult<()> {
        let dst = Self::resolve(ctx, instr.dst.as_ref().ok_or(missing("dst"))?)?;
        let src = match instr.src1.as_ref() {
            Some(Opnd::FloatConst { value, .. }) => Resolved::Imm(value.to_bits() as i64),
            Some(src) => Self::resolve(ctx, src)?,
            None => return Err(missing("src1")),
        };

        match (dst, src) {
            (Resolved::Reg(d), Resolved::Reg(s)) => {
                if d != s {
                    Self::emit_mov_rr(ctx, d, s);
                }
            }
            (Resolved::Reg(d), Resolved::Imm(imm)) => Self::emit_mov_imm(ctx, d, imm),
            (Resolved::Reg(d), Resolved::Spill(slot)) => Self::emit_spill_load(ctx, d, slot),
            (Resolved::Spill(slot), src) => {
                let s = Self::value_to_reg(ctx, &src);
                Self::emit_spill_store(ctx, s, slot);
            }
            (Resolved::Imm(_), _) => {
                return Err(CodeGenError::UnsupportedOpcode("constant dst"));
            }
        }
        Ok(())
    }
}

#[inline]
fn missing(what: &'static str) -> CodeGenError {
    CodeGenError::UnsupportedOpcode(what)
}

impl EncoderMd for X64EncoderMd {
    fn encode_instr(&self, ctx: &mut EncodeContext<'_>, id: InstrId) -> CodeGenResult<()> {
        let instr = ctx.func.arena.instr(id).clone();
        match instr.opcode {
            OpCode::Label => Ok(()), // handled by the driver
            OpCode::Nop => {
                ctx.buffer.push(0x90);
                Ok(())
            }
            OpCode::Ret => {
                ctx.buffer.push(0xC3);
                Ok(())
            }
            OpCode::Ld => Self::emit_ld(ctx, &instr),
            OpCode::Add | OpCode::Sub | OpCode::And | OpCode::Or | OpCode::Xor => {
                Self::emit_binop(ctx, &instr)
            }
            OpCode::Mul => {
                let dst = match Self::resolve(ctx, instr.dst.as_ref().ok_or(missing("dst"))?)? {
                    Resolved::Reg(enc) => enc,
                    _ => return Err(CodeGenError::UnsupportedOpcode("mul dst")),
                };
                let src1 = Self::resolve(ctx, instr.src1.as_ref().ok_or(missing("src1"))?)?;
                let src2 = Self::resolve(ctx, instr.src2.as_ref().ok_or(missing("src2"))?)?;
                let s1 = Self::value_to_reg(ctx, &src1);
                if s1 != dst {
                    Self::emit_mov_rr(ctx, dst, s1);
                }
                let s2 = Self::value_to_reg(ctx, &src2);
                // imul r64, r/m64
                ctx.buffer.push(rex(true, dst, 0, s2));
                ctx.buffer.push(0x0F);
                ctx.buffer.push(0xAF);
                ctx.buffer.push(modrm(0b11, dst, s2));
                Ok(())
            }
            OpCode::Shl | OpCode::Shr | OpCode::Sar => {
                let group = match instr.opcode {
                    OpCode::Shl => 4,
                    OpCode::Shr => 5,
                    _ => 7,
                };
                let dst = match Self::resolve(ctx, instr.dst.as_ref().ok_or(missing("dst"))?)? {
                    Resolved::Reg(enc) => enc,
                    _ => return Err(CodeGenError::UnsupportedOpcode("shift dst")),
                };
                let amount = match Self::resolve(ctx, instr.src2.as_ref().ok_or(missing("src2"))?)?
                {
                    Resolved::Imm(imm) => (imm & 0x3f) as u8,
                    _ => return Err(CodeGenError::UnsupportedOpcode("variable shift")),
                };
                ctx.buffer.push(rex(true, 0, 0, dst));
                ctx.buffer.push(0xC1);
                ctx.buffer.push(modrm(0b11, group, dst));
                ctx.buffer.push(amount);
                Ok(())
            }
            OpCode::Cmp => Self::emit_cmp(ctx, &instr),
            OpCode::Br
            | OpCode::BrEq
            | OpCode::BrNeq
            | OpCode::BrLt
            | OpCode::BrLe
            | OpCode::BrGt
            | OpCode::BrGe => Self::emit_branch(ctx, &instr),
            OpCode::MultiBr => Self::emit_multi_br(ctx, &instr),
            OpCode::Call => {
                // Helper calls go through an absolute address in scratch.
                let target = Self::resolve(
                    ctx,
                    instr.src1.as_ref().ok_or(missing("call target"))?,
                )?;
                let reg = Self::value_to_reg(ctx, &target);
                ctx.buffer.push(rex(false, 0, 0, reg));
                ctx.buffer.push(0xFF);
                ctx.buffer.push(modrm(0b11, 2, reg));
                Ok(())
            }
            OpCode::BailOut | OpCode::BailOnNotInt | OpCode::BailOnNotString => {
                Self::emit_bailout(ctx, &instr);
                Ok(())
            }
            OpCode::BrStrEq => Err(CodeGenError::UnsupportedOpcode(
                "string compare must be lowered before encoding",
            )),
        }
    }
}
