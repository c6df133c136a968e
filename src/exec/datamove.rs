//! Data movement: MOV in all its forms, LEA, XCHG, the stack instructions, far-pointer
//! loads, conditional moves and the flag-image transfers.

use super::{flags, Exec};
use crate::arch::x86_64::{Rflags, Segment, SegmentRegister, Size, RAX, RBP, RBX, RSP};
use crate::decode::{AddrSize, MemRef, RmOp};
use crate::fault::Fault;
use crate::segmentation::load_segment;
use crate::state::CpuMode;

impl Exec<'_> {
    pub(super) fn mov_rm_reg(&mut self, size: Size) -> Result<(), Fault> {
        let modrm = self.modrm()?;
        let value = self.read_reg_field(&modrm, size);
        self.write_rm(&modrm, size, value)
    }

    pub(super) fn mov_reg_rm(&mut self, size: Size) -> Result<(), Fault> {
        let modrm = self.modrm()?;
        let value = self.read_rm(&modrm, size)?;
        self.write_reg_field(&modrm, size, value);
        Ok(())
    }

    pub(super) fn mov_rm_imm(&mut self, size: Size) -> Result<(), Fault> {
        let modrm = self.modrm()?;
        let imm = self.fetch.imm_op(size)?;
        self.write_rm(&modrm, size, imm)
    }

    pub(super) fn mov_reg8_imm(&mut self, low_bits: u8) -> Result<(), Fault> {
        let index = low_bits | self.rex_b_bit();
        let imm = u64::from(self.fetch.next8()?);
        self.write_gpr_sized(index, Size::Byte, imm);
        Ok(())
    }

    /// B8+r: the one form whose immediate is a full 64 bits under REX.W.
    pub(super) fn mov_reg_imm(&mut self, low_bits: u8) -> Result<(), Fault> {
        let size = self.op_size();
        let index = low_bits | self.rex_b_bit();
        let imm = self.fetch.imm(size)?;
        self.state.write_gpr(index, size, false, imm);
        Ok(())
    }

    fn rex_b_bit(&self) -> u8 {
        (self.prefixes.rex.map(|rex| rex.b as u8).unwrap_or(0)) << 3
    }

    pub(super) fn lea(&mut self) -> Result<(), Fault> {
        let size = self.op_size();
        let modrm = self.modrm()?;

        let RmOp::Mem(mem_ref) = modrm.operand else {
            return Err(Fault::ud());
        };

        let offset = mem_ref.effective(self.fall_through());
        self.write_reg_field(&modrm, size, size.truncate(offset));
        Ok(())
    }

    pub(super) fn xchg_rm_reg(&mut self, size: Size) -> Result<(), Fault> {
        let modrm = self.modrm()?;
        let a = self.read_rm(&modrm, size)?;
        let b = self.read_reg_field(&modrm, size);

        self.write_rm(&modrm, size, b)?;
        self.write_reg_field(&modrm, size, a);
        Ok(())
    }

    pub(super) fn xchg_acc_reg(&mut self, low_bits: u8) -> Result<(), Fault> {
        let size = self.op_size();
        let index = low_bits | self.rex_b_bit();

        let acc = self.state.read_gpr(RAX, size, false);
        let other = self.state.read_gpr(index, size, false);

        self.state.write_gpr(RAX, size, false, other);
        self.state.write_gpr(index, size, false, acc);
        Ok(())
    }

    /// 0x90 is plain NOP (or PAUSE under F3) unless REX.B turns it into XCHG RAX, R8.
    pub(super) fn nop_or_pause(&mut self) -> Result<(), Fault> {
        if self.prefixes.rex.map(|rex| rex.b).unwrap_or(false) {
            return self.xchg_acc_reg(0);
        }

        Ok(())
    }

    /// A0..A3: accumulator moves with a direct memory offset of address-size width.
    pub(super) fn mov_moffs(&mut self, opcode: u8) -> Result<(), Fault> {
        let size = if opcode & 1 == 0 {
            Size::Byte
        } else {
            self.op_size()
        };

        let offset = match self.addr_size() {
            AddrSize::A16 => u64::from(self.fetch.next16()?),
            AddrSize::A32 => u64::from(self.fetch.next32()?),
            AddrSize::A64 => self.fetch.next64()?,
        };

        let mem_ref = MemRef {
            seg: self.prefixes.segment.unwrap_or(SegmentRegister::Ds),
            offset,
            rip_relative: false,
            mask: self.addr_size().mask(),
        };

        if opcode & 2 == 0 {
            let value = self.read_mem(&mem_ref, size)?;
            self.state.write_gpr(RAX, size, false, value);
        } else {
            let value = self.state.read_gpr(RAX, size, false);
            self.write_mem(&mem_ref, size, value)?;
        }

        Ok(())
    }

    /// XLAT: AL = [seg:rBX + AL].
    pub(super) fn xlat(&mut self) -> Result<(), Fault> {
        let al = self.state.read_gpr(RAX, Size::Byte, false);
        let base = self.state.gpr64(RBX) & self.addr_size().mask();

        let mem_ref = MemRef {
            seg: self.prefixes.segment.unwrap_or(SegmentRegister::Ds),
            offset: base.wrapping_add(al),
            rip_relative: false,
            mask: self.addr_size().mask(),
        };

        let value = self.read_mem(&mem_ref, Size::Byte)?;
        self.state.write_gpr(RAX, Size::Byte, false, value);
        Ok(())
    }

    // --- Segment register moves ---

    /// 8C: store a segment selector; zero-extended when the destination is a register.
    pub(super) fn mov_rm_sreg(&mut self) -> Result<(), Fault> {
        let modrm = self.modrm()?;

        let Some(register) = SegmentRegister::from_index(modrm.reg & 0x7) else {
            return Err(Fault::ud());
        };

        let selector = u64::from(self.state.segment(register).selector);

        match modrm.operand {
            RmOp::Reg(_) => self.write_rm(&modrm, self.op_size(), selector),
            RmOp::Mem(_) => self.write_rm(&modrm, Size::Word, selector),
        }
    }

    /// 8E: load a segment register. Loading CS this way is undefined; loading SS arms the
    /// one-instruction interrupt block.
    pub(super) fn mov_sreg_rm(&mut self) -> Result<(), Fault> {
        let modrm = self.modrm()?;

        let Some(register) = SegmentRegister::from_index(modrm.reg & 0x7) else {
            return Err(Fault::ud());
        };

        if register == SegmentRegister::Cs {
            return Err(Fault::ud());
        }

        let selector = self.read_rm(&modrm, Size::Word)? as u16;
        load_segment(self.state, self.mem, register, selector)?;

        if register == SegmentRegister::Ss {
            self.state.inhibit_interrupts_for_one_instruction();
        }

        Ok(())
    }

    /// LES/LDS (legacy encodings; VEX territory in 64-bit code).
    pub(super) fn load_far_pointer_legacy(
        &mut self,
        register: SegmentRegister,
    ) -> Result<(), Fault> {
        if self.state.code_is_64() {
            return Err(Fault::ud());
        }

        self.load_far_pointer(register)
    }

    /// LSS/LFS/LGS (and the legacy LES/LDS): load offset then selector from a far pointer
    /// in memory, then block interrupt delivery for exactly the next instruction.
    pub(super) fn load_far_pointer(&mut self, register: SegmentRegister) -> Result<(), Fault> {
        let size = self.op_size();
        let modrm = self.modrm()?;

        let RmOp::Mem(mem_ref) = modrm.operand else {
            return Err(Fault::ud());
        };

        let offset = self.read_mem(&mem_ref, size)?;

        let selector_ref = MemRef {
            offset: mem_ref.offset.wrapping_add(size.bytes()),
            ..mem_ref
        };
        let selector = self.read_mem(&selector_ref, Size::Word)? as u16;

        load_segment(self.state, self.mem, register, selector)?;
        self.write_reg_field(&modrm, size, offset);
        self.state.inhibit_interrupts_for_one_instruction();
        Ok(())
    }

    /// CMOVcc. The effective address is always computed; when the condition is false no
    /// load happens and no fault can come from the skipped access. A false 32-bit CMOV
    /// still zero-extends the destination.
    pub(super) fn cmov(&mut self, cc: u8) -> Result<(), Fault> {
        let size = self.op_size();
        let modrm = self.modrm()?;

        if flags::condition(self.state, cc) {
            let value = self.read_rm(&modrm, size)?;
            self.write_reg_field(&modrm, size, value);
        } else if size == Size::Dword && self.state.code_is_64() {
            let current = self.read_reg_field(&modrm, size);
            self.write_reg_field(&modrm, size, current);
        }

        Ok(())
    }

    /// 0x63: MOVSXD in 64-bit code; the legacy ARPL elsewhere.
    pub(super) fn movsxd_or_arpl(&mut self) -> Result<(), Fault> {
        if self.state.code_is_64() {
            let size = self.op_size();
            let modrm = self.modrm()?;
            let value = self.read_rm(&modrm, Size::Dword)?;
            self.write_reg_field(&modrm, size, Size::Dword.sign_extend(value));
            return Ok(());
        }

        // ARPL: raise the RPL of the destination selector to at least the source's.
        let modrm = self.modrm()?;
        let dest = self.read_rm(&modrm, Size::Word)?;
        let src = self.read_reg_field(&modrm, Size::Word);

        if dest & 0b11 < src & 0b11 {
            self.write_rm(&modrm, Size::Word, dest & !0b11 | src & 0b11)?;
            self.state.set_flag(Rflags::ZF, true);
        } else {
            self.state.set_flag(Rflags::ZF, false);
        }

        Ok(())
    }

    // --- Stack instructions ---

    pub(super) fn push_reg(&mut self, low_bits: u8) -> Result<(), Fault> {
        let size = self.stack_op_size();
        let index = low_bits | self.rex_b_bit();
        let value = self.state.read_gpr(index, size, false);
        self.push_value(size, value)
    }

    pub(super) fn pop_reg(&mut self, low_bits: u8) -> Result<(), Fault> {
        let size = self.stack_op_size();
        let index = low_bits | self.rex_b_bit();
        let value = self.pop_value(size)?;
        self.state.write_gpr(index, size, false, value);
        Ok(())
    }

    pub(super) fn push_imm(&mut self, imm8: bool) -> Result<(), Fault> {
        let size = self.stack_op_size();

        let value = if imm8 {
            size.truncate(Size::Byte.sign_extend(u64::from(self.fetch.next8()?)))
        } else {
            self.fetch.imm_op(size)?
        };

        self.push_value(size, value)
    }

    pub(super) fn pop_rm(&mut self) -> Result<(), Fault> {
        let size = self.stack_op_size();
        let value = self.pop_value(size)?;
        let modrm = self.modrm()?;
        self.write_rm(&modrm, size, value)
    }

    pub(super) fn push_sreg(&mut self, register: SegmentRegister) -> Result<(), Fault> {
        let legacy = matches!(
            register,
            SegmentRegister::Es | SegmentRegister::Cs | SegmentRegister::Ss | SegmentRegister::Ds
        );

        if legacy && self.state.code_is_64() {
            return Err(Fault::ud());
        }

        let size = self.stack_op_size();
        let selector = u64::from(self.state.segment(register).selector);
        self.push_value(size, selector)
    }

    pub(super) fn pop_sreg(&mut self, register: SegmentRegister) -> Result<(), Fault> {
        let legacy = matches!(
            register,
            SegmentRegister::Es | SegmentRegister::Ss | SegmentRegister::Ds
        );

        if legacy && self.state.code_is_64() {
            return Err(Fault::ud());
        }

        let size = self.stack_op_size();
        let selector = self.pop_value(size)? as u16;
        load_segment(self.state, self.mem, register, selector)?;

        if register == SegmentRegister::Ss {
            self.state.inhibit_interrupts_for_one_instruction();
        }

        Ok(())
    }

    /// PUSHA: the eight word/dword registers, with the pre-push SP image in the middle.
    pub(super) fn pusha(&mut self) -> Result<(), Fault> {
        if self.state.code_is_64() {
            return Err(Fault::ud());
        }

        let size = self.op_size();
        let original_sp = self.state.read_gpr(RSP, size, false);

        for index in 0..8u8 {
            let value = if index == RSP {
                original_sp
            } else {
                self.state.read_gpr(index, size, false)
            };

            self.push_value(size, value)?;
        }

        Ok(())
    }

    /// POPA: the reverse order, discarding the stored SP slot.
    pub(super) fn popa(&mut self) -> Result<(), Fault> {
        if self.state.code_is_64() {
            return Err(Fault::ud());
        }

        let size = self.op_size();

        for index in (0..8u8).rev() {
            let value = self.pop_value(size)?;

            if index != RSP {
                self.state.write_gpr(index, size, false, value);
            }
        }

        Ok(())
    }

    pub(super) fn enter(&mut self) -> Result<(), Fault> {
        let size = self.stack_op_size();
        let frame_size = u64::from(self.fetch.next16()?);
        let nesting = u64::from(self.fetch.next8()?) & 0x1f;

        let bp = self.state.read_gpr(RBP, size, false);
        self.push_value(size, bp)?;
        let frame_ptr = self.state.read_gpr(RSP, size, false);

        // Nesting levels copy the enclosing frame's display entries down.
        for level in 1..nesting {
            let slot = MemRef {
                seg: SegmentRegister::Ss,
                offset: bp.wrapping_sub(level * size.bytes()),
                rip_relative: false,
                mask: self.stack_ptr_size().mask(),
            };
            let display = self.read_mem(&slot, size)?;
            self.push_value(size, display)?;
        }

        if nesting > 0 {
            self.push_value(size, frame_ptr)?;
        }

        self.state.write_gpr(RBP, size, false, frame_ptr);
        let sp_size = self.stack_ptr_size();
        let sp = self.state.read_gpr(RSP, sp_size, false);
        self.state
            .write_gpr(RSP, sp_size, false, sp.wrapping_sub(frame_size));
        Ok(())
    }

    pub(super) fn leave(&mut self) -> Result<(), Fault> {
        let size = self.stack_op_size();
        let sp_size = self.stack_ptr_size();

        let bp = self.state.read_gpr(RBP, sp_size, false);
        self.state.write_gpr(RSP, sp_size, false, bp);

        let value = self.pop_value(size)?;
        self.state.write_gpr(RBP, size, false, value);
        Ok(())
    }

    // --- Flag-image transfers ---

    pub(super) fn pushf(&mut self) -> Result<(), Fault> {
        let size = self.stack_op_size();
        let image = self.state.rflags() & !(Rflags::RF.bits() | Rflags::VM.bits());
        self.push_value(size, size.truncate(image))
    }

    pub(super) fn popf(&mut self) -> Result<(), Fault> {
        let size = self.stack_op_size();
        let value = self.pop_value(size)?;

        let mut mask = size.mask() & !(Rflags::RF.bits() | Rflags::VM.bits());

        // IF and IOPL are privileged: IOPL moves only at CPL 0, IF only at CPL <= IOPL.
        if self.state.cpl() > 0 {
            mask &= !Rflags::IOPL.bits();
        }

        if self.state.cpl() > self.state.iopl() && self.state.mode != CpuMode::Real {
            mask &= !Rflags::IF.bits();
        }

        self.state.merge_rflags(mask, value);
        Ok(())
    }

    pub(super) fn sahf(&mut self) -> Result<(), Fault> {
        let ah = self.state.read_gpr(RAX, Size::Byte, true);
        let mask = (Rflags::CF | Rflags::PF | Rflags::AF | Rflags::ZF | Rflags::SF).bits();
        self.state.merge_rflags(mask, ah);
        Ok(())
    }

    pub(super) fn lahf(&mut self) -> Result<(), Fault> {
        let image = self.state.rflags() & 0xff | Rflags::RESERVED1.bits();
        self.state.write_gpr(RAX, Size::Byte, true, image);
        Ok(())
    }
}

/// Builds the descriptor-cache record a far control transfer installs for CS without a
/// table lookup, used by real-mode far branches.
pub(super) fn real_mode_code_segment(selector: u16) -> Segment {
    let mut segment = Segment::real_mode(selector);
    segment.segment_type = 0xa;
    segment
}
