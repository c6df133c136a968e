//! Control transfers: conditional and unconditional jumps, calls and returns in their near
//! and far forms, the loop family and the software-interrupt entries and exits.

use super::datamove::real_mode_code_segment;
use super::{flags, Exec};
use crate::arch::x86_64::{Rflags, SegmentRegister, Size, RCX};
use crate::fault::Fault;
use crate::interrupts;
use crate::segmentation::{load_segment, read_descriptor};
use crate::state::CpuMode;

impl Exec<'_> {
    /// Truncates a branch target to the width RIP keeps in the current mode.
    fn ip_truncate(&self, target: u64) -> u64 {
        if self.state.code_is_64() {
            target
        } else {
            self.op_size().truncate(target)
        }
    }

    fn take_branch(&mut self, target: u64) {
        self.next_rip = Some(self.ip_truncate(target));
    }

    /// Jcc: the condition comes from the low opcode nibble, the displacement width from the
    /// encoding (rel8 for 0x7x, operand-size for 0F 8x).
    pub(super) fn jcc(&mut self, cc: u8, hint: Size) -> Result<(), Fault> {
        let rel = match hint {
            Size::Byte => Size::Byte.sign_extend(u64::from(self.fetch.next8()?)),
            _ => {
                let size = if self.state.code_is_64() {
                    Size::Dword
                } else {
                    self.op_size()
                };
                size.sign_extend(self.fetch.imm(size.min(Size::Dword))?)
            }
        };

        if flags::condition(self.state, cc) {
            let target = self.fall_through().wrapping_add(rel);
            self.take_branch(target);
        }

        Ok(())
    }

    pub(super) fn jmp_rel(&mut self, hint: Size) -> Result<(), Fault> {
        let rel = match hint {
            Size::Byte => Size::Byte.sign_extend(u64::from(self.fetch.next8()?)),
            _ => {
                let size = if self.state.code_is_64() {
                    Size::Dword
                } else {
                    self.op_size()
                };
                size.sign_extend(self.fetch.imm(size.min(Size::Dword))?)
            }
        };

        let target = self.fall_through().wrapping_add(rel);
        self.take_branch(target);
        Ok(())
    }

    pub(super) fn call_rel(&mut self) -> Result<(), Fault> {
        let size = if self.state.code_is_64() {
            Size::Dword
        } else {
            self.op_size()
        };
        let rel = size.sign_extend(self.fetch.imm(size.min(Size::Dword))?);

        let return_rip = self.fall_through();
        let target = return_rip.wrapping_add(rel);

        self.push_value(self.stack_op_size(), return_rip)?;
        self.take_branch(target);
        Ok(())
    }

    // --- Far transfers ---

    /// Loads CS for a far transfer target. Real mode synthesizes the descriptor; protected
    /// and long mode read and validate it.
    fn load_far_cs(&mut self, selector: u16) -> Result<(), Fault> {
        if self.state.mode == CpuMode::Real {
            let cs = self.state.segment_mut(SegmentRegister::Cs);
            cs.selector = selector;
            cs.cache = Some(real_mode_code_segment(selector));
            return Ok(());
        }

        if selector & !0b11 == 0 {
            return Err(Fault::gp0());
        }

        let descriptor = read_descriptor(self.state, self.mem, selector)?;

        if !descriptor.non_system_segment || !descriptor.executable() {
            return Err(Fault::gp(u32::from(selector & !0b11)));
        }

        if !descriptor.present {
            return Err(Fault::np(selector));
        }

        let cpl = u16::from(self.state.cpl());
        let cs = self.state.segment_mut(SegmentRegister::Cs);
        // Conforming transfer keeps CPL in the RPL bits.
        cs.selector = selector & !0b11 | cpl;
        cs.cache = Some(descriptor);
        Ok(())
    }

    pub(super) fn jmp_far_imm(&mut self) -> Result<(), Fault> {
        if self.state.code_is_64() {
            return Err(Fault::ud());
        }

        let size = self.op_size();
        let offset = self.fetch.imm(size)?;
        let selector = self.fetch.next16()?;

        self.load_far_cs(selector)?;
        self.next_rip = Some(size.truncate(offset));
        Ok(())
    }

    pub(super) fn call_far_imm(&mut self) -> Result<(), Fault> {
        if self.state.code_is_64() {
            return Err(Fault::ud());
        }

        let size = self.op_size();
        let offset = self.fetch.imm(size)?;
        let selector = self.fetch.next16()?;

        let return_cs = u64::from(self.state.segment(SegmentRegister::Cs).selector);
        let return_rip = self.fall_through();

        self.push_value(size, return_cs)?;
        self.push_value(size, return_rip)?;

        self.load_far_cs(selector)?;
        self.next_rip = Some(size.truncate(offset));
        Ok(())
    }

    pub(super) fn ret_near(&mut self, pops_bytes: bool) -> Result<(), Fault> {
        let size = self.stack_op_size();
        let extra = if pops_bytes {
            u64::from(self.fetch.next16()?)
        } else {
            0
        };

        let target = self.pop_value(size)?;

        let sp_size = self.stack_ptr_size();
        let sp = self.state.read_gpr(crate::arch::x86_64::RSP, sp_size, false);
        self.state.write_gpr(
            crate::arch::x86_64::RSP,
            sp_size,
            false,
            sp.wrapping_add(extra),
        );

        self.next_rip = Some(size.truncate(target));
        Ok(())
    }

    pub(super) fn ret_far(&mut self, pops_bytes: bool) -> Result<(), Fault> {
        let size = self.op_size();
        let extra = if pops_bytes {
            u64::from(self.fetch.next16()?)
        } else {
            0
        };

        let offset = self.pop_value(size)?;
        let selector = self.pop_value(size)? as u16;

        let sp_size = self.stack_ptr_size();
        let sp = self.state.read_gpr(crate::arch::x86_64::RSP, sp_size, false);
        self.state.write_gpr(
            crate::arch::x86_64::RSP,
            sp_size,
            false,
            sp.wrapping_add(extra),
        );

        // A far return to a lower privilege also pops the outer stack pointer.
        let return_rpl = (selector & 0b11) as u8;
        let outgoing_cpl = self.state.cpl();

        self.load_far_cs(selector)?;

        if self.state.mode != CpuMode::Real && return_rpl > outgoing_cpl {
            let new_sp = self.pop_value(size)?;
            let new_ss = self.pop_value(size)? as u16;
            load_segment(self.state, self.mem, SegmentRegister::Ss, new_ss)?;
            self.state
                .write_gpr(crate::arch::x86_64::RSP, sp_size, false, new_sp);
        }

        self.next_rip = Some(size.truncate(offset));
        Ok(())
    }

    // --- Software interrupts ---

    pub(super) fn int_n(&mut self, vector: u8) -> Result<(), Fault> {
        let return_rip = self.fall_through();
        interrupts::deliver(
            self.state,
            self.mem,
            vector,
            interrupts::Cause::Software,
            None,
            return_rip,
        )?;
        self.next_rip = Some(self.state.rip);
        Ok(())
    }

    pub(super) fn int_on_overflow(&mut self) -> Result<(), Fault> {
        if self.state.code_is_64() {
            return Err(Fault::ud());
        }

        if self.state.flag(Rflags::OF) {
            return self.int_n(4);
        }

        Ok(())
    }

    /// IRET: the inverse of interrupt delivery, including the outer-stack restore on a
    /// privilege decrease and the full 5-slot frame in long mode.
    pub(super) fn iret(&mut self) -> Result<(), Fault> {
        let size = self.stack_op_size();

        let offset = self.pop_value(size)?;
        let selector = self.pop_value(size)? as u16;
        let flag_image = self.pop_value(size)?;

        let outgoing_cpl = self.state.cpl();
        let return_rpl = (selector & 0b11) as u8;

        let restores_stack = self.state.mode == CpuMode::Long
            || (self.state.mode == CpuMode::Protected && return_rpl > outgoing_cpl);

        let outer = if restores_stack {
            let sp = self.pop_value(size)?;
            let ss = self.pop_value(size)? as u16;
            Some((sp, ss))
        } else {
            None
        };

        self.load_far_cs(selector)?;

        let mut mask = size.mask() & !(Rflags::VM.bits() | Rflags::RF.bits());

        if outgoing_cpl > 0 {
            mask &= !Rflags::IOPL.bits();

            if outgoing_cpl > self.state.iopl() {
                mask &= !Rflags::IF.bits();
            }
        }

        self.state.merge_rflags(mask, flag_image);

        if let Some((sp, ss)) = outer {
            load_segment(self.state, self.mem, SegmentRegister::Ss, ss)?;
            let sp_size = self.stack_ptr_size();
            self.state
                .write_gpr(crate::arch::x86_64::RSP, sp_size, false, sp);
        }

        self.next_rip = Some(size.truncate(offset));
        Ok(())
    }

    // --- The loop family ---

    /// LOOP/LOOPE/LOOPNE decrement the address-size counter without touching flags.
    pub(super) fn loop_op(&mut self, opcode: u8) -> Result<(), Fault> {
        let rel = Size::Byte.sign_extend(u64::from(self.fetch.next8()?));
        let count_size = self.addr_size().size();

        let count = count_size.truncate(
            self.state
                .read_gpr(RCX, count_size, false)
                .wrapping_sub(1),
        );
        self.state.write_gpr(RCX, count_size, false, count);

        let zf = self.state.flag(Rflags::ZF);

        let taken = count != 0
            && match opcode {
                0xe0 => !zf,
                0xe1 => zf,
                _ => true,
            };

        if taken {
            let target = self.fall_through().wrapping_add(rel);
            self.take_branch(target);
        }

        Ok(())
    }

    /// JCXZ/JECXZ/JRCXZ tests the address-size view of the counter.
    pub(super) fn jcxz(&mut self) -> Result<(), Fault> {
        let rel = Size::Byte.sign_extend(u64::from(self.fetch.next8()?));
        let count_size = self.addr_size().size();

        if self.state.read_gpr(RCX, count_size, false) == 0 {
            let target = self.fall_through().wrapping_add(rel);
            self.take_branch(target);
        }

        Ok(())
    }

    /// Group 5 (0xFF): INC/DEC r/m and the indirect branch and push forms.
    pub(super) fn group5(&mut self) -> Result<(), Fault> {
        let size = self.op_size();
        let modrm = self.modrm()?;

        match modrm.reg & 0x7 {
            0 => {
                let value = self.read_rm(&modrm, size)?;
                let result = flags::inc(self.state, value, size);
                self.write_rm(&modrm, size, result)
            }
            1 => {
                let value = self.read_rm(&modrm, size)?;
                let result = flags::dec(self.state, value, size);
                self.write_rm(&modrm, size, result)
            }
            2 => self.branch_indirect_with(modrm, true),
            3 => self.branch_far_indirect_with(modrm, true),
            4 => self.branch_indirect_with(modrm, false),
            5 => self.branch_far_indirect_with(modrm, false),
            6 => {
                let stack_size = self.stack_op_size();
                let value = self.read_rm(&modrm, stack_size)?;
                self.push_value(stack_size, value)
            }
            _ => self.undefined(&[0xff]),
        }
    }

    fn branch_indirect_with(
        &mut self,
        modrm: crate::decode::ModRm,
        is_call: bool,
    ) -> Result<(), Fault> {
        let size = if self.state.mode == CpuMode::Long {
            Size::Qword
        } else {
            self.op_size()
        };

        let target = self.read_rm(&modrm, size)?;

        if is_call {
            let return_rip = self.fall_through();
            self.push_value(self.stack_op_size(), return_rip)?;
        }

        self.next_rip = Some(size.truncate(target));
        Ok(())
    }

    fn branch_far_indirect_with(
        &mut self,
        modrm: crate::decode::ModRm,
        is_call: bool,
    ) -> Result<(), Fault> {
        let size = self.op_size();

        let crate::decode::RmOp::Mem(mem_ref) = modrm.operand else {
            return Err(Fault::ud());
        };

        let offset = self.read_mem(&mem_ref, size)?;
        let selector_ref = crate::decode::MemRef {
            offset: mem_ref.offset.wrapping_add(size.bytes()),
            ..mem_ref
        };
        let selector = self.read_mem(&selector_ref, Size::Word)? as u16;

        if is_call {
            let return_cs = u64::from(self.state.segment(SegmentRegister::Cs).selector);
            let return_rip = self.fall_through();
            self.push_value(size, return_cs)?;
            self.push_value(size, return_rip)?;
        }

        self.load_far_cs(selector)?;
        self.next_rip = Some(size.truncate(offset));
        Ok(())
    }

    /// Group 4 (0xFE): byte INC/DEC.
    pub(super) fn group4(&mut self) -> Result<(), Fault> {
        let modrm = self.modrm()?;

        match modrm.reg & 0x7 {
            0 => {
                let value = self.read_rm(&modrm, Size::Byte)?;
                let result = flags::inc(self.state, value, Size::Byte);
                self.write_rm(&modrm, Size::Byte, result)
            }
            1 => {
                let value = self.read_rm(&modrm, Size::Byte)?;
                let result = flags::dec(self.state, value, Size::Byte);
                self.write_rm(&modrm, Size::Byte, result)
            }
            _ => self.undefined(&[0xfe]),
        }
    }
}
