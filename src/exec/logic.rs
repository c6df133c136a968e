//! Shifts, rotates, double-precision shifts, the bit-test family, bit scans and the
//! conditional-set/zero-extend conveniences.

use super::{flags, BitOp, Exec, ShiftCount};
use crate::arch::x86_64::{Rflags, Size, RCX};
use crate::decode::{MemRef, RmOp};
use crate::fault::Fault;

impl Exec<'_> {
    fn shift_count(&mut self, count: ShiftCount) -> Result<u64, Fault> {
        Ok(match count {
            ShiftCount::One => 1,
            ShiftCount::Cl => self.state.read_gpr(RCX, Size::Byte, false),
            ShiftCount::Imm8 => u64::from(self.fetch.next8()?),
        })
    }

    /// The C0/C1/D0-D3 shift group: ROL, ROR, RCL, RCR, SHL, SHR, SAL, SAR selected by the
    /// reg field.
    pub(super) fn shift_group(&mut self, size: Size, count: ShiftCount) -> Result<(), Fault> {
        let modrm = self.modrm()?;
        let count = self.shift_count(count)?;
        let value = self.read_rm(&modrm, size)?;

        let result = match modrm.reg & 0x7 {
            0 => flags::rol(self.state, value, count, size),
            1 => flags::ror(self.state, value, count, size),
            2 => flags::rcl(self.state, value, count, size),
            3 => flags::rcr(self.state, value, count, size),
            5 => flags::shr(self.state, value, count, size),
            7 => flags::sar(self.state, value, count, size),
            _ => flags::shl(self.state, value, count, size),
        };

        self.write_rm(&modrm, size, result)
    }

    /// SHLD/SHRD: double-precision shifts with the count masked to the operand's shift
    /// width before anything else.
    pub(super) fn shld_shrd(&mut self, left: bool, count: ShiftCount) -> Result<(), Fault> {
        let size = self.op_size();
        let modrm = self.modrm()?;
        let count = self.shift_count(count)?;

        let dest = self.read_rm(&modrm, size)?;
        let fill = self.read_reg_field(&modrm, size);

        let result = if left {
            flags::shld(self.state, dest, fill, count, size)
        } else {
            flags::shrd(self.state, dest, fill, count, size)
        };

        self.write_rm(&modrm, size, result)
    }

    /// The BT/BTS/BTR/BTC register form of the bit offset: for memory operands the offset
    /// addresses an unbounded bit string relative to the effective address.
    pub(super) fn bt_rm_reg(&mut self, op: BitOp) -> Result<(), Fault> {
        let size = self.op_size();
        let modrm = self.modrm()?;
        let offset = size.sign_extend(self.read_reg_field(&modrm, size)) as i64;

        match modrm.operand {
            RmOp::Reg(_) => {
                let bit = (offset as u64) % u64::from(size.bits());
                self.bit_op_value(op, &modrm, size, bit)
            }
            RmOp::Mem(mem_ref) => {
                let adjusted = MemRef {
                    offset: mem_ref.offset.wrapping_add(offset.div_euclid(8) as u64),
                    ..mem_ref
                };
                let bit = offset.rem_euclid(8) as u64;

                let byte = self.read_mem(&adjusted, Size::Byte)?;
                self.state.set_flag(Rflags::CF, byte >> bit & 1 != 0);

                if let Some(updated) = Self::bit_update(op, byte, bit) {
                    self.write_mem(&adjusted, Size::Byte, updated)?;
                }

                Ok(())
            }
        }
    }

    /// Group 8 (0F BA /4../7): the immediate-offset bit tests; the offset is masked to the
    /// operand width for both forms.
    pub(super) fn group8(&mut self) -> Result<(), Fault> {
        let size = self.op_size();
        let modrm = self.modrm()?;
        let bit = u64::from(self.fetch.next8()?) % u64::from(size.bits());

        let op = match modrm.reg & 0x7 {
            4 => BitOp::Test,
            5 => BitOp::Set,
            6 => BitOp::Reset,
            7 => BitOp::Complement,
            _ => return self.undefined(&[0x0f, 0xba]),
        };

        self.bit_op_value(op, &modrm, size, bit)
    }

    fn bit_op_value(
        &mut self,
        op: BitOp,
        modrm: &crate::decode::ModRm,
        size: Size,
        bit: u64,
    ) -> Result<(), Fault> {
        let value = self.read_rm(modrm, size)?;
        self.state.set_flag(Rflags::CF, value >> bit & 1 != 0);

        if let Some(updated) = Self::bit_update(op, value, bit) {
            self.write_rm(modrm, size, updated)?;
        }

        Ok(())
    }

    fn bit_update(op: BitOp, value: u64, bit: u64) -> Option<u64> {
        match op {
            BitOp::Test => None,
            BitOp::Set => Some(value | 1 << bit),
            BitOp::Reset => Some(value & !(1 << bit)),
            BitOp::Complement => Some(value ^ 1 << bit),
        }
    }

    /// BSF/BSR: ZF reports an all-zero source, which leaves the destination unchanged.
    pub(super) fn bit_scan(&mut self, reverse: bool) -> Result<(), Fault> {
        let size = self.op_size();
        let modrm = self.modrm()?;
        let value = self.read_rm(&modrm, size)?;

        if value == 0 {
            self.state.set_flag(Rflags::ZF, true);
            return Ok(());
        }

        let index = if reverse {
            63 - u64::from(value.leading_zeros())
        } else {
            u64::from(value.trailing_zeros())
        };

        self.state.set_flag(Rflags::ZF, false);
        self.write_reg_field(&modrm, size, index);
        Ok(())
    }

    /// SETcc writes a bare 0 or 1 byte.
    pub(super) fn setcc(&mut self, cc: u8) -> Result<(), Fault> {
        let modrm = self.modrm()?;
        let value = flags::condition(self.state, cc) as u64;
        self.write_rm(&modrm, Size::Byte, value)
    }

    /// MOVZX/MOVSX from an 8- or 16-bit source into the operand-size destination.
    pub(super) fn movx(&mut self, src_size: Size, signed: bool) -> Result<(), Fault> {
        let dst_size = self.op_size();
        let modrm = self.modrm()?;
        let value = self.read_rm(&modrm, src_size)?;

        let value = if signed {
            src_size.sign_extend(value)
        } else {
            value
        };

        self.write_reg_field(&modrm, dst_size, value);
        Ok(())
    }

    /// BSWAP of a register named by the low opcode bits (plus REX.B).
    pub(super) fn bswap(&mut self, low_bits: u8) -> Result<(), Fault> {
        let size = self.op_size();
        let index = low_bits
            | (self.prefixes.rex.map(|rex| rex.b as u8).unwrap_or(0)) << 3;

        let value = self.state.read_gpr(index, size, false);

        let swapped = match size {
            Size::Qword => value.swap_bytes(),
            Size::Dword => u64::from((value as u32).swap_bytes()),
            // 16-bit BSWAP is the undefined form; the fixture behaviour is zero.
            _ => 0,
        };

        self.state.write_gpr(index, size, false, swapped);
        Ok(())
    }
}
