//! The arithmetic opcode families: the classic ALU block, the unary group, multiply and
//! divide, the exchange-and-op forms and the BCD adjustments.

use super::{flags, Exec};
use crate::arch::x86_64::{Rflags, Size, RAX, RCX, RDX};
use crate::fault::Fault;

impl Exec<'_> {
    /// Applies one of the eight classic ALU operations. `CMP` computes flags only and
    /// returns `None` so callers skip the write-back.
    fn alu_apply(&mut self, op: u8, a: u64, b: u64, size: Size) -> Option<u64> {
        match op {
            0 => Some(flags::add(self.state, a, b, size)),
            1 => Some(flags::logic(self.state, a | b, size)),
            2 => Some(flags::adc(self.state, a, b, size)),
            3 => Some(flags::sbb(self.state, a, b, size)),
            4 => Some(flags::logic(self.state, a & b, size)),
            5 => Some(flags::sub(self.state, a, b, size)),
            6 => Some(flags::logic(self.state, a ^ b, size)),
            _ => {
                flags::sub(self.state, a, b, size);
                None
            }
        }
    }

    /// The 0x00..0x3D ALU block: the operation comes from bits 3..6 of the opcode, the
    /// operand form from the low three bits.
    pub(super) fn alu_binop(&mut self, opcode: u8) -> Result<(), Fault> {
        let op = (opcode >> 3) & 0x7;

        match opcode & 0x7 {
            0 | 1 => {
                let size = if opcode & 1 == 0 {
                    Size::Byte
                } else {
                    self.op_size()
                };
                let modrm = self.modrm()?;
                let a = self.read_rm(&modrm, size)?;
                let b = self.read_reg_field(&modrm, size);

                if let Some(result) = self.alu_apply(op, a, b, size) {
                    self.write_rm(&modrm, size, result)?;
                }
            }
            2 | 3 => {
                let size = if opcode & 1 == 0 {
                    Size::Byte
                } else {
                    self.op_size()
                };
                let modrm = self.modrm()?;
                let a = self.read_reg_field(&modrm, size);
                let b = self.read_rm(&modrm, size)?;

                if let Some(result) = self.alu_apply(op, a, b, size) {
                    self.write_reg_field(&modrm, size, result);
                }
            }
            4 => {
                let imm = u64::from(self.fetch.next8()?);
                let a = self.read_gpr_sized(RAX, Size::Byte);

                if let Some(result) = self.alu_apply(op, a, imm, Size::Byte) {
                    self.write_gpr_sized(RAX, Size::Byte, result);
                }
            }
            _ => {
                let size = self.op_size();
                let imm = self.fetch.imm_op(size)?;
                let a = self.state.read_gpr(RAX, size, false);

                if let Some(result) = self.alu_apply(op, a, imm, size) {
                    self.state.write_gpr(RAX, size, false, result);
                }
            }
        }

        Ok(())
    }

    /// Group 1 (0x80/0x81/0x83): ALU with an immediate operand; 0x83 sign-extends an
    /// 8-bit immediate to the operand size.
    pub(super) fn group1(&mut self, size: Size, sign_extend_imm8: bool) -> Result<(), Fault> {
        let modrm = self.modrm()?;

        let imm = if sign_extend_imm8 {
            Size::Byte.sign_extend(u64::from(self.fetch.next8()?))
        } else {
            self.fetch.imm_op(size)?
        };

        let a = self.read_rm(&modrm, size)?;

        if let Some(result) = self.alu_apply(modrm.reg & 0x7, a, imm, size) {
            self.write_rm(&modrm, size, result)?;
        }

        Ok(())
    }

    pub(super) fn inc_reg(&mut self, index: u8) -> Result<(), Fault> {
        let size = self.op_size();
        let value = self.state.read_gpr(index, size, false);
        let result = flags::inc(self.state, value, size);
        self.state.write_gpr(index, size, false, result);
        Ok(())
    }

    pub(super) fn dec_reg(&mut self, index: u8) -> Result<(), Fault> {
        let size = self.op_size();
        let value = self.state.read_gpr(index, size, false);
        let result = flags::dec(self.state, value, size);
        self.state.write_gpr(index, size, false, result);
        Ok(())
    }

    pub(super) fn test_rm_reg(&mut self, size: Size) -> Result<(), Fault> {
        let modrm = self.modrm()?;
        let a = self.read_rm(&modrm, size)?;
        let b = self.read_reg_field(&modrm, size);
        flags::logic(self.state, a & b, size);
        Ok(())
    }

    pub(super) fn test_acc_imm(&mut self, size: Size) -> Result<(), Fault> {
        let imm = self.fetch.imm_op(size)?;
        let a = self.state.read_gpr(RAX, size, false);
        flags::logic(self.state, a & imm, size);
        Ok(())
    }

    /// IMUL r, r/m (0F AF): two-operand signed multiply.
    pub(super) fn imul_reg_rm(&mut self) -> Result<(), Fault> {
        let size = self.op_size();
        let modrm = self.modrm()?;
        let a = self.read_reg_field(&modrm, size);
        let b = self.read_rm(&modrm, size)?;
        let result = flags::imul2(self.state, a, b, size);
        self.write_reg_field(&modrm, size, result);
        Ok(())
    }

    /// IMUL r, r/m, imm (0x69/0x6B).
    pub(super) fn imul3(&mut self, imm8: bool) -> Result<(), Fault> {
        let size = self.op_size();
        let modrm = self.modrm()?;

        let imm = if imm8 {
            Size::Byte.sign_extend(u64::from(self.fetch.next8()?))
        } else {
            self.fetch.imm_op(size)?
        };

        let b = self.read_rm(&modrm, size)?;
        let result = flags::imul2(self.state, b, imm, size);
        self.write_reg_field(&modrm, size, result);
        Ok(())
    }

    /// Group 3 (0xF6/0xF7): TEST, NOT, NEG and the widening multiply/divide family.
    pub(super) fn group3(&mut self, size: Size) -> Result<(), Fault> {
        let modrm = self.modrm()?;

        match modrm.reg & 0x7 {
            0 | 1 => {
                let imm = self.fetch.imm_op(size)?;
                let a = self.read_rm(&modrm, size)?;
                flags::logic(self.state, a & imm, size);
            }
            2 => {
                let a = self.read_rm(&modrm, size)?;
                self.write_rm(&modrm, size, !a)?;
            }
            3 => {
                let a = self.read_rm(&modrm, size)?;
                let result = flags::neg(self.state, a, size);
                self.write_rm(&modrm, size, result)?;
            }
            4 => self.mul_wide(&modrm, size, false)?,
            5 => self.mul_wide(&modrm, size, true)?,
            6 => self.div_wide(&modrm, size, false)?,
            _ => self.div_wide(&modrm, size, true)?,
        }

        Ok(())
    }

    /// Widening MUL/IMUL: the product lands in xDX:xAX (AH:AL for bytes).
    fn mul_wide(
        &mut self,
        modrm: &crate::decode::ModRm,
        size: Size,
        signed: bool,
    ) -> Result<(), Fault> {
        let a = self.state.read_gpr(RAX, size, false);
        let b = self.read_rm(modrm, size)?;

        let (low, high, overflow) = if signed {
            let full =
                (size.sign_extend(a) as i64 as i128) * (size.sign_extend(b) as i64 as i128);
            let low = size.truncate(full as u64);
            let overflow = size.sign_extend(low) as i64 as i128 != full;
            (low, size.truncate((full >> size.bits()) as u64), overflow)
        } else {
            let full = u128::from(a) * u128::from(b);
            let low = size.truncate(full as u64);
            let high = size.truncate((full >> size.bits()) as u64);
            (low, high, high != 0)
        };

        if size == Size::Byte {
            self.state.write_gpr(RAX, Size::Word, false, low | high << 8);
        } else {
            self.state.write_gpr(RAX, size, false, low);
            self.state.write_gpr(RDX, size, false, high);
        }

        self.state.set_flag(Rflags::CF, overflow);
        self.state.set_flag(Rflags::OF, overflow);
        self.state.update_zsp(low, size);
        Ok(())
    }

    /// Widening DIV/IDIV over xDX:xAX. Divide-by-zero and quotient overflow raise #DE.
    fn div_wide(
        &mut self,
        modrm: &crate::decode::ModRm,
        size: Size,
        signed: bool,
    ) -> Result<(), Fault> {
        let divisor = self.read_rm(modrm, size)?;

        if divisor == 0 {
            return Err(Fault::de());
        }

        let (low, high) = if size == Size::Byte {
            let ax = self.state.read_gpr(RAX, Size::Word, false);
            (ax & 0xff, ax >> 8)
        } else {
            (
                self.state.read_gpr(RAX, size, false),
                self.state.read_gpr(RDX, size, false),
            )
        };

        let (quotient, remainder) = if signed {
            let dividend = ((size.truncate(high) as i128) << size.bits())
                | i128::from(size.truncate(low));
            // Reinterpret the double-width value as signed.
            let shift = 128 - 2 * size.bits();
            let dividend = (dividend << shift) >> shift;
            let divisor = size.sign_extend(divisor) as i64 as i128;

            let quotient = dividend.wrapping_div(divisor);
            let remainder = dividend.wrapping_rem(divisor);

            let min = -(1i128 << (size.bits() - 1));
            let max = (1i128 << (size.bits() - 1)) - 1;

            if quotient < min || quotient > max {
                return Err(Fault::de());
            }

            (size.truncate(quotient as u64), size.truncate(remainder as u64))
        } else {
            let dividend = (u128::from(high) << size.bits()) | u128::from(low);
            let divisor = u128::from(divisor);

            let quotient = dividend / divisor;
            let remainder = dividend % divisor;

            if quotient > u128::from(size.mask()) {
                return Err(Fault::de());
            }

            (quotient as u64, remainder as u64)
        };

        if size == Size::Byte {
            self.state
                .write_gpr(RAX, Size::Word, false, quotient | remainder << 8);
        } else {
            self.state.write_gpr(RAX, size, false, quotient);
            self.state.write_gpr(RDX, size, false, remainder);
        }

        Ok(())
    }

    /// CMPXCHG: compare the accumulator with the destination; on equality store the source
    /// and set ZF, otherwise load the destination into the accumulator. The flags are those
    /// of the accumulator-destination subtraction either way.
    pub(super) fn cmpxchg(&mut self, size: Size) -> Result<(), Fault> {
        let modrm = self.modrm()?;
        let dest = self.read_rm(&modrm, size)?;
        let acc = self.state.read_gpr(RAX, size, false);

        flags::sub(self.state, acc, dest, size);

        if acc == dest {
            let src = self.read_reg_field(&modrm, size);
            self.write_rm(&modrm, size, src)?;
        } else {
            self.state.write_gpr(RAX, size, false, dest);
        }

        Ok(())
    }

    /// XADD: write the sum to the destination and the original destination to the source
    /// register, with full addition flags.
    pub(super) fn xadd(&mut self, size: Size) -> Result<(), Fault> {
        let modrm = self.modrm()?;
        let dest = self.read_rm(&modrm, size)?;
        let src = self.read_reg_field(&modrm, size);

        let sum = flags::add(self.state, dest, src, size);
        self.write_rm(&modrm, size, sum)?;
        self.write_reg_field(&modrm, size, dest);
        Ok(())
    }

    /// Group 9 (0F C7): CMPXCHG8B is the only member this machine implements.
    pub(super) fn group9(&mut self) -> Result<(), Fault> {
        let modrm = self.modrm()?;

        if modrm.reg & 0x7 != 1 || !modrm.is_memory() {
            return self.undefined(&[0x0f, 0xc7]);
        }

        let crate::decode::RmOp::Mem(mem_ref) = modrm.operand else {
            unreachable!("checked above");
        };

        let current = self.read_mem(&mem_ref, Size::Qword)?;
        let expected = self.state.read_gpr(RAX, Size::Dword, false)
            | self.state.read_gpr(RDX, Size::Dword, false) << 32;

        if current == expected {
            let new = self.state.read_gpr(crate::arch::x86_64::RBX, Size::Dword, false)
                | self.state.read_gpr(RCX, Size::Dword, false) << 32;
            self.write_mem(&mem_ref, Size::Qword, new)?;
            self.state.set_flag(Rflags::ZF, true);
        } else {
            self.state
                .write_gpr(RAX, Size::Dword, false, current & 0xffff_ffff);
            self.state.write_gpr(RDX, Size::Dword, false, current >> 32);
            self.state.set_flag(Rflags::ZF, false);
        }

        Ok(())
    }

    // --- Sign extensions of the accumulator ---

    /// CBW/CWDE/CDQE.
    pub(super) fn cbw(&mut self) -> Result<(), Fault> {
        let size = self.op_size();
        let half = match size {
            Size::Word => Size::Byte,
            Size::Dword => Size::Word,
            _ => Size::Dword,
        };

        let value = half.sign_extend(self.state.read_gpr(RAX, half, false));
        self.state.write_gpr(RAX, size, false, value);
        Ok(())
    }

    /// CWD/CDQ/CQO.
    pub(super) fn cwd(&mut self) -> Result<(), Fault> {
        let size = self.op_size();
        let acc = self.state.read_gpr(RAX, size, false);
        let high = if acc & size.sign_bit() != 0 {
            size.mask()
        } else {
            0
        };

        self.state.write_gpr(RDX, size, false, high);
        Ok(())
    }

    // --- BCD adjustments (legacy modes only) ---

    pub(super) fn daa(&mut self) -> Result<(), Fault> {
        self.bcd_guard()?;

        let mut al = self.state.read_gpr(RAX, Size::Byte, false);
        let old_al = al;
        let old_cf = self.state.flag(Rflags::CF);
        let mut cf = false;

        if al & 0xf > 9 || self.state.flag(Rflags::AF) {
            al = (al + 6) & 0xff;
            cf = old_cf || old_al > 0xf9;
            self.state.set_flag(Rflags::AF, true);
        } else {
            self.state.set_flag(Rflags::AF, false);
        }

        if old_al > 0x99 || old_cf {
            al = (al + 0x60) & 0xff;
            cf = true;
        }

        self.state.write_gpr(RAX, Size::Byte, false, al);
        self.state.set_flag(Rflags::CF, cf);
        self.state.update_zsp(al, Size::Byte);
        Ok(())
    }

    pub(super) fn das(&mut self) -> Result<(), Fault> {
        self.bcd_guard()?;

        let mut al = self.state.read_gpr(RAX, Size::Byte, false);
        let old_al = al;
        let old_cf = self.state.flag(Rflags::CF);
        let mut cf = false;

        if al & 0xf > 9 || self.state.flag(Rflags::AF) {
            al = al.wrapping_sub(6) & 0xff;
            cf = old_cf || old_al < 6;
            self.state.set_flag(Rflags::AF, true);
        } else {
            self.state.set_flag(Rflags::AF, false);
        }

        if old_al > 0x99 || old_cf {
            al = al.wrapping_sub(0x60) & 0xff;
            cf = true;
        }

        self.state.write_gpr(RAX, Size::Byte, false, al);
        self.state.set_flag(Rflags::CF, cf);
        self.state.update_zsp(al, Size::Byte);
        Ok(())
    }

    pub(super) fn aaa(&mut self) -> Result<(), Fault> {
        self.bcd_guard()?;

        let ax = self.state.read_gpr(RAX, Size::Word, false);
        let adjust = ax & 0xf > 9 || self.state.flag(Rflags::AF);

        let ax = if adjust {
            (ax.wrapping_add(0x106)) & 0xff0f
        } else {
            ax & 0xff0f
        };

        self.state.write_gpr(RAX, Size::Word, false, ax);
        self.state.set_flag(Rflags::AF, adjust);
        self.state.set_flag(Rflags::CF, adjust);
        Ok(())
    }

    pub(super) fn aas(&mut self) -> Result<(), Fault> {
        self.bcd_guard()?;

        let ax = self.state.read_gpr(RAX, Size::Word, false);
        let adjust = ax & 0xf > 9 || self.state.flag(Rflags::AF);

        let ax = if adjust {
            ax.wrapping_sub(6).wrapping_sub(0x100) & 0xff0f
        } else {
            ax & 0xff0f
        };

        self.state.write_gpr(RAX, Size::Word, false, ax);
        self.state.set_flag(Rflags::AF, adjust);
        self.state.set_flag(Rflags::CF, adjust);
        Ok(())
    }

    pub(super) fn aam(&mut self) -> Result<(), Fault> {
        self.bcd_guard()?;
        let base = u64::from(self.fetch.next8()?);

        if base == 0 {
            return Err(Fault::de());
        }

        let al = self.state.read_gpr(RAX, Size::Byte, false);
        let ah = al / base;
        let al = al % base;

        self.state
            .write_gpr(RAX, Size::Word, false, al | ah << 8);
        self.state.update_zsp(al, Size::Byte);
        Ok(())
    }

    pub(super) fn aad(&mut self) -> Result<(), Fault> {
        self.bcd_guard()?;
        let base = u64::from(self.fetch.next8()?);

        let ax = self.state.read_gpr(RAX, Size::Word, false);
        let al = ((ax & 0xff) + (ax >> 8) * base) & 0xff;

        self.state.write_gpr(RAX, Size::Word, false, al);
        self.state.update_zsp(al, Size::Byte);
        Ok(())
    }

    fn bcd_guard(&mut self) -> Result<(), Fault> {
        if self.state.code_is_64() {
            Err(Fault::ud())
        } else {
            Ok(())
        }
    }
}
