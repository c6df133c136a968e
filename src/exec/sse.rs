//! SSE data movement and bitwise storage semantics: enough of the XMM surface for
//! compiler-emitted copies and clears, plus the MXCSR and FXSAVE plumbing.

use super::Exec;
use crate::arch::x86_64::{Size, CR0_EM};
use crate::decode::{MemRef, RmOp};
use crate::fault::Fault;

impl Exec<'_> {
    fn sse_guard(&self) -> Result<(), Fault> {
        if self.state.control.cr0 & CR0_EM != 0 {
            Err(Fault::ud())
        } else {
            Ok(())
        }
    }

    fn xmm_index(&self, encoded: u8) -> usize {
        usize::from(encoded & 0xf)
    }

    fn read_xmm_mem(&mut self, mem_ref: &MemRef) -> Result<[u32; 4], Fault> {
        let low = self.read_mem(mem_ref, Size::Qword)?;
        let high_ref = MemRef {
            offset: mem_ref.offset.wrapping_add(8),
            ..*mem_ref
        };
        let high = self.read_mem(&high_ref, Size::Qword)?;

        Ok([
            low as u32,
            (low >> 32) as u32,
            high as u32,
            (high >> 32) as u32,
        ])
    }

    fn write_xmm_mem(&mut self, mem_ref: &MemRef, value: [u32; 4]) -> Result<(), Fault> {
        let low = u64::from(value[0]) | u64::from(value[1]) << 32;
        let high = u64::from(value[2]) | u64::from(value[3]) << 32;

        self.write_mem(mem_ref, Size::Qword, low)?;
        let high_ref = MemRef {
            offset: mem_ref.offset.wrapping_add(8),
            ..*mem_ref
        };
        self.write_mem(&high_ref, Size::Qword, high)
    }

    /// MOVUPS/MOVAPS (and their 66/F3/F2 forms): 0F 10/28 load, 0F 11/29 store.
    pub(super) fn sse_mov_packed(&mut self, opcode: u8) -> Result<(), Fault> {
        self.sse_guard()?;

        let modrm = self.modrm()?;
        let store = opcode & 1 != 0;
        let reg = self.xmm_index(modrm.reg);

        // F3 moves one dword lane, F2 one qword lane, plain and 66 move all four.
        let lanes = match self.prefixes.rep {
            Some(crate::decode::Rep::Rep) => 1,
            Some(crate::decode::Rep::Repne) => 2,
            None => 4,
        };

        match (store, modrm.operand) {
            (false, RmOp::Reg(rm)) => {
                let rm = self.xmm_index(rm);
                for lane in 0..lanes {
                    self.state.xmm[reg][lane] = self.state.xmm[rm][lane];
                }
            }
            (false, RmOp::Mem(mem_ref)) => {
                let value = self.read_xmm_mem(&mem_ref)?;

                // A partial load from memory zeroes the untouched upper lanes.
                for lane in 0..4 {
                    self.state.xmm[reg][lane] = if lane < lanes { value[lane] } else { 0 };
                }
            }
            (true, RmOp::Reg(rm)) => {
                let rm = self.xmm_index(rm);
                for lane in 0..lanes {
                    self.state.xmm[rm][lane] = self.state.xmm[reg][lane];
                }
            }
            (true, RmOp::Mem(mem_ref)) => {
                let value = self.state.xmm[reg];

                match lanes {
                    1 => self.write_mem(&mem_ref, Size::Dword, u64::from(value[0]))?,
                    2 => self.write_mem(
                        &mem_ref,
                        Size::Qword,
                        u64::from(value[0]) | u64::from(value[1]) << 32,
                    )?,
                    _ => self.write_xmm_mem(&mem_ref, value)?,
                }
            }
        }

        Ok(())
    }

    /// ANDPS/ANDNPS/ORPS/XORPS (0F 54..57).
    pub(super) fn sse_bitwise(&mut self, opcode: u8) -> Result<(), Fault> {
        self.sse_guard()?;

        let modrm = self.modrm()?;
        let reg = self.xmm_index(modrm.reg);

        let src = match modrm.operand {
            RmOp::Reg(rm) => self.state.xmm[self.xmm_index(rm)],
            RmOp::Mem(mem_ref) => self.read_xmm_mem(&mem_ref)?,
        };

        for lane in 0..4 {
            let a = self.state.xmm[reg][lane];
            let b = src[lane];

            self.state.xmm[reg][lane] = match opcode {
                0x54 => a & b,
                0x55 => !a & b,
                0x56 => a | b,
                _ => a ^ b,
            };
        }

        Ok(())
    }

    /// PXOR (66 0F EF).
    pub(super) fn pxor(&mut self) -> Result<(), Fault> {
        self.sse_guard()?;

        if !self.prefixes.operand_size_override {
            // The bare form is MMX territory.
            return Err(Fault::ud());
        }

        let modrm = self.modrm()?;
        let reg = self.xmm_index(modrm.reg);

        let src = match modrm.operand {
            RmOp::Reg(rm) => self.state.xmm[self.xmm_index(rm)],
            RmOp::Mem(mem_ref) => self.read_xmm_mem(&mem_ref)?,
        };

        for lane in 0..4 {
            self.state.xmm[reg][lane] ^= src[lane];
        }

        Ok(())
    }

    /// MOVD/MOVQ to XMM (66 0F 6E).
    pub(super) fn movd_to_xmm(&mut self) -> Result<(), Fault> {
        self.sse_guard()?;

        if !self.prefixes.operand_size_override {
            return Err(Fault::ud());
        }

        let wide = self.prefixes.rex_w();
        let size = if wide { Size::Qword } else { Size::Dword };

        let modrm = self.modrm()?;
        let value = self.read_rm(&modrm, size)?;
        let reg = self.xmm_index(modrm.reg);

        self.state.xmm[reg] = [
            value as u32,
            if wide { (value >> 32) as u32 } else { 0 },
            0,
            0,
        ];
        Ok(())
    }

    /// 0F 7E: MOVD/MOVQ from XMM with 66, MOVQ load with F3.
    pub(super) fn movd_from_xmm(&mut self) -> Result<(), Fault> {
        self.sse_guard()?;

        if self.prefixes.rep == Some(crate::decode::Rep::Rep) {
            // MOVQ xmm, xmm/m64: load the low qword, zero the high.
            let modrm = self.modrm()?;
            let reg = self.xmm_index(modrm.reg);

            let (low, high) = match modrm.operand {
                RmOp::Reg(rm) => {
                    let rm = self.xmm_index(rm);
                    (self.state.xmm[rm][0], self.state.xmm[rm][1])
                }
                RmOp::Mem(mem_ref) => {
                    let value = self.read_mem(&mem_ref, Size::Qword)?;
                    (value as u32, (value >> 32) as u32)
                }
            };

            self.state.xmm[reg] = [low, high, 0, 0];
            return Ok(());
        }

        if !self.prefixes.operand_size_override {
            return Err(Fault::ud());
        }

        let wide = self.prefixes.rex_w();
        let size = if wide { Size::Qword } else { Size::Dword };

        let modrm = self.modrm()?;
        let reg = self.xmm_index(modrm.reg);
        let value =
            u64::from(self.state.xmm[reg][0]) | u64::from(self.state.xmm[reg][1]) << 32;

        self.write_rm(&modrm, size, size.truncate(value))
    }

    /// MOVDQA/MOVDQU load (66/F3 0F 6F).
    pub(super) fn movdq_load(&mut self) -> Result<(), Fault> {
        self.sse_guard()?;

        if !self.prefixes.operand_size_override
            && self.prefixes.rep != Some(crate::decode::Rep::Rep)
        {
            return Err(Fault::ud());
        }

        let modrm = self.modrm()?;
        let reg = self.xmm_index(modrm.reg);

        self.state.xmm[reg] = match modrm.operand {
            RmOp::Reg(rm) => self.state.xmm[self.xmm_index(rm)],
            RmOp::Mem(mem_ref) => self.read_xmm_mem(&mem_ref)?,
        };

        Ok(())
    }

    /// MOVDQA/MOVDQU store (66/F3 0F 7F).
    pub(super) fn movdq_store(&mut self) -> Result<(), Fault> {
        self.sse_guard()?;

        if !self.prefixes.operand_size_override
            && self.prefixes.rep != Some(crate::decode::Rep::Rep)
        {
            return Err(Fault::ud());
        }

        let modrm = self.modrm()?;
        let reg = self.xmm_index(modrm.reg);
        let value = self.state.xmm[reg];

        match modrm.operand {
            RmOp::Reg(rm) => {
                let rm = self.xmm_index(rm);
                self.state.xmm[rm] = value;
            }
            RmOp::Mem(mem_ref) => self.write_xmm_mem(&mem_ref, value)?,
        }

        Ok(())
    }

    /// MOVQ store (66 0F D6).
    pub(super) fn movq_store(&mut self) -> Result<(), Fault> {
        self.sse_guard()?;

        if !self.prefixes.operand_size_override {
            return Err(Fault::ud());
        }

        let modrm = self.modrm()?;
        let reg = self.xmm_index(modrm.reg);
        let low = u64::from(self.state.xmm[reg][0]) | u64::from(self.state.xmm[reg][1]) << 32;

        match modrm.operand {
            RmOp::Reg(rm) => {
                let rm = self.xmm_index(rm);
                self.state.xmm[rm] = [low as u32, (low >> 32) as u32, 0, 0];
                Ok(())
            }
            RmOp::Mem(mem_ref) => self.write_mem(&mem_ref, Size::Qword, low),
        }
    }

    /// MOVNTI (0F C3): an ordinary store; there is no write-combining to bypass.
    pub(super) fn movnti(&mut self) -> Result<(), Fault> {
        let size = if self.prefixes.rex_w() {
            Size::Qword
        } else {
            Size::Dword
        };

        let modrm = self.modrm()?;

        if !modrm.is_memory() {
            return Err(Fault::ud());
        }

        let value = self.read_reg_field(&modrm, size);
        self.write_rm(&modrm, size, value)
    }

    /// Group 15 (0F AE): MXCSR moves, FXSAVE/FXRSTOR and the fences.
    pub(super) fn group15(&mut self) -> Result<(), Fault> {
        let modrm = self.modrm()?;
        let sub = modrm.reg & 0x7;

        if modrm.modbits == 0b11 {
            return match sub {
                // LFENCE/MFENCE/SFENCE: single-threaded, nothing to order.
                5 | 6 | 7 => Ok(()),
                _ => self.undefined(&[0x0f, 0xae]),
            };
        }

        let RmOp::Mem(mem_ref) = modrm.operand else {
            unreachable!("register forms handled above");
        };

        match sub {
            0 => self.fxsave(&mem_ref),
            1 => self.fxrstor(&mem_ref),
            2 => {
                self.sse_guard()?;
                let value = self.read_mem(&mem_ref, Size::Dword)?;
                self.state.mxcsr = value as u32;
                Ok(())
            }
            3 => {
                self.sse_guard()?;
                let value = u64::from(self.state.mxcsr);
                self.write_mem(&mem_ref, Size::Dword, value)
            }
            7 => Ok(()), // CLFLUSH
            _ => self.undefined(&[0x0f, 0xae]),
        }
    }

    /// FXSAVE: the fields the machine actually models (FCW, MXCSR, the XMM bank); the
    /// x87 data area is written as zeros.
    fn fxsave(&mut self, mem_ref: &MemRef) -> Result<(), Fault> {
        self.sse_guard()?;

        for offset in (0..512u64).step_by(8) {
            let slot = MemRef {
                offset: mem_ref.offset.wrapping_add(offset),
                ..*mem_ref
            };
            self.write_mem(&slot, Size::Qword, 0)?;
        }

        let fcw = MemRef { ..*mem_ref };
        self.write_mem(&fcw, Size::Word, u64::from(self.state.fpu_control))?;

        let mxcsr = MemRef {
            offset: mem_ref.offset.wrapping_add(24),
            ..*mem_ref
        };
        self.write_mem(&mxcsr, Size::Dword, u64::from(self.state.mxcsr))?;

        let xmm_values: Vec<[u32; 4]> = self.state.xmm.iter().copied().collect();
        for (index, xmm) in xmm_values.iter().enumerate() {
            let low = u64::from(xmm[0]) | u64::from(xmm[1]) << 32;
            let high = u64::from(xmm[2]) | u64::from(xmm[3]) << 32;

            let slot = MemRef {
                offset: mem_ref.offset.wrapping_add(160 + index as u64 * 16),
                ..*mem_ref
            };
            self.write_mem(&slot, Size::Qword, low)?;

            let slot_high = MemRef {
                offset: slot.offset.wrapping_add(8),
                ..*mem_ref
            };
            self.write_mem(&slot_high, Size::Qword, high)?;
        }

        Ok(())
    }

    fn fxrstor(&mut self, mem_ref: &MemRef) -> Result<(), Fault> {
        self.sse_guard()?;

        let fcw = self.read_mem(mem_ref, Size::Word)?;
        self.state.fpu_control = fcw as u16;

        let mxcsr_ref = MemRef {
            offset: mem_ref.offset.wrapping_add(24),
            ..*mem_ref
        };
        self.state.mxcsr = self.read_mem(&mxcsr_ref, Size::Dword)? as u32;

        for index in 0..16u64 {
            let slot = MemRef {
                offset: mem_ref.offset.wrapping_add(160 + index * 16),
                ..*mem_ref
            };
            let low = self.read_mem(&slot, Size::Qword)?;

            let slot_high = MemRef {
                offset: slot.offset.wrapping_add(8),
                ..*mem_ref
            };
            let high = self.read_mem(&slot_high, Size::Qword)?;

            self.state.xmm[index as usize] = [
                low as u32,
                (low >> 32) as u32,
                high as u32,
                (high >> 32) as u32,
            ];
        }

        Ok(())
    }
}
