//! Privileged and system instructions: control-register moves, descriptor-table loads,
//! CPUID, the MSR and timestamp instructions, fast system calls, port I/O and the x87
//! control-word stub.

use super::Exec;
use crate::arch::x86_64::{
    Rflags, SegmentRegister, Size, CR0_ET, CR0_PE, EFER_SCE, MSR_IA32_FS_BASE,
    MSR_IA32_GS_BASE, MSR_IA32_KERNEL_GS_BASE, MSR_IA32_LSTAR, MSR_IA32_STAR,
    MSR_IA32_SYSCALL_MASK, MSR_IA32_SYSENTER_CS, MSR_IA32_SYSENTER_EIP, MSR_IA32_SYSENTER_ESP,
    RAX, RBX, RCX, RDX,
};
use crate::decode::RmOp;
use crate::fault::Fault;
use crate::segmentation::read_raw_descriptor;
use crate::state::CpuMode;

/// The baseline feature word reported in CPUID leaf 1 EDX: FPU, VME, DE, PSE, TSC, MSR,
/// PAE, MCE, CX8, APIC, SEP, MTRR, PGE, CMOV, PAT, PSE-36, CLFSH, FXSR, SSE, SSE2.
const CPUID_FEATURES_EDX: u32 = 0x0783_bbff;

/// Extended leaf 0x8000_0001 EDX: SYSCALL and long mode.
const CPUID_EXT_FEATURES_EDX: u32 = 1 << 11 | 1 << 29;

impl Exec<'_> {
    fn require_cpl0(&self) -> Result<(), Fault> {
        if self.state.cpl() != 0 {
            Err(Fault::gp0())
        } else {
            Ok(())
        }
    }

    fn require_iopl(&self) -> Result<(), Fault> {
        if self.state.mode != CpuMode::Real && self.state.cpl() > self.state.iopl() {
            Err(Fault::gp0())
        } else {
            Ok(())
        }
    }

    // --- Control and debug register moves ---

    /// MOV CR: always the full register width of the mode, independent of any
    /// operand-size prefix. Mode-bearing writes re-derive the execution mode.
    pub(super) fn mov_cr(&mut self, to_cr: bool) -> Result<(), Fault> {
        self.require_cpl0()?;

        let size = if self.state.mode == CpuMode::Long {
            Size::Qword
        } else {
            Size::Dword
        };

        let modrm = self.modrm()?;
        let RmOp::Reg(gpr) = modrm.operand else {
            return Err(Fault::ud());
        };

        let cr = modrm.reg & 0xf;

        if to_cr {
            let value = size.truncate(self.state.gpr64(gpr));

            match cr {
                0 => {
                    self.state.control.cr0 = value | CR0_ET;
                    self.state.update_mode();
                }
                2 => self.state.control.cr2 = value,
                3 => self.state.control.cr3 = value,
                4 => self.state.control.cr4 = value,
                8 => {}
                _ => return Err(Fault::ud()),
            }
        } else {
            let value = match cr {
                0 => self.state.control.cr0,
                2 => self.state.control.cr2,
                3 => self.state.control.cr3,
                4 => self.state.control.cr4,
                8 => 0,
                _ => return Err(Fault::ud()),
            };

            self.state.write_gpr(gpr, size, false, value);
        }

        Ok(())
    }

    pub(super) fn mov_dr(&mut self, to_dr: bool) -> Result<(), Fault> {
        self.require_cpl0()?;

        let size = if self.state.mode == CpuMode::Long {
            Size::Qword
        } else {
            Size::Dword
        };

        let modrm = self.modrm()?;
        let RmOp::Reg(gpr) = modrm.operand else {
            return Err(Fault::ud());
        };

        let dr = usize::from(modrm.reg & 0x7);

        if to_dr {
            self.state.dr[dr] = size.truncate(self.state.gpr64(gpr));
        } else {
            self.state.write_gpr(gpr, size, false, self.state.dr[dr]);
        }

        Ok(())
    }

    pub(super) fn clts(&mut self) -> Result<(), Fault> {
        self.require_cpl0()?;
        self.state.control.cr0 &= !crate::arch::x86_64::CR0_TS;
        Ok(())
    }

    // --- Descriptor tables ---

    /// Group 7 (0F 01): the descriptor-table register block plus SWAPGS.
    pub(super) fn group7(&mut self) -> Result<(), Fault> {
        let modrm = self.modrm()?;
        let sub = modrm.reg & 0x7;

        if modrm.modbits == 0b11 {
            return match (sub, modrm.rm & 0x7) {
                (7, 0) => self.swapgs(),
                (4, _) => self.smsw_reg(&modrm),
                (6, _) => self.lmsw(&modrm),
                _ => self.undefined(&[0x0f, 0x01]),
            };
        }

        let RmOp::Mem(mem_ref) = modrm.operand else {
            unreachable!("register forms handled above");
        };

        let base_size = if self.state.mode == CpuMode::Long {
            Size::Qword
        } else {
            Size::Dword
        };

        match sub {
            0 | 1 => {
                let table = if sub == 0 {
                    self.state.gdtr
                } else {
                    self.state.idtr
                };

                self.write_mem(&mem_ref, Size::Word, u64::from(table.limit))?;
                let base_ref = crate::decode::MemRef {
                    offset: mem_ref.offset.wrapping_add(2),
                    ..mem_ref
                };
                self.write_mem(&base_ref, base_size, table.base)?;
                Ok(())
            }
            2 | 3 => {
                self.require_cpl0()?;

                let limit = self.read_mem(&mem_ref, Size::Word)? as u16;
                let base_ref = crate::decode::MemRef {
                    offset: mem_ref.offset.wrapping_add(2),
                    ..mem_ref
                };
                let mut base = self.read_mem(&base_ref, base_size)?;

                // A 16-bit operand size keeps only 24 base bits in legacy mode.
                if self.state.mode != CpuMode::Long && self.op_size() == Size::Word {
                    base &= 0xff_ffff;
                }

                let table = crate::arch::x86_64::DescriptorTable { base, limit };

                if sub == 2 {
                    self.state.gdtr = table;
                } else {
                    self.state.idtr = table;
                }

                Ok(())
            }
            4 => {
                let value = self.state.control.cr0 & 0xffff;
                self.write_mem(&mem_ref, Size::Word, value)
            }
            6 => {
                self.require_cpl0()?;
                let value = self.read_mem(&mem_ref, Size::Word)?;
                self.apply_lmsw(value as u16);
                Ok(())
            }
            7 => {
                self.require_cpl0()?;
                // INVLPG: no TLB is modelled, the walk always reads live tables.
                Ok(())
            }
            _ => self.undefined(&[0x0f, 0x01]),
        }
    }

    fn smsw_reg(&mut self, modrm: &crate::decode::ModRm) -> Result<(), Fault> {
        let size = self.op_size();
        let value = self.state.control.cr0 & size.mask();
        self.write_rm(modrm, size, value)
    }

    fn lmsw(&mut self, modrm: &crate::decode::ModRm) -> Result<(), Fault> {
        self.require_cpl0()?;
        let value = self.read_rm(modrm, Size::Word)?;
        self.apply_lmsw(value as u16);
        Ok(())
    }

    /// LMSW updates CR0 bits 0..4 but can never clear PE.
    fn apply_lmsw(&mut self, value: u16) {
        let mask: u64 = 0b1111;
        let mut cr0 = (self.state.control.cr0 & !mask) | (u64::from(value) & mask);

        if self.state.control.cr0 & CR0_PE != 0 {
            cr0 |= CR0_PE;
        }

        self.state.control.cr0 = cr0;
        self.state.update_mode();
    }

    /// Group 6 (0F 00): LDTR/TR loads and stores and the access checks.
    pub(super) fn group6(&mut self) -> Result<(), Fault> {
        let modrm = self.modrm()?;

        match modrm.reg & 0x7 {
            0 => self.write_rm(&modrm, Size::Word, u64::from(self.state.ldtr.selector)),
            1 => self.write_rm(&modrm, Size::Word, u64::from(self.state.tr.selector)),
            2 => {
                self.require_cpl0()?;
                let selector = self.read_rm(&modrm, Size::Word)? as u16;
                self.load_system_segment(selector, true)
            }
            3 => {
                self.require_cpl0()?;
                let selector = self.read_rm(&modrm, Size::Word)? as u16;
                self.load_system_segment(selector, false)
            }
            4 | 5 => {
                let selector = self.read_rm(&modrm, Size::Word)? as u16;
                let readable = self.access_check(selector, modrm.reg & 0x7 == 5);
                self.state.set_flag(Rflags::ZF, readable);
                Ok(())
            }
            _ => self.undefined(&[0x0f, 0x00]),
        }
    }

    fn load_system_segment(&mut self, selector: u16, ldt: bool) -> Result<(), Fault> {
        if selector & !0b11 == 0 {
            let target = if ldt {
                &mut self.state.ldtr
            } else {
                &mut self.state.tr
            };
            target.selector = selector;
            target.base = 0;
            target.limit = 0;
            return Ok(());
        }

        let raw = read_raw_descriptor(self.state, self.mem, selector)?;
        let descriptor = crate::segmentation::decode_descriptor(raw);

        if !descriptor.present {
            return Err(Fault::np(selector));
        }

        let mut base = descriptor.base;

        // Long-mode system descriptors are 16 bytes; the upper half extends the base.
        if self.state.mode == CpuMode::Long {
            let high = read_raw_descriptor(self.state, self.mem, selector + 8)?;
            base |= (high & 0xffff_ffff) << 32;
        }

        let target = if ldt {
            &mut self.state.ldtr
        } else {
            &mut self.state.tr
        };

        target.selector = selector;
        target.base = base;
        target.limit = descriptor.limit;
        Ok(())
    }

    /// VERR/VERW.
    fn access_check(&mut self, selector: u16, write: bool) -> bool {
        if selector & !0b11 == 0 {
            return false;
        }

        match crate::segmentation::read_descriptor(self.state, self.mem, selector) {
            Ok(descriptor) => {
                if !descriptor.present || !descriptor.non_system_segment {
                    return false;
                }

                if write {
                    !descriptor.executable() && descriptor.writable()
                } else {
                    !descriptor.executable() || descriptor.writable()
                }
            }
            Err(_) => false,
        }
    }

    /// LAR: load access rights.
    pub(super) fn lar(&mut self) -> Result<(), Fault> {
        let size = self.op_size();
        let modrm = self.modrm()?;
        let selector = self.read_rm(&modrm, Size::Word)? as u16;

        if selector & !0b11 == 0 {
            self.state.set_flag(Rflags::ZF, false);
            return Ok(());
        }

        match read_raw_descriptor(self.state, self.mem, selector) {
            Ok(raw) => {
                self.state.set_flag(Rflags::ZF, true);
                let rights = raw >> 32 & 0x00f0_ff00;
                self.write_reg_field(&modrm, size, rights);
            }
            Err(_) => self.state.set_flag(Rflags::ZF, false),
        }

        Ok(())
    }

    /// LSL: load segment limit.
    pub(super) fn lsl(&mut self) -> Result<(), Fault> {
        let size = self.op_size();
        let modrm = self.modrm()?;
        let selector = self.read_rm(&modrm, Size::Word)? as u16;

        if selector & !0b11 == 0 {
            self.state.set_flag(Rflags::ZF, false);
            return Ok(());
        }

        match crate::segmentation::read_descriptor(self.state, self.mem, selector) {
            Ok(descriptor) => {
                self.state.set_flag(Rflags::ZF, true);
                self.write_reg_field(&modrm, size, u64::from(descriptor.limit));
            }
            Err(_) => self.state.set_flag(Rflags::ZF, false),
        }

        Ok(())
    }

    // --- CPUID and timestamps ---

    pub(super) fn cpuid(&mut self) -> Result<(), Fault> {
        let leaf = self.state.read_gpr(RAX, Size::Dword, false) as u32;

        let (eax, ebx, ecx, edx): (u32, u32, u32, u32) = match leaf {
            0 => (7, 0x756e_6547, 0x6c65_746e, 0x4965_6e69), // "GenuineIntel"
            1 => (0x0000_06f1, 0, 0, CPUID_FEATURES_EDX),
            0x8000_0000 => (0x8000_0008, 0, 0, 0),
            0x8000_0001 => (0, 0, 0, CPUID_EXT_FEATURES_EDX),
            0x8000_0008 => (0x3028, 0, 0, 0), // 40 physical / 48 linear bits
            _ => (0, 0, 0, 0),
        };

        self.state.write_gpr(RAX, Size::Dword, false, u64::from(eax));
        self.state.write_gpr(RBX, Size::Dword, false, u64::from(ebx));
        self.state.write_gpr(RCX, Size::Dword, false, u64::from(ecx));
        self.state.write_gpr(RDX, Size::Dword, false, u64::from(edx));
        Ok(())
    }

    pub(super) fn rdtsc(&mut self) -> Result<(), Fault> {
        let tsc = self.ticks.ticks();
        self.state
            .write_gpr(RAX, Size::Dword, false, tsc & 0xffff_ffff);
        self.state.write_gpr(RDX, Size::Dword, false, tsc >> 32);
        Ok(())
    }

    pub(super) fn rdpmc(&mut self) -> Result<(), Fault> {
        self.state.write_gpr(RAX, Size::Dword, false, 0);
        self.state.write_gpr(RDX, Size::Dword, false, 0);
        Ok(())
    }

    // --- MSRs ---

    pub(super) fn rdmsr(&mut self) -> Result<(), Fault> {
        self.require_cpl0()?;

        let index = self.state.read_gpr(RCX, Size::Dword, false) as u32;
        let value = self.state.msr(index);

        if !self.state.msr_is_known(index) {
            log::debug!("rdmsr of unknown msr {index:#x} reads zero");
        }

        self.state
            .write_gpr(RAX, Size::Dword, false, value & 0xffff_ffff);
        self.state.write_gpr(RDX, Size::Dword, false, value >> 32);
        Ok(())
    }

    pub(super) fn wrmsr(&mut self) -> Result<(), Fault> {
        self.require_cpl0()?;

        let index = self.state.read_gpr(RCX, Size::Dword, false) as u32;
        let value = self.state.read_gpr(RAX, Size::Dword, false)
            | self.state.read_gpr(RDX, Size::Dword, false) << 32;

        if !self.state.msr_is_known(index) && self.strict_msrs {
            return Err(Fault::gp0());
        }

        self.state.set_msr(index, value);

        // The long-mode segment-base MSRs shadow the FS/GS descriptor caches.
        let seg = match index {
            MSR_IA32_FS_BASE => Some(SegmentRegister::Fs),
            MSR_IA32_GS_BASE => Some(SegmentRegister::Gs),
            _ => None,
        };

        if let Some(seg) = seg {
            let entry = self.state.segment_mut(seg);
            let mut cache = entry.cache.unwrap_or_default();
            cache.base = value;
            cache.present = true;
            entry.cache = Some(cache);
        }

        Ok(())
    }

    // --- Fast system calls ---

    fn flat_code_segment(selector: u16, long: bool) -> crate::arch::x86_64::Segment {
        crate::arch::x86_64::Segment {
            base: 0,
            limit: 0xffff_ffff,
            segment_type: 0xb,
            non_system_segment: true,
            dpl: (selector & 0b11) as u8,
            present: true,
            available: false,
            long,
            default: !long,
            granularity: true,
        }
    }

    fn flat_data_segment(selector: u16) -> crate::arch::x86_64::Segment {
        crate::arch::x86_64::Segment {
            base: 0,
            limit: 0xffff_ffff,
            segment_type: 0x3,
            non_system_segment: true,
            dpl: (selector & 0b11) as u8,
            present: true,
            available: false,
            long: false,
            default: true,
            granularity: true,
        }
    }

    fn install_flat_cs_ss(&mut self, cs: u16, ss: u16, long: bool) {
        let entry = self.state.segment_mut(SegmentRegister::Cs);
        entry.selector = cs;
        entry.cache = Some(Self::flat_code_segment(cs, long));

        let entry = self.state.segment_mut(SegmentRegister::Ss);
        entry.selector = ss;
        entry.cache = Some(Self::flat_data_segment(ss));
    }

    /// SYSENTER: flat ring-0 entry through the IA32_SYSENTER MSRs.
    pub(super) fn sysenter(&mut self) -> Result<(), Fault> {
        if self.state.mode == CpuMode::Real {
            return Err(Fault::ud());
        }

        let cs = self.state.msr(MSR_IA32_SYSENTER_CS) as u16;

        if cs & !0b11 == 0 {
            return Err(Fault::gp0());
        }

        self.install_flat_cs_ss(cs & !0b11, (cs & !0b11).wrapping_add(8), false);
        self.state.set_gpr64(
            crate::arch::x86_64::RSP,
            self.state.msr(MSR_IA32_SYSENTER_ESP),
        );
        self.next_rip = Some(self.state.msr(MSR_IA32_SYSENTER_EIP));
        self.state.set_flag(Rflags::IF, false);
        Ok(())
    }

    /// SYSEXIT: the ring-3 return; CS and SS derive from SYSENTER_CS + 16/24 with RPL
    /// forced to 3, EIP comes from EDX and ESP from ECX.
    pub(super) fn sysexit(&mut self) -> Result<(), Fault> {
        self.require_cpl0()?;

        if self.state.mode == CpuMode::Real {
            return Err(Fault::ud());
        }

        let base = self.state.msr(MSR_IA32_SYSENTER_CS) as u16 & !0b11;

        if base == 0 {
            return Err(Fault::gp0());
        }

        self.install_flat_cs_ss(base.wrapping_add(16) | 0b11, base.wrapping_add(24) | 0b11, false);

        let esp = self.state.read_gpr(RCX, Size::Dword, false);
        let eip = self.state.read_gpr(RDX, Size::Dword, false);
        self.state.write_gpr(crate::arch::x86_64::RSP, Size::Dword, false, esp);
        self.next_rip = Some(eip);
        Ok(())
    }

    pub(super) fn syscall(&mut self) -> Result<(), Fault> {
        if self.state.mode != CpuMode::Long || self.state.efer() & EFER_SCE == 0 {
            return Err(Fault::ud());
        }

        let return_rip = self.fall_through();
        self.state.set_gpr64(RCX, return_rip);
        let rflags = self.state.rflags();
        self.state.set_gpr64(11, rflags);

        let star = self.state.msr(MSR_IA32_STAR);
        let cs = (star >> 32) as u16 & !0b11;
        self.install_flat_cs_ss(cs, cs.wrapping_add(8), true);

        let mask = self.state.msr(MSR_IA32_SYSCALL_MASK);
        let rflags = self.state.rflags() & !mask;
        self.state.set_rflags(rflags);

        self.next_rip = Some(self.state.msr(MSR_IA32_LSTAR));
        Ok(())
    }

    pub(super) fn sysret(&mut self) -> Result<(), Fault> {
        self.require_cpl0()?;

        if self.state.mode != CpuMode::Long || self.state.efer() & EFER_SCE == 0 {
            return Err(Fault::ud());
        }

        let star = self.state.msr(MSR_IA32_STAR);
        let base = (star >> 48) as u16;
        self.install_flat_cs_ss(
            base.wrapping_add(16) | 0b11,
            base.wrapping_add(8) | 0b11,
            true,
        );

        let r11 = self.state.gpr64(11);
        self.state.set_rflags(r11);
        self.next_rip = Some(self.state.gpr64(RCX));
        Ok(())
    }

    pub(super) fn swapgs(&mut self) -> Result<(), Fault> {
        self.require_cpl0()?;

        if self.state.mode != CpuMode::Long {
            return Err(Fault::ud());
        }

        let gs = self.state.msr(MSR_IA32_GS_BASE);
        let kernel = self.state.msr(MSR_IA32_KERNEL_GS_BASE);
        self.state.set_msr(MSR_IA32_GS_BASE, kernel);
        self.state.set_msr(MSR_IA32_KERNEL_GS_BASE, gs);

        let entry = self.state.segment_mut(SegmentRegister::Gs);
        let mut cache = entry.cache.unwrap_or_default();
        cache.base = kernel;
        cache.present = true;
        entry.cache = Some(cache);
        Ok(())
    }

    // --- Port I/O ---

    /// The IN/OUT family. Port 0x92 is the system control port: bit 1 is the A20 gate.
    pub(super) fn in_out(&mut self, opcode: u8) -> Result<(), Fault> {
        self.require_iopl()?;

        let size = if opcode & 1 == 0 {
            Size::Byte
        } else {
            self.op_size().min(Size::Dword)
        };

        let port = if opcode & 0x08 == 0 {
            u16::from(self.fetch.next8()?)
        } else {
            self.state.read_gpr(RDX, Size::Word, false) as u16
        };

        let input = opcode & 0x02 == 0;

        if input {
            let value = if port == 0x92 {
                u32::from(self.state.a20_enabled) << 1
            } else {
                self.io.port_read(port, size.bytes() as u8)
            };

            self.state
                .write_gpr(RAX, size, false, u64::from(value) & size.mask());
        } else {
            let value = self.state.read_gpr(RAX, size, false) as u32;

            if port == 0x92 {
                self.state.a20_enabled = value & 0b10 != 0;
            } else {
                self.io.port_write(port, size.bytes() as u8, value);
            }
        }

        Ok(())
    }

    // --- Interrupt and direction flags, HLT ---

    pub(super) fn hlt(&mut self) -> Result<(), Fault> {
        self.require_cpl0()?;
        self.state.halted = true;
        Ok(())
    }

    pub(super) fn cmc(&mut self) -> Result<(), Fault> {
        let cf = self.state.flag(Rflags::CF);
        self.state.set_flag(Rflags::CF, !cf);
        Ok(())
    }

    pub(super) fn set_carry(&mut self, value: bool) -> Result<(), Fault> {
        self.state.set_flag(Rflags::CF, value);
        Ok(())
    }

    pub(super) fn set_direction(&mut self, value: bool) -> Result<(), Fault> {
        self.state.set_flag(Rflags::DF, value);
        Ok(())
    }

    pub(super) fn cli(&mut self) -> Result<(), Fault> {
        self.require_iopl()?;
        self.state.set_flag(Rflags::IF, false);
        Ok(())
    }

    /// STI enables interrupts but shadows delivery for one more instruction.
    pub(super) fn sti(&mut self) -> Result<(), Fault> {
        self.require_iopl()?;

        if !self.state.flag(Rflags::IF) {
            self.state.set_flag(Rflags::IF, true);
            self.state.inhibit_interrupts_for_one_instruction();
        }

        Ok(())
    }

    // --- Stubs ---

    /// A ModR/M-consuming no-op (hint NOPs, prefetches).
    pub(super) fn nop_modrm(&mut self) -> Result<(), Fault> {
        self.modrm()?;
        Ok(())
    }

    /// The x87 escape range. Only the control-word plumbing is real: FNINIT, FLDCW,
    /// FNSTCW and FNSTSW. Everything else consumes its operand bytes and does nothing.
    pub(super) fn x87_stub(&mut self, opcode: u8) -> Result<(), Fault> {
        let modrm = self.modrm()?;
        let sub = modrm.reg & 0x7;

        match (opcode, modrm.modbits, sub) {
            (0xdb, 0b11, 4) if modrm.rm & 0x7 == 3 => {
                // FNINIT (DB E3).
                self.state.fpu_control = 0x37f;
                Ok(())
            }
            (0xd9, _, 5) if modrm.is_memory() => {
                let value = self.read_rm(&modrm, Size::Word)?;
                self.state.fpu_control = value as u16;
                Ok(())
            }
            (0xd9, _, 7) if modrm.is_memory() => {
                let value = u64::from(self.state.fpu_control);
                self.write_rm(&modrm, Size::Word, value)
            }
            (0xdd, _, 7) if modrm.is_memory() => self.write_rm(&modrm, Size::Word, 0),
            (0xdf, 0b11, 4) if modrm.rm & 0x7 == 0 => {
                // FNSTSW AX (DF E0): the stub never has pending exceptions.
                self.state.write_gpr(RAX, Size::Word, false, 0);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
