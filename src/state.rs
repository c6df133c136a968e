//! The architectural register file: general-purpose registers with their sub-views, RFLAGS,
//! segment selectors with cached descriptors, control registers, MSRs, descriptor-table
//! registers and the XMM bank.

use crate::arch::x86_64::{
    DescriptorTable, Register, Rflags, Segment, SegmentRegister, Size, CR0_PE, CR0_PG, EFER_LMA,
    EFER_LME, MSR_IA32_EFER, MSR_IA32_SYSENTER_CS, MSR_IA32_SYSENTER_EIP, MSR_IA32_SYSENTER_ESP,
};
use std::collections::{HashMap, VecDeque};

/// The operating mode of the CPU, derived from CR0 and EFER.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpuMode {
    /// 16-bit real-address mode.
    Real,
    /// Protected mode (including 16-bit protected segments).
    Protected,
    /// IA-32e long mode.
    Long,
}

/// One segment register: the visible selector and the hidden descriptor cache. A `None`
/// cache in protected mode means the segment is unusable and any use faults; in real mode a
/// missing cache entry is synthesized from the selector on access.
#[derive(Clone, Copy, Debug, Default)]
pub struct SegmentState {
    pub selector: u16,
    pub cache: Option<Segment>,
}

/// The LDTR/TR system segment registers.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSegment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
}

/// The control register bank.
#[derive(Clone, Copy, Debug, Default)]
pub struct Control {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
}

/// The full architectural CPU state.
pub struct CpuState {
    gpr: [u64; 16],
    pub rip: u64,
    rflags: u64,

    segments: [SegmentState; 6],
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub ldtr: SystemSegment,
    pub tr: SystemSegment,

    pub control: Control,
    /// DR0..DR7; only storage, no breakpoint machinery behind it.
    pub dr: [u64; 8],
    msrs: HashMap<u32, u64>,

    pub xmm: [[u32; 4]; 16],
    pub mxcsr: u32,
    /// The x87 control word; the rest of the x87 state is a stub.
    pub fpu_control: u16,

    pub mode: CpuMode,
    pub a20_enabled: bool,
    pub halted: bool,
    /// Nonzero while maskable interrupt delivery is blocked. Armed to 1 by STI, MOV SS,
    /// POP SS and the LSS/LFS/LGS family; released after the next retired instruction.
    interrupt_inhibit: u8,
    /// FIFO of externally injected interrupt vectors.
    pub pending_interrupts: VecDeque<u8>,
}

impl CpuState {
    pub fn new() -> Self {
        let mut segments: [SegmentState; 6] = Default::default();
        segments[SegmentRegister::Cs.index()].cache = Some(Segment::real_mode(0));

        Self {
            gpr: [0; 16],
            rip: 0,
            rflags: Rflags::RESERVED1.bits(),
            segments,
            gdtr: DescriptorTable::default(),
            idtr: DescriptorTable {
                base: 0,
                limit: 0x3ff,
            },
            ldtr: SystemSegment::default(),
            tr: SystemSegment::default(),
            control: Control::default(),
            dr: [0; 8],
            msrs: HashMap::new(),
            xmm: [[0; 4]; 16],
            mxcsr: 0x1f80,
            fpu_control: 0x37f,
            mode: CpuMode::Real,
            a20_enabled: true,
            halted: false,
            interrupt_inhibit: 0,
            pending_interrupts: VecDeque::new(),
        }
    }

    // --- General-purpose registers ---

    /// Full 64-bit read by register number.
    #[inline]
    pub fn gpr64(&self, index: u8) -> u64 {
        self.gpr[usize::from(index & 0xf)]
    }

    /// Full 64-bit write by register number.
    #[inline]
    pub fn set_gpr64(&mut self, index: u8, value: u64) {
        self.gpr[usize::from(index & 0xf)] = value;
    }

    /// Read by [`Register`] identifier.
    #[inline]
    pub fn reg(&self, register: Register) -> u64 {
        self.gpr[register.index()]
    }

    /// Write by [`Register`] identifier.
    #[inline]
    pub fn set_reg(&mut self, register: Register, value: u64) {
        self.gpr[register.index()] = value;
    }

    /// Sized read. `high` selects the AH/CH/DH/BH view and is only meaningful for
    /// [`Size::Byte`].
    #[inline]
    pub fn read_gpr(&self, index: u8, size: Size, high: bool) -> u64 {
        let word = self.gpr64(index);

        match size {
            Size::Byte if high => (word >> 8) & 0xff,
            _ => size.truncate(word),
        }
    }

    /// Sized write. Writes below 32 bits leave the unrelated bytes of the word untouched;
    /// 32-bit writes zero-extend to the full 64 bits.
    #[inline]
    pub fn write_gpr(&mut self, index: u8, size: Size, high: bool, value: u64) {
        let slot = &mut self.gpr[usize::from(index & 0xf)];

        *slot = match size {
            Size::Byte if high => (*slot & !0xff00) | ((value & 0xff) << 8),
            Size::Byte => (*slot & !0xff) | (value & 0xff),
            Size::Word => (*slot & !0xffff) | (value & 0xffff),
            Size::Dword => value & 0xffff_ffff,
            Size::Qword => value,
        };
    }

    // --- RFLAGS ---

    #[inline]
    pub fn rflags(&self) -> u64 {
        self.rflags
    }

    /// Replace RFLAGS wholesale. The fixed bit stays set and the reserved bits stay clear.
    #[inline]
    pub fn set_rflags(&mut self, value: u64) {
        let writable = Rflags::all().bits() | Rflags::IOPL.bits();
        self.rflags = (value & writable) | Rflags::RESERVED1.bits();
    }

    #[inline]
    pub fn flag(&self, flag: Rflags) -> bool {
        self.rflags & flag.bits() != 0
    }

    #[inline]
    pub fn set_flag(&mut self, flag: Rflags, set: bool) {
        if set {
            self.rflags |= flag.bits();
        } else {
            self.rflags &= !flag.bits();
        }
    }

    /// Replace only the bits selected by `mask`.
    #[inline]
    pub fn merge_rflags(&mut self, mask: u64, value: u64) {
        self.set_rflags((self.rflags & !mask) | (value & mask));
    }

    /// Set ZF, SF and PF from a result of the given width. CF, OF and AF belong to the
    /// operation-specific paths.
    pub fn update_zsp(&mut self, result: u64, size: Size) {
        let result = size.truncate(result);
        self.set_flag(Rflags::ZF, result == 0);
        self.set_flag(Rflags::SF, result & size.sign_bit() != 0);
        self.set_flag(Rflags::PF, (result as u8).count_ones() % 2 == 0);
    }

    #[inline]
    pub fn iopl(&self) -> u8 {
        ((self.rflags >> 12) & 0b11) as u8
    }

    // --- Segments ---

    #[inline]
    pub fn segment(&self, register: SegmentRegister) -> &SegmentState {
        &self.segments[register.index()]
    }

    #[inline]
    pub fn segment_mut(&mut self, register: SegmentRegister) -> &mut SegmentState {
        &mut self.segments[register.index()]
    }

    /// Current privilege level. Real mode has no rings and always reports zero.
    #[inline]
    pub fn cpl(&self) -> u8 {
        match self.mode {
            CpuMode::Real => 0,
            _ => (self.segment(SegmentRegister::Cs).selector & 0b11) as u8,
        }
    }

    /// Whether the current code segment is a 64-bit one.
    pub fn code_is_64(&self) -> bool {
        self.mode == CpuMode::Long
            && self
                .segment(SegmentRegister::Cs)
                .cache
                .map(|cache| cache.long)
                .unwrap_or(false)
    }

    /// The default operand/address size of the current code segment.
    pub fn code_default_size(&self) -> Size {
        if self.code_is_64() {
            // 64-bit code defaults to 32-bit operands and 64-bit addresses; the split is
            // handled by the decoder.
            Size::Dword
        } else {
            match self.segment(SegmentRegister::Cs).cache {
                Some(cache) if cache.default => Size::Dword,
                Some(_) => Size::Word,
                None => match self.mode {
                    CpuMode::Real => Size::Word,
                    _ => Size::Dword,
                },
            }
        }
    }

    // --- Mode transitions ---

    /// Recompute the operating mode from CR0 and EFER, flipping EFER.LMA as the
    /// architecture does when paging toggles under EFER.LME. Descriptor caches loaded under
    /// the previous mode are dropped (except CS, which keeps executing until reloaded).
    pub fn update_mode(&mut self) {
        let pe = self.control.cr0 & CR0_PE != 0;
        let pg = self.control.cr0 & CR0_PG != 0;
        let lme = self.efer() & EFER_LME != 0;

        let mut efer = self.efer();

        if pe && pg && lme {
            efer |= EFER_LMA;
        } else {
            efer &= !EFER_LMA;
        }

        self.msrs.insert(MSR_IA32_EFER, efer);

        let mode = if efer & EFER_LMA != 0 {
            CpuMode::Long
        } else if pe {
            CpuMode::Protected
        } else {
            CpuMode::Real
        };

        if mode != self.mode {
            log::debug!("cpu mode transition: {:?} -> {:?}", self.mode, mode);
            self.mode = mode;

            for register in SegmentRegister::ALL {
                if register != SegmentRegister::Cs {
                    self.segments[register.index()].cache = None;
                }
            }
        }
    }

    // --- MSRs ---

    /// Raw MSR read; unknown MSRs read as zero.
    pub fn msr(&self, index: u32) -> u64 {
        self.msrs.get(&index).copied().unwrap_or(0)
    }

    /// Raw MSR write. Callers enforce the strict-MSR policy; the map itself accepts any
    /// index.
    pub fn set_msr(&mut self, index: u32, value: u64) {
        self.msrs.insert(index, value);

        if index == MSR_IA32_EFER {
            self.update_mode();
        }
    }

    /// Whether this MSR number has a defined meaning to the machine.
    pub fn msr_is_known(&self, index: u32) -> bool {
        matches!(
            index,
            MSR_IA32_EFER
                | MSR_IA32_SYSENTER_CS
                | MSR_IA32_SYSENTER_ESP
                | MSR_IA32_SYSENTER_EIP
                | crate::arch::x86_64::MSR_IA32_STAR
                | crate::arch::x86_64::MSR_IA32_LSTAR
                | crate::arch::x86_64::MSR_IA32_CSTAR
                | crate::arch::x86_64::MSR_IA32_SYSCALL_MASK
                | crate::arch::x86_64::MSR_IA32_FS_BASE
                | crate::arch::x86_64::MSR_IA32_GS_BASE
                | crate::arch::x86_64::MSR_IA32_KERNEL_GS_BASE
                | crate::arch::x86_64::MSR_IA32_PAT
                | crate::arch::x86_64::MSR_IA32_MTRR_DEF_TYPE
                | crate::arch::x86_64::MSR_IA32_APIC_BASE
        ) || self.msrs.contains_key(&index)
    }

    #[inline]
    pub fn efer(&self) -> u64 {
        self.msr(MSR_IA32_EFER)
    }

    // --- Interrupt shadow ---

    /// Block maskable interrupt delivery until one more instruction has retired. The
    /// arming instruction retires once itself, so the latch starts at two.
    pub fn inhibit_interrupts_for_one_instruction(&mut self) {
        self.interrupt_inhibit = 2;
    }

    /// Whether delivery is currently blocked by the shadow.
    #[inline]
    pub fn interrupts_inhibited(&self) -> bool {
        self.interrupt_inhibit > 0
    }

    /// Age the interrupt shadow; called once per retired instruction.
    pub fn retire_instruction(&mut self) {
        if self.interrupt_inhibit > 0 {
            self.interrupt_inhibit -= 1;
        }
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::{RAX, RBX, RSP};

    #[test]
    fn high_byte_views_leave_neighbours_alone() {
        let mut state = CpuState::new();
        state.set_gpr64(RAX, 0x1122_3344_5566_7788);

        state.write_gpr(RAX, Size::Byte, true, 0xaa);
        assert_eq!(state.gpr64(RAX), 0x1122_3344_5566_aa88);
        assert_eq!(state.read_gpr(RAX, Size::Byte, true), 0xaa);

        state.write_gpr(RAX, Size::Byte, false, 0xbb);
        assert_eq!(state.gpr64(RAX), 0x1122_3344_5566_aabb);
    }

    #[test]
    fn word_writes_preserve_upper_bits() {
        let mut state = CpuState::new();
        state.set_gpr64(RBX, 0xffff_ffff_ffff_ffff);
        state.write_gpr(RBX, Size::Word, false, 0x1234);
        assert_eq!(state.gpr64(RBX), 0xffff_ffff_ffff_1234);
    }

    #[test]
    fn dword_writes_zero_extend() {
        let mut state = CpuState::new();
        state.set_gpr64(RSP, 0xffff_ffff_ffff_ffff);
        state.write_gpr(RSP, Size::Dword, false, 0x8000_0000);
        assert_eq!(state.gpr64(RSP), 0x8000_0000);
    }

    #[test]
    fn zsp_helper_computes_parity_of_low_byte() {
        let mut state = CpuState::new();

        state.update_zsp(0, Size::Dword);
        assert!(state.flag(Rflags::ZF));
        assert!(state.flag(Rflags::PF));
        assert!(!state.flag(Rflags::SF));

        // 0x1_0300: low byte 0x00 is even parity even though the dword is nonzero.
        state.update_zsp(0x1_0300, Size::Dword);
        assert!(!state.flag(Rflags::ZF));
        assert!(state.flag(Rflags::PF));

        state.update_zsp(0x8000_0001, Size::Dword);
        assert!(state.flag(Rflags::SF));
        assert!(!state.flag(Rflags::PF));
    }

    #[test]
    fn mode_transitions_invalidate_data_segment_caches() {
        let mut state = CpuState::new();
        state.segment_mut(SegmentRegister::Ds).cache = Some(Segment::real_mode(0x100));

        state.control.cr0 |= CR0_PE;
        state.update_mode();

        assert_eq!(state.mode, CpuMode::Protected);
        assert!(state.segment(SegmentRegister::Ds).cache.is_none());
        assert!(state.segment(SegmentRegister::Cs).cache.is_some());
    }

    #[test]
    fn lma_follows_paging_under_lme() {
        let mut state = CpuState::new();
        state.set_msr(MSR_IA32_EFER, EFER_LME);
        state.control.cr0 |= CR0_PE | CR0_PG;
        state.update_mode();

        assert_eq!(state.mode, CpuMode::Long);
        assert_ne!(state.efer() & EFER_LMA, 0);

        state.control.cr0 &= !CR0_PG;
        state.update_mode();
        assert_eq!(state.mode, CpuMode::Protected);
        assert_eq!(state.efer() & EFER_LMA, 0);
    }
}
