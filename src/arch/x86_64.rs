//! This module provides code specific to the x86-64 architecture.

use bitflags::bitflags;

/// Represents the general-purpose registers of the x86-64 architecture, in encoding order:
/// the variant index is the register number used by ModR/M and REX encodings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Register {
    /// The accumulator register.
    Rax,
    /// The counter register.
    Rcx,
    /// The data register.
    Rdx,
    /// The base register.
    Rbx,
    /// The stack pointer register.
    Rsp,
    /// The base pointer register.
    Rbp,
    /// The source index register.
    Rsi,
    /// The destination index register.
    Rdi,
    /// The R8 register.
    R8,
    /// The R9 register.
    R9,
    /// The R10 register.
    R10,
    /// The R11 register.
    R11,
    /// The R12 register.
    R12,
    /// The R13 register.
    R13,
    /// The R14 register.
    R14,
    /// The R15 register.
    R15,
}

impl Register {
    /// The register number as used by instruction encodings.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Register numbers for the low eight GPRs, which is all a non-REX encoding can name.
pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;

/// An access width. Sub-register writes never disturb unrelated bytes of the underlying
/// 64-bit word, with the single exception that 32-bit writes zero-extend to 64 bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum Size {
    Byte,
    Word,
    Dword,
    Qword,
}

impl Size {
    /// The width in bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Size::Byte => 8,
            Size::Word => 16,
            Size::Dword => 32,
            Size::Qword => 64,
        }
    }

    /// The width in bytes.
    #[inline]
    pub const fn bytes(self) -> u64 {
        self.bits() as u64 / 8
    }

    /// An all-ones mask of this width.
    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            Size::Byte => 0xff,
            Size::Word => 0xffff,
            Size::Dword => 0xffff_ffff,
            Size::Qword => u64::MAX,
        }
    }

    /// The sign bit of this width.
    #[inline]
    pub const fn sign_bit(self) -> u64 {
        1 << (self.bits() - 1)
    }

    /// Truncate a value to this width.
    #[inline]
    pub const fn truncate(self, value: u64) -> u64 {
        value & self.mask()
    }

    /// Sign-extend a value of this width to 64 bits.
    #[inline]
    pub const fn sign_extend(self, value: u64) -> u64 {
        match self {
            Size::Byte => value as u8 as i8 as i64 as u64,
            Size::Word => value as u16 as i16 as i64 as u64,
            Size::Dword => value as u32 as i32 as i64 as u64,
            Size::Qword => value,
        }
    }
}

/// Protected Mode Enable.
pub const CR0_PE: u64 = 1 << 0;
/// Monitor Co-Processor.
pub const CR0_MP: u64 = 1 << 1;
/// Emulation.
pub const CR0_EM: u64 = 1 << 2;
/// Task Switched.
pub const CR0_TS: u64 = 1 << 3;
/// Extension Type.
pub const CR0_ET: u64 = 1 << 4;
/// Numeric Error.
pub const CR0_NE: u64 = 1 << 5;
/// Write Protect.
pub const CR0_WP: u64 = 1 << 16;
/// Alignment Mask.
pub const CR0_AM: u64 = 1 << 18;
/// Not write-through.
pub const CR0_NW: u64 = 1 << 29;
/// Cache Disable.
pub const CR0_CD: u64 = 1 << 30;
/// Paging.
pub const CR0_PG: u64 = 1 << 31;

/// Virtual 8086 Mode Extension.
pub const CR4_VME: u64 = 1 << 0;
/// Protected Mode Virtual Interrupts.
pub const CR4_PVI: u64 = 1 << 1;
/// Time Stamp Disable (only enabled in ring 0).
pub const CR4_TSD: u64 = 1 << 2;
/// Debugging Extension.
pub const CR4_DE: u64 = 1 << 3;
/// Page Size Extension.
pub const CR4_PSE: u64 = 1 << 4;
/// Physical Address Extension.
pub const CR4_PAE: u64 = 1 << 5;
/// Machine Check Exception.
pub const CR4_MCE: u64 = 1 << 6;
/// Page Global Enable.
pub const CR4_PGE: u64 = 1 << 7;
/// Performance Monitoring Counter Enable.
pub const CR4_PCE: u64 = 1 << 8;
/// OS support for `fxsave` and `fxrstor`.
pub const CR4_OSFXSR: u64 = 1 << 9;
/// OS support for unmasked SIMD floating-point exceptions.
pub const CR4_OSXMMEXCPT: u64 = 1 << 10;

bitflags! {
    /// The RFLAGS register. Bit 1 is architecturally fixed to one.
    pub struct Rflags: u64 {
        /// Carry flag.
        const CF = 1 << 0;
        /// Always one.
        const RESERVED1 = 1 << 1;
        /// Parity flag: set when the low byte of the result has an even number of set bits.
        const PF = 1 << 2;
        /// Auxiliary carry flag (carry out of bit 3).
        const AF = 1 << 4;
        /// Zero flag.
        const ZF = 1 << 6;
        /// Sign flag.
        const SF = 1 << 7;
        /// Trap flag.
        const TF = 1 << 8;
        /// Interrupt enable flag.
        const IF = 1 << 9;
        /// Direction flag.
        const DF = 1 << 10;
        /// Overflow flag.
        const OF = 1 << 11;
        /// I/O privilege level (two bits).
        const IOPL = 0b11 << 12;
        /// Nested task.
        const NT = 1 << 14;
        /// Resume flag.
        const RF = 1 << 16;
        /// Virtual 8086 mode.
        const VM = 1 << 17;
        /// Alignment check.
        const AC = 1 << 18;
        /// CPUID-available indicator (writable on anything later than a 486).
        const ID = 1 << 21;
    }
}

/// The arithmetic status flags, i.e. the set an ALU operation may rewrite.
pub const ARITH_FLAGS: u64 = Rflags::CF.bits()
    | Rflags::PF.bits()
    | Rflags::AF.bits()
    | Rflags::ZF.bits()
    | Rflags::SF.bits()
    | Rflags::OF.bits();

/// The code segment to load when issuing the `sysenter` instruction.
pub const MSR_IA32_SYSENTER_CS: u32 = 0x0000_0174;
/// The stack pointer to load when issuing the `sysenter` instruction.
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x0000_0175;
/// The instruction pointer to load when issuing the `sysenter` instruction.
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x0000_0176;
/// Memory type range registers, default type.
pub const MSR_IA32_MTRR_DEF_TYPE: u32 = 0x0000_02ff;
/// Page attribute table.
pub const MSR_IA32_PAT: u32 = 0x0000_0277;
/// The local APIC base.
pub const MSR_IA32_APIC_BASE: u32 = 0x0000_001b;

/// The Extended Feature Enable Register (EFER).
pub const MSR_IA32_EFER: u32 = 0xc000_0080;

/// Enables the `syscall` extension.
pub const EFER_SCE: u64 = 1 << 0;
/// Enables long mode.
pub const EFER_LME: u64 = 1 << 8;
/// Indicates long mode is active.
pub const EFER_LMA: u64 = 1 << 10;
/// Enables the non-executable bit.
pub const EFER_NXE: u64 = 1 << 11;

/// The user segment base \[48:63\], the kernel segment base \[32:47\] and the syscall EIP
/// \[0:31\].
pub const MSR_IA32_STAR: u32 = 0xc000_0081;
/// The instruction pointer to load when issuing a `syscall` in 64-bit mode.
pub const MSR_IA32_LSTAR: u32 = 0xc000_0082;
/// The instruction pointer to load when issuing a `syscall` in 32-bit compatibility mode.
pub const MSR_IA32_CSTAR: u32 = 0xc000_0083;
/// Bits set in the syscall mask clear the corresponding bits in the `rflags` register when
/// issuing a `syscall` instruction.
pub const MSR_IA32_SYSCALL_MASK: u32 = 0xc000_0084;
/// The FS segment base in long mode.
pub const MSR_IA32_FS_BASE: u32 = 0xc000_0100;
/// The GS segment base in long mode.
pub const MSR_IA32_GS_BASE: u32 = 0xc000_0101;
/// The GS segment to swap when issuing the `swapgs` instruction.
pub const MSR_IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;

/// Represents a cached segment descriptor on the x86-64 architecture.
///
/// In protected and long mode this record is materialized from the GDT or LDT on selector
/// load. In real mode there is no descriptor to read and the record is synthesized as
/// `base = selector << 4`, `limit = 0xffff`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Segment {
    /// The base address of the segment.
    pub base: u64,
    /// The limit of the segment, already scaled by granularity.
    pub limit: u32,
    /// The type field of the descriptor (bits 40..44).
    pub segment_type: u8,
    /// Whether the descriptor describes a code/data segment rather than a system segment.
    pub non_system_segment: bool,
    /// The privilege level of the segment, where 0 is supervisor mode and 3 is user mode.
    pub dpl: u8,
    /// Whether the segment descriptor is valid/present.
    pub present: bool,
    pub available: bool,
    /// Whether this segment uses long mode. This is only checked for 64-bit code segments.
    pub long: bool,
    /// The default operation size: false selects 16-bit, true selects 32-bit.
    pub default: bool,
    /// Whether the limit was described in units of 4 kiB.
    pub granularity: bool,
}

impl Segment {
    /// Whether this is an executable (code) segment.
    #[inline]
    pub fn executable(&self) -> bool {
        self.non_system_segment && self.segment_type & 0x8 != 0
    }

    /// Whether a data segment is writable, or a code segment readable.
    #[inline]
    pub fn writable(&self) -> bool {
        self.segment_type & 0x2 != 0
    }

    /// The real-mode synthesis for a selector: `base = selector << 4`, `limit = 0xffff`.
    pub fn real_mode(selector: u16) -> Self {
        Self {
            base: u64::from(selector) << 4,
            limit: 0xffff,
            segment_type: 0x3,
            non_system_segment: true,
            present: true,
            ..Default::default()
        }
    }
}

/// Represents the six segment registers of the x86-64 architecture.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentRegister {
    /// The ES segment register.
    Es,
    /// The code segment register.
    Cs,
    /// The stack segment register.
    Ss,
    /// The data segment register.
    Ds,
    /// The FS segment register.
    Fs,
    /// The GS segment register.
    Gs,
}

impl SegmentRegister {
    /// All six segment registers in encoding order.
    pub const ALL: [SegmentRegister; 6] = [
        SegmentRegister::Es,
        SegmentRegister::Cs,
        SegmentRegister::Ss,
        SegmentRegister::Ds,
        SegmentRegister::Fs,
        SegmentRegister::Gs,
    ];

    /// The register number used by segment-register encodings (`mov sreg, r/m`).
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decode a segment-register number from an instruction encoding.
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }
}

/// Represents the descriptor table registers of the x86-64 architecture.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DescriptorTableRegister {
    /// The global descriptor table.
    Gdt,
    /// The interrupt descriptor table.
    Idt,
}

/// Represents a descriptor table on the x86-64 architecture.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DescriptorTable {
    /// The base address of the descriptor table.
    pub base: u64,
    /// The limit of the descriptor table.
    pub limit: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_masks() {
        assert_eq!(Size::Byte.mask(), 0xff);
        assert_eq!(Size::Dword.truncate(0x1_0000_0001), 1);
        assert_eq!(Size::Word.sign_extend(0x8000), 0xffff_ffff_ffff_8000);
        assert_eq!(Size::Dword.sign_bit(), 0x8000_0000);
    }

    #[test]
    fn real_mode_segment_synthesis() {
        let seg = Segment::real_mode(0xf000);
        assert_eq!(seg.base, 0xf_0000);
        assert_eq!(seg.limit, 0xffff);
        assert!(seg.present);
    }

    #[test]
    fn segment_register_encoding_order() {
        assert_eq!(SegmentRegister::from_index(0), Some(SegmentRegister::Es));
        assert_eq!(SegmentRegister::from_index(1), Some(SegmentRegister::Cs));
        assert_eq!(SegmentRegister::from_index(5), Some(SegmentRegister::Gs));
        assert_eq!(SegmentRegister::from_index(6), None);
    }
}
