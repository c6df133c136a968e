//! Instruction decoding: legacy prefix scanning, REX, ModR/M + SIB + displacement resolution
//! and immediate fetching.
//!
//! The decoder works over a small prefetched window of code bytes (an instruction is at most
//! fifteen bytes) so that a fetch fault is raised exactly when a missing byte is actually
//! consumed. Effective addresses are produced as segment-relative offsets; RIP-relative
//! operands stay symbolic until the instruction length is known.

use crate::arch::x86_64::{SegmentRegister, Size};
use crate::fault::Fault;
use crate::mem::Memory;
use crate::paging::{read_linear, Access};
use crate::segmentation::segment_base;
use crate::state::{CpuMode, CpuState};

/// The effective address size of an instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddrSize {
    A16,
    A32,
    A64,
}

impl AddrSize {
    /// The wrap-around mask of this address size.
    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            AddrSize::A16 => 0xffff,
            AddrSize::A32 => 0xffff_ffff,
            AddrSize::A64 => u64::MAX,
        }
    }

    /// The register width used for pointer registers at this address size.
    #[inline]
    pub const fn size(self) -> Size {
        match self {
            AddrSize::A16 => Size::Word,
            AddrSize::A32 => Size::Dword,
            AddrSize::A64 => Size::Qword,
        }
    }
}

/// REP/REPNE prefix kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rep {
    Rep,
    Repne,
}

/// A parsed REX prefix (long mode only).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Rex {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

/// The legacy prefixes of one instruction, plus REX when in 64-bit code.
#[derive(Clone, Copy, Debug, Default)]
pub struct Prefixes {
    pub operand_size_override: bool,
    pub address_size_override: bool,
    pub segment: Option<SegmentRegister>,
    pub rep: Option<Rep>,
    pub lock: bool,
    pub rex: Option<Rex>,
}

impl Prefixes {
    /// The effective operand size given the current code segment defaults.
    pub fn operand_size(&self, state: &CpuState) -> Size {
        if state.code_is_64() {
            if self.rex.map(|rex| rex.w).unwrap_or(false) {
                Size::Qword
            } else if self.operand_size_override {
                Size::Word
            } else {
                Size::Dword
            }
        } else {
            match (state.code_default_size(), self.operand_size_override) {
                (Size::Dword, false) | (Size::Word, true) => Size::Dword,
                _ => Size::Word,
            }
        }
    }

    /// The effective address size given the current code segment defaults.
    pub fn address_size(&self, state: &CpuState) -> AddrSize {
        if state.code_is_64() {
            if self.address_size_override {
                AddrSize::A32
            } else {
                AddrSize::A64
            }
        } else {
            match (state.code_default_size(), self.address_size_override) {
                (Size::Dword, false) | (Size::Word, true) => AddrSize::A32,
                _ => AddrSize::A16,
            }
        }
    }

    #[inline]
    pub fn rex_w(&self) -> bool {
        self.rex.map(|rex| rex.w).unwrap_or(false)
    }

    /// Whether a REX prefix is present at all, which retires the AH/CH/DH/BH encodings in
    /// favour of SPL/BPL/SIL/DIL.
    #[inline]
    pub fn has_rex(&self) -> bool {
        self.rex.is_some()
    }
}

/// The prefetched bytes of one instruction.
pub struct InsnFetch {
    buf: [u8; 16],
    len: u8,
    pos: u8,
    /// The fault hit while prefetching, reported once the decoder consumes past `len`.
    pending: Option<Fault>,
}

impl InsnFetch {
    /// Prefetches up to sixteen code bytes at CS:RIP. A fault on the very first byte is
    /// reported immediately; later bytes fault lazily when consumed.
    pub fn fetch(state: &CpuState, mem: &mut Memory) -> Result<Self, Fault> {
        let base = segment_base(state, SegmentRegister::Cs);
        let mut this = Self {
            buf: [0; 16],
            len: 0,
            pos: 0,
            pending: None,
        };

        for i in 0..16u64 {
            let addr = base.wrapping_add(state.rip.wrapping_add(i));

            match read_linear(state, mem, addr, Size::Byte, Access::Fetch) {
                Ok(byte) => {
                    this.buf[i as usize] = byte as u8;
                    this.len += 1;
                }
                Err(fault) => {
                    if i == 0 {
                        return Err(fault);
                    }

                    this.pending = Some(fault);
                    break;
                }
            }
        }

        Ok(this)
    }

    /// Builds a fetch window from raw bytes; used by the pattern engine to re-decode
    /// candidate sequences.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0; 16];
        let len = bytes.len().min(16);
        buf[..len].copy_from_slice(&bytes[..len]);

        Self {
            buf,
            len: len as u8,
            pos: 0,
            pending: None,
        }
    }

    /// The number of bytes consumed so far.
    #[inline]
    pub fn consumed(&self) -> u64 {
        u64::from(self.pos)
    }

    pub fn next8(&mut self) -> Result<u8, Fault> {
        if self.pos >= self.len {
            return Err(self.pending.unwrap_or_else(Fault::gp0));
        }

        let byte = self.buf[usize::from(self.pos)];
        self.pos += 1;
        Ok(byte)
    }

    pub fn next16(&mut self) -> Result<u16, Fault> {
        Ok(u16::from(self.next8()?) | u16::from(self.next8()?) << 8)
    }

    pub fn next32(&mut self) -> Result<u32, Fault> {
        Ok(u32::from(self.next16()?) | u32::from(self.next16()?) << 16)
    }

    pub fn next64(&mut self) -> Result<u64, Fault> {
        Ok(u64::from(self.next32()?) | u64::from(self.next32()?) << 32)
    }

    /// Fetches an immediate of the given width, zero-extended.
    pub fn imm(&mut self, size: Size) -> Result<u64, Fault> {
        match size {
            Size::Byte => Ok(u64::from(self.next8()?)),
            Size::Word => Ok(u64::from(self.next16()?)),
            Size::Dword => Ok(u64::from(self.next32()?)),
            Size::Qword => self.next64(),
        }
    }

    /// Fetches the standard ALU immediate for an operand size: 8/16/32 bits literal, and a
    /// sign-extended 32-bit immediate for 64-bit operands.
    pub fn imm_op(&mut self, size: Size) -> Result<u64, Fault> {
        match size {
            Size::Qword => Ok(Size::Dword.sign_extend(u64::from(self.next32()?))),
            _ => self.imm(size),
        }
    }
}

/// Scans legacy prefixes and REX. Returns the prefix set and the first non-prefix byte.
pub fn scan_prefixes(state: &CpuState, fetch: &mut InsnFetch) -> Result<(Prefixes, u8), Fault> {
    let mut prefixes = Prefixes::default();
    let long = state.code_is_64();

    loop {
        let byte = fetch.next8()?;

        match byte {
            0x66 => prefixes.operand_size_override = true,
            0x67 => prefixes.address_size_override = true,
            0x2e => prefixes.segment = Some(SegmentRegister::Cs),
            0x36 => prefixes.segment = Some(SegmentRegister::Ss),
            0x3e => prefixes.segment = Some(SegmentRegister::Ds),
            0x26 => prefixes.segment = Some(SegmentRegister::Es),
            0x64 => prefixes.segment = Some(SegmentRegister::Fs),
            0x65 => prefixes.segment = Some(SegmentRegister::Gs),
            0xf0 => prefixes.lock = true,
            0xf2 => prefixes.rep = Some(Rep::Repne),
            0xf3 => prefixes.rep = Some(Rep::Rep),
            0x40..=0x4f if long => {
                // REX must be the last prefix; the next byte is the opcode.
                prefixes.rex = Some(Rex {
                    w: byte & 0x8 != 0,
                    r: byte & 0x4 != 0,
                    x: byte & 0x2 != 0,
                    b: byte & 0x1 != 0,
                });

                return Ok((prefixes, fetch.next8()?));
            }
            _ => return Ok((prefixes, byte)),
        }
    }
}

/// A decoded memory operand: a segment-relative offset, still unresolved for RIP-relative
/// forms until the full instruction length is known.
#[derive(Clone, Copy, Debug)]
pub struct MemRef {
    pub seg: SegmentRegister,
    pub offset: u64,
    pub rip_relative: bool,
    pub mask: u64,
}

impl MemRef {
    /// The effective offset once the instruction end is known.
    pub fn effective(&self, next_rip: u64) -> u64 {
        if self.rip_relative {
            self.offset.wrapping_add(next_rip)
        } else {
            self.offset & self.mask
        }
    }
}

/// The register-or-memory side of a ModR/M byte.
#[derive(Clone, Copy, Debug)]
pub enum RmOp {
    Reg(u8),
    Mem(MemRef),
}

/// A decoded ModR/M byte with its fully parsed addressing form.
#[derive(Clone, Copy, Debug)]
pub struct ModRm {
    /// The mod field (0..=3).
    pub modbits: u8,
    /// The reg field, extended by REX.R.
    pub reg: u8,
    /// The rm field, extended by REX.B for register forms.
    pub rm: u8,
    pub operand: RmOp,
}

impl ModRm {
    #[inline]
    pub fn is_memory(&self) -> bool {
        matches!(self.operand, RmOp::Mem(_))
    }
}

/// Decodes a ModR/M byte and any SIB/displacement bytes it requires, reading the base and
/// index registers from `state`.
pub fn decode_modrm(
    fetch: &mut InsnFetch,
    state: &CpuState,
    prefixes: &Prefixes,
) -> Result<ModRm, Fault> {
    let byte = fetch.next8()?;
    let modbits = byte >> 6;
    let rex = prefixes.rex.unwrap_or_default();
    let reg = (byte >> 3) & 0b111 | (rex.r as u8) << 3;
    let rm = byte & 0b111;

    if modbits == 0b11 {
        let rm = rm | (rex.b as u8) << 3;
        return Ok(ModRm {
            modbits,
            reg,
            rm,
            operand: RmOp::Reg(rm),
        });
    }

    let addr_size = prefixes.address_size(state);

    let mem = match addr_size {
        AddrSize::A16 => decode_ea16(fetch, state, prefixes, modbits, rm)?,
        _ => decode_ea32_64(fetch, state, prefixes, modbits, rm, addr_size)?,
    };

    Ok(ModRm {
        modbits,
        reg,
        rm: rm | (rex.b as u8) << 3,
        operand: RmOp::Mem(mem),
    })
}

fn override_or(prefixes: &Prefixes, default: SegmentRegister) -> SegmentRegister {
    prefixes.segment.unwrap_or(default)
}

fn decode_ea16(
    fetch: &mut InsnFetch,
    state: &CpuState,
    prefixes: &Prefixes,
    modbits: u8,
    rm: u8,
) -> Result<MemRef, Fault> {
    use crate::arch::x86_64::{RBP, RBX, RDI, RSI};

    let disp = match (modbits, rm) {
        (0, 6) => u64::from(fetch.next16()?),
        (1, _) => Size::Byte.sign_extend(u64::from(fetch.next8()?)),
        (2, _) => Size::Word.sign_extend(u64::from(fetch.next16()?)),
        _ => 0,
    };

    let (base, seg) = match rm {
        0 => (
            state.gpr64(RBX).wrapping_add(state.gpr64(RSI)),
            SegmentRegister::Ds,
        ),
        1 => (
            state.gpr64(RBX).wrapping_add(state.gpr64(RDI)),
            SegmentRegister::Ds,
        ),
        2 => (
            state.gpr64(RBP).wrapping_add(state.gpr64(RSI)),
            SegmentRegister::Ss,
        ),
        3 => (
            state.gpr64(RBP).wrapping_add(state.gpr64(RDI)),
            SegmentRegister::Ss,
        ),
        4 => (state.gpr64(RSI), SegmentRegister::Ds),
        5 => (state.gpr64(RDI), SegmentRegister::Ds),
        6 if modbits == 0 => (0, SegmentRegister::Ds),
        6 => (state.gpr64(RBP), SegmentRegister::Ss),
        _ => (state.gpr64(RBX), SegmentRegister::Ds),
    };

    Ok(MemRef {
        seg: override_or(prefixes, seg),
        offset: (base & 0xffff).wrapping_add(disp),
        rip_relative: false,
        mask: AddrSize::A16.mask(),
    })
}

fn decode_ea32_64(
    fetch: &mut InsnFetch,
    state: &CpuState,
    prefixes: &Prefixes,
    modbits: u8,
    rm: u8,
    addr_size: AddrSize,
) -> Result<MemRef, Fault> {
    let rex = prefixes.rex.unwrap_or_default();
    let mut seg = SegmentRegister::Ds;
    let mut offset: u64;
    let mut rip_relative = false;

    if rm == 0b100 {
        // SIB byte.
        let sib = fetch.next8()?;
        let scale = sib >> 6;
        let index = (sib >> 3) & 0b111 | (rex.x as u8) << 3;
        let base = sib & 0b111;

        offset = if index == 0b100 {
            // Encoding 100 without REX.X means "no index".
            0
        } else {
            state.gpr64(index) << scale
        };

        if base == 0b101 && modbits == 0 {
            offset = offset.wrapping_add(Size::Dword.sign_extend(u64::from(fetch.next32()?)));
        } else {
            let base = base | (rex.b as u8) << 3;

            if base & 0b111 == crate::arch::x86_64::RSP
                || base & 0b111 == crate::arch::x86_64::RBP
            {
                seg = SegmentRegister::Ss;
            }

            offset = offset.wrapping_add(state.gpr64(base));
        }
    } else if rm == 0b101 && modbits == 0 {
        let disp = Size::Dword.sign_extend(u64::from(fetch.next32()?));

        if addr_size == AddrSize::A64 {
            // RIP-relative: resolved against the next instruction once the decoder is done.
            offset = disp;
            rip_relative = true;
        } else {
            offset = disp;
        }
    } else {
        let base = rm | (rex.b as u8) << 3;

        if base & 0b111 == crate::arch::x86_64::RBP {
            seg = SegmentRegister::Ss;
        }

        offset = state.gpr64(base);
    }

    match modbits {
        1 => offset = offset.wrapping_add(Size::Byte.sign_extend(u64::from(fetch.next8()?))),
        2 => offset = offset.wrapping_add(Size::Dword.sign_extend(u64::from(fetch.next32()?))),
        _ => {}
    }

    Ok(MemRef {
        seg: override_or(prefixes, seg),
        offset,
        rip_relative,
        mask: addr_size.mask(),
    })
}

/// Resolves an 8-bit register encoding to its bank index and high-byte flag: without REX the
/// numbers 4..=7 name AH/CH/DH/BH, with any REX present they name SPL/BPL/SIL/DIL.
#[inline]
pub fn gpr8(index: u8, prefixes: &Prefixes) -> (u8, bool) {
    if !prefixes.has_rex() && (4..8).contains(&index) {
        (index - 4, true)
    } else {
        (index, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::{RAX, RBP, RBX, RSI};

    fn state32() -> CpuState {
        let mut state = CpuState::new();
        state.control.cr0 |= crate::arch::x86_64::CR0_PE;
        state.update_mode();

        let mut cs = crate::arch::x86_64::Segment::real_mode(0);
        cs.default = true;
        cs.segment_type = 0xa;
        cs.limit = 0xffff_ffff;
        state.segment_mut(SegmentRegister::Cs).cache = Some(cs);
        state
    }

    #[test]
    fn prefix_scan_collects_overrides() {
        let state = state32();
        let mut fetch = InsnFetch::from_bytes(&[0x66, 0x2e, 0xf3, 0xa5]);
        let (prefixes, opcode) = scan_prefixes(&state, &mut fetch).unwrap();

        assert_eq!(opcode, 0xa5);
        assert!(prefixes.operand_size_override);
        assert_eq!(prefixes.segment, Some(SegmentRegister::Cs));
        assert_eq!(prefixes.rep, Some(Rep::Rep));
        assert_eq!(prefixes.operand_size(&state), Size::Word);
    }

    #[test]
    fn rex_is_not_a_prefix_outside_long_mode() {
        let state = state32();
        let mut fetch = InsnFetch::from_bytes(&[0x48, 0x89, 0xd8]);
        let (prefixes, opcode) = scan_prefixes(&state, &mut fetch).unwrap();

        // 0x48 is DEC EAX in 32-bit code.
        assert_eq!(opcode, 0x48);
        assert!(!prefixes.has_rex());
    }

    #[test]
    fn modrm_register_form() {
        let state = state32();
        let mut fetch = InsnFetch::from_bytes(&[0xd8]);
        let modrm = decode_modrm(&mut fetch, &state, &Prefixes::default()).unwrap();

        assert_eq!(modrm.reg, RBX);
        assert!(matches!(modrm.operand, RmOp::Reg(RAX)));
    }

    #[test]
    fn modrm_sib_with_scaled_index() {
        let mut state = state32();
        state.set_gpr64(RBX, 0x1000);
        state.set_gpr64(RSI, 0x10);

        // mov eax, [ebx + esi*4 + 8]: ModRM 44, SIB B3, disp8 08.
        let mut fetch = InsnFetch::from_bytes(&[0x44, 0xb3, 0x08]);
        let modrm = decode_modrm(&mut fetch, &state, &Prefixes::default()).unwrap();

        let RmOp::Mem(mem) = modrm.operand else {
            panic!("expected a memory operand");
        };
        assert_eq!(mem.effective(0), 0x1048);
        assert_eq!(mem.seg, SegmentRegister::Ds);
    }

    #[test]
    fn bp_relative_addressing_defaults_to_ss() {
        let mut state = state32();
        state.set_gpr64(RBP, 0x8000);

        // [ebp + 4]: ModRM 45, disp8 04.
        let mut fetch = InsnFetch::from_bytes(&[0x45, 0x04]);
        let modrm = decode_modrm(&mut fetch, &state, &Prefixes::default()).unwrap();

        let RmOp::Mem(mem) = modrm.operand else {
            panic!("expected a memory operand");
        };
        assert_eq!(mem.seg, SegmentRegister::Ss);
        assert_eq!(mem.effective(0), 0x8004);
    }

    #[test]
    fn sixteen_bit_bx_si_form() {
        let mut state = CpuState::new();
        state.set_gpr64(RBX, 0x0100);
        state.set_gpr64(RSI, 0x0023);

        // [bx+si]: ModRM 00.
        let mut fetch = InsnFetch::from_bytes(&[0x00]);
        let modrm = decode_modrm(&mut fetch, &state, &Prefixes::default()).unwrap();

        let RmOp::Mem(mem) = modrm.operand else {
            panic!("expected a memory operand");
        };
        assert_eq!(mem.effective(0), 0x0123);
    }

    #[test]
    fn high_byte_registers_need_no_rex() {
        let none = Prefixes::default();
        assert_eq!(gpr8(4, &none), (0, true)); // AH
        assert_eq!(gpr8(7, &none), (3, true)); // BH

        let mut with_rex = Prefixes::default();
        with_rex.rex = Some(Rex::default());
        assert_eq!(gpr8(4, &with_rex), (4, false)); // SPL
        assert_eq!(gpr8(12, &with_rex), (12, false)); // R12B
    }
}
