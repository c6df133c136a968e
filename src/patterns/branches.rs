//! Register-only fast paths: fused compare-and-branch, carry-chain addition, 64-bit
//! double-register shifts, counter preludes and the bare carry-check branch.
//!
//! These closures touch no memory, so their only runtime precondition is the flat 32-bit
//! execution environment they were compiled against.

use super::{mode_is_flat32, Compiled, Pattern, Run};
use crate::arch::x86_64::{Size, RCX, RDI, RSI};
use crate::exec::flags;
use crate::mem::Memory;
use crate::state::CpuState;
use log::debug;

/// Splits a register-form ModR/M byte into (rm, reg); `None` for memory forms.
fn reg_form(byte: u8) -> Option<(u8, u8)> {
    if byte >> 6 == 0b11 {
        Some((byte & 0x7, byte >> 3 & 0x7))
    } else {
        None
    }
}

/// Parses the conditional branch that terminates several fingerprints: `7x rel8` or
/// `0F 8x rel32`. Returns (condition, branch length, target, fall-through), with targets
/// relative to `branch_rip`.
fn parse_jcc(window: &[u8], branch_rip: u64) -> Option<(u8, u64, u64, u64)> {
    match window.first()? {
        byte @ 0x70..=0x7f => {
            let rel = Size::Byte.sign_extend(u64::from(*window.get(1)?));
            let fall = branch_rip.wrapping_add(2);
            Some((byte & 0xf, 2, fall.wrapping_add(rel) & 0xffff_ffff, fall))
        }
        0x0f => {
            let byte = *window.get(1)?;

            if !(0x80..=0x8f).contains(&byte) {
                return None;
            }

            let rel = u32::from_le_bytes([
                *window.get(2)?,
                *window.get(3)?,
                *window.get(4)?,
                *window.get(5)?,
            ]);
            let rel = Size::Dword.sign_extend(u64::from(rel));
            let fall = branch_rip.wrapping_add(6);
            Some((byte & 0xf, 6, fall.wrapping_add(rel) & 0xffff_ffff, fall))
        }
        _ => None,
    }
}

// --- CMP + Jcc ---

pub struct CmpJcc;

struct CmpJccBody {
    rip: u64,
    // (a, b) register numbers for the a - b comparison.
    a: u8,
    b: u8,
    cc: u8,
    target: u64,
    fall: u64,
    logged: bool,
}

impl Pattern for CmpJcc {
    fn name(&self) -> &'static str {
        "cmp-jcc"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        let opcode = *window.first()?;

        if opcode != 0x39 && opcode != 0x3b {
            return None;
        }

        let (rm, reg) = reg_form(*window.get(1)?)?;
        let (a, b) = if opcode == 0x39 { (rm, reg) } else { (reg, rm) };

        let (cc, _, target, fall) = parse_jcc(window.get(2..)?, rip.wrapping_add(2))?;

        Some(Box::new(CmpJccBody {
            rip,
            a,
            b,
            cc,
            target,
            fall,
            logged: false,
        }))
    }
}

impl Compiled for CmpJccBody {
    fn name(&self) -> &'static str {
        "cmp-jcc"
    }

    fn run(&mut self, state: &mut CpuState, _mem: &mut Memory) -> Run {
        if !mode_is_flat32(state) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("cmp-jcc first execution at {:#x}", self.rip);
        }

        let a = state.read_gpr(self.a, Size::Dword, false);
        let b = state.read_gpr(self.b, Size::Dword, false);
        flags::sub(state, a, b, Size::Dword);

        if flags::condition(state, self.cc) {
            Run::Retired(self.target)
        } else {
            Run::Retired(self.fall)
        }
    }
}

// --- ADD + ADC (64-bit low+carry addition) ---

pub struct AddAdc;

struct AddAdcBody {
    rip: u64,
    low: (u8, u8),
    high: (u8, u8),
    logged: bool,
}

impl Pattern for AddAdc {
    fn name(&self) -> &'static str {
        "add-adc"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        if *window.first()? != 0x01 || *window.get(2)? != 0x11 {
            return None;
        }

        let low = reg_form(*window.get(1)?)?;
        let high = reg_form(*window.get(3)?)?;

        Some(Box::new(AddAdcBody {
            rip,
            low,
            high,
            logged: false,
        }))
    }
}

impl Compiled for AddAdcBody {
    fn name(&self) -> &'static str {
        "add-adc"
    }

    fn run(&mut self, state: &mut CpuState, _mem: &mut Memory) -> Run {
        if !mode_is_flat32(state) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("add-adc first execution at {:#x}", self.rip);
        }

        let (rm, reg) = self.low;
        let a = state.read_gpr(rm, Size::Dword, false);
        let b = state.read_gpr(reg, Size::Dword, false);
        let sum = flags::add(state, a, b, Size::Dword);
        state.write_gpr(rm, Size::Dword, false, sum);

        let (rm, reg) = self.high;
        let a = state.read_gpr(rm, Size::Dword, false);
        let b = state.read_gpr(reg, Size::Dword, false);
        let sum = flags::adc(state, a, b, Size::Dword);
        state.write_gpr(rm, Size::Dword, false, sum);

        Run::Retired(self.rip.wrapping_add(4))
    }
}

// --- SHRD/SHLD + companion shift (64-bit shift in two registers) ---

pub struct Shift64;

struct Shift64Body {
    rip: u64,
    left: bool,
    low: (u8, u8),
    second_kind: u8,
    second_rm: u8,
    logged: bool,
}

impl Pattern for Shift64 {
    fn name(&self) -> &'static str {
        "shift64"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        if *window.first()? != 0x0f {
            return None;
        }

        let left = match *window.get(1)? {
            0xa5 => true,
            0xad => false,
            _ => return None,
        };

        let low = reg_form(*window.get(2)?)?;

        if *window.get(3)? != 0xd3 {
            return None;
        }

        let (second_rm, second_kind) = reg_form(*window.get(4)?)?;

        // SHL, SHR or ROL on the companion register.
        if !matches!(second_kind, 0 | 4 | 5) {
            return None;
        }

        Some(Box::new(Shift64Body {
            rip,
            left,
            low,
            second_kind,
            second_rm,
            logged: false,
        }))
    }
}

impl Compiled for Shift64Body {
    fn name(&self) -> &'static str {
        "shift64"
    }

    fn run(&mut self, state: &mut CpuState, _mem: &mut Memory) -> Run {
        if !mode_is_flat32(state) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("shift64 first execution at {:#x}", self.rip);
        }

        let count = state.read_gpr(RCX, Size::Byte, false);

        let (rm, reg) = self.low;
        let dest = state.read_gpr(rm, Size::Dword, false);
        let fill = state.read_gpr(reg, Size::Dword, false);

        let combined = if self.left {
            flags::shld(state, dest, fill, count, Size::Dword)
        } else {
            flags::shrd(state, dest, fill, count, Size::Dword)
        };
        state.write_gpr(rm, Size::Dword, false, combined);

        let value = state.read_gpr(self.second_rm, Size::Dword, false);
        let result = match self.second_kind {
            0 => flags::rol(state, value, count, Size::Dword),
            4 => flags::shl(state, value, count, Size::Dword),
            _ => flags::shr(state, value, count, Size::Dword),
        };
        state.write_gpr(self.second_rm, Size::Dword, false, result);

        Run::Retired(self.rip.wrapping_add(5))
    }
}

// --- INC ECX + CMP prelude ---

pub struct IncCmp;

struct IncCmpBody {
    rip: u64,
    cmp: (u8, u8),
    logged: bool,
}

impl Pattern for IncCmp {
    fn name(&self) -> &'static str {
        "inc-cmp"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        if *window.first()? != 0x41 || *window.get(1)? != 0x39 {
            return None;
        }

        let cmp = reg_form(*window.get(2)?)?;

        Some(Box::new(IncCmpBody {
            rip,
            cmp,
            logged: false,
        }))
    }
}

impl Compiled for IncCmpBody {
    fn name(&self) -> &'static str {
        "inc-cmp"
    }

    fn run(&mut self, state: &mut CpuState, _mem: &mut Memory) -> Run {
        if !mode_is_flat32(state) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("inc-cmp first execution at {:#x}", self.rip);
        }

        let count = state.read_gpr(RCX, Size::Dword, false);
        let count = flags::inc(state, count, Size::Dword);
        state.write_gpr(RCX, Size::Dword, false, count);

        let (rm, reg) = self.cmp;
        let a = state.read_gpr(rm, Size::Dword, false);
        let b = state.read_gpr(reg, Size::Dword, false);
        flags::sub(state, a, b, Size::Dword);

        Run::Retired(self.rip.wrapping_add(3))
    }
}

// --- TEST ESI,ESI + JNS (shift-left loop skeleton) ---

pub struct TestJns;

struct TestJnsBody {
    rip: u64,
    target: u64,
    fall: u64,
    logged: bool,
}

impl Pattern for TestJns {
    fn name(&self) -> &'static str {
        "test-jns"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        if window.get(..2)? != [0x85, 0xf6] {
            return None;
        }

        let (cc, _, target, fall) = parse_jcc(window.get(2..)?, rip.wrapping_add(2))?;

        // JNS only; anything else belongs to the generic compare patterns.
        if cc != 0x9 {
            return None;
        }

        Some(Box::new(TestJnsBody {
            rip,
            target,
            fall,
            logged: false,
        }))
    }
}

impl Compiled for TestJnsBody {
    fn name(&self) -> &'static str {
        "test-jns"
    }

    fn run(&mut self, state: &mut CpuState, _mem: &mut Memory) -> Run {
        if !mode_is_flat32(state) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("test-jns first execution at {:#x}", self.rip);
        }

        let esi = state.read_gpr(RSI, Size::Dword, false);
        flags::logic(state, esi, Size::Dword);

        if flags::condition(state, 0x9) {
            Run::Retired(self.target)
        } else {
            Run::Retired(self.fall)
        }
    }
}

// --- CMP ESI,EDI + JA (shift-right loop skeleton) ---

pub struct CmpJa;

struct CmpJaBody {
    rip: u64,
    target: u64,
    fall: u64,
    logged: bool,
}

impl Pattern for CmpJa {
    fn name(&self) -> &'static str {
        "cmp-ja"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        if window.get(..2)? != [0x39, 0xfe] {
            return None;
        }

        let (cc, _, target, fall) = parse_jcc(window.get(2..)?, rip.wrapping_add(2))?;

        if cc != 0x7 {
            return None;
        }

        Some(Box::new(CmpJaBody {
            rip,
            target,
            fall,
            logged: false,
        }))
    }
}

impl Compiled for CmpJaBody {
    fn name(&self) -> &'static str {
        "cmp-ja"
    }

    fn run(&mut self, state: &mut CpuState, _mem: &mut Memory) -> Run {
        if !mode_is_flat32(state) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("cmp-ja first execution at {:#x}", self.rip);
        }

        let esi = state.read_gpr(RSI, Size::Dword, false);
        let edi = state.read_gpr(RDI, Size::Dword, false);
        flags::sub(state, esi, edi, Size::Dword);

        if flags::condition(state, 0x7) {
            Run::Retired(self.target)
        } else {
            Run::Retired(self.fall)
        }
    }
}

// --- Bare JC rel8 (carry-check loop skeleton) ---

pub struct CarryLoop;

struct CarryLoopBody {
    rip: u64,
    target: u64,
    fall: u64,
    logged: bool,
}

impl Pattern for CarryLoop {
    fn name(&self) -> &'static str {
        "carry-loop"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        if *window.first()? != 0x72 {
            return None;
        }

        let rel = Size::Byte.sign_extend(u64::from(*window.get(1)?));
        let fall = rip.wrapping_add(2);

        Some(Box::new(CarryLoopBody {
            rip,
            target: fall.wrapping_add(rel) & 0xffff_ffff,
            fall,
            logged: false,
        }))
    }
}

impl Compiled for CarryLoopBody {
    fn name(&self) -> &'static str {
        "carry-loop"
    }

    fn run(&mut self, state: &mut CpuState, _mem: &mut Memory) -> Run {
        if !mode_is_flat32(state) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("carry-loop first execution at {:#x}", self.rip);
        }

        if state.flag(crate::arch::x86_64::Rflags::CF) {
            Run::Retired(self.target)
        } else {
            Run::Retired(self.fall)
        }
    }
}
