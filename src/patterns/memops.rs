//! Bulk-memory fast paths: the forward and backward copy loops, the scan-and-copy strcpy
//! loop and the two compiler memset shapes.
//!
//! Each closure probes every page it would touch before the first write and keeps clear of
//! the observer and MMIO refusal zones; a failed probe skips back to the byte-at-a-time
//! interpreter. Committed accesses go through the ordinary linear path so paging sees the
//! same accessed/dirty traffic the slow loop would have produced.

use super::{
    ds_linear, es_linear, mode_is_flat32, readable_range, writable_range, Compiled, Pattern, Run,
};
use crate::arch::x86_64::{Rflags, Size, RAX, RBX, RCX, RDI, RDX, RSI};
use crate::exec::flags;
use crate::mem::Memory;
use crate::paging::{self, Access};
use crate::state::CpuState;
use log::debug;

/// Upper bound on a single accelerated transfer; anything larger skips.
const TRANSFER_CAP: u64 = 16 << 20;

/// The strcpy scan safety cap.
const STRCPY_CAP: u64 = 16 << 10;

fn byte_at(window: &[u8], index: usize) -> Option<u8> {
    window.get(index).copied()
}

/// Checks a rel8 at `window[index]`, encoded at `at` (relative to the window base),
/// against an expected absolute window offset.
fn rel8_targets(window: &[u8], index: usize, at: i64, expected: i64) -> Option<bool> {
    let rel = i64::from(byte_at(window, index)? as i8);
    Some(at + 2 + rel == expected)
}

// --- Memmove forward: 39 C7; 74 x; A4; EB x ---

pub struct MemmoveForward;

struct MemmoveForwardBody {
    rip: u64,
    exit: u64,
    logged: bool,
}

impl Pattern for MemmoveForward {
    fn name(&self) -> &'static str {
        "memmove-forward"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        if window.get(..2)? != [0x39, 0xc7] || byte_at(window, 2)? != 0x74 {
            return None;
        }

        if byte_at(window, 4)? != 0xa4 || byte_at(window, 5)? != 0xeb {
            return None;
        }

        // The back edge must re-enter at the compare and the exit must leave the loop.
        if !rel8_targets(window, 6, 5, 0)? || !rel8_targets(window, 3, 2, 7)? {
            return None;
        }

        Some(Box::new(MemmoveForwardBody {
            rip,
            exit: rip.wrapping_add(7),
            logged: false,
        }))
    }
}

impl Compiled for MemmoveForwardBody {
    fn name(&self) -> &'static str {
        "memmove-forward"
    }

    fn run(&mut self, state: &mut CpuState, mem: &mut Memory) -> Run {
        if !mode_is_flat32(state) || state.flag(Rflags::DF) {
            return Run::Skip;
        }

        let eax = state.read_gpr(RAX, Size::Dword, false);
        let edi = state.read_gpr(RDI, Size::Dword, false);
        let esi = state.read_gpr(RSI, Size::Dword, false);

        let count = eax.wrapping_sub(edi) & 0xffff_ffff;

        if count > TRANSFER_CAP {
            return Run::Skip;
        }

        let src = ds_linear(state, esi);
        let dst = es_linear(state, edi);

        if !readable_range(state, mem, src, count) || !writable_range(state, mem, dst, count) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("memmove-forward first execution at {:#x}", self.rip);
        }

        // Byte order matters for overlapping ranges; MOVSB reads then writes each byte in
        // ascending order.
        for i in 0..count {
            let Ok(byte) = paging::read_linear(
                state,
                mem,
                src.wrapping_add(i),
                Size::Byte,
                Access::Read,
            ) else {
                return Run::Skip;
            };

            if paging::write_linear(
                state,
                mem,
                dst.wrapping_add(i),
                Size::Byte,
                byte,
                Access::Write,
            )
            .is_err()
            {
                return Run::Skip;
            }
        }

        state.write_gpr(RSI, Size::Dword, false, esi.wrapping_add(count));
        state.write_gpr(RDI, Size::Dword, false, eax);

        // The loop leaves through CMP EDI,EAX finding equality.
        flags::sub(state, eax, eax, Size::Dword);

        Run::Retired(self.exit)
    }
}

// --- Memmove backward: 83 E9 01; 72 x; 8A 14 0E; 88 14 08; EB x ---

pub struct MemmoveBackward;

struct MemmoveBackwardBody {
    rip: u64,
    exit: u64,
    logged: bool,
}

impl Pattern for MemmoveBackward {
    fn name(&self) -> &'static str {
        "memmove-backward"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        if window.get(..3)? != [0x83, 0xe9, 0x01] || byte_at(window, 3)? != 0x72 {
            return None;
        }

        if window.get(5..8)? != [0x8a, 0x14, 0x0e] || window.get(8..11)? != [0x88, 0x14, 0x08] {
            return None;
        }

        if byte_at(window, 11)? != 0xeb {
            return None;
        }

        if !rel8_targets(window, 12, 11, 0)? || !rel8_targets(window, 4, 3, 13)? {
            return None;
        }

        Some(Box::new(MemmoveBackwardBody {
            rip,
            exit: rip.wrapping_add(13),
            logged: false,
        }))
    }
}

impl Compiled for MemmoveBackwardBody {
    fn name(&self) -> &'static str {
        "memmove-backward"
    }

    fn run(&mut self, state: &mut CpuState, mem: &mut Memory) -> Run {
        if !mode_is_flat32(state) {
            return Run::Skip;
        }

        let count = state.read_gpr(RCX, Size::Dword, false);

        if count > TRANSFER_CAP {
            return Run::Skip;
        }

        let esi = state.read_gpr(RSI, Size::Dword, false);
        let eax = state.read_gpr(RAX, Size::Dword, false);

        let src = ds_linear(state, esi);
        let dst = ds_linear(state, eax);

        if !readable_range(state, mem, src, count) || !writable_range(state, mem, dst, count) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("memmove-backward first execution at {:#x}", self.rip);
        }

        // Descending copy, one byte per loop iteration; DL holds the last byte moved,
        // which is the one at the lowest address.
        for i in (0..count).rev() {
            let Ok(byte) = paging::read_linear(
                state,
                mem,
                src.wrapping_add(i),
                Size::Byte,
                Access::Read,
            ) else {
                return Run::Skip;
            };

            if paging::write_linear(
                state,
                mem,
                dst.wrapping_add(i),
                Size::Byte,
                byte,
                Access::Write,
            )
            .is_err()
            {
                return Run::Skip;
            }

            if i == 0 {
                state.write_gpr(RDX, Size::Byte, false, byte);
            }
        }

        // The loop leaves through SUB ECX,1 underflowing from zero.
        let underflow = flags::sub(state, 0, 1, Size::Dword);
        state.write_gpr(RCX, Size::Dword, false, underflow);

        Run::Retired(self.exit)
    }
}

// --- strcpy: 8A 1C 11; 88 1C 10; 42; 84 DB; 75 F5 ---

pub struct Strcpy;

struct StrcpyBody {
    rip: u64,
    exit: u64,
    logged: bool,
}

impl Pattern for Strcpy {
    fn name(&self) -> &'static str {
        "strcpy"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        if window.get(..3)? != [0x8a, 0x1c, 0x11] || window.get(3..6)? != [0x88, 0x1c, 0x10] {
            return None;
        }

        if byte_at(window, 6)? != 0x42 || window.get(7..9)? != [0x84, 0xdb] {
            return None;
        }

        if byte_at(window, 9)? != 0x75 || !rel8_targets(window, 10, 9, 0)? {
            return None;
        }

        Some(Box::new(StrcpyBody {
            rip,
            exit: rip.wrapping_add(11),
            logged: false,
        }))
    }
}

impl Compiled for StrcpyBody {
    fn name(&self) -> &'static str {
        "strcpy"
    }

    fn run(&mut self, state: &mut CpuState, mem: &mut Memory) -> Run {
        if !mode_is_flat32(state) {
            return Run::Skip;
        }

        let ecx = state.read_gpr(RCX, Size::Dword, false);
        let eax = state.read_gpr(RAX, Size::Dword, false);
        let edx = state.read_gpr(RDX, Size::Dword, false);

        let src = ds_linear(state, ecx.wrapping_add(edx));
        let dst = ds_linear(state, eax.wrapping_add(edx));

        // The pre-scan below assumes the copy cannot rewrite its own source.
        let distance = src.abs_diff(dst);

        if distance < STRCPY_CAP {
            return Run::Skip;
        }

        if !readable_range(state, mem, src, STRCPY_CAP) {
            return Run::Skip;
        }

        // Scan for the terminator within the safety cap, side-effect free.
        let user = state.cpl() == 3;
        let mut len = None;

        for i in 0..STRCPY_CAP {
            let Some(phys) = paging::probe(
                state,
                mem,
                src.wrapping_add(i) & paging::linear_mask(state),
                Access::Read,
                user,
            ) else {
                return Run::Skip;
            };

            if mem.read_phys8(phys) == 0 {
                len = Some(i + 1);
                break;
            }
        }

        let Some(len) = len else {
            return Run::Skip;
        };

        if !writable_range(state, mem, dst, len) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("strcpy first execution at {:#x}", self.rip);
        }

        for i in 0..len {
            let Ok(byte) = paging::read_linear(
                state,
                mem,
                src.wrapping_add(i),
                Size::Byte,
                Access::Read,
            ) else {
                return Run::Skip;
            };

            if paging::write_linear(
                state,
                mem,
                dst.wrapping_add(i),
                Size::Byte,
                byte,
                Access::Write,
            )
            .is_err()
            {
                return Run::Skip;
            }
        }

        state
            .write_gpr(RDX, Size::Dword, false, edx.wrapping_add(len) & 0xffff_ffff);
        state.write_gpr(RBX, Size::Byte, false, 0);

        // The loop leaves through TEST BL,BL on the copied terminator.
        flags::logic(state, 0, Size::Byte);

        Run::Retired(self.exit)
    }
}

// --- memset, dword body with byte tail ---
// 89 D1; C1 E9 02; F3 AB; 89 D1; 83 E1 03; F3 AA

pub struct MemsetDword;

struct MemsetDwordBody {
    rip: u64,
    exit: u64,
    logged: bool,
}

impl Pattern for MemsetDword {
    fn name(&self) -> &'static str {
        "memset-dword"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        let fingerprint = [
            0x89, 0xd1, 0xc1, 0xe9, 0x02, 0xf3, 0xab, 0x89, 0xd1, 0x83, 0xe1, 0x03, 0xf3, 0xaa,
        ];

        if window.get(..fingerprint.len())? != fingerprint {
            return None;
        }

        Some(Box::new(MemsetDwordBody {
            rip,
            exit: rip.wrapping_add(fingerprint.len() as u64),
            logged: false,
        }))
    }
}

impl Compiled for MemsetDwordBody {
    fn name(&self) -> &'static str {
        "memset-dword"
    }

    fn run(&mut self, state: &mut CpuState, mem: &mut Memory) -> Run {
        if !mode_is_flat32(state) || state.flag(Rflags::DF) {
            return Run::Skip;
        }

        let count = state.read_gpr(RDX, Size::Dword, false);

        if count > TRANSFER_CAP {
            return Run::Skip;
        }

        let edi = state.read_gpr(RDI, Size::Dword, false);
        let eax = state.read_gpr(RAX, Size::Dword, false);
        let dst = es_linear(state, edi);

        if !writable_range(state, mem, dst, count) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("memset-dword first execution at {:#x}", self.rip);
        }

        let dwords = count / 4;
        let tail = count & 3;

        for i in 0..dwords {
            if paging::write_linear(
                state,
                mem,
                dst.wrapping_add(i * 4),
                Size::Dword,
                eax,
                Access::Write,
            )
            .is_err()
            {
                return Run::Skip;
            }
        }

        for i in 0..tail {
            if paging::write_linear(
                state,
                mem,
                dst.wrapping_add(dwords * 4 + i),
                Size::Byte,
                eax & 0xff,
                Access::Write,
            )
            .is_err()
            {
                return Run::Skip;
            }
        }

        state.write_gpr(RDI, Size::Dword, false, edi.wrapping_add(count));
        state.write_gpr(RCX, Size::Dword, false, 0);

        // The epilogue flags come from AND ECX,3 on the original count.
        flags::logic(state, count & 3, Size::Dword);

        Run::Retired(self.exit)
    }
}

// --- memset, interior byte-pair loop: AA; E2 FD ---

pub struct MemsetPair;

struct MemsetPairBody {
    rip: u64,
    exit: u64,
    logged: bool,
}

impl Pattern for MemsetPair {
    fn name(&self) -> &'static str {
        "memset-pair"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        if byte_at(window, 0)? != 0xaa || byte_at(window, 1)? != 0xe2 {
            return None;
        }

        // LOOP must re-enter at the STOSB.
        if !rel8_targets(window, 2, 1, 0)? {
            return None;
        }

        Some(Box::new(MemsetPairBody {
            rip,
            exit: rip.wrapping_add(3),
            logged: false,
        }))
    }
}

impl Compiled for MemsetPairBody {
    fn name(&self) -> &'static str {
        "memset-pair"
    }

    fn run(&mut self, state: &mut CpuState, mem: &mut Memory) -> Run {
        if !mode_is_flat32(state) || state.flag(Rflags::DF) {
            return Run::Skip;
        }

        let count = state.read_gpr(RCX, Size::Dword, false);

        // LOOP decrements before testing: a zero count would run the full 2^32 wrap.
        if count == 0 || count > TRANSFER_CAP {
            return Run::Skip;
        }

        let edi = state.read_gpr(RDI, Size::Dword, false);
        let al = state.read_gpr(RAX, Size::Byte, false);
        let dst = es_linear(state, edi);

        if !writable_range(state, mem, dst, count) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("memset-pair first execution at {:#x}", self.rip);
        }

        for i in 0..count {
            if paging::write_linear(
                state,
                mem,
                dst.wrapping_add(i),
                Size::Byte,
                al,
                Access::Write,
            )
            .is_err()
            {
                return Run::Skip;
            }
        }

        state.write_gpr(RDI, Size::Dword, false, edi.wrapping_add(count));
        state.write_gpr(RCX, Size::Dword, false, 0);

        // STOSB and LOOP leave every flag untouched.
        Run::Retired(self.exit)
    }
}
