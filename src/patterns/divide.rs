//! The 64-bit unsigned divide helper fast path.
//!
//! Compilers lower 64-bit division on 32-bit targets to a library call taking the dividend
//! in EDX:EAX, with the divisor and a remainder pointer on the stack. The fingerprint is
//! the helper's prologue: the four callee-saved pushes, the three stack-argument loads and
//! the cleared quotient accumulators. The closure performs the division directly, returns
//! the quotient in EDX:EAX, stores the 8-byte remainder through the pointer argument and
//! retires through the emulated RET.

use super::{
    ds_linear, mode_is_flat32, readable_range, ss_linear, writable_range, Compiled, Pattern, Run,
};
use crate::arch::x86_64::{Size, RAX, RBP, RBX, RCX, RDI, RDX, RSI, RSP};
use crate::exec::flags;
use crate::mem::Memory;
use crate::paging::{self, Access};
use crate::state::CpuState;
use log::debug;

const PROLOGUE: [u8; 20] = [
    0x55, // push ebp
    0x57, // push edi
    0x56, // push esi
    0x53, // push ebx
    0x8b, 0x74, 0x24, 0x14, // mov esi, [esp+0x14]  (divisor low)
    0x8b, 0x7c, 0x24, 0x18, // mov edi, [esp+0x18]  (divisor high)
    0x8b, 0x6c, 0x24, 0x1c, // mov ebp, [esp+0x1c]  (remainder pointer)
    0x31, 0xdb, // xor ebx, ebx
    0x31, 0xc9, // xor ecx, ecx
];

pub struct UdivModDi;

struct UdivModDiBody {
    rip: u64,
    logged: bool,
}

impl Pattern for UdivModDi {
    fn name(&self) -> &'static str {
        "udivmoddi"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        if window.get(..PROLOGUE.len())? != PROLOGUE {
            return None;
        }

        Some(Box::new(UdivModDiBody { rip, logged: false }))
    }
}

impl Compiled for UdivModDiBody {
    fn name(&self) -> &'static str {
        "udivmoddi"
    }

    fn run(&mut self, state: &mut CpuState, mem: &mut Memory) -> Run {
        if !mode_is_flat32(state) {
            return Run::Skip;
        }

        let esp = state.read_gpr(RSP, Size::Dword, false);
        let stack = ss_linear(state, esp);

        // Return address plus three arguments above ESP, four saved registers below.
        if !readable_range(state, mem, stack, 16)
            || !writable_range(state, mem, stack.wrapping_sub(16), 16)
        {
            return Run::Skip;
        }

        let user = state.cpl() == 3;
        let read_arg = |mem: &Memory, offset: u64| -> Option<u64> {
            let lin = stack.wrapping_add(offset) & paging::linear_mask(state);
            let phys = paging::probe(state, mem, lin, Access::Read, user)?;
            Some(u64::from(mem.read_phys32(phys)))
        };

        let Some(return_rip) = read_arg(mem, 0) else {
            return Run::Skip;
        };
        let Some(den_low) = read_arg(mem, 4) else {
            return Run::Skip;
        };
        let Some(den_high) = read_arg(mem, 8) else {
            return Run::Skip;
        };
        let Some(rem_ptr) = read_arg(mem, 12) else {
            return Run::Skip;
        };

        let divisor = den_high << 32 | den_low;

        if divisor == 0 {
            // The slow path runs the helper's own divide and takes the #DE there.
            return Run::Skip;
        }

        let rem_lin = ds_linear(state, rem_ptr);

        if !writable_range(state, mem, rem_lin, 8) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("udivmoddi first execution at {:#x}", self.rip);
        }

        let dividend = state.read_gpr(RDX, Size::Dword, false) << 32
            | state.read_gpr(RAX, Size::Dword, false);

        let quotient = dividend / divisor;
        let remainder = dividend % divisor;

        // The prologue's saved registers land below the entry stack pointer.
        let saves = [
            state.read_gpr(RBP, Size::Dword, false),
            state.read_gpr(RDI, Size::Dword, false),
            state.read_gpr(RSI, Size::Dword, false),
            state.read_gpr(RBX, Size::Dword, false),
        ];

        for (slot, value) in saves.iter().enumerate() {
            if paging::write_linear(
                state,
                mem,
                stack.wrapping_sub(4 + slot as u64 * 4),
                Size::Dword,
                *value,
                Access::Write,
            )
            .is_err()
            {
                return Run::Skip;
            }
        }

        if paging::write_linear(state, mem, rem_lin, Size::Qword, remainder, Access::Write)
            .is_err()
        {
            return Run::Skip;
        }

        state
            .write_gpr(RAX, Size::Dword, false, quotient & 0xffff_ffff);
        state.write_gpr(RDX, Size::Dword, false, quotient >> 32);
        state.write_gpr(RCX, Size::Dword, false, 0);

        // The helper's last flag-writing step is the final quotient-word move chain; the
        // chosen fixture is the ZSP image of the low quotient word with CF, OF and AF
        // clear.
        flags::logic(state, quotient & 0xffff_ffff, Size::Dword);

        // Plain RET: the caller owns the argument slots.
        state
            .write_gpr(RSP, Size::Dword, false, esp.wrapping_add(4));

        Run::Retired(return_rip & 0xffff_ffff)
    }
}
