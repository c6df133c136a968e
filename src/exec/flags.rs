//! Arithmetic flag semantics.
//!
//! Every ALU handler and every pattern closure computes results and flags through these
//! helpers, so an accelerated sequence can never drift from the byte-at-a-time interpreter.

use crate::arch::x86_64::{Rflags, Size};
use crate::state::CpuState;

#[inline]
fn aux_carry(a: u64, b: u64, result: u64) -> bool {
    (a ^ b ^ result) & 0x10 != 0
}

/// ADD: sets CF, OF, AF and the ZSP group, returns the truncated sum.
pub fn add(state: &mut CpuState, a: u64, b: u64, size: Size) -> u64 {
    let (a, b) = (size.truncate(a), size.truncate(b));
    let result = size.truncate(a.wrapping_add(b));

    state.set_flag(Rflags::CF, result < a);
    state.set_flag(Rflags::AF, aux_carry(a, b, result));
    state.set_flag(
        Rflags::OF,
        (a ^ result) & (b ^ result) & size.sign_bit() != 0,
    );
    state.update_zsp(result, size);
    result
}

/// ADC: ADD with the incoming carry folded in.
pub fn adc(state: &mut CpuState, a: u64, b: u64, size: Size) -> u64 {
    let carry = state.flag(Rflags::CF) as u64;
    let (a, b) = (size.truncate(a), size.truncate(b));
    let result = size.truncate(a.wrapping_add(b).wrapping_add(carry));

    state.set_flag(
        Rflags::CF,
        if carry != 0 { result <= a } else { result < a },
    );
    state.set_flag(Rflags::AF, aux_carry(a, b, result));
    state.set_flag(
        Rflags::OF,
        (a ^ result) & (b ^ result) & size.sign_bit() != 0,
    );
    state.update_zsp(result, size);
    result
}

/// SUB/CMP: sets CF (borrow), OF, AF and the ZSP group, returns the truncated difference.
pub fn sub(state: &mut CpuState, a: u64, b: u64, size: Size) -> u64 {
    let (a, b) = (size.truncate(a), size.truncate(b));
    let result = size.truncate(a.wrapping_sub(b));

    state.set_flag(Rflags::CF, a < b);
    state.set_flag(Rflags::AF, aux_carry(a, b, result));
    state.set_flag(Rflags::OF, (a ^ b) & (a ^ result) & size.sign_bit() != 0);
    state.update_zsp(result, size);
    result
}

/// SBB: SUB with the incoming borrow folded in.
pub fn sbb(state: &mut CpuState, a: u64, b: u64, size: Size) -> u64 {
    let carry = state.flag(Rflags::CF) as u64;
    let (a, b) = (size.truncate(a), size.truncate(b));
    let result = size.truncate(a.wrapping_sub(b).wrapping_sub(carry));

    state.set_flag(Rflags::CF, (a as u128) < (b as u128 + carry as u128));
    state.set_flag(Rflags::AF, aux_carry(a, b, result));
    state.set_flag(Rflags::OF, (a ^ b) & (a ^ result) & size.sign_bit() != 0);
    state.update_zsp(result, size);
    result
}

/// AND/OR/XOR/TEST share this: CF and OF cleared, AF cleared (the deterministic stand-in
/// for its architecturally undefined value), ZSP from the result.
pub fn logic(state: &mut CpuState, result: u64, size: Size) -> u64 {
    let result = size.truncate(result);
    state.set_flag(Rflags::CF, false);
    state.set_flag(Rflags::OF, false);
    state.set_flag(Rflags::AF, false);
    state.update_zsp(result, size);
    result
}

/// INC: like ADD 1 but CF is preserved.
pub fn inc(state: &mut CpuState, a: u64, size: Size) -> u64 {
    let a = size.truncate(a);
    let result = size.truncate(a.wrapping_add(1));

    state.set_flag(Rflags::AF, aux_carry(a, 1, result));
    state.set_flag(Rflags::OF, result == size.sign_bit());
    state.update_zsp(result, size);
    result
}

/// DEC: like SUB 1 but CF is preserved.
pub fn dec(state: &mut CpuState, a: u64, size: Size) -> u64 {
    let a = size.truncate(a);
    let result = size.truncate(a.wrapping_sub(1));

    state.set_flag(Rflags::AF, aux_carry(a, 1, result));
    state.set_flag(Rflags::OF, a == size.sign_bit());
    state.update_zsp(result, size);
    result
}

/// NEG: subtraction from zero; CF is set for any nonzero operand.
pub fn neg(state: &mut CpuState, a: u64, size: Size) -> u64 {
    let a = size.truncate(a);
    let result = size.truncate(0u64.wrapping_sub(a));

    state.set_flag(Rflags::CF, a != 0);
    state.set_flag(Rflags::AF, aux_carry(0, a, result));
    state.set_flag(Rflags::OF, a == size.sign_bit());
    state.update_zsp(result, size);
    result
}

/// The architectural shift-count mask: 5 bits below 64-bit operands, 6 bits at 64.
#[inline]
pub fn shift_mask(size: Size) -> u64 {
    match size {
        Size::Qword => 0x3f,
        _ => 0x1f,
    }
}

/// SHL. A masked count of zero changes nothing, including the flags.
pub fn shl(state: &mut CpuState, a: u64, count: u64, size: Size) -> u64 {
    let count = count & shift_mask(size);

    if count == 0 {
        return size.truncate(a);
    }

    let a = size.truncate(a);
    let bits = size.bits() as u64;
    let result = if count >= bits {
        0
    } else {
        size.truncate(a << count)
    };
    let carry = count <= bits && a & (1u64.checked_shl((bits - count) as u32).unwrap_or(0)) != 0;

    state.set_flag(Rflags::CF, carry);
    state.set_flag(
        Rflags::OF,
        (result & size.sign_bit() != 0) != state.flag(Rflags::CF),
    );
    state.update_zsp(result, size);
    result
}

/// SHR.
pub fn shr(state: &mut CpuState, a: u64, count: u64, size: Size) -> u64 {
    let count = count & shift_mask(size);

    if count == 0 {
        return size.truncate(a);
    }

    let a = size.truncate(a);
    let result = if count >= size.bits() as u64 {
        0
    } else {
        a >> count
    };

    state.set_flag(Rflags::CF, (a >> (count - 1)) & 1 != 0);
    state.set_flag(Rflags::OF, a & size.sign_bit() != 0);
    state.update_zsp(result, size);
    result
}

/// SAR.
pub fn sar(state: &mut CpuState, a: u64, count: u64, size: Size) -> u64 {
    let count = count & shift_mask(size);

    if count == 0 {
        return size.truncate(a);
    }

    let a = size.sign_extend(a) as i64;
    let result = size.truncate((a >> count.min(63)) as u64);

    state.set_flag(
        Rflags::CF,
        (a >> (count - 1).min(63)) & 1 != 0,
    );
    state.set_flag(Rflags::OF, false);
    state.update_zsp(result, size);
    result
}

/// ROL: only CF and OF are affected, never the ZSP group. A fully masked-out count leaves
/// even those untouched.
pub fn rol(state: &mut CpuState, a: u64, count: u64, size: Size) -> u64 {
    let masked = count & shift_mask(size);
    let a = size.truncate(a);

    if masked == 0 {
        return a;
    }

    let bits = size.bits() as u64;
    let count = masked % bits;
    let result = if count == 0 {
        a
    } else {
        size.truncate(a << count | a >> (bits - count))
    };

    state.set_flag(Rflags::CF, result & 1 != 0);
    state.set_flag(
        Rflags::OF,
        (result & size.sign_bit() != 0) != (result & 1 != 0),
    );
    result
}

/// ROR.
pub fn ror(state: &mut CpuState, a: u64, count: u64, size: Size) -> u64 {
    let masked = count & shift_mask(size);
    let a = size.truncate(a);

    if masked == 0 {
        return a;
    }

    let bits = size.bits() as u64;
    let count = masked % bits;
    let result = if count == 0 {
        a
    } else {
        size.truncate(a >> count | a << (bits - count))
    };

    state.set_flag(Rflags::CF, result & size.sign_bit() != 0);
    state.set_flag(
        Rflags::OF,
        (result & size.sign_bit() != 0) != (result & (size.sign_bit() >> 1) != 0),
    );
    result
}

/// RCL: rotate through carry. The count wraps modulo width+1.
pub fn rcl(state: &mut CpuState, a: u64, count: u64, size: Size) -> u64 {
    let bits = size.bits() as u64;
    let count = (count & shift_mask(size)) % (bits + 1);

    if count == 0 {
        return size.truncate(a);
    }

    let mut value = size.truncate(a);
    let mut carry = state.flag(Rflags::CF) as u64;

    for _ in 0..count {
        let out = (value & size.sign_bit() != 0) as u64;
        value = size.truncate(value << 1 | carry);
        carry = out;
    }

    state.set_flag(Rflags::CF, carry != 0);
    state.set_flag(
        Rflags::OF,
        (value & size.sign_bit() != 0) != (carry != 0),
    );
    value
}

/// RCR.
pub fn rcr(state: &mut CpuState, a: u64, count: u64, size: Size) -> u64 {
    let bits = size.bits() as u64;
    let count = (count & shift_mask(size)) % (bits + 1);

    if count == 0 {
        return size.truncate(a);
    }

    let mut value = size.truncate(a);
    let mut carry = state.flag(Rflags::CF) as u64;

    for _ in 0..count {
        let out = value & 1;
        value = size.truncate(value >> 1 | carry << (bits - 1));
        carry = out;
    }

    state.set_flag(Rflags::CF, carry != 0);
    state.set_flag(
        Rflags::OF,
        (value & size.sign_bit() != 0) != (value & (size.sign_bit() >> 1) != 0),
    );
    value
}

/// SHLD: shift `a` left, filling from the top of `b`. Counts past the operand width take
/// the double-width fixture behaviour pinned by the shift test suite.
pub fn shld(state: &mut CpuState, a: u64, b: u64, count: u64, size: Size) -> u64 {
    let count = count & shift_mask(size);

    if count == 0 {
        return size.truncate(a);
    }

    let bits = size.bits() as u64;
    let combined = (u128::from(size.truncate(a)) << bits) | u128::from(size.truncate(b));
    let shifted = combined << count;
    let result = size.truncate((shifted >> bits) as u64);

    state.set_flag(Rflags::CF, shifted >> (2 * bits) & 1 != 0);
    state.set_flag(
        Rflags::OF,
        (result & size.sign_bit() != 0) != (size.truncate(a) & size.sign_bit() != 0),
    );
    state.update_zsp(result, size);
    result
}

/// SHRD: shift `a` right, filling from the bottom of `b`.
pub fn shrd(state: &mut CpuState, a: u64, b: u64, count: u64, size: Size) -> u64 {
    let count = count & shift_mask(size);

    if count == 0 {
        return size.truncate(a);
    }

    let bits = size.bits() as u64;
    let combined = (u128::from(size.truncate(b)) << bits) | u128::from(size.truncate(a));
    let result = size.truncate((combined >> count) as u64);

    state.set_flag(Rflags::CF, combined >> (count - 1) & 1 != 0);
    state.set_flag(
        Rflags::OF,
        (result & size.sign_bit() != 0) != (size.truncate(a) & size.sign_bit() != 0),
    );
    state.update_zsp(result, size);
    result
}

/// Two-operand IMUL: CF and OF are set when the full signed product does not fit the
/// destination width. ZSP is set from the truncated result as a deterministic stand-in.
pub fn imul2(state: &mut CpuState, a: u64, b: u64, size: Size) -> u64 {
    let a = size.sign_extend(a) as i64 as i128;
    let b = size.sign_extend(b) as i64 as i128;
    let full = a * b;
    let result = size.truncate(full as u64);
    let fits = size.sign_extend(result) as i64 as i128 == full;

    state.set_flag(Rflags::CF, !fits);
    state.set_flag(Rflags::OF, !fits);
    state.update_zsp(result, size);
    result
}

/// Evaluates a condition code from the low nibble of a Jcc/SETcc/CMOVcc opcode.
pub fn condition(state: &CpuState, cc: u8) -> bool {
    let cf = state.flag(Rflags::CF);
    let zf = state.flag(Rflags::ZF);
    let sf = state.flag(Rflags::SF);
    let of = state.flag(Rflags::OF);
    let pf = state.flag(Rflags::PF);

    let result = match cc >> 1 {
        0 => of,
        1 => cf,
        2 => zf,
        3 => cf || zf,
        4 => sf,
        5 => pf,
        6 => sf != of,
        _ => zf || sf != of,
    };

    if cc & 1 != 0 {
        !result
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(state: &CpuState) -> (bool, bool, bool, bool, bool, bool) {
        (
            state.flag(Rflags::CF),
            state.flag(Rflags::ZF),
            state.flag(Rflags::SF),
            state.flag(Rflags::OF),
            state.flag(Rflags::AF),
            state.flag(Rflags::PF),
        )
    }

    #[test]
    fn add_carries_and_overflows() {
        let mut state = CpuState::new();

        let result = add(&mut state, 0xffff_ffff, 1, Size::Dword);
        assert_eq!(result, 0);
        let (cf, zf, _, of, af, pf) = flags(&state);
        assert!(cf && zf && af && pf && !of);

        let result = add(&mut state, 0x7fff_ffff, 1, Size::Dword);
        assert_eq!(result, 0x8000_0000);
        let (cf, _, sf, of, ..) = flags(&state);
        assert!(!cf && sf && of);
    }

    #[test]
    fn sub_borrow_chain() {
        let mut state = CpuState::new();

        let result = sub(&mut state, 0x10, 0x05, Size::Dword);
        assert_eq!(result, 0x0b);
        let (cf, zf, sf, of, ..) = flags(&state);
        assert!(!cf && !zf && !sf && !of);

        sub(&mut state, 0, 1, Size::Byte);
        let (cf, _, sf, _, af, pf) = flags(&state);
        assert!(cf && sf && af && pf);
    }

    #[test]
    fn adc_propagates_carry_into_zero_sum() {
        let mut state = CpuState::new();
        state.set_flag(Rflags::CF, true);

        let result = adc(&mut state, 0xffff_ffff, 0, Size::Dword);
        assert_eq!(result, 0);
        assert!(state.flag(Rflags::CF));
        assert!(state.flag(Rflags::ZF));
    }

    #[test]
    fn inc_preserves_carry() {
        let mut state = CpuState::new();
        state.set_flag(Rflags::CF, true);
        let result = inc(&mut state, 0x7fff_ffff, Size::Dword);
        assert_eq!(result, 0x8000_0000);
        assert!(state.flag(Rflags::CF));
        assert!(state.flag(Rflags::OF));
    }

    #[test]
    fn shifts_set_carry_from_the_shifted_out_bit() {
        let mut state = CpuState::new();

        let result = shl(&mut state, 0x8000_0001, 1, Size::Dword);
        assert_eq!(result, 2);
        assert!(state.flag(Rflags::CF));

        let result = shr(&mut state, 0b101, 1, Size::Dword);
        assert_eq!(result, 0b10);
        assert!(state.flag(Rflags::CF));

        let result = sar(&mut state, 0x8000_0000, 4, Size::Dword);
        assert_eq!(result, 0xf800_0000);
        assert!(!state.flag(Rflags::CF));
    }

    #[test]
    fn shrd_uses_the_second_operand_as_fill() {
        let mut state = CpuState::new();
        let result = shrd(&mut state, 0x0000_0001, 0x8000_0000, 4, Size::Dword);
        assert_eq!(result, 0x0000_0000);
        assert!(state.flag(Rflags::CF));
        assert!(state.flag(Rflags::ZF));
    }

    #[test]
    fn shift_counts_are_masked_before_anything_else() {
        let mut state = CpuState::new();
        state.set_flag(Rflags::CF, true);

        // Count 32 masks to 0 for 32-bit operands: result and flags untouched.
        let result = shl(&mut state, 0x1234, 32, Size::Dword);
        assert_eq!(result, 0x1234);
        assert!(state.flag(Rflags::CF));

        // Count 65 masks to 1 for 64-bit operands.
        let result = shl(&mut state, 1, 65, Size::Qword);
        assert_eq!(result, 2);
    }

    #[test]
    fn imul2_detects_signed_overflow() {
        let mut state = CpuState::new();

        imul2(&mut state, 0x4000_0000, 4, Size::Dword);
        assert!(state.flag(Rflags::CF));
        assert!(state.flag(Rflags::OF));

        imul2(&mut state, 0xffff_ffff, 5, Size::Dword); // -1 * 5 fits
        assert!(!state.flag(Rflags::CF));
    }

    #[test]
    fn condition_nibbles_follow_the_jcc_map() {
        let mut state = CpuState::new();
        state.set_flag(Rflags::ZF, true);

        assert!(condition(&state, 0x4)); // E
        assert!(!condition(&state, 0x5)); // NE
        assert!(condition(&state, 0x6)); // BE
        assert!(!condition(&state, 0x7)); // A

        state.set_flag(Rflags::ZF, false);
        state.set_flag(Rflags::SF, true);
        state.set_flag(Rflags::OF, false);
        assert!(condition(&state, 0xc)); // L
        assert!(!condition(&state, 0xd)); // GE
    }
}
