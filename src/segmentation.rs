//! The segmentation unit: selector-to-descriptor resolution and the per-segment descriptor
//! cache.
//!
//! In protected and long mode a segment load reads the 8-byte descriptor from the GDT or LDT
//! (selector bit 2 chooses the table), decodes the split base and limit fields and caches the
//! result on the segment register. In real mode no table exists and the cache entry is
//! synthesized as `base = selector << 4`, `limit = 0xffff`. Descriptor reads go through the
//! system-access path so they are never blocked by user/supervisor paging bits.

use crate::arch::x86_64::{Segment, SegmentRegister, Size};
use crate::fault::Fault;
use crate::mem::Memory;
use crate::paging::{read_linear, Access};
use crate::state::{CpuMode, CpuState};

/// Decodes a raw 8-byte descriptor into the cached [`Segment`] record.
pub fn decode_descriptor(raw: u64) -> Segment {
    let mut limit = (raw & 0xffff) as u32 | (((raw >> 48) & 0xf) as u32) << 16;
    let base = ((raw >> 16) & 0xffff) | ((raw >> 32) & 0xff) << 16 | ((raw >> 56) & 0xff) << 24;

    let access = (raw >> 40) & 0xff;
    let flags = (raw >> 52) & 0xf;
    let granularity = flags & 0x8 != 0;

    if granularity {
        limit = limit << 12 | 0xfff;
    }

    Segment {
        base,
        limit,
        segment_type: (access & 0xf) as u8,
        non_system_segment: access & 0x10 != 0,
        dpl: ((access >> 5) & 0b11) as u8,
        present: access & 0x80 != 0,
        available: flags & 0x1 != 0,
        long: flags & 0x2 != 0,
        default: flags & 0x4 != 0,
        granularity,
    }
}

/// Fetches the raw descriptor named by `selector` from the GDT or LDT.
///
/// This is an architectural memory read through the ordinary physical path, but attributed
/// as a system access so tracing and paging treat it as the CPU's own structure walk.
pub fn read_raw_descriptor(
    state: &CpuState,
    mem: &mut Memory,
    selector: u16,
) -> Result<u64, Fault> {
    let index = u64::from(selector >> 3);
    let (base, limit) = if selector & 0b100 != 0 {
        (state.ldtr.base, u64::from(state.ldtr.limit))
    } else {
        (state.gdtr.base, u64::from(state.gdtr.limit))
    };

    if index * 8 + 7 > limit {
        return Err(Fault::gp(u32::from(selector & !0b11)));
    }

    read_linear(state, mem, base + index * 8, Size::Qword, Access::SystemRead)
}

/// Fetches and decodes the descriptor named by `selector`.
pub fn read_descriptor(
    state: &CpuState,
    mem: &mut Memory,
    selector: u16,
) -> Result<Segment, Fault> {
    Ok(decode_descriptor(read_raw_descriptor(state, mem, selector)?))
}

/// Loads a segment register with `selector`, populating the descriptor cache.
///
/// A null selector leaves the cache empty (unusable) for data segments; loading CS or SS
/// with a null selector is a #GP. An absent present bit raises #NP (#SS for the stack
/// segment) and also leaves the cache empty, so subsequent uses keep faulting.
pub fn load_segment(
    state: &mut CpuState,
    mem: &mut Memory,
    register: SegmentRegister,
    selector: u16,
) -> Result<(), Fault> {
    if state.mode == CpuMode::Real {
        let segment = state.segment_mut(register);
        segment.selector = selector;
        segment.cache = Some(Segment::real_mode(selector));
        return Ok(());
    }

    if selector & !0b11 == 0 {
        // Null selector: fine for data segments, and for SS at ring 0 in long mode.
        let null_ss_ok = state.mode == CpuMode::Long && state.cpl() == 0;

        match register {
            SegmentRegister::Cs => return Err(Fault::gp0()),
            SegmentRegister::Ss if !null_ss_ok => return Err(Fault::gp0()),
            _ => {}
        }

        let segment = state.segment_mut(register);
        segment.selector = selector;
        segment.cache = None;
        return Ok(());
    }

    let descriptor = read_descriptor(state, mem, selector)?;

    if !descriptor.non_system_segment {
        return Err(Fault::gp(u32::from(selector & !0b11)));
    }

    match register {
        SegmentRegister::Cs if !descriptor.executable() => {
            return Err(Fault::gp(u32::from(selector & !0b11)));
        }
        SegmentRegister::Ss if descriptor.executable() || !descriptor.writable() => {
            return Err(Fault::gp(u32::from(selector & !0b11)));
        }
        _ => {}
    }

    if !descriptor.present {
        let segment = state.segment_mut(register);
        segment.selector = selector;
        segment.cache = None;

        return Err(match register {
            SegmentRegister::Ss => Fault::ss(selector),
            _ => Fault::np(selector),
        });
    }

    let segment = state.segment_mut(register);
    segment.selector = selector;
    segment.cache = Some(descriptor);

    Ok(())
}

/// The effective base of a segment for address formation.
///
/// Long mode forces a zero base for everything except FS and GS. In real mode a missing
/// cache entry falls back to the selector-times-sixteen rule.
pub fn segment_base(state: &CpuState, register: SegmentRegister) -> u64 {
    if state.mode == CpuMode::Long
        && !matches!(register, SegmentRegister::Fs | SegmentRegister::Gs)
    {
        return 0;
    }

    let segment = state.segment(register);

    match segment.cache {
        Some(cache) => cache.base,
        None => u64::from(segment.selector) << 4,
    }
}

/// Checks that `[offset, offset + len)` lies inside the segment limit. Only enforced in
/// protected mode; real mode (including flat "unreal" setups) and long mode skip the check.
pub fn check_limit(
    state: &CpuState,
    register: SegmentRegister,
    offset: u64,
    len: u64,
) -> Result<(), Fault> {
    if state.mode != CpuMode::Protected {
        return Ok(());
    }

    let segment = state.segment(register);

    let Some(cache) = segment.cache else {
        return Err(match register {
            SegmentRegister::Ss => Fault::ss(segment.selector),
            _ => Fault::gp0(),
        });
    };

    let last = offset.wrapping_add(len.saturating_sub(1));

    if last > u64::from(cache.limit) || last < offset {
        return Err(match register {
            SegmentRegister::Ss => Fault::ss(0),
            _ => Fault::gp0(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::DescriptorTable;

    /// Builds the raw descriptor the decoder is expected to take apart.
    fn make_descriptor(base: u32, limit_raw: u32, access: u8, flags: u8) -> u64 {
        let mut raw = 0u64;
        raw |= u64::from(limit_raw & 0xffff);
        raw |= u64::from(base & 0xffff) << 16;
        raw |= u64::from((base >> 16) & 0xff) << 32;
        raw |= u64::from(access) << 40;
        raw |= u64::from((limit_raw >> 16) & 0xf) << 48;
        raw |= u64::from(flags & 0xf) << 52;
        raw |= u64::from((base >> 24) & 0xff) << 56;
        raw
    }

    #[test]
    fn decode_reassembles_split_base_and_limit() {
        // Flat 4 GiB ring-0 data segment: type 0x2, S, present, D/B, G.
        let raw = make_descriptor(0x1234_5678, 0xf_ffff, 0x92, 0b1100);
        let segment = decode_descriptor(raw);

        assert_eq!(segment.base, 0x1234_5678);
        assert_eq!(segment.limit, 0xffff_ffff);
        assert!(segment.present);
        assert!(segment.non_system_segment);
        assert!(!segment.executable());
        assert!(segment.writable());
        assert!(segment.default);
        assert!(segment.granularity);
    }

    #[test]
    fn byte_granular_limit_is_not_scaled() {
        let raw = make_descriptor(0, 0x67, 0x89, 0);
        let segment = decode_descriptor(raw);
        assert_eq!(segment.limit, 0x67);
        assert!(!segment.non_system_segment);
    }

    fn protected_state(mem: &mut Memory) -> CpuState {
        let mut state = CpuState::new();
        state.control.cr0 |= crate::arch::x86_64::CR0_PE;
        state.update_mode();
        state.gdtr = DescriptorTable {
            base: 0x1000,
            limit: 8 * 8 - 1,
        };

        mem.write_phys64(0x1000, 0);
        // Ring-0 flat code and data.
        mem.write_phys64(0x1008, make_descriptor(0, 0xf_ffff, 0x9a, 0b1100));
        mem.write_phys64(0x1010, make_descriptor(0, 0xf_ffff, 0x92, 0b1100));
        // A not-present data segment.
        mem.write_phys64(0x1018, make_descriptor(0, 0xf_ffff, 0x12, 0b1100));
        state
    }

    #[test]
    fn protected_load_populates_cache() {
        let mut mem = Memory::new(1 << 20);
        let mut state = protected_state(&mut mem);

        load_segment(&mut state, &mut mem, SegmentRegister::Ds, 0x10).unwrap();
        let cache = state.segment(SegmentRegister::Ds).cache.unwrap();
        assert_eq!(cache.limit, 0xffff_ffff);
        assert!(cache.writable());
    }

    #[test]
    fn absent_descriptor_raises_np_and_clears_cache() {
        let mut mem = Memory::new(1 << 20);
        let mut state = protected_state(&mut mem);

        let fault =
            load_segment(&mut state, &mut mem, SegmentRegister::Ds, 0x18).unwrap_err();
        assert_eq!(fault, Fault::np(0x18));
        assert!(state.segment(SegmentRegister::Ds).cache.is_none());
    }

    #[test]
    fn selector_past_gdt_limit_raises_gp() {
        let mut mem = Memory::new(1 << 20);
        let mut state = protected_state(&mut mem);

        let fault =
            load_segment(&mut state, &mut mem, SegmentRegister::Ds, 0x40).unwrap_err();
        assert_eq!(fault, Fault::gp(0x40));
    }

    #[test]
    fn real_mode_load_synthesizes_cache() {
        let mut mem = Memory::new(1 << 20);
        let mut state = CpuState::new();

        load_segment(&mut state, &mut mem, SegmentRegister::Es, 0xb800).unwrap();
        let cache = state.segment(SegmentRegister::Es).cache.unwrap();
        assert_eq!(cache.base, 0xb8000);
        assert_eq!(cache.limit, 0xffff);
    }
}
