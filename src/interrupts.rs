//! Interrupt and exception delivery.
//!
//! Delivery pushes the interrupted context (FLAGS, CS, IP, plus SS:SP on a stack switch),
//! loads the handler's segment and offset from the IVT or IDT gate, switches CPL to the
//! target descriptor's privilege and transfers control. Vectors that define an error code
//! push it last, between the frame and the handler's first instruction. A fault raised
//! while delivering escalates in the caller: once to #DF, then to a machine halt.

use crate::arch::x86_64::{Rflags, Segment, SegmentRegister, Size, RSP};
use crate::fault::Fault;
use crate::mem::Memory;
use crate::paging::{read_linear, write_linear, Access};
use crate::segmentation::{read_descriptor, segment_base};
use crate::state::{CpuMode, CpuState};

/// What initiated the delivery; software interrupts get the gate-DPL privilege check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Cause {
    Software,
    External,
    Exception,
}

/// Delivers `vector` to the guest. `return_rip` is the RIP the handler should come back
/// to (the next instruction for traps and external interrupts, the faulting instruction
/// for faults).
pub fn deliver(
    state: &mut CpuState,
    mem: &mut Memory,
    vector: u8,
    cause: Cause,
    error_code: Option<u32>,
    return_rip: u64,
) -> Result<(), Fault> {
    match state.mode {
        CpuMode::Real => deliver_real(state, mem, vector, return_rip),
        CpuMode::Protected => deliver_protected(state, mem, vector, cause, error_code, return_rip),
        CpuMode::Long => deliver_long(state, mem, vector, cause, error_code, return_rip),
    }
}

/// Delivers an architectural fault, routing its error code and CR2.
pub fn deliver_fault(state: &mut CpuState, mem: &mut Memory, fault: &Fault) -> Result<(), Fault> {
    if let Some(cr2) = fault.cr2 {
        state.control.cr2 = cr2;
    }

    deliver(
        state,
        mem,
        fault.vector as u8,
        Cause::Exception,
        fault.error_code,
        state.rip,
    )
}

fn deliver_real(
    state: &mut CpuState,
    mem: &mut Memory,
    vector: u8,
    return_rip: u64,
) -> Result<(), Fault> {
    let entry = state.idtr.base.wrapping_add(u64::from(vector) * 4);
    let offset = read_linear(state, mem, entry, Size::Word, Access::SystemRead)?;
    let selector = read_linear(state, mem, entry + 2, Size::Word, Access::SystemRead)? as u16;

    let flags = state.rflags() & 0xffff;
    push_stack(state, mem, Size::Word, flags)?;
    push_stack(
        state,
        mem,
        Size::Word,
        u64::from(state.segment(SegmentRegister::Cs).selector),
    )?;
    push_stack(state, mem, Size::Word, return_rip & 0xffff)?;

    state.set_flag(Rflags::IF, false);
    state.set_flag(Rflags::TF, false);

    let cs = state.segment_mut(SegmentRegister::Cs);
    cs.selector = selector;
    cs.cache = Some(Segment::real_mode(selector));
    state.rip = offset;
    Ok(())
}

fn deliver_protected(
    state: &mut CpuState,
    mem: &mut Memory,
    vector: u8,
    cause: Cause,
    error_code: Option<u32>,
    return_rip: u64,
) -> Result<(), Fault> {
    let gate_error = u32::from(vector) * 8 + 2;
    let entry = u64::from(vector) * 8;

    if entry + 7 > u64::from(state.idtr.limit) {
        return Err(Fault::gp(gate_error));
    }

    let raw = read_linear(
        state,
        mem,
        state.idtr.base + entry,
        Size::Qword,
        Access::SystemRead,
    )?;

    let offset = raw & 0xffff | (raw >> 32) & 0xffff_0000;
    let selector = (raw >> 16) as u16;
    let type_attr = (raw >> 40) as u8;
    let gate_type = type_attr & 0xf;
    let gate_dpl = type_attr >> 5 & 0b11;

    if type_attr & 0x80 == 0 {
        return Err(Fault::np(vector_selector(vector)));
    }

    // Interrupt and trap gates only; task gates are beyond this machine.
    if !matches!(gate_type, 0x6 | 0x7 | 0xe | 0xf) {
        return Err(Fault::gp(gate_error));
    }

    if cause == Cause::Software && gate_dpl < state.cpl() {
        return Err(Fault::gp(gate_error));
    }

    let descriptor = read_descriptor(state, mem, selector)?;

    if !descriptor.non_system_segment || !descriptor.executable() {
        return Err(Fault::gp(u32::from(selector & !0b11)));
    }

    if !descriptor.present {
        return Err(Fault::np(selector));
    }

    let old_cpl = state.cpl();
    let new_cpl = descriptor.dpl;
    let frame_size = if matches!(gate_type, 0x6 | 0x7) {
        Size::Word
    } else {
        Size::Dword
    };

    let old_ss = state.segment(SegmentRegister::Ss).selector;
    let old_sp = state.gpr64(RSP);
    let old_cs = state.segment(SegmentRegister::Cs).selector;
    let old_flags = state.rflags();

    if new_cpl < old_cpl {
        // Ring transition: the inner stack comes from the TSS (SS0:ESP0 layout).
        let tss = state.tr.base;
        let new_sp = read_linear(state, mem, tss + 4, Size::Dword, Access::SystemRead)?;
        let new_ss = read_linear(state, mem, tss + 8, Size::Word, Access::SystemRead)? as u16;

        let ss_descriptor = read_descriptor(state, mem, new_ss)?;

        if !ss_descriptor.present {
            return Err(Fault::ss(new_ss));
        }

        let ss = state.segment_mut(SegmentRegister::Ss);
        ss.selector = new_ss;
        ss.cache = Some(ss_descriptor);
        state.set_gpr64(RSP, new_sp);

        push_system(state, mem, frame_size, u64::from(old_ss))?;
        push_system(state, mem, frame_size, old_sp)?;
    }

    push_system(state, mem, frame_size, old_flags)?;
    push_system(state, mem, frame_size, u64::from(old_cs))?;
    push_system(state, mem, frame_size, return_rip)?;

    if let Some(code) = error_code {
        push_system(state, mem, frame_size, u64::from(code))?;
    }

    if matches!(gate_type, 0x6 | 0xe) {
        state.set_flag(Rflags::IF, false);
    }

    state.set_flag(Rflags::TF, false);

    let cs = state.segment_mut(SegmentRegister::Cs);
    cs.selector = selector & !0b11 | u16::from(new_cpl);
    cs.cache = Some(descriptor);
    state.rip = offset;
    Ok(())
}

fn deliver_long(
    state: &mut CpuState,
    mem: &mut Memory,
    vector: u8,
    cause: Cause,
    error_code: Option<u32>,
    return_rip: u64,
) -> Result<(), Fault> {
    let gate_error = u32::from(vector) * 16 + 2;
    let entry = u64::from(vector) * 16;

    if entry + 15 > u64::from(state.idtr.limit) {
        return Err(Fault::gp(gate_error));
    }

    let low = read_linear(
        state,
        mem,
        state.idtr.base + entry,
        Size::Qword,
        Access::SystemRead,
    )?;
    let high = read_linear(
        state,
        mem,
        state.idtr.base + entry + 8,
        Size::Qword,
        Access::SystemRead,
    )?;

    let offset = low & 0xffff | (low >> 32) & 0xffff_0000 | (high & 0xffff_ffff) << 32;
    let selector = (low >> 16) as u16;
    let type_attr = (low >> 40) as u8;
    let gate_type = type_attr & 0xf;
    let gate_dpl = type_attr >> 5 & 0b11;

    if type_attr & 0x80 == 0 {
        return Err(Fault::np(vector_selector(vector)));
    }

    if !matches!(gate_type, 0xe | 0xf) {
        return Err(Fault::gp(gate_error));
    }

    if cause == Cause::Software && gate_dpl < state.cpl() {
        return Err(Fault::gp(gate_error));
    }

    let descriptor = read_descriptor(state, mem, selector)?;

    if !descriptor.non_system_segment || !descriptor.executable() {
        return Err(Fault::gp(u32::from(selector & !0b11)));
    }

    if !descriptor.present {
        return Err(Fault::np(selector));
    }

    let old_cpl = state.cpl();
    let new_cpl = descriptor.dpl;

    let old_ss = state.segment(SegmentRegister::Ss).selector;
    let old_sp = state.gpr64(RSP);
    let old_cs = state.segment(SegmentRegister::Cs).selector;
    let old_flags = state.rflags();

    if new_cpl < old_cpl {
        let tss = state.tr.base;
        let new_sp = read_linear(state, mem, tss + 4, Size::Qword, Access::SystemRead)?;
        state.set_gpr64(RSP, new_sp);

        let ss = state.segment_mut(SegmentRegister::Ss);
        ss.selector = 0;
        ss.cache = None;
    }

    // The long-mode frame is always the five-slot form, aligned down to 16 bytes.
    let aligned = state.gpr64(RSP) & !0xf;
    state.set_gpr64(RSP, aligned);

    push_system(state, mem, Size::Qword, u64::from(old_ss))?;
    push_system(state, mem, Size::Qword, old_sp)?;
    push_system(state, mem, Size::Qword, old_flags)?;
    push_system(state, mem, Size::Qword, u64::from(old_cs))?;
    push_system(state, mem, Size::Qword, return_rip)?;

    if let Some(code) = error_code {
        push_system(state, mem, Size::Qword, u64::from(code))?;
    }

    if gate_type == 0xe {
        state.set_flag(Rflags::IF, false);
    }

    state.set_flag(Rflags::TF, false);

    let cs = state.segment_mut(SegmentRegister::Cs);
    cs.selector = selector & !0b11 | u16::from(new_cpl);
    cs.cache = Some(descriptor);
    state.rip = offset;
    Ok(())
}

fn vector_selector(vector: u8) -> u16 {
    u16::from(vector) * 8 | 0b10
}

/// Pushes through the guest-visible stack path (real mode frames).
fn push_stack(
    state: &mut CpuState,
    mem: &mut Memory,
    size: Size,
    value: u64,
) -> Result<(), Fault> {
    let sp = Size::Word.truncate(state.gpr64(RSP).wrapping_sub(size.bytes()));
    let linear = segment_base(state, SegmentRegister::Ss).wrapping_add(sp);
    write_linear(state, mem, linear, size, value, Access::Write)?;
    state.write_gpr(RSP, Size::Word, false, sp);
    Ok(())
}

/// Pushes as a system access: ring-switch frames land on supervisor stacks that the
/// interrupted user code could never touch itself.
fn push_system(
    state: &mut CpuState,
    mem: &mut Memory,
    size: Size,
    value: u64,
) -> Result<(), Fault> {
    let sp_size = match state.mode {
        CpuMode::Long => Size::Qword,
        _ => match state.segment(SegmentRegister::Ss).cache {
            Some(cache) if cache.default => Size::Dword,
            _ => Size::Word,
        },
    };

    let sp = sp_size.truncate(state.gpr64(RSP).wrapping_sub(size.bytes()));
    let linear = segment_base(state, SegmentRegister::Ss).wrapping_add(sp);
    write_linear(state, mem, linear, size, value, Access::SystemWrite)?;
    state.write_gpr(RSP, sp_size, false, sp);
    Ok(())
}
