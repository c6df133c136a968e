//! The instruction execution engine.
//!
//! One [`Exec`] is built per instruction: it owns the prefetched code bytes, the scanned
//! prefixes and mutable views of the CPU state and memory, and dispatches on the one- or
//! two-byte opcode key into a flat handler table (a `match`, keeping the hot path
//! branch-predictable). Handlers consume ModR/M, SIB and immediates from the fetch window
//! and either advance RIP implicitly (by consumption) or explicitly (branches).

pub(crate) mod flags;

mod arith;
mod branch;
mod datamove;
mod logic;
mod sse;
mod string;
mod system;

use crate::arch::x86_64::{SegmentRegister, Size, RSP};
use crate::decode::{
    decode_modrm, gpr8, scan_prefixes, AddrSize, InsnFetch, MemRef, ModRm, Prefixes, RmOp,
};
use crate::fault::Fault;
use crate::machine::{PortIo, TickSource};
use crate::mem::Memory;
use crate::paging::{read_linear, write_linear, Access};
use crate::segmentation::{check_limit, segment_base};
use crate::state::{CpuMode, CpuState};
use log::warn;

/// Executes exactly one instruction at CS:RIP. RIP is only committed on success, so a
/// returned fault leaves the guest at the faulting instruction for restart after delivery.
pub fn step_instruction(
    state: &mut CpuState,
    mem: &mut Memory,
    io: &mut dyn PortIo,
    ticks: &mut dyn TickSource,
    strict_msrs: bool,
) -> Result<(), Fault> {
    let start_rip = state.rip;
    let mut fetch = InsnFetch::fetch(state, mem)?;
    let (prefixes, opcode) = scan_prefixes(state, &mut fetch)?;

    let mut exec = Exec {
        state,
        mem,
        io,
        ticks,
        prefixes,
        fetch,
        start_rip,
        next_rip: None,
        strict_msrs,
    };

    exec.run(opcode)?;

    let next = exec
        .next_rip
        .unwrap_or_else(|| start_rip.wrapping_add(exec.fetch.consumed()));

    exec.state.rip = next;
    exec.state.retire_instruction();
    exec.ticks.retire(1);

    Ok(())
}

/// The per-instruction execution context.
pub(crate) struct Exec<'a> {
    pub state: &'a mut CpuState,
    pub mem: &'a mut Memory,
    pub io: &'a mut dyn PortIo,
    pub ticks: &'a mut dyn TickSource,
    pub prefixes: Prefixes,
    pub fetch: InsnFetch,
    pub start_rip: u64,
    /// Set by branch handlers; `None` falls through to the next sequential instruction.
    pub next_rip: Option<u64>,
    pub strict_msrs: bool,
}

impl Exec<'_> {
    #[inline]
    pub fn op_size(&self) -> Size {
        self.prefixes.operand_size(self.state)
    }

    #[inline]
    pub fn addr_size(&self) -> AddrSize {
        self.prefixes.address_size(self.state)
    }

    /// The RIP of the instruction following this one, valid once all bytes are consumed.
    #[inline]
    pub fn fall_through(&self) -> u64 {
        self.start_rip.wrapping_add(self.fetch.consumed())
    }

    pub fn modrm(&mut self) -> Result<ModRm, Fault> {
        decode_modrm(&mut self.fetch, self.state, &self.prefixes)
    }

    // --- Memory operand access ---

    fn mem_offset(&self, mem_ref: &MemRef) -> u64 {
        mem_ref.effective(self.fall_through())
    }

    pub fn read_mem(&mut self, mem_ref: &MemRef, size: Size) -> Result<u64, Fault> {
        let offset = self.mem_offset(mem_ref);
        check_limit(self.state, mem_ref.seg, offset, size.bytes())?;

        let linear = segment_base(self.state, mem_ref.seg).wrapping_add(offset);
        read_linear(self.state, self.mem, linear, size, Access::Read)
    }

    pub fn write_mem(&mut self, mem_ref: &MemRef, size: Size, value: u64) -> Result<(), Fault> {
        let offset = self.mem_offset(mem_ref);
        check_limit(self.state, mem_ref.seg, offset, size.bytes())?;

        let linear = segment_base(self.state, mem_ref.seg).wrapping_add(offset);
        write_linear(self.state, self.mem, linear, size, value, Access::Write)
    }

    // --- Register and r/m operand access ---

    pub fn read_gpr_sized(&self, index: u8, size: Size) -> u64 {
        if size == Size::Byte {
            let (index, high) = gpr8(index, &self.prefixes);
            self.state.read_gpr(index, size, high)
        } else {
            self.state.read_gpr(index, size, false)
        }
    }

    pub fn write_gpr_sized(&mut self, index: u8, size: Size, value: u64) {
        if size == Size::Byte {
            let (index, high) = gpr8(index, &self.prefixes);
            self.state.write_gpr(index, size, high, value);
        } else {
            self.state.write_gpr(index, size, false, value);
        }
    }

    pub fn read_rm(&mut self, modrm: &ModRm, size: Size) -> Result<u64, Fault> {
        match modrm.operand {
            RmOp::Reg(index) => Ok(self.read_gpr_sized(index, size)),
            RmOp::Mem(mem_ref) => self.read_mem(&mem_ref, size),
        }
    }

    pub fn write_rm(&mut self, modrm: &ModRm, size: Size, value: u64) -> Result<(), Fault> {
        match modrm.operand {
            RmOp::Reg(index) => {
                self.write_gpr_sized(index, size, value);
                Ok(())
            }
            RmOp::Mem(mem_ref) => self.write_mem(&mem_ref, size, value),
        }
    }

    pub fn read_reg_field(&self, modrm: &ModRm, size: Size) -> u64 {
        self.read_gpr_sized(modrm.reg, size)
    }

    pub fn write_reg_field(&mut self, modrm: &ModRm, size: Size, value: u64) {
        self.write_gpr_sized(modrm.reg, size, value);
    }

    // --- Stack ---

    /// The width of the stack pointer itself, from the SS descriptor's default bit.
    pub fn stack_ptr_size(&self) -> Size {
        if self.state.mode == CpuMode::Long {
            Size::Qword
        } else {
            match self.state.segment(SegmentRegister::Ss).cache {
                Some(cache) if cache.default => Size::Dword,
                _ => Size::Word,
            }
        }
    }

    /// The operand width of PUSH/POP and friends: 64-bit code pushes 64 bits by default
    /// (16 with an operand-size override), legacy code follows the operand size.
    pub fn stack_op_size(&self) -> Size {
        if self.state.mode == CpuMode::Long {
            if self.prefixes.operand_size_override {
                Size::Word
            } else {
                Size::Qword
            }
        } else {
            self.op_size()
        }
    }

    pub fn push_value(&mut self, size: Size, value: u64) -> Result<(), Fault> {
        let sp_size = self.stack_ptr_size();
        let rsp = self.state.gpr64(RSP);
        let new_sp = sp_size.truncate(rsp.wrapping_sub(size.bytes()));

        let linear = segment_base(self.state, SegmentRegister::Ss).wrapping_add(new_sp);
        check_limit(self.state, SegmentRegister::Ss, new_sp, size.bytes())?;
        write_linear(self.state, self.mem, linear, size, value, Access::Write)?;

        self.state.write_gpr(RSP, sp_size, false, new_sp);
        Ok(())
    }

    pub fn pop_value(&mut self, size: Size) -> Result<u64, Fault> {
        let sp_size = self.stack_ptr_size();
        let rsp = sp_size.truncate(self.state.gpr64(RSP));

        let linear = segment_base(self.state, SegmentRegister::Ss).wrapping_add(rsp);
        check_limit(self.state, SegmentRegister::Ss, rsp, size.bytes())?;
        let value = read_linear(self.state, self.mem, linear, size, Access::Read)?;

        let new_sp = sp_size.truncate(rsp.wrapping_add(size.bytes()));
        self.state.write_gpr(RSP, sp_size, false, new_sp);
        Ok(value)
    }

    // --- Dispatch ---

    fn run(&mut self, opcode: u8) -> Result<(), Fault> {
        if opcode == 0x0f {
            let second = self.fetch.next8()?;

            if self.prefixes.lock && !lockable_0f(second) {
                return Err(Fault::ud());
            }

            return self.run_0f(second);
        }

        // LOCK is accepted (and, single-threaded, ignored) on the RMW forms and #UD
        // everywhere else.
        if self.prefixes.lock && !lockable_primary(opcode) {
            return Err(Fault::ud());
        }

        match opcode {
            0x00..=0x05
            | 0x08..=0x0d
            | 0x10..=0x15
            | 0x18..=0x1d
            | 0x20..=0x25
            | 0x28..=0x2d
            | 0x30..=0x35
            | 0x38..=0x3d => self.alu_binop(opcode),

            0x06 => self.push_sreg(SegmentRegister::Es),
            0x07 => self.pop_sreg(SegmentRegister::Es),
            0x0e => self.push_sreg(SegmentRegister::Cs),
            0x16 => self.push_sreg(SegmentRegister::Ss),
            0x17 => self.pop_sreg(SegmentRegister::Ss),
            0x1e => self.push_sreg(SegmentRegister::Ds),
            0x1f => self.pop_sreg(SegmentRegister::Ds),

            0x27 => self.daa(),
            0x2f => self.das(),
            0x37 => self.aaa(),
            0x3f => self.aas(),

            0x40..=0x47 => self.inc_reg(opcode & 0x7),
            0x48..=0x4f => self.dec_reg(opcode & 0x7),
            0x50..=0x57 => self.push_reg(opcode & 0x7),
            0x58..=0x5f => self.pop_reg(opcode & 0x7),

            0x60 => self.pusha(),
            0x61 => self.popa(),
            0x63 => self.movsxd_or_arpl(),

            0x68 => self.push_imm(false),
            0x69 => self.imul3(false),
            0x6a => self.push_imm(true),
            0x6b => self.imul3(true),

            0x6c | 0x6d => self.ins(opcode == 0x6c),
            0x6e | 0x6f => self.outs(opcode == 0x6e),

            0x70..=0x7f => self.jcc(opcode & 0xf, Size::Byte),

            0x80 | 0x82 => self.group1(Size::Byte, false),
            0x81 => self.group1(self.op_size(), false),
            0x83 => self.group1(self.op_size(), true),

            0x84 => self.test_rm_reg(Size::Byte),
            0x85 => self.test_rm_reg(self.op_size()),
            0x86 => self.xchg_rm_reg(Size::Byte),
            0x87 => self.xchg_rm_reg(self.op_size()),

            0x88 => self.mov_rm_reg(Size::Byte),
            0x89 => self.mov_rm_reg(self.op_size()),
            0x8a => self.mov_reg_rm(Size::Byte),
            0x8b => self.mov_reg_rm(self.op_size()),
            0x8c => self.mov_rm_sreg(),
            0x8d => self.lea(),
            0x8e => self.mov_sreg_rm(),
            0x8f => self.pop_rm(),

            0x90 => self.nop_or_pause(),
            0x91..=0x97 => self.xchg_acc_reg(opcode & 0x7),

            0x98 => self.cbw(),
            0x99 => self.cwd(),
            0x9a => self.call_far_imm(),
            0x9b => Ok(()), // WAIT/FWAIT: the x87 stub never has a pending exception.
            0x9c => self.pushf(),
            0x9d => self.popf(),
            0x9e => self.sahf(),
            0x9f => self.lahf(),

            0xa0..=0xa3 => self.mov_moffs(opcode),
            0xa4 | 0xa5 => self.string_op(opcode),
            0xa6 | 0xa7 => self.string_op(opcode),
            0xa8 => self.test_acc_imm(Size::Byte),
            0xa9 => self.test_acc_imm(self.op_size()),
            0xaa..=0xaf => self.string_op(opcode),

            0xb0..=0xb7 => self.mov_reg8_imm(opcode & 0x7),
            0xb8..=0xbf => self.mov_reg_imm(opcode & 0x7),

            0xc0 => self.shift_group(Size::Byte, ShiftCount::Imm8),
            0xc1 => self.shift_group(self.op_size(), ShiftCount::Imm8),
            0xc2 => self.ret_near(true),
            0xc3 => self.ret_near(false),
            0xc4 => self.load_far_pointer_legacy(SegmentRegister::Es),
            0xc5 => self.load_far_pointer_legacy(SegmentRegister::Ds),
            0xc6 => self.mov_rm_imm(Size::Byte),
            0xc7 => self.mov_rm_imm(self.op_size()),
            0xc8 => self.enter(),
            0xc9 => self.leave(),
            0xca => self.ret_far(true),
            0xcb => self.ret_far(false),
            0xcc => self.int_n(3),
            0xcd => {
                let vector = self.fetch.next8()?;
                self.int_n(vector)
            }
            0xce => self.int_on_overflow(),
            0xcf => self.iret(),

            0xd0 => self.shift_group(Size::Byte, ShiftCount::One),
            0xd1 => self.shift_group(self.op_size(), ShiftCount::One),
            0xd2 => self.shift_group(Size::Byte, ShiftCount::Cl),
            0xd3 => self.shift_group(self.op_size(), ShiftCount::Cl),
            0xd4 => self.aam(),
            0xd5 => self.aad(),
            0xd7 => self.xlat(),
            0xd8..=0xdf => self.x87_stub(opcode),

            0xe0..=0xe2 => self.loop_op(opcode),
            0xe3 => self.jcxz(),
            0xe4..=0xe7 | 0xec..=0xef => self.in_out(opcode),
            0xe8 => self.call_rel(),
            0xe9 => self.jmp_rel(self.op_size()),
            0xea => self.jmp_far_imm(),
            0xeb => self.jmp_rel(Size::Byte),

            0xf4 => self.hlt(),
            0xf5 => self.cmc(),
            0xf6 => self.group3(Size::Byte),
            0xf7 => self.group3(self.op_size()),
            0xf8 => self.set_carry(false),
            0xf9 => self.set_carry(true),
            0xfa => self.cli(),
            0xfb => self.sti(),
            0xfc => self.set_direction(false),
            0xfd => self.set_direction(true),
            0xfe => self.group4(),
            0xff => self.group5(),

            _ => self.undefined(&[opcode]),
        }
    }

    fn run_0f(&mut self, opcode: u8) -> Result<(), Fault> {
        match opcode {
            0x00 => self.group6(),
            0x01 => self.group7(),
            0x02 => self.lar(),
            0x03 => self.lsl(),
            0x05 => self.syscall(),
            0x06 => self.clts(),
            0x07 => self.sysret(),
            0x08 | 0x09 => Ok(()), // INVD/WBINVD: no caches to flush.
            0x0b => self.undefined(&[0x0f, opcode]),
            0x0d => self.nop_modrm(),

            0x10 | 0x11 | 0x28 | 0x29 => self.sse_mov_packed(opcode),
            0x18..=0x1f => self.nop_modrm(),

            0x20 | 0x22 => self.mov_cr(opcode == 0x22),
            0x21 | 0x23 => self.mov_dr(opcode == 0x23),

            0x30 => self.wrmsr(),
            0x31 => self.rdtsc(),
            0x32 => self.rdmsr(),
            0x33 => self.rdpmc(),
            0x34 => self.sysenter(),
            0x35 => self.sysexit(),

            0x40..=0x4f => self.cmov(opcode & 0xf),

            0x54..=0x57 => self.sse_bitwise(opcode),

            0x6e => self.movd_to_xmm(),
            0x6f => self.movdq_load(),
            0x7e => self.movd_from_xmm(),
            0x7f => self.movdq_store(),

            0x80..=0x8f => self.jcc(opcode & 0xf, Size::Dword),
            0x90..=0x9f => self.setcc(opcode & 0xf),

            0xa0 => self.push_sreg(SegmentRegister::Fs),
            0xa1 => self.pop_sreg(SegmentRegister::Fs),
            0xa2 => self.cpuid(),
            0xa3 => self.bt_rm_reg(BitOp::Test),
            0xa4 => self.shld_shrd(true, ShiftCount::Imm8),
            0xa5 => self.shld_shrd(true, ShiftCount::Cl),
            0xa8 => self.push_sreg(SegmentRegister::Gs),
            0xa9 => self.pop_sreg(SegmentRegister::Gs),
            0xab => self.bt_rm_reg(BitOp::Set),
            0xac => self.shld_shrd(false, ShiftCount::Imm8),
            0xad => self.shld_shrd(false, ShiftCount::Cl),
            0xae => self.group15(),
            0xaf => self.imul_reg_rm(),

            0xb0 => self.cmpxchg(Size::Byte),
            0xb1 => self.cmpxchg(self.op_size()),
            0xb2 => self.load_far_pointer(SegmentRegister::Ss),
            0xb3 => self.bt_rm_reg(BitOp::Reset),
            0xb4 => self.load_far_pointer(SegmentRegister::Fs),
            0xb5 => self.load_far_pointer(SegmentRegister::Gs),
            0xb6 => self.movx(Size::Byte, false),
            0xb7 => self.movx(Size::Word, false),
            0xba => self.group8(),
            0xbb => self.bt_rm_reg(BitOp::Complement),
            0xbc => self.bit_scan(false),
            0xbd => self.bit_scan(true),
            0xbe => self.movx(Size::Byte, true),
            0xbf => self.movx(Size::Word, true),

            0xc0 => self.xadd(Size::Byte),
            0xc1 => self.xadd(self.op_size()),
            0xc3 => self.movnti(),
            0xc7 => self.group9(),
            0xc8..=0xcf => self.bswap(opcode & 0x7),

            0xd6 => self.movq_store(),
            0xef => self.pxor(),

            _ => self.undefined(&[0x0f, opcode]),
        }
    }

    /// The sink for opcodes the machine does not implement: the guest observes #UD, the
    /// host logs the bytes once per occurrence.
    pub fn undefined(&mut self, bytes: &[u8]) -> Result<(), Fault> {
        warn!(
            "undefined or unimplemented opcode {:02x?} at rip {:#x}",
            bytes, self.start_rip
        );
        Err(Fault::ud())
    }
}

/// The one-byte opcodes that tolerate a LOCK prefix: the r/m-destination ALU stores, the
/// immediate groups, XCHG and the INC/DEC groups.
fn lockable_primary(opcode: u8) -> bool {
    matches!(
        opcode,
        0x00 | 0x01
            | 0x08
            | 0x09
            | 0x10
            | 0x11
            | 0x18
            | 0x19
            | 0x20
            | 0x21
            | 0x28
            | 0x29
            | 0x30
            | 0x31
            | 0x80..=0x83
            | 0x86
            | 0x87
            | 0xf6
            | 0xf7
            | 0xfe
            | 0xff
    )
}

/// The two-byte opcodes that tolerate a LOCK prefix: CMPXCHG, XADD, CMPXCHG8B and the
/// writing bit tests.
fn lockable_0f(opcode: u8) -> bool {
    matches!(
        opcode,
        0xb0 | 0xb1 | 0xc0 | 0xc1 | 0xc7 | 0xab | 0xb3 | 0xbb | 0xba
    )
}

/// How a shift-group instruction sources its count.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ShiftCount {
    One,
    Cl,
    Imm8,
}

/// The bit-test family selector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BitOp {
    Test,
    Set,
    Reset,
    Complement,
}
