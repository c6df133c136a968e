//! The string operations and their REP state machines.
//!
//! A `REP`-prefixed string instruction is a small machine: enter (count check), iterate,
//! exit (count exhausted or the REPE/REPNE condition falsified). The interpreter runs a
//! bounded burst of iterations per step; when the burst ends with count remaining, RIP is
//! pointed back at the prefixed instruction, which both matches the architectural interrupt
//! behaviour and gives the outer loop a delivery window.

use super::{flags, Exec};
use crate::arch::x86_64::{Rflags, SegmentRegister, Size, RAX, RCX, RDI, RDX, RSI};
use crate::decode::{MemRef, Rep};
use crate::fault::Fault;

/// Iterations executed per step before a REP run yields to the outer loop.
const REP_BURST: u64 = 4096;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
}

impl Exec<'_> {
    pub(super) fn string_op(&mut self, opcode: u8) -> Result<(), Fault> {
        let size = if opcode & 1 == 0 {
            Size::Byte
        } else {
            self.op_size()
        };

        let op = match opcode & !1 {
            0xa4 => StringOp::Movs,
            0xa6 => StringOp::Cmps,
            0xaa => StringOp::Stos,
            0xac => StringOp::Lods,
            _ => StringOp::Scas,
        };

        match self.prefixes.rep {
            None => self.string_iteration(op, size),
            Some(rep) => self.rep_machine(op, size, rep),
        }
    }

    fn rep_machine(&mut self, op: StringOp, size: Size, rep: Rep) -> Result<(), Fault> {
        let count_size = self.addr_size().size();

        for burst in 0.. {
            let count = self.state.read_gpr(RCX, count_size, false);

            if count == 0 {
                return Ok(());
            }

            if burst == REP_BURST {
                // Yield with the count live; RIP points back at the prefixed instruction.
                self.next_rip = Some(self.start_rip);
                return Ok(());
            }

            self.string_iteration(op, size)?;
            self.state
                .write_gpr(RCX, count_size, false, count.wrapping_sub(1));

            if matches!(op, StringOp::Cmps | StringOp::Scas) {
                let zf = self.state.flag(Rflags::ZF);

                let done = match rep {
                    Rep::Rep => !zf,
                    Rep::Repne => zf,
                };

                if done {
                    return Ok(());
                }
            }
        }

        unreachable!("the burst loop always returns");
    }

    fn string_advance(&mut self, index: u8, size: Size) {
        let count_size = self.addr_size().size();
        let current = self.state.read_gpr(index, count_size, false);

        let next = if self.state.flag(Rflags::DF) {
            current.wrapping_sub(size.bytes())
        } else {
            current.wrapping_add(size.bytes())
        };

        self.state.write_gpr(index, count_size, false, next);
    }

    fn source_ref(&self) -> MemRef {
        MemRef {
            seg: self.prefixes.segment.unwrap_or(SegmentRegister::Ds),
            offset: self.state.gpr64(RSI),
            rip_relative: false,
            mask: self.addr_size().mask(),
        }
    }

    /// The destination of a string op is always ES:rDI; no override applies.
    fn dest_ref(&self) -> MemRef {
        MemRef {
            seg: SegmentRegister::Es,
            offset: self.state.gpr64(RDI),
            rip_relative: false,
            mask: self.addr_size().mask(),
        }
    }

    fn string_iteration(&mut self, op: StringOp, size: Size) -> Result<(), Fault> {
        match op {
            StringOp::Movs => {
                let src = self.source_ref();
                let dst = self.dest_ref();
                let value = self.read_mem(&src, size)?;
                self.write_mem(&dst, size, value)?;
                self.string_advance(RSI, size);
                self.string_advance(RDI, size);
            }
            StringOp::Cmps => {
                let src = self.source_ref();
                let dst = self.dest_ref();
                let a = self.read_mem(&src, size)?;
                let b = self.read_mem(&dst, size)?;
                flags::sub(self.state, a, b, size);
                self.string_advance(RSI, size);
                self.string_advance(RDI, size);
            }
            StringOp::Stos => {
                let dst = self.dest_ref();
                let value = self.state.read_gpr(RAX, size, false);
                self.write_mem(&dst, size, value)?;
                self.string_advance(RDI, size);
            }
            StringOp::Lods => {
                let src = self.source_ref();
                let value = self.read_mem(&src, size)?;
                self.state.write_gpr(RAX, size, false, value);
                self.string_advance(RSI, size);
            }
            StringOp::Scas => {
                let dst = self.dest_ref();
                let acc = self.state.read_gpr(RAX, size, false);
                let value = self.read_mem(&dst, size)?;
                flags::sub(self.state, acc, value, size);
                self.string_advance(RDI, size);
            }
        }

        Ok(())
    }

    /// INS: port input to ES:rDI.
    pub(super) fn ins(&mut self, byte: bool) -> Result<(), Fault> {
        let size = if byte { Size::Byte } else { self.op_size() };
        let size = size.min(Size::Dword);

        self.port_string(size, true)
    }

    /// OUTS: DS:rSI to port output.
    pub(super) fn outs(&mut self, byte: bool) -> Result<(), Fault> {
        let size = if byte { Size::Byte } else { self.op_size() };
        let size = size.min(Size::Dword);

        self.port_string(size, false)
    }

    fn port_string(&mut self, size: Size, input: bool) -> Result<(), Fault> {
        let port = self.state.read_gpr(RDX, Size::Word, false) as u16;

        let mut once = |this: &mut Self| -> Result<(), Fault> {
            if input {
                let value = this.io.port_read(port, size.bytes() as u8);
                let dst = this.dest_ref();
                this.write_mem(&dst, size, u64::from(value))?;
                this.string_advance(RDI, size);
            } else {
                let src = this.source_ref();
                let value = this.read_mem(&src, size)?;
                this.io.port_write(port, size.bytes() as u8, value as u32);
                this.string_advance(RSI, size);
            }

            Ok(())
        };

        match self.prefixes.rep {
            None => once(self),
            Some(_) => {
                let count_size = self.addr_size().size();

                for burst in 0.. {
                    let count = self.state.read_gpr(RCX, count_size, false);

                    if count == 0 {
                        return Ok(());
                    }

                    if burst == REP_BURST {
                        self.next_rip = Some(self.start_rip);
                        return Ok(());
                    }

                    once(self)?;
                    self.state
                        .write_gpr(RCX, count_size, false, count.wrapping_sub(1));
                }

                unreachable!("the burst loop always returns");
            }
        }
    }
}
