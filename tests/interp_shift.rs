//! Shift semantics fixtures: the masked-count rule, the double-precision shifts, and the
//! two fixtures that pin this machine's behaviour for SHRD counts past the operand width
//! (Intel leaves that region undefined; here the double-width result is the contract).

use sx_rs::arch::x86_64::{Rflags, Size, RAX, RBX, RCX, RDX, RSP};
use sx_rs::{Error, IsoEntry, IsoVolume, Machine, MachineBuilder, QueueKeyboard};

struct NoVolume;

impl IsoVolume for NoVolume {
    fn size_bytes(&self) -> u64 {
        0
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        Err(Error::MediumBounds {
            offset,
            len: buf.len(),
        })
    }

    fn lookup(&mut self, _path: &str) -> Option<IsoEntry> {
        None
    }
}

fn flat32() -> Machine {
    let mut machine = MachineBuilder::new()
        .with_memory_size(64 << 20)
        .build(
            Box::new(NoVolume),
            Box::new(sx_rs::BufferScreen::default()),
            Box::new(QueueKeyboard::default()),
        );

    machine.power_on_flat32();
    machine.state_mut().set_gpr64(RSP, 0x8_0000);
    machine
}

fn run_one(machine: &mut Machine, code: &[u8]) {
    machine.memory_mut().write_from(0x1000, code);
    machine.state_mut().rip = 0x1000;
    assert!(machine.step().is_none());
    assert_eq!(machine.state().rip, 0x1000 + code.len() as u64);
}

#[test]
fn shl_takes_carry_from_the_departing_bit() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RAX, 0x8000_0001);
    // shl eax, 1
    run_one(&mut machine, &[0xd1, 0xe0]);

    assert_eq!(machine.state().read_gpr(RAX, Size::Dword, false), 2);
    assert!(machine.state().flag(Rflags::CF));
    assert!(machine.state().flag(Rflags::OF)); // sign changed on a count of one
}

#[test]
fn masked_out_count_changes_nothing() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RAX, 0x1234);
    machine.state_mut().set_flag(Rflags::CF, true);
    // shl eax, 32: the count masks to zero, value and flags stay put.
    run_one(&mut machine, &[0xc1, 0xe0, 0x20]);

    assert_eq!(machine.state().read_gpr(RAX, Size::Dword, false), 0x1234);
    assert!(machine.state().flag(Rflags::CF));
}

#[test]
fn shrd_pulls_fill_bits_from_the_source() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RAX, 0x0000_0001);
    machine.state_mut().set_gpr64(RDX, 0x8000_0000);
    // shrd eax, edx, 4
    run_one(&mut machine, &[0x0f, 0xac, 0xd0, 0x04]);

    // EDX's low nibble slides in from the top; CF holds the last bit shifted out,
    // which for a count of four is bit 3 of the concatenation.
    assert_eq!(machine.state().read_gpr(RAX, Size::Dword, false), 0);
    assert!(!machine.state().flag(Rflags::CF));
    assert!(machine.state().flag(Rflags::ZF));
    // The source register is never written.
    assert_eq!(machine.state().read_gpr(RDX, Size::Dword, false), 0x8000_0000);
}

#[test]
fn shld_with_cl_count() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RAX, 0x0000_0001);
    machine.state_mut().set_gpr64(RBX, 0xf000_0000);
    machine.state_mut().set_gpr64(RCX, 8);
    // shld eax, ebx, cl
    run_one(&mut machine, &[0x0f, 0xa5, 0xd8]);

    assert_eq!(
        machine.state().read_gpr(RAX, Size::Dword, false),
        0x0000_01f0
    );
}

/// Fixture one for the undefined region: a 16-bit SHRD whose count exceeds 16 takes its
/// bits from the 32-bit concatenation, so source bits wrap into the result.
#[test]
fn shrd16_count_past_width_uses_the_double_width_value() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RAX, 0x1234);
    machine.state_mut().set_gpr64(RDX, 0xabcd);
    // shrd ax, dx, 20: (0xabcd:0x1234 >> 20) & 0xffff = 0x0abc.
    run_one(&mut machine, &[0x66, 0x0f, 0xac, 0xd0, 0x14]);

    assert_eq!(
        machine.state().read_gpr(RAX, Size::Word, false),
        0x0abc
    );
    // Bit 19 of the concatenation (count - 1) was the last one out.
    assert!(machine.state().flag(Rflags::CF));
}

/// Fixture two: the same count region for SHLD.
#[test]
fn shld16_count_past_width_uses_the_double_width_value() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RAX, 0x1234);
    machine.state_mut().set_gpr64(RDX, 0xabcd);
    // shld ax, dx, 20: the excess count keeps pulling source bits through, leaving
    // (0x1234:0xabcd << 20 >> 16) & 0xffff = 0xbcd0.
    run_one(&mut machine, &[0x66, 0x0f, 0xa4, 0xd0, 0x14]);

    assert_eq!(
        machine.state().read_gpr(RAX, Size::Word, false),
        0xbcd0
    );
}

#[test]
fn rotates_only_touch_carry_and_overflow() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RAX, 0x8000_0000);
    machine.state_mut().set_flag(Rflags::ZF, true);
    // rol eax, 1
    run_one(&mut machine, &[0xd1, 0xc0]);

    assert_eq!(machine.state().read_gpr(RAX, Size::Dword, false), 1);
    assert!(machine.state().flag(Rflags::CF));
    // ZF survives a rotate untouched.
    assert!(machine.state().flag(Rflags::ZF));
}

#[test]
fn rcr_rotates_through_the_carry_bit() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RAX, 1);
    machine.state_mut().set_flag(Rflags::CF, false);
    // rcr eax, 1: bit 0 leaves into CF, the old CF (0) enters at the top.
    run_one(&mut machine, &[0xd1, 0xd8]);

    assert_eq!(machine.state().read_gpr(RAX, Size::Dword, false), 0);
    assert!(machine.state().flag(Rflags::CF));
}
