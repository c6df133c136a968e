//! Interpreter semantics: arithmetic flag predicates, data movement, string operations
//! and the compare/branch family, driven through a flat 32-bit machine executing
//! hand-assembled bytes.

use sx_rs::arch::x86_64::{Rflags, Size, RAX, RBX, RCX, RDI, RDX, RSI, RSP};
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

/// Places code at `rip` and steps until RIP reaches `stop` or the step cap trips.
fn run_until(machine: &mut Machine, stop: u64, cap: u64) {
    for _ in 0..cap {
        if machine.state().rip == stop {
            return;
        }

        assert!(machine.step().is_none(), "machine exited unexpectedly");
    }

    panic!(
        "did not reach {stop:#x}; rip is {:#x}",
        machine.state().rip
    );
}

fn load_code(machine: &mut Machine, rip: u64, code: &[u8]) {
    machine.memory_mut().write_from(rip, code);
    machine.state_mut().rip = rip;
}

#[test]
fn add_sets_the_full_flag_group() {
    let mut machine = flat32();

    // add eax, ecx with 0xFFFFFFFF + 1.
    machine.state_mut().set_gpr64(RAX, 0xffff_ffff);
    machine.state_mut().set_gpr64(RCX, 1);
    load_code(&mut machine, 0x1000, &[0x01, 0xc8]);
    run_until(&mut machine, 0x1002, 4);

    let state = machine.state();
    assert_eq!(state.read_gpr(RAX, Size::Dword, false), 0);
    assert!(state.flag(Rflags::CF));
    assert!(state.flag(Rflags::ZF));
    assert!(state.flag(Rflags::AF));
    assert!(state.flag(Rflags::PF));
    assert!(!state.flag(Rflags::OF));
}

#[test]
fn thirty_two_bit_writes_zero_extend() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RBX, 0xdead_beef_0000_0000);
    // mov ebx, 0x12345678
    load_code(&mut machine, 0x1000, &[0xbb, 0x78, 0x56, 0x34, 0x12]);
    run_until(&mut machine, 0x1005, 4);

    assert_eq!(machine.state().gpr64(RBX), 0x1234_5678);
}

#[test]
fn high_byte_registers_survive_neighbouring_writes() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RAX, 0x1122);
    // mov ah, 0x7f; mov al, 0x01
    load_code(&mut machine, 0x1000, &[0xb4, 0x7f, 0xb0, 0x01]);
    run_until(&mut machine, 0x1004, 4);

    assert_eq!(machine.state().read_gpr(RAX, Size::Word, false), 0x7f01);
}

#[test]
fn cmp_never_writes_its_destination() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RAX, 0x10);
    machine.state_mut().set_gpr64(RBX, 0x05);
    // cmp eax, ebx
    load_code(&mut machine, 0x1000, &[0x3b, 0xc3]);
    run_until(&mut machine, 0x1002, 4);

    let state = machine.state();
    assert_eq!(state.read_gpr(RAX, Size::Dword, false), 0x10);
    assert!(!state.flag(Rflags::CF));
    assert!(!state.flag(Rflags::ZF));
}

#[test]
fn conditional_branch_follows_the_nibble_map() {
    let mut machine = flat32();

    // cmp eax, ebx; ja +0x10 with EAX > EBX: taken.
    machine.state_mut().set_gpr64(RAX, 0x10);
    machine.state_mut().set_gpr64(RBX, 0x05);
    load_code(&mut machine, 0x1000, &[0x3b, 0xc3, 0x77, 0x10]);
    run_until(&mut machine, 0x1014, 4);

    // jle over the same values: not taken.
    load_code(&mut machine, 0x2000, &[0x3b, 0xc3, 0x7e, 0x10]);
    run_until(&mut machine, 0x2004, 4);
}

#[test]
fn imul_two_operand_reports_overflow_in_cf_and_of() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RAX, 0x4000_0000);
    machine.state_mut().set_gpr64(RBX, 4);
    // imul eax, ebx
    load_code(&mut machine, 0x1000, &[0x0f, 0xaf, 0xc3]);
    run_until(&mut machine, 0x1003, 4);

    assert!(machine.state().flag(Rflags::CF));
    assert!(machine.state().flag(Rflags::OF));

    machine.state_mut().set_gpr64(RAX, 0xffff_fffb); // -5
    machine.state_mut().set_gpr64(RBX, 3);
    load_code(&mut machine, 0x2000, &[0x0f, 0xaf, 0xc3]);
    run_until(&mut machine, 0x2003, 4);

    assert_eq!(
        machine.state().read_gpr(RAX, Size::Dword, false),
        0xffff_fff1 // -15
    );
    assert!(!machine.state().flag(Rflags::CF));
}

#[test]
fn cmpxchg_match_and_mismatch() {
    let mut machine = flat32();

    // Equal: destination takes the source, ZF set.
    machine.state_mut().set_gpr64(RAX, 7);
    machine.state_mut().set_gpr64(RBX, 7);
    machine.state_mut().set_gpr64(RCX, 0x99);
    // cmpxchg ebx, ecx
    load_code(&mut machine, 0x1000, &[0x0f, 0xb1, 0xcb]);
    run_until(&mut machine, 0x1003, 4);

    assert!(machine.state().flag(Rflags::ZF));
    assert_eq!(machine.state().read_gpr(RBX, Size::Dword, false), 0x99);

    // Unequal: the accumulator observes the destination, ZF clear.
    machine.state_mut().set_gpr64(RAX, 1);
    machine.state_mut().set_gpr64(RBX, 2);
    load_code(&mut machine, 0x2000, &[0x0f, 0xb1, 0xcb]);
    run_until(&mut machine, 0x2003, 4);

    assert!(!machine.state().flag(Rflags::ZF));
    assert_eq!(machine.state().read_gpr(RAX, Size::Dword, false), 2);
    assert_eq!(machine.state().read_gpr(RBX, Size::Dword, false), 2);
}

#[test]
fn xadd_exchanges_while_adding() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RAX, 3);
    machine.state_mut().set_gpr64(RBX, 5);
    // xadd eax, ebx
    load_code(&mut machine, 0x1000, &[0x0f, 0xc1, 0xd8]);
    run_until(&mut machine, 0x1003, 4);

    assert_eq!(machine.state().read_gpr(RAX, Size::Dword, false), 8);
    assert_eq!(machine.state().read_gpr(RBX, Size::Dword, false), 3);
}

#[test]
fn rep_movsb_copies_and_advances() {
    let mut machine = flat32();

    machine.memory_mut().write_from(0x4000, b"pattern!");
    machine.state_mut().set_gpr64(RSI, 0x4000);
    machine.state_mut().set_gpr64(RDI, 0x5000);
    machine.state_mut().set_gpr64(RCX, 8);
    machine.state_mut().set_flag(Rflags::DF, false);

    // rep movsb
    load_code(&mut machine, 0x1000, &[0xf3, 0xa4]);
    run_until(&mut machine, 0x1002, 32);

    let mut copied = [0u8; 8];
    machine.memory_mut().read_into(0x5000, &mut copied);
    assert_eq!(&copied, b"pattern!");

    let state = machine.state();
    assert_eq!(state.read_gpr(RCX, Size::Dword, false), 0);
    assert_eq!(state.read_gpr(RSI, Size::Dword, false), 0x4008);
    assert_eq!(state.read_gpr(RDI, Size::Dword, false), 0x5008);
}

#[test]
fn repe_cmpsb_stops_at_the_first_difference() {
    let mut machine = flat32();

    machine.memory_mut().write_from(0x4000, b"abcX");
    machine.memory_mut().write_from(0x5000, b"abcY");
    machine.state_mut().set_gpr64(RSI, 0x4000);
    machine.state_mut().set_gpr64(RDI, 0x5000);
    machine.state_mut().set_gpr64(RCX, 8);

    // repe cmpsb
    load_code(&mut machine, 0x1000, &[0xf3, 0xa6]);
    run_until(&mut machine, 0x1002, 32);

    let state = machine.state();
    // Four iterations ran; ECX counted them down.
    assert_eq!(state.read_gpr(RCX, Size::Dword, false), 4);
    assert!(!state.flag(Rflags::ZF));
}

#[test]
fn cmov_false_still_computes_the_address_but_never_loads() {
    let mut machine = flat32();

    // cmovz eax, [0xdeadf000]: the address is far outside RAM, but with ZF clear the
    // load must not happen and must not fault.
    machine.state_mut().set_flag(Rflags::ZF, false);
    machine.state_mut().set_gpr64(RAX, 0x1234);
    load_code(
        &mut machine,
        0x1000,
        &[0x0f, 0x44, 0x05, 0x00, 0xf0, 0xad, 0xde],
    );
    run_until(&mut machine, 0x1007, 4);

    assert_eq!(machine.state().read_gpr(RAX, Size::Dword, false), 0x1234);
}

#[test]
fn push_pop_round_trip_through_the_stack_segment() {
    let mut machine = flat32();

    machine.state_mut().set_gpr64(RAX, 0xcafe_babe);
    // push eax; pop ebx
    load_code(&mut machine, 0x1000, &[0x50, 0x5b]);
    run_until(&mut machine, 0x1002, 4);

    assert_eq!(
        machine.state().read_gpr(RBX, Size::Dword, false),
        0xcafe_babe
    );
    assert_eq!(machine.state().gpr64(RSP), 0x8_0000);
}

#[test]
fn div_by_zero_delivers_vector_zero() {
    let mut machine = flat32();

    // An IDT whose vector 0 gate points at a HLT handler.
    let idt = 0x6000u64;
    let handler = 0x9000u64;

    machine.memory_mut().write_phys16(idt, (handler & 0xffff) as u16);
    machine.memory_mut().write_phys16(idt + 2, 0x18); // boot code selector
    machine.memory_mut().write_phys8(idt + 4, 0);
    machine.memory_mut().write_phys8(idt + 5, 0x8e);
    machine
        .memory_mut()
        .write_phys16(idt + 6, (handler >> 16) as u16);

    machine.state_mut().idtr = sx_rs::arch::x86_64::DescriptorTable {
        base: idt,
        limit: 0x7ff,
    };

    // The boot GDT written by power_on_flat32 backs the gate's code selector.
    machine.state_mut().set_gpr64(RAX, 1);
    machine.state_mut().set_gpr64(RBX, 0);
    machine.state_mut().set_gpr64(RDX, 0);
    // div ebx
    load_code(&mut machine, 0x1000, &[0xf7, 0xf3]);

    run_until(&mut machine, handler, 8);
}

#[test]
fn interrupt_shadow_blocks_exactly_one_instruction() {
    let mut machine = flat32();

    // sti; nop; nop - the injected interrupt may not be taken until after the first
    // instruction following STI.
    machine.state_mut().set_flag(Rflags::IF, false);
    load_code(&mut machine, 0x1000, &[0xfb, 0x90, 0x90]);

    // An IVT-style IDT for vector 0x20.
    let idt = 0x6000u64;
    let handler = 0x9000u64;
    let entry = idt + 0x20 * 8;

    machine
        .memory_mut()
        .write_phys16(entry, (handler & 0xffff) as u16);
    machine.memory_mut().write_phys16(entry + 2, 0x18);
    machine.memory_mut().write_phys8(entry + 4, 0);
    machine.memory_mut().write_phys8(entry + 5, 0x8e);
    machine
        .memory_mut()
        .write_phys16(entry + 6, (handler >> 16) as u16);

    machine.state_mut().idtr = sx_rs::arch::x86_64::DescriptorTable {
        base: idt,
        limit: 0x7ff,
    };

    machine.inject_interrupt(0x20);

    // STI retires; the shadow is armed.
    assert!(machine.step().is_none());
    assert_eq!(machine.state().rip, 0x1001);

    // The first NOP retires; the interrupt still waits.
    assert!(machine.step().is_none());
    assert_eq!(machine.state().rip, 0x1002);

    // Now delivery happens before the second NOP.
    assert!(machine.step().is_none());
    assert_eq!(machine.state().rip, handler);
}
