//! The patterned-instruction engine: hot-counter behaviour, fingerprint validation and,
//! most importantly, bit-identity between a sequence run through the byte-at-a-time
//! interpreter and the same sequence run through its compiled closure.

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

/// Visits `rip` often enough to cross the hit threshold and trigger compilation. Every
/// visit executes one slow instruction, so the register file is scratched and the caller
/// re-establishes state afterwards.
fn heat(machine: &mut Machine, rip: u64) {
    for _ in 0..10 {
        machine.state_mut().rip = rip;
        machine.state_mut().set_gpr64(RSP, 0x8_0000);
        assert!(machine.step().is_none());
    }
}

fn step_until(machine: &mut Machine, stop: u64, cap: u64) {
    for _ in 0..cap {
        if machine.state().rip == stop {
            return;
        }

        assert!(machine.step().is_none(), "machine exited unexpectedly");
    }

    panic!("did not reach {stop:#x}; rip {:#x}", machine.state().rip);
}

fn arithmetic_flags(machine: &Machine) -> (bool, bool, bool, bool, bool, bool) {
    let state = machine.state();
    (
        state.flag(Rflags::CF),
        state.flag(Rflags::PF),
        state.flag(Rflags::AF),
        state.flag(Rflags::ZF),
        state.flag(Rflags::SF),
        state.flag(Rflags::OF),
    )
}

#[test]
fn hit_counter_gates_compilation() {
    let mut machine = flat32();
    let rip = 0x1000;

    machine
        .memory_mut()
        .write_from(rip, &[0x3b, 0xc3, 0x77, 0x10]);

    for _ in 0..9 {
        machine.state_mut().rip = rip;
        assert!(machine.step().is_none());
        assert!(!machine.pattern_engine().is_compiled(rip));
    }

    // The tenth visit compiles; the entry never recompiles after that.
    machine.state_mut().rip = rip;
    assert!(machine.step().is_none());
    assert!(machine.pattern_engine().is_compiled(rip));
}

#[test]
fn unrecognized_bytes_cache_a_no_pattern_marker() {
    let mut machine = flat32();
    let rip = 0x1000;

    // nop; nop: nothing registered matches.
    machine.memory_mut().write_from(rip, &[0x90, 0x90]);

    for _ in 0..10 {
        machine.state_mut().rip = rip;
        assert!(machine.step().is_none());
    }

    assert!(machine.pattern_engine().is_no_pattern(rip));
    assert!(!machine.pattern_engine().is_compiled(rip));
}

#[test]
fn cmp_ja_taken_scenario() {
    let mut machine = flat32();
    let rip = 0x1000;

    machine
        .memory_mut()
        .write_from(rip, &[0x3b, 0xc3, 0x77, 0x10]);
    heat(&mut machine, rip);
    assert!(machine.pattern_engine().is_compiled(rip));

    machine.state_mut().set_gpr64(RAX, 0x10);
    machine.state_mut().set_gpr64(RBX, 0x05);
    machine.state_mut().rip = rip;
    assert!(machine.step().is_none());

    assert_eq!(machine.state().rip, 0x1014);
    assert!(!machine.state().flag(Rflags::CF));
    assert!(!machine.state().flag(Rflags::ZF));
}

#[test]
fn cmp_jcc_pattern_matches_the_interpreter_bit_for_bit() {
    let cases = [
        (0x10u64, 0x05u64),
        (0x05, 0x10),
        (7, 7),
        (0x8000_0000, 1),
        (0, 0xffff_ffff),
    ];

    for (eax, ebx) in cases {
        // Cold: pure interpreter.
        let mut cold = flat32();
        cold.memory_mut()
            .write_from(0x1000, &[0x3b, 0xc3, 0x77, 0x10]);
        cold.state_mut().set_gpr64(RAX, eax);
        cold.state_mut().set_gpr64(RBX, ebx);
        cold.state_mut().rip = 0x1000;
        assert!(cold.step().is_none()); // cmp
        assert!(cold.step().is_none()); // ja

        // Hot: compiled closure.
        let mut hot = flat32();
        hot.memory_mut()
            .write_from(0x1000, &[0x3b, 0xc3, 0x77, 0x10]);
        heat(&mut hot, 0x1000);
        hot.state_mut().set_gpr64(RAX, eax);
        hot.state_mut().set_gpr64(RBX, ebx);
        hot.state_mut().rip = 0x1000;
        assert!(hot.step().is_none());

        assert_eq!(hot.state().rip, cold.state().rip, "rip for {eax:#x}/{ebx:#x}");
        assert_eq!(
            arithmetic_flags(&hot),
            arithmetic_flags(&cold),
            "flags for {eax:#x}/{ebx:#x}"
        );
    }
}

#[test]
fn add_adc_carry_chain_scenario() {
    let code = [0x01, 0xc8, 0x11, 0xda]; // add eax, ecx; adc edx, ebx

    // Cold reference first.
    let mut cold = flat32();
    cold.memory_mut().write_from(0x1000, &code);
    cold.state_mut().set_gpr64(RAX, 0xffff_ffff);
    cold.state_mut().set_gpr64(RCX, 1);
    cold.state_mut().set_gpr64(RBX, 0);
    cold.state_mut().set_gpr64(RDX, 0);
    cold.state_mut().rip = 0x1000;
    assert!(cold.step().is_none());
    assert!(cold.step().is_none());

    let mut hot = flat32();
    hot.memory_mut().write_from(0x1000, &code);
    heat(&mut hot, 0x1000);
    assert!(hot.pattern_engine().is_compiled(0x1000));

    hot.state_mut().set_gpr64(RAX, 0xffff_ffff);
    hot.state_mut().set_gpr64(RCX, 1);
    hot.state_mut().set_gpr64(RBX, 0);
    hot.state_mut().set_gpr64(RDX, 0);
    hot.state_mut().rip = 0x1000;
    assert!(hot.step().is_none());

    for machine in [&cold, &hot] {
        let state = machine.state();
        assert_eq!(state.read_gpr(RAX, Size::Dword, false), 0);
        assert_eq!(state.read_gpr(RCX, Size::Dword, false), 1);
        // The carry from the low add propagates into EDX.
        assert_eq!(state.read_gpr(RDX, Size::Dword, false), 1);
        assert_eq!(state.read_gpr(RBX, Size::Dword, false), 0);
        // The terminating ADC generated no carry of its own.
        assert!(!state.flag(Rflags::CF));
        assert_eq!(state.rip, 0x1004);
    }

    assert_eq!(arithmetic_flags(&hot), arithmetic_flags(&cold));
}

/// The five-instruction byte-reversed copy loop from the spec, at RIP 0x100.
const MEMMOVE_BACKWARD: [u8; 13] = [
    0x83, 0xe9, 0x01, // sub ecx, 1
    0x72, 0x08, // jb +8 (exit)
    0x8a, 0x14, 0x0e, // mov dl, [esi+ecx]
    0x88, 0x14, 0x08, // mov [eax+ecx], dl
    0xeb, 0xf3, // jmp -13 (loop)
];

#[test]
fn memmove_backward_scenario() {
    let mut hot = flat32();
    hot.memory_mut().write_from(0x100, &MEMMOVE_BACKWARD);
    hot.memory_mut().write_from(0x2000, b"ABCD\0");
    heat(&mut hot, 0x100);
    assert!(hot.pattern_engine().is_compiled(0x100));

    hot.state_mut().set_gpr64(RCX, 4);
    hot.state_mut().set_gpr64(RSI, 0x2000);
    hot.state_mut().set_gpr64(RAX, 0x3000);
    hot.state_mut().set_gpr64(RDX, 0);
    hot.state_mut().rip = 0x100;
    assert!(hot.step().is_none());

    let mut copied = [0u8; 4];
    hot.memory_mut().read_into(0x3000, &mut copied);
    assert_eq!(&copied, b"ABCD");

    let state = hot.state();
    assert_eq!(state.read_gpr(RCX, Size::Dword, false), 0xffff_ffff);
    assert!(state.flag(Rflags::CF));
    assert!(state.flag(Rflags::SF));
    assert!(state.flag(Rflags::AF));
    assert!(state.flag(Rflags::PF));
    assert!(!state.flag(Rflags::ZF));
    assert_eq!(state.read_gpr(RDX, Size::Byte, false), 0x41);
    assert_eq!(state.rip, 0x100 + 13);
}

#[test]
fn memmove_backward_matches_the_interpreter() {
    let mut cold = flat32();
    cold.memory_mut().write_from(0x100, &MEMMOVE_BACKWARD);
    cold.memory_mut().write_from(0x2000, b"ABCD\0");
    cold.state_mut().set_gpr64(RCX, 4);
    cold.state_mut().set_gpr64(RSI, 0x2000);
    cold.state_mut().set_gpr64(RAX, 0x3000);
    cold.state_mut().set_gpr64(RDX, 0);
    cold.state_mut().rip = 0x100;
    step_until(&mut cold, 0x100 + 13, 64);

    let mut hot = flat32();
    hot.memory_mut().write_from(0x100, &MEMMOVE_BACKWARD);
    hot.memory_mut().write_from(0x2000, b"ABCD\0");
    heat(&mut hot, 0x100);
    hot.state_mut().set_gpr64(RCX, 4);
    hot.state_mut().set_gpr64(RSI, 0x2000);
    hot.state_mut().set_gpr64(RAX, 0x3000);
    hot.state_mut().set_gpr64(RDX, 0);
    hot.state_mut().rip = 0x100;
    assert!(hot.step().is_none());

    assert_eq!(hot.state().rip, cold.state().rip);
    assert_eq!(arithmetic_flags(&hot), arithmetic_flags(&cold));

    for reg in [RAX, RCX, RDX, RSI, RDI] {
        assert_eq!(hot.state().gpr64(reg), cold.state().gpr64(reg));
    }

    let mut cold_bytes = [0u8; 8];
    let mut hot_bytes = [0u8; 8];
    cold.memory_mut().read_into(0x3000, &mut cold_bytes);
    hot.memory_mut().read_into(0x3000, &mut hot_bytes);
    assert_eq!(hot_bytes, cold_bytes);
}

/// The forward copy loop: cmp edi, eax; je exit; movsb; jmp loop.
const MEMMOVE_FORWARD: [u8; 7] = [0x39, 0xc7, 0x74, 0x03, 0xa4, 0xeb, 0xf9];

#[test]
fn memmove_forward_matches_the_interpreter() {
    let setup = |machine: &mut Machine| {
        machine.memory_mut().write_from(0x100, &MEMMOVE_FORWARD);
        machine.memory_mut().write_from(0x4000, b"0123456789");
        machine.state_mut().set_gpr64(RSI, 0x4000);
        machine.state_mut().set_gpr64(RDI, 0x5000);
        machine.state_mut().set_gpr64(RAX, 0x500a);
        machine.state_mut().set_flag(Rflags::DF, false);
        machine.state_mut().rip = 0x100;
    };

    let mut cold = flat32();
    setup(&mut cold);
    step_until(&mut cold, 0x107, 256);

    let mut hot = flat32();
    hot.memory_mut().write_from(0x100, &MEMMOVE_FORWARD);
    heat(&mut hot, 0x100);
    assert!(hot.pattern_engine().is_compiled(0x100));
    setup(&mut hot);
    assert!(hot.step().is_none());

    assert_eq!(hot.state().rip, cold.state().rip);
    assert_eq!(arithmetic_flags(&hot), arithmetic_flags(&cold));

    for reg in [RAX, RSI, RDI] {
        assert_eq!(hot.state().gpr64(reg), cold.state().gpr64(reg));
    }

    let mut cold_bytes = [0u8; 10];
    let mut hot_bytes = [0u8; 10];
    cold.memory_mut().read_into(0x5000, &mut cold_bytes);
    hot.memory_mut().read_into(0x5000, &mut hot_bytes);
    assert_eq!(hot_bytes, cold_bytes);
    assert_eq!(&hot_bytes, b"0123456789");
}

#[test]
fn memmove_forward_skips_over_observer_zones() {
    let mut machine = flat32();
    machine.memory_mut().write_from(0x100, &MEMMOVE_FORWARD);
    heat(&mut machine, 0x100);
    assert!(machine.pattern_engine().is_compiled(0x100));

    // Destination range crosses the legacy video window: the closure must decline and
    // the slow path must take over one instruction at a time.
    machine.state_mut().set_gpr64(RSI, 0x4000);
    machine.state_mut().set_gpr64(RDI, 0x9_fff0);
    machine.state_mut().set_gpr64(RAX, 0xa_0010);
    machine.state_mut().set_flag(Rflags::DF, false);
    machine.state_mut().rip = 0x100;

    assert!(machine.step().is_none());
    // One slow CMP retired instead of the whole accelerated loop.
    assert_eq!(machine.state().rip, 0x102);
}

/// The compiler memset shape: dword body plus byte tail.
const MEMSET_DWORD: [u8; 14] = [
    0x89, 0xd1, // mov ecx, edx
    0xc1, 0xe9, 0x02, // shr ecx, 2
    0xf3, 0xab, // rep stosd
    0x89, 0xd1, // mov ecx, edx
    0x83, 0xe1, 0x03, // and ecx, 3
    0xf3, 0xaa, // rep stosb
];

#[test]
fn memset_dword_matches_the_interpreter() {
    let setup = |machine: &mut Machine| {
        machine.memory_mut().write_from(0x100, &MEMSET_DWORD);
        machine.state_mut().set_gpr64(RDX, 10);
        machine.state_mut().set_gpr64(RAX, 0x4141_4141);
        machine.state_mut().set_gpr64(RDI, 0x6000);
        machine.state_mut().set_flag(Rflags::DF, false);
        machine.state_mut().rip = 0x100;
    };

    let mut cold = flat32();
    setup(&mut cold);
    step_until(&mut cold, 0x10e, 64);

    let mut hot = flat32();
    hot.memory_mut().write_from(0x100, &MEMSET_DWORD);
    heat(&mut hot, 0x100);
    assert!(hot.pattern_engine().is_compiled(0x100));
    setup(&mut hot);
    assert!(hot.step().is_none());

    assert_eq!(hot.state().rip, cold.state().rip);
    assert_eq!(arithmetic_flags(&hot), arithmetic_flags(&cold));

    for reg in [RAX, RCX, RDX, RDI] {
        assert_eq!(hot.state().gpr64(reg), cold.state().gpr64(reg));
    }

    let mut bytes = [0u8; 12];
    hot.memory_mut().read_into(0x6000, &mut bytes);
    assert_eq!(&bytes[..10], b"AAAAAAAAAA");
    assert_eq!(&bytes[10..], &[0, 0]);
}

/// The scan-and-copy strcpy loop.
const STRCPY: [u8; 11] = [
    0x8a, 0x1c, 0x11, // mov bl, [ecx+edx]
    0x88, 0x1c, 0x10, // mov [eax+edx], bl
    0x42, // inc edx
    0x84, 0xdb, // test bl, bl
    0x75, 0xf5, // jnz -11
];

#[test]
fn strcpy_matches_the_interpreter() {
    let setup = |machine: &mut Machine| {
        machine.memory_mut().write_from(0x100, &STRCPY);
        machine.memory_mut().write_from(0x4000, b"HELLO\0");
        machine.state_mut().set_gpr64(RCX, 0x4000);
        machine.state_mut().set_gpr64(RAX, 0x9000);
        machine.state_mut().set_gpr64(RDX, 0);
        machine.state_mut().rip = 0x100;
    };

    let mut cold = flat32();
    setup(&mut cold);
    step_until(&mut cold, 0x10b, 64);

    let mut hot = flat32();
    hot.memory_mut().write_from(0x100, &STRCPY);
    heat(&mut hot, 0x100);
    assert!(hot.pattern_engine().is_compiled(0x100));
    setup(&mut hot);
    assert!(hot.step().is_none());

    assert_eq!(hot.state().rip, cold.state().rip);
    assert_eq!(arithmetic_flags(&hot), arithmetic_flags(&cold));

    for reg in [RAX, RBX, RCX, RDX] {
        assert_eq!(hot.state().gpr64(reg), cold.state().gpr64(reg));
    }

    let mut bytes = [0u8; 6];
    hot.memory_mut().read_into(0x9000, &mut bytes);
    assert_eq!(&bytes, b"HELLO\0");
    assert_eq!(hot.state().read_gpr(RDX, Size::Dword, false), 6);
    assert!(hot.state().flag(Rflags::ZF));
}

/// The divide-helper prologue the fingerprint recognizes.
const UDIVMODDI_PROLOGUE: [u8; 20] = [
    0x55, 0x57, 0x56, 0x53, // pushes
    0x8b, 0x74, 0x24, 0x14, // mov esi, [esp+0x14]
    0x8b, 0x7c, 0x24, 0x18, // mov edi, [esp+0x18]
    0x8b, 0x6c, 0x24, 0x1c, // mov ebp, [esp+0x1c]
    0x31, 0xdb, // xor ebx, ebx
    0x31, 0xc9, // xor ecx, ecx
];

#[test]
fn udivmoddi_scenario() {
    let mut machine = flat32();
    machine.memory_mut().write_from(0x1000, &UDIVMODDI_PROLOGUE);
    heat(&mut machine, 0x1000);
    assert!(machine.pattern_engine().is_compiled(0x1000));

    // Stack at call time: return address, then denominator low/high and the remainder
    // pointer. The dividend rides in EDX:EAX.
    let esp = 0x8_0000u64;
    machine.memory_mut().write_phys32(esp, 0x3000); // return address
    machine.memory_mut().write_phys32(esp + 4, 10); // denom low
    machine.memory_mut().write_phys32(esp + 8, 0); // denom high
    machine.memory_mut().write_phys32(esp + 12, 0x4000); // remainder pointer

    machine.state_mut().set_gpr64(RSP, esp);
    machine.state_mut().set_gpr64(RAX, 0);
    machine.state_mut().set_gpr64(RDX, 1); // EDX:EAX = 1 << 32
    machine.state_mut().rip = 0x1000;
    assert!(machine.step().is_none());

    let state = machine.state();
    assert_eq!(state.read_gpr(RAX, Size::Dword, false), 429_496_729);
    assert_eq!(state.read_gpr(RDX, Size::Dword, false), 0);
    assert_eq!(state.rip, 0x3000);
    assert_eq!(state.gpr64(RSP), esp + 4);
    assert_eq!(machine.memory().read_phys64(0x4000), 6);
}

#[test]
fn udivmoddi_agrees_with_host_division() {
    let cases: [(u64, u64); 4] = [
        (1 << 32, 10),
        (0xffff_ffff_ffff_ffff, 3),
        (12345, 12345),
        (7, 1 << 33),
    ];

    for (num, den) in cases {
        let mut machine = flat32();
        machine.memory_mut().write_from(0x1000, &UDIVMODDI_PROLOGUE);
        heat(&mut machine, 0x1000);

        let esp = 0x8_0000u64;
        machine.memory_mut().write_phys32(esp, 0x3000);
        machine.memory_mut().write_phys32(esp + 4, den as u32);
        machine.memory_mut().write_phys32(esp + 8, (den >> 32) as u32);
        machine.memory_mut().write_phys32(esp + 12, 0x4000);

        machine.state_mut().set_gpr64(RSP, esp);
        machine.state_mut().set_gpr64(RAX, num & 0xffff_ffff);
        machine.state_mut().set_gpr64(RDX, num >> 32);
        machine.state_mut().rip = 0x1000;
        assert!(machine.step().is_none());

        let quotient = u64::from(machine.state().read_gpr(RDX, Size::Dword, false) as u32)
            << 32
            | machine.state().read_gpr(RAX, Size::Dword, false);

        assert_eq!(quotient, num / den, "quotient for {num}/{den}");
        assert_eq!(
            machine.memory().read_phys64(0x4000),
            num % den,
            "remainder for {num}/{den}"
        );
    }
}
