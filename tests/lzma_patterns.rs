//! The LZMA range-decoder fast paths, validated by equivalence: the routine and its
//! callers are real 32-bit code, so the cold machine interprets them byte by byte while
//! the hot machine runs the compiled closures, and every register, flag and touched
//! memory byte must agree.

use sx_rs::arch::x86_64::{Rflags, RAX, RBP, RBX, RCX, RDI, RDX, RSI, RSP};
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

const ROUTINE: u64 = 0x2000;
const STATE_BLOCK: u32 = 0x7000;
const PROBS: u32 = 0x7400;
const RETURN: u64 = 0x3000;
const STACK: u64 = 0x8_0000;

/// The decode-bit routine with its two global addresses filled in.
fn rc_routine() -> Vec<u8> {
    let mut code = vec![
        0x56, // push esi
        0xbe, 0, 0, 0, 0, // mov esi, STATE
        0x8d, 0x0c, 0x45, 0, 0, 0, 0, // lea ecx, [eax*2 + PROBS]
        0x0f, 0xb7, 0x19, // movzx ebx, word [ecx]
        0x8b, 0x16, // mov edx, [esi]
        0xc1, 0xea, 0x0b, // shr edx, 11
        0x0f, 0xaf, 0xd3, // imul edx, ebx
        0x39, 0x56, 0x04, // cmp [esi+4], edx
        0x73, 0x12, // jae bit1
        0x89, 0x16, // mov [esi], edx
        0xba, 0x00, 0x08, 0x00, 0x00, // mov edx, 2048
        0x29, 0xda, // sub edx, ebx
        0xc1, 0xea, 0x05, // shr edx, 5
        0x01, 0xd3, // add ebx, edx
        0xb2, 0x00, // mov dl, 0
        0xeb, 0x0e, // jmp store
        0x29, 0x56, 0x04, // sub [esi+4], edx
        0x29, 0x16, // sub [esi], edx
        0x89, 0xda, // mov edx, ebx
        0xc1, 0xea, 0x05, // shr edx, 5
        0x29, 0xd3, // sub ebx, edx
        0xb2, 0x01, // mov dl, 1
        0x66, 0x89, 0x19, // mov [ecx], bx
        0x81, 0x3e, 0x00, 0x00, 0x00, 0x01, // cmp dword [esi], 0x1000000
        0x73, 0x14, // jae fin
        0xc1, 0x26, 0x08, // shl dword [esi], 8
        0x8b, 0x4e, 0x08, // mov ecx, [esi+8]
        0x8a, 0x19, // mov bl, [ecx]
        0xff, 0x46, 0x08, // inc dword [esi+8]
        0xc1, 0x66, 0x04, 0x08, // shl dword [esi+4], 8
        0x00, 0x5e, 0x04, // add [esi+4], bl
        0xeb, 0xe4, // jmp norm
        0xf6, 0xda, // neg dl
        0x5e, // pop esi
        0xc3, // ret
    ];

    code[2..6].copy_from_slice(&STATE_BLOCK.to_le_bytes());
    code[9..13].copy_from_slice(&PROBS.to_le_bytes());
    code
}

/// Patches a `call rel32` at `offset` inside code placed at `base` to reach [`ROUTINE`].
fn patch_call(code: &mut [u8], base: u64, offset: usize) {
    assert_eq!(code[offset], 0xe8);
    let next = base as u32 + offset as u32 + 5;
    let rel = (ROUTINE as u32).wrapping_sub(next);
    code[offset + 1..offset + 5].copy_from_slice(&rel.to_le_bytes());
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
    machine.state_mut().set_gpr64(RSP, STACK);
    machine
}

/// Seeds the decoder state block, the probability slots and the compressed byte stream.
fn seed_decoder(machine: &mut Machine, range: u32, code: u32) {
    let mem = machine.memory_mut();

    mem.write_phys32(u64::from(STATE_BLOCK), range);
    mem.write_phys32(u64::from(STATE_BLOCK) + 4, code);
    mem.write_phys32(u64::from(STATE_BLOCK) + 8, 0x7800);

    for slot in 0..0x400u64 {
        mem.write_phys16(u64::from(PROBS) + slot * 2, 1024);
    }

    for (i, byte) in [0xde, 0xad, 0xbe, 0xef, 0x42, 0x17, 0x99, 0x5a]
        .iter()
        .enumerate()
    {
        mem.write_phys8(0x7800 + i as u64, *byte);
    }
}

fn heat(machine: &mut Machine, rip: u64) {
    for _ in 0..10 {
        machine.state_mut().rip = rip;
        machine.state_mut().set_gpr64(RSP, STACK);
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

fn assert_machines_agree(hot: &Machine, cold: &Machine, what: &str) {
    for reg in [RAX, RBX, RCX, RDX, RSI, RDI, RBP, RSP] {
        assert_eq!(
            hot.state().gpr64(reg),
            cold.state().gpr64(reg),
            "{what}: register {reg}"
        );
    }

    assert_eq!(hot.state().rip, cold.state().rip, "{what}: rip");

    for flag in [
        Rflags::CF,
        Rflags::PF,
        Rflags::AF,
        Rflags::ZF,
        Rflags::SF,
        Rflags::OF,
    ] {
        assert_eq!(
            hot.state().flag(flag),
            cold.state().flag(flag),
            "{what}: flag {flag:?}"
        );
    }

    // The decoder state block, the probability table and the stack page.
    let ranges = [
        (u64::from(STATE_BLOCK), 16u64),
        (u64::from(PROBS), 0x800),
        (STACK - 0x20, 0x20),
    ];

    for (start, len) in ranges {
        for offset in 0..len {
            assert_eq!(
                hot.memory().read_phys8(start + offset),
                cold.memory().read_phys8(start + offset),
                "{what}: memory at {:#x}",
                start + offset
            );
        }
    }
}

/// Drives one decode-bit call on both machines and compares everything.
fn rc_case(range: u32, code: u32, prob_index: u32, what: &str) {
    let routine = rc_routine();

    let mut cold = flat32();
    cold.memory_mut().write_from(ROUTINE, &routine);
    seed_decoder(&mut cold, range, code);
    cold.memory_mut().write_phys32(STACK, RETURN as u32);
    cold.state_mut().set_gpr64(RAX, u64::from(prob_index));
    cold.state_mut().rip = ROUTINE;
    step_until(&mut cold, RETURN, 256);

    let mut hot = flat32();
    hot.memory_mut().write_from(ROUTINE, &routine);
    seed_decoder(&mut hot, range, code);
    heat(&mut hot, ROUTINE);
    assert!(
        hot.pattern_engine().is_compiled(ROUTINE),
        "{what}: routine should compile"
    );

    // Heating scratched the decoder state; reseed before the measured run.
    seed_decoder(&mut hot, range, code);
    hot.memory_mut().write_phys32(STACK, RETURN as u32);
    hot.state_mut().set_gpr64(RAX, u64::from(prob_index));
    hot.state_mut().set_gpr64(RSP, STACK);
    hot.state_mut().rip = ROUTINE;
    assert!(hot.step().is_none());

    assert_machines_agree(&hot, &cold, what);
}

#[test]
fn decode_bit_zero_path_matches_the_interpreter() {
    // code < bound: the zero branch, no normalization.
    rc_case(0xffff_ffff, 0x1234_5678, 5, "bit0");
}

#[test]
fn decode_bit_one_path_with_normalization_matches() {
    // code >= bound at the minimum legal range: the one branch plus a renormalization
    // byte fetch.
    rc_case(0x0100_0000, 0x00a0_0000, 9, "bit1+norm");
}

#[test]
fn decode_bit_result_lands_in_carry() {
    let routine = rc_routine();

    let mut machine = flat32();
    machine.memory_mut().write_from(ROUTINE, &routine);
    seed_decoder(&mut machine, 0xffff_ffff, 0x1234_5678);
    heat(&mut machine, ROUTINE);

    seed_decoder(&mut machine, 0xffff_ffff, 0x1234_5678);
    machine.memory_mut().write_phys32(STACK, RETURN as u32);
    machine.state_mut().set_gpr64(RAX, 5);
    machine.state_mut().set_gpr64(RSP, STACK);
    machine.state_mut().rip = ROUTINE;
    assert!(machine.step().is_none());

    // code 0x12345678 is far below bound ((0xFFFFFFFF >> 11) * 1024): bit zero.
    assert!(!machine.state().flag(Rflags::CF));
    assert_eq!(machine.state().rip, RETURN);
    assert_eq!(machine.state().gpr64(RSP), STACK + 4);

    // The probability moved toward zero: 1024 + (2048-1024)/32.
    assert_eq!(
        machine.memory().read_phys16(u64::from(PROBS) + 10),
        1056
    );
}

const TREE_FN: u64 = 0x2100;

fn tree_fn_code() -> Vec<u8> {
    let mut code = vec![
        0xba, 0x01, 0x00, 0x00, 0x00, // mov edx, 1
        0x52, // push edx
        0x89, 0xd0, // mov eax, edx
        0x03, 0x44, 0x24, 0x08, // add eax, [esp+8]
        0xe8, 0, 0, 0, 0, // call rc_decode_bit
        0x5a, // pop edx
        0x11, 0xd2, // adc edx, edx
        0xfe, 0xc9, // dec cl
        0x75, 0xed, // jnz loop
        0xc3, // ret
    ];

    patch_call(&mut code, TREE_FN, 12);
    code
}

#[test]
fn tree_function_matches_the_interpreter() {
    let routine = rc_routine();
    let tree = tree_fn_code();

    let setup = |machine: &mut Machine| {
        machine.memory_mut().write_from(ROUTINE, &routine);
        machine.memory_mut().write_from(TREE_FN, &tree);
        seed_decoder(machine, 0xffff_ffff, 0x5151_aaaa);
        machine.memory_mut().write_phys32(STACK, RETURN as u32);
        machine.memory_mut().write_phys32(STACK + 4, 0x20); // probability base index
        machine.state_mut().set_gpr64(RSP, STACK);
        machine.state_mut().set_gpr64(RCX, 3); // CL: tree depth
        machine.state_mut().rip = TREE_FN;
    };

    let mut cold = flat32();
    setup(&mut cold);
    step_until(&mut cold, RETURN, 1024);

    let mut hot = flat32();
    hot.memory_mut().write_from(ROUTINE, &routine);
    hot.memory_mut().write_from(TREE_FN, &tree);
    seed_decoder(&mut hot, 0xffff_ffff, 0x5151_aaaa);
    heat(&mut hot, TREE_FN);
    assert!(hot.pattern_engine().is_compiled(TREE_FN));

    setup(&mut hot);
    assert!(hot.step().is_none());

    assert_machines_agree(&hot, &cold, "tree-fn");

    // Three decoded bits always leave the sentinel bit at 1 << 3.
    let edx = hot.state().gpr64(RDX) as u32;
    assert!(edx >= 8 && edx < 16, "symbol out of range: {edx:#x}");
}

const TREE_BYTE: u64 = 0x2200;

fn tree_byte_code() -> Vec<u8> {
    let mut code = vec![
        0x81, 0xfa, 0x00, 0x01, 0x00, 0x00, // cmp edx, 0x100
        0x73, 0x11, // jnc exit
        0x52, // push edx
        0x89, 0xd0, // mov eax, edx
        0x03, 0x44, 0x24, 0x08, // add eax, [esp+8]
        0xe8, 0, 0, 0, 0, // call rc_decode_bit
        0x5a, // pop edx
        0x11, 0xd2, // adc edx, edx
        0xeb, 0xe7, // jmp loop
    ];

    patch_call(&mut code, TREE_BYTE, 15);
    code
}

#[test]
fn tree_byte_loop_matches_the_interpreter() {
    let routine = rc_routine();
    let tree = tree_byte_code();

    let setup = |machine: &mut Machine| {
        machine.memory_mut().write_from(ROUTINE, &routine);
        machine.memory_mut().write_from(TREE_BYTE, &tree);
        seed_decoder(machine, 0xffff_ffff, 0x0666_0000);
        machine.memory_mut().write_phys32(STACK, 0); // enclosing return address
        machine.memory_mut().write_phys32(STACK + 4, 0); // probability base index
        machine.state_mut().set_gpr64(RSP, STACK);
        machine.state_mut().set_gpr64(RDX, 1);
        machine.state_mut().rip = TREE_BYTE;
    };

    let exit = TREE_BYTE + 25;

    let mut cold = flat32();
    setup(&mut cold);
    step_until(&mut cold, exit, 4096);

    let mut hot = flat32();
    hot.memory_mut().write_from(ROUTINE, &routine);
    hot.memory_mut().write_from(TREE_BYTE, &tree);
    seed_decoder(&mut hot, 0xffff_ffff, 0x0666_0000);
    heat(&mut hot, TREE_BYTE);
    assert!(hot.pattern_engine().is_compiled(TREE_BYTE));

    setup(&mut hot);
    assert!(hot.step().is_none());

    assert_machines_agree(&hot, &cold, "tree-byte");

    let edx = hot.state().gpr64(RDX) as u32;
    assert!((0x100..0x200).contains(&edx), "symbol out of range: {edx:#x}");
}

const LITERAL: u64 = 0x2300;

fn literal_code() -> Vec<u8> {
    let mut code = vec![
        0xba, 0x01, 0x00, 0x00, 0x00, // mov edx, 1
        0x52, // loop: push edx
        0x89, 0xe8, // mov eax, ebp
        0xc1, 0xe8, 0x07, // shr eax, 7
        0x83, 0xe0, 0x01, // and eax, 1
        0x01, 0xed, // add ebp, ebp
        0x89, 0xc7, // mov edi, eax
        0x40, // inc eax
        0xc1, 0xe0, 0x08, // shl eax, 8
        0x01, 0xd0, // add eax, edx
        0x03, 0x44, 0x24, 0x08, // add eax, [esp+8]
        0xe8, 0, 0, 0, 0, // call rc_decode_bit
        0x5a, // pop edx
        0x11, 0xd2, // adc edx, edx
        0x89, 0xd0, // mov eax, edx
        0x83, 0xe0, 0x01, // and eax, 1
        0x39, 0xc7, // cmp edi, eax
        0x75, 0x0a, // jne plain
        0x81, 0xfa, 0xff, 0x00, 0x00, 0x00, // cmp edx, 0xff
        0x76, 0xd0, // jbe loop
        0xeb, 0x19, // jmp done
        0x81, 0xfa, 0xff, 0x00, 0x00, 0x00, // plain: cmp edx, 0xff
        0x77, 0x11, // ja done
        0x52, // push edx
        0x89, 0xd0, // mov eax, edx
        0x03, 0x44, 0x24, 0x08, // add eax, [esp+8]
        0xe8, 0, 0, 0, 0, // call rc_decode_bit
        0x5a, // pop edx
        0x11, 0xd2, // adc edx, edx
        0xeb, 0xe7, // jmp plain
        0xc3, // done: ret
    ];

    patch_call(&mut code, LITERAL, 28);
    patch_call(&mut code, LITERAL, 70);
    code
}

#[test]
fn matched_literal_decoder_matches_the_interpreter() {
    let routine = rc_routine();
    let literal = literal_code();

    for matchbyte in [0x00u64, 0xb7, 0xff] {
        let setup = |machine: &mut Machine| {
            machine.memory_mut().write_from(ROUTINE, &routine);
            machine.memory_mut().write_from(LITERAL, &literal);
            seed_decoder(machine, 0xffff_ffff, 0x7b7b_0000);
            machine.memory_mut().write_phys32(STACK, RETURN as u32);
            machine.memory_mut().write_phys32(STACK + 4, 0x40); // probability base
            machine.state_mut().set_gpr64(RSP, STACK);
            machine.state_mut().set_gpr64(RBP, matchbyte);
            machine.state_mut().rip = LITERAL;
        };

        let mut cold = flat32();
        setup(&mut cold);
        step_until(&mut cold, RETURN, 8192);

        let mut hot = flat32();
        hot.memory_mut().write_from(ROUTINE, &routine);
        hot.memory_mut().write_from(LITERAL, &literal);
        seed_decoder(&mut hot, 0xffff_ffff, 0x7b7b_0000);
        heat(&mut hot, LITERAL);
        assert!(hot.pattern_engine().is_compiled(LITERAL));

        setup(&mut hot);
        assert!(hot.step().is_none());

        assert_machines_agree(&hot, &cold, "matched-literal");

        let edx = hot.state().gpr64(RDX) as u32;
        assert!(
            (0x100..0x200).contains(&edx),
            "symbol out of range for matchbyte {matchbyte:#x}: {edx:#x}"
        );
    }
}
