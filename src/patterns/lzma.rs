//! The LZMA range-decoder fast paths.
//!
//! The decompression stub at the front of a GRUB-class image spends most of its time in
//! one tiny routine: decode a single bit from the range coder, returning it in CF. Three
//! calling shapes sit on top of it (a byte-wide bit-tree loop, a counted bit-tree function
//! and the match-conditioned literal decoder), and all four are accelerated here.
//!
//! The routine keeps its state in a fixed block - range, code and the source pointer at
//! `STATE`, `STATE+4` and `STATE+8` - and its probabilities as 16-bit slots at `PROBS`.
//! Both addresses are immediates inside the routine body, so compilation extracts them
//! from the matched bytes; the caller patterns additionally chase their `call rel32` and
//! demand that the target matches the routine template byte for byte.
//!
//! Every closure validates its full write set (state block, probability slots, the stack
//! slots the emulated pushes land in) and the decoder invariants (probabilities in
//! 1..=2047, range at least 2^24) before the first store. Flag effects are reproduced by
//! running the same helper pipeline the interpreter would: NEG for the routine's CF
//! return, ADC for the tree accumulation, CMP/DEC for the loop exits.

use super::{mode_is_flat32, ss_linear, writable_range, Compiled, Pattern, Run, WINDOW};
use crate::arch::x86_64::{SegmentRegister, Size, RAX, RBP, RBX, RCX, RDI, RDX, RSI, RSP};
use crate::exec::flags;
use crate::mem::Memory;
use crate::paging;
use crate::segmentation::segment_base;
use crate::state::CpuState;
use log::debug;

/// The decode-bit routine, with holes at the two embedded addresses.
const RC_TEMPLATE: [u8; 96] = [
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

/// Byte ranges inside [`RC_TEMPLATE`] that hold the embedded addresses.
const RC_STATE_HOLE: std::ops::Range<usize> = 2..6;
const RC_PROBS_HOLE: std::ops::Range<usize> = 9..13;

/// The extracted globals of one routine instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Globals {
    state_block: u32,
    probs: u32,
}

fn parse_rc(window: &[u8]) -> Option<Globals> {
    if window.len() < RC_TEMPLATE.len() {
        return None;
    }

    for (index, expected) in RC_TEMPLATE.iter().enumerate() {
        if RC_STATE_HOLE.contains(&index) || RC_PROBS_HOLE.contains(&index) {
            continue;
        }

        if window[index] != *expected {
            return None;
        }
    }

    let word = |range: std::ops::Range<usize>| {
        u32::from_le_bytes([
            window[range.start],
            window[range.start + 1],
            window[range.start + 2],
            window[range.start + 3],
        ])
    };

    Some(Globals {
        state_block: word(RC_STATE_HOLE),
        probs: word(RC_PROBS_HOLE),
    })
}

/// Resolves a `call rel32` at `offset` inside the window and matches the routine at its
/// target, reading the target bytes through physical memory (the runtime preconditions
/// pin the flat identity mapping this assumes).
fn chase_call(rip: u64, window: &[u8], offset: usize, mem: &Memory) -> Option<Globals> {
    if *window.get(offset)? != 0xe8 {
        return None;
    }

    let rel = u32::from_le_bytes([
        *window.get(offset + 1)?,
        *window.get(offset + 2)?,
        *window.get(offset + 3)?,
        *window.get(offset + 4)?,
    ]);

    let target = (rip as u32)
        .wrapping_add(offset as u32 + 5)
        .wrapping_add(rel);

    let mut body = [0u8; WINDOW];
    mem.read_into(u64::from(target), &mut body);
    parse_rc(&body)
}

/// The flat-identity environment every LZMA closure was compiled against: 32-bit code,
/// paging off, zero CS/DS/SS bases.
fn lzma_env_ok(state: &CpuState) -> bool {
    mode_is_flat32(state)
        && !paging::paging_enabled(state)
        && segment_base(state, SegmentRegister::Cs) == 0
        && segment_base(state, SegmentRegister::Ds) == 0
        && segment_base(state, SegmentRegister::Ss) == 0
}

const RANGE_TOP: u32 = 1 << 24;

fn read_state_block(mem: &Memory, g: &Globals) -> (u32, u32, u32) {
    (
        mem.read_phys32(u64::from(g.state_block)),
        mem.read_phys32(u64::from(g.state_block.wrapping_add(4))),
        mem.read_phys32(u64::from(g.state_block.wrapping_add(8))),
    )
}

/// Validates that every probability slot in `[first, last]` (slot indices) holds a value
/// the decoder can make progress with.
fn probs_valid(mem: &Memory, g: &Globals, first: u32, last: u32) -> bool {
    for slot in first..=last {
        let addr = g.probs.wrapping_add(slot.wrapping_mul(2));
        let prob = mem.read_phys16(u64::from(addr));

        if prob == 0 || prob >= 2048 {
            return false;
        }
    }

    true
}

/// Everything a single decode-bit step leaves behind in registers.
struct StepEffects {
    bit: bool,
    /// The routine's EDX scratch before DL is overwritten by the bit marker.
    delta: u32,
    ecx: u32,
    ebx: u32,
}

/// One range-decoder step against guest memory. The caller has already validated the
/// write set; the entry invariants are rechecked so a torn guest state skips cleanly.
fn rc_step(mem: &mut Memory, g: &Globals, prob_index: u32) -> Option<StepEffects> {
    let slot_addr = g.probs.wrapping_add(prob_index.wrapping_mul(2));
    let prob = u32::from(mem.read_phys16(u64::from(slot_addr)));

    if prob == 0 || prob >= 2048 {
        return None;
    }

    let (range, code, _) = read_state_block(mem, g);

    if range < RANGE_TOP {
        return None;
    }

    let bound = (range >> 11).wrapping_mul(prob);

    let (bit, mut range, mut code, new_prob, delta) = if code < bound {
        let delta = (2048 - prob) >> 5;
        (false, bound, code, prob + delta, delta)
    } else {
        let delta = prob >> 5;
        (true, range - bound, code - bound, prob - delta, delta)
    };

    mem.write_phys16(u64::from(slot_addr), new_prob as u16);

    let mut ecx = slot_addr;
    let mut ebx = new_prob;

    while range < RANGE_TOP {
        let src = mem.read_phys32(u64::from(g.state_block.wrapping_add(8)));
        let byte = mem.read_phys8(u64::from(src));

        range <<= 8;
        code = code << 8 | u32::from(byte);

        mem.write_phys32(u64::from(g.state_block.wrapping_add(8)), src.wrapping_add(1));

        ecx = src;
        ebx = ebx & 0xffff_ff00 | u32::from(byte);
    }

    mem.write_phys32(u64::from(g.state_block), range);
    mem.write_phys32(u64::from(g.state_block.wrapping_add(4)), code);

    Some(StepEffects {
        bit,
        delta,
        ecx,
        ebx,
    })
}

/// Applies the routine's register and flag epilogue for one step: EBX/ECX scratch, the
/// NEG DL bit return and the EDX image around it.
fn apply_step_registers(state: &mut CpuState, effects: &StepEffects) {
    state.write_gpr(RBX, Size::Dword, false, u64::from(effects.ebx));
    state.write_gpr(RCX, Size::Dword, false, u64::from(effects.ecx));

    let neg = flags::neg(state, u64::from(effects.bit), Size::Byte);
    let edx = u64::from(effects.delta) & 0xffff_ff00 | neg;
    state.write_gpr(RDX, Size::Dword, false, edx);
}

/// Preflight shared by the three caller closures: the state block, the stack slots the
/// emulated pushes hit and the probability tree must all be writable, and the range
/// invariant must hold.
fn caller_preflight(
    state: &CpuState,
    mem: &Memory,
    g: &Globals,
    esp: u64,
    tree: &[(u32, u32)],
) -> bool {
    if !writable_range(state, mem, u64::from(g.state_block), 12) {
        return false;
    }

    let stack = ss_linear(state, esp);

    if !writable_range(state, mem, stack.wrapping_sub(12), 12) {
        return false;
    }

    let (range, _, _) = read_state_block(mem, g);

    if range < RANGE_TOP {
        return false;
    }

    for (first, last) in tree {
        let base = u64::from(g.probs.wrapping_add(first.wrapping_mul(2)));
        let len = u64::from(last - first + 1) * 2;

        if !writable_range(state, mem, base, len) || !probs_valid(mem, g, *first, *last) {
            return false;
        }
    }

    true
}

fn read_stack_dword(state: &CpuState, mem: &Memory, esp: u64, offset: u64) -> u32 {
    mem.read_phys32(ss_linear(state, esp.wrapping_add(offset)) & paging::linear_mask(state))
}

fn write_stack_dword(state: &CpuState, mem: &mut Memory, esp: u64, offset: i64, value: u32) {
    let addr =
        ss_linear(state, esp.wrapping_add(offset as u64)) & paging::linear_mask(state);
    mem.write_phys32(addr, value);
}

// --- The routine itself, called hot enough to compile at its own entry ---

pub struct RcDecodeBit;

struct RcDecodeBitBody {
    rip: u64,
    globals: Globals,
    logged: bool,
}

impl Pattern for RcDecodeBit {
    fn name(&self) -> &'static str {
        "lzma-rc-decode-bit"
    }

    fn try_compile(&self, rip: u64, window: &[u8], _mem: &Memory) -> Option<Box<dyn Compiled>> {
        let globals = parse_rc(window)?;

        Some(Box::new(RcDecodeBitBody {
            rip,
            globals,
            logged: false,
        }))
    }
}

impl Compiled for RcDecodeBitBody {
    fn name(&self) -> &'static str {
        "lzma-rc-decode-bit"
    }

    fn run(&mut self, state: &mut CpuState, mem: &mut Memory) -> Run {
        if !lzma_env_ok(state) {
            return Run::Skip;
        }

        let esp = state.read_gpr(RSP, Size::Dword, false);
        let index = state.read_gpr(RAX, Size::Dword, false) as u32;

        if !caller_preflight(state, mem, &self.globals, esp, &[(index, index)]) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("lzma-rc-decode-bit first execution at {:#x}", self.rip);
        }

        // PUSH ESI writes the saved copy just below the entry stack pointer.
        let esi = state.read_gpr(RSI, Size::Dword, false) as u32;
        write_stack_dword(state, mem, esp, -4, esi);

        let Some(effects) = rc_step(mem, &self.globals, index) else {
            return Run::Skip;
        };

        apply_step_registers(state, &effects);

        // RET.
        let return_rip = read_stack_dword(state, mem, esp, 0);
        state.write_gpr(RSP, Size::Dword, false, esp.wrapping_add(4));

        Run::Retired(u64::from(return_rip))
    }
}

// --- The byte-wide bit-tree loop ---

const TREE_BYTE_LEN: u64 = 25;

const TREE_BYTE_TEMPLATE: [u8; 25] = [
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

const TREE_BYTE_CALL: usize = 15;

/// Compares a window against a template whose `call rel32` displacements (the four bytes
/// after each listed hole) are wildcards; the call opcodes themselves must match.
fn match_template(window: &[u8], template: &[u8], holes: &[usize]) -> bool {
    if window.len() < template.len() {
        return false;
    }

    template.iter().enumerate().all(|(index, expected)| {
        holes.iter().any(|hole| index > *hole && index < hole + 5)
            || window[index] == *expected
    })
}

pub struct TreeByte;

struct TreeByteBody {
    rip: u64,
    globals: Globals,
    logged: bool,
}

impl Pattern for TreeByte {
    fn name(&self) -> &'static str {
        "lzma-tree-byte"
    }

    fn try_compile(&self, rip: u64, window: &[u8], mem: &Memory) -> Option<Box<dyn Compiled>> {
        if !match_template(window, &TREE_BYTE_TEMPLATE, &[TREE_BYTE_CALL]) {
            return None;
        }

        let globals = chase_call(rip, window, TREE_BYTE_CALL, mem)?;

        Some(Box::new(TreeByteBody {
            rip,
            globals,
            logged: false,
        }))
    }
}

impl Compiled for TreeByteBody {
    fn name(&self) -> &'static str {
        "lzma-tree-byte"
    }

    fn run(&mut self, state: &mut CpuState, mem: &mut Memory) -> Run {
        if !lzma_env_ok(state) {
            return Run::Skip;
        }

        let esp = state.read_gpr(RSP, Size::Dword, false);
        let mut edx = state.read_gpr(RDX, Size::Dword, false) as u32;
        let exit = self.rip.wrapping_add(TREE_BYTE_LEN);

        // The loop entry test: a symbol already complete decodes nothing.
        if edx >= 0x100 {
            flags::sub(state, u64::from(edx), 0x100, Size::Dword);
            return Run::Retired(exit);
        }

        if edx == 0 {
            // A zero accumulator never reaches 0x100 by doubling.
            return Run::Skip;
        }

        let base = read_stack_dword(state, mem, esp, 4);

        let tree = [(base.wrapping_add(1), base.wrapping_add(0xff))];

        if !caller_preflight(state, mem, &self.globals, esp, &tree) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("lzma-tree-byte first execution at {:#x}", self.rip);
        }

        let esi = state.read_gpr(RSI, Size::Dword, false) as u32;
        let mut eax = 0u32;

        while edx < 0x100 {
            // PUSH EDX; the CALL and the routine's PUSH ESI fill the two slots below.
            write_stack_dword(state, mem, esp, -4, edx);
            write_stack_dword(state, mem, esp, -8, (self.rip as u32).wrapping_add(20));
            write_stack_dword(state, mem, esp, -12, esi);

            eax = edx.wrapping_add(base);

            let Some(effects) = rc_step(mem, &self.globals, eax) else {
                return Run::Skip;
            };

            apply_step_registers(state, &effects);

            // POP EDX then ADC EDX,EDX folds the bit in.
            edx = flags::adc(state, u64::from(edx), u64::from(edx), Size::Dword) as u32;
            flags::sub(state, u64::from(edx), 0x100, Size::Dword);
        }

        state.write_gpr(RAX, Size::Dword, false, u64::from(eax));
        state.write_gpr(RDX, Size::Dword, false, u64::from(edx));

        Run::Retired(exit)
    }
}

// --- The counted bit-tree function ---

const TREE_FN_TEMPLATE: [u8; 25] = [
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

const TREE_FN_CALL: usize = 12;

pub struct TreeFn;

struct TreeFnBody {
    rip: u64,
    globals: Globals,
    logged: bool,
}

impl Pattern for TreeFn {
    fn name(&self) -> &'static str {
        "lzma-tree-fn"
    }

    fn try_compile(&self, rip: u64, window: &[u8], mem: &Memory) -> Option<Box<dyn Compiled>> {
        if !match_template(window, &TREE_FN_TEMPLATE, &[TREE_FN_CALL]) {
            return None;
        }

        let globals = chase_call(rip, window, TREE_FN_CALL, mem)?;

        Some(Box::new(TreeFnBody {
            rip,
            globals,
            logged: false,
        }))
    }
}

impl Compiled for TreeFnBody {
    fn name(&self) -> &'static str {
        "lzma-tree-fn"
    }

    fn run(&mut self, state: &mut CpuState, mem: &mut Memory) -> Run {
        if !lzma_env_ok(state) {
            return Run::Skip;
        }

        let cl = state.read_gpr(RCX, Size::Byte, false) as u32;

        if cl == 0 || cl > 16 {
            return Run::Skip;
        }

        let esp = state.read_gpr(RSP, Size::Dword, false);
        let base = read_stack_dword(state, mem, esp, 4);

        let top = (1u32 << cl) - 1;
        let tree = [(base.wrapping_add(1), base.wrapping_add(top.max(1)))];

        if !caller_preflight(state, mem, &self.globals, esp, &tree) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("lzma-tree-fn first execution at {:#x}", self.rip);
        }

        let esi = state.read_gpr(RSI, Size::Dword, false) as u32;
        let mut edx = 1u32;
        let mut eax = 0u32;
        let mut count = cl;

        loop {
            write_stack_dword(state, mem, esp, -4, edx);
            write_stack_dword(state, mem, esp, -8, (self.rip as u32).wrapping_add(17));
            write_stack_dword(state, mem, esp, -12, esi);

            eax = edx.wrapping_add(base);

            let Some(effects) = rc_step(mem, &self.globals, eax) else {
                return Run::Skip;
            };

            apply_step_registers(state, &effects);

            edx = flags::adc(state, u64::from(edx), u64::from(edx), Size::Dword) as u32;
            count = flags::dec(state, u64::from(count), Size::Byte) as u32;

            if count == 0 {
                break;
            }
        }

        state.write_gpr(RAX, Size::Dword, false, u64::from(eax));
        state.write_gpr(RDX, Size::Dword, false, u64::from(edx));
        state.write_gpr(RCX, Size::Byte, false, 0);

        // RET.
        let return_rip = read_stack_dword(state, mem, esp, 0);
        state.write_gpr(RSP, Size::Dword, false, esp.wrapping_add(4));

        Run::Retired(u64::from(return_rip))
    }
}

// --- The match-conditioned literal decoder ---

const LITERAL_TEMPLATE: [u8; 81] = [
    0xba, 0x01, 0x00, 0x00, 0x00, // mov edx, 1
    0x52, // push edx
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

const LITERAL_CALL_MATCH: usize = 28;
const LITERAL_CALL_PLAIN: usize = 70;

pub struct MatchedLiteral;

struct MatchedLiteralBody {
    rip: u64,
    globals: Globals,
    logged: bool,
}

impl Pattern for MatchedLiteral {
    fn name(&self) -> &'static str {
        "lzma-matched-literal"
    }

    fn try_compile(&self, rip: u64, window: &[u8], mem: &Memory) -> Option<Box<dyn Compiled>> {
        if !match_template(
            window,
            &LITERAL_TEMPLATE,
            &[LITERAL_CALL_MATCH, LITERAL_CALL_PLAIN],
        ) {
            return None;
        }

        let globals = chase_call(rip, window, LITERAL_CALL_MATCH, mem)?;

        // Both call sites must reach the same routine.
        if chase_call(rip, window, LITERAL_CALL_PLAIN, mem)? != globals {
            return None;
        }

        Some(Box::new(MatchedLiteralBody {
            rip,
            globals,
            logged: false,
        }))
    }
}

impl Compiled for MatchedLiteralBody {
    fn name(&self) -> &'static str {
        "lzma-matched-literal"
    }

    fn run(&mut self, state: &mut CpuState, mem: &mut Memory) -> Run {
        if !lzma_env_ok(state) {
            return Run::Skip;
        }

        let esp = state.read_gpr(RSP, Size::Dword, false);
        let base = read_stack_dword(state, mem, esp, 4);

        // Plain literal slots plus both match-conditioned trees.
        let tree = [
            (base.wrapping_add(0x001), base.wrapping_add(0x0ff)),
            (base.wrapping_add(0x101), base.wrapping_add(0x1ff)),
            (base.wrapping_add(0x201), base.wrapping_add(0x2ff)),
        ];

        if !caller_preflight(state, mem, &self.globals, esp, &tree) {
            return Run::Skip;
        }

        if !self.logged {
            self.logged = true;
            debug!("lzma-matched-literal first execution at {:#x}", self.rip);
        }

        let esi = state.read_gpr(RSI, Size::Dword, false) as u32;
        let mut ebp = state.read_gpr(RBP, Size::Dword, false) as u32;
        let mut edx = 1u32;
        let mut edi = state.read_gpr(RDI, Size::Dword, false) as u32;
        let mut eax = 0u32;
        let mut in_match_loop = true;

        loop {
            if in_match_loop {
                write_stack_dword(state, mem, esp, -4, edx);
                write_stack_dword(state, mem, esp, -8, (self.rip as u32).wrapping_add(33));
                write_stack_dword(state, mem, esp, -12, esi);

                let matchbit = ebp >> 7 & 1;
                ebp = ebp.wrapping_add(ebp);
                edi = matchbit;

                let index = (matchbit + 1) << 8;
                let index = index.wrapping_add(edx).wrapping_add(base);

                let Some(effects) = rc_step(mem, &self.globals, index) else {
                    return Run::Skip;
                };

                apply_step_registers(state, &effects);

                edx = flags::adc(state, u64::from(edx), u64::from(edx), Size::Dword) as u32;
                eax = edx & 1;
                flags::logic(state, u64::from(eax), Size::Dword);
                flags::sub(state, u64::from(matchbit), u64::from(eax), Size::Dword);

                if matchbit != eax {
                    in_match_loop = false;
                    continue;
                }

                flags::sub(state, u64::from(edx), 0xff, Size::Dword);

                if edx > 0xff {
                    break;
                }
            } else {
                flags::sub(state, u64::from(edx), 0xff, Size::Dword);

                if edx > 0xff {
                    break;
                }

                write_stack_dword(state, mem, esp, -4, edx);
                write_stack_dword(state, mem, esp, -8, (self.rip as u32).wrapping_add(75));
                write_stack_dword(state, mem, esp, -12, esi);

                eax = edx.wrapping_add(base);

                let Some(effects) = rc_step(mem, &self.globals, eax) else {
                    return Run::Skip;
                };

                apply_step_registers(state, &effects);

                edx = flags::adc(state, u64::from(edx), u64::from(edx), Size::Dword) as u32;
            }
        }

        state.write_gpr(RAX, Size::Dword, false, u64::from(eax));
        state.write_gpr(RDX, Size::Dword, false, u64::from(edx));
        state.write_gpr(RBP, Size::Dword, false, u64::from(ebp));
        state.write_gpr(RDI, Size::Dword, false, u64::from(edi));

        // RET.
        let return_rip = read_stack_dword(state, mem, esp, 0);
        state.write_gpr(RSP, Size::Dword, false, esp.wrapping_add(4));

        Run::Retired(u64::from(return_rip))
    }
}
