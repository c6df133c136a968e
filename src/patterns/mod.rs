//! The patterned-instruction engine.
//!
//! Hot multi-instruction byte sequences are recognized at specific instruction pointers and
//! replaced by semantically equivalent fast paths. The cache is keyed by RIP and moves each
//! address through three states: warming (a hit counter), "no pattern here", or a compiled
//! closure. Compilation is attempted exactly once, when the counter reaches the threshold;
//! each registered pattern validates the full literal byte sequence (including the
//! immediates and displacements inside any embedded branches) before accepting.
//!
//! Compiled closures reproduce every architecturally observable effect of the replaced
//! sequence - registers, all six arithmetic flags and touched memory - by computing through
//! the same flag helpers the interpreter uses. On any runtime precondition mismatch they
//! return [`Run::Skip`] without side effects and the normal decoder takes the instruction.

mod branches;
mod divide;
mod lzma;
mod memops;

use crate::arch::x86_64::SegmentRegister;
use crate::mem::Memory;
use crate::paging::{self, Access};
use crate::segmentation::segment_base;
use crate::state::{CpuMode, CpuState};
use log::debug;
use std::collections::HashMap;

/// Executions of an address before a compilation attempt.
const HOT_THRESHOLD: u32 = 10;

/// The fingerprint window fetched for compilation.
pub const WINDOW: usize = 96;

/// The outcome of asking the engine for a cached execution at RIP.
#[derive(Debug, Eq, PartialEq)]
pub enum TryExecute {
    /// A compiled closure ran; RIP has been published.
    Executed(u64),
    /// No pattern applies (or the closure skipped); decode normally.
    NoMatch,
    /// The address has not crossed the hit threshold yet.
    NotHotYet,
}

/// The outcome of one closure invocation.
pub enum Run {
    /// The sequence retired; the value is the next RIP.
    Retired(u64),
    /// A runtime precondition failed; nothing was touched.
    Skip,
}

/// A registered pattern: a matcher that may compile a closure for a given window.
pub trait Pattern {
    fn name(&self) -> &'static str;

    /// Validates the byte window at `rip` and builds the closure on a full match.
    fn try_compile(&self, rip: u64, window: &[u8], mem: &Memory) -> Option<Box<dyn Compiled>>;
}

/// A compiled fast path bound to one instruction pointer.
pub trait Compiled {
    fn name(&self) -> &'static str;

    /// Executes the fast path or skips without side effects.
    fn run(&mut self, state: &mut CpuState, mem: &mut Memory) -> Run;
}

enum CacheEntry {
    Warming(u32),
    NoPattern,
    Compiled(Box<dyn Compiled>),
}

/// The engine: the registered patterns in priority order plus the RIP-keyed cache.
pub struct PatternEngine {
    patterns: Vec<Box<dyn Pattern>>,
    cache: HashMap<u64, CacheEntry>,
}

impl PatternEngine {
    /// Builds the engine with the stock pattern set, most specific first.
    pub fn new() -> Self {
        Self {
            patterns: vec![
                Box::new(lzma::RcDecodeBit),
                Box::new(lzma::TreeByte),
                Box::new(lzma::TreeFn),
                Box::new(lzma::MatchedLiteral),
                Box::new(divide::UdivModDi),
                Box::new(memops::MemmoveForward),
                Box::new(memops::MemmoveBackward),
                Box::new(memops::Strcpy),
                Box::new(memops::MemsetDword),
                Box::new(memops::MemsetPair),
                Box::new(branches::AddAdc),
                Box::new(branches::Shift64),
                Box::new(branches::IncCmp),
                Box::new(branches::TestJns),
                Box::new(branches::CmpJa),
                Box::new(branches::CmpJcc),
                Box::new(branches::CarryLoop),
            ],
            cache: HashMap::new(),
        }
    }

    /// The per-step probe: run a compiled closure, consult the no-pattern marker, or age
    /// the hit counter and possibly compile.
    pub fn try_execute(&mut self, state: &mut CpuState, mem: &mut Memory) -> TryExecute {
        let rip = state.rip;

        match self.cache.get_mut(&rip) {
            Some(CacheEntry::Compiled(closure)) => match closure.run(state, mem) {
                Run::Retired(next) => {
                    state.rip = next;
                    state.retire_instruction();
                    TryExecute::Executed(next)
                }
                Run::Skip => TryExecute::NoMatch,
            },
            Some(CacheEntry::NoPattern) => TryExecute::NoMatch,
            Some(CacheEntry::Warming(count)) => {
                *count += 1;

                if *count < HOT_THRESHOLD {
                    return TryExecute::NotHotYet;
                }

                let entry = self.compile(rip, state, mem);
                let result = match entry {
                    CacheEntry::NoPattern => TryExecute::NoMatch,
                    _ => TryExecute::NotHotYet,
                };
                self.cache.insert(rip, entry);
                result
            }
            None => {
                self.cache.insert(rip, CacheEntry::Warming(1));
                TryExecute::NotHotYet
            }
        }
    }

    fn compile(&self, rip: u64, state: &CpuState, mem: &mut Memory) -> CacheEntry {
        let window = fetch_window(state, mem, rip);

        for pattern in &self.patterns {
            if let Some(closure) = pattern.try_compile(rip, &window, mem) {
                debug!("compiled pattern {} at rip {rip:#x}", pattern.name());
                return CacheEntry::Compiled(closure);
            }
        }

        debug!("no pattern at rip {rip:#x}");
        CacheEntry::NoPattern
    }

    /// Test-visible cache inspection: whether an address holds a compiled closure.
    pub fn is_compiled(&self, rip: u64) -> bool {
        matches!(self.cache.get(&rip), Some(CacheEntry::Compiled(_)))
    }

    /// Test-visible cache inspection: whether an address is marked pattern-free.
    pub fn is_no_pattern(&self, rip: u64) -> bool {
        matches!(self.cache.get(&rip), Some(CacheEntry::NoPattern))
    }
}

impl Default for PatternEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetches up to [`WINDOW`] code bytes at `rip`, truncating at the first fetch fault.
fn fetch_window(state: &CpuState, mem: &mut Memory, rip: u64) -> Vec<u8> {
    let base = segment_base(state, SegmentRegister::Cs);
    let mut window = Vec::with_capacity(WINDOW);

    for i in 0..WINDOW as u64 {
        let linear = base.wrapping_add(rip.wrapping_add(i));

        match paging::read_linear(
            state,
            mem,
            linear,
            crate::arch::x86_64::Size::Byte,
            Access::Fetch,
        ) {
            Ok(byte) => window.push(byte as u8),
            Err(_) => break,
        }
    }

    window
}

// --- Shared runtime precondition helpers ---

/// The baseline for every stock fast path: 32-bit protected mode with 32-bit operand and
/// address defaults and the A20 gate enabled.
pub(crate) fn mode_is_flat32(state: &CpuState) -> bool {
    state.mode == CpuMode::Protected
        && state.a20_enabled
        && matches!(
            state.segment(SegmentRegister::Cs).cache,
            Some(cache) if cache.default && !cache.long
        )
}

/// Whether `[lin, lin + len)` may be bulk-written: every page must translate and the
/// physical bytes must stay clear of the observer and MMIO refusal zones.
pub(crate) fn writable_range(state: &CpuState, mem: &Memory, lin: u64, len: u64) -> bool {
    probe_range(state, mem, lin, len, true)
}

/// Whether `[lin, lin + len)` may be read by a fast path.
pub(crate) fn readable_range(state: &CpuState, mem: &Memory, lin: u64, len: u64) -> bool {
    probe_range(state, mem, lin, len, false)
}

fn probe_range(state: &CpuState, mem: &Memory, lin: u64, len: u64, write: bool) -> bool {
    if len == 0 {
        return true;
    }

    let mask = paging::linear_mask(state);
    let user = state.cpl() == 3;

    let mut offset = 0;

    while offset < len {
        let addr = lin.wrapping_add(offset) & mask;

        let access = if write { Access::Write } else { Access::Read };
        let Some(phys) = paging::probe(state, mem, addr, access, user) else {
            return false;
        };

        // The remainder of this page resolves contiguously.
        let page_left = 0x1000 - (phys & 0xfff);
        let chunk = page_left.min(len - offset);

        if write && !mem.fast_path_allowed(phys, chunk) {
            return false;
        }

        if !write && phys.saturating_add(chunk) > mem.ceiling() {
            return false;
        }

        offset += chunk;
    }

    true
}

/// The DS-relative linear address of `offset` for fast paths compiled against flat
/// 32-bit code.
pub(crate) fn ds_linear(state: &CpuState, offset: u64) -> u64 {
    segment_base(state, SegmentRegister::Ds).wrapping_add(offset & 0xffff_ffff)
}

/// The ES-relative linear address, used by the string-store accelerations.
pub(crate) fn es_linear(state: &CpuState, offset: u64) -> u64 {
    segment_base(state, SegmentRegister::Es).wrapping_add(offset & 0xffff_ffff)
}

/// The SS-relative linear address for stack slots.
pub(crate) fn ss_linear(state: &CpuState, offset: u64) -> u64 {
    segment_base(state, SegmentRegister::Ss).wrapping_add(offset & 0xffff_ffff)
}
