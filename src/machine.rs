//! The machine: one CPU, its memory, the pattern engine and the firmware surface, wired
//! to the injected collaborators (ISO reader, screen sink, keyboard, port bus, tick
//! source).
//!
//! The machine is stateless between runs; everything is constructed by
//! [`MachineBuilder::build`] and dropped with the instance. Scheduling is single-threaded
//! cooperative: [`Machine::run`] steps the interpreter until the guest halts, the boot
//! application returns, a reset is requested or the step budget runs out - always at an
//! instruction boundary.

use crate::arch::x86_64::{
    DescriptorTable, Rflags, Segment, SegmentRegister, Size, CR0_ET, CR0_PE, CR0_PG, CR4_PAE,
    EFER_LME, MSR_IA32_EFER, RCX, RDX, RSP,
};
use crate::error::Error;
use crate::exec;
use crate::fault::{Fault, Vector};
use crate::firmware::{Dispatch, Firmware, Service};
use crate::interrupts;
use crate::mem::Memory;
use crate::paging::PteFlags;
use crate::patterns::{PatternEngine, TryExecute};
use crate::pe;
use crate::state::CpuState;
use log::{debug, info, warn};
use std::collections::VecDeque;

/// One directory entry resolved by the ISO9660 reader.
#[derive(Clone, Debug)]
pub struct IsoEntry {
    /// Byte offset of the file data on the medium.
    pub offset: u64,
    /// File size in bytes.
    pub size: u64,
    /// The normalized path that resolved to this entry.
    pub name: String,
    pub directory: bool,
}

/// The ISO9660 medium, provided by the driver. Paths arrive normalized with `/`
/// separators and no `.`/`..` components.
pub trait IsoVolume {
    /// Total size of the medium in bytes.
    fn size_bytes(&self) -> u64;

    /// Reads `buf.len()` bytes at `offset`, zero-padding past the end is an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error>;

    /// Resolves a normalized path to its entry.
    fn lookup(&mut self, path: &str) -> Option<IsoEntry>;
}

/// The terminal/screen sink. Receives CP437 bytes as the guest prints them.
pub trait Screen {
    fn put(&mut self, byte: u8);
}

/// One keystroke as the simple-text-input protocol reports it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KeyStroke {
    pub scan_code: u16,
    pub unicode: u16,
}

/// The keyboard device. Polled, never blocking: an empty buffer reports NotReady to the
/// guest and the guest polls again.
pub trait Keyboard {
    fn poll_key(&mut self) -> Option<KeyStroke>;
}

/// The port I/O bus for `IN`/`OUT`.
pub trait PortIo {
    fn port_read(&mut self, port: u16, size: u8) -> u32;
    fn port_write(&mut self, port: u16, size: u8, value: u32);
}

/// The monotonic counter behind RDTSC.
pub trait TickSource {
    fn ticks(&mut self) -> u64;

    /// Called once per retired instruction (or burst).
    fn retire(&mut self, count: u64);
}

/// A port bus with nothing behind it: reads float high, writes vanish. Enough for the
/// PIC/PIT/CMOS probing loops early firmware runs to terminate.
#[derive(Default)]
pub struct NullPorts;

impl PortIo for NullPorts {
    fn port_read(&mut self, _port: u16, size: u8) -> u32 {
        match size {
            1 => 0xff,
            2 => 0xffff,
            _ => 0xffff_ffff,
        }
    }

    fn port_write(&mut self, _port: u16, _size: u8, _value: u32) {}
}

/// The default tick source: one tick per retired instruction.
#[derive(Default)]
pub struct InstructionTicks {
    count: u64,
}

impl TickSource for InstructionTicks {
    fn ticks(&mut self) -> u64 {
        self.count
    }

    fn retire(&mut self, count: u64) {
        self.count += count;
    }
}

/// A screen sink that accumulates bytes; the demo driver prints them, tests assert on
/// them.
#[derive(Default)]
pub struct BufferScreen {
    pub bytes: Vec<u8>,
}

impl Screen for BufferScreen {
    fn put(&mut self, byte: u8) {
        self.bytes.push(byte);
    }
}

/// A keyboard fed from a queue.
#[derive(Default)]
pub struct QueueKeyboard {
    pub queue: VecDeque<KeyStroke>,
}

impl Keyboard for QueueKeyboard {
    fn poll_key(&mut self) -> Option<KeyStroke> {
        self.queue.pop_front()
    }
}

/// Injected debug context: watch counters the driver can read after a run.
#[derive(Clone, Copy, Debug, Default)]
pub struct BootDiagnostics {
    /// Incremented on every disk read callback.
    pub disk_reads: u64,
    /// Incremented on every firmware service dispatch.
    pub firmware_calls: u64,
}

/// The initial boot bitness.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BootMode {
    Uefi32,
    Uefi64,
}

/// Why [`Machine::run`] returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitReason {
    /// The boot application returned from its entry point; RAX holds its status.
    AppExited,
    /// The guest executed HLT with no interrupt pending to wake it.
    Halted,
    /// The guest requested a platform reset through the runtime services.
    Shutdown,
    /// The configured step budget was exhausted (always at an instruction boundary).
    StepBudget,
    /// A triple fault halted the machine.
    TripleFault,
}

/// The `MachineBuilder` configures the immutable properties of a machine before it is
/// built.
pub struct MachineBuilder {
    memory_size: u64,
    boot_mode: BootMode,
    strict_msrs: bool,
}

impl MachineBuilder {
    pub fn new() -> Self {
        Self {
            memory_size: 256 << 20,
            boot_mode: BootMode::Uefi64,
            strict_msrs: false,
        }
    }

    /// Sets the physical memory ceiling in bytes.
    pub fn with_memory_size(mut self, bytes: u64) -> Self {
        self.memory_size = bytes;
        self
    }

    pub fn with_boot_mode(mut self, mode: BootMode) -> Self {
        self.boot_mode = mode;
        self
    }

    /// With strict MSRs, writes to unknown model-specific registers raise #GP instead of
    /// landing in the map.
    pub fn with_strict_msrs(mut self, strict: bool) -> Self {
        self.strict_msrs = strict;
        self
    }

    /// Builds the machine around the injected collaborators.
    pub fn build(
        self,
        iso: Box<dyn IsoVolume>,
        screen: Box<dyn Screen>,
        keyboard: Box<dyn Keyboard>,
    ) -> Machine {
        Machine {
            state: CpuState::new(),
            mem: Memory::new(self.memory_size),
            patterns: PatternEngine::new(),
            firmware: None,
            iso,
            screen,
            keyboard,
            ports: Box::new(NullPorts),
            ticks: Box::new(InstructionTicks::default()),
            diagnostics: BootDiagnostics::default(),
            boot_mode: self.boot_mode,
            strict_msrs: self.strict_msrs,
            memory_size: self.memory_size,
        }
    }
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Scratch layout for the boot environment the firmware hands to the image.
const BOOT_GDT: u64 = 0x7000;
const BOOT_PAGE_TABLES: u64 = 0x10000;

/// One emulator instance: registers, memory, pattern cache, UEFI tables and handle maps,
/// all owned here and mutated only from within a step.
pub struct Machine {
    state: CpuState,
    mem: Memory,
    patterns: PatternEngine,
    firmware: Option<Firmware>,
    iso: Box<dyn IsoVolume>,
    screen: Box<dyn Screen>,
    keyboard: Box<dyn Keyboard>,
    ports: Box<dyn PortIo>,
    ticks: Box<dyn TickSource>,
    diagnostics: BootDiagnostics,
    boot_mode: BootMode,
    strict_msrs: bool,
    memory_size: u64,
}

impl Machine {
    /// Replaces the port I/O bus.
    pub fn with_ports(mut self, ports: Box<dyn PortIo>) -> Self {
        self.ports = ports;
        self
    }

    /// Replaces the RDTSC tick source.
    pub fn with_ticks(mut self, ticks: Box<dyn TickSource>) -> Self {
        self.ticks = ticks;
        self
    }

    pub fn state(&self) -> &CpuState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }

    pub fn memory(&self) -> &Memory {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.mem
    }

    pub fn diagnostics(&self) -> BootDiagnostics {
        self.diagnostics
    }

    /// Queues an external (maskable) interrupt for delivery at the next boundary.
    pub fn inject_interrupt(&mut self, vector: u8) {
        self.state.pending_interrupts.push_back(vector);
    }

    /// Locates the EFI boot file on the medium, loads it, builds the firmware tables and
    /// points the CPU at the image entry.
    pub fn boot(&mut self) -> Result<(), Error> {
        let (entry, path) = crate::eltorito::find_boot_file(self.iso.as_mut(), self.boot_mode)?;

        let mut image = vec![0u8; entry.size as usize];
        self.iso.read_at(entry.offset, &mut image)?;
        self.diagnostics.disk_reads += 1;

        let loaded = pe::load(&mut self.mem, &image, None)?;

        let configured = match self.boot_mode {
            BootMode::Uefi32 => 32,
            BootMode::Uefi64 => 64,
        };

        if loaded.bits != configured {
            return Err(Error::WrongImageBits {
                image: loaded.bits,
                configured,
            });
        }

        info!("booting {path} ({} bytes) at {:#x}", entry.size, loaded.base);

        let wide = self.boot_mode == BootMode::Uefi64;
        let mut firmware = Firmware::install(
            &mut self.mem,
            wide,
            self.memory_size,
            loaded.base,
            loaded.size,
        );
        firmware.set_volume_blocks(&mut self.mem, self.iso.size_bytes());

        match self.boot_mode {
            BootMode::Uefi64 => self.enter_long_mode(),
            BootMode::Uefi32 => self.enter_protected_mode(),
        }

        // Call frame for the entry point: arguments per the mode's convention and the
        // application-return trampoline as the return address.
        let stack_top = (self.memory_size - self.memory_size / 16 - 0x1000) & !0xf;

        if wide {
            self.state.set_gpr64(RSP, stack_top);
            self.state
                .set_gpr64(RCX, crate::firmware::WellKnownHandle::Image.address());
            self.state.set_gpr64(RDX, firmware.system_table);
            self.push_boot(Size::Qword, Service::AppReturn.trampoline());
        } else {
            self.state.set_gpr64(RSP, stack_top);
            self.push_boot(Size::Dword, firmware.system_table);
            self.push_boot(
                Size::Dword,
                crate::firmware::WellKnownHandle::Image.address(),
            );
            self.push_boot(Size::Dword, Service::AppReturn.trampoline());
        }

        self.state.rip = loaded.entry;
        self.firmware = Some(firmware);
        Ok(())
    }

    /// Puts the CPU straight into flat 32-bit protected mode without booting an image;
    /// embedders and tests use this to run raw code placed in memory.
    pub fn power_on_flat32(&mut self) {
        self.enter_protected_mode();
    }

    /// Puts the CPU straight into 64-bit long mode with the first 512 GiB identity
    /// mapped.
    pub fn power_on_flat64(&mut self) {
        self.enter_long_mode();
    }

    fn push_boot(&mut self, size: Size, value: u64) {
        let rsp = self.state.gpr64(RSP).wrapping_sub(size.bytes());
        self.mem.write_phys(rsp, size, value);
        self.state.set_gpr64(RSP, rsp);
    }

    /// Writes the flat boot GDT shared by both modes.
    fn write_boot_gdt(&mut self) {
        self.mem.write_phys64(BOOT_GDT, 0);
        // 64-bit code, flat data, 32-bit code, 32-bit data.
        self.mem.write_phys64(BOOT_GDT + 0x08, 0x0020_9a00_0000_0000);
        self.mem.write_phys64(BOOT_GDT + 0x10, 0x0000_9200_0000_0000);
        self.mem.write_phys64(BOOT_GDT + 0x18, 0x00cf_9a00_0000_ffff);
        self.mem.write_phys64(BOOT_GDT + 0x20, 0x00cf_9200_0000_ffff);

        self.state.gdtr = DescriptorTable {
            base: BOOT_GDT,
            limit: 0x27,
        };
    }

    /// Identity-maps the first 512 GiB with 1 GiB pages and switches to IA-32e mode, the
    /// state a UEFI firmware hands a 64-bit application.
    fn enter_long_mode(&mut self) {
        self.write_boot_gdt();

        let flags = (PteFlags::PRESENT | PteFlags::WRITABLE).bits();
        self.mem
            .write_phys64(BOOT_PAGE_TABLES, (BOOT_PAGE_TABLES + 0x1000) | flags);

        for index in 0..512u64 {
            self.mem.write_phys64(
                BOOT_PAGE_TABLES + 0x1000 + index * 8,
                index << 30 | flags | PteFlags::PAGE_SIZE.bits(),
            );
        }

        self.state.control.cr3 = BOOT_PAGE_TABLES;
        self.state.control.cr4 |= CR4_PAE;
        self.state.set_msr(MSR_IA32_EFER, EFER_LME);
        self.state.control.cr0 = CR0_PE | CR0_PG | CR0_ET;
        self.state.update_mode();

        let code = Segment {
            base: 0,
            limit: 0xffff_ffff,
            segment_type: 0xb,
            non_system_segment: true,
            dpl: 0,
            present: true,
            available: false,
            long: true,
            default: false,
            granularity: true,
        };

        let data = Segment {
            segment_type: 0x3,
            long: false,
            default: true,
            ..code
        };

        let cs = self.state.segment_mut(SegmentRegister::Cs);
        cs.selector = 0x08;
        cs.cache = Some(code);

        for register in [
            SegmentRegister::Ss,
            SegmentRegister::Ds,
            SegmentRegister::Es,
            SegmentRegister::Fs,
            SegmentRegister::Gs,
        ] {
            let segment = self.state.segment_mut(register);
            segment.selector = 0x10;
            segment.cache = Some(data);
        }

        self.state.set_rflags(Rflags::RESERVED1.bits());
    }

    /// Flat 32-bit protected mode without paging, the state a UEFI firmware hands a
    /// 32-bit application.
    fn enter_protected_mode(&mut self) {
        self.write_boot_gdt();

        self.state.control.cr0 = CR0_PE | CR0_ET;
        self.state.update_mode();

        let code = Segment {
            base: 0,
            limit: 0xffff_ffff,
            segment_type: 0xb,
            non_system_segment: true,
            dpl: 0,
            present: true,
            available: false,
            long: false,
            default: true,
            granularity: true,
        };

        let data = Segment {
            segment_type: 0x3,
            ..code
        };

        let cs = self.state.segment_mut(SegmentRegister::Cs);
        cs.selector = 0x18;
        cs.cache = Some(code);

        for register in [
            SegmentRegister::Ss,
            SegmentRegister::Ds,
            SegmentRegister::Es,
            SegmentRegister::Fs,
            SegmentRegister::Gs,
        ] {
            let segment = self.state.segment_mut(register);
            segment.selector = 0x20;
            segment.cache = Some(data);
        }

        self.state.set_rflags(Rflags::RESERVED1.bits());
    }

    /// Runs until an [`ExitReason`] occurs, stepping at most `budget` instructions when
    /// one is given. The loop always stops at an instruction boundary.
    pub fn run(&mut self, budget: Option<u64>) -> ExitReason {
        let mut steps = 0u64;

        loop {
            if let Some(budget) = budget {
                if steps >= budget {
                    return ExitReason::StepBudget;
                }
            }

            steps += 1;

            match self.step() {
                Some(reason) => return reason,
                None => continue,
            }
        }
    }

    /// One scheduling step: interrupt delivery, trampoline dispatch, pattern probe or a
    /// single interpreted instruction. Returns an exit reason when the machine stops.
    pub fn step(&mut self) -> Option<ExitReason> {
        // Pending maskable interrupts come first, gated by IF and the one-instruction
        // shadow; delivery also wakes a halted CPU.
        if self.state.flag(Rflags::IF)
            && !self.state.interrupts_inhibited()
            && !self.state.pending_interrupts.is_empty()
        {
            let vector = self.state.pending_interrupts.pop_front().unwrap();
            self.state.halted = false;

            let return_rip = self.state.rip;

            if let Err(fault) = interrupts::deliver(
                &mut self.state,
                &mut self.mem,
                vector,
                interrupts::Cause::External,
                None,
                return_rip,
            ) {
                return self.escalate(fault);
            }

            return None;
        }

        if self.state.halted {
            // HLT with nothing to wake it: hand control back to the driver.
            return Some(ExitReason::Halted);
        }

        // Firmware trampolines are checked before anything tries to fetch from them.
        if Firmware::is_trampoline(self.state.rip) {
            let Some(firmware) = self.firmware.as_mut() else {
                warn!("trampoline branch with no firmware installed");
                return Some(ExitReason::TripleFault);
            };

            match firmware.dispatch(
                &mut self.state,
                &mut self.mem,
                self.iso.as_mut(),
                self.screen.as_mut(),
                self.keyboard.as_mut(),
                &mut self.diagnostics,
            ) {
                Dispatch::Handled => return None,
                Dispatch::AppExited => return Some(ExitReason::AppExited),
                Dispatch::ResetRequested => return Some(ExitReason::Shutdown),
            }
        }

        // The patterned-instruction engine gets the first look at this RIP.
        match self.patterns.try_execute(&mut self.state, &mut self.mem) {
            TryExecute::Executed(_) => {
                self.ticks.retire(1);
                return None;
            }
            TryExecute::NoMatch | TryExecute::NotHotYet => {}
        }

        match exec::step_instruction(
            &mut self.state,
            &mut self.mem,
            self.ports.as_mut(),
            self.ticks.as_mut(),
            self.strict_msrs,
        ) {
            Ok(()) => None,
            Err(fault) => self.deliver(fault),
        }
    }

    fn deliver(&mut self, fault: Fault) -> Option<ExitReason> {
        debug!(
            "fault {:?} at rip {:#x} (error code {:?})",
            fault.vector, self.state.rip, fault.error_code
        );

        match interrupts::deliver_fault(&mut self.state, &mut self.mem, &fault) {
            Ok(()) => None,
            Err(second) => {
                if fault.vector == Vector::DoubleFault {
                    warn!("triple fault; machine halted");
                    return Some(ExitReason::TripleFault);
                }

                debug!("fault {:?} during delivery escalates to #DF", second.vector);
                self.escalate(Fault::double())
            }
        }
    }

    fn escalate(&mut self, fault: Fault) -> Option<ExitReason> {
        match interrupts::deliver_fault(&mut self.state, &mut self.mem, &fault) {
            Ok(()) => None,
            Err(_) if fault.vector == Vector::DoubleFault => {
                warn!("triple fault; machine halted");
                Some(ExitReason::TripleFault)
            }
            Err(_) => self.escalate(Fault::double()),
        }
    }

    /// Test-visible pattern cache inspection.
    pub fn pattern_engine(&self) -> &PatternEngine {
        &self.patterns
    }
}
