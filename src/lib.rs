//! The sx-rs crate, short for "soft x86", provides a software interpreter for the x86 and
//! x86-64 architectures capable of booting a UEFI firmware image (GRUB-class) from an
//! ISO9660 medium. More specifically, this crate provides:
//!
//!  * a fetch/decode/execute core modelling real, protected and long mode, segmentation
//!    with descriptor caches, 4-level paging and interrupt/fault delivery;
//!  * a patterned-instruction engine that recognizes hot multi-instruction sequences at
//!    specific instruction pointers and replaces them with semantically equivalent fast
//!    paths;
//!  * a UEFI environment surface exposed to guest code through synthetic trampoline
//!    addresses dispatched by the host.
//!
//! The ISO9660 reader, terminal sink, keyboard device, port bus and timestamp source are
//! injected collaborators; see the traits on [`machine`].

pub mod arch;
pub mod decode;
pub mod eltorito;
pub mod error;
pub mod fault;
pub mod firmware;
pub mod machine;
pub mod mem;
pub mod paging;
pub mod patterns;
pub mod pe;
pub mod segmentation;
pub mod state;

mod exec;
mod interrupts;

pub use error::Error;
pub use fault::{Fault, Vector};
pub use machine::{
    BootDiagnostics, BootMode, BufferScreen, ExitReason, InstructionTicks, IsoEntry, IsoVolume,
    KeyStroke, Keyboard, Machine, MachineBuilder, NullPorts, PortIo, QueueKeyboard, Screen,
    TickSource,
};
pub use mem::Memory;
pub use state::{CpuMode, CpuState};
