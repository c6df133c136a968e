//! Architectural fault values.
//!
//! Every decode and execute path in the interpreter returns `Result<_, Fault>`. A `Fault` is a
//! plain value describing the exception the guest should observe; the step loop hands it to
//! [`crate::interrupts::deliver_fault`] and resumes at the handler. Faults never unwind the
//! host and never convert into [`crate::error::Error`].

use bitflags::bitflags;
use num_derive::FromPrimitive;

/// The exception vectors the interpreter can raise.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum Vector {
    /// Divide error (#DE).
    DivideError = 0x00,
    /// Invalid opcode (#UD).
    InvalidOpcode = 0x06,
    /// Double fault (#DF).
    DoubleFault = 0x08,
    /// Invalid TSS (#TS).
    InvalidTss = 0x0a,
    /// Segment not present (#NP).
    NotPresent = 0x0b,
    /// Stack-segment fault (#SS).
    StackFault = 0x0c,
    /// General protection (#GP).
    GeneralProtection = 0x0d,
    /// Page fault (#PF).
    PageFault = 0x0e,
    /// x87 floating-point error (#MF).
    X87Fpu = 0x10,
    /// Alignment check (#AC).
    AlignmentCheck = 0x11,
}

impl Vector {
    /// Whether delivery of this vector pushes an error code onto the handler frame.
    pub fn pushes_error_code(self) -> bool {
        matches!(
            self,
            Vector::DoubleFault
                | Vector::InvalidTss
                | Vector::NotPresent
                | Vector::StackFault
                | Vector::GeneralProtection
                | Vector::PageFault
                | Vector::AlignmentCheck
        )
    }
}

bitflags! {
    /// The page-fault error code pushed for vector 0x0E.
    pub struct PfError: u32 {
        /// The fault was caused by a present page (protection violation rather than a
        /// non-present entry).
        const PRESENT  = 1 << 0;
        /// The faulting access was a write.
        const WRITE    = 1 << 1;
        /// The access originated at CPL 3.
        const USER     = 1 << 2;
        /// A reserved bit was set in a paging-structure entry.
        const RESERVED = 1 << 3;
        /// The access was an instruction fetch.
        const IFETCH   = 1 << 4;
    }
}

/// An architectural fault: the vector, an optional error code, and for page faults the linear
/// address destined for CR2.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Fault {
    pub vector: Vector,
    pub error_code: Option<u32>,
    pub cr2: Option<u64>,
}

impl Fault {
    /// Divide error (#DE).
    pub fn de() -> Self {
        Self {
            vector: Vector::DivideError,
            error_code: None,
            cr2: None,
        }
    }

    /// Invalid opcode (#UD).
    pub fn ud() -> Self {
        Self {
            vector: Vector::InvalidOpcode,
            error_code: None,
            cr2: None,
        }
    }

    /// General protection fault with the given error code.
    pub fn gp(code: u32) -> Self {
        Self {
            vector: Vector::GeneralProtection,
            error_code: Some(code),
            cr2: None,
        }
    }

    /// General protection fault with error code zero.
    pub fn gp0() -> Self {
        Self::gp(0)
    }

    /// Segment-not-present fault carrying the offending selector.
    pub fn np(selector: u16) -> Self {
        Self {
            vector: Vector::NotPresent,
            error_code: Some(u32::from(selector & !0b11)),
            cr2: None,
        }
    }

    /// Stack-segment fault carrying the offending selector.
    pub fn ss(selector: u16) -> Self {
        Self {
            vector: Vector::StackFault,
            error_code: Some(u32::from(selector & !0b11)),
            cr2: None,
        }
    }

    /// Page fault at the given linear address.
    pub fn page(addr: u64, code: PfError) -> Self {
        Self {
            vector: Vector::PageFault,
            error_code: Some(code.bits()),
            cr2: Some(addr),
        }
    }

    /// x87 floating-point error (#MF).
    pub fn mf() -> Self {
        Self {
            vector: Vector::X87Fpu,
            error_code: None,
            cr2: None,
        }
    }

    /// Double fault (#DF). The error code is always zero.
    pub fn double() -> Self {
        Self {
            vector: Vector::DoubleFault,
            error_code: Some(0),
            cr2: None,
        }
    }
}
