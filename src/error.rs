//! This module provides an `Error` type for the crate using the [`thiserror`] crate.
//!
//! `Error` covers host-environment failures only: a medium that cannot be read, a malformed
//! boot image, a missing boot file. Architectural faults raised by guest code travel on a
//! separate channel (see [`crate::fault::Fault`]) and never surface here.

use thiserror::Error;

/// The `Error` type.
#[derive(Debug, Error)]
pub enum Error {
    /// No EFI boot file was found on the medium.
    #[error("no EFI boot file on the medium")]
    NoBootFile,
    /// The boot image is not a valid PE32/PE32+ file.
    #[error("bad PE image: {0}")]
    BadImage(&'static str),
    /// The boot image does not match the configured boot mode.
    #[error("boot image is {image}-bit but the machine is configured for {configured}-bit")]
    WrongImageBits { image: u8, configured: u8 },
    /// The medium reported a read outside its bounds.
    #[error("read past the end of the medium: offset {offset:#x}, len {len:#x}")]
    MediumBounds { offset: u64, len: usize },
    /// A path lookup on the medium failed.
    #[error("no such file on the medium: {0}")]
    NoSuchFile(String),
    /// The configured physical memory is too small to place the boot image.
    #[error("out of guest memory")]
    OutOfMemory,
    /// Wraps ['std::io::Error'].
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
