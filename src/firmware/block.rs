//! The block and disk I/O protocols over the ISO medium.
//!
//! The medium reports 2048-byte blocks; block reads translate LBA+count and disk reads a
//! raw byte offset+count into reads against the injected volume.

use super::status::Status;
use super::ServiceCall;
use crate::machine::{BootDiagnostics, IsoVolume};

/// The ISO9660 sector size the media descriptor reports.
pub const BLOCK_SIZE: u64 = 2048;

/// ReadBlocks(This, MediaId, LBA, BufferSize, Buffer).
pub(super) fn read_blocks(
    call: &mut ServiceCall,
    iso: &mut dyn IsoVolume,
    diagnostics: &mut BootDiagnostics,
) -> Status {
    let mut args = call.args();
    let _this = args.ptr(call);
    let _media_id = args.u32(call);
    let lba = args.u64(call);
    let buffer_size = args.ptr(call);
    let buffer = args.ptr(call);

    if buffer_size % BLOCK_SIZE != 0 {
        return Status::InvalidParameter;
    }

    transfer(call, iso, diagnostics, lba * BLOCK_SIZE, buffer_size, buffer)
}

/// ReadDisk(This, MediaId, Offset, BufferSize, Buffer).
pub(super) fn read_disk(
    call: &mut ServiceCall,
    iso: &mut dyn IsoVolume,
    diagnostics: &mut BootDiagnostics,
) -> Status {
    let mut args = call.args();
    let _this = args.ptr(call);
    let _media_id = args.u32(call);
    let offset = args.u64(call);
    let buffer_size = args.ptr(call);
    let buffer = args.ptr(call);

    transfer(call, iso, diagnostics, offset, buffer_size, buffer)
}

fn transfer(
    call: &mut ServiceCall,
    iso: &mut dyn IsoVolume,
    diagnostics: &mut BootDiagnostics,
    offset: u64,
    len: u64,
    buffer: u64,
) -> Status {
    if offset.saturating_add(len) > iso.size_bytes() {
        return Status::DeviceError;
    }

    let mut data = vec![0u8; len as usize];

    if iso.read_at(offset, &mut data).is_err() {
        return Status::DeviceError;
    }

    diagnostics.disk_reads += 1;

    for (i, byte) in data.iter().enumerate() {
        call.write_u8(buffer + i as u64, *byte);
    }

    Status::Success
}
