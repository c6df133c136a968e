//! The simple file system and file protocols, backed by the injected ISO9660 reader.
//!
//! Guest paths arrive with Windows-style separators; they are normalized by folding both
//! separator styles, collapsing `.` and `..` components and dropping empties before the
//! lookup. Each successful open materializes a fresh file-protocol interface in guest
//! memory whose address doubles as the host-side key for the open-file record.

use super::status::Status;
use super::{OpenFile, ServiceCall, FILE_INFO_GUID};
use crate::machine::{BootDiagnostics, IsoEntry, IsoVolume};
use log::debug;

/// End-of-file sentinel for SetPosition.
const POSITION_END: u64 = u64::MAX;

/// EFI_FILE_INFO byte size before the name.
const FILE_INFO_FIXED: u64 = 80;

/// Reads a NUL-terminated UTF-16 string out of guest memory, lossily.
fn read_utf16(call: &mut ServiceCall, mut addr: u64) -> String {
    let mut units = Vec::new();

    loop {
        let unit = call.read_u16(addr);

        if unit == 0 || units.len() > 4096 {
            break;
        }

        units.push(unit);
        addr += 2;
    }

    String::from_utf16_lossy(&units)
}

/// Normalizes a guest-supplied path against an optional directory prefix.
pub(super) fn normalize_path(base: &str, path: &str) -> String {
    let absolute = path.starts_with('\\') || path.starts_with('/');

    let mut parts: Vec<&str> = if absolute || base.is_empty() {
        Vec::new()
    } else {
        base.split('/').filter(|part| !part.is_empty()).collect()
    };

    for part in path.split(|c| c == '\\' || c == '/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }

    parts.join("/")
}

/// OpenVolume(This, Root).
pub(super) fn open_volume(call: &mut ServiceCall, _iso: &mut dyn IsoVolume) -> Status {
    let mut args = call.args();
    let _this = args.ptr(call);
    let root_out = args.ptr(call);

    let root = OpenFile {
        entry: IsoEntry {
            offset: 0,
            size: 0,
            name: String::new(),
            directory: true,
        },
        position: 0,
        is_root: true,
    };

    let Some(iface) = call.firmware.new_file_interface(call.mem, root) else {
        return Status::OutOfResources;
    };

    call.write_ptr(root_out, iface);
    Status::Success
}

/// Open(This, NewHandle, FileName, OpenMode, Attributes).
pub(super) fn file_open(call: &mut ServiceCall, iso: &mut dyn IsoVolume) -> Status {
    let mut args = call.args();
    let this = args.ptr(call);
    let new_handle = args.ptr(call);
    let file_name = args.ptr(call);
    let _open_mode = args.u64(call);
    let _attributes = args.u64(call);

    let Some(parent) = call.firmware.files.get(&this) else {
        return Status::InvalidParameter;
    };

    let base = if parent.is_root {
        String::new()
    } else {
        parent.entry.name.clone()
    };

    let raw = read_utf16(call, file_name);
    let path = normalize_path(&base, &raw);

    debug!("file open {raw:?} -> {path:?}");

    let Some(entry) = iso.lookup(&path) else {
        return Status::NotFound;
    };

    let file = OpenFile {
        entry,
        position: 0,
        is_root: false,
    };

    let Some(iface) = call.firmware.new_file_interface(call.mem, file) else {
        return Status::OutOfResources;
    };

    call.write_ptr(new_handle, iface);
    Status::Success
}

/// Close(This).
pub(super) fn file_close(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let this = args.ptr(call);

    call.firmware.files.remove(&this);
    Status::Success
}

/// Read(This, BufferSize, Buffer): at most the requested count, advancing the position.
pub(super) fn file_read(
    call: &mut ServiceCall,
    iso: &mut dyn IsoVolume,
    diagnostics: &mut BootDiagnostics,
) -> Status {
    let mut args = call.args();
    let this = args.ptr(call);
    let buffer_size_ptr = args.ptr(call);
    let buffer = args.ptr(call);

    let (directory, size, position, start) = match call.firmware.files.get(&this) {
        Some(file) => (
            file.entry.directory,
            file.entry.size,
            file.position,
            file.entry.offset,
        ),
        None => return Status::InvalidParameter,
    };

    if directory {
        return Status::Unsupported;
    }

    let requested = call.read_ptr(buffer_size_ptr);
    let remaining = size.saturating_sub(position);
    let count = requested.min(remaining);

    let offset = start + position;
    let mut data = vec![0u8; count as usize];

    if iso.read_at(offset, &mut data).is_err() {
        return Status::DeviceError;
    }

    diagnostics.disk_reads += 1;

    for (i, byte) in data.iter().enumerate() {
        call.write_u8(buffer + i as u64, *byte);
    }

    if let Some(file) = call.firmware.files.get_mut(&this) {
        file.position += count;
    }

    call.write_ptr(buffer_size_ptr, count);
    Status::Success
}

/// GetPosition(This, Position).
pub(super) fn file_get_position(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let this = args.ptr(call);
    let position_ptr = args.ptr(call);

    let Some(file) = call.firmware.files.get(&this) else {
        return Status::InvalidParameter;
    };

    let position = file.position;
    call.write_u64(position_ptr, position);
    Status::Success
}

/// SetPosition(This, Position): all-ones seeks to the end.
pub(super) fn file_set_position(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let this = args.ptr(call);
    let position = args.u64(call);

    let Some(file) = call.firmware.files.get_mut(&this) else {
        return Status::InvalidParameter;
    };

    file.position = if position == POSITION_END {
        file.entry.size
    } else {
        position
    };

    Status::Success
}

/// GetInfo(This, InformationType, BufferSize, Buffer): fills an EFI_FILE_INFO with the
/// size, attributes and the ASCII name re-encoded as UTF-16.
pub(super) fn file_get_info(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let this = args.ptr(call);
    let info_type = args.ptr(call);
    let buffer_size_ptr = args.ptr(call);
    let buffer = args.ptr(call);

    let Some(guid) = super::Guid::read(call.state, call.mem, info_type) else {
        return Status::InvalidParameter;
    };

    if guid != FILE_INFO_GUID {
        return Status::Unsupported;
    }

    let Some(file) = call.firmware.files.get(&this) else {
        return Status::InvalidParameter;
    };

    let leaf = file
        .entry
        .name
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string();
    let needed = FILE_INFO_FIXED + (leaf.len() as u64 + 1) * 2;

    let available = call.read_ptr(buffer_size_ptr);
    call.write_ptr(buffer_size_ptr, needed);

    if available < needed {
        return Status::BufferTooSmall;
    }

    let Some(file) = call.firmware.files.get(&this) else {
        return Status::InvalidParameter;
    };

    let size = file.entry.size;
    let physical = (size + 2047) & !2047;
    let directory = file.entry.directory;

    call.write_u64(buffer, needed);
    call.write_u64(buffer + 8, size);
    call.write_u64(buffer + 16, physical);

    // Create/access/modification times: the medium is read-only and carries none.
    for offset in (24..72).step_by(8) {
        call.write_u64(buffer + offset, 0);
    }

    let mut attribute = 0x01; // read-only

    if directory {
        attribute |= 0x10;
    }

    call.write_u64(buffer + 72, attribute);

    let mut cursor = buffer + FILE_INFO_FIXED;

    for unit in leaf.encode_utf16() {
        call.write_u16(cursor, unit);
        cursor += 2;
    }

    call.write_u16(cursor, 0);
    Status::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_separators_normalize() {
        assert_eq!(normalize_path("", "\\EFI\\BOOT\\GRUBX64.EFI"), "EFI/BOOT/GRUBX64.EFI");
        assert_eq!(normalize_path("", "EFI/boot/grub.cfg"), "EFI/boot/grub.cfg");
    }

    #[test]
    fn dot_components_collapse() {
        assert_eq!(normalize_path("", "\\EFI\\.\\BOOT\\..\\BOOT\\X.EFI"), "EFI/BOOT/X.EFI");
        assert_eq!(normalize_path("", "..\\..\\top"), "top");
    }

    #[test]
    fn relative_paths_resolve_against_the_directory() {
        assert_eq!(normalize_path("EFI/BOOT", "grub.cfg"), "EFI/BOOT/grub.cfg");
        assert_eq!(normalize_path("EFI/BOOT", "\\absolute.cfg"), "absolute.cfg");
    }
}
