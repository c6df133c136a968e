//! The boot-services and runtime-services implementations.
//!
//! Allocation bumps from the dedicated firmware arena (page-aligned for AllocatePages),
//! CopyMem/SetMem operate on emulated memory, GetMemoryMap reports one conventional
//! descriptor spanning configured RAM, and the protocol lookups consult the handle table.
//! ExitBootServices flips a latch after which handle lookups answer with a benign
//! NotFound while the runtime surface keeps working.

use super::status::Status;
use super::{Guid, ServiceCall};
use chrono::{Datelike, Timelike};

/// EFI_MEMORY_DESCRIPTOR stride reported through GetMemoryMap.
const DESCRIPTOR_SIZE: u64 = 48;
/// EfiConventionalMemory.
const CONVENTIONAL: u32 = 7;

/// AllocatePages(Type, MemoryType, Pages, Memory).
pub(super) fn allocate_pages(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let alloc_type = args.ptr(call);
    let _memory_type = args.ptr(call);
    let pages = args.ptr(call);
    let memory_ptr = args.ptr(call);

    let size = pages * 4096;

    let base = match alloc_type {
        // AllocateAddress: the flat store backs any address the caller insists on.
        2 => call.read_u64(memory_ptr),
        _ => match call.firmware.allocate(size, 4096) {
            Some(base) => base,
            None => return Status::OutOfResources,
        },
    };

    call.write_u64(memory_ptr, base);
    Status::Success
}

/// AllocatePool(PoolType, Size, Buffer).
pub(super) fn allocate_pool(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let _pool_type = args.ptr(call);
    let size = args.ptr(call);
    let buffer_ptr = args.ptr(call);

    let Some(base) = call.firmware.allocate(size.max(8), 8) else {
        return Status::OutOfResources;
    };

    call.write_ptr(buffer_ptr, base);
    Status::Success
}

/// GetMemoryMap(MemoryMapSize, MemoryMap, MapKey, DescriptorSize, DescriptorVersion):
/// a single conventional-memory descriptor spanning configured RAM. The map never
/// changes before ExitBootServices, so the key is constant.
pub(super) fn get_memory_map(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let size_ptr = args.ptr(call);
    let map = args.ptr(call);
    let key_ptr = args.ptr(call);
    let desc_size_ptr = args.ptr(call);
    let version_ptr = args.ptr(call);

    let available = call.read_ptr(size_ptr);
    call.write_ptr(size_ptr, DESCRIPTOR_SIZE);

    if desc_size_ptr != 0 {
        call.write_ptr(desc_size_ptr, DESCRIPTOR_SIZE);
    }

    if version_ptr != 0 {
        call.write_u32(version_ptr, 1);
    }

    if available < DESCRIPTOR_SIZE {
        return Status::BufferTooSmall;
    }

    let ram = call.firmware.ram_size();

    call.write_u32(map, CONVENTIONAL);
    call.write_u32(map + 4, 0);
    call.write_u64(map + 8, 0); // PhysicalStart
    call.write_u64(map + 16, 0); // VirtualStart
    call.write_u64(map + 24, ram / 4096); // NumberOfPages
    call.write_u64(map + 32, 0xf); // UC | WC | WT | WB
    call.write_u64(map + 40, 0);

    if key_ptr != 0 {
        call.write_ptr(key_ptr, 1);
    }

    Status::Success
}

/// HandleProtocol(Handle, Protocol, Interface).
pub(super) fn handle_protocol(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let handle = args.ptr(call);
    let guid_ptr = args.ptr(call);
    let interface_ptr = args.ptr(call);

    lookup(call, handle, guid_ptr, interface_ptr)
}

/// OpenProtocol(Handle, Protocol, Interface, Agent, Controller, Attributes).
pub(super) fn open_protocol(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let handle = args.ptr(call);
    let guid_ptr = args.ptr(call);
    let interface_ptr = args.ptr(call);
    let _agent = args.ptr(call);
    let _controller = args.ptr(call);
    let attributes = args.ptr(call);

    // TEST_PROTOCOL passes a null interface pointer on purpose.
    if interface_ptr == 0 && attributes == 0x04 {
        let Some(guid) = Guid::read(call.state, call.mem, guid_ptr) else {
            return Status::InvalidParameter;
        };

        return if call.firmware.boot_services_exited
            || call.firmware.find_protocol(handle, &guid).is_none()
        {
            Status::NotFound
        } else {
            Status::Success
        };
    }

    lookup(call, handle, guid_ptr, interface_ptr)
}

fn lookup(call: &mut ServiceCall, handle: u64, guid_ptr: u64, interface_ptr: u64) -> Status {
    if call.firmware.boot_services_exited {
        return Status::NotFound;
    }

    let Some(guid) = Guid::read(call.state, call.mem, guid_ptr) else {
        return Status::InvalidParameter;
    };

    let Some(interface) = call.firmware.find_protocol(handle, &guid) else {
        return Status::NotFound;
    };

    call.write_ptr(interface_ptr, interface);
    Status::Success
}

/// LocateProtocol(Protocol, Registration, Interface): the first provider wins.
pub(super) fn locate_protocol(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let guid_ptr = args.ptr(call);
    let _registration = args.ptr(call);
    let interface_ptr = args.ptr(call);

    if call.firmware.boot_services_exited {
        return Status::NotFound;
    }

    let Some(guid) = Guid::read(call.state, call.mem, guid_ptr) else {
        return Status::InvalidParameter;
    };

    let handles = call.firmware.handles_with(&guid);

    let Some(handle) = handles.first() else {
        return Status::NotFound;
    };

    let interface = call
        .firmware
        .find_protocol(*handle, &guid)
        .expect("handle came from the same table");

    call.write_ptr(interface_ptr, interface);
    Status::Success
}

/// LocateHandle(SearchType, Protocol, SearchKey, BufferSize, Buffer).
pub(super) fn locate_handle(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let _search_type = args.ptr(call);
    let guid_ptr = args.ptr(call);
    let _search_key = args.ptr(call);
    let buffer_size_ptr = args.ptr(call);
    let buffer = args.ptr(call);

    if call.firmware.boot_services_exited {
        return Status::NotFound;
    }

    let Some(guid) = Guid::read(call.state, call.mem, guid_ptr) else {
        return Status::InvalidParameter;
    };

    let handles = call.firmware.handles_with(&guid);

    if handles.is_empty() {
        return Status::NotFound;
    }

    let ptr_bytes = if call.wide { 8u64 } else { 4 };
    let needed = handles.len() as u64 * ptr_bytes;
    let available = call.read_ptr(buffer_size_ptr);
    call.write_ptr(buffer_size_ptr, needed);

    if available < needed {
        return Status::BufferTooSmall;
    }

    for (index, handle) in handles.iter().enumerate() {
        call.write_ptr(buffer + index as u64 * ptr_bytes, *handle);
    }

    Status::Success
}

/// LocateHandleBuffer(SearchType, Protocol, SearchKey, NoHandles, Buffer): like
/// LocateHandle but pool-allocating the result.
pub(super) fn locate_handle_buffer(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let _search_type = args.ptr(call);
    let guid_ptr = args.ptr(call);
    let _search_key = args.ptr(call);
    let count_ptr = args.ptr(call);
    let buffer_ptr = args.ptr(call);

    if call.firmware.boot_services_exited {
        return Status::NotFound;
    }

    let Some(guid) = Guid::read(call.state, call.mem, guid_ptr) else {
        return Status::InvalidParameter;
    };

    let handles = call.firmware.handles_with(&guid);

    if handles.is_empty() {
        return Status::NotFound;
    }

    let ptr_bytes = if call.wide { 8u64 } else { 4 };

    let Some(base) = call
        .firmware
        .allocate(handles.len() as u64 * ptr_bytes, 8)
    else {
        return Status::OutOfResources;
    };

    for (index, handle) in handles.iter().enumerate() {
        call.write_ptr(base + index as u64 * ptr_bytes, *handle);
    }

    call.write_ptr(count_ptr, handles.len() as u64);
    call.write_ptr(buffer_ptr, base);
    Status::Success
}

/// ExitBootServices(ImageHandle, MapKey): a no-op that flips the lifecycle latch.
pub(super) fn exit_boot_services(call: &mut ServiceCall) -> Status {
    call.firmware.boot_services_exited = true;
    Status::Success
}

/// GetNextMonotonicCount(Count).
pub(super) fn next_monotonic(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let count_ptr = args.ptr(call);

    let value = call.firmware.next_monotonic();
    call.write_u64(count_ptr, value);
    Status::Success
}

/// CalculateCrc32(Data, DataSize, Crc32): IEEE CRC-32 over guest bytes.
pub(super) fn calculate_crc32(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let data = args.ptr(call);
    let size = args.ptr(call);
    let crc_ptr = args.ptr(call);

    if size == 0 {
        return Status::InvalidParameter;
    }

    let mut crc = 0xffff_ffffu32;

    for i in 0..size {
        let byte = call.read_u8(data + i);
        crc ^= u32::from(byte);

        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = crc >> 1 ^ 0xedb8_8320 & mask;
        }
    }

    call.write_u32(crc_ptr, !crc);
    Status::Success
}

/// CopyMem(Destination, Source, Length): overlap-safe on emulated memory.
pub(super) fn copy_mem(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let dst = args.ptr(call);
    let src = args.ptr(call);
    let len = args.ptr(call);

    if dst <= src {
        for i in 0..len {
            let byte = call.read_u8(src + i);
            call.write_u8(dst + i, byte);
        }
    } else {
        for i in (0..len).rev() {
            let byte = call.read_u8(src + i);
            call.write_u8(dst + i, byte);
        }
    }

    Status::Success
}

/// SetMem(Buffer, Size, Value).
pub(super) fn set_mem(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let buffer = args.ptr(call);
    let size = args.ptr(call);
    let value = args.ptr(call) as u8;

    for i in 0..size {
        call.write_u8(buffer + i, value);
    }

    Status::Success
}

/// GetTime(Time, Capabilities): host wall-clock as EFI_TIME.
pub(super) fn get_time(call: &mut ServiceCall) -> Status {
    let mut args = call.args();
    let time = args.ptr(call);
    let _capabilities = args.ptr(call);

    if time == 0 {
        return Status::InvalidParameter;
    }

    let now = chrono::Local::now();

    call.write_u16(time, now.year() as u16);
    call.write_u8(time + 2, now.month() as u8);
    call.write_u8(time + 3, now.day() as u8);
    call.write_u8(time + 4, now.hour() as u8);
    call.write_u8(time + 5, now.minute() as u8);
    call.write_u8(time + 6, now.second() as u8);
    call.write_u8(time + 7, 0);
    call.write_u32(time + 8, now.nanosecond());
    // Timezone: EFI_UNSPECIFIED_TIMEZONE.
    call.write_u16(time + 12, 0x07ff);
    call.write_u8(time + 14, 0);
    call.write_u8(time + 15, 0);

    Status::Success
}
