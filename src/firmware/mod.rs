//! The UEFI environment surface.
//!
//! Two synthetic address spaces are reserved above the firmware window: *handles*, opaque
//! identifiers the guest never dereferences, and *trampolines*, callable addresses that the
//! execution loop routes to host service handlers instead of fetching. A call lands here
//! with normal CALL semantics already applied; the dispatcher marshals arguments from the
//! register file (Microsoft x64 convention) or the stack (cdecl) depending on the boot
//! bitness, runs the service, stores the status in the accumulator and performs the RET.
//!
//! The protocol interface structs, the system/boot/runtime service tables and the strings
//! they point at are materialized in guest memory at install time, with every function
//! pointer aimed into the trampoline space.

mod block;
mod boot_services;
mod console;
mod fs;
pub mod status;

pub use console::cp437_from_utf16;

use crate::arch::x86_64::{Size, RAX, RSP};
use crate::machine::{BootDiagnostics, IsoVolume, Keyboard, Screen};
use crate::mem::Memory;
use crate::paging::{self, Access};
use crate::segmentation::segment_base;
use crate::state::CpuState;
use log::{debug, trace};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use status::Status;
use std::collections::HashMap;

/// The base of the trampoline space; each service occupies a 16-byte slot.
pub const TRAMPOLINE_BASE: u64 = 0xffff_0000;
/// One past the last trampoline slot.
pub const TRAMPOLINE_END: u64 = TRAMPOLINE_BASE + 0x1000;
/// The base of the handle space.
const HANDLE_BASE: u64 = 0xfff0_0000;

/// A protocol GUID in its canonical (time-low, time-mid, time-high, bytes) form.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Guid(pub u32, pub u16, pub u16, pub [u8; 8]);

impl Guid {
    /// Reads a GUID from guest memory.
    pub fn read(state: &CpuState, mem: &mut Memory, addr: u64) -> Option<Self> {
        let mut bytes = [0u8; 16];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte =
                paging::read_linear(state, mem, addr + i as u64, Size::Byte, Access::Read)
                    .ok()? as u8;
        }

        Some(Self(
            u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            u16::from_le_bytes(bytes[4..6].try_into().unwrap()),
            u16::from_le_bytes(bytes[6..8].try_into().unwrap()),
            bytes[8..16].try_into().unwrap(),
        ))
    }
}

pub const SIMPLE_TEXT_OUTPUT_GUID: Guid = Guid(
    0x387477c2,
    0x69c7,
    0x11d2,
    [0x8e, 0x39, 0x00, 0xa0, 0xc9, 0x69, 0x72, 0x3b],
);
pub const SIMPLE_TEXT_INPUT_GUID: Guid = Guid(
    0x387477c1,
    0x69c7,
    0x11d2,
    [0x8e, 0x39, 0x00, 0xa0, 0xc9, 0x69, 0x72, 0x3b],
);
pub const SIMPLE_FILE_SYSTEM_GUID: Guid = Guid(
    0x964e5b22,
    0x6459,
    0x11d2,
    [0x8e, 0x39, 0x00, 0xa0, 0xc9, 0x69, 0x72, 0x3b],
);
pub const BLOCK_IO_GUID: Guid = Guid(
    0x964e5b21,
    0x6459,
    0x11d2,
    [0x8e, 0x39, 0x00, 0xa0, 0xc9, 0x69, 0x72, 0x3b],
);
pub const DISK_IO_GUID: Guid = Guid(
    0xce345171,
    0xba0b,
    0x11d2,
    [0x8e, 0x4f, 0x00, 0xa0, 0xc9, 0x69, 0x72, 0x3b],
);
pub const LOADED_IMAGE_GUID: Guid = Guid(
    0x5b1b31a1,
    0x9562,
    0x11d2,
    [0x8e, 0x3f, 0x00, 0xa0, 0xc9, 0x69, 0x72, 0x3b],
);
pub const DEVICE_PATH_GUID: Guid = Guid(
    0x09576e91,
    0x6d3f,
    0x11d2,
    [0x8e, 0x39, 0x00, 0xa0, 0xc9, 0x69, 0x72, 0x3b],
);
pub const FILE_INFO_GUID: Guid = Guid(
    0x09576e92,
    0x6d3f,
    0x11d2,
    [0x8e, 0x39, 0x00, 0xa0, 0xc9, 0x69, 0x72, 0x3b],
);

/// The host-implemented services, one per trampoline slot.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[repr(u16)]
pub enum Service {
    /// The synthetic return address of the boot application itself.
    AppReturn = 0,

    ConOutReset,
    ConOutOutputString,
    ConOutTestString,
    ConOutQueryMode,
    ConOutSetMode,
    ConOutSetAttribute,
    ConOutClearScreen,
    ConOutSetCursorPosition,
    ConOutEnableCursor,

    ConInReset,
    ConInReadKeyStroke,

    FsOpenVolume,
    FileOpen,
    FileClose,
    FileDelete,
    FileRead,
    FileWrite,
    FileGetPosition,
    FileSetPosition,
    FileGetInfo,
    FileSetInfo,
    FileFlush,

    BlockReset,
    BlockRead,
    BlockWrite,
    BlockFlush,
    DiskRead,
    DiskWrite,

    RaiseTpl,
    RestoreTpl,
    AllocatePages,
    FreePages,
    GetMemoryMap,
    AllocatePool,
    FreePool,
    CreateEvent,
    SetTimer,
    WaitForEvent,
    SignalEvent,
    CloseEvent,
    CheckEvent,
    InstallProtocolInterface,
    ReinstallProtocolInterface,
    UninstallProtocolInterface,
    HandleProtocol,
    RegisterProtocolNotify,
    LocateHandle,
    LocateDevicePath,
    InstallConfigurationTable,
    LoadImage,
    StartImage,
    Exit,
    UnloadImage,
    ExitBootServices,
    GetNextMonotonicCount,
    Stall,
    SetWatchdogTimer,
    ConnectController,
    DisconnectController,
    OpenProtocol,
    CloseProtocol,
    OpenProtocolInformation,
    ProtocolsPerHandle,
    LocateHandleBuffer,
    LocateProtocol,
    InstallMultipleProtocolInterfaces,
    UninstallMultipleProtocolInterfaces,
    CalculateCrc32,
    CopyMem,
    SetMem,
    CreateEventEx,

    RtGetTime,
    RtSetTime,
    RtGetWakeupTime,
    RtSetWakeupTime,
    RtSetVirtualAddressMap,
    RtConvertPointer,
    RtGetVariable,
    RtGetNextVariableName,
    RtSetVariable,
    RtGetNextHighMonotonicCount,
    RtResetSystem,
    RtUpdateCapsule,
    RtQueryCapsuleCapabilities,
    RtQueryVariableInfo,
}

impl Service {
    pub fn trampoline(self) -> u64 {
        TRAMPOLINE_BASE + (self as u64) * 0x10
    }

    fn from_address(addr: u64) -> Option<Self> {
        if !(TRAMPOLINE_BASE..TRAMPOLINE_END).contains(&addr) || addr & 0xf != 0 {
            return None;
        }

        Self::from_u64((addr - TRAMPOLINE_BASE) / 0x10)
    }
}

/// What a dispatched trampoline asks the machine to do next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dispatch {
    /// The service ran; execution continues at the emulated RET target.
    Handled,
    /// The boot application returned to the host (its entry-point RET).
    AppExited,
    /// The guest requested a platform reset.
    ResetRequested,
}

/// One well-known handle in the synthetic handle space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WellKnownHandle {
    Image = 1,
    ConsoleIn = 2,
    ConsoleOut = 3,
    Volume = 4,
}

impl WellKnownHandle {
    pub fn address(self) -> u64 {
        HANDLE_BASE + (self as u64) * 0x100
    }
}

/// One open file behind a guest-visible file-protocol interface.
pub(crate) struct OpenFile {
    pub entry: crate::machine::IsoEntry,
    pub position: u64,
    /// The volume root gets directory semantics for Open calls.
    pub is_root: bool,
}

/// The firmware instance: handle table, trampoline dispatcher, allocator arena and the
/// host-side state behind the file and console protocols.
pub struct Firmware {
    wide: bool,
    /// handle address -> (protocol, interface address) pairs.
    handles: HashMap<u64, Vec<(Guid, u64)>>,
    /// file-protocol interface address -> open file.
    pub(crate) files: HashMap<u64, OpenFile>,
    /// The bump arena for AllocatePool/AllocatePages and new file interfaces.
    pool_next: u64,
    pool_end: u64,
    pub(crate) boot_services_exited: bool,
    monotonic: u64,
    /// Guest addresses of the installed structures.
    pub system_table: u64,
    pub(crate) conout_mode: u64,
    file_iface_template: Vec<(Service, u64)>,
    ram_size: u64,
    image_base: u64,
    image_size: u64,
}

/// The pointer width and a cursor for laying out guest structures.
struct TableWriter<'a> {
    mem: &'a mut Memory,
    pos: u64,
    wide: bool,
}

impl TableWriter<'_> {
    fn put_u16(&mut self, value: u16) {
        self.mem.write_phys16(self.pos, value);
        self.pos += 2;
    }

    fn put_u32(&mut self, value: u32) {
        self.mem.write_phys32(self.pos, value);
        self.pos += 4;
    }

    fn put_u64(&mut self, value: u64) {
        self.mem.write_phys64(self.pos, value);
        self.pos += 8;
    }

    fn put_ptr(&mut self, value: u64) {
        if self.wide {
            self.put_u64(value);
        } else {
            self.put_u32(value as u32);
        }
    }

    fn put_fn(&mut self, service: Service) {
        self.put_ptr(service.trampoline());
    }

    fn align(&mut self, to: u64) {
        self.pos = (self.pos + to - 1) & !(to - 1);
    }
}

impl Firmware {
    /// Builds the firmware state and materializes every table in guest memory.
    /// `wide` selects 64-bit pointers and the Microsoft x64 calling convention.
    pub fn install(
        mem: &mut Memory,
        wide: bool,
        ram_size: u64,
        image_base: u64,
        image_size: u64,
    ) -> Self {
        // The firmware arena sits in the top sixteenth of RAM.
        let arena_base = ram_size - ram_size / 16;

        let mut this = Self {
            wide,
            handles: HashMap::new(),
            files: HashMap::new(),
            pool_next: arena_base,
            pool_end: ram_size,
            boot_services_exited: false,
            monotonic: 0,
            system_table: 0,
            conout_mode: 0,
            file_iface_template: vec![
                (Service::FileOpen, 0),
                (Service::FileClose, 0),
                (Service::FileDelete, 0),
                (Service::FileRead, 0),
                (Service::FileWrite, 0),
                (Service::FileGetPosition, 0),
                (Service::FileSetPosition, 0),
                (Service::FileGetInfo, 0),
                (Service::FileSetInfo, 0),
                (Service::FileFlush, 0),
            ],
            ram_size,
            image_base,
            image_size,
        };

        this.build_tables(mem);
        this
    }

    fn ptr_bytes(&self) -> u64 {
        if self.wide {
            8
        } else {
            4
        }
    }

    /// Bump allocation from the firmware arena.
    pub(crate) fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        let base = (self.pool_next + align - 1) & !(align - 1);

        if base + size > self.pool_end {
            return None;
        }

        self.pool_next = base + size;
        Some(base)
    }

    fn build_tables(&mut self, mem: &mut Memory) {
        // Firmware vendor string.
        let vendor = self.allocate(32, 8).expect("arena sized at install");
        for (i, unit) in "sx-rs\0".encode_utf16().enumerate() {
            mem.write_phys16(vendor + i as u64 * 2, unit);
        }

        // Console output mode block: MaxMode, Mode, Attribute, CursorColumn, CursorRow,
        // CursorVisible.
        let conout_mode = self.allocate(24, 8).expect("arena sized at install");
        mem.write_phys32(conout_mode, 1);
        mem.write_phys32(conout_mode + 4, 0);
        mem.write_phys32(conout_mode + 8, 0x07);
        self.conout_mode = conout_mode;

        // Console output protocol.
        let conout = self.begin_struct(16 * self.ptr_bytes());
        {
            let mut w = TableWriter {
                mem,
                pos: conout,
                wide: self.wide,
            };
            w.put_fn(Service::ConOutReset);
            w.put_fn(Service::ConOutOutputString);
            w.put_fn(Service::ConOutTestString);
            w.put_fn(Service::ConOutQueryMode);
            w.put_fn(Service::ConOutSetMode);
            w.put_fn(Service::ConOutSetAttribute);
            w.put_fn(Service::ConOutClearScreen);
            w.put_fn(Service::ConOutSetCursorPosition);
            w.put_fn(Service::ConOutEnableCursor);
            w.put_ptr(conout_mode);
        }

        // Console input protocol: Reset, ReadKeyStroke, WaitForKey.
        let conin = self.begin_struct(4 * self.ptr_bytes());
        {
            let mut w = TableWriter {
                mem,
                pos: conin,
                wide: self.wide,
            };
            w.put_fn(Service::ConInReset);
            w.put_fn(Service::ConInReadKeyStroke);
            w.put_ptr(0);
        }

        // Simple file system: Revision, OpenVolume.
        let fs = self.begin_struct(8 + 2 * self.ptr_bytes());
        {
            let mut w = TableWriter {
                mem,
                pos: fs,
                wide: self.wide,
            };
            w.put_u64(0x0001_0000);
            w.put_fn(Service::FsOpenVolume);
        }

        // Block I/O media: MediaId, flags, BlockSize, IoAlign, LastBlock.
        let media = self.begin_struct(48);
        mem.write_phys32(media, 1);
        // RemovableMedia=0, MediaPresent=1, LogicalPartition=0, ReadOnly=1, WriteCaching=0.
        mem.write_phys8(media + 4, 0);
        mem.write_phys8(media + 5, 1);
        mem.write_phys8(media + 6, 0);
        mem.write_phys8(media + 7, 1);
        mem.write_phys8(media + 8, 0);
        mem.write_phys32(media + 12, block::BLOCK_SIZE as u32);
        mem.write_phys32(media + 16, 4);
        // LastBlock is filled by the machine once the volume size is known.
        mem.write_phys64(media + 24, 0);

        // Block I/O protocol: Revision, Media, Reset, ReadBlocks, WriteBlocks, FlushBlocks.
        let blockio = self.begin_struct(8 + 8 * self.ptr_bytes());
        {
            let mut w = TableWriter {
                mem,
                pos: blockio,
                wide: self.wide,
            };
            w.put_u64(0x0001_0000);
            w.put_ptr(media);
            w.put_fn(Service::BlockReset);
            w.put_fn(Service::BlockRead);
            w.put_fn(Service::BlockWrite);
            w.put_fn(Service::BlockFlush);
        }

        // Disk I/O protocol: Revision, ReadDisk, WriteDisk.
        let diskio = self.begin_struct(8 + 2 * self.ptr_bytes());
        {
            let mut w = TableWriter {
                mem,
                pos: diskio,
                wide: self.wide,
            };
            w.put_u64(0x0001_0000);
            w.put_fn(Service::DiskRead);
            w.put_fn(Service::DiskWrite);
        }

        // A minimal device path for the volume: one media node and the end node.
        let device_path = self.begin_struct(8);
        mem.write_phys8(device_path, 0x7f);
        mem.write_phys8(device_path + 1, 0xff);
        mem.write_phys16(device_path + 2, 4);

        // Loaded image protocol.
        let loaded_image = self.begin_struct(32 + 12 * self.ptr_bytes());
        {
            let mut w = TableWriter {
                mem,
                pos: loaded_image,
                wide: self.wide,
            };
            w.put_u32(0x1000); // Revision
            w.align(self.ptr_bytes());
            w.put_ptr(0); // ParentHandle
            w.put_ptr(0); // SystemTable, patched below
            w.put_ptr(WellKnownHandle::Volume.address()); // DeviceHandle
            w.put_ptr(device_path); // FilePath
            w.put_ptr(0); // Reserved
            w.put_u32(0); // LoadOptionsSize
            w.align(self.ptr_bytes());
            w.put_ptr(0); // LoadOptions
            w.put_ptr(self.image_base); // ImageBase
            w.put_u64(self.image_size); // ImageSize
            w.put_u32(1); // ImageCodeType: loader code
            w.put_u32(2); // ImageDataType: loader data
            w.align(self.ptr_bytes());
            w.put_ptr(0); // Unload
        }

        // Boot services table.
        let header_size = 24;
        let bs_fields = 44;
        let boot_services =
            self.begin_struct(header_size + (bs_fields + 2) * self.ptr_bytes());
        {
            let mut w = TableWriter {
                mem,
                pos: boot_services,
                wide: self.wide,
            };
            w.put_u64(0x5652_4553_544f_4f42); // "BOOTSERV"
            w.put_u32(0x0002_0046);
            w.put_u32(0);
            w.put_u32(0);
            w.put_u32(0);

            w.put_fn(Service::RaiseTpl);
            w.put_fn(Service::RestoreTpl);
            w.put_fn(Service::AllocatePages);
            w.put_fn(Service::FreePages);
            w.put_fn(Service::GetMemoryMap);
            w.put_fn(Service::AllocatePool);
            w.put_fn(Service::FreePool);
            w.put_fn(Service::CreateEvent);
            w.put_fn(Service::SetTimer);
            w.put_fn(Service::WaitForEvent);
            w.put_fn(Service::SignalEvent);
            w.put_fn(Service::CloseEvent);
            w.put_fn(Service::CheckEvent);
            w.put_fn(Service::InstallProtocolInterface);
            w.put_fn(Service::ReinstallProtocolInterface);
            w.put_fn(Service::UninstallProtocolInterface);
            w.put_fn(Service::HandleProtocol);
            w.put_ptr(0); // Reserved
            w.put_fn(Service::RegisterProtocolNotify);
            w.put_fn(Service::LocateHandle);
            w.put_fn(Service::LocateDevicePath);
            w.put_fn(Service::InstallConfigurationTable);
            w.put_fn(Service::LoadImage);
            w.put_fn(Service::StartImage);
            w.put_fn(Service::Exit);
            w.put_fn(Service::UnloadImage);
            w.put_fn(Service::ExitBootServices);
            w.put_fn(Service::GetNextMonotonicCount);
            w.put_fn(Service::Stall);
            w.put_fn(Service::SetWatchdogTimer);
            w.put_fn(Service::ConnectController);
            w.put_fn(Service::DisconnectController);
            w.put_fn(Service::OpenProtocol);
            w.put_fn(Service::CloseProtocol);
            w.put_fn(Service::OpenProtocolInformation);
            w.put_fn(Service::ProtocolsPerHandle);
            w.put_fn(Service::LocateHandleBuffer);
            w.put_fn(Service::LocateProtocol);
            w.put_fn(Service::InstallMultipleProtocolInterfaces);
            w.put_fn(Service::UninstallMultipleProtocolInterfaces);
            w.put_fn(Service::CalculateCrc32);
            w.put_fn(Service::CopyMem);
            w.put_fn(Service::SetMem);
            w.put_fn(Service::CreateEventEx);
        }

        // Runtime services table.
        let rt_fields = 14;
        let runtime_services =
            self.begin_struct(header_size + rt_fields * self.ptr_bytes());
        {
            let mut w = TableWriter {
                mem,
                pos: runtime_services,
                wide: self.wide,
            };
            w.put_u64(0x5652_4553_544e_5552); // "RUNTSERV"
            w.put_u32(0x0002_0046);
            w.put_u32(0);
            w.put_u32(0);
            w.put_u32(0);

            w.put_fn(Service::RtGetTime);
            w.put_fn(Service::RtSetTime);
            w.put_fn(Service::RtGetWakeupTime);
            w.put_fn(Service::RtSetWakeupTime);
            w.put_fn(Service::RtSetVirtualAddressMap);
            w.put_fn(Service::RtConvertPointer);
            w.put_fn(Service::RtGetVariable);
            w.put_fn(Service::RtGetNextVariableName);
            w.put_fn(Service::RtSetVariable);
            w.put_fn(Service::RtGetNextHighMonotonicCount);
            w.put_fn(Service::RtResetSystem);
            w.put_fn(Service::RtUpdateCapsule);
            w.put_fn(Service::RtQueryCapsuleCapabilities);
            w.put_fn(Service::RtQueryVariableInfo);
        }

        // System table.
        let system_table = self.begin_struct(header_size + 16 * self.ptr_bytes());
        {
            let mut w = TableWriter {
                mem,
                pos: system_table,
                wide: self.wide,
            };
            w.put_u64(0x5453_5953_2049_4249); // "IBI SYST"
            w.put_u32(0x0002_0046);
            w.put_u32(0);
            w.put_u32(0);
            w.put_u32(0);

            w.put_ptr(vendor);
            w.put_u32(0x0001_0000); // FirmwareRevision
            w.align(self.ptr_bytes());
            w.put_ptr(WellKnownHandle::ConsoleIn.address());
            w.put_ptr(conin);
            w.put_ptr(WellKnownHandle::ConsoleOut.address());
            w.put_ptr(conout);
            w.put_ptr(WellKnownHandle::ConsoleOut.address()); // StandardErrorHandle
            w.put_ptr(conout); // StdErr shares ConOut
            w.put_ptr(runtime_services);
            w.put_ptr(boot_services);
            w.put_ptr(0); // NumberOfTableEntries
            w.put_ptr(0); // ConfigurationTable
        }

        self.system_table = system_table;

        // Patch LoadedImage.SystemTable now that the address exists: the field sits after
        // the aligned Revision and ParentHandle.
        let st_slot = loaded_image + 2 * self.ptr_bytes();
        if self.wide {
            mem.write_phys64(st_slot, system_table);
        } else {
            mem.write_phys32(st_slot, system_table as u32);
        }

        // The handle table.
        self.handles.insert(
            WellKnownHandle::Image.address(),
            vec![
                (LOADED_IMAGE_GUID, loaded_image),
                (DEVICE_PATH_GUID, device_path),
            ],
        );
        self.handles.insert(
            WellKnownHandle::ConsoleIn.address(),
            vec![(SIMPLE_TEXT_INPUT_GUID, conin)],
        );
        self.handles.insert(
            WellKnownHandle::ConsoleOut.address(),
            vec![(SIMPLE_TEXT_OUTPUT_GUID, conout)],
        );
        self.handles.insert(
            WellKnownHandle::Volume.address(),
            vec![
                (SIMPLE_FILE_SYSTEM_GUID, fs),
                (BLOCK_IO_GUID, blockio),
                (DISK_IO_GUID, diskio),
                (DEVICE_PATH_GUID, device_path),
            ],
        );
    }

    fn begin_struct(&mut self, size: u64) -> u64 {
        self.allocate(size, 16).expect("arena sized at install")
    }

    /// The media LastBlock field needs the volume size, which arrives after install.
    pub fn set_volume_blocks(&mut self, mem: &mut Memory, volume_size: u64) {
        if let Some(protocols) = self.handles.get(&WellKnownHandle::Volume.address()) {
            if let Some((_, blockio)) = protocols
                .iter()
                .find(|(guid, _)| *guid == BLOCK_IO_GUID)
            {
                let media = if self.wide {
                    mem.read_phys64(blockio + 8)
                } else {
                    u64::from(mem.read_phys32(blockio + 8))
                };

                let last = volume_size / block::BLOCK_SIZE;
                mem.write_phys64(media + 24, last.saturating_sub(1));
            }
        }
    }

    /// Creates a fresh file-protocol interface in guest memory for one open file.
    pub(crate) fn new_file_interface(
        &mut self,
        mem: &mut Memory,
        file: OpenFile,
    ) -> Option<u64> {
        let size = 8 + 10 * self.ptr_bytes();
        let iface = self.allocate(size, 16)?;

        let mut w = TableWriter {
            mem,
            pos: iface,
            wide: self.wide,
        };
        w.put_u64(0x0001_0000);

        let template = self.file_iface_template.clone();
        for (service, _) in template {
            w.put_fn(service);
        }

        self.files.insert(iface, file);
        Some(iface)
    }

    /// Looks up an interface pointer by handle and protocol.
    pub(crate) fn find_protocol(&self, handle: u64, guid: &Guid) -> Option<u64> {
        self.handles
            .get(&handle)?
            .iter()
            .find(|(candidate, _)| candidate == guid)
            .map(|(_, iface)| *iface)
    }

    /// All handles carrying a protocol.
    pub(crate) fn handles_with(&self, guid: &Guid) -> Vec<u64> {
        let mut handles: Vec<u64> = self
            .handles
            .iter()
            .filter(|(_, protocols)| protocols.iter().any(|(candidate, _)| candidate == guid))
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort_unstable();
        handles
    }

    pub(crate) fn next_monotonic(&mut self) -> u64 {
        self.monotonic += 1;
        self.monotonic
    }

    pub(crate) fn ram_size(&self) -> u64 {
        self.ram_size
    }

    /// Whether a branch target lies in the trampoline space.
    pub fn is_trampoline(addr: u64) -> bool {
        (TRAMPOLINE_BASE..TRAMPOLINE_END).contains(&addr)
    }

    /// Dispatches the service whose trampoline the guest just jumped or returned into.
    pub fn dispatch(
        &mut self,
        state: &mut CpuState,
        mem: &mut Memory,
        iso: &mut dyn IsoVolume,
        screen: &mut dyn Screen,
        keyboard: &mut dyn Keyboard,
        diagnostics: &mut BootDiagnostics,
    ) -> Dispatch {
        let Some(service) = Service::from_address(state.rip) else {
            // A stray jump into the trampoline window has no continuation to run.
            debug!("stray branch into trampoline space at {:#x}", state.rip);
            state.halted = true;
            return Dispatch::Handled;
        };

        if service == Service::AppReturn {
            return Dispatch::AppExited;
        }

        trace!("firmware service {:?}", service);
        diagnostics.firmware_calls += 1;

        let mut call = ServiceCall::new(self, state, mem);

        let status = match service {
            Service::AppReturn => unreachable!("handled above"),

            Service::ConOutReset | Service::ConInReset => Status::Success,
            Service::ConOutOutputString => console::output_string(&mut call, screen),
            Service::ConOutTestString => Status::Success,
            Service::ConOutQueryMode => console::query_mode(&mut call),
            Service::ConOutSetMode => Status::Success,
            Service::ConOutSetAttribute => Status::Success,
            Service::ConOutClearScreen => console::clear_screen(&mut call, screen),
            Service::ConOutSetCursorPosition => Status::Success,
            Service::ConOutEnableCursor => Status::Success,
            Service::ConInReadKeyStroke => console::read_key_stroke(&mut call, keyboard),

            Service::FsOpenVolume => fs::open_volume(&mut call, iso),
            Service::FileOpen => fs::file_open(&mut call, iso),
            Service::FileClose => fs::file_close(&mut call),
            Service::FileDelete => Status::Unsupported,
            Service::FileRead => fs::file_read(&mut call, iso, diagnostics),
            Service::FileWrite => Status::Unsupported,
            Service::FileGetPosition => fs::file_get_position(&mut call),
            Service::FileSetPosition => fs::file_set_position(&mut call),
            Service::FileGetInfo => fs::file_get_info(&mut call),
            Service::FileSetInfo => Status::Unsupported,
            Service::FileFlush => Status::Success,

            Service::BlockReset => Status::Success,
            Service::BlockRead => block::read_blocks(&mut call, iso, diagnostics),
            Service::BlockWrite => Status::Unsupported,
            Service::BlockFlush => Status::Success,
            Service::DiskRead => block::read_disk(&mut call, iso, diagnostics),
            Service::DiskWrite => Status::Unsupported,

            Service::RaiseTpl => {
                // Returns the previous TPL rather than a status; this machine always
                // runs at TPL_APPLICATION.
                self.complete(state, mem, 4);
                return Dispatch::Handled;
            }
            Service::RestoreTpl => Status::Success,
            Service::AllocatePages => boot_services::allocate_pages(&mut call),
            Service::FreePages => Status::Success,
            Service::GetMemoryMap => boot_services::get_memory_map(&mut call),
            Service::AllocatePool => boot_services::allocate_pool(&mut call),
            Service::FreePool => Status::Success,
            Service::HandleProtocol => boot_services::handle_protocol(&mut call),
            Service::OpenProtocol => boot_services::open_protocol(&mut call),
            Service::CloseProtocol => Status::Success,
            Service::LocateProtocol => boot_services::locate_protocol(&mut call),
            Service::LocateHandle => boot_services::locate_handle(&mut call),
            Service::LocateHandleBuffer => boot_services::locate_handle_buffer(&mut call),
            Service::ProtocolsPerHandle => Status::Unsupported,
            Service::ExitBootServices => boot_services::exit_boot_services(&mut call),
            Service::GetNextMonotonicCount => boot_services::next_monotonic(&mut call),
            Service::Stall => Status::Success,
            Service::SetWatchdogTimer => Status::Success,
            Service::CalculateCrc32 => boot_services::calculate_crc32(&mut call),
            Service::CopyMem => boot_services::copy_mem(&mut call),
            Service::SetMem => boot_services::set_mem(&mut call),

            Service::RtGetTime => boot_services::get_time(&mut call),
            Service::RtSetVirtualAddressMap => Status::Success,
            Service::RtGetVariable | Service::RtGetNextVariableName => Status::NotFound,
            Service::RtResetSystem => {
                return self.finish(state, mem, 0);
            }

            // Everything else in both tables reports itself as unsupported.
            _ => Status::Unsupported,
        };

        let encoded = status.encode(self.wide);
        self.complete(state, mem, encoded);
        Dispatch::Handled
    }

    /// Performs the emulated RET and stores the return value.
    fn complete(&self, state: &mut CpuState, mem: &mut Memory, rax: u64) {
        let (return_rip, popped) = self.pop_return(state, mem);
        state.set_gpr64(RAX as u8, rax);
        state.rip = return_rip;
        let rsp = state.gpr64(RSP);
        state.set_gpr64(RSP, rsp.wrapping_add(popped));
    }

    fn finish(&self, state: &mut CpuState, mem: &mut Memory, rax: u64) -> Dispatch {
        self.complete(state, mem, rax);
        Dispatch::ResetRequested
    }

    fn pop_return(&self, state: &CpuState, mem: &mut Memory) -> (u64, u64) {
        let rsp = state.gpr64(RSP);
        let base = segment_base(state, crate::arch::x86_64::SegmentRegister::Ss);

        if self.wide {
            let addr = base.wrapping_add(rsp);
            (
                paging::read_linear(state, mem, addr, Size::Qword, Access::Read)
                    .unwrap_or(TRAMPOLINE_BASE),
                8,
            )
        } else {
            let addr = base.wrapping_add(rsp & 0xffff_ffff);
            (
                paging::read_linear(state, mem, addr, Size::Dword, Access::Read)
                    .unwrap_or(TRAMPOLINE_BASE),
                4,
            )
        }
    }
}

/// The per-call view a service handler works through: argument marshalling per the boot
/// bitness, plus guest memory accessors.
pub(crate) struct ServiceCall<'a> {
    pub firmware: &'a mut Firmware,
    pub state: &'a mut CpuState,
    pub mem: &'a mut Memory,
    pub wide: bool,
}

impl<'a> ServiceCall<'a> {
    fn new(firmware: &'a mut Firmware, state: &'a mut CpuState, mem: &'a mut Memory) -> Self {
        let wide = firmware.wide;
        Self {
            firmware,
            state,
            mem,
            wide,
        }
    }

    /// A sequential argument reader starting at the first argument.
    pub fn args(&self) -> Args {
        Args { slot: 0 }
    }

    /// The `index`-th argument: RCX/RDX/R8/R9 then the stack beyond the shadow space for
    /// 64-bit, plain cdecl stack slots for 32-bit.
    pub fn arg(&mut self, index: usize) -> u64 {
        if self.wide {
            match index {
                0 => self.state.reg(crate::arch::x86_64::Register::Rcx),
                1 => self.state.reg(crate::arch::x86_64::Register::Rdx),
                2 => self.state.reg(crate::arch::x86_64::Register::R8),
                3 => self.state.reg(crate::arch::x86_64::Register::R9),
                _ => {
                    let rsp = self.state.gpr64(RSP);
                    let slot = rsp + 8 + 0x20 + (index as u64 - 4) * 8;
                    paging::read_linear(self.state, self.mem, slot, Size::Qword, Access::Read)
                        .unwrap_or(0)
                }
            }
        } else {
            let esp = self.state.gpr64(RSP) & 0xffff_ffff;
            let slot = esp + 4 + index as u64 * 4;
            paging::read_linear(self.state, self.mem, slot, Size::Dword, Access::Read)
                .unwrap_or(0)
        }
    }

    /// Reads a guest pointer-sized value at `addr`.
    pub fn read_ptr(&mut self, addr: u64) -> u64 {
        let size = if self.wide { Size::Qword } else { Size::Dword };
        paging::read_linear(self.state, self.mem, addr, size, Access::Read).unwrap_or(0)
    }

    /// Writes a guest pointer-sized value at `addr`.
    pub fn write_ptr(&mut self, addr: u64, value: u64) {
        let size = if self.wide { Size::Qword } else { Size::Dword };
        let _ = paging::write_linear(self.state, self.mem, addr, size, value, Access::Write);
    }

    pub fn read_u8(&mut self, addr: u64) -> u8 {
        paging::read_linear(self.state, self.mem, addr, Size::Byte, Access::Read).unwrap_or(0)
            as u8
    }

    pub fn read_u16(&mut self, addr: u64) -> u16 {
        paging::read_linear(self.state, self.mem, addr, Size::Word, Access::Read).unwrap_or(0)
            as u16
    }

    pub fn read_u32(&mut self, addr: u64) -> u32 {
        paging::read_linear(self.state, self.mem, addr, Size::Dword, Access::Read).unwrap_or(0)
            as u32
    }

    pub fn read_u64(&mut self, addr: u64) -> u64 {
        paging::read_linear(self.state, self.mem, addr, Size::Qword, Access::Read).unwrap_or(0)
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) {
        let _ = paging::write_linear(
            self.state,
            self.mem,
            addr,
            Size::Byte,
            u64::from(value),
            Access::Write,
        );
    }

    pub fn write_u16(&mut self, addr: u64, value: u16) {
        let _ = paging::write_linear(
            self.state,
            self.mem,
            addr,
            Size::Word,
            u64::from(value),
            Access::Write,
        );
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        let _ = paging::write_linear(
            self.state,
            self.mem,
            addr,
            Size::Dword,
            u64::from(value),
            Access::Write,
        );
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        let _ = paging::write_linear(
            self.state,
            self.mem,
            addr,
            Size::Qword,
            value,
            Access::Write,
        );
    }
}

/// A sequential argument cursor. Pointer-sized arguments take one slot; 64-bit values
/// take one register in the x64 convention but two stack slots under cdecl.
pub(crate) struct Args {
    slot: usize,
}

impl Args {
    /// A pointer-sized (UINTN, pointer, handle) argument.
    pub fn ptr(&mut self, call: &mut ServiceCall) -> u64 {
        let value = call.arg(self.slot);
        self.slot += 1;

        if call.wide {
            value
        } else {
            value & 0xffff_ffff
        }
    }

    /// A 32-bit argument (still one slot in both conventions).
    pub fn u32(&mut self, call: &mut ServiceCall) -> u32 {
        self.ptr(call) as u32
    }

    /// A full 64-bit argument.
    pub fn u64(&mut self, call: &mut ServiceCall) -> u64 {
        if call.wide {
            let value = call.arg(self.slot);
            self.slot += 1;
            value
        } else {
            let low = call.arg(self.slot) & 0xffff_ffff;
            let high = call.arg(self.slot + 1) & 0xffff_ffff;
            self.slot += 2;
            low | high << 32
        }
    }
}
