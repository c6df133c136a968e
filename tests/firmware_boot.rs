//! Boot-path and firmware round-trips: a hand-built PE is served from an in-memory
//! volume, the machine boots it and the guest talks to the firmware through the
//! trampoline space.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use sx_rs::{
    BootMode, Error, ExitReason, IsoEntry, IsoVolume, KeyStroke, Keyboard, MachineBuilder,
    QueueKeyboard, Screen,
};

/// An in-memory volume: a flat byte store plus a path table.
struct RamVolume {
    data: Vec<u8>,
    files: HashMap<String, (u64, u64)>,
}

impl RamVolume {
    fn new() -> Self {
        Self {
            data: vec![0; 2048 * 64],
            files: HashMap::new(),
        }
    }

    fn add_file(&mut self, path: &str, bytes: &[u8]) {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(bytes);
        // Pad to the next sector like a real mastering tool would.
        let pad = (2048 - self.data.len() % 2048) % 2048;
        self.data.extend(std::iter::repeat(0).take(pad));
        self.files
            .insert(path.to_string(), (offset, bytes.len() as u64));
    }
}

impl IsoVolume for RamVolume {
    fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let end = offset as usize + buf.len();

        if end > self.data.len() {
            return Err(Error::MediumBounds {
                offset,
                len: buf.len(),
            });
        }

        buf.copy_from_slice(&self.data[offset as usize..end]);
        Ok(())
    }

    fn lookup(&mut self, path: &str) -> Option<IsoEntry> {
        let (offset, size) = self.files.get(path).copied()?;

        Some(IsoEntry {
            offset,
            size,
            name: path.to_string(),
            directory: false,
        })
    }
}

/// A screen whose buffer outlives the machine.
#[derive(Clone, Default)]
struct SharedScreen {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl Screen for SharedScreen {
    fn put(&mut self, byte: u8) {
        self.bytes.borrow_mut().push(byte);
    }
}

/// Builds a PE image with one .text section holding `code` (entry at its start) and the
/// UTF-16 string "Hi\n" at a known RVA.
fn build_pe(code: &[u8], wide: bool) -> Vec<u8> {
    let mut image = vec![0u8; 0x600];

    image[0] = b'M';
    image[1] = b'Z';
    image[0x3c..0x40].copy_from_slice(&0x80u32.to_le_bytes());
    image[0x80..0x84].copy_from_slice(b"PE\0\0");

    let machine: u16 = if wide { 0x8664 } else { 0x014c };
    image[0x84..0x86].copy_from_slice(&machine.to_le_bytes());
    image[0x86..0x88].copy_from_slice(&1u16.to_le_bytes()); // one section

    let optional_size: u16 = if wide { 240 } else { 224 };
    image[0x94..0x96].copy_from_slice(&optional_size.to_le_bytes());

    let opt = 0x98;
    let magic: u16 = if wide { 0x020b } else { 0x010b };
    image[opt..opt + 2].copy_from_slice(&magic.to_le_bytes());
    image[opt + 16..opt + 20].copy_from_slice(&0x1000u32.to_le_bytes()); // entry

    if wide {
        image[opt + 24..opt + 32].copy_from_slice(&0x40_0000u64.to_le_bytes());
        image[opt + 108..opt + 112].copy_from_slice(&0u32.to_le_bytes()); // no dirs
    } else {
        image[opt + 28..opt + 32].copy_from_slice(&0x40_0000u32.to_le_bytes());
        image[opt + 92..opt + 96].copy_from_slice(&0u32.to_le_bytes());
    }

    image[opt + 56..opt + 60].copy_from_slice(&0x2000u32.to_le_bytes()); // image size
    image[opt + 60..opt + 64].copy_from_slice(&0x400u32.to_le_bytes()); // headers

    let sections = opt + usize::from(optional_size);
    image[sections..sections + 5].copy_from_slice(b".text");
    image[sections + 8..sections + 12].copy_from_slice(&0x1000u32.to_le_bytes()); // vsize
    image[sections + 12..sections + 16].copy_from_slice(&0x1000u32.to_le_bytes()); // va
    image[sections + 16..sections + 20].copy_from_slice(&0x200u32.to_le_bytes()); // raw size
    image[sections + 20..sections + 24].copy_from_slice(&0x400u32.to_le_bytes()); // raw ptr

    image[0x400..0x400 + code.len()].copy_from_slice(code);

    // The string "Hi\n\0" as UTF-16LE at RVA 0x1100.
    let string = [b'H', 0, b'i', 0, b'\n', 0, 0, 0];
    image[0x500..0x508].copy_from_slice(&string);

    image
}

#[test]
fn output_string_round_trip_64() {
    // entry(rcx = image handle, rdx = system table):
    //   mov rax, [rdx+64]     ; ConOut
    //   mov rcx, rax          ; This
    //   lea rdx, [rip+disp]   ; the string at 0x401100
    //   mov rax, [rax+8]      ; OutputString
    //   sub rsp, 0x28
    //   call rax
    //   add rsp, 0x28
    //   ret
    let mut code = vec![
        0x48, 0x8b, 0x42, 0x40, // mov rax, [rdx+64]
        0x48, 0x89, 0xc1, // mov rcx, rax
        0x48, 0x8d, 0x15, 0, 0, 0, 0, // lea rdx, [rip+disp]
        0x48, 0x8b, 0x40, 0x08, // mov rax, [rax+8]
        0x48, 0x83, 0xec, 0x28, // sub rsp, 0x28
        0xff, 0xd0, // call rax
        0x48, 0x83, 0xc4, 0x28, // add rsp, 0x28
        0xc3, // ret
    ];

    // The LEA's rip-relative target: next instruction is at RVA 0x1000 + 14.
    let disp = 0x1100u32.wrapping_sub(0x1000 + 14);
    code[10..14].copy_from_slice(&disp.to_le_bytes());

    let mut volume = RamVolume::new();
    volume.add_file("EFI/BOOT/BOOTX64.EFI", &build_pe(&code, true));

    let screen = SharedScreen::default();
    let bytes = screen.bytes.clone();

    let mut machine = MachineBuilder::new()
        .with_memory_size(256 << 20)
        .with_boot_mode(BootMode::Uefi64)
        .build(
            Box::new(volume),
            Box::new(screen),
            Box::new(QueueKeyboard::default()),
        );

    machine.boot().unwrap();
    let reason = machine.run(Some(10_000));

    assert_eq!(reason, ExitReason::AppExited);
    assert_eq!(bytes.borrow().as_slice(), b"Hi\n");
    // OutputString succeeded and the application's own status is what RAX held at RET.
    assert_eq!(machine.state().gpr64(sx_rs::arch::x86_64::RAX), 0);
    assert!(machine.diagnostics().firmware_calls >= 1);
}

#[test]
fn output_string_round_trip_32() {
    //   mov eax, [esp+8]      ; system table
    //   mov eax, [eax+44]     ; ConOut
    //   push 0x401100         ; string VA
    //   push eax              ; This
    //   mov eax, [eax+4]      ; OutputString
    //   call eax
    //   add esp, 8
    //   ret
    let code = [
        0x8b, 0x44, 0x24, 0x08, // mov eax, [esp+8]
        0x8b, 0x40, 0x2c, // mov eax, [eax+44]
        0x68, 0x00, 0x11, 0x40, 0x00, // push 0x401100
        0x50, // push eax
        0x8b, 0x40, 0x04, // mov eax, [eax+4]
        0xff, 0xd0, // call eax
        0x83, 0xc4, 0x08, // add esp, 8
        0xc3, // ret
    ];

    let mut volume = RamVolume::new();
    volume.add_file("EFI/BOOT/BOOTIA32.EFI", &build_pe(&code, false));

    let screen = SharedScreen::default();
    let bytes = screen.bytes.clone();

    let mut machine = MachineBuilder::new()
        .with_memory_size(256 << 20)
        .with_boot_mode(BootMode::Uefi32)
        .build(
            Box::new(volume),
            Box::new(screen),
            Box::new(QueueKeyboard::default()),
        );

    machine.boot().unwrap();
    let reason = machine.run(Some(10_000));

    assert_eq!(reason, ExitReason::AppExited);
    assert_eq!(bytes.borrow().as_slice(), b"Hi\n");
}

#[test]
fn missing_boot_file_is_a_host_error() {
    let volume = RamVolume::new();

    let mut machine = MachineBuilder::new().build(
        Box::new(volume),
        Box::new(SharedScreen::default()),
        Box::new(QueueKeyboard::default()),
    );

    assert!(matches!(machine.boot(), Err(Error::NoBootFile)));
}

#[test]
fn grub_named_image_is_preferred() {
    let mut volume = RamVolume::new();

    // Both names exist; GRUBX64 must win the probe order. Its code halts with
    // interrupts disabled rather than printing.
    let grub_code = [0xfa, 0xf4]; // cli; hlt
    let other_code = [0xc3]; // ret

    volume.add_file("EFI/BOOT/GRUBX64.EFI", &build_pe(&grub_code, true));
    volume.add_file("EFI/BOOT/BOOTX64.EFI", &build_pe(&other_code, true));

    let mut machine = MachineBuilder::new()
        .with_boot_mode(BootMode::Uefi64)
        .build(
            Box::new(volume),
            Box::new(SharedScreen::default()),
            Box::new(QueueKeyboard::default()),
        );

    machine.boot().unwrap();
    assert_eq!(machine.run(Some(1000)), ExitReason::Halted);
}

/// A keyboard with one queued stroke, for the NotReady path.
struct OneKey {
    sent: bool,
}

impl Keyboard for OneKey {
    fn poll_key(&mut self) -> Option<KeyStroke> {
        if self.sent {
            None
        } else {
            self.sent = true;
            Some(KeyStroke {
                scan_code: 0x11,
                unicode: u16::from(b'w'),
            })
        }
    }
}

#[test]
fn read_key_stroke_reports_not_ready_when_drained() {
    // entry: rdx = system table
    //   mov rax, [rdx+48]   ; ConIn
    //   mov rcx, rax
    //   lea rdx, [rsp-0x10] ; key buffer on the stack  -> use a fixed scratch address
    //   ...
    // Simpler: read the key twice into a scratch buffer at 0x20_0000 and return the
    // second status.
    let code = [
        0x48, 0x8b, 0x42, 0x30, // mov rax, [rdx+48]  (ConIn)
        0x48, 0x89, 0xc1, // mov rcx, rax
        0x48, 0xba, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, // mov rdx, 0x200000
        0x50, // push rax
        0x48, 0x8b, 0x40, 0x08, // mov rax, [rax+8]  (ReadKeyStroke)
        0x48, 0x83, 0xec, 0x20, // sub rsp, 0x20
        0xff, 0xd0, // call rax  (first: success)
        0x48, 0x83, 0xc4, 0x20, // add rsp, 0x20
        0x58, // pop rax
        0x48, 0x89, 0xc1, // mov rcx, rax
        0x48, 0xba, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, // mov rdx, 0x200000
        0x48, 0x8b, 0x40, 0x08, // mov rax, [rax+8]
        0x48, 0x83, 0xec, 0x28, // sub rsp, 0x28
        0xff, 0xd0, // call rax  (second: not ready)
        0x48, 0x83, 0xc4, 0x28, // add rsp, 0x28
        0xc3, // ret
    ];

    let mut volume = RamVolume::new();
    volume.add_file("EFI/BOOT/BOOTX64.EFI", &build_pe(&code, true));

    let mut machine = MachineBuilder::new()
        .with_boot_mode(BootMode::Uefi64)
        .build(
            Box::new(volume),
            Box::new(SharedScreen::default()),
            Box::new(OneKey { sent: false }),
        );

    machine.boot().unwrap();
    assert_eq!(machine.run(Some(10_000)), ExitReason::AppExited);

    // The first call stored the stroke; the second returned NotReady in RAX.
    assert_eq!(machine.memory().read_phys16(0x20_0000), 0x11);
    assert_eq!(
        machine.memory().read_phys16(0x20_0002),
        u16::from(b'w')
    );
    assert_eq!(
        machine.state().gpr64(sx_rs::arch::x86_64::RAX),
        0x8000_0000_0000_0006
    );
}
