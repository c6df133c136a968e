//! Boots an ISO image and mirrors the guest's console output to stdout.
//!
//! The ISO9660 reader lives here in the driver: the core only consumes the `IsoVolume`
//! contract. This one is deliberately small - primary volume descriptor, directory
//! records, case-insensitive lookup - which covers GRUB-authored media.

use sx_rs::{
    BootMode, Error, ExitReason, IsoEntry, IsoVolume, KeyStroke, Keyboard, MachineBuilder,
    Screen,
};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

const SECTOR: u64 = 2048;

struct FileVolume {
    file: File,
    size: u64,
}

impl FileVolume {
    fn open(path: &str) -> Result<Self, Error> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }

    fn read_sector(&mut self, lba: u64) -> Result<[u8; SECTOR as usize], Error> {
        let mut sector = [0u8; SECTOR as usize];
        self.read_at(lba * SECTOR, &mut sector)?;
        Ok(sector)
    }

    /// Finds a name inside a directory extent. ISO9660 stores file identifiers with a
    /// `;1` version suffix and uppercase letters.
    fn find_in_directory(
        &mut self,
        extent_lba: u64,
        extent_len: u64,
        name: &str,
    ) -> Result<Option<(u64, u64, bool)>, Error> {
        let mut remaining = extent_len;
        let mut lba = extent_lba;

        while remaining > 0 {
            let sector = self.read_sector(lba)?;
            let mut offset = 0usize;

            while offset < sector.len() {
                let record_len = sector[offset] as usize;

                if record_len == 0 {
                    // Records never span sectors; a zero length pads to the boundary.
                    break;
                }

                let record = &sector[offset..offset + record_len];
                let flags = record[25];
                let name_len = record[32] as usize;
                let raw_name = &record[33..33 + name_len];

                let ident: String = raw_name
                    .iter()
                    .map(|&b| b as char)
                    .take_while(|&c| c != ';')
                    .collect();

                if ident.eq_ignore_ascii_case(name) {
                    let start = u64::from(u32::from_le_bytes(
                        record[2..6].try_into().unwrap(),
                    ));
                    let size = u64::from(u32::from_le_bytes(
                        record[10..14].try_into().unwrap(),
                    ));
                    return Ok(Some((start * SECTOR, size, flags & 0x02 != 0)));
                }

                offset += record_len;
            }

            lba += 1;
            remaining = remaining.saturating_sub(SECTOR);
        }

        Ok(None)
    }
}

impl IsoVolume for FileVolume {
    fn size_bytes(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        if offset + buf.len() as u64 > self.size {
            return Err(Error::MediumBounds {
                offset,
                len: buf.len(),
            });
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn lookup(&mut self, path: &str) -> Option<IsoEntry> {
        // Primary volume descriptor at sector 16; root record at offset 156.
        let pvd = self.read_sector(16).ok()?;

        if pvd[0] != 1 || &pvd[1..6] != b"CD001" {
            return None;
        }

        let root = &pvd[156..190];
        let mut extent = u64::from(u32::from_le_bytes(root[2..6].try_into().unwrap())) * SECTOR;
        let mut size = u64::from(u32::from_le_bytes(root[10..14].try_into().unwrap()));
        let mut directory = true;

        for component in path.split('/').filter(|part| !part.is_empty()) {
            if !directory {
                return None;
            }

            let (next_extent, next_size, next_dir) = self
                .find_in_directory(extent / SECTOR, size, component)
                .ok()??;

            extent = next_extent;
            size = next_size;
            directory = next_dir;
        }

        Some(IsoEntry {
            offset: extent,
            size,
            name: path.to_string(),
            directory,
        })
    }
}

struct StdoutScreen;

impl Screen for StdoutScreen {
    fn put(&mut self, byte: u8) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(&[byte]);
        let _ = stdout.flush();
    }
}

struct StdinKeys;

impl Keyboard for StdinKeys {
    fn poll_key(&mut self) -> Option<KeyStroke> {
        // No interactive input in the demo; the guest sees NotReady and keeps polling.
        None
    }
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let mut args = std::env::args().skip(1);

    let Some(iso_path) = args.next() else {
        eprintln!("usage: boot-iso <image.iso> [--uefi32] [--mem <MiB>] [--steps <N>]");
        std::process::exit(2);
    };

    let mut mode = BootMode::Uefi64;
    let mut memory = 256u64;
    let mut steps = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--uefi32" => mode = BootMode::Uefi32,
            "--mem" => {
                memory = args
                    .next()
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(memory);
            }
            "--steps" => {
                steps = args.next().and_then(|value| value.parse().ok());
            }
            other => {
                eprintln!("unknown argument: {other}");
                std::process::exit(2);
            }
        }
    }

    let volume = FileVolume::open(&iso_path)?;

    let mut machine = MachineBuilder::new()
        .with_memory_size(memory << 20)
        .with_boot_mode(mode)
        .build(
            Box::new(volume),
            Box::new(StdoutScreen),
            Box::new(StdinKeys),
        );

    machine.boot()?;

    let reason = machine.run(steps);
    let diagnostics = machine.diagnostics();

    eprintln!(
        "\nmachine stopped: {reason:?} ({} firmware calls, {} disk reads)",
        diagnostics.firmware_calls, diagnostics.disk_reads
    );

    match reason {
        ExitReason::AppExited | ExitReason::Halted | ExitReason::Shutdown => Ok(()),
        _ => std::process::exit(1),
    }
}
