//! El Torito boot-catalogue inspection and the EFI boot-file probe.
//!
//! A UEFI-bootable ISO declares an EFI (0xEF) platform entry in its boot catalogue. The
//! catalogue is consulted for that declaration; the actual boot payload is then resolved
//! through the filesystem as one of the well-known `\EFI\BOOT` names.

use crate::error::Error;
use crate::machine::{BootMode, IsoEntry, IsoVolume};
use log::debug;

/// The candidate boot paths per bitness, in probe order.
const CANDIDATES_64: [&str; 2] = ["EFI/BOOT/GRUBX64.EFI", "EFI/BOOT/BOOTX64.EFI"];
const CANDIDATES_32: [&str; 2] = ["EFI/BOOT/GRUBIA32.EFI", "EFI/BOOT/BOOTIA32.EFI"];

/// The default El Torito entry of the EFI platform section, when declared.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EfiCatalogEntry {
    /// Start of the boot image in 2048-byte sectors.
    pub load_rba: u32,
    /// Image length in 512-byte virtual sectors.
    pub sector_count: u16,
}

/// Reads the boot-record volume descriptor and returns the EFI section's default entry
/// when the catalogue declares platform 0xEF.
pub fn efi_catalog_entry(iso: &mut dyn IsoVolume) -> Option<EfiCatalogEntry> {
    // The boot record volume descriptor lives at sector 17.
    let mut descriptor = [0u8; 2048];
    iso.read_at(17 * 2048, &mut descriptor).ok()?;

    if descriptor[0] != 0 || &descriptor[1..6] != b"CD001" {
        return None;
    }

    if !descriptor[7..30].starts_with(b"EL TORITO SPECIFICATION") {
        return None;
    }

    let catalog_lba = u32::from_le_bytes(descriptor[0x47..0x4b].try_into().unwrap());

    let mut catalog = [0u8; 2048];
    iso.read_at(u64::from(catalog_lba) * 2048, &mut catalog).ok()?;

    // Validation entry: header 0x01, key bytes 0x55 0xAA.
    if catalog[0] != 0x01 || catalog[0x1e] != 0x55 || catalog[0x1f] != 0xaa {
        return None;
    }

    // Scan section headers for the EFI platform id; the validation entry's own platform
    // byte covers the initial section.
    let mut offset = 0x20;
    let mut platform = catalog[1];

    loop {
        let entry = &catalog[offset..offset + 0x20];

        match entry[0] {
            // Initial/default or section entry: bootable if 0x88.
            0x88 => {
                if platform == 0xef {
                    return Some(EfiCatalogEntry {
                        load_rba: u32::from_le_bytes(entry[8..12].try_into().unwrap()),
                        sector_count: u16::from_le_bytes(entry[6..8].try_into().unwrap()),
                    });
                }
            }
            // Section header: carries the platform id for the entries that follow.
            0x90 | 0x91 => {
                platform = entry[1];
            }
            _ => return None,
        }

        offset += 0x20;

        if offset + 0x20 > catalog.len() {
            return None;
        }
    }
}

/// Resolves the EFI boot file for the requested bitness, preferring the GRUB name. The
/// catalogue declaration is advisory; the filesystem lookup is what loads.
pub fn find_boot_file(
    iso: &mut dyn IsoVolume,
    mode: BootMode,
) -> Result<(IsoEntry, &'static str), Error> {
    if let Some(entry) = efi_catalog_entry(iso) {
        debug!(
            "el torito declares an EFI image at rba {:#x} ({} sectors)",
            entry.load_rba, entry.sector_count
        );
    }

    let candidates = match mode {
        BootMode::Uefi64 => &CANDIDATES_64,
        BootMode::Uefi32 => &CANDIDATES_32,
    };

    for path in candidates {
        if let Some(entry) = iso.lookup(path) {
            debug!("boot file {path} at offset {:#x}", entry.offset);
            return Ok((entry, path));
        }
    }

    Err(Error::NoBootFile)
}
