//! Linear address translation.
//!
//! Every linear access is first masked by the current-mode address mask (52 bits in long
//! mode, 32 bits otherwise, 20 bits while the A20 gate is disabled). When CR0.PG is set the
//! masked address goes through a 4-level table walk from CR3 supporting 4 KiB, 2 MiB and
//! 1 GiB pages; accessed bits are set on every touched entry and the dirty bit on the leaf
//! for writes. Violations fault with vector 0x0E and an error code built from [`PfError`].

use crate::arch::x86_64::{Size, CR0_PG, CR0_WP};
use crate::fault::{Fault, PfError};
use crate::mem::Memory;
use crate::state::{CpuMode, CpuState};
use bitflags::bitflags;

bitflags! {
    /// Paging-structure entry bits shared by all four levels.
    pub struct PteFlags: u64 {
        const PRESENT   = 1 << 0;
        const WRITABLE  = 1 << 1;
        const USER      = 1 << 2;
        const ACCESSED  = 1 << 5;
        const DIRTY     = 1 << 6;
        /// Large-page bit: 1 GiB at the PDPT level, 2 MiB at the PD level.
        const PAGE_SIZE = 1 << 7;
    }
}

/// The physical-address field of an entry.
const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// The kind of memory access being translated. System accesses are the interpreter's own
/// structure walks (descriptor tables, gate reads, ring-switch stack pushes) and are exempt
/// from user/supervisor checks regardless of CPL.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    Fetch,
    SystemRead,
    SystemWrite,
}

impl Access {
    #[inline]
    fn is_write(self) -> bool {
        matches!(self, Access::Write | Access::SystemWrite)
    }

    #[inline]
    fn is_fetch(self) -> bool {
        matches!(self, Access::Fetch)
    }

    #[inline]
    fn is_system(self) -> bool {
        matches!(self, Access::SystemRead | Access::SystemWrite)
    }

    fn error_bits(self, user: bool) -> PfError {
        let mut bits = PfError::empty();

        if self.is_write() {
            bits |= PfError::WRITE;
        }

        if self.is_fetch() {
            bits |= PfError::IFETCH;
        }

        if user && !self.is_system() {
            bits |= PfError::USER;
        }

        bits
    }
}

/// The linear address mask for the current mode.
pub fn linear_mask(state: &CpuState) -> u64 {
    if !state.a20_enabled {
        0xf_ffff
    } else if state.mode == CpuMode::Long {
        (1 << 52) - 1
    } else {
        0xffff_ffff
    }
}

/// Whether paging is currently enabled.
#[inline]
pub fn paging_enabled(state: &CpuState) -> bool {
    state.control.cr0 & CR0_PG != 0
}

/// Translates a linear address to a physical address, applying the mode mask first and then
/// the page walk when paging is enabled. `user` should be true when the access originates at
/// CPL 3 (system accesses ignore it).
pub fn translate(
    state: &CpuState,
    mem: &mut Memory,
    addr: u64,
    access: Access,
    user: bool,
) -> Result<u64, Fault> {
    let addr = addr & linear_mask(state);

    if !paging_enabled(state) {
        return Ok(addr);
    }

    walk(state, mem, addr, access, user)
}

/// A side-effect-free translation: identical checks to [`translate`] but never sets
/// accessed or dirty bits. Fast-path preconditions use this so a skip truly touches
/// nothing.
pub fn probe(
    state: &CpuState,
    mem: &Memory,
    addr: u64,
    access: Access,
    user: bool,
) -> Option<u64> {
    let addr = addr & linear_mask(state);

    if !paging_enabled(state) {
        return Some(addr);
    }

    let check_user = user && !access.is_system();
    let check_write =
        access.is_write() && (check_user || state.control.cr0 & CR0_WP != 0 || user);

    let mut table = state.control.cr3 & PTE_ADDR_MASK;
    let mut writable = true;
    let mut user_ok = true;

    let shifts = [39, 30, 21, 12];

    for (level, shift) in shifts.iter().enumerate() {
        let index = (addr >> shift) & 0x1ff;
        let entry = mem.read_phys64(table + index * 8);
        let flags = PteFlags::from_bits_truncate(entry);

        if !flags.contains(PteFlags::PRESENT) {
            return None;
        }

        writable &= flags.contains(PteFlags::WRITABLE);
        user_ok &= flags.contains(PteFlags::USER);

        let leaf = match level {
            1 | 2 => flags.contains(PteFlags::PAGE_SIZE),
            3 => true,
            _ => {
                if flags.contains(PteFlags::PAGE_SIZE) {
                    return None;
                }

                false
            }
        };

        if leaf {
            if check_user && !user_ok || check_write && !writable {
                return None;
            }

            let page_mask = (1u64 << shifts[level]) - 1;
            let base = entry & PTE_ADDR_MASK & !page_mask;
            return Some(base | (addr & page_mask));
        }

        table = entry & PTE_ADDR_MASK;
    }

    unreachable!("the level-3 entry is always a leaf");
}

fn walk(
    state: &CpuState,
    mem: &mut Memory,
    addr: u64,
    access: Access,
    user: bool,
) -> Result<u64, Fault> {
    let error = access.error_bits(user);
    let check_user = user && !access.is_system();
    // Supervisor writes honour read-only pages only under CR0.WP.
    let check_write =
        access.is_write() && (check_user || state.control.cr0 & CR0_WP != 0 || user);

    let mut table = state.control.cr3 & PTE_ADDR_MASK;
    let mut writable = true;
    let mut user_ok = true;

    let shifts = [39, 30, 21, 12];

    for (level, shift) in shifts.iter().enumerate() {
        let index = (addr >> shift) & 0x1ff;
        let entry_addr = table + index * 8;
        let entry = mem.read_phys64(entry_addr);
        let flags = PteFlags::from_bits_truncate(entry);

        if !flags.contains(PteFlags::PRESENT) {
            return Err(Fault::page(addr, error));
        }

        writable &= flags.contains(PteFlags::WRITABLE);
        user_ok &= flags.contains(PteFlags::USER);

        let leaf = match level {
            1 | 2 if flags.contains(PteFlags::PAGE_SIZE) => true,
            3 => true,
            0 if flags.contains(PteFlags::PAGE_SIZE) => {
                return Err(Fault::page(addr, error | PfError::PRESENT | PfError::RESERVED));
            }
            _ => false,
        };

        if leaf {
            if check_user && !user_ok {
                return Err(Fault::page(addr, error | PfError::PRESENT));
            }

            if check_write && !writable {
                return Err(Fault::page(addr, error | PfError::PRESENT));
            }

            let mut updated = entry | PteFlags::ACCESSED.bits();

            if access.is_write() {
                updated |= PteFlags::DIRTY.bits();
            }

            if updated != entry {
                mem.write_phys64(entry_addr, updated);
            }

            let page_bits = shifts[level];
            let page_mask = (1u64 << page_bits) - 1;
            let base = entry & PTE_ADDR_MASK & !page_mask;

            return Ok(base | (addr & page_mask));
        }

        if entry & PteFlags::ACCESSED.bits() == 0 {
            mem.write_phys64(entry_addr, entry | PteFlags::ACCESSED.bits());
        }

        table = entry & PTE_ADDR_MASK;
    }

    unreachable!("the level-3 entry is always a leaf");
}

/// Reads a value through the linear address space, splitting at page boundaries.
pub fn read_linear(
    state: &CpuState,
    mem: &mut Memory,
    addr: u64,
    size: Size,
    access: Access,
) -> Result<u64, Fault> {
    let user = state.cpl() == 3;
    let bytes = size.bytes();

    if (addr & 0xfff) + bytes <= 0x1000 {
        let phys = translate(state, mem, addr, access, user)?;
        return Ok(mem.read_phys(phys, size));
    }

    let mut value = 0u64;

    for i in 0..bytes {
        let phys = translate(state, mem, addr.wrapping_add(i), access, user)?;
        value |= u64::from(mem.read_phys8(phys)) << (i * 8);
    }

    Ok(value)
}

/// Writes a value through the linear address space, splitting at page boundaries.
pub fn write_linear(
    state: &CpuState,
    mem: &mut Memory,
    addr: u64,
    size: Size,
    value: u64,
    access: Access,
) -> Result<(), Fault> {
    let user = state.cpl() == 3;
    let bytes = size.bytes();

    if (addr & 0xfff) + bytes <= 0x1000 {
        let phys = translate(state, mem, addr, access, user)?;
        mem.write_phys(phys, size, value);
        return Ok(());
    }

    for i in 0..bytes {
        let phys = translate(state, mem, addr.wrapping_add(i), access, user)?;
        mem.write_phys8(phys, (value >> (i * 8)) as u8);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_mapped_state(mem: &mut Memory) -> CpuState {
        let pml4 = 0x10000u64;
        let pdpt = 0x11000u64;
        let pd = 0x12000u64;
        let pt = 0x13000u64;

        let rw_user = (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER).bits();
        mem.write_phys64(pml4, pdpt | rw_user);
        mem.write_phys64(pdpt, pd | rw_user);
        mem.write_phys64(pd, pt | rw_user);

        for page in 0u64..16 {
            mem.write_phys64(pt + page * 8, (page << 12) | rw_user);
        }

        let mut state = CpuState::new();
        state.control.cr0 |= CR0_PG | crate::arch::x86_64::CR0_PE;
        state.control.cr3 = pml4;
        state
    }

    #[test]
    fn identity_walk_round_trips() {
        let mut mem = Memory::new(1 << 24);
        let state = identity_mapped_state(&mut mem);

        mem.write_phys32(0x2345, 0xcafe_f00d);
        let value = read_linear(&state, &mut mem, 0x2345, Size::Dword, Access::Read).unwrap();
        assert_eq!(value, 0xcafe_f00d);
    }

    #[test]
    fn unmapped_page_faults_with_cr2() {
        let mut mem = Memory::new(1 << 24);
        let state = identity_mapped_state(&mut mem);

        let fault =
            read_linear(&state, &mut mem, 0x20_0000, Size::Byte, Access::Read).unwrap_err();
        assert_eq!(fault.cr2, Some(0x20_0000));
        assert_eq!(fault.error_code, Some(0));
    }

    #[test]
    fn accessed_and_dirty_bits_are_set() {
        let mut mem = Memory::new(1 << 24);
        let state = identity_mapped_state(&mut mem);

        write_linear(&state, &mut mem, 0x4000, Size::Byte, 0xaa, Access::Write).unwrap();

        let pte = mem.read_phys64(0x13000 + 4 * 8);
        assert_ne!(pte & PteFlags::ACCESSED.bits(), 0);
        assert_ne!(pte & PteFlags::DIRTY.bits(), 0);

        let pde = mem.read_phys64(0x12000);
        assert_ne!(pde & PteFlags::ACCESSED.bits(), 0);
        assert_eq!(pde & PteFlags::DIRTY.bits(), 0);
    }

    #[test]
    fn a20_disabled_wraps_at_one_megabyte() {
        let mut mem = Memory::new(1 << 24);
        let mut state = CpuState::new();
        state.a20_enabled = false;

        mem.write_phys8(0x0_1234, 0x42);
        let value =
            read_linear(&state, &mut mem, 0x10_1234, Size::Byte, Access::Read).unwrap();
        assert_eq!(value, 0x42);

        state.a20_enabled = true;
        let value =
            read_linear(&state, &mut mem, 0x10_1234, Size::Byte, Access::Read).unwrap();
        assert_eq!(value, 0);
    }

    #[test]
    fn cross_page_write_lands_in_both_pages() {
        let mut mem = Memory::new(1 << 24);
        let state = identity_mapped_state(&mut mem);

        write_linear(
            &state,
            &mut mem,
            0xffe,
            Size::Dword,
            0x1122_3344,
            Access::Write,
        )
        .unwrap();

        assert_eq!(mem.read_phys16(0xffe), 0x3344);
        assert_eq!(mem.read_phys16(0x1000), 0x1122);
    }
}
