// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest page-table scanner and dirty/accessed page dumper (spec.md
//! §4.E). Used by the checkpoint store to emit full or incremental
//! memory dumps, and must only run while every vCPU is quiesced.

use kvm_ioctls::VmFd;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryMmap};

use crate::memory::MemoryManager;

const PAGE_SIZE: u64 = 0x1000;
const HUGE_PAGE_SIZE: u64 = 0x20_0000;
const PTE_PRESENT: u64 = 1 << 0;
const PTE_ACCESSED: u64 = 1 << 5;
const PTE_DIRTY: u64 = 1 << 6;
const PTE_HUGE: u64 = 1 << 7;
const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
const ENTRIES_PER_TABLE: u64 = 512;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("guest memory error: {0}")]
    GuestMemory(#[from] vm_memory::GuestMemoryError),
    #[error("failed to read the KVM dirty log: {0}")]
    KvmIoctl(kvm_ioctls::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A present page the scanner selected, named by its owning PTE, its
/// physical frame address, and its size (4 KiB or 2 MiB for huge pages).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct PageRecord {
    pub entry: u64,
    pub page_ptr: u64,
    pub page_size: u64,
}

/// Which pages the scan selects (spec.md §4.E "Selection predicate").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    /// Every present page.
    Full,
    /// Present pages with the dirty bit set (incremental round after a
    /// full dump already exists) or the accessed bit set (first
    /// incremental round following a full dump).
    Incremental { after_full: bool },
}

fn selects(entry: u64, mode: DumpMode) -> bool {
    if entry & PTE_PRESENT == 0 {
        return false;
    }
    match mode {
        DumpMode::Full => true,
        DumpMode::Incremental { after_full: true } => entry & PTE_DIRTY != 0,
        DumpMode::Incremental { after_full: false } => entry & PTE_ACCESSED != 0,
    }
}

fn clear_watermark_bits(entry: u64) -> u64 {
    entry & !(PTE_ACCESSED | PTE_DIRTY)
}

fn read_entry(guest_memory: &GuestMemoryMmap, table_base: u64, index: u64) -> Result<u64> {
    Ok(guest_memory.read_obj(GuestAddress(table_base + index * 8))?)
}

fn write_entry(guest_memory: &GuestMemoryMmap, table_base: u64, index: u64, value: u64) -> Result<()> {
    Ok(guest_memory.write_obj(value, GuestAddress(table_base + index * 8))?)
}

/// Walks the guest's 4-level page hierarchy rooted at
/// `entry_point + PAGE_SIZE` (the same root [`MemoryManager::virt_to_phys`]
/// uses), selecting pages per `mode`. For incremental modes, clears the
/// observed accessed/dirty bits after enumeration to reset the
/// watermark (spec.md §4.E).
pub fn scan(guest_memory: &GuestMemoryMmap, entry_point: u64, mode: DumpMode) -> Result<Vec<PageRecord>> {
    let mut out = Vec::new();
    let pml4_base = entry_point + PAGE_SIZE;

    for pml4i in 0..ENTRIES_PER_TABLE {
        let pml4e = read_entry(guest_memory, pml4_base, pml4i)?;
        if pml4e & PTE_PRESENT == 0 {
            continue;
        }
        let pdpt_base = pml4e & PTE_ADDR_MASK;

        for pdpti in 0..ENTRIES_PER_TABLE {
            let pdpte = read_entry(guest_memory, pdpt_base, pdpti)?;
            if pdpte & PTE_PRESENT == 0 {
                continue;
            }
            let pd_base = pdpte & PTE_ADDR_MASK;

            for pdi in 0..ENTRIES_PER_TABLE {
                let pde = read_entry(guest_memory, pd_base, pdi)?;
                if pde & PTE_PRESENT == 0 {
                    continue;
                }

                if pde & PTE_HUGE != 0 {
                    if selects(pde, mode) {
                        out.push(PageRecord {
                            entry: pde,
                            page_ptr: pde & PTE_ADDR_MASK & !(HUGE_PAGE_SIZE - 1),
                            page_size: HUGE_PAGE_SIZE,
                        });
                    }
                    if matches!(mode, DumpMode::Incremental { .. }) {
                        write_entry(guest_memory, pd_base, pdi, clear_watermark_bits(pde))?;
                    }
                    continue;
                }

                let pt_base = pde & PTE_ADDR_MASK;
                for pti in 0..ENTRIES_PER_TABLE {
                    let pte = read_entry(guest_memory, pt_base, pti)?;
                    if pte & PTE_PRESENT == 0 {
                        continue;
                    }
                    if selects(pte, mode) {
                        out.push(PageRecord {
                            entry: pte,
                            page_ptr: pte & PTE_ADDR_MASK,
                            page_size: PAGE_SIZE,
                        });
                    }
                    if matches!(mode, DumpMode::Incremental { .. }) {
                        write_entry(guest_memory, pt_base, pti, clear_watermark_bits(pte))?;
                    }
                }
            }
        }
    }

    Ok(out)
}

/// Alternative backend: consults KVM's per-slot dirty-log bitmap instead
/// of walking guest page tables (spec.md §4.E "Alternative backend").
/// The two memory slots are scanned consecutively with each slot's guest
/// base address added to derive the absolute physical address of a set
/// bit's 4 KiB frame.
pub fn scan_dirty_log(vm_fd: &VmFd, memory: &MemoryManager) -> Result<Vec<PageRecord>> {
    let mut out = Vec::new();

    for (slot, chunk) in memory.chunks().iter().enumerate() {
        let bitmap = vm_fd
            .get_dirty_log(slot as u32, chunk.size as usize)
            .map_err(Error::KvmIoctl)?;

        for (word_idx, word) in bitmap.iter().enumerate() {
            for bit in 0..64 {
                if word & (1u64 << bit) == 0 {
                    continue;
                }
                let page_index = word_idx as u64 * 64 + bit as u64;
                let page_ptr = chunk.guest_addr + page_index * PAGE_SIZE;
                out.push(PageRecord {
                    entry: 0,
                    page_ptr,
                    page_size: PAGE_SIZE,
                });
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_mode_selects_any_present_entry() {
        assert!(selects(PTE_PRESENT, DumpMode::Full));
        assert!(!selects(0, DumpMode::Full));
    }

    #[test]
    fn incremental_after_full_requires_dirty_bit() {
        let mode = DumpMode::Incremental { after_full: true };
        assert!(selects(PTE_PRESENT | PTE_DIRTY, mode));
        assert!(!selects(PTE_PRESENT | PTE_ACCESSED, mode));
    }

    #[test]
    fn incremental_first_pass_requires_accessed_bit() {
        let mode = DumpMode::Incremental { after_full: false };
        assert!(selects(PTE_PRESENT | PTE_ACCESSED, mode));
        assert!(!selects(PTE_PRESENT | PTE_DIRTY, mode));
    }

    #[test]
    fn clearing_watermark_bits_preserves_other_flags() {
        let entry = PTE_PRESENT | PTE_ACCESSED | PTE_DIRTY | PTE_HUGE;
        let cleared = clear_watermark_bits(entry);
        assert_eq!(cleared & PTE_PRESENT, PTE_PRESENT);
        assert_eq!(cleared & PTE_HUGE, PTE_HUGE);
        assert_eq!(cleared & (PTE_ACCESSED | PTE_DIRTY), 0);
    }
}
