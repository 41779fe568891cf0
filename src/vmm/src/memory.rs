// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest physical memory management (spec.md §4.A).
//!
//! A single anonymous host mapping backs all of guest RAM. Once the
//! configured size reaches the 32-bit MMIO hole, the mapping is split in
//! two: everything below the hole, and everything above it shifted up by
//! the hole's size. `vm-memory`'s `GuestMemoryMmap` already models
//! multiple disjoint regions, so the "gap" is simply a region boundary we
//! never register a KVM memory slot for.

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use vm_memory::{Address, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion};

/// Start of the 32-bit MMIO gap: 3 GiB (spec.md GLOSSARY).
pub const MMIO_GAP_START: u64 = 0xC000_0000;
/// Size of the 32-bit MMIO gap: 768 MiB.
pub const MMIO_GAP_SIZE: u64 = 0x3000_0000;

const PAGE_SIZE: u64 = 0x1000;
const HUGE_PAGE_SIZE: u64 = 0x20_0000;

// Page-table entry flag bits, common to all four levels (spec.md §3).
const PTE_PRESENT: u64 = 1 << 0;
const PTE_HUGE: u64 = 1 << 7;
const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to mmap guest memory: {0}")]
    Mmap(vm_memory::Error),
    #[error("failed to register a KVM memory slot: {0}")]
    KvmIoctl(kvm_ioctls::Error),
    #[error("virtual address {0:#x} is not mapped in the guest's page tables")]
    NotMapped(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One contiguous host-backed chunk of guest physical memory.
#[derive(Debug, Clone, Copy)]
pub struct MemChunk {
    pub guest_addr: u64,
    pub host_ptr: *mut u8,
    pub size: u64,
}

// `*mut u8` is a stable pointer into a long-lived private mmap; every
// consumer only reads/writes through `GuestMemoryMmap`, which has its own
// Send/Sync story, so exposing the raw pointer here for migration/transport
// plumbing is safe in the single-writer-per-region contract spec.md §5
// describes.
unsafe impl Send for MemChunk {}

pub struct MemoryManager {
    guest_memory: GuestMemoryMmap,
    chunks: Vec<MemChunk>,
}

impl MemoryManager {
    /// Allocates `size` bytes of guest RAM, inserting the 32-bit MMIO gap
    /// if `size` would otherwise straddle it, and registers the resulting
    /// chunks as KVM memory slots.
    pub fn new(vm_fd: &VmFd, size: u64, mergeable: bool, hugepage: bool) -> Result<Self> {
        let ranges = if size <= MMIO_GAP_START {
            vec![(GuestAddress(0), size as usize)]
        } else {
            vec![
                (GuestAddress(0), MMIO_GAP_START as usize),
                (
                    GuestAddress(MMIO_GAP_START + MMIO_GAP_SIZE),
                    (size - MMIO_GAP_START) as usize,
                ),
            ]
        };

        let guest_memory = GuestMemoryMmap::from_ranges(&ranges).map_err(Error::Mmap)?;

        let mut chunks = Vec::with_capacity(ranges.len());
        for (slot, region) in guest_memory.iter().enumerate() {
            let host_ptr = region.as_ptr();
            let guest_addr = region.start_addr().raw_value();
            let len = region.len();

            advise_memory(host_ptr, len as usize, mergeable, hugepage);

            // SAFETY: `host_ptr`/`len` describe the mmap'd region `region`
            // owns for at least as long as `guest_memory` (and thus this
            // `MemoryManager`) is alive.
            let kvm_region = kvm_userspace_memory_region {
                slot: slot as u32,
                guest_phys_addr: guest_addr,
                memory_size: len,
                userspace_addr: host_ptr as u64,
                flags: 0,
            };
            unsafe {
                vm_fd
                    .set_user_memory_region(kvm_region)
                    .map_err(Error::KvmIoctl)?;
            }

            chunks.push(MemChunk {
                guest_addr,
                host_ptr,
                size: len as u64,
            });
        }

        Ok(MemoryManager {
            guest_memory,
            chunks,
        })
    }

    /// Reconstructs the same hole-aware chunk layout on a migration
    /// responder, without registering KVM slots (the caller does that once
    /// the `VmFd` exists).
    pub fn chunks_for_size(size: u64) -> Vec<(u64, u64)> {
        if size <= MMIO_GAP_START {
            vec![(0, size)]
        } else {
            vec![
                (0, MMIO_GAP_START),
                (MMIO_GAP_START + MMIO_GAP_SIZE, size - MMIO_GAP_START),
            ]
        }
    }

    pub fn guest_memory(&self) -> &GuestMemoryMmap {
        &self.guest_memory
    }

    pub fn chunks(&self) -> &[MemChunk] {
        &self.chunks
    }

    /// Walks the guest's 4-level page hierarchy rooted at
    /// `entry_point + PAGE_SIZE` (spec.md §4.A) to translate a guest
    /// virtual address. Returns the physical address and the physical
    /// address one past the end of the page `va` falls in, so hypercall
    /// argument transfers can be split at page boundaries.
    pub fn virt_to_phys(&self, entry_point: u64, va: u64) -> Result<(u64, u64)> {
        let pml4_base = entry_point + PAGE_SIZE;

        let pml4_index = (va >> 39) & 0x1ff;
        let pdpt_index = (va >> 30) & 0x1ff;
        let pd_index = (va >> 21) & 0x1ff;
        let pt_index = (va >> 12) & 0x1ff;

        let pml4e = self.read_pte(pml4_base, pml4_index)?;
        let pdpt_base = pml4e & PTE_ADDR_MASK;

        let pdpte = self.read_pte(pdpt_base, pdpt_index)?;
        let pd_base = pdpte & PTE_ADDR_MASK;

        let pde = self.read_pte(pd_base, pd_index)?;
        if pde & PTE_HUGE != 0 {
            let frame = pde & PTE_ADDR_MASK & !(HUGE_PAGE_SIZE - 1);
            let offset = va & (HUGE_PAGE_SIZE - 1);
            return Ok((frame + offset, frame + HUGE_PAGE_SIZE));
        }

        let pt_base = pde & PTE_ADDR_MASK;
        let pte = self.read_pte(pt_base, pt_index)?;
        let frame = pte & PTE_ADDR_MASK;
        let offset = va & (PAGE_SIZE - 1);
        Ok((frame + offset, frame + PAGE_SIZE))
    }

    fn read_pte(&self, table_base: u64, index: u64) -> Result<u64> {
        let addr = table_base + index * 8;
        let entry: u64 = self
            .guest_memory
            .read_obj(GuestAddress(addr))
            .map_err(|_| Error::NotMapped(addr))?;
        if entry & PTE_PRESENT == 0 {
            return Err(Error::NotMapped(addr));
        }
        Ok(entry)
    }
}

fn advise_memory(host_ptr: *mut u8, len: usize, mergeable: bool, hugepage: bool) {
    if mergeable {
        // SAFETY: `host_ptr`/`len` describe a valid, currently-mapped
        // region; MADV_MERGEABLE is advisory and cannot fail the mapping.
        unsafe {
            libc::madvise(host_ptr as *mut libc::c_void, len, libc::MADV_MERGEABLE);
        }
    }
    if hugepage {
        // SAFETY: see above.
        unsafe {
            libc::madvise(host_ptr as *mut libc::c_void, len, libc::MADV_HUGEPAGE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_below_gap() {
        let chunks = MemoryManager::chunks_for_size(64 * 1024 * 1024);
        assert_eq!(chunks, vec![(0, 64 * 1024 * 1024)]);
    }

    #[test]
    fn two_chunks_above_gap() {
        let size = 4u64 * 1024 * 1024 * 1024;
        let chunks = MemoryManager::chunks_for_size(size);
        assert_eq!(
            chunks,
            vec![
                (0, MMIO_GAP_START),
                (MMIO_GAP_START + MMIO_GAP_SIZE, size - MMIO_GAP_START),
            ]
        );
    }

    #[test]
    fn exactly_at_gap_start_is_single_chunk() {
        let chunks = MemoryManager::chunks_for_size(MMIO_GAP_START);
        assert_eq!(chunks, vec![(0, MMIO_GAP_START)]);
    }
}
