// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The fixed-layout block the hypervisor writes into the guest's first
//! loaded segment and the guest reads back during its own boot
//! (spec.md §3 "Guest boot parameters", §4.C "Sequencing across cores").

use vm_memory::{Address, ByteValued, GuestAddress, GuestMemoryMmap};

/// Offset, relative to the start of the first `LOAD` segment, at which
/// [`BootParams`] is written. Chosen to sit below any code the unikernel
/// places at the very front of its image.
pub const BOOT_PARAMS_OFFSET: u64 = 0x200;

/// Magic guests can check to confirm the hypervisor populated this block
/// and didn't just leave zeroed segment memory behind.
pub const BOOT_PARAMS_MAGIC: u32 = 0x554D_4D56; // "VMMU"

/// Fixed, C-compatible layout mirroring spec.md §3. Every field is native
/// little-endian on x86_64, matching how the guest reads it back.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BootParams {
    pub magic: u32,
    pub version: u32,

    /// Guest-physical start address of usable RAM (always 0 here).
    pub base: u64,
    /// Guest-physical memory limit, i.e. configured guest size in bytes.
    pub limit: u64,

    /// Measured host TSC frequency in kHz.
    pub cpu_freq_khz: u32,
    /// Number of configured vCPUs.
    pub num_cpus: u32,
    /// This vCPU's id; each vCPU gets its own copy of the block's base
    /// page remapped, so the hypervisor can patch this field per core. In
    /// this implementation all cores share one block and instead read
    /// `current_boot_id` below once the handshake admits them.
    pub cpu_id: u32,

    /// Nonzero to tell the guest it is running under this hypervisor
    /// (vs. bare metal), spec.md calls this the "uhyve announcement flag".
    pub uhyve: u8,
    _pad0: [u8; 3],

    pub uart_port: u16,
    _pad1: [u8; 2],

    pub ip: [u8; 4],
    pub gateway: [u8; 4],
    pub mask: [u8; 4],

    /// Host virtual address of the start of guest memory; used by tooling
    /// that wants to dereference guest-physical addresses directly, e.g.
    /// the migration responder while reconstructing memory.
    pub host_base: u64,

    /// Entry-sequencing counter: core `i` busy-waits until this reaches
    /// `i`, then advances it by writing `i + 1`.
    pub cpu_online_gate: u32,
    /// Slot the admitted core writes its own id into, so the guest's
    /// secondary-core trampoline knows which stack/percore area to use.
    pub current_boot_id: u32,
}

// SAFETY: `BootParams` is a plain, repr(C) struct of integers and byte
// arrays with no padding-sensitive invariants beyond what `#[repr(C)]`
// already guarantees, so treating it as a flat byte blob is sound.
unsafe impl ByteValued for BootParams {}

impl BootParams {
    /// Writes the block into guest memory at `segment_start + BOOT_PARAMS_OFFSET`.
    pub fn write(
        &self,
        guest_memory: &GuestMemoryMmap,
        segment_start: GuestAddress,
    ) -> vm_memory::Result<()> {
        use vm_memory::Bytes;
        guest_memory.write_obj(*self, segment_start.unchecked_add(BOOT_PARAMS_OFFSET))
    }

    /// Reads the block back, used by the migration responder to recover
    /// the guest's configured memory limit/cpu count after a restore.
    pub fn read(
        guest_memory: &GuestMemoryMmap,
        segment_start: GuestAddress,
    ) -> vm_memory::Result<Self> {
        use vm_memory::Bytes;
        guest_memory.read_obj(segment_start.unchecked_add(BOOT_PARAMS_OFFSET))
    }
}
