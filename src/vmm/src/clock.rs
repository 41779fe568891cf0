// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest clock capture/restore (spec.md §4.F "the main thread writes the
//! guest clock", §4.H "send the guest clock"). KVM tracks the guest's
//! notion of wall time separately from vCPU register state; both
//! checkpoint and migration transfer it alongside the per-core state.

use kvm_bindings::kvm_clock_data;
use kvm_ioctls::VmFd;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read the guest clock: {0}")]
    Get(kvm_ioctls::Error),
    #[error("failed to restore the guest clock: {0}")]
    Set(kvm_ioctls::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub fn save(vm_fd: &VmFd) -> Result<kvm_clock_data> {
    vm_fd.get_clock().map_err(Error::Get)
}

pub fn restore(vm_fd: &VmFd, clock: &kvm_clock_data) -> Result<()> {
    vm_fd.set_clock(clock).map_err(Error::Set)
}

/// `kvm_clock_data`'s reserved `pad`/`pad2` fields carry no state worth
/// preserving across a save/restore round trip, so checkpoint and
/// migration transfer this smaller, serializable shape instead of the
/// raw KVM struct (which the `kvm-bindings` `serde` feature does not
/// cover).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ClockSnapshot {
    pub clock: u64,
    pub flags: u32,
}

impl From<kvm_clock_data> for ClockSnapshot {
    fn from(c: kvm_clock_data) -> Self {
        ClockSnapshot { clock: c.clock, flags: c.flags }
    }
}

impl From<ClockSnapshot> for kvm_clock_data {
    fn from(c: ClockSnapshot) -> Self {
        kvm_clock_data { clock: c.clock, flags: c.flags, ..Default::default() }
    }
}
