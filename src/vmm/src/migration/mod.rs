// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Live/cold migration coordinator (spec.md §4.H). The initiator side
//! runs on a dedicated handler thread woken by a trigger; the responder
//! side runs before the guest's run loop starts at all.

pub mod transport;

use std::thread::JoinHandle;

use kvm_ioctls::VmFd;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::clock::{self, ClockSnapshot};
use crate::config::MigrationParams;
use crate::cpu::state::VcpuState;
use crate::pagetable::{self, DumpMode, PageRecord};
use crate::sync::Coordinator;
use transport::Channel;

/// Pre-copy rounds performed before quiescing vCPUs for a LIVE migration
/// (spec.md §4.H step 2).
const MIG_ITERS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("migration transport error: {0}")]
    Transport(#[from] transport::Error),
    #[error("page-table scan failed: {0}")]
    PageTable(#[from] pagetable::Error),
    #[error("guest memory error: {0}")]
    GuestMemory(#[from] vm_memory::GuestMemoryError),
    #[error("failed to (de)serialize migration data: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("clock error: {0}")]
    Clock(#[from] clock::Error),
    #[error("vCPU coordination error: {0}")]
    Sync(#[from] crate::sync::Error),
    #[error("responder reported a metadata mismatch: expected {expected:?}, got {got:?}")]
    MetadataMismatch { expected: Metadata, got: Metadata },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Exchanged once, right after connecting (spec.md §4.H step 1, §6
/// "Migration port").
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Metadata {
    pub ncores: u8,
    pub guest_size: u64,
    pub checkpoint_number: u32,
    pub entry_point: u64,
    pub full_flag: bool,
}

fn send_value<T: serde::Serialize>(channel: &mut Channel, value: &T) -> Result<()> {
    Ok(channel.send_blob(&bincode::serialize(value)?)?)
}

fn recv_value<T: serde::de::DeserializeOwned>(channel: &mut Channel) -> Result<T> {
    Ok(bincode::deserialize(&channel.recv_blob()?)?)
}

fn send_pages(channel: &mut Channel, guest_memory: &GuestMemoryMmap, records: &[PageRecord]) -> Result<()> {
    send_value(channel, &(records.len() as u64))?;
    for record in records {
        send_value(channel, record)?;
        let mut buf = vec![0u8; record.page_size as usize];
        guest_memory.read_slice(&mut buf, GuestAddress(record.page_ptr))?;
        channel.send_all(&buf)?;
    }
    Ok(())
}

fn recv_pages(channel: &mut Channel, guest_memory: &GuestMemoryMmap) -> Result<()> {
    let count: u64 = recv_value(channel)?;
    for _ in 0..count {
        let record: PageRecord = recv_value(channel)?;
        let mut buf = vec![0u8; record.page_size as usize];
        channel.recv_all(&mut buf)?;
        guest_memory.write_slice(&buf, GuestAddress(record.page_ptr))?;
    }
    Ok(())
}

/// Runs the initiator side to completion: pre-copy rounds (if live),
/// vCPU quiescence, final delta, vCPU states, and clock (spec.md §4.H
/// "Initiator side").
#[allow(clippy::too_many_arguments)]
pub fn initiate(
    ip: &str,
    port: u16,
    params: MigrationParams,
    metadata: Metadata,
    guest_memory: &GuestMemoryMmap,
    vm_fd: &VmFd,
    coordinator: &Coordinator,
    vcpu_handles: &[JoinHandle<()>],
    state_slots: &[std::sync::Mutex<Option<VcpuState>>],
) -> Result<()> {
    let mut channel = Channel::connect(ip, port)?;
    send_value(&mut channel, &params)?;
    send_value(&mut channel, &metadata)?;

    if params.live {
        for _ in 0..MIG_ITERS {
            let records = pagetable::scan(guest_memory, metadata.entry_point, DumpMode::Incremental { after_full: true })?;
            send_pages(&mut channel, guest_memory, &records)?;
        }
    }

    coordinator.quiesce_vcpus(vcpu_handles)?;

    let final_mode = if params.live {
        DumpMode::Incremental { after_full: true }
    } else {
        DumpMode::Full
    };
    let final_records = pagetable::scan(guest_memory, metadata.entry_point, final_mode)?;
    send_pages(&mut channel, guest_memory, &final_records)?;

    let states: Vec<VcpuState> = state_slots
        .iter()
        .map(|slot| slot.lock().unwrap().clone().expect("vCPU state missing after quiescence"))
        .collect();
    send_value(&mut channel, &states)?;

    let clock_data = ClockSnapshot::from(clock::save(vm_fd)?);
    send_value(&mut channel, &clock_data)?;

    coordinator.clear_stop();
    Ok(())
}

/// Runs the responder side: listens, accepts, checks `ncores`/`guest_size`
/// against `expected`, receives every pre-copy round and the final delta,
/// and returns the sender's metadata (carrying the real `entry_point`,
/// which the responder cannot know ahead of time) along with the restored
/// vCPU states and clock, for the caller to program before entering the
/// normal run loop (spec.md §4.H "Responder side").
pub fn respond(
    port: u16,
    expected: Metadata,
    guest_memory: &GuestMemoryMmap,
) -> Result<(Metadata, Vec<VcpuState>, ClockSnapshot)> {
    let mut channel = Channel::accept(port)?;
    let params: MigrationParams = recv_value(&mut channel)?;
    let got: Metadata = recv_value(&mut channel)?;
    if got.ncores != expected.ncores || got.guest_size != expected.guest_size {
        return Err(Error::MetadataMismatch { expected, got });
    }

    if params.live {
        for _ in 0..MIG_ITERS {
            recv_pages(&mut channel, guest_memory)?;
        }
    }
    recv_pages(&mut channel, guest_memory)?;

    let states: Vec<VcpuState> = recv_value(&mut channel)?;
    let clock_data: ClockSnapshot = recv_value(&mut channel)?;
    Ok((got, states, clock_data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_mismatch_is_detected() {
        let a = Metadata { ncores: 1, guest_size: 1, checkpoint_number: 0, entry_point: 0, full_flag: false };
        let b = Metadata { ncores: 2, ..a };
        assert_ne!(a, b);
    }
}
