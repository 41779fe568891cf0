// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The serializable vCPU state record (spec.md §3 "vCPU state record",
//! §4.C "Save path" / "Restore path") used by both the checkpoint store
//! and the migration coordinator.

use kvm_bindings::{
    kvm_fpu, kvm_lapic_state, kvm_mp_state, kvm_regs, kvm_sregs, kvm_vcpu_events, kvm_xcrs,
    kvm_xsave, Msrs,
};
use kvm_ioctls::VcpuFd;
use serde::{Deserialize, Serialize};

use super::msrs;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to issue a KVM ioctl while {0} vCPU state: {1}")]
    KvmIoctl(&'static str, kvm_ioctls::Error),
    #[error("failed to build the boot MSR template: {0}")]
    Msrs(msrs::Error),
    #[error("KVM returned an unexpected count of {0} entries")]
    ShortTransfer(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wire-compatible mirrors of the `kvm-bindings` register structs. These
/// types carry no behavior of their own; they exist so `VcpuState` can
/// derive `Serialize`/`Deserialize` without requiring that feature be
/// turned on for every downstream user of `kvm-bindings`' own types
/// (checkpoint/migration are the only consumers that need it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcpuState {
    pub regs: kvm_regs,
    pub sregs: kvm_sregs,
    #[serde(with = "msrs_serde")]
    pub msrs: Msrs,
    pub xcrs: kvm_xcrs,
    pub mp_state: kvm_mp_state,
    pub lapic: kvm_lapic_state,
    pub fpu: kvm_fpu,
    pub xsave: kvm_xsave,
    pub events: kvm_vcpu_events,
}

/// (De)serializes `Msrs`, which is a FAM (flexible-array-member) wrapper
/// with no `Serialize` impl of its own, as a plain `Vec<(index, data)>`.
mod msrs_serde {
    use super::*;
    use kvm_bindings::kvm_msr_entry;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(msrs: &Msrs, ser: S) -> std::result::Result<S::Ok, S::Error> {
        let pairs: Vec<(u32, u64)> = msrs
            .as_slice()
            .iter()
            .map(|e| (e.index, e.data))
            .collect();
        pairs.serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Msrs, D::Error> {
        let pairs = Vec::<(u32, u64)>::deserialize(de)?;
        let entries: Vec<kvm_msr_entry> = pairs
            .into_iter()
            .map(|(index, data)| kvm_msr_entry {
                index,
                data,
                ..Default::default()
            })
            .collect();
        Msrs::from_entries(&entries).map_err(serde::de::Error::custom)
    }
}

/// Reads the complete architectural state of `vcpu_fd` (spec.md §4.C
/// "Save path").
pub fn save(vcpu_fd: &VcpuFd) -> Result<VcpuState> {
    let regs = vcpu_fd
        .get_regs()
        .map_err(|e| Error::KvmIoctl("reading regs", e))?;
    let sregs = vcpu_fd
        .get_sregs()
        .map_err(|e| Error::KvmIoctl("reading sregs", e))?;

    let mut msrs = msrs::boot_msrs_template().map_err(Error::Msrs)?;
    let read = vcpu_fd
        .get_msrs(&mut msrs)
        .map_err(|e| Error::KvmIoctl("reading msrs", e))?;
    if read != msrs::BOOT_MSR_INDICES.len() {
        return Err(Error::ShortTransfer("msrs"));
    }

    let xcrs = vcpu_fd
        .get_xcrs()
        .map_err(|e| Error::KvmIoctl("reading xcrs", e))?;
    let lapic = vcpu_fd
        .get_lapic()
        .map_err(|e| Error::KvmIoctl("reading lapic", e))?;
    let fpu = vcpu_fd
        .get_fpu()
        .map_err(|e| Error::KvmIoctl("reading fpu", e))?;
    let xsave = vcpu_fd
        .get_xsave()
        .map_err(|e| Error::KvmIoctl("reading xsave", e))?;
    let events = vcpu_fd
        .get_vcpu_events()
        .map_err(|e| Error::KvmIoctl("reading vcpu events", e))?;
    let mp_state = vcpu_fd
        .get_mp_state()
        .map_err(|e| Error::KvmIoctl("reading mp state", e))?;

    Ok(VcpuState {
        regs,
        sregs,
        msrs,
        xcrs,
        mp_state,
        lapic,
        fpu,
        xsave,
        events,
    })
}

/// Writes `state` back into `vcpu_fd` in the dependency order spec.md
/// §4.C names: "sregs → regs → MSRs → XCRs → MP → LAPIC → FPU → XSAVE →
/// events"; forces the MP state runnable and reprograms CPUID first since
/// both sregs and the MSR set depend on the CPUID feature set already
/// being in place.
pub fn restore(vcpu_fd: &VcpuFd, state: &VcpuState, cpuid: &kvm_bindings::CpuId) -> Result<()> {
    vcpu_fd
        .set_cpuid2(cpuid)
        .map_err(|e| Error::KvmIoctl("restoring cpuid", e))?;

    vcpu_fd
        .set_sregs(&state.sregs)
        .map_err(|e| Error::KvmIoctl("restoring sregs", e))?;
    vcpu_fd
        .set_regs(&state.regs)
        .map_err(|e| Error::KvmIoctl("restoring regs", e))?;
    vcpu_fd
        .set_msrs(&state.msrs)
        .map_err(|e| Error::KvmIoctl("restoring msrs", e))?;
    vcpu_fd
        .set_xcrs(&state.xcrs)
        .map_err(|e| Error::KvmIoctl("restoring xcrs", e))?;

    let mut runnable_mp_state = state.mp_state;
    runnable_mp_state.mp_state = kvm_bindings::KVM_MP_STATE_RUNNABLE;
    vcpu_fd
        .set_mp_state(runnable_mp_state)
        .map_err(|e| Error::KvmIoctl("restoring mp state", e))?;

    vcpu_fd
        .set_lapic(&state.lapic)
        .map_err(|e| Error::KvmIoctl("restoring lapic", e))?;
    vcpu_fd
        .set_fpu(&state.fpu)
        .map_err(|e| Error::KvmIoctl("restoring fpu", e))?;
    vcpu_fd
        .set_xsave(&state.xsave)
        .map_err(|e| Error::KvmIoctl("restoring xsave", e))?;
    vcpu_fd
        .set_vcpu_events(&state.events)
        .map_err(|e| Error::KvmIoctl("restoring vcpu events", e))?;

    Ok(())
}
