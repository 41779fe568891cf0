// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Model-specific register lists used at vCPU boot time (spec.md §4.C:
//! "writes model-specific register `misc-enable` to enable fast-string
//! operations") and tracked by the vCPU state record for checkpoint and
//! migration (spec.md §3: "a bounded set of model-specific registers").

use kvm_bindings::{kvm_msr_entry, Msrs};

use super::msr_index::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to build an MSR list")]
    Fam,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The MSRs the boot path programs explicitly. Restricted to the set
/// spec.md §3 names: "APIC base, SYSENTER trio, PAT, misc-enable, TSC,
/// STAR/LSTAR/CSTAR, EFER, FS/GS base, kernel-GS base, syscall mask".
pub const BOOT_MSR_INDICES: &[u32] = &[
    MSR_IA32_APICBASE,
    MSR_IA32_SYSENTER_CS,
    MSR_IA32_SYSENTER_ESP,
    MSR_IA32_SYSENTER_EIP,
    MSR_IA32_CR_PAT,
    MSR_IA32_MISC_ENABLE,
    MSR_IA32_TSC,
    MSR_STAR,
    MSR_LSTAR,
    MSR_CSTAR,
    MSR_EFER,
    MSR_FS_BASE,
    MSR_GS_BASE,
    MSR_KERNEL_GS_BASE,
    MSR_SYSCALL_MASK,
];

fn entry(index: u32, data: u64) -> kvm_msr_entry {
    kvm_msr_entry {
        index,
        data,
        ..Default::default()
    }
}

/// Builds the MSR set written once at boot: only `misc-enable`'s
/// fast-string bit and the default PAT value are non-zero; everything
/// else KVM already defaults sanely and is left as-is.
pub fn create_boot_msr_entries() -> Result<Msrs> {
    let entries = vec![
        entry(MSR_IA32_MISC_ENABLE, MSR_IA32_MISC_ENABLE_FAST_STRING),
        entry(MSR_IA32_CR_PAT, MSR_IA32_CR_PAT_DEFAULT),
    ];
    Msrs::from_entries(&entries).map_err(|_| Error::Fam)
}

/// Builds an (empty-valued) MSR list used as a read template: the caller
/// fills each entry's `data` via `KVM_GET_MSRS` and reads the results back
/// in the same index order.
pub fn boot_msrs_template() -> Result<Msrs> {
    let entries: Vec<kvm_msr_entry> = BOOT_MSR_INDICES.iter().map(|&idx| entry(idx, 0)).collect();
    Msrs::from_entries(&entries).map_err(|_| Error::Fam)
}
