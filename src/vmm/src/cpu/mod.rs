// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Per-vCPU lifecycle: initial-boot register/table setup (spec.md §4.C),
//! and the run loop that dispatches hypervisor exits to the paravirtual
//! port protocol (spec.md §4.D).

use std::process;
use std::result;
use std::sync::Mutex;

use kvm_bindings::{kvm_fpu, kvm_regs, CpuId};
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap};

pub(crate) mod cpuid;
mod gdt;
use gdt::*;
mod interrupts;
use interrupts::*;
pub(crate) mod msr_index;
pub(crate) mod msrs;
pub(crate) mod state;

use crate::hypercall::{self, Outcome};
use crate::sync::Coordinator;

/// Initial stack for every vCPU; each core's own unikernel trampoline
/// relocates to a per-core stack before running guest code proper.
const BOOT_STACK_POINTER: u64 = 0x8ff0;

// Initial page tables for the boot trampoline (separate from the
// guest's own runtime page tables the scanner in `memory.rs` walks).
const PML4_START: u64 = 0x9000;
const PDPTE_START: u64 = 0xa000;
const PDE_START: u64 = 0xb000;

/// spec.md §4.C: "constructs a 4-level identity-mapped page hierarchy
/// with 2 MiB pages covering the first 512 MiB".
const IDENTITY_MAP_SIZE: u64 = 512 * 1024 * 1024;
const IDENTITY_MAP_ENTRIES: u64 = IDENTITY_MAP_SIZE / 0x20_0000;

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_PG: u64 = 0x8000_0000;
const X86_CR4_PAE: u64 = 0x20;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("guest memory error: {0}")]
    GuestMemory(GuestMemoryError),
    #[error("I/O error: {0}")]
    IO(std::io::Error),
    #[error("KVM ioctl failed: {0}")]
    KvmIoctl(kvm_ioctls::Error),
    #[error("unexpected count of MSRs written")]
    SetModelSpecificRegistersCount,
    #[error("failed to build boot MSR entries: {0}")]
    CreateMsr(msrs::Error),
    #[error("failed to save/restore vCPU state: {0}")]
    State(state::Error),
}

pub type Result<T> = result::Result<T, Error>;

pub struct Vcpu {
    pub index: u8,
    pub vcpu_fd: VcpuFd,
}

impl Vcpu {
    pub fn new(vm_fd: &VmFd, index: u8) -> Result<Self> {
        Ok(Vcpu {
            index,
            vcpu_fd: vm_fd.create_vcpu(index.into()).map_err(Error::KvmIoctl)?,
        })
    }

    pub fn configure_cpuid(&self, cpuid: &CpuId) -> Result<()> {
        self.vcpu_fd.set_cpuid2(cpuid).map_err(Error::KvmIoctl)
    }

    /// The host's measured TSC frequency in kHz, as KVM reports it for
    /// this vCPU (spec.md §3 "measured host CPU frequency"). Available
    /// before any other per-vCPU state is configured.
    pub fn tsc_khz(&self) -> Result<u32> {
        self.vcpu_fd.get_tsc_khz().map_err(Error::KvmIoctl)
    }

    pub fn configure_msrs(&self) -> Result<()> {
        let msrs = msrs::create_boot_msr_entries().map_err(Error::CreateMsr)?;
        let written = self.vcpu_fd.set_msrs(&msrs).map_err(Error::KvmIoctl)?;
        if written as u32 != msrs.as_fam_struct_ref().nmsrs {
            return Err(Error::SetModelSpecificRegistersCount);
        }
        Ok(())
    }

    pub fn configure_regs(&self, kernel_load: GuestAddress) -> Result<()> {
        let regs = kvm_regs {
            rflags: 0x0000_0000_0000_0002u64,
            rip: kernel_load.raw_value(),
            rsp: BOOT_STACK_POINTER,
            rbp: BOOT_STACK_POINTER,
            ..Default::default()
        };
        self.vcpu_fd.set_regs(&regs).map_err(Error::KvmIoctl)
    }

    pub fn configure_sregs(&self, guest_memory: &GuestMemoryMmap) -> Result<()> {
        let mut sregs = self.vcpu_fd.get_sregs().map_err(Error::KvmIoctl)?;

        let gdt_table: [u64; BOOT_GDT_MAX] = [
            gdt_entry(0, 0, 0),            // NULL
            gdt_entry(0xa09b, 0, 0xfffff), // 64-bit code
            gdt_entry(0xc093, 0, 0xfffff), // 64-bit data
            gdt_entry(0x808b, 0, 0xfffff), // TSS
        ];

        let code_seg = kvm_segment_from_gdt(gdt_table[1], 1);
        let data_seg = kvm_segment_from_gdt(gdt_table[2], 2);
        let tss_seg = kvm_segment_from_gdt(gdt_table[3], 3);

        write_gdt_table(&gdt_table[..], guest_memory).map_err(Error::GuestMemory)?;
        sregs.gdt.base = BOOT_GDT_OFFSET;
        sregs.gdt.limit = std::mem::size_of_val(&gdt_table) as u16 - 1;

        write_idt_value(0, guest_memory).map_err(Error::GuestMemory)?;
        sregs.idt.base = BOOT_IDT_OFFSET;
        sregs.idt.limit = std::mem::size_of::<u64>() as u16 - 1;

        sregs.cs = code_seg;
        sregs.ds = data_seg;
        sregs.es = data_seg;
        sregs.fs = data_seg;
        sregs.gs = data_seg;
        sregs.ss = data_seg;
        sregs.tr = tss_seg;

        sregs.cr0 |= X86_CR0_PE;
        sregs.efer |= msr_index::EFER_LME | msr_index::EFER_LMA;

        let boot_pml4_addr = GuestAddress(PML4_START);
        let boot_pdpte_addr = GuestAddress(PDPTE_START);
        let boot_pde_addr = GuestAddress(PDE_START);

        // VA [0..512 GiB) -> one PDPT.
        guest_memory
            .write_obj(boot_pdpte_addr.raw_value() | 0x03, boot_pml4_addr)
            .map_err(Error::GuestMemory)?;
        // VA [0..1 GiB) -> one page directory.
        guest_memory
            .write_obj(boot_pde_addr.raw_value() | 0x03, boot_pdpte_addr)
            .map_err(Error::GuestMemory)?;
        // `IDENTITY_MAP_ENTRIES` 2 MiB entries covering the first 512 MiB.
        for i in 0..IDENTITY_MAP_ENTRIES {
            guest_memory
                .write_obj((i << 21) + 0x83u64, boot_pde_addr.unchecked_add(i * 8))
                .map_err(Error::GuestMemory)?;
        }

        sregs.cr3 = boot_pml4_addr.raw_value();
        sregs.cr4 |= X86_CR4_PAE;
        sregs.cr0 |= X86_CR0_PG;

        self.vcpu_fd.set_sregs(&sregs).map_err(Error::KvmIoctl)
    }

    pub fn configure_fpu(&self) -> Result<()> {
        let fpu = kvm_fpu {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        };
        self.vcpu_fd.set_fpu(&fpu).map_err(Error::KvmIoctl)
    }

    /// LAPIC0 is set for external interrupts, LAPIC1 for NMI.
    pub fn configure_lapic(&self) -> Result<()> {
        let mut klapic = self.vcpu_fd.get_lapic().map_err(Error::KvmIoctl)?;

        let lvt_lint0 = get_klapic_reg(&klapic, APIC_LVT0);
        set_klapic_reg(
            &mut klapic,
            APIC_LVT0,
            set_apic_delivery_mode(lvt_lint0, APIC_MODE_EXTINT),
        );
        let lvt_lint1 = get_klapic_reg(&klapic, APIC_LVT1);
        set_klapic_reg(
            &mut klapic,
            APIC_LVT1,
            set_apic_delivery_mode(lvt_lint1, APIC_MODE_NMI),
        );

        self.vcpu_fd.set_lapic(&klapic).map_err(Error::KvmIoctl)
    }

    /// Records this vCPU's complete architectural state (spec.md §4.C
    /// "Save path").
    pub fn save_state(&self) -> Result<state::VcpuState> {
        state::save(&self.vcpu_fd).map_err(Error::State)
    }

    /// Restores a previously saved state (spec.md §4.C "Restore path").
    pub fn restore_state(&self, saved: &state::VcpuState, cpuid: &CpuId) -> Result<()> {
        state::restore(&self.vcpu_fd, saved, cpuid).map_err(Error::State)
    }

    /// `true` for the process' boot vCPU (index 0): only it may terminate
    /// the whole process on `HLT`/`EXIT` (spec.md §4.D).
    fn is_boot_core(&self) -> bool {
        self.index == 0
    }

    /// Runs this vCPU until it halts, exits, or is asked to stop for a
    /// checkpoint/migration round.
    ///
    /// `state_slot` is filled with this vCPU's saved state whenever the
    /// coordinator requests a stop; the caller (checkpoint/migration
    /// code) drains it between `wait_quiesce` and `wait_release`.
    pub fn run(
        &mut self,
        ctx: &hypercall::Context,
        coordinator: &Coordinator,
        state_slot: &Mutex<Option<state::VcpuState>>,
    ) {
        coordinator.wait_entry();
        log::info!("vCPU {} entering run loop", self.index);

        loop {
            match self.vcpu_fd.run() {
                Ok(VcpuExit::Hlt) => {
                    log::info!("vCPU {} halted", self.index);
                    if self.is_boot_core() {
                        process::exit(0);
                    }
                    return;
                }
                Ok(VcpuExit::Shutdown) => {
                    log::error!("guest shutdown (triple fault or unhandled exception)");
                    process::exit(1);
                }
                Ok(VcpuExit::IoOut(port, data)) => {
                    let value = decode_port_value(port, data);
                    match hypercall::dispatch(ctx, self.is_boot_core(), port, value) {
                        Ok(Outcome::Continue) => {}
                        Ok(Outcome::ThreadExit) => return,
                        Ok(Outcome::ProcessExit(code)) => process::exit(code),
                        Err(e) => {
                            log::error!("hypercall on port {:#x} failed: {}", port, e);
                            process::exit(1);
                        }
                    }
                }
                Ok(VcpuExit::IoIn(port, _)) => {
                    log::error!("unexpected read from port {:#x}", port);
                }
                Ok(VcpuExit::MmioRead(addr, _)) | Ok(VcpuExit::MmioWrite(addr, _)) => {
                    log::error!("unsupported MMIO access at {:#x}", addr);
                }
                Ok(other) => {
                    log::error!("unknown vm-exit reason: {:?}", other);
                    process::exit(1);
                }
                Err(e) if e.errno() == libc::EINTR => {
                    if coordinator.is_stop_requested() {
                        log::debug!("vCPU {} quiescing", self.index);
                        coordinator.wait_quiesce();
                        match self.save_state() {
                            Ok(saved) => *state_slot.lock().unwrap() = Some(saved),
                            Err(e) => {
                                log::error!("failed to save vCPU {} state: {}", self.index, e);
                                process::exit(1);
                            }
                        }
                        coordinator.wait_release();
                        log::debug!("vCPU {} released", self.index);
                    }
                }
                Err(e) => {
                    log::error!(
                        "vCPU {} register dump on fatal KVM error: {:x?}",
                        self.index,
                        self.vcpu_fd.get_regs()
                    );
                    log::error!("{}", e);
                    process::exit(1);
                }
            }
        }
    }
}

/// All recognized ports except `UART` carry a 4-byte little-endian
/// guest-physical pointer; `UART` carries the byte itself.
fn decode_port_value(port: u16, data: &[u8]) -> u32 {
    if port == hypercall::PORT_UART {
        return u32::from(data[0]);
    }
    let mut bytes = [0u8; 4];
    let len = data.len().min(4);
    bytes[..len].copy_from_slice(&data[..len]);
    u32::from_le_bytes(bytes)
}
