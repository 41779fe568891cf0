// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

#![cfg(target_arch = "x86_64")]

extern crate libc;

extern crate linux_loader;
extern crate vm_memory;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kvm_bindings::{CpuId, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Kvm, VmFd};

pub mod boot_params;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod cpu;
pub mod devices;
pub mod hypercall;
mod loader;
pub mod memory;
pub mod migration;
pub mod pagetable;
pub mod sync;

use config::{MigrationParams, MigrationRole, VMMConfig};
use cpu::Vcpu;
use devices::net::NetBackend;
use devices::uart::UartSink;
use hypercall::Context as HypercallContext;
use memory::MemoryManager;
use sync::Coordinator;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("KVM ioctl failed: {0}")]
    KvmIoctl(kvm_ioctls::Error),
    #[error("vCPU error: {0}")]
    Vcpu(#[from] cpu::Error),
    #[error("memory error: {0}")]
    Memory(#[from] memory::Error),
    #[error("failed to load the guest image: {0}")]
    Loader(#[from] loader::Error),
    #[error("device error: {0}")]
    Device(#[from] devices::Error),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::Error),
    #[error("migration error: {0}")]
    Migration(#[from] migration::Error),
    #[error("clock error: {0}")]
    Clock(#[from] clock::Error),
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
    #[error("vCPU coordination error: {0}")]
    Sync(#[from] sync::Error),
    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Real-time signal on which the migration handler thread waits before
/// initiating an outbound migration (spec.md §4.H "await a trigger").
/// Distinct from [`sync::stop_signal`], which only interrupts `KVM_RUN`.
fn migration_trigger_signal() -> libc::c_int {
    sync::stop_signal() + 1
}

static MIGRATION_TRIGGERED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_migration_trigger(_: libc::c_int) {
    MIGRATION_TRIGGERED.store(true, Ordering::SeqCst);
}

/// A complete, running guest: its vCPU threads, the shared hypercall
/// servicing state, and (if configured) the checkpoint/migration
/// orchestrator thread that quiesces those vCPUs on demand.
pub struct VMM {
    kvm: Kvm,
    vm_fd: Arc<VmFd>,
    vcpus: Vec<Vcpu>,
    cpuid: CpuId,
    ctx: Arc<HypercallContext>,
    coordinator: Arc<Coordinator>,
    state_slots: Arc<Vec<Mutex<Option<cpu::state::VcpuState>>>>,
    entry_point: u64,
    config: VMMConfig,
}

impl VMM {
    /// Boots fresh from a guest image, replays a checkpoint chain (when
    /// `kernel_path` names a checkpoint directory rather than an ELF
    /// image), or (when `MIGRATION_SERVER` is set) waits for an inbound
    /// migration instead (spec.md §4.H "Responder side", acceptance
    /// scenario 4 "Restore").
    pub fn boot(config: VMMConfig) -> Result<Self> {
        if config.kernel_path.join("chk_config.txt").is_file() {
            return Self::boot_from_checkpoint(config);
        }
        match &config.migration_role {
            MigrationRole::Server => Self::boot_from_migration(config),
            _ => Self::boot_fresh(config),
        }
    }

    fn open_vm(num_vcpus: u8) -> Result<(Kvm, VmFd)> {
        let kvm = Kvm::new().map_err(Error::KvmIoctl)?;
        let vm_fd = kvm.create_vm().map_err(Error::KvmIoctl)?;
        vm_fd.create_irq_chip().map_err(Error::KvmIoctl)?;
        let _ = num_vcpus;
        Ok((kvm, vm_fd))
    }

    fn configured_cpuid(kvm: &Kvm, num_cpus: u8) -> Result<CpuId> {
        let mut cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(Error::KvmIoctl)?;
        cpu::cpuid::filter_cpuid(&mut cpuid, num_cpus, false);
        Ok(cpuid)
    }

    fn build_devices(
        vm_fd: &VmFd,
        config: &VMMConfig,
    ) -> Result<(UartSink, Option<Mutex<NetBackend>>)> {
        let uart = UartSink::new(config.verbose > 0);
        let net = match &config.net {
            Some(net_cfg) => Some(Mutex::new(NetBackend::new(vm_fd, &net_cfg.tap_name)?)),
            None => None,
        };
        Ok((uart, net))
    }

    fn needs_orchestrator(config: &VMMConfig) -> bool {
        config.checkpoint.interval_secs > 0 || matches!(config.migration_role, MigrationRole::Client(_))
    }

    fn barrier_participants(config: &VMMConfig) -> usize {
        config.cpus as usize + if Self::needs_orchestrator(config) { 1 } else { 0 }
    }

    /// Normal boot path: loads the unikernel image and configures every
    /// vCPU's initial architectural state from scratch (spec.md §4.B,
    /// §4.C).
    fn boot_fresh(config: VMMConfig) -> Result<Self> {
        log::info!(
            "booting {} with {} vCPU(s) and {} bytes of memory",
            config.kernel_path.display(),
            config.cpus,
            config.memory
        );
        redirect_console(&config.console)?;
        let (kvm, vm_fd) = Self::open_vm(config.cpus)?;
        let memory = MemoryManager::new(&vm_fd, config.memory, config.mergeable, config.hugepage)?;

        // The boot vCPU has to exist before we can ask KVM for the host's
        // measured TSC frequency, so it is created ahead of the image
        // load and the rest of the vCPUs.
        let boot_vcpu = Vcpu::new(&vm_fd, 0)?;
        let cpu_freq_khz = boot_vcpu.tsc_khz().unwrap_or_else(|e| {
            log::warn!("failed to read host TSC frequency, reporting 0 to the guest: {}", e);
            0
        });

        let boot_cfg = loader::BootConfig {
            memory_limit: config.memory,
            num_cpus: config.cpus as u32,
            cpu_freq_khz,
            uart_port: hypercall::PORT_UART,
            net: config.net.clone(),
            host_base: memory.chunks().first().map(|c| c.host_ptr as u64).unwrap_or(0),
        };
        let loaded = loader::load_image(memory.guest_memory(), &config.kernel_path, &boot_cfg)?;
        log::debug!("guest entry point at {:#x}", loaded.entry_point.raw_value());

        let cpuid = Self::configured_cpuid(&kvm, config.cpus)?;
        let mut vcpus = Vec::with_capacity(config.cpus as usize);
        vcpus.push(boot_vcpu);
        for index in 1..config.cpus {
            vcpus.push(Vcpu::new(&vm_fd, index)?);
        }
        for vcpu in &vcpus {
            vcpu.configure_cpuid(&cpuid)?;
            vcpu.configure_msrs()?;
            vcpu.configure_regs(loaded.entry_point)?;
            vcpu.configure_sregs(memory.guest_memory())?;
            vcpu.configure_fpu()?;
            vcpu.configure_lapic()?;
        }

        let (uart, net) = Self::build_devices(&vm_fd, &config)?;
        let entry_point = loaded.entry_point.raw_value();
        let ctx = Arc::new(HypercallContext {
            memory,
            entry_point,
            uart: Mutex::new(uart),
            net,
            guest_args: config.guest_args.clone(),
        });

        let participants = Self::barrier_participants(&config);
        let coordinator = Arc::new(Coordinator::new(participants));
        let state_slots = Arc::new((0..config.cpus).map(|_| Mutex::new(None)).collect());

        Ok(VMM {
            kvm,
            vm_fd: Arc::new(vm_fd),
            vcpus,
            cpuid,
            ctx,
            coordinator,
            state_slots,
            entry_point,
            config,
        })
    }

    /// Responder boot path: listens on the migration port, receives
    /// guest memory and vCPU state, and programs every vCPU from that
    /// restored state instead of a fresh boot (spec.md §4.H "Responder
    /// side").
    fn boot_from_migration(config: VMMConfig) -> Result<Self> {
        redirect_console(&config.console)?;
        log::info!(
            "listening for incoming migration on port {} ({} vCPU(s), {} bytes of memory)",
            MIGRATION_PORT,
            config.cpus,
            config.memory
        );
        let (kvm, vm_fd) = Self::open_vm(config.cpus)?;
        let memory = MemoryManager::new(&vm_fd, config.memory, config.mergeable, config.hugepage)?;

        // `entry_point` is unknown until the sender's metadata arrives, so
        // only `ncores`/`guest_size` (already fixed by our own config) are
        // checked against what the sender claims.
        let expected = migration::Metadata {
            ncores: config.cpus,
            guest_size: config.memory,
            checkpoint_number: 0,
            entry_point: 0,
            full_flag: true,
        };
        let port = MIGRATION_PORT;
        let (got, states, clock_snapshot) = migration::respond(port, expected, memory.guest_memory())?;
        log::info!("received {} vCPU state(s) and clock from migration sender", states.len());

        let cpuid = Self::configured_cpuid(&kvm, config.cpus)?;
        let mut vcpus = Vec::with_capacity(config.cpus as usize);
        for (index, state) in states.iter().enumerate() {
            let vcpu = Vcpu::new(&vm_fd, index as u8)?;
            vcpu.restore_state(state, &cpuid)?;
            vcpus.push(vcpu);
        }
        clock::restore(&vm_fd, &clock_snapshot.into())?;

        let entry_point = got.entry_point;
        log::debug!("restored guest entry point at {:#x}", entry_point);

        let (uart, net) = Self::build_devices(&vm_fd, &config)?;
        let ctx = Arc::new(HypercallContext {
            memory,
            entry_point,
            uart: Mutex::new(uart),
            net,
            guest_args: config.guest_args.clone(),
        });

        let participants = Self::barrier_participants(&config);
        let coordinator = Arc::new(Coordinator::new(participants));
        let state_slots = Arc::new((0..config.cpus).map(|_| Mutex::new(None)).collect());

        Ok(VMM {
            kvm,
            vm_fd: Arc::new(vm_fd),
            vcpus,
            cpuid,
            ctx,
            coordinator,
            state_slots,
            entry_point,
            config,
        })
    }

    /// Restore path: replays the checkpoint chain found at `kernel_path`
    /// instead of loading a guest image, then resumes the vCPUs from the
    /// states the chain replayed (spec.md §4.F "restore", acceptance
    /// scenario 4 "Restore").
    fn boot_from_checkpoint(config: VMMConfig) -> Result<Self> {
        redirect_console(&config.console)?;
        let dir = config.kernel_path.clone();
        log::info!("restoring from checkpoint directory {}", dir.display());

        let (kvm, vm_fd) = Self::open_vm(config.cpus)?;
        let memory = MemoryManager::new(&vm_fd, config.memory, config.mergeable, config.hugepage)?;

        let (manifest, states, clock_data) = checkpoint::CheckpointStore::restore(&dir, memory.guest_memory())?;
        log::info!(
            "replayed checkpoint {} ({} vCPU(s), full={})",
            manifest.checkpoint_number,
            manifest.cores,
            manifest.full
        );

        let cpuid = Self::configured_cpuid(&kvm, config.cpus)?;
        let mut vcpus = Vec::with_capacity(states.len());
        for (index, state) in states.iter().enumerate() {
            let vcpu = Vcpu::new(&vm_fd, index as u8)?;
            vcpu.restore_state(state, &cpuid)?;
            vcpus.push(vcpu);
        }
        clock::restore(&vm_fd, &clock_data)?;

        let entry_point = manifest.entry_point;
        log::debug!("restored guest entry point at {:#x}", entry_point);

        let (uart, net) = Self::build_devices(&vm_fd, &config)?;
        let ctx = Arc::new(HypercallContext {
            memory,
            entry_point,
            uart: Mutex::new(uart),
            net,
            guest_args: config.guest_args.clone(),
        });

        let participants = Self::barrier_participants(&config);
        let coordinator = Arc::new(Coordinator::new(participants));
        let state_slots = Arc::new((0..config.cpus).map(|_| Mutex::new(None)).collect());

        Ok(VMM {
            kvm,
            vm_fd: Arc::new(vm_fd),
            vcpus,
            cpuid,
            ctx,
            coordinator,
            state_slots,
            entry_point,
            config,
        })
    }

    /// Spawns every vCPU thread, then either joins them directly or (if
    /// checkpoint/migration is configured) becomes the orchestrator
    /// itself (spec.md §5: "The main thread additionally services
    /// asynchronous events"). vCPU threads that hit `HLT`/`EXIT` on the
    /// boot core terminate the whole process directly (see
    /// [`cpu::Vcpu::run`]); this only returns once every thread has
    /// wound down some other way.
    pub fn run(mut self) -> Result<()> {
        if matches!(self.config.migration_role, MigrationRole::Client(_)) {
            sync::install_stop_signal_handler()?;
            vmm_sys_util::signal::register_signal_handler(
                migration_trigger_signal(),
                handle_migration_trigger,
            )
            .map_err(sync::Error::RegisterHandler)?;
        } else {
            sync::install_stop_signal_handler()?;
        }

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.vcpus.len());
        for mut vcpu in std::mem::take(&mut self.vcpus) {
            let ctx = self.ctx.clone();
            let coordinator = self.coordinator.clone();
            let state_slots = self.state_slots.clone();
            handles.push(thread::spawn(move || {
                let slot = &state_slots[vcpu.index as usize];
                vcpu.run(&ctx, &coordinator, slot);
            }));
        }

        if Self::needs_orchestrator(&self.config) {
            // Runs in this (the caller's) thread so it can hold real
            // references into `handles` — a spawned thread would need to
            // own them, but `run()` also needs them afterwards to join.
            self.orchestrate(&handles)?;
        }

        for handle in handles {
            let _ = handle.join();
        }

        Ok(())
    }

    /// The checkpoint-timer / migration-trigger loop spec.md §5 assigns
    /// to the main thread. Crosses the entry barrier as this VM's
    /// non-vCPU participant, then ticks forever: a configured VM only
    /// leaves this loop by `process::exit` (migration success/failure)
    /// or because a vCPU thread exited the process first.
    fn orchestrate(&self, vcpu_handles: &[JoinHandle<()>]) -> Result<()> {
        let checkpoint_interval = self.config.checkpoint.interval_secs;
        let checkpoint_full = self.config.checkpoint.full;
        let migration_params = read_migration_params(&self.config.migration_params_path)?;

        let mut store = if checkpoint_interval > 0 {
            Some(checkpoint::CheckpointStore::new(
                self.config.checkpoint_dir.clone(),
                checkpoint_full,
            )?)
        } else {
            None
        };
        let mut last_checkpoint = Instant::now();

        self.coordinator.wait_entry();

        loop {
            if let Some(store) = store.as_mut() {
                if last_checkpoint.elapsed() >= Duration::from_secs(checkpoint_interval) {
                    if let Err(e) = run_checkpoint_round(
                        &self.coordinator,
                        vcpu_handles,
                        &self.state_slots,
                        &self.ctx,
                        &self.vm_fd,
                        self.entry_point,
                        self.config.memory,
                        store,
                    ) {
                        log::error!("checkpoint round failed: {}", e);
                    } else {
                        log::info!("checkpoint round {} written", store.next_number() - 1);
                    }
                    last_checkpoint = Instant::now();
                }
            }

            if let MigrationRole::Client(ip) = &self.config.migration_role {
                if MIGRATION_TRIGGERED.swap(false, Ordering::SeqCst) {
                    log::info!("migration triggered, connecting to {}", ip);
                    let metadata = migration::Metadata {
                        ncores: self.config.cpus,
                        guest_size: self.config.memory,
                        checkpoint_number: 0,
                        entry_point: self.entry_point,
                        full_flag: !migration_params.live,
                    };
                    let result = migration::initiate(
                        &ip.to_string(),
                        MIGRATION_PORT,
                        migration_params,
                        metadata,
                        self.ctx.guest_memory(),
                        &self.vm_fd,
                        &self.coordinator,
                        vcpu_handles,
                        &self.state_slots,
                    );
                    match result {
                        Ok(()) => {
                            log::info!("migration to {} completed", ip);
                            std::process::exit(0)
                        }
                        Err(e) => {
                            log::error!("migration failed: {}", e);
                            std::process::exit(1);
                        }
                    }
                }
            }

            thread::sleep(Duration::from_millis(200));
        }
    }
}

/// Fixed migration TCP port (spec.md §6 "Migration port": "fixed TCP
/// port"). `PORT` only overrides the unrelated proxy control port.
const MIGRATION_PORT: u16 = 9000;

/// Redirects the host process' stdout (fd 1) to `path`, if given, so
/// `WRITE` hypercalls against guest fd 1 land in a file instead of the
/// terminal (spec.md §6 "`--console`": "Stdout console file path").
/// Opened before any vCPU thread starts so every `WRITE` hypercall sees
/// the same fd.
fn redirect_console(path: &Option<PathBuf>) -> Result<()> {
    let Some(path) = path else { return Ok(()) };
    use std::os::unix::io::AsRawFd;

    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(Error::Io)?;
    if unsafe { libc::dup2(file.as_raw_fd(), libc::STDOUT_FILENO) } < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    // The dup'd fd now owns fd 1; `file` itself can close on drop.
    Ok(())
}

fn read_migration_params(path: &Option<PathBuf>) -> Result<MigrationParams> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).map_err(Error::Io)?;
            config::MigrationParams::from_str(&text).map_err(Error::Config)
        }
        None => Ok(MigrationParams::default()),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_checkpoint_round(
    coordinator: &Coordinator,
    handles: &[JoinHandle<()>],
    state_slots: &[Mutex<Option<cpu::state::VcpuState>>],
    ctx: &HypercallContext,
    vm_fd: &VmFd,
    entry_point: u64,
    memory_size: u64,
    store: &mut checkpoint::CheckpointStore,
) -> Result<()> {
    coordinator.quiesce_vcpus(handles)?;

    let states: Vec<cpu::state::VcpuState> = state_slots
        .iter()
        .map(|slot| slot.lock().unwrap().clone().expect("vCPU state missing after quiescence"))
        .collect();
    let clock_data = clock::save(vm_fd)?;

    store.create(&states, ctx.guest_memory(), entry_point, memory_size, clock_data, None)?;

    coordinator.clear_stop();
    Ok(())
}
