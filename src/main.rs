// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::io::Write as _;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;
use vmm::config::{CheckpointConfig, MigrationRole, NetConfig, VMMConfig};

/// Boots a unikernel image under KVM. Every flag below can also be set
/// through the environment variable named in its help text, so a guest's
/// launch configuration can live entirely in its environment (spec.md §6).
#[derive(Parser)]
#[clap(version = "0.1", author = "Polytech Montpellier - DevOps")]
struct Opts {
    /// Path to the unikernel image, or to a checkpoint directory to resume from
    #[clap(short, long)]
    kernel: PathBuf,

    /// Number of virtual CPUs assigned to the guest
    #[clap(short, long, env = "CPUS", default_value = "1")]
    cpus: u8,

    /// Guest memory size; accepts a K/M/G/T/P/E suffix
    #[clap(short, long, env = "MEM", default_value = "512M")]
    mem: String,

    /// Nonzero enables UART passthrough and progress logs
    #[clap(short, long, env = "VERBOSE", default_value = "0")]
    verbose: u8,

    /// Stdout console file path; unset keeps the host's own stdout
    #[clap(long)]
    console: Option<PathBuf>,

    /// Host TAP interface name; presence activates the guest NIC
    #[clap(long, env = "NETIF")]
    netif: Option<String>,

    /// Guest IPv4 address
    #[clap(long, env = "IP")]
    ip: Option<Ipv4Addr>,

    /// Guest default gateway
    #[clap(long, env = "GATEWAY")]
    gateway: Option<Ipv4Addr>,

    /// Guest subnet mask
    #[clap(long, env = "MASK")]
    mask: Option<Ipv4Addr>,

    /// Advise the kernel the guest memory region is KSM-mergeable
    #[clap(long, env = "MERGEABLE")]
    mergeable: bool,

    /// Back guest memory with transparent huge pages
    #[clap(long, env = "HUGEPAGE")]
    hugepage: bool,

    /// Seconds between automatic checkpoints; 0 disables
    #[clap(long, env = "CHECKPOINT", default_value = "0")]
    checkpoint: u64,

    /// Force every checkpoint (not just the first) to be a full dump
    #[clap(long, env = "FULLCHECKPOINT")]
    fullcheckpoint: bool,

    /// Directory checkpoint rounds are written to and restored from
    #[clap(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// Boot as the migration responder and wait on the migration port
    #[clap(long, env = "MIGRATION_SERVER")]
    migration_server: bool,

    /// Destination IPv4 for an outbound migration, triggered later by signal
    #[clap(long, env = "MIGRATION_SUPPORT")]
    migration_support: Option<Ipv4Addr>,

    /// Path to a plain-text file with `mode:`/`type:`/`use-odp:`/`prefetch:` lines
    #[clap(long, env = "MIGRATION_PARAMS")]
    migration_params: Option<PathBuf>,

    /// Proxy control port; accepted for compatibility but not otherwise used
    #[clap(long, env = "PORT")]
    port: Option<u16>,

    /// Arguments forwarded to the guest via the CMDSIZE/CMDVAL hypercalls
    #[clap(last = true)]
    guest_args: Vec<String>,
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .init();
}

fn build_config(opts: Opts) -> Result<VMMConfig, vmm::Error> {
    let memory = vmm::config::parse_mem_size(&opts.mem)?;

    if let Some(port) = opts.port {
        log::debug!("PORT={} accepted for compatibility but not used", port);
    }

    let net = match opts.netif {
        Some(tap_name) => {
            let mut net = NetConfig {
                tap_name,
                ..Default::default()
            };
            if let Some(ip) = opts.ip {
                net.ip = ip;
            }
            if let Some(gateway) = opts.gateway {
                net.gateway = gateway;
            }
            if let Some(mask) = opts.mask {
                net.mask = mask;
            }
            Some(net)
        }
        None => None,
    };

    let migration_role = if opts.migration_server {
        MigrationRole::Server
    } else if let Some(ip) = opts.migration_support {
        MigrationRole::Client(ip)
    } else {
        MigrationRole::None
    };

    let kernel_path = opts.kernel.to_string_lossy().into_owned();
    Ok(VMMConfig::builder(opts.cpus, memory, &kernel_path)
        .verbose(opts.verbose)
        .console(opts.console)
        .net(net)
        .mergeable(opts.mergeable)
        .hugepage(opts.hugepage)
        .checkpoint(CheckpointConfig {
            interval_secs: opts.checkpoint,
            full: opts.fullcheckpoint,
        })
        .checkpoint_dir(opts.checkpoint_dir)
        .migration_role(migration_role)
        .migration_params_path(opts.migration_params)
        .guest_args(opts.guest_args)
        .build())
}

fn main() {
    let opts = Opts::parse();
    init_logger(opts.verbose);

    let config = match build_config(opts) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = vmm::VMM::boot(config).and_then(vmm::VMM::run) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
