// SPDX-License-Identifier: Apache-2.0

use std::convert::TryFrom;
use std::net::Ipv4Addr;
use std::path::PathBuf;

mod builder;
pub use builder::VMMConfigBuilder;

/// Maximum length (excluding the NUL terminator) of a host TAP interface
/// name, matching `IFNAMSIZ` from `<linux/if.h>`.
pub(crate) const IFACE_NAME_MAX_LEN: usize = 15;

/// Default guest memory size when `MEM` is unset (spec.md §6).
pub const DEFAULT_MEM_SIZE: u64 = 512 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kernel image path does not exist: {0}")]
    KernelConfig(String),

    #[error("invalid memory size suffix in {0:?}, expected one of K/M/G/T/P/E")]
    InvalidMemSize(String),

    #[error("NETIF was set but no interface name was given")]
    TapError,

    #[error("invalid IPv4 address {0:?}: {1}")]
    InvalidIpv4(String, std::net::AddrParseError),

    #[error("MIGRATION_PARAMS file could not be parsed: {0}")]
    InvalidMigrationParams(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Parses a `MEM`-style size string: a decimal number optionally suffixed
/// with `K`/`M`/`G`/`T`/`P`/`E`, each shifting by a further 10 bits
/// (spec.md §6).
pub fn parse_mem_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, shift) = match value.chars().last() {
        Some('K') | Some('k') => (&value[..value.len() - 1], 10),
        Some('M') | Some('m') => (&value[..value.len() - 1], 20),
        Some('G') | Some('g') => (&value[..value.len() - 1], 30),
        Some('T') | Some('t') => (&value[..value.len() - 1], 40),
        Some('P') | Some('p') => (&value[..value.len() - 1], 50),
        Some('E') | Some('e') => (&value[..value.len() - 1], 60),
        _ => (value, 0),
    };

    digits
        .parse::<u64>()
        .map(|n| n << shift)
        .map_err(|_| Error::InvalidMemSize(value.to_string()))
}

/// Network configuration for the guest's single paravirtual NIC.
#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
    /// Host TAP interface name (`NETIF`).
    pub tap_name: String,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            tap_name: String::new(),
            ip: Ipv4Addr::new(10, 0, 5, 2),
            gateway: Ipv4Addr::new(10, 0, 5, 1),
            mask: Ipv4Addr::new(255, 255, 255, 0),
        }
    }
}

/// Periodic checkpoint configuration (`CHECKPOINT` / `FULLCHECKPOINT`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointConfig {
    /// Interval in seconds between automatic checkpoints; 0 disables.
    pub interval_secs: u64,
    /// Force every checkpoint (not just the first) to be a full dump.
    pub full: bool,
}

/// Which side of a live/cold migration this process plays, if any.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationRole {
    None,
    /// `MIGRATION_SERVER=1`: boot as the incoming (responder) side.
    Server,
    /// `MIGRATION_SUPPORT=<ip>`: boot normally, migrate out to `<ip>` when
    /// triggered.
    Client(Ipv4Addr),
}

impl Default for MigrationRole {
    fn default() -> Self {
        MigrationRole::None
    }
}

/// Parameters read from a `MIGRATION_PARAMS` file: `mode:`, `type:`,
/// `use-odp:`, `prefetch:` lines (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MigrationParams {
    pub live: bool,
    pub use_odp: bool,
    pub prefetch: bool,
}

impl Default for MigrationParams {
    fn default() -> Self {
        MigrationParams {
            live: true,
            use_odp: false,
            prefetch: false,
        }
    }
}

impl MigrationParams {
    /// Parses the plain-text `mode:`/`type:`/`use-odp:`/`prefetch:` format
    /// named by `MIGRATION_PARAMS`.
    pub fn from_str(text: &str) -> Result<Self> {
        let mut params = MigrationParams::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::InvalidMigrationParams(line.to_string()))?;
            let value = value.trim();
            match key.trim() {
                "type" => params.live = value.eq_ignore_ascii_case("live"),
                "mode" => params.live = value.eq_ignore_ascii_case("live"),
                "use-odp" => params.use_odp = parse_bool_flag(value),
                "prefetch" => params.prefetch = parse_bool_flag(value),
                other => return Err(Error::InvalidMigrationParams(other.to_string())),
            }
        }
        Ok(params)
    }
}

fn parse_bool_flag(value: &str) -> bool {
    !matches!(value, "0" | "false" | "no" | "")
}

/// VMM configuration: one value assembled once at startup from CLI flags
/// and the environment variables in spec.md §6, then handed to
/// [`crate::VMM::configure`].
#[derive(Debug, Default)]
pub struct VMMConfig {
    /// Path to the unikernel image.
    pub kernel_path: PathBuf,

    /// Number of virtual CPUs assigned to the guest (`CPUS`).
    pub cpus: u8,

    /// Guest memory size in bytes (`MEM`).
    pub memory: u64,

    /// Verbosity level; 0 disables UART passthrough (`VERBOSE`).
    pub verbose: u8,

    /// Stdout console file path; `None` keeps the host's stdout.
    pub console: Option<PathBuf>,

    /// Network configuration, present only if `NETIF` was set.
    pub net: Option<NetConfig>,

    /// `MERGEABLE`: advise the kernel the guest memory region is KSM-mergeable.
    pub mergeable: bool,

    /// `HUGEPAGE`: back guest memory with transparent huge pages.
    pub hugepage: bool,

    pub checkpoint: CheckpointConfig,

    /// Directory checkpoint rounds are written to and restored from.
    pub checkpoint_dir: PathBuf,

    pub migration_role: MigrationRole,
    pub migration_params_path: Option<PathBuf>,

    /// argv forwarded to the guest via the `CMDSIZE`/`CMDVAL` hypercalls.
    pub guest_args: Vec<String>,
}

impl VMMConfig {
    pub fn builder(num_vcpus: u8, mem_size: u64, kernel_path: &str) -> VMMConfigBuilder {
        VMMConfigBuilder::new(num_vcpus, mem_size, kernel_path)
    }
}

impl TryFrom<&str> for NetConfig {
    type Error = Error;

    fn try_from(tap_name: &str) -> Result<Self> {
        if tap_name.is_empty() {
            return Err(Error::TapError);
        }
        if tap_name.len() > IFACE_NAME_MAX_LEN {
            return Err(Error::InvalidMemSize(tap_name.to_string()));
        }
        Ok(NetConfig {
            tap_name: tap_name.to_string(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_size() {
        assert_eq!(parse_mem_size("512").unwrap(), 512);
    }

    #[test]
    fn parses_suffixed_sizes() {
        assert_eq!(parse_mem_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_mem_size("4G").unwrap(), 4u64 * 1024 * 1024 * 1024);
        assert_eq!(parse_mem_size("1K").unwrap(), 1024);
    }

    #[test]
    fn rejects_garbage_size() {
        assert!(parse_mem_size("banana").is_err());
    }

    #[test]
    fn net_config_requires_nonempty_name() {
        assert!(NetConfig::try_from("").is_err());
        assert!(matches!(NetConfig::try_from(""), Err(Error::TapError)));
    }

    #[test]
    fn net_config_accepts_valid_name() {
        let cfg = NetConfig::try_from("tap0").unwrap();
        assert_eq!(cfg.tap_name, "tap0");
    }

    #[test]
    fn migration_params_defaults_to_live() {
        let params = MigrationParams::from_str("type: live\nuse-odp: 0\n").unwrap();
        assert!(params.live);
        assert!(!params.use_odp);
    }

    #[test]
    fn migration_params_rejects_unknown_key() {
        assert!(MigrationParams::from_str("bogus: 1").is_err());
    }
}
