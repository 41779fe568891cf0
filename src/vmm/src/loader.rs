// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Boot image loader (spec.md §4.B).
//!
//! The guest image is a 64-bit ELF carrying a sentinel `e_ident[EI_OSABI]`
//! byte that marks it as a unikernel built for this hypervisor, not a
//! general-purpose Linux kernel. We check that signature ourselves (ELF
//! parsing proper is explicitly out of scope: only the `LOAD`-segment
//! interface matters) and then hand the actual segment-copy work to
//! `linux-loader`'s generic ELF loader, which only walks program headers
//! and has no Linux-specific behavior of its own.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::net::Ipv4Addr;
use std::path::Path;

use linux_loader::loader::{elf::Elf, KernelLoader, KernelLoaderResult};
use vm_memory::{Address, GuestAddress, GuestMemoryMmap};

use crate::boot_params::BootParams;
use crate::config::NetConfig;

const EI_NIDENT: usize = 16;
const ELFMAG: [u8; 4] = *b"\x7fELF";
const ELFCLASS64: u8 = 2;
/// Sentinel OS/ABI byte identifying a unikernel image built for this
/// hypervisor rather than a general-purpose Linux kernel.
const ELFOSABI_UNIKERNEL: u8 = 0xFF;
const EM_X86_64: u16 = 62;
const ET_EXEC: u16 = 2;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read image header: {0}")]
    Io(std::io::Error),
    #[error("image does not carry the expected unikernel signature")]
    InvalidImage,
    #[error("image header tables are implausibly large")]
    OutOfMemory,
    #[error("failed to load ELF segments: {0:?}")]
    KernelLoad(linux_loader::loader::Error),
    #[error("guest memory error: {0}")]
    Memory(vm_memory::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Host-measured boot frequency and addressing details the loader needs
/// to populate [`BootParams`] but that are not intrinsic to the image
/// itself.
pub struct BootConfig {
    pub memory_limit: u64,
    pub num_cpus: u32,
    pub cpu_freq_khz: u32,
    pub uart_port: u16,
    pub net: Option<NetConfig>,
    pub host_base: u64,
}

/// Result of loading the guest image: where execution starts and where
/// the first `LOAD` segment begins (boot parameters live relative to the
/// latter).
pub struct LoadedImage {
    pub entry_point: GuestAddress,
    pub first_segment_start: GuestAddress,
}

fn check_signature(kernel_path: &Path) -> Result<()> {
    let mut file = File::open(kernel_path).map_err(Error::Io)?;
    let mut ident = [0u8; EI_NIDENT];
    file.read_exact(&mut ident).map_err(Error::Io)?;

    if ident[0..4] != ELFMAG {
        return Err(Error::InvalidImage);
    }
    if ident[4] != ELFCLASS64 {
        return Err(Error::InvalidImage);
    }
    if ident[7] != ELFOSABI_UNIKERNEL {
        return Err(Error::InvalidImage);
    }

    // e_type (u16) then e_machine (u16) follow immediately after e_ident.
    let mut rest = [0u8; 4];
    file.read_exact(&mut rest).map_err(Error::Io)?;
    let e_type = u16::from_le_bytes([rest[0], rest[1]]);
    let e_machine = u16::from_le_bytes([rest[2], rest[3]]);

    if e_type != ET_EXEC {
        return Err(Error::InvalidImage);
    }
    if e_machine != EM_X86_64 {
        return Err(Error::InvalidImage);
    }

    // Sanity bound on the program header count so a corrupt/hostile image
    // can't make us walk an unbounded table; a real unikernel image has a
    // handful of LOAD segments. e_phnum sits at byte offset 56 in the
    // ELF64 header.
    file.seek(SeekFrom::Start(56)).map_err(Error::Io)?;
    let mut phnum_bytes = [0u8; 2];
    file.read_exact(&mut phnum_bytes).map_err(Error::Io)?;
    let phnum = u16::from_le_bytes(phnum_bytes);
    if phnum > 256 {
        return Err(Error::OutOfMemory);
    }

    Ok(())
}

/// Loads `kernel_path`'s `LOAD` segments into `guest_memory`, then writes
/// the boot-parameter block into the first one.
pub fn load_image(
    guest_memory: &GuestMemoryMmap,
    kernel_path: &Path,
    boot_cfg: &BootConfig,
) -> Result<LoadedImage> {
    check_signature(kernel_path)?;

    let mut kernel_image = File::open(kernel_path).map_err(Error::Io)?;
    let KernelLoaderResult {
        kernel_load,
        kernel_end: _,
        ..
    } = Elf::load(guest_memory, None, &mut kernel_image, None).map_err(Error::KernelLoad)?;

    // The first LOAD segment always begins at the lowest mapped guest
    // address the loader produced, which `Elf::load` reports as
    // `kernel_load` when no explicit highmem offset is given.
    let first_segment_start = kernel_load;

    let (ip, gateway, mask) = boot_cfg
        .net
        .as_ref()
        .map(|n| (n.ip, n.gateway, n.mask))
        .unwrap_or((
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
        ));

    let params = BootParams {
        magic: crate::boot_params::BOOT_PARAMS_MAGIC,
        version: 1,
        base: 0,
        limit: boot_cfg.memory_limit,
        cpu_freq_khz: boot_cfg.cpu_freq_khz,
        num_cpus: boot_cfg.num_cpus,
        cpu_id: 0,
        uhyve: 1,
        uart_port: boot_cfg.uart_port,
        ip: ip.octets(),
        gateway: gateway.octets(),
        mask: mask.octets(),
        host_base: boot_cfg.host_base,
        cpu_online_gate: 0,
        current_boot_id: 0,
        ..Default::default()
    };
    params
        .write(guest_memory, first_segment_start)
        .map_err(Error::Memory)?;

    Ok(LoadedImage {
        entry_point: kernel_load,
        first_segment_start,
    })
}
