// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Paravirtual port protocol (spec.md §4.D, §6 "Paravirtual ports").
//!
//! The guest requests a host service by writing a 32-bit guest-physical
//! pointer out to one of the fixed ports below (`UART` is the one
//! exception: its "pointer" is the byte itself, there is no argument
//! struct). The hypervisor dereferences the corresponding argument
//! struct directly in guest memory; any field documented as a pointer
//! inside that struct is guest-*virtual* and is translated through
//! [`crate::memory::MemoryManager::virt_to_phys`] before the host reads
//! or writes through it.

pub mod args;

use std::ffi::CString;
use std::sync::Mutex;

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::devices::net::NetBackend;
use crate::devices::uart::UartSink;
use crate::memory::MemoryManager;

use args::*;

pub const PORT_WRITE: u16 = 0x400;
pub const PORT_OPEN: u16 = 0x440;
pub const PORT_CLOSE: u16 = 0x480;
pub const PORT_READ: u16 = 0x500;
pub const PORT_EXIT: u16 = 0x540;
pub const PORT_LSEEK: u16 = 0x580;
pub const PORT_NETINFO: u16 = 0x600;
pub const PORT_NETWRITE: u16 = 0x640;
pub const PORT_NETREAD: u16 = 0x680;
pub const PORT_NETSTAT: u16 = 0x700;
pub const PORT_FREELIST: u16 = 0x720;
pub const PORT_CMDSIZE: u16 = 0x740;
pub const PORT_CMDVAL: u16 = 0x780;
pub const PORT_UART: u16 = 0x800;

/// Host-real path the virtualization device itself is reachable at;
/// `OPEN` refuses this path regardless of the guest's requested flags
/// (spec.md §4.D: "refuses to open the virtualization device").
const KVM_DEVICE_PATH: &str = "/dev/kvm";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("hypercall argument pointer is not mapped in the guest: {0}")]
    NotMapped(#[from] crate::memory::Error),
    #[error("guest memory access failed: {0}")]
    GuestMemory(#[from] vm_memory::GuestMemoryError),
    #[error("guest-supplied path is not valid UTF-8/NUL-terminated")]
    InvalidPath,
    #[error("network backend error: {0}")]
    Net(#[from] crate::devices::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What the run loop should do once a hypercall has been serviced.
pub enum Outcome {
    Continue,
    /// `EXIT` on a secondary core: only this vCPU's thread ends.
    ThreadExit,
    /// `EXIT` on the boot core: the whole process ends with this code.
    ProcessExit(i32),
}

/// Shared, per-VM state the hypercall dispatcher needs: guest memory and
/// address translation, the paravirtual devices, and the argv the guest
/// asked for via `CMDSIZE`/`CMDVAL`.
pub struct Context {
    pub memory: MemoryManager,
    pub entry_point: u64,
    pub uart: Mutex<UartSink>,
    pub net: Option<Mutex<NetBackend>>,
    pub guest_args: Vec<String>,
}

impl Context {
    pub(crate) fn guest_memory(&self) -> &GuestMemoryMmap {
        self.memory.guest_memory()
    }

    /// Reads `len` bytes starting at guest-virtual address `va`, issuing
    /// one host read per physical page the range crosses (spec.md §4.D
    /// boundary behavior: "a buffer straddling a page boundary must
    /// issue at least two host syscalls").
    fn read_virt(&self, va: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut remaining = len as u64;
        let mut cursor = va;
        while remaining > 0 {
            let (phys, page_end) = self.memory.virt_to_phys(self.entry_point, cursor)?;
            let chunk_len = std::cmp::min(remaining, page_end - phys);
            let mut buf = vec![0u8; chunk_len as usize];
            self.guest_memory()
                .read_slice(&mut buf, GuestAddress(phys))?;
            out.extend_from_slice(&buf);
            cursor += chunk_len;
            remaining -= chunk_len;
        }
        Ok(out)
    }

    fn write_virt(&self, va: u64, data: &[u8]) -> Result<()> {
        let mut remaining = data.len() as u64;
        let mut cursor = va;
        let mut offset = 0usize;
        while remaining > 0 {
            let (phys, page_end) = self.memory.virt_to_phys(self.entry_point, cursor)?;
            let chunk_len = std::cmp::min(remaining, page_end - phys) as usize;
            self.guest_memory()
                .write_slice(&data[offset..offset + chunk_len], GuestAddress(phys))?;
            cursor += chunk_len as u64;
            offset += chunk_len;
            remaining -= chunk_len as u64;
        }
        Ok(())
    }

    /// Reads a NUL-terminated string at guest-virtual address `va`,
    /// bounded to avoid an unbounded scan on a hostile/corrupt guest.
    fn read_virt_cstr(&self, va: u64) -> Result<String> {
        const MAX_PATH: usize = 4096;
        let mut bytes = Vec::new();
        let mut cursor = va;
        while bytes.len() < MAX_PATH {
            let (phys, page_end) = self.memory.virt_to_phys(self.entry_point, cursor)?;
            let chunk_len = std::cmp::min(MAX_PATH as u64 - bytes.len() as u64, page_end - phys);
            let mut buf = vec![0u8; chunk_len as usize];
            self.guest_memory()
                .read_slice(&mut buf, GuestAddress(phys))?;
            if let Some(nul) = buf.iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&buf[..nul]);
                return String::from_utf8(bytes).map_err(|_| Error::InvalidPath);
            }
            bytes.extend_from_slice(&buf);
            cursor += chunk_len;
        }
        Err(Error::InvalidPath)
    }
}

fn read_arg<T: vm_memory::ByteValued>(ctx: &Context, guest_phys_ptr: u64) -> Result<T> {
    Ok(ctx
        .guest_memory()
        .read_obj(GuestAddress(guest_phys_ptr))?)
}

fn write_arg<T: vm_memory::ByteValued>(ctx: &Context, guest_phys_ptr: u64, value: T) -> Result<()> {
    Ok(ctx.guest_memory().write_obj(value, GuestAddress(guest_phys_ptr))?)
}

/// Performs a host read/write syscall capped at `len` bytes, mirroring
/// the way `libc` reports a short transfer: `Ok(n)` with `n <= len`.
fn host_write(fd: i32, buf: &[u8]) -> std::io::Result<usize> {
    let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn host_read(fd: i32, buf: &mut [u8]) -> std::io::Result<usize> {
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Services one hypercall. `guest_phys_ptr` is the value the guest wrote
/// out to `port` (already the raw physical offset, except for `UART`
/// where it is the byte itself).
pub fn dispatch(ctx: &Context, boot_core: bool, port: u16, guest_phys_ptr: u32) -> Result<Outcome> {
    if port == PORT_UART {
        ctx.uart.lock().unwrap().put(guest_phys_ptr as u8);
        return Ok(Outcome::Continue);
    }

    let ptr = guest_phys_ptr as u64;

    match port {
        PORT_WRITE => {
            let mut a: WriteReadArgs = read_arg(ctx, ptr)?;
            let data = ctx.read_virt(a.buf, a.len as usize)?;
            let n = host_write(a.fd, &data).unwrap_or(0);
            a.len = n as u64;
            write_arg(ctx, ptr, a)?;
        }
        PORT_READ => {
            let mut a: WriteReadArgs = read_arg(ctx, ptr)?;
            let mut buf = vec![0u8; a.len as usize];
            let n = host_read(a.fd, &mut buf).unwrap_or(0);
            ctx.write_virt(a.buf, &buf[..n])?;
            a.len = n as u64;
            write_arg(ctx, ptr, a)?;
        }
        PORT_OPEN => {
            let mut a: OpenArgs = read_arg(ctx, ptr)?;
            let path = ctx.read_virt_cstr(a.name)?;
            a.ret = if path == KVM_DEVICE_PATH {
                -1
            } else {
                match CString::new(path) {
                    Ok(cpath) => unsafe { libc::open(cpath.as_ptr(), a.flags, a.mode as libc::c_uint) },
                    Err(_) => -1,
                }
            };
            write_arg(ctx, ptr, a)?;
        }
        PORT_CLOSE => {
            let mut a: CloseArgs = read_arg(ctx, ptr)?;
            a.ret = if matches!(a.fd, 0 | 1 | 2) {
                0
            } else {
                unsafe { libc::close(a.fd) }
            };
            write_arg(ctx, ptr, a)?;
        }
        PORT_LSEEK => {
            let mut a: LseekArgs = read_arg(ctx, ptr)?;
            a.offset = unsafe { libc::lseek(a.fd, a.offset, a.whence) };
            write_arg(ctx, ptr, a)?;
        }
        PORT_EXIT => {
            let a: ExitArgs = read_arg(ctx, ptr)?;
            return Ok(if boot_core {
                Outcome::ProcessExit(a.arg)
            } else {
                Outcome::ThreadExit
            });
        }
        PORT_NETINFO => {
            if let Some(net) = &ctx.net {
                net.lock().unwrap().ensure_poll_thread();
            }
            let a = NetInfoArgs {
                mac: [0x52, 0x54, 0x00, 0x12, 0x34, 0x56],
                ..Default::default()
            };
            write_arg(ctx, ptr, a)?;
        }
        PORT_NETWRITE => {
            let mut a: NetWriteArgs = read_arg(ctx, ptr)?;
            let data = ctx.read_virt(a.data, a.len as usize)?;
            a.ret = match &ctx.net {
                Some(net) => net
                    .lock()
                    .unwrap()
                    .write_frame(&data)
                    .map(|n| n as i32)
                    .unwrap_or(-1),
                None => -1,
            };
            write_arg(ctx, ptr, a)?;
        }
        PORT_NETREAD => {
            let mut a: NetReadArgs = read_arg(ctx, ptr)?;
            let mut buf = vec![0u8; a.len as usize];
            a.ret = match &ctx.net {
                Some(net) => match net.lock().unwrap().read_frame(&mut buf) {
                    Ok(n) => {
                        ctx.write_virt(a.data, &buf[..n])?;
                        n as i32
                    }
                    Err(_) => -1,
                },
                None => -1,
            };
            write_arg(ctx, ptr, a)?;
        }
        PORT_NETSTAT => {
            let status = ctx.net.as_ref().map(|n| n.lock().unwrap().stat()).unwrap_or(false);
            write_arg(ctx, ptr, NetStatArgs { status: status as u8, ..Default::default() })?;
        }
        PORT_FREELIST => {
            // No balloon/ODP backend is modeled; the hint is accepted and
            // discarded (spec.md Non-goals: no general-purpose machine model).
            let _: FreelistArgs = read_arg(ctx, ptr)?;
        }
        PORT_CMDSIZE => {
            let argsz: i32 = ctx
                .guest_args
                .iter()
                .map(|a| a.len() as i32 + 1)
                .sum();
            let a = CmdsizeArgs {
                argc: ctx.guest_args.len() as i32,
                argsz,
                envc: 0,
                envsz: 0,
            };
            write_arg(ctx, ptr, a)?;
        }
        PORT_CMDVAL => {
            let a: CmdvalArgs = read_arg(ctx, ptr)?;
            let mut cursor = a.argv;
            for arg in &ctx.guest_args {
                let mut bytes = arg.as_bytes().to_vec();
                bytes.push(0);
                ctx.write_virt(cursor, &bytes)?;
                cursor += bytes.len() as u64;
            }
        }
        _ => {}
    }
    Ok(Outcome::Continue)
}
