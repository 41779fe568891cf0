// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Paravirtual network backend.
//!
//! Unlike a virtio-net device, there is no MMIO bus or queue negotiation
//! here: the guest pushes/pulls whole frames through the `NETWRITE` /
//! `NETREAD` hypercalls (see [`crate::hypercall`]), and this module only
//! owns the host-side TAP file descriptor those hypercalls read from and
//! write to. `NETINFO` additionally starts a background poll thread that
//! watches the TAP fd for incoming frames and raises the guest's network
//! IRQ via an eventfd-backed irqfd registered with KVM.

use std::io::{Error as IoError, Read, Result as IoResult, Write};
use std::os::raw::{c_char, c_int, c_uint, c_ulong};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use kvm_ioctls::VmFd;
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

use crate::devices::bindings::{ifreq, IFNAMSIZ, TUN_F_CSUM, TUN_F_TSO4, TUN_F_TSO6, TUN_F_UFO};
use crate::devices::{Error, Result};

const TAP_FILE: *const c_char = b"/dev/net/tun\0".as_ptr() as *const c_char;

const IFF_TAP: c_uint = 0x0002;
const IFF_NO_PI: c_uint = 0x1000;
const IFF_VNET_HDR: c_uint = 0x4000;

const TUNTAP: c_uint = 84; // ascii 'T', see <linux/if_tun.h>
ioctl_iow_nr!(TUNSETIFF, TUNTAP, 202, c_int);
ioctl_iow_nr!(TUNSETOFFLOAD, TUNTAP, 208, c_uint);
ioctl_iow_nr!(TUNSETVNETHDRSZ, TUNTAP, 216, c_int);

/// NIC IRQ line, fixed by the paravirtual port protocol (spec.md §6).
pub const NET_IRQ_GSI: u32 = 11;

fn terminated_if_name(if_name: &str) -> Result<[c_char; IFNAMSIZ]> {
    let bytes = if_name.as_bytes();
    if bytes.len() >= IFNAMSIZ {
        return Err(Error::InvalidTapLength(if_name.to_string()));
    }
    let mut name = [0 as c_char; IFNAMSIZ];
    for (dst, src) in name.iter_mut().zip(bytes.iter()) {
        *dst = *src as c_char;
    }
    Ok(name)
}

/// A host TAP device bound to the guest's single NIC.
pub struct Tap {
    file: std::fs::File,
}

impl Tap {
    /// Opens (or creates) a persistent TAP interface named `if_name`.
    pub fn open_named(if_name: &str) -> Result<Self> {
        let fd = unsafe {
            libc::open(TAP_FILE, libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC)
        };
        if fd < 0 {
            return Err(Error::OpenTun(IoError::last_os_error()));
        }
        let file = unsafe { std::fs::File::from_raw_fd(fd) };

        let mut req = ifreq::default();
        req.ifr_ifrn.ifrn_name = terminated_if_name(if_name)?;
        req.ifr_ifru.ifru_flags = (IFF_TAP | IFF_NO_PI | IFF_VNET_HDR) as std::os::raw::c_short;

        let ret = unsafe {
            vmm_sys_util::ioctl::ioctl_with_mut_ref(&file, TUNSETIFF(), &mut req)
        };
        if ret < 0 {
            return Err(Error::IoctlError(IoError::last_os_error()));
        }

        Ok(Tap { file })
    }

    /// Advertises checksum/segmentation offload flags to the kernel's tun
    /// driver so frames cross the fd without the guest having to emulate
    /// them in software.
    pub fn set_offload(&self, flags: c_uint) -> Result<()> {
        let ret = unsafe {
            vmm_sys_util::ioctl::ioctl_with_val(&self.file, TUNSETOFFLOAD(), c_ulong::from(flags))
        };
        if ret < 0 {
            return Err(Error::IoctlError(IoError::last_os_error()));
        }
        Ok(())
    }

    /// All-offload convenience used when the guest NIC hook is activated.
    pub fn set_default_offload(&self) -> Result<()> {
        self.set_offload(TUN_F_CSUM | TUN_F_TSO4 | TUN_F_TSO6 | TUN_F_UFO)
    }

    pub fn set_vnet_hdr_size(&self, size: c_int) -> Result<()> {
        let ret =
            unsafe { vmm_sys_util::ioctl::ioctl_with_ref(&self.file, TUNSETVNETHDRSZ(), &size) };
        if ret < 0 {
            return Err(Error::IoctlError(IoError::last_os_error()));
        }
        Ok(())
    }
}

impl Read for Tap {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        self.file.read(buf)
    }
}

impl Write for Tap {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

impl AsRawFd for Tap {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Host-side state for the `NETINFO`/`NETWRITE`/`NETREAD`/`NETSTAT`
/// hypercall family: the TAP fd, the irqfd registered for GSI 11, and the
/// lazily-started poll thread that wakes the guest on inbound traffic.
pub struct NetBackend {
    tap: Tap,
    irq_evt: EventFd,
    poll_thread: Option<JoinHandle<()>>,
    poll_thread_running: Arc<AtomicBool>,
}

impl NetBackend {
    pub fn new(vm_fd: &VmFd, tap_name: &str) -> Result<Self> {
        let tap = Tap::open_named(tap_name)?;
        tap.set_default_offload()?;
        tap.set_vnet_hdr_size(12)?;

        let irq_evt = EventFd::new(libc::EFD_NONBLOCK).map_err(Error::OpenTun)?;
        vm_fd
            .register_irqfd(&irq_evt, NET_IRQ_GSI)
            .map_err(Error::KvmIoctl)?;

        log::info!("attached TAP interface {} (irq GSI {})", tap_name, NET_IRQ_GSI);

        Ok(NetBackend {
            tap,
            irq_evt,
            poll_thread: None,
            poll_thread_running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Host side of the `NETWRITE` hypercall: the guest has placed `len`
    /// bytes of a frame in guest memory and this transfers them onto the
    /// TAP fd. Short writes are returned verbatim, not retried, matching
    /// the `WRITE`/`READ` hypercall truncation contract.
    pub fn write_frame(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.tap.write(buf)
    }

    /// Host side of the `NETREAD` hypercall.
    pub fn read_frame(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        self.tap.read(buf)
    }

    /// `NETSTAT` is currently a liveness probe: it reports whether the TAP
    /// fd is still open and readable without consuming a frame.
    pub fn stat(&self) -> bool {
        self.tap.as_raw_fd() >= 0
    }

    /// Lazily starts the poll thread the first time the guest asks for
    /// network info (`NETINFO`). Idempotent: a second call is a no-op.
    pub fn ensure_poll_thread(&mut self) {
        if self.poll_thread.is_some() {
            return;
        }

        let raw_fd = self.tap.as_raw_fd();
        let irq_evt = self.irq_evt.try_clone().expect("failed to clone irq eventfd");
        let running = self.poll_thread_running.clone();
        running.store(true, Ordering::SeqCst);

        self.poll_thread = Some(thread::spawn(move || {
            let mut fds = [libc::pollfd {
                fd: raw_fd,
                events: libc::POLLIN,
                revents: 0,
            }];

            while running.load(Ordering::SeqCst) {
                // Poll with a timeout so the thread notices shutdown even
                // with no traffic.
                let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, 250) };
                if ret > 0 && fds[0].revents & libc::POLLIN != 0 {
                    // The actual frame is drained by the vCPU thread
                    // servicing `NETREAD`; we only need to raise the IRQ.
                    let _ = irq_evt.write(1);
                }
            }
        }));
    }

    pub fn stop_poll_thread(&mut self) {
        self.poll_thread_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NetBackend {
    fn drop(&mut self) {
        self.stop_poll_thread();
    }
}
