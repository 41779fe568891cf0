// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! On-the-wire layout of each hypercall's argument structure (spec.md
//! §4.D: "Each argument struct has a fixed on-the-wire layout").
//!
//! Every struct here is written by the guest into its own memory and
//! dereferenced by the host at the guest-physical offset the port write
//! carries; fields documented as guest-virtual pointers (`buf`, `name`,
//! `argv`, `env`) are translated with [`crate::memory::MemoryManager::virt_to_phys`]
//! before the host touches them.

use vm_memory::ByteValued;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteReadArgs {
    pub fd: i32,
    _pad: i32,
    pub buf: u64,
    pub len: u64,
}
unsafe impl ByteValued for WriteReadArgs {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenArgs {
    pub name: u64,
    pub flags: i32,
    pub mode: i32,
    pub ret: i32,
    _pad: i32,
}
unsafe impl ByteValued for OpenArgs {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseArgs {
    pub fd: i32,
    pub ret: i32,
}
unsafe impl ByteValued for CloseArgs {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct LseekArgs {
    pub fd: i32,
    pub whence: i32,
    pub offset: i64,
}
unsafe impl ByteValued for LseekArgs {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitArgs {
    pub arg: i32,
}
unsafe impl ByteValued for ExitArgs {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NetInfoArgs {
    pub mac: [u8; 6],
    _pad: [u8; 2],
}
unsafe impl ByteValued for NetInfoArgs {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NetWriteArgs {
    pub data: u64,
    pub len: i32,
    pub ret: i32,
}
unsafe impl ByteValued for NetWriteArgs {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NetReadArgs {
    pub data: u64,
    pub len: i32,
    pub ret: i32,
}
unsafe impl ByteValued for NetReadArgs {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NetStatArgs {
    pub status: u8,
    _pad: [u8; 7],
}
unsafe impl ByteValued for NetStatArgs {}

/// First phase of argv/envp forwarding: the guest asks how large a
/// buffer it needs to allocate before the host writes the actual
/// strings (spec.md §4.D: "two-phase forwarding of argc/envc and their
/// concatenated strings").
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CmdsizeArgs {
    pub argc: i32,
    pub argsz: i32,
    pub envc: i32,
    pub envsz: i32,
}
unsafe impl ByteValued for CmdsizeArgs {}

/// Second phase: the host writes each NUL-terminated argv string (and,
/// if present, each `KEY=VALUE` environment string) back-to-back at
/// the guest-supplied virtual addresses.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CmdvalArgs {
    pub argv: u64,
    pub envp: u64,
}
unsafe impl ByteValued for CmdvalArgs {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FreelistArgs {
    pub addr: u64,
    pub len: u64,
}
unsafe impl ByteValued for FreelistArgs {}
