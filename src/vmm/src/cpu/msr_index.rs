// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! x86_64 MSR index constants referenced while configuring boot-time
//! model-specific registers (spec.md §3 "vCPU state record",
//! §4.C "Initial-boot path"). Mirrors the subset the Linux kernel exposes
//! in `arch/x86/include/asm/msr-index.h`.

pub const MSR_IA32_SYSENTER_CS: u32 = 0x0000_0174;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x0000_0175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x0000_0176;

pub const MSR_STAR: u32 = 0xc000_0081;
pub const MSR_LSTAR: u32 = 0xc000_0082;
pub const MSR_CSTAR: u32 = 0xc000_0083;
pub const MSR_SYSCALL_MASK: u32 = 0xc000_0084;

pub const MSR_EFER: u32 = 0xc000_0080;
pub const EFER_SCE: u64 = 1 << 0;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NX: u64 = 1 << 11;

pub const MSR_FS_BASE: u32 = 0xc000_0100;
pub const MSR_GS_BASE: u32 = 0xc000_0101;
pub const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;

pub const MSR_IA32_TSC: u32 = 0x0000_0010;
pub const MSR_IA32_APICBASE: u32 = 0x0000_001b;
pub const MSR_IA32_APICBASE_ENABLE: u64 = 1 << 11;
pub const MSR_IA32_APICBASE_BASE: u64 = 0xffff_f000;

pub const MSR_IA32_MISC_ENABLE: u32 = 0x0000_01a0;
pub const MSR_IA32_MISC_ENABLE_FAST_STRING: u64 = 1 << 0;

pub const MSR_IA32_CR_PAT: u32 = 0x0000_0277;
pub const MSR_IA32_CR_PAT_DEFAULT: u64 = 0x0007_0406_0007_0406;
