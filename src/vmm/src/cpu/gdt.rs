// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Minimal GDT/IDT construction for the long-mode boot trampoline
//! (spec.md §4.C: "constructs a minimal global descriptor table (null,
//! 64-bit code, 64-bit data) at a fixed low-memory offset").

use kvm_bindings::kvm_segment;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap};

/// Fixed low-memory offset for the boot GDT.
pub const BOOT_GDT_OFFSET: u64 = 0x500;
/// Fixed low-memory offset for the boot IDT (a single null entry; no
/// interrupts are handled before the guest installs its own IDT).
pub const BOOT_IDT_OFFSET: u64 = 0x520;

/// Null, 64-bit code, 64-bit data, TSS: four entries.
pub const BOOT_GDT_MAX: usize = 4;

fn get_base(entry: u64) -> u64 {
    (((entry) & 0xFF00000000000000) >> 32)
        | (((entry) & 0x000000FF00000000) >> 16)
        | (((entry) & 0x00000000FFFF0000) >> 16)
}

fn get_limit(entry: u64) -> u32 {
    ((((entry) & 0x000F000000000000) >> 32) | ((entry) & 0x000000000000FFFF)) as u32
}

fn get_g(entry: u64) -> u8 {
    ((entry & 0x0080000000000000) >> 55) as u8
}

fn get_db(entry: u64) -> u8 {
    ((entry & 0x0040000000000000) >> 54) as u8
}

fn get_l(entry: u64) -> u8 {
    ((entry & 0x0020000000000000) >> 53) as u8
}

fn get_avl(entry: u64) -> u8 {
    ((entry & 0x0010000000000000) >> 52) as u8
}

fn get_p(entry: u64) -> u8 {
    ((entry & 0x0000800000000000) >> 47) as u8
}

fn get_dpl(entry: u64) -> u8 {
    ((entry & 0x0000600000000000) >> 45) as u8
}

fn get_s(entry: u64) -> u8 {
    ((entry & 0x0000100000000000) >> 44) as u8
}

fn get_type(entry: u64) -> u8 {
    ((entry & 0x0000F00000000000) >> 40) as u8
}

/// Packs a GDT entry from the flags/base/limit triple, matching the
/// layout the x86_64 CPU expects in a descriptor table.
pub fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((u64::from(base) & 0xff00_0000u64) << (56 - 24))
        | ((u64::from(flags) & 0x0000_f0ffu64) << 40)
        | ((u64::from(limit) & 0x000f_0000u64) << (48 - 16))
        | ((u64::from(base) & 0x00ff_ffffu64) << 16)
        | (u64::from(limit) & 0x0000_ffffu64)
}

/// Expands a packed GDT entry into the `kvm_segment` KVM wants for
/// `KVM_SET_SREGS`.
pub fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
    let present = get_p(entry);
    kvm_segment {
        base: get_base(entry),
        limit: get_limit(entry),
        selector: (table_index * 8) as u16,
        type_: get_type(entry),
        present,
        dpl: get_dpl(entry),
        db: get_db(entry),
        s: get_s(entry),
        l: get_l(entry),
        g: get_g(entry),
        avl: get_avl(entry),
        padding: 0,
        unusable: if present == 0 { 1 } else { 0 },
    }
}

pub fn write_gdt_table(table: &[u64], guest_memory: &GuestMemoryMmap) -> Result<(), GuestMemoryError> {
    let boot_gdt_addr = GuestAddress(BOOT_GDT_OFFSET);
    for (index, entry) in table.iter().enumerate() {
        let addr = boot_gdt_addr.unchecked_add((index * std::mem::size_of::<u64>()) as u64);
        guest_memory.write_obj(*entry, addr)?;
    }
    Ok(())
}

pub fn write_idt_value(val: u64, guest_memory: &GuestMemoryMmap) -> Result<(), GuestMemoryError> {
    let boot_idt_addr = GuestAddress(BOOT_IDT_OFFSET);
    guest_memory.write_obj(val, boot_idt_addr)
}
