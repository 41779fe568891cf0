// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Local APIC register helpers (spec.md §4.C: "Configures LAPICs. LAPIC0
//! is set for external interrupts, LAPIC1 is set for NMI").

use kvm_bindings::kvm_lapic_state;

// Offsets poached from the kernel's `apicdef.h`.
pub const APIC_LVT0: usize = 0x350;
pub const APIC_LVT1: usize = 0x360;

pub const APIC_MODE_NMI: u32 = 0x4;
pub const APIC_MODE_EXTINT: u32 = 0x7;

pub fn get_klapic_reg(klapic: &kvm_lapic_state, reg_offset: usize) -> u32 {
    let range = reg_offset..reg_offset + 4;
    let reg = klapic
        .regs
        .get(range)
        .expect("invalid LAPIC register offset");
    reg.iter()
        .rev()
        .fold(0u32, |acc, &byte| (acc << 8) | (byte as u8 as u32))
}

pub fn set_klapic_reg(klapic: &mut kvm_lapic_state, reg_offset: usize, value: u32) {
    let range = reg_offset..reg_offset + 4;
    let reg = klapic
        .regs
        .get_mut(range)
        .expect("invalid LAPIC register offset");
    for (i, byte) in reg.iter_mut().enumerate() {
        *byte = ((value >> (i * 8)) & 0xff) as i8;
    }
}

pub fn set_apic_delivery_mode(reg: u32, mode: u32) -> u32 {
    (reg & !0x700) | (mode << 8)
}
