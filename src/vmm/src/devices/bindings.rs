// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Minimal `<linux/if.h>` / `<linux/if_tun.h>` bindings needed to open and
//! configure a TAP device. We hand-roll these instead of depending on a
//! bindgen crate because only a handful of constants and one ioctl struct
//! are needed.

use std::os::raw::{c_char, c_short};

pub(crate) const IFNAMSIZ: usize = 16;

// TUNSETOFFLOAD flags, see <linux/if_tun.h>.
pub(crate) const TUN_F_CSUM: u32 = 0x01;
pub(crate) const TUN_F_TSO4: u32 = 0x02;
pub(crate) const TUN_F_TSO6: u32 = 0x04;
pub(crate) const TUN_F_UFO: u32 = 0x10;

#[repr(C)]
#[derive(Copy, Clone)]
pub(crate) union IfrIfru {
    pub ifru_addr: [u8; 16],
    pub ifru_flags: c_short,
    pub ifru_ivalue: i32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub(crate) struct IfrIfrn {
    pub ifrn_name: [c_char; IFNAMSIZ],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub(crate) struct ifreq {
    pub ifr_ifrn: IfrIfrn,
    pub ifr_ifru: IfrIfru,
}

impl Default for ifreq {
    fn default() -> Self {
        // SAFETY: `ifreq` is a plain-old-data C struct; the all-zero bit
        // pattern is a valid value for every field (empty name, zero flags).
        unsafe { std::mem::zeroed() }
    }
}
