// SPDX-License-Identifier: Apache-2.0

use std::io::Error as IoError;

mod bindings;
pub mod net;
pub mod uart;

/// Custom defined [`std::result::Result`]
pub type Result<T> = std::result::Result<T, Error>;

/// Error related to paravirtual devices (network, console).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open /dev/net/tun")]
    OpenTun(IoError),

    #[error("failed to communicate with device")]
    IoctlError(IoError),

    #[error("TAP interface name {0} is too long")]
    InvalidTapLength(String),

    #[error("failed to register irqfd with KVM")]
    KvmIoctl(kvm_ioctls::Error),
}
