// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Host side of the `UART` hypercall: spec.md does not model a full 16550
//! UART, it only lets the guest push one byte at a time to the host's
//! standard error when verbose mode is enabled (spec.md §4.D).

use std::io::{self, Write};

pub struct UartSink {
    verbose: bool,
}

impl UartSink {
    pub fn new(verbose: bool) -> Self {
        UartSink { verbose }
    }

    /// Appends `byte` to stderr if verbose mode is on; otherwise a no-op.
    pub fn put(&mut self, byte: u8) {
        if !self.verbose {
            return;
        }
        let mut stderr = io::stderr();
        let _ = stderr.write_all(&[byte]);
        let _ = stderr.flush();
    }
}
