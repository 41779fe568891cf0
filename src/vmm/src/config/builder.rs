// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use crate::config::{CheckpointConfig, MigrationRole, NetConfig, VMMConfig};

/// See [`VMMConfig`] for explanation about these options.
#[derive(Debug, Default)]
pub struct VMMConfigBuilder {
    kernel_path: PathBuf,
    cpus: u8,
    memory: u64,
    verbose: u8,
    console: Option<PathBuf>,
    net: Option<NetConfig>,
    mergeable: bool,
    hugepage: bool,
    checkpoint: CheckpointConfig,
    checkpoint_dir: PathBuf,
    migration_role: MigrationRole,
    migration_params_path: Option<PathBuf>,
    guest_args: Vec<String>,
}

impl VMMConfigBuilder {
    // TODO: Maybe add a management of errors (e.g. checking kernel_path exists here)
    pub fn new(num_vcpus: u8, mem_size: u64, kernel_path: &str) -> Self {
        VMMConfigBuilder {
            cpus: num_vcpus,
            memory: mem_size,
            kernel_path: PathBuf::from(kernel_path),
            checkpoint_dir: PathBuf::from("checkpoints"),
            ..Default::default()
        }
    }

    pub fn checkpoint_dir(mut self, dir: PathBuf) -> Self {
        self.checkpoint_dir = dir;
        self
    }

    pub fn verbose(mut self, lvl: u8) -> Self {
        self.verbose = lvl;
        self
    }

    pub fn console(mut self, console: Option<PathBuf>) -> Self {
        self.console = console;
        self
    }

    pub fn net(mut self, net: Option<NetConfig>) -> Self {
        self.net = net;
        self
    }

    pub fn mergeable(mut self, mergeable: bool) -> Self {
        self.mergeable = mergeable;
        self
    }

    pub fn hugepage(mut self, hugepage: bool) -> Self {
        self.hugepage = hugepage;
        self
    }

    pub fn checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn migration_role(mut self, role: MigrationRole) -> Self {
        self.migration_role = role;
        self
    }

    pub fn migration_params_path(mut self, path: Option<PathBuf>) -> Self {
        self.migration_params_path = path;
        self
    }

    pub fn guest_args(mut self, args: Vec<String>) -> Self {
        self.guest_args = args;
        self
    }

    pub fn build(self) -> VMMConfig {
        VMMConfig {
            kernel_path: self.kernel_path,
            cpus: self.cpus,
            memory: self.memory,
            verbose: self.verbose,
            console: self.console,
            net: self.net,
            mergeable: self.mergeable,
            hugepage: self.hugepage,
            checkpoint: self.checkpoint,
            checkpoint_dir: self.checkpoint_dir,
            migration_role: self.migration_role,
            migration_params_path: self.migration_params_path,
            guest_args: self.guest_args,
        }
    }
}
