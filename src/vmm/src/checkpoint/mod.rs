// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Checkpoint store (spec.md §4.F, §3 "Checkpoint files").
//!
//! A checkpoint round writes one `chk{N}_core{i}.dat` per vCPU (a
//! bincode-serialized [`crate::cpu::state::VcpuState`]), one
//! `chk{N}_mem.dat` (the guest clock followed by a stream of
//! `(entry, page_ptr, page_size)` headers each immediately followed by
//! that many raw page bytes, ending at EOF), and a plain-text
//! `chk_config.txt` manifest. Restoring replays checkpoint 0..N for an
//! incremental chain, or just N for a full one.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use kvm_bindings::kvm_clock_data;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::clock::ClockSnapshot;
use crate::cpu::state::VcpuState;
use crate::pagetable::{self, DumpMode, PageRecord};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to (de)serialize vCPU state: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("manifest at {0} is malformed: {1}")]
    Manifest(PathBuf, String),
    #[error("guest memory error: {0}")]
    GuestMemory(#[from] vm_memory::GuestMemoryError),
    #[error("page-table scan failed: {0}")]
    PageTable(#[from] pagetable::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// `chk_config.txt`: cores, memory size, checkpoint number, entry point,
/// full-vs-incremental flag, optional application path (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub cores: u8,
    pub memory: u64,
    /// Count of checkpoint rounds written so far (spec.md §8 scenario 3:
    /// "after 3 timer ticks ... `checkpoint number: 3`"), not the last
    /// round's 0-based index — the files on disk for that round are
    /// `chk{checkpoint_number - 1}_*`.
    pub checkpoint_number: u32,
    pub entry_point: u64,
    pub full: bool,
    pub app_path: Option<String>,
}

impl Manifest {
    fn to_text(&self) -> String {
        let mut out = format!(
            "cores: {}\nmemory: {}\ncheckpoint number: {}\nentry point: {}\nfull checkpoint: {}\n",
            self.cores,
            self.memory,
            self.checkpoint_number,
            self.entry_point,
            self.full as u8,
        );
        if let Some(app) = &self.app_path {
            out.push_str(&format!("application: {}\n", app));
        }
        out
    }

    fn from_text(path: &Path, text: &str) -> Result<Self> {
        let mut cores = None;
        let mut memory = None;
        let mut checkpoint_number = None;
        let mut entry_point = None;
        let mut full = None;
        let mut app_path = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Manifest(path.to_path_buf(), line.to_string()))?;
            let value = value.trim();
            match key.trim() {
                "cores" => cores = value.parse().ok(),
                "memory" => memory = value.parse().ok(),
                "checkpoint number" => checkpoint_number = value.parse().ok(),
                "entry point" => entry_point = value.parse().ok(),
                "full checkpoint" => full = value.parse::<u8>().ok().map(|v| v != 0),
                "application" => app_path = Some(value.to_string()),
                other => return Err(Error::Manifest(path.to_path_buf(), other.to_string())),
            }
        }

        Ok(Manifest {
            cores: cores.ok_or_else(|| Error::Manifest(path.to_path_buf(), "cores".into()))?,
            memory: memory.ok_or_else(|| Error::Manifest(path.to_path_buf(), "memory".into()))?,
            checkpoint_number: checkpoint_number
                .ok_or_else(|| Error::Manifest(path.to_path_buf(), "checkpoint number".into()))?,
            entry_point: entry_point
                .ok_or_else(|| Error::Manifest(path.to_path_buf(), "entry point".into()))?,
            full: full.ok_or_else(|| Error::Manifest(path.to_path_buf(), "full checkpoint".into()))?,
            app_path,
        })
    }
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> Error + '_ {
    move |e| Error::Io(path.to_path_buf(), e)
}

/// Owns the on-disk checkpoint directory and the next checkpoint number
/// to allocate (resumed from an existing `chk_config.txt` if present, a
/// supplement spec.md's distilled form leaves implicit).
pub struct CheckpointStore {
    dir: PathBuf,
    next_number: u32,
    force_full: bool,
}

impl CheckpointStore {
    pub fn new(dir: PathBuf, force_full: bool) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let manifest_path = dir.join("chk_config.txt");
        let next_number = match fs::read_to_string(&manifest_path) {
            Ok(text) => Manifest::from_text(&manifest_path, &text)?.checkpoint_number,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(Error::Io(manifest_path, e)),
        };
        Ok(CheckpointStore { dir, next_number, force_full })
    }

    pub fn next_number(&self) -> u32 {
        self.next_number
    }

    /// Writes one checkpoint round: per-core state files, the memory
    /// dump, and the manifest (spec.md §4.F "create").
    pub fn create(
        &mut self,
        cores: &[VcpuState],
        guest_memory: &GuestMemoryMmap,
        entry_point: u64,
        memory_size: u64,
        clock: kvm_clock_data,
        app_path: Option<String>,
    ) -> Result<u32> {
        let n = self.next_number;
        let full = self.force_full || n == 0;

        for (i, state) in cores.iter().enumerate() {
            let path = self.dir.join(format!("chk{}_core{}.dat", n, i));
            let file = File::create(&path).map_err(io_err(&path))?;
            bincode::serialize_into(BufWriter::new(file), state)?;
        }

        let mem_path = self.dir.join(format!("chk{}_mem.dat", n));
        let mut mem_file = BufWriter::new(File::create(&mem_path).map_err(io_err(&mem_path))?);
        bincode::serialize_into(&mut mem_file, &ClockSnapshot::from(clock))?;

        let mode = if full {
            DumpMode::Full
        } else {
            DumpMode::Incremental { after_full: n > 1 }
        };
        for record in pagetable::scan(guest_memory, entry_point, mode)? {
            write_page_record(&mut mem_file, guest_memory, &record, &mem_path)?;
        }
        mem_file.flush().map_err(io_err(&mem_path))?;

        let manifest = Manifest {
            cores: cores.len() as u8,
            memory: memory_size,
            checkpoint_number: n + 1,
            entry_point,
            full,
            app_path,
        };
        let manifest_path = self.dir.join("chk_config.txt");
        fs::write(&manifest_path, manifest.to_text()).map_err(io_err(&manifest_path))?;

        self.next_number = n + 1;
        Ok(n)
    }

    /// Reads the manifest and replays round 0..=last (incremental) or just
    /// the last round (full) into `guest_memory`, where `last` is the
    /// manifest's checkpoint count minus one, returning the per-core
    /// states and clock from that final replayed round (spec.md §4.F
    /// "restore").
    pub fn restore(
        dir: &Path,
        guest_memory: &GuestMemoryMmap,
    ) -> Result<(Manifest, Vec<VcpuState>, kvm_clock_data)> {
        let manifest_path = dir.join("chk_config.txt");
        let text = fs::read_to_string(&manifest_path).map_err(io_err(&manifest_path))?;
        let manifest = Manifest::from_text(&manifest_path, &text)?;
        let last = manifest.checkpoint_number - 1;

        let base = if manifest.full { last } else { 0 };
        let mut clock = kvm_clock_data::default();

        for n in base..=last {
            let mem_path = dir.join(format!("chk{}_mem.dat", n));
            let mut mem_file = BufReader::new(File::open(&mem_path).map_err(io_err(&mem_path))?);

            let snapshot: ClockSnapshot = bincode::deserialize_from(&mut mem_file)?;
            clock = snapshot.into();

            loop {
                match bincode::deserialize_from::<_, PageRecord>(&mut mem_file) {
                    Ok(record) => read_page_record(&mut mem_file, guest_memory, &record, &mem_path)?,
                    Err(e) => match *e {
                        bincode::ErrorKind::Io(ref io_e) if io_e.kind() == ErrorKind::UnexpectedEof => {
                            break
                        }
                        _ => return Err(Error::Bincode(e)),
                    },
                }
            }
        }

        let mut cores = Vec::with_capacity(manifest.cores as usize);
        for i in 0..manifest.cores {
            let path = dir.join(format!("chk{}_core{}.dat", last, i));
            let file = File::open(&path).map_err(io_err(&path))?;
            cores.push(bincode::deserialize_from(BufReader::new(file))?);
        }

        Ok((manifest, cores, clock))
    }
}

fn write_page_record(
    mem_file: &mut impl Write,
    guest_memory: &GuestMemoryMmap,
    record: &PageRecord,
    path: &Path,
) -> Result<()> {
    bincode::serialize_into(&mut *mem_file, record)?;
    let mut buf = vec![0u8; record.page_size as usize];
    guest_memory.read_slice(&mut buf, GuestAddress(record.page_ptr))?;
    mem_file.write_all(&buf).map_err(io_err(path))?;
    Ok(())
}

fn read_page_record(
    mem_file: &mut impl Read,
    guest_memory: &GuestMemoryMmap,
    record: &PageRecord,
    path: &Path,
) -> Result<()> {
    let mut buf = vec![0u8; record.page_size as usize];
    mem_file.read_exact(&mut buf).map_err(io_err(path))?;
    guest_memory.write_slice(&buf, GuestAddress(record.page_ptr))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_through_text() {
        let manifest = Manifest {
            cores: 2,
            memory: 512 * 1024 * 1024,
            checkpoint_number: 3,
            entry_point: 0x10_0000,
            full: true,
            app_path: Some("/bin/guest".to_string()),
        };
        let text = manifest.to_text();
        let parsed = Manifest::from_text(Path::new("chk_config.txt"), &text).unwrap();
        assert_eq!(manifest, parsed);
    }

    #[test]
    fn manifest_rejects_unknown_key() {
        let err = Manifest::from_text(Path::new("chk_config.txt"), "bogus: 1\n");
        assert!(err.is_err());
    }
}
