// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Optional per-session on-disk terminal log, byte-capped with single-file
//! rotation (`.1` suffix).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use tracing::warn;

pub struct TermLog {
    path: PathBuf,
    max_bytes: u64,
    file: Option<File>,
    written: u64,
}

impl TermLog {
    pub fn new(path: PathBuf, max_bytes: u64) -> Self {
        Self { path, max_bytes, file: None, written: 0 }
    }

    /// Append raw output bytes, rotating when the cap is reached.
    /// Logging failures are reported once and never disturb the session.
    pub fn write(&mut self, data: &[u8]) {
        if self.file.is_none() {
            match self.open() {
                Ok(file) => self.file = Some(file),
                Err(e) => {
                    warn!(path = %self.path.display(), "terminal log unavailable: {e}");
                    return;
                }
            }
        }

        if self.written + data.len() as u64 > self.max_bytes {
            self.rotate();
        }

        if let Some(ref mut file) = self.file {
            if file.write_all(data).is_ok() {
                self.written += data.len() as u64;
            }
        }
    }

    fn open(&mut self) -> std::io::Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(file)
    }

    fn rotate(&mut self) {
        self.file = None;
        let rotated = {
            let mut os = self.path.clone().into_os_string();
            os.push(".1");
            PathBuf::from(os)
        };
        let _ = std::fs::rename(&self.path, &rotated);
        self.written = 0;
        if let Ok(file) = self.open() {
            self.file = Some(file);
        }
    }
}
