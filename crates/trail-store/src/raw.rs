use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::log::write_all_retrying;

/// Byte-for-byte copy of terminal output for replay. Not hash-chained.
pub struct RawCapture {
    path: PathBuf,
    file: File,
    bytes: u64,
    transient_retry_limit: u32,
}

impl RawCapture {
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create_new(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            bytes: 0,
            transient_retry_limit: 3,
        })
    }

    pub fn with_transient_retry_limit(mut self, limit: u32) -> Self {
        self.transient_retry_limit = limit;
        self
    }

    pub fn append(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        write_all_retrying(&mut self.file, chunk, self.transient_retry_limit)?;
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> Result<u64, StoreError> {
        self.file.flush()?;
        Ok(self.bytes)
    }
}
