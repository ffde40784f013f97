//! Block-device access.
//!
//! This tool has to *write* the rebuilt chunk tree back to the device it
//! scanned, and mutating a block device through a shared mmap is a
//! needless hazard for a tool whose read path matters this much. `Device`
//! is an "open once, address by offset" handle that goes through
//! `pread`/`pwrite`-style positioned I/O instead.

use crate::error::{RecoverError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

pub struct Device {
    pub path: PathBuf,
    file: File,
    len: u64,
}

impl Device {
    pub fn open_read_only(path: &Path) -> Result<Device> {
        let file = File::open(path)?;
        let len = Self::query_len(&file)?;
        Ok(Device {
            path: path.to_path_buf(),
            file,
            len,
        })
    }

    pub fn open_read_write(path: &Path) -> Result<Device> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = Self::query_len(&file)?;
        Ok(Device {
            path: path.to_path_buf(),
            file,
            len,
        })
    }

    fn query_len(file: &File) -> Result<u64> {
        let md = file.metadata()?;
        if md.is_file() {
            return Ok(md.len());
        }
        // a block device: regular metadata().len() reads zero, so ask the
        // kernel directly.
        let mut len64: u64 = 0;
        let ret = unsafe { ioctls::blkgetsize64(file.as_raw_fd(), &mut len64 as *mut u64) };
        if ret != 0 {
            return Err(RecoverError::Io(std::io::Error::last_os_error()));
        }
        Ok(len64)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`. Short reads
    /// (end of device) are reported as `Ok(false)` rather than an error,
    /// since the Scanner treats them as "stop here", not a fault.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<bool> {
        self.file.seek(SeekFrom::Start(offset))?;
        match self.file.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}
