//! The raw block device — the engine's only external I/O dependency.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::{DeviceError, Error, Result};

/// Signed 64-bit logical/physical block number. `-1` is the "none" sentinel.
pub type BlockT = i64;
pub const BLOCK_NONE: BlockT = -1;

/// Byte-addressable device. All offsets passed to `read`/`write` are
/// multiples of `block_size()`; the device itself does no caching.
pub trait Device: Send + Sync {
    fn block_bits(&self) -> u32;

    fn block_size(&self) -> usize {
        1 << self.block_bits()
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write(&self, offset: u64, buf: &[u8]) -> Result<()>;

    fn read_block(&self, block: BlockT, buf: &mut [u8]) -> Result<()> {
        self.read((block as u64) << self.block_bits(), buf)
    }

    fn write_block(&self, block: BlockT, buf: &[u8]) -> Result<()> {
        self.write((block as u64) << self.block_bits(), buf)
    }
}

/// A `Device` backed by a regular file, using `pread`/`pwrite` so that
/// reads and writes never perturb a shared file offset — there is no
/// concurrent access inside the engine, but the frontend and backend
/// both address the same fd.
pub struct FileDevice {
    file: File,
    bits: u32,
}

impl FileDevice {
    pub fn create<P: AsRef<Path>>(path: P, bits: u32, len_bytes: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| ioerr("create", BLOCK_NONE, e))?;
        file.set_len(len_bytes).map_err(|e| ioerr("truncate", BLOCK_NONE, e))?;
        Ok(FileDevice { file, bits })
    }

    pub fn open<P: AsRef<Path>>(path: P, bits: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ioerr("open", BLOCK_NONE, e))?;
        Ok(FileDevice { file, bits })
    }

    pub fn len_blocks(&self) -> Result<u64> {
        let meta = self.file.metadata().map_err(|e| ioerr("stat", BLOCK_NONE, e))?;
        Ok(meta.len() >> self.bits)
    }
}

fn ioerr(op: &'static str, block: BlockT, e: std::io::Error) -> Error {
    Error::Device(DeviceError {
        op,
        block,
        errno: errno::Errno(e.raw_os_error().unwrap_or(libc::EIO)),
    })
}

impl Device for FileDevice {
    fn block_bits(&self) -> u32 {
        self.bits
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let fd = self.file.as_raw_fd();
        let n = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(ioerr("read", (offset >> self.bits) as BlockT, std::io::Error::last_os_error()));
        }
        // Short reads past EOF on a sparse file read as zero — callers only
        // ever read within the volume, but be defensive rather than return
        // uninitialized bytes.
        for b in &mut buf[n as usize..] {
            *b = 0;
        }
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let fd = self.file.as_raw_fd();
        let n = unsafe {
            libc::pwrite(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 || n as usize != buf.len() {
            return Err(ioerr("write", (offset >> self.bits) as BlockT, std::io::Error::last_os_error()));
        }
        Ok(())
    }
}
