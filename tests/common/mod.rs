//! A hermetic `IoHandle` backing files with in-memory byte vectors, so the
//! integration tests can drive the seed scenarios without touching disk.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use blockcache::{FileId, IoHandle};

#[derive(Default)]
pub struct FakeIoHandle {
    files: Mutex<HashMap<FileId, Vec<u8>>>,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    /// Sleep this long inside `pread`, to widen the window a concurrent
    /// secondary reader has to observe the block mid-load.
    pub read_delay: Duration,
    /// Sleep this long inside `pwrite`, to widen the window a concurrent
    /// flush has to observe a block still `IN_FLUSH`.
    pub write_delay: Duration,
    /// Force every `pwrite` to fail, to exercise flush/write error paths.
    pub fail_writes: std::sync::atomic::AtomicBool,
}

impl FakeIoHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, file: FileId, offset: u64, data: &[u8]) {
        let mut files = self.files.lock().unwrap();
        let buf = files.entry(file).or_default();
        let end = offset as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(data);
    }

    pub fn contents(&self, file: FileId) -> Vec<u8> {
        self.files.lock().unwrap().get(&file).cloned().unwrap_or_default()
    }
}

impl IoHandle for FakeIoHandle {
    fn pread(&self, file: FileId, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.read_delay.is_zero() {
            std::thread::sleep(self.read_delay);
        }
        let files = self.files.lock().unwrap();
        let Some(src) = files.get(&file) else {
            return Ok(0);
        };
        let offset = offset as usize;
        if offset >= src.len() {
            return Ok(0);
        }
        let n = buf.len().min(src.len() - offset);
        buf[..n].copy_from_slice(&src[offset..offset + n]);
        Ok(n)
    }

    fn pwrite(&self, file: FileId, buf: &[u8], offset: u64) -> io::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if !self.write_delay.is_zero() {
            std::thread::sleep(self.write_delay);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated write failure"));
        }
        self.seed(file, offset, buf);
        Ok(())
    }
}
