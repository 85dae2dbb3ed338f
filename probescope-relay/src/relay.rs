//! Per-CPU relay buffers and their reader threads
//!
//! Each online CPU gets a ring file (mmapped read-only), a proc control
//! file for produced/consumed bookkeeping, a temp file receiving drained
//! payload, and one reader thread blocking in poll. Sub-buffers are
//! consumed in FIFO order within a CPU; nothing is promised across CPUs
//! until the optional merge pass.

use crate::error::RelayError;
use log::{debug, error, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::statfs::statfs;
use probescope_common::{subbuf_payload, BufInfo, ConsumedInfo, DEBUGFS_MAGIC, RELAYFS_MAGIC};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

/// Prefix of the per-CPU temp files written while draining.
pub const PERCPU_TMPFILE_BASE: &str = "relay_cpu";

/// Poll timeout doubling as the cancellation point; reader threads cannot
/// be cancelled outright, so they recheck the stop flag at this cadence.
const READER_POLL_MS: u16 = 200;

/// Relay geometry from the module's transport info.
#[derive(Debug, Clone, Copy)]
pub struct RelayParams {
    pub subbuf_size: usize,
    pub n_subbufs: usize,
    pub merge: bool,
}

/// Per-CPU accounting carried back to the main thread on join.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufStatus {
    pub info: BufInfo,
    /// Largest number of sub-buffers ready at one time.
    pub max_backlog: u32,
}

/// Picks the relay mount by filesystem magic and returns the per-CPU file
/// base for this process's module directory.
#[must_use]
pub fn relay_filebase(pid: u32) -> PathBuf {
    let magic_of = |path: &str| statfs(path).map(|st| st.filesystem_type().0 as i64);
    let root = if magic_of("/mnt/relay") == Ok(RELAYFS_MAGIC) {
        "/mnt/relay"
    } else if magic_of("/sys/kernel/debug") == Ok(DEBUGFS_MAGIC) {
        "/sys/kernel/debug"
    } else {
        "/debug"
    };
    PathBuf::from(format!("{root}/systemtap/{pid}/cpu"))
}

/// Writes the ready sub-buffers of one ring to `out` in FIFO order,
/// honoring each sub-buffer's padding header. Returns how many were
/// consumed.
pub fn process_subbufs(
    ring: &[u8],
    info: &BufInfo,
    subbuf_size: usize,
    n_subbufs: usize,
    out: &mut impl Write,
) -> std::io::Result<u32> {
    let ready = info.produced.wrapping_sub(info.consumed);
    let start = info.consumed as usize % n_subbufs;
    let mut consumed = 0;

    for i in start..start + ready as usize {
        let idx = i % n_subbufs;
        let subbuf = &ring[idx * subbuf_size..(idx + 1) * subbuf_size];
        match subbuf_payload(subbuf) {
            Some(payload) if !payload.is_empty() => out.write_all(payload)?,
            Some(_) => {}
            None => warn!("cpu {}: sub-buffer {idx} has inconsistent padding", info.cpu),
        }
        consumed += 1;
    }
    Ok(consumed)
}

/// A read-only private mapping of one CPU's ring.
struct RelayMap {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

// The mapping is written only by the kernel; the owning reader thread is
// its sole user-space reader.
unsafe impl Send for RelayMap {}

impl RelayMap {
    fn new(file: &File, len: usize, params: RelayParams) -> Result<Self, RelayError> {
        let size = NonZeroUsize::new(len).ok_or(RelayError::Mmap {
            total: len,
            subbuf_size: params.subbuf_size,
            n_subbufs: params.n_subbufs,
            errno: nix::errno::Errno::EINVAL,
        })?;
        // SAFETY: mapping a regular relay file read-only; the fd outlives
        // the call and the mapping is unmapped in Drop.
        let ptr = unsafe {
            mmap(
                None,
                size,
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_POPULATE,
                file.as_fd(),
                0,
            )
        }
        .map_err(|errno| RelayError::Mmap {
            total: len,
            subbuf_size: params.subbuf_size,
            n_subbufs: params.n_subbufs,
            errno,
        })?;
        Ok(RelayMap { ptr, len })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping covers `len` readable bytes for our lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }
}

impl Drop for RelayMap {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("munmap failed: {e}");
        }
    }
}

/// Everything one reader thread owns for its CPU. Resources close in
/// reverse order of acquisition when dropped.
pub struct CpuChannel {
    cpu: usize,
    params: RelayParams,
    relay_file: File,
    proc_file: File,
    map: RelayMap,
    tmp: File,
    status: BufStatus,
}

impl CpuChannel {
    /// Opens the ring, the proc control file, the temp output file, and
    /// maps the ring. Any failure unwinds what was already opened.
    pub fn open(
        cpu: usize,
        relay_filebase: &std::path::Path,
        proc_dir: &str,
        params: RelayParams,
    ) -> Result<Self, RelayError> {
        let relay_path = format!("{}{cpu}", relay_filebase.display());
        let relay_file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&relay_path)
            .map_err(|source| RelayError::OpenRelay { path: relay_path.clone(), source })?;

        let proc_path = format!("{proc_dir}/{cpu}");
        debug!("opening {proc_path}");
        let proc_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&proc_path)
            .map_err(|source| RelayError::OpenProc { path: proc_path, source })?;

        let tmp_path = percpu_tmpfile(cpu);
        let tmp = File::create(&tmp_path).map_err(|source| RelayError::OpenOutput {
            path: tmp_path.display().to_string(),
            source,
        })?;

        let total = params.subbuf_size * params.n_subbufs;
        let map = RelayMap::new(&relay_file, total, params)?;

        let mut status = BufStatus::default();
        status.info.cpu = cpu as u32;

        Ok(CpuChannel { cpu, params, relay_file, proc_file, map, tmp, status })
    }

    /// Reader loop: poll the ring, read the latest buffer info, drain the
    /// ready sub-buffers to the temp file, acknowledge them, and leave
    /// when the kernel flags the channel as flushing (or shutdown asks).
    pub fn run(mut self, stop: &AtomicBool) -> BufStatus {
        loop {
            let mut fds = [PollFd::new(self.relay_file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(READER_POLL_MS)) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => {
                    warn!("cpu {}: poll interrupted", self.cpu);
                }
                Err(errno) => {
                    error!("poll error: {errno}");
                    std::process::exit(1);
                }
            }

            let mut raw = [0u8; std::mem::size_of::<BufInfo>()];
            match (&self.proc_file).read(&mut raw) {
                Ok(n) if n >= raw.len() => {
                    if let Some(info) = BufInfo::from_bytes(&raw) {
                        self.status.info = info;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("cpu {}: reading buffer info failed: {e}", self.cpu),
            }

            let consumed = match process_subbufs(
                self.map.as_slice(),
                &self.status.info,
                self.params.subbuf_size,
                self.params.n_subbufs,
                &mut self.tmp,
            ) {
                Ok(n) => n,
                Err(e) => {
                    error!(
                        "couldn't write to output file for cpu {}, exiting: {e}",
                        self.cpu
                    );
                    std::process::exit(1);
                }
            };

            if consumed > 0 {
                if consumed > self.status.max_backlog {
                    self.status.max_backlog = consumed;
                }
                self.status.info.consumed += consumed;
                let ack = ConsumedInfo { cpu: self.cpu as u32, consumed };
                if (&self.proc_file).write(ack.as_bytes()).is_err() {
                    warn!("writing consumed info failed");
                }
            }

            if self.status.info.flushing != 0 || stop.load(Ordering::Relaxed) {
                return self.status;
            }
        }
    }
}

/// Path of one CPU's temp file.
#[must_use]
pub fn percpu_tmpfile(cpu: usize) -> PathBuf {
    PathBuf::from(format!("{PERCPU_TMPFILE_BASE}{cpu}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(subbuf_size: usize, n_subbufs: usize, fills: &[(usize, &[u8])]) -> Vec<u8> {
        let mut ring = vec![0u8; subbuf_size * n_subbufs];
        for (idx, payload) in fills {
            let base = idx * subbuf_size;
            let padding = (subbuf_size - 4 - payload.len()) as u32;
            ring[base..base + 4].copy_from_slice(&padding.to_ne_bytes());
            ring[base + 4..base + 4 + payload.len()].copy_from_slice(payload);
        }
        ring
    }

    #[test]
    fn drains_ready_subbufs_in_fifo_order() {
        let ring = ring_with(16, 4, &[(0, b"aaa"), (1, b"bb")]);
        let info = BufInfo { cpu: 0, produced: 2, consumed: 0, flushing: 0 };
        let mut out = Vec::new();
        let consumed = process_subbufs(&ring, &info, 16, 4, &mut out).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(out, b"aaabb");
    }

    #[test]
    fn drain_wraps_around_the_ring() {
        // consumed=3, produced=5: sub-buffers 3 and 0, in that order.
        let ring = ring_with(16, 4, &[(3, b"third"), (0, b"zeroth")]);
        let info = BufInfo { cpu: 1, produced: 5, consumed: 3, flushing: 0 };
        let mut out = Vec::new();
        let consumed = process_subbufs(&ring, &info, 16, 4, &mut out).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(out, b"thirdzeroth");
    }

    #[test]
    fn fully_padded_subbuf_contributes_nothing() {
        let ring = ring_with(16, 2, &[(0, b"")]);
        let info = BufInfo { cpu: 0, produced: 1, consumed: 0, flushing: 0 };
        let mut out = Vec::new();
        let consumed = process_subbufs(&ring, &info, 16, 2, &mut out).unwrap();
        assert_eq!(consumed, 1);
        assert!(out.is_empty());
    }

    #[test]
    fn backlog_never_exceeds_ring_capacity() {
        // produced can run at most n_subbufs ahead of consumed; a full
        // ring drains completely.
        let n = 4usize;
        let ring = ring_with(16, n, &[(0, b"a"), (1, b"b"), (2, b"c"), (3, b"d")]);
        let info = BufInfo { cpu: 0, produced: 4, consumed: 0, flushing: 0 };
        let mut out = Vec::new();
        let consumed = process_subbufs(&ring, &info, 16, n, &mut out).unwrap();
        assert_eq!(consumed, 4);
        let after = info.consumed + consumed;
        assert!(info.consumed <= info.produced);
        assert!(info.produced <= after + n as u32);
        assert_eq!(out, b"abcd");
    }
}
