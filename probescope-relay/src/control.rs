//! Control channel to the loaded probe module
//!
//! Frames are `u32 kind || payload`, written whole in one call; the kernel
//! side defines the framing. The channel is read only by the main thread,
//! but requests may be sent from any code path holding the session.

use crate::error::RelayError;
use log::{debug, warn};
use probescope_common::RECV_BUF_SIZE;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

pub struct ControlChannel {
    file: File,
}

/// One received control message: kind plus payload length within the
/// caller's receive buffer.
pub struct Message {
    pub kind: u32,
    pub len: usize,
}

impl ControlChannel {
    /// Opens `<proc_dir>/cmd` read-write.
    pub fn open(proc_dir: &str) -> Result<Self, RelayError> {
        let path = format!("{proc_dir}/cmd");
        debug!("opening control channel {path}");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| RelayError::OpenChannel { path, source })?;
        Ok(ControlChannel { file })
    }

    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Sends one framed request. The payload must fit one write.
    pub fn send_request(&self, kind: u32, payload: &[u8]) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&kind.to_ne_bytes());
        buf.extend_from_slice(payload);
        (&self.file).write_all(&buf)
    }

    /// Reads the next message into `buf`. Returns `Ok(None)` when the
    /// kernel closed the channel; short interruptions are retried.
    pub fn read_message(
        &self,
        buf: &mut [u8; RECV_BUF_SIZE],
    ) -> std::io::Result<Option<Message>> {
        loop {
            match (&self.file).read(&mut buf[..]) {
                Ok(0) => {
                    warn!("unexpected EOF on control channel");
                    return Ok(None);
                }
                Ok(n) if n < 4 => {
                    warn!("runt control message ({n} bytes), ignored");
                    continue;
                }
                Ok(n) => {
                    let kind = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    return Ok(Some(Message { kind, len: n - 4 }));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Borrow of one message's payload bytes out of the receive buffer.
#[must_use]
pub fn payload<'a>(buf: &'a [u8; RECV_BUF_SIZE], msg: &Message) -> &'a [u8] {
    &buf[4..4 + msg.len]
}
