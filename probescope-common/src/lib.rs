// Shared definitions for the control channel and relay buffers. The kernel
// module defines this layout; both the translator's generated code and the
// relay daemon must agree with it byte for byte.

use std::io::{self, Read, Write};
use std::mem;

/// Control channel message kinds
pub const STP_REALTIME_DATA: u32 = 1;
pub const STP_OOB_DATA: u32 = 2;
pub const STP_EXIT: u32 = 3;
pub const STP_START: u32 = 4;
pub const STP_SYSTEM: u32 = 5;
pub const STP_TRANSPORT_INFO: u32 = 6;
pub const STP_MODULE: u32 = 7;
pub const STP_SYMBOLS: u32 = 8;

/// Maximum number of CPUs the relay daemon will service
pub const NR_CPUS: usize = 256;

/// Size of the control-channel receive buffer
pub const RECV_BUF_SIZE: usize = 8192;

/// Filesystem magic numbers used to locate the relay mount
pub const RELAYFS_MAGIC: i64 = 0xF0B4_A981u32 as i64;
pub const DEBUGFS_MAGIC: i64 = 0x6462_6720;

/// Endianness tag carried in a symbol request; mismatch means the daemon
/// and kernel were built for different byte orders.
pub const SYMBOL_ENDIAN_TAG: u32 = 0x1234;

/// Transport selected by the kernel module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    #[default]
    Unset,
    Relayfs,
    Proc,
}

impl TransportMode {
    #[must_use]
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => TransportMode::Relayfs,
            2 => TransportMode::Proc,
            _ => TransportMode::Unset,
        }
    }

    /// Proc transport streams data inline over the control channel.
    #[must_use]
    pub fn is_streaming(self) -> bool {
        self == TransportMode::Proc
    }
}

/// Reads a `#[repr(C)]` payload out of a control-message body.
///
/// Returns `None` when the payload is shorter than the struct; trailing
/// bytes are permitted (the kernel pads some messages).
macro_rules! impl_wire {
    ($ty:ty) => {
        impl $ty {
            #[must_use]
            pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
                if bytes.len() < mem::size_of::<Self>() {
                    return None;
                }
                // SAFETY: length checked above and the type is repr(C)
                // with no invalid bit patterns.
                let value = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<Self>()) };
                Some(value)
            }

            #[must_use]
            pub fn as_bytes(&self) -> &[u8] {
                // SAFETY: repr(C), plain integer fields, shared borrow.
                unsafe {
                    std::slice::from_raw_parts(
                        (self as *const Self).cast::<u8>(),
                        mem::size_of::<Self>(),
                    )
                }
            }
        }
    };
}

/// `TRANSPORT_INFO` payload, sent in both directions: the daemon requests a
/// buffer size, the kernel answers with the transport geometry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportInfo {
    pub transport_mode: i32,
    pub buf_size: u32,    // proc transport: buffer size in MB
    pub subbuf_size: u32, // relayfs: size of one sub-buffer
    pub n_subbufs: u32,   // relayfs: sub-buffers per CPU
    pub target: i32,      // pid of the traced child, 0 if none
    pub merge: i32,       // nonzero: merge per-CPU output at shutdown
}
impl_wire!(TransportInfo);

/// `START` payload in both directions (daemon pid out, probe-start status in)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStart {
    pub pid: i32,
}
impl_wire!(TransportStart);

/// `EXIT` payload: nonzero when the module already shut itself down
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportExit {
    pub closed: i32,
}
impl_wire!(TransportExit);

/// Per-CPU buffer state, read from the per-CPU proc file
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BufInfo {
    pub cpu: u32,
    pub produced: u32,
    pub consumed: u32,
    pub flushing: u32,
}
impl_wire!(BufInfo);

/// Consumption acknowledgement, written back to the per-CPU proc file
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumedInfo {
    pub cpu: u32,
    pub consumed: u32,
}
impl_wire!(ConsumedInfo);

/// Header of a symbol upload request
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolRequest {
    pub endian: u32,
    pub ptr_size: u32,
}
impl_wire!(SymbolRequest);

/// Per-CPU relay sub-buffers open with a padding count: the payload runs
/// from byte 4 to `subbuf_size - padding`.
pub const SUBBUF_HEADER_SIZE: usize = 4;

/// Splits one sub-buffer into its payload, honoring the padding header.
///
/// Returns `None` if the slice is shorter than the header or the padding
/// count is inconsistent with the sub-buffer size.
#[must_use]
pub fn subbuf_payload(subbuf: &[u8]) -> Option<&[u8]> {
    if subbuf.len() < SUBBUF_HEADER_SIZE {
        return None;
    }
    let padding = u32::from_ne_bytes(subbuf[..4].try_into().ok()?) as usize;
    let len = subbuf.len().checked_sub(SUBBUF_HEADER_SIZE + padding)?;
    Some(&subbuf[SUBBUF_HEADER_SIZE..SUBBUF_HEADER_SIZE + len])
}

/// One record in a per-CPU temp file: `len:u32, timestamp:u32, payload[len]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

impl TraceRecord {
    /// Appends the record in temp-file framing.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let len = self.payload.len() as u32;
        w.write_all(&len.to_ne_bytes())?;
        w.write_all(&self.timestamp.to_ne_bytes())?;
        w.write_all(&self.payload)
    }

    /// Reads the next record, or `Ok(None)` at a clean end of file.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Option<Self>> {
        let mut len_buf = [0u8; 4];
        match r.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_ne_bytes(len_buf) as usize;
        let mut ts_buf = [0u8; 4];
        r.read_exact(&mut ts_buf)?;
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload)?;
        Ok(Some(TraceRecord { timestamp: u32::from_ne_bytes(ts_buf), payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_info_round_trip() {
        let ti = TransportInfo {
            transport_mode: 1,
            buf_size: 0,
            subbuf_size: 1024,
            n_subbufs: 4,
            target: 1234,
            merge: 1,
        };
        let parsed = TransportInfo::from_bytes(ti.as_bytes()).unwrap();
        assert_eq!(parsed.subbuf_size, 1024);
        assert_eq!(parsed.n_subbufs, 4);
        assert_eq!(TransportMode::from_raw(parsed.transport_mode), TransportMode::Relayfs);
    }

    #[test]
    fn short_payload_rejected() {
        assert!(BufInfo::from_bytes(&[0u8; 3]).is_none());
        // Trailing garbage is fine; the kernel pads some messages.
        let mut bytes = BufInfo { cpu: 1, produced: 7, consumed: 3, flushing: 0 }
            .as_bytes()
            .to_vec();
        bytes.extend_from_slice(&[0xAA; 8]);
        let info = BufInfo::from_bytes(&bytes).unwrap();
        assert_eq!(info.produced, 7);
    }

    #[test]
    fn subbuf_padding_respected() {
        // 16-byte sub-buffer, 6 bytes of padding at the tail.
        let mut subbuf = vec![0u8; 16];
        subbuf[..4].copy_from_slice(&6u32.to_ne_bytes());
        for (i, b) in subbuf[4..10].iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        assert_eq!(subbuf_payload(&subbuf).unwrap(), &[1, 2, 3, 4, 5, 6]);
        assert!(subbuf_payload(&[0u8; 2]).is_none());
    }

    #[test]
    fn record_round_trip() {
        let rec = TraceRecord { timestamp: 42, payload: b"hello".to_vec() };
        let mut buf = Vec::new();
        rec.write_to(&mut buf).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let back = TraceRecord::read_from(&mut cursor).unwrap().unwrap();
        assert_eq!(back, rec);
        assert!(TraceRecord::read_from(&mut cursor).unwrap().is_none());
    }
}
