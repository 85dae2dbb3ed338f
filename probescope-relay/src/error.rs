//! Runtime error types for the relay daemon

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("couldn't open control channel {path}: {source}")]
    OpenChannel { path: String, source: io::Error },

    #[error("couldn't open relay file {path}: {source}")]
    OpenRelay { path: String, source: io::Error },

    #[error("couldn't open proc file {path}: {source}")]
    OpenProc { path: String, source: io::Error },

    #[error("couldn't open output file {path}: {source}")]
    OpenOutput { path: String, source: io::Error },

    #[error("couldn't mmap relay buffer ({total} bytes = {subbuf_size} x {n_subbufs}): {errno}")]
    Mmap { total: usize, subbuf_size: usize, n_subbufs: usize, errno: nix::errno::Errno },

    #[error("couldn't create reader thread for cpu {cpu}: {source}")]
    SpawnReader { cpu: usize, source: io::Error },

    #[error("couldn't insmod probe module {0}")]
    Insmod(String),

    #[error("TRANSPORT_INFO returned an error")]
    TransportInfo,

    #[error("{0}: {1}")]
    Sys(&'static str, nix::errno::Errno),

    #[error(transparent)]
    Io(#[from] io::Error),
}
