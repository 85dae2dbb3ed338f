//! Relay daemon entry point
//!
//! Inserts the probe module, then sits in a poll loop over the control
//! channel and a signalfd. The kernel's first word is `TRANSPORT_INFO`,
//! which decides whether trace data flows inline over the channel (proc
//! transport) or through per-CPU relay rings drained by reader threads.
//! Signals do no work in handler context; the signalfd turns them into
//! ordinary readable events on the main loop.

use anyhow::Context as _;
use clap::Parser;
use probescope_relay::cli::Args;
use probescope_relay::{child, control};
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use probescope_common::{
    SymbolRequest, TransportExit, TransportInfo, TransportMode, TransportStart, RECV_BUF_SIZE,
    STP_EXIT, STP_MODULE, STP_OOB_DATA, STP_REALTIME_DATA, STP_START, STP_SYMBOLS, STP_SYSTEM,
    STP_TRANSPORT_INFO, SYMBOL_ENDIAN_TAG,
};
use probescope_relay::session::RelaySession;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Where realtime payload goes in streaming mode.
enum OutSink {
    Stdout,
    File(File),
}

impl OutSink {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            OutSink::Stdout => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                lock.write_all(data)?;
                lock.flush()
            }
            OutSink::File(f) => f.write_all(data),
        }
    }
}

fn send_exit(session: &RelaySession) {
    if let Err(e) = session.control.send_request(STP_EXIT, &[]) {
        warn!("couldn't send exit request: {e}");
    }
}

fn handle_signal(session: &mut RelaySession, sfd: &mut SignalFd, args: &Args) {
    let Ok(Some(siginfo)) = sfd.read_signal() else {
        return;
    };
    match siginfo.ssi_signo as i32 {
        libc::SIGINT | libc::SIGTERM | libc::SIGHUP => send_exit(session),
        libc::SIGCHLD => {
            // Only the traced target's death ends the session; other
            // children (system commands) are merely reaped.
            if let Ok(status) = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                if status.pid().is_some() && status.pid() == session.target_pid {
                    send_exit(session);
                }
            }
        }
        libc::SIGALRM => {
            if args.driver_pid != 0 && !child::driver_alive(args.driver_pid) {
                send_exit(session);
            }
        }
        _ => {}
    }
}

fn cstr_payload(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn handle_message(
    session: &mut RelaySession,
    args: &Args,
    out: &mut OutSink,
    recvbuf: &mut [u8; RECV_BUF_SIZE],
) {
    let msg = match session.control.read_message(recvbuf) {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            // Kernel closed the channel; treat like an exit request.
            session.cleanup_and_exit(false);
        }
        Err(e) => {
            error!("control channel read failed: {e}");
            session.cleanup_and_exit(false);
        }
    };
    let data = control::payload(recvbuf, &msg);

    if session.transport == TransportMode::Unset
        && msg.kind != STP_TRANSPORT_INFO
        && msg.kind != STP_EXIT
    {
        warn!("invalid command: no transport");
        return;
    }

    match msg.kind {
        STP_REALTIME_DATA => {
            if let Err(e) = out.write_all(data) {
                error!("couldn't write realtime data: {e}");
                session.cleanup_and_exit(false);
            }
        }
        STP_OOB_DATA => {
            let _ = std::io::stderr().write_all(data);
        }
        STP_EXIT => {
            // The module asks us to unload it and exit.
            let closed = TransportExit::from_bytes(data).map_or(0, |e| e.closed);
            session.cleanup_and_exit(closed != 0);
        }
        STP_START => {
            let pid = TransportStart::from_bytes(data).map_or(-1, |t| t.pid);
            debug!("probe_start() returned {pid}");
            if pid < 0 {
                if let Some(target) = session.target_pid {
                    child::kill_target(target);
                }
                session.cleanup_and_exit(false);
            } else if let Some(target) = session.target_pid {
                child::release_target(target);
            }
        }
        STP_SYSTEM => {
            child::system_cmd(&cstr_payload(data), session.creds);
        }
        STP_TRANSPORT_INFO => {
            let Some(ti) = TransportInfo::from_bytes(data) else {
                warn!("short TRANSPORT_INFO payload, ignored");
                return;
            };
            if !session.set_transport(ti.transport_mode) {
                return;
            }
            if session.transport == TransportMode::Relayfs {
                debug!(
                    "TRANSPORT_INFO recvd: RELAYFS {} bufs of {} bytes, merge={}",
                    ti.n_subbufs, ti.subbuf_size, ti.merge
                );
                if let Err(e) = session.init_relayfs(&ti) {
                    error!("couldn't init relayfs, exiting: {e}");
                    session.cleanup_and_exit(false);
                }
            } else {
                debug!("TRANSPORT_INFO recvd: PROC with {} MB buffers", ti.buf_size);
                if let Some(path) = &args.output {
                    match File::create(path) {
                        Ok(f) => *out = OutSink::File(f),
                        Err(e) => {
                            error!("couldn't open output file {}: {e}", path.display());
                            session.cleanup_and_exit(false);
                        }
                    }
                }
            }
            ack_start(session);
        }
        STP_MODULE => {
            // Transport module loading is the kernel side's business;
            // acknowledge so the session proceeds.
            ack_start(session);
        }
        STP_SYMBOLS => {
            let Some(req) = SymbolRequest::from_bytes(data) else {
                warn!("short SYMBOLS payload, ignored");
                return;
            };
            if req.endian != SYMBOL_ENDIAN_TAG {
                error!("daemon is compiled with different endianness than the kernel");
                session.cleanup_and_exit(false);
            }
            if req.ptr_size as usize != std::mem::size_of::<usize>() {
                error!(
                    "daemon is compiled with {}-bit pointers and the kernel uses {}-bit",
                    8 * std::mem::size_of::<usize>(),
                    8 * req.ptr_size
                );
                session.cleanup_and_exit(false);
            }
            ack_start(session);
        }
        other => warn!("ignored message of type {other}"),
    }
}

fn ack_start(session: &mut RelaySession) {
    let ts = TransportStart { pid: std::process::id() as i32 };
    if session.control.send_request(STP_START, ts.as_bytes()).is_err() {
        error!("couldn't acknowledge transport start");
        session.cleanup_and_exit(false);
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let mut session = RelaySession::init(args).context("session initialization failed")?;

    // Signals are blocked and surfaced through a signalfd so the poll
    // loop below is the only place they do work.
    let mut mask = SigSet::empty();
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP, Signal::SIGCHLD, Signal::SIGALRM]
    {
        mask.add(sig);
    }
    mask.thread_block().context("blocking signals")?;
    let mut sfd =
        SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC).context("creating signalfd")?;

    if args.driver_pid != 0 && !child::driver_alive(args.driver_pid) {
        send_exit(&session);
    }

    let mut out = OutSink::Stdout;
    let mut recvbuf = [0u8; RECV_BUF_SIZE];

    debug!("in main loop");
    loop {
        // SAFETY: both fds stay open for the session's lifetime; the
        // borrows last only for this poll call.
        let control_fd = unsafe { BorrowedFd::borrow_raw(session.control.raw_fd()) };
        let sfd_fd = unsafe { BorrowedFd::borrow_raw(sfd.as_raw_fd()) };
        let mut fds = [
            PollFd::new(control_fd, PollFlags::POLLIN),
            PollFd::new(sfd_fd, PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("poll error: {e}");
                session.cleanup_and_exit(false);
            }
        }
        let control_ready = fds[0].revents().is_some_and(|r| !r.is_empty());
        let signal_ready = fds[1].revents().is_some_and(|r| r.contains(PollFlags::POLLIN));

        if signal_ready {
            handle_signal(&mut session, &mut sfd, args);
        }
        if control_ready {
            handle_message(&mut session, args, &mut out, &mut recvbuf);
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    run(&args)
}
