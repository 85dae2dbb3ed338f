//! Child processes: the traced target, shell commands, driver watchdog
//!
//! The target command is forked before probes are armed, with SIGUSR1
//! blocked; the child drops to the command credentials and parks in
//! sigwait until the module reports a successful start, so no part of the
//! command ever runs untraced.

use crate::error::RelayError;
use log::{debug, warn};
use nix::sys::signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::unistd::{alarm, execv, fork, setresgid, setresuid, ForkResult, Gid, Pid, Uid};
use std::ffi::CString;

/// Credentials external commands run under.
#[derive(Debug, Clone, Copy)]
pub struct CmdCreds {
    pub uid: Uid,
    pub gid: Gid,
}

impl CmdCreds {
    #[must_use]
    pub fn current() -> Self {
        CmdCreds { uid: Uid::current(), gid: Gid::current() }
    }
}

fn drop_to(creds: CmdCreds) {
    if let Err(e) = setresgid(creds.gid, creds.gid, creds.gid) {
        warn!("setresgid: {e}");
    }
    if let Err(e) = setresuid(creds.uid, creds.uid, creds.uid) {
        warn!("setresuid: {e}");
    }
}

fn shell_argv(cmd: &str) -> Vec<CString> {
    // An interior NUL cannot make a runnable command; exec an empty one
    // and let the shell fail loudly.
    let cmd = CString::new(cmd).unwrap_or_else(|_| c"".into());
    vec![c"sh".into(), c"-c".into(), cmd]
}

/// Forks the traced command. The child blocks in sigwait for SIGUSR1 and
/// only then execs, guaranteeing tracing is armed before it runs. Returns
/// the child's pid; deliver SIGUSR1 via [`release_target`] once the module
/// reports a good start.
pub fn start_target(cmd: &str, creds: CmdCreds) -> Result<Pid, RelayError> {
    let mut usrset = SigSet::empty();
    usrset.add(Signal::SIGUSR1);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&usrset), None)
        .map_err(|e| RelayError::Sys("sigprocmask", e))?;

    debug!("execing target command {cmd}");
    // SAFETY: the child only calls async-signal-safe operations before
    // exec (credential changes, sigwait, execv).
    match unsafe { fork() }.map_err(|e| RelayError::Sys("fork", e))? {
        ForkResult::Child => {
            drop_to(creds);
            // Parked here until the session is armed.
            let _ = usrset.wait();
            let argv = shell_argv(cmd);
            let _ = execv(c"/bin/sh", &argv);
            std::process::exit(1);
        }
        ForkResult::Parent { child } => Ok(child),
    }
}

/// Lets a parked target child exec its command.
pub fn release_target(target: Pid) {
    if let Err(e) = kill(target, Signal::SIGUSR1) {
        warn!("couldn't release target child: {e}");
    }
}

pub fn kill_target(target: Pid) {
    let _ = kill(target, Signal::SIGKILL);
}

/// Runs a shell command on the module's behalf under the command
/// credentials. The exit status is collected by the SIGCHLD reaper.
pub fn system_cmd(cmd: &str, creds: CmdCreds) {
    debug!("system {cmd}");
    // SAFETY: as in start_target.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop_to(creds);
            let argv = shell_argv(cmd);
            let _ = execv(c"/bin/sh", &argv);
            std::process::exit(1);
        }
        Ok(ForkResult::Parent { .. }) => {}
        Err(e) => warn!("fork: {e}"),
    }
}

/// Watchdog interval for the driver process.
const DRIVER_POLL_SECS: u32 = 10;

/// Checks the watched driver pid. Returns false when it is gone, in which
/// case the caller ends the session; otherwise the alarm is re-armed.
#[must_use]
pub fn driver_alive(driver_pid: i32) -> bool {
    if kill(Pid::from_raw(driver_pid), None).is_err() {
        return false;
    }
    alarm::set(DRIVER_POLL_SECS);
    true
}
