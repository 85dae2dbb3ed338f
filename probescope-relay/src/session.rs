//! Session state for one loaded probe module
//!
//! A `RelaySession` owns everything acquired for the module's lifetime:
//! the control channel, the traced child, the per-CPU channels and their
//! reader threads. It is constructed once in `init` and passed by
//! reference everywhere; cleanup is guarded so two exits in one process
//! cannot double-free the kernel side.

use crate::child::{self, CmdCreds};
use crate::cli::Args;
use crate::control::ControlChannel;
use crate::error::RelayError;
use crate::merge::{self, DEFAULT_OUTFILE_NAME};
use crate::relay::{percpu_tmpfile, BufStatus, CpuChannel, RelayParams};
use log::{debug, error, info, warn};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use probescope_common::{TransportInfo, TransportMode, NR_CPUS, STP_TRANSPORT_INFO};
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct RelaySession {
    pub modname: String,
    pub proc_dir: String,
    pub control: ControlChannel,
    pub creds: CmdCreds,
    /// Pid of the traced `-c` child, if one was forked.
    pub target_pid: Option<Pid>,
    pub transport: TransportMode,
    params: Option<RelayParams>,
    workers: Vec<JoinHandle<BufStatus>>,
    stop: Arc<AtomicBool>,
    ncpus: usize,
    exiting: bool,
    relay_initialized: bool,

    // Output policy captured from the command line.
    pub verbose: bool,
    quiet: bool,
    print_only: bool,
    force_merge: bool,
    outfile: Option<PathBuf>,
}

fn online_cpus() -> usize {
    // SAFETY: plain sysconf query.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    let n = if n <= 0 { 1 } else { n as usize };
    n.min(NR_CPUS)
}

/// The proc directory is named after the module, up to its first dot.
fn module_basename(path: &std::path::Path) -> String {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    match name.split_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => name,
    }
}

fn rmmod(modname: &str) -> bool {
    match Command::new("/sbin/rmmod").arg("-w").arg(modname).status() {
        Ok(status) if status.success() => true,
        _ => {
            error!("couldn't rmmod probe module {modname}");
            false
        }
    }
}

impl RelaySession {
    /// Inserts the module, opens the control channel, forks the traced
    /// child, and requests transport. On failure everything acquired so
    /// far is unwound, including the inserted module.
    pub fn init(args: &Args) -> Result<Self, RelayError> {
        let modname = module_basename(&args.module);
        let my_pid = std::process::id();

        let status = Command::new("/sbin/insmod")
            .arg(&args.module)
            .arg(format!("_stp_pid={my_pid}"))
            .args(&args.modoptions)
            .status()?;
        if !status.success() {
            return Err(RelayError::Insmod(args.module.display().to_string()));
        }

        let proc_dir = format!("/proc/{modname}");
        let control = match ControlChannel::open(&proc_dir) {
            Ok(c) => c,
            Err(e) => {
                rmmod(&modname);
                return Err(e);
            }
        };

        let creds = CmdCreds::current();
        let target_pid = match &args.command {
            Some(cmd) => match child::start_target(cmd, creds) {
                Ok(pid) => Some(pid),
                Err(e) => {
                    rmmod(&modname);
                    return Err(e);
                }
            },
            None => None,
        };

        let ti = TransportInfo {
            buf_size: args.buffer_size,
            target: target_pid.map_or(args.target_pid, Pid::as_raw),
            merge: i32::from(args.merge),
            ..TransportInfo::default()
        };
        if control.send_request(STP_TRANSPORT_INFO, ti.as_bytes()).is_err() {
            if let Some(pid) = target_pid {
                child::kill_target(pid);
            }
            rmmod(&modname);
            return Err(RelayError::TransportInfo);
        }

        Ok(RelaySession {
            modname,
            proc_dir,
            control,
            creds,
            target_pid,
            transport: TransportMode::Unset,
            params: None,
            workers: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            ncpus: online_cpus(),
            exiting: false,
            relay_initialized: false,
            verbose: args.verbose > 0,
            quiet: args.quiet,
            print_only: args.print_only,
            force_merge: args.merge,
            outfile: args.output.clone(),
        })
    }

    /// Records the transport the kernel selected. Set exactly once; a
    /// repeated announcement is ignored with a warning.
    pub fn set_transport(&mut self, raw_mode: i32) -> bool {
        if self.transport != TransportMode::Unset {
            warn!("duplicate TRANSPORT_INFO ignored");
            return false;
        }
        self.transport = TransportMode::from_raw(raw_mode);
        true
    }

    /// Opens every per-CPU channel and starts one reader thread each.
    /// Partial failures roll back completely before reporting.
    pub fn init_relayfs(&mut self, ti: &TransportInfo) -> Result<(), RelayError> {
        debug!("initializing relayfs");
        let params = RelayParams {
            subbuf_size: ti.subbuf_size as usize,
            n_subbufs: ti.n_subbufs as usize,
            merge: ti.merge != 0 || self.force_merge,
        };
        let filebase = crate::relay::relay_filebase(std::process::id());

        let mut channels = Vec::with_capacity(self.ncpus);
        for cpu in 0..self.ncpus {
            match CpuChannel::open(cpu, &filebase, &self.proc_dir, params) {
                Ok(chan) => channels.push(chan),
                Err(e) => {
                    // Channels drop in reverse order, unmapping and
                    // closing what was opened so far.
                    error!("couldn't open relayfs files, cpu = {cpu}");
                    return Err(e);
                }
            }
        }

        for (cpu, chan) in channels.into_iter().enumerate() {
            let stop = Arc::clone(&self.stop);
            let spawned = std::thread::Builder::new()
                .name(format!("relay-cpu{cpu}"))
                .spawn(move || chan.run(&stop));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(source) => {
                    error!("couldn't create reader thread, cpu = {cpu}");
                    self.stop.store(true, Ordering::Relaxed);
                    let _ = self.join_workers();
                    return Err(RelayError::SpawnReader { cpu, source });
                }
            }
        }

        if self.verbose {
            info!(
                "using channel with {} sub-buffers of size {}",
                params.n_subbufs, params.subbuf_size
            );
        }
        self.params = Some(params);
        self.relay_initialized = true;
        Ok(())
    }

    fn join_workers(&mut self) -> Vec<BufStatus> {
        let mut statuses = Vec::with_capacity(self.workers.len());
        for handle in self.workers.drain(..) {
            match handle.join() {
                Ok(status) => statuses.push(status),
                Err(_) => warn!("reader thread panicked"),
            }
        }
        statuses
    }

    fn summarize(&self, statuses: &[BufStatus]) {
        if self.transport != TransportMode::Relayfs {
            return;
        }
        println!("summary:");
        for status in statuses {
            println!("cpu {}:", status.info.cpu);
            println!("    {} sub-buffers processed", status.info.consumed);
            println!("    {} max backlog", status.max_backlog);
        }
    }

    /// Orderly shutdown: reap children, stop and join the readers, merge
    /// if requested, and unload the module unless it already closed
    /// itself. Runs at most once per process.
    pub fn cleanup_and_exit(&mut self, closed: bool) -> ! {
        if self.exiting {
            // A second caller lost the race; the first exit is underway.
            std::process::exit(0);
        }
        self.exiting = true;
        debug!("cleanup and exit, closed={closed} mode={:?}", self.transport);

        // Reap whatever already exited, then wait out the rest of our
        // children before tearing the transport down.
        let any = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG));
        if any.is_ok() {
            info!("waiting for processes to exit");
        }
        while waitpid(Pid::from_raw(-1), None).is_ok() {}

        let statuses = if self.relay_initialized {
            self.stop.store(true, Ordering::Relaxed);
            self.join_workers()
        } else {
            Vec::new()
        };

        if self.verbose {
            self.summarize(&statuses);
        }

        let mut failed = false;
        if self.relay_initialized {
            if let Some(params) = self.params {
                if params.merge {
                    let tmp_paths: Vec<PathBuf> =
                        (0..self.ncpus).map(percpu_tmpfile).collect();
                    let outfile = self
                        .outfile
                        .clone()
                        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTFILE_NAME));
                    match merge::merge_output(
                        &tmp_paths,
                        &outfile,
                        self.quiet,
                        self.print_only,
                    ) {
                        Ok(_) => merge::delete_percpu_files(&tmp_paths),
                        Err(e) => {
                            error!("merge failed: {e}");
                            failed = true;
                        }
                    }
                }
            }
        }

        debug!("closing control channel");
        // The control channel and any remaining per-CPU resources close
        // on drop, in reverse order of acquisition.

        if !closed && !rmmod(&self.modname) {
            error!("no output will be written");
            std::process::exit(1);
        }
        std::process::exit(i32::from(failed));
    }
}
