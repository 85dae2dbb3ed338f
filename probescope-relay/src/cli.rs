//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "probescope-relay", about = "Load a probe module and pump its trace output")]
pub struct Args {
    /// Path to the compiled probe module (.ko)
    pub module: PathBuf,

    /// Extra module options passed through to insmod
    #[arg(trailing_var_arg = true)]
    pub modoptions: Vec<String>,

    /// Output file; defaults to stdout (streaming) or probe.out (merge)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Requested buffer size in MB (streaming transport)
    #[arg(short = 'b', long = "buffer-size", default_value_t = 0)]
    pub buffer_size: u32,

    /// Command to spawn and trace; held until probes are armed
    #[arg(short = 'c', long = "command")]
    pub command: Option<String>,

    /// Already-running pid to hand to the module as the target
    #[arg(short = 't', long = "target-pid", default_value_t = 0)]
    pub target_pid: i32,

    /// Watched driver pid; its disappearance ends the session
    #[arg(short = 'd', long = "driver-pid", default_value_t = 0)]
    pub driver_pid: i32,

    /// Merge per-CPU output into one timestamp-ordered stream at shutdown,
    /// even when the module does not ask for it
    #[arg(short = 'm', long)]
    pub merge: bool,

    /// Print summary statistics at shutdown
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress echoing merged output to stdout
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Echo to stdout only; do not write the output file
    #[arg(short = 'p', long = "print-only")]
    pub print_only: bool,
}
