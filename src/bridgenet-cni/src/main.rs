//! Bridgenet CNI Plugin
//!
//! Invoked by the container runtime with `CNI_*` variables in the
//! environment and the network config on stdin.

use std::io::{self, Write};

use bridgenet_cni::cmd::{self, CniArgs, Command};
use bridgenet_cni::logging;
use bridgenet_cni::plumbing::KernelPlumbing;
use bridgenet_cni::CniError;

fn main() {
    logging::init("info");

    if let Err(e) = run() {
        tracing::error!(code = e.code() as u32, error = %e, "command failed");
        // The runtime reads errors from stdout, like results
        let mut stdout = io::stdout();
        let _ = writeln!(stdout, "{}", cmd::error_json(&e));
        let _ = stdout.flush();
        std::process::exit(1);
    }
}

fn run() -> Result<(), CniError> {
    let args = CniArgs::from_env()?;

    let input = match args.command {
        Command::Version => String::new(),
        _ => cmd::read_stdin()?,
    };

    let mut stdout = io::stdout().lock();
    cmd::dispatch(&args, &input, &KernelPlumbing, &mut stdout)?;
    stdout
        .flush()
        .map_err(|e| CniError::io_error("failed to flush stdout").with_details(&e.to_string()))
}
