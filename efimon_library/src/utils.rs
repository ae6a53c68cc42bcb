use crate::bail_error;
use crate::transaction::TransactionId;
use anyhow::Result;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use tracing::debug;

fn prepare_cmd<S, S2, I>(cmd: &S, args: I, cwd: Option<&Path>, tid: &TransactionId) -> Result<Command>
where
    I: IntoIterator<Item = S2> + std::fmt::Debug,
    S2: AsRef<std::ffi::OsStr> + std::fmt::Debug,
    S: AsRef<std::ffi::OsStr> + std::fmt::Display + ?Sized,
{
    debug!(tid=tid, command=%cmd, args=?args, cwd=?cwd, "executing host command");
    let mut command = Command::new(cmd);
    command.args(args);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    Ok(command)
}

/// Executes the specified executable with args, capturing stdout and stderr.
pub fn execute_cmd<S, S2, I>(cmd: &S, args: I, cwd: Option<&Path>, tid: &TransactionId) -> Result<Output>
where
    I: IntoIterator<Item = S2> + std::fmt::Debug,
    S2: AsRef<std::ffi::OsStr> + std::fmt::Debug,
    S: AsRef<std::ffi::OsStr> + std::fmt::Display + ?Sized,
{
    let mut command = prepare_cmd(cmd, args, cwd, tid)?;
    match command.output() {
        Ok(out) => Ok(out),
        Err(e) => bail_error!(tid=tid, command=%cmd, error=%e, "Running command failed"),
    }
}

/// Executes the specified executable with args.
/// Raises an error if the exit code isn't `0`.
pub fn execute_cmd_checked<S, S2, I>(cmd: &S, args: I, cwd: Option<&Path>, tid: &TransactionId) -> Result<Output>
where
    I: IntoIterator<Item = S2> + std::fmt::Debug,
    S2: AsRef<std::ffi::OsStr> + std::fmt::Debug,
    S: AsRef<std::ffi::OsStr> + std::fmt::Display + ?Sized,
{
    match execute_cmd(cmd, args, cwd, tid) {
        Ok(out) => match out.status.success() {
            true => Ok(out),
            false => {
                bail_error!(tid=tid, exe=%cmd, stdout=%String::from_utf8_lossy(&out.stdout), stderr=%String::from_utf8_lossy(&out.stderr), code=out.status.code(), "Bad error code executing command")
            },
        },
        Err(e) => Err(e),
    }
}

/// Spawn the specified executable without waiting for it.
/// All std* pipes are sent to null.
pub fn execute_cmd_nonblocking<S, S2, I>(cmd: &S, args: I, cwd: Option<&Path>, tid: &TransactionId) -> Result<Child>
where
    I: IntoIterator<Item = S2> + std::fmt::Debug,
    S2: AsRef<std::ffi::OsStr> + std::fmt::Debug,
    S: AsRef<std::ffi::OsStr> + std::fmt::Display + ?Sized,
{
    let mut command = prepare_cmd(cmd, args, cwd, tid)?;
    command.stdout(Stdio::null()).stdin(Stdio::null()).stderr(Stdio::null());
    match command.spawn() {
        Ok(child) => Ok(child),
        Err(e) => {
            bail_error!(tid=tid, command=%cmd, error=%e, "Spawning non-blocking command failed")
        },
    }
}

/// Run a shell pipeline, capturing stdout.
/// Only used for commands whose contract is a pipeline (e.g. sensor filters).
pub fn execute_shell(pipeline: &str, cwd: Option<&Path>, tid: &TransactionId) -> Result<Output> {
    execute_cmd("sh", ["-c", pipeline], cwd, tid)
}
