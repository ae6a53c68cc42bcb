use crate::status::{EfiResult, Status, StatusCode};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};

/// Which of the child's output streams get captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    /// Discard everything.
    #[default]
    Silent,
    Stdout,
    Stderr,
    Both,
}

/// Forks a child command with chosen stdio capture and tracks its lifetime.
#[derive(Default)]
pub struct ProcessManager {
    mode: CaptureMode,
    child: Option<Child>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr: Option<BufReader<ChildStderr>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        ProcessManager::default()
    }

    /// Spawn `cmd` with the requested file-descriptor plumbing. `args`
    /// includes the command itself when non-empty, mirroring an argv slice.
    pub fn open(&mut self, cmd: &str, args: &[String], mode: CaptureMode) -> EfiResult<()> {
        let mut command = Command::new(cmd);
        if !args.is_empty() {
            command.args(&args[1..]);
        }

        match mode {
            CaptureMode::Silent => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            },
            CaptureMode::Stdout => {
                command.stdout(Stdio::piped()).stderr(Stdio::null());
            },
            CaptureMode::Stderr => {
                command.stdout(Stdio::null()).stderr(Stdio::piped());
            },
            CaptureMode::Both => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            },
        }

        let mut child = command
            .spawn()
            .map_err(|e| Status::new(StatusCode::LoggerCannotOpen, format!("Cannot open the process: {}", e)))?;

        self.stdout = child.stdout.take().map(BufReader::new);
        self.stderr = child.stderr.take().map(BufReader::new);
        self.child = Some(child);
        self.mode = mode;
        Ok(())
    }

    /// Drain the captured output until EOF, or read a single line when
    /// `single_line` is set, forwarding each line to `sink` or standard error.
    pub fn sync(&mut self, single_line: bool, mut sink: Option<&mut dyn Write>) -> EfiResult<()> {
        if self.child.is_none() {
            return Err(Status::new(StatusCode::FileError, "Cannot access the process"));
        }

        let mode = self.mode;
        let mut forward = |line: &str| {
            if mode == CaptureMode::Silent {
                return;
            }
            match sink.as_deref_mut() {
                Some(out) => {
                    let _ = writeln!(out, "{}", line);
                },
                None => eprintln!("{}", line),
            }
        };

        if let Some(reader) = self.stdout.as_mut() {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => forward(line.trim_end_matches('\n')),
                }
                if single_line {
                    return Ok(());
                }
            }
        }
        if let Some(reader) = self.stderr.as_mut() {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => forward(line.trim_end_matches('\n')),
                }
                if single_line {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// PID of the spawned child, zero when nothing is open.
    pub fn pid(&self) -> u32 {
        self.child.as_ref().map(|c| c.id()).unwrap_or(0)
    }

    /// Non-blocking liveness check; drains one captured line as a side
    /// effect so a chatty child cannot stall on a full pipe.
    pub fn is_running(&mut self) -> bool {
        let _ = self.sync(true, None);
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stop reading and reap the child.
    pub fn close(&mut self) -> EfiResult<()> {
        self.stdout = None;
        self.stderr = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.wait();
        }
        Ok(())
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
