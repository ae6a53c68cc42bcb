use clap::Parser;

/// Wrapper tool that spawns or attaches to a target process and drives the
/// EfiMon daemon over its control socket.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Number of samples to collect; omit to sample until the process finishes
    #[arg(short, long)]
    pub samples: Option<u64>,

    /// Sampling frequency in Hz for the instruction profiler
    #[arg(short, long, default_value_t = 100)]
    pub frequency: u64,

    /// Sampling time window in seconds
    #[arg(short, long, default_value_t = 3)]
    pub delay: u64,

    /// Daemon socket port for IPC
    #[arg(short, long, default_value_t = 5550)]
    pub port: u16,

    /// Enable the instruction profiler for the worker
    #[arg(long, action)]
    pub perf: bool,

    /// PID to attach to
    #[arg(long, visible_alias = "target-pid", conflicts_with = "command")]
    pub pid: Option<u32>,

    /// Command to execute; this option must be at the end of the launcher
    /// command line
    #[arg(short, long, num_args = 1.., allow_hyphen_values = true, trailing_var_arg = true)]
    pub command: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn defaults_match_the_launcher_contract() {
        let args = Args::parse_from(["efimon-launcher", "--pid", "42"]);
        assert_eq!(args.samples, None);
        assert_eq!(args.frequency, 100);
        assert_eq!(args.delay, 3);
        assert_eq!(args.port, 5550);
        assert!(!args.perf);
        assert_eq!(args.pid, Some(42));
    }

    #[rstest]
    fn command_swallows_the_tail() {
        let args = Args::parse_from(["efimon-launcher", "-d", "1", "-c", "stress", "--cpu", "4"]);
        assert_eq!(
            args.command,
            Some(vec!["stress".to_string(), "--cpu".to_string(), "4".to_string()])
        );
        assert_eq!(args.delay, 1);
    }

    #[rstest]
    fn pid_and_command_are_mutually_exclusive() {
        let result = Args::try_parse_from(["efimon-launcher", "--pid", "42", "-c", "stress"]);
        assert!(result.is_err());
    }
}
