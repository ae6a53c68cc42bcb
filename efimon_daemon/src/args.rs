use clap::Parser;

/// Daemon listener for measuring external applications.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Number of samples to collect when a request does not override it
    #[arg(short, long, default_value_t = 100)]
    pub samples: u32,

    /// Output folder to save measurements
    #[arg(short, long, default_value = "/tmp")]
    pub output_folder: String,

    /// Sampling frequency in Hz for the instruction profiler
    #[arg(short, long, default_value_t = 100)]
    pub frequency: u64,

    /// Sampling time window in seconds
    #[arg(short, long, default_value_t = 3)]
    pub delay: u64,

    /// Socket port for IPC
    #[arg(short, long, default_value_t = 5550)]
    pub port: u16,
}
