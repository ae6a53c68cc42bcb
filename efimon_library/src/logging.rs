use crate::transaction::TransactionId;
use anyhow::Result;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, registry::Registry, Layer};

#[derive(Debug, serde::Serialize, serde::Deserialize, Default, Clone)]
/// Details about how/where to log to
pub struct LoggingConfig {
    /// the min log level
    /// see [tracing_subscriber::filter::Builder::parse()]
    pub level: String,
    /// Directory to store logs in, formatted as JSON.
    /// When empty no file logging is set up.
    pub directory: String,
    /// log filename start string
    pub basename: String,
    /// Additionally write logs to stdout.
    #[serde(default)]
    pub stdout: Option<bool>,
}

fn panic_hook() {
    std::panic::set_hook(Box::new(move |info| {
        println!("!!Thread panicked!!");
        let backtrace = std::backtrace::Backtrace::force_capture();
        let thread = std::thread::current();
        let thread = thread.name().unwrap_or("<unnamed>");

        let msg = match info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match info.payload().downcast_ref::<String>() {
                Some(s) => &**s,
                None => "Box<Any>",
            },
        };

        match info.location() {
            Some(location) => {
                tracing::error!(
                    target: "panic", "thread '{}' panicked at '{}': {}:{}{:?}",
                    thread,
                    msg,
                    location.file(),
                    location.line(),
                    backtrace
                );
            },
            None => tracing::error!(
                target: "panic",
                "thread '{}' panicked at '{}'{:?}",
                thread,
                msg,
                backtrace
            ),
        }
    }));
}

#[allow(dyn_drop)]
fn file_logger<S, P: AsRef<Path>>(
    folder_path: P,
    base_filename: &str,
    tid: &TransactionId,
) -> Result<(Box<dyn Layer<S> + Send + Sync + 'static>, Box<dyn Drop + Send>)>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let fname = format!("{}.log", base_filename);
    let dir = match std::fs::canonicalize(&folder_path) {
        Ok(d) => d,
        Err(e) => match e.kind() {
            ErrorKind::NotFound => {
                info!(tid = tid, "making log dir");
                std::fs::create_dir_all(&folder_path)?;
                std::fs::canonicalize(&folder_path)?
            },
            _ => anyhow::bail!(
                "Failed to canonicalize log file '{:?}', error: '{}'",
                folder_path.as_ref().to_str(),
                e
            ),
        },
    };

    let full_path = dir.join(&fname);
    println!("Logging to {}", full_path.to_string_lossy());

    let appender = tracing_appender::rolling::never(dir, fname);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let layer = tracing_subscriber::fmt::Layer::default()
        .with_writer(file_writer)
        .json();
    Ok((layer.boxed(), Box::new(guard)))
}

/// Install the global tracing subscriber from the given configuration.
/// The returned guards must be kept alive for the duration of the program.
pub fn start_tracing(config: &LoggingConfig, tid: &TransactionId) -> Result<impl Drop> {
    #[allow(dyn_drop)]
    let mut drops: Vec<Box<dyn Drop + Send>> = vec![];
    let mut layers = vec![];
    if !config.directory.is_empty() {
        let (file_layer, guard) = file_logger(&config.directory, &config.basename, tid)?;
        drops.push(guard);
        layers.push(file_layer);
    };

    if config.stdout.unwrap_or(false) {
        let (stdout, guard) = tracing_appender::non_blocking(std::io::stdout());
        drops.push(Box::new(guard));
        layers.push(
            tracing_subscriber::fmt::Layer::default()
                .with_writer(stdout)
                .compact()
                .boxed(),
        );
    }

    let subscriber = Registry::default()
        .with(EnvFilter::builder().parse(&config.level)?)
        .with(layers);
    match tracing::subscriber::set_global_default(subscriber) {
        Ok(_) => {
            panic_hook();
            info!(tid = tid, "Logger initialized");
            Ok(drops)
        },
        Err(e) => {
            warn!(tid=tid, error=%e, "Global tracing subscriber was already set");
            Ok(vec![])
        },
    }
}
