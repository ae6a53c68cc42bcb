use analyser::EfimonAnalyser;
use anyhow::Result;
use args::Args;
use clap::Parser;
use efimon_library::logging::{start_tracing, LoggingConfig};
use efimon_library::protocol::{Reply, Request};
use efimon_library::status::{Status, StatusCode};
use efimon_library::transaction::{TransactionId, DAEMON_TID};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub mod analyser;
pub mod args;
pub mod worker;

static LOG_COUNTER: AtomicU32 = AtomicU32::new(0);

fn print_welcome() {
    println!("-----------------------------------------------------------");
    println!("               EfiMon Daemon Application");
    println!("-----------------------------------------------------------");
}

fn create_monitoring_file(path: &str, pid: u32) -> String {
    let counter = LOG_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{}/efimon-{}-{}.csv", path, pid, counter)
}

fn handle_request(request: Request, analyser: &Arc<EfimonAnalyser>, args: &Args) -> Reply {
    match request {
        Request::System { state, delay } => {
            info!(state = state, "Setting System Monitor");
            let result = if state {
                analyser.start_system(delay.unwrap_or(args.delay))
            } else {
                analyser.stop_system()
            };
            match result {
                Ok(()) => Reply::from_status(&Status::ok()),
                Err(e) => Reply::from_status(&e),
            }
        },
        Request::Process {
            state,
            pid,
            delay,
            samples,
            perf,
            frequency,
            name,
        } => {
            let delay = delay.unwrap_or(args.delay);
            let name = name.unwrap_or_else(|| create_monitoring_file(&args.output_folder, pid));
            info!(pid = pid, state = state, delay = delay, "Setting Process Monitor");

            // A missing or non-positive budget means sampling until stopped.
            let samples = samples.filter(|s| *s > 0).map(|s| s as u64);
            let result = if state {
                analyser.start_worker(
                    &name,
                    pid,
                    delay,
                    samples,
                    perf.unwrap_or(false),
                    frequency.unwrap_or(args.frequency),
                )
            } else {
                analyser.stop_worker(pid)
            };
            let mut reply = match result {
                Ok(()) => Reply::from_status(&Status::ok()),
                Err(e) => Reply::from_status(&e),
            };
            reply.name = Some(name);
            reply
        },
        Request::Poll { pid } => Reply::from_status(&analyser.check_worker(pid)),
    }
}

async fn serve(listener: TcpListener, analyser: Arc<EfimonAnalyser>, args: Args) -> Result<()> {
    let tid: &TransactionId = &DAEMON_TID;
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(tid = tid, peer = %peer, "Client connected");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let reply = match serde_json::from_str::<Request>(&line) {
                Ok(request) => handle_request(request, &analyser, &args),
                Err(e) => {
                    warn!(tid = tid, error = %e, payload = %line, "Cannot parse the request");
                    Reply::from_status(&Status::new(StatusCode::InvalidParameter, "Invalid set of params"))
                },
            };
            let worker_state = reply.code == StatusCode::Running as i32 || reply.code == StatusCode::Stopped as i32;
            if reply.code != StatusCode::Ok as i32 && !worker_state {
                warn!(tid = tid, code = reply.code, result = %reply.result, "Request completed with an error");
            }
            let mut payload = serde_json::to_string(&reply)?;
            payload.push('\n');
            if let Err(e) = write_half.write_all(payload.as_bytes()).await {
                warn!(tid = tid, error = %e, "Cannot reply to the client");
                break;
            }
        }
        info!(tid = tid, peer = %peer, "Client disconnected");
    }
}

fn main() -> Result<()> {
    print_welcome();
    let tid: &TransactionId = &DAEMON_TID;
    let args = Args::parse();

    let log_config = LoggingConfig {
        level: "info".to_string(),
        directory: "".to_string(),
        basename: "efimon-daemon".to_string(),
        stdout: Some(true),
    };
    let _guard = start_tracing(&log_config, tid)?;

    info!(tid = tid, frequency_hz = args.frequency, "Frequency");
    info!(tid = tid, samples = args.samples, "Samples");
    info!(tid = tid, delay_secs = args.delay, "Delay time");
    info!(tid = tid, output = %args.output_folder, "Output folder");
    info!(tid = tid, port = args.port, "IPC TCP Port");

    let analyser = EfimonAnalyser::new(tid)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let result = runtime.block_on(async {
        let endpoint = format!("0.0.0.0:{}", args.port);
        info!(tid = tid, endpoint = %endpoint, "Listening for control requests");
        let listener = TcpListener::bind(&endpoint).await?;
        tokio::select! {
            res = serve(listener, analyser.clone(), args) => res,
            _ = tokio::signal::ctrl_c() => {
                info!(tid = tid, "Termination signal received");
                Ok(())
            },
        }
    });

    analyser.shutdown();
    result
}
