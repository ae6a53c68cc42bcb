use anyhow::{bail, Context, Result};
use args::Args;
use clap::Parser;
use efimon_library::logging::{start_tracing, LoggingConfig};
use efimon_library::process_manager::{CaptureMode, ProcessManager};
use efimon_library::protocol::{Reply, Request};
use efimon_library::status::StatusCode;
use efimon_library::transaction::{TransactionId, LAUNCHER_TID};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

pub mod args;

/// Poll cadence of the spawn supervisor thread.
const THREAD_CHECK_TIME: Duration = Duration::from_millis(10);
/// How long to wait for the spawn thread to surface the child pid.
const THREAD_STARTUP_TIME: Duration = Duration::from_secs(1);

fn print_welcome() {
    println!("-----------------------------------------------------------");
    println!("               EfiMon Launcher Application");
    println!("-----------------------------------------------------------");
}

/// Shared state between the main task and the spawn supervisor thread.
struct SpawnState {
    manager: Mutex<ProcessManager>,
    started: Condvar,
    close: AtomicBool,
    terminated: AtomicBool,
}

/// Supervises the spawned child: opens it, then waits until it exits or a
/// close is requested.
fn launch_command(state: Arc<SpawnState>, command: Vec<String>) {
    {
        let mut manager = state.manager.lock();
        let result = manager.open(&command[0], &command, CaptureMode::Silent);
        if result.is_err() {
            state.terminated.store(true, Ordering::Relaxed);
            state.started.notify_one();
            return;
        }
    }
    state.started.notify_one();

    loop {
        if !state.manager.lock().is_running() {
            state.terminated.store(true, Ordering::Relaxed);
            break;
        }
        std::thread::sleep(THREAD_CHECK_TIME);
        if state.close.load(Ordering::Relaxed) {
            break;
        }
    }
    let _ = state.manager.lock().close();
}

/// Line-delimited JSON request/reply over the daemon socket.
struct DaemonClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl DaemonClient {
    async fn connect(port: u16) -> Result<Self> {
        let endpoint = format!("localhost:{}", port);
        info!(endpoint = %endpoint, "Connecting to daemon");
        let stream = TcpStream::connect(&endpoint)
            .await
            .with_context(|| format!("Cannot connect to the monitoring daemon at {}", endpoint))?;
        let (read_half, writer) = stream.into_split();
        Ok(DaemonClient {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    async fn transact(&mut self, request: &Request) -> Result<Reply> {
        let mut payload = serde_json::to_string(request)?;
        payload.push('\n');
        self.writer.write_all(payload.as_bytes()).await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            bail!("The daemon closed the control socket");
        }
        Ok(serde_json::from_str(&line)?)
    }
}

fn process_request(args: &Args, pid: u32, state: bool) -> Request {
    Request::Process {
        state,
        pid,
        delay: Some(args.delay),
        samples: args.samples.map(|s| s as i64),
        perf: Some(args.perf),
        frequency: Some(args.frequency),
        name: None,
    }
}

async fn start_monitor(client: &mut DaemonClient, args: &Args, pid: u32) -> Result<()> {
    let reply = client
        .transact(&Request::System {
            state: true,
            delay: Some(args.delay),
        })
        .await?;
    if reply.code == StatusCode::Ok as i32 {
        info!("System Monitor started");
    } else {
        info!(code = reply.code, "System Monitor could not be started. Probably, it's been started before");
    }

    let reply = client.transact(&process_request(args, pid, true)).await?;
    if reply.code == StatusCode::Ok as i32 {
        info!(name = ?reply.name, "Process Monitor started");
    } else {
        bail!("Process Monitor could not be started: {}", reply.result);
    }
    Ok(())
}

/// Poll the worker; the reply's `result` carries the Status code in decimal.
async fn check_monitor(client: &mut DaemonClient, pid: u32) -> Result<i32> {
    let reply = client.transact(&Request::Poll { pid }).await?;
    if !reply.result.chars().all(|c| c.is_ascii_digit()) {
        warn!(result = %reply.result, "The response when polling is invalid");
        bail!("The response is invalid");
    }
    Ok(reply.result.parse()?)
}

async fn stop_monitor(client: &mut DaemonClient, args: &Args, pid: u32) -> Result<()> {
    let reply = client.transact(&process_request(args, pid, false)).await?;
    if reply.code == StatusCode::Ok as i32 {
        info!("Process Monitor stopped");
    } else {
        info!(code = reply.code, "Process Monitor could not be stopped");
    }
    Ok(())
}

async fn run(args: Args, tid: &TransactionId) -> Result<i32> {
    let state = Arc::new(SpawnState {
        manager: Mutex::new(ProcessManager::new()),
        started: Condvar::new(),
        close: AtomicBool::new(false),
        terminated: AtomicBool::new(false),
    });

    // Either spawn the target or attach to a live pid.
    let mut spawn_thread = None;
    let pid = match (&args.command, args.pid) {
        (Some(command), _) => {
            info!(tid = tid, command = %command[0], "Launching the process");
            let thread_state = state.clone();
            let thread_command = command.clone();
            spawn_thread = Some(std::thread::spawn(move || launch_command(thread_state, thread_command)));
            {
                let mut manager = state.manager.lock();
                let _ = state.started.wait_for(&mut manager, THREAD_STARTUP_TIME);
            }
            if state.terminated.load(Ordering::Relaxed) {
                bail!("The process cannot be monitored. The termination activated early");
            }
            let pid = state.manager.lock().pid();
            info!(tid = tid, pid = pid, "Launched command");
            pid
        },
        (None, Some(pid)) => {
            info!(tid = tid, pid = pid, "Attaching to the listener PID");
            pid
        },
        (None, None) => bail!("Cannot execute without a command or a PID"),
    };

    let mut client = DaemonClient::connect(args.port).await?;
    start_monitor(&mut client, &args, pid).await?;

    // SIGINT flips the close flag; the next loop iteration tears down.
    let close_flag = Arc::new(AtomicBool::new(false));
    {
        let close_flag = close_flag.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Termination signal received");
                close_flag.store(true, Ordering::Relaxed);
            }
        });
    }

    while !state.terminated.load(Ordering::Relaxed) && !close_flag.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_secs(args.delay)).await;

        match check_monitor(&mut client, pid).await {
            Ok(code) if code == StatusCode::Stopped as i32 => {
                info!(tid = tid, "The monitor has completed the number of samples");
                break;
            },
            Ok(_) => {},
            Err(e) => warn!(tid = tid, error = %e, "Cannot poll the monitor"),
        }
    }

    if state.terminated.load(Ordering::Relaxed) {
        info!(tid = tid, "Process stopped normally. Stopping monitor");
    } else {
        info!(tid = tid, "Sending termination signal. Stopping monitor");
        state.close.store(true, Ordering::Relaxed);
        if args.command.is_some() && pid != 0 {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGINT,
            );
        }
    }

    stop_monitor(&mut client, &args, pid).await?;

    if let Some(thread) = spawn_thread {
        let _ = thread.join();
    }
    info!(tid = tid, "Finished. Closing everything...");
    Ok(0)
}

fn main() {
    print_welcome();
    let tid: &TransactionId = &LAUNCHER_TID;
    let args = Args::parse();

    let log_config = LoggingConfig {
        level: "info".to_string(),
        directory: "".to_string(),
        basename: "efimon-launcher".to_string(),
        stdout: Some(true),
    };
    let _guard = match start_tracing(&log_config, tid) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Cannot initialise logging: {}", e);
            std::process::exit(-1);
        },
    };

    info!(tid = tid, frequency_hz = args.frequency, "Frequency");
    info!(tid = tid, samples = ?args.samples, "Samples");
    info!(tid = tid, delay_secs = args.delay, "Delay time");
    info!(tid = tid, port = args.port, "IPC TCP Port");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Cannot initialise the runtime: {}", e);
            std::process::exit(-1);
        },
    };

    match runtime.block_on(run(args, tid)) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            warn!(tid = tid, error = %e, "Launcher failed");
            std::process::exit(-1);
        },
    }
}
