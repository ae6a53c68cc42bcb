use crate::transaction::TransactionId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// return time in milliseconds to sleep for
fn sleep_time(call_ms: u64, start_t: Instant) -> u64 {
    std::cmp::max(1, call_ms as i128 - start_t.elapsed().as_millis() as i128) as u64
}

/// Run a function within an OS thread.
/// It will be executed every `call_ms` milliseconds until `stop` is flipped.
/// This should only be used for code that causes blocking, e.g. calling an
/// external executable or reading pseudo-files.
///
/// The service instance the tick function runs against is delivered through
/// the returned channel, so the caller can finish constructing it after the
/// thread exists.
pub fn os_thread<T: Send + Sync + 'static>(
    call_ms: u64,
    tid: TransactionId,
    stop: Arc<AtomicBool>,
    function: Arc<dyn Fn(&T, &TransactionId) + Send + Sync + 'static>,
) -> anyhow::Result<(JoinHandle<()>, Sender<Arc<T>>)> {
    let (tx, rx) = channel::<Arc<T>>();
    let handle = std::thread::Builder::new().name(tid.clone()).spawn(move || {
        let recv_svc = match rx.recv() {
            Ok(svc) => svc,
            Err(e) => {
                error!(tid=tid, error=%e, typename=%std::any::type_name::<T>(), "OS worker thread failed to receive service from channel!");
                return;
            },
        };
        debug!(tid=tid, typename=%std::any::type_name::<T>(), "OS worker thread started");
        while !stop.load(Ordering::Relaxed) {
            let start = Instant::now();
            function(&recv_svc, &tid);
            let sleep_t = sleep_time(call_ms, start);
            std::thread::sleep(Duration::from_millis(sleep_t));
        }
        debug!(tid=tid, typename=%std::any::type_name::<T>(), "OS worker thread exited");
    })?;

    Ok((handle, tx))
}
