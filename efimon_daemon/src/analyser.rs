use crate::worker::EfimonWorker;
use efimon_library::observer::{Observer, ObserverScope};
use efimon_library::power::ipmi::IpmiMeterObserver;
use efimon_library::power::rapl::RaplMeterObserver;
use efimon_library::proc::stat::SystemStatObserver;
use efimon_library::readings::Readings;
use efimon_library::status::{EfiResult, Status, StatusCode};
use efimon_library::threading::os_thread;
use efimon_library::topology::CpuTopology;
use efimon_library::transaction::{TransactionId, SYSTEM_MONITOR_TID};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Index into the shared system snapshot vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadingKind {
    PsuEnergy,
    Fan,
    CpuEnergy,
    CpuUsage,
}

/// The observers the system collector thread drives.
struct SystemObservers {
    ipmi: Option<IpmiMeterObserver>,
    rapl: Option<RaplMeterObserver>,
    proc_sys: SystemStatObserver,
    topology: CpuTopology,
}

struct SystemThread {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// Owns the system collector and the per-PID workers, and routes control
/// requests to them. The shared snapshot vector it publishes is the join
/// point between system-wide and process-scoped samples.
pub struct EfimonAnalyser {
    system: Mutex<SystemObservers>,
    snapshots: Mutex<HashMap<ReadingKind, Readings>>,
    workers: Mutex<HashMap<u32, Arc<EfimonWorker>>>,
    sys_thread: Mutex<Option<SystemThread>>,
    weak_self: Weak<EfimonAnalyser>,
}

impl EfimonAnalyser {
    pub fn new(tid: &TransactionId) -> EfiResult<Arc<Self>> {
        let ipmi = match IpmiMeterObserver::new(ObserverScope::System, 1000) {
            Ok(obs) => Some(obs),
            Err(e) => {
                warn!(tid = tid, error = %e, "IPMI not available, PSU and fan columns disabled");
                None
            },
        };
        let rapl = match RaplMeterObserver::new(ObserverScope::System, 1000) {
            Ok(obs) => Some(obs),
            Err(e) => {
                warn!(tid = tid, error = %e, "RAPL not available, socket power columns disabled");
                None
            },
        };
        let proc_sys = SystemStatObserver::new(ObserverScope::System, 1000)?;
        let topology = CpuTopology::new()?;

        Ok(Arc::new_cyclic(|weak| EfimonAnalyser {
            system: Mutex::new(SystemObservers {
                ipmi,
                rapl,
                proc_sys,
                topology,
            }),
            snapshots: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            sys_thread: Mutex::new(None),
            weak_self: weak.clone(),
        }))
    }

    /// Copy of the latest system snapshot of the given kind.
    pub fn snapshot(&self, kind: ReadingKind) -> Option<Readings> {
        self.snapshots.lock().get(&kind).cloned()
    }

    pub fn psu_count(&self) -> usize {
        let system = self.system.lock();
        system
            .ipmi
            .as_ref()
            .and_then(|obs| obs.readings().first().cloned())
            .and_then(|r| r.as_psu().map(|p| p.psu_max_power.len()))
            .unwrap_or(0)
    }

    pub fn fan_count(&self) -> usize {
        let system = self.system.lock();
        system
            .ipmi
            .as_ref()
            .and_then(|obs| obs.readings().get(1).cloned())
            .and_then(|r| r.as_fan().map(|f| f.fan_speeds.len()))
            .unwrap_or(0)
    }

    pub fn socket_count(&self) -> usize {
        if self.system.lock().rapl.is_none() {
            return 0;
        }
        self.system.lock().topology.num_sockets().max(0) as usize
    }

    /// Start the background system collector.
    pub fn start_system(&self, delay_s: u64) -> EfiResult<()> {
        let mut slot = self.sys_thread.lock();
        if slot.is_some() {
            return Err(Status::new(StatusCode::ResourceBusy, "The thread has already started"));
        }
        let me = self
            .weak_self
            .upgrade()
            .ok_or_else(|| Status::new(StatusCode::ConfigurationError, "The analyser is shutting down"))?;

        info!("Starting System Monitor");
        let stop = Arc::new(AtomicBool::new(false));
        let (handle, tx) = os_thread(
            delay_s * 1000,
            SYSTEM_MONITOR_TID.clone(),
            stop.clone(),
            Arc::new(EfimonAnalyser::system_tick),
        )
        .map_err(|e| Status::new(StatusCode::ConfigurationError, format!("Cannot spawn the system thread: {}", e)))?;
        tx.send(me)
            .map_err(|e| Status::new(StatusCode::ConfigurationError, format!("Cannot hand the collector over: {}", e)))?;

        *slot = Some(SystemThread { handle, stop });
        Ok(())
    }

    /// Stop and join the system collector.
    pub fn stop_system(&self) -> EfiResult<()> {
        let thread = match self.sys_thread.lock().take() {
            Some(t) => t,
            None => return Err(Status::new(StatusCode::NotFound, "The thread was not running")),
        };
        info!("Stopping System Monitor");
        thread.stop.store(true, Ordering::Relaxed);
        let _ = thread.handle.join();
        Ok(())
    }

    /// One collector tick: trigger the system observers and publish fresh
    /// snapshots. Individual failures degrade to warnings.
    fn system_tick(&self, tid: &TransactionId) {
        let mut system = self.system.lock();

        if let Err(e) = system.proc_sys.trigger() {
            warn!(tid = tid, error = %e, "Cannot refresh the system CPU accounting");
        }
        if let Err(e) = system.topology.refresh() {
            warn!(tid = tid, error = %e, "Cannot refresh the CPU topology");
        }
        let freqs = system.topology.socket_mean_frequency();
        system.proc_sys.set_socket_frequency(freqs);

        if let Some(rapl) = system.rapl.as_mut() {
            if let Err(e) = rapl.trigger() {
                warn!(tid = tid, error = %e, "Cannot refresh the powercap meters");
            }
        }
        if let Some(ipmi) = system.ipmi.as_mut() {
            if let Err(e) = ipmi.trigger() {
                warn!(tid = tid, error = %e, "Cannot refresh the IPMI meters");
            }
        }

        let mut snapshots = self.snapshots.lock();
        if let Some(cpu) = system.proc_sys.readings().into_iter().next() {
            snapshots.insert(ReadingKind::CpuUsage, cpu);
        }
        if let Some(rapl) = system.rapl.as_ref() {
            if let Some(energy) = rapl.readings().into_iter().next() {
                snapshots.insert(ReadingKind::CpuEnergy, energy);
            }
        }
        if let Some(ipmi) = system.ipmi.as_ref() {
            let mut readings = ipmi.readings().into_iter();
            if let Some(psu) = readings.next() {
                snapshots.insert(ReadingKind::PsuEnergy, psu);
            }
            if let Some(fan) = readings.next() {
                snapshots.insert(ReadingKind::Fan, fan);
            }
        }
    }

    /// Create and start a worker for `pid`; at most one worker per pid.
    pub fn start_worker(
        &self,
        name: &str,
        pid: u32,
        delay_s: u64,
        samples: Option<u64>,
        enable_perf: bool,
        freq_hz: u64,
    ) -> EfiResult<()> {
        let mut workers = self.workers.lock();
        if workers.contains_key(&pid) {
            return Err(Status::new(
                StatusCode::ResourceBusy,
                format!("The monitor has already started for the given PID: {}", pid),
            ));
        }

        info!(pid = pid, name = name, "Starting Process Monitor");
        let worker = EfimonWorker::start(
            name.to_string(),
            pid,
            self.weak_self.clone(),
            delay_s,
            samples,
            enable_perf,
            freq_hz,
        )?;
        workers.insert(pid, worker);
        Ok(())
    }

    /// Stop, join and forget the worker for `pid`.
    pub fn stop_worker(&self, pid: u32) -> EfiResult<()> {
        let worker = match self.workers.lock().remove(&pid) {
            Some(w) => w,
            None => {
                return Err(Status::new(
                    StatusCode::NotFound,
                    format!("No monitor linked to the given PID: {}", pid),
                ))
            },
        };
        info!(pid = pid, "Stopping Worker Monitor");
        worker.stop();
        Ok(())
    }

    /// Worker state for `poll`: the Status code carries RUNNING/STOPPED and
    /// the message is the code in decimal, ready for the wire.
    pub fn check_worker(&self, pid: u32) -> Status {
        match self.workers.lock().get(&pid) {
            Some(worker) => worker.state(),
            None => Status::new(
                StatusCode::NotFound,
                (StatusCode::NotFound as i32).to_string(),
            ),
        }
    }

    /// Stop everything; used on daemon teardown.
    pub fn shutdown(&self) {
        let pids: Vec<u32> = self.workers.lock().keys().copied().collect();
        for pid in pids {
            let _ = self.stop_worker(pid);
        }
        let _ = self.stop_system();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use efimon_library::transaction::TEST_TID;
    use rstest::rstest;

    fn analyser() -> Arc<EfimonAnalyser> {
        EfimonAnalyser::new(&TEST_TID).unwrap()
    }

    #[rstest]
    fn system_collector_start_is_exclusive() {
        let analyser = analyser();
        analyser.start_system(1).unwrap();
        let err = analyser.start_system(1).unwrap_err();
        assert_eq!(err.code, StatusCode::ResourceBusy);
        analyser.stop_system().unwrap();
        let err = analyser.stop_system().unwrap_err();
        assert_eq!(err.code, StatusCode::NotFound);
        // A fresh start succeeds after a stop.
        analyser.start_system(1).unwrap();
        analyser.stop_system().unwrap();
    }

    #[rstest]
    fn one_worker_per_pid() {
        let analyser = analyser();
        let pid = std::process::id();
        let name = std::env::temp_dir().join(format!("efimon-analyser-test-{}.csv", pid));
        let name = name.to_string_lossy().to_string();

        analyser
            .start_worker(&name, pid, 1, Some(100), false, 100)
            .unwrap();
        let err = analyser
            .start_worker(&name, pid, 1, Some(100), false, 100)
            .unwrap_err();
        assert_eq!(err.code, StatusCode::ResourceBusy);
        assert_eq!(analyser.check_worker(pid).code, StatusCode::Running);

        analyser.stop_worker(pid).unwrap();
        assert_eq!(analyser.check_worker(pid).code, StatusCode::NotFound);

        // The pid is free again.
        analyser
            .start_worker(&name, pid, 1, Some(100), false, 100)
            .unwrap();
        analyser.stop_worker(pid).unwrap();
        let _ = std::fs::remove_file(&name);
    }

    #[rstest]
    fn worker_stops_itself_when_the_process_dies() {
        let analyser = analyser();
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .stdout(std::process::Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();
        let name = std::env::temp_dir().join(format!("efimon-vanish-test-{}.csv", pid));
        let name = name.to_string_lossy().to_string();

        analyser.start_worker(&name, pid, 1, None, false, 100).unwrap();
        assert_eq!(analyser.check_worker(pid).code, StatusCode::Running);

        child.kill().unwrap();
        child.wait().unwrap();

        // The next trigger fails the liveness check and flips the state.
        let mut stopped = false;
        for _ in 0..50 {
            if analyser.check_worker(pid).code == StatusCode::Stopped {
                stopped = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        assert!(stopped);

        analyser.stop_worker(pid).unwrap();
        let contents = std::fs::read_to_string(&name).unwrap();
        assert!(contents.starts_with("ID,Timestamp,TimeDifference"));
        let _ = std::fs::remove_file(&name);
    }

    #[rstest]
    fn unknown_worker_polls_not_found() {
        let analyser = analyser();
        let status = analyser.check_worker(99_999_999);
        assert_eq!(status.code, StatusCode::NotFound);
        assert_eq!(status.msg, "10");
    }

    #[rstest]
    fn snapshots_appear_after_a_tick() {
        let analyser = analyser();
        EfimonAnalyser::system_tick(&analyser, &TEST_TID);
        let cpu = analyser.snapshot(ReadingKind::CpuUsage).unwrap();
        assert!(cpu.as_cpu().is_some());
    }
}
