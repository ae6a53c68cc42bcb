use crate::clock::uptime_ms;
use crate::observer::{Observer, ObserverCapabilities, ObserverScope, ObserverType};
use crate::readings::{Readings, RecordReadings};
use crate::status::{EfiResult, Status, StatusCode};
use crate::transaction::{TransactionId, WORKER_MONITOR_TID};
use crate::utils::execute_cmd;
use parking_lot::Mutex;
use std::path::PathBuf;
use tracing::warn;

lazy_static::lazy_static! {
    // At most one perf record per pid, process-wide.
    static ref ACTIVE_PIDS: Mutex<Vec<u32>> = Mutex::new(Vec::new());
}

fn register_pid(pid: u32) -> EfiResult<()> {
    let mut pids = ACTIVE_PIDS.lock();
    if pids.contains(&pid) {
        return Err(Status::new(
            StatusCode::ResourceBusy,
            "The PID is already being tracked by perf record",
        ));
    }
    pids.push(pid);
    Ok(())
}

fn deregister_pid(pid: u32) {
    ACTIVE_PIDS.lock().retain(|p| *p != pid);
}

fn check_alive(pid: u32) -> bool {
    std::fs::metadata(format!("/proc/{}/io", pid)).is_ok()
}

/// Spawns `perf record` over a sample window for one pid and captures the
/// produced trace into a private temporary directory.
///
/// The window length is the configured interval taken as whole seconds (the
/// profiler is driven through `sleep N`); a zero interval coerces to one
/// second. Construction registers the pid in a process-wide set: a second
/// recorder for the same pid answers RESOURCE_BUSY until the first is
/// dropped.
#[derive(Debug)]
pub struct PerfRecordObserver {
    caps: [ObserverCapabilities; 1],
    pid: u32,
    interval_s: u64,
    frequency: u64,
    no_dispose: bool,
    valid: bool,
    tmp_folder: PathBuf,
    status: Status,
    readings: RecordReadings,
    tid: TransactionId,
}

impl PerfRecordObserver {
    pub fn new(
        pid: u32,
        scope: ObserverScope,
        interval: u64,
        frequency: u64,
        no_dispose: bool,
    ) -> EfiResult<Self> {
        if scope != ObserverScope::Process {
            return Err(Status::new(StatusCode::InvalidParameter, "System-scope is not supported"));
        }
        let observer_type =
            ObserverType::CPU | ObserverType::INTERVAL | ObserverType::CPU_INSTRUCTIONS;

        let mut obs = PerfRecordObserver {
            caps: [ObserverCapabilities {
                observer_type,
                scope,
            }],
            pid,
            interval_s: if interval == 0 { 1 } else { interval },
            frequency: if frequency == 0 { 1000 } else { frequency },
            no_dispose,
            valid: false,
            tmp_folder: PathBuf::new(),
            status: Status::ok(),
            readings: RecordReadings::default(),
            tid: WORKER_MONITOR_TID.clone(),
        };

        if pid == 0 {
            return Ok(obs);
        }
        if !check_alive(pid) {
            return Err(Status::new(StatusCode::NotFound, "Cannot check that PID is alive"));
        }
        register_pid(pid)?;
        obs.create_temporary_folder()?;
        Ok(obs)
    }

    /// Whether the last window produced a usable trace.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Path of the locked trace replica from the last window.
    pub fn trace_path(&self) -> &PathBuf {
        &self.readings.perf_data_path
    }

    pub fn tmp_folder(&self) -> &PathBuf {
        &self.tmp_folder
    }

    fn create_temporary_folder(&mut self) -> EfiResult<()> {
        self.tmp_folder = std::env::temp_dir().join(format!("efimon-{}", self.pid));
        std::fs::create_dir_all(&self.tmp_folder).map_err(|e| {
            Status::new(
                StatusCode::FileError,
                format!("Cannot create {}: {}", self.tmp_folder.display(), e),
            )
        })
    }

    fn dispose_temporary_folder(&self) {
        if self.no_dispose || self.tmp_folder.as_os_str().is_empty() {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.tmp_folder) {
            warn!(tid=self.tid, error=%e, path=%self.tmp_folder.display(), "Cannot remove perf temp folder");
        }
    }

    fn record_window(&mut self) -> EfiResult<()> {
        let freq = format!("-F{}", self.frequency);
        let pid = self.pid.to_string();
        let window = self.interval_s.to_string();
        let args = [
            "record",
            "-e",
            "instructions",
            "-q",
            freq.as_str(),
            "-g",
            "-v",
            "-p",
            pid.as_str(),
            "-a",
            "sleep",
            window.as_str(),
        ];
        // perf writes its trace into the working directory.
        execute_cmd("perf", args, Some(&self.tmp_folder), &self.tid)
            .map_err(|e| Status::new(StatusCode::FileError, format!("Cannot run perf record: {}", e)))?;
        Ok(())
    }
}

impl Observer for PerfRecordObserver {
    fn trigger(&mut self) -> EfiResult<()> {
        if self.pid == 0 {
            return Err(Status::new(StatusCode::NotReady, "Invalid PID. Assign one"));
        }
        if !check_alive(self.pid) {
            self.status = Status::new(StatusCode::NotFound, "The process is not available");
            return Err(self.status.clone());
        }

        self.record_window()?;

        // Copy into a locked replica so the annotate pass never races a live
        // perf record.
        let produced = self.tmp_folder.join("perf.data");
        let target = self.tmp_folder.join("perf.data.ulock");
        std::fs::copy(&produced, &target).map_err(|e| {
            Status::new(
                StatusCode::FileError,
                format!("Cannot capture the trace {}: {}", produced.display(), e),
            )
        })?;
        self.valid = true;

        let now = uptime_ms()?;
        self.readings.base.observer_type = ObserverType::CPU;
        self.readings.base.stamp(now);
        self.readings.perf_data_path = target;
        Ok(())
    }

    fn readings(&self) -> Vec<Readings> {
        vec![Readings::Record(self.readings.clone())]
    }

    fn select_device(&mut self, _device: u32) -> EfiResult<()> {
        Err(Status::new(StatusCode::NotImplemented, "Cannot select a device"))
    }

    fn set_scope(&mut self, scope: ObserverScope) -> EfiResult<()> {
        if scope == ObserverScope::Process {
            return Ok(());
        }
        Err(Status::new(StatusCode::NotImplemented, "The scope is only set to PROCESS"))
    }

    /// Re-target a different, alive pid: transitions the registration and the
    /// temporary directory.
    fn set_pid(&mut self, pid: u32) -> EfiResult<()> {
        if !check_alive(pid) {
            self.valid = false;
            return Err(Status::new(StatusCode::NotFound, "Cannot check that PID is alive"));
        }

        let old_pid = self.pid;
        if old_pid != 0 {
            deregister_pid(old_pid);
            self.dispose_temporary_folder();
        }
        if let Err(e) = register_pid(pid) {
            self.valid = false;
            return Err(e);
        }

        self.pid = pid;
        self.create_temporary_folder()
    }

    fn set_interval(&mut self, interval_ms: u64) -> EfiResult<()> {
        self.interval_s = interval_ms;
        Ok(())
    }

    fn clear_interval(&mut self) -> EfiResult<()> {
        Err(Status::new(StatusCode::NotImplemented, "The clear interval is not implemented yet"))
    }

    fn reset(&mut self) -> EfiResult<()> {
        self.readings = RecordReadings::default();
        self.valid = false;
        Ok(())
    }

    fn scope(&self) -> ObserverScope {
        ObserverScope::Process
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn capabilities(&self) -> &[ObserverCapabilities] {
        &self.caps
    }

    fn status(&self) -> Status {
        self.status.clone()
    }
}

impl Drop for PerfRecordObserver {
    fn drop(&mut self) {
        if self.pid != 0 {
            deregister_pid(self.pid);
        }
        self.dispose_temporary_folder();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn one_recorder_per_pid() {
        let pid = std::process::id();
        let first = PerfRecordObserver::new(pid, ObserverScope::Process, 1, 100, false).unwrap();
        let err = PerfRecordObserver::new(pid, ObserverScope::Process, 1, 100, false).unwrap_err();
        assert_eq!(err.code, StatusCode::ResourceBusy);

        drop(first);
        let again = PerfRecordObserver::new(pid, ObserverScope::Process, 1, 100, false);
        assert!(again.is_ok());
    }

    #[rstest]
    fn dead_pid_is_rejected_at_construction() {
        let err = PerfRecordObserver::new(1 << 22, ObserverScope::Process, 1, 100, false).unwrap_err();
        assert_eq!(err.code, StatusCode::NotFound);
    }

    #[rstest]
    fn system_scope_is_rejected() {
        let err =
            PerfRecordObserver::new(std::process::id(), ObserverScope::System, 1, 100, false).unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidParameter);
    }

    #[rstest]
    fn dummy_pid_is_not_ready() {
        let mut obs = PerfRecordObserver::new(0, ObserverScope::Process, 1, 100, false).unwrap();
        let err = obs.trigger().unwrap_err();
        assert_eq!(err.code, StatusCode::NotReady);
    }

    #[rstest]
    fn zero_parameters_take_defaults() {
        let obs = PerfRecordObserver::new(0, ObserverScope::Process, 0, 0, false).unwrap();
        assert_eq!(obs.interval_s, 1);
        assert_eq!(obs.frequency, 1000);
    }
}
