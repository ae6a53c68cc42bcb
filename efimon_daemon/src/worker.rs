use crate::analyser::{EfimonAnalyser, ReadingKind};
use efimon_library::asm::{self, origin_decomposed, DataOrigin, InstructionFamily, InstructionType};
use efimon_library::logger::{CsvLogger, FieldType, LogValue, Logger, Schema};
use efimon_library::observer::{Observer, ObserverScope};
use efimon_library::perf::{PerfAnnotateObserver, PerfRecordObserver};
use efimon_library::proc::stat::ProcStatObserver;
use efimon_library::readings::InstructionReadings;
use efimon_library::status::{EfiResult, Status, StatusCode};
use efimon_library::threading::os_thread;
use efimon_library::transaction::{TransactionId, WORKER_MONITOR_TID};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Build the CSV schema for one worker: time and usage columns, one column
/// per PSU, fan and socket, and the probability columns when the instruction
/// profiler is enabled.
pub fn build_log_table(psus: usize, fans: usize, sockets: usize, enable_perf: bool) -> Schema {
    let mut table: Schema = vec![
        ("Timestamp".to_string(), FieldType::Integer64),
        ("TimeDifference".to_string(), FieldType::Integer64),
        ("SystemCpuUsage".to_string(), FieldType::Float),
        ("ProcessCpuUsage".to_string(), FieldType::Float),
    ];
    for i in 0..psus {
        table.push((format!("PSUPower{}", i), FieldType::Float));
    }
    for i in 0..fans {
        table.push((format!("FanSpeed{}", i), FieldType::Float));
    }
    for i in 0..sockets {
        table.push((format!("SocketPower{}", i), FieldType::Float));
    }
    if enable_perf {
        for itype in InstructionType::ALL {
            let stype = asm::type_string(itype);
            for family in &InstructionFamily::ALL[..5] {
                let sfamily = asm::family_string(*family);
                if family.is_compute() {
                    table.push((format!("ProbabilityRegister{}{}", stype, sfamily), FieldType::Float));
                    table.push((format!("ProbabilityMemLoad{}{}", stype, sfamily), FieldType::Float));
                    table.push((format!("ProbabilityMemStore{}{}", stype, sfamily), FieldType::Float));
                    table.push((format!("ProbabilityMemUpdate{}{}", stype, sfamily), FieldType::Float));
                } else {
                    table.push((format!("Probability{}{}", stype, sfamily), FieldType::Float));
                }
            }
        }
    }
    table
}

/// Fold the annotated taxonomy into the probability columns of one row.
pub fn probability_columns(readings: &InstructionReadings) -> Vec<(String, f32)> {
    let mut columns = vec![];
    for itype in InstructionType::ALL {
        let stype = asm::type_string(itype);
        let families = readings.classification.get(&itype);
        for family in &InstructionFamily::ALL[..5] {
            let sfamily = asm::family_string(*family);
            let origins = families.and_then(|f| f.get(family));
            if family.is_compute() {
                let mut register = 0.0;
                let mut mem_load = 0.0;
                let mut mem_store = 0.0;
                let mut mem_update = 0.0;
                if let Some(origins) = origins {
                    for (origin, weight) in origins {
                        let (output, input) = origin_decomposed(*origin);
                        if output == DataOrigin::Memory && input == DataOrigin::Memory {
                            mem_update += weight;
                        } else if input == DataOrigin::Memory {
                            mem_load += weight;
                        } else if output == DataOrigin::Memory {
                            mem_store += weight;
                        } else {
                            register += weight;
                        }
                    }
                }
                columns.push((format!("ProbabilityRegister{}{}", stype, sfamily), register));
                columns.push((format!("ProbabilityMemLoad{}{}", stype, sfamily), mem_load));
                columns.push((format!("ProbabilityMemStore{}{}", stype, sfamily), mem_store));
                columns.push((format!("ProbabilityMemUpdate{}{}", stype, sfamily), mem_update));
            } else {
                let total = origins.map(|o| o.values().sum::<f32>()).unwrap_or(0.0);
                columns.push((format!("Probability{}{}", stype, sfamily), total));
            }
        }
    }
    columns
}

struct WorkerInner {
    samples_left: Option<u64>,
    first: bool,
    logger: Option<CsvLogger>,
    proc_meter: Option<ProcStatObserver>,
    record: Option<Arc<Mutex<PerfRecordObserver>>>,
    annotate: Option<PerfAnnotateObserver>,
}

/// Per-PID collector thread: triggers the process observers, joins them with
/// the cached system snapshots from the analyser and appends one CSV row per
/// tick. Stops itself when the sample budget runs out or the process dies.
pub struct EfimonWorker {
    name: String,
    pid: u32,
    analyser: Weak<EfimonAnalyser>,
    running: AtomicBool,
    stop: Arc<AtomicBool>,
    inner: Mutex<WorkerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EfimonWorker {
    /// Allocate the observers, write the CSV header and spawn the worker
    /// thread. A missing or zero `samples` budget means unbounded.
    pub fn start(
        name: String,
        pid: u32,
        analyser: Weak<EfimonAnalyser>,
        delay_s: u64,
        samples: Option<u64>,
        enable_perf: bool,
        freq_hz: u64,
    ) -> EfiResult<Arc<Self>> {
        let parent = analyser
            .upgrade()
            .ok_or_else(|| Status::new(StatusCode::ConfigurationError, "The parent analyser is gone"))?;

        let proc_meter = ProcStatObserver::new(pid, ObserverScope::Process, delay_s * 1000)?;
        let (record, annotate) = if enable_perf {
            let record = Arc::new(Mutex::new(PerfRecordObserver::new(
                pid,
                ObserverScope::Process,
                delay_s,
                freq_hz,
                true,
            )?));
            let annotate = PerfAnnotateObserver::new(record.clone());
            (Some(record), Some(annotate))
        } else {
            (None, None)
        };

        let schema = build_log_table(
            parent.psu_count(),
            parent.fan_count(),
            parent.socket_count(),
            enable_perf,
        );
        let logger = CsvLogger::new(&name, schema)?;

        let worker = Arc::new(EfimonWorker {
            name,
            pid,
            analyser,
            running: AtomicBool::new(true),
            stop: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(WorkerInner {
                samples_left: match samples {
                    None | Some(0) => None,
                    Some(n) => Some(n),
                },
                first: true,
                logger: Some(logger),
                proc_meter: Some(proc_meter),
                record,
                annotate,
            }),
            thread: Mutex::new(None),
        });

        let (handle, tx) = os_thread(
            delay_s * 1000,
            WORKER_MONITOR_TID.clone(),
            worker.stop.clone(),
            Arc::new(EfimonWorker::monitor),
        )
        .map_err(|e| Status::new(StatusCode::ConfigurationError, format!("Cannot spawn the worker thread: {}", e)))?;
        tx.send(worker.clone())
            .map_err(|e| Status::new(StatusCode::ConfigurationError, format!("Cannot hand the worker over: {}", e)))?;

        *worker.thread.lock() = Some(handle);
        Ok(worker)
    }

    /// Output file this worker logs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// RUNNING while the thread ticks, STOPPED once the budget is consumed,
    /// the process vanished or a stop was requested. The message carries the
    /// code in decimal for the wire.
    pub fn state(&self) -> Status {
        let code = if self.running.load(Ordering::Relaxed) {
            StatusCode::Running
        } else {
            StatusCode::Stopped
        };
        Status::new(code, (code as i32).to_string())
    }

    /// Flip the flag, join the thread and release the observers.
    pub fn stop(&self) {
        self.halt();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        let mut inner = self.inner.lock();
        inner.logger = None;
        inner.proc_meter = None;
        inner.annotate = None;
        inner.record = None;
    }

    fn halt(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.stop.store(true, Ordering::Relaxed);
    }

    /// One tick of the worker thread.
    fn monitor(&self, tid: &TransactionId) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }
        let mut inner = self.inner.lock();

        if let Some(proc_meter) = inner.proc_meter.as_mut() {
            if let Err(e) = proc_meter.trigger() {
                if e.code == StatusCode::NotFound {
                    info!(tid = tid, pid = self.pid, "The process finished, stopping the worker");
                } else {
                    warn!(tid = tid, pid = self.pid, error = %e, "Cannot refresh the process accounting");
                }
                self.halt();
                return;
            }
        }

        if let Some(record) = inner.record.clone() {
            // Blocks for the whole profiling window.
            if let Err(e) = record.lock().trigger() {
                if e.code == StatusCode::NotFound {
                    info!(tid = tid, pid = self.pid, "The process finished, stopping the worker");
                    self.halt();
                } else {
                    warn!(tid = tid, pid = self.pid, error = %e, "Cannot record the instruction trace");
                }
                return;
            }
            if let Some(annotate) = inner.annotate.as_mut() {
                if let Err(e) = annotate.trigger() {
                    warn!(tid = tid, pid = self.pid, error = %e, "Cannot annotate the instruction trace");
                    return;
                }
            }
        }

        // The first tick only warms the counters up.
        if inner.first {
            inner.first = false;
            return;
        }

        let row = self.compose_row(&inner);
        if let Some(logger) = inner.logger.as_mut() {
            let status = logger.insert_row(&row);
            if !status.is_ok() {
                warn!(tid = tid, pid = self.pid, error = %status, "Cannot log the sample");
            }
        }

        if let Some(left) = inner.samples_left.as_mut() {
            *left = left.saturating_sub(1);
            if *left == 0 {
                info!(tid = tid, pid = self.pid, "Sample budget exhausted, stopping the worker");
                self.halt();
            }
        }
    }

    /// Cross-join the process reading with the cached system snapshots.
    fn compose_row(&self, inner: &WorkerInner) -> HashMap<String, LogValue> {
        let mut row = HashMap::new();

        let proc_cpu = inner
            .proc_meter
            .as_ref()
            .and_then(|m| m.readings().first().and_then(|r| r.as_cpu().cloned()));

        // With perf enabled the profiling window defines the tick times.
        let base = match inner.record.as_ref() {
            Some(record) => record.lock().readings().first().map(|r| r.base().clone()),
            None => proc_cpu.as_ref().map(|c| c.base.clone()),
        };
        if let Some(base) = base {
            row.insert("Timestamp".to_string(), LogValue::from(base.timestamp));
            row.insert("TimeDifference".to_string(), LogValue::from(base.difference));
        }
        if let Some(proc_cpu) = proc_cpu {
            row.insert("ProcessCpuUsage".to_string(), LogValue::from(proc_cpu.overall_usage));
        }

        if let Some(analyser) = self.analyser.upgrade() {
            if let Some(cpu) = analyser
                .snapshot(ReadingKind::CpuUsage)
                .and_then(|r| r.as_cpu().cloned())
            {
                row.insert("SystemCpuUsage".to_string(), LogValue::from(cpu.overall_usage));
            }
            if let Some(psu) = analyser
                .snapshot(ReadingKind::PsuEnergy)
                .and_then(|r| r.as_psu().cloned())
            {
                for (i, power) in psu.psu_power.iter().enumerate() {
                    row.insert(format!("PSUPower{}", i), LogValue::from(*power));
                }
            }
            if let Some(fan) = analyser
                .snapshot(ReadingKind::Fan)
                .and_then(|r| r.as_fan().cloned())
            {
                for (i, speed) in fan.fan_speeds.iter().enumerate() {
                    row.insert(format!("FanSpeed{}", i), LogValue::from(*speed));
                }
            }
            if let Some(energy) = analyser
                .snapshot(ReadingKind::CpuEnergy)
                .and_then(|r| r.as_cpu().cloned())
            {
                for (i, joules) in energy.socket_power.iter().enumerate() {
                    row.insert(format!("SocketPower{}", i), LogValue::from(*joules));
                }
            }
        }

        if let Some(annotate) = inner.annotate.as_ref() {
            if let Some(readings) = annotate.readings().first().and_then(|r| r.as_instruction().cloned()) {
                for (name, weight) in probability_columns(&readings) {
                    row.insert(name, LogValue::from(weight));
                }
            }
        }

        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use efimon_library::asm::pack_origin;
    use rstest::rstest;

    #[rstest]
    fn schema_without_perf_has_no_probability_columns() {
        let table = build_log_table(2, 3, 1, false);
        let names: Vec<&str> = table.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Timestamp",
                "TimeDifference",
                "SystemCpuUsage",
                "ProcessCpuUsage",
                "PSUPower0",
                "PSUPower1",
                "FanSpeed0",
                "FanSpeed1",
                "FanSpeed2",
                "SocketPower0",
            ]
        );
    }

    #[rstest]
    fn schema_with_perf_expands_the_taxonomy() {
        let table = build_log_table(0, 0, 0, true);
        let names: Vec<&str> = table.iter().map(|(n, _)| n.as_str()).collect();
        // 4 time/usage columns, then per type: 3 compute families x 4 + 2 x 1.
        assert_eq!(names.len(), 4 + 3 * (3 * 4 + 2));
        assert_eq!(names[4], "ProbabilityRegisterScalarArithmetic");
        assert!(names.contains(&"ProbabilityMemUpdateVectorMemory"));
        assert!(names.contains(&"ProbabilityScalarBranch"));
        assert!(names.contains(&"ProbabilityUnclassifiedJump"));
        assert!(!names.iter().any(|n| n.contains("Other")));
    }

    #[rstest]
    fn origin_buckets_split_loads_and_stores() {
        let mut readings = InstructionReadings::default();
        let origins = readings
            .classification
            .entry(InstructionType::Scalar)
            .or_default()
            .entry(InstructionFamily::Memory)
            .or_default();
        // Load: register output, memory input.
        origins.insert(pack_origin(DataOrigin::Register, DataOrigin::Memory), 4.0);
        // Store: memory output, register input.
        origins.insert(pack_origin(DataOrigin::Memory, DataOrigin::Register), 2.0);
        // Update: memory on both sides.
        origins.insert(pack_origin(DataOrigin::Memory, DataOrigin::Memory), 1.0);
        // Register only.
        origins.insert(pack_origin(DataOrigin::Register, DataOrigin::Register), 8.0);

        let columns: HashMap<String, f32> = probability_columns(&readings).into_iter().collect();
        assert_eq!(columns["ProbabilityMemLoadScalarMemory"], 4.0);
        assert_eq!(columns["ProbabilityMemStoreScalarMemory"], 2.0);
        assert_eq!(columns["ProbabilityMemUpdateScalarMemory"], 1.0);
        assert_eq!(columns["ProbabilityRegisterScalarMemory"], 8.0);
        // Untouched buckets default to zero.
        assert_eq!(columns["ProbabilityRegisterVectorLogic"], 0.0);
    }

    #[rstest]
    fn non_compute_families_fold_into_one_column() {
        let mut readings = InstructionReadings::default();
        let origins = readings
            .classification
            .entry(InstructionType::Unclassified)
            .or_default()
            .entry(InstructionFamily::Branch)
            .or_default();
        origins.insert(0, 3.0);
        origins.insert(pack_origin(DataOrigin::Unknown, DataOrigin::Memory), 2.0);

        let columns: HashMap<String, f32> = probability_columns(&readings).into_iter().collect();
        assert_eq!(columns["ProbabilityUnclassifiedBranch"], 5.0);
    }

    #[rstest]
    fn probability_columns_cover_the_whole_schema() {
        let readings = InstructionReadings::default();
        let columns = probability_columns(&readings);
        let schema = build_log_table(0, 0, 0, true);
        // Every perf column of the schema has a value, even when empty.
        assert_eq!(columns.len(), schema.len() - 4);
    }
}
