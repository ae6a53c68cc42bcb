use crate::clock::{clock_ticks_per_sec, page_size, uptime_ms};
use crate::observer::{Observer, ObserverCapabilities, ObserverScope, ObserverType};
use crate::readings::{CpuReadings, RamReadings, Readings};
use crate::status::{EfiResult, Status, StatusCode};

/// Counters scraped from one `/proc/<pid>/stat` line.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct ProcStatData {
    state: char,
    utime: u64,
    stime: u64,
    cutime: u64,
    cstime: u64,
    /// In clock ticks since boot.
    starttime: u64,
    /// Virtual size in bytes.
    vsize: u64,
    /// Resident set in pages.
    rss: u64,
    processor: i32,
    /// Accumulators from the previous tick, already in milliseconds.
    total: u64,
    active: u64,
}

/// Parse the fields of interest out of a `/proc/<pid>/stat` line.
/// The command field may contain spaces, so counting starts after the
/// closing parenthesis.
fn parse_pid_stat(line: &str) -> Option<ProcStatData> {
    let after_comm = &line[line.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_ascii_whitespace().collect();
    // `fields[0]` is the state character, field 3 of the full line.
    let get = |n: usize| -> Option<u64> { fields.get(n)?.parse().ok() };
    Some(ProcStatData {
        state: fields.first()?.chars().next()?,
        utime: get(11)?,
        stime: get(12)?,
        cutime: get(13)?,
        cstime: get(14)?,
        starttime: get(19)?,
        vsize: get(20)?,
        rss: get(21)?,
        processor: fields.get(36)?.parse().ok()?,
        total: 0,
        active: 0,
    })
}

/// Per-process CPU time and memory accounting from `/proc/<pid>/stat`.
///
/// Also produces a RAM snapshot from the `vsize`/`rss` fields of the same
/// line. The first trigger is a warmup: usage is zero and `difference` is
/// zero.
pub struct ProcStatObserver {
    caps: [ObserverCapabilities; 1],
    pid: u32,
    interval: u64,
    status: Status,
    data: ProcStatData,
    warmed: bool,
    cpu_readings: CpuReadings,
    ram_readings: RamReadings,
}

impl ProcStatObserver {
    pub fn new(pid: u32, scope: ObserverScope, interval: u64) -> EfiResult<Self> {
        if scope != ObserverScope::Process {
            return Err(Status::new(
                StatusCode::NotImplemented,
                "System monitoring lives in SystemStatObserver",
            ));
        }
        let observer_type = ObserverType::CPU | ObserverType::RAM | ObserverType::INTERVAL;
        let mut obs = ProcStatObserver {
            caps: [ObserverCapabilities {
                observer_type,
                scope,
            }],
            pid,
            interval,
            status: Status::ok(),
            data: ProcStatData::default(),
            warmed: false,
            cpu_readings: CpuReadings::default(),
            ram_readings: RamReadings::default(),
        };
        obs.reset()?;
        Ok(obs)
    }

    fn check_alive(&mut self) -> EfiResult<()> {
        let path = format!("/proc/{}/stat", self.pid);
        if std::fs::metadata(&path).is_err() {
            self.status = Status::new(StatusCode::NotFound, "The process is not available");
            return Err(self.status.clone());
        }
        self.status = Status::ok();
        Ok(())
    }

    fn read_stat(&mut self) -> EfiResult<ProcStatData> {
        let path = format!("/proc/{}/stat", self.pid);
        let line = std::fs::read_to_string(&path).map_err(|_| {
            self.status = Status::new(StatusCode::NotFound, "The process is not available");
            self.status.clone()
        })?;
        parse_pid_stat(&line)
            .ok_or_else(|| Status::new(StatusCode::FileError, format!("Malformed stat line in {}", path)))
    }

    fn translate(&mut self, fresh: ProcStatData, now_ms: u64) {
        self.cpu_readings.base.observer_type = self.caps[0].observer_type;
        self.cpu_readings.base.stamp(now_ms);
        self.ram_readings.base = self.cpu_readings.base.clone();

        // Zombie/dead processes report stale counters; keep the previous tick.
        if matches!(fresh.state, 'Z' | 'X' | 'T') {
            return;
        }

        let ticks = clock_ticks_per_sec();
        let active = (fresh.utime + fresh.stime + fresh.cutime + fresh.cstime) * 1000 / ticks;
        let total = now_ms.saturating_sub(fresh.starttime * 1000 / ticks);

        let diff_total = total.saturating_sub(self.data.total);
        let diff_active = active.saturating_sub(self.data.active);
        let warmup = !self.warmed || diff_total == 0;
        self.warmed = true;

        self.data = fresh;
        self.data.total = total;
        self.data.active = active;

        let nprocs = num_cpus::get() as f32;
        let usage = 100.0 * diff_active as f32 / diff_total as f32;
        self.cpu_readings.overall_usage = if warmup { 0.0 } else { usage / nprocs };
        self.cpu_readings.overall_power = -1.0;

        self.ram_readings.overall_usage = ((self.data.rss * page_size()) >> 20) as f32;
        self.ram_readings.total_memory_usage = (self.data.vsize >> 20) as f32;
        self.ram_readings.swap_usage = 0.0;
        self.ram_readings.overall_bw = -1.0;
        self.ram_readings.overall_power = -1.0;
    }
}

impl Observer for ProcStatObserver {
    fn trigger(&mut self) -> EfiResult<()> {
        self.check_alive()?;
        let now = uptime_ms()?;
        let fresh = self.read_stat()?;
        self.translate(fresh, now);
        Ok(())
    }

    fn readings(&self) -> Vec<Readings> {
        vec![
            Readings::Cpu(self.cpu_readings.clone()),
            Readings::Ram(self.ram_readings.clone()),
        ]
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

    fn set_pid(&mut self, pid: u32) -> EfiResult<()> {
        self.pid = pid;
        self.reset()
    }

    fn set_interval(&mut self, interval_ms: u64) -> EfiResult<()> {
        self.interval = interval_ms;
        Ok(())
    }

    fn clear_interval(&mut self) -> EfiResult<()> {
        Ok(())
    }

    fn reset(&mut self) -> EfiResult<()> {
        self.data = ProcStatData::default();
        self.warmed = false;
        self.cpu_readings = CpuReadings::default();
        self.ram_readings = RamReadings::default();
        Ok(())
    }

    fn scope(&self) -> ObserverScope {
        self.caps[0].scope
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

/// One CPU line of `/proc/stat`: (user, nice, system, idle, iowait).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CoreTimes {
    user: f64,
    nice: f64,
    system: f64,
    idle: f64,
    iowait: f64,
}

impl CoreTimes {
    // The 0.01 idle coefficient is intentional; see DESIGN.md.
    fn active(&self) -> f64 {
        self.user + self.nice + self.system + self.iowait + 0.01 * self.idle
    }

    fn total(&self) -> f64 {
        self.user + self.nice + self.system + self.idle + self.iowait
    }
}

fn parse_sys_stat(buff: &str) -> Vec<CoreTimes> {
    let mut cores = vec![];
    for line in buff.lines() {
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        let name = match fields.first() {
            Some(n) => *n,
            None => continue,
        };
        // Skip the aggregated "cpu" line; keep "cpu0", "cpu1", ...
        if !name.starts_with("cpu") || name == "cpu" {
            continue;
        }
        let get = |n: usize| fields.get(n).and_then(|f| f.parse::<f64>().ok()).unwrap_or(0.0);
        cores.push(CoreTimes {
            user: get(1),
            nice: get(2),
            system: get(3),
            idle: get(4),
            iowait: get(5),
        });
    }
    cores
}

/// Whole-host CPU accounting from `/proc/stat`, one usage fraction per core
/// plus the overall mean. The per-socket mean frequency slot is owned by this
/// observer but written by the system collector from the topology reader.
pub struct SystemStatObserver {
    caps: [ObserverCapabilities; 1],
    interval: u64,
    status: Status,
    prev: Vec<CoreTimes>,
    readings: CpuReadings,
}

impl SystemStatObserver {
    pub fn new(scope: ObserverScope, interval: u64) -> EfiResult<Self> {
        if scope != ObserverScope::System {
            return Err(Status::new(
                StatusCode::NotImplemented,
                "Process monitoring lives in ProcStatObserver",
            ));
        }
        let observer_type = ObserverType::CPU | ObserverType::INTERVAL;
        Ok(SystemStatObserver {
            caps: [ObserverCapabilities {
                observer_type,
                scope,
            }],
            interval,
            status: Status::ok(),
            prev: vec![],
            readings: CpuReadings::default(),
        })
    }

    /// Overwrite the per-socket mean frequencies, MHz.
    pub fn set_socket_frequency(&mut self, freqs: Vec<f32>) {
        self.readings.socket_frequency = freqs;
    }

    fn translate(&mut self, cores: Vec<CoreTimes>, now_ms: u64) {
        self.readings.base.observer_type = self.caps[0].observer_type;
        self.readings.base.stamp(now_ms);

        let warmup = self.prev.len() != cores.len();
        self.readings.core_usage.resize(cores.len(), 0.0);

        let mut sum = 0.0f32;
        for (idx, core) in cores.iter().enumerate() {
            let usage = if warmup {
                0.0
            } else {
                let prev = &self.prev[idx];
                let diff_active = core.active() - prev.active();
                let diff_total = core.total() - prev.total();
                if diff_total <= 0.0 {
                    0.0
                } else {
                    (100.0 * diff_active / diff_total) as f32
                }
            };
            self.readings.core_usage[idx] = usage;
            sum += usage;
        }
        self.readings.overall_usage = if cores.is_empty() { 0.0 } else { sum / cores.len() as f32 };
        self.prev = cores;
    }
}

impl Observer for SystemStatObserver {
    fn trigger(&mut self) -> EfiResult<()> {
        let now = uptime_ms()?;
        let buff = std::fs::read_to_string("/proc/stat")
            .map_err(|e| Status::new(StatusCode::FileError, format!("Cannot read /proc/stat: {}", e)))?;
        let cores = parse_sys_stat(&buff);
        self.translate(cores, now);
        Ok(())
    }

    fn readings(&self) -> Vec<Readings> {
        vec![Readings::Cpu(self.readings.clone())]
    }

    fn select_device(&mut self, _device: u32) -> EfiResult<()> {
        Err(Status::new(StatusCode::NotImplemented, "Cannot select a device"))
    }

    fn set_scope(&mut self, scope: ObserverScope) -> EfiResult<()> {
        if scope == ObserverScope::System {
            return Ok(());
        }
        Err(Status::new(StatusCode::NotImplemented, "The scope is only set to SYSTEM"))
    }

    fn set_pid(&mut self, _pid: u32) -> EfiResult<()> {
        Err(Status::new(
            StatusCode::NotImplemented,
            "It is not possible to set a PID in a SYSTEM wide Observer",
        ))
    }

    fn set_interval(&mut self, interval_ms: u64) -> EfiResult<()> {
        self.interval = interval_ms;
        Ok(())
    }

    fn clear_interval(&mut self) -> EfiResult<()> {
        Ok(())
    }

    fn reset(&mut self) -> EfiResult<()> {
        self.prev.clear();
        self.readings = CpuReadings::default();
        Ok(())
    }

    fn scope(&self) -> ObserverScope {
        self.caps[0].scope
    }

    fn pid(&self) -> u32 {
        0
    }

    fn capabilities(&self) -> &[ObserverCapabilities] {
        &self.caps
    }

    fn status(&self) -> Status {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const PID_STAT: &str = "1234 (some proc) S 1 1234 1234 0 -1 4194560 1000 0 0 0 \
50 25 10 5 20 0 4 0 8000 104857600 256 18446744073709551615 1 1 0 0 0 0 0 0 \
0 0 0 0 17 3 0 0 0 0 0 0 0 0 0 0 0";

    #[rstest]
    fn parses_pid_stat_fields() {
        let data = parse_pid_stat(PID_STAT).unwrap();
        assert_eq!(data.state, 'S');
        assert_eq!(data.utime, 50);
        assert_eq!(data.stime, 25);
        assert_eq!(data.cutime, 10);
        assert_eq!(data.cstime, 5);
        assert_eq!(data.starttime, 8000);
        assert_eq!(data.vsize, 104857600);
        assert_eq!(data.rss, 256);
        assert_eq!(data.processor, 3);
    }

    #[rstest]
    fn parses_comm_with_spaces_and_parens() {
        let line = PID_STAT.replace("(some proc)", "(weird) (proc name)");
        let data = parse_pid_stat(&line).unwrap();
        assert_eq!(data.state, 'S');
        assert_eq!(data.utime, 50);
    }

    #[rstest]
    fn rejects_truncated_lines() {
        assert!(parse_pid_stat("1 (x) S 1 2 3").is_none());
    }

    #[rstest]
    fn parses_per_core_lines_only() {
        let buff = "cpu  100 2 300 4000 50 0 0 0 0 0\n\
cpu0 50 1 150 2000 25 0 0 0 0 0\n\
cpu1 50 1 150 2000 25 0 0 0 0 0\n\
intr 12345\n";
        let cores = parse_sys_stat(buff);
        assert_eq!(cores.len(), 2);
        assert_eq!(cores[0].user, 50.0);
        assert_eq!(cores[0].iowait, 25.0);
    }

    #[rstest]
    fn active_keeps_idle_coefficient() {
        let t = CoreTimes {
            user: 10.0,
            nice: 0.0,
            system: 10.0,
            idle: 100.0,
            iowait: 5.0,
        };
        assert!((t.active() - 26.0).abs() < 1e-9);
        assert!((t.total() - 125.0).abs() < 1e-9);
    }

    #[rstest]
    fn warmup_tick_reports_zero_usage() {
        let mut obs = SystemStatObserver::new(ObserverScope::System, 1000).unwrap();
        let cores = vec![CoreTimes {
            user: 100.0,
            nice: 0.0,
            system: 50.0,
            idle: 1000.0,
            iowait: 0.0,
        }];
        obs.translate(cores.clone(), 1000);
        assert_eq!(obs.readings.overall_usage, 0.0);
        assert_eq!(obs.readings.base.difference, 0);

        let bumped = vec![CoreTimes {
            user: 150.0,
            nice: 0.0,
            system: 75.0,
            idle: 1025.0,
            iowait: 0.0,
        }];
        obs.translate(bumped, 2000);
        assert_eq!(obs.readings.base.difference, 1000);
        // Δactive = 50 + 25 + 0.01*25 = 75.25, Δtotal = 100
        assert!((obs.readings.core_usage[0] - 75.25).abs() < 1e-3);
    }

    #[rstest]
    fn process_scope_only() {
        assert!(ProcStatObserver::new(1, ObserverScope::System, 1).is_err());
        assert!(SystemStatObserver::new(ObserverScope::Process, 1).is_err());
    }

    #[rstest]
    fn own_process_triggers() {
        let mut obs = ProcStatObserver::new(std::process::id(), ObserverScope::Process, 1000).unwrap();
        obs.trigger().unwrap();
        let readings = obs.readings();
        let cpu = readings[0].as_cpu().unwrap();
        // Warmup tick
        assert_eq!(cpu.overall_usage, 0.0);
        assert_eq!(cpu.base.difference, 0);
        assert!(cpu.base.timestamp > 0);
    }

    #[rstest]
    fn dead_pid_is_not_found() {
        // PID 0 never has a /proc entry visible to us.
        let mut obs = ProcStatObserver::new(0, ObserverScope::Process, 1000).unwrap();
        let err = obs.trigger().unwrap_err();
        assert_eq!(err.code, StatusCode::NotFound);
    }
}
