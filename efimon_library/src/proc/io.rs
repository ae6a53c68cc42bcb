use crate::clock::uptime_ms;
use crate::observer::{Observer, ObserverCapabilities, ObserverScope, ObserverType};
use crate::readings::{IoReadings, Readings};
use crate::status::{EfiResult, Status, StatusCode};

/// Cumulative characters read/written from one `/proc/<pid>/io` file.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct ProcIoData {
    rchar: u64,
    wchar: u64,
}

fn parse_pid_io(buff: &str) -> ProcIoData {
    let mut data = ProcIoData::default();
    for line in buff.lines() {
        let mut parts = line.split(':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim().parse::<u64>().unwrap_or(0);
        match key {
            "rchar" => data.rchar = value,
            "wchar" => data.wchar = value,
            _ => {},
        }
    }
    data
}

/// Per-process I/O accounting from `/proc/<pid>/io`.
pub struct ProcIoObserver {
    caps: [ObserverCapabilities; 1],
    pid: u32,
    interval: u64,
    status: Status,
    prev: ProcIoData,
    readings: IoReadings,
}

impl ProcIoObserver {
    pub fn new(pid: u32, scope: ObserverScope, interval: u64) -> EfiResult<Self> {
        if scope != ObserverScope::Process {
            return Err(Status::new(StatusCode::NotImplemented, "System monitor not implemented"));
        }
        let observer_type = ObserverType::IO | ObserverType::INTERVAL;
        let mut obs = ProcIoObserver {
            caps: [ObserverCapabilities {
                observer_type,
                scope,
            }],
            pid,
            interval,
            status: Status::ok(),
            prev: ProcIoData::default(),
            readings: IoReadings::default(),
        };
        obs.reset()?;
        Ok(obs)
    }

    fn translate(&mut self, fresh: ProcIoData, now_ms: u64) {
        self.readings.base.observer_type = self.caps[0].observer_type;
        self.readings.base.stamp(now_ms);

        let diff_read = fresh.rchar.saturating_sub(self.prev.rchar);
        let diff_write = fresh.wchar.saturating_sub(self.prev.wchar);
        self.prev = fresh;

        self.readings.read_volume = fresh.rchar as f32 / 1024.0;
        self.readings.write_volume = fresh.wchar as f32 / 1024.0;

        let diff_ms = self.readings.base.difference;
        if diff_ms == 0 {
            self.readings.read_bw = 0.0;
            self.readings.write_bw = 0.0;
        } else {
            self.readings.read_bw = 1000.0 * (diff_read as f32 / 1024.0) / diff_ms as f32;
            self.readings.write_bw = 1000.0 * (diff_write as f32 / 1024.0) / diff_ms as f32;
        }

        self.readings.read_power = -1.0;
        self.readings.write_power = -1.0;
    }
}

impl Observer for ProcIoObserver {
    fn trigger(&mut self) -> EfiResult<()> {
        let path = format!("/proc/{}/io", self.pid);
        let buff = std::fs::read_to_string(&path).map_err(|_| {
            self.status = Status::new(StatusCode::NotFound, "The process is not available");
            self.status.clone()
        })?;
        self.status = Status::ok();
        let now = uptime_ms()?;
        let fresh = parse_pid_io(&buff);
        self.translate(fresh, now);
        Ok(())
    }

    fn readings(&self) -> Vec<Readings> {
        vec![Readings::Io(self.readings.clone())]
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
        self.prev = ProcIoData::default();
        self.readings = IoReadings::default();
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
