use crate::clock::uptime_ms;
use crate::observer::{Observer, ObserverCapabilities, ObserverScope, ObserverType};
use crate::readings::{RamReadings, Readings};
use crate::status::{EfiResult, Status, StatusCode};

/// Totals scraped from `/proc/meminfo`, all in KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct MemInfoData {
    phys_total: u64,
    phys_available: u64,
    swap_total: u64,
    swap_free: u64,
}

fn parse_meminfo(buff: &str) -> MemInfoData {
    let mut data = MemInfoData::default();
    for line in buff.lines() {
        let mut parts = line.split_ascii_whitespace();
        let key = parts.next().unwrap_or("");
        let value = parts.next().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        match key {
            "MemTotal:" => data.phys_total = value,
            "MemAvailable:" => data.phys_available = value,
            "SwapTotal:" => data.swap_total = value,
            "SwapFree:" => data.swap_free = value,
            _ => {},
        }
    }
    data
}

/// Whole-host memory accounting from `/proc/meminfo`.
pub struct MemInfoObserver {
    caps: [ObserverCapabilities; 1],
    interval: u64,
    status: Status,
    readings: RamReadings,
}

impl MemInfoObserver {
    pub fn new(scope: ObserverScope, interval: u64) -> EfiResult<Self> {
        if scope != ObserverScope::System {
            return Err(Status::new(StatusCode::InvalidParameter, "Process-scope is not supported"));
        }
        let observer_type = ObserverType::RAM | ObserverType::INTERVAL;
        Ok(MemInfoObserver {
            caps: [ObserverCapabilities {
                observer_type,
                scope,
            }],
            interval,
            status: Status::ok(),
            readings: RamReadings::default(),
        })
    }

    fn translate(&mut self, data: MemInfoData, now_ms: u64) {
        self.readings.base.observer_type = self.caps[0].observer_type;
        self.readings.base.stamp(now_ms);

        // KiB to MiB
        self.readings.overall_usage = ((data.phys_total - data.phys_available) >> 10) as f32;
        self.readings.swap_usage = ((data.swap_total - data.swap_free) >> 10) as f32;
        self.readings.total_memory_usage = self.readings.overall_usage + self.readings.swap_usage;
        self.readings.overall_bw = -1.0;
        self.readings.overall_power = -1.0;
    }
}

impl Observer for MemInfoObserver {
    fn trigger(&mut self) -> EfiResult<()> {
        let buff = std::fs::read_to_string("/proc/meminfo")
            .map_err(|e| Status::new(StatusCode::FileError, format!("Cannot read /proc/meminfo: {}", e)))?;
        let now = uptime_ms()?;
        let data = parse_meminfo(&buff);
        self.translate(data, now);
        Ok(())
    }

    fn readings(&self) -> Vec<Readings> {
        vec![Readings::Ram(self.readings.clone())]
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
        Err(Status::new(StatusCode::NotImplemented, "Cannot set a PID on a system observer"))
    }

    fn set_interval(&mut self, interval_ms: u64) -> EfiResult<()> {
        self.interval = interval_ms;
        Ok(())
    }

    fn clear_interval(&mut self) -> EfiResult<()> {
        Ok(())
    }

    fn reset(&mut self) -> EfiResult<()> {
        self.readings = RamReadings::default();
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
