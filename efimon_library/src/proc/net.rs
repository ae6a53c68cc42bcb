use crate::clock::uptime_ms;
use crate::observer::{Observer, ObserverCapabilities, ObserverScope, ObserverType};
use crate::readings::{NetReadings, Readings};
use crate::status::{EfiResult, Status, StatusCode};
use std::collections::BTreeMap;

/// Raw counters for one interface row of `/proc/net/dev`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct NetDevCounters {
    rx_bytes: u64,
    rx_packets: u64,
    tx_bytes: u64,
    tx_packets: u64,
}

fn parse_net_dev(buff: &str) -> BTreeMap<String, NetDevCounters> {
    let mut devices = BTreeMap::new();
    for line in buff.lines().skip(2) {
        let mut halves = line.splitn(2, ':');
        let name = match halves.next() {
            Some(n) => n.trim(),
            None => continue,
        };
        let fields: Vec<u64> = match halves.next() {
            Some(rest) => rest
                .split_ascii_whitespace()
                .map(|f| f.parse().unwrap_or(0))
                .collect(),
            None => continue,
        };
        if fields.len() < 10 || name.is_empty() {
            continue;
        }
        devices.insert(
            name.to_string(),
            NetDevCounters {
                rx_bytes: fields[0],
                rx_packets: fields[1],
                tx_bytes: fields[8],
                tx_packets: fields[9],
            },
        );
    }
    devices
}

/// Per-interface TX/RX accounting from `/proc/net/dev`, one reading per
/// device.
pub struct ProcNetObserver {
    caps: [ObserverCapabilities; 1],
    device: u32,
    interval: u64,
    status: Status,
    data: BTreeMap<String, NetReadings>,
    device_names: Vec<String>,
}

impl ProcNetObserver {
    pub fn new(scope: ObserverScope, interval: u64) -> EfiResult<Self> {
        if scope != ObserverScope::System {
            return Err(Status::new(StatusCode::InvalidParameter, "Process-scope is not supported"));
        }
        let observer_type = ObserverType::NETWORK | ObserverType::INTERVAL;
        Ok(ProcNetObserver {
            caps: [ObserverCapabilities {
                observer_type,
                scope,
            }],
            device: 0,
            interval,
            status: Status::ok(),
            data: BTreeMap::new(),
            device_names: vec![],
        })
    }

    pub fn device_names(&self) -> &[String] {
        &self.device_names
    }

    fn translate(&mut self, devices: BTreeMap<String, NetDevCounters>, now_ms: u64) {
        let observer_type = self.caps[0].observer_type;
        for (name, counters) in devices {
            let tx_volume = counters.tx_bytes as f32 / 1024.0;
            let rx_volume = counters.rx_bytes as f32 / 1024.0;

            let entry = self.data.entry(name.clone()).or_default();
            let known = entry.base.timestamp != 0;
            entry.base.observer_type = observer_type;
            entry.base.stamp(now_ms);

            let diff_ms = entry.base.difference;
            if known && diff_ms > 0 {
                entry.overall_tx_bw = (tx_volume - entry.overall_tx_volume) * 1000.0 / diff_ms as f32;
                entry.overall_rx_bw = (rx_volume - entry.overall_rx_volume) * 1000.0 / diff_ms as f32;
            } else {
                entry.overall_tx_bw = 0.0;
                entry.overall_rx_bw = 0.0;
            }

            entry.dev_name = name;
            entry.overall_tx_volume = tx_volume;
            entry.overall_rx_volume = rx_volume;
            entry.overall_tx_packets = counters.tx_packets;
            entry.overall_rx_packets = counters.rx_packets;
            entry.overall_tx_power = -1.0;
            entry.overall_rx_power = -1.0;
        }

        self.device_names = self.data.keys().cloned().collect();
    }
}

impl Observer for ProcNetObserver {
    fn trigger(&mut self) -> EfiResult<()> {
        let buff = std::fs::read_to_string("/proc/net/dev")
            .map_err(|e| Status::new(StatusCode::FileError, format!("Cannot read /proc/net/dev: {}", e)))?;
        let now = uptime_ms()?;
        let devices = parse_net_dev(&buff);
        self.translate(devices, now);
        Ok(())
    }

    fn readings(&self) -> Vec<Readings> {
        self.data.values().map(|r| Readings::Net(r.clone())).collect()
    }

    fn select_device(&mut self, device: u32) -> EfiResult<()> {
        self.device = device;
        Ok(())
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
        self.data.clear();
        self.device_names.clear();
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
