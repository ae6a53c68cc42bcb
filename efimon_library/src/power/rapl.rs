use crate::clock::uptime_ms;
use crate::observer::{Observer, ObserverCapabilities, ObserverScope, ObserverType};
use crate::readings::{CpuReadings, Readings};
use crate::status::{EfiResult, Status, StatusCode};
use crate::topology::CpuTopology;

fn powercap_path(socket_id: u32) -> String {
    format!("/sys/class/powercap/intel-rapl:{}/energy_uj", socket_id)
}

/// Per-socket energy deltas from the powercap (RAPL) sysfs nodes.
///
/// The reported `socket_power` entries hold joules since the previous
/// trigger, not watts; callers divide by the tick time themselves.
pub struct RaplMeterObserver {
    caps: [ObserverCapabilities; 1],
    interval: u64,
    status: Status,
    device: u32,
    num_sockets: u32,
    valid: bool,
    before: Vec<f32>,
    after: Vec<f32>,
    readings: CpuReadings,
}

impl RaplMeterObserver {
    pub fn new(scope: ObserverScope, interval: u64) -> EfiResult<Self> {
        if scope != ObserverScope::System {
            return Err(Status::new(StatusCode::InvalidParameter, "Process-scope is not supported"));
        }
        let observer_type = ObserverType::CPU | ObserverType::POWER | ObserverType::INTERVAL;
        let topology = CpuTopology::new()?;
        let num_sockets = topology.num_sockets().max(0) as u32;
        let mut obs = RaplMeterObserver {
            caps: [ObserverCapabilities {
                observer_type,
                scope,
            }],
            interval,
            status: Status::ok(),
            device: num_sockets,
            num_sockets,
            valid: false,
            before: vec![],
            after: vec![],
            readings: CpuReadings::default(),
        };
        obs.reset()?;
        obs.trigger()?;
        Ok(obs)
    }

    fn read_socket(&mut self, socket_id: u32) -> EfiResult<()> {
        let path = powercap_path(socket_id);
        let payload = std::fs::read_to_string(&path)
            .map_err(|_| Status::new(StatusCode::NotFound, "The RAPL interface cannot be opened"))?;
        let joules = payload.trim().parse::<f64>().map_err(|e| {
            Status::new(StatusCode::FileError, format!("Cannot parse {}: {}", path, e))
        })? * 1e-6;

        let slot = socket_id as usize;
        if !self.valid {
            self.before[slot] = joules as f32;
            self.after[slot] = joules as f32;
        } else {
            self.before[slot] = self.after[slot];
            self.after[slot] = joules as f32;
        }
        Ok(())
    }

    fn accumulate(&mut self, socket_id: u32) {
        let slot = socket_id as usize;
        let delta = self.after[slot] - self.before[slot];
        self.readings.socket_power[slot] = delta;
        self.readings.overall_power += delta;
    }
}

impl Observer for RaplMeterObserver {
    fn trigger(&mut self) -> EfiResult<()> {
        let now = uptime_ms()?;
        self.readings.base.observer_type = ObserverType::CPU | ObserverType::POWER;
        self.readings.base.stamp(now);
        self.readings.overall_power = 0.0;

        if self.device < self.num_sockets {
            self.read_socket(self.device)?;
            self.accumulate(self.device);
            self.valid = true;
            return Ok(());
        }

        for socket in 0..self.num_sockets {
            self.read_socket(socket)?;
            self.accumulate(socket);
        }
        self.valid = true;
        Ok(())
    }

    fn readings(&self) -> Vec<Readings> {
        vec![Readings::Cpu(self.readings.clone())]
    }

    /// Restrict the scan to one socket; an out-of-range id scans all sockets.
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
        Err(Status::new(StatusCode::NotImplemented, "The clear interval is not implemented yet"))
    }

    fn reset(&mut self) -> EfiResult<()> {
        self.valid = false;
        self.readings = CpuReadings::default();
        let sockets = self.num_sockets as usize;
        self.readings.overall_usage = -1.0;
        self.readings.socket_power = vec![0.0; sockets];
        self.before = vec![0.0; sockets];
        self.after = vec![0.0; sockets];
        Ok(())
    }

    fn scope(&self) -> ObserverScope {
        ObserverScope::System
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

    fn test_observer(sockets: u32) -> RaplMeterObserver {
        let mut obs = RaplMeterObserver {
            caps: [ObserverCapabilities::default()],
            interval: 1000,
            status: Status::ok(),
            device: sockets,
            num_sockets: sockets,
            valid: false,
            before: vec![],
            after: vec![],
            readings: CpuReadings::default(),
        };
        obs.reset().unwrap();
        obs
    }

    fn feed(obs: &mut RaplMeterObserver, socket: u32, joules: f32) {
        let slot = socket as usize;
        if !obs.valid {
            obs.before[slot] = joules;
            obs.after[slot] = joules;
        } else {
            obs.before[slot] = obs.after[slot];
            obs.after[slot] = joules;
        }
    }

    #[rstest]
    fn consecutive_counter_values_become_deltas() {
        let mut obs = test_observer(1);

        // 10 J, then 14 J, then 16 J: deltas 4 and 2.
        feed(&mut obs, 0, 10.0);
        obs.readings.overall_power = 0.0;
        obs.accumulate(0);
        obs.valid = true;
        assert_eq!(obs.readings.socket_power[0], 0.0);

        feed(&mut obs, 0, 14.0);
        obs.readings.overall_power = 0.0;
        obs.accumulate(0);
        assert!((obs.readings.socket_power[0] - 4.0).abs() < 1e-6);

        feed(&mut obs, 0, 16.0);
        obs.readings.overall_power = 0.0;
        obs.accumulate(0);
        assert!((obs.readings.socket_power[0] - 2.0).abs() < 1e-6);
    }

    #[rstest]
    fn overall_is_the_socket_sum() {
        let mut obs = test_observer(2);
        feed(&mut obs, 0, 5.0);
        feed(&mut obs, 1, 7.0);
        obs.valid = true;
        feed(&mut obs, 0, 8.0);
        feed(&mut obs, 1, 11.0);
        obs.readings.overall_power = 0.0;
        obs.accumulate(0);
        obs.accumulate(1);
        assert!((obs.readings.overall_power - 7.0).abs() < 1e-6);
    }

    #[rstest]
    fn reset_clears_the_meters() {
        let mut obs = test_observer(2);
        feed(&mut obs, 0, 5.0);
        obs.valid = true;
        obs.reset().unwrap();
        assert!(!obs.valid);
        assert_eq!(obs.before, vec![0.0, 0.0]);
        assert_eq!(obs.readings.socket_power, vec![0.0, 0.0]);
    }
}
