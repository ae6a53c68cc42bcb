use crate::clock::uptime_ms;
use crate::observer::{Observer, ObserverCapabilities, ObserverScope, ObserverType};
use crate::readings::{FanReadings, PsuReadings, Readings};
use crate::status::{EfiResult, Status, StatusCode};
use crate::transaction::{TransactionId, SYSTEM_MONITOR_TID};
use crate::utils::{execute_cmd, execute_shell};

/// A maximum number of PSUs supported in a single system.
const MAX_PSU: u32 = 100;

const IPMI_INFO_CMD: [&str; 2] = ["dell", "power-supply-info"];
const IPMI_POWER_CMD: [&str; 2] = ["dell", "get-instantaneous-power-consumption-data"];
const IPMI_SENSOR_CMD: &str = "ipmi-sensors | grep Fan";

/// Extract the wattage from a `<label> : N W` line.
fn parse_watts_line(line: &str) -> Option<f32> {
    let colon = line.find(": ")?;
    let value = line[colon + 2..].split_whitespace().next()?;
    value.parse().ok()
}

/// One rated wattage per `Rated Watts` line of the PSU info output.
fn parse_rated_watts(output: &str) -> Vec<f32> {
    output
        .lines()
        .filter(|l| l.contains("Rated Watts"))
        .filter_map(parse_watts_line)
        .collect()
}

/// The instantaneous wattage of a single PSU from the power command output.
fn parse_instantaneous_power(output: &str) -> Option<f32> {
    output
        .lines()
        .filter(|l| l.contains("Instantaneous Power"))
        .find_map(parse_watts_line)
}

/// One RPM per sensor row; the reading is the fourth pipe-delimited column.
fn parse_fan_speeds(output: &str) -> Vec<f32> {
    output
        .lines()
        .filter_map(|line| {
            line.split('|')
                .nth(3)
                .and_then(|field| field.trim().parse::<f32>().ok())
        })
        .collect()
}

/// Out-of-band PSU wattage and fan tachometers through the vendor OEM CLI.
///
/// Each trigger refreshes the fan RPMs and either one or all PSU powers, and
/// integrates `power x Δt` into per-PSU and overall energy.
pub struct IpmiMeterObserver {
    caps: [ObserverCapabilities; 1],
    interval: u64,
    status: Status,
    valid: bool,
    psu_id: u32,
    num_psus: u32,
    max_power: Vec<f32>,
    psu_readings: PsuReadings,
    fan_readings: FanReadings,
    tid: TransactionId,
}

impl IpmiMeterObserver {
    pub fn new(scope: ObserverScope, interval: u64) -> EfiResult<Self> {
        if scope != ObserverScope::System {
            return Err(Status::new(StatusCode::InvalidParameter, "Process-scope is not supported"));
        }
        let observer_type = ObserverType::POWER | ObserverType::INTERVAL;
        let tid = SYSTEM_MONITOR_TID.clone();

        let info = execute_cmd("ipmi-oem", IPMI_INFO_CMD, None, &tid)
            .map_err(|e| Status::new(StatusCode::AccessDenied, format!("Cannot get info from IPMI: {}", e)))?;
        let max_power = parse_rated_watts(&String::from_utf8_lossy(&info.stdout));
        if max_power.is_empty() {
            return Err(Status::new(StatusCode::NotFound, "Cannot find compatible PSUs"));
        }

        let mut obs = IpmiMeterObserver {
            caps: [ObserverCapabilities {
                observer_type,
                scope,
            }],
            interval,
            status: Status::ok(),
            valid: false,
            psu_id: MAX_PSU,
            num_psus: max_power.len() as u32,
            max_power,
            psu_readings: PsuReadings::default(),
            fan_readings: FanReadings::default(),
            tid,
        };
        obs.reset()?;
        // Warmup trigger; energy integration starts from the next one.
        obs.trigger()?;
        Ok(obs)
    }

    fn refresh_fans(&mut self) -> EfiResult<()> {
        let out = execute_shell(IPMI_SENSOR_CMD, None, &self.tid)
            .map_err(|e| Status::new(StatusCode::NotFound, format!("The IPMI sensor cannot be opened: {}", e)))?;
        let speeds = parse_fan_speeds(&String::from_utf8_lossy(&out.stdout));

        self.fan_readings.base.observer_type = self.caps[0].observer_type;
        self.fan_readings.base.stamp(self.psu_readings.base.timestamp);
        self.fan_readings.overall_speed = if speeds.is_empty() {
            0.0
        } else {
            speeds.iter().sum::<f32>() / speeds.len() as f32
        };
        self.fan_readings.fan_speeds = speeds;
        Ok(())
    }

    fn refresh_psu(&mut self, psu_id: u32) -> EfiResult<()> {
        // The OEM command numbers PSUs from 1.
        let id_arg = (psu_id + 1).to_string();
        let args = [IPMI_POWER_CMD[0], IPMI_POWER_CMD[1], id_arg.as_str()];
        let out = execute_cmd("ipmi-oem", args, None, &self.tid)
            .map_err(|e| Status::new(StatusCode::NotFound, format!("The IPMI power file cannot be opened: {}", e)))?;

        let watts = parse_instantaneous_power(&String::from_utf8_lossy(&out.stdout)).ok_or_else(|| {
            Status::new(
                StatusCode::NotFound,
                format!("Cannot get the consumption of the PSU{}", psu_id),
            )
        })?;

        self.psu_readings.psu_power[psu_id as usize] = watts;
        self.psu_readings.overall_power += watts;
        Ok(())
    }

    fn integrate(&mut self, psu_id: u32) {
        if !self.valid {
            return;
        }
        let slot = psu_id as usize;
        let energy =
            self.psu_readings.psu_power[slot] * self.psu_readings.base.difference as f32 * 1e-3;
        self.psu_readings.overall_energy += energy;
        self.psu_readings.psu_energy[slot] += energy;
    }
}

impl Observer for IpmiMeterObserver {
    fn trigger(&mut self) -> EfiResult<()> {
        let now = uptime_ms()?;
        self.psu_readings.base.observer_type = self.caps[0].observer_type;
        self.psu_readings.base.stamp(now);
        self.psu_readings.overall_power = 0.0;

        self.refresh_fans()?;

        if self.psu_id < self.num_psus {
            self.refresh_psu(self.psu_id)?;
            self.integrate(self.psu_id);
            self.valid = true;
            return Ok(());
        }

        for psu in 0..self.num_psus {
            self.refresh_psu(psu)?;
            self.integrate(psu);
        }
        self.valid = true;
        Ok(())
    }

    fn readings(&self) -> Vec<Readings> {
        vec![
            Readings::Psu(self.psu_readings.clone()),
            Readings::Fan(self.fan_readings.clone()),
        ]
    }

    /// Restrict the refresh to one PSU; an out-of-range id refreshes all.
    fn select_device(&mut self, device: u32) -> EfiResult<()> {
        self.psu_id = device;
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
        self.psu_readings = PsuReadings::default();
        self.fan_readings = FanReadings::default();
        let psus = self.num_psus as usize;
        self.psu_readings.psu_power = vec![0.0; psus];
        self.psu_readings.psu_energy = vec![0.0; psus];
        self.psu_readings.psu_max_power = self.max_power.clone();
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

    const INFO_OUTPUT: &str = "\
Power Supply : 1
Rated Watts : 750 W
Power Supply : 2
Rated Watts : 1100 W
";

    const POWER_OUTPUT: &str = "\
Instantaneous Power : 203 W
Instantaneous Power Consumption Data
";

    const SENSOR_OUTPUT: &str = "\
4    | Fan1A            | Fan              | 5640.00    | RPM   | 'OK'
5    | Fan1B            | Fan              | 5280.00    | RPM   | 'OK'
6    | Fan2A            | Fan              | 5400.00    | RPM   | 'OK'
";

    #[rstest]
    fn parses_rated_watts_per_psu() {
        let rated = parse_rated_watts(INFO_OUTPUT);
        assert_eq!(rated, vec![750.0, 1100.0]);
    }

    #[rstest]
    fn parses_instantaneous_power() {
        assert_eq!(parse_instantaneous_power(POWER_OUTPUT), Some(203.0));
        assert_eq!(parse_instantaneous_power("no power here\n"), None);
    }

    #[rstest]
    fn parses_fan_rows() {
        let speeds = parse_fan_speeds(SENSOR_OUTPUT);
        assert_eq!(speeds, vec![5640.0, 5280.0, 5400.0]);
    }

    #[rstest]
    fn skips_rows_without_a_numeric_column() {
        let speeds = parse_fan_speeds("ID | Name | Type | Reading | Units | Event\n");
        assert!(speeds.is_empty());
    }

    #[rstest]
    fn energy_is_power_times_tick() {
        let mut obs = IpmiMeterObserver {
            caps: [ObserverCapabilities::default()],
            interval: 1000,
            status: Status::ok(),
            valid: false,
            psu_id: MAX_PSU,
            num_psus: 2,
            max_power: vec![750.0, 1100.0],
            psu_readings: PsuReadings::default(),
            fan_readings: FanReadings::default(),
            tid: crate::transaction::TEST_TID.clone(),
        };
        obs.reset().unwrap();

        // Warmup: no integration.
        obs.psu_readings.base.stamp(1000);
        obs.psu_readings.psu_power = vec![100.0, 200.0];
        obs.integrate(0);
        obs.integrate(1);
        obs.valid = true;
        assert_eq!(obs.psu_readings.overall_energy, 0.0);

        // 2 s at 100 W + 200 W.
        obs.psu_readings.base.stamp(3000);
        obs.integrate(0);
        obs.integrate(1);
        assert!((obs.psu_readings.psu_energy[0] - 200.0).abs() < 1e-3);
        assert!((obs.psu_readings.psu_energy[1] - 400.0).abs() < 1e-3);
        assert!((obs.psu_readings.overall_energy - 600.0).abs() < 1e-3);

        // Another second: the running sums keep growing.
        obs.psu_readings.base.stamp(4000);
        obs.integrate(0);
        assert!((obs.psu_readings.psu_energy[0] - 300.0).abs() < 1e-3);
    }
}
