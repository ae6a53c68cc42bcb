use crate::clock::uptime_ms;
use crate::observer::{Observer, ObserverCapabilities, ObserverScope, ObserverType};
use crate::readings::{CpuReadings, Readings};
use crate::status::{EfiResult, Status, StatusCode};
use crate::topology::CpuTopology;
use parking_lot::Mutex;

/// One cumulative sample from the vendor counter library.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterSample {
    /// Retired instructions per logical core.
    pub core_instructions: Vec<u64>,
    /// Elapsed cycles per logical core.
    pub core_cycles: Vec<u64>,
    /// Consumed package energy per socket, joules.
    pub socket_energy_j: Vec<f64>,
}

/// External collaborator seam for the vendor shared counter library.
///
/// The library itself is a process-wide singleton; the observer enforces the
/// single-session invariant on top of whatever bridge is injected.
pub trait CounterBridge: Send {
    /// Program the default event set. May be refused by the hardware.
    fn start_session(&mut self) -> EfiResult<()>;
    /// Read the current cumulative counter state.
    fn read(&mut self) -> EfiResult<CounterSample>;
}

lazy_static::lazy_static! {
    static ref SESSION_HELD: Mutex<bool> = Mutex::new(false);
}

/// Per-socket IPC, consumed joules and derived power from the vendor counter
/// library. SYSTEM scope only; at most one live observer per process.
pub struct PcmMeterObserver {
    caps: [ObserverCapabilities; 1],
    interval: u64,
    status: Status,
    bridge: Box<dyn CounterBridge>,
    cores_per_socket: usize,
    valid: bool,
    before: CounterSample,
    readings: CpuReadings,
}

impl std::fmt::Debug for PcmMeterObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcmMeterObserver")
            .field("caps", &self.caps)
            .field("interval", &self.interval)
            .field("status", &self.status)
            .field("cores_per_socket", &self.cores_per_socket)
            .field("valid", &self.valid)
            .field("before", &self.before)
            .field("readings", &self.readings)
            .finish()
    }
}

impl PcmMeterObserver {
    pub fn new(bridge: Box<dyn CounterBridge>, scope: ObserverScope, interval: u64) -> EfiResult<Self> {
        if scope != ObserverScope::System {
            return Err(Status::new(StatusCode::InvalidParameter, "Process-scope is not supported"));
        }

        {
            let mut held = SESSION_HELD.lock();
            if *held {
                return Err(Status::new(
                    StatusCode::ResourceBusy,
                    "The counter session is already owned by another observer",
                ));
            }
            *held = true;
        }

        let mut bridge = bridge;
        if let Err(e) = bridge.start_session() {
            *SESSION_HELD.lock() = false;
            return Err(e);
        }

        let topology = CpuTopology::new().inspect_err(|_| {
            *SESSION_HELD.lock() = false;
        })?;
        let sockets = topology.num_sockets().max(1) as usize;
        let cores = topology.num_logical_cores().max(1) as usize;

        let observer_type = ObserverType::CPU | ObserverType::POWER | ObserverType::INTERVAL;
        Ok(PcmMeterObserver {
            caps: [ObserverCapabilities {
                observer_type,
                scope,
            }],
            interval,
            status: Status::ok(),
            bridge,
            cores_per_socket: cores.div_ceil(sockets),
            valid: false,
            before: CounterSample::default(),
            readings: CpuReadings::default(),
        })
    }

    fn translate(&mut self, after: CounterSample, now_ms: u64) {
        self.readings.base.observer_type = self.caps[0].observer_type;
        self.readings.base.stamp(now_ms);

        if !self.valid {
            self.before = after;
            self.valid = true;
            return;
        }

        let cores = after.core_instructions.len().min(self.before.core_instructions.len());
        self.readings.core_usage.resize(cores, 0.0);
        let mut ipc_sum = 0.0f32;
        for core in 0..cores {
            let instructions =
                after.core_instructions[core].saturating_sub(self.before.core_instructions[core]);
            let cycles = after.core_cycles[core].saturating_sub(self.before.core_cycles[core]);
            let ipc = if cycles == 0 {
                0.0
            } else {
                instructions as f32 / cycles as f32
            };
            self.readings.core_usage[core] = ipc;
            ipc_sum += ipc;
        }
        self.readings.overall_usage = if cores == 0 { 0.0 } else { ipc_sum / cores as f32 };

        // Mean IPC within each socket.
        let sockets = after.socket_energy_j.len();
        self.readings.socket_usage.resize(sockets, 0.0);
        for socket in 0..sockets {
            let start = socket * self.cores_per_socket;
            let end = ((socket + 1) * self.cores_per_socket).min(cores);
            let span = &self.readings.core_usage[start..end.max(start)];
            self.readings.socket_usage[socket] = if span.is_empty() {
                0.0
            } else {
                span.iter().sum::<f32>() / span.len() as f32
            };
        }

        let diff_ms = self.readings.base.difference;
        self.readings.socket_power.resize(sockets, 0.0);
        self.readings.overall_energy = 0.0;
        for socket in 0..sockets {
            let joules = (after.socket_energy_j[socket]
                - self.before.socket_energy_j.get(socket).copied().unwrap_or(0.0))
                as f32;
            self.readings.overall_energy += joules;
            self.readings.socket_power[socket] = if diff_ms == 0 {
                0.0
            } else {
                joules * 1000.0 / diff_ms as f32
            };
        }

        self.before = after;
    }
}

impl Drop for PcmMeterObserver {
    fn drop(&mut self) {
        *SESSION_HELD.lock() = false;
    }
}

impl Observer for PcmMeterObserver {
    fn trigger(&mut self) -> EfiResult<()> {
        let sample = self.bridge.read()?;
        let now = uptime_ms()?;
        self.translate(sample, now);
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
        Err(Status::new(StatusCode::NotImplemented, "Not available for PROCESS scope"))
    }

    fn set_interval(&mut self, interval_ms: u64) -> EfiResult<()> {
        self.interval = interval_ms;
        Ok(())
    }

    fn clear_interval(&mut self) -> EfiResult<()> {
        Ok(())
    }

    fn reset(&mut self) -> EfiResult<()> {
        self.valid = false;
        self.before = CounterSample::default();
        self.readings = CpuReadings::default();
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

    struct FakeBridge {
        refusal: Option<StatusCode>,
        samples: Vec<CounterSample>,
    }

    impl CounterBridge for FakeBridge {
        fn start_session(&mut self) -> EfiResult<()> {
            match self.refusal {
                Some(code) => Err(Status::new(code, "refused")),
                None => Ok(()),
            }
        }

        fn read(&mut self) -> EfiResult<CounterSample> {
            if self.samples.is_empty() {
                return Err(Status::new(StatusCode::NotReady, "no sample"));
            }
            Ok(self.samples.remove(0))
        }
    }

    fn sample(instr: u64, cycles: u64, energy: f64) -> CounterSample {
        CounterSample {
            core_instructions: vec![instr, instr * 2],
            core_cycles: vec![cycles, cycles],
            socket_energy_j: vec![energy],
        }
    }

    fn observer_with(samples: Vec<CounterSample>) -> PcmMeterObserver {
        PcmMeterObserver {
            caps: [ObserverCapabilities::default()],
            interval: 1000,
            status: Status::ok(),
            bridge: Box::new(FakeBridge {
                refusal: None,
                samples,
            }),
            cores_per_socket: 2,
            valid: false,
            before: CounterSample::default(),
            readings: CpuReadings::default(),
        }
    }

    #[rstest]
    #[case(StatusCode::AccessDenied)]
    #[case(StatusCode::ResourceBusy)]
    #[case(StatusCode::ConfigurationError)]
    fn session_refusals_propagate(#[case] code: StatusCode) {
        let bridge = Box::new(FakeBridge {
            refusal: Some(code),
            samples: vec![],
        });
        let err = PcmMeterObserver::new(bridge, ObserverScope::System, 1000).unwrap_err();
        assert_eq!(err.code, code);
        // The refused construction must release the session slot.
        assert!(!*SESSION_HELD.lock());
    }

    #[rstest]
    fn ipc_and_power_come_from_deltas() {
        let mut obs = observer_with(vec![]);

        obs.translate(sample(1000, 1000, 10.0), 1000);
        assert!(obs.valid);

        // +2000/+4000 instructions over +2000 cycles, +5 J over 1 s.
        obs.translate(sample(3000, 3000, 15.0), 2000);
        assert!((obs.readings.core_usage[0] - 1.0).abs() < 1e-6);
        assert!((obs.readings.core_usage[1] - 2.0).abs() < 1e-6);
        assert!((obs.readings.overall_usage - 1.5).abs() < 1e-6);
        assert!((obs.readings.socket_usage[0] - 1.5).abs() < 1e-6);
        assert!((obs.readings.socket_power[0] - 5.0).abs() < 1e-6);
    }

    #[rstest]
    fn process_scope_is_rejected() {
        let bridge = Box::new(FakeBridge {
            refusal: None,
            samples: vec![],
        });
        let err = PcmMeterObserver::new(bridge, ObserverScope::Process, 1000).unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidParameter);
    }
}
