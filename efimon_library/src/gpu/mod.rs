//! GPU utilisation, memory, power and clocks through the vendor management
//! library.

use crate::clock::uptime_ms;
use crate::observer::{Observer, ObserverCapabilities, ObserverScope, ObserverType};
use crate::readings::{GpuReadings, Readings};
use crate::status::{EfiResult, Status, StatusCode};
use nvml_wrapper::enum_wrappers::device::Clock;
use nvml_wrapper::Nvml;

/// Per-device and per-process GPU metering through NVML.
///
/// SYSTEM scope reads device utilisation, total energy (delta), clocks and
/// derives power; PROCESS scope filters the recent process-utilisation
/// sample array by pid. A device index beyond the discovered count means
/// "aggregate over all devices".
pub struct NvidiaGpuObserver {
    caps: [ObserverCapabilities; 1],
    pid: u32,
    interval: u64,
    status: Status,
    nvml: Nvml,
    device: u32,
    num_devices: u32,
    valid: bool,
    prev_energy_j: Vec<f64>,
    readings: GpuReadings,
}

impl NvidiaGpuObserver {
    pub fn new(pid: u32, scope: ObserverScope, interval: u64) -> EfiResult<Self> {
        let observer_type = ObserverType::GPU | ObserverType::VRAM | ObserverType::INTERVAL;
        let nvml = Nvml::init().map_err(|e| {
            Status::new(
                StatusCode::ConfigurationError,
                format!("Cannot initialise the GPU management library: {}", e),
            )
        })?;
        let num_devices = nvml
            .device_count()
            .map_err(|e| Status::new(StatusCode::ConfigurationError, format!("Cannot count GPU devices: {}", e)))?;

        let mut obs = NvidiaGpuObserver {
            caps: [ObserverCapabilities {
                observer_type,
                scope,
            }],
            pid,
            interval,
            status: Status::ok(),
            nvml,
            // Monitor all devices unless one is selected.
            device: num_devices,
            num_devices,
            valid: false,
            prev_energy_j: vec![],
            readings: GpuReadings::default(),
        };
        obs.reset()?;
        Ok(obs)
    }

    fn device_span(&self) -> std::ops::Range<u32> {
        if self.device < self.num_devices {
            self.device..self.device + 1
        } else {
            0..self.num_devices
        }
    }

    fn system_stats(&mut self, index: u32) -> EfiResult<()> {
        let device = self.nvml.device_by_index(index).map_err(|e| {
            Status::new(StatusCode::LoggerCannotOpen, format!("Cannot get the device handle for {}: {}", index, e))
        })?;
        let slot = index as usize;

        let rates = device
            .utilization_rates()
            .map_err(|e| Status::new(StatusCode::FileError, format!("Cannot read utilisation on {}: {}", index, e)))?;
        // Counter reported in microjoules, exposed in joules.
        let energy_j = device
            .total_energy_consumption()
            .map_err(|e| Status::new(StatusCode::FileError, format!("Cannot read energy on {}: {}", index, e)))?
            as f64
            * 1e-6;
        let sm_clock = device
            .clock_info(Clock::SM)
            .map_err(|e| Status::new(StatusCode::FileError, format!("Cannot read SM clock on {}: {}", index, e)))?;
        let mem_clock = device
            .clock_info(Clock::Memory)
            .map_err(|e| Status::new(StatusCode::FileError, format!("Cannot read MEM clock on {}: {}", index, e)))?;

        let delta_j = if self.valid {
            (energy_j - self.prev_energy_j[slot]) as f32
        } else {
            0.0
        };
        self.prev_energy_j[slot] = energy_j;

        let diff_ms = self.readings.base.difference;
        let power = if diff_ms == 0 { 0.0 } else { delta_j * 1000.0 / diff_ms as f32 };

        self.readings.gpu_usage[slot] = rates.gpu as f32;
        self.readings.gpu_mem_usage[slot] = rates.memory as f32;
        self.readings.gpu_energy[slot] = delta_j;
        self.readings.gpu_power[slot] = power;
        self.readings.clock_speed_sm[slot] = sm_clock as f32;
        self.readings.clock_speed_mem[slot] = mem_clock as f32;

        self.readings.overall_usage += rates.gpu as f32;
        self.readings.overall_memory += rates.memory as f32;
        self.readings.overall_energy += delta_j;
        self.readings.overall_power += power;
        Ok(())
    }

    fn process_stats(&mut self, index: u32) -> EfiResult<()> {
        let device = self.nvml.device_by_index(index).map_err(|e| {
            Status::new(StatusCode::LoggerCannotOpen, format!("Cannot get the device handle for {}: {}", index, e))
        })?;
        let slot = index as usize;

        let samples = device.process_utilization_stats(0).map_err(|e| {
            Status::new(
                StatusCode::LoggerCannotOpen,
                format!("Cannot read process utilisation on device {}: {}", index, e),
            )
        })?;

        match samples.iter().find(|s| s.pid == self.pid) {
            Some(sample) => {
                let usage = sample.sm_util as f32;
                let memory = sample.mem_util as f32 / 10.0;
                self.readings.gpu_usage[slot] = usage;
                self.readings.gpu_mem_usage[slot] = memory;
                self.readings.overall_usage += usage;
                self.readings.overall_memory += memory;
            },
            None => {
                self.readings.gpu_usage[slot] = 0.0;
                self.readings.gpu_mem_usage[slot] = 0.0;
            },
        }
        self.readings.gpu_power[slot] = 0.0;
        self.readings.gpu_energy[slot] = 0.0;
        Ok(())
    }
}

impl Observer for NvidiaGpuObserver {
    fn trigger(&mut self) -> EfiResult<()> {
        let now = uptime_ms()?;
        self.readings.base.observer_type = self.caps[0].observer_type;
        self.readings.base.stamp(now);
        self.readings.overall_usage = 0.0;
        self.readings.overall_memory = 0.0;
        self.readings.overall_power = 0.0;
        self.readings.overall_energy = 0.0;

        for index in self.device_span() {
            match self.caps[0].scope {
                ObserverScope::System => self.system_stats(index)?,
                ObserverScope::Process => self.process_stats(index)?,
            }
        }
        self.valid = true;
        Ok(())
    }

    fn readings(&self) -> Vec<Readings> {
        vec![Readings::Gpu(self.readings.clone())]
    }

    fn select_device(&mut self, device: u32) -> EfiResult<()> {
        self.device = device;
        Ok(())
    }

    fn set_scope(&mut self, scope: ObserverScope) -> EfiResult<()> {
        self.caps[0].scope = scope;
        Ok(())
    }

    fn set_pid(&mut self, pid: u32) -> EfiResult<()> {
        self.pid = pid;
        Ok(())
    }

    fn set_interval(&mut self, interval_ms: u64) -> EfiResult<()> {
        self.interval = interval_ms;
        Ok(())
    }

    fn clear_interval(&mut self) -> EfiResult<()> {
        Ok(())
    }

    fn reset(&mut self) -> EfiResult<()> {
        let devices = self.num_devices as usize;
        // Accounting mode improves the quality of the process samples; a
        // refusal (non-root) is not fatal.
        for index in 0..self.num_devices {
            if let Ok(mut device) = self.nvml.device_by_index(index) {
                let _ = device.set_accounting(true);
            }
        }
        self.valid = false;
        self.prev_energy_j = vec![0.0; devices];
        self.readings = GpuReadings {
            gpu_usage: vec![0.0; devices],
            gpu_mem_usage: vec![0.0; devices],
            gpu_power: vec![0.0; devices],
            gpu_energy: vec![0.0; devices],
            clock_speed_sm: vec![0.0; devices],
            clock_speed_mem: vec![0.0; devices],
            ..GpuReadings::default()
        };
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
