use crate::asm::{InstructionFamily, InstructionType};
use crate::observer::ObserverType;
use std::collections::HashMap;
use std::path::PathBuf;

/// Fields shared by every snapshot an observer produces.
///
/// `timestamp` is monotonic uptime in milliseconds; `difference` is the gap to
/// the previous tick of the same observer, zero on the very first trigger.
#[derive(Debug, Clone, Default)]
pub struct BaseReadings {
    pub observer_type: ObserverType,
    pub timestamp: u64,
    pub difference: u64,
}

impl BaseReadings {
    /// Advance the timestamp pair for a new tick.
    pub fn stamp(&mut self, now_ms: u64) {
        self.difference = if self.timestamp == 0 {
            0
        } else {
            now_ms.saturating_sub(self.timestamp)
        };
        self.timestamp = now_ms;
    }
}

#[derive(Debug, Clone, Default)]
pub struct CpuReadings {
    pub base: BaseReadings,
    /// Fraction 0-100 or IPC, depending on the producing observer.
    pub overall_usage: f32,
    pub overall_power: f32,
    pub overall_energy: f32,
    pub core_usage: Vec<f32>,
    pub core_power: Vec<f32>,
    pub socket_usage: Vec<f32>,
    /// For the powercap observer this holds joules since the previous trigger,
    /// not watts; callers divide by the tick time themselves.
    pub socket_power: Vec<f32>,
    /// Mean frequency per socket in MHz.
    pub socket_frequency: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct RamReadings {
    pub base: BaseReadings,
    /// Resident usage in MiB.
    pub overall_usage: f32,
    /// Resident plus swap in MiB.
    pub total_memory_usage: f32,
    pub swap_usage: f32,
    /// MiB/s, -1 when unsupported.
    pub overall_bw: f32,
    /// Watts, -1 when unsupported.
    pub overall_power: f32,
}

#[derive(Debug, Clone, Default)]
pub struct IoReadings {
    pub base: BaseReadings,
    /// Cumulative KiB.
    pub read_volume: f32,
    pub write_volume: f32,
    /// KiB/s since the previous tick.
    pub read_bw: f32,
    pub write_bw: f32,
    pub read_power: f32,
    pub write_power: f32,
}

#[derive(Debug, Clone, Default)]
pub struct NetReadings {
    pub base: BaseReadings,
    pub dev_name: String,
    /// Cumulative KiB.
    pub overall_tx_volume: f32,
    pub overall_rx_volume: f32,
    pub overall_tx_packets: u64,
    pub overall_rx_packets: u64,
    /// KiB/s since the previous tick.
    pub overall_tx_bw: f32,
    pub overall_rx_bw: f32,
    pub overall_tx_power: f32,
    pub overall_rx_power: f32,
}

#[derive(Debug, Clone, Default)]
pub struct PsuReadings {
    pub base: BaseReadings,
    pub overall_power: f32,
    /// Joules integrated over the lifespan of the observer.
    pub overall_energy: f32,
    pub psu_power: Vec<f32>,
    pub psu_max_power: Vec<f32>,
    pub psu_energy: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct FanReadings {
    pub base: BaseReadings,
    /// Mean across fans, RPM.
    pub overall_speed: f32,
    pub fan_speeds: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct GpuReadings {
    pub base: BaseReadings,
    pub overall_usage: f32,
    /// Percent for system scope, KiB for process scope.
    pub overall_memory: f32,
    pub overall_power: f32,
    pub overall_energy: f32,
    pub gpu_usage: Vec<f32>,
    pub gpu_mem_usage: Vec<f32>,
    pub gpu_power: Vec<f32>,
    pub gpu_energy: Vec<f32>,
    pub clock_speed_sm: Vec<f32>,
    pub clock_speed_mem: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordReadings {
    pub base: BaseReadings,
    /// Path to the captured profiler trace.
    pub perf_data_path: PathBuf,
}

/// Taxonomy map: type -> family -> packed operand origin -> sampled weight.
pub type InstructionClassification =
    HashMap<InstructionType, HashMap<InstructionFamily, HashMap<u8, f32>>>;

#[derive(Debug, Clone, Default)]
pub struct InstructionReadings {
    pub base: BaseReadings,
    /// `mnemonic_operandtypes` -> sampled weight in percent.
    pub histogram: HashMap<String, f32>,
    pub classification: InstructionClassification,
}

/// Tagged snapshot value; downstream consumers match on the variant instead of
/// downcasting.
#[derive(Debug, Clone)]
pub enum Readings {
    Cpu(CpuReadings),
    Ram(RamReadings),
    Io(IoReadings),
    Net(NetReadings),
    Psu(PsuReadings),
    Fan(FanReadings),
    Gpu(GpuReadings),
    Record(RecordReadings),
    Instruction(InstructionReadings),
}

impl Readings {
    pub fn base(&self) -> &BaseReadings {
        match self {
            Readings::Cpu(r) => &r.base,
            Readings::Ram(r) => &r.base,
            Readings::Io(r) => &r.base,
            Readings::Net(r) => &r.base,
            Readings::Psu(r) => &r.base,
            Readings::Fan(r) => &r.base,
            Readings::Gpu(r) => &r.base,
            Readings::Record(r) => &r.base,
            Readings::Instruction(r) => &r.base,
        }
    }

    pub fn as_cpu(&self) -> Option<&CpuReadings> {
        match self {
            Readings::Cpu(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_psu(&self) -> Option<&PsuReadings> {
        match self {
            Readings::Psu(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_fan(&self) -> Option<&FanReadings> {
        match self {
            Readings::Fan(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_instruction(&self) -> Option<&InstructionReadings> {
        match self {
            Readings::Instruction(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn first_stamp_has_zero_difference() {
        let mut base = BaseReadings::default();
        base.stamp(1500);
        assert_eq!(base.timestamp, 1500);
        assert_eq!(base.difference, 0);
    }

    #[rstest]
    fn consecutive_stamps_track_the_gap() {
        let mut base = BaseReadings::default();
        base.stamp(1500);
        base.stamp(2500);
        assert_eq!(base.timestamp, 2500);
        assert_eq!(base.difference, 1000);
        base.stamp(2600);
        assert_eq!(base.difference, 100);
    }

    #[rstest]
    fn variant_accessors_are_exclusive() {
        let r = Readings::Cpu(CpuReadings::default());
        assert!(r.as_cpu().is_some());
        assert!(r.as_psu().is_none());
        assert!(r.as_instruction().is_none());
    }
}
