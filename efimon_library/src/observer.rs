use crate::readings::Readings;
use crate::status::{EfiResult, Status};
use bitflags::bitflags;

bitflags! {
    /// Bitset describing what a single observer measures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObserverType: u64 {
        const CPU = 1 << 0;
        const RAM = 1 << 1;
        const IO = 1 << 2;
        const NETWORK = 1 << 3;
        const VRAM = 1 << 4;
        const GPU = 1 << 5;
        const POWER = 1 << 6;
        /// A query instance driven by an external cadence rather than a sensor.
        const INTERVAL = 1 << 7;
        const CPU_INSTRUCTIONS = 1 << 8;
        const ALL = 1 << 31;
    }
}

/// Whether measurements are limited to a single pid or cover the whole host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObserverScope {
    #[default]
    Process,
    System,
}

/// The (type bitset, scope) tuple advertised by an observer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObserverCapabilities {
    pub observer_type: ObserverType,
    pub scope: ObserverScope,
}

/// Common lifecycle for sensors and meters.
///
/// `trigger` is the only path that consults the outside world and mutates
/// observer state; cadence is driven externally by whoever calls it. The
/// snapshots returned by `readings` stay valid until the next `trigger`.
/// Unsupported methods answer with [crate::status::StatusCode::NotImplemented].
pub trait Observer {
    fn trigger(&mut self) -> EfiResult<()>;
    fn readings(&self) -> Vec<Readings>;
    fn select_device(&mut self, device: u32) -> EfiResult<()>;
    fn set_scope(&mut self, scope: ObserverScope) -> EfiResult<()>;
    fn set_pid(&mut self, pid: u32) -> EfiResult<()>;
    fn set_interval(&mut self, interval_ms: u64) -> EfiResult<()>;
    fn clear_interval(&mut self) -> EfiResult<()>;
    fn reset(&mut self) -> EfiResult<()>;
    fn scope(&self) -> ObserverScope;
    fn pid(&self) -> u32;
    fn capabilities(&self) -> &[ObserverCapabilities];
    fn status(&self) -> Status;
}
