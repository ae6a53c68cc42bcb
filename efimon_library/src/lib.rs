//! Core library of the EfiMon power and performance telemetry suite.
//!
//! Everything measurable lives behind the [observer::Observer] contract:
//! `/proc` accounting, powercap energy counters, out-of-band PSU/fan
//! telemetry, GPU metering and the statistical profiler wrappers. The daemon
//! and launcher binaries compose these observers into collectors.

pub mod asm;
pub mod clock;
pub mod gpu;
pub mod logger;
pub mod logging;
pub mod observer;
pub mod perf;
pub mod power;
pub mod proc;
pub mod process_manager;
pub mod protocol;
pub mod readings;
pub mod status;
pub mod threading;
pub mod topology;
pub mod transaction;
pub mod utils;

mod macros;
