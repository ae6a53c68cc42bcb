//! Wrappers around the kernel statistical profiler: the record phase that
//! captures a trace and the annotate phase that classifies it.

pub mod annotate;
pub mod record;

pub use annotate::PerfAnnotateObserver;
pub use record::PerfRecordObserver;
