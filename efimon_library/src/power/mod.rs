//! Power and energy meters: powercap sysfs, out-of-band IPMI and the vendor
//! native counter bridge.

pub mod ipmi;
pub mod pcm;
pub mod rapl;
