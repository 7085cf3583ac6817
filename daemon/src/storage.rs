//! Dual-tier measurement storage
//!
//! Live statistics come from an in-memory ring buffer ([`memory`]);
//! long-term history lives in per-target round-robin archive files
//! ([`rrd`]) whose resolutions are described by the retention string
//! ([`retention`]). The collector writes every burst result into both
//! tiers; readers pick the tier matching their question.

pub mod memory;
pub mod retention;
pub mod rrd;

pub use memory::MemoryBuffer;
pub use rrd::RrdStorage;
