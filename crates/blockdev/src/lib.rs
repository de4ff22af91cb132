//! # Block-device capabilities for the dynamic system installer
//!
//! The daemon needs three things from the host block layer: files whose
//! physical extents are pinned on the backing filesystem, a way to publish
//! those extents as a device-mapper block device, and a loopback fallback
//! for hosts without a device-mapper node over the data filesystem. Each
//! capability is a trait with a production implementation wrapping the
//! usual util-linux tooling, so the rest of the daemon can be exercised
//! against in-memory fakes.

mod extents;
pub use extents::*;
mod dm;
pub use dm::*;
mod loopback;
pub use loopback::*;
pub mod testutil;
