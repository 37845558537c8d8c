//! Protobuf message types shared across the workspace.
//!
//! Generated from the `.proto` files in the workspace-level `protos/`
//! directory by `build.rs`.

/// Measurement payloads decoded by the protobuf mapping types.
pub mod measurement {
    include!("generated/measurement.rs");
}

pub use measurement::{InternalCustomMeasurement, StaticCustomMeasurement};
