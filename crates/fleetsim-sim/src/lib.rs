//! ---
//! fleetsim_section: "02-simulation"
//! fleetsim_subsection: "01-bootstrap"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Simulation module exports and shared types."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
//! Virtual vehicles and the telemetry they emit.
//!
//! [`Vehicle`] evolves one car's position and battery by a bounded random
//! walk, [`TelemetryEncoder`] snapshots it into a timestamped
//! [`TelemetryFrame`], and [`presentation`] renders frames for consoles.

pub mod presentation;
pub mod telemetry;
pub mod vehicle;

pub use presentation::{render_tick, BatteryBand};
pub use telemetry::{TelemetryEncoder, TelemetryFrame};
pub use vehicle::{vehicle_id, GeoBounds, Vehicle, VehicleState, MANHATTAN};
