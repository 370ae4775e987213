//! ---
//! fleetsim_section: "02-simulation"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Telemetry frames and wire encoding."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use fleetsim_common::time::epoch_millis;
use fleetsim_schemas::CarStatus;
use serde::{Deserialize, Serialize};

use crate::vehicle::Vehicle;

/// Immutable snapshot of a vehicle, stamped when it was encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub battery_level: f64,
    pub velocity: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

/// Turns vehicle state into frames for one session.
///
/// Timestamps never go backwards for a given encoder, even if the wall clock
/// is stepped back between ticks.
#[derive(Debug, Default, Clone)]
pub struct TelemetryEncoder {
    last_timestamp_ms: Option<i64>,
}

impl TelemetryEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the vehicle and encode the result in one step.
    pub fn advance(&mut self, vehicle: &mut Vehicle) -> TelemetryFrame {
        vehicle.update();
        self.encode(vehicle)
    }

    pub fn encode(&mut self, vehicle: &Vehicle) -> TelemetryFrame {
        self.encode_at(vehicle, epoch_millis())
    }

    pub fn encode_at(&mut self, vehicle: &Vehicle, now_ms: i64) -> TelemetryFrame {
        let timestamp_ms = match self.last_timestamp_ms {
            Some(last) => now_ms.max(last),
            None => now_ms,
        };
        self.last_timestamp_ms = Some(timestamp_ms);

        let state = vehicle.state();
        TelemetryFrame {
            vehicle_id: vehicle.id().to_owned(),
            latitude: state.latitude,
            longitude: state.longitude,
            battery_level: state.battery_level,
            velocity: state.velocity,
            timestamp_ms,
        }
    }
}

impl From<TelemetryFrame> for CarStatus {
    fn from(frame: TelemetryFrame) -> Self {
        Self {
            car_id: frame.vehicle_id,
            latitude: frame.latitude,
            longitude: frame.longitude,
            battery_level: frame.battery_level,
            velocity: frame.velocity,
            timestamp: frame.timestamp_ms,
        }
    }
}

impl From<&TelemetryFrame> for CarStatus {
    fn from(frame: &TelemetryFrame) -> Self {
        frame.clone().into()
    }
}
