//! ---
//! fleetsim_section: "01-core-functionality"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Observation boundary for ticks, acknowledgements and session ends."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use fleetsim_schemas::{BookingResponse, BookingStatus};
use fleetsim_sim::TelemetryFrame;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::session::SessionOutcome;

/// Acknowledgement as surfaced to observers.
///
/// `status` keeps the raw wire value so that statuses unknown to this build
/// are still reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub vehicle_id: String,
    pub status: i32,
    pub message: String,
    pub booking_id: String,
}

impl Acknowledgement {
    /// Build from a response received on `vehicle_id`'s session. The session's
    /// id wins when the endpoint leaves `car_id` blank.
    pub fn from_response(vehicle_id: &str, response: BookingResponse) -> Self {
        let vehicle_id = if response.car_id.is_empty() {
            vehicle_id.to_owned()
        } else {
            response.car_id
        };
        Self {
            vehicle_id,
            status: response.status,
            message: response.message,
            booking_id: response.booking_id,
        }
    }

    /// The reserved "no information" status.
    pub fn is_unknown(&self) -> bool {
        self.status == BookingStatus::BookingUnknown as i32
    }

    pub fn status_label(&self) -> String {
        match BookingStatus::try_from(self.status) {
            Ok(status) => status.as_str_name().to_owned(),
            Err(_) => format!("STATUS_{}", self.status),
        }
    }
}

/// Receives everything a session reports.
///
/// Called from session tasks; implementations must not block.
pub trait TelemetryObserver: Send + Sync {
    fn on_tick(&self, frame: &TelemetryFrame);
    fn on_acknowledgement(&self, ack: &Acknowledgement);
    fn on_session_end(&self, vehicle_id: &str, outcome: &SessionOutcome);
}

/// Emits structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TelemetryObserver for TracingObserver {
    fn on_tick(&self, frame: &TelemetryFrame) {
        debug!(
            vehicle_id = %frame.vehicle_id,
            battery_level = frame.battery_level,
            latitude = frame.latitude,
            longitude = frame.longitude,
            velocity = frame.velocity,
            timestamp_ms = frame.timestamp_ms,
            "telemetry tick"
        );
    }

    fn on_acknowledgement(&self, ack: &Acknowledgement) {
        info!(
            vehicle_id = %ack.vehicle_id,
            status = %ack.status_label(),
            message = %ack.message,
            "acknowledgement received"
        );
    }

    fn on_session_end(&self, vehicle_id: &str, outcome: &SessionOutcome) {
        match outcome {
            SessionOutcome::Failed { code, detail } => {
                warn!(vehicle_id, code = ?code, detail = %detail, "session failed");
            }
            other => {
                info!(vehicle_id, outcome = other.label(), "session closed");
            }
        }
    }
}

/// Keeps every observation in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    ticks: Mutex<Vec<TelemetryFrame>>,
    acknowledgements: Mutex<Vec<Acknowledgement>>,
    terminations: Mutex<Vec<(String, SessionOutcome)>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticks(&self) -> Vec<TelemetryFrame> {
        self.ticks.lock().clone()
    }

    pub fn ticks_for(&self, vehicle_id: &str) -> usize {
        self.ticks
            .lock()
            .iter()
            .filter(|frame| frame.vehicle_id == vehicle_id)
            .count()
    }

    pub fn acknowledgements(&self) -> Vec<Acknowledgement> {
        self.acknowledgements.lock().clone()
    }

    pub fn terminations(&self) -> Vec<(String, SessionOutcome)> {
        self.terminations.lock().clone()
    }
}

impl TelemetryObserver for RecordingObserver {
    fn on_tick(&self, frame: &TelemetryFrame) {
        self.ticks.lock().push(frame.clone());
    }

    fn on_acknowledgement(&self, ack: &Acknowledgement) {
        self.acknowledgements.lock().push(ack.clone());
    }

    fn on_session_end(&self, vehicle_id: &str, outcome: &SessionOutcome) {
        self.terminations
            .lock()
            .push((vehicle_id.to_owned(), outcome.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(car_id: &str, status: i32) -> BookingResponse {
        BookingResponse {
            booking_id: "ack-1".into(),
            car_id: car_id.into(),
            status,
            message: "Telemetry received".into(),
            timestamp: 0,
        }
    }

    #[test]
    fn only_status_zero_is_unknown() {
        assert!(Acknowledgement::from_response("CAR-001", response("CAR-001", 0)).is_unknown());
        assert!(!Acknowledgement::from_response("CAR-001", response("CAR-001", 2)).is_unknown());
        assert!(!Acknowledgement::from_response("CAR-001", response("CAR-001", 42)).is_unknown());
    }

    #[test]
    fn labels_known_and_unrecognised_statuses() {
        let confirmed = Acknowledgement::from_response("CAR-001", response("CAR-001", 2));
        assert_eq!(confirmed.status_label(), "BOOKING_CONFIRMED");
        let future = Acknowledgement::from_response("CAR-001", response("CAR-001", 42));
        assert_eq!(future.status_label(), "STATUS_42");
    }

    #[test]
    fn blank_car_id_falls_back_to_session_vehicle() {
        let ack = Acknowledgement::from_response("CAR-003", response("", 1));
        assert_eq!(ack.vehicle_id, "CAR-003");
        assert_eq!(ack.booking_id, "ack-1");
    }
}
