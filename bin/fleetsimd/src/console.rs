//! ---
//! fleetsim_section: "01-core-functionality"
//! fleetsim_subsection: "binary"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Console observer printing ticks and acknowledgements."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use fleetsim_core::{Acknowledgement, SessionOutcome, TelemetryObserver, TracingObserver};
use fleetsim_sim::{render_tick, TelemetryFrame};

/// Prints one line per tick and per acknowledgement, and forwards every
/// event to [`TracingObserver`].
#[derive(Debug, Clone, Copy)]
pub struct ConsoleObserver {
    colour: bool,
    tracing: TracingObserver,
}

impl ConsoleObserver {
    pub fn new(colour: bool) -> Self {
        Self {
            colour,
            tracing: TracingObserver,
        }
    }
}

impl TelemetryObserver for ConsoleObserver {
    fn on_tick(&self, frame: &TelemetryFrame) {
        println!("{}", render_tick(frame, self.colour));
        self.tracing.on_tick(frame);
    }

    fn on_acknowledgement(&self, ack: &Acknowledgement) {
        println!("📬 Server response for {}: {}", ack.vehicle_id, ack.message);
        self.tracing.on_acknowledgement(ack);
    }

    fn on_session_end(&self, vehicle_id: &str, outcome: &SessionOutcome) {
        if outcome.is_failure() {
            eprintln!("❌ Error for {vehicle_id}: {outcome}");
        }
        self.tracing.on_session_end(vehicle_id, outcome);
    }
}
