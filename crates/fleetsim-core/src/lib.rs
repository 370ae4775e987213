//! ---
//! fleetsim_section: "01-core-functionality"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Streaming sessions and fleet orchestration."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
//! Streaming sessions, the observation boundary and the fleet orchestrator.

pub mod observer;
pub mod orchestrator;
pub mod session;

pub use observer::{Acknowledgement, RecordingObserver, TelemetryObserver, TracingObserver};
pub use orchestrator::{FleetHandle, FleetOrchestrator, FleetReport};
pub use session::{
    SessionCounters, SessionOutcome, SessionReport, SessionState, StreamingSession,
};
