//! ---
//! fleetsim_section: "03-networking-external-interfaces"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Transport to the telemetry ingestion service."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
//! Transport seam between streaming sessions and the ingestion service.
//!
//! [`TelemetryLink`] opens one bidirectional `StreamTelemetry` call per
//! vehicle. [`GrpcLink`] is the production implementation; the [`loopback`]
//! module provides an ingestion endpoint for tests and local runs.
#![warn(missing_docs)]

pub mod link;
pub mod loopback;

pub use link::{AckStream, GrpcLink, LinkError, TelemetryLink, TelemetryStream};
pub use loopback::{
    InMemoryLink, IngestBehaviour, LoopbackIngest, LoopbackServerBuilder, LoopbackServerHandle,
};
