//! ---
//! fleetsim_section: "01-core-functionality"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Fleet orchestration and lifecycle management."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleetsim_common::config::FleetConfig;
use fleetsim_metrics::FleetMetrics;
use fleetsim_net::TelemetryLink;
use fleetsim_sim::{vehicle_id, Vehicle};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::{error, info, warn};

use crate::observer::TelemetryObserver;
use crate::session::{SessionCounters, SessionOutcome, SessionReport, SessionState, StreamingSession};

/// Starts one streaming session per configured vehicle.
pub struct FleetOrchestrator {
    config: FleetConfig,
    link: Arc<dyn TelemetryLink>,
    observer: Arc<dyn TelemetryObserver>,
    metrics: Option<FleetMetrics>,
}

impl FleetOrchestrator {
    pub fn new(
        config: FleetConfig,
        link: Arc<dyn TelemetryLink>,
        observer: Arc<dyn TelemetryObserver>,
    ) -> Self {
        Self {
            config,
            link,
            observer,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: FleetMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawn exactly `fleet.size` session tasks. Must be called from within a
    /// tokio runtime.
    pub fn start(self) -> FleetHandle {
        let cancel = CancellationToken::new();
        let mut sessions = Vec::with_capacity(self.config.size);

        for index in 1..=self.config.size {
            let id = vehicle_id(index);
            let vehicle = match self.config.seed {
                Some(seed) => Vehicle::seeded(id.clone(), seed.wrapping_add(index as u64)),
                None => Vehicle::from_entropy(id.clone()),
            };

            let mut session = StreamingSession::new(
                vehicle,
                self.link.clone(),
                self.config.update_interval,
                self.observer.clone(),
            );
            if let Some(metrics) = &self.metrics {
                session = session.with_metrics(metrics.clone());
            }
            let state = session.subscribe();
            let counters = session.counters();
            let task = tokio::spawn(session.run(cancel.child_token()));

            sessions.push(SessionHandle {
                vehicle_id: id,
                state,
                counters,
                task,
            });
        }

        info!(
            fleet_size = self.config.size,
            update_interval_ms = self.config.update_interval.as_millis() as u64,
            "fleet started"
        );

        FleetHandle {
            cancel,
            sessions,
            grace: self.config.shutdown_grace,
            observer: self.observer,
            metrics: self.metrics,
        }
    }
}

#[derive(Debug)]
struct SessionHandle {
    vehicle_id: String,
    state: watch::Receiver<SessionState>,
    counters: Arc<SessionCounters>,
    task: JoinHandle<SessionReport>,
}

/// Handle returned from [`FleetOrchestrator::start`].
pub struct FleetHandle {
    cancel: CancellationToken,
    sessions: Vec<SessionHandle>,
    grace: Duration,
    observer: Arc<dyn TelemetryObserver>,
    metrics: Option<FleetMetrics>,
}

impl FleetHandle {
    pub fn vehicle_ids(&self) -> Vec<String> {
        self.sessions
            .iter()
            .map(|session| session.vehicle_id.clone())
            .collect()
    }

    /// Current state of every session, in vehicle order.
    pub fn session_states(&self) -> Vec<(String, SessionState)> {
        self.sessions
            .iter()
            .map(|session| (session.vehicle_id.clone(), *session.state.borrow()))
            .collect()
    }

    pub fn state_of(&self, vehicle_id: &str) -> Option<SessionState> {
        self.sessions
            .iter()
            .find(|session| session.vehicle_id == vehicle_id)
            .map(|session| *session.state.borrow())
    }

    /// Cancel every session now and collect the reports.
    pub async fn shutdown(self) -> FleetReport {
        self.run_until(std::future::ready(())).await
    }

    /// Wait for all sessions to end. Once `signal` resolves the fleet is
    /// cancelled; sessions still running after the grace period are aborted.
    pub async fn run_until<F>(self, signal: F) -> FleetReport
    where
        F: Future<Output = ()>,
    {
        let FleetHandle {
            cancel,
            sessions,
            grace,
            observer,
            metrics,
        } = self;

        let mut reports: Vec<Option<SessionReport>> = Vec::with_capacity(sessions.len());
        let mut tracked: Vec<(String, Arc<SessionCounters>, AbortHandle)> =
            Vec::with_capacity(sessions.len());
        let mut running = FuturesUnordered::new();
        for (index, session) in sessions.into_iter().enumerate() {
            reports.push(None);
            tracked.push((
                session.vehicle_id,
                session.counters,
                session.task.abort_handle(),
            ));
            let task = session.task;
            running.push(async move { (index, task.await) });
        }

        tokio::pin!(signal);
        let mut signalled = false;
        let mut aborted = false;
        let mut deadline = Instant::now();

        while !running.is_empty() {
            tokio::select! {
                biased;
                joined = running.next() => {
                    if let Some((index, result)) = joined {
                        let (vehicle_id, counters, _) = &tracked[index];
                        let report = resolve(
                            vehicle_id,
                            counters,
                            result,
                            observer.as_ref(),
                            metrics.as_ref(),
                        );
                        info!(
                            vehicle_id = %report.vehicle_id,
                            outcome = %report.outcome,
                            ticks_sent = report.ticks_sent,
                            "session finished"
                        );
                        reports[index] = Some(report);
                    }
                }
                _ = &mut signal, if !signalled => {
                    signalled = true;
                    deadline = Instant::now() + grace;
                    info!(remaining = running.len(), "shutdown requested; cancelling sessions");
                    cancel.cancel();
                }
                _ = tokio::time::sleep_until(deadline), if signalled && !aborted => {
                    aborted = true;
                    warn!(
                        remaining = running.len(),
                        grace_ms = grace.as_millis() as u64,
                        "sessions did not stop within the grace period; aborting"
                    );
                    for (index, (_, _, handle)) in tracked.iter().enumerate() {
                        if reports[index].is_none() {
                            handle.abort();
                        }
                    }
                }
            }
        }

        let sessions = reports.into_iter().flatten().collect();

        let report = FleetReport { sessions };
        info!(
            sessions = report.sessions.len(),
            failed = report.failures().count(),
            ticks_sent = report.total_ticks(),
            "fleet stopped"
        );
        report
    }
}

fn resolve(
    vehicle_id: &str,
    counters: &SessionCounters,
    joined: Result<SessionReport, JoinError>,
    observer: &dyn TelemetryObserver,
    metrics: Option<&FleetMetrics>,
) -> SessionReport {
    let err = match joined {
        Ok(report) => return report,
        Err(err) => err,
    };

    let outcome = if err.is_cancelled() {
        SessionOutcome::Interrupted
    } else {
        error!(vehicle_id, error = %err, "session task panicked");
        SessionOutcome::Failed {
            code: Code::Internal,
            detail: "session task panicked".to_owned(),
        }
    };
    if let Some(metrics) = metrics {
        metrics.record_termination(vehicle_id, outcome.label());
    }
    observer.on_session_end(vehicle_id, &outcome);

    SessionReport {
        vehicle_id: vehicle_id.to_owned(),
        outcome,
        ticks_sent: counters.ticks_sent(),
        acknowledgements: counters.acknowledgements(),
    }
}

/// Reports for every vehicle, in vehicle order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetReport {
    pub sessions: Vec<SessionReport>,
}

impl FleetReport {
    pub fn get(&self, vehicle_id: &str) -> Option<&SessionReport> {
        self.sessions
            .iter()
            .find(|report| report.vehicle_id == vehicle_id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &SessionReport> {
        self.sessions
            .iter()
            .filter(|report| report.outcome.is_failure())
    }

    pub fn total_ticks(&self) -> u64 {
        self.sessions.iter().map(|report| report.ticks_sent).sum()
    }
}
