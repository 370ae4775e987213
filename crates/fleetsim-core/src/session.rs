//! ---
//! fleetsim_section: "01-core-functionality"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Streaming session owning one vehicle's bidirectional call."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetsim_metrics::FleetMetrics;
use fleetsim_net::{TelemetryLink, TelemetryStream};
use fleetsim_schemas::CarStatus;
use fleetsim_sim::{TelemetryEncoder, Vehicle};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, info, trace, warn};

use crate::observer::{Acknowledgement, TelemetryObserver};

/// The transport has taken a message before the next one is produced.
const OUTBOUND_CAPACITY: usize = 1;

/// How long the inbound side may keep running after the transport stopped
/// accepting telemetry.
const OUTBOUND_CLOSED_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Streaming,
    ClosedNormal,
    ClosedError,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        matches!(self, SessionState::ClosedNormal | SessionState::ClosedError)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The endpoint closed the stream cleanly.
    Completed,
    /// Cancelled by the orchestrator or an operator.
    Interrupted,
    /// Transport failure, attributed to the session's vehicle.
    Failed { code: Code, detail: String },
}

impl SessionOutcome {
    pub fn from_status(status: &Status) -> Self {
        SessionOutcome::Failed {
            code: status.code(),
            detail: status.message().to_owned(),
        }
    }

    /// Metric and log label.
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::Interrupted => "interrupted",
            SessionOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SessionOutcome::Failed { .. })
    }

    pub fn closed_state(&self) -> SessionState {
        if self.is_failure() {
            SessionState::ClosedError
        } else {
            SessionState::ClosedNormal
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Failed { code, detail } if detail.is_empty() => {
                write!(f, "failed ({code:?})")
            }
            SessionOutcome::Failed { code, detail } => write!(f, "failed ({code:?}): {detail}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Final account of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub vehicle_id: String,
    pub outcome: SessionOutcome,
    /// Messages handed to the request stream. May exceed what the endpoint
    /// read by the single message still buffered when the call ended.
    pub ticks_sent: u64,
    /// Acknowledgements surfaced to the observer.
    pub acknowledgements: u64,
}

/// Running totals, readable while the session is alive.
#[derive(Debug, Default)]
pub struct SessionCounters {
    ticks_sent: AtomicU64,
    acknowledgements: AtomicU64,
}

impl SessionCounters {
    pub fn ticks_sent(&self) -> u64 {
        self.ticks_sent.load(Ordering::Relaxed)
    }

    pub fn acknowledgements(&self) -> u64 {
        self.acknowledgements.load(Ordering::Relaxed)
    }
}

/// Tick source for the outbound loop. A zero period never sleeps.
#[derive(Debug)]
enum Cadence {
    Immediate,
    Every(Interval),
}

impl Cadence {
    fn new(period: Duration) -> Self {
        if period.is_zero() {
            return Cadence::Immediate;
        }
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Cadence::Every(interval)
    }

    async fn tick(&mut self) {
        match self {
            Cadence::Immediate => tokio::task::yield_now().await,
            Cadence::Every(interval) => {
                interval.tick().await;
            }
        }
    }
}

/// Publishes state transitions and keeps the active-session gauge honest,
/// including when the task is aborted or unwinds.
struct Lifecycle {
    state: watch::Sender<SessionState>,
    metrics: Option<FleetMetrics>,
}

impl Lifecycle {
    fn begin(state: watch::Sender<SessionState>, metrics: Option<FleetMetrics>) -> Self {
        if let Some(metrics) = &metrics {
            metrics.session_started();
        }
        Self { state, metrics }
    }

    fn set(&self, next: SessionState) {
        self.state.send_replace(next);
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        let closed = if std::thread::panicking() {
            SessionState::ClosedError
        } else {
            SessionState::ClosedNormal
        };
        self.state.send_if_modified(|state| {
            if state.is_closed() {
                false
            } else {
                *state = closed;
                true
            }
        });
        if let Some(metrics) = &self.metrics {
            metrics.session_ended();
        }
    }
}

/// One vehicle's bidirectional call to the ingestion endpoint.
///
/// The outbound loop owns the [`Vehicle`] exclusively; the inbound loop only
/// sees acknowledgements. Both run on the task that calls [`run`](Self::run).
pub struct StreamingSession {
    vehicle: Vehicle,
    link: Arc<dyn TelemetryLink>,
    interval: Duration,
    observer: Arc<dyn TelemetryObserver>,
    metrics: Option<FleetMetrics>,
    state: watch::Sender<SessionState>,
    counters: Arc<SessionCounters>,
}

impl fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingSession")
            .field("vehicle_id", &self.vehicle.id())
            .field("interval", &self.interval)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl StreamingSession {
    pub fn new(
        vehicle: Vehicle,
        link: Arc<dyn TelemetryLink>,
        interval: Duration,
        observer: Arc<dyn TelemetryObserver>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Initializing);
        Self {
            vehicle,
            link,
            interval,
            observer,
            metrics: None,
            state,
            counters: Arc::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: FleetMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn counters(&self) -> Arc<SessionCounters> {
        self.counters.clone()
    }

    /// Drive the session until the endpoint closes it, the transport fails
    /// or `cancel` fires. Every ending is reported to the observer once.
    pub async fn run(self, cancel: CancellationToken) -> SessionReport {
        let StreamingSession {
            mut vehicle,
            link,
            interval,
            observer,
            metrics,
            state,
            counters,
        } = self;
        let vehicle_id = vehicle.id().to_owned();
        let lifecycle = Lifecycle::begin(state, metrics.clone());

        let (tx, rx) = mpsc::channel::<CarStatus>(OUTBOUND_CAPACITY);
        let request: TelemetryStream =
            futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) })
                .boxed();

        let outbound = produce(
            &mut vehicle,
            tx,
            interval,
            observer.as_ref(),
            metrics.as_ref(),
            &counters,
        );
        tokio::pin!(outbound);
        let mut outbound_closed_at: Option<Instant> = None;

        debug!(vehicle_id = %vehicle_id, "opening session");
        // The call is opened while the outbound loop is already producing;
        // some endpoints only answer once the first message has arrived.
        let opened = {
            let open = link.open(&vehicle_id, request);
            tokio::pin!(open);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Err(SessionOutcome::Interrupted),
                    result = &mut open => {
                        break result.map_err(|status| SessionOutcome::from_status(&status));
                    }
                    _ = &mut outbound, if outbound_closed_at.is_none() => {
                        outbound_closed_at = Some(Instant::now());
                    }
                }
            }
        };

        let outcome = match opened {
            Err(outcome) => outcome,
            Ok(mut inbound) => {
                lifecycle.set(SessionState::Streaming);
                info!(vehicle_id = %vehicle_id, "telemetry stream established");
                loop {
                    let drain_deadline = outbound_closed_at
                        .map(|at| at + OUTBOUND_CLOSED_GRACE)
                        .unwrap_or_else(Instant::now);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break SessionOutcome::Interrupted,
                        next = inbound.next() => match next {
                            Some(Ok(response)) => {
                                let ack = Acknowledgement::from_response(&vehicle_id, response);
                                if ack.is_unknown() {
                                    trace!(vehicle_id = %vehicle_id, "ignoring no-op acknowledgement");
                                    continue;
                                }
                                counters.acknowledgements.fetch_add(1, Ordering::Relaxed);
                                if let Some(metrics) = &metrics {
                                    metrics.record_ack(&vehicle_id);
                                }
                                observer.on_acknowledgement(&ack);
                            }
                            Some(Err(status)) => break SessionOutcome::from_status(&status),
                            None => break SessionOutcome::Completed,
                        },
                        _ = &mut outbound, if outbound_closed_at.is_none() => {
                            outbound_closed_at = Some(Instant::now());
                        }
                        _ = tokio::time::sleep_until(drain_deadline), if outbound_closed_at.is_some() => {
                            break SessionOutcome::Failed {
                                code: Code::Unavailable,
                                detail: "transport stopped accepting telemetry".to_owned(),
                            };
                        }
                    }
                }
            }
        };

        lifecycle.set(outcome.closed_state());
        if let Some(metrics) = &metrics {
            metrics.record_termination(&vehicle_id, outcome.label());
        }
        observer.on_session_end(&vehicle_id, &outcome);
        if outcome.is_failure() {
            warn!(vehicle_id = %vehicle_id, outcome = %outcome, "session terminated");
        } else {
            debug!(vehicle_id = %vehicle_id, outcome = %outcome, "session terminated");
        }

        SessionReport {
            vehicle_id,
            outcome,
            ticks_sent: counters.ticks_sent(),
            acknowledgements: counters.acknowledgements(),
        }
    }
}

/// Outbound loop. Returns only when the transport drops the request stream.
async fn produce(
    vehicle: &mut Vehicle,
    tx: mpsc::Sender<CarStatus>,
    interval: Duration,
    observer: &dyn TelemetryObserver,
    metrics: Option<&FleetMetrics>,
    counters: &SessionCounters,
) {
    let mut encoder = TelemetryEncoder::new();
    let mut cadence = Cadence::new(interval);
    loop {
        cadence.tick().await;
        let frame = encoder.advance(vehicle);
        if tx.send(CarStatus::from(&frame)).await.is_err() {
            debug!(vehicle_id = %frame.vehicle_id, "transport closed the request stream");
            return;
        }
        counters.ticks_sent.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = metrics {
            metrics.record_tick(&frame.vehicle_id);
        }
        observer.on_tick(&frame);
    }
}
