//! ---
//! fleetsim_section: "03-networking-external-interfaces"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Loopback ingestion endpoint for tests and local runs."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleetsim_common::time::epoch_millis;
use fleetsim_schemas::fleet::v1::fleet_service_server::{FleetService, FleetServiceServer};
use fleetsim_schemas::{BookingResponse, BookingStatus, CarStatus, API_TOKEN_HEADER};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tonic::metadata::MetadataMap;
use tonic::transport::server::TcpIncoming;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::link::{AckStream, TelemetryLink, TelemetryStream};

const ACK_BUFFER: usize = 16;
const SERVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How the loopback endpoint answers telemetry.
#[derive(Debug, Clone)]
pub struct IngestBehaviour {
    /// Status stamped on every acknowledgement.
    pub ack_status: BookingStatus,
    /// Message stamped on every acknowledgement.
    pub ack_message: String,
    /// Per-vehicle message budget; the next message aborts the call with `UNAVAILABLE`.
    pub fail_after: HashMap<String, usize>,
}

impl Default for IngestBehaviour {
    fn default() -> Self {
        Self {
            ack_status: BookingStatus::BookingUnknown,
            ack_message: "Telemetry received".to_owned(),
            fail_after: HashMap::new(),
        }
    }
}

impl IngestBehaviour {
    /// Answer with `status` instead of the no-op default.
    pub fn acknowledge_with(mut self, status: BookingStatus) -> Self {
        self.ack_status = status;
        self
    }

    /// Acknowledge `messages` from `vehicle_id`, then abort its stream.
    pub fn fail_after(mut self, vehicle_id: impl Into<String>, messages: usize) -> Self {
        self.fail_after.insert(vehicle_id.into(), messages);
        self
    }
}

/// In-process ingestion logic shared by the gRPC server and [`InMemoryLink`].
///
/// Records every accepted `CarStatus` per vehicle.
#[derive(Debug, Clone, Default)]
pub struct LoopbackIngest {
    behaviour: Arc<IngestBehaviour>,
    received: Arc<Mutex<HashMap<String, Vec<CarStatus>>>>,
}

impl LoopbackIngest {
    /// Create an endpoint with the given behaviour.
    pub fn new(behaviour: IngestBehaviour) -> Self {
        Self {
            behaviour: Arc::new(behaviour),
            received: Arc::default(),
        }
    }

    /// Serve one call: consume `inbound` on a background task and return the
    /// acknowledgement stream.
    pub fn accept<S>(&self, inbound: S) -> AckStream
    where
        S: Stream<Item = Result<CarStatus, Status>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(ACK_BUFFER);
        let ingest = self.clone();
        tokio::spawn(async move {
            ingest.pump(inbound, tx).await;
        });
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }

    /// Messages accepted from `vehicle_id`, in arrival order.
    pub fn received(&self, vehicle_id: &str) -> Vec<CarStatus> {
        self.received
            .lock()
            .get(vehicle_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of messages accepted from `vehicle_id`.
    pub fn received_count(&self, vehicle_id: &str) -> usize {
        self.received.lock().get(vehicle_id).map_or(0, Vec::len)
    }

    /// Vehicles that have sent at least one message, sorted.
    pub fn vehicles(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.received.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn pump<S>(self, inbound: S, tx: mpsc::Sender<Result<BookingResponse, Status>>)
    where
        S: Stream<Item = Result<CarStatus, Status>> + Send + 'static,
    {
        let mut inbound = Box::pin(inbound);
        while let Some(next) = inbound.next().await {
            let status = match next {
                Ok(status) => status,
                Err(err) => {
                    debug!(code = ?err.code(), error = %err.message(), "inbound telemetry stream ended");
                    break;
                }
            };

            let car_id = status.car_id.clone();
            let reply = self.record(status);
            let aborted = reply.is_err();
            if aborted {
                warn!(vehicle_id = %car_id, "loopback ingest aborting stream (injected fault)");
            }
            if tx.send(reply).await.is_err() || aborted {
                break;
            }
        }
    }

    fn record(&self, status: CarStatus) -> Result<BookingResponse, Status> {
        let car_id = status.car_id.clone();
        let mut received = self.received.lock();
        let entries = received.entry(car_id.clone()).or_default();
        if let Some(limit) = self.behaviour.fail_after.get(&car_id) {
            if entries.len() >= *limit {
                return Err(Status::unavailable(format!(
                    "injected fault for {car_id} after {limit} messages"
                )));
            }
        }
        entries.push(status);
        Ok(self.acknowledgement(&car_id))
    }

    fn acknowledgement(&self, car_id: &str) -> BookingResponse {
        let now = epoch_millis();
        BookingResponse {
            booking_id: format!("ack-{car_id}-{now}"),
            car_id: car_id.to_owned(),
            status: self.behaviour.ack_status as i32,
            message: self.behaviour.ack_message.clone(),
            timestamp: now,
        }
    }
}

/// [`TelemetryLink`] that talks to a [`LoopbackIngest`] without a network hop.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLink {
    ingest: LoopbackIngest,
    refused: Arc<HashSet<String>>,
    opened: Arc<Mutex<Vec<String>>>,
}

impl InMemoryLink {
    /// Link every call to `ingest`.
    pub fn new(ingest: LoopbackIngest) -> Self {
        Self {
            ingest,
            ..Self::default()
        }
    }

    /// Reject calls from `vehicle_id` as if the connection were refused.
    pub fn refuse(mut self, vehicle_id: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.refused).insert(vehicle_id.into());
        self
    }

    /// Vehicles that opened a call, in order of arrival.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    /// Backing endpoint.
    pub fn ingest(&self) -> &LoopbackIngest {
        &self.ingest
    }
}

#[tonic::async_trait]
impl TelemetryLink for InMemoryLink {
    async fn open(
        &self,
        vehicle_id: &str,
        outbound: TelemetryStream,
    ) -> Result<AckStream, Status> {
        self.opened.lock().push(vehicle_id.to_owned());
        if self.refused.contains(vehicle_id) {
            return Err(Status::unavailable(format!(
                "connection refused for {vehicle_id}"
            )));
        }
        Ok(self.ingest.accept(outbound.map(Ok)))
    }
}

/// Builder for the loopback gRPC server.
#[derive(Debug, Clone)]
pub struct LoopbackServerBuilder {
    listen: SocketAddr,
    token: String,
    ingest: LoopbackIngest,
}

impl LoopbackServerBuilder {
    /// Serve `ingest` on `listen`, accepting only calls carrying `token`.
    pub fn new(listen: SocketAddr, token: impl Into<String>, ingest: LoopbackIngest) -> Self {
        Self {
            listen,
            token: token.into(),
            ingest,
        }
    }

    /// Bind and spawn the server, returning a handle for coordinated shutdown.
    pub async fn spawn(self) -> anyhow::Result<LoopbackServerHandle> {
        let listener = tokio::net::TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "loopback ingest listening");

        let service = IngestSvc {
            token: self.token,
            ingest: self.ingest.clone(),
        };

        let incoming = TcpIncoming::from_listener(listener, true, None)
            .map_err(|err| anyhow::anyhow!("failed to build loopback incoming listener: {err}"))?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let server = Server::builder()
                .add_service(FleetServiceServer::new(service))
                .serve_with_incoming_shutdown(incoming, async move {
                    let _ = shutdown_rx.changed().await;
                });
            if let Err(err) = server.await {
                warn!(error = %err, "loopback ingest exited with error");
            }
        });

        Ok(LoopbackServerHandle {
            address: local_addr,
            ingest: self.ingest,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle returned when spawning the loopback server.
#[derive(Debug)]
pub struct LoopbackServerHandle {
    address: SocketAddr,
    ingest: LoopbackIngest,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LoopbackServerHandle {
    /// Socket address the server bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Endpoint URI clients should dial.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.address)
    }

    /// Recorded traffic.
    pub fn ingest(&self) -> &LoopbackIngest {
        &self.ingest
    }

    /// Signal shutdown and wait briefly for open calls to drain.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(SERVER_SHUTDOWN_GRACE, &mut self.task).await {
            Ok(joined) => joined.map_err(|err| anyhow::anyhow!(err)),
            Err(_) => {
                warn!("loopback ingest still serving open calls; aborting");
                self.task.abort();
                Ok(())
            }
        }
    }
}

struct IngestSvc {
    token: String,
    ingest: LoopbackIngest,
}

#[tonic::async_trait]
impl FleetService for IngestSvc {
    type StreamTelemetryStream = AckStream;

    async fn stream_telemetry(
        &self,
        request: Request<Streaming<CarStatus>>,
    ) -> Result<Response<Self::StreamTelemetryStream>, Status> {
        validate_token(request.metadata(), &self.token)?;
        debug!("loopback ingest accepted telemetry stream");
        Ok(Response::new(self.ingest.accept(request.into_inner())))
    }
}

fn validate_token(metadata: &MetadataMap, expected: &str) -> Result<(), Status> {
    let token = metadata
        .get(API_TOKEN_HEADER)
        .ok_or_else(|| Status::unauthenticated(format!("missing {API_TOKEN_HEADER}")))?;
    match token.to_str() {
        Ok(value) if value == expected => Ok(()),
        _ => Err(Status::unauthenticated(format!("invalid {API_TOKEN_HEADER}"))),
    }
}
