//! ---
//! fleetsim_section: "03-networking-external-interfaces"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Transport to the telemetry ingestion service."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use fleetsim_common::config::IngestConfig;
use fleetsim_schemas::fleet::v1::fleet_service_client::FleetServiceClient;
use fleetsim_schemas::{BookingResponse, CarStatus, API_TOKEN_HEADER};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Endpoint;
use tonic::{Request, Status};
use tracing::debug;

/// Outbound half of a telemetry call.
pub type TelemetryStream = BoxStream<'static, CarStatus>;

/// Inbound half of a telemetry call, in the order the endpoint emits it.
pub type AckStream = BoxStream<'static, Result<BookingResponse, Status>>;

/// Opens `StreamTelemetry` calls on behalf of a single vehicle.
#[tonic::async_trait]
pub trait TelemetryLink: Send + Sync {
    /// Start the call. `outbound` is polled by the transport for as long as
    /// the call is alive; the returned stream yields acknowledgements until the
    /// endpoint closes the call or the transport fails.
    async fn open(&self, vehicle_id: &str, outbound: TelemetryStream)
        -> Result<AckStream, Status>;
}

/// Errors raised while building a link from configuration.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The endpoint address is not a valid URI.
    #[error("invalid ingestion endpoint {address}: {source}")]
    InvalidEndpoint {
        /// Address as configured.
        address: String,
        /// Underlying parse failure.
        #[source]
        source: tonic::transport::Error,
    },
    /// The token cannot be carried as an ASCII metadata value.
    #[error("auth token is not a valid metadata value")]
    InvalidToken,
}

/// gRPC link to the ingestion service.
///
/// Every [`open`](TelemetryLink::open) builds its own channel, so vehicles never
/// share a connection.
#[derive(Clone)]
pub struct GrpcLink {
    endpoint: Endpoint,
    token: MetadataValue<Ascii>,
    open_timeout: Duration,
}

impl GrpcLink {
    /// Validate the endpoint and token; both are bootstrap concerns.
    pub fn new(address: &str, token: &str) -> Result<Self, LinkError> {
        let defaults = IngestConfig::default();
        let endpoint = Endpoint::from_shared(address.to_owned())
            .map_err(|source| LinkError::InvalidEndpoint {
                address: address.to_owned(),
                source,
            })?
            .keep_alive_while_idle(true);
        let token = token
            .parse::<MetadataValue<Ascii>>()
            .map_err(|_| LinkError::InvalidToken)?;
        Ok(Self {
            endpoint,
            token,
            open_timeout: defaults.open_timeout,
        }
        .with_connect_timeout(defaults.connect_timeout)
        .with_keep_alive(defaults.keep_alive_interval, defaults.keep_alive_timeout))
    }

    /// Build a link from the `[ingest]` configuration section.
    pub fn from_config(config: &IngestConfig) -> Result<Self, LinkError> {
        Ok(Self::new(&config.endpoint_uri(), &config.auth_token)?
            .with_connect_timeout(config.connect_timeout)
            .with_open_timeout(config.open_timeout)
            .with_keep_alive(config.keep_alive_interval, config.keep_alive_timeout))
    }

    /// Bound on establishing the TCP connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.endpoint = self.endpoint.connect_timeout(timeout);
        self
    }

    /// Bound on waiting for response headers once the call is sent.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// HTTP/2 PINGs every `interval`; one unanswered for `timeout` fails the call.
    pub fn with_keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.endpoint = self
            .endpoint
            .http2_keep_alive_interval(interval)
            .keep_alive_timeout(timeout);
        self
    }
}

impl fmt::Debug for GrpcLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcLink")
            .field("endpoint", &self.endpoint.uri())
            .field("token", &"<redacted>")
            .field("open_timeout", &self.open_timeout)
            .finish()
    }
}

/// tonic requires a `Sync` streaming request body.
struct SyncStream(Mutex<TelemetryStream>);

impl Stream for SyncStream {
    type Item = CarStatus;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<CarStatus>> {
        self.get_mut().0.get_mut().poll_next_unpin(cx)
    }
}

#[tonic::async_trait]
impl TelemetryLink for GrpcLink {
    async fn open(
        &self,
        vehicle_id: &str,
        outbound: TelemetryStream,
    ) -> Result<AckStream, Status> {
        let channel = self.endpoint.connect_lazy();
        let mut client = FleetServiceClient::new(channel);

        let mut request = Request::new(SyncStream(Mutex::new(outbound)));
        request
            .metadata_mut()
            .insert(API_TOKEN_HEADER, self.token.clone());

        debug!(vehicle_id, endpoint = %self.endpoint.uri(), "opening telemetry stream");
        let response = tokio::time::timeout(self.open_timeout, client.stream_telemetry(request))
            .await
            .map_err(|_| {
                Status::deadline_exceeded(format!(
                    "no response from {} within {:?}",
                    self.endpoint.uri(),
                    self.open_timeout
                ))
            })??;
        Ok(response.into_inner().boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_endpoint() {
        let err = GrpcLink::new("http://exa mple:50051", "token").unwrap_err();
        assert!(matches!(err, LinkError::InvalidEndpoint { .. }));
    }

    #[test]
    fn rejects_token_with_control_characters() {
        let err = GrpcLink::new("http://127.0.0.1:1", "bad\ntoken").unwrap_err();
        assert!(matches!(err, LinkError::InvalidToken));
    }

    #[test]
    fn debug_output_redacts_the_token() {
        let link = GrpcLink::new("http://127.0.0.1:1", "s3cret").unwrap();
        let rendered = format!("{link:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("127.0.0.1"));
    }

    #[test]
    fn from_config_assumes_plaintext_scheme() {
        let config = IngestConfig {
            endpoint: "127.0.0.1:50051".into(),
            ..IngestConfig::default()
        };
        let link = GrpcLink::from_config(&config).unwrap();
        assert_eq!(link.endpoint.uri().scheme_str(), Some("http"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_surfaces_as_status() {
        // Port 1 is reserved and refuses connections on loopback.
        let link = GrpcLink::new("http://127.0.0.1:1", "token")
            .unwrap()
            .with_connect_timeout(Duration::from_millis(500));
        let outbound = futures::stream::pending().boxed();
        let err = match link.open("CAR-001", outbound).await {
            Ok(_) => panic!("expected the call to fail"),
            Err(status) => status,
        };
        assert!(
            matches!(err.code(), tonic::Code::Unavailable | tonic::Code::Unknown),
            "unexpected code {:?}",
            err.code()
        );
    }

    #[test]
    fn request_body_satisfies_tonic_bounds() {
        fn streaming_body<S: Stream<Item = CarStatus> + Send + Sync + 'static>(_: &S) {}
        let body = SyncStream(Mutex::new(futures::stream::pending().boxed()));
        streaming_body(&body);
    }

    #[tokio::test]
    async fn silent_peer_fails_open_with_deadline_exceeded() {
        // Accepts TCP connections and never speaks HTTP/2.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let link = GrpcLink::new(&format!("http://{addr}"), "token")
            .unwrap()
            .with_open_timeout(Duration::from_millis(300));
        let opened = tokio::time::timeout(
            Duration::from_secs(5),
            link.open("CAR-001", futures::stream::pending().boxed()),
        )
        .await
        .expect("open must give up on a silent peer");
        let err = match opened {
            Ok(_) => panic!("expected the call to fail"),
            Err(status) => status,
        };
        assert_eq!(err.code(), tonic::Code::DeadlineExceeded);
        assert!(err.message().contains(&addr.to_string()), "message: {}", err.message());

        silent.abort();
    }
}
