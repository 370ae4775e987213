//! Fleet telemetry schema library.
//!
//! Re-exports the generated protobuf modules so other crates depend on a
//! stable path (`fleetsim_schemas::fleet::v1`).

pub mod fleet {
    pub mod v1 {
        tonic::include_proto!("fleet.v1");
    }
}

pub use fleet::v1::{BookingResponse, BookingStatus, CarStatus};

/// Metadata key carrying the shared ingestion secret.
pub const API_TOKEN_HEADER: &str = "x-api-token";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_is_the_proto3_default() {
        assert_eq!(BookingStatus::BookingUnknown as i32, 0);
        assert_eq!(BookingResponse::default().status(), BookingStatus::BookingUnknown);
    }

    #[test]
    fn unrecognised_status_values_decode_to_unknown_accessor() {
        let response = BookingResponse {
            status: 42,
            ..BookingResponse::default()
        };
        assert_eq!(response.status, 42);
        assert_eq!(response.status(), BookingStatus::BookingUnknown);
    }
}
