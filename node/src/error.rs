use std::io;

use crate::{
    clock::TimeSourceError, peripherals::PeripheralError, store::StoreError,
    telemetry::TelemetryError,
};

/// Everything that can end a single trigger early.
///
/// None of these are fatal to the node; the session driver logs them and
/// goes back to waiting.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("peripheral unavailable: {0}")]
    PeripheralUnavailable(String),
    #[error("network time unavailable: {0}")]
    TimeSourceUnavailable(#[from] TimeSourceError),
    #[error("storage failure: {0}")]
    StorageFailure(#[source] StoreError),
    #[error("could not connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },
    #[error("transport unavailable: {0}")]
    TransportUnavailable(#[source] io::Error),
    #[error("broker disconnected: {0}")]
    BrokerDisconnected(#[from] TelemetryError),
}

impl From<PeripheralError> for PipelineError {
    fn from(value: PeripheralError) -> Self {
        Self::PeripheralUnavailable(value.to_string())
    }
}

impl From<StoreError> for PipelineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Unavailable(_) => Self::PeripheralUnavailable(value.to_string()),
            other => Self::StorageFailure(other),
        }
    }
}

impl PipelineError {
    /// Failures after persisting; the artifact stays on storage.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::ConnectFailed { .. }
                | PipelineError::TransportUnavailable(_)
                | PipelineError::BrokerDisconnected(_)
        )
    }
}
