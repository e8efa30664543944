use crate::crm::GatewayError;

/// Why a single record was not assigned.
#[derive(Debug, thiserror::Error)]
pub enum AssignError {
    #[error("no agents available")]
    NoAgentsAvailable,

    #[error("could not determine least loaded agent")]
    NoSelection,

    #[error("record {record_id} already assigned")]
    AlreadyAssigned { record_id: String },

    #[error("assigning record {record_id} failed: {reason}")]
    RemoteFailure {
        record_id: String,
        reason: String,
        #[source]
        source: Option<GatewayError>,
    },

    /// Agent discovery failed before any selection could happen.
    #[error("agent discovery failed: {0}")]
    Discovery(#[from] GatewayError),
}

impl AssignError {
    /// Soft outcomes a cycle skips over without counting as a failure.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::NoAgentsAvailable | Self::NoSelection | Self::AlreadyAssigned { .. }
        )
    }
}
