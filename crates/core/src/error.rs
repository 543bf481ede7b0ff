use thiserror::Error;
use uuid::Uuid;

use crate::types::{Channel, ReferencePoint, ScheduleStatus};

pub type NotifyResult<T> = Result<T, NotifyError>;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Validation error on {entity}{}: {reason}", fmt_id(.id))]
    Validation {
        entity: &'static str,
        id: Option<Uuid>,
        reason: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Schedule {schedule_id} cannot {action} while {status}")]
    InvalidState {
        schedule_id: Uuid,
        status: ScheduleStatus,
        action: &'static str,
    },

    #[error("Schedule {schedule_id} has no computable due time: {reference} is unknown")]
    UnresolvableTrigger {
        schedule_id: Uuid,
        reference: ReferencePoint,
    },

    #[error("Dispatch to {recipient} failed for schedule {}{}: {reason}", fmt_opt(.schedule_id), fmt_campaign(.campaign_id))]
    Dispatch {
        schedule_id: Option<Uuid>,
        campaign_id: Uuid,
        recipient: String,
        reason: String,
    },

    #[error("Provider for {channel} unavailable (schedule {}): {reason}", fmt_opt(.schedule_id))]
    ProviderUnavailable {
        schedule_id: Option<Uuid>,
        channel: Channel,
        reason: String,
    },

    #[error("Schedule {schedule_id} was modified concurrently (expected version {expected}, found {actual})")]
    VersionConflict {
        schedule_id: Uuid,
        expected: u32,
        actual: u32,
    },

    #[error("Campaign {campaign_id} is closed and cannot be modified")]
    CampaignClosed { campaign_id: Uuid },

    #[error("Export error: {0}")]
    Export(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

fn fmt_id(id: &Option<Uuid>) -> String {
    id.map(|id| format!(" {id}")).unwrap_or_default()
}

fn fmt_opt(id: &Option<Uuid>) -> String {
    id.map(|id| id.to_string())
        .unwrap_or_else(|| "ad-hoc".to_string())
}

fn fmt_campaign(id: &Uuid) -> String {
    format!(" / campaign {id}")
}

impl NotifyError {
    pub fn validation(entity: &'static str, id: Option<Uuid>, reason: impl Into<String>) -> Self {
        NotifyError::Validation {
            entity,
            id,
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        NotifyError::NotFound { entity, id }
    }

    /// Stable machine-readable code for operator tooling.
    pub fn code(&self) -> &'static str {
        match self {
            NotifyError::Validation { .. } => "VALIDATION_ERROR",
            NotifyError::NotFound { .. } => "NOT_FOUND",
            NotifyError::InvalidState { .. } => "INVALID_STATE",
            NotifyError::UnresolvableTrigger { .. } => "UNRESOLVABLE_TRIGGER",
            NotifyError::Dispatch { .. } => "DISPATCH_ERROR",
            NotifyError::ProviderUnavailable { .. } => "PROVIDER_UNAVAILABLE",
            NotifyError::VersionConflict { .. } => "VERSION_CONFLICT",
            NotifyError::CampaignClosed { .. } => "CAMPAIGN_CLOSED",
            NotifyError::Export(_) => "EXPORT_ERROR",
            NotifyError::Serialization(_) => "SERIALIZATION_ERROR",
            NotifyError::Io(_) => "IO_ERROR",
            NotifyError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The schedule this error concerns, when one is known.
    pub fn schedule_id(&self) -> Option<Uuid> {
        match self {
            NotifyError::InvalidState { schedule_id, .. }
            | NotifyError::UnresolvableTrigger { schedule_id, .. }
            | NotifyError::VersionConflict { schedule_id, .. } => Some(*schedule_id),
            NotifyError::Dispatch { schedule_id, .. }
            | NotifyError::ProviderUnavailable { schedule_id, .. } => *schedule_id,
            NotifyError::Validation {
                entity: "schedule",
                id,
                ..
            } => *id,
            NotifyError::NotFound {
                entity: "schedule",
                id,
            } => Some(*id),
            _ => None,
        }
    }

    /// Whether a retry of the same call could succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NotifyError::ProviderUnavailable { .. } | NotifyError::VersionConflict { .. }
        )
    }
}
