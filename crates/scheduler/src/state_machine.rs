use notify_core::error::{NotifyError, NotifyResult};
use notify_core::types::ScheduleStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Something that moves a schedule between lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleAction {
    Submit,
    Activate,
    Pause,
    Resume,
    BeginDispatch,
    FinishRecurring,
    FinishFinal,
    FailDispatch,
    Cancel,
    Retry,
}

impl ScheduleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleAction::Submit => "submit",
            ScheduleAction::Activate => "activate",
            ScheduleAction::Pause => "pause",
            ScheduleAction::Resume => "resume",
            ScheduleAction::BeginDispatch => "begin dispatch",
            ScheduleAction::FinishRecurring => "finish recurring dispatch",
            ScheduleAction::FinishFinal => "finish final dispatch",
            ScheduleAction::FailDispatch => "fail dispatch",
            ScheduleAction::Cancel => "cancel",
            ScheduleAction::Retry => "retry",
        }
    }
}

/// Describes a single valid lifecycle transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ScheduleStatus,
    pub action: ScheduleAction,
    pub to: ScheduleStatus,
}

const fn t(from: ScheduleStatus, action: ScheduleAction, to: ScheduleStatus) -> StateTransition {
    StateTransition { from, action, to }
}

use ScheduleAction as A;
use ScheduleStatus as S;

static TRANSITIONS: &[StateTransition] = &[
    t(S::Draft, A::Submit, S::Pending),
    // Draft -> Active is an implicit submit.
    t(S::Draft, A::Activate, S::Active),
    t(S::Pending, A::Activate, S::Active),
    t(S::Paused, A::Activate, S::Active),
    t(S::Paused, A::Resume, S::Active),
    t(S::Active, A::Pause, S::Paused),
    t(S::Active, A::BeginDispatch, S::Sending),
    t(S::Sending, A::FinishRecurring, S::Active),
    t(S::Sending, A::FinishFinal, S::Completed),
    t(S::Sending, A::FailDispatch, S::Failed),
    t(S::Failed, A::Retry, S::Pending),
    t(S::Draft, A::Cancel, S::Cancelled),
    t(S::Pending, A::Cancel, S::Cancelled),
    t(S::Active, A::Cancel, S::Cancelled),
    t(S::Paused, A::Cancel, S::Cancelled),
    t(S::Sending, A::Cancel, S::Cancelled),
];

/// Full transition table, for documentation and tests.
pub fn transitions() -> &'static [StateTransition] {
    TRANSITIONS
}

pub fn can_apply(from: ScheduleStatus, action: ScheduleAction) -> bool {
    TRANSITIONS
        .iter()
        .any(|tr| tr.from == from && tr.action == action)
}

/// Resolve the status reached by applying `action` in `from`.
///
/// Cancelling an already cancelled schedule is a no-op.
pub fn apply(
    schedule_id: Uuid,
    from: ScheduleStatus,
    action: ScheduleAction,
) -> NotifyResult<ScheduleStatus> {
    if from == S::Cancelled && action == A::Cancel {
        return Ok(S::Cancelled);
    }
    TRANSITIONS
        .iter()
        .find(|tr| tr.from == from && tr.action == action)
        .map(|tr| tr.to)
        .ok_or(NotifyError::InvalidState {
            schedule_id,
            status: from,
            action: action.as_str(),
        })
}
