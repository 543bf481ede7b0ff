use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use notify_core::types::{Channel, ReferencePoint, ScheduleStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a schedule produces occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    OneTime,
    Recurring,
    EventTriggered,
    DripCampaign,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::OneTime => "one_time",
            ScheduleType::Recurring => "recurring",
            ScheduleType::EventTriggered => "event_triggered",
            ScheduleType::DripCampaign => "drip_campaign",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "one_time" => Some(ScheduleType::OneTime),
            "recurring" => Some(ScheduleType::Recurring),
            "event_triggered" => Some(ScheduleType::EventTriggered),
            "drip_campaign" => Some(ScheduleType::DripCampaign),
            _ => None,
        }
    }

    /// Recurring and drip schedules follow their recurrence rule.
    pub fn repeats(&self) -> bool {
        matches!(self, ScheduleType::Recurring | ScheduleType::DripCampaign)
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetDirection {
    #[default]
    Before,
    After,
}

impl OffsetDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetDirection::Before => "before",
            OffsetDirection::After => "after",
        }
    }
}

/// When the first occurrence of a schedule happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Trigger {
    /// Local wall-clock time in the schedule's timezone.
    Datetime { at: NaiveDateTime },
    /// Relative to an event reference date.
    Offset {
        reference: ReferencePoint,
        #[serde(default)]
        days: u32,
        #[serde(default)]
        hours: u32,
        #[serde(default)]
        direction: OffsetDirection,
    },
    /// Fires once the named condition is signalled.
    Condition { condition: String },
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Datetime { .. } => "datetime",
            Trigger::Offset { .. } => "offset",
            Trigger::Condition { .. } => "condition",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrencePattern {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    /// Driven by a five-field cron expression.
    Custom,
}

impl RecurrencePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrencePattern::Daily => "daily",
            RecurrencePattern::Weekly => "weekly",
            RecurrencePattern::Monthly => "monthly",
            RecurrencePattern::Yearly => "yearly",
            RecurrencePattern::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "daily" => Some(RecurrencePattern::Daily),
            "weekly" => Some(RecurrencePattern::Weekly),
            "monthly" => Some(RecurrencePattern::Monthly),
            "yearly" => Some(RecurrencePattern::Yearly),
            "custom" => Some(RecurrencePattern::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub pattern: RecurrencePattern,
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Last local day on which an occurrence may fall.
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub max_occurrences: Option<u32>,
    #[serde(default)]
    pub expression: Option<String>,
}

fn default_interval() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientType {
    All,
    Event,
    RsvpPending,
    RsvpConfirmed,
    RsvpDeclined,
    /// Guests that have not answered at all.
    NoResponse,
    Vip,
    Custom,
    NoEmail,
}

impl RecipientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientType::All => "all",
            RecipientType::Event => "event",
            RecipientType::RsvpPending => "rsvp_pending",
            RecipientType::RsvpConfirmed => "rsvp_confirmed",
            RecipientType::RsvpDeclined => "rsvp_declined",
            RecipientType::NoResponse => "no_response",
            RecipientType::Vip => "vip",
            RecipientType::Custom => "custom",
            RecipientType::NoEmail => "no_email",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "all" => Some(RecipientType::All),
            "event" => Some(RecipientType::Event),
            "rsvp_pending" => Some(RecipientType::RsvpPending),
            "rsvp_confirmed" => Some(RecipientType::RsvpConfirmed),
            "rsvp_declined" => Some(RecipientType::RsvpDeclined),
            "no_response" => Some(RecipientType::NoResponse),
            "vip" => Some(RecipientType::Vip),
            "custom" => Some(RecipientType::Custom),
            "no_email" => Some(RecipientType::NoEmail),
            _ => None,
        }
    }
}

/// Create/update input for a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schedule_type: ScheduleType,
    pub notification_type: Channel,
    #[serde(default)]
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub event_id: Option<Uuid>,
    pub recipient_type: RecipientType,
    #[serde(default)]
    pub recipient_list: Vec<Uuid>,
    pub trigger: Trigger,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub cost_limit: Option<f64>,
    #[serde(default)]
    pub extra_variables: HashMap<String, String>,
}

pub fn default_timezone() -> String {
    "UTC".to_string()
}

/// Position reached in a cron recurrence: occurrence `slot` of the series
/// starting at `base` falls on `local` wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronCursor {
    pub base: DateTime<Utc>,
    pub slot: u32,
    pub local: NaiveDateTime,
}

/// An edit submitted while the schedule was dispatching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEdit {
    pub draft: ScheduleDraft,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub schedule_type: ScheduleType,
    pub notification_type: Channel,
    pub template_id: Uuid,
    pub event_id: Option<Uuid>,
    pub recipient_type: RecipientType,
    pub recipient_list: Vec<Uuid>,
    pub trigger: Trigger,
    pub recurrence: Option<Recurrence>,
    pub timezone: String,
    pub priority: Priority,
    pub is_active: bool,
    pub status: ScheduleStatus,
    pub tags: Vec<String>,
    pub cost_limit: Option<f64>,
    pub extra_variables: HashMap<String, String>,

    pub occurrence_count: u32,
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Cached earliest un-fired occurrence; `None` when terminal, paused
    /// or not computable.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Index of the next occurrence in the recurrence sequence.
    pub slot: u32,
    /// Cached position for custom cron recurrences.
    #[serde(default)]
    pub cron_cursor: Option<CronCursor>,
    /// Instant a condition trigger was signalled.
    pub anchor_at: Option<DateTime<Utc>>,
    /// Occurrence whose dispatch was aborted or interrupted; a retry fires
    /// it again under the same idempotency key.
    pub retry_occurrence: Option<DateTime<Utc>>,

    /// Optimistic-lock counter, bumped on every accepted edit.
    pub version: u32,
    pub sending_since: Option<DateTime<Utc>>,
    pub in_flight_campaign: Option<Uuid>,
    pub last_campaign_id: Option<Uuid>,
    pub pending_edit: Option<PendingEdit>,
    pub pause_requested: bool,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Build an unsaved schedule from a validated draft.
    pub fn from_draft(id: Uuid, template_id: Uuid, draft: ScheduleDraft, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: draft.name,
            description: draft.description,
            schedule_type: draft.schedule_type,
            notification_type: draft.notification_type,
            template_id,
            event_id: draft.event_id,
            recipient_type: draft.recipient_type,
            recipient_list: draft.recipient_list,
            trigger: draft.trigger,
            recurrence: draft.recurrence,
            timezone: draft.timezone,
            priority: draft.priority,
            is_active: draft.is_active,
            status: ScheduleStatus::Draft,
            tags: draft.tags,
            cost_limit: draft.cost_limit,
            extra_variables: draft.extra_variables,
            occurrence_count: 0,
            last_fired_at: None,
            next_fire_at: None,
            slot: 0,
            cron_cursor: None,
            anchor_at: None,
            retry_occurrence: None,
            version: 1,
            sending_since: None,
            in_flight_campaign: None,
            last_campaign_id: None,
            pending_edit: None,
            pause_requested: false,
            cancel_requested: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the editable fields from a draft. Returns whether the
    /// timing (trigger, recurrence or timezone) changed.
    pub fn apply_draft(&mut self, template_id: Uuid, draft: ScheduleDraft) -> bool {
        let timing_changed = self.trigger != draft.trigger
            || self.recurrence != draft.recurrence
            || self.timezone != draft.timezone
            || self.event_id != draft.event_id;

        self.name = draft.name;
        self.description = draft.description;
        self.schedule_type = draft.schedule_type;
        self.notification_type = draft.notification_type;
        self.template_id = template_id;
        self.event_id = draft.event_id;
        self.recipient_type = draft.recipient_type;
        self.recipient_list = draft.recipient_list;
        self.trigger = draft.trigger;
        self.recurrence = draft.recurrence;
        self.timezone = draft.timezone;
        self.priority = draft.priority;
        self.tags = draft.tags;
        self.cost_limit = draft.cost_limit;
        self.extra_variables = draft.extra_variables;

        if timing_changed {
            self.slot = 0;
            self.cron_cursor = None;
            self.anchor_at = None;
        }
        timing_changed
    }

    /// The draft that would recreate this schedule's configuration.
    pub fn to_draft(&self) -> ScheduleDraft {
        ScheduleDraft {
            name: self.name.clone(),
            description: self.description.clone(),
            schedule_type: self.schedule_type,
            notification_type: self.notification_type,
            template_id: Some(self.template_id),
            event_id: self.event_id,
            recipient_type: self.recipient_type,
            recipient_list: self.recipient_list.clone(),
            trigger: self.trigger.clone(),
            recurrence: self.recurrence.clone(),
            timezone: self.timezone.clone(),
            priority: self.priority,
            is_active: self.is_active,
            tags: self.tags.clone(),
            cost_limit: self.cost_limit,
            extra_variables: self.extra_variables.clone(),
        }
    }

    /// Idempotency key of the occurrence due at `at`.
    pub fn occurrence_key(&self, at: DateTime<Utc>) -> String {
        format!("{}:{}", self.id, at.to_rfc3339())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientOutcome {
    pub recipient_id: Uuid,
    pub contact: String,
    pub status: DeliveryStatus,
    pub provider_id: Option<String>,
    pub reason: Option<String>,
    pub cost: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CampaignStatus {
    Sending,
    Sent,
    PartiallySent,
    Failed,
    /// Provider became unavailable mid-batch.
    Aborted,
    /// The dispatch never reported back and was closed by recovery.
    Interrupted,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CampaignStatus::Sending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Sending => "Sending",
            CampaignStatus::Sent => "Sent",
            CampaignStatus::PartiallySent => "Partially Sent",
            CampaignStatus::Failed => "Failed",
            CampaignStatus::Aborted => "Aborted",
            CampaignStatus::Interrupted => "Interrupted",
        }
    }
}

/// A fired instance of a schedule, or an ad-hoc send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub name: String,
    pub channel: Channel,
    pub idempotency_key: String,
    pub fired_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub recipient_count: usize,
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
    pub outcomes: Vec<RecipientOutcome>,
    pub estimated_cost: f64,
    pub total_cost: f64,
    pub template_id: Option<Uuid>,
    pub template_version: Option<u32>,
    pub status: CampaignStatus,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Delivered share of attempted sends; 0 when nothing was attempted.
    pub fn delivery_rate(&self) -> f64 {
        delivery_rate(self.delivered, self.failed)
    }
}

pub fn delivery_rate(delivered: usize, failed: usize) -> f64 {
    let attempted = delivered + failed;
    if attempted == 0 {
        0.0
    } else {
        delivered as f64 / attempted as f64
    }
}
