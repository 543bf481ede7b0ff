use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use notify_channels::cost::{validate_sms_length, CostEstimator};
use notify_channels::render::{recipient_variables, render_message, Variables};
use notify_channels::sender::{
    Credentials, MessageSender, OutboundMessage, SendContext, SendOutcome, SenderError,
};
use notify_channels::templates::{Template, TemplateStore};
use notify_core::config::AppConfig;
use notify_core::directory::GuestDirectory;
use notify_core::error::{NotifyError, NotifyResult};
use notify_core::event_bus::{make_event, noop_sink, EventSink};
use notify_core::types::{Channel, EventType, GuestSnapshot, ScheduleStatus};

use crate::cron::CronExpr;
use crate::export::{export_campaigns, export_schedules, import_schedules, ScheduleRow};
use crate::preview::{build_preview, SchedulePreview};
use crate::recipients::{resolve, RecipientRule, RecipientSet};
use crate::state_machine::{apply, ScheduleAction};
use crate::tracker::{CampaignTracker, NewCampaign};
use crate::trigger::{
    next_occurrence, parse_timezone, resolve_slot, schedule_tz, upcoming, TriggerResolution,
};
use crate::types::{
    default_timezone, Campaign, DeliveryStatus, PendingEdit, RecipientOutcome, RecipientType,
    RecurrencePattern, Schedule, ScheduleDraft, ScheduleType, Trigger,
};

/// Runtime knobs for the engine, usually derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub node_id: String,
    /// A schedule left in Sending longer than this is failed by recovery.
    pub sending_timeout: chrono::Duration,
    /// Upper bound on a single provider call.
    pub send_timeout: Duration,
    pub max_concurrent_dispatches: usize,
    pub allow_multipart_sms: bool,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let sending_timeout_secs = config.scheduler.sending_timeout_secs.min(i32::MAX as u64);
        Self {
            node_id: config.node_id.clone(),
            sending_timeout: chrono::Duration::seconds(sending_timeout_secs as i64),
            send_timeout: Duration::from_millis(config.sender.send_timeout_ms),
            max_concurrent_dispatches: config.scheduler.max_concurrent_dispatches.max(1),
            allow_multipart_sms: config.sms.allow_multipart,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// List-view tabs of the scheduler screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleTab {
    /// Active or Pending.
    Upcoming,
    /// Active and switched on.
    Active,
    Completed,
    #[default]
    All,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleFilter {
    /// Case-insensitive match on name or description.
    pub query: Option<String>,
    pub status: Option<ScheduleStatus>,
    pub channel: Option<Channel>,
    pub event_id: Option<Uuid>,
    #[serde(default)]
    pub tab: ScheduleTab,
}

impl ScheduleFilter {
    pub fn matches(&self, schedule: &Schedule) -> bool {
        let query_ok = self
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .is_none_or(|q| {
                let q = q.to_lowercase();
                schedule.name.to_lowercase().contains(&q)
                    || schedule.description.to_lowercase().contains(&q)
            });
        let tab_ok = match self.tab {
            ScheduleTab::Upcoming => {
                matches!(schedule.status, ScheduleStatus::Active | ScheduleStatus::Pending)
            }
            ScheduleTab::Active => schedule.status == ScheduleStatus::Active && schedule.is_active,
            ScheduleTab::Completed => schedule.status == ScheduleStatus::Completed,
            ScheduleTab::All => true,
        };
        query_ok
            && tab_ok
            && self.status.is_none_or(|s| schedule.status == s)
            && self.channel.is_none_or(|c| schedule.notification_type == c)
            && self.event_id.is_none_or(|e| schedule.event_id == Some(e))
    }
}

/// A one-off send that is not driven by a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdhocCampaign {
    pub name: String,
    pub channel: Channel,
    /// Use a stored template; otherwise `subject`/`body` are sent as given.
    #[serde(default)]
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    pub recipient_type: RecipientType,
    #[serde(default)]
    pub event_id: Option<Uuid>,
    #[serde(default)]
    pub recipient_list: Vec<Uuid>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub cost_limit: Option<f64>,
    #[serde(default)]
    pub extra_variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotActive,
    /// Another dispatch holds the schedule.
    AlreadySending,
    NotDue,
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Fired(Campaign),
    Skipped(SkipReason),
}

/// Summary of one due-check pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickReport {
    pub dispatched: Vec<Uuid>,
    pub skipped: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
    pub campaigns: Vec<Uuid>,
}

/// State captured when a dispatch takes the Sending lock.
struct Claim {
    schedule: Schedule,
    occurrence: DateTime<Utc>,
    template: Template,
    claimed_at: DateTime<Utc>,
}

/// Rendered content for one recipient.
struct PreparedMessage {
    recipient_id: Uuid,
    contact: String,
    subject: Option<String>,
    body: String,
    cost: f64,
}

struct Prepared {
    messages: Vec<PreparedMessage>,
    estimated_cost: f64,
    excluded: usize,
    already_delivered: usize,
}

/// What to render, for whom.
struct Content<'a> {
    channel: Channel,
    subject: Option<&'a str>,
    body: &'a str,
    event_id: Option<Uuid>,
    tz: Tz,
    extras: &'a Variables,
}

fn invalid(id: Option<Uuid>, reason: impl Into<String>) -> NotifyError {
    NotifyError::validation("schedule", id, reason)
}

fn validate_audience(
    entity: &'static str,
    id: Option<Uuid>,
    channel: Channel,
    recipient_type: RecipientType,
    event_id: Option<Uuid>,
    explicit: &[Uuid],
) -> NotifyResult<()> {
    match recipient_type {
        RecipientType::Event if event_id.is_none() => Err(NotifyError::validation(
            entity,
            id,
            "event recipients require an event_id",
        )),
        RecipientType::Custom if explicit.is_empty() => Err(NotifyError::validation(
            entity,
            id,
            "custom recipients require a recipient list",
        )),
        RecipientType::NoEmail if channel == Channel::Email => Err(NotifyError::validation(
            entity,
            id,
            "guests without an email cannot be reached by email",
        )),
        _ => Ok(()),
    }
}

fn refresh_next_fire(schedule: &mut Schedule, snapshot: &GuestSnapshot, now: DateTime<Utc>) {
    schedule.next_fire_at = match schedule.status {
        ScheduleStatus::Paused
        | ScheduleStatus::Completed
        | ScheduleStatus::Cancelled
        | ScheduleStatus::Failed => None,
        _ => upcoming(schedule, snapshot, now).instant(),
    };
}

/// Whether a schedule may still send with `template_id`. Failed schedules
/// count because they can be retried.
fn references_template(schedule: &Schedule, template_id: Uuid) -> bool {
    let live = !matches!(
        schedule.status,
        ScheduleStatus::Completed | ScheduleStatus::Cancelled
    );
    live && (schedule.template_id == template_id
        || schedule
            .pending_edit
            .as_ref()
            .is_some_and(|e| e.draft.template_id == Some(template_id)))
}

fn lock_poisoned<T>(_: T) -> NotifyError {
    NotifyError::Internal(anyhow::anyhow!("template reference lock poisoned"))
}

/// Apply an edit to a schedule that is not dispatching.
fn apply_edit(
    schedule: &mut Schedule,
    template_id: Uuid,
    draft: ScheduleDraft,
    snapshot: &GuestSnapshot,
    now: DateTime<Utc>,
) {
    if schedule.apply_draft(template_id, draft) {
        schedule.retry_occurrence = None;
        if schedule.status == ScheduleStatus::Active {
            next_occurrence(schedule, snapshot, 0, now).apply_to(schedule);
        }
    }
    schedule.updated_at = now;
    refresh_next_fire(schedule, snapshot, now);
}

/// Orchestrates schedules: lifecycle operations, due-checks, dispatch and
/// recovery. Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct ScheduleEngine {
    schedules: Arc<DashMap<Uuid, Schedule>>,
    templates: Arc<TemplateStore>,
    /// Held shared while a schedule takes a template reference and
    /// exclusively while a template is deleted.
    template_refs: Arc<RwLock<()>>,
    campaigns: Arc<CampaignTracker>,
    directory: Arc<dyn GuestDirectory>,
    sender: Arc<dyn MessageSender>,
    estimator: CostEstimator,
    settings: EngineSettings,
    credentials: Option<Credentials>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ScheduleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleEngine")
            .field("schedules", &self.schedules.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ScheduleEngine {
    pub fn new(
        templates: Arc<TemplateStore>,
        directory: Arc<dyn GuestDirectory>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            schedules: Arc::new(DashMap::new()),
            templates,
            template_refs: Arc::new(RwLock::new(())),
            campaigns: Arc::new(CampaignTracker::new()),
            directory,
            sender,
            estimator: CostEstimator::default(),
            settings: EngineSettings::default(),
            credentials: None,
            event_sink: noop_sink(),
        }
    }

    pub fn from_config(
        config: &AppConfig,
        templates: Arc<TemplateStore>,
        directory: Arc<dyn GuestDirectory>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self::new(templates, directory, sender)
            .with_settings(EngineSettings::from_config(config))
            .with_estimator(CostEstimator::new(config.costs.clone()))
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_estimator(mut self, estimator: CostEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Provider credentials handed to every send.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Attach an event sink for lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    fn share_templates(&self) -> NotifyResult<RwLockReadGuard<'_, ()>> {
        self.template_refs.read().map_err(lock_poisoned)
    }

    fn own_templates(&self) -> NotifyResult<RwLockWriteGuard<'_, ()>> {
        self.template_refs.write().map_err(lock_poisoned)
    }

    /// The template a stored schedule sends with, which must still exist.
    fn require_template(&self, schedule: &Schedule) -> NotifyResult<()> {
        if self.templates.get(&schedule.template_id).is_none() {
            return Err(invalid(
                Some(schedule.id),
                format!("template {} no longer exists", schedule.template_id),
            ));
        }
        Ok(())
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn campaigns(&self) -> &CampaignTracker {
        &self.campaigns
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn emit(
        &self,
        event_type: EventType,
        schedule_id: Option<Uuid>,
        campaign_id: Option<Uuid>,
        detail: Option<String>,
    ) {
        let mut event = make_event(event_type, schedule_id, campaign_id, detail);
        event.node_id = self.settings.node_id.clone();
        self.event_sink.emit(event);
    }

    fn transition(
        &self,
        schedule: &mut Schedule,
        action: ScheduleAction,
        now: DateTime<Utc>,
    ) -> NotifyResult<ScheduleStatus> {
        let from = schedule.status;
        let to = apply(schedule.id, from, action)?;
        schedule.status = to;
        schedule.updated_at = now;
        if from != to {
            metrics::counter!("notify.schedules.transitions", "to" => to.as_str()).increment(1);
            info!(
                schedule_id = %schedule.id,
                from = %from,
                to = %to,
                action = action.as_str(),
                "Schedule transition"
            );
        }
        Ok(to)
    }

    /// Check a draft and return the template it points at. Nothing is
    /// stored when this fails.
    fn validate_draft(&self, id: Option<Uuid>, draft: &ScheduleDraft) -> NotifyResult<Template> {
        if draft.name.trim().is_empty() {
            return Err(invalid(id, "name is required"));
        }
        let template_id = draft
            .template_id
            .ok_or_else(|| invalid(id, "template_id is required"))?;
        let template = self
            .templates
            .get(&template_id)
            .ok_or_else(|| NotifyError::not_found("template", template_id))?;
        if !template.is_active {
            return Err(invalid(id, format!("template '{}' is inactive", template.name)));
        }
        if template.channel != draft.notification_type {
            return Err(invalid(
                id,
                format!(
                    "template '{}' is for {} but the schedule sends {}",
                    template.name, template.channel, draft.notification_type
                ),
            ));
        }
        if parse_timezone(&draft.timezone).is_err() {
            return Err(invalid(id, format!("unknown timezone '{}'", draft.timezone)));
        }

        match &draft.trigger {
            Trigger::Datetime { .. } => {}
            Trigger::Offset { reference, .. } => {
                if draft.event_id.is_none() {
                    return Err(invalid(
                        id,
                        format!("offset from {reference} requires an event_id"),
                    ));
                }
            }
            Trigger::Condition { condition } => {
                if condition.trim().is_empty() {
                    return Err(invalid(id, "condition name is empty"));
                }
            }
        }

        match draft.schedule_type {
            ScheduleType::OneTime | ScheduleType::EventTriggered => {
                if draft.recurrence.is_some() {
                    return Err(invalid(
                        id,
                        format!("{} schedules cannot repeat", draft.schedule_type),
                    ));
                }
                if draft.schedule_type == ScheduleType::EventTriggered
                    && matches!(draft.trigger, Trigger::Datetime { .. })
                {
                    return Err(invalid(
                        id,
                        "event-triggered schedules need an offset or condition trigger",
                    ));
                }
            }
            ScheduleType::Recurring | ScheduleType::DripCampaign => {
                let recurrence = draft.recurrence.as_ref().ok_or_else(|| {
                    invalid(id, format!("{} schedules need a recurrence", draft.schedule_type))
                })?;
                if recurrence.interval == 0 {
                    return Err(invalid(id, "recurrence interval must be at least 1"));
                }
                if recurrence.max_occurrences == Some(0) {
                    return Err(invalid(id, "max_occurrences must be positive"));
                }
                if recurrence.pattern == RecurrencePattern::Custom {
                    let expression = recurrence
                        .expression
                        .as_deref()
                        .ok_or_else(|| invalid(id, "custom recurrence needs a cron expression"))?;
                    CronExpr::parse(expression).map_err(|reason| invalid(id, reason))?;
                }
                if draft.schedule_type == ScheduleType::DripCampaign
                    && recurrence.max_occurrences.is_none()
                    && recurrence.end_date.is_none()
                {
                    return Err(invalid(
                        id,
                        "drip campaigns must be bounded by max_occurrences or end_date",
                    ));
                }
            }
        }

        validate_audience(
            "schedule",
            id,
            draft.notification_type,
            draft.recipient_type,
            draft.event_id,
            &draft.recipient_list,
        )?;
        if let Some(limit) = draft.cost_limit {
            if !(limit >= 0.0) {
                return Err(invalid(id, "cost_limit must be a non-negative number"));
            }
        }
        Ok(template)
    }

    // ── Administrative operations ──────────────────────────────────────────

    /// Store a new schedule. Drafts marked active are submitted (Pending)
    /// and still need [`activate`](Self::activate) before they fire.
    pub async fn create(&self, draft: ScheduleDraft, now: DateTime<Utc>) -> NotifyResult<Schedule> {
        let template = self.validate_draft(None, &draft)?;
        let snapshot = self.directory.snapshot().await?;

        let submit = draft.is_active;
        let mut schedule = Schedule::from_draft(Uuid::new_v4(), template.id, draft, now);
        if submit {
            self.transition(&mut schedule, ScheduleAction::Submit, now)?;
        }
        refresh_next_fire(&mut schedule, &snapshot, now);

        let refs = self.share_templates()?;
        self.require_template(&schedule)?;
        self.schedules.insert(schedule.id, schedule.clone());
        drop(refs);

        metrics::counter!("notify.schedules.created").increment(1);
        info!(
            schedule_id = %schedule.id,
            name = %schedule.name,
            schedule_type = %schedule.schedule_type,
            channel = %schedule.notification_type,
            status = %schedule.status,
            "Schedule created"
        );
        self.emit(EventType::ScheduleCreated, Some(schedule.id), None, None);
        Ok(schedule)
    }

    /// Replace a schedule's configuration. `expected_version` must match
    /// the stored version. While the schedule is dispatching the edit is
    /// queued and applied when the batch completes.
    pub async fn update(
        &self,
        id: Uuid,
        draft: ScheduleDraft,
        expected_version: u32,
        now: DateTime<Utc>,
    ) -> NotifyResult<Schedule> {
        let template = self.validate_draft(Some(id), &draft)?;
        let snapshot = self.directory.snapshot().await?;

        let refs = self.share_templates()?;
        if self.templates.get(&template.id).is_none() {
            return Err(NotifyError::not_found("template", template.id));
        }
        let mut entry = self
            .schedules
            .get_mut(&id)
            .ok_or_else(|| NotifyError::not_found("schedule", id))?;
        let schedule = entry.value_mut();
        if schedule.version != expected_version {
            return Err(NotifyError::VersionConflict {
                schedule_id: id,
                expected: expected_version,
                actual: schedule.version,
            });
        }

        let detail = match schedule.status {
            ScheduleStatus::Completed | ScheduleStatus::Cancelled => {
                return Err(NotifyError::InvalidState {
                    schedule_id: id,
                    status: schedule.status,
                    action: "update",
                });
            }
            ScheduleStatus::Sending => {
                schedule.pending_edit = Some(PendingEdit {
                    draft,
                    queued_at: now,
                });
                schedule.updated_at = now;
                info!(schedule_id = %id, "Edit queued until the current dispatch completes");
                "queued"
            }
            _ => {
                apply_edit(schedule, template.id, draft, &snapshot, now);
                "applied"
            }
        };
        schedule.version += 1;
        let updated = schedule.clone();
        drop(entry);
        drop(refs);

        self.emit(EventType::ScheduleUpdated, Some(id), None, Some(detail.to_string()));
        Ok(updated)
    }

    /// Pending, Paused or Draft -> Active. Missed occurrences of repeating
    /// schedules are skipped rather than replayed.
    pub async fn activate(&self, id: Uuid, now: DateTime<Utc>) -> NotifyResult<Schedule> {
        let snapshot = self.directory.snapshot().await?;

        let mut entry = self
            .schedules
            .get_mut(&id)
            .ok_or_else(|| NotifyError::not_found("schedule", id))?;
        let schedule = entry.value_mut();
        apply(id, schedule.status, ScheduleAction::Activate)?;
        self.require_template(schedule)?;

        let next = next_occurrence(schedule, &snapshot, schedule.slot, now);
        if next.resolution == TriggerResolution::Exhausted {
            return Err(invalid(Some(id), "no occurrences remain"));
        }
        self.transition(schedule, ScheduleAction::Activate, now)?;
        next.apply_to(schedule);
        schedule.is_active = true;
        schedule.last_error = None;
        refresh_next_fire(schedule, &snapshot, now);
        let activated = schedule.clone();
        drop(entry);

        self.emit(EventType::ScheduleActivated, Some(id), None, None);
        Ok(activated)
    }

    /// Active -> Paused. A dispatching schedule is paused once its batch
    /// completes.
    pub fn pause(&self, id: Uuid, now: DateTime<Utc>) -> NotifyResult<Schedule> {
        let mut entry = self
            .schedules
            .get_mut(&id)
            .ok_or_else(|| NotifyError::not_found("schedule", id))?;
        let schedule = entry.value_mut();
        if schedule.status == ScheduleStatus::Sending {
            schedule.pause_requested = true;
            schedule.updated_at = now;
            info!(schedule_id = %id, "Pause deferred until the current dispatch completes");
            return Ok(schedule.clone());
        }
        self.transition(schedule, ScheduleAction::Pause, now)?;
        schedule.is_active = false;
        schedule.next_fire_at = None;
        let paused = schedule.clone();
        drop(entry);

        self.emit(EventType::SchedulePaused, Some(id), None, None);
        Ok(paused)
    }

    /// Cancel any non-terminal schedule. Cancelling twice is a no-op.
    pub fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> NotifyResult<Schedule> {
        let mut entry = self
            .schedules
            .get_mut(&id)
            .ok_or_else(|| NotifyError::not_found("schedule", id))?;
        let schedule = entry.value_mut();
        match schedule.status {
            ScheduleStatus::Cancelled => return Ok(schedule.clone()),
            ScheduleStatus::Sending => {
                schedule.cancel_requested = true;
                schedule.updated_at = now;
                info!(schedule_id = %id, "Cancel deferred until the current dispatch completes");
                return Ok(schedule.clone());
            }
            _ => {}
        }
        self.transition(schedule, ScheduleAction::Cancel, now)?;
        schedule.is_active = false;
        schedule.next_fire_at = None;
        schedule.pending_edit = None;
        let cancelled = schedule.clone();
        drop(entry);

        self.emit(EventType::ScheduleCancelled, Some(id), None, None);
        Ok(cancelled)
    }

    /// Remove a schedule. Rejected while it is dispatching. Campaign
    /// history is kept.
    pub fn delete(&self, id: Uuid) -> NotifyResult<Schedule> {
        match self
            .schedules
            .remove_if(&id, |_, s| s.status != ScheduleStatus::Sending)
        {
            Some((_, removed)) => {
                info!(schedule_id = %id, name = %removed.name, "Schedule deleted");
                self.emit(EventType::ScheduleDeleted, Some(id), None, None);
                Ok(removed)
            }
            None => match self.schedules.get(&id) {
                Some(s) => Err(NotifyError::InvalidState {
                    schedule_id: id,
                    status: s.status,
                    action: "delete",
                }),
                None => Err(NotifyError::not_found("schedule", id)),
            },
        }
    }

    /// Failed -> Pending. The failed occurrence is kept, so the next
    /// dispatch re-sends it under the same idempotency key.
    pub async fn retry(&self, id: Uuid, now: DateTime<Utc>) -> NotifyResult<Schedule> {
        let snapshot = self.directory.snapshot().await?;
        let mut entry = self
            .schedules
            .get_mut(&id)
            .ok_or_else(|| NotifyError::not_found("schedule", id))?;
        let schedule = entry.value_mut();
        apply(id, schedule.status, ScheduleAction::Retry)?;
        self.require_template(schedule)?;
        self.transition(schedule, ScheduleAction::Retry, now)?;
        refresh_next_fire(schedule, &snapshot, now);
        let retried = schedule.clone();
        drop(entry);

        self.emit(EventType::ScheduleUpdated, Some(id), None, Some("retry".into()));
        Ok(retried)
    }

    /// Delete a template no schedule can still send with.
    pub fn delete_template(&self, template_id: Uuid) -> NotifyResult<Template> {
        let refs = self.own_templates()?;
        let referencing = self
            .schedules
            .iter()
            .filter(|s| references_template(s, template_id))
            .count();
        if referencing > 0 {
            return Err(NotifyError::validation(
                "template",
                Some(template_id),
                format!("still referenced by {referencing} schedule(s) that can send"),
            ));
        }
        let removed = self.templates.remove(&template_id)?;
        drop(refs);
        info!(template_id = %template_id, name = %removed.name, "Template deleted");
        self.emit(EventType::TemplateDeleted, None, None, Some(template_id.to_string()));
        Ok(removed)
    }

    /// Signal a named condition. Condition-triggered schedules waiting on it
    /// (and scoped to `event_id`, when given) anchor their first occurrence
    /// at `now`. Returns the signalled schedule ids.
    pub async fn notify_condition(
        &self,
        event_id: Option<Uuid>,
        condition: &str,
        now: DateTime<Utc>,
    ) -> NotifyResult<Vec<Uuid>> {
        let snapshot = self.directory.snapshot().await?;
        let mut signalled = Vec::new();
        for mut entry in self.schedules.iter_mut() {
            let schedule = entry.value_mut();
            let waiting = matches!(&schedule.trigger, Trigger::Condition { condition: c } if c == condition)
                && schedule.anchor_at.is_none()
                && !schedule.status.is_terminal();
            let in_scope = event_id.is_none()
                || schedule.event_id.is_none()
                || schedule.event_id == event_id;
            if !(waiting && in_scope) {
                continue;
            }
            schedule.anchor_at = Some(now);
            schedule.updated_at = now;
            refresh_next_fire(schedule, &snapshot, now);
            info!(schedule_id = %schedule.id, condition, "Condition signalled");
            signalled.push(schedule.id);
        }
        for id in &signalled {
            self.emit(
                EventType::ScheduleUpdated,
                Some(*id),
                None,
                Some(format!("condition '{condition}' signalled")),
            );
        }
        Ok(signalled)
    }

    // ── Reads ──────────────────────────────────────────────────────────────

    pub fn get(&self, id: &Uuid) -> Option<Schedule> {
        self.schedules.get(id).map(|s| s.clone())
    }

    /// All schedules, oldest first.
    pub fn list(&self) -> Vec<Schedule> {
        let mut all: Vec<Schedule> = self.schedules.iter().map(|s| s.value().clone()).collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    pub fn search(&self, filter: &ScheduleFilter) -> Vec<Schedule> {
        self.list()
            .into_iter()
            .filter(|s| filter.matches(s))
            .collect()
    }

    /// Side-effect free preview of a stored schedule.
    pub async fn preview(&self, id: Uuid, now: DateTime<Utc>) -> NotifyResult<SchedulePreview> {
        let schedule = self
            .get(&id)
            .ok_or_else(|| NotifyError::not_found("schedule", id))?;
        let template = self
            .templates
            .get(&schedule.template_id)
            .ok_or_else(|| NotifyError::not_found("template", schedule.template_id))?;
        let snapshot = self.directory.snapshot().await?;
        Ok(build_preview(&schedule, &template, &snapshot, &self.estimator, now))
    }

    /// Preview a draft before it is saved.
    pub async fn preview_draft(
        &self,
        draft: ScheduleDraft,
        now: DateTime<Utc>,
    ) -> NotifyResult<SchedulePreview> {
        let template = self.validate_draft(None, &draft)?;
        let snapshot = self.directory.snapshot().await?;
        let schedule = Schedule::from_draft(Uuid::nil(), template.id, draft, now);
        Ok(build_preview(&schedule, &template, &snapshot, &self.estimator, now))
    }

    /// Active schedules whose current occurrence is due, highest priority
    /// first. Offset triggers are re-resolved against current event data.
    pub async fn list_due(&self, now: DateTime<Utc>) -> NotifyResult<Vec<Schedule>> {
        let snapshot = self.directory.snapshot().await?;
        let mut due: Vec<Schedule> = self
            .schedules
            .iter()
            .filter(|s| s.status == ScheduleStatus::Active)
            .filter_map(|entry| {
                let schedule = entry.value();
                match resolve_slot(schedule, &snapshot, schedule.slot) {
                    TriggerResolution::At(at) if at <= now => {
                        let mut due = schedule.clone();
                        due.next_fire_at = Some(at);
                        Some(due)
                    }
                    TriggerResolution::NotComputable(reference) => {
                        let err = NotifyError::UnresolvableTrigger {
                            schedule_id: schedule.id,
                            reference,
                        };
                        debug!(schedule_id = %schedule.id, error = %err, "No due time");
                        None
                    }
                    _ => None,
                }
            })
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.next_fire_at.cmp(&b.next_fire_at))
        });
        Ok(due)
    }

    /// Recompute cached next-run times, picking up changed event dates.
    pub async fn refresh_next_fire_times(&self, now: DateTime<Utc>) -> NotifyResult<()> {
        let snapshot = self.directory.snapshot().await?;
        for mut entry in self.schedules.iter_mut() {
            refresh_next_fire(entry.value_mut(), &snapshot, now);
        }
        Ok(())
    }

    // ── Dispatch ───────────────────────────────────────────────────────────

    /// One due-check pass. Due schedules are dispatched concurrently, at
    /// most `max_concurrent_dispatches` at a time; a failing schedule never
    /// affects the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> NotifyResult<TickReport> {
        let due = self.list_due(now).await?;
        let mut report = TickReport::default();
        if due.is_empty() {
            return Ok(report);
        }
        debug!(due = due.len(), "Processing due schedules");

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_dispatches));
        let mut tasks = JoinSet::new();
        for schedule in due {
            // Permits are taken in priority order before spawning.
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| NotifyError::Internal(anyhow::anyhow!(e)))?;
            let engine = self.clone();
            tasks.spawn(async move {
                let result = engine.dispatch(schedule.id, now).await;
                drop(permit);
                (schedule.id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(DispatchOutcome::Fired(campaign)))) => {
                    report.dispatched.push(id);
                    report.campaigns.push(campaign.id);
                }
                Ok((id, Ok(DispatchOutcome::Skipped(reason)))) => {
                    debug!(schedule_id = %id, ?reason, "Dispatch skipped");
                    report.skipped.push(id);
                }
                Ok((id, Err(err))) => {
                    error!(schedule_id = %id, code = err.code(), error = %err, "Dispatch failed");
                    report.failed.push((id, err.to_string()));
                }
                Err(err) => error!(error = %err, "Dispatch task did not complete"),
            }
        }

        info!(
            dispatched = report.dispatched.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Tick complete"
        );
        Ok(report)
    }

    /// Fire the current occurrence of one schedule if it is Active and due.
    ///
    /// Entering Sending is a compare-and-set on the schedule entry, so of
    /// two concurrent calls for the same id only one fires; the other
    /// returns [`SkipReason::AlreadySending`].
    pub async fn dispatch(&self, id: Uuid, now: DateTime<Utc>) -> NotifyResult<DispatchOutcome> {
        let snapshot = self.directory.snapshot().await?;
        let claim = match self.claim(id, &snapshot, now)? {
            Ok(claim) => claim,
            Err(reason) => return Ok(DispatchOutcome::Skipped(reason)),
        };

        match self.fire(&claim, &snapshot, now).await {
            Ok((campaign, None)) => {
                self.release(&claim, Ok(&campaign), &snapshot, now)?;
                Ok(DispatchOutcome::Fired(campaign))
            }
            Ok((campaign, Some(reason))) => {
                let err = NotifyError::ProviderUnavailable {
                    schedule_id: Some(id),
                    channel: campaign.channel,
                    reason,
                };
                metrics::counter!("notify.dispatch.aborted").increment(1);
                error!(
                    schedule_id = %id,
                    campaign_id = %campaign.id,
                    error = %err,
                    "Batch aborted"
                );
                self.release(&claim, Err((Some(campaign.id), err.to_string())), &snapshot, now)?;
                Err(err)
            }
            Err(err) => {
                self.release(&claim, Err((None, err.to_string())), &snapshot, now)?;
                Err(err)
            }
        }
    }

    fn claim(
        &self,
        id: Uuid,
        snapshot: &GuestSnapshot,
        now: DateTime<Utc>,
    ) -> NotifyResult<Result<Claim, SkipReason>> {
        let mut entry = self
            .schedules
            .get_mut(&id)
            .ok_or_else(|| NotifyError::not_found("schedule", id))?;
        let schedule = entry.value_mut();
        match schedule.status {
            ScheduleStatus::Active => {}
            ScheduleStatus::Sending => return Ok(Err(SkipReason::AlreadySending)),
            _ => return Ok(Err(SkipReason::NotActive)),
        }
        let occurrence = match resolve_slot(schedule, snapshot, schedule.slot) {
            TriggerResolution::At(at) if at <= now => at,
            _ => return Ok(Err(SkipReason::NotDue)),
        };
        let template = self
            .templates
            .get(&schedule.template_id)
            .ok_or_else(|| NotifyError::not_found("template", schedule.template_id))?;

        self.transition(schedule, ScheduleAction::BeginDispatch, now)?;
        schedule.sending_since = Some(now);
        Ok(Ok(Claim {
            schedule: schedule.clone(),
            occurrence,
            template,
            claimed_at: now,
        }))
    }

    fn prepare(
        &self,
        content: &Content<'_>,
        recipients: RecipientSet,
        already_delivered: &HashSet<Uuid>,
        snapshot: &GuestSnapshot,
    ) -> Prepared {
        let mut prepared = Prepared {
            messages: Vec::with_capacity(recipients.len()),
            estimated_cost: 0.0,
            excluded: recipients.excluded,
            already_delivered: 0,
        };
        for recipient in recipients.recipients {
            if already_delivered.contains(&recipient.guest.id) {
                prepared.already_delivered += 1;
                continue;
            }
            let event = content
                .event_id
                .or(recipient.guest.event_id)
                .and_then(|id| snapshot.event(&id));
            let vars = recipient_variables(&recipient.guest, event, content.tz, content.extras);
            let rendered = render_message(content.subject, content.body, &vars);
            let cost = self.estimator.estimate(content.channel, &rendered.body, 1).total;
            prepared.estimated_cost += cost;
            prepared.messages.push(PreparedMessage {
                recipient_id: recipient.guest.id,
                contact: recipient.contact,
                subject: rendered.subject,
                body: rendered.body,
                cost,
            });
        }
        prepared
    }

    /// Render, open a campaign and send. Returns the closed campaign and
    /// the outage reason when the batch was aborted.
    async fn fire(
        &self,
        claim: &Claim,
        snapshot: &GuestSnapshot,
        now: DateTime<Utc>,
    ) -> NotifyResult<(Campaign, Option<String>)> {
        let schedule = &claim.schedule;
        let key = schedule.occurrence_key(claim.occurrence);
        let recipients = resolve(
            &RecipientRule::for_schedule(schedule),
            schedule.notification_type,
            snapshot,
        );
        let already = self.campaigns.delivered_recipients(&key);
        let content = Content {
            channel: schedule.notification_type,
            subject: claim.template.subject.as_deref(),
            body: &claim.template.body,
            event_id: schedule.event_id,
            tz: schedule_tz(schedule),
            extras: &schedule.extra_variables,
        };
        let prepared = self.prepare(&content, recipients, &already, snapshot);

        if let Some(limit) = schedule.cost_limit {
            if prepared.estimated_cost > limit {
                return Err(invalid(
                    Some(schedule.id),
                    format!(
                        "estimated cost {:.2} exceeds the limit of {:.2}",
                        prepared.estimated_cost, limit
                    ),
                ));
            }
        }

        let campaign = self.campaigns.begin(
            NewCampaign {
                schedule_id: Some(schedule.id),
                name: schedule.name.clone(),
                channel: schedule.notification_type,
                idempotency_key: key,
                scheduled_for: Some(claim.occurrence),
                recipient_count: prepared.messages.len(),
                estimated_cost: prepared.estimated_cost,
                template_id: Some(claim.template.id),
                template_version: Some(claim.template.version),
            },
            now,
        );
        if let Some(mut entry) = self.schedules.get_mut(&schedule.id) {
            entry.in_flight_campaign = Some(campaign.id);
        }
        if let Err(err) = self.templates.mark_used(&claim.template.id) {
            warn!(template_id = %claim.template.id, error = %err, "Could not lock template");
        }

        metrics::counter!("notify.dispatch.started").increment(1);
        info!(
            schedule_id = %schedule.id,
            campaign_id = %campaign.id,
            occurrence = %claim.occurrence,
            recipients = prepared.messages.len(),
            excluded = prepared.excluded,
            already_delivered = prepared.already_delivered,
            estimated_cost = prepared.estimated_cost,
            "Dispatch started"
        );
        self.emit(EventType::DispatchStarted, Some(schedule.id), Some(campaign.id), None);

        let abort = self.run_batch(&campaign, prepared.messages, now).await?;
        let finished = match self.campaigns.finish(&campaign.id, abort.is_some(), now) {
            Ok(finished) => finished,
            // Recovery interrupted the campaign while it was sending.
            Err(NotifyError::CampaignClosed { .. }) => {
                self.campaigns.get(&campaign.id).unwrap_or(campaign)
            }
            Err(err) => return Err(err),
        };
        self.emit(
            EventType::DispatchFinished,
            Some(schedule.id),
            Some(finished.id),
            Some(finished.status.as_str().to_string()),
        );
        Ok((finished, abort))
    }

    /// Send every prepared message, recording outcomes as they arrive.
    /// Once the provider reports an outage the rest are skipped.
    async fn run_batch(
        &self,
        campaign: &Campaign,
        messages: Vec<PreparedMessage>,
        now: DateTime<Utc>,
    ) -> NotifyResult<Option<String>> {
        let ctx = SendContext {
            campaign_id: campaign.id,
            schedule_id: campaign.schedule_id,
            credentials: self.credentials.clone(),
        };
        let mut abort: Option<String> = None;

        for prepared in messages {
            let outcome = match &abort {
                Some(reason) => RecipientOutcome {
                    recipient_id: prepared.recipient_id,
                    contact: prepared.contact,
                    status: DeliveryStatus::Skipped,
                    provider_id: None,
                    reason: Some(reason.clone()),
                    cost: 0.0,
                    at: now,
                },
                None => {
                    let (outcome, outage) = self.send_one(&ctx, campaign, prepared, now).await;
                    abort = outage;
                    outcome
                }
            };
            self.observe(campaign, &outcome);

            match self.campaigns.record(&campaign.id, outcome) {
                Ok(()) => {}
                Err(NotifyError::CampaignClosed { .. }) => {
                    warn!(
                        campaign_id = %campaign.id,
                        "Campaign closed by recovery; stopping batch"
                    );
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(abort)
    }

    async fn send_one(
        &self,
        ctx: &SendContext,
        campaign: &Campaign,
        prepared: PreparedMessage,
        now: DateTime<Utc>,
    ) -> (RecipientOutcome, Option<String>) {
        let message = OutboundMessage {
            channel: campaign.channel,
            recipient_id: prepared.recipient_id,
            contact: prepared.contact.clone(),
            subject: prepared.subject,
            body: prepared.body,
            idempotency_key: format!("{}:{}", campaign.idempotency_key, prepared.recipient_id),
        };

        let started = Instant::now();
        let result = tokio::time::timeout(self.settings.send_timeout, self.sender.send(ctx, &message)).await;
        metrics::histogram!("notify.dispatch.latency_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);

        let mut outcome = RecipientOutcome {
            recipient_id: prepared.recipient_id,
            contact: prepared.contact,
            status: DeliveryStatus::Failed,
            provider_id: None,
            reason: None,
            cost: 0.0,
            at: now,
        };
        let mut outage = None;
        match result {
            Ok(Ok(SendOutcome::Delivered { provider_id })) => {
                outcome.status = DeliveryStatus::Delivered;
                outcome.provider_id = Some(provider_id);
                outcome.cost = prepared.cost;
            }
            Ok(Ok(SendOutcome::Failed { reason })) | Ok(Err(SenderError::Rejected(reason))) => {
                outcome.reason = Some(reason);
            }
            Ok(Err(SenderError::Unavailable(reason))) => {
                outcome.status = DeliveryStatus::Skipped;
                outcome.reason = Some(reason.clone());
                outage = Some(reason);
            }
            Err(_) => {
                outcome.reason = Some(format!(
                    "send timed out after {} ms",
                    self.settings.send_timeout.as_millis()
                ));
            }
        }
        (outcome, outage)
    }

    fn observe(&self, campaign: &Campaign, outcome: &RecipientOutcome) {
        match outcome.status {
            DeliveryStatus::Delivered => {
                metrics::counter!("notify.dispatch.recipients", "outcome" => "delivered").increment(1);
                debug!(
                    campaign_id = %campaign.id,
                    recipient_id = %outcome.recipient_id,
                    "Recipient delivered"
                );
                self.emit(
                    EventType::RecipientDelivered,
                    campaign.schedule_id,
                    Some(campaign.id),
                    Some(outcome.recipient_id.to_string()),
                );
            }
            DeliveryStatus::Failed => {
                metrics::counter!("notify.dispatch.recipients", "outcome" => "failed").increment(1);
                let err = NotifyError::Dispatch {
                    schedule_id: campaign.schedule_id,
                    campaign_id: campaign.id,
                    recipient: outcome.contact.clone(),
                    reason: outcome.reason.clone().unwrap_or_default(),
                };
                warn!(
                    campaign_id = %campaign.id,
                    recipient_id = %outcome.recipient_id,
                    error = %err,
                    "Recipient failed"
                );
                self.emit(
                    EventType::RecipientFailed,
                    campaign.schedule_id,
                    Some(campaign.id),
                    outcome.reason.clone(),
                );
            }
            DeliveryStatus::Skipped => {
                metrics::counter!("notify.dispatch.recipients", "outcome" => "skipped").increment(1);
            }
        }
    }

    /// Leave Sending. `result` is the fired campaign, or the campaign id (if
    /// one was opened) and reason of a failed dispatch.
    fn release(
        &self,
        claim: &Claim,
        result: Result<&Campaign, (Option<Uuid>, String)>,
        snapshot: &GuestSnapshot,
        now: DateTime<Utc>,
    ) -> NotifyResult<()> {
        let id = claim.schedule.id;
        let Some(mut entry) = self.schedules.get_mut(&id) else {
            warn!(schedule_id = %id, "Schedule vanished during dispatch");
            return Ok(());
        };
        let schedule = entry.value_mut();
        if schedule.status != ScheduleStatus::Sending
            || schedule.sending_since != Some(claim.claimed_at)
        {
            warn!(schedule_id = %id, "Dispatch finished after recovery released the schedule");
            return Ok(());
        }
        schedule.sending_since = None;
        schedule.in_flight_campaign = None;

        let action = match result {
            Ok(campaign) => {
                schedule.last_campaign_id = Some(campaign.id);
                schedule.last_fired_at = Some(now);
                schedule.occurrence_count += 1;
                schedule.retry_occurrence = None;
                schedule.last_error = None;
                let next = next_occurrence(schedule, snapshot, schedule.slot.saturating_add(1), now);
                if next.resolution == TriggerResolution::Exhausted {
                    ScheduleAction::FinishFinal
                } else {
                    next.apply_to(schedule);
                    ScheduleAction::FinishRecurring
                }
            }
            Err((campaign_id, reason)) => {
                if campaign_id.is_some() {
                    schedule.last_campaign_id = campaign_id;
                }
                schedule.retry_occurrence = Some(claim.occurrence);
                schedule.last_error = Some(reason);
                ScheduleAction::FailDispatch
            }
        };
        self.settle(schedule, action, snapshot, now)
    }

    /// Apply the outcome of a dispatch plus any pause, cancel or edit that
    /// arrived while it ran.
    fn settle(
        &self,
        schedule: &mut Schedule,
        outcome: ScheduleAction,
        snapshot: &GuestSnapshot,
        now: DateTime<Utc>,
    ) -> NotifyResult<()> {
        let action = if std::mem::take(&mut schedule.cancel_requested) {
            ScheduleAction::Cancel
        } else {
            outcome
        };
        self.transition(schedule, action, now)?;
        if schedule.status != ScheduleStatus::Active {
            schedule.is_active = false;
        }

        if let Some(edit) = schedule.pending_edit.take() {
            if matches!(schedule.status, ScheduleStatus::Completed | ScheduleStatus::Cancelled) {
                warn!(
                    schedule_id = %schedule.id,
                    status = %schedule.status,
                    "Queued edit dropped; schedule already finished"
                );
            } else {
                let template_id = edit.draft.template_id.unwrap_or(schedule.template_id);
                apply_edit(schedule, template_id, edit.draft, snapshot, now);
                info!(schedule_id = %schedule.id, "Queued edit applied");
                self.emit(
                    EventType::ScheduleUpdated,
                    Some(schedule.id),
                    None,
                    Some("applied queued edit".into()),
                );
            }
        }

        if std::mem::take(&mut schedule.pause_requested) && schedule.status == ScheduleStatus::Active {
            self.transition(schedule, ScheduleAction::Pause, now)?;
            schedule.is_active = false;
            self.emit(EventType::SchedulePaused, Some(schedule.id), None, None);
        }

        refresh_next_fire(schedule, snapshot, now);
        let event = match schedule.status {
            ScheduleStatus::Completed => Some(EventType::ScheduleCompleted),
            ScheduleStatus::Cancelled => Some(EventType::ScheduleCancelled),
            ScheduleStatus::Failed => Some(EventType::ScheduleFailed),
            _ => None,
        };
        if let Some(event_type) = event {
            self.emit(event_type, Some(schedule.id), schedule.last_campaign_id, schedule.last_error.clone());
        }
        Ok(())
    }

    /// Fail schedules stuck in Sending past the configured timeout. Their
    /// in-flight campaign is closed as interrupted and the occurrence is
    /// kept for a manual retry; nothing is re-sent here.
    pub async fn recover_stuck(&self, now: DateTime<Utc>) -> NotifyResult<Vec<Uuid>> {
        let snapshot = self.directory.snapshot().await?;
        let timeout = self.settings.sending_timeout;
        let is_stuck = |s: &Schedule| {
            s.status == ScheduleStatus::Sending
                && s.sending_since.is_some_and(|since| now - since >= timeout)
        };
        let stuck: Vec<Uuid> = self
            .schedules
            .iter()
            .filter(|s| is_stuck(s.value()))
            .map(|s| s.id)
            .collect();

        let mut recovered = Vec::with_capacity(stuck.len());
        for id in stuck {
            let Some(mut entry) = self.schedules.get_mut(&id) else {
                continue;
            };
            let schedule = entry.value_mut();
            if !is_stuck(schedule) {
                continue;
            }

            if let Some(campaign_id) = schedule.in_flight_campaign.take() {
                match self.campaigns.interrupt(&campaign_id, now) {
                    Ok(campaign) => {
                        schedule.last_campaign_id = Some(campaign.id);
                        if let Some(at) = campaign.scheduled_for {
                            schedule.retry_occurrence = Some(at);
                        }
                    }
                    Err(err) => warn!(
                        schedule_id = %id,
                        campaign_id = %campaign_id,
                        error = %err,
                        "Could not interrupt campaign"
                    ),
                }
            }
            schedule.sending_since = None;
            schedule.last_error = Some(format!(
                "dispatch did not report back within {}s",
                timeout.num_seconds()
            ));

            metrics::counter!("notify.recovery.stuck").increment(1);
            warn!(schedule_id = %id, "Recovered schedule stuck in Sending");
            self.settle(schedule, ScheduleAction::FailDispatch, &snapshot, now)?;
            recovered.push(id);
        }
        Ok(recovered)
    }

    /// Send a one-off campaign outside any schedule. Provider outages abort
    /// the batch and are reflected in the returned campaign's status.
    pub async fn send_adhoc(&self, adhoc: AdhocCampaign, now: DateTime<Utc>) -> NotifyResult<Campaign> {
        let reject = |reason: String| NotifyError::validation("campaign", None, reason);
        if adhoc.name.trim().is_empty() {
            return Err(reject("name is required".into()));
        }
        let (template, subject, body) = match adhoc.template_id {
            Some(template_id) => {
                let template = self
                    .templates
                    .get(&template_id)
                    .ok_or_else(|| NotifyError::not_found("template", template_id))?;
                if template.channel != adhoc.channel {
                    return Err(reject(format!(
                        "template '{}' is for {}, not {}",
                        template.name, template.channel, adhoc.channel
                    )));
                }
                let (subject, body) = (template.subject.clone(), template.body.clone());
                (Some(template), subject, body)
            }
            None => (None, adhoc.subject.clone(), adhoc.body.clone().unwrap_or_default()),
        };
        if body.trim().is_empty() {
            return Err(reject("message body is empty".into()));
        }
        match adhoc.channel {
            Channel::Sms => validate_sms_length(&body, self.settings.allow_multipart_sms)?,
            Channel::Email if subject.as_deref().is_none_or(|s| s.trim().is_empty()) => {
                return Err(reject("email campaigns require a subject".into()));
            }
            _ => {}
        }
        validate_audience(
            "campaign",
            None,
            adhoc.channel,
            adhoc.recipient_type,
            adhoc.event_id,
            &adhoc.recipient_list,
        )?;
        let tz = parse_timezone(&adhoc.timezone)?;

        let snapshot = self.directory.snapshot().await?;
        let recipients = resolve(
            &RecipientRule {
                recipient_type: adhoc.recipient_type,
                event_id: adhoc.event_id,
                explicit: &adhoc.recipient_list,
            },
            adhoc.channel,
            &snapshot,
        );
        if recipients.is_empty() {
            return Err(reject(format!("no recipients with a {} contact", adhoc.channel)));
        }
        let content = Content {
            channel: adhoc.channel,
            subject: subject.as_deref(),
            body: &body,
            event_id: adhoc.event_id,
            tz,
            extras: &adhoc.extra_variables,
        };
        let prepared = self.prepare(&content, recipients, &HashSet::new(), &snapshot);
        if let Some(limit) = adhoc.cost_limit {
            if prepared.estimated_cost > limit {
                return Err(reject(format!(
                    "estimated cost {:.2} exceeds the limit of {:.2}",
                    prepared.estimated_cost, limit
                )));
            }
        }

        let campaign = self.campaigns.begin(
            NewCampaign {
                schedule_id: None,
                name: adhoc.name.clone(),
                channel: adhoc.channel,
                idempotency_key: format!("adhoc:{}", Uuid::new_v4()),
                scheduled_for: None,
                recipient_count: prepared.messages.len(),
                estimated_cost: prepared.estimated_cost,
                template_id: template.as_ref().map(|t| t.id),
                template_version: template.as_ref().map(|t| t.version),
            },
            now,
        );
        if let Some(template) = &template {
            if let Err(err) = self.templates.mark_used(&template.id) {
                warn!(template_id = %template.id, error = %err, "Could not lock template");
            }
        }
        metrics::counter!("notify.dispatch.started").increment(1);
        info!(
            campaign_id = %campaign.id,
            channel = %adhoc.channel,
            recipients = prepared.messages.len(),
            estimated_cost = prepared.estimated_cost,
            "Ad-hoc campaign started"
        );
        self.emit(EventType::DispatchStarted, None, Some(campaign.id), None);

        let abort = self.run_batch(&campaign, prepared.messages, now).await?;
        let finished = self.campaigns.finish(&campaign.id, abort.is_some(), now)?;
        if let Some(reason) = abort {
            let err = NotifyError::ProviderUnavailable {
                schedule_id: None,
                channel: adhoc.channel,
                reason,
            };
            metrics::counter!("notify.dispatch.aborted").increment(1);
            error!(campaign_id = %finished.id, error = %err, "Ad-hoc batch aborted");
        }
        self.emit(
            EventType::DispatchFinished,
            None,
            Some(finished.id),
            Some(finished.status.as_str().to_string()),
        );
        Ok(finished)
    }

    // ── Import / export ────────────────────────────────────────────────────

    /// Schedules as CSV, with each schedule's current audience size.
    pub async fn export_csv(&self) -> NotifyResult<String> {
        let snapshot = self.directory.snapshot().await?;
        let schedules = self.list();
        let rows: Vec<ScheduleRow<'_>> = schedules
            .iter()
            .map(|schedule| ScheduleRow {
                schedule,
                recipients: resolve(
                    &RecipientRule::for_schedule(schedule),
                    schedule.notification_type,
                    &snapshot,
                )
                .len(),
            })
            .collect();
        export_schedules(&rows)
    }

    pub fn export_campaigns_csv(&self) -> NotifyResult<String> {
        export_campaigns(&self.campaigns.list())
    }

    /// Create schedules from CSV. Every row is validated before any is
    /// stored, so a bad row leaves the engine unchanged.
    pub async fn import_csv(&self, data: &str, now: DateTime<Utc>) -> NotifyResult<Vec<Schedule>> {
        let drafts = import_schedules(data)?;
        for draft in &drafts {
            self.validate_draft(None, draft)?;
        }
        let mut created = Vec::with_capacity(drafts.len());
        for draft in drafts {
            created.push(self.create(draft, now).await?);
        }
        info!(count = created.len(), "Schedules imported");
        Ok(created)
    }
}
