//! Read-only schedule preview: sample render, audience size, next run and
//! projected cost. Nothing here touches campaign state or the sender.

use chrono::{DateTime, Utc};
use notify_channels::cost::{CostEstimate, CostEstimator};
use notify_channels::render::{preview_message, sample_variables};
use notify_channels::templates::Template;
use notify_core::types::{Channel, GuestSnapshot};
use serde::{Deserialize, Serialize};

use crate::recipients::{resolve, RecipientRule};
use crate::trigger::{describe, upcoming, TriggerResolution};
use crate::types::Schedule;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulePreview {
    pub channel: Channel,
    pub subject: Option<String>,
    pub body: String,
    pub estimated_recipients: usize,
    pub excluded_recipients: usize,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub trigger: TriggerResolution,
    pub trigger_note: String,
    pub cost: CostEstimate,
    pub exceeds_cost_limit: bool,
}

/// Render `template` for `schedule` against sample data. Schedule extras
/// override the sample values; placeholders with no value stay visible.
pub fn build_preview(
    schedule: &Schedule,
    template: &Template,
    snapshot: &GuestSnapshot,
    estimator: &CostEstimator,
    now: DateTime<Utc>,
) -> SchedulePreview {
    let mut vars = sample_variables();
    vars.extend(
        schedule
            .extra_variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    let rendered = preview_message(template.subject.as_deref(), &template.body, &vars);

    let recipients = resolve(
        &RecipientRule::for_schedule(schedule),
        schedule.notification_type,
        snapshot,
    );
    let cost = estimator.estimate(schedule.notification_type, &rendered.body, recipients.len());
    let trigger = upcoming(schedule, snapshot, now);

    SchedulePreview {
        channel: schedule.notification_type,
        subject: rendered.subject,
        body: rendered.body,
        estimated_recipients: recipients.len(),
        excluded_recipients: recipients.excluded,
        next_fire_at: trigger.instant(),
        trigger,
        trigger_note: describe(schedule),
        exceeds_cost_limit: schedule.cost_limit.is_some_and(|limit| cost.exceeds(limit)),
        cost,
    }
}
