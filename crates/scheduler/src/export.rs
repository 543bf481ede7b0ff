//! Flat CSV views of schedules and campaigns.
//!
//! The first six schedule columns are the reporting view operators expect.
//! The remaining columns carry enough configuration to re-import a schedule
//! as a draft.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, Writer};
use notify_core::error::{NotifyError, NotifyResult};
use notify_core::types::{Channel, ReferencePoint};
use uuid::Uuid;

use crate::types::{
    default_timezone, Campaign, OffsetDirection, Priority, RecipientType, Recurrence,
    RecurrencePattern, Schedule, ScheduleDraft, ScheduleType, Trigger,
};

pub const SCHEDULE_CSV_HEADER: [&str; 23] = [
    "Schedule Name",
    "Type",
    "Notification Type",
    "Status",
    "Next Run",
    "Recipients",
    "Template ID",
    "Trigger Type",
    "Trigger At",
    "Timezone",
    "Reference",
    "Offset Days",
    "Offset Hours",
    "Direction",
    "Condition",
    "Recurrence",
    "Interval",
    "End Date",
    "Max Occurrences",
    "Expression",
    "Recipient Type",
    "Event ID",
    "Priority",
];

pub const CAMPAIGN_CSV_HEADER: [&str; 6] = [
    "Campaign Name",
    "Status",
    "Recipients",
    "Sent Date",
    "Delivery Rate",
    "Cost",
];

const TRIGGER_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One exported schedule with its current audience size.
#[derive(Debug, Clone)]
pub struct ScheduleRow<'a> {
    pub schedule: &'a Schedule,
    pub recipients: usize,
}

impl ScheduleRow<'_> {
    fn to_row(&self) -> Vec<String> {
        let s = self.schedule;
        let mut row = vec![
            s.name.clone(),
            s.schedule_type.as_str().to_string(),
            s.notification_type.as_str().to_string(),
            s.status.as_str().to_string(),
            s.next_fire_at.map(|at| at.to_rfc3339()).unwrap_or_default(),
            self.recipients.to_string(),
            s.template_id.to_string(),
            s.trigger.kind().to_string(),
        ];

        let (at, reference, days, hours, direction, condition) = match &s.trigger {
            Trigger::Datetime { at } => (
                at.format(TRIGGER_AT_FORMAT).to_string(),
                "",
                String::new(),
                String::new(),
                "",
                "",
            ),
            Trigger::Offset {
                reference,
                days,
                hours,
                direction,
            } => (
                String::new(),
                reference.as_str(),
                days.to_string(),
                hours.to_string(),
                direction.as_str(),
                "",
            ),
            Trigger::Condition { condition } => (
                String::new(),
                "",
                String::new(),
                String::new(),
                "",
                condition.as_str(),
            ),
        };
        row.push(at);
        row.push(s.timezone.clone());
        row.push(reference.to_string());
        row.push(days);
        row.push(hours);
        row.push(direction.to_string());
        row.push(condition.to_string());

        match &s.recurrence {
            Some(r) => {
                row.push(r.pattern.as_str().to_string());
                row.push(r.interval.to_string());
                row.push(r.end_date.map(|d| d.to_string()).unwrap_or_default());
                row.push(r.max_occurrences.map(|m| m.to_string()).unwrap_or_default());
                row.push(r.expression.clone().unwrap_or_default());
            }
            None => row.extend(std::iter::repeat(String::new()).take(5)),
        }

        row.push(s.recipient_type.as_str().to_string());
        row.push(s.event_id.map(|id| id.to_string()).unwrap_or_default());
        row.push(priority_str(s.priority).to_string());
        row
    }
}

fn priority_str(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Normal => "normal",
        Priority::High => "high",
        Priority::Urgent => "urgent",
    }
}

fn parse_priority(value: &str) -> Option<Priority> {
    match value {
        "low" => Some(Priority::Low),
        "normal" => Some(Priority::Normal),
        "high" => Some(Priority::High),
        "urgent" => Some(Priority::Urgent),
        _ => None,
    }
}

fn into_string(writer: Writer<Vec<u8>>) -> NotifyResult<String> {
    let bytes = writer
        .into_inner()
        .map_err(|e| NotifyError::Export(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| NotifyError::Export(e.to_string()))
}

pub fn export_schedules(rows: &[ScheduleRow<'_>]) -> NotifyResult<String> {
    let mut wtr = Writer::from_writer(Vec::new());
    wtr.write_record(SCHEDULE_CSV_HEADER)
        .map_err(|e| NotifyError::Export(e.to_string()))?;
    for row in rows {
        wtr.write_record(row.to_row())
            .map_err(|e| NotifyError::Export(e.to_string()))?;
    }
    into_string(wtr)
}

pub fn export_campaigns(campaigns: &[Campaign]) -> NotifyResult<String> {
    let mut wtr = Writer::from_writer(Vec::new());
    wtr.write_record(CAMPAIGN_CSV_HEADER)
        .map_err(|e| NotifyError::Export(e.to_string()))?;
    for c in campaigns {
        wtr.write_record([
            c.name.clone(),
            c.status.as_str().to_string(),
            c.recipient_count.to_string(),
            c.fired_at.format("%Y-%m-%d %H:%M").to_string(),
            format!("{:.1}%", c.delivery_rate() * 100.0),
            format!("{:.2}", c.total_cost),
        ])
        .map_err(|e| NotifyError::Export(e.to_string()))?;
    }
    into_string(wtr)
}

/// A parsed CSV row keyed by trimmed header name.
struct RawRow {
    line: usize,
    fields: HashMap<String, String>,
}

impl RawRow {
    fn get(&self, column: &str) -> &str {
        self.fields.get(column).map(String::as_str).unwrap_or("")
    }

    fn required(&self, column: &str) -> NotifyResult<&str> {
        match self.get(column) {
            "" => Err(self.invalid(format!("missing '{column}'"))),
            value => Ok(value),
        }
    }

    fn optional<T, F>(&self, column: &str, parse: F) -> NotifyResult<Option<T>>
    where
        F: FnOnce(&str) -> Option<T>,
    {
        match self.get(column) {
            "" => Ok(None),
            value => parse(value)
                .map(Some)
                .ok_or_else(|| self.invalid(format!("invalid {column} '{value}'"))),
        }
    }

    fn parsed<T, F>(&self, column: &str, parse: F) -> NotifyResult<T>
    where
        F: FnOnce(&str) -> Option<T>,
    {
        let value = self.required(column)?;
        parse(value).ok_or_else(|| self.invalid(format!("invalid {column} '{value}'")))
    }

    fn invalid(&self, reason: String) -> NotifyError {
        NotifyError::validation("schedule", None, format!("CSV line {}: {reason}", self.line))
    }

    fn trigger(&self) -> NotifyResult<Trigger> {
        match self.required("Trigger Type")? {
            "datetime" => Ok(Trigger::Datetime {
                at: self.parsed("Trigger At", |v| {
                    NaiveDateTime::parse_from_str(v, TRIGGER_AT_FORMAT).ok()
                })?,
            }),
            "offset" => Ok(Trigger::Offset {
                reference: self.parsed("Reference", ReferencePoint::parse)?,
                days: self.optional("Offset Days", |v| v.parse().ok())?.unwrap_or(0),
                hours: self.optional("Offset Hours", |v| v.parse().ok())?.unwrap_or(0),
                direction: self
                    .optional("Direction", |v| match v {
                        "before" => Some(OffsetDirection::Before),
                        "after" => Some(OffsetDirection::After),
                        _ => None,
                    })?
                    .unwrap_or_default(),
            }),
            "condition" => Ok(Trigger::Condition {
                condition: self.required("Condition")?.to_string(),
            }),
            other => Err(self.invalid(format!("unknown trigger type '{other}'"))),
        }
    }

    fn recurrence(&self) -> NotifyResult<Option<Recurrence>> {
        let Some(pattern) = self.optional("Recurrence", RecurrencePattern::parse)? else {
            return Ok(None);
        };
        Ok(Some(Recurrence {
            pattern,
            interval: self.optional("Interval", |v| v.parse().ok())?.unwrap_or(1),
            end_date: self.optional("End Date", |v| v.parse::<NaiveDate>().ok())?,
            max_occurrences: self.optional("Max Occurrences", |v| v.parse().ok())?,
            expression: self.optional("Expression", |v| Some(v.to_string()))?,
        }))
    }

    fn to_draft(&self) -> NotifyResult<ScheduleDraft> {
        let timezone = match self.get("Timezone") {
            "" => default_timezone(),
            tz => tz.to_string(),
        };
        Ok(ScheduleDraft {
            name: self.required("Schedule Name")?.to_string(),
            description: String::new(),
            schedule_type: self.parsed("Type", ScheduleType::parse)?,
            notification_type: self.parsed("Notification Type", Channel::parse)?,
            template_id: self.optional("Template ID", |v| Uuid::parse_str(v).ok())?,
            event_id: self.optional("Event ID", |v| Uuid::parse_str(v).ok())?,
            recipient_type: self
                .optional("Recipient Type", RecipientType::parse)?
                .unwrap_or(RecipientType::All),
            recipient_list: vec![],
            trigger: self.trigger()?,
            recurrence: self.recurrence()?,
            timezone,
            priority: self.optional("Priority", parse_priority)?.unwrap_or_default(),
            is_active: false,
            tags: vec![],
            cost_limit: None,
            extra_variables: HashMap::new(),
        })
    }
}

/// Parse schedule CSV back into drafts. Imported drafts are inactive and
/// blank rows are skipped.
pub fn import_schedules(data: &str) -> NotifyResult<Vec<ScheduleDraft>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(data.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| NotifyError::Export(e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut drafts = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record = result.map_err(|e| NotifyError::Export(e.to_string()))?;
        let fields: HashMap<String, String> = record
            .iter()
            .enumerate()
            .filter_map(|(col, value)| {
                headers
                    .get(col)
                    .map(|h| (h.clone(), value.trim().to_string()))
            })
            .collect();
        if fields.values().all(|v| v.is_empty()) {
            continue;
        }
        // Line 1 is the header.
        let row = RawRow {
            line: idx + 2,
            fields,
        };
        drafts.push(row.to_draft()?);
    }
    Ok(drafts)
}
