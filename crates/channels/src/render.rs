//! `{{variable}}` placeholder rendering.
//!
//! Dispatch renders strip placeholders that have no value so recipients
//! never see raw markup; preview renders keep them so operators can spot
//! missing data before a schedule goes live.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use notify_core::types::{EventDates, Guest};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

pub type Variables = HashMap<String, String>;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("placeholder pattern is a valid regex")
});

/// Rendered subject/body pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: Option<String>,
    pub body: String,
}

/// Distinct placeholder names in order of first appearance.
pub fn placeholders(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(text) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Substitute known variables and drop unresolved placeholders.
pub fn render(text: &str, vars: &Variables) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Substitute known variables and leave unresolved placeholders visible.
pub fn render_preview(text: &str, vars: &Variables) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub fn render_message(subject: Option<&str>, body: &str, vars: &Variables) -> RenderedMessage {
    RenderedMessage {
        subject: subject.map(|s| render(s, vars)),
        body: render(body, vars),
    }
}

pub fn preview_message(subject: Option<&str>, body: &str, vars: &Variables) -> RenderedMessage {
    RenderedMessage {
        subject: subject.map(|s| render_preview(s, vars)),
        body: render_preview(body, vars),
    }
}

fn format_date(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format("%B %-d, %Y").to_string()
}

fn format_time(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format("%-I:%M %p").to_string()
}

/// Variables for one recipient. Schedule-level extras act as defaults;
/// guest attributes and guest/event fields take precedence over them.
pub fn recipient_variables(
    guest: &Guest,
    event: Option<&EventDates>,
    tz: Tz,
    extras: &Variables,
) -> Variables {
    let mut vars = extras.clone();
    for (key, value) in &guest.attributes {
        vars.insert(key.clone(), value.clone());
    }

    vars.insert("guest_first_name".into(), guest.first_name.clone());
    vars.insert("guest_last_name".into(), guest.last_name.clone());
    vars.insert("guest_name".into(), guest.full_name());
    if let Some(email) = guest.email.as_deref() {
        vars.insert("guest_email".into(), email.to_string());
    }
    if let Some(phone) = guest.phone.as_deref() {
        vars.insert("guest_phone".into(), phone.to_string());
    }

    if let Some(event) = event {
        vars.insert("event_name".into(), event.name.clone());
        if let Some(start) = event.start {
            vars.insert("event_date".into(), format_date(start, tz));
            vars.insert("event_time".into(), format_time(start, tz));
        }
        if let Some(deadline) = event.rsvp_deadline {
            vars.insert("rsvp_deadline".into(), format_date(deadline, tz));
        }
        if let Some(venue) = event.venue_name.as_deref() {
            vars.insert("venue_name".into(), venue.to_string());
            vars.insert("event_location".into(), venue.to_string());
        }
        if let Some(address) = event.venue_address.as_deref() {
            vars.insert("venue_address".into(), address.to_string());
        }
    }
    vars
}

/// Fixed sample data used by previews.
pub fn sample_variables() -> Variables {
    [
        ("guest_first_name", "John"),
        ("guest_last_name", "Doe"),
        ("guest_name", "John Doe"),
        ("guest_email", "john.doe@example.com"),
        ("guest_phone", "+1 (555) 987-6543"),
        ("event_name", "Annual Conference 2024"),
        ("event_date", "March 15, 2024"),
        ("event_time", "9:00 AM"),
        ("event_location", "Grand Convention Center"),
        ("venue_name", "Grand Convention Center"),
        ("venue_address", "123 Main Street, New York, NY 10001"),
        ("rsvp_link", "https://example.com/rsvp/abc123"),
        ("rsvp_deadline", "March 10, 2024"),
        ("organization_name", "Your Organization"),
        ("contact_email", "events@yourorg.com"),
        ("contact_phone", "+1 (555) 123-4567"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
