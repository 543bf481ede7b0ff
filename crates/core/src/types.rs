use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery channel of a template, schedule or campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    WhatsApp,
}

impl Channel {
    /// Name used in exports and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::WhatsApp => "whatsapp",
        }
    }

    /// Contact field of a guest that this channel delivers to.
    pub fn contact_field(&self) -> ContactField {
        match self {
            Channel::Email => ContactField::Email,
            Channel::Sms | Channel::WhatsApp => ContactField::Phone,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "whatsapp" => Some(Channel::WhatsApp),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactField {
    Email,
    Phone,
}

/// Lifecycle status of a notification schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleStatus {
    #[default]
    Draft,
    Pending,
    Active,
    Sending,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl ScheduleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduleStatus::Completed | ScheduleStatus::Cancelled | ScheduleStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Draft => "Draft",
            ScheduleStatus::Pending => "Pending",
            ScheduleStatus::Active => "Active",
            ScheduleStatus::Sending => "Sending",
            ScheduleStatus::Paused => "Paused",
            ScheduleStatus::Completed => "Completed",
            ScheduleStatus::Cancelled => "Cancelled",
            ScheduleStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event-relative anchor for offset triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePoint {
    EventStart,
    EventEnd,
    RsvpDeadline,
    RegistrationDate,
    CheckinDate,
    CheckoutDate,
}

impl ReferencePoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferencePoint::EventStart => "event_start",
            ReferencePoint::EventEnd => "event_end",
            ReferencePoint::RsvpDeadline => "rsvp_deadline",
            ReferencePoint::RegistrationDate => "registration_date",
            ReferencePoint::CheckinDate => "checkin_date",
            ReferencePoint::CheckoutDate => "checkout_date",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "event_start" => Some(ReferencePoint::EventStart),
            "event_end" => Some(ReferencePoint::EventEnd),
            "rsvp_deadline" => Some(ReferencePoint::RsvpDeadline),
            "registration_date" => Some(ReferencePoint::RegistrationDate),
            "checkin_date" => Some(ReferencePoint::CheckinDate),
            "checkout_date" => Some(ReferencePoint::CheckoutDate),
            _ => None,
        }
    }
}

impl fmt::Display for ReferencePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RsvpStatus {
    Pending,
    Confirmed,
    Declined,
}

/// A guest record as exposed by the guest/event data provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guest {
    pub id: Uuid,
    pub event_id: Option<Uuid>,
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub rsvp_status: Option<RsvpStatus>,
    #[serde(default)]
    pub vip: bool,
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checkin_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checkout_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Guest {
    /// RSVP status with a missing value read as pending.
    pub fn effective_rsvp(&self) -> RsvpStatus {
        self.rsvp_status.unwrap_or(RsvpStatus::Pending)
    }

    /// The non-blank contact value for the given channel, if any.
    pub fn contact_for(&self, channel: Channel) -> Option<&str> {
        let value = match channel.contact_field() {
            ContactField::Email => self.email.as_deref(),
            ContactField::Phone => self.phone.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn has_email(&self) -> bool {
        self.contact_for(Channel::Email).is_some()
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Reference dates of an event, resolved by the data provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventDates {
    pub event_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rsvp_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub venue_name: Option<String>,
    #[serde(default)]
    pub venue_address: Option<String>,
}

/// Point-in-time view of guests and events used for recipient resolution
/// and offset trigger computation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuestSnapshot {
    #[serde(default)]
    pub guests: Vec<Guest>,
    #[serde(default)]
    pub events: Vec<EventDates>,
}

impl GuestSnapshot {
    pub fn event(&self, event_id: &Uuid) -> Option<&EventDates> {
        self.events.iter().find(|e| e.event_id == *event_id)
    }

    pub fn guest(&self, guest_id: &Uuid) -> Option<&Guest> {
        self.guests.iter().find(|g| g.id == *guest_id)
    }

    /// Resolve a reference point for an event. Event-level points come from
    /// the event record; guest-level points (registration, check-in,
    /// check-out) resolve to the earliest value among the event's guests.
    pub fn reference_date(
        &self,
        event_id: Option<&Uuid>,
        reference: ReferencePoint,
    ) -> Option<DateTime<Utc>> {
        let event_id = event_id?;
        match reference {
            ReferencePoint::EventStart => self.event(event_id)?.start,
            ReferencePoint::EventEnd => self.event(event_id)?.end,
            ReferencePoint::RsvpDeadline => self.event(event_id)?.rsvp_deadline,
            ReferencePoint::RegistrationDate => self.earliest_guest_date(event_id, |g| g.registered_at),
            ReferencePoint::CheckinDate => self.earliest_guest_date(event_id, |g| g.checkin_at),
            ReferencePoint::CheckoutDate => self.earliest_guest_date(event_id, |g| g.checkout_at),
        }
    }

    fn earliest_guest_date<F>(&self, event_id: &Uuid, field: F) -> Option<DateTime<Utc>>
    where
        F: Fn(&Guest) -> Option<DateTime<Utc>>,
    {
        self.guests
            .iter()
            .filter(|g| g.event_id.as_ref() == Some(event_id))
            .filter_map(field)
            .min()
    }
}

/// Lifecycle events emitted by the scheduling engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ScheduleCreated,
    ScheduleUpdated,
    ScheduleActivated,
    SchedulePaused,
    ScheduleCancelled,
    ScheduleCompleted,
    ScheduleFailed,
    ScheduleDeleted,
    DispatchStarted,
    DispatchFinished,
    RecipientDelivered,
    RecipientFailed,
    TemplateDeleted,
}

/// A notification lifecycle event, attributable to a schedule and/or campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub schedule_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub detail: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn guest(event_id: Uuid, registered: Option<DateTime<Utc>>) -> Guest {
        Guest {
            id: Uuid::new_v4(),
            event_id: Some(event_id),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: Some("ada@example.com".into()),
            phone: Some("   ".into()),
            rsvp_status: None,
            vip: false,
            registered_at: registered,
            checkin_at: None,
            checkout_at: None,
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn test_contact_for_ignores_blank_values() {
        let g = guest(Uuid::new_v4(), None);
        assert_eq!(g.contact_for(Channel::Email), Some("ada@example.com"));
        assert_eq!(g.contact_for(Channel::Sms), None);
        assert_eq!(g.contact_for(Channel::WhatsApp), None);
        assert_eq!(g.effective_rsvp(), RsvpStatus::Pending);
    }

    #[test]
    fn test_reference_date_resolution() {
        let event_id = Uuid::new_v4();
        let start = Utc.with_ymd_and_hms(2024, 3, 15, 9, 0, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 2, 2, 10, 0, 0).unwrap();
        let snapshot = GuestSnapshot {
            guests: vec![guest(event_id, Some(late)), guest(event_id, Some(early))],
            events: vec![EventDates {
                event_id,
                name: "Gala".into(),
                start: Some(start),
                ..Default::default()
            }],
        };

        assert_eq!(
            snapshot.reference_date(Some(&event_id), ReferencePoint::EventStart),
            Some(start)
        );
        assert_eq!(
            snapshot.reference_date(Some(&event_id), ReferencePoint::RegistrationDate),
            Some(early)
        );
        assert_eq!(
            snapshot.reference_date(Some(&event_id), ReferencePoint::EventEnd),
            None
        );
        assert_eq!(snapshot.reference_date(None, ReferencePoint::EventStart), None);
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(Channel::parse(" SMS "), Some(Channel::Sms));
        assert_eq!(Channel::parse("fax"), None);
        assert_eq!(
            ReferencePoint::parse("checkout_date"),
            Some(ReferencePoint::CheckoutDate)
        );
        assert!(ScheduleStatus::Failed.is_terminal());
        assert!(!ScheduleStatus::Paused.is_terminal());
    }
}
