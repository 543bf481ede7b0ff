//! Recipient selection over a guest snapshot.

use std::collections::HashSet;

use notify_core::types::{Channel, Guest, GuestSnapshot, RsvpStatus};
use uuid::Uuid;

use crate::types::{RecipientType, Schedule};

/// Which guests a send targets.
#[derive(Debug, Clone)]
pub struct RecipientRule<'a> {
    pub recipient_type: RecipientType,
    pub event_id: Option<Uuid>,
    pub explicit: &'a [Uuid],
}

impl<'a> RecipientRule<'a> {
    pub fn for_schedule(schedule: &'a Schedule) -> Self {
        Self {
            recipient_type: schedule.recipient_type,
            event_id: schedule.event_id,
            explicit: &schedule.recipient_list,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Recipient {
    pub guest: Guest,
    /// Channel-specific contact value, never blank.
    pub contact: String,
}

#[derive(Debug, Clone, Default)]
pub struct RecipientSet {
    pub recipients: Vec<Recipient>,
    /// Selected guests dropped for lacking the channel's contact field.
    pub excluded: usize,
    /// Explicit ids that matched no guest.
    pub unknown: usize,
}

impl RecipientSet {
    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.recipients.iter().map(|r| r.guest.id).collect()
    }
}

fn in_scope(guest: &Guest, event_id: Option<Uuid>) -> bool {
    event_id.is_none_or(|id| guest.event_id == Some(id))
}

fn selected(guest: &Guest, rule: &RecipientRule<'_>, explicit: &HashSet<Uuid>) -> bool {
    match rule.recipient_type {
        RecipientType::All => true,
        RecipientType::Event => rule.event_id.is_some() && in_scope(guest, rule.event_id),
        RecipientType::RsvpPending => {
            in_scope(guest, rule.event_id) && guest.effective_rsvp() == RsvpStatus::Pending
        }
        RecipientType::RsvpConfirmed => {
            in_scope(guest, rule.event_id) && guest.effective_rsvp() == RsvpStatus::Confirmed
        }
        RecipientType::RsvpDeclined => {
            in_scope(guest, rule.event_id) && guest.effective_rsvp() == RsvpStatus::Declined
        }
        RecipientType::NoResponse => in_scope(guest, rule.event_id) && guest.rsvp_status.is_none(),
        RecipientType::Vip => in_scope(guest, rule.event_id) && guest.vip,
        RecipientType::Custom => explicit.contains(&guest.id),
        RecipientType::NoEmail => in_scope(guest, rule.event_id) && !guest.has_email(),
    }
}

/// Resolve a rule into an ordered, de-duplicated recipient set.
///
/// Order follows the snapshot. Guests without the contact field the channel
/// needs are counted in `excluded` rather than treated as errors.
pub fn resolve(rule: &RecipientRule<'_>, channel: Channel, snapshot: &GuestSnapshot) -> RecipientSet {
    let explicit: HashSet<Uuid> = rule.explicit.iter().copied().collect();
    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut set = RecipientSet::default();

    for guest in &snapshot.guests {
        if !selected(guest, rule, &explicit) || !seen.insert(guest.id) {
            continue;
        }
        match guest.contact_for(channel) {
            Some(contact) => set.recipients.push(Recipient {
                contact: contact.to_string(),
                guest: guest.clone(),
            }),
            None => set.excluded += 1,
        }
    }

    if rule.recipient_type == RecipientType::Custom {
        set.unknown = explicit.iter().filter(|id| !seen.contains(id)).count();
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn guest(event: Uuid, email: Option<&str>, phone: Option<&str>, rsvp: Option<RsvpStatus>) -> Guest {
        Guest {
            id: Uuid::new_v4(),
            event_id: Some(event),
            first_name: "G".into(),
            last_name: String::new(),
            email: email.map(Into::into),
            phone: phone.map(Into::into),
            rsvp_status: rsvp,
            vip: false,
            registered_at: None,
            checkin_at: None,
            checkout_at: None,
            attributes: HashMap::new(),
        }
    }

    fn rule(recipient_type: RecipientType, event_id: Option<Uuid>) -> RecipientRule<'static> {
        RecipientRule {
            recipient_type,
            event_id,
            explicit: &[],
        }
    }

    #[test]
    fn test_rsvp_filters_treat_missing_as_pending() {
        let ev = Uuid::new_v4();
        let snapshot = GuestSnapshot {
            guests: vec![
                guest(ev, Some("a@x.io"), None, None),
                guest(ev, Some("b@x.io"), None, Some(RsvpStatus::Pending)),
                guest(ev, Some("c@x.io"), None, Some(RsvpStatus::Confirmed)),
                guest(Uuid::new_v4(), Some("d@x.io"), None, None),
            ],
            events: vec![],
        };

        let pending = resolve(&rule(RecipientType::RsvpPending, Some(ev)), Channel::Email, &snapshot);
        assert_eq!(pending.len(), 2);
        let no_response = resolve(&rule(RecipientType::NoResponse, Some(ev)), Channel::Email, &snapshot);
        assert_eq!(no_response.len(), 1);
        let everyone = resolve(&rule(RecipientType::All, Some(ev)), Channel::Email, &snapshot);
        assert_eq!(everyone.len(), 4);
    }

    #[test]
    fn test_missing_contact_is_excluded_not_errored() {
        let ev = Uuid::new_v4();
        let snapshot = GuestSnapshot {
            guests: vec![
                guest(ev, Some("a@x.io"), Some("+1"), None),
                guest(ev, None, Some("+2"), None),
                guest(ev, None, None, None),
            ],
            events: vec![],
        };
        let sms = resolve(&rule(RecipientType::Event, Some(ev)), Channel::Sms, &snapshot);
        assert_eq!(sms.len(), 2);
        assert_eq!(sms.excluded, 1);

        let no_email = resolve(&rule(RecipientType::NoEmail, None), Channel::Sms, &snapshot);
        assert_eq!(no_email.recipients.iter().map(|r| r.contact.as_str()).collect::<Vec<_>>(), vec!["+2"]);
        assert_eq!(no_email.excluded, 1);
    }

    #[test]
    fn test_custom_list_in_snapshot_order_and_deduplicated() {
        let ev = Uuid::new_v4();
        let a = guest(ev, Some("a@x.io"), None, None);
        let b = guest(ev, Some("b@x.io"), None, None);
        let snapshot = GuestSnapshot {
            guests: vec![a.clone(), b.clone(), a.clone()],
            events: vec![],
        };
        let ghost = Uuid::new_v4();
        let explicit = vec![b.id, ghost, a.id, b.id];
        let set = resolve(
            &RecipientRule {
                recipient_type: RecipientType::Custom,
                event_id: None,
                explicit: &explicit,
            },
            Channel::Email,
            &snapshot,
        );
        assert_eq!(set.ids(), vec![a.id, b.id]);
        assert_eq!(set.unknown, 1);
    }

    #[test]
    fn test_event_rule_without_event_selects_nobody() {
        let snapshot = GuestSnapshot {
            guests: vec![guest(Uuid::new_v4(), Some("a@x.io"), None, None)],
            events: vec![],
        };
        assert!(resolve(&rule(RecipientType::Event, None), Channel::Email, &snapshot).is_empty());
    }
}
