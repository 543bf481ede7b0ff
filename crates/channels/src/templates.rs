//! Template store: reusable email/SMS/WhatsApp message templates with
//! revision history.
//!
//! Every edit bumps the template version and appends an immutable revision,
//! so campaigns that recorded `(template_id, version)` keep pointing at the
//! exact content they were sent with.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notify_core::error::{NotifyError, NotifyResult};
use notify_core::types::Channel;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::cost::validate_sms_length;
use crate::render::placeholders;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    Event,
    Rsvp,
    Logistics,
    Reminder,
    Confirmation,
    Welcome,
    Update,
    Marketing,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub channel: Channel,
    pub category: TemplateCategory,
    pub subject: Option<String>,
    pub body: String,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub reply_to: Option<String>,
    pub description: String,
    pub tags: Vec<String>,
    pub is_active: bool,
    pub version: u32,
    /// Set once a campaign has been sent with this template.
    pub locked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    /// Placeholder names used by the subject and body.
    pub fn variables(&self) -> Vec<String> {
        let mut names = self
            .subject
            .as_deref()
            .map(placeholders)
            .unwrap_or_default();
        for name in placeholders(&self.body) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

/// Input for [`TemplateStore::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    pub channel: Channel,
    pub category: TemplateCategory,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_email: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Partial update for [`TemplateStore::update`]; `None` leaves a field as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateEdit {
    pub name: Option<String>,
    pub category: Option<TemplateCategory>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub reply_to: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub is_active: Option<bool>,
    pub changelog: String,
}

/// Snapshot of a template's content at one version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRevision {
    pub version: u32,
    pub subject: Option<String>,
    pub body: String,
    pub changed_at: DateTime<Utc>,
    pub changelog: String,
}

/// Whether two versions would send the same message.
fn same_content(a: &Template, b: &Template) -> bool {
    a.subject == b.subject
        && a.body == b.body
        && a.sender_name == b.sender_name
        && a.sender_email == b.sender_email
        && a.reply_to == b.reply_to
}

pub struct TemplateStore {
    templates: DashMap<Uuid, Template>,
    revisions: DashMap<Uuid, Vec<TemplateRevision>>,
    allow_multipart: bool,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
            revisions: DashMap::new(),
            allow_multipart: true,
        }
    }

    /// When disabled, SMS bodies longer than one segment are rejected.
    pub fn with_multipart_sms(mut self, allow: bool) -> Self {
        self.allow_multipart = allow;
        self
    }

    fn validate(&self, id: Option<Uuid>, template: &Template) -> NotifyResult<()> {
        if template.name.trim().is_empty() {
            return Err(NotifyError::validation("template", id, "name is required"));
        }
        if template.body.trim().is_empty() {
            return Err(NotifyError::validation("template", id, "body is empty"));
        }
        if template.channel == Channel::Email
            && template.subject.as_deref().map_or(true, |s| s.trim().is_empty())
        {
            return Err(NotifyError::validation(
                "template",
                id,
                "email templates require a subject",
            ));
        }
        if template.channel == Channel::Sms {
            validate_sms_length(&template.body, self.allow_multipart).map_err(|e| match e {
                NotifyError::Validation { reason, .. } => {
                    NotifyError::validation("template", id, reason)
                }
                other => other,
            })?;
        }
        Ok(())
    }

    pub fn create(&self, input: NewTemplate) -> NotifyResult<Template> {
        let now = Utc::now();
        let template = Template {
            id: Uuid::new_v4(),
            name: input.name,
            channel: input.channel,
            category: input.category,
            subject: input.subject,
            body: input.body,
            sender_name: input.sender_name,
            sender_email: input.sender_email,
            reply_to: input.reply_to,
            description: input.description,
            tags: input.tags,
            is_active: input.is_active,
            version: 1,
            locked: false,
            created_at: now,
            updated_at: now,
        };
        self.validate(None, &template)?;

        self.revisions.insert(
            template.id,
            vec![TemplateRevision {
                version: 1,
                subject: template.subject.clone(),
                body: template.body.clone(),
                changed_at: now,
                changelog: "Initial version".to_string(),
            }],
        );
        self.templates.insert(template.id, template.clone());
        info!(template_id = %template.id, channel = %template.channel, "Template created");
        Ok(template)
    }

    /// Apply an edit, bump the version and record a revision. The stored
    /// template is left untouched when the edited result fails validation.
    pub fn update(&self, id: &Uuid, edit: TemplateEdit) -> NotifyResult<Template> {
        let mut entry = self
            .templates
            .get_mut(id)
            .ok_or_else(|| NotifyError::not_found("template", *id))?;

        let mut next = entry.clone();
        if let Some(name) = edit.name {
            next.name = name;
        }
        if let Some(category) = edit.category {
            next.category = category;
        }
        if let Some(subject) = edit.subject {
            next.subject = Some(subject);
        }
        if let Some(body) = edit.body {
            next.body = body;
        }
        if let Some(sender_name) = edit.sender_name {
            next.sender_name = Some(sender_name);
        }
        if let Some(sender_email) = edit.sender_email {
            next.sender_email = Some(sender_email);
        }
        if let Some(reply_to) = edit.reply_to {
            next.reply_to = Some(reply_to);
        }
        if let Some(description) = edit.description {
            next.description = description;
        }
        if let Some(tags) = edit.tags {
            next.tags = tags;
        }
        if let Some(is_active) = edit.is_active {
            next.is_active = is_active;
        }
        if entry.locked && !same_content(&entry, &next) {
            return Err(NotifyError::validation(
                "template",
                Some(*id),
                "template has already been sent; create a new template to change its content",
            ));
        }
        self.validate(Some(*id), &next)?;

        next.version += 1;
        next.updated_at = Utc::now();
        *entry = next.clone();
        drop(entry);

        self.revisions.entry(*id).or_default().push(TemplateRevision {
            version: next.version,
            subject: next.subject.clone(),
            body: next.body.clone(),
            changed_at: next.updated_at,
            changelog: edit.changelog,
        });
        info!(template_id = %id, version = next.version, "Template updated");
        Ok(next)
    }

    /// Lock the template after its first send. Locked templates only
    /// accept edits to name, category, description, tags and active flag.
    pub fn mark_used(&self, id: &Uuid) -> NotifyResult<()> {
        let mut entry = self
            .templates
            .get_mut(id)
            .ok_or_else(|| NotifyError::not_found("template", *id))?;
        entry.locked = true;
        Ok(())
    }

    /// Remove a template. Reference checks against schedules are the
    /// caller's responsibility.
    pub fn remove(&self, id: &Uuid) -> NotifyResult<Template> {
        let (_, template) = self
            .templates
            .remove(id)
            .ok_or_else(|| NotifyError::not_found("template", *id))?;
        info!(template_id = %id, "Template removed");
        Ok(template)
    }

    pub fn get(&self, id: &Uuid) -> Option<Template> {
        self.templates.get(id).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<Template> {
        let mut all: Vec<Template> = self.templates.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        all
    }

    /// Search by channel, category and free text over name, description,
    /// subject and tags.
    pub fn search(
        &self,
        channel: Option<Channel>,
        category: Option<TemplateCategory>,
        query: Option<&str>,
    ) -> Vec<Template> {
        let query = query.map(str::to_lowercase);
        self.list()
            .into_iter()
            .filter(|t| {
                let ch_ok = channel.is_none_or(|c| t.channel == c);
                let cat_ok = category.is_none_or(|c| t.category == c);
                let query_ok = query.as_deref().is_none_or(|q| {
                    t.name.to_lowercase().contains(q)
                        || t.description.to_lowercase().contains(q)
                        || t.subject.as_deref().is_some_and(|s| s.to_lowercase().contains(q))
                        || t.tags.iter().any(|tag| tag.to_lowercase().contains(q))
                });
                ch_ok && cat_ok && query_ok
            })
            .collect()
    }

    pub fn version_history(&self, id: &Uuid) -> Vec<TemplateRevision> {
        self.revisions.get(id).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn revision(&self, id: &Uuid, version: u32) -> Option<TemplateRevision> {
        self.revisions
            .get(id)
            .and_then(|v| v.iter().find(|r| r.version == version).cloned())
    }

    /// Install the stock invitation, confirmation, reminder and travel
    /// templates. Returns the created templates.
    pub fn seed_defaults(&self) -> NotifyResult<Vec<Template>> {
        default_templates()
            .into_iter()
            .map(|t| self.create(t))
            .collect()
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn default_templates() -> Vec<NewTemplate> {
    vec![
        NewTemplate {
            name: "Event Invitation".into(),
            channel: Channel::Email,
            category: TemplateCategory::Event,
            subject: Some("You're invited to {{event_name}}".into()),
            body: "Dear {{guest_first_name}},\n\nYou are cordially invited to {{event_name}} \
                   on {{event_date}} at {{event_time}}.\n\nVenue: {{venue_name}}\n\
                   {{venue_address}}\n\nPlease RSVP by {{rsvp_deadline}}: {{rsvp_link}}\n\n\
                   Best regards,\n{{organization_name}}"
                .into(),
            sender_name: None,
            sender_email: None,
            reply_to: None,
            description: "Formal invitation with RSVP link".into(),
            tags: vec!["invitation".into(), "rsvp".into()],
            is_active: true,
        },
        NewTemplate {
            name: "RSVP Confirmation".into(),
            channel: Channel::Email,
            category: TemplateCategory::Confirmation,
            subject: Some("RSVP confirmed: {{event_name}}".into()),
            body: "Hi {{guest_first_name}},\n\nThank you for confirming your attendance at \
                   {{event_name}} on {{event_date}}.\n\nWe look forward to seeing you at \
                   {{venue_name}}.\n\nQuestions? Contact {{contact_email}}."
                .into(),
            sender_name: None,
            sender_email: None,
            reply_to: None,
            description: "Sent after a guest confirms".into(),
            tags: vec!["rsvp".into()],
            is_active: true,
        },
        NewTemplate {
            name: "Event Reminder".into(),
            channel: Channel::Sms,
            category: TemplateCategory::Reminder,
            subject: None,
            body: "Hi {{guest_first_name}}, reminder: {{event_name}} is on {{event_date}} \
                   at {{event_time}}, {{venue_name}}. See you there!"
                .into(),
            sender_name: None,
            sender_email: None,
            reply_to: None,
            description: "Short SMS reminder".into(),
            tags: vec!["reminder".into()],
            is_active: true,
        },
        NewTemplate {
            name: "Travel Information".into(),
            channel: Channel::Email,
            category: TemplateCategory::Logistics,
            subject: Some("Travel details for {{event_name}}".into()),
            body: "Dear {{guest_first_name}},\n\nHere is your travel information for \
                   {{event_name}}.\n\nVenue address: {{venue_address}}\nDate: {{event_date}}\n\n\
                   For assistance call {{contact_phone}}."
                .into(),
            sender_name: None,
            sender_email: None,
            reply_to: None,
            description: "Logistics and directions".into(),
            tags: vec!["travel".into(), "logistics".into()],
            is_active: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sms(body: &str) -> NewTemplate {
        NewTemplate {
            name: "Reminder".into(),
            channel: Channel::Sms,
            category: TemplateCategory::Reminder,
            subject: None,
            body: body.into(),
            sender_name: None,
            sender_email: None,
            reply_to: None,
            description: String::new(),
            tags: vec!["day-of".into()],
            is_active: true,
        }
    }

    #[test]
    fn test_create_and_versioning() {
        let store = TemplateStore::new();
        let tmpl = store.create(sms("See you {{guest_first_name}}")).unwrap();
        assert_eq!(tmpl.version, 1);
        assert_eq!(tmpl.variables(), vec!["guest_first_name"]);

        let updated = store
            .update(
                &tmpl.id,
                TemplateEdit {
                    body: Some("See you soon {{guest_first_name}}".into()),
                    changelog: "copy tweak".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.version, 2);

        let history = store.version_history(&tmpl.id);
        assert_eq!(history.len(), 2);
        assert_eq!(
            store.revision(&tmpl.id, 1).unwrap().body,
            "See you {{guest_first_name}}"
        );
    }

    #[test]
    fn test_email_requires_subject() {
        let store = TemplateStore::new();
        let mut input = sms("Body");
        input.channel = Channel::Email;
        let err = store.create(input).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_invalid_update_leaves_template_unchanged() {
        let store = TemplateStore::new();
        let tmpl = store.create(sms("Original")).unwrap();
        let err = store
            .update(
                &tmpl.id,
                TemplateEdit {
                    body: Some("   ".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let current = store.get(&tmpl.id).unwrap();
        assert_eq!(current.body, "Original");
        assert_eq!(current.version, 1);
    }

    #[test]
    fn test_multipart_policy() {
        let store = TemplateStore::new().with_multipart_sms(false);
        assert!(store.create(sms(&"a".repeat(161))).is_err());
        assert!(store.create(sms(&"a".repeat(160))).is_ok());
    }

    #[test]
    fn test_search_and_seed() {
        let store = TemplateStore::new();
        let seeded = store.seed_defaults().unwrap();
        assert_eq!(seeded.len(), 4);

        let sms_only = store.search(Some(Channel::Sms), None, None);
        assert_eq!(sms_only.len(), 1);
        assert_eq!(sms_only[0].name, "Event Reminder");

        let travel = store.search(None, None, Some("TRAVEL"));
        assert_eq!(travel.len(), 1);

        let rsvp = store.search(None, Some(TemplateCategory::Confirmation), None);
        assert_eq!(rsvp[0].name, "RSVP Confirmation");
    }

    #[test]
    fn test_locked_template_rejects_content_edits() {
        let store = TemplateStore::new();
        let tmpl = store.create(sms("Doors open at 7")).unwrap();
        store.mark_used(&tmpl.id).unwrap();

        let err = store
            .update(
                &tmpl.id,
                TemplateEdit {
                    body: Some("Doors open at 8".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(store.get(&tmpl.id).unwrap().body, "Doors open at 7");

        let renamed = store
            .update(
                &tmpl.id,
                TemplateEdit {
                    name: Some("Doors (sent)".into()),
                    is_active: Some(false),
                    changelog: "retire".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(renamed.name, "Doors (sent)");
        assert!(!renamed.is_active);
        assert_eq!(renamed.body, "Doors open at 7");
        assert_eq!(renamed.version, 2);
    }

    #[test]
    fn test_mark_used_and_remove() {
        let store = TemplateStore::new();
        let tmpl = store.create(sms("Hi")).unwrap();
        store.mark_used(&tmpl.id).unwrap();
        assert!(store.get(&tmpl.id).unwrap().locked);
        store.remove(&tmpl.id).unwrap();
        assert!(store.get(&tmpl.id).is_none());
        assert_eq!(store.remove(&tmpl.id).unwrap_err().code(), "NOT_FOUND");
    }
}
