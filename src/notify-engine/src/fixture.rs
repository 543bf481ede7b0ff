//! JSON seed data for local runs: guests, events, templates and schedules.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use notify_channels::templates::{NewTemplate, TemplateStore};
use notify_core::types::{EventDates, Guest, GuestSnapshot};
use notify_scheduler::types::ScheduleDraft;
use notify_scheduler::ScheduleEngine;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub guests: Vec<Guest>,
    #[serde(default)]
    pub events: Vec<EventDates>,
    #[serde(default)]
    pub templates: Vec<NewTemplate>,
    #[serde(default)]
    pub schedules: Vec<FixtureSchedule>,
}

/// A schedule draft that names its template instead of carrying an id.
#[derive(Debug, Deserialize)]
pub struct FixtureSchedule {
    pub template: String,
    #[serde(default)]
    pub activate: bool,
    #[serde(flatten)]
    pub draft: ScheduleDraft,
}

impl Fixture {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing fixture {}", path.display()))
    }

    /// Split off the directory contents.
    pub fn snapshot(&mut self) -> GuestSnapshot {
        GuestSnapshot {
            guests: std::mem::take(&mut self.guests),
            events: std::mem::take(&mut self.events),
        }
    }

    pub fn install_templates(&mut self, store: &TemplateStore) -> anyhow::Result<()> {
        for template in std::mem::take(&mut self.templates) {
            let name = template.name.clone();
            store
                .create(template)
                .with_context(|| format!("creating template '{name}'"))?;
        }
        Ok(())
    }

    /// Create the fixture schedules, activating the ones marked so.
    pub async fn install_schedules(
        self,
        engine: &ScheduleEngine,
        now: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        let by_name: HashMap<String, _> = engine
            .templates()
            .list()
            .into_iter()
            .map(|t| (t.name.clone(), t.id))
            .collect();

        let count = self.schedules.len();
        for entry in self.schedules {
            let mut draft = entry.draft;
            let template_id = by_name
                .get(&entry.template)
                .with_context(|| format!("schedule '{}' names unknown template '{}'", draft.name, entry.template))?;
            draft.template_id = Some(*template_id);
            let schedule = engine.create(draft, now).await?;
            if entry.activate {
                engine.activate(schedule.id, now).await?;
            }
            info!(schedule_id = %schedule.id, name = %schedule.name, "Fixture schedule installed");
        }
        Ok(count)
    }
}
