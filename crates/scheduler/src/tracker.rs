//! Campaign bookkeeping: per-recipient outcomes, delivery rate and cost.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notify_core::error::{NotifyError, NotifyResult};
use notify_core::types::Channel;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{delivery_rate, Campaign, CampaignStatus, DeliveryStatus, RecipientOutcome};

/// Input for [`CampaignTracker::begin`].
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub schedule_id: Option<Uuid>,
    pub name: String,
    pub channel: Channel,
    pub idempotency_key: String,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub recipient_count: usize,
    pub estimated_cost: f64,
    pub template_id: Option<Uuid>,
    pub template_version: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub campaigns: usize,
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
    pub delivery_rate: f64,
    pub total_cost: f64,
}

impl CampaignStats {
    fn add(&mut self, campaign: &Campaign) {
        self.campaigns += 1;
        self.recipients += campaign.recipient_count;
        self.delivered += campaign.delivered;
        self.failed += campaign.failed;
        self.skipped += campaign.skipped;
        self.total_cost += campaign.total_cost;
        self.delivery_rate = delivery_rate(self.delivered, self.failed);
    }
}

#[derive(Default)]
pub struct CampaignTracker {
    campaigns: DashMap<Uuid, Campaign>,
}

impl CampaignTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, input: NewCampaign, now: DateTime<Utc>) -> Campaign {
        let campaign = Campaign {
            id: Uuid::new_v4(),
            schedule_id: input.schedule_id,
            name: input.name,
            channel: input.channel,
            idempotency_key: input.idempotency_key,
            fired_at: now,
            scheduled_for: input.scheduled_for,
            recipient_count: input.recipient_count,
            delivered: 0,
            failed: 0,
            skipped: 0,
            outcomes: Vec::with_capacity(input.recipient_count),
            estimated_cost: input.estimated_cost,
            total_cost: 0.0,
            template_id: input.template_id,
            template_version: input.template_version,
            status: CampaignStatus::Sending,
            finished_at: None,
        };
        info!(
            campaign_id = %campaign.id,
            schedule_id = ?campaign.schedule_id,
            recipients = campaign.recipient_count,
            "Campaign started"
        );
        self.campaigns.insert(campaign.id, campaign.clone());
        campaign
    }

    /// Record one recipient outcome. Only delivered messages are charged.
    pub fn record(&self, campaign_id: &Uuid, outcome: RecipientOutcome) -> NotifyResult<()> {
        let mut entry = self
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| NotifyError::not_found("campaign", *campaign_id))?;
        if entry.status.is_terminal() {
            return Err(NotifyError::CampaignClosed {
                campaign_id: *campaign_id,
            });
        }
        match outcome.status {
            DeliveryStatus::Delivered => {
                entry.delivered += 1;
                entry.total_cost += outcome.cost;
            }
            DeliveryStatus::Failed => entry.failed += 1,
            DeliveryStatus::Skipped => entry.skipped += 1,
        }
        entry.outcomes.push(outcome);
        Ok(())
    }

    /// Close a campaign and derive its final status.
    pub fn finish(&self, campaign_id: &Uuid, aborted: bool, now: DateTime<Utc>) -> NotifyResult<Campaign> {
        self.close(campaign_id, now, |c| {
            if aborted {
                CampaignStatus::Aborted
            } else if c.delivered == 0 && c.failed > 0 {
                CampaignStatus::Failed
            } else if c.failed > 0 || c.skipped > 0 {
                CampaignStatus::PartiallySent
            } else {
                CampaignStatus::Sent
            }
        })
    }

    /// Close a campaign whose dispatch never reported back.
    pub fn interrupt(&self, campaign_id: &Uuid, now: DateTime<Utc>) -> NotifyResult<Campaign> {
        warn!(campaign_id = %campaign_id, "Campaign interrupted");
        self.close(campaign_id, now, |_| CampaignStatus::Interrupted)
    }

    fn close<F>(&self, campaign_id: &Uuid, now: DateTime<Utc>, status: F) -> NotifyResult<Campaign>
    where
        F: FnOnce(&Campaign) -> CampaignStatus,
    {
        let mut entry = self
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| NotifyError::not_found("campaign", *campaign_id))?;
        if entry.status.is_terminal() {
            return Err(NotifyError::CampaignClosed {
                campaign_id: *campaign_id,
            });
        }
        entry.status = status(&entry);
        entry.finished_at = Some(now);
        info!(
            campaign_id = %campaign_id,
            status = entry.status.as_str(),
            delivered = entry.delivered,
            failed = entry.failed,
            skipped = entry.skipped,
            total_cost = entry.total_cost,
            "Campaign closed"
        );
        Ok(entry.clone())
    }

    pub fn get(&self, campaign_id: &Uuid) -> Option<Campaign> {
        self.campaigns.get(campaign_id).map(|c| c.clone())
    }

    /// All campaigns, oldest first.
    pub fn list(&self) -> Vec<Campaign> {
        let mut all: Vec<Campaign> = self.campaigns.iter().map(|c| c.value().clone()).collect();
        all.sort_by_key(|c| c.fired_at);
        all
    }

    pub fn list_for_schedule(&self, schedule_id: &Uuid) -> Vec<Campaign> {
        self.list()
            .into_iter()
            .filter(|c| c.schedule_id == Some(*schedule_id))
            .collect()
    }

    /// Recipients already delivered under an occurrence key, across every
    /// campaign that used it.
    pub fn delivered_recipients(&self, idempotency_key: &str) -> HashSet<Uuid> {
        self.campaigns
            .iter()
            .filter(|c| c.idempotency_key == idempotency_key)
            .flat_map(|c| {
                c.outcomes
                    .iter()
                    .filter(|o| o.status == DeliveryStatus::Delivered)
                    .map(|o| o.recipient_id)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn stats(&self, campaign_id: &Uuid) -> Option<CampaignStats> {
        self.campaigns.get(campaign_id).map(|c| {
            let mut stats = CampaignStats::default();
            stats.add(&c);
            stats
        })
    }

    pub fn schedule_totals(&self, schedule_id: &Uuid) -> CampaignStats {
        let mut stats = CampaignStats::default();
        for campaign in self.list_for_schedule(schedule_id) {
            stats.add(&campaign);
        }
        stats
    }
}
