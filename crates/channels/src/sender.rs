//! Provider port for outbound messages and an in-memory simulated provider.
//!
//! The engine calls [`MessageSender::send`] once per recipient. Providers
//! must tolerate at-least-once invocation: a repeated `idempotency_key`
//! should return the original outcome instead of sending again.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notify_core::types::Channel;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Provider credentials, passed explicitly with every send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub account: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct SendContext {
    pub campaign_id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub recipient_id: Uuid,
    /// Email address or phone number, per channel.
    pub contact: String,
    pub subject: Option<String>,
    pub body: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendOutcome {
    Delivered { provider_id: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SenderError {
    /// The provider refused this one message.
    #[error("rejected by provider: {0}")]
    Rejected(String),
    /// The whole channel is unreachable.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        ctx: &SendContext,
        message: &OutboundMessage,
    ) -> Result<SendOutcome, SenderError>;
}

/// A message accepted by [`SimulatedSender`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentMessage {
    pub message: OutboundMessage,
    pub campaign_id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub outcome: SendOutcome,
    pub sent_at: DateTime<Utc>,
}

const NO_LIMIT: usize = usize::MAX;

/// In-memory provider used by tests and the local binary.
pub struct SimulatedSender {
    /// idempotency_key -> accepted message
    sent: DashMap<String, SentMessage>,
    failing: DashMap<String, String>,
    rejecting: DashMap<String, String>,
    outage: AtomicBool,
    /// Number of successful sends after which the provider goes down.
    outage_after: AtomicUsize,
    delivered: AtomicUsize,
    attempts: AtomicUsize,
    latency_ms: AtomicU64,
}

impl SimulatedSender {
    pub fn new() -> Self {
        Self {
            sent: DashMap::new(),
            failing: DashMap::new(),
            rejecting: DashMap::new(),
            outage: AtomicBool::new(false),
            outage_after: AtomicUsize::new(NO_LIMIT),
            delivered: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Deliveries to `contact` come back as `Failed`.
    pub fn fail_contact(&self, contact: impl Into<String>, reason: impl Into<String>) {
        self.failing.insert(contact.into(), reason.into());
    }

    /// Sends to `contact` return `SenderError::Rejected`.
    pub fn reject_contact(&self, contact: impl Into<String>, reason: impl Into<String>) {
        self.rejecting.insert(contact.into(), reason.into());
    }

    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Go down after `n` further successful deliveries.
    pub fn outage_after(&self, n: usize) {
        let base = self.delivered.load(Ordering::SeqCst);
        self.outage_after
            .store(base.saturating_add(n), Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every accepted message, oldest first.
    pub fn sent(&self) -> Vec<SentMessage> {
        let mut all: Vec<SentMessage> = self.sent.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|m| m.sent_at);
        all
    }

    pub fn sent_to(&self, contact: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.message.contact == contact)
            .collect()
    }

    /// Distinct messages accepted (idempotent repeats are not counted).
    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    /// Raw number of `send` calls, including repeats and errors.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn is_down(&self) -> bool {
        self.outage.load(Ordering::SeqCst)
            || self.delivered.load(Ordering::SeqCst) >= self.outage_after.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSender for SimulatedSender {
    async fn send(
        &self,
        ctx: &SendContext,
        message: &OutboundMessage,
    ) -> Result<SendOutcome, SenderError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if let Some(previous) = self.sent.get(&message.idempotency_key) {
            debug!(
                idempotency_key = %message.idempotency_key,
                "Duplicate send suppressed"
            );
            return Ok(previous.outcome.clone());
        }

        if self.is_down() {
            return Err(SenderError::Unavailable(format!(
                "{} gateway unreachable",
                message.channel
            )));
        }
        if let Some(reason) = self.rejecting.get(&message.contact) {
            return Err(SenderError::Rejected(reason.clone()));
        }

        let outcome = match self.failing.get(&message.contact) {
            Some(reason) => SendOutcome::Failed {
                reason: reason.clone(),
            },
            None => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                SendOutcome::Delivered {
                    provider_id: format!("SIM{}", Uuid::new_v4().simple()),
                }
            }
        };

        metrics::counter!("notify.sender.sent", "channel" => message.channel.as_str())
            .increment(1);
        info!(
            campaign_id = %ctx.campaign_id,
            recipient_id = %message.recipient_id,
            channel = %message.channel,
            delivered = matches!(outcome, SendOutcome::Delivered { .. }),
            "Simulated provider accepted message"
        );

        self.sent.insert(
            message.idempotency_key.clone(),
            SentMessage {
                message: message.clone(),
                campaign_id: ctx.campaign_id,
                schedule_id: ctx.schedule_id,
                outcome: outcome.clone(),
                sent_at: Utc::now(),
            },
        );
        Ok(outcome)
    }
}
