//! Send cost estimation with SMS segmentation.

use notify_core::config::CostConfig;
use notify_core::error::{NotifyError, NotifyResult};
use notify_core::types::Channel;
use serde::{Deserialize, Serialize};

/// Characters that fit a single GSM-7 SMS.
pub const SMS_SINGLE_LIMIT: usize = 160;
/// Characters that fit a single UCS-2 SMS.
pub const SMS_UNICODE_LIMIT: usize = 70;
/// Characters per segment once a message is split.
pub const SMS_MULTIPART_SEGMENT: usize = 153;

/// Number of SMS segments needed for `message`.
///
/// One segment when the text fits the single-message limit (160 characters,
/// or 70 when any non-ASCII character is present); otherwise the text is
/// split into 153-character parts.
pub fn segment_count(message: &str) -> u32 {
    let len = message.chars().count();
    let single_limit = if message.is_ascii() {
        SMS_SINGLE_LIMIT
    } else {
        SMS_UNICODE_LIMIT
    };

    if len <= single_limit {
        1
    } else {
        len.div_ceil(SMS_MULTIPART_SEGMENT) as u32
    }
}

/// Reject SMS text that would need more than one segment when multipart
/// sending is disabled.
pub fn validate_sms_length(message: &str, allow_multipart: bool) -> NotifyResult<()> {
    if allow_multipart || segment_count(message) == 1 {
        return Ok(());
    }
    Err(NotifyError::validation(
        "message",
        None,
        format!(
            "SMS text is {} characters and multipart messages are disabled",
            message.chars().count()
        ),
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub channel: Channel,
    pub segments: u32,
    pub recipients: usize,
    pub unit_cost: f64,
    pub total: f64,
    pub currency: String,
}

impl CostEstimate {
    /// Whether the projected total is above a campaign cost limit.
    pub fn exceeds(&self, limit: f64) -> bool {
        self.total > limit
    }
}

/// Stateless estimator over the configured unit costs.
#[derive(Debug, Clone)]
pub struct CostEstimator {
    costs: CostConfig,
}

impl CostEstimator {
    pub fn new(costs: CostConfig) -> Self {
        Self { costs }
    }

    pub fn unit_cost(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Sms => self.costs.sms,
            Channel::Email => self.costs.email,
            Channel::WhatsApp => self.costs.whatsapp,
        }
    }

    pub fn estimate(&self, channel: Channel, message: &str, recipients: usize) -> CostEstimate {
        let segments = match channel {
            Channel::Sms => segment_count(message),
            Channel::Email | Channel::WhatsApp => 1,
        };
        let unit_cost = self.unit_cost(channel);
        CostEstimate {
            channel,
            segments,
            recipients,
            unit_cost,
            total: recipients as f64 * segments as f64 * unit_cost,
            currency: self.costs.currency.clone(),
        }
    }
}

impl Default for CostEstimator {
    fn default() -> Self {
        Self::new(CostConfig::default())
    }
}
