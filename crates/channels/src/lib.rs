//! Message-side building blocks for notification dispatch.
//!
//! Templates and their revisions, placeholder rendering, cost estimation
//! with SMS segmentation, and the `MessageSender` provider port.

pub mod cost;
pub mod render;
pub mod sender;
pub mod templates;

pub use cost::{CostEstimate, CostEstimator};
pub use sender::{MessageSender, OutboundMessage, SendContext, SendOutcome, SenderError, SimulatedSender};
pub use templates::{NewTemplate, Template, TemplateCategory, TemplateEdit, TemplateStore};
