//! Notification scheduling: schedule lifecycle, trigger resolution,
//! recipient selection, dispatch and campaign tracking.

pub mod cron;
pub mod engine;
pub mod export;
pub mod preview;
pub mod recipients;
pub mod state_machine;
pub mod tracker;
pub mod trigger;
pub mod types;

pub use engine::{
    AdhocCampaign, DispatchOutcome, EngineSettings, ScheduleEngine, ScheduleFilter, ScheduleTab,
    SkipReason, TickReport,
};
pub use preview::SchedulePreview;
pub use tracker::{CampaignStats, CampaignTracker};
