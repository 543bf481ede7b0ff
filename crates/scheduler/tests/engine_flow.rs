//! End-to-end scheduling flows against the in-memory directory and the
//! simulated provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use notify_channels::sender::{
    MessageSender, OutboundMessage, SendContext, SendOutcome, SenderError, SimulatedSender,
};
use notify_channels::templates::{NewTemplate, Template, TemplateCategory, TemplateStore};
use notify_core::directory::InMemoryDirectory;
use notify_core::event_bus::{capture_sink, CaptureSink};
use notify_core::types::{
    Channel, EventDates, EventType, Guest, GuestSnapshot, ReferencePoint, ScheduleStatus,
};
use notify_scheduler::types::{
    CampaignStatus, OffsetDirection, Priority, RecipientType, Recurrence, RecurrencePattern,
    ScheduleDraft, ScheduleType, Trigger,
};
use notify_scheduler::{
    AdhocCampaign, DispatchOutcome, EngineSettings, ScheduleEngine, SkipReason,
};

fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

fn local(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
    at(y, m, d, h).naive_utc()
}

fn guest(event_id: Uuid, name: &str, phone: Option<&str>) -> Guest {
    Guest {
        id: Uuid::new_v4(),
        event_id: Some(event_id),
        first_name: name.into(),
        last_name: "Guest".into(),
        email: Some(format!("{}@example.com", name.to_lowercase())),
        phone: phone.map(Into::into),
        rsvp_status: None,
        vip: false,
        registered_at: None,
        checkin_at: None,
        checkout_at: None,
        attributes: HashMap::new(),
    }
}

struct Fixture {
    engine: ScheduleEngine,
    directory: Arc<InMemoryDirectory>,
    sender: Arc<SimulatedSender>,
    templates: Arc<TemplateStore>,
    sink: Arc<CaptureSink>,
    event_id: Uuid,
    guest_ids: HashMap<String, Uuid>,
    sms: Template,
    email: Template,
}

impl Fixture {
    fn guest_id(&self, first_name: &str) -> Uuid {
        self.guest_ids[first_name]
    }
}

/// Three reachable SMS guests plus one without a phone, all at one event
/// starting 2024-03-20 18:00 UTC.
fn fixture() -> Fixture {
    let event_id = Uuid::new_v4();
    let snapshot = GuestSnapshot {
        guests: vec![
            guest(event_id, "Ada", Some("+15550001")),
            guest(event_id, "Ben", Some("+15550002")),
            guest(event_id, "Cy", Some("+15550003")),
            guest(event_id, "Di", None),
        ],
        events: vec![EventDates {
            event_id,
            name: "Spring Gala".into(),
            start: Some(at(2024, 3, 20, 18)),
            end: Some(at(2024, 3, 20, 23)),
            rsvp_deadline: Some(at(2024, 3, 15, 0)),
            venue_name: Some("Hall".into()),
            venue_address: None,
        }],
    };
    let templates = Arc::new(TemplateStore::new());
    let sms = templates
        .create(NewTemplate {
            name: "SMS reminder".into(),
            channel: Channel::Sms,
            category: TemplateCategory::Reminder,
            subject: None,
            body: "Hi {{guest_first_name}}, {{event_name}} is coming up".into(),
            sender_name: None,
            sender_email: None,
            reply_to: None,
            description: String::new(),
            tags: vec![],
            is_active: true,
        })
        .unwrap();
    let email = templates
        .create(NewTemplate {
            name: "Email invite".into(),
            channel: Channel::Email,
            category: TemplateCategory::Event,
            subject: Some("You're invited to {{event_name}}".into()),
            body: "Dear {{guest_name}}".into(),
            sender_name: None,
            sender_email: None,
            reply_to: None,
            description: String::new(),
            tags: vec![],
            is_active: true,
        })
        .unwrap();

    let guest_ids = snapshot
        .guests
        .iter()
        .map(|g| (g.first_name.clone(), g.id))
        .collect();
    let directory = Arc::new(InMemoryDirectory::new(snapshot));
    let sender = Arc::new(SimulatedSender::new());
    let sink = capture_sink();
    let engine = ScheduleEngine::new(templates.clone(), directory.clone(), sender.clone())
        .with_event_sink(sink.clone());
    Fixture {
        engine,
        directory,
        sender,
        templates,
        sink,
        event_id,
        guest_ids,
        sms,
        email,
    }
}

fn sms_draft(f: &Fixture, name: &str) -> ScheduleDraft {
    ScheduleDraft {
        name: name.into(),
        description: "Guest reminder".into(),
        schedule_type: ScheduleType::OneTime,
        notification_type: Channel::Sms,
        template_id: Some(f.sms.id),
        event_id: Some(f.event_id),
        recipient_type: RecipientType::Event,
        recipient_list: vec![],
        trigger: Trigger::Datetime {
            at: local(2024, 3, 10, 9),
        },
        recurrence: None,
        timezone: "UTC".into(),
        priority: Priority::Normal,
        is_active: true,
        tags: vec![],
        cost_limit: None,
        extra_variables: HashMap::new(),
    }
}

fn daily(max: u32) -> Recurrence {
    Recurrence {
        pattern: RecurrencePattern::Daily,
        interval: 1,
        end_date: None,
        max_occurrences: Some(max),
        expression: None,
    }
}

/// Provider that blocks each send until released.
#[derive(Default)]
struct GatedSender {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl MessageSender for GatedSender {
    async fn send(
        &self,
        _ctx: &SendContext,
        message: &OutboundMessage,
    ) -> Result<SendOutcome, SenderError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(SendOutcome::Delivered {
            provider_id: format!("gate-{}", message.recipient_id),
        })
    }
}

fn gated(f: &Fixture) -> (ScheduleEngine, Arc<GatedSender>) {
    let gate = Arc::new(GatedSender::default());
    let settings = EngineSettings {
        send_timeout: Duration::from_secs(30),
        ..EngineSettings::default()
    };
    let engine = ScheduleEngine::new(f.templates.clone(), f.directory.clone(), gate.clone())
        .with_settings(settings)
        .with_event_sink(f.sink.clone());
    (engine, gate)
}

#[tokio::test]
async fn test_drip_fires_each_occurrence_then_completes() {
    let f = fixture();
    let mut draft = sms_draft(&f, "Countdown");
    draft.schedule_type = ScheduleType::DripCampaign;
    draft.recurrence = Some(daily(3));
    let s = f.engine.create(draft, at(2024, 3, 1, 0)).await.unwrap();
    f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();

    for day in 10..=12 {
        assert!(f.engine.tick(at(2024, 3, day, 8)).await.unwrap().dispatched.is_empty());
        let report = f.engine.tick(at(2024, 3, day, 9)).await.unwrap();
        assert_eq!(report.dispatched, vec![s.id]);
    }

    let done = f.engine.get(&s.id).unwrap();
    assert_eq!(done.status, ScheduleStatus::Completed);
    assert_eq!(done.occurrence_count, 3);
    assert_eq!(done.next_fire_at, None);
    assert!(f.engine.tick(at(2024, 3, 13, 9)).await.unwrap().dispatched.is_empty());

    // Three reachable guests per occurrence; the guest without a phone is excluded.
    assert_eq!(f.sender.sent_count(), 9);
    let campaigns = f.engine.campaigns().list_for_schedule(&s.id);
    assert_eq!(campaigns.len(), 3);
    assert!(campaigns.iter().all(|c| c.status == CampaignStatus::Sent));
    let totals = f.engine.campaigns().schedule_totals(&s.id);
    assert_eq!(totals.delivered, 9);
    assert!((totals.total_cost - 0.09).abs() < 1e-9);
    assert_eq!(f.sink.count_type(EventType::ScheduleCompleted), 1);
}

#[tokio::test]
async fn test_rendered_messages_use_guest_and_event_data() {
    let f = fixture();
    let s = f.engine.create(sms_draft(&f, "Reminder"), at(2024, 3, 1, 0)).await.unwrap();
    f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();
    f.engine.tick(at(2024, 3, 10, 9)).await.unwrap();

    let sent = f.sender.sent_to("+15550001");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message.body, "Hi Ada, Spring Gala is coming up");
}

#[tokio::test]
async fn test_activation_skips_missed_occurrences() {
    let f = fixture();
    let mut draft = sms_draft(&f, "Daily digest");
    draft.schedule_type = ScheduleType::Recurring;
    draft.recurrence = Some(Recurrence {
        max_occurrences: None,
        ..daily(1)
    });
    let s = f.engine.create(draft, at(2024, 3, 1, 0)).await.unwrap();

    let active = f.engine.activate(s.id, at(2024, 3, 12, 10)).await.unwrap();
    assert_eq!(active.next_fire_at, Some(at(2024, 3, 13, 9)));
    assert!(f.engine.tick(at(2024, 3, 12, 11)).await.unwrap().dispatched.is_empty());
    assert_eq!(f.sender.attempts(), 0);
}

#[tokio::test]
async fn test_offset_trigger_tracks_event_date() {
    let f = fixture();
    let mut draft = sms_draft(&f, "Day before");
    draft.schedule_type = ScheduleType::EventTriggered;
    draft.trigger = Trigger::Offset {
        reference: ReferencePoint::EventStart,
        days: 1,
        hours: 0,
        direction: OffsetDirection::Before,
    };
    let s = f.engine.create(draft, at(2024, 3, 1, 0)).await.unwrap();
    let active = f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();
    assert_eq!(active.next_fire_at, Some(at(2024, 3, 19, 18)));

    // The event moves two days earlier; the due time follows it.
    f.directory
        .upsert_event(EventDates {
            event_id: f.event_id,
            name: "Spring Gala".into(),
            start: Some(at(2024, 3, 18, 18)),
            end: None,
            rsvp_deadline: None,
            venue_name: None,
            venue_address: None,
        })
        .unwrap();
    let due = f.engine.list_due(at(2024, 3, 17, 18)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].next_fire_at, Some(at(2024, 3, 17, 18)));

    let report = f.engine.tick(at(2024, 3, 17, 18)).await.unwrap();
    assert_eq!(report.dispatched, vec![s.id]);
    assert_eq!(f.engine.get(&s.id).unwrap().status, ScheduleStatus::Completed);
}

#[tokio::test]
async fn test_offset_without_reference_date_is_never_due() {
    let f = fixture();
    let mut draft = sms_draft(&f, "Checkout thanks");
    draft.schedule_type = ScheduleType::EventTriggered;
    draft.trigger = Trigger::Offset {
        reference: ReferencePoint::CheckoutDate,
        days: 0,
        hours: 2,
        direction: OffsetDirection::After,
    };
    let s = f.engine.create(draft, at(2024, 3, 1, 0)).await.unwrap();
    let active = f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();
    assert_eq!(active.next_fire_at, None);
    assert!(f.engine.list_due(at(2025, 1, 1, 0)).await.unwrap().is_empty());
    assert_eq!(f.engine.get(&s.id).unwrap().status, ScheduleStatus::Active);
}

#[tokio::test]
async fn test_condition_trigger_waits_for_signal() {
    let f = fixture();
    let mut draft = sms_draft(&f, "Welcome on arrival");
    draft.schedule_type = ScheduleType::EventTriggered;
    draft.trigger = Trigger::Condition {
        condition: "doors_open".into(),
    };
    let s = f.engine.create(draft, at(2024, 3, 1, 0)).await.unwrap();
    f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();
    assert!(f.engine.list_due(at(2024, 3, 20, 18)).await.unwrap().is_empty());

    let signalled = f
        .engine
        .notify_condition(Some(f.event_id), "doors_open", at(2024, 3, 20, 18))
        .await
        .unwrap();
    assert_eq!(signalled, vec![s.id]);
    let report = f.engine.tick(at(2024, 3, 20, 18)).await.unwrap();
    assert_eq!(report.dispatched, vec![s.id]);

    // A second signal does not re-anchor a finished schedule.
    let again = f
        .engine
        .notify_condition(None, "doors_open", at(2024, 3, 20, 19))
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_preview_is_read_only() {
    let f = fixture();
    let mut draft = sms_draft(&f, "Preview me");
    draft.cost_limit = Some(0.02);
    let s = f.engine.create(draft, at(2024, 3, 1, 0)).await.unwrap();

    let first = f.engine.preview(s.id, at(2024, 3, 1, 0)).await.unwrap();
    let second = f.engine.preview(s.id, at(2024, 3, 1, 0)).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.estimated_recipients, 3);
    assert_eq!(first.excluded_recipients, 1);
    assert_eq!(first.next_fire_at, Some(at(2024, 3, 10, 9)));
    assert!(first.exceeds_cost_limit);

    assert_eq!(f.sender.attempts(), 0);
    assert!(f.engine.campaigns().list().is_empty());
    assert!(!f.templates.get(&f.sms.id).unwrap().locked);
    let unchanged = f.engine.get(&s.id).unwrap();
    assert_eq!(unchanged.status, s.status);
    assert_eq!(unchanged.version, s.version);
    assert_eq!(unchanged.updated_at, s.updated_at);
}

#[tokio::test]
async fn test_cost_limit_blocks_dispatch() {
    let f = fixture();
    let mut draft = sms_draft(&f, "Too pricey");
    draft.cost_limit = Some(0.02);
    let s = f.engine.create(draft, at(2024, 3, 1, 0)).await.unwrap();
    f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();

    let report = f.engine.tick(at(2024, 3, 10, 9)).await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, s.id);
    assert!(report.failed[0].1.contains("exceeds the limit"));

    let failed = f.engine.get(&s.id).unwrap();
    assert_eq!(failed.status, ScheduleStatus::Failed);
    assert_eq!(failed.retry_occurrence, Some(at(2024, 3, 10, 9)));
    assert_eq!(f.sender.attempts(), 0);
    assert!(f.engine.campaigns().list().is_empty());
}

#[tokio::test]
async fn test_paused_schedule_does_not_fire_until_resumed() {
    let f = fixture();
    let s = f.engine.create(sms_draft(&f, "Paused"), at(2024, 3, 1, 0)).await.unwrap();
    f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();
    f.engine.pause(s.id, at(2024, 3, 5, 0)).unwrap();

    assert!(f.engine.tick(at(2024, 3, 10, 9)).await.unwrap().dispatched.is_empty());
    let direct = f.engine.dispatch(s.id, at(2024, 3, 10, 9)).await.unwrap();
    assert!(matches!(direct, DispatchOutcome::Skipped(SkipReason::NotActive)));
    assert_eq!(f.sender.attempts(), 0);

    // An overdue one-time send still goes out once resumed.
    f.engine.activate(s.id, at(2024, 3, 11, 0)).await.unwrap();
    let report = f.engine.tick(at(2024, 3, 11, 0)).await.unwrap();
    assert_eq!(report.dispatched, vec![s.id]);
}

#[tokio::test]
async fn test_template_in_use_cannot_be_deleted() {
    let f = fixture();
    let s = f.engine.create(sms_draft(&f, "Uses template"), at(2024, 3, 1, 0)).await.unwrap();
    f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();

    let err = f.engine.delete_template(f.sms.id).unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert!(f.templates.get(&f.sms.id).is_some());

    f.engine.cancel(s.id, at(2024, 3, 2, 0)).unwrap();
    f.engine.delete_template(f.sms.id).unwrap();
    assert!(f.templates.get(&f.sms.id).is_none());
    assert_eq!(f.sink.count_type(EventType::TemplateDeleted), 1);
}

#[tokio::test]
async fn test_failed_schedule_keeps_its_template() {
    let f = fixture();
    f.sender.set_outage(true);
    let s = f.engine.create(sms_draft(&f, "Retry later"), at(2024, 3, 1, 0)).await.unwrap();
    f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();
    let err = f.engine.dispatch(s.id, at(2024, 3, 10, 9)).await.unwrap_err();
    assert_eq!(err.code(), "PROVIDER_UNAVAILABLE");
    assert_eq!(f.engine.get(&s.id).unwrap().status, ScheduleStatus::Failed);

    let err = f.engine.delete_template(f.sms.id).unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert!(f.templates.get(&f.sms.id).is_some());

    f.sender.set_outage(false);
    f.engine.retry(s.id, at(2024, 3, 10, 12)).await.unwrap();
    f.engine.activate(s.id, at(2024, 3, 10, 12)).await.unwrap();
    let report = f.engine.tick(at(2024, 3, 10, 12)).await.unwrap();
    assert_eq!(report.dispatched, vec![s.id]);
    assert!(report.failed.is_empty());
    assert_eq!(f.engine.get(&s.id).unwrap().status, ScheduleStatus::Completed);
}

#[tokio::test]
async fn test_schedule_with_missing_template_cannot_be_revived() {
    let f = fixture();
    f.sender.set_outage(true);
    let s = f.engine.create(sms_draft(&f, "Orphan"), at(2024, 3, 1, 0)).await.unwrap();
    f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();
    f.engine.dispatch(s.id, at(2024, 3, 10, 9)).await.unwrap_err();

    // Removed behind the engine's back.
    f.templates.remove(&f.sms.id).unwrap();
    let err = f.engine.retry(s.id, at(2024, 3, 10, 12)).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert_eq!(f.engine.get(&s.id).unwrap().status, ScheduleStatus::Failed);
}

#[tokio::test]
async fn test_offset_days_keep_local_time_across_dst() {
    let f = fixture();
    let mut draft = sms_draft(&f, "Save the date");
    draft.schedule_type = ScheduleType::EventTriggered;
    draft.timezone = "America/New_York".into();
    draft.trigger = Trigger::Offset {
        reference: ReferencePoint::EventStart,
        days: 12,
        hours: 0,
        direction: OffsetDirection::Before,
    };
    let s = f.engine.create(draft, at(2024, 3, 1, 0)).await.unwrap();
    let active = f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();
    // 14:00 EDT on the 20th; twelve days earlier is 14:00 EST, 19:00 UTC.
    assert_eq!(active.next_fire_at, Some(at(2024, 3, 8, 19)));
}

#[tokio::test]
async fn test_cron_schedule_resumes_after_long_downtime() {
    let f = fixture();
    let mut draft = sms_draft(&f, "Every minute");
    draft.schedule_type = ScheduleType::Recurring;
    draft.trigger = Trigger::Datetime {
        at: local(2023, 1, 1, 0),
    };
    draft.recurrence = Some(Recurrence {
        pattern: RecurrencePattern::Custom,
        interval: 1,
        end_date: None,
        max_occurrences: None,
        expression: Some("* * * * *".into()),
    });
    let s = f.engine.create(draft, at(2023, 1, 1, 0)).await.unwrap();

    // Over a year of missed minutes.
    let now = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 30).unwrap();
    let active = f.engine.activate(s.id, now).await.unwrap();
    let first = Utc.with_ymd_and_hms(2024, 3, 10, 9, 1, 0).unwrap();
    assert_eq!(active.next_fire_at, Some(first));

    let report = f.engine.tick(first).await.unwrap();
    assert_eq!(report.dispatched, vec![s.id]);
    let after = f.engine.get(&s.id).unwrap();
    assert_eq!(after.status, ScheduleStatus::Active);
    assert_eq!(
        after.next_fire_at,
        Some(Utc.with_ymd_and_hms(2024, 3, 10, 9, 2, 0).unwrap())
    );

    // Down again for an hour: the next run jumps past the gap.
    let later = Utc.with_ymd_and_hms(2024, 3, 10, 10, 2, 30).unwrap();
    f.engine.pause(s.id, later).unwrap();
    let resumed = f.engine.activate(s.id, later).await.unwrap();
    assert_eq!(
        resumed.next_fire_at,
        Some(Utc.with_ymd_and_hms(2024, 3, 10, 10, 3, 0).unwrap())
    );
    assert_eq!(f.engine.campaigns().list_for_schedule(&s.id).len(), 1);
}

#[tokio::test]
async fn test_concurrent_dispatch_claims_once() {
    let f = fixture();
    f.sender.set_latency(Duration::from_millis(20));
    let s = f.engine.create(sms_draft(&f, "Race"), at(2024, 3, 1, 0)).await.unwrap();
    f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();

    let now = at(2024, 3, 10, 9);
    let (a, b) = tokio::join!(f.engine.dispatch(s.id, now), f.engine.dispatch(s.id, now));
    let outcomes = [a.unwrap(), b.unwrap()];
    let fired = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Fired(_)))
        .count();
    let raced = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Skipped(SkipReason::AlreadySending)))
        .count();
    assert_eq!((fired, raced), (1, 1));
    assert_eq!(f.sender.attempts(), 3);
    assert_eq!(f.engine.campaigns().list().len(), 1);
}

#[tokio::test]
async fn test_tick_orders_and_isolates_schedules() {
    let f = fixture();
    let mut urgent = sms_draft(&f, "Urgent");
    urgent.priority = Priority::Urgent;
    let mut broken = sms_draft(&f, "Broken");
    broken.cost_limit = Some(0.0);
    let normal = f.engine.create(sms_draft(&f, "Normal"), at(2024, 3, 1, 0)).await.unwrap();
    let urgent = f.engine.create(urgent, at(2024, 3, 1, 0)).await.unwrap();
    let broken = f.engine.create(broken, at(2024, 3, 1, 0)).await.unwrap();
    for id in [normal.id, urgent.id, broken.id] {
        f.engine.activate(id, at(2024, 3, 1, 0)).await.unwrap();
    }

    let due = f.engine.list_due(at(2024, 3, 10, 9)).await.unwrap();
    assert_eq!(due[0].id, urgent.id);

    let report = f.engine.tick(at(2024, 3, 10, 9)).await.unwrap();
    assert_eq!(report.dispatched.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, broken.id);
    assert_eq!(f.engine.get(&normal.id).unwrap().status, ScheduleStatus::Completed);
    assert_eq!(f.engine.get(&urgent.id).unwrap().status, ScheduleStatus::Completed);
}

#[tokio::test]
async fn test_outage_fails_then_retry_sends_only_missing() {
    let f = fixture();
    f.sender.outage_after(2);
    let s = f.engine.create(sms_draft(&f, "Outage"), at(2024, 3, 1, 0)).await.unwrap();
    f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();

    let err = f.engine.dispatch(s.id, at(2024, 3, 10, 9)).await.unwrap_err();
    assert_eq!(err.code(), "PROVIDER_UNAVAILABLE");
    let failed = f.engine.get(&s.id).unwrap();
    assert_eq!(failed.status, ScheduleStatus::Failed);
    assert_eq!(failed.retry_occurrence, Some(at(2024, 3, 10, 9)));
    let aborted = f.engine.campaigns().get(&failed.last_campaign_id.unwrap()).unwrap();
    assert_eq!(aborted.status, CampaignStatus::Aborted);
    assert_eq!((aborted.delivered, aborted.skipped), (2, 1));
    assert_eq!(f.sink.count_type(EventType::ScheduleFailed), 1);

    f.sender.outage_after(usize::MAX);
    f.engine.retry(s.id, at(2024, 3, 10, 12)).await.unwrap();
    f.engine.activate(s.id, at(2024, 3, 10, 12)).await.unwrap();
    let report = f.engine.tick(at(2024, 3, 10, 12)).await.unwrap();
    assert_eq!(report.dispatched, vec![s.id]);

    let done = f.engine.get(&s.id).unwrap();
    assert_eq!(done.status, ScheduleStatus::Completed);
    let resend = f.engine.campaigns().get(&done.last_campaign_id.unwrap()).unwrap();
    assert_eq!(resend.recipient_count, 1);
    assert_eq!(resend.idempotency_key, aborted.idempotency_key);
    assert_eq!(f.sender.sent_count(), 3);
    for phone in ["+15550001", "+15550002", "+15550003"] {
        assert_eq!(f.sender.sent_to(phone).len(), 1);
    }
}

#[tokio::test]
async fn test_failed_recipients_do_not_fail_the_batch() {
    let f = fixture();
    f.sender.fail_contact("+15550002", "invalid number");
    f.sender.reject_contact("+15550003", "blocked");
    let s = f.engine.create(sms_draft(&f, "Partial"), at(2024, 3, 1, 0)).await.unwrap();
    f.engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();

    let DispatchOutcome::Fired(campaign) =
        f.engine.dispatch(s.id, at(2024, 3, 10, 9)).await.unwrap()
    else {
        panic!("expected a campaign");
    };
    assert_eq!(campaign.status, CampaignStatus::PartiallySent);
    assert_eq!((campaign.delivered, campaign.failed), (1, 2));
    assert!((campaign.total_cost - 0.01).abs() < 1e-9);
    assert_eq!(f.engine.get(&s.id).unwrap().status, ScheduleStatus::Completed);
    assert_eq!(f.sink.count_type(EventType::RecipientFailed), 2);
}

#[tokio::test]
async fn test_recover_stuck_interrupts_in_flight_campaign() {
    let f = fixture();
    let (engine, gate) = gated(&f);
    let mut draft = sms_draft(&f, "Stuck");
    draft.recipient_type = RecipientType::Custom;
    draft.recipient_list = vec![f.guest_id("Ada")];
    let s = engine.create(draft, at(2024, 3, 1, 0)).await.unwrap();
    engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();

    let due = at(2024, 3, 10, 9);
    let worker = engine.clone();
    let handle = tokio::spawn(async move { worker.dispatch(s.id, due).await });
    gate.started.notified().await;
    assert_eq!(engine.get(&s.id).unwrap().status, ScheduleStatus::Sending);

    let within = due + chrono::Duration::minutes(5);
    assert!(engine.recover_stuck(within).await.unwrap().is_empty());
    let late = due + chrono::Duration::minutes(20);
    assert_eq!(engine.recover_stuck(late).await.unwrap(), vec![s.id]);

    let recovered = engine.get(&s.id).unwrap();
    assert_eq!(recovered.status, ScheduleStatus::Failed);
    assert_eq!(recovered.retry_occurrence, Some(due));
    assert!(recovered.sending_since.is_none());
    let campaign_id = recovered.last_campaign_id.unwrap();
    assert_eq!(
        engine.campaigns().get(&campaign_id).unwrap().status,
        CampaignStatus::Interrupted
    );

    // The late batch cannot reopen the schedule or the campaign.
    gate.release.notify_one();
    let outcome = handle.await.unwrap().unwrap();
    assert!(matches!(outcome, DispatchOutcome::Fired(c) if c.status == CampaignStatus::Interrupted));
    assert_eq!(engine.get(&s.id).unwrap().status, ScheduleStatus::Failed);
}

#[tokio::test]
async fn test_changes_during_sending_are_deferred() {
    let f = fixture();
    let (engine, gate) = gated(&f);
    let mut draft = sms_draft(&f, "Busy");
    draft.schedule_type = ScheduleType::Recurring;
    draft.recurrence = Some(daily(5));
    draft.recipient_type = RecipientType::Custom;
    draft.recipient_list = vec![f.guest_id("Ben")];
    let s = engine.create(draft.clone(), at(2024, 3, 1, 0)).await.unwrap();
    engine.activate(s.id, at(2024, 3, 1, 0)).await.unwrap();

    let due = at(2024, 3, 10, 9);
    let worker = engine.clone();
    let handle = tokio::spawn(async move { worker.dispatch(s.id, due).await });
    gate.started.notified().await;

    let mut edit = draft.clone();
    edit.name = "Busy (renamed)".into();
    let queued = engine.update(s.id, edit.clone(), s.version, due).await.unwrap();
    assert_eq!(queued.status, ScheduleStatus::Sending);
    assert_eq!(queued.name, "Busy");
    assert!(queued.pending_edit.is_some());

    let stale = engine.update(s.id, edit, s.version, due).await.unwrap_err();
    assert_eq!(stale.code(), "VERSION_CONFLICT");
    assert_eq!(engine.delete(s.id).unwrap_err().code(), "INVALID_STATE");
    assert!(engine.pause(s.id, due).unwrap().pause_requested);

    gate.release.notify_one();
    assert!(matches!(handle.await.unwrap().unwrap(), DispatchOutcome::Fired(_)));

    let settled = engine.get(&s.id).unwrap();
    assert_eq!(settled.status, ScheduleStatus::Paused);
    assert_eq!(settled.name, "Busy (renamed)");
    assert_eq!(settled.occurrence_count, 1);
    assert!(settled.pending_edit.is_none());
    assert!(!settled.pause_requested);
}

#[tokio::test]
async fn test_csv_round_trip_and_atomic_import() {
    let f = fixture();
    let mut recurring = sms_draft(&f, "Weekly nudge");
    recurring.schedule_type = ScheduleType::Recurring;
    recurring.recurrence = Some(Recurrence {
        pattern: RecurrencePattern::Weekly,
        interval: 2,
        end_date: None,
        max_occurrences: Some(4),
        expression: None,
    });
    let mut email = sms_draft(&f, "Invite");
    email.notification_type = Channel::Email;
    email.template_id = Some(f.email.id);
    email.priority = Priority::High;
    f.engine.create(recurring, at(2024, 3, 1, 0)).await.unwrap();
    f.engine.create(email, at(2024, 3, 1, 1)).await.unwrap();

    let csv = f.engine.export_csv().await.unwrap();
    assert!(csv.starts_with("Schedule Name,Type,Notification Type"));

    let target = ScheduleEngine::new(f.templates.clone(), f.directory.clone(), f.sender.clone());
    let imported = target.import_csv(&csv, at(2024, 3, 2, 0)).await.unwrap();
    assert_eq!(imported.len(), 2);
    let originals = f.engine.list();
    for (original, copy) in originals.iter().zip(&imported) {
        assert_eq!(copy.name, original.name);
        assert_eq!(copy.schedule_type, original.schedule_type);
        assert_eq!(copy.trigger, original.trigger);
        assert_eq!(copy.recurrence, original.recurrence);
        assert_eq!(copy.template_id, original.template_id);
        assert_eq!(copy.priority, original.priority);
        assert_eq!(copy.status, ScheduleStatus::Draft);
    }

    // One row points at a template that does not exist: nothing is stored.
    let bad = csv.replace(&f.email.id.to_string(), &Uuid::new_v4().to_string());
    let empty = ScheduleEngine::new(f.templates.clone(), f.directory.clone(), f.sender.clone());
    assert!(empty.import_csv(&bad, at(2024, 3, 2, 0)).await.is_err());
    assert!(empty.list().is_empty());
}

#[tokio::test]
async fn test_adhoc_campaign_and_export() {
    let f = fixture();
    let campaign = f
        .engine
        .send_adhoc(
            AdhocCampaign {
                name: "Shuttle update".into(),
                channel: Channel::Sms,
                template_id: None,
                subject: None,
                body: Some("{{guest_first_name}}, shuttles leave at 6".into()),
                recipient_type: RecipientType::Event,
                event_id: Some(f.event_id),
                recipient_list: vec![],
                timezone: "UTC".into(),
                cost_limit: Some(1.0),
                extra_variables: HashMap::new(),
            },
            at(2024, 3, 20, 12),
        )
        .await
        .unwrap();
    assert_eq!(campaign.status, CampaignStatus::Sent);
    assert_eq!(campaign.delivered, 3);
    assert!(campaign.schedule_id.is_none());
    assert!(campaign.idempotency_key.starts_with("adhoc:"));
    assert_eq!(f.sender.sent_to("+15550003")[0].message.body, "Cy, shuttles leave at 6");

    let over = f
        .engine
        .send_adhoc(
            AdhocCampaign {
                name: "Too pricey".into(),
                channel: Channel::Sms,
                template_id: Some(f.sms.id),
                subject: None,
                body: None,
                recipient_type: RecipientType::All,
                event_id: None,
                recipient_list: vec![],
                timezone: "UTC".into(),
                cost_limit: Some(0.01),
                extra_variables: HashMap::new(),
            },
            at(2024, 3, 20, 12),
        )
        .await
        .unwrap_err();
    assert_eq!(over.code(), "VALIDATION_ERROR");
    assert_eq!(f.sender.sent_count(), 3);

    let csv = f.engine.export_campaigns_csv().unwrap();
    let mut lines = csv.lines();
    assert_eq!(
        lines.next(),
        Some("Campaign Name,Status,Recipients,Sent Date,Delivery Rate,Cost")
    );
    assert_eq!(lines.next(), Some("Shuttle update,Sent,3,2024-03-20 12:00,100.0%,0.03"));
}
