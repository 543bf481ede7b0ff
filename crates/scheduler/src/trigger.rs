//! Occurrence computation for schedules.
//!
//! Occurrence `k` of a repeating schedule is its base time advanced by
//! `k * interval` pattern units, computed on the local wall clock of the
//! schedule's timezone and converted to UTC afterwards. Anchoring every
//! occurrence to the base keeps 09:00 at 09:00 across DST changes and keeps
//! month-end clamping from drifting (Jan 31 -> Feb 29 -> Mar 31).
//!
//! Cron recurrences have no closed form for occurrence `k`, so the schedule
//! carries a [`CronCursor`] and each step walks one match forward from it.
//! Catching up after downtime jumps straight to the first match after
//! `now` instead of walking every missed slot.

use chrono::{DateTime, Duration, LocalResult, Months, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use notify_core::error::{NotifyError, NotifyResult};
use notify_core::types::{GuestSnapshot, ReferencePoint, ScheduleStatus};
use serde::{Deserialize, Serialize};

use crate::cron::CronExpr;
use crate::types::{CronCursor, OffsetDirection, Recurrence, RecurrencePattern, Schedule, Trigger};

/// Upper bound on slots skipped while catching up with `now`.
const MAX_CATCH_UP_SLOTS: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerResolution {
    /// Next occurrence instant.
    At(DateTime<Utc>),
    /// The offset reference date is unknown for now.
    NotComputable(ReferencePoint),
    /// The condition has not been signalled yet.
    AwaitingCondition,
    /// No further occurrences.
    Exhausted,
}

impl TriggerResolution {
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            TriggerResolution::At(at) => Some(*at),
            _ => None,
        }
    }
}

/// Next occurrence together with its slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub slot: u32,
    pub resolution: TriggerResolution,
    /// Cron position of `slot`; `None` for other patterns.
    pub cursor: Option<CronCursor>,
}

impl Resolved {
    fn at(slot: u32, resolution: TriggerResolution) -> Self {
        Self {
            slot,
            resolution,
            cursor: None,
        }
    }

    /// Move the schedule's cursor to this occurrence.
    pub fn apply_to(&self, schedule: &mut Schedule) {
        schedule.slot = self.slot;
        schedule.cron_cursor = self.cursor;
    }
}

pub fn parse_timezone(name: &str) -> NotifyResult<Tz> {
    name.trim().parse::<Tz>().map_err(|_| {
        NotifyError::validation("schedule", None, format!("unknown timezone '{name}'"))
    })
}

/// Resolve a schedule's timezone, falling back to UTC for names that no
/// longer parse (validated at create time).
pub fn schedule_tz(schedule: &Schedule) -> Tz {
    parse_timezone(&schedule.timezone).unwrap_or(Tz::UTC)
}

/// Convert local wall-clock time to an instant. Times inside a DST gap are
/// pushed forward by the gap length; ambiguous times take the earlier
/// instant.
pub fn localize(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(at) => Some(at.with_timezone(&Utc)),
        LocalResult::Ambiguous(earlier, _) => Some(earlier.with_timezone(&Utc)),
        LocalResult::None => {
            let before_gap = tz.from_local_datetime(&(local - Duration::hours(3))).earliest()?;
            let offset = before_gap.offset().fix();
            offset
                .from_local_datetime(&local)
                .single()
                .map(|at| at.with_timezone(&Utc))
        }
    }
}

/// Base instant of a schedule: occurrence 0.
pub fn base_instant(
    schedule: &Schedule,
    snapshot: &GuestSnapshot,
    tz: Tz,
) -> Result<DateTime<Utc>, TriggerResolution> {
    match &schedule.trigger {
        Trigger::Datetime { at } => localize(tz, *at).ok_or(TriggerResolution::Exhausted),
        Trigger::Offset {
            reference,
            days,
            hours,
            direction,
        } => {
            let reference_at = snapshot
                .reference_date(schedule.event_id.as_ref(), *reference)
                .ok_or(TriggerResolution::NotComputable(*reference))?;
            // Days move the local calendar date, hours are elapsed time.
            let local = reference_at.with_timezone(&tz).naive_local();
            let days = Duration::days(i64::from(*days));
            let hours = Duration::hours(i64::from(*hours));
            let shifted = match direction {
                OffsetDirection::Before => local.checked_sub_signed(days),
                OffsetDirection::After => local.checked_add_signed(days),
            }
            .and_then(|local| localize(tz, local))
            .ok_or(TriggerResolution::Exhausted)?;
            let at = match direction {
                OffsetDirection::Before => shifted.checked_sub_signed(hours),
                OffsetDirection::After => shifted.checked_add_signed(hours),
            };
            at.ok_or(TriggerResolution::Exhausted)
        }
        Trigger::Condition { .. } => schedule.anchor_at.ok_or(TriggerResolution::AwaitingCondition),
    }
}

fn advance_local(base: NaiveDateTime, pattern: RecurrencePattern, units: u32) -> Option<NaiveDateTime> {
    match pattern {
        RecurrencePattern::Daily => base.checked_add_signed(Duration::days(i64::from(units))),
        RecurrencePattern::Weekly => base.checked_add_signed(Duration::weeks(i64::from(units))),
        RecurrencePattern::Monthly => base.checked_add_months(Months::new(units)),
        RecurrencePattern::Yearly => base.checked_add_months(Months::new(units.checked_mul(12)?)),
        RecurrencePattern::Custom => None,
    }
}

fn parse_cron(recurrence: &Recurrence) -> Option<CronExpr> {
    CronExpr::parse(recurrence.expression.as_deref()?).ok()
}

/// Wall-clock time of cron occurrence `slot`. Steps forward from `cursor`
/// when it belongs to the same series and is not past `slot`, otherwise
/// from the base.
fn cron_local(
    cron: &CronExpr,
    cursor: Option<&CronCursor>,
    base: DateTime<Utc>,
    tz: Tz,
    slot: u32,
) -> Option<NaiveDateTime> {
    let (mut current, mut at_slot) = match cursor {
        Some(c) if c.base == base && c.slot <= slot => (c.local, c.slot),
        _ => (cron.next_at_or_after(base.with_timezone(&tz).naive_local())?, 0),
    };
    while at_slot < slot {
        current = cron.next_after(current)?;
        at_slot += 1;
    }
    Some(current)
}

/// Occurrence `slot` of a repeating schedule whose occurrence 0 is `base`.
/// `cursor` only speeds up cron recurrences.
pub fn occurrence(
    base: DateTime<Utc>,
    recurrence: &Recurrence,
    tz: Tz,
    slot: u32,
    cursor: Option<&CronCursor>,
) -> Option<DateTime<Utc>> {
    if recurrence.pattern == RecurrencePattern::Custom {
        let cron = parse_cron(recurrence)?;
        return localize(tz, cron_local(&cron, cursor, base, tz, slot)?);
    }
    let local_base = base.with_timezone(&tz).naive_local();
    let units = slot.checked_mul(recurrence.interval.max(1))?;
    localize(tz, advance_local(local_base, recurrence.pattern, units)?)
}

fn beyond_end(recurrence: &Recurrence, at: DateTime<Utc>, tz: Tz) -> bool {
    recurrence
        .end_date
        .is_some_and(|end| at.with_timezone(&tz).date_naive() > end)
}

fn reached_max(schedule: &Schedule, recurrence: &Recurrence) -> bool {
    recurrence
        .max_occurrences
        .is_some_and(|max| schedule.occurrence_count >= max)
}

/// Resolve the occurrence at `slot` without skipping anything.
///
/// Used by due-checks: an occurrence that is already due must still fire
/// even though it lies in the past.
pub fn resolve_slot(schedule: &Schedule, snapshot: &GuestSnapshot, slot: u32) -> TriggerResolution {
    if let Some(retry_at) = schedule.retry_occurrence {
        return TriggerResolution::At(retry_at);
    }
    let tz = schedule_tz(schedule);
    let base = match base_instant(schedule, snapshot, tz) {
        Ok(base) => base,
        Err(resolution) => return resolution,
    };

    match (schedule.schedule_type.repeats(), &schedule.recurrence) {
        (true, Some(recurrence)) => {
            if reached_max(schedule, recurrence) {
                return TriggerResolution::Exhausted;
            }
            match occurrence(base, recurrence, tz, slot, schedule.cron_cursor.as_ref()) {
                Some(at) if !beyond_end(recurrence, at, tz) => TriggerResolution::At(at),
                _ => TriggerResolution::Exhausted,
            }
        }
        _ => {
            if schedule.occurrence_count > 0 || slot > 0 {
                TriggerResolution::Exhausted
            } else {
                TriggerResolution::At(base)
            }
        }
    }
}

/// Earliest occurrence at slot `from_slot` or later that is not before
/// `now`. Non-repeating schedules only ever have slot 0, which is returned
/// even when already past so an overdue one-time send still goes out.
pub fn next_occurrence(
    schedule: &Schedule,
    snapshot: &GuestSnapshot,
    from_slot: u32,
    now: DateTime<Utc>,
) -> Resolved {
    let repeats = schedule.schedule_type.repeats() && schedule.retry_occurrence.is_none();
    if let Some(recurrence) = schedule
        .recurrence
        .as_ref()
        .filter(|r| repeats && r.pattern == RecurrencePattern::Custom)
    {
        return next_cron_occurrence(schedule, snapshot, recurrence, from_slot, now);
    }

    let mut slot = from_slot;
    loop {
        let resolution = resolve_slot(schedule, snapshot, slot);
        match resolution {
            TriggerResolution::At(at) if repeats && at < now => {
                if slot - from_slot >= MAX_CATCH_UP_SLOTS {
                    return Resolved::at(slot, TriggerResolution::Exhausted);
                }
                slot += 1;
            }
            resolution => return Resolved::at(slot, resolution),
        }
    }
}

/// Cron variant of [`next_occurrence`]. Missed matches are skipped in one
/// jump, so the slot advances by one however many were missed.
fn next_cron_occurrence(
    schedule: &Schedule,
    snapshot: &GuestSnapshot,
    recurrence: &Recurrence,
    from_slot: u32,
    now: DateTime<Utc>,
) -> Resolved {
    let exhausted = Resolved::at(from_slot, TriggerResolution::Exhausted);
    let tz = schedule_tz(schedule);
    let base = match base_instant(schedule, snapshot, tz) {
        Ok(base) => base,
        Err(resolution) => return Resolved::at(from_slot, resolution),
    };
    if reached_max(schedule, recurrence) {
        return exhausted;
    }
    let Some(cron) = parse_cron(recurrence) else {
        return exhausted;
    };
    let Some(mut local) = cron_local(&cron, schedule.cron_cursor.as_ref(), base, tz, from_slot) else {
        return exhausted;
    };

    let mut slot = from_slot;
    if localize(tz, local).is_some_and(|at| at < now) {
        match cron.next_at_or_after(now.with_timezone(&tz).naive_local()) {
            Some(next) => {
                local = next;
                slot = slot.saturating_add(1);
            }
            None => return exhausted,
        }
    }
    match localize(tz, local) {
        Some(at) if !beyond_end(recurrence, at, tz) => Resolved {
            slot,
            resolution: TriggerResolution::At(at),
            cursor: Some(CronCursor { base, slot, local }),
        },
        _ => exhausted,
    }
}

/// Occurrence reported as the schedule's next run. Active and Sending
/// schedules report their cursor as is, so an overdue occurrence stays
/// visible as due; other schedules project the cursor forward past `now`.
pub fn upcoming(schedule: &Schedule, snapshot: &GuestSnapshot, now: DateTime<Utc>) -> TriggerResolution {
    match schedule.status {
        ScheduleStatus::Active | ScheduleStatus::Sending => resolve_slot(schedule, snapshot, schedule.slot),
        _ => next_occurrence(schedule, snapshot, schedule.slot, now).resolution,
    }
}

/// Human-readable description of when a schedule fires.
pub fn describe(schedule: &Schedule) -> String {
    let when = match &schedule.trigger {
        Trigger::Datetime { at } => format!("at {} ({})", at.format("%Y-%m-%d %H:%M"), schedule.timezone),
        Trigger::Offset {
            reference,
            days,
            hours,
            direction,
        } => format!("{days}d {hours}h {} {reference}", direction.as_str()),
        Trigger::Condition { condition } => format!("when '{condition}' is signalled"),
    };
    match (&schedule.recurrence, schedule.schedule_type.repeats()) {
        (Some(r), true) if r.pattern == RecurrencePattern::Custom => format!(
            "{when}, then on cron '{}'",
            r.expression.as_deref().unwrap_or_default()
        ),
        (Some(r), true) => format!("{when}, repeating every {} {}", r.interval, r.pattern.as_str()),
        _ => when,
    }
}
