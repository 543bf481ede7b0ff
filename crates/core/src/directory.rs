//! Guest and event data provider seam.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{NotifyError, NotifyResult};
use crate::types::{EventDates, Guest, GuestSnapshot};

/// Source of guest records and event reference dates.
#[async_trait]
pub trait GuestDirectory: Send + Sync {
    /// Consistent snapshot of all guests and events.
    async fn snapshot(&self) -> NotifyResult<GuestSnapshot>;

    async fn event_dates(&self, event_id: Uuid) -> NotifyResult<Option<EventDates>> {
        Ok(self.snapshot().await?.event(&event_id).cloned())
    }
}

/// Directory backed by an in-process snapshot that can be replaced or
/// amended at runtime.
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    inner: Arc<RwLock<GuestSnapshot>>,
}

impl InMemoryDirectory {
    pub fn new(snapshot: GuestSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    fn write<R>(&self, f: impl FnOnce(&mut GuestSnapshot) -> R) -> NotifyResult<R> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| NotifyError::Internal(anyhow::anyhow!("guest directory lock poisoned")))?;
        Ok(f(&mut guard))
    }

    pub fn replace(&self, snapshot: GuestSnapshot) -> NotifyResult<()> {
        self.write(|current| *current = snapshot)
    }

    pub fn upsert_guest(&self, guest: Guest) -> NotifyResult<()> {
        self.write(|snapshot| {
            match snapshot.guests.iter_mut().find(|g| g.id == guest.id) {
                Some(existing) => *existing = guest,
                None => snapshot.guests.push(guest),
            }
        })
    }

    pub fn upsert_event(&self, event: EventDates) -> NotifyResult<()> {
        self.write(|snapshot| {
            match snapshot
                .events
                .iter_mut()
                .find(|e| e.event_id == event.event_id)
            {
                Some(existing) => *existing = event,
                None => snapshot.events.push(event),
            }
        })
    }
}

#[async_trait]
impl GuestDirectory for InMemoryDirectory {
    async fn snapshot(&self) -> NotifyResult<GuestSnapshot> {
        let guard = self
            .inner
            .read()
            .map_err(|_| NotifyError::Internal(anyhow::anyhow!("guest directory lock poisoned")))?;
        Ok(guard.clone())
    }
}
