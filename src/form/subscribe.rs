use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::engine::{FieldName, FormEngine, FormResult, read_lock, write_lock};
use super::validation::ValidationError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubscriptionId(pub u64);

pub(super) type ListenerFn = Arc<dyn Fn(&FieldName) + Send + Sync>;

pub(super) struct ListenerEntry {
    pub(super) id: SubscriptionId,
    pub(super) listener: ListenerFn,
}

impl<E> FormEngine<E>
where
    E: ValidationError,
{
    /// Registers a change listener for one field. Listeners fire after value,
    /// error, touched, and reset mutations of that field; they must not
    /// re-enter the engine's mutating surface.
    pub fn subscribe(
        &self,
        field: impl Into<FieldName>,
        listener: impl Fn(&FieldName) + Send + Sync + 'static,
    ) -> FormResult<SubscriptionId> {
        let id = SubscriptionId(self.subscription_allocator.fetch_add(1, Ordering::SeqCst) + 1);
        write_lock(&self.listeners, "registering field listener")?
            .entry(field.into())
            .or_default()
            .push(ListenerEntry {
                id,
                listener: Arc::new(listener),
            });
        Ok(id)
    }

    pub fn unsubscribe(
        &self,
        field: impl Into<FieldName>,
        id: SubscriptionId,
    ) -> FormResult<bool> {
        let mut listeners = write_lock(&self.listeners, "removing field listener")?;
        let Some(entries) = listeners.get_mut(&field.into()) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        Ok(entries.len() != before)
    }

    /// Monotonic per-field version counter; bumped on every mutation of the
    /// field, so view code can re-render only what changed.
    pub fn field_version(&self, field: impl Into<FieldName>) -> FormResult<u64> {
        Ok(read_lock(&self.state, "reading field version")?
            .versions
            .get(&field.into())
            .copied()
            .unwrap_or(0))
    }

    pub(super) fn notify(&self, field: &FieldName) -> FormResult<()> {
        {
            let mut state = write_lock(&self.state, "bumping field version")?;
            *state.versions.entry(field.clone()).or_insert(0) += 1;
        }
        let listeners: Vec<ListenerFn> = read_lock(&self.listeners, "reading field listeners")?
            .get(field)
            .map(|entries| entries.iter().map(|entry| entry.listener.clone()).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(field);
        }
        Ok(())
    }
}
