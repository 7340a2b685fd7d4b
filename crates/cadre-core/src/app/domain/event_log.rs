//! Append-only event log with consumer-owned cursors.
//!
//! Consumers never scan the whole log: they hold an [`EventCursor`], drain
//! whatever was appended since their last read, and park on an
//! [`EventSubscription`] until the next append wakes them.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::Stream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::app::domain::event::AgentEvent;

#[derive(Debug, thiserror::Error)]
#[error("Listener failed: {message}")]
pub struct ListenerError {
    pub message: String,
}

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Synchronous observer invoked after every append, in append order.
///
/// Listeners run on the appending task and must not append to the log they
/// observe.
pub type EventListener = Arc<dyn Fn(&AgentEvent) -> Result<(), ListenerError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Read position into one [`EventLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCursor {
    position: usize,
}

impl EventCursor {
    pub fn at(position: usize) -> Self {
        Self { position }
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

pub struct EventLog {
    events: RwLock<Vec<AgentEvent>>,
    appended: watch::Sender<usize>,
    listeners: RwLock<Vec<(ListenerId, EventListener)>>,
    notify_lock: Mutex<()>,
    next_listener_id: AtomicU64,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl EventLog {
    pub fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            events: RwLock::new(Vec::new()),
            appended,
            listeners: RwLock::new(Vec::new()),
            notify_lock: Mutex::new(()),
            next_listener_id: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `event` and returns its position.
    pub fn append(&self, event: AgentEvent) -> usize {
        let _ordered = self
            .notify_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let position = {
            let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
            events.push(event.clone());
            let len = events.len();
            self.appended.send_replace(len);
            len - 1
        };

        self.notify_listeners(&event);
        position
    }

    fn notify_listeners(&self, event: &AgentEvent) {
        let listeners: Vec<(ListenerId, EventListener)> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        listener_id = id.0,
                        event_type = event.kind(),
                        error = %e,
                        "Event listener failed"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        listener_id = id.0,
                        event_type = event.kind(),
                        "Event listener panicked"
                    );
                }
            }
        }
    }

    pub fn add_listener(&self, listener: EventListener) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// A cursor positioned at the current end; earlier events are invisible to it.
    pub fn create_cursor(&self) -> EventCursor {
        EventCursor::at(self.len())
    }

    /// Lazily yields every event between the cursor and the length observed now,
    /// advancing the cursor as items are consumed.
    pub fn drain<'a>(&'a self, cursor: &'a mut EventCursor) -> Drain<'a> {
        let end = self.len();
        cursor.position = cursor.position.min(end);
        Drain {
            log: self,
            cursor,
            end,
        }
    }

    pub fn get(&self, position: usize) -> Option<AgentEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(position)
            .cloned()
    }

    pub fn events_from(&self, position: usize) -> Vec<AgentEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.get(position..).map(<[_]>::to_vec).unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<AgentEvent> {
        self.events_from(0)
    }

    pub fn any(&self, mut predicate: impl FnMut(&AgentEvent) -> bool) -> bool {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|event| predicate(event))
    }

    pub fn find_last(&self, mut predicate: impl FnMut(&AgentEvent) -> bool) -> Option<AgentEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|event| predicate(event))
            .cloned()
    }

    /// Swaps the whole log. Only checkpoint restore does this; outstanding
    /// cursors are clamped on their next drain.
    pub(crate) fn replace(&self, replacement: Vec<AgentEvent>) {
        let _ordered = self
            .notify_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        *events = replacement;
        self.appended.send_replace(events.len());
    }

    /// Wakes on every append until `cancel` fires.
    pub fn subscribe(&self, cancel: CancellationToken) -> EventSubscription {
        EventSubscription {
            rx: self.appended.subscribe(),
            cancel,
        }
    }

    /// Drains from `cursor` until `matcher` returns a value, parking between
    /// appends. Returns `None` once `cancel` fires.
    pub async fn wait_for<T>(
        &self,
        cursor: &mut EventCursor,
        cancel: &CancellationToken,
        mut matcher: impl FnMut(&AgentEvent) -> Option<T>,
    ) -> Option<T> {
        let mut subscription = self.subscribe(cancel.clone());
        loop {
            for event in self.drain(cursor) {
                if let Some(found) = matcher(&event) {
                    return Some(found);
                }
            }
            subscription.next().await?;
        }
    }
}

pub struct Drain<'a> {
    log: &'a EventLog,
    cursor: &'a mut EventCursor,
    end: usize,
}

impl Iterator for Drain<'_> {
    type Item = AgentEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.position >= self.end {
            return None;
        }
        let event = self.log.get(self.cursor.position)?;
        self.cursor.position += 1;
        Some(event)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.end.saturating_sub(self.cursor.position)))
    }
}

pub struct EventSubscription {
    rx: watch::Receiver<usize>,
    cancel: CancellationToken,
}

impl EventSubscription {
    /// Resolves with the log length after the next append, or `None` once the
    /// subscription is cancelled.
    pub async fn next(&mut self) -> Option<usize> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            changed = self.rx.changed() => match changed {
                Ok(()) => Some(*self.rx.borrow_and_update()),
                Err(_) => None,
            },
        }
    }

    pub fn into_stream(mut self) -> impl Stream<Item = usize> {
        async_stream::stream! {
            while let Some(len) = self.next().await {
                yield len;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::domain::event::EventPayload;
    use futures::StreamExt;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn chat(content: &str) -> AgentEvent {
        AgentEvent::new(EventPayload::ChatOutput {
            content: content.to_string(),
        })
    }

    fn contents(events: impl IntoIterator<Item = AgentEvent>) -> Vec<String> {
        events
            .into_iter()
            .filter_map(|event| match event.payload {
                EventPayload::ChatOutput { content } => Some(content),
                _ => None,
            })
            .collect()
    }

    proptest! {
        #[test]
        fn cursor_drains_exactly_what_was_appended(
            before in proptest::collection::vec("[a-z]{1,8}", 0..5),
            after in proptest::collection::vec("[a-z]{1,8}", 0..20),
        ) {
            let log = EventLog::new();
            for item in &before {
                log.append(chat(item));
            }

            let mut cursor = log.create_cursor();
            for item in &after {
                log.append(chat(item));
            }

            let drained = contents(log.drain(&mut cursor));
            prop_assert_eq!(drained, after.clone());
            prop_assert_eq!(cursor.position(), before.len() + after.len());
            prop_assert_eq!(log.drain(&mut cursor).count(), 0);
        }
    }

    #[test]
    fn drain_is_bounded_by_length_at_start() {
        let log = EventLog::new();
        let mut cursor = log.create_cursor();
        log.append(chat("one"));

        let mut drain = log.drain(&mut cursor);
        let first = drain.next().map(|e| e.kind());
        log.append(chat("two"));
        assert_eq!(first, Some("output.chat"));
        assert!(drain.next().is_none());

        assert_eq!(contents(log.drain(&mut cursor)), vec!["two".to_string()]);
    }

    #[test]
    fn partially_consumed_drain_only_advances_consumed_items() {
        let log = EventLog::new();
        let mut cursor = log.create_cursor();
        for item in ["a", "b", "c"] {
            log.append(chat(item));
        }

        let first: Vec<_> = log.drain(&mut cursor).take(1).collect();
        assert_eq!(contents(first), vec!["a".to_string()]);
        assert_eq!(cursor.position(), 1);
        assert_eq!(
            contents(log.drain(&mut cursor)),
            vec!["b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let log = EventLog::new();
        let seen = Arc::new(AtomicUsize::new(0));

        log.add_listener(Arc::new(|_| Err(ListenerError::new("nope"))));
        log.add_listener(Arc::new(|_| panic!("listener blew up")));
        let counter = seen.clone();
        log.add_listener(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        log.append(chat("x"));
        log.append(chat("y"));

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let log = EventLog::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = log.add_listener(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        log.append(chat("x"));
        assert!(log.remove_listener(id));
        assert!(!log.remove_listener(id));
        log.append(chat("y"));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replace_clamps_outstanding_cursors() {
        let log = EventLog::new();
        for item in ["a", "b", "c"] {
            log.append(chat(item));
        }
        let mut cursor = log.create_cursor();
        log.replace(vec![chat("only")]);

        assert_eq!(log.drain(&mut cursor).count(), 0);
        assert_eq!(cursor.position(), 1);
    }

    #[tokio::test]
    async fn subscription_wakes_on_append_and_stops_on_cancel() {
        let log = Arc::new(EventLog::new());
        let cancel = CancellationToken::new();
        let mut subscription = log.subscribe(cancel.clone());

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append(chat("wake"));
        });

        assert_eq!(subscription.next().await, Some(1));

        cancel.cancel();
        assert_eq!(subscription.next().await, None);
    }

    #[tokio::test]
    async fn subscription_stream_ends_when_cancelled() {
        let log = Arc::new(EventLog::new());
        let cancel = CancellationToken::new();
        let stream = log.subscribe(cancel.clone()).into_stream();
        futures::pin_mut!(stream);

        log.append(chat("a"));
        assert_eq!(stream.next().await, Some(1));

        cancel.cancel();
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn wait_for_sees_events_appended_later() {
        let log = Arc::new(EventLog::new());
        let mut cursor = log.create_cursor();
        let cancel = CancellationToken::new();

        let writer = log.clone();
        tokio::spawn(async move {
            writer.append(chat("noise"));
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append(chat("target"));
        });

        let found = log
            .wait_for(&mut cursor, &cancel, |event| match &event.payload {
                EventPayload::ChatOutput { content } if content == "target" => {
                    Some(content.clone())
                }
                _ => None,
            })
            .await;

        assert_eq!(found.as_deref(), Some("target"));
        assert_eq!(cursor.position(), 2);
    }
}
