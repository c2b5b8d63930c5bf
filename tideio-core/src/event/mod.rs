use crate::error::{Result, TideError};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

pub type EventId = u64;

/// What kind of operation an event tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TransStart,
    TransFinish,
    TransSlip,
    TransPersist,
    ObjCreate,
    ObjUnlink,
    ArrayWrite,
    ArrayRead,
    ArrayExtend,
    BlobWrite,
    BlobRead,
    KvSet,
    KvGet,
    KvUnlink,
    Fetch,
    Replica,
    Purge,
    Snapshot,
    Scratch,
    Layout,
}

/// Event lifecycle. Completed and Aborted are reached exactly once; whichever
/// transition lands first wins a racing abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Inflight,
    Completed,
    Aborted,
}

/// Category selector for `query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventQuery {
    Completed,
    Inflight,
    Aborted,
    All,
}

impl EventQuery {
    fn matches(&self, state: EventState) -> bool {
        match self {
            EventQuery::All => true,
            EventQuery::Completed => state == EventState::Completed,
            EventQuery::Inflight => state == EventState::Inflight,
            EventQuery::Aborted => state == EventState::Aborted,
        }
    }
}

/// How long `poll` may block when nothing has settled yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    NoWait,
    Wait,
    Timeout(Duration),
}

/// A settled event handed out by `poll`. `rc` is 0 on success, the negative
/// error code otherwise; aborted events carry the abort code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolledEvent {
    pub id: EventId,
    pub kind: EventKind,
    pub state: EventState,
    pub rc: i32,
}

/// Read-only snapshot handed out by `query`. Snapshots are not polled, so
/// they can be aborted but never finalized.
pub type EventSnapshot = PolledEvent;

type Callback = Box<dyn FnOnce(i32) + Send + 'static>;

struct EventRecord {
    kind: EventKind,
    state: EventState,
    rc: i32,
    polled: bool,
    callback: Option<Callback>,
    abort_handle: Option<AbortHandle>,
}

#[derive(Default)]
struct QueueState {
    events: BTreeMap<EventId, EventRecord>,
    next_id: EventId,
}

/// Completion queue for asynchronous operations. Submitted futures run on
/// the tokio runtime; their terminal state is observed through `poll`, which
/// is also the only place callbacks fire.
pub struct EventQueue {
    state: Mutex<QueueState>,
    settled: Notify,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            settled: Notify::new(),
        }
    }

    /// Submit an operation. Returns immediately with the event id; the
    /// future's outputs flow through whatever state it captured.
    pub fn submit<F>(self: &Arc<Self>, kind: EventKind, fut: F) -> EventId
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.submit_with(kind, fut, None)
    }

    pub fn submit_with<F>(self: &Arc<Self>, kind: EventKind, fut: F, callback: Option<Callback>) -> EventId
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let id = {
            let mut st = self.state.lock().unwrap();
            st.next_id += 1;
            let id = st.next_id;
            st.events.insert(
                id,
                EventRecord {
                    kind,
                    state: EventState::Inflight,
                    rc: 0,
                    polled: false,
                    callback,
                    abort_handle: None,
                },
            );
            id
        };

        let queue = self.clone();
        let handle = tokio::spawn(async move {
            let rc = match fut.await {
                Ok(()) => 0,
                Err(err) => {
                    tracing::debug!("event {} failed: {}", id, err);
                    err.code()
                }
            };
            queue.settle(id, EventState::Completed, rc);
        });

        let mut st = self.state.lock().unwrap();
        if let Some(rec) = st.events.get_mut(&id) {
            if rec.state == EventState::Inflight {
                rec.abort_handle = Some(handle.abort_handle());
            }
        }
        id
    }

    /// First terminal transition wins; a late settle against an already
    /// aborted (or completed) event is dropped.
    fn settle(&self, id: EventId, state: EventState, rc: i32) {
        let mut st = self.state.lock().unwrap();
        if let Some(rec) = st.events.get_mut(&id) {
            if rec.state == EventState::Inflight {
                rec.state = state;
                rec.rc = rc;
                rec.abort_handle = None;
            }
        }
        drop(st);
        self.settled.notify_waiters();
    }

    /// Best-effort cancel. An event racing natural completion may still
    /// complete; losing that race is not an error.
    pub fn abort(&self, id: EventId) -> Result<()> {
        let handle = {
            let mut st = self.state.lock().unwrap();
            let rec = st
                .events
                .get_mut(&id)
                .ok_or_else(|| TideError::NotFound(format!("event not found: {}", id)))?;
            if rec.state != EventState::Inflight {
                return Ok(());
            }
            rec.state = EventState::Aborted;
            rec.rc = TideError::StateConflict(String::new()).code();
            rec.abort_handle.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        self.settled.notify_waiters();
        Ok(())
    }

    fn drain_settled(&self, max_events: usize) -> (Vec<PolledEvent>, Vec<(Callback, i32)>, bool) {
        let mut st = self.state.lock().unwrap();
        let mut polled = Vec::new();
        let mut callbacks = Vec::new();
        for (&id, rec) in st.events.iter_mut() {
            if polled.len() >= max_events {
                break;
            }
            if rec.polled || rec.state == EventState::Inflight {
                continue;
            }
            rec.polled = true;
            polled.push(PolledEvent {
                id,
                kind: rec.kind,
                state: rec.state,
                rc: rec.rc,
            });
            if let Some(cb) = rec.callback.take() {
                callbacks.push((cb, rec.rc));
            }
        }
        let any_inflight = st
            .events
            .values()
            .any(|r| r.state == EventState::Inflight);
        (polled, callbacks, any_inflight)
    }

    /// Drain settled events, up to `max_events`. Blocking modes wait only
    /// while something is still in flight; callbacks fire here and only here.
    pub async fn poll(&self, mode: WaitMode, max_events: usize) -> Vec<PolledEvent> {
        let deadline = match mode {
            WaitMode::Timeout(d) => Some(tokio::time::Instant::now() + d),
            _ => None,
        };

        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);

            let (polled, callbacks, any_inflight) = self.drain_settled(max_events);
            if !polled.is_empty() || !any_inflight || mode == WaitMode::NoWait {
                for (cb, rc) in callbacks {
                    cb(rc);
                }
                return polled;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified.as_mut())
                        .await
                        .is_err()
                    {
                        let (polled, callbacks, _) = self.drain_settled(max_events);
                        for (cb, rc) in callbacks {
                            cb(rc);
                        }
                        return polled;
                    }
                }
                None => notified.as_mut().await,
            }
        }
    }

    /// Count and snapshot events by category without transferring ownership.
    /// Snapshots must not be finalized, only aborted.
    pub fn query(&self, mask: EventQuery, max_events: usize) -> (usize, Vec<EventSnapshot>) {
        let st = self.state.lock().unwrap();
        let mut total = 0;
        let mut snapshots = Vec::new();
        for (&id, rec) in st.events.iter() {
            if !mask.matches(rec.state) {
                continue;
            }
            total += 1;
            if snapshots.len() < max_events {
                snapshots.push(EventSnapshot {
                    id,
                    kind: rec.kind,
                    state: rec.state,
                    rc: rec.rc,
                });
            }
        }
        (total, snapshots)
    }

    /// Release an event. Legal only after the event was handed out by poll,
    /// aborted events included.
    pub fn finalize(&self, id: EventId) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let rec = st
            .events
            .get(&id)
            .ok_or_else(|| TideError::NotFound(format!("event not found: {}", id)))?;
        if !rec.polled {
            return Err(TideError::StateConflict(format!(
                "event {} has not been polled; finalize after poll",
                id
            )));
        }
        st.events.remove(&id);
        Ok(())
    }

    /// Abort everything still in flight and drop all records. Used when the
    /// owning queue handle is destroyed or at shutdown.
    pub fn destroy(&self) {
        let handles: Vec<AbortHandle> = {
            let mut st = self.state.lock().unwrap();
            let handles = st
                .events
                .values_mut()
                .filter_map(|rec| rec.abort_handle.take())
                .collect();
            st.events.clear();
            handles
        };
        for handle in handles {
            handle.abort();
        }
        self.settled.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[tokio::test]
    async fn test_submit_poll_finalize() {
        let queue = Arc::new(EventQueue::new());
        let id = queue.submit(EventKind::BlobWrite, async { Ok(()) });

        let polled = queue.poll(WaitMode::Wait, 16).await;
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].id, id);
        assert_eq!(polled[0].state, EventState::Completed);
        assert_eq!(polled[0].rc, 0);

        queue.finalize(id).unwrap();
        assert!(matches!(queue.finalize(id), Err(TideError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_finalize_before_poll_is_conflict() {
        let queue = Arc::new(EventQueue::new());
        let id = queue.submit(EventKind::KvSet, async { Ok(()) });
        // Let the task settle, then try finalizing without polling.
        tokio::task::yield_now().await;
        loop {
            let (n, _) = queue.query(EventQuery::Completed, 0);
            if n == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            queue.finalize(id),
            Err(TideError::StateConflict(_))
        ));
        queue.poll(WaitMode::NoWait, 16).await;
        queue.finalize(id).unwrap();
    }

    #[tokio::test]
    async fn test_failed_operation_carries_error_code() {
        let queue = Arc::new(EventQueue::new());
        queue.submit(EventKind::KvGet, async {
            Err(TideError::NotFound("missing".to_string()))
        });
        let polled = queue.poll(WaitMode::Wait, 16).await;
        assert_eq!(polled[0].rc, TideError::NotFound(String::new()).code());
        assert_eq!(polled[0].state, EventState::Completed);
    }

    #[tokio::test]
    async fn test_abort_reaches_exactly_one_terminal_state() {
        let queue = Arc::new(EventQueue::new());
        let id = queue.submit(EventKind::Fetch, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        queue.abort(id).unwrap();
        // Aborting again, or after settle, is never an error.
        queue.abort(id).unwrap();

        let polled = queue.poll(WaitMode::Wait, 16).await;
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].state, EventState::Aborted);

        // Aborted events still require poll before finalize; polled above.
        queue.finalize(id).unwrap();
    }

    #[tokio::test]
    async fn test_abort_loses_race_to_completion() {
        let queue = Arc::new(EventQueue::new());
        let id = queue.submit(EventKind::ArrayWrite, async { Ok(()) });
        loop {
            let (n, _) = queue.query(EventQuery::Completed, 0);
            if n == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        // The event already completed; abort is a quiet no-op.
        queue.abort(id).unwrap();
        let polled = queue.poll(WaitMode::NoWait, 16).await;
        assert_eq!(polled[0].state, EventState::Completed);
    }

    #[tokio::test]
    async fn test_callbacks_fire_only_in_poll() {
        let queue = Arc::new(EventQueue::new());
        let fired = Arc::new(AtomicI32::new(-100));
        let fired2 = fired.clone();
        queue.submit_with(
            EventKind::TransFinish,
            async { Ok(()) },
            Some(Box::new(move |rc| {
                fired2.store(rc, Ordering::SeqCst);
            })),
        );
        loop {
            let (n, _) = queue.query(EventQuery::Completed, 0);
            if n == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        // Settled but unpolled: callback has not run.
        assert_eq!(fired.load(Ordering::SeqCst), -100);
        queue.poll(WaitMode::NoWait, 16).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_query_counts_without_ownership() {
        let queue = Arc::new(EventQueue::new());
        queue.submit(EventKind::Purge, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        queue.submit(EventKind::Purge, async { Ok(()) });
        loop {
            let (n, _) = queue.query(EventQuery::Completed, 0);
            if n == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let (total, snaps) = queue.query(EventQuery::All, 10);
        assert_eq!(total, 2);
        assert_eq!(snaps.len(), 2);
        let (inflight, _) = queue.query(EventQuery::Inflight, 0);
        assert_eq!(inflight, 1);

        // Query does not mark events polled; poll still hands them out.
        let polled = queue.poll(WaitMode::NoWait, 16).await;
        assert_eq!(polled.len(), 1);
        queue.destroy();
    }

    #[tokio::test]
    async fn test_poll_nowait_returns_empty_when_nothing_settled() {
        let queue = Arc::new(EventQueue::new());
        queue.submit(EventKind::Snapshot, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let polled = queue.poll(WaitMode::NoWait, 16).await;
        assert!(polled.is_empty());
        queue.destroy();
    }

    #[tokio::test]
    async fn test_poll_timeout_expires() {
        let queue = Arc::new(EventQueue::new());
        queue.submit(EventKind::Replica, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let polled = queue
            .poll(WaitMode::Timeout(Duration::from_millis(10)), 16)
            .await;
        assert!(polled.is_empty());
        queue.destroy();
    }

    #[tokio::test]
    async fn test_poll_wait_returns_when_queue_idle() {
        let queue = Arc::new(EventQueue::new());
        // Nothing in flight: Wait must not block forever.
        let polled = queue.poll(WaitMode::Wait, 16).await;
        assert!(polled.is_empty());
    }
}
