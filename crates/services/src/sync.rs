//! Pull-based synchronisation for clients without a push channel.
//!
//! A `SyncClient` caches list and detail fetches, collapses duplicate
//! refreshes, and drives a polling loop whose cadence follows `SyncPolicy`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use live_core::Clock;
use live_core::lifecycle::LifecyclePolicy;
use live_core::model::{LiveSession, SessionId};
use live_core::sync_policy::{SessionSnapshot, SyncPolicy};
use storage::repository::SessionFilter;

use crate::catalog::CatalogService;
use crate::error::LiveSessionError;

/// Source of session state for a polling client.
#[async_trait]
pub trait SessionFeed: Send + Sync {
    /// # Errors
    ///
    /// Returns `LiveSessionError` if the fetch fails.
    async fn fetch_list(&self, filter: &SessionFilter) -> Result<Vec<LiveSession>, LiveSessionError>;

    /// # Errors
    ///
    /// Returns `LiveSessionError::SessionNotFound` for an unknown id.
    async fn fetch_detail(&self, id: SessionId) -> Result<LiveSession, LiveSessionError>;
}

#[async_trait]
impl SessionFeed for CatalogService {
    async fn fetch_list(&self, filter: &SessionFilter) -> Result<Vec<LiveSession>, LiveSessionError> {
        self.list_sessions(filter).await
    }

    async fn fetch_detail(&self, id: SessionId) -> Result<LiveSession, LiveSessionError> {
        self.get_session(id).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListView {
    pub sessions: Vec<LiveSession>,
    pub next_poll: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailView {
    pub session: LiveSession,
    /// `None` once the session is terminal.
    pub next_poll: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    /// Reuse a result fetched inside the de-duplication window.
    Cached,
    /// Fetch again unless a fetch landed while this caller was waiting.
    Revalidate,
}

struct Cached<T> {
    value: T,
    fetched_at: Instant,
}

/// One cached view. `generation` only changes while `state` is locked.
struct Slot<T> {
    state: Mutex<Option<Cached<T>>>,
    generation: AtomicU64,
}

impl<T: Clone> Slot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    async fn get_or_fetch<Fut>(
        &self,
        freshness: Freshness,
        window: Duration,
        fetch: impl FnOnce() -> Fut,
    ) -> Result<T, LiveSessionError>
    where
        Fut: Future<Output = Result<T, LiveSessionError>>,
    {
        let seen = self.generation.load(Ordering::Acquire);
        let mut state = self.state.lock().await;
        if let Some(cached) = state.as_ref() {
            let landed_while_waiting = self.generation.load(Ordering::Acquire) != seen;
            let fresh = freshness == Freshness::Cached && cached.fetched_at.elapsed() < window;
            if landed_while_waiting || fresh {
                return Ok(cached.value.clone());
            }
        }

        let value = fetch().await?;
        *state = Some(Cached {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        self.generation.fetch_add(1, Ordering::Release);
        Ok(value)
    }
}

/// Polling client for one filtered list view and any number of detail views.
pub struct SyncClient<F> {
    feed: F,
    clock: Clock,
    lifecycle: LifecyclePolicy,
    policy: SyncPolicy,
    filter: SessionFilter,
    list: Slot<Vec<LiveSession>>,
    details: Mutex<HashMap<SessionId, Arc<Slot<LiveSession>>>>,
    focus: watch::Sender<u64>,
}

impl<F: SessionFeed> SyncClient<F> {
    #[must_use]
    pub fn new(
        feed: F,
        clock: Clock,
        lifecycle: LifecyclePolicy,
        policy: SyncPolicy,
        filter: SessionFilter,
    ) -> Self {
        let (focus, _) = watch::channel(0);
        Self {
            feed,
            clock,
            lifecycle,
            policy,
            filter,
            list: Slot::new(),
            details: Mutex::new(HashMap::new()),
            focus,
        }
    }

    #[must_use]
    pub fn feed(&self) -> &F {
        &self.feed
    }

    #[must_use]
    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// The list view, served from cache inside the de-duplication window.
    ///
    /// # Errors
    ///
    /// Returns the feed's error if a fetch was needed and failed.
    pub async fn list(&self) -> Result<ListView, LiveSessionError> {
        self.fetch_list(Freshness::Cached).await
    }

    /// Fetches the list again, still sharing any fetch already in flight.
    ///
    /// # Errors
    ///
    /// Returns the feed's error if the fetch failed.
    pub async fn revalidate_list(&self) -> Result<ListView, LiveSessionError> {
        self.fetch_list(Freshness::Revalidate).await
    }

    /// # Errors
    ///
    /// Returns the feed's error if a fetch was needed and failed.
    pub async fn detail(&self, id: SessionId) -> Result<DetailView, LiveSessionError> {
        self.fetch_detail(id, Freshness::Cached).await
    }

    /// # Errors
    ///
    /// Returns the feed's error if the fetch failed.
    pub async fn revalidate_detail(&self, id: SessionId) -> Result<DetailView, LiveSessionError> {
        self.fetch_detail(id, Freshness::Revalidate).await
    }

    /// Wakes every running loop for an immediate revalidation, as when the
    /// client regains foreground focus.
    pub fn revalidate_on_focus(&self) {
        self.focus.send_modify(|count| *count = count.wrapping_add(1));
    }

    /// Polls the list view until `shutdown` turns `true` or its sender drops.
    ///
    /// Fetch failures are logged and retried at the last known interval.
    pub async fn run_list_loop<U>(&self, mut shutdown: watch::Receiver<bool>, mut on_update: U)
    where
        U: FnMut(&ListView) + Send,
    {
        let mut focus = self.focus.subscribe();
        let mut freshness = Freshness::Cached;
        let mut interval = self.policy.idle_list;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.fetch_list(freshness).await {
                Ok(view) => {
                    interval = view.next_poll;
                    on_update(&view);
                }
                Err(err) => warn!(error = %err, "session list refresh failed"),
            }
            freshness = Freshness::Revalidate;

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                _ = focus.changed() => debug!("focus regained, revalidating session list"),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Polls one session until it reaches a terminal status, disappears, or
    /// `shutdown` fires.
    pub async fn run_detail_loop<U>(
        &self,
        id: SessionId,
        mut shutdown: watch::Receiver<bool>,
        mut on_update: U,
    ) where
        U: FnMut(&DetailView) + Send,
    {
        let mut focus = self.focus.subscribe();
        let mut freshness = Freshness::Cached;
        let mut interval = self.policy.idle_list;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.fetch_detail(id, freshness).await {
                Ok(view) => {
                    on_update(&view);
                    let Some(next) = view.next_poll else {
                        debug!(session_id = %id, status = %view.session.cached_status(), "session is terminal, detail polling stopped");
                        self.forget_detail(id).await;
                        return;
                    };
                    interval = next;
                }
                Err(LiveSessionError::SessionNotFound(_)) => {
                    debug!(session_id = %id, "session gone, detail polling stopped");
                    return;
                }
                Err(err) => warn!(session_id = %id, error = %err, "session detail refresh failed"),
            }
            freshness = Freshness::Revalidate;

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                _ = focus.changed() => debug!(session_id = %id, "focus regained, revalidating session"),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn fetch_list(&self, freshness: Freshness) -> Result<ListView, LiveSessionError> {
        let sessions = self
            .list
            .get_or_fetch(freshness, self.policy.dedup_window, || {
                self.feed.fetch_list(&self.filter)
            })
            .await?;
        let snapshots: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|s| SessionSnapshot::of(s, &self.lifecycle))
            .collect();
        let next_poll = self.policy.list_interval(&snapshots, self.clock.now());
        Ok(ListView {
            sessions,
            next_poll,
        })
    }

    async fn fetch_detail(
        &self,
        id: SessionId,
        freshness: Freshness,
    ) -> Result<DetailView, LiveSessionError> {
        let slot = {
            let mut details = self.details.lock().await;
            Arc::clone(details.entry(id).or_insert_with(|| Arc::new(Slot::new())))
        };
        let session = match slot
            .get_or_fetch(freshness, self.policy.dedup_window, || self.feed.fetch_detail(id))
            .await
        {
            Ok(session) => session,
            Err(err @ LiveSessionError::SessionNotFound(_)) => {
                self.forget_detail(id).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let snapshot = SessionSnapshot::of(&session, &self.lifecycle);
        let next_poll = self.policy.detail_interval(&snapshot, self.clock.now());
        Ok(DetailView { session, next_poll })
    }

    /// Drops the cached detail view once nothing will poll it again.
    async fn forget_detail(&self, id: SessionId) {
        self.details.lock().await.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use chrono::Duration as ChronoDuration;
    use live_core::model::{Question, SessionDraft, SessionStatus};
    use live_core::time::fixed_now;
    use storage::repository::Storage;

    struct CountingFeed {
        inner: CatalogService,
        delay: Duration,
        list_calls: AtomicUsize,
        detail_calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionFeed for CountingFeed {
        async fn fetch_list(
            &self,
            filter: &SessionFilter,
        ) -> Result<Vec<LiveSession>, LiveSessionError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.fetch_list(filter).await
        }

        async fn fetch_detail(&self, id: SessionId) -> Result<LiveSession, LiveSessionError> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_detail(id).await
        }
    }

    impl CountingFeed {
        fn list_calls(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }

        fn detail_calls(&self) -> usize {
            self.detail_calls.load(Ordering::SeqCst)
        }
    }

    /// Storage with one session starting `starts_in` after the fixed clock.
    async fn seeded(starts_in: ChronoDuration) -> (Storage, SessionId) {
        let storage = Storage::in_memory();
        let draft = SessionDraft {
            name: "Live drill".into(),
            description: None,
            level: "C1".into(),
            scheduled_start: fixed_now() + starts_in,
            duration_minutes: 30,
            questions: vec![Question::new("q-1", 0)],
            max_participants: None,
            open_enrollment: true,
            allow_immediate: true,
        };
        let session = LiveSession::create(
            SessionId::generate(),
            draft,
            fixed_now(),
            &LifecyclePolicy::default(),
        )
        .unwrap();
        storage.sessions.insert_session(&session).await.unwrap();
        (storage, session.id())
    }

    fn client(storage: &Storage, delay: Duration) -> SyncClient<CountingFeed> {
        let clock = Clock::fixed(fixed_now());
        let feed = CountingFeed {
            inner: CatalogService::new(clock, LifecyclePolicy::default(), Arc::clone(&storage.sessions)),
            delay,
            list_calls: AtomicUsize::new(0),
            detail_calls: AtomicUsize::new(0),
        };
        SyncClient::new(
            feed,
            clock,
            LifecyclePolicy::default(),
            SyncPolicy::default(),
            SessionFilter::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_revalidations_share_one_fetch() {
        let (storage, _) = seeded(ChronoDuration::hours(2)).await;
        let client = client(&storage, Duration::from_millis(200));

        let (a, b) = tokio::join!(client.revalidate_list(), client.revalidate_list());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(client.feed().list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_reads_inside_window_are_served_from_cache() {
        let (storage, _) = seeded(ChronoDuration::hours(2)).await;
        let client = client(&storage, Duration::ZERO);

        client.list().await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        client.list().await.unwrap();
        assert_eq!(client.feed().list_calls(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        client.list().await.unwrap();
        assert_eq!(client.feed().list_calls(), 2);

        client.revalidate_list().await.unwrap();
        assert_eq!(client.feed().list_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn list_loop_polls_at_the_active_cadence() {
        let (storage, _) = seeded(ChronoDuration::minutes(-1)).await;
        let client = Arc::new(client(&storage, Duration::ZERO));
        let (stop, shutdown) = watch::channel(false);

        let polls = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn({
            let client = Arc::clone(&client);
            let polls = Arc::clone(&polls);
            async move {
                client
                    .run_list_loop(shutdown, move |view| {
                        assert_eq!(view.next_poll, Duration::from_secs(5));
                        polls.fetch_add(1, Ordering::SeqCst);
                    })
                    .await;
            }
        });

        tokio::time::sleep(Duration::from_millis(12_500)).await;
        stop.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert_eq!(client.feed().list_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn focus_revalidates_without_waiting_for_the_timer() {
        let (storage, _) = seeded(ChronoDuration::hours(2)).await;
        let client = Arc::new(client(&storage, Duration::ZERO));
        let (stop, shutdown) = watch::channel(false);

        let task = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.run_list_loop(shutdown, |_| {}).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.feed().list_calls(), 1);
        client.revalidate_on_focus();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.feed().list_calls(), 2);

        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn detail_loop_stops_once_terminal() {
        let (storage, id) = seeded(ChronoDuration::minutes(-1)).await;
        storage.sessions.cancel_session(id).await.unwrap();
        let client = client(&storage, Duration::ZERO);
        let (_stop, shutdown) = watch::channel(false);

        let mut seen = Vec::new();
        client
            .run_detail_loop(id, shutdown, |view| {
                seen.push((view.session.cached_status(), view.next_poll));
            })
            .await;

        assert_eq!(seen, [(SessionStatus::Cancelled, None)]);
        assert_eq!(client.feed().detail_calls(), 1);
        assert!(client.details.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn detail_loop_forgets_deleted_sessions() {
        let (storage, id) = seeded(ChronoDuration::minutes(3)).await;
        let client = Arc::new(client(&storage, Duration::ZERO));
        let (_stop, shutdown) = watch::channel(false);

        let task = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.run_detail_loop(id, shutdown, |_| {}).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.details.lock().await.len(), 1);

        storage.sessions.delete_session(id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        task.await.unwrap();

        assert_eq!(client.feed().detail_calls(), 2);
        assert!(client.details.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lobby_detail_polls_every_ten_seconds() {
        let (storage, id) = seeded(ChronoDuration::minutes(3)).await;
        let client = client(&storage, Duration::ZERO);

        let view = client.detail(id).await.unwrap();
        assert_eq!(view.session.cached_status(), SessionStatus::Lobby);
        assert_eq!(view.next_poll, Some(Duration::from_secs(10)));
    }
}
