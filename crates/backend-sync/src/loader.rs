//! Multi-strategy message loading.
//!
//! A load consults the cache, then falls through four strategies until the
//! requested fill target is reached:
//!
//! 1. live events buffered in the in-memory timeline,
//! 2. incremental backward pagination,
//! 3. a bounded full-history fetch,
//! 4. backfill of events referenced by parked reactions.
//!
//! Each strategy's failure is logged and skipped. Loads for the same room are
//! coalesced.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use backend_core::{
    BackendError, BackendErrorCategory, Clock, ConversationTimeline, EventNormalizer, LoadOptions,
    MediaRecord, Message, RoomMembership, RoomSummary,
};
use tracing::{debug, info, warn};

use crate::{
    cache::TieredCache,
    config::LoaderConfig,
    governor::{ConnectionGovernor, Endpoint},
    single_flight::SingleFlight,
    transport::{Direction, HistoryPage, LiveRoomUpdate},
};

/// Where a load's messages came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Cache,
    /// At least one strategy ran.
    Strategies,
    /// Membership forbids loading; nothing was fetched.
    Skipped(RoomMembership),
}

/// Full outcome of a load, including skipped strategy errors.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub messages: Vec<Message>,
    pub source: LoadSource,
    pub errors: Vec<BackendError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LoadKind {
    Latest,
    Older,
}

struct TimelineSlot {
    timeline: ConversationTimeline,
    /// A load completed; later live events write through to the cache.
    loaded: bool,
    last_used: u64,
}

struct LoaderInner {
    governor: ConnectionGovernor,
    cache: Arc<TieredCache>,
    clock: Arc<dyn Clock>,
    config: LoaderConfig,
    slots: Mutex<HashMap<String, TimelineSlot>>,
    flights: SingleFlight<(String, LoadKind), LoadReport>,
    join_attempted: Mutex<HashSet<String>>,
    tick: AtomicU64,
}

#[derive(Clone)]
pub struct MultiStrategyMessageLoader {
    inner: Arc<LoaderInner>,
}

/// Result of one pagination strategy.
#[derive(Default)]
struct PaginationRun {
    pages: usize,
    /// Cursor after the last fetched page.
    token: Option<String>,
    /// The start of history was reached.
    exhausted: bool,
    error: Option<BackendError>,
}

impl PaginationRun {
    fn blocks_further_fetches(&self) -> bool {
        self.error.as_ref().is_some_and(|err| {
            matches!(
                err.category,
                BackendErrorCategory::Forbidden | BackendErrorCategory::RateLimited
            )
        })
    }
}

impl MultiStrategyMessageLoader {
    pub fn new(
        governor: ConnectionGovernor,
        cache: Arc<TieredCache>,
        clock: Arc<dyn Clock>,
        config: LoaderConfig,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                governor,
                cache,
                clock,
                config,
                slots: Mutex::new(HashMap::new()),
                flights: SingleFlight::default(),
                join_attempted: Mutex::new(HashSet::new()),
                tick: AtomicU64::new(0),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.inner.cache
    }

    pub fn governor(&self) -> &ConnectionGovernor {
        &self.inner.governor
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Best available messages for a room, sorted by `(timestamp, id)`.
    ///
    /// Never fails: "no messages" and "transient failure" look the same.
    pub async fn load(&self, room_id: &str, options: LoadOptions) -> Vec<Message> {
        self.load_with_report(room_id, options).await.messages
    }

    pub async fn load_with_report(&self, room_id: &str, options: LoadOptions) -> LoadReport {
        let loader = self.clone();
        let room = room_id.to_owned();
        self.inner
            .flights
            .run((room_id.to_owned(), LoadKind::Latest), move || async move {
                loader.run_load(&room, options).await
            })
            .await
    }

    /// Paginate further back from the stored cursor.
    pub async fn load_older(&self, room_id: &str, limit: usize) -> Vec<Message> {
        let loader = self.clone();
        let room = room_id.to_owned();
        self.inner
            .flights
            .run((room_id.to_owned(), LoadKind::Older), move || async move {
                loader.run_load_older(&room, limit).await
            })
            .await
            .messages
    }

    /// Merge live events into the room's in-memory timeline.
    ///
    /// Returns the full timeline when something changed. A `limited` update
    /// means the server skipped events: cached messages are invalidated, the
    /// timeline restarts from this batch and the next load refetches history.
    pub fn ingest_live(&self, update: &LiveRoomUpdate) -> Option<Vec<Message>> {
        let room_id = update.room_id.as_str();
        let batch = self.normalizer().normalize_batch(room_id, &update.events);
        if batch.is_empty() && !update.limited {
            return None;
        }
        let mut touched: HashSet<String> = batch.messages.iter().map(|m| m.id.clone()).collect();
        touched.extend(batch.reactions.iter().map(|(target, _)| target.clone()));

        let (messages, write_through, changed) = {
            let mut slots = self.slots();
            let tick = self.next_tick();
            let slot = slots
                .entry(room_id.to_owned())
                .or_insert_with(|| self.new_slot(room_id, tick));
            slot.last_used = tick;

            if update.limited {
                debug!(room_id = %room_id, "live timeline gap; restarting timeline");
                let max_items = self.inner.config.timeline_max_items;
                slot.timeline = ConversationTimeline::new(room_id, max_items);
                slot.timeline.set_back_token(update.prev_batch.clone());
                slot.loaded = false;
            } else if slot.timeline.is_empty() && slot.timeline.back_token().is_none() {
                slot.timeline.set_back_token(update.prev_batch.clone());
            }

            let outcome = slot.timeline.merge_batch(batch);
            slot.timeline.mark_synced(self.inner.clock.now_ms());
            let write_through: Vec<Message> = if slot.loaded {
                slot.timeline
                    .messages()
                    .iter()
                    .filter(|m| touched.contains(&m.id))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            (
                slot.timeline.messages().to_vec(),
                write_through,
                outcome.changed() || update.limited,
            )
        };

        if update.limited {
            self.inner.cache.invalidate(room_id);
        } else if !write_through.is_empty() {
            self.inner.cache.put_messages(room_id, &write_through);
        }
        self.cache_media(room_id, &write_through);

        changed.then_some(messages)
    }

    /// Record membership observed on the live channel.
    pub fn note_membership(&self, room_id: &str, membership: RoomMembership) {
        self.inner.cache.put_membership(room_id, membership);
    }

    /// Membership of the local user, from cache or the backend.
    ///
    /// Lookup failures yield [`RoomMembership::Unknown`].
    pub async fn membership(&self, room_id: &str) -> RoomMembership {
        if let Some(membership) = self.inner.cache.get_membership(room_id) {
            return membership;
        }
        self.fetch_summary(room_id)
            .await
            .map(|summary| summary.membership)
            .unwrap_or_default()
    }

    pub async fn room_summary(&self, room_id: &str) -> Option<RoomSummary> {
        if let Some(summary) = self.inner.cache.get_room(room_id) {
            return Some(summary);
        }
        self.fetch_summary(room_id).await
    }

    /// Messages currently held in memory for a room.
    pub fn timeline_messages(&self, room_id: &str) -> Vec<Message> {
        self.slots()
            .get(room_id)
            .map(|slot| slot.timeline.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn has_timeline(&self, room_id: &str) -> bool {
        self.slots().contains_key(room_id)
    }

    pub fn timeline_count(&self) -> usize {
        self.slots().len()
    }

    /// Drop a room's in-memory state. The durable cache is kept.
    pub fn evict(&self, room_id: &str) {
        if self.slots().remove(room_id).is_some() {
            self.inner.cache.evict_memory(room_id);
            debug!(room_id = %room_id, "evicted timeline from memory");
        }
    }

    /// Evict least recently used timelines not in `keep` until at most `max` remain.
    pub fn enforce_timeline_limit(&self, max: usize, keep: &HashSet<String>) -> Vec<String> {
        let victims: Vec<String> = {
            let slots = self.slots();
            if slots.len() <= max {
                return Vec::new();
            }
            let mut candidates: Vec<(&String, u64)> = slots
                .iter()
                .filter(|(room_id, _)| !keep.contains(*room_id))
                .map(|(room_id, slot)| (room_id, slot.last_used))
                .collect();
            candidates.sort_by_key(|(_, last_used)| *last_used);
            candidates
                .into_iter()
                .take(slots.len() - max)
                .map(|(room_id, _)| room_id.clone())
                .collect()
        };
        for room_id in &victims {
            self.evict(room_id);
        }
        victims
    }

    async fn run_load(&self, room_id: &str, options: LoadOptions) -> LoadReport {
        let limit = options.limit.max(1);

        if !options.force_refresh
            && let Some(cached) = self.inner.cache.get_messages(room_id)
        {
            debug!(room_id = %room_id, count = cached.len(), "cache hit");
            let messages = self.absorb_cached(room_id, cached);
            return LoadReport {
                messages,
                source: LoadSource::Cache,
                errors: Vec::new(),
            };
        }

        let membership = self.membership(room_id).await;
        if !membership.can_paginate() {
            debug!(room_id = %room_id, ?membership, "skipping load for non-member room");
            return LoadReport {
                messages: Vec::new(),
                source: LoadSource::Skipped(membership),
                errors: Vec::new(),
            };
        }

        let (mut working, was_loaded) = self.working_copy(room_id);
        if options.force_refresh {
            if let Some(cached) = self.inner.cache.get_messages(room_id) {
                working.merge_messages(cached);
            }
            self.inner.cache.invalidate(room_id);
        }

        let mut errors = Vec::new();

        // Strategy 1 is the buffered live timeline already in `working`.
        let incremental = self
            .paginate(
                room_id,
                &mut working,
                None,
                limit,
                self.inner.config.pagination_passes as usize,
                usize::MAX,
                options.force_refresh,
            )
            .await;
        let mut last_run = incremental;
        if let Some(err) = last_run.error.clone() {
            warn!(room_id = %room_id, code = %err.code, "incremental pagination skipped");
            self.handle_forbidden(room_id, &err).await;
            errors.push(err);
        }

        if working.len() < limit && !last_run.exhausted && !last_run.blocks_further_fetches() {
            let from = if last_run.pages > 0 {
                last_run.token.clone()
            } else {
                None
            };
            let full = self
                .paginate(
                    room_id,
                    &mut working,
                    from,
                    limit,
                    usize::MAX,
                    self.inner.config.history_max_events,
                    false,
                )
                .await;
            if let Some(err) = full.error.clone() {
                warn!(room_id = %room_id, code = %err.code, "full history fetch skipped");
                errors.push(err);
            }
            if full.pages > 0 {
                last_run = full;
            }
        }

        if working.len() < limit {
            errors.extend(self.backfill(room_id, &mut working).await);
        }

        let replace_cursor = options.force_refresh || !was_loaded;
        let messages = self.commit(room_id, working, &last_run, replace_cursor);
        debug!(room_id = %room_id, count = messages.len(), errors = errors.len(), "load finished");
        LoadReport {
            messages,
            source: LoadSource::Strategies,
            errors,
        }
    }

    async fn run_load_older(&self, room_id: &str, limit: usize) -> LoadReport {
        let membership = self.membership(room_id).await;
        if !membership.can_paginate() {
            return LoadReport {
                messages: self.timeline_messages(room_id),
                source: LoadSource::Skipped(membership),
                errors: Vec::new(),
            };
        }

        let (token, has_more, empty) = {
            let slots = self.slots();
            match slots.get(room_id) {
                Some(slot) => (
                    slot.timeline.back_token().map(ToOwned::to_owned),
                    slot.timeline.has_more_history(),
                    slot.timeline.is_empty(),
                ),
                None => (None, true, true),
            }
        };
        if empty {
            return self
                .run_load(
                    room_id,
                    LoadOptions {
                        limit,
                        force_refresh: false,
                    },
                )
                .await;
        }
        if !has_more {
            debug!(room_id = %room_id, "no older history");
            return LoadReport {
                messages: self.timeline_messages(room_id),
                source: LoadSource::Strategies,
                errors: Vec::new(),
            };
        }

        let (mut working, _) = self.working_copy(room_id);
        let mut errors = Vec::new();
        let run = match token {
            Some(token) => self.older_page(room_id, &mut working, token, limit).await,
            None => self.rewind(room_id, &mut working, limit).await,
        };
        if let Some(err) = run.error.clone() {
            warn!(room_id = %room_id, code = %err.code, "older history page failed");
            self.handle_forbidden(room_id, &err).await;
            errors.push(err);
        }

        let messages = self.commit(room_id, working, &run, true);
        LoadReport {
            messages,
            source: LoadSource::Strategies,
            errors,
        }
    }

    async fn older_page(
        &self,
        room_id: &str,
        working: &mut ConversationTimeline,
        token: String,
        limit: usize,
    ) -> PaginationRun {
        let mut run = PaginationRun::default();
        match self.fetch_page(room_id, Some(&token), self.page_limit(limit)).await {
            Ok(page) => {
                run.pages = 1;
                run.exhausted = page.next_token.is_none();
                run.token = page.next_token.clone();
                self.merge_page(room_id, working, page);
            }
            Err(err) => run.error = Some(err),
        }
        run
    }

    /// Walk back from the newest page when the timeline holds messages but
    /// no cursor (restored from the cache). Stops once `limit` messages were
    /// added, history ends or `history_max_events` events were fetched.
    async fn rewind(
        &self,
        room_id: &str,
        working: &mut ConversationTimeline,
        limit: usize,
    ) -> PaginationRun {
        let page_limit = self.page_limit(limit);
        let target = working.len().saturating_add(limit);
        let mut run = PaginationRun::default();
        let mut fetched_events = 0_usize;

        while working.len() < target && fetched_events < self.inner.config.history_max_events {
            match self.fetch_page(room_id, run.token.as_deref(), page_limit).await {
                Ok(page) => {
                    run.pages += 1;
                    fetched_events += page.events.len();
                    run.token = page.next_token.clone();
                    let empty = page.events.is_empty();
                    self.merge_page(room_id, working, page);
                    if run.token.is_none() || empty {
                        run.exhausted = run.token.is_none();
                        break;
                    }
                }
                Err(err) => {
                    run.error = Some(err);
                    break;
                }
            }
        }
        debug!(room_id = %room_id, pages = run.pages, "rewound to older history");
        run
    }

    /// Backward pagination until `limit` messages, `max_pages` pages or
    /// `max_events` events.
    #[allow(clippy::too_many_arguments)]
    async fn paginate(
        &self,
        room_id: &str,
        working: &mut ConversationTimeline,
        from: Option<String>,
        limit: usize,
        max_pages: usize,
        max_events: usize,
        fetch_at_least_once: bool,
    ) -> PaginationRun {
        let page_limit = self.page_limit(limit);
        let mut run = PaginationRun {
            token: from,
            ..PaginationRun::default()
        };
        let mut fetched_events = 0_usize;

        while run.pages < max_pages && fetched_events < max_events {
            let must_fetch = fetch_at_least_once && run.pages == 0;
            if !must_fetch && working.len() >= limit {
                break;
            }
            match self.fetch_page(room_id, run.token.as_deref(), page_limit).await {
                Ok(page) => {
                    run.pages += 1;
                    fetched_events += page.events.len();
                    run.token = page.next_token.clone();
                    let empty = page.events.is_empty();
                    self.merge_page(room_id, working, page);
                    if run.token.is_none() || empty {
                        run.exhausted = run.token.is_none();
                        break;
                    }
                }
                Err(err) => {
                    run.error = Some(err);
                    break;
                }
            }
        }
        run
    }

    /// Fetch events referenced by parked reactions.
    async fn backfill(
        &self,
        room_id: &str,
        working: &mut ConversationTimeline,
    ) -> Vec<BackendError> {
        let targets = working.unresolved_reaction_targets();
        if targets.is_empty() {
            return Vec::new();
        }

        let mut errors = Vec::new();
        let normalizer = self.normalizer();
        let transport = self.inner.governor.transport();
        for target in targets.into_iter().take(self.inner.config.backfill_max_events) {
            match self
                .inner
                .governor
                .call(Endpoint::Event, transport.event(room_id, &target))
                .await
            {
                Ok(raw) => {
                    let batch = normalizer.normalize_batch(room_id, std::slice::from_ref(&raw));
                    working.merge_batch(batch);
                }
                Err(err) => {
                    let stop = err.category == BackendErrorCategory::RateLimited;
                    warn!(
                        room_id = %room_id,
                        event_id = %target,
                        code = %err.code,
                        "backfill skipped"
                    );
                    errors.push(err);
                    if stop {
                        break;
                    }
                }
            }
        }
        errors
    }

    async fn fetch_page(
        &self,
        room_id: &str,
        from: Option<&str>,
        limit: u16,
    ) -> Result<HistoryPage, BackendError> {
        let transport = self.inner.governor.transport();
        self.inner
            .governor
            .call(
                Endpoint::Messages,
                transport.messages(room_id, from, Direction::Backward, limit),
            )
            .await
    }

    fn merge_page(&self, room_id: &str, working: &mut ConversationTimeline, page: HistoryPage) {
        let batch = self.normalizer().normalize_batch(room_id, &page.events);
        if batch.malformed > 0 {
            debug!(room_id = %room_id, malformed = batch.malformed, "skipped malformed events");
        }
        working.merge_batch(batch);
    }

    /// Merge `working` into the room slot and write the result to the cache.
    fn commit(
        &self,
        room_id: &str,
        working: ConversationTimeline,
        run: &PaginationRun,
        replace_cursor: bool,
    ) -> Vec<Message> {
        let messages = {
            let mut slots = self.slots();
            let tick = self.next_tick();
            let slot = slots
                .entry(room_id.to_owned())
                .or_insert_with(|| self.new_slot(room_id, tick));
            slot.last_used = tick;
            slot.loaded = true;
            slot.timeline.merge_timeline(working);
            if run.pages > 0 && replace_cursor {
                slot.timeline.set_back_token(run.token.clone());
            }
            slot.timeline.mark_synced(self.inner.clock.now_ms());
            slot.timeline.messages().to_vec()
        };

        if !messages.is_empty() {
            self.inner.cache.put_messages(room_id, &messages);
            self.cache_media(room_id, &messages);
        }
        messages
    }

    /// Fold a cache hit into the room slot; returns the merged timeline.
    fn absorb_cached(&self, room_id: &str, cached: Vec<Message>) -> Vec<Message> {
        let cached_len = cached.len();
        let messages = {
            let mut slots = self.slots();
            let tick = self.next_tick();
            let slot = slots
                .entry(room_id.to_owned())
                .or_insert_with(|| self.new_slot(room_id, tick));
            slot.last_used = tick;
            slot.loaded = true;
            slot.timeline.merge_messages(cached);
            slot.timeline.messages().to_vec()
        };
        if messages.len() != cached_len {
            self.inner.cache.put_messages(room_id, &messages);
        }
        messages
    }

    fn working_copy(&self, room_id: &str) -> (ConversationTimeline, bool) {
        let slots = self.slots();
        match slots.get(room_id) {
            Some(slot) => (slot.timeline.clone(), slot.loaded),
            None => (
                ConversationTimeline::new(room_id, self.inner.config.timeline_max_items),
                false,
            ),
        }
    }

    async fn fetch_summary(&self, room_id: &str) -> Option<RoomSummary> {
        let transport = self.inner.governor.transport();
        match self
            .inner
            .governor
            .call(Endpoint::RoomState, transport.room_summary(room_id))
            .await
        {
            Ok(summary) => {
                self.inner.cache.put_room(&summary);
                self.inner.cache.put_membership(room_id, summary.membership);
                Some(summary)
            }
            Err(err) => {
                debug!(room_id = %room_id, code = %err.code, "room summary unavailable");
                None
            }
        }
    }

    /// One join attempt per room per process when pagination is forbidden.
    async fn handle_forbidden(&self, room_id: &str, err: &BackendError) {
        if err.category != BackendErrorCategory::Forbidden
            || !self.inner.config.auto_join_on_forbidden
        {
            return;
        }
        let first_attempt = lock(&self.inner.join_attempted).insert(room_id.to_owned());
        if !first_attempt {
            return;
        }
        let transport = self.inner.governor.transport();
        match self
            .inner
            .governor
            .call(Endpoint::Join, transport.join(room_id))
            .await
        {
            Ok(()) => {
                info!(room_id = %room_id, "joined room after forbidden pagination");
                self.inner.cache.put_membership(room_id, RoomMembership::Joined);
            }
            Err(join_err) => {
                warn!(room_id = %room_id, code = %join_err.code, "auto-join failed");
            }
        }
    }

    fn cache_media(&self, room_id: &str, messages: &[Message]) {
        let records: Vec<MediaRecord> = messages
            .iter()
            .filter_map(|message| {
                message.media.as_ref().map(|media| MediaRecord {
                    uri: media.uri.clone(),
                    event_id: message.id.clone(),
                    mimetype: media.mimetype.clone(),
                    size: media.size,
                })
            })
            .collect();
        if !records.is_empty() {
            self.inner.cache.put_media(room_id, &records);
        }
    }

    fn page_limit(&self, limit: usize) -> u16 {
        let requested = u16::try_from(limit).unwrap_or(u16::MAX);
        let cap = self.inner.config.pagination_limit_cap;
        ConversationTimeline::bounded_paginate_limit(requested, cap)
    }

    fn normalizer(&self) -> EventNormalizer {
        EventNormalizer::new(self.inner.governor.user_id())
    }

    fn new_slot(&self, room_id: &str, tick: u64) -> TimelineSlot {
        TimelineSlot {
            timeline: ConversationTimeline::new(room_id, self.inner.config.timeline_max_items),
            loaded: false,
            last_used: tick,
        }
    }

    fn next_tick(&self) -> u64 {
        self.inner.tick.fetch_add(1, Ordering::Relaxed)
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, TimelineSlot>> {
        lock(&self.inner.slots)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use backend_core::{ManualClock, SyncEventBus};
    use backend_platform::InMemoryDurableStore;
    use serde_json::json;

    use super::*;
    use crate::{
        config::GovernorConfig,
        transport::mock::{MockCallKind, MockTransport, reaction_event, text_event},
    };

    const ROOM: &str = "!room:example.org";
    const ALICE: &str = "@alice:example.org";

    fn history(count: u64) -> Vec<serde_json::Value> {
        (1..=count)
            .map(|i| text_event(&format!("$e{i:03}"), ALICE, i * 1_000, &format!("message {i}")))
            .collect()
    }

    fn joined_mock(events: Vec<serde_json::Value>) -> Arc<MockTransport> {
        Arc::new(
            MockTransport::new("@me:example.org")
                .with_room(RoomSummary::new(ROOM, RoomMembership::Joined), events),
        )
    }

    fn loader_with(mock: &Arc<MockTransport>, config: LoaderConfig) -> MultiStrategyMessageLoader {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000_000));
        let governor = ConnectionGovernor::new(
            Arc::clone(mock) as Arc<dyn crate::transport::Transport>,
            GovernorConfig {
                rate_threshold: 1_000,
                ..GovernorConfig::default()
            },
            Arc::clone(&clock),
            SyncEventBus::default(),
            None,
        );
        let cache = Arc::new(TieredCache::new(
            Arc::new(InMemoryDurableStore::default()),
            Arc::clone(&clock),
        ));
        MultiStrategyMessageLoader::new(governor, cache, clock, config)
    }

    fn options(limit: usize) -> LoadOptions {
        LoadOptions {
            limit,
            force_refresh: false,
        }
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[tokio::test]
    async fn cold_load_paginates_then_second_load_is_served_from_cache() {
        let mock = joined_mock(history(5));
        let loader = loader_with(&mock, LoaderConfig::default());

        let report = loader.load_with_report(ROOM, options(50)).await;
        assert_eq!(report.source, LoadSource::Strategies);
        assert_eq!(report.messages.len(), 5);
        assert_eq!(ids(&report.messages)[0], "$e001");
        assert_eq!(mock.count(MockCallKind::Messages), 1);

        mock.clear_calls();
        let report = loader.load_with_report(ROOM, options(50)).await;
        assert_eq!(report.source, LoadSource::Cache);
        assert_eq!(report.messages.len(), 5);
        assert_eq!(mock.total_calls(), 0);
    }

    #[tokio::test]
    async fn left_room_is_not_paginated() {
        let mock = Arc::new(
            MockTransport::new("@me:example.org")
                .with_room(RoomSummary::new(ROOM, RoomMembership::Left), history(3)),
        );
        let loader = loader_with(&mock, LoaderConfig::default());

        let report = loader.load_with_report(ROOM, options(20)).await;
        assert!(report.messages.is_empty());
        assert_eq!(report.source, LoadSource::Skipped(RoomMembership::Left));
        assert_eq!(mock.count(MockCallKind::Messages), 0);
        assert_eq!(mock.count(MockCallKind::Event), 0);
    }

    #[tokio::test]
    async fn stops_paginating_once_the_fill_target_is_reached() {
        let mock = joined_mock(history(40));
        let loader = loader_with(&mock, LoaderConfig::default());

        let messages = loader.load(ROOM, options(10)).await;
        assert_eq!(messages.len(), 10);
        assert_eq!(ids(&messages).last().copied(), Some("$e040"));
        assert_eq!(mock.count(MockCallKind::Messages), 1);
    }

    #[tokio::test]
    async fn falls_through_to_full_history_after_incremental_passes() {
        let mock = joined_mock(history(60));
        let config = LoaderConfig {
            pagination_passes: 1,
            pagination_limit_cap: 20,
            ..LoaderConfig::default()
        };
        let loader = loader_with(&mock, config);

        let messages = loader.load(ROOM, options(50)).await;
        assert_eq!(messages.len(), 60);
        assert_eq!(mock.count(MockCallKind::Messages), 3);
        assert!(
            messages
                .windows(2)
                .all(|w| w[0].sort_key() <= w[1].sort_key())
        );
    }

    #[tokio::test]
    async fn failed_incremental_page_falls_back_to_full_history() {
        let mock = joined_mock(history(5));
        mock.fail_next(
            MockCallKind::Messages,
            BackendError::new(
                BackendErrorCategory::Network,
                "matrix_http_error",
                "connection reset",
            ),
        );
        let loader = loader_with(&mock, LoaderConfig::default());

        let report = loader.load_with_report(ROOM, options(50)).await;
        assert_eq!(report.messages.len(), 5);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].category, BackendErrorCategory::Network);
        assert_eq!(mock.count(MockCallKind::Messages), 2);
    }

    #[tokio::test]
    async fn rate_limited_page_skips_remaining_fetches() {
        let mock = joined_mock(history(5));
        mock.fail_next(
            MockCallKind::Messages,
            BackendError::new(
                BackendErrorCategory::RateLimited,
                "matrix_http_error",
                "M_LIMIT_EXCEEDED",
            )
            .with_retry_after(Duration::from_secs(1)),
        );
        let loader = loader_with(&mock, LoaderConfig::default());

        let report = loader.load_with_report(ROOM, options(50)).await;
        assert!(report.messages.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(mock.count(MockCallKind::Messages), 1);
    }

    #[tokio::test]
    async fn backfills_reaction_targets_outside_the_loaded_window() {
        let mut events = history(2);
        events.push(reaction_event("$r1", ALICE, 5_000, "$old", "👍"));
        let mock = joined_mock(events);
        mock.add_detached_event(ROOM, text_event("$old", ALICE, 500, "way back"));
        let loader = loader_with(&mock, LoaderConfig::default());

        let messages = loader.load(ROOM, options(50)).await;
        assert_eq!(ids(&messages), vec!["$old", "$e001", "$e002"]);
        assert_eq!(messages[0].reactions.len(), 1);
        assert_eq!(messages[0].reactions[0].key, "👍");
        assert_eq!(mock.count(MockCallKind::Event), 1);
    }

    #[tokio::test]
    async fn force_refresh_refetches_and_keeps_cached_messages() {
        let mock = joined_mock(history(3));
        let loader = loader_with(&mock, LoaderConfig::default());
        loader.load(ROOM, options(50)).await;

        mock.add_room(RoomSummary::new(ROOM, RoomMembership::Joined), history(4));
        mock.clear_calls();

        let messages = loader
            .load(
                ROOM,
                LoadOptions {
                    limit: 50,
                    force_refresh: true,
                },
            )
            .await;
        assert_eq!(messages.len(), 4);
        assert_eq!(mock.count(MockCallKind::Messages), 1);
        let cached = loader
            .cache()
            .get_messages(ROOM)
            .expect("forced load should repopulate the cache");
        assert_eq!(cached.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_loads_for_one_room_share_a_single_fetch() {
        let mock = joined_mock(history(5));
        mock.set_latency(Duration::from_millis(200));
        let loader = loader_with(&mock, LoaderConfig::default());

        let (a, b, c) = tokio::join!(
            loader.load(ROOM, options(50)),
            loader.load(ROOM, options(50)),
            loader.load(ROOM, options(50)),
        );
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(mock.count(MockCallKind::Messages), 1);
        assert_eq!(mock.count(MockCallKind::RoomSummary), 1);
    }

    #[tokio::test]
    async fn forbidden_pagination_attempts_one_join() {
        let mock = Arc::new(
            MockTransport::new("@me:example.org")
                .with_room(RoomSummary::new(ROOM, RoomMembership::Invited), history(3)),
        );
        let config = LoaderConfig {
            auto_join_on_forbidden: true,
            ..LoaderConfig::default()
        };
        let loader = loader_with(&mock, config);
        // Membership lookup fails, so the load proceeds as Unknown.
        mock.fail_next(
            MockCallKind::RoomSummary,
            BackendError::new(BackendErrorCategory::Network, "matrix_http_error", "timeout"),
        );

        let report = loader.load_with_report(ROOM, options(10)).await;
        assert!(report.messages.is_empty());
        assert_eq!(report.errors[0].category, BackendErrorCategory::Forbidden);
        assert_eq!(mock.count(MockCallKind::Join), 1);
        assert_eq!(loader.membership(ROOM).await, RoomMembership::Joined);

        let messages = loader.load(ROOM, options(10)).await;
        assert_eq!(messages.len(), 3);
        assert_eq!(mock.count(MockCallKind::Join), 1);
    }

    #[tokio::test]
    async fn load_older_continues_from_the_stored_cursor() {
        let mock = joined_mock(history(30));
        let loader = loader_with(&mock, LoaderConfig::default());

        let first = loader.load(ROOM, options(10)).await;
        assert_eq!(ids(&first)[0], "$e021");

        let older = loader.load_older(ROOM, 10).await;
        assert_eq!(older.len(), 20);
        assert_eq!(ids(&older)[0], "$e011");

        loader.load_older(ROOM, 10).await;
        let all = loader.load_older(ROOM, 10).await;
        assert_eq!(all.len(), 30);
        assert_eq!(mock.count(MockCallKind::Messages), 3);
    }

    #[tokio::test]
    async fn load_older_after_cache_restore_reaches_older_history() {
        let mock = joined_mock(history(30));
        let loader = loader_with(&mock, LoaderConfig::default());

        loader.load(ROOM, options(10)).await;
        loader.evict(ROOM);
        let restored = loader.load_with_report(ROOM, options(10)).await;
        assert_eq!(restored.source, LoadSource::Cache);
        assert_eq!(restored.messages.len(), 10);

        let older = loader.load_older(ROOM, 10).await;
        assert_eq!(older.len(), 20);
        assert_eq!(ids(&older)[0], "$e011");

        let all = loader.load_older(ROOM, 10).await;
        assert_eq!(all.len(), 30);
        assert_eq!(ids(&all)[0], "$e001");
        assert_eq!(mock.count(MockCallKind::Messages), 4);

        let done = loader.load_older(ROOM, 10).await;
        assert_eq!(done.len(), 30);
        assert_eq!(mock.count(MockCallKind::Messages), 4);
    }

    #[tokio::test]
    async fn live_events_write_through_only_after_a_load() {
        let mock = joined_mock(history(2));
        let loader = loader_with(&mock, LoaderConfig::default());

        let early = LiveRoomUpdate {
            room_id: ROOM.into(),
            events: vec![text_event("$live1", ALICE, 10_000, "early")],
            prev_batch: Some("pos:2".into()),
            limited: false,
        };
        let merged = loader.ingest_live(&early).expect("new event should change the timeline");
        assert_eq!(ids(&merged), vec!["$live1"]);
        assert!(loader.cache().get_messages(ROOM).is_none());

        let loaded = loader.load(ROOM, options(50)).await;
        assert_eq!(ids(&loaded), vec!["$e001", "$e002", "$live1"]);

        let late = LiveRoomUpdate {
            room_id: ROOM.into(),
            events: vec![text_event("$live2", ALICE, 11_000, "late")],
            prev_batch: None,
            limited: false,
        };
        loader.ingest_live(&late).expect("timeline should change");
        let cached = loader.cache().get_messages(ROOM).expect("cache should be populated");
        assert_eq!(ids(&cached).last().copied(), Some("$live2"));

        assert!(loader.ingest_live(&late).is_none(), "replayed batch changes nothing");
    }

    #[tokio::test]
    async fn limited_live_update_invalidates_cached_history() {
        let mock = joined_mock(history(3));
        let loader = loader_with(&mock, LoaderConfig::default());
        loader.load(ROOM, options(50)).await;

        let gap = LiveRoomUpdate {
            room_id: ROOM.into(),
            events: vec![text_event("$after-gap", ALICE, 90_000, "hello again")],
            prev_batch: Some("pos:3".into()),
            limited: true,
        };
        let merged = loader.ingest_live(&gap).expect("gap should reset the timeline");
        assert_eq!(ids(&merged), vec!["$after-gap"]);
        assert!(loader.cache().get_messages(ROOM).is_none());

        mock.clear_calls();
        let reloaded = loader.load(ROOM, options(50)).await;
        assert_eq!(reloaded.len(), 4);
        assert_eq!(mock.count(MockCallKind::Messages), 1);
    }

    #[tokio::test]
    async fn media_references_are_cached() {
        let image = json!({
            "event_id": "$img",
            "sender": ALICE,
            "type": "m.room.message",
            "origin_server_ts": 7_000,
            "content": {
                "msgtype": "m.image",
                "body": "cat.png",
                "url": "mxc://example.org/cat",
                "info": { "mimetype": "image/png", "size": 2048 }
            },
        });
        let mock = joined_mock(vec![image]);
        let loader = loader_with(&mock, LoaderConfig::default());
        loader.load(ROOM, options(50)).await;

        let media = loader.cache().get_media(ROOM);
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].uri, "mxc://example.org/cat");
        assert_eq!(media[0].event_id, "$img");
    }

    #[tokio::test]
    async fn evicts_least_recently_used_unsubscribed_timelines() {
        let mock = joined_mock(history(1));
        for room in ["!a:example.org", "!b:example.org", "!c:example.org"] {
            mock.add_room(RoomSummary::new(room, RoomMembership::Joined), history(1));
        }
        let loader = loader_with(&mock, LoaderConfig::default());
        for room in ["!a:example.org", "!b:example.org", "!c:example.org", ROOM] {
            loader.load(room, options(5)).await;
        }

        let keep = HashSet::from(["!a:example.org".to_owned()]);
        let evicted = loader.enforce_timeline_limit(2, &keep);
        assert_eq!(evicted, vec!["!b:example.org".to_owned(), "!c:example.org".to_owned()]);
        assert!(loader.has_timeline("!a:example.org"));
        assert!(loader.has_timeline(ROOM));
        assert_eq!(loader.timeline_count(), 2);
    }
}
