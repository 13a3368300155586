//! Two-tier cache: process memory in front of a durable key-value store.
//!
//! Writes go to both tiers; a durable failure is logged and the memory tier
//! still reflects the write. The first read or write of a
//! `(entity type, conversation)` bucket hydrates memory from the durable tier.
//! Durable calls run through [`durable_io`] since the SQLite tier blocks on disk.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use backend_core::{Clock, MediaRecord, Message, RoomMembership, RoomSummary};
use backend_platform::{DurableRecord, DurableStore, RecordKey};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

const HOUR_MS: u64 = 60 * 60 * 1_000;

/// Cached entity kinds, each with its own expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Message,
    RoomMetadata,
    Membership,
    Media,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Message,
        EntityType::RoomMetadata,
        EntityType::Membership,
        EntityType::Media,
    ];

    /// Durable-tier type tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::RoomMetadata => "room",
            Self::Membership => "membership",
            Self::Media => "media",
        }
    }

    pub fn default_ttl(self) -> Duration {
        Duration::from_millis(match self {
            Self::Message => 24 * HOUR_MS,
            Self::RoomMetadata => 12 * HOUR_MS,
            Self::Membership => 6 * HOUR_MS,
            Self::Media => 7 * 24 * HOUR_MS,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub cached_at_ms: u64,
    pub expires_at_ms: u64,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

#[derive(Debug, Clone)]
enum CachedValue {
    Message(Message),
    Room(RoomSummary),
    Membership(RoomMembership),
    Media(MediaRecord),
}

impl CachedValue {
    /// Plain JSON for the durable tier. Raw payloads never cross.
    fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Message(message) => serde_json::to_string(&message.without_raw()),
            Self::Room(summary) => serde_json::to_string(summary),
            Self::Membership(membership) => serde_json::to_string(membership),
            Self::Media(record) => serde_json::to_string(record),
        }
    }

    fn from_json(entity_type: EntityType, raw: &str) -> Result<Self, serde_json::Error> {
        Ok(match entity_type {
            EntityType::Message => Self::Message(serde_json::from_str(raw)?),
            EntityType::RoomMetadata => Self::Room(serde_json::from_str(raw)?),
            EntityType::Membership => Self::Membership(serde_json::from_str(raw)?),
            EntityType::Media => Self::Media(serde_json::from_str(raw)?),
        })
    }
}

type BucketKey = (EntityType, String);
type Bucket = HashMap<String, CacheEntry<CachedValue>>;

#[derive(Default)]
struct MemoryTier {
    buckets: HashMap<BucketKey, Bucket>,
    hydrated: HashSet<BucketKey>,
}

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub memory: usize,
    pub durable: usize,
}

pub struct TieredCache {
    memory: Mutex<MemoryTier>,
    durable: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    ttls: HashMap<EntityType, Duration>,
}

impl TieredCache {
    pub fn new(durable: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            memory: Mutex::new(MemoryTier::default()),
            durable,
            clock,
            ttls: EntityType::ALL
                .into_iter()
                .map(|entity_type| (entity_type, entity_type.default_ttl()))
                .collect(),
        }
    }

    /// Override the expiry for one entity type. Zero is raised to 1ms.
    pub fn with_ttl(mut self, entity_type: EntityType, ttl: Duration) -> Self {
        self.ttls.insert(entity_type, ttl.max(Duration::from_millis(1)));
        self
    }

    pub fn ttl(&self, entity_type: EntityType) -> Duration {
        self.ttls
            .get(&entity_type)
            .copied()
            .unwrap_or_else(|| entity_type.default_ttl())
    }

    /// Cache messages of one conversation, replacing entries with equal ids.
    pub fn put_messages(&self, conversation_id: &str, messages: &[Message]) {
        let values = messages
            .iter()
            .map(|m| (m.id.clone(), CachedValue::Message(m.without_raw())))
            .collect();
        self.put(EntityType::Message, conversation_id, values);
    }

    /// Unexpired cached messages in timeline order, or `None` on a miss.
    pub fn get_messages(&self, conversation_id: &str) -> Option<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .get(EntityType::Message, conversation_id)
            .into_iter()
            .filter_map(|entry| match entry.value {
                CachedValue::Message(message) => Some(message),
                _ => None,
            })
            .collect();
        if messages.is_empty() {
            return None;
        }
        messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Some(messages)
    }

    /// Cached entries for a conversation's messages, with their stamps.
    pub fn message_entries(&self, conversation_id: &str) -> Vec<CacheEntry<Message>> {
        self.get(EntityType::Message, conversation_id)
            .into_iter()
            .filter_map(|entry| match entry.value {
                CachedValue::Message(message) => Some(CacheEntry {
                    value: message,
                    cached_at_ms: entry.cached_at_ms,
                    expires_at_ms: entry.expires_at_ms,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn put_room(&self, summary: &RoomSummary) {
        let room_id = summary.room_id.clone();
        self.put(
            EntityType::RoomMetadata,
            &room_id,
            vec![(room_id.clone(), CachedValue::Room(summary.clone()))],
        );
    }

    pub fn get_room(&self, room_id: &str) -> Option<RoomSummary> {
        self.get(EntityType::RoomMetadata, room_id)
            .into_iter()
            .find_map(|entry| match entry.value {
                CachedValue::Room(summary) => Some(summary),
                _ => None,
            })
    }

    pub fn put_membership(&self, room_id: &str, membership: RoomMembership) {
        self.put(
            EntityType::Membership,
            room_id,
            vec![(room_id.to_owned(), CachedValue::Membership(membership))],
        );
    }

    pub fn get_membership(&self, room_id: &str) -> Option<RoomMembership> {
        self.get(EntityType::Membership, room_id)
            .into_iter()
            .find_map(|entry| match entry.value {
                CachedValue::Membership(membership) => Some(membership),
                _ => None,
            })
    }

    /// Cache media records keyed by media URI.
    pub fn put_media(&self, conversation_id: &str, records: &[MediaRecord]) {
        let values = records
            .iter()
            .map(|r| (r.uri.clone(), CachedValue::Media(r.clone())))
            .collect();
        self.put(EntityType::Media, conversation_id, values);
    }

    pub fn get_media(&self, conversation_id: &str) -> Vec<MediaRecord> {
        let mut records: Vec<MediaRecord> = self
            .get(EntityType::Media, conversation_id)
            .into_iter()
            .filter_map(|entry| match entry.value {
                CachedValue::Media(record) => Some(record),
                _ => None,
            })
            .collect();
        records.sort_by(|a, b| a.uri.cmp(&b.uri));
        records
    }

    /// Drop every cached message of one conversation from both tiers.
    pub fn invalidate(&self, conversation_id: &str) {
        {
            let mut memory = lock(&self.memory);
            let key = (EntityType::Message, conversation_id.to_owned());
            memory.buckets.remove(&key);
            memory.hydrated.insert(key);
        }
        match durable_io(|| {
            self.durable
                .delete_conversation(EntityType::Message.as_str(), conversation_id)
        }) {
            Ok(deleted) => {
                debug!(room_id = %conversation_id, deleted, "invalidated cached messages");
            }
            Err(err) => {
                warn!(room_id = %conversation_id, error = %err, "durable invalidation failed");
            }
        }
    }

    /// Release a conversation's memory-tier buckets; the durable tier keeps them.
    pub fn evict_memory(&self, conversation_id: &str) {
        let mut memory = lock(&self.memory);
        for entity_type in EntityType::ALL {
            let key = (entity_type, conversation_id.to_owned());
            memory.buckets.remove(&key);
            memory.hydrated.remove(&key);
        }
    }

    /// Purge expired entries from both tiers.
    pub fn sweep_expired(&self) -> SweepReport {
        let now_ms = self.clock.now_ms();
        let mut report = SweepReport::default();
        {
            let mut memory = lock(&self.memory);
            for bucket in memory.buckets.values_mut() {
                let before = bucket.len();
                bucket.retain(|_, entry| !entry.is_expired(now_ms));
                report.memory += before - bucket.len();
            }
            memory.buckets.retain(|_, bucket| !bucket.is_empty());
        }
        match durable_io(|| self.durable.purge_expired(now_ms)) {
            Ok(purged) => report.durable = purged,
            Err(err) => warn!(error = %err, "durable sweep failed"),
        }
        debug!(memory = report.memory, durable = report.durable, "cache sweep finished");
        report
    }

    fn put(
        &self,
        entity_type: EntityType,
        conversation_id: &str,
        values: Vec<(String, CachedValue)>,
    ) {
        if values.is_empty() {
            return;
        }
        let cached_at_ms = self.clock.now_ms();
        let expires_at_ms = cached_at_ms.saturating_add(self.ttl(entity_type).as_millis() as u64);

        let mut records = Vec::with_capacity(values.len());
        for (id, value) in &values {
            match value.to_json() {
                Ok(json) => records.push(DurableRecord {
                    key: RecordKey::new(entity_type.as_str(), conversation_id, id.as_str()),
                    value: json,
                    cached_at_ms,
                    expires_at_ms,
                }),
                Err(err) => {
                    warn!(entity_id = %id, error = %err, "entity not serializable; memory only");
                }
            }
        }

        {
            let mut memory = lock(&self.memory);
            self.hydrate(&mut memory, entity_type, conversation_id, cached_at_ms);
            let bucket = memory
                .buckets
                .entry((entity_type, conversation_id.to_owned()))
                .or_default();
            for (id, value) in values {
                bucket.insert(
                    id,
                    CacheEntry {
                        value,
                        cached_at_ms,
                        expires_at_ms,
                    },
                );
            }
        }

        if let Err(err) = durable_io(|| self.durable.put_many(&records)) {
            warn!(
                entity_type = entity_type.as_str(),
                room_id = %conversation_id,
                error = %err,
                "durable write failed; continuing memory-only"
            );
        }
    }

    fn get(&self, entity_type: EntityType, conversation_id: &str) -> Vec<CacheEntry<CachedValue>> {
        let now_ms = self.clock.now_ms();
        let mut memory = lock(&self.memory);
        self.hydrate(&mut memory, entity_type, conversation_id, now_ms);
        let Some(bucket) = memory
            .buckets
            .get_mut(&(entity_type, conversation_id.to_owned()))
        else {
            return Vec::new();
        };
        bucket.retain(|_, entry| !entry.is_expired(now_ms));
        bucket.values().cloned().collect()
    }

    /// Load a bucket from the durable tier once per process. A failed scan
    /// leaves the bucket unmarked so the next access retries it.
    fn hydrate(
        &self,
        memory: &mut MemoryTier,
        entity_type: EntityType,
        conversation_id: &str,
        now_ms: u64,
    ) {
        let key = (entity_type, conversation_id.to_owned());
        if memory.hydrated.contains(&key) {
            return;
        }

        let scanned = durable_io(|| self.durable.scan(entity_type.as_str(), conversation_id));
        let records = match scanned {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    entity_type = entity_type.as_str(),
                    room_id = %conversation_id,
                    error = %err,
                    "durable read failed; serving memory tier only"
                );
                return;
            }
        };

        memory.hydrated.insert(key.clone());
        let bucket = memory.buckets.entry(key).or_default();
        let mut loaded = 0_usize;
        for record in records {
            if record.is_expired(now_ms) {
                continue;
            }
            match CachedValue::from_json(entity_type, &record.value) {
                Ok(value) => {
                    loaded += 1;
                    bucket.entry(record.key.entity_id).or_insert(CacheEntry {
                        value,
                        cached_at_ms: record.cached_at_ms,
                        expires_at_ms: record.expires_at_ms,
                    });
                }
                Err(err) => warn!(
                    entity_id = %record.key.entity_id,
                    error = %err,
                    "skipping undecodable durable record"
                ),
            }
        }
        if loaded > 0 {
            debug!(
                entity_type = entity_type.as_str(),
                room_id = %conversation_id,
                loaded,
                "memory tier repopulated from durable tier"
            );
        }
    }
}

/// Run a blocking durable-tier call. On a multi-threaded runtime the worker
/// hands its queued tasks to another thread first; elsewhere the call runs
/// inline.
fn durable_io<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn lock(mutex: &Mutex<MemoryTier>) -> MutexGuard<'_, MemoryTier> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use backend_core::{ManualClock, MessageKind};
    use backend_platform::{InMemoryDurableStore, KvStoreError};
    use serde_json::json;

    use super::*;

    const T0: u64 = 1_700_000_000_000;

    fn message(id: &str, ts: u64) -> Message {
        Message {
            id: id.to_owned(),
            room_id: "!a:example.org".to_owned(),
            sender_id: "@bob:example.org".to_owned(),
            sender_display_name: None,
            body: format!("body {id}"),
            kind: MessageKind::Text,
            timestamp_ms: ts,
            is_from_self: false,
            reply_to_id: None,
            reactions: Vec::new(),
            media: None,
            raw_payload: Some(Arc::new(json!({"event_id": id}))),
        }
    }

    fn cache(durable: Arc<dyn DurableStore>, clock: &ManualClock) -> TieredCache {
        TieredCache::new(durable, Arc::new(clock.clone()))
    }

    struct BrokenStore;

    impl DurableStore for BrokenStore {
        fn put_many(&self, _records: &[DurableRecord]) -> Result<(), KvStoreError> {
            Err(KvStoreError::Unavailable("disk gone".into()))
        }

        fn get(&self, _key: &RecordKey) -> Result<Option<DurableRecord>, KvStoreError> {
            Err(KvStoreError::Unavailable("disk gone".into()))
        }

        fn scan(&self, _: &str, _: &str) -> Result<Vec<DurableRecord>, KvStoreError> {
            Err(KvStoreError::Unavailable("disk gone".into()))
        }

        fn delete_conversation(&self, _: &str, _: &str) -> Result<usize, KvStoreError> {
            Err(KvStoreError::Unavailable("disk gone".into()))
        }

        fn purge_expired(&self, _: u64) -> Result<usize, KvStoreError> {
            Err(KvStoreError::Unavailable("disk gone".into()))
        }
    }

    #[test]
    fn writes_through_and_reads_back_sorted() {
        let clock = ManualClock::new(T0);
        let durable = Arc::new(InMemoryDurableStore::default());
        let cache = cache(durable.clone(), &clock);

        cache.put_messages("!a:example.org", &[message("m2", 200), message("m1", 100)]);
        let got = cache.get_messages("!a:example.org").expect("messages should be cached");
        assert_eq!(got.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["m1", "m2"]);
        assert_eq!(durable.len(), 2);
    }

    #[test]
    fn durable_tier_repopulates_a_fresh_memory_tier() {
        let clock = ManualClock::new(T0);
        let durable: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::default());
        cache(Arc::clone(&durable), &clock).put_messages("!a:example.org", &[message("m1", 100)]);

        let restarted = cache(durable, &clock);
        let got = restarted
            .get_messages("!a:example.org")
            .expect("durable hit should be served");
        assert_eq!(got.len(), 1);
        assert!(got[0].raw_payload.is_none(), "raw payload must not be persisted");
    }

    #[test]
    fn later_writes_merge_with_durable_history() {
        let clock = ManualClock::new(T0);
        let durable: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::default());
        cache(Arc::clone(&durable), &clock).put_messages("!a:example.org", &[message("m1", 100)]);

        let restarted = cache(durable, &clock);
        restarted.put_messages("!a:example.org", &[message("m2", 200)]);
        assert_eq!(
            restarted.get_messages("!a:example.org").map(|m| m.len()),
            Some(2)
        );
    }

    #[test]
    fn durable_failure_keeps_memory_tier_working() {
        let clock = ManualClock::new(T0);
        let cache = cache(Arc::new(BrokenStore), &clock);
        cache.put_messages("!a:example.org", &[message("m1", 100)]);
        cache.put_membership("!a:example.org", RoomMembership::Joined);

        assert_eq!(cache.get_messages("!a:example.org").map(|m| m.len()), Some(1));
        assert_eq!(cache.get_membership("!a:example.org"), Some(RoomMembership::Joined));
        cache.invalidate("!a:example.org");
        assert_eq!(cache.get_messages("!a:example.org"), None);
        assert_eq!(cache.sweep_expired().durable, 0);
    }

    /// Fails the first `failures` scans, then delegates.
    struct FlakyStore {
        inner: InMemoryDurableStore,
        failures: std::sync::atomic::AtomicUsize,
    }

    impl FlakyStore {
        fn new(inner: InMemoryDurableStore, failures: usize) -> Self {
            Self {
                inner,
                failures: std::sync::atomic::AtomicUsize::new(failures),
            }
        }
    }

    impl DurableStore for FlakyStore {
        fn put_many(&self, records: &[DurableRecord]) -> Result<(), KvStoreError> {
            self.inner.put_many(records)
        }

        fn get(&self, key: &RecordKey) -> Result<Option<DurableRecord>, KvStoreError> {
            self.inner.get(key)
        }

        fn scan(
            &self,
            entity_type: &str,
            conversation_id: &str,
        ) -> Result<Vec<DurableRecord>, KvStoreError> {
            use std::sync::atomic::Ordering;
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(KvStoreError::Unavailable("disk busy".into()));
            }
            self.inner.scan(entity_type, conversation_id)
        }

        fn delete_conversation(
            &self,
            entity_type: &str,
            conversation_id: &str,
        ) -> Result<usize, KvStoreError> {
            self.inner.delete_conversation(entity_type, conversation_id)
        }

        fn purge_expired(&self, now_ms: u64) -> Result<usize, KvStoreError> {
            self.inner.purge_expired(now_ms)
        }
    }

    #[test]
    fn transient_durable_read_failure_is_retried() {
        let clock = ManualClock::new(T0);
        let seeded = InMemoryDurableStore::default();
        let writer = cache(Arc::new(seeded.clone()), &clock);
        writer.put_messages("!a:example.org", &[message("m1", 100)]);

        let restarted = cache(Arc::new(FlakyStore::new(seeded, 1)), &clock);
        assert!(restarted.get_messages("!a:example.org").is_none());
        let got = restarted
            .get_messages("!a:example.org")
            .expect("durable tier should be read again after a failed scan");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "m1");
    }

    /// Waits inside `put_many` until another task on the runtime made progress.
    struct WaitingStore {
        inner: InMemoryDurableStore,
        progressed: Arc<std::sync::atomic::AtomicBool>,
        saw_progress: std::sync::atomic::AtomicBool,
    }

    impl DurableStore for WaitingStore {
        fn put_many(&self, records: &[DurableRecord]) -> Result<(), KvStoreError> {
            use std::sync::atomic::Ordering;
            for _ in 0..200 {
                if self.progressed.load(Ordering::SeqCst) {
                    self.saw_progress.store(true, Ordering::SeqCst);
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            self.inner.put_many(records)
        }

        fn get(&self, key: &RecordKey) -> Result<Option<DurableRecord>, KvStoreError> {
            self.inner.get(key)
        }

        fn scan(&self, entity_type: &str, id: &str) -> Result<Vec<DurableRecord>, KvStoreError> {
            self.inner.scan(entity_type, id)
        }

        fn delete_conversation(&self, entity_type: &str, id: &str) -> Result<usize, KvStoreError> {
            self.inner.delete_conversation(entity_type, id)
        }

        fn purge_expired(&self, now_ms: u64) -> Result<usize, KvStoreError> {
            self.inner.purge_expired(now_ms)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn durable_writes_do_not_stall_the_runtime_worker() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let progressed = Arc::new(AtomicBool::new(false));
        let store = Arc::new(WaitingStore {
            inner: InMemoryDurableStore::default(),
            progressed: Arc::clone(&progressed),
            saw_progress: AtomicBool::new(false),
        });
        let clock = ManualClock::new(T0);
        let cache = cache(Arc::clone(&store) as Arc<dyn DurableStore>, &clock);

        tokio::spawn(async move {
            tokio::spawn(async move { progressed.store(true, Ordering::SeqCst) });
            cache.put_messages("!a:example.org", &[message("m1", 100)]);
        })
        .await
        .expect("cache task should finish");

        assert!(store.saw_progress.load(Ordering::SeqCst));
        assert_eq!(store.inner.len(), 1);
    }

    #[test]
    fn entries_expire_exactly_at_their_ttl() {
        let clock = ManualClock::new(T0);
        let cache = cache(Arc::new(InMemoryDurableStore::default()), &clock);
        cache.put_messages("!a:example.org", &[message("m1", 100)]);
        let ttl = EntityType::Message.default_ttl();

        clock.set(T0 + ttl.as_millis() as u64 - 1);
        assert!(cache.get_messages("!a:example.org").is_some());

        clock.set(T0 + ttl.as_millis() as u64 + 1);
        assert!(cache.get_messages("!a:example.org").is_none());
    }

    #[test]
    fn each_entity_type_uses_its_own_ttl() {
        let clock = ManualClock::new(T0);
        let cache = cache(Arc::new(InMemoryDurableStore::default()), &clock);
        cache.put_membership("!a:example.org", RoomMembership::Joined);
        cache.put_room(&RoomSummary::new("!a:example.org", RoomMembership::Joined));

        clock.advance(Duration::from_millis(7 * HOUR_MS));
        assert_eq!(cache.get_membership("!a:example.org"), None);
        assert!(cache.get_room("!a:example.org").is_some());

        clock.advance(Duration::from_millis(6 * HOUR_MS));
        assert!(cache.get_room("!a:example.org").is_none());
    }

    #[test]
    fn expired_durable_records_are_not_rehydrated() {
        let clock = ManualClock::new(T0);
        let durable: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::default());
        cache(Arc::clone(&durable), &clock).put_messages("!a:example.org", &[message("m1", 100)]);

        clock.advance(Duration::from_millis(25 * HOUR_MS));
        assert!(cache(durable, &clock).get_messages("!a:example.org").is_none());
    }

    #[test]
    fn invalidate_is_scoped_to_one_conversation() {
        let clock = ManualClock::new(T0);
        let durable = Arc::new(InMemoryDurableStore::default());
        let cache = cache(durable.clone(), &clock);
        cache.put_messages("!a:example.org", &[message("m1", 100)]);
        cache.put_messages("!b:example.org", &[message("x1", 100)]);
        cache.put_media(
            "!a:example.org",
            &[MediaRecord {
                uri: "mxc://example.org/abc".into(),
                event_id: "m1".into(),
                mimetype: None,
                size: None,
            }],
        );

        cache.invalidate("!a:example.org");
        assert!(cache.get_messages("!a:example.org").is_none());
        assert!(cache.get_messages("!b:example.org").is_some());
        assert_eq!(cache.get_media("!a:example.org").len(), 1);
        assert!(
            durable
                .scan("message", "!a:example.org")
                .expect("scan should work")
                .is_empty()
        );
    }

    #[test]
    fn sweep_purges_both_tiers() {
        let clock = ManualClock::new(T0);
        let durable = Arc::new(InMemoryDurableStore::default());
        let cache = cache(durable.clone(), &clock);
        cache.put_membership("!a:example.org", RoomMembership::Joined);
        cache.put_messages("!a:example.org", &[message("m1", 100)]);

        clock.advance(Duration::from_millis(7 * HOUR_MS));
        let report = cache.sweep_expired();
        assert_eq!(report, SweepReport { memory: 1, durable: 1 });
        assert_eq!(durable.len(), 1);
    }

    #[test]
    fn evicted_memory_is_served_again_from_durable() {
        let clock = ManualClock::new(T0);
        let cache = cache(Arc::new(InMemoryDurableStore::default()), &clock);
        cache.put_messages("!a:example.org", &[message("m1", 100)]);
        cache.evict_memory("!a:example.org");
        assert!(cache.get_messages("!a:example.org").is_some());
    }

    #[test]
    fn entries_carry_cache_stamps() {
        let clock = ManualClock::new(T0);
        let cache = cache(Arc::new(InMemoryDurableStore::default()), &clock);
        cache.put_messages("!a:example.org", &[message("m1", 100)]);
        let entries = cache.message_entries("!a:example.org");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cached_at_ms, T0);
        assert!(entries[0].expires_at_ms > entries[0].cached_at_ms);
    }
}
