//! Background synchronization for subscribed conversations.
//!
//! One [`SyncCoordinator`] drives at most one loop task. Loops across
//! coordinators are serialized through a shared [`CoordinatorRegistry`]: a
//! new loop start cancels whichever loop held the registry before it.

use std::{
    collections::{HashMap, HashSet, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use backend_core::{
    BackendError, BackendErrorCategory, LoadOptions, Message, RoomMembership, SubscribeOptions,
    SyncEvent, SyncEventBus, SyncLifecycleState, SyncStateMachine, SyncStatus, SyncTrigger,
};
use tokio::{sync::Notify, task::AbortHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::CoordinatorConfig,
    governor::{ConnectionGovernor, Endpoint, HeartbeatOutcome},
    loader::MultiStrategyMessageLoader,
    transport::LiveBatch,
};

/// Hands out loop ownership; at most one loop holds it at a time.
#[derive(Clone, Default)]
pub struct CoordinatorRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_owner: AtomicU64,
    next_generation: AtomicU64,
    active: Mutex<Option<RegisteredLoop>>,
}

struct RegisteredLoop {
    owner: u64,
    generation: u64,
    stop: CancellationToken,
}

/// Proof of loop ownership returned by [`CoordinatorRegistry::claim`].
#[derive(Debug, Clone)]
pub struct LoopLease {
    pub generation: u64,
    pub stop: CancellationToken,
}

impl CoordinatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register_owner(&self) -> u64 {
        self.inner.next_owner.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Take loop ownership for `owner`, stopping the previous holder.
    pub fn claim(&self, owner: u64) -> LoopLease {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let stop = CancellationToken::new();
        let previous = lock(&self.inner.active).replace(RegisteredLoop {
            owner,
            generation,
            stop: stop.clone(),
        });
        if let Some(previous) = previous {
            if previous.owner != owner {
                info!(
                    previous_owner = previous.owner,
                    owner, "stopping sync loop of another coordinator"
                );
            }
            previous.stop.cancel();
        }
        LoopLease { generation, stop }
    }

    /// Give up ownership if `generation` still holds it.
    pub fn release(&self, generation: u64) {
        let mut active = lock(&self.inner.active);
        if active.as_ref().is_some_and(|l| l.generation == generation) {
            *active = None;
        }
    }

    /// Owner id of the loop currently holding the registry.
    pub fn active_owner(&self) -> Option<u64> {
        lock(&self.inner.active).as_ref().map(|l| l.owner)
    }
}

struct RunningLoop {
    generation: u64,
    stop: CancellationToken,
    abort: AbortHandle,
}

#[derive(Default)]
struct CoordinatorState {
    machine: SyncStateMachine,
    /// Subscription order.
    subscriptions: Vec<String>,
    active_room: Option<String>,
    fingerprints: HashMap<String, u64>,
    notified_invites: HashSet<String>,
    since: Option<String>,
    running: Option<RunningLoop>,
    last_start: Option<Instant>,
    start_pending: bool,
    cycle_started: Option<Instant>,
    successful_cycles: u32,
    shut_down: bool,
}

impl CoordinatorState {
    fn is_subscribed(&self, room_id: &str) -> bool {
        self.subscriptions.iter().any(|r| r == room_id)
    }

    /// Active room first, then the rest in subscription order.
    fn load_order(&self) -> Vec<String> {
        let mut order = Vec::with_capacity(self.subscriptions.len());
        if let Some(active) = &self.active_room {
            order.push(active.clone());
        }
        order.extend(
            self.subscriptions
                .iter()
                .filter(|r| Some(*r) != self.active_room.as_ref())
                .cloned(),
        );
        order
    }
}

struct CoordinatorInner {
    owner: u64,
    loader: MultiStrategyMessageLoader,
    governor: ConnectionGovernor,
    events: SyncEventBus,
    config: CoordinatorConfig,
    registry: CoordinatorRegistry,
    state: Mutex<CoordinatorState>,
    wake: Notify,
}

/// Drives the sync loop and republishes results as [`SyncEvent`]s.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    pub fn new(
        loader: MultiStrategyMessageLoader,
        events: SyncEventBus,
        config: CoordinatorConfig,
        registry: CoordinatorRegistry,
    ) -> Self {
        let governor = loader.governor().clone();
        Self {
            inner: Arc::new(CoordinatorInner {
                owner: registry.register_owner(),
                loader,
                governor,
                events,
                config,
                registry,
                state: Mutex::new(CoordinatorState::default()),
                wake: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> SyncLifecycleState {
        self.state_guard().machine.state()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state_guard().subscriptions.clone()
    }

    pub fn active_room(&self) -> Option<String> {
        self.state_guard().active_room.clone()
    }

    pub fn is_subscribed(&self, room_id: &str) -> bool {
        self.state_guard().is_subscribed(room_id)
    }

    /// Id used in the registry for this coordinator.
    pub fn owner_id(&self) -> u64 {
        self.inner.owner
    }

    /// Register interest in a room and make sure the loop runs.
    pub fn subscribe(&self, room_id: &str, options: SubscribeOptions) {
        let wake = {
            let mut state = self.state_guard();
            if state.shut_down {
                warn!(room_id = %room_id, "subscribe after shutdown ignored");
                return;
            }
            let added = !state.is_subscribed(room_id);
            if added {
                state.subscriptions.push(room_id.to_owned());
            }
            if options.prioritize || state.active_room.is_none() {
                state.active_room = Some(room_id.to_owned());
            }
            if added {
                debug!(room_id = %room_id, count = state.subscriptions.len(), "subscribed");
                self.inner.events.emit(SyncEvent::Subscribed {
                    room_id: room_id.to_owned(),
                });
            }
            added && state.running.is_some()
        };
        self.start();
        if wake {
            self.inner.wake.notify_one();
        }
    }

    /// Drop interest in a room. The last unsubscribe stops the loop.
    ///
    /// An in-flight load for the room finishes, but its result is not published.
    pub fn unsubscribe(&self, room_id: &str) {
        let now_empty = {
            let mut state = self.state_guard();
            let before = state.subscriptions.len();
            state.subscriptions.retain(|r| r != room_id);
            if state.subscriptions.len() == before {
                return;
            }
            state.fingerprints.remove(room_id);
            if state.active_room.as_deref() == Some(room_id) {
                state.active_room = state.subscriptions.last().cloned();
            }
            self.inner.events.emit(SyncEvent::Unsubscribed {
                room_id: room_id.to_owned(),
            });
            state.subscriptions.is_empty()
        };
        debug!(room_id = %room_id, "unsubscribed");
        if now_empty {
            self.stop("no subscriptions left");
        }
    }

    /// Start the loop if there is work and no loop is running.
    ///
    /// Starts closer together than the minimum start interval are deferred.
    pub fn start(&self) {
        let mut state = self.state_guard();
        if state.shut_down || state.subscriptions.is_empty() || state.running.is_some() {
            return;
        }

        let wait = state
            .last_start
            .map(|at| self.inner.config.min_start_interval.saturating_sub(at.elapsed()))
            .filter(|wait| !wait.is_zero());
        if let Some(wait) = wait {
            if !state.start_pending {
                state.start_pending = true;
                debug!(delay_ms = wait.as_millis() as u64, "deferring sync loop start");
                let coordinator = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    coordinator.state_guard().start_pending = false;
                    coordinator.start();
                });
            }
            return;
        }

        self.launch_locked(&mut state);
    }

    /// Wake the loop for an immediate cycle.
    pub fn sync_now(&self) {
        self.inner.wake.notify_one();
    }

    /// Stop the loop for good; later subscribes are ignored.
    pub fn shutdown(&self) {
        self.state_guard().shut_down = true;
        self.stop("shutdown");
    }

    fn stop(&self, reason: &'static str) {
        let mut state = self.state_guard();
        let running = state.running.take();
        state.cycle_started = None;
        if let Some(running) = &running {
            running.stop.cancel();
            self.inner.registry.release(running.generation);
        }
        self.transition(&mut state, SyncTrigger::Stop);
        if running.is_some() {
            info!(reason, "sync loop stopped");
            self.publish_status(false, None);
        }
    }

    fn launch_locked(&self, state: &mut CoordinatorState) {
        self.transition(state, SyncTrigger::Subscribe);
        let lease = self.inner.registry.claim(self.inner.owner);
        state.last_start = Some(Instant::now());
        state.cycle_started = None;

        let coordinator = self.clone();
        let stop = lease.stop.clone();
        let generation = lease.generation;
        let task = tokio::spawn(async move { coordinator.run_loop(generation, stop).await });
        state.running = Some(RunningLoop {
            generation,
            stop: lease.stop.clone(),
            abort: task.abort_handle(),
        });

        let watchdog = self.clone();
        tokio::spawn(async move { watchdog.run_watchdog(generation, lease.stop).await });
        info!(generation, owner = self.inner.owner, "sync loop started");
    }

    async fn run_loop(self, generation: u64, stop: CancellationToken) {
        self.publish_status(true, None);
        let policy = self.inner.config.retry_policy();
        let mut attempt: u32 = 0;

        loop {
            if stop.is_cancelled() || !self.begin_cycle(generation) {
                break;
            }

            let result = self.run_cycle(&stop).await;
            let delay = match result {
                Ok(()) => {
                    attempt = 0;
                    self.finish_cycle(generation, SyncTrigger::CycleSucceeded);
                    self.inner.config.idle_interval
                }
                Err(err) => {
                    let delay = policy.delay_for_attempt(attempt, err.retry_after_ms);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        code = %err.code,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "sync cycle failed"
                    );
                    self.inner.events.emit(SyncEvent::SyncError {
                        room_id: None,
                        error: err,
                    });
                    self.finish_cycle(generation, SyncTrigger::CycleFailed);
                    delay
                }
            };
            if stop.is_cancelled() {
                break;
            }
            self.publish_status(true, Some(delay));

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.wake.notified() => debug!("sync cycle requested early"),
            }
        }

        self.loop_exited(generation);
    }

    async fn run_cycle(&self, stop: &CancellationToken) -> Result<(), BackendError> {
        let credentials = self.inner.governor.ensure_valid().await;
        if !credentials.can_sync() {
            debug!("credentials unusable; skipping sync cycle");
            return Ok(());
        }
        if self.inner.governor.heartbeat().await == HeartbeatOutcome::Dead {
            return Err(BackendError::new(
                BackendErrorCategory::Network,
                "transport_unavailable",
                "heartbeat probe and credential refresh both failed",
            ));
        }

        let since = self.state_guard().since.clone();
        let transport = self.inner.governor.transport();
        let batch = self
            .inner
            .governor
            .call(
                Endpoint::Sync,
                transport.sync_live(since.as_deref(), self.inner.config.live_timeout),
            )
            .await?;
        self.apply_live(batch);

        let order = self.state_guard().load_order();
        for room_id in order {
            if stop.is_cancelled() {
                break;
            }
            if !self.is_subscribed(&room_id) {
                continue;
            }
            let options = LoadOptions {
                limit: self.inner.loader.config().default_limit,
                force_refresh: false,
            };
            let report = self.inner.loader.load_with_report(&room_id, options).await;
            if !self.is_subscribed(&room_id) {
                debug!(room_id = %room_id, "dropping load result for unsubscribed room");
                continue;
            }
            for error in report.errors {
                self.inner.events.emit(SyncEvent::SyncError {
                    room_id: Some(room_id.clone()),
                    error,
                });
            }
            self.publish_timeline(&room_id, report.messages);
        }

        let keep: HashSet<String> = self.subscriptions().into_iter().collect();
        let evicted = self
            .inner
            .loader
            .enforce_timeline_limit(self.inner.config.max_timelines, &keep);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted idle timelines");
        }
        Ok(())
    }

    fn apply_live(&self, batch: LiveBatch) {
        let loader = &self.inner.loader;
        for invite in &batch.invites {
            loader.note_membership(&invite.room_id, RoomMembership::Invited);
            let first = self
                .state_guard()
                .notified_invites
                .insert(invite.room_id.clone());
            if first {
                info!(room_id = %invite.room_id, "room invite received");
                self.inner.events.emit(SyncEvent::RoomInvite {
                    room_id: invite.room_id.clone(),
                    inviter: invite.inviter.clone(),
                });
            }
        }
        for room_id in &batch.left {
            loader.note_membership(room_id, RoomMembership::Left);
            self.state_guard().notified_invites.remove(room_id);
        }
        for update in &batch.joined {
            loader.note_membership(&update.room_id, RoomMembership::Joined);
            let subscribed = {
                let mut state = self.state_guard();
                state.notified_invites.remove(&update.room_id);
                state.is_subscribed(&update.room_id)
            };
            if !subscribed && !loader.has_timeline(&update.room_id) {
                continue;
            }
            if let Some(messages) = loader.ingest_live(update)
                && subscribed
            {
                self.publish_timeline(&update.room_id, messages);
            }
        }
        self.state_guard().since = Some(batch.next_batch);
    }

    /// Emit `TimelineUpdated` when the room's timeline differs from the last one sent.
    pub(crate) fn publish_timeline(&self, room_id: &str, messages: Vec<Message>) {
        let fingerprint = timeline_fingerprint(&messages);
        {
            let mut state = self.state_guard();
            if !state.is_subscribed(room_id) {
                return;
            }
            if state.fingerprints.get(room_id) == Some(&fingerprint) {
                return;
            }
            state.fingerprints.insert(room_id.to_owned(), fingerprint);
        }
        debug!(room_id = %room_id, count = messages.len(), "timeline updated");
        self.inner.events.emit(SyncEvent::TimelineUpdated {
            room_id: room_id.to_owned(),
            messages,
        });
    }

    fn begin_cycle(&self, generation: u64) -> bool {
        let mut state = self.state_guard();
        if !state
            .running
            .as_ref()
            .is_some_and(|r| r.generation == generation)
        {
            return false;
        }
        if !self.transition(&mut state, SyncTrigger::CycleBegin) {
            return false;
        }
        state.cycle_started = Some(Instant::now());
        true
    }

    fn finish_cycle(&self, generation: u64, trigger: SyncTrigger) {
        let sweep = {
            let mut state = self.state_guard();
            if !state
                .running
                .as_ref()
                .is_some_and(|r| r.generation == generation)
            {
                return;
            }
            state.cycle_started = None;
            self.transition(&mut state, trigger);
            if trigger != SyncTrigger::CycleSucceeded {
                false
            } else {
                state.successful_cycles = state.successful_cycles.wrapping_add(1);
                let every = self.inner.config.cache_sweep_every;
                every > 0 && state.successful_cycles % every == 0
            }
        };
        if sweep {
            let report = self.inner.loader.cache().sweep_expired();
            debug!(memory = report.memory, durable = report.durable, "swept expired cache entries");
        }
    }

    fn loop_exited(&self, generation: u64) {
        let mut state = self.state_guard();
        if !state
            .running
            .as_ref()
            .is_some_and(|r| r.generation == generation)
        {
            return;
        }
        state.running = None;
        state.cycle_started = None;
        self.inner.registry.release(generation);
        self.transition(&mut state, SyncTrigger::Stop);
        info!(generation, "sync loop preempted");
        self.publish_status(false, None);
    }

    /// Restart the loop when a cycle has been in progress past the ceiling.
    async fn run_watchdog(self, generation: u64, stop: CancellationToken) {
        let ceiling = self.inner.config.watchdog_ceiling;
        let period = (ceiling / 4).max(Duration::from_millis(250));
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }

            let mut state = self.state_guard();
            let Some(running) = state.running.as_ref() else {
                return;
            };
            if running.generation != generation {
                return;
            }
            let stalled = state
                .cycle_started
                .is_some_and(|started| started.elapsed() >= ceiling);
            if !stalled {
                continue;
            }

            warn!(
                generation,
                ceiling_ms = ceiling.as_millis() as u64,
                "sync cycle stalled; restarting loop"
            );
            if let Some(running) = state.running.take() {
                running.abort.abort();
                running.stop.cancel();
                self.inner.registry.release(running.generation);
            }
            state.cycle_started = None;
            self.transition(&mut state, SyncTrigger::WatchdogReset);
            self.launch_locked(&mut state);
            return;
        }
    }

    /// Apply a lifecycle trigger and publish the transition.
    ///
    /// Returns `false` when the trigger is not valid in the current state.
    fn transition(&self, state: &mut CoordinatorState, trigger: SyncTrigger) -> bool {
        match state.machine.apply(trigger) {
            Ok(Some(event)) => {
                debug!(?trigger, state = ?state.machine.state(), "sync state changed");
                self.inner.events.emit(event);
                true
            }
            Ok(None) => true,
            Err(err) => {
                debug!(?trigger, code = %err.code, "ignored lifecycle trigger");
                false
            }
        }
    }

    fn publish_status(&self, running: bool, delay: Option<Duration>) {
        self.inner.events.emit(SyncEvent::SyncStatus(SyncStatus {
            running,
            lag_hint_ms: delay.map(|d| d.as_millis() as u64),
        }));
    }

    fn state_guard(&self) -> MutexGuard<'_, CoordinatorState> {
        lock(&self.inner.state)
    }
}

fn timeline_fingerprint(messages: &[Message]) -> u64 {
    let mut hasher = DefaultHasher::new();
    messages.len().hash(&mut hasher);
    for message in messages {
        message.id.hash(&mut hasher);
        message.timestamp_ms.hash(&mut hasher);
        message.reactions.len().hash(&mut hasher);
    }
    hasher.finish()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
