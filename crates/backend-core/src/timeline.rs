use std::collections::{HashMap, HashSet};

use crate::{
    normalization::NormalizedBatch,
    types::{Message, Reaction},
};

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    /// Incoming messages whose id was already present.
    pub duplicates: usize,
    pub reactions_applied: usize,
    /// Reactions parked until their target is loaded.
    pub reactions_pending: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.reactions_applied > 0
    }
}

/// Per-conversation timeline: messages sorted by `(timestamp, id)`, unique by id.
#[derive(Debug, Clone)]
pub struct ConversationTimeline {
    room_id: String,
    messages: Vec<Message>,
    ids: HashSet<String>,
    pending_reactions: HashMap<String, Vec<Reaction>>,
    has_more_history: bool,
    back_token: Option<String>,
    last_sync_ms: Option<u64>,
    max_items: usize,
}

impl ConversationTimeline {
    /// Create an empty timeline with an item cap (`max_items >= 1`).
    pub fn new(room_id: impl Into<String>, max_items: usize) -> Self {
        Self {
            room_id: room_id.into(),
            messages: Vec::new(),
            ids: HashSet::new(),
            pending_reactions: HashMap::new(),
            has_more_history: true,
            back_token: None,
            last_sync_ms: None,
            max_items: max_items.max(1),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Messages in display order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn has_more_history(&self) -> bool {
        self.has_more_history
    }

    /// Pagination token for the next backward page.
    pub fn back_token(&self) -> Option<&str> {
        self.back_token.as_deref()
    }

    /// Record the result of a backward page.
    pub fn set_back_token(&mut self, token: Option<String>) {
        self.has_more_history = token.is_some();
        self.back_token = token;
    }

    pub fn last_sync_ms(&self) -> Option<u64> {
        self.last_sync_ms
    }

    pub fn mark_synced(&mut self, now_ms: u64) {
        self.last_sync_ms = Some(now_ms);
    }

    /// Targets of reactions whose message is not loaded yet.
    pub fn unresolved_reaction_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.pending_reactions.keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Merge a normalized batch.
    ///
    /// A message already present wins over an incoming copy with the same id;
    /// only its reactions are extended.
    pub fn merge_batch(&mut self, batch: NormalizedBatch) -> MergeOutcome {
        let mut outcome = self.merge_messages(batch.messages);
        for (target_id, reaction) in batch.reactions {
            if self.apply_reaction(&target_id, reaction) {
                outcome.reactions_applied += 1;
            } else {
                outcome.reactions_pending += 1;
            }
        }
        outcome
    }

    /// Merge messages, keeping existing entries for known ids.
    pub fn merge_messages(&mut self, incoming: impl IntoIterator<Item = Message>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for message in incoming {
            if self.ids.contains(&message.id) {
                outcome.duplicates += 1;
                if !message.reactions.is_empty()
                    && let Some(existing) = self.find_mut(&message.id)
                {
                    for reaction in message.reactions {
                        if existing.add_reaction(reaction) {
                            outcome.reactions_applied += 1;
                        }
                    }
                }
                continue;
            }
            outcome.reactions_applied += self.insert_sorted(message);
            outcome.inserted += 1;
        }
        self.trim_to_max();
        outcome
    }

    /// Merge another timeline of the same room, including its parked reactions.
    ///
    /// Cursor and sync stamps of `self` are left alone.
    pub fn merge_timeline(&mut self, other: ConversationTimeline) -> MergeOutcome {
        let mut outcome = self.merge_messages(other.messages);
        for (target_id, reactions) in other.pending_reactions {
            for reaction in reactions {
                if self.apply_reaction(&target_id, reaction) {
                    outcome.reactions_applied += 1;
                } else {
                    outcome.reactions_pending += 1;
                }
            }
        }
        outcome
    }

    /// Attach a reaction to its target, or park it until the target arrives.
    ///
    /// Returns `true` when the target was present.
    pub fn apply_reaction(&mut self, target_id: &str, reaction: Reaction) -> bool {
        if let Some(target) = self.find_mut(target_id) {
            target.add_reaction(reaction);
            return true;
        }
        let pending = self
            .pending_reactions
            .entry(target_id.to_owned())
            .or_default();
        if !pending.contains(&reaction) {
            pending.push(reaction);
        }
        false
    }

    /// Clamp a requested pagination limit against safety and server caps.
    ///
    /// The result is always in `1..=100`.
    pub fn bounded_paginate_limit(requested: u16, server_cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = server_cap.max(1);
        safe_requested.min(safe_cap).min(100)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Insert keeping sort order; returns parked reactions applied to it.
    fn insert_sorted(&mut self, mut message: Message) -> usize {
        let mut applied = 0;
        if let Some(parked) = self.pending_reactions.remove(&message.id) {
            for reaction in parked {
                if message.add_reaction(reaction) {
                    applied += 1;
                }
            }
        }
        let key = (message.timestamp_ms, message.id.clone());
        let idx = self
            .messages
            .partition_point(|m| (m.timestamp_ms, m.id.as_str()) <= (key.0, key.1.as_str()));
        self.ids.insert(message.id.clone());
        self.messages.insert(idx, message);
        applied
    }

    fn trim_to_max(&mut self) {
        if self.messages.len() <= self.max_items {
            return;
        }

        let excess = self.messages.len() - self.max_items;
        for evicted in self.messages.drain(0..excess) {
            self.ids.remove(&evicted.id);
        }
        self.has_more_history = true;
    }
}
