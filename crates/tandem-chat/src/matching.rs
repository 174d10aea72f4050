use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tandem_kv::KvStore;
use tandem_types::events::{GatewayEvent, Topic};
use tandem_types::models::{
    AgeGroup, ChatMessage, ChatRoom, GenderPreference, MatchPreferences, WaitingCandidate, now,
};

use crate::buffer::MessageBuffer;
use crate::error::{ChatError, ChatResult};
use crate::fanout::EventSink;
use crate::lifecycle::{MATCHED_ROOM_CAPACITY, RoomLifecycle};
use crate::store::ChatStore;

const MATCHED_NOTICE: &str = "You have been matched. Say hi!";

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Prefix of the per-partition list keys.
    pub key_prefix: String,
    pub pairing_interval: Duration,
    /// Drop candidates that waited longer than this. `None` waits forever.
    pub match_timeout: Option<Duration>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            key_prefix: "matching:queue".to_string(),
            pairing_interval: Duration::from_millis(500),
            match_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub queue: String,
    /// 1-based position within the partition.
    pub position: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairingReport {
    pub rooms_created: usize,
    /// Candidates pushed back after a block, a gender mismatch or a failed
    /// room insert.
    pub requeued: usize,
    pub expired: usize,
    pub malformed: usize,
    /// Partitions whose processing hit a KV error this cycle.
    pub failed_queues: usize,
}

impl PairingReport {
    fn absorb(&mut self, other: PairingReport) {
        self.rooms_created += other.rooms_created;
        self.requeued += other.requeued;
        self.expired += other.expired;
        self.malformed += other.malformed;
        self.failed_queues += other.failed_queues;
    }
}

/// FIFO waiting lines, one per (age group, gender preference), plus the
/// pairing pass that turns the two oldest compatible candidates into a room.
///
/// All queue state is in the KV store. Pops are exclusive, so several
/// processes may run the pairing loop against the same queues.
pub struct MatchingQueue {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn ChatStore>,
    lifecycle: RoomLifecycle,
    events: Arc<dyn EventSink>,
    buffer: MessageBuffer,
    config: MatchingConfig,
}

impl MatchingQueue {
    pub fn new(
        kv: Arc<dyn KvStore>,
        store: Arc<dyn ChatStore>,
        lifecycle: RoomLifecycle,
        events: Arc<dyn EventSink>,
        buffer: MessageBuffer,
        config: MatchingConfig,
    ) -> Self {
        Self {
            kv,
            store,
            lifecycle,
            events,
            buffer,
            config,
        }
    }

    pub fn queue_key(&self, age_group: AgeGroup, preference: GenderPreference) -> String {
        format!("{}:{}:{}", self.config.key_prefix, age_group, preference)
    }

    fn queue_keys(&self) -> Vec<String> {
        AgeGroup::ALL
            .iter()
            .flat_map(|age| {
                GenderPreference::ALL
                    .iter()
                    .map(move |pref| self.queue_key(*age, *pref))
            })
            .collect()
    }

    /// Descriptors currently in `key`, oldest first, paired with their raw form.
    async fn entries(&self, key: &str) -> ChatResult<Vec<(String, Option<WaitingCandidate>)>> {
        let raw = self.kv.lrange(key, 0, -1).await?;
        Ok(raw
            .into_iter()
            .map(|entry| {
                let parsed = serde_json::from_str(&entry).ok();
                (entry, parsed)
            })
            .collect())
    }

    /// Where `user_id` waits, as (queue key, 1-based position).
    pub async fn position(&self, user_id: Uuid) -> ChatResult<Option<EnqueueOutcome>> {
        for key in self.queue_keys() {
            let entries = self.entries(&key).await?;
            if let Some(index) = entries
                .iter()
                .position(|(_, c)| c.as_ref().is_some_and(|c| c.user_id == user_id))
            {
                return Ok(Some(EnqueueOutcome {
                    queue: key,
                    position: index + 1,
                }));
            }
        }
        Ok(None)
    }

    pub async fn queue_lengths(&self) -> ChatResult<Vec<(String, usize)>> {
        let mut lengths = Vec::new();
        for key in self.queue_keys() {
            let len = self.kv.llen(&key).await?;
            lengths.push((key, len));
        }
        Ok(lengths)
    }

    /// Admit a user into the partition for their preferences. A user waits
    /// in at most one partition at a time.
    pub async fn enqueue(
        &self,
        user_id: Uuid,
        preferences: MatchPreferences,
    ) -> ChatResult<EnqueueOutcome> {
        if preferences.capacity != MATCHED_ROOM_CAPACITY {
            return Err(ChatError::Validation(format!(
                "matched rooms hold exactly {MATCHED_ROOM_CAPACITY} participants, got capacity {}",
                preferences.capacity
            )));
        }
        let profile = self
            .store
            .user_profile(user_id)
            .await?
            .ok_or(ChatError::NotFound("user"))?;
        if profile.age_group != preferences.age_group {
            return Err(ChatError::Validation(format!(
                "age group {} does not match the user's profile",
                preferences.age_group
            )));
        }

        if self.position(user_id).await?.is_some() {
            return Err(ChatError::AlreadyInQueue);
        }

        let candidate = WaitingCandidate {
            user_id,
            gender: profile.gender,
            blocked_user_ids: self.store.blocked_ids(user_id).await?,
            age_group: preferences.age_group,
            gender_preference: preferences.gender_preference,
            capacity: preferences.capacity,
            enqueued_at: now(),
        };
        let raw = serde_json::to_string(&candidate).map_err(|e| ChatError::Store(e.into()))?;
        let key = self.queue_key(preferences.age_group, preferences.gender_preference);
        let position = self.kv.rpush(&key, &raw).await?;

        debug!("User {} queued in {} at position {}", user_id, key, position);
        Ok(EnqueueOutcome { queue: key, position })
    }

    /// Remove the user's descriptor. Returns false if they were not queued.
    pub async fn cancel(&self, user_id: Uuid) -> ChatResult<bool> {
        for key in self.queue_keys() {
            for (raw, candidate) in self.entries(&key).await? {
                if candidate.is_some_and(|c| c.user_id == user_id)
                    && self.kv.lrem(&key, &raw).await? > 0
                {
                    debug!("User {} left matching queue {}", user_id, key);
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// One pass over every partition. Errors are contained per partition.
    pub async fn run_pairing_cycle(&self) -> PairingReport {
        let mut report = PairingReport::default();
        for key in self.queue_keys() {
            let mut partial = PairingReport::default();
            let result = match self.config.match_timeout {
                Some(timeout) => self.drop_expired(&key, timeout, &mut partial).await,
                None => Ok(()),
            };
            let result = match result {
                Ok(()) => self.pair_queue(&key, &mut partial).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!("Pairing failed for {}: {}", key, e);
                partial.failed_queues += 1;
            }
            report.absorb(partial);
        }
        report
    }

    async fn drop_expired(
        &self,
        key: &str,
        timeout: Duration,
        report: &mut PairingReport,
    ) -> ChatResult<()> {
        let Ok(limit) = chrono::Duration::from_std(timeout) else {
            return Ok(());
        };
        let cutoff = now() - limit;

        for (raw, candidate) in self.entries(key).await? {
            let Some(candidate) = candidate else { continue };
            if candidate.enqueued_at >= cutoff {
                continue;
            }
            // Lost the race to a concurrent pop or cancel: nothing to report.
            if self.kv.lrem(key, &raw).await? == 0 {
                continue;
            }
            info!("User {} timed out in {}", candidate.user_id, key);
            self.events
                .emit(Topic::User(candidate.user_id), GatewayEvent::MatchingTimeout)
                .await;
            report.expired += 1;
        }
        Ok(())
    }

    async fn pair_queue(&self, key: &str, report: &mut PairingReport) -> ChatResult<()> {
        // Bounded so a queue of mutually blocked candidates cannot spin.
        let attempts = self.kv.llen(key).await? / 2;

        for _ in 0..attempts {
            let popped = self.kv.lpop(key, 2).await?;
            let (first_raw, second_raw) = match popped.as_slice() {
                [first, second] => (first.clone(), second.clone()),
                [only] => {
                    // Someone else popped concurrently; keep the lone
                    // candidate's seniority.
                    self.kv.lpush(key, only).await?;
                    break;
                }
                _ => break,
            };

            let first = serde_json::from_str::<WaitingCandidate>(&first_raw);
            let second = serde_json::from_str::<WaitingCandidate>(&second_raw);
            let (first, second) = match (first, second) {
                (Ok(first), Ok(second)) => (first, second),
                (first, second) => {
                    for (raw, parsed) in [(&second_raw, second.is_ok()), (&first_raw, first.is_ok())] {
                        if parsed {
                            self.kv.lpush(key, raw).await?;
                        } else {
                            warn!("Dropping malformed candidate in {}: {}", key, raw);
                            report.malformed += 1;
                        }
                    }
                    continue;
                }
            };

            if first.blocks(&second.user_id) || second.blocks(&first.user_id) {
                debug!("Skipping blocked pair {} / {}", first.user_id, second.user_id);
                self.kv.rpush(key, &first_raw).await?;
                self.kv.rpush(key, &second_raw).await?;
                report.requeued += 2;
                continue;
            }

            if !first.gender_preference.accepts(first.gender, second.gender) {
                self.kv.rpush(key, &first_raw).await?;
                self.kv.rpush(key, &second_raw).await?;
                report.requeued += 2;
                continue;
            }

            match self.lifecycle.open_matched_room(&first, &second).await {
                Ok(room) => {
                    self.announce(&room).await;
                    report.rooms_created += 1;
                }
                Err(e) => {
                    warn!(
                        "Room creation failed for {} / {}, requeueing: {}",
                        first.user_id, second.user_id, e
                    );
                    self.kv.lpush(key, &second_raw).await?;
                    self.kv.lpush(key, &first_raw).await?;
                    report.requeued += 2;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn announce(&self, room: &ChatRoom) {
        for user_id in &room.participant_ids {
            self.events
                .emit(
                    Topic::User(*user_id),
                    GatewayEvent::MatchingSuccess {
                        room_id: room.id,
                        participant_ids: room.participant_ids.clone(),
                    },
                )
                .await;
        }

        let notice = ChatMessage::system(room.id, MATCHED_NOTICE);
        let event = GatewayEvent::SystemMessage {
            id: notice.id,
            room_id: room.id,
            text: MATCHED_NOTICE.to_string(),
            sent_at: notice.sent_at,
        };
        if let Err(e) = self.buffer.add_message(notice).await {
            warn!("Could not store match notice for room {}: {}", room.id, e);
        }
        self.events.emit(Topic::Room(room.id), event).await;
    }

    /// Pairing loop. Stops between cycles once `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.pairing_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Matching loop started ({:?} interval)", self.config.pairing_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.run_pairing_cycle().await;
                    if report != PairingReport::default() {
                        debug!("Pairing cycle: {:?}", report);
                    }
                }
            }
        }

        info!("Matching loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;
    use crate::store::SqliteStore;
    use crate::testing::{RecordingSink, add_user, sqlite};
    use tandem_db::Database;
    use tandem_kv::MemoryStore;
    use tandem_types::models::{Gender, RoomPhase};

    struct Harness {
        db: Arc<Database>,
        store: Arc<SqliteStore>,
        kv: Arc<MemoryStore>,
        events: Arc<RecordingSink>,
        queue: Arc<MatchingQueue>,
    }

    fn harness(config: MatchingConfig) -> Harness {
        let (db, store) = sqlite();
        let kv = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingSink::default());
        let buffer = MessageBuffer::new(kv.clone(), store.clone(), BufferConfig::default());
        let queue = Arc::new(MatchingQueue::new(
            kv.clone(),
            store.clone(),
            RoomLifecycle::new(store.clone()),
            events.clone(),
            buffer,
            config,
        ));
        Harness {
            db,
            store,
            kv,
            events,
            queue,
        }
    }

    fn prefs(pref: GenderPreference) -> MatchPreferences {
        MatchPreferences {
            age_group: AgeGroup::Adult,
            gender_preference: pref,
            capacity: 2,
        }
    }

    impl Harness {
        fn matched_rooms(&self) -> Vec<(Uuid, Vec<Uuid>)> {
            let mut rooms: Vec<(Uuid, Vec<Uuid>)> = self
                .events
                .events()
                .into_iter()
                .filter_map(|(_, event)| match event {
                    GatewayEvent::MatchingSuccess {
                        room_id,
                        participant_ids,
                    } => Some((room_id, participant_ids)),
                    _ => None,
                })
                .collect();
            rooms.dedup();
            rooms
        }

        async fn waiting(&self, pref: GenderPreference) -> Vec<Uuid> {
            let key = self.queue.queue_key(AgeGroup::Adult, pref);
            self.queue
                .entries(&key)
                .await
                .unwrap()
                .into_iter()
                .filter_map(|(_, c)| c.map(|c| c.user_id))
                .collect()
        }
    }

    #[tokio::test]
    async fn opposite_preference_pair_becomes_active_room() {
        let h = harness(MatchingConfig::default());
        let x = add_user(&h.db, "x", Gender::Male);
        let y = add_user(&h.db, "y", Gender::Female);
        h.queue.enqueue(x, prefs(GenderPreference::Opposite)).await.unwrap();
        let second = h.queue.enqueue(y, prefs(GenderPreference::Opposite)).await.unwrap();
        assert_eq!(second.position, 2);

        let report = h.queue.run_pairing_cycle().await;
        assert_eq!(report.rooms_created, 1);

        let rooms = h.matched_rooms();
        assert_eq!(rooms.len(), 1);
        let room = h.store.get_room(rooms[0].0).await.unwrap().unwrap();
        assert_eq!(room.participant_ids, vec![x, y]);
        assert_eq!(room.status, RoomPhase::Active);
        assert!(room.is_active);

        assert_eq!(h.events.to_user(x).len(), 1);
        assert_eq!(h.events.to_user(y).len(), 1);
        assert!(h.waiting(GenderPreference::Opposite).await.is_empty());
    }

    #[tokio::test]
    async fn second_enqueue_is_rejected_without_side_effect() {
        let h = harness(MatchingConfig::default());
        let user = add_user(&h.db, "u", Gender::Male);
        h.queue.enqueue(user, prefs(GenderPreference::Any)).await.unwrap();

        let err = h.queue.enqueue(user, prefs(GenderPreference::Same)).await.unwrap_err();
        assert!(matches!(err, ChatError::AlreadyInQueue));
        assert_eq!(err.code(), "ALREADY_IN_QUEUE");

        let total: usize = h.queue.queue_lengths().await.unwrap().iter().map(|(_, n)| n).sum();
        assert_eq!(total, 1);
        assert!(h.waiting(GenderPreference::Same).await.is_empty());
    }

    #[tokio::test]
    async fn oldest_compatible_pair_goes_first() {
        let h = harness(MatchingConfig::default());
        let a = add_user(&h.db, "a", Gender::Male);
        let b = add_user(&h.db, "b", Gender::Female);
        let c = add_user(&h.db, "c", Gender::Male);
        for user in [a, b, c] {
            h.queue.enqueue(user, prefs(GenderPreference::Any)).await.unwrap();
        }

        h.queue.run_pairing_cycle().await;

        let rooms = h.matched_rooms();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].1, vec![a, b]);
        let pos = h.queue.position(c).await.unwrap().unwrap();
        assert_eq!(pos.position, 1);
    }

    #[tokio::test]
    async fn blocked_pair_is_sent_to_the_back() {
        let h = harness(MatchingConfig::default());
        let a = add_user(&h.db, "a", Gender::Male);
        let b = add_user(&h.db, "b", Gender::Female);
        let c = add_user(&h.db, "c", Gender::Female);
        h.db.block_user(b, a).unwrap();
        for user in [a, b, c] {
            h.queue.enqueue(user, prefs(GenderPreference::Any)).await.unwrap();
        }

        let report = h.queue.run_pairing_cycle().await;

        assert_eq!(report.rooms_created, 0);
        assert_eq!(report.requeued, 2);
        assert!(h.matched_rooms().is_empty());
        assert_eq!(h.waiting(GenderPreference::Any).await, vec![c, a, b]);
    }

    #[tokio::test]
    async fn block_created_after_enqueue_is_not_seen_by_pairing() {
        let h = harness(MatchingConfig::default());
        let a = add_user(&h.db, "a", Gender::Male);
        let b = add_user(&h.db, "b", Gender::Female);
        h.queue.enqueue(a, prefs(GenderPreference::Any)).await.unwrap();
        h.queue.enqueue(b, prefs(GenderPreference::Any)).await.unwrap();
        h.db.block_user(a, b).unwrap();

        assert_eq!(h.queue.run_pairing_cycle().await.rooms_created, 1);
    }

    #[tokio::test]
    async fn first_candidates_preference_gates_the_match() {
        let h = harness(MatchingConfig::default());
        let a = add_user(&h.db, "a", Gender::Male);
        let b = add_user(&h.db, "b", Gender::Female);
        h.queue.enqueue(a, prefs(GenderPreference::Same)).await.unwrap();
        h.queue.enqueue(b, prefs(GenderPreference::Same)).await.unwrap();

        let report = h.queue.run_pairing_cycle().await;
        assert_eq!(report.rooms_created, 0);
        assert_eq!(h.waiting(GenderPreference::Same).await, vec![a, b]);
    }

    #[tokio::test]
    async fn failed_room_insert_requeues_both_in_order() {
        let h = harness(MatchingConfig::default());
        let x = add_user(&h.db, "x", Gender::Male);
        let y = add_user(&h.db, "y", Gender::Female);
        h.queue.enqueue(x, prefs(GenderPreference::Any)).await.unwrap();
        h.queue.enqueue(y, prefs(GenderPreference::Any)).await.unwrap();
        h.db.with_conn(|conn| {
            conn.execute_batch("DROP TABLE room_participants; DROP TABLE chat_rooms;")?;
            Ok(())
        })
        .unwrap();

        let report = h.queue.run_pairing_cycle().await;
        assert_eq!(report.rooms_created, 0);
        assert_eq!(report.requeued, 2);
        assert_eq!(h.waiting(GenderPreference::Any).await, vec![x, y]);
    }

    #[tokio::test]
    async fn malformed_descriptor_does_not_stop_other_queues() {
        let h = harness(MatchingConfig::default());
        let same_key = h.queue.queue_key(AgeGroup::Adult, GenderPreference::Same);
        h.kv.rpush(&same_key, "garbage").await.unwrap();
        h.kv.rpush(&same_key, "more garbage").await.unwrap();

        let a = add_user(&h.db, "a", Gender::Male);
        let b = add_user(&h.db, "b", Gender::Female);
        h.queue.enqueue(a, prefs(GenderPreference::Opposite)).await.unwrap();
        h.queue.enqueue(b, prefs(GenderPreference::Opposite)).await.unwrap();

        let report = h.queue.run_pairing_cycle().await;
        assert_eq!(report.malformed, 2);
        assert_eq!(report.rooms_created, 1);
        assert_eq!(h.kv.llen(&same_key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let h = harness(MatchingConfig::default());
        let user = add_user(&h.db, "u", Gender::Female);
        h.queue.enqueue(user, prefs(GenderPreference::Any)).await.unwrap();

        assert!(h.queue.cancel(user).await.unwrap());
        assert!(!h.queue.cancel(user).await.unwrap());
        assert!(h.queue.position(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_validates_preferences() {
        let h = harness(MatchingConfig::default());
        let user = add_user(&h.db, "u", Gender::Female);

        for capacity in [1, 3] {
            let mut bad = prefs(GenderPreference::Any);
            bad.capacity = capacity;
            assert!(matches!(
                h.queue.enqueue(user, bad).await.unwrap_err(),
                ChatError::Validation(_)
            ));
        }
        assert!(h.queue.position(user).await.unwrap().is_none());

        let mut minor = prefs(GenderPreference::Any);
        minor.age_group = AgeGroup::Minor;
        assert!(matches!(
            h.queue.enqueue(user, minor).await.unwrap_err(),
            ChatError::Validation(_)
        ));

        assert!(matches!(
            h.queue
                .enqueue(Uuid::new_v4(), prefs(GenderPreference::Any))
                .await
                .unwrap_err(),
            ChatError::NotFound("user")
        ));
    }

    #[tokio::test]
    async fn expired_candidates_are_dropped_and_told() {
        let h = harness(MatchingConfig {
            match_timeout: Some(Duration::from_millis(5)),
            ..MatchingConfig::default()
        });
        let user = add_user(&h.db, "u", Gender::Female);
        h.queue.enqueue(user, prefs(GenderPreference::Any)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let report = h.queue.run_pairing_cycle().await;
        assert_eq!(report.expired, 1);
        assert_eq!(h.events.to_user(user), vec![GatewayEvent::MatchingTimeout]);
        assert!(h.queue.position(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn loop_pairs_until_cancelled() {
        let h = harness(MatchingConfig {
            pairing_interval: Duration::from_millis(10),
            ..MatchingConfig::default()
        });
        let a = add_user(&h.db, "a", Gender::Male);
        let b = add_user(&h.db, "b", Gender::Female);
        h.queue.enqueue(a, prefs(GenderPreference::Any)).await.unwrap();
        h.queue.enqueue(b, prefs(GenderPreference::Any)).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(h.queue.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(h.matched_rooms().len(), 1);
    }
}
