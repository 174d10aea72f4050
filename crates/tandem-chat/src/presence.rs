use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use tandem_kv::KvStore;
use tandem_types::models::{PresenceRecord, now};

use crate::error::{ChatError, ChatResult};

const PRESENCE_PREFIX: &str = "presence:";

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How long a presence key lives without a heartbeat.
    pub ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(180),
        }
    }
}

/// Online/offline state per user, one TTL'd key each. A crashed process
/// stops refreshing its keys and they expire on their own.
pub struct PresenceTracker {
    kv: Arc<dyn KvStore>,
    config: PresenceConfig,
}

fn presence_key(user_id: Uuid) -> String {
    format!("{PRESENCE_PREFIX}{user_id}")
}

impl PresenceTracker {
    pub fn new(kv: Arc<dyn KvStore>, config: PresenceConfig) -> Self {
        Self { kv, config }
    }

    /// Write (or overwrite) the user's record and reset its TTL.
    pub async fn set_online(&self, user_id: Uuid, connection_id: Uuid) -> ChatResult<()> {
        let record = PresenceRecord {
            connection_id,
            last_seen: now(),
            online: true,
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| ChatError::Store(e.into()))?;
        self.kv
            .set_ex(&presence_key(user_id), &value, self.config.ttl)
            .await?;
        debug!("User {} online via connection {}", user_id, connection_id);
        Ok(())
    }

    /// Heartbeat: same write as [`set_online`](Self::set_online).
    pub async fn refresh(&self, user_id: Uuid, connection_id: Uuid) -> ChatResult<()> {
        self.set_online(user_id, connection_id).await
    }

    pub async fn set_offline(&self, user_id: Uuid) -> ChatResult<()> {
        self.kv.del(&presence_key(user_id)).await?;
        debug!("User {} offline", user_id);
        Ok(())
    }

    pub async fn record(&self, user_id: Uuid) -> ChatResult<Option<PresenceRecord>> {
        let Some(raw) = self.kv.get(&presence_key(user_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Unreadable presence record for {}: {}", user_id, e);
                Ok(None)
            }
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> ChatResult<bool> {
        Ok(self.kv.get(&presence_key(user_id)).await?.is_some())
    }

    /// Status of many users with a single batched read.
    pub async fn bulk_status(&self, user_ids: &[Uuid]) -> ChatResult<HashMap<Uuid, bool>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = user_ids.iter().copied().map(presence_key).collect();
        let values = self.kv.mget(&keys).await?;

        Ok(user_ids
            .iter()
            .copied()
            .zip(values)
            .map(|(id, value)| (id, value.is_some()))
            .collect())
    }

    /// Every user with a live presence key.
    pub async fn all_online(&self) -> ChatResult<Vec<Uuid>> {
        let keys = self.kv.scan(&format!("{PRESENCE_PREFIX}*")).await?;
        let mut users: Vec<Uuid> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(PRESENCE_PREFIX))
            .filter_map(|id| id.parse().ok())
            .collect();
        users.sort();
        Ok(users)
    }
}
