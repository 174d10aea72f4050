use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;
use uuid::Uuid;

use crate::error::ChatResult;
use crate::store::ChatStore;

const UNKNOWN_NAME: &str = "unknown";

/// Short-lived display-name cache for the send path, so a busy room does
/// not cost one user lookup per message.
pub struct NameCache {
    store: Arc<dyn ChatStore>,
    ttl: Duration,
    entries: RwLock<HashMap<Uuid, (String, Instant)>>,
}

impl NameCache {
    pub fn new(store: Arc<dyn ChatStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, user_id: &Uuid) -> Option<String> {
        let entries = self.entries.read().ok()?;
        entries
            .get(user_id)
            .filter(|(_, fetched)| fetched.elapsed() < self.ttl)
            .map(|(name, _)| name.clone())
    }

    /// Display name of `user_id`. Unknown users resolve to a placeholder.
    pub async fn display_name(&self, user_id: Uuid) -> ChatResult<String> {
        if let Some(name) = self.cached(&user_id) {
            return Ok(name);
        }

        let name = self
            .store
            .display_name(user_id)
            .await?
            .unwrap_or_else(|| UNKNOWN_NAME.to_string());

        match self.entries.write() {
            Ok(mut entries) => {
                entries.retain(|_, (_, fetched)| fetched.elapsed() < self.ttl);
                entries.insert(user_id, (name.clone(), Instant::now()));
            }
            Err(e) => warn!("Name cache lock poisoned: {}", e),
        }
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_user, sqlite};
    use tandem_types::models::Gender;

    #[tokio::test]
    async fn serves_cached_name_until_it_expires() {
        let (db, store) = sqlite();
        let cache = NameCache::new(store, Duration::from_millis(200));
        let user = add_user(&db, "Mira", Gender::Female);

        assert_eq!(cache.display_name(user).await.unwrap(), "Mira");

        db.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET display_name = 'Mira K' WHERE id = ?1",
                [user.to_string()],
            )?;
            Ok(())
        })
        .unwrap();
        assert_eq!(cache.display_name(user).await.unwrap(), "Mira");

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(cache.display_name(user).await.unwrap(), "Mira K");
    }

    #[tokio::test]
    async fn unknown_user_gets_placeholder() {
        let (_db, store) = sqlite();
        let cache = NameCache::new(store, Duration::from_secs(60));
        assert_eq!(cache.display_name(Uuid::new_v4()).await.unwrap(), "unknown");
    }
}
