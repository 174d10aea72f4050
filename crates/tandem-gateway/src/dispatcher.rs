use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use tandem_types::events::{GatewayEvent, Topic};

/// Connections held by this process and the channels they listen on.
///
/// Only local state: which socket belongs to which user, and which sockets
/// are attached to which room. Cross-process delivery goes through
/// [`Fanout`](crate::fanout::Fanout), which ends up calling [`deliver`](Self::deliver)
/// on every process.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// conn_id -> (user_id, sender)
    connections: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<GatewayEvent>)>>,

    /// user_id -> conn_ids (one user may have several devices connected)
    user_conns: RwLock<HashMap<Uuid, HashSet<Uuid>>>,

    /// room_id -> conn_ids attached to the room channel
    room_conns: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connections: RwLock::new(HashMap::new()),
                user_conns: RwLock::new(HashMap::new()),
                room_conns: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Bind a new connection to the user's personal channel. Returns
    /// (conn_id, receiver).
    pub async fn register_connection(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .connections
            .write()
            .await
            .insert(conn_id, (user_id, tx));
        self.inner
            .user_conns
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(conn_id);
        (conn_id, rx)
    }

    /// Drop a connection and its room attachments. Returns the user and
    /// whether this was their last connection on this process.
    pub async fn unregister_connection(&self, conn_id: Uuid) -> Option<(Uuid, bool)> {
        let (user_id, _) = self.inner.connections.write().await.remove(&conn_id)?;

        let last = {
            let mut users = self.inner.user_conns.write().await;
            match users.get_mut(&user_id) {
                Some(conns) => {
                    conns.remove(&conn_id);
                    if conns.is_empty() {
                        users.remove(&user_id);
                        true
                    } else {
                        false
                    }
                }
                None => true,
            }
        };

        let mut rooms = self.inner.room_conns.write().await;
        rooms.retain(|_, conns| {
            conns.remove(&conn_id);
            !conns.is_empty()
        });

        Some((user_id, last))
    }

    pub async fn attach_room(&self, conn_id: Uuid, room_id: Uuid) {
        self.inner
            .room_conns
            .write()
            .await
            .entry(room_id)
            .or_default()
            .insert(conn_id);
    }

    /// Detach every local connection of `user_id` from the room channel.
    pub async fn detach_user(&self, user_id: Uuid, room_id: Uuid) {
        let user_conns: HashSet<Uuid> = self
            .inner
            .user_conns
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default();

        let mut rooms = self.inner.room_conns.write().await;
        if let Some(conns) = rooms.get_mut(&room_id) {
            conns.retain(|c| !user_conns.contains(c));
            if conns.is_empty() {
                rooms.remove(&room_id);
            }
        }
    }

    /// Reply to one connection only.
    pub async fn send_to_connection(&self, conn_id: Uuid, event: GatewayEvent) {
        let connections = self.inner.connections.read().await;
        if let Some((_, tx)) = connections.get(&conn_id) {
            let _ = tx.send(event);
        }
    }

    /// Deliver to the local connections listening on `topic`.
    pub async fn deliver(&self, topic: Topic, event: GatewayEvent) {
        let targets: Vec<Uuid> = match topic {
            Topic::Room(room_id) => self
                .inner
                .room_conns
                .read()
                .await
                .get(&room_id)
                .map(|c| c.iter().copied().collect())
                .unwrap_or_default(),
            Topic::User(user_id) => self
                .inner
                .user_conns
                .read()
                .await
                .get(&user_id)
                .map(|c| c.iter().copied().collect())
                .unwrap_or_default(),
            Topic::Global => self.inner.connections.read().await.keys().copied().collect(),
        };

        let connections = self.inner.connections.read().await;
        for conn_id in targets {
            if let Some((_, tx)) = connections.get(&conn_id) {
                let _ = tx.send(event.clone());
            }
        }
    }

    pub async fn is_connected(&self, user_id: Uuid) -> bool {
        self.inner.user_conns.read().await.contains_key(&user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }
}
