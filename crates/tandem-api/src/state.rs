use std::sync::Arc;

use tandem_chat::MatchingQueue;
use tandem_gateway::ChatContext;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    /// The same services the gateway uses, so HTTP and socket paths share
    /// fan-out, buffering and caches.
    pub chat: ChatContext,
    pub matching: Arc<MatchingQueue>,
    pub jwt_secret: String,
}
