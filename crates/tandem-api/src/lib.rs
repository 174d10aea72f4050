//! Thin HTTP surface over the chat core: matching, rooms, presence and
//! blocks. Every route needs a bearer JWT; tokens are minted elsewhere.

pub mod error;
pub mod matching;
pub mod middleware;
pub mod presence;
pub mod rooms;
pub mod state;
pub mod users;

use axum::{
    Router,
    routing::{get, post},
};

pub use error::{AppError, AppResult};
pub use middleware::{decode_token, require_auth};
pub use state::{AppState, AppStateInner};

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/matching",
            post(matching::enqueue)
                .delete(matching::cancel)
                .get(matching::status),
        )
        .route("/rooms", post(rooms::create_room))
        .route("/rooms/{room_id}/join", post(rooms::join_room))
        .route("/rooms/{room_id}/leave", post(rooms::leave_room))
        .route("/rooms/{room_id}/accept", post(rooms::accept_friend_room))
        .route("/rooms/{room_id}/messages", get(rooms::get_messages))
        .route("/rooms/{room_id}/unread", get(rooms::unread_count))
        .route("/friend-rooms", post(rooms::create_friend_room))
        .route("/presence", get(presence::bulk_status))
        .route("/presence/online", get(presence::online_users))
        .route("/users/{user_id}/block", post(users::block_user))
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    use tandem_chat::{
        BufferConfig, MatchingConfig, MatchingQueue, MessageBuffer, NameCache, PresenceConfig,
        PresenceTracker, RoomLifecycle, SqliteStore,
    };
    use tandem_db::Database;
    use tandem_gateway::{ChatContext, Dispatcher, Fanout};
    use tandem_kv::{KvStore, MemoryStore};
    use tandem_types::api::Claims;
    use tandem_types::models::{AgeGroup, Gender, UserProfile};

    const SECRET: &str = "test-secret";

    struct TestApp {
        db: Arc<Database>,
        router: Router,
    }

    fn app() -> TestApp {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(SqliteStore::new(db.clone()));
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new();
        let events = Arc::new(Fanout::new(kv.clone(), dispatcher.clone()));
        let lifecycle = RoomLifecycle::new(store.clone());
        let buffer = MessageBuffer::new(kv.clone(), store.clone(), BufferConfig::default());

        let chat = ChatContext {
            store: store.clone(),
            lifecycle: lifecycle.clone(),
            buffer: buffer.clone(),
            presence: Arc::new(PresenceTracker::new(kv.clone(), PresenceConfig::default())),
            names: Arc::new(NameCache::new(store.clone(), Duration::from_secs(60))),
            events: events.clone(),
            dispatcher,
            cipher: None,
        };
        let matching = Arc::new(MatchingQueue::new(
            kv,
            store,
            lifecycle,
            events,
            buffer,
            MatchingConfig::default(),
        ));
        let state = Arc::new(AppStateInner {
            chat,
            matching,
            jwt_secret: SECRET.to_string(),
        });
        TestApp {
            db,
            router: routes(state),
        }
    }

    impl TestApp {
        fn user(&self, name: &str) -> Uuid {
            let user = UserProfile {
                id: Uuid::new_v4(),
                display_name: name.to_string(),
                gender: Gender::Male,
                age_group: AgeGroup::Adult,
            };
            self.db.create_user(&user).unwrap();
            user.id
        }

        async fn call(&self, user: Option<Uuid>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let mut req = Request::builder().method(method).uri(uri);
            if let Some(user) = user {
                req = req.header(header::AUTHORIZATION, format!("Bearer {}", token(user)));
            }
            let req = match body {
                Some(body) => req
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string())),
                None => req.body(Body::empty()),
            }
            .unwrap();

            let resp = self.router.clone().oneshot(req).await.unwrap();
            let status = resp.status();
            let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, value)
        }
    }

    fn token(user: Uuid) -> String {
        let claims = Claims {
            sub: user,
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn prefs() -> Value {
        json!({"age_group": "adult", "gender_preference": "any", "capacity": 2})
    }

    #[tokio::test]
    async fn requests_without_token_are_unauthorized() {
        let app = app();
        let (status, _) = app.call(None, "GET", "/matching", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn matching_enqueue_status_and_cancel() {
        let app = app();
        let user = app.user("Ana");

        let (status, body) = app
            .call(Some(user), "POST", "/matching", Some(json!({"preferences": prefs()})))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["position"], 1);

        let (status, body) = app
            .call(Some(user), "POST", "/matching", Some(json!({"preferences": prefs()})))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "ALREADY_IN_QUEUE");

        let (_, body) = app.call(Some(user), "GET", "/matching", None).await;
        assert_eq!(body["data"]["queue"], "matching:queue:adult:any");

        let (_, body) = app.call(Some(user), "DELETE", "/matching", None).await;
        assert_eq!(body["data"]["removed"], true);
        let (_, body) = app.call(Some(user), "GET", "/matching", None).await;
        assert!(body["data"].is_null());
    }

    #[tokio::test]
    async fn missing_preferences_is_a_validation_error() {
        let app = app();
        let user = app.user("Ana");
        let (status, body) = app.call(Some(user), "POST", "/matching", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION");
    }

    #[tokio::test]
    async fn rejoining_after_leave_is_a_conflict() {
        let app = app();
        let (host, guest) = (app.user("Host"), app.user("Guest"));

        let (status, body) = app.call(Some(host), "POST", "/rooms", Some(prefs())).await;
        assert_eq!(status, StatusCode::CREATED);
        let room_id = body["data"]["room"]["id"].as_str().unwrap().to_string();

        let (status, body) = app
            .call(Some(guest), "POST", &format!("/rooms/{room_id}/join"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["room"]["status"], "active");

        let (_, body) = app
            .call(Some(guest), "POST", &format!("/rooms/{room_id}/leave"), None)
            .await;
        assert_eq!(body["data"]["phase"], "active");
        assert_eq!(body["data"]["torn_down"], false);

        let (status, body) = app
            .call(Some(guest), "POST", &format!("/rooms/{room_id}/join"), None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "REENTRY_FORBIDDEN");
    }

    #[tokio::test]
    async fn committed_join_and_leave_report_success_without_names() {
        let app = app();
        let (host, guest) = (app.user("Host"), app.user("Guest"));
        let mut open = prefs();
        open["capacity"] = json!(3);
        let (_, body) = app.call(Some(host), "POST", "/rooms", Some(open)).await;
        let room_id = body["data"]["room"]["id"].as_str().unwrap().to_string();
        app.db
            .with_conn(|conn| {
                conn.execute("ALTER TABLE users RENAME TO users_offline", [])?;
                Ok(())
            })
            .unwrap();

        let (status, body) = app
            .call(Some(guest), "POST", &format!("/rooms/{room_id}/join"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["room"]["participant_ids"][1], guest.to_string());

        let (status, body) = app
            .call(Some(guest), "POST", &format!("/rooms/{room_id}/leave"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["phase"], "waiting");
    }

    #[tokio::test]
    async fn friend_room_accept_needs_the_invitee() {
        let app = app();
        let (inviter, invitee) = (app.user("Inviter"), app.user("Invitee"));
        let (status, body) = app
            .call(Some(inviter), "POST", "/friend-rooms", Some(json!({"invitee_id": invitee})))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let room_id = body["data"]["room"]["id"].as_str().unwrap().to_string();

        let (status, body) = app
            .call(Some(inviter), "POST", &format!("/rooms/{room_id}/accept"), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION");

        app.call(Some(invitee), "POST", &format!("/rooms/{room_id}/join"), None).await;
        let (status, body) = app
            .call(Some(inviter), "POST", &format!("/rooms/{room_id}/accept"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["room"]["status"], "active");
    }

    #[tokio::test]
    async fn outsiders_cannot_read_history() {
        let app = app();
        let (host, outsider) = (app.user("Host"), app.user("Outsider"));
        let (_, body) = app.call(Some(host), "POST", "/rooms", Some(prefs())).await;
        let room_id = body["data"]["room"]["id"].as_str().unwrap().to_string();

        let (status, _) = app
            .call(Some(host), "GET", &format!("/rooms/{room_id}/messages"), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = app
            .call(Some(outsider), "GET", &format!("/rooms/{room_id}/unread"), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "NOT_PARTICIPANT");

        let (status, _) = app
            .call(Some(host), "GET", &format!("/rooms/{}/messages", Uuid::new_v4()), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn block_prevents_friend_invite() {
        let app = app();
        let (a, b) = (app.user("A"), app.user("B"));

        let (status, _) = app.call(Some(b), "POST", &format!("/users/{a}/block"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = app
            .call(Some(a), "POST", "/friend-rooms", Some(json!({"invitee_id": b})))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "BLOCKED");
    }

    #[tokio::test]
    async fn presence_lookup_keeps_request_order() {
        let app = app();
        let viewer = app.user("Viewer");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let (status, body) = app
            .call(Some(viewer), "GET", &format!("/presence?ids={a},{b}"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["user_id"], a.to_string());
        assert_eq!(body["data"][1]["online"], false);

        let (status, _) = app.call(Some(viewer), "GET", "/presence?ids=zzz", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
