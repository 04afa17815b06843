// Per-connection frame router.
//
// Owns the connection's identity and its subsystem instances. Every inbound
// frame passes the same pipeline: decode, run the lazy auth step on the
// frame's headers, resolve the route, then dispatch to the owning subsystem.
// Frame-level failures answer with a gateway/error frame and leave the
// connection open.

use std::time::Instant;

use huntart_common::protocol::{Frame, Route, SUBSYSTEM_GATEWAY};

use crate::auth::{AuthOutcome, Authenticator};
use crate::error::GatewayError;
use crate::metrics;
use crate::store::User;
use crate::ws::subsystems::{
    auth::AuthSubsystem, chat::ChatSubsystem, SessionContext, SessionServices, Subsystem,
};

pub struct ConnectionSession {
    address: String,
    services: SessionServices,
    authenticator: Authenticator,
    identity: Option<User>,
    subsystems: Vec<Box<dyn Subsystem>>,
}

impl ConnectionSession {
    pub fn new(address: String, services: SessionServices, authenticator: Authenticator) -> Self {
        let subsystems: Vec<Box<dyn Subsystem>> = vec![
            Box::new(AuthSubsystem::new()),
            Box::new(ChatSubsystem::new(services.clone())),
        ];
        Self { address, services, authenticator, identity: None, subsystems }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn identity(&self) -> Option<&User> {
        self.identity.as_ref()
    }

    /// Process one raw text frame. Returned frames are replies for this
    /// connection; group fanout has already gone through the broadcast layer
    /// by the time this returns.
    pub async fn handle_raw(&mut self, raw: &str) -> Vec<Frame> {
        let started_at = Instant::now();
        let (label, replies) = match Frame::decode(raw) {
            Err(error) => (
                "malformed".to_owned(),
                vec![GatewayError::MalformedMessage(error.to_string()).to_frame()],
            ),
            Ok(frame) => {
                let label = format!("{}/{}", frame.subsystem, frame.action);
                (label, self.process_frame(frame).await)
            }
        };

        let is_error = replies.iter().any(|reply| reply.subsystem == SUBSYSTEM_GATEWAY);
        metrics::record_frame(&label, is_error, started_at.elapsed().as_millis() as u64);
        replies
    }

    async fn process_frame(&mut self, frame: Frame) -> Vec<Frame> {
        // Lazy auth first: a credential on the frame (re)establishes the
        // identity even when the route turns out to be unknown; an invalid
        // one clears it and the frame is dropped. Frames without a
        // credential ride on whatever identity is current.
        if frame.headers.credential.is_some() {
            match self.authenticator.authenticate(&frame.headers, &self.services.users).await {
                Ok(AuthOutcome::Authenticated(user)) => {
                    let changed = self.identity.as_ref().map(|current| current.id) != Some(user.id);
                    if changed {
                        if let Err(error) = self.set_identity(Some(user)).await {
                            tracing::error!(
                                error = ?error,
                                address = %self.address,
                                "failed to apply new session identity"
                            );
                            return vec![error.to_frame()];
                        }
                    }
                }
                Ok(AuthOutcome::Anonymous) => {}
                Err(error) => {
                    if let Err(reset_error) = self.set_identity(None).await {
                        tracing::error!(
                            error = ?reset_error,
                            address = %self.address,
                            "failed to reset session identity"
                        );
                    }
                    return vec![error.to_frame()];
                }
            }
        }

        let Some(route) = Route::resolve(&frame.subsystem, &frame.action) else {
            return vec![GatewayError::UnknownRoute {
                subsystem: frame.subsystem,
                action: frame.action,
            }
            .to_frame()];
        };

        let ctx = SessionContext { address: &self.address, identity: self.identity.as_ref() };
        let Some(subsystem) =
            self.subsystems.iter_mut().find(|subsystem| subsystem.name() == route.subsystem())
        else {
            return vec![GatewayError::UnknownRoute {
                subsystem: route.subsystem().to_owned(),
                action: route.action().to_owned(),
            }
            .to_frame()];
        };

        match subsystem.handle(&ctx, route, &frame.data).await {
            Ok(replies) => replies,
            Err(error) => {
                tracing::debug!(
                    error = %error,
                    address = %self.address,
                    subsystem = route.subsystem(),
                    action = route.action(),
                    "frame rejected"
                );
                vec![error.to_frame()]
            }
        }
    }

    async fn set_identity(&mut self, identity: Option<User>) -> Result<(), GatewayError> {
        if let Some(previous) = self.identity.take() {
            self.services
                .users
                .clear_routing_address(previous.id, &self.address)
                .await
                .map_err(GatewayError::Store)?;
        }

        self.identity = identity;
        if let Some(user) = &self.identity {
            self.services
                .users
                .set_routing_address(user.id, &self.address)
                .await
                .map_err(GatewayError::Store)?;
            tracing::info!(address = %self.address, user_id = user.id, "session authenticated");
        }

        let ctx = SessionContext { address: &self.address, identity: self.identity.as_ref() };
        for subsystem in &mut self.subsystems {
            subsystem.on_identity_changed(&ctx).await?;
        }
        Ok(())
    }

    /// Tear down session state when the socket closes.
    pub async fn on_disconnect(&mut self) {
        if let Some(user) = &self.identity {
            if let Err(error) =
                self.services.users.clear_routing_address(user.id, &self.address).await
            {
                tracing::warn!(
                    error = ?error,
                    address = %self.address,
                    "failed to clear routing address on disconnect"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use crate::auth::token::AccessTokenVerifier;
    use crate::broadcast::{chat_group, BroadcastLayer, MemoryBroadcast};
    use crate::store::{ChatStore, UserStore};
    use huntart_common::protocol::{AuthorSummary, NewMessageData};

    const TEST_SECRET: &str = "huntart_test_secret_that_is_definitely_long_enough";

    fn user(id: i64, username: &str) -> User {
        User {
            id,
            username: username.to_owned(),
            is_active: true,
            password_fingerprint: None,
        }
    }

    fn services() -> SessionServices {
        SessionServices {
            users: UserStore::memory_with([user(1, "painter"), user(2, "sculptor")]),
            chats: ChatStore::memory(),
            broadcast: Arc::new(MemoryBroadcast::new()),
            read_flush_interval: Duration::from_millis(1000),
        }
    }

    fn session(services: &SessionServices) -> ConnectionSession {
        ConnectionSession::new(
            "ws:test".to_owned(),
            services.clone(),
            Authenticator::new(AccessTokenVerifier::new(TEST_SECRET).expect("verifier")),
        )
    }

    fn token_for(user_id: i64) -> String {
        AccessTokenVerifier::new(TEST_SECRET)
            .expect("verifier")
            .issue_token(user_id, None)
            .expect("token")
    }

    async fn reply_value(session: &mut ConnectionSession, raw: &str) -> Value {
        let replies = session.handle_raw(raw).await;
        assert_eq!(replies.len(), 1, "expected exactly one reply");
        serde_json::to_value(&replies[0]).expect("reply should serialize")
    }

    #[tokio::test]
    async fn malformed_frames_are_answered_not_fatal() {
        let services = services();
        let mut session = session(&services);

        let reply = reply_value(&mut session, "not json at all").await;
        assert_eq!(reply["data"]["code"], "MALFORMED_MESSAGE");

        // The connection keeps working afterwards.
        let probe =
            reply_value(&mut session, r#"{"subsystem":"auth","action":"authenticate"}"#).await;
        assert_eq!(probe["data"]["authenticated"], false);
    }

    #[tokio::test]
    async fn unknown_routes_are_rejected_before_dispatch() {
        let services = services();
        let mut session = session(&services);
        let reply = reply_value(
            &mut session,
            r#"{"subsystem":"presence","action":"update","data":{}}"#,
        )
        .await;
        assert_eq!(reply["data"]["code"], "UNKNOWN_ROUTE");
    }

    #[tokio::test]
    async fn credential_on_an_unknown_route_still_updates_identity() {
        let services = services();
        let mut session = session(&services);
        let frame = json!({
            "subsystem": "presence",
            "action": "update",
            "headers": {"credential": token_for(1)},
        });
        let reply = reply_value(&mut session, &frame.to_string()).await;
        assert_eq!(reply["data"]["code"], "UNKNOWN_ROUTE");
        assert_eq!(session.identity().map(|user| user.id), Some(1));
    }

    #[tokio::test]
    async fn anonymous_chat_frames_require_identity() {
        let services = services();
        let mut session = session(&services);
        let frame = json!({
            "subsystem": "chat",
            "action": "sendMessage",
            "data": {"userId": 2, "messageText": "hi"},
        });
        let reply = reply_value(&mut session, &frame.to_string()).await;
        assert_eq!(reply["data"]["code"], "IDENTITY_REQUIRED");
    }

    #[tokio::test]
    async fn credential_authenticates_the_frame_that_carries_it() {
        let services = services();
        let mut session = session(&services);
        let frame = json!({
            "subsystem": "auth",
            "action": "authenticate",
            "headers": {"credential": token_for(1)},
        });
        let reply = reply_value(&mut session, &frame.to_string()).await;
        assert_eq!(reply["data"]["authenticated"], true);
        assert_eq!(reply["data"]["userId"], 1);
        assert_eq!(session.identity().map(|user| user.id), Some(1));

        // Routing address was recorded for the authenticated user.
        assert_eq!(
            services.users.routing_address(1).await.unwrap().as_deref(),
            Some("ws:test")
        );
    }

    #[tokio::test]
    async fn identity_persists_across_anonymous_frames() {
        let services = services();
        let mut session = session(&services);
        let auth_frame = json!({
            "subsystem": "auth",
            "action": "authenticate",
            "headers": {"credential": token_for(1)},
        });
        session.handle_raw(&auth_frame.to_string()).await;

        let probe =
            reply_value(&mut session, r#"{"subsystem":"auth","action":"authenticate"}"#).await;
        assert_eq!(probe["data"]["authenticated"], true);
        assert_eq!(probe["data"]["userId"], 1);
    }

    #[tokio::test]
    async fn invalid_credential_resets_identity_and_drops_the_frame() {
        let services = services();
        let mut session = session(&services);
        let auth_frame = json!({
            "subsystem": "auth",
            "action": "authenticate",
            "headers": {"credential": token_for(1)},
        });
        session.handle_raw(&auth_frame.to_string()).await;

        let bad_frame = json!({
            "subsystem": "chat",
            "action": "sendMessage",
            "headers": {"credential": "garbage"},
            "data": {"userId": 2, "messageText": "hi"},
        });
        let reply = reply_value(&mut session, &bad_frame.to_string()).await;
        assert_eq!(reply["data"]["code"], "AUTHENTICATION_FAILED");
        assert!(session.identity().is_none());

        // No message was persisted and the routing entry is gone.
        assert!(services.chats.message(1).await.unwrap().is_none());
        assert!(services.users.routing_address(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mid_session_auth_joins_existing_chat_groups() {
        let services = services();
        let broadcast = Arc::clone(&services.broadcast);
        let chat = services.chats.resolve_personal_chat(1, 2).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        broadcast.register("ws:test", tx).await.unwrap();

        let mut session = session(&services);
        let auth_frame = json!({
            "subsystem": "auth",
            "action": "authenticate",
            "headers": {"credential": token_for(2)},
        });
        session.handle_raw(&auth_frame.to_string()).await;

        broadcast
            .publish(
                &chat_group(chat.chat_id),
                &Frame::new_message(NewMessageData {
                    message_id: 1,
                    message_text: "welcome back".to_owned(),
                    created_at: chrono::Utc::now(),
                    author: AuthorSummary { id: 1, username: "painter".to_owned() },
                }),
            )
            .await
            .unwrap();

        let fanout = serde_json::to_value(rx.try_recv().expect("fanout should arrive")).unwrap();
        assert_eq!(fanout["data"]["messageText"], "welcome back");
    }

    #[tokio::test]
    async fn switching_identities_moves_the_routing_address() {
        let services = services();
        let mut session = session(&services);

        let first = json!({
            "subsystem": "auth", "action": "authenticate",
            "headers": {"credential": token_for(1)},
        });
        session.handle_raw(&first.to_string()).await;

        let second = json!({
            "subsystem": "auth", "action": "authenticate",
            "headers": {"credential": token_for(2)},
        });
        let reply = reply_value(&mut session, &second.to_string()).await;
        assert_eq!(reply["data"]["userId"], 2);

        assert!(services.users.routing_address(1).await.unwrap().is_none());
        assert_eq!(
            services.users.routing_address(2).await.unwrap().as_deref(),
            Some("ws:test")
        );
    }

    #[tokio::test]
    async fn disconnect_clears_the_routing_address() {
        let services = services();
        let mut session = session(&services);
        let auth_frame = json!({
            "subsystem": "auth", "action": "authenticate",
            "headers": {"credential": token_for(1)},
        });
        session.handle_raw(&auth_frame.to_string()).await;

        session.on_disconnect().await;
        assert!(services.users.routing_address(1).await.unwrap().is_none());
    }
}
