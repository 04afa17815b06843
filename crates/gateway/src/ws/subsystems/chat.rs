use std::collections::HashSet;

use async_trait::async_trait;
use huntart_common::protocol::{
    AuthorSummary, ChatAction, Frame, MarkReadData, MessageSentData, NewMessageData, Route,
    SendMessageData, MAX_MESSAGE_TEXT_BYTES, SUBSYSTEM_CHAT,
};
use serde_json::Value;

use super::{SessionContext, SessionServices, Subsystem};
use crate::broadcast::{chat_group, BroadcastLayer};
use crate::error::GatewayError;
use crate::store::User;
use crate::ws::read_receipts::ReadReceiptDebouncer;

/// Personal-chat messaging over one connection.
///
/// Tracks which chat groups the connection has joined and owns the
/// read-receipt debouncer for the authenticated reader. Both are rebuilt
/// whenever the session identity changes.
pub struct ChatSubsystem {
    services: SessionServices,
    joined_chats: HashSet<i64>,
    debouncer: Option<ReadReceiptDebouncer>,
}

impl ChatSubsystem {
    pub fn new(services: SessionServices) -> Self {
        Self { services, joined_chats: HashSet::new(), debouncer: None }
    }

    /// Clear every group membership for this address, not just the chats
    /// this session joined itself: a peer's first-contact send joins our
    /// address into the new group from *their* session.
    async fn leave_all(&mut self, address: &str) -> Result<(), GatewayError> {
        self.joined_chats.clear();
        self.services.broadcast.leave_all(address).await.map_err(GatewayError::Store)
    }

    async fn join_chat(&mut self, chat_id: i64, address: &str) -> Result<(), GatewayError> {
        if self.joined_chats.insert(chat_id) {
            self.services
                .broadcast
                .join(&chat_group(chat_id), address)
                .await
                .map_err(GatewayError::Store)?;
        }
        Ok(())
    }

    fn require_identity<'a>(ctx: &SessionContext<'a>) -> Result<&'a User, GatewayError> {
        ctx.identity.ok_or(GatewayError::IdentityRequired)
    }

    async fn handle_send_message(
        &mut self,
        ctx: &SessionContext<'_>,
        data: &Value,
    ) -> Result<Vec<Frame>, GatewayError> {
        let sender = Self::require_identity(ctx)?;
        let request: SendMessageData = serde_json::from_value(data.clone())
            .map_err(|error| GatewayError::MalformedMessage(error.to_string()))?;

        if request.message_text.is_empty() {
            return Err(GatewayError::MalformedMessage("messageText must not be empty".into()));
        }
        if request.message_text.len() > MAX_MESSAGE_TEXT_BYTES {
            return Err(GatewayError::MalformedMessage(format!(
                "messageText exceeds {MAX_MESSAGE_TEXT_BYTES} bytes"
            )));
        }

        let peer_id = match (request.user_id, request.chat_id) {
            (Some(peer_id), None) => peer_id,
            // Addressing an existing chat directly is reserved for group
            // chats, which this gateway does not serve yet.
            (None, Some(_)) => return Err(GatewayError::NotImplemented),
            _ => return Err(GatewayError::AmbiguousTarget),
        };

        if peer_id == sender.id {
            return Err(GatewayError::SelfMessageNotAllowed);
        }
        self.services
            .users
            .get(peer_id)
            .await
            .map_err(GatewayError::Store)?
            .ok_or(GatewayError::RecipientNotFound(peer_id))?;

        let resolution = self.services.chats.resolve_personal_chat(sender.id, peer_id).await?;
        let group = chat_group(resolution.chat_id);

        self.join_chat(resolution.chat_id, ctx.address).await?;
        if resolution.created {
            // First contact: pull the peer's live connection, if any, into
            // the new group so it sees the message without reconnecting.
            if let Some(peer_address) = self
                .services
                .users
                .routing_address(peer_id)
                .await
                .map_err(GatewayError::Store)?
            {
                self.services
                    .broadcast
                    .join(&group, &peer_address)
                    .await
                    .map_err(GatewayError::Store)?;
            }
        }

        let message = self
            .services
            .chats
            .insert_message(resolution.chat_id, sender.id, &request.message_text)
            .await
            .map_err(GatewayError::Store)?;

        self.services
            .broadcast
            .publish(
                &group,
                &Frame::new_message(NewMessageData {
                    message_id: message.id,
                    message_text: message.message_text.clone(),
                    created_at: message.created_at,
                    author: AuthorSummary { id: sender.id, username: sender.username.clone() },
                }),
            )
            .await
            .map_err(GatewayError::Store)?;
        crate::metrics::record_message_published(self.services.broadcast.backend_name());

        Ok(vec![Frame::message_sent(MessageSentData {
            chat_id: resolution.chat_id,
            message_id: message.id,
            created_at: message.created_at,
        })])
    }

    async fn handle_mark_read(
        &mut self,
        ctx: &SessionContext<'_>,
        data: &Value,
    ) -> Result<Vec<Frame>, GatewayError> {
        let reader = Self::require_identity(ctx)?;
        let request: MarkReadData = serde_json::from_value(data.clone())
            .map_err(|error| GatewayError::MalformedMessage(error.to_string()))?;

        if request.user_id == reader.id {
            return Err(GatewayError::SelfMessageNotAllowed);
        }
        self.services
            .users
            .get(request.user_id)
            .await
            .map_err(GatewayError::Store)?
            .ok_or(GatewayError::RecipientNotFound(request.user_id))?;

        let message = self
            .services
            .chats
            .message(request.message_id)
            .await
            .map_err(GatewayError::Store)?
            .ok_or(GatewayError::MessageNotFound(request.message_id))?;

        // The peer names the chat; a message from some other chat must not
        // move this pair's read position.
        let chat_id = self
            .services
            .chats
            .find_personal_chat(reader.id, request.user_id)
            .await?
            .filter(|chat_id| *chat_id == message.chat_id)
            .ok_or(GatewayError::MessageNotFound(request.message_id))?;

        if !self
            .services
            .chats
            .is_member(chat_id, reader.id)
            .await
            .map_err(GatewayError::Store)?
        {
            return Err(GatewayError::DataIntegrity(format!(
                "user {} has no membership row for chat {chat_id}",
                reader.id
            )));
        }

        if let Some(debouncer) = &self.debouncer {
            debouncer.submit(chat_id, message.created_at).await;
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl Subsystem for ChatSubsystem {
    fn name(&self) -> &'static str {
        SUBSYSTEM_CHAT
    }

    async fn on_identity_changed(
        &mut self,
        ctx: &SessionContext<'_>,
    ) -> Result<(), GatewayError> {
        self.leave_all(ctx.address).await?;
        self.debouncer = None;

        if let Some(user) = ctx.identity {
            let chat_ids = self
                .services
                .chats
                .chat_ids_for_user(user.id)
                .await
                .map_err(GatewayError::Store)?;
            for chat_id in chat_ids {
                self.join_chat(chat_id, ctx.address).await?;
            }
            self.debouncer = Some(ReadReceiptDebouncer::spawn(
                self.services.chats.clone(),
                user.id,
                self.services.read_flush_interval,
            ));
        }
        Ok(())
    }

    async fn handle(
        &mut self,
        ctx: &SessionContext<'_>,
        route: Route,
        data: &Value,
    ) -> Result<Vec<Frame>, GatewayError> {
        match route {
            Route::Chat(ChatAction::SendMessage) => self.handle_send_message(ctx, data).await,
            Route::Chat(ChatAction::MarkRead) => self.handle_mark_read(ctx, data).await,
            Route::Auth(_) => Err(GatewayError::UnknownRoute {
                subsystem: route.subsystem().to_owned(),
                action: route.action().to_owned(),
            }),
        }
    }
}
