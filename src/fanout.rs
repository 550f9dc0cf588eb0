// src/fanout.rs

use crate::database::StoreError;
use crate::models::{
    ChatId, JoinChat, MessageId, NewMessage, SendMessage, ServerMessage, UserId,
};
use crate::registry::{ConnectionHandle, Delivery, Frame, JoinOutcome};
use crate::state::ChatState;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a `send_message` could not be accepted. Reported to the sender only.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("user {user_id} is not a member of chat {chat_id}")]
    NotMember { chat_id: ChatId, user_id: UserId },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode broadcast frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SendError {
    /// Text safe to show the sender. Database and encoding details stay in the server log.
    pub fn client_message(&self) -> String {
        match self {
            Self::Store(StoreError::Database(_)) | Self::Encode(_) => {
                "internal error, message not sent".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub message_id: MessageId,
    pub recipients: usize,
    pub delivered: usize,
    pub offline: usize,
    pub failed: usize,
}

/// Registers `handle` as the live connection for the joining user.
///
/// `current` is the user this connection was previously registered as, if any;
/// switching identity releases that registration first.
pub async fn join_chat(
    state: &ChatState,
    current: Option<UserId>,
    join: &JoinChat,
    handle: &ConnectionHandle,
) -> JoinOutcome {
    if let Some(previous) = current.filter(|id| *id != join.user_id) {
        state.registry.leave(previous, handle.id()).await;
    }

    let outcome = state.registry.join(join.user_id, handle.clone()).await;
    match outcome {
        JoinOutcome::Replaced(old) => info!(
            user_id = join.user_id,
            chat_id = join.chat_id,
            conn_id = %handle.id(),
            replaced = %old,
            "user rejoined, previous connection closed"
        ),
        JoinOutcome::Rejected => debug!(
            user_id = join.user_id,
            conn_id = %handle.id(),
            "ignoring join from closing connection"
        ),
        JoinOutcome::Registered | JoinOutcome::AlreadyRegistered => debug!(
            user_id = join.user_id,
            chat_id = join.chat_id,
            conn_id = %handle.id(),
            ?outcome,
            "user joined"
        ),
    }
    outcome
}

/// Persists the message, then delivers it to every other member of the chat that is online.
///
/// Errors are only returned while nothing has been stored. Once the message is persisted,
/// lookup and delivery failures are logged and the call still succeeds.
pub async fn send_message(
    state: &ChatState,
    send: SendMessage,
) -> Result<FanoutReport, SendError> {
    let SendMessage {
        chat_id,
        user_id,
        message,
    } = send;

    if state.websocket.require_membership && !state.store.is_member(chat_id, user_id).await? {
        return Err(SendError::NotMember { chat_id, user_id });
    }

    let sender = state
        .store
        .find_user(user_id)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "user",
            id: user_id,
        })?;

    let frame: Frame = Arc::from(
        ServerMessage::NewMessage {
            from_user_email: sender.email,
            message: message.clone(),
        }
        .to_json()?,
    );

    let stored = state
        .store
        .create_message(NewMessage {
            chat_id,
            from_id: user_id,
            content: message,
        })
        .await?;

    let mut report = FanoutReport {
        message_id: stored.id,
        ..FanoutReport::default()
    };

    let recipients = match state.store.chat_members_except(chat_id, user_id).await {
        Ok(recipients) => recipients,
        Err(e) => {
            warn!(
                chat_id,
                message_id = stored.id,
                error = %e,
                "message saved but recipient lookup failed"
            );
            return Ok(report);
        }
    };
    report.recipients = recipients.len();

    for recipient in recipients {
        match state.registry.send_to(recipient, &frame).await {
            Ok(Delivery::Sent) => report.delivered += 1,
            Ok(Delivery::Offline) => {
                debug!(chat_id, recipient, "recipient offline, skipping");
                report.offline += 1;
            }
            Err(e) => {
                warn!(chat_id, recipient, error = %e, "failed to deliver message");
                report.failed += 1;
            }
        }
    }

    debug!(
        chat_id,
        from = user_id,
        message_id = report.message_id,
        recipients = report.recipients,
        delivered = report.delivered,
        offline = report.offline,
        failed = report.failed,
        "message fanned out"
    );
    Ok(report)
}
