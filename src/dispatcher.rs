//! Relay Dispatcher
//!
//! Drives every connection through `Open → Authenticated → Closed`, handles
//! inbound events, fans messages out to subscribers and runs the bot turn.
//!
//! # Policy
//!
//! Membership gates *posting*; subscription gates *receiving*. A connection may
//! subscribe to any conversation without a membership check and then receives
//! everything posted there by members. Human messages are fanned out only
//! (their persistence belongs to the HTTP API); bot replies are persisted here
//! before they are fanned out.
//!
//! Collaborators are only ever called with the registry lock released, and
//! each call is bounded by a deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, Handshake, Principal, TokenVerifier};
use crate::bot::{BotError, BotOracle};
use crate::config::Config;
use crate::protocol::{ConversationId, ErrorCode, InboundEvent, OutboundFrame, BOT_SENDER};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry, FrameSender};
use crate::store::{MembershipStore, MessageId, MessageStore, StoreError};

/// Deadlines for collaborator calls
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Bound on one bot reply
    pub bot_timeout: Duration,
    /// Bound on one token, membership or message store call
    pub store_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bot_timeout: Duration::from_secs(20),
            store_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for DispatcherConfig {
    fn from(config: &Config) -> Self {
        Self {
            bot_timeout: config.bot_timeout,
            store_timeout: config.store_timeout,
        }
    }
}

/// What became of one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Malformed, or the connection vanished mid-flight
    Dropped,
    Subscribed {
        conversation_id: ConversationId,
        newly_added: bool,
    },
    /// Sender was told why with an error frame
    Rejected(ErrorCode),
    Delivered {
        conversation_id: ConversationId,
        recipients: usize,
        bot: BotTurn,
    },
}

/// Result of the bot turn following a delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotTurn {
    Disabled,
    NoReply,
    Failed,
    Replied {
        message_id: MessageId,
        recipients: usize,
    },
}

/// The relay state machine
#[derive(Clone)]
pub struct Dispatcher {
    verifier: Arc<dyn TokenVerifier>,
    membership: Arc<dyn MembershipStore>,
    messages: Arc<dyn MessageStore>,
    bot: Arc<dyn BotOracle>,
    registry: ConnectionRegistry,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        membership: Arc<dyn MembershipStore>,
        messages: Arc<dyn MessageStore>,
        bot: Arc<dyn BotOracle>,
    ) -> Self {
        Self {
            verifier,
            membership,
            messages,
            bot,
            registry: ConnectionRegistry::new(),
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    // ===== Lifecycle =====

    /// Authenticate a freshly opened connection.
    ///
    /// On failure exactly one error frame is queued on `sender` and nothing is
    /// registered; the transport must close the connection.
    pub async fn open(&self, handshake: &Handshake, sender: FrameSender) -> Result<ConnectionId, AuthError> {
        let Some(credential) = handshake.credential() else {
            warn!("Connection rejected: no token");
            let _ = sender.send(OutboundFrame::error(ErrorCode::NoToken));
            return Err(AuthError::Missing);
        };

        let verified = timeout(self.config.store_timeout, self.verifier.verify(&credential.token))
            .await
            .unwrap_or_else(|_| Err(AuthError::Internal("token verification timed out".into())));

        let principal = match verified {
            Ok(principal) => principal,
            Err(e) => {
                warn!(error = %e, "Connection rejected: invalid token");
                let _ = sender.send(OutboundFrame::error(ErrorCode::InvalidToken));
                return Err(e);
            }
        };

        let id = self.registry.register(Connection::new(sender));
        if let Err(e) = self.registry.authenticate(id, principal.clone()) {
            error!(connection_id = %id, error = %e, "Failed to bind principal");
            self.registry.unregister(id);
            return Err(AuthError::Internal(e.to_string()));
        }

        info!(
            connection_id = %id,
            principal = %principal,
            source = ?credential.source,
            "Connection authenticated"
        );
        Ok(id)
    }

    /// Transport closed or failed; always terminal
    pub fn close(&self, id: ConnectionId) {
        if self.registry.unregister(id) {
            info!(connection_id = %id, "Connection closed");
        }
    }

    // ===== Inbound events =====

    /// Handle one text frame from `id`
    pub async fn handle_frame(&self, id: ConnectionId, text: &str) -> FrameOutcome {
        let event = match InboundEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                debug!(connection_id = %id, error = %e, "Dropping malformed frame");
                return FrameOutcome::Dropped;
            }
        };

        match event {
            InboundEvent::Subscribe { conversation_id } => self.handle_subscribe(id, conversation_id),
            InboundEvent::Message {
                conversation_id,
                content,
                from,
            } => self.handle_message(id, conversation_id, content, from).await,
        }
    }

    fn handle_subscribe(&self, id: ConnectionId, conversation_id: ConversationId) -> FrameOutcome {
        let newly_added = match self.registry.subscribe(id, conversation_id) {
            Ok(added) => added,
            Err(e) => {
                debug!(connection_id = %id, error = %e, "Subscribe on closed connection");
                return FrameOutcome::Dropped;
            }
        };

        debug!(connection_id = %id, conversation_id, newly_added, "Subscribed");
        self.registry.send_to(id, OutboundFrame::subscribed(conversation_id));

        FrameOutcome::Subscribed {
            conversation_id,
            newly_added,
        }
    }

    async fn handle_message(
        &self,
        id: ConnectionId,
        conversation_id: Option<ConversationId>,
        content: String,
        from: Option<String>,
    ) -> FrameOutcome {
        let Some(principal) = self.registry.principal_of(id) else {
            return self.reject(id, ErrorCode::Unauthenticated);
        };

        // No conversation has a missing or non-positive id
        let Some(conversation_id) = conversation_id else {
            debug!(connection_id = %id, principal = %principal, "Send rejected: no conversation id");
            return self.reject(id, ErrorCode::NotInConversation);
        };

        match self.bounded(self.membership.is_member(&principal, conversation_id)).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(connection_id = %id, principal = %principal, conversation_id, "Send rejected: not a member");
                return self.reject(id, ErrorCode::NotInConversation);
            }
            Err(e) => {
                error!(connection_id = %id, conversation_id, error = %e, "Membership lookup failed");
                return self.reject(id, ErrorCode::StoreUnavailable);
            }
        }

        let sender_name = from.unwrap_or_else(|| principal.to_string());
        let recipients = self.broadcast(
            conversation_id,
            OutboundFrame::message(conversation_id, sender_name, content.as_str()),
        );

        debug!(connection_id = %id, conversation_id, recipients, "Message delivered");

        let bot = self.bot_turn(conversation_id, &content).await;

        FrameOutcome::Delivered {
            conversation_id,
            recipients,
            bot,
        }
    }

    fn reject(&self, id: ConnectionId, code: ErrorCode) -> FrameOutcome {
        self.registry.send_to(id, OutboundFrame::error(code));
        FrameOutcome::Rejected(code)
    }

    // ===== Fan-out =====

    /// Deliver `frame` to every current subscriber, sender included
    fn broadcast(&self, conversation_id: ConversationId, frame: OutboundFrame) -> usize {
        self.registry
            .subscribers_of(conversation_id)
            .filter(|subscriber| subscriber.send(frame.clone()))
            .count()
    }

    // ===== Bot turn =====

    /// Generate, persist and fan out a bot reply. Never fails the human path.
    async fn bot_turn(&self, conversation_id: ConversationId, content: &str) -> BotTurn {
        match self.bounded(self.membership.is_bot_enabled(conversation_id)).await {
            Ok(true) => {}
            Ok(false) => return BotTurn::Disabled,
            Err(e) => {
                warn!(conversation_id, error = %e, "Bot setting lookup failed, skipping bot turn");
                return BotTurn::Failed;
            }
        }

        let reply = timeout(self.config.bot_timeout, self.bot.generate_reply(content, conversation_id))
            .await
            .unwrap_or(Err(BotError::Timeout));

        let reply = match reply {
            Ok(Some(reply)) if !reply.trim().is_empty() => reply,
            Ok(_) => {
                debug!(conversation_id, "Bot had no reply");
                return BotTurn::NoReply;
            }
            Err(e) => {
                warn!(conversation_id, error = %e, "Bot reply failed");
                return BotTurn::Failed;
            }
        };

        let author = match self.bounded(self.messages.resolve_bot_principal()).await {
            Ok(author) => author,
            Err(e) => {
                warn!(conversation_id, error = %e, "Bot principal lookup failed, persisting without author");
                None
            }
        };

        let message_id = match self
            .bounded(self.messages.append_message(conversation_id, author.as_ref(), &reply))
            .await
        {
            Ok(message_id) => message_id,
            Err(e) => {
                warn!(conversation_id, error = %e, "Failed to persist bot reply");
                return BotTurn::Failed;
            }
        };

        let recipients = self.broadcast(
            conversation_id,
            OutboundFrame::message(conversation_id, BOT_SENDER, reply),
        );

        info!(conversation_id, message_id, recipients, "Bot replied");
        BotTurn::Replied {
            message_id,
            recipients,
        }
    }

    /// Apply the store deadline to a collaborator call
    async fn bounded<T>(&self, call: impl Future<Output = Result<T, StoreError>>) -> Result<T, StoreError> {
        timeout(self.config.store_timeout, call)
            .await
            .unwrap_or(Err(StoreError::Timeout))
    }

    /// Principal bound to a live connection
    pub fn principal_of(&self, id: ConnectionId) -> Option<Principal> {
        self.registry.principal_of(id)
    }
}
