//! Chat Relay
//!
//! Real-time conversation relay: authenticated clients hold a WebSocket open,
//! subscribe to conversations and exchange messages that are fanned out to
//! every co-subscribed connection. A per-conversation bot may answer.
//!
//! # Architecture
//!
//! ```text
//! WebSocket ──► server ──► Dispatcher ──► ConnectionRegistry (fan-out)
//!                              │
//!                              ├── TokenVerifier   (JWT)
//!                              ├── MembershipStore (SQLite)
//!                              ├── MessageStore    (SQLite)
//!                              └── BotOracle       (off / heuristic / OpenAI)
//! ```

pub mod auth;
pub mod bot;
pub mod config;
pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;

pub use auth::{AuthError, Handshake, JwtVerifier, Principal, TokenVerifier};
pub use bot::{BotError, BotMode, BotOracle, DisabledBot, HeuristicBot, OpenAiBot};
pub use config::Config;
pub use dispatcher::{BotTurn, Dispatcher, DispatcherConfig, FrameOutcome};
pub use protocol::{ConversationId, ErrorCode, InboundEvent, OutboundFrame};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, RegistryError};
pub use server::{build_router, KeepAlive, RelayServer};
pub use store::{MembershipStore, MessageId, MessageStore, SqliteStore, StoreError};
