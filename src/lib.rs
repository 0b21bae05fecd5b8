//! promptgate — a self-hosted gateway in front of AI chat providers.
//!
//! One registration = one externally exposed endpoint: a gateway key, a
//! provider configuration (credentials encrypted at rest) and optionally a
//! system prompt. Callers speak the common chat-completion wire shape at
//! the gateway and never see provider credentials; every call lands in the
//! metrics ledger.

pub mod chat;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod logger;
pub mod metrics;
pub mod providers;
pub mod resolver;
pub mod schema;
pub mod store;
pub mod vault;

pub use error::GatewayError;
