//! seb-core: Session machinery shared by the exam service and browser client
//!
//! This crate provides the session state machine, the framed transport
//! channel, heartbeat supervision, token issuance and the configuration
//! structures used by both ends of the channel.

pub mod auth;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod launch;
pub mod link;
pub mod monitor;
pub mod session;
pub mod state;
pub mod traits;

pub use error::{ChannelError, SessionError};
pub use events::{LostReason, SessionEvent};
pub use session::{AttemptGuard, Session, SessionSettings};
pub use state::{ConnectionState, StateSnapshot, Transition};
