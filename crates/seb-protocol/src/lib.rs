//! seb-protocol: Wire protocol for the exam browser session channel
//!
//! This crate defines the binary framing used between the lockdown service
//! and the browser client over their local transport. Every frame is a
//! fixed 5-byte header followed by the payload bytes.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod token;

pub use codec::MessageCodec;
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{Message, MessageType};
pub use token::{SessionToken, TOKEN_LEN};
