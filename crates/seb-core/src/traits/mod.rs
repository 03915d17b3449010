//! Core trait definitions

mod channel;
mod command;

pub use channel::MessageChannel;
pub use command::CommandHandler;
