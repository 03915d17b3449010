//! seb-service: Lockdown service side of the exam session channel
//!
//! The service mints the session token, launches the browser client with
//! it, accepts the client's connection on loopback and supervises the
//! session. Lockdown policy reacts to the [`SessionEvent`]s the
//! [`ClientProxy`] publishes.
//!
//! [`SessionEvent`]: seb_core::SessionEvent

pub mod launcher;
pub mod listener;
pub mod proxy;

pub use launcher::ClientLauncher;
pub use listener::ClientListener;
pub use proxy::ClientProxy;
