//! seb-client: Browser side of the exam session channel
//!
//! The browser is launched by the lockdown service with its credentials in
//! the environment. It dials the service on loopback, presents the session
//! token and then keeps the session alive with heartbeats.

pub mod connection;

pub use connection::{ExponentialBackoff, ServiceConnector};
