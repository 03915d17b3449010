//! Connection to the lockdown service

mod connector;
mod reconnect;

pub use connector::ServiceConnector;
pub use reconnect::ExponentialBackoff;
