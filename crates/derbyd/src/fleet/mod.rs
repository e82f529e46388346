//! The LED board fleet: registry, discovery, command dispatch and health.

pub mod client;
pub mod command;
pub mod device;
pub mod discovery;
pub mod dispatcher;
pub mod health;
pub mod registry;
pub mod retry;
