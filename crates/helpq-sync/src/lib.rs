//! Synchronization core for a classroom help queue.
//!
//! `HelpQueueService` ties together the session tracker (is a class live
//! right now?), the queue mirror (local sorted copy of the remote queue
//! document) and the queue mutator (set-style remote updates). Everything
//! remote goes through a [`helpq_store::DocumentStore`].

pub mod accounts;
pub mod config;
pub mod gate;
pub mod listeners;
pub mod mirror;
pub mod mutator;
pub mod service;
pub mod tracker;

pub use accounts::Accounts;
pub use config::{ConfigError, HelpQueueConfig};
pub use gate::ReadinessGate;
pub use listeners::{ListenerRegistry, Subscription};
pub use mirror::RemoteMirror;
pub use mutator::QueueMutator;
pub use service::HelpQueueService;
pub use tracker::{SessionEvent, SessionTracker};
