//! Taskboard client library: board connection, event-fed board cache and
//! optimistic move reconciliation.

pub mod cache;
pub mod connection;
pub mod optimistic;

pub use cache::{Applied, BoardCache};
pub use connection::{BoardClient, ClientError};
pub use optimistic::Reconciler;
