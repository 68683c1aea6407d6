//! Taskboard board server library.
//!
//! Exposes the board service and its WebSocket front end for use in tests
//! and embedding. Boards are held in memory; each board has a single
//! serialization point that orders every mutation and the events they
//! produce.

pub mod activity;
pub mod auth;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod ordering;
pub mod registry;
pub mod server;
pub mod service;
pub mod store;

pub use error::ServiceError;
pub use server::{ServerState, start_server, start_server_with_state};
pub use service::{Actor, KanbanService, TaskFilter};
