//! Salvage Grid worker node.
//!
//! Reference implementation of the worker side of the wire contract:
//! register with capabilities, heartbeat, execute assigned tasks through a
//! [`handlers::TaskHandler`] registry, and report results.

pub mod handlers;
pub mod worker;

pub use handlers::{HandlerError, HandlerRegistry, TaskHandler};
pub use worker::{Worker, WorkerConfig};
