//! Multi-process video ingest and distribution service for edge camera
//! devices: `producerd` manages capture pipelines, `consumerd` manages
//! outgoing targets (SRT streams, recordings, still captures), and the two
//! communicate only through Unix-domain sockets and POSIX shared memory —
//! never a shared address space.

pub mod adaptor;
pub mod config;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod mapper;
pub mod media;
pub mod pipeline;
pub mod registry;
pub mod target;
pub mod types;
pub mod worker;

pub use error::{Result, StreamError};
