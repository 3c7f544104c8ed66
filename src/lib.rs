//! Netkit - TCP client/server plumbing
//!
//! Arsitektur:
//! - Client: connect/send/receive non-blocking, completion lewat callback
//! - Server: accept loop + dispatch ke thread per koneksi atau worker pool
//! - Backpressure: pool penuh = accept ditahan, koneksi antre di backlog OS

pub mod client;
pub mod encoding;
pub mod error;
pub mod event;
pub mod server;

mod socket;

pub use client::{AsyncClient, ClientConfig, ClientEvents, CompletionBuffer};
pub use encoding::Encoding;
pub use error::{ClientError, ServerError, ShutdownError};
pub use event::Event;
pub use server::{Connection, DispatchStrategy, Server, ServerConfig, WorkerPool};
