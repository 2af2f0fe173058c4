//! Transfer orchestration: the client that drives uploads and downloads, and
//! the server event loop that answers them.

pub mod client;
pub mod server;

pub use client::{BatchReport, CANCELLED_BY_USER, Client, FileOutcome, FileTransfer};
pub use server::Server;
