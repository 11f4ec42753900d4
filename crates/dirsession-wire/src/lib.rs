//! Socket transport for `dirsession-core`.
//!
//! Speaks a JSON-lines directory protocol over a Unix domain socket. The
//! client side ([`WireConnection`], [`WirePool`]) implements the core
//! connection traits; the server side ([`DirectoryServer`]) serves an
//! in-memory [`Directory`] and is used as a local backend and in tests.

pub mod client;
pub mod directory;
pub mod error;
pub mod filter;
pub mod protocol;
pub mod server;

pub use client::{PoolOptions, WireConnection, WirePool};
pub use directory::Directory;
pub use filter::Filter;
pub use server::DirectoryServer;
