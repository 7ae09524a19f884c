#![warn(missing_docs, rust_2018_idioms)]

//! rivet is a small, high-concurrency HTTP/1.1 server built around a
//! single-reactor, multi-worker design: an epoll loop drives accept,
//! read, write, and hang-up events; worker threads run the per-connection
//! parse/respond state machine; an indexed min-heap tracks idle
//! deadlines; and a bounded queue feeds an asynchronous log writer.
//!
//! Static files are served from a resource root with memory-mapped
//! bodies, plus a toy form-POST login/register flow backed by a pluggable
//! user store.
//!
//! ```no_run
//! use rivet::{Config, WebServer};
//!
//! let mut server = WebServer::new(Config::default()).expect("server init");
//! server.run();
//! ```

pub mod buffer;
pub mod epoll;
pub mod http;
pub mod logger;
pub mod pool;
pub mod queue;
pub mod server;
pub mod timer;

pub use server::{Config, Handle, TriggerMode, WebServer};
