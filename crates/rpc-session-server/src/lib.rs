//! Server side of resumable RPC sessions.
//!
//! Provides:
//! - `Session` - Event-sourced session aggregate
//! - `SessionManager` - Initialize, resume, pause, terminate and reap sessions
//! - `LoopbackTransport` - In-process transport for tests and demos
//! - Storage implementations (memory)

pub mod config;
pub mod cursor;
pub mod handler;
pub mod loopback;
pub mod manager;
pub mod session;
pub mod storage;

pub use config::ManagerConfig;
pub use handler::{DefaultHandler, ServerHandler, SessionIdGenerator, UuidGenerator};
pub use loopback::LoopbackTransport;
pub use manager::{ResumeHandle, SessionManager};
pub use session::{Handshake, NoopHooks, Session, SessionHooks};
