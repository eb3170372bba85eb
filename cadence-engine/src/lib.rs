//! Offline-first sync engine for Cadence.
//!
//! Local-first: every read and write works against a SQLite database on
//! the device, with mutations recorded in a durable operation queue while a
//! session exists. Reconciliation replays the queue against the server and
//! applies the server's answer as truth. The engine is single-threaded;
//! drive it from one task and await its sync entry points.
//!
//! ```no_run
//! # use cadence_engine::{Engine, HttpTransport, AuthProvider, Session};
//! struct HostAuth;
//! impl AuthProvider for HostAuth {
//!     fn session(&self) -> Option<Session> {
//!         None
//!     }
//! }
//!
//! # fn main() -> Result<(), cadence_engine::EngineError> {
//! let engine = Engine::new(
//!     HttpTransport::new("https://api.example.com"),
//!     HostAuth,
//!     "cadence.db",
//! );
//! let goal = engine.create_goal("Morning run", "#5B8C5A", Some(3), None)?;
//! engine.create_completion(&goal.id, chrono::Utc::now().date_naive())?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod engine;
pub mod store;
pub mod sync;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use auth::{AuthProvider, Session};
pub use engine::{Engine, EngineError, GoalUpdate, PeriodProgress};
pub use store::{LocalStore, StoreError};
pub use sync::{StatusListenerKey, SyncStatus};
pub use transport::{HttpTransport, SyncTransport, TransportError};
