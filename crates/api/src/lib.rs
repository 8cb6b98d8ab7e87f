//! Clipcast API shell.
//!
//! A thin request-handling layer around the billing services: webhook
//! intake, plan listing, balance lookups, and admin operations. Request
//! auth and session handling sit in front of this service and are not part
//! of this crate.

pub mod error;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
