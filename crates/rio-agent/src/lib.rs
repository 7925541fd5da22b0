//! RIO field agent: wiring, request routing, and the admin console.
//!
//! The binary in `main.rs` is a thin CLI over [`agent::run`]; the library
//! surface exists so integration tests can drive the router and admin
//! pieces directly.

pub mod admin;
pub mod agent;
pub mod channels;
pub mod router;
