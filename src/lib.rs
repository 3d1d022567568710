//! Request admission and threat mitigation for an HTTP API.
//!
//! Every inbound request passes through [`security::AdmissionPipeline`], which decides
//! whether it is forwarded, throttled or refused, and escalates abusive clients into
//! time-bounded bans. [`app::protect`] wraps any axum [`Router`](axum::Router) with the
//! complete stack.

pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod security;
pub mod sig_down;
pub mod telemetry;
