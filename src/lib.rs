//! Previewgate - on-demand preview environments behind a single port
//!
//! This library provides a preview control plane that:
//! - Copies a project template into an isolated directory per preview id
//! - Installs dependencies once and starts a dev server on a leased port
//! - Probes the dev server until it accepts connections
//! - Proxies HTTP and WebSocket traffic under `/p/{id}/`, restarting crashed previews
//! - Reaps previews that have been idle for longer than a configurable timeout
//! - Hands a preview off to an external deploy command and redirects to the result

pub mod admin;
pub mod config;
pub mod deploy;
pub mod error;
pub mod logs;
pub mod manager;
pub mod pool;
pub mod ports;
pub mod probe;
pub mod proxy;
pub mod registry;
pub mod supervisor;
pub mod workspace;
