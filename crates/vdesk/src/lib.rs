//! vdesk: keeps a remotely running virtual desktop usable.
//!
//! Three services live here: a health supervisor that probes the guest and
//! restarts what it safely can, an NDJSON action agent that drives the guest's
//! pointer, keyboard and screen, and a TCP relay that exposes guest ports on
//! the host.

#![forbid(unsafe_code)]
// Public API types have docs; internal helpers are documented as needed.
#![allow(missing_docs)]

pub mod agent;
pub mod config;
pub mod error;
pub mod forward;
pub mod health;
pub mod model;
pub mod process;

pub use crate::error::{Error, ErrorCode, Result};
pub use crate::model::*;
