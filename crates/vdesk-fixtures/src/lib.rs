//! Test utilities and fakes for vdesk integration tests.
//!
//! - [`ScriptedExecutor`] - remote command executor answering from a script
//! - [`FakeServices`] - in-memory service manager with start hooks
//! - [`RecordingDriver`] - input driver that records calls and writes fake captures
//! - [`HealthConfigBuilder`] - supervisor configuration with test-friendly defaults
//! - [`temp_dir`] / [`write_config`] - scratch directories and config files
//!
//! # Example
//!
//! ```ignore
//! use vdesk_fixtures::{FakeServices, HealthConfigBuilder, ScriptedExecutor, temp_dir};
//!
//! let dir = temp_dir("scenario-b");
//! let config = HealthConfigBuilder::new(&dir).with_ssh_port(port).build();
//! let remote = ScriptedExecutor::new().respond("test -f", 1, "");
//! let services = FakeServices::new();
//! ```

// Test fixtures crate - relaxed lints for test utilities
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod builders;
pub mod fakes;
pub mod helpers;

pub use builders::HealthConfigBuilder;
pub use fakes::{DriverCall, FakeServices, RecordingDriver, ScriptedExecutor};
pub use helpers::{temp_dir, write_config};
