//! Fluent builders for test configuration.

use std::path::{Path, PathBuf};

use vdesk::config::HealthConfig;

/// Fluent builder for [`HealthConfig`] in tests.
///
/// Defaults keep a test fast: state under the given directory, no settle
/// pause, one-second timeouts, a `qemu-system` process pattern, and a
/// bootstrap unit named `vdesk-bootstrap.service`.
///
/// # Example
///
/// ```ignore
/// let config = HealthConfigBuilder::new(&dir)
///     .with_ssh_port(listener_port)
///     .with_max_retries(2)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct HealthConfigBuilder {
    config: HealthConfig,
}

impl HealthConfigBuilder {
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            config: HealthConfig {
                host: "127.0.0.1".to_string(),
                state_dir: state_dir.to_path_buf(),
                max_retries: 3,
                probe_timeout_secs: 1,
                remediation_timeout_secs: 1,
                settle_secs: 0,
                lock_timeout_secs: 1,
                bootstrap_service: Some("vdesk-bootstrap.service".to_string()),
                use_sudo: false,
                ..HealthConfig::default()
            },
        }
    }

    #[must_use]
    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.config.ssh_port = port;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_services(mut self, services: &[&str]) -> Self {
        self.config.required_services = services.iter().map(|s| (*s).to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_pidfile(mut self, pidfile: impl Into<PathBuf>) -> Self {
        self.config.vm_pidfile = Some(pidfile.into());
        self
    }

    #[must_use]
    pub fn with_health_url(mut self, url: &str) -> Self {
        self.config.health_url = Some(url.to_string());
        self
    }

    #[must_use]
    pub fn without_bootstrap_service(mut self) -> Self {
        self.config.bootstrap_service = None;
        self
    }

    #[must_use]
    pub fn build(self) -> HealthConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_a_valid_config() {
        let config = HealthConfigBuilder::new(Path::new("/tmp/vdesk-test"))
            .with_ssh_port(2200)
            .with_max_retries(2)
            .build();
        assert!(config.validate().is_ok());
        assert_eq!(config.ssh_port, 2200);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.settle_secs, 0);
    }
}
