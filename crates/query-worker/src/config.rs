use anyhow::{Context, Result};
use query_exchange::MailboxServiceConfig;
use query_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub transport: TransportConfig,
    pub mailbox: MailboxServiceConfig,
    /// Seconds between allocator gauge reports; 0 disables them
    pub metrics_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            mailbox: MailboxServiceConfig::default(),
            metrics_interval_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: WorkerConfig = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn metrics_interval(&self) -> Option<Duration> {
        (self.metrics_interval_secs > 0).then(|| Duration::from_secs(self.metrics_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "transport": {{ "port": 9100 }}, "mailbox": {{ "queue_capacity": 4 }} }}"#
        )
        .unwrap();

        let config = WorkerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.transport.port, 9100);
        assert_eq!(config.mailbox.queue_capacity, 4);
        assert_eq!(config.mailbox.send_timeout_ms, 10_000);
        assert_eq!(config.metrics_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_missing_file() {
        assert!(WorkerConfig::from_file(Path::new("/nonexistent/worker.json")).is_err());
    }
}
