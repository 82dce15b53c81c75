use std::time::Duration;

use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "0.0.0.0:9443".to_string()
}

fn default_tls_cert_path() -> String {
    "/tmp/k8s-webhook-server/serving-certs/tls.crt".to_string()
}

fn default_tls_key_path() -> String {
    "/tmp/k8s-webhook-server/serving-certs/tls.key".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_webhook_path() -> String {
    "/mutate-v1-pod".to_string()
}

fn default_store_timeout_ms() -> u64 {
    10_000
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectorConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: String,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    /// Upper bound for each Kubernetes API call made while admitting a Pod.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl InjectorConfig {
    pub fn load(path: &str) -> Result<Self, Box<figment::Error>> {
        let config: Self = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("CMSTATE_").split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Box<figment::Error>> {
        if self.store_timeout_ms == 0 {
            return Err(Box::new(figment::Error::from(
                "store_timeout_ms must be greater than zero".to_string(),
            )));
        }
        if !self.webhook_path.starts_with('/') {
            return Err(Box::new(figment::Error::from(format!(
                "webhook_path '{}' must start with '/'",
                self.webhook_path
            ))));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let config = InjectorConfig::load("missing.yaml").map_err(|e| *e)?;
            assert_eq!(config.listen_addr, "0.0.0.0:9443");
            assert_eq!(config.webhook_path, "/mutate-v1-pod");
            assert_eq!(config.store_timeout(), Duration::from_secs(10));
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                "listen_addr: 127.0.0.1:9000\nstore_timeout_ms: 2500\n",
            )?;
            jail.set_env("CMSTATE_STORE_TIMEOUT_MS", "750");

            let config = InjectorConfig::load("config.yaml").map_err(|e| *e)?;
            assert_eq!(config.listen_addr, "127.0.0.1:9000");
            assert_eq!(config.store_timeout_ms, 750);
            Ok(())
        });
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("CMSTATE_STORE_TIMEOUT_MS", "0");
            assert!(InjectorConfig::load("config.yaml").is_err());
            Ok(())
        });
    }
}
