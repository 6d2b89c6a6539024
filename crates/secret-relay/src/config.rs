//! Configuration file handling.
//!
//! The controller reads one YAML file. Every string field passes
//! through environment expansion before validation, so secrets like the
//! Vault token can be injected as `$VAULT_TOKEN`.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::expand;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config file: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub raft_dir: String,
    pub vault: VaultSection,
    pub kubernetes: KubernetesSection,
    pub prometheus: PrometheusSection,
    pub poll_pods_frequency_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            raft_dir: "/var/lib/secret-relay".to_string(),
            vault: VaultSection::default(),
            kubernetes: KubernetesSection::default(),
            prometheus: PrometheusSection::default(),
            poll_pods_frequency_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultSection {
    pub addr: String,
    pub token: String,
    pub skip_token_role_name_validation: bool,
    #[serde(rename = "wrappingTTL")]
    pub wrapping_ttl: String,
    pub tls: VaultTlsSection,
}

impl Default for VaultSection {
    fn default() -> Self {
        Self {
            addr: String::new(),
            token: String::new(),
            skip_token_role_name_validation: false,
            wrapping_ttl: relay_common::DEFAULT_WRAPPING_TTL.to_string(),
            tls: VaultTlsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultTlsSection {
    #[serde(rename = "vaultCABackends")]
    pub vault_ca_backends: Vec<String>,
    pub ca_cert: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesSection {
    pub watch_namespace: String,
    pub service_namespace: String,
    pub service: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrometheusSection {
    pub port: u16,
    pub tls: PrometheusTlsSection,
}

impl Default for PrometheusSection {
    fn default() -> Self {
        Self {
            port: 9102,
            tls: PrometheusTlsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrometheusTlsSection {
    pub vault_cert_backend: String,
    pub vault_cert_role: String,
    #[serde(rename = "vaultCABackends")]
    pub vault_ca_backends: Vec<String>,
    pub cert_file: String,
    pub cert_key: String,
    pub ca_cert: String,
}

impl Config {
    /// Read, parse and env-expand a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        Ok(config.expand_env())
    }

    /// Apply environment expansion to every string-valued field.
    pub fn expand_env(mut self) -> Self {
        expand::in_place(&mut self.raft_dir);

        expand::in_place(&mut self.vault.addr);
        expand::in_place(&mut self.vault.token);
        expand::in_place(&mut self.vault.wrapping_ttl);
        expand::each(&mut self.vault.tls.vault_ca_backends);
        expand::in_place(&mut self.vault.tls.ca_cert);

        expand::in_place(&mut self.kubernetes.watch_namespace);
        expand::in_place(&mut self.kubernetes.service_namespace);
        expand::in_place(&mut self.kubernetes.service);

        expand::in_place(&mut self.prometheus.tls.vault_cert_backend);
        expand::in_place(&mut self.prometheus.tls.vault_cert_role);
        expand::each(&mut self.prometheus.tls.vault_ca_backends);
        expand::in_place(&mut self.prometheus.tls.cert_file);
        expand::in_place(&mut self.prometheus.tls.cert_key);
        expand::in_place(&mut self.prometheus.tls.ca_cert);

        self
    }

    /// Cross-field validation, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let tls = &self.prometheus.tls;
        let has_vault_cert = !tls.vault_cert_backend.is_empty() || !tls.vault_cert_role.is_empty();
        let has_file_cert = !tls.cert_file.is_empty() || !tls.cert_key.is_empty();

        if (has_vault_cert || has_file_cert) && has_vault_cert == has_file_cert {
            errors.push(
                "contradictory TLS configuration: manage the metrics certificate either through \
                 vault (prometheus.tls.vaultCertBackend and prometheus.tls.vaultCertRole) or \
                 with your own files (prometheus.tls.certFile and prometheus.tls.certKey), not both"
                    .to_string(),
            );
        } else {
            if !tls.vault_cert_backend.is_empty() != !tls.vault_cert_role.is_empty() {
                errors.push(
                    "both prometheus.tls.vaultCertBackend and prometheus.tls.vaultCertRole must \
                     be provided to serve metrics over https using vault as the certificate \
                     authority"
                        .to_string(),
                );
            }

            if !tls.cert_file.is_empty() != !tls.cert_key.is_empty() {
                errors.push(
                    "both prometheus.tls.certFile and prometheus.tls.certKey must be provided to \
                     serve metrics over https using your own certificate"
                        .to_string(),
                );
            }
        }

        if self.vault.addr.is_empty() {
            errors.push("vault.addr is required".to_string());
        }

        if self.vault.token.is_empty() {
            errors.push("vault.token is required".to_string());
        }

        if !self.vault.tls.vault_ca_backends.is_empty() && !self.vault.tls.ca_cert.is_empty() {
            errors.push(
                "contradictory vault TLS configuration: verify the vault server either with CA \
                 backends (vault.tls.vaultCABackends) or with a root CA file (vault.tls.caCert), \
                 not both"
                    .to_string(),
            );
        }

        if self.kubernetes.watch_namespace.is_empty() {
            errors.push("kubernetes.watchNamespace is required".to_string());
        }

        if self.kubernetes.service_namespace.is_empty() {
            errors.push("kubernetes.serviceNamespace is required".to_string());
        }

        if self.kubernetes.service.is_empty() {
            errors.push("kubernetes.service is required".to_string());
        }

        if !tls.vault_ca_backends.is_empty() && !tls.ca_cert.is_empty() {
            errors.push(
                "contradictory prometheus TLS configuration: verify scrapers either with CA \
                 backends (prometheus.tls.vaultCABackends) or with a root CA file \
                 (prometheus.tls.caCert), not both"
                    .to_string(),
            );
        }

        let has_client_cas = !tls.vault_ca_backends.is_empty() || !tls.ca_cert.is_empty();
        let has_server_cert = (!tls.vault_cert_backend.is_empty()
            && !tls.vault_cert_role.is_empty())
            || (!tls.cert_file.is_empty() && !tls.cert_key.is_empty());

        if has_client_cas && !has_server_cert {
            errors.push(
                "client certificate authentication for the metrics endpoint requires a server \
                 certificate source (prometheus.tls.vaultCertBackend/vaultCertRole or \
                 prometheus.tls.certFile/certKey)"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
vault:
  addr: https://vault:8200
  token: s.token
kubernetes:
  watchNamespace: default
  serviceNamespace: kube-system
  service: secret-relay
"#
    }

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    // ── Parsing & defaults ─────────────────────────────────────────

    #[test]
    fn minimal_config_is_valid_with_defaults() {
        let config = parse(minimal_yaml());
        config.validate().unwrap();

        assert_eq!(config.raft_dir, "/var/lib/secret-relay");
        assert_eq!(config.vault.wrapping_ttl, "60s");
        assert_eq!(config.poll_pods_frequency_secs, 20);
        assert_eq!(config.prometheus.port, 9102);
    }

    #[test]
    fn wrapping_ttl_uses_the_original_key_spelling() {
        let config = parse(
            r#"
vault:
  wrappingTTL: 90s
"#,
        );
        assert_eq!(config.vault.wrapping_ttl, "90s");
    }

    #[test]
    fn ca_backend_lists_parse() {
        let config = parse(
            r#"
vault:
  tls:
    vaultCABackends: [pki-a, pki-b]
prometheus:
  tls:
    vaultCABackends: [pki-clients]
    vaultCertBackend: pki
    vaultCertRole: metrics
"#,
        );
        assert_eq!(config.vault.tls.vault_ca_backends, vec!["pki-a", "pki-b"]);
        assert_eq!(config.prometheus.tls.vault_ca_backends, vec!["pki-clients"]);
    }

    // ── Validation ─────────────────────────────────────────────────

    #[test]
    fn missing_required_fields_are_all_reported() {
        let config = parse("{}");
        let message = config.validate().unwrap_err().to_string();

        assert!(message.contains("vault.addr is required"));
        assert!(message.contains("vault.token is required"));
        assert!(message.contains("kubernetes.watchNamespace is required"));
        assert!(message.contains("kubernetes.serviceNamespace is required"));
        assert!(message.contains("kubernetes.service is required"));
    }

    #[test]
    fn vault_and_file_certificates_together_are_contradictory() {
        let mut config = parse(minimal_yaml());
        config.prometheus.tls.vault_cert_backend = "pki".into();
        config.prometheus.tls.vault_cert_role = "metrics".into();
        config.prometheus.tls.cert_file = "/tls/cert.pem".into();
        config.prometheus.tls.cert_key = "/tls/key.pem".into();

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("contradictory TLS configuration"));
    }

    #[test]
    fn vault_cert_backend_requires_role() {
        let mut config = parse(minimal_yaml());
        config.prometheus.tls.vault_cert_backend = "pki".into();

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("vaultCertRole"));
    }

    #[test]
    fn cert_file_requires_key() {
        let mut config = parse(minimal_yaml());
        config.prometheus.tls.cert_file = "/tls/cert.pem".into();

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("certKey"));
    }

    #[test]
    fn vault_ca_backends_and_ca_file_are_exclusive() {
        let mut config = parse(minimal_yaml());
        config.vault.tls.vault_ca_backends = vec!["pki".into()];
        config.vault.tls.ca_cert = "/tls/ca.pem".into();

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("contradictory vault TLS configuration"));
    }

    #[test]
    fn client_cas_require_a_server_certificate() {
        let mut config = parse(minimal_yaml());
        config.prometheus.tls.ca_cert = "/tls/clients.pem".into();

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("requires a server certificate source"));
    }

    #[test]
    fn complete_tls_config_is_valid() {
        let mut config = parse(minimal_yaml());
        config.prometheus.tls.vault_cert_backend = "pki".into();
        config.prometheus.tls.vault_cert_role = "metrics".into();
        config.prometheus.tls.vault_ca_backends = vec!["pki".into()];

        config.validate().unwrap();
    }

    // ── Environment expansion ──────────────────────────────────────

    #[test]
    fn expansion_reaches_nested_string_fields() {
        std::env::set_var("TEST_RELAY_TOKEN", "s.expanded");
        std::env::set_var("TEST_RELAY_NS", "prod");

        let mut config = parse(minimal_yaml());
        config.vault.token = "$TEST_RELAY_TOKEN".into();
        config.kubernetes.watch_namespace = "~${TEST_RELAY_NS}-.*".into();
        config.vault.tls.vault_ca_backends = vec!["pki-${TEST_RELAY_NS}".into()];

        let config = config.expand_env();
        assert_eq!(config.vault.token, "s.expanded");
        assert_eq!(config.kubernetes.watch_namespace, "~prod-.*");
        assert_eq!(config.vault.tls.vault_ca_backends, vec!["pki-prod"]);
    }
}
