use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretIdError {
    #[error("secret_id is empty")]
    EmptySecretId,

    #[error("creation time is not set")]
    MissingCreationTime,

    #[error("vault server address is not set")]
    MissingVaultAddr,

    #[error("secret_id expired at {0}")]
    Expired(DateTime<Utc>),
}

/// A single-use wrapping handle minted by the Vault server.
///
/// The helper calls back to `vault_addr`, unwraps `secret_id` exactly once,
/// and logs in with it. The field names below are the wire contract with
/// the helper and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedSecretId {
    #[serde(rename = "token")]
    pub secret_id: String,

    #[serde(rename = "creationTime")]
    pub creation_time: DateTime<Utc>,

    pub ttl: u64,

    #[serde(rename = "vaultAddr")]
    pub vault_addr: String,

    #[serde(rename = "vaultCAs", default, skip_serializing_if = "Option::is_none")]
    pub vault_cas: Option<String>,
}

impl WrappedSecretId {
    /// Check that the handle is complete and still exchangeable.
    pub fn validate(&self) -> Result<(), SecretIdError> {
        if self.secret_id.is_empty() {
            return Err(SecretIdError::EmptySecretId);
        }

        if self.creation_time.timestamp() <= 0 {
            return Err(SecretIdError::MissingCreationTime);
        }

        if self.vault_addr.is_empty() {
            return Err(SecretIdError::MissingVaultAddr);
        }

        let expires_at = self.creation_time + Duration::seconds(self.ttl as i64);

        if expires_at < Utc::now() {
            return Err(SecretIdError::Expired(expires_at));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn valid_secret_id() -> WrappedSecretId {
        WrappedSecretId {
            secret_id: "s.wrapped".to_string(),
            creation_time: Utc::now(),
            ttl: 60,
            vault_addr: "https://vault:8200".to_string(),
            vault_cas: None,
        }
    }

    // ── Validation ─────────────────────────────────────────────────

    #[test]
    fn valid_secret_id_passes() {
        assert_eq!(valid_secret_id().validate(), Ok(()));
    }

    #[test]
    fn empty_secret_id_rejected() {
        let mut s = valid_secret_id();
        s.secret_id = String::new();
        assert_eq!(s.validate(), Err(SecretIdError::EmptySecretId));
    }

    #[test]
    fn missing_creation_time_rejected() {
        let mut s = valid_secret_id();
        s.creation_time = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(s.validate(), Err(SecretIdError::MissingCreationTime));
    }

    #[test]
    fn missing_vault_addr_rejected() {
        let mut s = valid_secret_id();
        s.vault_addr = String::new();
        assert_eq!(s.validate(), Err(SecretIdError::MissingVaultAddr));
    }

    #[test]
    fn expired_secret_id_rejected() {
        let mut s = valid_secret_id();
        s.creation_time = Utc::now() - Duration::seconds(120);
        s.ttl = 60;
        assert!(matches!(s.validate(), Err(SecretIdError::Expired(_))));
    }

    #[test]
    fn not_yet_expired_secret_id_passes() {
        let mut s = valid_secret_id();
        s.creation_time = Utc::now() - Duration::seconds(30);
        s.ttl = 60;
        assert_eq!(s.validate(), Ok(()));
    }

    // ── Wire format ────────────────────────────────────────────────

    #[test]
    fn serializes_with_wire_field_names() {
        let s = WrappedSecretId {
            secret_id: "T1".to_string(),
            creation_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ttl: 60,
            vault_addr: "https://s:8200".to_string(),
            vault_cas: None,
        };

        let value = serde_json::to_value(&s).unwrap();
        assert_eq!(value["token"], "T1");
        assert_eq!(value["creationTime"], "2024-01-01T00:00:00Z");
        assert_eq!(value["ttl"], 60);
        assert_eq!(value["vaultAddr"], "https://s:8200");
        // vaultCAs is omitted entirely when absent
        assert!(value.get("vaultCAs").is_none());
    }

    #[test]
    fn round_trip_preserves_all_fields() {
        let mut s = valid_secret_id();
        s.vault_cas = Some("-----BEGIN CERTIFICATE-----\n...".to_string());

        let json = serde_json::to_string(&s).unwrap();
        let back: WrappedSecretId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn deserializes_without_vault_cas() {
        let json = r#"{
            "token": "T1",
            "creationTime": "2024-01-01T00:00:00Z",
            "ttl": 60,
            "vaultAddr": "https://s:8200"
        }"#;

        let s: WrappedSecretId = serde_json::from_str(json).unwrap();
        assert_eq!(s.secret_id, "T1");
        assert_eq!(s.vault_cas, None);
    }
}
