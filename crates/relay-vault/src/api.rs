//! Response envelopes for the Vault HTTP API.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::{Result, VaultError};

/// The generic Vault response envelope. Exactly one of `data`,
/// `wrap_info` or `auth` is meaningful per endpoint.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct Secret {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub wrap_info: Option<WrapInfo>,
    #[serde(default)]
    pub auth: Option<Auth>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WrapInfo {
    pub token: String,
    pub ttl: u64,
    pub creation_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Auth {
    pub lease_duration: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrors {
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Fields of a token self-lookup relevant to validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TokenData {
    #[serde(default)]
    pub creation_ttl: u64,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub role: String,
}

/// Fields of a token role read relevant to validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RoleData {
    #[serde(default)]
    pub explicit_max_ttl: u64,
    #[serde(default)]
    pub period: u64,
    #[serde(default)]
    pub renewable: bool,
}

/// Decode the `data` block of a secret into a typed struct.
pub(crate) fn decode_data<T: DeserializeOwned>(secret: &Secret) -> Result<T> {
    let data = secret
        .data
        .clone()
        .ok_or_else(|| VaultError::Malformed("response has no data block".into()))?;

    serde_json::from_value(data)
        .map_err(|error| VaultError::Malformed(format!("could not decode data block: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_response_parses() {
        let secret: Secret = serde_json::from_str(
            r#"{
                "request_id": "",
                "wrap_info": {
                    "token": "s.wrapped",
                    "ttl": 60,
                    "creation_time": "2024-01-01T00:00:00Z",
                    "creation_path": "auth/approle/role/app-a/secret-id"
                }
            }"#,
        )
        .unwrap();

        let wrap = secret.wrap_info.unwrap();
        assert_eq!(wrap.token, "s.wrapped");
        assert_eq!(wrap.ttl, 60);
        assert_eq!(wrap.creation_time.timestamp(), 1_704_067_200);
    }

    #[test]
    fn lookup_self_data_decodes() {
        let secret: Secret = serde_json::from_str(
            r#"{
                "data": {
                    "creation_ttl": 3600,
                    "ttl": 3200,
                    "renewable": true,
                    "policies": ["default", "apps"],
                    "role": "controller",
                    "num_uses": 0
                }
            }"#,
        )
        .unwrap();

        let data: TokenData = decode_data(&secret).unwrap();
        assert_eq!(data.creation_ttl, 3600);
        assert_eq!(data.role, "controller");
        assert!(data.renewable);
    }

    #[test]
    fn missing_fields_default() {
        let secret: Secret = serde_json::from_str(r#"{"data": {}}"#).unwrap();
        let data: TokenData = decode_data(&secret).unwrap();
        assert_eq!(data.ttl, 0);
        assert!(!data.renewable);
        assert!(data.role.is_empty());
    }

    #[test]
    fn missing_data_block_is_malformed() {
        let secret: Secret = serde_json::from_str("{}").unwrap();
        let result: Result<TokenData> = decode_data(&secret);
        assert!(matches!(result, Err(VaultError::Malformed(_))));
    }

    #[test]
    fn renew_self_auth_parses() {
        let secret: Secret = serde_json::from_str(
            r#"{"auth": {"client_token": "s.abc", "lease_duration": 2764800, "renewable": true}}"#,
        )
        .unwrap();

        assert_eq!(secret.auth.unwrap().lease_duration, 2_764_800);
    }
}
