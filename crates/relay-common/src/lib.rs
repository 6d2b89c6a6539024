//! Types shared between the controller and the in-pod helper.
//!
//! The only wire-visible type is [`WrappedSecretId`], the single-use
//! wrapping handle the controller POSTs to a pod's helper endpoint. The
//! helper exchanges it at the Vault server for a durable AppRole token,
//! so both sides must agree exactly on its JSON shape and validity rules.

mod net;
mod secret;

pub use self::net::external_ip;
pub use self::secret::{SecretIdError, WrappedSecretId};

use std::time::Duration;

/// Port the helper process listens on inside every pod.
pub const HELPER_PORT: u16 = 8443;

/// Default UDP port for gossip membership.
pub const DEFAULT_GOSSIP_PORT: u16 = 45678;

/// Default interval for the leader's safety-net pod listing.
pub const DEFAULT_POLL_PODS_FREQUENCY: Duration = Duration::from_secs(20);

/// Per-request deadline when POSTing a wrapped secret-id to a helper.
pub const HTTP_POST_TIMEOUT: Duration = Duration::from_secs(30);

/// Total time budget for delivering a wrapped secret-id, retries included.
pub const MAX_HTTP_POST_TIME: Duration = Duration::from_secs(180);

/// Default response-wrapping TTL requested from the Vault server.
pub const DEFAULT_WRAPPING_TTL: &str = "60s";
