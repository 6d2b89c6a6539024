use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// Counters owned by the Vault client.
pub struct VaultMetrics {
    pub secret_id_requests: IntCounterVec,
    pub secret_id_request_failures: IntCounterVec,
    pub token_renewal_requests: IntCounter,
    pub token_renewal_failures: IntCounter,
    pub certificate_renewal_requests: IntCounter,
    pub certificate_renewal_failures: IntCounter,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace("secretrelay").subsystem("vault")
}

impl VaultMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let secret_id_requests = IntCounterVec::new(
            opts(
                "secret_id_requests_total",
                "The total number of requests for an approle's secret_id.",
            ),
            &["approle"],
        )?;

        let secret_id_request_failures = IntCounterVec::new(
            opts(
                "secret_id_requests_failures_total",
                "The total number of requests for an approle's secret_id that failed.",
            ),
            &["approle"],
        )?;

        let token_renewal_requests = IntCounter::with_opts(opts(
            "token_renewal_requests_total",
            "The total number of requests to renew the controller's auth token.",
        ))?;

        let token_renewal_failures = IntCounter::with_opts(opts(
            "token_renewal_request_failures_total",
            "The total number of requests to renew the controller's auth token that failed.",
        ))?;

        let certificate_renewal_requests = IntCounter::with_opts(opts(
            "certificate_renewal_requests_total",
            "The total number of requests to renew the metrics certificate.",
        ))?;

        let certificate_renewal_failures = IntCounter::with_opts(opts(
            "certificate_renewal_request_failures_total",
            "The total number of requests to renew the metrics certificate that failed.",
        ))?;

        registry.register(Box::new(secret_id_requests.clone()))?;
        registry.register(Box::new(secret_id_request_failures.clone()))?;
        registry.register(Box::new(token_renewal_requests.clone()))?;
        registry.register(Box::new(token_renewal_failures.clone()))?;
        registry.register(Box::new(certificate_renewal_requests.clone()))?;
        registry.register(Box::new(certificate_renewal_failures.clone()))?;

        Ok(Self {
            secret_id_requests,
            secret_id_request_failures,
            token_renewal_requests,
            token_renewal_failures,
            certificate_renewal_requests,
            certificate_renewal_failures,
        })
    }
}
