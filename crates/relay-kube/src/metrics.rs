use prometheus::{Gauge, Opts, Registry};

/// Gauges owned by the Kubernetes client.
pub struct KubeMetrics {
    /// Number of controller replicas found via the service endpoints.
    pub discovered_nodes: Gauge,
}

impl KubeMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let discovered_nodes = Gauge::with_opts(
            Opts::new(
                "discovered_nodes_total",
                "The total number of nodes discovered using the kubernetes endpoint.",
            )
            .namespace("secretrelay")
            .subsystem("kubernetes"),
        )?;

        registry.register(Box::new(discovered_nodes.clone()))?;

        Ok(Self { discovered_nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_under_the_expected_name() {
        let registry = Registry::new();
        let metrics = KubeMetrics::register(&registry).unwrap();
        metrics.discovered_nodes.set(3.0);

        let families = registry.gather();
        assert_eq!(
            families[0].get_name(),
            "secretrelay_kubernetes_discovered_nodes_total"
        );
    }

    #[test]
    fn double_registration_fails() {
        let registry = Registry::new();
        KubeMetrics::register(&registry).unwrap();
        assert!(KubeMetrics::register(&registry).is_err());
    }
}
