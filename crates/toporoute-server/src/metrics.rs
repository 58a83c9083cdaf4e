// Metric descriptions for the coordinator and the optional Prometheus endpoint

use std::net::SocketAddr;

use anyhow::Context;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use toporoute_common::metrics::{
    ASSIGNMENT_PUBLISH, ASSIGNMENT_PUBLISH_ERRORS, GLOBAL_TOPICS, GOSSIP_MESSAGES, LEADER_CHANGES,
};

/// Describe every metric the coordinator records.
/// Should be called once at startup, after any recorder is installed.
pub fn init_metrics() {
    describe_counter!(LEADER_CHANGES, "Number of times this node saw a new leader");
    describe_counter!(
        ASSIGNMENT_PUBLISH,
        "Total number of assignment publish attempts by the leader"
    );
    describe_counter!(
        ASSIGNMENT_PUBLISH_ERRORS,
        "Total number of failed assignment publishes"
    );
    describe_counter!(GOSSIP_MESSAGES, "Topic ownership gossip messages by direction");
    describe_gauge!(GLOBAL_TOPICS, "Topics with at least one live owner");

    tracing::info!("Metrics initialized");
}

/// Serve `/metrics` on `listen`; without a recorder metrics are dropped
pub fn install_prometheus(listen: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", listen))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use metrics::{
        Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    };

    use super::*;

    /// Records the names passed to `describe_*`
    #[derive(Default)]
    struct DescribedNames(Mutex<Vec<String>>);

    impl DescribedNames {
        fn push(&self, key: KeyName) {
            self.0.lock().unwrap().push(key.as_str().to_string());
        }
    }

    impl Recorder for DescribedNames {
        fn describe_counter(&self, key: KeyName, _: Option<Unit>, _: SharedString) {
            self.push(key);
        }

        fn describe_gauge(&self, key: KeyName, _: Option<Unit>, _: SharedString) {
            self.push(key);
        }

        fn describe_histogram(&self, key: KeyName, _: Option<Unit>, _: SharedString) {
            self.push(key);
        }

        fn register_counter(&self, _: &Key, _: &Metadata<'_>) -> Counter {
            Counter::noop()
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn test_init_describes_every_recorded_metric() {
        let recorder = DescribedNames::default();
        metrics::with_local_recorder(&recorder, init_metrics);

        let mut described = recorder.0.lock().unwrap().clone();
        described.sort();
        let mut expected: Vec<String> =
            toporoute_common::metrics::ALL.iter().map(|name| name.to_string()).collect();
        expected.sort();
        assert_eq!(described, expected);
    }

    #[test]
    fn test_invalid_listen_address_is_rejected() {
        assert!(install_prometheus("not-an-address").is_err());
    }
}
