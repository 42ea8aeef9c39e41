//! Prometheus counters for node operations

use prometheus_client::metrics::{counter::Counter, family::Family, gauge::Gauge};
use prometheus_client::registry::Registry;

#[derive(Clone, Default)]
pub struct NodeMetrics {
    pub stores: Counter,
    pub gets_local: Counter,
    pub gets_network: Counter,
    pub fetch_timeouts: Counter,
    pub removes: Counter,
    pub inbound_messages: Family<Vec<(String, String)>, Counter>,
    pub bytes_sent: Counter,
    pub bytes_received: Counter,
    pub peers: Gauge,
}

impl NodeMetrics {
    /// Fresh metrics, registered under the `scatter_` prefix.
    pub fn new(registry: &mut Registry) -> Self {
        let m = Self::default();
        m.register(registry);
        m
    }

    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "scatter_stores",
            "Files stored through this node",
            self.stores.clone(),
        );
        registry.register(
            "scatter_gets_local",
            "Gets served from local storage",
            self.gets_local.clone(),
        );
        registry.register(
            "scatter_gets_network",
            "Gets satisfied by fetching from a peer",
            self.gets_network.clone(),
        );
        registry.register(
            "scatter_fetch_timeouts",
            "Network gets that no peer answered in time",
            self.fetch_timeouts.clone(),
        );
        registry.register(
            "scatter_removes",
            "Global removes issued by this node",
            self.removes.clone(),
        );
        registry.register(
            "scatter_inbound_messages",
            "Control messages received from peers",
            self.inbound_messages.clone(),
        );
        registry.register(
            "scatter_bytes_sent",
            "Payload bytes streamed to peers",
            self.bytes_sent.clone(),
        );
        registry.register(
            "scatter_bytes_received",
            "Payload bytes streamed from peers",
            self.bytes_received.clone(),
        );
        registry.register(
            "scatter_peers",
            "Currently registered peers",
            self.peers.clone(),
        );
    }

    pub fn inbound(&self, kind: &str) {
        self.inbound_messages
            .get_or_create(&vec![("kind".to_string(), kind.to_string())])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_encoded_names() {
        let mut registry = Registry::default();
        let m = NodeMetrics::new(&mut registry);
        m.stores.inc();
        m.inbound("get");
        m.peers.set(2);

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains("scatter_stores_total 1"));
        assert!(out.contains("scatter_inbound_messages_total{kind=\"get\"} 1"));
        assert!(out.contains("scatter_peers 2"));
    }
}
