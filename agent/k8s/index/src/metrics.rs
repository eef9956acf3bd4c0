use crate::SharedStore;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedStore);

pub fn register(reg: &mut Registry, store: SharedStore) {
    reg.register_collector(Box::new(Instrumented(store)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let (bindings, backends) = {
            let store = self.0.read();
            (store.len(), store.backends_len())
        };

        let bindings_encoder = encoder.encode_descriptor(
            "store_bindings",
            "The number of service bindings in the desired state",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(bindings as u32).encode(bindings_encoder)?;

        let backends_encoder = encoder.encode_descriptor(
            "store_backends",
            "The number of backend endpoints across all service bindings",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(backends as u32).encode(backends_encoder)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use std::{collections::BTreeSet, num::NonZeroU16};
    use walden_agent_core::{BackendEndpoint, ServiceIdentity};

    #[test]
    fn encodes_store_size() {
        let store = Store::shared();
        store.write().upsert_backends(
            ServiceIdentity::new("default", "web"),
            [
                BackendEndpoint::new("10.1.0.3".parse().unwrap(), NonZeroU16::new(8080).unwrap()),
                BackendEndpoint::new("10.1.0.4".parse().unwrap(), NonZeroU16::new(8080).unwrap()),
            ]
            .into_iter()
            .collect::<BTreeSet<_>>(),
        );

        let mut reg = Registry::default();
        register(reg.sub_registry_with_prefix("walden"), store);

        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &reg).unwrap();
        assert!(text.contains("walden_store_bindings 1"), "{text}");
        assert!(text.contains("walden_store_backends 2"), "{text}");
    }
}
