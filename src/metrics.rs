//! Metrics registration for the core.
//!
//! A [`Metrics`] handle owns an optional prometheus [`Registry`] and is
//! passed into constructors at boot; components register their collectors
//! through it instead of touching a process-global. When metrics are
//! disabled the handle is inert and registration returns `None`.

use prometheus::{Encoder, GaugeVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Metrics {
    registry: Option<Arc<Registry>>,
}

impl Metrics {
    pub fn new(enable: bool) -> Self {
        Self {
            registry: enable.then(|| Arc::new(Registry::new())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.registry.is_some()
    }

    /// Registers a gauge; `None` when metrics are disabled.
    pub fn register_gauge(&self, name: &str, help: &str) -> Option<IntGauge> {
        let registry = self.registry.as_ref()?;
        let gauge = IntGauge::new(name, help).ok()?;
        registry.register(Box::new(gauge.clone())).ok()?;
        Some(gauge)
    }

    /// Registers a labelled gauge family; `None` when metrics are disabled.
    pub fn register_gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> Option<GaugeVec> {
        let registry = self.registry.as_ref()?;
        let gauge = GaugeVec::new(Opts::new(name, help), labels).ok()?;
        registry.register(Box::new(gauge.clone())).ok()?;
        Some(gauge)
    }

    /// Renders all registered metrics in the prometheus text format.
    /// Empty when metrics are disabled.
    pub fn render(&self) -> String {
        let Some(registry) = self.registry.as_ref() else {
            return String::new();
        };
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_are_inert() {
        let metrics = Metrics::new(false);
        assert!(!metrics.is_enabled());
        assert!(metrics.register_gauge("g", "help").is_none());
        assert!(metrics.register_gauge_vec("gv", "help", &["group"]).is_none());
        assert_eq!(metrics.render(), "");
    }

    #[test]
    fn test_enabled_metrics_render() {
        let metrics = Metrics::new(true);
        let gauge = metrics.register_gauge("warden_test_gauge", "a test gauge").unwrap();
        gauge.set(3);

        let vec = metrics
            .register_gauge_vec("warden_test_cache", "entries", &["group"])
            .unwrap();
        vec.with_label_values(&["adblock"]).set(2.0);

        let rendered = metrics.render();
        assert!(rendered.contains("warden_test_gauge 3"));
        assert!(rendered.contains("warden_test_cache{group=\"adblock\"} 2"));
    }
}
