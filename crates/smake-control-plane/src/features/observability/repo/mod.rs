use prometheus::{opts, Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};

pub struct ObservabilityRepository {
    registry: Registry,
    instances_provisioned_total: IntCounter,
    polling_outcomes_total: IntCounterVec,
    tag_failures_total: IntCounter,
    pool_actions_total: IntCounterVec,
}

impl ObservabilityRepository {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let instances_provisioned_total = IntCounter::with_opts(opts!(
            "smake_instances_provisioned_total",
            "Instances launched through the lifecycle adapter"
        ))?;
        let polling_outcomes_total = IntCounterVec::new(
            opts!(
                "smake_polling_outcomes_total",
                "Readiness polling flows by outcome"
            ),
            &["outcome"],
        )?;
        let tag_failures_total = IntCounter::with_opts(opts!(
            "smake_tag_failures_total",
            "Failed tag application attempts"
        ))?;
        let pool_actions_total = IntCounterVec::new(
            opts!("smake_pool_actions_total", "Pool reconciler actions issued"),
            &["action"],
        )?;

        registry.register(Box::new(instances_provisioned_total.clone()))?;
        registry.register(Box::new(polling_outcomes_total.clone()))?;
        registry.register(Box::new(tag_failures_total.clone()))?;
        registry.register(Box::new(pool_actions_total.clone()))?;

        Ok(Self {
            registry,
            instances_provisioned_total,
            polling_outcomes_total,
            tag_failures_total,
            pool_actions_total,
        })
    }

    pub fn inc_instances_provisioned(&self) {
        self.instances_provisioned_total.inc();
    }

    pub fn inc_polling_outcome(&self, outcome: &str) {
        self.polling_outcomes_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_tag_failures(&self) {
        self.tag_failures_total.inc();
    }

    pub fn inc_pool_action(&self, action: &str) {
        self.pool_actions_total.with_label_values(&[action]).inc();
    }

    pub fn instances_provisioned(&self) -> u64 {
        self.instances_provisioned_total.get()
    }

    pub fn polling_outcomes(&self, outcome: &str) -> u64 {
        self.polling_outcomes_total
            .with_label_values(&[outcome])
            .get()
    }

    pub fn tag_failures(&self) -> u64 {
        self.tag_failures_total.get()
    }

    pub fn pool_actions(&self, action: &str) -> u64 {
        self.pool_actions_total.with_label_values(&[action]).get()
    }

    pub fn render_metrics(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render_in_text_format() {
        let repo = ObservabilityRepository::new().unwrap();
        repo.inc_instances_provisioned();
        repo.inc_polling_outcome("ready");
        repo.inc_pool_action("create");
        repo.inc_pool_action("create");

        assert_eq!(repo.instances_provisioned(), 1);
        assert_eq!(repo.pool_actions("create"), 2);
        assert_eq!(repo.pool_actions("terminate"), 0);

        let rendered = repo.render_metrics().unwrap();
        assert!(rendered.contains("smake_instances_provisioned_total 1"));
        assert!(rendered.contains("smake_polling_outcomes_total{outcome=\"ready\"} 1"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = ObservabilityRepository::new().unwrap();
        let b = ObservabilityRepository::new().unwrap();
        a.inc_tag_failures();

        assert_eq!(a.tag_failures(), 1);
        assert_eq!(b.tag_failures(), 0);
    }
}
