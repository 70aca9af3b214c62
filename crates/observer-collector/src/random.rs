use crate::Collector;
use anyhow::Result;
use observer_common::types::Metric;
use rand::Rng;

/// Emits `RandomValue`, a uniform sample in `[0, 1)`.
pub struct RandomCollector;

impl Collector for RandomCollector {
    fn name(&self) -> &str {
        "random"
    }

    fn collect(&mut self) -> Result<Vec<Metric>> {
        let value: f64 = rand::thread_rng().gen();
        Ok(vec![Metric::gauge("RandomValue", value)])
    }
}
