use parking_lot::RwLock;
use std::sync::Arc;

use super::Strategy;

/// Single slot holding the last loaded strategy, keyed by `<deploymentID>-<generation>`
#[derive(Debug, Default)]
pub struct StrategyCache {
    slot: RwLock<Option<(String, Arc<Strategy>)>>,
}

pub fn cache_key(deployment_id: &str, generation: i64) -> String {
    format!("{deployment_id}-{generation}")
}

impl StrategyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Strategy>> {
        match self.slot.read().as_ref() {
            Some((k, strategy)) if k == key => Some(strategy.clone()),
            _ => None,
        }
    }

    /// Replaces whatever was cached before
    pub fn put(&self, key: String, strategy: Arc<Strategy>) {
        *self.slot.write() = Some((key, strategy));
    }

    pub fn reset(&self) {
        *self.slot.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_requires_exact_key() {
        let cache = StrategyCache::new();
        let strategy = Arc::new(Strategy::default());
        cache.put(cache_key("abc", 1), strategy.clone());
        assert!(cache.get("abc-1").is_some());
        assert!(cache.get("abc-2").is_none());

        cache.put(cache_key("def", 1), strategy);
        assert!(cache.get("abc-1").is_none(), "slot is replaced wholesale");

        cache.reset();
        assert!(cache.get("def-1").is_none());
    }
}
