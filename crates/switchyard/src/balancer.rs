//! Backend selection
//!
//! Round-robin among the live instances of a service, one counter per service.
//! Instances are ordered by address before indexing so rotation is stable
//! regardless of the order discovery reports them in.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::discovery::{Discovery, Instance};
use crate::error::ProxyError;

pub struct Balancer {
    discovery: Arc<dyn Discovery>,
    counters: DashMap<String, AtomicUsize>,
}

impl Balancer {
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self {
            discovery,
            counters: DashMap::new(),
        }
    }

    /// Live candidate set for a route, sorted by address.
    ///
    /// With `leader_only` the set is reduced to the leader. If discovery reports
    /// several leaders the lowest address wins; none is `BackendUnavailable`.
    pub async fn candidates(
        &self,
        service: &str,
        leader_only: bool,
    ) -> Result<Vec<Instance>, ProxyError> {
        let mut instances = self.discovery.instances(service).await?;
        instances.sort_by(|a, b| a.addr.cmp(&b.addr));
        instances.dedup_by(|a, b| a.addr == b.addr);

        if leader_only {
            let leader = instances.into_iter().find(|i| i.leader);
            return match leader {
                Some(leader) => Ok(vec![leader]),
                None => Err(ProxyError::BackendUnavailable(service.to_string())),
            };
        }
        if instances.is_empty() {
            return Err(ProxyError::BackendUnavailable(service.to_string()));
        }
        Ok(instances)
    }

    /// Next instance in rotation from an already resolved candidate set
    pub fn rotate<'a>(&self, service: &str, candidates: &'a [Instance]) -> Option<&'a Instance> {
        if candidates.is_empty() {
            return None;
        }
        let index = match self.counters.get(service) {
            Some(counter) => counter.fetch_add(1, Ordering::Relaxed),
            None => self
                .counters
                .entry(service.to_string())
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed),
        };
        candidates.get(index % candidates.len())
    }

    /// Resolve and pick one instance
    pub async fn pick(&self, service: &str, leader_only: bool) -> Result<Instance, ProxyError> {
        let candidates = self.candidates(service, leader_only).await?;
        self.rotate(service, &candidates)
            .cloned()
            .ok_or_else(|| ProxyError::BackendUnavailable(service.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;

    fn balancer(instances: Vec<Instance>) -> Balancer {
        let discovery = StaticDiscovery::new();
        discovery.set("web", instances);
        Balancer::new(Arc::new(discovery))
    }

    #[tokio::test]
    async fn test_round_robin_is_address_ordered() {
        let balancer = balancer(vec![
            Instance::new("10.0.0.3:80"),
            Instance::new("10.0.0.1:80"),
            Instance::new("10.0.0.2:80"),
        ]);

        let mut picked = vec![];
        for _ in 0..4 {
            picked.push(balancer.pick("web", false).await.unwrap().addr);
        }
        assert_eq!(
            picked,
            vec!["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80", "10.0.0.1:80"]
        );
    }

    #[tokio::test]
    async fn test_no_instances() {
        let balancer = balancer(vec![]);
        assert!(matches!(
            balancer.pick("web", false).await,
            Err(ProxyError::BackendUnavailable(_))
        ));
        assert!(matches!(
            balancer.pick("unknown", false).await,
            Err(ProxyError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_leader_only() {
        let balancer = balancer(vec![Instance::new("10.0.0.1:80"), Instance::new("10.0.0.2:80")]);
        assert!(matches!(
            balancer.pick("web", true).await,
            Err(ProxyError::BackendUnavailable(_))
        ));

        let balancer = self::balancer(vec![
            Instance::leader("10.0.0.9:80"),
            Instance::new("10.0.0.1:80"),
            Instance::leader("10.0.0.5:80"),
        ]);
        for _ in 0..3 {
            assert_eq!(balancer.pick("web", true).await.unwrap().addr, "10.0.0.5:80");
        }
    }
}
