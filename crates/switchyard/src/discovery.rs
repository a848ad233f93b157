//! Service discovery abstraction
//!
//! The router never caches discovery results: every new connection asks for
//! the live instance set of the route's service.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;

/// One live backend instance of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// `host:port` to connect to
    pub addr: String,
    /// Set on the instance elected leader of its service
    #[serde(default)]
    pub leader: bool,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl Instance {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            leader: false,
            meta: BTreeMap::new(),
        }
    }

    pub fn leader(addr: impl Into<String>) -> Self {
        Self {
            leader: true,
            ..Self::new(addr)
        }
    }
}

/// Resolves a logical service name to its live instances
///
/// This abstraction allows the router to work against a real discovery
/// service in production or a fixed table in tests.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Current live instances; an unknown service has no instances
    async fn instances(&self, service: &str) -> Result<Vec<Instance>, DiscoveryError>;
}

/// Fixed, mutable instance table
#[derive(Default)]
pub struct StaticDiscovery {
    services: RwLock<HashMap<String, Vec<Instance>>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_services(services: HashMap<String, Vec<Instance>>) -> Self {
        Self {
            services: RwLock::new(services),
        }
    }

    /// Replace the instance set of a service
    pub fn set(&self, service: &str, instances: Vec<Instance>) {
        self.services.write().insert(service.to_string(), instances);
    }

    pub fn add(&self, service: &str, instance: Instance) {
        self.services
            .write()
            .entry(service.to_string())
            .or_default()
            .push(instance);
    }

    pub fn remove(&self, service: &str, addr: &str) {
        if let Some(instances) = self.services.write().get_mut(service) {
            instances.retain(|i| i.addr != addr);
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn instances(&self, service: &str) -> Result<Vec<Instance>, DiscoveryError> {
        Ok(self.services.read().get(service).cloned().unwrap_or_default())
    }
}

/// Discovery over HTTP: `GET {base}/services/{name}/instances` returning a
/// JSON array of instances
pub struct HttpDiscovery {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpDiscovery {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DiscoveryError> {
        let base_url =
            Url::parse(base_url).map_err(|e| DiscoveryError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(DiscoveryError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            timeout,
        })
    }

    /// `{base}/services/{service}/instances` with the name as one encoded segment
    fn instances_url(&self, service: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["services", service, "instances"]);
        }
        url
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn instances(&self, service: &str) -> Result<Vec<Instance>, DiscoveryError> {
        let response = self
            .client
            .get(self.instances_url(service))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DiscoveryError::Timeout
                } else {
                    DiscoveryError::Request(e)
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(DiscoveryError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}
