//! Locally configured services and their request registries.

use crate::config::ServiceConfig;
use crate::registry::RequestRegistry;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// A client-facing service: one TCP listener relayed to whichever agent
/// announced the same uuid. Immutable apart from its request registry.
#[derive(Debug)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub inaddr_any: bool,
    pub max_connections: usize,
    pub request_buffer: usize,
    pub request_ttl: Duration,
    pub requests: RequestRegistry,
}

impl Service {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            id: config.uuid.clone(),
            name: config.name.clone(),
            port: config.port,
            inaddr_any: config.inaddr_any,
            max_connections: config.max_connections,
            request_buffer: config.request_buffer,
            request_ttl: config.request_ttl,
            requests: RequestRegistry::new(),
        }
    }

    /// Address the service's client listener binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        bind_addr(self.inaddr_any, self.port)
    }
}

/// Loopback unless `inaddr_any` asks for every interface.
pub fn bind_addr(inaddr_any: bool, port: u16) -> SocketAddr {
    let ip = if inaddr_any {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::LOCALHOST
    };
    SocketAddr::from((ip, port))
}

/// Services keyed by uuid, fixed at startup.
#[derive(Debug, Default)]
pub struct ServiceTable {
    services: HashMap<String, Arc<Service>>,
}

impl ServiceTable {
    pub fn new(configs: &[ServiceConfig]) -> Self {
        let services = configs
            .iter()
            .map(|config| (config.uuid.clone(), Arc::new(Service::new(config))))
            .collect();
        Self { services }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Service>> {
        self.services.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Service>> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(uuid: &str, port: u16, inaddr_any: bool) -> ServiceConfig {
        ServiceConfig {
            uuid: uuid.to_string(),
            name: "web".to_string(),
            port,
            inaddr_any,
            max_connections: 20,
            request_buffer: 1024,
            request_ttl: Duration::from_secs(5),
        }
    }

    #[test]
    fn table_looks_up_by_uuid() {
        let table = ServiceTable::new(&[config("a", 9000, false), config("b", 9001, true)]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("a").unwrap().port, 9000);
        assert!(table.get("c").is_none());
        assert_eq!(
            table.get("a").unwrap().bind_addr(),
            SocketAddr::from(([127, 0, 0, 1], 9000))
        );
        assert_eq!(
            table.get("b").unwrap().bind_addr(),
            SocketAddr::from(([0, 0, 0, 0], 9001))
        );
    }
}
