use std::collections::HashMap;

use anyhow::{Result, bail};

use crate::{
    config::{ServiceConfig, is_service_name, normalize_base_url},
    error::{GatewayError, GatewayResult},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRoute {
    pub name: String,
    /// Absolute http(s) URL without a trailing slash.
    pub base_url: String,
}

/// Immutable service-name → backend table, built once at startup.
#[derive(Debug)]
pub struct ServiceResolver {
    routes: HashMap<String, ServiceRoute>,
}

impl ServiceResolver {
    pub fn new(services: Vec<ServiceConfig>) -> Result<Self> {
        if services.is_empty() {
            bail!("route table is empty");
        }

        let mut routes = HashMap::with_capacity(services.len());
        for service in services {
            if !is_service_name(&service.name) {
                bail!("invalid service name {:?}", service.name);
            }
            let base_url = normalize_base_url(&service.base_url)?;
            let route = ServiceRoute {
                name: service.name.clone(),
                base_url,
            };
            if routes.insert(service.name, route).is_some() {
                bail!("duplicate service name in route table");
            }
        }

        Ok(Self { routes })
    }

    pub fn resolve(&self, service_name: &str) -> GatewayResult<&ServiceRoute> {
        self.routes
            .get(service_name)
            .ok_or(GatewayError::ServiceNotFound)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceRoute> {
        self.routes.values()
    }
}
