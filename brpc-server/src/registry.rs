//! Service registry.

use crate::error::RegistryError;
use crate::service::{MethodDescriptor, Service};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Maps service names to registered services.
#[derive(Debug, Default)]
pub struct Registry {
    services: DashMap<String, Arc<Service>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a service. Fails if the name is already taken.
    pub fn register(&self, service: Service) -> Result<(), RegistryError> {
        match self.services.entry(service.name().to_string()) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateService(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::info!(
                    "Registered service {} ({} methods)",
                    service.name(),
                    service.method_names().len()
                );
                entry.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    /// Resolves `"Service.Method"`, splitting on the last `.`.
    pub fn lookup(
        &self,
        service_method: &str,
    ) -> Result<(Arc<Service>, Arc<MethodDescriptor>), RegistryError> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| RegistryError::MalformedServiceMethod(service_method.to_string()))?;

        let service = self
            .services
            .get(service_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::UnknownService(service_name.to_string()))?;

        let method = service
            .method(method_name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownMethod(method_name.to_string()))?;

        Ok((service, method))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    /// Returns the registered service names, sorted.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
