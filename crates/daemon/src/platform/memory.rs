use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{
    AuthSecret, DedicatedService, IngressRule, Platform, PlatformError, ServicePort, Versioned,
};

#[derive(Default)]
struct State {
    service_version: u64,
    service_ports: Vec<ServicePort>,
    ingress_version: u64,
    ingress_rules: Vec<IngressRule>,
    secrets: BTreeMap<String, AuthSecret>,
    services: BTreeMap<String, DedicatedService>,
}

/// In-process platform with versioned objects and failure injection, used
/// for offline runs and tests.
#[derive(Default)]
pub struct MemoryPlatform {
    state: Mutex<State>,
    fail_ingress_reads: AtomicBool,
    fail_ingress_writes: AtomicBool,
    fail_service_writes: AtomicBool,
    pending_conflicts: AtomicUsize,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_ingress_reads(&self, fail: bool) {
        self.fail_ingress_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_ingress_writes(&self, fail: bool) {
        self.fail_ingress_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_service_writes(&self, fail: bool) {
        self.fail_service_writes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` conditional writes lose a race against a phantom writer.
    pub fn inject_conflicts(&self, n: usize) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn current_service_ports(&self) -> Vec<ServicePort> {
        self.state().service_ports.clone()
    }

    pub fn current_ingress_rules(&self) -> Vec<IngressRule> {
        self.state().ingress_rules.clone()
    }

    /// Number of ingress rules forwarding traffic for `port`.
    pub fn rules_for_port(&self, port: u16) -> usize {
        self.state()
            .ingress_rules
            .iter()
            .filter(|r| r.references_port(port))
            .count()
    }

    pub fn has_service_port(&self, port: u16) -> bool {
        self.state().service_ports.iter().any(|p| p.port == port)
    }

    pub fn secret(&self, name: &str) -> Option<AuthSecret> {
        self.state().secrets.get(name).cloned()
    }

    pub fn dedicated_service(&self, name: &str) -> Option<DedicatedService> {
        self.state().services.get(name).cloned()
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn service_ports(&self) -> Result<Versioned<Vec<ServicePort>>, PlatformError> {
        let state = self.state();
        Ok(Versioned {
            version: state.service_version.to_string(),
            value: state.service_ports.clone(),
        })
    }

    async fn replace_service_ports(
        &self,
        version: &str,
        ports: Vec<ServicePort>,
    ) -> Result<(), PlatformError> {
        if self.fail_service_writes.load(Ordering::SeqCst) {
            return Err(PlatformError::Api("service update rejected".to_string()));
        }
        let mut state = self.state();
        if self.take_conflict() {
            state.service_version += 1;
        }
        if state.service_version.to_string() != version {
            return Err(PlatformError::Conflict("service".to_string()));
        }
        state.service_ports = ports;
        state.service_version += 1;
        Ok(())
    }

    async fn ingress_rules(&self) -> Result<Versioned<Vec<IngressRule>>, PlatformError> {
        if self.fail_ingress_reads.load(Ordering::SeqCst) {
            return Err(PlatformError::Api("ingress read failed".to_string()));
        }
        let state = self.state();
        Ok(Versioned {
            version: state.ingress_version.to_string(),
            value: state.ingress_rules.clone(),
        })
    }

    async fn replace_ingress_rules(
        &self,
        version: &str,
        rules: Vec<IngressRule>,
    ) -> Result<(), PlatformError> {
        if self.fail_ingress_writes.load(Ordering::SeqCst) {
            return Err(PlatformError::Api("ingress update rejected".to_string()));
        }
        let mut state = self.state();
        if self.take_conflict() {
            state.ingress_version += 1;
        }
        if state.ingress_version.to_string() != version {
            return Err(PlatformError::Conflict("ingress".to_string()));
        }
        state.ingress_rules = rules;
        state.ingress_version += 1;
        Ok(())
    }

    async fn create_secret(&self, secret: &AuthSecret) -> Result<(), PlatformError> {
        let mut state = self.state();
        if state.secrets.contains_key(&secret.name) {
            return Err(PlatformError::AlreadyExists(secret.name.clone()));
        }
        state.secrets.insert(secret.name.clone(), secret.clone());
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), PlatformError> {
        match self.state().secrets.remove(name) {
            Some(_) => Ok(()),
            None => Err(PlatformError::NotFound(name.to_string())),
        }
    }

    async fn create_service(&self, service: &DedicatedService) -> Result<(), PlatformError> {
        let mut state = self.state();
        if state.services.contains_key(&service.name) {
            return Err(PlatformError::AlreadyExists(service.name.clone()));
        }
        state.services.insert(service.name.clone(), service.clone());
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), PlatformError> {
        match self.state().services.remove(name) {
            Some(_) => Ok(()),
            None => Err(PlatformError::NotFound(name.to_string())),
        }
    }
}
