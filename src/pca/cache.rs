//! Per-issuer provisioner cache
//!
//! Written by the issuer controllers, read by the CertificateRequest
//! controller. Entries are replaced on successful issuer reconciles and
//! removed when the issuer is deleted; there is no expiry.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::Provisioner;
use crate::crd::IssuerKey;

/// Concurrent map from issuer identity to its provisioner
#[derive(Debug, Default)]
pub struct ProvisionerCache {
    entries: DashMap<IssuerKey, Arc<Provisioner>>,
}

impl ProvisionerCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisioner for `key`, if one was stored
    pub fn get(&self, key: &IssuerKey) -> Option<Arc<Provisioner>> {
        self.entries.get(key).map(|p| Arc::clone(p.value()))
    }

    /// Store a provisioner, replacing any previous one for `key`
    pub fn store(&self, key: IssuerKey, provisioner: Arc<Provisioner>) {
        debug!(issuer = %key, ca = %provisioner.ca_arn(), "storing provisioner");
        self.entries.insert(key, provisioner);
    }

    /// Remove the provisioner for `key`, returning it if present
    pub fn delete(&self, key: &IssuerKey) -> Option<Arc<Provisioner>> {
        self.entries.remove(key).map(|(_, p)| p)
    }

    /// Remove every provisioner
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached provisioners
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached provisioner for `key`, building one with `create` when missing
    ///
    /// `create` runs without holding any lock. If another caller stored a
    /// provisioner for the same key in the meantime, that one is kept and
    /// returned.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        key: &IssuerKey,
        create: F,
    ) -> Result<Arc<Provisioner>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Provisioner, E>>,
    {
        if let Some(provisioner) = self.get(key) {
            return Ok(provisioner);
        }

        let created = Arc::new(create().await?);
        let entry = self.entries.entry(key.clone()).or_insert(created);
        debug!(issuer = %key, "provisioner created on demand");
        Ok(Arc::clone(entry.value()))
    }
}
