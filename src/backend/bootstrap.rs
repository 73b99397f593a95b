#![forbid(unsafe_code)]

//! Idempotent database and collection provisioning.
//!
//! Concurrent callers racing to create the same database or collection
//! converge on a single creation: existence is checked, then re-checked
//! under the provisioning lock before anything is created. Transient
//! failures are retried with exponential backoff.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::BootstrapConfig;
use crate::types::{CollectionRef, KgError, Result, Stage};

/// Schema management capability of a backend.
pub trait SchemaAdmin: Send + Sync {
    /// Whether database `name` exists.
    fn database_exists(&self, name: &str) -> Result<bool>;

    /// Creates database `name`.
    fn create_database(&self, name: &str) -> Result<()>;

    /// Whether `collection` exists in `database`.
    fn collection_exists(&self, database: &str, collection: &CollectionRef) -> Result<bool>;

    /// Creates `collection` in `database`.
    fn create_collection(&self, database: &str, collection: &CollectionRef) -> Result<()>;
}

/// Creates databases and collections on demand.
pub struct SchemaProvisioner {
    admin: Arc<dyn SchemaAdmin>,
    retries: u32,
    base_delay: Duration,
    lock: Mutex<()>,
    databases: RwLock<HashSet<String>>,
    collections: RwLock<HashSet<(String, CollectionRef)>>,
}

impl fmt::Debug for SchemaProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaProvisioner")
            .field("retries", &self.retries)
            .field("base_delay", &self.base_delay)
            .finish_non_exhaustive()
    }
}

impl SchemaProvisioner {
    /// Provisioner retrying `retries` times, waiting `base_delay * 2^attempt`
    /// between attempts.
    pub fn new(admin: Arc<dyn SchemaAdmin>, retries: u32, base_delay: Duration) -> Self {
        SchemaProvisioner {
            admin,
            retries,
            base_delay,
            lock: Mutex::new(()),
            databases: RwLock::new(HashSet::new()),
            collections: RwLock::new(HashSet::new()),
        }
    }

    /// Provisioner using the configured retry budget.
    pub fn from_config(admin: Arc<dyn SchemaAdmin>, config: &BootstrapConfig) -> Self {
        Self::new(admin, config.retries, Duration::from_millis(config.base_delay_ms))
    }

    /// Makes sure database `name` exists.
    pub fn ensure_database(&self, name: &str) -> Result<()> {
        if self.databases.read().contains(name) {
            return Ok(());
        }
        self.with_retry("database", name, || {
            if self.admin.database_exists(name)? {
                return Ok(());
            }
            let _guard = self.lock.lock();
            if !self.admin.database_exists(name)? {
                self.admin.create_database(name)?;
                info!(database = name, "bootstrap.database.created");
            }
            Ok(())
        })?;
        self.databases.write().insert(name.to_owned());
        Ok(())
    }

    /// Makes sure `collection` exists in `database`, creating the database
    /// first when needed.
    pub fn ensure_collection(&self, database: &str, collection: &CollectionRef) -> Result<()> {
        let key = (database.to_owned(), collection.clone());
        if self.collections.read().contains(&key) {
            return Ok(());
        }
        self.ensure_database(database)?;
        self.with_retry("collection", collection.name(), || {
            if self.admin.collection_exists(database, collection)? {
                return Ok(());
            }
            let _guard = self.lock.lock();
            if !self.admin.collection_exists(database, collection)? {
                self.admin.create_collection(database, collection)?;
                info!(
                    database,
                    collection = collection.name(),
                    edge = collection.is_edge(),
                    "bootstrap.collection.created"
                );
            }
            Ok(())
        })?;
        self.collections.write().insert(key);
        Ok(())
    }

    /// Provisions the database of `stage` with `collections`.
    pub fn ensure_stage(&self, stage: Stage, collections: &[CollectionRef]) -> Result<()> {
        let database = stage.database_name();
        self.ensure_database(database)?;
        for collection in collections {
            self.ensure_collection(database, collection)?;
        }
        Ok(())
    }

    fn with_retry(&self, kind: &'static str, name: &str, mut op: impl FnMut() -> Result<()>) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.retries => {
                    let delay = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
                    warn!(
                        kind,
                        name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "bootstrap.retry"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) if err.is_retryable() => {
                    let attempts = attempt + 1;
                    debug!(kind, name, attempts, "bootstrap.exhausted");
                    return Err(KgError::BackendUnavailable {
                        attempts,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}
