//! Storage orchestrator
//!
//! Drives startup for a set of database services:
//!
//! 1. `prepare` the backend with every declared table
//! 2. per service, in parallel: `initialize_database` then `initialize_state`
//! 3. once all have loaded, `sync` each and collect the handles
//!
//! Any failure in step 2 fails startup once the remaining loads settle. A
//! failed startup releases every table it opened, so a retry with fresh
//! services sees the underlying error again rather than a double open.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use roost_storage::{Backend, TableSpec};

use crate::error::{SyncError, SyncResult};
use crate::services::{DatabaseService, SyncHandle};

/// Aggregate of every running sync loop
#[derive(Default)]
pub struct Teardown {
    handles: Vec<SyncHandle>,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: SyncHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every loop, then wait for each independently.
    ///
    /// A loop that fails to shut down cleanly is logged and does not keep
    /// the others from being torn down.
    pub async fn unsubscribe(self) {
        for handle in &self.handles {
            handle.stop();
        }
        for handle in self.handles {
            let name = handle.name().to_string();
            if let Err(e) = handle.join().await {
                warn!(service = %name, error = %e, "Sync loop failed during teardown");
            }
        }
    }
}

/// Startup driver for a set of services on one backend
pub struct StorageOrchestrator {
    backend: Arc<dyn Backend>,
    services: Vec<Arc<dyn DatabaseService>>,
}

impl StorageOrchestrator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            services: Vec::new(),
        }
    }

    pub fn with_service(mut self, service: Arc<dyn DatabaseService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_services(mut self, services: impl IntoIterator<Item = Arc<dyn DatabaseService>>) -> Self {
        self.services.extend(services);
        self
    }

    /// Unbind tables opened by a startup that failed
    fn release(&self, names: &[String]) {
        for name in names {
            self.backend.release(name);
        }
        warn!(released = names.len(), "Startup failed, released opened tables");
    }

    /// Open, load and attach every service
    #[instrument(skip(self), fields(backend = %self.backend.kind(), services = self.services.len()))]
    pub async fn start(self) -> SyncResult<RunningStorage> {
        let specs: Vec<TableSpec> = self.services.iter().map(|s| s.table_spec()).collect();
        self.backend.prepare(&specs).await?;

        let opened = Arc::new(Mutex::new(Vec::new()));
        let mut loads = JoinSet::new();
        for service in &self.services {
            let service = Arc::clone(service);
            let backend = Arc::clone(&self.backend);
            let opened = Arc::clone(&opened);
            loads.spawn(async move {
                let name = service.name().to_string();
                let result: SyncResult<usize> = async {
                    service.initialize_database(backend.as_ref()).await?;
                    opened.lock().push(name.clone());
                    service.initialize_state().await
                }
                .await;
                (name, result)
            });
        }

        while let Some(joined) = loads.join_next().await {
            let failure: SyncError = match joined {
                Ok((name, Ok(rows))) => {
                    info!(service = %name, rows, "Service loaded");
                    continue;
                }
                Ok((name, Err(e))) => {
                    error!(service = %name, error = %e, "Service failed to load");
                    SyncError::startup(name, e)
                }
                Err(e) => {
                    error!(error = %e, "Load task failed");
                    e.into()
                }
            };
            // Let the other loads settle so every table they bound is recorded
            while loads.join_next().await.is_some() {}
            self.release(&opened.lock());
            return Err(failure);
        }

        let mut teardown = Teardown::new();
        for service in &self.services {
            match Arc::clone(service).sync() {
                Ok(handle) => teardown.push(handle),
                Err(e) => {
                    let name = service.name().to_string();
                    teardown.unsubscribe().await;
                    self.release(&opened.lock());
                    return Err(SyncError::startup(name, e));
                }
            }
        }

        info!("Storage started");
        Ok(RunningStorage {
            backend: self.backend,
            services: self.services,
            teardown,
        })
    }
}

/// Services with live sync loops
pub struct RunningStorage {
    backend: Arc<dyn Backend>,
    services: Vec<Arc<dyn DatabaseService>>,
    teardown: Teardown,
}

impl RunningStorage {
    pub fn services(&self) -> &[Arc<dyn DatabaseService>] {
        &self.services
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Stop all future flushes and release every table
    pub async fn unsubscribe(self) {
        let RunningStorage {
            backend,
            services,
            teardown,
        } = self;
        teardown.unsubscribe().await;

        for service in &services {
            backend.release(service.name());
        }
        info!("Storage stopped");
    }

    /// Stop syncing, then clear every in-memory structure and its table.
    ///
    /// Each service is cleared independently; the names of those that
    /// failed are returned in [`SyncError::Reset`].
    pub async fn reset(self) -> SyncResult<()> {
        let RunningStorage {
            backend,
            services,
            teardown,
        } = self;
        teardown.unsubscribe().await;

        let mut failed = Vec::new();
        for service in &services {
            if let Err(e) = service.clear().await {
                error!(service = service.name(), error = %e, "Reset failed");
                failed.push(service.name().to_string());
            }
            backend.release(service.name());
        }

        if failed.is_empty() {
            info!("Storage reset");
            Ok(())
        } else {
            Err(SyncError::Reset(failed))
        }
    }
}
