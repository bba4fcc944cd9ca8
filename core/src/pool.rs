//! Bounded execution of queries on tokio's blocking pool.
//!
//! At most `workers` queries run at once and at most `queue_capacity` more
//! wait for a slot. Anything beyond that is turned away immediately with
//! `ServiceBusy`. Dropping the caller's future cancels the query's token so a
//! running regex scan stops at its next check.

use crate::error::{EngineError, Result};
use crate::pattern::CancelToken;
use crate::service::{QueryService, SearchRequest, SearchResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self { workers, queue_capacity: 64 }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(EngineError::Config("pool.workers must be at least 1".into()));
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize { self.workers + self.queue_capacity }
}

struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) { self.0.cancel() }
}

#[derive(Clone)]
pub struct QueryPool {
    service: Arc<QueryService>,
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    capacity: usize,
}

impl QueryPool {
    pub fn new(service: Arc<QueryService>, config: &PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            service,
            admission: Arc::new(Semaphore::new(config.capacity())),
            workers: Arc::new(Semaphore::new(config.workers)),
            capacity: config.capacity(),
        })
    }

    pub fn service(&self) -> &QueryService { &self.service }

    pub fn capacity(&self) -> usize { self.capacity }

    /// Admitted requests, running or queued.
    pub fn in_flight(&self) -> usize { self.capacity - self.admission.available_permits() }

    /// Runs `job` on a blocking worker once a slot frees up.
    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&QueryService, &CancelToken) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let admitted = match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(capacity = self.capacity, "query rejected, pool saturated");
                return Err(EngineError::ServiceBusy { capacity: self.capacity });
            }
        };
        let token = CancelToken::new();
        let _guard = CancelOnDrop(token.clone());
        let slot = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::ServiceBusy { capacity: self.capacity })?;

        let service = Arc::clone(&self.service);
        let handle = tokio::task::spawn_blocking(move || {
            let _permits = (admitted, slot);
            job(&*service, &token)
        });
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(EngineError::ServiceBusy { capacity: self.capacity }),
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        self.run(move |svc, cancel| svc.search_with_cancel(&request, cancel)).await
    }
}
