//! Bounded pool of reusable backend resources.
//!
//! Remote backends hold network connections that are expensive to open per
//! tile. The pool caps how many exist at once, parks idle ones for reuse,
//! and lets a holder discard a resource it found broken so the slot frees
//! up for a fresh one.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use super::{BoxFuture, CacheError};

/// Creates pool resources on demand.
pub trait ResourceFactory: Send + Sync {
    type Resource: Send;

    fn create(&self) -> BoxFuture<'_, Result<Self::Resource, CacheError>>;

    /// Whether an idle resource is still usable.
    ///
    /// Checked on every checkout of a parked resource; returning `false`
    /// discards it and a replacement is created in its slot.
    fn validate<'a>(&'a self, _resource: &'a mut Self::Resource) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }
}

/// A bounded pool handing out resources behind RAII guards.
pub struct Pool<F: ResourceFactory> {
    factory: F,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<F::Resource>>,
}

impl<F: ResourceFactory> Pool<F> {
    pub fn new(factory: F, max_resources: usize) -> Self {
        Self {
            factory,
            semaphore: Arc::new(Semaphore::new(max_resources)),
            idle: Mutex::new(Vec::with_capacity(max_resources)),
        }
    }

    /// Take a resource, waiting for a slot when the pool is exhausted.
    ///
    /// Idle resources are reused most-recently-parked first so cold ones
    /// age out at the bottom of the stack. Each parked resource is
    /// validated before being handed out; dead ones are dropped and a
    /// fresh resource is created in their place.
    pub async fn acquire(&self) -> Result<PoolGuard<'_, F>, CacheError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| CacheError::Backend("resource pool closed".to_string()))?;
        let resource = loop {
            // the lock is never held across an await
            let reused = self.idle_list().pop();
            match reused {
                Some(mut resource) => {
                    if self.factory.validate(&mut resource).await {
                        trace!("reusing pooled resource");
                        break resource;
                    }
                    trace!("discarding dead pooled resource");
                }
                None => break self.factory.create().await?,
            }
        };
        Ok(PoolGuard {
            pool: self,
            resource: Some(resource),
            invalidated: false,
            _permit: permit,
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle_list().len()
    }

    fn idle_list(&self) -> MutexGuard<'_, Vec<F::Resource>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive access to one pooled resource; parks it back on drop.
pub struct PoolGuard<'a, F: ResourceFactory> {
    pool: &'a Pool<F>,
    resource: Option<F::Resource>,
    invalidated: bool,
    _permit: OwnedSemaphorePermit,
}

impl<F: ResourceFactory> PoolGuard<'_, F> {
    /// Discard this resource instead of returning it to the pool.
    ///
    /// Call after any protocol or I/O error; a half-consumed connection
    /// must never be handed to the next user.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }
}

impl<F: ResourceFactory> std::ops::Deref for PoolGuard<'_, F> {
    type Target = F::Resource;

    fn deref(&self) -> &F::Resource {
        self.resource.as_ref().unwrap()
    }
}

impl<F: ResourceFactory> std::ops::DerefMut for PoolGuard<'_, F> {
    fn deref_mut(&mut self) -> &mut F::Resource {
        self.resource.as_mut().unwrap()
    }
}

impl<F: ResourceFactory> Drop for PoolGuard<'_, F> {
    fn drop(&mut self) {
        if self.invalidated {
            return;
        }
        if let Some(resource) = self.resource.take() {
            self.pool.idle_list().push(resource);
        }
    }
}
