//! A bounded, blocking pool of pre-instantiated instances.
//!
//! An instance runs one guest call at a time, so a host serving parallel
//! callers rotates calls across several instances of the same module. The
//! pool pre-instantiates a fixed number of them and hands them out with a
//! blocking, FIFO checkout.
//!
//! At any moment the number of queued instances plus the number checked out
//! equals the pool's capacity; `close` drains the queue, unblocks waiters,
//! and closes every owned instance exactly once.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use wapc_runtime_common::WapcError;

use crate::context::CallerContext;
use crate::engine::{WapcInstance, WapcModule};

/// Callback run on each instance after instantiation, before it is first
/// offered to callers. Used to prime guest state.
pub type InstanceInitializer = dyn Fn(&dyn WapcInstance) -> Result<(), WapcError> + Send + Sync;

/// A bounded ring of reusable instances with blocking checkout.
///
/// `get` / `put_back` are safe for arbitrary concurrent callers; the queue
/// provides the synchronization. `close` is terminal.
pub struct InstancePool {
    state: Mutex<PoolState>,
    available: Condvar,
    // Owning list, kept for teardown; the queue holds shared handles.
    instances: Vec<Arc<dyn WapcInstance>>,
    capacity: usize,
}

struct PoolState {
    queue: VecDeque<Arc<dyn WapcInstance>>,
    disposed: bool,
}

impl InstancePool {
    /// Pre-instantiate `size` instances of `module` and build a pool over
    /// them.
    ///
    /// # Errors
    ///
    /// If any instantiation fails, every already-created instance is closed
    /// and the error is returned.
    pub fn new(
        module: &dyn WapcModule,
        ctx: &CallerContext,
        size: u32,
    ) -> Result<Self, WapcError> {
        Self::build(module, ctx, size, None)
    }

    /// Like [`InstancePool::new`], but runs `initializer` on each instance
    /// before it is first offered.
    pub fn new_with_initializer(
        module: &dyn WapcModule,
        ctx: &CallerContext,
        size: u32,
        initializer: impl Fn(&dyn WapcInstance) -> Result<(), WapcError> + Send + Sync + 'static,
    ) -> Result<Self, WapcError> {
        Self::build(module, ctx, size, Some(Box::new(initializer)))
    }

    fn build(
        module: &dyn WapcModule,
        ctx: &CallerContext,
        size: u32,
        initializer: Option<Box<InstanceInitializer>>,
    ) -> Result<Self, WapcError> {
        let capacity = size as usize;
        let mut instances: Vec<Arc<dyn WapcInstance>> = Vec::with_capacity(capacity);

        for _ in 0..capacity {
            let instance = match module.instantiate(ctx) {
                Ok(instance) => instance,
                Err(err) => {
                    close_all(&instances);
                    return Err(err);
                }
            };

            if let Some(init) = initializer.as_deref() {
                if let Err(err) = init(instance.as_ref()) {
                    instance.close();
                    close_all(&instances);
                    return Err(WapcError::init_failed(err.to_string()));
                }
            }

            instances.push(instance);
        }

        let queue = instances.iter().cloned().collect();

        info!(size = capacity, "instance pool ready");

        Ok(Self {
            state: Mutex::new(PoolState {
                queue,
                disposed: false,
            }),
            available: Condvar::new(),
            instances,
            capacity,
        })
    }

    /// Check out an instance, blocking up to `timeout` for one to become
    /// available. Checkout order is FIFO.
    ///
    /// # Errors
    ///
    /// [`WapcError::PoolTimeout`] if the window elapses first;
    /// [`WapcError::PoolDisposed`] once the pool is closed.
    pub fn get(&self, timeout: Duration) -> Result<Arc<dyn WapcInstance>, WapcError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();

        loop {
            if state.disposed {
                return Err(WapcError::PoolDisposed);
            }
            if let Some(instance) = state.queue.pop_front() {
                return Ok(instance);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WapcError::PoolTimeout);
            }

            let (next, _timeout_result) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;
        }
    }

    /// Return a previously checked-out instance to the pool.
    ///
    /// # Errors
    ///
    /// [`WapcError::PoolFull`] if the queue is already at capacity (the
    /// instance was not checked out of this pool);
    /// [`WapcError::PoolDisposed`] once the pool is closed.
    pub fn put_back(&self, instance: Arc<dyn WapcInstance>) -> Result<(), WapcError> {
        let mut state = self.lock_state();

        if state.disposed {
            return Err(WapcError::PoolDisposed);
        }
        if state.queue.len() >= self.capacity {
            return Err(WapcError::PoolFull);
        }

        state.queue.push_back(instance);
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Close the pool: wake all blocked `get` callers with
    /// [`WapcError::PoolDisposed`], then close every owned instance exactly
    /// once. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.lock_state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.queue.clear();
        }
        self.available.notify_all();

        close_all(&self.instances);
        debug!(size = self.capacity, "instance pool closed");
    }

    /// The fixed capacity chosen at construction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of instances currently available for checkout.
    pub fn available(&self) -> usize {
        self.lock_state().queue.len()
    }

    // A poisoned lock only means a holder panicked; the queue itself stays
    // consistent, so recover the guard rather than propagate the panic.
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for InstancePool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

fn close_all(instances: &[Arc<dyn WapcInstance>]) {
    for instance in instances {
        instance.close();
    }
}
