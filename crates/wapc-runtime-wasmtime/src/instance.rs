//! A single execution context of a compiled module.
//!
//! Each [`WasmtimeInstance`] owns its store (and therefore its linear memory
//! and invocation-context slot). The inner mutex is the concrete form of the
//! "one in-flight call per instance" rule: a second `invoke` waits for the
//! first to return rather than interleaving.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, instrument};
use wasmtime::{Memory, Store, Trap, TypedFunc};

use wapc_runtime_common::WapcError;
use wapc_runtime_core::{CallerContext, InvocationContext, WapcInstance};

use crate::linker::GuestState;

const PAGE_SIZE: u32 = 65_536;

/// One instantiation of a module, with its own linear memory.
pub struct WasmtimeInstance {
    // `None` once closed; the store drop releases the engine-level instance.
    inner: Mutex<Option<InstanceInner>>,
    closed: AtomicBool,
}

struct InstanceInner {
    store: Store<GuestState>,
    #[allow(dead_code)] // retained so engine resources live as long as the wrapper
    instance: wasmtime::Instance,
    memory: Memory,
    guest_call: TypedFunc<(i32, i32), i32>,
}

impl WasmtimeInstance {
    pub(crate) fn new(
        store: Store<GuestState>,
        instance: wasmtime::Instance,
        memory: Memory,
        guest_call: TypedFunc<(i32, i32), i32>,
    ) -> Self {
        Self {
            inner: Mutex::new(Some(InstanceInner {
                store,
                instance,
                memory,
                guest_call,
            })),
            closed: AtomicBool::new(false),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Option<InstanceInner>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WapcInstance for WasmtimeInstance {
    #[instrument(skip(self, ctx, payload), fields(payload_len = payload.len()))]
    fn invoke(
        &self,
        ctx: &CallerContext,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, WapcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WapcError::InstanceClosed);
        }

        let mut guard = self.lock_inner();
        let Some(inner) = guard.as_mut() else {
            // Lost the race with close.
            return Err(WapcError::InstanceClosed);
        };

        inner
            .store
            .data_mut()
            .begin_invocation(InvocationContext::new(
                ctx.clone(),
                operation,
                payload.to_vec(),
            ));

        let outcome = inner.guest_call.call(
            &mut inner.store,
            (operation.len() as i32, payload.len() as i32),
        );

        let state = inner.store.data_mut();
        match outcome {
            Err(trap) => {
                if let Some(reason) = state.take_violation() {
                    Err(WapcError::abi_violation(reason))
                } else {
                    Err(WapcError::guest_trap(trap_reason(&trap)))
                }
            }
            Ok(code) => {
                // Error takes precedence: a guest that writes an error and
                // still returns 1 reports the error.
                if let Some(message) = state.context().guest_error() {
                    Err(WapcError::guest_error(message))
                } else if code == 1 {
                    Ok(state.context_mut().take_guest_response().unwrap_or_default())
                } else {
                    Err(WapcError::guest_unsuccessful(operation))
                }
            }
        }
    }

    fn memory_size(&self) -> u32 {
        let inner = self.lock_inner();
        match inner.as_ref() {
            Some(inner) => {
                let bytes = inner.memory.size(&inner.store) * u64::from(PAGE_SIZE);
                u32::try_from(bytes).unwrap_or(u32::MAX)
            }
            None => 0,
        }
    }

    fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        // Release the engine-level instance and linear memory now; the pool
        // may keep the wrapper alive long after close.
        let mut guard = self.lock_inner();
        *guard = None;
        debug!("instance closed");
    }
}

impl std::fmt::Debug for WasmtimeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeInstance")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Human-readable reason for a failed guest call.
pub(crate) fn trap_reason(err: &wasmtime::Error) -> String {
    match err.downcast_ref::<Trap>() {
        Some(trap) => trap.to_string(),
        None => err.root_cause().to_string(),
    }
}
