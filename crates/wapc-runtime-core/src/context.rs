//! Per-caller and per-invocation state.
//!
//! This module provides:
//! - [`CallerContext`]: an opaque token the outer caller threads through every
//!   invocation; handed verbatim to the host-call handler on `__host_call`
//! - [`InvocationContext`]: the per-call scratchpad the waPC ABI reads from
//!   and writes into while a guest call is in flight

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// An opaque cancellation/deadline/value-carrying token.
///
/// The runtime never inspects this token; it exists so that host-call
/// handlers can observe caller intent (cancellation, deadlines, request-scoped
/// values) without the core taking a position on what any of it means.
/// Cloning is cheap and all clones share state.
///
/// # Example
///
/// ```
/// use wapc_runtime_core::CallerContext;
///
/// let ctx = CallerContext::new();
/// ctx.insert("tenant-42".to_string());
///
/// assert!(!ctx.is_cancelled());
/// assert_eq!(*ctx.get::<String>().unwrap(), "tenant-42");
/// ```
#[derive(Clone, Default)]
pub struct CallerContext {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    values: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl CallerContext {
    /// Create an empty, never-expiring context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context that reports cancellation once `timeout` has elapsed.
    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
                values: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Mark this context (and all its clones) as cancelled.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` if the context was cancelled or its deadline passed.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match self.inner.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// The deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Attach a value keyed by its type, replacing any previous value of the
    /// same type.
    pub fn insert<T: Any + Send + Sync>(&self, value: T) {
        let mut values = self
            .inner
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        values.insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Retrieve a value previously attached with [`CallerContext::insert`].
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let values = self
            .inner
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        values
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }
}

impl std::fmt::Debug for CallerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerContext")
            .field("cancelled", &self.inner.cancelled.load(Ordering::SeqCst))
            .field("deadline", &self.inner.deadline)
            .finish_non_exhaustive()
    }
}

/// Per-call scratchpad for one guest call chain.
///
/// The waPC ABI cannot pass payloads by value through `__guest_call`: the
/// guest pulls the request back out of the host and pushes its result back in
/// through dedicated imports. This struct is where those bytes live for the
/// duration of exactly one call. It is owned by the instance (one slot,
/// overwritten per call) and never shared between concurrent calls.
#[derive(Default)]
pub struct InvocationContext {
    caller: CallerContext,
    operation: String,
    guest_request: Vec<u8>,
    guest_response: Option<Vec<u8>>,
    guest_error: Option<String>,
    host_response: Option<Vec<u8>>,
    host_error: Option<String>,
}

impl InvocationContext {
    /// Create the context for a top-level invocation.
    pub fn new(caller: CallerContext, operation: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            caller,
            operation: operation.into(),
            guest_request: payload,
            ..Self::default()
        }
    }

    /// Create the empty shell used while running `_start` / `wapc_init`.
    ///
    /// No operation or payload exists yet; the guest may still reach the host
    /// through `__host_call` or `__console_log` during initialization.
    pub fn empty_shell(caller: CallerContext) -> Self {
        Self {
            caller,
            ..Self::default()
        }
    }

    /// The caller's token, handed to the host-call handler on reentry.
    pub fn caller(&self) -> &CallerContext {
        &self.caller
    }

    /// The operation name the guest dispatches on.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The request bytes the guest will read via `__guest_request`.
    pub fn guest_request(&self) -> &[u8] {
        &self.guest_request
    }

    /// Record the guest's response bytes (`__guest_response`).
    pub fn set_guest_response(&mut self, bytes: Vec<u8>) {
        self.guest_response = Some(bytes);
    }

    /// Take the guest's response, leaving the slot empty.
    pub fn take_guest_response(&mut self) -> Option<Vec<u8>> {
        self.guest_response.take()
    }

    /// Record the guest's error message (`__guest_error`).
    pub fn set_guest_error(&mut self, message: String) {
        self.guest_error = Some(message);
    }

    /// The guest's error message, if one was signalled.
    pub fn guest_error(&self) -> Option<&str> {
        self.guest_error.as_deref()
    }

    /// Record the result of the most recent host-call handler run.
    ///
    /// Success clears any previous host error; failure clears any previous
    /// host response. The guest observes whichever side is set through
    /// `__host_response*` / `__host_error*`.
    pub fn set_host_result(&mut self, result: Result<Vec<u8>, String>) {
        match result {
            Ok(bytes) => {
                self.host_response = Some(bytes);
                self.host_error = None;
            }
            Err(message) => {
                self.host_response = None;
                self.host_error = Some(message);
            }
        }
    }

    /// Bytes from the most recent successful host call.
    pub fn host_response(&self) -> Option<&[u8]> {
        self.host_response.as_deref()
    }

    /// Error message from the most recent failed host call.
    pub fn host_error(&self) -> Option<&str> {
        self.host_error.as_deref()
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("operation", &self.operation)
            .field("request_len", &self.guest_request.len())
            .field("has_response", &self.guest_response.is_some())
            .field("guest_error", &self.guest_error)
            .finish_non_exhaustive()
    }
}
