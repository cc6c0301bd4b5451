//! Integration tests for the Wasmtime waPC binding.
//!
//! These tests drive the full invocation path with inline WAT guests that
//! implement the guest side of the waPC ABI:
//! - request/response round trips through the invocation context
//! - host-call reentry into the user handler
//! - guest errors, unknown operations, traps, and ABI violations
//! - the WASI shim, init exports, and the instance pool

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use wapc_runtime_common::{EngineSettings, WapcError};
use wapc_runtime_core::{
    CallerContext, InstancePool, ModuleConfig, WapcEngine, WapcInstance, WapcModule,
};
use wapc_runtime_wasmtime::WasmtimeEngine;

/// A guest dispatching on the operation name:
/// - `echo`: one host call to (wapc, testing, echo), then echoes the request
/// - `nope`: signals the guest error "No payload"
/// - `hello`: logs "logging something", calls (myBinding, sample, hello),
///   and replies with the host's response; a failed host call is converted
///   into a guest error carrying the host's message
/// - anything else: returns 0 without an error
const DISPATCH_GUEST: &str = r#"
    (module
        (import "wapc" "__guest_request" (func $guest_request (param i32 i32)))
        (import "wapc" "__guest_response" (func $guest_response (param i32 i32)))
        (import "wapc" "__guest_error" (func $guest_error (param i32 i32)))
        (import "wapc" "__host_call"
            (func $host_call (param i32 i32 i32 i32 i32 i32 i32 i32) (result i32)))
        (import "wapc" "__host_response_len" (func $host_response_len (result i32)))
        (import "wapc" "__host_response" (func $host_response (param i32)))
        (import "wapc" "__host_error_len" (func $host_error_len (result i32)))
        (import "wapc" "__host_error" (func $host_error (param i32)))
        (import "wapc" "__console_log" (func $console_log (param i32 i32)))
        (memory (export "memory") 1)

        ;; layout: operation at 0, request at 1024, host data at 2048
        (data (i32.const 4096) "myBinding")
        (data (i32.const 4112) "sample")
        (data (i32.const 4128) "hello")
        (data (i32.const 4144) "logging something")
        (data (i32.const 4176) "No payload")
        (data (i32.const 4192) "wapc")
        (data (i32.const 4200) "testing")
        (data (i32.const 4208) "echo")

        (func $is_op (param $first i32) (param $len i32) (param $op_len i32) (result i32)
            (i32.and
                (i32.eq (i32.load8_u (i32.const 0)) (local.get $first))
                (i32.eq (local.get $op_len) (local.get $len))))

        (func (export "__guest_call") (param $op_len i32) (param $req_len i32) (result i32)
            (local $n i32)
            (call $guest_request (i32.const 0) (i32.const 1024))

            ;; "echo"
            (if (call $is_op (i32.const 101) (i32.const 4) (local.get $op_len))
                (then
                    (drop (call $host_call
                        (i32.const 4192) (i32.const 4)
                        (i32.const 4200) (i32.const 7)
                        (i32.const 4208) (i32.const 4)
                        (i32.const 1024) (local.get $req_len)))
                    (call $guest_response (i32.const 1024) (local.get $req_len))
                    (return (i32.const 1))))

            ;; "nope"
            (if (call $is_op (i32.const 110) (i32.const 4) (local.get $op_len))
                (then
                    (call $guest_error (i32.const 4176) (i32.const 10))
                    (return (i32.const 0))))

            ;; "hello"
            (if (call $is_op (i32.const 104) (i32.const 5) (local.get $op_len))
                (then
                    (call $console_log (i32.const 4144) (i32.const 17))
                    (if (i32.eqz (call $host_call
                            (i32.const 4096) (i32.const 9)
                            (i32.const 4112) (i32.const 6)
                            (i32.const 4128) (i32.const 5)
                            (i32.const 1024) (local.get $req_len)))
                        (then
                            (local.set $n (call $host_error_len))
                            (call $host_error (i32.const 2048))
                            (call $guest_error (i32.const 2048) (local.get $n))
                            (return (i32.const 0))))
                    (local.set $n (call $host_response_len))
                    (call $host_response (i32.const 2048))
                    (call $guest_response (i32.const 2048) (local.get $n))
                    (return (i32.const 1))))

            ;; unknown operation
            (i32.const 0))
    )
"#;

fn compile(wat: &str, config: ModuleConfig) -> Arc<dyn WapcModule> {
    let engine = WasmtimeEngine::new().unwrap();
    engine.new_module(wat.as_bytes(), config).unwrap()
}

fn instantiate(wat: &str, config: ModuleConfig) -> Arc<dyn WapcInstance> {
    compile(wat, config)
        .instantiate(&CallerContext::new())
        .unwrap()
}

// ============================================================================
// Test: Echo Round Trip
// ============================================================================

#[test]
fn test_echo_round_trip_invokes_handler_once() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorded = calls.clone();

    let config = ModuleConfig::new().with_host_call_handler(
        move |_ctx, binding, namespace, operation, payload| {
            recorded.lock().unwrap().push((
                binding.to_string(),
                namespace.to_string(),
                operation.to_string(),
                payload.to_vec(),
            ));
            Ok(Vec::new())
        },
    );

    let instance = instantiate(DISPATCH_GUEST, config);
    let reply = instance
        .invoke(&CallerContext::new(), "echo", b"Testing")
        .unwrap();

    assert_eq!(reply, b"Testing");

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0],
        (
            "wapc".to_string(),
            "testing".to_string(),
            "echo".to_string(),
            b"Testing".to_vec()
        )
    );
}

#[test]
fn test_echo_empty_payload() {
    let instance = instantiate(
        DISPATCH_GUEST,
        ModuleConfig::new().with_host_call_handler(|_, _, _, _, p| Ok(p.to_vec())),
    );
    let reply = instance.invoke(&CallerContext::new(), "echo", b"").unwrap();

    assert!(reply.is_empty());
}

// ============================================================================
// Test: Guest Error Surface
// ============================================================================

#[test]
fn test_guest_error_surfaces() {
    let instance = instantiate(DISPATCH_GUEST, ModuleConfig::new());

    for payload in [&b""[..], b"waPC", b"anything at all"] {
        let result = instance.invoke(&CallerContext::new(), "nope", payload);
        match result {
            Err(WapcError::GuestError { ref message }) => assert_eq!(message, "No payload"),
            other => panic!("expected GuestError, got {:?}", other.err()),
        }
    }
}

// ============================================================================
// Test: Unknown Operation
// ============================================================================

#[test]
fn test_unknown_operation_never_succeeds_silently() {
    let instance = instantiate(DISPATCH_GUEST, ModuleConfig::new());

    let result = instance.invoke(&CallerContext::new(), "404", b"Testing");
    match result {
        Err(WapcError::GuestUnsuccessful { ref operation }) => assert_eq!(operation, "404"),
        other => panic!("expected GuestUnsuccessful, got {:?}", other.err()),
    }
}

// ============================================================================
// Test: Closed Instance
// ============================================================================

#[test]
fn test_closed_instance_rejects_invoke() {
    let instance = instantiate(DISPATCH_GUEST, ModuleConfig::new());
    instance.close();

    let result = instance.invoke(&CallerContext::new(), "echo", b"late");
    assert!(matches!(result, Err(WapcError::InstanceClosed)));
}

// ============================================================================
// Test: Memory Size
// ============================================================================

#[test]
fn test_memory_size_of_fresh_instance() {
    let instance = instantiate(DISPATCH_GUEST, ModuleConfig::new());
    let size = instance.memory_size();

    assert_eq!(size % 65_536, 0);
    assert_eq!(size, 65_536);
}

// ============================================================================
// Test: Host Call Reentry
// ============================================================================

#[test]
fn test_hello_uses_host_response() {
    let handler_calls = Arc::new(AtomicUsize::new(0));
    let logged = Arc::new(Mutex::new(Vec::new()));

    let calls = handler_calls.clone();
    let log_sink = logged.clone();
    let config = ModuleConfig::new()
        .with_console_logger(move |msg| log_sink.lock().unwrap().push(msg.to_string()))
        .with_host_call_handler(move |_ctx, binding, namespace, operation, payload| {
            calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(binding, "myBinding");
            assert_eq!(namespace, "sample");
            assert_eq!(operation, "hello");
            Ok(format!("Hello, {}", String::from_utf8_lossy(payload)).into_bytes())
        });

    let instance = instantiate(DISPATCH_GUEST, config);
    let reply = instance
        .invoke(&CallerContext::new(), "hello", b"Simon")
        .unwrap();

    assert_eq!(reply, b"Hello, Simon");
    assert_eq!(handler_calls.load(Ordering::SeqCst), 1);
    assert_eq!(*logged.lock().unwrap(), vec!["logging something".to_string()]);
}

#[test]
fn test_handler_error_becomes_guest_error() {
    let config = ModuleConfig::new().with_host_call_handler(|_ctx, _bd, _ns, _op, _payload| {
        Err("error occurred: backend unavailable".into())
    });

    let instance = instantiate(DISPATCH_GUEST, config);
    let result = instance.invoke(&CallerContext::new(), "hello", b"waPC");

    match result {
        Err(WapcError::GuestError { ref message }) => {
            assert!(
                message.starts_with("error occurred"),
                "unexpected message: {message}"
            );
        }
        other => panic!("expected GuestError, got {:?}", other.err()),
    }
}

#[test]
fn test_missing_handler_reports_to_guest() {
    // No handler configured: __host_call returns 0 and the guest converts
    // the stored host error into its own.
    let instance = instantiate(DISPATCH_GUEST, ModuleConfig::new());
    let result = instance.invoke(&CallerContext::new(), "hello", b"waPC");

    match result {
        Err(WapcError::GuestError { ref message }) => {
            assert_eq!(message, "no host call handler configured");
        }
        other => panic!("expected GuestError, got {:?}", other.err()),
    }
}

#[test]
fn test_handler_sees_caller_context_values() {
    let observed = Arc::new(Mutex::new(None));

    let sink = observed.clone();
    let config = ModuleConfig::new().with_host_call_handler(move |ctx, _bd, _ns, _op, _payload| {
        *sink.lock().unwrap() = ctx.get::<String>().map(|tenant| (*tenant).clone());
        Ok(Vec::new())
    });

    let instance = instantiate(DISPATCH_GUEST, config);
    let ctx = CallerContext::new();
    ctx.insert("tenant-42".to_string());

    instance.invoke(&ctx, "echo", b"payload").unwrap();

    assert_eq!(observed.lock().unwrap().as_deref(), Some("tenant-42"));
}

// ============================================================================
// Test: Error Before Return Value
// ============================================================================

#[test]
fn test_guest_error_wins_over_success_code() {
    // A guest that writes an error and still returns 1 reports the error.
    const CONFLICTED_GUEST: &str = r#"
        (module
            (import "wapc" "__guest_error" (func $guest_error (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "boom")
            (func (export "__guest_call") (param i32 i32) (result i32)
                (call $guest_error (i32.const 0) (i32.const 4))
                (i32.const 1))
        )
    "#;

    let instance = instantiate(CONFLICTED_GUEST, ModuleConfig::new());
    let result = instance.invoke(&CallerContext::new(), "anything", b"");

    match result {
        Err(WapcError::GuestError { ref message }) => assert_eq!(message, "boom"),
        other => panic!("expected GuestError, got {:?}", other.err()),
    }
}

// ============================================================================
// Test: Traps and ABI Violations
// ============================================================================

#[test]
fn test_trap_surfaces_as_guest_trap() {
    const TRAPPING_GUEST: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "__guest_call") (param i32 i32) (result i32)
                unreachable)
        )
    "#;

    let instance = instantiate(TRAPPING_GUEST, ModuleConfig::new());
    let result = instance.invoke(&CallerContext::new(), "anything", b"");

    assert!(matches!(result, Err(WapcError::GuestTrap { .. })));
}

#[test]
fn test_out_of_bounds_write_is_abi_violation() {
    const OOB_GUEST: &str = r#"
        (module
            (import "wapc" "__guest_response" (func $guest_response (param i32 i32)))
            (memory (export "memory") 1)
            (func (export "__guest_call") (param i32 i32) (result i32)
                (call $guest_response (i32.const 2147483600) (i32.const 64))
                (i32.const 1))
        )
    "#;

    let instance = instantiate(OOB_GUEST, ModuleConfig::new());
    let result = instance.invoke(&CallerContext::new(), "anything", b"");

    match result {
        Err(WapcError::HostAbiViolation { ref reason }) => {
            assert!(reason.contains("exceeds memory"), "unexpected: {reason}");
        }
        other => panic!("expected HostAbiViolation, got {:?}", other.err()),
    }
}

#[test]
fn test_instance_recovers_after_guest_error() {
    // A failed call must not poison the next one on the same instance.
    let instance = instantiate(
        DISPATCH_GUEST,
        ModuleConfig::new().with_host_call_handler(|_, _, _, _, p| Ok(p.to_vec())),
    );
    let ctx = CallerContext::new();

    assert!(instance.invoke(&ctx, "nope", b"x").is_err());
    let reply = instance.invoke(&ctx, "echo", b"still alive").unwrap();
    assert_eq!(reply, b"still alive");
}

// ============================================================================
// Test: Fuel Metering
// ============================================================================

#[test]
fn test_fuel_exhaustion_traps() {
    const SPINNING_GUEST: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "__guest_call") (param i32 i32) (result i32)
                (loop $forever
                    (br $forever))
                (i32.const 1))
        )
    "#;

    let engine = WasmtimeEngine::with_settings(EngineSettings {
        fuel: Some(100_000),
        ..Default::default()
    })
    .unwrap();
    let module = engine
        .new_module(SPINNING_GUEST.as_bytes(), ModuleConfig::new())
        .unwrap();
    let instance = module.instantiate(&CallerContext::new()).unwrap();

    let result = instance.invoke(&CallerContext::new(), "spin", b"");
    assert!(matches!(result, Err(WapcError::GuestTrap { .. })));
}

// ============================================================================
// Test: Init Exports
// ============================================================================

#[test]
fn test_init_exports_run_once_in_order() {
    const INIT_GUEST: &str = r#"
        (module
            (import "wapc" "__console_log" (func $console_log (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "started")
            (data (i32.const 16) "initialized")
            (func (export "_start")
                (call $console_log (i32.const 0) (i32.const 7)))
            (func (export "wapc_init")
                (call $console_log (i32.const 16) (i32.const 11)))
            (func (export "__guest_call") (param i32 i32) (result i32)
                (i32.const 1))
        )
    "#;

    let logged = Arc::new(Mutex::new(Vec::new()));
    let sink = logged.clone();
    let config =
        ModuleConfig::new().with_console_logger(move |msg| sink.lock().unwrap().push(msg.to_string()));

    let instance = instantiate(INIT_GUEST, config);

    assert_eq!(
        *logged.lock().unwrap(),
        vec!["started".to_string(), "initialized".to_string()]
    );

    // Init must not run again on invoke.
    instance.invoke(&CallerContext::new(), "noop", b"").unwrap();
    assert_eq!(logged.lock().unwrap().len(), 2);
}

// ============================================================================
// Test: WASI Shim
// ============================================================================

const WASI_GUEST: &str = r#"
    (module
        (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
        (import "wasi_snapshot_preview1" "clock_time_get"
            (func $clock_time_get (param i32 i64 i32) (result i32)))
        (import "wapc" "__guest_response" (func $guest_response (param i32 i32)))
        (memory (export "memory") 1)
        (data (i32.const 0) "hello from wasi")
        ;; one iovec at 32: base = 0, len = 15
        (data (i32.const 32) "\00\00\00\00\0f\00\00\00")

        ;; dispatches on operation length: 5 = "write", 6 = "stderr", 4 = "time"
        (func (export "__guest_call") (param $op_len i32) (param $req_len i32) (result i32)
            (if (i32.eq (local.get $op_len) (i32.const 5))
                (then
                    (drop (call $fd_write
                        (i32.const 1) (i32.const 32) (i32.const 1) (i32.const 48)))
                    (call $guest_response (i32.const 48) (i32.const 4))
                    (return (i32.const 1))))
            (if (i32.eq (local.get $op_len) (i32.const 6))
                (then
                    (drop (call $fd_write
                        (i32.const 2) (i32.const 32) (i32.const 1) (i32.const 48)))
                    (call $guest_response (i32.const 48) (i32.const 4))
                    (return (i32.const 1))))
            (if (i32.eq (local.get $op_len) (i32.const 4))
                (then
                    (drop (call $clock_time_get (i32.const 0) (i64.const 0) (i32.const 64)))
                    (call $guest_response (i32.const 64) (i32.const 8))
                    (return (i32.const 1))))
            (i32.const 0))
    )
"#;

#[test]
fn test_fd_write_routes_to_stdout_sink() {
    let written = Arc::new(Mutex::new(Vec::new()));
    let sink = written.clone();
    let config =
        ModuleConfig::new().with_stdout_writer(move |msg| sink.lock().unwrap().push(msg.to_string()));

    let instance = instantiate(WASI_GUEST, config);
    let reply = instance.invoke(&CallerContext::new(), "write", b"").unwrap();

    // The guest responds with the shim's written-count out-parameter.
    assert_eq!(reply, 15_u32.to_le_bytes());
    assert_eq!(*written.lock().unwrap(), vec!["hello from wasi".to_string()]);
}

#[test]
fn test_fd_write_routes_to_stderr_sink() {
    let written = Arc::new(Mutex::new(Vec::new()));
    let sink = written.clone();
    let config =
        ModuleConfig::new().with_stderr_writer(move |msg| sink.lock().unwrap().push(msg.to_string()));

    let instance = instantiate(WASI_GUEST, config);
    let reply = instance.invoke(&CallerContext::new(), "stderr", b"").unwrap();

    assert_eq!(reply, 15_u32.to_le_bytes());
    assert_eq!(*written.lock().unwrap(), vec!["hello from wasi".to_string()]);
}

#[test]
fn test_fd_write_without_sink_is_dropped() {
    let instance = instantiate(WASI_GUEST, ModuleConfig::new());
    let reply = instance.invoke(&CallerContext::new(), "write", b"").unwrap();

    // Nothing written: the out-parameter stays zeroed.
    assert_eq!(reply, 0_u32.to_le_bytes());
}

#[test]
fn test_clock_time_get_reports_wall_clock() {
    let instance = instantiate(WASI_GUEST, ModuleConfig::new());
    let reply = instance.invoke(&CallerContext::new(), "time", b"").unwrap();

    assert_eq!(reply.len(), 8);
    let nanos = u64::from_le_bytes(reply.try_into().unwrap());
    // Sometime after 2020-01-01 in nanoseconds.
    assert!(nanos > 1_577_836_800_000_000_000);
}

// ============================================================================
// Test: Pool
// ============================================================================

#[test]
fn test_pool_rotation_hundred_cycles() {
    let config = ModuleConfig::new().with_host_call_handler(|_ctx, _bd, _ns, _op, payload| {
        Ok(format!("Hello, {}", String::from_utf8_lossy(payload)).into_bytes())
    });
    let module = compile(DISPATCH_GUEST, config);
    let pool = InstancePool::new(module.as_ref(), &CallerContext::new(), 10).unwrap();
    let ctx = CallerContext::new();

    for _ in 0..100 {
        let instance = pool.get(Duration::from_millis(10)).unwrap();
        let reply = instance.invoke(&ctx, "hello", b"waPC").unwrap();
        assert_eq!(reply, b"Hello, waPC");
        pool.put_back(instance).unwrap();
    }

    assert_eq!(pool.available(), 10);
}

#[test]
fn test_pool_blocking_get_with_single_instance() {
    let module = compile(DISPATCH_GUEST, ModuleConfig::new());
    let pool = Arc::new(InstancePool::new(module.as_ref(), &CallerContext::new(), 1).unwrap());

    let held = pool.get(Duration::from_millis(10)).unwrap();

    // Without a return, a second get times out.
    let result = pool.get(Duration::from_millis(50));
    assert!(matches!(result, Err(WapcError::PoolTimeout)));

    // With a return inside the window, the blocked get succeeds.
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.get(Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(20));
    pool.put_back(held).unwrap();

    assert!(waiter.join().unwrap().is_ok());
}

#[test]
fn test_closed_pool_rejects_get() {
    let module = compile(DISPATCH_GUEST, ModuleConfig::new());
    let pool = InstancePool::new(module.as_ref(), &CallerContext::new(), 2).unwrap();

    pool.close();

    let result = pool.get(Duration::from_millis(10));
    assert!(matches!(result, Err(WapcError::PoolDisposed)));
}

#[test]
fn test_pool_initializer_primes_each_instance() {
    let module = compile(DISPATCH_GUEST, ModuleConfig::new());
    let primed = Arc::new(AtomicUsize::new(0));

    let counter = primed.clone();
    let pool = InstancePool::new_with_initializer(
        module.as_ref(),
        &CallerContext::new(),
        3,
        move |instance| {
            // Exercise the instance before it is offered.
            let _ = instance.invoke(&CallerContext::new(), "nope", b"");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    )
    .unwrap();

    assert_eq!(primed.load(Ordering::SeqCst), 3);
    assert_eq!(pool.available(), 3);
}

#[test]
fn test_pool_parallel_invocations() {
    let config = ModuleConfig::new().with_host_call_handler(|_, _, _, _, p| Ok(p.to_vec()));
    let module = compile(DISPATCH_GUEST, config);
    let pool = Arc::new(InstancePool::new(module.as_ref(), &CallerContext::new(), 4).unwrap());

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let pool = pool.clone();
            thread::spawn(move || {
                let ctx = CallerContext::new();
                for i in 0..25 {
                    let instance = pool.get(Duration::from_secs(5)).unwrap();
                    let payload = format!("worker-{worker}-{i}");
                    let reply = instance.invoke(&ctx, "echo", payload.as_bytes()).unwrap();
                    assert_eq!(reply, payload.as_bytes());
                    pool.put_back(instance).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(pool.available(), 4);
}

// ============================================================================
// Test: Module Lifecycle
// ============================================================================

#[test]
fn test_module_close_then_instantiate_fails() {
    let module = compile(DISPATCH_GUEST, ModuleConfig::new());
    let instance = module.instantiate(&CallerContext::new()).unwrap();

    module.close();

    assert!(matches!(
        module.instantiate(&CallerContext::new()),
        Err(WapcError::ModuleClosed)
    ));

    // Instances created before the close keep working until closed.
    let reply = instance.invoke(&CallerContext::new(), "404", b"");
    assert!(matches!(reply, Err(WapcError::GuestUnsuccessful { .. })));
    instance.close();
}

#[test]
fn test_parallel_instances_of_one_module() {
    let config = ModuleConfig::new().with_host_call_handler(|_, _, _, _, p| Ok(p.to_vec()));
    let module = compile(DISPATCH_GUEST, config);

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let instance = module.instantiate(&CallerContext::new()).unwrap();
            thread::spawn(move || {
                let ctx = CallerContext::new();
                for i in 0..25 {
                    let payload = format!("{worker}:{i}");
                    let reply = instance.invoke(&ctx, "echo", payload.as_bytes()).unwrap();
                    assert_eq!(reply, payload.as_bytes());
                }
                instance.close();
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}
