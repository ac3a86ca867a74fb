//! End-to-end dispatch behavior against the scripted mock driver.

mod common;

use common::{MockDriver, config, eventually, next, registry, request};
use db_dispatch::dispatch::{Dispatcher, EndpointSettings, StatsSnapshot};
use db_dispatch::models::Message;
use serde_json::json;
use std::sync::Arc;

fn dispatcher(driver: &Arc<MockDriver>) -> Arc<Dispatcher<MockDriver>> {
    Dispatcher::new(Arc::clone(driver), registry(Arc::clone(driver)))
}

#[tokio::test]
async fn test_limit_one_runs_both_requests() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    endpoint.send(request("slow", json!([30])));
    endpoint.send(request("echo", json!(["second"])));

    let first = next(&mut outputs.success).await;
    let second = next(&mut outputs.success).await;
    assert_eq!(first.payload, json!([30]));
    assert_eq!(second.payload, json!(["second"]));

    eventually(|| endpoint.cell().is_idle()).await;
    assert_eq!(endpoint.cell().in_flight(), 0);
    assert_eq!(driver.connects(), 1);
}

#[tokio::test]
async fn test_backlog_is_fifo_across_endpoints() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (first, mut first_out) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();
    let (second, mut second_out) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();
    assert!(Arc::ptr_eq(first.cell(), second.cell()));

    first.send(request("slow", json!([50, "A"])));
    second.send(request("slow", json!([1, "B"])));
    first.send(request("slow", json!([1, "C"])));
    assert_eq!(first.cell().backlog_len(), 2);

    assert_eq!(next(&mut first_out.success).await.payload, json!([50, "A"]));
    assert_eq!(next(&mut second_out.success).await.payload, json!([1, "B"]));
    assert_eq!(next(&mut first_out.success).await.payload, json!([1, "C"]));
    eventually(|| first.cell().is_idle()).await;
}

#[tokio::test]
async fn test_queued_request_of_closed_endpoint_is_skipped() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (keeper, mut keeper_out) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();
    let (leaver, mut leaver_out) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    keeper.send(request("slow", json!([50])));
    leaver.send(request("echo", json!(["orphan"])));
    keeper.send(request("echo", json!(["kept"])));
    leaver.close().await;

    assert_eq!(next(&mut keeper_out.success).await.payload, json!([50]));
    assert_eq!(next(&mut keeper_out.success).await.payload, json!(["kept"]));
    eventually(|| keeper.cell().is_idle()).await;

    assert!(leaver_out.success.try_recv().is_err());
    assert!(leaver_out.failure.try_recv().is_err());
    assert_eq!(leaver.stats().requests, 0);
    assert_eq!(driver.closes(), 0);
}

#[tokio::test]
async fn test_cursor_items_count_as_one_success() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 2), EndpointSettings::default())
        .unwrap();

    endpoint.send(request("items.forEach", json!(3)).with_collection("users"));

    for expected in 0..3 {
        assert_eq!(next(&mut outputs.success).await.payload, json!(expected));
    }
    eventually(|| endpoint.cell().is_idle()).await;
    assert_eq!(
        endpoint.stats(),
        StatsSnapshot {
            requests: 1,
            success: 1,
            error: 0
        }
    );
    assert!(outputs.success.try_recv().is_err());
}

#[tokio::test]
async fn test_cursor_to_array_collects_items() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 0), EndpointSettings::default())
        .unwrap();

    endpoint.send(request("items.toArray", json!([4])).with_collection("users"));

    let msg = next(&mut outputs.success).await;
    assert_eq!(msg.payload, json!([0, 1, 2, 3]));
    eventually(|| endpoint.stats().success == 1).await;
}

#[tokio::test]
async fn test_cursor_stops_at_first_error() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    endpoint.send(request("broken.forEach", json!(null)).with_collection("users"));

    assert_eq!(next(&mut outputs.success).await.payload, json!("first"));
    let failed = next(&mut outputs.failure).await;
    assert!(failed.error.unwrap().contains("cursor died"));

    eventually(|| endpoint.cell().is_idle()).await;
    assert!(outputs.success.try_recv().is_err());
    assert_eq!(
        endpoint.stats(),
        StatsSnapshot {
            requests: 1,
            success: 0,
            error: 1
        }
    );
}

#[tokio::test]
async fn test_broken_cursor_to_array_fails_whole_request() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    endpoint.send(request("broken.toArray", json!(null)).with_collection("users"));

    let failed = next(&mut outputs.failure).await;
    assert!(failed.error.unwrap().contains("cursor died"));
    eventually(|| endpoint.cell().is_idle()).await;
    assert!(outputs.success.try_recv().is_err());
}

#[tokio::test]
async fn test_connect_failure_then_recovery() {
    let driver = MockDriver::new();
    driver.fail_next_connects(1);
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    endpoint.send(request("echo", json!([1])));
    let failed = next(&mut outputs.failure).await;
    assert_eq!(failed.error.as_deref(), Some("Connection failed: mock refused"));
    assert!(!endpoint.cell().is_connected().await);

    eventually(|| endpoint.cell().is_idle()).await;
    endpoint.send(request("echo", json!([2])));
    assert_eq!(next(&mut outputs.success).await.payload, json!([2]));

    assert_eq!(driver.connect_attempts(), 2);
    assert_eq!(driver.connects(), 1);
    assert!(endpoint.cell().is_connected().await);
}

#[tokio::test]
async fn test_routing_failures() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    endpoint.send(Message::new(json!(1)));
    assert_eq!(
        next(&mut outputs.failure).await.error.as_deref(),
        Some("No operation defined")
    );

    endpoint.send(request("nope", json!(1)));
    assert_eq!(
        next(&mut outputs.failure).await.error.as_deref(),
        Some("Unknown operation: nope")
    );

    endpoint.send(request("items.forEach", json!(1)));
    assert_eq!(
        next(&mut outputs.failure).await.error.as_deref(),
        Some("No collection defined")
    );

    endpoint.send(request("items.forEach", json!(1)).with_collection("missing"));
    assert!(
        next(&mut outputs.failure)
            .await
            .error
            .unwrap()
            .contains("no such collection")
    );

    eventually(|| endpoint.cell().is_idle()).await;
    assert_eq!(endpoint.stats().error, 4);
    assert_eq!(endpoint.stats().requests, 4);
    // Routing failures never reach the backend
    assert_eq!(driver.connect_attempts(), 1);
}

#[tokio::test]
async fn test_operation_failure_is_reported() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    endpoint.send(request("fail", json!(1)));
    let failed = next(&mut outputs.failure).await;
    assert_eq!(
        failed.error.as_deref(),
        Some("Operation 'fail' failed: scripted failure")
    );
    assert_eq!(failed.payload, json!(1));
}

#[tokio::test]
async fn test_settings_win_over_message_hints() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let settings = EndpointSettings::default()
        .with_operation("collection")
        .with_collection("fixed");
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("shop", 1), settings)
        .unwrap();

    endpoint.send(request("fail", json!(null)).with_collection("other"));
    let msg = next(&mut outputs.success).await;
    assert_eq!(msg.payload, json!({"database": "shop", "collection": "fixed"}));
}

#[tokio::test]
async fn test_arguments_truncated_to_arity() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    endpoint.send(request("echo", json!([1, 2, 3])));
    assert_eq!(next(&mut outputs.success).await.payload, json!([1, 2]));

    endpoint.send(request("echo", json!({"a": 1})));
    assert_eq!(next(&mut outputs.success).await.payload, json!([{"a": 1}]));

    endpoint.send(request("echo", json!([])));
    assert_eq!(next(&mut outputs.success).await.payload, json!([null]));
}

#[tokio::test]
async fn test_passthrough_database_handle() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("shop", 1), EndpointSettings::default())
        .unwrap();

    endpoint.send(request("db", json!(null)));
    assert_eq!(
        next(&mut outputs.success).await.payload,
        json!({"database": "shop", "client": 1})
    );

    endpoint.send(request("collection", json!(null)).with_collection("users"));
    assert_eq!(
        next(&mut outputs.success).await.payload,
        json!({"database": "shop", "collection": "users"})
    );
}

#[tokio::test]
async fn test_results_are_normalized() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    endpoint.send(request("noisy", json!(null)));
    assert_eq!(
        next(&mut outputs.success).await.payload,
        json!({"n": 1, "result": {"ok": 1}})
    );
}

#[tokio::test]
async fn test_parallelism_bound_holds() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 2), EndpointSettings::default())
        .unwrap();

    for _ in 0..6 {
        endpoint.send(request("tracked", json!([20])));
    }
    assert!(endpoint.cell().in_flight() <= 2);
    for _ in 0..6 {
        next(&mut outputs.success).await;
    }

    eventually(|| endpoint.cell().is_idle()).await;
    assert!(driver.max_active() <= 2);
    assert!(driver.max_active() >= 1);
    assert_eq!(endpoint.stats().success, 6);
}

#[tokio::test]
async fn test_unlimited_backend_never_queues() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 0), EndpointSettings::default())
        .unwrap();

    for _ in 0..5 {
        endpoint.send(request("tracked", json!([10])));
    }
    assert_eq!(endpoint.cell().backlog_len(), 0);
    for _ in 0..5 {
        next(&mut outputs.success).await;
    }
    eventually(|| endpoint.cell().is_idle()).await;
}

#[tokio::test]
async fn test_closed_endpoint_rejects_messages() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();
    let id = endpoint.id();
    assert!(dispatcher.endpoint(&id).is_some());

    endpoint.close().await;
    assert!(endpoint.is_closed());
    assert!(dispatcher.endpoint(&id).is_none());
    assert_eq!(dispatcher.endpoint_count(), 0);

    endpoint.send(request("echo", json!([1])));
    let failed = next(&mut outputs.failure).await;
    assert!(failed.error.unwrap().contains("endpoint is closed"));
    assert_eq!(driver.connect_attempts(), 0);
}

#[tokio::test]
async fn test_extra_fields_survive_and_routing_is_stripped() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    let msg: Message = serde_json::from_value(json!({
        "operation": "echo",
        "payload": ["x"],
        "topic": "orders",
        "_msgid": "m-1"
    }))
    .unwrap();
    endpoint.send(msg);

    let result = serde_json::to_value(next(&mut outputs.success).await).unwrap();
    assert_eq!(result["payload"], json!(["x"]));
    assert_eq!(result["topic"], "orders");
    assert_eq!(result["_msgid"], "m-1");
    assert!(result.get("operation").is_none());
    assert!(result.get("collection").is_none());
    assert!(result.get("error").is_none());
}

#[tokio::test]
async fn test_dispatcher_lists_backends_and_operations() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (_b, _) = dispatcher
        .open_endpoint(&config("b", 1), EndpointSettings::default())
        .unwrap();
    let (_a, _) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    let names: Vec<String> = dispatcher
        .backend_ids()
        .iter()
        .map(|id| id.name().to_string())
        .collect();
    assert_eq!(names, vec!["a", "b"]);

    let operations = dispatcher.operation_names();
    assert!(operations.contains(&"items.toArray".to_string()));
    assert!(operations.contains(&"items.forEach".to_string()));
    assert!(!operations.contains(&"items".to_string()));
    assert!(operations.contains(&"db".to_string()));
}

#[tokio::test]
async fn test_closing_last_endpoint_waits_for_running_request() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    endpoint.send(request("echo", json!(["late"])));
    endpoint.close().await;

    assert_eq!(next(&mut outputs.success).await.payload, json!(["late"]));
    assert!(endpoint.cell().is_idle());
    assert!(endpoint.cell().is_closed());
    assert!(!endpoint.cell().is_connected().await);
    assert!(dispatcher.pool().is_empty());
    assert_eq!(driver.connects(), 1);
    assert_eq!(driver.closes(), 1);
}

#[tokio::test]
async fn test_closing_last_endpoint_skips_its_backlog() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    endpoint.send(request("slow", json!([20])));
    endpoint.send(request("echo", json!(["queued"])));
    endpoint.close().await;

    assert_eq!(next(&mut outputs.success).await.payload, json!([20]));
    assert!(outputs.success.try_recv().is_err());
    assert!(endpoint.cell().is_idle());
    assert_eq!(driver.connects(), driver.closes());
}

#[tokio::test]
async fn test_panicking_operation_frees_slot() {
    let driver = MockDriver::new();
    let dispatcher = dispatcher(&driver);
    let (endpoint, mut outputs) = dispatcher
        .open_endpoint(&config("a", 1), EndpointSettings::default())
        .unwrap();

    endpoint.send(request("boom", json!(["x"])));
    endpoint.send(request("echo", json!(["after"])));

    let failed = next(&mut outputs.failure).await;
    assert_eq!(
        failed.error.as_deref(),
        Some("Internal error: operation panicked")
    );
    assert_eq!(failed.payload, json!(["x"]));
    assert!(failed.operation.is_none());
    assert_eq!(next(&mut outputs.success).await.payload, json!(["after"]));

    eventually(|| endpoint.cell().is_idle()).await;
    assert_eq!(
        endpoint.stats(),
        StatsSnapshot {
            requests: 2,
            success: 1,
            error: 1
        }
    );
}
