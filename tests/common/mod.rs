//! Scripted in-memory driver shared by the dispatch and pool tests.

#![allow(dead_code)]

use db_dispatch::dispatch::{Driver, OperationRegistry, Resource, Scope};
use db_dispatch::error::{DispatchError, DispatchResult};
use db_dispatch::models::{BackendConfig, BackendId, Message};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

#[derive(Debug)]
pub struct MockClient {
    pub serial: usize,
}

#[derive(Debug)]
pub struct MockDatabase {
    pub name: String,
    pub serial: usize,
}

#[derive(Debug)]
pub struct MockCollection {
    pub database: String,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct MockDriver {
    connect_attempts: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    fail_connects: AtomicUsize,
    connect_delay: Mutex<Duration>,
    close_gate: Mutex<Option<Arc<Notify>>>,
    /// Operations currently inside `tracked`
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Make the next `n` connects fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    /// Block the next close until the returned gate is notified.
    pub fn hold_next_close(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.close_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    async fn tracked(&self, delay: Duration) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Driver for MockDriver {
    type Client = Arc<MockClient>;
    type Database = MockDatabase;
    type Collection = MockCollection;

    async fn connect(&self, _config: &BackendConfig) -> DispatchResult<Arc<MockClient>> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DispatchError::connection("mock refused", "try again"));
        }
        let serial = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(MockClient { serial }))
    }

    async fn close(&self, _client: Arc<MockClient>) -> DispatchResult<()> {
        let gate = self.close_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn database(&self, client: &Arc<MockClient>, name: &str) -> DispatchResult<MockDatabase> {
        Ok(MockDatabase {
            name: name.to_string(),
            serial: client.serial,
        })
    }

    fn collection(&self, database: &MockDatabase, name: &str) -> DispatchResult<MockCollection> {
        if name == "missing" {
            return Err(DispatchError::invalid_input("no such collection"));
        }
        Ok(MockCollection {
            database: database.name.clone(),
            name: name.to_string(),
        })
    }

    fn describe(&self, resource: &Resource<Self>) -> Value {
        match resource {
            Resource::Database(db) => json!({"database": db.name, "client": db.serial}),
            Resource::Collection(c) => json!({"database": c.database, "collection": c.name}),
        }
    }
}

fn explode() -> DispatchResult<Value> {
    panic!("scripted panic")
}

fn count_arg(args: &[Value]) -> u64 {
    args.first().and_then(Value::as_u64).unwrap_or(0)
}

/// Registry with pass-through operations and a handful of scripted ones:
///
/// - `echo`: returns its arguments (at most two) as an array
/// - `slow`: sleeps the first argument in milliseconds, then echoes
/// - `tracked`: like `slow`, recording peak concurrency on the driver
/// - `fail`: always fails
/// - `boom`: panics
/// - `noisy`: returns an object with transport internals attached
/// - `items` (cursor, collection): yields `0..n`
/// - `broken` (cursor, collection): yields one item then fails
pub fn registry(driver: Arc<MockDriver>) -> OperationRegistry<MockDriver> {
    let mut registry = OperationRegistry::with_passthrough(Arc::clone(&driver));

    registry.register("echo", Scope::Database, Some(2), |_resource, args| async move {
        Ok(Value::Array(args))
    });

    registry.register("slow", Scope::Database, None, |_resource, args| async move {
        tokio::time::sleep(Duration::from_millis(count_arg(&args))).await;
        Ok(Value::Array(args))
    });

    let tracker = Arc::clone(&driver);
    registry.register("tracked", Scope::Database, None, move |_resource, args| {
        let tracker = Arc::clone(&tracker);
        async move {
            tracker
                .tracked(Duration::from_millis(count_arg(&args)))
                .await;
            Ok(Value::Array(args))
        }
    });

    registry.register("fail", Scope::Database, None, |_resource, _args| async move {
        Err::<Value, _>(DispatchError::operation("fail", "scripted failure"))
    });

    registry.register("boom", Scope::Database, None, |_resource, _args| async move {
        explode()
    });

    registry.register("noisy", Scope::Database, None, |_resource, _args| async move {
        Ok(json!({
            "n": 1,
            "connection": {"socket": 9},
            "message": "verbose",
            "result": {"ok": 1, "connection": {"socket": 9}}
        }))
    });

    registry.register_cursor("items", Scope::Collection, Some(1), |_resource, args| async move {
        let n = count_arg(&args);
        let items: BoxStream<'static, DispatchResult<Value>> =
            stream::iter((0..n).map(|i| Ok(json!(i)))).boxed();
        Ok(items)
    });

    registry.register_cursor("broken", Scope::Collection, None, |_resource, _args| async move {
        let items: BoxStream<'static, DispatchResult<Value>> = stream::iter(vec![
            Ok(json!("first")),
            Err(DispatchError::operation("broken", "cursor died")),
            Ok(json!("never")),
        ])
        .boxed();
        Ok(items)
    });

    registry
}

pub fn config(id: &str, parallelism: u32) -> BackendConfig {
    BackendConfig::new(BackendId::deployment(id), format!("mock://host/{id}"))
        .with_parallelism(parallelism)
}

pub fn request(operation: &str, payload: Value) -> Message {
    Message::new(payload).with_operation(operation)
}

/// Next message on `rx`, failing the test after a few seconds.
pub async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a result")
        .expect("channel closed")
}

/// Wait until `check` holds, failing the test after a few seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
