//! Shared fixtures: a loopback server speaking the framed protocol and
//! wiring helpers for the agent actors

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hostwatch::access::{AccessGate, RuleSource};
use hostwatch::actors::scheduler::{SchedulerConfig, SchedulerHandle};
use hostwatch::address::Address;
use hostwatch::plugin::Registry;
use hostwatch::protocol::{AcceptOptions, Connection};
use serde_json::{Value, json};
use tokio::net::TcpListener;

pub const TIMEOUT: Duration = Duration::from_secs(2);

/// What the fake server has seen and how it answers
#[derive(Default)]
pub struct ServerState {
    pub checks: Mutex<Value>,
    pub rejecting: AtomicBool,
    pub requests: Mutex<Vec<Value>>,
    pub delivered: Mutex<Vec<Value>>,
    pub connections: AtomicUsize,
}

impl ServerState {
    pub fn delivered_items(&self) -> Vec<u64> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter_map(|value| value["itemid"].as_u64())
            .collect()
    }

    pub fn active_check_requests(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request["request"] == "active checks")
            .count()
    }
}

/// Loopback server answering "active checks" and "agent data"
pub struct FakeServer {
    pub address: Address,
    pub state: Arc<ServerState>,
}

impl FakeServer {
    pub async fn start(checks: Value) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = Address::new("127.0.0.1", listener.local_addr().unwrap().port());
        let state = Arc::new(ServerState {
            checks: Mutex::new(checks),
            ..ServerState::default()
        });

        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.connections.fetch_add(1, Ordering::SeqCst);
                let state = shared.clone();
                tokio::spawn(async move {
                    let Ok(mut conn) = Connection::accept(stream, &AcceptOptions::plain(TIMEOUT)).await
                    else {
                        return;
                    };
                    let Ok(request) = conn.recv_request().await else {
                        return;
                    };
                    let request: Value = serde_json::from_slice(&request.payload).unwrap_or(Value::Null);
                    state.requests.lock().unwrap().push(request.clone());

                    let reply = match request["request"].as_str() {
                        Some("active checks") => state.checks.lock().unwrap().clone(),
                        Some("agent data") if state.rejecting.load(Ordering::SeqCst) => {
                            json!({"response": "failed", "info": "try again later"})
                        }
                        Some("agent data") => {
                            let data = request["data"].as_array().cloned().unwrap_or_default();
                            let count = data.len();
                            state.delivered.lock().unwrap().extend(data);
                            json!({"response": "success", "info": format!("processed: {count}")})
                        }
                        _ => json!({"response": "failed", "info": "unknown request"}),
                    };
                    let _ = conn.send(&serde_json::to_vec(&reply).unwrap()).await;
                    conn.close().await;
                });
            }
        });

        Self { address, state }
    }

    pub fn set_checks(&self, checks: Value) {
        *self.state.checks.lock().unwrap() = checks;
    }
}

/// An address nothing listens on
pub async fn closed_address() -> Address {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = Address::new("127.0.0.1", listener.local_addr().unwrap().port());
    drop(listener);
    address
}

pub fn check_list(items: &[(u64, &str, &str)]) -> Value {
    let data: Vec<Value> = items
        .iter()
        .map(|(itemid, key, delay)| {
            json!({"key": key, "itemid": itemid, "delay": delay, "lastlogsize": 0, "mtime": 0})
        })
        .collect();
    json!({"response": "success", "data": data})
}

pub fn gate(allow: &[&str], deny: &[&str]) -> Arc<AccessGate> {
    let mut line = 0;
    let mut sources = |patterns: &[&str]| {
        patterns
            .iter()
            .map(|pattern| {
                line += 1;
                RuleSource::new(line, *pattern)
            })
            .collect::<Vec<_>>()
    };
    let allow = sources(allow);
    let deny = sources(deny);

    let gate = AccessGate::new();
    gate.load_rules(&allow, &deny).unwrap();
    Arc::new(gate)
}

pub fn scheduler(gate: Arc<AccessGate>) -> SchedulerHandle {
    SchedulerHandle::spawn(
        Arc::new(Registry::with_builtins("test-host")),
        gate,
        SchedulerConfig {
            timeout: TIMEOUT,
            tick: Duration::from_millis(100),
        },
    )
}

/// Poll `condition` until it holds or `limit` passes
pub async fn eventually<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition().await
}
