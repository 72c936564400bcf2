//! Active checks end to end: configuration refresh, scheduling, buffering
//! and delivery to a loopback server

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use hostwatch::actors::active_checks::{ActiveChecksConfig, ActiveChecksHandle, ServerLink};
use hostwatch::actors::result_cache::{CacheConfig, ResultCacheHandle, Uploader};
use hostwatch::address::AddressPool;
use hostwatch::protocol::ConnectOptions;
use hostwatch::storage::{MemoryBuffer, PersistentBuffer};
use pretty_assertions::assert_eq;

use crate::helpers::{FakeServer, TIMEOUT, check_list, eventually, gate, scheduler};

fn cache_config(buffer_size: usize, capacity: usize) -> CacheConfig {
    CacheConfig {
        buffer_size,
        capacity,
        send_period: Duration::from_millis(200),
        ..CacheConfig::new("test-host")
    }
}

fn connector_config() -> ActiveChecksConfig {
    ActiveChecksConfig {
        refresh: Duration::from_secs(60),
        ..ActiveChecksConfig::new("test-host")
    }
}

#[tokio::test]
async fn test_items_are_collected_and_delivered() {
    let server = FakeServer::start(check_list(&[(1, "agent.ping", "1"), (2, "agent.hostname", "1")])).await;
    let link = Arc::new(ServerLink::new(
        Arc::new(AddressPool::new([server.address.clone()])),
        ConnectOptions::plain(TIMEOUT),
    ));

    let scheduler = scheduler(gate(&[], &[]));
    let cache = ResultCacheHandle::spawn(cache_config(100, 1000), Some(link.clone() as Arc<dyn Uploader>), None);
    let connector = ActiveChecksHandle::spawn(
        connector_config(),
        link,
        scheduler.clone(),
        Arc::new(cache.clone()),
        1,
    );

    connector.refresh_now().await.unwrap();

    let state = server.state.clone();
    let delivered = eventually(Duration::from_secs(10), || {
        let state = state.clone();
        async move {
            let items = state.delivered_items();
            items.contains(&1) && items.contains(&2)
        }
    })
    .await;
    assert!(delivered, "values never reached the server");

    let values = server.state.delivered.lock().unwrap().clone();
    let ping = values.iter().find(|v| v["itemid"] == 1).unwrap();
    assert_eq!(ping["value"], "1");
    assert!(ping["clock"].as_i64().unwrap() > 0);
    let hostname = values.iter().find(|v| v["itemid"] == 2).unwrap();
    assert_eq!(hostname["value"], "test-host");

    let requests = server.state.requests.lock().unwrap().clone();
    let data = requests.iter().find(|r| r["request"] == "agent data").unwrap();
    assert_eq!(data["host"], "test-host");
    assert!(data["sessionid"].is_string());

    connector.shutdown().await.unwrap();
    cache.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_removed_items_stop_reporting() {
    let server = FakeServer::start(check_list(&[(1, "agent.ping", "1")])).await;
    let link = Arc::new(ServerLink::new(
        Arc::new(AddressPool::new([server.address.clone()])),
        ConnectOptions::plain(TIMEOUT),
    ));
    let scheduler = scheduler(gate(&[], &[]));
    let cache = ResultCacheHandle::spawn(cache_config(100, 1000), Some(link.clone() as Arc<dyn Uploader>), None);
    let connector = ActiveChecksHandle::spawn(
        connector_config(),
        link,
        scheduler.clone(),
        Arc::new(cache.clone()),
        1,
    );

    connector.refresh_now().await.unwrap();
    assert_eq!(scheduler.stats().await.unwrap().tasks, 1);

    server.set_checks(check_list(&[]));
    connector.refresh_now().await.unwrap();
    let stats = scheduler.stats().await.unwrap();
    assert_eq!(stats.tasks, 0);
    assert_eq!(stats.clients, 0);
}

#[tokio::test]
async fn test_outage_buffers_then_recovers_without_loss() {
    let server = FakeServer::start(check_list(&[])).await;
    server.state.rejecting.store(true, Ordering::SeqCst);
    let link = Arc::new(ServerLink::new(
        Arc::new(AddressPool::new([server.address.clone()])),
        ConnectOptions::plain(TIMEOUT),
    ));
    let cache = ResultCacheHandle::spawn(
        CacheConfig {
            send_period: Duration::from_secs(3600),
            ..cache_config(100, 1000)
        },
        Some(link as Arc<dyn Uploader>),
        None,
    );

    for itemid in 1..=5 {
        cache
            .write(hostwatch::CheckResult::new(itemid, hostwatch::Value::Unsigned(itemid)))
            .await
            .unwrap();
    }
    assert!(cache.flush().await.is_err());
    assert!(server.state.delivered_items().is_empty());
    assert_eq!(cache.stats().await.unwrap().buffered, 5);

    server.state.rejecting.store(false, Ordering::SeqCst);
    assert_eq!(cache.flush().await.unwrap(), 5);
    assert_eq!(server.state.delivered_items(), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_overflow_spills_and_is_delivered_oldest_first() {
    let server = FakeServer::start(check_list(&[])).await;
    server.state.rejecting.store(true, Ordering::SeqCst);
    let link = Arc::new(ServerLink::new(
        Arc::new(AddressPool::new([server.address.clone()])),
        ConnectOptions::plain(TIMEOUT),
    ));
    let disk = Arc::new(MemoryBuffer::new());
    let cache = ResultCacheHandle::spawn(
        CacheConfig {
            send_period: Duration::from_secs(3600),
            ..cache_config(2, 3)
        },
        Some(link as Arc<dyn Uploader>),
        Some(disk.clone() as Arc<dyn PersistentBuffer>),
    );

    for itemid in 1..=8 {
        cache
            .write(hostwatch::CheckResult::new(itemid, hostwatch::Value::Unsigned(itemid)))
            .await
            .unwrap();
    }
    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.buffered, 3);
    assert_eq!(stats.persisted, 5);
    assert_eq!(stats.dropped, 0);

    server.state.rejecting.store(false, Ordering::SeqCst);
    assert_eq!(cache.flush().await.unwrap(), 8);
    assert_eq!(server.state.delivered_items(), (1..=8).collect::<Vec<u64>>());
    assert_eq!(disk.count().await.unwrap(), 0);
}
