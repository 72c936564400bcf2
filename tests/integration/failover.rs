//! Address pool failover and server redirects

use std::sync::Arc;

use hostwatch::actors::active_checks::{ActiveChecksConfig, ActiveChecksHandle, ServerLink};
use hostwatch::actors::result_cache::{CacheConfig, ResultCacheHandle, Uploader};
use hostwatch::address::{AddressPool, DEFAULT_ACTIVE_PORT, parse_server_active};
use hostwatch::protocol::ConnectOptions;
use hostwatch::{CheckResult, Value};
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::helpers::{FakeServer, TIMEOUT, check_list, closed_address, gate, scheduler};

#[tokio::test]
async fn test_refresh_fails_over_to_next_address() {
    let dead = closed_address().await;
    let server = FakeServer::start(check_list(&[(1, "agent.ping", "30s")])).await;
    let link = Arc::new(ServerLink::new(
        Arc::new(AddressPool::new([dead, server.address.clone()])),
        ConnectOptions::plain(TIMEOUT),
    ));
    let scheduler = scheduler(gate(&[], &[]));
    let cache = ResultCacheHandle::spawn(CacheConfig::new("test-host"), Some(link.clone() as Arc<dyn Uploader>), None);
    let connector = ActiveChecksHandle::spawn(
        ActiveChecksConfig::new("test-host"),
        link.clone(),
        scheduler.clone(),
        Arc::new(cache),
        1,
    );

    // the first attempt may already have run from the initial tick
    let _ = connector.refresh_now().await;
    connector.refresh_now().await.unwrap();

    assert_eq!(link.pool().get(), Some(server.address.clone()));
    assert_eq!(scheduler.stats().await.unwrap().tasks, 1);
}

#[tokio::test]
async fn test_delivery_and_refresh_share_the_pool() {
    let dead = closed_address().await;
    let server = FakeServer::start(check_list(&[])).await;
    let link = Arc::new(ServerLink::new(
        Arc::new(AddressPool::new([dead, server.address.clone()])),
        ConnectOptions::plain(TIMEOUT),
    ));
    let cache = ResultCacheHandle::spawn(CacheConfig::new("test-host"), Some(link.clone() as Arc<dyn Uploader>), None);

    cache.write(CheckResult::new(7, Value::Unsigned(1))).await.unwrap();
    assert!(cache.flush().await.is_err());
    assert_eq!(link.pool().get(), Some(server.address.clone()));

    assert_eq!(cache.flush().await.unwrap(), 1);
    assert_eq!(server.state.delivered_items(), vec![7]);
}

#[tokio::test]
async fn test_redirect_moves_traffic_until_reset() {
    let target = FakeServer::start(check_list(&[(1, "agent.ping", "30s")])).await;
    let origin = FakeServer::start(json!({
        "redirect": {"revision": 3, "address": target.address.to_string()},
    }))
    .await;

    let link = Arc::new(ServerLink::new(
        Arc::new(AddressPool::new([origin.address.clone()])),
        ConnectOptions::plain(TIMEOUT),
    ));
    let scheduler = scheduler(gate(&[], &[]));
    let cache = ResultCacheHandle::spawn(CacheConfig::new("test-host"), Some(link.clone() as Arc<dyn Uploader>), None);
    let connector = ActiveChecksHandle::spawn(
        ActiveChecksConfig::new("test-host"),
        link.clone(),
        scheduler.clone(),
        Arc::new(cache),
        1,
    );

    connector.refresh_now().await.unwrap();
    assert_eq!(scheduler.stats().await.unwrap().tasks, 1);

    let head = link.pool().get().unwrap();
    assert_eq!((head.port, head.revision), (target.address.port, 3));
    assert!(target.state.active_check_requests() >= 1);

    // an older redirect does not displace the current one
    assert!(!link.pool().add_redirect("elsewhere", 1, 2));

    target.set_checks(json!({"redirect": {"reset": true}}));
    let _ = connector.refresh_now().await;
    assert_eq!(link.pool().get(), Some(origin.address.clone()));
}

#[test]
fn test_cluster_pools_from_server_active() {
    let clusters = parse_server_active("a;b:20051,c", DEFAULT_ACTIVE_PORT).unwrap();
    let pools: Vec<AddressPool> = clusters.into_iter().map(AddressPool::new).collect();
    assert_eq!(pools.len(), 2);

    let first = &pools[0];
    assert_eq!(first.get().unwrap().host, "a");
    assert_eq!(first.next().unwrap().host, "b");
    assert_eq!(first.next().unwrap().host, "a");
}
