// Copyright 2018 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use futures::executor::block_on;
use kvproto::metapb;
use pd_client::{Config, Error, RpcClient};
use security::{SecurityConfig, SecurityManager};
use test_pd::{LeaderChange, Server, DEFAULT_CLUSTER_ID};
use tokio_util::sync::CancellationToken;

use crate::{new_client, new_config};

fn region(id: u64, start_key: &[u8], end_key: &[u8]) -> metapb::Region {
    let mut r = metapb::Region::default();
    r.set_id(id);
    r.set_start_key(start_key.to_vec());
    r.set_end_key(end_key.to_vec());
    r
}

fn peer(id: u64, store_id: u64) -> metapb::Peer {
    let mut p = metapb::Peer::default();
    p.set_id(id);
    p.set_store_id(store_id);
    p
}

fn store(id: u64, state: metapb::StoreState) -> metapb::Store {
    let mut s = metapb::Store::default();
    s.set_id(id);
    s.set_state(state);
    s
}

#[test]
fn test_cluster_id() {
    let server = Server::new(1);
    let client = new_client(server.bind_addrs());
    assert_eq!(client.cluster_id(), DEFAULT_CLUSTER_ID);
}

#[test]
fn test_region_lookup() {
    let server = Server::new(1);
    let handler = server.default_handler();
    handler.add_region(region(1, b"", b"k"), Some(peer(11, 1)));
    handler.add_region(region(2, b"k", b""), None);
    let client = new_client(server.bind_addrs());

    let info = block_on(client.get_region(b"a")).unwrap().unwrap();
    assert_eq!(info.region.get_id(), 1);
    assert_eq!(info.leader.as_ref().map(|p| p.get_id()), Some(11));

    let info = block_on(client.get_region(b"z")).unwrap().unwrap();
    assert_eq!(info.region.get_id(), 2);
    assert!(info.leader.is_none());

    let info = block_on(client.get_prev_region(b"z")).unwrap().unwrap();
    assert_eq!(info.region.get_id(), 1);

    let info = block_on(client.get_region_by_id(2)).unwrap().unwrap();
    assert_eq!(info.region.get_id(), 2);
    assert!(block_on(client.get_region_by_id(4)).unwrap().is_none());
}

#[test]
fn test_scan_regions() {
    let server = Server::new(1);
    let handler = server.default_handler();
    handler.add_region(region(1, b"", b"b"), Some(peer(11, 1)));
    handler.add_region(region(2, b"b", b"c"), None);
    handler.add_region(region(3, b"c", b""), Some(peer(31, 3)));
    let client = new_client(server.bind_addrs());

    let (regions, leaders) = block_on(client.scan_regions(b"", 2)).unwrap();
    assert_eq!(regions.len(), 2);
    assert_eq!(leaders.len(), 2);
    assert_eq!(regions[0].get_id(), 1);
    assert_eq!(leaders[0].get_id(), 11);
    // A region without a leader reports a placeholder peer with id 0.
    assert_eq!(regions[1].get_id(), 2);
    assert_eq!(leaders[1].get_id(), 0);

    let (regions, _) = block_on(client.scan_regions(b"b", 10)).unwrap();
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[0].get_id(), 2);
    assert_eq!(regions[1].get_id(), 3);
}

#[test]
fn test_store_lookup() {
    let server = Server::new(1);
    let handler = server.default_handler();
    handler.add_store(store(1, metapb::StoreState::Up));
    handler.add_store(store(2, metapb::StoreState::Tombstone));
    let client = new_client(server.bind_addrs());

    let s = block_on(client.get_store(1)).unwrap().unwrap();
    assert_eq!(s.get_id(), 1);
    // Tombstone stores are reported as absent.
    assert!(block_on(client.get_store(2)).unwrap().is_none());
    let err = block_on(client.get_store(3)).unwrap_err();
    assert!(matches!(err, Error::StoreNotFound(3)));

    let stores = block_on(client.get_all_stores(false)).unwrap();
    assert_eq!(stores.len(), 2);
    let stores = block_on(client.get_all_stores(true)).unwrap();
    assert_eq!(stores.len(), 1);
    assert_eq!(stores[0].get_id(), 1);
}

#[test]
fn test_gc_safe_point_is_monotonic() {
    let server = Server::new(1);
    let client = new_client(server.bind_addrs());

    assert_eq!(block_on(client.update_gc_safe_point(100)).unwrap(), 100);
    // The server ignores values below its current safe point.
    assert_eq!(block_on(client.update_gc_safe_point(50)).unwrap(), 100);
    assert_eq!(block_on(client.update_gc_safe_point(120)).unwrap(), 120);
}

#[test]
fn test_scatter_region_and_operator() {
    let server = Server::new(1);
    server
        .default_handler()
        .add_region(region(1, b"", b""), Some(peer(11, 1)));
    let client = new_client(server.bind_addrs());

    block_on(client.scatter_region(1)).unwrap();
    let resp = block_on(client.get_operator(1)).unwrap();
    assert_eq!(resp.get_region_id(), 1);
    assert_eq!(resp.get_desc(), b"scatter-region");

    let err = block_on(client.scatter_region(9)).unwrap_err();
    assert!(matches!(err, Error::PdServer(_)));
}

#[test]
fn test_cluster_header_is_stamped() {
    let server = Server::new(1);
    let client = new_client(server.bind_addrs());

    let ctx = CancellationToken::new();
    client.get_ts(&ctx).unwrap();
    assert_eq!(server.default_handler().last_cluster_id(), DEFAULT_CLUSTER_ID);

    let _ = block_on(client.get_region(b""));
    assert_eq!(server.default_handler().last_cluster_id(), DEFAULT_CLUSTER_ID);
}

#[test]
fn test_leader_change() {
    let case = Arc::new(LeaderChange::new());
    let server = Server::with_case(3, Arc::clone(&case));
    server
        .default_handler()
        .add_region(region(1, b"", b""), Some(peer(11, 1)));
    let eps = server.bind_addrs();
    let client = new_client(eps.clone());

    let url = |i: usize| format!("http://{}:{}", eps[i].0, eps[i].1);
    assert_eq!(client.leader_url(), url(0));
    block_on(client.get_region(b"a")).unwrap().unwrap();

    case.set_leader(1);
    // The retired leader rejects the call once; the error schedules a
    // leader re-check.
    block_on(client.get_region(b"a")).unwrap_err();

    let deadline = Instant::now() + Duration::from_secs(10);
    while client.leader_url() != url(1) {
        assert!(Instant::now() < deadline, "leader did not switch");
        thread::sleep(Duration::from_millis(100));
    }
    block_on(client.get_region(b"a")).unwrap().unwrap();
    assert_eq!(client.urls().len(), 3);

    // An explicit re-check picks up a new leader as well.
    case.set_leader(2);
    client.schedule_check_leader();
    let deadline = Instant::now() + Duration::from_secs(10);
    while client.leader_url() != url(2) {
        assert!(Instant::now() < deadline, "leader did not switch");
        thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn test_bootstrap_failure() {
    // Nothing is listening on this endpoint.
    let mut cfg = Config::new(vec!["127.0.0.1:1".to_owned()]);
    cfg.retry_max_count = 1;
    cfg.retry_interval = Duration::from_millis(50);
    let mgr = Arc::new(SecurityManager::new(&SecurityConfig::default()).unwrap());
    let err = RpcClient::new(&cfg, mgr).unwrap_err();
    assert!(matches!(err, Error::FailToInitClusterId));
}

#[test]
fn test_close_is_idempotent() {
    let server = Server::new(1);
    let client = new_client(server.bind_addrs());
    client.close();
    client.close();
}

#[test]
fn test_config_rejects_duplicates() {
    let server = Server::new(1);
    let mut eps = server.bind_addrs();
    eps.push(eps[0].clone());
    let cfg = new_config(eps);
    let mgr = Arc::new(SecurityManager::new(&SecurityConfig::default()).unwrap());
    RpcClient::new(&cfg, mgr).unwrap_err();
}
