// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use futures::executor::block_on;
use futures::future::join_all;
use pd_client::Error;
use test_pd::{FlakyTso, Server, TsoHang};
use tokio_util::sync::CancellationToken;

use crate::new_client;

#[test]
fn test_tso_monotonic() {
    let server = Server::new(1);
    let client = new_client(server.bind_addrs());
    let ctx = CancellationToken::new();

    let mut last = (0, 0);
    for _ in 0..100 {
        let ts = client.get_ts(&ctx).unwrap();
        let cur = (ts.get_physical(), ts.get_logical());
        assert!(cur > last, "{:?} <= {:?}", cur, last);
        last = cur;
    }
}

#[test]
fn test_tso_batch_allocation() {
    let server = Server::new(1);
    server.default_handler().set_tso(200, 99);
    let client = new_client(server.bind_addrs());
    let ctx = CancellationToken::new();

    let futures: Vec<_> = (0..5).map(|_| client.get_ts_async(&ctx).wait()).collect();
    let mut logicals = Vec::new();
    for res in block_on(join_all(futures)) {
        let ts = res.unwrap();
        assert_eq!(ts.get_physical(), 200);
        logicals.push(ts.get_logical());
    }
    // However the five requests were batched, the allocation is contiguous.
    logicals.sort_unstable();
    assert_eq!(logicals, vec![100, 101, 102, 103, 104]);
}

#[test]
fn test_tso_futures_keep_submission_order() {
    let server = Server::new(1);
    let client = new_client(server.bind_addrs());
    let ctx = CancellationToken::new();

    // Obtain the futures in call order, await them in reverse.
    let futures: Vec<_> = (0..3).map(|_| client.get_ts_async(&ctx)).collect();
    let mut logicals = Vec::new();
    for fut in futures.into_iter().rev() {
        logicals.push(block_on(fut.wait()).unwrap().get_logical());
    }
    logicals.reverse();
    // Timestamps follow the order the requests were submitted in, not the
    // order the futures were awaited in.
    let base = logicals[0];
    assert_eq!(logicals, vec![base, base + 1, base + 2]);
}

#[test]
fn test_tso_concurrent_callers_get_distinct_timestamps() {
    let server = Server::new(1);
    let client = Arc::new(new_client(server.bind_addrs()));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                let ctx = CancellationToken::new();
                let ts = client.get_ts(&ctx).unwrap();
                (ts.get_physical(), ts.get_logical())
            })
        })
        .collect();
    let mut timestamps: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    timestamps.sort_unstable();
    let len_before = timestamps.len();
    timestamps.dedup();
    assert_eq!(timestamps.len(), len_before);
}

#[test]
fn test_tso_length_mismatch_resets_stream() {
    let server = Server::with_case(1, Arc::new(FlakyTso::new(1)));
    let client = new_client(server.bind_addrs());
    let ctx = CancellationToken::new();

    let err = client.get_ts(&ctx).unwrap_err();
    assert!(matches!(err, Error::TsoBatchLength { .. }), "{:?}", err);

    // The stream was torn down and rebuilt; the next request succeeds.
    let ts = client.get_ts(&ctx).unwrap();
    assert!(ts.get_logical() > 0);
}

#[test]
fn test_tso_caller_cancellation() {
    let server = Server::with_case(1, Arc::new(TsoHang::new()));
    let client = new_client(server.bind_addrs());

    let ctx = CancellationToken::new();
    let fut = client.get_ts_async(&ctx);
    let canceler = {
        let ctx = ctx.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            ctx.cancel();
        })
    };

    let start = Instant::now();
    let err = block_on(fut.wait()).unwrap_err();
    assert!(matches!(err, Error::Canceled), "{:?}", err);
    // The cancellation fires well before the batch deadline.
    assert!(start.elapsed() < Duration::from_secs(3));
    canceler.join().unwrap();
}

#[test]
fn test_tso_batch_deadline() {
    let server = Server::with_case(1, Arc::new(TsoHang::new()));
    let client = new_client(server.bind_addrs());
    let ctx = CancellationToken::new();

    let start = Instant::now();
    let err = client.get_ts(&ctx).unwrap_err();
    assert!(matches!(err, Error::TsoStream(_)), "{:?}", err);
    assert!(start.elapsed() >= Duration::from_secs(3));
}

#[test]
fn test_close_drains_pending_requests() {
    let server = Server::with_case(1, Arc::new(TsoHang::new()));
    let client = new_client(server.bind_addrs());
    let ctx = CancellationToken::new();

    let fut = client.get_ts_async(&ctx);
    let waiter = thread::spawn(move || block_on(fut.wait()));
    // Let the request reach the pipeline before closing.
    thread::sleep(Duration::from_millis(300));
    client.close();

    // The in-flight request observes the teardown...
    waiter.join().unwrap().unwrap_err();
    // ...and new submissions are refused outright.
    let err = client.get_ts(&ctx).unwrap_err();
    assert!(matches!(err, Error::Closing), "{:?}", err);
}
