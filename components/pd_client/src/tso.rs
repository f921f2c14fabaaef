// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

//! The low-level mechanism for getting timestamps from the PD cluster.
//!
//! Requests enter a bounded submission queue and are merged by a sender loop
//! into single frames of a long-lived bidirectional `Tso` stream: one frame
//! carries the batch size, the response carries the highest timestamp
//! allocated, and the loop fans the contiguous range back out to the batch
//! in submission order. A separate watcher task enforces a per-batch
//! deadline by canceling the stream, since the sender loop itself is parked
//! inside the streaming receive while a batch is in flight. Request records
//! are recycled through a lock-free free list.

use std::sync::Arc;
use std::time::Instant;

use crossbeam::queue::ArrayQueue;
use futures::{SinkExt, StreamExt};
use grpcio::{ClientDuplexReceiver, ClientDuplexSender, WriteFlags};
use kvproto::pdpb::{Timestamp, TsoRequest, TsoResponse};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant as TokioInstant};
use tokio_util::sync::CancellationToken;

use crate::metrics::*;
use crate::util::Inner;
use crate::{box_err, Error, Result, REQUEST_TIMEOUT, TSO_STREAM_RETRY_INTERVAL};

/// A pending timestamp request: the submission time plus the single-shot
/// result signal. The signal is written exactly once, after which the record
/// goes back to the free list.
pub(crate) struct TimestampRequest {
    start: Instant,
    sender: Option<oneshot::Sender<Result<Timestamp>>>,
}

pub(crate) type RequestPool = Arc<ArrayQueue<Box<TimestampRequest>>>;

impl TimestampRequest {
    fn new() -> TimestampRequest {
        TimestampRequest {
            start: Instant::now(),
            sender: None,
        }
    }

    fn finish(mut self: Box<Self>, res: Result<Timestamp>, free_list: &RequestPool) {
        if let Some(sender) = self.sender.take() {
            // The receiver may already be gone when the caller canceled; the
            // record is recycled either way.
            let _ = sender.send(res);
        }
        let _ = free_list.push(self);
    }
}

/// The facade-side handle of the TSO pipeline.
pub(crate) struct TimestampOracle {
    request_tx: mpsc::Sender<Box<TimestampRequest>>,
    free_list: RequestPool,
}

impl TimestampOracle {
    pub(crate) fn new(
        request_tx: mpsc::Sender<Box<TimestampRequest>>,
        free_list: RequestPool,
    ) -> TimestampOracle {
        TimestampOracle {
            request_tx,
            free_list,
        }
    }

    pub(crate) fn get_timestamp(&self, ctx: &CancellationToken) -> TimestampFuture {
        let mut request = self
            .free_list
            .pop()
            .unwrap_or_else(|| Box::new(TimestampRequest::new()));
        request.start = Instant::now();
        let start = request.start;
        let (tx, rx) = oneshot::channel();
        request.sender = Some(tx);
        // The record enters the queue right here, so submission order is the
        // call order rather than the order the futures are first polled in.
        let submit_err = match self.request_tx.try_send(request) {
            Ok(()) => None,
            Err(e) => {
                let (err, mut request) = match e {
                    TrySendError::Closed(request) => (Error::Closing, request),
                    TrySendError::Full(request) => {
                        (box_err!("the tso request queue is full"), request)
                    }
                };
                request.sender = None;
                let _ = self.free_list.push(request);
                Some(err)
            }
        };
        TimestampFuture {
            start,
            ctx: ctx.clone(),
            submit_err,
            result: rx,
        }
    }
}

/// A promise for a `(physical, logical)` timestamp pair. The underlying
/// request is already queued when the future is handed out.
pub struct TimestampFuture {
    start: Instant,
    ctx: CancellationToken,
    submit_err: Option<Error>,
    result: oneshot::Receiver<Result<Timestamp>>,
}

impl TimestampFuture {
    /// Waits until the timestamp is allocated, the caller context is
    /// canceled, or the client shuts down.
    pub async fn wait(mut self) -> Result<Timestamp> {
        PD_CMD_HISTOGRAM_VEC
            .with_label_values(&["tso_async_wait"])
            .observe(self.start.elapsed().as_secs_f64());
        let res = self.do_wait().await;
        let duration = self.start.elapsed().as_secs_f64();
        if res.is_ok() {
            PD_CMD_HISTOGRAM_VEC
                .with_label_values(&["tso"])
                .observe(duration);
        } else {
            PD_CMD_FAILED_HISTOGRAM_VEC
                .with_label_values(&["tso"])
                .observe(duration);
        }
        res
    }

    async fn do_wait(&mut self) -> Result<Timestamp> {
        if let Some(err) = self.submit_err.take() {
            return Err(err);
        }
        tokio::select! {
            res = &mut self.result => match res {
                Ok(res) => res,
                // The pipeline dropped the signal without writing it, which
                // only happens on shutdown.
                Err(_) => Err(Error::Closing),
            },
            _ = self.ctx.cancelled() => Err(Error::Canceled),
        }
    }
}

/// A per-batch deadline handed to the watcher: when the timer wins, the
/// stream token is canceled and the sender loop resets the stream.
pub(crate) struct TsoDeadline {
    deadline: TokioInstant,
    done: oneshot::Receiver<()>,
    cancel: CancellationToken,
}

pub(crate) async fn tso_deadline_loop(
    mut deadline_rx: mpsc::Receiver<TsoDeadline>,
    shutdown: CancellationToken,
) {
    loop {
        let d = tokio::select! {
            d = deadline_rx.recv() => match d {
                Some(d) => d,
                None => return,
            },
            _ = shutdown.cancelled() => return,
        };
        let TsoDeadline {
            deadline,
            done,
            cancel,
        } = d;
        tokio::select! {
            _ = sleep_until(deadline) => {
                error!("tso batch is canceled due to timeout");
                cancel.cancel();
            }
            _ = done => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

struct TsoStream {
    sender: ClientDuplexSender<TsoRequest>,
    receiver: ClientDuplexReceiver<TsoResponse>,
    cancel: CancellationToken,
}

fn open_tso_stream(inner: &Inner, shutdown: &CancellationToken) -> Result<TsoStream> {
    let stub = inner.leader_stub()?;
    let (sender, receiver) = stub.tso()?;
    Ok(TsoStream {
        sender,
        receiver,
        cancel: shutdown.child_token(),
    })
}

/// The sender loop: owns the `Tso` stream, batches queued requests into
/// single frames and distributes the results. Any stream failure tears the
/// stream down, schedules a leader re-check and starts over.
pub(crate) async fn tso_loop(
    inner: Arc<Inner>,
    cluster_id: u64,
    mut request_rx: mpsc::Receiver<Box<TimestampRequest>>,
    deadline_tx: mpsc::Sender<TsoDeadline>,
    free_list: RequestPool,
    shutdown: CancellationToken,
) {
    let mut stream: Option<TsoStream> = None;
    loop {
        if stream.is_none() {
            match open_tso_stream(&inner, &shutdown) {
                Ok(s) => stream = Some(s),
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    error!("failed to create tso stream"; "err" => %e);
                    inner.schedule_check_leader();
                    revoke_requests(&mut request_rx, &free_list, || {
                        Error::TsoStream(format!("create tso stream: {}", e))
                    });
                    tokio::select! {
                        _ = sleep(TSO_STREAM_RETRY_INTERVAL) => {}
                        _ = shutdown.cancelled() => break,
                    }
                    continue;
                }
            }
        }
        let s = match stream.as_mut() {
            Some(s) => s,
            None => continue,
        };

        let first = tokio::select! {
            req = request_rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        let mut requests = vec![first];
        // Take exactly the requests that are already queued at this instant.
        let pending = request_rx.len();
        for _ in 0..pending {
            match request_rx.try_recv() {
                Ok(req) => requests.push(req),
                Err(_) => break,
            }
        }
        PD_PENDING_TSO_REQUEST_GAUGE.set(request_rx.len() as i64);

        let (done_tx, done_rx) = oneshot::channel();
        let dl = TsoDeadline {
            deadline: TokioInstant::now() + REQUEST_TIMEOUT,
            done: done_rx,
            cancel: s.cancel.clone(),
        };
        tokio::select! {
            res = deadline_tx.send(dl) => {
                if res.is_err() {
                    fail_batch(&mut requests, &free_list, || Error::Closing);
                    break;
                }
            }
            _ = shutdown.cancelled() => {
                fail_batch(&mut requests, &free_list, || Error::Closing);
                break;
            }
        }

        let res = process_batch(s, cluster_id, &mut requests, &free_list).await;
        drop(done_tx);
        if let Err(e) = res {
            if shutdown.is_cancelled() {
                break;
            }
            error!("tso batch failed"; "err" => %e);
            inner.schedule_check_leader();
            if let Some(mut s) = stream.take() {
                s.cancel.cancel();
                s.sender.cancel();
            }
        }
    }

    // Shutdown: tear down the stream and fail whatever is still queued.
    if let Some(mut s) = stream.take() {
        s.cancel.cancel();
        s.sender.cancel();
    }
    request_rx.close();
    while let Ok(req) = request_rx.try_recv() {
        req.finish(Err(Error::Closing), &free_list);
    }
    PD_PENDING_TSO_REQUEST_GAUGE.set(0);
}

async fn process_batch(
    stream: &mut TsoStream,
    cluster_id: u64,
    requests: &mut Vec<Box<TimestampRequest>>,
    free_list: &RequestPool,
) -> Result<()> {
    let start = Instant::now();
    let count = requests.len() as u32;
    let mut req = TsoRequest::default();
    req.mut_header().set_cluster_id(cluster_id);
    req.set_count(count);

    tokio::select! {
        res = stream.sender.send((req, WriteFlags::default().buffer_hint(false))) => {
            if let Err(e) = res {
                fail_batch(requests, free_list, || Error::TsoStream(format!("send: {}", e)));
                return Err(Error::Grpc(e));
            }
        }
        _ = stream.cancel.cancelled() => {
            fail_batch(requests, free_list, || Error::TsoStream("stream is canceled".to_owned()));
            return Err(box_err!("tso stream is canceled"));
        }
    }

    let resp = tokio::select! {
        resp = stream.receiver.next() => match resp {
            Some(Ok(resp)) => resp,
            Some(Err(e)) => {
                fail_batch(requests, free_list, || Error::TsoStream(format!("recv: {}", e)));
                return Err(Error::Grpc(e));
            }
            None => {
                fail_batch(requests, free_list, || {
                    Error::TsoStream("stream closed by the server".to_owned())
                });
                return Err(box_err!("tso stream closed by the server"));
            }
        },
        _ = stream.cancel.cancelled() => {
            fail_batch(requests, free_list, || Error::TsoStream("stream is canceled".to_owned()));
            return Err(box_err!("tso stream is canceled"));
        }
    };
    PD_REQUEST_HISTOGRAM_VEC
        .with_label_values(&["tso"])
        .observe(start.elapsed().as_secs_f64());

    if resp.get_count() != count {
        fail_batch(requests, free_list, || Error::TsoBatchLength {
            expect: count,
            got: resp.get_count(),
        });
        return Err(Error::TsoBatchLength {
            expect: count,
            got: resp.get_count(),
        });
    }
    allocate_timestamps(&resp, requests, free_list)
}

/// The server responds with the highest timestamp of the batch; the i-th
/// request gets `logical - count + 1 + i` in submission order.
fn allocate_timestamps(
    resp: &TsoResponse,
    requests: &mut Vec<Box<TimestampRequest>>,
    free_list: &RequestPool,
) -> Result<()> {
    if !resp.has_timestamp() {
        fail_batch(requests, free_list, || {
            Error::TsoStream("no timestamp in the response".to_owned())
        });
        return Err(box_err!("no timestamp in the tso response"));
    }
    let ts = resp.get_timestamp();
    let first_logical = ts.get_logical() - resp.get_count() as i64 + 1;
    for (i, req) in requests.drain(..).enumerate() {
        let mut allocated = Timestamp::default();
        allocated.set_physical(ts.get_physical());
        allocated.set_logical(first_logical + i as i64);
        req.finish(Ok(allocated), free_list);
    }
    Ok(())
}

fn fail_batch(
    requests: &mut Vec<Box<TimestampRequest>>,
    free_list: &RequestPool,
    err: impl Fn() -> Error,
) {
    for req in requests.drain(..) {
        req.finish(Err(err()), free_list);
    }
}

/// Abandons everything currently sitting in the submission queue, signaling
/// each request with the given failure. Drains exactly the queue length
/// observed on entry.
fn revoke_requests(
    request_rx: &mut mpsc::Receiver<Box<TimestampRequest>>,
    free_list: &RequestPool,
    err: impl Fn() -> Error,
) {
    let pending = request_rx.len();
    for _ in 0..pending {
        match request_rx.try_recv() {
            Ok(req) => req.finish(Err(err()), free_list),
            Err(_) => break,
        }
    }
    PD_PENDING_TSO_REQUEST_GAUGE.set(request_rx.len() as i64);
}
