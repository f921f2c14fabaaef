// Copyright 2017 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam::queue::ArrayQueue;
use futures::executor::block_on;
use grpcio::{CallOption, ClientUnaryReceiver, EnvBuilder};
use kvproto::metapb;
use kvproto::pdpb::{self, PdClient as PdClientStub};
use security::SecurityManager;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics::*;
use crate::tso::{tso_deadline_loop, tso_loop, TimestampFuture, TimestampOracle};
use crate::util::{addrs_to_urls, leader_loop, Inner};
use crate::{
    Config, Error, RegionInfo, Result, MAX_MERGE_TSO_REQUESTS, REQUEST_TIMEOUT,
};

const CQ_COUNT: usize = 1;
const CLIENT_PREFIX: &str = "pd";

/// The PD client: tracks the leader of the PD cluster and routes every
/// request to it. Cloning channels is cheap; the client itself is meant to
/// be shared behind an `Arc` by many concurrent callers.
pub struct RpcClient {
    cluster_id: u64,
    inner: Arc<Inner>,
    tso: TimestampOracle,
    shutdown: CancellationToken,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RpcClient {
    /// Bootstraps a client against the given endpoints: loads the cluster
    /// id, finds the leader, and starts the background loops. Both
    /// bootstrap steps go through the configured retry policy.
    pub fn new(cfg: &Config, security_mgr: Arc<SecurityManager>) -> Result<RpcClient> {
        cfg.validate()?;
        let env = Arc::new(
            EnvBuilder::new()
                .cq_count(CQ_COUNT)
                .name_prefix(CLIENT_PREFIX)
                .build(),
        );
        let shutdown = CancellationToken::new();
        let (check_leader_tx, check_leader_rx) = mpsc::channel(1);
        let inner = Arc::new(Inner::new(
            env,
            security_mgr,
            addrs_to_urls(&cfg.endpoints),
            check_leader_tx,
            shutdown.clone(),
        ));

        let cluster_id = init_retry(cfg, &shutdown, "cluster id", || {
            block_on(inner.load_cluster_id())
        })?;
        init_retry(cfg, &shutdown, "leader", || block_on(inner.update_leader()))?;
        info!("PD client is initialized"; "cluster_id" => cluster_id, "leader" => inner.leader_url());

        let (request_tx, request_rx) = mpsc::channel(MAX_MERGE_TSO_REQUESTS);
        let (deadline_tx, deadline_rx) = mpsc::channel(1);
        let free_list = Arc::new(ArrayQueue::new(MAX_MERGE_TSO_REQUESTS));
        let tso = TimestampOracle::new(request_tx, Arc::clone(&free_list));

        // One background thread drives all three loops cooperatively, the
        // way the TSO worker alone used to run.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let worker = thread::Builder::new().name("pd-client".into()).spawn({
            let inner = Arc::clone(&inner);
            let shutdown = shutdown.clone();
            move || {
                runtime.block_on(async move {
                    tokio::join!(
                        leader_loop(Arc::clone(&inner), check_leader_rx, shutdown.clone()),
                        tso_loop(
                            Arc::clone(&inner),
                            cluster_id,
                            request_rx,
                            deadline_tx,
                            free_list,
                            shutdown.clone(),
                        ),
                        tso_deadline_loop(deadline_rx, shutdown),
                    );
                });
            }
        })?;

        Ok(RpcClient {
            cluster_id,
            inner,
            tso,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Returns the cluster id observed at bootstrap.
    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    /// The current leader url. Empty when no leader is known.
    pub fn leader_url(&self) -> String {
        self.inner.leader_url()
    }

    /// The current endpoint set.
    pub fn urls(&self) -> Vec<String> {
        self.inner.urls()
    }

    /// Asks the leader loop to re-check the leader.
    pub fn schedule_check_leader(&self) {
        self.inner.schedule_check_leader();
    }

    /// Gets a timestamp, blocking until it is allocated.
    pub fn get_ts(&self, ctx: &CancellationToken) -> Result<pdpb::Timestamp> {
        block_on(self.get_ts_async(ctx).wait())
    }

    /// Submits a timestamp request and returns a future for it.
    pub fn get_ts_async(&self, ctx: &CancellationToken) -> TimestampFuture {
        self.tso.get_timestamp(ctx)
    }

    /// Gets the region containing `key` and its leader peer.
    pub async fn get_region(&self, key: &[u8]) -> Result<Option<RegionInfo>> {
        let mut req = pdpb::GetRegionRequest::default();
        req.set_header(self.header());
        req.set_region_key(key.to_vec());

        let resp = self
            .unary("get_region", |stub, opt| stub.get_region_async_opt(&req, opt))
            .await?;
        Ok(region_info_from(resp))
    }

    /// Gets the region right before the one containing `key`.
    pub async fn get_prev_region(&self, key: &[u8]) -> Result<Option<RegionInfo>> {
        let mut req = pdpb::GetRegionRequest::default();
        req.set_header(self.header());
        req.set_region_key(key.to_vec());

        let resp = self
            .unary("get_prev_region", |stub, opt| {
                stub.get_prev_region_async_opt(&req, opt)
            })
            .await?;
        Ok(region_info_from(resp))
    }

    pub async fn get_region_by_id(&self, region_id: u64) -> Result<Option<RegionInfo>> {
        let mut req = pdpb::GetRegionByIdRequest::default();
        req.set_header(self.header());
        req.set_region_id(region_id);

        let resp = self
            .unary("get_region_by_id", |stub, opt| {
                stub.get_region_by_id_async_opt(&req, opt)
            })
            .await?;
        Ok(region_info_from(resp))
    }

    /// Scans up to `limit` regions starting from the one containing `key`.
    /// A region without a leader gets a placeholder peer with id 0 in the
    /// leader list.
    pub async fn scan_regions(
        &self,
        start_key: &[u8],
        limit: i32,
    ) -> Result<(Vec<metapb::Region>, Vec<metapb::Peer>)> {
        let mut req = pdpb::ScanRegionsRequest::default();
        req.set_header(self.header());
        req.set_start_key(start_key.to_vec());
        req.set_limit(limit);

        let mut resp = self
            .unary("scan_regions", |stub, opt| {
                stub.scan_regions_async_opt(&req, opt)
            })
            .await?;
        Ok((resp.take_region_metas().into(), resp.take_leaders().into()))
    }

    /// Gets a store by id. Returns `None` when the store is a tombstone.
    pub async fn get_store(&self, store_id: u64) -> Result<Option<metapb::Store>> {
        let mut req = pdpb::GetStoreRequest::default();
        req.set_header(self.header());
        req.set_store_id(store_id);

        let mut resp = self
            .unary("get_store", |stub, opt| stub.get_store_async_opt(&req, opt))
            .await?;
        if !resp.has_store() {
            return Err(Error::StoreNotFound(store_id));
        }
        let store = resp.take_store();
        if store.get_state() == metapb::StoreState::Tombstone {
            return Ok(None);
        }
        Ok(Some(store))
    }

    pub async fn get_all_stores(&self, exclude_tombstone: bool) -> Result<Vec<metapb::Store>> {
        let mut req = pdpb::GetAllStoresRequest::default();
        req.set_header(self.header());
        req.set_exclude_tombstone_stores(exclude_tombstone);

        let mut resp = self
            .unary("get_all_stores", |stub, opt| {
                stub.get_all_stores_async_opt(&req, opt)
            })
            .await?;
        Ok(resp.take_stores().into())
    }

    /// Advances the GC safe point. The server keeps the maximum it has seen,
    /// so a smaller value leaves the safe point unchanged; the returned
    /// value is the one now in effect.
    pub async fn update_gc_safe_point(&self, safe_point: u64) -> Result<u64> {
        let mut req = pdpb::UpdateGcSafePointRequest::default();
        req.set_header(self.header());
        req.set_safe_point(safe_point);

        let resp = self
            .unary("update_gc_safe_point", |stub, opt| {
                stub.update_gc_safe_point_async_opt(&req, opt)
            })
            .await?;
        Ok(resp.get_new_safe_point())
    }

    pub async fn scatter_region(&self, region_id: u64) -> Result<()> {
        let mut req = pdpb::ScatterRegionRequest::default();
        req.set_header(self.header());
        req.set_region_id(region_id);

        let resp = self
            .unary("scatter_region", |stub, opt| {
                stub.scatter_region_async_opt(&req, opt)
            })
            .await?;
        if resp.get_header().has_error() {
            return Err(Error::PdServer(format!(
                "scatter region {} failed: {:?}",
                region_id,
                resp.get_header().get_error()
            )));
        }
        Ok(())
    }

    /// Gets the status of the operator currently driving a region.
    pub async fn get_operator(&self, region_id: u64) -> Result<pdpb::GetOperatorResponse> {
        let mut req = pdpb::GetOperatorRequest::default();
        req.set_header(self.header());
        req.set_region_id(region_id);

        self.unary("get_operator", |stub, opt| {
            stub.get_operator_async_opt(&req, opt)
        })
        .await
    }

    /// Shuts the client down: stops the loops, fails everything still queued
    /// in the TSO pipeline with a closing error and closes every channel.
    /// Idempotent; also invoked on drop.
    pub fn close(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("failed to join the PD client worker thread");
            }
        }
        self.inner.close_conns();
    }

    fn header(&self) -> pdpb::RequestHeader {
        let mut header = pdpb::RequestHeader::default();
        header.set_cluster_id(self.cluster_id);
        header
    }

    #[inline]
    fn call_option() -> CallOption {
        CallOption::default().timeout(REQUEST_TIMEOUT)
    }

    /// Runs one unary call against the leader: applies the standard timeout,
    /// records duration metrics and schedules a leader re-check on failure.
    async fn unary<Resp, F>(&self, cmd: &str, f: F) -> Result<Resp>
    where
        F: FnOnce(&PdClientStub, CallOption) -> grpcio::Result<ClientUnaryReceiver<Resp>>,
    {
        let start = Instant::now();
        let res: Result<Resp> = async {
            let stub = self.inner.leader_stub()?;
            let resp = f(&stub, Self::call_option())?.await?;
            Ok(resp)
        }
        .await;
        match &res {
            Ok(_) => {
                PD_CMD_HISTOGRAM_VEC
                    .with_label_values(&[cmd])
                    .observe(start.elapsed().as_secs_f64());
            }
            Err(e) => {
                PD_CMD_FAILED_HISTOGRAM_VEC
                    .with_label_values(&[cmd])
                    .observe(start.elapsed().as_secs_f64());
                warn!("PD request failed"; "type" => cmd, "err" => %e);
                self.inner.schedule_check_leader();
            }
        }
        res
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn region_info_from(mut resp: pdpb::GetRegionResponse) -> Option<RegionInfo> {
    if !resp.has_region() {
        return None;
    }
    let leader = if resp.has_leader() {
        Some(resp.take_leader())
    } else {
        None
    };
    Some(RegionInfo::new(resp.take_region(), leader))
}

/// Runs `f` under the bootstrap retry policy: up to `retry_max_count`
/// attempts, `retry_interval` apart, stopping early on shutdown.
fn init_retry<T>(
    cfg: &Config,
    shutdown: &CancellationToken,
    what: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = match cfg.retry_max_count {
        -1 => isize::MAX,
        v => v.max(1),
    };
    let mut last = None;
    for i in 0..attempts {
        if shutdown.is_cancelled() {
            break;
        }
        match f() {
            Ok(t) => return Ok(t),
            Err(e) => {
                if i as usize % cfg.retry_log_every == 0 {
                    warn!("PD client bootstrap failed, will retry"; "what" => what, "err" => %e);
                }
                last = Some(e);
                thread::sleep(cfg.retry_interval);
            }
        }
    }
    Err(last.unwrap_or(Error::Closing))
}
