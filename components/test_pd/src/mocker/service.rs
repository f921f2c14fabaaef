// Copyright 2017 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use kvproto::metapb;
use kvproto::pdpb::*;

use super::*;

/// The default handler: a single in-memory "cluster" with a members list,
/// a counting TSO allocator, region and store tables, and a monotonic GC
/// safe point.
#[derive(Debug)]
pub struct Service {
    members_resp: Mutex<Option<GetMembersResponse>>,
    tso_physical: AtomicI64,
    tso_logical: AtomicI64,
    last_cluster_id: AtomicU64,
    regions: Mutex<BTreeMap<Vec<u8>, (metapb::Region, metapb::Peer)>>,
    stores: Mutex<HashMap<u64, metapb::Store>>,
    gc_safe_point: AtomicU64,
    scattered: Mutex<HashSet<u64>>,
}

impl Service {
    pub fn new() -> Service {
        Service {
            members_resp: Mutex::new(None),
            tso_physical: AtomicI64::new(42),
            tso_logical: AtomicI64::new(0),
            last_cluster_id: AtomicU64::new(0),
            regions: Mutex::new(BTreeMap::new()),
            stores: Mutex::new(HashMap::new()),
            gc_safe_point: AtomicU64::new(0),
            scattered: Mutex::new(HashSet::new()),
        }
    }

    pub fn header() -> ResponseHeader {
        let mut header = ResponseHeader::default();
        header.set_cluster_id(DEFAULT_CLUSTER_ID);
        header
    }

    /// Resets the TSO allocator: the next timestamps are handed out from
    /// `(physical, logical + 1)` on.
    pub fn set_tso(&self, physical: i64, logical: i64) {
        self.tso_physical.store(physical, Ordering::SeqCst);
        self.tso_logical.store(logical, Ordering::SeqCst);
    }

    /// Registers a region; a `None` leader is reported as a peer with id 0.
    pub fn add_region(&self, region: metapb::Region, leader: Option<metapb::Peer>) {
        let leader = leader.unwrap_or_default();
        self.regions
            .lock()
            .unwrap()
            .insert(region.get_start_key().to_vec(), (region, leader));
    }

    pub fn add_store(&self, store: metapb::Store) {
        self.stores.lock().unwrap().insert(store.get_id(), store);
    }

    /// The cluster id stamped on the most recent request header seen.
    pub fn last_cluster_id(&self) -> u64 {
        self.last_cluster_id.load(Ordering::SeqCst)
    }

    fn find_region(&self, key: &[u8]) -> Option<(metapb::Region, metapb::Peer)> {
        let regions = self.regions.lock().unwrap();
        regions
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .filter(|(_, (r, _))| r.get_end_key().is_empty() || key < r.get_end_key())
            .map(|(_, entry)| entry.clone())
    }

    fn region_resp(entry: Option<(metapb::Region, metapb::Peer)>) -> GetRegionResponse {
        let mut resp = GetRegionResponse::default();
        resp.set_header(Self::header());
        if let Some((region, leader)) = entry {
            resp.set_region(region);
            if leader.get_id() != 0 {
                resp.set_leader(leader);
            }
        }
        resp
    }
}

impl Default for Service {
    fn default() -> Service {
        Service::new()
    }
}

pub fn make_members_response(eps: Vec<String>) -> GetMembersResponse {
    let mut members = Vec::with_capacity(eps.len());
    for (i, ep) in eps.iter().enumerate() {
        let mut m = Member::default();
        m.set_name(format!("pd{}", i));
        m.set_member_id(100 + i as u64);
        m.set_client_urls(vec![ep.to_owned()].into());
        m.set_peer_urls(vec![ep.to_owned()].into());
        members.push(m);
    }

    let mut resp = GetMembersResponse::default();
    resp.set_header(Service::header());
    resp.set_leader(members[0].clone());
    resp.set_members(members.into());
    resp
}

impl PdMocker for Service {
    fn get_members(&self, _: &GetMembersRequest) -> Option<Result<GetMembersResponse>> {
        self.members_resp.lock().unwrap().clone().map(Ok)
    }

    fn tso(&self, req: &TsoRequest) -> Option<Result<TsoResponse>> {
        self.last_cluster_id
            .store(req.get_header().get_cluster_id(), Ordering::SeqCst);
        let count = req.get_count();
        let logical = self.tso_logical.fetch_add(count as i64, Ordering::SeqCst) + count as i64;
        let mut resp = TsoResponse::default();
        resp.set_header(Self::header());
        resp.set_count(count);
        resp.mut_timestamp()
            .set_physical(self.tso_physical.load(Ordering::SeqCst));
        resp.mut_timestamp().set_logical(logical);
        Some(Ok(resp))
    }

    fn get_region(&self, req: &GetRegionRequest) -> Option<Result<GetRegionResponse>> {
        self.last_cluster_id
            .store(req.get_header().get_cluster_id(), Ordering::SeqCst);
        Some(Ok(Self::region_resp(self.find_region(req.get_region_key()))))
    }

    fn get_prev_region(&self, req: &GetRegionRequest) -> Option<Result<GetRegionResponse>> {
        let prev = self.find_region(req.get_region_key()).and_then(|(r, _)| {
            let regions = self.regions.lock().unwrap();
            regions
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(r.get_start_key())))
                .next_back()
                .map(|(_, entry)| entry.clone())
        });
        Some(Ok(Self::region_resp(prev)))
    }

    fn get_region_by_id(&self, req: &GetRegionByIdRequest) -> Option<Result<GetRegionResponse>> {
        let found = self
            .regions
            .lock()
            .unwrap()
            .values()
            .find(|(r, _)| r.get_id() == req.get_region_id())
            .cloned();
        Some(Ok(Self::region_resp(found)))
    }

    fn scan_regions(&self, req: &ScanRegionsRequest) -> Option<Result<ScanRegionsResponse>> {
        let mut metas = Vec::new();
        let mut leaders = Vec::new();
        let regions = self.regions.lock().unwrap();
        for (region, leader) in regions.values() {
            if !region.get_end_key().is_empty() && region.get_end_key() <= req.get_start_key() {
                continue;
            }
            metas.push(region.clone());
            leaders.push(leader.clone());
            if req.get_limit() > 0 && metas.len() as i32 >= req.get_limit() {
                break;
            }
        }
        let mut resp = ScanRegionsResponse::default();
        resp.set_header(Self::header());
        resp.set_region_metas(metas.into());
        resp.set_leaders(leaders.into());
        Some(Ok(resp))
    }

    fn get_store(&self, req: &GetStoreRequest) -> Option<Result<GetStoreResponse>> {
        let mut resp = GetStoreResponse::default();
        resp.set_header(Self::header());
        if let Some(store) = self.stores.lock().unwrap().get(&req.get_store_id()) {
            resp.set_store(store.clone());
        }
        Some(Ok(resp))
    }

    fn get_all_stores(&self, req: &GetAllStoresRequest) -> Option<Result<GetAllStoresResponse>> {
        let mut stores: Vec<_> = self
            .stores
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                !req.get_exclude_tombstone_stores()
                    || s.get_state() != metapb::StoreState::Tombstone
            })
            .cloned()
            .collect();
        stores.sort_by_key(|s| s.get_id());
        let mut resp = GetAllStoresResponse::default();
        resp.set_header(Self::header());
        resp.set_stores(stores.into());
        Some(Ok(resp))
    }

    fn update_gc_safe_point(
        &self,
        req: &UpdateGcSafePointRequest,
    ) -> Option<Result<UpdateGcSafePointResponse>> {
        let prev = self
            .gc_safe_point
            .fetch_max(req.get_safe_point(), Ordering::SeqCst);
        let mut resp = UpdateGcSafePointResponse::default();
        resp.set_header(Self::header());
        resp.set_new_safe_point(prev.max(req.get_safe_point()));
        Some(Ok(resp))
    }

    fn scatter_region(&self, req: &ScatterRegionRequest) -> Option<Result<ScatterRegionResponse>> {
        let mut resp = ScatterRegionResponse::default();
        let known = self
            .regions
            .lock()
            .unwrap()
            .values()
            .any(|(r, _)| r.get_id() == req.get_region_id());
        let mut header = Self::header();
        if known {
            self.scattered.lock().unwrap().insert(req.get_region_id());
        } else {
            let mut err = Error::default();
            err.set_field_type(ErrorType::RegionNotFound);
            err.set_message(format!("region {} not found", req.get_region_id()));
            header.set_error(err);
        }
        resp.set_header(header);
        Some(Ok(resp))
    }

    fn get_operator(&self, req: &GetOperatorRequest) -> Option<Result<GetOperatorResponse>> {
        let mut resp = GetOperatorResponse::default();
        resp.set_header(Self::header());
        resp.set_region_id(req.get_region_id());
        if self
            .scattered
            .lock()
            .unwrap()
            .contains(&req.get_region_id())
        {
            resp.set_desc(b"scatter-region".to_vec());
        }
        Some(Ok(resp))
    }

    fn set_endpoints(&self, eps: Vec<String>) {
        let members_resp = make_members_response(eps);
        info!("[Service] members_resp {:?}", members_resp);
        *self.members_resp.lock().unwrap() = Some(members_resp);
    }
}
