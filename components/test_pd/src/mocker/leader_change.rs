// Copyright 2017 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use kvproto::pdpb::*;

use super::*;

/// Advertises a different member as the leader on demand. Flipping the
/// leader also makes the next unary lookup fail once, the way a retired
/// leader would reject it, so the client schedules a re-check.
#[derive(Debug, Default)]
pub struct LeaderChange {
    resps: Mutex<Vec<GetMembersResponse>>,
    leader_idx: AtomicUsize,
    fail_next_unary: AtomicBool,
}

impl LeaderChange {
    pub fn new() -> LeaderChange {
        LeaderChange::default()
    }

    pub fn set_leader(&self, idx: usize) {
        self.leader_idx.store(idx, Ordering::SeqCst);
        self.fail_next_unary.store(true, Ordering::SeqCst);
    }
}

impl PdMocker for LeaderChange {
    fn get_members(&self, _: &GetMembersRequest) -> Option<Result<GetMembersResponse>> {
        let resps = self.resps.lock().unwrap();
        if resps.is_empty() {
            return None;
        }
        let idx = self.leader_idx.load(Ordering::SeqCst) % resps.len();
        Some(Ok(resps[idx].clone()))
    }

    fn get_region(&self, _: &GetRegionRequest) -> Option<Result<GetRegionResponse>> {
        if self.fail_next_unary.swap(false, Ordering::SeqCst) {
            return Some(Err("not leader".to_owned()));
        }
        None
    }

    fn set_endpoints(&self, eps: Vec<String>) {
        let mut members = Vec::with_capacity(eps.len());
        for (i, ep) in eps.iter().enumerate() {
            let mut m = Member::default();
            m.set_name(format!("pd{}", i));
            m.set_member_id(100 + i as u64);
            m.set_client_urls(vec![ep.to_owned()].into());
            m.set_peer_urls(vec![ep.to_owned()].into());
            members.push(m);
        }

        let mut header = ResponseHeader::default();
        header.set_cluster_id(DEFAULT_CLUSTER_ID);

        let mut resps = Vec::with_capacity(eps.len());
        for i in 0..eps.len() {
            let mut resp = GetMembersResponse::default();
            resp.set_header(header.clone());
            resp.set_leader(members[i].clone());
            resp.set_members(members.clone().into());
            resps.push(resp);
        }

        info!("[LeaderChange] set_endpoints {:?}", resps);
        *self.resps.lock().unwrap() = resps;
    }
}
