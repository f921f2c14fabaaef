// Copyright 2016 TiKV Project Authors. Licensed under Apache-2.0.

//! A client for the Placement Driver (PD) cluster.
//!
//! The client presents a single logical endpoint over a replicated PD
//! deployment: it discovers the current leader, keeps one gRPC channel per
//! member, and routes every request to the leader. Timestamp allocation goes
//! through a batching pipeline that merges concurrent requests into single
//! frames of a long-lived `Tso` stream; see the `tso` module.

#[macro_use]
extern crate slog_global;

mod client;
mod config;
mod tso;
mod util;

pub mod errors;
pub mod metrics;

use std::ops::Deref;
use std::time::Duration;

use kvproto::metapb;

pub use self::client::RpcClient;
pub use self::config::Config;
pub use self::errors::{Error, Result};
pub use self::tso::TimestampFuture;

/// The standard timeout applied to every unary request and to a TSO batch.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

// Shorter than REQUEST_TIMEOUT so a partitioned member is skipped quickly
// while looking for the leader.
pub(crate) const UPDATE_LEADER_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) const MAX_INIT_CLUSTER_RETRIES: usize = 100;
pub(crate) const INIT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const MAX_MERGE_TSO_REQUESTS: usize = 10_000;
pub(crate) const LEADER_CHECK_PERIOD: Duration = Duration::from_secs(60);
pub(crate) const TSO_STREAM_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A region and its leader peer, if the region currently has one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegionInfo {
    pub region: metapb::Region,
    pub leader: Option<metapb::Peer>,
}

impl RegionInfo {
    pub fn new(region: metapb::Region, leader: Option<metapb::Peer>) -> RegionInfo {
        RegionInfo { region, leader }
    }
}

impl Deref for RegionInfo {
    type Target = metapb::Region;

    fn deref(&self) -> &Self::Target {
        &self.region
    }
}
