// Copyright 2017 TiKV Project Authors. Licensed under Apache-2.0.

//! A mock PD server for integration tests, with pluggable behaviors.

#[macro_use]
extern crate slog_global;

pub mod mocker;
mod server;

pub use crate::mocker::{FlakyTso, LeaderChange, PdMocker, Service, TsoHang, DEFAULT_CLUSTER_ID};
pub use crate::server::Server;
