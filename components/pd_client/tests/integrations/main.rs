// Copyright 2018 TiKV Project Authors. Licensed under Apache-2.0.

mod test_rpc_client;
mod test_tso;

use std::sync::Arc;

use pd_client::{Config, RpcClient};
use security::{SecurityConfig, SecurityManager};

pub fn new_config(eps: Vec<(String, u16)>) -> Config {
    Config::new(
        eps.into_iter()
            .map(|(host, port)| format!("{}:{}", host, port))
            .collect(),
    )
}

pub fn new_client(eps: Vec<(String, u16)>) -> RpcClient {
    let cfg = new_config(eps);
    let mgr = Arc::new(SecurityManager::new(&SecurityConfig::default()).unwrap());
    RpcClient::new(&cfg, mgr).unwrap()
}
