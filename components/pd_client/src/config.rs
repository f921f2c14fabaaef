// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{box_err, Result, INIT_RETRY_INTERVAL, MAX_INIT_CLUSTER_RETRIES};

/// The configuration for a PD client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The PD endpoints for the client to connect to, with or without an
    /// explicit scheme (`http://` is assumed when absent).
    pub endpoints: Vec<String>,
    /// The interval between bootstrap retries.
    pub retry_interval: Duration,
    /// The maximum number of times the bootstrap sequence is attempted.
    /// -1 means no limit.
    pub retry_max_count: isize,
    /// Log a bootstrap failure once every this many attempts.
    pub retry_log_every: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            endpoints: Vec::new(),
            retry_interval: INIT_RETRY_INTERVAL,
            retry_max_count: MAX_INIT_CLUSTER_RETRIES as isize,
            retry_log_every: 10,
        }
    }
}

impl Config {
    pub fn new(endpoints: Vec<String>) -> Config {
        Config {
            endpoints,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(box_err!("please specify pd endpoints"));
        }
        let mut set = HashSet::with_capacity(self.endpoints.len());
        for ep in &self.endpoints {
            if !set.insert(ep) {
                return Err(box_err!("duplicate PD endpoint {}", ep));
            }
        }
        if self.retry_log_every == 0 {
            return Err(box_err!("pd.retry-log-every cannot be 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        Config::default().validate().unwrap_err();

        let cfg = Config::new(vec!["127.0.0.1:2379".to_owned()]);
        cfg.validate().unwrap();

        let cfg = Config::new(vec!["a".to_owned(), "a".to_owned()]);
        cfg.validate().unwrap_err();

        let mut cfg = Config::new(vec!["a".to_owned()]);
        cfg.retry_log_every = 0;
        cfg.validate().unwrap_err();
    }
}
