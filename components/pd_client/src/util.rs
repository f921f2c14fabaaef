// Copyright 2017 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use grpcio::{CallOption, Channel, ChannelBuilder, Environment};
use kvproto::pdpb::{GetMembersRequest, GetMembersResponse, Member, PdClient as PdClientStub};
use security::SecurityManager;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{box_err, Error, Result, LEADER_CHECK_PERIOD, UPDATE_LEADER_TIMEOUT};

/// The connection registry plus the leader pointer.
///
/// Both live under one lock so that a reader observing a non-empty leader
/// always finds a channel for it in the registry.
#[derive(Default)]
struct ConnState {
    channels: HashMap<String, Channel>,
    leader: String,
}

pub struct Inner {
    env: Arc<Environment>,
    security_mgr: Arc<SecurityManager>,
    conns: RwLock<ConnState>,
    urls: RwLock<Vec<String>>,
    check_leader_tx: mpsc::Sender<()>,
    shutdown: CancellationToken,
}

impl Inner {
    pub fn new(
        env: Arc<Environment>,
        security_mgr: Arc<SecurityManager>,
        urls: Vec<String>,
        check_leader_tx: mpsc::Sender<()>,
        shutdown: CancellationToken,
    ) -> Inner {
        Inner {
            env,
            security_mgr,
            conns: RwLock::new(ConnState::default()),
            urls: RwLock::new(urls),
            check_leader_tx,
            shutdown,
        }
    }

    fn connect(&self, url: &str) -> Channel {
        let addr = url
            .trim_start_matches("http://")
            .trim_start_matches("https://");
        let cb = ChannelBuilder::new(Arc::clone(&self.env))
            .keepalive_time(Duration::from_secs(10))
            .keepalive_timeout(Duration::from_secs(3));
        self.security_mgr.connect(cb, addr)
    }

    /// Returns the channel for `url`, dialing one if the registry has none.
    ///
    /// Dialing happens outside the lock; when several callers race, one
    /// insertion wins and the redundant channels are dropped.
    pub fn get_or_create_conn(&self, url: &str) -> Channel {
        if let Some(c) = self.conns.read().unwrap().channels.get(url) {
            return c.clone();
        }
        let new = self.connect(url);
        let mut state = self.conns.write().unwrap();
        state
            .channels
            .entry(url.to_owned())
            .or_insert(new)
            .clone()
    }

    pub fn leader_channel(&self) -> Result<Channel> {
        let state = self.conns.read().unwrap();
        if state.leader.is_empty() {
            return Err(Error::NoLeader);
        }
        match state.channels.get(&state.leader) {
            Some(c) => Ok(c.clone()),
            None => Err(Error::NoLeader),
        }
    }

    pub fn leader_stub(&self) -> Result<PdClientStub> {
        Ok(PdClientStub::new(self.leader_channel()?))
    }

    pub fn leader_url(&self) -> String {
        self.conns.read().unwrap().leader.clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.read().unwrap().clone()
    }

    /// Asks the leader loop to re-check the leader. Signals are coalesced:
    /// when one is already pending, this one is dropped.
    pub fn schedule_check_leader(&self) {
        let _ = self.check_leader_tx.try_send(());
    }

    pub async fn get_members(&self, url: &str, timeout: Duration) -> Result<GetMembersResponse> {
        let stub = PdClientStub::new(self.get_or_create_conn(url));
        let resp = stub
            .get_members_async_opt(
                &GetMembersRequest::default(),
                CallOption::default().timeout(timeout),
            )?
            .await?;
        Ok(resp)
    }

    /// Loads the cluster id from the first endpoint that answers `GetMembers`
    /// with a header.
    pub async fn load_cluster_id(&self) -> Result<u64> {
        for url in self.urls() {
            match self.get_members(&url, crate::REQUEST_TIMEOUT).await {
                Ok(resp) if resp.has_header() => {
                    return Ok(resp.get_header().get_cluster_id());
                }
                Ok(_) => warn!("no header in members response"; "url" => %url),
                Err(e) => warn!("failed to load cluster id"; "url" => %url, "err" => %e),
            }
        }
        Err(Error::FailToInitClusterId)
    }

    /// Walks the endpoint list in order and adopts the leader advertised by
    /// the first member that answers with one.
    pub async fn update_leader(&self) -> Result<()> {
        for url in self.urls() {
            let resp = match self.get_members(&url, UPDATE_LEADER_TIMEOUT).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("cannot update leader"; "url" => %url, "err" => %e);
                    if self.shutdown.is_cancelled() {
                        return Err(e);
                    }
                    continue;
                }
            };
            if !resp.has_leader() || resp.get_leader().get_client_urls().is_empty() {
                if self.shutdown.is_cancelled() {
                    return Err(box_err!("the PD client is shutting down"));
                }
                continue;
            }
            self.update_urls(resp.get_members());
            return self.switch_leader(resp.get_leader().get_client_urls());
        }
        Err(box_err!("failed to get leader from {:?}", self.urls()))
    }

    /// Replaces the endpoint set with the sorted unique client urls of the
    /// reported members, when they differ from the current set.
    fn update_urls(&self, members: &[Member]) {
        let mut urls: Vec<String> = members
            .iter()
            .flat_map(|m| m.get_client_urls().iter().cloned())
            .collect();
        urls.sort_unstable();
        urls.dedup();

        let mut current = self.urls.write().unwrap();
        if *current == urls {
            return;
        }
        info!("update PD member urls"; "old" => ?*current, "new" => ?urls);
        *current = urls;
    }

    /// Points the client at a new leader. The channel is created before the
    /// pointer flips, so readers never observe a leader without a channel.
    pub fn switch_leader(&self, urls: &[String]) -> Result<()> {
        // The protocol does not expose multiple leader urls in a comparable
        // form; take the first.
        let addr = match urls.first() {
            Some(addr) => addr,
            None => return Err(box_err!("no client url for the new leader")),
        };
        {
            let state = self.conns.read().unwrap();
            if state.leader == *addr {
                return Ok(());
            }
        }
        info!("switch PD leader"; "new" => %addr, "old" => %self.leader_url());
        let _ = self.get_or_create_conn(addr);
        let mut state = self.conns.write().unwrap();
        state.leader = addr.clone();
        Ok(())
    }

    /// Drops every channel in the registry and forgets the leader. Only
    /// called once the loops have stopped.
    pub fn close_conns(&self) {
        let mut state = self.conns.write().unwrap();
        state.channels.clear();
        state.leader.clear();
    }
}

/// Re-checks the leader on demand, on a fixed period, or stops on shutdown.
pub(crate) async fn leader_loop(
    inner: Arc<Inner>,
    mut check_leader_rx: mpsc::Receiver<()>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            r = check_leader_rx.recv() => {
                if r.is_none() {
                    return;
                }
            }
            _ = tokio::time::sleep(LEADER_CHECK_PERIOD) => {}
            _ = shutdown.cancelled() => return,
        }
        if let Err(e) = inner.update_leader().await {
            error!("failed to update PD leader"; "err" => %e);
        }
    }
}

/// Prefixes `http://` to addresses that carry no scheme.
pub fn addrs_to_urls(addrs: &[String]) -> Vec<String> {
    addrs
        .iter()
        .map(|addr| {
            if addr.contains("://") {
                addr.clone()
            } else {
                format!("http://{}", addr)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::thread;

    use grpcio::EnvBuilder;
    use security::{SecurityConfig, SecurityManager};

    use super::*;

    fn new_inner(urls: Vec<String>) -> Inner {
        let env = Arc::new(EnvBuilder::new().build());
        let mgr = Arc::new(SecurityManager::new(&SecurityConfig::default()).unwrap());
        let (tx, _rx) = mpsc::channel(1);
        Inner::new(env, mgr, urls, tx, CancellationToken::new())
    }

    #[test]
    fn test_addrs_to_urls() {
        let addrs = vec![
            "127.0.0.1:2379".to_owned(),
            "http://127.0.0.1:2379".to_owned(),
            "https://127.0.0.1:2379".to_owned(),
        ];
        assert_eq!(
            addrs_to_urls(&addrs),
            vec![
                "http://127.0.0.1:2379".to_owned(),
                "http://127.0.0.1:2379".to_owned(),
                "https://127.0.0.1:2379".to_owned(),
            ]
        );
    }

    #[test]
    fn test_concurrent_conn_creation() {
        // Dialing is lazy in grpcio, so no endpoint needs to be listening.
        let inner = Arc::new(new_inner(vec![]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let inner = Arc::clone(&inner);
                thread::spawn(move || {
                    inner.get_or_create_conn("http://127.0.0.1:2379");
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(inner.conns.read().unwrap().channels.len(), 1);
    }

    #[test]
    fn test_leader_requires_channel() {
        let inner = new_inner(vec![]);
        assert!(matches!(inner.leader_channel(), Err(Error::NoLeader)));

        inner
            .switch_leader(&["http://127.0.0.1:2379".to_owned()])
            .unwrap();
        inner.leader_channel().unwrap();
        assert_eq!(inner.leader_url(), "http://127.0.0.1:2379");

        // Switching to the same leader is a no-op.
        inner
            .switch_leader(&["http://127.0.0.1:2379".to_owned()])
            .unwrap();
        assert_eq!(inner.conns.read().unwrap().channels.len(), 1);
    }
}
