//! # Registry (C2)
//!
//! Three in-memory indexes kept consistent with each other: alias ↔
//! tunnel id, tunnel id → [`Tunnel`], and user → set of alias. Mutated
//! only by the tunnel endpoint (§4.3); read by the edge dispatcher and
//! the dashboard fan-out. Built on [`DashMap`] for lock-free concurrent
//! access, the same choice the teacher's `AppState` makes.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tunnel_protocol::ServerToAgent;

/// Channel used to push frames onto a tunnel's outbound control
/// connection. The tunnel reader task owns the receiving half and
/// serializes sends so messages never interleave on the wire (§4.4
/// "Concurrency").
pub type TunnelTx = mpsc::UnboundedSender<ServerToAgent>;

/// A single in-flight public request waiting on its agent's response.
pub struct PendingRequest {
    pub responder: oneshot::Sender<tunnel_protocol::ResponseFrame>,
}

/// One connected agent's live state. Ephemeral — created on connect,
/// removed on disconnect (spec §3 "Tunnel").
pub struct Tunnel {
    pub tunnel_id: String,
    pub alias: String,
    pub user_token: String,
    pub port: u16,
    pub tx: TunnelTx,
    pub pending: DashMap<String, PendingRequest>,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl Tunnel {
    pub fn record_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }
}

/// The three indexes spec §4.2 names, plus the helpers that keep them
/// atomic with respect to any reader resolving a public request.
#[derive(Default)]
pub struct Registry {
    alias_to_tunnel: DashMap<String, String>,
    tunnels: DashMap<String, Arc<Tunnel>>,
    user_aliases: DashMap<String, HashSet<String>>,
}

#[derive(Debug, thiserror::Error)]
#[error("alias {0} is already registered")]
pub struct AliasCollision(pub String);

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `alias` currently resolves to a live tunnel. Used by the
    /// allocator's collision check alongside the store's historical
    /// `alias_taken`.
    pub fn alias_live(&self, alias: &str) -> bool {
        self.alias_to_tunnel.contains_key(alias)
    }

    /// Inserts a newly registered tunnel. Fails if the alias collides
    /// with one already live — this should never happen if the caller
    /// consulted [`Registry::alias_live`] first, but the check stays
    /// authoritative here too since insertion is the only writer.
    pub fn insert(&self, tunnel: Arc<Tunnel>) -> Result<(), AliasCollision> {
        if self.alias_to_tunnel.contains_key(&tunnel.alias) {
            return Err(AliasCollision(tunnel.alias.clone()));
        }
        self.alias_to_tunnel
            .insert(tunnel.alias.clone(), tunnel.tunnel_id.clone());
        self.user_aliases
            .entry(tunnel.user_token.clone())
            .or_default()
            .insert(tunnel.alias.clone());
        self.tunnels.insert(tunnel.tunnel_id.clone(), tunnel);
        Ok(())
    }

    pub fn lookup_by_alias(&self, alias: &str) -> Option<Arc<Tunnel>> {
        let tunnel_id = self.alias_to_tunnel.get(alias)?.clone();
        self.tunnels.get(&tunnel_id).map(|t| t.clone())
    }

    pub fn lookup_by_id(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(tunnel_id).map(|t| t.clone())
    }

    /// Removes a tunnel from all three indexes and prunes the user
    /// entry if its alias set becomes empty. Persisted alias rows in
    /// storage are untouched — they survive disconnect by design
    /// (spec §3 invariant 3).
    pub fn remove(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        let (_, tunnel) = self.tunnels.remove(tunnel_id)?;
        self.alias_to_tunnel.remove(&tunnel.alias);
        if let Some(mut aliases) = self.user_aliases.get_mut(&tunnel.user_token) {
            aliases.remove(&tunnel.alias);
            if aliases.is_empty() {
                drop(aliases);
                self.user_aliases.remove(&tunnel.user_token);
            }
        }
        Some(tunnel)
    }

    /// Formats the live public URL set grouped by owning user, for the
    /// dashboard fan-out (§4.6). Only aliases with a currently live
    /// tunnel are included — an alias whose tunnel just disconnected
    /// drops out on the next broadcast tick.
    pub fn snapshot_live_urls(&self, base_domain: &str) -> std::collections::HashMap<String, Vec<String>> {
        let mut out = std::collections::HashMap::new();
        for entry in self.user_aliases.iter() {
            let user = entry.key().clone();
            let urls: Vec<String> = entry
                .value()
                .iter()
                .filter(|alias| self.alias_live(alias))
                .map(|alias| format!("https://{alias}.{base_domain}/"))
                .collect();
            if !urls.is_empty() {
                out.insert(user, urls);
            }
        }
        out
    }
}
