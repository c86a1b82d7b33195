//! Client registry: identity, per-IP accounting and sticky sessions.
//!
//! The registry is the single shared structure of the hub. It maps client
//! ids to live handles, counts connections per peer IP for admission, and
//! remembers released ids for a grace period so a returning client that
//! presents its session cookie gets the same identity back.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::connection::ClientHandle;

/// Live clients plus the released-id table backing sticky identity.
#[derive(Default)]
pub(crate) struct Registry {
    clients: HashMap<String, ClientHandle>,
    /// Released ids and the instant their session claim expires.
    sessions: HashMap<String, Instant>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, id: &str) -> Option<&ClientHandle> {
        self.clients.get(id)
    }

    /// Registers a live client. The id was allocated by [`Registry::allocate_id`]
    /// under the same lock, so it cannot collide.
    pub(crate) fn insert(&mut self, handle: ClientHandle) {
        self.clients.insert(handle.id.clone(), handle);
    }

    /// Removes a live client, recording its id for sticky reuse when
    /// sessions are enabled. Idempotent: removing an unknown id is a no-op.
    pub(crate) fn remove(&mut self, id: &str, session_expires: Duration) -> Option<ClientHandle> {
        let handle = self.clients.remove(id)?;
        if !session_expires.is_zero() {
            self.sessions
                .insert(id.to_owned(), Instant::now() + session_expires);
        }
        Some(handle)
    }

    /// Number of live clients whose transport peer has the given IP.
    ///
    /// A linear scan; bounded in practice by `limit_by_ip` times the number
    /// of distinct peer addresses.
    pub(crate) fn count_by_ip(&self, ip: IpAddr) -> usize {
        self.clients
            .values()
            .filter(|handle| handle.addr.ip() == ip)
            .count()
    }

    /// Snapshot of all live handles, for the periodic ping dispatcher.
    pub(crate) fn handles(&self) -> Vec<ClientHandle> {
        self.clients.values().cloned().collect()
    }

    /// Picks the id for a new connection.
    ///
    /// A cookie id is reused when it names a released session that has not
    /// expired and is not currently bound to a live connection. Otherwise a
    /// fresh random id is generated, retrying on the (unlikely) collision.
    pub(crate) fn allocate_id(
        &mut self,
        cookie: Option<&str>,
        session_expires: Duration,
    ) -> String {
        let now = Instant::now();
        self.sessions.retain(|_, expires| *expires > now);

        if !session_expires.is_zero() {
            if let Some(prior) = cookie {
                if !self.clients.contains_key(prior) && self.sessions.remove(prior).is_some() {
                    return prior.to_owned();
                }
            }
        }

        loop {
            let id = format!("{:016x}", rand::random::<u64>());
            if !self.clients.contains_key(&id) && !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }
}
