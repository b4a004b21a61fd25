//! Client connection pooling.
//!
//! Connections idle here between exchanges, keyed by their route's address.
//! A cleanup task evicts connections that idle past the keep-alive duration
//! or exceed the idle cap, and a per-address policy can hold warm
//! connections open ahead of demand.

use std::sync::{Arc, Mutex};

use crate::client::CallInner;
use crate::connect::Address;
use crate::connection::Connection;
use crate::error::Result;
use crate::task::{TaskQueue, TaskRunner};

/// Pre-warming target for one address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddressPolicy {
    /// How many concurrent calls should be possible without waiting for a
    /// new connection. The pool opens connections until this many slots are
    /// available; excess connections idle out normally.
    pub min_concurrent_calls: usize,
}

impl AddressPolicy {
    pub fn new(min_concurrent_calls: usize) -> AddressPolicy {
        AddressPolicy {
            min_concurrent_calls,
        }
    }
}

/// Opens one connection to an address, for policy pre-warming. Installed by
/// the client, which owns route planning.
pub(crate) type WarmConnector =
    dyn Fn(&Address) -> Result<Arc<Connection>> + Send + Sync;

struct PoolState {
    connections: Vec<Arc<Connection>>,
    policies: Vec<(Address, AddressPolicy)>,
}

struct PoolInner {
    max_idle_connections: usize,
    keep_alive_ns: u64,
    state: Mutex<PoolState>,
    queue: TaskQueue,
    runner: TaskRunner,
    warm_connector: Mutex<Option<Arc<WarmConnector>>>,
}

/// The shared connection pool. Cheap to clone.
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub(crate) fn new(
        runner: TaskRunner,
        max_idle_connections: usize,
        keep_alive_ns: u64,
    ) -> ConnectionPool {
        let queue = runner.new_queue("connection pool");
        ConnectionPool {
            inner: Arc::new(PoolInner {
                max_idle_connections,
                keep_alive_ns,
                state: Mutex::new(PoolState {
                    connections: Vec::new(),
                    policies: Vec::new(),
                }),
                queue,
                runner,
                warm_connector: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn set_warm_connector(&self, connector: Arc<WarmConnector>) {
        *self.inner.warm_connector.lock().expect("pool poisoned") = Some(connector);
    }

    /// Attaches `call` to a pooled connection serving `address`, if one
    /// exists. With `routes`, HTTP/2 connections to other hosts sharing an
    /// IP and certificate are also eligible. With `require_multiplexed`,
    /// HTTP/1.1 connections are skipped.
    pub(crate) fn call_acquire_pooled_connection(
        &self,
        address: &Address,
        call: &Arc<CallInner>,
        routes: Option<&[crate::connect::Route]>,
        require_multiplexed: bool,
    ) -> Option<Arc<Connection>> {
        let state = self.inner.state.lock().expect("pool poisoned");
        for connection in &state.connections {
            if require_multiplexed && !connection.is_multiplexed() {
                continue;
            }
            if !connection.is_eligible(address, routes) {
                continue;
            }
            if !connection.is_healthy() {
                connection.set_no_new_exchanges();
                continue;
            }
            connection.add_call(call);
            tracing::trace!("reuse connection {} for {}", connection.id(), address.url().redact());
            return Some(connection.clone());
        }
        None
    }

    pub(crate) fn put(&self, connection: Arc<Connection>) {
        self.inner
            .state
            .lock()
            .expect("pool poisoned")
            .connections
            .push(connection);
        self.schedule_cleanup();
    }

    /// Declares a connection idle. Returns true when the caller must close
    /// it now instead of pooling it.
    pub(crate) fn connection_became_idle(&self, connection: &Arc<Connection>) -> bool {
        if connection.no_new_exchanges() || self.inner.max_idle_connections == 0 {
            let mut state = self.inner.state.lock().expect("pool poisoned");
            state.connections.retain(|c| !Arc::ptr_eq(c, connection));
            true
        } else {
            self.schedule_cleanup();
            false
        }
    }

    pub(crate) fn evict_all(&self) {
        let evicted: Vec<Arc<Connection>> = {
            let mut state = self.inner.state.lock().expect("pool poisoned");
            let (idle, keep): (Vec<_>, Vec<_>) = state
                .connections
                .drain(..)
                .partition(|c| c.state.lock().expect("connection poisoned").calls.is_empty());
            state.connections = keep;
            idle
        };
        for connection in &evicted {
            connection.set_no_new_exchanges();
            connection.close();
        }
    }

    /// How many connections the pool currently holds.
    pub(crate) fn connection_count(&self) -> usize {
        self.inner.state.lock().expect("pool poisoned").connections.len()
    }

    pub(crate) fn idle_connection_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("pool poisoned")
            .connections
            .iter()
            .filter(|c| c.state.lock().expect("connection poisoned").calls.is_empty())
            .count()
    }

    /// Installs a pre-warming policy and starts satisfying it.
    pub(crate) fn set_policy(&self, address: Address, policy: AddressPolicy) {
        {
            let mut state = self.inner.state.lock().expect("pool poisoned");
            state.policies.retain(|(a, _)| *a != address);
            state.policies.push((address.clone(), policy));
        }
        self.schedule_opener(address);
    }

    fn schedule_opener(&self, address: Address) {
        let weak = Arc::downgrade(&self.inner);
        let name = format!("policy {}", address.url().host());
        self.inner.queue.schedule(&name, 0, move || {
            let Some(inner) = weak.upgrade() else { return -1 };
            let pool = ConnectionPool { inner };
            match pool.satisfy_policy_once(&address) {
                // Another connection may be needed; run again immediately.
                Ok(true) => 0,
                Ok(false) => -1,
                Err(e) => {
                    tracing::debug!("policy connection to {} failed: {}", address.url().host(), e);
                    -1
                }
            }
        });
    }

    /// Opens at most one connection toward the policy target. Returns true
    /// when the policy may still be unsatisfied.
    fn satisfy_policy_once(&self, address: &Address) -> Result<bool> {
        let target = {
            let state = self.inner.state.lock().expect("pool poisoned");
            match state.policies.iter().find(|(a, _)| a == address) {
                Some((_, policy)) => policy.min_concurrent_calls,
                None => return Ok(false),
            }
        };

        let capacity: usize = {
            let state = self.inner.state.lock().expect("pool poisoned");
            state
                .connections
                .iter()
                .filter(|c| !c.no_new_exchanges() && c.route().address() == address)
                .map(|c| {
                    let used = c.state.lock().expect("connection poisoned").calls.len();
                    c.allocation_limit().saturating_sub(used)
                })
                .sum()
        };
        if capacity >= target {
            return Ok(false);
        }

        let connector = self
            .inner
            .warm_connector
            .lock()
            .expect("pool poisoned")
            .clone();
        let Some(connector) = connector else { return Ok(false) };
        tracing::debug!(
            "policy: opening connection to {} ({} of {} slots ready)",
            address.url().redact(),
            capacity,
            target
        );
        let connection = connector(address)?;
        self.put(connection);
        Ok(true)
    }

    pub(crate) fn schedule_cleanup(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.queue.schedule("cleanup", 0, move || {
            let Some(inner) = weak.upgrade() else { return -1 };
            let pool = ConnectionPool { inner };
            let now = pool.inner.runner.nano_time();
            pool.cleanup(now)
        });
    }

    /// One cleanup pass. Returns the nanoseconds until the next pass, 0 to
    /// run again immediately, or -1 when the pool is empty.
    ///
    /// Policy: close one connection idle past keep-alive; otherwise close
    /// the longest-idle connection beyond the idle cap; otherwise sleep
    /// until the earliest idle deadline.
    pub(crate) fn cleanup(&self, now_ns: u64) -> i64 {
        let keep_alive = self.inner.keep_alive_ns;
        let mut in_use_count = 0usize;
        let mut idle_count = 0usize;
        let mut longest_idle_ns = 0u64;
        let mut longest_idle: Option<Arc<Connection>> = None;

        {
            let state = self.inner.state.lock().expect("pool poisoned");
            for connection in &state.connections {
                if self.prune_leaked_calls(connection) > 0 {
                    in_use_count += 1;
                    continue;
                }
                idle_count += 1;
                let idleness = {
                    let conn_state = connection.state.lock().expect("connection poisoned");
                    now_ns.saturating_sub(conn_state.idle_at_ns)
                };
                if idleness >= longest_idle_ns {
                    longest_idle_ns = idleness;
                    longest_idle = Some(connection.clone());
                }
            }
        }

        if longest_idle_ns >= keep_alive || idle_count > self.inner.max_idle_connections {
            let connection = longest_idle.expect("idle_count > 0");
            {
                let mut state = self.inner.state.lock().expect("pool poisoned");
                state.connections.retain(|c| !Arc::ptr_eq(c, &connection));
            }
            connection.set_no_new_exchanges();
            connection.close();
            return 0;
        }

        if idle_count > 0 {
            return (keep_alive - longest_idle_ns) as i64;
        }
        if in_use_count > 0 {
            return keep_alive as i64;
        }
        -1
    }

    /// Drops weak call references whose calls were collected without
    /// releasing the connection, logging each leak.
    fn prune_leaked_calls(&self, connection: &Arc<Connection>) -> usize {
        let mut state = connection.state.lock().expect("connection poisoned");
        let before = state.calls.len();
        state.calls.retain(|weak| weak.strong_count() > 0);
        if state.calls.len() < before {
            tracing::warn!(
                "a connection to {} was leaked; did you forget to close a response body?",
                connection.route().address().url().redact()
            );
            state.no_new_exchanges = true;
        }
        state.calls.len()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::auth::NoAuthentication;
    use crate::connect::proxy::NoProxy;
    use crate::connect::{ConnectionSpec, Dns, Protocol, Proxy, Route, SystemDns};
    use crate::transport::test::pair;
    use std::net::TcpListener;

    fn test_address(host: &str) -> Address {
        let dns: Arc<dyn Dns> = Arc::new(SystemDns);
        Address::new(
            "http",
            host,
            80,
            vec![Protocol::Http11],
            vec![ConnectionSpec::cleartext()],
            dns,
            None,
            Arc::new(NoProxy),
            Arc::new(NoAuthentication),
            None,
        )
    }

    fn test_connection(address: Address, idle_at_ns: u64) -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let raw = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (client, _server) = pair();
        // The server half leaks intentionally: these connections only need
        // to exist, not carry traffic.
        std::mem::forget(_server);
        let route = Route::new(
            Arc::new(address),
            Proxy::Direct,
            "127.0.0.1:80".parse().unwrap(),
        );
        Connection::new(
            route,
            raw,
            Box::new(client),
            Protocol::Http11,
            None,
            None,
            idle_at_ns,
        )
    }

    #[test]
    fn cleanup_closes_exactly_at_keep_alive_boundary() {
        let runner = TaskRunner::for_test();
        let pool = ConnectionPool::new(runner, 5, 100);
        let connection = test_connection(test_address("a.example"), 50);
        pool.inner
            .state
            .lock()
            .unwrap()
            .connections
            .push(connection.clone());

        // One nanosecond before the boundary: keep it, wake at the boundary.
        assert_eq!(pool.cleanup(149), 1);
        assert_eq!(pool.connection_count(), 1);

        // At the boundary: close it now.
        assert_eq!(pool.cleanup(150), 0);
        assert_eq!(pool.connection_count(), 0);
        assert!(connection.no_new_exchanges());
    }

    #[test]
    fn cleanup_enforces_max_idle() {
        let runner = TaskRunner::for_test();
        let pool = ConnectionPool::new(runner, 1, 1_000_000);
        let first = test_connection(test_address("a.example"), 10);
        let second = test_connection(test_address("b.example"), 20);
        {
            let mut state = pool.inner.state.lock().unwrap();
            state.connections.push(first.clone());
            state.connections.push(second);
        }

        // Two idle, cap is one: the longest-idle connection goes.
        assert_eq!(pool.cleanup(30), 0);
        assert_eq!(pool.connection_count(), 1);
        assert!(first.no_new_exchanges());
    }

    #[test]
    fn empty_pool_has_no_deadline() {
        let runner = TaskRunner::for_test();
        let pool = ConnectionPool::new(runner, 5, 100);
        assert_eq!(pool.cleanup(0), -1);
    }

    #[test]
    fn acquire_skips_no_new_exchanges() {
        let runner = TaskRunner::for_test();
        let pool = ConnectionPool::new(runner, 5, 100);
        let address = test_address("a.example");
        let connection = test_connection(address.clone(), 0);
        connection.set_no_new_exchanges();
        pool.put(connection);

        let call = crate::client::CallInner::test_stub();
        assert!(pool
            .call_acquire_pooled_connection(&address, &call, None, false)
            .is_none());
    }

    #[test]
    fn acquire_matches_address() {
        let runner = TaskRunner::for_test();
        let pool = ConnectionPool::new(runner, 5, 100);
        let address = test_address("a.example");
        pool.put(test_connection(address.clone(), 0));

        let call = crate::client::CallInner::test_stub();
        assert!(pool
            .call_acquire_pooled_connection(&address, &call, None, false)
            .is_some());
        assert!(pool
            .call_acquire_pooled_connection(&test_address("other.example"), &call, None, false)
            .is_none());
        // HTTP/1.1 connections don't satisfy a multiplexed-only request.
        assert!(pool
            .call_acquire_pooled_connection(&address, &call, None, true)
            .is_none());
    }

    #[test]
    fn leaked_call_marks_connection() {
        let runner = TaskRunner::for_test();
        let pool = ConnectionPool::new(runner, 5, 1_000);
        let address = test_address("a.example");
        let connection = test_connection(address, 0);
        {
            // A call that is dropped without releasing the connection.
            let call = crate::client::CallInner::test_stub();
            connection.add_call(&call);
        }
        pool.put(connection.clone());

        pool.cleanup(10);
        assert!(connection.no_new_exchanges());
    }
}
