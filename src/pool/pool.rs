//! Keyed connection pool that drops cached connections when their
//! configuration changes.

use crate::core::ConfigStore;
use crate::error::{ConnectionError, redact};
use crate::notify::ChangeSubscription;
use crate::pool::Connector;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

/// The cached derivation of a resource's connection string.
struct ConnectionLink<O> {
    dsn: String,
    options: Arc<O>,
    generation: u64,
    /// The task that drops this link on the next change of its document.
    watch: AbortHandle,
}

struct PoolState<T, O> {
    /// resource key -> link
    links: HashMap<String, ConnectionLink<O>>,
    /// DSN -> live connection
    connections: HashMap<String, Arc<T>>,
    /// DSN -> gate letting one task at a time dial it
    dialing: HashMap<String, Arc<Mutex<()>>>,
}

impl<T, O> PoolState<T, O> {
    /// Drop the link of `resource` and stop its invalidation task. The
    /// connection goes too, unless another resource still resolves to the
    /// same DSN.
    fn unlink(&mut self, resource: &str) -> bool {
        let Some(link) = self.links.remove(resource) else {
            return false;
        };
        link.watch.abort();
        if !self.links.values().any(|other| other.dsn == link.dsn) {
            self.connections.remove(&link.dsn);
            self.dialing.remove(&link.dsn);
        }
        true
    }

    fn is_linked(&self, dsn: &str) -> bool {
        self.links.values().any(|link| link.dsn == dsn)
    }
}

struct PoolInner<C: Connector> {
    connector: C,
    store: ConfigStore,
    state: Mutex<PoolState<C::Connection, C::Options>>,
    next_generation: AtomicU64,
}

/// A pool of shared connections keyed by connection string.
///
/// Resources are named after their configuration document: acquiring `"db"`
/// reads the document `db` from the [`ConfigStore`], derives a DSN through the
/// [`Connector`] and caches it. Every caller asking for the same DSN shares one
/// connection.
///
/// The pool lock only guards bookkeeping and is never held across a dial.
/// Dials are single-flight per DSN: concurrent `acquire` calls for the same
/// DSN wait for the one dialing task, while cache hits on other DSNs return
/// immediately.
///
/// When the document's file changes, the cached DSN and its connection are
/// dropped; the next `acquire` re-reads the configuration and dials again.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a pool resolving resources against `store`.
    pub fn new(connector: C, store: ConfigStore) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                store,
                state: Mutex::new(PoolState {
                    links: HashMap::new(),
                    connections: HashMap::new(),
                    dialing: HashMap::new(),
                }),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// The connector used to dial.
    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// The store resources are resolved against.
    pub fn store(&self) -> &ConfigStore {
        &self.inner.store
    }

    /// Get the live connection for `resource`, dialing if needed.
    ///
    /// A connection dialed for a configuration that changed during the dial is
    /// handed to the caller but not cached.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::UnknownResource`] if no document named `resource` is loaded
    /// - [`ConnectionError::Config`] if the document does not describe a target
    /// - [`ConnectionError::Dial`] / [`ConnectionError::Timeout`] if the dial fails;
    ///   nothing is retried
    pub async fn acquire(&self, resource: &str) -> Result<Arc<C::Connection>, ConnectionError> {
        let (dsn, options, gate) = {
            let mut state = self.inner.state.lock().await;
            let link = match state.links.entry(resource.to_string()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(self.link(resource)?),
            };
            let dsn = link.dsn.clone();
            let options = Arc::clone(&link.options);

            if let Some(connection) = self.live(&mut state, resource, &dsn) {
                return Ok(connection);
            }
            let gate = Arc::clone(state.dialing.entry(dsn.clone()).or_default());
            (dsn, options, gate)
        };

        let _turn = gate.lock().await;
        {
            // The task that held the gate before us may have dialed already.
            let mut state = self.inner.state.lock().await;
            if let Some(connection) = self.live(&mut state, resource, &dsn) {
                return Ok(connection);
            }
        }

        let connection = Arc::new(self.dial(resource, &dsn, &options).await?);

        let mut state = self.inner.state.lock().await;
        if let Some(existing) = self.live(&mut state, resource, &dsn) {
            return Ok(existing);
        }
        if state.is_linked(&dsn) {
            state.connections.insert(dsn, Arc::clone(&connection));
        }
        Ok(connection)
    }

    /// Drop the cached DSN and connection of `resource`.
    ///
    /// Returns `false` if nothing was cached.
    pub async fn invalidate(&self, resource: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        state.unlink(resource)
    }

    /// Whether `resource` currently has a cached DSN.
    pub async fn contains(&self, resource: &str) -> bool {
        self.inner.state.lock().await.links.contains_key(resource)
    }

    /// The cached DSN of `resource`.
    pub async fn dsn(&self, resource: &str) -> Option<String> {
        let state = self.inner.state.lock().await;
        state.links.get(resource).map(|link| link.dsn.clone())
    }

    /// Number of pooled connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.state.lock().await.connections.len()
    }

    /// The cached connection of `dsn`, unless the transport closed it.
    fn live(
        &self,
        state: &mut PoolState<C::Connection, C::Options>,
        resource: &str,
        dsn: &str,
    ) -> Option<Arc<C::Connection>> {
        let connector = &self.inner.connector;
        let connection = state.connections.get(dsn)?;
        if !connector.is_closed(connection) {
            return Some(Arc::clone(connection));
        }
        tracing::info!(
            kind = connector.kind(),
            resource = %resource,
            "Pooled connection was closed by the transport, redialing"
        );
        state.connections.remove(dsn);
        None
    }

    /// Derive a new link for `resource` and arm its invalidation task.
    ///
    /// Called with the pool lock held.
    fn link(&self, resource: &str) -> Result<ConnectionLink<C::Options>, ConnectionError> {
        let store = &self.inner.store;
        let document = store
            .document(resource)
            .ok_or_else(|| ConnectionError::UnknownResource(resource.to_string()))?;

        // Subscribe before reading so a change landing in between still fires.
        let subscription = store.notifier().register(document.path()).subscribe();

        let options =
            self.inner
                .connector
                .options(&document)
                .map_err(|source| ConnectionError::Config {
                    resource: resource.to_string(),
                    source,
                })?;
        let dsn = self.inner.connector.dsn(&options);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let watch = tokio::spawn(invalidate_on_change(
            Arc::downgrade(&self.inner),
            resource.to_string(),
            generation,
            subscription,
        ))
        .abort_handle();

        tracing::debug!(
            kind = self.inner.connector.kind(),
            resource = %resource,
            dsn = %redact(&dsn),
            "Derived connection string"
        );

        Ok(ConnectionLink {
            dsn,
            options: Arc::new(options),
            generation,
            watch,
        })
    }

    async fn dial(
        &self,
        resource: &str,
        dsn: &str,
        options: &C::Options,
    ) -> Result<C::Connection, ConnectionError> {
        let connector = &self.inner.connector;
        let timeout = connector.dial_timeout(options);

        match tokio::time::timeout(timeout, connector.dial(dsn, options)).await {
            Ok(Ok(connection)) => {
                tracing::info!(
                    kind = connector.kind(),
                    resource = %resource,
                    target = %redact(dsn),
                    "Connected"
                );
                Ok(connection)
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    kind = connector.kind(),
                    resource = %resource,
                    error = %e,
                    "Connection attempt failed"
                );
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    kind = connector.kind(),
                    resource = %resource,
                    timeout = ?timeout,
                    "Connection attempt timed out"
                );
                Err(ConnectionError::Timeout {
                    kind: connector.kind(),
                    target: redact(dsn),
                    timeout,
                })
            }
        }
    }
}

/// Wait for one change of the resource's document, then drop its link.
///
/// A link replaced in the meantime (manual invalidation followed by a new
/// acquire) is left alone; unlinking aborts this task anyway.
async fn invalidate_on_change<C: Connector>(
    pool: Weak<PoolInner<C>>,
    resource: String,
    generation: u64,
    mut subscription: ChangeSubscription,
) {
    let Some(path) = subscription.recv().await else {
        return;
    };
    let Some(inner) = pool.upgrade() else {
        return;
    };

    let mut state = inner.state.lock().await;
    let current = state.links.get(&resource).map(|link| link.generation);
    if current != Some(generation) {
        return;
    }

    state.unlink(&resource);
    tracing::info!(
        kind = inner.connector.kind(),
        resource = %resource,
        path = %path.display(),
        "Configuration changed, dropped pooled connection"
    );
}
