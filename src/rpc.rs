//! Typed endpoint RPC.
//!
//! Message passing between the coordinator and receiver supervisors uses named
//! endpoints: an endpoint is an async channel whose receiving half is drained
//! by exactly one controller loop, which preserves one-message-at-a-time
//! handling semantics. A request/response exchange rides a oneshot reply
//! channel embedded in the message, bounded by the caller's ask timeout.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::{mpsc, oneshot};

use crate::error::IngestError;

/// Capacity of an endpoint's inbound message channel.
const ENDPOINT_CHANNEL_CAPACITY: usize = 1000;

/// The reasons an ask may fail, before mapping into the public taxonomy.
enum AskError {
    /// The endpoint's receiving half is gone.
    Closed,
    /// The endpoint dropped the reply channel without answering.
    Dropped,
    /// No reply arrived within the deadline.
    Timeout,
}

/// Create an unregistered endpoint under the given address label.
///
/// Used by receiver supervisors, whose refs travel to the tracker inside the
/// registration message rather than through the registry.
pub fn channel<M>(addr: String) -> (EndpointRef<M>, Endpoint<M>) {
    let addr = Arc::new(addr);
    let (tx, rx) = mpsc::channel(ENDPOINT_CHANNEL_CAPACITY);
    (EndpointRef { addr: addr.clone(), tx }, Endpoint { addr, rx })
}

/// A registry of named endpoints resolvable as `host:port/name`.
pub struct Registry<M> {
    endpoints: Arc<ArcSwap<HashMap<String, EndpointRef<M>>>>,
}

impl<M> Clone for Registry<M> {
    fn clone(&self) -> Self {
        Self { endpoints: self.endpoints.clone() }
    }
}

impl<M> Default for Registry<M> {
    fn default() -> Self {
        Self {
            endpoints: Arc::new(ArcSwap::from_pointee(HashMap::new())),
        }
    }
}

impl<M: Send + 'static> Registry<M> {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint under the given address, returning its receiving half.
    ///
    /// Registering over an existing address replaces the old ref, which is how
    /// a restarted endpoint takes over its name.
    pub fn register(&self, addr: &str) -> Endpoint<M> {
        let (endpoint_ref, endpoint) = channel(addr.to_string());
        let orig = self.endpoints.load_full();
        let mut updated = orig.as_ref().clone();
        updated.insert(addr.to_string(), endpoint_ref);
        self.endpoints.store(Arc::new(updated));
        endpoint
    }

    /// Remove the endpoint registered under the given address.
    pub fn deregister(&self, addr: &str) {
        let orig = self.endpoints.load_full();
        let mut updated = orig.as_ref().clone();
        if updated.remove(addr).is_some() {
            self.endpoints.store(Arc::new(updated));
        }
    }

    /// Resolve the endpoint registered under the given address.
    pub fn resolve(&self, addr: &str) -> Result<EndpointRef<M>, IngestError> {
        self.endpoints
            .load()
            .get(addr)
            .cloned()
            .ok_or_else(|| IngestError::TrackerUnavailable(format!("no endpoint registered at {}", addr)))
    }
}

/// The receiving half of an endpoint.
pub struct Endpoint<M> {
    /// The address this endpoint was created under.
    pub addr: Arc<String>,
    /// The inbound message channel.
    pub rx: mpsc::Receiver<M>,
}

/// A cheaply cloneable handle used to message a named endpoint.
pub struct EndpointRef<M> {
    addr: Arc<String>,
    tx: mpsc::Sender<M>,
}

impl<M> Clone for EndpointRef<M> {
    fn clone(&self) -> Self {
        Self {
            addr: self.addr.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<M> fmt::Debug for EndpointRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRef").field("addr", &self.addr).finish()
    }
}

impl<M: Send + 'static> EndpointRef<M> {
    /// The address of the referenced endpoint.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send a request built around a fresh reply channel and await its reply.
    pub async fn ask<R, F>(&self, build: F, timeout: Duration) -> Result<R, IngestError>
    where
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        self.ask_inner(build, timeout).await.map_err(|err| self.unavailable(err))
    }

    /// Send a message without awaiting any reply.
    pub async fn tell(&self, msg: M) -> Result<(), IngestError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| self.unavailable(AskError::Closed))
    }

    async fn ask_inner<R, F>(&self, build: F, timeout: Duration) -> Result<R, AskError>
    where
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        let (tx, rx) = oneshot::channel();
        self.tx.send(build(tx)).await.map_err(|_| AskError::Closed)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(AskError::Dropped),
            Err(_) => Err(AskError::Timeout),
        }
    }

    fn unavailable(&self, err: AskError) -> IngestError {
        let reason = match err {
            AskError::Closed => format!("endpoint {} is closed", self.addr),
            AskError::Dropped => format!("endpoint {} dropped the request", self.addr),
            AskError::Timeout => format!("timeout awaiting reply from {}", self.addr),
        };
        IngestError::TrackerUnavailable(reason)
    }
}

/// A client stub for a named endpoint which re-resolves its ref after a
/// transient send failure, so callers survive an endpoint restart.
pub struct Client<M> {
    registry: Registry<M>,
    addr: String,
    cached: ArcSwapOption<EndpointRef<M>>,
}

impl<M: Send + 'static> Client<M> {
    /// Create a new instance.
    pub fn new(registry: Registry<M>, addr: String) -> Self {
        Self {
            registry,
            addr,
            cached: ArcSwapOption::empty(),
        }
    }

    /// The address this client resolves.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send a request and await its reply within the given deadline.
    ///
    /// The builder may be invoked twice when the cached ref turned out to be
    /// dead and a fresh one could be resolved.
    pub async fn ask<R, F>(&self, build: F, timeout: Duration) -> Result<R, IngestError>
    where
        F: Fn(oneshot::Sender<R>) -> M,
    {
        let endpoint = self.endpoint()?;
        match endpoint.ask_inner(&build, timeout).await {
            Ok(reply) => Ok(reply),
            // A closed endpoint may have been replaced under the same name.
            Err(AskError::Closed) => {
                self.invalidate();
                let endpoint = self.endpoint()?;
                endpoint.ask(build, timeout).await
            }
            Err(err) => Err(endpoint.unavailable(err)),
        }
    }

    /// Send a message without awaiting any reply.
    pub async fn tell(&self, msg: M) -> Result<(), IngestError> {
        let endpoint = self.endpoint()?;
        match endpoint.tx.send(msg).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(msg)) => {
                self.invalidate();
                let endpoint = self.endpoint()?;
                endpoint.tell(msg).await
            }
        }
    }

    fn endpoint(&self) -> Result<EndpointRef<M>, IngestError> {
        if let Some(endpoint) = self.cached.load_full() {
            return Ok(endpoint.as_ref().clone());
        }
        let endpoint = self.registry.resolve(&self.addr)?;
        self.cached.store(Some(Arc::new(endpoint.clone())));
        Ok(endpoint)
    }

    fn invalidate(&self) {
        self.cached.store(None);
    }
}
