//! Address-routed relay between a node's processor and its parent and
//! children.
//!
//! Every Coordinator, Agent and Worker runs one broker. Requests are routed
//! by destination address: dispatched locally, fanned out to matching
//! children, or handed to the parent. Each request is answered with exactly
//! one [`ResponseType`]; a lost or silent peer answers `NODE_UNREACHABLE`.
mod connection;
mod routing;


use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, BrokerError};
use crate::processor::OperationProcessor;
use crate::protocol::{
    Frame, RequestFrame, ResponseFrame, ResponseType, SimulatorAddress, SimulatorOperation,
    WireOperation,
};

use connection::PeerSide;
pub use routing::{Route, resolve_route};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DISPATCH_POOL_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerOptions {
    pub request_timeout: Duration,
    pub hello_timeout: Duration,
    /// Upper bound on concurrently running local handlers.
    pub dispatch_pool_size: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
            dispatch_pool_size: DEFAULT_DISPATCH_POOL_SIZE,
        }
    }
}

/// Reaction to a child connection going away.
#[async_trait]
pub trait ChildLossHook: Send + Sync {
    async fn on_child_lost(&self, broker: &Broker, child: &SimulatorAddress, reason: &str);
}

#[derive(Debug, Clone)]
pub(crate) struct PeerLink {
    address: SimulatorAddress,
    sender: mpsc::UnboundedSender<Frame>,
}

#[derive(Debug)]
struct PendingRequest {
    peer: SimulatorAddress,
    reply: oneshot::Sender<ResponseType>,
}

struct BrokerInner {
    address: SimulatorAddress,
    processor: Arc<OperationProcessor>,
    options: BrokerOptions,
    children: DashMap<SimulatorAddress, PeerLink>,
    parent: RwLock<Option<PeerLink>>,
    pending: DashMap<u64, PendingRequest>,
    next_message_id: AtomicU64,
    dispatch_permits: Arc<Semaphore>,
    hooks: RwLock<Vec<Arc<dyn ChildLossHook>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: RwLock<Option<SocketAddr>>,
    children_tx: watch::Sender<usize>,
    parent_closed_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_tasks(tasks: &Mutex<Vec<JoinHandle<()>>>) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
    match tasks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Broker {
    #[must_use]
    pub fn new(
        address: SimulatorAddress,
        processor: Arc<OperationProcessor>,
        options: BrokerOptions,
    ) -> Self {
        let (children_tx, _) = watch::channel(0_usize);
        let (parent_closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(BrokerInner {
                address,
                processor,
                options,
                children: DashMap::new(),
                parent: RwLock::new(None),
                pending: DashMap::new(),
                next_message_id: AtomicU64::new(1),
                dispatch_permits: Arc::new(Semaphore::new(options.dispatch_pool_size.max(1))),
                hooks: RwLock::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                local_addr: RwLock::new(None),
                children_tx,
                parent_closed_tx,
            }),
        }
    }

    #[must_use]
    pub fn address(&self) -> SimulatorAddress {
        self.inner.address
    }

    #[must_use]
    pub fn processor(&self) -> &Arc<OperationProcessor> {
        &self.inner.processor
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *read_lock(&self.inner.local_addr)
    }

    pub fn add_child_loss_hook(&self, hook: Arc<dyn ChildLossHook>) {
        write_lock(&self.inner.hooks).push(hook);
    }

    /// Binds `bind_addr` and accepts child connections in the background.
    ///
    /// # Errors
    ///
    /// Returns an error when the address cannot be bound.
    pub async fn listen(&self, bind_addr: &str) -> AppResult<SocketAddr> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|err| {
            AppError::broker(BrokerError::Bind {
                addr: bind_addr.to_owned(),
                source: err,
            })
        })?;
        let local_addr = listener.local_addr()?;
        *write_lock(&self.inner.local_addr) = Some(local_addr);
        info!("{} listening on {}", self.address(), local_addr);

        let broker = self.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("Accept failed on {}: {}", local_addr, err);
                        continue;
                    }
                };
                let handshake_broker = broker.clone();
                let handshake = tokio::spawn(async move {
                    if let Err(err) = connection::accept_child(&handshake_broker, stream).await {
                        warn!("Rejected connection from {}: {}", peer, err);
                    }
                });
                broker.track_task(handshake);
            }
        });
        self.track_task(accept_task);
        Ok(local_addr)
    }

    /// Connects to the parent broker at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error when a parent is already connected, the connection
    /// fails, or the parent rejects this node.
    pub async fn connect_parent(&self, addr: &str) -> AppResult<SimulatorAddress> {
        if read_lock(&self.inner.parent).is_some() {
            return Err(AppError::broker(BrokerError::ParentAlreadyConnected));
        }
        connection::connect_parent(self, addr).await
    }

    /// Resolves once the parent connection is gone.
    pub async fn parent_closed(&self) {
        let mut receiver = self.inner.parent_closed_tx.subscribe();
        if receiver.wait_for(|closed| *closed).await.is_err() {
            debug!("Parent watch dropped for {}", self.address());
        }
    }

    #[must_use]
    pub fn children(&self) -> Vec<SimulatorAddress> {
        let mut children: Vec<SimulatorAddress> = self
            .inner
            .children
            .iter()
            .map(|entry| *entry.key())
            .collect();
        children.sort();
        children
    }

    /// Waits until at least `count` children are registered.
    ///
    /// # Errors
    ///
    /// Returns an error when `wait` elapses first.
    pub async fn wait_for_children(&self, count: usize, wait: Duration) -> AppResult<()> {
        let mut receiver = self.inner.children_tx.subscribe();
        let reached = timeout(wait, async {
            receiver
                .wait_for(|registered| *registered >= count)
                .await
                .map(|_registered| ())
        })
        .await;
        match reached {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(AppError::broker(BrokerError::ChildWaitTimeout {
                expected: count,
                actual: self.inner.children.len(),
            })),
        }
    }

    /// Sends `operation` from this node to `destination`.
    pub async fn send(
        &self,
        destination: &SimulatorAddress,
        operation: &SimulatorOperation,
    ) -> ResponseType {
        let wire = match operation.encode() {
            Ok(wire) => wire,
            Err(err) => {
                self.inner.processor.exception_logger().log_dispatch_error(
                    Some(operation.operation_type()),
                    &self.address(),
                    err.to_string(),
                );
                return ResponseType::ExceptionDuringOperationExecution;
            }
        };
        self.route(self.address(), *destination, wire, None).await
    }

    /// Sends to the parent, whatever its address.
    pub async fn send_to_parent(&self, operation: &SimulatorOperation) -> ResponseType {
        match self.address().parent() {
            Some(parent) => self.send(&parent, operation).await,
            None => ResponseType::NodeUnreachable,
        }
    }

    /// Stops every background task and drops all links.
    pub fn shutdown(&self) {
        for task in lock_tasks(&self.inner.tasks).drain(..) {
            task.abort();
        }
        self.inner.children.clear();
        self.inner.pending.clear();
        *write_lock(&self.inner.parent) = None;
        self.inner.children_tx.send_replace(0);
        self.inner.parent_closed_tx.send_replace(true);
        info!("{} shut down", self.address());
    }

    async fn route(
        &self,
        source: SimulatorAddress,
        destination: SimulatorAddress,
        operation: WireOperation,
        arrived_from: Option<PeerSide>,
    ) -> ResponseType {
        let route = {
            let children: Vec<SimulatorAddress> = self
                .inner
                .children
                .iter()
                .map(|entry| *entry.key())
                .collect();
            resolve_route(&self.inner.address, &destination, &children)
        };
        match route {
            Route::Local => self.dispatch_local(operation, source).await,
            Route::Children(children) => {
                let requests = children.iter().map(|child| {
                    self.request_child(child, source, destination, operation.clone())
                });
                ResponseType::aggregate(join_all(requests).await)
            }
            Route::Parent => {
                if arrived_from == Some(PeerSide::Parent) {
                    debug!(
                        "{} cannot route {} from its parent back up",
                        self.address(),
                        destination
                    );
                    return ResponseType::NodeUnreachable;
                }
                let parent = read_lock(&self.inner.parent).clone();
                match parent {
                    Some(link) => self.request(&link, source, destination, operation).await,
                    None => {
                        debug!("{} has no parent to reach {}", self.address(), destination);
                        ResponseType::NodeUnreachable
                    }
                }
            }
            Route::Unreachable => {
                debug!("{} has no child matching {}", self.address(), destination);
                ResponseType::NodeUnreachable
            }
        }
    }

    async fn request_child(
        &self,
        child: &SimulatorAddress,
        source: SimulatorAddress,
        destination: SimulatorAddress,
        operation: WireOperation,
    ) -> ResponseType {
        let link = self.inner.children.get(child).map(|entry| entry.value().clone());
        match link {
            Some(link) => self.request(&link, source, destination, operation).await,
            None => ResponseType::NodeUnreachable,
        }
    }

    async fn request(
        &self,
        link: &PeerLink,
        source: SimulatorAddress,
        destination: SimulatorAddress,
        operation: WireOperation,
    ) -> ResponseType {
        let message_id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        self.inner.pending.insert(
            message_id,
            PendingRequest {
                peer: link.address,
                reply,
            },
        );
        let frame = Frame::Request(RequestFrame {
            message_id,
            source,
            destination,
            operation,
        });
        if link.sender.send(frame).is_err() {
            self.inner.pending.remove(&message_id);
            warn!("Link to {} is closed", link.address);
            return ResponseType::NodeUnreachable;
        }
        match timeout(self.inner.options.request_timeout, response).await {
            Ok(Ok(response)) => response,
            Ok(Err(_dropped)) => {
                warn!(
                    "{} was lost before answering request {}",
                    link.address, message_id
                );
                ResponseType::NodeUnreachable
            }
            Err(_elapsed) => {
                self.inner.pending.remove(&message_id);
                warn!(
                    "Request {} to {} timed out after {:?}",
                    message_id, link.address, self.inner.options.request_timeout
                );
                ResponseType::NodeUnreachable
            }
        }
    }

    async fn dispatch_local(&self, operation: WireOperation, source: SimulatorAddress) -> ResponseType {
        let Ok(permit) = Arc::clone(&self.inner.dispatch_permits).acquire_owned().await else {
            return ResponseType::NodeUnreachable;
        };
        let processor = Arc::clone(&self.inner.processor);
        let dispatched = tokio::task::spawn_blocking(move || {
            let response = processor.dispatch_wire(&operation, &source);
            drop(permit);
            response
        })
        .await;
        match dispatched {
            Ok(response) => response,
            Err(err) => {
                self.inner.processor.exception_logger().log_dispatch_error(
                    None,
                    &source,
                    format!("dispatch task failed: {}", err),
                );
                ResponseType::ExceptionDuringOperationExecution
            }
        }
    }

    fn spawn_inbound(&self, link: PeerLink, side: PeerSide, request: RequestFrame) {
        let broker = self.clone();
        let task = tokio::spawn(async move {
            let message_id = request.message_id;
            let response = broker.handle_inbound(&link, side, request).await;
            let frame = Frame::Response(ResponseFrame {
                message_id,
                response,
            });
            if link.sender.send(frame).is_err() {
                debug!(
                    "Could not answer request {} from {}: link closed",
                    message_id, link.address
                );
            }
        });
        self.track_task(task);
    }

    async fn handle_inbound(
        &self,
        link: &PeerLink,
        side: PeerSide,
        request: RequestFrame,
    ) -> ResponseType {
        let source_valid = !request.source.is_wildcard()
            && match side {
                PeerSide::Child => link.address.contains(&request.source),
                PeerSide::Parent => true,
            };
        if !source_valid {
            self.inner.processor.exception_logger().log_dispatch_error(
                request.operation.operation_type().ok(),
                &link.address,
                format!("rejected request with source {}", request.source),
            );
            return ResponseType::ExceptionDuringOperationExecution;
        }
        self.route(
            request.source,
            request.destination,
            request.operation,
            Some(side),
        )
        .await
    }

    fn complete_pending(&self, peer: &SimulatorAddress, message_id: u64, response: ResponseType) {
        match self.inner.pending.remove(&message_id) {
            Some((_, pending)) if pending.peer == *peer => {
                if pending.reply.send(response).is_err() {
                    debug!("Caller of request {} stopped waiting", message_id);
                }
            }
            Some((id, pending)) => {
                warn!(
                    "Response {} from {} does not match request peer {}",
                    message_id, peer, pending.peer
                );
                self.inner.pending.insert(id, pending);
            }
            None => debug!("Late response {} from {}", message_id, peer),
        }
    }

    /// Claims `link.address` for this connection; fails when another
    /// connection already holds it.
    fn try_register_child(&self, link: &PeerLink) -> bool {
        match self.inner.children.entry(link.address) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(link.clone());
                self.inner.children_tx.send_replace(self.inner.children.len());
                true
            }
        }
    }

    /// Drops `link` if it is still the registered connection for its address.
    fn unregister_child(&self, link: &PeerLink) -> bool {
        let removed = self
            .inner
            .children
            .remove_if(&link.address, |_, registered| {
                registered.sender.same_channel(&link.sender)
            })
            .is_some();
        if removed {
            self.inner.children_tx.send_replace(self.inner.children.len());
        }
        removed
    }

    fn set_parent(&self, link: PeerLink) {
        *write_lock(&self.inner.parent) = Some(link);
        self.inner.parent_closed_tx.send_replace(false);
    }

    async fn peer_lost(&self, link: &PeerLink, side: PeerSide, reason: &str) {
        let address = &link.address;
        match side {
            PeerSide::Parent => {
                self.inner.pending.retain(|_, pending| pending.peer != *address);
                *write_lock(&self.inner.parent) = None;
                self.inner.parent_closed_tx.send_replace(true);
                warn!("{} lost its parent {}: {}", self.address(), address, reason);
            }
            PeerSide::Child => {
                if !self.unregister_child(link) {
                    return;
                }
                self.inner.pending.retain(|_, pending| pending.peer != *address);
                warn!("{} lost child {}: {}", self.address(), address, reason);
                let hooks = read_lock(&self.inner.hooks).clone();
                for hook in hooks {
                    hook.on_child_lost(self, address, reason).await;
                }
            }
        }
    }

    fn track_task(&self, task: JoinHandle<()>) {
        let mut tasks = lock_tasks(&self.inner.tasks);
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(task);
    }
}
