//! One reactor: a task queue + wakeup shell around a single-threaded poll loop
//! that owns every connection assigned to it.
//!
//! Other threads talk to a reactor only by enqueuing a [`ReactorTask`] and
//! waking the loop. The loop drains tasks FIFO, drives connection readiness,
//! and advances a coarse timer that reaps idle inbound connections and expires
//! overdue calls. Shutdown is a flag flip plus one last wakeup: the loop tears
//! everything down on its own thread, then the shell aborts whatever tasks
//! were still queued.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::mem;
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Poll, Registry, Token, Waker};
use tracing::{debug, error, warn};

use strand_common::config::MessengerConfig;
use strand_common::error::{RpcError, RpcResult};

use crate::call::OutboundCall;
use crate::connection::{Connection, ConnectionId, ReadOutcome, mio_stream_into_std};
use crate::metrics::{MessengerMetrics, ReactorMetrics};
use crate::negotiation::{NegotiatedContext, NegotiatedSocket, NegotiationJob, NegotiationPool};
use crate::service::InboundDispatch;

const WAKER_TOKEN: Token = Token(0);
const CONNECTION_TOKEN_START: usize = 1;
const EVENTS_CAPACITY: usize = 256;

/// Deadline granted to calls whose controller carries no timeout.
const NO_TIMEOUT_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub(crate) fn shutdown_error() -> RpcError {
    RpcError::ServiceUnavailable("reactor is shutting down".to_owned())
}

/// A unit of cross-thread work. Exactly one of [`run`](Self::run) (on the
/// reactor thread) or [`abort`](Self::abort) (on the scheduling thread, or
/// during the shutdown drain) consumes each task.
pub enum ReactorTask {
    /// Find or start the call's connection, then hand the call to it.
    AssignOutboundCall {
        call: OutboundCall,
    },
    /// Register a freshly accepted inbound connection and start negotiating.
    RegisterConnection {
        conn: Connection,
    },
    /// Deliver a finished negotiation back onto the owning reactor.
    CompleteNegotiation {
        token: Token,
        outcome: RpcResult<NegotiatedSocket>,
    },
    /// Sample connection counts and deliver them through `reply`.
    GetMetrics {
        reply: Sender<RpcResult<ReactorMetrics>>,
    },
}

impl ReactorTask {
    fn run(self, registry: &Registry, thread: &mut ReactorThread) {
        match self {
            Self::AssignOutboundCall { call } => thread.assign_outbound_call(registry, call),
            Self::RegisterConnection { conn } => thread.register_connection(registry, conn),
            Self::CompleteNegotiation { token, outcome } => {
                thread.complete_connection_negotiation(registry, token, outcome);
            }
            Self::GetMetrics { reply } => {
                let _ = reply.send(Ok(thread.metrics_snapshot()));
            }
        }
    }

    pub(crate) fn abort(self, status: RpcError) {
        match self {
            Self::AssignOutboundCall { call } => call.fail(status),
            // The connection was never registered and owns nothing but its
            // socket; dropping it here closes that socket.
            Self::RegisterConnection { .. } => {}
            // Dropping the outcome releases the negotiated socket.
            Self::CompleteNegotiation { .. } => {}
            Self::GetMetrics { reply } => {
                let _ = reply.send(Err(status));
            }
        }
    }
}

#[derive(Default)]
struct TaskQueueState {
    pending_tasks: VecDeque<ReactorTask>,
    closing: bool,
}

/// The cross-thread face of a reactor: the task queue, the closing flag, and
/// the wakeup bound to the loop's poll.
pub(crate) struct ReactorShared {
    name: String,
    state: Mutex<TaskQueueState>,
    waker: Waker,
    metrics: Arc<MessengerMetrics>,
}

impl std::fmt::Debug for ReactorShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorShared")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ReactorShared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn lock_state(&self) -> MutexGuard<'_, TaskQueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closing(&self) -> bool {
        self.lock_state().closing
    }

    /// Enqueues `task` and wakes the loop, or aborts it when the reactor is
    /// closing. A task enqueued here is guaranteed to be run exactly once or
    /// aborted exactly once.
    pub(crate) fn schedule_reactor_task(&self, task: ReactorTask) {
        {
            let mut state = self.lock_state();
            if state.closing {
                // Abort may take arbitrary locks in the caller, so the queue
                // lock must not be held across it.
                drop(state);
                self.metrics.record_task_aborted();
                task.abort(shutdown_error());
                return;
            }
            state.pending_tasks.push_back(task);
        }
        self.wake();
    }

    fn drain_task_queue(&self, out: &mut VecDeque<ReactorTask>) -> bool {
        let mut state = self.lock_state();
        if state.closing {
            return false;
        }
        mem::swap(&mut state.pending_tasks, out);
        true
    }

    fn wake(&self) {
        if let Err(error) = self.waker.wake() {
            warn!(reactor = %self.name, %error, "reactor wakeup failed");
        }
    }
}

/// The external-facing shell around one reactor thread. All methods are safe
/// to call from any thread.
pub struct Reactor {
    shared: Arc<ReactorShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Spins up the event-loop thread.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Io` when the poll, the wakeup, or the thread cannot
    /// be created.
    pub(crate) fn start(
        name: String,
        config: &MessengerConfig,
        negotiation_pool: Arc<NegotiationPool>,
        dispatch: Arc<dyn InboundDispatch>,
        metrics: Arc<MessengerMetrics>,
    ) -> RpcResult<Self> {
        let poll =
            Poll::new().map_err(|error| RpcError::Io(format!("create poll failed: {error}")))?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .map_err(|error| RpcError::Io(format!("create reactor wakeup failed: {error}")))?;
        let shared = Arc::new(ReactorShared {
            name: name.clone(),
            state: Mutex::new(TaskQueueState::default()),
            waker,
            metrics,
        });
        let reactor_loop = ReactorLoop {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            thread: ReactorThread::new(Arc::clone(&shared), negotiation_pool, dispatch, config),
        };
        let join = thread::Builder::new()
            .name(format!("rpc reactor {name}"))
            .spawn(move || reactor_loop.run())
            .map_err(|error| RpcError::Io(format!("spawn reactor thread failed: {error}")))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(join)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    #[must_use]
    pub fn closing(&self) -> bool {
        self.shared.closing()
    }

    /// Enqueues arbitrary work for the reactor thread; see
    /// [`ReactorShared::schedule_reactor_task`] for the run/abort guarantee.
    pub fn schedule_reactor_task(&self, task: ReactorTask) {
        self.shared.schedule_reactor_task(task);
    }

    /// Submits an outbound call. Terminal status arrives on the call's
    /// receiver; a call refused by a closing reactor fails immediately.
    pub fn queue_outbound_call(&self, call: OutboundCall) {
        debug!(reactor = %self.name(), conn_id = %call.conn_id(), method = call.method(), "queueing outbound call");
        self.schedule_reactor_task(ReactorTask::AssignOutboundCall { call });
    }

    /// Adopts an accepted socket as an inbound connection on this reactor.
    pub fn register_inbound_socket(&self, socket: StdTcpStream, remote: SocketAddr) {
        debug!(reactor = %self.name(), %remote, "new inbound connection");
        let conn = Connection::inbound(remote, socket, Instant::now());
        self.schedule_reactor_task(ReactorTask::RegisterConnection { conn });
    }

    /// Samples connection counts on the reactor thread.
    ///
    /// # Errors
    ///
    /// Returns the shutdown status when the reactor is closing; never blocks
    /// indefinitely.
    pub fn get_metrics(&self) -> RpcResult<ReactorMetrics> {
        let (reply, receiver) = mpsc::channel();
        self.schedule_reactor_task(ReactorTask::GetMetrics { reply });
        receiver.recv().unwrap_or_else(|_| {
            Err(RpcError::ServiceUnavailable(
                "reactor thread exited before sampling metrics".to_owned(),
            ))
        })
    }

    /// Stops the reactor: flips `closing`, wakes the loop so it tears down its
    /// connections and exits, joins the thread, then aborts every task that
    /// was still queued. Idempotent; racing callers return once the flag is
    /// observed set.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock_state();
            if state.closing {
                return;
            }
            state.closing = true;
        }
        debug!(reactor = %self.name(), "shutting down reactor");
        self.shared.wake();
        let join = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            let _ = join.join();
        }

        // No new tasks can arrive: schedule_reactor_task tests the flag set
        // above. Whatever is left was enqueued before the flip and never ran.
        let pending = mem::take(&mut self.shared.lock_state().pending_tasks);
        for task in pending {
            self.shared.metrics.record_task_aborted();
            task.abort(shutdown_error());
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Clone, Copy)]
struct EventSnapshot {
    token: Token,
    readable: bool,
    writable: bool,
    closed_or_error: bool,
}

impl EventSnapshot {
    fn from_event(event: &mio::event::Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed_or_error: event.is_read_closed()
                || event.is_write_closed()
                || event.is_error(),
        }
    }
}

/// The poll loop driver. Owns the poll and its event buffer; everything else
/// lives in [`ReactorThread`] so readiness handling can borrow the registry
/// and the thread state independently.
struct ReactorLoop {
    poll: Poll,
    events: Events,
    thread: ReactorThread,
}

impl ReactorLoop {
    fn run(mut self) {
        debug!(reactor = %self.thread.shared.name(), "reactor thread running");
        loop {
            let timeout = self
                .thread
                .next_tick
                .saturating_duration_since(Instant::now());
            if let Err(error) = self.poll.poll(&mut self.events, Some(timeout)) {
                if error.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(reactor = %self.thread.shared.name(), %error, "reactor poll failed");
                break;
            }

            let snapshots = self
                .events
                .iter()
                .map(EventSnapshot::from_event)
                .collect::<Vec<_>>();
            let registry = self.poll.registry();
            let now = Instant::now();
            let mut woken = false;
            for snapshot in &snapshots {
                if snapshot.token == WAKER_TOKEN {
                    woken = true;
                } else {
                    self.thread.handle_connection_event(registry, *snapshot, now);
                }
            }
            if woken && self.thread.handle_wakeup(registry) {
                break;
            }
            self.thread.advance_coarse_timer(registry);
        }
        debug!(reactor = %self.thread.shared.name(), "reactor thread exiting");
        // Dropping `self` releases the negotiation-pool and dispatch handles;
        // the messenger can finish tearing down once every reactor thread has
        // let go of them.
    }
}

/// Everything the reactor thread owns. Touched only from that thread once the
/// loop starts.
pub(crate) struct ReactorThread {
    shared: Arc<ReactorShared>,
    negotiation_pool: Arc<NegotiationPool>,
    dispatch: Arc<dyn InboundDispatch>,
    /// Coarse timestamp advanced on every timer tick.
    cur_time: Instant,
    last_unused_tcp_scan: Instant,
    next_tick: Instant,
    next_token: usize,
    client_conns: HashMap<ConnectionId, Connection>,
    client_tokens: HashMap<Token, ConnectionId>,
    server_conns: Vec<Connection>,
    connection_keepalive_time: Duration,
    coarse_timer_granularity: Duration,
    server_negotiation_timeout: Duration,
}

impl ReactorThread {
    fn new(
        shared: Arc<ReactorShared>,
        negotiation_pool: Arc<NegotiationPool>,
        dispatch: Arc<dyn InboundDispatch>,
        config: &MessengerConfig,
    ) -> Self {
        let now = Instant::now();
        let granularity = config.normalized_coarse_timer_granularity();
        Self {
            shared,
            negotiation_pool,
            dispatch,
            cur_time: now,
            last_unused_tcp_scan: now,
            next_tick: now + granularity,
            next_token: CONNECTION_TOKEN_START,
            client_conns: HashMap::new(),
            client_tokens: HashMap::new(),
            server_conns: Vec::new(),
            connection_keepalive_time: config.normalized_connection_keepalive_time(),
            coarse_timer_granularity: granularity,
            server_negotiation_timeout: config.server_negotiation_timeout(),
        }
    }

    /// Returns true when the loop should break because the reactor is closing.
    fn handle_wakeup(&mut self, registry: &Registry) -> bool {
        if self.shared.closing() {
            self.shutdown_internal(registry);
            return true;
        }
        let mut tasks = VecDeque::new();
        if self.shared.drain_task_queue(&mut tasks) {
            while let Some(task) = tasks.pop_front() {
                task.run(registry, self);
            }
        }
        false
    }

    fn advance_coarse_timer(&mut self, registry: &Registry) {
        let now = Instant::now();
        if now < self.next_tick {
            return;
        }
        self.cur_time = now;
        self.next_tick = now + self.coarse_timer_granularity;
        // Scans currently run on every tick; the last-scan stamp leaves room
        // to throttle them independently of the timer later.
        if self
            .cur_time
            .saturating_duration_since(self.last_unused_tcp_scan)
            >= self.coarse_timer_granularity
        {
            self.scan_idle_connections(registry);
        }
        self.expire_outstanding_calls();
    }

    fn scan_idle_connections(&mut self, registry: &Registry) {
        // Keepalive is enforced for inbound connections only; outbound ones
        // stay until they fail or the reactor shuts down.
        let keepalive = self.connection_keepalive_time;
        let mut expired = Vec::new();
        for (index, conn) in self.server_conns.iter().enumerate() {
            if !conn.idle() {
                continue;
            }
            if self
                .cur_time
                .saturating_duration_since(conn.last_activity_time())
                > keepalive
            {
                expired.push(index);
            }
        }
        for index in expired.into_iter().rev() {
            let mut conn = self.server_conns.remove(index);
            debug!(reactor = %self.shared.name(), remote = %conn.remote(), "timing out idle connection");
            conn.shutdown(
                registry,
                RpcError::Network(format!(
                    "connection timed out after {} seconds",
                    keepalive.as_secs_f64()
                )),
            );
        }
        self.last_unused_tcp_scan = self.cur_time;
    }

    fn expire_outstanding_calls(&mut self) {
        for conn in self.client_conns.values_mut() {
            conn.expire_calls(self.cur_time);
        }
    }

    fn shutdown_internal(&mut self, registry: &Registry) {
        debug!(reactor = %self.shared.name(), "tearing down outbound connections");
        // Re-fetch the first entry after every removal so a re-entrant
        // container mutation inside shutdown cannot invalidate the walk.
        while let Some(conn_id) = self.client_conns.keys().next().cloned() {
            if let Some(mut conn) = self.client_conns.remove(&conn_id) {
                let _ = self.client_tokens.remove(&conn.token());
                conn.shutdown(registry, shutdown_error());
            }
        }
        debug!(reactor = %self.shared.name(), "tearing down inbound connections");
        for mut conn in mem::take(&mut self.server_conns) {
            conn.shutdown(registry, shutdown_error());
        }
    }

    fn metrics_snapshot(&self) -> ReactorMetrics {
        ReactorMetrics {
            num_client_connections: self.client_conns.len(),
            num_server_connections: self.server_conns.len(),
        }
    }

    fn allocate_connection_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.saturating_add(1);
        token
    }

    fn assign_outbound_call(&mut self, registry: &Registry, call: OutboundCall) {
        let deadline = match call.controller().timeout() {
            Some(timeout) => Instant::now() + timeout,
            None => {
                warn!(
                    reactor = %self.shared.name(),
                    method = call.method(),
                    conn_id = %call.conn_id(),
                    "outbound call has no timeout set"
                );
                Instant::now() + NO_TIMEOUT_DEADLINE
            }
        };

        let conn_id = call.conn_id().clone();
        if let Err(error) = self.find_or_start_connection(&conn_id, deadline) {
            call.fail(error);
            return;
        }
        let Some(conn) = self.client_conns.get_mut(&conn_id) else {
            call.fail(RpcError::IllegalState(
                "connection disappeared while assigning a call",
            ));
            return;
        };
        if let Some(status) = conn.queue_outbound_call(call, deadline, registry) {
            self.destroy_client_connection(registry, &conn_id, status);
        }
    }

    fn find_or_start_connection(
        &mut self,
        conn_id: &ConnectionId,
        deadline: Instant,
    ) -> RpcResult<()> {
        if self.client_conns.contains_key(conn_id) {
            // The entry may still be negotiating; calls park on it either way.
            return Ok(());
        }
        debug!(reactor = %self.shared.name(), %conn_id, "creating new outbound connection");

        let socket = create_client_socket(conn_id.remote)?;
        let token = self.allocate_connection_token();
        let mut conn = Connection::outbound(
            conn_id.remote,
            socket,
            token,
            conn_id.service_name.clone(),
            conn_id.user_credentials.clone(),
            self.cur_time,
        );
        match self.start_connection_negotiation(&mut conn, deadline) {
            Ok(()) => {}
            Err(RpcError::IllegalState(_)) => {
                // Forwarding the raw pool status would read like an internal
                // error to the caller.
                return Err(RpcError::ServiceUnavailable(
                    "Client RPC Messenger shutting down".to_owned(),
                ));
            }
            Err(error) => {
                return Err(error.prepend("Unable to start connection negotiation thread"));
            }
        }

        let _ = self.client_tokens.insert(token, conn_id.clone());
        let _ = self.client_conns.insert(conn_id.clone(), conn);
        Ok(())
    }

    fn start_connection_negotiation(
        &mut self,
        conn: &mut Connection,
        deadline: Instant,
    ) -> RpcResult<()> {
        let socket = conn.detach_socket_for_negotiation()?;
        let job = NegotiationJob {
            socket,
            direction: conn.direction(),
            deadline,
            token: conn.token(),
            remote: conn.remote(),
            context: NegotiatedContext {
                service_name: conn.service_name().to_owned(),
                user_credentials: conn.user_credentials().clone(),
            },
            reactor: Arc::clone(&self.shared),
        };
        self.negotiation_pool.submit(job)
    }

    fn register_connection(&mut self, registry: &Registry, mut conn: Connection) {
        let deadline = Instant::now() + self.server_negotiation_timeout;
        conn.set_token(self.allocate_connection_token());
        let token = conn.token();
        let started = self.start_connection_negotiation(&mut conn, deadline);
        // Track the connection either way so the destroy path finds it.
        self.server_conns.push(conn);
        if let Err(error) = started {
            error!(reactor = %self.shared.name(), %error, "server connection negotiation failed");
            self.destroy_server_connection(registry, token, error);
        }
    }

    fn complete_connection_negotiation(
        &mut self,
        registry: &Registry,
        token: Token,
        outcome: RpcResult<NegotiatedSocket>,
    ) {
        let negotiated = match outcome {
            Ok(negotiated) => negotiated,
            Err(status) => {
                self.destroy_connection_by_token(registry, token, status);
                return;
            }
        };

        let reactor_name = self.shared.name().to_string();
        let failure = {
            let Some(conn) = self.connection_mut_by_token(token) else {
                debug!(reactor = %reactor_name, "negotiation completed for an already-destroyed connection");
                return;
            };
            if let Some(context) = negotiated.context {
                conn.adopt_negotiated_context(context);
            }
            if conn.service_name().is_empty() {
                debug_assert!(false, "connection service name was never negotiated");
                error!(
                    reactor = %reactor_name,
                    remote = %conn.remote(),
                    "unexpected negotiation result: empty service name"
                );
                Some(RpcError::IllegalState(
                    "connection service name was never negotiated",
                ))
            } else {
                match conn.reattach_socket(negotiated.socket) {
                    Err(status) => {
                        debug_assert!(false, "negotiated socket could not be reattached");
                        error!(reactor = %self.shared.name(), %status, "unable to restore non-blocking mode");
                        Some(status)
                    }
                    Ok(()) => {
                        conn.mark_negotiation_complete();
                        match conn.register_with_poll(registry) {
                            Err(status) => Some(status),
                            Ok(()) => conn.flush_pending_calls(registry),
                        }
                    }
                }
            }
        };
        if let Some(status) = failure {
            self.destroy_connection_by_token(registry, token, status);
        }
    }

    fn handle_connection_event(
        &mut self,
        registry: &Registry,
        snapshot: EventSnapshot,
        now: Instant,
    ) {
        if let Some(conn_id) = self.client_tokens.get(&snapshot.token).cloned() {
            self.drive_client_connection(registry, &conn_id, snapshot, now);
        } else if self
            .server_conns
            .iter()
            .any(|conn| conn.token() == snapshot.token)
        {
            self.drive_server_connection(registry, snapshot, now);
        }
    }

    fn drive_client_connection(
        &mut self,
        registry: &Registry,
        conn_id: &ConnectionId,
        snapshot: EventSnapshot,
        now: Instant,
    ) {
        let status = {
            let Some(conn) = self.client_conns.get_mut(conn_id) else {
                return;
            };
            drive_connection_io(registry, conn, snapshot, now).status
        };
        if let Some(status) = status {
            self.destroy_client_connection(registry, conn_id, status);
        }
    }

    fn drive_server_connection(
        &mut self,
        registry: &Registry,
        snapshot: EventSnapshot,
        now: Instant,
    ) {
        let outcome = {
            let Some(conn) = self.server_conn_mut(snapshot.token) else {
                return;
            };
            drive_connection_io(registry, conn, snapshot, now)
        };

        let dispatch = Arc::clone(&self.dispatch);
        let mut fatal = outcome.status;
        for call in outcome.inbound_calls {
            let call_id = call.call_id;
            if let Err(error) = dispatch.dispatch(call) {
                warn!(reactor = %self.shared.name(), %error, "inbound call rejected by service dispatch");
                let message = dispatch_rejection_message(&error);
                let Some(conn) = self.server_conn_mut(snapshot.token) else {
                    return;
                };
                if let Some(status) = conn.queue_error_response(call_id, &message, registry) {
                    fatal = Some(status);
                    break;
                }
            }
        }
        if let Some(status) = fatal {
            self.destroy_server_connection(registry, snapshot.token, status);
        }
    }

    fn server_conn_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.server_conns
            .iter_mut()
            .find(|conn| conn.token() == token)
    }

    fn connection_mut_by_token(&mut self, token: Token) -> Option<&mut Connection> {
        if let Some(conn_id) = self.client_tokens.get(&token).cloned() {
            return self.client_conns.get_mut(&conn_id);
        }
        self.server_conn_mut(token)
    }

    fn destroy_connection_by_token(&mut self, registry: &Registry, token: Token, status: RpcError) {
        if let Some(conn_id) = self.client_tokens.get(&token).cloned() {
            self.destroy_client_connection(registry, &conn_id, status);
        } else {
            self.destroy_server_connection(registry, token, status);
        }
    }

    fn destroy_client_connection(
        &mut self,
        registry: &Registry,
        conn_id: &ConnectionId,
        status: RpcError,
    ) {
        let Some(mut conn) = self.client_conns.remove(conn_id) else {
            debug_assert!(false, "destroying an untracked client connection");
            error!(reactor = %self.shared.name(), %conn_id, "attempted to destroy an untracked client connection");
            return;
        };
        let _ = self.client_tokens.remove(&conn.token());
        conn.shutdown(registry, status);
    }

    fn destroy_server_connection(&mut self, registry: &Registry, token: Token, status: RpcError) {
        // The idle reaper may have removed the entry already; that is fine.
        if let Some(index) = self
            .server_conns
            .iter()
            .position(|conn| conn.token() == token)
        {
            let mut conn = self.server_conns.remove(index);
            conn.shutdown(registry, status);
        }
    }
}

fn drive_connection_io(
    registry: &Registry,
    conn: &mut Connection,
    snapshot: EventSnapshot,
    now: Instant,
) -> ReadOutcome {
    let mut outcome = ReadOutcome::default();
    if snapshot.readable {
        outcome = conn.handle_read(now);
    }
    if outcome.status.is_none() && snapshot.writable {
        outcome.status = conn.handle_write(now);
    }
    if outcome.status.is_none() && snapshot.closed_or_error && !snapshot.readable {
        outcome.status = Some(RpcError::Network("got EOF from remote".to_owned()));
    }
    if outcome.status.is_none() {
        outcome.status = conn.refresh_interest(registry).err();
    }
    outcome
}

fn dispatch_rejection_message(error: &RpcError) -> String {
    // Avoid stacking two "Service unavailable" prefixes once the message
    // crosses the wire and is rebuilt on the caller's side.
    match error {
        RpcError::ServiceUnavailable(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Creates the socket for a new outbound connection: non-blocking, `TCP_NODELAY`.
/// An immediate connect success and an in-progress one look the same here;
/// hard failures surface either right away or when negotiation first touches
/// the socket.
fn create_client_socket(remote: SocketAddr) -> RpcResult<StdTcpStream> {
    let stream = TcpStream::connect(remote)
        .map_err(|error| RpcError::Network(format!("connect to {remote} failed: {error}")))?;
    stream
        .set_nodelay(true)
        .map_err(|error| RpcError::Network(format!("set TCP_NODELAY on {remote} failed: {error}")))?;
    Ok(mio_stream_into_std(stream))
}

#[cfg(test)]
mod tests;
