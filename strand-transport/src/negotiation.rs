//! Connection negotiation: a blocking handshake run off-loop on a worker pool.
//!
//! Reactors never block, so the pre-RPC handshake (context exchange,
//! authentication) borrows the connection's socket, runs it in blocking mode
//! on one of these workers, and posts a completion task back onto the owning
//! reactor. Each worker hosts a current-thread Tokio runtime fed by an
//! unbounded channel, matching the shape of the rest of the blocking pools in
//! this workspace.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use mio::Token;
use tokio::runtime::Builder as TokioBuilder;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::debug;

use strand_common::error::{RpcError, RpcResult};

use crate::connection::{ConnectionDirection, UserCredentials};
use crate::reactor::{ReactorShared, ReactorTask};

const NEGOTIATION_MAGIC: [u8; 4] = *b"SRPC";
const NEGOTIATION_VERSION: u8 = 1;
const NEGOTIATION_ACK: u8 = 0x01;
const MAX_CONTEXT_FIELD_BYTES: usize = 1024;

/// Connection identity established by the context exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedContext {
    /// Service the peer wants to talk to.
    pub service_name: String,
    /// Credentials the peer presented.
    pub user_credentials: UserCredentials,
}

/// A negotiated socket travelling back to its owning reactor, still in
/// blocking mode. Server-side negotiations carry the learned context.
#[derive(Debug)]
pub struct NegotiatedSocket {
    pub(crate) socket: StdTcpStream,
    pub(crate) context: Option<NegotiatedContext>,
}

/// One handshake submitted to the pool.
#[derive(Debug)]
pub(crate) struct NegotiationJob {
    pub(crate) socket: StdTcpStream,
    pub(crate) direction: ConnectionDirection,
    pub(crate) deadline: Instant,
    pub(crate) token: Token,
    pub(crate) remote: SocketAddr,
    /// The local context a client-side handshake presents.
    pub(crate) context: NegotiatedContext,
    /// Owning reactor; completion re-enters it through the task queue.
    pub(crate) reactor: Arc<ReactorShared>,
}

/// The handshake seam. Implementations block on the socket and must respect
/// `deadline`; authentication mechanisms plug in here.
pub trait ConnectionNegotiator: Send + Sync {
    /// Runs the client side of the handshake, presenting `context`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::TimedOut` past the deadline, `RpcError::Network` on
    /// socket failure or peer rejection.
    fn negotiate_client(
        &self,
        socket: &mut StdTcpStream,
        context: &NegotiatedContext,
        deadline: Instant,
    ) -> RpcResult<()>;

    /// Runs the server side of the handshake, returning the peer's context.
    ///
    /// # Errors
    ///
    /// As [`ConnectionNegotiator::negotiate_client`].
    fn negotiate_server(
        &self,
        socket: &mut StdTcpStream,
        deadline: Instant,
    ) -> RpcResult<NegotiatedContext>;
}

/// Unauthenticated context exchange: magic + version, the two context fields
/// with u16 length prefixes, then a one-byte ack from the server.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainNegotiator;

impl ConnectionNegotiator for PlainNegotiator {
    fn negotiate_client(
        &self,
        socket: &mut StdTcpStream,
        context: &NegotiatedContext,
        deadline: Instant,
    ) -> RpcResult<()> {
        arm_deadline(socket, deadline)?;
        let mut hello = Vec::with_capacity(
            NEGOTIATION_MAGIC.len()
                + 1
                + 4
                + context.service_name.len()
                + context.user_credentials.real_user().len(),
        );
        hello.extend_from_slice(&NEGOTIATION_MAGIC);
        hello.push(NEGOTIATION_VERSION);
        push_context_field(&mut hello, context.service_name.as_bytes())?;
        push_context_field(&mut hello, context.user_credentials.real_user().as_bytes())?;
        socket.write_all(&hello).map_err(handshake_error)?;

        let mut ack = [0_u8; 1];
        socket.read_exact(&mut ack).map_err(handshake_error)?;
        if ack[0] != NEGOTIATION_ACK {
            return Err(RpcError::Network(
                "peer rejected the negotiation context".to_owned(),
            ));
        }
        disarm_deadline(socket);
        Ok(())
    }

    fn negotiate_server(
        &self,
        socket: &mut StdTcpStream,
        deadline: Instant,
    ) -> RpcResult<NegotiatedContext> {
        arm_deadline(socket, deadline)?;
        let mut preamble = [0_u8; 5];
        socket.read_exact(&mut preamble).map_err(handshake_error)?;
        if preamble[..4] != NEGOTIATION_MAGIC {
            return Err(RpcError::Network(
                "peer sent an unrecognized negotiation preamble".to_owned(),
            ));
        }
        if preamble[4] != NEGOTIATION_VERSION {
            return Err(RpcError::Network(format!(
                "unsupported negotiation version {}",
                preamble[4]
            )));
        }
        let service_name = read_context_field(socket, "service name")?;
        let real_user = read_context_field(socket, "user")?;
        socket.write_all(&[NEGOTIATION_ACK]).map_err(handshake_error)?;
        disarm_deadline(socket);
        Ok(NegotiatedContext {
            service_name,
            user_credentials: UserCredentials::new(real_user),
        })
    }
}

fn arm_deadline(socket: &StdTcpStream, deadline: Instant) -> RpcResult<()> {
    let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
    else {
        return Err(RpcError::TimedOut(
            "connection negotiation timed out".to_owned(),
        ));
    };
    socket
        .set_read_timeout(Some(remaining))
        .and_then(|()| socket.set_write_timeout(Some(remaining)))
        .map_err(|error| RpcError::Io(format!("arm negotiation socket timeouts failed: {error}")))
}

fn disarm_deadline(socket: &StdTcpStream) {
    let _ = socket.set_read_timeout(None);
    let _ = socket.set_write_timeout(None);
}

fn handshake_error(error: std::io::Error) -> RpcError {
    match error.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            RpcError::TimedOut("connection negotiation timed out".to_owned())
        }
        ErrorKind::UnexpectedEof => {
            RpcError::Network("peer closed the connection during negotiation".to_owned())
        }
        _ => RpcError::Network(format!("connection negotiation failed: {error}")),
    }
}

fn push_context_field(buf: &mut Vec<u8>, field: &[u8]) -> RpcResult<()> {
    if field.len() > MAX_CONTEXT_FIELD_BYTES {
        return Err(RpcError::Network(
            "negotiation context field is too large".to_owned(),
        ));
    }
    let Ok(len) = u16::try_from(field.len()) else {
        return Err(RpcError::Network(
            "negotiation context field is too large".to_owned(),
        ));
    };
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(field);
    Ok(())
}

fn read_context_field(socket: &mut StdTcpStream, what: &str) -> RpcResult<String> {
    let mut len_bytes = [0_u8; 2];
    socket.read_exact(&mut len_bytes).map_err(handshake_error)?;
    let len = usize::from(u16::from_le_bytes(len_bytes));
    if len > MAX_CONTEXT_FIELD_BYTES {
        return Err(RpcError::Network(format!(
            "negotiation {what} field is too large"
        )));
    }
    let mut field = vec![0_u8; len];
    socket.read_exact(&mut field).map_err(handshake_error)?;
    String::from_utf8(field)
        .map_err(|_| RpcError::Network(format!("negotiation {what} is not valid UTF-8")))
}

/// Fixed pool of blocking negotiation workers shared by all reactors of one
/// messenger.
pub struct NegotiationPool {
    closing: AtomicBool,
    next_worker: AtomicUsize,
    senders: Mutex<Vec<UnboundedSender<NegotiationJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for NegotiationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationPool")
            .field("closing", &self.closing.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl NegotiationPool {
    #[must_use]
    pub(crate) fn new(worker_count: usize, negotiator: Arc<dyn ConnectionNegotiator>) -> Self {
        let worker_count = worker_count.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let (sender, receiver) = unbounded_channel::<NegotiationJob>();
            senders.push(sender);
            let negotiator = Arc::clone(&negotiator);
            match thread::Builder::new()
                .name(format!("rpc negotiator {worker_index}"))
                .spawn(move || negotiation_worker_main(receiver, negotiator))
            {
                Ok(handle) => workers.push(handle),
                Err(error) => {
                    debug!(worker_index, %error, "spawn negotiation worker failed");
                    let _ = senders.pop();
                }
            }
        }
        Self {
            closing: AtomicBool::new(false),
            next_worker: AtomicUsize::new(0),
            senders: Mutex::new(senders),
            workers: Mutex::new(workers),
        }
    }

    /// Hands one handshake to a worker, round-robin.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::IllegalState` once the pool is stopping; the reactor
    /// translates that into its caller-facing shutdown status.
    pub(crate) fn submit(&self, job: NegotiationJob) -> RpcResult<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(RpcError::IllegalState("negotiation pool is shutting down"));
        }
        let senders = self
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if senders.is_empty() {
            return Err(RpcError::IllegalState("negotiation pool is shutting down"));
        }
        let index = self.next_worker.fetch_add(1, Ordering::AcqRel) % senders.len();
        senders[index]
            .send(job)
            .map_err(|_| RpcError::IllegalState("negotiation pool is shutting down"))
    }

    /// Stops accepting jobs, then joins the workers. In-flight handshakes
    /// finish (bounded by their deadlines) and post their completions, which
    /// the closing reactors abort. Idempotent.
    pub(crate) fn stop(&self) {
        self.closing.store(true, Ordering::Release);
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let handles = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.drain(..).collect::<Vec<_>>()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for NegotiationPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn negotiation_worker_main(
    mut receiver: UnboundedReceiver<NegotiationJob>,
    negotiator: Arc<dyn ConnectionNegotiator>,
) {
    let Ok(runtime) = TokioBuilder::new_current_thread().enable_time().build() else {
        return;
    };
    runtime.block_on(async move {
        while let Some(job) = receiver.recv().await {
            run_negotiation_job(job, negotiator.as_ref());
        }
    });
}

fn run_negotiation_job(job: NegotiationJob, negotiator: &dyn ConnectionNegotiator) {
    let NegotiationJob {
        mut socket,
        direction,
        deadline,
        token,
        remote,
        context,
        reactor,
    } = job;
    let handshake = match direction {
        ConnectionDirection::Client => negotiator
            .negotiate_client(&mut socket, &context, deadline)
            .map(|()| None),
        ConnectionDirection::Server => negotiator.negotiate_server(&mut socket, deadline).map(Some),
    };
    let outcome = match handshake {
        Ok(context) => Ok(NegotiatedSocket { socket, context }),
        Err(error) => {
            debug!(%remote, %error, "connection negotiation failed");
            Err(error)
        }
    };
    // If the reactor refuses the task it aborts it, dropping the socket.
    reactor.schedule_reactor_task(ReactorTask::CompleteNegotiation { token, outcome });
}
