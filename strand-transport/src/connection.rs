//! Per-connection state owned by exactly one reactor thread.
//!
//! A connection moves through negotiation → ready → shutdown. While it
//! negotiates, its socket is detached and lives on a negotiation worker; calls
//! queued in that window wait in `pending_calls` and are flushed when the
//! socket comes back. Every mutation happens on the owning reactor thread, so
//! none of this state carries a lock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::mem;
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::os::fd::OwnedFd;
use std::time::Instant;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::debug;

use strand_common::error::{RpcError, RpcResult};
use strand_common::ids::{CallId, FIRST_CALL_ID};

use crate::call::{InboundCall, OutboundCall};
use crate::frame::{self, Frame};
use crate::negotiation::NegotiatedContext;

const READ_CHUNK_BYTES: usize = 8192;

/// Placeholder token carried by a connection that has not been registered on
/// its reactor yet.
pub(crate) const UNREGISTERED_TOKEN: Token = Token(usize::MAX);

/// Identity of one outbound connection: a reactor keeps at most one client
/// connection per distinct tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    /// Address of the remote peer.
    pub remote: SocketAddr,
    /// Service the connection is bound to.
    pub service_name: String,
    /// Credentials presented during negotiation.
    pub user_credentials: UserCredentials,
}

impl ConnectionId {
    #[must_use]
    pub fn new(
        remote: SocketAddr,
        service_name: impl Into<String>,
        user_credentials: UserCredentials,
    ) -> Self {
        Self {
            remote,
            service_name: service_name.into(),
            user_credentials,
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} as {}",
            self.remote, self.service_name, self.user_credentials
        )
    }
}

/// Credentials a client presents in the negotiation context exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserCredentials {
    real_user: String,
}

impl UserCredentials {
    #[must_use]
    pub fn new(real_user: impl Into<String>) -> Self {
        Self {
            real_user: real_user.into(),
        }
    }

    #[must_use]
    pub fn real_user(&self) -> &str {
        &self.real_user
    }
}

impl Default for UserCredentials {
    fn default() -> Self {
        Self::new("anonymous")
    }
}

impl fmt::Display for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.real_user)
    }
}

/// Which side of the transport created the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// Outbound: created by `find_or_start_connection` for a caller.
    Client,
    /// Inbound: handed over by an acceptor thread.
    Server,
}

#[derive(Debug)]
enum ConnectionLifecycle {
    Negotiating,
    Ready,
    Shutdown(RpcError),
}

/// Where the socket currently lives.
#[derive(Debug)]
enum ConnectionSocket {
    /// Owned here, not yet negotiated or registered.
    Pending(StdTcpStream),
    /// Detached into the negotiation pool.
    Negotiating,
    /// Registered (or about to be) with the reactor's poll.
    Attached(TcpStream),
    Closed,
}

/// Result of draining one readable event.
#[derive(Debug, Default)]
pub(crate) struct ReadOutcome {
    /// Requests decoded off a server-side connection, in arrival order.
    pub(crate) inbound_calls: Vec<InboundCall>,
    /// Fatal connection status, if the read hit one.
    pub(crate) status: Option<RpcError>,
}

#[derive(Debug)]
pub struct Connection {
    direction: ConnectionDirection,
    remote: SocketAddr,
    token: Token,
    socket: ConnectionSocket,
    service_name: String,
    user_credentials: UserCredentials,
    lifecycle: ConnectionLifecycle,
    interest: Interest,
    last_activity: Instant,
    next_call_id: CallId,
    pending_calls: VecDeque<(OutboundCall, Instant)>,
    awaiting_response: HashMap<CallId, (OutboundCall, Instant)>,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
}

impl Connection {
    pub(crate) fn outbound(
        remote: SocketAddr,
        socket: StdTcpStream,
        token: Token,
        service_name: String,
        user_credentials: UserCredentials,
        now: Instant,
    ) -> Self {
        Self::new(
            ConnectionDirection::Client,
            remote,
            socket,
            token,
            service_name,
            user_credentials,
            now,
        )
    }

    pub(crate) fn inbound(remote: SocketAddr, socket: StdTcpStream, now: Instant) -> Self {
        // Service name and credentials arrive with the peer's context exchange.
        Self::new(
            ConnectionDirection::Server,
            remote,
            socket,
            UNREGISTERED_TOKEN,
            String::new(),
            UserCredentials::default(),
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        direction: ConnectionDirection,
        remote: SocketAddr,
        socket: StdTcpStream,
        token: Token,
        service_name: String,
        user_credentials: UserCredentials,
        now: Instant,
    ) -> Self {
        Self {
            direction,
            remote,
            token,
            socket: ConnectionSocket::Pending(socket),
            service_name,
            user_credentials,
            lifecycle: ConnectionLifecycle::Negotiating,
            interest: Interest::READABLE,
            last_activity: now,
            next_call_id: FIRST_CALL_ID,
            pending_calls: VecDeque::new(),
            awaiting_response: HashMap::new(),
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
        }
    }

    #[must_use]
    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[must_use]
    pub fn user_credentials(&self) -> &UserCredentials {
        &self.user_credentials
    }

    /// Rebuilds the identity tuple this connection was keyed under.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        ConnectionId::new(
            self.remote,
            self.service_name.clone(),
            self.user_credentials.clone(),
        )
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn set_token(&mut self, token: Token) {
        self.token = token;
    }

    /// Timestamp of the last byte moved in either direction.
    #[must_use]
    pub fn last_activity_time(&self) -> Instant {
        self.last_activity
    }

    /// True when nothing is outstanding: no queued or in-flight calls, no
    /// buffered bytes, and no negotiation in progress.
    #[must_use]
    pub fn idle(&self) -> bool {
        !matches!(self.lifecycle, ConnectionLifecycle::Negotiating)
            && self.pending_calls.is_empty()
            && self.awaiting_response.is_empty()
            && self.write_buffer.is_empty()
            && self.read_buffer.is_empty()
    }

    pub(crate) fn shutdown_status(&self) -> Option<&RpcError> {
        match &self.lifecycle {
            ConnectionLifecycle::Shutdown(status) => Some(status),
            _ => None,
        }
    }

    /// Hands the socket to the negotiation pool, switched to blocking mode.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::IllegalState` when the socket already left this
    /// connection, `RpcError::Io` when the blocking-mode switch fails. In both
    /// cases the caller is expected to destroy the connection.
    pub(crate) fn detach_socket_for_negotiation(&mut self) -> RpcResult<StdTcpStream> {
        let socket = match mem::replace(&mut self.socket, ConnectionSocket::Negotiating) {
            ConnectionSocket::Pending(socket) => socket,
            other => {
                self.socket = other;
                return Err(RpcError::IllegalState(
                    "connection socket is not available for negotiation",
                ));
            }
        };
        socket.set_nonblocking(false).map_err(|error| {
            RpcError::Io(format!("switch socket to blocking mode failed: {error}"))
        })?;
        Ok(socket)
    }

    /// Takes the socket back from a completed negotiation, restoring
    /// non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Io` when the non-blocking switch fails; the fatal-log
    /// destroy path in the reactor handles that.
    pub(crate) fn reattach_socket(&mut self, socket: StdTcpStream) -> RpcResult<()> {
        socket.set_nonblocking(true).map_err(|error| {
            RpcError::Io(format!("switch socket to non-blocking mode failed: {error}"))
        })?;
        self.socket = ConnectionSocket::Attached(TcpStream::from_std(socket));
        Ok(())
    }

    /// Adopts the service name and credentials learned in the context
    /// exchange. Only server-side connections start without them.
    pub(crate) fn adopt_negotiated_context(&mut self, context: NegotiatedContext) {
        self.service_name = context.service_name;
        self.user_credentials = context.user_credentials;
    }

    pub(crate) fn mark_negotiation_complete(&mut self) {
        if matches!(self.lifecycle, ConnectionLifecycle::Negotiating) {
            self.lifecycle = ConnectionLifecycle::Ready;
        }
    }

    /// Registers the reattached socket with the owning reactor's poll.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::IllegalState` without a socket, `RpcError::Io` when
    /// poll registration fails.
    pub(crate) fn register_with_poll(&mut self, registry: &Registry) -> RpcResult<()> {
        let token = self.token;
        let mut interest = Interest::READABLE;
        if !self.write_buffer.is_empty() {
            interest |= Interest::WRITABLE;
        }
        let ConnectionSocket::Attached(socket) = &mut self.socket else {
            return Err(RpcError::IllegalState("connection has no socket to register"));
        };
        registry
            .register(socket, token, interest)
            .map_err(|error| RpcError::Io(format!("register connection in poll failed: {error}")))?;
        self.interest = interest;
        Ok(())
    }

    /// Queues one outbound call. Ready connections serialize it immediately,
    /// negotiating ones park it, shut-down ones fail it with their terminal
    /// status. A returned error is fatal for the connection.
    pub(crate) fn queue_outbound_call(
        &mut self,
        call: OutboundCall,
        deadline: Instant,
        registry: &Registry,
    ) -> Option<RpcError> {
        match &self.lifecycle {
            ConnectionLifecycle::Shutdown(status) => {
                let status = status.clone();
                call.fail(status);
                None
            }
            ConnectionLifecycle::Negotiating => {
                self.pending_calls.push_back((call, deadline));
                None
            }
            ConnectionLifecycle::Ready => {
                self.send_call(call, deadline);
                if let Some(status) = self.handle_write(Instant::now()) {
                    return Some(status);
                }
                self.refresh_interest(registry).err()
            }
        }
    }

    /// Serializes every call parked during negotiation. A returned error is
    /// fatal for the connection.
    pub(crate) fn flush_pending_calls(&mut self, registry: &Registry) -> Option<RpcError> {
        while let Some((call, deadline)) = self.pending_calls.pop_front() {
            self.send_call(call, deadline);
        }
        if let Some(status) = self.handle_write(Instant::now()) {
            return Some(status);
        }
        self.refresh_interest(registry).err()
    }

    fn send_call(&mut self, call: OutboundCall, deadline: Instant) {
        let call_id = self.next_call_id;
        self.next_call_id = self.next_call_id.saturating_add(1);
        match frame::encode_request(&mut self.write_buffer, call_id, call.method(), call.payload())
        {
            Ok(()) => {
                let _ = self.awaiting_response.insert(call_id, (call, deadline));
            }
            Err(error) => call.fail(error),
        }
    }

    /// Queues an error response for a rejected inbound call. A returned error
    /// is fatal for the connection.
    pub(crate) fn queue_error_response(
        &mut self,
        call_id: CallId,
        message: &str,
        registry: &Registry,
    ) -> Option<RpcError> {
        if self.shutdown_status().is_some() {
            return None;
        }
        if let Err(error) = frame::encode_response_error(&mut self.write_buffer, call_id, message) {
            return Some(error);
        }
        if let Some(status) = self.handle_write(Instant::now()) {
            return Some(status);
        }
        self.refresh_interest(registry).err()
    }

    /// Drains readable bytes and decodes completed frames.
    pub(crate) fn handle_read(&mut self, now: Instant) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        let mut eof = false;
        {
            let ConnectionSocket::Attached(socket) = &mut self.socket else {
                return outcome;
            };
            let mut chunk = [0_u8; READ_CHUNK_BYTES];
            loop {
                match socket.read(&mut chunk) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(read_len) => {
                        self.last_activity = now;
                        self.read_buffer.extend_from_slice(&chunk[..read_len]);
                    }
                    Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                    Err(error) if error.kind() == ErrorKind::Interrupted => {}
                    Err(error) => {
                        outcome.status =
                            Some(RpcError::Network(format!("read from remote failed: {error}")));
                        break;
                    }
                }
            }
        }

        while outcome.status.is_none() {
            match frame::decode_frame(&mut self.read_buffer) {
                Ok(Some(frame)) => self.process_frame(frame, &mut outcome),
                Ok(None) => break,
                Err(error) => outcome.status = Some(error),
            }
        }
        if eof && outcome.status.is_none() {
            outcome.status = Some(RpcError::Network("got EOF from remote".to_owned()));
        }
        outcome
    }

    fn process_frame(&mut self, frame: Frame, outcome: &mut ReadOutcome) {
        match (self.direction, frame) {
            (
                ConnectionDirection::Server,
                Frame::Request {
                    call_id,
                    method,
                    payload,
                },
            ) => {
                outcome.inbound_calls.push(InboundCall {
                    call_id,
                    method,
                    payload,
                    remote: self.remote,
                });
            }
            (ConnectionDirection::Client, Frame::ResponseOk { call_id, payload }) => {
                match self.awaiting_response.remove(&call_id) {
                    Some((call, _)) => call.respond(payload),
                    None => debug!(call_id, "response for an unknown or expired call"),
                }
            }
            (ConnectionDirection::Client, Frame::ResponseError { call_id, message }) => {
                match self.awaiting_response.remove(&call_id) {
                    Some((call, _)) => call.fail(RpcError::ServiceUnavailable(message)),
                    None => debug!(call_id, "error response for an unknown or expired call"),
                }
            }
            (ConnectionDirection::Server, _) => {
                outcome.status = Some(RpcError::Network(
                    "unexpected response frame from client".to_owned(),
                ));
            }
            (ConnectionDirection::Client, Frame::Request { .. }) => {
                outcome.status = Some(RpcError::Network(
                    "unexpected request frame from server".to_owned(),
                ));
            }
        }
    }

    /// Flushes buffered writes until the socket would block. A returned error
    /// is fatal for the connection.
    pub(crate) fn handle_write(&mut self, now: Instant) -> Option<RpcError> {
        let ConnectionSocket::Attached(socket) = &mut self.socket else {
            return None;
        };
        while !self.write_buffer.is_empty() {
            match socket.write(self.write_buffer.as_slice()) {
                Ok(0) => {
                    return Some(RpcError::Network(
                        "peer stopped accepting writes".to_owned(),
                    ));
                }
                Ok(written) => {
                    self.last_activity = now;
                    let _ = self.write_buffer.drain(..written);
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => return None,
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => {
                    return Some(RpcError::Network(format!("write to remote failed: {error}")));
                }
            }
        }
        None
    }

    /// Re-arms poll interest to match the buffered state.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Io` when re-registration fails; fatal for the
    /// connection.
    pub(crate) fn refresh_interest(&mut self, registry: &Registry) -> RpcResult<()> {
        let mut next_interest = Interest::READABLE;
        if !self.write_buffer.is_empty() {
            next_interest |= Interest::WRITABLE;
        }
        if next_interest == self.interest {
            return Ok(());
        }
        let token = self.token;
        let ConnectionSocket::Attached(socket) = &mut self.socket else {
            return Ok(());
        };
        registry
            .reregister(socket, token, next_interest)
            .map_err(|error| {
                RpcError::Io(format!("refresh connection poll interest failed: {error}"))
            })?;
        self.interest = next_interest;
        Ok(())
    }

    /// Fails every queued or in-flight call whose deadline has passed.
    pub(crate) fn expire_calls(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.pending_calls.len() {
            if self.pending_calls[index].1 <= now {
                if let Some((call, _)) = self.pending_calls.remove(index) {
                    let message = format!("{} timed out before the connection was ready", call.method());
                    call.fail(RpcError::TimedOut(message));
                }
            } else {
                index += 1;
            }
        }

        let expired = self
            .awaiting_response
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(call_id, _)| *call_id)
            .collect::<Vec<_>>();
        for call_id in expired {
            if let Some((call, _)) = self.awaiting_response.remove(&call_id) {
                let message = format!("{} timed out awaiting response", call.method());
                call.fail(RpcError::TimedOut(message));
            }
        }
    }

    /// Tears the connection down exactly once. Queued and in-flight calls fail
    /// with `status`; later calls queued onto this connection fail with the
    /// same status. Repeat invocations are no-ops.
    pub(crate) fn shutdown(&mut self, registry: &Registry, status: RpcError) {
        if matches!(self.lifecycle, ConnectionLifecycle::Shutdown(_)) {
            return;
        }
        debug!(remote = %self.remote, direction = ?self.direction, %status, "shutting down connection");
        for (call, _) in self.pending_calls.drain(..) {
            call.fail(status.clone());
        }
        for (_, (call, _)) in self.awaiting_response.drain() {
            call.fail(status.clone());
        }
        if let ConnectionSocket::Attached(mut socket) =
            mem::replace(&mut self.socket, ConnectionSocket::Closed)
        {
            let _ = registry.deregister(&mut socket);
        }
        self.lifecycle = ConnectionLifecycle::Shutdown(status);
    }
}

/// Recovers the std stream from a mio one without touching file-descriptor
/// flags; used when a socket needs to run in blocking mode off-loop.
pub(crate) fn mio_stream_into_std(stream: TcpStream) -> StdTcpStream {
    let owned: OwnedFd = stream.into();
    owned.into()
}
