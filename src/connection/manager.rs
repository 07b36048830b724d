//! The client's event loop.
//!
//! One [`ConnectionManager`] task per client owns the connection state, every
//! channel machine, the publish queues and all timers. Handles talk to it
//! with [`Command`]s; credential fetches and transport opens run as spawned
//! tasks that report back on an internal channel, tagged with the connection
//! attempt (`epoch`) they belong to so stale results are dropped.
//!
//! Everything that mutates state or emits events runs on this task, so
//! emissions never interleave and no state is shared mutably with handles
//! except the published snapshots.
//!
//! Rust guideline compliant 2026-02

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::auth::{check_asserted_client_id, now_ms, Auth, TokenDetails, TokenParams, WILDCARD_CLIENT_ID};
use crate::channel::machine::{ChannelCtx, ChannelMachine, Outbound, Reply};
use crate::channel::{ChannelShared, ChannelState};
use crate::config::ClientOptions;
use crate::constants::{AGENT, DEFAULT_MAX_IDLE_INTERVAL, PROTOCOL_VERSION};
use crate::encoding::EncoderPipeline;
use crate::error::{codes, Error, ErrorInfo, Result};
use crate::message::{Message, PresenceMessage};
use crate::protocol::{Action, AuthDetails, ConnectionDetails, ProtocolMessage};
use crate::transport::{ConnectParams, Transport, TransportEvent, TransportLink};

use super::{ConnectionEvent, ConnectionShared, ConnectionState, ConnectionStateChange};

/// Request from a handle to the event loop.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Close {
        reply: Reply<()>,
    },
    Ping {
        reply: Reply<Duration>,
    },
    Authorise {
        params: Option<TokenParams>,
        force: bool,
        reply: Reply<TokenDetails>,
    },
    Attach {
        channel: String,
        reply: Reply<()>,
    },
    Detach {
        channel: String,
        reply: Reply<()>,
    },
    Publish {
        channel: String,
        messages: Vec<Message>,
        reply: Reply<()>,
    },
    PresenceAction {
        channel: String,
        message: PresenceMessage,
        reply: Reply<()>,
    },
    PresenceGet {
        channel: String,
        reply: Reply<Vec<PresenceMessage>>,
    },
    RegisterChannel {
        shared: Arc<ChannelShared>,
    },
    /// Only the machine registered with this `shared` is released.
    ReleaseChannel {
        shared: Arc<ChannelShared>,
        reply: Reply<()>,
    },
}

/// Send a command and wait for its reply.
///
/// Fails with [`Error::Closed`] when the event loop is gone.
pub(crate) async fn request<T>(
    commands: &mpsc::UnboundedSender<Command>,
    make: impl FnOnce(Reply<T>) -> Command,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    commands.send(make(tx)).map_err(|_| Error::Closed)?;
    rx.await.map_err(|_| Error::Closed)?
}

/// Completion of a spawned task.
#[derive(Debug)]
enum Internal {
    Token {
        epoch: u64,
        result: Result<Option<TokenDetails>>,
    },
    Transport {
        epoch: u64,
        result: Result<TransportLink>,
    },
    Authorised {
        force: bool,
        result: Result<TokenDetails>,
        reply: Option<Reply<TokenDetails>>,
    },
}

/// Why the loop woke up.
#[derive(Debug)]
enum Wake {
    Command(Option<Command>),
    Internal(Option<Internal>),
    Transport(TransportEvent),
    Deadline,
}

/// Publish or presence frame waiting for a serial or an ACK.
#[derive(Debug)]
struct Outstanding {
    frame: ProtocolMessage,
    reply: Reply<()>,
}

#[derive(Debug)]
struct PingWaiter {
    id: String,
    sent: Instant,
    deadline: Instant,
    reply: Reply<Duration>,
}

/// Re-authentication waiting for the service to confirm the new token.
#[derive(Debug)]
struct AuthWaiter {
    /// Set while waiting for an in-band CONNECTED update.
    deadline: Option<Instant>,
    token: TokenDetails,
    reply: Option<Reply<TokenDetails>>,
}

/// Owner of connection and channel state. See the module docs.
#[derive(Debug)]
pub(crate) struct ConnectionManager {
    options: ClientOptions,
    auth: Auth,
    transport: Arc<dyn Transport>,
    pipeline: Arc<EncoderPipeline>,
    shared: Arc<ConnectionShared>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,

    state: ConnectionState,
    error_reason: Option<ErrorInfo>,
    /// Current connection attempt. Results from older attempts are dropped.
    epoch: u64,
    link: Option<TransportLink>,
    connection_id: Option<String>,
    connection_key: Option<String>,
    details: Option<ConnectionDetails>,

    msg_serial: u64,
    /// Sent, awaiting ACK, in serial order.
    pending: VecDeque<(u64, Outstanding)>,
    /// Not yet sent, in submission order across all channels.
    queued: VecDeque<Outstanding>,

    channels: HashMap<String, ChannelMachine>,

    /// Consecutive failed connection attempts.
    retry_count: u32,
    token_renewal_attempted: bool,
    retry_at: Option<Instant>,
    connect_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    close_deadline: Option<Instant>,

    next_ping: u64,
    pings: Vec<PingWaiter>,
    close_waiters: Vec<Reply<()>>,
    auth_waiters: Vec<AuthWaiter>,
}

impl ConnectionManager {
    pub(crate) fn new(
        options: ClientOptions,
        auth: Auth,
        transport: Arc<dyn Transport>,
        shared: Arc<ConnectionShared>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(EncoderPipeline::standard(options.max_encoding_length));
        Self {
            options,
            auth,
            transport,
            pipeline,
            shared,
            commands,
            internal_tx,
            internal_rx,
            state: ConnectionState::Initialized,
            error_reason: None,
            epoch: 0,
            link: None,
            connection_id: None,
            connection_key: None,
            details: None,
            msg_serial: 0,
            pending: VecDeque::new(),
            queued: VecDeque::new(),
            channels: HashMap::new(),
            retry_count: 0,
            token_renewal_attempted: false,
            retry_at: None,
            connect_deadline: None,
            idle_deadline: None,
            close_deadline: None,
            next_ping: 0,
            pings: Vec::new(),
            close_waiters: Vec::new(),
            auth_waiters: Vec::new(),
        }
    }

    /// Run until every handle is dropped.
    pub(crate) async fn run(mut self) {
        log::debug!("[Connection] Event loop started");
        loop {
            let deadline = self.next_deadline();
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                event = self.internal_rx.recv() => Wake::Internal(event),
                event = recv_link(&mut self.link) => Wake::Transport(event),
                () = sleep_until_opt(deadline) => Wake::Deadline,
            };
            match wake {
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Command(None) => break,
                Wake::Internal(Some(event)) => self.handle_internal(event),
                Wake::Internal(None) => {}
                Wake::Transport(event) => self.handle_transport(event),
                Wake::Deadline => self.handle_deadlines(),
            }
        }
        log::debug!("[Connection] All handles dropped, stopping event loop");
        self.teardown();
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Close { reply } => self.close(reply),
            Command::Ping { reply } => self.ping(reply),
            Command::Authorise {
                params,
                force,
                reply,
            } => self.spawn_authorise(params, force, Some(reply)),
            Command::Attach { channel, reply } => {
                if let Err(reply) = self.with_channel(&channel, reply, |m, reply, ctx| m.attach(reply, ctx)) {
                    let _ = reply.send(Err(released(&channel)));
                }
            }
            Command::Detach { channel, reply } => {
                if let Err(reply) = self.with_channel(&channel, reply, |m, reply, ctx| m.detach(reply, ctx)) {
                    let _ = reply.send(Err(released(&channel)));
                }
            }
            Command::Publish {
                channel,
                messages,
                reply,
            } => self.publish(&channel, messages, reply),
            Command::PresenceAction {
                channel,
                message,
                reply,
            } => self.presence_action(&channel, message, reply),
            Command::PresenceGet { channel, reply } => {
                if let Err(reply) =
                    self.with_channel(&channel, reply, |m, reply, ctx| m.presence_get(reply, ctx))
                {
                    let _ = reply.send(Err(released(&channel)));
                }
            }
            Command::RegisterChannel { shared } => {
                log::debug!("[Connection] Registering channel '{}'", shared.name);
                // A handle re-created while a release is in flight supersedes
                // the old machine.
                let name = shared.name.clone();
                if let Some(mut old) = self.channels.insert(name.clone(), ChannelMachine::new(shared)) {
                    log::debug!("[Connection] Replacing released machine for '{}'", name);
                    old.release();
                }
            }
            Command::ReleaseChannel { shared, reply } => {
                let channel = shared.name.clone();
                let current = self
                    .channels
                    .get(&channel)
                    .is_some_and(|m| Arc::ptr_eq(m.shared(), &shared));
                if current {
                    if let Some(mut machine) = self.channels.remove(&channel) {
                        machine.release();
                        self.fail_queued_for(&channel, &released(&channel));
                        log::debug!("[Connection] Released channel '{}'", channel);
                    }
                }
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn connect(&mut self) {
        match self.state {
            ConnectionState::Initialized
            | ConnectionState::Disconnected
            | ConnectionState::Suspended
            | ConnectionState::Closed => self.start_connecting(None),
            state => log::debug!("[Connection] connect() ignored while {}", state),
        }
    }

    fn close(&mut self, reply: Reply<()>) {
        match self.state {
            ConnectionState::Connected => {
                log::info!("[Connection] Closing");
                self.send_frame(ProtocolMessage::new(Action::Close));
                self.close_waiters.push(reply);
                self.set_state(ConnectionState::Closing, None, None);
                self.close_deadline = Some(Instant::now() + self.options.realtime_request_timeout);
            }
            ConnectionState::Closing => self.close_waiters.push(reply),
            ConnectionState::Closed | ConnectionState::Failed => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Initialized
            | ConnectionState::Connecting
            | ConnectionState::Disconnected
            | ConnectionState::Suspended => {
                self.abandon_attempt();
                self.set_state(ConnectionState::Closed, None, None);
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn ping(&mut self, reply: Reply<Duration>) {
        if self.state != ConnectionState::Connected {
            let _ = reply.send(Err(Error::InvalidState {
                operation: "ping",
                state: self.state.to_string(),
            }));
            return;
        }
        self.next_ping += 1;
        let id = format!("ping-{}", self.next_ping);
        let mut frame = ProtocolMessage::new(Action::Heartbeat);
        frame.id = Some(id.clone());
        self.send_frame(frame);
        let now = Instant::now();
        self.pings.push(PingWaiter {
            id,
            sent: now,
            deadline: now + self.options.realtime_request_timeout,
            reply,
        });
    }

    fn spawn_authorise(
        &self,
        params: Option<TokenParams>,
        force: bool,
        reply: Option<Reply<TokenDetails>>,
    ) {
        log::info!("[Connection] Re-authorising (force: {})", force);
        let auth = self.auth.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = auth.authorise(params).await;
            let _ = internal.send(Internal::Authorised {
                force,
                result,
                reply,
            });
        });
    }

    fn publish(&mut self, channel: &str, mut messages: Vec<Message>, reply: Reply<()>) {
        let Some(machine) = self.channels.get(channel) else {
            let _ = reply.send(Err(released(channel)));
            return;
        };
        if machine.state() == ChannelState::Failed {
            let info = machine.shared().snapshot().error_reason.clone().unwrap_or_else(|| {
                ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, Some(400), "channel failed")
            });
            let _ = reply.send(Err(Error::Channel {
                channel: channel.to_string(),
                info,
            }));
            return;
        }

        let identity = self.identity();
        let options = machine.shared().options();
        let prepared = messages.iter_mut().try_for_each(|message| {
            check_asserted_client_id(identity.as_deref(), message.client_id.as_deref())?;
            message.encode(&self.pipeline, &options)?;
            Ok::<_, Error>(())
        });
        if let Err(e) = prepared {
            log::warn!("[Connection] Rejected publish on '{}': {}", channel, e);
            let _ = reply.send(Err(e));
            return;
        }

        let mut frame = ProtocolMessage::for_channel(Action::Message, channel);
        frame.messages = Some(messages);
        self.submit(Outstanding { frame, reply });
    }

    fn presence_action(&mut self, channel: &str, mut message: PresenceMessage, reply: Reply<()>) {
        let identity = self.identity();
        let resolved = match message.client_id.as_deref() {
            None => match identity.as_deref() {
                Some(id) if id != WILDCARD_CLIENT_ID => Ok(id.to_string()),
                _ => Err(Error::InvalidArgument(
                    "presence requires a concrete client id".to_string(),
                )),
            },
            Some(asserted) => check_asserted_client_id(identity.as_deref(), Some(asserted))
                .map(|()| asserted.to_string()),
        };
        let client_id = match resolved {
            Ok(id) => id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        message.client_id = Some(client_id);

        let Some(options) = self.channels.get(channel).map(|m| m.shared().options()) else {
            let _ = reply.send(Err(released(channel)));
            return;
        };
        if let Err(e) = message.encode(&self.pipeline, &options) {
            let _ = reply.send(Err(e.into()));
            return;
        }

        if let Err(reply) = self.with_channel(channel, reply, |m, reply, ctx| {
            m.presence_action(message, reply, ctx);
        }) {
            let _ = reply.send(Err(released(channel)));
        }
    }

    /// Identity messages are checked against: configured, token or connection.
    fn identity(&self) -> Option<String> {
        self.auth
            .client_id()
            .or_else(|| self.details.as_ref().and_then(|d| d.client_id.clone()))
    }

    // ========================================================================
    // Publish queue
    // ========================================================================

    fn submit(&mut self, outstanding: Outstanding) {
        match self.state {
            ConnectionState::Connected => self.transmit(outstanding),
            ConnectionState::Initialized
            | ConnectionState::Connecting
            | ConnectionState::Disconnected => {
                if !self.options.queue_messages {
                    let _ = outstanding.reply.send(Err(Error::InvalidState {
                        operation: "publish",
                        state: self.state.to_string(),
                    }));
                    return;
                }
                self.queued.push_back(outstanding);
                if self.state == ConnectionState::Initialized && self.options.auto_connect {
                    self.start_connecting(None);
                }
            }
            ConnectionState::Suspended
            | ConnectionState::Closing
            | ConnectionState::Closed
            | ConnectionState::Failed => {
                let _ = outstanding.reply.send(Err(self.unavailable_error()));
            }
        }
    }

    fn transmit(&mut self, mut outstanding: Outstanding) {
        let serial = self.msg_serial;
        self.msg_serial += 1;
        outstanding.frame.msg_serial = Some(serial);
        self.send_frame(outstanding.frame.clone());
        self.pending.push_back((serial, outstanding));
    }

    fn flush_queued(&mut self) {
        if !self.queued.is_empty() {
            log::debug!("[Connection] Flushing {} queued frame(s)", self.queued.len());
        }
        while let Some(outstanding) = self.queued.pop_front() {
            self.transmit(outstanding);
        }
    }

    fn on_ack(&mut self, frame: &ProtocolMessage) {
        let serial = frame.msg_serial.unwrap_or(0);
        let Some(end) = serial.checked_add(u64::from(frame.count.unwrap_or(1))) else {
            log::warn!(
                "[Connection] Ignoring {:?} with out-of-range serial {} (count {:?})",
                frame.action,
                serial,
                frame.count
            );
            return;
        };
        while self.pending.front().is_some_and(|(s, _)| *s < end) {
            let Some((_, outstanding)) = self.pending.pop_front() else {
                break;
            };
            let result = if frame.action == Action::Ack {
                Ok(())
            } else {
                let info = frame.error.clone().unwrap_or_else(|| {
                    ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, Some(400), "publish rejected")
                });
                Err(Error::Channel {
                    channel: outstanding.frame.channel.clone().unwrap_or_default(),
                    info,
                })
            };
            let _ = outstanding.reply.send(result);
        }
    }

    fn fail_publishes(&mut self, err: &Error) {
        for outstanding in self.queued.drain(..) {
            let _ = outstanding.reply.send(Err(err.clone()));
        }
        for (_, outstanding) in self.pending.drain(..) {
            let _ = outstanding.reply.send(Err(err.clone()));
        }
    }

    fn fail_queued_for(&mut self, channel: &str, err: &Error) {
        let (failed, kept): (VecDeque<_>, VecDeque<_>) = self
            .queued
            .drain(..)
            .partition(|o| o.frame.channel.as_deref() == Some(channel));
        self.queued = kept;
        for outstanding in failed {
            let _ = outstanding.reply.send(Err(err.clone()));
        }
    }

    fn unavailable_error(&self) -> Error {
        let info = match self.state {
            ConnectionState::Suspended => {
                ErrorInfo::new(codes::CONNECTION_SUSPENDED, Some(400), "connection suspended")
            }
            ConnectionState::Failed => self.error_reason.clone().unwrap_or_else(|| {
                ErrorInfo::new(codes::CONNECTION_FAILED, Some(400), "connection failed")
            }),
            _ => ErrorInfo::new(codes::CONNECTION_CLOSED, Some(400), "connection closed"),
        };
        Error::Connection(info)
    }

    // ========================================================================
    // Connection attempts
    // ========================================================================

    fn start_connecting(&mut self, reason: Option<ErrorInfo>) {
        self.abandon_attempt();
        self.connect_deadline = Some(Instant::now() + self.options.realtime_request_timeout);
        self.set_state(ConnectionState::Connecting, reason, None);

        let epoch = self.epoch;
        let auth = self.auth.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = auth.ensure_token().await;
            let _ = internal.send(Internal::Token { epoch, result });
        });
    }

    /// Drop the transport and invalidate in-flight attempt tasks.
    fn abandon_attempt(&mut self) {
        self.teardown();
        self.epoch += 1;
        self.retry_at = None;
        self.connect_deadline = None;
    }

    fn teardown(&mut self) {
        if self.link.take().is_some() {
            log::debug!("[Connection] Transport dropped");
        }
        self.idle_deadline = None;
    }

    fn connect_params(&self, token: Option<&TokenDetails>) -> ConnectParams {
        let mut query = Vec::new();
        match (token, self.auth.key()) {
            (Some(token), _) => query.push(("access_token".to_string(), token.token.clone())),
            (None, Some(key)) => query.push(("key".to_string(), key)),
            (None, None) => {}
        }
        query.push(("format".to_string(), "json".to_string()));
        query.push(("v".to_string(), PROTOCOL_VERSION.to_string()));
        query.push(("agent".to_string(), AGENT.to_string()));
        query.push(("heartbeats".to_string(), "true".to_string()));
        if !self.options.echo_messages {
            query.push(("echo".to_string(), "false".to_string()));
        }
        if let Some(key) = &self.connection_key {
            query.push(("resume".to_string(), key.clone()));
        }
        if token.is_none() {
            if let Some(client_id) = &self.options.client_id {
                query.push(("clientId".to_string(), client_id.clone()));
            }
        }
        ConnectParams {
            url: self.options.realtime_url(),
            query,
        }
    }

    fn attempt_failed(&mut self, reason: ErrorInfo) {
        self.abandon_attempt();
        self.retry_count += 1;
        if self.retry_count >= self.options.disconnected_retry_limit {
            let delay = self.options.suspended_retry_timeout;
            log::warn!("[Connection] Connection suspended after {} attempts: {}", self.retry_count, reason);
            self.connection_key = None;
            self.set_state(ConnectionState::Suspended, Some(reason), Some(delay));
            self.retry_at = Some(Instant::now() + delay);
        } else {
            let delay = retry_delay(self.options.disconnected_retry_timeout, self.retry_count);
            log::info!("[Connection] Attempt {} failed ({}), retrying in {:?}", self.retry_count, reason, delay);
            self.set_state(ConnectionState::Disconnected, Some(reason), Some(delay));
            self.retry_at = Some(Instant::now() + delay);
        }
    }

    /// The transport went away or the service disconnected us.
    fn connection_lost(&mut self, reason: ErrorInfo) {
        match self.state {
            ConnectionState::Connected => {
                log::info!("[Connection] Disconnected: {}", reason);
                self.abandon_attempt();
                self.set_state(ConnectionState::Disconnected, Some(reason), Some(Duration::ZERO));
                self.retry_at = Some(Instant::now());
            }
            ConnectionState::Connecting => self.attempt_failed(reason),
            ConnectionState::Closing => self.finish_close(),
            _ => self.teardown(),
        }
    }

    fn fail(&mut self, reason: ErrorInfo) {
        log::error!("[Connection] Connection failed: {}", reason);
        self.abandon_attempt();
        self.set_state(ConnectionState::Failed, Some(reason), None);
    }

    fn finish_close(&mut self) {
        self.abandon_attempt();
        self.close_deadline = None;
        self.set_state(ConnectionState::Closed, None, None);
    }

    fn on_token_error(&mut self, reason: ErrorInfo) {
        if self.auth.can_renew() && !self.token_renewal_attempted {
            log::info!("[Connection] Token rejected ({}), renewing", reason);
            self.token_renewal_attempted = true;
            self.auth.invalidate_token();
            self.start_connecting(Some(reason));
        } else {
            self.fail(reason);
        }
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    fn set_state(
        &mut self,
        current: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
    ) {
        let previous = self.state;
        self.state = current;
        if reason.is_some() {
            self.error_reason.clone_from(&reason);
        }
        if matches!(current, ConnectionState::Closed | ConnectionState::Failed) {
            self.connection_id = None;
            self.connection_key = None;
            self.details = None;
            self.msg_serial = 0;
            self.retry_count = 0;
        }

        if previous == ConnectionState::Connected && current != ConnectionState::Connected {
            if current == ConnectionState::Closing {
                self.for_each_channel(ChannelMachine::on_connection_closed);
            } else {
                self.for_each_channel(ChannelMachine::on_connection_interrupted);
            }
            let lost = Error::Connection(reason.clone().unwrap_or_else(|| {
                ErrorInfo::new(codes::DISCONNECTED, Some(400), "connection lost")
            }));
            for ping in self.pings.drain(..) {
                let _ = ping.reply.send(Err(lost.clone()));
            }
            // In-band re-authentication now completes on the next CONNECTED.
            for waiter in &mut self.auth_waiters {
                waiter.deadline = None;
            }
        }

        {
            let mut snapshot = self.shared.snapshot();
            snapshot.state = current;
            snapshot.id.clone_from(&self.connection_id);
            snapshot.key.clone_from(&self.connection_key);
            snapshot.details.clone_from(&self.details);
            snapshot.error_reason.clone_from(&self.error_reason);
        }
        match &reason {
            Some(reason) => log::info!("[Connection] {} -> {} ({})", previous, current, reason),
            None => log::info!("[Connection] {} -> {}", previous, current),
        }
        let change = ConnectionStateChange {
            previous,
            current,
            event: current.into(),
            reason: reason.clone(),
            retry_in,
        };
        self.shared.emitter.emit(&change.event, &change);

        match current {
            ConnectionState::Connected => self.for_each_channel(ChannelMachine::on_connected),
            ConnectionState::Suspended => {
                let info = reason.unwrap_or_else(|| {
                    ErrorInfo::new(codes::CONNECTION_SUSPENDED, Some(400), "connection suspended")
                });
                self.for_each_channel(|m, ctx| m.on_connection_suspended(info.clone(), ctx));
                let err = Error::Connection(info);
                self.fail_publishes(&err);
                self.fail_auth_waiters(&err);
            }
            ConnectionState::Closed => {
                self.for_each_channel(ChannelMachine::on_connection_closed);
                let err = self.unavailable_error();
                self.fail_publishes(&err);
                self.fail_auth_waiters(&err);
                for waiter in self.close_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            ConnectionState::Failed => {
                let info = reason.unwrap_or_else(|| {
                    ErrorInfo::new(codes::CONNECTION_FAILED, Some(400), "connection failed")
                });
                self.for_each_channel(|m, ctx| m.on_connection_failed(info.clone(), ctx));
                let err = Error::Connection(info);
                self.fail_publishes(&err);
                self.fail_auth_waiters(&err);
                for waiter in self.close_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            _ => {}
        }
    }

    fn emit_update(&self, reason: Option<ErrorInfo>) {
        {
            let mut snapshot = self.shared.snapshot();
            snapshot.details.clone_from(&self.details);
        }
        let change = ConnectionStateChange {
            previous: self.state,
            current: self.state,
            event: ConnectionEvent::Update,
            reason,
            retry_in: None,
        };
        self.shared.emitter.emit(&ConnectionEvent::Update, &change);
    }

    fn fail_auth_waiters(&mut self, err: &Error) {
        for waiter in self.auth_waiters.drain(..) {
            if let Some(reply) = waiter.reply {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }

    // ========================================================================
    // Spawned task results
    // ========================================================================

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Token { epoch, result } => {
                if epoch != self.epoch || self.state != ConnectionState::Connecting {
                    return;
                }
                match result {
                    Ok(token) => {
                        let params = self.connect_params(token.as_ref());
                        let transport = Arc::clone(&self.transport);
                        let internal = self.internal_tx.clone();
                        tokio::spawn(async move {
                            let result = transport.connect(&params).await;
                            let _ = internal.send(Internal::Transport { epoch, result });
                        });
                    }
                    Err(e) if e.is_identity_error() || is_unrecoverable_auth(&e) => self.fail(e.info()),
                    Err(e) => self.attempt_failed(e.info()),
                }
            }
            Internal::Transport { epoch, result } => {
                if epoch != self.epoch || self.state != ConnectionState::Connecting {
                    return;
                }
                match result {
                    Ok(link) => {
                        log::debug!("[Connection] Transport open, awaiting CONNECTED");
                        self.link = Some(link);
                    }
                    Err(e) => self.attempt_failed(e.info()),
                }
            }
            Internal::Authorised {
                force,
                result,
                reply,
            } => self.on_authorised(force, result, reply),
        }
    }

    fn on_authorised(
        &mut self,
        force: bool,
        result: Result<TokenDetails>,
        reply: Option<Reply<TokenDetails>>,
    ) {
        let token = match result {
            Ok(token) => token,
            Err(e) => {
                log::warn!("[Connection] Re-authorisation failed: {}", e);
                if e.is_identity_error() && self.is_active() {
                    self.fail(e.info());
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                return;
            }
        };

        match self.state {
            ConnectionState::Initialized
            | ConnectionState::Closing
            | ConnectionState::Closed
            | ConnectionState::Failed => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(token));
                }
            }
            ConnectionState::Connected => {
                let established = self.details.as_ref().and_then(|d| d.client_id.clone());
                if let Err(e) = check_identity(established.as_deref(), token.client_id.as_deref()) {
                    self.fail(e.info());
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e));
                    }
                    return;
                }
                if force {
                    self.auth_waiters.push(AuthWaiter {
                        deadline: None,
                        token,
                        reply,
                    });
                    self.start_connecting(None);
                } else {
                    let mut frame = ProtocolMessage::new(Action::Auth);
                    frame.auth = Some(AuthDetails {
                        access_token: token.token.clone(),
                    });
                    self.send_frame(frame);
                    self.auth_waiters.push(AuthWaiter {
                        deadline: Some(Instant::now() + self.options.realtime_request_timeout),
                        token,
                        reply,
                    });
                }
            }
            ConnectionState::Connecting
            | ConnectionState::Disconnected
            | ConnectionState::Suspended => {
                self.auth_waiters.push(AuthWaiter {
                    deadline: None,
                    token,
                    reply,
                });
                self.start_connecting(None);
            }
        }
    }

    fn is_active(&self) -> bool {
        !matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed
        )
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => {
                if self.state == ConnectionState::Connected {
                    self.idle_deadline = Some(Instant::now() + self.idle_timeout());
                }
                self.handle_frame(frame);
            }
            TransportEvent::Closed { reason } => {
                self.link = None;
                let reason = reason.unwrap_or_else(|| {
                    ErrorInfo::new(codes::DISCONNECTED, Some(400), "transport closed")
                });
                self.connection_lost(reason);
            }
        }
    }

    fn handle_frame(&mut self, frame: ProtocolMessage) {
        log::trace!("[Connection] << {:?} {:?}", frame.action, frame.channel);
        match frame.action {
            Action::Connected => self.on_connected_frame(frame),
            Action::Disconnected => {
                let reason = frame.error.unwrap_or_else(|| {
                    ErrorInfo::new(codes::DISCONNECTED, Some(400), "disconnected by service")
                });
                if reason.is_token_error() {
                    self.on_token_error(reason);
                } else {
                    self.connection_lost(reason);
                }
            }
            Action::Error if frame.channel.is_some() => self.route_to_channel(frame),
            Action::Error => {
                let reason = frame.error.unwrap_or_else(|| {
                    ErrorInfo::new(codes::CONNECTION_FAILED, Some(400), "connection error")
                });
                if reason.is_token_error() {
                    self.on_token_error(reason);
                } else if reason.status_code.is_some_and(|s| s >= 500) {
                    self.connection_lost(reason);
                } else {
                    self.fail(reason);
                }
            }
            Action::Closed => {
                if self.state == ConnectionState::Closing {
                    self.finish_close();
                } else {
                    log::info!("[Connection] Closed by service");
                    self.abandon_attempt();
                    self.set_state(ConnectionState::Closed, frame.error, None);
                }
            }
            Action::Heartbeat => {
                if let Some(id) = frame.id {
                    if let Some(index) = self.pings.iter().position(|p| p.id == id) {
                        let ping = self.pings.swap_remove(index);
                        let _ = ping.reply.send(Ok(ping.sent.elapsed()));
                    }
                }
            }
            Action::Ack | Action::Nack => self.on_ack(&frame),
            Action::Auth => {
                log::info!("[Connection] Service requested re-authentication");
                self.spawn_authorise(None, false, None);
            }
            Action::Attached
            | Action::Detached
            | Action::Message
            | Action::Presence
            | Action::Sync => self.route_to_channel(frame),
            other => log::debug!("[Connection] Ignoring {:?} frame", other),
        }
    }

    fn on_connected_frame(&mut self, frame: ProtocolMessage) {
        let details = frame.connection_details.clone().unwrap_or_default();
        match self.state {
            ConnectionState::Connecting => {
                let expected = self.auth.client_id();
                if let Err(e) = check_identity(expected.as_deref(), details.client_id.as_deref()) {
                    self.fail(e.info());
                    return;
                }
                let resumed = frame.connection_id.is_some() && frame.connection_id == self.connection_id;
                self.connection_id = frame.connection_id;
                self.connection_key = details.connection_key.clone();
                self.details = Some(details);
                self.retry_count = 0;
                self.token_renewal_attempted = false;
                self.connect_deadline = None;
                self.idle_deadline = Some(Instant::now() + self.idle_timeout());

                if !resumed {
                    self.msg_serial = 0;
                    while let Some((_, outstanding)) = self.pending.pop_back() {
                        self.queued.push_front(outstanding);
                    }
                }
                log::info!(
                    "[Connection] Connected (id: {:?}, resumed: {})",
                    self.connection_id,
                    resumed
                );
                self.set_state(ConnectionState::Connected, frame.error, None);

                if resumed {
                    let resend: Vec<ProtocolMessage> =
                        self.pending.iter().map(|(_, o)| o.frame.clone()).collect();
                    for frame in resend {
                        self.send_frame(frame);
                    }
                }
                self.flush_queued();

                for waiter in self.auth_waiters.drain(..) {
                    if let Some(reply) = waiter.reply {
                        let _ = reply.send(Ok(waiter.token));
                    }
                }
            }
            ConnectionState::Connected => {
                let established = self.details.as_ref().and_then(|d| d.client_id.clone());
                if let Err(e) = check_identity(established.as_deref(), details.client_id.as_deref()) {
                    self.fail(e.info());
                    return;
                }
                if details.connection_key.is_some() {
                    self.connection_key.clone_from(&details.connection_key);
                }
                self.details = Some(details);
                self.emit_update(frame.error);
                for waiter in self.auth_waiters.drain(..) {
                    if let Some(reply) = waiter.reply {
                        let _ = reply.send(Ok(waiter.token));
                    }
                }
            }
            state => log::debug!("[Connection] CONNECTED while {}, ignoring", state),
        }
    }

    fn route_to_channel(&mut self, frame: ProtocolMessage) {
        let Some(name) = frame.channel.clone() else {
            return;
        };
        let mut ctx = self.channel_ctx();
        match self.channels.get_mut(&name) {
            Some(machine) => machine.on_frame(frame, &mut ctx),
            None => log::warn!("[Connection] {:?} for unknown channel '{}'", frame.action, name),
        }
        self.dispatch(ctx.outbox);
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn idle_timeout(&self) -> Duration {
        let idle = self
            .details
            .as_ref()
            .and_then(|d| d.max_idle_interval)
            .map_or(DEFAULT_MAX_IDLE_INTERVAL, Duration::from_millis);
        idle + self.options.realtime_request_timeout
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.retry_at,
            self.connect_deadline,
            self.idle_deadline,
            self.close_deadline,
        ]
        .into_iter()
        .flatten()
        .chain(self.pings.iter().map(|p| p.deadline))
        .chain(self.auth_waiters.iter().filter_map(|w| w.deadline))
        .chain(self.channels.values().filter_map(ChannelMachine::deadline))
        .min()
    }

    fn handle_deadlines(&mut self) {
        let now = Instant::now();

        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
            if matches!(self.state, ConnectionState::Disconnected | ConnectionState::Suspended) {
                self.start_connecting(None);
            }
        }
        if self.connect_deadline.is_some_and(|at| at <= now) {
            self.connect_deadline = None;
            if self.state == ConnectionState::Connecting {
                let timeout = self.options.realtime_request_timeout;
                self.attempt_failed(ErrorInfo::new(
                    codes::TIMEOUT,
                    Some(504),
                    format!("no CONNECTED within {timeout:?}"),
                ));
            }
        }
        if self.idle_deadline.is_some_and(|at| at <= now) {
            self.idle_deadline = None;
            if self.state == ConnectionState::Connected {
                self.connection_lost(ErrorInfo::new(
                    codes::DISCONNECTED,
                    Some(408),
                    "no activity from service",
                ));
            }
        }
        if self.close_deadline.is_some_and(|at| at <= now) {
            self.close_deadline = None;
            if self.state == ConnectionState::Closing {
                log::warn!("[Connection] No CLOSED from service, closing anyway");
                self.finish_close();
            }
        }

        let (expired, waiting): (Vec<_>, Vec<_>) =
            self.pings.drain(..).partition(|p| p.deadline <= now);
        self.pings = waiting;
        for ping in expired {
            let _ = ping.reply.send(Err(Error::Timeout("ping".to_string())));
        }

        let (expired, waiting): (Vec<_>, Vec<_>) = self
            .auth_waiters
            .drain(..)
            .partition(|w| w.deadline.is_some_and(|at| at <= now));
        self.auth_waiters = waiting;
        for waiter in expired {
            if let Some(reply) = waiter.reply {
                let _ = reply.send(Err(Error::Timeout("re-authentication".to_string())));
            }
        }

        self.for_each_channel(|machine, ctx| {
            if machine.deadline().is_some_and(|at| at <= ctx.now) {
                machine.on_timer(ctx);
            }
        });
    }

    // ========================================================================
    // Channel plumbing
    // ========================================================================

    fn channel_ctx(&self) -> ChannelCtx {
        ChannelCtx {
            connection_state: self.state,
            now: Instant::now(),
            now_ms: now_ms(),
            request_timeout: self.options.realtime_request_timeout,
            retry_timeout: self.options.channel_retry_timeout,
            retry_limit: self.options.channel_retry_limit,
            pipeline: Arc::clone(&self.pipeline),
            outbox: Vec::new(),
        }
    }

    /// Run `f` against one channel. Hands `arg` back if the channel is unknown.
    fn with_channel<A>(
        &mut self,
        name: &str,
        arg: A,
        f: impl FnOnce(&mut ChannelMachine, A, &mut ChannelCtx),
    ) -> std::result::Result<(), A> {
        let mut ctx = self.channel_ctx();
        let Some(machine) = self.channels.get_mut(name) else {
            return Err(arg);
        };
        f(machine, arg, &mut ctx);
        self.dispatch(ctx.outbox);
        Ok(())
    }

    fn for_each_channel(&mut self, mut f: impl FnMut(&mut ChannelMachine, &mut ChannelCtx)) {
        let mut ctx = self.channel_ctx();
        for machine in self.channels.values_mut() {
            f(machine, &mut ctx);
        }
        self.dispatch(ctx.outbox);
    }

    fn dispatch(&mut self, outbox: Vec<Outbound>) {
        for out in outbox {
            match out {
                Outbound::Frame(frame) => self.send_frame(frame),
                Outbound::Publish { frame, reply } => self.submit(Outstanding { frame, reply }),
                Outbound::ImplicitConnect => {
                    if self.state == ConnectionState::Initialized {
                        self.start_connecting(None);
                    }
                }
                Outbound::Failed { channel, reason } => {
                    let err = Error::Channel {
                        channel: channel.clone(),
                        info: reason,
                    };
                    self.fail_queued_for(&channel, &err);
                }
            }
        }
    }

    fn send_frame(&self, frame: ProtocolMessage) {
        let Some(link) = &self.link else {
            log::debug!("[Connection] No transport, dropping {:?} frame", frame.action);
            return;
        };
        log::trace!("[Connection] >> {:?} {:?}", frame.action, frame.channel);
        if link.sender.send(frame).is_err() {
            log::debug!("[Connection] Transport gone while sending");
        }
    }
}

/// Reject an identity that contradicts the expected one. Wildcards match anything.
fn check_identity(expected: Option<&str>, actual: Option<&str>) -> Result<()> {
    match (expected, actual) {
        (Some(expected), Some(actual))
            if expected != WILDCARD_CLIENT_ID && actual != WILDCARD_CLIENT_ID && expected != actual =>
        {
            Err(Error::IncompatibleClientId {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
        _ => Ok(()),
    }
}

/// Auth failures no retry can fix.
fn is_unrecoverable_auth(err: &Error) -> bool {
    matches!(
        err.code(),
        codes::NO_MEANS_TO_RENEW | codes::INVALID_CREDENTIALS
    )
}

fn released(channel: &str) -> Error {
    Error::InvalidState {
        operation: "use channel",
        state: format!("'{channel}' released"),
    }
}

/// Delay before retry `attempt` (1-based): the base interval growing to
/// twice the base, with 0.8..=1.0 jitter.
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let factor = (f64::from(attempt + 2) / 3.0).min(2.0);
    let jitter = rand::rng().random_range(0.8..=1.0);
    base.mul_f64(factor * jitter)
}

async fn recv_link(link: &mut Option<TransportLink>) -> TransportEvent {
    match link {
        Some(link) => link
            .events
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed { reason: None }),
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
