//! Per-channel state machine, driven by the connection manager.
//!
//! A [`ChannelMachine`] never touches the transport. Every method takes a
//! [`ChannelCtx`] describing the connection as the manager sees it, and
//! leaves frames and requests for the manager in `ctx.outbox`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::connection::ConnectionState;
use crate::encoding::EncoderPipeline;
use crate::error::{codes, Error, ErrorInfo, Result};
use crate::message::{PresenceAction, PresenceMessage};
use crate::protocol::{flags, Action, ProtocolMessage};

use super::presence::PresenceMap;
use super::{ChannelEvent, ChannelShared, ChannelState, ChannelStateChange};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Work a channel hands back to the connection manager.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Control frame (ATTACH, DETACH). Only produced while CONNECTED.
    Frame(ProtocolMessage),
    /// Frame that needs a serial and an ACK.
    Publish {
        frame: ProtocolMessage,
        reply: Reply<()>,
    },
    /// Start connecting if the connection was never started.
    ImplicitConnect,
    /// The channel entered FAILED; its queued publishes must fail.
    Failed { channel: String, reason: ErrorInfo },
}

/// Connection facts and the outbox for one call into a channel.
#[derive(Debug)]
pub(crate) struct ChannelCtx {
    pub(crate) connection_state: ConnectionState,
    pub(crate) now: Instant,
    pub(crate) now_ms: i64,
    pub(crate) request_timeout: Duration,
    pub(crate) retry_timeout: Duration,
    pub(crate) retry_limit: u32,
    pub(crate) pipeline: Arc<EncoderPipeline>,
    pub(crate) outbox: Vec<Outbound>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    AttachTimeout,
    DetachTimeout { revert_to: ChannelState },
    Retry,
}

#[derive(Debug)]
pub(crate) struct ChannelMachine {
    shared: Arc<ChannelShared>,
    state: ChannelState,
    timer: Option<(Instant, Timer)>,
    /// Consecutive attach timeouts.
    retry_count: u32,
    attach_waiters: Vec<Reply<()>>,
    detach_waiters: Vec<Reply<()>>,
    presence: PresenceMap,
    /// Presence operations held until ATTACHED.
    queued_presence: Vec<(PresenceMessage, Reply<()>)>,
    presence_waiters: Vec<Reply<Vec<PresenceMessage>>>,
}

impl ChannelMachine {
    pub(crate) fn new(shared: Arc<ChannelShared>) -> Self {
        Self {
            shared,
            state: ChannelState::Initialized,
            timer: None,
            retry_count: 0,
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            presence: PresenceMap::default(),
            queued_presence: Vec::new(),
            presence_waiters: Vec::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timer.map(|(at, _)| at)
    }

    // ========================================================================
    // Application requests
    // ========================================================================

    pub(crate) fn attach(&mut self, reply: Reply<()>, ctx: &mut ChannelCtx) {
        match self.state {
            ChannelState::Attached => {
                let _ = reply.send(Ok(()));
            }
            ChannelState::Attaching => self.attach_waiters.push(reply),
            _ => {
                if let Err(e) = attachable(ctx.connection_state) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.attach_waiters.push(reply);
                self.start_attach(None, ctx);
            }
        }
    }

    pub(crate) fn detach(&mut self, reply: Reply<()>, ctx: &mut ChannelCtx) {
        match self.state {
            ChannelState::Initialized | ChannelState::Detached => {
                let _ = reply.send(Ok(()));
            }
            ChannelState::Detaching => self.detach_waiters.push(reply),
            ChannelState::Failed => {
                let _ = reply.send(Err(self.failed_error()));
            }
            ChannelState::Suspended => {
                self.set_state(ChannelState::Detached, None, false, ctx);
                let _ = reply.send(Ok(()));
            }
            ChannelState::Attaching | ChannelState::Attached => {
                self.resolve_attach(&Err(Error::InvalidState {
                    operation: "attach",
                    state: "detach requested".to_string(),
                }));
                if ctx.connection_state == ConnectionState::Connected {
                    let revert_to = self.state;
                    self.set_state(ChannelState::Detaching, None, false, ctx);
                    self.detach_waiters.push(reply);
                    ctx.outbox.push(Outbound::Frame(ProtocolMessage::for_channel(
                        Action::Detach,
                        self.name(),
                    )));
                    self.timer = Some((
                        ctx.now + ctx.request_timeout,
                        Timer::DetachTimeout { revert_to },
                    ));
                } else {
                    self.set_state(ChannelState::Detached, None, false, ctx);
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    /// Route an encoded presence message whose client id is already checked.
    pub(crate) fn presence_action(
        &mut self,
        message: PresenceMessage,
        reply: Reply<()>,
        ctx: &mut ChannelCtx,
    ) {
        match self.state {
            ChannelState::Attached => {
                let mut frame = ProtocolMessage::for_channel(Action::Presence, self.name());
                frame.presence = Some(vec![message]);
                ctx.outbox.push(Outbound::Publish { frame, reply });
            }
            ChannelState::Attaching => self.queued_presence.push((message, reply)),
            ChannelState::Initialized | ChannelState::Detached => {
                if let Err(e) = attachable(ctx.connection_state) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.queued_presence.push((message, reply));
                self.start_attach(None, ctx);
            }
            ChannelState::Failed => {
                let _ = reply.send(Err(self.failed_error()));
            }
            state @ (ChannelState::Detaching | ChannelState::Suspended) => {
                let _ = reply.send(Err(Error::InvalidState {
                    operation: "update presence",
                    state: state.to_string(),
                }));
            }
        }
    }

    pub(crate) fn presence_get(&mut self, reply: Reply<Vec<PresenceMessage>>, ctx: &mut ChannelCtx) {
        match self.state {
            ChannelState::Attached if !self.presence.is_syncing() => {
                let _ = reply.send(Ok(self.presence.members()));
            }
            ChannelState::Attached | ChannelState::Attaching => self.presence_waiters.push(reply),
            ChannelState::Initialized | ChannelState::Detached => {
                if let Err(e) = attachable(ctx.connection_state) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.presence_waiters.push(reply);
                self.start_attach(None, ctx);
            }
            ChannelState::Failed => {
                let _ = reply.send(Err(self.failed_error()));
            }
            state @ (ChannelState::Detaching | ChannelState::Suspended) => {
                let _ = reply.send(Err(Error::InvalidState {
                    operation: "get presence",
                    state: state.to_string(),
                }));
            }
        }
    }

    /// Fail everything outstanding before the channel is dropped.
    pub(crate) fn release(&mut self) {
        let released = Error::InvalidState {
            operation: "use channel",
            state: "released".to_string(),
        };
        self.resolve_attach(&Err(released.clone()));
        self.resolve_detach(&Err(released.clone()));
        self.fail_presence(&released);
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    pub(crate) fn on_frame(&mut self, frame: ProtocolMessage, ctx: &mut ChannelCtx) {
        match frame.action {
            Action::Attached => self.on_attached(&frame, ctx),
            Action::Detached => self.on_detached(&frame, ctx),
            Action::Message => self.on_message(frame, ctx),
            Action::Presence | Action::Sync => self.on_presence(frame, ctx),
            Action::Error => {
                let reason = frame.error.unwrap_or_else(|| {
                    ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, Some(400), "channel error")
                });
                log::warn!("[Channel {}] Error from service: {}", self.name(), reason);
                self.fail(reason, ctx);
            }
            other => log::debug!("[Channel {}] Ignoring {:?} frame", self.name(), other),
        }
    }

    fn on_attached(&mut self, frame: &ProtocolMessage, ctx: &mut ChannelCtx) {
        if ctx.connection_state != ConnectionState::Connected {
            log::debug!("[Channel {}] ATTACHED while not connected, ignoring", self.name());
            return;
        }
        let resumed = frame.has_flag(flags::RESUMED);
        match self.state {
            ChannelState::Attached => {
                if !resumed {
                    self.emit_update(frame.error.clone(), resumed);
                }
            }
            ChannelState::Attaching | ChannelState::Suspended => {
                self.retry_count = 0;
                self.set_state(ChannelState::Attached, frame.error.clone(), resumed, ctx);
                self.resolve_attach(&Ok(()));
                for (message, reply) in std::mem::take(&mut self.queued_presence) {
                    let mut out = ProtocolMessage::for_channel(Action::Presence, self.name());
                    out.presence = Some(vec![message]);
                    ctx.outbox.push(Outbound::Publish { frame: out, reply });
                }
            }
            state => {
                log::debug!("[Channel {}] ATTACHED while {}, ignoring", self.name(), state);
                return;
            }
        }

        if frame.has_flag(flags::HAS_PRESENCE) {
            self.presence.start_sync();
            self.shared.presence.set_sync_complete(false);
        } else {
            let leaves = self.presence.clear(ctx.now_ms);
            self.emit_presence(&leaves);
            self.sync_done();
        }
    }

    fn on_detached(&mut self, frame: &ProtocolMessage, ctx: &mut ChannelCtx) {
        let reason = frame.error.clone();
        match self.state {
            ChannelState::Detaching => {
                self.set_state(ChannelState::Detached, reason, false, ctx);
                self.resolve_detach(&Ok(()));
            }
            ChannelState::Attaching => {
                let info = reason.unwrap_or_else(|| {
                    ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, Some(400), "attach rejected")
                });
                if info.is_capability_error() {
                    self.fail(info, ctx);
                } else {
                    self.suspend(info, ctx);
                }
            }
            ChannelState::Attached | ChannelState::Suspended => match reason {
                Some(info) if info.is_capability_error() => self.fail(info, ctx),
                reason => {
                    log::info!("[Channel {}] Detached by service, re-attaching", self.name());
                    self.start_attach(reason, ctx);
                }
            },
            state => log::debug!("[Channel {}] DETACHED while {}, ignoring", self.name(), state),
        }
    }

    fn on_message(&mut self, frame: ProtocolMessage, ctx: &mut ChannelCtx) {
        if self.state != ChannelState::Attached {
            log::debug!("[Channel {}] Dropping MESSAGE while {}", self.name(), self.state);
            return;
        }
        let options = self.shared.options();
        let frame_id = frame.id.clone();
        for (index, mut message) in frame.messages.unwrap_or_default().into_iter().enumerate() {
            if message.id.is_none() {
                message.id = frame_id.as_ref().map(|id| format!("{id}:{index}"));
            }
            if message.connection_id.is_none() {
                message.connection_id.clone_from(&frame.connection_id);
            }
            if message.timestamp.is_none() {
                message.timestamp = frame.timestamp;
            }
            if let Err(e) = message.decode(&ctx.pipeline, &options) {
                log::warn!("[Channel {}] Failed to decode message {:?}: {}", self.name(), message.id, e);
                self.emit_error(ErrorInfo::new(e.code(), Some(400), e.to_string()));
            }
            let subject = message.name.clone().unwrap_or_default();
            self.shared.messages.emit(&subject, &message);
        }
    }

    fn on_presence(&mut self, frame: ProtocolMessage, ctx: &mut ChannelCtx) {
        if self.state != ChannelState::Attached {
            log::debug!("[Channel {}] Dropping {:?} while {}", self.name(), frame.action, self.state);
            return;
        }
        let is_sync = frame.action == Action::Sync;
        if is_sync {
            self.presence.start_sync();
        }

        let options = self.shared.options();
        let frame_id = frame.id.clone();
        let cursor_done = is_sync && frame.sync_cursor().is_none();
        for (index, mut message) in frame.presence.unwrap_or_default().into_iter().enumerate() {
            if message.id.is_none() {
                message.id = frame_id.as_ref().map(|id| format!("{id}:{index}"));
            }
            if message.connection_id.is_none() {
                message.connection_id.clone_from(&frame.connection_id);
            }
            if message.timestamp.is_none() {
                message.timestamp = frame.timestamp;
            }
            if let Err(e) = message.decode(&ctx.pipeline, &options) {
                log::warn!("[Channel {}] Failed to decode presence {:?}: {}", self.name(), message.id, e);
                self.emit_error(ErrorInfo::new(e.code(), Some(400), e.to_string()));
            }
            if self.presence.apply(&message) {
                self.shared.presence.emitter.emit(&message.action, &message);
            }
        }

        if cursor_done {
            let leaves = self.presence.end_sync(ctx.now_ms);
            self.emit_presence(&leaves);
            self.sync_done();
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    pub(crate) fn on_timer(&mut self, ctx: &mut ChannelCtx) {
        let Some((at, timer)) = self.timer else {
            return;
        };
        if at > ctx.now {
            return;
        }
        self.timer = None;

        match (timer, self.state) {
            (Timer::AttachTimeout, ChannelState::Attaching) => {
                self.retry_count += 1;
                let info = ErrorInfo::new(codes::ATTACH_TIMEOUT, Some(408), "attach timed out");
                log::warn!(
                    "[Channel {}] Attach timed out ({}/{})",
                    self.name(),
                    self.retry_count,
                    ctx.retry_limit
                );
                if self.retry_count >= ctx.retry_limit {
                    self.fail(info, ctx);
                } else {
                    self.suspend(info, ctx);
                }
            }
            (Timer::Retry, ChannelState::Suspended) => {
                log::info!("[Channel {}] Retrying attach", self.name());
                self.start_attach(None, ctx);
            }
            (Timer::DetachTimeout { revert_to }, ChannelState::Detaching) => {
                let info = ErrorInfo::new(codes::TIMEOUT, Some(504), "detach timed out");
                self.set_state(revert_to, Some(info), false, ctx);
                self.resolve_detach(&Err(Error::Timeout(format!(
                    "detach of '{}' timed out",
                    self.name()
                ))));
            }
            _ => {}
        }
    }

    // ========================================================================
    // Connection-driven transitions
    // ========================================================================

    /// Connection reached CONNECTED: (re-)attach channels that want to be attached.
    pub(crate) fn on_connected(&mut self, ctx: &mut ChannelCtx) {
        match self.state {
            ChannelState::Attaching => self.send_attach(ctx),
            ChannelState::Suspended => self.start_attach(None, ctx),
            _ => {}
        }
    }

    /// Connection left CONNECTED for a state it can recover from.
    pub(crate) fn on_connection_interrupted(&mut self, ctx: &mut ChannelCtx) {
        match self.state {
            ChannelState::Attached => self.set_state(ChannelState::Attaching, None, false, ctx),
            ChannelState::Attaching => self.timer = None,
            ChannelState::Detaching => {
                self.set_state(ChannelState::Detached, None, false, ctx);
                self.resolve_detach(&Ok(()));
            }
            _ => {}
        }
    }

    pub(crate) fn on_connection_suspended(&mut self, reason: ErrorInfo, ctx: &mut ChannelCtx) {
        if matches!(self.state, ChannelState::Attaching | ChannelState::Attached) {
            self.set_state(ChannelState::Suspended, Some(reason.clone()), false, ctx);
            self.resolve_attach(&Err(Error::Connection(reason.clone())));
            self.fail_presence(&Error::Connection(reason));
        }
    }

    pub(crate) fn on_connection_closed(&mut self, ctx: &mut ChannelCtx) {
        if matches!(
            self.state,
            ChannelState::Attaching
                | ChannelState::Attached
                | ChannelState::Detaching
                | ChannelState::Suspended
        ) {
            self.set_state(ChannelState::Detached, None, false, ctx);
            self.resolve_attach(&Err(Error::Closed));
            self.resolve_detach(&Ok(()));
            self.fail_presence(&Error::Closed);
        }
    }

    pub(crate) fn on_connection_failed(&mut self, reason: ErrorInfo, ctx: &mut ChannelCtx) {
        if matches!(
            self.state,
            ChannelState::Attaching
                | ChannelState::Attached
                | ChannelState::Detaching
                | ChannelState::Suspended
        ) {
            self.fail(reason, ctx);
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn start_attach(&mut self, reason: Option<ErrorInfo>, ctx: &mut ChannelCtx) {
        self.resolve_detach(&Err(Error::InvalidState {
            operation: "detach",
            state: "attach requested".to_string(),
        }));
        self.set_state(ChannelState::Attaching, reason, false, ctx);
        match ctx.connection_state {
            ConnectionState::Connected => self.send_attach(ctx),
            ConnectionState::Initialized => ctx.outbox.push(Outbound::ImplicitConnect),
            _ => {}
        }
    }

    fn send_attach(&mut self, ctx: &mut ChannelCtx) {
        log::debug!("[Channel {}] Sending ATTACH", self.name());
        ctx.outbox.push(Outbound::Frame(ProtocolMessage::for_channel(
            Action::Attach,
            self.name(),
        )));
        self.timer = Some((ctx.now + ctx.request_timeout, Timer::AttachTimeout));
    }

    fn suspend(&mut self, reason: ErrorInfo, ctx: &mut ChannelCtx) {
        self.set_state(ChannelState::Suspended, Some(reason.clone()), false, ctx);
        let err = Error::Channel {
            channel: self.name().to_string(),
            info: reason,
        };
        self.resolve_attach(&Err(err.clone()));
        self.fail_presence(&err);
        self.timer = Some((ctx.now + ctx.retry_timeout, Timer::Retry));
    }

    fn fail(&mut self, reason: ErrorInfo, ctx: &mut ChannelCtx) {
        self.set_state(ChannelState::Failed, Some(reason.clone()), false, ctx);
        let err = Error::Channel {
            channel: self.name().to_string(),
            info: reason.clone(),
        };
        self.resolve_attach(&Err(err.clone()));
        self.resolve_detach(&Err(err.clone()));
        self.fail_presence(&err);
        self.presence.clear(ctx.now_ms);
        self.shared.presence.set_sync_complete(false);
        ctx.outbox.push(Outbound::Failed {
            channel: self.name().to_string(),
            reason,
        });
    }

    fn set_state(
        &mut self,
        current: ChannelState,
        reason: Option<ErrorInfo>,
        resumed: bool,
        ctx: &mut ChannelCtx,
    ) {
        let previous = self.state;
        self.state = current;
        self.timer = None;
        if current == ChannelState::Detached {
            self.presence.clear(ctx.now_ms);
            self.shared.presence.set_sync_complete(false);
        }
        {
            let mut snapshot = self.shared.snapshot();
            snapshot.state = current;
            if reason.is_some() {
                snapshot.error_reason.clone_from(&reason);
            }
        }

        match &reason {
            Some(reason) => log::info!(
                "[Channel {}] {} -> {} ({})",
                self.name(),
                previous,
                current,
                reason
            ),
            None => log::info!("[Channel {}] {} -> {}", self.name(), previous, current),
        }

        let change = ChannelStateChange {
            previous,
            current,
            event: current.into(),
            reason,
            resumed,
        };
        self.shared.emitter.emit(&change.event, &change);
    }

    fn emit_update(&self, reason: Option<ErrorInfo>, resumed: bool) {
        let change = ChannelStateChange {
            previous: self.state,
            current: self.state,
            event: ChannelEvent::Update,
            reason,
            resumed,
        };
        self.shared.emitter.emit(&ChannelEvent::Update, &change);
    }

    fn emit_error(&self, reason: ErrorInfo) {
        let change = ChannelStateChange {
            previous: self.state,
            current: self.state,
            event: ChannelEvent::Error,
            reason: Some(reason),
            resumed: false,
        };
        self.shared.emitter.emit(&ChannelEvent::Error, &change);
    }

    fn emit_presence(&self, messages: &[PresenceMessage]) {
        for message in messages {
            self.shared.presence.emitter.emit(&PresenceAction::Leave, message);
        }
    }

    fn sync_done(&mut self) {
        self.shared.presence.set_sync_complete(true);
        let members = self.presence.members();
        for waiter in self.presence_waiters.drain(..) {
            let _ = waiter.send(Ok(members.clone()));
        }
    }

    fn resolve_attach(&mut self, result: &Result<()>) {
        for waiter in self.attach_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn resolve_detach(&mut self, result: &Result<()>) {
        for waiter in self.detach_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn fail_presence(&mut self, err: &Error) {
        for (_, reply) in self.queued_presence.drain(..) {
            let _ = reply.send(Err(err.clone()));
        }
        for waiter in self.presence_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn failed_error(&self) -> Error {
        Error::Channel {
            channel: self.name().to_string(),
            info: self.shared.snapshot().error_reason.clone().unwrap_or_else(|| {
                ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, Some(400), "channel failed")
            }),
        }
    }
}

/// Whether a channel may start attaching given the connection state.
fn attachable(connection: ConnectionState) -> Result<()> {
    match connection {
        ConnectionState::Initialized
        | ConnectionState::Connecting
        | ConnectionState::Connected
        | ConnectionState::Disconnected => Ok(()),
        state => Err(Error::InvalidState {
            operation: "attach",
            state: format!("connection is {state}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelOptions;
    use crate::events::Subjects;
    use crate::message::{Data, Message};
    use std::sync::Mutex;

    fn ctx(connection_state: ConnectionState) -> ChannelCtx {
        ChannelCtx {
            connection_state,
            now: Instant::now(),
            now_ms: 1_000,
            request_timeout: Duration::from_secs(10),
            retry_timeout: Duration::from_secs(15),
            retry_limit: 3,
            pipeline: Arc::new(EncoderPipeline::default()),
            outbox: Vec::new(),
        }
    }

    fn machine(name: &str) -> ChannelMachine {
        ChannelMachine::new(Arc::new(ChannelShared::new(name, ChannelOptions::default())))
    }

    fn attach_frames(outbox: &[Outbound]) -> usize {
        outbox
            .iter()
            .filter(|o| matches!(o, Outbound::Frame(f) if f.action == Action::Attach))
            .count()
    }

    fn attached(flags: u32) -> ProtocolMessage {
        let mut frame = ProtocolMessage::for_channel(Action::Attached, "foo");
        frame.flags = Some(flags);
        frame
    }

    #[tokio::test]
    async fn test_concurrent_attach_sends_one_frame() {
        let mut m = machine("foo");
        let mut ctx = ctx(ConnectionState::Connected);
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        m.attach(tx1, &mut ctx);
        m.attach(tx2, &mut ctx);
        assert_eq!(attach_frames(&ctx.outbox), 1);
        assert_eq!(m.state(), ChannelState::Attaching);

        m.on_frame(attached(0), &mut ctx);
        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
        assert_eq!(m.shared().snapshot().state, ChannelState::Attached);
    }

    #[tokio::test]
    async fn test_attach_before_connect_requests_connection() {
        let mut m = machine("foo");
        let mut ctx = ctx(ConnectionState::Initialized);
        let (tx, _rx) = oneshot::channel();
        m.attach(tx, &mut ctx);
        assert!(matches!(ctx.outbox.as_slice(), [Outbound::ImplicitConnect]));

        let mut ctx = self::ctx(ConnectionState::Connected);
        m.on_connected(&mut ctx);
        assert_eq!(attach_frames(&ctx.outbox), 1);
    }

    #[test]
    fn test_attached_ignored_when_not_connected() {
        let mut m = machine("foo");
        let mut ctx = ctx(ConnectionState::Connected);
        let (tx, _rx) = oneshot::channel();
        m.attach(tx, &mut ctx);

        let mut ctx = self::ctx(ConnectionState::Disconnected);
        m.on_frame(attached(0), &mut ctx);
        assert_eq!(m.state(), ChannelState::Attaching);
    }

    #[tokio::test]
    async fn test_attach_timeout_suspends_then_fails() {
        let mut m = machine("foo");
        let mut ctx = ctx(ConnectionState::Connected);
        let (tx, rx) = oneshot::channel();
        m.attach(tx, &mut ctx);

        for attempt in 1..=3 {
            let deadline = m.deadline().unwrap();
            ctx.now = deadline;
            m.on_timer(&mut ctx);
            if attempt < 3 {
                assert_eq!(m.state(), ChannelState::Suspended);
                ctx.now = m.deadline().unwrap();
                m.on_timer(&mut ctx);
                assert_eq!(m.state(), ChannelState::Attaching);
            }
        }
        assert_eq!(m.state(), ChannelState::Failed);
        assert!(matches!(rx.await.unwrap(), Err(Error::Channel { .. })));
        assert!(ctx
            .outbox
            .iter()
            .any(|o| matches!(o, Outbound::Failed { reason, .. } if reason.code == codes::ATTACH_TIMEOUT)));
    }

    #[tokio::test]
    async fn test_detach_timeout_reverts() {
        let mut m = machine("foo");
        let mut ctx = ctx(ConnectionState::Connected);
        let (tx, _rx) = oneshot::channel();
        m.attach(tx, &mut ctx);
        m.on_frame(attached(0), &mut ctx);

        let (tx, rx) = oneshot::channel();
        m.detach(tx, &mut ctx);
        assert_eq!(m.state(), ChannelState::Detaching);
        ctx.now = m.deadline().unwrap();
        m.on_timer(&mut ctx);
        assert_eq!(m.state(), ChannelState::Attached);
        assert!(matches!(rx.await.unwrap(), Err(Error::Timeout(_))));
    }

    #[test]
    fn test_capability_detached_fails_channel() {
        let mut m = machine("foo");
        let mut ctx = ctx(ConnectionState::Connected);
        let (tx, _rx) = oneshot::channel();
        m.attach(tx, &mut ctx);
        m.on_frame(attached(0), &mut ctx);

        let mut frame = ProtocolMessage::for_channel(Action::Detached, "foo");
        frame.error = Some(ErrorInfo::new(40160, Some(401), "denied"));
        m.on_frame(frame, &mut ctx);
        assert_eq!(m.state(), ChannelState::Failed);
        assert_eq!(m.shared().snapshot().error_reason.as_ref().unwrap().code, 40160);
    }

    #[test]
    fn test_unsolicited_detached_reattaches() {
        let mut m = machine("foo");
        let mut ctx = ctx(ConnectionState::Connected);
        let (tx, _rx) = oneshot::channel();
        m.attach(tx, &mut ctx);
        m.on_frame(attached(0), &mut ctx);
        ctx.outbox.clear();

        m.on_frame(ProtocolMessage::for_channel(Action::Detached, "foo"), &mut ctx);
        assert_eq!(m.state(), ChannelState::Attaching);
        assert_eq!(attach_frames(&ctx.outbox), 1);
    }

    #[test]
    fn test_connection_transitions() {
        let mut m = machine("foo");
        let mut ctx = ctx(ConnectionState::Connected);
        let (tx, _rx) = oneshot::channel();
        m.attach(tx, &mut ctx);
        m.on_frame(attached(0), &mut ctx);

        m.on_connection_interrupted(&mut ctx);
        assert_eq!(m.state(), ChannelState::Attaching);
        m.on_connection_suspended(ErrorInfo::new(80002, Some(400), "suspended"), &mut ctx);
        assert_eq!(m.state(), ChannelState::Suspended);

        ctx.outbox.clear();
        m.on_connected(&mut ctx);
        assert_eq!(m.state(), ChannelState::Attaching);
        assert_eq!(attach_frames(&ctx.outbox), 1);

        m.on_connection_closed(&mut ctx);
        assert_eq!(m.state(), ChannelState::Detached);
    }

    #[test]
    fn test_decode_failure_delivers_message_and_emits_error() {
        let mut m = machine("foo");
        let mut ctx = ctx(ConnectionState::Connected);
        let (tx, _rx) = oneshot::channel();
        m.attach(tx, &mut ctx);
        m.on_frame(attached(0), &mut ctx);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        m.shared().messages.on(Subjects::All, move |msg: &Message| {
            sink.lock().unwrap().push(msg.clone());
        });
        let errors = Arc::new(Mutex::new(0));
        let count = Arc::clone(&errors);
        m.shared().emitter.on(ChannelEvent::Error, move |_| *count.lock().unwrap() += 1);

        let mut frame = ProtocolMessage::for_channel(Action::Message, "foo");
        frame.id = Some("conn:7".into());
        frame.connection_id = Some("conn".into());
        frame.messages = Some(vec![Message {
            name: Some("click".into()),
            data: Data::from("aGk="),
            encoding: Some("mystery/base64".into()),
            ..Message::default()
        }]);
        m.on_frame(frame, &mut ctx);

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id.as_deref(), Some("conn:7:0"));
        assert_eq!(received[0].connection_id.as_deref(), Some("conn"));
        assert_eq!(received[0].encoding.as_deref(), Some("mystery"));
        assert_eq!(*errors.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_presence_sync_completes_get() {
        let mut m = machine("foo");
        let mut ctx = ctx(ConnectionState::Connected);
        let (tx, rx) = oneshot::channel();
        m.presence_get(tx, &mut ctx);
        m.on_frame(attached(flags::HAS_PRESENCE), &mut ctx);
        assert!(!m.shared().presence.is_sync_complete());

        let mut sync = ProtocolMessage::for_channel(Action::Sync, "foo");
        sync.channel_serial = Some("sync1:".into());
        sync.presence = Some(vec![PresenceMessage {
            action: PresenceAction::Present,
            id: None,
            client_id: Some("alice".into()),
            connection_id: Some("c1".into()),
            data: Data::Null,
            encoding: None,
            timestamp: Some(5),
        }]);
        m.on_frame(sync, &mut ctx);

        let members = rx.await.unwrap().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].client_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_presence_queued_until_attached() {
        let mut m = machine("foo");
        let mut ctx = ctx(ConnectionState::Connected);
        let (tx, _rx) = oneshot::channel();
        m.presence_action(PresenceMessage::new(PresenceAction::Enter, "alice", Data::Null), tx, &mut ctx);
        assert_eq!(m.state(), ChannelState::Attaching);
        assert!(!ctx.outbox.iter().any(|o| matches!(o, Outbound::Publish { .. })));

        m.on_frame(attached(0), &mut ctx);
        assert!(ctx.outbox.iter().any(|o| matches!(o, Outbound::Publish { .. })));
    }

}
