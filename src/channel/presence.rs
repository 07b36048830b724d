//! Channel presence: the member set and the [`Presence`] handle.
//!
//! The member set ([`PresenceMap`]) is owned by the channel machine in the
//! event loop. Handles read it through `get`, which round-trips the loop
//! and waits for any sync in progress to finish.
//!
//! Sync reconciles against a fresh snapshot: every member known when a sync
//! starts is a residual until the service reports it again. Residuals left
//! when the sync ends are removed and announced as synthesised LEAVEs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connection::{request, Command};
use crate::events::{EmitterOptions, EventEmitter, ListenerId, Subjects};
use crate::message::{Data, PresenceAction, PresenceMessage};
use crate::error::Result;

use super::ChannelShared;

/// Member set keyed by [`PresenceMessage::member_key`].
#[derive(Debug, Default)]
pub(crate) struct PresenceMap {
    members: HashMap<String, PresenceMessage>,
    syncing: bool,
    residual: HashSet<String>,
}

impl PresenceMap {
    /// Apply one inbound presence message.
    ///
    /// Returns `false` when the message is stale (an entry already stored
    /// for the member is newer) and must not be emitted.
    pub(crate) fn apply(&mut self, message: &PresenceMessage) -> bool {
        let key = message.member_key();
        if let Some(existing) = self.members.get(&key) {
            if !message.is_newer_than(existing) {
                return false;
            }
        }
        self.residual.remove(&key);

        match message.action {
            PresenceAction::Leave | PresenceAction::Absent => {
                if self.syncing {
                    let mut absent = message.clone();
                    absent.action = PresenceAction::Absent;
                    self.members.insert(key, absent);
                } else {
                    self.members.remove(&key);
                }
            }
            PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                let mut present = message.clone();
                present.action = PresenceAction::Present;
                self.members.insert(key, present);
            }
        }
        true
    }

    /// Begin a sync. A sync already in progress keeps its residuals.
    pub(crate) fn start_sync(&mut self) {
        if !self.syncing {
            self.syncing = true;
            self.residual = self.members.keys().cloned().collect();
        }
    }

    pub(crate) fn is_syncing(&self) -> bool {
        self.syncing
    }

    /// Finish a sync. Returns synthesised LEAVEs for members the sync did not report.
    pub(crate) fn end_sync(&mut self, now: i64) -> Vec<PresenceMessage> {
        if !self.syncing {
            return Vec::new();
        }
        self.syncing = false;
        self.members.retain(|_, m| m.action != PresenceAction::Absent);

        let mut residual: Vec<String> = self.residual.drain().collect();
        residual.sort();
        residual
            .into_iter()
            .filter_map(|key| self.members.remove(&key))
            .map(|member| synthesised_leave(member, now))
            .collect()
    }

    /// Drop every member. Returns synthesised LEAVEs for them.
    pub(crate) fn clear(&mut self, now: i64) -> Vec<PresenceMessage> {
        self.syncing = false;
        self.residual.clear();
        let mut members: Vec<_> = self
            .members
            .drain()
            .filter(|(_, m)| m.action != PresenceAction::Absent)
            .collect();
        members.sort_by(|a, b| a.0.cmp(&b.0));
        members
            .into_iter()
            .map(|(_, member)| synthesised_leave(member, now))
            .collect()
    }

    /// Present members, ordered by member key.
    pub(crate) fn members(&self) -> Vec<PresenceMessage> {
        let mut members: Vec<_> = self
            .members
            .iter()
            .filter(|(_, m)| m.action != PresenceAction::Absent)
            .collect();
        members.sort_by(|a, b| a.0.cmp(b.0));
        members.into_iter().map(|(_, m)| m.clone()).collect()
    }
}

fn synthesised_leave(mut member: PresenceMessage, now: i64) -> PresenceMessage {
    member.action = PresenceAction::Leave;
    member.id = None;
    member.timestamp = Some(now);
    member
}

/// Presence state shared with handles.
#[derive(Debug)]
pub(crate) struct PresenceShared {
    pub(crate) emitter: EventEmitter<PresenceAction, PresenceMessage>,
    sync_complete: AtomicBool,
}

impl PresenceShared {
    pub(crate) fn new() -> Self {
        Self {
            emitter: EventEmitter::with_options(EmitterOptions {
                coerce: Some(PresenceAction::from_name),
                safe_by_default: true,
            }),
            sync_complete: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_sync_complete(&self, complete: bool) {
        self.sync_complete.store(complete, Ordering::Release);
    }

    pub(crate) fn is_sync_complete(&self) -> bool {
        self.sync_complete.load(Ordering::Acquire)
    }
}

/// Presence on one channel.
#[derive(Debug, Clone)]
pub struct Presence {
    channel: Arc<ChannelShared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Presence {
    pub(crate) fn new(channel: Arc<ChannelShared>, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { channel, commands }
    }

    /// Enter as the client's own identity.
    pub async fn enter(&self, data: impl Into<Data>) -> Result<()> {
        self.send(PresenceAction::Enter, None, data.into()).await
    }

    /// Update the client's own member data.
    pub async fn update(&self, data: impl Into<Data>) -> Result<()> {
        self.send(PresenceAction::Update, None, data.into()).await
    }

    /// Leave as the client's own identity.
    pub async fn leave(&self, data: impl Into<Data>) -> Result<()> {
        self.send(PresenceAction::Leave, None, data.into()).await
    }

    /// Enter on behalf of `client_id`. Requires a wildcard identity or a matching one.
    pub async fn enter_client(&self, client_id: &str, data: impl Into<Data>) -> Result<()> {
        self.send(PresenceAction::Enter, Some(client_id), data.into()).await
    }

    /// Update on behalf of `client_id`.
    pub async fn update_client(&self, client_id: &str, data: impl Into<Data>) -> Result<()> {
        self.send(PresenceAction::Update, Some(client_id), data.into()).await
    }

    /// Leave on behalf of `client_id`.
    pub async fn leave_client(&self, client_id: &str, data: impl Into<Data>) -> Result<()> {
        self.send(PresenceAction::Leave, Some(client_id), data.into()).await
    }

    async fn send(&self, action: PresenceAction, client_id: Option<&str>, data: Data) -> Result<()> {
        let message = PresenceMessage {
            action,
            id: None,
            client_id: client_id.map(str::to_string),
            connection_id: None,
            data,
            encoding: None,
            timestamp: None,
        };
        let channel = self.channel.name.clone();
        request(&self.commands, |reply| Command::PresenceAction {
            channel,
            message,
            reply,
        })
        .await
    }

    /// Current members. Attaches if needed and waits for the sync to finish.
    pub async fn get(&self) -> Result<Vec<PresenceMessage>> {
        let channel = self.channel.name.clone();
        request(&self.commands, |reply| Command::PresenceGet { channel, reply }).await
    }

    /// Subscribe to every presence event and attach.
    pub async fn subscribe<F>(&self, handler: F) -> Result<ListenerId>
    where
        F: Fn(&PresenceMessage) + Send + Sync + 'static,
    {
        let id = self.channel.presence.emitter.on(Subjects::All, handler);
        self.attach_for_listener(id).await
    }

    /// Subscribe to one presence action and attach.
    pub async fn subscribe_action<F>(&self, action: PresenceAction, handler: F) -> Result<ListenerId>
    where
        F: Fn(&PresenceMessage) + Send + Sync + 'static,
    {
        let id = self.channel.presence.emitter.on(action, handler);
        self.attach_for_listener(id).await
    }

    async fn attach_for_listener(&self, id: ListenerId) -> Result<ListenerId> {
        let channel = self.channel.name.clone();
        let attached = request(&self.commands, |reply| Command::Attach { channel, reply }).await;
        if let Err(e) = attached {
            self.channel.presence.emitter.off_listener(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Remove one presence listener.
    pub fn unsubscribe(&self, listener: ListenerId) {
        self.channel.presence.emitter.off_listener(listener);
    }

    /// Remove every presence listener.
    pub fn unsubscribe_all(&self) {
        self.channel.presence.emitter.off(None, None);
    }

    /// Whether the member set reflects a completed sync.
    pub fn sync_complete(&self) -> bool {
        self.channel.presence.is_sync_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(action: PresenceAction, conn: &str, client: &str, ts: i64) -> PresenceMessage {
        PresenceMessage {
            action,
            id: None,
            client_id: Some(client.to_string()),
            connection_id: Some(conn.to_string()),
            data: Data::Null,
            encoding: None,
            timestamp: Some(ts),
        }
    }

    fn keys(map: &PresenceMap) -> Vec<String> {
        map.members().iter().map(PresenceMessage::member_key).collect()
    }

    #[test]
    fn test_enter_enter_leave() {
        let mut map = PresenceMap::default();
        assert!(map.apply(&member(PresenceAction::Enter, "1", "A", 10)));
        assert!(map.apply(&member(PresenceAction::Enter, "1", "B", 11)));
        assert!(map.apply(&member(PresenceAction::Leave, "1", "A", 12)));
        assert_eq!(keys(&map), vec!["1:B".to_string()]);
    }

    #[test]
    fn test_enter_twice_updates_in_place() {
        let mut map = PresenceMap::default();
        map.apply(&member(PresenceAction::Enter, "1", "A", 10));
        let mut again = member(PresenceAction::Enter, "1", "A", 20);
        again.data = Data::from("v2");
        map.apply(&again);

        let members = map.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].action, PresenceAction::Present);
        assert_eq!(members[0].data, Data::from("v2"));
    }

    #[test]
    fn test_stale_message_is_ignored() {
        let mut map = PresenceMap::default();
        map.apply(&member(PresenceAction::Enter, "1", "A", 20));
        assert!(!map.apply(&member(PresenceAction::Leave, "1", "A", 10)));
        assert_eq!(keys(&map), vec!["1:A".to_string()]);
    }

    #[test]
    fn test_serial_ordering_within_connection() {
        let mut map = PresenceMap::default();
        let mut newer = member(PresenceAction::Update, "c", "A", 5);
        newer.id = Some("c:4:0".into());
        let mut older = member(PresenceAction::Leave, "c", "A", 50);
        older.id = Some("c:3:0".into());

        map.apply(&newer);
        assert!(!map.apply(&older));
        assert_eq!(map.members().len(), 1);
    }

    #[test]
    fn test_sync_removes_unreported_members() {
        let mut map = PresenceMap::default();
        map.apply(&member(PresenceAction::Enter, "1", "A", 10));
        map.apply(&member(PresenceAction::Enter, "1", "B", 10));

        map.start_sync();
        assert!(map.is_syncing());
        map.apply(&member(PresenceAction::Present, "1", "B", 30));
        map.apply(&member(PresenceAction::Present, "2", "C", 30));
        let leaves = map.end_sync(40);

        assert_eq!(keys(&map), vec!["1:B".to_string(), "2:C".to_string()]);
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].member_key(), "1:A");
        assert_eq!(leaves[0].action, PresenceAction::Leave);
        assert_eq!(leaves[0].timestamp, Some(40));
    }

    #[test]
    fn test_leave_during_sync_marks_absent() {
        let mut map = PresenceMap::default();
        map.start_sync();
        map.apply(&member(PresenceAction::Present, "1", "A", 10));
        map.apply(&member(PresenceAction::Leave, "1", "A", 20));
        // A late PRESENT from the sync must not resurrect the member.
        assert!(!map.apply(&member(PresenceAction::Present, "1", "A", 15)));
        assert!(map.members().is_empty());
        assert!(map.end_sync(30).is_empty());
        assert!(map.members().is_empty());
    }

    #[test]
    fn test_clear_returns_leaves() {
        let mut map = PresenceMap::default();
        map.apply(&member(PresenceAction::Enter, "1", "A", 10));
        let leaves = map.clear(99);
        assert_eq!(leaves.len(), 1);
        assert!(map.members().is_empty());
    }
}
