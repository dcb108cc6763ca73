/*
    This file is part of Donet.

    Copyright © 2024 Max Rodriguez <me@maxrdz.com>

    Donet is free software; you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License,
    as published by the Free Software Foundation, either version 3
    of the License, or (at your option) any later version.

    Donet is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public
    License along with Donet. If not, see <https://www.gnu.org/licenses/>.
*/

//! Per-connection state for one game client: its trust level, the
//! interests it has opened, and the objects it currently owns or can
//! see, plus the auth/heartbeat timers that can disconnect it.
//!
//! Timers are plain Tokio tasks rather than OS timers: each posts a
//! [`ParticipantEvent`] back into the owning [`crate::agent::ClientAgent`]'s
//! main loop instead of touching participant state directly, keeping
//! all mutation on the single task that owns the `Arc<Mutex<..>>`.

use crate::interest::Interest;
use donet_core::globals::{Channel, DClassId, DoId, FieldId, Zone};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A client's position in the auth handshake (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected, hasn't sent `CLIENT_HELLO` yet.
    New,
    /// Passed `CLIENT_HELLO`, not yet granted any session object.
    Anonymous,
    /// Has at least one session object; full message catalog applies.
    Established,
}

#[derive(Debug)]
pub enum ParticipantEvent {
    AuthTimeout(Channel),
    HeartbeatTimeout(Channel),
}

/// A distributed object the client currently holds visibility over,
/// cached so a later `CLIENT_OBJECT_LEAVING`/field-authorization check
/// doesn't need a round trip back to the State Server to learn where
/// the object lives or what class it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleObject {
    pub parent: DoId,
    pub zone: Zone,
    pub dclass: DClassId,
}

pub struct ClientParticipant {
    pub channel: Channel,
    pub state: ClientState,
    pub interests: HashMap<u16, Interest>,
    /// Session objects: per §4.4, the client is disconnected the
    /// moment one of these stops being visible to it.
    pub session_objects: HashSet<DoId>,
    pub owned_objects: HashSet<DoId>,
    /// Objects this client currently holds visibility over, keyed by
    /// DoId, with the parent/zone/class that visibility was granted
    /// under.
    pub visible: HashMap<DoId, VisibleObject>,
    /// The subset of `visible` the client has actually been told about
    /// (received a `CLIENT_ENTER_OBJECT_REQUIRED[_OTHER]` for). An
    /// object can be `visible` without being `seen` yet while its
    /// enter message is still queued behind an in-flight interest
    /// operation.
    pub seen: HashSet<DoId>,
    /// Objects explicitly declared to this participant by the
    /// `CLIENTAGENT_DECLARE_OBJECT` control message, granting field
    /// send/receive access outside the normal visibility rules.
    pub declared: HashSet<DoId>,
    /// Objects that were visible and have since left (deleted,
    /// relocated, or zoned out); a message addressed to one of these
    /// is silently consumed rather than treated as a protocol error.
    pub historical: HashSet<DoId>,
    /// Per-object field override table populated by
    /// `CLIENTAGENT_SET_FIELDS_SENDABLE`, allowing a field update the
    /// DC schema alone would not permit.
    pub fields_sendable: HashMap<DoId, HashSet<FieldId>>,
    heartbeat_reset: Option<mpsc::Sender<()>>,
    auth_timer: Option<JoinHandle<()>>,
    heartbeat_timer: Option<JoinHandle<()>>,
}

impl ClientParticipant {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            state: ClientState::New,
            interests: HashMap::new(),
            session_objects: HashSet::new(),
            owned_objects: HashSet::new(),
            visible: HashMap::new(),
            seen: HashSet::new(),
            declared: HashSet::new(),
            historical: HashSet::new(),
            fields_sendable: HashMap::new(),
            heartbeat_reset: None,
            auth_timer: None,
            heartbeat_timer: None,
        }
    }

    /// Marks `doid` as no longer visible, moving it into `historical`
    /// so a late-arriving message addressed to it is consumed quietly
    /// instead of erroring.
    pub fn retire_object(&mut self, doid: DoId) {
        self.visible.remove(&doid);
        self.seen.remove(&doid);
        self.owned_objects.remove(&doid);
        self.historical.insert(doid);
    }

    /// §4.4 visibility rule: may this client send a field update to
    /// `doid`? Anonymous UberDOGs are handled by the caller, which
    /// knows the configured UberDOG table; this only covers the
    /// owned/visible-and-seen/declared test.
    pub fn may_target(&self, doid: DoId) -> bool {
        self.owned_objects.contains(&doid) || (self.visible.contains_key(&doid) && self.seen.contains(&doid)) || self.declared.contains(&doid)
    }

    /// Whether `field` may be sent by this client for `doid`, given
    /// the DC schema's own `clsend`/`ownsend` flags plus any override
    /// from `CLIENTAGENT_SET_FIELDS_SENDABLE`.
    pub fn field_sendable(&self, doid: DoId, field_id: FieldId, clsend: bool, ownsend: bool) -> bool {
        clsend
            || (ownsend && self.owned_objects.contains(&doid))
            || self.fields_sendable.get(&doid).is_some_and(|fields| fields.contains(&field_id))
    }

    pub fn start_auth_timer(&mut self, timeout: Duration, events: mpsc::Sender<ParticipantEvent>) {
        let channel = self.channel;
        self.auth_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(ParticipantEvent::AuthTimeout(channel)).await;
        }));
    }

    pub fn cancel_auth_timer(&mut self) {
        if let Some(handle) = self.auth_timer.take() {
            handle.abort();
        }
    }

    pub fn start_heartbeat_timer(&mut self, interval: Duration, events: mpsc::Sender<ParticipantEvent>) {
        let (reset_tx, mut reset_rx) = mpsc::channel::<()>(4);
        let channel = self.channel;

        self.heartbeat_timer = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let _ = events.send(ParticipantEvent::HeartbeatTimeout(channel)).await;
                        break;
                    }
                    received = reset_rx.recv() => {
                        if received.is_none() {
                            break;
                        }
                    }
                }
            }
        }));
        self.heartbeat_reset = Some(reset_tx);
    }

    /// Called whenever a `CLIENT_HEARTBEAT` (or any message, per the
    /// teacher's liveness convention) arrives, restarting the timer.
    pub fn record_heartbeat(&mut self) {
        if let Some(tx) = &self.heartbeat_reset {
            let _ = tx.try_send(());
        }
    }

    pub fn cancel_heartbeat_timer(&mut self) {
        if let Some(handle) = self.heartbeat_timer.take() {
            handle.abort();
        }
        self.heartbeat_reset = None;
    }

    pub fn shutdown_timers(&mut self) {
        self.cancel_auth_timer();
        self.cancel_heartbeat_timer();
    }
}

impl Drop for ClientParticipant {
    fn drop(&mut self) {
        self.shutdown_timers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_participant_starts_unauthenticated() {
        let participant = ClientParticipant::new(42);
        assert_eq!(participant.state, ClientState::New);
        assert!(participant.interests.is_empty());
    }

    #[tokio::test]
    async fn auth_timeout_fires_when_not_cancelled() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut participant = ClientParticipant::new(1);
        participant.start_auth_timer(Duration::from_millis(10), tx);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ParticipantEvent::AuthTimeout(1)));
    }

    #[tokio::test]
    async fn heartbeat_reset_delays_timeout() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut participant = ClientParticipant::new(2);
        participant.start_heartbeat_timer(Duration::from_millis(30), tx);

        tokio::time::sleep(Duration::from_millis(15)).await;
        participant.record_heartbeat();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ParticipantEvent::HeartbeatTimeout(2)));
        participant.shutdown_timers();
    }

    #[test]
    fn retire_object_moves_visible_into_historical() {
        let mut participant = ClientParticipant::new(3);
        participant.visible.insert(101, VisibleObject { parent: 200, zone: 5, dclass: 1 });
        participant.seen.insert(101);
        participant.owned_objects.insert(101);

        participant.retire_object(101);

        assert!(!participant.visible.contains_key(&101));
        assert!(!participant.seen.contains(&101));
        assert!(!participant.owned_objects.contains(&101));
        assert!(participant.historical.contains(&101));
    }

    #[test]
    fn may_target_requires_owned_or_seen_or_declared() {
        let mut participant = ClientParticipant::new(4);
        assert!(!participant.may_target(101));

        participant.owned_objects.insert(101);
        assert!(participant.may_target(101));

        participant.visible.insert(102, VisibleObject { parent: 200, zone: 5, dclass: 1 });
        assert!(!participant.may_target(102)); // visible but not yet seen
        participant.seen.insert(102);
        assert!(participant.may_target(102));

        participant.declared.insert(103);
        assert!(participant.may_target(103));
    }

    #[test]
    fn field_sendable_honors_clsend_ownsend_and_override() {
        let mut participant = ClientParticipant::new(5);
        assert!(participant.field_sendable(101, 1, true, false));
        assert!(!participant.field_sendable(101, 1, false, true));

        participant.owned_objects.insert(101);
        assert!(participant.field_sendable(101, 1, false, true));

        assert!(!participant.field_sendable(101, 2, false, false));
        participant.fields_sendable.entry(101).or_default().insert(2);
        assert!(participant.field_sendable(101, 2, false, false));
    }
}
