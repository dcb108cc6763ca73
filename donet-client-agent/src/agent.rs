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

//! The Client Agent: accepts game client TCP connections, speaks
//! whichever [`Dialect`] this instance is configured for, and acts as
//! the trust boundary between an untrusted client and the rest of the
//! cluster (§4.4) — allocating each connection a channel out of its
//! configured range, gatekeeping field sendability, and translating
//! `CLIENT_ADD_INTEREST` into the `SS_OBJECT_GET_ZONE(S)_*` queries
//! needed to answer it.

use crate::dialect::{self, Dialect};
use crate::interest::{FetchedObject, Interest, InterestOperation};
use crate::participant::{ClientParticipant, ClientState, ParticipantEvent, VisibleObject};
use donet_core::datagram::datagram::Datagram;
use donet_core::datagram::iterator::DatagramIterator;
use donet_core::globals::{doid_as_channel, location_as_channel, Channel, DClassId, DoId, Zone};
use donet_core::Protocol;
use donet_daemon::config::{self, InterestsPermission, UberDog};
use donet_daemon::service::{DCFile, DonetService};
use donet_daemon::subscriber::ClusterSubscriber;
use donet_network::{tcp, Client, HasClient, RecvData};
use log::{trace, warn};
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

// `CLIENT_EJECT`/`SendDisconnect` reason codes (§7). Named rather than
// inlined so every disconnect site documents which error kind it is.
const REASON_NO_HELLO: u16 = 100;
const REASON_BAD_VERSION: u16 = 101;
const REASON_BAD_DCHASH: u16 = 102;
const REASON_TRUNCATED_DATAGRAM: u16 = 103;
const REASON_FORBIDDEN_FIELD: u16 = 104;
const REASON_ANONYMOUS_VIOLATION: u16 = 105;
const REASON_FORBIDDEN_RELOCATE: u16 = 106;
const REASON_SESSION_OBJECT_DELETED: u16 = 107;
const REASON_TIMEOUT: u16 = 108;

/// Which arrival path a `GET_ALL` fetch was triggered for, so the
/// response can be routed back to the right place: a DoId an in-flight
/// `InterestOperation` is waiting on (counted), or a DoId that simply
/// entered a zone a client already has an open interest in (delivered
/// as soon as fetched, uncounted — see `spec.md` §4.4).
enum FetchTarget {
    Interest { channel: Channel, parent: DoId, zone: Zone },
    Direct { channel: Channel, parent: DoId, zone: Zone },
}

/// One `ADD_INTEREST` query still waiting on a State Server answer.
///
/// `SS_OBJECT_GET_ZONE(S)_COUNT` replies with an aggregate count, not
/// a per-zone breakdown, so completion is tracked the same way: once
/// every expected DoId has arrived *and* had its required fields
/// fetched, the operation is ready to finalize.
struct PendingInterest {
    op: InterestOperation,
    expected: Option<u32>,
}

struct Connected {
    client: Arc<Mutex<Client>>,
    participant: ClientParticipant,
}

/// Hands out channels from `config::ClientAgent::channel_range_min..=max`
/// in order, refusing once the range is exhausted rather than wrapping
/// or reusing a disconnected client's old channel.
struct ChannelAllocator {
    max: Channel,
    next: Channel,
}

impl ChannelAllocator {
    fn new(min: Channel, max: Channel) -> Self {
        Self { max, next: min }
    }

    fn allocate(&mut self) -> Option<Channel> {
        if self.next > self.max {
            return None;
        }
        let channel = self.next;
        self.next += 1;
        Some(channel)
    }
}

pub struct CreateInfo {
    pub service_conf: config::ClientAgent,
    pub md_address: String,
    pub dc: Option<DCFile>,
}

pub struct ClientAgent {
    uplink: Arc<Mutex<Client>>,
    acceptor: Arc<Mutex<tcp::Acceptor>>,
    dialect: Arc<dyn Dialect>,
    dc: Option<DCFile>,
    version_string: String,
    heartbeat_interval: Duration,
    auth_timeout: Duration,
    interests_permission: InterestsPermission,
    relocate_allowed: bool,
    uberdogs: Vec<UberDog>,
    channels: ChannelAllocator,
    connections: HashMap<Channel, Connected>,
    remote_index: HashMap<SocketAddr, Channel>,
    pending_object_fetch: HashMap<DoId, FetchTarget>,
    pending_interests: HashMap<(Channel, DoId), PendingInterest>,
    uplink_rx: Option<mpsc::Receiver<RecvData>>,
    client_tx: mpsc::Sender<RecvData>,
    client_rx: Option<mpsc::Receiver<RecvData>>,
    events_tx: mpsc::Sender<ParticipantEvent>,
    events_rx: Option<mpsc::Receiver<ParticipantEvent>>,
}

impl HasClient for ClientAgent {
    fn get_client(&self) -> Arc<Mutex<Client>> {
        self.uplink.clone()
    }
}

impl ClusterSubscriber for ClientAgent {
    async fn receive_datagram(_dg: Datagram) -> Result<()> {
        Ok(())
    }
}

impl DonetService for ClientAgent {
    type Service = Self;
    type Configuration = CreateInfo;

    async fn create(conf: Self::Configuration, dc: Option<DCFile>) -> Result<Arc<Mutex<Self::Service>>> {
        let uplink = Arc::new(Mutex::new(Client::from(tcp::Connection::connect(&conf.md_address).await?)));
        let (uplink_tx, uplink_rx) = mpsc::channel(64);
        uplink.lock().await.spawn_recv_send_tasks(uplink_tx).await;

        let acceptor = Arc::new(Mutex::new(tcp::Acceptor::bind(&conf.service_conf.bind).await?));
        let (client_tx, client_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(64);

        let service = ClientAgent {
            uplink,
            acceptor,
            dialect: Arc::from(dialect::from_config_name(conf.service_conf.dialect.as_deref())),
            dc: conf.dc.or(dc),
            version_string: conf.service_conf.version_string,
            heartbeat_interval: Duration::from_secs(conf.service_conf.heartbeat_interval),
            auth_timeout: Duration::from_secs(conf.service_conf.auth_timeout),
            interests_permission: conf.service_conf.interests_permission,
            relocate_allowed: conf.service_conf.relocate_allowed,
            uberdogs: conf.service_conf.uberdogs,
            channels: ChannelAllocator::new(conf.service_conf.channel_range_min, conf.service_conf.channel_range_max),
            connections: HashMap::new(),
            remote_index: HashMap::new(),
            pending_object_fetch: HashMap::new(),
            pending_interests: HashMap::new(),
            uplink_rx: Some(uplink_rx),
            client_tx,
            client_rx: Some(client_rx),
            events_tx,
            events_rx: Some(events_rx),
        };

        for uberdog in &service.uberdogs {
            Self::subscribe(&service.uplink, doid_as_channel(uberdog.id as DoId)).await?;
        }
        Ok(Arc::new(Mutex::new(service)))
    }

    async fn start(conf: config::DonetConfig, dc: Option<DCFile>) -> Result<JoinHandle<Result<()>>> {
        let ca_conf = conf
            .services
            .client_agent
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "Missing client-agent configuration."))?;

        let md_address = conf
            .services
            .message_director
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "Client Agent requires a Message Director."))?
            .bind;

        let service = Self::create(CreateInfo { service_conf: ca_conf, md_address, dc }, None).await?;
        Ok(Self::spawn_async_task(Self::main(service)))
    }

    async fn main(service: Arc<Mutex<Self::Service>>) -> Result<()> {
        let (mut uplink_rx, mut client_rx, mut events_rx, acceptor, client_tx) = {
            let mut guard = service.lock().await;
            (
                guard.uplink_rx.take().expect("Client Agent main loop already started."),
                guard.client_rx.take().expect("Client Agent main loop already started."),
                guard.events_rx.take().expect("Client Agent main loop already started."),
                guard.acceptor.clone(),
                guard.client_tx.clone(),
            )
        };

        let accept_service = service.clone();
        tokio::spawn(async move {
            loop {
                let accept_result = { acceptor.lock().await.socket.accept().await };
                match accept_result {
                    Ok((socket, remote)) => {
                        if let Err(e) = ClientAgent::accept_connection(accept_service.clone(), socket, remote, client_tx.clone()).await
                        {
                            warn!("Client Agent failed to accept {}: {}", remote, e);
                        }
                    }
                    Err(e) => warn!("Client Agent accept loop error: {}", e),
                }
            }
        });

        loop {
            tokio::select! {
                Some(recv) = uplink_rx.recv() => {
                    if let Err(e) = Self::dispatch_uplink(service.clone(), recv.dgi).await {
                        warn!("Client Agent failed to handle an uplink message: {}", e);
                    }
                }
                Some(recv) = client_rx.recv() => {
                    if let Err(e) = Self::dispatch_client(service.clone(), recv.remote, recv.dgi).await {
                        warn!("Client Agent failed to handle a client message: {}", e);
                    }
                }
                Some(event) = events_rx.recv() => {
                    Self::handle_timer_event(service.clone(), event).await;
                }
                else => break,
            }
        }
        Ok(())
    }
}

impl ClientAgent {
    async fn route(client: &Arc<Mutex<Client>>, dg: Datagram) -> Result<()> {
        client.lock().await.stage_datagram(dg).await
    }

    async fn subscribe(client: &Arc<Mutex<Client>>, channel: Channel) -> Result<()> {
        let mut dg = Datagram::default();
        dg.add_control_header(Protocol::MDAddChannel.into()).unwrap();
        dg.add_channel(channel).unwrap();
        Self::route(client, dg).await
    }

    async fn unsubscribe(client: &Arc<Mutex<Client>>, channel: Channel) -> Result<()> {
        let mut dg = Datagram::default();
        dg.add_control_header(Protocol::MDRemoveChannel.into()).unwrap();
        dg.add_channel(channel).unwrap();
        Self::route(client, dg).await
    }

    async fn accept_connection(
        service: Arc<Mutex<Self>>,
        socket: tokio::net::TcpStream,
        remote: SocketAddr,
        client_tx: mpsc::Sender<RecvData>,
    ) -> Result<()> {
        let client = Arc::new(Mutex::new(Client::from(socket)));
        client.lock().await.spawn_recv_send_tasks(client_tx).await;

        let mut guard = service.lock().await;
        let Some(channel) = guard.channels.allocate() else {
            warn!("Client Agent channel range exhausted; rejecting connection from {}.", remote);
            return Ok(());
        };

        let uplink = guard.uplink.clone();
        Self::subscribe(&uplink, channel).await?;

        let mut participant = ClientParticipant::new(channel);
        participant.start_auth_timer(guard.auth_timeout, guard.events_tx.clone());

        guard.remote_index.insert(remote, channel);
        guard.connections.insert(channel, Connected { client, participant });
        trace!("Accepted client {} on channel {}.", remote, channel);
        Ok(())
    }

    async fn disconnect(&mut self, channel: Channel, reason: &str) {
        if let Some(mut connected) = self.connections.remove(&channel) {
            connected.participant.shutdown_timers();
            self.remote_index.retain(|_, c| *c != channel);

            for interest in connected.participant.interests.values() {
                for zone in &interest.zones {
                    let _ = Self::unsubscribe(&self.uplink, location_as_channel(interest.parent, *zone)).await;
                }
            }
            let _ = Self::unsubscribe(&self.uplink, channel).await;
            self.pending_interests.retain(|(c, _), _| *c != channel);
            trace!("Disconnected channel {}: {}", channel, reason);
        }
    }

    /// Sends `CLIENT_EJECT(code, reason)` to a still-connected client,
    /// then tears down its connection. The single exit gate every
    /// disconnect-with-reason path (timers, protocol violations,
    /// authorization failures, session-object loss) routes through.
    async fn eject(guard: &mut tokio::sync::MutexGuard<'_, Self>, channel: Channel, code: u16, reason: &str) {
        if let Some(connected) = guard.connections.get(&channel) {
            let client = connected.client.clone();
            let mut dg = Datagram::default();
            dg.add_u16(Protocol::ClientEject.into()).unwrap();
            dg.add_u16(code).unwrap();
            dg.add_string(reason).unwrap();
            let _ = Self::route(&client, dg).await;
        }
        guard.disconnect(channel, reason).await;
    }

    async fn reject(service: Arc<Mutex<Self>>, channel: Channel, reason: &str, code: u16) {
        let mut guard = service.lock().await;
        Self::eject(&mut guard, channel, code, reason).await;
    }

    async fn handle_timer_event(service: Arc<Mutex<Self>>, event: ParticipantEvent) {
        let (channel, reason, code, is_auth_timeout) = match event {
            ParticipantEvent::AuthTimeout(c) => (c, "authentication timed out", REASON_NO_HELLO, true),
            ParticipantEvent::HeartbeatTimeout(c) => (c, "heartbeat timed out", REASON_TIMEOUT, false),
        };
        let mut guard = service.lock().await;
        if is_auth_timeout && guard.connections.get(&channel).is_some_and(|c| c.participant.state != ClientState::New) {
            return;
        }
        Self::eject(&mut guard, channel, code, reason).await;
    }

    /// If `channel` has an in-flight `InterestOperation` expecting
    /// `doid` but hasn't fetched its required fields yet, queues `dg`
    /// for replay once that operation finishes and returns `None`.
    /// Otherwise hands `dg` back so the caller can deliver it now
    /// (Testable Property 5).
    fn queue_if_pending(
        pending_interests: &mut HashMap<(Channel, DoId), PendingInterest>,
        channel: Channel,
        doid: DoId,
        dg: Datagram,
    ) -> Option<Datagram> {
        for ((c, _parent), pending) in pending_interests.iter_mut() {
            if *c == channel && pending.op.expected_objects.contains(&doid) && !pending.op.fetched.contains_key(&doid) {
                pending.op.enqueue(doid, dg);
                return None;
            }
        }
        Some(dg)
    }

    // --- messages arriving on the uplink (from the Message Director) ---

    async fn dispatch_uplink(service: Arc<Mutex<Self>>, mut dgi: DatagramIterator) -> Result<()> {
        let _sender_of_envelope = dgi.read_channel().unwrap();
        let recipient_count = dgi.read_u8().unwrap();
        let mut recipients = Vec::with_capacity(recipient_count.into());
        for _ in 0..recipient_count {
            recipients.push(dgi.read_channel().unwrap());
        }
        let sender = dgi.read_channel().unwrap();
        let msg_type = dgi
            .read_msg_type()
            .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;

        match msg_type {
            Protocol::SSObjectGetZoneCountResp | Protocol::SSObjectGetZonesCountResp => {
                Self::handle_zone_count_resp(service, &mut dgi, sender, &recipients).await?
            }
            Protocol::SSObjectEnterLocationWithRequired | Protocol::SSObjectEnterLocationWithRequiredOther => {
                Self::handle_enter_location(service, &mut dgi, &recipients).await?
            }
            Protocol::SSObjectGetAllResp => Self::handle_get_all_resp(service, &mut dgi, sender, &recipients).await?,
            Protocol::SSObjectDeleteRAM => Self::handle_delete_ram(service, &mut dgi, &recipients).await?,
            Protocol::SSObjectChangingLocation => Self::handle_changing_location(service, &mut dgi, &recipients).await?,
            Protocol::SSObjectChangingOwner => Self::handle_changing_owner(service, &mut dgi, &recipients).await?,
            Protocol::CASetState => Self::handle_set_state(service, &mut dgi, &recipients).await?,
            Protocol::CAAddSessionObject => Self::handle_session_object(service, &mut dgi, &recipients, true).await?,
            Protocol::CARemoveSessionObject => Self::handle_session_object(service, &mut dgi, &recipients, false).await?,
            Protocol::CADeclareObject => Self::handle_declare_object(service, &mut dgi, &recipients, true).await?,
            Protocol::CAUndeclareObject => Self::handle_declare_object(service, &mut dgi, &recipients, false).await?,
            Protocol::CASetFieldsSendable => Self::handle_set_fields_sendable(service, &mut dgi, &recipients).await?,
            Protocol::ClientObjectSetField
            | Protocol::ClientObjectSetFields
            | Protocol::ClientObjectLeaving
            | Protocol::ClientObjectLeavingOwner
            | Protocol::ClientEnterObjectRequired
            | Protocol::ClientEnterObjectRequiredOther
            | Protocol::ClientEnterObjectRequiredOwner
            | Protocol::ClientEnterObjectRequiredOwnerOther => {
                Self::forward_raw(service, &recipients, msg_type, &mut dgi).await?;
            }
            _ => trace!("Client Agent ignoring unhandled uplink message {:?}", msg_type),
        }
        Ok(())
    }

    /// Forwards a message's payload to every connected client whose
    /// channel (own or via an open interest's location channel) is
    /// among `recipients`, verbatim apart from the internal header.
    ///
    /// `ClientObjectSetField(s)`/`ClientObjectLeaving(Owner)` carry the
    /// target DoId as their first field; if that DoId belongs to a
    /// client's in-flight `InterestOperation` and hasn't been entered
    /// yet, the message is queued on the operation instead of sent
    /// immediately (Testable Property 5).
    async fn forward_raw(
        service: Arc<Mutex<Self>>,
        recipients: &[Channel],
        msg_type: Protocol,
        dgi: &mut DatagramIterator,
    ) -> Result<()> {
        let remaining = dgi.get_remaining();
        let payload = dgi.read_data(remaining).unwrap();
        let owner_variant = matches!(
            msg_type,
            Protocol::ClientEnterObjectRequiredOwner | Protocol::ClientEnterObjectRequiredOwnerOther
        );
        let queueable = matches!(
            msg_type,
            Protocol::ClientObjectSetField | Protocol::ClientObjectSetFields | Protocol::ClientObjectLeaving | Protocol::ClientObjectLeavingOwner
        );
        let leading_doid: Option<DoId> = payload.get(..4).and_then(|b| b.try_into().ok()).map(u32::from_le_bytes);

        let mut guard = service.lock().await;
        let mut targets = Vec::new();
        for (channel, connected) in &mut guard.connections {
            if Self::channel_matches(*channel, &connected.participant, recipients) {
                if owner_variant {
                    if let Some(doid) = leading_doid {
                        connected.participant.owned_objects.insert(doid);
                    }
                }
                targets.push((*channel, connected.client.clone()));
            }
        }

        let mut to_send = Vec::new();
        for (channel, client) in targets {
            let mut dg = Datagram::default();
            dg.add_u16(msg_type.into()).unwrap();
            dg.add_data(payload.clone()).unwrap();

            if queueable {
                if let Some(doid) = leading_doid {
                    match Self::queue_if_pending(&mut guard.pending_interests, channel, doid, dg) {
                        Some(dg) => to_send.push((client, dg)),
                        None => {}
                    }
                    continue;
                }
            }
            to_send.push((client, dg));
        }
        drop(guard);

        for (client, dg) in to_send {
            Self::route(&client, dg).await?;
        }
        Ok(())
    }

    fn channel_matches(channel: Channel, participant: &ClientParticipant, recipients: &[Channel]) -> bool {
        if recipients.contains(&channel) {
            return true;
        }
        for interest in participant.interests.values() {
            for zone in &interest.zones {
                if recipients.contains(&location_as_channel(interest.parent, *zone)) {
                    return true;
                }
            }
        }
        false
    }

    async fn handle_zone_count_resp(
        service: Arc<Mutex<Self>>,
        dgi: &mut DatagramIterator,
        sender: Channel,
        recipients: &[Channel],
    ) -> Result<()> {
        let count = dgi.read_u32().unwrap();
        let Some(&participant_channel) = recipients.first() else { return Ok(()) };
        let parent = sender as DoId;

        let mut guard = service.lock().await;
        let Some(pending) = guard.pending_interests.get_mut(&(participant_channel, parent)) else {
            return Ok(());
        };

        if count == 0 {
            let op = guard.pending_interests.remove(&(participant_channel, parent)).unwrap().op;
            Self::finish_interest(&mut guard, participant_channel, op).await?;
            return Ok(());
        }
        pending.expected = Some(count);

        let zones: Vec<Zone> = pending.op.pending_zones.iter().copied().collect();
        let uplink = guard.uplink.clone();
        drop(guard);

        let mut dg = Datagram::default();
        dg.add_server_header(
            vec![doid_as_channel(parent)],
            participant_channel,
            Protocol::SSObjectGetZonesObjects.into(),
        )
        .unwrap();
        dg.add_doid(parent).unwrap();
        dg.add_u16(zones.len() as u16).unwrap();
        for zone in zones {
            dg.add_zone(zone).unwrap();
        }
        Self::route(&uplink, dg).await
    }

    /// Handles `SS_OBJECT_ENTER_LOCATION_WITH_REQUIRED[_OTHER]`. The
    /// same wire message carries two distinct meanings depending on
    /// which channel it was addressed to (§4.4): addressed directly to
    /// a participant with a matching in-flight `InterestOperation`, the
    /// arrival is "expected" and counted toward completion; addressed
    /// to a zone's location channel a client is merely subscribed to
    /// (an object entering a zone already covered by an open
    /// interest), it's delivered as soon as its fields are fetched,
    /// uncounted.
    async fn handle_enter_location(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, recipients: &[Channel]) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let parent = dgi.read_doid().unwrap();
        let zone = dgi.read_zone().unwrap();

        let mut guard = service.lock().await;
        let uplink = guard.uplink.clone();
        let mut from_channel = None;

        for &recipient in recipients {
            if let Some(pending) = guard.pending_interests.get_mut(&(recipient, parent)) {
                pending.op.record_expected(doid);
                guard.pending_object_fetch.insert(doid, FetchTarget::Interest { channel: recipient, parent, zone });
                from_channel.get_or_insert(recipient);
            } else {
                let matching: Vec<Channel> = guard
                    .connections
                    .iter()
                    .filter(|(channel, connected)| {
                        **channel == recipient || Self::channel_matches(**channel, &connected.participant, &[recipient])
                    })
                    .map(|(channel, _)| *channel)
                    .collect();
                for channel in matching {
                    guard.pending_object_fetch.insert(doid, FetchTarget::Direct { channel, parent, zone });
                    from_channel.get_or_insert(channel);
                }
            }
        }
        drop(guard);

        // `sender` doubles as the reply-to address the State Server
        // echoes back (§4.4's `SS_OBJECT_GET_ALL_RESP` repeats it as the
        // response's recipient); a participant channel the CA already
        // subscribes to on that client's behalf.
        let Some(from_channel) = from_channel else { return Ok(()) };
        let mut dg = Datagram::default();
        dg.add_server_header(vec![doid_as_channel(doid)], from_channel, Protocol::SSObjectGetAll.into())
            .unwrap();
        dg.add_doid(doid).unwrap();
        Self::route(&uplink, dg).await
    }

    /// Finalizes a ready `InterestOperation`: sends the expected-object
    /// `CLIENT_ENTER_OBJECT_REQUIRED_OTHER` batch, then any datagrams
    /// queued behind it, then `CLIENT_DONE_INTEREST_RESP` — the
    /// ordering §4.4's interest-completion algorithm and Testable
    /// Property 5 require.
    async fn finish_interest(guard: &mut tokio::sync::MutexGuard<'_, Self>, participant_channel: Channel, op: InterestOperation) -> Result<()> {
        let Some(connected) = guard.connections.get_mut(&participant_channel) else {
            return Ok(());
        };
        let client = connected.client.clone();
        let participant = &mut connected.participant;

        for (&doid, obj) in &op.fetched {
            participant.visible.insert(doid, VisibleObject { parent: obj.parent, zone: obj.zone, dclass: obj.dclass });
            participant.seen.insert(doid);

            let mut dg = Datagram::default();
            dg.add_u16(Protocol::ClientEnterObjectRequiredOther.into()).unwrap();
            dg.add_doid(doid).unwrap();
            dg.add_location(obj.parent, obj.zone).unwrap();
            dg.add_u16(obj.dclass).unwrap();
            dg.add_u16(obj.fields.len() as u16).unwrap();
            for (fid, value) in &obj.fields {
                dg.add_u16(*fid).unwrap();
                dg.add_blob(value.clone()).unwrap();
            }
            Self::route(&client, dg).await?;
        }

        for (_, dg) in op.queued {
            Self::route(&client, dg).await?;
        }

        let done = guard.dialect.encode_done_interest_resp(op.context, op.interest_id);
        Self::route(&client, done).await
    }

    async fn handle_get_all_resp(
        service: Arc<Mutex<Self>>,
        dgi: &mut DatagramIterator,
        sender: Channel,
        _recipients: &[Channel],
    ) -> Result<()> {
        let found = dgi.read_bool().unwrap();
        if !found {
            return Ok(());
        }
        let dclass: DClassId = dgi.read_u16().unwrap();
        let field_count = dgi.read_u16().unwrap();
        let mut fields = Vec::with_capacity(field_count.into());
        for _ in 0..field_count {
            let fid = dgi.read_u16().unwrap();
            let size = dgi.read_size().unwrap();
            let value = dgi.read_data(usize::from(size)).unwrap();
            fields.push((fid, value));
        }

        let doid = sender as DoId;
        let mut guard = service.lock().await;
        let Some(target) = guard.pending_object_fetch.remove(&doid) else {
            return Ok(());
        };

        match target {
            FetchTarget::Interest { channel, parent, zone } => {
                let Some(pending) = guard.pending_interests.get_mut(&(channel, parent)) else {
                    return Ok(());
                };
                pending.op.record_fetched(doid, FetchedObject { parent, zone, dclass, fields });
                let ready = pending.expected.is_some_and(|n| pending.op.is_ready(n));
                if ready {
                    let op = guard.pending_interests.remove(&(channel, parent)).unwrap().op;
                    Self::finish_interest(&mut guard, channel, op).await?;
                }
                Ok(())
            }
            FetchTarget::Direct { channel, parent, zone } => {
                let Some(connected) = guard.connections.get_mut(&channel) else {
                    return Ok(());
                };
                connected.participant.visible.insert(doid, VisibleObject { parent, zone, dclass });
                connected.participant.seen.insert(doid);
                let client = connected.client.clone();
                drop(guard);

                let mut dg = Datagram::default();
                dg.add_u16(Protocol::ClientEnterObjectRequiredOther.into()).unwrap();
                dg.add_doid(doid).unwrap();
                dg.add_location(parent, zone).unwrap();
                dg.add_u16(dclass).unwrap();
                dg.add_u16(fields.len() as u16).unwrap();
                for (fid, value) in fields {
                    dg.add_u16(fid).unwrap();
                    dg.add_blob(value).unwrap();
                }
                Self::route(&client, dg).await
            }
        }
    }

    /// `SS_OBJECT_DELETE_RAM`: a session object disappearing always
    /// disconnects the CP holding it; otherwise the object is retired
    /// out of visibility (§4.4).
    async fn handle_delete_ram(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, recipients: &[Channel]) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let mut guard = service.lock().await;

        let mut to_disconnect = Vec::new();
        for &channel in recipients {
            let Some(connected) = guard.connections.get_mut(&channel) else { continue };
            let participant = &mut connected.participant;
            if !participant.visible.contains_key(&doid) && !participant.owned_objects.contains(&doid) {
                continue;
            }
            if participant.session_objects.contains(&doid) {
                to_disconnect.push(channel);
            } else {
                participant.retire_object(doid);
            }
        }
        for channel in to_disconnect {
            Self::eject(&mut guard, channel, REASON_SESSION_OBJECT_DELETED, "session object deleted").await;
        }
        Ok(())
    }

    /// `SS_OBJECT_CHANGING_LOCATION`: an owned object always stays
    /// visible (its owner must always know where it is); a location
    /// still covered by an open interest stays visible too; otherwise
    /// a session object forces a disconnect and anything else is
    /// retired out of visibility (§4.4).
    async fn handle_changing_location(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, recipients: &[Channel]) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let new_parent = dgi.read_doid().unwrap();
        let new_zone = dgi.read_zone().unwrap();

        let mut guard = service.lock().await;
        let mut to_disconnect = Vec::new();
        let mut to_notify = Vec::new();

        for &channel in recipients {
            let Some(connected) = guard.connections.get_mut(&channel) else { continue };
            let participant = &mut connected.participant;
            let Some(visible) = participant.visible.get(&doid).copied() else { continue };
            let still_covered = participant.interests.values().any(|i| i.parent == new_parent && i.zones.contains(&new_zone));

            if participant.owned_objects.contains(&doid) || still_covered {
                participant.visible.insert(doid, VisibleObject { parent: new_parent, zone: new_zone, dclass: visible.dclass });
                if participant.seen.contains(&doid) {
                    to_notify.push((connected.client.clone(), doid, new_parent, new_zone));
                }
            } else if participant.session_objects.contains(&doid) {
                to_disconnect.push(channel);
            } else {
                participant.retire_object(doid);
            }
        }

        for channel in to_disconnect {
            Self::eject(&mut guard, channel, REASON_SESSION_OBJECT_DELETED, "session object relocated out of view").await;
        }
        drop(guard);

        for (client, doid, parent, zone) in to_notify {
            let mut dg = Datagram::default();
            dg.add_u16(Protocol::ClientObjectLocation.into()).unwrap();
            dg.add_doid(doid).unwrap();
            dg.add_location(parent, zone).unwrap();
            Self::route(&client, dg).await?;
        }
        Ok(())
    }

    /// `SS_OBJECT_CHANGING_OWNER`: losing ownership of a session object
    /// disconnects the CP; otherwise it emits
    /// `CLIENT_OBJECT_LEAVING_OWNER` and drops the DoId from `owned`.
    async fn handle_changing_owner(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, recipients: &[Channel]) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let new_owner = dgi.read_channel().unwrap();

        let mut guard = service.lock().await;
        let mut to_disconnect = Vec::new();
        let mut to_notify = Vec::new();

        for &channel in recipients {
            if new_owner == channel {
                continue;
            }
            let Some(connected) = guard.connections.get_mut(&channel) else { continue };
            if !connected.participant.owned_objects.remove(&doid) {
                continue;
            }
            if connected.participant.session_objects.contains(&doid) {
                to_disconnect.push(channel);
            } else {
                to_notify.push((connected.client.clone(), doid));
            }
        }

        for channel in to_disconnect {
            Self::eject(&mut guard, channel, REASON_SESSION_OBJECT_DELETED, "session object ownership transferred").await;
        }
        drop(guard);

        for (client, doid) in to_notify {
            let mut dg = Datagram::default();
            dg.add_u16(Protocol::ClientObjectLeavingOwner.into()).unwrap();
            dg.add_doid(doid).unwrap();
            Self::route(&client, dg).await?;
        }
        Ok(())
    }

    /// `CLIENTAGENT_SET_STATE`: the only transition this crate models
    /// is `ANONYMOUS -> ESTABLISHED`, driven by a caller (typically a
    /// login UberDOG) that just granted a client its session object.
    async fn handle_set_state(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, recipients: &[Channel]) -> Result<()> {
        let state = dgi.read_u8().unwrap();
        if state != ClientState::Established as u8 {
            return Ok(());
        }
        let mut guard = service.lock().await;
        for &channel in recipients {
            if let Some(connected) = guard.connections.get_mut(&channel) {
                if connected.participant.state == ClientState::Anonymous {
                    connected.participant.state = ClientState::Established;
                    trace!("Channel {} transitioned to ESTABLISHED.", channel);
                }
            }
        }
        Ok(())
    }

    /// `CLIENTAGENT_ADD_SESSION_OBJECT`/`CLIENTAGENT_REMOVE_SESSION_OBJECT`.
    async fn handle_session_object(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, recipients: &[Channel], add: bool) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let mut guard = service.lock().await;
        for &channel in recipients {
            if let Some(connected) = guard.connections.get_mut(&channel) {
                if add {
                    connected.participant.session_objects.insert(doid);
                } else {
                    connected.participant.session_objects.remove(&doid);
                }
            }
        }
        Ok(())
    }

    /// `CLIENTAGENT_DECLARE_OBJECT`/`CLIENTAGENT_UNDECLARE_OBJECT`.
    async fn handle_declare_object(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, recipients: &[Channel], declare: bool) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let mut guard = service.lock().await;
        for &channel in recipients {
            if let Some(connected) = guard.connections.get_mut(&channel) {
                if declare {
                    connected.participant.declared.insert(doid);
                } else {
                    connected.participant.declared.remove(&doid);
                }
            }
        }
        Ok(())
    }

    /// `CLIENTAGENT_SET_FIELDS_SENDABLE`: grants a per-object field
    /// override outside the DC schema's own `clsend`/`ownsend` flags.
    async fn handle_set_fields_sendable(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, recipients: &[Channel]) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let count = dgi.read_u16().unwrap();
        let mut fields = std::collections::HashSet::with_capacity(count.into());
        for _ in 0..count {
            fields.insert(dgi.read_u16().unwrap());
        }
        let mut guard = service.lock().await;
        for &channel in recipients {
            if let Some(connected) = guard.connections.get_mut(&channel) {
                connected.participant.fields_sendable.insert(doid, fields.clone());
            }
        }
        Ok(())
    }

    /// Retires every object visible to `participant` only through
    /// `parent`/one of `zones`, stopping at the first session object
    /// found — it forces a disconnect instead of a quiet retirement.
    /// Returns the DoIds whose departure must be notified to the
    /// client (it had already been sent their `ENTER`) and the session
    /// object hit, if any (Testable Property 7).
    fn apply_close_zones(participant: &mut ClientParticipant, parent: DoId, zones: &[Zone]) -> (Vec<DoId>, Option<DoId>) {
        let affected: Vec<DoId> = participant
            .visible
            .iter()
            .filter(|(_, v)| v.parent == parent && zones.contains(&v.zone))
            .map(|(doid, _)| *doid)
            .collect();

        let mut session_hit = None;
        let mut leaving = Vec::new();
        for doid in affected {
            if participant.session_objects.contains(&doid) {
                session_hit = Some(doid);
                break;
            }
            let notify = participant.seen.contains(&doid);
            participant.retire_object(doid);
            if notify {
                leaving.push(doid);
            }
        }
        (leaving, session_hit)
    }

    /// §4.4 `CloseZones`: evicts every object visible to `channel`
    /// only through `parent`/one of `zones` — disconnecting the CP if
    /// one turns out to be a session object — then unsubscribes those
    /// zones' location channels.
    async fn close_zones(guard: &mut tokio::sync::MutexGuard<'_, Self>, channel: Channel, parent: DoId, zones: &[Zone]) -> Result<()> {
        let (client, leaving, session_hit) = {
            let Some(connected) = guard.connections.get_mut(&channel) else {
                return Ok(());
            };
            let (leaving, session_hit) = Self::apply_close_zones(&mut connected.participant, parent, zones);
            (connected.client.clone(), leaving, session_hit)
        };

        for doid in &leaving {
            let mut dg = Datagram::default();
            dg.add_u16(Protocol::ClientObjectLeaving.into()).unwrap();
            dg.add_doid(*doid).unwrap();
            Self::route(&client, dg).await?;
        }

        if session_hit.is_some() {
            Self::eject(guard, channel, REASON_SESSION_OBJECT_DELETED, "session object left visibility").await;
        }

        let uplink = guard.uplink.clone();
        for &zone in zones {
            Self::unsubscribe(&uplink, location_as_channel(parent, zone)).await?;
        }
        Ok(())
    }

    // --- messages arriving from a connected game client ---

    async fn dispatch_client(service: Arc<Mutex<Self>>, remote: SocketAddr, mut dgi: DatagramIterator) -> Result<()> {
        let mut guard = service.lock().await;
        let Some(&channel) = guard.remote_index.get(&remote) else {
            return Ok(());
        };
        let msg_type = match dgi.read_msg_type() {
            Ok(t) => t,
            Err(_) => {
                drop(guard);
                Self::reject(service, channel, "truncated client datagram", REASON_TRUNCATED_DATAGRAM).await;
                return Ok(());
            }
        };

        let state = guard.connections.get(&channel).map(|c| c.participant.state);
        drop(guard);

        let result: Result<()> = match (state, msg_type) {
            (None, _) => Ok(()),
            (Some(ClientState::New), Protocol::ClientHello) => Self::handle_hello(service.clone(), channel, &mut dgi).await,
            (Some(ClientState::New), _) => {
                Self::reject(service.clone(), channel, "CLIENT_HELLO required before any other message", REASON_NO_HELLO).await;
                Ok(())
            }
            (Some(_), Protocol::ClientHeartbeat) => {
                let mut guard = service.lock().await;
                if let Some(connected) = guard.connections.get_mut(&channel) {
                    connected.participant.record_heartbeat();
                }
                Ok(())
            }
            (Some(_), Protocol::ClientDisconnect) => {
                service.lock().await.disconnect(channel, "client requested disconnect").await;
                Ok(())
            }
            (Some(ClientState::Anonymous), other)
                if !matches!(other, Protocol::ClientObjectSetField | Protocol::ClientObjectSetFields) =>
            {
                Self::reject(service.clone(), channel, "message not permitted for an anonymous client", REASON_ANONYMOUS_VIOLATION).await;
                Ok(())
            }
            (Some(_), Protocol::ClientAddInterest) => Self::handle_add_interest(service.clone(), channel, &mut dgi, false).await,
            (Some(_), Protocol::ClientAddInterestMultiple) => Self::handle_add_interest(service.clone(), channel, &mut dgi, true).await,
            (Some(_), Protocol::ClientRemoveInterest) => Self::handle_remove_interest(service.clone(), channel, &mut dgi).await,
            (Some(_), Protocol::ClientObjectSetField) => Self::handle_client_set_field(service.clone(), channel, &mut dgi, false).await,
            (Some(_), Protocol::ClientObjectSetFields) => Self::handle_client_set_field(service.clone(), channel, &mut dgi, true).await,
            (Some(_), Protocol::ClientObjectLocation) => Self::handle_client_set_location(service.clone(), channel, &mut dgi).await,
            (Some(_), other) => {
                trace!("Client Agent ignoring unhandled client message {:?}", other);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Client Agent rejecting channel {} for a malformed datagram: {}", channel, e);
            Self::reject(service, channel, "malformed client datagram", REASON_TRUNCATED_DATAGRAM).await;
        }
        Ok(())
    }

    async fn handle_hello(service: Arc<Mutex<Self>>, channel: Channel, dgi: &mut DatagramIterator) -> Result<()> {
        let mut guard = service.lock().await;
        let hello = guard.dialect.parse_hello(dgi)?;

        if hello.version != guard.version_string {
            drop(guard);
            Self::reject(service, channel, "client/server version mismatch", REASON_BAD_VERSION).await;
            return Ok(());
        }
        if let Some(dc) = &guard.dc {
            if hello.dc_hash != dc.hash {
                drop(guard);
                Self::reject(service, channel, "client/server DC file hash mismatch", REASON_BAD_DCHASH).await;
                return Ok(());
            }
        }

        let heartbeat_interval = guard.heartbeat_interval;
        let events_tx = guard.events_tx.clone();
        if let Some(connected) = guard.connections.get_mut(&channel) {
            connected.participant.cancel_auth_timer();
            connected.participant.state = ClientState::Anonymous;
            connected.participant.start_heartbeat_timer(heartbeat_interval, events_tx);

            let mut resp = Datagram::default();
            resp.add_u16(Protocol::ClientHelloResp.into()).unwrap();
            let client = connected.client.clone();
            drop(guard);
            Self::route(&client, resp).await?;
        }
        Ok(())
    }

    /// Zones a narrowed or removed interest no longer covers that must
    /// actually be closed — excluding any zone still covered by
    /// another of the same client's open interests on the same parent
    /// (a client holding two overlapping interests narrowing one of
    /// them shouldn't lose objects the other still grants it — §4.4
    /// scenario S6).
    fn zones_to_close(interests: &HashMap<u16, Interest>, excluding: u16, parent: DoId, candidates: &[Zone]) -> Vec<Zone> {
        candidates
            .iter()
            .copied()
            .filter(|z| !interests.values().any(|i| i.id != excluding && i.parent == parent && i.zones.contains(z)))
            .collect()
    }

    async fn handle_add_interest(service: Arc<Mutex<Self>>, channel: Channel, dgi: &mut DatagramIterator, multiple: bool) -> Result<()> {
        let mut guard = service.lock().await;
        if guard.interests_permission == InterestsPermission::Disabled {
            return Ok(());
        }
        let req = guard.dialect.parse_add_interest(dgi, multiple)?;

        let Some(connected) = guard.connections.get_mut(&channel) else { return Ok(()) };
        let existing = connected.participant.interests.get(&req.interest_id).cloned();
        let new_zones = match &existing {
            Some(existing) => existing.new_zones(&req.zones),
            None => req.zones.clone(),
        };
        let killed_zones: Vec<Zone> = match &existing {
            Some(existing) => Self::zones_to_close(
                &connected.participant.interests,
                req.interest_id,
                req.parent,
                &existing.killed_zones(&req.zones),
            ),
            None => Vec::new(),
        };
        connected
            .participant
            .interests
            .insert(req.interest_id, Interest::new(req.interest_id, req.parent, req.zones.clone()));

        if !killed_zones.is_empty() {
            Self::close_zones(&mut guard, channel, req.parent, &killed_zones).await?;
        }

        let uplink = guard.uplink.clone();
        for &zone in &new_zones {
            Self::subscribe(&uplink, location_as_channel(req.parent, zone)).await?;
        }

        if new_zones.is_empty() {
            let op = InterestOperation::new(req.context, req.interest_id, req.parent, Vec::new());
            Self::finish_interest(&mut guard, channel, op).await?;
            return Ok(());
        }

        let op = InterestOperation::new(req.context, req.interest_id, req.parent, new_zones.clone());
        guard.pending_interests.insert((channel, req.parent), PendingInterest { op, expected: None });
        drop(guard);

        let mut dg = Datagram::default();
        dg.add_server_header(vec![doid_as_channel(req.parent)], channel, Protocol::SSObjectGetZonesCount.into())
            .unwrap();
        dg.add_doid(req.parent).unwrap();
        dg.add_u16(new_zones.len() as u16).unwrap();
        for zone in new_zones {
            dg.add_zone(zone).unwrap();
        }
        Self::route(&uplink, dg).await
    }

    async fn handle_remove_interest(service: Arc<Mutex<Self>>, channel: Channel, dgi: &mut DatagramIterator) -> Result<()> {
        let interest_id = dgi.read_u16()?;
        let mut guard = service.lock().await;
        let removed = guard
            .connections
            .get_mut(&channel)
            .and_then(|connected| connected.participant.interests.remove(&interest_id));
        let Some(interest) = removed else { return Ok(()) };

        let killed_zones: Vec<Zone> = {
            let Some(connected) = guard.connections.get(&channel) else { return Ok(()) };
            let candidates: Vec<Zone> = interest.zones.iter().copied().collect();
            Self::zones_to_close(&connected.participant.interests, interest_id, interest.parent, &candidates)
        };

        if !killed_zones.is_empty() {
            Self::close_zones(&mut guard, channel, interest.parent, &killed_zones).await?;
        }
        Ok(())
    }

    /// Whether `doid` may receive a `CLIENT_OBJECT_SET_FIELD` from this
    /// participant: owned, visible-and-seen, or explicitly declared
    /// (`ClientParticipant::may_target`), or — before the client has
    /// reached `ESTABLISHED` — a configured anonymous UberDOG, since
    /// login flows send fields to a login UberDOG before the client
    /// owns anything yet (Testable Property 6).
    fn may_set_field(participant: &ClientParticipant, uberdogs: &[UberDog], doid: DoId) -> bool {
        let anonymous_target = uberdogs.iter().any(|u| u.anonymous && u.id as DoId == doid);
        participant.may_target(doid) || (participant.state != ClientState::Established && anonymous_target)
    }

    async fn handle_client_set_field(service: Arc<Mutex<Self>>, channel: Channel, dgi: &mut DatagramIterator, multi: bool) -> Result<()> {
        let doid = dgi.read_doid()?;
        let mut updates = Vec::new();
        if multi {
            let count = dgi.read_u16()?;
            for _ in 0..count {
                let fid = dgi.read_u16()?;
                let size = dgi.read_size()?;
                updates.push((fid, dgi.read_data(usize::from(size))?));
            }
        } else {
            let fid = dgi.read_u16()?;
            let size = dgi.read_size()?;
            updates.push((fid, dgi.read_data(usize::from(size))?));
        }

        let guard = service.lock().await;
        let Some(connected) = guard.connections.get(&channel) else { return Ok(()) };
        let participant = &connected.participant;

        if !Self::may_set_field(participant, &guard.uberdogs, doid) {
            drop(guard);
            Self::reject(service, channel, "CLIENT_OBJECT_SET_FIELD to an object outside visibility", REASON_FORBIDDEN_FIELD).await;
            return Ok(());
        }

        let dclass = if let Some(visible) = participant.visible.get(&doid) {
            guard.dc.as_ref().and_then(|dc| dc.get_class(visible.dclass))
        } else {
            guard
                .uberdogs
                .iter()
                .find(|u| u.id as DoId == doid)
                .and_then(|u| guard.dc.as_ref().and_then(|dc| dc.get_class_by_name(&u.class)))
        };

        let mut authorized = Vec::with_capacity(updates.len());
        for (fid, value) in updates {
            let allowed = match dclass.and_then(|c| c.get_field(fid)) {
                Some(field) => participant.field_sendable(doid, fid, field.flags.is_clsend(), field.flags.is_ownsend()),
                None => participant.fields_sendable.get(&doid).is_some_and(|fields| fields.contains(&fid)),
            };
            if allowed {
                authorized.push((fid, value));
            }
        }
        if authorized.is_empty() {
            drop(guard);
            Self::reject(service, channel, "no sendable field in CLIENT_OBJECT_SET_FIELD", REASON_FORBIDDEN_FIELD).await;
            return Ok(());
        }

        let uplink = guard.uplink.clone();
        drop(guard);

        let msg_type = if authorized.len() > 1 { Protocol::SSObjectSetFields } else { Protocol::SSObjectSetField };
        let mut dg = Datagram::default();
        dg.add_server_header(vec![doid_as_channel(doid)], channel, msg_type.into()).unwrap();
        dg.add_doid(doid).unwrap();
        if msg_type == Protocol::SSObjectSetFields {
            dg.add_u16(authorized.len() as u16).unwrap();
        }
        for (fid, value) in authorized {
            dg.add_u16(fid).unwrap();
            dg.add_blob(value).unwrap();
        }
        Self::route(&uplink, dg).await
    }

    /// A client asking to move an object it owns to a new parent/zone.
    /// Only honored when the Client Agent is configured to allow it
    /// (`relocate_allowed`) and the client owns the target — otherwise
    /// the client is disconnected with `FORBIDDEN_RELOCATE` (§4.4, §7).
    async fn handle_client_set_location(service: Arc<Mutex<Self>>, channel: Channel, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid()?;
        let parent = dgi.read_doid()?;
        let zone = dgi.read_zone()?;

        let guard = service.lock().await;
        let owns = guard
            .connections
            .get(&channel)
            .is_some_and(|connected| connected.participant.owned_objects.contains(&doid));
        if !guard.relocate_allowed || !owns {
            drop(guard);
            Self::reject(service, channel, "relocation not permitted", REASON_FORBIDDEN_RELOCATE).await;
            return Ok(());
        }
        let uplink = guard.uplink.clone();
        drop(guard);

        let mut dg = Datagram::default();
        dg.add_server_header(vec![doid_as_channel(doid)], channel, Protocol::SSObjectSetLocation.into())
            .unwrap();
        dg.add_doid(doid).unwrap();
        dg.add_location(parent, zone).unwrap();
        Self::route(&uplink, dg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_matches_own_channel_and_interest_zones() {
        let mut participant = ClientParticipant::new(42);
        participant.interests.insert(1, Interest::new(1, 100, vec![5]));

        assert!(ClientAgent::channel_matches(42, &participant, &[42]));
        assert!(ClientAgent::channel_matches(42, &participant, &[location_as_channel(100, 5)]));
        assert!(!ClientAgent::channel_matches(42, &participant, &[location_as_channel(100, 6)]));
    }

    #[test]
    fn channel_allocator_stops_at_range_max() {
        let mut channels = ChannelAllocator::new(10, 11);
        assert_eq!(channels.allocate(), Some(10));
        assert_eq!(channels.allocate(), Some(11));
        assert_eq!(channels.allocate(), None);
    }

    #[test]
    fn queue_if_pending_only_queues_unfetched_expected_objects() {
        let mut op = InterestOperation::new(1, 5, 200, vec![5]);
        op.record_expected(101);
        let mut pending_interests = HashMap::new();
        pending_interests.insert((42, 200), PendingInterest { op, expected: Some(1) });

        let dg = Datagram::default();
        assert!(ClientAgent::queue_if_pending(&mut pending_interests, 42, 101, dg.clone()).is_none());
        assert_eq!(pending_interests.get(&(42, 200)).unwrap().op.queued.len(), 1);

        // A DoId no operation is expecting is handed straight back.
        assert!(ClientAgent::queue_if_pending(&mut pending_interests, 42, 999, dg).is_some());
    }

    #[test]
    fn may_set_field_allows_owned_visible_declared_and_anonymous_uberdog() {
        let mut participant = ClientParticipant::new(1);
        let uberdogs = vec![UberDog {
            id: 900,
            class: "LoginManager".into(),
            anonymous: true,
        }];

        // Nothing granted yet, not an UberDOG: forbidden.
        assert!(!ClientAgent::may_set_field(&participant, &uberdogs, 101));

        // Anonymous clients may still target an anonymous UberDOG.
        assert!(ClientAgent::may_set_field(&participant, &uberdogs, 900));

        // Once established, the anonymous-UberDOG exemption no longer applies.
        participant.state = ClientState::Established;
        assert!(!ClientAgent::may_set_field(&participant, &uberdogs, 900));

        // Owning the object is always sufficient, established or not.
        participant.owned_objects.insert(101);
        assert!(ClientAgent::may_set_field(&participant, &uberdogs, 101));
    }

    #[test]
    fn apply_close_zones_retires_objects_and_stops_at_session_object() {
        let mut participant = ClientParticipant::new(2);
        participant.visible.insert(101, VisibleObject { parent: 500, zone: 5, dclass: 1 });
        participant.seen.insert(101);
        participant.visible.insert(102, VisibleObject { parent: 500, zone: 5, dclass: 1 });
        participant.session_objects.insert(102);

        let (leaving, session_hit) = ClientAgent::apply_close_zones(&mut participant, 500, &[5]);

        // 101 (seen, not a session object) must be reported as leaving.
        assert!(leaving.contains(&101));
        assert!(!participant.visible.contains_key(&101));
        assert!(participant.historical.contains(&101));

        // A session object must never be silently retired; it's reported
        // for the caller to disconnect instead.
        assert_eq!(session_hit, Some(102));
    }

    #[test]
    fn apply_close_zones_ignores_objects_outside_the_closed_zones() {
        let mut participant = ClientParticipant::new(3);
        participant.visible.insert(201, VisibleObject { parent: 500, zone: 9, dclass: 1 });

        let (leaving, session_hit) = ClientAgent::apply_close_zones(&mut participant, 500, &[5]);

        assert!(leaving.is_empty());
        assert!(session_hit.is_none());
        assert!(participant.visible.contains_key(&201));
    }

    #[test]
    fn zones_to_close_excludes_zones_still_covered_by_another_interest() {
        let mut interests = HashMap::new();
        interests.insert(1, Interest::new(1, 500, vec![5, 6]));
        interests.insert(2, Interest::new(2, 500, vec![6, 7]));

        // Narrowing interest 1 away from zone 6: still covered by interest 2.
        let closed = ClientAgent::zones_to_close(&interests, 1, 500, &[6]);
        assert!(closed.is_empty());

        // Zone 5 is unique to interest 1: it must close.
        let closed = ClientAgent::zones_to_close(&interests, 1, 500, &[5]);
        assert_eq!(closed, vec![5]);
    }
}
