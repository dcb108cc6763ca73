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

//! The in-memory State Server: hosts [`DistributedObject`]s, answers
//! field queries, and drives the location/AI/owner channel protocol
//! (§4.2) by subscribing and unsubscribing the Message Director
//! channels that make up an object's visibility graph.
//!
//! [`DatabaseStateServer`](crate::dbss::DatabaseStateServer) embeds
//! this type and intercepts field writes to add persistence, rather
//! than duplicating any of the protocol handling here.

use crate::object::{DistributedObject, FieldValue};
use donet_core::datagram::datagram::Datagram;
use donet_core::datagram::iterator::DatagramIterator;
use donet_core::globals::{self, Channel, DClassId, DoId, FieldId, Zone};
use donet_core::Protocol;
use donet_daemon::config;
use donet_daemon::service::{DCFile, DonetService};
use donet_daemon::subscriber::ClusterSubscriber;
use donet_network::{tcp, Client, HasClient, RecvData};
use log::{trace, warn};
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub struct CreateInfo {
    pub service_conf: config::StateServer,
    pub md_address: String,
    pub dc: Option<DCFile>,
}

pub struct StateServer {
    client: Arc<Mutex<Client>>,
    control_channel: Channel,
    dc: Option<DCFile>,
    pub(crate) objects: HashMap<DoId, DistributedObject>,
    recv_rx: Option<mpsc::Receiver<RecvData>>,
}

impl HasClient for StateServer {
    fn get_client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }
}

impl ClusterSubscriber for StateServer {
    async fn receive_datagram(_dg: Datagram) -> Result<()> {
        Ok(())
    }
}

impl DonetService for StateServer {
    type Service = Self;
    type Configuration = CreateInfo;

    async fn create(conf: Self::Configuration, dc: Option<DCFile>) -> Result<Arc<Mutex<Self::Service>>> {
        let client = Arc::new(Mutex::new(Client::from(tcp::Connection::connect(&conf.md_address).await?)));
        let (tx, rx) = mpsc::channel(64);
        client.lock().await.spawn_recv_send_tasks(tx).await;

        let server = StateServer {
            client,
            control_channel: conf.service_conf.control_channel,
            dc: conf.dc.or(dc),
            objects: HashMap::new(),
            recv_rx: Some(rx),
        };
        server.subscribe_control().await?;
        Ok(Arc::new(Mutex::new(server)))
    }

    async fn start(conf: config::DonetConfig, dc: Option<DCFile>) -> Result<JoinHandle<Result<()>>> {
        let ss_conf = conf
            .services
            .state_server
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "Missing state-server configuration."))?;

        let md_address = conf
            .services
            .message_director
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "State Server requires a Message Director."))?
            .bind;

        let service = Self::create(
            CreateInfo {
                service_conf: ss_conf,
                md_address,
                dc,
            },
            None,
        )
        .await?;

        Ok(Self::spawn_async_task(Self::main(service)))
    }

    async fn main(service: Arc<Mutex<Self::Service>>) -> Result<()> {
        let mut rx = service
            .lock()
            .await
            .recv_rx
            .take()
            .expect("State Server main loop already started.");

        while let Some(recv) = rx.recv().await {
            if let Err(e) = Self::dispatch(service.clone(), recv.dgi).await {
                warn!("State server failed to handle a message: {}", e);
            }
        }
        Ok(())
    }
}

impl StateServer {
    async fn subscribe_control(&self) -> Result<()> {
        let mut dg = Datagram::default();
        dg.add_control_header(Protocol::MDAddChannel.into()).unwrap();
        dg.add_channel(self.control_channel).unwrap();
        self.get_client().lock().await.stage_datagram(dg).await?;

        let mut dg = Datagram::default();
        dg.add_control_header(Protocol::MDAddChannel.into()).unwrap();
        dg.add_channel(globals::BCHAN_STATESERVERS).unwrap();
        self.get_client().lock().await.stage_datagram(dg).await
    }

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

    pub(crate) async fn dispatch(service: Arc<Mutex<Self>>, mut dgi: DatagramIterator) -> Result<()> {
        let _sender = dgi.read_channel().unwrap();
        let recipient_count = dgi.read_u8().unwrap();
        for _ in 0..recipient_count {
            let _recipient = dgi.read_channel().unwrap();
        }
        let sender = dgi.read_channel().unwrap();
        let msg_type = dgi
            .read_msg_type()
            .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;

        let client = service.lock().await.get_client();

        match msg_type {
            Protocol::SSCreateObjectWithRequired | Protocol::SSCreateObjectWithRequiredOther => {
                let other = msg_type == Protocol::SSCreateObjectWithRequiredOther;
                Self::handle_create(service, &mut dgi, other).await?;
            }
            Protocol::SSObjectGetField => Self::handle_get_field(service, &mut dgi, sender).await?,
            Protocol::SSObjectGetFields => Self::handle_get_fields(service, &mut dgi, sender).await?,
            Protocol::SSObjectGetAll => Self::handle_get_all(service, &mut dgi, sender).await?,
            Protocol::SSObjectSetField => Self::handle_set_field(service, &mut dgi).await?,
            Protocol::SSObjectSetFields => Self::handle_set_fields(service, &mut dgi).await?,
            Protocol::SSObjectDeleteFieldRAM => Self::handle_delete_field_ram(service, &mut dgi).await?,
            Protocol::SSObjectDeleteFieldsRAM => Self::handle_delete_fields_ram(service, &mut dgi).await?,
            Protocol::SSObjectDeleteRAM => Self::handle_delete_object(service, &mut dgi).await?,
            Protocol::SSObjectSetLocation => Self::handle_set_location(service, &mut dgi).await?,
            Protocol::SSObjectGetLocation => Self::handle_get_location(service, &mut dgi, sender).await?,
            Protocol::SSObjectSetAI => Self::handle_set_ai(service, &mut dgi).await?,
            Protocol::SSObjectGetAI => Self::handle_get_ai(service, &mut dgi, sender).await?,
            Protocol::SSObjectSetOwner => Self::handle_set_owner(service, &mut dgi).await?,
            Protocol::SSObjectGetOwner => Self::handle_get_owner(service, &mut dgi, sender).await?,
            Protocol::SSObjectGetZoneObjects => {
                Self::handle_get_zone_objects(service, &mut dgi, sender, false).await?
            }
            Protocol::SSObjectGetZonesObjects => {
                Self::handle_get_zone_objects(service, &mut dgi, sender, true).await?
            }
            Protocol::SSObjectGetChildren => Self::handle_get_children(service, &mut dgi, sender).await?,
            Protocol::SSObjectGetZoneCount => Self::handle_get_zone_count(service, &mut dgi, sender, false).await?,
            Protocol::SSObjectGetZonesCount => Self::handle_get_zone_count(service, &mut dgi, sender, true).await?,
            Protocol::SSObjectGetChildCount => Self::handle_get_child_count(service, &mut dgi, sender).await?,
            Protocol::SSObjectDeleteZone => Self::handle_delete_zone(service, &mut dgi, false).await?,
            Protocol::SSObjectDeleteZones => Self::handle_delete_zone(service, &mut dgi, true).await?,
            Protocol::SSObjectDeleteChildren => Self::handle_delete_children(service, &mut dgi).await?,
            _ => trace!("State server ignoring unhandled message type {:?}", msg_type),
        }
        let _ = client;
        Ok(())
    }

    async fn handle_create(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, other: bool) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let parent = dgi.read_doid().unwrap();
        let zone = dgi.read_zone().unwrap();
        let dclass: DClassId = dgi.read_u16().unwrap();
        let field_count = dgi.read_u16().unwrap();

        let mut required = HashMap::new();
        for _ in 0..field_count {
            let fid = dgi.read_u16().unwrap();
            let size = dgi.read_size().unwrap();
            let value = dgi.read_data(usize::from(size)).unwrap();
            required.insert(fid, value);
        }
        let mut ram = Vec::new();
        if other {
            let ram_count = dgi.read_u16().unwrap();
            for _ in 0..ram_count {
                let fid = dgi.read_u16().unwrap();
                let size = dgi.read_size().unwrap();
                let value = dgi.read_data(usize::from(size)).unwrap();
                ram.push((fid, value));
            }
        }

        let mut obj = DistributedObject::new(doid, dclass, parent, zone, required);
        for (fid, value) in ram {
            obj.set_field(fid, value);
        }
        let location_channel = obj.location_channel();
        let own_channel = obj.own_channel();

        let client = {
            let mut guard = service.lock().await;
            if let Some(registry) = &guard.dc {
                if registry.get_class(dclass).is_none() {
                    warn!("Creating object with unknown dclass id {}", dclass);
                }
            }
            guard.objects.insert(doid, obj);
            guard.get_client()
        };

        Self::subscribe(&client, own_channel).await?;
        Self::subscribe(&client, location_channel).await?;

        let mut dg = Datagram::default();
        dg.add_server_header(vec![location_channel], doid as Channel, Protocol::SSObjectEnterLocationWithRequired.into())
            .unwrap();
        dg.add_doid(doid).unwrap();
        dg.add_location(parent, zone).unwrap();
        Self::route(&client, dg).await
    }

    async fn handle_get_field(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, sender: Channel) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let fid = dgi.read_u16().unwrap();

        let guard = service.lock().await;
        let value = guard.objects.get(&doid).and_then(|o| o.get_field(fid).cloned());
        let client = guard.get_client();
        drop(guard);

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], doid as Channel, Protocol::SSObjectGetFieldResp.into())
            .unwrap();
        dg.add_bool(value.is_some()).unwrap();
        if let Some(v) = value {
            dg.add_u16(fid).unwrap();
            dg.add_blob(v).unwrap();
        }
        Self::route(&client, dg).await
    }

    async fn handle_get_fields(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, sender: Channel) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let count = dgi.read_u16().unwrap();
        let mut requested = Vec::with_capacity(count.into());
        for _ in 0..count {
            requested.push(dgi.read_u16().unwrap());
        }

        let guard = service.lock().await;
        let found: Vec<(FieldId, FieldValue)> = guard
            .objects
            .get(&doid)
            .map(|o| {
                requested
                    .iter()
                    .filter_map(|fid| o.get_field(*fid).map(|v| (*fid, v.clone())))
                    .collect()
            })
            .unwrap_or_default();
        let client = guard.get_client();
        let exists = guard.objects.contains_key(&doid);
        drop(guard);

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], doid as Channel, Protocol::SSObjectGetFieldsResp.into())
            .unwrap();
        dg.add_bool(exists).unwrap();
        dg.add_u16(found.len() as u16).unwrap();
        for (fid, value) in found {
            dg.add_u16(fid).unwrap();
            dg.add_blob(value).unwrap();
        }
        Self::route(&client, dg).await
    }

    async fn handle_get_all(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, sender: Channel) -> Result<()> {
        let doid = dgi.read_doid().unwrap();

        let guard = service.lock().await;
        let obj = guard.objects.get(&doid).cloned();
        let client = guard.get_client();
        drop(guard);

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], doid as Channel, Protocol::SSObjectGetAllResp.into())
            .unwrap();

        match obj {
            Some(obj) => {
                dg.add_bool(true).unwrap();
                dg.add_u16(obj.dclass).unwrap();
                let fields: Vec<_> = obj.all_fields().map(|(f, v)| (*f, v.clone())).collect();
                dg.add_u16(fields.len() as u16).unwrap();
                for (fid, value) in fields {
                    dg.add_u16(fid).unwrap();
                    dg.add_blob(value).unwrap();
                }
            }
            None => dg.add_bool(false).unwrap(),
        }
        Self::route(&client, dg).await
    }

    async fn handle_set_field(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let fid = dgi.read_u16().unwrap();
        let size = dgi.read_size().unwrap();
        let value = dgi.read_data(usize::from(size)).unwrap();

        let mut guard = service.lock().await;
        if let Some(obj) = guard.objects.get_mut(&doid) {
            obj.set_field(fid, value);
        }
        Ok(())
    }

    async fn handle_set_fields(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let count = dgi.read_u16().unwrap();

        let mut guard = service.lock().await;
        for _ in 0..count {
            let fid = dgi.read_u16().unwrap();
            let size = dgi.read_size().unwrap();
            let value = dgi.read_data(usize::from(size)).unwrap();
            if let Some(obj) = guard.objects.get_mut(&doid) {
                obj.set_field(fid, value);
            }
        }
        Ok(())
    }

    async fn handle_delete_field_ram(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let fid = dgi.read_u16().unwrap();
        let mut guard = service.lock().await;
        if let Some(obj) = guard.objects.get_mut(&doid) {
            obj.delete_ram_field(fid);
        }
        Ok(())
    }

    async fn handle_delete_fields_ram(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let count = dgi.read_u16().unwrap();
        let mut guard = service.lock().await;
        for _ in 0..count {
            let fid = dgi.read_u16().unwrap();
            if let Some(obj) = guard.objects.get_mut(&doid) {
                obj.delete_ram_field(fid);
            }
        }
        Ok(())
    }

    async fn handle_delete_object(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        Self::remove_object(service, doid).await
    }

    pub(crate) async fn remove_object(service: Arc<Mutex<Self>>, doid: DoId) -> Result<()> {
        let (obj, client) = {
            let mut guard = service.lock().await;
            (guard.objects.remove(&doid), guard.get_client())
        };
        let Some(obj) = obj else { return Ok(()) };

        let mut dg = Datagram::default();
        dg.add_server_header(
            vec![obj.location_channel()],
            obj.own_channel(),
            Protocol::SSObjectDeleteRAM.into(),
        )
        .unwrap();
        dg.add_doid(doid).unwrap();
        Self::route(&client, dg).await?;

        Self::unsubscribe(&client, obj.own_channel()).await?;
        Self::unsubscribe(&client, obj.location_channel()).await
    }

    async fn handle_set_location(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let parent = dgi.read_doid().unwrap();
        let zone = dgi.read_zone().unwrap();

        let (old_channel, new_channel, client) = {
            let mut guard = service.lock().await;
            let client = guard.get_client();
            let Some(obj) = guard.objects.get_mut(&doid) else {
                return Ok(());
            };
            let old = obj.location_channel();
            obj.set_location(parent, zone);
            (old, obj.location_channel(), client)
        };

        let mut changing = Datagram::default();
        changing
            .add_server_header(vec![old_channel], doid as Channel, Protocol::SSObjectChangingLocation.into())
            .unwrap();
        changing.add_doid(doid).unwrap();
        changing.add_location(parent, zone).unwrap();
        Self::route(&client, changing).await?;

        Self::unsubscribe(&client, old_channel).await?;
        Self::subscribe(&client, new_channel).await?;

        let mut entering = Datagram::default();
        entering
            .add_server_header(
                vec![new_channel],
                doid as Channel,
                Protocol::SSObjectEnterLocationWithRequired.into(),
            )
            .unwrap();
        entering.add_doid(doid).unwrap();
        entering.add_location(parent, zone).unwrap();
        Self::route(&client, entering).await
    }

    async fn handle_get_location(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, sender: Channel) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let guard = service.lock().await;
        let loc = guard.objects.get(&doid).map(|o| (o.parent, o.zone));
        let client = guard.get_client();
        drop(guard);

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], doid as Channel, Protocol::SSObjectGetLocationResp.into())
            .unwrap();
        match loc {
            Some((parent, zone)) => {
                dg.add_bool(true).unwrap();
                dg.add_location(parent, zone).unwrap();
            }
            None => dg.add_bool(false).unwrap(),
        }
        Self::route(&client, dg).await
    }

    async fn handle_set_ai(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let ai_channel = dgi.read_channel().unwrap();
        let mut guard = service.lock().await;
        if let Some(obj) = guard.objects.get_mut(&doid) {
            obj.ai_channel = Some(ai_channel);
        }
        Ok(())
    }

    async fn handle_get_ai(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, sender: Channel) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let guard = service.lock().await;
        let ai = guard.objects.get(&doid).and_then(|o| o.ai_channel);
        let client = guard.get_client();
        drop(guard);

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], doid as Channel, Protocol::SSObjectGetAIResp.into())
            .unwrap();
        dg.add_bool(ai.is_some()).unwrap();
        if let Some(ai) = ai {
            dg.add_channel(ai).unwrap();
        }
        Self::route(&client, dg).await
    }

    async fn handle_set_owner(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let owner_channel = dgi.read_channel().unwrap();
        let mut guard = service.lock().await;
        if let Some(obj) = guard.objects.get_mut(&doid) {
            obj.owner_channel = Some(owner_channel);
        }
        Ok(())
    }

    async fn handle_get_owner(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, sender: Channel) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let guard = service.lock().await;
        let owner = guard.objects.get(&doid).and_then(|o| o.owner_channel);
        let client = guard.get_client();
        drop(guard);

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], doid as Channel, Protocol::SSObjectGetOwnerResp.into())
            .unwrap();
        dg.add_bool(owner.is_some()).unwrap();
        if let Some(owner) = owner {
            dg.add_channel(owner).unwrap();
        }
        Self::route(&client, dg).await
    }

    async fn handle_get_zone_objects(
        service: Arc<Mutex<Self>>,
        dgi: &mut DatagramIterator,
        requester: Channel,
        multi: bool,
    ) -> Result<()> {
        let parent = dgi.read_doid().unwrap();
        let zones: Vec<Zone> = if multi {
            let count = dgi.read_u16().unwrap();
            (0..count).map(|_| dgi.read_zone().unwrap()).collect()
        } else {
            vec![dgi.read_zone().unwrap()]
        };

        let guard = service.lock().await;
        let client = guard.get_client();
        let matches: Vec<DoId> = guard
            .objects
            .values()
            .filter(|o| o.is_in_zones(parent, &zones))
            .map(|o| o.doid)
            .collect();
        drop(guard);

        for doid in matches {
            Self::forward_enter_required(service.clone(), &client, doid, requester).await?;
        }
        Ok(())
    }

    async fn handle_get_children(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, requester: Channel) -> Result<()> {
        let parent = dgi.read_doid().unwrap();
        let guard = service.lock().await;
        let client = guard.get_client();
        let matches: Vec<DoId> = guard
            .objects
            .values()
            .filter(|o| o.is_child_of(parent))
            .map(|o| o.doid)
            .collect();
        drop(guard);

        for doid in matches {
            Self::forward_enter_required(service.clone(), &client, doid, requester).await?;
        }
        Ok(())
    }

    /// Sends a queried object's required fields to whichever channel
    /// asked for it (a `GET_ZONE(S)_OBJECTS`/`GET_CHILDREN` requester),
    /// not the object's own channel — the requester is not assumed to
    /// already be subscribed to objects it doesn't yet know about.
    async fn forward_enter_required(
        service: Arc<Mutex<Self>>,
        client: &Arc<Mutex<Client>>,
        doid: DoId,
        requester: Channel,
    ) -> Result<()> {
        let guard = service.lock().await;
        let Some(obj) = guard.objects.get(&doid) else { return Ok(()) };

        let mut dg = Datagram::default();
        dg.add_server_header(vec![requester], doid as Channel, Protocol::SSObjectEnterLocationWithRequired.into())
            .unwrap();
        dg.add_doid(doid).unwrap();
        dg.add_location(obj.parent, obj.zone).unwrap();
        drop(guard);

        Self::route(client, dg).await
    }

    async fn handle_get_zone_count(
        service: Arc<Mutex<Self>>,
        dgi: &mut DatagramIterator,
        sender: Channel,
        multi: bool,
    ) -> Result<()> {
        let parent = dgi.read_doid().unwrap();
        let zones: Vec<Zone> = if multi {
            let count = dgi.read_u16().unwrap();
            (0..count).map(|_| dgi.read_zone().unwrap()).collect()
        } else {
            vec![dgi.read_zone().unwrap()]
        };

        let guard = service.lock().await;
        let client = guard.get_client();
        let count = guard.objects.values().filter(|o| o.is_in_zones(parent, &zones)).count();
        drop(guard);

        let resp_type = if multi {
            Protocol::SSObjectGetZonesCountResp
        } else {
            Protocol::SSObjectGetZoneCountResp
        };
        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], parent as Channel, resp_type.into()).unwrap();
        dg.add_u32(count as u32).unwrap();
        Self::route(&client, dg).await
    }

    async fn handle_get_child_count(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, sender: Channel) -> Result<()> {
        let parent = dgi.read_doid().unwrap();
        let guard = service.lock().await;
        let client = guard.get_client();
        let count = guard.objects.values().filter(|o| o.is_child_of(parent)).count();
        drop(guard);

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], parent as Channel, Protocol::SSObjectGetChildCountResp.into())
            .unwrap();
        dg.add_u32(count as u32).unwrap();
        Self::route(&client, dg).await
    }

    async fn handle_delete_zone(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, multi: bool) -> Result<()> {
        let parent = dgi.read_doid().unwrap();
        let zones: Vec<Zone> = if multi {
            let count = dgi.read_u16().unwrap();
            (0..count).map(|_| dgi.read_zone().unwrap()).collect()
        } else {
            vec![dgi.read_zone().unwrap()]
        };

        let guard = service.lock().await;
        let matches: Vec<DoId> = guard
            .objects
            .values()
            .filter(|o| o.is_in_zones(parent, &zones))
            .map(|o| o.doid)
            .collect();
        drop(guard);

        for doid in matches {
            Self::remove_object(service.clone(), doid).await?;
        }
        Ok(())
    }

    async fn handle_delete_children(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator) -> Result<()> {
        let parent = dgi.read_doid().unwrap();
        let guard = service.lock().await;
        let matches: Vec<DoId> = guard
            .objects
            .values()
            .filter(|o| o.is_child_of(parent))
            .map(|o| o.doid)
            .collect();
        drop(guard);

        for doid in matches {
            Self::remove_object(service.clone(), doid).await?;
        }
        Ok(())
    }
}
