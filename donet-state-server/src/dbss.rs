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

//! The Database State Server: a [`crate::stateserver`] that lazily
//! activates [`DistributedObject`]s from a [`donet_database::DatabaseBackend`]
//! instead of requiring an explicit `CREATE_OBJECT`.
//!
//! Activation is asynchronous (it waits on a database round trip), so
//! any field update that arrives for a DoId still loading is queued
//! in its [`LoadingObject`] rather than dropped or applied against
//! stale data; once the load completes, queued updates are applied as
//! an overlay on top of the persisted values and then forwarded to
//! subscribers exactly as if they had arrived after activation.

use crate::object::{DistributedObject, FieldValue};
use donet_core::datagram::datagram::Datagram;
use donet_core::datagram::iterator::DatagramIterator;
use donet_core::globals::{Channel, DClassId, DoId, FieldId};
use donet_core::Protocol;
use donet_daemon::config;
use donet_daemon::service::{DCFile, DonetService};
use donet_daemon::subscriber::ClusterSubscriber;
use donet_database::DatabaseBackend;
use donet_network::{tcp, Client, HasClient, RecvData};
use log::{trace, warn};
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// An object whose persisted fields are being fetched; field writes
/// that race the load are buffered here and replayed once it resolves.
#[derive(Default)]
pub struct LoadingObject {
    pub field_updates: Vec<(FieldId, FieldValue)>,
}

pub struct CreateInfo<B: DatabaseBackend + 'static> {
    pub service_conf: config::DBSS,
    pub md_address: String,
    pub backend: Arc<B>,
    pub dc: Option<DCFile>,
}

pub struct DatabaseStateServer<B: DatabaseBackend + 'static> {
    client: Arc<Mutex<Client>>,
    db_channel: Channel,
    range_min: DoId,
    range_max: DoId,
    backend: Arc<B>,
    dc: Option<DCFile>,
    pub(crate) active: HashMap<DoId, DistributedObject>,
    pub(crate) loading: HashMap<DoId, LoadingObject>,
    recv_rx: Option<mpsc::Receiver<RecvData>>,
}

impl<B: DatabaseBackend + 'static> HasClient for DatabaseStateServer<B> {
    fn get_client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }
}

impl<B: DatabaseBackend + 'static> ClusterSubscriber for DatabaseStateServer<B> {
    async fn receive_datagram(_dg: Datagram) -> Result<()> {
        Ok(())
    }
}

impl<B: DatabaseBackend + 'static> DonetService for DatabaseStateServer<B> {
    type Service = Self;
    type Configuration = CreateInfo<B>;

    async fn create(conf: Self::Configuration, dc: Option<DCFile>) -> Result<Arc<Mutex<Self::Service>>> {
        let client = Arc::new(Mutex::new(Client::from(tcp::Connection::connect(&conf.md_address).await?)));
        let (tx, rx) = mpsc::channel(64);
        client.lock().await.spawn_recv_send_tasks(tx).await;

        let server = DatabaseStateServer {
            client,
            db_channel: conf.service_conf.db_channel,
            range_min: conf.service_conf.range_min as DoId,
            range_max: conf.service_conf.range_max as DoId,
            backend: conf.backend,
            dc: conf.dc.or(dc),
            active: HashMap::new(),
            loading: HashMap::new(),
            recv_rx: Some(rx),
        };

        let mut dg = Datagram::default();
        dg.add_control_header(Protocol::MDAddChannel.into()).unwrap();
        dg.add_channel(server.db_channel).unwrap();
        server.get_client().lock().await.stage_datagram(dg).await?;

        Ok(Arc::new(Mutex::new(server)))
    }

    async fn start(_conf: config::DonetConfig, _dc: Option<DCFile>) -> Result<JoinHandle<Result<()>>> {
        Err(Error::new(
            ErrorKind::Unsupported,
            "DatabaseStateServer::start requires a concrete backend; construct via create() from the binary crate.",
        ))
    }

    async fn main(service: Arc<Mutex<Self::Service>>) -> Result<()> {
        let mut rx = service
            .lock()
            .await
            .recv_rx
            .take()
            .expect("Database State Server main loop already started.");

        while let Some(recv) = rx.recv().await {
            if let Err(e) = Self::dispatch(service.clone(), recv.dgi).await {
                warn!("Database State Server failed to handle a message: {}", e);
            }
        }
        Ok(())
    }
}

impl<B: DatabaseBackend + 'static> DatabaseStateServer<B> {
    fn in_range(&self, doid: DoId) -> bool {
        doid >= self.range_min && doid <= self.range_max
    }

    async fn route(client: &Arc<Mutex<Client>>, dg: Datagram) -> Result<()> {
        client.lock().await.stage_datagram(dg).await
    }

    async fn dispatch(service: Arc<Mutex<Self>>, mut dgi: DatagramIterator) -> Result<()> {
        let _sender = dgi.read_channel().unwrap();
        let recipient_count = dgi.read_u8().unwrap();
        for _ in 0..recipient_count {
            let _recipient = dgi.read_channel().unwrap();
        }
        let sender = dgi.read_channel().unwrap();
        let msg_type = dgi
            .read_msg_type()
            .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;

        match msg_type {
            Protocol::DBSSObjectActivateWithDefaults => Self::handle_activate(service, &mut dgi, false).await,
            Protocol::DBSSObjectActivateWithDefaultsOther => Self::handle_activate(service, &mut dgi, true).await,
            Protocol::DBSSObjectGetActivated => Self::handle_get_activated(service, &mut dgi, sender).await,
            Protocol::DBSSObjectDeleteFieldDisk => Self::handle_delete_field_disk(service, &mut dgi).await,
            Protocol::DBSSObjectDeleteFieldsDisk => Self::handle_delete_fields_disk(service, &mut dgi).await,
            Protocol::DBSSObjectDeleteDisk => Self::handle_delete_disk(service, &mut dgi).await,
            Protocol::SSObjectSetField => Self::handle_field_update(service, &mut dgi, false).await,
            Protocol::SSObjectSetFields => Self::handle_field_update(service, &mut dgi, true).await,
            _ => {
                trace!("Database State Server ignoring unhandled message type {:?}", msg_type);
                Ok(())
            }
        }
    }

    async fn handle_activate(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, other: bool) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let parent = dgi.read_doid().unwrap();
        let zone = dgi.read_zone().unwrap();

        let mut overrides = HashMap::new();
        if other {
            let count = dgi.read_u16().unwrap();
            for _ in 0..count {
                let fid = dgi.read_u16().unwrap();
                let size = dgi.read_size().unwrap();
                let value = dgi.read_data(usize::from(size)).unwrap();
                overrides.insert(fid, value);
            }
        }

        let (already_active, in_range, backend, client, dc) = {
            let guard = service.lock().await;
            (
                guard.active.contains_key(&doid),
                guard.in_range(doid),
                guard.backend.clone(),
                guard.get_client(),
                guard.dc.clone(),
            )
        };
        if already_active || !in_range {
            return Ok(());
        }

        service.lock().await.loading.entry(doid).or_default();

        let loaded = backend.get_all(doid).await;
        let dclass: DClassId;
        let mut fields: HashMap<FieldId, FieldValue> = match loaded {
            Ok(stored) => {
                dclass = stored.dclass;
                stored.fields
            }
            Err(e) => {
                warn!("Failed to activate DoId {}: {}", doid, e);
                service.lock().await.loading.remove(&doid);
                return Ok(());
            }
        };
        fields.extend(overrides);

        // Required fields not present on disk (an object activated for
        // the first time) fall back to their DC-declared default value.
        if let Some(registry) = &dc {
            if let Some(class) = registry.get_class(dclass) {
                for field in class.required_fields() {
                    fields.entry(field.id).or_insert_with(|| field.default_value.clone());
                }
            }
        }

        let queued = service
            .lock()
            .await
            .loading
            .remove(&doid)
            .map(|l| l.field_updates)
            .unwrap_or_default();
        for (fid, value) in &queued {
            fields.insert(*fid, value.clone());
        }

        let obj = DistributedObject::new(doid, dclass, parent, zone, fields);
        let location_channel = obj.location_channel();
        let own_channel = obj.own_channel();

        service.lock().await.active.insert(doid, obj);

        let mut sub = Datagram::default();
        sub.add_control_header(Protocol::MDAddChannel.into()).unwrap();
        sub.add_channel(own_channel).unwrap();
        Self::route(&client, sub).await?;

        let mut sub = Datagram::default();
        sub.add_control_header(Protocol::MDAddChannel.into()).unwrap();
        sub.add_channel(location_channel).unwrap();
        Self::route(&client, sub).await?;

        let mut dg = Datagram::default();
        dg.add_server_header(
            vec![location_channel],
            doid as Channel,
            Protocol::SSObjectEnterLocationWithRequired.into(),
        )
        .unwrap();
        dg.add_doid(doid).unwrap();
        dg.add_location(parent, zone).unwrap();
        Self::route(&client, dg).await
    }

    async fn handle_get_activated(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, sender: Channel) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let guard = service.lock().await;
        let active = guard.active.contains_key(&doid);
        let client = guard.get_client();
        drop(guard);

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], doid as Channel, Protocol::DBSSObjectGetActivatedResp.into())
            .unwrap();
        dg.add_doid(doid).unwrap();
        dg.add_bool(active).unwrap();
        Self::route(&client, dg).await
    }

    /// Applies a field write; if the object is still loading, queues it
    /// as an overlay instead of touching the backend directly.
    async fn handle_field_update(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator, multi: bool) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let mut updates = Vec::new();

        if multi {
            let count = dgi.read_u16().unwrap();
            for _ in 0..count {
                let fid = dgi.read_u16().unwrap();
                let size = dgi.read_size().unwrap();
                let value = dgi.read_data(usize::from(size)).unwrap();
                updates.push((fid, value));
            }
        } else {
            let fid = dgi.read_u16().unwrap();
            let size = dgi.read_size().unwrap();
            let value = dgi.read_data(usize::from(size)).unwrap();
            updates.push((fid, value));
        }

        let backend = {
            let mut guard = service.lock().await;

            if let Some(loading) = guard.loading.get_mut(&doid) {
                loading.field_updates.extend(updates);
                return Ok(());
            }
            if let Some(obj) = guard.active.get_mut(&doid) {
                for (fid, value) in &updates {
                    obj.set_field(*fid, value.clone());
                }
            }
            guard.backend.clone()
        };

        for (fid, value) in updates {
            if let Err(e) = backend.set_field(doid, fid, value).await {
                warn!("Failed to persist field {} on DoId {}: {}", fid, doid, e);
            }
        }
        Ok(())
    }

    async fn handle_delete_field_disk(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let fid = dgi.read_u16().unwrap();
        let backend = service.lock().await.backend.clone();
        backend.delete_fields(doid, &[fid]).await.ok();
        Ok(())
    }

    async fn handle_delete_fields_disk(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let count = dgi.read_u16().unwrap();
        let mut fields = Vec::with_capacity(count.into());
        for _ in 0..count {
            fields.push(dgi.read_u16().unwrap());
        }
        let backend = service.lock().await.backend.clone();
        backend.delete_fields(doid, &fields).await.ok();
        Ok(())
    }

    async fn handle_delete_disk(service: Arc<Mutex<Self>>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let (backend, client, obj) = {
            let mut guard = service.lock().await;
            (guard.backend.clone(), guard.get_client(), guard.active.remove(&doid))
        };
        backend.delete_object(doid).await.ok();
        backend.free_doid(doid).await.ok();

        if let Some(obj) = obj {
            let mut unsub = Datagram::default();
            unsub.add_control_header(Protocol::MDRemoveChannel.into()).unwrap();
            unsub.add_channel(obj.own_channel()).unwrap();
            Self::route(&client, unsub).await?;

            let mut unsub = Datagram::default();
            unsub.add_control_header(Protocol::MDRemoveChannel.into()).unwrap();
            unsub.add_channel(obj.location_channel()).unwrap();
            Self::route(&client, unsub).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_object_buffers_updates_in_order() {
        let mut loading = LoadingObject::default();
        loading.field_updates.push((1, vec![1]));
        loading.field_updates.push((1, vec![2]));

        let mut overlay = HashMap::new();
        for (fid, value) in loading.field_updates {
            overlay.insert(fid, value);
        }
        assert_eq!(overlay.get(&1), Some(&vec![2]));
    }
}
