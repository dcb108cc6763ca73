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

//! Wires the `DBSERVER_*` / `DBSERVER_OBJECT_*` message family (§6) to
//! a [`DatabaseBackend`], connecting upstream to the Message Director
//! like any other cluster role via [`donet_daemon::subscriber`].

use crate::{DatabaseBackend, DatabaseError, FieldValue};
use donet_core::datagram::datagram::Datagram;
use donet_core::datagram::iterator::DatagramIterator;
use donet_core::globals::{Channel, DClassId, FieldId};
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

pub struct CreateInfo<B: DatabaseBackend + 'static> {
    pub service_conf: config::DBServer,
    pub md_address: String,
    pub backend: Arc<B>,
}

pub struct DatabaseServer<B: DatabaseBackend + 'static> {
    client: Arc<Mutex<Client>>,
    control_channel: Channel,
    backend: Arc<B>,
    recv_rx: Option<mpsc::Receiver<RecvData>>,
}

impl<B: DatabaseBackend + 'static> HasClient for DatabaseServer<B> {
    fn get_client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }
}

impl<B: DatabaseBackend + 'static> ClusterSubscriber for DatabaseServer<B> {
    async fn receive_datagram(_dg: Datagram) -> Result<()> {
        Ok(())
    }
}

impl<B: DatabaseBackend + 'static> DonetService for DatabaseServer<B> {
    type Service = Self;
    type Configuration = CreateInfo<B>;

    async fn create(conf: Self::Configuration, _: Option<DCFile>) -> Result<Arc<Mutex<Self::Service>>> {
        let client = Arc::new(Mutex::new(Client::from(tcp::Connection::connect(&conf.md_address).await?)));
        let (tx, rx) = mpsc::channel(64);

        client.lock().await.spawn_recv_send_tasks(tx).await;

        let server = DatabaseServer {
            client,
            control_channel: conf.service_conf.control_channel,
            backend: conf.backend,
            recv_rx: Some(rx),
        };

        let mut dg = Datagram::default();
        dg.add_control_header(Protocol::MDAddChannel.into()).unwrap();
        dg.add_channel(server.control_channel).unwrap();
        server.get_client().lock().await.stage_datagram(dg).await?;

        Ok(Arc::new(Mutex::new(server)))
    }

    /// `start` cannot build a concrete `B` from `config::DonetConfig`
    /// alone, since the backend's own connection credentials (host,
    /// user, password) live outside the daemon's shared config tree.
    /// The `donetd` binary parses `backing-store` into those
    /// credentials itself and drives [`Self::create`] + [`Self::main`]
    /// directly rather than going through this trait method.
    async fn start(_conf: config::DonetConfig, _dc: Option<DCFile>) -> Result<JoinHandle<Result<()>>> {
        Err(Error::new(
            ErrorKind::Unsupported,
            "DatabaseServer::start requires a concrete backend; construct via create() from the binary crate.",
        ))
    }

    async fn main(service: Arc<Mutex<Self::Service>>) -> Result<()> {
        let mut rx = service
            .lock()
            .await
            .recv_rx
            .take()
            .expect("DatabaseServer main loop already started.");

        while let Some(recv) = rx.recv().await {
            let svc = service.clone();
            if let Err(e) = Self::dispatch(svc, recv.dgi).await {
                warn!("Database server failed to handle a message: {}", e);
            }
        }
        Ok(())
    }
}

impl<B: DatabaseBackend + 'static> DatabaseServer<B> {
    async fn dispatch(service: Arc<Mutex<Self>>, mut dgi: DatagramIterator) -> Result<()> {
        let sender = dgi.read_channel().unwrap();
        let recipient_count = dgi.read_u8().unwrap();
        for _ in 0..recipient_count {
            let _recipient = dgi.read_channel().unwrap();
        }
        let sender_channel = dgi.read_channel().unwrap_or(sender);
        let msg_type = dgi.read_msg_type().map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;

        let backend = service.lock().await.backend.clone();
        let client = service.lock().await.get_client();

        let reply = match msg_type {
            Protocol::DBCreateObject => Some(Self::handle_create(&backend, &mut dgi, sender_channel).await?),
            Protocol::DBObjectGetField => Some(Self::handle_get_field(&backend, &mut dgi, sender_channel).await?),
            Protocol::DBObjectGetFields => Some(Self::handle_get_fields(&backend, &mut dgi, sender_channel).await?),
            Protocol::DBObjectGetAll => Some(Self::handle_get_all(&backend, &mut dgi, sender_channel).await?),
            Protocol::DBObjectSetField => {
                Self::handle_set_field(&backend, &mut dgi).await?;
                None
            }
            Protocol::DBObjectSetFields => {
                Self::handle_set_fields(&backend, &mut dgi).await?;
                None
            }
            Protocol::DBObjectSetFieldIfEquals => {
                Some(Self::handle_set_field_if_equals(&backend, &mut dgi, sender_channel).await?)
            }
            Protocol::DBObjectSetFieldIfEmpty => {
                Some(Self::handle_set_field_if_empty(&backend, &mut dgi, sender_channel).await?)
            }
            Protocol::DBObjectDeleteField => {
                Self::handle_delete_field(&backend, &mut dgi).await?;
                None
            }
            Protocol::DBObjectDeleteFields => {
                Self::handle_delete_fields(&backend, &mut dgi).await?;
                None
            }
            Protocol::DBObjectDelete => {
                let doid = dgi.read_doid().unwrap();
                backend.delete_object(doid).await.ok();
                None
            }
            _ => {
                trace!("Database server ignoring unhandled message type {:?}", msg_type);
                None
            }
        };

        if let Some(dg) = reply {
            client.lock().await.stage_datagram(dg).await?;
        }
        Ok(())
    }

    async fn handle_create(backend: &Arc<B>, dgi: &mut DatagramIterator, sender: Channel) -> Result<Datagram> {
        let dclass: DClassId = dgi.read_u16().unwrap();
        let field_count = dgi.read_u16().unwrap();
        let mut fields = HashMap::new();
        for _ in 0..field_count {
            let fid = dgi.read_u16().unwrap();
            let size = dgi.read_size().unwrap();
            let value = dgi.read_data(usize::from(size)).unwrap();
            fields.insert(fid, value);
        }

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], 0, Protocol::DBCreateObjectResp.into()).unwrap();

        match backend.allocate_doid().await {
            Ok(doid) => match backend.create_object(doid, dclass, fields).await {
                Ok(()) => {
                    dg.add_doid(doid).unwrap();
                }
                Err(e) => {
                    backend.free_doid(doid).await.ok();
                    warn!("Failed to create object: {}", e);
                    dg.add_doid(0).unwrap();
                }
            },
            Err(e) => {
                warn!("Failed to allocate DoId: {}", e);
                dg.add_doid(0).unwrap();
            }
        }
        Ok(dg)
    }

    async fn handle_get_field(backend: &Arc<B>, dgi: &mut DatagramIterator, sender: Channel) -> Result<Datagram> {
        let doid = dgi.read_doid().unwrap();
        let fid = dgi.read_u16().unwrap();

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], 0, Protocol::DBObjectGetFieldResp.into()).unwrap();

        match backend.get_fields(doid, &[fid]).await {
            Ok(fields) => {
                let found = fields.get(&fid);
                dg.add_bool(found.is_some()).unwrap();
                if let Some(value) = found {
                    dg.add_blob(value.clone()).unwrap();
                }
            }
            Err(e) => {
                warn!("GetField failed: {}", e);
                dg.add_bool(false).unwrap();
            }
        }
        Ok(dg)
    }

    async fn handle_get_fields(backend: &Arc<B>, dgi: &mut DatagramIterator, sender: Channel) -> Result<Datagram> {
        let doid = dgi.read_doid().unwrap();
        let count = dgi.read_u16().unwrap();
        let mut requested = Vec::with_capacity(count.into());
        for _ in 0..count {
            requested.push(dgi.read_u16().unwrap());
        }

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], 0, Protocol::DBObjectGetFieldsResp.into()).unwrap();

        match backend.get_fields(doid, &requested).await {
            Ok(fields) => {
                dg.add_bool(true).unwrap();
                dg.add_u16(fields.len() as u16).unwrap();
                for (fid, value) in fields {
                    dg.add_u16(fid).unwrap();
                    dg.add_blob(value).unwrap();
                }
            }
            Err(e) => {
                warn!("GetFields failed: {}", e);
                dg.add_bool(false).unwrap();
                dg.add_u16(0).unwrap();
            }
        }
        Ok(dg)
    }

    async fn handle_get_all(backend: &Arc<B>, dgi: &mut DatagramIterator, sender: Channel) -> Result<Datagram> {
        let doid = dgi.read_doid().unwrap();

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], 0, Protocol::DBObjectGetAllResp.into()).unwrap();

        match backend.get_all(doid).await {
            Ok(obj) => {
                dg.add_bool(true).unwrap();
                dg.add_u16(obj.dclass).unwrap();
                dg.add_u16(obj.fields.len() as u16).unwrap();
                for (fid, value) in obj.fields {
                    dg.add_u16(fid).unwrap();
                    dg.add_blob(value).unwrap();
                }
            }
            Err(DatabaseError::NotFound(_)) => {
                dg.add_bool(false).unwrap();
            }
            Err(e) => {
                warn!("GetAll failed: {}", e);
                dg.add_bool(false).unwrap();
            }
        }
        Ok(dg)
    }

    async fn read_fields(dgi: &mut DatagramIterator) -> HashMap<FieldId, FieldValue> {
        let count = dgi.read_u16().unwrap();
        let mut fields = HashMap::with_capacity(count.into());
        for _ in 0..count {
            let fid = dgi.read_u16().unwrap();
            let size = dgi.read_size().unwrap();
            let value = dgi.read_data(usize::from(size)).unwrap();
            fields.insert(fid, value);
        }
        fields
    }

    async fn handle_set_field(backend: &Arc<B>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let fid = dgi.read_u16().unwrap();
        let size = dgi.read_size().unwrap();
        let value = dgi.read_data(usize::from(size)).unwrap();
        backend.set_field(doid, fid, value).await.ok();
        Ok(())
    }

    async fn handle_set_fields(backend: &Arc<B>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let fields = Self::read_fields(dgi).await;
        backend.set_fields(doid, fields).await.ok();
        Ok(())
    }

    async fn handle_set_field_if_equals(
        backend: &Arc<B>,
        dgi: &mut DatagramIterator,
        sender: Channel,
    ) -> Result<Datagram> {
        let doid = dgi.read_doid().unwrap();
        let fid = dgi.read_u16().unwrap();
        let expected_size = dgi.read_size().unwrap();
        let expected = dgi.read_data(usize::from(expected_size)).unwrap();
        let value_size = dgi.read_size().unwrap();
        let value = dgi.read_data(usize::from(value_size)).unwrap();

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], 0, Protocol::DBObjectSetFieldIfEqualsResp.into())
            .unwrap();

        match backend.set_field_if_equals(doid, fid, expected, value).await {
            Ok((ok, current)) => {
                dg.add_bool(ok).unwrap();
                dg.add_blob(current).unwrap();
            }
            Err(e) => {
                warn!("SetFieldIfEquals failed: {}", e);
                dg.add_bool(false).unwrap();
                dg.add_blob(Vec::new()).unwrap();
            }
        }
        Ok(dg)
    }

    async fn handle_set_field_if_empty(
        backend: &Arc<B>,
        dgi: &mut DatagramIterator,
        sender: Channel,
    ) -> Result<Datagram> {
        let doid = dgi.read_doid().unwrap();
        let fid = dgi.read_u16().unwrap();
        let value_size = dgi.read_size().unwrap();
        let value = dgi.read_data(usize::from(value_size)).unwrap();

        let mut dg = Datagram::default();
        dg.add_server_header(vec![sender], 0, Protocol::DBObjectSetFieldIfEmptyResp.into())
            .unwrap();

        match backend.set_field_if_equals(doid, fid, Vec::new(), value).await {
            Ok((ok, current)) => {
                dg.add_bool(ok).unwrap();
                dg.add_blob(current).unwrap();
            }
            Err(e) => {
                warn!("SetFieldIfEmpty failed: {}", e);
                dg.add_bool(false).unwrap();
                dg.add_blob(Vec::new()).unwrap();
            }
        }
        Ok(dg)
    }

    async fn handle_delete_field(backend: &Arc<B>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let fid = dgi.read_u16().unwrap();
        backend.delete_fields(doid, &[fid]).await.ok();
        Ok(())
    }

    async fn handle_delete_fields(backend: &Arc<B>, dgi: &mut DatagramIterator) -> Result<()> {
        let doid = dgi.read_doid().unwrap();
        let count = dgi.read_u16().unwrap();
        let mut fields = Vec::with_capacity(count.into());
        for _ in 0..count {
            fields.push(dgi.read_u16().unwrap());
        }
        backend.delete_fields(doid, &fields).await.ok();
        Ok(())
    }
}
