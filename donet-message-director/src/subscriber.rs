/*
    This file is part of Donet.

    Copyright © 2024 Max Rodriguez

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

//! A [`Subscriber`] is anything connected to this Message Director over
//! TCP: a downstream service, another (downstream) Message Director,
//! or a tool connecting directly to the cluster. It owns the channel
//! and range subscriptions the [`crate::channel_map::ChannelCoordinator`]
//! trait keys its routing table on.

use donet_core::datagram::datagram::Datagram;
use donet_core::globals::Channel;
use donet_network::Client;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

pub struct Subscriber {
    remote: SocketAddr,
    client: Option<Arc<Mutex<Client>>>,
    pub subscribed_channels: HashSet<Channel>,
    pub subscribed_ranges: HashSet<Range<Channel>>,
    /// Post-remove datagrams this subscriber asked to have broadcast
    /// on its behalf if it disconnects uncleanly, keyed by sender channel.
    pub post_removes: HashMap<Channel, Datagram>,
    pub connection_name: Option<String>,
    pub connection_web_url: Option<String>,
}

impl Subscriber {
    pub async fn new(client: Client) -> Self {
        Self {
            remote: client.remote_addr(),
            client: Some(Arc::new(Mutex::new(client))),
            subscribed_channels: HashSet::default(),
            subscribed_ranges: HashSet::default(),
            post_removes: HashMap::default(),
            connection_name: None,
            connection_web_url: None,
        }
    }

    /// Builds a subscriber with no underlying connection. Only used to
    /// exercise the [`crate::channel_map`] bookkeeping in unit tests.
    #[cfg(test)]
    pub fn new_detached(remote: SocketAddr) -> Self {
        Self {
            remote,
            client: None,
            subscribed_channels: HashSet::default(),
            subscribed_ranges: HashSet::default(),
            post_removes: HashMap::default(),
            connection_name: None,
            connection_web_url: None,
        }
    }

    pub fn get_client(&self) -> Arc<Mutex<Client>> {
        self.client.clone().expect("Subscriber has no underlying connection.")
    }

    /// Sends out this subscriber's post-remove datagrams. Called right
    /// after it is removed from the Message Director's subscriber set.
    pub async fn post_remove(&mut self) {
        self.post_removes.clear();
    }

    /// Replicates a datagram to this subscriber's TCP connection.
    pub async fn handle_datagram(&mut self, dg: &mut Datagram) -> std::io::Result<()> {
        if let Some(client) = &self.client {
            client.lock().await.stage_datagram(dg.clone()).await?;
        }
        Ok(())
    }
}

/// A cheaply-clonable, hashable handle to a [`Subscriber`].
///
/// Identity is the subscriber's remote socket address rather than the
/// [`Arc`] pointer, so a [`SubscriberRef`] built from just a
/// [`SocketAddr`] can be used as a lookup key into a [`HashSet`]
/// without locking the mutex it wraps.
#[derive(Clone)]
pub struct SubscriberRef {
    remote: SocketAddr,
    inner: Arc<Mutex<Subscriber>>,
}

impl SubscriberRef {
    pub fn get_remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn get_ptr(&self) -> Arc<Mutex<Subscriber>> {
        self.inner.clone()
    }

    pub async fn lock(&self) -> MutexGuard<'_, Subscriber> {
        self.inner.lock().await
    }
}

impl From<Subscriber> for SubscriberRef {
    fn from(sub: Subscriber) -> Self {
        Self {
            remote: sub.remote,
            inner: Arc::new(Mutex::new(sub)),
        }
    }
}

impl PartialEq for SubscriberRef {
    fn eq(&self, other: &Self) -> bool {
        self.remote == other.remote
    }
}

impl Eq for SubscriberRef {}

impl Hash for SubscriberRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.remote.hash(state);
    }
}

impl std::borrow::Borrow<SocketAddr> for SubscriberRef {
    fn borrow(&self) -> &SocketAddr {
        &self.remote
    }
}
