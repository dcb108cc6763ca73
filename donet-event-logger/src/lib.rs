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

//! UDP sink every other cluster service's [`ClusterSubscriber`] sends
//! [`LoggedEvent`] msgpack datagrams to, per §7 of the cluster design.
//!
//! [`ClusterSubscriber`]: donet_daemon::subscriber::ClusterSubscriber
//! [`LoggedEvent`]: donet_daemon::event::LoggedEvent

pub mod msgpack;
pub mod service;

pub use service::EventLogger;
