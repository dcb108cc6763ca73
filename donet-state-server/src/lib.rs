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

//! Hosts distributed objects in memory ([`stateserver::StateServer`])
//! and, lazily backed by a document database
//! ([`dbss::DatabaseStateServer`]), on disk. Both share the same
//! [`object::DistributedObject`] type; only the hosting service
//! differs in whether it writes field updates through to storage.

pub mod dbss;
pub mod object;
pub mod stateserver;
