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

//! Shared ambient plumbing every Donet cluster service links against:
//! the [`config`] struct tree, the [`DonetService`](service::DonetService)
//! bootstrap trait, the [`logger`] implementation installed once by the
//! `donetd` binary, the msgpack [`event`] builder used to ship log
//! entries to the Event Logger, and the [`subscriber::ClusterSubscriber`]
//! trait every service implements to talk to its Message Director.

pub mod config;
pub mod event;
pub mod logger;
pub mod meson;
pub mod service;
pub mod subscriber;
