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

//! A client's open interests: the `(parent, zones)` regions it has
//! asked to see objects enter/leave in. Adding an interest is
//! asynchronous from the client's point of view — the State Server(s)
//! must answer `GET_ZONES_OBJECTS` before `CLIENT_DONE_INTEREST_RESP`
//! can be sent — so [`InterestOperation`] tracks that in flight.

use donet_core::datagram::datagram::Datagram;
use donet_core::globals::{DClassId, DoId, FieldId, Zone};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub id: u16,
    pub parent: DoId,
    pub zones: HashSet<Zone>,
}

impl Interest {
    pub fn new(id: u16, parent: DoId, zones: Vec<Zone>) -> Self {
        Self { id, parent, zones: zones.into_iter().collect() }
    }

    /// The zones added by a follow-up `ADD_INTEREST` reusing this
    /// interest id that weren't already part of it.
    pub fn new_zones(&self, requested: &[Zone]) -> Vec<Zone> {
        requested.iter().copied().filter(|z| !self.zones.contains(z)).collect()
    }

    /// The zones this interest covered that a narrowed re-request no
    /// longer does; objects visible only through those must leave.
    pub fn killed_zones(&self, requested: &[Zone]) -> Vec<Zone> {
        let keep: HashSet<Zone> = requested.iter().copied().collect();
        self.zones.iter().copied().filter(|z| !keep.contains(z)).collect()
    }
}

/// A required-field snapshot fetched via a follow-up `SS_OBJECT_GET_ALL`
/// for one DoId the State Server counted as belonging to an in-flight
/// `InterestOperation`.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub parent: DoId,
    pub zone: Zone,
    pub dclass: DClassId,
    pub fields: Vec<(FieldId, Vec<u8>)>,
}

/// Tracks one `ADD_INTEREST(_MULTIPLE)` request from `CLIENT_ADD_INTEREST`
/// through to the `CLIENT_DONE_INTEREST_RESP` sent back once every
/// State Server queried for the new zones has answered.
///
/// §4.4 distinguishes two arrivals carrying the same wire message
/// (`SS_OBJECT_ENTER_LOCATION_WITH_REQUIRED[_OTHER]`) by which channel
/// they're addressed to: one addressed directly to the requester is
/// "expected" and counted toward completion; one addressed to a zone's
/// location channel (an object entering a zone this interest already
/// covers) is queued and replayed after completion, uncounted.
#[derive(Debug, Clone)]
pub struct InterestOperation {
    pub context: u16,
    pub interest_id: u16,
    pub parent: DoId,
    pub pending_zones: HashSet<Zone>,
    /// DoIds the State Server reported as belonging to this operation,
    /// addressed directly to the requester.
    pub expected_objects: HashSet<DoId>,
    /// Required-field snapshots fetched so far for `expected_objects`.
    pub fetched: HashMap<DoId, FetchedObject>,
    /// Datagrams that arrived for a DoId this operation already knows
    /// about while it was still in flight — replayed to the client
    /// only once its own `CLIENT_ENTER_OBJECT_REQUIRED[_OTHER]` has
    /// gone out (Testable Property 5).
    pub queued: Vec<(DoId, Datagram)>,
}

impl InterestOperation {
    pub fn new(context: u16, interest_id: u16, parent: DoId, zones: Vec<Zone>) -> Self {
        Self {
            context,
            interest_id,
            parent,
            pending_zones: zones.into_iter().collect(),
            expected_objects: HashSet::new(),
            fetched: HashMap::new(),
            queued: Vec::new(),
        }
    }

    /// Records a direct ("expected") arrival for `doid` — counted
    /// toward completion.
    pub fn record_expected(&mut self, doid: DoId) {
        self.expected_objects.insert(doid);
    }

    /// Records the required-field snapshot fetched for one expected
    /// DoId.
    pub fn record_fetched(&mut self, doid: DoId, obj: FetchedObject) {
        self.fetched.insert(doid, obj);
    }

    /// Queues a datagram for replay after this operation finishes,
    /// used both for uncounted location-channel arrivals and for the
    /// pending-object queue (`SET_FIELD(S)`, `DELETE_RAM`,
    /// `CHANGING_LOCATION`) of messages for a DoId still in flight.
    pub fn enqueue(&mut self, doid: DoId, dg: Datagram) {
        self.queued.push((doid, dg));
    }

    /// Ready once the State Server's aggregate count matches the
    /// number of expected DoIds seen, and every one of those has had
    /// its required fields fetched.
    pub fn is_ready(&self, expected_count: u32) -> bool {
        self.expected_objects.len() as u32 == expected_count && self.fetched.len() == self.expected_objects.len()
    }

    pub fn resolve_zone(&mut self, zone: Zone) {
        self.pending_zones.remove(&zone);
    }

    pub fn is_complete(&self) -> bool {
        self.pending_zones.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_and_killed_zones_partition_a_narrowed_request() {
        let interest = Interest::new(1, 100, vec![1, 2, 3]);
        assert_eq!(interest.new_zones(&[3, 4]), vec![4]);
        assert_eq!(interest.killed_zones(&[3, 4]), vec![1, 2]);
    }

    #[test]
    fn operation_completes_once_every_zone_resolves() {
        let mut op = InterestOperation::new(1, 5, 100, vec![1, 2]);
        assert!(!op.is_complete());
        op.resolve_zone(1);
        assert!(!op.is_complete());
        op.resolve_zone(2);
        assert!(op.is_complete());
    }

    #[test]
    fn ready_requires_every_expected_object_fetched() {
        let mut op = InterestOperation::new(1, 7, 200, vec![5, 6]);
        op.record_expected(101);
        op.record_expected(102);
        assert!(!op.is_ready(2));

        op.record_fetched(101, FetchedObject { parent: 200, zone: 5, dclass: 1, fields: vec![] });
        assert!(!op.is_ready(2));

        op.record_fetched(102, FetchedObject { parent: 200, zone: 6, dclass: 1, fields: vec![] });
        assert!(op.is_ready(2));
    }

    #[test]
    fn queued_datagrams_preserve_arrival_order() {
        let mut op = InterestOperation::new(1, 7, 200, vec![5]);
        op.enqueue(101, Datagram::default());
        op.enqueue(102, Datagram::default());
        assert_eq!(op.queued.iter().map(|(doid, _)| *doid).collect::<Vec<_>>(), vec![101, 102]);
    }
}
