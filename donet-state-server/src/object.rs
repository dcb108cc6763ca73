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

//! The distributed object the State Server (and, through it, the
//! Database State Server) hosts in memory.
//!
//! A DBSS-hosted object uses this exact type; the only difference is
//! which [`crate::stateserver::StateServer`] owns it and whether that
//! owner writes field updates through to a [`donet_database::DatabaseBackend`].
//! Nothing on `DistributedObject` itself knows about persistence.

use donet_core::globals::{Channel, DClassId, DoId, FieldId, Zone};
use std::collections::HashMap;

/// A raw, still-DC-encoded field value as carried over the wire.
pub type FieldValue = Vec<u8>;

#[derive(Debug, Clone)]
pub struct DistributedObject {
    pub doid: DoId,
    pub dclass: DClassId,
    pub parent: DoId,
    pub zone: Zone,
    pub ai_channel: Option<Channel>,
    pub owner_channel: Option<Channel>,
    /// Required fields are always present; every DC class guarantees a
    /// value exists for each, set either explicitly at creation or
    /// from the class's default.
    pub required_fields: HashMap<FieldId, FieldValue>,
    /// RAM fields only exist once explicitly set.
    pub ram_fields: HashMap<FieldId, FieldValue>,
}

impl DistributedObject {
    pub fn new(
        doid: DoId,
        dclass: DClassId,
        parent: DoId,
        zone: Zone,
        required_fields: HashMap<FieldId, FieldValue>,
    ) -> Self {
        Self {
            doid,
            dclass,
            parent,
            zone,
            ai_channel: None,
            owner_channel: None,
            required_fields,
            ram_fields: HashMap::new(),
        }
    }

    /// Current location channel this object is broadcasting its
    /// children's creation/deletion announcements on.
    pub fn location_channel(&self) -> Channel {
        donet_core::globals::location_as_channel(self.parent, self.zone)
    }

    pub fn own_channel(&self) -> Channel {
        donet_core::globals::doid_as_channel(self.doid)
    }

    pub fn set_location(&mut self, parent: DoId, zone: Zone) -> Channel {
        let old = self.location_channel();
        self.parent = parent;
        self.zone = zone;
        old
    }

    pub fn get_field(&self, field: FieldId) -> Option<&FieldValue> {
        self.required_fields.get(&field).or_else(|| self.ram_fields.get(&field))
    }

    /// Sets a field's value, routing it to the required or RAM map
    /// depending on which one already holds it; unseen fields default
    /// to RAM storage, matching the behavior of a field with no
    /// `required` flag arriving for the first time.
    pub fn set_field(&mut self, field: FieldId, value: FieldValue) {
        if self.required_fields.contains_key(&field) {
            self.required_fields.insert(field, value);
        } else {
            self.ram_fields.insert(field, value);
        }
    }

    pub fn delete_ram_field(&mut self, field: FieldId) {
        self.ram_fields.remove(&field);
    }

    pub fn all_fields(&self) -> impl Iterator<Item = (&FieldId, &FieldValue)> {
        self.required_fields.iter().chain(self.ram_fields.iter())
    }

    pub fn is_in_zone(&self, parent: DoId, zone: Zone) -> bool {
        self.parent == parent && self.zone == zone
    }

    pub fn is_in_zones(&self, parent: DoId, zones: &[Zone]) -> bool {
        self.parent == parent && zones.contains(&self.zone)
    }

    pub fn is_child_of(&self, parent: DoId) -> bool {
        self.parent == parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DistributedObject {
        let mut required = HashMap::new();
        required.insert(0u16, vec![1, 2, 3]);
        DistributedObject::new(100, 5, 1, 7, required)
    }

    #[test]
    fn set_field_prefers_existing_required_slot() {
        let mut obj = sample();
        obj.set_field(0, vec![9, 9]);
        assert_eq!(obj.required_fields.get(&0), Some(&vec![9, 9]));
        assert!(obj.ram_fields.is_empty());
    }

    #[test]
    fn set_field_falls_back_to_ram() {
        let mut obj = sample();
        obj.set_field(42, vec![1]);
        assert_eq!(obj.ram_fields.get(&42), Some(&vec![1]));
    }

    #[test]
    fn location_channel_changes_on_move() {
        let mut obj = sample();
        let old = obj.set_location(2, 9);
        assert_eq!(old, donet_core::globals::location_as_channel(1, 7));
        assert_eq!(obj.location_channel(), donet_core::globals::location_as_channel(2, 9));
    }

    #[test]
    fn zone_membership_checks() {
        let obj = sample();
        assert!(obj.is_in_zone(1, 7));
        assert!(obj.is_in_zones(1, &[3, 7, 9]));
        assert!(!obj.is_in_zones(1, &[3, 9]));
        assert!(obj.is_child_of(1));
    }
}
