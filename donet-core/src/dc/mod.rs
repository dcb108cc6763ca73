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

//! In-memory representation of a DC (Distributed Class) schema.
//!
//! This module does not parse the historical `.dc` grammar; schema
//! documents are plain YAML (see [`schema::load_dc_schema`]), and the
//! cluster roles otherwise treat the result as a read-only registry
//! handed to them fully resolved at startup (see
//! [`DCRegistry::from_classes`]). Field flags, atomic vs molecular
//! fields, and ownership/broadcast semantics are modeled here exactly
//! as the wire protocol needs them.

use crate::globals::{DClassId, FieldId};
use std::collections::HashMap;

pub mod schema;

/// The flags a single DC field may carry, matching the historical
/// DC language keywords (`required`, `ram`, `db`, `airecv`, `ownrecv`,
/// `clrecv`, `broadcast`, `ownsend`, `clsend`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldFlags {
    pub required: bool,
    pub ram: bool,
    pub db: bool,
    pub airecv: bool,
    pub ownrecv: bool,
    pub clrecv: bool,
    pub broadcast: bool,
    pub ownsend: bool,
    pub clsend: bool,
}

impl FieldFlags {
    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_ram(&self) -> bool {
        // required fields are implicitly kept in RAM by the State Server.
        self.ram || self.required
    }

    pub fn is_db(&self) -> bool {
        self.db
    }

    pub fn is_airecv(&self) -> bool {
        self.airecv
    }

    pub fn is_ownrecv(&self) -> bool {
        self.ownrecv
    }

    pub fn is_clrecv(&self) -> bool {
        self.clrecv
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    pub fn is_ownsend(&self) -> bool {
        self.ownsend
    }

    pub fn is_clsend(&self) -> bool {
        self.clsend
    }

    /// Whether a client is permitted to ever send an update for this field,
    /// either as any owner of the object (`ownsend`) or any client (`clsend`).
    pub fn is_client_sendable(&self) -> bool {
        self.ownsend || self.clsend
    }
}

/// Describes how a field's value is shaped on the wire: a plain
/// (atomic) field, or a molecular field that expands into several
/// atomic fields when read and collapses several values when written.
#[derive(Debug, Clone)]
pub enum WireShape {
    Atomic,
    Molecular(Vec<FieldId>),
}

/// A single field definition within a [`DClass`].
#[derive(Debug, Clone)]
pub struct DCField {
    pub id: FieldId,
    pub name: String,
    pub flags: FieldFlags,
    pub shape: WireShape,
    /// Encoded default value, sent to clients/State Server when an
    /// object is created without providing this field explicitly.
    pub default_value: Vec<u8>,
}

impl DCField {
    pub fn new(id: FieldId, name: impl Into<String>, flags: FieldFlags) -> Self {
        Self {
            id,
            name: name.into(),
            flags,
            shape: WireShape::Atomic,
            default_value: Vec::new(),
        }
    }

    pub fn molecular(id: FieldId, name: impl Into<String>, atoms: Vec<FieldId>) -> Self {
        Self {
            id,
            name: name.into(),
            flags: FieldFlags::default(),
            shape: WireShape::Molecular(atoms),
            default_value: Vec::new(),
        }
    }

    pub fn is_molecular(&self) -> bool {
        matches!(self.shape, WireShape::Molecular(_))
    }
}

/// A distributed class: an ordered, named collection of fields shared
/// by every distributed object of this class across the cluster.
#[derive(Debug, Clone)]
pub struct DClass {
    pub id: DClassId,
    pub name: String,
    fields_by_id: HashMap<FieldId, DCField>,
    fields_by_name: HashMap<String, FieldId>,
}

impl DClass {
    pub fn new(id: DClassId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            fields_by_id: HashMap::new(),
            fields_by_name: HashMap::new(),
        }
    }

    pub fn add_field(&mut self, field: DCField) {
        self.fields_by_name.insert(field.name.clone(), field.id);
        self.fields_by_id.insert(field.id, field);
    }

    pub fn get_field(&self, id: FieldId) -> Option<&DCField> {
        self.fields_by_id.get(&id)
    }

    pub fn get_field_by_name(&self, name: &str) -> Option<&DCField> {
        self.fields_by_name.get(name).and_then(|id| self.fields_by_id.get(id))
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &DCField> {
        self.fields_by_id.values().filter(|f| f.flags.is_required())
    }

    pub fn ram_fields(&self) -> impl Iterator<Item = &DCField> {
        self.fields_by_id.values().filter(|f| f.flags.is_ram())
    }

    pub fn db_fields(&self) -> impl Iterator<Item = &DCField> {
        self.fields_by_id.values().filter(|f| f.flags.is_db())
    }

    /// Expands a molecular field into its constituent atomic field IDs.
    /// Returns a single-element slice for atomic fields.
    pub fn expand_molecular<'a>(&'a self, field_id: FieldId) -> Vec<FieldId> {
        match self.fields_by_id.get(&field_id) {
            Some(DCField {
                shape: WireShape::Molecular(atoms),
                ..
            }) => atoms.clone(),
            Some(_) => vec![field_id],
            None => vec![],
        }
    }
}

/// The full DC schema for a running cluster: every distributed class,
/// keyed both by ID (as sent over the wire) and by name.
#[derive(Debug, Clone, Default)]
pub struct DCRegistry {
    classes_by_id: HashMap<DClassId, DClass>,
    classes_by_name: HashMap<String, DClassId>,
    /// File-level hash used in `CLIENT_HELLO` to reject mismatched clients.
    pub hash: crate::globals::DCFileHash,
}

impl DCRegistry {
    pub fn from_classes(classes: Vec<DClass>, hash: crate::globals::DCFileHash) -> Self {
        let mut registry = Self {
            hash,
            ..Default::default()
        };
        for dclass in classes {
            registry.classes_by_name.insert(dclass.name.clone(), dclass.id);
            registry.classes_by_id.insert(dclass.id, dclass);
        }
        registry
    }

    pub fn get_class(&self, id: DClassId) -> Option<&DClass> {
        self.classes_by_id.get(&id)
    }

    pub fn get_class_by_name(&self, name: &str) -> Option<&DClass> {
        self.classes_by_name.get(name).and_then(|id| self.classes_by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.classes_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes_by_id.is_empty()
    }

    /// The schema hash as sent in the legacy `CLIENT_HELLO` field, which
    /// historically carried the DC file hash as a signed 32-bit integer.
    pub fn get_legacy_hash(&self) -> crate::globals::DCFileHash {
        self.hash
    }

    /// Hex-formatted rendering of [`DCRegistry::get_legacy_hash`], as
    /// printed by `donetd --validate-dc`.
    pub fn get_pretty_hash(&self) -> String {
        format!("{:#010x}", self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registry() -> DCRegistry {
        let mut avatar = DClass::new(1, "DistributedAvatar");

        avatar.add_field(DCField::new(
            1,
            "setName",
            FieldFlags {
                required: true,
                broadcast: true,
                ..Default::default()
            },
        ));
        avatar.add_field(DCField::new(
            2,
            "setHp",
            FieldFlags {
                ram: true,
                airecv: true,
                ..Default::default()
            },
        ));
        avatar.add_field(DCField::molecular(3, "setXyz", vec![1, 2]));

        DCRegistry::from_classes(vec![avatar], 0xdeadbeef)
    }

    #[test]
    fn looks_up_class_by_id_and_name() {
        let reg = sample_registry();
        assert!(reg.get_class(1).is_some());
        assert_eq!(reg.get_class_by_name("DistributedAvatar").unwrap().id, 1);
        assert!(reg.get_class_by_name("NoSuchClass").is_none());
    }

    #[test]
    fn required_and_ram_fields_partition_correctly() {
        let reg = sample_registry();
        let dclass = reg.get_class(1).unwrap();

        let required: Vec<&str> = dclass.required_fields().map(|f| f.name.as_str()).collect();
        assert_eq!(required, vec!["setName"]);

        let ram: Vec<FieldId> = dclass.ram_fields().map(|f| f.id).collect();
        assert!(ram.contains(&1)); // required implies ram
        assert!(ram.contains(&2));
    }

    #[test]
    fn molecular_field_expands_to_atoms() {
        let reg = sample_registry();
        let dclass = reg.get_class(1).unwrap();

        assert_eq!(dclass.expand_molecular(3), vec![1, 2]);
        assert_eq!(dclass.expand_molecular(1), vec![1]);
        assert!(dclass.expand_molecular(99).is_empty());
    }
}
