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

//! Deserializable YAML form of a DC schema document.
//!
//! Reading files from disk is left to the binary crate, the same way
//! [`donet_daemon::config`](../../donet_daemon/config/index.html) only
//! owns the shape of the daemon configuration document and leaves the
//! `File::open`/`read_to_string` call to `donet`'s `main.rs`. Once the
//! text of every configured schema document is in hand, [`load_dc_schema`]
//! turns it into a [`DCRegistry`] the cluster roles can use directly.

use super::{DCField, DCRegistry, DClass, FieldFlags, WireShape};
use crate::globals::{DCFileHash, DClassId, FieldId};
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FieldFlagsSpec {
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

impl From<FieldFlagsSpec> for FieldFlags {
    fn from(spec: FieldFlagsSpec) -> Self {
        Self {
            required: spec.required,
            ram: spec.ram,
            db: spec.db,
            airecv: spec.airecv,
            ownrecv: spec.ownrecv,
            clrecv: spec.clrecv,
            broadcast: spec.broadcast,
            ownsend: spec.ownsend,
            clsend: spec.clsend,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct FieldSpec {
    pub id: FieldId,
    pub name: String,
    #[serde(default)]
    pub flags: FieldFlagsSpec,
    /// Present only on molecular fields; lists the atomic field IDs
    /// this field expands into. Mutually exclusive with `flags`.
    #[serde(default)]
    pub molecular: Option<Vec<FieldId>>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ClassSpec {
    pub id: DClassId,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchemaDocument {
    pub classes: Vec<ClassSpec>,
}

/// Parses every given YAML schema document and merges them into a
/// single [`DCRegistry`].
///
/// The registry's hash is derived from the exact text of every
/// document, in the order given, so a `CLIENT_HELLO` handshake that
/// compares hashes will reject a client built against a schema that
/// differs in any way, including field ordering or whitespace.
pub fn load_dc_schema<S: AsRef<str>>(documents: &[S]) -> Result<DCRegistry, serde_yaml::Error> {
    let mut hasher = DefaultHasher::new();
    let mut classes = Vec::new();

    for doc in documents {
        let text = doc.as_ref();
        text.hash(&mut hasher);

        let parsed: SchemaDocument = serde_yaml::from_str(text)?;

        for class_spec in parsed.classes {
            let mut dclass = DClass::new(class_spec.id, class_spec.name);

            for field_spec in class_spec.fields {
                let field = match field_spec.molecular {
                    Some(atoms) => DCField::molecular(field_spec.id, field_spec.name, atoms),
                    None => DCField::new(field_spec.id, field_spec.name, field_spec.flags.into()),
                };
                dclass.add_field(field);
            }
            classes.push(dclass);
        }
    }

    let hash: DCFileHash = hasher.finish() as DCFileHash;
    Ok(DCRegistry::from_classes(classes, hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
classes:
  - id: 1
    name: DistributedAvatar
    fields:
      - id: 1
        name: setName
        flags: { required: true, broadcast: true }
      - id: 2
        name: setHp
        flags: { ram: true, airecv: true }
      - id: 3
        name: setXyz
        molecular: [1, 2]
"#;

    #[test]
    fn parses_classes_and_fields_from_yaml() {
        let registry = load_dc_schema(&[DOC]).unwrap();
        let dclass = registry.get_class_by_name("DistributedAvatar").unwrap();

        assert!(dclass.get_field_by_name("setName").unwrap().flags.is_required());
        assert!(dclass.get_field_by_name("setHp").unwrap().flags.is_ram());
        assert!(dclass.get_field_by_name("setXyz").unwrap().is_molecular());
        assert_eq!(dclass.expand_molecular(3), vec![1, 2]);
    }

    #[test]
    fn hash_is_stable_for_identical_input() {
        let a = load_dc_schema(&[DOC]).unwrap();
        let b = load_dc_schema(&[DOC]).unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn hash_changes_when_document_changes() {
        let a = load_dc_schema(&[DOC]).unwrap();
        let b = load_dc_schema(&[DOC.replace("setName", "setNick")]).unwrap();
        assert_ne!(a.hash, b.hash);
    }
}
