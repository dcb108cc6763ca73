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

//! Persisted object storage backing the Database State Server.
//!
//! The cluster's document-oriented persisted layout (an `objects`
//! collection keyed by DoId holding `dclass` + a `fields` map, and a
//! `globals` document tracking DoId allocation) is stored on top of
//! the teacher's SQL driver: each document is serialized to JSON and
//! kept in one column rather than exploded into one relational column
//! per field, so the SQL backend never needs per-dclass schema
//! migrations.

#[cfg(feature = "mysql")]
pub mod mysql_backend;
pub mod server;

use donet_core::globals::{DClassId, DoId, FieldId};
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;

/// One persisted field value, keyed by field id, holding the raw bytes
/// the owning DC field would decode. The database never interprets
/// these bytes beyond storing and returning them.
pub type FieldValue = Vec<u8>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub doid: DoId,
    pub dclass: DClassId,
    pub fields: HashMap<FieldId, FieldValue>,
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("object with DoId {0} not found")]
    NotFound(DoId),
    #[error("DoId range exhausted")]
    RangeExhausted,
    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// The persistence boundary the Database State Server depends on.
///
/// Per §1, the concrete document database driver is external to this
/// specification; this trait is the seam a DBSS talks through, and
/// [`mysql_backend::MysqlBackend`] is the one concrete adapter carried
/// from the teacher's SQL stack.
pub trait DatabaseBackend: Send + Sync {
    /// Allocates the next free DoId from the `globals` document, per
    /// the `generate.min`/`generate.max` configured range.
    fn allocate_doid(&self) -> impl Future<Output = Result<DoId>> + Send;

    /// Returns a previously-allocated DoId to the free list, e.g. when
    /// object creation fails partway through.
    fn free_doid(&self, doid: DoId) -> impl Future<Output = Result<()>> + Send;

    fn create_object(
        &self,
        doid: DoId,
        dclass: DClassId,
        fields: HashMap<FieldId, FieldValue>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_object(&self, doid: DoId) -> impl Future<Output = Result<()>> + Send;

    fn get_all(&self, doid: DoId) -> impl Future<Output = Result<StoredObject>> + Send;

    fn get_fields(
        &self,
        doid: DoId,
        fields: &[FieldId],
    ) -> impl Future<Output = Result<HashMap<FieldId, FieldValue>>> + Send;

    fn set_field(
        &self,
        doid: DoId,
        field: FieldId,
        value: FieldValue,
    ) -> impl Future<Output = Result<()>> + Send;

    fn set_fields(
        &self,
        doid: DoId,
        fields: HashMap<FieldId, FieldValue>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Compare-and-swap: applies `value` only if the field's current
    /// value equals `expected`. Returns the value actually present
    /// after the call, so the caller can tell success from a stale
    /// comparison per `DBSERVER_OBJECT_SET_FIELD_IF_EQUALS_RESP`.
    fn set_field_if_equals(
        &self,
        doid: DoId,
        field: FieldId,
        expected: FieldValue,
        value: FieldValue,
    ) -> impl Future<Output = Result<(bool, FieldValue)>> + Send;

    fn delete_fields(&self, doid: DoId, fields: &[FieldId]) -> impl Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::sync::Mutex;

    /// An in-memory [`DatabaseBackend`] used to exercise callers of the
    /// trait (the DBSS) without a real SQL connection.
    #[derive(Default)]
    pub struct MemoryBackend {
        objects: Mutex<Map<DoId, StoredObject>>,
        next_doid: Mutex<DoId>,
        free_list: Mutex<Vec<DoId>>,
    }

    impl MemoryBackend {
        pub fn starting_at(next: DoId) -> Self {
            Self {
                objects: Mutex::default(),
                next_doid: Mutex::new(next),
                free_list: Mutex::default(),
            }
        }
    }

    impl DatabaseBackend for MemoryBackend {
        async fn allocate_doid(&self) -> Result<DoId> {
            if let Some(doid) = self.free_list.lock().unwrap().pop() {
                return Ok(doid);
            }
            let mut next = self.next_doid.lock().unwrap();
            let doid = *next;
            *next += 1;
            Ok(doid)
        }

        async fn free_doid(&self, doid: DoId) -> Result<()> {
            self.free_list.lock().unwrap().push(doid);
            Ok(())
        }

        async fn create_object(
            &self,
            doid: DoId,
            dclass: DClassId,
            fields: HashMap<FieldId, FieldValue>,
        ) -> Result<()> {
            self.objects
                .lock()
                .unwrap()
                .insert(doid, StoredObject { doid, dclass, fields });
            Ok(())
        }

        async fn delete_object(&self, doid: DoId) -> Result<()> {
            self.objects.lock().unwrap().remove(&doid);
            Ok(())
        }

        async fn get_all(&self, doid: DoId) -> Result<StoredObject> {
            self.objects
                .lock()
                .unwrap()
                .get(&doid)
                .cloned()
                .ok_or(DatabaseError::NotFound(doid))
        }

        async fn get_fields(&self, doid: DoId, fields: &[FieldId]) -> Result<HashMap<FieldId, FieldValue>> {
            let objects = self.objects.lock().unwrap();
            let obj = objects.get(&doid).ok_or(DatabaseError::NotFound(doid))?;

            Ok(fields
                .iter()
                .filter_map(|fid| obj.fields.get(fid).map(|v| (*fid, v.clone())))
                .collect())
        }

        async fn set_field(&self, doid: DoId, field: FieldId, value: FieldValue) -> Result<()> {
            let mut objects = self.objects.lock().unwrap();
            let obj = objects.get_mut(&doid).ok_or(DatabaseError::NotFound(doid))?;
            obj.fields.insert(field, value);
            Ok(())
        }

        async fn set_fields(&self, doid: DoId, fields: HashMap<FieldId, FieldValue>) -> Result<()> {
            let mut objects = self.objects.lock().unwrap();
            let obj = objects.get_mut(&doid).ok_or(DatabaseError::NotFound(doid))?;
            obj.fields.extend(fields);
            Ok(())
        }

        async fn set_field_if_equals(
            &self,
            doid: DoId,
            field: FieldId,
            expected: FieldValue,
            value: FieldValue,
        ) -> Result<(bool, FieldValue)> {
            let mut objects = self.objects.lock().unwrap();
            let obj = objects.get_mut(&doid).ok_or(DatabaseError::NotFound(doid))?;
            let current = obj.fields.get(&field).cloned().unwrap_or_default();

            if current == expected {
                obj.fields.insert(field, value.clone());
                Ok((true, value))
            } else {
                Ok((false, current))
            }
        }

        async fn delete_fields(&self, doid: DoId, fields: &[FieldId]) -> Result<()> {
            let mut objects = self.objects.lock().unwrap();
            let obj = objects.get_mut(&doid).ok_or(DatabaseError::NotFound(doid))?;
            for field in fields {
                obj.fields.remove(field);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn doid_allocation_reuses_freed_ids() {
        let db = MemoryBackend::starting_at(100);

        let a = db.allocate_doid().await.unwrap();
        let b = db.allocate_doid().await.unwrap();
        assert_eq!((a, b), (100, 101));

        db.free_doid(a).await.unwrap();
        let c = db.allocate_doid().await.unwrap();
        assert_eq!(c, a);
    }

    #[tokio::test]
    async fn set_field_if_equals_rejects_stale_comparison() {
        let db = MemoryBackend::default();
        let doid = db.allocate_doid().await.unwrap();

        let mut fields = HashMap::new();
        fields.insert(7u16, vec![1, 2, 3]);
        db.create_object(doid, 1, fields).await.unwrap();

        let (ok, current) = db
            .set_field_if_equals(doid, 7, vec![9, 9, 9], vec![4, 5, 6])
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(current, vec![1, 2, 3]);

        let (ok, current) = db
            .set_field_if_equals(doid, 7, vec![1, 2, 3], vec![4, 5, 6])
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(current, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn get_all_reports_not_found() {
        let db = MemoryBackend::default();
        let err = db.get_all(9999).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(9999)));
    }
}
