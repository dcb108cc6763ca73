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

//! MySQL-backed [`DatabaseBackend`], storing each object as one row
//! holding its fields as a JSON document rather than one column per
//! field, so new DC fields never require a schema migration.

use crate::{DatabaseBackend, DatabaseError, FieldValue, Result, StoredObject};
use donet_core::globals::{DClassId, DoId, FieldId};
use mysql::prelude::*;
use mysql::{Pool, PooledConn};
use mysql_common::params;
use std::collections::HashMap;
use std::sync::Mutex;

pub struct DbCredentials<'a> {
    pub host: &'a str,
    pub port: u16,
    pub database: &'a str,
    pub user: &'a str,
    pub password: &'a str,
}

/// JSON shape stored in the `objects.fields_json` column.
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct FieldsDocument {
    fields: HashMap<FieldId, FieldValue>,
}

/// JSON shape stored in the single-row `globals.free_json` column.
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct FreeList {
    doids: Vec<DoId>,
}

pub struct MysqlBackend {
    _pool: Pool,
    conn: Mutex<PooledConn>,
    generate_min: DoId,
    generate_max: DoId,
}

impl MysqlBackend {
    pub fn new(creds: DbCredentials, generate_min: DoId, generate_max: DoId) -> std::io::Result<Self> {
        let url = format!(
            "mysql://{}:{}@{}:{}/{}",
            creds.user, creds.password, creds.host, creds.port, creds.database
        );
        let pool = Pool::new(url.as_str())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let conn = pool
            .get_conn()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

        let backend = Self {
            _pool: pool,
            conn: Mutex::new(conn),
            generate_min,
            generate_max,
        };
        backend
            .check_tables()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(backend)
    }

    fn check_tables(&self) -> std::result::Result<(), mysql::Error> {
        let mut conn = self.conn.lock().unwrap();

        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS objects (
                doid BIGINT UNSIGNED NOT NULL PRIMARY KEY,
                dclass SMALLINT UNSIGNED NOT NULL,
                fields_json TEXT NOT NULL
            )",
        )?;
        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS globals (
                id TINYINT UNSIGNED NOT NULL PRIMARY KEY,
                doid_next BIGINT UNSIGNED NOT NULL,
                free_json TEXT NOT NULL
            )",
        )?;
        conn.query_drop(format!(
            "INSERT IGNORE INTO globals (id, doid_next, free_json) VALUES (1, {}, '{{\"doids\":[]}}')",
            self.generate_min
        ))?;
        Ok(())
    }

    fn to_backend_err(e: mysql::Error) -> DatabaseError {
        DatabaseError::Backend(e.to_string())
    }
}

impl DatabaseBackend for MysqlBackend {
    async fn allocate_doid(&self) -> Result<DoId> {
        let generate_max = self.generate_max;
        let doids: (DoId, String) = tokio::task::block_in_place(|| {
            let mut conn = self.conn.lock().unwrap();
            conn.query_first("SELECT doid_next, free_json FROM globals WHERE id = 1")
                .map_err(Self::to_backend_err)
                .and_then(|row: Option<(DoId, String)>| row.ok_or(DatabaseError::RangeExhausted))
        })?;

        let (next, free_json) = doids;
        let mut free: FreeList = serde_json::from_str(&free_json).unwrap_or_default();

        if let Some(doid) = free.doids.pop() {
            let new_json = serde_json::to_string(&free).unwrap();
            tokio::task::block_in_place(|| {
                let mut conn = self.conn.lock().unwrap();
                conn.exec_drop(
                    "UPDATE globals SET free_json = :json WHERE id = 1",
                    params! { "json" => new_json },
                )
                .map_err(Self::to_backend_err)
            })?;
            return Ok(doid);
        }

        if next > generate_max {
            return Err(DatabaseError::RangeExhausted);
        }

        tokio::task::block_in_place(|| {
            let mut conn = self.conn.lock().unwrap();
            conn.exec_drop(
                "UPDATE globals SET doid_next = :next WHERE id = 1",
                params! { "next" => next + 1 },
            )
            .map_err(Self::to_backend_err)
        })?;
        Ok(next)
    }

    async fn free_doid(&self, doid: DoId) -> Result<()> {
        tokio::task::block_in_place(|| {
            let mut conn = self.conn.lock().unwrap();
            let free_json: String = conn
                .query_first("SELECT free_json FROM globals WHERE id = 1")
                .map_err(Self::to_backend_err)?
                .unwrap_or_else(|| "{\"doids\":[]}".to_string());

            let mut free: FreeList = serde_json::from_str(&free_json).unwrap_or_default();
            free.doids.push(doid);
            let new_json = serde_json::to_string(&free).unwrap();

            conn.exec_drop(
                "UPDATE globals SET free_json = :json WHERE id = 1",
                params! { "json" => new_json },
            )
            .map_err(Self::to_backend_err)
        })
    }

    async fn create_object(&self, doid: DoId, dclass: DClassId, fields: HashMap<FieldId, FieldValue>) -> Result<()> {
        let doc = FieldsDocument { fields };
        let json = serde_json::to_string(&doc).unwrap();

        tokio::task::block_in_place(|| {
            let mut conn = self.conn.lock().unwrap();
            conn.exec_drop(
                "INSERT INTO objects (doid, dclass, fields_json) VALUES (:doid, :dclass, :json)",
                params! { "doid" => doid, "dclass" => dclass, "json" => json },
            )
            .map_err(Self::to_backend_err)
        })
    }

    async fn delete_object(&self, doid: DoId) -> Result<()> {
        tokio::task::block_in_place(|| {
            let mut conn = self.conn.lock().unwrap();
            conn.exec_drop("DELETE FROM objects WHERE doid = :doid", params! { "doid" => doid })
                .map_err(Self::to_backend_err)
        })
    }

    async fn get_all(&self, doid: DoId) -> Result<StoredObject> {
        tokio::task::block_in_place(|| {
            let mut conn = self.conn.lock().unwrap();
            let row: Option<(DClassId, String)> = conn
                .exec_first(
                    "SELECT dclass, fields_json FROM objects WHERE doid = :doid",
                    params! { "doid" => doid },
                )
                .map_err(Self::to_backend_err)?;

            let (dclass, json) = row.ok_or(DatabaseError::NotFound(doid))?;
            let doc: FieldsDocument = serde_json::from_str(&json)
                .map_err(|e| DatabaseError::Backend(e.to_string()))?;

            Ok(StoredObject { doid, dclass, fields: doc.fields })
        })
    }

    async fn get_fields(&self, doid: DoId, fields: &[FieldId]) -> Result<HashMap<FieldId, FieldValue>> {
        let all = self.get_all(doid).await?;
        Ok(all
            .fields
            .into_iter()
            .filter(|(fid, _)| fields.contains(fid))
            .collect())
    }

    async fn set_field(&self, doid: DoId, field: FieldId, value: FieldValue) -> Result<()> {
        let mut fields = HashMap::new();
        fields.insert(field, value);
        self.set_fields(doid, fields).await
    }

    async fn set_fields(&self, doid: DoId, fields: HashMap<FieldId, FieldValue>) -> Result<()> {
        let mut obj = self.get_all(doid).await?;
        obj.fields.extend(fields);

        let doc = FieldsDocument { fields: obj.fields };
        let json = serde_json::to_string(&doc).unwrap();

        tokio::task::block_in_place(|| {
            let mut conn = self.conn.lock().unwrap();
            conn.exec_drop(
                "UPDATE objects SET fields_json = :json WHERE doid = :doid",
                params! { "json" => json, "doid" => doid },
            )
            .map_err(Self::to_backend_err)
        })
    }

    async fn set_field_if_equals(
        &self,
        doid: DoId,
        field: FieldId,
        expected: FieldValue,
        value: FieldValue,
    ) -> Result<(bool, FieldValue)> {
        let obj = self.get_all(doid).await?;
        let current = obj.fields.get(&field).cloned().unwrap_or_default();

        if current != expected {
            return Ok((false, current));
        }
        self.set_field(doid, field, value.clone()).await?;
        Ok((true, value))
    }

    async fn delete_fields(&self, doid: DoId, fields: &[FieldId]) -> Result<()> {
        let mut obj = self.get_all(doid).await?;
        for field in fields {
            obj.fields.remove(field);
        }
        let doc = FieldsDocument { fields: obj.fields };
        let json = serde_json::to_string(&doc).unwrap();

        tokio::task::block_in_place(|| {
            let mut conn = self.conn.lock().unwrap();
            conn.exec_drop(
                "UPDATE objects SET fields_json = :json WHERE doid = :doid",
                params! { "json" => json, "doid" => doid },
            )
            .map_err(Self::to_backend_err)
        })
    }
}
