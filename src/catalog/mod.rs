// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Catalog: table, column and dictionary descriptors.
//!
//! Sharded tables follow the engine's schema quirk: the physical shard
//! columns carry a zero dictionary id, and the logical table's column
//! descriptor is the authoritative place to resolve the dictionary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::common::config::storage_data_dir;
use crate::datamgr::{DataMgr, MemoryLevel};
use crate::fragmenter::Fragmenter;
use crate::types::{SqlType, SqlTypeInfo};

pub const DELETED_COLUMN_NAME: &str = "$deleted$";
pub const ROWID_COLUMN_NAME: &str = "rowid";

pub struct ColumnDescriptor {
    pub table_id: i32,
    pub column_id: i32,
    pub column_name: String,
    pub column_type: SqlTypeInfo,
    pub is_deleted_col: bool,
    pub is_virtual_col: bool,
}

pub struct TableDescriptor {
    pub table_id: i32,
    pub table_name: String,
    /// Total number of column descriptors, virtual and delete columns
    /// included.
    pub n_columns: usize,
    /// Shard ordinal for a physical shard table, -1 otherwise.
    pub shard: i32,
    /// The user-visible table id; equals `table_id` except on shards.
    pub logical_table_id: i32,
    pub persistence_level: MemoryLevel,
    pub fragmenter: Arc<Fragmenter>,
}

/// Process-wide dictionary of one dict-encoded string column family.
/// `get_or_add` serializes through the dictionary's own mutex.
pub struct StringDictionary {
    inner: Mutex<DictInner>,
}

#[derive(Default)]
struct DictInner {
    strings: Vec<String>,
    ids: HashMap<String, i32>,
}

impl StringDictionary {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DictInner::default()),
        }
    }

    pub fn get_or_add(&self, s: &str) -> i32 {
        let mut inner = self.inner.lock().expect("string dictionary lock");
        if let Some(id) = inner.ids.get(s) {
            return *id;
        }
        let id = inner.strings.len() as i32;
        inner.strings.push(s.to_string());
        inner.ids.insert(s.to_string(), id);
        id
    }

    pub fn get_id(&self, s: &str) -> Option<i32> {
        self.inner
            .lock()
            .expect("string dictionary lock")
            .ids
            .get(s)
            .copied()
    }

    pub fn get_string(&self, id: i64) -> Result<String, String> {
        let inner = self.inner.lock().expect("string dictionary lock");
        if id < 0 || id as usize >= inner.strings.len() {
            return Err(format!(
                "string code out of dictionary range: code={}, dict_size={}",
                id,
                inner.strings.len()
            ));
        }
        Ok(inner.strings[id as usize].clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("string dictionary lock").strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StringDictionary {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DictDescriptor {
    pub dict_id: i32,
    pub dict: Arc<StringDictionary>,
}

pub struct Catalog {
    db_id: i32,
    data_mgr: Arc<DataMgr>,
    inner: Mutex<CatalogInner>,
}

#[derive(Default)]
struct CatalogInner {
    tables_by_id: HashMap<i32, Arc<TableDescriptor>>,
    table_ids_by_name: HashMap<String, i32>,
    columns: HashMap<(i32, i32), Arc<ColumnDescriptor>>,
    column_ids_by_name: HashMap<(i32, String), i32>,
    dicts: HashMap<i32, Arc<DictDescriptor>>,
    shards_by_logical: HashMap<i32, Vec<i32>>,
    next_table_id: i32,
    next_dict_id: i32,
}

impl Catalog {
    pub fn new(db_id: i32, data_dir: PathBuf) -> Result<Arc<Self>, String> {
        let data_mgr = DataMgr::new(data_dir)?;
        Ok(Arc::new(Self {
            db_id,
            data_mgr,
            inner: Mutex::new(CatalogInner {
                next_table_id: 1,
                next_dict_id: 1,
                ..CatalogInner::default()
            }),
        }))
    }

    /// Catalog rooted at the configured storage directory.
    pub fn with_default_storage(db_id: i32) -> Result<Arc<Self>, String> {
        Self::new(db_id, storage_data_dir())
    }

    pub fn db_id(&self) -> i32 {
        self.db_id
    }

    pub fn data_mgr(&self) -> &Arc<DataMgr> {
        &self.data_mgr
    }

    pub fn get_metadata_for_table(&self, name: &str) -> Result<Arc<TableDescriptor>, String> {
        let inner = self.inner.lock().expect("catalog lock");
        let table_id = inner
            .table_ids_by_name
            .get(name)
            .copied()
            .ok_or_else(|| format!("table does not exist: name={}", name))?;
        Ok(Arc::clone(
            inner
                .tables_by_id
                .get(&table_id)
                .expect("table registered by name must exist by id"),
        ))
    }

    pub fn get_metadata_for_table_by_id(
        &self,
        table_id: i32,
    ) -> Result<Arc<TableDescriptor>, String> {
        let inner = self.inner.lock().expect("catalog lock");
        inner
            .tables_by_id
            .get(&table_id)
            .map(Arc::clone)
            .ok_or_else(|| format!("table does not exist: table_id={}", table_id))
    }

    pub fn get_metadata_for_column(
        &self,
        table_id: i32,
        column_id: i32,
    ) -> Option<Arc<ColumnDescriptor>> {
        let inner = self.inner.lock().expect("catalog lock");
        inner.columns.get(&(table_id, column_id)).map(Arc::clone)
    }

    pub fn get_metadata_for_column_by_name(
        &self,
        table_id: i32,
        column_name: &str,
    ) -> Result<Arc<ColumnDescriptor>, String> {
        let inner = self.inner.lock().expect("catalog lock");
        let column_id = inner
            .column_ids_by_name
            .get(&(table_id, column_name.to_string()))
            .copied()
            .ok_or_else(|| {
                format!(
                    "column does not exist: table_id={}, column={}",
                    table_id, column_name
                )
            })?;
        Ok(Arc::clone(
            inner
                .columns
                .get(&(table_id, column_id))
                .expect("column registered by name must exist by id"),
        ))
    }

    pub fn get_metadata_for_dict(&self, dict_id: i32) -> Option<Arc<DictDescriptor>> {
        let inner = self.inner.lock().expect("catalog lock");
        inner.dicts.get(&dict_id).map(Arc::clone)
    }

    /// The user-visible table id for a possibly-sharded physical id.
    pub fn get_logical_table_id(&self, table_id: i32) -> Result<i32, String> {
        Ok(self.get_metadata_for_table_by_id(table_id)?.logical_table_id)
    }

    /// Physical shard table ids of a logical table, empty when unsharded.
    pub fn get_shard_table_ids(&self, logical_table_id: i32) -> Vec<i32> {
        let inner = self.inner.lock().expect("catalog lock");
        inner
            .shards_by_logical
            .get(&logical_table_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn create_dictionary(&self) -> Arc<DictDescriptor> {
        let mut inner = self.inner.lock().expect("catalog lock");
        let dict_id = inner.next_dict_id;
        inner.next_dict_id += 1;
        let desc = Arc::new(DictDescriptor {
            dict_id,
            dict: Arc::new(StringDictionary::new()),
        });
        inner.dicts.insert(dict_id, Arc::clone(&desc));
        desc
    }

    /// Register a table. Besides the user columns every table gets a
    /// virtual `rowid` column and the hidden delete column. With
    /// `shard_count > 0` one physical table per shard is registered as
    /// well; their dict-string columns carry a zero dictionary id and
    /// resolve through the logical descriptor.
    pub fn create_table(
        &self,
        name: &str,
        columns: &[(&str, SqlTypeInfo)],
        persistence_level: MemoryLevel,
        shard_count: usize,
    ) -> Result<Arc<TableDescriptor>, String> {
        {
            let inner = self.inner.lock().expect("catalog lock");
            if inner.table_ids_by_name.contains_key(name) {
                return Err(format!("table already exists: name={}", name));
            }
        }
        let logical_id = self.register_table(name, columns, persistence_level, -1, None)?;
        let mut shard_ids = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let shard_name = format!("{}_shard_#{}", name, shard);
            let shard_id = self.register_table(
                &shard_name,
                columns,
                persistence_level,
                shard as i32,
                Some(logical_id),
            )?;
            shard_ids.push(shard_id);
        }
        let mut inner = self.inner.lock().expect("catalog lock");
        inner.shards_by_logical.insert(logical_id, shard_ids);
        let td = Arc::clone(
            inner
                .tables_by_id
                .get(&logical_id)
                .expect("logical table just registered"),
        );
        info!(
            "created table {}: table_id={}, shards={}",
            name, logical_id, shard_count
        );
        Ok(td)
    }

    fn register_table(
        &self,
        name: &str,
        columns: &[(&str, SqlTypeInfo)],
        persistence_level: MemoryLevel,
        shard: i32,
        logical_table_id: Option<i32>,
    ) -> Result<i32, String> {
        let mut inner = self.inner.lock().expect("catalog lock");
        let table_id = inner.next_table_id;
        inner.next_table_id += 1;

        let mut column_id = 0;
        let mut push_column = |inner: &mut CatalogInner,
                               column_name: &str,
                               column_type: SqlTypeInfo,
                               is_deleted_col: bool,
                               is_virtual_col: bool| {
            column_id += 1;
            let cd = Arc::new(ColumnDescriptor {
                table_id,
                column_id,
                column_name: column_name.to_string(),
                column_type,
                is_deleted_col,
                is_virtual_col,
            });
            inner.columns.insert((table_id, column_id), cd);
            inner
                .column_ids_by_name
                .insert((table_id, column_name.to_string()), column_id);
        };

        for (column_name, column_type) in columns {
            let mut column_type = *column_type;
            // Shard tables do not carry the dictionary id; the logical
            // descriptor is authoritative.
            if shard >= 0 && column_type.is_dict_string() {
                column_type.comp_param = 0;
            }
            push_column(&mut inner, column_name, column_type, false, false);
        }
        push_column(
            &mut inner,
            ROWID_COLUMN_NAME,
            SqlTypeInfo::scalar(SqlType::BigInt),
            false,
            true,
        );
        push_column(
            &mut inner,
            DELETED_COLUMN_NAME,
            SqlTypeInfo::scalar(SqlType::Boolean),
            true,
            false,
        );

        let td = Arc::new(TableDescriptor {
            table_id,
            table_name: name.to_string(),
            n_columns: column_id as usize,
            shard,
            logical_table_id: logical_table_id.unwrap_or(table_id),
            persistence_level,
            fragmenter: Arc::new(Fragmenter::new(table_id)),
        });
        inner.tables_by_id.insert(table_id, Arc::clone(&td));
        inner.table_ids_by_name.insert(name.to_string(), table_id);
        Ok(table_id)
    }

    /// Durable barrier: checkpoint the logical table and every shard, so
    /// shard epochs stay aligned even when only one shard was mutated.
    pub fn checkpoint(&self, logical_table_id: i32) -> Result<(), String> {
        let mut table_ids = vec![logical_table_id];
        table_ids.extend(self.get_shard_table_ids(logical_table_id));
        for table_id in table_ids {
            self.data_mgr.checkpoint_table(table_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SqlType, SqlTypeInfo};

    fn test_catalog() -> (tempfile::TempDir, Arc<Catalog>) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let catalog = Catalog::new(1, dir.path().to_path_buf()).expect("create catalog");
        (dir, catalog)
    }

    #[test]
    fn create_table_appends_rowid_and_delete_columns() {
        let (_dir, catalog) = test_catalog();
        let td = catalog
            .create_table(
                "t",
                &[("a", SqlTypeInfo::scalar(SqlType::Int))],
                MemoryLevel::Cpu,
                0,
            )
            .expect("create table");
        assert_eq!(td.n_columns, 3);
        let rowid = catalog
            .get_metadata_for_column_by_name(td.table_id, ROWID_COLUMN_NAME)
            .expect("rowid column");
        assert!(rowid.is_virtual_col);
        let deleted = catalog
            .get_metadata_for_column_by_name(td.table_id, DELETED_COLUMN_NAME)
            .expect("delete column");
        assert!(deleted.is_deleted_col);
        assert!(!deleted.is_virtual_col);
    }

    #[test]
    fn shard_columns_lose_their_dictionary_id() {
        let (_dir, catalog) = test_catalog();
        let dict = catalog.create_dictionary();
        let td = catalog
            .create_table(
                "t",
                &[("s", SqlTypeInfo::dict_string(dict.dict_id))],
                MemoryLevel::Cpu,
                2,
            )
            .expect("create sharded table");
        let shards = catalog.get_shard_table_ids(td.table_id);
        assert_eq!(shards.len(), 2);
        for shard_id in shards {
            let shard_td = catalog
                .get_metadata_for_table_by_id(shard_id)
                .expect("shard table");
            assert_eq!(shard_td.logical_table_id, td.table_id);
            assert!(shard_td.shard >= 0);
            let cd = catalog
                .get_metadata_for_column_by_name(shard_id, "s")
                .expect("shard column");
            assert_eq!(cd.column_type.comp_param, 0);
        }
        let logical_cd = catalog
            .get_metadata_for_column_by_name(td.table_id, "s")
            .expect("logical column");
        assert_eq!(logical_cd.column_type.comp_param, dict.dict_id);
    }

    #[test]
    fn dictionary_round_trips_codes() {
        let (_dir, catalog) = test_catalog();
        let dict = catalog.create_dictionary();
        let alpha = dict.dict.get_or_add("alpha");
        assert_eq!(dict.dict.get_or_add("alpha"), alpha);
        let beta = dict.dict.get_or_add("beta");
        assert_ne!(alpha, beta);
        assert_eq!(dict.dict.get_string(alpha as i64).expect("resolve"), "alpha");
        let err = dict.dict.get_string(99).expect_err("out of range");
        assert!(err.contains("out of dictionary range"), "err={err}");
    }
}
