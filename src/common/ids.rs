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
use std::fmt;

/// Chunk addressing key: one column of one fragment of one table.
///
/// The buffer manager keys every materialized buffer by this tuple; the
/// transaction roll uses it to fan out GPU evictions after commit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ChunkKey {
    pub db_id: i32,
    pub table_id: i32,
    pub column_id: i32,
    pub fragment_id: i32,
}

impl ChunkKey {
    pub const fn new(db_id: i32, table_id: i32, column_id: i32, fragment_id: i32) -> Self {
        Self {
            db_id,
            table_id,
            column_id,
            fragment_id,
        }
    }

    /// Whether `self` falls under `prefix`: equal db/table ids, and equal
    /// column/fragment ids where the prefix specifies them.
    pub fn matches_prefix(&self, prefix: &ChunkKeyPrefix) -> bool {
        if self.db_id != prefix.db_id || self.table_id != prefix.table_id {
            return false;
        }
        if let Some(column_id) = prefix.column_id {
            if self.column_id != column_id {
                return false;
            }
        }
        if let Some(fragment_id) = prefix.fragment_id {
            if self.fragment_id != fragment_id {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.db_id, self.table_id, self.column_id, self.fragment_id
        )
    }
}

/// Partial chunk key used for prefix eviction on the buffer manager.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChunkKeyPrefix {
    pub db_id: i32,
    pub table_id: i32,
    pub column_id: Option<i32>,
    pub fragment_id: Option<i32>,
}

impl From<ChunkKey> for ChunkKeyPrefix {
    fn from(key: ChunkKey) -> Self {
        Self {
            db_id: key.db_id,
            table_id: key.table_id,
            column_id: Some(key.column_id),
            fragment_id: Some(key.fragment_id),
        }
    }
}

impl ChunkKeyPrefix {
    pub const fn whole_table(db_id: i32, table_id: i32) -> Self {
        Self {
            db_id,
            table_id,
            column_id: None,
            fragment_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_key_prefix_matches_exact_and_table_wide() {
        let key = ChunkKey::new(1, 7, 3, 0);
        assert!(key.matches_prefix(&key.into()));
        assert!(key.matches_prefix(&ChunkKeyPrefix::whole_table(1, 7)));
        assert!(!key.matches_prefix(&ChunkKeyPrefix::whole_table(1, 8)));
        let other = ChunkKey::new(1, 7, 4, 0);
        assert!(!other.matches_prefix(&key.into()));
    }
}
