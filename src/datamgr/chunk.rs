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
//! One column of one fragment: a pinned view over the buffer manager's
//! data buffer and, for offset-indexed columns, the index buffer.

use std::sync::Arc;

use crate::catalog::ColumnDescriptor;
use crate::common::ids::ChunkKey;
use crate::datamgr::buffer::{BufferRef, ChunkMetadata, stats_kind_for};
use crate::datamgr::{DataMgr, MemoryLevel};

#[derive(Clone)]
pub struct Chunk {
    column: Arc<ColumnDescriptor>,
    key: ChunkKey,
    data: Option<BufferRef>,
    index: Option<BufferRef>,
}

impl Chunk {
    /// Materialize and pin the chunk's buffers. Mutation always happens
    /// on the CPU copy, whatever level the statement ran at.
    pub fn get_chunk(
        cd: &Arc<ColumnDescriptor>,
        data_mgr: &DataMgr,
        key: ChunkKey,
        _memory_level: MemoryLevel,
        meta: &ChunkMetadata,
    ) -> Result<Chunk, String> {
        let varlen = cd.column_type.is_varlen_indeed();
        let (data, index) =
            data_mgr.get_or_materialize(key, meta, stats_kind_for(&cd.column_type), varlen)?;
        if varlen && index.is_none() {
            return Err(format!(
                "varlen chunk is missing its index buffer: key={}, column={}",
                key, cd.column_name
            ));
        }
        Ok(Chunk {
            column: Arc::clone(cd),
            key,
            data: Some(data),
            index,
        })
    }

    pub fn column(&self) -> &Arc<ColumnDescriptor> {
        &self.column
    }

    pub fn key(&self) -> ChunkKey {
        self.key
    }

    pub fn buffer(&self) -> Result<&BufferRef, String> {
        self.data.as_ref().ok_or_else(|| {
            format!(
                "chunk buffer was released: key={}, column={}",
                self.key, self.column.column_name
            )
        })
    }

    pub fn index_buffer(&self) -> Option<&BufferRef> {
        self.index.as_ref()
    }

    /// Drop the buffer references after the buffer manager freed them on
    /// a cancelled statement.
    pub(crate) fn clear_buffers(&mut self) {
        self.data = None;
        self.index = None;
    }

    pub fn has_buffers(&self) -> bool {
        self.data.is_some()
    }
}
