// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Table (archetype) storage.
//!
//! A table groups entities sharing an identical id set into columns. The id
//! list is sorted, de-duplicated and immutable once constructed; entities
//! move between tables rather than mutating one in place. A dense
//! `TableRecord` array parallel to the id list lets component records
//! answer "does table T have id I, and in which column" without scanning.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::component::TypeInfo;
use crate::component_index::{ComponentIndex, CrId};
use crate::entity_index::EntityIndex;
use crate::id::{Entity, Id, IS_A};
use crate::vec::AnyVec;

/// Index of a table in the table store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TableId(pub(crate) u32);

impl TableId {
    /// The empty table (no ids), always present at index 0.
    pub const EMPTY: TableId = TableId(0);
}

/// Sorted, de-duplicated id set defining a table.
pub type TableSignature = SmallVec<[Id; 8]>;

/// Per-id membership record at a fixed position in a table.
#[derive(Clone, Copy, Debug)]
pub struct TableRecord {
    /// Component record of the id at this position.
    pub cr: CrId,
    /// Position in the table's id list.
    pub index: usize,
    /// Column index when the id has storage, `None` for tags.
    pub column: Option<usize>,
}

/// Typed column storage backed by the erased growable buffer.
pub struct Column {
    data: AnyVec,
    ti: TypeInfo,
}

impl Column {
    fn new(ti: TypeInfo) -> Self {
        Self {
            data: AnyVec::new(ti.size, ti.align),
            ti,
        }
    }

    pub fn type_info(&self) -> &TypeInfo {
        &self.ti
    }

    pub fn ptr(&self, row: usize) -> *mut u8 {
        self.data.get(self.ti.size, row)
    }
}

/// Archetype: entities plus columnar component data.
pub struct Table {
    id: TableId,
    ids: TableSignature,
    records: Vec<TableRecord>,
    columns: Vec<Column>,
    entities: Vec<Entity>,
    /// Number of entities in this table that are targets of traversable
    /// relationship pairs.
    pub traversable_count: u32,
    /// Table owns at least one `(IsA, *)` pair.
    pub has_is_a: bool,
}

impl Table {
    pub fn id(&self) -> TableId {
        self.id
    }

    /// The table's id list, sorted and immutable.
    pub fn ids(&self) -> &[Id] {
        &self.ids
    }

    pub fn records(&self) -> &[TableRecord] {
        &self.records
    }

    pub fn record(&self, type_index: usize) -> &TableRecord {
        &self.records[type_index]
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn count(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn column(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    /// Column pointer for the id at `type_index`, if it has storage.
    pub fn column_ptr(&self, type_index: usize, row: usize) -> Option<*mut u8> {
        let column = self.records[type_index].column?;
        Some(self.columns[column].ptr(row))
    }

    /// Pairs with the `IsA` relationship, in type order.
    pub fn is_a_pairs(&self) -> impl Iterator<Item = (usize, Id)> + '_ {
        self.ids
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, id)| id.is_pair() && id.first() == IS_A.index())
    }

    /// Append an entity row; column slots are left uninitialized and must
    /// be written by the caller before the row is observed.
    fn push_uninit(&mut self, entity: Entity) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);
        for column in &mut self.columns {
            column.data.append(column.ti.size);
        }
        row
    }

    /// Remove a row whose column values were already moved out. Returns the
    /// entity swapped into `row`, if any.
    fn swap_remove_forget(&mut self, row: usize) -> Option<Entity> {
        self.entities.swap_remove(row);
        for column in &mut self.columns {
            column.data.remove(column.ti.size, row);
        }
        self.entities.get(row).copied()
    }

    /// Remove a row, dropping its column values.
    fn swap_remove_drop(&mut self, row: usize) -> Option<Entity> {
        for column in &mut self.columns {
            unsafe {
                column.ti.drop_one(column.data.get(column.ti.size, row));
            }
        }
        self.swap_remove_forget(row)
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        for column in &mut self.columns {
            let size = column.ti.size;
            for row in 0..column.data.count() {
                unsafe {
                    column.ti.drop_one(column.data.get(size, row));
                }
            }
        }
    }
}

/// Owns all tables and the signature index used to find them.
pub struct TableStore {
    tables: Vec<Table>,
    index: AHashMap<TableSignature, TableId>,
}

impl TableStore {
    pub fn new() -> Self {
        let mut store = Self {
            tables: Vec::with_capacity(64),
            index: AHashMap::with_capacity(64),
        };
        // Bootstrap the empty table at index 0, mirroring the empty
        // archetype convention.
        store.tables.push(Table {
            id: TableId::EMPTY,
            ids: TableSignature::new(),
            records: Vec::new(),
            columns: Vec::new(),
            entities: Vec::new(),
            traversable_count: 0,
            has_is_a: false,
        });
        store.index.insert(TableSignature::new(), TableId::EMPTY);
        store
    }

    pub fn get(&self, id: TableId) -> &Table {
        &self.tables[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: TableId) -> &mut Table {
        &mut self.tables[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Find or create the table for a signature, registering every id with
    /// the component index on creation.
    pub fn ensure(
        &mut self,
        signature: TableSignature,
        components: &mut ComponentIndex,
        entities: &mut EntityIndex,
    ) -> TableId {
        debug_assert!(signature.windows(2).all(|w| w[0] < w[1]), "unsorted signature");
        if let Some(&id) = self.index.get(&signature) {
            return id;
        }

        let table_id = TableId(u32::try_from(self.tables.len()).expect("table index overflow"));
        let mut records = Vec::with_capacity(signature.len());
        let mut columns = Vec::new();
        let mut has_is_a = false;

        for (type_index, &id) in signature.iter().enumerate() {
            let (cr, _) = components.get_or_create(id);

            let column = components.record(cr).type_info.map(|ti| {
                columns.push(Column::new(ti));
                columns.len() - 1
            });
            records.push(TableRecord {
                cr,
                index: type_index,
                column,
            });

            components.register_table(id, cr, table_id, type_index);

            if id.is_pair() {
                if id.first() == IS_A.index() {
                    has_is_a = true;
                }
                if components.record(cr).is_traversable() {
                    self.mark_traversable_target(id.second(), components, entities);
                }
            }
        }

        self.tables.push(Table {
            id: table_id,
            ids: signature.clone(),
            records,
            columns,
            entities: Vec::new(),
            traversable_count: 0,
            has_is_a,
        });
        self.index.insert(signature, table_id);
        table_id
    }

    /// Mark the target of a newly created traversable pair record: set the
    /// entity's back-reference to its `(*, target)` record and count it in
    /// its current table.
    fn mark_traversable_target(
        &mut self,
        target_index: u32,
        components: &mut ComponentIndex,
        entities: &mut EntityIndex,
    ) {
        let Some(target) = entities.current(target_index) else {
            return;
        };
        let tgt_cr = components.ensure_target_record(target_index);
        let record = entities
            .get_mut(target)
            .expect("alive entity without record");
        record.cr = Some(tgt_cr);
        if !record.is_traversable {
            record.is_traversable = true;
            self.tables[record.table.0 as usize].traversable_count += 1;
        }
    }

    /// Place a newly spawned entity in a table.
    pub fn place_entity(&mut self, entities: &mut EntityIndex, entity: Entity, dst: TableId) {
        let table = &mut self.tables[dst.0 as usize];
        let row = table.push_uninit(entity);
        for column in &mut table.columns {
            unsafe {
                column.ti.write_default(column.data.last(column.ti.size));
            }
        }
        let record = entities.get_mut(entity).expect("placing dead entity");
        record.table = dst;
        record.row = u32::try_from(row).expect("row overflow");
        if record.is_traversable {
            table.traversable_count += 1;
        }
    }

    /// Move an entity's row between tables. Columns present in both keep
    /// their bytes; new columns are default-initialized; dropped columns
    /// have their values dropped. Returns the destination row.
    pub fn move_entity(
        &mut self,
        entities: &mut EntityIndex,
        components: &ComponentIndex,
        entity: Entity,
        dst_id: TableId,
    ) -> usize {
        let record = *entities.get(entity).expect("moving dead entity");
        let src_id = record.table;
        let src_row = record.row as usize;
        debug_assert_ne!(src_id, dst_id);

        let (src, dst) = self.pair_mut(src_id, dst_id);
        let dst_row = dst.push_uninit(entity);

        // Fill destination columns: move shared bytes, default the rest.
        for dst_rec in &dst.records {
            let Some(dst_col) = dst_rec.column else {
                continue;
            };
            let id = dst.ids[dst_rec.index];
            let dst_ptr = dst.columns[dst_col].ptr(dst_row);
            let src_col = components
                .table_record(components.get(id).expect("id without record"), src_id)
                .and_then(|idx| src.records[idx].column);
            match src_col {
                Some(src_col) => unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.columns[src_col].ptr(src_row),
                        dst_ptr,
                        dst.columns[dst_col].ti.size,
                    );
                },
                None => unsafe {
                    dst.columns[dst_col].ti.write_default(dst_ptr);
                },
            }
        }

        // Drop values for columns that do not survive the move.
        for src_rec in &src.records {
            let Some(src_col) = src_rec.column else {
                continue;
            };
            let id = src.ids[src_rec.index];
            let survives = components
                .get(id)
                .and_then(|cr| components.table_record(cr, dst_id))
                .is_some();
            if !survives {
                unsafe {
                    src.columns[src_col]
                        .ti
                        .drop_one(src.columns[src_col].ptr(src_row));
                }
            }
        }

        if record.is_traversable {
            src.traversable_count -= 1;
            dst.traversable_count += 1;
        }

        let swapped = src.swap_remove_forget(src_row);

        let rec = entities.get_mut(entity).expect("moving dead entity");
        rec.table = dst_id;
        rec.row = u32::try_from(dst_row).expect("row overflow");
        if let Some(swapped) = swapped {
            let swapped_rec = entities.get_mut(swapped).expect("swapped dead entity");
            swapped_rec.row = u32::try_from(src_row).expect("row overflow");
        }
        dst_row
    }

    /// Remove an entity's row, dropping its values.
    pub fn remove_entity(&mut self, entities: &mut EntityIndex, entity: Entity) {
        let record = *entities.get(entity).expect("removing dead entity");
        let table = &mut self.tables[record.table.0 as usize];
        if record.is_traversable {
            table.traversable_count -= 1;
        }
        if let Some(swapped) = table.swap_remove_drop(record.row as usize) {
            let swapped_rec = entities.get_mut(swapped).expect("swapped dead entity");
            swapped_rec.row = record.row;
        }
    }

    fn pair_mut(&mut self, a: TableId, b: TableId) -> (&mut Table, &mut Table) {
        let (a, b) = (a.0 as usize, b.0 as usize);
        debug_assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.tables.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.tables.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a signature from unsorted ids.
pub fn signature_from(ids: &[Id]) -> TableSignature {
    let mut sig: TableSignature = ids.iter().copied().collect();
    sig.sort_unstable();
    sig.dedup();
    sig
}
