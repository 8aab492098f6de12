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

//! Component record index.
//!
//! One record exists per distinct id ever owned by a table, plus the
//! wildcard index records `(R, *)` and `(*, T)` for every pair. Records
//! live in a dense arena addressed by `CrId`; relationships between records
//! are id-keyed lookups, never owning pointers. The `(*, T)` record heads a
//! chain of the traversable pair records targeting `T`, which is what event
//! propagation and cache invalidation walk. Traversable pair records carry
//! the reachability cache with its lazy generation-counter invalidation.

use rustc_hash::FxHashMap;

use crate::component::{ComponentFlags, TypeInfo};
use crate::id::{Entity, Id, WILDCARD};
use crate::table::TableId;

/// Index of a component record in the arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CrId(pub(crate) u32);

/// One element of a reachability cache: an id transitively reachable by
/// walking a traversable relationship upward, plus where it lives.
#[derive(Clone, Copy, Debug)]
pub struct ReachableElem {
    /// The reachable id.
    pub id: Id,
    /// Component record of `id`.
    pub cr: CrId,
    /// Entity that actually owns `id` (the ancestor).
    pub src: Entity,
    /// Table owning `src` at cache-build time.
    pub table: TableId,
    /// Position of `id` in that table's id list.
    pub type_index: u32,
}

/// Memoized result of an upward traversal walk.
///
/// `current == generation` means the element list is valid; writers bump
/// `generation` and never rebuild eagerly. Counters are 64-bit so
/// wraparound cannot alias two distinct generations in practice.
#[derive(Default)]
pub struct ReachableCache {
    pub generation: u64,
    pub current: u64,
    pub ids: Vec<ReachableElem>,
}

impl ReachableCache {
    fn new() -> Self {
        // Fresh caches start invalid: nothing was ever built.
        Self {
            generation: 1,
            current: 0,
            ids: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.current == self.generation
    }

    pub fn invalidate(&mut self) {
        self.generation += 1;
    }
}

/// Pair sub-record: present on traversable pair records and on `(*, T)`
/// chain heads.
pub struct PairRecord {
    pub reachable: ReachableCache,
    /// Next traversable pair record with the same target, forming the
    /// chain headed at the `(*, T)` record.
    pub trav_next: Option<CrId>,
}

impl PairRecord {
    fn new() -> Self {
        Self {
            reachable: ReachableCache::new(),
            trav_next: None,
        }
    }
}

/// Per-id index node: which tables contain the id, flags, type info, and
/// the pair sub-record for traversable pairs.
pub struct ComponentRecord {
    pub id: Id,
    pub flags: ComponentFlags,
    pub type_info: Option<TypeInfo>,
    pub pair: Option<Box<PairRecord>>,
    /// Tables containing this id, mapped to the id's position in the
    /// table's id list. For wildcard records, the first matching position.
    tables: FxHashMap<TableId, usize>,
}

impl ComponentRecord {
    pub fn is_traversable(&self) -> bool {
        self.flags.contains(ComponentFlags::TRAVERSABLE)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Tables containing this id, in unspecified order.
    pub fn table_ids(&self) -> impl Iterator<Item = TableId> + '_ {
        self.tables.keys().copied()
    }
}

/// Arena of component records plus the id→record map.
pub struct ComponentIndex {
    records: Vec<ComponentRecord>,
    by_id: FxHashMap<Id, CrId>,
}

impl ComponentIndex {
    pub fn new() -> Self {
        Self {
            records: Vec::with_capacity(64),
            by_id: FxHashMap::default(),
        }
    }

    /// Record for an id, if one was ever created. An id with no owning
    /// table and no pair role has no record; callers must handle `None`.
    pub fn get(&self, id: Id) -> Option<CrId> {
        self.by_id.get(&id).copied()
    }

    pub fn record(&self, cr: CrId) -> &ComponentRecord {
        &self.records[cr.0 as usize]
    }

    pub fn record_mut(&mut self, cr: CrId) -> &mut ComponentRecord {
        &mut self.records[cr.0 as usize]
    }

    /// Record creation is idempotent: the same id always resolves to the
    /// same record. Returns whether this call created it.
    ///
    /// A pair whose relationship carries the traversable trait gets its
    /// pair sub-record (with reachability cache) allocated here and is
    /// linked into the `(*, target)` chain.
    pub fn get_or_create(&mut self, id: Id) -> (CrId, bool) {
        if let Some(cr) = self.get(id) {
            return (cr, false);
        }

        let mut flags = ComponentFlags::empty();
        let mut type_info = None;
        let mut pair = None;

        if id.is_pair() {
            let rel_is_wildcard = id.first() == WILDCARD.index();
            let tgt_is_wildcard = id.second() == WILDCARD.index();

            if !rel_is_wildcard {
                // Pairs take their flags and storage from the relationship.
                let (rel_cr, _) = self.get_or_create(Id(u64::from(id.first())));
                let rel = self.record(rel_cr);
                flags = rel.flags;
                if !flags.contains(ComponentFlags::PAIR_IS_TAG) {
                    type_info = rel.type_info;
                }
            }

            if flags.contains(ComponentFlags::TRAVERSABLE) && !rel_is_wildcard && !tgt_is_wildcard
            {
                pair = Some(Box::new(PairRecord::new()));
            }
        }

        let cr = CrId(u32::try_from(self.records.len()).expect("component index overflow"));
        self.records.push(ComponentRecord {
            id,
            flags,
            type_info,
            pair,
            tables: FxHashMap::default(),
        });
        self.by_id.insert(id, cr);

        // Link traversable pairs into the target's chain.
        if self.records[cr.0 as usize].pair.is_some() {
            let head = self.ensure_target_record(id.second());
            let head_next = self.record(head).pair.as_ref().and_then(|p| p.trav_next);
            if let Some(p) = self.record_mut(cr).pair.as_mut() {
                p.trav_next = head_next;
            }
            self.record_mut(head)
                .pair
                .as_mut()
                .expect("chain head without pair record")
                .trav_next = Some(cr);
        }

        (cr, true)
    }

    /// The `(*, target)` record heading the traversable-pair chain for a
    /// target entity. Created on demand.
    pub fn ensure_target_record(&mut self, target_index: u32) -> CrId {
        let id = Id::pair(WILDCARD, Entity(u64::from(target_index)));
        let (cr, _) = self.get_or_create(id);
        let record = self.record_mut(cr);
        if record.pair.is_none() {
            record.pair = Some(Box::new(PairRecord::new()));
        }
        cr
    }

    /// Next record in the traversable-pair chain. Starting from a
    /// `(*, T)` record this visits every traversable pair targeting `T`
    /// once, in unspecified order.
    pub fn trav_next(&self, cr: CrId) -> Option<CrId> {
        self.record(cr).pair.as_ref().and_then(|p| p.trav_next)
    }

    /// Register a table owning `id` at `type_index`. Also indexes the
    /// wildcard refinements for pairs.
    pub fn register_table(&mut self, id: Id, cr: CrId, table: TableId, type_index: usize) {
        self.record_mut(cr).tables.insert(table, type_index);

        if id.is_pair() && !id.is_wildcard() {
            let (rel_wc, _) = self.get_or_create(id.with_wildcard_target());
            self.record_mut(rel_wc)
                .tables
                .entry(table)
                .or_insert(type_index);

            let tgt_wc = self.ensure_target_record(id.second());
            self.record_mut(tgt_wc)
                .tables
                .entry(table)
                .or_insert(type_index);
        }
    }

    /// O(1) membership query: position of the record's id in `table`, or
    /// `None` when the table does not contain it.
    pub fn table_record(&self, cr: CrId, table: TableId) -> Option<usize> {
        self.record(cr).tables.get(&table).copied()
    }

    /// Convenience probe by id.
    pub fn table_has(&self, id: Id, table: TableId) -> bool {
        self.get(id)
            .is_some_and(|cr| self.table_record(cr, table).is_some())
    }
}

impl Default for ComponentIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentFlags;

    #[test]
    fn test_get_or_create_idempotent() {
        let mut index = ComponentIndex::new();
        let (a, created_a) = index.get_or_create(Id(100));
        let (b, created_b) = index.get_or_create(Id(100));
        assert_eq!(a, b);
        assert!(created_a);
        assert!(!created_b);
    }

    #[test]
    fn test_missing_id_has_no_record() {
        let index = ComponentIndex::new();
        assert!(index.get(Id(12345)).is_none());
    }

    #[test]
    fn test_traversable_pair_gets_cache_and_chain() {
        let mut index = ComponentIndex::new();
        let rel = Entity::from_parts(100, 0);
        let tgt = Entity::from_parts(200, 0);

        let (rel_cr, _) = index.get_or_create(Id::component(rel));
        index
            .record_mut(rel_cr)
            .flags
            .insert(ComponentFlags::TRAVERSABLE);

        let (pair_cr, _) = index.get_or_create(Id::pair(rel, tgt));
        let pair = index.record(pair_cr);
        assert!(pair.is_traversable());
        assert!(pair.pair.is_some());
        assert!(!pair.pair.as_ref().unwrap().reachable.is_valid());

        // Chain from the (*, tgt) head reaches the pair record.
        let head = index.ensure_target_record(tgt.index());
        assert_eq!(index.trav_next(head), Some(pair_cr));
        assert_eq!(index.trav_next(pair_cr), None);
    }

    #[test]
    fn test_chain_visits_each_pair_once() {
        let mut index = ComponentIndex::new();
        let rel_a = Entity::from_parts(100, 0);
        let rel_b = Entity::from_parts(101, 0);
        let tgt = Entity::from_parts(200, 0);

        for rel in [rel_a, rel_b] {
            let (cr, _) = index.get_or_create(Id::component(rel));
            index.record_mut(cr).flags.insert(ComponentFlags::TRAVERSABLE);
        }
        let (pa, _) = index.get_or_create(Id::pair(rel_a, tgt));
        let (pb, _) = index.get_or_create(Id::pair(rel_b, tgt));

        let head = index.ensure_target_record(tgt.index());
        let mut seen = Vec::new();
        let mut cur = head;
        while let Some(next) = index.trav_next(cur) {
            seen.push(next);
            cur = next;
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&pa));
        assert!(seen.contains(&pb));
    }

    #[test]
    fn test_generation_invalidation() {
        let mut cache = ReachableCache::new();
        assert!(!cache.is_valid());
        cache.current = cache.generation;
        assert!(cache.is_valid());
        cache.invalidate();
        assert!(!cache.is_valid());
    }
}
