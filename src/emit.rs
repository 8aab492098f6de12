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

//! Event emission pipeline.
//!
//! Finds and invokes the observer sets matching an emitted event, forwards
//! events for ids that become reachable through traversable relationships,
//! and propagates events downward to entities that inherit through the
//! mutated entity. Forwarding is backed by the per-pair reachability cache;
//! a valid cache (`current == generation`) is iterated directly, a stale
//! one is rebuilt by a depth-first walk over the target's table with a
//! visited-table stack for shadowing and a hard depth bound as cycle guard.
//!
//! The pipeline runs single-threaded with exclusive access to the indexes
//! it touches; failures here are invariant breaks, not recoverable errors.

use smallvec::SmallVec;
use std::any::Any;
use tracing::trace;

use crate::component::{ComponentFlags, OnInstantiate, TypeInfo};
use crate::component_index::{ComponentIndex, CrId, ReachableElem};
use crate::entity_index::EntityIndex;
use crate::id::{Entity, Id, ANY, IS_A, ON_ADD, ON_REMOVE, ON_SET, WILDCARD};
use crate::observable::{EventIdRecord, EventRecord, Observable, ObserverBucket};
use crate::table::{TableId, TableStore};

/// Hard bound on traversal recursion. Exceeding it means the traversable
/// relationship graph has a cycle, which the mutation layer must reject
/// before events reach this pipeline.
pub const MAX_TRAVERSAL_DEPTH: usize = 128;

/// Flags modifying how an event descriptor is processed.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct EventFlags(u8);

impl EventFlags {
    /// Internal bookkeeping event: no entity-level data, no entity range.
    pub const TABLE_ONLY: EventFlags = EventFlags(1 << 0);
    /// Suppress synthetic OnSet generation for this emit.
    pub const NO_ON_SET: EventFlags = EventFlags(1 << 1);

    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EventFlags {
    type Output = EventFlags;
    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

/// Descriptor handed to `World::emit`/`World::enqueue`.
pub struct EventDesc {
    pub event: Entity,
    pub ids: SmallVec<[Id; 4]>,
    /// Convenience: resolve table/offset/count from a single entity.
    pub entity: Option<Entity>,
    pub table: Option<TableId>,
    pub offset: usize,
    pub count: usize,
    pub other_table: Option<TableId>,
    pub flags: EventFlags,
    pub param: Option<Box<dyn Any>>,
}

impl EventDesc {
    pub fn new(event: Entity) -> Self {
        Self {
            event,
            ids: SmallVec::new(),
            entity: None,
            table: None,
            offset: 0,
            count: 0,
            other_table: None,
            flags: EventFlags::default(),
            param: None,
        }
    }
}

/// Component value exposed to an observer, type-erased.
#[derive(Clone, Copy)]
pub(crate) struct ValueRef {
    ptr: *const u8,
    ti: TypeInfo,
}

/// Iterator state handed to observer callbacks.
///
/// `source` is `None` when the matched entity owns the id itself; when the
/// event was forwarded or propagated it names the ancestor that actually
/// owns it, and `up` is set so observers can tell inherited from owned.
pub struct EventView<'a> {
    pub event: Entity,
    pub event_id: Id,
    /// Event transaction id shared by every id-event of one emit call.
    pub event_cur: u64,
    pub entities: &'a [Entity],
    pub source: Option<Entity>,
    pub up: bool,
    pub table: TableId,
    pub other_table: Option<TableId>,
    pub offset: usize,
    pub count: usize,
    /// Relationship walked to reach this entity, for forwarded/propagated
    /// invocations.
    pub traversed: Option<Entity>,
    pub(crate) value: Option<ValueRef>,
    pub param: Option<&'a dyn Any>,
}

impl EventView<'_> {
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// Read the component value this event carries.
    ///
    /// Debug builds validate the requested type against the column's type
    /// info; a mismatched type in release builds is undefined behavior,
    /// matching the column storage contract.
    pub fn value<T: 'static>(&self) -> Option<&T> {
        let value = self.value.as_ref()?;
        debug_assert_eq!(value.ti.type_name, std::any::type_name::<T>());
        debug_assert_eq!(value.ti.size, std::mem::size_of::<T>());
        Some(unsafe { &*(value.ptr as *const T) })
    }
}

/// Mutable dispatch state threaded through the pipeline phases.
struct It<'w> {
    event: Entity,
    event_id: Id,
    table: TableId,
    other_table: Option<TableId>,
    offset: usize,
    count: usize,
    entities: &'w [Entity],
    source: Option<Entity>,
    up: bool,
    value: Option<ValueRef>,
}

/// Per-emit context over disjoint world borrows. Tables, entity records
/// and the observable are read-only for the duration of an emit; only the
/// component index (reachability caches) is written.
pub(crate) struct EmitCtx<'w> {
    pub entities: &'w EntityIndex,
    pub tables: &'w TableStore,
    pub components: &'w mut ComponentIndex,
    pub observable: &'w Observable,
    pub evtx: u64,
    pub param: Option<&'w dyn Any>,
}

type Iders<'w> = SmallVec<[&'w EventIdRecord; 5]>;

impl<'w> EmitCtx<'w> {
    pub fn run(
        &mut self,
        event: Entity,
        ids: &[Id],
        table_id: TableId,
        offset: usize,
        count: usize,
        other_table: Option<TableId>,
        flags: EventFlags,
    ) {
        assert!(!event.is_null(), "emit requires an event");
        assert_ne!(event, WILDCARD, "cannot emit the wildcard event");
        assert!(!ids.is_empty(), "emit requires at least one id");

        let table = self.tables.get(table_id);
        let table_event = flags.contains(EventFlags::TABLE_ONLY);
        assert!(offset <= table.count(), "emit range outside table");
        let mut count = count;
        if count == 0 && !table_event {
            count = table.count() - offset;
        }
        assert!(offset + count <= table.count(), "emit range outside table");

        let er = self.observable.event_record_if(event);
        let wcer = self.observable.event_record_if(WILDCARD);
        let er_onset = self.observable.event_record_if(ON_SET);

        let entities: &'w [Entity] = if count > 0 {
            &self.tables.get(table_id).entities()[offset..offset + count]
        } else {
            &[]
        };

        let mut it = It {
            event,
            event_id: Id(0),
            table: table_id,
            other_table,
            offset,
            count,
            entities,
            source: None,
            up: false,
            value: None,
        };

        let do_on_set = !flags.contains(EventFlags::NO_ON_SET);

        // Adding an override together with an inheritance edge changes the
        // observed value, not just ownership; removing an override
        // re-exposes the base value. Both need a synthetic OnSet.
        let can_override_on_add =
            count > 0 && do_on_set && event == ON_ADD && table.has_is_a;
        let can_override_on_remove = count > 0
            && do_on_set
            && event == ON_REMOVE
            && other_table.is_some_and(|t| self.tables.get(t).has_is_a);

        // OnSet never forwards; it is the forwarding mechanism's output.
        let mut can_forward = event != ON_SET;
        let has_observed = table.traversable_count > 0;

        // Phase 1: caches of everything pointing at the mutated entities go
        // stale before any observer can read reachable state.
        if count > 0 && can_forward && has_observed {
            self.propagate_invalidate(table_id, offset, count);
        }

        let mut er_cur = er;
        loop {
            for &id in ids {
                // Pure wildcard ids are resolved by the table graph layer.
                if id != Id::component(ANY) && id.is_wildcard() {
                    continue;
                }

                let (cr, _) = self.components.get_or_create(id);
                let cr_flags = self.components.record(cr).flags;

                if can_forward
                    && id.is_pair()
                    && cr_flags.contains(ComponentFlags::TRAVERSABLE)
                {
                    // Adding an inheritance edge emits OnSet for every
                    // newly reachable component value.
                    let er_fwd = if id.first() == IS_A.index() && event == ON_ADD {
                        er_onset
                    } else {
                        None
                    };
                    self.forward(er_cur, er_fwd, ids, &mut it, table_id, cr);
                }

                let iders: Iders<'w> = er_cur
                    .map(|er| er.observers_matching(id))
                    .unwrap_or_default();

                if iders.is_empty() && !(can_override_on_add || can_override_on_remove) {
                    // Fast path: the overwhelming majority of mutations
                    // have no observers.
                    continue;
                }

                let tr = self.components.table_record(cr, table_id);
                let type_index = if !cr_flags.contains(ComponentFlags::DONT_FRAGMENT)
                    && id != Id::component(ANY)
                {
                    match tr {
                        // A batch with multiple adds for an exclusive
                        // relationship can leave ids in the added list
                        // that the entity no longer has.
                        None => continue,
                        Some(i) => Some(i),
                    }
                } else {
                    // Sparse-style components have no per-table column; a
                    // dummy record stands in instead of skipping.
                    None
                };

                it.event_id = id;
                it.source = None;
                it.up = false;
                it.value = type_index.and_then(|i| self.column_value(table_id, i, offset));

                for ider in &iders {
                    self.invoke(&ider.self_, &it, None);
                    self.invoke(&ider.self_up, &it, None);
                }

                if iders.is_empty() || count == 0 || !has_observed {
                    continue;
                }

                // Entities in the range may themselves be inheritance
                // targets; notify everything that inherits through them.
                self.propagate_entities(&mut it, cr, entities, None, &iders);
            }

            can_forward = false; // Don't forward twice

            // Phase 3: observers of the Wildcard event receive every kind.
            match wcer {
                Some(w) if !er_cur.is_some_and(|e| std::ptr::eq(e, w)) => {
                    er_cur = Some(w);
                }
                _ => break,
            }
        }

        // Phase 4: override reconciliation.
        if count > 0 && (can_override_on_add || can_override_on_remove) {
            for &id in ids {
                if id != Id::component(ANY) && id.is_wildcard() {
                    continue;
                }
                let Some(cr) = self.components.get(id) else {
                    continue;
                };
                let record = self.components.record(cr);
                // Only components with values can meaningfully change on
                // override; DontInherit components never interact with a
                // base value.
                if record.type_info.is_none()
                    || record.flags.on_instantiate() == OnInstantiate::DontInherit
                {
                    continue;
                }
                if can_override_on_add {
                    self.on_set_for_override_on_add(er_onset, &mut it, id, cr, table_id);
                } else {
                    self.on_set_for_override_on_remove(er_onset, &mut it, id, cr, table_id);
                }
            }
        }
    }

    fn invoke(&self, bucket: &ObserverBucket, it: &It<'w>, traversed: Option<Entity>) {
        if bucket.observers.is_empty() {
            return;
        }
        let view = EventView {
            event: it.event,
            event_id: it.event_id,
            event_cur: self.evtx,
            entities: it.entities,
            source: it.source,
            up: it.up,
            table: it.table,
            other_table: it.other_table,
            offset: it.offset,
            count: it.count,
            traversed,
            value: it.value,
            param: self.param,
        };
        for cell in &bucket.observers {
            (cell.callback.borrow_mut())(&view);
        }
    }

    fn column_value(&self, table: TableId, type_index: usize, row: usize) -> Option<ValueRef> {
        let table = self.tables.get(table);
        let record = table.record(type_index);
        let column = record.column?;
        if row >= table.count() {
            return None;
        }
        Some(ValueRef {
            ptr: table.column(column).ptr(row),
            ti: *table.column(column).type_info(),
        })
    }

    // ---- forwarding (upward traversal) ----

    /// Re-emit the event for every id reachable through a traversable
    /// relationship pair, as if the entity owned those ids, sourced from
    /// the ancestors that actually own them.
    fn forward(
        &mut self,
        er: Option<&'w EventRecord>,
        er_onset: Option<&'w EventRecord>,
        emit_ids: &[Id],
        it: &mut It<'w>,
        table_id: TableId,
        cr: CrId,
    ) {
        let pair_id = self.components.record(cr).id;
        let valid = self
            .components
            .record(cr)
            .pair
            .as_ref()
            .expect("traversable pair without cache")
            .reachable
            .is_valid();

        if !valid {
            // Cache miss: walk the tree to find ids to forward.
            trace!(id = ?pair_id, "reachable cache miss");
            let mut stack: Vec<TableId> = Vec::new();
            let mut reachable: Vec<ReachableElem> = Vec::new();
            self.forward_up(
                er, er_onset, emit_ids, it, table_id, cr, &mut stack, &mut reachable, 0, cr,
            );
            it.source = None;

            let event = it.event;
            let rc = &mut self
                .components
                .record_mut(cr)
                .pair
                .as_mut()
                .expect("traversable pair without cache")
                .reachable;
            rc.ids = reachable;
            if event == ON_ADD || event == ON_REMOVE {
                // Only OnAdd/OnRemove may validate the cache: during OnSet
                // the mutated entity's administration may not be
                // consistent yet.
                rc.current = rc.generation;
            }
        } else {
            trace!(id = ?pair_id, "reachable cache hit");
            let trav = self.entities.current(pair_id.first());
            let elems: Vec<ReachableElem> = self
                .components
                .record(cr)
                .pair
                .as_ref()
                .expect("traversable pair without cache")
                .reachable
                .ids
                .clone();
            for elem in &elems {
                let src_record = self
                    .entities
                    .get(elem.src)
                    .expect("cached source entity despawned");
                debug_assert_eq!(src_record.table, elem.table, "reachable cache out of sync");
                self.forward_id(
                    er,
                    er_onset,
                    emit_ids,
                    it,
                    table_id,
                    elem.cr,
                    elem.src,
                    src_record.table,
                    elem.type_index as usize,
                    trav,
                );
            }
        }

        // Propagate events for the new reachable ids downwards: entities in
        // the range may themselves be inherited from.
        if self.tables.get(table_id).traversable_count > 0 {
            let any_target = it
                .entities
                .iter()
                .any(|e| self.entities.get(*e).is_some_and(|r| r.cr.is_some()));
            if any_target {
                let elems: Vec<ReachableElem> = self
                    .components
                    .record(cr)
                    .pair
                    .as_ref()
                    .expect("traversable pair without cache")
                    .reachable
                    .ids
                    .clone();
                for elem in &elems {
                    // Entities that already own the id are shadowed.
                    if self.components.table_record(elem.cr, it.table).is_some() {
                        continue;
                    }
                    let elem_id = self.components.record(elem.cr).id;
                    let iders: Iders<'w> = er
                        .map(|er| er.observers_matching(elem_id))
                        .unwrap_or_default();
                    let entities = it.entities;
                    self.propagate_entities(it, elem.cr, entities, Some(elem.src), &iders);
                }
            }
        }
    }

    /// One upward step: resolve the pair's target and walk its table.
    #[allow(clippy::too_many_arguments)]
    fn forward_up(
        &mut self,
        er: Option<&'w EventRecord>,
        er_onset: Option<&'w EventRecord>,
        emit_ids: &[Id],
        it: &mut It<'w>,
        table_id: TableId,
        cr: CrId,
        stack: &mut Vec<TableId>,
        reachable: &mut Vec<ReachableElem>,
        depth: usize,
        top_cr: CrId,
    ) {
        let id = self.components.record(cr).id;
        if depth >= MAX_TRAVERSAL_DEPTH {
            panic!("cycle detected while forwarding {id:?}: traversal depth limit reached");
        }

        let Some(tgt) = self.entities.current(id.second()) else {
            return;
        };
        let Some(tgt_record) = self.entities.get(tgt) else {
            return;
        };
        let tgt_table = tgt_record.table;
        self.forward_table_up(
            er, er_onset, emit_ids, it, table_id, tgt, tgt_table, cr, stack, reachable,
            depth + 1, top_cr,
        );
    }

    /// Walk a target table's id list: recurse through ids sharing the
    /// traversed relationship, record and forward every other id not
    /// masked by a closer ancestor on the visiting stack.
    #[allow(clippy::too_many_arguments)]
    fn forward_table_up(
        &mut self,
        er: Option<&'w EventRecord>,
        er_onset: Option<&'w EventRecord>,
        emit_ids: &[Id],
        it: &mut It<'w>,
        table_id: TableId,
        tgt: Entity,
        tgt_table: TableId,
        tgt_cr: CrId,
        stack: &mut Vec<TableId>,
        reachable: &mut Vec<ReachableElem>,
        depth: usize,
        top_cr: CrId,
    ) {
        let rc_child_offset = reachable.len();
        let stack_count = stack.len();

        // A stale cache encountered mid-walk (not the one being rebuilt)
        // can be refreshed from the intermediate results: two records
        // updated for the cost of one walk.
        let parent_revalidate = tgt_cr != top_cr
            && !self
                .components
                .record(tgt_cr)
                .pair
                .as_ref()
                .expect("traversable pair without cache")
                .reachable
                .is_valid();
        if parent_revalidate {
            self.components
                .record_mut(tgt_cr)
                .pair
                .as_mut()
                .expect("traversable pair without cache")
                .reachable
                .ids
                .clear();
        }

        let tgt_pair_id = self.components.record(tgt_cr).id;
        trace!(id = ?tgt_pair_id, "forward events");
        let trav_index = tgt_pair_id.first();
        let inherit = trav_index == IS_A.index();

        let tgt_tbl = self.tables.get(tgt_table);
        let ids: &'w [Id] = tgt_tbl.ids();

        for (i, &id) in ids.iter().enumerate() {
            let tr_cr = tgt_tbl.record(i).cr;
            let flags = self.components.record(tr_cr).flags;

            if inherit && flags.on_instantiate() != OnInstantiate::Inherit {
                continue;
            }

            if tr_cr == tgt_cr {
                panic!("cycle detected: {id:?} reachable from itself");
            }

            // Ids sharing the traversed relationship lead one level deeper.
            if id.is_pair() && (id.first() == trav_index || id.first() == IS_A.index()) {
                stack.push(tgt_table);
                let child_valid = self
                    .components
                    .record(tr_cr)
                    .pair
                    .as_ref()
                    .is_some_and(|p| p.reachable.is_valid());
                if child_valid {
                    // Cache hit: reuse instead of traversing the same
                    // hierarchy again. This is what makes deep hierarchies
                    // cheap to build.
                    trace!(?id, "forward cached");
                    let trav = self.entities.current(trav_index);
                    let elems: Vec<ReachableElem> = self
                        .components
                        .record(tr_cr)
                        .pair
                        .as_ref()
                        .expect("traversable pair without cache")
                        .reachable
                        .ids
                        .clone();
                    for elem in &elems {
                        if self.stack_has(stack, elem.cr) {
                            continue;
                        }
                        let src_record = self
                            .entities
                            .get(elem.src)
                            .expect("cached source entity despawned");
                        debug_assert_eq!(
                            src_record.table, elem.table,
                            "reachable cache out of sync"
                        );
                        reachable.push(*elem);
                        self.forward_id(
                            er,
                            er_onset,
                            emit_ids,
                            it,
                            table_id,
                            elem.cr,
                            elem.src,
                            src_record.table,
                            elem.type_index as usize,
                            trav,
                        );
                    }
                } else {
                    self.forward_up(
                        er, er_onset, emit_ids, it, table_id, tr_cr, stack, reachable, depth,
                        top_cr,
                    );
                }
                stack.pop();
                continue;
            }

            let stack_at = self.stack_at(stack, tr_cr);
            if parent_revalidate && stack_at + 1 == stack_count {
                // Id belongs to the record being revalidated mid-walk.
                let elem = ReachableElem {
                    id,
                    cr: tr_cr,
                    src: tgt,
                    table: tgt_table,
                    type_index: i as u32,
                };
                self.components
                    .record_mut(tgt_cr)
                    .pair
                    .as_mut()
                    .expect("traversable pair without cache")
                    .reachable
                    .ids
                    .push(elem);
            }

            // Nearest ancestor wins: skip ids masked by a closer table on
            // the visiting stack.
            if stack_at != stack.len() {
                continue;
            }

            reachable.push(ReachableElem {
                id,
                cr: tr_cr,
                src: tgt,
                table: tgt_table,
                type_index: i as u32,
            });
            let trav = self.entities.current(trav_index);
            self.forward_id(
                er, er_onset, emit_ids, it, table_id, tr_cr, tgt, tgt_table, i, trav,
            );
        }

        if parent_revalidate {
            // Append what the recursion below this table discovered and
            // mark the record valid.
            let tail: Vec<ReachableElem> = reachable[rc_child_offset..].to_vec();
            let rc = &mut self
                .components
                .record_mut(tgt_cr)
                .pair
                .as_mut()
                .expect("traversable pair without cache")
                .reachable;
            rc.ids.extend(tail);
            rc.current = rc.generation;
            trace!(id = ?tgt_pair_id, elems = rc.ids.len(), "cache revalidated");
        }
    }

    /// Forward one reachable id: invoke `up` observers (and `self_up` when
    /// the table does not own the id itself), then synthesize OnSet for
    /// storage-backed ids.
    #[allow(clippy::too_many_arguments)]
    fn forward_id(
        &self,
        er: Option<&'w EventRecord>,
        er_onset: Option<&'w EventRecord>,
        emit_ids: &[Id],
        it: &mut It<'w>,
        table_id: TableId,
        cr: CrId,
        tgt: Entity,
        tgt_table: TableId,
        type_index: usize,
        trav: Option<Entity>,
    ) {
        let id = self.components.record(cr).id;
        let event = er.map(|er| er.event);
        let inherit = trav == Some(IS_A);
        let may_override = inherit && event == Some(ON_ADD) && emit_ids.len() > 1;

        let iders: Iders<'w> = er.map(|er| er.observers_matching(id)).unwrap_or_default();
        let iders_onset: Iders<'w> = er_onset
            .map(|er| er.observers_matching(id))
            .unwrap_or_default();

        if !may_override && iders.is_empty() && iders_onset.is_empty() {
            return;
        }

        let old_source = it.source;
        it.event_id = id;
        it.source = Some(tgt);
        it.up = true;

        let tgt_row = self
            .entities
            .get(tgt)
            .expect("forwarding from dead entity")
            .row as usize;
        it.value = self.column_value(tgt_table, type_index, tgt_row);

        let owned = self.components.table_record(cr, table_id).is_some();

        for ider in &iders {
            self.invoke(&ider.up, it, trav);
            // Owned takes precedence
            if !owned {
                self.invoke(&ider.self_up, it, trav);
            }
        }

        // Emit OnSet events for newly inherited component values.
        if it.value.is_some() && !iders_onset.is_empty() {
            let old_event = it.event;
            it.event = ON_SET;
            for ider in &iders_onset {
                self.invoke(&ider.up, it, trav);
                if !owned {
                    self.invoke(&ider.self_up, it, trav);
                }
            }
            it.event = old_event;
        }

        it.source = old_source;
        it.up = false;
    }

    /// First stack position whose table owns the record's id; equals the
    /// stack length when none does.
    fn stack_at(&self, stack: &[TableId], cr: CrId) -> usize {
        stack
            .iter()
            .position(|&t| self.components.table_record(cr, t).is_some())
            .unwrap_or(stack.len())
    }

    fn stack_has(&self, stack: &[TableId], cr: CrId) -> bool {
        self.stack_at(stack, cr) != stack.len()
    }

    // ---- propagation (downward traversal) ----

    /// Re-emit the current id to every entity that reaches one of the
    /// mutated entities through a traversable relationship.
    fn propagate_entities(
        &mut self,
        it: &mut It<'w>,
        cr: CrId,
        entities: &'w [Entity],
        src: Option<Entity>,
        iders: &Iders<'w>,
    ) {
        if entities.is_empty() {
            return;
        }

        let old_source = it.source;
        let old_table = it.table;
        let old_other_table = it.other_table;
        let old_entities = it.entities;
        let old_count = it.count;
        let old_offset = it.offset;

        for &entity in entities {
            // After a bulk operation the range may not be fully populated.
            let Some(record) = self.entities.get(entity) else {
                continue;
            };
            if let Some(tgt_cr) = record.cr {
                // Entity is used as target in traversable pairs.
                it.source = Some(src.unwrap_or(entity));
                self.propagate(it, cr, tgt_cr, None, iders);
            }
        }

        it.source = old_source;
        it.table = old_table;
        it.other_table = old_other_table;
        it.entities = old_entities;
        it.count = old_count;
        it.offset = old_offset;
    }

    /// Walk the traversable-pair chain of a target entity, invalidating
    /// each pair's reachability cache and re-invoking the matched observer
    /// buckets for every table of descendants.
    fn propagate(
        &mut self,
        it: &mut It<'w>,
        cr: CrId,
        tgt_cr: CrId,
        propagate_trav: Option<Entity>,
        iders: &Iders<'w>,
    ) {
        trace!(id = ?self.components.record(tgt_cr).id, "propagate events / invalidate cache");

        let mut cur = tgt_cr;
        while let Some(next) = self.components.trav_next(cur) {
            cur = next;
            self.components
                .record_mut(cur)
                .pair
                .as_mut()
                .expect("traversable pair without cache")
                .reachable
                .invalidate();

            let trav_index = self.components.record(cur).id.first();
            if let Some(trav) = propagate_trav {
                if trav.index() != trav_index && trav != IS_A {
                    continue;
                }
            }

            let trav = self.entities.current(trav_index);
            self.propagate_id(it, cr, cur, trav, iders);
        }
    }

    fn propagate_id(
        &mut self,
        it: &mut It<'w>,
        cr: CrId,
        cur: CrId,
        trav: Option<Entity>,
        iders: &Iders<'w>,
    ) {
        let table_ids: SmallVec<[TableId; 8]> =
            self.components.record(cur).table_ids().collect();

        for table_id in table_ids {
            let table = self.tables.get(table_id);
            let entity_count = table.count();
            if entity_count == 0 {
                continue;
            }

            let owned = self.components.table_record(cr, table_id).is_some();

            it.table = table_id;
            it.other_table = None;
            it.offset = 0;
            it.count = entity_count;
            it.entities = table.entities();
            it.up = true;

            for ider in iders {
                self.invoke(&ider.up, it, trav);
                if !owned {
                    // Owned takes precedence
                    self.invoke(&ider.self_up, it, trav);
                }
            }

            if table.traversable_count == 0 {
                continue;
            }

            for &entity in table.entities() {
                let Some(record) = self.entities.get(entity) else {
                    continue;
                };
                if let Some(next_tgt) = record.cr {
                    // Only descend through entities that are themselves
                    // used as traversable-pair targets.
                    self.propagate(it, cr, next_tgt, trav, iders);
                }
            }
        }

        it.up = false;
    }

    // ---- invalidation ----

    /// Phase 1: bump the generation of every reachability cache that can
    /// see the mutated range, before any observer runs.
    fn propagate_invalidate(&mut self, table_id: TableId, offset: usize, count: usize) {
        let entities: &'w [Entity] =
            &self.tables.get(table_id).entities()[offset..offset + count];
        for &entity in entities {
            let Some(record) = self.entities.get(entity) else {
                continue;
            };
            if let Some(tgt_cr) = record.cr {
                self.propagate_invalidate_tables(tgt_cr);
            }
        }
    }

    fn propagate_invalidate_tables(&mut self, tgt_cr: CrId) {
        trace!(id = ?self.components.record(tgt_cr).id, "invalidate reachable cache");

        let mut cur = tgt_cr;
        while let Some(next) = self.components.trav_next(cur) {
            cur = next;
            {
                let rc = &self
                    .components
                    .record(cur)
                    .pair
                    .as_ref()
                    .expect("traversable pair without cache")
                    .reachable;
                if !rc.is_valid() {
                    // Subtree is already marked invalid.
                    continue;
                }
            }
            self.components
                .record_mut(cur)
                .pair
                .as_mut()
                .expect("traversable pair without cache")
                .reachable
                .invalidate();

            let table_ids: SmallVec<[TableId; 8]> =
                self.components.record(cur).table_ids().collect();
            for table_id in table_ids {
                let table = self.tables.get(table_id);
                if table.traversable_count == 0 {
                    continue;
                }
                for &entity in table.entities() {
                    let Some(record) = self.entities.get(entity) else {
                        continue;
                    };
                    if let Some(next_tgt) = record.cr {
                        self.propagate_invalidate_tables(next_tgt);
                    }
                }
            }
        }
    }

    // ---- override reconciliation ----

    fn find_override_base(&self, table_id: TableId, cr: CrId, depth: usize) -> Option<Entity> {
        find_override_base(self.entities, self.tables, self.components, table_id, cr, depth)
    }

    /// OnAdd case: the entity gained an override and an inheritance edge in
    /// the same mutation; observers must see the overriding value as newly
    /// set, unless the previous table already inherited from the same base.
    fn on_set_for_override_on_add(
        &mut self,
        er_onset: Option<&'w EventRecord>,
        it: &mut It<'w>,
        id: Id,
        cr: CrId,
        table_id: TableId,
    ) {
        // Only an id the table owns can be an override.
        if self.components.table_record(cr, table_id).is_none() {
            return;
        }
        let Some(base) = self.find_override_base(table_id, cr, 0) else {
            return;
        };

        if let Some(other) = it.other_table {
            if self
                .components
                .table_has(Id::pair(IS_A, base), other)
            {
                // Previous table already inherited from this base; the
                // value the entity observes did not change.
                return;
            }
        }

        let Some(er_onset) = er_onset else {
            return;
        };
        let iders: Iders<'w> = er_onset.observers_matching(id);
        if iders.is_empty() {
            return;
        }

        it.event_id = id;
        it.source = None;
        it.up = false;
        it.value = self
            .components
            .table_record(cr, table_id)
            .and_then(|i| self.column_value(table_id, i, it.offset));

        let old_event = it.event;
        it.event = ON_SET;
        for ider in &iders {
            self.invoke(&ider.self_, it, None);
            self.invoke(&ider.self_up, it, None);
        }
        it.event = old_event;
    }

    /// OnRemove case: removing an override re-exposes the inherited value;
    /// observers see an OnSet sourced from the base entity.
    fn on_set_for_override_on_remove(
        &mut self,
        er_onset: Option<&'w EventRecord>,
        it: &mut It<'w>,
        id: Id,
        cr: CrId,
        table_id: TableId,
    ) {
        if self.components.table_record(cr, table_id).is_none() {
            return;
        }
        let Some(base) = self.find_override_base(table_id, cr, 0) else {
            return;
        };
        let Some(er_onset) = er_onset else {
            return;
        };
        let iders: Iders<'w> = er_onset.observers_matching(id);
        if iders.is_empty() {
            return;
        }

        let base_record = self
            .entities
            .get(base)
            .expect("override base despawned");
        let base_type_index = self
            .components
            .table_record(cr, base_record.table)
            .expect("override base lost the component");

        it.event_id = id;
        it.source = Some(base);
        it.up = true;
        it.value = self.column_value(base_record.table, base_type_index, base_record.row as usize);

        let old_event = it.event;
        it.event = ON_SET;
        for ider in &iders {
            self.invoke(&ider.self_up, it, Some(IS_A));
            self.invoke(&ider.up, it, Some(IS_A));
        }
        it.event = old_event;
        it.source = None;
        it.up = false;
    }
}

/// Find the nearest ancestor (through `IsA`) whose table owns the record's
/// id. Nearest wins: a base visited earlier in type order shadows a base
/// further up the chain.
pub(crate) fn find_override_base(
    entities: &EntityIndex,
    tables: &TableStore,
    components: &ComponentIndex,
    table_id: TableId,
    cr: CrId,
    depth: usize,
) -> Option<Entity> {
    if depth >= MAX_TRAVERSAL_DEPTH {
        let id = components.record(cr).id;
        panic!("cycle detected while resolving override for {id:?}");
    }
    let table = tables.get(table_id);
    for (_, pair) in table.is_a_pairs() {
        let Some(base) = entities.current(pair.second()) else {
            continue;
        };
        let Some(base_record) = entities.get(base) else {
            continue;
        };
        let base_table = base_record.table;
        if components.table_record(cr, base_table).is_some() {
            return Some(base);
        }
        if let Some(found) =
            find_override_base(entities, tables, components, base_table, cr, depth + 1)
        {
            return Some(found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_flags() {
        let flags = EventFlags::TABLE_ONLY | EventFlags::NO_ON_SET;
        assert!(flags.contains(EventFlags::TABLE_ONLY));
        assert!(flags.contains(EventFlags::NO_ON_SET));
        assert!(!EventFlags::default().contains(EventFlags::TABLE_ONLY));
    }

    #[test]
    fn test_event_desc_defaults() {
        let desc = EventDesc::new(ON_ADD);
        assert_eq!(desc.event, ON_ADD);
        assert!(desc.ids.is_empty());
        assert!(desc.table.is_none());
        assert_eq!(desc.count, 0);
    }
}
