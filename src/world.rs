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

//! World: central entity, table and event-dispatch storage.
//!
//! Ties together the entity index, table store, component-record index and
//! observable. Mutations (add/remove/set) are translated into a table move
//! plus a list of added/removed ids, which is handed to the emit pipeline.
//! A world instance is single-threaded; callers that share one across
//! threads must serialize access themselves.

use ahash::AHashMap;
use smallvec::SmallVec;
use std::any::TypeId;
use tracing::info_span;

use crate::component::{Component, ComponentFlags, OnInstantiate, TypeInfo};
use crate::component_index::{ComponentIndex, ComponentRecord};
use crate::emit::{find_override_base, EmitCtx, EventDesc, EventView, MAX_TRAVERSAL_DEPTH};
use crate::entity_index::EntityIndex;
use crate::error::{EcsError, Result};
use crate::id::{Entity, Id, ANY, CHILD_OF, IS_A, ON_ADD, ON_REMOVE, ON_SET};
use crate::observable::{MatchKind, Observable, ObserverHandle};
use crate::table::{signature_from, Table, TableId, TableStore};

struct BatchWrite {
    id: Id,
    write: Box<dyn FnOnce(*mut u8)>,
}

/// Central ECS world.
pub struct World {
    entities: EntityIndex,
    tables: TableStore,
    components: ComponentIndex,
    observable: Observable,

    /// Maps Rust component types to their component entities.
    type_map: AHashMap<TypeId, Entity>,

    /// Event transaction counter; every emit call gets a fresh value so
    /// observers watching multiple components can de-duplicate.
    event_id: u64,

    /// Deferred mode counter. Positive while deferred; negative while
    /// deferral is suspended.
    defer: i32,

    /// Events buffered by `enqueue` while deferred.
    queue: Vec<EventDesc>,

    /// Prefab-instantiation re-entry guard.
    instantiating: Option<Entity>,

    /// Live observer registrations, unregistered on drop.
    observers: Vec<ObserverHandle>,
}

impl World {
    /// Create a new, empty world.
    pub fn new() -> Self {
        let mut components = ComponentIndex::new();

        // Builtin relationship traits.
        let (is_a, _) = components.get_or_create(Id::component(IS_A));
        components
            .record_mut(is_a)
            .flags
            .insert(ComponentFlags::TRAVERSABLE);
        let (child_of, _) = components.get_or_create(Id::component(CHILD_OF));
        components
            .record_mut(child_of)
            .flags
            .insert(ComponentFlags::TRAVERSABLE | ComponentFlags::EXCLUSIVE);

        Self {
            entities: EntityIndex::new(),
            tables: TableStore::new(),
            components,
            observable: Observable::new(),
            type_map: AHashMap::with_capacity(64),
            event_id: 0,
            defer: 0,
            queue: Vec::new(),
            instantiating: None,
            observers: Vec::new(),
        }
    }

    // ---- entities ----

    /// Spawn a new empty entity.
    pub fn spawn(&mut self) -> Entity {
        let entity = self.entities.alloc();
        self.tables
            .place_entity(&mut self.entities, entity, TableId::EMPTY);
        entity
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Resolve a possibly stale handle to the currently alive entity in
    /// the same slot.
    pub fn get_alive(&self, entity: Entity) -> Option<Entity> {
        self.entities.current(entity.index())
    }

    /// Despawn an entity, emitting OnRemove for everything it owns.
    pub fn despawn(&mut self, entity: Entity) -> Result<()> {
        let record = *self.entities.get(entity).ok_or(EcsError::EntityNotFound)?;
        let ids: SmallVec<[Id; 4]> = self
            .tables
            .get(record.table)
            .ids()
            .iter()
            .copied()
            .collect();
        if !ids.is_empty() {
            let mut desc = EventDesc::new(ON_REMOVE);
            desc.ids = ids;
            desc.table = Some(record.table);
            desc.offset = record.row as usize;
            desc.count = 1;
            desc.other_table = Some(TableId::EMPTY);
            self.emit(desc);
        }
        self.tables.remove_entity(&mut self.entities, entity);
        self.entities.free(entity);
        Ok(())
    }

    /// Table and row currently owning an entity.
    pub fn entity_location(&self, entity: Entity) -> Option<(TableId, u32)> {
        self.entities.get(entity).map(|r| (r.table, r.row))
    }

    // ---- components and traits ----

    /// Register (or look up) the component entity for a Rust type.
    pub fn component<T: Component + Default + Clone>(&mut self) -> Entity {
        if let Some(&entity) = self.type_map.get(&TypeId::of::<T>()) {
            return entity;
        }
        let entity = self.spawn();
        let (cr, _) = self.components.get_or_create(Id::component(entity));
        self.components.record_mut(cr).type_info = Some(TypeInfo::of::<T>());
        self.type_map.insert(TypeId::of::<T>(), entity);
        entity
    }

    /// Id of a Rust component type, registering it on first use.
    pub fn component_id<T: Component + Default + Clone>(&mut self) -> Id {
        Id::component(self.component::<T>())
    }

    /// Create a fresh tag entity (no storage).
    pub fn tag(&mut self) -> Entity {
        self.spawn()
    }

    fn set_id_flags(&mut self, id: Id, flags: ComponentFlags) {
        let (cr, _) = self.components.get_or_create(id);
        self.components.record_mut(cr).flags.insert(flags);
    }

    /// Mark a relationship as traversable. Must be set before the
    /// relationship is first used in a pair; pair records copy the
    /// relationship's flags when they are created.
    pub fn make_traversable(&mut self, relationship: Entity) {
        self.set_id_flags(Id::component(relationship), ComponentFlags::TRAVERSABLE);
    }

    /// Mark a relationship as exclusive: adding a pair replaces any
    /// existing pair with the same relationship.
    pub fn make_exclusive(&mut self, relationship: Entity) {
        self.set_id_flags(Id::component(relationship), ComponentFlags::EXCLUSIVE);
    }

    /// Mark an id as non-fragmenting: it never gets its own table column
    /// and event dispatch substitutes a dummy membership record.
    pub fn make_dont_fragment(&mut self, id: Entity) {
        self.set_id_flags(Id::component(id), ComponentFlags::DONT_FRAGMENT);
    }

    /// Mark an id as sparse. Sparse ids are also non-fragmenting.
    pub fn make_sparse(&mut self, id: Entity) {
        self.set_id_flags(
            Id::component(id),
            ComponentFlags::SPARSE | ComponentFlags::DONT_FRAGMENT,
        );
    }

    /// Mark pairs of a relationship as carrying no value even when the
    /// relationship itself is a component.
    pub fn make_pair_tag(&mut self, relationship: Entity) {
        self.set_id_flags(Id::component(relationship), ComponentFlags::PAIR_IS_TAG);
    }

    /// Set how a component behaves when inherited through `IsA`.
    pub fn set_on_instantiate(&mut self, component: Entity, mode: OnInstantiate) {
        let (cr, _) = self.components.get_or_create(Id::component(component));
        let flags = &mut self.components.record_mut(cr).flags;
        flags.remove(
            ComponentFlags::ON_INSTANTIATE_INHERIT
                | ComponentFlags::ON_INSTANTIATE_OVERRIDE
                | ComponentFlags::ON_INSTANTIATE_DONT_INHERIT,
        );
        flags.insert(match mode {
            OnInstantiate::Inherit => ComponentFlags::ON_INSTANTIATE_INHERIT,
            OnInstantiate::Override => ComponentFlags::ON_INSTANTIATE_OVERRIDE,
            OnInstantiate::DontInherit => ComponentFlags::ON_INSTANTIATE_DONT_INHERIT,
        });
    }

    // ---- mutation ----

    /// Start a batched mutation: several adds/sets applied in one table
    /// move, emitting a single OnAdd for all added ids.
    pub fn batch(&mut self, entity: Entity) -> EntityBatch<'_> {
        EntityBatch {
            world: self,
            entity,
            add: SmallVec::new(),
            writes: Vec::new(),
        }
    }

    /// Add an id to an entity.
    pub fn add_id(&mut self, entity: Entity, id: Id) -> Result<()> {
        self.batch(entity).add_id(id).commit()
    }

    /// Add a typed component, default-initialized.
    pub fn add<T: Component + Default + Clone>(&mut self, entity: Entity) -> Result<()> {
        let id = self.component_id::<T>();
        self.add_id(entity, id)
    }

    /// Add a relationship pair.
    pub fn add_pair(&mut self, entity: Entity, relationship: Entity, target: Entity) -> Result<()> {
        self.add_id(entity, Id::pair(relationship, target))
    }

    /// Write a component value, emitting OnSet (and OnAdd first when the
    /// entity did not own the component yet).
    pub fn set<T: Component + Default + Clone>(&mut self, entity: Entity, value: T) -> Result<()> {
        let id = self.component_id::<T>();
        let record = *self.entities.get(entity).ok_or(EcsError::EntityNotFound)?;
        let owned = self
            .components
            .get(id)
            .and_then(|cr| self.components.table_record(cr, record.table));
        if let Some(type_index) = owned {
            let ptr = self
                .tables
                .get(record.table)
                .column_ptr(type_index, record.row as usize)
                .expect("typed id without column");
            unsafe {
                let ptr = ptr as *mut T;
                std::ptr::drop_in_place(ptr);
                std::ptr::write(ptr, value);
            }
            let mut desc = EventDesc::new(ON_SET);
            desc.ids.push(id);
            desc.entity = Some(entity);
            self.emit(desc);
            Ok(())
        } else {
            self.batch(entity).set(value).commit()
        }
    }

    /// Remove an id from an entity. Removing an id the entity does not own
    /// is a no-op.
    pub fn remove_id(&mut self, entity: Entity, id: Id) -> Result<()> {
        let record = *self.entities.get(entity).ok_or(EcsError::EntityNotFound)?;
        let src = record.table;
        let owned = self
            .components
            .get(id)
            .is_some_and(|cr| self.components.table_record(cr, src).is_some());
        if !owned {
            return Ok(());
        }

        let sig: Vec<Id> = self
            .tables
            .get(src)
            .ids()
            .iter()
            .copied()
            .filter(|&x| x != id)
            .collect();
        let dst = self
            .tables
            .ensure(signature_from(&sig), &mut self.components, &mut self.entities);

        // OnRemove fires before the move so observers still see the value.
        let mut desc = EventDesc::new(ON_REMOVE);
        desc.ids.push(id);
        desc.table = Some(src);
        desc.offset = record.row as usize;
        desc.count = 1;
        desc.other_table = Some(dst);
        self.emit(desc);

        self.tables
            .move_entity(&mut self.entities, &self.components, entity, dst);
        Ok(())
    }

    /// Remove a typed component.
    pub fn remove<T: Component + Default + Clone>(&mut self, entity: Entity) -> Result<()> {
        let id = self.component_id::<T>();
        self.remove_id(entity, id)
    }

    /// Remove a relationship pair.
    pub fn remove_pair(
        &mut self,
        entity: Entity,
        relationship: Entity,
        target: Entity,
    ) -> Result<()> {
        self.remove_id(entity, Id::pair(relationship, target))
    }

    // ---- reads ----

    /// Read a component value.
    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        let &component = self.type_map.get(&TypeId::of::<T>())?;
        let id = Id::component(component);
        let record = self.entities.get(entity)?;
        let cr = self.components.get(id)?;
        let type_index = self.components.table_record(cr, record.table)?;
        let ptr = self
            .tables
            .get(record.table)
            .column_ptr(type_index, record.row as usize)?;
        Some(unsafe { &*(ptr as *const T) })
    }

    pub fn has_id(&self, entity: Entity, id: Id) -> bool {
        let Some(record) = self.entities.get(entity) else {
            return false;
        };
        self.components.table_has(id, record.table)
    }

    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.type_map
            .get(&TypeId::of::<T>())
            .is_some_and(|&c| self.has_id(entity, Id::component(c)))
    }

    /// First target of a relationship on an entity, in type order.
    pub fn target(&self, entity: Entity, relationship: Entity) -> Option<Entity> {
        let record = self.entities.get(entity)?;
        self.tables
            .get(record.table)
            .ids()
            .iter()
            .find(|id| id.is_pair() && id.first() == relationship.index())
            .and_then(|id| self.entities.current(id.second()))
    }

    /// Entities related to `target` through `relationship`.
    pub fn sources_of(&self, relationship: Entity, target: Entity) -> Vec<Entity> {
        let Some(cr) = self.components.get(Id::pair(relationship, target)) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for table in self.components.record(cr).table_ids() {
            out.extend_from_slice(self.tables.get(table).entities());
        }
        out
    }

    // ---- index probes ----

    /// Component record for an id, if any table ever owned it.
    pub fn component_record(&self, id: Id) -> Option<&ComponentRecord> {
        self.components.get(id).map(|cr| self.components.record(cr))
    }

    /// Tables currently containing an id, in unspecified order.
    pub fn tables_with(&self, id: Id) -> Vec<TableId> {
        self.components
            .get(id)
            .map(|cr| self.components.record(cr).table_ids().collect())
            .unwrap_or_default()
    }

    /// Cheap probe: does anything observe `(event, id)`?
    pub fn observers_exist(&self, id: Id, event: Entity) -> bool {
        self.observable.observers_exist(id, event)
    }

    pub fn table(&self, id: TableId) -> &Table {
        self.tables.get(id)
    }

    // ---- observers ----

    /// Register an observer matching owned and inherited ids.
    pub fn observe(
        &mut self,
        event: Entity,
        id: Id,
        callback: impl FnMut(&EventView<'_>) + 'static,
    ) -> ObserverHandle {
        self.observe_kind(event, id, MatchKind::SelfUp, callback)
    }

    /// Register an observer with an explicit match kind.
    pub fn observe_kind(
        &mut self,
        event: Entity,
        id: Id,
        kind: MatchKind,
        callback: impl FnMut(&EventView<'_>) + 'static,
    ) -> ObserverHandle {
        let handle = self.observable.register(event, id, kind, Box::new(callback));
        self.observers.push(handle);
        handle
    }

    pub fn unobserve(&mut self, handle: ObserverHandle) {
        self.observable.unregister(handle);
        self.observers.retain(|h| *h != handle);
    }

    // ---- events ----

    /// Emit an event synchronously.
    ///
    /// Preconditions (checked): the event must be non-null and not the
    /// wildcard, and the descriptor must name a table or an entity.
    pub fn emit(&mut self, mut desc: EventDesc) {
        assert!(!desc.event.is_null(), "emit requires an event");

        if let Some(entity) = desc.entity {
            assert!(desc.table.is_none(), "emit takes an entity or a table, not both");
            let record = self.entities.get(entity).expect("emit for dead entity");
            desc.table = Some(record.table);
            desc.offset = record.row as usize;
            desc.count = 1;
        }
        if desc.ids.is_empty() {
            desc.ids.push(Id::component(ANY));
        }
        let table = desc.table.expect("emit requires a table or an entity");

        let _span = info_span!("emit", event = ?desc.event, ids = desc.ids.len()).entered();

        // Deferring cannot be suspended for observers: they must see a
        // consistent world even while a command queue is being replayed.
        let defer = self.defer;
        if defer < 0 {
            self.defer = -defer;
        }

        self.event_id += 1;
        let mut ctx = EmitCtx {
            entities: &self.entities,
            tables: &self.tables,
            components: &mut self.components,
            observable: &self.observable,
            evtx: self.event_id,
            param: desc.param.as_deref(),
        };
        ctx.run(
            desc.event,
            &desc.ids,
            table,
            desc.offset,
            desc.count,
            desc.other_table,
            desc.flags,
        );

        self.defer = defer;
    }

    /// Emit now, or buffer until `defer_end` when the world is deferred.
    pub fn enqueue(&mut self, desc: EventDesc) {
        if self.defer > 0 {
            self.queue.push(desc);
        } else {
            self.emit(desc);
        }
    }

    pub fn defer_begin(&mut self) {
        self.defer += 1;
    }

    /// Leave deferred mode; at the outermost level, replay every queued
    /// event as its own serialized emit.
    pub fn defer_end(&mut self) {
        assert!(self.defer > 0, "defer_end without defer_begin");
        self.defer -= 1;
        if self.defer == 0 {
            let queue = std::mem::take(&mut self.queue);
            for desc in queue {
                self.emit(desc);
            }
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.defer > 0
    }

    /// Event transaction id of the most recent emit.
    pub fn last_event_id(&self) -> u64 {
        self.event_id
    }

    // ---- batched mutation internals ----

    fn commit_batch(
        &mut self,
        entity: Entity,
        add: SmallVec<[Id; 8]>,
        writes: Vec<BatchWrite>,
    ) -> Result<()> {
        let record = *self.entities.get(entity).ok_or(EcsError::EntityNotFound)?;
        let src_id = record.table;
        let src_ids: SmallVec<[Id; 8]> =
            self.tables.get(src_id).ids().iter().copied().collect();

        let mut sig: Vec<Id> = src_ids.to_vec();
        let mut added: SmallVec<[Id; 8]> = SmallVec::new();

        for &id in &add {
            if id.is_pair() && id.second() == entity.index() {
                let traversable = self
                    .components
                    .get(Id::from_index(id.first()))
                    .is_some_and(|cr| self.components.record(cr).is_traversable());
                if traversable {
                    return Err(EcsError::CycleDetected(format!(
                        "{id:?} targets its own entity"
                    )));
                }
            }
            if sig.contains(&id) {
                continue;
            }

            let flag_source = if id.is_pair() {
                Id::from_index(id.first())
            } else {
                id
            };
            let flags = self
                .components
                .get(flag_source)
                .map(|cr| self.components.record(cr).flags)
                .unwrap_or_default();

            if id.is_pair() && flags.contains(ComponentFlags::EXCLUSIVE) {
                // Exclusive relationship: the new pair replaces any pair
                // with the same relationship, including one added earlier
                // in this batch. Replaced batch entries stay in the added
                // list; the emit pipeline skips their stale records.
                sig.retain(|x| !(x.is_pair() && x.first() == id.first() && *x != id));
            }
            if !flags.contains(ComponentFlags::DONT_FRAGMENT) {
                sig.push(id);
            }
            if !added.contains(&id) {
                added.push(id);
            }
        }

        // Adding an inheritance edge pulls the base's auto-override
        // components into the same batch.
        let mut override_copies: Vec<(Id, Entity)> = Vec::new();
        let mut new_bases: SmallVec<[Entity; 2]> = SmallVec::new();
        for i in 0..added.len() {
            let id = added[i];
            if !(id.is_pair() && id.first() == IS_A.index() && !src_ids.contains(&id)) {
                continue;
            }
            let Some(base) = self.entities.current(id.second()) else {
                continue;
            };
            new_bases.push(base);
            let base_table = self
                .entities
                .get(base)
                .map(|r| r.table)
                .unwrap_or(TableId::EMPTY);
            let base_ids: SmallVec<[Id; 8]> =
                self.tables.get(base_table).ids().iter().copied().collect();
            for &base_id in &base_ids {
                let Some(cr) = self.components.get(base_id) else {
                    continue;
                };
                let rec = self.components.record(cr);
                if rec.flags.on_instantiate() == OnInstantiate::Override
                    && rec.type_info.is_some()
                {
                    if !sig.contains(&base_id) {
                        sig.push(base_id);
                        if !added.contains(&base_id) {
                            added.push(base_id);
                        }
                    }
                    override_copies.push((base_id, base));
                }
            }
        }

        let removed: SmallVec<[Id; 4]> = src_ids
            .iter()
            .copied()
            .filter(|id| !sig.contains(id))
            .collect();

        let dst_id =
            self.tables
                .ensure(signature_from(&sig), &mut self.components, &mut self.entities);

        if !removed.is_empty() {
            let mut desc = EventDesc::new(ON_REMOVE);
            desc.ids = removed;
            desc.table = Some(src_id);
            desc.offset = record.row as usize;
            desc.count = 1;
            desc.other_table = Some(dst_id);
            self.emit(desc);
        }

        let row = if dst_id != src_id {
            self.tables
                .move_entity(&mut self.entities, &self.components, entity, dst_id)
        } else {
            self.entities.get(entity).expect("entity lost mid-batch").row as usize
        };

        // Values are written before events fire so observers (including
        // the synthetic-OnSet reconciliation) see the final state.
        let write_ids: SmallVec<[Id; 4]> = writes.iter().map(|w| w.id).collect();
        for w in writes {
            let cr = self
                .components
                .get(w.id)
                .ok_or(EcsError::ComponentNotFound)?;
            let ti = self
                .components
                .record(cr)
                .type_info
                .ok_or_else(|| EcsError::InvalidParameter("set on a tag id".into()))?;
            let Some(type_index) = self.components.table_record(cr, dst_id) else {
                return Err(EcsError::InvalidParameter(
                    "set on a non-fragmenting id".into(),
                ));
            };
            let ptr = self
                .tables
                .get(dst_id)
                .column_ptr(type_index, row)
                .expect("typed id without column");
            unsafe {
                ti.drop_one(ptr);
            }
            (w.write)(ptr);
        }

        for &(id, base) in &override_copies {
            if write_ids.contains(&id) {
                continue;
            }
            let cr = self.components.get(id).expect("override id without record");
            let ti = self
                .components
                .record(cr)
                .type_info
                .expect("override id without type info");
            let base_record = *self.entities.get(base).expect("override base despawned");
            let base_index = self
                .components
                .table_record(cr, base_record.table)
                .expect("override base lost the component");
            let src_ptr = self
                .tables
                .get(base_record.table)
                .column_ptr(base_index, base_record.row as usize)
                .expect("typed id without column");
            let dst_index = self
                .components
                .table_record(cr, dst_id)
                .expect("override target lost the component");
            let dst_ptr = self
                .tables
                .get(dst_id)
                .column_ptr(dst_index, row)
                .expect("typed id without column");
            unsafe {
                ti.drop_one(dst_ptr);
                ti.clone_into(src_ptr, dst_ptr);
            }
        }

        for &base in &new_bases {
            self.instantiate(entity, base);
        }

        if !added.is_empty() {
            let mut desc = EventDesc::new(ON_ADD);
            desc.ids = added.iter().copied().collect();
            desc.table = Some(dst_id);
            desc.offset = row;
            desc.count = 1;
            desc.other_table = Some(src_id);
            self.emit(desc);
        }

        for id in write_ids {
            if self.override_onset_covered(dst_id, src_id, id, &added) {
                // The OnAdd reconciliation already emitted OnSet for this
                // override; a second one would double-notify.
                continue;
            }
            let mut desc = EventDesc::new(ON_SET);
            desc.ids.push(id);
            desc.table = Some(dst_id);
            desc.offset = row;
            desc.count = 1;
            self.emit(desc);
        }

        Ok(())
    }

    /// Mirror of the emit pipeline's override-reconciliation condition:
    /// true when the OnAdd for this batch synthesized an OnSet for `id`.
    fn override_onset_covered(
        &self,
        dst: TableId,
        src: TableId,
        id: Id,
        added: &[Id],
    ) -> bool {
        if !added.contains(&id) || !self.tables.get(dst).has_is_a {
            return false;
        }
        let Some(cr) = self.components.get(id) else {
            return false;
        };
        let rec = self.components.record(cr);
        if rec.type_info.is_none()
            || rec.flags.on_instantiate() == OnInstantiate::DontInherit
            || self.components.table_record(cr, dst).is_none()
        {
            return false;
        }
        let Some(base) =
            find_override_base(&self.entities, &self.tables, &self.components, dst, cr, 0)
        else {
            return false;
        };
        !self.components.table_has(Id::pair(IS_A, base), src)
    }

    // ---- prefab instantiation ----

    /// Clone the child hierarchy of a base under a fresh instance. Guarded
    /// against re-entry so prefab children with their own inheritance
    /// edges do not instantiate recursively.
    fn instantiate(&mut self, instance: Entity, base: Entity) {
        if self.instantiating.is_some() {
            return;
        }
        self.instantiating = Some(base);
        self.instantiate_children(base, instance, 0);
        self.instantiating = None;
    }

    fn instantiate_children(&mut self, base: Entity, instance: Entity, depth: usize) {
        if depth >= MAX_TRAVERSAL_DEPTH {
            panic!("cycle detected while instantiating children of {base:?}");
        }
        let Some(cr) = self.components.get(Id::pair(CHILD_OF, base)) else {
            return;
        };
        let table_ids: SmallVec<[TableId; 4]> =
            self.components.record(cr).table_ids().collect();
        let mut children: Vec<Entity> = Vec::new();
        for table in table_ids {
            children.extend_from_slice(self.tables.get(table).entities());
        }
        for child in children {
            let clone = self.instantiate_child(child, base, instance);
            self.instantiate_children(child, clone, depth + 1);
        }
    }

    fn instantiate_child(&mut self, child: Entity, base: Entity, instance: Entity) -> Entity {
        let child_record = *self.entities.get(child).expect("child entity despawned");
        let child_table = child_record.table;
        let child_ids: Vec<Id> = self
            .tables
            .get(child_table)
            .ids()
            .iter()
            .map(|&id| {
                if id == Id::pair(CHILD_OF, base) {
                    Id::pair(CHILD_OF, instance)
                } else {
                    id
                }
            })
            .collect();

        let clone = self.spawn();
        let dst = self.tables.ensure(
            signature_from(&child_ids),
            &mut self.components,
            &mut self.entities,
        );
        let row = self
            .tables
            .move_entity(&mut self.entities, &self.components, clone, dst);

        // Copy the child's component values onto the clone.
        let column_count = self.tables.get(dst).records().len();
        for type_index in 0..column_count {
            let (cr, has_column) = {
                let rec = self.tables.get(dst).record(type_index);
                (rec.cr, rec.column.is_some())
            };
            if !has_column {
                continue;
            }
            let Some(src_index) = self.components.table_record(cr, child_table) else {
                continue;
            };
            let ti = self
                .components
                .record(cr)
                .type_info
                .expect("column without type info");
            let src_ptr = self
                .tables
                .get(child_table)
                .column_ptr(src_index, child_record.row as usize)
                .expect("typed id without column");
            let dst_ptr = self
                .tables
                .get(dst)
                .column_ptr(type_index, row)
                .expect("typed id without column");
            unsafe {
                ti.drop_one(dst_ptr);
                ti.clone_into(src_ptr, dst_ptr);
            }
        }

        let ids: SmallVec<[Id; 4]> = self.tables.get(dst).ids().iter().copied().collect();
        let mut desc = EventDesc::new(ON_ADD);
        desc.ids = ids;
        desc.table = Some(dst);
        desc.offset = row;
        desc.count = 1;
        desc.other_table = Some(TableId::EMPTY);
        self.emit(desc);

        clone
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        for handle in std::mem::take(&mut self.observers) {
            self.observable.unregister(handle);
        }
    }
}

/// Builder for a batched mutation of one entity: several adds/sets, one
/// table move, one OnAdd.
pub struct EntityBatch<'w> {
    world: &'w mut World,
    entity: Entity,
    add: SmallVec<[Id; 8]>,
    writes: Vec<BatchWrite>,
}

impl EntityBatch<'_> {
    pub fn add_id(mut self, id: Id) -> Self {
        self.add.push(id);
        self
    }

    pub fn add<T: Component + Default + Clone>(mut self) -> Self {
        let id = self.world.component_id::<T>();
        self.add.push(id);
        self
    }

    pub fn add_pair(self, relationship: Entity, target: Entity) -> Self {
        self.add_id(Id::pair(relationship, target))
    }

    pub fn set<T: Component + Default + Clone>(mut self, value: T) -> Self {
        let id = self.world.component_id::<T>();
        self.add.push(id);
        self.writes.push(BatchWrite {
            id,
            write: Box::new(move |ptr| unsafe {
                std::ptr::write(ptr as *mut T, value);
            }),
        });
        self
    }

    /// Apply the batch: move the entity once, write values, then emit.
    pub fn commit(self) -> Result<()> {
        let EntityBatch {
            world,
            entity,
            add,
            writes,
        } = self;
        world.commit_batch(entity, add, writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[test]
    fn test_spawn_set_get_roundtrip() {
        let mut world = World::new();
        let e = world.spawn();
        world.set(e, Position { x: 1.0, y: 2.0 }).unwrap();
        assert_eq!(world.get::<Position>(e), Some(&Position { x: 1.0, y: 2.0 }));
        world.set(e, Position { x: 3.0, y: 4.0 }).unwrap();
        assert_eq!(world.get::<Position>(e), Some(&Position { x: 3.0, y: 4.0 }));
    }

    #[test]
    fn test_remove_component() {
        let mut world = World::new();
        let e = world.spawn();
        world.set(e, Position { x: 1.0, y: 2.0 }).unwrap();
        world.remove::<Position>(e).unwrap();
        assert_eq!(world.get::<Position>(e), None);
        // Removing again is a no-op.
        world.remove::<Position>(e).unwrap();
    }

    #[test]
    fn test_despawn_recycles_slot() {
        let mut world = World::new();
        let a = world.spawn();
        world.despawn(a).unwrap();
        assert!(!world.is_alive(a));
        let b = world.spawn();
        assert_eq!(a.index(), b.index());
        assert!(world.is_alive(b));
        assert_eq!(world.get_alive(a), Some(b));
    }

    #[test]
    fn test_exclusive_relationship_replaces() {
        let mut world = World::new();
        let parent_a = world.spawn();
        let parent_b = world.spawn();
        let child = world.spawn();
        world.add_pair(child, CHILD_OF, parent_a).unwrap();
        world.add_pair(child, CHILD_OF, parent_b).unwrap();
        assert!(!world.has_id(child, Id::pair(CHILD_OF, parent_a)));
        assert!(world.has_id(child, Id::pair(CHILD_OF, parent_b)));
        assert_eq!(world.target(child, CHILD_OF), Some(parent_b));
    }

    #[test]
    fn test_self_targeting_traversable_pair_rejected() {
        let mut world = World::new();
        let e = world.spawn();
        let err = world.add_pair(e, IS_A, e).unwrap_err();
        assert!(matches!(err, EcsError::CycleDetected(_)));
    }

    #[test]
    fn test_sources_of_lists_instances() {
        let mut world = World::new();
        let base = world.spawn();
        let a = world.spawn();
        let b = world.spawn();
        world.add_pair(a, IS_A, base).unwrap();
        world.add_pair(b, IS_A, base).unwrap();
        let mut sources = world.sources_of(IS_A, base);
        sources.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(sources, expected);
    }
}
