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

//! Observer dispatch index.
//!
//! Maps `(event, id)` to buckets of registered observers. Builtin events
//! (OnAdd, OnRemove, OnSet, Wildcard) resolve to fixed inline storage;
//! user-defined events go through a lazily-grown map keyed by the event
//! entity. Within an event, the `Any`, `Wildcard` and `(Wildcard,
//! Wildcard)` ids resolve to fixed fields; all other ids resolve through a
//! lazily-created map that is released (not just cleared) when it empties.
//!
//! This index does not own observer lifetime: the world unregisters
//! observers before the index is dropped, and dropping with live
//! registrations is a bug.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::rc::Rc;

use crate::emit::EventView;
use crate::id::{wildcard_pair, Entity, Id, ANY, ON_ADD, ON_REMOVE, ON_SET, WILDCARD};

/// Which bucket an observer matches from.
///
/// Closed set: `SelfOnly` matches ids the entity owns directly, `Up`
/// matches only inherited/forwarded ids, `SelfUp` matches both (owned
/// shadowing inherited).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchKind {
    SelfOnly,
    SelfUp,
    Up,
}

pub(crate) struct ObserverCell {
    pub(crate) id: u64,
    pub(crate) callback: RefCell<Box<dyn FnMut(&EventView<'_>)>>,
}

/// One bucket of observers for a `(event, id, match-kind)` combination.
#[derive(Default)]
pub struct ObserverBucket {
    pub(crate) observers: Vec<Rc<ObserverCell>>,
}

impl ObserverBucket {
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }
}

/// Observer sets for one id under one event.
#[derive(Default)]
pub struct EventIdRecord {
    pub self_: ObserverBucket,
    pub self_up: ObserverBucket,
    pub up: ObserverBucket,
    observer_count: u32,
}

impl EventIdRecord {
    pub fn observer_count(&self) -> u32 {
        self.observer_count
    }

    fn bucket_mut(&mut self, kind: MatchKind) -> &mut ObserverBucket {
        match kind {
            MatchKind::SelfOnly => &mut self.self_,
            MatchKind::SelfUp => &mut self.self_up,
            MatchKind::Up => &mut self.up,
        }
    }
}

/// Per-event index of observer sets, keyed by id.
#[derive(Default)]
pub struct EventRecord {
    pub event: Entity,
    any: Option<Box<EventIdRecord>>,
    wildcard: Option<Box<EventIdRecord>>,
    wildcard_pair: Option<Box<EventIdRecord>>,
    ids: Option<FxHashMap<Id, Box<EventIdRecord>>>,
}

impl EventRecord {
    /// True when at least one id record exists under this event.
    fn has_any_records(&self) -> bool {
        self.ids.is_some()
            || self.any.is_some()
            || self.wildcard.is_some()
            || self.wildcard_pair.is_some()
    }

    pub fn id_record(&self, id: Id) -> Option<&EventIdRecord> {
        if id == Id::component(ANY) {
            self.any.as_deref()
        } else if id == Id::component(WILDCARD) {
            self.wildcard.as_deref()
        } else if id == wildcard_pair() {
            self.wildcard_pair.as_deref()
        } else {
            self.ids.as_ref()?.get(&id).map(|r| r.as_ref())
        }
    }

    /// Id record filtered on having at least one registered observer.
    fn id_record_if(&self, id: Id) -> Option<&EventIdRecord> {
        self.id_record(id).filter(|r| r.observer_count > 0)
    }

    pub fn ensure_id_record(&mut self, id: Id) -> &mut EventIdRecord {
        if id == Id::component(ANY) {
            self.any.get_or_insert_with(Default::default)
        } else if id == Id::component(WILDCARD) {
            self.wildcard.get_or_insert_with(Default::default)
        } else if id == wildcard_pair() {
            self.wildcard_pair.get_or_insert_with(Default::default)
        } else {
            self.ids
                .get_or_insert_with(FxHashMap::default)
                .entry(id)
                .or_default()
        }
    }

    /// Symmetric teardown; the id map is released once it empties so an
    /// observable that saw traffic once does not retain memory forever.
    pub fn remove_id_record(&mut self, id: Id) {
        if id == Id::component(ANY) {
            self.any = None;
        } else if id == Id::component(WILDCARD) {
            self.wildcard = None;
        } else if id == wildcard_pair() {
            self.wildcard_pair = None;
        } else if let Some(ids) = self.ids.as_mut() {
            ids.remove(&id);
            if ids.is_empty() {
                self.ids = None;
            }
        }
    }

    /// Collect the observer sets matching a concrete id: the `Any` bucket,
    /// the exact bucket, and for pairs the three wildcard refinements (for
    /// plain ids, the generic wildcard bucket). Slot order is fixed; `Any`
    /// and exact come before the refinements.
    pub fn observers_matching(&self, id: Id) -> SmallVec<[&EventIdRecord; 5]> {
        let mut out: SmallVec<[&EventIdRecord; 5]> = SmallVec::new();
        let any_id = Id::component(ANY);

        if id != any_id {
            if let Some(r) = self.id_record_if(any_id) {
                out.push(r);
            }
        }
        if let Some(r) = self.id_record_if(id) {
            out.push(r);
        }
        if id != any_id {
            if id.is_pair() {
                for refinement in [
                    id.with_wildcard_relationship(),
                    id.with_wildcard_target(),
                    wildcard_pair(),
                ] {
                    if refinement != id {
                        if let Some(r) = self.id_record_if(refinement) {
                            out.push(r);
                        }
                    }
                }
            } else if id != Id::component(WILDCARD) {
                if let Some(r) = self.id_record_if(Id::component(WILDCARD)) {
                    out.push(r);
                }
            }
        }
        out
    }
}

/// Handle identifying one registered observer, used to unregister it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObserverHandle {
    pub event: Entity,
    pub id: Id,
    pub kind: MatchKind,
    observer_id: u64,
}

/// Per-event observer index for one world.
pub struct Observable {
    on_add: EventRecord,
    on_remove: EventRecord,
    on_set: EventRecord,
    on_wildcard: EventRecord,
    events: FxHashMap<Entity, EventRecord>,
    next_observer_id: u64,
}

impl Observable {
    pub fn new() -> Self {
        let mut o = Self {
            on_add: EventRecord::default(),
            on_remove: EventRecord::default(),
            on_set: EventRecord::default(),
            on_wildcard: EventRecord::default(),
            events: FxHashMap::default(),
            next_observer_id: 0,
        };
        o.on_add.event = ON_ADD;
        o.on_remove.event = ON_REMOVE;
        o.on_set.event = ON_SET;
        o.on_wildcard.event = WILDCARD;
        o
    }

    pub fn event_record(&self, event: Entity) -> Option<&EventRecord> {
        match event {
            e if e == ON_ADD => Some(&self.on_add),
            e if e == ON_REMOVE => Some(&self.on_remove),
            e if e == ON_SET => Some(&self.on_set),
            e if e == WILDCARD => Some(&self.on_wildcard),
            e => self.events.get(&e),
        }
    }

    pub fn event_record_ensure(&mut self, event: Entity) -> &mut EventRecord {
        match event {
            e if e == ON_ADD => &mut self.on_add,
            e if e == ON_REMOVE => &mut self.on_remove,
            e if e == ON_SET => &mut self.on_set,
            e if e == WILDCARD => &mut self.on_wildcard,
            e => {
                let record = self.events.entry(e).or_default();
                record.event = e;
                record
            }
        }
    }

    /// Event record filtered on having at least one id record, so hot
    /// paths skip events nothing listens to.
    pub fn event_record_if(&self, event: Entity) -> Option<&EventRecord> {
        self.event_record(event).filter(|er| er.has_any_records())
    }

    /// Cheap existence probe used by callers to skip emit entirely.
    pub fn observers_exist(&self, id: Id, event: Entity) -> bool {
        self.event_record_if(event)
            .and_then(|er| er.id_record_if(id))
            .is_some()
    }

    /// Register an observer callback for `(event, id)` in the bucket
    /// selected by `kind`.
    pub fn register(
        &mut self,
        event: Entity,
        id: Id,
        kind: MatchKind,
        callback: Box<dyn FnMut(&EventView<'_>)>,
    ) -> ObserverHandle {
        self.next_observer_id += 1;
        let observer_id = self.next_observer_id;
        let record = self.event_record_ensure(event).ensure_id_record(id);
        record.bucket_mut(kind).observers.push(Rc::new(ObserverCell {
            id: observer_id,
            callback: RefCell::new(callback),
        }));
        record.observer_count += 1;
        ObserverHandle {
            event,
            id,
            kind,
            observer_id,
        }
    }

    /// Unregister a previously registered observer. Releases the id record
    /// when its last observer is removed.
    pub fn unregister(&mut self, handle: ObserverHandle) {
        let er = self.event_record_ensure(handle.event);
        if er.id_record(handle.id).is_none() {
            return;
        }
        let record = er.ensure_id_record(handle.id);
        let bucket = record.bucket_mut(handle.kind);
        if let Some(pos) = bucket
            .observers
            .iter()
            .position(|o| o.id == handle.observer_id)
        {
            bucket.observers.remove(pos);
            record.observer_count -= 1;
            if record.observer_count == 0 {
                er.remove_id_record(handle.id);
            }
        }
    }
}

impl Default for Observable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Observable {
    fn drop(&mut self) {
        // All observers must be unregistered by the world before the index
        // goes away; a live registration here is a lifetime bug upstream.
        debug_assert!(
            !self.on_add.has_any_records()
                && !self.on_remove.has_any_records()
                && !self.on_set.has_any_records()
                && !self.on_wildcard.has_any_records()
                && self.events.values().all(|er| !er.has_any_records()),
            "observable dropped with live observer registrations"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IS_A;

    fn noop() -> Box<dyn FnMut(&EventView<'_>)> {
        Box::new(|_| {})
    }

    #[test]
    fn test_builtin_events_resolve_inline() {
        let mut o = Observable::new();
        assert_eq!(o.event_record(ON_ADD).unwrap().event, ON_ADD);
        assert_eq!(o.event_record_ensure(ON_SET).event, ON_SET);
        assert!(o.event_record_if(ON_ADD).is_none());
    }

    #[test]
    fn test_register_unregister_roundtrip() {
        let mut o = Observable::new();
        let id = Id(100);
        let handle = o.register(ON_ADD, id, MatchKind::SelfUp, noop());
        assert!(o.observers_exist(id, ON_ADD));
        assert!(!o.observers_exist(id, ON_REMOVE));
        o.unregister(handle);
        assert!(!o.observers_exist(id, ON_ADD));
        // Map released, not just emptied.
        assert!(o.event_record(ON_ADD).unwrap().ids.is_none());
    }

    #[test]
    fn test_user_event_goes_through_map() {
        let mut o = Observable::new();
        let event = Entity::from_parts(500, 0);
        let handle = o.register(event, Id(100), MatchKind::SelfOnly, noop());
        assert!(o.observers_exist(Id(100), event));
        o.unregister(handle);
        assert!(!o.observers_exist(Id(100), event));
    }

    #[test]
    fn test_observers_matching_slots() {
        let mut o = Observable::new();
        let rel = Entity::from_parts(100, 0);
        let tgt = Entity::from_parts(200, 0);
        let pair = Id::pair(rel, tgt);

        let h_any = o.register(ON_ADD, Id::component(ANY), MatchKind::SelfUp, noop());
        let h_exact = o.register(ON_ADD, pair, MatchKind::SelfUp, noop());
        let h_first = o.register(ON_ADD, pair.with_wildcard_relationship(), MatchKind::SelfUp, noop());
        let h_second = o.register(ON_ADD, pair.with_wildcard_target(), MatchKind::SelfUp, noop());
        let h_pair = o.register(ON_ADD, wildcard_pair(), MatchKind::SelfUp, noop());

        let er = o.event_record(ON_ADD).unwrap();
        assert_eq!(er.observers_matching(pair).len(), 5);

        // A plain id matches Any, exact and the generic wildcard.
        let h_plain = o.register(ON_ADD, Id::component(IS_A), MatchKind::SelfUp, noop());
        let h_wc = o.register(ON_ADD, Id::component(WILDCARD), MatchKind::SelfUp, noop());
        let er = o.event_record(ON_ADD).unwrap();
        assert_eq!(er.observers_matching(Id::component(IS_A)).len(), 3);

        for h in [h_any, h_exact, h_first, h_second, h_pair, h_plain, h_wc] {
            o.unregister(h);
        }
    }

    #[test]
    fn test_matching_skips_empty_buckets() {
        let mut o = Observable::new();
        let pair = Id::pair(Entity::from_parts(100, 0), Entity::from_parts(200, 0));
        let handle = o.register(ON_ADD, pair, MatchKind::SelfUp, noop());
        let er = o.event_record(ON_ADD).unwrap();
        // Only the exact bucket has observers.
        assert_eq!(er.observers_matching(pair).len(), 1);
        o.unregister(handle);
    }
}
