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

//! Entity and id encoding.
//!
//! An `Entity` packs a 32-bit slot index and a 16-bit generation into a
//! `u64`. An `Id` identifies what a table column stores: either a plain
//! component/tag (the entity index of the component entity) or a
//! relationship pair `(relationship, target)` with the pair flag set.
//! Generations are stripped from ids so that a recycled component entity
//! never silently changes a table signature.

use serde::{Deserialize, Serialize};
use std::fmt;

const INDEX_MASK: u64 = 0xFFFF_FFFF;
const GENERATION_SHIFT: u64 = 32;
const GENERATION_MASK: u64 = 0xFFFF;

/// Flag bit marking an id as a relationship pair.
pub const PAIR_FLAG: u64 = 1 << 63;

/// Handle to an entity slot plus its generation. The default value is the
/// null entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Entity(pub(crate) u64);

impl Entity {
    pub(crate) fn from_parts(index: u32, generation: u16) -> Self {
        Self(u64::from(index) | (u64::from(generation) << GENERATION_SHIFT))
    }

    /// Slot index in the entity index.
    pub fn index(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }

    /// Generation of the slot this handle was created for.
    pub fn generation(self) -> u16 {
        ((self.0 >> GENERATION_SHIFT) & GENERATION_MASK) as u16
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index(), self.generation())
    }
}

/// Id of a component, tag, or relationship pair as stored in a table type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(pub(crate) u64);

impl Id {
    /// Id for a plain component or tag entity. Strips the generation.
    pub fn component(entity: Entity) -> Self {
        Self(u64::from(entity.index()))
    }

    /// Id for a plain component by slot index.
    pub(crate) fn from_index(index: u32) -> Self {
        Self(u64::from(index))
    }

    /// Id for a relationship pair `(relationship, target)`.
    pub fn pair(relationship: Entity, target: Entity) -> Self {
        Self(PAIR_FLAG | (u64::from(relationship.index()) << 32) | u64::from(target.index()))
    }

    pub fn is_pair(self) -> bool {
        self.0 & PAIR_FLAG != 0
    }

    /// Relationship half of a pair id (index only).
    pub fn first(self) -> u32 {
        debug_assert!(self.is_pair());
        ((self.0 & !PAIR_FLAG) >> 32) as u32
    }

    /// Target half of a pair id (index only).
    pub fn second(self) -> u32 {
        debug_assert!(self.is_pair());
        (self.0 & INDEX_MASK) as u32
    }

    /// True for the `Wildcard` id, `(X, *)`, `(*, X)` and `(*, *)`.
    pub fn is_wildcard(self) -> bool {
        if self.is_pair() {
            self.first() == WILDCARD.index() || self.second() == WILDCARD.index()
        } else {
            self == Id::component(WILDCARD)
        }
    }

    /// Replace the target half with the wildcard.
    pub fn with_wildcard_target(self) -> Id {
        debug_assert!(self.is_pair());
        Id(self.0 & !INDEX_MASK | u64::from(WILDCARD.index()))
    }

    /// Replace the relationship half with the wildcard.
    pub fn with_wildcard_relationship(self) -> Id {
        debug_assert!(self.is_pair());
        Id(PAIR_FLAG | (u64::from(WILDCARD.index()) << 32) | u64::from(self.second()))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_pair() {
            write!(f, "Id({}, {})", self.first(), self.second())
        } else {
            write!(f, "Id({})", self.0)
        }
    }
}

// Builtin entities live at fixed low slot indices, reserved by the world at
// startup. Generation is always zero for builtins.
macro_rules! builtin {
    ($(#[$doc:meta] $name:ident = $index:expr;)*) => {
        $(
            #[$doc]
            pub const $name: Entity = Entity($index);
        )*
    };
}

builtin! {
    /// Matches any id half, including during event dispatch.
    WILDCARD = 1;
    /// Matches everything, including empty/tag ids.
    ANY = 2;
    /// Emitted after an id was added to an entity.
    ON_ADD = 3;
    /// Emitted before an id is removed from an entity.
    ON_REMOVE = 4;
    /// Emitted after a component value was written.
    ON_SET = 5;
    /// Inheritance-like traversable relationship ("instance of").
    IS_A = 6;
    /// Containment relationship used for prefab child hierarchies.
    CHILD_OF = 7;
}

/// First slot index handed out to user entities.
pub(crate) const FIRST_USER_INDEX: u32 = 64;

/// Id of the `(Wildcard, Wildcard)` pair.
pub fn wildcard_pair() -> Id {
    Id::pair(WILDCARD, WILDCARD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_parts_roundtrip() {
        let e = Entity::from_parts(1234, 7);
        assert_eq!(e.index(), 1234);
        assert_eq!(e.generation(), 7);
    }

    #[test]
    fn test_pair_halves() {
        let rel = Entity::from_parts(100, 3);
        let tgt = Entity::from_parts(200, 9);
        let id = Id::pair(rel, tgt);
        assert!(id.is_pair());
        assert_eq!(id.first(), 100);
        assert_eq!(id.second(), 200);
    }

    #[test]
    fn test_component_id_strips_generation() {
        let a = Entity::from_parts(55, 0);
        let b = Entity::from_parts(55, 4);
        assert_eq!(Id::component(a), Id::component(b));
    }

    #[test]
    fn test_wildcard_detection() {
        let rel = Entity::from_parts(100, 0);
        assert!(!Id::pair(rel, rel).is_wildcard());
        assert!(Id::pair(WILDCARD, rel).is_wildcard());
        assert!(Id::pair(rel, WILDCARD).is_wildcard());
        assert!(wildcard_pair().is_wildcard());
        assert!(Id::component(WILDCARD).is_wildcard());
        assert!(!Id::component(ANY).is_wildcard());
    }

    #[test]
    fn test_wildcard_refinements() {
        let rel = Entity::from_parts(100, 0);
        let tgt = Entity::from_parts(200, 0);
        let id = Id::pair(rel, tgt);
        assert_eq!(id.with_wildcard_target(), Id::pair(rel, WILDCARD));
        assert_eq!(id.with_wildcard_relationship(), Id::pair(WILDCARD, tgt));
    }
}
