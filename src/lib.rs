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

//! Pulse ECS - Archetype entity-component storage with relationship-aware
//! event propagation.
//!
//! Entities sharing an id set live together in tables; mutations move
//! entities between tables and feed the emit pipeline, which dispatches to
//! observers, forwards events along traversable relationships (prefab-style
//! inheritance) and propagates changes to dependent entities through a
//! lazily invalidated reachability cache.

pub mod component;
pub mod component_index;
pub mod emit;
pub mod entity_index;
pub mod error;
pub mod id;
pub mod observable;
pub mod prelude;
pub mod table;
pub mod vec;
pub mod world;


pub use component::*;
pub use component_index::*;
pub use emit::*;
pub use entity_index::*;
pub use error::*;
pub use id::*;
pub use observable::*;
pub use table::*;
pub use vec::*;
pub use world::*;
