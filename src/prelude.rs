//! Convenient re-exports of commonly used types.
//!
//! The prelude can be imported with:
//! ```
//! use pulse_ecs::prelude::*;
//! ```

pub use crate::component::{Component, OnInstantiate};
pub use crate::emit::{EventDesc, EventFlags, EventView};
pub use crate::error::{EcsError, Result};
pub use crate::id::{Entity, Id, ANY, CHILD_OF, IS_A, ON_ADD, ON_REMOVE, ON_SET, WILDCARD};
pub use crate::observable::{MatchKind, ObserverHandle};
pub use crate::world::{EntityBatch, World};
