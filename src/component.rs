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

//! Component trait, erased type info and per-id flags.

use std::fmt;

/// Marker trait for components.
///
/// Components must be 'static (no borrowed data). Typed registration
/// additionally requires `Default` (value for freshly added columns) and
/// `Clone` (prefab instantiation copies).
pub trait Component: 'static + Send + Sync {}

/// Automatically implement Component for all valid types
impl<T: 'static + Send + Sync> Component for T {}

/// Erased lifecycle hooks for one component type.
#[derive(Clone, Copy)]
pub struct TypeInfo {
    pub size: usize,
    pub align: usize,
    pub type_name: &'static str,
    drop_fn: Option<unsafe fn(*mut u8)>,
    default_fn: unsafe fn(*mut u8),
    clone_fn: unsafe fn(*const u8, *mut u8),
}

impl TypeInfo {
    pub fn of<T: Component + Default + Clone>() -> Self {
        Self {
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            type_name: std::any::type_name::<T>(),
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(|ptr| unsafe {
                    std::ptr::drop_in_place(ptr as *mut T);
                })
            } else {
                None
            },
            default_fn: |ptr| unsafe {
                std::ptr::write(ptr as *mut T, T::default());
            },
            clone_fn: |src, dst| unsafe {
                let value = (*(src as *const T)).clone();
                std::ptr::write(dst as *mut T, value);
            },
        }
    }

    /// # Safety
    /// `ptr` must point at a live value of this type.
    pub unsafe fn drop_one(&self, ptr: *mut u8) {
        if let Some(drop_fn) = self.drop_fn {
            drop_fn(ptr);
        }
    }

    /// # Safety
    /// `ptr` must point at uninitialized storage of this type's layout.
    pub unsafe fn write_default(&self, ptr: *mut u8) {
        (self.default_fn)(ptr);
    }

    /// # Safety
    /// `src` must point at a live value; `dst` at uninitialized storage.
    pub unsafe fn clone_into(&self, src: *const u8, dst: *mut u8) {
        (self.clone_fn)(src, dst);
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("type_name", &self.type_name)
            .field("size", &self.size)
            .finish()
    }
}

/// Behavior of a component when an entity inherits from a base that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnInstantiate {
    /// Component stays on the base and is visible through forwarding.
    Inherit,
    /// Component is copied onto the instance when the relationship is added.
    Override,
    /// Component is neither forwarded nor copied.
    DontInherit,
}

/// Per-id flag set stored on component records.
///
/// The flag layout is closed; relationship traits set bits here through the
/// world API and the emit pipeline branches on them.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ComponentFlags(u32);

impl ComponentFlags {
    pub const TRAVERSABLE: ComponentFlags = ComponentFlags(1 << 0);
    pub const SPARSE: ComponentFlags = ComponentFlags(1 << 1);
    pub const DONT_FRAGMENT: ComponentFlags = ComponentFlags(1 << 2);
    pub const EXCLUSIVE: ComponentFlags = ComponentFlags(1 << 3);
    pub const PAIR_IS_TAG: ComponentFlags = ComponentFlags(1 << 4);
    pub const ON_INSTANTIATE_INHERIT: ComponentFlags = ComponentFlags(1 << 5);
    pub const ON_INSTANTIATE_OVERRIDE: ComponentFlags = ComponentFlags(1 << 6);
    pub const ON_INSTANTIATE_DONT_INHERIT: ComponentFlags = ComponentFlags(1 << 7);

    pub fn empty() -> Self {
        ComponentFlags(0)
    }

    pub fn contains(self, other: ComponentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ComponentFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ComponentFlags) {
        self.0 &= !other.0;
    }

    pub fn on_instantiate(self) -> OnInstantiate {
        if self.contains(Self::ON_INSTANTIATE_OVERRIDE) {
            OnInstantiate::Override
        } else if self.contains(Self::ON_INSTANTIATE_DONT_INHERIT) {
            OnInstantiate::DontInherit
        } else {
            OnInstantiate::Inherit
        }
    }
}

impl std::ops::BitOr for ComponentFlags {
    type Output = ComponentFlags;
    fn bitor(self, rhs: ComponentFlags) -> ComponentFlags {
        ComponentFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for ComponentFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentFlags({:#010b})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_insert_remove() {
        let mut flags = ComponentFlags::empty();
        flags.insert(ComponentFlags::TRAVERSABLE);
        flags.insert(ComponentFlags::EXCLUSIVE);
        assert!(flags.contains(ComponentFlags::TRAVERSABLE));
        assert!(flags.contains(ComponentFlags::EXCLUSIVE));
        flags.remove(ComponentFlags::EXCLUSIVE);
        assert!(!flags.contains(ComponentFlags::EXCLUSIVE));
    }

    #[test]
    fn test_on_instantiate_default_is_inherit() {
        assert_eq!(ComponentFlags::empty().on_instantiate(), OnInstantiate::Inherit);
        let mut flags = ComponentFlags::empty();
        flags.insert(ComponentFlags::ON_INSTANTIATE_OVERRIDE);
        assert_eq!(flags.on_instantiate(), OnInstantiate::Override);
    }

    #[test]
    fn test_type_info_default_and_clone() {
        #[derive(Default, Clone, PartialEq, Debug)]
        struct Health(u32);

        let ti = TypeInfo::of::<Health>();
        assert_eq!(ti.size, std::mem::size_of::<Health>());

        let mut a = std::mem::MaybeUninit::<Health>::uninit();
        unsafe {
            ti.write_default(a.as_mut_ptr() as *mut u8);
            assert_eq!(a.assume_init_ref(), &Health(0));
        }

        let src = Health(42);
        let mut b = std::mem::MaybeUninit::<Health>::uninit();
        unsafe {
            ti.clone_into(&src as *const Health as *const u8, b.as_mut_ptr() as *mut u8);
            assert_eq!(b.assume_init(), Health(42));
        }
    }
}
