//! Opaque handles and generation-counted registries
//!
//! Every native-backed object is addressed by a [`Handle`]. Handles are
//! never reused: a registry slot can be recycled, but its generation is
//! bumped on every removal, so a stale handle to a recycled slot does not
//! resolve. Slots whose generation would wrap are retired.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque reference to a native or session-owned object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(u64);

impl Handle {
    /// The distinguished invalid handle
    pub const INVALID: Handle = Handle(0);

    /// Wrap a raw value
    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// Raw value
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is anything other than the invalid sentinel.
    ///
    /// This says nothing about liveness; ask the owning registry for that.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    fn pack(index: u32, generation: u32) -> Self {
        Handle(((generation as u64) << 32) | index as u64)
    }

    fn index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl Default for Handle {
    fn default() -> Self {
        Handle::INVALID
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "#{}v{}", self.index(), self.generation())
        } else {
            f.write_str("#invalid")
        }
    }
}

/// Monotonic handle source for objects kept outside a [`Registry`]
#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    /// Create an allocator whose first handle is `1`
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh, never-before-seen handle
    pub fn allocate(&self) -> Handle {
        Handle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed key usable with a [`Registry`]
pub trait RegistryKey: Copy + Eq + fmt::Debug {
    /// Build the key from its handle
    fn from_handle(handle: Handle) -> Self;
    /// Underlying handle
    fn handle(self) -> Handle;
}

impl RegistryKey for Handle {
    fn from_handle(handle: Handle) -> Self {
        handle
    }

    fn handle(self) -> Handle {
        self
    }
}

/// Declare a typed id wrapping a [`Handle`]
#[macro_export]
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name($crate::handle::Handle);

        impl $name {
            /// Underlying handle
            pub fn handle(self) -> $crate::handle::Handle {
                self.0
            }
        }

        impl $crate::handle::RegistryKey for $name {
            fn from_handle(handle: $crate::handle::Handle) -> Self {
                $name(handle)
            }

            fn handle(self) -> $crate::handle::Handle {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", stringify!($name), self.0)
            }
        }
    };
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot map with generation counters
#[derive(Debug)]
pub struct Registry<K: RegistryKey, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    _key: PhantomData<K>,
}

impl<K: RegistryKey, T> Registry<K, T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _key: PhantomData,
        }
    }

    /// Insert a value and return its key
    pub fn insert(&mut self, value: T) -> K {
        self.insert_with(|_| value)
    }

    /// Insert a value that needs to know its own key
    pub fn insert_with(&mut self, make: impl FnOnce(K) -> T) -> K {
        let (index, generation) = match self.free.pop() {
            Some(index) => (index, self.slots[index as usize].generation),
            None => {
                // generations start at 1, so no packed handle is ever INVALID
                self.slots.push(Slot {
                    generation: 1,
                    value: None,
                });
                ((self.slots.len() - 1) as u32, 1)
            }
        };

        let key = K::from_handle(Handle::pack(index, generation));
        self.slots[index as usize].value = Some(make(key));
        self.len += 1;
        key
    }

    fn slot(&self, key: K) -> Option<&Slot<T>> {
        let handle = key.handle();
        if !handle.is_valid() {
            return None;
        }
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
    }

    /// Whether the key refers to a live entry
    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Borrow an entry
    pub fn get(&self, key: K) -> Option<&T> {
        self.slot(key).and_then(|slot| slot.value.as_ref())
    }

    /// Mutably borrow an entry
    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let handle = key.handle();
        if !handle.is_valid() {
            return None;
        }
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    /// Remove an entry, invalidating its key forever
    pub fn remove(&mut self, key: K) -> Option<T> {
        let handle = key.handle();
        if self.slot(key).is_none() {
            return None;
        }
        let index = handle.index();
        let slot = &mut self.slots[index];
        let value = slot.value.take()?;
        self.len -= 1;

        if slot.generation < u32::MAX - 1 {
            slot.generation += 1;
            self.free.push(index as u32);
        }
        Some(value)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no live entries
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Keys of all live entries, in slot order
    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(key, _)| key).collect()
    }

    /// Iterate over live entries
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (K::from_handle(Handle::pack(index as u32, slot.generation)), value))
        })
    }

    /// Mutably iterate over live entries
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| {
                let generation = slot.generation;
                slot.value
                    .as_mut()
                    .map(|value| (K::from_handle(Handle::pack(index as u32, generation)), value))
            })
    }
}

impl<K: RegistryKey, T> Default for Registry<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    define_id!(
        /// Test id
        ThingId
    );

    #[test]
    fn test_invalid_handle_never_resolves() {
        let mut registry: Registry<Handle, u32> = Registry::new();
        registry.insert(1);
        assert!(registry.get(Handle::INVALID).is_none());
        assert!(!Handle::INVALID.is_valid());
        assert_eq!(Handle::default(), Handle::INVALID);
    }

    #[test]
    fn test_removed_handle_is_not_reused() {
        let mut registry: Registry<ThingId, &str> = Registry::new();
        let first = registry.insert("first");
        assert_eq!(registry.remove(first), Some("first"));

        let second = registry.insert("second");
        assert_ne!(first, second);
        assert!(registry.get(first).is_none());
        assert_eq!(registry.get(second), Some(&"second"));
        assert!(registry.remove(first).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_insert_with_sees_own_key() {
        let mut registry: Registry<ThingId, ThingId> = Registry::new();
        let key = registry.insert_with(|key| key);
        assert_eq!(registry.get(key), Some(&key));
    }

    #[test]
    fn test_iteration_order_and_len() {
        let mut registry: Registry<Handle, u32> = Registry::new();
        let a = registry.insert(1);
        let b = registry.insert(2);
        let c = registry.insert(3);
        registry.remove(b);

        assert_eq!(registry.keys(), vec![a, c]);
        for (_, value) in registry.iter_mut() {
            *value *= 10;
        }
        let values: Vec<u32> = registry.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![10, 30]);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_allocator_is_monotonic() {
        let allocator = HandleAllocator::new();
        let a = allocator.allocate();
        let b = allocator.allocate();
        assert!(a.is_valid());
        assert!(b > a);
    }
}
