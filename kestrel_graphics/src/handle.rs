//! Generation-tagged handles and the dense pools they index into.

/// Opaque reference to a pool slot. A handle stays valid until the slot is
/// freed; freeing bumps the slot generation so stale copies can be detected
/// in O(1).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub const INVALID: Handle = Handle {
        index: u32::MAX,
        generation: u32::MAX,
    };

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::INVALID
    }
}

struct Slot<T> {
    element: Option<T>,
    generation: u32,
}

/// Dense storage addressed by [`Handle`]. Slots are reused LIFO, with the
/// generation bumped on every free so old handles never alias new elements.
pub struct HandlePool<T> {
    slots: Vec<Slot<T>>,
    free_indices: Vec<u32>,
    live_count: usize,
}

impl<T> HandlePool<T> {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut free_indices = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                element: None,
                generation: 0,
            });
            free_indices.push((capacity - 1 - i) as u32);
        }

        Self {
            slots,
            free_indices,
            live_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn is_full(&self) -> bool {
        self.live_count == self.slots.len()
    }

    pub fn allocate(&mut self, element: T) -> Handle {
        let Some(index) = self.free_indices.pop() else {
            return Handle::INVALID;
        };

        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.element = Some(element);
        self.live_count += 1;

        Handle {
            index,
            generation: slot.generation,
        }
    }

    pub fn is_valid(&self, handle: Handle) -> bool {
        self.slot(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slot(handle).and_then(|slot| slot.element.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot_live = self.slot(handle).is_some();
        if !slot_live {
            return None;
        }
        self.slots[handle.index as usize].element.as_mut()
    }

    /// Removes the element, returning it to the caller. The slot generation
    /// is bumped so `handle` (and any copy of it) goes stale immediately.
    pub fn free(&mut self, handle: Handle) -> Option<T> {
        self.slot(handle)?;

        let slot = &mut self.slots[handle.index as usize];
        let element = slot.element.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free_indices.push(handle.index);
        self.live_count -= 1;

        element
    }

    /// Swaps in a new element at the same index, returning the previous
    /// element together with the re-generated handle for the slot.
    pub fn replace(&mut self, handle: Handle, element: T) -> Option<(T, Handle)> {
        self.slot(handle)?;

        let slot = &mut self.slots[handle.index as usize];
        let previous = slot.element.replace(element)?;
        slot.generation = slot.generation.wrapping_add(1);

        Some((
            previous,
            Handle {
                index: handle.index,
                generation: slot.generation,
            },
        ))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.element.as_ref().map(|element| {
                (
                    Handle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    element,
                )
            })
        })
    }

    fn slot(&self, handle: Handle) -> Option<&Slot<T>> {
        if !handle.is_valid() {
            return None;
        }

        let slot = self.slots.get(handle.index as usize)?;
        if slot.element.is_none() || slot.generation != handle.generation {
            return None;
        }

        Some(slot)
    }
}

/// Bounded LIFO allocator of u32 indices, used for bindless descriptor array
/// slots. Double frees are rejected and trip an assertion in debug builds.
pub struct FreeIndexAllocator {
    free_indices: Vec<u32>,
    live: Vec<bool>,
}

impl FreeIndexAllocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            free_indices: (0..capacity).rev().collect(),
            live: vec![false; capacity as usize],
        }
    }

    pub fn free_count(&self) -> usize {
        self.free_indices.len()
    }

    pub fn allocate(&mut self) -> Option<u32> {
        let index = self.free_indices.pop()?;
        self.live[index as usize] = true;
        Some(index)
    }

    pub fn free(&mut self, index: u32) -> bool {
        let Some(live) = self.live.get_mut(index as usize) else {
            debug_assert!(false, "Index {} is out of allocator bounds", index);
            return false;
        };
        if !*live {
            debug_assert!(false, "Index {} freed twice", index);
            return false;
        }

        *live = false;
        self.free_indices.push(index);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_rejected_after_free() {
        let mut pool = HandlePool::new(4);
        let handle = pool.allocate(7u32);
        assert_eq!(pool.get(handle), Some(&7));

        pool.free(handle);
        assert_eq!(pool.get(handle), None);
        assert!(!pool.is_valid(handle));
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut pool = HandlePool::new(2);
        let first = pool.allocate(1u32);
        pool.free(first);

        let second = pool.allocate(2u32);
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);
        assert_eq!(pool.get(first), None);
        assert_eq!(pool.get(second), Some(&2));
    }

    #[test]
    fn replace_keeps_index_and_bumps_generation() {
        let mut pool = HandlePool::new(2);
        let handle = pool.allocate(10u32);

        let (previous, new_handle) = pool.replace(handle, 20).unwrap();
        assert_eq!(previous, 10);
        assert_eq!(new_handle.index(), handle.index());
        assert_ne!(new_handle, handle);
        assert_eq!(pool.get(handle), None);
        assert_eq!(pool.get(new_handle), Some(&20));
    }

    #[test]
    fn pool_reports_full() {
        let mut pool = HandlePool::new(2);
        pool.allocate(0u32);
        pool.allocate(1u32);
        assert!(pool.is_full());
        assert_eq!(pool.allocate(2u32), Handle::INVALID);
    }

    #[test]
    fn iteration_yields_live_slots_only() {
        let mut pool = HandlePool::new(4);
        let a = pool.allocate(1u32);
        let b = pool.allocate(2u32);
        pool.allocate(3u32);
        pool.free(b);

        let live = pool.iter().map(|(_, v)| *v).collect::<Vec<_>>();
        assert_eq!(live, vec![1, 3]);
        assert!(pool.iter().any(|(h, _)| h == a));
    }

    #[test]
    fn index_allocator_round_trip() {
        let mut alloc = FreeIndexAllocator::new(8);
        let before = alloc.free_count();

        let index = alloc.allocate().unwrap();
        assert_eq!(alloc.free_count(), before - 1);
        assert!(alloc.free(index));
        assert_eq!(alloc.free_count(), before);
    }

    #[test]
    fn index_allocator_exhausts() {
        let mut alloc = FreeIndexAllocator::new(2);
        assert!(alloc.allocate().is_some());
        assert!(alloc.allocate().is_some());
        assert!(alloc.allocate().is_none());
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn index_allocator_rejects_double_free() {
        let mut alloc = FreeIndexAllocator::new(2);
        let index = alloc.allocate().unwrap();
        assert!(alloc.free(index));
        assert!(!alloc.free(index));
    }
}
