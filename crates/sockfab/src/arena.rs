// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Slot arena keyed by stable `u32` indices.
//!
//! Endpoints, passive endpoints and connection handles are stored here so
//! the poll set can refer to them by index (packed into a poll token)
//! instead of by pointer. Freed slots are reused; every slot carries a
//! generation that is bumped on removal, so a handle holding
//! `(index, generation)` never resolves to a later occupant.

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    fn vacant(&mut self) -> u32 {
        match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> u32 {
        let index = self.vacant();
        self.slots[index as usize].value = Some(value);
        index
    }

    /// Insert a value that needs to know its own index and generation.
    pub(crate) fn insert_with(&mut self, make: impl FnOnce(u32, u32) -> T) -> u32 {
        let index = self.vacant();
        let slot = &mut self.slots[index as usize];
        slot.value = Some(make(index, slot.generation));
        index
    }

    pub(crate) fn get(&self, index: u32) -> Option<&T> {
        self.slots.get(index as usize)?.value.as_ref()
    }

    pub(crate) fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        self.slots.get_mut(index as usize)?.value.as_mut()
    }

    /// Generation of the value currently in `index`.
    pub(crate) fn generation(&self, index: u32) -> u32 {
        self.slots.get(index as usize).map_or(0, |slot| slot.generation)
    }

    /// Like [`Arena::get_mut`], but only while the slot still holds the
    /// value inserted at `generation`.
    pub(crate) fn get_mut_at(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub(crate) fn remove(&mut self, index: u32) -> Option<T> {
        let slot = self.slots.get_mut(index as usize)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        Some(value)
    }

    pub(crate) fn remove_at(&mut self, index: u32, generation: u32) -> Option<T> {
        if self.slots.get(index as usize)?.generation != generation {
            return None;
        }
        self.remove(index)
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }

    pub(crate) fn indices(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_reuse() {
        let mut arena = Arena::default();
        let a = arena.insert("a");
        let b = arena.insert_with(|i, _| if i == 1 { "b" } else { "?" });
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);

        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.remove(a), None);
        assert!(arena.get(a).is_none());

        let c = arena.insert("c");
        assert_eq!(c, a);
        assert_eq!(arena.indices(), vec![0, 1]);
        assert_eq!(arena.values().copied().collect::<Vec<_>>(), vec!["c", "b"]);
    }

    #[test]
    fn test_stale_generation_is_refused() {
        let mut arena = Arena::default();
        let mut first = None;
        let a = arena.insert_with(|i, generation| {
            first = Some(generation);
            (i, generation)
        });
        let first = first.unwrap();
        assert!(arena.get_mut_at(a, first).is_some());

        assert!(arena.remove_at(a, first).is_some());
        let b = arena.insert_with(|i, generation| (i, generation));
        assert_eq!(a, b);
        let (_, second) = *arena.get(b).unwrap();
        assert_ne!(first, second);
        assert_eq!(arena.generation(b), second);

        assert!(arena.get_mut_at(b, first).is_none());
        assert!(arena.remove_at(b, first).is_none());
        assert_eq!(arena.get_mut_at(b, second), Some(&mut (b, second)));
    }
}
