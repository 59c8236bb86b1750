//! Per-swapchain-image framebuffer arena.
//!
//! Slots are indexed by swapchain image index, created on first use and
//! dropped together when the swapchain is resized.

use crate::error::{RenderError, Result};

/// Number of swapchain images the arena can hold.
pub const FRAMEBUFFER_CACHE_SIZE: usize = 4;

/// Fixed-size arena of lazily created entries.
pub struct FramebufferArena<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for FramebufferArena<T> {
    fn default() -> Self {
        Self::new(FRAMEBUFFER_CACHE_SIZE)
    }
}

impl<T> FramebufferArena<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn check(&self, index: usize) -> Result<()> {
        if index >= self.slots.len() {
            return Err(RenderError::FramebufferIndex {
                index,
                capacity: self.slots.len(),
            });
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Entry at `index`, created with `create` if the slot is empty.
    pub fn get_or_try_insert<F>(&mut self, index: usize, create: F) -> Result<&T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.check(index)?;
        let slot = &mut self.slots[index];
        if let Some(existing) = slot.take() {
            return Ok(slot.insert(existing));
        }
        Ok(slot.insert(create()?))
    }

    /// Drop the entry at `index`, if any.
    pub fn remove(&mut self, index: usize) -> Result<Option<T>> {
        self.check(index)?;
        Ok(self.slots[index].take())
    }

    /// Drop every entry, returning how many were live.
    pub fn invalidate(&mut self) -> usize {
        let live = self.slots.iter().filter(|slot| slot.is_some()).count();
        self.slots.iter_mut().for_each(|slot| *slot = None);
        live
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_once_per_slot() {
        let mut arena = FramebufferArena::default();
        let mut created = 0;
        for _ in 0..3 {
            let value = arena
                .get_or_try_insert(2, || {
                    created += 1;
                    Ok(42)
                })
                .unwrap();
            assert_eq!(*value, 42);
        }
        assert_eq!(created, 1);
        assert_eq!(arena.live(), 1);
        assert!(arena.get(1).is_none());
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let mut arena = FramebufferArena::<u32>::default();
        let err = arena.get_or_try_insert(FRAMEBUFFER_CACHE_SIZE, || Ok(0)).unwrap_err();
        assert!(matches!(
            err,
            RenderError::FramebufferIndex {
                index: 4,
                capacity: 4
            }
        ));
        assert!(arena.remove(7).is_err());
    }

    #[test]
    fn failed_creation_leaves_slot_empty() {
        let mut arena = FramebufferArena::<u32>::new(2);
        let result = arena.get_or_try_insert(0, || Err(RenderError::MissingResource("depth")));
        assert!(result.is_err());
        assert!(arena.get(0).is_none());
    }

    #[test]
    fn invalidate_drops_everything() {
        let mut arena = FramebufferArena::new(4);
        for index in 0..3 {
            arena.get_or_try_insert(index, || Ok(index)).unwrap();
        }
        assert_eq!(arena.invalidate(), 3);
        assert_eq!(arena.live(), 0);
        assert_eq!(arena.invalidate(), 0);

        let mut recreated = false;
        arena
            .get_or_try_insert(0, || {
                recreated = true;
                Ok(9)
            })
            .unwrap();
        assert!(recreated);
    }

    #[test]
    fn remove_returns_entry() {
        let mut arena = FramebufferArena::new(2);
        arena.get_or_try_insert(1, || Ok("fb")).unwrap();
        assert_eq!(arena.remove(1).unwrap(), Some("fb"));
        assert_eq!(arena.remove(1).unwrap(), None);
    }
}
