use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

/// Generation-checked reference to an object stored in a [`Pool`].
///
/// Releasing a slot bumps its generation, so a handle kept past its
/// release no longer resolves.
pub struct Handle<T> {
    pub slot: u16,
    pub generation: u16,
    phantom: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub fn new(slot: u16, generation: u16) -> Self {
        Self {
            slot,
            generation,
            phantom: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

pub struct Pool<T> {
    items: Vec<Option<T>>,
    empty: Vec<usize>,
    generation: Vec<u16>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        const INITIAL_SIZE: usize = 1024;
        Self::new(INITIAL_SIZE)
    }
}

impl<T> Pool<T> {
    pub fn new(initial_size: usize) -> Self {
        let initial_size = initial_size.min(u16::MAX as usize + 1);
        let mut p = Pool {
            items: Vec::with_capacity(initial_size),
            // Reversed so the lowest slot is handed out first.
            empty: (0..initial_size).rev().collect(),
            generation: vec![0; initial_size],
        };
        p.items.resize_with(initial_size, || None);
        p
    }

    /// Stores `item`, or hands it back when every slot is occupied.
    pub fn insert(&mut self, item: T) -> Result<Handle<T>, T> {
        let empty_slot = match self.empty.pop() {
            Some(slot) => slot,
            None => return Err(item),
        };

        self.items[empty_slot] = Some(item);
        Ok(Handle::new(empty_slot as u16, self.generation[empty_slot]))
    }

    /// Removes the object behind `item` and invalidates every copy of the handle.
    pub fn take(&mut self, item: Handle<T>) -> Option<T> {
        let slot = item.slot as usize;
        if !self.is_live(item) {
            return None;
        }

        let value = self.items[slot].take();
        self.generation[slot] = self.generation[slot].wrapping_add(1);
        self.empty.push(slot);
        value
    }

    pub fn release(&mut self, item: Handle<T>) {
        let _ = self.take(item);
    }

    pub fn is_live(&self, item: Handle<T>) -> bool {
        let slot = item.slot as usize;
        slot < self.items.len()
            && self.generation[slot] == item.generation
            && self.items[slot].is_some()
    }

    pub fn get_ref(&self, item: Handle<T>) -> Option<&T> {
        if !self.is_live(item) {
            return None;
        }
        self.items[item.slot as usize].as_ref()
    }

    pub fn get_mut_ref(&mut self, item: Handle<T>) -> Option<&mut T> {
        if !self.is_live(item) {
            return None;
        }
        self.items[item.slot as usize].as_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len() - self.empty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every live object, invalidating all outstanding handles.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        for slot in 0..self.items.len() {
            if let Some(value) = self.items[slot].take() {
                self.generation[slot] = self.generation[slot].wrapping_add(1);
                self.empty.push(slot);
                out.push(value);
            }
        }
        out
    }

    pub fn for_each_occupied<F>(&self, mut func: F)
    where
        F: FnMut(&T),
    {
        for item in self.items.iter().flatten() {
            func(item);
        }
    }
}
