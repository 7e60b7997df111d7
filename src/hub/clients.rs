//! Slot arena holding the clients of a hub

use std::fmt;

/// Handle to a client slot
///
/// The generation changes every time a slot is reused, so an id kept after
/// its client was removed never resolves to another client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    index: u32,
    generation: u32,
}

impl ClientId {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational slot arena
///
/// Iteration is in slot order. Removal only empties a slot, so ids of other
/// entries stay valid and removing while walking the ids is safe.
pub struct ClientSet<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for ClientSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ClientSet<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store a value, reusing a free slot when there is one
    pub fn insert(&mut self, value: T) -> ClientId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            return ClientId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ClientId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: ClientId) -> Option<&T> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Take a value out of the set; stale ids return `None`
    pub fn remove(&mut self, id: ClientId) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    /// Ids of all entries, in slot order
    pub fn ids(&self) -> Vec<ClientId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    ClientId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ClientId, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.value.as_mut().map(|value| {
                (
                    ClientId {
                        index: index as u32,
                        generation,
                    },
                    value,
                )
            })
        })
    }

    /// Keep only the entries for which `keep` returns true
    ///
    /// Returns the removed entries with their ids, in slot order.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<(ClientId, T)>
    where
        F: FnMut(ClientId, &mut T) -> bool,
    {
        let mut removed = Vec::new();
        for id in self.ids() {
            let drop_it = match self.get_mut(id) {
                Some(value) => !keep(id, value),
                None => false,
            };
            if drop_it {
                if let Some(value) = self.remove(id) {
                    removed.push((id, value));
                }
            }
        }
        removed
    }

    /// Remove every entry, returning them in slot order
    pub fn clear(&mut self) -> Vec<T> {
        let ids = self.ids();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut set = ClientSet::new();
        let a = set.insert("a");
        let b = set.insert("b");
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(a), Some(&"a"));
        assert_eq!(set.get(b), Some(&"b"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_stale_id_never_resolves() {
        let mut set = ClientSet::new();
        let old = set.insert(1);
        assert_eq!(set.remove(old), Some(1));
        let new = set.insert(2);

        // same slot, new generation
        assert_eq!(old.index(), new.index());
        assert_eq!(set.get(old), None);
        assert_eq!(set.remove(old), None);
        assert_eq!(set.get(new), Some(&2));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_removal_during_iteration() {
        let mut set = ClientSet::new();
        let ids: Vec<_> = (0..6).map(|i| set.insert(i)).collect();

        let mut visited = Vec::new();
        for id in set.ids() {
            let Some(&value) = set.get(id) else {
                continue;
            };
            visited.push(value);
            // removing the current and the next entry must not disturb the walk
            set.remove(id);
            if value == 2 {
                set.remove(ids[3]);
            }
        }

        assert_eq!(visited, vec![0, 1, 2, 4, 5]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_retain_reports_removed_entries() {
        let mut set = ClientSet::new();
        for i in 0..5 {
            set.insert(i);
        }
        let removed = set.retain(|_, value| *value % 2 == 0);
        let removed: Vec<_> = removed.into_iter().map(|(_, v)| v).collect();
        assert_eq!(removed, vec![1, 3]);

        let left: Vec<_> = set.iter().map(|(_, v)| *v).collect();
        assert_eq!(left, vec![0, 2, 4]);
    }

    #[test]
    fn test_clear() {
        let mut set = ClientSet::new();
        let a = set.insert('a');
        set.insert('b');
        assert_eq!(set.clear(), vec!['a', 'b']);
        assert!(set.is_empty());
        assert!(set.get(a).is_none());

        for (_, value) in set.iter_mut() {
            *value = 'z';
        }
        assert_eq!(set.ids().len(), 0);
    }
}
