//! Purpose: Generational slot table keyed by small reusable integer ids.
//! Exports: `SlotTable`, `SlotKey`.
//! Role: Backing store of the context registry.
//! Invariants: Id 0 is never issued; ids are unique among occupied slots.
//! Invariants: A slot's generation bumps on every reclaim, so stale keys never resolve.
//! Invariants: Retiring slots are invisible to lookups but keep their id reserved.

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SlotKey {
    pub id: u32,
    pub generation: u32,
}

enum SlotState<T> {
    Vacant,
    Occupied(T),
    Retiring,
}

struct Slot<T> {
    generation: u32,
    state: SlotState<T>,
}

pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    occupied: usize,
    capacity: u32,
}

impl<T> SlotTable<T> {
    pub fn with_capacity_limit(capacity: u32) -> Self {
        Self {
            // Index 0 is a permanent placeholder so id 0 stays invalid.
            slots: vec![Slot {
                generation: 0,
                state: SlotState::Vacant,
            }],
            free: Vec::new(),
            occupied: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.occupied
    }

    /// Inserts a value built from its key; `None` when the table is full.
    pub fn insert_with(&mut self, build: impl FnOnce(SlotKey) -> T) -> Option<SlotKey> {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let next = u32::try_from(self.slots.len()).ok()?;
                if next > self.capacity {
                    return None;
                }
                self.slots.push(Slot {
                    generation: 0,
                    state: SlotState::Vacant,
                });
                next
            }
        };
        let slot = &mut self.slots[id as usize];
        let key = SlotKey {
            id,
            generation: slot.generation,
        };
        slot.state = SlotState::Occupied(build(key));
        self.occupied += 1;
        Some(key)
    }

    pub fn get(&self, id: u32) -> Option<(&T, SlotKey)> {
        let slot = self.slots.get(id as usize).filter(|_| id != 0)?;
        match &slot.state {
            SlotState::Occupied(value) => Some((
                value,
                SlotKey {
                    id,
                    generation: slot.generation,
                },
            )),
            _ => None,
        }
    }

    pub fn get_key(&self, key: SlotKey) -> Option<&T> {
        self.get(key.id)
            .filter(|(_, current)| *current == key)
            .map(|(value, _)| value)
    }

    /// Hides the entry from lookups and hands it back; the id stays reserved
    /// until `reclaim`.
    pub fn retire(&mut self, id: u32) -> Option<T> {
        let slot = self.slots.get_mut(id as usize).filter(|_| id != 0)?;
        if !matches!(slot.state, SlotState::Occupied(_)) {
            return None;
        }
        match std::mem::replace(&mut slot.state, SlotState::Retiring) {
            SlotState::Occupied(value) => {
                self.occupied -= 1;
                Some(value)
            }
            _ => None,
        }
    }

    pub fn reclaim(&mut self, id: u32) {
        let Some(slot) = self.slots.get_mut(id as usize).filter(|_| id != 0) else {
            return;
        };
        if matches!(slot.state, SlotState::Retiring) {
            slot.state = SlotState::Vacant;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id);
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| match &slot.state {
            SlotState::Occupied(value) => Some(value),
            _ => None,
        })
    }
}
