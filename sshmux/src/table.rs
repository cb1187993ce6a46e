// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
use std::collections::VecDeque;
use std::time::Instant;

use log::debug;

use crate::{ChannelId, Error};

struct Slot<T> {
    generation: u16,
    entry: Option<T>,
}

/// Result of looking a channel id up.
#[derive(Debug)]
pub(crate) enum Lookup<'a, T> {
    Live(&'a T),
    /// The slot exists but is empty, or holds a newer channel.
    Stale,
    /// The id points past anything we ever allocated.
    Unknown,
}

/// Dense table of channels, indexed by the low bits of their id.
pub(crate) struct ChannelTable<T> {
    slots: Vec<Slot<T>>,
    next_empty: usize,
    increment: usize,
    max: usize,
    live: usize,
    pending: VecDeque<(ChannelId, Instant)>,
}

impl<T: Clone> ChannelTable<T> {
    pub fn new(increment: usize, max: usize) -> Self {
        ChannelTable {
            slots: Vec::new(),
            next_empty: 0,
            increment: increment.max(1),
            max,
            live: 0,
            pending: VecDeque::new(),
        }
    }

    /// Allocates an id and stores the entry built from it.
    pub fn insert_with<F: FnOnce(ChannelId) -> T>(&mut self, f: F) -> Result<T, Error> {
        let index = match self
            .slots
            .iter()
            .skip(self.next_empty)
            .position(|s| s.entry.is_none())
        {
            Some(i) => self.next_empty + i,
            None => {
                let len = self.slots.len();
                if len >= self.max {
                    return Err(Error::TooManyChannels);
                }
                let new_len = (len + self.increment).min(self.max);
                debug!("growing channel table to {}", new_len);
                self.slots.resize_with(new_len, || Slot {
                    generation: 0,
                    entry: None,
                });
                len
            }
        };
        let Some(slot) = self.slots.get_mut(index) else {
            return Err(Error::Inconsistent);
        };
        let id = ChannelId::new(index, slot.generation);
        let entry = f(id);
        slot.entry = Some(entry.clone());
        self.next_empty = index + 1;
        self.live += 1;
        Ok(entry)
    }

    pub fn get(&self, id: ChannelId) -> Lookup<'_, T> {
        match self.slots.get(id.index()) {
            None => Lookup::Unknown,
            Some(Slot {
                generation,
                entry: Some(entry),
            }) if *generation == id.generation() => Lookup::Live(entry),
            Some(_) => Lookup::Stale,
        }
    }

    /// Frees the slot of `id`, if it still holds that channel.
    pub fn remove(&mut self, id: ChannelId) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        if id.index() < self.next_empty {
            self.next_empty = id.index();
        }
        Some(entry)
    }

    /// Keeps the slot of `id` allocated until `deadline`.
    pub fn defer(&mut self, id: ChannelId, deadline: Instant) {
        self.pending.push_back((id, deadline));
    }

    /// Frees the deferred slots whose deadline has passed.
    pub fn reap(&mut self, now: Instant) -> Vec<ChannelId> {
        let mut freed = Vec::new();
        while let Some((id, deadline)) = self.pending.front().copied() {
            if deadline > now {
                break;
            }
            self.pending.pop_front();
            if self.remove(id).is_some() {
                freed.push(id)
            }
        }
        freed
    }

    /// Every entry still in the table, deferred ones included.
    pub fn entries(&self) -> Vec<T> {
        self.slots.iter().filter_map(|s| s.entry.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn grows_by_increment_up_to_cap() {
        let mut table = ChannelTable::new(2, 5);
        for i in 0..5 {
            let id = table.insert_with(|id| id).unwrap();
            assert_eq!(id.index(), i);
        }
        assert_eq!(table.capacity(), 5);
        assert!(matches!(
            table.insert_with(|id| id),
            Err(Error::TooManyChannels)
        ));
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut table = ChannelTable::new(4, 16);
        let a = table.insert_with(|id| id).unwrap();
        let b = table.insert_with(|id| id).unwrap();
        assert_eq!(table.remove(a), Some(a));
        assert_eq!(table.remove(a), None);

        let c = table.insert_with(|id| id).unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert!(matches!(table.get(a), Lookup::Stale));
        assert!(matches!(table.get(c), Lookup::Live(x) if *x == c));
        assert!(matches!(table.get(b), Lookup::Live(_)));
        assert!(matches!(table.get(ChannelId::new(10, 0)), Lookup::Unknown));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn deferred_slots_are_reaped_after_deadline() {
        let mut table = ChannelTable::new(4, 16);
        let a = table.insert_with(|id| id).unwrap();
        let now = Instant::now();
        table.defer(a, now + Duration::from_secs(2));
        assert!(table.reap(now).is_empty());
        assert!(matches!(table.get(a), Lookup::Live(_)));
        assert_eq!(table.reap(now + Duration::from_secs(3)), vec![a]);
        assert!(matches!(table.get(a), Lookup::Stale));
    }
}
