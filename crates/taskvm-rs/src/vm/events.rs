use smallvec::SmallVec;

use crate::device::EventHandle;

/// Upper bound on the events one dependency list may collect in a single invocation.
pub const MAX_EVENTS_PER_LIST: usize = 32;

pub type EventList = SmallVec<[EventHandle; 4]>;

/// Dependency lists addressed by the event-list operands of a program.
#[derive(Debug, Default)]
pub struct EventLists {
    lists: Vec<EventList>,
}

impl EventLists {
    /// Drops every collected event and resizes to `count` lists.
    pub fn reset(&mut self, count: usize) {
        self.lists.clear();
        self.lists.resize_with(count, EventList::new);
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Appends `events` to list `index`. Returns `false` if the list does not exist or
    /// would exceed [`MAX_EVENTS_PER_LIST`].
    pub fn extend(&mut self, index: usize, events: &[EventHandle]) -> bool {
        match self.lists.get_mut(index) {
            Some(list) if list.len() + events.len() <= MAX_EVENTS_PER_LIST => {
                list.extend_from_slice(events);
                true
            }
            _ => false,
        }
    }

    /// Takes the contents of list `index`; a negative index yields an empty list.
    pub fn take(&mut self, index: i32) -> Option<EventList> {
        if index < 0 {
            return Some(EventList::new());
        }
        self.lists
            .get_mut(index as usize)
            .map(std::mem::take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_drains_and_negative_index_is_empty() {
        let mut lists = EventLists::default();
        lists.reset(2);
        assert!(lists.extend(1, &[EventHandle(4), EventHandle(5)]));
        assert_eq!(
            lists.take(1).unwrap().as_slice(),
            &[EventHandle(4), EventHandle(5)]
        );
        assert!(lists.take(1).unwrap().is_empty());
        assert!(lists.take(-1).unwrap().is_empty());
        assert!(lists.take(2).is_none());
    }

    #[test]
    fn overflow_is_refused() {
        let mut lists = EventLists::default();
        lists.reset(1);
        let events = vec![EventHandle(0); MAX_EVENTS_PER_LIST];
        assert!(lists.extend(0, &events));
        assert!(!lists.extend(0, &[EventHandle(1)]));
        assert!(!lists.extend(3, &[EventHandle(1)]));
    }
}
