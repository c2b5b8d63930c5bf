use crate::error::{Result, TideError};
use crate::event::EventQueue;
use crate::store::{Container, Object};
use crate::types::ContainerMode;
use std::sync::{Arc, Mutex};

/// Opaque 64-bit handle cookie: slot index in the high word, generation in
/// the low word. Generations make stale cookies after close fail instead of
/// aliasing a recycled slot.
pub type Cookie = u64;

#[derive(Clone)]
pub enum Resource {
    Container {
        container: Arc<Container>,
        mode: ContainerMode,
    },
    Object {
        object: Arc<Object>,
        container: Arc<Container>,
        mode: ContainerMode,
        writable: bool,
    },
    Queue(Arc<EventQueue>),
}

struct SlotEntry {
    generation: u32,
    resource: Option<Resource>,
}

#[derive(Default)]
struct TableState {
    slots: Vec<SlotEntry>,
    free: Vec<usize>,
}

/// Typed slot table behind the cookie handles the public API hands out.
#[derive(Default)]
pub struct HandleTable {
    state: Mutex<TableState>,
}

fn cookie_of(index: usize, generation: u32) -> Cookie {
    ((index as u64) << 32) | generation as u64
}

fn split_cookie(cookie: Cookie) -> (usize, u32) {
    ((cookie >> 32) as usize, cookie as u32)
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resource: Resource) -> Cookie {
        let mut st = self.state.lock().unwrap();
        if let Some(index) = st.free.pop() {
            let entry = &mut st.slots[index];
            entry.resource = Some(resource);
            cookie_of(index, entry.generation)
        } else {
            let index = st.slots.len();
            st.slots.push(SlotEntry {
                generation: 1,
                resource: Some(resource),
            });
            cookie_of(index, 1)
        }
    }

    pub fn get(&self, cookie: Cookie) -> Result<Resource> {
        let st = self.state.lock().unwrap();
        let (index, generation) = split_cookie(cookie);
        st.slots
            .get(index)
            .filter(|entry| entry.generation == generation)
            .and_then(|entry| entry.resource.clone())
            .ok_or_else(|| TideError::NotFound(format!("stale or unknown handle: {:#x}", cookie)))
    }

    /// Remove the resource and retire the cookie; the slot is recycled under
    /// a new generation.
    pub fn close(&self, cookie: Cookie) -> Result<Resource> {
        let mut st = self.state.lock().unwrap();
        let (index, generation) = split_cookie(cookie);
        let entry = st
            .slots
            .get_mut(index)
            .filter(|entry| entry.generation == generation && entry.resource.is_some())
            .ok_or_else(|| TideError::NotFound(format!("stale or unknown handle: {:#x}", cookie)))?;
        let resource = entry.resource.take().unwrap();
        entry.generation = entry.generation.wrapping_add(1);
        st.free.push(index);
        Ok(resource)
    }

    /// Take every live resource, retiring all cookies. Shutdown path.
    pub fn drain(&self) -> Vec<Resource> {
        let mut st = self.state.lock().unwrap();
        let mut out = Vec::new();
        let mut freed = Vec::new();
        for (index, entry) in st.slots.iter_mut().enumerate() {
            if let Some(resource) = entry.resource.take() {
                entry.generation = entry.generation.wrapping_add(1);
                freed.push(index);
                out.push(resource);
            }
        }
        st.free.extend(freed);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_cookie_rejected_after_close() {
        let table = HandleTable::new();
        let container = Arc::new(Container::new("c1"));
        let cookie = table.insert(Resource::Container {
            container,
            mode: ContainerMode::ReadWrite,
        });

        assert!(table.get(cookie).is_ok());
        table.close(cookie).unwrap();
        assert!(matches!(table.get(cookie), Err(TideError::NotFound(_))));

        // The recycled slot gets a fresh generation; the old cookie stays dead.
        let queue = Arc::new(EventQueue::new());
        let fresh = table.insert(Resource::Queue(queue));
        assert_ne!(fresh, cookie);
        assert!(matches!(table.get(cookie), Err(TideError::NotFound(_))));
        assert!(table.get(fresh).is_ok());
    }

    #[test]
    fn test_drain_retires_everything() {
        let table = HandleTable::new();
        let a = table.insert(Resource::Queue(Arc::new(EventQueue::new())));
        let b = table.insert(Resource::Queue(Arc::new(EventQueue::new())));
        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.get(a).is_err());
        assert!(table.get(b).is_err());
    }
}
