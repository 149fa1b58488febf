//! Connection registry.
//!
//! The registry is the single owner of every live client connection. It is
//! an arena of slots threaded into a doubly linked list by index, so
//! registration and removal by handle are O(1) and iteration order is
//! deterministic (newest connection first).
//!
//! # Layout
//!
//! ```text
//!  head                                     tail
//!   │                                         │
//!   ▼                                         ▼
//! ┌──────┐  next  ┌──────┐  next  ┌──────┐
//! │slot 2│──────▶│slot 0│──────▶│slot 3│      free: [1]
//! │ gen 1│◀──────│ gen 0│◀──────│ gen 0│
//! └──────┘  prev  └──────┘  prev  └──────┘
//! ```
//!
//! Removed slots go on a free list and their generation is bumped, so a
//! stale [`ConnHandle`] held across a removal resolves to `None`.
//!
//! # Iteration under mutation
//!
//! Callers that may remove connections while visiting them take a
//! [`Registry::handles`] snapshot first and resolve each handle with
//! [`Registry::get_mut`]. Entries removed mid-pass are skipped on lookup;
//! none are visited twice.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Slot access goes through `get`/`get_mut`, never direct indexing

mod error;
mod handle;

use std::collections::HashMap;
use std::os::fd::RawFd;

use tracing::debug;

pub use error::RegistryError;
pub use handle::ConnHandle;

/// Anything that can be keyed by its OS descriptor.
pub trait Descriptor {
    /// Returns the raw descriptor that identifies this connection.
    fn descriptor(&self) -> RawFd;
}

struct Entry<C> {
    conn: C,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Slot<C> {
    generation: u64,
    entry: Option<Entry<C>>,
}

/// Ordered, handle-addressed collection of live connections.
pub struct Registry<C> {
    slots: Vec<Slot<C>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    by_descriptor: HashMap<RawFd, ConnHandle>,
    len: usize,
    max: usize,
}

impl<C: Descriptor> Registry<C> {
    /// Creates an empty registry that holds at most `max` connections.
    pub fn new(max: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            by_descriptor: HashMap::new(),
            len: 0,
            max,
        }
    }

    /// Registers a connection at the head of the list.
    ///
    /// # Errors
    /// - `RegistryError::RegistryFull` if at maximum capacity
    /// - `RegistryError::DuplicateDescriptor` if the descriptor is already live
    pub fn register(&mut self, conn: C) -> Result<ConnHandle, RegistryError> {
        if self.is_full() {
            return Err(RegistryError::RegistryFull { max: self.max });
        }

        let fd = conn.descriptor();
        if self.by_descriptor.contains_key(&fd) {
            return Err(RegistryError::DuplicateDescriptor { fd });
        }

        let entry = Entry {
            conn,
            prev: None,
            next: self.head,
        };

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };

        let generation = match self.slots.get_mut(index) {
            Some(slot) => {
                slot.entry = Some(entry);
                slot.generation
            }
            // index came from the free list or a fresh push
            None => return Err(RegistryError::RegistryFull { max: self.max }),
        };

        let old_head = self.head;
        match old_head.and_then(|old| self.entry_mut(old)) {
            Some(entry) => entry.prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);

        let handle = ConnHandle::new(index, generation);
        self.by_descriptor.insert(fd, handle);
        self.len += 1;

        debug!(handle = %handle, fd, live = self.len, "Registered connection");
        Ok(handle)
    }

    /// Unlinks a connection and returns it.
    ///
    /// Dropping the returned value closes its socket. Returns `None` for a
    /// handle that is stale or was never issued.
    pub fn unregister(&mut self, handle: ConnHandle) -> Option<C> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        match entry.prev.and_then(|p| self.entry_mut(p)) {
            Some(prev) => prev.next = entry.next,
            None => self.head = entry.next,
        }
        match entry.next.and_then(|n| self.entry_mut(n)) {
            Some(next) => next.prev = entry.prev,
            None => self.tail = entry.prev,
        }

        let fd = entry.conn.descriptor();
        if self.by_descriptor.get(&fd) == Some(&handle) {
            self.by_descriptor.remove(&fd);
        }

        self.free.push(handle.index);
        self.len -= 1;

        debug!(handle = %handle, fd, live = self.len, "Unregistered connection");
        Some(entry.conn)
    }

    /// Finds the live connection that owns `fd`.
    pub fn lookup(&self, fd: RawFd) -> Option<ConnHandle> {
        self.by_descriptor.get(&fd).copied()
    }

    /// Removes every connection, returning them in registry order.
    pub fn drain(&mut self) -> Vec<C> {
        self.handles()
            .into_iter()
            .filter_map(|handle| self.unregister(handle))
            .collect()
    }
}

impl<C> Registry<C> {
    /// Resolves a handle to its connection.
    pub fn get(&self, handle: ConnHandle) -> Option<&C> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref().map(|e| &e.conn)
    }

    /// Resolves a handle to its connection, mutably.
    pub fn get_mut(&mut self, handle: ConnHandle) -> Option<&mut C> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut().map(|e| &mut e.conn)
    }

    /// Snapshot of live handles in iteration order (head to tail).
    pub fn handles(&self) -> Vec<ConnHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Live handles walked backwards from the tail.
    pub fn handles_rev(&self) -> Vec<ConnHandle> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.tail;
        while let Some(index) = cursor {
            let Some(slot) = self.slots.get(index) else {
                break;
            };
            let Some(entry) = slot.entry.as_ref() else {
                break;
            };
            out.push(ConnHandle::new(index, slot.generation));
            cursor = entry.prev;
        }
        out
    }

    /// Iterates live connections head to tail.
    pub fn iter(&self) -> Iter<'_, C> {
        Iter {
            registry: self,
            cursor: self.head,
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of live connections.
    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.max
    }

    fn entry_mut(&mut self, index: usize) -> Option<&mut Entry<C>> {
        self.slots.get_mut(index)?.entry.as_mut()
    }
}

/// Iterator over `(handle, connection)` pairs in registry order.
pub struct Iter<'a, C> {
    registry: &'a Registry<C>,
    cursor: Option<usize>,
}

impl<'a, C> Iterator for Iter<'a, C> {
    type Item = (ConnHandle, &'a C);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = self.registry.slots.get(index)?;
        let entry = slot.entry.as_ref()?;
        self.cursor = entry.next;
        Some((ConnHandle::new(index, slot.generation), &entry.conn))
    }
}
