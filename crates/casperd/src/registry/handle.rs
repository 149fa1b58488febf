//! Generation-checked handles into the connection registry.
//!
//! A handle names a slot index plus the generation the slot had when the
//! connection was registered. Slots are recycled after removal, and bumping
//! the generation makes every handle to the old occupant resolve to `None`
//! instead of aliasing the new one.

use std::fmt;

/// O(1)-removable reference to a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    pub(super) index: usize,
    pub(super) generation: u64,
}

impl ConnHandle {
    pub(super) const fn new(index: usize, generation: u64) -> Self {
        Self { index, generation }
    }

    /// Slot index (stable for the lifetime of the connection).
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}.{}", self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        assert_eq!(ConnHandle::new(3, 7).to_string(), "conn-3.7");
    }

    #[test]
    fn test_handles_differ_by_generation() {
        assert_ne!(ConnHandle::new(1, 0), ConnHandle::new(1, 1));
    }
}
