//! Ring data model: slots and the fixed-capacity descriptor ring.

pub mod kring;
pub mod slot;

pub use kring::{ring_distance, PendingSlots, Ring, RingState};
pub use slot::{Slot, SlotFlags};
