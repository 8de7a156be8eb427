//! Reference counts that report zero crossings.
//!
//! Several data items share an object id or an attribute usage, and several
//! requests can share one outgoing leg. Only the 0→1 and 1→0 crossings are
//! interesting to the protocol, so every mutation reports which one happened.

/// Outcome of a count mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The count went from zero to one
    BecameNonzero,
    /// The count went from one to zero
    BecameZero,
    /// The count changed without crossing zero, or did not change
    NoTransition,
}

/// A saturating reference count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefCount(u32);

impl RefCount {
    /// Current count.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Whether nothing holds a reference.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Add one reference.
    pub fn acquire(&mut self) -> Transition {
        let before = self.0;
        self.0 = self.0.saturating_add(1);
        if before == 0 {
            Transition::BecameNonzero
        } else {
            Transition::NoTransition
        }
    }

    /// Drop one reference. Releasing at zero is a no-op.
    pub fn release(&mut self) -> Transition {
        match self.0 {
            0 => Transition::NoTransition,
            1 => {
                self.0 = 0;
                Transition::BecameZero
            }
            _ => {
                self.0 -= 1;
                Transition::NoTransition
            }
        }
    }
}
