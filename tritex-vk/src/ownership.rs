//! Owned-versus-borrowed handle tracking for resource wrappers.
//!
//! A wrapper whose handle is [`Held::Owned`] destroys it on release or
//! drop. A [`Held::Borrowed`] copy refers to the same object for
//! inspection only and never destroys it. After release the slot is
//! [`Held::Released`] and further releases are no-ops.

/// Whether a wrapper has authority to destroy the object it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    Borrowed,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Held<H> {
    Owned(H),
    Borrowed(H),
    Released,
}

impl<H: Copy> Held<H> {
    pub(crate) fn get(&self) -> Option<H> {
        match self {
            Held::Owned(h) | Held::Borrowed(h) => Some(*h),
            Held::Released => None,
        }
    }

    pub(crate) fn ownership(&self) -> Option<Ownership> {
        match self {
            Held::Owned(_) => Some(Ownership::Owned),
            Held::Borrowed(_) => Some(Ownership::Borrowed),
            Held::Released => None,
        }
    }

    /// A non-owning copy referring to the same handle.
    pub(crate) fn borrowed(&self) -> Held<H> {
        match self {
            Held::Owned(h) | Held::Borrowed(h) => Held::Borrowed(*h),
            Held::Released => Held::Released,
        }
    }

    /// Moves the slot to `Released`, handing back the handle only when
    /// this slot had destruction authority.
    pub(crate) fn take_for_release(&mut self) -> Option<H> {
        match std::mem::replace(self, Held::Released) {
            Held::Owned(h) => Some(h),
            Held::Borrowed(_) | Held::Released => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_release_yields_handle_once() {
        let mut held = Held::Owned(5u64);
        assert_eq!(held.take_for_release(), Some(5));
        assert_eq!(held, Held::Released);
        assert_eq!(held.take_for_release(), None);
        assert_eq!(held.get(), None);
    }

    #[test]
    fn borrowed_release_never_yields_handle() {
        let owned = Held::Owned(9u64);
        let mut view = owned.borrowed();
        assert_eq!(view.ownership(), Some(Ownership::Borrowed));
        assert_eq!(view.get(), Some(9));
        assert_eq!(view.take_for_release(), None);
        assert_eq!(owned.get(), Some(9));
    }

    #[test]
    fn borrowing_released_slot_stays_released() {
        let released: Held<u64> = Held::Released;
        assert_eq!(released.borrowed(), Held::Released);
        assert_eq!(released.ownership(), None);
    }
}
