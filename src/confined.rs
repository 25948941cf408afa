//! A cell that confines its contents to one loop thread.

use std::cell::{Cell, UnsafeCell};
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

/// Interior-mutable storage whose contents belong to a single loop thread.
///
/// Objects such as connections are shared across threads behind an `Arc`,
/// but their mutable state must only ever be touched from the owning loop's
/// thread. `Confined` encodes that rule: every borrow asserts that the
/// calling thread is the owner and panics otherwise, turning a data race
/// into a deterministic failure.
///
/// # Safety protocol
///
/// `Confined` is unconditionally `Send` and `Sync`, which is sound only
/// under the following discipline, upheld throughout this crate:
///
/// * the contents are borrowed exclusively on the owner thread;
/// * contents that are themselves thread-bound (an `Rc` of a [`Channel`],
///   for example) are installed and cleared on the owner thread, so that
///   by the time the last `Arc` reference can be dropped on a foreign
///   thread the cell no longer holds anything thread-bound.
///
/// The teardown half of the protocol is what `TcpConnection::connect_destroyed`
/// implements for connections.
///
/// [`Channel`]: crate::Channel
pub(crate) struct Confined<T> {
    owner: ThreadId,
    borrows: Cell<isize>,
    value: UnsafeCell<T>,
}

unsafe impl<T> Send for Confined<T> {}
unsafe impl<T> Sync for Confined<T> {}

impl<T> Confined<T> {
    /// Creates a cell owned by `owner`'s thread.
    pub(crate) fn new(owner: ThreadId, value: T) -> Confined<T> {
        Confined {
            owner,
            borrows: Cell::new(0),
            value: UnsafeCell::new(value),
        }
    }

    fn assert_owner(&self) {
        let current = thread::current().id();
        assert!(
            current == self.owner,
            "loop-confined state accessed off its owner thread: owner {:?}, current {:?}",
            self.owner,
            current
        );
    }

    /// Borrows the contents. Panics off the owner thread or while a
    /// mutable borrow is outstanding.
    pub(crate) fn borrow(&self) -> ConfinedRef<'_, T> {
        self.assert_owner();
        let borrows = self.borrows.get();
        assert!(borrows >= 0, "already mutably borrowed");
        self.borrows.set(borrows + 1);
        ConfinedRef { cell: self }
    }

    /// Mutably borrows the contents. Panics off the owner thread or while
    /// any other borrow is outstanding.
    pub(crate) fn borrow_mut(&self) -> ConfinedRefMut<'_, T> {
        self.assert_owner();
        assert!(self.borrows.get() == 0, "already borrowed");
        self.borrows.set(-1);
        ConfinedRefMut { cell: self }
    }
}

pub(crate) struct ConfinedRef<'a, T> {
    cell: &'a Confined<T>,
}

impl<T> Deref for ConfinedRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.cell.value.get() }
    }
}

impl<T> Drop for ConfinedRef<'_, T> {
    fn drop(&mut self) {
        self.cell.borrows.set(self.cell.borrows.get() - 1);
    }
}

pub(crate) struct ConfinedRefMut<'a, T> {
    cell: &'a Confined<T>,
}

impl<T> Deref for ConfinedRefMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.cell.value.get() }
    }
}

impl<T> DerefMut for ConfinedRefMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.cell.value.get() }
    }
}

impl<T> Drop for ConfinedRefMut<'_, T> {
    fn drop(&mut self) {
        self.cell.borrows.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::Confined;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn borrow_on_owner_thread() {
        let cell = Confined::new(thread::current().id(), 1u32);
        *cell.borrow_mut() += 1;
        assert_eq!(*cell.borrow(), 2);
    }

    #[test]
    fn shared_readers() {
        let cell = Confined::new(thread::current().id(), 7u32);
        let a = cell.borrow();
        let b = cell.borrow();
        assert_eq!(*a + *b, 14);
    }

    #[test]
    fn foreign_thread_borrow_panics() {
        let cell = Arc::new(Confined::new(thread::current().id(), 0u32));
        let shared = Arc::clone(&cell);
        let result = thread::spawn(move || {
            let _ = shared.borrow();
        })
        .join();
        assert!(result.is_err());
    }

    #[test]
    #[should_panic(expected = "already borrowed")]
    fn overlapping_mutable_borrow_panics() {
        let cell = Confined::new(thread::current().id(), 0u32);
        let _read = cell.borrow();
        let _write = cell.borrow_mut();
    }
}
