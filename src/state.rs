//! Copy-on-write publication cells.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// A single-writer, multi-reader published value.
///
/// Readers take a cheap `Arc` clone of the current value and never observe a
/// partial update. Writers either replace the value or edit it in place via
/// [`Arc::make_mut`], which clones first if any reader still holds the old one.
pub struct Published<T> {
    current: RwLock<Arc<T>>,
}

impl<T> Published<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    /// The current value.
    pub fn load(&self) -> Arc<T> {
        self.current.read().clone()
    }

    /// Replace the current value.
    pub fn store(&self, value: T) {
        *self.current.write() = Arc::new(value);
    }

}

impl<T: Clone> Published<T> {
    /// Edit the value. Outstanding readers keep the version they loaded.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.current.write();
        f(Arc::make_mut(&mut guard))
    }
}

impl<T: Default> Default for Published<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Published<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Published").field(&*self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_keep_their_version() {
        let cell = Published::new(vec![1, 2]);
        let before = cell.load();

        cell.update(|v| v.push(3));

        assert_eq!(*before, vec![1, 2]);
        assert_eq!(*cell.load(), vec![1, 2, 3]);
    }

    #[test]
    fn store_replaces_value() {
        let cell: Published<u32> = Published::default();
        cell.store(7);
        assert_eq!(*cell.load(), 7);
    }

    #[test]
    fn update_without_readers_does_not_clone() {
        let cell = Published::new(String::from("a"));
        let ptr_before = Arc::as_ptr(&cell.load());
        cell.update(|s| s.push('b'));
        assert_eq!(Arc::as_ptr(&cell.load()), ptr_before);
    }
}
