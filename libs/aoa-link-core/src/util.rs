use futures::Stream;
use std::{
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
};

pub type PinnedStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// Lock a mutex, carrying on with the inner value if a previous holder
/// panicked. None of the state guarded in this crate can be left half
/// updated by a panic.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
