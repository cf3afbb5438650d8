//! Ref-counted slot for a replaceable host handle

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::handle::HostHandle;

struct Entry<H> {
    id: u64,
    handle: Arc<H>,
    refs: usize,
    retired: bool,
}

struct Slots<H> {
    current: Option<u64>,
    next_id: u64,
    // Current handle plus retired handles that still have acquisitions out.
    entries: Vec<Entry<H>>,
}

impl<H> Slots<H> {
    fn position(&self, id: u64) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    /// Mark a handle retired; returns it if nobody holds it anymore
    fn retire(&mut self, id: u64) -> Option<Arc<H>> {
        let idx = self.position(id)?;
        let entry = &mut self.entries[idx];
        entry.retired = true;
        if entry.refs == 0 {
            Some(self.entries.swap_remove(idx).handle)
        } else {
            None
        }
    }
}

/// Holds at most one current host handle and mediates every access to it
///
/// - `set` replaces the current handle without blocking. The previous handle is
///   released right away if nobody is using it, otherwise when its last
///   [`HandleGuard`] is dropped.
/// - `acquire` pins the current handle for the lifetime of the returned guard.
///
/// A single mutex guards the slot state. The host's release function is always
/// called after that mutex is dropped, so a release implementation may call
/// back into the registry.
pub struct HandleRegistry<H: HostHandle> {
    slots: Mutex<Slots<H>>,
}

impl<H: HostHandle> HandleRegistry<H> {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                current: None,
                next_id: 0,
                entries: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<H>> {
        // The critical sections never run host code, so a poisoned lock still
        // holds consistent state.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `handle` as the current handle (or clear the slot with `None`)
    pub fn set(&self, handle: Option<H>) {
        let released = {
            let mut slots = self.lock();
            let new_id = handle.map(|handle| {
                let id = slots.next_id;
                slots.next_id += 1;
                slots.entries.push(Entry {
                    id,
                    handle: Arc::new(handle),
                    refs: 0,
                    retired: false,
                });
                id
            });
            let old = std::mem::replace(&mut slots.current, new_id);
            old.and_then(|id| slots.retire(id))
        };

        if let Some(handle) = released {
            tracing::trace!("releasing replaced host handle");
            handle.release();
        }
    }

    /// Pin the current handle, or return `None` if the slot is empty
    pub fn acquire(&self) -> Option<HandleGuard<'_, H>> {
        let mut slots = self.lock();
        let id = slots.current?;
        let idx = slots.position(id)?;
        let entry = &mut slots.entries[idx];
        entry.refs += 1;
        Some(HandleGuard {
            registry: self,
            id,
            handle: Arc::clone(&entry.handle),
        })
    }

    /// Run `f` against the current handle, if there is one
    pub fn with<R>(&self, f: impl FnOnce(&H) -> R) -> Option<R> {
        let guard = self.acquire()?;
        Some(f(&guard))
    }

    /// Whether a current handle is installed
    pub fn is_set(&self) -> bool {
        self.lock().current.is_some()
    }

    fn release_acquisition(&self, id: u64) {
        let released = {
            let mut slots = self.lock();
            match slots.position(id) {
                Some(idx) => {
                    let entry = &mut slots.entries[idx];
                    entry.refs -= 1;
                    if entry.refs == 0 && entry.retired {
                        Some(slots.entries.swap_remove(idx).handle)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(handle) = released {
            tracing::trace!("releasing retired host handle after last use");
            handle.release();
        }
    }
}

impl<H: HostHandle> Default for HandleRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// A pinned acquisition of a registry's handle
///
/// The handle stays valid for as long as the guard lives. Dropping the guard
/// (or calling [`HandleGuard::release`]) returns the acquisition.
pub struct HandleGuard<'a, H: HostHandle> {
    registry: &'a HandleRegistry<H>,
    id: u64,
    handle: Arc<H>,
}

impl<H: HostHandle> HandleGuard<'_, H> {
    /// Return the acquisition explicitly
    pub fn release(self) {
        drop(self);
    }
}

impl<H: HostHandle> Deref for HandleGuard<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}

impl<H: HostHandle> Drop for HandleGuard<'_, H> {
    fn drop(&mut self) {
        self.registry.release_acquisition(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Probe {
        releases: AtomicUsize,
        in_use: AtomicUsize,
    }

    struct TestHandle(Arc<Probe>);

    impl HostHandle for TestHandle {
        fn release(&self) {
            assert_eq!(
                self.0.in_use.load(Ordering::SeqCst),
                0,
                "handle released while in use"
            );
            self.0.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn probe() -> (Arc<Probe>, TestHandle) {
        let probe = Arc::new(Probe::default());
        (Arc::clone(&probe), TestHandle(probe))
    }

    #[test]
    fn test_acquire_empty_registry() {
        let registry: HandleRegistry<TestHandle> = HandleRegistry::new();
        assert!(registry.acquire().is_none());
        assert!(!registry.is_set());
    }

    #[test]
    fn test_replace_idle_handle_releases_immediately() {
        let registry = HandleRegistry::new();
        let (first, handle) = probe();
        registry.set(Some(handle));
        assert_eq!(first.releases.load(Ordering::SeqCst), 0);

        let (second, handle) = probe();
        registry.set(Some(handle));
        assert_eq!(first.releases.load(Ordering::SeqCst), 1);
        assert_eq!(second.releases.load(Ordering::SeqCst), 0);

        registry.set(None);
        assert_eq!(second.releases.load(Ordering::SeqCst), 1);
        assert!(!registry.is_set());
    }

    #[test]
    fn test_replace_defers_release_until_all_guards_dropped() {
        let registry = HandleRegistry::new();
        let (old, handle) = probe();
        registry.set(Some(handle));

        let a = registry.acquire().unwrap();
        let b = registry.acquire().unwrap();
        let c = registry.acquire().unwrap();

        let (new, handle) = probe();
        registry.set(Some(handle));
        assert_eq!(old.releases.load(Ordering::SeqCst), 0);

        // New acquisitions see the replacement
        {
            let guard = registry.acquire().unwrap();
            assert!(Arc::ptr_eq(&guard.0, &new));
        }

        b.release();
        assert_eq!(old.releases.load(Ordering::SeqCst), 0);
        drop(c);
        assert_eq!(old.releases.load(Ordering::SeqCst), 0);
        drop(a);
        assert_eq!(old.releases.load(Ordering::SeqCst), 1);
        assert_eq!(new.releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear_while_in_use() {
        let registry = HandleRegistry::new();
        let (probe, handle) = probe();
        registry.set(Some(handle));

        let guard = registry.acquire().unwrap();
        registry.set(None);
        assert!(registry.acquire().is_none());
        assert_eq!(probe.releases.load(Ordering::SeqCst), 0);

        drop(guard);
        assert_eq!(probe.releases.load(Ordering::SeqCst), 1);

        // Clearing an already empty slot is a no-op
        registry.set(None);
        assert_eq!(probe.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_with_returns_none_when_empty() {
        let registry: HandleRegistry<TestHandle> = HandleRegistry::new();
        assert_eq!(registry.with(|_| 1), None);

        let (_probe, handle) = probe();
        registry.set(Some(handle));
        assert_eq!(registry.with(|_| 1), Some(1));
    }

    static REENTRANT: HandleRegistry<ReentrantHandle> = HandleRegistry::new();

    struct ReentrantHandle {
        releases: Arc<AtomicUsize>,
    }

    impl HostHandle for ReentrantHandle {
        fn release(&self) {
            // Host release code calling back into the registry must not deadlock
            let _current = REENTRANT.acquire();
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_may_reenter_registry() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        REENTRANT.set(Some(ReentrantHandle {
            releases: Arc::clone(&first),
        }));

        let guard = REENTRANT.acquire().unwrap();
        REENTRANT.set(Some(ReentrantHandle {
            releases: Arc::clone(&second),
        }));
        drop(guard);
        assert_eq!(first.load(Ordering::SeqCst), 1);

        REENTRANT.set(None);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_randomized_interleavings_release_once() {
        const THREADS: usize = 8;
        const OPS: usize = 2_000;

        let registry: Arc<HandleRegistry<TestHandle>> = Arc::new(HandleRegistry::new());
        let created: Arc<Mutex<Vec<Arc<Probe>>>> = Arc::new(Mutex::new(Vec::new()));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let created = Arc::clone(&created);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..OPS {
                        match rng.gen_range(0..10) {
                            0 => {
                                let (probe, handle) = probe();
                                created.lock().unwrap().push(probe);
                                registry.set(Some(handle));
                            }
                            1 => registry.set(None),
                            _ => {
                                if let Some(guard) = registry.acquire() {
                                    guard.0.in_use.fetch_add(1, Ordering::SeqCst);
                                    assert_eq!(
                                        guard.0.releases.load(Ordering::SeqCst),
                                        0,
                                        "acquired a released handle"
                                    );
                                    for _ in 0..rng.gen_range(0..4) {
                                        thread::yield_now();
                                    }
                                    guard.0.in_use.fetch_sub(1, Ordering::SeqCst);
                                    drop(guard);
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        registry.set(None);
        for probe in created.lock().unwrap().iter() {
            assert_eq!(probe.releases.load(Ordering::SeqCst), 1);
        }
    }
}
