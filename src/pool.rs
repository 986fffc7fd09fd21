//! Backend pool: a priority heap of dispatch-eligible backends plus a
//! recovery worklist of unhealthy ones, guarded by a single mutex.
//!
//! Heap ordering is lexicographic from worst to best: not shutting down
//! beats shutting down, not ill beats ill, alive beats dead, and within the
//! same bucket the lower in-flight load wins. The root is therefore always
//! the preferred dispatch target, while ill/dead entries sink to the bottom
//! where the dispatcher or the health monitor evicts them.

use crate::backend::Backend;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Min-heap of backends keyed by (shutting down, ill, dead, load).
///
/// All mutations keep each backend's `heap_idx` equal to its array position,
/// with `-1` as the out-of-heap sentinel. Mutating an ordering key of an
/// element already in the heap is legal only when followed by `fix` while
/// the pool mutex is held.
pub struct BackendHeap {
    items: Vec<Arc<Backend>>,
}

impl BackendHeap {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek(&self) -> Option<&Arc<Backend>> {
        self.items.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.items.iter()
    }

    /// True when `a` is preferred over `b` for dispatch.
    fn less(a: &Backend, b: &Backend) -> bool {
        if a.shutting_down() != b.shutting_down() {
            return !a.shutting_down();
        }
        if a.ill() != b.ill() {
            return !a.ill();
        }
        if a.alive() != b.alive() {
            return a.alive();
        }
        a.current_load() < b.current_load()
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.items.swap(i, j);
        self.items[i].set_heap_idx(i as isize);
        self.items[j].set_heap_idx(j as isize);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !Self::less(&self.items[i], &self.items[parent]) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns true when the element moved.
    fn sift_down(&mut self, mut i: usize) -> bool {
        let n = self.items.len();
        let start = i;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut best = left;
            let right = left + 1;
            if right < n && Self::less(&self.items[right], &self.items[left]) {
                best = right;
            }
            if !Self::less(&self.items[best], &self.items[i]) {
                break;
            }
            self.swap(i, best);
            i = best;
        }
        i != start
    }

    /// Append and sift up; sets the backend's heap index.
    pub fn push(&mut self, backend: Arc<Backend>) {
        let i = self.items.len();
        backend.set_heap_idx(i as isize);
        self.items.push(backend);
        self.sift_up(i);
    }

    /// Remove and return the root; its heap index is reset to `-1`.
    pub fn pop(&mut self) -> Option<Arc<Backend>> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        if last > 0 {
            self.swap(0, last);
        }
        let b = self.items.pop().expect("non-empty heap");
        b.set_heap_idx(-1);
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        Some(b)
    }

    /// Re-establish heap order after the key at `i` changed.
    pub fn fix(&mut self, i: usize) {
        if i >= self.items.len() {
            return;
        }
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    /// Remove the element at an arbitrary index; its heap index is reset to `-1`.
    pub fn remove(&mut self, i: usize) -> Option<Arc<Backend>> {
        if i >= self.items.len() {
            return None;
        }
        let last = self.items.len() - 1;
        if i != last {
            self.swap(i, last);
        }
        let b = self.items.pop().expect("non-empty heap");
        b.set_heap_idx(-1);
        if i < self.items.len() {
            self.fix(i);
        }
        Some(b)
    }

    /// Re-heapify from scratch, repairing every stored index first.
    pub fn rebuild(&mut self) {
        for (i, b) in self.items.iter().enumerate() {
            b.set_heap_idx(i as isize);
        }
        let n = self.items.len();
        for i in (0..n / 2).rev() {
            self.sift_down(i);
        }
    }
}

impl Default for BackendHeap {
    fn default() -> Self {
        Self::new()
    }
}

struct PoolInner {
    active: BackendHeap,
    unhealthy: Vec<Arc<Backend>>,
}

impl PoolInner {
    /// Append to the unhealthy list unless the same backend is already there.
    fn ensure_unhealthy(&mut self, backend: &Arc<Backend>) {
        if !self.unhealthy.iter().any(|u| Arc::ptr_eq(u, backend)) {
            self.unhealthy.push(Arc::clone(backend));
        }
    }

    fn drop_unhealthy(&mut self, backend: &Arc<Backend>) {
        self.unhealthy.retain(|u| !Arc::ptr_eq(u, backend));
    }
}

/// The combined data structure owning all known backends.
///
/// A backend lives in at most one of `active` (dispatch-eligible priority
/// heap) or `unhealthy` (dead or pending, awaiting re-probe or disposal).
/// One mutex guards both; critical sections are short and never touch the
/// network.
pub struct BackendPool {
    inner: Mutex<PoolInner>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                active: BackendHeap::new(),
                unhealthy: Vec::new(),
            }),
        }
    }

    pub fn active_len(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn unhealthy_len(&self) -> usize {
        self.inner.lock().unhealthy.len()
    }

    /// Total number of known backends, pending ones included.
    pub fn total_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.active.len() + inner.unhealthy.len()
    }

    /// Container ids of the currently dispatch-listed backends.
    pub fn active_container_ids(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .active
            .iter()
            .map(|b| b.container_id().to_string())
            .collect()
    }

    /// Admit a newly-created pending backend to the recovery worklist,
    /// refusing when the pool (pending included) is already at `max`.
    pub fn admit(&self, backend: Arc<Backend>, max: usize) -> bool {
        let mut inner = self.inner.lock();
        if inner.active.len() + inner.unhealthy.len() >= max {
            return false;
        }
        inner.unhealthy.push(backend);
        true
    }

    /// Put an already-healthy backend straight into the dispatch heap.
    /// Test seam; production backends enter through `admit` and a probe.
    pub fn insert_active(&self, backend: Arc<Backend>) {
        let mut inner = self.inner.lock();
        inner.active.push(backend);
    }

    /// Select the current best backend for one request and account its load.
    ///
    /// Skims ineligible entries off the root (moving them to the recovery
    /// worklist) until a ready backend surfaces. Returns `None` when the
    /// heap is exhausted. The returned guard decrements the load and
    /// restores heap order when dropped.
    pub fn acquire(self: &Arc<Self>) -> Option<LoadGuard> {
        let mut inner = self.inner.lock();
        loop {
            let b = Arc::clone(inner.active.peek()?);

            if b.heap_idx() != 0 {
                // Should be unreachable while the index invariant holds.
                warn!(
                    url = %b.url(),
                    heap_idx = b.heap_idx(),
                    "heap inconsistency at root, rebuilding"
                );
                inner.active.rebuild();
                continue;
            }

            if !b.ready() {
                inner.active.pop();
                inner.ensure_unhealthy(&b);
                debug!(url = %b.url(), health = %b.health(), "evicted backend from dispatch heap");
                continue;
            }

            b.add_load();
            inner.active.fix(0);
            return Some(LoadGuard {
                backend: b,
                pool: Arc::clone(self),
            });
        }
    }

    /// Snapshot every known backend for a health sweep and clear the
    /// recovery worklist; the sweep re-files each backend as it is probed.
    pub fn drain_for_review(&self) -> Vec<Arc<Backend>> {
        let mut inner = self.inner.lock();
        let mut all: Vec<Arc<Backend>> = inner.active.iter().cloned().collect();
        all.append(&mut inner.unhealthy);
        all
    }

    /// Apply one probe outcome to a backend, driving the health state
    /// machine and re-filing the backend between the heap and the recovery
    /// worklist.
    pub fn apply_probe(&self, backend: &Arc<Backend>, healthy: bool, grace: Duration) {
        let mut inner = self.inner.lock();

        if backend.shutting_down() {
            return;
        }

        if healthy {
            if !backend.alive() || backend.ill() {
                let was = backend.health();
                backend.set_alive(true);
                backend.set_ill(false);
                inner.drop_unhealthy(backend);
                let idx = backend.heap_idx();
                if idx < 0 {
                    inner.active.push(Arc::clone(backend));
                } else {
                    inner.active.fix(idx as usize);
                }
                info!(url = %backend.url(), from = %was, "backend recovered");
            }
        } else {
            let alive = backend.alive();
            let ill = backend.ill();

            if alive && !ill {
                // First consecutive failure.
                backend.set_ill(true);
                let idx = backend.heap_idx();
                if idx >= 0 {
                    inner.active.fix(idx as usize);
                }
                warn!(url = %backend.url(), "backend marked ill");
            } else if ill {
                // Second consecutive failure (ill, or pending first-boot).
                if backend.start_time().elapsed() < grace {
                    debug!(
                        url = %backend.url(),
                        elapsed_secs = backend.start_time().elapsed().as_secs(),
                        "backend still within startup grace, postponing death"
                    );
                } else {
                    backend.set_alive(false);
                    backend.set_ill(false);
                    let idx = backend.heap_idx();
                    if idx >= 0 {
                        inner.active.remove(idx as usize);
                    }
                    warn!(url = %backend.url(), "backend marked dead");
                }
            }
            // Already dead: nothing to transition.

            if backend.heap_idx() < 0 {
                inner.ensure_unhealthy(backend);
            }
        }
    }

    /// Begin retiring the current root backend for scale-down.
    ///
    /// Returns `None` without side effects when the heap is at or below
    /// `min`. Returns `None` after restoring the backend when it still has
    /// in-flight requests; the caller retries on a later tick. Otherwise the
    /// backend is detached from both collections, flagged as shutting down,
    /// and handed to the caller for container teardown.
    pub fn begin_retirement(&self, min: usize) -> Option<Arc<Backend>> {
        let mut inner = self.inner.lock();

        if inner.active.len() <= min {
            debug!(
                active = inner.active.len(),
                min, "not scaling down below minimum replica count"
            );
            return None;
        }

        let b = inner.active.pop()?;
        inner.drop_unhealthy(&b);

        b.set_shutting_down(true);
        b.set_alive(false);

        if b.current_load() > 0 {
            info!(
                container_id = b.container_id(),
                load = b.current_load(),
                "backend busy, deferring scale down"
            );
            b.set_shutting_down(false);
            b.set_alive(true);
            inner.active.push(b);
            return None;
        }

        Some(b)
    }

    /// Put a backend back into the dispatch heap after a failed teardown.
    pub fn reinstate(&self, backend: Arc<Backend>) {
        let mut inner = self.inner.lock();
        backend.set_shutting_down(false);
        backend.set_alive(true);
        inner.active.push(backend);
    }

    /// Detach every known backend, leaving the pool empty. Used by the
    /// shutdown teardown sweep.
    pub fn drain_all(&self) -> Vec<Arc<Backend>> {
        let mut inner = self.inner.lock();
        let mut all = Vec::with_capacity(inner.active.len() + inner.unhealthy.len());
        while let Some(b) = inner.active.pop() {
            b.set_shutting_down(true);
            all.push(b);
        }
        for b in inner.unhealthy.drain(..) {
            b.set_shutting_down(true);
            all.push(b);
        }
        all
    }

    /// Run `f` with the heap and unhealthy list borrowed under the mutex.
    /// Test seam for asserting pool invariants.
    pub fn with_inner<R>(&self, f: impl FnOnce(&BackendHeap, &[Arc<Backend>]) -> R) -> R {
        let inner = self.inner.lock();
        f(&inner.active, &inner.unhealthy)
    }
}

impl Default for BackendPool {
    fn default() -> Self {
        Self::new()
    }
}

/// In-flight accounting for one dispatched request.
///
/// Dropping the guard decrements the backend's load and, when the backend is
/// still in the heap, restores its position. A backend removed from the heap
/// mid-request (scaled down after drain, or died) only gets the decrement.
pub struct LoadGuard {
    backend: Arc<Backend>,
    pool: Arc<BackendPool>,
}

impl LoadGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.backend.sub_load();
        let mut inner = self.pool.inner.lock();
        let idx = self.backend.heap_idx();
        if idx >= 0 && (idx as usize) < inner.active.len() {
            inner.active.fix(idx as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn healthy(port: u16) -> Arc<Backend> {
        let b = Backend::pending(
            Url::parse(&format!("http://localhost:{port}")).unwrap(),
            format!("cid-{port}"),
        );
        b.set_alive(true);
        b.set_ill(false);
        Arc::new(b)
    }

    fn heap_indices_consistent(heap: &BackendHeap) -> bool {
        heap.iter()
            .enumerate()
            .all(|(i, b)| b.heap_idx() == i as isize)
    }

    #[test]
    fn test_push_pop_restores_sentinel() {
        let mut heap = BackendHeap::new();
        let b = healthy(9001);
        heap.push(Arc::clone(&b));
        assert_eq!(b.heap_idx(), 0);
        assert_eq!(heap.len(), 1);

        let popped = heap.pop().unwrap();
        assert!(Arc::ptr_eq(&popped, &b));
        assert_eq!(popped.heap_idx(), -1);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_root_is_least_loaded() {
        let mut heap = BackendHeap::new();
        let light = healthy(9001);
        let heavy = healthy(9002);
        heavy.add_load();
        heavy.add_load();

        heap.push(Arc::clone(&heavy));
        heap.push(Arc::clone(&light));

        assert!(Arc::ptr_eq(heap.peek().unwrap(), &light));
        assert!(heap_indices_consistent(&heap));
    }

    #[test]
    fn test_health_class_outranks_load() {
        let mut heap = BackendHeap::new();

        let ill = healthy(9001);
        ill.set_ill(true);

        let dead = healthy(9002);
        dead.set_alive(false);

        let loaded = healthy(9003);
        for _ in 0..50 {
            loaded.add_load();
        }

        heap.push(Arc::clone(&ill));
        heap.push(Arc::clone(&dead));
        heap.push(Arc::clone(&loaded));

        // A heavily loaded healthy backend still beats ill and dead ones.
        assert!(Arc::ptr_eq(heap.peek().unwrap(), &loaded));

        // Dead-but-not-ill sorts ahead of ill: the ill flag is compared first.
        heap.pop();
        assert!(Arc::ptr_eq(heap.peek().unwrap(), &dead));
    }

    #[test]
    fn test_shutting_down_sorts_last() {
        let mut heap = BackendHeap::new();
        let stopping = healthy(9001);
        stopping.set_shutting_down(true);
        let ill = healthy(9002);
        ill.set_ill(true);

        heap.push(Arc::clone(&stopping));
        heap.push(Arc::clone(&ill));

        assert!(Arc::ptr_eq(heap.peek().unwrap(), &ill));
    }

    #[test]
    fn test_fix_reorders_after_load_change() {
        let mut heap = BackendHeap::new();
        let a = healthy(9001);
        let b = healthy(9002);
        heap.push(Arc::clone(&a));
        heap.push(Arc::clone(&b));

        let root = Arc::clone(heap.peek().unwrap());
        root.add_load();
        root.add_load();
        heap.fix(root.heap_idx() as usize);

        assert!(!Arc::ptr_eq(heap.peek().unwrap(), &root));
        assert!(heap_indices_consistent(&heap));
    }

    #[test]
    fn test_remove_middle_keeps_indices() {
        let mut heap = BackendHeap::new();
        let backends: Vec<_> = (0..6).map(|i| healthy(9000 + i)).collect();
        for (n, b) in backends.iter().enumerate() {
            for _ in 0..n {
                b.add_load();
            }
            heap.push(Arc::clone(b));
        }

        let removed = heap.remove(2).unwrap();
        assert_eq!(removed.heap_idx(), -1);
        assert_eq!(heap.len(), 5);
        assert!(heap_indices_consistent(&heap));
    }

    #[test]
    fn test_rebuild_repairs_corrupt_indices() {
        let mut heap = BackendHeap::new();
        for i in 0..4 {
            heap.push(healthy(9000 + i));
        }
        // Sabotage the stored indices.
        for b in heap.iter() {
            b.set_heap_idx(7);
        }
        heap.rebuild();
        assert!(heap_indices_consistent(&heap));
    }

    #[test]
    fn test_acquire_prefers_least_loaded() {
        let pool = Arc::new(BackendPool::new());
        let light = healthy(9001);
        let heavy = healthy(9002);
        heavy.add_load();
        heavy.add_load();
        pool.insert_active(Arc::clone(&light));
        pool.insert_active(Arc::clone(&heavy));

        let guard = pool.acquire().unwrap();
        assert!(Arc::ptr_eq(guard.backend(), &light));
        assert_eq!(light.current_load(), 1);

        drop(guard);
        assert_eq!(light.current_load(), 0);
    }

    #[test]
    fn test_acquire_skips_ineligible_root() {
        let pool = Arc::new(BackendPool::new());
        let sick = healthy(9001);
        let ok = healthy(9002);
        ok.add_load();
        pool.insert_active(Arc::clone(&sick));
        pool.insert_active(Arc::clone(&ok));

        // The least-loaded root turns ill between dispatches; acquire skims
        // it into the recovery worklist and returns the next-best backend.
        let root = pool.with_inner(|h, _| Arc::clone(h.peek().unwrap()));
        assert!(Arc::ptr_eq(&root, &sick));
        sick.set_ill(true);

        let guard = pool.acquire().unwrap();
        assert!(Arc::ptr_eq(guard.backend(), &ok));
        drop(guard);

        assert_eq!(pool.active_len(), 1);
        assert_eq!(pool.unhealthy_len(), 1);
        assert_eq!(sick.heap_idx(), -1);
    }

    #[test]
    fn test_acquire_exhausted_returns_none() {
        let pool = Arc::new(BackendPool::new());
        let dead = healthy(9001);
        dead.set_alive(false);
        pool.insert_active(Arc::clone(&dead));

        assert!(pool.acquire().is_none());
        // The dead backend moved to the recovery worklist.
        assert_eq!(pool.active_len(), 0);
        assert_eq!(pool.unhealthy_len(), 1);

        // Empty heap with a non-empty worklist still dispatches nothing.
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_guard_decrement_after_removal_is_safe() {
        let pool = Arc::new(BackendPool::new());
        let b = healthy(9001);
        pool.insert_active(Arc::clone(&b));

        let guard = pool.acquire().unwrap();
        assert_eq!(b.current_load(), 1);

        // Backend leaves the heap while the request is in flight.
        pool.with_inner(|heap, _| assert_eq!(heap.len(), 1));
        {
            let mut inner = pool.inner.lock();
            inner.active.remove(0);
        }
        drop(guard);
        assert_eq!(b.current_load(), 0);
        assert_eq!(b.heap_idx(), -1);
    }

    #[test]
    fn test_admit_respects_capacity() {
        let pool = Arc::new(BackendPool::new());
        pool.insert_active(healthy(9001));
        pool.insert_active(healthy(9002));

        assert!(pool.admit(healthy(9003), 3));
        // Pending backends count against the ceiling.
        assert!(!pool.admit(healthy(9004), 3));
        assert_eq!(pool.total_len(), 3);
    }

    #[test]
    fn test_begin_retirement_floor() {
        let pool = Arc::new(BackendPool::new());
        pool.insert_active(healthy(9001));

        assert!(pool.begin_retirement(1).is_none());
        assert_eq!(pool.active_len(), 1);
    }

    #[test]
    fn test_begin_retirement_defers_while_loaded() {
        let pool = Arc::new(BackendPool::new());
        let a = healthy(9001);
        let b = healthy(9002);
        b.add_load();
        pool.insert_active(Arc::clone(&a));
        pool.insert_active(Arc::clone(&b));

        let guard = pool.acquire().unwrap();
        let picked = Arc::clone(guard.backend());
        assert!(Arc::ptr_eq(&picked, &a));

        // Least-loaded root is busy: retirement restores it untouched.
        assert!(pool.begin_retirement(1).is_none());
        assert_eq!(pool.active_len(), 2);
        assert!(!picked.shutting_down());
        assert!(picked.ready());

        drop(guard);

        // Drained now: retirement detaches it.
        let retired = pool.begin_retirement(1).unwrap();
        assert!(Arc::ptr_eq(&retired, &a));
        assert!(retired.shutting_down());
        assert_eq!(pool.active_len(), 1);
        assert_eq!(retired.heap_idx(), -1);
    }

    #[test]
    fn test_reinstate_after_failed_teardown() {
        let pool = Arc::new(BackendPool::new());
        pool.insert_active(healthy(9001));
        pool.insert_active(healthy(9002));

        let retired = pool.begin_retirement(1).unwrap();
        pool.reinstate(Arc::clone(&retired));

        assert_eq!(pool.active_len(), 2);
        assert!(!retired.shutting_down());
        assert!(retired.ready());
    }

    #[test]
    fn test_apply_probe_state_machine() {
        let grace = Duration::from_secs(0);
        let pool = Arc::new(BackendPool::new());
        let b = Arc::new(Backend::pending(
            Url::parse("http://localhost:9001").unwrap(),
            "cid",
        ));
        assert!(pool.admit(Arc::clone(&b), 5));

        // Pending -> Healthy on first success, promoted into the heap.
        pool.apply_probe(&b, true, grace);
        assert!(b.ready());
        assert_eq!(pool.active_len(), 1);
        assert_eq!(pool.unhealthy_len(), 0);

        // Healthy -> Ill on first failure, stays in the heap.
        pool.apply_probe(&b, false, grace);
        assert_eq!(b.health(), crate::backend::HealthClass::Ill);
        assert_eq!(pool.active_len(), 1);

        // Ill -> Dead on second failure (grace elapsed), moved to worklist.
        pool.apply_probe(&b, false, grace);
        assert_eq!(b.health(), crate::backend::HealthClass::Dead);
        assert_eq!(pool.active_len(), 0);
        assert_eq!(pool.unhealthy_len(), 1);

        // Dead -> Healthy recovery re-enters the heap exactly once.
        pool.apply_probe(&b, true, grace);
        pool.apply_probe(&b, true, grace);
        assert_eq!(pool.active_len(), 1);
        assert_eq!(pool.unhealthy_len(), 0);
    }

    #[test]
    fn test_apply_probe_grace_postpones_death() {
        let grace = Duration::from_secs(3600);
        let pool = Arc::new(BackendPool::new());
        let b = Arc::new(Backend::pending(
            Url::parse("http://localhost:9001").unwrap(),
            "cid",
        ));
        assert!(pool.admit(Arc::clone(&b), 5));

        // Two failures inside the grace window leave the backend pending.
        pool.apply_probe(&b, false, grace);
        pool.apply_probe(&b, false, grace);
        assert_eq!(b.health(), crate::backend::HealthClass::Pending);
        assert_eq!(pool.unhealthy_len(), 1);
        assert_eq!(pool.active_len(), 0);
    }

    #[test]
    fn test_apply_probe_skips_shutting_down() {
        let grace = Duration::from_secs(0);
        let pool = Arc::new(BackendPool::new());
        let b = healthy(9001);
        b.set_shutting_down(true);

        pool.apply_probe(&b, false, grace);
        assert_eq!(b.health(), crate::backend::HealthClass::Healthy);
        assert_eq!(pool.total_len(), 0);
    }

    #[test]
    fn test_drain_for_review_clears_worklist() {
        let pool = Arc::new(BackendPool::new());
        pool.insert_active(healthy(9001));
        assert!(pool.admit(healthy(9002), 5));

        let batch = pool.drain_for_review();
        assert_eq!(batch.len(), 2);
        assert_eq!(pool.unhealthy_len(), 0);
        // Active entries are snapshotted, not removed.
        assert_eq!(pool.active_len(), 1);
    }

    #[test]
    fn test_membership_is_exclusive() {
        let grace = Duration::from_secs(0);
        let pool = Arc::new(BackendPool::new());
        let b = Arc::new(Backend::pending(
            Url::parse("http://localhost:9001").unwrap(),
            "cid",
        ));
        assert!(pool.admit(Arc::clone(&b), 5));

        pool.apply_probe(&b, true, grace);
        pool.with_inner(|heap, unhealthy| {
            let in_heap = heap.iter().filter(|x| Arc::ptr_eq(x, &b)).count();
            let in_list = unhealthy.iter().filter(|x| Arc::ptr_eq(x, &b)).count();
            assert_eq!(in_heap + in_list, 1);
        });

        pool.apply_probe(&b, false, grace);
        pool.apply_probe(&b, false, grace);
        pool.with_inner(|heap, unhealthy| {
            let in_heap = heap.iter().filter(|x| Arc::ptr_eq(x, &b)).count();
            let in_list = unhealthy.iter().filter(|x| Arc::ptr_eq(x, &b)).count();
            assert_eq!(in_heap + in_list, 1);
        });
    }

    #[test]
    fn test_drain_all_empties_pool() {
        let pool = Arc::new(BackendPool::new());
        pool.insert_active(healthy(9001));
        pool.insert_active(healthy(9002));
        assert!(pool.admit(healthy(9003), 5));

        let all = pool.drain_all();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|b| b.shutting_down()));
        assert_eq!(pool.total_len(), 0);
    }
}
