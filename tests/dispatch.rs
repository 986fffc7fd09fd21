//! Dispatch and health-transition behavior under concurrent load

use shoal::backend::{Backend, HealthClass};
use shoal::pool::BackendPool;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

fn healthy_backend(port: u16) -> Arc<Backend> {
    let b = Backend::pending(
        Url::parse(&format!("http://localhost:{port}")).unwrap(),
        format!("cid-{port}"),
    );
    b.set_alive(true);
    b.set_ill(false);
    Arc::new(b)
}

// ============================================================================
// Concurrent dispatch
// ============================================================================

mod concurrency_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_loads_return_to_zero_after_burst() {
        let pool = Arc::new(BackendPool::new());
        let backends: Vec<_> = (0..3).map(|i| healthy_backend(9000 + i)).collect();
        for b in &backends {
            pool.insert_active(Arc::clone(b));
        }

        let mut handles = Vec::new();
        for _ in 0..200 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                let guard = pool.acquire().expect("backend available");
                // Simulate request work while the load slot is held.
                tokio::time::sleep(Duration::from_millis(2)).await;
                drop(guard);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for b in &backends {
            assert_eq!(b.current_load(), 0, "load must drain to zero");
        }
        assert_eq!(pool.active_len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_heap_indices_stay_consistent_under_churn() {
        let pool = Arc::new(BackendPool::new());
        for i in 0..4 {
            pool.insert_active(healthy_backend(9100 + i));
        }

        let mut handles = Vec::new();
        for _ in 0..100 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                if let Some(guard) = pool.acquire() {
                    tokio::task::yield_now().await;
                    drop(guard);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        pool.with_inner(|heap, _| {
            for (i, b) in heap.iter().enumerate() {
                assert_eq!(b.heap_idx(), i as isize);
                assert!(!b.shutting_down());
            }
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_load_spreads_across_backends() {
        let pool = Arc::new(BackendPool::new());
        let a = healthy_backend(9201);
        let b = healthy_backend(9202);
        pool.insert_active(Arc::clone(&a));
        pool.insert_active(Arc::clone(&b));

        // Hold all guards at once: the least-loaded ordering must alternate
        // between the two backends rather than piling on one.
        let guards: Vec<_> = (0..10).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(a.current_load(), 5);
        assert_eq!(b.current_load(), 5);
        drop(guards);
        assert_eq!(a.current_load(), 0);
        assert_eq!(b.current_load(), 0);
    }
}

// ============================================================================
// Dispatch edge cases
// ============================================================================

mod dispatch_tests {
    use super::*;

    #[test]
    fn test_empty_pool_dispatches_nothing() {
        let pool = Arc::new(BackendPool::new());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_only_unhealthy_backends_dispatches_nothing() {
        let pool = Arc::new(BackendPool::new());
        let pending = Arc::new(Backend::pending(
            Url::parse("http://localhost:9301").unwrap(),
            "cid-pending",
        ));
        assert!(pool.admit(pending, 5));

        // A non-empty recovery worklist with an empty heap is still a
        // no-backend condition.
        assert!(pool.acquire().is_none());
        assert_eq!(pool.unhealthy_len(), 1);
    }

    #[test]
    fn test_dispatch_drains_ineligible_entries() {
        let pool = Arc::new(BackendPool::new());
        for i in 0..3 {
            let b = healthy_backend(9400 + i);
            pool.insert_active(Arc::clone(&b));
            b.set_alive(false);
        }

        assert!(pool.acquire().is_none());
        assert_eq!(pool.active_len(), 0);
        assert_eq!(pool.unhealthy_len(), 3);
    }
}

// ============================================================================
// Health transitions end to end
// ============================================================================

mod transition_tests {
    use super::*;

    #[test]
    fn test_ill_backend_recovers_into_heap_exactly_once() {
        let pool = Arc::new(BackendPool::new());
        let b = healthy_backend(9500);
        pool.insert_active(Arc::clone(&b));

        pool.apply_probe(&b, false, Duration::ZERO);
        assert_eq!(b.health(), HealthClass::Ill);

        pool.apply_probe(&b, true, Duration::ZERO);
        pool.apply_probe(&b, true, Duration::ZERO);

        assert_eq!(b.health(), HealthClass::Healthy);
        assert_eq!(pool.active_len(), 1);
        pool.with_inner(|heap, unhealthy| {
            assert_eq!(heap.len(), 1);
            assert!(unhealthy.is_empty());
        });
    }

    #[test]
    fn test_two_failures_inside_grace_keep_backend_alive() {
        let pool = Arc::new(BackendPool::new());
        // Brand-new backend, start_time is now.
        let b = Arc::new(Backend::pending(
            Url::parse("http://localhost:9501").unwrap(),
            "cid",
        ));
        assert!(pool.admit(Arc::clone(&b), 5));

        let grace = Duration::from_secs(10);
        pool.apply_probe(&b, false, grace);
        pool.apply_probe(&b, false, grace);

        // Still pending, not promoted to dead.
        assert_eq!(b.health(), HealthClass::Pending);

        // And a later success still brings it up.
        pool.apply_probe(&b, true, grace);
        assert_eq!(b.health(), HealthClass::Healthy);
        assert_eq!(pool.active_len(), 1);
    }

    #[test]
    fn test_established_backend_dies_after_two_failures() {
        let pool = Arc::new(BackendPool::new());
        let b = healthy_backend(9502);
        pool.insert_active(Arc::clone(&b));

        // Grace long expired for an established backend.
        pool.apply_probe(&b, false, Duration::ZERO);
        pool.apply_probe(&b, false, Duration::ZERO);

        assert_eq!(b.health(), HealthClass::Dead);
        assert_eq!(pool.active_len(), 0);
        assert_eq!(pool.unhealthy_len(), 1);
    }

    #[test]
    fn test_single_failure_reorders_but_keeps_serving() {
        let pool = Arc::new(BackendPool::new());
        let a = healthy_backend(9503);
        let b = healthy_backend(9504);
        pool.insert_active(Arc::clone(&a));
        pool.insert_active(Arc::clone(&b));

        pool.apply_probe(&a, false, Duration::ZERO);

        // The ill backend stays listed but the healthy one is preferred,
        // whatever their loads.
        for _ in 0..3 {
            let guard = pool.acquire().unwrap();
            assert!(Arc::ptr_eq(guard.backend(), &b));
        }
    }
}
