//! A single downstream container instance and its health/load state

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicIsize, Ordering};
use std::time::Instant;
use url::Url;

/// The four health classifications a backend can be in.
///
/// The classification is encoded by the `(alive, ill)` flag pair:
/// `Healthy = (true, false)`, `Ill = (true, true)`, `Dead = (false, false)`,
/// `Pending = (false, true)` for brand-new backends awaiting their first
/// successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthClass {
    Healthy,
    Ill,
    Dead,
    Pending,
}

impl std::fmt::Display for HealthClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthClass::Healthy => write!(f, "healthy"),
            HealthClass::Ill => write!(f, "ill"),
            HealthClass::Dead => write!(f, "dead"),
            HealthClass::Pending => write!(f, "pending"),
        }
    }
}

/// One backend container eligible (or recovering towards eligibility) for
/// proxied traffic.
///
/// `alive`, `ill` and `heap_idx` are only written while holding the pool
/// mutex; they are atomics so that the heap comparator and log statements can
/// read them without taking a `&mut`. `current_load` and `shutting_down` are
/// true lock-free state shared with in-flight request tasks.
pub struct Backend {
    /// Address of the container's published port, e.g. `http://localhost:32771`.
    url: Url,
    /// Identifier assigned by the container runtime.
    container_id: String,
    alive: AtomicBool,
    ill: AtomicBool,
    shutting_down: AtomicBool,
    /// Number of in-flight requests routed through this backend.
    current_load: AtomicI64,
    /// Position inside the pool's priority heap; `-1` when not in the heap.
    heap_idx: AtomicIsize,
    /// Creation time, used by the startup grace rule.
    start_time: Instant,
}

impl Backend {
    /// Create a backend in the `Pending` state, not yet dispatch-eligible.
    /// It becomes `Healthy` on its first successful probe.
    pub fn pending(url: Url, container_id: impl Into<String>) -> Self {
        Self {
            url,
            container_id: container_id.into(),
            alive: AtomicBool::new(false),
            ill: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            current_load: AtomicI64::new(0),
            heap_idx: AtomicIsize::new(-1),
            start_time: Instant::now(),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Absolute URI string for a request path against this backend.
    pub fn target_uri(&self, path_and_query: &str) -> String {
        format!(
            "{}://{}{}",
            self.url.scheme(),
            self.url.authority(),
            path_and_query
        )
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Write requires the pool mutex.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn ill(&self) -> bool {
        self.ill.load(Ordering::SeqCst)
    }

    /// Write requires the pool mutex.
    pub fn set_ill(&self, ill: bool) {
        self.ill.store(ill, Ordering::SeqCst);
    }

    pub fn shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn set_shutting_down(&self, v: bool) {
        self.shutting_down.store(v, Ordering::SeqCst);
    }

    pub fn current_load(&self) -> i64 {
        self.current_load.load(Ordering::SeqCst)
    }

    pub fn add_load(&self) {
        self.current_load.fetch_add(1, Ordering::SeqCst);
    }

    pub fn sub_load(&self) {
        self.current_load.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn heap_idx(&self) -> isize {
        self.heap_idx.load(Ordering::SeqCst)
    }

    /// Write requires the pool mutex; only the heap helpers should call this.
    pub fn set_heap_idx(&self, idx: isize) {
        self.heap_idx.store(idx, Ordering::SeqCst);
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Eligible to receive proxied traffic right now.
    pub fn ready(&self) -> bool {
        self.alive() && !self.ill() && !self.shutting_down()
    }

    pub fn health(&self) -> HealthClass {
        match (self.alive(), self.ill()) {
            (true, false) => HealthClass::Healthy,
            (true, true) => HealthClass::Ill,
            (false, false) => HealthClass::Dead,
            (false, true) => HealthClass::Pending,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("url", &self.url.as_str())
            .field("container_id", &self.container_id)
            .field("health", &self.health())
            .field("shutting_down", &self.shutting_down())
            .field("current_load", &self.current_load())
            .field("heap_idx", &self.heap_idx())
            .finish()
    }
}
