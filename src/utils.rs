use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// POSIX seconds, used for sideband timestamps and socket bookkeeping.
pub fn seconds_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

type Observer<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Set of callbacks notified with a shared payload.
///
/// Observers are copied out under the lock and invoked outside of it, so
/// notifications from multiple threads may run in parallel and an observer may
/// register further observers without deadlocking.
pub struct ObserverSet<T> {
    observers: Mutex<Vec<std::sync::Arc<Observer<T>>>>,
}

impl<T> ObserverSet<T> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, observer: impl Fn(&T) + Send + Sync + 'static) {
        self.observers
            .lock()
            .push(std::sync::Arc::new(Box::new(observer)));
    }

    pub fn notify(&self, payload: &T) {
        let snapshot: Vec<_> = self.observers.lock().iter().cloned().collect();
        for observer in snapshot {
            observer(payload);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.observers.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }
}

impl<T> Default for ObserverSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

type Task = Box<dyn FnOnce() + Send>;

struct WorkerState {
    queue: std::collections::VecDeque<Task>,
    stopped: bool,
}

/// Single background thread draining a task queue. Used where notifications
/// must leave the posting thread, e.g. while a write transaction is held.
pub struct Worker {
    state: std::sync::Arc<Mutex<WorkerState>>,
    condition: std::sync::Arc<parking_lot::Condvar>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Worker {
    pub fn new(name: &str) -> Self {
        let state = std::sync::Arc::new(Mutex::new(WorkerState {
            queue: std::collections::VecDeque::new(),
            stopped: false,
        }));
        let condition = std::sync::Arc::new(parking_lot::Condvar::new());
        let thread = {
            let state = state.clone();
            let condition = condition.clone();
            std::thread::Builder::new()
                .name(name.into())
                .spawn(move || loop {
                    let task = {
                        let mut guard = state.lock();
                        while guard.queue.is_empty() && !guard.stopped {
                            condition.wait(&mut guard);
                        }
                        if guard.stopped && guard.queue.is_empty() {
                            return;
                        }
                        guard.queue.pop_front()
                    };
                    if let Some(task) = task {
                        task();
                    }
                })
                .expect("spawning worker thread")
        };
        Self {
            state,
            condition,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.queue.push_back(Box::new(task));
        }
        self.condition.notify_all();
    }

    pub fn queued_tasks(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Drains remaining tasks, then joins the thread.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.stopped = true;
        }
        self.condition.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}
