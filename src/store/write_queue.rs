use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

/// Distinct areas write locking is done, order is irrelevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    Generic,
    BlockProcessor,
    ConfirmationHeight,
    Pruning,
    BoundedBacklog,
    OnlineWeight,
    Testing,
}

struct QueueState {
    queue: VecDeque<(Writer, u64)>,
    next_id: u64,
}

/// Allocates database write access fairly rather than racing on a mutex.
/// Callers `wait()` for their turn and hold the returned guard for the
/// duration of the write transaction.
pub struct WriteQueue {
    weak_self: Weak<WriteQueue>,
    state: Mutex<QueueState>,
    condition: Condvar,
}

impl WriteQueue {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                next_id: 0,
            }),
            condition: Condvar::new(),
        })
    }

    /// Blocks until this writer reaches the head of the queue. Acquiring two
    /// slots from the same thread deadlocks, except for `Writer::Testing`.
    #[must_use = "the guard blocks other waiters until dropped"]
    pub fn wait(&self, writer: Writer) -> WriteGuard {
        let id = self.acquire(writer);
        WriteGuard {
            queue: self.weak_self.upgrade().expect("queue is alive"),
            writer,
            id,
            owns: true,
        }
    }

    /// True if this writer is anywhere in the queue. Informational only.
    pub fn contains(&self, writer: Writer) -> bool {
        self.state
            .lock()
            .queue
            .iter()
            .any(|(entry, _)| *entry == writer)
    }

    fn acquire(&self, writer: Writer) -> u64 {
        let mut state = self.state.lock();
        debug_assert!(
            writer == Writer::Testing || !state.queue.iter().any(|(entry, _)| *entry == writer)
        );
        let id = state.next_id;
        state.next_id += 1;
        state.queue.push_back((writer, id));
        while state.queue.front().map(|(_, front_id)| *front_id) != Some(id) {
            self.condition.wait(&mut state);
        }
        id
    }

    fn release(&self, writer: Writer, id: u64) {
        {
            let mut state = self.state.lock();
            let front = state.queue.pop_front();
            debug_assert_eq!(front, Some((writer, id)));
        }
        self.condition.notify_all();
    }
}

/// Move-only token proving head-of-queue write access.
pub struct WriteGuard {
    queue: Arc<WriteQueue>,
    writer: Writer,
    id: u64,
    owns: bool,
}

impl WriteGuard {
    pub fn writer(&self) -> Writer {
        self.writer
    }

    pub fn is_owned(&self) -> bool {
        self.owns
    }

    pub fn release(&mut self) {
        assert!(self.owns);
        self.queue.release(self.writer, self.id);
        self.owns = false;
    }

    /// Re-queues for the same slot, blocking until it is reacquired.
    pub fn renew(&mut self) {
        assert!(!self.owns);
        self.id = self.queue.acquire(self.writer);
        self.owns = true;
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.owns {
            self.queue.release(self.writer, self.id);
        }
    }
}
