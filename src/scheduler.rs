//! The fork-join worker pool behind the multi-threaded GEMM.
//!
//! The pool supports exactly one parallelization pattern: a fixed set of
//! workers is each given one unit of work, the dispatching thread runs the
//! final unit itself, and then waits for all workers to finish. Workers are
//! long-lived; the same pool is synchronized repeatedly, once per outer
//! column tile, so wake-up latency matters.
//!
//! All waiting uses a hybrid strategy: first busy-spin for a bounded number
//! of cycles, then fall back to blocking on a condition variable. The spin
//! phase keeps wake-ups fast for small workloads, where a worker is
//! re-dispatched almost immediately; the blocking fallback avoids burning a
//! core while a worker sits idle between GEMM calls.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::allocator::Allocator;

/// Upper bound on busy-spin iterations before blocking. This is a
/// latency/throughput tradeoff constant, not incidental; both phases of the
/// wait are required.
const MAX_BUSY_WAIT_SPINS: usize = 32 * 1024;

/// Spin until `condition` returns true or the spin budget runs out. Returns
/// whether the condition was observed.
fn busy_wait(condition: impl Fn() -> bool) -> bool {
    for _ in 0..MAX_BUSY_WAIT_SPINS {
        if condition() {
            return true;
        }
        std::hint::spin_loop();
    }
    false
}

/// Lets one thread wait for N events to occur. This is how the dispatching
/// thread waits for all the workers to have finished working.
pub(crate) struct BlockingCounter {
    count: AtomicUsize,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl BlockingCounter {
    pub(crate) fn new() -> BlockingCounter {
        BlockingCounter {
            count: AtomicUsize::new(0),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Set the number of decrement events the next `wait` call waits for.
    /// Only legal while no thread is waiting.
    pub(crate) fn reset(&self, initial_count: usize) {
        let _guard = self.mutex.lock().unwrap();
        assert_eq!(self.count.load(Ordering::Acquire), 0, "counter still in use");
        self.count.store(initial_count, Ordering::Release);
    }

    /// Decrement the counter; if it hits zero, wake the waiting thread and
    /// return true.
    pub(crate) fn decrement_count(&self) -> bool {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "counter decremented below zero");
        if previous == 1 {
            // Taking the mutex orders this notification after the waiter's
            // check of the count, so the wake-up cannot be lost.
            let _guard = self.mutex.lock().unwrap();
            self.cond.notify_one();
            true
        } else {
            false
        }
    }

    /// Wait for the counter to reach zero: spin first, then block.
    pub(crate) fn wait(&self) {
        if busy_wait(|| self.count.load(Ordering::Acquire) == 0) {
            return;
        }
        let mut guard = self.mutex.lock().unwrap();
        while self.count.load(Ordering::Acquire) != 0 {
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

/// A workload for a worker: pack a slice of the LHS, run the kernel and
/// unpack the results, or anything else shaped like one unit of work.
pub(crate) trait Task: Send {
    fn run(&mut self, local_allocator: &mut Allocator);
}

/// States of a worker thread. Stored as `u8` so the wait loop can spin on an
/// atomic mirror of the mutex-guarded state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum WorkerState {
    /// The initial state before the thread main loop runs.
    ThreadStartup = 0,
    /// Is not working, has not yet received new work to do.
    Ready = 1,
    /// Has work to do.
    HasWork = 2,
    /// Should exit at earliest convenience.
    ExitAsSoonAsPossible = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> WorkerState {
        match value {
            0 => WorkerState::ThreadStartup,
            1 => WorkerState::Ready,
            2 => WorkerState::HasWork,
            3 => WorkerState::ExitAsSoonAsPossible,
            _ => unreachable!("invalid worker state"),
        }
    }
}

struct WorkerSlot {
    state: WorkerState,
    task: Option<Box<dyn Task>>,
}

struct WorkerShared {
    /// Mirror of `slot.state` for the busy-spin phase of waits.
    state: AtomicU8,
    slot: Mutex<WorkerSlot>,
    cond: Condvar,
    /// The pool's counter, notified every time this worker becomes Ready.
    counter: Arc<BlockingCounter>,
}

impl WorkerShared {
    /// Transition to `new_state`, enforcing the legal transitions. May be
    /// called from the worker thread or the dispatching thread.
    fn change_state(&self, new_state: WorkerState) {
        let mut slot = self.slot.lock().unwrap();
        self.change_state_locked(&mut slot, new_state);
    }

    fn change_state_locked(&self, slot: &mut WorkerSlot, new_state: WorkerState) {
        assert_ne!(slot.state, new_state);
        match slot.state {
            WorkerState::ThreadStartup => {
                assert_eq!(new_state, WorkerState::Ready);
            }
            WorkerState::Ready => {
                assert!(
                    new_state == WorkerState::HasWork
                        || new_state == WorkerState::ExitAsSoonAsPossible
                );
            }
            WorkerState::HasWork => {
                assert!(
                    new_state == WorkerState::Ready
                        || new_state == WorkerState::ExitAsSoonAsPossible
                );
            }
            WorkerState::ExitAsSoonAsPossible => {
                unreachable!("no transitions out of the exit state");
            }
        }
        slot.state = new_state;
        self.state.store(new_state as u8, Ordering::Release);
        self.cond.notify_one();
        if new_state == WorkerState::Ready {
            self.counter.decrement_count();
        }
    }

    /// Wait until the state changes away from `Ready` and return the new
    /// state: spin first, then block.
    fn wait_for_work_or_exit(&self) -> WorkerState {
        let observed = busy_wait(|| {
            WorkerState::from_u8(self.state.load(Ordering::Acquire)) != WorkerState::Ready
        });
        if observed {
            return WorkerState::from_u8(self.state.load(Ordering::Acquire));
        }
        let mut slot = self.slot.lock().unwrap();
        while slot.state == WorkerState::Ready {
            slot = self.cond.wait(slot).unwrap();
        }
        slot.state
    }
}

/// A worker thread.
struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(counter: Arc<BlockingCounter>) -> Worker {
        let shared = Arc::new(WorkerShared {
            state: AtomicU8::new(WorkerState::ThreadStartup as u8),
            slot: Mutex::new(WorkerSlot {
                state: WorkerState::ThreadStartup,
                task: None,
            }),
            cond: Condvar::new(),
            counter,
        });
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::spawn(move || worker_loop(thread_shared));
        Worker {
            shared,
            thread: Some(thread),
        }
    }

    /// Called by the dispatching thread to give this worker work to do.
    /// Only legal while the worker is Ready.
    fn start_work(&self, task: Box<dyn Task>) {
        let mut slot = self.shared.slot.lock().unwrap();
        assert!(slot.task.is_none(), "worker given work while already busy");
        assert_eq!(slot.state, WorkerState::Ready);
        slot.task = Some(task);
        self.shared
            .change_state_locked(&mut slot, WorkerState::HasWork);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // The pool only drops workers while they are idle; a worker mid-task
        // would trip the transition assertions.
        self.shared.change_state(WorkerState::ExitAsSoonAsPossible);
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

/// Thread main loop.
fn worker_loop(shared: Arc<WorkerShared>) {
    // Each worker has a private arena so tasks can allocate their packed
    // blocks without contending with other threads.
    let mut local_allocator = Allocator::new();

    shared.change_state(WorkerState::Ready);

    loop {
        match shared.wait_for_work_or_exit() {
            WorkerState::HasWork => {
                // Take the task out of the slot, run it unlocked, then
                // revert to Ready.
                let mut task = {
                    let mut slot = shared.slot.lock().unwrap();
                    slot.task.take().expect("HasWork state without a task")
                };
                task.run(&mut local_allocator);
                drop(task);
                shared.change_state(WorkerState::Ready);
            }
            WorkerState::ExitAsSoonAsPossible => return,
            state => unreachable!("unexpected worker state {:?}", state),
        }
    }
}

/// A very simple pool of workers, supporting only the specific
/// parallelization pattern used by the multi-threaded GEMM.
pub(crate) struct WorkersPool {
    workers: Vec<Worker>,
    counter: Arc<BlockingCounter>,
}

impl WorkersPool {
    pub(crate) fn new() -> WorkersPool {
        WorkersPool {
            workers: Vec::new(),
            counter: Arc::new(BlockingCounter::new()),
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Ensure the pool has at least `count` workers, waiting for any new
    /// worker to reach its Ready state. Workers are never removed outside of
    /// dropping the whole pool, to avoid thread churn across repeated calls.
    pub(crate) fn create_workers(&mut self, count: usize) {
        if self.workers.len() >= count {
            return;
        }
        self.counter.reset(count - self.workers.len());
        while self.workers.len() < count {
            self.workers.push(Worker::spawn(Arc::clone(&self.counter)));
        }
        self.counter.wait();
    }

    /// Run one dispatch round: all but the last task go to workers, the last
    /// runs on the calling thread, then all workers are joined.
    ///
    /// Running the final workload inline keeps the number of concurrently
    /// active threads equal to the requested thread count, with a 1:1
    /// mapping to cores.
    pub(crate) fn execute<'a>(
        &mut self,
        tasks: Vec<Box<dyn Task + 'a>>,
        master_allocator: &mut Allocator,
    ) {
        assert!(!tasks.is_empty());
        let workers_count = tasks.len() - 1;
        assert!(workers_count <= self.workers.len());

        self.counter.reset(workers_count);
        for (index, task) in tasks.into_iter().enumerate() {
            if index < workers_count {
                // Safety: the counter wait below blocks until every
                // dispatched task has completed and its worker is Ready
                // again, so no task outlives the borrows it captures.
                let task: Box<dyn Task> =
                    unsafe { std::mem::transmute::<Box<dyn Task + 'a>, Box<dyn Task>>(task) };
                self.workers[index].start_work(task);
            } else {
                let mut task = task;
                task.run(master_allocator);
            }
        }
        self.counter.wait();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{BlockingCounter, Task, WorkersPool};
    use crate::allocator::Allocator;

    struct CountingTask {
        counter: Arc<AtomicUsize>,
        uses_allocator: bool,
    }

    impl Task for CountingTask {
        fn run(&mut self, local_allocator: &mut Allocator) {
            if self.uses_allocator {
                let handle = local_allocator.reserve::<i32>(16);
                local_allocator.commit();
                unsafe {
                    local_allocator.slice_mut::<i32>(handle, 16).fill(1);
                }
                local_allocator.decommit();
            }
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_blocking_counter_single_thread() {
        let counter = BlockingCounter::new();
        counter.reset(2);
        assert!(!counter.decrement_count());
        assert!(counter.decrement_count());
        counter.wait();
    }

    #[test]
    fn test_pool_runs_all_tasks() {
        let mut pool = WorkersPool::new();
        pool.create_workers(3);
        assert_eq!(pool.worker_count(), 3);

        let mut master_allocator = Allocator::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Box<dyn Task>> = (0..4)
            .map(|i| {
                Box::new(CountingTask {
                    counter: Arc::clone(&ran),
                    uses_allocator: i % 2 == 0,
                }) as Box<dyn Task>
            })
            .collect();
        pool.execute(tasks, &mut master_allocator);
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_pool_is_reusable_across_rounds() {
        let mut pool = WorkersPool::new();
        pool.create_workers(2);

        let mut master_allocator = Allocator::new();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let tasks: Vec<Box<dyn Task>> = (0..3)
                .map(|_| {
                    Box::new(CountingTask {
                        counter: Arc::clone(&ran),
                        uses_allocator: false,
                    }) as Box<dyn Task>
                })
                .collect();
            pool.execute(tasks, &mut master_allocator);
        }
        assert_eq!(ran.load(Ordering::SeqCst), 150);
    }

    #[test]
    fn test_pool_grow_only() {
        let mut pool = WorkersPool::new();
        pool.create_workers(2);
        pool.create_workers(1);
        assert_eq!(pool.worker_count(), 2);
        pool.create_workers(4);
        assert_eq!(pool.worker_count(), 4);
    }

    #[test]
    fn test_tasks_capture_borrows() {
        // Tasks borrowing local data are sound because execute joins before
        // returning.
        struct FillTask<'a> {
            dest: &'a mut [u32],
            value: u32,
        }
        impl Task for FillTask<'_> {
            fn run(&mut self, _local_allocator: &mut Allocator) {
                self.dest.fill(self.value);
            }
        }

        let mut pool = WorkersPool::new();
        pool.create_workers(1);
        let mut master_allocator = Allocator::new();

        let mut data = vec![0u32; 8];
        let (left, right) = data.split_at_mut(4);
        let tasks: Vec<Box<dyn Task + '_>> = vec![
            Box::new(FillTask {
                dest: left,
                value: 7,
            }),
            Box::new(FillTask {
                dest: right,
                value: 9,
            }),
        ];
        pool.execute(tasks, &mut master_allocator);
        assert_eq!(data, [7, 7, 7, 7, 9, 9, 9, 9]);
    }
}
