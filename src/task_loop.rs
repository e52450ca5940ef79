//! Single-writer task loop.
//!
//! All mutable client state is owned by one spawned worker task. Everything
//! else (public API calls, transport callbacks, timers) funnels closures into
//! the worker through a [`LoopHandle`], so no lock ever guards client state
//! and no two tasks observe it concurrently.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// A unit of work run on the loop with exclusive access to the state.
///
/// Tasks receive the handle as well, so they can schedule follow-up work
/// without capturing a clone of it.
pub type Task<S> = Box<dyn FnOnce(&mut S, &LoopHandle<S>) + Send + 'static>;

enum LoopCmd<S> {
    Run(Task<S>),
    Schedule(Instant, Task<S>),
    Stop,
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_LOOP: u64;
}

/// Cloneable entry point into a [`TaskLoop`].
pub struct LoopHandle<S> {
    tx: mpsc::UnboundedSender<LoopCmd<S>>,
    loop_id: u64,
}

impl<S> Clone for LoopHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            loop_id: self.loop_id,
        }
    }
}

impl<S: Send + 'static> LoopHandle<S> {
    /// Enqueues `task` for execution on the loop. Returns `false` if the
    /// loop has stopped; the task is dropped in that case.
    ///
    /// Code that is already running on the loop holds `&mut S` and calls
    /// components directly; `run` from loop context enqueues behind the
    /// current task rather than recursing.
    pub fn run(&self, task: impl FnOnce(&mut S, &LoopHandle<S>) + Send + 'static) -> bool {
        self.tx.send(LoopCmd::Run(Box::new(task))).is_ok()
    }

    /// Enqueues `task` to run no earlier than `delay` from now. Best-effort:
    /// stopping the loop drops all delayed tasks.
    pub fn schedule(
        &self,
        delay: Duration,
        task: impl FnOnce(&mut S, &LoopHandle<S>) + Send + 'static,
    ) -> bool {
        let deadline = Instant::now() + delay;
        self.tx
            .send(LoopCmd::Schedule(deadline, Box::new(task)))
            .is_ok()
    }

    /// Whether the calling task is this loop's worker.
    pub fn running_on_loop(&self) -> bool {
        CURRENT_LOOP
            .try_with(|id| *id == self.loop_id)
            .unwrap_or(false)
    }
}

struct TimedTask<S> {
    deadline: Instant,
    seq: u64,
    task: Task<S>,
}

impl<S> PartialEq for TimedTask<S> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<S> Eq for TimedTask<S> {}

impl<S> PartialOrd for TimedTask<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for TimedTask<S> {
    // Inverted so the BinaryHeap pops the earliest deadline first,
    // FIFO within a deadline.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Owner of the worker task. Dropping it stops the loop.
pub struct TaskLoop<S> {
    handle: LoopHandle<S>,
    worker: JoinHandle<()>,
}

impl<S: Send + 'static> TaskLoop<S> {
    /// Spawns a worker task owning `state`.
    pub fn spawn(state: S) -> Self {
        let loop_id = NEXT_LOOP_ID.fetch_add(1, AtomicOrdering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = LoopHandle { tx, loop_id };
        let worker_handle = handle.clone();
        let worker = tokio::spawn(CURRENT_LOOP.scope(loop_id, async move {
            worker_loop(state, rx, worker_handle).await;
        }));
        Self { handle, worker }
    }

    pub fn handle(&self) -> &LoopHandle<S> {
        &self.handle
    }

    /// Stops the worker: queued and delayed tasks are dropped, the state is
    /// dropped on the worker task.
    pub fn stop(&self) {
        let _ = self.handle.tx.send(LoopCmd::Stop);
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }
}

impl<S> Drop for TaskLoop<S> {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(LoopCmd::Stop);
    }
}

async fn worker_loop<S: Send + 'static>(
    mut state: S,
    mut rx: mpsc::UnboundedReceiver<LoopCmd<S>>,
    handle: LoopHandle<S>,
) {
    let mut timers: BinaryHeap<TimedTask<S>> = BinaryHeap::new();
    let mut timer_seq: u64 = 0;
    loop {
        let next_deadline = timers.peek().map(|t| t.deadline);
        tokio::select! {
            biased;
            cmd = rx.recv() => match cmd {
                Some(LoopCmd::Run(task)) => run_task(&mut state, &handle, task),
                Some(LoopCmd::Schedule(deadline, task)) => {
                    timer_seq += 1;
                    timers.push(TimedTask { deadline, seq: timer_seq, task });
                }
                Some(LoopCmd::Stop) | None => break,
            },
            _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                if next_deadline.is_some() =>
            {
                let now = Instant::now();
                while timers.peek().map_or(false, |t| t.deadline <= now) {
                    if let Some(due) = timers.pop() {
                        run_task(&mut state, &handle, due.task);
                    }
                }
            }
        }
    }
}

fn run_task<S>(state: &mut S, handle: &LoopHandle<S>, task: Task<S>) {
    let result = catch_unwind(AssertUnwindSafe(move || task(state, handle)));
    if result.is_err() {
        log::error!("[ledger-link] loop task panicked; loop continues");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    struct Counter {
        value: u32,
    }

    async fn settle(handle: &LoopHandle<Counter>) -> u32 {
        let (tx, rx) = oneshot::channel();
        handle.run(move |state, _| {
            let _ = tx.send(state.value);
        });
        timeout(Duration::from_secs(1), rx)
            .await
            .expect("loop alive")
            .expect("task ran")
    }

    #[tokio::test]
    async fn run_executes_with_state_access() {
        let lp = TaskLoop::spawn(Counter { value: 0 });
        lp.handle().run(|state, _| state.value += 5);
        assert_eq!(settle(lp.handle()).await, 5);
    }

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let lp = TaskLoop::spawn(Counter { value: 1 });
        lp.handle().run(|state, _| state.value += 1);
        lp.handle().run(|state, _| state.value *= 10);
        assert_eq!(settle(lp.handle()).await, 20);
    }

    #[tokio::test]
    async fn schedule_runs_after_delay() {
        let lp = TaskLoop::spawn(Counter { value: 0 });
        lp.handle()
            .schedule(Duration::from_millis(20), |state, _| state.value = 7);
        assert_eq!(settle(lp.handle()).await, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(settle(lp.handle()).await, 7);
    }

    #[tokio::test]
    async fn tasks_can_schedule_follow_ups() {
        let lp = TaskLoop::spawn(Counter { value: 0 });
        lp.handle().run(|state, handle| {
            state.value = 1;
            handle.schedule(Duration::from_millis(10), |state, _| state.value += 10);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(settle(lp.handle()).await, 11);
    }

    #[tokio::test]
    async fn stop_drops_pending_and_delayed_tasks() {
        let lp = TaskLoop::spawn(Counter { value: 0 });
        lp.handle()
            .schedule(Duration::from_millis(10), |state, _| state.value = 99);
        lp.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lp.is_finished());
        assert!(!lp.handle().run(|_, _| {}));
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_the_loop() {
        let lp = TaskLoop::spawn(Counter { value: 0 });
        lp.handle().run(|_, _| panic!("boom"));
        lp.handle().run(|state, _| state.value = 3);
        assert_eq!(settle(lp.handle()).await, 3);
    }

    #[tokio::test]
    async fn running_on_loop_only_inside_worker() {
        let lp = TaskLoop::spawn(Counter { value: 0 });
        assert!(!lp.handle().running_on_loop());
        let (tx, rx) = oneshot::channel();
        lp.handle().run(move |_, handle| {
            let _ = tx.send(handle.running_on_loop());
        });
        assert!(rx.await.expect("task ran"));
    }
}
