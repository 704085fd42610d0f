//! Shard-locking scheduler for concurrent protocol instances.
//!
//! Every instance touches a set of shards: the channels it will mutate and
//! the app it targets. Instances queue FIFO per shard and may only run while
//! they are at the head of every shard they hold, so two instances touching
//! the same channel serialize while unrelated ones proceed concurrently.

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use crate::abiencode::types::{Address, Hash};
use crate::wire::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardKey {
    Channel(Address),
    App(Hash),
}

#[derive(Debug, Default)]
pub struct ShardScheduler {
    queues: HashMap<ShardKey, VecDeque<ProcessId>>,
    held: HashMap<ProcessId, Vec<ShardKey>>,
}

impl ShardScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` on every shard in `shards`. Returns whether it is
    /// immediately runnable. Acquiring twice is a no-op that reports the
    /// current readiness.
    pub fn acquire(&mut self, task: ProcessId, shards: &[ShardKey]) -> bool {
        if !self.held.contains_key(&task) {
            for shard in shards {
                self.queues.entry(*shard).or_default().push_back(task);
            }
            self.held.insert(task, shards.to_vec());
            trace!(?task, ?shards, "queued");
        }
        self.is_ready(task)
    }

    /// A task is ready while it heads every queue it sits in.
    pub fn is_ready(&self, task: ProcessId) -> bool {
        match self.held.get(&task) {
            Some(shards) => shards.iter().all(|shard| {
                self.queues
                    .get(shard)
                    .and_then(VecDeque::front)
                    .map_or(false, |head| *head == task)
            }),
            None => false,
        }
    }

    /// Drop `task` from all its shards and report the tasks that became
    /// ready as a result.
    pub fn release(&mut self, task: ProcessId) -> Vec<ProcessId> {
        let shards = match self.held.remove(&task) {
            Some(shards) => shards,
            None => return Vec::new(),
        };

        let mut candidates = Vec::new();
        for shard in &shards {
            if let Some(queue) = self.queues.get_mut(shard) {
                queue.retain(|t| *t != task);
                if let Some(head) = queue.front() {
                    candidates.push(*head);
                }
                if queue.is_empty() {
                    self.queues.remove(shard);
                }
            }
        }
        trace!(?task, "released");

        candidates.retain(|c| self.is_ready(*c));
        candidates.sort();
        candidates.dedup();
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(n: u8) -> ProcessId {
        ProcessId([n; 32])
    }

    const CHAN_A: ShardKey = ShardKey::Channel(Address([0xaa; 20]));
    const CHAN_B: ShardKey = ShardKey::Channel(Address([0xbb; 20]));
    const APP: ShardKey = ShardKey::App(Hash([0x01; 32]));

    #[test]
    fn same_shard_serializes_fifo() {
        let mut sched = ShardScheduler::new();
        assert!(sched.acquire(task(1), &[CHAN_A]));
        assert!(!sched.acquire(task(2), &[CHAN_A]));
        assert!(!sched.acquire(task(3), &[CHAN_A]));

        assert_eq!(sched.release(task(1)), vec![task(2)]);
        assert!(sched.is_ready(task(2)));
        assert_eq!(sched.release(task(2)), vec![task(3)]);
        assert_eq!(sched.release(task(3)), vec![]);
    }

    #[test]
    fn disjoint_shards_run_concurrently() {
        let mut sched = ShardScheduler::new();
        assert!(sched.acquire(task(1), &[CHAN_A]));
        assert!(sched.acquire(task(2), &[CHAN_B]));
    }

    #[test]
    fn multi_shard_task_needs_every_head() {
        let mut sched = ShardScheduler::new();
        assert!(sched.acquire(task(1), &[CHAN_A]));
        // Spans both channels, blocked behind task 1 on A.
        assert!(!sched.acquire(task(2), &[CHAN_A, CHAN_B]));
        // Blocked behind task 2 on B even though B's other holder is idle.
        assert!(!sched.acquire(task(3), &[CHAN_B]));

        assert_eq!(sched.release(task(1)), vec![task(2)]);
        // Task 3 only becomes ready once the spanning task is gone.
        assert_eq!(sched.release(task(2)), vec![task(3)]);
    }

    #[test]
    fn app_and_channel_shards_are_distinct() {
        let mut sched = ShardScheduler::new();
        assert!(sched.acquire(task(1), &[CHAN_A, APP]));
        assert!(!sched.acquire(task(2), &[APP]));
        assert!(sched.acquire(task(3), &[CHAN_B]));

        sched.release(task(1));
        assert!(sched.is_ready(task(2)));
    }

    #[test]
    fn duplicate_acquire_is_idempotent() {
        let mut sched = ShardScheduler::new();
        assert!(sched.acquire(task(1), &[CHAN_A]));
        assert!(sched.acquire(task(1), &[CHAN_A]));
        assert_eq!(sched.release(task(1)), vec![]);
        assert_eq!(sched.release(task(1)), vec![]);
    }
}
