use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

struct Queues<T> {
    /// Tasks of blocked callers. Served before everything else and never moved to prefetch.
    urgent: VecDeque<T>,
    /// Index is the priority, the last queue is served first.
    priorities: Vec<VecDeque<T>>,
    /// Served only after all priority queues are empty.
    prefetch: VecDeque<T>,
    queued: usize,
    shutdown: bool,
}

/// Priority partitioned FIFO queues of fetch tasks, shared by all fetchers.
pub struct FetchQueues<T> {
    queues: Mutex<Queues<T>>,
    available: Condvar,
    max_queued: usize,
    prefetch_capacity: usize,
}

impl<T> FetchQueues<T> {
    pub fn new(num_priorities: usize, max_queued: usize, prefetch_capacity: usize) -> Self {
        Self {
            queues: Mutex::new(Queues {
                urgent: VecDeque::new(),
                priorities: (0..num_priorities.max(1)).map(|_| VecDeque::new()).collect(),
                prefetch: VecDeque::new(),
                queued: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            max_queued,
            prefetch_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queues<T>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn num_priorities(&self) -> usize {
        self.lock().priorities.len()
    }

    /// Enqueues `task`, never blocks. Priorities beyond the last queue are clamped.
    ///
    /// Returns `false` if the task was rejected, either because the soft cap is reached
    /// or the queues are shut down. `to_front` puts the task into the urgent lane,
    /// ahead of all priorities, and ignores the cap.
    pub fn put(&self, task: T, priority: usize, to_front: bool) -> bool {
        let mut queues = self.lock();
        if queues.shutdown {
            return false;
        }
        if to_front {
            queues.urgent.push_back(task);
        } else {
            if queues.queued >= self.max_queued {
                return false;
            }
            let priority = priority.min(queues.priorities.len() - 1);
            queues.priorities[priority].push_back(task);
        }
        queues.queued += 1;
        drop(queues);
        self.available.notify_one();
        true
    }

    /// Blocks until a task is available and returns the one with the highest priority.
    /// Returns `None` once the queues are shut down.
    pub fn take(&self) -> Option<T> {
        let mut queues = self.lock();
        loop {
            if queues.shutdown {
                return None;
            }
            let Queues {
                urgent,
                priorities,
                prefetch,
                ..
            } = &mut *queues;
            let task = urgent
                .pop_front()
                .or_else(|| priorities.iter_mut().rev().find_map(|q| q.pop_front()))
                .or_else(|| prefetch.pop_front());
            if let Some(task) = task {
                queues.queued -= 1;
                return Some(task);
            }
            queues = self
                .available
                .wait(queues)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Moves the first queued task matching `is_task` into the urgent lane.
    /// Returns `false` if no queued task matches.
    pub fn promote(&self, mut is_task: impl FnMut(&T) -> bool) -> bool {
        let mut queues = self.lock();
        if queues.urgent.iter().any(&mut is_task) {
            return true;
        }
        let Queues {
            urgent,
            priorities,
            prefetch,
            ..
        } = &mut *queues;
        for queue in priorities.iter_mut().chain(std::iter::once(prefetch)) {
            if let Some(index) = queue.iter().position(&mut is_task) {
                if let Some(task) = queue.remove(index) {
                    urgent.push_back(task);
                    return true;
                }
            }
        }
        false
    }

    /// Removes all queued tasks and hands them back.
    pub fn clear(&self) -> Vec<T> {
        let mut queues = self.lock();
        let Queues {
            urgent,
            priorities,
            prefetch,
            ..
        } = &mut *queues;
        let removed: Vec<T> = urgent
            .drain(..)
            .chain(priorities.iter_mut().rev().flat_map(|q| q.drain(..)))
            .chain(prefetch.drain(..))
            .collect();
        queues.queued = 0;
        removed
    }

    /// Moves all queued tasks to the prefetch list, ahead of what was prefetched before.
    /// Tasks beyond the prefetch capacity are removed and handed back. The urgent lane
    /// is left alone.
    pub fn clear_to_prefetch(&self) -> Vec<T> {
        let mut queues = self.lock();
        let Queues {
            priorities, prefetch, ..
        } = &mut *queues;
        let mut moved: VecDeque<T> = priorities.iter_mut().rev().flat_map(|q| q.drain(..)).collect();
        moved.append(prefetch);
        let dropped: Vec<T> = if moved.len() > self.prefetch_capacity {
            moved.drain(self.prefetch_capacity..).collect()
        } else {
            vec![]
        };
        *prefetch = moved;
        queues.queued = queues.prefetch.len() + queues.urgent.len();
        dropped
    }

    /// Wakes all takers and makes them return `None`. Queued tasks are dropped.
    pub fn shutdown(&self) {
        let removed = {
            let mut queues = self.lock();
            queues.shutdown = true;
            queues.queued = 0;
            let Queues {
                urgent,
                priorities,
                prefetch,
                ..
            } = &mut *queues;
            urgent
                .drain(..)
                .chain(priorities.iter_mut().flat_map(|q| q.drain(..)))
                .chain(prefetch.drain(..))
                .collect::<Vec<T>>()
        };
        self.available.notify_all();
        drop(removed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.lock().queued
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
