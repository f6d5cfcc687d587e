//! Bounded multi-band priority queue for pending tasks.
//!
//! Four bands, urgent > high > normal > low; FIFO within a band. The queue is
//! owned exclusively by the scheduler task, so it needs no interior locking.

use crate::task::Task;
use salvage_protocol::{TaskId, TaskPriority, TaskState};
use serde::Serialize;
use std::collections::VecDeque;

/// Per-band queue depths.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub urgent: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
}

pub struct TaskQueue {
    bands: [VecDeque<Task>; TaskPriority::BAND_COUNT],
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            bands: Default::default(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.iter().all(VecDeque::is_empty)
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Admit a submission; the task transitions pending -> queued. Returns
    /// the task back when the queue is at capacity.
    pub fn enqueue(&mut self, mut task: Task) -> Result<(), Task> {
        if self.is_full() {
            return Err(task);
        }
        task.state = TaskState::Queued;
        self.bands[task.priority.band()].push_back(task);
        Ok(())
    }

    /// Re-admit a task at the tail of its band after a retryable failure.
    /// Internal requeues bypass the capacity bound so a full queue cannot
    /// turn a retry into a lost task.
    pub fn requeue_back(&mut self, mut task: Task) {
        task.state = TaskState::Queued;
        self.bands[task.priority.band()].push_back(task);
    }

    /// Return a task to the head of its band after a dispatch send failure.
    pub fn requeue_front(&mut self, mut task: Task) {
        task.state = TaskState::Queued;
        self.bands[task.priority.band()].push_front(task);
    }

    /// Remove a queued task. Returns the task when found.
    pub fn cancel(&mut self, task_id: &TaskId) -> Option<Task> {
        for band in &mut self.bands {
            if let Some(idx) = band.iter().position(|t| &t.task_id == task_id) {
                return band.remove(idx);
            }
        }
        None
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&Task> {
        self.bands
            .iter()
            .flat_map(|band| band.iter())
            .find(|t| &t.task_id == task_id)
    }

    /// Remove and return the highest-priority, earliest-queued task accepted
    /// by `pred`. Scans bands strictly in priority order: a lower-priority
    /// task is never returned while a higher-priority match exists.
    pub fn take_first_matching(&mut self, mut pred: impl FnMut(&Task) -> bool) -> Option<Task> {
        for band in &mut self.bands {
            if let Some(idx) = band.iter().position(&mut pred) {
                return band.remove(idx);
            }
        }
        None
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            urgent: self.bands[TaskPriority::Urgent.band()].len(),
            high: self.bands[TaskPriority::High.band()].len(),
            normal: self.bands[TaskPriority::Normal.band()].len(),
            low: self.bands[TaskPriority::Low.band()].len(),
            total: self.len(),
        }
    }
}
