use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::clock::Tick;

/// One concrete run of an entry's action at a specific tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub time: Tick,
    pub priority: i32,
    pub action: String,
    pub schedule_entry_name: String,
    /// `None` for informational tasks in the upcoming queue.
    pub task_id: Option<i64>,
}

impl Ord for Task {
    /// Earlier time first, then lower priority value. The remaining fields
    /// only break ties so the order is total and repeatable.
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time, self.priority)
            .cmp(&(other.time, other.priority))
            .then_with(|| self.schedule_entry_name.cmp(&other.schedule_entry_name))
            .then_with(|| self.task_id.cmp(&other.task_id))
            .then_with(|| self.action.cmp(&other.action))
    }
}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of tasks ordered by `(time, priority)`.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Reverse<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(
        &mut self,
        time: Tick,
        priority: i32,
        action: &str,
        schedule_entry_name: &str,
        task_id: Option<i64>,
    ) {
        self.push(Task {
            time,
            priority,
            action: action.to_string(),
            schedule_entry_name: schedule_entry_name.to_string(),
            task_id,
        });
    }

    pub fn push(&mut self, task: Task) {
        self.heap.push(Reverse(task));
    }

    /// Remove and return the earliest task.
    pub fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|Reverse(task)| task)
    }

    /// The task `pop` would return next.
    pub fn peek(&self) -> Option<&Task> {
        self.heap.peek().map(|Reverse(task)| task)
    }

    /// All tasks in the order repeated `pop` calls would return them.
    /// Works on a copy; the queue itself is untouched.
    pub fn to_list(&self) -> Vec<Task> {
        let mut copy = self.heap.clone();
        let mut tasks = Vec::with_capacity(copy.len());
        while let Some(Reverse(task)) = copy.pop() {
            tasks.push(task);
        }
        tasks
    }

    /// Remove one task equal to `task`. O(n) re-heapify.
    pub fn cancel(&mut self, task: &Task) -> bool {
        let mut tasks = std::mem::take(&mut self.heap).into_vec();
        let found = match tasks.iter().position(|Reverse(t)| t == task) {
            Some(index) => {
                tasks.swap_remove(index);
                true
            }
            None => false,
        };
        self.heap = BinaryHeap::from(tasks);
        found
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl FromIterator<Task> for TaskQueue {
    fn from_iter<I: IntoIterator<Item = Task>>(iter: I) -> Self {
        Self {
            heap: iter.into_iter().map(Reverse).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(time: Tick, priority: i32, entry: &str) -> Task {
        Task {
            time,
            priority,
            action: "logger".to_string(),
            schedule_entry_name: entry.to_string(),
            task_id: None,
        }
    }

    #[test]
    fn orders_by_time_then_priority() {
        let mut q = TaskQueue::new();
        q.enter(5, 1, "logger", "a", None);
        q.enter(1, 20, "logger", "b", None);
        q.enter(1, 10, "logger", "c", None);
        q.enter(3, -5, "logger", "d", None);

        let order: Vec<(Tick, i32)> = q.to_list().iter().map(|t| (t.time, t.priority)).collect();
        assert_eq!(order, vec![(1, 10), (1, 20), (3, -5), (5, 1)]);
    }

    #[test]
    fn low_priority_now_beats_high_priority_later() {
        let mut q = TaskQueue::new();
        q.push(task(2, 0, "urgent-later"));
        q.push(task(1, 99, "lazy-now"));
        assert_eq!(q.pop().unwrap().schedule_entry_name, "lazy-now");
    }

    #[test]
    fn to_list_matches_pop_order_and_is_non_destructive() {
        let mut q: TaskQueue = [
            task(3, 10, "x"),
            task(1, 10, "y"),
            task(1, 10, "a"),
            task(2, 5, "z"),
            task(1, 7, "w"),
        ]
        .into_iter()
        .collect();

        let listed = q.to_list();
        assert_eq!(q.len(), 5);
        assert_eq!(q.peek(), listed.first());

        let mut popped = Vec::new();
        while let Some(t) = q.pop() {
            popped.push(t);
        }
        assert_eq!(listed, popped);
        assert!(q.is_empty());
    }

    #[test]
    fn cancel_removes_a_single_task() {
        let mut q = TaskQueue::new();
        q.push(task(1, 10, "a"));
        q.push(task(2, 10, "b"));
        q.push(task(3, 10, "c"));

        assert!(q.cancel(&task(2, 10, "b")));
        assert!(!q.cancel(&task(2, 10, "b")));
        let names: Vec<String> = q.to_list().into_iter().map(|t| t.schedule_entry_name).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn clear_empties_queue() {
        let mut q = TaskQueue::new();
        q.push(task(1, 1, "a"));
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
    }
}
