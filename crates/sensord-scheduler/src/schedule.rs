//! Time-range arithmetic for schedule entries.
//!
//! An entry's future task times form an arithmetic sequence starting at its
//! `next_task_time`. [`TaskTimes`] represents that sequence lazily with
//! three integers, so an entry that never stops costs the same as one that
//! fires once. Only [`ScheduleEntry::take_until`] (and `take_pending`)
//! consume times, by moving the entry's cursor forward.
//!
//! ```
//! # use sensord_scheduler::ScheduleEntry;
//! # let mut entry: ScheduleEntry = serde_json::from_value(serde_json::json!({
//! #     "name": "t", "action": "logger", "priority": 10, "start": 5, "stop": 10,
//! #     "interval": 1, "is_active": true, "callback_url": null, "next_task_time": 5,
//! #     "next_task_id": 1, "owner": null, "created_at": "", "modified_at": ""
//! # })).unwrap();
//! assert_eq!(entry.take_until(7).collect::<Vec<_>>(), vec![5, 6]);
//! assert_eq!(entry.remaining_times(None).collect::<Vec<_>>(), vec![7, 8, 9]);
//! ```

use crate::clock::{Clock, Tick};
use crate::types::ScheduleEntry;

/// Lazy arithmetic sequence `start, start + step, ...` up to an optional
/// exclusive `stop`.
///
/// `count`, `last` and `nth` are O(1) on bounded sequences. On an unbounded
/// sequence they behave like any infinite iterator and never return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTimes {
    next: Tick,
    step: i64,
    /// Exclusive upper bound; `None` means the sequence never ends.
    stop: Option<Tick>,
}

impl TaskTimes {
    pub fn empty() -> Self {
        Self {
            next: 0,
            step: 1,
            stop: Some(0),
        }
    }

    /// `start, start + step, ...` forever.
    pub fn unbounded(start: Tick, step: i64) -> Self {
        if step < 1 {
            return Self::empty();
        }
        Self {
            next: start,
            step,
            stop: None,
        }
    }

    /// The single tick `at`.
    pub fn once(at: Tick) -> Self {
        Self {
            next: at,
            step: 1,
            stop: Some(at.saturating_add(1)),
        }
    }

    /// `[start, stop)` with the given step; empty when `stop <= start`.
    pub fn range(start: Tick, stop: Tick, step: i64) -> Self {
        if step < 1 || stop <= start {
            return Self::empty();
        }
        Self {
            next: start,
            step,
            stop: Some(stop),
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.stop.is_some()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.stop, Some(stop) if self.next >= stop)
    }

    /// First remaining tick without consuming it.
    pub fn first(&self) -> Option<Tick> {
        (!self.is_empty()).then_some(self.next)
    }

    pub fn contains(&self, tick: Tick) -> bool {
        !self.is_empty()
            && tick >= self.next
            && (i128::from(tick) - i128::from(self.next)) % i128::from(self.step) == 0
            && self.stop.map_or(true, |stop| tick < stop)
    }

    /// Number of remaining ticks, or `None` for an unbounded sequence.
    pub fn bounded_len(&self) -> Option<u64> {
        let stop = self.stop?;
        if self.next >= stop {
            return Some(0);
        }
        let span = i128::from(stop) - i128::from(self.next);
        let step = i128::from(self.step);
        Some(((span + step - 1) / step) as u64)
    }

    fn exhaust(&mut self) {
        self.stop = Some(self.next);
    }
}

impl Iterator for TaskTimes {
    type Item = Tick;

    fn next(&mut self) -> Option<Tick> {
        if self.is_empty() {
            return None;
        }
        let tick = self.next;
        match tick.checked_add(self.step) {
            Some(next) => self.next = next,
            None => self.exhaust(),
        }
        Some(tick)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.bounded_len() {
            Some(len) => {
                let len = usize::try_from(len).unwrap_or(usize::MAX);
                (len, Some(len))
            }
            None => (usize::MAX, None),
        }
    }

    fn nth(&mut self, n: usize) -> Option<Tick> {
        let target = i128::from(self.next) + (n as i128) * i128::from(self.step);
        let past_stop = self.stop.is_some_and(|stop| target >= i128::from(stop));
        match i64::try_from(target) {
            Ok(target) if !self.is_empty() && !past_stop => {
                self.next = target;
                self.next()
            }
            _ => {
                self.exhaust();
                None
            }
        }
    }

    fn count(self) -> usize {
        match self.bounded_len() {
            Some(len) => usize::try_from(len).unwrap_or(usize::MAX),
            None => self.fold(0, |n, _| n + 1),
        }
    }

    fn last(self) -> Option<Tick> {
        match self.bounded_len() {
            Some(0) => None,
            Some(len) => {
                let last = i128::from(self.next) + (i128::from(len) - 1) * i128::from(self.step);
                i64::try_from(last).ok()
            }
            None => self.fold(None, |_, tick| Some(tick)),
        }
    }
}

impl ScheduleEntry {
    /// The ticks this entry has yet to run, before `until` if given.
    ///
    /// With neither `until` nor `stop`, a recurring entry yields an unbounded
    /// sequence and a one-shot entry yields exactly `next_task_time`.
    /// Otherwise the sequence is `[next_task_time, min(until, stop))` stepped
    /// by `interval`; a one-shot entry steps by the whole span so at most
    /// one tick comes out. Inactive or misconfigured entries yield nothing.
    pub fn remaining_times(&self, until: Option<Tick>) -> TaskTimes {
        if !self.is_active {
            return TaskTimes::empty();
        }
        if matches!(self.interval, Some(interval) if interval < 1) {
            return TaskTimes::empty();
        }

        let next = self.next_task_time;
        let stop = match (until, self.stop) {
            (None, None) => {
                return match self.interval {
                    Some(interval) => TaskTimes::unbounded(next, interval),
                    None => TaskTimes::once(next),
                };
            }
            (Some(until), Some(stop)) => until.min(stop),
            (Some(bound), None) | (None, Some(bound)) => bound,
        };
        let step = self
            .interval
            .unwrap_or_else(|| stop.saturating_sub(next).saturating_abs());
        TaskTimes::range(next, stop, step)
    }

    /// Consume every remaining tick before `t` and return them.
    ///
    /// A recurring entry's cursor moves one interval past the last consumed
    /// tick; a one-shot entry that consumed its tick becomes inactive. The
    /// returned sequence is always bounded.
    pub fn take_until(&mut self, t: Tick) -> TaskTimes {
        let times = self.remaining_times(Some(t));
        if let Some(last) = times.clone().last() {
            match self.interval {
                Some(interval) => self.next_task_time = last.saturating_add(interval),
                None => self.is_active = false,
            }
        }
        times
    }

    /// Consume every tick that is due now, including the current tick.
    pub fn take_pending(&mut self, clock: &dyn Clock) -> TaskTimes {
        self.take_until(clock.now() + 1)
    }

    /// `false` once the entry is exhausted, inactive or misconfigured.
    pub fn has_remaining_times(&self) -> bool {
        self.remaining_times(None).contains(self.next_task_time)
    }
}
