use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};

/// A clock cycle inside a modulo schedule of fixed length.
///
/// The value is a pair `(iteration, clock_cycle)` where `clock_cycle` always
/// stays in `[0, schedule_length)`. Adding cycles carries into the iteration
/// field, subtracting borrows from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleTime {
    schedule_length: u32,
    iteration: i32,
    clock_cycle: i32,
}

impl ScheduleTime {
    pub fn new(schedule_length: u32) -> Self {
        assert!(schedule_length > 0, "schedule length must be positive");
        Self {
            schedule_length,
            iteration: 0,
            clock_cycle: 0,
        }
    }

    /// Build a time from raw fields, normalizing an out of range cycle.
    pub fn with(schedule_length: u32, iteration: i32, clock_cycle: i32) -> Self {
        let t = Self {
            schedule_length,
            iteration,
            clock_cycle: 0,
        };
        assert!(schedule_length > 0, "schedule length must be positive");
        t + clock_cycle
    }

    /// Build a time from an absolute cycle count measured from `(0,0)`.
    pub fn from_cycles(schedule_length: u32, cycles: i64) -> Self {
        let len = schedule_length as i64;
        assert!(len > 0, "schedule length must be positive");
        Self {
            schedule_length,
            iteration: cycles.div_euclid(len) as i32,
            clock_cycle: cycles.rem_euclid(len) as i32,
        }
    }

    pub fn schedule_length(&self) -> u32 {
        self.schedule_length
    }

    pub fn iteration(&self) -> i32 {
        self.iteration
    }

    pub fn clock_cycle(&self) -> i32 {
        self.clock_cycle
    }

    /// Absolute cycle count, `iteration * schedule_length + clock_cycle`.
    pub fn cycles(&self) -> i64 {
        self.iteration as i64 * self.schedule_length as i64 + self.clock_cycle as i64
    }

    /// Reset to `(0,0)` under a new schedule length.
    pub fn set_schedule_length(&mut self, schedule_length: u32) {
        assert!(schedule_length > 0, "schedule length must be positive");
        self.schedule_length = schedule_length;
        self.iteration = 0;
        self.clock_cycle = 0;
    }

    pub fn add_iterations(self, iters: i32) -> Self {
        Self {
            iteration: self.iteration + iters,
            ..self
        }
    }

    pub fn sub_iterations(self, iters: i32) -> Self {
        self.add_iterations(-iters)
    }

    /// Advance by exactly one cycle.
    pub fn incr(&mut self) {
        self.clock_cycle += 1;
        if self.clock_cycle >= self.schedule_length as i32 {
            self.clock_cycle = 0;
            self.iteration += 1;
        }
    }

    /// Step back by exactly one cycle.
    pub fn decr(&mut self) {
        self.clock_cycle -= 1;
        if self.clock_cycle < 0 {
            self.clock_cycle = self.schedule_length as i32 - 1;
            self.iteration -= 1;
        }
    }

    /// Signed distance in cycles, `None` when the schedule lengths differ.
    pub fn checked_diff(&self, other: &ScheduleTime) -> Option<i64> {
        if self.schedule_length != other.schedule_length {
            return None;
        }
        Some(self.cycles() - other.cycles())
    }
}

// Carries use repeated wrap instead of div/mod so that negative offsets round
// the same way as the incremental operators.
impl AddAssign<i32> for ScheduleTime {
    fn add_assign(&mut self, cycles: i32) {
        if cycles < 0 {
            *self -= -cycles;
            return;
        }
        let len = self.schedule_length as i32;
        self.clock_cycle += cycles;
        while self.clock_cycle >= len {
            self.iteration += 1;
            self.clock_cycle -= len;
        }
    }
}

impl SubAssign<i32> for ScheduleTime {
    fn sub_assign(&mut self, cycles: i32) {
        if cycles < 0 {
            *self += -cycles;
            return;
        }
        let len = self.schedule_length as i32;
        self.clock_cycle -= cycles;
        while self.clock_cycle < 0 {
            self.iteration -= 1;
            self.clock_cycle += len;
        }
    }
}

impl Add<i32> for ScheduleTime {
    type Output = ScheduleTime;

    fn add(mut self, cycles: i32) -> ScheduleTime {
        self += cycles;
        self
    }
}

impl Sub<i32> for ScheduleTime {
    type Output = ScheduleTime;

    fn sub(mut self, cycles: i32) -> ScheduleTime {
        self -= cycles;
        self
    }
}

/// Difference in cycles. Both operands must share the schedule length.
impl Sub for ScheduleTime {
    type Output = i64;

    fn sub(self, other: ScheduleTime) -> i64 {
        assert_eq!(
            self.schedule_length, other.schedule_length,
            "difference of schedule times with different lengths"
        );
        (self.iteration - other.iteration) as i64 * self.schedule_length as i64
            + (self.clock_cycle - other.clock_cycle) as i64
    }
}

impl Ord for ScheduleTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.iteration
            .cmp(&other.iteration)
            .then(self.clock_cycle.cmp(&other.clock_cycle))
            .then(self.schedule_length.cmp(&other.schedule_length))
    }
}

impl PartialOrd for ScheduleTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ScheduleTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.iteration, self.clock_cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::ScheduleTime;

    #[test]
    fn test_wrap_forward_and_back() {
        let t = ScheduleTime::new(4);
        let t1 = t + 9;
        assert_eq!((t1.iteration(), t1.clock_cycle()), (2, 1));
        let t2 = t1 - 10;
        assert_eq!((t2.iteration(), t2.clock_cycle()), (-1, 3));
        assert_eq!(t1 - t2, 10);
    }

    #[test]
    fn test_additive_laws() {
        for len in 1..7u32 {
            let base = ScheduleTime::with(len, 3, 0) + 2;
            for a in -13..13 {
                for b in -13..13 {
                    assert_eq!((base + a) + b, base + (a + b));
                    assert_eq!(base - a, base + (-a));
                    let c = (base + a).clock_cycle();
                    assert!(c >= 0 && c < len as i32);
                }
            }
        }
    }

    #[test]
    fn test_incr_decr_and_iterations() {
        let mut t = ScheduleTime::with(3, 0, 2);
        t.incr();
        assert_eq!(t, ScheduleTime::with(3, 1, 0));
        t.decr();
        t.decr();
        assert_eq!(t, ScheduleTime::with(3, 0, 1));
        assert_eq!(t.add_iterations(2).iteration(), 2);
        assert_eq!(t.add_iterations(2).clock_cycle(), 1);
        assert_eq!(t.sub_iterations(1).iteration(), -1);
    }

    #[test]
    fn test_ordering_and_cycles() {
        let a = ScheduleTime::with(5, 0, 4);
        let b = ScheduleTime::with(5, 1, 0);
        assert!(a < b);
        assert_eq!(b - a, 1);
        assert_eq!(ScheduleTime::from_cycles(5, -1), ScheduleTime::with(5, -1, 4));
        assert_eq!(ScheduleTime::from_cycles(5, 12).cycles(), 12);
        assert_eq!(format!("{}", b), "(1,0)");
    }

    #[test]
    fn test_checked_diff_rejects_mixed_lengths() {
        let a = ScheduleTime::with(5, 1, 0);
        let b = ScheduleTime::with(6, 1, 0);
        assert_eq!(a.checked_diff(&b), None);
    }

    #[test]
    #[should_panic]
    fn test_diff_of_mixed_lengths_panics() {
        let _ = ScheduleTime::with(5, 1, 0) - ScheduleTime::with(6, 1, 0);
    }
}
