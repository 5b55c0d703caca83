//! Progressive-interval retry scheduling.

/// The delay lookup and cap configuration for the retry state machine.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Minutes of delay before attempt `k + 1`, indexed by attempt count
    /// `k` (1-based); attempts past the table reuse the last entry.
    pub intervals: Vec<u32>,
    /// Floor applied to every retry so the in-flight call cannot still be
    /// active when the next is scheduled.
    pub min_gap_minutes: u32,
    pub max_attempts: u32,
    pub max_daily_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            intervals: vec![0, 0, 5, 10, 30, 60, 120],
            min_gap_minutes: 2,
            max_attempts: 8,
            max_daily_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// Delay in minutes for a record with `attempts` completed attempts:
    /// the table entry at the attempt index, floored by the minimum gap.
    pub fn delay_minutes(&self, attempts: u32) -> u32 {
        let table = if self.intervals.is_empty() {
            self.min_gap_minutes
        } else {
            let idx = (attempts.max(1) as usize).min(self.intervals.len()) - 1;
            self.intervals[idx]
        };
        table.max(self.min_gap_minutes)
    }

    /// Absolute next-redial instant for an attempt completing at `at`.
    pub fn next_redial(&self, at: u64, attempts: u32) -> u64 {
        at + u64::from(self.delay_minutes(attempts)) * 60
    }

    pub fn lifetime_capped(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn daily_capped(&self, attempts_today: u32) -> bool {
        attempts_today >= self.max_daily_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_gap_floors_the_front_of_the_table() {
        let policy = RetryPolicy::default();
        // The first two table entries are zero; the two-minute floor applies.
        assert_eq!(policy.delay_minutes(1), 2);
        assert_eq!(policy.delay_minutes(2), 2);
        assert_eq!(policy.delay_minutes(3), 5);
        assert_eq!(policy.delay_minutes(4), 10);
        assert_eq!(policy.delay_minutes(7), 120);
    }

    #[test]
    fn attempts_past_the_table_reuse_the_last_entry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_minutes(8), 120);
        assert_eq!(policy.delay_minutes(50), 120);
    }

    #[test]
    fn next_redial_is_absolute_seconds() {
        let policy = RetryPolicy::default();
        // Scenario: first-attempt voicemail at 11:06 schedules 11:08.
        let at = 1_000_000;
        assert_eq!(policy.next_redial(at, 1), at + 120);
        assert_eq!(policy.next_redial(at, 3), at + 300);
    }

    #[test]
    fn empty_table_still_honors_the_floor() {
        let policy = RetryPolicy {
            intervals: Vec::new(),
            ..Default::default()
        };
        assert_eq!(policy.delay_minutes(1), 2);
    }

    #[test]
    fn caps() {
        let policy = RetryPolicy::default();
        assert!(!policy.lifetime_capped(7));
        assert!(policy.lifetime_capped(8));
        assert!(policy.daily_capped(8));
    }
}
