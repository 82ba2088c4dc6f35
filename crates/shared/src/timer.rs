//! Countdown math derived from a stored anchor and a clock reading.

use chrono::{DateTime, Duration, Utc};

use crate::domain::{TimerRecord, TimerState};

pub fn elapsed_seconds(started_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - started_at).num_seconds().max(0)
}

/// Seconds left on the countdown at `now`.
pub fn remaining(timer: &TimerRecord, now: DateTime<Utc>) -> i64 {
    match timer.state() {
        TimerState::Stopped => timer.duration_seconds.max(0),
        TimerState::Running => {
            let elapsed = timer
                .started_at
                .map(|started_at| elapsed_seconds(started_at, now))
                .unwrap_or(0);
            timer.duration_seconds.saturating_sub(elapsed).max(0)
        }
        TimerState::Paused => timer
            .duration_seconds
            .saturating_sub(timer.paused_elapsed_seconds)
            .max(0),
    }
}

pub fn is_expired(timer: &TimerRecord, now: DateTime<Utc>) -> bool {
    timer.active && remaining(timer, now) == 0
}

pub fn started(duration_seconds: i64, now: DateTime<Utc>) -> TimerRecord {
    TimerRecord {
        active: true,
        paused: false,
        duration_seconds,
        started_at: Some(now),
        paused_elapsed_seconds: 0,
    }
}

/// Banks elapsed time, clamped to the configured duration.
pub fn paused(timer: &TimerRecord, now: DateTime<Utc>) -> TimerRecord {
    let elapsed = timer
        .started_at
        .map(|started_at| elapsed_seconds(started_at, now))
        .unwrap_or(0)
        .min(timer.duration_seconds.max(0));
    TimerRecord {
        active: true,
        paused: true,
        duration_seconds: timer.duration_seconds,
        started_at: timer.started_at,
        paused_elapsed_seconds: elapsed,
    }
}

/// Re-anchors so that `now - started_at` equals the banked elapsed time.
pub fn resumed(timer: &TimerRecord, now: DateTime<Utc>) -> TimerRecord {
    TimerRecord {
        active: true,
        paused: false,
        duration_seconds: timer.duration_seconds,
        started_at: Some(now - Duration::seconds(timer.paused_elapsed_seconds)),
        paused_elapsed_seconds: timer.paused_elapsed_seconds,
    }
}

pub fn stopped(timer: &TimerRecord) -> TimerRecord {
    TimerRecord::stopped(timer.duration_seconds)
}
