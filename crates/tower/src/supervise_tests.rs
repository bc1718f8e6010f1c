// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn policy(max: u32, backoff_ms: u64, reset_secs: u64) -> RestartPolicy {
    RestartPolicy {
        max_restarts: max,
        backoff: Duration::from_millis(backoff_ms),
        reset_window: Duration::from_secs(reset_secs),
    }
}

#[tokio::test(start_paused = true)]
async fn restarts_up_to_the_cap_then_exhausts() {
    let policy = policy(3, 100, 300);
    let mut state = RestartState::default();

    for expected in 1..=3u32 {
        assert_eq!(state.next_restart(&policy), Some(Duration::from_millis(100)));
        assert_eq!(state.count(), expected);
    }
    assert_eq!(state.next_restart(&policy), None, "fourth restart is refused");
    assert_eq!(state.next_restart(&policy), None, "still refused");
}

#[tokio::test(start_paused = true)]
async fn stable_window_resets_the_counter() {
    let policy = policy(2, 100, 300);
    let mut state = RestartState::default();

    assert!(state.next_restart(&policy).is_some());
    assert!(state.next_restart(&policy).is_some());
    assert_eq!(state.next_restart(&policy), None);

    // The session then runs quietly past the reset window.
    tokio::time::advance(Duration::from_secs(301)).await;
    assert_eq!(state.next_restart(&policy), Some(Duration::from_millis(100)));
    assert_eq!(state.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn rapid_crash_loop_does_not_reset() {
    let policy = policy(5, 100, 300);
    let mut state = RestartState::default();

    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(state.next_restart(&policy).is_some());
    }
    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(state.next_restart(&policy), None);
}

#[tokio::test(start_paused = true)]
async fn default_policy_matches_contract() {
    let policy = RestartPolicy::default();
    assert_eq!(policy.max_restarts, 50);
    assert_eq!(policy.backoff, Duration::from_secs(2));
    assert_eq!(policy.reset_window, Duration::from_secs(300));
}
