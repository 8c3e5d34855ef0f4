//! Property tests for the grid-persistent launch configuration search.

use proptest::prelude::*;
use tessel_scheduler::{PreferredLaunchConfig, SchedulerOptions};

/// Walks every candidate, checking the shape invariants at each step.
fn walk(sm_count: i64) -> Vec<(i64, i64, i64, i64)> {
    let options = SchedulerOptions::default();
    let mut cfg = PreferredLaunchConfig::new(sm_count);
    let mut seen = Vec::new();
    while let (Some(bx), Some(by), Some(gx), Some(gy)) =
        (cfg.bdimx(), cfg.bdimy(), cfg.gdimx(), cfg.gdimy())
    {
        assert_eq!(bx * by, options.outer_grid_threads_per_block);
        assert_eq!(gx * gy, sm_count);
        seen.push((bx, by, gx, gy));
        if !cfg.move_to_next_config() {
            break;
        }
    }
    seen
}

// ============================================================
// Ordering
// ============================================================

#[test]
fn test_full_walk_on_108_sms() {
    let seen = walk(108);
    // Five factor pairs with y <= sqrt(108), five transposes, two bdimx values.
    assert_eq!(seen.len(), 20);
    assert_eq!(seen[0], (16, 16, 54, 2));
    assert_eq!(seen[9], (16, 16, 2, 54));
    assert_eq!(seen[10], (8, 32, 54, 2));
}

#[test]
fn test_prime_sm_count_has_no_candidates() {
    let cfg = PreferredLaunchConfig::new(97);
    assert!(cfg.is_invalid());
    assert_eq!(cfg.bdimx(), None);
    assert_eq!(cfg.gdimx(), None);
    assert_eq!(cfg.peek_next_gdimy(), None);
}

#[test]
fn test_exhausted_config_stays_exhausted() {
    let mut cfg = PreferredLaunchConfig::new(4);
    // (2, 2) is the only grid; bdimx 16 then 8.
    assert_eq!(cfg.gdimx(), Some(2));
    assert!(cfg.is_next_smaller_bdimx());
    assert!(cfg.move_to_next_config());
    assert_eq!(cfg.bdimx(), Some(8));
    assert!(!cfg.can_lower_bdimx());
    assert!(!cfg.move_to_next_config());
    assert!(cfg.is_invalid());
    assert!(!cfg.move_to_next_config());
    assert_eq!(cfg.bdimy(), None);
}

// ============================================================
// Properties
// ============================================================

proptest! {
    #[test]
    fn prop_every_state_fills_the_device(sm_count in 1i64..256) {
        let seen = walk(sm_count);
        for window in seen.windows(2) {
            let (prev, next) = (window[0], window[1]);
            // Within one bdimx gdimx only decreases; bdimx only decreases.
            prop_assert!(next.0 <= prev.0);
            if next.0 == prev.0 {
                prop_assert!(next.2 < prev.2);
            }
        }
    }

    #[test]
    fn prop_peek_matches_move(sm_count in 4i64..256) {
        let mut cfg = PreferredLaunchConfig::new(sm_count);
        while !cfg.is_invalid() && !cfg.is_next_smaller_bdimx() {
            let peek = (cfg.peek_next_gdimx(), cfg.peek_next_gdimy());
            prop_assert!(cfg.move_to_next_config());
            prop_assert_eq!(peek, (cfg.gdimx(), cfg.gdimy()));
        }
        if !cfg.is_invalid() {
            prop_assert_eq!(cfg.peek_next_gdimx(), None);
            prop_assert_eq!(cfg.peek_next_gdimy(), None);
        }
    }
}
