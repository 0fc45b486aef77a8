//! Property tests for the control invariants.

mod support;

use heatpump_common::{power, COMMAND_INTERVAL_SECS};
use proptest::prelude::*;
use support::{arbiter, device, monday, plus_millis, plus_secs, readings};

proptest! {
    /// Inside the dead band the thermostat never issues a command, whatever the
    /// physical state.
    #[test]
    fn dead_band_is_idle(
        target in 12.0f32..28.0,
        offset in -0.5f32..=0.5,
        device_on in any::<bool>(),
    ) {
        let room = target + offset;
        prop_assume!((target - room).abs() <= 0.5);

        let mut arbiter = arbiter(device());
        let start = monday(9, 0);
        let _ = arbiter.set_user_target_temperature(target);
        let _ = arbiter.fix_sync(true, None, start);
        if !device_on {
            let _ = arbiter.set_physical_power_on(false, start);
        }
        arbiter.transport_mut().sent.clear();

        let snapshot = arbiter.tick(plus_secs(start, 3600), &readings(&room.to_string(), "5.0"));

        prop_assert!(arbiter.transport().sent.is_empty());
        prop_assert_eq!(snapshot.physical_device_on, device_on);
    }

    /// A running device is never switched off automatically before the minimum cycle
    /// has elapsed, and always is once it has.
    #[test]
    fn minimum_cycle_holds_automatic_off(elapsed in 0i64..900) {
        let mut arbiter = arbiter(device());
        let start = monday(9, 0);
        let _ = arbiter.fix_sync(true, None, start);

        let now = plus_secs(start, elapsed);
        let min_cycle = arbiter.config().control.min_cycle_secs as i64;
        prop_assert_eq!(arbiter.is_in_minimum_cycle(now), elapsed < min_cycle);

        let snapshot = arbiter.tick(now, &readings("26.0", "5.0"));
        prop_assert_eq!(snapshot.physical_device_on, elapsed < min_cycle);
    }

    /// Two commands never leave closer together than the command interval.
    #[test]
    fn commands_are_rate_limited(gap_ms in 0i64..10_000) {
        let mut arbiter = arbiter(device());
        let start = monday(9, 0);
        prop_assert!(arbiter.set_physical_power_on(true, start).is_changed());

        let later = plus_millis(start, gap_ms);
        let allowed = gap_ms >= COMMAND_INTERVAL_SECS * 1000;
        prop_assert_eq!(arbiter.set_physical_power_on(false, later).is_changed(), allowed);
        prop_assert_eq!(arbiter.transport().sent.len(), if allowed { 2 } else { 1 });
    }

    #[test]
    fn efficiency_falls_as_outside_drifts(
        target in 10.0f32..30.0,
        near in 0.0f32..40.0,
        extra in 0.0f32..40.0,
    ) {
        let close = power::outdoor_efficiency(target, target - near);
        let far = power::outdoor_efficiency(target, target - near - extra);
        prop_assert!(far <= close);
        prop_assert!((0.5..=1.0).contains(&far));
    }

    #[test]
    fn load_grows_with_indoor_lift(
        target in 10.0f32..30.0,
        near in 0.0f32..20.0,
        extra in 0.0f32..20.0,
    ) {
        let small = power::indoor_load(target, target - near);
        let large = power::indoor_load(target, target - near - extra);
        prop_assert!(large >= small);
        prop_assert!((1.0..=2.0).contains(&large));
    }

    #[test]
    fn power_is_zero_only_when_off(
        target in 10.0f32..30.0,
        room in -10.0f32..35.0,
        outside in -30.0f32..35.0,
        min_watts in 100.0f32..5000.0,
        cop in 0.5f32..10.0,
    ) {
        let off = power::estimate(false, target, Some(room), Some(outside), min_watts, cop);
        let on = power::estimate(true, target, Some(room), Some(outside), min_watts, cop);
        prop_assert_eq!(off, 0.0);
        prop_assert!(on > 0.0);
        prop_assert_eq!(power::estimate(true, target, None, Some(outside), min_watts, cop), min_watts);
    }
}
