/// Estimated electrical draw in watts, rounded to one decimal.
///
/// Zero when the device is off and `min_watts` when either reading is missing.
/// Otherwise the baseline is scaled up by the indoor lift (capped at twice the
/// baseline) and divided by the COP weighted with an outdoor efficiency factor that
/// drops as the outside temperature moves away from the target (floored at 0.5).
pub fn estimate(
    device_on: bool,
    target: f32,
    room: Option<f32>,
    outside: Option<f32>,
    min_watts: f32,
    cop: f32,
) -> f32 {
    if !device_on {
        return 0.0;
    }

    let (Some(room), Some(outside)) = (room, outside) else {
        return min_watts;
    };

    let efficiency = outdoor_efficiency(target, outside);
    let load = indoor_load(target, room);
    round_tenth(min_watts * load / (cop * efficiency))
}

pub fn outdoor_efficiency(target: f32, outside: f32) -> f32 {
    (1.0 - (target - outside).abs() / 50.0).max(0.5)
}

pub fn indoor_load(target: f32, room: f32) -> f32 {
    (1.0 + (target - room).abs() / 10.0).min(2.0)
}

fn round_tenth(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}
