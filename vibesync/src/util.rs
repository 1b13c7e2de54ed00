//! What's a project without a util module.

use rand::Rng;
use std::time::Duration;

/// Get a human-readable duration for amounts that
/// a human would use.
pub fn human_duration(duration: Duration) -> String {
    let second = 1000;
    let minute = second * 60;
    let hour = minute * 60;
    let day = hour * 24;
    // Ok that's enough.

    let ms = duration.as_millis();
    let ms_fmt = |ms: u128, unit: u128, name: &str| -> String {
        if ms % unit > 0 {
            format!("{}ms", ms)
        } else {
            format!("{}{}", ms / unit, name)
        }
    };

    if ms < second {
        format!("{}ms", ms)
    } else if ms < minute {
        ms_fmt(ms, second, "s")
    } else if ms < hour {
        ms_fmt(ms, minute, "m")
    } else if ms < day {
        ms_fmt(ms, hour, "h")
    } else {
        ms_fmt(ms, day, "d")
    }
}

/// Add up to 25% of jitter to a duration, so loops
/// running on the same schedule don't wake up in lockstep.
pub fn jitter(duration: Duration) -> Duration {
    let spread = duration.as_millis() as u64 / 4;
    if spread == 0 {
        return duration;
    }
    duration + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
}
