use std::time::Duration;

pub const DEFAULT_BASE_BACKOFF_SECONDS: f64 = 0.1;
pub const DEFAULT_MAX_BACKOFF_SECONDS: f64 = 3.0;

pub fn exponential_backoff_duration_seconds(n: u32, base_increment: f64, max_seconds: f64) -> f64 {
    if n == 0 {
        0.0
    } else {
        (1.0 + base_increment).powf(f64::from(n)).min(max_seconds)
    }
}

pub fn exponential_backoff_duration(n: u32, base_increment: f64, max_seconds: f64) -> Duration {
    Duration::from_secs_f64(exponential_backoff_duration_seconds(
        n,
        base_increment,
        max_seconds,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_defaults_produce_growing_backoff_sequence() {
        let mut current_backoff_value = None;

        for i in 0..10_000 {
            let new_backoff_value = exponential_backoff_duration_seconds(
                i,
                DEFAULT_BASE_BACKOFF_SECONDS,
                DEFAULT_MAX_BACKOFF_SECONDS,
            );

            if let Some(old_backoff_value) = current_backoff_value.replace(new_backoff_value) {
                assert!(
                    old_backoff_value <= new_backoff_value,
                    "{i}th backoff value {new_backoff_value} is smaller than the previous one {old_backoff_value}"
                )
            }
        }

        assert_eq!(
            current_backoff_value.expect("Should have produced backoff values to compare"),
            DEFAULT_MAX_BACKOFF_SECONDS,
            "Given big enough of retries, backoff should reach its allowed max value"
        );
    }

    #[test]
    fn first_attempt_does_not_wait() {
        assert_eq!(exponential_backoff_duration(0, 1.0, 300.0), Duration::ZERO);
        assert_eq!(
            exponential_backoff_duration(3, 1.0, 300.0),
            Duration::from_secs(8)
        );
        assert_eq!(
            exponential_backoff_duration(30, 1.0, 300.0),
            Duration::from_secs(300)
        );
    }
}
