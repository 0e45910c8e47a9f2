use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

/// `floor(ts / width) * width`, on epoch milliseconds. Depends only on the
/// timestamp and width, so replays land in the same buckets.
pub fn bucket_start(ts: DateTime<Utc>, width: ChronoDuration) -> DateTime<Utc> {
    let width_ms = width.num_milliseconds().max(1);
    let ts_ms = ts.timestamp_millis();
    let bucket_ms = ts_ms.div_euclid(width_ms) * width_ms;
    Utc.timestamp_millis_opt(bucket_ms).single().unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floors_to_width() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 10, 59, 59).unwrap();
        assert_eq!(
            bucket_start(ts, ChronoDuration::hours(1)),
            Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(
            bucket_start(ts, ChronoDuration::minutes(15)),
            Utc.with_ymd_and_hms(2024, 6, 1, 10, 45, 0).unwrap()
        );
    }

    #[test]
    fn boundary_belongs_to_the_bucket_it_starts() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap();
        assert_eq!(bucket_start(ts, ChronoDuration::hours(1)), ts);
    }

    #[test]
    fn pre_epoch_timestamps_floor_downwards() {
        let ts = Utc.with_ymd_and_hms(1969, 12, 31, 23, 30, 0).unwrap();
        assert_eq!(
            bucket_start(ts, ChronoDuration::hours(1)),
            Utc.with_ymd_and_hms(1969, 12, 31, 23, 0, 0).unwrap()
        );
    }
}
