use chrono::{DateTime, SecondsFormat, Utc};

/// milliseconds since the unix epoch
pub fn create_timestamp() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

///
/// `published` and `created` fields are RFC 3339 at millisecond precision so
/// a timestamp survives a JSON round trip byte for byte; anything finer would
/// be dropped by some servers and break the content identifier.
///
pub fn now() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

pub fn truncate_millis(datetime: DateTime<Utc>) -> DateTime<Utc> {
    let millis = datetime.timestamp_millis();
    DateTime::from_timestamp_millis(millis).unwrap_or(datetime)
}

pub fn format_timestamp(datetime: &DateTime<Utc>) -> String {
    datetime.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_has_millisecond_precision_test() {
        let t = now();
        assert_eq!(t.timestamp_subsec_nanos() % 1_000_000, 0);
        assert!(format_timestamp(&t).ends_with('Z'));
    }
}
