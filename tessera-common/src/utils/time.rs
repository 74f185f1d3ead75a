use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use std::time::Duration;

/// Current UTC time.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Canonical text form used inside hashed byte encodings.
pub fn rfc3339_bytes(t: &DateTime<Utc>) -> Vec<u8> {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true).into_bytes()
}

/// Whether `t` lies within `span` of the local clock, in either direction.
pub fn within_now(t: &DateTime<Utc>, span: Duration) -> bool {
    within(t, &utc_now(), span)
}

pub fn within(t: &DateTime<Utc>, base: &DateTime<Utc>, span: Duration) -> bool {
    let span = match ChronoDuration::from_std(span) {
        Ok(s) => s,
        Err(_) => return true,
    };
    let diff = t.signed_duration_since(*base);
    diff <= span && diff >= -span
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_now() {
        let now = utc_now();
        assert!(within_now(&now, Duration::from_secs(1)));
        let old = now - ChronoDuration::seconds(120);
        assert!(!within_now(&old, Duration::from_secs(60)));
        let future = now + ChronoDuration::seconds(120);
        assert!(!within_now(&future, Duration::from_secs(60)));
    }

    #[test]
    fn test_rfc3339_is_stable() {
        let t = utc_now();
        assert_eq!(rfc3339_bytes(&t), rfc3339_bytes(&t.clone()));
    }
}
