pub mod admin;
pub mod events;
pub mod monitor;

use serde::Deserialize;
use time::{Duration, OffsetDateTime};

/// Dashboard time windows: "24h", "7d", "30d". Anything unrecognized falls
/// back to 30 days.
#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    pub period: Option<String>,
    pub limit: Option<i64>,
}

pub(crate) fn since_for_period(period: Option<&str>) -> OffsetDateTime {
    let window = match period.unwrap_or("30d") {
        "24h" => Duration::hours(24),
        "7d" => Duration::days(7),
        _ => Duration::days(30),
    };
    OffsetDateTime::now_utc() - window
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_periods_fall_back_to_thirty_days() {
        let since = since_for_period(Some("bogus"));
        let now = OffsetDateTime::now_utc();
        let days = (now - since).whole_days();
        assert_eq!(days, 30);
    }

    #[test]
    fn day_window_parses() {
        let since_24h = since_for_period(Some("24h"));
        let since_7d = since_for_period(Some("7d"));
        let now = OffsetDateTime::now_utc();
        assert_eq!((now - since_24h).whole_hours(), 24);
        assert_eq!((now - since_7d).whole_days(), 7);
    }
}
