use chrono::{Months, NaiveDate, NaiveDateTime, NaiveTime};

pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(23, 59, 59)
        .unwrap_or_else(|| date.and_time(NaiveTime::MIN))
}

/// New end time after renewing `months`: calendar month addition from the
/// previous end time (or `now` when there is none), clamped to the last day
/// of a shorter month and pinned to 23:59:59.
pub fn renewal_end(previous: Option<NaiveDateTime>, months: u32, now: NaiveDateTime) -> NaiveDateTime {
    let base = previous.unwrap_or(now).date();
    let date = base
        .checked_add_months(Months::new(months))
        .unwrap_or(NaiveDate::MAX);
    end_of_day(date)
}

/// Whole calendar days from `now` until `end`; negative once expired.
pub fn remaining_days(end: NaiveDateTime, now: NaiveDateTime) -> i64 {
    (end.date() - now.date()).num_days()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryStatus {
    Expired,
    Imminent,
    Soon,
    Normal,
}

impl ExpiryStatus {
    pub fn of(end: NaiveDateTime, now: NaiveDateTime) -> Self {
        if end < now {
            return ExpiryStatus::Expired;
        }
        match remaining_days(end, now) {
            d if d <= 7 => ExpiryStatus::Imminent,
            d if d <= 30 => ExpiryStatus::Soon,
            _ => ExpiryStatus::Normal,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ExpiryStatus::Expired => "已过期",
            ExpiryStatus::Imminent => "即将到期",
            ExpiryStatus::Soon => "近期到期",
            ExpiryStatus::Normal => "正常",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn clamps_to_month_end() {
        assert_eq!(
            renewal_end(Some(at("2025-01-31 23:59:59")), 1, at("2025-01-01 00:00:00")),
            at("2025-02-28 23:59:59")
        );
        assert_eq!(
            renewal_end(Some(at("2024-01-31 10:00:00")), 1, at("2024-01-01 00:00:00")),
            at("2024-02-29 23:59:59")
        );
        assert_eq!(
            renewal_end(Some(at("2025-06-30 23:59:59")), 12, at("2025-01-01 00:00:00")),
            at("2026-06-30 23:59:59")
        );
    }

    #[test]
    fn falls_back_to_now_without_previous_end() {
        assert_eq!(
            renewal_end(None, 3, at("2025-03-15 08:30:00")),
            at("2025-06-15 23:59:59")
        );
    }

    #[test]
    fn never_drifts_off_end_of_day() {
        let mut end = at("2025-01-31 23:59:59");
        for months in 1..=24 {
            let next = renewal_end(Some(end), months, end);
            assert_eq!(next.time(), NaiveTime::from_hms_opt(23, 59, 59).unwrap());
            end = next;
        }
    }

    #[test]
    fn status_tiers() {
        let now = at("2025-06-01 12:00:00");
        assert_eq!(ExpiryStatus::of(at("2025-05-31 23:59:59"), now), ExpiryStatus::Expired);
        assert_eq!(ExpiryStatus::of(at("2025-06-08 23:59:59"), now), ExpiryStatus::Imminent);
        assert_eq!(ExpiryStatus::of(at("2025-07-01 23:59:59"), now), ExpiryStatus::Soon);
        assert_eq!(ExpiryStatus::of(at("2025-09-01 23:59:59"), now), ExpiryStatus::Normal);
        assert_eq!(remaining_days(at("2025-05-30 23:59:59"), now), -2);
    }
}
