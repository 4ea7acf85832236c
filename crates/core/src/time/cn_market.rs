use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};

const CST_OFFSET_SECS: i32 = 8 * 3600;

// A-share sessions, exchange-local time, boundaries inclusive.
const AM_OPEN: (u32, u32, u32) = (9, 30, 0);
const AM_CLOSE: (u32, u32, u32) = (11, 30, 0);
const PM_OPEN: (u32, u32, u32) = (13, 0, 0);
const PM_CLOSE: (u32, u32, u32) = (15, 0, 0);

fn cst() -> FixedOffset {
    FixedOffset::east_opt(CST_OFFSET_SECS).expect("CST offset is valid")
}

fn hms((h, m, s): (u32, u32, u32)) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, s).expect("session time is valid")
}

/// Whether the market is in a trading session at instant `t`. Outside the
/// two sessions (pre-open, lunch break, post-close) a full-market refresh is
/// not meaningful.
pub fn is_trading_now(t: DateTime<Utc>) -> bool {
    let local = t.with_timezone(&cst()).time();
    (hms(AM_OPEN)..=hms(AM_CLOSE)).contains(&local)
        || (hms(PM_OPEN)..=hms(PM_CLOSE)).contains(&local)
}

/// Whether `t` falls after the day's final close (exchange-local).
pub fn is_after_close(t: DateTime<Utc>) -> bool {
    t.with_timezone(&cst()).time() > hms(PM_CLOSE)
}

/// The 15:00 exchange-local close instant of `t`'s local calendar day.
pub fn session_close_instant(t: DateTime<Utc>) -> DateTime<Utc> {
    let tz = cst();
    let close_local = t.with_timezone(&tz).date_naive().and_time(hms(PM_CLOSE));
    match tz.from_local_datetime(&close_local).single() {
        Some(dt) => dt.with_timezone(&Utc),
        // Fixed offsets never yield ambiguous local times.
        None => t,
    }
}

/// Midnight of `t`'s exchange-local calendar day, as a UTC instant. Used to
/// scope "today's" snapshot series.
pub fn start_of_local_day(t: DateTime<Utc>) -> DateTime<Utc> {
    let tz = cst();
    let midnight = t
        .with_timezone(&tz)
        .date_naive()
        .and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&midnight).single() {
        Some(dt) => dt.with_timezone(&Utc),
        None => t,
    }
}

/// Given each fund's most recent snapshot time, returns the funds still
/// owed a post-close snapshot for `now`'s calendar day: those with no
/// snapshot at or after that day's 15:00 close. Evaluated per fund, so a
/// fund added after the close still gets its one end-of-day snapshot.
pub fn funds_needing_close_snapshot(
    now: DateTime<Utc>,
    latest_snapshot_per_fund: &[(i64, Option<DateTime<Utc>>)],
) -> Vec<i64> {
    let close = session_close_instant(now);
    latest_snapshot_per_fund
        .iter()
        .filter(|(_, latest)| match latest {
            Some(ts) => *ts < close,
            None => true,
        })
        .map(|(fund_id, _)| *fund_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cst_instant(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        // 2026-03-02 is a Monday.
        cst()
            .with_ymd_and_hms(2026, 3, 2, h, m, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn session_boundaries_are_inclusive() {
        assert!(is_trading_now(cst_instant(9, 30, 0)));
        assert!(is_trading_now(cst_instant(11, 30, 0)));
        assert!(is_trading_now(cst_instant(13, 0, 0)));
        assert!(is_trading_now(cst_instant(15, 0, 0)));
    }

    #[test]
    fn outside_sessions_is_not_trading() {
        assert!(!is_trading_now(cst_instant(9, 29, 59)));
        assert!(!is_trading_now(cst_instant(11, 30, 1)));
        assert!(!is_trading_now(cst_instant(12, 15, 0)));
        assert!(!is_trading_now(cst_instant(15, 0, 1)));
        assert!(!is_trading_now(cst_instant(20, 0, 0)));
    }

    #[test]
    fn after_close_only_past_final_session() {
        assert!(!is_after_close(cst_instant(14, 59, 59)));
        assert!(!is_after_close(cst_instant(15, 0, 0)));
        assert!(is_after_close(cst_instant(15, 0, 1)));
        assert!(is_after_close(cst_instant(18, 0, 0)));
    }

    #[test]
    fn close_dedup_is_per_fund() {
        let now = cst_instant(18, 0, 0);
        let latest = vec![
            // Snapshotted at 15:05 local: already has today's close row.
            (1, Some(cst_instant(15, 5, 0))),
            // Last snapshot was during the morning session: still due.
            (2, Some(cst_instant(11, 0, 0))),
            // Newly added fund with no history: due.
            (3, None),
        ];
        assert_eq!(funds_needing_close_snapshot(now, &latest), vec![2, 3]);
    }

    #[test]
    fn day_start_is_local_midnight() {
        let t = cst_instant(18, 0, 0);
        let start = start_of_local_day(t);
        assert_eq!(start, cst_instant(0, 0, 0));
    }

    #[test]
    fn snapshot_exactly_at_close_counts() {
        let now = cst_instant(18, 0, 0);
        let latest = vec![(1, Some(cst_instant(15, 0, 0)))];
        assert!(funds_needing_close_snapshot(now, &latest).is_empty());
    }
}
