use chrono::{DateTime, NaiveDate, NaiveDateTime};

/// A parsed timestamp and whether the source used the RFC3339 `T`
/// separator (Postgres keeps it on re-render).
pub(crate) struct ParsedTimestamp {
    pub naive_utc: NaiveDateTime,
    pub had_t_separator: bool,
}

/// RFC3339 first, then the common dump/driver renderings. Zoned inputs
/// are converted to UTC; naive inputs are taken as already UTC.
pub(crate) fn parse_timestamp(value: &str) -> Option<ParsedTimestamp> {
    let had_t_separator = value.contains('T');

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(ParsedTimestamp {
            naive_utc: dt.naive_utc(),
            had_t_separator,
        });
    }
    // zone-suffixed without the T separator, e.g. `2024-05-01 10:00:00+00`
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return Some(ParsedTimestamp {
                naive_utc: dt.naive_utc(),
                had_t_separator,
            });
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(ParsedTimestamp {
                naive_utc: dt,
                had_t_separator,
            });
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(ParsedTimestamp {
            naive_utc: d.and_hms_opt(0, 0, 0)?,
            had_t_separator: false,
        });
    }
    None
}
