use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Current UTC time as an RFC3339 string, second precision.
pub fn now_iso8601() -> String {
    let now = OffsetDateTime::now_utc().replace_nanosecond(0).unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// Parse an RFC3339 timestamp produced by [`now_iso8601`].
pub fn parse_iso8601(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let now = now_iso8601();
        let parsed = parse_iso8601(&now).unwrap();
        assert_eq!(parsed.format(&Rfc3339).unwrap(), now);
    }

    #[test]
    fn output_is_lexically_ordered() {
        let a = now_iso8601();
        let b = now_iso8601();
        assert!(a <= b);
    }
}
