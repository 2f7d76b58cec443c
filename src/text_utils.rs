use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Year-month-day with an optional time part, covering the date
    // styles people actually write in frontmatter.
    static ref POST_DATE: Regex =
        Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})([T ](\d{1,2}):(\d{1,2})(:(\d{1,2}))?)?")
            .unwrap();
}

/// Parses a frontmatter date string. Returns `None` for anything that
/// is not a date, a post simply has no display date then.
pub fn parse_post_date(buf: &str) -> Option<NaiveDateTime> {
    let caps = POST_DATE.captures(buf.trim())?;

    let to_u32 = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<u32>().ok());

    let year = caps.get(1)?.as_str().parse::<i32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, to_u32(2)?, to_u32(3)?)?;
    let time = NaiveTime::from_hms_opt(
        to_u32(5).unwrap_or(0),
        to_u32(6).unwrap_or(0),
        to_u32(8).unwrap_or(0),
    )?;

    Some(NaiveDateTime::new(date, time))
}

/// Long display form, e.g. "April 2, 2022".
pub fn display_date(date_time: &NaiveDateTime) -> String {
    date_time.format("%B %-d, %Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_bare_date() {
        let date = parse_post_date("2022-04-02").unwrap();
        assert_eq!(display_date(&date), "April 2, 2022");
    }

    #[test]
    fn parses_date_with_time() {
        let date = parse_post_date("2017-09-10 10:42:32").unwrap();
        assert_eq!(date.format("%H:%M:%S").to_string(), "10:42:32");

        let date = parse_post_date("2017-09-10T10:42").unwrap();
        assert_eq!(date.format("%H:%M:%S").to_string(), "10:42:00");
    }

    #[test]
    fn single_digit_fields_are_fine() {
        let date = parse_post_date("2024-1-5").unwrap();
        assert_eq!(display_date(&date), "January 5, 2024");
    }

    #[test]
    fn nonsense_is_none() {
        assert!(parse_post_date("soon").is_none());
        assert!(parse_post_date("").is_none());
        assert!(parse_post_date("2024-13-01").is_none());
    }
}
