use crate::types::LcPolicy;
use time::OffsetDateTime;

/// §4.6 "S3 expiration header derivation": the earliest expiration
/// date across all enabled rules matching `obj_key`/`tags`, formatted
/// as `expiry-date="...", rule-id="ID"`. Empty string if nothing
/// matches.
pub fn rgwlc_s3_expiration_header(obj_key: &str, tags: &[(String, String)], mtime: OffsetDateTime, policy: &LcPolicy) -> String {
    let mut earliest: Option<(OffsetDateTime, &str)> = None;

    for rule in &policy.rules {
        if !rule.matches_key_and_tags(obj_key, tags) {
            continue;
        }
        let Some(exp) = &rule.expiration else { continue };
        let expiry = match (exp.days, exp.date) {
            (_, Some(date)) => date,
            (Some(days), None) => mtime + time::Duration::days(days as i64),
            (None, None) => continue,
        };
        let is_earlier = match earliest {
            Some((cur, _)) => expiry < cur,
            None => true,
        };
        if is_earlier {
            earliest = Some((expiry, rule.id.as_str()));
        }
    }

    match earliest {
        Some((date, rule_id)) => {
            let formatted = format_http_date(date);
            format!("expiry-date=\"{formatted}\", rule-id=\"{rule_id}\"")
        }
        None => String::new(),
    }
}

fn format_http_date(date: OffsetDateTime) -> String {
    let weekday = match date.weekday() {
        time::Weekday::Monday => "Mon",
        time::Weekday::Tuesday => "Tue",
        time::Weekday::Wednesday => "Wed",
        time::Weekday::Thursday => "Thu",
        time::Weekday::Friday => "Fri",
        time::Weekday::Saturday => "Sat",
        time::Weekday::Sunday => "Sun",
    };
    let month = match date.month() {
        time::Month::January => "Jan",
        time::Month::February => "Feb",
        time::Month::March => "Mar",
        time::Month::April => "Apr",
        time::Month::May => "May",
        time::Month::June => "Jun",
        time::Month::July => "Jul",
        time::Month::August => "Aug",
        time::Month::September => "Sep",
        time::Month::October => "Oct",
        time::Month::November => "Nov",
        time::Month::December => "Dec",
    };
    format!("{}, {:02} {} {} {:02}:{:02}:{:02} GMT", weekday, date.day(), month, date.year(), date.hour(), date.minute(), date.second())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Expiration, LcRule};
    use time::macros::datetime;

    #[test]
    fn picks_the_earliest_matching_rule() {
        let policy = LcPolicy {
            rules: vec![
                LcRule {
                    id: "far".to_string(),
                    prefix: "logs/".to_string(),
                    enabled: true,
                    tag_filter: vec![],
                    expiration: Some(Expiration { days: Some(30), date: None }),
                    noncur_expiration_days: None,
                    dm_expiration_days: None,
                    mp_expiration_days: None,
                },
                LcRule {
                    id: "near".to_string(),
                    prefix: "logs/".to_string(),
                    enabled: true,
                    tag_filter: vec![],
                    expiration: Some(Expiration { days: Some(7), date: None }),
                    noncur_expiration_days: None,
                    dm_expiration_days: None,
                    mp_expiration_days: None,
                },
            ],
        };
        let mtime = datetime!(2026-01-01 00:00:00 UTC);
        let header = rgwlc_s3_expiration_header("logs/a.txt", &[], mtime, &policy);
        assert!(header.contains("rule-id=\"near\""));
    }

    #[test]
    fn empty_when_nothing_matches() {
        let policy = LcPolicy { rules: vec![] };
        let mtime = datetime!(2026-01-01 00:00:00 UTC);
        assert_eq!(rgwlc_s3_expiration_header("any", &[], mtime, &policy), "");
    }
}
