//! Temporal phrase detection and mapping to capability-specific filters.
//!
//! Temporal scope never goes into a step's query. It is expressed only as
//! filters, and only with fields the target source declares: a
//! `time_range` preset when the source has one, otherwise
//! `date_after` / `date_before` computed from a reference date.

use chrono::{Duration, NaiveDate};

use crate::capabilities::SourceCapabilities;
use crate::models::{FilterClause, FilterOperator};

/// Widest window refinement will widen to.
pub const MAX_WINDOW_DAYS: i64 = 365;

/// Relative phrases, longest first where one contains another.
const RELATIVE_PHRASES: [(&str, &str, i64); 10] = [
    ("most recent", "30d", 30),
    ("latest", "30d", 30),
    ("recently", "30d", 30),
    ("recent", "30d", 30),
    ("today", "today", 0),
    ("yesterday", "yesterday", 1),
    ("this week", "7d", 7),
    ("last week", "14d", 14),
    ("this month", "30d", 30),
    ("last month", "60d", 60),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemporalSpec {
    /// A relative range such as "last week". `preset` is the `time_range`
    /// value, `days` how far back `date_after` reaches.
    Relative {
        phrase: &'static str,
        preset: &'static str,
        days: i64,
    },
    After(NaiveDate),
    Before(NaiveDate),
    On(NaiveDate),
}

impl TemporalSpec {
    /// Relative ranges ask for the newest items first.
    pub fn implies_recency(&self) -> bool {
        matches!(self, TemporalSpec::Relative { .. })
    }

    /// Normalized phrase for this spec.
    pub fn phrase(&self) -> String {
        match self {
            TemporalSpec::Relative { phrase, .. } => phrase.to_string(),
            TemporalSpec::After(d) => format!("since {}", d),
            TemporalSpec::Before(d) => format!("before {}", d),
            TemporalSpec::On(d) => format!("on {}", d),
        }
    }
}

/// Find the first temporal expression in free text.
///
/// Explicit dates (`since 2026-03-01`, `before ...`, `on ...`) win over
/// relative phrases.
pub fn detect(text: &str) -> Option<TemporalSpec> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == ',' || c == '?' || c == '!')
        .filter(|w| !w.is_empty())
        .collect();

    for pair in words.windows(2) {
        let date = match NaiveDate::parse_from_str(pair[1].trim_end_matches('.'), "%Y-%m-%d") {
            Ok(d) => d,
            Err(_) => continue,
        };
        match pair[0] {
            "since" | "after" | "from" => return Some(TemporalSpec::After(date)),
            "before" | "until" => return Some(TemporalSpec::Before(date)),
            "on" => return Some(TemporalSpec::On(date)),
            _ => {}
        }
    }
    if words.len() == 1 {
        if let Ok(d) = NaiveDate::parse_from_str(words[0], "%Y-%m-%d") {
            return Some(TemporalSpec::On(d));
        }
    }

    RELATIVE_PHRASES
        .iter()
        .find(|(phrase, _, _)| contains_phrase(&lower, phrase))
        .map(|(phrase, preset, days)| TemporalSpec::Relative {
            phrase,
            preset,
            days: *days,
        })
}

/// True when `phrase` occurs in `text` on word boundaries.
pub fn contains_phrase(text: &str, phrase: &str) -> bool {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(pos) = text[start..].find(phrase) {
        let begin = start + pos;
        let end = begin + phrase.len();
        let left_ok = begin == 0 || !bytes[begin - 1].is_ascii_alphanumeric();
        let right_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if left_ok && right_ok {
            return true;
        }
        start = begin + 1;
        if start >= text.len() {
            break;
        }
    }
    false
}

/// Build the temporal filters for one source.
///
/// Fields the source does not declare are left out.
pub fn temporal_filters(
    spec: &TemporalSpec,
    caps: &SourceCapabilities,
    reference: NaiveDate,
) -> Vec<FilterClause> {
    let mut out = Vec::new();
    let after = |out: &mut Vec<FilterClause>, date: NaiveDate| {
        if caps.supports_filter("date_after", FilterOperator::Gte) {
            out.push(FilterClause::new("date_after", FilterOperator::Gte, date.to_string()));
        }
    };
    let before = |out: &mut Vec<FilterClause>, date: NaiveDate| {
        if caps.supports_filter("date_before", FilterOperator::Lte) {
            out.push(FilterClause::new("date_before", FilterOperator::Lte, date.to_string()));
        }
    };

    match spec {
        TemporalSpec::Relative { preset, days, .. } => {
            if caps.supports_filter("time_range", FilterOperator::Eq) {
                out.push(FilterClause::new("time_range", FilterOperator::Eq, *preset));
            } else if *preset == "yesterday" {
                let day = reference - Duration::days(1);
                after(&mut out, day);
                before(&mut out, day);
            } else {
                after(&mut out, reference - Duration::days(*days));
            }
        }
        TemporalSpec::After(d) => after(&mut out, *d),
        TemporalSpec::Before(d) => before(&mut out, *d),
        TemporalSpec::On(d) => {
            after(&mut out, *d);
            before(&mut out, *d);
        }
    }
    out
}

/// Width in days of the temporal window expressed by `filters`, if any.
pub fn window_days(filters: &[FilterClause], reference: NaiveDate) -> Option<i64> {
    for f in filters {
        match f.field.as_str() {
            "time_range" => return parse_preset_days(&f.value),
            "date_after" => {
                let date = NaiveDate::parse_from_str(&f.value, "%Y-%m-%d").ok()?;
                return Some((reference - date).num_days().max(1));
            }
            _ => {}
        }
    }
    None
}

fn parse_preset_days(preset: &str) -> Option<i64> {
    match preset {
        "today" => Some(1),
        "yesterday" => Some(2),
        other => other.strip_suffix('d')?.parse::<i64>().ok(),
    }
}

/// Replace the temporal filters in `filters` with a window of `days`.
///
/// Returns `None` when the source cannot express a window.
pub fn with_window(
    filters: &[FilterClause],
    caps: &SourceCapabilities,
    reference: NaiveDate,
    days: i64,
) -> Option<Vec<FilterClause>> {
    let days = days.clamp(1, MAX_WINDOW_DAYS);
    let mut out: Vec<FilterClause> = filters.iter().filter(|f| !f.is_temporal()).cloned().collect();
    if caps.supports_filter("time_range", FilterOperator::Eq) {
        out.push(FilterClause::new("time_range", FilterOperator::Eq, format!("{}d", days)));
    } else if caps.supports_filter("date_after", FilterOperator::Gte) {
        out.push(FilterClause::new(
            "date_after",
            FilterOperator::Gte,
            (reference - Duration::days(days)).to_string(),
        ));
    } else {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RetrievalMethod;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn dated_source() -> SourceCapabilities {
        SourceCapabilities::new("email", &[RetrievalMethod::Structured])
            .with_filter("date_after", &[FilterOperator::Gte])
            .with_filter("date_before", &[FilterOperator::Lte])
    }

    fn preset_source() -> SourceCapabilities {
        SourceCapabilities::new("browser_history", &[RetrievalMethod::Structured])
            .with_filter("time_range", &[FilterOperator::Eq])
    }

    #[test]
    fn test_detect_prefers_longest_relative_phrase() {
        let spec = detect("show me the most recent message").unwrap();
        assert_eq!(spec.phrase(), "most recent");
        assert_eq!(detect("what did I read recently").unwrap().phrase(), "recently");
    }

    #[test]
    fn test_detect_respects_word_boundaries() {
        assert!(detect("the todays_report file").is_none());
        assert!(detect("notes from yesterday.").is_some());
    }

    #[test]
    fn test_detect_explicit_dates() {
        assert_eq!(
            detect("invoices since 2026-03-01"),
            Some(TemporalSpec::After(date("2026-03-01")))
        );
        assert_eq!(
            detect("anything before 2026-01-31?"),
            Some(TemporalSpec::Before(date("2026-01-31")))
        );
        assert_eq!(detect("2026-05-05"), Some(TemporalSpec::On(date("2026-05-05"))));
    }

    #[test]
    fn test_preset_used_when_time_range_declared() {
        let spec = detect("last week").unwrap();
        let filters = temporal_filters(&spec, &preset_source(), date("2026-10-18"));
        assert_eq!(filters, vec![FilterClause::new("time_range", FilterOperator::Eq, "14d")]);
    }

    #[test]
    fn test_date_after_used_otherwise() {
        let spec = detect("this week").unwrap();
        let filters = temporal_filters(&spec, &dated_source(), date("2026-10-18"));
        assert_eq!(
            filters,
            vec![FilterClause::new("date_after", FilterOperator::Gte, "2026-10-11")]
        );
    }

    #[test]
    fn test_yesterday_is_bounded_on_both_sides() {
        let spec = detect("yesterday").unwrap();
        let filters = temporal_filters(&spec, &dated_source(), date("2026-10-18"));
        assert_eq!(filters.len(), 2);
        assert!(filters.iter().all(|f| f.value == "2026-10-17"));
    }

    #[test]
    fn test_undeclared_fields_are_left_out() {
        let caps = SourceCapabilities::new("web", &[RetrievalMethod::Vector]);
        let spec = detect("today").unwrap();
        assert!(temporal_filters(&spec, &caps, date("2026-10-18")).is_empty());
    }

    #[test]
    fn test_window_roundtrip_through_rescale() {
        let reference = date("2026-10-18");
        let caps = dated_source();
        let filters = vec![FilterClause::new("date_after", FilterOperator::Gte, "2026-10-11")];
        assert_eq!(window_days(&filters, reference), Some(7));
        let widened = with_window(&filters, &caps, reference, 14).unwrap();
        assert_eq!(window_days(&widened, reference), Some(14));
        let capped = with_window(&filters, &caps, reference, 10_000).unwrap();
        assert_eq!(window_days(&capped, reference), Some(MAX_WINDOW_DAYS));
    }

    #[test]
    fn test_preset_window_days() {
        let reference = date("2026-10-18");
        let filters = vec![FilterClause::new("time_range", FilterOperator::Eq, "30d")];
        assert_eq!(window_days(&filters, reference), Some(30));
        let narrowed = with_window(&filters, &preset_source(), reference, 15).unwrap();
        assert_eq!(narrowed[0].value, "15d");
    }
}
