use once_cell::sync::Lazy;
use regex::Regex;

/// What a single output line turns into
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    RawLine(String),
    PercentUpdate(u8),
}

// A number glued to a percent sign. The leading guard rejects fragments of
// larger tokens such as the "5" in a locale-formatted "37,5%".
static PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\d.,])(\d+(?:\.\d+)?)%").expect("percent pattern is valid"));

/// Extracts the first percentage in `line`, truncated into `0..=100`.
pub fn parse_percent(line: &str) -> Option<u8> {
    let captures = PERCENT.captures(line)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    Some(value.trunc().clamp(0.0, 100.0) as u8)
}

/// The raw line always comes first; a percentage, when present, follows it.
pub fn events_for_line(line: &str) -> Vec<ProgressEvent> {
    let mut events = vec![ProgressEvent::RawLine(line.to_string())];
    if let Some(pct) = parse_percent(line) {
        events.push(ProgressEvent::PercentUpdate(pct));
    }
    events
}
