//! MQTT-style topic filters
//!
//! `+` matches exactly one level, `#` matches the remaining levels
//! (including none) and must be last.

use std::fmt;

use pnsim_core::{SimError, SimResult};

const LEVEL_SEPARATOR: char = '/';

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Level {
    Exact(String),
    Single,
    Rest,
}

/// Parsed subscription filter
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    raw: String,
    levels: Vec<Level>,
}

impl TopicFilter {
    pub fn parse(filter: &str) -> SimResult<Self> {
        if filter.is_empty() {
            return Err(SimError::Transport("empty topic filter".into()));
        }
        let parts: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
        let mut levels = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let level = match *part {
                "#" if i + 1 == parts.len() => Level::Rest,
                "+" => Level::Single,
                p if p.contains('#') || p.contains('+') => {
                    return Err(SimError::Transport(format!("invalid topic filter {:?}", filter)))
                }
                p => Level::Exact(p.to_string()),
            };
            levels.push(level);
        }
        Ok(TopicFilter {
            raw: filter.to_string(),
            levels,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split(LEVEL_SEPARATOR);
        for level in &self.levels {
            match level {
                Level::Rest => return true,
                Level::Single => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Level::Exact(expected) => match parts.next() {
                    Some(part) if part == expected => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_level_wildcard() {
        let filter = TopicFilter::parse("room/+").unwrap();
        assert!(filter.matches("room/Q gain"));
        assert!(!filter.matches("room/a/b"));
        assert!(!filter.matches("room"));
        assert!(!filter.matches("kitchen/Q gain"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        let filter = TopicFilter::parse("room/#").unwrap();
        assert!(filter.matches("room/Q gain"));
        assert!(filter.matches("room/a/b"));
        assert!(filter.matches("room"));
        assert!(!filter.matches("roomy/x"));
    }

    #[test]
    fn test_exact() {
        let filter = TopicFilter::parse("control").unwrap();
        assert!(filter.matches("control"));
        assert!(!filter.matches("control/x"));
        assert!(!filter.matches("private/sim-1"));
    }

    #[test]
    fn test_invalid_filters() {
        for bad in ["", "room/#/x", "room/a#", "+x/y"] {
            assert!(TopicFilter::parse(bad).is_err(), "{bad}");
        }
    }
}
