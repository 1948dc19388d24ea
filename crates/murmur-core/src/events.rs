//! Events: whitespace-separated token tuples delivered to posted agents.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A named event. The first token is the event name; the rest is the
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    tokens: Vec<String>,
}

impl Event {
    /// Build an event from tokens. The list must be non-empty and each
    /// token a single word.
    pub fn new<I, S>(tokens: I) -> Result<Event>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        if tokens.is_empty() {
            return Err(Error::Schedule("event must have a name".into()));
        }
        for token in &tokens {
            if token.is_empty() || token.chars().any(|c| c.is_ascii_whitespace()) {
                return Err(Error::Schedule(format!("bad event token: {token:?}")));
            }
        }
        Ok(Event { tokens })
    }

    /// Split a wire line into an event. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Event> {
        let tokens: Vec<String> = line.split_ascii_whitespace().map(str::to_string).collect();
        if tokens.is_empty() {
            None
        } else {
            Some(Event { tokens })
        }
    }

    pub fn name(&self) -> &str {
        &self.tokens[0]
    }

    pub fn args(&self) -> &[String] {
        &self.tokens[1..]
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

impl FromStr for Event {
    type Err = Error;

    fn from_str(line: &str) -> Result<Event> {
        Event::parse(line).ok_or_else(|| Error::Schedule("empty event line".into()))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tokens.join(" "))
    }
}

/// Validate a name an agent wants to watch.
pub fn validate_event_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(|c| c.is_ascii_whitespace()) {
        return Err(Error::Schedule(format!("invalid event name: {name:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_on_whitespace() {
        let ev = Event::parse("hello  world\tagain").unwrap();
        assert_eq!(ev.name(), "hello");
        assert_eq!(ev.args(), ["world", "again"]);
    }

    #[test]
    fn test_parse_blank_lines() {
        assert!(Event::parse("").is_none());
        assert!(Event::parse("   \t ").is_none());
    }

    #[test]
    fn test_new_rejects_bad_tokens() {
        assert!(Event::new(Vec::<String>::new()).is_err());
        assert!(Event::new(["two words"]).is_err());
        assert!(Event::new([""]).is_err());
        assert!(Event::new(["ok", "fine"]).is_ok());
    }

    #[test]
    fn test_display_round_trip() {
        let ev: Event = "hello world".parse().unwrap();
        assert_eq!(ev.to_string(), "hello world");
        assert_eq!("hello world".parse::<Event>().unwrap(), ev);
    }

    #[test]
    fn test_validate_event_name() {
        assert!(validate_event_name("hello").is_ok());
        assert!(validate_event_name("").is_err());
        assert!(validate_event_name("two words").is_err());
    }
}
