use std::fmt::{self, Write};
use std::{ops, str::FromStr};

use serde::{Deserialize, Serialize};

fn is_metadata<T: AsRef<str>>(s: T) -> bool {
    s.as_ref().starts_with('$')
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TopicError {
    #[error("InvalidTopic({0})")]
    InvalidTopic(String),
    #[error("InvalidLevel({0})")]
    InvalidLevel(String),
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    Metadata(String), // $SYS, only ever the first level
    Blank,
    SingleWildcard, // Single level wildcard +
    MultiWildcard,  // Multi-level wildcard #
}

impl Level {
    pub fn parse<T: AsRef<str>>(s: T) -> Result<Level, TopicError> {
        Level::from_str(s.as_ref())
    }

    pub fn normal<T: AsRef<str>>(s: T) -> Result<Level, TopicError> {
        if s.as_ref().contains(['+', '#']) {
            return Err(TopicError::InvalidLevel(format!(
                "invalid normal level `{}` contains +|#",
                s.as_ref()
            )));
        }

        Ok(Level::Normal(String::from(s.as_ref())))
    }

    pub fn metadata<T: AsRef<str>>(s: T) -> Result<Level, TopicError> {
        if s.as_ref().contains(['+', '#']) {
            return Err(TopicError::InvalidLevel(format!(
                "invalid metadata level `{}` contains +|#",
                s.as_ref()
            )));
        }

        if !is_metadata(s.as_ref()) {
            return Err(TopicError::InvalidLevel(format!(
                "invalid metadata level `{}` not starts with $",
                s.as_ref()
            )));
        }

        Ok(Level::Metadata(String::from(s.as_ref())))
    }

    #[inline]
    pub fn value(&self) -> Option<&str> {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_normal(&self) -> bool {
        matches!(*self, Level::Normal(_))
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(*self, Level::Metadata(_))
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(*self, Level::SingleWildcard | Level::MultiWildcard)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        match *self {
            Level::Normal(ref s) => !s.contains(['+', '#']),
            Level::Metadata(ref s) => is_metadata(s) && !s.contains(['+', '#']),
            _ => true,
        }
    }
}

/// A parsed topic name or topic filter.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &Vec<Level> {
        &self.0
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.iter().enumerate().all(|(pos, level)| {
                level.is_valid()
                    && match *level {
                        Level::MultiWildcard => pos == self.0.len() - 1,
                        Level::Metadata(_) => pos == 0,
                        _ => true,
                    }
            })
    }

    /// Whether this topic contains `+` or `#`.
    #[inline]
    pub fn has_wildcard(&self) -> bool {
        self.0.iter().any(|l| l.is_wildcard())
    }

    /// Parse a concrete topic name, wildcards are rejected.
    pub fn parse_name(s: &str) -> Result<Topic, TopicError> {
        let topic = Topic::from_str(s)?;
        if topic.has_wildcard() {
            Err(TopicError::InvalidTopic(format!("topic name `{}` contains wildcards", s)))
        } else {
            Ok(topic)
        }
    }

    /// `self` is a filter, `topic` a concrete topic name.
    pub fn matches(&self, topic: &Topic) -> bool {
        self.matches_levels(topic.0.iter().map(|l| match l {
            Level::Normal(s) | Level::Metadata(s) => s.as_str(),
            _ => "",
        }))
    }

    pub fn matches_str<S: AsRef<str> + ?Sized>(&self, topic: &S) -> bool {
        self.matches_levels(topic.as_ref().split('/'))
    }

    fn matches_levels<'a, I>(&self, levels: I) -> bool
    where
        I: Iterator<Item = &'a str>,
    {
        let mut lhs = self.0.iter();

        for (pos, rhs) in levels.enumerate() {
            match lhs.next() {
                Some(Level::MultiWildcard) => return pos != 0 || !is_metadata(rhs),
                Some(Level::SingleWildcard) => {
                    if pos == 0 && is_metadata(rhs) {
                        return false;
                    }
                }
                Some(Level::Normal(lvl)) | Some(Level::Metadata(lvl)) if lvl == rhs => continue,
                Some(Level::Blank) if rhs.is_empty() => continue,
                _ => return false,
            }
        }

        match lhs.next() {
            Some(&Level::MultiWildcard) => true,
            Some(_) => false,
            None => true,
        }
    }
}

impl From<&[Level]> for Topic {
    fn from(s: &[Level]) -> Self {
        Topic(s.to_vec())
    }
}

impl From<Vec<Level>> for Topic {
    fn from(v: Vec<Level>) -> Self {
        Topic(v)
    }
}

impl From<Topic> for Vec<Level> {
    fn from(t: Topic) -> Self {
        t.0
    }
}

impl ops::Deref for Topic {
    type Target = Vec<Level>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for Level {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ => {
                if s.contains(['+', '#']) {
                    Err(TopicError::InvalidLevel(format!("invalid level `{}` contains +|#", s)))
                } else if is_metadata(s) {
                    Ok(Level::Metadata(String::from(s)))
                } else {
                    Ok(Level::Normal(String::from(s)))
                }
            }
        }
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        if s.is_empty() {
            return Err(TopicError::InvalidTopic("empty topic".into()));
        }
        s.split('/')
            .enumerate()
            .map(|(pos, l)| match Level::from_str(l)? {
                //'$' only marks a system topic at the first level
                Level::Metadata(m) if pos > 0 => Ok(Level::Normal(m)),
                level => Ok(level),
            })
            .collect::<Result<Vec<_>, TopicError>>()
            .map(Topic)
            .and_then(|topic| {
                if topic.is_valid() {
                    Ok(topic)
                } else {
                    Err(TopicError::InvalidTopic(format!("invalid topic `{}`", s)))
                }
            })
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => f.write_str(s.as_str()),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for level in &self.0 {
            if first {
                first = false;
            } else {
                f.write_char('/')?;
            }

            level.fmt(f)?;
        }

        Ok(())
    }
}
