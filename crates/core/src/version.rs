//! Semantic versions assigned to published proposals.
//!
//! Publishing only ever bumps the patch component. Reverting walks back with
//! [`Version::decrement`], which borrows from minor and then major when the
//! lower components are zero. A borrow resets every lower component to zero.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A `major.minor.patch` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// The version of a proposal that has never been published.
    pub const INITIAL: Version = Version::new(0, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Next published version: `patch + 1`.
    pub fn increment(&self) -> Self {
        Self::new(self.major, self.minor, self.patch + 1)
    }

    /// Previous version, or `None` at `0.0.0`.
    pub fn decrement(&self) -> Option<Self> {
        if self.patch > 0 {
            Some(Self::new(self.major, self.minor, self.patch - 1))
        } else if self.minor > 0 {
            Some(Self::new(self.major, self.minor - 1, 0))
        } else if self.major > 0 {
            Some(Self::new(self.major - 1, 0, 0))
        } else {
            None
        }
    }

    pub fn is_initial(&self) -> bool {
        *self == Self::INITIAL
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error returned when a version string is not `N.N.N`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version '{0}': expected major.minor.patch")]
pub struct ParseVersionError(pub String);

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError(s.to_string());
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u32, ParseVersionError> {
            parts.next().ok_or_else(err)?.parse::<u32>().map_err(|_| err())
        };
        let version = Version::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(version)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_bumps_patch_only() {
        assert_eq!(Version::INITIAL.increment().to_string(), "0.0.1");
        assert_eq!(Version::new(1, 4, 9).increment(), Version::new(1, 4, 10));
    }

    #[test]
    fn test_decrement_borrow_rule() {
        assert_eq!(Version::new(0, 0, 3).decrement(), Some(Version::new(0, 0, 2)));
        assert_eq!(Version::new(0, 2, 0).decrement(), Some(Version::new(0, 1, 0)));
        assert_eq!(Version::new(3, 0, 0).decrement(), Some(Version::new(2, 0, 0)));
        assert_eq!(Version::new(1, 0, 1).decrement(), Some(Version::new(1, 0, 0)));
        assert_eq!(Version::INITIAL.decrement(), None);
    }

    #[test]
    fn test_decrement_inverts_repeated_increment() {
        let mut v = Version::new(2, 1, 0);
        for _ in 0..50 {
            let next = v.increment();
            assert_eq!(next.decrement(), Some(v));
            v = next;
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!("0.0.1".parse::<Version>().unwrap(), Version::new(0, 0, 1));
        assert_eq!(" 10.20.30 ".parse::<Version>().unwrap(), Version::new(10, 20, 30));
        assert!("1.2".parse::<Version>().is_err());
        assert!("1.2.3.4".parse::<Version>().is_err());
        assert!("1.x.3".parse::<Version>().is_err());
        assert!("-1.0.0".parse::<Version>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&Version::new(0, 1, 2)).unwrap();
        assert_eq!(json, "\"0.1.2\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Version::new(0, 1, 2));
    }
}
