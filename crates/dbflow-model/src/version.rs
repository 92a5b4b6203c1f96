//! Three-part file versions.
//!
//! A version is `interface.quality.revision`. Ordering is lexicographic on
//! the triple and the string form round-trips exactly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::FormatError;

/// Version of a cataloged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub interface: u32,
    pub quality: u32,
    pub revision: u32,
}

/// Which component of a [`Version`] a reprocessing run increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionPart {
    Interface,
    Quality,
    Revision,
}

impl Version {
    pub const fn new(interface: u32, quality: u32, revision: u32) -> Self {
        Self {
            interface,
            quality,
            revision,
        }
    }

    /// Return a copy with exactly one component incremented.
    ///
    /// Lower components are left alone; resetting them is up to the caller.
    /// Fails rather than wrapping when the component is already at its
    /// maximum.
    pub fn bump(self, part: VersionPart) -> Result<Self, FormatError> {
        let mut next = self;
        let slot = match part {
            VersionPart::Interface => &mut next.interface,
            VersionPart::Quality => &mut next.quality,
            VersionPart::Revision => &mut next.revision,
        };
        *slot = slot
            .checked_add(1)
            .ok_or(FormatError::VersionOverflow {
                version: self,
                part,
            })?;
        Ok(next)
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::new(1, 0, 0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.interface, self.quality, self.revision)
    }
}

impl FromStr for Version {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(FormatError::Version(s.to_string()));
        }

        let mut nums = [0u32; 3];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            // u32::from_str accepts a leading '+', which would break round-trip
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FormatError::Version(s.to_string()));
            }
            *slot = part
                .parse()
                .map_err(|_| FormatError::Version(s.to_string()))?;
        }

        Ok(Self::new(nums[0], nums[1], nums[2]))
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

impl VersionPart {
    /// Numeric index as stored in queue entries (0, 1 or 2).
    pub fn index(self) -> u8 {
        match self {
            VersionPart::Interface => 0,
            VersionPart::Quality => 1,
            VersionPart::Revision => 2,
        }
    }
}

impl TryFrom<i64> for VersionPart {
    type Error = FormatError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(VersionPart::Interface),
            1 => Ok(VersionPart::Quality),
            2 => Ok(VersionPart::Revision),
            other => Err(FormatError::VersionPart(other)),
        }
    }
}

impl fmt::Display for VersionPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionPart::Interface => write!(f, "interface"),
            VersionPart::Quality => write!(f, "quality"),
            VersionPart::Revision => write!(f, "revision"),
        }
    }
}

impl FromStr for VersionPart {
    type Err = FormatError;

    /// Accepts the component name or its index.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interface" | "0" => Ok(VersionPart::Interface),
            "quality" | "1" => Ok(VersionPart::Quality),
            "revision" | "2" => Ok(VersionPart::Revision),
            _ => Err(FormatError::VersionPart(s.parse().unwrap_or(-1))),
        }
    }
}
