//! Version Data Structures
//!
//! A node owns one or more versions, identified by `(major, minor)` plus a
//! status. Version numbers render as `V{major}.{minor}.{status}`, for
//! example `V1.0.A` for the first approved major version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Approval status of a version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionStatus {
    Approved,
    Locked,
    Draft,
    Rejected,
    Pending,
}

impl VersionStatus {
    /// Stable integer code stored in the `versions.status` column
    pub fn code(self) -> i64 {
        match self {
            VersionStatus::Approved => 1,
            VersionStatus::Locked => 2,
            VersionStatus::Draft => 4,
            VersionStatus::Rejected => 8,
            VersionStatus::Pending => 16,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(VersionStatus::Approved),
            2 => Some(VersionStatus::Locked),
            4 => Some(VersionStatus::Draft),
            8 => Some(VersionStatus::Rejected),
            16 => Some(VersionStatus::Pending),
            _ => None,
        }
    }

    /// Single-letter abbreviation used in version strings
    pub fn abbreviation(self) -> char {
        match self {
            VersionStatus::Approved => 'A',
            VersionStatus::Locked => 'L',
            VersionStatus::Draft => 'D',
            VersionStatus::Rejected => 'R',
            VersionStatus::Pending => 'P',
        }
    }

    pub fn from_abbreviation(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'A' => Some(VersionStatus::Approved),
            'L' => Some(VersionStatus::Locked),
            'D' => Some(VersionStatus::Draft),
            'R' => Some(VersionStatus::Rejected),
            'P' => Some(VersionStatus::Pending),
            _ => None,
        }
    }
}

/// `(major, minor, status)` triple identifying a version of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionNumber {
    pub major: i16,
    pub minor: i16,
    pub status: VersionStatus,
}

impl VersionNumber {
    pub fn new(major: i16, minor: i16, status: VersionStatus) -> Self {
        Self {
            major,
            minor,
            status,
        }
    }

    /// A public major version: minor is zero and the status is Approved
    pub fn is_major(&self) -> bool {
        self.minor == 0 && self.status == VersionStatus::Approved
    }
}

impl Default for VersionNumber {
    fn default() -> Self {
        Self::new(1, 0, VersionStatus::Approved)
    }
}

/// Versions order by (major, minor); status only breaks ties so that
/// ordering agrees with `Eq`
impl PartialOrd for VersionNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor)
            .cmp(&(other.major, other.minor))
            .then_with(|| self.status.code().cmp(&other.status.code()))
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "V{}.{}.{}",
            self.major,
            self.minor,
            self.status.abbreviation()
        )
    }
}

impl FromStr for VersionNumber {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix('V')
            .or_else(|| s.strip_prefix('v'))
            .unwrap_or(s);
        let parts: Vec<&str> = body.split('.').collect();
        if parts.len() != 3 {
            return Err(format!("Invalid version number: {}", s));
        }
        let major = parts[0]
            .parse::<i16>()
            .map_err(|_| format!("Invalid major number in {}", s))?;
        let minor = parts[1]
            .parse::<i16>()
            .map_err(|_| format!("Invalid minor number in {}", s))?;
        let mut chars = parts[2].chars();
        let status = match (chars.next(), chars.next()) {
            (Some(c), None) => VersionStatus::from_abbreviation(c),
            _ => None,
        }
        .ok_or_else(|| format!("Invalid version status in {}", s))?;
        Ok(Self::new(major, minor, status))
    }
}

/// Version row
///
/// `changed_data` lists the property names touched by the last save, in the
/// order they were changed; the indexer uses it for partial reindexing.
/// `timestamp` is the version row's own concurrency token, independent of the
/// owning node head's token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionData {
    pub version_id: i64,
    pub node_id: i64,
    pub version: VersionNumber,
    pub creation_date: DateTime<Utc>,
    pub created_by_id: i64,
    pub modification_date: DateTime<Utc>,
    pub modified_by_id: i64,
    pub changed_data: Vec<String>,
    pub timestamp: i64,
}

impl VersionData {
    /// Create an unsaved version with the given number
    pub fn new(version: VersionNumber) -> Self {
        let now = Utc::now();
        Self {
            version_id: 0,
            node_id: 0,
            version,
            creation_date: now,
            created_by_id: 1,
            modification_date: now,
            modified_by_id: 1,
            changed_data: Vec::new(),
            timestamp: 0,
        }
    }
}

impl Default for VersionData {
    fn default() -> Self {
        Self::new(VersionNumber::default())
    }
}

/// Version id paired with its number, as listed by `get_version_numbers`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeVersion {
    pub version_id: i64,
    pub version: VersionNumber,
}

/// Pick the last minor and last major version ids from a node's versions
///
/// Minor: the highest (major, minor). Major: the highest version that is a
/// public major version (`minor == 0`, Approved); `None` when there is none.
pub fn last_version_ids(versions: &[NodeVersion]) -> (Option<i64>, Option<i64>) {
    let last_minor = versions.iter().max_by_key(|v| v.version).map(|v| v.version_id);
    let last_major = versions
        .iter()
        .filter(|v| v.version.is_major())
        .max_by_key(|v| v.version)
        .map(|v| v.version_id);
    (last_minor, last_major)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_number_display_and_parse() {
        let v = VersionNumber::new(2, 3, VersionStatus::Draft);
        assert_eq!(v.to_string(), "V2.3.D");
        assert_eq!("V2.3.D".parse::<VersionNumber>().unwrap(), v);
        assert_eq!("1.0.a".parse::<VersionNumber>().unwrap(), VersionNumber::default());
        assert!("V1.0".parse::<VersionNumber>().is_err());
        assert!("V1.0.X".parse::<VersionNumber>().is_err());
        assert!("Vx.0.A".parse::<VersionNumber>().is_err());
    }

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            VersionStatus::Approved,
            VersionStatus::Locked,
            VersionStatus::Draft,
            VersionStatus::Rejected,
            VersionStatus::Pending,
        ] {
            assert_eq!(VersionStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(VersionStatus::from_code(3), None);
    }

    #[test]
    fn test_ordering_by_number_then_status() {
        let a = VersionNumber::new(1, 0, VersionStatus::Approved);
        let b = VersionNumber::new(1, 1, VersionStatus::Draft);
        let c = VersionNumber::new(2, 0, VersionStatus::Draft);
        assert!(a < b);
        assert!(b < c);

        let approved = VersionNumber::new(1, 1, VersionStatus::Approved);
        assert_ne!(approved, b);
        assert_ne!(approved.cmp(&b), Ordering::Equal);
        assert_eq!(b.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn test_last_version_ids() {
        let versions = vec![
            NodeVersion {
                version_id: 10,
                version: VersionNumber::new(1, 0, VersionStatus::Approved),
            },
            NodeVersion {
                version_id: 11,
                version: VersionNumber::new(1, 1, VersionStatus::Draft),
            },
            NodeVersion {
                version_id: 12,
                version: VersionNumber::new(2, 0, VersionStatus::Rejected),
            },
        ];
        assert_eq!(last_version_ids(&versions), (Some(12), Some(10)));
        assert_eq!(last_version_ids(&[]), (None, None));
    }
}
