//! Device firmware / protocol version parsing and gating.
//!
//! Analyzers report their firmware as `LOGIC_ANALYZER_V<major>_<minor>` (any
//! underscore-separated board prefix is accepted before the `V`), while network
//! APIs tend to report plain `<major>.<minor>`. Anything else parses as an
//! invalid version, which orders below every valid version and never satisfies
//! a minimum-version check.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

/// Lowest firmware version the binary-protocol drivers will talk to.
pub const MINIMUM_MAJOR_VERSION: u32 = 6;
/// Minor component of [`MINIMUM_MAJOR_VERSION`].
pub const MINIMUM_MINOR_VERSION: u32 = 5;

/// A parsed device version.
///
/// Equality and ordering use `(is_valid, major, minor)`; the raw string is
/// carried for diagnostics only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceVersion {
    pub major: u32,
    pub minor: u32,
    pub is_valid: bool,
    raw: String,
}

impl DeviceVersion {
    /// Build a valid version from components.
    pub fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            is_valid: true,
            raw: format!("{}.{}", major, minor),
        }
    }

    /// The invalid version, remembering what was rejected.
    pub fn invalid(raw: impl Into<String>) -> Self {
        Self {
            major: 0,
            minor: 0,
            is_valid: false,
            raw: raw.into(),
        }
    }

    /// The string this version was parsed from.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    fn key(&self) -> (bool, u32, u32) {
        (self.is_valid, self.major, self.minor)
    }
}

impl PartialEq for DeviceVersion {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for DeviceVersion {}

impl PartialOrd for DeviceVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeviceVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for DeviceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "invalid")
        }
    }
}

#[allow(clippy::expect_used)]
static UNDERSCORE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:[A-Z0-9]+_)*V(\d+)_(\d+)$").expect("Invalid version regex")
});

#[allow(clippy::expect_used)]
static DOTTED_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)$").expect("Invalid version regex"));

/// Stateless version parsing and comparison.
pub struct VersionValidator;

impl VersionValidator {
    /// Parse a version string reported by a device.
    ///
    /// `None`, empty and whitespace-only input all yield an invalid version.
    pub fn parse(raw: Option<&str>) -> DeviceVersion {
        let Some(raw) = raw else {
            return DeviceVersion::invalid("");
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return DeviceVersion::invalid(raw);
        }

        let captures = UNDERSCORE_PATTERN
            .captures(trimmed)
            .or_else(|| DOTTED_PATTERN.captures(trimmed));

        let parsed = captures.and_then(|caps| {
            let major = caps.get(1)?.as_str().parse::<u32>().ok()?;
            let minor = caps.get(2)?.as_str().parse::<u32>().ok()?;
            Some((major, minor))
        });

        match parsed {
            Some((major, minor)) => DeviceVersion {
                major,
                minor,
                is_valid: true,
                raw: trimmed.to_string(),
            },
            None => DeviceVersion::invalid(raw),
        }
    }

    /// Order two versions; invalid versions sort below all valid ones.
    pub fn compare(a: &DeviceVersion, b: &DeviceVersion) -> Ordering {
        a.cmp(b)
    }

    /// The minimum firmware version accepted by the binary-protocol drivers.
    pub fn minimum_supported() -> DeviceVersion {
        DeviceVersion::new(MINIMUM_MAJOR_VERSION, MINIMUM_MINOR_VERSION)
    }

    /// True iff `raw` parses to a valid version at or above the minimum.
    pub fn is_supported(raw: Option<&str>) -> bool {
        Self::meets_minimum(&Self::parse(raw), &Self::minimum_supported())
    }

    /// True iff `version` is valid and not below `minimum`.
    pub fn meets_minimum(version: &DeviceVersion, minimum: &DeviceVersion) -> bool {
        version.is_valid && Self::compare(version, minimum) != Ordering::Less
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_underscore_format() {
        let v = VersionValidator::parse(Some("LOGIC_ANALYZER_V6_5"));
        assert!(v.is_valid);
        assert_eq!((v.major, v.minor), (6, 5));

        let v = VersionValidator::parse(Some("V1_7"));
        assert_eq!((v.major, v.minor), (1, 7));

        let v = VersionValidator::parse(Some("logic_analyzer_v12_0"));
        assert!(v.is_valid);
        assert_eq!((v.major, v.minor), (12, 0));
    }

    #[test]
    fn test_parse_dotted_format() {
        let v = VersionValidator::parse(Some("2.14"));
        assert!(v.is_valid);
        assert_eq!((v.major, v.minor), (2, 14));
    }

    #[test]
    fn test_parse_round_trips_components() {
        for major in [0u32, 1, 6, 42, 1000] {
            for minor in [0u32, 3, 99] {
                let underscored = format!("V{}_{}", major, minor);
                let dotted = format!("{}.{}", major, minor);
                for input in [underscored, dotted] {
                    let v = VersionValidator::parse(Some(&input));
                    assert!(v.is_valid, "{} should parse", input);
                    assert_eq!((v.major, v.minor), (major, minor));
                }
            }
        }
    }

    #[test]
    fn test_parse_invalid_inputs() {
        for input in [None, Some(""), Some("   "), Some("abc"), Some("1."), Some(".1")] {
            let v = VersionValidator::parse(input);
            assert!(!v.is_valid, "{:?} should be invalid", input);
            assert_eq!((v.major, v.minor), (0, 0));
        }
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        for input in ["v2.0.1", "2.0.1", "v2.0", "V2_0_1", "V2.0"] {
            let v = VersionValidator::parse(Some(input));
            assert!(!v.is_valid, "{} should be invalid", input);
        }
        assert!(!VersionValidator::is_supported(Some("v2.0.1")));
    }

    #[test]
    fn test_invalid_keeps_raw_text() {
        let v = VersionValidator::parse(Some(" garbage "));
        assert!(!v.is_valid);
        assert_eq!(v.raw, " garbage ");
    }

    #[test]
    fn test_compare_ordering() {
        let old = VersionValidator::parse(Some("V1_7"));
        let new = VersionValidator::parse(Some("V2_0"));
        assert_eq!(VersionValidator::compare(&old, &new), Ordering::Less);
        assert_eq!(VersionValidator::compare(&new, &old), Ordering::Greater);
        assert_eq!(VersionValidator::compare(&old, &old), Ordering::Equal);
    }

    #[test]
    fn test_invalid_is_lowest_and_not_equal_to_zero() {
        let invalid = VersionValidator::parse(Some("garbage"));
        let zero = VersionValidator::parse(Some("0.0"));
        assert_ne!(invalid, zero);
        assert_eq!(VersionValidator::compare(&invalid, &zero), Ordering::Less);
        assert_eq!(
            VersionValidator::compare(&invalid, &VersionValidator::parse(None)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_is_supported() {
        assert!(VersionValidator::is_supported(Some("LOGIC_ANALYZER_V6_5")));
        assert!(VersionValidator::is_supported(Some("V7_0")));
        assert!(!VersionValidator::is_supported(Some("V6_4")));
        assert!(!VersionValidator::is_supported(Some("V1_7")));
        assert!(!VersionValidator::is_supported(None));
    }
}
