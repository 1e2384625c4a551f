use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use serde::Deserialize;

use crate::error::{Error, Result};

/// A byte budget for one accounting window.
///
/// `Unbounded` compares greater than any finite budget, so taking the
/// max over a set of limits lets "no limit" dominate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteLimit {
    Bytes(u64),
    Unbounded,
}

impl Ord for ByteLimit {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ByteLimit::Unbounded, ByteLimit::Unbounded) => Ordering::Equal,
            (ByteLimit::Unbounded, _) => Ordering::Greater,
            (_, ByteLimit::Unbounded) => Ordering::Less,
            (ByteLimit::Bytes(a), ByteLimit::Bytes(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for ByteLimit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Parse a configured limit string.
///
/// The format is `<float><unit>` with unit one of K/M/G/T/P
/// (case-insensitive, powers of 1024); the byte count is truncated to
/// an integer. A missing value means unbounded. The last character is
/// always read as the unit, so a bare number is malformed.
pub fn parse_limit(value: Option<&str>) -> Result<ByteLimit> {
    let Some(value) = value else {
        return Ok(ByteLimit::Unbounded);
    };

    let mut chars = value.chars();
    let unit = chars
        .next_back()
        .ok_or_else(|| Error::MalformedLimit("empty limit value".to_string()))?;
    let magnitude = match unit.to_ascii_uppercase() {
        'K' => 1,
        'M' => 2,
        'G' => 3,
        'T' => 4,
        'P' => 5,
        _ => {
            return Err(Error::MalformedLimit(format!(
                "unknown unit '{}' in \"{}\"",
                unit, value
            )))
        }
    };

    let quantity: f64 = chars.as_str().trim().parse().map_err(|_| {
        Error::MalformedLimit(format!("non-numeric quantity in \"{}\"", value))
    })?;
    if !quantity.is_finite() || quantity < 0.0 {
        return Err(Error::MalformedLimit(format!(
            "quantity out of range in \"{}\"",
            value
        )));
    }

    let bytes = (quantity * 1024f64.powi(magnitude)).trunc() as u64;
    Ok(ByteLimit::Bytes(bytes))
}

/// The caller on whose behalf a request is made, as reported by the
/// front proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub groups: BTreeSet<String>,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: BTreeSet::new(),
        }
    }

    pub fn with_groups<I, S>(name: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }
}

/// Wire shape of the limits document:
/// `{"system": "...", "apis": {...}, "users": {...}, "groups": {...}}`.
/// Null values mean unbounded.
#[derive(Debug, Default, Deserialize)]
struct LimitsDoc {
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    apis: HashMap<String, Option<String>>,
    #[serde(default)]
    users: HashMap<String, Option<String>>,
    #[serde(default)]
    groups: HashMap<String, Option<String>>,
}

/// Fully parsed limit configuration.
///
/// Every limit string is parsed when the document is loaded, so a
/// malformed value fails construction instead of surfacing on the
/// first throttle check. The set is immutable after load; changing
/// limits means restarting the service.
#[derive(Debug, Clone)]
pub struct LimitSet {
    system: ByteLimit,
    apis: HashMap<String, ByteLimit>,
    users: HashMap<String, ByteLimit>,
    groups: HashMap<String, ByteLimit>,
}

impl LimitSet {
    /// A set with no configured limits; every lookup is unbounded.
    pub fn empty() -> Self {
        Self {
            system: ByteLimit::Unbounded,
            apis: HashMap::new(),
            users: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    pub fn from_json(doc: &str) -> Result<Self> {
        let doc: LimitsDoc = serde_json::from_str(doc)
            .map_err(|e| Error::Config(format!("invalid limits document: {}", e)))?;

        Ok(Self {
            system: parse_entry("system", "system", doc.system.as_deref())?,
            apis: parse_table("api", doc.apis)?,
            users: parse_table("user", doc.users)?,
            groups: parse_table("group", doc.groups)?,
        })
    }

    pub fn lookup_system(&self) -> ByteLimit {
        self.system
    }

    pub fn lookup_api(&self, api: &str) -> ByteLimit {
        self.apis.get(api).copied().unwrap_or(ByteLimit::Unbounded)
    }

    /// The limit for a user: their own entry if present, otherwise the
    /// largest limit among their groups (unbounded dominating),
    /// otherwise unbounded.
    pub fn lookup_user(&self, identity: &Identity) -> ByteLimit {
        if let Some(limit) = self.users.get(&identity.name) {
            return *limit;
        }
        identity
            .groups
            .iter()
            .filter_map(|group| self.groups.get(group).copied())
            .max()
            .unwrap_or(ByteLimit::Unbounded)
    }
}

fn parse_entry(kind: &str, name: &str, raw: Option<&str>) -> Result<ByteLimit> {
    parse_limit(raw).map_err(|_| {
        Error::MalformedLimit(format!(
            "{} '{}' has bad value \"{}\"",
            kind,
            name,
            raw.unwrap_or("")
        ))
    })
}

fn parse_table(
    kind: &str,
    table: HashMap<String, Option<String>>,
) -> Result<HashMap<String, ByteLimit>> {
    table
        .into_iter()
        .map(|(name, raw)| {
            let limit = parse_entry(kind, &name, raw.as_deref())?;
            Ok((name, limit))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units_as_powers_of_1024() {
        assert_eq!(parse_limit(Some("1K")).unwrap(), ByteLimit::Bytes(1024));
        assert_eq!(
            parse_limit(Some("2M")).unwrap(),
            ByteLimit::Bytes(2 * 1024 * 1024)
        );
        assert_eq!(
            parse_limit(Some("10G")).unwrap(),
            ByteLimit::Bytes(10 * 1024 * 1024 * 1024)
        );
        assert_eq!(
            parse_limit(Some("1T")).unwrap(),
            ByteLimit::Bytes(1u64 << 40)
        );
        assert_eq!(
            parse_limit(Some("1P")).unwrap(),
            ByteLimit::Bytes(1u64 << 50)
        );
    }

    #[test]
    fn unit_is_case_insensitive() {
        assert_eq!(parse_limit(Some("5k")).unwrap(), ByteLimit::Bytes(5120));
        assert_eq!(parse_limit(Some("5K")).unwrap(), ByteLimit::Bytes(5120));
    }

    #[test]
    fn fractional_quantities_truncate() {
        assert_eq!(parse_limit(Some("1.5K")).unwrap(), ByteLimit::Bytes(1536));
        // 1.9 * 1024 = 1945.6
        assert_eq!(parse_limit(Some("1.9K")).unwrap(), ByteLimit::Bytes(1945));
    }

    #[test]
    fn missing_value_is_unbounded() {
        assert_eq!(parse_limit(None).unwrap(), ByteLimit::Unbounded);
    }

    #[test]
    fn malformed_values_are_rejected() {
        for bad in ["", "100", "5Q", "xK", "-1K", "infK", "K"] {
            assert!(
                matches!(parse_limit(Some(bad)), Err(Error::MalformedLimit(_))),
                "expected {:?} to be malformed",
                bad
            );
        }
    }

    #[test]
    fn unbounded_orders_above_any_byte_count() {
        assert!(ByteLimit::Unbounded > ByteLimit::Bytes(u64::MAX));
        assert!(ByteLimit::Bytes(2048) > ByteLimit::Bytes(1024));
    }

    #[test]
    fn user_entry_wins_over_groups() {
        let set = LimitSet::from_json(
            r#"{"users": {"alice": "1K"}, "groups": {"lab": "100G"}}"#,
        )
        .unwrap();
        let alice = Identity::with_groups("alice", ["lab"]);
        assert_eq!(set.lookup_user(&alice), ByteLimit::Bytes(1024));
    }

    #[test]
    fn group_lookup_takes_the_largest_limit() {
        let set = LimitSet::from_json(
            r#"{"groups": {"small": "1K", "large": "1G", "other": "1M"}}"#,
        )
        .unwrap();
        let user = Identity::with_groups("bob", ["small", "large"]);
        assert_eq!(set.lookup_user(&user), ByteLimit::Bytes(1 << 30));
    }

    #[test]
    fn unbounded_group_dominates() {
        let set = LimitSet::from_json(
            r#"{"groups": {"capped": "1K", "staff": null}}"#,
        )
        .unwrap();
        let user = Identity::with_groups("carol", ["capped", "staff"]);
        assert_eq!(set.lookup_user(&user), ByteLimit::Unbounded);
    }

    #[test]
    fn user_without_matching_groups_is_unbounded() {
        let set = LimitSet::from_json(r#"{"groups": {"lab": "1K"}}"#).unwrap();
        assert_eq!(
            set.lookup_user(&Identity::new("dave")),
            ByteLimit::Unbounded
        );
        assert_eq!(
            set.lookup_user(&Identity::with_groups("eve", ["unknown"])),
            ByteLimit::Unbounded
        );
    }

    #[test]
    fn load_fails_eagerly_on_a_malformed_entry() {
        let err = LimitSet::from_json(r#"{"users": {"alice": "5Q"}}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedLimit(_)));
        assert!(err.to_string().contains("alice"));
    }

    #[test]
    fn absent_sections_default_to_unbounded() {
        let set = LimitSet::from_json("{}").unwrap();
        assert_eq!(set.lookup_system(), ByteLimit::Unbounded);
        assert_eq!(set.lookup_api("meta"), ByteLimit::Unbounded);
    }
}
