//! Access rule record and its field types
//!
//! An [`AccessRule`] binds a path pattern, for one user and one snap app,
//! to an outcome for a set of permissions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{AccessRuleError, RuleResult};

use super::pattern::validate_path_pattern;

/// Whether a matching request is allowed or denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Allow the request
    Allow,
    /// Deny the request
    Deny,
}

impl Outcome {
    /// Returns true for [`Outcome::Allow`]
    pub fn is_allow(self) -> bool {
        matches!(self, Outcome::Allow)
    }

    /// Wire name of the outcome
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Allow => "allow",
            Outcome::Deny => "deny",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = AccessRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Outcome::Allow),
            "deny" => Ok(Outcome::Deny),
            _ => Err(AccessRuleError::InvalidOutcome),
        }
    }
}

/// How long a rule remains valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifespan {
    /// Never expires
    Forever,
    /// Valid until the user session ends
    Session,
    /// Valid for a single request
    Single,
    /// Valid until the rule's expiration
    Timespan,
}

impl Lifespan {
    /// Wire name of the lifespan
    pub fn as_str(self) -> &'static str {
        match self {
            Lifespan::Forever => "forever",
            Lifespan::Session => "session",
            Lifespan::Single => "single",
            Lifespan::Timespan => "timespan",
        }
    }

    /// Check that `duration` fits this lifespan and compute the expiration.
    ///
    /// A timespan lifespan needs a positive duration (`"30s"`, `"1h30m"`,
    /// `"1.5h"`...) and yields `now + duration`. Every other lifespan needs an
    /// empty duration and yields no expiration.
    pub fn parse_duration(self, duration: &str, now: DateTime<Utc>) -> RuleResult<Option<DateTime<Utc>>> {
        match self {
            Lifespan::Forever | Lifespan::Session | Lifespan::Single => {
                if !duration.is_empty() {
                    return Err(AccessRuleError::invalid_duration(format!(
                        "cannot have specified duration when lifespan is {:?}: {:?}",
                        self.as_str(),
                        duration
                    )));
                }
                Ok(None)
            }
            Lifespan::Timespan => {
                if duration.is_empty() {
                    return Err(AccessRuleError::invalid_duration(
                        "cannot have unspecified duration when lifespan is \"timespan\"",
                    ));
                }
                let parsed = parse_go_duration(duration)?;
                if parsed <= Duration::zero() {
                    return Err(AccessRuleError::invalid_duration(format!(
                        "cannot have zero or negative duration: {:?}",
                        duration
                    )));
                }
                now.checked_add_signed(parsed).map(Some).ok_or_else(|| {
                    AccessRuleError::invalid_duration(format!("duration out of range: {:?}", duration))
                })
            }
        }
    }

    /// Check that `expiration` is valid for this lifespan at time `now`
    pub fn validate_expiration(self, expiration: Option<DateTime<Utc>>, now: DateTime<Utc>) -> RuleResult<()> {
        match (self, expiration) {
            (Lifespan::Timespan, None) => Err(AccessRuleError::invalid_duration(
                "cannot have unspecified expiration when lifespan is \"timespan\"",
            )),
            (Lifespan::Timespan, Some(expiration)) if expiration < now => Err(
                AccessRuleError::invalid_duration(format!("cannot have expiration time in the past: {}", expiration)),
            ),
            (Lifespan::Timespan, Some(_)) => Ok(()),
            (_, Some(expiration)) => Err(AccessRuleError::invalid_duration(format!(
                "cannot have specified expiration when lifespan is {:?}: {}",
                self.as_str(),
                expiration
            ))),
            (_, None) => Ok(()),
        }
    }
}

impl fmt::Display for Lifespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lifespan {
    type Err = AccessRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forever" => Ok(Lifespan::Forever),
            "session" => Ok(Lifespan::Session),
            "single" => Ok(Lifespan::Single),
            "timespan" => Ok(Lifespan::Timespan),
            _ => Err(AccessRuleError::InvalidLifespan),
        }
    }
}

macro_rules! permissions {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// A category of filesystem operation
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum Permission {
            $(
                #[serde(rename = $name)]
                $variant,
            )+
        }

        impl Permission {
            /// Every known permission
            pub const ALL: &'static [Permission] = &[$(Permission::$variant),+];

            /// Wire name of the permission
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Permission::$variant => $name,)+
                }
            }
        }

        impl FromStr for Permission {
            type Err = AccessRuleError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Permission::$variant),)+
                    other => Err(AccessRuleError::InvalidPermission(other.to_string())),
                }
            }
        }
    };
}

permissions! {
    Execute => "execute",
    Write => "write",
    Read => "read",
    Append => "append",
    Create => "create",
    Delete => "delete",
    Open => "open",
    Rename => "rename",
    SetAttr => "set-attr",
    GetAttr => "get-attr",
    SetCred => "set-cred",
    GetCred => "get-cred",
    ChangeMode => "change-mode",
    ChangeOwner => "change-owner",
    ChangeGroup => "change-group",
    Lock => "lock",
    ExecuteMap => "execute-map",
    Link => "link",
    ChangeProfile => "change-profile",
    ChangeProfileOnExec => "change-profile-on-exec",
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true if `list` contains `permission`
pub fn permissions_contain(list: &[Permission], permission: Permission) -> bool {
    list.iter().any(|p| *p == permission)
}

/// Drop repeated permissions, keeping first occurrences in order
pub fn dedup_permissions(list: &[Permission]) -> Vec<Permission> {
    let mut unique = Vec::with_capacity(list.len());
    for permission in list {
        if !permissions_contain(&unique, *permission) {
            unique.push(*permission);
        }
    }
    unique
}

/// The persisted unit of prompting policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    /// Unique rule ID
    pub id: String,
    /// RFC3339 creation/modification time, also the conflict tie-break key
    pub timestamp: String,
    /// User the rule applies to
    pub user: u32,
    /// Snap the rule applies to
    pub snap: String,
    /// App within the snap
    pub app: String,
    /// Validated path glob
    #[serde(rename = "path-pattern")]
    pub path_pattern: String,
    /// Outcome for matching requests
    pub outcome: Outcome,
    /// How long the rule is valid
    pub lifespan: Lifespan,
    /// Set iff the lifespan is a timespan
    #[serde(default, with = "expiration_format")]
    pub expiration: Option<DateTime<Utc>>,
    /// Permissions covered by the rule
    pub permissions: Vec<Permission>,
}

impl AccessRule {
    /// Remove `permission` from the rule's permission list.
    ///
    /// Returns `PermissionsEmpty` when the list is (or becomes) empty, so the
    /// caller knows the rule should be discarded.
    pub fn remove_permission(&mut self, permission: Permission) -> RuleResult<()> {
        if self.permissions.is_empty() {
            return Err(AccessRuleError::PermissionsEmpty);
        }
        let Some(pos) = self.permissions.iter().position(|p| *p == permission) else {
            return Err(AccessRuleError::PermissionNotFound);
        };
        self.permissions.remove(pos);
        if self.permissions.is_empty() {
            return Err(AccessRuleError::PermissionsEmpty);
        }
        Ok(())
    }

    /// Check if the rule covers `permission`
    pub fn has_permission(&self, permission: Permission) -> bool {
        permissions_contain(&self.permissions, permission)
    }

    /// Whether a timespan rule has run past its expiration
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lifespan == Lifespan::Timespan && self.expiration.is_some_and(|exp| exp < now)
    }

    /// Validate a rule read back from storage
    pub fn validate(&self, now: DateTime<Utc>) -> RuleResult<()> {
        validate_path_pattern(&self.path_pattern)?;
        if self.permissions.is_empty() {
            return Err(AccessRuleError::PermissionsEmpty);
        }
        self.lifespan.validate_expiration(self.expiration, now)
    }
}

/// Current time as an RFC3339 timestamp with nanoseconds
pub fn current_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a Go-style duration string such as `"300ms"`, `"1.5h"` or `"2h45m"`
pub fn parse_go_duration(input: &str) -> RuleResult<Duration> {
    let invalid = || AccessRuleError::invalid_duration(format!("cannot parse duration {:?}", input));

    let (negative, mut rest) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input.strip_prefix('+').unwrap_or(input)),
    };
    if rest == "0" {
        return Ok(Duration::zero());
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: i128 = 0;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_end);
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);

        let scale: i128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => return Err(invalid()),
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
            return Err(invalid());
        }
        let whole: i128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut value = whole.checked_mul(scale).ok_or_else(invalid)?;
        let mut digit_scale = scale;
        for digit in fraction.bytes() {
            digit_scale /= 10;
            value += i128::from(digit - b'0') * digit_scale;
        }
        total = total.checked_add(value).ok_or_else(invalid)?;
        rest = tail;
    }

    let nanos = i64::try_from(if negative { -total } else { total }).map_err(|_| invalid())?;
    Ok(Duration::nanoseconds(nanos))
}

/// Expiration is stored as an RFC3339 string, empty when unset
mod expiration_format {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(expiration) => serializer.serialize_str(&expiration.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rule() -> AccessRule {
        AccessRule {
            id: "rule-1".into(),
            timestamp: current_timestamp(),
            user: 1000,
            snap: "firefox".into(),
            app: "firefox".into(),
            path_pattern: "/home/test/Downloads/**".into(),
            outcome: Outcome::Allow,
            lifespan: Lifespan::Forever,
            expiration: None,
            permissions: vec![Permission::Read, Permission::Write],
        }
    }

    #[test]
    fn test_outcome_parse() {
        assert_eq!("allow".parse::<Outcome>().unwrap(), Outcome::Allow);
        assert!(!Outcome::Deny.is_allow());
        assert!(matches!("maybe".parse::<Outcome>(), Err(AccessRuleError::InvalidOutcome)));
        assert!(matches!("".parse::<Outcome>(), Err(AccessRuleError::InvalidOutcome)));
    }

    #[test]
    fn test_lifespan_parse() {
        assert_eq!("timespan".parse::<Lifespan>().unwrap(), Lifespan::Timespan);
        assert!(matches!("weekly".parse::<Lifespan>(), Err(AccessRuleError::InvalidLifespan)));
    }

    #[test]
    fn test_permission_wire_names() {
        assert_eq!(Permission::SetAttr.to_string(), "set-attr");
        assert_eq!(
            "change-profile-on-exec".parse::<Permission>().unwrap(),
            Permission::ChangeProfileOnExec
        );
        assert_eq!(Permission::ALL.len(), 20);
        assert!(matches!(
            "fly".parse::<Permission>(),
            Err(AccessRuleError::InvalidPermission(_))
        ));
    }

    #[test]
    fn test_go_durations() {
        assert_eq!(parse_go_duration("30s").unwrap(), Duration::seconds(30));
        assert_eq!(parse_go_duration("1h30m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_go_duration("1.5h").unwrap(), Duration::minutes(90));
        assert_eq!(parse_go_duration("500ms").unwrap(), Duration::milliseconds(500));
        assert_eq!(parse_go_duration("-2m").unwrap(), Duration::minutes(-2));
        assert_eq!(parse_go_duration("0").unwrap(), Duration::zero());
        assert!(parse_go_duration("").is_err());
        assert!(parse_go_duration("10").is_err());
        assert!(parse_go_duration("3 days").is_err());
        assert!(parse_go_duration("1..5h").is_err());
    }

    #[test]
    fn test_parse_duration_by_lifespan() {
        let now = Utc::now();
        assert_eq!(Lifespan::Forever.parse_duration("", now).unwrap(), None);
        assert!(Lifespan::Session.parse_duration("10s", now).is_err());

        let expiration = Lifespan::Timespan.parse_duration("10m", now).unwrap();
        assert_eq!(expiration, Some(now + Duration::minutes(10)));

        assert!(Lifespan::Timespan.parse_duration("", now).is_err());
        assert!(Lifespan::Timespan.parse_duration("0s", now).is_err());
        assert!(Lifespan::Timespan.parse_duration("-5s", now).is_err());
    }

    #[test]
    fn test_validate_expiration() {
        let now = Utc::now();
        let past = now - Duration::hours(1);
        let future = now + Duration::hours(1);

        assert!(Lifespan::Timespan.validate_expiration(Some(future), now).is_ok());
        assert!(Lifespan::Timespan.validate_expiration(Some(past), now).is_err());
        assert!(Lifespan::Timespan.validate_expiration(None, now).is_err());
        assert!(Lifespan::Forever.validate_expiration(Some(future), now).is_err());
        assert!(Lifespan::Single.validate_expiration(None, now).is_ok());
    }

    #[test]
    fn test_remove_permission() {
        let mut rule = sample_rule();
        assert!(matches!(
            rule.remove_permission(Permission::Execute),
            Err(AccessRuleError::PermissionNotFound)
        ));
        rule.remove_permission(Permission::Read).unwrap();
        assert_eq!(rule.permissions, vec![Permission::Write]);
        assert!(matches!(
            rule.remove_permission(Permission::Write),
            Err(AccessRuleError::PermissionsEmpty)
        ));
        assert!(rule.permissions.is_empty());
        assert!(matches!(
            rule.remove_permission(Permission::Write),
            Err(AccessRuleError::PermissionsEmpty)
        ));
    }

    #[test]
    fn test_dedup_permissions() {
        let perms = dedup_permissions(&[Permission::Read, Permission::Write, Permission::Read]);
        assert_eq!(perms, vec![Permission::Read, Permission::Write]);
    }

    #[test]
    fn test_rule_json_shape() {
        let rule = sample_rule();
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["path-pattern"], "/home/test/Downloads/**");
        assert_eq!(json["outcome"], "allow");
        assert_eq!(json["lifespan"], "forever");
        assert_eq!(json["expiration"], "");
        assert_eq!(json["permissions"], serde_json::json!(["read", "write"]));

        let back: AccessRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn test_expiration_round_trip() {
        let mut rule = sample_rule();
        rule.lifespan = Lifespan::Timespan;
        rule.expiration = Lifespan::Timespan.parse_duration("1h", Utc::now()).unwrap();

        let text = serde_json::to_string(&rule).unwrap();
        let back: AccessRule = serde_json::from_str(&text).unwrap();
        assert_eq!(back.expiration, rule.expiration);
    }

    #[test]
    fn test_validate_rule() {
        let now = Utc::now();
        let mut rule = sample_rule();
        assert!(rule.validate(now).is_ok());
        assert!(!rule.is_expired(now));

        rule.path_pattern = "relative/path".into();
        assert!(matches!(rule.validate(now), Err(AccessRuleError::InvalidPathPattern(_))));

        let mut rule = sample_rule();
        rule.permissions.clear();
        assert!(matches!(rule.validate(now), Err(AccessRuleError::PermissionsEmpty)));

        let mut rule = sample_rule();
        rule.lifespan = Lifespan::Timespan;
        rule.expiration = Some(now - Duration::seconds(1));
        assert!(rule.is_expired(now));
        assert!(rule.validate(now).is_err());
    }
}
