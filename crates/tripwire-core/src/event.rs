//! Attack event model shared by the sensor, the ingest pump and the API.
//!
//! The JSON shape is the on-disk event log format: one object per line with
//! the keys `timestamp`, `type`, `ip`, `method`, `url`, `userAgent`,
//! `details` and `geo`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Closed set of attack kinds the classifier can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttackCategory {
    #[serde(rename = "RECONNAISSANCE_SCAN")]
    Reconnaissance,
    #[serde(rename = "SQL_INJECTION")]
    SqlInjection,
    #[serde(rename = "XSS_ATTEMPT")]
    CrossSiteScripting,
    #[serde(rename = "MALICIOUS_FILE_UPLOAD")]
    MaliciousUpload,
    #[serde(rename = "PATH_TRAVERSAL")]
    PathTraversal,
    #[serde(rename = "IDOR_ENUMERATION")]
    ObjectEnumeration,
    #[serde(rename = "DOS_ATTACK")]
    DenialOfService,
    #[serde(rename = "404_SCAN")]
    NotFound,
}

impl AttackCategory {
    /// All categories in classifier precedence order.
    pub const ALL: [AttackCategory; 8] = [
        Self::Reconnaissance,
        Self::SqlInjection,
        Self::CrossSiteScripting,
        Self::MaliciousUpload,
        Self::PathTraversal,
        Self::ObjectEnumeration,
        Self::DenialOfService,
        Self::NotFound,
    ];

    /// Wire name used in the event log and the index.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reconnaissance => "RECONNAISSANCE_SCAN",
            Self::SqlInjection => "SQL_INJECTION",
            Self::CrossSiteScripting => "XSS_ATTEMPT",
            Self::MaliciousUpload => "MALICIOUS_FILE_UPLOAD",
            Self::PathTraversal => "PATH_TRAVERSAL",
            Self::ObjectEnumeration => "IDOR_ENUMERATION",
            Self::DenialOfService => "DOS_ATTACK",
            Self::NotFound => "404_SCAN",
        }
    }
}

impl fmt::Display for AttackCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttackCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::InvalidField {
                field: "type",
                reason: format!("unknown attack category '{}'", s),
            })
    }
}

/// Latitude/longitude pair, serialized in the geo-point object form.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Best-effort location of the client address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: String,
    pub city: String,
    pub ll: GeoPoint,
}

impl GeoInfo {
    /// Placeholder used when the lookup misses.
    pub fn unknown() -> Self {
        Self {
            country: "Unknown".to_string(),
            city: "Unknown".to_string(),
            ll: GeoPoint::default(),
        }
    }
}

impl Default for GeoInfo {
    fn default() -> Self {
        Self::unknown()
    }
}

/// One classified request, exactly as written to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttackEvent {
    #[serde(with = "millis_rfc3339")]
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "type")]
    pub category: AttackCategory,

    /// Normalized client address.
    #[serde(rename = "ip")]
    pub source_ip: String,

    pub method: String,

    /// Request path including the query string.
    #[serde(rename = "url")]
    pub path: String,

    pub user_agent: String,

    pub details: String,

    #[serde(default)]
    pub geo: GeoInfo,
}

impl AttackEvent {
    /// Serialize to a single log line, without the trailing newline.
    pub fn to_line(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one log line.
    pub fn from_line(line: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(line)?)
    }
}

/// RFC 3339 timestamps truncated to milliseconds with a `Z` suffix.
mod millis_rfc3339 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> AttackEvent {
        AttackEvent {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            category: AttackCategory::SqlInjection,
            source_ip: "203.0.113.9".to_string(),
            method: "POST".to_string(),
            path: "/login".to_string(),
            user_agent: "curl/8.0".to_string(),
            details: "Username: ' OR 1=1 --".to_string(),
            geo: GeoInfo::unknown(),
        }
    }

    #[test]
    fn test_wire_format_keys() {
        let line = sample().to_line().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["type"], "SQL_INJECTION");
        assert_eq!(value["ip"], "203.0.113.9");
        assert_eq!(value["url"], "/login");
        assert_eq!(value["userAgent"], "curl/8.0");
        assert_eq!(value["timestamp"], "2024-05-01T12:30:00.000Z");
        assert_eq!(value["geo"]["country"], "Unknown");
        assert_eq!(value["geo"]["ll"]["lat"], 0.0);
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_line_parses_back() {
        let event = sample();
        let parsed = AttackEvent::from_line(event.to_line().unwrap().as_bytes()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_missing_geo_defaults_to_unknown() {
        let line = r#"{"timestamp":"2024-05-01T12:30:00.000Z","type":"404_SCAN","ip":"::1","method":"GET","url":"/nope","userAgent":"Unknown","details":"Path: /nope"}"#;
        let event = AttackEvent::from_line(line.as_bytes()).unwrap();
        assert_eq!(event.category, AttackCategory::NotFound);
        assert_eq!(event.geo, GeoInfo::unknown());
    }

    #[test]
    fn test_newlines_in_untrusted_text_stay_escaped() {
        let mut event = sample();
        event.user_agent = "evil\nagent".to_string();
        let line = event.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains("evil\\nagent"));
    }

    #[test]
    fn test_category_round_trips_through_wire_name() {
        for category in AttackCategory::ALL {
            assert_eq!(category.as_str().parse::<AttackCategory>().unwrap(), category);
        }
        assert!("NOT_A_THING".parse::<AttackCategory>().is_err());
    }
}
