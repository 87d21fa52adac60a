// Copyright (c) 2026 Vigil Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Selector Addressing
//!
//! Bus topics are hierarchical, dot-separated paths such as
//! `v3.report.vulnerability`. At deployment time every selector used for
//! inter-agent traffic is suffixed with the scan's [`ScanScope`] segment, so
//! that concurrent scans sharing one bus never see each other's messages:
//!
//! ```text
//! v3.asset.ip.v4.3f0c8a5e-5d7b-4a8e-9a51-0c1f6f3f8b11
//! └─────┬──────┘ └────────────────┬─────────────────┘
//!     path                    scan scope
//! ```
//!
//! Subscriptions are expressed as [`SelectorPattern`]s: an exact path, or a
//! path followed by a trailing `*` meaning "one or more remaining segments".
//! Scope is never covered by the wildcard; a pattern only matches selectors
//! carrying exactly the same scope (or both unscoped).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub const SEGMENT_SEPARATOR: char = '.';
pub const WILDCARD: &str = "*";

/// Selectors reserved by the orchestration core.
pub mod well_known {
    pub const ASSET_ROOT: &str = "v3.asset";
    pub const ASSET_IP_V4: &str = "v3.asset.ip.v4";
    pub const ASSET_IP_V6: &str = "v3.asset.ip.v6";
    pub const ASSET_LINK: &str = "v3.asset.link";
    pub const ASSET_STORE_ANDROID: &str = "v3.asset.store.android";
    pub const ASSET_STORE_IOS: &str = "v3.asset.store.ios";
    pub const ASSET_FILE_ANDROID: &str = "v3.asset.file.android";
    pub const ASSET_FILE_IOS: &str = "v3.asset.file.ios";

    pub const REPORT_ROOT: &str = "v3.report";
    pub const REPORT_VULNERABILITY: &str = "v3.report.vulnerability";
    pub const REPORT_STATUS: &str = "v3.report.status";
    pub const REPORT_FAULT: &str = "v3.report.fault";
    pub const REPORT_ASSET_COMPLETED: &str = "v3.report.completion.asset";
    pub const REPORT_AGENT_COMPLETED: &str = "v3.report.completion.agent";

    pub const CONTROL_CANCEL: &str = "v3.control.cancel";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("Selector cannot be empty")]
    Empty,

    #[error("Selector '{0}' contains an empty segment")]
    EmptySegment(String),

    #[error("Wildcard is only allowed as the last path segment: '{0}'")]
    MisplacedWildcard(String),

    #[error("Selector '{0}' must not contain a wildcard")]
    UnexpectedWildcard(String),

    #[error("Selector '{0}' is already scoped to a scan")]
    AlreadyScoped(String),
}

/// Scan-scoped namespace segment appended to every selector of one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScanScope(Uuid);

impl ScanScope {
    /// Random v4 UUID; `uuid` draws it from the OS CSPRNG through `getrandom`.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ScanScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ScanScope {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Concrete bus address. Case-sensitive, non-empty segments, no wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Selector {
    path: String,
    scope: Option<ScanScope>,
}

impl Selector {
    /// Parse a selector. A trailing UUID segment is read back as the scan scope.
    pub fn parse(raw: &str) -> Result<Self, SelectorError> {
        let (segments, scope) = split_scope(raw)?;
        if segments.iter().any(|s| *s == WILDCARD) {
            return Err(SelectorError::UnexpectedWildcard(raw.to_string()));
        }
        Ok(Self {
            path: segments.join("."),
            scope,
        })
    }

    /// Attach `scope`, replacing any scope already present.
    pub fn with_scope(mut self, scope: ScanScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn scope(&self) -> Option<ScanScope> {
        self.scope
    }

    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split(SEGMENT_SEPARATOR)
    }

    /// The same path without its scan scope.
    pub fn unscoped(&self) -> Selector {
        Selector {
            path: self.path.clone(),
            scope: None,
        }
    }

    /// True when `prefix` is this selector's path or one of its ancestors.
    pub fn starts_with_path(&self, prefix: &str) -> bool {
        self.path == prefix
            || (self.path.starts_with(prefix)
                && self.path[prefix.len()..].starts_with(SEGMENT_SEPARATOR))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Some(scope) => write!(f, "{}.{}", self.path, scope),
            None => f.write_str(&self.path),
        }
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Selector {
    type Error = SelectorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Selector> for String {
    fn from(selector: Selector) -> Self {
        selector.to_string()
    }
}

/// Subscription pattern: exact path or path prefix followed by `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SelectorPattern {
    prefix: Vec<String>,
    wildcard: bool,
    scope: Option<ScanScope>,
}

impl SelectorPattern {
    pub fn parse(raw: &str) -> Result<Self, SelectorError> {
        let (mut segments, scope) = split_scope(raw)?;
        let wildcard = segments.last() == Some(&WILDCARD);
        if wildcard {
            segments.pop();
        }
        if segments.iter().any(|s| *s == WILDCARD) {
            return Err(SelectorError::MisplacedWildcard(raw.to_string()));
        }
        Ok(Self {
            prefix: segments.into_iter().map(str::to_string).collect(),
            wildcard,
            scope,
        })
    }

    /// Pattern matching exactly `selector`.
    pub fn exact(selector: &Selector) -> Self {
        Self {
            prefix: selector.segments().map(str::to_string).collect(),
            wildcard: false,
            scope: selector.scope(),
        }
    }

    pub fn with_scope(mut self, scope: ScanScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn scope(&self) -> Option<ScanScope> {
        self.scope
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    pub fn matches(&self, selector: &Selector) -> bool {
        matches(self, selector)
    }

    /// Redis-style glob equivalent of this pattern (`*` spans dots there).
    pub fn to_glob(&self) -> String {
        let mut glob = self
            .prefix
            .iter()
            .map(|s| escape_glob(s))
            .collect::<Vec<_>>()
            .join(".");
        if self.wildcard {
            if !glob.is_empty() {
                glob.push(SEGMENT_SEPARATOR);
            }
            glob.push('*');
        }
        if let Some(scope) = self.scope {
            glob.push(SEGMENT_SEPARATOR);
            glob.push_str(&scope.to_string());
        }
        glob
    }
}

impl fmt::Display for SelectorPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut segments: Vec<String> = self.prefix.clone();
        if self.wildcard {
            segments.push(WILDCARD.to_string());
        }
        if let Some(scope) = self.scope {
            segments.push(scope.to_string());
        }
        f.write_str(&segments.join("."))
    }
}

impl FromStr for SelectorPattern {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SelectorPattern {
    type Error = SelectorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SelectorPattern> for String {
    fn from(pattern: SelectorPattern) -> Self {
        pattern.to_string()
    }
}

/// Deterministically append `scope` to `base_path`.
pub fn build(base_path: &str, scope: ScanScope) -> Result<Selector, SelectorError> {
    let base = Selector::parse(base_path)?;
    if base.is_scoped() {
        return Err(SelectorError::AlreadyScoped(base_path.to_string()));
    }
    Ok(base.with_scope(scope))
}

/// Exact segment match, or prefix match when the pattern ends in `*`.
pub fn matches(pattern: &SelectorPattern, selector: &Selector) -> bool {
    if pattern.scope != selector.scope {
        return false;
    }
    let segments: Vec<&str> = selector.segments().collect();
    if pattern.wildcard {
        segments.len() > pattern.prefix.len()
            && pattern
                .prefix
                .iter()
                .zip(segments.iter())
                .all(|(p, s)| p == s)
    } else {
        segments.len() == pattern.prefix.len()
            && pattern
                .prefix
                .iter()
                .zip(segments.iter())
                .all(|(p, s)| p == s)
    }
}

fn split_scope(raw: &str) -> Result<(Vec<&str>, Option<ScanScope>), SelectorError> {
    if raw.is_empty() {
        return Err(SelectorError::Empty);
    }
    let mut segments: Vec<&str> = raw.split(SEGMENT_SEPARATOR).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(SelectorError::EmptySegment(raw.to_string()));
    }
    let scope = match segments.last() {
        Some(last) if segments.len() > 1 => Uuid::parse_str(last).ok().map(ScanScope::from_uuid),
        _ => None,
    };
    if scope.is_some() {
        segments.pop();
    }
    Ok((segments, scope))
}

fn escape_glob(segment: &str) -> String {
    let mut escaped = String::with_capacity(segment.len());
    for ch in segment.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_appends_scope_segment() {
        let scope = ScanScope::generate();
        let selector = build("v3.report.vulnerability", scope).unwrap();

        assert_eq!(selector.path(), "v3.report.vulnerability");
        assert_eq!(selector.scope(), Some(scope));
        assert_eq!(
            selector.to_string(),
            format!("v3.report.vulnerability.{}", scope)
        );
        assert_eq!(Selector::parse(&selector.to_string()).unwrap(), selector);
    }

    #[test]
    fn test_build_is_unique_per_scope() {
        let a = build("v3.asset.ip.v4", ScanScope::generate()).unwrap();
        let b = build("v3.asset.ip.v4", ScanScope::generate()).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_build_rejects_scoped_base() {
        let scoped = build("v3.asset", ScanScope::generate()).unwrap().to_string();
        assert!(matches!(
            build(&scoped, ScanScope::generate()),
            Err(SelectorError::AlreadyScoped(_))
        ));
    }

    #[test]
    fn test_invalid_selectors() {
        assert_eq!(Selector::parse(""), Err(SelectorError::Empty));
        assert!(matches!(
            Selector::parse("v3..asset"),
            Err(SelectorError::EmptySegment(_))
        ));
        assert!(matches!(
            Selector::parse("v3.asset.*"),
            Err(SelectorError::UnexpectedWildcard(_))
        ));
        assert!(matches!(
            SelectorPattern::parse("v3.*.asset"),
            Err(SelectorError::MisplacedWildcard(_))
        ));
    }

    #[test]
    fn test_wildcard_matches_subtree_only() {
        let scope = ScanScope::generate();
        let pattern = SelectorPattern::parse("v3.asset.*").unwrap().with_scope(scope);

        assert!(matches(&pattern, &build("v3.asset.ip", scope).unwrap()));
        assert!(matches(&pattern, &build("v3.asset.ip.v4", scope).unwrap()));
        assert!(!matches(&pattern, &build("v3.asset", scope).unwrap()));
        assert!(!matches(&pattern, &build("v3.assets.ip", scope).unwrap()));
        assert!(!matches(&pattern, &build("v3.report.asset", scope).unwrap()));
    }

    #[test]
    fn test_exact_pattern_is_case_sensitive() {
        let pattern = SelectorPattern::parse("v3.asset.link").unwrap();
        assert!(matches(&pattern, &Selector::parse("v3.asset.link").unwrap()));
        assert!(!matches(&pattern, &Selector::parse("v3.asset.Link").unwrap()));
        assert!(!matches(&pattern, &Selector::parse("v3.asset.link.extra").unwrap()));
    }

    #[test]
    fn test_scopes_isolate_scans() {
        let scan_a = ScanScope::generate();
        let scan_b = ScanScope::generate();
        let pattern = SelectorPattern::parse("v3.*").unwrap().with_scope(scan_b);

        assert!(!matches(&pattern, &build("v3.asset.link", scan_a).unwrap()));
        assert!(!matches(&pattern, &Selector::parse("v3.asset.link").unwrap()));
        assert!(matches(&pattern, &build("v3.asset.link", scan_b).unwrap()));
    }

    #[test]
    fn test_pattern_display_and_glob() {
        let scope = ScanScope::generate();
        let pattern = SelectorPattern::parse("v3.report.*").unwrap().with_scope(scope);

        assert_eq!(pattern.to_string(), format!("v3.report.*.{}", scope));
        assert_eq!(pattern.to_glob(), format!("v3.report.*.{}", scope));
        assert_eq!(SelectorPattern::parse(&pattern.to_string()).unwrap(), pattern);
        assert_eq!(SelectorPattern::parse("a[1]").unwrap().to_glob(), "a\\[1\\]");
    }

    #[test]
    fn test_starts_with_path() {
        let selector = Selector::parse("v3.report.completion.agent").unwrap();
        assert!(selector.starts_with_path("v3.report"));
        assert!(selector.starts_with_path("v3.report.completion.agent"));
        assert!(!selector.starts_with_path("v3.rep"));
    }
}
