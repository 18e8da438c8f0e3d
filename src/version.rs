//! Host version parsing and rule-set selection.
//!
//! Versions look like `2019.4.1f1`: `major.minor.patch` followed by a
//! single-letter release phase (`a`lpha < `b`eta < `f`inal < `p`atch) and a
//! prerelease number. Ordering compares the numeric tuple; equality is by
//! the exact version string.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use crate::rules::RuleSet;

/// First version that emits the structured test protocol.
pub const PROTOCOL_CUTOFF: &str = "2019.1.0a1";

/// Default number of lines scanned for a version line before giving up.
pub const DEFAULT_SCAN_LINES: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("the version {0} is invalid, it has to be in the format 2000.1.0f1")]
    Format(String),

    #[error("failed to parse {part} from version {version}")]
    Component { part: &'static str, version: String },

    #[error("unknown release phase '{phase}' in version {version}")]
    Phase { phase: char, version: String },
}

/// Release phase, in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReleasePhase {
    Alpha,
    Beta,
    Final,
    Patch,
}

impl ReleasePhase {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'a' => Some(ReleasePhase::Alpha),
            'b' => Some(ReleasePhase::Beta),
            'f' => Some(ReleasePhase::Final),
            'p' => Some(ReleasePhase::Patch),
            _ => None,
        }
    }
}

/// A parsed host version.
#[derive(Debug, Clone)]
pub struct HostVersion {
    raw: String,
    major: u32,
    minor: u32,
    patch: u32,
    phase: ReleasePhase,
    prerelease: u32,
}

impl HostVersion {
    pub fn parse(version: &str) -> Result<Self, VersionError> {
        let parts: Vec<&str> = version.split('.').collect();
        let [major, minor, rest] = parts.as_slice() else {
            return Err(VersionError::Format(version.to_string()));
        };

        if major.len() != 4 && major.len() != 1 {
            return Err(component("major version", version));
        }
        let major = major.parse().map_err(|_| component("major version", version))?;
        let minor = minor.parse().map_err(|_| component("minor version", version))?;

        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let patch = rest[..digits]
            .parse()
            .map_err(|_| component("patch version", version))?;

        let mut tail = rest[digits..].chars();
        let phase_char = tail.next().ok_or_else(|| component("release phase", version))?;
        let phase = ReleasePhase::from_char(phase_char).ok_or_else(|| VersionError::Phase {
            phase: phase_char,
            version: version.to_string(),
        })?;
        let prerelease = tail
            .as_str()
            .parse()
            .map_err(|_| component("prerelease number", version))?;

        Ok(Self {
            raw: version.to_string(),
            major,
            minor,
            patch,
            phase,
            prerelease,
        })
    }

    /// The version string exactly as parsed.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// `major.minor`, e.g. `2019.4`.
    pub fn major_minor(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }

    pub fn phase(&self) -> ReleasePhase {
        self.phase
    }

    /// Total order over (major, minor, patch, phase, prerelease).
    pub fn cmp_release(&self, other: &HostVersion) -> Ordering {
        (
            self.major,
            self.minor,
            self.patch,
            self.phase,
            self.prerelease,
        )
            .cmp(&(
                other.major,
                other.minor,
                other.patch,
                other.phase,
                other.prerelease,
            ))
    }

    /// Same release only if the version strings are identical.
    pub fn is_same_release(&self, other: &HostVersion) -> bool {
        self.raw == other.raw
    }

    /// `self >= other`, where identical strings always count as equal.
    pub fn at_least(&self, other: &HostVersion) -> bool {
        self.is_same_release(other) || self.cmp_release(other) != Ordering::Less
    }
}

impl FromStr for HostVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for HostVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn component(part: &'static str, version: &str) -> VersionError {
    VersionError::Component {
        part,
        version: version.to_string(),
    }
}

/// Rules for a detected version. Unknown versions get the modern rules.
pub fn rules_for(version: Option<&HostVersion>) -> RuleSet {
    let Some(version) = version else {
        return RuleSet::modern();
    };
    match HostVersion::parse(PROTOCOL_CUTOFF) {
        Ok(cutoff) if !version.at_least(&cutoff) => RuleSet::legacy(),
        _ => RuleSet::modern(),
    }
}

/// Outcome of the version gate.
#[derive(Debug)]
pub struct GateDecision {
    pub version: Option<HostVersion>,
    pub rules: RuleSet,
    /// Lines held while scanning, in arrival order.
    pub replay: Vec<String>,
}

/// Holds early log lines until the host version is known.
pub struct VersionGate {
    pattern: Regex,
    scan_limit: usize,
    held: Vec<String>,
}

impl VersionGate {
    pub fn new(scan_limit: usize) -> Self {
        Self {
            pattern: Regex::new(
                r"(?:Initialize engine version: |Unity Editor version:\s+|branch; Version is ')(\d+\.\d+\.\d+[abfp]\d+)",
            )
            .unwrap(),
            scan_limit,
            held: Vec::new(),
        }
    }

    /// Version named by a single line, if any.
    pub fn detect(&self, line: &str) -> Option<HostVersion> {
        let token = self.pattern.captures(line)?.get(1)?.as_str();
        match HostVersion::parse(token) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(line, error = %e, "version-like line did not parse");
                None
            }
        }
    }

    /// Offer a line. Returns the decision once a version line is found or
    /// the scan window is exhausted.
    pub fn offer(&mut self, line: String) -> Option<GateDecision> {
        let version = self.detect(&line);
        self.held.push(line);

        if version.is_some() || self.held.len() >= self.scan_limit {
            return Some(self.decide(version));
        }
        None
    }

    /// Decide with whatever has been seen (the writer is gone).
    pub fn finish(&mut self) -> GateDecision {
        self.decide(None)
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    fn decide(&mut self, version: Option<HostVersion>) -> GateDecision {
        let rules = rules_for(version.as_ref());
        match &version {
            Some(v) => info!("Detected host version {v}, using {} rules", rules.name()),
            None => info!(
                "No host version found in the first {} lines, using {} rules",
                self.held.len(),
                rules.name()
            ),
        }
        GateDecision {
            version,
            rules,
            replay: std::mem::take(&mut self.held),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(s: &str) -> HostVersion {
        HostVersion::parse(s).unwrap()
    }

    #[test]
    fn parses_components() {
        let version = v("2019.4.31f1");
        assert_eq!(version.raw(), "2019.4.31f1");
        assert_eq!(version.major_minor(), "2019.4");
        assert_eq!(version.phase(), ReleasePhase::Final);
    }

    #[test]
    fn phase_order() {
        let alpha = v("2019.1.0a12");
        let beta = v("2019.1.0b1");
        let fin = v("2019.1.0f1");
        let patch = v("2019.1.0p1");
        assert_eq!(alpha.cmp_release(&beta), Ordering::Less);
        assert_eq!(beta.cmp_release(&fin), Ordering::Less);
        assert_eq!(fin.cmp_release(&patch), Ordering::Less);
        assert!(!alpha.at_least(&beta));
        assert!(patch.at_least(&alpha));
    }

    #[test]
    fn equality_is_by_full_string() {
        assert!(v("2019.1.0f1").is_same_release(&v("2019.1.0f1")));

        let padded = v("2019.01.0f1");
        let plain = v("2019.1.0f1");
        assert_eq!(padded.cmp_release(&plain), Ordering::Equal);
        assert!(!padded.is_same_release(&plain));
    }

    #[test]
    fn numeric_fields_compare_numerically() {
        assert_eq!(v("2019.10.0f1").cmp_release(&v("2019.9.0f1")), Ordering::Greater);
        assert_eq!(v("2018.4.36f1").cmp_release(&v("2019.1.0a1")), Ordering::Less);
    }

    #[test]
    fn rejects_malformed_versions() {
        assert!(matches!(
            HostVersion::parse("2019.1"),
            Err(VersionError::Format(_))
        ));
        assert!(matches!(
            HostVersion::parse("19.1.0f1"),
            Err(VersionError::Component { part: "major version", .. })
        ));
        assert!(matches!(
            HostVersion::parse("2019.1.0x1"),
            Err(VersionError::Phase { phase: 'x', .. })
        ));
        assert!(HostVersion::parse("2019.1.0").is_err());
        assert!(HostVersion::parse("2019.1.0f").is_err());
    }

    #[test]
    fn cutoff_selects_rules() {
        assert_eq!(rules_for(Some(&v("2018.4.36f1"))).name(), "legacy");
        assert_eq!(rules_for(Some(&v("2019.1.0a1"))).name(), "modern");
        assert_eq!(rules_for(Some(&v("2021.3.5f1"))).name(), "modern");
        assert_eq!(rules_for(None).name(), "modern");
    }

    #[test]
    fn detects_known_version_lines() {
        let gate = VersionGate::new(DEFAULT_SCAN_LINES);
        assert_eq!(
            gate.detect("Initialize engine version: 2018.4.36f1 (6cd387d23174)")
                .map(|v| v.raw().to_string()),
            Some("2018.4.36f1".into())
        );
        assert!(gate.detect("Unity Editor version:    2021.3.5f1 (40eb3a945986)").is_some());
        assert!(
            gate.detect("Built from '2019.4/staging' branch; Version is '2019.4.1f1 (a1b2c3)'; Debug build")
                .is_some()
        );
        assert!(gate.detect("Cleanup mono").is_none());
    }

    #[test]
    fn gate_holds_lines_until_version_found() {
        let mut gate = VersionGate::new(DEFAULT_SCAN_LINES);
        assert!(gate.offer("COMMAND LINE ARGUMENTS:".into()).is_none());
        assert!(gate.offer("-batchmode".into()).is_none());
        assert_eq!(gate.held(), 2);

        let decision = gate
            .offer("Initialize engine version: 2018.4.2f1 (aaaa)".into())
            .unwrap();
        assert_eq!(decision.rules.name(), "legacy");
        assert_eq!(decision.replay.len(), 3);
        assert_eq!(decision.replay[0], "COMMAND LINE ARGUMENTS:");
        assert_eq!(gate.held(), 0);
    }

    #[test]
    fn gate_gives_up_after_scan_window() {
        let mut gate = VersionGate::new(3);
        assert!(gate.offer("a".into()).is_none());
        assert!(gate.offer("b".into()).is_none());
        let decision = gate.offer("c".into()).unwrap();
        assert!(decision.version.is_none());
        assert_eq!(decision.rules.name(), "modern");
        assert_eq!(decision.replay, vec!["a", "b", "c"]);
    }

    #[test]
    fn finish_releases_held_lines() {
        let mut gate = VersionGate::new(DEFAULT_SCAN_LINES);
        gate.offer("only line".into());
        let decision = gate.finish();
        assert_eq!(decision.replay, vec!["only line"]);
    }

    fn phase_char() -> impl Strategy<Value = char> {
        prop_oneof![Just('a'), Just('b'), Just('f'), Just('p')]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn cmp_release_matches_tuple_order(
            a in (2017u32..2024, 0u32..5, 0u32..40, phase_char(), 0u32..20),
            b in (2017u32..2024, 0u32..5, 0u32..40, phase_char(), 0u32..20),
        ) {
            let va = v(&format!("{}.{}.{}{}{}", a.0, a.1, a.2, a.3, a.4));
            let vb = v(&format!("{}.{}.{}{}{}", b.0, b.1, b.2, b.3, b.4));
            let rank = |c: char| "abfp".find(c).unwrap();
            let expected = (a.0, a.1, a.2, rank(a.3), a.4).cmp(&(b.0, b.1, b.2, rank(b.3), b.4));
            prop_assert_eq!(va.cmp_release(&vb), expected);
            prop_assert_eq!(vb.cmp_release(&va), expected.reverse());
        }

        #[test]
        fn at_least_is_reflexive(
            a in (2017u32..2024, 0u32..5, 0u32..40, phase_char(), 0u32..20),
        ) {
            let va = v(&format!("{}.{}.{}{}{}", a.0, a.1, a.2, a.3, a.4));
            prop_assert!(va.at_least(&va.clone()));
            prop_assert!(va.is_same_release(&va.clone()));
        }
    }
}
