//! Redaction profiles: loading, validation, inheritance, and resolution.
//!
//! A profile is a named, versioned policy mapping PII kinds to enable flags,
//! confidence thresholds, and rendering styles. Profiles load from YAML, JSON,
//! or TOML; unknown options are rejected at load time with a precise
//! diagnostic. A profile may inherit from a base profile; resolution walks the
//! inheritance chain, applies nearest-ancestor precedence, and produces an
//! immutable [`EffectiveProfile`] whose `effective_rule` query is pure and
//! deterministic. Conflicting overrides are recorded in `precedence_notes` so
//! audits can reproduce the resolution.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::error::{ObscuraError, Result};
use crate::types::{PiiKind, ProfileRef};

/// 24-bit RGB color, serialized as `#rrggbb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RgbColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl RgbColor {
    pub const BLACK: RgbColor = RgbColor { r: 0, g: 0, b: 0 };

    pub fn to_rgba(self) -> image::Rgba<u8> {
        image::Rgba([self.r, self.g, self.b, 255])
    }
}

impl std::fmt::Display for RgbColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl std::str::FromStr for RgbColor {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let hex = s.strip_prefix('#').ok_or_else(|| format!("color '{s}' must start with '#'"))?;
        if hex.len() != 6 {
            return Err(format!("color '{s}' must be #rrggbb"));
        }
        let parse = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16).map_err(|e| format!("color '{s}': {e}"))
        };
        Ok(RgbColor {
            r: parse(0..2)?,
            g: parse(2..4)?,
            b: parse(4..6)?,
        })
    }
}

impl Serialize for RgbColor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RgbColor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Deterministic overlay pattern identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternId {
    DiagonalHatch,
    CrossHatch,
}

/// Rendering style for a redaction box.
///
/// `color` applies to `Solid` only; patterns are deterministic overlays.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum StyleSpec {
    Solid {
        color: RgbColor,
    },
    Pixelate {
        block_px: u32,
    },
    Blur {
        radius_px: u32,
        iterations: u32,
    },
    Pattern {
        id: PatternId,
    },
}

impl StyleSpec {
    pub const SOLID_BLACK: StyleSpec = StyleSpec::Solid { color: RgbColor::BLACK };

    fn validate(&self) -> Result<()> {
        match self {
            StyleSpec::Pixelate { block_px } if *block_px == 0 => {
                Err(ObscuraError::profile("pixelate block_px must be positive"))
            }
            StyleSpec::Blur { radius_px, iterations } if *radius_px == 0 || *iterations == 0 => Err(
                ObscuraError::profile("blur radius_px and iterations must be positive"),
            ),
            _ => Ok(()),
        }
    }
}

/// Per-kind rule as written in a profile file.
///
/// `style` may be omitted, in which case the profile's `default_style`
/// applies at resolution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub enabled: bool,
    pub min_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<StyleSpec>,
}

/// A redaction profile as loaded from disk, prior to inheritance resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedactionProfile {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default)]
    pub pii_rules: HashMap<String, RuleSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_style: Option<StyleSpec>,
    #[serde(default)]
    pub confidence_floor: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,
}

impl RedactionProfile {
    /// Parses a profile from YAML.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let profile: RedactionProfile = serde_yaml_ng::from_str(content)
            .map_err(|e| ObscuraError::profile_with_source("invalid YAML profile", e))?;
        profile.validate_schema()?;
        Ok(profile)
    }

    /// Parses a profile from JSON.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let profile: RedactionProfile = serde_json::from_str(content)
            .map_err(|e| ObscuraError::profile_with_source("invalid JSON profile", e))?;
        profile.validate_schema()?;
        Ok(profile)
    }

    /// Parses a profile from TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let profile: RedactionProfile = toml::from_str(content)
            .map_err(|e| ObscuraError::profile_with_source("invalid TOML profile", e))?;
        profile.validate_schema()?;
        Ok(profile)
    }

    /// Loads a profile from a file, dispatching on extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            other => Err(ObscuraError::profile(format!(
                "unsupported profile extension: {:?}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Schema validation: known kinds, confidence ranges, resolvable styles.
    fn validate_schema(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ObscuraError::profile("profile name must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(ObscuraError::profile(format!(
                "profile '{}': confidence_floor {} out of [0, 1]",
                self.name, self.confidence_floor
            )));
        }
        for (tag, rule) in &self.pii_rules {
            if PiiKind::from_tag(tag).is_none() {
                return Err(ObscuraError::profile(format!(
                    "profile '{}': unknown PII kind '{}'",
                    self.name, tag
                )));
            }
            if !(0.0..=1.0).contains(&rule.min_confidence) || !rule.min_confidence.is_finite() {
                return Err(ObscuraError::profile(format!(
                    "profile '{}': rule '{}' min_confidence {} out of [0, 1]",
                    self.name, tag, rule.min_confidence
                )));
            }
            if let Some(style) = &rule.style {
                style.validate().map_err(|e| {
                    ObscuraError::profile(format!("profile '{}': rule '{}': {}", self.name, tag, e))
                })?;
            }
        }
        if let Some(style) = &self.default_style {
            style.validate()?;
        }
        Ok(())
    }

    /// The compiled-in `default` profile: common textual and visual kinds at
    /// 0.7, solid black.
    pub fn builtin_default() -> Self {
        let rule = |min_confidence: f64| RuleSpec {
            enabled: true,
            min_confidence,
            style: None,
        };
        let mut pii_rules = HashMap::new();
        for kind in [
            PiiKind::Face,
            PiiKind::Signature,
            PiiKind::Barcode,
            PiiKind::QrCode,
            PiiKind::PhotoIdPortrait,
            PiiKind::PersonName,
            PiiKind::Email,
            PiiKind::Phone,
            PiiKind::NationalId,
            PiiKind::DateOfBirth,
            PiiKind::IpAddress,
        ] {
            pii_rules.insert(kind.tag().to_string(), rule(0.7));
        }
        RedactionProfile {
            name: "default".to_string(),
            version: "1".to_string(),
            base: None,
            pii_rules,
            default_style: Some(StyleSpec::SOLID_BLACK),
            confidence_floor: 0.5,
            languages: None,
        }
    }
}

/// Fully resolved per-kind rule. `style` is concrete here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveRule {
    pub enabled: bool,
    pub min_confidence: f64,
    pub style: StyleSpec,
}

/// An immutable, fully resolved profile.
///
/// Produced by [`ProfileStore::resolve`]; inlined into audit records together
/// with its `precedence_notes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveProfile {
    pub name: String,
    pub version: String,
    /// BTreeMap keyed by stable tag for deterministic serialization order.
    pub rules: BTreeMap<String, EffectiveRule>,
    pub default_style: StyleSpec,
    pub confidence_floor: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,
    /// Human-readable log of inheritance overrides and clamps, for audit
    /// reproducibility.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub precedence_notes: Vec<String>,
}

impl EffectiveProfile {
    /// Pure, deterministic rule query.
    ///
    /// Kinds absent from the profile resolve to a disabled rule with an
    /// unreachable threshold.
    pub fn effective_rule(&self, kind: PiiKind) -> EffectiveRule {
        self.rules.get(kind.tag()).cloned().unwrap_or(EffectiveRule {
            enabled: false,
            min_confidence: 1.0,
            style: self.default_style,
        })
    }

    pub fn profile_ref(&self) -> ProfileRef {
        ProfileRef {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

/// Flat, name-keyed registry of loaded profiles.
///
/// The store is immutable once populated and safe to share across workers.
#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: HashMap<String, RedactionProfile>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with the compiled-in `default` profile.
    pub fn with_defaults() -> Self {
        let mut store = Self::new();
        store.insert(RedactionProfile::builtin_default());
        store
    }

    pub fn insert(&mut self, profile: RedactionProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn get(&self, name: &str) -> Option<&RedactionProfile> {
        self.profiles.get(name)
    }

    /// Resolves a profile by name into an [`EffectiveProfile`].
    ///
    /// Walks the `base` chain root-first, deep-merging rules so that nearer
    /// ancestors override farther ones and the named profile overrides all of
    /// its ancestors. An inheritance cycle or a dangling base name is fatal.
    pub fn resolve(&self, name: &str) -> Result<EffectiveProfile> {
        let chain = self.inheritance_chain(name)?;

        // chain is ordered root ancestor first, requested profile last.
        let leaf = chain.last().expect("chain contains at least the requested profile");
        let mut notes: Vec<String> = Vec::new();
        let mut merged: BTreeMap<String, (RuleSpec, String)> = BTreeMap::new();
        let mut default_style = StyleSpec::SOLID_BLACK;
        let mut confidence_floor = 0.0_f64;
        let mut languages: Option<Vec<String>> = None;

        for profile in &chain {
            if let Some(style) = profile.default_style {
                default_style = style;
            }
            if profile.confidence_floor > 0.0 {
                confidence_floor = profile.confidence_floor;
            }
            if profile.languages.is_some() {
                languages = profile.languages.clone();
            }
            // Sorted tag order keeps precedence_notes deterministic across
            // runs; the record they end up in is content-addressed.
            let mut tags: Vec<&String> = profile.pii_rules.keys().collect();
            tags.sort();
            for tag in tags {
                let rule = &profile.pii_rules[tag];
                if let Some((_, prior_owner)) = merged.get(tag) {
                    if prior_owner != &profile.name {
                        notes.push(format!(
                            "rule '{}': '{}' overrides '{}'",
                            tag, profile.name, prior_owner
                        ));
                    }
                }
                merged.insert(tag.clone(), (rule.clone(), profile.name.clone()));
            }
        }

        let mut rules = BTreeMap::new();
        for (tag, (rule, _)) in merged {
            let mut min_confidence = rule.min_confidence;
            if min_confidence < confidence_floor {
                notes.push(format!(
                    "rule '{}': min_confidence {} clamped up to floor {}",
                    tag, min_confidence, confidence_floor
                ));
                min_confidence = confidence_floor;
            }
            rules.insert(
                tag,
                EffectiveRule {
                    enabled: rule.enabled,
                    min_confidence,
                    style: rule.style.unwrap_or(default_style),
                },
            );
        }

        Ok(EffectiveProfile {
            name: leaf.name.clone(),
            version: leaf.version.clone(),
            rules,
            default_style,
            confidence_floor,
            languages,
            precedence_notes: notes,
        })
    }

    /// Returns the inheritance chain for `name`, root ancestor first.
    fn inheritance_chain(&self, name: &str) -> Result<Vec<&RedactionProfile>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = name;
        loop {
            if !seen.insert(current.to_string()) {
                return Err(ObscuraError::profile(format!(
                    "inheritance cycle detected at profile '{}'",
                    current
                )));
            }
            let profile = self.profiles.get(current).ok_or_else(|| {
                ObscuraError::profile(format!("profile '{}' not found", current))
            })?;
            chain.push(profile);
            match &profile.base {
                Some(base) => current = base,
                None => break,
            }
        }
        chain.reverse();
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, base: Option<&str>, rules: &[(&str, bool, f64)]) -> RedactionProfile {
        RedactionProfile {
            name: name.to_string(),
            version: "1".to_string(),
            base: base.map(|b| b.to_string()),
            pii_rules: rules
                .iter()
                .map(|(tag, enabled, min)| {
                    (
                        tag.to_string(),
                        RuleSpec {
                            enabled: *enabled,
                            min_confidence: *min,
                            style: None,
                        },
                    )
                })
                .collect(),
            default_style: None,
            confidence_floor: 0.0,
            languages: None,
        }
    }

    #[test]
    fn test_rgb_color_round_trip() {
        let c: RgbColor = "#1a2b3c".parse().unwrap();
        assert_eq!(c, RgbColor { r: 0x1a, g: 0x2b, b: 0x3c });
        assert_eq!(c.to_string(), "#1a2b3c");
        assert!("000000".parse::<RgbColor>().is_err());
        assert!("#12345".parse::<RgbColor>().is_err());
    }

    #[test]
    fn test_profile_from_yaml() {
        let yaml = r##"
name: healthcare
version: "2"
base: default
confidence_floor: 0.6
pii_rules:
  national_id:
    enabled: true
    min_confidence: 0.9
  email:
    enabled: true
    min_confidence: 0.8
    style:
      style: pixelate
      block_px: 12
default_style:
  style: solid
  color: "#000000"
"##;
        let profile = RedactionProfile::from_yaml_str(yaml).unwrap();
        assert_eq!(profile.name, "healthcare");
        assert_eq!(profile.base.as_deref(), Some("default"));
        assert_eq!(
            profile.pii_rules["email"].style,
            Some(StyleSpec::Pixelate { block_px: 12 })
        );
    }

    #[test]
    fn test_profile_rejects_unknown_kind() {
        let yaml = r#"
name: bad
version: "1"
pii_rules:
  social_security:
    enabled: true
    min_confidence: 0.5
"#;
        let err = RedactionProfile::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown PII kind 'social_security'"));
    }

    #[test]
    fn test_profile_rejects_unknown_top_level_option() {
        let yaml = r#"
name: bad
version: "1"
fuzziness: 3
"#;
        assert!(RedactionProfile::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_profile_rejects_out_of_range_confidence() {
        let yaml = r#"
name: bad
version: "1"
pii_rules:
  email:
    enabled: true
    min_confidence: 1.5
"#;
        assert!(RedactionProfile::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_profile_from_json_and_toml() {
        let json = r#"{"name": "p", "version": "1", "pii_rules": {"email": {"enabled": true, "min_confidence": 0.7}}}"#;
        assert!(RedactionProfile::from_json_str(json).is_ok());

        let toml_src = r#"
name = "p"
version = "1"

[pii_rules.email]
enabled = true
min_confidence = 0.7
"#;
        assert!(RedactionProfile::from_toml_str(toml_src).is_ok());
    }

    #[test]
    fn test_resolve_simple() {
        let mut store = ProfileStore::with_defaults();
        store.insert(profile("child", Some("default"), &[("email", false, 0.7)]));

        let resolved = store.resolve("child").unwrap();
        assert_eq!(resolved.name, "child");
        assert!(!resolved.effective_rule(PiiKind::Email).enabled);
        // Inherited from default.
        assert!(resolved.effective_rule(PiiKind::Phone).enabled);
        // Absent kind resolves to disabled.
        assert!(!resolved.effective_rule(PiiKind::LicensePlate).enabled);
    }

    #[test]
    fn test_resolve_nearest_ancestor_wins() {
        let mut store = ProfileStore::new();
        store.insert(profile("a", None, &[("email", true, 0.5), ("phone", true, 0.5)]));
        store.insert(profile("b", Some("a"), &[("email", true, 0.8)]));
        store.insert(profile("c", Some("b"), &[]));

        let resolved = store.resolve("c").unwrap();
        // b overrides a's email rule; phone comes through from a.
        assert!((resolved.effective_rule(PiiKind::Email).min_confidence - 0.8).abs() < 1e-9);
        assert!((resolved.effective_rule(PiiKind::Phone).min_confidence - 0.5).abs() < 1e-9);
        assert!(resolved
            .precedence_notes
            .iter()
            .any(|n| n.contains("'email'") && n.contains("'b'") && n.contains("'a'")));
    }

    #[test]
    fn test_resolve_cycle_is_fatal() {
        let mut store = ProfileStore::new();
        store.insert(profile("a", Some("b"), &[]));
        store.insert(profile("b", Some("a"), &[]));
        let err = store.resolve("a").unwrap_err();
        assert!(err.to_string().contains("inheritance cycle"));
    }

    #[test]
    fn test_resolve_missing_base_is_fatal() {
        let mut store = ProfileStore::new();
        store.insert(profile("a", Some("ghost"), &[]));
        assert!(store.resolve("a").is_err());
    }

    #[test]
    fn test_confidence_floor_clamps_upward() {
        let mut store = ProfileStore::new();
        let mut p = profile("strict", None, &[("email", true, 0.3)]);
        p.confidence_floor = 0.6;
        store.insert(p);

        let resolved = store.resolve("strict").unwrap();
        let rule = resolved.effective_rule(PiiKind::Email);
        assert!((rule.min_confidence - 0.6).abs() < 1e-9);
        assert!(resolved.precedence_notes.iter().any(|n| n.contains("clamped")));
    }

    #[test]
    fn test_effective_rule_is_deterministic() {
        let store = ProfileStore::with_defaults();
        let a = store.resolve("default").unwrap();
        let b = store.resolve("default").unwrap();
        for kind in PiiKind::ALL {
            assert_eq!(a.effective_rule(kind), b.effective_rule(kind));
        }
    }

    #[test]
    fn test_builtin_default_validates() {
        assert!(RedactionProfile::builtin_default().validate_schema().is_ok());
    }

    #[test]
    fn test_style_validation() {
        assert!(StyleSpec::Pixelate { block_px: 0 }.validate().is_err());
        assert!(StyleSpec::Blur { radius_px: 0, iterations: 1 }.validate().is_err());
        assert!(StyleSpec::Blur { radius_px: 2, iterations: 3 }.validate().is_ok());
    }
}
