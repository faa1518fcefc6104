//! Hybrid fusion: merge visual and textual detections into a single
//! profile-filtered, non-redundant set per page.
//!
//! Pipeline: profile filter (inclusive threshold) → equivalence grouping →
//! representative selection → deterministic ordering. Grouping is transitive:
//! two detections are equivalent candidates when their kinds are compatible
//! and either their boxes overlap with IoU ≥ 0.5 or a textual glyph run sits
//! inside a co-located visual region with at least 70 % of its area covered.
//! Kind compatibility is equality, plus the cross-modal pairs where a printed
//! name co-locates with the visual feature it labels (face or portrait).

use std::collections::HashMap;

use uuid::Uuid;

use crate::profile::EffectiveProfile;
use crate::types::{Detection, DetectionSource, PiiKind};

/// IoU at or above which two same-kind detections describe the same region.
const IOU_EQUIVALENCE: f64 = 0.5;

/// Minimum fraction of a textual bbox covered by a visual bbox for
/// cross-modal co-location.
const CONTAINMENT_EQUIVALENCE: f64 = 0.7;

/// Margin a fusion group's confidence may gain over its strongest member.
const NOISY_OR_MARGIN: f64 = 0.05;

/// Whether two kinds may describe the same underlying PII instance.
fn kinds_compatible(a: PiiKind, b: PiiKind) -> bool {
    if a == b {
        return true;
    }
    matches!(
        (a, b),
        (PiiKind::Face, PiiKind::PersonName)
            | (PiiKind::PersonName, PiiKind::Face)
            | (PiiKind::PhotoIdPortrait, PiiKind::PersonName)
            | (PiiKind::PersonName, PiiKind::PhotoIdPortrait)
    )
}

fn equivalent_candidates(a: &Detection, b: &Detection) -> bool {
    if !kinds_compatible(a.kind, b.kind) {
        return false;
    }
    if a.kind == b.kind && a.bbox.iou(&b.bbox) >= IOU_EQUIVALENCE {
        return true;
    }
    // Cross-modal co-location: the textual glyph run must sit inside the
    // visual region.
    let (textual, visual) = match (a.source, b.source) {
        (DetectionSource::Textual, DetectionSource::Visual) => (a, b),
        (DetectionSource::Visual, DetectionSource::Textual) => (b, a),
        _ => return false,
    };
    textual.bbox.coverage_by(&visual.bbox) >= CONTAINMENT_EQUIVALENCE
}

/// Disjoint-set over detection indices.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Selects the representative member per the tie-break rules: prefer textual
/// (it carries text content), then earlier reading order, then the stronger
/// confidence for stability.
fn representative(members: &[&Detection]) -> usize {
    let mut best = 0;
    for (i, candidate) in members.iter().enumerate().skip(1) {
        let current = members[best];
        let cand_textual = candidate.source == DetectionSource::Textual;
        let cur_textual = current.source == DetectionSource::Textual;
        let better = match (cand_textual, cur_textual) {
            (true, false) => true,
            (false, true) => false,
            _ => {
                let cand_order = candidate.reading_order.unwrap_or(usize::MAX);
                let cur_order = current.reading_order.unwrap_or(usize::MAX);
                cand_order < cur_order
                    || (cand_order == cur_order && candidate.confidence > current.confidence)
            }
        };
        if better {
            best = i;
        }
    }
    best
}

/// Builds the merged detection for one equivalence group.
///
/// Singleton groups pass through untouched.
fn merge_group(mut members: Vec<Detection>) -> Detection {
    if members.len() == 1 {
        return members.pop().expect("singleton group");
    }

    let refs: Vec<&Detection> = members.iter().collect();
    let rep_index = representative(&refs);

    let bbox = members[1..]
        .iter()
        .fold(members[0].bbox, |acc, d| acc.union(&d.bbox));

    let noisy_or = 1.0 - members.iter().map(|d| 1.0 - d.confidence).product::<f64>();
    let strongest = members
        .iter()
        .map(|d| d.confidence)
        .fold(f64::MIN, f64::max);
    let confidence = noisy_or.min(strongest + NOISY_OR_MARGIN).clamp(0.0, 1.0);

    let distinct_sources = {
        let mut visual = false;
        let mut textual = false;
        for d in &members {
            match d.source {
                DetectionSource::Visual => visual = true,
                DetectionSource::Textual => textual = true,
                DetectionSource::Fused => {}
            }
        }
        usize::from(visual) + usize::from(textual)
    };

    let text = members
        .iter()
        .filter(|d| d.source == DetectionSource::Textual)
        .find_map(|d| d.text.clone());
    let language = members.iter().find_map(|d| d.language.clone());
    let reading_order = members.iter().filter_map(|d| d.reading_order).min();

    let mut model_tags: Vec<String> = members.iter().map(|d| d.model_tag.clone()).collect();
    model_tags.sort();
    model_tags.dedup();

    let rep = &members[rep_index];
    let mut fused = Detection {
        id: Uuid::new_v4(),
        kind: rep.kind,
        page_index: rep.page_index,
        bbox,
        confidence,
        source: if distinct_sources >= 2 {
            DetectionSource::Fused
        } else {
            rep.source
        },
        text,
        language,
        model_tag: model_tags.join("+"),
        reading_order,
        extras: HashMap::new(),
    };
    fused.extras.insert(
        "source_model_tags".to_string(),
        serde_json::json!(model_tags),
    );
    fused
}

/// Deterministic output order: `(page_index, bbox.y, bbox.x, kind)`.
pub fn sort_detections(detections: &mut [Detection]) {
    detections.sort_by(|a, b| {
        (a.page_index, a.bbox.y, a.bbox.x, a.kind).cmp(&(b.page_index, b.bbox.y, b.bbox.x, b.kind))
    });
}

/// Whether a detection passes the profile's language allow-list. Detections
/// with no recorded language always pass; the list constrains only tags the
/// detector actually knows.
fn language_allowed(detection: &Detection, profile: &EffectiveProfile) -> bool {
    match (&profile.languages, &detection.language) {
        (Some(allowed), Some(language)) => allowed
            .iter()
            .any(|tag| tag.eq_ignore_ascii_case(language)),
        _ => true,
    }
}

/// Fuses one page's visual and textual detections under a resolved profile.
///
/// Detections whose kind is disabled, whose confidence falls below the
/// rule's threshold, or whose language is outside the profile's allow-list
/// are dropped first (the threshold is inclusive). The remainder is grouped
/// transitively and each group collapses to a single representative
/// detection.
pub fn fuse_page_detections(
    detections: Vec<Detection>,
    profile: &EffectiveProfile,
) -> Vec<Detection> {
    let filtered: Vec<Detection> = detections
        .into_iter()
        .filter(|d| {
            let rule = profile.effective_rule(d.kind);
            rule.enabled && d.confidence >= rule.min_confidence && language_allowed(d, profile)
        })
        .collect();

    if filtered.is_empty() {
        return filtered;
    }

    let mut uf = UnionFind::new(filtered.len());
    for i in 0..filtered.len() {
        for j in (i + 1)..filtered.len() {
            if equivalent_candidates(&filtered[i], &filtered[j]) {
                uf.union(i, j);
            }
        }
    }

    let mut groups: HashMap<usize, Vec<Detection>> = HashMap::new();
    for (i, detection) in filtered.into_iter().enumerate() {
        groups.entry(uf.find(i)).or_default().push(detection);
    }

    let mut fused: Vec<Detection> = groups.into_values().map(merge_group).collect();
    sort_detections(&mut fused);
    fused
}
