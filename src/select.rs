//! Target selection among a frame's detections.
//!
//! Two policies exist. `Labeled` follows one named identity and tracks
//! nothing until a label is requested. `Largest` has no identity concept and
//! follows the biggest face that clears the confidence floor.
//!
//! Both are deterministic: ties that survive every sort key go to the
//! detection that appears first in the input.

use std::cmp::Ordering;
use std::str::FromStr;

use anyhow::{anyhow, Result};

use crate::detect::Detection;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Follow the requested label only.
    #[default]
    Labeled,
    /// Follow the largest face regardless of label.
    Largest,
}

impl FromStr for SelectionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "labeled" | "label" | "identity" => Ok(Self::Labeled),
            "largest" | "area" => Ok(Self::Largest),
            other => Err(anyhow!(
                "unknown selection policy '{}': expected 'labeled' or 'largest'",
                other
            )),
        }
    }
}

impl std::fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Labeled => write!(f, "labeled"),
            Self::Largest => write!(f, "largest"),
        }
    }
}

/// Pick the detection matching `target_label` (case-insensitive) with
/// confidence at least `confidence_threshold`, preferring higher confidence
/// and then larger area.
///
/// Returns `None` when no label is requested or nothing qualifies; a
/// different label or a weaker match is never substituted.
pub fn select_target<'a>(
    detections: &'a [Detection],
    target_label: Option<&str>,
    confidence_threshold: f32,
) -> Option<&'a Detection> {
    let label = target_label?;
    pick_first_max(
        detections
            .iter()
            .filter(|d| d.matches_label(label) && d.confidence >= confidence_threshold),
        |a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.area().cmp(&b.area()))
        },
    )
}

/// Pick the largest-area detection with confidence at least `min_confidence`.
pub fn select_largest(detections: &[Detection], min_confidence: f32) -> Option<&Detection> {
    pick_first_max(
        detections.iter().filter(|d| d.confidence >= min_confidence),
        |a, b| a.area().cmp(&b.area()),
    )
}

/// Dispatch on `policy`.
pub fn select<'a>(
    policy: SelectionPolicy,
    detections: &'a [Detection],
    target_label: Option<&str>,
    confidence_threshold: f32,
) -> Option<&'a Detection> {
    match policy {
        SelectionPolicy::Labeled => select_target(detections, target_label, confidence_threshold),
        SelectionPolicy::Largest => select_largest(detections, confidence_threshold),
    }
}

// `Iterator::max_by` keeps the last of equal elements; this keeps the first.
fn pick_first_max<'a, I, F>(candidates: I, mut cmp: F) -> Option<&'a Detection>
where
    I: Iterator<Item = &'a Detection>,
    F: FnMut(&Detection, &Detection) -> Ordering,
{
    candidates.fold(None, |best, candidate| match best {
        Some(current) if cmp(candidate, current) != Ordering::Greater => Some(current),
        _ => Some(candidate),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn det(label: Option<&str>, confidence: f32, w: i32, h: i32) -> Detection {
        Detection::new(
            BoundingBox::new(10, 10, w, h),
            confidence,
            label.map(str::to_string),
        )
    }

    #[test]
    fn no_label_means_no_target() {
        let detections = vec![det(Some("laura"), 0.99, 50, 50)];
        assert!(select_target(&detections, None, 0.5).is_none());
    }

    #[test]
    fn equal_confidence_prefers_larger_area() {
        let detections = vec![
            det(Some("laura"), 0.92, 25, 20),
            det(Some("laura"), 0.92, 30, 30),
        ];
        let chosen = select_target(&detections, Some("laura"), 0.85).unwrap();
        assert_eq!(chosen.area(), 900);
    }

    #[test]
    fn confidence_outranks_area() {
        let detections = vec![
            det(Some("tuta"), 0.91, 100, 100),
            det(Some("tuta"), 0.97, 10, 10),
        ];
        let chosen = select_target(&detections, Some("tuta"), 0.9).unwrap();
        assert_eq!(chosen.confidence, 0.97);
    }

    #[test]
    fn label_match_ignores_case() {
        let detections = vec![det(Some("Laura"), 0.95, 10, 10)];
        assert!(select_target(&detections, Some("LAURA"), 0.9).is_some());
    }

    #[test]
    fn never_substitutes_other_labels_or_weak_matches() {
        let detections = vec![
            det(Some("tuta"), 0.99, 80, 80),
            det(Some("laura"), 0.60, 80, 80),
            det(None, 0.99, 80, 80),
        ];
        assert!(select_target(&detections, Some("laura"), 0.85).is_none());
    }

    #[test]
    fn threshold_is_inclusive() {
        let detections = vec![det(Some("laura"), 0.85, 10, 10)];
        assert!(select_target(&detections, Some("laura"), 0.85).is_some());
    }

    #[test]
    fn full_tie_keeps_input_order() {
        let detections = vec![
            Detection::labeled(BoundingBox::new(1, 0, 20, 20), 0.9, "laura"),
            Detection::labeled(BoundingBox::new(2, 0, 20, 20), 0.9, "laura"),
        ];
        for _ in 0..5 {
            let chosen = select_target(&detections, Some("laura"), 0.5).unwrap();
            assert_eq!(chosen.bbox.x, 1);
        }
    }

    #[test]
    fn largest_ignores_labels() {
        let detections = vec![
            det(None, 0.6, 10, 10),
            det(Some("tuta"), 0.7, 40, 40),
            det(Some("laura"), 0.3, 90, 90),
        ];
        let chosen = select_largest(&detections, 0.5).unwrap();
        assert_eq!(chosen.area(), 1600);
        assert!(select_largest(&[], 0.5).is_none());
    }

    #[test]
    fn policy_parses() {
        assert_eq!("Largest".parse::<SelectionPolicy>().unwrap(), SelectionPolicy::Largest);
        assert_eq!("labeled".parse::<SelectionPolicy>().unwrap(), SelectionPolicy::Labeled);
        assert!("nearest".parse::<SelectionPolicy>().is_err());
    }
}
