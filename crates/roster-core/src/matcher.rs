//! Nearest-neighbour matching of probe descriptors against enrolled employees.

use crate::types::{Descriptor, Detection, Pose, PoseDescriptors};
use serde::Serialize;

/// Default Euclidean distance threshold; a match must be strictly closer.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.7;
/// Default minimum confidence (percent) for an accepted match.
pub const DEFAULT_MIN_CONFIDENCE: u8 = 50;

/// Same-identity L2 threshold published with the SFace model.
///
/// SFace descriptors are unit length, so distance is `sqrt(2 - 2 cos)`. Under
/// the defaults above a match needs cosine similarity of about 0.87, which
/// rejects many genuine faces. Kiosks running SFace should set
/// `match_threshold = 1.128` and `min_confidence = 0`; see [`MatchPolicy::sface`].
pub const SFACE_MATCH_THRESHOLD: f32 = 1.128;

/// Which reference descriptor of an employee produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateLabel {
    Primary,
    Pose(Pose),
}

/// One labeled reference descriptor.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub employee_id: String,
    pub label: CandidateLabel,
    pub descriptor: Descriptor,
}

/// All reference descriptors of all enrolled employees.
///
/// Each employee contributes its primary descriptor and every present per-pose
/// descriptor as an independent candidate.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    candidates: Vec<Candidate>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an employee's descriptors. Employees without a primary descriptor
    /// are not enrolled and contribute nothing.
    pub fn add_employee(
        &mut self,
        employee_id: &str,
        primary: Option<&Descriptor>,
        poses: Option<&PoseDescriptors>,
    ) {
        let Some(primary) = primary else {
            return;
        };
        self.candidates.push(Candidate {
            employee_id: employee_id.to_string(),
            label: CandidateLabel::Primary,
            descriptor: primary.clone(),
        });
        if let Some(poses) = poses {
            for (pose, descriptor) in poses.present() {
                self.candidates.push(Candidate {
                    employee_id: employee_id.to_string(),
                    label: CandidateLabel::Pose(pose),
                    descriptor: descriptor.clone(),
                });
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Number of distinct employees represented.
    pub fn employee_count(&self) -> usize {
        let mut ids: Vec<&str> = self.candidates.iter().map(|c| c.employee_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Nearest candidate to `probe` by Euclidean distance.
    ///
    /// Always scans the full set; ties keep the earlier candidate.
    pub fn nearest(&self, probe: &Descriptor) -> Option<MatchCandidate> {
        let mut best: Option<(usize, f32)> = None;
        for (i, candidate) in self.candidates.iter().enumerate() {
            let distance = probe.distance(&candidate.descriptor);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }
        best.map(|(i, distance)| {
            let candidate = &self.candidates[i];
            MatchCandidate {
                employee_id: candidate.employee_id.clone(),
                label: candidate.label,
                distance,
                confidence: confidence(distance),
            }
        })
    }
}

/// Nearest reference for one probe, before the acceptance policy is applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub employee_id: String,
    pub label: CandidateLabel,
    pub distance: f32,
    /// `round((1 - distance) * 100)`, floored at 0.
    pub confidence: u8,
}

/// Confidence percentage for a Euclidean distance.
pub fn confidence(distance: f32) -> u8 {
    ((1.0 - distance) * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Acceptance rule for a nearest-candidate result.
#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy {
    pub threshold: f32,
    pub min_confidence: u8,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl MatchPolicy {
    /// Policy calibrated for unit-length SFace descriptors.
    pub fn sface() -> Self {
        Self {
            threshold: SFACE_MATCH_THRESHOLD,
            min_confidence: 0,
        }
    }

    /// Largest distance this policy can accept, combining the threshold with
    /// the confidence floor.
    pub fn max_accepted_distance(&self) -> f32 {
        let by_confidence = match self.min_confidence {
            0 => f32::INFINITY,
            m => 1.0 - (m as f32 - 0.5) / 100.0,
        };
        self.threshold.min(by_confidence)
    }

    /// Smallest cosine similarity accepted between unit-length descriptors.
    pub fn min_cosine_for_unit_descriptors(&self) -> f32 {
        let d = self.max_accepted_distance().min(2.0);
        1.0 - d * d / 2.0
    }

    pub fn accepts(&self, candidate: &MatchCandidate) -> bool {
        candidate.distance < self.threshold && candidate.confidence >= self.min_confidence
    }

    /// Evaluate every detected face of a frame and return the accepted match
    /// with the smallest distance, with the index of its detection.
    pub fn best_in_frame(
        &self,
        references: &ReferenceSet,
        detections: &[Detection],
    ) -> Option<(usize, MatchCandidate)> {
        let mut best: Option<(usize, MatchCandidate)> = None;
        for (i, detection) in detections.iter().enumerate() {
            let Some(candidate) = references.nearest(&detection.descriptor) else {
                continue;
            };
            tracing::trace!(
                face = i,
                employee = %candidate.employee_id,
                distance = candidate.distance,
                confidence = candidate.confidence,
                "nearest reference"
            );
            if !self.accepts(&candidate) {
                continue;
            }
            if best.as_ref().map_or(true, |(_, b)| candidate.distance < b.distance) {
                best = Some((i, candidate));
            }
        }
        best
    }
}
