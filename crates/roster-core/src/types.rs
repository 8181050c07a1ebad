use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of every face descriptor produced and stored by roster.
pub const DESCRIPTOR_DIM: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor must have {DESCRIPTOR_DIM} values, got {0}")]
    WrongLength(usize),
    #[error("descriptor contains a non-finite value at index {0}")]
    NonFinite(usize),
    #[error("cannot average an empty set of descriptors")]
    Empty,
}

/// A 128-dimensional face descriptor.
///
/// Serializes as a bare JSON array of floats, which is also its storage format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.len() != DESCRIPTOR_DIM {
            return Err(DescriptorError::WrongLength(values.len()));
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite(idx));
        }
        Ok(Self(values))
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// Euclidean (L2) distance to another descriptor.
    pub fn distance(&self, other: &Descriptor) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Element-wise arithmetic mean of a set of descriptors.
    pub fn mean<'a, I>(descriptors: I) -> Result<Descriptor, DescriptorError>
    where
        I: IntoIterator<Item = &'a Descriptor>,
    {
        let mut sum = vec![0.0f32; DESCRIPTOR_DIM];
        let mut count = 0usize;
        for descriptor in descriptors {
            for (acc, v) in sum.iter_mut().zip(descriptor.values()) {
                *acc += v;
            }
            count += 1;
        }
        if count == 0 {
            return Err(DescriptorError::Empty);
        }
        let n = count as f32;
        Ok(Descriptor(sum.into_iter().map(|s| s / n).collect()))
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(d: Descriptor) -> Self {
        d.0
    }
}

/// Head pose captured during enrollment, in capture order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pose {
    Front,
    Left,
    Right,
    Up,
    Down,
}

impl Pose {
    pub const ALL: [Pose; 5] = [Pose::Front, Pose::Left, Pose::Right, Pose::Up, Pose::Down];

    pub fn as_str(&self) -> &'static str {
        match self {
            Pose::Front => "front",
            Pose::Left => "left",
            Pose::Right => "right",
            Pose::Up => "up",
            Pose::Down => "down",
        }
    }

    /// Operator-facing instruction for this pose.
    pub fn instruction(&self) -> &'static str {
        match self {
            Pose::Front => "look straight into the camera",
            Pose::Left => "turn your head slightly to the left (about 15-30 degrees)",
            Pose::Right => "turn your head slightly to the right (about 15-30 degrees)",
            Pose::Up => "tilt your head up slightly",
            Pose::Down => "tilt your head down slightly",
        }
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pose::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown pose '{s}' (expected front, left, right, up or down)"))
    }
}

/// Per-pose descriptors. Each slot is either a full descriptor or absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseDescriptors {
    pub front: Option<Descriptor>,
    pub left: Option<Descriptor>,
    pub right: Option<Descriptor>,
    pub up: Option<Descriptor>,
    pub down: Option<Descriptor>,
}

impl PoseDescriptors {
    pub fn get(&self, pose: Pose) -> Option<&Descriptor> {
        match pose {
            Pose::Front => self.front.as_ref(),
            Pose::Left => self.left.as_ref(),
            Pose::Right => self.right.as_ref(),
            Pose::Up => self.up.as_ref(),
            Pose::Down => self.down.as_ref(),
        }
    }

    pub fn set(&mut self, pose: Pose, descriptor: Descriptor) {
        let slot = match pose {
            Pose::Front => &mut self.front,
            Pose::Left => &mut self.left,
            Pose::Right => &mut self.right,
            Pose::Up => &mut self.up,
            Pose::Down => &mut self.down,
        };
        *slot = Some(descriptor);
    }

    /// Poses without a descriptor, in capture order.
    pub fn missing(&self) -> Vec<Pose> {
        Pose::ALL
            .into_iter()
            .filter(|p| self.get(*p).is_none())
            .collect()
    }

    /// Present descriptors with their pose, in capture order.
    pub fn present(&self) -> impl Iterator<Item = (Pose, &Descriptor)> + '_ {
        Pose::ALL
            .into_iter()
            .filter_map(move |p| self.get(p).map(|d| (p, d)))
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// One detected face with its descriptor.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
}

#[cfg(test)]
pub(crate) fn unit_descriptor(index: usize, value: f32) -> Descriptor {
    let mut values = vec![0.0f32; DESCRIPTOR_DIM];
    values[index] = value;
    Descriptor::new(values).unwrap()
}
