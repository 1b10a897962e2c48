//! Envelopes, bounding boxes and projections

use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

/// Axis-aligned bounding region of one geometry.
///
/// X/Y are always present; Z and M are optional and, when present, carry both
/// bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_z: Option<f64>,
    pub max_z: Option<f64>,
    pub min_m: Option<f64>,
    pub max_m: Option<f64>,
}

impl Envelope {
    /// 2D envelope. Argument order follows the index table columns.
    pub fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Result<Self> {
        let envelope = Self {
            min_x,
            max_x,
            min_y,
            max_y,
            min_z: None,
            max_z: None,
            min_m: None,
            max_m: None,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn with_z(mut self, min_z: f64, max_z: f64) -> Result<Self> {
        self.min_z = Some(min_z);
        self.max_z = Some(max_z);
        self.validate()?;
        Ok(self)
    }

    pub fn with_m(mut self, min_m: f64, max_m: f64) -> Result<Self> {
        self.min_m = Some(min_m);
        self.max_m = Some(max_m);
        self.validate()?;
        Ok(self)
    }

    pub fn has_z(&self) -> bool {
        self.min_z.is_some() && self.max_z.is_some()
    }

    pub fn has_m(&self) -> bool {
        self.min_m.is_some() && self.max_m.is_some()
    }

    /// Check the ordering and pairing invariants.
    ///
    /// Index entries read back from storage go through this too, so a corrupted
    /// entry surfaces as `InvalidEnvelope` instead of silently never matching.
    pub fn validate(&self) -> Result<()> {
        if self.min_x.is_nan() || self.max_x.is_nan() || self.min_y.is_nan() || self.max_y.is_nan() {
            return Err(StorageError::InvalidEnvelope("NaN bound".to_string()));
        }
        if self.min_x > self.max_x || self.min_y > self.max_y {
            return Err(StorageError::InvalidEnvelope(format!(
                "min > max in x/y: {:?}",
                self
            )));
        }
        check_pair("z", self.min_z, self.max_z)?;
        check_pair("m", self.min_m, self.max_m)?;
        Ok(())
    }

    /// Boundary-inclusive intersection.
    ///
    /// Z and M only participate when both envelopes carry them.
    pub fn intersects(&self, other: &Envelope) -> bool {
        let xy = self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y;
        if !xy {
            return false;
        }
        if let (Some(a0), Some(a1), Some(b0), Some(b1)) = (self.min_z, self.max_z, other.min_z, other.max_z) {
            if !(a0 <= b1 && a1 >= b0) {
                return false;
            }
        }
        if let (Some(a0), Some(a1), Some(b0), Some(b1)) = (self.min_m, self.max_m, other.min_m, other.max_m) {
            if !(a0 <= b1 && a1 >= b0) {
                return false;
            }
        }
        true
    }

    /// Grow to cover `other`. Z/M are kept only if both sides have them.
    pub fn union(&self, other: &Envelope) -> Envelope {
        let pair = |a: (Option<f64>, Option<f64>), b: (Option<f64>, Option<f64>)| match (a, b) {
            ((Some(a0), Some(a1)), (Some(b0), Some(b1))) => (Some(a0.min(b0)), Some(a1.max(b1))),
            _ => (None, None),
        };
        let (min_z, max_z) = pair((self.min_z, self.max_z), (other.min_z, other.max_z));
        let (min_m, max_m) = pair((self.min_m, self.max_m), (other.min_m, other.max_m));
        Envelope {
            min_x: self.min_x.min(other.min_x),
            max_x: self.max_x.max(other.max_x),
            min_y: self.min_y.min(other.min_y),
            max_y: self.max_y.max(other.max_y),
            min_z,
            max_z,
            min_m,
            max_m,
        }
    }
}

fn check_pair(axis: &str, min: Option<f64>, max: Option<f64>) -> Result<()> {
    match (min, max) {
        (None, None) => Ok(()),
        (Some(lo), Some(hi)) if lo <= hi => Ok(()),
        (Some(_), Some(_)) => Err(StorageError::InvalidEnvelope(format!("min_{0} > max_{0}", axis))),
        _ => Err(StorageError::InvalidEnvelope(format!(
            "min_{0}/max_{0} must both be present or both absent",
            axis
        ))),
    }
}

/// 2D bounding box in some projection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Result<Self> {
        if !(min_x <= max_x && min_y <= max_y) {
            return Err(StorageError::InvalidEnvelope(format!(
                "Invalid bounding box ({}, {}, {}, {})",
                min_x, min_y, max_x, max_y
            )));
        }
        Ok(Self { min_x, min_y, max_x, max_y })
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.max_x < other.min_x
            || self.min_x > other.max_x
            || self.max_y < other.min_y
            || self.min_y > other.max_y)
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            min_x: self.min_x,
            max_x: self.max_x,
            min_y: self.min_y,
            max_y: self.max_y,
            min_z: None,
            max_z: None,
            min_m: None,
            max_m: None,
        }
    }
}

impl From<&Envelope> for BoundingBox {
    fn from(envelope: &Envelope) -> Self {
        Self {
            min_x: envelope.min_x,
            min_y: envelope.min_y,
            max_x: envelope.max_x,
            max_y: envelope.max_y,
        }
    }
}

/// Spatial reference of a bounding box, identified by its `srs_id`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Projection {
    pub srs_id: i32,
}

impl Projection {
    pub fn new(srs_id: i32) -> Self {
        Self { srs_id }
    }
}

/// Reprojection hook supplied by the caller.
///
/// The feature layer never does coordinate math itself; a bounding box given
/// in a foreign projection is handed to this trait.
pub trait BoundingBoxTransform {
    fn transform(&self, bbox: &BoundingBox, from: Projection, to: Projection) -> Result<BoundingBox>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Envelope {
        Envelope::new(min_x, max_x, min_y, max_y).unwrap()
    }

    #[test]
    fn test_envelope_invariants() {
        assert!(Envelope::new(1.0, 0.0, 0.0, 1.0).is_err());
        assert!(Envelope::new(0.0, 1.0, 2.0, 1.0).is_err());
        assert!(env(0.0, 1.0, 0.0, 1.0).with_z(3.0, 2.0).is_err());

        let half_z = Envelope { min_z: Some(1.0), ..env(0.0, 1.0, 0.0, 1.0) };
        assert!(half_z.validate().is_err());
    }

    #[test]
    fn test_envelope_intersects_boundary_inclusive() {
        let a = env(0.0, 10.0, 0.0, 10.0);
        assert!(a.intersects(&env(10.0, 20.0, 10.0, 20.0)));
        assert!(a.intersects(&env(5.0, 15.0, 5.0, 15.0)));
        assert!(!a.intersects(&env(10.5, 20.0, 0.0, 10.0)));
        assert!(!a.intersects(&env(20.0, 30.0, 20.0, 30.0)));
    }

    #[test]
    fn test_envelope_z_only_when_both_present() {
        let a = env(0.0, 10.0, 0.0, 10.0).with_z(0.0, 1.0).unwrap();
        let b = env(0.0, 10.0, 0.0, 10.0).with_z(5.0, 6.0).unwrap();
        let flat = env(0.0, 10.0, 0.0, 10.0);

        assert!(!a.intersects(&b));
        assert!(a.intersects(&flat));
        assert!(flat.intersects(&b));
    }

    #[test]
    fn test_union() {
        let u = env(0.0, 1.0, 0.0, 1.0).union(&env(5.0, 6.0, -2.0, 0.5));
        assert_eq!(u, env(0.0, 6.0, -2.0, 1.0));
    }

    #[test]
    fn test_bbox_intersects() {
        let bbox1 = BoundingBox::new(0.0, 0.0, 10.0, 10.0).unwrap();
        let bbox2 = BoundingBox::new(5.0, 5.0, 15.0, 15.0).unwrap();
        let bbox3 = BoundingBox::new(20.0, 20.0, 30.0, 30.0).unwrap();

        assert!(bbox1.intersects(&bbox2));
        assert!(!bbox1.intersects(&bbox3));
        assert_eq!(bbox1.to_envelope(), env(0.0, 10.0, 0.0, 10.0));
    }
}
