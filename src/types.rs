use glam::{Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a cell, unique across the universe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellId(pub u64);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell:{}", self.0)
    }
}

/// Data store reference of the object that owns a spatial cell. Only kept for diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersistentRef(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CellClass {
    #[default]
    Basic,
    /// An avatar's cell. It can own a view cache once its user logs in.
    View,
}

/// The owner a change is performed on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    name: String,
}
impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
    pub fn system() -> Self {
        Self::new("system")
    }
    pub fn name(&self) -> &str {
        &self.name
    }
}
impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Translation, rotation and uniform scale of a cell relative to its parent.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellTransform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: f32,
}

impl Default for CellTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl CellTransform {
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: 1.0,
    };
    pub const EPSILON: f32 = 1e-5;

    pub fn from_translation(translation: Vec3) -> Self {
        Self { translation, ..Self::IDENTITY }
    }
    pub fn with_rotation(self, rotation: Quat) -> Self {
        Self { rotation, ..self }
    }
    pub fn with_scale(self, scale: f32) -> Self {
        Self { scale, ..self }
    }

    /// `self ∘ local`: where something placed at `local` inside this frame ends up.
    pub fn mul(&self, local: &CellTransform) -> CellTransform {
        CellTransform {
            translation: self.transform_point(local.translation),
            rotation: self.rotation * local.rotation,
            scale: self.scale * local.scale,
        }
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.translation + self.rotation * (point * self.scale)
    }

    pub fn approx_eq(&self, other: &CellTransform, eps: f32) -> bool {
        self.translation.abs_diff_eq(other.translation, eps)
            && self.rotation.abs_diff_eq(other.rotation, eps)
            && (self.scale - other.scale).abs() <= eps
    }
}

/// A bounding volume, in whichever space its owner says.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum Bounds {
    Sphere { center: Vec3, radius: f32 },
    /// Axis aligned box; `extent` holds the half sizes.
    Box { center: Vec3, extent: Vec3 },
}

impl Bounds {
    pub fn sphere(center: Vec3, radius: f32) -> Self {
        Bounds::Sphere { center, radius }
    }
    pub fn cuboid(center: Vec3, extent: Vec3) -> Self {
        Bounds::Box { center, extent }
    }
    pub fn center(&self) -> Vec3 {
        match *self {
            Bounds::Sphere { center, .. } | Bounds::Box { center, .. } => center,
        }
    }

    pub fn transformed(&self, transform: &CellTransform) -> Bounds {
        match *self {
            Bounds::Sphere { center, radius } => Bounds::Sphere {
                center: transform.transform_point(center),
                radius: radius * transform.scale.abs(),
            },
            Bounds::Box { center, extent } => {
                // the rotated box is re-fitted with an axis aligned one
                let m = Mat3::from_quat(transform.rotation);
                let extent = (m.x_axis.abs() * extent.x
                    + m.y_axis.abs() * extent.y
                    + m.z_axis.abs() * extent.z)
                    * transform.scale.abs();
                Bounds::Box { center: transform.transform_point(center), extent }
            }
        }
    }

    /// Smallest volume enclosing both. Mixed kinds merge into a box.
    pub fn merge(&self, other: &Bounds) -> Bounds {
        match (*self, *other) {
            (Bounds::Sphere { center: c1, radius: r1 }, Bounds::Sphere { center: c2, radius: r2 }) => {
                let d = c1.distance(c2);
                if d + r2 <= r1 {
                    *self
                } else if d + r1 <= r2 {
                    *other
                } else {
                    let radius = (d + r1 + r2) * 0.5;
                    let center = c1 + (c2 - c1) * ((radius - r1) / d);
                    Bounds::Sphere { center, radius }
                }
            }
            _ => {
                let (min1, max1) = self.min_max();
                let (min2, max2) = other.min_max();
                let min = min1.min(min2);
                let max = max1.max(max2);
                Bounds::Box { center: (min + max) * 0.5, extent: (max - min) * 0.5 }
            }
        }
    }

    pub fn intersects_sphere(&self, point: Vec3, radius: f32) -> bool {
        match *self {
            Bounds::Sphere { center, radius: r } => center.distance_squared(point) <= (r + radius) * (r + radius),
            Bounds::Box { center, extent } => {
                let closest = point.clamp(center - extent, center + extent);
                closest.distance_squared(point) <= radius * radius
            }
        }
    }

    fn min_max(&self) -> (Vec3, Vec3) {
        match *self {
            Bounds::Sphere { center, radius } => (center - Vec3::splat(radius), center + Vec3::splat(radius)),
            Bounds::Box { center, extent } => (center - extent, center + extent),
        }
    }
}

/// Everything needed to put a new cell into the universe.
#[derive(Debug, Clone, PartialEq)]
pub struct CellDescriptor {
    pub id: CellId,
    pub persistent: PersistentRef,
    pub class: CellClass,
    pub local_transform: CellTransform,
    pub local_bounds: Bounds,
}

impl CellDescriptor {
    pub fn new(id: CellId, class: CellClass) -> Self {
        Self {
            id,
            persistent: PersistentRef(id.0),
            class,
            local_transform: CellTransform::IDENTITY,
            local_bounds: Bounds::sphere(Vec3::ZERO, 0.0),
        }
    }
    pub fn with_transform(self, local_transform: CellTransform) -> Self {
        Self { local_transform, ..self }
    }
    pub fn with_bounds(self, local_bounds: Bounds) -> Self {
        Self { local_bounds, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composition_translates_then_rotates() {
        let parent = CellTransform::from_translation(Vec3::new(5.0, 0.0, 0.0))
            .with_rotation(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2));
        let local = CellTransform::from_translation(Vec3::new(1.0, 0.0, 0.0));
        let world = parent.mul(&local);
        assert!(world.translation.abs_diff_eq(Vec3::new(5.0, 1.0, 0.0), 1e-5));
    }

    #[test]
    fn scale_applies_to_child_offset() {
        let parent = CellTransform::from_translation(Vec3::X).with_scale(2.0);
        let local = CellTransform::from_translation(Vec3::Y).with_scale(3.0);
        let world = parent.mul(&local);
        assert_eq!(world.translation, Vec3::new(1.0, 2.0, 0.0));
        assert_eq!(world.scale, 6.0);
    }

    #[test]
    fn identity_is_neutral() {
        let t = CellTransform::from_translation(Vec3::new(1.0, 2.0, 3.0)).with_scale(0.5);
        assert!(CellTransform::IDENTITY.mul(&t).approx_eq(&t, CellTransform::EPSILON));
        assert!(t.mul(&CellTransform::IDENTITY).approx_eq(&t, CellTransform::EPSILON));
    }

    #[test]
    fn sphere_merge_contains_both() {
        let a = Bounds::sphere(Vec3::ZERO, 1.0);
        let b = Bounds::sphere(Vec3::new(4.0, 0.0, 0.0), 1.0);
        match a.merge(&b) {
            Bounds::Sphere { center, radius } => {
                assert!(center.abs_diff_eq(Vec3::new(2.0, 0.0, 0.0), 1e-5));
                assert!((radius - 3.0).abs() < 1e-5);
            }
            other => panic!("expected a sphere, got {other:?}"),
        }
        let inner = Bounds::sphere(Vec3::new(0.5, 0.0, 0.0), 0.1);
        assert_eq!(a.merge(&inner), a);
    }

    #[test]
    fn mixed_merge_is_a_box() {
        let a = Bounds::sphere(Vec3::ZERO, 1.0);
        let b = Bounds::cuboid(Vec3::new(3.0, 0.0, 0.0), Vec3::splat(1.0));
        assert_eq!(a.merge(&b), Bounds::cuboid(Vec3::new(1.5, 0.0, 0.0), Vec3::new(2.5, 1.0, 1.0)));
    }

    #[test]
    fn rotated_box_refits() {
        let b = Bounds::cuboid(Vec3::ZERO, Vec3::new(2.0, 1.0, 1.0));
        let t = CellTransform::IDENTITY.with_rotation(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2));
        match b.transformed(&t) {
            Bounds::Box { extent, .. } => assert!(extent.abs_diff_eq(Vec3::new(1.0, 2.0, 1.0), 1e-5)),
            other => panic!("expected a box, got {other:?}"),
        }
    }

    #[test]
    fn proximity_checks() {
        let b = Bounds::cuboid(Vec3::ZERO, Vec3::splat(1.0));
        assert!(b.intersects_sphere(Vec3::new(3.0, 0.0, 0.0), 2.0));
        assert!(!b.intersects_sphere(Vec3::new(3.5, 0.0, 0.0), 2.0));
        let s = Bounds::sphere(Vec3::ZERO, 1.0);
        assert!(s.intersects_sphere(Vec3::new(0.0, 2.5, 0.0), 2.0));
        assert!(!s.intersects_sphere(Vec3::new(0.0, 3.5, 0.0), 2.0));
    }
}
