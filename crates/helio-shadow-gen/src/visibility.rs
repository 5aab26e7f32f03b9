//! Light cameras, bounds and shadow caster/receiver gathering

use crate::device::CameraState;
use glam::{Mat4, Vec3, Vec4};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Inverted box that any union replaces
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: &[Vec3]) -> Self {
        points.iter().fold(Self::EMPTY, |acc, &p| Aabb {
            min: acc.min.min(p),
            max: acc.max.max(p),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extents(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Overlap in x and y only
    pub fn intersects_xy(&self, other: &Aabb) -> bool {
        self.min.truncate().cmple(other.max.truncate()).all()
            && self.max.truncate().cmpge(other.min.truncate()).all()
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn intersection(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    pub fn corners(&self) -> [Vec3; 8] {
        [
            Vec3::new(self.min.x, self.min.y, self.min.z),
            Vec3::new(self.max.x, self.min.y, self.min.z),
            Vec3::new(self.min.x, self.max.y, self.min.z),
            Vec3::new(self.max.x, self.max.y, self.min.z),
            Vec3::new(self.min.x, self.min.y, self.max.z),
            Vec3::new(self.max.x, self.min.y, self.max.z),
            Vec3::new(self.min.x, self.max.y, self.max.z),
            Vec3::new(self.max.x, self.max.y, self.max.z),
        ]
    }

    pub fn transform(&self, matrix: &Mat4) -> Aabb {
        let corners = self.corners().map(|c| matrix.transform_point3(c));
        Self::from_points(&corners)
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// View frustum planes plus world-space corners
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
    pub planes: [Vec4; 6],
    pub corners: [Vec3; 8],
}

impl Frustum {
    /// Planes for a 0..1 depth range projection
    pub fn from_matrix(view_projection: Mat4) -> Self {
        let m = view_projection;
        let mut planes = [
            m.row(3) + m.row(0), // Left
            m.row(3) - m.row(0), // Right
            m.row(3) + m.row(1), // Bottom
            m.row(3) - m.row(1), // Top
            m.row(2),            // Near
            m.row(3) - m.row(2), // Far
        ];
        for plane in &mut planes {
            let length = plane.truncate().length();
            if length > 0.0 {
                *plane /= length;
            }
        }

        let inverse = m.inverse();
        let mut corners = [Vec3::ZERO; 8];
        for (i, corner) in corners.iter_mut().enumerate() {
            let ndc = Vec3::new(
                if i & 1 == 0 { -1.0 } else { 1.0 },
                if i & 2 == 0 { -1.0 } else { 1.0 },
                if i & 4 == 0 { 0.0 } else { 1.0 },
            );
            *corner = inverse.project_point3(ndc);
        }

        Self { planes, corners }
    }

    pub fn test_aabb(&self, aabb: &Aabb) -> bool {
        self.planes.iter().all(|plane| {
            let p = Vec3::new(
                if plane.x > 0.0 { aabb.max.x } else { aabb.min.x },
                if plane.y > 0.0 { aabb.max.y } else { aabb.min.y },
                if plane.z > 0.0 { aabb.max.z } else { aabb.min.z },
            );
            plane.dot(p.extend(1.0)) >= 0.0
        })
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(&self.corners)
    }

    /// Radius of the sphere around the corner centroid
    pub fn bounding_radius(&self) -> f32 {
        let center = self.corners.iter().copied().sum::<Vec3>() / 8.0;
        self.corners
            .iter()
            .map(|c| c.distance(center))
            .fold(0.0, f32::max)
    }
}

/// The camera the scene is viewed through
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneCamera {
    pub position: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl SceneCamera {
    pub fn new(position: Vec3, forward: Vec3, fov_y: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            position,
            forward: normalize_or(forward, Vec3::NEG_Z),
            up: Vec3::Y,
            fov_y,
            aspect,
            near,
            far,
        }
    }

    /// Same camera clipped to a depth slice
    pub fn with_clip(&self, near: f32, far: f32) -> Self {
        Self { near, far, ..*self }
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward, self.up)
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection() * self.view()
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_matrix(self.view_projection())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LightKind {
    Directional,
    Spot { outer_angle: f32 },
    Point,
}

/// The light a generator casts shadows for
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShadowLight {
    pub kind: LightKind,
    pub position: Vec3,
    pub direction: Vec3,
    pub range: f32,
    pub color: Vec3,
    /// Multiplier applied to the color in HDR pipelines, 1.0 otherwise
    pub hdr_scale: f32,
    /// Frame the light was last moved or edited
    pub last_modified: u64,
}

impl ShadowLight {
    pub fn directional(direction: Vec3, color: Vec3) -> Self {
        Self {
            kind: LightKind::Directional,
            position: Vec3::ZERO,
            direction: normalize_or(direction, Vec3::NEG_Y),
            range: f32::MAX,
            color,
            hdr_scale: 1.0,
            last_modified: 0,
        }
    }

    pub fn spot(position: Vec3, direction: Vec3, outer_angle: f32, range: f32, color: Vec3) -> Self {
        Self {
            kind: LightKind::Spot { outer_angle },
            position,
            direction: normalize_or(direction, Vec3::NEG_Y),
            range,
            ..Self::directional(direction, color)
        }
    }

    pub fn point(position: Vec3, range: f32, color: Vec3) -> Self {
        Self {
            kind: LightKind::Point,
            position,
            range,
            ..Self::directional(Vec3::NEG_Y, color)
        }
    }
}

#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

/// Object as seen by shadow gathering
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneObject {
    pub id: ObjectId,
    pub bounds: Aabb,
    pub casts_shadows: bool,
    pub receives_shadows: bool,
    /// Frame the object was last moved, animated or edited
    pub last_modified: u64,
}

/// Object source supplied by the scene graph
pub trait ShadowScene {
    /// Current frame counter
    fn frame(&self) -> u64;

    fn objects(&self) -> &[SceneObject];

    fn get(&self, id: ObjectId) -> Option<&SceneObject> {
        self.objects().iter().find(|o| o.id == id)
    }
}

/// Projection a generator renders its depth from
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightCamera {
    pub view: Mat4,
    pub projection: Mat4,
    pub near: f32,
    pub far: f32,
    pub orthographic: bool,
}

impl LightCamera {
    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_matrix(self.view_projection())
    }

    pub fn depth_range(&self) -> f32 {
        (self.far - self.near).max(f32::EPSILON)
    }

    pub fn state(&self) -> CameraState {
        CameraState {
            view: self.view,
            projection: self.projection,
        }
    }
}

fn normalize_or(v: Vec3, fallback: Vec3) -> Vec3 {
    let n = v.normalize_or_zero();
    if n == Vec3::ZERO {
        fallback
    } else {
        n
    }
}

fn up_for(direction: Vec3) -> Vec3 {
    if direction.y.abs() > 0.99 {
        Vec3::Z
    } else {
        Vec3::Y
    }
}

const CUBE_FACES: [(Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::NEG_Y),
    (Vec3::NEG_X, Vec3::NEG_Y),
    (Vec3::Y, Vec3::Z),
    (Vec3::NEG_Y, Vec3::NEG_Z),
    (Vec3::Z, Vec3::NEG_Y),
    (Vec3::NEG_Z, Vec3::NEG_Y),
];

/// View matrix from the light. `face` selects the cube face for point lights.
pub fn light_view(light: &ShadowLight, face: usize) -> Mat4 {
    match light.kind {
        LightKind::Directional => Mat4::look_to_rh(Vec3::ZERO, light.direction, up_for(light.direction)),
        LightKind::Spot { .. } => Mat4::look_to_rh(light.position, light.direction, up_for(light.direction)),
        LightKind::Point => {
            let (dir, up) = CUBE_FACES[face % 6];
            Mat4::look_to_rh(light.position, dir, up)
        }
    }
}

/// Perspective camera for spot lights and point light faces
pub fn perspective_camera(light: &ShadowLight, face: usize) -> LightCamera {
    let fov = match light.kind {
        LightKind::Spot { outer_angle } => (outer_angle * 2.0).clamp(0.01, std::f32::consts::PI - 0.01),
        _ => std::f32::consts::FRAC_PI_2,
    };
    let far = light.range.max(0.02);
    let near = (far * 0.001).max(0.01);
    LightCamera {
        view: light_view(light, face),
        projection: Mat4::perspective_rh(fov, 1.0, near, far),
        near,
        far,
        orthographic: false,
    }
}

/// Ortho camera fitted around receivers in light space, pulled towards the
/// light far enough to include every caster.
pub fn fit_ortho(view: Mat4, casters: &Aabb, receivers: &Aabb) -> LightCamera {
    let casters_v = casters.transform(&view);
    let receivers_v = receivers.transform(&view);

    // View looks down -z, distances are -z
    let near = -casters_v.max.z;
    let far = (-receivers_v.min.z).max(near + 0.01);
    LightCamera {
        view,
        projection: Mat4::orthographic_rh(
            receivers_v.min.x,
            receivers_v.max.x,
            receivers_v.min.y,
            receivers_v.max.y,
            near,
            far,
        ),
        near,
        far,
        orthographic: true,
    }
}

/// Ortho camera around a split's bounding sphere, snapped to whole texels so
/// the fit does not shimmer as the camera turns.
pub fn fit_ortho_stable(
    view: Mat4,
    casters: &Aabb,
    split: &Frustum,
    sphere_radius: f32,
    resolution: u32,
    filter_radius: f32,
) -> LightCamera {
    let split_v = Aabb::from_points(&split.corners.map(|c| view.transform_point3(c)));
    let casters_v = casters.transform(&view);
    let centroid = split.corners.iter().copied().sum::<Vec3>() / 8.0;
    let center = view.transform_point3(centroid);

    let size = resolution.max(1) as f32;
    let border = ((filter_radius - 1.0) * 0.5).max(0.0);
    let window = sphere_radius * 2.0 * (size + border) / size;
    let texel = window / size;
    let cx = center.x - center.x % texel;
    let cy = center.y - center.y % texel;
    let half = window * 0.5;

    let near = -casters_v.max.z.max(split_v.max.z);
    let far = (-split_v.min.z).max(near + 0.01);
    LightCamera {
        view,
        projection: Mat4::orthographic_rh(cx - half, cx + half, cy - half, cy + half, near, far),
        near,
        far,
        orthographic: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box(center: Vec3) -> Aabb {
        Aabb::new(center - Vec3::splat(0.5), center + Vec3::splat(0.5))
    }

    #[test]
    fn frustum_contains_box_in_front() {
        let camera = SceneCamera::new(Vec3::ZERO, Vec3::NEG_Z, 1.0, 1.0, 0.1, 100.0);
        let frustum = camera.frustum();
        assert!(frustum.test_aabb(&unit_box(Vec3::new(0.0, 0.0, -10.0))));
        assert!(!frustum.test_aabb(&unit_box(Vec3::new(0.0, 0.0, 10.0))));
        assert!(!frustum.test_aabb(&unit_box(Vec3::new(0.0, 0.0, -200.0))));
    }

    #[test]
    fn ortho_fit_covers_receivers() {
        let light = ShadowLight::directional(Vec3::NEG_Y, Vec3::ONE);
        let view = light_view(&light, 0);
        let receivers = Aabb::new(Vec3::new(-5.0, -1.0, -5.0), Vec3::new(5.0, 0.0, 5.0));
        let casters = unit_box(Vec3::new(0.0, 3.0, 0.0));
        let camera = fit_ortho(view, &casters, &receivers);

        let vp = camera.view_projection();
        for corner in receivers.corners() {
            let ndc = vp.project_point3(corner);
            assert!(ndc.x.abs() <= 1.0 + 1e-4 && ndc.y.abs() <= 1.0 + 1e-4);
            assert!(ndc.z >= -1e-4 && ndc.z <= 1.0 + 1e-4);
        }
        let top = vp.project_point3(Vec3::new(0.0, 3.5, 0.0));
        assert!(top.z.abs() < 1e-3);
    }

    #[test]
    fn stable_fit_snaps_to_texels() {
        let light = ShadowLight::directional(Vec3::new(-1.0, -1.0, 0.0), Vec3::ONE);
        let view = light_view(&light, 0);
        let camera = SceneCamera::new(Vec3::new(0.3, 2.0, 0.7), Vec3::NEG_Z, 1.0, 1.0, 0.1, 20.0);
        let split = camera.frustum();
        let radius = split.bounding_radius();
        let fit = fit_ortho_stable(view, &Aabb::EMPTY.union(&split.bounds()), &split, radius, 512, 1.0);

        let window = radius * 2.0;
        let texel = window / 512.0;
        // Translation column of an ortho projection: -(l+r)/(r-l)
        let center_x = -fit.projection.w_axis.x * window * 0.5;
        let snapped = (center_x / texel).round() * texel;
        assert!((center_x - snapped).abs() < texel * 1e-2);
    }

    #[test]
    fn bounding_radius_reaches_every_corner() {
        let camera = SceneCamera::new(Vec3::ZERO, Vec3::NEG_Z, 1.2, 1.5, 1.0, 10.0);
        let frustum = camera.frustum();
        let center = frustum.corners.iter().copied().sum::<Vec3>() / 8.0;
        let radius = frustum.bounding_radius();
        for corner in frustum.corners {
            assert!(corner.distance(center) <= radius + 1e-4);
        }
    }
}
