//! Line-of-sight collaborator
//!
//! The world-geometry subsystem answers whether a straight segment between two
//! points is clear. The replication scheduler treats it as a black box and
//! amortises calls because real implementations walk BSP or collision trees.

use crate::util::vec3::Vec3;

/// How far short of a blocking surface a trace stops (world units)
const TRACE_PULLBACK: f32 = 1.0;

pub trait OcclusionQuery {
    /// True when nothing blocks the segment `from` -> `to`
    fn has_unobstructed_line(&self, from: Vec3, to: Vec3) -> bool;

    /// Furthest point reachable from `from` toward `to` before hitting geometry.
    ///
    /// The default only distinguishes clear and blocked segments.
    fn trace(&self, from: Vec3, to: Vec3) -> Vec3 {
        if self.has_unobstructed_line(from, to) {
            to
        } else {
            from
        }
    }
}

/// Empty world: every line is clear
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenSpace;

impl OcclusionQuery for OpenSpace {
    #[inline]
    fn has_unobstructed_line(&self, _from: Vec3, _to: Vec3) -> bool {
        true
    }
}

/// Axis-aligned blocking volume
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(a: Vec3, b: Vec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn from_center(center: Vec3, half_extent: Vec3) -> Self {
        Self::new(center - half_extent, center + half_extent)
    }

    /// Parametric entry point of the segment into this box, if it touches it
    fn segment_entry(&self, from: Vec3, to: Vec3) -> Option<f32> {
        let dir = to - from;
        let mut t_min = 0.0f32;
        let mut t_max = 1.0f32;

        for (origin, delta, lo, hi) in [
            (from.x, dir.x, self.min.x, self.max.x),
            (from.y, dir.y, self.min.y, self.max.y),
            (from.z, dir.z, self.min.z, self.max.z),
        ] {
            if delta.abs() < f32::EPSILON {
                if origin < lo || origin > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / delta;
            let (near, far) = {
                let t1 = (lo - origin) * inv;
                let t2 = (hi - origin) * inv;
                if t1 <= t2 { (t1, t2) } else { (t2, t1) }
            };
            t_min = t_min.max(near);
            t_max = t_max.min(far);
            if t_min > t_max {
                return None;
            }
        }
        Some(t_min)
    }
}

/// World made of box blockers (level geometry stand-in for hosts and tests)
#[derive(Debug, Clone, Default)]
pub struct BoxOccluders {
    boxes: Vec<Aabb>,
}

impl BoxOccluders {
    pub fn new(boxes: Vec<Aabb>) -> Self {
        Self { boxes }
    }

    pub fn push(&mut self, aabb: Aabb) {
        self.boxes.push(aabb);
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    fn first_hit(&self, from: Vec3, to: Vec3) -> Option<f32> {
        self.boxes
            .iter()
            .filter_map(|b| b.segment_entry(from, to))
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }
}

impl OcclusionQuery for BoxOccluders {
    fn has_unobstructed_line(&self, from: Vec3, to: Vec3) -> bool {
        self.first_hit(from, to).is_none()
    }

    fn trace(&self, from: Vec3, to: Vec3) -> Vec3 {
        match self.first_hit(from, to) {
            None => to,
            Some(t) => {
                let length = (to - from).length();
                if length <= f32::EPSILON {
                    return from;
                }
                let pulled = (t - TRACE_PULLBACK / length).max(0.0);
                from.lerp(to, pulled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wall() -> BoxOccluders {
        // Thin wall across the X axis at x=100
        BoxOccluders::new(vec![Aabb::new(
            Vec3::new(95.0, -500.0, -500.0),
            Vec3::new(105.0, 500.0, 500.0),
        )])
    }

    #[test]
    fn test_open_space_always_clear() {
        assert!(OpenSpace.has_unobstructed_line(Vec3::ZERO, Vec3::new(1e6, 0.0, 0.0)));
    }

    #[test]
    fn test_wall_blocks_crossing_segment() {
        let world = wall();
        assert!(!world.has_unobstructed_line(Vec3::ZERO, Vec3::new(200.0, 0.0, 0.0)));
        assert!(world.has_unobstructed_line(Vec3::ZERO, Vec3::new(50.0, 0.0, 0.0)));
    }

    #[test]
    fn test_segment_passing_over_wall() {
        let world = wall();
        assert!(world.has_unobstructed_line(
            Vec3::new(0.0, 0.0, 600.0),
            Vec3::new(200.0, 0.0, 600.0)
        ));
    }

    #[test]
    fn test_trace_stops_before_wall() {
        let world = wall();
        let hit = world.trace(Vec3::ZERO, Vec3::new(200.0, 0.0, 0.0));
        assert!(hit.x < 95.0 && hit.x > 90.0, "trace ended at {:?}", hit);

        let clear = world.trace(Vec3::ZERO, Vec3::new(50.0, 0.0, 0.0));
        assert_eq!(clear, Vec3::new(50.0, 0.0, 0.0));
    }

    #[test]
    fn test_aabb_normalizes_corners() {
        let b = Aabb::new(Vec3::new(1.0, 1.0, 1.0), Vec3::new(-1.0, -1.0, -1.0));
        assert_eq!(b.min, Vec3::new(-1.0, -1.0, -1.0));
        assert_eq!(b.max, Vec3::new(1.0, 1.0, 1.0));
    }
}
