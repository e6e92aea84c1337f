//! Spatial attributes for positioned voices.

use serde::{Deserialize, Serialize};

/// Column-major 4x4 transform, the only matrix shape the draw-context seam
/// understands.
pub type Mat4 = [[f32; 4]; 4];

/// Position, orientation, and size of a positioned voice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// World position (x, y, z). The listener sits at the origin.
    pub position: [f32; 3],
    /// Orientation quaternion (x, y, z, w).
    pub orientation: [f32; 4],
    /// Uniform scale.
    pub size: f32,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            orientation: [0.0, 0.0, 0.0, 1.0],
            size: 1.0,
        }
    }
}

impl Pose {
    /// Distance from the listener at the origin.
    pub fn distance(&self) -> f32 {
        let [x, y, z] = self.position;
        (x * x + y * y + z * z).sqrt()
    }

    /// Translation + uniform-scale transform for the graphics hook.
    /// Orientation is applied by the voice's own drawing code.
    pub fn transform(&self) -> Mat4 {
        let s = self.size;
        let [x, y, z] = self.position;
        [
            [s, 0.0, 0.0, 0.0],
            [0.0, s, 0.0, 0.0],
            [0.0, 0.0, s, 0.0],
            [x, y, z, 1.0],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_from_origin() {
        let pose = Pose {
            position: [3.0, 4.0, 0.0],
            ..Default::default()
        };
        assert_eq!(pose.distance(), 5.0);
    }
}
