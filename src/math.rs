// Small vector types used by the app.
//
// Plain glam re-exports; every type defaults to all zeros.

#[allow(unused_imports)]
pub use glam::{DVec2, DVec3, DVec4, Vec2, Vec3, Vec4};

/// RGBA clear colour from the config array
pub fn color(rgba: [f32; 4]) -> Vec4 {
    Vec4::from_array(rgba)
}
