//! Vertex and uniform records for the triangle, plus the per-frame
//! transform.

use std::mem::offset_of;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use tritex_vk::ash::vk;
use tritex_vk::pipeline::{Vertex, VertexAttribute, VertexInputDesc};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TexturedVertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex for TexturedVertex {
    fn input_desc() -> VertexInputDesc {
        VertexInputDesc {
            stride: size_of::<Self>() as u32,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: offset_of!(Self, position) as u32,
                },
                VertexAttribute {
                    location: 1,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: offset_of!(Self, color) as u32,
                },
                VertexAttribute {
                    location: 2,
                    format: vk::Format::R32G32_SFLOAT,
                    offset: offset_of!(Self, uv) as u32,
                },
            ],
        }
    }
}

/// Counter-clockwise in model space.
pub const TRIANGLE_VERTICES: [TexturedVertex; 3] = [
    TexturedVertex {
        position: [0.0, 0.5, 0.0],
        color: [1.0, 0.0, 0.0],
        uv: [0.5, 0.0],
    },
    TexturedVertex {
        position: [-0.5, -0.5, 0.0],
        color: [0.0, 1.0, 0.0],
        uv: [0.0, 1.0],
    },
    TexturedVertex {
        position: [0.5, -0.5, 0.0],
        color: [0.0, 0.0, 1.0],
        uv: [1.0, 1.0],
    },
];

pub const TRIANGLE_INDICES: [u16; 3] = [0, 1, 2];

/// Matches the `Transforms` constant buffer in `triangle.slang`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Transforms {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

/// Inputs recomputed every frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameState {
    pub seconds: f32,
    pub extent: vk::Extent2D,
}

const RADIANS_PER_SECOND: f32 = std::f32::consts::FRAC_PI_2;

impl FrameState {
    pub fn transforms(&self) -> Transforms {
        let model = Mat4::from_rotation_z(self.seconds * RADIANS_PER_SECOND);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 2.0), Vec3::ZERO, Vec3::Y);
        let aspect = self.extent.width as f32 / self.extent.height.max(1) as f32;
        let mut proj =
            Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has +Y pointing down.
        proj.y_axis.y *= -1.0;
        Transforms { model, view, proj }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn attributes_cover_the_vertex_without_overlap() {
        let desc = TexturedVertex::input_desc();
        assert_eq!(desc.stride, 32);
        let offsets: Vec<u32> = desc.attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
        let locations: Vec<u32> =
            desc.attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 1, 2]);
    }

    #[test]
    fn transforms_are_tightly_packed_matrices() {
        assert_eq!(size_of::<Transforms>(), 3 * 64);
    }

    #[test]
    fn triangle_faces_the_camera_counter_clockwise() {
        let state = FrameState {
            seconds: 0.0,
            extent: vk::Extent2D {
                width: 1600,
                height: 900,
            },
        };
        let t = state.transforms();
        let clip = |v: &TexturedVertex| {
            let p = t.proj * t.view * t.model * Vec4::from((Vec3::from(v.position), 1.0));
            glam::Vec2::new(p.x / p.w, p.y / p.w)
        };
        let [a, b, c] = TRIANGLE_VERTICES.map(|v| clip(&v));
        // Y is flipped in clip space, so counter-clockwise in model space
        // becomes clockwise here.
        let signed_area = (b - a).perp_dot(c - a);
        assert!(signed_area < 0.0);
        assert!(TRIANGLE_INDICES.iter().all(|&i| (i as usize) < TRIANGLE_VERTICES.len()));
    }

    #[test]
    fn zero_height_does_not_divide_by_zero() {
        let state = FrameState {
            seconds: 1.0,
            extent: vk::Extent2D {
                width: 10,
                height: 0,
            },
        };
        assert!(state.transforms().proj.is_finite());
    }
}
