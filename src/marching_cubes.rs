use crate::{
    mc_tables::{CORNER_OFFSETS, EDGE_ORIGINS, EDGE_TABLE, TRI_TABLE},
    mesh::{Mesh, Point},
    volume::MaskVolume,
};

use ndarray::ArrayView3;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Mask of shape {0:?} is too small, every axis needs at least 2 voxels")]
    TooSmall((usize, usize, usize)),

    #[error("Mask contains values other than 0 and 1")]
    NotBinary,
}

pub const DEFAULT_ISO_LEVEL: f32 = 0.5;

/// Marching cubes over a binary mask.
#[derive(Clone, Copy, Debug)]
pub struct SurfaceExtractor {
    pub iso_level: f32,
}

impl Default for SurfaceExtractor {
    fn default() -> Self {
        Self {
            iso_level: DEFAULT_ISO_LEVEL,
        }
    }
}

impl SurfaceExtractor {
    pub fn new(iso_level: f32) -> Self {
        Self { iso_level }
    }

    /// Extract the iso-surface of `mask`.
    ///
    /// The mask is read in (x, y, z) = (column, row, depth) order and vertex
    /// positions are scaled by the mask spacing, so the mesh is in
    /// millimeters. An empty or completely filled mask yields an empty mesh.
    pub fn extract(&self, mask: &MaskVolume) -> Result<Mesh, ExtractError> {
        let (depth, height, width) = mask.dim();
        if depth < 2 || height < 2 || width < 2 {
            return Err(ExtractError::TooSmall(mask.dim()));
        }
        if !mask.is_binary() {
            return Err(ExtractError::NotBinary);
        }

        let field = mask.data.view().permuted_axes([2, 1, 0]);
        let [sz, sy, sx] = mask.spacing;
        let scale = [sx as f32, sy as f32, sz as f32];

        Ok(self.march(field, scale))
    }

    fn march(&self, field: ArrayView3<'_, u8>, scale: [f32; 3]) -> Mesh {
        let (nx, ny, nz) = field.dim();
        let sample = |p: [usize; 3]| f32::from(field[p]);

        let mut vertices: Vec<Point> = Vec::new();
        let mut faces = Vec::new();
        // global edge id -> vertex index
        let mut edge_vertices: HashMap<usize, u32> = HashMap::new();

        for z in 0..nz - 1 {
            for y in 0..ny - 1 {
                for x in 0..nx - 1 {
                    let cell = [x, y, z];

                    let mut cube_index = 0;
                    for (corner, offset) in CORNER_OFFSETS.iter().enumerate() {
                        if sample(offset_by(cell, offset)) > self.iso_level {
                            cube_index |= 1 << corner;
                        }
                    }

                    let crossed = EDGE_TABLE[cube_index];
                    if crossed == 0 {
                        continue;
                    }

                    let mut cube_vertices = [0u32; 12];
                    for (edge, &(offset, axis)) in EDGE_ORIGINS.iter().enumerate() {
                        if crossed & (1 << edge) == 0 {
                            continue;
                        }

                        let start = offset_by(cell, &offset);
                        let id = ((start[0] * ny + start[1]) * nz + start[2]) * 3 + axis;
                        cube_vertices[edge] = *edge_vertices.entry(id).or_insert_with(|| {
                            let mut end = start;
                            end[axis] += 1;
                            let position = self.interpolate(start, sample(start), sample(end), axis);
                            vertices.push([
                                position[0] * scale[0],
                                position[1] * scale[1],
                                position[2] * scale[2],
                            ]);
                            (vertices.len() - 1) as u32
                        });
                    }

                    for triangle in TRI_TABLE[cube_index]
                        .chunks_exact(3)
                        .take_while(|triangle| triangle[0] >= 0)
                    {
                        faces.push([
                            cube_vertices[triangle[0] as usize],
                            cube_vertices[triangle[1] as usize],
                            cube_vertices[triangle[2] as usize],
                        ]);
                    }
                }
            }
        }

        Mesh { vertices, faces }
    }

    /// Point on the edge from `start` along `axis` where the field crosses the
    /// iso-value, in voxel units.
    #[inline]
    fn interpolate(&self, start: [usize; 3], v0: f32, v1: f32, axis: usize) -> Point {
        let t = ((self.iso_level - v0) / (v1 - v0)).clamp(0.0, 1.0);
        let mut position = start.map(|c| c as f32);
        position[axis] += t;
        position
    }
}

#[inline]
fn offset_by(cell: [usize; 3], offset: &[usize; 3]) -> [usize; 3] {
    [cell[0] + offset[0], cell[1] + offset[1], cell[2] + offset[2]]
}
