use std::io::{self, Read, Seek, Write};

use stl_io::{Normal, Triangle, Vertex};

pub type Point = [f32; 3];

/// Indexed triangle mesh. Vertices are shared only where the extractor
/// produced the same edge intersection twice.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Point>,
    pub faces: Vec<[u32; 3]>,
}

impl Mesh {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Faces with their vertex positions resolved.
    pub fn triangles(&self) -> impl ExactSizeIterator<Item = [Point; 3]> + '_ {
        self.faces
            .iter()
            .map(|face| face.map(|index| self.vertices[index as usize]))
    }

    /// Axis aligned bounds of all referenced vertices.
    pub fn bounds(&self) -> Option<(Point, Point)> {
        self.triangles().flatten().fold(None, |bounds, p| {
            let (mut min, mut max) = bounds.unwrap_or((p, p));
            for i in 0..3 {
                min[i] = min[i].min(p[i]);
                max[i] = max[i].max(p[i]);
            }
            Some((min, max))
        })
    }

    /// Volume enclosed by the mesh, positive when faces wind outwards.
    pub fn signed_volume(&self) -> f64 {
        self.triangles()
            .map(|[a, b, c]| {
                let [a, b, c] = [a, b, c].map(|p| p.map(f64::from));
                let cross = [
                    b[1] * c[2] - b[2] * c[1],
                    b[2] * c[0] - b[0] * c[2],
                    b[0] * c[1] - b[1] * c[0],
                ];
                (a[0] * cross[0] + a[1] * cross[1] + a[2] * cross[2]) / 6.0
            })
            .sum()
    }
}

/// Unit normal following the right-hand rule, zero for degenerate triangles.
pub fn facet_normal(triangle: &[Point; 3]) -> Point {
    let [a, b, c] = triangle;
    let ab = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let ac = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let n = [
        ab[1] * ac[2] - ab[2] * ac[1],
        ab[2] * ac[0] - ab[0] * ac[2],
        ab[0] * ac[1] - ab[1] * ac[0],
    ];
    let len2 = n[0] * n[0] + n[1] * n[1] + n[2] * n[2];
    if len2 <= f32::EPSILON * f32::EPSILON {
        return [0.0; 3];
    }
    let inv_len = 1.0 / len2.sqrt();
    n.map(|v| v * inv_len)
}

/// Write `mesh` as binary STL: a triangle soup with per-facet normals.
pub fn write_stl<W: Write>(mesh: &Mesh, writer: &mut W) -> io::Result<()> {
    let triangles: Vec<Triangle> = mesh
        .triangles()
        .map(|triangle| Triangle {
            normal: Normal::new(facet_normal(&triangle)),
            vertices: triangle.map(Vertex::new),
        })
        .collect();
    stl_io::write_stl(writer, triangles.iter())
}

pub fn to_stl_bytes(mesh: &Mesh) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(84 + mesh.face_count() * 50);
    write_stl(mesh, &mut bytes)?;
    Ok(bytes)
}

/// Read an STL file back as a triangle soup.
pub fn read_stl<R: Read + Seek>(reader: &mut R) -> io::Result<Vec<[Point; 3]>> {
    stl_io::create_stl_reader(reader)?
        .map(|triangle| triangle.map(|t| t.vertices.map(<[f32; 3]>::from)))
        .collect()
}
