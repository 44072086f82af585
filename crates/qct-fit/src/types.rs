//! Core mesh data types.

use nalgebra::{Point3, Rotation3, Vector3};

use crate::error::{QctError, QctResult};

/// Tissue label attached to a vertex. Selects the measurement model table.
pub type Label = u32;

/// RGB color with 8-bit components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl VertexColor {
    /// Create a new color from RGB components.
    #[inline]
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Create a color from floating point values in [0, 1] range.
    #[inline]
    pub fn from_float(r: f32, g: f32, b: f32) -> Self {
        Self {
            r: (r.clamp(0.0, 1.0) * 255.0).round() as u8,
            g: (g.clamp(0.0, 1.0) * 255.0).round() as u8,
            b: (b.clamp(0.0, 1.0) * 255.0).round() as u8,
        }
    }

    /// Components as an array.
    #[inline]
    pub fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

/// A mesh vertex.
///
/// Coordinates are in the physical units of the volume (usually millimeters).
#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    /// 3D position.
    pub position: Point3<f64>,

    /// Unit normal, recomputed from adjacent faces during a fit.
    pub normal: Option<Vector3<f64>>,

    /// Vertex color (RGB), typically the source of the label.
    pub color: Option<VertexColor>,

    /// Tissue label.
    pub label: Option<Label>,
}

impl Vertex {
    /// Create a new vertex with only position set.
    #[inline]
    pub fn new(position: Point3<f64>) -> Self {
        Self {
            position,
            normal: None,
            color: None,
            label: None,
        }
    }

    /// Create a vertex from raw coordinates.
    #[inline]
    pub fn from_coords(x: f64, y: f64, z: f64) -> Self {
        Self::new(Point3::new(x, y, z))
    }

    /// Create a labelled vertex.
    #[inline]
    pub fn with_label(position: Point3<f64>, label: Label) -> Self {
        Self {
            label: Some(label),
            ..Self::new(position)
        }
    }
}

/// A triangle mesh with indexed vertices and faces.
///
/// Topology (the face list) is fixed during a fit. Only vertex positions
/// and normals change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    /// Vertex data.
    pub vertices: Vec<Vertex>,

    /// Triangle faces as indices into the vertex array.
    /// Each face is [v0, v1, v2] with counter-clockwise winding seen from outside.
    pub faces: Vec<[u32; 3]>,
}

impl Mesh {
    /// Create a new empty mesh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mesh with pre-allocated capacity.
    pub fn with_capacity(vertex_count: usize, face_count: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(vertex_count),
            faces: Vec::with_capacity(face_count),
        }
    }

    /// Build a mesh from raw positions and faces.
    pub fn from_parts(positions: Vec<Point3<f64>>, faces: Vec<[u32; 3]>) -> Self {
        Self {
            vertices: positions.into_iter().map(Vertex::new).collect(),
            faces,
        }
    }

    /// Number of vertices in the mesh.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of faces (triangles) in the mesh.
    #[inline]
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check if mesh is empty (no vertices or faces).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Vertex positions in index order.
    pub fn positions(&self) -> Vec<Point3<f64>> {
        self.vertices.iter().map(|v| v.position).collect()
    }

    /// Overwrite vertex positions, keeping every other attribute.
    pub fn set_positions(&mut self, positions: &[Point3<f64>]) -> QctResult<()> {
        QctError::check_len("positions", self.vertex_count(), positions.len())?;
        for (vertex, p) in self.vertices.iter_mut().zip(positions) {
            vertex.position = *p;
        }
        Ok(())
    }

    /// Vertex normals, with zero for vertices that have none.
    pub fn normals(&self) -> Vec<Vector3<f64>> {
        self.vertices
            .iter()
            .map(|v| v.normal.unwrap_or_else(Vector3::zeros))
            .collect()
    }

    /// Per-vertex labels, or `None` unless every vertex carries one.
    pub fn labels(&self) -> Option<Vec<Label>> {
        self.vertices.iter().map(|v| v.label).collect()
    }

    /// Whether every vertex has a label.
    pub fn is_labelled(&self) -> bool {
        !self.vertices.is_empty() && self.vertices.iter().all(|v| v.label.is_some())
    }

    /// Compute the axis-aligned bounding box.
    /// Returns (min_corner, max_corner) or None if mesh is empty.
    pub fn bounds(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        let first = self.vertices.first()?.position;
        let (min, max) = self.vertices[1..]
            .iter()
            .fold((first, first), |(min, max), v| {
                (min.inf(&v.position), max.sup(&v.position))
            });
        Some((min, max))
    }

    /// Center of the bounding box.
    pub fn center(&self) -> Option<Point3<f64>> {
        self.bounds().map(|(min, max)| nalgebra::center(&min, &max))
    }

    /// Get a specific triangle by face index.
    pub fn triangle(&self, face_idx: usize) -> QctResult<Triangle> {
        let [i0, i1, i2] = *self
            .faces
            .get(face_idx)
            .ok_or_else(|| QctError::triangle_out_of_range(face_idx, self.faces.len()))?;
        Ok(Triangle {
            v0: self.vertices[i0 as usize].position,
            v1: self.vertices[i1 as usize].position,
            v2: self.vertices[i2 as usize].position,
        })
    }

    /// Cartesian position of barycentric coordinates `[u, v, w]` on a triangle.
    pub fn barycentric_to_cartesian(&self, face_idx: usize, bary: [f64; 3]) -> QctResult<Point3<f64>> {
        let tri = self.triangle(face_idx)?;
        Ok(Point3::from(
            tri.v0.coords * bary[0] + tri.v1.coords * bary[1] + tri.v2.coords * bary[2],
        ))
    }

    /// Translate mesh by the given vector.
    pub fn translate(&mut self, offset: Vector3<f64>) {
        for vertex in &mut self.vertices {
            vertex.position += offset;
        }
    }

    /// Scale uniformly about a pivot point.
    pub fn scale_about(&mut self, pivot: Point3<f64>, factor: f64) {
        for vertex in &mut self.vertices {
            vertex.position = pivot + (vertex.position - pivot) * factor;
        }
    }

    /// Rotate about a pivot point. Normals rotate with the mesh.
    pub fn rotate_about(&mut self, pivot: Point3<f64>, rotation: &Rotation3<f64>) {
        for vertex in &mut self.vertices {
            vertex.position = pivot + rotation * (vertex.position - pivot);
            if let Some(n) = vertex.normal.as_mut() {
                *n = rotation * *n;
            }
        }
    }

    /// Recompute unit vertex normals.
    ///
    /// Each face normal is weighted by the corner angle it makes at the
    /// vertex. Vertices without a usable neighbourhood (isolated, or only
    /// degenerate faces) get a zero normal, which the optimizer treats as
    /// grazing incidence.
    pub fn compute_vertex_normals(&mut self) {
        let mut accum = vec![Vector3::<f64>::zeros(); self.vertices.len()];

        for face in &self.faces {
            let tri = Triangle::new(
                self.vertices[face[0] as usize].position,
                self.vertices[face[1] as usize].position,
                self.vertices[face[2] as usize].position,
            );
            let Some(normal) = tri.normal() else {
                continue;
            };
            for (corner, &vi) in tri.corner_angles().iter().zip(face) {
                accum[vi as usize] += normal * *corner;
            }
        }

        for (vertex, n) in self.vertices.iter_mut().zip(accum) {
            let len = n.norm();
            vertex.normal = Some(if len > f64::EPSILON {
                n / len
            } else {
                Vector3::zeros()
            });
        }
    }

    /// Check face indices and coordinates.
    pub fn validate(&self) -> QctResult<()> {
        if self.is_empty() {
            return Err(QctError::empty_mesh(format!(
                "{} vertices, {} faces",
                self.vertex_count(),
                self.face_count()
            )));
        }
        let n = self.vertex_count();
        for (fi, face) in self.faces.iter().enumerate() {
            if let Some(bad) = face.iter().find(|&&i| i as usize >= n) {
                return Err(QctError::invalid_input(format!(
                    "face {} references vertex {}, but mesh only has {} vertices",
                    fi, bad, n
                )));
            }
        }
        if let Some(vi) = self
            .vertices
            .iter()
            .position(|v| !v.position.coords.iter().all(|c| c.is_finite()))
        {
            return Err(QctError::invalid_input(format!(
                "vertex {} has a non-finite coordinate",
                vi
            )));
        }
        Ok(())
    }
}

/// A triangle with concrete vertex positions.
#[derive(Debug, Clone, Copy)]
pub struct Triangle {
    pub v0: Point3<f64>,
    pub v1: Point3<f64>,
    pub v2: Point3<f64>,
}

impl Triangle {
    /// Create a new triangle from three points.
    #[inline]
    pub fn new(v0: Point3<f64>, v1: Point3<f64>, v2: Point3<f64>) -> Self {
        Self { v0, v1, v2 }
    }

    /// Unnormalized face normal (right-hand rule, CCW winding).
    #[inline]
    pub fn normal_unnormalized(&self) -> Vector3<f64> {
        (self.v1 - self.v0).cross(&(self.v2 - self.v0))
    }

    /// Unit face normal, `None` for degenerate triangles.
    pub fn normal(&self) -> Option<Vector3<f64>> {
        let n = self.normal_unnormalized();
        let len_sq = n.norm_squared();
        (len_sq > f64::EPSILON * f64::EPSILON).then(|| n / len_sq.sqrt())
    }

    /// Area of the triangle.
    #[inline]
    pub fn area(&self) -> f64 {
        self.normal_unnormalized().norm() * 0.5
    }

    /// Interior angles at v0, v1, v2 in radians.
    pub fn corner_angles(&self) -> [f64; 3] {
        let angle = |a: Point3<f64>, b: Point3<f64>, c: Point3<f64>| (b - a).angle(&(c - a));
        [
            angle(self.v0, self.v1, self.v2),
            angle(self.v1, self.v2, self.v0),
            angle(self.v2, self.v0, self.v1),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_square() -> Mesh {
        Mesh::from_parts(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        )
    }

    #[test]
    fn test_flat_normals_point_up() {
        let mut mesh = unit_square();
        mesh.compute_vertex_normals();
        for v in &mesh.vertices {
            assert_relative_eq!(v.normal.unwrap(), Vector3::z(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_isolated_vertex_gets_zero_normal() {
        let mut mesh = unit_square();
        mesh.vertices.push(Vertex::from_coords(5.0, 5.0, 5.0));
        mesh.compute_vertex_normals();
        assert_eq!(mesh.vertices[4].normal, Some(Vector3::zeros()));
    }

    #[test]
    fn test_labels_require_every_vertex() {
        let mut mesh = unit_square();
        assert!(mesh.labels().is_none());
        for v in &mut mesh.vertices {
            v.label = Some(2);
        }
        assert_eq!(mesh.labels(), Some(vec![2; 4]));
        assert!(mesh.is_labelled());
    }

    #[test]
    fn test_triangle_out_of_range() {
        let mesh = unit_square();
        let err = mesh.triangle(2).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::TriangleOutOfRange);
        assert!(mesh.barycentric_to_cartesian(7, [1.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn test_barycentric_to_cartesian() {
        let mesh = unit_square();
        let p = mesh
            .barycentric_to_cartesian(0, [1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0])
            .unwrap();
        assert_relative_eq!(p, Point3::new(2.0 / 3.0, 1.0 / 3.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_bounds_and_center() {
        let mesh = unit_square();
        let (min, max) = mesh.bounds().unwrap();
        assert_eq!(min, Point3::origin());
        assert_eq!(max, Point3::new(1.0, 1.0, 0.0));
        assert_eq!(mesh.center().unwrap(), Point3::new(0.5, 0.5, 0.0));
        assert!(Mesh::new().bounds().is_none());
    }

    #[test]
    fn test_transforms_about_pivot() {
        let mut mesh = unit_square();
        let pivot = mesh.center().unwrap();
        mesh.scale_about(pivot, 2.0);
        let (min, max) = mesh.bounds().unwrap();
        assert_relative_eq!(min, Point3::new(-0.5, -0.5, 0.0));
        assert_relative_eq!(max, Point3::new(1.5, 1.5, 0.0));

        let rot = Rotation3::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2);
        mesh.rotate_about(pivot, &rot);
        assert_relative_eq!(mesh.center().unwrap(), pivot, epsilon = 1e-12);
    }

    #[test]
    fn test_validate_rejects_bad_faces() {
        let mut mesh = unit_square();
        assert!(mesh.validate().is_ok());
        mesh.faces.push([0, 1, 9]);
        assert_eq!(mesh.validate().unwrap_err().code(), crate::ErrorCode::InvalidInput);
        assert_eq!(Mesh::new().validate().unwrap_err().code(), crate::ErrorCode::EmptyMesh);
    }

    #[test]
    fn test_corner_angles_sum_to_pi() {
        let tri = Triangle::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(3.0, 0.0, 0.0),
            Point3::new(0.0, 4.0, 0.0),
        );
        let sum: f64 = tri.corner_angles().iter().sum();
        assert_relative_eq!(sum, std::f64::consts::PI, epsilon = 1e-12);
        assert_relative_eq!(tri.area(), 6.0);
    }
}
