//! Mesh file I/O for OBJ, PLY and STL, plus per-vertex label files.
//!
//! Labels travel either as vertex colours (mapped through a
//! [`ColorToLabelMap`]) or as a plain text file with one integer per line.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::color_map::{ColorToLabelMap, unpack};
use crate::error::{QctError, QctResult};
use crate::tracing_ext::{log_io_operation, log_mesh_stats};
use crate::types::{Label, Mesh, Vertex, VertexColor};

/// Supported mesh file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshFormat {
    Obj,
    Ply,
    Stl,
}

impl MeshFormat {
    /// Detect format from file extension.
    pub fn from_path(path: &Path) -> QctResult<Self> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase());
        match ext.as_deref() {
            Some("obj") => Ok(Self::Obj),
            Some("ply") => Ok(Self::Ply),
            Some("stl") => Ok(Self::Stl),
            _ => Err(QctError::unsupported_format("mesh", path)),
        }
    }
}

/// Load a mesh, auto-detecting the format from the extension.
pub fn load_mesh(path: impl AsRef<Path>) -> QctResult<Mesh> {
    let path = path.as_ref();
    let format = MeshFormat::from_path(path)?;
    debug!(target: "qct_fit::io", ?path, ?format, "Loading mesh");

    let mesh = match format {
        MeshFormat::Obj => load_obj(path)?,
        MeshFormat::Ply => load_ply(path)?,
        MeshFormat::Stl => load_stl(path)?,
    };

    if mesh.is_empty() {
        return Err(QctError::empty_mesh(format!(
            "{} has {} vertices and {} faces",
            path.display(),
            mesh.vertex_count(),
            mesh.face_count()
        )));
    }
    mesh.validate()?;

    log_io_operation("load", path, "mesh", true);
    log_mesh_stats(&mesh, "loaded");
    Ok(mesh)
}

/// Load a mesh and derive labels from its vertex colours.
pub fn load_mesh_with_labels(path: impl AsRef<Path>, map: &ColorToLabelMap) -> QctResult<Mesh> {
    let path = path.as_ref();
    let mut mesh = load_mesh(path)?;
    if let Some(vi) = mesh.vertices.iter().position(|v| v.color.is_none()) {
        return Err(QctError::invalid_file(
            path,
            format!("vertex {} has no colour to derive a label from", vi),
        ));
    }
    for vertex in &mut mesh.vertices {
        vertex.label = vertex.color.map(|c| map.label(c));
    }
    Ok(mesh)
}

/// Read a label file: one integer per line, blank lines and `#` comments
/// ignored.
pub fn load_labels(path: impl AsRef<Path>) -> QctResult<Vec<Label>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| QctError::io_read(path, e))?;
    let mut labels = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let label = line.parse::<Label>().map_err(|e| {
            QctError::parse_error(path, format!("line {}: '{}' is not a label ({})", n + 1, line, e))
        })?;
        labels.push(label);
    }
    log_io_operation("load", path, "labels", true);
    Ok(labels)
}

/// Attach one label per vertex.
pub fn apply_labels(mesh: &mut Mesh, labels: &[Label]) -> QctResult<()> {
    QctError::check_len("labels", mesh.vertex_count(), labels.len())?;
    for (vertex, &label) in mesh.vertices.iter_mut().zip(labels) {
        vertex.label = Some(label);
    }
    Ok(())
}

fn load_stl(path: &Path) -> QctResult<Mesh> {
    let file = File::open(path).map_err(|e| QctError::io_read(path, e))?;
    let mut reader = BufReader::new(file);
    let stl =
        stl_io::read_stl(&mut reader).map_err(|e| QctError::parse_error(path, e.to_string()))?;

    let mut mesh = Mesh::with_capacity(stl.vertices.len(), stl.faces.len());
    for v in &stl.vertices {
        mesh.vertices
            .push(Vertex::from_coords(v.0[0] as f64, v.0[1] as f64, v.0[2] as f64));
    }
    let mut degenerate = 0;
    for face in &stl.faces {
        let [a, b, c] = face.vertices;
        if a == b || b == c || a == c {
            degenerate += 1;
            continue;
        }
        mesh.faces.push([a as u32, b as u32, c as u32]);
    }
    if degenerate > 0 {
        warn!(target: "qct_fit::io", degenerate, "Skipped degenerate STL triangles");
    }
    Ok(mesh)
}

fn load_obj(path: &Path) -> QctResult<Mesh> {
    let (models, _materials) = tobj::load_obj(
        path,
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        },
    )
    .map_err(|e| QctError::parse_error(path, e.to_string()))?;

    let mut mesh = Mesh::new();
    for model in &models {
        let offset = mesh.vertices.len() as u32;
        let obj = &model.mesh;
        let colored = obj.vertex_color.len() == obj.positions.len();

        for (i, p) in obj.positions.chunks_exact(3).enumerate() {
            let mut vertex = Vertex::from_coords(p[0] as f64, p[1] as f64, p[2] as f64);
            if colored {
                let c = &obj.vertex_color[3 * i..3 * i + 3];
                vertex.color = Some(VertexColor::from_float(c[0], c[1], c[2]));
            }
            mesh.vertices.push(vertex);
        }
        for f in obj.indices.chunks_exact(3) {
            mesh.faces.push([f[0] + offset, f[1] + offset, f[2] + offset]);
        }
    }
    debug!(
        target: "qct_fit::io",
        models = models.len(),
        vertices = mesh.vertex_count(),
        "OBJ parsed"
    );
    Ok(mesh)
}

fn load_ply(path: &Path) -> QctResult<Mesh> {
    use ply_rs::parser::Parser;
    use ply_rs::ply::{DefaultElement, Property};

    let file = File::open(path).map_err(|e| QctError::io_read(path, e))?;
    let mut reader = BufReader::new(file);
    let ply = Parser::<DefaultElement>::new()
        .read_ply(&mut reader)
        .map_err(|e| QctError::parse_error(path, format!("PLY parse error: {:?}", e)))?;

    let mut mesh = Mesh::new();
    if let Some(vertices) = ply.payload.get("vertex") {
        for element in vertices {
            let x = ply_float(element.get("x"), "x", path)?;
            let y = ply_float(element.get("y"), "y", path)?;
            let z = ply_float(element.get("z"), "z", path)?;
            let mut vertex = Vertex::from_coords(x, y, z);
            if let (Some(r), Some(g), Some(b)) = (
                ply_u8(element.get("red")),
                ply_u8(element.get("green")),
                ply_u8(element.get("blue")),
            ) {
                vertex.color = Some(VertexColor::new(r, g, b));
            }
            mesh.vertices.push(vertex);
        }
    }

    if let Some(faces) = ply.payload.get("face") {
        for element in faces {
            let indices: Vec<u32> = match element
                .get("vertex_indices")
                .or_else(|| element.get("vertex_index"))
            {
                Some(Property::ListInt(v)) => v.iter().map(|&i| i as u32).collect(),
                Some(Property::ListUInt(v)) => v.clone(),
                Some(Property::ListUChar(v)) => v.iter().map(|&i| i as u32).collect(),
                Some(Property::ListUShort(v)) => v.iter().map(|&i| i as u32).collect(),
                _ => {
                    return Err(QctError::parse_error(path, "face without vertex_indices"));
                }
            };
            // fan-triangulate polygons
            for i in 1..indices.len().saturating_sub(1) {
                mesh.faces.push([indices[0], indices[i], indices[i + 1]]);
            }
        }
    }
    Ok(mesh)
}

fn ply_float(prop: Option<&ply_rs::ply::Property>, name: &str, path: &Path) -> QctResult<f64> {
    use ply_rs::ply::Property;

    match prop {
        Some(Property::Float(v)) => Ok(*v as f64),
        Some(Property::Double(v)) => Ok(*v),
        Some(Property::Int(v)) => Ok(*v as f64),
        Some(Property::UInt(v)) => Ok(*v as f64),
        Some(Property::Short(v)) => Ok(*v as f64),
        Some(Property::UShort(v)) => Ok(*v as f64),
        Some(Property::Char(v)) => Ok(*v as f64),
        Some(Property::UChar(v)) => Ok(*v as f64),
        _ => Err(QctError::parse_error(
            path,
            format!("missing or invalid PLY property '{}'", name),
        )),
    }
}

fn ply_u8(prop: Option<&ply_rs::ply::Property>) -> Option<u8> {
    use ply_rs::ply::Property;

    match prop? {
        Property::UChar(v) => Some(*v),
        Property::Char(v) => Some((*v).max(0) as u8),
        Property::UShort(v) => Some((*v).min(255) as u8),
        Property::Short(v) => Some((*v).clamp(0, 255) as u8),
        Property::UInt(v) => Some((*v).min(255) as u8),
        Property::Int(v) => Some((*v).clamp(0, 255) as u8),
        Property::Float(v) => Some((v * 255.0).clamp(0.0, 255.0).round() as u8),
        Property::Double(v) => Some((v * 255.0).clamp(0.0, 255.0).round() as u8),
        _ => None,
    }
}

/// Save a mesh, choosing the format from the extension.
pub fn save_mesh(mesh: &Mesh, path: impl AsRef<Path>) -> QctResult<()> {
    let path = path.as_ref();
    match MeshFormat::from_path(path)? {
        MeshFormat::Obj => save_obj(mesh, path),
        MeshFormat::Ply => save_ply(mesh, path),
        MeshFormat::Stl => save_stl(mesh, path),
    }?;
    log_io_operation("save", path, "mesh", true);
    info!(
        target: "qct_fit::io",
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        path = %path.display(),
        "Mesh saved"
    );
    Ok(())
}

/// Colour written for a vertex: its own, else its packed label.
fn output_color(vertex: &Vertex) -> Option<VertexColor> {
    vertex.color.or_else(|| vertex.label.map(unpack))
}

fn save_obj(mesh: &Mesh, path: &Path) -> QctResult<()> {
    let file = File::create(path).map_err(|e| QctError::io_write(path, e))?;
    let mut w = BufWriter::new(file);
    let err = |e| QctError::io_write(path, e);

    let colored = mesh.vertices.iter().all(|v| output_color(v).is_some());
    writeln!(w, "# {} vertices, {} faces", mesh.vertex_count(), mesh.face_count()).map_err(err)?;
    for v in &mesh.vertices {
        let p = v.position;
        let line = match output_color(v).filter(|_| colored) {
            Some(c) => writeln!(
                w,
                "v {:.6} {:.6} {:.6} {:.6} {:.6} {:.6}",
                p.x,
                p.y,
                p.z,
                c.r as f64 / 255.0,
                c.g as f64 / 255.0,
                c.b as f64 / 255.0
            ),
            None => writeln!(w, "v {:.6} {:.6} {:.6}", p.x, p.y, p.z),
        };
        line.map_err(err)?;
    }
    for f in &mesh.faces {
        writeln!(w, "f {} {} {}", f[0] + 1, f[1] + 1, f[2] + 1).map_err(err)?;
    }
    w.flush().map_err(err)
}

fn save_ply(mesh: &Mesh, path: &Path) -> QctResult<()> {
    use ply_rs::ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    };
    use ply_rs::writer::Writer;

    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = Encoding::Ascii;

    let colored = mesh.vertices.iter().all(|v| output_color(v).is_some());
    let mut vertex_def = ElementDef::new("vertex".to_string());
    for name in ["x", "y", "z"] {
        vertex_def.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::Double),
        ));
    }
    if colored {
        for name in ["red", "green", "blue"] {
            vertex_def.properties.add(PropertyDef::new(
                name.to_string(),
                PropertyType::Scalar(ScalarType::UChar),
            ));
        }
    }
    ply.header.elements.add(vertex_def);

    let mut face_def = ElementDef::new("face".to_string());
    face_def.properties.add(PropertyDef::new(
        "vertex_indices".to_string(),
        PropertyType::List(ScalarType::UChar, ScalarType::Int),
    ));
    ply.header.elements.add(face_def);

    let vertices = mesh
        .vertices
        .iter()
        .map(|v| {
            let mut element = DefaultElement::new();
            element.insert("x".to_string(), Property::Double(v.position.x));
            element.insert("y".to_string(), Property::Double(v.position.y));
            element.insert("z".to_string(), Property::Double(v.position.z));
            if let Some(c) = output_color(v).filter(|_| colored) {
                element.insert("red".to_string(), Property::UChar(c.r));
                element.insert("green".to_string(), Property::UChar(c.g));
                element.insert("blue".to_string(), Property::UChar(c.b));
            }
            element
        })
        .collect();
    ply.payload.insert("vertex".to_string(), vertices);

    let faces = mesh
        .faces
        .iter()
        .map(|f| {
            let mut element = DefaultElement::new();
            element.insert(
                "vertex_indices".to_string(),
                Property::ListInt(f.iter().map(|&i| i as i32).collect()),
            );
            element
        })
        .collect();
    ply.payload.insert("face".to_string(), faces);

    ply.make_consistent().map_err(|e| {
        QctError::io_write(path, std::io::Error::other(format!("PLY consistency error: {:?}", e)))
    })?;

    let file = File::create(path).map_err(|e| QctError::io_write(path, e))?;
    let mut w = BufWriter::new(file);
    Writer::new()
        .write_ply(&mut w, &mut ply)
        .map_err(|e| QctError::io_write(path, e))?;
    w.flush().map_err(|e| QctError::io_write(path, e))
}

fn save_stl(mesh: &Mesh, path: &Path) -> QctResult<()> {
    let triangles: Vec<stl_io::Triangle> = mesh
        .faces
        .iter()
        .map(|&[a, b, c]| {
            let vertex = |i: u32| {
                let p = mesh.vertices[i as usize].position;
                stl_io::Vertex::new([p.x as f32, p.y as f32, p.z as f32])
            };
            stl_io::Triangle {
                normal: stl_io::Normal::new([0.0, 0.0, 0.0]),
                vertices: [vertex(a), vertex(b), vertex(c)],
            }
        })
        .collect();

    let file = File::create(path).map_err(|e| QctError::io_write(path, e))?;
    let mut w = BufWriter::new(file);
    stl_io::write_stl(&mut w, triangles.iter()).map_err(|e| QctError::io_write(path, e))?;
    w.flush().map_err(|e| QctError::io_write(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color_map::ColorTable;
    use crate::test_support::hexagon_patch;
    use nalgebra::Point3;
    use tempfile::{NamedTempFile, TempDir};

    fn labelled_patch() -> Mesh {
        let mut mesh = hexagon_patch(Point3::new(1.0, 2.0, 3.0), 2.0);
        for (i, v) in mesh.vertices.iter_mut().enumerate() {
            v.label = Some(i as Label % 3);
        }
        mesh
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(MeshFormat::from_path(Path::new("a.OBJ")).unwrap(), MeshFormat::Obj);
        assert_eq!(MeshFormat::from_path(Path::new("a.ply")).unwrap(), MeshFormat::Ply);
        assert_eq!(MeshFormat::from_path(Path::new("a.stl")).unwrap(), MeshFormat::Stl);
        let err = MeshFormat::from_path(Path::new("a.off")).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::UnsupportedFormat);
        assert!(MeshFormat::from_path(Path::new("noext")).is_err());
    }

    #[test]
    fn test_ply_roundtrip_keeps_labels_as_colors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("patch.ply");
        let mesh = labelled_patch();
        save_mesh(&mesh, &path).unwrap();

        let loaded = load_mesh_with_labels(&path, &ColorToLabelMap::Packed).unwrap();
        assert_eq!(loaded.vertex_count(), 7);
        assert_eq!(loaded.faces, mesh.faces);
        assert_eq!(loaded.labels(), mesh.labels());
        for (a, b) in loaded.vertices.iter().zip(&mesh.vertices) {
            assert!((a.position - b.position).norm() < 1e-9);
        }
    }

    #[test]
    fn test_obj_roundtrip_with_colors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("patch.obj");
        let mut mesh = hexagon_patch(Point3::origin(), 1.0);
        let table = ColorTable::standard();
        let colors = [[255, 0, 0], [0, 255, 0], [0, 0, 255]];
        for (i, v) in mesh.vertices.iter_mut().enumerate() {
            let [r, g, b] = colors[i % 3];
            v.label = None;
            v.color = Some(VertexColor::new(r, g, b));
        }
        save_mesh(&mesh, &path).unwrap();

        let loaded = load_mesh_with_labels(&path, &ColorToLabelMap::Table(table)).unwrap();
        let labels = loaded.labels().unwrap();
        assert_eq!(&labels[..3], &[0, 1, 3]);
        assert_eq!(loaded.face_count(), 6);
    }

    #[test]
    fn test_stl_roundtrip_geometry() {
        let file = NamedTempFile::with_suffix(".stl").unwrap();
        let mesh = hexagon_patch(Point3::origin(), 1.0);
        save_mesh(&mesh, file.path()).unwrap();
        let loaded = load_mesh(file.path()).unwrap();
        assert_eq!(loaded.face_count(), 6);
        assert_eq!(loaded.vertex_count(), 7);
    }

    #[test]
    fn test_labels_without_colors_fail() {
        let file = NamedTempFile::with_suffix(".stl").unwrap();
        save_mesh(&hexagon_patch(Point3::origin(), 1.0), file.path()).unwrap();
        let err = load_mesh_with_labels(file.path(), &ColorToLabelMap::Packed).unwrap_err();
        assert!(err.code().is_invalid_input());
    }

    #[test]
    fn test_label_file() {
        let mut file = NamedTempFile::with_suffix(".txt").unwrap();
        writeln!(file, "# labels\n0\n1\n\n2\n0\n1\n2\n0").unwrap();
        let labels = load_labels(file.path()).unwrap();
        assert_eq!(labels, vec![0, 1, 2, 0, 1, 2, 0]);

        let mut mesh = hexagon_patch(Point3::origin(), 1.0);
        apply_labels(&mut mesh, &labels).unwrap();
        assert_eq!(mesh.labels().unwrap(), labels);
        assert!(apply_labels(&mut mesh, &labels[..3]).is_err());
    }

    #[test]
    fn test_label_file_rejects_garbage() {
        let mut file = NamedTempFile::with_suffix(".txt").unwrap();
        writeln!(file, "0\nbone\n").unwrap();
        let err = load_labels(file.path()).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::ParseError);
    }

    #[test]
    fn test_empty_mesh_rejected() {
        let mut file = NamedTempFile::with_suffix(".obj").unwrap();
        writeln!(file, "v 0 0 0\nv 1 0 0").unwrap();
        let err = load_mesh(file.path()).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::EmptyMesh);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_mesh("/nonexistent/mesh.ply").unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::IoRead);
    }
}
