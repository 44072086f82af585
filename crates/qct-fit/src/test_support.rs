//! Fixtures shared by unit tests.

use nalgebra::Point3;

use crate::discrete_range::DiscreteRange;
use crate::model::MeasurementModel;
use crate::sampler::LatticeSampler;
use crate::types::{Mesh, Vertex};
use crate::volume::VoxelVolume;

/// 2x2x2 lattice holding `1 + x + 10 y + 100 z`.
pub(crate) fn corner_cube() -> LatticeSampler {
    LatticeSampler::new(
        [2, 2, 2],
        vec![1.0, 2.0, 11.0, 12.0, 101.0, 102.0, 111.0, 112.0],
    )
    .unwrap()
}

/// Model with one label whose value is `x + 0.1 y + 0.01 z` for 1-based
/// sample, density and angle indices.
pub(crate) fn indexed_model() -> MeasurementModel {
    let mut model = MeasurementModel::new(
        DiscreteRange::new(-4.0, 4.0, 4.0),
        DiscreteRange::new(-500.0, 1300.0, 600.0),
        DiscreteRange::new(10.0, 82.0, 18.0),
    )
    .unwrap();
    let [nt, nd, na] = model.dims();
    let mut values = Vec::with_capacity(nt * nd * na);
    for z in 1..=na {
        for y in 1..=nd {
            for x in 1..=nt {
                values.push(x as f64 + y as f64 * 0.1 + z as f64 * 0.01);
            }
        }
    }
    model.insert_label(0, values, 1.0).unwrap();
    model
}

/// 20^3 unit-voxel volume: 1000 for `z <= 9`, 0 above. The 500 crossing,
/// i.e. the interface, is at z = 9.5.
pub(crate) fn step_volume() -> VoxelVolume {
    VoxelVolume::from_fn([20, 20, 20], [1.0; 3], |_, _, z| if z <= 9 { 1000.0 } else { 0.0 })
        .unwrap()
}

/// Model expecting dense material below the surface (t < 0) and air above,
/// with a one-unit linear transition centred at t = 0.
pub(crate) fn step_model() -> MeasurementModel {
    let mut model = MeasurementModel::new(
        DiscreteRange::new(-3.0, 3.0, 0.5),
        DiscreteRange::new(-100.0, 1100.0, 100.0),
        DiscreteRange::new(0.0, 90.0, 10.0),
    )
    .unwrap();
    model
        .insert_label_fn(0, 1.0, |t, density, _| {
            let expected = (500.0 - 1000.0 * t).clamp(0.0, 1000.0);
            let r = (density - expected) / 200.0;
            (-0.5 * r * r).exp() + 1e-6
        })
        .unwrap();
    model
}

/// Flat hexagonal fan at height `z`: one center vertex and a ring of six,
/// wound counter-clockwise seen from +z, all labelled 0.
pub(crate) fn hexagon_patch(center: Point3<f64>, radius: f64) -> Mesh {
    let mut mesh = Mesh::with_capacity(7, 6);
    mesh.vertices.push(Vertex::with_label(center, 0));
    for k in 0..6 {
        let a = std::f64::consts::FRAC_PI_3 * k as f64;
        mesh.vertices.push(Vertex::with_label(
            center + nalgebra::Vector3::new(radius * a.cos(), radius * a.sin(), 0.0),
            0,
        ));
    }
    for k in 0..6u32 {
        mesh.faces.push([0, 1 + k, 1 + (k + 1) % 6]);
    }
    mesh
}

/// Unit-ish icosahedron with outward counter-clockwise faces.
pub(crate) fn icosahedron() -> Mesh {
    let p = (1.0 + 5f64.sqrt()) / 2.0;
    let positions = vec![
        Point3::new(-1.0, p, 0.0),
        Point3::new(1.0, p, 0.0),
        Point3::new(-1.0, -p, 0.0),
        Point3::new(1.0, -p, 0.0),
        Point3::new(0.0, -1.0, p),
        Point3::new(0.0, 1.0, p),
        Point3::new(0.0, -1.0, -p),
        Point3::new(0.0, 1.0, -p),
        Point3::new(p, 0.0, -1.0),
        Point3::new(p, 0.0, 1.0),
        Point3::new(-p, 0.0, -1.0),
        Point3::new(-p, 0.0, 1.0),
    ];
    let faces = vec![
        [0, 11, 5],
        [0, 5, 1],
        [0, 1, 7],
        [0, 7, 10],
        [0, 10, 11],
        [1, 5, 9],
        [5, 11, 4],
        [11, 10, 2],
        [10, 7, 6],
        [7, 1, 8],
        [3, 9, 4],
        [3, 4, 2],
        [3, 2, 6],
        [3, 6, 8],
        [3, 8, 9],
        [4, 9, 5],
        [2, 4, 11],
        [6, 2, 10],
        [8, 6, 7],
        [9, 8, 1],
    ];
    Mesh::from_parts(positions, faces)
}
