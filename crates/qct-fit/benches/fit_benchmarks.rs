//! Benchmarks for the fitting stages.
//!
//! Run with: cargo bench -p qct-fit
//!
//! To compare against baseline:
//! 1. First run: cargo bench -p qct-fit -- --save-baseline main
//! 2. After changes: cargo bench -p qct-fit -- --baseline main

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use nalgebra::{Point3, Vector3};
use qct_fit::{
    ArapParams, Configuration, DiscreteRange, DisplacementOptimizer, GridSampler,
    MeasurementModel, Mesh, MeshFitter, Vertex, VolumeSampler, VoxelVolume, WeightedArapSolver,
    cotangent_laplacian,
};

// =============================================================================
// Inputs
// =============================================================================

/// Sphere of dense material centred in an `n^3` unit-voxel volume.
fn sphere_volume(n: usize, radius: f64) -> VoxelVolume {
    let c = n as f64 / 2.0;
    VoxelVolume::from_fn([n, n, n], [1.0; 3], |x, y, z| {
        let d = ((x as f64 - c).powi(2) + (y as f64 - c).powi(2) + (z as f64 - c).powi(2)).sqrt();
        if d <= radius { 1000.0 } else { 0.0 }
    })
    .unwrap()
}

fn step_model() -> MeasurementModel {
    let mut model = MeasurementModel::new(
        DiscreteRange::new(-3.0, 3.0, 0.25),
        DiscreteRange::new(-100.0, 1100.0, 50.0),
        DiscreteRange::new(0.0, 90.0, 5.0),
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

/// Icosphere with `subdivisions` levels of 4-to-1 splitting, labelled 0.
fn icosphere(subdivisions: u32, center: Point3<f64>, radius: f64) -> Mesh {
    let p = (1.0 + 5f64.sqrt()) / 2.0;
    let mut positions: Vec<Vector3<f64>> = [
        [-1.0, p, 0.0],
        [1.0, p, 0.0],
        [-1.0, -p, 0.0],
        [1.0, -p, 0.0],
        [0.0, -1.0, p],
        [0.0, 1.0, p],
        [0.0, -1.0, -p],
        [0.0, 1.0, -p],
        [p, 0.0, -1.0],
        [p, 0.0, 1.0],
        [-p, 0.0, -1.0],
        [-p, 0.0, 1.0],
    ]
    .iter()
    .map(|v| Vector3::new(v[0], v[1], v[2]).normalize())
    .collect();
    let mut faces: Vec<[u32; 3]> = vec![
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

    for _ in 0..subdivisions {
        let mut midpoints = std::collections::HashMap::new();
        let mut midpoint = |a: u32, b: u32, positions: &mut Vec<Vector3<f64>>| -> u32 {
            let key = (a.min(b), a.max(b));
            *midpoints.entry(key).or_insert_with(|| {
                positions.push(((positions[a as usize] + positions[b as usize]) * 0.5).normalize());
                (positions.len() - 1) as u32
            })
        };
        let mut next = Vec::with_capacity(faces.len() * 4);
        for [a, b, c] in faces {
            let ab = midpoint(a, b, &mut positions);
            let bc = midpoint(b, c, &mut positions);
            let ca = midpoint(c, a, &mut positions);
            next.extend([[a, ab, ca], [b, bc, ab], [c, ca, bc], [ab, bc, ca]]);
        }
        faces = next;
    }

    let mut mesh = Mesh::new();
    mesh.vertices = positions
        .iter()
        .map(|v| Vertex::with_label(center + v * radius, 0))
        .collect();
    mesh.faces = faces;
    mesh
}

// =============================================================================
// Sampling Benchmarks
// =============================================================================

fn bench_volume_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("VolumeSampling");
    let volume = sphere_volume(64, 20.0);
    let sampler = VolumeSampler::new(&volume);

    for count in [1_000usize, 10_000, 100_000] {
        let points: Vec<Point3<f64>> = (0..count)
            .map(|i| {
                let f = i as f64 / count as f64;
                Point3::new(5.0 + 50.0 * f, 32.0 + 10.0 * (7.0 * f).sin(), 31.5)
            })
            .collect();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("sample_all", count), &points, |b, points| {
            b.iter(|| sampler.sample_all(black_box(points)))
        });
    }

    group.finish();
}

// =============================================================================
// Stage Benchmarks
// =============================================================================

fn bench_displacement(c: &mut Criterion) {
    let mut group = c.benchmark_group("Displacement");
    let model = step_model();
    let optimizer = DisplacementOptimizer::new(&model, 2.0, 0.9, 3);
    let k = optimizer.samples_per_vertex();

    for subdivisions in [1u32, 2, 3] {
        let mut mesh = icosphere(subdivisions, Point3::origin(), 1.0);
        mesh.compute_vertex_normals();
        let normals = mesh.normals();
        let labels = vec![0; normals.len()];
        let densities: Vec<f64> = (0..normals.len() * k)
            .map(|i| if i % k < k / 2 { 1000.0 } else { 0.0 })
            .collect();

        group.throughput(Throughput::Elements(normals.len() as u64));
        group.bench_function(BenchmarkId::new("optimize", normals.len()), |b| {
            b.iter(|| optimizer.optimize(black_box(&normals), &labels, &densities, 0))
        });
    }

    group.finish();
}

fn bench_deformation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Deformation");
    group.sample_size(20);

    for subdivisions in [1u32, 2, 3] {
        let mut mesh = icosphere(subdivisions, Point3::origin(), 10.0);
        mesh.compute_vertex_normals();
        let positions = mesh.positions();
        let normals = mesh.normals();
        let targets: Vec<_> = positions
            .iter()
            .zip(&normals)
            .map(|(p, n)| p + 0.5 * n)
            .collect();
        let weights = vec![1.0; positions.len()];

        group.throughput(Throughput::Elements(mesh.faces.len() as u64));
        group.bench_function(BenchmarkId::new("laplacian", mesh.faces.len()), |b| {
            b.iter(|| cotangent_laplacian(black_box(&positions), &mesh.faces))
        });

        let solver = WeightedArapSolver::new(&mesh, ArapParams::default()).unwrap();
        group.bench_function(BenchmarkId::new("arap_fit", mesh.faces.len()), |b| {
            b.iter(|| solver.fit(black_box(&targets), &normals, &weights))
        });
    }

    group.finish();
}

// =============================================================================
// Full Fit Benchmarks
// =============================================================================

fn bench_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("Fit");
    group.sample_size(10);
    let volume = sphere_volume(48, 15.0);

    for subdivisions in [1u32, 2] {
        let mesh = icosphere(subdivisions, Point3::new(24.0, 24.0, 24.0), 13.0);
        let faces = mesh.faces.len();
        let config = Configuration::new(step_model(), mesh)
            .with_prior_sigma(2.0)
            .with_max_iterations(20);
        let fitter = MeshFitter::new(config).unwrap();

        group.bench_function(BenchmarkId::new("sphere", faces), |b| {
            b.iter(|| fitter.fit(black_box(&volume)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_volume_sampling,
    bench_displacement,
    bench_deformation,
    bench_fit,
);
criterion_main!(benches);
