//! Dense voxel density volumes.
//!
//! A [`VoxelVolume`] is an immutable 3-D scalar field with anisotropic
//! spacing. The x index varies fastest: voxel `(x, y, z)` lives at
//! `z * width * height + y * width + x`. Voxel `(i, j, k)` sits at physical
//! position `(i * sx, j * sy, k * sz)`.
//!
//! Volumes are loaded from a small TOML descriptor that points at a raw
//! sample file:
//!
//! ```toml
//! size = [256, 256, 180]
//! voxel_size = [0.7, 0.7, 1.0]
//! data = "patient.raw"
//! sample_type = "i16"      # f32 | i16 | u16
//! byte_order = "little"    # little | big
//! ```

use std::path::Path;

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{QctError, QctResult};
use crate::tracing_ext::log_io_operation;

/// Scalar encoding of the raw sample file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    #[default]
    F32,
    I16,
    U16,
}

impl SampleType {
    /// Bytes per sample.
    pub fn width(self) -> usize {
        match self {
            SampleType::F32 => 4,
            SampleType::I16 | SampleType::U16 => 2,
        }
    }
}

/// Byte order of the raw sample file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// On-disk volume descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub size: [usize; 3],
    pub voxel_size: [f64; 3],
    pub data: String,
    #[serde(default)]
    pub sample_type: SampleType,
    #[serde(default)]
    pub byte_order: ByteOrder,
}

/// Dense 3-D density field.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelVolume {
    size: [usize; 3],
    voxel_size: [f64; 3],
    data: Vec<f32>,
}

impl VoxelVolume {
    /// Create a volume, checking the data length and spacing.
    pub fn new(size: [usize; 3], voxel_size: [f64; 3], data: Vec<f32>) -> QctResult<Self> {
        let expected = size[0] * size[1] * size[2];
        if expected == 0 {
            return Err(QctError::invalid_input(format!(
                "volume size {:?} has a zero dimension",
                size
            )));
        }
        QctError::check_len("volume data", expected, data.len())?;
        if !voxel_size.iter().all(|s| s.is_finite() && *s > 0.0) {
            return Err(QctError::invalid_input(format!(
                "voxel size {:?} must be positive",
                voxel_size
            )));
        }
        Ok(Self {
            size,
            voxel_size,
            data,
        })
    }

    /// Fill a volume from a function of voxel indices.
    pub fn from_fn(
        size: [usize; 3],
        voxel_size: [f64; 3],
        mut f: impl FnMut(usize, usize, usize) -> f32,
    ) -> QctResult<Self> {
        let mut data = Vec::with_capacity(size[0] * size[1] * size[2]);
        for z in 0..size[2] {
            for y in 0..size[1] {
                for x in 0..size[0] {
                    data.push(f(x, y, z));
                }
            }
        }
        Self::new(size, voxel_size, data)
    }

    /// Voxel counts (width, height, depth).
    #[inline]
    pub fn size(&self) -> [usize; 3] {
        self.size
    }

    /// Physical voxel spacing.
    #[inline]
    pub fn voxel_size(&self) -> [f64; 3] {
        self.voxel_size
    }

    /// Raw samples, x fastest.
    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Flat index of a voxel.
    #[inline]
    pub fn linear_index(&self, x: usize, y: usize, z: usize) -> usize {
        z * self.size[0] * self.size[1] + y * self.size[0] + x
    }

    /// Value at a voxel, `None` outside.
    pub fn value(&self, x: usize, y: usize, z: usize) -> Option<f32> {
        (x < self.size[0] && y < self.size[1] && z < self.size[2])
            .then(|| self.data[self.linear_index(x, y, z)])
    }

    /// Physical extent `size * voxel_size`.
    pub fn extent(&self) -> Vector3<f64> {
        Vector3::new(
            self.size[0] as f64 * self.voxel_size[0],
            self.size[1] as f64 * self.voxel_size[1],
            self.size[2] as f64 * self.voxel_size[2],
        )
    }

    /// Physical bounding box.
    pub fn bounds(&self) -> (Point3<f64>, Point3<f64>) {
        (Point3::origin(), Point3::from(self.extent()))
    }

    /// Center of the physical bounding box.
    pub fn center(&self) -> Point3<f64> {
        Point3::from(self.extent() * 0.5)
    }

    /// Minimum and maximum sample.
    pub fn value_range(&self) -> (f32, f32) {
        self.data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }

    /// Load a volume from a TOML descriptor.
    pub fn load(path: impl AsRef<Path>) -> QctResult<Self> {
        let path = path.as_ref();
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        if !is_toml {
            return Err(QctError::unsupported_format("volume", path));
        }

        let text = std::fs::read_to_string(path).map_err(|e| QctError::io_read(path, e))?;
        let descriptor: VolumeDescriptor =
            toml::from_str(&text).map_err(|e| QctError::parse_error(path, e.to_string()))?;

        let data_path = resolve_relative(path, &descriptor.data);
        let bytes = std::fs::read(&data_path).map_err(|e| QctError::io_read(&data_path, e))?;
        let volume = Self::from_descriptor(&descriptor, &bytes)
            .map_err(|e| match e {
                QctError::InvalidInput { details, .. } => QctError::invalid_file(&data_path, details),
                other => other,
            })?;

        log_io_operation("load_volume", path, "volume", true);
        info!(
            target: "qct_fit::io",
            size = ?volume.size,
            voxel_size = ?volume.voxel_size,
            "Loaded volume"
        );
        Ok(volume)
    }

    /// Decode raw bytes described by a descriptor.
    pub fn from_descriptor(descriptor: &VolumeDescriptor, bytes: &[u8]) -> QctResult<Self> {
        let count = descriptor.size.iter().product::<usize>();
        let width = descriptor.sample_type.width();
        if bytes.len() != count * width {
            return Err(QctError::invalid_input(format!(
                "raw volume has {} bytes, expected {} ({} voxels of {} bytes)",
                bytes.len(),
                count * width,
                count,
                width
            )));
        }

        let big = descriptor.byte_order == ByteOrder::Big;
        let data: Vec<f32> = match descriptor.sample_type {
            SampleType::F32 => bytes
                .chunks_exact(4)
                .map(|c| {
                    let b = [c[0], c[1], c[2], c[3]];
                    if big { f32::from_be_bytes(b) } else { f32::from_le_bytes(b) }
                })
                .collect(),
            SampleType::I16 => bytes
                .chunks_exact(2)
                .map(|c| {
                    let b = [c[0], c[1]];
                    (if big { i16::from_be_bytes(b) } else { i16::from_le_bytes(b) }) as f32
                })
                .collect(),
            SampleType::U16 => bytes
                .chunks_exact(2)
                .map(|c| {
                    let b = [c[0], c[1]];
                    (if big { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) }) as f32
                })
                .collect(),
        };
        debug!(target: "qct_fit::io", voxels = data.len(), "Decoded raw volume");
        Self::new(descriptor.size, descriptor.voxel_size, data)
    }

    /// Write the volume as a descriptor plus little-endian f32 raw file.
    ///
    /// The raw file is written next to the descriptor with a `.raw` extension.
    pub fn save(&self, path: impl AsRef<Path>) -> QctResult<()> {
        let path = path.as_ref();
        let raw_path = path.with_extension("raw");
        let raw_name = raw_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from)
            .ok_or_else(|| QctError::invalid_file(path, "descriptor path has no file name"))?;

        let descriptor = VolumeDescriptor {
            size: self.size,
            voxel_size: self.voxel_size,
            data: raw_name,
            sample_type: SampleType::F32,
            byte_order: ByteOrder::Little,
        };
        let text = toml::to_string_pretty(&descriptor)
            .map_err(|e| QctError::invalid_file(path, e.to_string()))?;
        let bytes: Vec<u8> = self.data.iter().flat_map(|v| v.to_le_bytes()).collect();

        std::fs::write(&raw_path, bytes).map_err(|e| QctError::io_write(&raw_path, e))?;
        std::fs::write(path, text).map_err(|e| QctError::io_write(path, e))?;
        log_io_operation("save_volume", path, "volume", true);
        Ok(())
    }
}

/// Resolve `relative` against the directory holding `anchor`.
pub(crate) fn resolve_relative(anchor: &Path, relative: &str) -> std::path::PathBuf {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        rel.to_path_buf()
    } else {
        anchor.parent().unwrap_or_else(|| Path::new(".")).join(rel)
    }
}
