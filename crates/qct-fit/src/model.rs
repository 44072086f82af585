//! Empirical measurement models.
//!
//! A [`MeasurementModel`] stores, per tissue label, a 3-D table of
//! likelihoods over three axes:
//!
//! | axis | meaning                                   | default range        |
//! |------|-------------------------------------------|----------------------|
//! | t    | signed offset along the surface normal    | `-2..=2` step `0.1`  |
//! | ρ    | tissue density                            | `-1000..=2000` step 1|
//! | θ    | incidence angle between normal and z axis | `0..=90` step 1      |
//!
//! Samples are stored t fastest, then ρ, then θ:
//! `index = a * (nt * nd) + d * nt + t` for 0-based `(t, d, a)`.
//!
//! # File format
//!
//! ```toml
//! name = "femur"
//! slice_spacing = 1.0
//!
//! [kernel]
//! sigma = 1.0
//!
//! [sampling_range]
//! min = -2.0
//! max = 2.0
//! stride = 0.1
//!
//! [density_range]
//! min = -1000.0
//! max = 2000.0
//! stride = 1.0
//!
//! [angle_range]
//! min = 0.0
//! max = 90.0
//! stride = 1.0
//!
//! [[labels]]
//! label = 0
//! scale = 1.0
//! data = "femur_label0.bin"   # little-endian f64, nt * nd * na samples
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::discrete_range::DiscreteRange;
use crate::error::{QctError, QctResult};
use crate::tracing_ext::log_io_operation;
use crate::types::Label;
use crate::volume::resolve_relative;

/// Likelihood table and weight normalization for one label.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelTable {
    /// Likelihood samples, t fastest.
    pub values: Vec<f64>,
    /// Divides confidence weights of vertices carrying this label.
    pub scale: f64,
}

/// Per-label likelihood tables over (offset, density, angle).
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementModel {
    pub name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub creation_date: Option<String>,
    pub kernel_sigma: f64,
    pub slice_spacing: f64,
    pub sampling_range: DiscreteRange,
    pub density_range: DiscreteRange,
    pub angle_range: DiscreteRange,
    tables: BTreeMap<Label, LabelTable>,
}

impl Default for MeasurementModel {
    fn default() -> Self {
        Self {
            name: None,
            description: None,
            author: None,
            creation_date: None,
            kernel_sigma: 1.0,
            slice_spacing: 1.0,
            sampling_range: DiscreteRange::new(-2.0, 2.0, 0.1),
            density_range: DiscreteRange::new(-1000.0, 2000.0, 1.0),
            angle_range: DiscreteRange::new(0.0, 90.0, 1.0),
            tables: BTreeMap::new(),
        }
    }
}

impl MeasurementModel {
    /// Create an empty model over the given axes.
    pub fn new(
        sampling_range: DiscreteRange,
        density_range: DiscreteRange,
        angle_range: DiscreteRange,
    ) -> QctResult<Self> {
        sampling_range.validate("sampling_range")?;
        density_range.validate("density_range")?;
        angle_range.validate("angle_range")?;
        Ok(Self {
            sampling_range,
            density_range,
            angle_range,
            ..Self::default()
        })
    }

    /// Table dimensions `[nt, nd, na]`.
    pub fn dims(&self) -> [usize; 3] {
        [
            self.sampling_range.element_count(),
            self.density_range.element_count(),
            self.angle_range.element_count(),
        ]
    }

    /// Samples per label table.
    pub fn table_len(&self) -> usize {
        self.dims().iter().product()
    }

    /// Flat index of 0-based `(t, d, a)`.
    #[inline]
    pub fn linear_index(&self, t: usize, d: usize, a: usize) -> usize {
        let [nt, nd, _] = self.dims();
        a * nt * nd + d * nt + t
    }

    /// Add or replace a label table, checking its size.
    pub fn insert_label(&mut self, label: Label, values: Vec<f64>, scale: f64) -> QctResult<()> {
        let expected = self.table_len();
        if values.len() != expected {
            return Err(QctError::inconsistent_model(label, expected, values.len()));
        }
        self.tables.insert(label, LabelTable { values, scale });
        Ok(())
    }

    /// Add a label table generated from axis values `(t, density, angle)`.
    pub fn insert_label_fn(
        &mut self,
        label: Label,
        scale: f64,
        f: impl Fn(f64, f64, f64) -> f64,
    ) -> QctResult<()> {
        let [nt, nd, na] = self.dims();
        let mut values = Vec::with_capacity(nt * nd * na);
        for a in 1..=na {
            let angle = self.angle_range.nth_element(a);
            for d in 1..=nd {
                let density = self.density_range.nth_element(d);
                for t in 1..=nt {
                    values.push(f(self.sampling_range.nth_element(t), density, angle));
                }
            }
        }
        self.insert_label(label, values, scale)
    }

    /// Table for a label.
    pub fn table(&self, label: Label) -> Option<&LabelTable> {
        self.tables.get(&label)
    }

    /// Weight scale for a label, 1 when the label is unknown.
    pub fn scale(&self, label: Label) -> f64 {
        self.tables.get(&label).map_or(1.0, |t| t.scale)
    }

    /// Whether the model defines a label.
    pub fn contains(&self, label: Label) -> bool {
        self.tables.contains_key(&label)
    }

    /// Defined labels in ascending order.
    pub fn labels(&self) -> Vec<Label> {
        self.tables.keys().copied().collect()
    }

    /// Number of label tables.
    pub fn label_count(&self) -> usize {
        self.tables.len()
    }

    /// Iterate over `(label, table)`.
    pub fn tables(&self) -> impl Iterator<Item = (Label, &LabelTable)> {
        self.tables.iter().map(|(l, t)| (*l, t))
    }

    /// Fail on the first vertex label the model does not define.
    pub fn validate_labels(&self, labels: &[Label]) -> QctResult<()> {
        match labels.iter().position(|l| !self.contains(*l)) {
            Some(vertex) => Err(QctError::unknown_label(vertex, labels[vertex])),
            None => Ok(()),
        }
    }

    /// Load a model from its TOML description and binary sample blocks.
    pub fn load(path: impl AsRef<Path>) -> QctResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| QctError::io_read(path, e))?;
        let file: ModelFile =
            toml::from_str(&text).map_err(|e| QctError::parse_error(path, e.to_string()))?;

        let mut model = Self::new(file.sampling_range, file.density_range, file.angle_range)
            .map_err(|e| QctError::invalid_file(path, e.to_string()))?;
        model.name = file.name;
        model.description = file.description;
        model.author = file.author;
        model.creation_date = file.creation_date;
        model.kernel_sigma = file.kernel.sigma;
        model.slice_spacing = file.slice_spacing;

        if file.labels.is_empty() {
            return Err(QctError::invalid_file(path, "model defines no [[labels]]"));
        }

        let expected_bytes = model.table_len() * std::mem::size_of::<f64>();
        for entry in &file.labels {
            let data_path = resolve_relative(path, &entry.data);
            let bytes = std::fs::read(&data_path).map_err(|e| QctError::io_read(&data_path, e))?;
            if bytes.len() != expected_bytes {
                return Err(QctError::inconsistent_model(
                    entry.label,
                    model.table_len(),
                    bytes.len() / std::mem::size_of::<f64>(),
                ));
            }
            let values = bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            model.insert_label(entry.label, values, entry.scale)?;
            debug!(target: "qct_fit::io", label = entry.label, scale = entry.scale, "Loaded label table");
        }

        log_io_operation("load_model", path, "model", true);
        info!(
            target: "qct_fit::io",
            name = model.name.as_deref().unwrap_or("unnamed"),
            labels = model.label_count(),
            dims = ?model.dims(),
            "Loaded measurement model"
        );
        Ok(model)
    }

    /// Write the model as TOML plus one `<stem>_label<N>.bin` file per label.
    pub fn save(&self, path: impl AsRef<Path>) -> QctResult<()> {
        let path = path.as_ref();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| QctError::invalid_file(path, "model path has no file name"))?;

        let mut labels = Vec::with_capacity(self.tables.len());
        for (label, table) in &self.tables {
            let data = format!("{}_label{}.bin", stem, label);
            let data_path = resolve_relative(path, &data);
            let bytes: Vec<u8> = table.values.iter().flat_map(|v| v.to_le_bytes()).collect();
            std::fs::write(&data_path, bytes).map_err(|e| QctError::io_write(&data_path, e))?;
            labels.push(LabelEntry {
                label: *label,
                scale: table.scale,
                data,
            });
        }

        let file = ModelFile {
            name: self.name.clone(),
            description: self.description.clone(),
            author: self.author.clone(),
            creation_date: self.creation_date.clone(),
            slice_spacing: self.slice_spacing,
            kernel: Kernel {
                sigma: self.kernel_sigma,
            },
            sampling_range: self.sampling_range,
            density_range: self.density_range,
            angle_range: self.angle_range,
            labels,
        };
        let text =
            toml::to_string_pretty(&file).map_err(|e| QctError::invalid_file(path, e.to_string()))?;
        std::fs::write(path, text).map_err(|e| QctError::io_write(path, e))?;
        log_io_operation("save_model", path, "model", true);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    creation_date: Option<String>,
    #[serde(default = "default_slice_spacing")]
    slice_spacing: f64,
    kernel: Kernel,
    sampling_range: DiscreteRange,
    density_range: DiscreteRange,
    angle_range: DiscreteRange,
    #[serde(default)]
    labels: Vec<LabelEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Kernel {
    sigma: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct LabelEntry {
    label: Label,
    #[serde(default = "default_scale")]
    scale: f64,
    data: String,
}

fn default_slice_spacing() -> f64 {
    1.0
}

fn default_scale() -> f64 {
    1.0
}
