//! Mapping vertex colours to tissue labels.
//!
//! Labelled reference meshes usually carry their labels as vertex colours.
//! Two mappings are supported: the packed default (`label = b<<16 | g<<8 | r`)
//! and an explicit lookup table, loadable from TOML:
//!
//! ```toml
//! undefined_label = 4294967295
//!
//! [[entries]]
//! color = [255, 0, 0]
//! label = 0
//! ```

use std::path::Path;

use hashbrown::HashMap;
use serde::Deserialize;

use crate::error::{QctError, QctResult};
use crate::tracing_ext::log_io_operation;
use crate::types::{Label, VertexColor};

/// Explicit colour → label lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorTable {
    pub entries: HashMap<[u8; 3], Label>,
    /// Label for colours missing from `entries`.
    pub undefined_label: Label,
}

#[derive(Deserialize)]
struct ColorTableFile {
    #[serde(default = "default_undefined")]
    undefined_label: Label,
    #[serde(default)]
    entries: Vec<ColorTableEntry>,
}

#[derive(Deserialize)]
struct ColorTableEntry {
    color: [u8; 3],
    label: Label,
}

fn default_undefined() -> Label {
    Label::MAX
}

impl ColorTable {
    /// Empty table mapping everything to `undefined_label`.
    pub fn new(undefined_label: Label) -> Self {
        Self {
            entries: HashMap::new(),
            undefined_label,
        }
    }

    /// Add or replace one entry.
    pub fn insert(&mut self, color: [u8; 3], label: Label) {
        self.entries.insert(color, label);
    }

    /// Six primary and secondary colours mapped to labels 0 to 5.
    pub fn standard() -> Self {
        let mut table = Self::new(Label::MAX);
        table.insert([255, 0, 0], 0);
        table.insert([0, 255, 0], 1);
        table.insert([255, 255, 0], 2);
        table.insert([0, 0, 255], 3);
        table.insert([255, 0, 255], 4);
        table.insert([0, 255, 255], 5);
        table
    }

    pub fn label(&self, color: VertexColor) -> Label {
        self.entries
            .get(&color.to_array())
            .copied()
            .unwrap_or(self.undefined_label)
    }

    /// Load a table from TOML.
    pub fn load(path: impl AsRef<Path>) -> QctResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| QctError::io_read(path, e))?;
        let file: ColorTableFile =
            toml::from_str(&text).map_err(|e| QctError::parse_error(path, e.to_string()))?;

        let mut table = Self::new(file.undefined_label);
        for entry in file.entries {
            table.insert(entry.color, entry.label);
        }
        log_io_operation("load", path, "color table", true);
        Ok(table)
    }
}

/// How vertex colours become labels.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ColorToLabelMap {
    /// `label = b<<16 | g<<8 | r`.
    #[default]
    Packed,
    Table(ColorTable),
}

impl ColorToLabelMap {
    pub fn label(&self, color: VertexColor) -> Label {
        match self {
            Self::Packed => pack(color),
            Self::Table(table) => table.label(color),
        }
    }
}

/// Packed label of a colour.
pub fn pack(color: VertexColor) -> Label {
    (color.b as Label) << 16 | (color.g as Label) << 8 | color.r as Label
}

/// Colour whose packed label is `label`. Bits above 24 are dropped.
pub fn unpack(label: Label) -> VertexColor {
    VertexColor::new(
        (label & 0xff) as u8,
        ((label >> 8) & 0xff) as u8,
        ((label >> 16) & 0xff) as u8,
    )
}
