//! Core types shared across the engine.

use std::fmt;
use std::str::FromStr;

use ndarray::Slice;
use serde::{Deserialize, Serialize};

/// A half-open strided range along one dimension (`start..stop` by `step`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimSlice {
    pub start: usize,
    pub stop: usize,
    pub step: usize,
}

/// One slice per dimension.
pub type SliceTuple = Vec<DimSlice>;

impl DimSlice {
    /// Create a new slice. A zero step is treated as 1.
    pub fn new(start: usize, stop: usize, step: usize) -> Self {
        Self {
            start,
            stop,
            step: step.max(1),
        }
    }

    /// Slice covering `0..len`.
    pub fn full(len: usize) -> Self {
        Self::new(0, len, 1)
    }

    /// Single-index slice `value..value+1`.
    pub fn index(value: usize) -> Self {
        Self::new(value, value + 1, 1)
    }

    /// Number of elements selected.
    pub fn len(&self) -> usize {
        if self.stop <= self.start {
            0
        } else {
            (self.stop - self.start + self.step - 1) / self.step
        }
    }

    /// Check if the slice selects nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last selected index, if any.
    pub fn last(&self) -> Option<usize> {
        match self.len() {
            0 => None,
            n => Some(self.start + (n - 1) * self.step),
        }
    }

    /// Iterate the selected indices.
    pub fn indices(&self) -> impl Iterator<Item = usize> {
        (self.start..self.stop).step_by(self.step)
    }

    /// Convert to an ndarray slice.
    pub fn as_ndarray(&self) -> Slice {
        Slice::new(self.start as isize, Some(self.stop as isize), self.step as isize)
    }
}

impl fmt::Display for DimSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.start, self.stop, self.step)
    }
}

/// Shape of the block selected by a slice tuple.
pub fn tuple_shape(slices: &[DimSlice]) -> Vec<usize> {
    slices.iter().map(DimSlice::len).collect()
}

/// Render a slice tuple for log output.
pub fn format_tuple(slices: &[DimSlice]) -> String {
    let parts: Vec<String> = slices.iter().map(|s| s.to_string()).collect();
    format!("({})", parts.join(", "))
}

/// Element type of a dataset. Buffers are always `f32` in memory; the dtype
/// drives chunk sizing and the on-disk description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    UInt8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    #[default]
    Float32,
    Float64,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn itemsize(&self) -> usize {
        match self {
            Self::UInt8 => 1,
            Self::UInt16 | Self::Int16 => 2,
            Self::UInt32 | Self::Int32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    /// Get the dtype name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::Int16 => "int16",
            Self::UInt32 => "uint32",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

impl FromStr for Dtype {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "uint8" | "u8" => Ok(Self::UInt8),
            "uint16" | "u16" => Ok(Self::UInt16),
            "int16" | "i16" => Ok(Self::Int16),
            "uint32" | "u32" => Ok(Self::UInt32),
            "int32" | "i32" => Ok(Self::Int32),
            "float32" | "f32" => Ok(Self::Float32),
            "float64" | "f64" => Ok(Self::Float64),
            other => Err(format!("unsupported dtype '{}'", other)),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Axis label: a name and its physical unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisLabel {
    pub name: String,
    pub unit: String,
}

impl AxisLabel {
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
        }
    }
}

impl FromStr for AxisLabel {
    type Err = String;

    /// Parse a `name.unit` label.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((name, unit)) if !name.is_empty() => Ok(Self::new(name, unit)),
            _ => Err(format!("axis label '{}' must have the form name.unit", s)),
        }
    }
}

impl fmt::Display for AxisLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dim_slice_len() {
        assert_eq!(DimSlice::new(0, 10, 1).len(), 10);
        assert_eq!(DimSlice::new(0, 10, 3).len(), 4);
        assert_eq!(DimSlice::new(5, 5, 1).len(), 0);
        assert_eq!(DimSlice::index(7).len(), 1);
        assert_eq!(
            DimSlice::new(2, 9, 3).indices().collect::<Vec<_>>(),
            vec![2, 5, 8]
        );
    }

    #[test]
    fn test_dim_slice_last() {
        assert_eq!(DimSlice::new(2, 9, 3).last(), Some(8));
        assert_eq!(DimSlice::new(2, 8, 3).last(), Some(5));
        assert_eq!(DimSlice::index(4).last(), Some(4));
        assert_eq!(DimSlice::new(5, 5, 1).last(), None);
    }

    #[test]
    fn test_dtype_itemsize_and_parse() {
        assert_eq!(Dtype::Float32.itemsize(), 4);
        assert_eq!(Dtype::Float64.itemsize(), 8);
        assert_eq!(Dtype::UInt16.itemsize(), 2);
        assert_eq!("FLOAT32".parse::<Dtype>(), Ok(Dtype::Float32));
        assert!("complex64".parse::<Dtype>().is_err());
    }

    #[test]
    fn test_axis_label_parse() {
        let label: AxisLabel = "rotation_angle.degrees".parse().unwrap();
        assert_eq!(label.name, "rotation_angle");
        assert_eq!(label.unit, "degrees");
        assert!("detector".parse::<AxisLabel>().is_err());
    }
}
