//! Preview resolution.
//!
//! A preview reduces the data seen by a stage to a per-dimension
//! `start:stop:step:chunk` selection. A `chunk` greater than one replaces
//! every selected index `i` by the window of `chunk` neighbours centred on
//! `i`, which is how neighbouring rows are handed out together.

pub mod expr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SlabError};
use expr::Symbols;

/// Resolved preview for one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimPreview {
    pub start: usize,
    pub stop: usize,
    pub step: usize,
    pub chunk: usize,
}

impl DimPreview {
    /// Selection covering a whole dimension.
    pub fn full(extent: usize) -> Self {
        Self {
            start: 0,
            stop: extent,
            step: 1,
            chunk: 1,
        }
    }

    /// Number of step positions before window replication.
    pub fn steps(&self) -> usize {
        if self.stop <= self.start {
            0
        } else {
            (self.stop - self.start + self.step - 1) / self.step
        }
    }

    /// Length of the dimension after previewing.
    pub fn effective_len(&self) -> usize {
        self.steps() * self.chunk
    }

    /// Signed index sequence: each step position followed by its window.
    fn signed_indices(&self) -> impl Iterator<Item = i64> + '_ {
        let half = (self.chunk / 2) as i64;
        (self.start..self.stop)
            .step_by(self.step)
            .flat_map(move |base| (0..self.chunk as i64).map(move |k| base as i64 + k - half))
    }

    /// Dataset indices selected by this dimension, in processing order.
    pub fn indices(&self) -> Vec<usize> {
        self.signed_indices().map(|i| i.max(0) as usize).collect()
    }

    fn validate(&self, dim: usize, extent: usize) -> Result<()> {
        if self.stop <= self.start {
            return Err(SlabError::preview(
                dim,
                format!("stop ({}) must be greater than start ({})", self.stop, self.start),
            ));
        }
        if self.step == 0 {
            return Err(SlabError::preview(dim, "step must be at least 1"));
        }
        if self.chunk == 0 {
            return Err(SlabError::preview(dim, "chunk must be at least 1"));
        }
        for index in self.signed_indices() {
            if index < 0 {
                return Err(SlabError::preview(
                    dim,
                    "cannot have a negative value in the slice list",
                ));
            }
            if index as usize >= extent {
                return Err(SlabError::preview(
                    dim,
                    format!("index {} is outside the dimension extent {}", index, extent),
                ));
            }
        }
        Ok(())
    }
}

/// Resolved preview for a whole dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewSpec {
    pub dims: Vec<DimPreview>,
}

impl PreviewSpec {
    /// The identity preview for a shape.
    pub fn identity(shape: &[usize]) -> Self {
        Self {
            dims: shape.iter().map(|&extent| DimPreview::full(extent)).collect(),
        }
    }

    /// Shape seen downstream of the preview.
    pub fn effective_shape(&self) -> Vec<usize> {
        self.dims.iter().map(DimPreview::effective_len).collect()
    }

    /// Whether the preview selects the full shape unchanged.
    pub fn is_identity(&self, shape: &[usize]) -> bool {
        *self == Self::identity(shape)
    }

    pub fn starts(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.start).collect()
    }

    pub fn stops(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.stop).collect()
    }

    pub fn steps(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.step).collect()
    }

    pub fn chunks(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.chunk).collect()
    }

    /// Render as `start:stop:step:chunk` strings.
    pub fn to_entries(&self) -> Vec<String> {
        self.dims
            .iter()
            .map(|d| format!("{}:{}:{}:{}", d.start, d.stop, d.step, d.chunk))
            .collect()
    }
}

/// Fill in the missing components of an entry.
///
/// `:` becomes `0:end:1:1` and a lone value `v` becomes the single index
/// `v:v+1:1:1`; otherwise missing trailing components default to 1.
fn expand_entry(entry: &str, dim: usize) -> Result<[String; 4]> {
    let entry = entry.trim();
    if entry == ":" {
        return Ok(["0".into(), "end".into(), "1".into(), "1".into()]);
    }

    let parts: Vec<&str> = entry.split(':').collect();
    let one = || "1".to_string();
    match parts.as_slice() {
        [value] => Ok([value.to_string(), format!("{}+1", value), one(), one()]),
        [start, stop] => Ok([start.to_string(), stop.to_string(), one(), one()]),
        [start, stop, step] => Ok([start.to_string(), stop.to_string(), step.to_string(), one()]),
        [start, stop, step, chunk] => Ok([
            start.to_string(),
            stop.to_string(),
            step.to_string(),
            chunk.to_string(),
        ]),
        _ => Err(SlabError::preview(
            dim,
            format!("'{}' has more than four components", entry),
        )),
    }
}

fn evaluate_component(src: &str, dim: usize, extent: usize) -> Result<usize> {
    let value = expr::evaluate(src, Symbols::for_extent(extent))
        .map_err(|e| SlabError::preview(dim, format!("'{}': {}", src, e)))?;
    let value = if value > -1 {
        value
    } else {
        extent as i64 + 1 + value
    };
    if value < 0 {
        return Err(SlabError::preview(
            dim,
            format!("'{}' resolves to a negative index", src),
        ));
    }
    Ok(value as usize)
}

/// Resolve a raw preview list against a shape.
///
/// An empty list selects everything. Otherwise there must be one entry per
/// dimension.
pub fn resolve<S: AsRef<str>>(raw: &[S], shape: &[usize]) -> Result<PreviewSpec> {
    if raw.is_empty() {
        return Ok(PreviewSpec::identity(shape));
    }
    if raw.len() != shape.len() {
        return Err(SlabError::preview(
            raw.len().min(shape.len()),
            format!(
                "preview has {} entries but the data has {} dimensions",
                raw.len(),
                shape.len()
            ),
        ));
    }

    let mut dims = Vec::with_capacity(shape.len());
    for (dim, (entry, &extent)) in raw.iter().zip(shape).enumerate() {
        let [start, stop, step, chunk] = expand_entry(entry.as_ref(), dim)?;
        let resolved = DimPreview {
            start: evaluate_component(&start, dim, extent)?,
            stop: evaluate_component(&stop, dim, extent)?,
            step: evaluate_component(&step, dim, extent)?,
            chunk: evaluate_component(&chunk, dim, extent)?,
        };
        resolved.validate(dim, extent)?;
        dims.push(resolved);
    }

    let spec = PreviewSpec { dims };
    debug!(
        entries = ?spec.to_entries(),
        shape = ?spec.effective_shape(),
        "Resolved preview"
    );
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_entry() {
        let spec = resolve(&[":", ":"], &[10, 20]).unwrap();
        assert!(spec.is_identity(&[10, 20]));
        assert_eq!(spec.effective_shape(), vec![10, 20]);
    }

    #[test]
    fn test_empty_is_identity() {
        let raw: [&str; 0] = [];
        let spec = resolve(&raw, &[4, 5, 6]).unwrap();
        assert_eq!(spec.effective_shape(), vec![4, 5, 6]);
    }

    #[test]
    fn test_symbolic_entries() {
        let spec = resolve(&["0:end:4", "mid-2:mid+2:1:1"], &[100, 10]).unwrap();
        assert_eq!(spec.dims[0], DimPreview { start: 0, stop: 100, step: 4, chunk: 1 });
        assert_eq!(spec.dims[1], DimPreview { start: 2, stop: 6, step: 1, chunk: 1 });
        assert_eq!(spec.effective_shape(), vec![25, 4]);
    }

    #[test]
    fn test_single_value_shorthand() {
        let spec = resolve(&["5", ":"], &[10, 3]).unwrap();
        assert_eq!(spec.dims[0], DimPreview { start: 5, stop: 6, step: 1, chunk: 1 });
        assert_eq!(spec.effective_shape(), vec![1, 3]);

        let spec = resolve(&["mid", ":"], &[10, 3]).unwrap();
        assert_eq!(spec.dims[0].start, 4);
        assert_eq!(spec.dims[0].stop, 5);
    }

    #[test]
    fn test_negative_values_count_from_end() {
        let spec = resolve(&["0:-1"], &[10]).unwrap();
        assert_eq!(spec.dims[0].stop, 10);
        let spec = resolve(&["0:-3"], &[10]).unwrap();
        assert_eq!(spec.dims[0].stop, 8);
    }

    #[test]
    fn test_chunk_windows() {
        let spec = resolve(&["2:8:1:3"], &[10]).unwrap();
        assert_eq!(spec.effective_shape(), vec![18]);
        assert_eq!(
            spec.dims[0].indices(),
            vec![1, 2, 3, 2, 3, 4, 3, 4, 5, 4, 5, 6, 5, 6, 7, 6, 7, 8]
        );
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            resolve(&["5:5"], &[10]),
            Err(SlabError::Preview { dim: 0, .. })
        ));
        assert!(resolve(&["0:4:1:3"], &[10]).is_err());
        assert!(resolve(&["0:20"], &[10]).is_err());
        assert!(resolve(&["0:end:0"], &[10]).is_err());
        assert!(resolve(&[":", ":"], &[10]).is_err());
        assert!(resolve(&["1:2:3:4:5"], &[10]).is_err());
        assert!(resolve(&["0:rm"], &[10]).is_err());
    }
}
