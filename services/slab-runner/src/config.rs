//! Pipeline description loaded from YAML.
//!
//! A config names the engine settings, the synthetic source datasets the
//! run starts from and the ordered stages. `${VAR}` references are expanded
//! from the environment before parsing.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use slab_core::{
    DatasetDescriptor, Dtype, EngineConfig, PaddingDirective, PatternName, Pipeline, Stage,
    StageInput, StageOutput,
};

use crate::processors::build_processor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub datasets: Vec<DatasetConfig>,
    pub stages: Vec<StageConfig>,
}

/// A source dataset generated before the first stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    pub shape: Vec<usize>,
    #[serde(default)]
    pub dtype: Dtype,
    /// `name.unit` per dimension
    #[serde(default)]
    pub axis_labels: Vec<String>,
    pub patterns: Vec<PatternConfig>,
    #[serde(default)]
    pub preview: Vec<String>,
    #[serde(default)]
    pub revert_preview: bool,
    #[serde(default)]
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub name: PatternName,
    pub core: Vec<usize>,
    pub slice: Vec<usize>,
}

/// How source values are generated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SourceConfig {
    /// Each element holds its row-major flat index.
    #[default]
    Ramp,
    Constant {
        value: f32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub processor: ProcessorConfig,
    pub inputs: Vec<StageInputConfig>,
    pub outputs: Vec<StageOutputConfig>,
    #[serde(default)]
    pub max_transfer_frames: Option<usize>,
    #[serde(default)]
    pub max_process_frames: Option<usize>,
    #[serde(default)]
    pub fixed_length: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInputConfig {
    pub dataset: String,
    pub pattern: PatternName,
    /// Halo added to every core dimension.
    #[serde(default)]
    pub pad_frame_edges: usize,
    /// Neighbouring frames added along the main direction.
    #[serde(default)]
    pub pad_multi_frames: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutputConfig {
    pub dataset: String,
    pub pattern: PatternName,
    #[serde(default)]
    pub keep_padding: bool,
}

/// Builtin frame processors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProcessorConfig {
    Passthrough,
    Scale { factor: f32 },
    /// Mean over a `(2 * radius + 1)` window within each frame.
    BoxMean { radius: usize },
}

impl RunnerConfig {
    /// Load a pipeline config from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read pipeline config from {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = shellexpand::env(content)
            .context("Failed to expand environment variables in pipeline config")?;
        let config: RunnerConfig =
            serde_yaml::from_str(&expanded).context("Failed to parse pipeline config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Check names and stage wiring.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            bail!("pipeline config defines no stages");
        }

        let mut known = HashSet::new();
        for dataset in &self.datasets {
            if !known.insert(dataset.name.as_str()) {
                bail!("dataset '{}' is defined twice", dataset.name);
            }
            if dataset.patterns.is_empty() {
                bail!("dataset '{}' defines no patterns", dataset.name);
            }
        }

        let mut stage_names = HashSet::new();
        for stage in &self.stages {
            if !stage_names.insert(stage.name.as_str()) {
                bail!("stage '{}' is defined twice", stage.name);
            }
            if stage.inputs.is_empty() || stage.outputs.is_empty() {
                bail!("stage '{}' needs at least one input and one output", stage.name);
            }
            for input in &stage.inputs {
                if !known.contains(input.dataset.as_str()) {
                    bail!(
                        "stage '{}' reads '{}' before any source or stage provides it",
                        stage.name,
                        input.dataset
                    );
                }
            }
            if matches!(stage.processor, ProcessorConfig::BoxMean { .. })
                && stage
                    .max_process_frames
                    .unwrap_or(self.engine.max_process_frames)
                    != 1
            {
                bail!("stage '{}': box-mean processes one frame at a time", stage.name);
            }
            for output in &stage.outputs {
                if !known.insert(output.dataset.as_str()) {
                    bail!(
                        "stage '{}' writes '{}', which already exists",
                        stage.name,
                        output.dataset
                    );
                }
            }
        }
        Ok(())
    }

    /// Descriptors of the source datasets, previews applied.
    pub fn descriptors(&self) -> Result<Vec<DatasetDescriptor>> {
        self.datasets
            .iter()
            .map(|d| {
                let mut desc = DatasetDescriptor::new(d.name.clone(), &d.shape, d.dtype);
                if !d.axis_labels.is_empty() {
                    desc.set_axis_labels(&d.axis_labels)?;
                }
                for p in &d.patterns {
                    desc.add_pattern(p.name, &p.core, &p.slice)?;
                }
                desc.finalise_patterns();
                if !d.preview.is_empty() {
                    desc.set_preview(&d.preview, d.revert_preview)?;
                }
                Ok(desc)
            })
            .collect::<slab_core::Result<_>>()
            .context("Invalid source dataset")
    }

    /// Assemble the stages into a pipeline.
    pub fn pipeline(&self) -> Result<Pipeline> {
        let mut known: HashMap<String, DatasetDescriptor> = self
            .descriptors()?
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();

        let mut pipeline = Pipeline::new();
        for config in &self.stages {
            let processor = build_processor(&config.processor, config.outputs.len());
            let mut stage = Stage::new(config.name.clone(), processor);
            stage.max_transfer_frames = config.max_transfer_frames;
            stage.max_process_frames = config.max_process_frames;
            stage.fixed_length = config.fixed_length;

            let mut first = None;
            for input in &config.inputs {
                let desc = known
                    .get(&input.dataset)
                    .with_context(|| format!("Unknown dataset '{}'", input.dataset))?;
                let pattern = desc
                    .pattern(input.pattern)
                    .with_context(|| format!("Stage '{}'", config.name))?;

                let mut padding = PaddingDirective::new();
                let halo = input.pad_frame_edges + box_radius(&config.processor);
                if halo > 0 {
                    padding = padding.pad_frame_edges(pattern, halo);
                }
                if input.pad_multi_frames > 0 {
                    padding = padding
                        .pad_multi_frames(pattern, input.pad_multi_frames)
                        .with_context(|| format!("Stage '{}'", config.name))?;
                }

                first.get_or_insert_with(|| desc.clone());
                stage = stage.input(
                    StageInput::new(input.dataset.clone(), input.pattern).with_padding(padding),
                );
            }

            for output in &config.outputs {
                let mut out = StageOutput::new(output.dataset.clone(), output.pattern);
                if output.keep_padding {
                    out = out.keep_padding();
                }
                stage = stage.output(out);

                if let Some(source) = &first {
                    let mut desc =
                        DatasetDescriptor::new(output.dataset.clone(), &source.shape, source.dtype);
                    desc.patterns = source.patterns.clone();
                    known.insert(output.dataset.clone(), desc);
                }
            }
            pipeline = pipeline.stage(stage);
        }
        Ok(pipeline)
    }
}

fn box_radius(processor: &ProcessorConfig) -> usize {
    match processor {
        ProcessorConfig::BoxMean { radius } => *radius,
        _ => 0,
    }
}

impl DatasetConfig {
    /// Generate the stored values of this source.
    pub fn generate(&self) -> Result<ArrayD<f32>> {
        match &self.source {
            SourceConfig::Ramp => {
                let n = self.shape.iter().product::<usize>();
                ArrayD::from_shape_vec(IxDyn(&self.shape), (0..n).map(|v| v as f32).collect())
                    .with_context(|| format!("Cannot generate ramp for '{}'", self.name))
            }
            SourceConfig::Constant { value } => Ok(ArrayD::from_elem(IxDyn(&self.shape), *value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::constant;

    const EXAMPLE: &str = include_str!("../config/pipeline.yaml");

    #[test]
    fn test_example_config_parses() {
        let config = RunnerConfig::from_yaml(EXAMPLE).unwrap();
        assert_eq!(config.datasets.len(), 1);
        assert_eq!(config.stages.len(), 3);
        assert_eq!(config.stages[1].processor, ProcessorConfig::Scale { factor: 0.5 });

        let pipeline = config.pipeline().unwrap();
        let names: Vec<&str> = pipeline.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["copy", "halve", "smooth"]);

        let smooth = &pipeline.stages()[2];
        assert!(!smooth.inputs[0].padding.pads(0));
        assert!(smooth.inputs[0].padding.pads(1));
        assert!(smooth.inputs[0].padding.pads(2));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        fs::write(&path, EXAMPLE).unwrap();
        let config = RunnerConfig::load(&path).unwrap();
        assert_eq!(config.datasets[0].name, "raw");

        let err = RunnerConfig::load(dir.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }

    #[test]
    fn test_unknown_input_rejected() {
        let yaml = r#"
datasets:
  - name: raw
    shape: [4, 4, 4]
    patterns:
      - { name: PROJECTION, core: [1, 2], slice: [0] }
stages:
  - name: s
    processor: { kind: passthrough }
    inputs: [{ dataset: missing, pattern: PROJECTION }]
    outputs: [{ dataset: out, pattern: PROJECTION }]
"#;
        let err = RunnerConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_box_mean_needs_single_frames() {
        let yaml = r#"
datasets:
  - name: raw
    shape: [4, 4, 4]
    patterns:
      - { name: PROJECTION, core: [1, 2], slice: [0] }
stages:
  - name: s
    processor: { kind: box-mean, radius: 1 }
    max_process_frames: 2
    inputs: [{ dataset: raw, pattern: PROJECTION }]
    outputs: [{ dataset: out, pattern: PROJECTION }]
"#;
        assert!(RunnerConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("SLAB_RUNNER_TEST_BUDGET", "4096");
        let yaml = r#"
engine:
  byte_budget: ${SLAB_RUNNER_TEST_BUDGET}
datasets:
  - name: raw
    shape: [2, 3]
    source: { kind: constant, value: 2.5 }
    patterns:
      - { name: SPECTRUM, core: [1], slice: [0] }
stages:
  - name: s
    processor: { kind: passthrough }
    inputs: [{ dataset: raw, pattern: SPECTRUM }]
    outputs: [{ dataset: out, pattern: SPECTRUM }]
"#;
        let config = RunnerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.engine.byte_budget, 4096);
        assert_eq!(config.datasets[0].generate().unwrap(), constant(&[2, 3], 2.5));
    }

    #[test]
    fn test_ramp_source() {
        let dataset = DatasetConfig {
            name: "raw".to_string(),
            shape: vec![2, 3],
            dtype: Dtype::Float32,
            axis_labels: Vec::new(),
            patterns: Vec::new(),
            preview: Vec::new(),
            revert_preview: false,
            source: SourceConfig::Ramp,
        };
        let data = dataset.generate().unwrap();
        assert_eq!(data[[1, 2]], 5.0);
    }
}
