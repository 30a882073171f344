//! # Model Checkpointing
//!
//! Save and reload trained transformers together with everything the export
//! contract needs: the start token and the frozen generation length, so a
//! reloaded checkpoint drives a fixed-signature simulator with identical
//! numerical behavior.
//!
//! ## File Format
//!
//! Checkpoints are stored as a directory containing:
//! - `config.json` - model configuration, start token, export metadata
//! - `model.safetensors` - model weights in safetensors format
//!
//! ## Usage
//!
//! ```rust,ignore
//! use calo_transformer::checkpoint::{save_checkpoint, load_checkpoint};
//!
//! save_checkpoint(model.config(), &start_token, 12, &varmap, "checkpoints/export", None, None)?;
//! let (model, start_token, varmap, metadata) = load_checkpoint("checkpoints/export", &device)?;
//! ```

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::fs;
use std::path::Path;

use crate::error::CaloError;
use crate::transformer::{Transformer, TransformerConfig};
use crate::CaloResult;

/// Metadata stored with checkpoints.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    /// Model configuration
    pub config: TransformerConfig,
    /// Start token rows; a single row broadcasts over any batch
    pub start_token: Vec<Vec<f32>>,
    /// Frozen generation length of the exported simulator
    pub max_length: usize,
    /// Training step when saved
    pub step: Option<usize>,
    /// Training loss when saved
    pub loss: Option<f64>,
    /// Timestamp
    pub timestamp: String,
    /// Version info
    pub version: String,
}

impl CheckpointMetadata {
    pub fn new(config: TransformerConfig, start_token: Vec<Vec<f32>>, max_length: usize) -> Self {
        Self {
            config,
            start_token,
            max_length,
            step: None,
            loss: None,
            timestamp: unix_timestamp(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_training_info(mut self, step: usize, loss: f64) -> Self {
        self.step = Some(step);
        self.loss = Some(loss);
        self
    }
}

fn unix_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{}", secs)
}

/// Start token rows from a rank-1 or rank-2 tensor.
fn token_rows(start_token: &Tensor) -> CaloResult<Vec<Vec<f32>>> {
    match start_token.dims() {
        [_] => Ok(vec![start_token.to_vec1::<f32>()?]),
        [_, _] => Ok(start_token.to_vec2::<f32>()?),
        dims => Err(CaloError::shape(
            "start token of rank 1 or 2".to_string(),
            format!("rank {} tensor {:?}", dims.len(), dims),
        )),
    }
}

/// Save a model checkpoint to a directory.
///
/// Creates the directory structure:
/// ```text
/// checkpoint_dir/
/// ├── config.json       # configuration, start token, export metadata
/// └── model.safetensors # model weights
/// ```
#[allow(clippy::too_many_arguments)]
pub fn save_checkpoint(
    config: &TransformerConfig,
    start_token: &Tensor,
    max_length: usize,
    varmap: &VarMap,
    checkpoint_dir: impl AsRef<Path>,
    step: Option<usize>,
    loss: Option<f64>,
) -> CaloResult<()> {
    let dir = checkpoint_dir.as_ref();
    fs::create_dir_all(dir)?;

    let mut metadata = CheckpointMetadata::new(config.clone(), token_rows(start_token)?, max_length);
    if let (Some(s), Some(l)) = (step, loss) {
        metadata = metadata.with_training_info(s, l);
    }

    let config_json = serde_json::to_string_pretty(&metadata)
        .map_err(|e| CaloError::Serialization(e.to_string()))?;
    fs::write(dir.join("config.json"), config_json)?;

    varmap
        .save(dir.join("model.safetensors"))
        .map_err(|e| CaloError::Serialization(format!("failed to save model: {}", e)))?;

    log::info!("Saved checkpoint to {:?}", dir);
    Ok(())
}

/// Load a model checkpoint from a directory.
///
/// Rebuilds the transformer from a fresh variable map, loads the persisted
/// weights into it and reconstructs the start token on `device`.
pub fn load_checkpoint(
    checkpoint_dir: impl AsRef<Path>,
    device: &Device,
) -> CaloResult<(Transformer, Tensor, VarMap, CheckpointMetadata)> {
    let dir = checkpoint_dir.as_ref();

    let config_str = fs::read_to_string(dir.join("config.json"))?;
    let metadata: CheckpointMetadata =
        serde_json::from_str(&config_str).map_err(|e| CaloError::Serialization(e.to_string()))?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = Transformer::new(metadata.config.clone(), vb)?;

    let mut varmap = varmap;
    varmap
        .load(dir.join("model.safetensors"))
        .map_err(|e| CaloError::Serialization(format!("failed to load model: {}", e)))?;

    let rows = metadata.start_token.len();
    let depth = metadata.start_token.first().map_or(0, Vec::len);
    let flat: Vec<f32> = metadata.start_token.iter().flatten().copied().collect();
    let start_token = Tensor::from_vec(flat, (rows, depth), device)?;

    log::info!("Loaded checkpoint from {:?}", dir);
    Ok((model, start_token, varmap, metadata))
}

/// Check if a checkpoint exists.
pub fn checkpoint_exists(checkpoint_dir: impl AsRef<Path>) -> bool {
    let dir = checkpoint_dir.as_ref();
    dir.join("config.json").exists() && dir.join("model.safetensors").exists()
}

/// List available checkpoints in a directory, most recent step first.
pub fn list_checkpoints(
    checkpoints_root: impl AsRef<Path>,
) -> CaloResult<Vec<(String, CheckpointMetadata)>> {
    let root = checkpoints_root.as_ref();
    let mut checkpoints = Vec::new();

    if !root.exists() {
        return Ok(checkpoints);
    }

    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() && checkpoint_exists(&path) {
            if let Ok(config_str) = fs::read_to_string(path.join("config.json")) {
                if let Ok(metadata) = serde_json::from_str::<CheckpointMetadata>(&config_str) {
                    let name = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("unknown")
                        .to_string();
                    checkpoints.push((name, metadata));
                }
            }
        }
    }

    checkpoints.sort_by(|a, b| b.1.step.cmp(&a.1.step));
    Ok(checkpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::SeqOrderConfig;
    use crate::simulator::{ExportSimulator, Simulator};
    use tempfile::TempDir;

    fn tiny_config() -> TransformerConfig {
        TransformerConfig {
            encoder_depth: 16,
            decoder_depth: 16,
            num_layers: 2,
            num_heads: 2,
            key_dim: 8,
            ff_units: 32,
            mlp_units: 32,
            dropout_rate: 0.0,
            encoder_seq_ord: SeqOrderConfig {
                latent_dim: 8,
                max_length: 64,
                normalization: 128.0,
                dropout_rate: 0.0,
            },
            decoder_seq_ord: SeqOrderConfig {
                latent_dim: 8,
                max_length: 64,
                normalization: 128.0,
                dropout_rate: 0.0,
            },
            ..TransformerConfig::default()
        }
    }

    #[test]
    fn test_checkpoint_metadata() {
        let metadata = CheckpointMetadata::new(tiny_config(), vec![vec![0.0; 3]], 12)
            .with_training_info(1000, 0.5);
        assert_eq!(metadata.step, Some(1000));
        assert_eq!(metadata.loss, Some(0.5));
        assert_eq!(metadata.max_length, 12);
    }

    #[test]
    fn test_save_and_load_restores_behavior() {
        let device = Device::Cpu;
        let config = tiny_config();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Transformer::new(config.clone(), vb).unwrap();
        let start_token = Tensor::zeros((1, 3), DType::F32, &device).unwrap();

        let source = Tensor::randn(0f32, 1f32, (4, 10, 3), &device).unwrap();
        let target = Tensor::randn(0f32, 1f32, (4, 12, 3), &device).unwrap();
        let before = model.forward(&source, &target, false).unwrap().output;

        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("export");
        save_checkpoint(
            &config,
            &start_token,
            12,
            &varmap,
            &checkpoint_path,
            Some(100),
            Some(0.25),
        )
        .unwrap();
        assert!(checkpoint_exists(&checkpoint_path));

        let (loaded, loaded_token, _varmap, metadata) =
            load_checkpoint(&checkpoint_path, &device).unwrap();
        assert_eq!(metadata.step, Some(100));
        assert_eq!(metadata.loss, Some(0.25));
        assert_eq!(loaded_token.dims(), &[1, 3]);

        let after = loaded.forward(&source, &target, false).unwrap().output;
        let diff = (before - after)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6, "reloaded model diverges by {}", diff);
    }

    #[test]
    fn test_reloaded_export_simulator_runs() {
        let device = Device::Cpu;
        let config = tiny_config();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _model = Transformer::new(config.clone(), vb).unwrap();
        let start_token = Tensor::zeros((1, 3), DType::F32, &device).unwrap();

        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("export");
        save_checkpoint(&config, &start_token, 6, &varmap, &checkpoint_path, None, None).unwrap();

        let (loaded, loaded_token, _varmap, metadata) =
            load_checkpoint(&checkpoint_path, &device).unwrap();
        let sim = Simulator::new(&loaded, loaded_token).unwrap();
        let export = ExportSimulator::new(sim, metadata.max_length).unwrap();

        let source = Tensor::randn(0f32, 1f32, (3, 8, 3), &device).unwrap();
        let out = export.generate(&source).unwrap();
        assert_eq!(out.dims(), &[3, 6, 3]);
    }

    #[test]
    fn test_list_checkpoints_ordering() {
        let device = Device::Cpu;
        let config = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _model = Transformer::new(config.clone(), vb).unwrap();
        let start_token = Tensor::zeros((1, 3), DType::F32, &device).unwrap();

        let temp_dir = TempDir::new().unwrap();
        let early = temp_dir.path().join("step-10");
        let late = temp_dir.path().join("step-90");
        save_checkpoint(&config, &start_token, 6, &varmap, &early, Some(10), Some(1.0)).unwrap();
        save_checkpoint(&config, &start_token, 6, &varmap, &late, Some(90), Some(0.5)).unwrap();

        let listed = list_checkpoints(temp_dir.path()).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "step-90");
        assert_eq!(listed[1].0, "step-10");
    }
}
