//! # Calorimeter Transformer Training Binary
//!
//! Trains a photon-to-cluster transformer on a JSON event file (or synthetic
//! events) and exports a fixed-length simulator checkpoint.
//!
//! ## Usage
//!
//! ```bash
//! # Quick synthetic run
//! cargo run --release --bin calo_train -- --epochs 3
//!
//! # Train on real events and export
//! cargo run --release --bin calo_train -- \
//!     --data data/events.json \
//!     --epochs 20 \
//!     --output checkpoints/export
//! ```

use calo_transformer::{
    checkpoint::save_checkpoint,
    dataset::{DataLoader, PointCloudDataset},
    embedding::SeqOrderConfig,
    schedulers::AttentionDecay,
    simulator::{ExportSimulator, Simulator},
    training::{Trainer, TrainingConfig},
    transformer::{OutputActivation, TransformerConfig},
};
use candle_core::Device;
use clap::Parser;

/// Calorimeter transformer trainer
#[derive(Parser, Debug)]
#[command(name = "calo_train")]
#[command(about = "Train a photon-to-cluster transformer and export a simulator")]
struct Args {
    /// Path to a JSON event file; synthetic events are generated when omitted
    #[arg(long, short = 'd')]
    data: Option<String>,

    /// Number of synthetic events (ignored with --data)
    #[arg(long, default_value = "512")]
    events: usize,

    /// Photon hits per synthetic event
    #[arg(long, default_value = "10")]
    src_len: usize,

    /// Cluster responses per synthetic event
    #[arg(long, default_value = "12")]
    tgt_len: usize,

    /// Number of training epochs
    #[arg(long, short = 'e', default_value = "10")]
    epochs: usize,

    /// Batch size
    #[arg(long, short = 'b', default_value = "32")]
    batch_size: usize,

    /// Warmup steps of the learning-rate schedule
    #[arg(long, default_value = "1000")]
    warmup_steps: usize,

    /// Fraction of events held out for validation
    #[arg(long, default_value = "0.1")]
    val_ratio: f64,

    /// Checkpoint directory for the exported simulator
    #[arg(long, short = 'o', default_value = "checkpoints/export")]
    output: String,

    /// Generation length frozen into the export (defaults to the target length)
    #[arg(long)]
    max_length: Option<usize>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    println!("Calorimeter Transformer Trainer");
    println!("================================\n");

    let device = Device::Cpu;

    let dataset = match &args.data {
        Some(path) => {
            println!("[LOAD] Reading events from {}", path);
            PointCloudDataset::from_json(path)?
        }
        None => {
            println!("[DATA] Generating {} synthetic events", args.events);
            PointCloudDataset::synthetic(args.events, args.src_len, args.tgt_len, 3, 3)?
        }
    };
    println!(
        "[DATA] {} events: {} hits x {} -> {} clusters x {}",
        dataset.len(),
        dataset.src_len(),
        dataset.photon_depth(),
        dataset.tgt_len(),
        dataset.cluster_depth()
    );

    let model_config = TransformerConfig {
        source_depth: dataset.photon_depth(),
        output_depth: dataset.cluster_depth(),
        encoder_seq_ord: SeqOrderConfig {
            latent_dim: 32,
            max_length: dataset.src_len().max(dataset.tgt_len()) * 4,
            normalization: 128.0,
            dropout_rate: 0.1,
        },
        decoder_seq_ord: SeqOrderConfig {
            latent_dim: 32,
            max_length: dataset.src_len().max(dataset.tgt_len()) * 4,
            normalization: 128.0,
            dropout_rate: 0.1,
        },
        // x/y unconstrained, energy fraction bounded for 3-feature clusters
        output_activations: if dataset.cluster_depth() == 3 {
            vec![
                OutputActivation::Linear,
                OutputActivation::Linear,
                OutputActivation::Sigmoid,
            ]
        } else {
            vec![OutputActivation::Linear]
        },
        ..TransformerConfig::default()
    };

    let training_config = TrainingConfig {
        batch_size: args.batch_size,
        epochs: args.epochs,
        ..TrainingConfig::default()
    };

    let scheduler = Box::new(AttentionDecay::new(
        model_config.decoder_depth,
        args.warmup_steps,
    )?);
    let mut trainer = Trainer::new(model_config, training_config, scheduler, &device)?;

    let default_max_length = dataset.tgt_len();
    let (train_set, val_set) = dataset.train_val_split(args.val_ratio)?;
    let mut train_loader = DataLoader::new(train_set, args.batch_size, true, device.clone())?;
    let mut val_loader = DataLoader::new(val_set, args.batch_size, false, device.clone())?;

    println!(
        "[TRAIN] {} epochs, {} batches per epoch\n",
        args.epochs,
        train_loader.num_batches()
    );
    for epoch in 1..=args.epochs {
        let train_loss = trainer.train_epoch(&mut train_loader)?;
        let val_loss = trainer.evaluate(&mut val_loader)?;
        println!(
            "Epoch {:3}: train_loss={:.4}, val_loss={:.4}",
            epoch, train_loss, val_loss
        );
    }
    println!("\n[DONE] {}", trainer.metrics().summary());

    // Export: freeze the start token and generation length with the weights
    let max_length = args.max_length.unwrap_or(default_max_length);
    let probe = candle_core::Tensor::zeros(
        (1, 1, trainer.model().output_depth()),
        candle_core::DType::F32,
        &device,
    )?;
    let start_token = trainer.model().get_start_token(&probe)?;
    save_checkpoint(
        trainer.model().config(),
        &start_token,
        max_length,
        trainer.var_map(),
        &args.output,
        Some(trainer.global_step()),
        Some(trainer.metrics().best_eval_loss),
    )?;
    println!("[SAVE] Exported simulator checkpoint to {}", args.output);

    // smoke-test the export on one validation batch
    let sim = Simulator::new(trainer.model(), start_token)?;
    let export = ExportSimulator::new(sim, max_length)?;
    val_loader.reset();
    if let Some(batch) = val_loader.next_batch() {
        let generated = export.generate(&batch?.photon)?;
        println!("[CHECK] Generated {:?} from a validation batch", generated.dims());
    }

    Ok(())
}
