//! # Calorimeter Transformer
//!
//! A sequence-to-sequence Transformer for physics-detector simulation: a
//! variable-length set of photon hits goes in, a variable-length set of
//! calorimeter cluster responses comes out. The attention stack is
//! non-standard in a few ways:
//! - permutation-sensitive sequence-order embeddings over unordered point sets
//! - modulated layer normalization conditioned on an external latent vector
//! - admin-style residual scaling to stabilize deep decoder stacks
//! - an autoregressive generation loop driven by a learned start token
//!
//! Training is teacher-forced MSE, optionally adversarially regularized by a
//! deep-sets discriminator under divergence-based loss strategies.
//!
//! ## Architecture
//!
//! ```text
//! photon hits ──► SeqOrderEmbedding ──► Encoder ─────────┐
//!                                                  condition sequence
//! clusters ────► SeqOrderEmbedding ──► Decoder ◄─────────┘
//!                (causal self-attn + cross-attn + MLP, admin-scaled)
//!                                  │
//!                      output projection + per-channel activations
//! ```
//!
//! At inference a [`simulator::Simulator`] unrolls the decoder one position at
//! a time from a start token; [`simulator::ExportSimulator`] freezes the
//! generation length for the serialized deployment contract.

// Building blocks
pub mod attention;
pub mod embedding;
pub mod error;
pub mod norm;

// Model stacks
pub mod decoder;
pub mod discriminator;
pub mod encoder;
pub mod synthesis;
pub mod transformer;

// Objectives and evaluation
pub mod losses;
pub mod metrics;
pub mod schedulers;
pub mod scores;

// Training and inference infrastructure
pub mod checkpoint;
pub mod dataset;
pub mod simulator;
pub mod training;


// Re-exports from the building blocks
pub use attention::{causal_mask, FeedForward, MultiHeadAttention};
pub use embedding::{SeqOrderConfig, SeqOrderEmbedding};
pub use error::CaloError;
pub use norm::ModulatedLayerNorm;

// Re-exports from the model stacks
pub use decoder::{AdminResScale, Decoder, DecoderConfig, DecoderLayer};
pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use encoder::{Encoder, EncoderConfig, EncoderLayer};
pub use synthesis::{SynthesisConfig, SynthesisLayer, SynthesisNet};
pub use transformer::{
    OutputActivation, StartTokenInitializer, Transformer, TransformerConfig, TransformerOutput,
};

// Re-exports from objectives and schedules
pub use losses::{AdversarialLoss, JSDivergence, KLDivergence};
pub use metrics::Metric;
pub use schedulers::{AttentionDecay, CosineDecay, ExponentialDecay, LrScheduler};
pub use scores::earth_mover_distance;

// Re-exports from the infrastructure
pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointMetadata};
pub use dataset::{Batch, DataLoader, Event, PointCloudDataset};
pub use simulator::{ExportSimulator, Simulator};
pub use training::{AdversarialTrainer, Trainer, TrainingConfig, TrainingMetrics};

/// Result type for all fallible operations in this crate
pub type CaloResult<T> = Result<T, CaloError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        // Model types
        AdminResScale,
        Decoder,
        DecoderConfig,
        Encoder,
        EncoderConfig,
        OutputActivation,
        StartTokenInitializer,
        SynthesisNet,
        Transformer,
        TransformerConfig,

        // Objectives and schedules
        AdversarialLoss,
        AttentionDecay,
        JSDivergence,
        KLDivergence,
        LrScheduler,

        // Training and inference
        AdversarialTrainer,
        DataLoader,
        ExportSimulator,
        PointCloudDataset,
        Simulator,
        Trainer,
        TrainingConfig,

        // Result type
        CaloError,
        CaloResult,
    };
}
