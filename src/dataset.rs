//! # Dataset Loading for Detector Simulation Training
//!
//! Paired point-set events: a variable set of photon hits and the matching
//! calorimeter cluster responses, each a fixed-width feature row (x, y,
//! energy). Supports loading from a JSON file of events and synthetic
//! generation for tests and demos.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use calo_transformer::dataset::{PointCloudDataset, DataLoader};
//!
//! let dataset = PointCloudDataset::from_json("data/events.json")?;
//! let loader = DataLoader::new(dataset, 32, true, device)?;
//! for batch in loader {
//!     // batch.photon: [batch_size, src_len, photon_depth]
//!     // batch.cluster: [batch_size, tgt_len, cluster_depth]
//! }
//! ```

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::CaloError;
use crate::CaloResult;

/// One photon/cluster event pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Photon hit rows, each `photon_depth` floats
    pub photon: Vec<Vec<f32>>,
    /// Cluster response rows, each `cluster_depth` floats
    pub cluster: Vec<Vec<f32>>,
}

/// Dataset of paired point-set events with fixed per-side shapes.
#[derive(Debug, Clone)]
pub struct PointCloudDataset {
    events: Vec<Event>,
    src_len: usize,
    tgt_len: usize,
    photon_depth: usize,
    cluster_depth: usize,
}

impl PointCloudDataset {
    /// Build from pre-validated events; every event must share the shapes of
    /// the first one.
    pub fn new(events: Vec<Event>) -> CaloResult<Self> {
        let first = events.first().ok_or_else(|| {
            CaloError::InvalidParameter("dataset should contain at least one event".to_string())
        })?;
        let src_len = first.photon.len();
        let tgt_len = first.cluster.len();
        let photon_depth = first.photon.first().map_or(0, Vec::len);
        let cluster_depth = first.cluster.first().map_or(0, Vec::len);
        if src_len == 0 || tgt_len == 0 || photon_depth == 0 || cluster_depth == 0 {
            return Err(CaloError::InvalidParameter(
                "events should have non-empty photon and cluster sides".to_string(),
            ));
        }

        for (i, event) in events.iter().enumerate() {
            let ok = event.photon.len() == src_len
                && event.cluster.len() == tgt_len
                && event.photon.iter().all(|row| row.len() == photon_depth)
                && event.cluster.iter().all(|row| row.len() == cluster_depth);
            if !ok {
                return Err(CaloError::shape(
                    format!(
                        "event shapes ({}, {}) / ({}, {})",
                        src_len, photon_depth, tgt_len, cluster_depth
                    ),
                    format!("event {} differs", i),
                ));
            }
        }

        Ok(Self {
            events,
            src_len,
            tgt_len,
            photon_depth,
            cluster_depth,
        })
    }

    /// Load events from a JSON array file.
    pub fn from_json(path: impl AsRef<Path>) -> CaloResult<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let events: Vec<Event> = serde_json::from_str(&content)
            .map_err(|e| CaloError::Serialization(format!("failed to parse events: {}", e)))?;
        let dataset = Self::new(events)?;
        log::info!(
            "Loaded {} events ({} hits x {} features -> {} clusters x {} features)",
            dataset.len(),
            dataset.src_len,
            dataset.photon_depth,
            dataset.tgt_len,
            dataset.cluster_depth
        );
        Ok(dataset)
    }

    /// Create a synthetic dataset for testing and demos. Cluster rows are a
    /// noisy linear response to the photon rows so there is signal to learn.
    pub fn synthetic(
        num_events: usize,
        src_len: usize,
        tgt_len: usize,
        photon_depth: usize,
        cluster_depth: usize,
    ) -> CaloResult<Self> {
        let mut rng = thread_rng();
        let events: Vec<Event> = (0..num_events)
            .map(|_| {
                let photon: Vec<Vec<f32>> = (0..src_len)
                    .map(|_| (0..photon_depth).map(|_| rng.gen_range(-1.0..1.0)).collect())
                    .collect();
                let centroid: Vec<f32> = (0..photon_depth)
                    .map(|d| photon.iter().map(|row| row[d]).sum::<f32>() / src_len as f32)
                    .collect();
                let cluster: Vec<Vec<f32>> = (0..tgt_len)
                    .map(|_| {
                        (0..cluster_depth)
                            .map(|d| {
                                let base = centroid.get(d % photon_depth.max(1)).copied().unwrap_or(0.0);
                                base + rng.gen_range(-0.1..0.1)
                            })
                            .collect()
                    })
                    .collect();
                Event { photon, cluster }
            })
            .collect();
        Self::new(events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn src_len(&self) -> usize {
        self.src_len
    }

    pub fn tgt_len(&self) -> usize {
        self.tgt_len
    }

    pub fn photon_depth(&self) -> usize {
        self.photon_depth
    }

    pub fn cluster_depth(&self) -> usize {
        self.cluster_depth
    }

    pub fn get(&self, idx: usize) -> Option<&Event> {
        self.events.get(idx)
    }

    pub fn shuffle(&mut self) {
        let mut rng = thread_rng();
        self.events.shuffle(&mut rng);
    }

    /// Split into train and validation sets.
    pub fn train_val_split(mut self, val_ratio: f64) -> CaloResult<(Self, Self)> {
        if !(0.0..1.0).contains(&val_ratio) {
            return Err(CaloError::InvalidParameter(format!(
                "`val_ratio` should be in [0, 1), instead {} passed",
                val_ratio
            )));
        }
        self.shuffle();

        let val_size = (self.events.len() as f64 * val_ratio) as usize;
        let val_events = self.events.split_off(self.events.len() - val_size);

        let val = Self {
            events: val_events,
            ..self.clone()
        };
        Ok((self, val))
    }
}

/// A batch of paired event tensors.
#[derive(Debug)]
pub struct Batch {
    /// Photon hits [batch_size, src_len, photon_depth]
    pub photon: Tensor,
    /// Cluster responses [batch_size, tgt_len, cluster_depth]
    pub cluster: Tensor,
}

/// DataLoader for batching and iterating over a dataset.
pub struct DataLoader {
    dataset: PointCloudDataset,
    batch_size: usize,
    shuffle: bool,
    indices: Vec<usize>,
    position: usize,
    device: Device,
}

impl DataLoader {
    pub fn new(
        dataset: PointCloudDataset,
        batch_size: usize,
        shuffle: bool,
        device: Device,
    ) -> CaloResult<Self> {
        if batch_size < 1 {
            return Err(CaloError::InvalidParameter(format!(
                "`batch_size` should be >= 1, instead {} passed",
                batch_size
            )));
        }
        let indices: Vec<usize> = (0..dataset.len()).collect();
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            indices,
            position: 0,
            device,
        })
    }

    /// Reset the iterator and optionally shuffle.
    pub fn reset(&mut self) {
        self.position = 0;
        if self.shuffle {
            let mut rng = thread_rng();
            self.indices.shuffle(&mut rng);
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn next_batch(&mut self) -> Option<CaloResult<Batch>> {
        if self.position >= self.dataset.len() {
            return None;
        }

        let end = (self.position + self.batch_size).min(self.dataset.len());
        let batch_indices = &self.indices[self.position..end];
        self.position = end;

        Some(self.create_batch(batch_indices))
    }

    fn create_batch(&self, indices: &[usize]) -> CaloResult<Batch> {
        let batch_size = indices.len();
        let (src_len, p_depth) = (self.dataset.src_len, self.dataset.photon_depth);
        let (tgt_len, c_depth) = (self.dataset.tgt_len, self.dataset.cluster_depth);

        let mut photon_data = Vec::with_capacity(batch_size * src_len * p_depth);
        let mut cluster_data = Vec::with_capacity(batch_size * tgt_len * c_depth);
        for &idx in indices {
            let event = &self.dataset.events[idx];
            for row in &event.photon {
                photon_data.extend_from_slice(row);
            }
            for row in &event.cluster {
                cluster_data.extend_from_slice(row);
            }
        }

        let photon = Tensor::from_vec(photon_data, (batch_size, src_len, p_depth), &self.device)?;
        let cluster = Tensor::from_vec(cluster_data, (batch_size, tgt_len, c_depth), &self.device)?;
        Ok(Batch { photon, cluster })
    }
}

impl Iterator for DataLoader {
    type Item = CaloResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}
