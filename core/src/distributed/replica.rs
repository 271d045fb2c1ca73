//! Replication of an encoder across workers.
//!
//! A data-parallel replica holds a full copy of the weights and runs the
//! forward pass on its contiguous shard of the batch. The shards are then
//! all-gathered, so every worker returns the output a single worker would
//! have computed for the whole batch.

use super::backend::CollectiveBackend;
use crate::models::encoder::{EncoderConfig, OptimizedEncoder};
use crate::models::traits::Encoder;
use crate::nn::dropout::Mode;
use crate::nn::module::Module;
use crate::nn::transformer::AttentionMask;
use crate::tensor::{Result, Tensor, TensorElem, TensorError, scalar};
use num_traits::Float;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStrategy {
    Single,
    DataParallel,
}

impl FromStr for ReplicationStrategy {
    type Err = TensorError;

    /// Accepts `"single"` and `"data-parallel"` (or its short form `"data"`).
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "data-parallel" | "data" => Ok(Self::DataParallel),
            other => Err(TensorError::Configuration(format!(
                "unknown replication strategy '{other}', expected 'single' or 'data-parallel'"
            ))),
        }
    }
}

impl fmt::Display for ReplicationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::DataParallel => write!(f, "data-parallel"),
        }
    }
}

/// One worker of a data-parallel group.
#[derive(Debug)]
pub struct DataParallel<T: TensorElem, B: CollectiveBackend> {
    encoder: OptimizedEncoder<T>,
    backend: B,
}

impl<T: TensorElem + Float, B: CollectiveBackend> DataParallel<T, B> {
    pub fn new(encoder: OptimizedEncoder<T>, backend: B) -> Result<Self> {
        check_world(backend.world_size(), backend.rank())?;
        Ok(Self { encoder, backend })
    }

    pub fn rank(&self) -> usize {
        self.backend.rank()
    }

    pub fn world_size(&self) -> usize {
        self.backend.world_size()
    }

    pub fn encoder(&self) -> &OptimizedEncoder<T> {
        &self.encoder
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Batch rows `[rank * batch / W, (rank + 1) * batch / W)` owned by this
    /// worker. Shards are contiguous, cover the batch and may be empty.
    pub fn shard_range(&self, batch: usize) -> Range<usize> {
        let (rank, world) = (self.rank(), self.world_size());
        rank * batch / world..(rank + 1) * batch / world
    }

    /// Replaces every parameter with its mean over all workers.
    pub fn sync_parameters(&mut self) -> Result<()> {
        let world: T = scalar(self.backend.world_size() as f64)?;
        let backend = &self.backend;
        for param in self.encoder.parameters_mut() {
            let flat = Tensor::new(param.data.to_vec(), [1, param.data.len()])?;
            let summed = backend.all_reduce_sum(&flat)?;
            for (dst, &src) in param.data.iter_mut().zip(summed.data()) {
                *dst = src / world;
            }
        }
        Ok(())
    }
}

impl<T: TensorElem + Float, B: CollectiveBackend> Encoder<T> for DataParallel<T, B> {
    fn forward_with_mode(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        mode: Mode,
    ) -> Result<Tensor<T, 3>> {
        // Every rank sees the same input, so every rank fails here or none does
        // and no worker is left waiting in the gather.
        self.encoder.stack().check_input(x, mask)?;
        let [b, l, e] = *x.shape();

        let shard = self.shard_range(b);
        let len = shard.len();
        let local = if len == 0 {
            Tensor::zeros([0, l, e])
        } else {
            let x_local = x.narrow(shard.start, len)?;
            let mask_local = mask.map(|m| m.narrow_batch(shard.start, len)).transpose()?;
            self.encoder
                .forward_with_mode(&x_local, mask_local.as_ref(), mode.for_worker(self.rank()))?
        };

        let gathered = self.backend.all_gather(&local.reshape([len, l * e])?, 0)?;
        gathered.reshape([b, l, e])
    }

    fn config(&self) -> &EncoderConfig {
        self.encoder.config()
    }
}

/// What [`replicate`] hands back to a worker.
#[derive(Debug)]
pub enum Replicated<T: TensorElem, B: CollectiveBackend> {
    Single(OptimizedEncoder<T>),
    DataParallel(DataParallel<T, B>),
}

impl<T: TensorElem + Float, B: CollectiveBackend> Replicated<T, B> {
    pub fn strategy(&self) -> ReplicationStrategy {
        match self {
            Self::Single(_) => ReplicationStrategy::Single,
            Self::DataParallel(_) => ReplicationStrategy::DataParallel,
        }
    }
}

impl<T: TensorElem + Float, B: CollectiveBackend> Encoder<T> for Replicated<T, B> {
    fn forward_with_mode(
        &self,
        x: &Tensor<T, 3>,
        mask: Option<&AttentionMask>,
        mode: Mode,
    ) -> Result<Tensor<T, 3>> {
        match self {
            Self::Single(encoder) => encoder.forward_with_mode(x, mask, mode),
            Self::DataParallel(replica) => replica.forward_with_mode(x, mask, mode),
        }
    }

    fn config(&self) -> &EncoderConfig {
        match self {
            Self::Single(encoder) => encoder.config(),
            Self::DataParallel(replica) => replica.config(),
        }
    }
}

fn check_world(worker_count: usize, worker_rank: usize) -> Result<()> {
    if worker_count == 0 {
        return Err(TensorError::Configuration(
            "worker_count must be at least 1".to_string(),
        ));
    }
    if worker_rank >= worker_count {
        return Err(TensorError::Configuration(format!(
            "worker_rank {worker_rank} out of range for {worker_count} workers"
        )));
    }
    Ok(())
}

/// Wraps `encoder` for one worker of a group.
///
/// A data-parallel request with a single worker yields a plain encoder. For
/// more workers, `backend` must describe the same world as `worker_count`
/// and `worker_rank`.
pub fn replicate<T, B>(
    encoder: OptimizedEncoder<T>,
    strategy: ReplicationStrategy,
    worker_count: usize,
    worker_rank: usize,
    backend: B,
) -> Result<Replicated<T, B>>
where
    T: TensorElem + Float,
    B: CollectiveBackend,
{
    check_world(worker_count, worker_rank)?;

    if strategy == ReplicationStrategy::Single || worker_count == 1 {
        log::info!(
            "replication: single worker (requested {strategy}, {worker_count} worker(s), rank {worker_rank})"
        );
        return Ok(Replicated::Single(encoder));
    }

    if backend.world_size() != worker_count || backend.rank() != worker_rank {
        return Err(TensorError::Configuration(format!(
            "backend is rank {} of {}, expected rank {worker_rank} of {worker_count}",
            backend.rank(),
            backend.world_size()
        )));
    }
    log::info!("replication: data-parallel, world size {worker_count}, rank {worker_rank}");
    Ok(Replicated::DataParallel(DataParallel::new(encoder, backend)?))
}

/// Builds a preset encoder and replicates it.
///
/// Multi-worker data parallelism uses [`EncoderConfig::distributed`];
/// everything else uses [`EncoderConfig::base`].
pub fn create_replica<T, B>(
    strategy: ReplicationStrategy,
    worker_count: usize,
    worker_rank: usize,
    backend: B,
) -> Result<Replicated<T, B>>
where
    T: TensorElem + Float,
    B: CollectiveBackend,
{
    let config = if strategy == ReplicationStrategy::DataParallel && worker_count > 1 {
        EncoderConfig::distributed()
    } else {
        EncoderConfig::base()
    };
    let encoder = OptimizedEncoder::new(config)?;
    replicate(encoder, strategy, worker_count, worker_rank, backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::backend::LocalBackend;
    use crate::distributed::cpu_backend::CpuBackend;

    fn encoder(seed: u64) -> OptimizedEncoder<f64> {
        let config = EncoderConfig::new(1, 2, 8, 0.0)
            .with_max_len(16)
            .with_init_seed(seed);
        OptimizedEncoder::new(config).unwrap()
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("single".parse::<ReplicationStrategy>().unwrap(), ReplicationStrategy::Single);
        assert_eq!(
            "Data-Parallel".parse::<ReplicationStrategy>().unwrap(),
            ReplicationStrategy::DataParallel
        );
        assert_eq!("data".parse::<ReplicationStrategy>().unwrap(), ReplicationStrategy::DataParallel);
        assert!(matches!(
            "pipeline".parse::<ReplicationStrategy>(),
            Err(TensorError::Configuration(_))
        ));
        assert_eq!(ReplicationStrategy::DataParallel.to_string(), "data-parallel");
    }

    #[test]
    fn test_replicate_validation() {
        assert!(replicate(encoder(0), ReplicationStrategy::Single, 0, 0, LocalBackend).is_err());
        assert!(replicate(encoder(0), ReplicationStrategy::DataParallel, 2, 2, LocalBackend).is_err());
        // LocalBackend is a world of one, not two.
        assert!(replicate(encoder(0), ReplicationStrategy::DataParallel, 2, 0, LocalBackend).is_err());
    }

    #[test]
    fn test_single_worker_degrades_to_single() {
        let r = replicate(encoder(0), ReplicationStrategy::DataParallel, 1, 0, LocalBackend).unwrap();
        assert_eq!(r.strategy(), ReplicationStrategy::Single);
    }

    #[test]
    fn test_shard_ranges_cover_batch() {
        let ranges: Vec<Vec<Range<usize>>> = [1usize, 3, 5, 8]
            .iter()
            .map(|&batch| {
                CpuBackend::ring(3)
                    .into_iter()
                    .map(|backend| DataParallel::new(encoder(0), backend).unwrap().shard_range(batch))
                    .collect()
            })
            .collect();
        assert_eq!(ranges[0], vec![0..0, 0..0, 0..1]);
        assert_eq!(ranges[1], vec![0..1, 1..2, 2..3]);
        assert_eq!(ranges[2], vec![0..1, 1..3, 3..5]);
        assert_eq!(ranges[3], vec![0..2, 2..5, 5..8]);
    }

    #[test]
    fn test_sync_parameters_averages() {
        let handles: Vec<_> = CpuBackend::ring(2)
            .into_iter()
            .map(|backend| {
                std::thread::spawn(move || {
                    let seed = backend.rank() as u64;
                    let mut replica = DataParallel::new(encoder(seed), backend).unwrap();
                    replica.sync_parameters().unwrap();
                    replica
                        .encoder()
                        .parameters()
                        .iter()
                        .flat_map(|p| p.data.to_vec())
                        .collect::<Vec<f64>>()
                })
            })
            .collect();
        let synced: Vec<Vec<f64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(synced[0], synced[1]);

        let a = encoder(0);
        let b = encoder(1);
        let expected: Vec<f64> = a
            .parameters()
            .iter()
            .zip(b.parameters())
            .flat_map(|(p, q)| {
                p.data
                    .iter()
                    .zip(q.data)
                    .map(|(x, y)| (x + y) / 2.0)
                    .collect::<Vec<_>>()
            })
            .collect();
        for (got, want) in synced[0].iter().zip(&expected) {
            assert!((got - want).abs() < 1e-12);
        }
    }
}
