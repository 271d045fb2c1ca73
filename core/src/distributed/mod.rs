//! # Distributed Inference
//!
//! Data parallelism for the encoder: every worker holds the full model,
//! takes a contiguous shard of the batch and the shards are gathered back,
//! so a replica's forward pass is the same function as the single-worker
//! one.
//!
//! ## Module Contents
//!
//! *   [`CollectiveBackend`](backend::CollectiveBackend): the communication
//!     interface (`all_reduce_sum`, `all_gather`).
//!     *   [`LocalBackend`](backend::LocalBackend): a world of one.
//!     *   [`CpuBackend`](cpu_backend::CpuBackend): ring collectives between
//!         threads over `crossbeam` channels.
//! *   [`replicate`](replica::replicate): the replication factory.
//!
//! ## Example
//!
//! ```rust
//! use encoder_rs::distributed::cpu_backend::CpuBackend;
//! use encoder_rs::distributed::replica::{replicate, ReplicationStrategy};
//! use encoder_rs::models::encoder::{EncoderConfig, OptimizedEncoder};
//! use encoder_rs::models::traits::Encoder;
//! use encoder_rs::tensor::Tensor;
//! use std::thread;
//!
//! let config = EncoderConfig::new(1, 2, 8, 0.0);
//! let handles: Vec<_> = CpuBackend::ring(2)
//!     .into_iter()
//!     .enumerate()
//!     .map(|(rank, backend)| {
//!         let config = config.clone();
//!         thread::spawn(move || {
//!             let encoder = OptimizedEncoder::<f32>::new(config).unwrap();
//!             let strategy: ReplicationStrategy = "data-parallel".parse().unwrap();
//!             let replica = replicate(encoder, strategy, 2, rank, backend).unwrap();
//!             let x = Tensor::<f32, 3>::ones([3, 4, 8]);
//!             replica.forward(&x, None, false).unwrap()
//!         })
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     assert_eq!(handle.join().unwrap().shape(), &[3, 4, 8]);
//! }
//! ```

pub mod backend;
pub mod cpu_backend;
pub mod replica;

pub use backend::{CollectiveBackend, LocalBackend};
pub use cpu_backend::CpuBackend;
pub use replica::{
    DataParallel, Replicated, ReplicationStrategy, create_replica, replicate,
};
