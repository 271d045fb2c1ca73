use super::backend::{CollectiveBackend, check_gather_dim};
use crate::tensor::{Result, Tensor, TensorElem, TensorError, scalar};
use crossbeam::channel::{Receiver, Sender, unbounded};

/// One message travelling around the ring.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub shape: [usize; 2],
    pub data: Vec<f64>,
}

/// A CPU collective backend connecting worker threads in a ring.
///
/// Each worker receives from rank - 1 and sends to rank + 1 over `crossbeam`
/// channels. All-reduce is the two-phase ring algorithm (scatter-reduce,
/// then all-gather of the reduced chunks); all-gather passes every worker's
/// tensor once around the ring. Values travel as `f64`.
#[derive(Debug)]
pub struct CpuBackend {
    rank: usize,
    world_size: usize,
    left_rx: Receiver<Packet>,
    right_tx: Sender<Packet>,
}

impl CpuBackend {
    pub fn new(
        rank: usize,
        world_size: usize,
        left_rx: Receiver<Packet>,
        right_tx: Sender<Packet>,
    ) -> Self {
        Self {
            rank,
            world_size,
            left_rx,
            right_tx,
        }
    }

    /// Builds a connected ring of `world_size` backends, indexed by rank.
    ///
    /// Channel `i` carries messages from rank `i` to rank `i + 1`.
    pub fn ring(world_size: usize) -> Vec<Self> {
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();
        (0..world_size)
            .map(|rank| {
                let left = (rank + world_size - 1) % world_size;
                Self::new(rank, world_size, rxs[left].clone(), txs[rank].clone())
            })
            .collect()
    }

    fn send(&self, packet: Packet) -> Result<()> {
        self.right_tx.send(packet).map_err(|_| {
            TensorError::Communication(format!(
                "rank {}: right neighbour disconnected",
                self.rank
            ))
        })
    }

    fn recv(&self) -> Result<Packet> {
        self.left_rx.recv().map_err(|_| {
            TensorError::Communication(format!("rank {}: left neighbour disconnected", self.rank))
        })
    }

    fn recv_chunk(&self, len: usize) -> Result<Packet> {
        let packet = self.recv()?;
        if packet.data.len() != len {
            return Err(TensorError::ShapeMismatch {
                expected: vec![len],
                got: vec![packet.data.len()],
            });
        }
        Ok(packet)
    }

    /// Index of the chunk handled at `step`, counting back from this rank.
    fn ring_index(&self, offset: usize, step: usize) -> usize {
        (self.rank + offset + self.world_size - step % self.world_size) % self.world_size
    }
}

fn to_wire<T: TensorElem>(data: &[T]) -> Result<Vec<f64>> {
    data.iter()
        .map(|v| {
            v.to_f64().ok_or_else(|| {
                TensorError::Unsupported(format!("{v:?} cannot be sent as f64"))
            })
        })
        .collect()
}

fn from_wire<T: TensorElem>(data: &[f64]) -> Result<Vec<T>> {
    data.iter().map(|&v| scalar(v)).collect()
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum<T: TensorElem>(&self, tensor: &Tensor<T, 2>) -> Result<Tensor<T, 2>> {
        let mut data = to_wire(tensor.data())?;
        let total = data.len();
        let chunk_size = total.div_ceil(self.world_size.max(1));
        let chunk = |idx: usize| {
            let start = (idx * chunk_size).min(total);
            start..(start + chunk_size).min(total)
        };

        // Scatter-reduce: after world_size - 1 steps rank r holds the full sum
        // of chunk r + 1.
        for step in 0..self.world_size.saturating_sub(1) {
            let send = chunk(self.ring_index(0, step));
            self.send(Packet {
                shape: [1, send.len()],
                data: data[send].to_vec(),
            })?;
            let recv = chunk(self.ring_index(0, step + 1));
            let packet = self.recv_chunk(recv.len())?;
            for (d, v) in data[recv].iter_mut().zip(packet.data) {
                *d += v;
            }
        }

        // Circulate the reduced chunks.
        for step in 0..self.world_size.saturating_sub(1) {
            let send = chunk(self.ring_index(1, step));
            self.send(Packet {
                shape: [1, send.len()],
                data: data[send].to_vec(),
            })?;
            let recv = chunk(self.ring_index(0, step));
            let packet = self.recv_chunk(recv.len())?;
            data[recv].copy_from_slice(&packet.data);
        }

        Tensor::new(from_wire(&data)?, *tensor.shape())
    }

    fn all_gather<T: TensorElem>(&self, tensor: &Tensor<T, 2>, dim: usize) -> Result<Tensor<T, 2>> {
        check_gather_dim(dim)?;
        let mut pieces: Vec<Option<Packet>> = vec![None; self.world_size];
        let own = Packet {
            shape: *tensor.shape(),
            data: to_wire(tensor.data())?,
        };
        pieces[self.rank] = Some(own.clone());

        // At step s this rank forwards the piece of rank r - s and receives
        // the piece of rank r - s - 1.
        let mut outgoing = own;
        for step in 0..self.world_size.saturating_sub(1) {
            self.send(outgoing)?;
            let packet = self.recv()?;
            pieces[self.ring_index(0, step + 1)] = Some(packet.clone());
            outgoing = packet;
        }

        let pieces = pieces
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                TensorError::Communication(format!("rank {}: incomplete all-gather", self.rank))
            })?;

        let other = 1 - dim;
        let fixed = tensor.shape()[other];
        if let Some(bad) = pieces.iter().find(|p| p.shape[other] != fixed) {
            return Err(TensorError::ShapeMismatch {
                expected: tensor.shape().to_vec(),
                got: bad.shape.to_vec(),
            });
        }
        let gathered: usize = pieces.iter().map(|p| p.shape[dim]).sum();

        let data = if dim == 0 {
            pieces.into_iter().flat_map(|p| p.data).collect::<Vec<_>>()
        } else {
            let mut data = Vec::with_capacity(fixed * gathered);
            for row in 0..fixed {
                for p in &pieces {
                    let cols = p.shape[1];
                    data.extend_from_slice(&p.data[row * cols..(row + 1) * cols]);
                }
            }
            data
        };

        let shape = if dim == 0 { [gathered, fixed] } else { [fixed, gathered] };
        Tensor::new(from_wire(&data)?, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_ring<R, F>(world_size: usize, f: F) -> Vec<R>
    where
        R: Send + 'static,
        F: Fn(CpuBackend) -> R + Send + Sync + Clone + 'static,
    {
        let handles: Vec<_> = CpuBackend::ring(world_size)
            .into_iter()
            .map(|backend| {
                let f = f.clone();
                thread::spawn(move || f(backend))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_ring_all_reduce() {
        // 7 elements over 4 ranks leaves the last chunk short.
        let results = run_ring(4, |backend| {
            let rank = backend.rank() as f32;
            let data = (0..7).map(|i| i as f32 + rank).collect();
            let t = Tensor::<f32, 2>::new(data, [1, 7]).unwrap();
            backend.all_reduce_sum(&t).unwrap()
        });
        let expected: Vec<f32> = (0..7).map(|i| 4.0 * i as f32 + 6.0).collect();
        for result in &results {
            assert_eq!(result.data(), expected.as_slice());
        }
    }

    #[test]
    fn test_all_reduce_more_ranks_than_elements() {
        let results = run_ring(5, |backend| {
            let t = Tensor::<f64, 2>::new(vec![1.0, 2.0], [2, 1]).unwrap();
            backend.all_reduce_sum(&t).unwrap()
        });
        for result in &results {
            assert_eq!(result.data(), &[5.0, 10.0]);
            assert_eq!(result.shape(), &[2, 1]);
        }
    }

    #[test]
    fn test_all_gather_rows_of_different_sizes() {
        let results = run_ring(3, |backend| {
            let rank = backend.rank();
            let rows = rank + 1;
            let t = Tensor::<f64, 2>::full([rows, 2], rank as f64);
            backend.all_gather(&t, 0).unwrap()
        });
        for result in &results {
            assert_eq!(result.shape(), &[6, 2]);
            assert_eq!(
                result.data(),
                &[0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0]
            );
        }
    }

    #[test]
    fn test_all_gather_columns() {
        let results = run_ring(2, |backend| {
            let r = backend.rank() as f64;
            let t = Tensor::<f64, 2>::new(vec![r, r + 10.0], [2, 1]).unwrap();
            backend.all_gather(&t, 1).unwrap()
        });
        for result in &results {
            assert_eq!(result.shape(), &[2, 2]);
            assert_eq!(result.data(), &[0.0, 1.0, 10.0, 11.0]);
        }
    }

    #[test]
    fn test_disconnected_peer() {
        let mut ring = CpuBackend::ring(2);
        let alive = ring.remove(0);
        drop(ring);
        let t = Tensor::<f32, 2>::ones([1, 2]);
        // The peer's sender is gone, so receiving fails instead of hanging.
        assert!(matches!(
            alive.all_reduce_sum(&t),
            Err(TensorError::Communication(_))
        ));
    }
}
