//! Host matrix-product workload.
//!
//! Every device slot gets two fixed square operands generated from a fixed
//! seed, so all products of a batch must agree bit for bit (within
//! [`Element::EPSILON`]). A batch computes `C_i = A * B` into each result
//! buffer and then counts the cells where any `C_i` drifts from `C_0`.

use std::fmt;
use std::time::{Duration, Instant};

use ndarray::linalg::general_mat_mul;
use ndarray::{Array2, LinalgScalar};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use burn_protocol::MATRIX_DIM;

use super::device::system_memory;
use super::{BatchReport, DeviceBackend, Precision, Workload, WorkloadSettings};
use crate::base::{Error, Result};

/// Upper bound on result buffers per batch.
pub const HOST_MAX_BATCH: u64 = 64;

/// Wall time one batch should take, so records keep arriving during a run.
pub const HOST_BATCH_TIME: Duration = Duration::from_secs(1);

const INPUT_SEED: u64 = 10;

/// Scalar types the host workload can run in.
pub trait Element: LinalgScalar + PartialOrd + fmt::Debug + Send {
    /// Largest difference two results may have and still agree.
    const EPSILON: Self;
    const ZERO: Self;
    const ONE: Self;

    fn from_f64(value: f64) -> Self;

    fn abs_diff(self, other: Self) -> Self;
}

impl Element for f32 {
    const EPSILON: Self = 0.001;
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn abs_diff(self, other: Self) -> Self {
        (self - other).abs()
    }
}

impl Element for f64 {
    const EPSILON: Self = 0.0000001;
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;

    fn from_f64(value: f64) -> Self {
        value
    }

    fn abs_diff(self, other: Self) -> Self {
        (self - other).abs()
    }
}

/// Devices are virtual slots sharing host memory.
#[derive(Debug, Clone)]
pub struct HostBackend {
    devices: usize,
}

impl HostBackend {
    pub fn new(devices: usize) -> Self {
        Self { devices }
    }
}

impl DeviceBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn device_count(&self) -> Result<usize> {
        if self.devices == 0 {
            return Err(Error::NoDevices);
        }
        Ok(self.devices)
    }

    fn open(&self, device_id: usize, settings: &WorkloadSettings) -> Result<Box<dyn Workload>> {
        if device_id >= self.devices {
            return Err(Error::InvalidDevice {
                device: device_id,
                count: self.devices,
            });
        }

        let memory = system_memory();
        let budget = memory.budget_per_device(self.devices, settings.memory_fraction());
        info!(
            device = device_id,
            memory = %memory,
            budget_mb = budget / (1024 * 1024),
            precision = %settings.precision,
            "Opening host workload"
        );

        Ok(match settings.precision {
            Precision::Single => Box::new(HostWorkload::<f32>::new(device_id, budget)?),
            Precision::Double => Box::new(HostWorkload::<f64>::new(device_id, budget)?),
        })
    }
}

/// Fixed operands plus one result buffer per product of a batch.
pub struct HostWorkload<T: Element> {
    a: Array2<T>,
    b: Array2<T>,
    results: Vec<Array2<T>>,
}

impl<T: Element> HostWorkload<T> {
    pub fn new(device_id: usize, budget_bytes: u64) -> Result<Self> {
        Self::with_dim(device_id, budget_bytes, MATRIX_DIM)
    }

    /// Build with a custom matrix dimension.
    pub fn with_dim(device_id: usize, budget_bytes: u64, dim: usize) -> Result<Self> {
        let matrix_bytes = (dim * dim * std::mem::size_of::<T>()) as u64;
        if matrix_bytes == 0 || budget_bytes < 3 * matrix_bytes {
            return Err(Error::AllocationFailed(format!(
                "device {}: budget of {} bytes cannot hold operands and one {}x{} result",
                device_id, budget_bytes, dim, dim
            )));
        }

        let fits = (budget_bytes - 2 * matrix_bytes) / matrix_bytes;
        let (a, b) = seeded_operands(dim)?;

        // The first product doubles as a timing sample for sizing the batch
        let started = Instant::now();
        let mut first = Array2::from_elem((dim, dim), T::ZERO);
        general_mat_mul(T::ONE, &a, &b, T::ZERO, &mut first);
        let product_time = started.elapsed();

        let iters = fits.min(batch_limit(product_time, HOST_BATCH_TIME));
        let mut results = Vec::with_capacity(iters as usize);
        results.push(first);
        results.extend((1..iters).map(|_| Array2::from_elem((dim, dim), T::ZERO)));

        debug!(
            device = device_id,
            dim,
            iters,
            fits,
            product_ms = product_time.as_millis() as u64,
            "Host workload allocated"
        );

        Ok(Self { a, b, results })
    }
}

/// Products per batch so that a batch takes about `target`.
///
/// Never below one product, never above [`HOST_MAX_BATCH`].
pub fn batch_limit(product_time: Duration, target: Duration) -> u64 {
    if product_time.is_zero() {
        return HOST_MAX_BATCH;
    }
    let fit = target.as_nanos() / product_time.as_nanos();
    u64::try_from(fit).unwrap_or(u64::MAX).clamp(1, HOST_MAX_BATCH)
}

impl<T: Element> Workload for HostWorkload<T> {
    fn batch_size(&self) -> u64 {
        self.results.len() as u64
    }

    fn run_batch(&mut self) -> Result<BatchReport> {
        for c in self.results.iter_mut() {
            general_mat_mul(T::ONE, &self.a, &self.b, T::ZERO, c);
        }

        Ok(BatchReport {
            ops: self.batch_size(),
            errors: count_mismatches(&self.results),
        })
    }
}

/// Both operands, drawn interleaved from one seeded stream.
fn seeded_operands<T: Element>(dim: usize) -> Result<(Array2<T>, Array2<T>)> {
    let mut rng = StdRng::seed_from_u64(INPUT_SEED);
    let len = dim * dim;
    let mut a = Vec::with_capacity(len);
    let mut b = Vec::with_capacity(len);

    for _ in 0..len {
        a.push(T::from_f64(f64::from(rng.random_range(0..1_000_000u32)) / 100_000.0));
        b.push(T::from_f64(f64::from(rng.random_range(0..1_000_000u32)) / 100_000.0));
    }

    let a = Array2::from_shape_vec((dim, dim), a)
        .map_err(|e| Error::InvalidArgument(e.to_string()))?;
    let b = Array2::from_shape_vec((dim, dim), b)
        .map_err(|e| Error::InvalidArgument(e.to_string()))?;
    Ok((a, b))
}

/// Count cells where any result differs from the first one.
pub fn count_mismatches<T: Element>(results: &[Array2<T>]) -> u64 {
    let Some((reference, rest)) = results.split_first() else {
        return 0;
    };

    reference
        .indexed_iter()
        .filter(|&(idx, &expected)| {
            rest.iter()
                .any(|other| other[idx].abs_diff(expected) > T::EPSILON)
        })
        .count() as u64
}
