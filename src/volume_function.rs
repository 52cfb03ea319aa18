// Per-voxel application of vector functions over a volume

use crate::error::{ModelError, Result};
use crate::volume::{Mask, Volume};
use ndarray::parallel::prelude::*;
use ndarray::Axis;
use rayon::ThreadPoolBuilder;
use std::time::Instant;
use tracing::{debug, info};

/// a function from one fixed-length vector to another. Implementations may carry scratch state,
/// so `apply` takes `&mut self` and one instance is never shared between workers
pub trait VectFunction {
    fn dim_in(&self) -> usize;

    fn dim_out(&self) -> usize;

    fn apply(&mut self, input: &[f64], output: &mut [f64]);

    fn eval(&mut self, input: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.dim_out()];
        self.apply(input, &mut out);
        out
    }
}

impl<T: VectFunction + ?Sized> VectFunction for Box<T> {
    fn dim_in(&self) -> usize {
        (**self).dim_in()
    }

    fn dim_out(&self) -> usize {
        (**self).dim_out()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        (**self).apply(input, output)
    }
}

/// builds a fresh [VectFunction] for each worker
pub trait FunctionFactory: Sync {
    type Function: VectFunction;

    fn build(&self) -> Self::Function;
}

impl<F, V> FunctionFactory for F
where
    F: Fn() -> V + Sync,
    V: VectFunction,
{
    type Function = V;

    fn build(&self) -> V {
        self()
    }
}

/// applies a per-voxel function to every (masked) sample of a volume. Samples outside the mask
/// are left at zero in the output
pub struct VolumeFunction<'a, F: FunctionFactory> {
    factory: F,
    input: &'a Volume,
    mask: Option<&'a Mask>,
    threads: usize,
}

impl<'a, F: FunctionFactory> VolumeFunction<'a, F> {
    pub fn new(factory: F, input: &'a Volume) -> Self {
        Self { factory, input, mask: None, threads: 1 }
    }

    pub fn with_mask(mut self, mask: Option<&'a Mask>) -> Self {
        self.mask = mask;
        self
    }

    /// number of worker threads. One means strictly sequential processing
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn run(self) -> Result<Volume> {
        let function = self.factory.build();
        let dim_in = function.dim_in();
        let dim_out = function.dim_out();
        if self.input.channels() != dim_in {
            return Err(ModelError::DimensionMismatch { what: "channel count", expected: dim_in, found: self.input.channels() });
        }
        self.input.check_mask(self.mask)?;

        let mut out = self.input.proto(dim_out);
        let slice_size = self.input.slice_size().max(1);
        let n_slices = self.input.dims()[2];
        let input = self.input;
        let mask = self.mask;

        info!("started applying function to volume");
        let now = Instant::now();

        let process_slice = |function: &mut F::Function, buf: &mut Vec<f64>, res: &mut Vec<f64>, k: usize, mut slice: ndarray::ArrayViewMut2<f64>| {
            debug!("... processing slice {}/{}", k + 1, n_slices);
            for (j, mut row) in slice.axis_iter_mut(Axis(0)).enumerate() {
                let idx = k * slice_size + j;
                if !input.valid(idx, mask) {
                    continue;
                }
                buf.iter_mut().zip(input.get(idx).iter()).for_each(|(b, &v)| *b = v);
                function.apply(buf, res);
                row.iter_mut().zip(res.iter()).for_each(|(o, &r)| *o = r);
            }
        };

        if self.threads <= 1 {
            let mut function = function;
            let mut buf = vec![0.0; dim_in];
            let mut res = vec![0.0; dim_out];
            for (k, slice) in out.data_mut().axis_chunks_iter_mut(Axis(0), slice_size).enumerate() {
                process_slice(&mut function, &mut buf, &mut res, k, slice);
            }
        } else {
            info!("using threads: {}", self.threads);
            let pool = ThreadPoolBuilder::new().num_threads(self.threads).build()?;
            let factory = &self.factory;
            pool.install(|| {
                out.data_mut()
                    .axis_chunks_iter_mut(Axis(0), slice_size)
                    .into_par_iter()
                    .enumerate()
                    .for_each_init(
                        // functions can carry state, so every worker builds its own
                        || (factory.build(), vec![0.0; dim_in], vec![0.0; dim_out]),
                        |(function, buf, res), (k, slice)| process_slice(function, buf, res, k, slice),
                    );
            });
        }

        info!("finished applying function to volume in {:.03} secs", now.elapsed().as_secs_f32());
        Ok(out)
    }
}

/// a function assembled from a closure, for simple stateless transforms
pub struct ClosureFunction<C> {
    dim_in: usize,
    dim_out: usize,
    closure: C,
}

impl<C: FnMut(&[f64], &mut [f64])> ClosureFunction<C> {
    pub fn new(dim_in: usize, dim_out: usize, closure: C) -> Self {
        Self { dim_in, dim_out, closure }
    }
}

impl<C: FnMut(&[f64], &mut [f64])> VectFunction for ClosureFunction<C> {
    fn dim_in(&self) -> usize {
        self.dim_in
    }

    fn dim_out(&self) -> usize {
        self.dim_out
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        (self.closure)(input, output)
    }
}
