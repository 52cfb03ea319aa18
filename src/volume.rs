use crate::error::{ModelError, Result};
use ndarray::{Array2, ArrayView1, ArrayViewMut1, Axis};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// a 3-D grid of samples, each holding a vector of `channels` values. Samples are stored in
/// column-major order (x fastest) as the rows of a (samples x channels) array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    dims: [usize; 3],
    data: Array2<f64>,
}

/// a boolean grid gating which samples of a volume are processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    dims: [usize; 3],
    data: Vec<bool>,
}

impl Volume {
    pub fn zeros(dims: [usize; 3], channels: usize) -> Self {
        let n = dims.iter().product::<usize>();
        Self { dims, data: Array2::zeros((n, channels)) }
    }

    /// build a volume from sample-major values (the channels of sample 0 first)
    pub fn from_vec(dims: [usize; 3], channels: usize, values: Vec<f64>) -> Result<Self> {
        let n = dims.iter().product::<usize>();
        if values.len() != n * channels {
            return Err(ModelError::DimensionMismatch { what: "volume data length", expected: n * channels, found: values.len() });
        }
        let data = Array2::from_shape_vec((n, channels), values)
            .map_err(|e| ModelError::InvalidParameter(format!("invalid volume shape: {e}")))?;
        Ok(Self { dims, data })
    }

    /// a volume with the same sampling and a different number of channels
    pub fn proto(&self, channels: usize) -> Self {
        Self::zeros(self.dims, channels)
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn channels(&self) -> usize {
        self.data.ncols()
    }

    /// the number of samples
    pub fn size(&self) -> usize {
        self.data.nrows()
    }

    /// the number of samples in one z-slice
    pub fn slice_size(&self) -> usize {
        self.dims[0] * self.dims[1]
    }

    pub fn get(&self, idx: usize) -> ArrayView1<f64> {
        self.data.row(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> ArrayViewMut1<f64> {
        self.data.row_mut(idx)
    }

    pub fn set(&mut self, idx: usize, values: &[f64]) {
        assert_eq!(values.len(), self.channels(), "sample length must match the channel count");
        self.data.row_mut(idx).iter_mut().zip(values).for_each(|(d, &v)| *d = v);
    }

    pub fn value(&self, idx: usize, channel: usize) -> f64 {
        self.data[[idx, channel]]
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array2<f64> {
        &mut self.data
    }

    /// a single-channel volume holding one channel of this one
    pub fn channel(&self, channel: usize) -> Volume {
        let col = self.data.index_axis(Axis(1), channel);
        Self { dims: self.dims, data: Array2::from_shape_fn((col.len(), 1), |(i, _)| col[i]) }
    }

    /// a sample is processed when no mask is given or the mask is set there
    pub fn valid(&self, idx: usize, mask: Option<&Mask>) -> bool {
        mask.map_or(true, |m| m.foreground(idx))
    }

    pub fn check_mask(&self, mask: Option<&Mask>) -> Result<()> {
        match mask {
            Some(m) if m.dims != self.dims => Err(ModelError::DimensionMismatch {
                what: "mask sample count",
                expected: self.size(),
                found: m.data.len(),
            }),
            _ => Ok(()),
        }
    }

    #[inline(always)]
    pub fn subscript(&self, index: usize) -> [usize; 3] {
        let [nx, ny, _] = self.dims;
        let iz = index / (nx * ny);
        let rem = index % (nx * ny);
        [rem % nx, rem / nx, iz]
    }

    #[inline(always)]
    pub fn index(&self, subscript: &[usize; 3]) -> usize {
        let [nx, ny, _] = self.dims;
        subscript[2] * nx * ny + subscript[1] * nx + subscript[0]
    }

    pub fn read_json(path: impl AsRef<Path>) -> Result<Self> {
        let f = File::open(path)?;
        let vol: Volume = serde_json::from_reader(BufReader::new(f))?;
        let n = vol.dims.iter().product::<usize>();
        if vol.data.nrows() != n {
            return Err(ModelError::DimensionMismatch { what: "volume sample count", expected: n, found: vol.data.nrows() });
        }
        Ok(vol)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let f = File::create(path)?;
        serde_json::to_writer(BufWriter::new(f), self)?;
        Ok(())
    }
}

impl Mask {
    pub fn new(dims: [usize; 3], data: Vec<bool>) -> Result<Self> {
        let n = dims.iter().product::<usize>();
        if data.len() != n {
            return Err(ModelError::DimensionMismatch { what: "mask length", expected: n, found: data.len() });
        }
        Ok(Self { dims, data })
    }

    pub fn full(dims: [usize; 3]) -> Self {
        Self { dims, data: vec![true; dims.iter().product()] }
    }

    /// foreground wherever the first channel of the volume is non-zero
    pub fn from_volume(vol: &Volume) -> Self {
        let data = (0..vol.size()).map(|i| vol.value(i, 0) != 0.0).collect();
        Self { dims: vol.dims(), data }
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn foreground(&self, idx: usize) -> bool {
        self.data[idx]
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        self.data[idx] = value;
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&m| m).count()
    }

    pub fn read_json(path: impl AsRef<Path>) -> Result<Self> {
        let f = File::open(path)?;
        let mask: Mask = serde_json::from_reader(BufReader::new(f))?;
        Mask::new(mask.dims, mask.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscripts_are_column_major() {
        let vol = Volume::zeros([4, 3, 2], 1);
        assert_eq!(vol.subscript(0), [0, 0, 0]);
        assert_eq!(vol.subscript(1), [1, 0, 0]);
        assert_eq!(vol.subscript(4), [0, 1, 0]);
        assert_eq!(vol.subscript(12), [0, 0, 1]);
        for i in 0..vol.size() {
            assert_eq!(vol.index(&vol.subscript(i)), i);
        }
    }

    #[test]
    fn set_and_get_samples() {
        let mut vol = Volume::zeros([2, 2, 1], 3);
        vol.set(2, &[1.0, 2.0, 3.0]);
        assert_eq!(vol.get(2).to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(vol.value(2, 1), 2.0);
        assert_eq!(vol.channel(2).get(2)[0], 3.0);
    }

    #[test]
    fn from_vec_checks_length() {
        assert!(Volume::from_vec([2, 1, 1], 2, vec![0.0; 3]).is_err());
        assert!(Volume::from_vec([2, 1, 1], 2, vec![0.0; 4]).is_ok());
    }

    #[test]
    fn mask_gates_samples() {
        let vol = Volume::zeros([2, 1, 1], 1);
        let mask = Mask::new([2, 1, 1], vec![true, false]).unwrap();
        assert!(vol.valid(0, Some(&mask)));
        assert!(!vol.valid(1, Some(&mask)));
        assert!(vol.valid(1, None));
        assert!(vol.check_mask(Some(&Mask::full([3, 1, 1]))).is_err());
    }

    #[test]
    fn json_round_trip() {
        let mut vol = Volume::zeros([2, 1, 1], 2);
        vol.set(1, &[0.5, 1.5]);
        let path = std::env::temp_dir().join("dwi_models_volume_test.json");
        vol.write_json(&path).unwrap();
        assert_eq!(Volume::read_json(&path).unwrap(), vol);
    }
}
