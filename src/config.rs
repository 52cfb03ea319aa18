use crate::conditioning::{DriftParams, NormalizeParams, OutlierParams, ResampleGpParams, SphericalParams};
use crate::error::Result;
use crate::fitting::FitParams;
use crate::models::fibers::FibersParams;
use crate::models::noddi::NoddiParams;
use crate::models::SynthParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeParams {
    /// worker threads used for per-voxel processing
    pub threads: usize,
}

impl Default for VolumeParams {
    fn default() -> Self {
        Self { threads: 1 }
    }
}

/// algorithm parameters shared by the command line tools, stored as toml. Missing sections and
/// fields take their defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub volume: VolumeParams,
    pub noddi: NoddiParams,
    pub fibers: FibersParams,
    pub drift: DriftParams,
    pub outlier: OutlierParams,
    pub resample_gp: ResampleGpParams,
    pub spherical: SphericalParams,
    pub normalize: NormalizeParams,
    pub fit: FitParams,
}

impl Params {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let toml_string = fs::read_to_string(path)?;
        let params = toml::from_str(&toml_string)?;
        Ok(params)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut toml_string = toml::to_string_pretty(self)?;
        toml_string.push('\n');
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn synth_params(&self) -> SynthParams {
        SynthParams { fibers: self.fibers, noddi: self.noddi.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditioning::{DriftMethod, SphericalFilter};

    #[test]
    fn default_round_trip() {
        let params = Params::default();
        let text = toml::to_string_pretty(&params).unwrap();
        assert!(text.contains("[drift]"));
        assert!(text.contains("[fit]"));
        let back: Params = toml::from_str(&text).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let text = r#"
            [volume]
            threads = 4

            [drift]
            methods = ["global", "blend"]

            [spherical]
            filter = "global"
            kappa = 8.0
        "#;
        let params: Params = toml::from_str(text).unwrap();
        assert_eq!(params.volume.threads, 4);
        assert_eq!(params.drift.methods, vec![DriftMethod::Global, DriftMethod::Blend]);
        assert_eq!(params.drift.order, DriftParams::default().order);
        assert_eq!(params.spherical.filter, SphericalFilter::Global);
        assert_eq!(params.spherical.kappa, 8.0);
        assert_eq!(params.spherical.lambda, SphericalParams::default().lambda);
        assert_eq!(params.fit, FitParams::default());
        assert_eq!(params.synth_params().noddi, NoddiParams::default());
    }

    #[test]
    fn write_then_load() {
        let path = std::env::temp_dir().join(format!("dwi-models-params-{}.toml", std::process::id()));
        let mut params = Params::default();
        params.fit.weighted = true;
        params.normalize.mean = Some(1000.0);
        params.write(&path).unwrap();
        let back = Params::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back, params);
    }
}
