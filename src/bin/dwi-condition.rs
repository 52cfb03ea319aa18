use clap::{Parser, ValueEnum};
use dwi_models::conditioning::{
    correct_drift, normalize, normalize::parse_grouping, DwiFeature, DwiFeatureFunction, OutlierGp, ResampleGp, SphericalResample,
};
use dwi_models::error::ModelError;
use dwi_models::gradients::read_bvecs;
use dwi_models::logging::init_tracing;
use dwi_models::{Gradients, Mask, Params, Result, Volume, VolumeFunction};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Operation {
    /// correct signal drift across the acquisition
    Drift,
    /// replace outlier measurements with a gaussian process prediction
    Outlier,
    /// predict the signal of a reference gradient scheme with a gaussian process
    ResampleGp,
    /// resample to destination directions with a spherical filter
    Spherical,
    /// normalize by the baseline signal
    Normalize,
    /// compute a per-voxel signal feature
    Feature,
}

#[derive(Debug, Parser)]
#[command(about = "condition diffusion-weighted signals voxel by voxel")]
struct Args {
    /// input volume (json)
    #[arg(long)]
    input: PathBuf,
    /// b-vectors text file
    #[arg(long)]
    bvecs: PathBuf,
    /// b-values text file
    #[arg(long)]
    bvals: PathBuf,
    /// optional mask volume (json)
    #[arg(long)]
    mask: Option<PathBuf>,
    /// parameter file. Defaults are used when omitted
    #[arg(long)]
    params: Option<PathBuf>,
    #[arg(long, value_enum)]
    op: Operation,
    /// b-vectors of the reference scheme for gaussian process resampling
    #[arg(long)]
    reference_bvecs: Option<PathBuf>,
    /// b-values of the reference scheme for gaussian process resampling
    #[arg(long)]
    reference_bvals: Option<PathBuf>,
    /// destination directions for spherical resampling
    #[arg(long)]
    dest: Option<PathBuf>,
    /// signal feature, e.g. spherical_mean
    #[arg(long)]
    feature: Option<String>,
    /// comma separated normalization group per measurement, overriding the parameter file
    #[arg(long)]
    grouping: Option<String>,
    /// output volume (json)
    #[arg(long)]
    output: PathBuf,
}

fn missing(flag: &str, op: &str) -> ModelError {
    ModelError::InvalidParameter(format!("--{flag} is required for {op}"))
}

fn run(args: &Args) -> Result<()> {
    let mut params = match &args.params {
        Some(path) => Params::load(path)?,
        None => Params::default(),
    };
    if let Some(text) = &args.grouping {
        params.normalize.grouping = Some(parse_grouping(text)?);
    }
    let threads = params.volume.threads;

    info!("reading input volume ...");
    let input = Volume::read_json(&args.input)?;
    let gradients = Gradients::read(&args.bvecs, &args.bvals)?;
    let mask = args.mask.as_ref().map(Mask::read_json).transpose()?;
    let mask = mask.as_ref();

    let output = match args.op {
        Operation::Drift => correct_drift(&input, mask, &gradients, &params.drift, threads)?,
        Operation::Outlier => {
            let function = OutlierGp::new(&gradients, &params.outlier);
            VolumeFunction::new(|| function.clone(), &input).with_mask(mask).with_threads(threads).run()?
        }
        Operation::ResampleGp => {
            let bvecs = args.reference_bvecs.as_ref().ok_or_else(|| missing("reference-bvecs", "resample-gp"))?;
            let bvals = args.reference_bvals.as_ref().ok_or_else(|| missing("reference-bvals", "resample-gp"))?;
            let reference = Gradients::read(bvecs, bvals)?;
            let function = ResampleGp::new(&gradients, &reference, &params.resample_gp);
            VolumeFunction::new(|| function.clone(), &input).with_mask(mask).with_threads(threads).run()?
        }
        Operation::Spherical => {
            let dest = args.dest.as_ref().ok_or_else(|| missing("dest", "spherical"))?;
            let dest = read_bvecs(dest, None)?;
            let function = SphericalResample::new(&gradients, &dest, &params.spherical)?;
            VolumeFunction::new(|| function.clone(), &input).with_mask(mask).with_threads(threads).run()?
        }
        Operation::Normalize => normalize(&input, mask, &gradients, &params.normalize, threads)?,
        Operation::Feature => {
            let feature: DwiFeature = args.feature.as_deref().ok_or_else(|| missing("feature", "feature"))?.parse()?;
            let function = DwiFeatureFunction::new(feature, &gradients)?;
            VolumeFunction::new(|| function.clone(), &input).with_mask(mask).with_threads(threads).run()?
        }
    };

    output.write_json(&args.output)?;
    info!("wrote {}", args.output.display());
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("conditioning failed: {e}");
            ExitCode::FAILURE
        }
    }
}
