use clap::{Parser, ValueEnum};
use dwi_models::fitting::{ExpDecayFit, KurtosisFit, KurtosisFreeWaterFit, TensorFit};
use dwi_models::gradients::read_bvals;
use dwi_models::logging::init_tracing;
use dwi_models::models::kurtosis::KurtosisDirections;
use dwi_models::{Gradients, Mask, ModelFeature, ModelType, Params, Result, Volume, VolumeFunction};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FitModel {
    /// diffusion tensor
    Dti,
    /// diffusion kurtosis
    Dki,
    /// diffusion kurtosis with a free-water compartment
    Fwdki,
    /// exponential decay over b-values or a custom varying parameter
    Expdecay,
}

impl FitModel {
    fn kind(&self) -> ModelType {
        match self {
            FitModel::Dti => ModelType::Tensor,
            FitModel::Dki | FitModel::Fwdki => ModelType::Kurtosis,
            FitModel::Expdecay => ModelType::ExpDecay,
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "fit a diffusion model to every voxel of a volume")]
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
    model: FitModel,
    /// sample positions for exponential decay fitting, defaulting to the b-values
    #[arg(long)]
    varying: Option<PathBuf>,
    /// features to write next to the model, e.g. FA MD
    #[arg(long, num_args = 1..)]
    feature: Vec<String>,
    #[arg(long)]
    output_dir: PathBuf,
}

fn run(args: &Args) -> Result<()> {
    let params = match &args.params {
        Some(path) => Params::load(path)?,
        None => Params::default(),
    };
    let threads = params.volume.threads;

    info!("reading input volume ...");
    let input = Volume::read_json(&args.input)?;
    let gradients = Gradients::read(&args.bvecs, &args.bvals)?;
    let mask = args.mask.as_ref().map(Mask::read_json).transpose()?;

    info!("fitting {} model ...", args.model.kind());
    let models = match args.model {
        FitModel::Dti => {
            let fitter = TensorFit::new(&gradients, &params.fit)?;
            VolumeFunction::new(|| fitter.clone(), &input).with_mask(mask.as_ref()).with_threads(threads).run()?
        }
        FitModel::Dki => {
            let dirs = Arc::new(KurtosisDirections::default());
            let fitter = KurtosisFit::with_directions(&gradients, &params.fit, dirs)?;
            VolumeFunction::new(|| fitter.clone(), &input).with_mask(mask.as_ref()).with_threads(threads).run()?
        }
        FitModel::Fwdki => {
            let dirs = Arc::new(KurtosisDirections::default());
            let fitter = KurtosisFreeWaterFit::with_directions(&gradients, &params.fit, dirs)?;
            VolumeFunction::new(|| fitter.clone(), &input).with_mask(mask.as_ref()).with_threads(threads).run()?
        }
        FitModel::Expdecay => {
            let varying = match &args.varying {
                Some(path) => read_bvals(path)?,
                None => gradients.bvals().to_vec(),
            };
            let fitter = ExpDecayFit::new(&varying, params.fit.weighted)?;
            VolumeFunction::new(|| fitter.clone(), &input).with_mask(mask.as_ref()).with_threads(threads).run()?
        }
    };

    fs::create_dir_all(&args.output_dir)?;
    let kind = args.model.kind();
    let model_file = args.output_dir.join(format!("{}.json", kind.name()));
    models.write_json(&model_file)?;
    info!("wrote {}", model_file.display());

    for name in &args.feature {
        let function = ModelFeature::new(kind, models.channels(), name)?;
        let values = VolumeFunction::new(|| function.clone(), &models).with_mask(mask.as_ref()).with_threads(threads).run()?;
        let feature_file = args.output_dir.join(format!("{name}.json"));
        values.write_json(&feature_file)?;
        info!("wrote {}", feature_file.display());
    }
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fitting failed: {e}");
            ExitCode::FAILURE
        }
    }
}
