//! Command-line voice conversion
//!
//! Converts one or more WAV files with one or more voice models. Flags set
//! the conversion knobs directly; `--settings` reads a `settings.json`
//! batch description whose fields take precedence.
//!
//! Usage:
//!     cargo run --release --features cli --bin rvc -- in.wav --model models/alto.pth --key 3
//!     cargo run --release --features cli --bin rvc -- --settings settings.json --device cuda:1

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use rvc_infer::pipeline::request::output_name;
use rvc_infer::pipeline::{normalize_index_path, ModelLayout};
use rvc_infer::{
    device_info, AssetPaths, ConversionParams, IndexSelection, PitchMethod, Precision, Settings,
    SynthesisContext, SystemInventory, VcError, VoiceConversionRequest, VoiceConverter,
};

/// Retrieval-based voice conversion
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input WAV files (default: the settings' audio_file under --input-dir)
    inputs: Vec<PathBuf>,

    /// Voice model checkpoint (.pth or .safetensors)
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Retrieval index; found next to the model by name when omitted
    #[arg(long, conflicts_with = "no_index")]
    index: Option<String>,

    /// Convert without retrieval
    #[arg(long)]
    no_index: bool,

    /// Output WAV path (single input and model only)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory for `<audio>_<model>.wav` outputs
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Pitch shift in semitones, -12 to 12
    #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
    key: i32,

    /// Pitch method (pm, harvest, crepe, rmvpe)
    #[arg(long, default_value = "rmvpe")]
    method: String,

    /// Device for inference (auto, cpu, cuda, cuda:N, metal)
    #[arg(long, default_value = "auto")]
    device: String,

    /// Run the networks in half precision where the device allows it
    #[arg(long)]
    half: bool,

    /// Weight of retrieved features, 0 to 1
    #[arg(long, default_value_t = 1.0)]
    index_rate: f32,

    /// Retrieval kept on unvoiced frames, 0 to 0.5 (0.5 disables)
    #[arg(long, default_value_t = 0.33)]
    protect: f32,

    /// Loudness envelope mix, 0 follows the input, 1 keeps the model's
    #[arg(long, default_value_t = 0.0)]
    rms_mix: f32,

    /// Output sample rate, 0 keeps the model rate
    #[arg(long, default_value_t = 0)]
    resample_sr: u32,

    /// Median smoothing for harvest; 3 or more enables it
    #[arg(long, default_value_t = 3)]
    filter_radius: usize,

    /// Speaker id for multi-speaker models
    #[arg(long, default_value_t = 0)]
    speaker: usize,

    /// Noise seed
    #[arg(long)]
    seed: Option<u64>,

    /// Batch description (pitch_adjustment, pitch_extraction_method, model, device, audio_file)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Models directory; indexes live in its `index/` subdirectory
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    /// Input directory for settings-driven runs
    #[arg(long, default_value = "input")]
    input_dir: PathBuf,

    /// Directory holding hubert_base.pt, rmvpe.pt and the CREPE weights
    #[arg(long, default_value = "assets")]
    assets_dir: PathBuf,

    /// Fetch the encoder and RMVPE from the HuggingFace Hub
    #[cfg(feature = "hub")]
    #[arg(long)]
    download: bool,
}

fn init_logging() -> Option<rvc_infer::profiling::ProfilingGuard> {
    let guard = rvc_infer::profiling::init();
    if guard.is_none() {
        use tracing_subscriber::EnvFilter;
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();
    }
    guard
}

fn params_from_args(args: &Args, settings: &Settings) -> Result<ConversionParams> {
    let mut params = ConversionParams {
        f0_up_key: args.key,
        f0_method: args.method.parse::<PitchMethod>()?,
        index_rate: args.index_rate,
        filter_radius: args.filter_radius,
        resample_sr: args.resample_sr,
        rms_mix_rate: args.rms_mix,
        protect: args.protect,
        speaker_id: args.speaker,
        ..Default::default()
    };
    if let Some(seed) = args.seed {
        params.seed = seed;
    }
    settings.apply_to(&mut params)?;
    params.validate()?;
    Ok(params)
}

fn index_selection(args: &Args) -> IndexSelection {
    if args.no_index {
        IndexSelection::Disabled
    } else if let Some(raw) = &args.index {
        IndexSelection::Path(normalize_index_path(raw))
    } else {
        IndexSelection::Resolve
    }
}

fn progress_bar(label: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template("{msg} [{bar:30.cyan/blue}] {pos}/{len} chunks ({elapsed})")?
            .progress_chars("=> "),
    );
    pb.set_message(label.to_string());
    Ok(pb)
}

fn run(args: Args) -> Result<()> {
    let settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let params = params_from_args(&args, &settings)?;

    let models = match &args.model {
        Some(model) => vec![model.clone()],
        None => settings.models(&args.models_dir)?,
    };
    if models.is_empty() {
        return Err(VcError::config("no voice model given (use --model or the settings' model)").into());
    }
    let inputs = if args.inputs.is_empty() {
        settings.audio_files(&args.input_dir)?
    } else {
        args.inputs.clone()
    };
    if inputs.is_empty() {
        return Err(VcError::config("no input audio given").into());
    }
    if args.output.is_some() && models.len() * inputs.len() > 1 {
        return Err(VcError::config("--output needs exactly one input and one model; use --output-dir").into());
    }

    let device = settings.device.as_deref().unwrap_or(&args.device);
    let precision = if args.half { Precision::Half } else { Precision::Full };
    let context = SynthesisContext::resolve(device, precision, &SystemInventory)?;
    println!("Device: {} ({:?})", device_info(context.device()), context.precision());

    #[cfg(feature = "hub")]
    let assets = if args.download {
        rvc_infer::hub::download_assets(None)?
    } else {
        AssetPaths::in_dir(&args.assets_dir)
    };
    #[cfg(not(feature = "hub"))]
    let assets = AssetPaths::in_dir(&args.assets_dir);

    let converter = VoiceConverter::new(context)
        .with_assets(assets)
        .with_layout(ModelLayout::new(&args.models_dir));
    let index = index_selection(&args);

    let start = Instant::now();
    for model in &models {
        for input in &inputs {
            let output = match &args.output {
                Some(path) => path.clone(),
                None => args.output_dir.join(output_name(input, model)),
            };
            let request = VoiceConversionRequest::new(input.clone(), model.clone(), output)
                .with_index(index.clone())
                .with_params(params.clone());

            let label = output_name(input, model);
            let pb = progress_bar(&label)?;
            let result = converter.convert_with_progress(&request, &mut |done, total| {
                pb.set_length(total as u64);
                pb.set_position(done as u64);
            });
            pb.finish_and_clear();
            let report = result?;

            let index_label = report
                .index
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string());
            println!(
                "{} -> {} ({:.2}s @ {} Hz, {} chunk(s), index: {}, {:.2}s)",
                input.display(),
                report.output.display(),
                report.duration(),
                report.sample_rate,
                report.chunks,
                index_label,
                report.timing.total.as_secs_f64()
            );
        }
    }
    println!(
        "Converted {} file(s) in {:.2}s",
        models.len() * inputs.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn main() -> ExitCode {
    let _profiling_guard = init_logging();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            for cause in err.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            ExitCode::from(1)
        }
    }
}
