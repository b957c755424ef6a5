use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

use dicom_surface::{
    ArtifactKind, ArtifactStore, ArtifactStoreExt, FsArtifactStore, Orientation, Pipeline,
    PipelineConfig, Window,
};

#[derive(Parser, Debug)]
#[command(name = "dicom-surface", version)]
#[command(about = "Reconstruct a surface mesh from a stack of DICOM slices", long_about = None)]
struct Cli {
    /// Log more detail (-v for debug, -vv for trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline and write every artifact
    Run(RunArgs),
    /// List which artifacts are present
    Status(ConfigArgs),
    /// Render one slice of the stored volume or mask to PNG
    Preview(PreviewArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// TOML file with pipeline settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the DICOM slices
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Directory the artifacts are written to
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Keep this run's artifacts in their own subdirectory
    #[arg(long)]
    namespace: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Segmentation threshold in Hounsfield units
    #[arg(long)]
    threshold: Option<f32>,

    /// Seed for the noise of the synthetic fallback volume
    #[arg(long)]
    seed: Option<u64>,

    /// Start from the persisted volume instead of the input directory
    #[arg(long)]
    from_persisted: bool,
}

#[derive(Args, Debug)]
struct PreviewArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long, value_enum, default_value = "volume")]
    artifact: PreviewArtifact,

    #[arg(long, value_enum, default_value = "axial")]
    orientation: PreviewOrientation,

    /// Slice index, defaults to the center of the volume
    #[arg(long)]
    index: Option<usize>,

    /// Output PNG file
    #[arg(long)]
    out: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PreviewArtifact {
    Volume,
    Mask,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PreviewOrientation {
    Axial,
    Coronal,
    Sagittal,
}

impl From<PreviewOrientation> for Orientation {
    fn from(orientation: PreviewOrientation) -> Self {
        match orientation {
            PreviewOrientation::Axial => Orientation::Axial,
            PreviewOrientation::Coronal => Orientation::Coronal,
            PreviewOrientation::Sagittal => Orientation::Sagittal,
        }
    }
}

impl ConfigArgs {
    fn load(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => PipelineConfig::default(),
        };

        if let Some(input) = &self.input {
            config.input_dir = input.clone();
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.run_namespace = Some(namespace.clone());
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = filter::Targets::new()
        .with_default(LevelFilter::WARN)
        .with_target("dicom_surface", level);
    let format = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .init();

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Status(args) => status(&args),
        Commands::Preview(args) => preview(args),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let mut config = args.config.load()?;
    if let Some(threshold) = args.threshold {
        config.threshold = threshold;
    }
    if let Some(seed) = args.seed {
        config.synthetic.seed = Some(seed);
    }

    let pipeline = Pipeline::from_config(config);
    let report = if args.from_persisted {
        pipeline.run_from_persisted()?
    } else {
        pipeline.run()?
    };

    println!("source:     {} ({} slices)", report.source, report.slice_count);
    println!(
        "volume:     {:?} at {:?} mm",
        report.volume_shape, report.spacing
    );
    println!("foreground: {} voxels", report.foreground_voxels);
    println!(
        "mesh:       {} vertices, {} faces",
        report.vertex_count, report.face_count
    );
    for (stage, elapsed) in &report.timings {
        println!("  {stage:<26} {elapsed:?}");
    }
    println!("artifacts:  {}", pipeline.store().dir().display());
    Ok(())
}

fn status(args: &ConfigArgs) -> Result<()> {
    let config = args.load()?;
    let store = FsArtifactStore::new(config.artifact_dir());

    for kind in ArtifactKind::ALL {
        let state = if store.exists(kind) { "present" } else { "missing" };
        println!("{:<8} {:<8} {}", kind.to_string(), state, store.location(kind));
    }
    Ok(())
}

fn preview(args: PreviewArgs) -> Result<()> {
    let config = args.config.load()?;
    let store = FsArtifactStore::new(config.artifact_dir());
    let orientation = Orientation::from(args.orientation);

    let (image, shape) = match args.artifact {
        PreviewArtifact::Volume => {
            let Some(volume) = store.get_volume()? else {
                bail!("No volume in {}, run the pipeline first", store.dir().display());
            };
            let index = args.index.unwrap_or_else(|| center(volume.dim(), orientation));
            let image = volume.slice_image(index, orientation, Window::default());
            (image, volume.dim())
        }
        PreviewArtifact::Mask => {
            let Some(mask) = store.get_mask()? else {
                bail!("No mask in {}, run the pipeline first", store.dir().display());
            };
            let index = args.index.unwrap_or_else(|| center(mask.dim(), orientation));
            (mask.slice_image(index, orientation), mask.dim())
        }
    };

    let Some(image) = image else {
        bail!("Slice index is out of range for {orientation:?} slices of a {shape:?} volume");
    };
    image
        .save(&args.out)
        .with_context(|| format!("Failed to write {}", args.out.display()))?;
    info!("Wrote {:?} preview to {}", orientation, args.out.display());
    Ok(())
}

fn center((depth, height, width): (usize, usize, usize), orientation: Orientation) -> usize {
    match orientation {
        Orientation::Axial => depth / 2,
        Orientation::Coronal => height / 2,
        Orientation::Sagittal => width / 2,
    }
}
