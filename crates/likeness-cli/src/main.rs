use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use likeness_core::{
    ArcFaceEmbedder, DirectorySource, Embedder, EmbeddingComparator, EnrollReason, FaceDetector,
    FrameSource, GalleryStore, IdentityName, IdentityResolver, Outcome, PendingEnrollment,
    ResolvedBy, ScrfdDetector, StillImageSource, ThumbnailEmbedder, Unresolved, WholeFrameDetector,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "likeness", about = "Face gallery: resolve, enroll and inspect identities")]
struct Cli {
    /// TOML config file (defaults to $LIKENESS_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct FrameInput {
    /// Single face image to resolve
    #[arg(long, conflicts_with = "frames", required_unless_present = "frames")]
    image: Option<PathBuf>,
    /// Directory of frames, played in file-name order until a face is found
    #[arg(long)]
    frames: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a face and match it against the gallery, enrolling if needed
    Resolve {
        #[command(flatten)]
        input: FrameInput,
        /// Name to enroll under when no confident match is found.
        /// Without it the name is asked for on the terminal.
        #[arg(short, long)]
        name: Option<String>,
    },
    /// List identities and their stored image counts
    List,
    /// Print the counts ledger
    Counts,
    /// Report drift between the counts ledger and the image folders
    Check,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Resolve { input, name } => resolve(&config, input, name),
        Commands::List => list(&config.gallery()),
        Commands::Counts => counts(&config.gallery()),
        Commands::Check => check(&config.gallery()),
    }
}

fn resolve(config: &Config, input: FrameInput, name: Option<String>) -> Result<()> {
    let source: Box<dyn FrameSource> = match (input.image, input.frames) {
        (Some(image), _) => Box::new(StillImageSource::new(image)),
        (None, Some(dir)) => Box::new(
            DirectorySource::open(&dir).with_context(|| format!("opening frames {}", dir.display()))?,
        ),
        (None, None) => bail!("either --image or --frames is required"),
    };

    let detector: Box<dyn FaceDetector> = match &config.detector_model_path {
        Some(path) => Box::new(
            ScrfdDetector::load(path).with_context(|| format!("loading detector {}", path.display()))?,
        ),
        None => {
            tracing::debug!("no detector configured; frames are taken as face crops");
            Box::new(WholeFrameDetector)
        }
    };

    let embedder: Box<dyn Embedder> = match &config.model_path {
        Some(path) => Box::new(
            ArcFaceEmbedder::load(path).with_context(|| format!("loading model {}", path.display()))?,
        ),
        None => {
            tracing::warn!("no model configured; using thumbnail embedder");
            Box::new(ThumbnailEmbedder)
        }
    };

    // Validate up front so a headless run never stalls on a bad name.
    let name = name
        .map(|raw| IdentityName::parse(&raw))
        .transpose()
        .context("invalid --name")?;

    let mut resolver = IdentityResolver::new(
        config.gallery(),
        config.staging(),
        source,
        detector,
        EmbeddingComparator::new(embedder),
        config.resolver_config(),
    );

    let resolved = match resolver.resolve()? {
        Outcome::Unresolved(reason) => {
            let why = match reason {
                Unresolved::NoFace => "no face detected",
                Unresolved::CaptureFailed => "capture failed",
                Unresolved::ComparisonFailed => "comparison failed",
            };
            println!("No person detected ({why}).");
            return Ok(());
        }
        Outcome::Resolved(resolved) => resolved,
        Outcome::NameRequired(pending) => {
            let name = match name {
                Some(name) => name,
                None => prompt_name(&pending)?,
            };
            resolver.enroll(pending, name)?
        }
    };

    match resolved.by {
        ResolvedBy::Reinforcement { distance } => println!(
            "Recognized as {} (distance {distance:.3}, {} images).",
            resolved.identity.name, resolved.identity.image_count
        ),
        ResolvedBy::Enrollment => println!(
            "Stored face for {} ({} images).",
            resolved.identity.name, resolved.identity.image_count
        ),
    }
    Ok(())
}

/// Ask on the terminal until a usable name is entered.
fn prompt_name(pending: &PendingEnrollment) -> Result<IdentityName> {
    match pending.reason() {
        EnrollReason::EmptyGallery => eprintln!("No known faces. Storing first face."),
        EnrollReason::LowConfidence { distance } => {
            if let Some(closest) = &pending.best_match().best_identity {
                eprintln!("Closest match is {closest} at distance {distance:.3}, not close enough.");
            }
        }
        EnrollReason::NoMatch | EnrollReason::MissingDistance | EnrollReason::ComparisonFailed => {
            eprintln!("No match found. Storing as a new face.")
        }
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        eprint!("Enter the person's name: ");
        io::stderr().flush()?;
        let Some(line) = lines.next() else {
            bail!("input closed before a name was entered");
        };
        match IdentityName::parse(&line?) {
            Ok(name) => return Ok(name),
            Err(e) => eprintln!("{e}. Please enter a valid name."),
        }
    }
}

fn list(gallery: &GalleryStore) -> Result<()> {
    let identities = gallery.list_identities()?;
    if identities.is_empty() {
        println!("No identities enrolled");
        return Ok(());
    }
    for name in identities {
        println!("{name}\t{}", gallery.images(&name)?.len());
    }
    Ok(())
}

fn counts(gallery: &GalleryStore) -> Result<()> {
    let counts = gallery.load_counts()?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}

fn check(gallery: &GalleryStore) -> Result<()> {
    let report = gallery.check()?;
    for name in &report.unledgered {
        println!("{name}: images on disk but missing from ledger");
    }
    for name in &report.orphaned {
        println!("{name}: in ledger but no images on disk");
    }
    for (name, ledger, on_disk) in &report.mismatched {
        println!("{name}: ledger says {ledger}, {on_disk} images on disk");
    }
    if !report.is_consistent() {
        bail!("gallery and ledger disagree");
    }
    println!("Gallery consistent");
    Ok(())
}
