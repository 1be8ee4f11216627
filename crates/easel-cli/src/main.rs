use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use easel_contracts::{BoxSpec, ExtendImageRequest, ExtensionPolicy};
use easel_engine::{
    DiskStorage, DryrunAnalyser, DryrunBackend, DryrunDetector, ExtendImageEngine,
    HttpBackgroundAnalyser, ImageFetcher, ReplicateBackend,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "easel", about = "Extend an image to larger target dimensions")]
struct Args {
    /// Source image file
    #[arg(long)]
    image: PathBuf,

    /// Target canvas width in pixels
    #[arg(long)]
    target_width: u32,

    /// Target canvas height in pixels
    #[arg(long)]
    target_height: u32,

    /// Placement of the source on the target canvas, as x,y,width,height
    #[arg(long = "box", value_name = "X,Y,W,H")]
    original_box: String,

    /// Mask orientation for the generation backend
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL")]
    invert_text: bool,

    /// Detect text, remove it before extending, and restore it at the end
    #[arg(long)]
    remove_text: bool,

    /// Directory for stored intermediates and the final image
    #[arg(long, default_value = "media")]
    media_root: PathBuf,

    /// Run fully offline with the built-in fill backend
    #[arg(long)]
    dryrun: bool,

    /// User namespace for the stored result
    #[arg(long, default_value = "local")]
    user: String,
}

fn parse_box(raw: &str) -> Result<BoxSpec> {
    let parts: Vec<u32> = raw
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .with_context(|| format!("invalid box component: {part:?}"))
        })
        .collect::<Result<_>>()?;
    let [x, y, width, height] = parts.as_slice() else {
        bail!("--box expects four comma-separated integers (x,y,width,height)");
    };
    Ok(BoxSpec {
        x: *x,
        y: *y,
        width: *width,
        height: *height,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let request = ExtendImageRequest {
        target_width: args.target_width,
        target_height: args.target_height,
        original_box: parse_box(&args.original_box)?,
        invert_text: args.invert_text,
        remove_text: args.remove_text,
    };
    request.validate()?;

    let file_bytes = fs::read(&args.image)
        .with_context(|| format!("failed reading {}", args.image.display()))?;

    let storage = DiskStorage::new(&args.media_root);
    let engine = if args.dryrun {
        info!("using dryrun backend; no network calls will be made");
        ExtendImageEngine::new(
            Box::new(DryrunBackend::new(storage.clone())?),
            Box::new(DryrunAnalyser),
            Box::new(DryrunDetector),
            Box::new(storage),
            ImageFetcher::new()?,
        )
    } else {
        let backend = ReplicateBackend::new()?;
        let detector = ReplicateBackend::new()?;
        ExtendImageEngine::new(
            Box::new(backend),
            Box::new(HttpBackgroundAnalyser::new()?),
            Box::new(detector),
            Box::new(storage),
            ImageFetcher::new()?,
        )
    }
    .with_policy(ExtensionPolicy::default());

    let outcome = engine.extend_image(&request, &file_bytes, &args.user)?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
