use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use image::RgbaImage;
use pagedeck_core::{
    assemble_merge, assemble_split, parse_page_ranges, split_output_name, PageRegistry, Rasterizer,
    RenderImage, MERGE_OUTPUT_NAME,
};
use pagedeck_render::{PdfiumEngine, RenderScheduler, RenderState};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "pagedeck",
    version,
    about = "assemble new PDFs from pages of existing ones, entirely in process"
)]
struct Args {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Merge pages from one or more PDFs into a single output document
    Merge {
        /// Source files, in the order their pages should appear
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Move one entry of the combined page order before assembling,
        /// written as FROM:TO (0-based positions, repeatable, applied in turn)
        #[arg(long = "move", value_name = "FROM:TO")]
        moves: Vec<String>,

        /// Output path (defaults to merged-document.pdf)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Extract a subset of pages from a single PDF
    Split {
        file: PathBuf,

        /// 1-based pages to keep, e.g. "1-3,5"
        #[arg(short, long)]
        pages: String,

        /// Output path (defaults to split-<file name>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Render per-page thumbnails to PNG files
    Thumbs {
        file: PathBuf,

        /// Raster scale relative to the page's natural size
        #[arg(long, default_value_t = 0.4)]
        scale: f32,

        /// Directory for the PNG files (defaults to the working directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging()?;
    let engine = PdfiumEngine::new()?;

    match args.command {
        CliCommand::Merge {
            files,
            moves,
            output,
        } => merge(&engine, &files, &moves, output).await,
        CliCommand::Split {
            file,
            pages,
            output,
        } => split(&engine, &file, &pages, output).await,
        CliCommand::Thumbs {
            file,
            scale,
            output,
        } => thumbs(engine, &file, scale, output).await,
    }
}

async fn merge(
    engine: &PdfiumEngine,
    files: &[PathBuf],
    moves: &[String],
    output: Option<PathBuf>,
) -> Result<()> {
    let mut registry = PageRegistry::new();
    for path in files {
        let (bytes, name) = read_document(path)?;
        registry
            .add_document(engine, bytes, &name)
            .await
            .with_context(|| format!("failed to open {:?}", path))?;
    }

    for spec in moves {
        let (from, to) = parse_move(spec)?;
        registry
            .reorder(from, to)
            .with_context(|| format!("cannot apply move {spec}"))?;
    }

    let bytes = assemble_merge(engine, &registry).await?;
    let path = output.unwrap_or_else(|| PathBuf::from(MERGE_OUTPUT_NAME));
    fs::write(&path, &bytes).with_context(|| format!("failed to write {:?}", path))?;
    info!(pages = registry.order().len(), path = %path.display(), "merge complete");
    println!("wrote {} ({} pages)", path.display(), registry.order().len());
    Ok(())
}

async fn split(
    engine: &PdfiumEngine,
    file: &Path,
    pages: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let (bytes, name) = read_document(file)?;
    let mut registry = PageRegistry::new();
    registry
        .add_document(engine, bytes, &name)
        .await
        .with_context(|| format!("failed to open {:?}", file))?;

    let page_count = registry.split_document().map_or(0, |d| d.page_count);
    let selected = parse_page_ranges(pages, page_count);
    if selected.is_empty() {
        bail!("no pages selected by {pages:?} (document has {page_count} pages)");
    }
    registry.set_selection(selected);

    let out_bytes = assemble_split(engine, &registry).await?;
    let path = output.unwrap_or_else(|| PathBuf::from(split_output_name(&name)));
    fs::write(&path, &out_bytes).with_context(|| format!("failed to write {:?}", path))?;
    info!(pages = registry.selection().len(), path = %path.display(), "split complete");
    println!(
        "wrote {} ({} pages)",
        path.display(),
        registry.selection().len()
    );
    Ok(())
}

async fn thumbs(
    engine: PdfiumEngine,
    file: &Path,
    scale: f32,
    output: Option<PathBuf>,
) -> Result<()> {
    let (bytes, name) = read_document(file)?;
    let mut registry = PageRegistry::new();
    registry
        .add_document(&engine, bytes.clone(), &name)
        .await
        .with_context(|| format!("failed to open {:?}", file))?;

    // The rasterizer gets its own view of the bytes, independent of the copy
    // the registry retains for assembly.
    let proxy = Arc::new(
        engine
            .open_document(&bytes)
            .await
            .with_context(|| format!("failed to open {:?} for rendering", file))?,
    );
    let scheduler = RenderScheduler::new(Arc::new(engine));

    let dir = output.unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {:?}", dir))?;

    let order = registry.order().to_vec();
    for id in &order {
        let (_, page_index) = registry.resolve(*id)?;
        scheduler.request_render(*id, Arc::clone(&proxy), page_index, scale);
    }

    let stem = Path::new(&name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("page")
        .to_string();
    let mut written = 0usize;
    for id in &order {
        let (_, page_index) = registry.resolve(*id)?;
        match scheduler.wait_for(*id).await {
            RenderState::Rendered(image) => {
                let path = dir.join(format!("{stem}-{:03}.png", page_index + 1));
                write_png(&image, &path)?;
                written += 1;
            }
            state => warn!(page = page_index + 1, ?state, "thumbnail not rendered"),
        }
        scheduler.dispose(*id);
    }

    println!("wrote {written} thumbnails to {}", dir.display());
    Ok(())
}

fn read_document(path: &Path) -> Result<(Bytes, String)> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("document.pdf")
        .to_string();
    Ok((Bytes::from(bytes), name))
}

fn parse_move(spec: &str) -> Result<(usize, usize)> {
    let (from, to) = spec
        .split_once(':')
        .ok_or_else(|| anyhow!("move must look like FROM:TO, got {spec:?}"))?;
    let from = from
        .trim()
        .parse()
        .with_context(|| format!("invalid move origin {from:?}"))?;
    let to = to
        .trim()
        .parse()
        .with_context(|| format!("invalid move target {to:?}"))?;
    Ok((from, to))
}

fn write_png(image: &RenderImage, path: &Path) -> Result<()> {
    let raster = RgbaImage::from_raw(image.width, image.height, image.pixels.clone())
        .ok_or_else(|| anyhow!("render produced a malformed raster"))?;
    raster
        .save(path)
        .with_context(|| format!("failed to write {:?}", path))
}

fn init_logging() -> Result<WorkerGuard> {
    let project_dirs = ProjectDirs::from("net", "pagedeck", "pagedeck")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pagedeck.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_specs_parse_as_position_pairs() {
        assert_eq!(parse_move("4:0").unwrap(), (4, 0));
        assert_eq!(parse_move(" 2 : 7 ").unwrap(), (2, 7));
        assert!(parse_move("4").is_err());
        assert!(parse_move("a:b").is_err());
    }
}
