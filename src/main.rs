use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use log::{info, warn};

use inkcritic::presentation::{export_composite, render_markdown, FAILURE_MESSAGE};
use inkcritic::{CritiqueSession, ExportOptions, RelayServer, Settings, StrokeSession};

#[derive(Parser, Debug)]
#[command(name = "inkcritic", version, about = "Calligraphy practice critique relay")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server.
    Serve(ServeArgs),
    /// Rasterize a stroke file to PNG.
    Render(RenderArgs),
    /// Send a stroke file to a running relay and print the critique.
    Critique(CritiqueArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Config file (TOML, YAML or JSON). Defaults to ./inkcritic.* if present.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Stroke session JSON.
    input: PathBuf,

    /// Output PNG path.
    #[arg(short, long)]
    out: PathBuf,

    /// Leave out the guide grid.
    #[arg(long)]
    no_grid: bool,
}

#[derive(Parser, Debug)]
struct CritiqueArgs {
    /// Stroke session JSON.
    input: PathBuf,

    /// Relay base URL.
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Write the canvas and critique side by side to this SVG.
    #[arg(long)]
    export: Option<PathBuf>,

    /// Ask for a single JSON report with scores instead of a stream.
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Serve(args) => cmd_serve(args),
        Command::Render(args) => cmd_render(args),
        Command::Critique(args) => cmd_critique(args),
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
}

fn read_session(path: &Path) -> anyhow::Result<StrokeSession> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("open stroke file '{}'", path.display()))?;
    Ok(StrokeSession::from_json(&json)?)
}

fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let settings = Settings::load(args.config.as_deref())?;
    let rt = runtime()?;
    let server = RelayServer::bind(settings, rt.handle().clone())?;
    server.run();
    Ok(())
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let session = read_session(&args.input)?;
    let options = ExportOptions {
        grid: !args.no_grid,
        ..ExportOptions::default()
    };
    let png = session.export_png(&options)?;
    std::fs::write(&args.out, &png).with_context(|| format!("write '{}'", args.out.display()))?;
    let (w, h) = session.surface.raster_size();
    info!("Wrote {}x{} canvas to {}", w, h, args.out.display());
    Ok(())
}

fn cmd_critique(args: CritiqueArgs) -> anyhow::Result<()> {
    let strokes = read_session(&args.input)?;
    if strokes.is_empty() {
        warn!("Canvas is blank; submitting anyway");
    }
    let options = ExportOptions::default();
    let png = strokes.export_png(&options)?;
    let data_url = strokes.export_data_url(&options)?;

    let session = CritiqueSession::new(&args.server)?;
    let live = std::io::stdout().is_terminal();
    let rt = runtime()?;

    let result = rt.block_on(session.submit(data_url, args.json, |buffer| {
        if live {
            let mut out = std::io::stdout().lock();
            let _ = write!(out, "\x1b[2J\x1b[H{}", buffer.render());
            let _ = out.flush();
        }
    }));

    let submission = match result {
        Ok(submission) => submission,
        Err(e) => {
            log::debug!("Critique failed: {}", e);
            eprintln!("{}", FAILURE_MESSAGE);
            std::process::exit(1);
        }
    };

    if !live {
        print!("{}", render_markdown(submission.critique.text()));
    }
    if let Some(card) = &submission.scores {
        println!();
        for (key, score) in &card.scores {
            println!("{:<12} {:.1}", key, score);
        }
        println!("{:<12} {:.1}", "average", card.average_score);
    }

    if let Some(path) = &args.export {
        let svg = export_composite(
            &png,
            strokes.surface.raster_size(),
            submission.critique.text(),
            submission.scores.as_ref(),
        );
        std::fs::write(path, svg).with_context(|| format!("write '{}'", path.display()))?;
        info!("Exported critique to {}", path.display());
    }
    Ok(())
}
