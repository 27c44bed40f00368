//! # Diagram Chat CLI (`dchat`)
//!
//! Generates architecture diagrams from natural-language prompts, renders
//! stored diagram documents, and serves both over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! dchat --config ./config/dchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dchat serve` | Start the HTTP server |
//! | `dchat generate "<prompt>"` | Generate and store a diagram |
//! | `dchat render <file>` | Render a diagram document to SVG/PNG/D2 |
//! | `dchat classify "<prompt>"` | Show how a chat message would be routed |
//! | `dchat fetch <filename>` | Download a diagram through the fallback chain |
//! | `dchat completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! # Generate with a fixed layout seed
//! dchat generate "Create a network diagram for AWS VPC with EC2 and RDS" --seed 42
//!
//! # Render a stored document to PNG
//! dchat render generated/diagram_20250101120000_ab12cd34.drawio --format png -o out.png
//!
//! # Fetch from a running server, with JSON status on stderr
//! dchat fetch diagram_20250101120000_ab12cd34.drawio --json
//! ```

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};

use diagram_chat::classify::{is_image_generation_request, is_network_diagram_request};
use diagram_chat::config::{self, Config};
use diagram_chat::document::DiagramDocument;
use diagram_chat::fallback::{FallbackClient, FetchOutcome};
use diagram_chat::layout::{LayoutKind, LayoutOptions};
use diagram_chat::models::ArtifactFormat;
use diagram_chat::pipeline::DiagramPipeline;
use diagram_chat::progress::StatusMode;
use diagram_chat::render::{self, d2, Rendered};
use diagram_chat::server;

/// Diagram Chat: natural language in, architecture diagrams out.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Every command except `serve` falls back to built-in defaults (LLM
/// disabled) when the file does not exist.
#[derive(Parser)]
#[command(
    name = "dchat",
    about = "Diagram Chat: generate, render and serve architecture diagrams",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Generate a diagram from a prompt and store it.
    ///
    /// Falls back to a built-in template when the LLM is disabled or fails.
    Generate {
        prompt: String,

        /// Extra knowledge-base context (repeatable).
        #[arg(long)]
        context: Vec<String>,

        /// Layout seed. The same seed and components give the same document.
        #[arg(long)]
        seed: Option<u64>,

        /// Force network shapes. Defaults to classifying the prompt.
        #[arg(long)]
        network: bool,

        /// Force a layout family instead of drawing one.
        #[arg(long, value_enum)]
        layout: Option<LayoutArg>,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Render a diagram document file.
    Render {
        path: PathBuf,

        #[arg(long, value_enum, default_value = "svg")]
        format: RenderFormat,

        /// Output file. Defaults to stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Show whether a message would trigger diagram generation.
    Classify { prompt: String },

    /// Download a stored diagram from a running server.
    ///
    /// Tries the SVG endpoint (rasterized locally), then the screenshot
    /// endpoint, then the raw document. If all fail, prints the URL to
    /// screenshot manually and exits non-zero.
    Fetch {
        filename: String,

        /// Server base URL. Defaults to `http://<server.bind>`.
        #[arg(long)]
        server: Option<String>,

        #[arg(long, value_enum, default_value = "png")]
        format: FetchFormat,

        /// Output file. Defaults to the filename with the artifact's extension.
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Per-request timeout in seconds.
        #[arg(long, default_value_t = 15)]
        timeout: u64,

        /// Emit status as JSON lines on stderr.
        #[arg(long)]
        json: bool,
    },

    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LayoutArg {
    Radial,
    Layered,
}

#[derive(Clone, Copy, ValueEnum)]
enum RenderFormat {
    Svg,
    Png,
    /// D2 source derived from the document.
    D2,
    /// PNG through the D2 CLI.
    D2Png,
    /// PNG through the headless browser.
    Screenshot,
}

#[derive(Clone, Copy, ValueEnum)]
enum FetchFormat {
    Png,
    Svg,
    Source,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "dchat", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = match &cli.command {
        Commands::Serve => config::load_config(&cli.config)?,
        _ => config_or_minimal(&cli.config)?,
    };

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Generate {
            prompt,
            context,
            seed,
            network,
            layout,
            json,
        } => {
            let network = network || is_network_diagram_request(&prompt);
            let mut options = match seed {
                Some(seed) => LayoutOptions::seeded(seed, network),
                None => LayoutOptions::random(network),
            };
            options.kind = layout.map(|l| match l {
                LayoutArg::Radial => LayoutKind::Radial,
                LayoutArg::Layered => LayoutKind::Layered,
            });

            let pipeline = DiagramPipeline::from_config(&cfg)?;
            let diagram = pipeline.generate(&prompt, &context, options).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&diagram)?);
            } else {
                println!(
                    "{}",
                    pipeline.store().dir().join(&diagram.filename).display()
                );
                println!(
                    "  title: {}\n  layout: {} (seed {})\n  source: {}",
                    diagram.title, diagram.layout, diagram.seed, diagram.source
                );
                for c in &diagram.dropped_connections {
                    eprintln!(
                        "Warning: dropped connection {} -> {} (unknown node)",
                        c.from, c.to
                    );
                }
            }
        }
        Commands::Render {
            path,
            format,
            output,
        } => {
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let bytes = match format {
                RenderFormat::Svg => report_fallback(render::render_svg(&source, &cfg.render)),
                RenderFormat::Png => render::render_png(&source, &cfg.render)?,
                RenderFormat::D2 => {
                    let (doc, repaired) = DiagramDocument::parse_lenient(&source)?;
                    if repaired {
                        eprintln!("Warning: {} was malformed and has been repaired", path.display());
                    }
                    d2::to_d2(&doc).into_bytes()
                }
                RenderFormat::D2Png => {
                    report_fallback(render::render_d2_png(&source, &cfg.render).await)
                }
                RenderFormat::Screenshot => {
                    report_fallback(render::render_screenshot(&source, &cfg.render).await)
                }
            };
            write_output(output.as_deref(), &bytes)?;
        }
        Commands::Classify { prompt } => {
            println!("image_generation: {}", is_image_generation_request(&prompt));
            println!("network: {}", is_network_diagram_request(&prompt));
        }
        Commands::Fetch {
            filename,
            server,
            format,
            output,
            timeout,
            json,
        } => {
            let base = server.unwrap_or_else(|| format!("http://{}", cfg.server.bind));
            let preferred = match format {
                FetchFormat::Png => ArtifactFormat::Png,
                FetchFormat::Svg => ArtifactFormat::Svg,
                FetchFormat::Source => ArtifactFormat::Source,
            };
            let mode = if json {
                StatusMode::Json
            } else {
                StatusMode::default_for_tty()
            };
            let reporter = mode.reporter();

            let client = FallbackClient::new(&base, timeout, cfg.render.png_scale)?;
            match client.fetch(&filename, preferred, reporter.as_ref()).await {
                FetchOutcome::Downloaded { artifact, .. } => {
                    let out = output.unwrap_or_else(|| {
                        PathBuf::from(format!(
                            "{}.{}",
                            filename
                                .rsplit_once('.')
                                .map(|(stem, _)| stem)
                                .unwrap_or(&filename),
                            artifact.format.extension()
                        ))
                    });
                    std::fs::write(&out, &artifact.bytes)
                        .with_context(|| format!("Failed to write {}", out.display()))?;
                    println!("{}", out.display());
                }
                FetchOutcome::Manual { message, .. } => {
                    bail!("{}", message);
                }
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Loads the config file when it exists, otherwise built-in defaults.
fn config_or_minimal(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::minimal())
    }
}

fn report_fallback(rendered: Rendered) -> Vec<u8> {
    if let Some(fallback) = &rendered.fallback {
        eprintln!(
            "Warning: rendered with fallback ({}): {}",
            fallback.header_value(),
            fallback.error()
        );
    }
    rendered.bytes
}

fn write_output(output: Option<&Path>, bytes: &[u8]) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, bytes)
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(bytes)?;
            stdout.flush()?;
            Ok(())
        }
    }
}
