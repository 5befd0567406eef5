use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use comfy_sdl::prompt::injector::PromptInputs;
use comfy_sdl::service::Session;
use comfy_sdl::{AppError, ComfyUIClient, Config, ImageService};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "comfyctl", about = "Generate images through ComfyUI workflows", version)]
struct Cli {
    /// Override COMFYUI_URL
    #[arg(global = true, long)]
    comfyui_url: Option<String>,

    /// Override WORKFLOWS_DIR
    #[arg(global = true, long, value_name = "DIR")]
    workflows_dir: Option<PathBuf>,

    /// Workflow index to use instead of DEFAULT_WORKFLOW_INDEX
    #[arg(global = true, short, long)]
    workflow: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Text to image
    Gen {
        prompt: String,
        #[arg(long)]
        negative: Option<String>,
        #[arg(long)]
        seed: Option<u64>,
        /// Output path (defaults to ./<prompt_id>.png)
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },
    /// Image to image from a local reference file
    I2i {
        prompt: String,
        #[arg(long, value_name = "PATH")]
        image: PathBuf,
        #[arg(long)]
        negative: Option<String>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },
    /// Check that the backend answers, with queue depth
    Check,
    /// Workflow listing and inspection
    Wf {
        #[command(subcommand)]
        cmd: WfCmd,
    },
}

#[derive(Subcommand, Debug)]
enum WfCmd {
    /// List loaded workflows
    List,
    /// Show the roles inferred for one workflow
    Show { index: usize },
    /// Re-read the workflow directory and report bad files
    Reload,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    Config::dotenv_load();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error [{}]: {}", e.kind().code(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let mut conf = Config::new()?;
    if let Some(url) = cli.comfyui_url {
        conf.set_comfyui_url(&url)?;
    }
    if let Some(dir) = cli.workflows_dir {
        conf.workflows_dir = dir;
    }

    let backend = Arc::new(ComfyUIClient::new(conf.comfyui_url.clone(), conf.request_timeout));
    let service = ImageService::from_config(&conf, backend);
    let report = service.reload_workflows().await?;
    for failed in &report.failed {
        eprintln!("Warning: [{}] {}: {}", failed.index, failed.file, failed.error);
    }

    let session = Session::new(cli.workflow.unwrap_or(conf.default_workflow_index));

    match cli.command {
        Commands::Gen { prompt, negative, seed, out } => {
            let inputs = PromptInputs {
                prompt,
                negative,
                seed,
                reference_image: None,
            };
            generate(&service, &session, inputs, out).await
        }
        Commands::I2i { prompt, image, negative, seed, out } => {
            let bytes = tokio::fs::read(&image).await?;
            let inputs = PromptInputs {
                prompt,
                negative,
                seed,
                reference_image: Some(bytes),
            };
            generate(&service, &session, inputs, out).await
        }
        Commands::Check => {
            let health = service.check_backend_health().await;
            if health.reachable {
                println!("ComfyUI at {} is up", conf.comfyui_url);
                if let (Some(running), Some(pending)) = (health.queue_running, health.queue_pending) {
                    println!("queue: {} running, {} pending", running, pending);
                }
                Ok(())
            } else {
                Err(AppError::BackendUnreachable(health.detail))
            }
        }
        Commands::Wf { cmd } => match cmd {
            WfCmd::List => {
                for wf in service.list_workflows().await {
                    let marker = if wf.index == session.workflow_index() { "*" } else { " " };
                    let mode = match (wf.supported, wf.has_image_input) {
                        (false, _) => "unsupported",
                        (true, true) => "txt2img+img2img",
                        (true, false) => "txt2img",
                    };
                    println!("{marker}[{}] {} ({}) - {}", wf.index, wf.name, mode, wf.description);
                }
                Ok(())
            }
            WfCmd::Show { index } => {
                let details = service.describe_workflow(index).await?;
                println!("{}", serde_json::to_string_pretty(&details).unwrap_or_default());
                Ok(())
            }
            WfCmd::Reload => {
                println!("loaded {} workflow(s), {} failed", report.loaded, report.failed.len());
                Ok(())
            }
        },
    }
}

async fn generate(
    service: &ImageService,
    session: &Session,
    inputs: PromptInputs,
    out: Option<PathBuf>,
) -> Result<(), AppError> {
    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let result = service.generate_with(session, inputs, &cancel).await?;
    let path = out.unwrap_or_else(|| PathBuf::from(format!("{}.png", result.prompt_id)));
    tokio::fs::write(&path, &result.image).await?;
    println!("Saved {} ({} bytes)", path.display(), result.image.len());
    match result.seed {
        Some(seed) => println!("seed: {seed}"),
        None => println!("seed: (set by workflow)"),
    }
    println!("prompt: {}", result.positive_prompt);
    println!("took {:.1}s", result.elapsed.as_secs_f64());
    Ok(())
}
