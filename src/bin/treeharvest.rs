use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use tree_harvest::app::App;
use tree_harvest::config::ConfigLoader;
use tree_harvest::download::{DownloadCandidate, Downloader, ReqwestTransport};
use tree_harvest::error::HarvestError;
use tree_harvest::output::{JsonOutput, LogSink};

#[derive(Parser)]
#[command(name = "treeharvest")]
#[command(about = "Collect phylogenetic tree files from paper datasets and assign lineages")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Check whether files parse as Newick or NEXUS trees")]
    Validate(ValidateArgs),
    #[command(about = "Store tree files from a local zip or single file")]
    Extract(ExtractArgs),
    #[command(about = "Download one file with retries and store its trees")]
    Fetch(FetchArgs),
    #[command(about = "Assign lineages to harvested paper records")]
    Assign(AssignArgs),
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(required = true)]
    files: Vec<Utf8PathBuf>,
}

#[derive(Args)]
struct ExtractArgs {
    file: Utf8PathBuf,

    #[arg(long)]
    out: Utf8PathBuf,
}

#[derive(Args)]
struct FetchArgs {
    url: String,

    #[arg(long, default_value_t = 0)]
    size: u64,

    #[arg(long)]
    name: String,

    #[arg(long)]
    out: Utf8PathBuf,
}

#[derive(Args)]
struct AssignArgs {
    #[arg(required = true)]
    inputs: Vec<Utf8PathBuf>,

    #[arg(long)]
    output: Utf8PathBuf,

    #[arg(long)]
    no_dedup: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::MissingConfig | HarvestError::MissingInput(_) => 2,
        HarvestError::Http(_) | HarvestError::DownloadFailed { .. } => 3,
        HarvestError::Cancelled => 130,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve_or_default(cli.config.as_deref())?;
    let transport = ReqwestTransport::new(config.download.timeout)?;
    let downloader = Downloader::new(transport, config.download);
    let app = App::new(config, downloader);

    match cli.command {
        Commands::Validate(args) => {
            let result = app.validate(&args.files);
            JsonOutput::print_validate(&result).into_diagnostic()
        }
        Commands::Extract(args) => {
            let result = app.extract_file(&args.file, &args.out)?;
            JsonOutput::print_store(&result).into_diagnostic()
        }
        Commands::Fetch(args) => {
            let candidate = DownloadCandidate {
                url: args.url,
                declared_size: args.size,
                filename: args.name,
            };
            let result = app.fetch(&candidate, &args.out)?;
            JsonOutput::print_store(&result).into_diagnostic()
        }
        Commands::Assign(args) => {
            let report = app.assign(&args.inputs, &args.output, !args.no_dedup, &LogSink)?;
            JsonOutput::print_assign(&report).into_diagnostic()
        }
    }
}
