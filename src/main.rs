use clap::{Parser, Subcommand};
use tag_monitor::{commands, config::Config, logging};

#[derive(Parser)]
#[command(name = "tag-monitor")]
#[command(version, about = "Tracks container image tag digests across registries")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted (default)
    Run,
    /// Run one retention, discovery and refresh pass, then exit
    Refresh,
    /// Start monitoring tags, e.g. `nginx:1.27` or `ghcr.io/owner/app:v1`
    Add {
        #[arg(required = true)]
        references: Vec<String>,
    },
    /// Show the digest history of a monitored tag
    History { reference: String },
    /// Show row counts and recent refresh cycles
    Status {
        /// Number of refresh cycles to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.config.validate().map_err(anyhow::Error::msg)?;

    let _guard = logging::init(
        &cli.config.log_format,
        &cli.config.log_level,
        cli.config.log_file.as_deref(),
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        None | Some(Command::Run) => runtime.block_on(commands::run(&cli.config)),
        Some(Command::Refresh) => runtime.block_on(commands::refresh(&cli.config)),
        Some(Command::Add { references }) => {
            runtime.block_on(commands::add(&cli.config, &references))
        }
        Some(Command::History { reference }) => commands::history(&cli.config, &reference),
        Some(Command::Status { limit }) => commands::status(&cli.config, limit),
    }
}
