mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use common::config::{read_config, KashoConfig};
use common::err::{KResult, KashoError};
use common::log::{OutputType, TracingFactory, TracingFactoryOptions};

#[derive(Parser, Debug, Clone)]
#[command(name = "kasho")]
#[command(version)]
#[command(about = "Security-and-privacy-first database replication pipeline")]
#[command(long_about = None)]
pub(crate) struct CliArgs {
    #[arg(short, long, help = "Path to the YAML configuration file", value_name = "FILE")]
    pub config: PathBuf,

    /// enable debug info
    #[arg(short, long, help = "enable debug mode", default_value_t = false)]
    pub debug: bool,

    #[arg(long, help = "override the primary database url", value_name = "URL")]
    pub primary_url: Option<String>,

    #[arg(long, help = "override the replica database url", value_name = "URL")]
    pub replica_url: Option<String>,

    #[arg(long, help = "override the buffer store url", value_name = "URL")]
    pub buffer_url: Option<String>,

    #[arg(long, help = "override the rpc bind / connect address", value_name = "ADDR")]
    pub rpc: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Run the change-stream capture service
    Stream,
    /// Run the translicator applier
    Apply,
    /// Convert a dump file into bootstrap changes in the buffer
    Convert {
        #[arg(value_name = "DUMP_FILE")]
        dump: PathBuf,
    },
    /// WAITING -> ACCUMULATING with a position captured from the primary
    StartBootstrap {
        #[arg(value_name = "START_POSITION")]
        start_position: String,
    },
    /// ACCUMULATING -> STREAMING
    CompleteBootstrap,
    /// Show service state and counters
    Status,
    /// Recovery: back to WAITING from any state
    Reset,
    /// Follow the change stream from a position (blocks until STREAMING)
    Tail {
        #[arg(default_value = "", value_name = "FROM_POSITION")]
        from_position: String,
    },
}

#[tokio::main]
async fn main() -> KResult<()> {
    let args = CliArgs::parse();

    let mut config = load_config(&args)?;
    merge(&mut config, &args);

    let log_opt = TracingFactoryOptions::new(
        args.debug || config.base.debug,
        OutputType::Log,
        config.base.log_dir.clone(),
    );
    let log_factory = TracingFactory::init_log_with_options(log_opt);
    eprintln!("log_dir: {:?}", log_factory.get_log_dir());

    eprintln!();
    eprintln!("╦╔═╔═╗╔═╗╦ ╦╔═╗");
    eprintln!("╠╩╗╠═╣╚═╗╠═╣║ ║ replication pipeline");
    eprintln!("╩ ╩╩ ╩╚═╝╩ ╩╚═╝");
    eprintln!();

    match args.command.clone() {
        Commands::Stream => commands::run_stream(config).await,
        Commands::Apply => commands::run_apply(config).await,
        Commands::Convert { dump } => commands::run_convert(config, &dump).await,
        Commands::StartBootstrap { start_position } => {
            commands::ctl_start_bootstrap(&config, &start_position).await
        }
        Commands::CompleteBootstrap => commands::ctl_complete_bootstrap(&config).await,
        Commands::Status => commands::ctl_status(&config).await,
        Commands::Reset => commands::ctl_reset(&config).await,
        Commands::Tail { from_position } => commands::ctl_tail(&config, &from_position).await,
    }
}

fn load_config(args: &CliArgs) -> KResult<KashoConfig> {
    read_config(&args.config).map_err(|e| match e {
        KashoError::Config(m) => KashoError::Config(format!("--config {}", m)),
        other => other,
    })
}

/// command-line overrides win over the file
fn merge(config: &mut KashoConfig, args: &CliArgs) {
    if let Some(url) = &args.primary_url {
        config.primary_url = url.clone();
    }
    if let Some(url) = &args.replica_url {
        config.replica_url = url.clone();
    }
    if let Some(url) = &args.buffer_url {
        config.buffer_url = url.clone();
    }
    if let Some(rpc) = &args.rpc {
        config.rpc_bind = rpc.clone();
    }
    if args.debug {
        config.base.debug = true;
    }
}
