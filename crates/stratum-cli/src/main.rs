mod commands;
mod settings;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::config::ConfigAction;
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_HOST_ERROR};
use settings::{config_err, SchemeOverrides, Settings};
use std::path::PathBuf;
use std::process::ExitCode;
use stratum_core::{install_signal_handler, Engine};
use stratum_host::{check_prereqs, format_missing, Host};
use stratum_schema::Configuration;

#[derive(Debug, Parser)]
#[command(
    name = "stratum",
    version,
    about = "Snapshot-based root filesystem layering on thin-provisioned LVM"
)]
struct Cli {
    /// Log host commands instead of running them.
    #[arg(long, default_value_t = false, global = true)]
    dry: bool,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    /// Read and write this file instead of the system configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    scheme: SchemeOverrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show bases and their layers as a tree.
    Layout,
    /// Create the volume group and thinpool, or adopt an installed root volume.
    Init {
        /// Thinpool size, e.g. 20G.
        #[arg(long, conflicts_with = "from")]
        size: Option<String>,
        /// Physical volume to create the volume group on (repeatable).
        #[arg(long = "pv", conflicts_with = "from")]
        pvs: Vec<String>,
        /// Take size and physical volumes from a `[pool <name>]` config section.
        #[arg(long, conflicts_with = "from")]
        pool: Option<String>,
        /// Existing volume (VG/LV) to turn into the first base.
        #[arg(long)]
        from: Option<String>,
    },
    /// Create and query bases.
    #[command(subcommand)]
    Base(BaseCommand),
    /// Create and query layers.
    #[command(subcommand)]
    Layer(LayerCommand),
    /// Show live attributes and chain state of one image.
    Inspect {
        /// Image name, e.g. Image-1.2 or HostVG/Image-1.2.
        image: String,
    },
    /// Show unused thinpool capacity.
    FreeSpace {
        /// Unit: b, s, k, m, g or t.
        #[arg(long, default_value = "m")]
        units: String,
    },
    /// Check that bases are read-only and unchanged since they were sealed.
    Verify {
        /// Base to check; the latest one when omitted.
        base: Option<String>,
        /// Check every base.
        #[arg(long, conflicts_with = "base")]
        all: bool,
    },
    /// Show or change configuration.
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum BaseCommand {
    /// Create, lock and seal a new base.
    Add {
        /// Size of the new base, e.g. 4G.
        #[arg(long)]
        size: String,
        /// Version of the new base instead of the next free one.
        #[arg(long, conflicts_with = "dated")]
        version: Option<u64>,
        /// Use today's date (YYYYMMDD) as the version.
        #[arg(long, default_value_t = false)]
        dated: bool,
        /// Filesystem image written onto the base before it is locked; `-`
        /// reads it from standard input.
        #[arg(long)]
        from_image: Option<PathBuf>,
    },
    /// List all bases.
    List,
    /// Show the latest base.
    Latest,
    /// Show the base a layer descends from.
    OfLayer {
        /// Layer name.
        layer: String,
    },
}

#[derive(Debug, Subcommand)]
enum LayerCommand {
    /// Snapshot the latest layer into a new bootable layer.
    Add,
    /// List all layers.
    List,
    /// Show the latest layer of the latest base.
    Latest,
    /// Show the layer mounted at /.
    Current,
}

impl Commands {
    fn is_mutating(&self) -> bool {
        matches!(
            self,
            Commands::Init { .. }
                | Commands::Base(BaseCommand::Add { .. })
                | Commands::Layer(LayerCommand::Add)
        )
    }
}

fn run_with_engine(
    command: Commands,
    configuration: &Configuration,
    overrides: &SchemeOverrides,
    dry: bool,
    json: bool,
) -> Result<u8, String> {
    let settings = Settings::load(configuration, overrides)?;

    if command.is_mutating() && !dry && std::env::var("STRATUM_SKIP_PREREQS").as_deref() != Ok("1")
    {
        let missing = check_prereqs();
        if !missing.is_empty() {
            return Err(format_missing(&missing));
        }
    }

    let host = Host::system(dry, &settings.entries_dir);
    let engine = Engine::new(settings.engine_config(), host).map_err(config_err)?;

    match command {
        Commands::Layout => commands::layout::run(&engine, json),
        Commands::Init {
            size,
            pvs,
            pool,
            from,
        } => commands::init::run(
            &engine,
            configuration,
            &commands::init::InitArgs {
                size: size.as_deref(),
                pvs: &pvs,
                pool: pool.as_deref(),
                from: from.as_deref(),
            },
            json,
        ),
        Commands::Base(BaseCommand::Add {
            size,
            version,
            dated,
            from_image,
        }) => commands::base::add(
            &engine,
            &size,
            version,
            dated,
            from_image.as_deref(),
            json,
        ),
        Commands::Base(BaseCommand::List) => commands::base::list(&engine, json),
        Commands::Base(BaseCommand::Latest) => commands::base::latest(&engine, json),
        Commands::Base(BaseCommand::OfLayer { layer }) => {
            commands::base::of_layer(&engine, &layer, json)
        }
        Commands::Layer(LayerCommand::Add) => commands::layer::add(&engine, json),
        Commands::Layer(LayerCommand::List) => commands::layer::list(&engine, json),
        Commands::Layer(LayerCommand::Latest) => commands::layer::latest(&engine, json),
        Commands::Layer(LayerCommand::Current) => commands::layer::current(&engine, json),
        Commands::Inspect { image } => commands::inspect::run(&engine, &image, json),
        Commands::FreeSpace { units } => commands::free_space::run(&engine, &units, json),
        Commands::Verify { base, all } => {
            commands::verify::run(&engine, base.as_deref(), all, json)
        }
        Commands::Config { .. } | Commands::Completions { .. } | Commands::ManPages { .. } => {
            Err("command does not use the engine".to_owned())
        }
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STRATUM_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let configuration = match &cli.config {
        Some(path) => Configuration::file(path),
        None => Configuration::system(),
    };
    let json = cli.json;

    let result = match cli.command {
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
        Commands::Config { action } => commands::config::run(
            &configuration,
            action.unwrap_or(ConfigAction::Show),
            &cli.scheme,
            cli.dry,
            json,
        ),
        command => run_with_engine(command, &configuration, &cli.scheme, cli.dry, json),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("config error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("host error:") || msg.starts_with("host lock:") {
                EXIT_HOST_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
