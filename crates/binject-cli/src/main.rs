//! Command-line interface for binject.
//!
//! Injects and ejects dylibs, frameworks and bundles in an installed
//! application bundle.

use binject::{AppBundle, EjectionError, Injector, InjectorConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "binject")]
#[command(about = "Plug-in injector for iOS app bundles")]
struct Cli {
    /// Application bundle (.app directory)
    #[arg(short, long)]
    app: PathBuf,

    /// Directory for plug-in backups
    #[arg(long, env = "BINJECT_BACKUPS_DIR")]
    backups_dir: Option<PathBuf>,

    /// Directory for per-app diagnostic logs
    #[arg(long, env = "BINJECT_LOGS_DIR")]
    logs_dir: Option<PathBuf>,

    /// Additional plug-in file names to skip
    #[arg(long = "ignore", value_name = "NAME")]
    ignored: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inject dylibs, frameworks, bundles, zips or .deb packages
    Inject {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Eject plug-ins (absolute or relative to the bundle root)
    Eject {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Eject every injected plug-in
    EjectAll,
    /// List injected plug-ins
    List,
    /// Pin the app so it is not replaced by updates
    Detach,
    /// Allow updates again
    Attach,
    /// Show injection state of the app
    Status,
    /// Re-inject the newest backup
    Restore,
    /// Zip the injected plug-ins
    Export { dest: PathBuf },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    let mut config = InjectorConfig::new();
    if let Some(dir) = cli.backups_dir {
        config = config.backups_dir(dir);
    }
    if let Some(dir) = cli.logs_dir {
        config = config.logs_dir(dir);
    }
    for name in cli.ignored {
        config = config.ignore_name(name);
    }

    let app = AppBundle::from_bundle_root(&cli.app)?;
    let injector = Injector::new(app, config);

    match cli.command {
        Command::Inject { paths } => {
            let log = injector.inject(&paths)?;
            println!("Injected into {}", injector.app().name);
            println!("Log: {}", log.display());
        }
        Command::Eject { paths } => {
            report_ejection(injector.eject(&paths))?;
        }
        Command::EjectAll => {
            report_ejection(injector.eject_all())?;
        }
        Command::List => {
            for path in injector.list_injected_assets() {
                println!("{}", path.display());
            }
        }
        Command::Detach => {
            injector.set_detached(true)?;
            println!("Detached {}", injector.app_id());
        }
        Command::Attach => {
            injector.set_detached(false)?;
            println!("Attached {}", injector.app_id());
        }
        Command::Status => {
            let app = injector.app();
            println!("Name:       {}", app.name);
            println!("Identifier: {}", app.bundle_id);
            println!("Executable: {}", app.executable.display());
            println!("Detached:   {}", injector.is_detached());
            println!("Injected:   {}", injector.list_injected_assets().len());
            for reference in injector.foreign_load_references()? {
                println!("Foreign:    {reference}");
            }
            if let Some(log) = injector.latest_log_path() {
                println!("Log:        {}", log.display());
            }
        }
        Command::Restore => {
            let log = injector.restore_last_configuration()?;
            println!("Restored plug-ins of {}", injector.app().name);
            println!("Log: {}", log.display());
        }
        Command::Export { dest } => {
            let count = injector.export_plugins(&dest)?;
            println!("Exported {count} plug-in(s) to {}", dest.display());
        }
    }

    Ok(())
}

fn report_ejection(result: Result<(), EjectionError>) -> Result<(), EjectionError> {
    if let Err(EjectionError::Partial { failures, .. }) = &result {
        for failure in failures {
            eprintln!("  {failure}");
        }
    }
    result
}
