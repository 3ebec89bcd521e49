#![deny(rust_2018_idioms)]

use bootslot::CgptClient;
use log::{info, LevelFilter};
use nix::sys::stat::{umask, Mode};
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};
use snafu::{ErrorCompat, ResultExt};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use update_engine::attempter::UpdateAttempter;
use update_engine::config::Config;
use update_engine::error::{self, Result};
use update_engine::postinstall::MountedPostinstall;
use update_engine::scheduler::{EngineRequest, UpdateCheckScheduler};
use update_engine::status::LogObserver;
use update_engine::system_state::SystemState;
use update_engine::terminator::Terminator;

/// Boot flags are committed this long after startup, once the boot has had
/// a chance to prove itself.
const BOOT_FLAGS_DELAY: Duration = Duration::from_secs(45);

struct Arguments {
    log_level: LevelFilter,
    config_path: Option<PathBuf>,
}

/// Prints a more specific message before exiting through usage().
fn usage_msg<S: AsRef<str>>(msg: S) -> ! {
    eprintln!("{}\n", msg.as_ref());
    usage();
}

fn usage() -> ! {
    eprintln!(
        "\
USAGE:
    update_engine [OPTIONS]

OPTIONS:
    [ --config path ]             Read configuration from `path` instead of
                                  /etc/update_engine.toml
    [ --log-level trace|debug|info|warn|error ]  Set logging verbosity"
    );
    std::process::exit(1)
}

fn parse_args(args: std::env::Args) -> Arguments {
    let mut log_level = None;
    let mut config_path = None;

    let mut iter = args.skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_ref() {
            "--log-level" => {
                let log_level_str = iter
                    .next()
                    .unwrap_or_else(|| usage_msg("Did not give argument to --log-level"));
                log_level = Some(LevelFilter::from_str(&log_level_str).unwrap_or_else(|_| {
                    usage_msg(format!("Invalid log level '{}'", log_level_str))
                }));
            }
            "--config" => {
                config_path = Some(PathBuf::from(iter.next().unwrap_or_else(|| {
                    usage_msg("Did not give argument to --config")
                })));
            }
            _ => usage(),
        }
    }

    Arguments {
        log_level: log_level.unwrap_or(LevelFilter::Info),
        config_path,
    }
}

fn load_config(arguments: &Arguments) -> Result<Config> {
    match &arguments.config_path {
        Some(path) => Config::load_from(path),
        None => match Config::load() {
            Ok(config) => Ok(config),
            Err(error::Error::ConfigRead { ref source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                info!("No configuration file, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(e),
        },
    }
}

fn main_inner() -> Result<()> {
    let arguments = parse_args(std::env::args());

    // TerminalMode::Mixed will send errors to stderr and anything less to stdout.
    TermLogger::init(
        arguments.log_level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context(error::LoggerSnafu)?;

    // Ensure that all written files have safe permissions. This is a mask,
    // so we _block_ execute for the owner, and ALL permissions for other
    // users.
    umask(Mode::from_bits_truncate(0o177));

    info!("Flatcar Update Engine starting");

    let config = load_config(&arguments)?;
    let postinstall_timeout = Duration::from_secs(config.postinstall_timeout_secs);
    let scheduler = UpdateCheckScheduler::from_config(&config);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context(error::RuntimeSnafu)?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(async move {
        let (terminator, termination_wake) = Terminator::init()?;
        let system = SystemState::initialize(config)?;
        let attempter = Rc::new(RefCell::new(UpdateAttempter::new(
            system,
            Rc::new(CgptClient::new()),
            Rc::new(MountedPostinstall::new(postinstall_timeout)),
            terminator.clone(),
        )));
        attempter.borrow_mut().add_observer(Box::new(LogObserver));
        // Broadcast the status on startup to ensure consistent system
        // state after crashes.
        attempter.borrow().broadcast_status();

        let flags_attempter = Rc::clone(&attempter);
        tokio::task::spawn_local(async move {
            tokio::time::sleep(BOOT_FLAGS_DELAY).await;
            flags_attempter.borrow_mut().update_boot_flags();
        });

        // The bounded request channel is the seam the system-bus service
        // plugs into; the engine holds the sender until that service takes
        // over.
        let (_bus_handle, requests) = mpsc::channel::<EngineRequest>(16);

        scheduler
            .run(attempter, requests, terminator, termination_wake)
            .await;
        info!("Flatcar Update Engine terminating");
        Ok(())
    }))
}

fn main() -> ! {
    std::process::exit(match main_inner() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{}", err);
            if let Some(var) = std::env::var_os("RUST_BACKTRACE") {
                if var != "0" {
                    if let Some(backtrace) = ErrorCompat::backtrace(&err) {
                        eprintln!("\n{:?}", backtrace);
                    }
                }
            }
            1
        }
    })
}
