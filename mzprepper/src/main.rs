use std::io;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mzprepper::{MzPrepper, MzPrepperError};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn init_logging(args: &MzPrepper) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let stderr_layer = fmt::layer().compact().with_writer(io::stderr).with_filter(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .from_env_lossy(),
    );

    let (file_layer, guard) = if let Some(log_file) = &args.log_file {
        let writer = tracing_appender::rolling::never(
            log_file.parent().unwrap_or_else(|| std::path::Path::new(".")),
            log_file
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("mzprepper.log")),
        );
        let (writer, guard) = tracing_appender::non_blocking(writer);
        let layer = fmt::layer()
            .compact()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(
                EnvFilter::builder()
                    .with_default_directive(tracing::Level::DEBUG.into())
                    .from_env_lossy(),
            );
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    // mzdata logs through `log`, route it into tracing
    tracing_log::LogTracer::init().ok();
    guard
}

fn main() -> Result<(), MzPrepperError> {
    let cli = MzPrepper::parse();
    let _log_guard = init_logging(&cli);

    let mut config = Figment::new()
        .merge(Serialized::defaults(&cli))
        .merge(Toml::file("mzprepper.toml"));
    if let Some(params_file) = &cli.params_file {
        debug!("Reading parameters from {}", params_file.display());
        config = config.merge(Toml::file_exact(params_file));
    }
    config = config.merge(Env::prefixed("MZPREPPER_").split("__"));

    let mut args: MzPrepper = config.extract()?;
    // Values typed on the command line beat the file and env layers
    args.apply_cli_overrides(cli);
    if let Err(e) = args.main() {
        tracing::error!("{e}");
        return Err(e);
    }
    Ok(())
}
