use a2s_cache::cli::{exit_code, Cli};
use a2s_cache::config::ServerConfig;
use a2s_cache::{Config, Proxy};
use anyhow::{anyhow, Result};
use clap::error::ErrorKind;
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(exit_code::USAGE),
            };
        }
    };

    let endpoints = match cli.endpoints() {
        Ok(endpoints) => endpoints,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    // 加载配置，命令行地址优先
    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{:#}", e);
                return ExitCode::from(exit_code::CONFIG_ERROR);
            }
        },
        None => Config::default(),
    };
    config.server.listen_addr = endpoints.listen_addr;
    config.server.backend_addr = endpoints.backend_addr;

    // 初始化日志系统
    let _log_guard = match init_logging(&config.server) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::from(exit_code::CONFIG_ERROR);
        }
    };

    info!("Starting a2s-cache...");

    let proxy = match Proxy::bind(config).await {
        Ok(proxy) => proxy,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(exit_code::BIND_FAILED);
        }
    };

    tokio::select! {
        result = proxy.run() => {
            if let Err(e) = result {
                error!("Proxy stopped: {:#}", e);
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
        }
    }

    ExitCode::SUCCESS
}

/// 初始化日志系统
///
/// 配置了 `log_file` 时返回的 guard 需要一直持有，否则缓冲的日志会丢失。
fn init_logging(server: &ServerConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&server.log_level));

    let (writer, guard) = match &server.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow!("Invalid log file path: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if server.log_format == "json" {
        registry
            .with(fmt::layer().json().with_writer(writer))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_writer(writer),
            )
            .init();
    }

    Ok(guard)
}
