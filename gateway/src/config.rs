use anyhow::bail;
use clap::Parser;
use std::num::NonZeroUsize;
use workrelay::{PoolConfig, DEFAULT_POOL_SIZE};

use crate::logging::LogFormat;

/// Runtime configuration for the `workrelay-gateway` binary.
///
/// All values are parsed from CLI arguments or environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "workrelay-gateway",
    version,
    about = "Relays HTTP messages to a round-robin worker pool"
)]
pub struct CliArgs {
    /// Number of workers in the pool.
    ///
    /// Environment variable: `WORKRELAY_WORKERS`
    #[arg(long, env = "WORKRELAY_WORKERS", default_value_t = DEFAULT_POOL_SIZE.get())]
    pub workers: usize,

    /// Host address to bind to.
    ///
    /// Environment variable: `WORKRELAY_HOST`
    #[arg(long, env = "WORKRELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    ///
    /// Environment variable: `WORKRELAY_PORT`
    #[arg(short, long, env = "WORKRELAY_PORT", default_value_t = 3000)]
    pub port: u16,

    /// `KEY=VALUE` pairs exposed to every worker. May be repeated or comma
    /// separated.
    ///
    /// Environment variable: `WORKRELAY_WORKER_ENV`
    #[arg(
        long = "worker-env",
        env = "WORKRELAY_WORKER_ENV",
        value_parser = parse_key_value,
        value_delimiter = ',',
        default_value = "foo=bar"
    )]
    pub worker_env: Vec<(String, String)>,

    /// Log output format.
    ///
    /// Environment variable: `WORKRELAY_LOG_FORMAT`
    #[arg(long, env = "WORKRELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub pool: PoolConfig,
}

impl TryFrom<CliArgs> for GatewayConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let Some(size) = NonZeroUsize::new(args.workers) else {
            bail!("WORKRELAY_WORKERS must be greater than 0");
        };

        let pool = args
            .worker_env
            .into_iter()
            .fold(PoolConfig::new(size), |pool, (key, value)| {
                pool.with_env(key, value)
            });

        Ok(Self {
            host: args.host,
            port: args.port,
            log_format: args.log_format,
            pool,
        })
    }
}
