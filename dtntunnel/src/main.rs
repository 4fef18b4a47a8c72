use anyhow::Result;
use dtntunnel::{cli, config, runtime};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = <cli::Cli as clap::Parser>::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = match cli.config {
        Some(p) => p,
        None => config::default_config_path()?,
    };

    match cli.command.unwrap_or(cli::Command::Run(cli::RunArgs::default())) {
        cli::Command::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        cli::Command::InitConfig { force } => {
            let cfg = dtntunnel_core::control::TunnelConfig::default();
            config::save(&config_path, &cfg, force)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        cli::Command::Run(args) => {
            let mut cfg = config::load(&config_path)?;
            args.apply(&mut cfg);
            let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            runtime::run(cfg, stop_rx).await
        }
    }
}
