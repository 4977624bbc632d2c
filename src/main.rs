use std::env;

use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: parkgate serve --config <path> [--log-json]";

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parkgate=info,parkgate_server=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    let mut log_json = false;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(v) => config_path = v,
                None => {
                    eprintln!("{USAGE}");
                    std::process::exit(2);
                }
            },
            "--log-json" => log_json = true,
            other => {
                eprintln!("unknown argument: {other}\n{USAGE}");
                std::process::exit(2);
            }
        }
    }

    let cfg = match parkgate_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(log_json);
    tracing::info!(config = %config_path, "starting parkgate");

    if let Err(e) = parkgate_server::serve(cfg).await {
        eprintln!("server exited with error: {e}");
        std::process::exit(1);
    }
}
