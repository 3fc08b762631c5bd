use clap::Parser;
use scanbridge::config::{AppConfig, CliArgs};
use scanbridge::engine;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let conf = match AppConfig::from_env(cli) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("[Main] invalid configuration: {e:#}");
            std::process::exit(engine::EXIT_CONFIG_OR_STORAGE);
        }
    };

    if let Err(e) = utilities::init_logging(conf.log_level, conf.log_file.as_deref()) {
        eprintln!("[Main] failed to initialize logging: {e:#}");
        std::process::exit(engine::EXIT_CONFIG_OR_STORAGE);
    }
    conf.debug_dump();

    let code = engine::run(conf).await;
    std::process::exit(code);
}
