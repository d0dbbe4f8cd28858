use std::path::PathBuf;

fn main() {
    init_logging();

    let mut options = feedroll::app::RunOptions::default();
    match handle_cli_flags(&mut options) {
        Ok(true) => return,
        Ok(false) => {}
        Err(err) => {
            eprintln!("error: {err:?}");
            std::process::exit(2);
        }
    }

    if let Err(err) = feedroll::run(options) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let env = env_logger::Env::new()
        .filter_or("FEEDROLL_LOG", "warn")
        .write_style("FEEDROLL_LOG_STYLE");
    env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .init();
}

/// Returns `Ok(true)` when a flag was handled and the program should exit.
fn handle_cli_flags(options: &mut feedroll::app::RunOptions) -> anyhow::Result<bool> {
    let mut token: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("feedroll {}", feedroll::VERSION);
                return Ok(true);
            }
            "--help" | "-h" => {
                println!(
                    "feedroll — Follow your social feed from the terminal.\n\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message\n  --config <PATH>      Read configuration from PATH\n  --offline            Browse a built-in sample feed\n  --token <TOKEN>      Save an API token for later sessions and exit"
                );
                return Ok(true);
            }
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                options.config_file = Some(PathBuf::from(path));
            }
            "--offline" => options.offline = true,
            "--token" => {
                token = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("--token requires a value"))?,
                );
            }
            other => anyhow::bail!("unknown argument {other:?} (see --help)"),
        }
    }

    if let Some(token) = token {
        let path = feedroll::app::save_session_token(options.config_file.clone(), &token)?;
        println!("Saved token to {path}");
        return Ok(true);
    }
    Ok(false)
}
