use log::error;
use std::io;
use std::process;
use user_service::cli;
use user_service::config::resolve_project_root;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let parsed = match cli::parse_args() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("{}", cli::USAGE);
            process::exit(e.exit_code());
        }
    };

    let result = match resolve_project_root(parsed.root) {
        Ok(root) => cli::run(parsed.command, &root, &mut io::stdout()).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("Command failed: {:?}", e);
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}
