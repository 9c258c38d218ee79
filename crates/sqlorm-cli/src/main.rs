use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match sqlorm_cli::run(std::env::args_os()).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
