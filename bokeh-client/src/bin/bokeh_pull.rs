//! Pull a session from a running Bokeh server and print its document.
//!
//! Usage: `bokeh-pull <url> [session-id]`

use std::process::ExitCode;
use std::sync::Arc;

use bokeh_client::{pull_session, ClientConfig};
use bokeh_core::ModelRegistry;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(url) = args.next() else {
        eprintln!("usage: bokeh-pull <url> [session-id]");
        return ExitCode::from(2);
    };
    let config = ClientConfig {
        url,
        session_id: args.next(),
        ..ClientConfig::default()
    };

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &ClientConfig) -> bokeh_client::Result<()> {
    let registry = Arc::new(ModelRegistry::with_builtins());
    let (session, _messages) = pull_session(config, registry).await?;
    let document = session.document();
    log::info!(
        "Pulled '{}' with {} roots",
        document.title(),
        document.roots().len()
    );
    println!("{}", document.to_json_string(true)?);

    let info = session.request_server_info().await?;
    log::info!("Server info: {info}");
    session.close();
    Ok(())
}
