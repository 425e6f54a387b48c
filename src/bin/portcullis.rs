use anyhow::Result;
use portcullis::cli::{actions, actions::Action, start};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse arguments and initialize telemetry
    let action = start()?;

    // Handle the action; a failed drain or startup surfaces here as a
    // non-zero exit status
    match action {
        Action::Server { .. } => actions::server::handle(action).await?,
    }

    Ok(())
}
