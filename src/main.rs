use toolgate::{cli, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (config, opts) = cli::load()?;
    Server::new(config, opts).start().await?;
    Ok(())
}
