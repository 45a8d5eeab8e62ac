use anyhow::Result;

mod player;

#[tokio::main]
async fn main() -> Result<()> {
    if let Some(ends) = audio_worker::spawn::am_spawned() {
        let status = audio_worker::worker::run(ends).await?;
        std::process::exit(status);
    } else {
        player::run().await?;
    }
    Ok(())
}
