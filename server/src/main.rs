#[tokio::main]
async fn main() -> anyhow::Result<()> {
    zeteo_server_lib::run().await
}
