//! CLI helper for minting an upload token without going through the HTTP
//! surface — useful for bootstrapping a new site or for ops debugging.

use clap::Parser;

use privhouse::clock::SystemClock;
use privhouse::store::PgStore;
use privhouse::{token, Config};

#[derive(Parser)]
struct Args {
    #[arg(long)]
    site_id: String,
    #[arg(long)]
    allowed_origin: String,
    #[arg(long, default_value_t = 1.0)]
    sampling_rate: f64,
    #[arg(long)]
    epsilon_budget: Option<f64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;
    let store = PgStore::connect(&config.database_url, config.database_max_connections).await?;
    store.ensure_schema().await?;

    let (tok, id) = token::issue_token(
        &store,
        &SystemClock,
        &config.upload_token_secret,
        &args.site_id,
        &args.allowed_origin,
        args.sampling_rate,
        args.epsilon_budget,
        config.upload_token_ttl_seconds,
    )
    .await?;

    println!("token_id: {id}");
    println!("token: {tok}");
    Ok(())
}
