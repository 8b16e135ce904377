/*!
# cidnet

Opens the local client, registers the configured servers and drains the
inbox, logging every message that arrives.

## Example Usage

```bash
cidnet --config config --key_path keyfile
```

## Dev

To run from source:

```bash
RUST_LOG=cidnet=debug cargo run -- --config config
```
*/

use clap::{App, Arg};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

use cidnet::client::{Client, Ingested};
use cidnet::config::Settings;
use cidnet::crypto::{Secp256k1Verifier, Verifier};
use cidnet::http::ReqwestClient;
use cidnet::keypair::Keypair;
use cidnet::local_index::LocalIndex;
use cidnet::registry::Registry;
use cidnet::storage::FileStore;

#[tokio::main]
pub async fn main() -> cidnet::Result<()> {
    //
    // handle command-line arguments
    //
    let matches = App::new("cidnet")
        .about("Runs a cidnet client and drains its inbox")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("config file name"),
        )
        .arg(
            Arg::with_name("key_path")
                .short("k")
                .long("key_path")
                .takes_value(true)
                .help("path to the key file, created if missing"),
        )
        .get_matches();

    let mut settings = Settings::load(matches.value_of("config").unwrap_or("config"))?;
    if let Some(key_path) = matches.value_of("key_path") {
        settings.key_path = PathBuf::from(key_path);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tokio::select! {
        res = run(settings) => {
            if let Err(err) = res {
                eprintln!("{:?}", err);
            }
        },
        _ = signal::ctrl_c() => {
            println!("Shutting down!")
        }
    }

    Ok(())
}

async fn run(settings: Settings) -> cidnet::Result<()> {
    //
    // local state
    //
    let keypair = Keypair::load_or_create(&settings.key_path)?;
    let store = Arc::new(FileStore::open(&settings.store_path())?);
    let index = Arc::new(LocalIndex::open(store.clone()).await?);

    //
    // servers: the ones persisted earlier plus the ones configured
    //
    let http = Arc::new(ReqwestClient::new(settings.request_timeout())?);
    let verifier: Arc<dyn Verifier> = Arc::new(Secp256k1Verifier);
    let registry = Registry::load(http, store)
        .await?
        .with_verifier(verifier.clone());
    for server in &settings.servers {
        registry.add_server(&server.url, &server.identity).await?;
    }

    let client = Client::open(
        keypair,
        verifier,
        Arc::new(registry),
        index,
        settings.page_size,
    )
    .await?;
    event!(Level::INFO, "running as {}", client.actor_id());

    //
    // drain the inbox
    //
    let mut received = 0;
    let mut inbox = Box::pin(client.inbox().await.into_stream());
    while let Some(message) = inbox.next().await {
        received += 1;
        match client.ingest(&message, &[]).await {
            Ok(Ingested::Dropped) => {
                event!(Level::DEBUG, "{} is not for us", message.id)
            }
            Ok(outcome) => event!(
                Level::INFO,
                "{:?} {} from {}: {:?}",
                message.kind,
                message.id,
                message.actor,
                outcome
            ),
            Err(err) => event!(Level::WARN, "could not ingest {}: {}", message.id, err),
        }
    }
    event!(Level::INFO, "inbox drained, {} messages", received);
    Ok(())
}
