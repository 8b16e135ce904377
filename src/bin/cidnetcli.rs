/*!
# cidnet Command Line Interface

One-shot operations against the local client and its servers.

## Usage

```bash
cidnetcli help [subcommand]
```

## Available subcommands

**print**

prints the identity and actor id of the key file

**note**

publishes a note to your followers

**follow** / **unfollow**

changes the follow set, e.g.

```bash
cidnetcli follow --actor did:key:zQ3sh.../actor
```

**listen**

asks one server to deliver your inbox

**delete**

deletes a message or document

**add-server**

registers a server

## Dev

```bash
cargo run --bin cidnetcli -- note --text "hello"
```
*/
use clap::{App, Arg, ArgMatches, SubCommand};
use std::path::PathBuf;
use std::sync::Arc;

use cidnet::client::Client;
use cidnet::config::Settings;
use cidnet::crypto::{Secp256k1Verifier, Verifier};
use cidnet::http::ReqwestClient;
use cidnet::keypair::Keypair;
use cidnet::local_index::LocalIndex;
use cidnet::object::actor_id_for;
use cidnet::registry::Registry;
use cidnet::storage::FileStore;

fn settings(matches: &ArgMatches) -> cidnet::Result<Settings> {
    let mut settings = Settings::load(matches.value_of("config").unwrap_or("config"))?;
    if let Some(key_path) = matches.value_of("key_path") {
        settings.key_path = PathBuf::from(key_path);
    }
    Ok(settings)
}

async fn open_client(settings: &Settings) -> cidnet::Result<Client> {
    let keypair = Keypair::load_or_create(&settings.key_path)?;
    let store = Arc::new(FileStore::open(&settings.store_path())?);
    let index = Arc::new(LocalIndex::open(store.clone()).await?);
    let http = Arc::new(ReqwestClient::new(settings.request_timeout())?);
    let verifier: Arc<dyn Verifier> = Arc::new(Secp256k1Verifier);
    let registry = Registry::load(http, store)
        .await?
        .with_verifier(verifier.clone());
    for server in &settings.servers {
        registry.add_server(&server.url, &server.identity).await?;
    }
    Client::open(
        keypair,
        verifier,
        Arc::new(registry),
        index,
        settings.page_size,
    )
    .await
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> cidnet::Result<&'a str> {
    matches
        .value_of(name)
        .ok_or_else(|| cidnet::Error::malformed("arguments", format!("missing --{}", name)))
}

#[tokio::main]
pub async fn main() -> cidnet::Result<()> {
    let actor_arg = || {
        Arg::with_name("actor")
            .short("a")
            .long("actor")
            .takes_value(true)
            .required(true)
            .help("actor id")
    };
    let command_matches = App::new("cidnet Command Line Interface")
        .about("Publish, follow and manage servers from the command line")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .global(true)
                .help("config file name"),
        )
        .arg(
            Arg::with_name("key_path")
                .short("k")
                .long("key_path")
                .takes_value(true)
                .global(true)
                .help("path to the key file"),
        )
        .subcommand(SubCommand::with_name("print").about("prints the identity"))
        .subcommand(
            SubCommand::with_name("note")
                .about("publishes a note to your followers")
                .arg(
                    Arg::with_name("text")
                        .short("t")
                        .long("text")
                        .takes_value(true)
                        .required(true)
                        .help("note content"),
                ),
        )
        .subcommand(
            SubCommand::with_name("follow")
                .about("follows an actor")
                .arg(actor_arg()),
        )
        .subcommand(
            SubCommand::with_name("unfollow")
                .about("unfollows an actor")
                .arg(actor_arg()),
        )
        .subcommand(
            SubCommand::with_name("listen")
                .about("asks a server to deliver your inbox")
                .arg(
                    Arg::with_name("server")
                        .short("s")
                        .long("server")
                        .takes_value(true)
                        .required(true)
                        .help("server url"),
                ),
        )
        .subcommand(
            SubCommand::with_name("delete")
                .about("deletes a message or document")
                .arg(
                    Arg::with_name("id")
                        .long("id")
                        .takes_value(true)
                        .required(true)
                        .help("object id"),
                ),
        )
        .subcommand(
            SubCommand::with_name("add-server")
                .about("registers a server")
                .arg(
                    Arg::with_name("server")
                        .short("s")
                        .long("server")
                        .takes_value(true)
                        .required(true)
                        .help("server url"),
                )
                .arg(
                    Arg::with_name("identity")
                        .short("i")
                        .long("identity")
                        .takes_value(true)
                        .required(true)
                        .help("server identity"),
                ),
        )
        .get_matches();

    let settings = settings(&command_matches)?;

    match command_matches.subcommand() {
        ("print", Some(_)) => {
            let keypair = Keypair::load_or_create(&settings.key_path)?;
            println!("identity : {}", keypair.identity());
            println!("actor    : {}", actor_id_for(&keypair.identity()));
        }
        ("note", Some(matches)) => {
            let client = open_client(&settings).await?;
            let message = client.note(required(matches, "text")?, None).await?;
            println!("{}", serde_json::to_string_pretty(&message)?);
        }
        ("follow", Some(matches)) => {
            let client = open_client(&settings).await?;
            let message = client.follow(required(matches, "actor")?).await?;
            println!("{}", message.id);
        }
        ("unfollow", Some(matches)) => {
            let client = open_client(&settings).await?;
            let message = client.unfollow(required(matches, "actor")?).await?;
            println!("{}", message.id);
        }
        ("listen", Some(matches)) => {
            let client = open_client(&settings).await?;
            let message = client.listen(required(matches, "server")?).await?;
            println!("{}", message.id);
        }
        ("delete", Some(matches)) => {
            let client = open_client(&settings).await?;
            match client.delete(required(matches, "id")?).await? {
                Some(message) => println!("{}", message.id),
                None => println!("deleted locally"),
            }
        }
        ("add-server", Some(matches)) => {
            let client = open_client(&settings).await?;
            client
                .registry()
                .add_server(required(matches, "server")?, required(matches, "identity")?)
                .await?;
            for server in client.registry().servers().await {
                println!("{} {}", server.url, server.identity);
            }
        }
        _ => println!("{}", command_matches.usage()),
    }
    Ok(())
}
