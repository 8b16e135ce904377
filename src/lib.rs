/*!
# cidnet

A client for a federated social network built on content addressed,
signed objects. Notes and tags are immutable documents named by the digest
of their content. Activities (create, follow, view, ...) are messages signed
by an actor's secp256k1 key and then content addressed themselves, so any
server can relay them and any client can check them.

The client keeps its own index of what it has seen, merges that with what
the servers hold, and garbage collects documents nothing references anymore.

# Layout

* [`object`]: actors, documents, messages and how they are signed and verified
* [`registry`]: the servers, fan-out writes and affinity ranked reads
* [`iterator`]: merging paginated collections from many servers
* [`local_index`]: the local log, object store and garbage collector
* [`client`]: the operations a user performs

# Usage

```bash
cidnet --config config --key_path keyfile
cidnetcli note --text "hello"
```
*/
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod http;
pub mod iterator;
pub mod keypair;
pub mod local_index;
pub mod object;
pub mod registry;
pub mod storage;
pub mod time;

pub use error::{Error, Result};

#[cfg(test)]
mod test_setup;

#[cfg(test)]
pub mod test_utilities;
