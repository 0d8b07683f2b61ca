/*
 * skiff is the skiff consensus server. It takes configuration via a
 * configuration file, command-line parameters, and environment variables,
 * then starts up a TCP server that communicates with session clients (port
 * 9605) and cluster peers (port 9705).
 */

#![warn(clippy::all)]

use serde_derive::Deserialize;
use skiff::error::Result;
use skiff::raft::{self, Member, MemberType};
use skiff::session::{Driver, Registry};
use skiff::storage;
use skiff::{errinput, Server};

use std::collections::HashMap;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/skiff.yaml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("skiff");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let store: Box<dyn storage::log::Store> = match cfg.storage.as_str() {
        "memory" | "" => Box::new(storage::log::Memory::new()),
        name => return errinput!("invalid log storage engine {name}"),
    };
    let log = raft::Log::new(store)?;

    let mut registry = Registry::new();
    registry.register("kv", || Box::new(kv::Store::new()));
    let state = registry.build(&cfg.state_machine).ok_or_else(|| {
        skiff::Error::InvalidInput(format!("unknown state machine {}", cfg.state_machine))
    })?;
    let driver = Driver::new(state);

    let members = cfg
        .members
        .into_iter()
        .map(|(id, member)| {
            Ok(Member {
                id,
                address: member.address,
                client_address: member.client_address,
                member_type: match member.member_type.as_str() {
                    "active" | "" => MemberType::Active,
                    "passive" => MemberType::Passive,
                    "reserve" => MemberType::Reserve,
                    "inactive" => MemberType::Inactive,
                    name => return errinput!("invalid member type {name}"),
                },
            })
        })
        .collect::<Result<Vec<Member>>>()?;

    let server = Server::new(cfg.id, members, log, driver)?;
    let peer_listener = std::net::TcpListener::bind(&cfg.listen_peer)?;
    let client_listener = std::net::TcpListener::bind(&cfg.listen_client)?;
    server.serve(peer_listener, client_listener)
}

#[derive(Debug, Deserialize)]
struct Config {
    id: raft::NodeID,
    members: HashMap<raft::NodeID, MemberConfig>,
    listen_client: String,
    listen_peer: String,
    log_level: String,
    storage: String,
    state_machine: String,
}

#[derive(Debug, Deserialize)]
struct MemberConfig {
    address: String,
    client_address: String,
    #[serde(default)]
    member_type: String,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("id", "1")?
            .set_default("listen_client", "0.0.0.0:9605")?
            .set_default("listen_peer", "0.0.0.0:9705")?
            .set_default("log_level", "info")?
            .set_default("storage", "memory")?
            .set_default("state_machine", "kv")?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("SKIFF"))
            .build()?
            .try_deserialize()?)
    }
}

/// A simple replicated key/value state machine, as the stock state machine
/// shipped with the server binary.
mod kv {
    use skiff::encoding::bincode;
    use skiff::error::Result;
    use skiff::{ApplyContext, StateMachine};

    use serde_derive::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    /// Key/value commands. Writes go through consensus; reads are queries.
    #[derive(Serialize, Deserialize)]
    pub enum Command {
        /// Sets a key to a value, returning the previous value.
        Set { key: String, value: Vec<u8> },
        /// Deletes a key, returning the previous value.
        Delete { key: String },
        /// Sets a key and publishes the new value as an event to the
        /// submitting session.
        SetNotify { key: String, value: Vec<u8> },
    }

    /// Key/value queries.
    #[derive(Serialize, Deserialize)]
    pub enum Query {
        /// Fetches a key's value.
        Get { key: String },
    }

    #[derive(Default)]
    pub struct Store {
        data: BTreeMap<String, Vec<u8>>,
    }

    impl Store {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl StateMachine for Store {
        fn apply(&mut self, ctx: &mut ApplyContext, command: &[u8]) -> Result<Vec<u8>> {
            match bincode::deserialize(command)? {
                Command::Set { key, value } => {
                    Ok(self.data.insert(key, value).unwrap_or_default())
                }
                Command::Delete { key } => Ok(self.data.remove(&key).unwrap_or_default()),
                Command::SetNotify { key, value } => {
                    ctx.publish(value.clone());
                    Ok(self.data.insert(key, value).unwrap_or_default())
                }
            }
        }

        fn query(&self, query: &[u8]) -> Result<Vec<u8>> {
            match bincode::deserialize(query)? {
                Query::Get { key } => self
                    .data
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| skiff::Error::InvalidInput(format!("unknown key {key}"))),
            }
        }

        fn snapshot(&self) -> Result<Vec<u8>> {
            bincode::serialize(&self.data)
        }

        fn restore(&mut self, data: &[u8]) -> Result<()> {
            self.data = bincode::deserialize(data)?;
            Ok(())
        }
    }
}
