//! Line-oriented operator console on stdin.

use scatter_node::FileServer;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

const HELP: &str = "\
commands:
  store <key> <data...>   store data under key and replicate to peers
  get <key>               print the data stored under key
  remove <key>            delete key here and on every peer
  remove-local <key>      delete key on this node only
  peers                   list connected peers
  help                    show this text
  quit                    stop the node";

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Store { key: String, data: String },
    Get { key: String },
    Remove { key: String },
    RemoveLocal { key: String },
    Peers,
    Help,
    Quit,
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let key = |usage: &str| -> Result<String, String> {
            match rest.split_whitespace().collect::<Vec<_>>()[..] {
                [key] => Ok(key.to_string()),
                _ => Err(format!("usage: {usage}")),
            }
        };

        match verb {
            "" => Ok(Command::Empty),
            "store" => match rest.split_once(char::is_whitespace) {
                Some((key, data)) => Ok(Command::Store {
                    key: key.to_string(),
                    data: data.trim().to_string(),
                }),
                None => Err("usage: store <key> <data...>".into()),
            },
            "get" => Ok(Command::Get {
                key: key("get <key>")?,
            }),
            "remove" | "rm" => Ok(Command::Remove {
                key: key("remove <key>")?,
            }),
            "remove-local" => Ok(Command::RemoveLocal {
                key: key("remove-local <key>")?,
            }),
            "peers" => Ok(Command::Peers),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("unknown command: {other} (try `help`)")),
        }
    }
}

/// Execute one command and return what to print.
pub async fn execute(server: &FileServer, cmd: Command) -> String {
    match cmd {
        Command::Store { key, data } => match server.store(&key, &mut data.as_bytes()).await {
            Ok(n) => format!("stored {key} ({n} bytes)"),
            Err(e) => format!("failed to store {key}: {e}"),
        },
        Command::Get { key } => match server.get(&key).await {
            Ok(data) => String::from_utf8_lossy(&data).into_owned(),
            Err(e) => format!("failed to get {key}: {e}"),
        },
        Command::Remove { key } => match server.remove(&key).await {
            Ok(()) => format!("removed {key} everywhere"),
            Err(e) => format!("failed to remove {key}: {e}"),
        },
        Command::RemoveLocal { key } => match server.remove_local(&key).await {
            Ok(()) => format!("removed {key} locally"),
            Err(e) => format!("failed to remove {key}: {e}"),
        },
        Command::Peers => {
            let peers = server.peers();
            if peers.is_empty() {
                "no peers".to_string()
            } else {
                peers
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        Command::Help => HELP.to_string(),
        Command::Quit | Command::Empty => String::new(),
    }
}

/// Read commands until `quit` (returns true) or end of input (false).
pub async fn run(server: Arc<FileServer>) -> bool {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("scatter node {}. {HELP}", server.addr());

    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return false,
            Err(e) => {
                warn!("console read failed: {e}");
                return false;
            }
        };

        match Command::parse(&line) {
            Ok(Command::Quit) => return true,
            Ok(Command::Empty) => {}
            Ok(cmd) => println!("{}", execute(&server, cmd).await),
            Err(msg) => println!("{msg}"),
        }
    }
}
