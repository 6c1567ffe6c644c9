//! Line commands on stdin, turned into node `Command`s.
//!
//! ```text
//! peers | status | share <path> | fetch <hash> | cancel <hash>
//! msg <peer> <text> | trust <peer> | revoke-self | connect <addr>
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use archipel_core::{short_id, NodeId};
use archipeld::{Command, Node, TransferStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    Peers,
    Status,
    Share(PathBuf),
    Fetch([u8; 32]),
    Cancel([u8; 32]),
    Message(NodeId, String),
    Trust(NodeId),
    RevokeSelf,
    Connect(SocketAddr),
}

pub fn parse(line: &str) -> Result<Option<Line>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let parsed = match verb {
        "peers" => Line::Peers,
        "status" => Line::Status,
        "share" if !rest.is_empty() => Line::Share(PathBuf::from(rest)),
        "fetch" => Line::Fetch(hex32(rest)?),
        "cancel" => Line::Cancel(hex32(rest)?),
        "msg" => {
            let (peer, text) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow!("usage: msg <peer> <text>"))?;
            Line::Message(hex32(peer)?, text.trim().to_string())
        }
        "trust" => Line::Trust(hex32(rest)?),
        "revoke-self" => Line::RevokeSelf,
        "connect" => Line::Connect(rest.parse().with_context(|| format!("bad address {rest:?}"))?),
        other => bail!("unknown command {other:?}"),
    };
    Ok(Some(parsed))
}

fn hex32(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s.trim()).with_context(|| format!("bad hex {s:?}"))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| anyhow!("expected 32 bytes, got {}", v.len()))
}

/// Read stdin until EOF, running each line.
pub async fn run(node: Node, commands: mpsc::Sender<Command>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                return;
            }
        };
        let result = match parse(&line) {
            Ok(Some(parsed)) => execute(&node, &commands, parsed).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            eprintln!("error: {e:#}");
        }
    }
}

async fn execute(node: &Node, commands: &mpsc::Sender<Command>, line: Line) -> Result<()> {
    match line {
        Line::Peers => {
            for peer in ask(commands, |reply| Command::ListPeers { reply }).await? {
                println!(
                    "{}  {:<21}  {:?}  rtt={:?}",
                    hex::encode(peer.identity),
                    peer.addr,
                    peer.state,
                    peer.rtt
                );
            }
        }
        Line::Status => {
            let status = ask(commands, |reply| Command::Status { reply }).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Line::Share(path) => {
            let manifest = ask(commands, |reply| Command::ShareFile { path, reply }).await??;
            println!(
                "shared {} ({} bytes, {} chunks)",
                hex::encode(manifest.content_hash),
                manifest.total_size,
                manifest.chunk_count()
            );
        }
        Line::Fetch(content_hash) => {
            let handle = ask(commands, |reply| Command::Fetch {
                content_hash,
                reply,
            })
            .await?;
            tokio::spawn(async move {
                match handle.wait().await {
                    Ok(path) => println!("fetched {} → {}", short_id(&content_hash), path.display()),
                    Err(e) => println!("fetch {} failed: {e}", short_id(&content_hash)),
                }
            });
        }
        Line::Cancel(content_hash) => {
            let cancelled = ask(commands, |reply| Command::Cancel {
                content_hash,
                reply,
            })
            .await?;
            if !cancelled {
                println!("no active transfer {}", short_id(&content_hash));
            }
        }
        Line::Message(peer, text) => {
            ask(commands, |reply| Command::SendMessage { peer, text, reply }).await??;
        }
        Line::Trust(peer) => {
            let state = ask(commands, |reply| Command::Promote { peer, reply }).await??;
            println!("{} is {state:?}", short_id(&peer));
        }
        Line::RevokeSelf => {
            ask(commands, |reply| Command::RevokeSelf { reply }).await??;
            println!("identity revoked; generate a new one before restarting");
        }
        Line::Connect(addr) => {
            let peer = node.connect(addr).await?;
            println!("connected to {}", hex::encode(peer));
        }
    }
    Ok(())
}

async fn ask<T>(
    commands: &mpsc::Sender<Command>,
    build: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T> {
    let (reply, answer) = oneshot::channel();
    commands
        .send(build(reply))
        .await
        .map_err(|_| anyhow!("node is shutting down"))?;
    answer.await.context("node dropped the command")
}

/// Format a transfer status for the event log.
pub fn describe(status: &TransferStatus) -> String {
    match status {
        TransferStatus::AwaitingManifest => "awaiting manifest".into(),
        TransferStatus::Running(p) => format!("{}/{} chunks", p.verified, p.total),
        TransferStatus::Completed(path) => format!("done: {}", path.display()),
        TransferStatus::Failed(e) => format!("failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_command() {
        let id = "ab".repeat(32);
        assert_eq!(parse("peers").unwrap(), Some(Line::Peers));
        assert_eq!(parse("  ").unwrap(), None);
        assert_eq!(parse(&format!("fetch {id}")).unwrap(), Some(Line::Fetch([0xAB; 32])));
        assert_eq!(
            parse(&format!("msg {id} hello there")).unwrap(),
            Some(Line::Message([0xAB; 32], "hello there".into()))
        );
        assert_eq!(
            parse("connect 10.0.0.5:7777").unwrap(),
            Some(Line::Connect("10.0.0.5:7777".parse().unwrap()))
        );
        assert_eq!(
            parse("share /tmp/a b.txt").unwrap(),
            Some(Line::Share(PathBuf::from("/tmp/a b.txt")))
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("fetch abcd").is_err());
        assert!(parse("msg onlyone").is_err());
        assert!(parse("share").is_err());
        assert!(parse("launch").is_err());
    }
}
