// tinychain-node — a single daemon process hosting one gossip node.
//
// A demo topology spawns one of these per simulated node, wiring them
// together with `--peers`; this binary itself knows nothing about the
// topology beyond the peers it is told to dial.
use colored::*;

use tinychain::config::{self, DEFAULT_BLOCK_REWARD, DEFAULT_DIFFICULTY, DEFAULT_P2P_PORT};
use tinychain::orchestrator::Node;

struct Args {
    port: u16,
    peers: Vec<(String, u16)>,
    difficulty: u32,
    auto_mine: bool,
    miner_address: String,
}

fn parse_args() -> Args {
    let mut port = config::env_u16("TINYCHAIN_PORT", DEFAULT_P2P_PORT);
    let mut difficulty = config::env_u32("TINYCHAIN_DIFFICULTY", DEFAULT_DIFFICULTY);
    let mut auto_mine = config::env_bool("TINYCHAIN_AUTO_MINE", false);
    let mut miner_address = std::env::var("TINYCHAIN_MINER_ADDRESS").unwrap_or_else(|_| format!("node-{port}"));
    let mut peers = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--port" => port = args.next().and_then(|v| v.parse().ok()).unwrap_or(port),
            "--difficulty" => difficulty = args.next().and_then(|v| v.parse().ok()).unwrap_or(difficulty),
            "--auto-mine" => auto_mine = true,
            "--miner-address" => miner_address = args.next().unwrap_or(miner_address),
            "--peers" => {
                if let Some(list) = args.next() {
                    peers = list
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .filter_map(|entry| {
                            let (host, port) = entry.rsplit_once(':')?;
                            Some((host.to_string(), port.parse().ok()?))
                        })
                        .collect();
                }
            }
            other => {
                eprintln!("{} unrecognized flag '{other}'", "[node]".yellow().bold());
            }
        }
    }

    Args { port, peers, difficulty, auto_mine, miner_address }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = parse_args();

    println!(
        "{} tinychain-node starting: port={} difficulty={} auto_mine={} miner_address={}",
        "[node]".bright_cyan().bold(),
        args.port,
        args.difficulty,
        args.auto_mine,
        args.miner_address,
    );

    let node = Node::new(
        args.miner_address.clone(),
        args.port,
        args.difficulty,
        DEFAULT_BLOCK_REWARD,
        args.miner_address.clone(),
        args.auto_mine,
    );

    let bind_addr = format!("0.0.0.0:{}", args.port);
    node.start(&bind_addr, args.peers).await?;

    tokio::signal::ctrl_c().await?;
    println!("{} shutting down", "[node]".bright_cyan().bold());
    node.stop().await?;

    Ok(())
}
