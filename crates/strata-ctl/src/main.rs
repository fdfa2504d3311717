//! strata-ctl — command-line interface for the Strata coordinator.

mod cmd;

use anyhow::{Context, Result};

const DEFAULT_PORT: u16 = 7071;
const DEFAULT_OPERATION: &str = "BLOCK_MULTIPLY";

fn print_usage() {
    println!("Usage: strata-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                 Show coordinator status and connected nodes");
    println!("  multiply <matrix>      Run a job, e.g. multiply '[[1,2],[3,4]]'");
    println!("  multiply <op> <matrix> Run a job with an explicit operation");
    println!("  reconcile              Drop nodes whose links have closed");
    println!("  shutdown               Stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["multiply", matrix] => cmd::jobs::cmd_multiply(port, matrix, DEFAULT_OPERATION).await,
        ["multiply", op, matrix] => cmd::jobs::cmd_multiply(port, matrix, op).await,
        ["reconcile"] => cmd::status::cmd_reconcile(port).await,
        ["shutdown"] => cmd::status::cmd_shutdown(port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
