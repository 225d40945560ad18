use std::process;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use procrelay::{DEFAULT_MAX_FAILS, RelayConfig, RelayError, WorkerSupervisor};

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout is reserved for response frames.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let (max_fails, command) = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: procrelay [--max-fails <n>] [--] <worker-command> [args...]");
            eprintln!();
            eprintln!("Reads one JSON request per line on stdin, relays each to the");
            eprintln!("supervised worker command, and prints one JSON response per line");
            eprintln!("on stdout. Worker stderr passes through to this process's stderr.");
            eprintln!();
            eprintln!("Options:");
            eprintln!(
                "  --max-fails <n>  Consecutive worker failures tolerated before the"
            );
            eprintln!(
                "                   host exits non-zero [default: {DEFAULT_MAX_FAILS}]"
            );
            process::exit(2);
        }
    };

    if let Err(e) = run(max_fails, command).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<(u32, Vec<String>), String> {
    let mut max_fails = DEFAULT_MAX_FAILS;
    let mut command: Vec<String> = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--max-fails" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "--max-fails requires a value".to_string())?;
                max_fails = value
                    .parse()
                    .map_err(|_| format!("invalid --max-fails value: {value}"))?;
            }
            "--" => {
                command.extend(args[i + 1..].iter().cloned());
                break;
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            _ => {
                // First non-flag argument starts the worker command verbatim.
                command.extend(args[i..].iter().cloned());
                break;
            }
        }
        i += 1;
    }

    if command.is_empty() {
        return Err("missing worker command".to_string());
    }
    Ok((max_fails, command))
}

async fn run(max_fails: u32, command: Vec<String>) -> anyhow::Result<()> {
    let mut command = command.into_iter();
    let program = command.next().context("missing worker command")?;
    let handle =
        WorkerSupervisor::start(RelayConfig::command(program, command).with_max_fails(max_fails));

    let mut requests = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = requests
        .next_line()
        .await
        .context("failed to read request line")?
    {
        if line.trim().is_empty() {
            continue;
        }
        let request: serde_json::Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = %e, "ignoring request line that is not valid JSON");
                continue;
            }
        };
        match handle.submit(&request).await {
            Ok(response) => println!("{response}"),
            Err(err @ RelayError::FatallyStopped) => return Err(err.into()),
            Err(err) => tracing::error!(error = %err, "request failed"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("procrelay")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_command_with_args() {
        let (max_fails, command) = parse_args(&argv(&["worker", "--verbose"])).unwrap();
        assert_eq!(max_fails, DEFAULT_MAX_FAILS);
        assert_eq!(command, vec!["worker", "--verbose"]);
    }

    #[test]
    fn parses_max_fails_and_separator() {
        let (max_fails, command) =
            parse_args(&argv(&["--max-fails", "2", "--", "sh", "-c", "worker"])).unwrap();
        assert_eq!(max_fails, 2);
        assert_eq!(command, vec!["sh", "-c", "worker"]);
    }

    #[test]
    fn flags_after_separator_belong_to_the_worker() {
        let (_, command) = parse_args(&argv(&["--", "--max-fails"])).unwrap();
        assert_eq!(command, vec!["--max-fails"]);
    }

    #[test]
    fn rejects_missing_command() {
        assert!(parse_args(&argv(&[])).is_err());
        assert!(parse_args(&argv(&["--max-fails", "3"])).is_err());
    }

    #[test]
    fn rejects_bad_max_fails() {
        assert!(parse_args(&argv(&["--max-fails", "lots", "worker"])).is_err());
    }
}
