//! introspect-worker binary.
//!
//! Usage: introspect-worker <manifest> start

use std::path::PathBuf;
use std::process;

const USAGE: &str = "\
Serve model and route queries for an application over stdin/stdout.

Usage: introspect-worker <manifest> start

Arguments:
  <manifest>  Path to the application manifest (JSON)
  start       Boot the runtime and serve until shutdown

Environment:
  INTROSPECT_LOG  Log level (trace, debug, info, warn, error, off); default error
  RUST_LOG        Full filter directive, overrides INTROSPECT_LOG
  LOG_FORMAT      Set to \"json\" for JSON logs on stderr";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let manifest = match parse_args(&args) {
        Ok(Some(manifest)) => manifest,
        Ok(None) => {
            println!("{USAGE}");
            return;
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    introspect_worker::init_tracing();

    if let Err(e) = introspect_worker::serve(&manifest).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// `Ok(None)` means help was requested.
fn parse_args(args: &[String]) -> Result<Option<PathBuf>, String> {
    let mut manifest: Option<PathBuf> = None;
    let mut command: Option<&str> = None;

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return Ok(None),
            flag if flag.starts_with('-') => return Err(format!("unknown flag: {flag}")),
            value if manifest.is_none() => manifest = Some(PathBuf::from(value)),
            value if command.is_none() => command = Some(value),
            value => return Err(format!("unexpected argument: {value}")),
        }
    }

    let manifest = manifest.ok_or("missing required argument: <manifest>")?;
    match command {
        Some("start") => Ok(Some(manifest)),
        Some(other) => Err(format!("unknown command '{other}', expected 'start'")),
        None => Err("missing command: start".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("introspect-worker")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn manifest_and_start() {
        assert_eq!(
            parse_args(&args(&["app/manifest.json", "start"])),
            Ok(Some(PathBuf::from("app/manifest.json")))
        );
    }

    #[test]
    fn help() {
        assert_eq!(parse_args(&args(&["--help"])), Ok(None));
    }

    #[test]
    fn usage_errors() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["manifest.json"])).is_err());
        assert!(parse_args(&args(&["manifest.json", "stop"])).is_err());
        assert!(parse_args(&args(&["manifest.json", "start", "extra"])).is_err());
        assert!(parse_args(&args(&["--verbose", "manifest.json", "start"])).is_err());
    }
}
