//! hostipc - command-line front end for hostipc-core.
//!
//! Launches programs with remapped descriptors and exercises the buffer
//! transport between this process and a re-launched copy of itself.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::os::fd::RawFd;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "hostipc")]
#[command(about = "Launch child processes and move buffers between them")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch a program and report its pid and exit status
    Launch(LaunchArgs),

    /// Send a buffer to a child copy of this binary and verify the echo
    BufferRoundtrip(RoundtripArgs),

    /// Child side of buffer-roundtrip: echo every buffer received on --fd
    BufferEcho(EchoArgs),
}

#[derive(clap::Args, Debug)]
pub struct LaunchArgs {
    /// Working directory for the child
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Environment change KEY=VALUE (an empty value removes KEY)
    #[arg(long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Use only the --env entries as the environment
    #[arg(long)]
    full_env: bool,

    /// Descriptor remap SRC:DST
    #[arg(long = "remap", value_parser = parse_remap)]
    remap: Vec<(RawFd, RawFd)>,

    /// Wait for the child to exit
    #[arg(long)]
    wait: bool,

    /// Launch through the sandbox hook, passing this broker descriptor
    #[arg(long)]
    sandbox_broker_fd: Option<RawFd>,

    /// Only report child setup failures through exit code 127
    #[arg(long)]
    no_error_report: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Program path and arguments
    #[arg(required = true, last = true)]
    program: Vec<String>,
}

#[derive(clap::Args, Debug)]
pub struct RoundtripArgs {
    /// Buffer size in bytes
    #[arg(long)]
    size: u32,

    /// Chunk size for reads and writes (multiple of 4)
    #[arg(long, default_value = "65536")]
    chunk: usize,

    /// Never use shared memory
    #[arg(long)]
    inline: bool,
}

#[derive(clap::Args, Debug)]
pub struct EchoArgs {
    /// Inherited channel descriptor
    #[arg(long)]
    fd: RawFd,

    /// Chunk size for reads (multiple of 4)
    #[arg(long, default_value = "65536")]
    chunk: usize,

    /// Never use shared memory for replies
    #[arg(long)]
    inline: bool,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in {:?}", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_remap(s: &str) -> Result<(RawFd, RawFd), String> {
    let (src, dst) = s
        .split_once(':')
        .ok_or_else(|| format!("expected SRC:DST, got {:?}", s))?;
    let src = src
        .parse()
        .map_err(|e| format!("bad source descriptor {:?}: {}", src, e))?;
    let dst = dst
        .parse()
        .map_err(|e| format!("bad target descriptor {:?}: {}", dst, e))?;
    Ok((src, dst))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays machine-readable
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    debug!("Running {:?}", args.command);

    match args.command {
        Command::Launch(launch) => commands::launch(launch),
        Command::BufferRoundtrip(roundtrip) => commands::buffer_roundtrip(roundtrip, args.debug),
        Command::BufferEcho(echo) => commands::buffer_echo(echo),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        assert_eq!(
            parse_env("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_env("A=").unwrap(), ("A".to_string(), String::new()));
        assert!(parse_env("A").is_err());
        assert!(parse_env("=x").is_err());
    }

    #[test]
    fn test_parse_remap() {
        assert_eq!(parse_remap("5:3").unwrap(), (5, 3));
        assert!(parse_remap("5").is_err());
        assert!(parse_remap("a:3").is_err());
    }

    #[test]
    fn test_launch_args() {
        let args = Args::try_parse_from([
            "hostipc", "launch", "--env", "A=1", "--remap", "4:3", "--wait", "--", "/bin/echo",
            "hi",
        ])
        .unwrap();
        match args.command {
            Command::Launch(launch) => {
                assert_eq!(launch.env, vec![("A".to_string(), "1".to_string())]);
                assert_eq!(launch.remap, vec![(4, 3)]);
                assert!(launch.wait);
                assert_eq!(launch.program, vec!["/bin/echo", "hi"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_roundtrip_args() {
        let args =
            Args::try_parse_from(["hostipc", "--debug", "buffer-roundtrip", "--size", "100"])
                .unwrap();
        assert!(args.debug);
        match args.command {
            Command::BufferRoundtrip(rt) => {
                assert_eq!(rt.size, 100);
                assert_eq!(rt.chunk, 65536);
                assert!(!rt.inline);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
