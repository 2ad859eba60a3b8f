use anyhow::Context;
use clap::Parser;
use metasniff::{Config, Sniffer};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "metasniff",
    version,
    about = "A sniffer that sniffs torrents from the BitTorrent network"
)]
struct Cli {
    /// Listen on the given address
    #[arg(short, long, default_value = "0.0.0.0")]
    addr: String,

    /// Listen on the given port
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Max friends to make per second
    #[arg(short, long, default_value_t = 500)]
    friends: usize,

    /// Max peers to concurrently download torrents from
    #[arg(short = 'e', long, default_value_t = 400)]
    peers: usize,

    /// Max time allowed for downloading one torrent's metadata, e.g. 10s or 500ms
    #[arg(short, long, default_value = "10s", value_parser = parse_duration)]
    timeout: Duration,

    /// Directory to store the torrents (defaults to ~/torrents)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// File with one interesting keyword per line
    #[arg(short, long, default_value = "keywords.txt")]
    kwfile: PathBuf,

    /// The output database
    #[arg(short = 'o', long, default_value = "torrentdata.db")]
    database: PathBuf,

    /// Log informational output to stdout
    #[arg(short, long, default_value_t = true, action = clap::ArgAction::Set)]
    verbose: bool,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(at) => s.split_at(at),
        None => (s, "s"),
    };
    let n: u64 = value.parse().map_err(|_| format!("bad duration: {s}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        _ => Err(format!("bad duration unit: {unit}")),
    }
}

fn default_dir() -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set and --dir was not given")?;
    Ok(PathBuf::from(home).join("torrents"))
}

fn read_keywords(path: &PathBuf) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .collect(),
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "could not read keyword file; nothing will be saved to disk");
            Vec::new()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let dir = match cli.dir {
        Some(d) => d,
        None => default_dir()?,
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create torrent directory {}", dir.display()))?;
    let dir = dir
        .canonicalize()
        .with_context(|| format!("resolve torrent directory {}", dir.display()))?;

    let keywords = read_keywords(&cli.kwfile);

    let sniffer = Sniffer::new(Config {
        address: format!("{}:{}", cli.addr, cli.port),
        max_friends: cli.friends,
        max_peers: cli.peers,
        timeout: cli.timeout,
        dir,
        keywords,
        database: cli.database,
    })
    .await
    .context("open summary database")?;

    sniffer.run().await.context("crawl failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert!(parse_duration("10h").is_err());
        assert!(parse_duration("xs").is_err());
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["metasniff"]);
        assert_eq!(cli.addr, "0.0.0.0");
        assert_eq!(cli.port, 6881);
        assert_eq!(cli.friends, 500);
        assert_eq!(cli.peers, 400);
        assert_eq!(cli.timeout, Duration::from_secs(10));
        assert!(cli.verbose);
    }

    #[test]
    fn cli_short_flags() {
        let cli = Cli::parse_from([
            "metasniff", "-a", "127.0.0.1", "-p", "7000", "-f", "9", "-e", "3", "-t", "2s", "-v",
            "false",
        ]);
        assert_eq!(cli.addr, "127.0.0.1");
        assert_eq!(cli.port, 7000);
        assert_eq!(cli.friends, 9);
        assert_eq!(cli.peers, 3);
        assert_eq!(cli.timeout, Duration::from_secs(2));
        assert!(!cli.verbose);
    }
}
