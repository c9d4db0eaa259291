mod simple_config;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tonearm_client::request::parse_id;
use tonearm_client::{
    BrowseKind, Client, ClientConfig, ClientIdentity, ClientSession, Credentials, SessionInfo,
    SUBSTREAM_SIZE,
};
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use simple_config::load_overrides;

const DEFAULT_SERVER: &str = "ap.spotify.com:4070";
const PASSWORD_ENV: &str = "TONEARM_PASSWORD";

#[derive(Parser, Debug)]
#[command(
    name = "tonearm",
    author,
    version,
    about = "Log in to a legacy streaming-music access point and fetch metadata, images and audio",
    propagate_version = true
)]
struct Cli {
    /// Increase output verbosity (-v, -vv).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Output log format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and print the session details.
    Login(LoginArgs),
    /// Run a search and print the result XML.
    Search(SearchArgs),
    /// Download an image by its 20-byte hex id.
    Image(ImageArgs),
    /// Fetch artist, album or track metadata.
    Browse(BrowseArgs),
    /// Fetch a toplist.
    Toplist(ToplistArgs),
    /// Fetch a playlist, or the playlist container when no id is given.
    Playlist(PlaylistArgs),
    /// Decrypt an audio file, or part of it, to disk.
    Stream(StreamArgs),
}

#[derive(Args, Debug, Clone)]
struct ConnectArgs {
    /// Access point to try, in order (comma separated or repeat the flag).
    #[arg(long, value_delimiter = ',', default_values_t = vec![DEFAULT_SERVER.to_string()])]
    server: Vec<String>,

    #[arg(short, long)]
    username: Option<String>,

    /// Account password. Falls back to the TONEARM_PASSWORD environment variable.
    #[arg(long)]
    password: Option<String>,

    /// Timeout for each connection attempt (e.g. "1s", "500ms").
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    connect_timeout: Duration,

    /// How long to wait for the country code and product info after login.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    login_timeout: Duration,

    /// Timeout for each channel request.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    channel_timeout: Duration,

    /// Timeout for AES key requests.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    aes_key_timeout: Duration,

    /// Bytes requested per substream range.
    #[arg(long, default_value_t = SUBSTREAM_SIZE)]
    substream_size: u64,

    /// Cache hash to answer the secret block with (40 hex characters).
    #[arg(long)]
    cache_hash: Option<String>,

    /// Operating system id sent in the client hello.
    #[arg(long, default_value_t = ClientIdentity::default().os)]
    os: u32,

    /// Client revision sent in the client hello.
    #[arg(long, default_value_t = ClientIdentity::default().revision)]
    revision: u32,

    /// Client id sent in the client hello.
    #[arg(long, default_value_t = ClientIdentity::default().client_id)]
    client_id: u32,

    /// Client configuration file (YAML or JSON) overriding these flags.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[command(flatten)]
    connect: ConnectArgs,

    /// How to print the session details.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
}

#[derive(Args, Debug)]
struct SearchArgs {
    #[command(flatten)]
    connect: ConnectArgs,

    query: String,

    #[arg(long, default_value_t = 0)]
    offset: i32,

    /// Maximum results, -1 for no limit.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    limit: i32,

    /// Write the result here instead of stdout.
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ImageArgs {
    #[command(flatten)]
    connect: ConnectArgs,

    id: String,

    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct BrowseArgs {
    #[command(flatten)]
    connect: ConnectArgs,

    #[arg(value_enum)]
    kind: BrowseTarget,

    /// 16-byte hex ids. Artist and album take exactly one.
    #[arg(required = true)]
    ids: Vec<String>,

    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ToplistArgs {
    #[command(flatten)]
    connect: ConnectArgs,

    /// Request parameter as key=value; "type" is required.
    #[arg(short, long = "param", value_parser = parse_key_value, required = true)]
    params: Vec<(String, String)>,

    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PlaylistArgs {
    #[command(flatten)]
    connect: ConnectArgs,

    id: Option<String>,

    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct StreamArgs {
    #[command(flatten)]
    connect: ConnectArgs,

    /// 20-byte hex file id.
    file: String,

    /// 16-byte hex track id.
    track: String,

    #[arg(short, long)]
    out: PathBuf,

    /// First byte to write.
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Bytes to write; the rest of the file when omitted.
    #[arg(long)]
    length: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BrowseTarget {
    Artist,
    Album,
    Tracks,
}

impl From<BrowseTarget> for BrowseKind {
    fn from(value: BrowseTarget) -> Self {
        match value {
            BrowseTarget::Artist => BrowseKind::Artist,
            BrowseTarget::Album => BrowseKind::Album,
            BrowseTarget::Tracks => BrowseKind::Tracks,
        }
    }
}

#[derive(Debug, Serialize)]
struct LoginReport {
    username: String,
    country: Option<String>,
    product_info: Option<String>,
    notification: Option<String>,
}

impl From<SessionInfo> for LoginReport {
    fn from(info: SessionInfo) -> Self {
        Self {
            username: info.username,
            country: info.country,
            product_info: info
                .product_info
                .map(|xml| String::from_utf8_lossy(&xml).into_owned()),
            notification: info.notification,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match cli.command {
        Command::Login(args) => run_login(args).await,
        Command::Search(args) => run_search(args).await,
        Command::Image(args) => run_image(args).await,
        Command::Browse(args) => run_browse(args).await,
        Command::Toplist(args) => run_toplist(args).await,
        Command::Playlist(args) => run_playlist(args).await,
        Command::Stream(args) => run_stream(args).await,
    }
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let level = match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // Logs go to stderr so fetched bytes can be piped from stdout.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = match format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

fn client_config(args: &ConnectArgs) -> Result<ClientConfig> {
    let mut config = ClientConfig::new(args.server.iter().cloned())
        .with_connect_timeout(args.connect_timeout)
        .with_login_timeout(args.login_timeout)
        .with_channel_timeout(args.channel_timeout)
        .with_aes_key_timeout(args.aes_key_timeout)
        .with_substream_size(args.substream_size)
        .with_identity(ClientIdentity {
            os: args.os,
            revision: args.revision,
            client_id: args.client_id,
        });
    if let Some(hash) = &args.cache_hash {
        let hash = parse_id::<20>(hash).context("invalid --cache-hash")?;
        config = config.with_cache_hash(hash);
    }
    Ok(config)
}

fn credentials(args: &ConnectArgs) -> Result<Credentials> {
    let Some(username) = args.username.clone() else {
        bail!("a username is required (--username or the config file)");
    };
    let password = match args.password.clone() {
        Some(password) => password,
        None => std::env::var(PASSWORD_ENV)
            .with_context(|| format!("no password given and {PASSWORD_ENV} is not set"))?,
    };
    Ok(Credentials::new(username, password))
}

async fn connect(mut args: ConnectArgs) -> Result<ClientSession> {
    if let Some(path) = args.config.clone() {
        let overrides = load_overrides(&path).await?;
        if !overrides.is_empty() {
            overrides.apply(&mut args);
        }
    }
    let config = client_config(&args)?;
    let credentials = credentials(&args)?;
    let client = Client::new(config);
    let session = client
        .login(credentials)
        .await
        .with_context(|| format!("login to {} failed", args.server.join(", ")))?;
    Ok(session)
}

async fn write_output(out: Option<&Path>, data: &[u8]) -> Result<()> {
    match out {
        Some(path) => {
            tokio::fs::write(path, data)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), bytes = data.len(), "saved");
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(data).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

async fn run_login(args: LoginArgs) -> Result<()> {
    let session = connect(args.connect).await?;
    let report = LoginReport::from(session.info());
    session.close().await;
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("username:     {}", report.username);
            println!("country:      {}", report.country.as_deref().unwrap_or("-"));
            if let Some(notification) = &report.notification {
                println!("notification: {notification}");
            }
            if let Some(product) = &report.product_info {
                println!("product info:\n{product}");
            }
        }
    }
    Ok(())
}

async fn run_search(args: SearchArgs) -> Result<()> {
    let session = connect(args.connect).await?;
    let result = session.search(&args.query, args.offset, args.limit).await;
    session.close().await;
    write_output(args.out.as_deref(), &result.context("search failed")?).await
}

async fn run_image(args: ImageArgs) -> Result<()> {
    let id = parse_id::<20>(&args.id)?;
    let session = connect(args.connect).await?;
    let result = session.image(&id).await;
    session.close().await;
    write_output(args.out.as_deref(), &result.context("image request failed")?).await
}

async fn run_browse(args: BrowseArgs) -> Result<()> {
    let ids = args
        .ids
        .iter()
        .map(|id| parse_id::<16>(id))
        .collect::<Result<Vec<_>, _>>()?;
    let session = connect(args.connect).await?;
    let result = session.browse(args.kind.into(), &ids).await;
    session.close().await;
    write_output(args.out.as_deref(), &result.context("browse failed")?).await
}

async fn run_toplist(args: ToplistArgs) -> Result<()> {
    let params: Vec<(&str, &str)> = args
        .params
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();
    let session = connect(args.connect).await?;
    let result = session.toplist(&params).await;
    session.close().await;
    write_output(args.out.as_deref(), &result.context("toplist request failed")?).await
}

async fn run_playlist(args: PlaylistArgs) -> Result<()> {
    let id = args.id.as_deref().map(parse_id::<16>).transpose()?;
    let session = connect(args.connect).await?;
    let result = session.playlist(id.as_ref()).await;
    session.close().await;
    write_output(args.out.as_deref(), &result.context("playlist request failed")?).await
}

async fn run_stream(args: StreamArgs) -> Result<()> {
    let file = parse_id::<20>(&args.file)?;
    let track = parse_id::<16>(&args.track)?;
    let session = connect(args.connect).await?;
    let result = copy_stream(&session, &file, &track, &args.out, args.offset, args.length).await;
    session.close().await;
    result
}

async fn copy_stream(
    session: &ClientSession,
    file: &[u8; 20],
    track: &[u8; 16],
    out: &Path,
    offset: u64,
    length: Option<u64>,
) -> Result<()> {
    let mut reader = session
        .open_stream(file, track)
        .await
        .context("failed to open audio stream")?;
    if offset > 0 {
        // The length is unknown until the first range arrives, so skip
        // rather than seek.
        reader.skip(offset)?;
    }
    let mut output = tokio::fs::File::create(out)
        .await
        .with_context(|| format!("failed to create {}", out.display()))?;

    let mut remaining = length.unwrap_or(u64::MAX);
    let mut written = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n]).await?;
        written += n as u64;
        remaining -= n as u64;
    }
    output.flush().await?;
    if let Some(length) = length {
        if written < length {
            warn!(requested = length, written, "stream ended early");
        }
    }
    info!(
        path = %out.display(),
        bytes = written,
        stream_length = reader.stream_length(),
        "audio saved"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_params() {
        assert_eq!(
            parse_key_value("type=track").expect("pair"),
            ("type".to_string(), "track".to_string())
        );
        assert_eq!(
            parse_key_value("region=").expect("empty value"),
            ("region".to_string(), String::new())
        );
        assert!(parse_key_value("=x").is_err());
        assert!(parse_key_value("novalue").is_err());
    }

    #[test]
    fn search_accepts_negative_limit() {
        let cli = Cli::parse_from(["tonearm", "search", "daft punk", "--limit", "-1", "-u", "me"]);
        let Command::Search(args) = cli.command else {
            panic!("expected search");
        };
        assert_eq!(args.limit, -1);
        assert_eq!(args.connect.username.as_deref(), Some("me"));
        assert_eq!(args.connect.server, vec![DEFAULT_SERVER.to_string()]);
    }

    #[test]
    fn config_from_flags() {
        let cli = Cli::parse_from([
            "tonearm",
            "-v",
            "login",
            "--server",
            "a.invalid:1,b.invalid:2",
            "--channel-timeout",
            "3s",
            "--cache-hash",
            "f4c2aa05e825a7b5e4e6590f3dd0be0aef205195",
        ]);
        assert_eq!(cli.verbose, 1);
        let Command::Login(args) = cli.command else {
            panic!("expected login");
        };
        let config = client_config(&args.connect).expect("config");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.channel_timeout, Duration::from_secs(3));
        assert_eq!(config.cache_hash.map(|hash| hash[0]), Some(0xf4));
    }

    #[test]
    fn bad_cache_hash_is_rejected() {
        let cli = Cli::parse_from(["tonearm", "login", "--cache-hash", "zz"]);
        let Command::Login(args) = cli.command else {
            panic!("expected login");
        };
        assert!(client_config(&args.connect).is_err());
    }

    #[test]
    fn missing_username_is_reported() {
        let cli = Cli::parse_from(["tonearm", "login", "--password", "pw"]);
        let Command::Login(args) = cli.command else {
            panic!("expected login");
        };
        assert!(credentials(&args.connect).is_err());
    }
}
