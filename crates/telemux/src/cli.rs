//! Clap derive structures for the `telemux` CLI.

use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use telemux_core::{AggregationType, AttributeScope, ComparisonUnit, EntityType};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// telemux -- live device telemetry over one multiplexed websocket
#[derive(Debug, Parser)]
#[command(
    name = "telemux",
    version,
    about = "Stream, aggregate and query device telemetry from the command line",
    long_about = "Subscribes to telemetry over a single shared websocket, aggregates\n\
        samples into fixed time windows, and sends RPC commands to devices.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Server profile to use
    #[arg(long, short = 'p', env = "TELEMUX_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Server URL (overrides profile)
    #[arg(long, short = 's', env = "TELEMUX_SERVER", global = true)]
    pub server: Option<String>,

    /// Access token (overrides profile credentials)
    #[arg(long, env = "TELEMUX_TOKEN", global = true, hide_env = true)]
    pub token: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "TELEMUX_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Accept self-signed TLS certificates
    #[arg(long, short = 'k', env = "TELEMUX_INSECURE", global = true)]
    pub insecure: bool,

    /// REST request timeout in seconds (overrides profile)
    #[arg(long, env = "TELEMUX_TIMEOUT", global = true)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON, one document per update
    JsonCompact,
    /// Plain `key ts value` lines (scripting)
    Plain,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Stream an aggregated realtime window until interrupted
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Fetch and aggregate a fixed historical window
    #[command(alias = "hist")]
    History(HistoryArgs),

    /// Show latest telemetry or attribute values
    Latest(LatestArgs),

    /// Send an RPC command to a device
    Rpc(RpcArgs),

    /// Inspect CLI configuration
    #[command(alias = "cfg")]
    Config(ConfigArgs),
}

// ── Shared argument groups ───────────────────────────────────────────

#[derive(Debug, Args)]
pub struct EntityArgs {
    /// Entity UUID
    pub entity_id: Uuid,

    /// Entity type
    #[arg(long, short = 't', default_value = "DEVICE", value_parser = parse_entity_type)]
    pub entity_type: EntityType,

    /// Comma-separated telemetry keys
    #[arg(long, short = 'K', value_delimiter = ',', required = true)]
    pub keys: Vec<String>,
}

#[derive(Debug, Args)]
pub struct AggregationArgs {
    /// Aggregation function (min, max, avg, sum, count, none)
    #[arg(long, short = 'a', default_value = "avg", value_parser = parse_agg)]
    pub agg: AggregationType,

    /// Aggregation interval (e.g. 1s, 30s, 5m)
    #[arg(long, short = 'i', value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,

    /// Maximum points per key
    #[arg(long, short = 'l', default_value_t = 200)]
    pub limit: usize,

    /// Treat series as step functions across the window bounds
    #[arg(long)]
    pub state_data: bool,
}

// ── Subcommand args ──────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[command(flatten)]
    pub entity: EntityArgs,

    #[command(flatten)]
    pub aggregation: AggregationArgs,

    /// Trailing window length
    #[arg(long, short = 'w', default_value = "10m", value_parser = humantime::parse_duration)]
    pub window: Duration,

    /// Also watch the same window one day/week/month/year earlier
    #[arg(long, value_parser = parse_comparison)]
    pub compare: Option<ComparisonUnit>,

    /// Stop after this long (runs until Ctrl-C otherwise)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[command(flatten)]
    pub entity: EntityArgs,

    #[command(flatten)]
    pub aggregation: AggregationArgs,

    /// Window start (RFC 3339 or epoch milliseconds)
    #[arg(long, requires = "end", conflicts_with = "last", value_parser = parse_timestamp)]
    pub start: Option<i64>,

    /// Window end (RFC 3339 or epoch milliseconds)
    #[arg(long, requires = "start", value_parser = parse_timestamp)]
    pub end: Option<i64>,

    /// Window ending now (e.g. 1h, 1d)
    #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
    pub last: Duration,

    /// Also fetch the same window one day/week/month/year earlier
    #[arg(long, value_parser = parse_comparison)]
    pub compare: Option<ComparisonUnit>,

    /// How long to wait for the server's answer
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub wait: Duration,
}

#[derive(Debug, Args)]
pub struct LatestArgs {
    #[command(flatten)]
    pub entity: EntityArgs,

    /// Read attributes instead of telemetry
    #[arg(long)]
    pub attributes: bool,

    /// Attribute scope (client, server, shared); all scopes when omitted
    #[arg(long, requires = "attributes", value_parser = parse_scope)]
    pub scope: Option<AttributeScope>,

    /// Keep printing updates until interrupted
    #[arg(long, short = 'f')]
    pub follow: bool,

    /// How long to wait for the first value
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub wait: Duration,
}

#[derive(Debug, Args)]
pub struct RpcArgs {
    /// Target device UUID
    pub device_id: Uuid,

    /// RPC method name
    pub method: String,

    /// JSON params (default: {})
    #[arg(long, short = 'P')]
    pub params: Option<String>,

    /// Fire-and-forget: return once the server accepts the command
    #[arg(long)]
    pub one_way: bool,

    /// Request timeout, sent to the server and enforced locally
    #[arg(long, value_parser = humantime::parse_duration)]
    pub rpc_timeout: Option<Duration>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,
    /// Show the effective configuration (secrets redacted)
    Show,
    /// List profile names
    Profiles,
}

// ── Value parsers ────────────────────────────────────────────────────

fn parse_entity_type(s: &str) -> Result<EntityType, String> {
    s.parse().map_err(|_| format!("unknown entity type '{s}'"))
}

fn parse_agg(s: &str) -> Result<AggregationType, String> {
    s.parse().map_err(|_| format!("unknown aggregation '{s}'"))
}

fn parse_comparison(s: &str) -> Result<ComparisonUnit, String> {
    s.parse()
        .map_err(|_| format!("expected day, week, month or year, got '{s}'"))
}

fn parse_scope(s: &str) -> Result<AttributeScope, String> {
    let normalized = s.to_ascii_uppercase();
    let full = if normalized.ends_with("_SCOPE") {
        normalized
    } else {
        format!("{normalized}_SCOPE")
    };
    full.parse().map_err(|_| format!("unknown attribute scope '{s}'"))
}

/// RFC 3339 timestamp or raw epoch milliseconds.
pub fn parse_timestamp(s: &str) -> Result<i64, String> {
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| format!("invalid timestamp '{s}': {e}"))
}
