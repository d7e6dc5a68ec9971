use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "apimux",
    version,
    about = "Aggregating LLM-API reverse proxy core"
)]
pub(crate) struct CliArgs {
    /// Database DSN. Empty means a sqlite file under the data dir.
    #[arg(long, env = "APIMUX_DSN", default_value = "")]
    pub(crate) dsn: String,

    /// Data directory for the default sqlite database.
    #[arg(long, env = "APIMUX_DATA_DIR", default_value = "")]
    pub(crate) data_dir: String,

    /// Bind host for the status listener.
    #[arg(long, env = "APIMUX_HOST")]
    pub(crate) host: Option<String>,

    /// Bind port for the status listener.
    #[arg(long, env = "APIMUX_PORT")]
    pub(crate) port: Option<u16>,

    /// Admin key (plaintext). Stored as hash in DB and memory.
    #[arg(long, env = "APIMUX_ADMIN_KEY")]
    pub(crate) admin_key: Option<String>,

    /// Optional outbound proxy for upstream egress.
    #[arg(long, env = "APIMUX_PROXY")]
    pub(crate) proxy: Option<String>,

    /// Candidate priority mode: provider | global_key.
    #[arg(long, env = "APIMUX_PRIORITY_MODE")]
    pub(crate) priority_mode: Option<String>,

    /// Scheduling mode: cache_affinity | fixed_order | load_balance.
    #[arg(long, env = "APIMUX_SCHEDULING_MODE")]
    pub(crate) scheduling_mode: Option<String>,

    /// Global default-allow for cross-format conversion.
    #[arg(long, env = "APIMUX_CONVERSION_ENABLED")]
    pub(crate) conversion_enabled: Option<bool>,

    /// Keep candidate priority even when conversion is required.
    #[arg(long, env = "APIMUX_KEEP_PRIORITY_ON_CONVERSION")]
    pub(crate) keep_priority_on_conversion: Option<bool>,
}
