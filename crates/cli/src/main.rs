use {
    clap::{Parser, Subcommand},
    livedesk_gateway::StoreAuthenticator,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "livedesk", about = "livedesk: customer-service chat broker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true, env = "LIVEDESK_HOST")]
    host: Option<String>,

    /// Port to listen on (overrides config value).
    #[arg(long, global = true, env = "LIVEDESK_PORT")]
    port: Option<u16>,

    /// Database URL (overrides config value).
    #[arg(long, global = true, env = "LIVEDESK_DATABASE_URL")]
    database_url: Option<String>,

    /// Path to a config file (skips discovery).
    #[arg(long, global = true, env = "LIVEDESK_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broker (default when no subcommand is provided).
    Serve,
    /// Seed a staff user and print nothing but its id. The bearer token is
    /// hashed before it is stored.
    AddUser {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// `cs` or `admin`.
        #[arg(long, default_value = "cs")]
        role: String,
        /// The bearer token the agent will present.
        #[arg(long)]
        token: String,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<livedesk_config::LivedeskConfig> {
    let mut config = match cli.config {
        Some(ref path) => livedesk_config::load_config(path)?,
        None => livedesk_config::discover_and_load(),
    };
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref url) = cli.database_url {
        config.database.url = url.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "livedesk starting");
    let config = load_config(&cli)?;

    match cli.command {
        None | Some(Commands::Serve) => livedesk_gateway::start(config).await,
        Some(Commands::AddUser {
            name,
            email,
            role,
            token,
        }) => {
            let pool = livedesk_store::connect(&config.database.url).await?;
            livedesk_store::run_migrations(&pool).await?;
            let store = livedesk_store::ChatStore::new(pool);
            let digest = StoreAuthenticator::digest(&token);
            let id = store
                .insert_user(&name, &email, &role, Some(&digest))
                .await?;
            store
                .upsert_presence(id, config.chat.max_chats_per_cs as i64)
                .await?;
            println!("{id}");
            Ok(())
        },
    }
}
