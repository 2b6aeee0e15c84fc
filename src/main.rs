//! toolgate - tool-calling gateway

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tracing::{error, info};

use toolgate::{
    auth::{ClientCredentials, StaticCredential, TokenClient},
    cli::{Cli, Command},
    config::{BackendConfig, Config, ServerConfig},
    gateway::{Gateway, serve_stdio},
    proxy::ProxyBackend,
    services::ServiceKind,
    setup_tracing,
    transport::{ClientSession, HttpMode, HttpTransport, Transport, TransportKind},
};

/// Deadline for client commands
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Command::Backend {
            service,
            transport,
            auth,
            ref scopes,
        }) => run_backend(&cli, service, transport, auth, scopes).await,
        Some(Command::Proxy {
            ref url,
            transport,
            ref token,
        }) => run_proxy(&cli, url, transport, token.as_deref()).await,
        Some(Command::Token) => run_token().await,
        Some(Command::Tools { ref url, ref token }) => run_tools(url, token.as_deref()).await,
        Some(Command::Call {
            ref url,
            ref tool,
            ref arguments,
            ref token,
        }) => run_call(url, tool, arguments, token.as_deref()).await,
        Some(Command::Serve) | None => run_server(&cli).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// CLI flags override the file
fn server_config(cli: &Cli, mut server: ServerConfig) -> ServerConfig {
    if let Some(port) = cli.port {
        server.port = port;
    }
    if let Some(ref host) = cli.host {
        server.host.clone_from(host);
    }
    server.stateless |= cli.stateless;
    server
}

async fn run_server(cli: &Cli) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref())?;
    config.server = server_config(cli, config.server);
    let gateway = Gateway::new(config).await?;
    gateway.run().await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_backend(
    cli: &Cli,
    service: ServiceKind,
    transport: TransportKind,
    auth: bool,
    scopes: &[String],
) -> anyhow::Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref())?;
    config.server = server_config(cli, config.server);
    config.auth.enabled |= auth;
    if !scopes.is_empty() {
        config
            .services
            .entry(service.as_str().to_string())
            .or_default()
            .required_scopes
            .extend(scopes.iter().cloned());
    }
    // Flags can switch auth on or add scopes after the file was checked
    config.validate()?;

    let gateway = Gateway::standalone(service, &config)?;
    info!(%service, %transport, auth = config.auth.enabled, "Serving standalone");
    serve_single(gateway, transport).await
}

async fn run_proxy(
    cli: &Cli,
    url: &str,
    transport: TransportKind,
    token: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let server = server_config(cli, Config::load(cli.config.as_deref())?.server);
    let mut backend = ProxyBackend::new("upstream", BackendConfig::url(url));
    if let Some(token) = token {
        backend = backend.with_credential(Arc::new(StaticCredential::new(token)));
    }
    let gateway = Gateway::proxy(Arc::new(backend), server).await;
    info!(%url, %transport, "Serving proxy");
    serve_single(gateway, transport).await
}

async fn serve_single(gateway: Gateway, transport: TransportKind) -> anyhow::Result<ExitCode> {
    match transport {
        TransportKind::Stdio => {
            serve_stdio(
                Arc::clone(gateway.dispatcher()),
                Arc::clone(gateway.sessions()),
                tokio::io::stdin(),
                tokio::io::stdout(),
            )
            .await?;
        }
        TransportKind::Sse | TransportKind::StreamableHttp => gateway.run().await?,
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_token() -> anyhow::Result<ExitCode> {
    let var = |name: &str| {
        std::env::var(name).map_err(|_| anyhow::anyhow!("{name} is not set"))
    };
    let credentials = ClientCredentials::for_domain(
        &var("AUTH0_DOMAIN")?,
        var("AUTH0_CLIENT_ID")?,
        var("AUTH0_CLIENT_SECRET")?,
        var("API_AUDIENCE")?,
    );
    let grant = TokenClient::new(reqwest::Client::new(), credentials)
        .fetch()
        .await?;
    println!("{}", grant.access_token);
    let scopes = grant.scopes();
    eprintln!(
        "scopes: {}",
        if scopes.is_empty() { "(none)".to_string() } else { scopes.join(" ") }
    );
    if let Some(expires_in) = grant.expires_in {
        eprintln!("expires in: {expires_in}s");
    }
    Ok(ExitCode::SUCCESS)
}

async fn connect(url: &str, token: Option<&str>) -> anyhow::Result<ClientSession> {
    let mode = match BackendConfig::url(url).transport_kind() {
        TransportKind::Sse => HttpMode::Sse,
        _ => HttpMode::Streamable,
    };
    let mut transport = HttpTransport::new(url, mode, CLIENT_TIMEOUT)?;
    if let Some(token) = token {
        transport = transport.with_credential(Arc::new(StaticCredential::new(token)));
    }
    let transport = Arc::new(transport);
    transport.connect().await?;
    let session = ClientSession::new(transport as Arc<dyn Transport>);
    session.initialize().await?;
    Ok(session)
}

async fn run_tools(url: &str, token: Option<&str>) -> anyhow::Result<ExitCode> {
    let session = connect(url, token).await?;
    let tools = session.list_tools().await?;
    for tool in &tools {
        println!("{:<32} {}", tool.name, tool.description.as_deref().unwrap_or(""));
    }
    session.close().await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_call(
    url: &str,
    tool: &str,
    arguments: &str,
    token: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let arguments: Value = serde_json::from_str(arguments)?;
    let session = connect(url, token).await?;
    let result = session.call_tool(tool, arguments).await;
    session.close().await?;
    let result = result?;
    match result.structured_content {
        Some(ref value) => println!("{}", serde_json::to_string_pretty(value)?),
        None => println!("{}", result.text()),
    }
    Ok(if result.is_error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
