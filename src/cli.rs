//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::services::ServiceKind;
use crate::transport::TransportKind;

/// Tool gateway: mount built-in services and remote tool servers behind
/// one endpoint
#[derive(Parser, Debug)]
#[command(name = "toolgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TOOLGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "TOOLGATE_PORT", global = true)]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "TOOLGATE_HOST", global = true)]
    pub host: Option<String>,

    /// Serve without sessions (no handshake, no server-initiated messages)
    #[arg(long, global = true)]
    pub stateless: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "TOOLGATE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TOOLGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (defaults to `serve`)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway with every configured service and backend (default)
    Serve,

    /// Serve one built-in service on its own, with unprefixed tool names.
    /// Auth settings come from the config file's `auth` section and the
    /// service's entry under `services`.
    Backend {
        /// Which service (add, subtract, deleter, discovery)
        service: ServiceKind,

        /// How to serve it (stdio, sse, streamable-http)
        #[arg(short, long, default_value = "streamable-http")]
        transport: TransportKind,

        /// Verify bearer tokens (AUTH0_DOMAIN and API_AUDIENCE unless the
        /// config file sets them)
        #[arg(long)]
        auth: bool,

        /// Scope every call must carry; repeatable
        #[arg(long = "scope", value_name = "SCOPE")]
        scopes: Vec<String>,
    },

    /// Serve one remote server's tools unchanged, e.g. to expose an SSE
    /// server over stdio or streamable HTTP
    Proxy {
        /// Remote server URL (`…/mcp` for streamable HTTP, `…/sse` for SSE)
        url: String,

        /// How to serve it (stdio, sse, streamable-http)
        #[arg(short, long, default_value = "streamable-http")]
        transport: TransportKind,

        /// Bearer token sent to the remote server
        #[arg(long, env = "TOOLGATE_TOKEN")]
        token: Option<String>,
    },

    /// Fetch an access token with the client-credentials grant
    /// (AUTH0_DOMAIN, AUTH0_CLIENT_ID, AUTH0_CLIENT_SECRET, API_AUDIENCE)
    Token,

    /// List the tools a server advertises
    Tools {
        /// Server URL (`…/mcp` for streamable HTTP, `…/sse` for SSE)
        url: String,

        /// Bearer token to send
        #[arg(long, env = "TOOLGATE_TOKEN")]
        token: Option<String>,
    },

    /// Call one tool and print its result
    Call {
        /// Server URL
        url: String,

        /// Tool name (qualified when calling a gateway)
        tool: String,

        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        arguments: String,

        /// Bearer token to send
        #[arg(long, env = "TOOLGATE_TOKEN")]
        token: Option<String>,
    },
}
