//! Command-line interface of the sample server.
//!
//! The binary wires the RPC runtime and the vector index together: it
//! listens on any number of endpoints, binds the built-in services (echo,
//! file transfer, publishing, rendezvous) and optionally serves a trained
//! IVF-PQ index.

use clap::builder::styling::{AnsiColor, Styles};
use clap::Parser;
use std::path::PathBuf;

/// Defines the styles for the help message.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Endpoints to listen on (repeatable)
    ///
    /// Accepted forms: tcp://host:port, udp://host:port,
    /// http://host:port/path, https://host:port/path, local:///path,
    /// pipe://name. An https listener additionally needs --cert/--key.
    #[arg(
        short = 'l',
        long = "listen",
        default_values_t = vec!["tcp://127.0.0.1:9600".to_string()],
        num_args = 1..,
        help_heading = "Core Options"
    )]
    pub listen: Vec<String>,

    /// PEM certificate chain for TLS (https listeners and negotiated TLS
    /// filters)
    #[arg(long, help_heading = "Security")]
    pub cert: Option<PathBuf>,

    /// PEM private key matching --cert
    #[arg(long, help_heading = "Security")]
    pub key: Option<PathBuf>,

    /// PEM CA bundle clients of this process should trust
    #[arg(long, help_heading = "Security")]
    pub ca: Option<PathBuf>,

    /// Shared secret enabling the NTLM/Kerberos/Negotiate-style auth
    /// filters
    #[arg(long, help_heading = "Security")]
    pub auth_secret: Option<String>,

    /// Worker threads for the async runtime (0 = one per core)
    #[arg(short = 't', long, default_value_t = 0, help_heading = "Core Options")]
    pub threads: usize,

    /// Act as a proxy-endpoint rendezvous for NAT-ed servers
    #[arg(long, default_value_t = false, help_heading = "Core Options")]
    pub enable_proxy_endpoints: bool,

    /// Directory uploads land in (enables the file transfer service)
    #[arg(long, help_heading = "File Transfer")]
    pub upload_dir: Option<PathBuf>,

    /// Directory downloads are served from
    #[arg(long, help_heading = "File Transfer")]
    pub download_dir: Option<PathBuf>,

    /// Server-side bandwidth cap for file transfers, bytes/sec (0 =
    /// unlimited)
    #[arg(long, default_value_t = 0, help_heading = "File Transfer")]
    pub server_bps: u32,

    /// Directory holding trained index codebooks (cq_centers,
    /// pq_centers); enables the vector search service
    #[arg(long, help_heading = "Vector Index")]
    pub index_path: Option<PathBuf>,

    /// Directory holding index segments (id_<c>, vector_<c>)
    #[arg(long, help_heading = "Vector Index")]
    pub db_path: Option<PathBuf>,

    /// Index shape: corpus size
    #[arg(long, default_value_t = 0, help_heading = "Vector Index")]
    pub index_n: usize,

    /// Index shape: vector dimension
    #[arg(long, default_value_t = 128, help_heading = "Vector Index")]
    pub index_d: usize,

    /// Index shape: per-query scan budget
    #[arg(long, default_value_t = 1000, help_heading = "Vector Index")]
    pub index_l: usize,

    /// Index shape: coarse clusters
    #[arg(long, default_value_t = 64, help_heading = "Vector Index")]
    pub index_kc: usize,

    /// Index shape: PQ subspaces
    #[arg(long, default_value_t = 16, help_heading = "Vector Index")]
    pub index_mp: usize,

    /// Index shape: PQ sub-centroids per subspace
    #[arg(long, default_value_t = 256, help_heading = "Vector Index")]
    pub index_kp: usize,

    /// Silence all user-facing informational output on stdout
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity on stderr
    ///
    /// Can be used multiple times: -v debug, -vv trace.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Log file path, or "stderr" to log diagnostics to stderr
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let args = Args::parse_from(["vector-rpc"]);
        assert_eq!(args.listen, vec!["tcp://127.0.0.1:9600".to_string()]);
        assert_eq!(args.threads, 0);
        assert!(!args.enable_proxy_endpoints);
    }

    #[test]
    fn test_multiple_listeners_and_tls() {
        let args = Args::parse_from([
            "vector-rpc",
            "-l",
            "tcp://0.0.0.0:9600",
            "https://0.0.0.0:9601/rpc",
            "--cert",
            "/etc/ssl/server.pem",
            "--key",
            "/etc/ssl/server.key",
            "-vv",
        ]);
        assert_eq!(args.listen.len(), 2);
        assert!(args.cert.is_some());
        assert_eq!(args.verbose, 2);
    }
}
