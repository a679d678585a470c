use clap::Parser;
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};

/// Runtime settings, from flags or the matching environment variables.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Upload CSV ledgers into DuckDB tables over HTTP")]
pub struct Config {
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// DuckDB database file, created on first start.
    #[arg(long, env = "DB_PATH", default_value = "finance.db")]
    pub db_path: PathBuf,

    /// Where uploads are staged while they are ingested.
    #[arg(long, env = "UPLOAD_DIR", default_value = "uploads")]
    pub upload_dir: PathBuf,

    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 50 * 1024 * 1024)]
    pub max_upload_bytes: u64,

    /// Default tracing directive when RUST_LOG is unset.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cfg = Config::try_parse_from([
            "csvledger",
            "--port",
            "8081",
            "--db-path",
            "/tmp/ledger.db",
            "--upload-dir",
            "/tmp/staging",
            "--max-upload-bytes",
            "1024",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/ledger.db"));
        assert_eq!(cfg.upload_dir, PathBuf::from("/tmp/staging"));
        assert_eq!(cfg.max_upload_bytes, 1024);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.socket_addr().to_string(), "0.0.0.0:8081");
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(Config::try_parse_from(["csvledger", "--port", "http"]).is_err());
    }
}
