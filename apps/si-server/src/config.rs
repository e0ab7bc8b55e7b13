use std::net::SocketAddr;
use std::path::PathBuf;

pub(crate) struct HttpConfig {
    pub addr: SocketAddr,
    pub concurrency_limit: usize,
}

pub(crate) fn http_config_from_env() -> Result<HttpConfig, String> {
    let bind = std::env::var("SI_BIND").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("SI_PORT")
        .ok()
        .map(|p| p.parse().map_err(|_| format!("invalid SI_PORT: {p}")))
        .transpose()?
        .unwrap_or(8091);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .map_err(|_| format!("invalid SI_BIND/SI_PORT combination: {bind}:{port}"))?;
    let concurrency_limit: usize = std::env::var("SI_HTTP_MAX_CONC")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1024);
    Ok(HttpConfig {
        addr,
        concurrency_limit,
    })
}

/// Where the database and blob store live.
pub(crate) fn state_dir() -> PathBuf {
    std::env::var("SI_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("state"))
}

pub(crate) fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on" | "debug"
            )
        })
        .unwrap_or(false)
}
