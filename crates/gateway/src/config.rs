use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use podtrack_auth::OidcConfig;
use podtrack_policy::pagination::PageDefaults;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub store_backend: StoreBackend,
    pub db_url: Option<String>,
    pub auth_mode: AuthMode,
    pub local_auth_shared_secret: Option<String>,
    pub oidc: Option<OidcConfig>,
    pub query_timeout_ms: u64,
    pub ledger_write_timeout_ms: u64,
    pub page_defaults: PageDefaults,
    pub metrics_require_auth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Local,
    Oidc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("PODTRACK_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("PODTRACK_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "PODTRACK_BIND_ADDR",
        )?;

        let auth_mode = parse_auth_mode(kv.get("PODTRACK_AUTH_MODE"))?;

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("PODTRACK_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        if !bind_addr.ip().is_loopback() && auth_mode != AuthMode::Oidc {
            if dev_allow_nonlocal_bind && bind_addr.ip().is_unspecified() {
                // Dev-only escape hatch for local containers.
            } else {
                return Err(StartupError {
                    code: "ERR_NONLOCAL_BIND_REQUIRES_AUTH",
                    message: "non-local bind requires oidc auth mode; refuse startup".to_string(),
                });
            }
        }

        let store_backend = parse_store_backend(kv.get("PODTRACK_STORE_BACKEND"))?;
        let db_url = match store_backend {
            StoreBackend::Postgres => Some(require_nonempty(kv, "PODTRACK_DB_URL")?),
            StoreBackend::Memory => optional_nonempty(kv, "PODTRACK_DB_URL"),
        };

        let local_auth_shared_secret = optional_nonempty(kv, "PODTRACK_LOCAL_AUTH_SHARED_SECRET");

        let oidc = if auth_mode == AuthMode::Oidc {
            Some(parse_oidc_config(kv)?)
        } else {
            None
        };

        let query_timeout_ms = parse_u64(
            kv.get("PODTRACK_QUERY_TIMEOUT_MS"),
            500,
            "PODTRACK_QUERY_TIMEOUT_MS",
        )?;

        let ledger_write_timeout_ms = parse_u64(
            kv.get("PODTRACK_LEDGER_WRITE_TIMEOUT_MS"),
            2000,
            "PODTRACK_LEDGER_WRITE_TIMEOUT_MS",
        )?;

        let defaults = PageDefaults::default();
        let page_size = parse_u64(
            kv.get("PODTRACK_DEFAULT_PAGE_SIZE"),
            defaults.page_size,
            "PODTRACK_DEFAULT_PAGE_SIZE",
        )?;
        let max_page_size = parse_u64(
            kv.get("PODTRACK_MAX_PAGE_SIZE"),
            defaults.max_page_size,
            "PODTRACK_MAX_PAGE_SIZE",
        )?;
        if page_size == 0 || max_page_size < page_size {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "PODTRACK_DEFAULT_PAGE_SIZE must be >= 1 and <= PODTRACK_MAX_PAGE_SIZE"
                    .to_string(),
            });
        }

        let metrics_require_auth = parse_bool(kv.get("PODTRACK_METRICS_REQUIRE_AUTH"))
            .unwrap_or(auth_mode == AuthMode::Oidc);

        Ok(Self {
            bind_addr,
            store_backend,
            db_url,
            auth_mode,
            local_auth_shared_secret,
            oidc,
            query_timeout_ms,
            ledger_write_timeout_ms,
            page_defaults: PageDefaults {
                page_size,
                max_page_size,
            },
            metrics_require_auth,
        })
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn ledger_write_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_write_timeout_ms)
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()).to_string());
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> &str {
    for quote in ['"', '\''] {
        if s.len() >= 2
            && let Some(inner) = s.strip_prefix(quote).and_then(|r| r.strip_suffix(quote))
        {
            return inner;
        }
    }
    s
}

fn optional_nonempty(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional_nonempty(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_store_backend(value: Option<&String>) -> Result<StoreBackend, StartupError> {
    let backend = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("postgres");

    match backend {
        "postgres" => Ok(StoreBackend::Postgres),
        "memory" => Ok(StoreBackend::Memory),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "PODTRACK_STORE_BACKEND must be postgres or memory".to_string(),
        }),
    }
}

fn parse_auth_mode(value: Option<&String>) -> Result<AuthMode, StartupError> {
    let mode = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("local");

    match mode {
        "local" => Ok(AuthMode::Local),
        "oidc" => Ok(AuthMode::Oidc),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "PODTRACK_AUTH_MODE must be local or oidc".to_string(),
        }),
    }
}

fn parse_oidc_config(kv: &HashMap<String, String>) -> Result<OidcConfig, StartupError> {
    let issuer = require_nonempty(kv, "PODTRACK_OIDC_ISSUER")?;

    let jwks_json = optional_nonempty(kv, "PODTRACK_OIDC_JWKS_JSON");
    let jwks_url = optional_nonempty(kv, "PODTRACK_OIDC_JWKS_URL");

    if jwks_json.is_none() && jwks_url.is_none() {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "oidc requires PODTRACK_OIDC_JWKS_URL or PODTRACK_OIDC_JWKS_JSON".to_string(),
        });
    }

    let audience = optional_nonempty(kv, "PODTRACK_OIDC_AUDIENCE");
    let actor_id_claim =
        optional_nonempty(kv, "PODTRACK_OIDC_ACTOR_ID_CLAIM").unwrap_or_else(|| "sub".to_string());
    let role_claim = optional_nonempty(kv, "PODTRACK_OIDC_ROLE_CLAIM")
        .unwrap_or_else(|| "podtrack_role".to_string());

    let jwks_timeout_ms = parse_u64(
        kv.get("PODTRACK_OIDC_JWKS_TIMEOUT_MS"),
        2000,
        "PODTRACK_OIDC_JWKS_TIMEOUT_MS",
    )?;
    let jwks_refresh_ttl_secs = parse_u64(
        kv.get("PODTRACK_OIDC_JWKS_REFRESH_TTL_SECS"),
        300,
        "PODTRACK_OIDC_JWKS_REFRESH_TTL_SECS",
    )?;
    let clock_skew_secs = parse_u64(
        kv.get("PODTRACK_OIDC_CLOCK_SKEW_SECS"),
        60,
        "PODTRACK_OIDC_CLOCK_SKEW_SECS",
    )?;

    Ok(OidcConfig {
        issuer,
        audience,
        jwks_url,
        jwks_json,
        jwks_timeout: Duration::from_millis(jwks_timeout_ms),
        jwks_refresh_ttl: Duration::from_secs(jwks_refresh_ttl_secs),
        clock_skew: Duration::from_secs(clock_skew_secs),
        actor_id_claim,
        role_claim,
    })
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}
