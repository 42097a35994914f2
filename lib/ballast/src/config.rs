use crate::error::{ConfigError, Error, Result};
use crate::path;
use hashbrown::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub type ConfigMap = HashMap<String, String>;

/// Listen port used when `server.port` is absent.
pub const DEFAULT_PORT: u16 = 8080;

fn is_comment_or_blank(line: &str) -> bool {
    match line.trim_start().chars().next() {
        None => true,
        Some(ch) => ch == '#',
    }
}

/// Strips one pair of matching outer quotes, if present.
fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Parses line-oriented `key = value` text. `#` comments and blank lines
/// are allowed, surrounding whitespace is trimmed, paired outer quotes are
/// stripped from values, and duplicate keys are rejected.
pub fn parse_key_value(text: &str) -> Result<ConfigMap> {
    let mut cfg = ConfigMap::new();

    for line in text.lines() {
        if is_comment_or_blank(line) {
            continue;
        }

        let eq = match line.find('=') {
            Some(pos) => pos,
            None => return Err(Error::Config(ConfigError::MalformedLine)),
        };

        let key = line[..eq].trim();
        let value = strip_quotes(line[eq + 1..].trim());
        if key.is_empty() {
            return Err(Error::Config(ConfigError::EmptyKey));
        }

        if cfg.insert(key.to_owned(), value.to_owned()).is_some() {
            return Err(Error::Config(ConfigError::DuplicateKey));
        }
    }

    Ok(cfg)
}

pub fn load_key_value_file<P: AsRef<Path>>(path: P) -> Result<ConfigMap> {
    let text = match fs::read_to_string(path.as_ref()) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(Error::Config(ConfigError::FileNotFound));
        }
        Err(_) => return Err(Error::Config(ConfigError::ReadFailed)),
    };

    parse_key_value(&text)
}

pub fn require(cfg: &ConfigMap, key: &str) -> Result<String> {
    match cfg.get(key) {
        Some(value) => Ok(value.clone()),
        None => Err(Error::Config(ConfigError::MissingRequiredKey)),
    }
}

pub fn get_or(cfg: &ConfigMap, key: &str, fallback: &str) -> String {
    match cfg.get(key) {
        Some(value) => value.clone(),
        None => fallback.to_owned(),
    }
}

/// Database endpoint and credentials. The target fields come from
/// `config/server.conf`, the credentials from `.env`.
#[derive(Debug, Clone)]
pub struct DbTarget {
    pub host: String,
    pub port: String,
    pub name: String,
    pub user: String,
    pub password: String,
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db: DbTarget,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
}

impl ServerConfig {
    pub const CONF_FILE: &'static str = "config/server.conf";
    pub const ENV_FILE: &'static str = ".env";

    /// Loads and validates `config/server.conf` + `.env` under `root`.
    /// Unknown keys are preserved in the maps but ignored here.
    pub fn load(root: &Path) -> Result<ServerConfig> {
        let conf = load_key_value_file(root.join(Self::CONF_FILE))?;
        let env = load_key_value_file(root.join(Self::ENV_FILE))?;

        let port_text = get_or(&conf, "server.port", &DEFAULT_PORT.to_string());
        let port = port_text
            .parse::<u16>()
            .map_err(|_| Error::Config(ConfigError::MalformedLine))?;

        let db = DbTarget {
            host: require(&conf, "db.host")?,
            port: require(&conf, "db.port")?,
            name: require(&conf, "db.name")?,
            user: require(&env, "db.user")?,
            password: require(&env, "db.password")?,
        };

        let tls_cert = path::resolve_from_root(root, Path::new(&require(&conf, "tls.cert")?));
        let tls_key = path::resolve_from_root(root, Path::new(&require(&conf, "tls.key")?));

        Ok(ServerConfig {
            port,
            db,
            tls_cert,
            tls_key,
        })
    }
}
