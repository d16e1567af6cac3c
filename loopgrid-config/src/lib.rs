//! Configuration management for Loopgrid services
//!
//! The interconnect node reads one JSON document (see the `interconnect`
//! block below) merged with `LOOPGRID_*` environment overrides. Defaults
//! are filled in during validation so the rest of the system never sees a
//! zeroed limit.

use loopgrid_types::Endpoint;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default client reconnect interval (100 ms)
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(100);
/// Default STUN keepalive trigger (300 s)
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(300);
/// Default SRTP profile list offered in the DTLS use_srtp extension
pub const DEFAULT_SRTP_PROFILES: &str = "SRTP_AES128_CM_SHA1_80:SRTP_AES128_CM_SHA1_32";
/// Default number of cookie keys in the DTLS keyset
pub const DEFAULT_COOKIE_KEYS_QUANTITY: usize = 10;
/// Default length of one cookie key in bytes
pub const DEFAULT_COOKIE_KEYS_LENGTH: usize = 20;
/// Default cookie keyset lifetime (300 s)
pub const DEFAULT_COOKIE_KEYS_LIFETIME: Duration = Duration::from_secs(300);
/// Upper bound a DTLS cookie key may have
pub const DTLS_COOKIE_MAX: usize = 255;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing configuration value: {0}")]
    Missing(&'static str),

    #[error("Unreadable path for {what}: {path}: {source}")]
    Unreadable {
        what: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration value for {0}: {1}")]
    Invalid(&'static str, String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Socket layout of one interconnect node
#[derive(Debug, Clone, Deserialize)]
pub struct SocketLayout {
    /// Active (connecting) side when true, listening side otherwise
    #[serde(default)]
    pub client: bool,
    /// Signaling channel (TLS)
    pub signaling: Endpoint,
    /// Shared media socket (UDP)
    pub media: Endpoint,
    /// Mixer listener (TLS)
    pub mixer: Endpoint,
    /// Loopback host the loop receive sockets bind on
    pub internal: Endpoint,
}

/// CA material for certificate verification
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CaConfig {
    /// Path to a CA bundle file
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Path to a CA directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// TLS client settings for the active signaling side
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsClientConfig {
    /// Hostname presented during the handshake
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub ca: CaConfig,
}

/// DTLS cookie keyset settings
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CookieKeysConfig {
    /// Number of keys in the set
    #[serde(default)]
    pub quantity: usize,
    /// Length of one key in bytes, capped at [`DTLS_COOKIE_MAX`]
    #[serde(default)]
    pub length: usize,
    /// Keyset lifetime in seconds; the set is regenerated on expiry
    #[serde(default)]
    pub lifetime: u64,
}

/// SRTP section of the DTLS configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SrtpSection {
    #[serde(default)]
    pub profile: Option<String>,
}

/// DTLS server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DtlsConfig {
    /// Certificate chain (PEM)
    pub certificate: PathBuf,
    /// Private key (PEM)
    pub key: PathBuf,
    #[serde(default)]
    pub ca: CaConfig,
    #[serde(default)]
    pub srtp: SrtpSection,
    #[serde(default)]
    pub keys: CookieKeysConfig,
}

impl DtlsConfig {
    /// Profile list for the use_srtp extension
    pub fn srtp_profiles(&self) -> &str {
        self.srtp.profile.as_deref().unwrap_or(DEFAULT_SRTP_PROFILES)
    }

    /// Cookie keyset quantity with the default applied
    pub fn cookie_quantity(&self) -> usize {
        if self.keys.quantity == 0 {
            DEFAULT_COOKIE_KEYS_QUANTITY
        } else {
            self.keys.quantity
        }
    }

    /// Cookie key length with default and cap applied
    pub fn cookie_length(&self) -> usize {
        let length = if self.keys.length == 0 {
            DEFAULT_COOKIE_KEYS_LENGTH
        } else {
            self.keys.length
        };
        length.min(DTLS_COOKIE_MAX)
    }

    /// Cookie keyset lifetime with the default applied
    pub fn cookie_lifetime(&self) -> Duration {
        if self.keys.lifetime == 0 {
            DEFAULT_COOKIE_KEYS_LIFETIME
        } else {
            Duration::from_secs(self.keys.lifetime)
        }
    }
}

/// TLS settings for the control channels
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Server certificate store for the listeners
    #[serde(default)]
    pub domains: Option<PathBuf>,
    #[serde(default)]
    pub client: TlsClientConfig,
    /// DTLS settings for the media path
    pub dtls: DtlsConfig,
}

/// Timer limits
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Limits {
    /// Signaling client reconnect interval in seconds (0 selects the default)
    #[serde(default)]
    pub reconnect_interval_secs: f64,
    /// STUN keepalive trigger in seconds (0 selects the default)
    #[serde(default)]
    pub keepalive_sec: u64,
}

impl Limits {
    pub fn reconnect_interval(&self) -> Duration {
        if self.reconnect_interval_secs <= 0.0 {
            DEFAULT_RECONNECT_INTERVAL
        } else {
            Duration::from_secs_f64(self.reconnect_interval_secs)
        }
    }

    pub fn keepalive(&self) -> Duration {
        if self.keepalive_sec == 0 {
            DEFAULT_KEEPALIVE
        } else {
            Duration::from_secs(self.keepalive_sec)
        }
    }
}

/// The `interconnect` block of the node configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InterconnectConfig {
    /// Local identity on the signaling wire
    pub name: String,
    /// Shared secret checked by `register`
    pub password: String,
    pub socket: SocketLayout,
    pub tls: TlsConfig,
    #[serde(default)]
    pub limits: Limits,
    /// Loop name to multicast endpoint
    #[serde(default)]
    pub loops: BTreeMap<String, Endpoint>,
    /// Opaque block pushed to mixers in the `configure` answer
    #[serde(default)]
    pub mixer: serde_json::Value,
}

impl InterconnectConfig {
    /// Check invariants the rest of the node relies on.
    ///
    /// Name and password must be non-empty, all three socket endpoints must
    /// be set and the DTLS key material must be readable. Unreadable
    /// certificate or key paths are fatal here rather than at handshake
    /// time.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ConfigError::Missing("interconnect.name"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Missing("interconnect.password"));
        }
        if !self.socket.signaling.is_set() {
            return Err(ConfigError::Missing("interconnect.socket.signaling"));
        }
        if !self.socket.media.is_set() {
            return Err(ConfigError::Missing("interconnect.socket.media"));
        }
        if !self.socket.mixer.is_set() {
            return Err(ConfigError::Missing("interconnect.socket.mixer"));
        }
        if self.socket.internal.host.is_empty() {
            return Err(ConfigError::Missing("interconnect.socket.internal"));
        }

        check_readable("dtls certificate", &self.tls.dtls.certificate)?;
        check_readable("dtls key", &self.tls.dtls.key)?;
        if let Some(ref file) = self.tls.dtls.ca.file {
            check_readable("dtls ca file", file)?;
        }
        if let Some(ref path) = self.tls.dtls.ca.path {
            if !path.is_dir() {
                return Err(ConfigError::Invalid(
                    "dtls ca path",
                    format!("{} is not a directory", path.display()),
                ));
            }
        }

        Ok(())
    }
}

fn check_readable(what: &'static str, path: &Path) -> Result<()> {
    std::fs::metadata(path)
        .map(|_| ())
        .map_err(|source| ConfigError::Unreadable {
            what,
            path: path.to_path_buf(),
            source,
        })
}

/// Top level application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub interconnect: InterconnectConfig,
}

impl AppConfig {
    /// Load from a JSON file merged with `LOOPGRID_*` environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        // Pick up a .env file when present
        let _ = dotenvy::dotenv();

        let loaded = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("LOOPGRID")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app: AppConfig = loaded.try_deserialize()?;
        app.interconnect.validate()?;
        Ok(app)
    }

    /// Parse from a JSON string without validation, for tests and tooling
    pub fn from_json(input: &str) -> Result<Self> {
        serde_json::from_str(input)
            .map_err(|e| ConfigError::Invalid("json", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample(cert: &str, key: &str) -> String {
        format!(
            r#"{{
              "interconnect": {{
                "name": "site1",
                "password": "shared-secret",
                "socket": {{
                  "client": true,
                  "signaling": {{"host": "10.0.0.2", "port": 12345, "type": "TLS"}},
                  "media": {{"host": "10.0.0.1", "port": 40000, "type": "UDP"}},
                  "mixer": {{"host": "127.0.0.1", "port": 12346, "type": "TLS"}},
                  "internal": {{"host": "127.0.0.1", "port": 0}}
                }},
                "tls": {{
                  "client": {{"domain": "site2.example.org"}},
                  "dtls": {{
                    "certificate": "{cert}",
                    "key": "{key}",
                    "keys": {{"quantity": 4, "length": 300, "lifetime": 60}}
                  }}
                }},
                "limits": {{"reconnect_interval_secs": 0.25, "keepalive_sec": 0}},
                "loops": {{
                  "alpha": {{"host": "224.0.0.7", "port": 5000}},
                  "beta": {{"host": "224.0.0.8", "port": 5002}}
                }}
              }}
            }}"#
        )
    }

    fn write_dummy(dir: &tempfile::TempDir, name: &str) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "dummy pem material").unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_parse_full_document() {
        let dir = tempfile::tempdir().unwrap();
        let cert = write_dummy(&dir, "cert.pem");
        let key = write_dummy(&dir, "key.pem");

        let app = AppConfig::from_json(&sample(&cert, &key)).unwrap();
        let ic = &app.interconnect;

        assert_eq!(ic.name, "site1");
        assert!(ic.socket.client);
        assert_eq!(ic.socket.signaling.port, 12345);
        assert_eq!(ic.loops.len(), 2);
        assert_eq!(ic.loops["alpha"].host, "224.0.0.7");
        assert_eq!(
            ic.limits.reconnect_interval(),
            Duration::from_millis(250)
        );
        // zero selects the default
        assert_eq!(ic.limits.keepalive(), DEFAULT_KEEPALIVE);
        ic.validate().unwrap();
    }

    #[test]
    fn test_cookie_defaults_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let cert = write_dummy(&dir, "cert.pem");
        let key = write_dummy(&dir, "key.pem");

        let app = AppConfig::from_json(&sample(&cert, &key)).unwrap();
        let dtls = &app.interconnect.tls.dtls;

        assert_eq!(dtls.cookie_quantity(), 4);
        // configured 300 is capped at the DTLS cookie maximum
        assert_eq!(dtls.cookie_length(), DTLS_COOKIE_MAX);
        assert_eq!(dtls.cookie_lifetime(), Duration::from_secs(60));
        assert_eq!(dtls.srtp_profiles(), DEFAULT_SRTP_PROFILES);
    }

    #[test]
    fn test_missing_password_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = write_dummy(&dir, "cert.pem");
        let key = write_dummy(&dir, "key.pem");

        let doc = sample(&cert, &key).replace("shared-secret", "");
        let app = AppConfig::from_json(&doc).unwrap();
        assert!(matches!(
            app.interconnect.validate(),
            Err(ConfigError::Missing("interconnect.password"))
        ));
    }

    #[test]
    fn test_unreadable_certificate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key = write_dummy(&dir, "key.pem");

        let doc = sample("/nonexistent/cert.pem", &key);
        let app = AppConfig::from_json(&doc).unwrap();
        assert!(matches!(
            app.interconnect.validate(),
            Err(ConfigError::Unreadable { what: "dtls certificate", .. })
        ));
    }
}
