// Connection descriptor handling shared by enumeration and the dump tools.
use url::{Host, Url};

use crate::errors::ConfigError;

const SCHEME: &str = "postgresql://";

/// Adds the `postgresql://` scheme when the DSN has none.
pub fn normalize_dsn(dsn: &str) -> String {
    if dsn.starts_with(SCHEME) || dsn.starts_with("postgres://") {
        dsn.to_string()
    } else {
        format!("{SCHEME}{dsn}")
    }
}

pub fn parse_dsn(dsn: &str) -> Result<Url, ConfigError> {
    let normalized = normalize_dsn(dsn);
    Url::parse(&normalized).map_err(|source| ConfigError::Dsn {
        dsn: dsn.to_string(),
        source,
    })
}

/// Host and credentials of a client/server database, extracted once from the DSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Endpoint {
    pub fn from_dsn(dsn: &str) -> Result<Self, ConfigError> {
        let url = parse_dsn(dsn)?;
        let host = match url.host() {
            Some(Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => {
                return Err(ConfigError::Invalid(format!(
                    "DSN {dsn:?} does not name a host"
                )));
            }
        };
        // `Url` hands back userinfo still percent-encoded.
        let user = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(|u| decode_userinfo("user", u))
            .transpose()?;
        let password = url
            .password()
            .map(|p| decode_userinfo("password", p))
            .transpose()?;

        Ok(Self {
            host,
            port: url.port(),
            user,
            password,
        })
    }
}

fn decode_userinfo(part: &str, encoded: &str) -> Result<String, ConfigError> {
    urlencoding::decode(encoded)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| ConfigError::Invalid(format!("DSN {part} is not valid UTF-8: {e}")))
}
