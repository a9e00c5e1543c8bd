use std::env::VarError;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use derive_more::Display;
use rootcause::prelude::ResultExt;
use rootcause::{Report, bail, report};
use secrecy::SecretString;

pub const HOST_VAR: &str = "PDNSA_HOST";
pub const USER_VAR: &str = "PDNSA_USER";
pub const PASSWORD_VAR: &str = "PDNSA_PASSWORD";
pub const SCHEME_VAR: &str = "PDNSA_SCHEME";
pub const INSECURE_HTTPS_VAR: &str = "PDNSA_INSECURE_HTTPS";
pub const CA_CERT_VAR: &str = "PDNSA_CACERT";
pub const TIMEOUT_VAR: &str = "PDNSA_TIMEOUT_SECS";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Scheme {
    #[display("http")]
    Http,
    #[display("https")]
    Https,
}

impl FromStr for Scheme {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            _ => bail!("Scheme '{s}' is neither 'http' nor 'https'"),
        }
    }
}

/// Connection settings for a PowerDNS-Admin server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host and optional port, without scheme.
    pub host: String,
    pub user: String,
    pub password: SecretString,
    pub scheme: Scheme,
    pub insecure_https: bool,
    /// PEM content, or a path to a PEM file.
    pub ca_certificate: Option<String>,
    pub timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, Report> {
        Self::from_lookup(|var| std::env::var(var))
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Result<String, VarError>,
    ) -> Result<Self, Report> {
        ensure_vars(&lookup, &[HOST_VAR, USER_VAR, PASSWORD_VAR])?;

        let optional = |var: &str| lookup(var).ok().filter(|it| !it.is_empty());

        let host = lookup(HOST_VAR).context("PDNSA_HOST environment variable not set")?;
        let user = lookup(USER_VAR).context("PDNSA_USER environment variable not set")?;
        let password =
            lookup(PASSWORD_VAR).context("PDNSA_PASSWORD environment variable not set")?;

        let scheme = match optional(SCHEME_VAR) {
            Some(value) => value.parse::<Scheme>().attach(format!("variable: '{SCHEME_VAR}'"))?,
            None => Scheme::Http,
        };
        let insecure_https = match optional(INSECURE_HTTPS_VAR) {
            Some(value) => parse_bool(&value).attach(format!("variable: '{INSECURE_HTTPS_VAR}'"))?,
            None => false,
        };
        let timeout = match optional(TIMEOUT_VAR) {
            Some(value) => Duration::from_secs(
                value
                    .parse::<u64>()
                    .context("Timeout is not a whole number of seconds")
                    .attach(format!("variable: '{TIMEOUT_VAR}'"))?,
            ),
            None => DEFAULT_TIMEOUT,
        };

        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            user,
            password: SecretString::from(password),
            scheme,
            insecure_https,
            ca_certificate: optional(CA_CERT_VAR),
            timeout,
        })
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}/api/v1", self.scheme, self.host)
    }

    /// Resolves `ca_certificate` to PEM content, reading it from disk when it
    /// names an existing file.
    pub fn ca_certificate_pem(&self) -> Result<Option<String>, Report> {
        let Some(value) = &self.ca_certificate else {
            return Ok(None);
        };
        if !Path::new(value).is_file() {
            return Ok(Some(value.clone()));
        }
        let pem = std::fs::read_to_string(value)
            .context("Error reading CA certificate")
            .attach(format!("path: '{value}'"))?;
        Ok(Some(pem))
    }
}

fn ensure_vars(
    lookup: &impl Fn(&str) -> Result<String, VarError>,
    vars: &[&str],
) -> Result<(), Report> {
    let mut error = report!("Missing required environment variable");
    let mut is_error = false;
    for var in vars {
        match lookup(var) {
            Ok(value) if !value.is_empty() => continue,
            Ok(_) | Err(VarError::NotPresent) => {
                error = error.attach(format!("'{}' is not set", var));
                is_error = true;
            }
            Err(VarError::NotUnicode(e)) => {
                error = error.attach(format!("'{}' is not valid unicode: '{}'", var, e.display()));
                is_error = true;
            }
        }
    }
    if is_error { Err(error) } else { Ok(()) }
}

fn parse_bool(value: &str) -> Result<bool, Report> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => bail!("'{value}' is not a boolean"),
    }
}
