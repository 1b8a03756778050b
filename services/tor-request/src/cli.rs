//! Command-line arguments and target normalisation

use reqwest::Url;

use crate::error::{Error, Result};

pub const USAGE: &str = "\
Usage: tor-request [--config PATH] [--json-logs] <target> [count]

  <target>   domain or http(s) URL to request, e.g. example.com
  [count]    number of requests to send (default 1)

Options:
  --config PATH   config file (default: $CONFIG_PATH or tor-request.toml)
  --json-logs     emit logs as JSON on stderr (also LOG_FORMAT=json)";

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    pub config_path: Option<String>,
    pub json_logs: bool,
    /// Normalised target URL
    pub target: String,
    pub count: usize,
}

impl Cli {
    /// Parse arguments, excluding the program name.
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut config_path = None;
        let mut json_logs = false;
        let mut positional = Vec::new();

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--config" => {
                    let path = iter
                        .next()
                        .ok_or_else(|| Error::Usage("--config requires a path".into()))?;
                    config_path = Some(path.clone());
                }
                "--json-logs" => json_logs = true,
                flag if flag.starts_with("--") => {
                    return Err(Error::Usage(format!("unknown option {flag}")));
                }
                _ => positional.push(arg.as_str()),
            }
        }

        let (target, count) = match positional.as_slice() {
            [target] => (*target, None),
            [target, count] => (*target, Some(*count)),
            [] => return Err(Error::Usage("missing target".into())),
            _ => return Err(Error::Usage("too many arguments".into())),
        };

        Ok(Self {
            config_path,
            json_logs,
            target: normalize_target(target)?,
            count: parse_count(count)?,
        })
    }
}

/// Turn user input into a full URL.
///
/// Input without a scheme gets `https://`. The host must contain a dot,
/// so bare words and `localhost` are rejected.
pub fn normalize_target(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidTarget(raw.to_string()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let url = Url::parse(&candidate).map_err(|_| Error::InvalidTarget(raw.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::InvalidTarget(raw.to_string()));
    }
    match url.host_str() {
        Some(host) if host.contains('.') => Ok(url.to_string()),
        _ => Err(Error::InvalidTarget(raw.to_string())),
    }
}

/// Request count, defaulting to 1.
pub fn parse_count(raw: Option<&str>) -> Result<usize> {
    let Some(raw) = raw else {
        return Ok(1);
    };
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::InvalidCount(raw.to_string())),
    }
}
