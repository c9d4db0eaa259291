use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::ConnectArgs;

/// Values from a config file. Each one set here replaces the matching
/// command-line value, whether it came from a flag or a default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub servers: Option<Vec<String>>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub login_timeout: Option<Duration>,
    pub channel_timeout: Option<Duration>,
    pub aes_key_timeout: Option<Duration>,
    pub substream_size: Option<u64>,
    pub cache_hash: Option<String>,
    pub os: Option<u32>,
    pub revision: Option<u32>,
    pub client_id: Option<u32>,
}

impl ConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.servers.is_none()
            && self.username.is_none()
            && self.password.is_none()
            && self.connect_timeout.is_none()
            && self.login_timeout.is_none()
            && self.channel_timeout.is_none()
            && self.aes_key_timeout.is_none()
            && self.substream_size.is_none()
            && self.cache_hash.is_none()
            && self.os.is_none()
            && self.revision.is_none()
            && self.client_id.is_none()
    }

    pub fn apply(&self, args: &mut ConnectArgs) {
        if let Some(servers) = self.servers.clone() {
            args.server = servers;
        }
        if let Some(username) = self.username.clone() {
            args.username = Some(username);
        }
        if let Some(password) = self.password.clone() {
            args.password = Some(password);
        }
        if let Some(timeout) = self.connect_timeout {
            args.connect_timeout = timeout;
        }
        if let Some(timeout) = self.login_timeout {
            args.login_timeout = timeout;
        }
        if let Some(timeout) = self.channel_timeout {
            args.channel_timeout = timeout;
        }
        if let Some(timeout) = self.aes_key_timeout {
            args.aes_key_timeout = timeout;
        }
        if let Some(size) = self.substream_size {
            args.substream_size = size;
        }
        if let Some(hash) = self.cache_hash.clone() {
            args.cache_hash = Some(hash);
        }
        if let Some(os) = self.os {
            args.os = os;
        }
        if let Some(revision) = self.revision {
            args.revision = revision;
        }
        if let Some(client_id) = self.client_id {
            args.client_id = client_id;
        }
    }
}

pub async fn load_overrides(path: &Path) -> Result<ConfigOverrides> {
    let source = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read client config {}", path.display()))?;
    parse_overrides(&source, path)
}

fn parse_overrides(source: &str, path: &Path) -> Result<ConfigOverrides> {
    let ext = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    let file: ClientFile = if ext.eq_ignore_ascii_case("json") {
        serde_json::from_str(source)
            .with_context(|| format!("client config {} is not valid JSON", path.display()))?
    } else {
        serde_yaml::from_str(source)
            .with_context(|| format!("client config {} is not valid YAML", path.display()))?
    };
    file.into_overrides()
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ClientFile {
    #[serde(default)]
    servers: Option<Vec<String>>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    connect_timeout: Option<String>,
    #[serde(default)]
    login_timeout: Option<String>,
    #[serde(default)]
    channel_timeout: Option<String>,
    #[serde(default)]
    aes_key_timeout: Option<String>,
    #[serde(default)]
    substream_size: Option<u64>,
    #[serde(default)]
    cache_hash: Option<String>,
    #[serde(default)]
    identity: Option<IdentityFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct IdentityFile {
    #[serde(default)]
    os: Option<u32>,
    #[serde(default)]
    revision: Option<u32>,
    #[serde(default)]
    client_id: Option<u32>,
}

impl ClientFile {
    fn into_overrides(self) -> Result<ConfigOverrides> {
        if let Some(servers) = &self.servers {
            if servers.is_empty() {
                bail!("client config lists no servers");
            }
        }
        if let Some(hash) = &self.cache_hash {
            if hash.len() != 40 || hex::decode(hash).is_err() {
                bail!("cache_hash must be 20 hex-encoded bytes");
            }
        }
        let identity = self.identity.unwrap_or_default();
        Ok(ConfigOverrides {
            servers: self.servers,
            username: self.username,
            password: self.password,
            connect_timeout: parse_duration(self.connect_timeout, "connect_timeout")?,
            login_timeout: parse_duration(self.login_timeout, "login_timeout")?,
            channel_timeout: parse_duration(self.channel_timeout, "channel_timeout")?,
            aes_key_timeout: parse_duration(self.aes_key_timeout, "aes_key_timeout")?,
            substream_size: self.substream_size,
            cache_hash: self.cache_hash,
            os: identity.os,
            revision: identity.revision,
            client_id: identity.client_id,
        })
    }
}

fn parse_duration(value: Option<String>, field: &str) -> Result<Option<Duration>> {
    value
        .map(|raw| {
            humantime::parse_duration(&raw)
                .with_context(|| format!("failed to parse {field} duration '{raw}'"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_yaml_config() {
        let config = r#"
servers: [ap1.example.invalid:4070, ap2.example.invalid:443]
username: listener
connect_timeout: 500ms
channel_timeout: 1m
substream_size: 40960
identity:
  revision: 99999
"#;
        let overrides = parse_overrides(config, Path::new("client.yaml")).expect("parse");
        assert_eq!(
            overrides.servers.as_deref(),
            Some(&["ap1.example.invalid:4070".to_string(), "ap2.example.invalid:443".to_string()][..])
        );
        assert_eq!(overrides.connect_timeout, Some(Duration::from_millis(500)));
        assert_eq!(overrides.channel_timeout, Some(Duration::from_secs(60)));
        assert_eq!(overrides.revision, Some(99_999));
        assert!(overrides.login_timeout.is_none());
        assert!(!overrides.is_empty());
    }

    #[test]
    fn parses_json_by_extension() {
        let overrides = parse_overrides(
            r#"{"password": "hunter2", "aes_key_timeout": "2s"}"#,
            Path::new("client.json"),
        )
        .expect("parse");
        assert_eq!(overrides.password.as_deref(), Some("hunter2"));
        assert_eq!(overrides.aes_key_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse_overrides("connect_timeout: soon", Path::new("c.yaml")).is_err());
        assert!(parse_overrides("cache_hash: abcd", Path::new("c.yaml")).is_err());
        assert!(parse_overrides("servers: []", Path::new("c.yaml")).is_err());
        assert!(parse_overrides("listen: 0.0.0.0:1", Path::new("c.yaml")).is_err());
    }

    #[test]
    fn apply_replaces_cli_defaults() {
        let cli = crate::Cli::parse_from(["tonearm", "login"]);
        let crate::Command::Login(mut args) = cli.command else {
            panic!("expected login");
        };
        let overrides = ConfigOverrides {
            servers: Some(vec!["10.0.0.1:4070".into()]),
            login_timeout: Some(Duration::from_secs(3)),
            client_id: Some(7),
            ..ConfigOverrides::default()
        };
        overrides.apply(&mut args.connect);
        assert_eq!(args.connect.server, vec!["10.0.0.1:4070".to_string()]);
        assert_eq!(args.connect.login_timeout, Duration::from_secs(3));
        assert_eq!(args.connect.client_id, 7);
        assert_eq!(args.connect.connect_timeout, Duration::from_secs(1));
    }

    #[test]
    fn config_file_wins_over_explicit_flags() {
        let cli = crate::Cli::parse_from([
            "tonearm",
            "login",
            "--username",
            "from-flag",
            "--channel-timeout",
            "30s",
            "--revision",
            "1",
        ]);
        let crate::Command::Login(mut args) = cli.command else {
            panic!("expected login");
        };
        let overrides = parse_overrides(
            "username: from-file\nchannel_timeout: 2s\n",
            Path::new("client.yaml"),
        )
        .expect("parse");
        overrides.apply(&mut args.connect);
        assert_eq!(args.connect.username.as_deref(), Some("from-file"));
        assert_eq!(args.connect.channel_timeout, Duration::from_secs(2));
        // Flags the file leaves out keep their value.
        assert_eq!(args.connect.revision, 1);
    }
}
