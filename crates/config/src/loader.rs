use std::path::{Path, PathBuf};

use {anyhow::Context, tracing::debug};

use crate::{env_subst::substitute_env, schema::ServerConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["ferry.toml", "ferry.yaml", "ferry.yml", "ferry.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<ServerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let raw = substitute_env(&raw);
    let config =
        parse_config(&raw, path).with_context(|| format!("failed to parse {}", path.display()))?;
    debug!(path = %path.display(), ports = ?config.ports, "loaded config");
    Ok(config)
}

/// Find the first config file in standard locations.
///
/// Search order:
/// 1. `./ferry.{toml,yaml,yml,json}`
/// 2. `~/.config/ferry/ferry.{toml,yaml,yml,json}`
pub fn find_config_file() -> Option<PathBuf> {
    let mut dirs = vec![PathBuf::from(".")];
    dirs.extend(config_dir());
    find_config_file_in(&dirs)
}

/// First existing standard config file in `dirs`.
pub fn find_config_file_in(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)))
        .find(|p| p.exists())
}

/// `~/.config/ferry/` on all platforms.
pub fn config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("ferry"))
}

/// Render a config as TOML, e.g. to seed a new config file.
pub fn to_toml(config: &ServerConfig) -> anyhow::Result<String> {
    toml::to_string_pretty(config).context("serialize config")
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<ServerConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    #[test]
    fn loads_toml_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.toml");
        std::fs::write(
            &path,
            r#"
app_name = "arith"
ports = ["20000", "20001"]
fail_fast_timeout = "5s"

[session]
compress_encoding = true
tcp_read_timeout = "250ms"

[registry]
type = "etcd"
addr = "127.0.0.1:2379"
"#,
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.app_name, "arith");
        assert_eq!(cfg.ports, vec!["20000", "20001"]);
        assert_eq!(cfg.fail_fast_timeout, Duration::from_secs(5));
        assert!(cfg.session.compress_encoding);
        assert_eq!(cfg.session.tcp_read_timeout, Duration::from_millis(250));
        // untouched keys keep their defaults
        assert_eq!(cfg.session.write_queue_len, 512);
        assert_eq!(cfg.registry.kind, "etcd");
        assert_eq!(cfg.registry.root, "/ferry");
    }

    #[test]
    fn loads_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("ferry.yaml");
        std::fs::write(&yaml, "host: 0.0.0.0\nports: ['1']\ncodec_type: postcard\n").unwrap();
        let cfg = load_config(&yaml).unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.codec_type, "postcard");

        let json = dir.path().join("ferry.json");
        std::fs::write(&json, r#"{"ports":["2","3"],"session_number":5}"#).unwrap();
        let cfg = load_config(&json).unwrap();
        assert_eq!(cfg.ports.len(), 2);
        assert_eq!(cfg.session_number, 5);
    }

    #[test]
    fn unknown_extension_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.ini");
        std::fs::write(&path, "ports=1").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("unsupported config format: .ini"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_config(Path::new("/definitely/not/here/ferry.toml")).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here/ferry.toml"));
    }

    #[test]
    fn finds_first_standard_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ferry.json"), "{}").unwrap();
        std::fs::write(dir.path().join("ferry.yaml"), "{}").unwrap();
        let found = find_config_file_in(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(found.file_name().unwrap(), "ferry.yaml");
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let rendered = to_toml(&ServerConfig::default()).unwrap();
        let back: ServerConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(back.session, ServerConfig::default().session);
        assert_eq!(back.fail_fast_timeout, Duration::from_secs(3));
    }
}
