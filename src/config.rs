use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory under which local maildirs live
    pub maildir_root: String,
    /// Convert text/plain parts declared in a non-UTF-8 charset to UTF-8
    pub convert_charsets: bool,
    /// Directory used for temporary files during message rewrites
    pub tmp_dir: String,
    /// Directory where bodies of remote messages are cached
    pub cache_dir: String,
    /// Unix socket the IMAP proxy process listens on
    pub proxy_socket: String,
}

impl Default for Config {
    fn default() -> Self {
        let cache = dirs::cache_dir()
            .map(|p| p.join("maildeck").to_string_lossy().into_owned())
            .unwrap_or_else(|| "/tmp/maildeck".to_string());

        Self {
            maildir_root: shellexpand::tilde("~/Mail").into_owned(),
            convert_charsets: false,
            tmp_dir: "/tmp".to_string(),
            cache_dir: cache,
            proxy_socket: shellexpand::tilde("~/.imap.sock").into_owned(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let config_path = dirs::config_dir()
            .map(|p| p.join("maildeck/config.toml"))
            .unwrap_or_else(|| PathBuf::from("~/.config/maildeck/config.toml"));

        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => match toml::from_str::<Config>(&content) {
                    Ok(mut config) => {
                        config.expand_paths();
                        return config;
                    }
                    Err(e) => log::warn!("config parse error: {}", e),
                },
                Err(e) => log::warn!("config read error: {}", e),
            }
        }

        Self::default()
    }

    /// Expand `~` in every path-valued setting.
    fn expand_paths(&mut self) {
        self.maildir_root = shellexpand::tilde(&self.maildir_root).into_owned();
        self.tmp_dir = shellexpand::tilde(&self.tmp_dir).into_owned();
        self.cache_dir = shellexpand::tilde(&self.cache_dir).into_owned();
        self.proxy_socket = shellexpand::tilde(&self.proxy_socket).into_owned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(!config.convert_charsets);
        assert_eq!(config.tmp_dir, "/tmp");
        assert!(config.proxy_socket.ends_with(".imap.sock"));
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str("convert_charsets = true\n").unwrap();
        assert!(config.convert_charsets);
        assert_eq!(config.tmp_dir, "/tmp");
    }
}
