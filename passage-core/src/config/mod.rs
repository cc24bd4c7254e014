//! OpenSSH-style configuration store.
//!
//! Queries layer the user file over the system file over compiled defaults,
//! with OpenSSH first-obtained-wins semantics inside each file.

mod defaults;
mod secret;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::*;

pub use secret::SecretStore;

#[derive(Debug, Clone)]
struct ConfigEntry {
    key: String,
    value: String,
}

#[derive(Debug, Clone)]
struct HostBlock {
    patterns: Vec<String>,
    entries: Vec<ConfigEntry>,
}

#[derive(Debug, Default)]
pub struct ConfigFile {
    blocks: Vec<HostBlock>,
}

/// A materialised view of one configured alias, used by host listings and
/// destination prediction.
#[derive(Debug, Clone, Default)]
pub struct SshHost {
    pub alias: String,
    pub host: String,
    pub port: String,
    pub user: String,
    pub identity_file: String,
    pub proxy_command: String,
    pub proxy_jump: String,
    pub remote_command: String,
    pub group_labels: Vec<String>,
}

pub struct ConfigStore {
    /// Command-line `-o` overrides, consulted before either file.
    overrides: Vec<ConfigEntry>,
    user: ConfigFile,
    system: ConfigFile,
}

impl ConfigFile {
    /// Parses one file, following `Include` directives. A parse or read
    /// failure downgrades to a warning and the file counts as absent.
    fn load(path: &Path) -> Self {
        let mut file = ConfigFile::default();
        let mut visited = HashSet::new();
        file.load_into(path, &mut visited);
        file
    }

    fn load_into(&mut self, path: &Path, visited: &mut HashSet<PathBuf>) {
        if !visited.insert(path.to_path_buf()) {
            warn!(path = %path.display(), "circular Include, skipping");
            return;
        }
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) => {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), %error, "cannot read config file");
                }
                return;
            }
        };
        self.parse_into(&content, path.parent(), visited);
    }

    fn parse_into(&mut self, content: &str, base: Option<&Path>, visited: &mut HashSet<PathBuf>) {
        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = split_keyword(line) else {
                continue;
            };
            let key = key.to_lowercase();
            match key.as_str() {
                "host" => {
                    let patterns = value.split_whitespace().map(str::to_owned).collect();
                    self.blocks.push(HostBlock {
                        patterns,
                        entries: Vec::new(),
                    });
                }
                "include" => {
                    for part in value.split_whitespace() {
                        let included = resolve_include(part, base);
                        self.load_into(&included, visited);
                    }
                }
                _ => {
                    let entry = ConfigEntry {
                        key,
                        value: unquote(value).to_owned(),
                    };
                    match self.blocks.last_mut() {
                        Some(block) => block.entries.push(entry),
                        None => {
                            // Directives before the first Host line apply to
                            // every destination.
                            self.blocks.push(HostBlock {
                                patterns: vec!["*".to_owned()],
                                entries: vec![entry],
                            });
                        }
                    }
                }
            }
        }
    }

    fn matches<'a>(&'a self, alias: &str, key: &str) -> impl Iterator<Item = &'a str> + 'a {
        let key = key.to_lowercase();
        let alias = alias.to_owned();
        self.blocks
            .iter()
            .filter(move |block| block_matches(block, &alias))
            .flat_map(move |block| {
                let key = key.clone();
                block
                    .entries
                    .iter()
                    .filter(move |e| e.key == key)
                    .map(|e| e.value.as_str())
            })
    }

    fn first<'a>(&'a self, alias: &str, key: &str) -> Option<&'a str> {
        self.matches(alias, key).find(|v| !v.is_empty())
    }
}

fn block_matches(block: &HostBlock, alias: &str) -> bool {
    let mut matched = false;
    for pattern in &block.patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if pattern_matches(negated, alias) {
                return false;
            }
        } else if pattern_matches(pattern, alias) {
            matched = true;
        }
    }
    matched
}

/// OpenSSH glob: `*` and `?` only.
pub fn pattern_matches(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

fn split_keyword(line: &str) -> Option<(&str, &str)> {
    if let Some(idx) = line.find(|c: char| c == '=' || c.is_whitespace()) {
        let (key, rest) = line.split_at(idx);
        let rest = rest.trim_start_matches(|c: char| c == '=' || c.is_whitespace());
        if key.is_empty() {
            return None;
        }
        Some((key, rest.trim()))
    } else {
        None
    }
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn resolve_include(part: &str, base: Option<&Path>) -> PathBuf {
    let expanded = expand_tilde(part);
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        return path;
    }
    // Relative includes resolve against ~/.ssh, falling back to the
    // including file's directory.
    if let Some(home) = dirs::home_dir() {
        return home.join(".ssh").join(&path);
    }
    base.map(|b| b.join(&path)).unwrap_or(path)
}

pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_owned()
}

impl ConfigStore {
    pub fn load(user_path: &Path, system_path: &Path) -> Self {
        Self {
            overrides: Vec::new(),
            user: ConfigFile::load(user_path),
            system: ConfigFile::load(system_path),
        }
    }

    pub fn set_overrides(&mut self, pairs: &[(String, String)]) {
        self.overrides = pairs
            .iter()
            .map(|(key, value)| ConfigEntry {
                key: key.to_lowercase(),
                value: value.clone(),
            })
            .collect();
    }

    fn override_for(&self, key: &str) -> Option<&str> {
        let key = key.to_lowercase();
        self.overrides
            .iter()
            .find(|e| e.key == key && !e.value.is_empty())
            .map(|e| e.value.as_str())
    }

    pub fn default_user_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ssh")
            .join("config")
    }

    pub fn default_system_path() -> PathBuf {
        PathBuf::from("/etc/ssh/ssh_config")
    }

    /// First non-empty value: `-o` override, then the user file, then the
    /// system file, then the compiled default. Empty string when nowhere
    /// configured.
    pub fn get(&self, alias: &str, key: &str) -> String {
        self.override_for(key)
            .or_else(|| self.user.first(alias, key))
            .or_else(|| self.system.first(alias, key))
            .or_else(|| defaults::lookup(key))
            .unwrap_or("")
            .to_owned()
    }

    pub fn get_optional(&self, alias: &str, key: &str) -> Option<String> {
        let value = self.get(alias, key);
        (!value.is_empty()).then_some(value)
    }

    /// Every match: overrides, then both files, then the compiled default.
    pub fn get_all(&self, alias: &str, key: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .override_for(key)
            .into_iter()
            .chain(self.user.matches(alias, key))
            .chain(self.system.matches(alias, key))
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .collect();
        if let Some(default) = defaults::lookup(key) {
            out.push(default.to_owned());
        }
        out
    }

    pub fn get_splits(&self, alias: &str, key: &str) -> Vec<String> {
        split_value(&self.get(alias, key))
    }

    pub fn get_all_splits(&self, alias: &str, key: &str) -> Vec<String> {
        self.get_all(alias, key)
            .iter()
            .flat_map(|v| split_value(v))
            .collect()
    }

    /// All concrete (non-wildcard) aliases from both files, materialised.
    /// Wildcard patterns are reported by [`ConfigStore::wildcard_patterns`].
    pub fn enumerate_hosts(&self) -> Vec<SshHost> {
        let mut seen = HashSet::new();
        let mut hosts = Vec::new();
        for file in [&self.user, &self.system] {
            for block in &file.blocks {
                for pattern in &block.patterns {
                    if pattern.contains('*') || pattern.contains('?') || pattern.starts_with('!') {
                        continue;
                    }
                    if !seen.insert(pattern.clone()) {
                        continue;
                    }
                    hosts.push(self.materialise(pattern));
                }
            }
        }
        hosts
    }

    pub fn wildcard_patterns(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut patterns = Vec::new();
        for file in [&self.user, &self.system] {
            for block in &file.blocks {
                for pattern in &block.patterns {
                    if (pattern.contains('*') || pattern.contains('?'))
                        && !pattern.starts_with('!')
                        && seen.insert(pattern.clone())
                    {
                        patterns.push(pattern.clone());
                    }
                }
            }
        }
        patterns
    }

    fn materialise(&self, alias: &str) -> SshHost {
        SshHost {
            alias: alias.to_owned(),
            host: self.get(alias, "HostName"),
            port: self.get(alias, "Port"),
            user: self.get(alias, "User"),
            identity_file: self.get(alias, "IdentityFile"),
            proxy_command: self.get(alias, "ProxyCommand"),
            proxy_jump: self.get(alias, "ProxyJump"),
            remote_command: self.get(alias, "RemoteCommand"),
            group_labels: self.get_all_splits(alias, "GroupLabels"),
        }
    }
}

fn split_value(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    match shell_words::split(value) {
        Ok(parts) => parts,
        Err(error) => {
            warn!(%value, %error, "cannot split config value, using it verbatim");
            vec![value.to_owned()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> ConfigFile {
        let mut file = ConfigFile::default();
        file.parse_into(content, None, &mut HashSet::new());
        file
    }

    fn store(user: &str, system: &str) -> ConfigStore {
        ConfigStore {
            overrides: Vec::new(),
            user: parse(user),
            system: parse(system),
        }
    }

    #[test]
    fn test_first_obtained_wins() {
        let store = store(
            "Host web\n  Port 2022\nHost *\n  Port 2222\n  User fallback\n",
            "Host web\n  Port 3022\n",
        );
        assert_eq!(store.get("web", "Port"), "2022");
        assert_eq!(store.get("web", "User"), "fallback");
        assert_eq!(store.get("other", "Port"), "2222");
    }

    #[test]
    fn test_system_then_default() {
        let store = store("", "Host db\n  User admin\n");
        assert_eq!(store.get("db", "User"), "admin");
        // nothing configured anywhere: compiled default
        assert_eq!(store.get("db", "Port"), "22");
        assert_eq!(store.get("db", "ProxyCommand"), "");
    }

    #[test]
    fn test_get_all_layers() {
        let store = store(
            "Host a\n  IdentityFile ~/.ssh/one\nHost *\n  IdentityFile ~/.ssh/two\n",
            "Host a\n  IdentityFile ~/.ssh/three\n",
        );
        assert_eq!(
            store.get_all("a", "IdentityFile"),
            vec!["~/.ssh/one", "~/.ssh/two", "~/.ssh/three"]
        );
    }

    #[test]
    fn test_equals_syntax_and_quotes() {
        let file = parse("Host h\nProxyCommand=\"connect -H proxy\"\n");
        assert_eq!(
            file.first("h", "proxycommand"),
            Some("connect -H proxy")
        );
    }

    #[test]
    fn test_patterns() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("web-?", "web-1"));
        assert!(!pattern_matches("web-?", "web-10"));
        assert!(pattern_matches("*.example.com", "db.example.com"));
        assert!(!pattern_matches("*.example.com", "example.com"));
    }

    #[test]
    fn test_negated_pattern() {
        let store = store("Host * !secret\n  User everyone\n", "");
        assert_eq!(store.get("normal", "User"), "everyone");
        assert_eq!(store.get("secret", "User"), "");
    }

    #[test]
    fn test_global_entries_before_host() {
        let store = store("ServerAliveInterval 15\nHost x\n  Port 4022\n", "");
        assert_eq!(store.get("anything", "ServerAliveInterval"), "15");
        assert_eq!(store.get("x", "Port"), "4022");
    }

    #[test]
    fn test_enumerate_skips_wildcards() {
        let store = store(
            "Host web db\n  User u\nHost dev-*\n  User d\nHost web\n  Port 9\n",
            "",
        );
        let hosts = store.enumerate_hosts();
        let aliases: Vec<_> = hosts.iter().map(|h| h.alias.as_str()).collect();
        assert_eq!(aliases, vec!["web", "db"]);
        assert_eq!(store.wildcard_patterns(), vec!["dev-*"]);
    }

    #[test]
    fn test_splits() {
        let store = store("Host h\n  GroupLabels alpha beta\n", "");
        assert_eq!(store.get_splits("h", "GroupLabels"), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_overrides_win() {
        let mut store = store("Host h\n  Port 2022\n", "");
        store.set_overrides(&[("port".to_owned(), "7000".to_owned())]);
        assert_eq!(store.get("h", "Port"), "7000");
        assert_eq!(store.get_all("h", "Port"), vec!["7000", "2022", "22"]);
    }
}
