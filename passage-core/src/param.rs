/// Everything the login pipeline resolved about one destination hop. Built
/// once, immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct LoginParam {
    /// The alias the user asked for (`%n`).
    pub alias: String,
    /// The resolved host name or address (`%h`).
    pub host: String,
    /// The resolved port, kept textual for token expansion (`%p`).
    pub port: String,
    /// The resolved remote user (`%r`).
    pub user: String,
    /// ProxyJump hops, outermost first. Empty means a direct connection
    /// unless `proxy_command` is set.
    pub proxy_chain: Vec<String>,
    /// Tokenised ProxyCommand argv, when configured.
    pub proxy_command: Option<Vec<String>>,
}

impl LoginParam {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The hop this connection goes through (`%j`), when any.
    pub fn last_proxy(&self) -> Option<&str> {
        self.proxy_chain.last().map(String::as_str)
    }
}
