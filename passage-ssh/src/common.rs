use std::fmt::{Display, Formatter};

/// User-supplied options the engine consumes, merged with config lookups in
/// the orchestrator. Immutable once built by the CLI layer.
#[derive(Debug, Clone, Default)]
pub struct SshArgs {
    pub destination: String,
    pub port: Option<u16>,
    pub login_name: Option<String>,
    pub identities: Vec<String>,
    pub config_file: Option<String>,
    pub proxy_jump: Option<String>,
    pub options: Vec<(String, String)>,
    pub local_forwards: Vec<String>,
    pub remote_forwards: Vec<String>,
    pub dynamic_forwards: Vec<String>,
    pub stdio_forward: Option<String>,
    pub forward_agent: bool,
    pub no_forward_agent: bool,
    pub forward_x11: bool,
    pub no_forward_x11: bool,
    pub trusted_x11: bool,
    pub force_tty: bool,
    pub disable_tty: bool,
    pub no_command: bool,
    pub background: bool,
    pub gateway_ports: bool,
    pub ipv4_only: bool,
    pub ipv6_only: bool,
    pub ciphers: Option<String>,
    pub command: Vec<String>,
}

impl SshArgs {
    /// `-o Key=Value` overrides, checked before any config file.
    pub fn option(&self, key: &str) -> Option<&str> {
        let key = key.to_lowercase();
        self.options
            .iter()
            .find(|(k, _)| k.to_lowercase() == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct DirectTcpIpParams {
    pub host_to_connect: String,
    pub port_to_connect: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

#[derive(Clone, Debug)]
pub struct ForwardedTcpIpParams {
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

impl Display for ForwardedTcpIpParams {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} (from {}:{})",
            self.connected_address, self.connected_port, self.originator_address, self.originator_port
        )
    }
}

#[derive(Clone, Debug)]
pub struct ForwardedStreamlocalParams {
    pub socket_path: String,
}

/// How the session channel should be driven once the connection is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    /// Interactive shell or remote command.
    Command(Option<String>),
    /// `-N`: forwarding only.
    None,
    /// `-W host:port`: splice the destination to stdio.
    StdioForward(String, u32),
}
