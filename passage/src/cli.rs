use clap::{ArgAction, Parser};
use passage_ssh::{SessionMode, SshArgs};

/// The `ssh(1)`-shaped surface the engine expects.
#[derive(Parser, Debug)]
#[command(
    name = "passage",
    version,
    about = "An SSH client with a multi-channel forwarding engine",
    disable_help_flag = false
)]
pub struct Cli {
    /// Port to connect to on the remote host
    #[arg(short = 'p')]
    pub port: Option<u16>,

    /// Login name
    #[arg(short = 'l')]
    pub login_name: Option<String>,

    /// Identity (private key) file, repeatable
    #[arg(short = 'i')]
    pub identity: Vec<String>,

    /// Per-user configuration file
    #[arg(short = 'F')]
    pub config: Option<String>,

    /// Jump hosts, comma separated
    #[arg(short = 'J')]
    pub jump: Option<String>,

    /// Override a configuration option (Key=Value), repeatable
    #[arg(short = 'o')]
    pub option: Vec<String>,

    /// Local forwarding specification, repeatable
    #[arg(short = 'L')]
    pub local_forward: Vec<String>,

    /// Remote forwarding specification, repeatable
    #[arg(short = 'R')]
    pub remote_forward: Vec<String>,

    /// Dynamic (SOCKS5) forwarding specification, repeatable
    #[arg(short = 'D')]
    pub dynamic_forward: Vec<String>,

    /// Forward stdio to the given host:port over the tunnel
    #[arg(short = 'W')]
    pub stdio_forward: Option<String>,

    /// Enable authentication agent forwarding
    #[arg(short = 'A')]
    pub forward_agent: bool,

    /// Disable authentication agent forwarding
    #[arg(short = 'a')]
    pub no_forward_agent: bool,

    /// Enable X11 forwarding
    #[arg(short = 'X')]
    pub forward_x11: bool,

    /// Disable X11 forwarding
    #[arg(short = 'x')]
    pub no_forward_x11: bool,

    /// Enable trusted X11 forwarding
    #[arg(short = 'Y')]
    pub trusted_x11: bool,

    /// Disable pseudo-terminal allocation
    #[arg(short = 'T')]
    pub disable_tty: bool,

    /// Force pseudo-terminal allocation
    #[arg(short = 't')]
    pub force_tty: bool,

    /// Do not execute a remote command
    #[arg(short = 'N')]
    pub no_command: bool,

    /// Go to background after authentication
    #[arg(short = 'f')]
    pub background: bool,

    /// Allow remote hosts to connect to forwarded ports
    #[arg(short = 'g')]
    pub gateway_ports: bool,

    /// Use IPv4 addresses only
    #[arg(short = '4')]
    pub ipv4_only: bool,

    /// Use IPv6 addresses only
    #[arg(short = '6')]
    pub ipv6_only: bool,

    /// Cipher specification
    #[arg(short = 'c')]
    pub ciphers: Option<String>,

    /// Increase verbosity, repeatable
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Destination: [user@]host[:port]
    pub destination: String,

    /// Remote command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    pub fn to_ssh_args(&self) -> SshArgs {
        SshArgs {
            destination: self.destination.clone(),
            port: self.port,
            login_name: self.login_name.clone(),
            identities: self.identity.clone(),
            config_file: self.config.clone(),
            proxy_jump: self.jump.clone(),
            options: self.option.iter().map(|o| parse_option(o)).collect(),
            local_forwards: self.local_forward.clone(),
            remote_forwards: self.remote_forward.clone(),
            dynamic_forwards: self.dynamic_forward.clone(),
            stdio_forward: self.stdio_forward.clone(),
            forward_agent: self.forward_agent,
            no_forward_agent: self.no_forward_agent,
            forward_x11: self.forward_x11,
            no_forward_x11: self.no_forward_x11,
            trusted_x11: self.trusted_x11,
            force_tty: self.force_tty,
            disable_tty: self.disable_tty,
            no_command: self.no_command,
            background: self.background,
            gateway_ports: self.gateway_ports,
            ipv4_only: self.ipv4_only,
            ipv6_only: self.ipv6_only,
            ciphers: self.ciphers.clone(),
            command: self.command.clone(),
        }
    }

    pub fn session_mode(&self) -> Result<SessionMode, String> {
        if let Some(target) = &self.stdio_forward {
            let (host, port) = target
                .rsplit_once(':')
                .ok_or_else(|| format!("invalid -W target \"{target}\""))?;
            let port: u32 = port
                .parse()
                .map_err(|_| format!("invalid -W target \"{target}\""))?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            return Ok(SessionMode::StdioForward(host.to_owned(), port));
        }
        if self.no_command {
            return Ok(SessionMode::None);
        }
        if self.command.is_empty() {
            Ok(SessionMode::Command(None))
        } else {
            Ok(SessionMode::Command(Some(self.command.join(" "))))
        }
    }
}

/// `-o Key=Value` and `-o "Key Value"` both work, as in ssh(1).
fn parse_option(option: &str) -> (String, String) {
    if let Some((key, value)) = option.split_once('=') {
        return (key.trim().to_owned(), value.trim().to_owned());
    }
    match option.split_once(char::is_whitespace) {
        Some((key, value)) => (key.trim().to_owned(), value.trim().to_owned()),
        None => (option.trim().to_owned(), String::new()),
    }
}
