//! Compiled configuration defaults, consulted after the user and system
//! files. Keys are stored lowercase.

const DEFAULTS: &[(&str, &str)] = &[
    ("port", "22"),
    ("connecttimeout", "10"),
    ("serveraliveinterval", "10"),
    ("serveralivecountmax", "3"),
    ("stricthostkeychecking", "ask"),
    ("userknownhostsfile", "~/.ssh/known_hosts ~/.ssh/known_hosts2"),
    ("globalknownhostsfile", "/etc/ssh/ssh_known_hosts /etc/ssh/ssh_known_hosts2"),
    ("pubkeyauthentication", "yes"),
    ("passwordauthentication", "yes"),
    ("kbdinteractiveauthentication", "yes"),
    ("identitiesonly", "no"),
    ("forwardagent", "no"),
    ("forwardx11", "no"),
    ("forwardx11trusted", "no"),
    ("forwardx11timeout", "1200"),
    ("forwardudptimeout", "300"),
    ("xauthlocation", "xauth"),
    ("gatewayports", "no"),
    ("exitonforwardfailure", "no"),
    ("clearallforwardings", "no"),
    ("permitlocalcommand", "no"),
    ("requesttty", "auto"),
    ("controlmaster", "no"),
    ("expecttimeout", "30"),
    ("ctrlexpecttimeout", "30"),
];

pub(super) fn lookup(key: &str) -> Option<&'static str> {
    let key = key.to_lowercase();
    DEFAULTS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
}
