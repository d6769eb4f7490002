//! Address parsing helpers shared by both binaries (spec §9 "Shared utilities").

/// Join a bind address and a port the way `net.JoinHostPort` does in the
/// original source, handling bare IPv6 addresses.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
