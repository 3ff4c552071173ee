//! Guest-side MMDS access.
//!
//! The metadata service is only reachable from inside the guest, so these
//! helpers build `curl` command lines and run them over ssh. MMDS V2 gates
//! every read behind a session token minted with a PUT.

use anyhow::{bail, Result};

use crate::ssh::SshConnection;

/// Default MMDS address inside the guest.
pub const DEFAULT_IPV4: &str = "169.254.169.254";

pub const TOKEN_PATH: &str = "/latest/api/token";
pub const TOKEN_TTL_HEADER: &str = "X-metadata-token-ttl-seconds";
pub const TOKEN_HEADER: &str = "X-metadata-token";

/// Route the MMDS address through `dev` (the guest has no default route to it).
pub fn route_cmd(ipv4: &str, dev: &str) -> String {
    format!("ip route add {} dev {}", ipv4, dev)
}

pub fn generate_token_cmd(ipv4: &str, ttl_secs: u32) -> String {
    format!(
        "curl -m 2 -s -X PUT http://{}{} -H \"{}: {}\"",
        ipv4, TOKEN_PATH, TOKEN_TTL_HEADER, ttl_secs
    )
}

/// GET `path`, with a V2 session token when given.
pub fn get_cmd(ipv4: &str, path: &str, token: Option<&str>, json: bool) -> String {
    let mut cmd = String::from("curl -m 2 -s");
    if let Some(token) = token {
        cmd.push_str(&format!(" -H \"{}: {}\"", TOKEN_HEADER, token));
    }
    if json {
        cmd.push_str(" -H \"Accept: application/json\"");
    }
    cmd.push_str(&format!(" http://{}/{}", ipv4, path.trim_start_matches('/')));
    cmd
}

/// Mint a session token from inside the guest.
pub async fn generate_token(ssh: &SshConnection, ipv4: &str, ttl_secs: u32) -> Result<String> {
    let out = ssh.execute_command(&generate_token_cmd(ipv4, ttl_secs)).await?;
    let token = out.stdout.trim();
    if out.exit_code != 0 || token.is_empty() {
        bail!(
            "minting MMDS token failed (exit {}): {}",
            out.exit_code,
            out.stderr.trim()
        );
    }
    Ok(token.to_string())
}

/// Read `path` from inside the guest and return the body as-is.
pub async fn get(ssh: &SshConnection, ipv4: &str, path: &str, token: Option<&str>) -> Result<String> {
    let out = ssh.execute_command(&get_cmd(ipv4, path, token, true)).await?;
    if out.exit_code != 0 {
        bail!("MMDS GET {} failed (exit {}): {}", path, out.exit_code, out.stderr.trim());
    }
    Ok(out.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_command() {
        assert_eq!(
            generate_token_cmd(DEFAULT_IPV4, 60),
            "curl -m 2 -s -X PUT http://169.254.169.254/latest/api/token -H \"X-metadata-token-ttl-seconds: 60\""
        );
    }

    #[test]
    fn test_get_command_with_token() {
        let cmd = get_cmd(DEFAULT_IPV4, "/latest/meta-data/ami-id", Some("abc"), true);
        assert!(cmd.contains("-H \"X-metadata-token: abc\""));
        assert!(cmd.contains("Accept: application/json"));
        assert!(cmd.ends_with("http://169.254.169.254/latest/meta-data/ami-id"));

        let plain = get_cmd("169.254.169.250", "latest", None, false);
        assert_eq!(plain, "curl -m 2 -s http://169.254.169.250/latest");
    }

    #[test]
    fn test_route_command() {
        assert_eq!(route_cmd(DEFAULT_IPV4, "eth0"), "ip route add 169.254.169.254 dev eth0");
    }
}
