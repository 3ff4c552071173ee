use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{info, warn};

/// A host tap device, optionally living inside a network namespace.
///
/// The device is deleted on [`Tap::delete`]; dropping a `Tap` leaves it in
/// place since the namespace teardown removes it anyway.
#[derive(Debug, Clone)]
pub struct Tap {
    name: String,
    netns: Option<String>,
}

impl Tap {
    /// Create `name`, assign `host_ip/netmask_len` and bring it up.
    pub async fn create(
        name: &str,
        netns: Option<&str>,
        host_ip: &str,
        netmask_len: u8,
    ) -> Result<Self> {
        let tap = Self {
            name: name.to_string(),
            netns: netns.map(String::from),
        };

        tap.ip(&["tuntap", "add", name, "mode", "tap"])
            .await
            .context("creating TAP device")?;
        let cidr = format!("{}/{}", host_ip, netmask_len);
        tap.ip(&["addr", "add", &cidr, "dev", name])
            .await
            .context("assigning TAP address")?;
        tap.ip(&["link", "set", name, "up"])
            .await
            .context("bringing up TAP device")?;

        info!(tap = name, netns = ?netns, address = %cidr, "created TAP device");
        Ok(tap)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn netns(&self) -> Option<&str> {
        self.netns.as_deref()
    }

    pub async fn delete(self) -> Result<()> {
        if let Err(e) = self.ip(&["link", "delete", &self.name]).await {
            warn!(tap = %self.name, error = %e, "failed to delete TAP device");
            return Err(e);
        }
        info!(tap = %self.name, "deleted TAP device");
        Ok(())
    }

    /// Run `ip <args>`, inside the namespace when one is set.
    async fn ip(&self, args: &[&str]) -> Result<()> {
        let mut cmd = match &self.netns {
            Some(ns) => {
                let mut c = Command::new("ip");
                c.args(["netns", "exec", ns, "ip"]);
                c
            }
            None => Command::new("ip"),
        };
        let output = cmd.args(args).output().await.context("running ip")?;
        if !output.status.success() {
            bail!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
