use anyhow::Result;

use crate::config::HarnessConfig;

pub async fn cmd_host(config: &HarnessConfig) -> Result<()> {
    let host = &config.host;
    println!("arch:            {}", host.arch);
    println!("cpu vendor:      {:?}", host.cpu_vendor);
    println!("cpu model:       {}", host.cpu_model);
    println!("host kernel:     {}", host.host_kernel);
    let templates = if host.supported_cpu_templates.is_empty() {
        "none".to_string()
    } else {
        host.supported_cpu_templates.join(", ")
    };
    println!("cpu templates:   {}", templates);
    println!();
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
