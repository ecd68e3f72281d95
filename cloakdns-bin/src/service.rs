//! System-service control.
//!
//! Thin wrapper around systemd: `--service install` writes a unit file
//! pointing at this executable and the given configuration, the other
//! actions shell out to `systemctl`.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;

const SERVICE_NAME: &str = "cloakdns";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServiceAction {
    Install,
    Uninstall,
    Start,
    Stop,
    Restart,
}

pub fn control(action: ServiceAction, config_path: &str) -> Result<()> {
    if !cfg!(target_os = "linux") {
        bail!("service control is only supported via systemd on Linux");
    }
    match action {
        ServiceAction::Install => install(config_path),
        ServiceAction::Uninstall => uninstall(),
        ServiceAction::Start => systemctl("start"),
        ServiceAction::Stop => systemctl("stop"),
        ServiceAction::Restart => systemctl("restart"),
    }
}

fn unit_path() -> String {
    format!("/etc/systemd/system/{SERVICE_NAME}.service")
}

fn install(config_path: &str) -> Result<()> {
    let exe = std::env::current_exe().context("cannot determine executable path")?;
    let config = Path::new(config_path)
        .canonicalize()
        .with_context(|| format!("cannot resolve configuration path [{config_path}]"))?;

    let unit = format!(
        "[Unit]\n\
         Description=cloakdns DNS proxy\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=notify\n\
         ExecStart={} --config {}\n\
         Restart=on-failure\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        exe.display(),
        config.display()
    );
    std::fs::write(unit_path(), unit).context("cannot write systemd unit")?;
    systemctl("daemon-reload")?;
    run_systemctl(&["enable", SERVICE_NAME])?;
    println!("Installed as a service. Use `--service start` to start");
    Ok(())
}

fn uninstall() -> Result<()> {
    let _ = run_systemctl(&["disable", SERVICE_NAME]);
    std::fs::remove_file(unit_path()).context("cannot remove systemd unit")?;
    systemctl("daemon-reload")?;
    println!("Service uninstalled");
    Ok(())
}

fn systemctl(action: &str) -> Result<()> {
    if action == "daemon-reload" {
        return run_systemctl(&[action]);
    }
    run_systemctl(&[action, SERVICE_NAME])?;
    println!("Service {action} requested");
    Ok(())
}

fn run_systemctl(args: &[&str]) -> Result<()> {
    let status = Command::new("systemctl")
        .args(args)
        .status()
        .context("cannot run systemctl")?;
    if !status.success() {
        bail!("systemctl {} failed with {status}", args.join(" "));
    }
    Ok(())
}
