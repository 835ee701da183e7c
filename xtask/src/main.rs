use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const BINARY: &str = "sockscope";
const REMOTE_STAGING: &str = "/tmp/sockscope.tmp";
const CONFIG_DIR: &str = "/etc/sockscope";
const EXAMPLE_CONFIG: &str = "sockscope.example.yaml";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build, deploy and package sockscope")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the agent (eBPF object + userspace loader)
    Build {
        #[arg(long)]
        release: bool,

        /// Target triple for cross-compilation (e.g. aarch64-unknown-linux-gnu)
        #[arg(long)]
        target: Option<String>,
    },

    /// Copy the agent to a remote host over scp
    Deploy {
        /// user@host or host
        #[arg(long)]
        host: String,

        #[arg(long, default_value = "/usr/local/bin/sockscope")]
        path: String,

        #[arg(long, default_value = "true")]
        release: bool,

        #[arg(long)]
        target: Option<String>,

        /// Restart the systemd unit afterwards
        #[arg(long)]
        restart: bool,
    },

    /// Install and enable the systemd unit on a remote host
    InstallService {
        #[arg(long)]
        host: String,

        /// Settings file passed through SOCKSCOPE_CONFIG
        #[arg(long)]
        config: Option<String>,
    },

    /// Produce a release tarball with install scripts
    Package {
        #[arg(long)]
        target: Option<String>,

        #[arg(long, default_value = "dist")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Deploy {
            host,
            path,
            release,
            target,
            restart,
        } => {
            deploy(&host, &path, release, target.as_deref(), restart)?;
        }
        Commands::InstallService { host, config } => {
            install_service(&host, config.as_deref())?;
        }
        Commands::Package { target, output } => {
            package(target.as_deref(), &output)?;
        }
    }

    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask must live inside the workspace")
}

fn binary_path(root: &Path, release: bool, target: Option<&str>) -> PathBuf {
    let profile = if release { "release" } else { "debug" };
    let mut path = root.join("target");
    if let Some(t) = target {
        path.push(t);
    }
    path.join(profile).join(BINARY)
}

fn run(cmd: &mut Command, what: &str) -> Result<()> {
    let status = cmd
        .status()
        .with_context(|| format!("Failed to run {}", what))?;
    if !status.success() {
        bail!("{} failed ({})", what, status);
    }
    Ok(())
}

fn build(release: bool, target: Option<&str>) -> Result<PathBuf> {
    let root = project_root()?;

    println!("🔨 Building {}...", BINARY);

    // Linux targets from a non-Linux host go through `cross`
    let cross = target.is_some_and(|t| t.contains("linux")) && !cfg!(target_os = "linux");
    let tool = if cross {
        if which::which("cross").is_err() {
            bail!(
                "Cross-compilation to Linux requires 'cross'.\n\
                 Install with: cargo install cross (Docker must be running)"
            );
        }
        println!("   Using 'cross' for cross-compilation");
        "cross"
    } else {
        "cargo"
    };

    let mut cmd = Command::new(tool);
    cmd.current_dir(&root).arg("build").arg("-p").arg(BINARY);
    if release {
        cmd.arg("--release");
    }
    if let Some(t) = target {
        cmd.arg("--target").arg(t);
        println!("   Target: {}", t);
    }
    run(&mut cmd, "cargo build")?;

    let binary = binary_path(&root, release, target);
    println!("✅ Build complete: {}", binary.display());
    Ok(binary)
}

fn deploy(
    host: &str,
    remote_path: &str,
    release: bool,
    target: Option<&str>,
    restart: bool,
) -> Result<()> {
    let binary = build(release, target)?;
    if !binary.exists() {
        bail!("Binary not found at: {}", binary.display());
    }

    println!("📦 Deploying to {}:{}", host, remote_path);
    run(
        Command::new("scp")
            .arg(&binary)
            .arg(format!("{}:{}", host, REMOTE_STAGING)),
        "scp",
    )?;
    run(
        Command::new("ssh").arg(host).arg(format!(
            "sudo mv {} {} && sudo chmod +x {}",
            REMOTE_STAGING, remote_path, remote_path
        )),
        "remote install",
    )?;
    println!("✅ Deployed to {}:{}", host, remote_path);

    if restart {
        println!("🔄 Restarting {} service...", BINARY);
        let status = Command::new("ssh")
            .arg(host)
            .arg(format!("sudo systemctl restart {} || true", BINARY))
            .status()
            .context("Failed to restart service")?;
        if status.success() {
            println!("✅ Service restarted");
        } else {
            println!("⚠️  Service restart failed (unit might not exist)");
        }
    }

    Ok(())
}

fn install_service(host: &str, config: Option<&str>) -> Result<()> {
    let unit = systemd_unit(config);

    println!("📝 Installing systemd service on {}...", host);
    let escaped = unit.replace('\'', "'\\''");
    run(
        Command::new("ssh").arg(host).arg(format!(
            "echo '{}' | sudo tee /etc/systemd/system/{}.service > /dev/null && \
             sudo systemctl daemon-reload && \
             sudo systemctl enable {}",
            escaped, BINARY, BINARY
        )),
        "systemd install",
    )?;

    println!("✅ Systemd service installed and enabled");
    println!("   Start with: ssh {} sudo systemctl start {}", host, BINARY);
    Ok(())
}

fn systemd_unit(config: Option<&str>) -> String {
    let env_line = config
        .map(|c| format!("Environment=SOCKSCOPE_CONFIG={}", c))
        .unwrap_or_default();

    format!(
        r#"[Unit]
Description=sockscope socket correlation agent
After=network.target

[Service]
Type=simple
ExecStart=/usr/local/bin/{bin}
Restart=on-failure
RestartSec=5
{env_line}

NoNewPrivileges=no
CapabilityBoundingSet=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON
AmbientCapabilities=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON

[Install]
WantedBy=multi-user.target
"#,
        bin = BINARY,
        env_line = env_line,
    )
}

fn package(target: Option<&str>, output_dir: &str) -> Result<()> {
    let binary = build(true, target)?;
    if !binary.exists() {
        bail!("Binary not found at: {}", binary.display());
    }

    let root = project_root()?;
    let output = root.join(output_dir);
    fs::create_dir_all(&output).context("Failed to create output directory")?;

    let arch = target.unwrap_or(std::env::consts::ARCH);
    let name = format!("{}-{}-{}", BINARY, env!("CARGO_PKG_VERSION"), arch);
    let staging = output.join(&name);
    fs::create_dir_all(&staging)?;

    fs::copy(&binary, staging.join(BINARY))?;
    let example = root.join(EXAMPLE_CONFIG);
    if example.exists() {
        fs::copy(&example, staging.join(EXAMPLE_CONFIG))?;
    }

    let config_path = format!("{}/{}.yaml", CONFIG_DIR, BINARY);
    let install = format!(
        r#"#!/bin/bash
set -e

INSTALL_DIR="${{INSTALL_DIR:-/usr/local/bin}}"

sudo install -m 755 {bin} "$INSTALL_DIR/{bin}"
sudo mkdir -p {dir}
if [ -f {example} ] && [ ! -f {config} ]; then
    sudo cp {example} {config}
fi

echo "✅ Installed to $INSTALL_DIR/{bin}"
echo "   Run ./install-service.sh to register the systemd unit"
"#,
        bin = BINARY,
        dir = CONFIG_DIR,
        example = EXAMPLE_CONFIG,
        config = config_path,
    );
    fs::write(staging.join("install.sh"), install)?;

    let service = format!(
        r#"#!/bin/bash
set -e

cat > /tmp/{bin}.service << 'EOF'
{unit}
EOF

sudo mv /tmp/{bin}.service /etc/systemd/system/{bin}.service
sudo systemctl daemon-reload
sudo systemctl enable {bin}

echo "✅ Systemd service installed"
"#,
        bin = BINARY,
        unit = systemd_unit(Some(&config_path)),
    );
    fs::write(staging.join("install-service.sh"), service)?;

    let tarball = output.join(format!("{}.tar.gz", name));
    run(
        Command::new("tar")
            .current_dir(&output)
            .arg("-czf")
            .arg(&tarball)
            .arg(&name),
        "tar",
    )?;
    fs::remove_dir_all(&staging)?;

    println!("✅ Package created: {}", tarball.display());
    Ok(())
}
