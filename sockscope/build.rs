use std::{
    env,
    path::PathBuf,
    process::{Command, Stdio},
};

use anyhow::{Context, Result, bail};

fn bpf_target(arch: &str) -> &'static str {
    match arch {
        "x86_64" | "x86" | "aarch64" | "arm" | "riscv64" => "bpfel-unknown-none",
        "mips" | "mips64" | "powerpc" | "powerpc64" | "s390x" => "bpfeb-unknown-none",
        _ => {
            println!(
                "cargo:warning=Unknown architecture '{}', defaulting to bpfel-unknown-none",
                arch
            );
            "bpfel-unknown-none"
        }
    }
}

fn main() -> Result<()> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").context("OUT_DIR not set")?);
    let arch = env::var("CARGO_CFG_TARGET_ARCH").context("CARGO_CFG_TARGET_ARCH not set")?;

    println!("cargo:rerun-if-changed=../sockscope-ebpf/src");
    println!("cargo:rerun-if-changed=../sockscope-common/src");

    let target = bpf_target(&arch);
    println!(
        "cargo:warning=Building eBPF for target: {} (host arch: {})",
        target, arch
    );

    // separate target dir, the outer build holds the workspace lock
    let ebpf_target_dir = match env::var("SOCKSCOPE_EBPF_TARGET_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => out_dir.join("ebpf-target"),
    };
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    let status = Command::new(cargo)
        .current_dir("../sockscope-ebpf")
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env("CARGO_TARGET_DIR", &ebpf_target_dir)
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .args([
            "build",
            "--release",
            &format!("--target={}", target),
            "-Z",
            "build-std=core",
        ])
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .context("Failed to execute cargo for sockscope-ebpf")?;

    if !status.success() {
        bail!("Failed to build eBPF program");
    }

    let object = ebpf_target_dir.join(target).join("release").join("sockscope");
    std::fs::copy(&object, out_dir.join("sockscope"))
        .with_context(|| format!("Failed to copy eBPF object {}", object.display()))?;

    Ok(())
}
