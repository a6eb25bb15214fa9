use std::path::PathBuf;

use aya_build::cargo_metadata;

fn main() -> anyhow::Result<()> {
    let cargo_metadata::Metadata { packages, .. } = cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()?;
    let ebpf_package = packages
        .into_iter()
        .find(|p| p.name == "flowsnoop-ebpf")
        .ok_or_else(|| anyhow::anyhow!("flowsnoop-ebpf package not found in workspace"))?;
    aya_build::build_ebpf([ebpf_package])?;
    // Re-run whenever the eBPF crate's sources change; aya_build only
    // watches Cargo.toml by default.
    println!("cargo:rerun-if-changed={}", PathBuf::from("../flowsnoop-ebpf/src").display());
    Ok(())
}
