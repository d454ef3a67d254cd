//! `canopy setup`: key pair plus private and public config files.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use canopy_network::Address;
use canopy_overlay::{save_group, Roster, ServerToml};

/// Group file written next to the private config.
const PUBLIC_FILE: &str = "public.toml";

pub fn run(address: Address, description: &str, out: &Path) -> anyhow::Result<()> {
    if out.exists() {
        bail!("{} already exists", out.display());
    }
    if let Some(dir) = out.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let private = ServerToml::generate(address, description);
    private
        .save(out)
        .with_context(|| format!("writing {}", out.display()))?;

    let si = private.server_identity()?;
    let group = Roster::new(vec![si.clone()]).to_toml();
    let public = public_path(out);
    save_group(&public, &group).with_context(|| format!("writing {}", public.display()))?;

    eprintln!("canopy v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Public key: {}", si.public.to_hex());
    eprintln!("Private config: {}", out.display());
    eprintln!("Group file: {}", public.display());
    Ok(())
}

fn public_path(out: &Path) -> PathBuf {
    out.with_file_name(PUBLIC_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_overlay::load_group;

    #[test]
    fn writes_both_files() {
        let dir = std::env::temp_dir().join(format!("canopy-setup-{}", std::process::id()));
        let out = dir.join("node").join("private.toml");
        let address: Address = "tcp://127.0.0.1:7770".parse().unwrap();
        run(address.clone(), "test node", &out).unwrap();

        let private = ServerToml::load(&out).unwrap();
        let si = private.server_identity().unwrap();
        assert_eq!(si.address, address);

        let roster = load_group(&public_path(&out)).unwrap().to_roster().unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.list[0].id, si.id);
        assert!(run(address, "again", &out).is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
