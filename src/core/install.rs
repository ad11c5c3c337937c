use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Hands a finished, signed archive set to whatever installs it.
#[cfg_attr(test, mockall::automock)]
pub trait Installer: Send + Sync {
    fn install(&self, archives: &[PathBuf]) -> Result<()>;
}

/// Installs over `adb install-multiple`, replacing an existing install.
pub struct AdbInstaller {
    adb: PathBuf,
    serial: Option<String>,
}

impl AdbInstaller {
    pub fn new(adb: impl Into<PathBuf>, serial: Option<String>) -> Self {
        Self {
            adb: adb.into(),
            serial,
        }
    }

    fn command(&self, archives: &[PathBuf]) -> Command {
        let mut cmd = Command::new(&self.adb);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.arg("install-multiple").arg("-r").args(archives);
        cmd
    }
}

impl Installer for AdbInstaller {
    fn install(&self, archives: &[PathBuf]) -> Result<()> {
        let mut cmd = self.command(archives);
        tracing::debug!("{cmd:?}");
        let output = cmd
            .output()
            .with_context(|| format!("While running `{}`", self.adb.display()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // adb reports some rejections with a zero exit status.
        anyhow::ensure!(
            output.status.success() && stdout.contains("Success"),
            "adb install-multiple failed ({}): {}{}",
            output.status,
            stdout.trim(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        Ok(())
    }
}

/// Copies the archives into a directory for installing by other means.
pub struct ExportInstaller {
    out_dir: PathBuf,
}

impl ExportInstaller {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }
}

impl Installer for ExportInstaller {
    fn install(&self, archives: &[PathBuf]) -> Result<()> {
        std::fs::create_dir_all(&self.out_dir)?;
        for archive in archives {
            let name = archive
                .file_name()
                .with_context(|| format!("`{}` has no file name", archive.display()))?;
            let dest = self.out_dir.join(name);
            std::fs::copy(archive, &dest).with_context(|| {
                format!("While copying `{}` to `{}`", archive.display(), dest.display())
            })?;
            tracing::info!("exported {}", dest.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn adb_command_line() {
        let installer = AdbInstaller::new("adb", Some("emulator-5554".into()));
        let cmd = installer.command(&[PathBuf::from("a.apk"), PathBuf::from("b.apk")]);
        let args: Vec<_> = cmd.get_args().map(|arg| arg.to_string_lossy()).collect();
        assert_eq!(
            args,
            ["-s", "emulator-5554", "install-multiple", "-r", "a.apk", "b.apk"]
        );
    }

    #[test]
    fn missing_adb_is_an_error() {
        let installer = AdbInstaller::new("/nonexistent/adb", None);
        assert!(installer.install(&[PathBuf::from("a.apk")]).is_err());
    }

    #[test]
    fn export_copies_every_archive() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("base.apk");
        let b = dir.path().join("config.en.apk");
        std::fs::write(&a, b"base").unwrap();
        std::fs::write(&b, b"locale").unwrap();

        let installer = ExportInstaller::new(dir.path().join("out"));
        installer.install(&[a, b]).unwrap();
        assert_eq!(std::fs::read(installer.out_dir().join("base.apk")).unwrap(), b"base");
        assert_eq!(
            std::fs::read(installer.out_dir().join("config.en.apk")).unwrap(),
            b"locale"
        );
        assert!(installer.install(&[dir.path().join("missing.apk")]).is_err());
    }
}
