use super::artifact::{discard, Artifact, ArtifactKind, Workspace, AGE_SUFFIX};
use crate::config::Recipients;
use crate::error::{BackupError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};
use which::which;

/// First line of every binary (non-armored) age file.
const AGE_HEADER: &[u8] = b"age-encryption.org/v1";

pub struct AgeEncryptor {
    program: String,
    recipients: Recipients,
}

impl AgeEncryptor {
    pub fn new(program: impl Into<String>, recipients: Recipients) -> Self {
        Self {
            program: program.into(),
            recipients,
        }
    }

    fn args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        match &self.recipients {
            Recipients::Keys(keys) => {
                for key in keys {
                    args.push("-r".into());
                    args.push(key.into());
                }
            }
            Recipients::File(file) => {
                args.push("-R".into());
                args.push(file.into());
            }
        }
        args.push("-o".into());
        args.push(output.into());
        args.push(input.into());
        args
    }

    /// Checked before the current artifact is handed over, so a missing tool
    /// or recipients file fails without consuming anything.
    fn preflight(&self) -> Result<PathBuf> {
        let program = which(&self.program).map_err(|_| {
            BackupError::Encryption(format!("{} executable not found in PATH", self.program))
        })?;
        match &self.recipients {
            Recipients::Keys(keys) if keys.is_empty() => Err(BackupError::Encryption(
                "no age recipients configured".to_string(),
            )),
            Recipients::File(file) if !file.is_file() => Err(BackupError::Encryption(format!(
                "recipients file {} does not exist",
                file.display()
            ))),
            _ => Ok(program),
        }
    }

    /// Encrypts the current artifact into `<name>.age`, replacing it.
    pub async fn encrypt(&self, artifact: Artifact, workspace: &mut Workspace) -> Result<Artifact> {
        if artifact.kind() == ArtifactKind::Encrypted {
            return Err(BackupError::Encryption(
                "artifact is already encrypted".to_string(),
            ));
        }
        let program = self.preflight()?;

        let dest = workspace.track(&format!("{}{}", artifact.file_name(), AGE_SUFFIX));
        info!("Encrypting {} to {}", artifact.path().display(), dest.display());

        let output = Command::new(&program)
            .args(self.args(artifact.path(), &dest))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackupError::Encryption(format!("failed to run {}: {}", program.display(), e)))?;

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(BackupError::Encryption(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let size = match validate_age_file(&dest).await {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(e);
            }
        };

        debug!("Encrypted artifact is {} bytes", size);
        discard(artifact);
        Ok(Artifact::new(dest, ArtifactKind::Encrypted, size))
    }
}

async fn validate_age_file(path: &Path) -> Result<u64> {
    let size = tokio::fs::metadata(path)
        .await
        .map_err(|e| BackupError::Encryption(format!("{} was not written: {}", path.display(), e)))?
        .len();

    let mut header = vec![0u8; AGE_HEADER.len()];
    let mut file = File::open(path).await?;
    let read = file.read_exact(&mut header).await;
    if size == 0 || read.is_err() || header != AGE_HEADER {
        return Err(BackupError::Encryption(format!(
            "{} is not a valid age file",
            path.display()
        )));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_args_for_inline_recipients() {
        let encryptor = AgeEncryptor::new(
            "age",
            Recipients::Keys(vec!["age1one".to_string(), "age1two".to_string()]),
        );
        let args = encryptor.args(Path::new("/w/a.sql.gz"), Path::new("/w/a.sql.gz.age"));
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec!["-r", "age1one", "-r", "age1two", "-o", "/w/a.sql.gz.age", "/w/a.sql.gz"]
        );
    }

    #[test]
    fn test_args_for_recipients_file() {
        let encryptor = AgeEncryptor::new("age", Recipients::File(PathBuf::from("/etc/r.txt")));
        let args = encryptor.args(Path::new("in"), Path::new("out"));
        assert_eq!(args[0], OsString::from("-R"));
        assert_eq!(args[1], OsString::from("/etc/r.txt"));
    }

    #[tokio::test]
    async fn test_missing_tool_leaves_artifact_current() {
        let dir = tempdir().unwrap();
        let mut workspace = Workspace::new(dir.path());
        let path = workspace.track("a.sql");
        std::fs::write(&path, b"CREATE TABLE t;").unwrap();
        let artifact = Artifact::new(path.clone(), ArtifactKind::RawDump, 15);

        let encryptor = AgeEncryptor::new(
            "age-binary-that-does-not-exist",
            Recipients::Keys(vec!["age1one".to_string()]),
        );
        let err = encryptor.encrypt(artifact, &mut workspace).await.unwrap_err();

        assert!(matches!(err, BackupError::Encryption(_)));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_validate_age_file() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.age");
        let bad = dir.path().join("bad.age");
        std::fs::write(&good, b"age-encryption.org/v1\n-> X25519 abc\n").unwrap();
        std::fs::write(&bad, b"plaintext").unwrap();

        assert!(validate_age_file(&good).await.unwrap() > 0);
        assert!(validate_age_file(&bad).await.is_err());
        assert!(validate_age_file(&dir.path().join("missing.age")).await.is_err());
    }

    /// Writes an executable stand-in for `age` that sets `$out` from `-o`
    /// and leaves the input path in `$1` before running `body`.
    #[cfg(unix)]
    fn fake_age(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-age");
        let text = format!(
            "#!/bin/sh\n\
             while [ $# -gt 1 ]; do\n\
               case \"$1\" in\n\
                 -o) out=\"$2\"; shift 2 ;;\n\
                 *) shift ;;\n\
               esac\n\
             done\n\
             {}\n",
            body
        );
        std::fs::write(&script, text).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.display().to_string()
    }

    #[cfg(unix)]
    /// Returns the outcome plus whether the input and the `.age` output are
    /// still on disk afterwards.
    async fn encrypt_with(body: &str) -> (Result<Artifact>, bool, bool) {
        let tools = tempdir().unwrap();
        let dir = tempdir().unwrap();
        let mut workspace = Workspace::new(dir.path());
        let path = workspace.track("a.sql.gz");
        std::fs::write(&path, b"compressed bytes").unwrap();
        let artifact = Artifact::new(path.clone(), ArtifactKind::Compressed, 16);

        let encryptor = AgeEncryptor::new(
            fake_age(tools.path(), body),
            Recipients::Keys(vec!["age1one".to_string()]),
        );
        let result = encryptor.encrypt(artifact, &mut workspace).await;
        (result, path.exists(), dir.path().join("a.sql.gz.age").exists())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_tool_keeps_prior_artifact() {
        let (result, input_kept, output_exists) =
            encrypt_with("printf 'partial' > \"$out\"; echo 'age: no identity' >&2; exit 1").await;

        assert!(matches!(result, Err(BackupError::Encryption(_))));
        assert!(input_kept);
        assert!(!output_exists);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_without_age_header_is_rejected() {
        let (result, input_kept, output_exists) = encrypt_with("cat \"$1\" > \"$out\"").await;

        match result {
            Err(BackupError::Encryption(msg)) => assert!(msg.contains("not a valid age file")),
            other => panic!("expected encryption error, got {:?}", other),
        }
        assert!(input_kept);
        assert!(!output_exists);
    }
}
