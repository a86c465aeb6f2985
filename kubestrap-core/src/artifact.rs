// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Offline artifact distribution with integrity verification.
//!
//! Large binaries and image bundles must not be re-sent on every re-run:
//! a transfer is skipped when the remote copy already matches the local
//! file by size and SHA-256 digest, and every transfer is re-verified the
//! same way afterward. A transfer that does not verify byte-for-byte is a
//! failure, never a partial success.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use slog::{debug, info, o, warn, Logger};
use tokio::io::AsyncReadExt;

use crate::config::Host;
use crate::exec::{run_checked, ExecError, RemoteRunner};
use crate::ops::{
    RemoteOp, AGENT_IMAGES_DIR, CONFIG_DROPIN_DIR, DATA_DIR, INSTALL_SCRIPT,
    LOG_DIR, STAGING_DIR,
};

/// A content fingerprint, computed identically for local and remote copies
/// so they can be compared without transferring data twice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub digest: String,
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "size={} sha256={}", self.size, self.digest)
    }
}

/// A file to place on every host. `source` may be a glob pattern, in which
/// case `destination` is a pattern too and each matched file keeps its own
/// name under the destination's parent directory.
#[derive(Clone, Debug)]
pub struct FileArtifact {
    pub source: Utf8PathBuf,
    pub destination: Utf8PathBuf,
    pub required: bool,
}

impl FileArtifact {
    fn new(
        source: Utf8PathBuf,
        destination: impl Into<Utf8PathBuf>,
        required: bool,
    ) -> FileArtifact {
        FileArtifact { source, destination: destination.into(), required }
    }
}

/// The set of artifacts and remote directories a host needs before its
/// service can start.
#[derive(Clone, Debug)]
pub struct ArtifactPlan {
    pub remote_dirs: Vec<Utf8PathBuf>,
    pub artifacts: Vec<FileArtifact>,
    /// Files to mark executable after transfer.
    pub executable: Vec<Utf8PathBuf>,
}

impl ArtifactPlan {
    /// The standard offline bundle: install script, distribution tarball
    /// and checksum file, plus container image bundles that land directly
    /// in the agent's preload directory. The platform image bundle is
    /// optional; the platform installer downstream may not be enabled.
    pub fn offline_bundle(bundle_dir: &Utf8Path) -> ArtifactPlan {
        ArtifactPlan {
            remote_dirs: vec![
                STAGING_DIR.into(),
                AGENT_IMAGES_DIR.into(),
                CONFIG_DROPIN_DIR.into(),
                DATA_DIR.into(),
                LOG_DIR.into(),
            ],
            artifacts: vec![
                FileArtifact::new(
                    bundle_dir.join("rke2-install.sh"),
                    INSTALL_SCRIPT,
                    true,
                ),
                FileArtifact::new(
                    bundle_dir.join("rke2.linux*.tar.gz"),
                    format!("{STAGING_DIR}/rke2.linux*.tar.gz"),
                    true,
                ),
                FileArtifact::new(
                    bundle_dir.join("sha256sum*.txt"),
                    format!("{STAGING_DIR}/sha256sum*.txt"),
                    true,
                ),
                FileArtifact::new(
                    bundle_dir.join("rke2-images-linux.tar"),
                    format!("{AGENT_IMAGES_DIR}/rke2-images.linux.tar"),
                    true,
                ),
                FileArtifact::new(
                    bundle_dir.join("platform-images.tar"),
                    format!("{AGENT_IMAGES_DIR}/platform-images.tar"),
                    false,
                ),
            ],
            executable: vec![INSTALL_SCRIPT.into()],
        }
    }
}

/// What a post-transfer re-probe found, for error reporting.
#[derive(Clone, Debug)]
pub enum VerifyFinding {
    Absent,
    Mismatch(FileInfo),
}

impl fmt::Display for VerifyFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyFinding::Absent => write!(f, "no file"),
            VerifyFinding::Mismatch(info) => write!(f, "{}", info),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("required artifact {0} does not exist locally")]
    MissingSource(Utf8PathBuf),
    #[error("invalid glob pattern {pattern}")]
    Pattern {
        pattern: Utf8PathBuf,
        #[source]
        err: glob::PatternError,
    },
    #[error("failed to read local artifact {path}")]
    LocalRead {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error(
        "artifact {destination} on {host} failed verification after \
         transfer: expected {expected}, found {found}"
    )]
    VerificationFailed {
        host: String,
        destination: Utf8PathBuf,
        expected: FileInfo,
        found: VerifyFinding,
    },
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Computes the local fingerprint by streaming the file through SHA-256.
pub(crate) async fn local_file_info(
    path: &Utf8Path,
) -> Result<FileInfo, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok(FileInfo { size, digest: hex::encode(hasher.finalize()) })
}

fn is_glob(path: &Utf8Path) -> bool {
    path.as_str().contains(|c| matches!(c, '*' | '?' | '['))
}

/// Parses the reply of [`RemoteOp::StatFile`]. Outer `None` means the reply
/// was malformed; inner `None` means the remote file is absent.
fn parse_stat_reply(stdout: &str) -> Option<Option<FileInfo>> {
    let mut lines = stdout.lines().map(str::trim);
    match lines.next()? {
        "absent" => Some(None),
        "present" => {
            let size = lines.next()?.parse().ok()?;
            let digest = lines.next()?.to_string();
            if digest.is_empty() {
                return None;
            }
            Some(Some(FileInfo { size, digest }))
        }
        _ => None,
    }
}

pub struct Distributor<'a> {
    runner: &'a dyn RemoteRunner,
    log: Logger,
}

impl<'a> Distributor<'a> {
    pub fn new(runner: &'a dyn RemoteRunner, log: &Logger) -> Distributor<'a> {
        Distributor { runner, log: log.new(o!("component" => "artifacts")) }
    }

    /// Brings one host up to date with the plan. Required artifacts that
    /// are missing locally or fail verification abort with an error;
    /// optional ones degrade to a warning.
    pub async fn distribute(
        &self,
        host: &Host,
        plan: &ArtifactPlan,
    ) -> Result<(), ArtifactError> {
        run_checked(
            self.runner,
            host,
            &RemoteOp::EnsureDirs { dirs: plan.remote_dirs.clone() },
        )
        .await?;

        for artifact in &plan.artifacts {
            let result = if is_glob(&artifact.source) {
                self.sync_glob(host, artifact).await
            } else {
                self.sync_file(host, &artifact.source, &artifact.destination)
                    .await
            };
            match result {
                Ok(()) => {}
                Err(err) if artifact.required => return Err(err),
                Err(err) => {
                    warn!(
                        self.log,
                        "skipping optional artifact {}: {err}",
                        artifact.source;
                        "host" => host.display_name()
                    );
                }
            }
        }

        for path in &plan.executable {
            run_checked(
                self.runner,
                host,
                &RemoteOp::MakeExecutable { path: path.clone() },
            )
            .await?;
        }
        Ok(())
    }

    async fn sync_glob(
        &self,
        host: &Host,
        artifact: &FileArtifact,
    ) -> Result<(), ArtifactError> {
        let pattern = artifact.source.as_str();
        let mut matches: Vec<Utf8PathBuf> = glob::glob(pattern)
            .map_err(|err| ArtifactError::Pattern {
                pattern: artifact.source.clone(),
                err,
            })?
            .filter_map(Result::ok)
            .filter_map(|p| Utf8PathBuf::from_path_buf(p).ok())
            .collect();
        matches.sort();
        if matches.is_empty() {
            return Err(ArtifactError::MissingSource(artifact.source.clone()));
        }
        let dest_dir = artifact
            .destination
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("/"));
        for local in &matches {
            let file_name = local.file_name().unwrap_or(local.as_str());
            self.sync_file(host, local, &dest_dir.join(file_name)).await?;
        }
        Ok(())
    }

    async fn sync_file(
        &self,
        host: &Host,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Result<(), ArtifactError> {
        let local_info =
            local_file_info(local).await.map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    ArtifactError::MissingSource(local.to_owned())
                } else {
                    ArtifactError::LocalRead { path: local.to_owned(), err }
                }
            })?;

        if let Some(existing) = self.remote_file_info(host, remote).await? {
            if existing == local_info {
                debug!(
                    self.log,
                    "remote copy of {local} already matches; skipping \
                     transfer";
                    "host" => host.display_name()
                );
                return Ok(());
            }
            info!(
                self.log,
                "remote copy of {local} is stale ({existing}); \
                 re-transferring";
                "host" => host.display_name()
            );
        }

        self.runner.upload(host, local, remote).await?;

        match self.remote_file_info(host, remote).await? {
            Some(found) if found == local_info => {
                info!(
                    self.log,
                    "transferred and verified {local} ({local_info})";
                    "host" => host.display_name()
                );
                Ok(())
            }
            found => Err(ArtifactError::VerificationFailed {
                host: host.display_name().to_string(),
                destination: remote.to_owned(),
                expected: local_info,
                found: match found {
                    Some(info) => VerifyFinding::Mismatch(info),
                    None => VerifyFinding::Absent,
                },
            }),
        }
    }

    async fn remote_file_info(
        &self,
        host: &Host,
        path: &Utf8Path,
    ) -> Result<Option<FileInfo>, ArtifactError> {
        let op = RemoteOp::StatFile { path: path.to_owned() };
        let output = run_checked(self.runner, host, &op).await?;
        parse_stat_reply(&output.stdout).ok_or_else(|| {
            ArtifactError::Exec(ExecError::MalformedProbe {
                host: host.display_name().to_string(),
                intent: op.intent(),
                output: output.stdout.clone(),
            })
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{SimEvent, SimFleet};
    use camino_tempfile::Utf8TempDir;

    fn host(address: &str) -> Host {
        Host {
            address: address.to_string(),
            internal_address: None,
            name: None,
            user: "root".to_string(),
            password: Some("pw".to_string()),
            key_file: None,
            roles: vec!["worker".to_string()],
            platform_roles: Vec::new(),
            taints: Vec::new(),
        }
    }

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    async fn write_file(dir: &Utf8TempDir, name: &str, contents: &str) {
        tokio::fs::write(dir.path().join(name), contents).await.unwrap();
    }

    #[tokio::test]
    async fn local_file_info_hashes_contents() {
        let dir = Utf8TempDir::new().unwrap();
        write_file(&dir, "f", "hello world").await;
        let info = local_file_info(&dir.path().join("f")).await.unwrap();
        assert_eq!(info.size, 11);
        assert_eq!(
            info.digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn stat_replies_parse_strictly() {
        assert_eq!(parse_stat_reply("absent\n"), Some(None));
        assert_eq!(
            parse_stat_reply("present\n11\nabc123\n"),
            Some(Some(FileInfo { size: 11, digest: "abc123".to_string() }))
        );
        assert_eq!(parse_stat_reply(""), None);
        assert_eq!(parse_stat_reply("present\nnot-a-size\nabc\n"), None);
        assert_eq!(parse_stat_reply("warning: something\n"), None);
    }

    fn plan_for(
        source: Utf8PathBuf,
        destination: &str,
        required: bool,
    ) -> ArtifactPlan {
        ArtifactPlan {
            remote_dirs: vec![STAGING_DIR.into()],
            artifacts: vec![FileArtifact::new(
                source,
                destination.to_string(),
                required,
            )],
            executable: Vec::new(),
        }
    }

    #[tokio::test]
    async fn matching_remote_copy_skips_the_transfer() {
        let dir = Utf8TempDir::new().unwrap();
        write_file(&dir, "blob", "payload").await;
        let local = dir.path().join("blob");
        let info = local_file_info(&local).await.unwrap();

        let h = host("h1");
        let fleet = SimFleet::new(&[h.clone()]);
        fleet.with_host(&h.address, |sim| {
            sim.files.insert("/tmp/rke2-artifacts/blob".into(), info.clone());
        });

        let log = test_logger();
        let distributor = Distributor::new(&fleet, &log);
        distributor
            .distribute(
                &h,
                &plan_for(local, "/tmp/rke2-artifacts/blob", true),
            )
            .await
            .unwrap();
        assert_eq!(fleet.upload_count(), 0);
    }

    #[tokio::test]
    async fn stale_remote_copy_is_transferred_once_and_verified() {
        let dir = Utf8TempDir::new().unwrap();
        write_file(&dir, "blob", "payload").await;
        let local = dir.path().join("blob");

        let h = host("h1");
        let fleet = SimFleet::new(&[h.clone()]);
        fleet.with_host(&h.address, |sim| {
            sim.files.insert(
                "/tmp/rke2-artifacts/blob".into(),
                FileInfo { size: 3, digest: "stale".to_string() },
            );
        });

        let log = test_logger();
        let distributor = Distributor::new(&fleet, &log);
        distributor
            .distribute(
                &h,
                &plan_for(local, "/tmp/rke2-artifacts/blob", true),
            )
            .await
            .unwrap();
        assert_eq!(fleet.upload_count(), 1);
    }

    #[tokio::test]
    async fn missing_required_artifact_is_fatal_and_optional_is_not() {
        let dir = Utf8TempDir::new().unwrap();
        let missing = dir.path().join("nope");

        let h = host("h1");
        let fleet = SimFleet::new(&[h.clone()]);
        let log = test_logger();
        let distributor = Distributor::new(&fleet, &log);

        let err = distributor
            .distribute(
                &h,
                &plan_for(missing.clone(), "/tmp/rke2-artifacts/nope", true),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::MissingSource(_)));

        distributor
            .distribute(
                &h,
                &plan_for(missing, "/tmp/rke2-artifacts/nope", false),
            )
            .await
            .unwrap();
        assert_eq!(fleet.upload_count(), 0);
    }

    #[tokio::test]
    async fn corrupted_transfer_fails_verification() {
        let dir = Utf8TempDir::new().unwrap();
        write_file(&dir, "blob", "payload").await;
        let local = dir.path().join("blob");

        let h = host("h1");
        let fleet = SimFleet::new(&[h.clone()]);
        fleet.with_host(&h.address, |sim| sim.corrupt_uploads = true);

        let log = test_logger();
        let distributor = Distributor::new(&fleet, &log);
        let err = distributor
            .distribute(
                &h,
                &plan_for(local, "/tmp/rke2-artifacts/blob", true),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::VerificationFailed { .. }));
    }

    #[tokio::test]
    async fn glob_sources_expand_with_derived_remote_names() {
        let dir = Utf8TempDir::new().unwrap();
        write_file(&dir, "rke2.linux-amd64.tar.gz", "tarball").await;
        write_file(&dir, "rke2.linux-arm64.tar.gz", "tarball-arm").await;
        write_file(&dir, "unrelated.txt", "no").await;

        let h = host("h1");
        let fleet = SimFleet::new(&[h.clone()]);
        let log = test_logger();
        let distributor = Distributor::new(&fleet, &log);
        distributor
            .distribute(
                &h,
                &plan_for(
                    dir.path().join("rke2.linux*.tar.gz"),
                    "/tmp/rke2-artifacts/rke2.linux*.tar.gz",
                    true,
                ),
            )
            .await
            .unwrap();

        let uploads: Vec<_> = fleet
            .events()
            .into_iter()
            .filter_map(|event| match event {
                SimEvent::Upload { remote, .. } => Some(remote),
                _ => None,
            })
            .collect();
        assert_eq!(
            uploads,
            vec![
                Utf8PathBuf::from(
                    "/tmp/rke2-artifacts/rke2.linux-amd64.tar.gz"
                ),
                Utf8PathBuf::from(
                    "/tmp/rke2-artifacts/rke2.linux-arm64.tar.gz"
                ),
            ]
        );
    }

    #[tokio::test]
    async fn default_plan_covers_the_offline_bundle() {
        let plan = ArtifactPlan::offline_bundle("/opt/bundle".into());
        assert!(plan
            .artifacts
            .iter()
            .any(|a| a.destination == INSTALL_SCRIPT && a.required));
        assert!(plan.artifacts.iter().any(
            |a| a.destination.as_str().starts_with(AGENT_IMAGES_DIR)
                && !a.required
        ));
        assert_eq!(plan.executable, vec![Utf8PathBuf::from(INSTALL_SCRIPT)]);
    }
}
