//! Type-specific install steps
//!
//! Each update type is a fixed list of [`Step`]s executed in order; the first
//! failing step aborts the install. Which files a type owns (and therefore
//! what gets backed up) is decided here too.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use fleetota_core::{DispatchRequest, UpdateType};

use crate::execution::CommandRunner;

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("step '{step}' failed: {reason}")]
    Step { step: String, reason: String },
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait Installer: Send + Sync {
    /// Files the install may replace, captured before it runs
    fn owned_paths(&self, request: &DispatchRequest) -> Vec<PathBuf>;
    async fn install(&self, request: &DispatchRequest, artifact: &Path) -> Result<(), InstallError>;
    /// Stops whatever uses the owned files before a restore
    async fn quiesce(&self, request: &DispatchRequest) -> Result<(), InstallError>;
    /// Brings the restored version back up
    async fn resume(&self, request: &DispatchRequest) -> Result<(), InstallError>;
}

/// Where each update type lives on the host
#[derive(Debug, Clone)]
pub struct InstallLayout {
    pub systemd_dir: PathBuf,
    pub services_dir: PathBuf,
    pub config_dir: PathBuf,
    pub modules_dir: PathBuf,
    pub modprobe_dir: PathBuf,
}

impl InstallLayout {
    /// Standard Linux locations for the running kernel
    pub fn system(kernel_release: Option<&str>) -> Self {
        let release = kernel_release.unwrap_or("current");
        Self {
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            services_dir: PathBuf::from("/opt/services"),
            config_dir: PathBuf::from("/etc"),
            modules_dir: PathBuf::from(format!("/lib/modules/{release}/kernel/drivers")),
            modprobe_dir: PathBuf::from("/etc/modprobe.d"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Run { program: String, args: Vec<String>, allow_failure: bool },
    CreateDir(PathBuf),
    Copy { from: PathBuf, to: PathBuf },
    /// `systemctl is-active <unit>` must print `active`
    ExpectActive(String),
}

impl Step {
    fn command(program: &str, args: &[&str], allow_failure: bool) -> Self {
        Step::Run {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            allow_failure,
        }
    }

    fn run(program: &str, args: &[&str]) -> Self {
        Self::command(program, args, false)
    }

    fn run_tolerant(program: &str, args: &[&str]) -> Self {
        Self::command(program, args, true)
    }

    fn label(&self) -> String {
        match self {
            Step::Run { program, args, .. } => format!("{} {}", program, args.join(" ")).trim().to_string(),
            Step::CreateDir(path) => format!("mkdir {}", path.display()),
            Step::Copy { from, to } => format!("copy {} -> {}", from.display(), to.display()),
            Step::ExpectActive(unit) => format!("systemctl is-active {unit}"),
        }
    }
}

/// Payload shape, guessed from the locator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadKind {
    Tarball,
    Deb,
    Plain,
}

fn payload_kind(locator: &str) -> PayloadKind {
    let name = locator.rsplit('/').next().unwrap_or(locator).to_ascii_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        PayloadKind::Tarball
    } else if name.ends_with(".deb") {
        PayloadKind::Deb
    } else {
        PayloadKind::Plain
    }
}

/// Installs through the host's own tools (systemctl, tar, dpkg, modprobe, apt-get)
pub struct SystemInstaller {
    runner: Arc<dyn CommandRunner>,
    layout: InstallLayout,
}

impl SystemInstaller {
    pub fn new(runner: Arc<dyn CommandRunner>, layout: InstallLayout) -> Self {
        Self { runner, layout }
    }

    pub fn install_steps(&self, request: &DispatchRequest, artifact: &Path) -> Vec<Step> {
        let name = request.package_name.as_str();
        let artifact_str = artifact.to_string_lossy().to_string();
        let kind = payload_kind(&request.source_locator);

        match request.update_type {
            UpdateType::Service => {
                let tree = self.layout.services_dir.join(name);
                let mut steps = vec![Step::run_tolerant("systemctl", &["stop", name])];
                match kind {
                    PayloadKind::Tarball => {
                        let tree_str = tree.to_string_lossy().to_string();
                        steps.push(Step::CreateDir(tree.clone()));
                        steps.push(Step::run("tar", &["-xzf", artifact_str.as_str(), "-C", tree_str.as_str()]));
                    }
                    PayloadKind::Deb => steps.push(Step::run("dpkg", &["-i", artifact_str.as_str()])),
                    PayloadKind::Plain => {
                        steps.push(Step::CreateDir(tree.clone()));
                        steps.push(Step::Copy { from: artifact.to_path_buf(), to: tree.join(name) });
                    }
                }
                steps.push(Step::run("systemctl", &["daemon-reload"]));
                steps.push(Step::run("systemctl", &["enable", name]));
                steps.push(Step::run("systemctl", &["start", name]));
                steps.push(Step::ExpectActive(name.to_string()));
                steps
            }
            UpdateType::Driver => vec![
                // not loaded is fine
                Step::run_tolerant("rmmod", &[name]),
                Step::CreateDir(self.layout.modules_dir.clone()),
                Step::Copy { from: artifact.to_path_buf(), to: self.module_path(name) },
                Step::run("depmod", &["-a"]),
                Step::run("modprobe", &[name]),
            ],
            UpdateType::Package => {
                let mut steps = vec![Step::run("apt-get", &["update"])];
                if kind == PayloadKind::Deb {
                    steps.push(Step::run("dpkg", &["-i", artifact_str.as_str()]));
                } else {
                    let pinned = format!("{}={}", name, request.package_version);
                    steps.push(Step::run("apt-get", &["install", "-y", pinned.as_str()]));
                }
                steps
            }
        }
    }

    fn module_path(&self, name: &str) -> PathBuf {
        self.layout.modules_dir.join(format!("{name}.ko"))
    }

    async fn execute(&self, steps: Vec<Step>) -> Result<(), InstallError> {
        for step in steps {
            let label = step.label();
            debug!(step = %label, "running install step");
            match step {
                Step::Run { program, args, allow_failure } => {
                    let result = self.runner.run(&program, &args).await;
                    let failure = match result {
                        Ok(out) if out.success => None,
                        Ok(out) => Some(out.failure_reason()),
                        Err(e) => Some(e.to_string()),
                    };
                    match failure {
                        None => {}
                        Some(reason) if allow_failure => debug!(step = %label, "tolerated failure: {reason}"),
                        Some(reason) => return Err(InstallError::Step { step: label, reason }),
                    }
                }
                Step::CreateDir(path) => {
                    tokio::fs::create_dir_all(&path).await.map_err(|source| InstallError::Io { path, source })?;
                }
                Step::Copy { from, to } => {
                    tokio::fs::copy(&from, &to).await.map_err(|source| InstallError::Io { path: to, source })?;
                }
                Step::ExpectActive(unit) => {
                    let args = vec!["is-active".to_string(), unit];
                    let active = match self.runner.run("systemctl", &args).await {
                        Ok(out) => out.success && out.stdout.trim() == "active",
                        Err(e) => {
                            warn!("is-active query failed: {e}");
                            false
                        }
                    };
                    if !active {
                        return Err(InstallError::Step {
                            step: label,
                            reason: "service failed to start after update".to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Installer for SystemInstaller {
    fn owned_paths(&self, request: &DispatchRequest) -> Vec<PathBuf> {
        let name = request.package_name.as_str();
        match request.update_type {
            UpdateType::Service => vec![
                self.layout.systemd_dir.join(format!("{name}.service")),
                self.layout.services_dir.join(name),
                self.layout.config_dir.join(name),
            ],
            UpdateType::Driver => vec![
                self.module_path(name),
                self.layout.modprobe_dir.join(format!("{name}.conf")),
            ],
            // the package manager keeps the previous version
            UpdateType::Package => Vec::new(),
        }
    }

    async fn install(&self, request: &DispatchRequest, artifact: &Path) -> Result<(), InstallError> {
        info!(
            job_id = %request.job_id,
            "Installing {} update: {} v{}",
            request.update_type, request.package_name, request.package_version
        );
        self.execute(self.install_steps(request, artifact)).await
    }

    async fn quiesce(&self, request: &DispatchRequest) -> Result<(), InstallError> {
        let name = request.package_name.as_str();
        let steps = match request.update_type {
            UpdateType::Service => vec![Step::run_tolerant("systemctl", &["stop", name])],
            UpdateType::Driver => vec![Step::run_tolerant("rmmod", &[name])],
            UpdateType::Package => Vec::new(),
        };
        self.execute(steps).await
    }

    async fn resume(&self, request: &DispatchRequest) -> Result<(), InstallError> {
        let name = request.package_name.as_str();
        let steps = match request.update_type {
            UpdateType::Service => vec![
                Step::run("systemctl", &["daemon-reload"]),
                Step::run("systemctl", &["start", name]),
            ],
            UpdateType::Driver => vec![Step::run("depmod", &["-a"]), Step::run("modprobe", &[name])],
            UpdateType::Package => Vec::new(),
        };
        self.execute(steps).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::RecordingRunner;

    fn layout(root: &Path) -> InstallLayout {
        InstallLayout {
            systemd_dir: root.join("systemd"),
            services_dir: root.join("services"),
            config_dir: root.join("etc"),
            modules_dir: root.join("modules"),
            modprobe_dir: root.join("modprobe.d"),
        }
    }

    fn request(update_type: UpdateType, name: &str, locator: &str) -> DispatchRequest {
        DispatchRequest {
            job_id: "job-1".into(),
            update_type,
            package_name: name.into(),
            package_version: "2.0".into(),
            source_locator: locator.into(),
            checksum: "sha256:00".into(),
            description: None,
        }
    }

    #[test]
    fn test_payload_kind_from_locator() {
        assert_eq!(payload_kind("http://h/app-2.0.tar.gz"), PayloadKind::Tarball);
        assert_eq!(payload_kind("block+http://h/firmware/app.TGZ"), PayloadKind::Tarball);
        assert_eq!(payload_kind("file:///srv/htop_3.deb"), PayloadKind::Deb);
        assert_eq!(payload_kind("http://h/app"), PayloadKind::Plain);
    }

    #[tokio::test]
    async fn test_service_tarball_sequence() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new().with_stdout("systemctl is-active", "active\n"));
        let installer = SystemInstaller::new(runner.clone(), layout(root.path()));
        let req = request(UpdateType::Service, "app", "http://kernel/app.tar.gz");

        installer.install(&req, Path::new("/tmp/app.tar.gz")).await.unwrap();

        let tree = root.path().join("services/app");
        assert!(tree.is_dir());
        assert_eq!(
            runner.calls(),
            vec![
                "systemctl stop app".to_string(),
                format!("tar -xzf /tmp/app.tar.gz -C {}", tree.display()),
                "systemctl daemon-reload".to_string(),
                "systemctl enable app".to_string(),
                "systemctl start app".to_string(),
                "systemctl is-active app".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_service_not_active_fails() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new().with_stdout("systemctl is-active", "failed\n"));
        let installer = SystemInstaller::new(runner, layout(root.path()));
        let artifact = root.path().join("app");
        tokio::fs::write(&artifact, b"#!/bin/sh").await.unwrap();

        let err = installer
            .install(&request(UpdateType::Service, "app", "file:///srv/app"), &artifact)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("is-active"));
        // plain binary copied into the service tree before the check
        assert!(root.path().join("services/app/app").is_file());
    }

    #[tokio::test]
    async fn test_driver_tolerates_rmmod_failure() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new().failing_on("rmmod"));
        let installer = SystemInstaller::new(runner.clone(), layout(root.path()));
        let artifact = root.path().join("can.ko");
        tokio::fs::write(&artifact, b"\x7fELF").await.unwrap();

        installer
            .install(&request(UpdateType::Driver, "can", "block+http://k/firmware/can.ko"), &artifact)
            .await
            .unwrap();

        assert!(root.path().join("modules/can.ko").is_file());
        assert_eq!(runner.calls(), vec!["rmmod can", "depmod -a", "modprobe can"]);
    }

    #[tokio::test]
    async fn test_package_step_failure_stops_install() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new().failing_on("apt-get install"));
        let installer = SystemInstaller::new(runner.clone(), layout(root.path()));

        let err = installer
            .install(&request(UpdateType::Package, "htop", "http://mirror/htop"), Path::new("/tmp/htop"))
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::Step { .. }));
        assert_eq!(runner.calls(), vec!["apt-get update", "apt-get install -y htop=2.0"]);
    }

    #[test]
    fn test_owned_paths_per_type() {
        let root = Path::new("/r");
        let installer = SystemInstaller::new(Arc::new(RecordingRunner::new()), layout(root));

        let service = installer.owned_paths(&request(UpdateType::Service, "app", "http://h/app"));
        assert_eq!(
            service,
            vec![root.join("systemd/app.service"), root.join("services/app"), root.join("etc/app")]
        );
        let driver = installer.owned_paths(&request(UpdateType::Driver, "can", "http://h/can.ko"));
        assert_eq!(driver, vec![root.join("modules/can.ko"), root.join("modprobe.d/can.conf")]);
        assert!(installer.owned_paths(&request(UpdateType::Package, "htop", "http://h/x")).is_empty());
    }
}
