//! Local resource provisioning -- ports, run directory, disk backing, and
//! the serialized config files one service instance needs.

use std::fs;
use std::path::{Path, PathBuf};

use bsh_core::config::LocalConfig;
use bsh_core::error::{HarnessError, ProvisioningError, TeardownError};
use bsh_core::lifecycle::Provisioner;
use bsh_core::service_config::ServiceConfig;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ports::{PortAllocator, PortReservation};

/// Service log file name inside the run directory.
pub const SERVICE_LOG_FILE: &str = "nbs.log";
/// Full service config (server, storage, overlays).
pub const SERVICE_CONFIG_FILE: &str = "service.toml";
/// Storage section the service boots with.
pub const STORAGE_CONFIG_FILE: &str = "storage.toml";
/// Sparse disk image used when in-memory disks are off.
pub const DISK_IMAGE_FILE: &str = "disk.img";

/// Where the run directory lives.
#[derive(Debug)]
enum RunDir {
    /// System temp; removed when dropped.
    Temp(TempDir),
    /// Under `artifacts_dir`; kept for post-mortem.
    Kept(PathBuf),
}

impl RunDir {
    fn path(&self) -> &Path {
        match self {
            Self::Temp(dir) => dir.path(),
            Self::Kept(path) => path,
        }
    }
}

/// Disk backing handed to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskBacking {
    InMemory { size_mb: u64 },
    File { path: PathBuf, size_mb: u64 },
}

/// Config files written for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFiles {
    pub service: PathBuf,
    pub storage: PathBuf,
    /// One file per storage overlay, in application order.
    pub overlays: Vec<PathBuf>,
}

/// Everything one local invocation owns. Released by
/// [`LocalProvisioner::release`]; ports and the temporary run directory are
/// also reclaimed on drop.
#[derive(Debug)]
pub struct LocalEnvironment {
    run_id: Uuid,
    host: String,
    run_dir: RunDir,
    service_port: PortReservation,
    monitoring_port: PortReservation,
    log_path: PathBuf,
    disk: DiskBacking,
    config_files: ConfigFiles,
}

impl LocalEnvironment {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn run_dir(&self) -> &Path {
        self.run_dir.path()
    }

    /// Whether the run directory survives release.
    pub fn is_retained(&self) -> bool {
        matches!(self.run_dir, RunDir::Kept(_))
    }

    pub fn service_port(&self) -> u16 {
        self.service_port.port()
    }

    pub fn monitoring_port(&self) -> u16 {
        self.monitoring_port.port()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn disk(&self) -> &DiskBacking {
        &self.disk
    }

    pub fn config_files(&self) -> &ConfigFiles {
        &self.config_files
    }

    /// Free both placeholder sockets right before the service binds them.
    pub fn release_port_listeners(&mut self) {
        self.service_port.release_listener();
        self.monitoring_port.release_listener();
    }
}

/// Provisions [`LocalEnvironment`]s from a [`LocalConfig`].
#[derive(Debug, Clone)]
pub struct LocalProvisioner {
    config: LocalConfig,
    ports: PortAllocator,
}

impl LocalProvisioner {
    pub fn new(config: LocalConfig) -> Self {
        Self::with_allocator(config, PortAllocator::new())
    }

    /// Share a port allocator across provisioners (or observe it in tests).
    pub fn with_allocator(config: LocalConfig, ports: PortAllocator) -> Self {
        Self { config, ports }
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.ports
    }

    fn create_run_dir(&self, run_id: Uuid) -> Result<RunDir, ProvisioningError> {
        if self.config.artifacts_dir.is_empty() {
            let dir = tempfile::Builder::new()
                .prefix("bsh-run-")
                .tempdir()
                .map_err(|e| workspace("failed to create temporary run directory", e))?;
            return Ok(RunDir::Temp(dir));
        }

        let path = Path::new(&self.config.artifacts_dir).join(format!("run-{run_id}"));
        fs::create_dir_all(&path)
            .map_err(|e| workspace(&format!("failed to create {}", path.display()), e))?;
        Ok(RunDir::Kept(path))
    }

    fn create_disk(&self, run_dir: &Path) -> Result<DiskBacking, ProvisioningError> {
        let size_mb = self.config.disk_size_mb;
        if self.config.use_in_memory_disks {
            return Ok(DiskBacking::InMemory { size_mb });
        }

        let path = run_dir.join(DISK_IMAGE_FILE);
        let file = fs::File::create(&path)
            .map_err(|e| workspace(&format!("failed to create {}", path.display()), e))?;
        // sparse: only metadata is written
        file.set_len(size_mb * 1024 * 1024)
            .map_err(|e| workspace(&format!("failed to size {}", path.display()), e))?;
        Ok(DiskBacking::File { path, size_mb })
    }

    fn write_configs(
        run_dir: &Path,
        config: &ServiceConfig,
    ) -> Result<ConfigFiles, ProvisioningError> {
        let generation = |e: bsh_core::error::ConfigError| {
            ProvisioningError::ConfigGeneration(e.to_string())
        };

        let service = run_dir.join(SERVICE_CONFIG_FILE);
        write_file(&service, &config.to_toml().map_err(generation)?)?;

        let storage = run_dir.join(STORAGE_CONFIG_FILE);
        write_file(
            &storage,
            &config.effective_storage().to_toml().map_err(generation)?,
        )?;

        let mut overlays = Vec::with_capacity(config.storage_overlays.len());
        for (i, overlay) in config.storage_overlays.iter().enumerate() {
            let path = run_dir.join(format!("storage-overlay-{i}.toml"));
            write_file(&path, &overlay.to_toml().map_err(generation)?)?;
            overlays.push(path);
        }

        Ok(ConfigFiles {
            service,
            storage,
            overlays,
        })
    }

    fn provision_sync(&self, config: &ServiceConfig) -> Result<LocalEnvironment, ProvisioningError> {
        let run_id = Uuid::new_v4();
        let run_dir = self.create_run_dir(run_id)?;

        // Everything below either lands in the environment or is dropped on
        // the error path: reservations free their ports and a temporary run
        // directory removes itself. Kept directories are cleared explicitly.
        let built = self.populate(run_id, run_dir, config);
        if let Err((Some(kept), _)) = &built {
            remove_kept_dir(kept);
        }
        built.map_err(|(_, e)| e)
    }

    fn populate(
        &self,
        run_id: Uuid,
        run_dir: RunDir,
        config: &ServiceConfig,
    ) -> Result<LocalEnvironment, (Option<PathBuf>, ProvisioningError)> {
        let kept = match &run_dir {
            RunDir::Kept(path) => Some(path.clone()),
            RunDir::Temp(_) => None,
        };
        let fail = |e| (kept.clone(), e);

        let mut ports = self
            .ports
            .allocate(&self.config.bind_host, 2)
            .map_err(fail)?
            .into_iter();
        let (Some(service_port), Some(monitoring_port)) = (ports.next(), ports.next()) else {
            return Err(fail(ProvisioningError::PortExhausted {
                requested: 2,
                allocated: 0,
                reason: "allocator returned too few ports".to_owned(),
            }));
        };

        let log_path = run_dir.path().join(SERVICE_LOG_FILE);
        fs::File::create(&log_path)
            .map_err(|e| fail(workspace(&format!("failed to create {}", log_path.display()), e)))?;

        let disk = self.create_disk(run_dir.path()).map_err(fail)?;
        let config_files = Self::write_configs(run_dir.path(), config).map_err(fail)?;

        Ok(LocalEnvironment {
            run_id,
            host: self.config.bind_host.clone(),
            run_dir,
            service_port,
            monitoring_port,
            log_path,
            disk,
            config_files,
        })
    }
}

impl Provisioner for LocalProvisioner {
    type Env = LocalEnvironment;

    async fn provision(&mut self, config: &ServiceConfig) -> Result<LocalEnvironment, HarnessError> {
        let env = self.provision_sync(config)?;
        info!(
            run_id = %env.run_id,
            run_dir = %env.run_dir().display(),
            service_port = env.service_port(),
            monitoring_port = env.monitoring_port(),
            in_memory_disks = matches!(env.disk, DiskBacking::InMemory { .. }),
            "environment provisioned"
        );
        Ok(env)
    }

    async fn release(&mut self, env: LocalEnvironment) -> Result<(), HarnessError> {
        let LocalEnvironment {
            run_id,
            run_dir,
            service_port,
            monitoring_port,
            ..
        } = env;
        drop(service_port);
        drop(monitoring_port);

        match run_dir {
            RunDir::Temp(dir) => {
                let path = dir.path().to_path_buf();
                dir.close().map_err(|e| {
                    TeardownError::Release(format!("failed to remove {}: {e}", path.display()))
                })?;
                debug!(%run_id, "run directory removed");
            }
            RunDir::Kept(path) => {
                info!(%run_id, run_dir = %path.display(), "run directory retained");
            }
        }
        Ok(())
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), ProvisioningError> {
    fs::write(path, contents)
        .map_err(|e| workspace(&format!("failed to write {}", path.display()), e))
}

fn workspace(context: &str, e: std::io::Error) -> ProvisioningError {
    ProvisioningError::Workspace(format!("{context}: {e}"))
}

fn remove_kept_dir(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        warn!(path = %path.display(), error = %e, "failed to remove partial run directory");
    }
}
