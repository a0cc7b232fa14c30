//! Per-run mutation of the runtime-generated spec.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use burrow_common::constants::{
    CONTAINER_HELPER_DIR, EMULATOR_NO_SECCOMP_ENV, MQUEUE_MOUNT, SHM_MOUNT, SPEC_FILE,
};
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{DeviceRequest, ExecMode, VolumeBind};
use burrow_core::fileops::FileHandle;
use burrow_core::guard::{self, SafePrefixSet};
use burrow_core::host::{self, HostIdentity};

use super::{Capabilities, Device, Mount, RuntimeSpec};
use crate::filebind::FileBinding;
use crate::gpu;

/// Process-level settings applied by [`SpecBuilder::set_process`].
#[derive(Debug, Clone, Default)]
pub struct ProcessSettings {
    /// Host path of the container root filesystem.
    pub root: PathBuf,
    /// Mount the root read-only.
    pub readonly: bool,
    /// Hostname; empty means the host's node name.
    pub hostname: String,
    /// Working directory; empty keeps the generated one.
    pub cwd: String,
    /// Allocate a terminal.
    pub terminal: bool,
    /// `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Command and arguments.
    pub args: Vec<String>,
}

/// Owns the spec of one bundle while a run edits it.
#[derive(Debug)]
pub struct SpecBuilder<'g> {
    guard: &'g SafePrefixSet,
    spec_path: PathBuf,
    spec: RuntimeSpec,
}

impl<'g> SpecBuilder<'g> {
    /// Wraps an already loaded spec that will be persisted to `spec_path`.
    #[must_use]
    pub const fn new(guard: &'g SafePrefixSet, spec_path: PathBuf, spec: RuntimeSpec) -> Self {
        Self {
            guard,
            spec_path,
            spec,
        }
    }

    /// Loads the bundle's spec, generating it with `runtime` when missing.
    ///
    /// With `overwrite`, an existing spec is removed and regenerated.
    ///
    /// # Errors
    ///
    /// Returns an error if the old spec cannot be removed, the runtime fails
    /// to generate one, or the result does not parse and validate.
    pub fn load_or_create(
        guard: &'g SafePrefixSet,
        runtime: &Path,
        bundle: &Path,
        overwrite: bool,
    ) -> Result<Self> {
        let spec_path = bundle.join(SPEC_FILE);
        let mut existing = FileHandle::new(&spec_path, guard);
        if overwrite && existing.exists() {
            existing.register_prefix();
            existing.remove(false, false)?;
        }
        if !existing.exists() {
            generate(runtime, bundle)?;
        }
        let spec = RuntimeSpec::load(&spec_path)?;
        Ok(Self::new(guard, spec_path, spec))
    }

    /// Returns the spec being built.
    #[must_use]
    pub const fn spec(&self) -> &RuntimeSpec {
        &self.spec
    }

    /// Returns the spec for direct edits.
    pub const fn spec_mut(&mut self) -> &mut RuntimeSpec {
        &mut self.spec
    }

    /// Sets root, hostname and the container process.
    pub fn set_process(&mut self, settings: &ProcessSettings) {
        self.spec.root.path = guard::real_path(&settings.root).to_string_lossy().into_owned();
        self.spec.root.readonly = settings.readonly;
        self.spec.hostname = Some(if settings.hostname.is_empty() {
            host::node_name()
        } else {
            settings.hostname.clone()
        });
        let process = &mut self.spec.process;
        if !settings.cwd.is_empty() {
            process.cwd.clone_from(&settings.cwd);
        }
        process.terminal = settings.terminal;
        process.env = settings
            .env
            .iter()
            .filter(|e| e.split_once('=').is_some_and(|(k, _)| !k.is_empty()))
            .cloned()
            .collect();
        process.args.clone_from(&settings.args);
    }

    /// Maps the container's IDs onto the invoking user and group.
    pub fn set_id_mappings(&mut self, uid: u32, gid: u32) {
        for mapping in &mut self.spec.linux.uid_mappings {
            mapping.host_id = uid;
        }
        for mapping in &mut self.spec.linux.gid_mappings {
            mapping.host_id = gid;
        }
    }

    /// Removes the mqueue mount when configured to, or, when unset, when the
    /// kernel is older than `min_kernel`. Returns `true` if it was removed.
    pub fn drop_mqueue(&mut self, no_mqueue: Option<bool>, min_kernel: &str) -> bool {
        let drop = no_mqueue.unwrap_or_else(|| !host::kernel_at_least(min_kernel));
        drop && self.spec.del_mount(MQUEUE_MOUNT.0, MQUEUE_MOUNT.1)
    }

    /// Binds the file-binding directory and every volume.
    ///
    /// Directories are bound read-write, except `/dev`. Single files are
    /// routed through `binding` when they are system files or land in a
    /// mountable container directory; others are reported and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the file binding cannot be started.
    pub fn add_volume_bindings(
        &mut self,
        binding: &mut dyn FileBinding,
        volumes: &[VolumeBind],
        system_files: &[PathBuf],
        mountpoint_prefixes: &[PathBuf],
    ) -> Result<()> {
        let (host_dir, cont_dir) = binding.start(system_files)?;
        self.spec.add_mount(Mount::bind(&path_str(&host_dir), &path_str(&cont_dir), true));
        for volume in volumes {
            let host = &volume.host;
            if host.is_dir() {
                if host == Path::new("/dev") {
                    tracing::warn!(volume = %host.display(), "engine does not support binding /dev");
                    continue;
                }
                self.spec
                    .add_mount(Mount::bind(&path_str(host), &path_str(&volume.container), true));
            } else if host.is_file() {
                let mountable = volume
                    .container
                    .parent()
                    .is_some_and(|p| mountpoint_prefixes.iter().any(|m| m == p));
                if !system_files.contains(host) && !mountable {
                    tracing::error!(volume = %host.display(), "engine does not support file mounting");
                    continue;
                }
                let bound = binding
                    .set_file(host, &volume.container)
                    .and_then(|()| binding.add_file(host, &volume.container));
                if let Err(e) = bound {
                    tracing::error!(volume = %host.display(), error = %e, "file binding failed");
                }
            } else {
                tracing::warn!(volume = %host.display(), "volume source not found");
            }
        }
        Ok(())
    }

    /// Adds one device node.
    ///
    /// The node type and numbers come from the host device; the permission
    /// bits from `r`/`w` in the request mode (neither means read-write).
    ///
    /// # Errors
    ///
    /// Returns an error if the host path is not an existing device under `/dev`.
    pub fn add_device(&mut self, request: &DeviceRequest, owner: HostIdentity) -> Result<()> {
        let host = &request.host;
        if !host.starts_with("/dev") || host == Path::new("/dev") {
            return Err(BurrowError::NotFound {
                kind: "device",
                id: host.display().to_string(),
            });
        }
        let meta = fs::metadata(host).map_err(|e| BurrowError::io(host, e))?;
        let kind = if meta.file_type().is_block_device() {
            "b"
        } else if meta.file_type().is_char_device() {
            "c"
        } else {
            return Err(BurrowError::Config {
                message: format!("not a device: {}", host.display()),
            });
        };
        let rdev = meta.rdev();
        self.spec.linux.devices.push(Device {
            path: path_str(&request.container),
            kind: kind.to_owned(),
            major: u64::from(libc::major(rdev)),
            minor: u64::from(libc::minor(rdev)),
            file_mode: device_file_mode(&request.mode),
            uid: owner.uid,
            gid: owner.gid,
        });
        tracing::debug!(device = %host.display(), kind, "device added");
        Ok(())
    }

    /// Adds the requested devices, then the GPU nodes in `gpu_devices` unless
    /// the NVIDIA control device was requested explicitly.
    ///
    /// Returns the host paths added; failing requests are logged and skipped.
    pub fn add_devices(
        &mut self,
        requests: &[DeviceRequest],
        gpu_devices: &[PathBuf],
        owner: HostIdentity,
    ) -> Vec<PathBuf> {
        let mut added = Vec::new();
        for request in requests {
            match self.add_device(request, owner) {
                Ok(()) => added.push(request.host.clone()),
                Err(e) => tracing::error!(device = %request.host.display(), error = %e, "device not added"),
            }
        }
        if added.iter().any(|d| d == Path::new(gpu::CONTROL_DEVICE)) {
            return added;
        }
        for device in gpu_devices {
            if added.contains(device) {
                continue;
            }
            match self.add_device(&DeviceRequest::new(device), owner) {
                Ok(()) => added.push(device.clone()),
                Err(e) => tracing::warn!(device = %device.display(), error = %e, "gpu device not added"),
            }
        }
        added
    }

    /// Sets all five capability sets to `capabilities`; empty leaves the
    /// generated sets alone.
    pub fn add_capabilities(&mut self, capabilities: &[String]) {
        if capabilities.is_empty() {
            return;
        }
        let set = capabilities.to_vec();
        self.spec.process.capabilities = Some(Capabilities {
            bounding: set.clone(),
            effective: set.clone(),
            inheritable: set.clone(),
            permitted: set.clone(),
            ambient: set,
        });
    }

    /// Replaces the `size=` option of the shared-memory mount.
    pub fn set_shm_size(&mut self, size: &str) -> bool {
        self.spec
            .modify_mount(SHM_MOUNT.0, SHM_MOUNT.1, &[format!("size={size}")])
    }

    /// Runs the command under the emulator inside the runtime (modes R2/R3).
    ///
    /// The emulator is exposed at `/.burrow/bin/<name>` through `binding`.
    ///
    /// # Errors
    ///
    /// Returns an error if the emulator cannot be bound into the container.
    pub fn emulator_overlay(
        &mut self,
        binding: &mut dyn FileBinding,
        emulator: &Path,
        mode: ExecMode,
        no_seccomp: bool,
    ) -> Result<()> {
        if !mode.overlays_emulator() {
            return Ok(());
        }
        if no_seccomp || mode.disables_seccomp() {
            self.spec
                .process
                .env
                .push(format!("{EMULATOR_NO_SECCOMP_ENV}=1"));
        }
        let name = emulator.file_name().ok_or_else(|| BurrowError::NotFound {
            kind: "emulator",
            id: emulator.display().to_string(),
        })?;
        let cont_exec = Path::new(CONTAINER_HELPER_DIR).join(name);
        let mountpoint = Path::new(&self.spec.root.path)
            .join(cont_exec.strip_prefix("/").unwrap_or(cont_exec.as_path()));
        if let Some(parent) = mountpoint.parent() {
            FileHandle::new(parent, self.guard).mkdir()?;
        }
        if fs::symlink_metadata(&mountpoint).is_err() {
            fs::write(&mountpoint, "").map_err(|e| BurrowError::io(&mountpoint, e))?;
        }
        binding.set_file(emulator, &cont_exec)?;
        binding.add_file(emulator, &cont_exec)?;
        FileHandle::new(binding.get_path(&cont_exec), self.guard).chmod(0o700, 0o700, false)?;

        let cont_exec = path_str(&cont_exec);
        let mut args = vec![cont_exec, "-0".to_owned()];
        args.append(&mut self.spec.process.args);
        self.spec.process.args = args;
        tracing::debug!(emulator = %emulator.display(), %mode, "emulator overlay");
        Ok(())
    }

    /// Validates the spec and writes it back to the bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if validation or the write fails.
    pub fn persist(&self) -> Result<()> {
        self.spec.save(&self.spec_path)
    }

    /// Renders the spec for debugging output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn dump(&self) -> Result<String> {
        self.spec.to_json()
    }
}

/// Permission bits for a device request mode string.
#[must_use]
pub fn device_file_mode(mode: &str) -> u32 {
    let mode = mode.to_ascii_lowercase();
    let mut bits = 0;
    if mode.contains('r') {
        bits |= 0o444;
    }
    if mode.contains('w') {
        bits |= 0o222;
    }
    if bits == 0 { 0o666 } else { bits }
}

fn generate(runtime: &Path, bundle: &Path) -> Result<()> {
    let bundle = guard::real_path(bundle);
    tracing::debug!(runtime = %runtime.display(), bundle = %bundle.display(), "generating spec");
    let status = Command::new(runtime)
        .args(["spec", "--rootless", "--bundle"])
        .arg(&bundle)
        .stdin(Stdio::null())
        .status()
        .map_err(|e| BurrowError::io(runtime, e))?;
    if status.success() {
        Ok(())
    } else {
        Err(BurrowError::Spec {
            message: format!("{} spec exited with {status}", runtime.display()),
        })
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::spec::tests::GENERATED;

    fn builder(guard: &SafePrefixSet) -> SpecBuilder<'_> {
        let spec = RuntimeSpec::from_json(GENERATED).expect("parse");
        SpecBuilder::new(guard, PathBuf::from("/nonexistent/config.json"), spec)
    }

    #[test]
    fn device_modes_map_to_permission_bits() {
        assert_eq!(device_file_mode("r"), 0o444);
        assert_eq!(device_file_mode("w"), 0o222);
        assert_eq!(device_file_mode("rwm"), 0o666);
        assert_eq!(device_file_mode("m"), 0o666);
        assert_eq!(device_file_mode(""), 0o666);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn null_device_read_only() {
        let guard = SafePrefixSet::new();
        let mut b = builder(&guard);
        let request: DeviceRequest = "/dev/null:r".parse().expect("parse");
        let mounts_before = b.spec().mounts.clone();
        b.add_device(&request, HostIdentity::current()).expect("add");

        let device = &b.spec().linux.devices[0];
        assert_eq!(device.kind, "c");
        assert_eq!(device.file_mode, 0o444);
        assert_eq!((device.major, device.minor), (1, 3));
        assert_eq!(b.spec().mounts, mounts_before);
    }

    #[test]
    fn non_devices_are_refused() {
        let guard = SafePrefixSet::new();
        let mut b = builder(&guard);
        assert!(b.add_device(&DeviceRequest::new("/etc/passwd"), HostIdentity::current()).is_err());
        assert!(b.add_device(&DeviceRequest::new("/dev"), HostIdentity::current()).is_err());
        assert!(b.spec().linux.devices.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn explicit_control_device_disables_gpu_discovery() {
        let guard = SafePrefixSet::new();
        let mut b = builder(&guard);
        let gpu = vec![PathBuf::from("/dev/zero")];
        let added = b.add_devices(&[DeviceRequest::new("/dev/null")], &gpu, HostIdentity::current());
        assert_eq!(added, vec![PathBuf::from("/dev/null"), PathBuf::from("/dev/zero")]);

        let mut b = builder(&guard);
        let mut ctl = DeviceRequest::new("/dev/null");
        ctl.host = PathBuf::from(gpu::CONTROL_DEVICE);
        let added = b.add_devices(&[ctl], &gpu, HostIdentity::current());
        if Path::new(gpu::CONTROL_DEVICE).exists() {
            assert_eq!(added, vec![PathBuf::from(gpu::CONTROL_DEVICE)]);
        } else {
            assert_eq!(added, gpu);
        }
    }

    #[test]
    fn process_settings_are_applied() {
        let guard = SafePrefixSet::new();
        let mut b = builder(&guard);
        b.set_process(&ProcessSettings {
            root: PathBuf::from("/srv/c1/ROOT"),
            readonly: true,
            hostname: "box.local".into(),
            cwd: "/work".into(),
            terminal: false,
            env: vec!["A=1".into(), "=bad".into(), "B=x=y".into()],
            args: vec!["/bin/true".into()],
        });
        let spec = b.spec();
        assert_eq!(spec.root.path, "/srv/c1/ROOT");
        assert!(spec.root.readonly);
        assert_eq!(spec.hostname.as_deref(), Some("box.local"));
        assert_eq!(spec.process.cwd, "/work");
        assert!(!spec.process.terminal);
        assert_eq!(spec.process.env, ["A=1", "B=x=y"]);
        assert_eq!(spec.process.args, ["/bin/true"]);
    }

    #[test]
    fn empty_hostname_uses_node_name() {
        let guard = SafePrefixSet::new();
        let mut b = builder(&guard);
        b.set_process(&ProcessSettings {
            root: PathBuf::from("/srv/c1/ROOT"),
            ..ProcessSettings::default()
        });
        assert_eq!(b.spec().hostname, Some(host::node_name()));
        assert_eq!(b.spec().process.cwd, "/");
    }

    #[test]
    fn id_mappings_point_at_invoking_user() {
        let guard = SafePrefixSet::new();
        let mut b = builder(&guard);
        b.set_id_mappings(4242, 4343);
        assert_eq!(b.spec().linux.uid_mappings[0].host_id, 4242);
        assert_eq!(b.spec().linux.gid_mappings[0].host_id, 4343);
        assert_eq!(b.spec().linux.uid_mappings[0].container_id, 0);
    }

    #[test]
    fn mqueue_follows_configuration() {
        let guard = SafePrefixSet::new();
        let mut b = builder(&guard);
        assert!(!b.drop_mqueue(Some(false), "999.0"));
        assert!(b.spec().select_mount("mqueue", "/dev/mqueue").is_some());
        assert!(b.drop_mqueue(Some(true), "0.0"));
        assert!(b.spec().select_mount("mqueue", "/dev/mqueue").is_none());
    }

    #[test]
    fn shm_size_and_capabilities() {
        let guard = SafePrefixSet::new();
        let mut b = builder(&guard);
        assert!(b.set_shm_size("2g"));
        assert!(b.spec().mounts[1].options.contains(&"size=2g".to_owned()));

        b.add_capabilities(&[]);
        assert_eq!(
            b.spec().process.capabilities.as_ref().map(|c| c.inheritable.len()),
            Some(0)
        );
        b.add_capabilities(&["CAP_NET_RAW".to_owned()]);
        let caps = b.spec().process.capabilities.clone().expect("caps");
        assert_eq!(caps.ambient, ["CAP_NET_RAW"]);
        assert_eq!(caps.bounding, ["CAP_NET_RAW"]);
    }

    struct RecordingBinding {
        host_dir: PathBuf,
        files: Vec<(PathBuf, PathBuf)>,
    }

    impl RecordingBinding {
        fn new(host_dir: &Path) -> Self {
            Self {
                host_dir: host_dir.to_path_buf(),
                files: Vec::new(),
            }
        }
    }

    impl FileBinding for RecordingBinding {
        fn start(&mut self, _system_files: &[PathBuf]) -> Result<(PathBuf, PathBuf)> {
            Ok((self.host_dir.clone(), PathBuf::from("/.bind_host_files")))
        }
        fn set_file(&mut self, _host_file: &Path, _cont_file: &Path) -> Result<()> {
            Ok(())
        }
        fn add_file(&mut self, host_file: &Path, cont_file: &Path) -> Result<()> {
            let _ = fs::copy(host_file, self.get_path(cont_file)).map_err(|e| BurrowError::io(host_file, e))?;
            self.files.push((host_file.to_path_buf(), cont_file.to_path_buf()));
            Ok(())
        }
        fn get_path(&self, cont_file: &Path) -> PathBuf {
            self.host_dir.join(cont_file.file_name().unwrap_or_default())
        }
        fn finish(&mut self) {}
    }

    #[test]
    fn volumes_are_bound_by_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("data");
        fs::create_dir(&data).expect("mkdir");
        let hosts = dir.path().join("hosts");
        fs::write(&hosts, "").expect("write");
        let stray = dir.path().join("stray");
        fs::write(&stray, "").expect("write");

        let volumes: Vec<VolumeBind> = [
            format!("{}:/data", data.display()),
            "/dev".to_owned(),
            format!("{}:/etc/hosts", hosts.display()),
            format!("{}:/opt/stray", stray.display()),
        ]
        .iter()
        .map(|v| v.parse().expect("volume"))
        .collect();

        let bind_dir = dir.path().join("bind");
        fs::create_dir(&bind_dir).expect("mkdir");

        let guard = SafePrefixSet::new();
        let mut b = builder(&guard);
        let mut binding = RecordingBinding::new(&bind_dir);
        let before = b.spec().mounts.len();
        b.add_volume_bindings(&mut binding, &volumes, &[], &[PathBuf::from("/etc")])
            .expect("bind");

        let added = &b.spec().mounts[before..];
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].destination, "/.bind_host_files");
        assert_eq!(added[1].destination, "/data");
        assert!(added[1].options.contains(&"rw".to_owned()));
        assert_eq!(binding.files, vec![(hosts, PathBuf::from("/etc/hosts"))]);
    }

    #[test]
    fn overlay_prefixes_the_command_with_the_emulator() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bind_dir = dir.path().join("bind");
        fs::create_dir(&bind_dir).expect("mkdir");
        let guard = SafePrefixSet::with_prefixes([dir.path()]);
        let mut b = builder(&guard);
        b.spec_mut().root.path = dir.path().join("ROOT").to_string_lossy().into_owned();
        let mut binding = RecordingBinding::new(&bind_dir);
        let emulator = dir.path().join("proot-x86_64");
        fs::write(&emulator, "").expect("write");

        b.emulator_overlay(&mut binding, &emulator, ExecMode::R1, false)
            .expect("noop");
        assert_eq!(b.spec().process.args, ["sh"]);

        b.emulator_overlay(&mut binding, &emulator, ExecMode::R3, false)
            .expect("overlay");
        assert_eq!(b.spec().process.args, ["/.burrow/bin/proot-x86_64", "-0", "sh"]);
        assert!(b.spec().process.env.contains(&"PROOT_NO_SECCOMP=1".to_owned()));
        assert!(dir.path().join("ROOT/.burrow/bin/proot-x86_64").exists());
        let mode = fs::metadata(bind_dir.join("proot-x86_64")).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn r2_overlay_keeps_seccomp_unless_configured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let guard = SafePrefixSet::with_prefixes([dir.path()]);
        let mut b = builder(&guard);
        b.spec_mut().root.path = dir.path().join("ROOT").to_string_lossy().into_owned();
        let bind_dir = dir.path().join("bind");
        fs::create_dir(&bind_dir).expect("mkdir");
        let mut binding = RecordingBinding::new(&bind_dir);
        let emulator = dir.path().join("proot");
        fs::write(&emulator, "").expect("write");

        b.emulator_overlay(&mut binding, &emulator, ExecMode::R2, false)
            .expect("overlay");
        assert!(!b.spec().process.env.iter().any(|e| e.starts_with("PROOT_NO_SECCOMP")));
    }
}
