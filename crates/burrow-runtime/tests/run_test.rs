//! End-to-end runs against stand-in runtime and emulator executables.
//!
//! The stand-ins are shell scripts: the runtime one answers `spec` by
//! writing a minimal rootless spec and exits with a fixed status on `run`;
//! the emulator one records its arguments and exits with a fixed status.

#![cfg(target_os = "linux")]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use burrow_common::config::{BurrowConfig, ExecutableSource};
use burrow_common::types::{ContainerId, ExecMode, RunOptions};
use burrow_core::guard::SafePrefixSet;
use burrow_runtime::engine::{EmulationEngine, ExecutionEngine, NamespaceEngine, RunContext};
use burrow_runtime::spec::RuntimeSpec;

const FAKE_RUNTIME: &str = r#"#!/bin/sh
if [ "$1" = "spec" ]; then
    cat > "$4/config.json" <<'JSON'
{
  "ociVersion": "1.0.2",
  "process": {"terminal": true, "args": ["sh"], "env": [], "cwd": "/"},
  "root": {"path": "rootfs", "readonly": true},
  "mounts": [
    {"destination": "/dev/shm", "type": "tmpfs", "source": "shm", "options": ["nosuid", "size=65536k"]},
    {"destination": "/dev/mqueue", "type": "mqueue", "source": "mqueue", "options": ["nosuid"]}
  ],
  "linux": {
    "uidMappings": [{"containerID": 0, "hostID": 1, "size": 1}],
    "gidMappings": [{"containerID": 0, "hostID": 1, "size": 1}],
    "namespaces": [{"type": "user"}]
  }
}
JSON
    exit 0
fi
exit 42
"#;

const FAKE_EMULATOR: &str = r#"#!/bin/sh
echo "$@" > "$(dirname "$0")/args"
env > "$(dirname "$0")/env"
exit 7
"#;

struct Sandbox {
    dir: tempfile::TempDir,
    config: BurrowConfig,
}

impl Sandbox {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).expect("mkdir");
        fs::create_dir_all(dir.path().join("tmp")).expect("mkdir");
        let runtime = script(&bin.join("runc"), FAKE_RUNTIME);
        let emulator = script(&bin.join("proot"), FAKE_EMULATOR);

        let root = dir.path().join("containers/c1/ROOT");
        fs::create_dir_all(root.join("bin")).expect("mkdir");
        fs::create_dir_all(root.join("etc")).expect("mkdir");
        let _ = script(&root.join("bin/sh"), "");

        let resolv = dir.path().join("hostetc/resolv.conf");
        fs::create_dir_all(resolv.parent().expect("parent")).expect("mkdir");
        fs::write(&resolv, "nameserver 10.0.0.53\n").expect("write");
        let image_copy = root.join(resolv.strip_prefix("/").expect("absolute"));
        fs::create_dir_all(image_copy.parent().expect("parent")).expect("mkdir");
        fs::write(&image_copy, "nameserver 127.0.0.1\n").expect("write");

        let config = BurrowConfig {
            topdir: dir.path().to_path_buf(),
            tmpdir: dir.path().join("tmp"),
            runtime: ExecutableSource::Path(runtime),
            emulator: ExecutableSource::Path(emulator),
            no_mqueue: Some(true),
            sysdirs: vec![resolv],
            ..BurrowConfig::default()
        };
        Self { dir, config }
    }

    fn container_dir(&self) -> PathBuf {
        self.dir.path().join("containers/c1")
    }

    fn resolv_conf(&self) -> PathBuf {
        self.dir.path().join("hostetc/resolv.conf")
    }

    fn context<'a>(&'a self, guard: &'a SafePrefixSet, mode: ExecMode) -> RunContext<'a> {
        RunContext::open(&self.config, guard, ContainerId::parse("c1").expect("id"), mode).expect("open")
    }
}

fn script(path: &Path, body: &str) -> PathBuf {
    fs::write(path, body).expect("write");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
    path.to_path_buf()
}

fn opts(cmd: &[&str]) -> RunOptions {
    RunOptions {
        cmd: cmd.iter().map(|s| (*s).to_owned()).collect(),
        hostname: "box.example".into(),
        ..RunOptions::default()
    }
}

#[test]
fn namespace_run_returns_runtime_status_and_persists_spec() {
    let sandbox = Sandbox::new();
    let guard = SafePrefixSet::new();
    let mut engine = NamespaceEngine::new(sandbox.context(&guard, ExecMode::R1));

    let status = engine.run(&opts(&["/bin/sh", "-c", "true"])).expect("run");
    assert_eq!(status, 42);

    let spec = RuntimeSpec::load(&sandbox.container_dir().join("config.json")).expect("spec");
    assert_eq!(spec.process.args, ["/bin/sh", "-c", "true"]);
    assert_eq!(spec.hostname.as_deref(), Some("box.example"));
    assert!(Path::new(&spec.root.path).ends_with("containers/c1/ROOT"));
    assert!(spec.select_mount("mqueue", "/dev/mqueue").is_none());
    let shm = &spec.mounts[spec.select_mount("shm", "/dev/shm").expect("shm")];
    assert!(shm.options.contains(&"size=2g".to_owned()));
    assert!(!shm.options.contains(&"size=65536k".to_owned()));
    assert!(spec.mounts.iter().any(|m| m.destination == "/.bind_host_files"));
    assert_eq!(spec.linux.uid_mappings[0].host_id, nix::unistd::getuid().as_raw());
    assert!(spec.linux.extra.contains_key("namespaces"));
    assert!(spec.process.env.iter().any(|e| e == "container_uuid=c1"));

    let resolv = sandbox.resolv_conf();
    let in_container = sandbox
        .container_dir()
        .join("ROOT")
        .join(resolv.strip_prefix("/").expect("absolute"));
    let link = fs::read_link(in_container).expect("system file link");
    assert!(link.starts_with("/.bind_host_files"));
    assert_eq!(link.file_name().and_then(|n| n.to_str()), Some(resolv.to_string_lossy().replace('/', "#").as_str()));

    let leftovers: Vec<_> = fs::read_dir(sandbox.dir.path().join("tmp")).expect("tmp").collect();
    assert!(leftovers.is_empty(), "file binding must be released");
}

#[test]
fn overlay_mode_runs_the_command_under_the_emulator() {
    let sandbox = Sandbox::new();
    let guard = SafePrefixSet::new();
    let mut engine = NamespaceEngine::new(sandbox.context(&guard, ExecMode::R3));

    assert_eq!(engine.run(&opts(&["/bin/sh"])).expect("run"), 42);
    let spec = RuntimeSpec::load(&sandbox.container_dir().join("config.json")).expect("spec");
    assert_eq!(spec.process.args, ["/.burrow/bin/proot", "-0", "/bin/sh"]);
    assert!(spec.process.env.contains(&"PROOT_NO_SECCOMP=1".to_owned()));
    let link = sandbox.container_dir().join("ROOT/.burrow/bin/proot");
    assert_eq!(
        fs::read_link(link).expect("emulator link"),
        PathBuf::from("/.bind_host_files/#.burrow#bin#proot")
    );
}

#[test]
fn invalid_environment_exits_with_five() {
    let sandbox = Sandbox::new();
    let guard = SafePrefixSet::new();
    let mut engine = NamespaceEngine::new(sandbox.context(&guard, ExecMode::R1));
    let mut bad = opts(&["/bin/sh"]);
    bad.env = vec!["9LIVES=1".into()];
    assert_eq!(engine.run(&bad).expect_err("env").exit_code(), 5);
}

#[test]
fn missing_runtime_exits_with_one() {
    let mut sandbox = Sandbox::new();
    sandbox.config.runtime = ExecutableSource::Path(sandbox.dir.path().join("nowhere/runc"));
    let guard = SafePrefixSet::new();
    let mut engine = NamespaceEngine::new(sandbox.context(&guard, ExecMode::R1));
    assert_eq!(engine.run(&opts(&["/bin/sh"])).expect_err("runtime").exit_code(), 1);
}

#[test]
fn failing_spec_generation_exits_with_four() {
    let sandbox = Sandbox::new();
    let broken = script(&sandbox.dir.path().join("bin/broken"), "#!/bin/sh\nexit 1\n");
    let config = BurrowConfig {
        runtime: ExecutableSource::Path(broken),
        ..sandbox.config.clone()
    };
    let guard = SafePrefixSet::new();
    let ctx = RunContext::open(&config, &guard, ContainerId::parse("c1").expect("id"), ExecMode::R1).expect("open");
    let mut engine = NamespaceEngine::new(ctx);
    assert_eq!(engine.run(&opts(&["/bin/sh"])).expect_err("spec").exit_code(), 4);
}

#[test]
fn command_missing_from_container_exits_with_two() {
    let sandbox = Sandbox::new();
    let guard = SafePrefixSet::new();
    let mut engine = NamespaceEngine::new(sandbox.context(&guard, ExecMode::R1));
    assert_eq!(engine.run(&opts(&["/usr/bin/absent"])).expect_err("init").exit_code(), 2);
}

#[test]
fn emulation_run_passes_root_and_command() {
    let sandbox = Sandbox::new();
    let guard = SafePrefixSet::new();
    let mut engine = EmulationEngine::new(sandbox.context(&guard, ExecMode::P2));
    let mut run = opts(&["/bin/sh", "-c", "exit 0"]);
    run.cwd = "/etc".into();

    assert_eq!(engine.run(&run).expect("run"), 7);
    let args = fs::read_to_string(sandbox.dir.path().join("bin/args")).expect("args");
    let root = sandbox.container_dir().join("ROOT");
    assert!(args.starts_with(&format!("-0 -r {} -w /etc", root.display())));
    assert!(args.trim_end().ends_with("/bin/sh -c exit 0"));
    let env = fs::read_to_string(sandbox.dir.path().join("bin/env")).expect("env");
    assert!(env.lines().any(|l| l == "PROOT_NO_SECCOMP=1"));
    assert!(env.lines().any(|l| l == "container_execmode=P2"));
}
