//! Scenario-level assembly tests.
//!
//! The plan is populated exactly as in production, then replayed against
//! recording mounters instead of the kernel: no real mount(2), no root
//! required. The recorded traces verify stage ordering, the mounter
//! switch, and the per-concern population decisions.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use vessel::config::{DevMode, EngineConfig, OverlayMode};
use vessel::container::ContainerBuilder;
use vessel::identity;
use vessel::mount::flags::{MS_RDONLY, MS_REMOUNT};
use vessel::mount::{MountPlan, MountPoint, Mounter, Tag};
use vessel::oci;
use vessel::rpc::RpcClient;
use vessel::session::{Layer, Session};
use vessel_common::VesselResult;

/// Records destinations handled by the in-process mounter.
struct RecordingMounter {
    trace: Rc<RefCell<Vec<String>>>,
}

impl Mounter for RecordingMounter {
    fn mount(&mut self, point: &MountPoint, _session: &Session) -> VesselResult<()> {
        self.trace.borrow_mut().push(point.destination.clone());
        Ok(())
    }
}

/// Records every call delegated to the privileged helper.
#[derive(Default)]
struct RecordingRpc {
    mounts: Vec<(String, u64)>,
    chroots: Vec<String>,
}

impl RpcClient for RecordingRpc {
    fn mount(
        &mut self,
        _source: &str,
        target: &str,
        _fstype: &str,
        flags: u64,
        _data: &str,
    ) -> VesselResult<()> {
        self.mounts.push((target.to_string(), flags));
        Ok(())
    }

    fn chroot(&mut self, path: &str) -> VesselResult<()> {
        self.chroots.push(path.to_string());
        Ok(())
    }
}

struct Harness {
    _session_base: tempfile::TempDir,
    builder: ContainerBuilder,
    plan: MountPlan,
    session: Session,
    rpc: Rc<RefCell<RecordingRpc>>,
    direct_trace: Rc<RefCell<Vec<String>>>,
}

/// Build a session + populated plan for `config`, with recording mounters
/// swapped in for both execution phases.
fn assemble(mut config: EngineConfig, oci_spec: &oci::Spec) -> Harness {
    let session_base = tempfile::tempdir().unwrap();
    config.sessiondir_prefix = Some(session_base.path().to_path_buf());
    // Keep host-dependent concerns out of the loop.
    config.mount_devpts = false;
    config.mount_hostfs = false;
    if identity::user_by_uid(rustix::process::getuid().as_raw())
        .unwrap()
        .is_none()
    {
        config.no_home = true;
        config.config_passwd = false;
        config.config_group = false;
    }

    let rpc = Rc::new(RefCell::new(RecordingRpc::default()));
    let dyn_rpc: Rc<RefCell<dyn RpcClient>> = rpc.clone();
    let mut builder = ContainerBuilder::new(config, oci_spec.clone(), dyn_rpc);

    let direct_trace = Rc::new(RefCell::new(Vec::new()));
    let mut plan = MountPlan::new(Box::new(RecordingMounter {
        trace: Rc::clone(&direct_trace),
    }));
    let mut session = builder.setup_session_layout(&mut plan).unwrap();
    builder.populate(&mut plan, &mut session).unwrap();

    Harness {
        _session_base: session_base,
        builder,
        plan,
        session,
        rpc,
        direct_trace,
    }
}

fn squashfs_image() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let mut content = vec![0u8; 8192];
    content[..4].copy_from_slice(b"hsqs");
    file.write_all(&content).unwrap();
    file.flush().unwrap();
    file
}

fn position(trace: &[(String, u64)], suffix: &str) -> usize {
    trace
        .iter()
        .position(|(target, _)| target.ends_with(suffix))
        .unwrap_or_else(|| panic!("no mount ending in {suffix} in {trace:?}"))
}

#[test]
fn writable_sandbox_uses_plain_layout() {
    // S3: sandbox image, writable, mounter switches after the rootfs.
    let sandbox = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        image_path: sandbox.path().to_string_lossy().into_owned(),
        writable_image: true,
        ..EngineConfig::default()
    };

    let mut h = assemble(config, &oci::Spec::default());
    assert!(matches!(h.session.layer(), Layer::None));

    // The rootfs is a bind of the host directory plus a deferred remount.
    let rootfs = h.plan.get_by_tag(Tag::Rootfs);
    assert_eq!(rootfs.len(), 1);
    assert_eq!(rootfs[0].source, sandbox.path().to_string_lossy());
    assert_eq!(
        rootfs[0].destination,
        h.session.rootfs_path().to_string_lossy()
    );
    assert_eq!(rootfs[0].flags() & MS_RDONLY, 0);
    let pre_layer = h.plan.get_by_tag(Tag::PreLayer);
    assert_eq!(pre_layer.len(), 1);
    assert_ne!(pre_layer[0].flags() & MS_REMOUNT, 0);
    // No overlay appears anywhere.
    assert!(h.plan.get_by_tag(Tag::Layer).is_empty());

    let mut builder = h.builder;
    builder.execute(&mut h.plan, &mut h.session).unwrap();

    // The direct mounter saw only the session tmpfs and the rootfs bind;
    // everything after the rootfs stage went through the helper.
    let direct = h.direct_trace.borrow();
    assert_eq!(direct.len(), 2);
    assert_eq!(direct[0], h.session.path().to_string_lossy());
    assert_eq!(direct[1], h.session.rootfs_path().to_string_lossy());

    let rpc = h.rpc.borrow();
    // First delegated call is the deferred sandbox remount.
    assert_ne!(rpc.mounts[0].1 & MS_REMOUNT, 0);
    // The chroot lands exactly once, on the final path, after all mounts.
    assert_eq!(
        rpc.chroots,
        vec![h.session.final_path().to_string_lossy().into_owned()]
    );
}

#[test]
fn squashfs_rootfs_with_underlay() {
    // S1/S4 shape: read-only image rootfs, overlay disabled, underlay on.
    let image = squashfs_image();
    let config = EngineConfig {
        image_path: image.path().to_string_lossy().into_owned(),
        enable_overlay: OverlayMode::No,
        enable_underlay: true,
        ..EngineConfig::default()
    };

    let mut h = assemble(config, &oci::Spec::default());
    assert!(matches!(h.session.layer(), Layer::Underlay(_)));

    // Loop-backed image mount, read-only, with its extent recorded.
    let rootfs = h.plan.get_by_tag(Tag::Rootfs);
    assert_eq!(rootfs.len(), 1);
    assert_eq!(rootfs[0].fstype, "squashfs");
    assert!(rootfs[0].source.starts_with("/proc/self/fd/"));
    assert_ne!(rootfs[0].flags() & MS_RDONLY, 0);
    assert_eq!(
        vessel::mount::flags::size_limit(&rootfs[0].internal_options).unwrap(),
        Some(8192)
    );

    let mut builder = h.builder;
    builder.execute(&mut h.plan, &mut h.session).unwrap();

    // Stage ordering through the helper: devices, then kernel pseudo-fs,
    // then tmp; identity files (when synthesized) come last.
    let rpc = h.rpc.borrow();
    let dev = position(&rpc.mounts, "/dev");
    let proc = position(&rpc.mounts, "/proc");
    let tmp = position(&rpc.mounts, "/tmp");
    assert!(dev < proc, "devices must mount before kernel pseudo-fs");
    assert!(proc < tmp, "kernel pseudo-fs must mount before tmp");

    if !rustix::process::geteuid().is_root() {
        // The files hook ran after the layer and planned the identity
        // binds at the last-but-one stage.
        let files: Vec<&str> = h
            .plan
            .get_by_tag(Tag::Files)
            .iter()
            .map(|p| p.destination.as_str())
            .collect();
        assert!(files.contains(&"/etc/passwd"));
        assert!(files.contains(&"/etc/group"));
    }

    // The underlay staged the missing bind targets inside its root.
    assert!(h.session.final_path().join("tmp").is_dir());
    assert_eq!(
        rpc.chroots,
        vec![h.session.final_path().to_string_lossy().into_owned()]
    );
}

#[test]
fn contain_with_workdir_redirects_tmp_and_scratch() {
    // S5: contain mode with a workdir.
    let sandbox = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        image_path: sandbox.path().to_string_lossy().into_owned(),
        writable_image: true,
        contain: true,
        workdir: Some(workdir.path().to_string_lossy().into_owned()),
        scratch_dirs: vec!["/scr".to_string()],
        global_bind_path: vec!["/srv".to_string()],
        ..EngineConfig::default()
    };

    let h = assemble(config, &oci::Spec::default());

    // Admin binds are dropped under contain.
    assert!(h.plan.get_by_tag(Tag::Binds).is_empty());

    // Tmp sources come from the workdir, with the flattened var_tmp name.
    let tmp_points = h.plan.get_by_tag(Tag::Tmp);
    let tmp_sources: Vec<&str> = tmp_points.iter().map(|p| p.source.as_str()).collect();
    let w = workdir.path().to_string_lossy();
    assert!(tmp_sources.contains(&format!("{w}/tmp").as_str()));
    assert!(tmp_sources.contains(&format!("{w}/var_tmp").as_str()));
    assert!(workdir.path().join("tmp").is_dir());
    assert!(workdir.path().join("var_tmp").is_dir());

    // Scratch sources live under <workdir>/scratch.
    let scratch = h.plan.get_by_tag(Tag::Scratch);
    assert_eq!(scratch[0].source, format!("{w}/scratch/scr"));
    assert!(workdir.path().join("scratch/scr").is_dir());

    // Cwd never reaches the plan under contain.
    assert!(h.plan.get_by_tag(Tag::Cwd).is_empty());
}

#[test]
fn minimal_dev_is_staged_in_session() {
    let sandbox = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        image_path: sandbox.path().to_string_lossy().into_owned(),
        writable_image: true,
        mount_dev: DevMode::Minimal,
        ..EngineConfig::default()
    };

    let h = assemble(config, &oci::Spec::default());

    let dev_points = h.plan.get_by_tag(Tag::Dev);
    let destinations: Vec<&str> = dev_points.iter().map(|p| p.destination.as_str()).collect();

    // Fresh shm, staged node binds, and the final staged-dev bind.
    let session_dev = h.session.path().join("dev");
    assert!(destinations
        .iter()
        .any(|d| *d == session_dev.join("shm").to_string_lossy()));
    for node in ["null", "zero", "random", "urandom"] {
        assert!(
            destinations
                .iter()
                .any(|d| *d == session_dev.join(node).to_string_lossy()),
            "missing staged bind for /dev/{node}"
        );
    }
    assert_eq!(dev_points.last().unwrap().destination, "/dev");
    assert_eq!(
        dev_points.last().unwrap().source,
        session_dev.to_string_lossy()
    );
}

#[test]
fn host_dev_mode_binds_directly() {
    let sandbox = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        image_path: sandbox.path().to_string_lossy().into_owned(),
        writable_image: true,
        mount_dev: DevMode::Yes,
        ..EngineConfig::default()
    };

    let h = assemble(config, &oci::Spec::default());
    let dev_points = h.plan.get_by_tag(Tag::Dev);
    assert_eq!(dev_points.len(), 1);
    assert_eq!(dev_points[0].source, "/dev");
    assert_eq!(dev_points[0].destination, "/dev");
}
