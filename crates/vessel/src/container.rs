//! Container assembly.
//!
//! The assembler owns one [`Session`] and one [`MountPlan`], populates the
//! plan concern by concern — rootfs, overlay images, kernel pseudo-fs,
//! devices, host filesystems, binds, home, temporary and scratch space,
//! working directory, identity files — then replays it and pivots into
//! the container through the privileged helper.
//!
//! Everything here runs on a single thread that has already joined its
//! private mount namespace; plan, session, and image handles are threaded
//! explicitly, never shared.

use std::cell::RefCell;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::rc::Rc;

use vessel_common::paths::SESSION_BASE;
use vessel_common::{VesselError, VesselResult};

use crate::config::{DevMode, EngineConfig, OverlayMode};
use crate::identity;
use crate::image::{Image, ImageKind};
use crate::mount::flags::{
    MS_BIND, MS_NODEV, MS_NOEXEC, MS_NOSUID, MS_RDONLY, MS_REC,
};
use crate::mount::{DirectMounter, MountPlan, RpcMounter, Tag};
use crate::oci::{self, NamespaceType};
use crate::proc;
use crate::rpc::RpcClient;
use crate::session::{overlay, underlay, Layer, LayerKind, Session};

/// Operating-system directories the working directory concern refuses to
/// bind over.
const PROTECTED_CWD: &[&str] = &["/", "/etc", "/bin", "/mnt", "/usr", "/var", "/opt", "/sbin"];

/// Assemble the container filesystem for one invocation and chroot into
/// it.
///
/// Fatal errors surface before any mount runs where possible; once
/// `mount_all` starts, the first failure aborts with no unwinding — the
/// session base teardown is the parent's job.
pub fn create(
    config: EngineConfig,
    oci_spec: &oci::Spec,
    rpc: Rc<RefCell<dyn RpcClient>>,
) -> VesselResult<()> {
    let mut builder = ContainerBuilder::new(config, oci_spec.clone(), rpc);
    let mut plan = MountPlan::new(Box::new(DirectMounter::new(builder.user_ns())));
    let mut session = builder.setup_session_layout(&mut plan)?;
    builder.populate(&mut plan, &mut session)?;
    builder.execute(&mut plan, &mut session)
}

/// Pick the layer strategy for an invocation.
///
/// Writable images take the rootfs as-is; otherwise overlayfs is
/// preferred when the kernel has it and no user namespace is in play,
/// with the underlay as the configured fallback.
pub(crate) fn select_layout(
    writable_image: bool,
    user_ns: bool,
    overlay_support: bool,
    enable_overlay: OverlayMode,
    enable_underlay: bool,
) -> LayerKind {
    if writable_image {
        return LayerKind::None;
    }
    if overlay_support
        && !user_ns
        && matches!(enable_overlay, OverlayMode::Yes | OverlayMode::Try)
    {
        return LayerKind::Overlay;
    }
    if enable_underlay {
        return LayerKind::Underlay;
    }
    LayerKind::None
}

/// Split an overlay image request `<path>[:ro|rw]` into path and
/// writability.
fn parse_image_spec(entry: &str) -> (&str, bool) {
    match entry.split_once(':') {
        Some((path, "ro")) => (path, false),
        Some((path, "rw")) => (path, true),
        _ => (entry, true),
    }
}

/// First path component of an absolute path: `/home/user` → `/home`.
fn root_dir(path: &str) -> Option<String> {
    path.split('/')
        .find(|component| !component.is_empty())
        .map(|component| format!("/{component}"))
}

/// Policy layer deciding what goes into the mount plan.
pub struct ContainerBuilder {
    config: EngineConfig,
    oci: oci::Spec,
    rpc: Rc<RefCell<dyn RpcClient>>,
    user_ns: bool,
    pid_ns: bool,
    home_dest: Option<String>,
    // Mounted by fd-path; the descriptors stay open until the plan runs.
    images: Vec<Image>,
}

impl ContainerBuilder {
    /// Create a builder, deriving namespace membership from the OCI spec.
    #[must_use]
    pub fn new(config: EngineConfig, oci: oci::Spec, rpc: Rc<RefCell<dyn RpcClient>>) -> Self {
        let user_ns = oci.has_namespace(NamespaceType::User);
        let pid_ns = oci.has_namespace(NamespaceType::Pid);
        Self {
            config,
            oci,
            rpc,
            user_ns,
            pid_ns,
            home_dest: None,
            images: Vec::new(),
        }
    }

    /// Whether the invocation runs inside a user namespace.
    #[must_use]
    pub fn user_ns(&self) -> bool {
        self.user_ns
    }

    /// Select the layer, create the session, and register the layer
    /// realization and mounter-switch hooks.
    ///
    /// Rootfs and layer establishment run while the engine can still call
    /// `mount(2)` itself; afterwards a hook swaps in the RPC mounter so
    /// every remaining mount goes through the narrower helper. For plain
    /// layouts the switch happens right after the rootfs instead.
    pub fn setup_session_layout(&mut self, plan: &mut MountPlan) -> VesselResult<Session> {
        let overlay_support = proc::has_filesystem("overlay").unwrap_or(false);
        let kind = select_layout(
            self.config.writable_image,
            self.user_ns,
            overlay_support,
            self.config.enable_overlay,
            self.config.enable_underlay,
        );

        let base = self
            .config
            .sessiondir_prefix
            .clone()
            .unwrap_or_else(|| SESSION_BASE.clone());
        let size = if rustix::process::geteuid().is_root() {
            0
        } else {
            self.config.session_max_size
        };

        tracing::debug!(?kind, base = %base.display(), "creating session layout");
        let mut session = Session::new(&base, &self.config.session_fs_type, size, plan, kind)?;

        match kind {
            LayerKind::None => {
                plan.run_after_tag(Tag::Rootfs, self.switch_mounter_hook())?;
            }
            LayerKind::Overlay => {
                self.add_overlay_images(plan, &mut session)?;
                plan.run_after_tag(Tag::PreLayer, Box::new(overlay::realize))?;
                plan.run_after_tag(Tag::Layer, self.switch_mounter_hook())?;
            }
            LayerKind::Underlay => {
                plan.run_after_tag(Tag::PreLayer, Box::new(underlay::realize))?;
                plan.run_after_tag(Tag::Layer, self.switch_mounter_hook())?;
            }
        }
        Ok(session)
    }

    /// Populate every concern in fixed order.
    pub fn populate(&mut self, plan: &mut MountPlan, session: &mut Session) -> VesselResult<()> {
        self.add_rootfs_mount(plan, session)?;
        self.add_kernel_mount(plan)?;
        self.add_dev_mount(plan, session)?;
        self.add_host_mount(plan)?;
        self.add_binds_mount(plan)?;
        self.add_home_mount(plan, session)?;
        self.add_userbinds_mount(plan)?;
        self.add_tmp_mount(plan, session)?;
        self.add_scratch_mount(plan, session)?;
        self.add_cwd_mount(plan)?;
        self.register_files_hook(plan)
    }

    /// Replay the plan, then chroot into the finished root through the
    /// helper and leave the working directory somewhere that exists.
    pub fn execute(&mut self, plan: &mut MountPlan, session: &mut Session) -> VesselResult<()> {
        tracing::debug!("mounting all registered points");
        plan.mount_all(session)?;
        // The image descriptors were mounted by fd-path; the kernel holds
        // its own references now.
        self.images.clear();

        let final_path = session.final_path();
        tracing::debug!(path = %final_path.display(), "entering container root");
        self.rpc
            .borrow_mut()
            .chroot(&final_path.to_string_lossy())?;

        std::env::set_current_dir("/")
            .map_err(|err| VesselError::mount(format!("change directory failed: {err}")))
    }

    fn switch_mounter_hook(&self) -> crate::mount::AfterTagHook {
        let rpc = Rc::clone(&self.rpc);
        Box::new(move |plan, _session| {
            tracing::debug!("switching to RPC mounter");
            plan.set_mounter(Box::new(RpcMounter::new(Rc::clone(&rpc))));
            Ok(())
        })
    }

    /// Open an image and enforce the administrator's allow-lists.
    fn load_image(&self, path: &str, writable: bool) -> VesselResult<Image> {
        let image = Image::open(Path::new(path), writable)?;

        if !self.config.limit_container_paths.is_empty()
            && !image.authorized_path(&self.config.limit_container_paths)?
        {
            return Err(VesselError::image(
                "container image is not in an allowed configured path",
            ));
        }
        if !self.config.limit_container_groups.is_empty()
            && !image.authorized_group(&self.config.limit_container_groups)?
        {
            return Err(VesselError::image(
                "container image is not owned by a required group",
            ));
        }
        if !self.config.limit_container_owners.is_empty()
            && !image.authorized_owner(&self.config.limit_container_owners)?
        {
            return Err(VesselError::image(
                "container image is not owned by a required user",
            ));
        }

        let allowed = match image.kind {
            ImageKind::Sandbox => self.config.allow_container_dir,
            ImageKind::Ext3 => self.config.allow_container_extfs,
            ImageKind::Squashfs => self.config.allow_container_squashfs,
        };
        if !allowed {
            return Err(VesselError::image(format!(
                "configuration disallows users from running {:?} based containers",
                image.kind
            )));
        }
        Ok(image)
    }

    fn add_rootfs_mount(&mut self, plan: &mut MountPlan, session: &mut Session) -> VesselResult<()> {
        let mut mount_flags = MS_NOSUID | MS_NODEV;
        let rootfs = self.config.image_path.clone();
        let image = self.load_image(&rootfs, self.config.writable_image)?;
        let rootfs_path = session.rootfs_path();
        let rootfs_dest = rootfs_path.to_string_lossy();

        if image.kind == ImageKind::Sandbox {
            tracing::debug!(path = %rootfs, "mounting directory rootfs");
            mount_flags |= MS_BIND;
            plan.add_bind(Tag::Rootfs, &rootfs, &rootfs_dest, mount_flags)?;
            // Remounted once inside the namespace so the restricting
            // flags actually apply.
            plan.add_remount(Tag::PreLayer, &rootfs_dest, mount_flags)?;
            return Ok(());
        }

        if !image.writable {
            mount_flags |= MS_RDONLY;
        }
        let source = image.fd_source()?;
        tracing::debug!(fstype = image.fstype(), path = %rootfs, "mounting block image rootfs");
        plan.add_image(
            Tag::Rootfs,
            &source,
            &rootfs_dest,
            image.fstype(),
            mount_flags,
            image.offset,
            image.size,
        )?;
        self.images.push(image);
        Ok(())
    }

    fn add_overlay_images(&mut self, plan: &mut MountPlan, session: &mut Session) -> VesselResult<()> {
        for (index, entry) in self.config.overlay_images.clone().iter().enumerate() {
            let (path, writable) = parse_image_spec(entry);
            let image = self.load_image(path, writable).map_err(|err| {
                VesselError::image(format!("failed to open overlay image {path}: {err}"))
            })?;

            let session_dest = format!("/overlay-images/{index}");
            session.add_dir(&session_dest)?;
            let dest = session.get_path(&session_dest)?;
            let dest = dest.to_string_lossy().into_owned();

            let mut mount_flags = MS_NOSUID | MS_NODEV;
            match image.kind {
                ImageKind::Ext3 => {
                    plan.add_image(
                        Tag::PreLayer,
                        &image.fd_source()?,
                        &dest,
                        "ext3",
                        mount_flags,
                        image.offset,
                        image.size,
                    )?;
                    if writable {
                        plan.run_after_tag(Tag::PreLayer, Box::new(overlay_upper_work))?;
                    } else {
                        add_lower_dir(session, dest)?;
                    }
                }
                ImageKind::Squashfs => {
                    mount_flags |= MS_RDONLY;
                    plan.add_image(
                        Tag::PreLayer,
                        &image.fd_source()?,
                        &dest,
                        "squashfs",
                        mount_flags,
                        image.offset,
                        image.size,
                    )?;
                    if writable {
                        tracing::warn!(path, "squashfs is not a writable filesystem");
                    }
                    add_lower_dir(session, dest)?;
                }
                ImageKind::Sandbox => {
                    if !rustix::process::geteuid().is_root() {
                        return Err(VesselError::config(
                            "only the root user can use a sandbox as an overlay",
                        ));
                    }
                    plan.add_bind(Tag::PreLayer, path, &dest, mount_flags)?;
                    plan.add_remount(Tag::PreLayer, &dest, mount_flags)?;
                    if writable {
                        plan.run_after_tag(Tag::PreLayer, Box::new(overlay_upper_work))?;
                    } else {
                        add_lower_dir(session, dest)?;
                    }
                }
            }
            if image.file.is_some() {
                self.images.push(image);
            }
        }
        Ok(())
    }

    fn add_kernel_mount(&self, plan: &mut MountPlan) -> VesselResult<()> {
        let bind_flags = MS_BIND | MS_NOSUID | MS_NODEV | MS_REC;

        if self.config.mount_proc {
            tracing::debug!("adding /proc to mount list");
            if self.pid_ns {
                plan.add_fs(Tag::Kernel, "/proc", "proc", MS_NOSUID | MS_NODEV, "")?;
            } else {
                plan.add_bind(Tag::Kernel, "/proc", "/proc", bind_flags)?;
                if !self.user_ns {
                    plan.add_remount(Tag::Kernel, "/proc", bind_flags)?;
                }
            }
        } else {
            tracing::debug!("skipping /proc mount");
        }

        if self.config.mount_sys {
            tracing::debug!("adding /sys to mount list");
            if !self.user_ns {
                plan.add_fs(Tag::Kernel, "/sys", "sysfs", MS_NOSUID | MS_NODEV, "")?;
            } else {
                plan.add_bind(Tag::Kernel, "/sys", "/sys", bind_flags)?;
            }
        } else {
            tracing::debug!("skipping /sys mount");
        }
        Ok(())
    }

    /// Stage a device node file and bind the host node onto it.
    fn bind_dev(&self, plan: &mut MountPlan, session: &mut Session, devpath: &str) -> VesselResult<()> {
        session.add_file(devpath, b"")?;
        let dest = session.get_path(devpath)?;
        tracing::debug!(device = devpath, "staging device bind");
        plan.add_bind(Tag::Dev, devpath, &dest.to_string_lossy(), MS_BIND)
    }

    fn add_dev_mount(&self, plan: &mut MountPlan, session: &mut Session) -> VesselResult<()> {
        if self.config.mount_dev == DevMode::Minimal || self.config.contain {
            tracing::debug!("creating staged /dev");
            session.add_dir("/dev")?;
            session.add_dir("/dev/shm")?;
            let shm = session.get_path("/dev/shm")?;
            plan.add_fs(
                Tag::Dev,
                &shm.to_string_lossy(),
                &self.config.memory_fs_type,
                MS_NOSUID | MS_NODEV,
                "mode=1777",
            )?;

            if self.config.mount_devpts {
                if !Path::new("/dev/pts/ptmx").exists() {
                    return Err(VesselError::config(
                        "multiple devpts instances unsupported and /dev/pts configured",
                    ));
                }
                session.add_dir("/dev/pts")?;
                let mut options = "mode=0620,newinstance,ptmxmode=0666".to_string();
                if self.user_ns {
                    tracing::debug!("not setting devpts gid: user namespace enabled");
                } else {
                    let tty = identity::group_by_name("tty")?.ok_or_else(|| {
                        VesselError::config("problem resolving 'tty' group GID")
                    })?;
                    options.push_str(&format!(",gid={}", tty.gid));
                }
                let devpts = session.get_path("/dev/pts")?;
                tracing::debug!("mounting devpts for staged /dev/pts");
                plan.add_fs(
                    Tag::Dev,
                    &devpts.to_string_lossy(),
                    "devpts",
                    MS_NOSUID | MS_NOEXEC,
                    &options,
                )?;
                self.bind_dev(plan, session, "/dev/tty")?;
                session.add_symlink("/dev/ptmx", "/dev/pts/ptmx")?;
            }

            self.bind_dev(plan, session, "/dev/null")?;
            self.bind_dev(plan, session, "/dev/zero")?;
            self.bind_dev(plan, session, "/dev/random")?;
            self.bind_dev(plan, session, "/dev/urandom")?;

            if self.config.nv_gpu {
                for entry in std::fs::read_dir("/dev")? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with("nvidia") {
                        self.bind_dev(plan, session, &format!("/dev/{name}"))?;
                    }
                }
            }

            session.add_symlink("/dev/fd", "/proc/self/fd")?;
            session.add_symlink("/dev/stdin", "/proc/self/fd/0")?;
            session.add_symlink("/dev/stdout", "/proc/self/fd/1")?;
            session.add_symlink("/dev/stderr", "/proc/self/fd/2")?;

            let staged = session.get_path("/dev")?;
            plan.add_bind(
                Tag::Dev,
                &staged.to_string_lossy(),
                "/dev",
                MS_BIND | MS_NOSUID | MS_REC,
            )?;
        } else if self.config.mount_dev == DevMode::Yes {
            tracing::debug!("binding host /dev");
            plan.add_bind(Tag::Dev, "/dev", "/dev", MS_BIND | MS_NOSUID | MS_REC)?;
        } else {
            tracing::debug!("not mounting /dev inside the container");
        }
        Ok(())
    }

    fn add_host_mount(&self, plan: &mut MountPlan) -> VesselResult<()> {
        if !self.config.mount_hostfs {
            tracing::debug!("not mounting host file systems per configuration");
            return Ok(());
        }

        let info = proc::parse_mount_info(Path::new("/proc/self/mountinfo"))?;
        let bind_flags = MS_BIND | MS_NOSUID | MS_NODEV | MS_REC;
        let Some(children) = info.get("/") else {
            return Ok(());
        };
        for child in children {
            let skipped = ["/proc", "/sys", "/dev", "/run", "/boot", "/var"]
                .iter()
                .any(|prefix| child.starts_with(prefix));
            if skipped {
                tracing::debug!(path = %child, "skipping virtual or volatile file system");
                continue;
            }
            tracing::debug!(path = %child, "adding host file system to mount list");
            plan.add_bind(Tag::Hostfs, child, child, bind_flags)?;
            plan.add_remount(Tag::Hostfs, child, bind_flags)?;
        }
        Ok(())
    }

    fn add_binds_mount(&self, plan: &mut MountPlan) -> VesselResult<()> {
        if self.config.contain {
            tracing::debug!("skipping bind mounts as contain was requested");
            return Ok(());
        }

        let bind_flags = MS_BIND | MS_NOSUID | MS_NODEV | MS_REC;
        for bindpath in &self.config.global_bind_path {
            let (src, dest) = bindpath
                .split_once(':')
                .unwrap_or((bindpath.as_str(), bindpath.as_str()));
            tracing::debug!(src, dest, "found 'bind path' entry");
            plan.add_bind(Tag::Binds, src, dest, bind_flags)?;
        }
        Ok(())
    }

    fn add_home_mount(&mut self, plan: &mut MountPlan, session: &mut Session) -> VesselResult<()> {
        if self.config.no_home {
            tracing::debug!("skipping home directory mount by user request");
            return Ok(());
        }
        if !self.config.mount_home {
            tracing::debug!("skipping home directory mount per configuration");
            return Ok(());
        }

        let uid = rustix::process::getuid().as_raw();
        let pw = identity::user_by_uid(uid)?
            .ok_or_else(|| VesselError::config("failed to retrieve user information"))?;

        let spec = if self.config.home_spec.is_empty() {
            pw.dir.clone()
        } else {
            self.config.home_spec.clone()
        };
        let (src, dest) = match spec.split_once(':') {
            Some((src, dest)) => (src.to_string(), dest.to_string()),
            None => (spec.clone(), spec.clone()),
        };
        if !src.starts_with('/') {
            tracing::warn!(path = %src, "can't determine absolute path of home directory");
        }

        let custom_home = src != pw.dir;
        if custom_home && !self.config.user_bind_control {
            return Err(VesselError::config(
                "not mounting user requested home: user bind control is disallowed",
            ));
        }
        self.home_dest = Some(dest.clone());

        let bind_flags = MS_BIND | MS_NOSUID | MS_NODEV | MS_REC;
        if matches!(session.layer(), Layer::None) {
            // No layer to synthesize the target: stage the home under the
            // session and push its base directory in at the very end.
            tracing::debug!("staging home directory base");
            session.add_dir(&dest)?;
            let staged = session.get_path(&dest)?;
            let staged = staged.to_string_lossy();
            plan.add_bind(Tag::Home, &src, &staged, bind_flags)?;
            plan.add_remount(Tag::Home, &staged, bind_flags)?;

            let base = root_dir(&dest).ok_or_else(|| {
                VesselError::config(format!("could not identify base home directory path: {dest}"))
            })?;
            let staged_base = session.get_path(&base)?;
            tracing::debug!(base = %base, "mounting staged home base into the container");
            plan.add_bind(Tag::Final, &staged_base.to_string_lossy(), &base, bind_flags)?;
        } else {
            tracing::debug!(src = %src, dest = %dest, "adding home to mount list");
            plan.add_bind(Tag::Home, &src, &dest, bind_flags)?;
            plan.add_remount(Tag::Home, &dest, bind_flags)?;
        }
        Ok(())
    }

    fn add_userbinds_mount(&self, plan: &mut MountPlan) -> VesselResult<()> {
        if self.config.bind_path.is_empty() {
            return Ok(());
        }
        if !self.config.user_bind_control {
            tracing::warn!("ignoring user bind request: user bind control disabled by system administrator");
            return Ok(());
        }

        for entry in &self.config.bind_path {
            let parts: Vec<&str> = entry.split(':').collect();
            let src = parts[0];
            if !src.starts_with('/') {
                tracing::warn!(path = %src, "can't determine absolute path of bind point");
                continue;
            }
            let dest = parts.get(1).copied().unwrap_or(src);
            let mut bind_flags = MS_BIND | MS_NOSUID | MS_NODEV | MS_REC;
            if let Some(option) = parts.get(2) {
                match *option {
                    "ro" => bind_flags |= MS_RDONLY,
                    "rw" => {}
                    other => {
                        tracing::warn!(
                            path = %src,
                            option = %other,
                            "not mounting requested bind point, invalid mount option"
                        );
                        continue;
                    }
                }
            }
            tracing::debug!(src, dest, "adding user bind to mount list");
            plan.add_bind(Tag::Userbinds, src, dest, bind_flags)?;
            plan.add_remount(Tag::Userbinds, dest, bind_flags)?;
        }
        Ok(())
    }

    fn add_tmp_mount(&self, plan: &mut MountPlan, session: &mut Session) -> VesselResult<()> {
        if !self.config.mount_tmp {
            tracing::debug!("skipping tmp directory mounting per configuration");
            return Ok(());
        }

        let mut tmp_source = "/tmp".to_string();
        let mut vartmp_source = "/var/tmp".to_string();

        if self.config.contain {
            if let Some(workdir) = &self.config.workdir {
                if !self.config.user_bind_control {
                    tracing::warn!("user bind control is disabled by system administrator");
                    return Ok(());
                }
                if !workdir.starts_with('/') {
                    tracing::warn!(path = %workdir, "can't determine absolute path of workdir");
                }
                tmp_source = format!("{workdir}/tmp");
                // Flattened on purpose: some scratch filesystems reject
                // nested source trees.
                vartmp_source = format!("{workdir}/var_tmp");
                for dir in [&tmp_source, &vartmp_source] {
                    std::fs::create_dir_all(dir).map_err(|err| {
                        VesselError::session(format!("failed to create {dir}: {err}"))
                    })?;
                }
            } else {
                session.add_dir("/tmp")?;
                session.add_dir("/var/tmp")?;
                tmp_source = session.get_path("/tmp")?.to_string_lossy().into_owned();
                vartmp_source = session.get_path("/var/tmp")?.to_string_lossy().into_owned();
            }
        }

        let bind_flags = MS_BIND | MS_NOSUID | MS_NODEV | MS_REC;
        plan.add_bind(Tag::Tmp, &tmp_source, "/tmp", bind_flags)
            .map_err(|err| {
                VesselError::mount(format!("could not mount container's /tmp: {err}"))
            })?;
        plan.add_remount(Tag::Tmp, "/tmp", bind_flags)?;
        plan.add_bind(Tag::Tmp, &vartmp_source, "/var/tmp", bind_flags)
            .map_err(|err| {
                VesselError::mount(format!("could not mount container's /var/tmp: {err}"))
            })?;
        plan.add_remount(Tag::Tmp, "/var/tmp", bind_flags)?;
        Ok(())
    }

    fn add_scratch_mount(&self, plan: &mut MountPlan, session: &mut Session) -> VesselResult<()> {
        let mut scratch = self.config.scratch_dirs.clone();
        if scratch.is_empty() {
            tracing::debug!("not mounting scratch directory: not requested");
            return Ok(());
        }
        if scratch.len() == 1 {
            // A single entry may carry a comma-separated list.
            scratch = scratch[0].split(',').map(str::to_string).collect();
        }
        if !self.config.user_bind_control {
            tracing::debug!("not mounting scratch: user bind control disabled by system administrator");
            return Ok(());
        }

        let bind_flags = MS_BIND | MS_NOSUID | MS_NODEV | MS_REC;
        for dir in &scratch {
            let base_name = Path::new(dir)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    VesselError::config(format!("invalid scratch directory path: {dir}"))
                })?;

            let source = if let Some(workdir) = &self.config.workdir {
                let source = format!("{workdir}/scratch/{base_name}");
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o750)
                    .create(&source)
                    .map_err(|err| {
                        VesselError::session(format!(
                            "could not create scratch working directory {source}: {err}"
                        ))
                    })?;
                source
            } else {
                let staged = format!("/scratch/{base_name}");
                session.add_dir(&staged)?;
                session.get_path(&staged)?.to_string_lossy().into_owned()
            };

            plan.add_bind(Tag::Scratch, &source, dir, bind_flags)?;
            plan.add_remount(Tag::Scratch, dir, bind_flags)?;
        }
        Ok(())
    }

    fn add_cwd_mount(&self, plan: &mut MountPlan) -> VesselResult<()> {
        if self.config.contain {
            tracing::debug!("not mounting current directory: contain was requested");
            return Ok(());
        }
        if !self.config.user_bind_control {
            tracing::warn!("not mounting current directory: user bind control is disabled by system administrator");
            return Ok(());
        }
        let Some(process) = &self.oci.process else {
            return Ok(());
        };
        let cwd = &process.cwd;
        if cwd.is_empty() {
            return Ok(());
        }

        if let Err(err) = std::env::set_current_dir(cwd) {
            tracing::debug!(cwd = %cwd, error = %err, "can't go to container working directory");
            return Ok(());
        }
        let current = std::env::current_dir()?;
        let current = current.to_string_lossy().into_owned();

        if PROTECTED_CWD.contains(&current.as_str()) {
            tracing::debug!(cwd = %current, "not mounting CWD within an operating system directory");
            return Ok(());
        }
        if ["/sys", "/proc", "/dev"].iter().any(|p| current.starts_with(p)) {
            tracing::debug!(cwd = %current, "not mounting CWD within a virtual directory");
            return Ok(());
        }

        let bind_flags = MS_BIND | MS_NOSUID | MS_NODEV | MS_REC;
        match plan.add_bind(Tag::Cwd, &current, cwd, bind_flags) {
            Ok(()) => plan.add_remount(Tag::Cwd, cwd, bind_flags),
            Err(err) => {
                tracing::warn!(cwd = %current, error = %err, "could not bind CWD into container");
                Ok(())
            }
        }
    }

    /// Register the identity-file synthesis as an after-layer hook so it
    /// sees the final rootfs. The binds land at [`Tag::Files`], late
    /// enough that no later bind can eclipse them.
    fn register_files_hook(&self, plan: &mut MountPlan) -> VesselResult<()> {
        let config_passwd = self.config.config_passwd;
        let config_group = self.config.config_group;
        let home_dest = self.home_dest.clone();
        let uid = rustix::process::getuid().as_raw();

        plan.run_after_tag(
            Tag::Layer,
            Box::new(move |plan, session| {
                if rustix::process::geteuid().is_root() {
                    tracing::debug!("not updating passwd/group files, running as root");
                    return Ok(());
                }
                let rootfs = session.rootfs_path();

                if config_passwd {
                    let home = match &home_dest {
                        Some(home) => home.clone(),
                        None => identity::user_by_uid(uid)?
                            .map(|pw| pw.dir)
                            .unwrap_or_default(),
                    };
                    match identity::container_passwd(&rootfs.join("etc/passwd"), uid, &home) {
                        Err(err) => tracing::warn!(error = %err, "passwd synthesis failed"),
                        Ok(content) => {
                            session.add_file("/etc/passwd", &content)?;
                            let staged = session.get_path("/etc/passwd")?;
                            tracing::debug!("adding /etc/passwd to mount list");
                            plan.add_bind(
                                Tag::Files,
                                &staged.to_string_lossy(),
                                "/etc/passwd",
                                MS_BIND,
                            )?;
                        }
                    }
                } else {
                    tracing::debug!("skipping bind of the container /etc/passwd");
                }

                if config_group {
                    match identity::container_group(&rootfs.join("etc/group"), uid) {
                        Err(err) => tracing::warn!(error = %err, "group synthesis failed"),
                        Ok(content) => {
                            session.add_file("/etc/group", &content)?;
                            let staged = session.get_path("/etc/group")?;
                            tracing::debug!("adding /etc/group to mount list");
                            plan.add_bind(
                                Tag::Files,
                                &staged.to_string_lossy(),
                                "/etc/group",
                                MS_BIND,
                            )?;
                        }
                    }
                } else {
                    tracing::debug!("skipping bind of the container /etc/group");
                }

                session.update()
            }),
        )
    }
}

/// Locate the writable overlay contribution mounted at `PreLayer` and
/// declare its `upper/` and `work/` subdirectories to the overlay layer.
fn overlay_upper_work(plan: &mut MountPlan, session: &mut Session) -> VesselResult<()> {
    let point = plan
        .get_by_tag(Tag::PreLayer)
        .iter()
        .find(|p| {
            p.fstype == "ext3"
                || (!p.source.is_empty() && !p.destination.is_empty() && p.fstype.is_empty())
        })
        .cloned()
        .ok_or_else(|| VesselError::config("no writable overlay contribution found"))?;

    let upper = format!("{}/upper", point.destination);
    let work = format!("{}/work", point.destination);

    for dir in [&upper, &work] {
        match std::fs::symlink_metadata(dir) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(VesselError::config(format!(
                    "symlink detected, overlay {dir} must be a directory"
                )));
            }
            Ok(_) => {}
            Err(_) => {
                std::fs::create_dir_all(dir).map_err(|err| {
                    VesselError::session(format!("failed to create {dir}: {err}"))
                })?;
            }
        }
    }

    match session.layer_mut() {
        Layer::Overlay(overlay) => {
            overlay.add_upper_dir(upper)?;
            overlay.add_work_dir(work)?;
            Ok(())
        }
        _ => Err(VesselError::config("no overlay layer active")),
    }
}

fn add_lower_dir(session: &mut Session, dir: String) -> VesselResult<()> {
    match session.layer_mut() {
        Layer::Overlay(overlay) => {
            overlay.add_lower_dir(dir);
            Ok(())
        }
        _ => Err(VesselError::config("no overlay layer active")),
    }
}
