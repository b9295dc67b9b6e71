//! iSCSI session and multipath binding capability.
//!
//! [`Attacher`] is the seam between the staging state machine and the host's
//! iSCSI/multipath tooling.  [`IscsiAttacher`] drives the real tools
//! (`iscsiadm`, `scsi_id`, `multipath`) through a [`CommandRunner`], so tests
//! can script tool behavior without touching the host.
//!
//! Every operation is idempotent under retry: session state is re-queried
//! from `iscsiadm` on each call rather than cached, and the binding file is
//! rewritten as a whole rather than patched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::CsiError;

/// Path of the multipath alias-binding file.
pub const MULTIPATH_BINDINGS: &str = "/etc/multipath/bindings";
/// Directory of iSCSI `by-path` device symlinks.
pub const BY_PATH_DIR: &str = "/dev/disk/by-path";
/// Binding keys with this prefix are auto-generated multipath maps, not
/// operator-intended aliases; they are routed to the discard set.
pub const DISCARD_PREFIX: &str = "mpath";

const ISCSIADM_EXEC: &str = "iscsiadm";
const SCSI_ID_EXEC: &str = "/lib/udev/scsi_id";
const MULTIPATH_EXEC: &str = "/sbin/multipath";

/// `multipath` hangs when run inside a container, but is safe to terminate.
const MULTIPATH_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Command runner
// ---------------------------------------------------------------------------

/// Capability for invoking host commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion, returning its combined output.  A
    /// non-zero exit is a [`CsiError::CommandFailed`] carrying the full
    /// command line and output.
    async fn run(&self, command: &str, args: &[&str]) -> Result<String, CsiError>;

    /// Like [`CommandRunner::run`], but a command still running after
    /// `timeout` is terminated and treated as complete, with whatever output
    /// was collected.
    async fn run_with_timeout(
        &self,
        command: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String, CsiError>;
}

/// The production [`CommandRunner`] backed by [`tokio::process::Command`].
pub struct HostCommandRunner;

fn render_command(command: &str, args: &[&str]) -> String {
    let mut rendered = command.to_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, command: &str, args: &[&str]) -> Result<String, CsiError> {
        let rendered = render_command(command, args);
        let output = Command::new(command)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                warn!(command = %rendered, error = %e, "command failed to start");
                CsiError::CommandFailed {
                    command: rendered.clone(),
                    output: e.to_string(),
                }
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            warn!(command = %rendered, output = %combined, "command exited non-zero");
            return Err(CsiError::CommandFailed {
                command: rendered,
                output: combined,
            });
        }
        debug!(command = %rendered, "command complete");
        Ok(combined)
    }

    async fn run_with_timeout(
        &self,
        command: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String, CsiError> {
        match tokio::time::timeout(timeout, self.run(command, args)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    command = %render_command(command, args),
                    ?timeout,
                    "command timed out, treating as complete",
                );
                Ok(String::new())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Binding-file codec
// ---------------------------------------------------------------------------

/// Parse the binding file into (keep, discard) maps.
///
/// Lines are `alias scsi_id` pairs; `#`-prefixed lines and lines without
/// exactly two fields are ignored.  Aliases with the reserved prefix go to
/// the discard map.
pub fn parse_bindings(contents: &str) -> (HashMap<String, String>, HashMap<String, String>) {
    let mut bindings = HashMap::new();
    let mut discard = HashMap::new();
    for line in contents.lines() {
        if line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(alias), Some(id), None) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        if alias.starts_with(DISCARD_PREFIX) {
            discard.insert(alias.to_owned(), id.to_owned());
        } else {
            bindings.insert(alias.to_owned(), id.to_owned());
        }
    }
    (bindings, discard)
}

/// Render a binding map back to the file format.
pub fn render_bindings(bindings: &HashMap<String, String>) -> String {
    let mut out = String::new();
    for (alias, id) in bindings {
        out.push_str(alias);
        out.push(' ');
        out.push_str(id);
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Attacher capability
// ---------------------------------------------------------------------------

/// Capability for iSCSI session lifecycle and multipath binding management.
#[async_trait]
pub trait Attacher: Send + Sync {
    /// Make the host's iSCSI stack aware of the targets at `portal`.
    async fn discover(&self, portal: &str) -> Result<(), CsiError>;

    /// Whether a session to (`portal`, `iqn`) currently exists.
    async fn has_session(&self, portal: &str, iqn: &str) -> Result<bool, CsiError>;

    /// Log in to (`portal`, `iqn`); a no-op when a session already exists.
    async fn login(&self, portal: &str, iqn: &str) -> Result<(), CsiError>;

    /// Log out of (`portal`, `iqn`); a no-op when no session exists.
    async fn logout(&self, portal: &str, iqn: &str) -> Result<(), CsiError>;

    /// Resolve the udev unique identifier for a SCSI device node.
    async fn scsi_id(&self, device_path: &Path) -> Result<String, CsiError>;

    /// Resolve the `by-path` symlink matching (`portal`, `iqn`) to its real
    /// device node.
    async fn device_path(&self, portal: &str, iqn: &str) -> Result<PathBuf, CsiError>;

    /// Read the binding file into (keep, discard) maps.  An absent file
    /// yields empty maps.
    async fn read_bindings(
        &self,
    ) -> Result<(HashMap<String, String>, HashMap<String, String>), CsiError>;

    /// Atomically rewrite the binding file from the full map.
    async fn write_bindings(&self, bindings: &HashMap<String, String>) -> Result<(), CsiError>;

    /// Remove (flush) the multipath map named `alias`.
    async fn multipath_flush(&self, alias: &str) -> Result<(), CsiError>;

    /// Ask multipath to (re)build the map named `alias`.
    async fn multipath_rescan(&self, alias: &str) -> Result<(), CsiError>;

    /// List the multipath topology for `device_path`; best-effort, may be
    /// empty right after a rescan.
    async fn multipath_status(&self, device_path: &Path) -> Result<String, CsiError>;
}

/// The production [`Attacher`], shelling out through a [`CommandRunner`].
pub struct IscsiAttacher<R> {
    runner: R,
    bindings_path: PathBuf,
    by_path_dir: PathBuf,
}

impl<R: CommandRunner> IscsiAttacher<R> {
    /// Attacher using the fixed host paths.
    pub fn new(runner: R) -> Self {
        Self::with_paths(runner, MULTIPATH_BINDINGS, BY_PATH_DIR)
    }

    /// Attacher with alternate file locations, for tests.
    pub fn with_paths(
        runner: R,
        bindings_path: impl Into<PathBuf>,
        by_path_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            bindings_path: bindings_path.into(),
            by_path_dir: by_path_dir.into(),
        }
    }

    async fn multipath(&self, args: &[&str]) -> Result<String, CsiError> {
        self.runner
            .run_with_timeout(MULTIPATH_EXEC, args, MULTIPATH_TIMEOUT)
            .await
    }
}

#[async_trait]
impl<R: CommandRunner> Attacher for IscsiAttacher<R> {
    async fn discover(&self, portal: &str) -> Result<(), CsiError> {
        self.runner
            .run(
                ISCSIADM_EXEC,
                &[
                    "--mode",
                    "discovery",
                    "--portal",
                    portal,
                    "--type",
                    "sendtargets",
                    "--discover",
                ],
            )
            .await?;
        Ok(())
    }

    async fn has_session(&self, portal: &str, iqn: &str) -> Result<bool, CsiError> {
        let out = match self.runner.run(ISCSIADM_EXEC, &["--mode", "session"]).await {
            Ok(out) => out,
            // iscsiadm exits non-zero when there are no sessions at all;
            // an ambiguous failure defaults to "no session".
            Err(_) => return Ok(false),
        };
        let found = out.lines().any(|line| {
            line.find(portal)
                .is_some_and(|idx| line[idx + portal.len()..].contains(iqn))
        });
        Ok(found)
    }

    async fn login(&self, portal: &str, iqn: &str) -> Result<(), CsiError> {
        if self.has_session(portal, iqn).await? {
            debug!(portal, iqn, "session already established");
            return Ok(());
        }
        self.runner
            .run(
                ISCSIADM_EXEC,
                &[
                    "--mode",
                    "node",
                    "--portal",
                    portal,
                    "--targetname",
                    iqn,
                    "--login",
                ],
            )
            .await?;
        Ok(())
    }

    async fn logout(&self, portal: &str, iqn: &str) -> Result<(), CsiError> {
        if !self.has_session(portal, iqn).await? {
            debug!(portal, iqn, "no session to log out of");
            return Ok(());
        }
        self.runner
            .run(
                ISCSIADM_EXEC,
                &[
                    "--mode",
                    "node",
                    "--portal",
                    portal,
                    "--targetname",
                    iqn,
                    "--logout",
                ],
            )
            .await?;
        Ok(())
    }

    async fn scsi_id(&self, device_path: &Path) -> Result<String, CsiError> {
        let path = device_path.to_string_lossy();
        let out = self
            .runner
            .run(SCSI_ID_EXEC, &["-g", "-u", "-d", path.as_ref()])
            .await?;
        Ok(out.trim().to_owned())
    }

    async fn device_path(&self, portal: &str, iqn: &str) -> Result<PathBuf, CsiError> {
        let mut dir = tokio::fs::read_dir(&self.by_path_dir).await.map_err(|e| {
            CsiError::Internal(format!("read_dir {}: {e}", self.by_path_dir.display()))
        })?;

        let mut matched = None;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(CsiError::internal)?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name
                .find(portal)
                .is_some_and(|idx| name[idx + portal.len()..].contains(iqn))
            {
                matched = Some(entry.path());
                break;
            }
        }

        let link = matched.ok_or_else(|| {
            CsiError::DeviceNotFound(format!(
                "{}/*{portal}*{iqn}*",
                self.by_path_dir.display()
            ))
        })?;

        let meta = tokio::fs::symlink_metadata(&link)
            .await
            .map_err(CsiError::internal)?;
        if !meta.file_type().is_symlink() {
            return Err(CsiError::Internal(format!(
                "{} is not a link",
                link.display()
            )));
        }
        tokio::fs::canonicalize(&link).await.map_err(|e| {
            CsiError::Internal(format!("cannot resolve link {}: {e}", link.display()))
        })
    }

    async fn read_bindings(
        &self,
    ) -> Result<(HashMap<String, String>, HashMap<String, String>), CsiError> {
        let contents = match tokio::fs::read_to_string(&self.bindings_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((HashMap::new(), HashMap::new()));
            }
            Err(e) => {
                return Err(CsiError::Internal(format!(
                    "read {}: {e}",
                    self.bindings_path.display()
                )));
            }
        };
        Ok(parse_bindings(&contents))
    }

    async fn write_bindings(&self, bindings: &HashMap<String, String>) -> Result<(), CsiError> {
        // Write-then-rename so readers never observe a half-written file.
        let tmp = self.bindings_path.with_extension("tmp");
        tokio::fs::write(&tmp, render_bindings(bindings))
            .await
            .map_err(|e| CsiError::Internal(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.bindings_path)
            .await
            .map_err(|e| {
                CsiError::Internal(format!(
                    "rename {} -> {}: {e}",
                    tmp.display(),
                    self.bindings_path.display()
                ))
            })
    }

    async fn multipath_flush(&self, alias: &str) -> Result<(), CsiError> {
        self.multipath(&["-f", alias]).await?;
        Ok(())
    }

    async fn multipath_rescan(&self, alias: &str) -> Result<(), CsiError> {
        self.multipath(&[alias]).await?;
        Ok(())
    }

    async fn multipath_status(&self, device_path: &Path) -> Result<String, CsiError> {
        let path = device_path.to_string_lossy();
        self.multipath(&["-ll", path.as_ref()]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const PORTAL: &str = "10.144.144.226";
    const IQN: &str = "iqn.2013-05.com.daterainc:tc:01:sn:b06f15a423fec58b";

    /// Scripted runner that models the host's session table.
    #[derive(Default)]
    struct FakeRunner {
        sessions: Mutex<Vec<(String, String)>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn login_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.contains("--login"))
                .count()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, command: &str, args: &[&str]) -> Result<String, CsiError> {
            let rendered = render_command(command, args);
            self.calls.lock().unwrap().push(rendered.clone());

            if args.contains(&"--login") {
                let portal = args[args.iter().position(|a| *a == "--portal").unwrap() + 1];
                let iqn = args[args.iter().position(|a| *a == "--targetname").unwrap() + 1];
                self.sessions
                    .lock()
                    .unwrap()
                    .push((portal.to_owned(), iqn.to_owned()));
                return Ok(String::new());
            }
            if args.contains(&"--logout") {
                let portal = args[args.iter().position(|a| *a == "--portal").unwrap() + 1];
                self.sessions.lock().unwrap().retain(|(p, _)| p != portal);
                return Ok(String::new());
            }
            if args == ["--mode", "session"] {
                let sessions = self.sessions.lock().unwrap();
                if sessions.is_empty() {
                    // iscsiadm exits 21 when no sessions exist.
                    return Err(CsiError::CommandFailed {
                        command: rendered,
                        output: "iscsiadm: No active sessions.".into(),
                    });
                }
                let out = sessions
                    .iter()
                    .enumerate()
                    .map(|(i, (p, q))| format!("tcp: [{i}] {p}:3260,1 {q}\n"))
                    .collect();
                return Ok(out);
            }
            Ok(String::new())
        }

        async fn run_with_timeout(
            &self,
            command: &str,
            args: &[&str],
            _timeout: Duration,
        ) -> Result<String, CsiError> {
            self.run(command, args).await
        }
    }

    fn attacher(runner: FakeRunner) -> IscsiAttacher<FakeRunner> {
        IscsiAttacher::with_paths(runner, "/tmp/unused-bindings", "/tmp/unused-by-path")
    }

    #[tokio::test]
    async fn has_session_defaults_to_false_without_sessions() {
        let attacher = attacher(FakeRunner::default());
        assert!(!attacher.has_session(PORTAL, IQN).await.unwrap());
    }

    #[tokio::test]
    async fn login_is_skipped_when_session_exists() {
        let attacher = attacher(FakeRunner::default());

        attacher.login(PORTAL, IQN).await.unwrap();
        assert_eq!(attacher.runner.login_count(), 1);

        // The session now exists; a second login call must short-circuit.
        attacher.login(PORTAL, IQN).await.unwrap();
        assert_eq!(attacher.runner.login_count(), 1);
    }

    #[tokio::test]
    async fn logout_without_session_is_a_noop() {
        let attacher = attacher(FakeRunner::default());
        attacher.logout(PORTAL, IQN).await.unwrap();
        assert!(!attacher.runner.calls().iter().any(|c| c.contains("--logout")));
    }

    #[tokio::test]
    async fn login_logout_cycle() {
        let attacher = attacher(FakeRunner::default());
        attacher.login(PORTAL, IQN).await.unwrap();
        assert!(attacher.has_session(PORTAL, IQN).await.unwrap());
        attacher.logout(PORTAL, IQN).await.unwrap();
        assert!(!attacher.has_session(PORTAL, IQN).await.unwrap());
    }

    #[test]
    fn bindings_parse_routes_reserved_prefix_to_discard() {
        let contents = "\
# Multipath bindings, Version : 1.0
volume-3ee59355 360014055a1a42a8b84886626cc532f05
mpatha 36001405aaaaaaaaaaaaaaaaaaaaaaaaa

malformed line with extra fields
volume-4b6ed3d8 36001405bbbbbbbbbbbbbbbbbbbbbbbb
";
        let (bindings, discard) = parse_bindings(contents);
        assert_eq!(bindings.len(), 2);
        assert_eq!(
            bindings.get("volume-3ee59355").map(String::as_str),
            Some("360014055a1a42a8b84886626cc532f05")
        );
        assert_eq!(discard.len(), 1);
        assert!(discard.contains_key("mpatha"));
        assert!(!bindings.contains_key("mpatha"));
    }

    #[tokio::test]
    async fn bindings_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bindings");
        let attacher =
            IscsiAttacher::with_paths(FakeRunner::default(), &path, dir.path());

        // Absent file reads as empty, not an error.
        let (bindings, discard) = attacher.read_bindings().await.unwrap();
        assert!(bindings.is_empty());
        assert!(discard.is_empty());

        let written = HashMap::from([
            ("volume-3ee59355".to_owned(), "36001405aaa".to_owned()),
            ("volume-4b6ed3d8".to_owned(), "36001405bbb".to_owned()),
        ]);
        attacher.write_bindings(&written).await.unwrap();

        let (bindings, discard) = attacher.read_bindings().await.unwrap();
        assert_eq!(bindings, written);
        assert!(discard.is_empty());
    }

    #[tokio::test]
    async fn device_path_resolves_by_path_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("sdx");
        tokio::fs::write(&device, b"").await.unwrap();

        let by_path = dir.path().join("by-path");
        tokio::fs::create_dir(&by_path).await.unwrap();
        let link = by_path.join(format!("ip-{PORTAL}:3260-iscsi-{IQN}-lun-0"));
        std::os::unix::fs::symlink(&device, &link).unwrap();

        let attacher =
            IscsiAttacher::with_paths(FakeRunner::default(), dir.path().join("b"), &by_path);
        let resolved = attacher.device_path(PORTAL, IQN).await.unwrap();
        assert_eq!(resolved, device.canonicalize().unwrap());
    }

    #[tokio::test]
    async fn device_path_fails_without_match() {
        let dir = tempfile::tempdir().unwrap();
        let attacher =
            IscsiAttacher::with_paths(FakeRunner::default(), dir.path().join("b"), dir.path());
        let result = attacher.device_path(PORTAL, IQN).await;
        assert!(matches!(result, Err(CsiError::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn device_path_rejects_non_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let by_path = dir.path().join("by-path");
        tokio::fs::create_dir(&by_path).await.unwrap();
        let plain = by_path.join(format!("ip-{PORTAL}:3260-iscsi-{IQN}-lun-0"));
        tokio::fs::write(&plain, b"").await.unwrap();

        let attacher =
            IscsiAttacher::with_paths(FakeRunner::default(), dir.path().join("b"), &by_path);
        let result = attacher.device_path(PORTAL, IQN).await;
        assert!(matches!(result, Err(CsiError::Internal(_))));
    }
}
