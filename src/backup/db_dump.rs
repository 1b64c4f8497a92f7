// dbbackup/src/backup/db_dump.rs
use async_trait::async_trait;
use serde::Deserialize;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::{ConfigError, DumpError};
use crate::utils::dsn::Endpoint;
use crate::utils::resolve_executable;

const PASSWORD_ENV: &str = "PGPASSWORD";
const READINESS_BINARY: &str = "pg_isready";
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const READ_CHUNK: usize = 64 * 1024;

/// Runs external dump invocations and the matching connectivity probe.
#[async_trait]
pub trait Dumper: Send + Sync {
    /// Lightweight connectivity probe, independent of any database.
    async fn validate(&self) -> Result<(), DumpError>;

    /// Streams one database dump into `out`.
    async fn dump(
        &self,
        cancel: &CancellationToken,
        database: &str,
        out: &mut (dyn Write + Send),
    ) -> Result<(), DumpError>;
}

/// Tool family selector as written in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileKind {
    SingleBinary,
    ClientServer,
}

impl ProfileKind {
    /// Guesses the profile from well-known binary names.
    pub fn infer(executable: &Path) -> Option<Self> {
        match executable.file_stem()?.to_str()? {
            "cockroach" => Some(ProfileKind::SingleBinary),
            "pg_dump" => Some(ProfileKind::ClientServer),
            _ => None,
        }
    }
}

/// Argument shape of the dump tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpProfile {
    /// `<bin> dump <db> <flags...>`, probed with `<bin> node ls <flags...>`.
    SingleBinary,
    /// `<bin> -d <db> -h <host> -U <user>`, probed with `pg_isready`.
    /// The password only ever travels through the environment.
    ClientServer(Endpoint),
}

/// Validated description of how to invoke the dump tool. Built once per run.
#[derive(Debug, Clone)]
pub struct DumpSpec {
    pub executable: PathBuf,
    pub flags: Vec<String>,
    pub profile: DumpProfile,
    pub timeout: Option<Duration>,
}

impl DumpSpec {
    pub fn resolve(
        binary: &str,
        flags: &str,
        dsn: &str,
        kind: Option<ProfileKind>,
        timeout: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        let executable = resolve_executable(binary)?;
        let kind = kind
            .or_else(|| ProfileKind::infer(&executable))
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "unknown dbcli command {binary:?}; \
                     set dump.profile to single-binary or client-server"
                ))
            })?;
        // Extra flags only apply to the single-binary tool.
        let (profile, flags) = match kind {
            ProfileKind::SingleBinary => (
                DumpProfile::SingleBinary,
                flags.split_whitespace().map(str::to_string).collect(),
            ),
            ProfileKind::ClientServer => {
                (DumpProfile::ClientServer(Endpoint::from_dsn(dsn)?), Vec::new())
            }
        };

        Ok(Self {
            executable,
            flags,
            profile,
            timeout: timeout.filter(|t| !t.is_zero()),
        })
    }
}

/// Supervises dump tool subprocesses described by a [`DumpSpec`].
#[derive(Debug, Clone)]
pub struct CliDumper {
    spec: DumpSpec,
}

enum Interrupt {
    Cancelled,
    TimedOut(Duration),
    Finished(Completion),
}

enum Completion {
    Exited { status: ExitStatus, stderr: Vec<u8> },
    ForwardFailed(io::Error),
}

impl CliDumper {
    pub fn new(spec: DumpSpec) -> Self {
        Self { spec }
    }

    fn dump_command(&self, database: &str) -> Command {
        let mut cmd = Command::new(&self.spec.executable);
        match &self.spec.profile {
            DumpProfile::SingleBinary => {
                cmd.arg("dump").arg(database).args(&self.spec.flags);
            }
            DumpProfile::ClientServer(endpoint) => {
                cmd.arg("-d").arg(database);
                connection_args(&mut cmd, endpoint);
            }
        }
        cmd
    }

    fn probe_command(&self) -> Command {
        match &self.spec.profile {
            DumpProfile::SingleBinary => {
                let mut cmd = Command::new(&self.spec.executable);
                cmd.arg("node").arg("ls").args(&self.spec.flags);
                cmd
            }
            DumpProfile::ClientServer(endpoint) => {
                let mut cmd = Command::new(readiness_binary(&self.spec.executable));
                connection_args(&mut cmd, endpoint);
                cmd
            }
        }
    }
}

fn connection_args(cmd: &mut Command, endpoint: &Endpoint) {
    cmd.arg("-h").arg(&endpoint.host);
    if let Some(port) = endpoint.port {
        cmd.arg("-p").arg(port.to_string());
    }
    if let Some(user) = &endpoint.user {
        cmd.arg("-U").arg(user);
    }
    if let Some(password) = &endpoint.password {
        cmd.env(PASSWORD_ENV, password);
    }
}

/// Prefers the `pg_isready` shipped next to the dump binary, falling back to `PATH`.
fn readiness_binary(executable: &Path) -> PathBuf {
    let sibling = executable.with_file_name(READINESS_BINARY);
    if executable.parent().is_some_and(|p| !p.as_os_str().is_empty()) && sibling.is_file() {
        sibling
    } else {
        PathBuf::from(READINESS_BINARY)
    }
}

#[async_trait]
impl Dumper for CliDumper {
    async fn validate(&self) -> Result<(), DumpError> {
        let mut cmd = self.probe_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                DumpError::Connectivity(format!("probe timed out after {PROBE_TIMEOUT:?}"))
            })?
            .map_err(|e| DumpError::Connectivity(format!("failed to run probe: {e}")))?;

        if !output.status.success() {
            return Err(DumpError::Connectivity(format!(
                "probe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn dump(
        &self,
        cancel: &CancellationToken,
        database: &str,
        out: &mut (dyn Write + Send),
    ) -> Result<(), DumpError> {
        if cancel.is_cancelled() {
            return Err(DumpError::Cancelled {
                database: database.to_string(),
            });
        }

        let mut cmd = self.dump_command(database);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|source| DumpError::Spawn {
            database: database.to_string(),
            source,
        })?;
        debug!(db = database, pid = ?child.id(), "Started dump process");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut sink = BufWriter::new(out);

        // The timeout clock starts once the process is running.
        let timeout = self.spec.timeout;
        let deadline = async move {
            match timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        let interrupt = tokio::select! {
            _ = cancel.cancelled() => Interrupt::Cancelled,
            limit = deadline => Interrupt::TimedOut(limit),
            completion = drive(&mut child, stdout, stderr, &mut sink) => {
                Interrupt::Finished(completion)
            }
        };

        match interrupt {
            Interrupt::Cancelled => {
                let _ = sink.into_parts();
                terminate(&mut child, database).await;
                Err(DumpError::Cancelled {
                    database: database.to_string(),
                })
            }
            Interrupt::TimedOut(timeout) => {
                let _ = sink.into_parts();
                terminate(&mut child, database).await;
                Err(DumpError::Timeout {
                    database: database.to_string(),
                    timeout,
                })
            }
            Interrupt::Finished(Completion::ForwardFailed(source)) => {
                let _ = sink.into_parts();
                terminate(&mut child, database).await;
                Err(DumpError::Flush {
                    database: database.to_string(),
                    source,
                })
            }
            Interrupt::Finished(Completion::Exited { status, stderr }) => {
                if !status.success() {
                    let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
                    error!(db = database, %status, "{}", stderr);
                    let _ = sink.into_parts();
                    return Err(DumpError::Runtime {
                        database: database.to_string(),
                        status,
                        stderr,
                    });
                }
                sink.flush().map_err(|source| DumpError::Flush {
                    database: database.to_string(),
                    source,
                })
            }
        }
    }
}

/// Forwards stdout into `sink` while stderr is collected on the side, then
/// reaps the process.
async fn drive<W: Write>(
    child: &mut Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    sink: &mut W,
) -> Completion {
    let stderr_task = tokio::spawn(async move {
        let mut captured = Vec::new();
        if let Some(mut stderr) = stderr {
            if let Err(e) = stderr.read_to_end(&mut captured).await {
                warn!(error = %e, "Failed to read dump stderr");
            }
        }
        captured
    });

    if let Some(mut stdout) = stdout {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let read = match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) => return Completion::ForwardFailed(e),
            };
            if let Err(e) = sink.write_all(&buf[..read]) {
                return Completion::ForwardFailed(e);
            }
        }
    }

    let status = match child.wait().await {
        Ok(status) => status,
        Err(e) => return Completion::ForwardFailed(e),
    };
    let stderr = stderr_task.await.unwrap_or_default();
    Completion::Exited { status, stderr }
}

/// Kills the process and waits for it to exit, even if the kill itself fails.
async fn terminate(child: &mut Child, database: &str) {
    if let Err(e) = child.start_kill() {
        warn!(db = database, error = %e, "Failed to kill dump process");
    }
    match child.wait().await {
        Ok(status) => debug!(db = database, %status, "Dump process stopped"),
        Err(e) => warn!(db = database, error = %e, "Failed waiting for dump process to exit"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn stub(dir: &TempDir, name: &str, body: &str) -> anyhow::Result<PathBuf> {
        let path = dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    fn single_binary(executable: PathBuf, flags: &[&str], timeout: Option<Duration>) -> CliDumper {
        CliDumper::new(DumpSpec {
            executable,
            flags: flags.iter().map(|f| f.to_string()).collect(),
            profile: DumpProfile::SingleBinary,
            timeout,
        })
    }

    #[cfg(target_os = "linux")]
    fn process_exists(pid_file: &Path) -> anyhow::Result<bool> {
        let pid = fs::read_to_string(pid_file)?.trim().to_string();
        Ok(Path::new("/proc").join(pid).exists())
    }

    #[tokio::test]
    async fn forwards_stdout_and_keeps_stderr_out_of_the_dump() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let exe = stub(&dir, "cockroach", r#"echo "noise" >&2; printf '%s|' "$@""#)?;
        let dumper = single_binary(exe, &["--insecure", "--host=db"], None);

        let mut out = Vec::new();
        dumper
            .dump(&CancellationToken::new(), "users", &mut out)
            .await?;

        assert_eq!(String::from_utf8(out)?, "dump|users|--insecure|--host=db|");
        Ok(())
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_runtime_error_with_stderr() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let exe = stub(&dir, "cockroach", "echo 'database \"$2\" does not exist' >&2; exit 3")?;
        let dumper = single_binary(exe, &[], None);

        let mut out = Vec::new();
        let err = dumper
            .dump(&CancellationToken::new(), "ghost", &mut out)
            .await
            .unwrap_err();

        match err {
            DumpError::Runtime { database, stderr, status } => {
                assert_eq!(database, "ghost");
                assert_eq!(status.code(), Some(3));
                assert!(stderr.contains("does not exist"), "stderr was {stderr:?}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn already_cancelled_context_never_starts_a_process() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let marker = dir.path().join("started");
        let exe = stub(&dir, "cockroach", &format!("touch '{}'", marker.display()))?;
        let dumper = single_binary(exe, &[], None);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        let err = dumper.dump(&cancel, "users", &mut out).await.unwrap_err();

        assert!(matches!(err, DumpError::Cancelled { .. }));
        assert!(!marker.exists());
        Ok(())
    }

    #[tokio::test]
    async fn timeout_kills_the_process() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pid_file = dir.path().join("pid");
        let exe = stub(
            &dir,
            "cockroach",
            &format!("echo $$ > '{}'; exec sleep 30", pid_file.display()),
        )?;
        let dumper = single_binary(exe, &[], Some(Duration::from_millis(500)));

        let started = std::time::Instant::now();
        let mut out = Vec::new();
        let err = dumper
            .dump(&CancellationToken::new(), "orders", &mut out)
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            DumpError::Timeout { database, timeout } => {
                assert_eq!(database, "orders");
                assert_eq!(timeout, Duration::from_millis(500));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        #[cfg(target_os = "linux")]
        assert!(!process_exists(&pid_file)?);
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pid_file = dir.path().join("pid");
        let exe = stub(
            &dir,
            "cockroach",
            &format!("echo $$ > '{}'; exec sleep 30", pid_file.display()),
        )?;
        let dumper = single_binary(exe, &[], None);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let mut out = Vec::new();
        let err = tokio::time::timeout(
            Duration::from_secs(10),
            dumper.dump(&cancel, "orders", &mut out),
        )
        .await?
        .unwrap_err();

        assert!(matches!(err, DumpError::Cancelled { .. }));
        #[cfg(target_os = "linux")]
        assert!(!process_exists(&pid_file)?);
        Ok(())
    }

    #[tokio::test]
    async fn failing_sink_reports_flush_error() -> anyhow::Result<()> {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("disk full"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Err(io::Error::other("disk full"))
            }
        }

        let dir = tempfile::tempdir()?;
        let exe = stub(&dir, "cockroach", "printf 'a few bytes'")?;
        let dumper = single_binary(exe, &[], None);

        let err = dumper
            .dump(&CancellationToken::new(), "users", &mut Broken)
            .await
            .unwrap_err();
        assert!(matches!(err, DumpError::Flush { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn client_server_passes_password_through_environment() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let exe = stub(&dir, "pg_dump", r#"printf '%s ' "$@"; printf 'pw=%s' "$PGPASSWORD""#)?;
        let spec = DumpSpec::resolve(
            &exe.to_string_lossy(),
            "--insecure",
            "bob:s3cret@db.internal:5433/app",
            None,
            None,
        )?;
        let dumper = CliDumper::new(spec);

        let mut out = Vec::new();
        dumper
            .dump(&CancellationToken::new(), "users", &mut out)
            .await?;

        assert_eq!(
            String::from_utf8(out)?,
            "-d users -h db.internal -p 5433 -U bob pw=s3cret"
        );
        assert!(dumper.spec.flags.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn validate_runs_node_ls_for_single_binary() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let healthy = stub(
            &dir,
            "cockroach",
            r#"[ "$1" = node ] && [ "$2" = ls ] && [ "$3" = --insecure ]"#,
        )?;
        single_binary(healthy, &["--insecure"], None).validate().await?;

        let broken = stub(&dir, "broken", "echo 'connection refused' >&2; exit 1")?;
        let err = single_binary(broken, &[], None).validate().await.unwrap_err();
        match err {
            DumpError::Connectivity(reason) => assert!(reason.contains("connection refused")),
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn validate_uses_sibling_readiness_binary() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let exe = stub(&dir, "pg_dump", "exit 0")?;
        stub(
            &dir,
            "pg_isready",
            r#"[ "$1" = -h ] && [ "$2" = db.internal ] && [ "$3" = -U ] && [ "$4" = bob ]"#,
        )?;
        let spec =
            DumpSpec::resolve(&exe.to_string_lossy(), "", "bob@db.internal/app", None, None)?;

        CliDumper::new(spec).validate().await?;
        Ok(())
    }

    #[test]
    fn resolve_infers_profile_and_drops_zero_timeout() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let exe = stub(&dir, "cockroach", "exit 0")?;
        let spec = DumpSpec::resolve(
            &exe.to_string_lossy(),
            "--insecure  --certs-dir=/certs",
            "root@localhost:26257/system",
            None,
            Some(Duration::ZERO),
        )?;
        assert_eq!(spec.profile, DumpProfile::SingleBinary);
        assert_eq!(spec.flags, vec!["--insecure", "--certs-dir=/certs"]);
        assert_eq!(spec.timeout, None);

        let unknown = stub(&dir, "mysqldump", "exit 0")?;
        let err = DumpSpec::resolve(&unknown.to_string_lossy(), "", "localhost", None, None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        Ok(())
    }
}
