//! OS-level sandboxed subprocess execution.
//!
//! Commands run inside a bubblewrap (`bwrap`) user-namespace jail: own
//! user/PID/IPC/UTS/mount namespaces, the agent's workspace, memories and
//! skills directories bound read-write, a private tmpfs `/tmp`, fresh
//! `/proc` and `/dev`, and a minimal read-only set of resolver files and
//! CA bundles. The parent environment is cleared before injection.

pub mod path;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Private tmpfs size for `/tmp` inside the jail.
const TMPFS_BYTES: u64 = 64 * 1024 * 1024;

/// Cap on captured stdout/stderr returned to the model.
const MAX_CAPTURE: usize = 50_000;

/// Host files bound read-only when present, so name resolution works.
const RESOLVER_FILES: &[&str] = &[
    "/etc/passwd",
    "/etc/group",
    "/etc/nsswitch.conf",
    "/etc/resolv.conf",
];

/// Common CA bundle locations; whichever exist are bound read-only.
const CA_BUNDLES: &[&str] = &[
    "/etc/ssl/certs",
    "/etc/ssl/cert.pem",
    "/etc/pki/tls/certs/ca-bundle.crt",
];

/// Characters never allowed in a command name.
const FORBIDDEN_CHARS: &[char] = &['"', '\'', '|', '&', ';', '$', '`', '\\'];

/// A single sandboxed invocation.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub command: String,
    pub args: Vec<String>,
    pub allowed_binaries: Vec<String>,
    pub timeout_ms: u64,
    pub agent_root: PathBuf,
}

/// Captured result of a completed (or killed) sandboxed process.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Validate the command name against the shape rules and the allowlist.
/// This runs before anything is spawned.
pub fn validate_command(command: &str, allowed: &[String]) -> Result<(), String> {
    if command.is_empty() {
        return Err("Command must not be empty.".to_string());
    }
    if command.chars().any(|c| c.is_whitespace()) {
        return Err(format!(
            "Command '{}' must be a single binary name without whitespace.",
            command
        ));
    }
    if command.chars().any(|c| FORBIDDEN_CHARS.contains(&c)) {
        return Err(format!(
            "Command '{}' contains forbidden shell characters.",
            command
        ));
    }
    if !allowed.iter().any(|b| b == command) {
        return Err(format!(
            "Command '{}' is not in the allowed binaries list.",
            command
        ));
    }
    Ok(())
}

/// Parse `KEY=VALUE` lines from a workspace `.env` file. Comment lines and
/// lines without `=` are ignored.
pub fn parse_env_file(content: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(eq) = line.find('=') {
            let key = line[..eq].trim().to_string();
            let value = line[eq + 1..].trim().to_string();
            if !key.is_empty() {
                vars.push((key, value));
            }
        }
    }
    vars
}

/// Locate a binary by searching `PATH` on the host.
fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Query the transitive closure of a store path on content-addressed
/// (Nix-style) hosts.
fn store_closure(realpath: &Path) -> Option<Vec<PathBuf>> {
    let output = std::process::Command::new("nix-store")
        .arg("-qR")
        .arg(realpath)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let paths = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(PathBuf::from)
        .collect::<Vec<_>>();
    if paths.is_empty() {
        None
    } else {
        Some(paths)
    }
}

/// Build the full bwrap argument vector (everything before `--`).
/// `nix_store` switches between the content-addressed-store layout and a
/// generic Unix host.
pub fn build_bwrap_args(
    agent_root: &Path,
    allowed_binaries: &[String],
    env: &[(String, String)],
    nix_store: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--unshare-user".into(),
        "--unshare-pid".into(),
        "--unshare-ipc".into(),
        "--unshare-uts".into(),
        "--die-with-parent".into(),
        "--proc".into(),
        "/proc".into(),
        "--dev".into(),
        "/dev".into(),
        "--size".into(),
        TMPFS_BYTES.to_string(),
        "--tmpfs".into(),
        "/tmp".into(),
    ];

    // Agent directories, read-write under their virtual names.
    for sub in ["workspace", "memories", "skills"] {
        let host = agent_root.join(sub);
        args.push("--bind".into());
        args.push(host.to_string_lossy().to_string());
        args.push(format!("/{}", sub));
    }

    for file in RESOLVER_FILES {
        if Path::new(file).exists() {
            args.push("--ro-bind".into());
            args.push((*file).into());
            args.push((*file).into());
        }
    }

    for bundle in CA_BUNDLES {
        if Path::new(bundle).exists() {
            args.push("--ro-bind".into());
            args.push((*bundle).into());
            args.push((*bundle).into());
        }
    }

    if nix_store {
        // Resolve each allowed binary to its store realpath, bind the
        // transitive closure read-only, and expose /bin/{name} symlinks.
        let mut bound: Vec<PathBuf> = Vec::new();
        for name in allowed_binaries {
            let Some(found) = find_in_path(name) else {
                continue;
            };
            let realpath = found.canonicalize().unwrap_or(found);
            match store_closure(&realpath) {
                Some(closure) => {
                    for store_path in closure {
                        if !bound.contains(&store_path) {
                            args.push("--ro-bind".into());
                            args.push(store_path.to_string_lossy().to_string());
                            args.push(store_path.to_string_lossy().to_string());
                            bound.push(store_path);
                        }
                    }
                }
                None => {
                    let store_root = PathBuf::from("/nix/store");
                    if !bound.contains(&store_root) {
                        args.push("--ro-bind".into());
                        args.push("/nix/store".into());
                        args.push("/nix/store".into());
                        bound.push(store_root);
                    }
                }
            }
            args.push("--symlink".into());
            args.push(realpath.to_string_lossy().to_string());
            args.push(format!("/bin/{}", name));
        }
    } else {
        for dir in ["/usr", "/bin", "/lib", "/lib64"] {
            args.push("--ro-bind-try".into());
            args.push((*dir).into());
            args.push((*dir).into());
        }
    }

    args.push("--chdir".into());
    args.push("/workspace".into());

    args.push("--clearenv".into());
    let path_value = if nix_store { "/bin" } else { "/usr/bin:/bin" };
    for (key, value) in [
        ("PATH", path_value),
        ("HOME", "/workspace"),
        ("LANG", "C.UTF-8"),
        ("LC_ALL", "C.UTF-8"),
    ] {
        args.push("--setenv".into());
        args.push(key.into());
        args.push(value.into());
    }
    for (key, value) in env {
        args.push("--setenv".into());
        args.push(key.clone());
        args.push(value.clone());
    }

    args
}

fn truncate_capture(mut text: String) -> String {
    if text.len() > MAX_CAPTURE {
        let mut cut = MAX_CAPTURE;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n[output truncated]");
    }
    text
}

/// Run an allowlisted binary inside the jail, capturing output and
/// enforcing the kill-timeout.
pub async fn run_sandboxed(req: &SandboxRequest) -> Result<ExecOutput, String> {
    validate_command(&req.command, &req.allowed_binaries)?;

    let nix_store = Path::new("/nix/store").exists();

    if !nix_store && find_in_path(&req.command).is_none() {
        return Err(format!("Binary '{}' not found on PATH.", req.command));
    }

    // Environment injection from {agent_root}/workspace/.env
    let env_path = req.agent_root.join("workspace").join(".env");
    let env = match std::fs::read_to_string(&env_path) {
        Ok(content) => parse_env_file(&content),
        Err(_) => Vec::new(),
    };

    let bwrap_args = build_bwrap_args(&req.agent_root, &req.allowed_binaries, &env, nix_store);

    let mut cmd = Command::new("bwrap");
    cmd.args(&bwrap_args)
        .arg("--")
        .arg(&req.command)
        .args(&req.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    log::debug!(
        "[SANDBOX] spawning '{}' with {} args (timeout {}ms)",
        req.command,
        req.args.len(),
        req.timeout_ms
    );

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("Failed to start sandbox: {}", e))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    // Drain pipes concurrently with the wait so a chatty child can't
    // block on a full pipe.
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    match timeout(Duration::from_millis(req.timeout_ms), child.wait()).await {
        Ok(Ok(status)) => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok(ExecOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout: truncate_capture(String::from_utf8_lossy(&stdout).to_string()),
                stderr: truncate_capture(String::from_utf8_lossy(&stderr).to_string()),
            })
        }
        Ok(Err(e)) => Err(format!("Sandbox wait failed: {}", e)),
        Err(_) => {
            // SIGKILL; the child cannot catch it.
            let _ = child.start_kill();
            let _ = child.wait().await;
            let stdout = stdout_task.await.unwrap_or_default();
            let mut stderr =
                truncate_capture(String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string());
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "Process killed after timeout of {} ms",
                req.timeout_ms
            ));
            log::warn!(
                "[SANDBOX] '{}' killed after {}ms timeout",
                req.command,
                req.timeout_ms
            );
            Ok(ExecOutput {
                exit_code: -1,
                stdout: truncate_capture(String::from_utf8_lossy(&stdout).to_string()),
                stderr,
            })
        }
    }
}
