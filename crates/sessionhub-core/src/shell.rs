//! Login-shell command building for agent runtimes.
//!
//! Agent CLIs are usually installed through version managers (nvm, asdf,
//! volta) that only put them on PATH inside a login shell. Runtime processes
//! are therefore started as `<shell> -l -c '<quoted command>'`.

use std::env;
use std::path::{Path, PathBuf};

use tokio::process::Command;

/// Shells that don't accept `-l -c` the POSIX way.
const NON_POSIX_SHELLS: [&str; 6] = ["fish", "nu", "nushell", "elvish", "xonsh", "ion"];

/// Build a command running `binary_path args...` in a login shell.
///
/// `shell_prefix` overrides the default `$SHELL -l -c` (e.g. `"/bin/bash -c"`).
#[cfg(unix)]
pub fn login_shell_command(
    binary_path: &str,
    args: &[String],
    working_dir: Option<&str>,
    shell_prefix: Option<&str>,
) -> Result<Command, String> {
    let prefix = shell_prefix_or_default(shell_prefix);
    let mut parts = prefix.split_whitespace();
    let program = parts.next().ok_or_else(|| "Empty shell prefix".to_string())?;
    let shell_args: Vec<&str> = parts.collect();

    let mut quoted = Vec::with_capacity(args.len() + 1);
    quoted.push(quote(binary_path)?);
    for arg in args {
        quoted.push(quote(arg)?);
    }

    let mut cmd = Command::new(program);
    cmd.args(shell_args).arg(quoted.join(" "));
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    prepend_binary_dir(&mut cmd, binary_path);

    Ok(cmd)
}

/// Windows has no login shell; run the binary directly.
#[cfg(windows)]
pub fn login_shell_command(
    binary_path: &str,
    args: &[String],
    working_dir: Option<&str>,
    _shell_prefix: Option<&str>,
) -> Result<Command, String> {
    let mut cmd = Command::new(binary_path);
    cmd.args(args);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    prepend_binary_dir(&mut cmd, binary_path);
    Ok(cmd)
}

fn quote(value: &str) -> Result<String, String> {
    shlex::try_quote(value)
        .map(|q| q.into_owned())
        .map_err(|_| format!("Cannot quote argument: {value}"))
}

/// Put the binary's own directory first on PATH so sibling tools (node) resolve.
fn prepend_binary_dir(cmd: &mut Command, binary_path: &str) {
    if !binary_path.contains('/') {
        return;
    }
    let Some(dir) = Path::new(binary_path).parent().and_then(|d| d.to_str()) else {
        return;
    };
    let existing = env::var("PATH").unwrap_or_default();
    let combined = if existing.is_empty() {
        dir.to_string()
    } else {
        format!("{dir}:{existing}")
    };
    cmd.env("PATH", combined);
}

/// Custom prefix if non-empty, else `$SHELL -l -c` with a bash/sh fallback
/// for non-POSIX shells.
pub fn shell_prefix_or_default(custom: Option<&str>) -> String {
    if let Some(prefix) = custom.filter(|p| !p.trim().is_empty()) {
        return prefix.to_string();
    }

    let shell = env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let name = Path::new(&shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    let effective = if NON_POSIX_SHELLS.contains(&name) {
        if Path::new("/bin/bash").exists() {
            "/bin/bash".to_string()
        } else {
            "/bin/sh".to_string()
        }
    } else {
        shell
    };

    format!("{effective} -l -c")
}

/// Locate an agent binary: a path containing `/` must exist, a bare name is
/// searched on PATH.
pub fn resolve_binary(binary_path: &str) -> Option<PathBuf> {
    if binary_path.is_empty() {
        return None;
    }
    if binary_path.contains('/') {
        let path = PathBuf::from(binary_path);
        return path.is_file().then_some(path);
    }

    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(binary_path))
        .find(|candidate| candidate.is_file())
}
