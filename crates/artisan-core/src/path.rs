//! Path handling relative to a worker rather than to the calling process.
//!
//! Paths are plain strings because a worker's platform may differ from the
//! local one: a Linux controller drives Windows workers and vice versa.
//!
//! Resolution order for every path argument a worker receives:
//! 1. `~` expansion from the worker's `HOME` / `USERPROFILE`
//! 2. environment variable expansion (`$VAR`, `${VAR}`, and `%VAR%` on Windows)
//! 3. joining relative paths onto the worker's cwd
//! 4. lexical normalization of `.` and `..`

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::platform::Platform;

static POSIX_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([^}]+)\}|([A-Za-z_][A-Za-z0-9_]*))").unwrap()
});

static WINDOWS_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%([^%]+)%|\$(?:\{([^}]+)\}|([A-Za-z_][A-Za-z0-9_]*))").unwrap()
});

fn lookup<'a>(env: &'a HashMap<String, String>, name: &str, platform: &Platform) -> Option<&'a str> {
    if platform.is_windows() {
        env.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    } else {
        env.get(name).map(String::as_str)
    }
}

/// Expand environment variable references. Unknown variables are left as written.
pub fn expand_vars(input: &str, env: &HashMap<String, String>, platform: &Platform) -> String {
    let regex = if platform.is_windows() {
        &*WINDOWS_VAR
    } else {
        &*POSIX_VAR
    };

    regex
        .replace_all(input, |caps: &Captures| {
            let name = caps
                .iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(env, name, platform)
                .map(str::to_string)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Replace a leading `~` with the worker's home directory.
pub fn expand_user(input: &str, env: &HashMap<String, String>, platform: &Platform) -> String {
    let rest = match input.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        Some(rest) if platform.is_windows() && rest.starts_with('\\') => rest,
        _ => return input.to_string(),
    };

    let home = if platform.is_windows() {
        lookup(env, "USERPROFILE", platform).or_else(|| lookup(env, "HOME", platform))
    } else {
        lookup(env, "HOME", platform)
    };

    match home {
        Some(home) => format!("{}{}", home.trim_end_matches(['/', '\\']), rest),
        None => input.to_string(),
    }
}

/// Split a Windows path into its prefix (`C:` or `\\server\share`) and the rest.
fn windows_prefix(path: &str) -> (&str, &str) {
    if let Some(unc) = path.strip_prefix("\\\\") {
        let mut end = 2;
        for (count, part) in unc.splitn(3, '\\').enumerate() {
            if count == 2 {
                break;
            }
            end += part.len() + usize::from(count == 0);
        }
        let end = end.min(path.len());
        return (&path[..end], &path[end..]);
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return (&path[..2], &path[2..]);
    }
    ("", path)
}

pub fn is_absolute(path: &str, platform: &Platform) -> bool {
    if platform.is_windows() {
        let path = path.replace('/', "\\");
        let (prefix, rest) = windows_prefix(&path);
        !prefix.is_empty() || rest.starts_with('\\')
    } else {
        path.starts_with('/')
    }
}

/// Collapse `.`, `..` and repeated separators without touching the filesystem.
pub fn normalize(path: &str, platform: &Platform) -> String {
    let sep = platform.separator();
    let unified;
    let (prefix, rest) = if platform.is_windows() {
        unified = path.replace('/', "\\");
        windows_prefix(&unified)
    } else {
        ("", path)
    };
    let rooted = rest.starts_with(sep);

    let mut parts: Vec<&str> = Vec::new();
    for part in rest.split(sep) {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let body = parts.join(&sep.to_string());
    match (prefix.is_empty(), rooted) {
        (true, true) => format!("{sep}{body}"),
        (true, false) if body.is_empty() => ".".to_string(),
        (true, false) => body,
        (false, true) => format!("{prefix}{sep}{body}"),
        (false, false) => format!("{prefix}{body}"),
    }
}

/// Join `path` onto `base` unless it is already absolute.
pub fn join(base: &str, path: &str, platform: &Platform) -> String {
    if is_absolute(path, platform) || base.is_empty() {
        return path.to_string();
    }
    let sep = platform.separator();
    format!("{}{}{}", base.trim_end_matches(['/', '\\']), sep, path)
}

/// Resolve a path argument the way a worker sees it.
pub fn resolve(cwd: &str, path: &str, env: &HashMap<String, String>, platform: &Platform) -> String {
    let expanded = expand_vars(&expand_user(path, env, platform), env, platform);
    normalize(&join(cwd, &expanded, platform), platform)
}

/// Quote one argument for the worker's shell.
pub fn shell_quote(arg: &str, platform: &Platform) -> String {
    if platform.is_windows() {
        if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
            return arg.to_string();
        }
        return format!("\"{}\"", arg.replace('"', "\\\""));
    }

    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\"'\"'"))
    }
}
