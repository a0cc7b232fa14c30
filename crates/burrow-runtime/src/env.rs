//! Container environment assembly and validation.

use burrow_common::config::BurrowConfig;
use burrow_common::error::{BurrowError, Result};

/// Ordered `KEY=VALUE` set where a later value replaces an earlier one in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvList {
    entries: Vec<(String, String)>,
}

impl EnvList {
    /// Sets `key` to `value`.
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            value.clone_into(&mut entry.1);
        } else {
            self.entries.push((key.to_owned(), value.to_owned()));
        }
    }

    /// Sets `key` only if it is not present yet.
    pub fn set_default(&mut self, key: &str, value: &str) {
        if self.get(key).is_none() {
            self.set(key, value);
        }
    }

    /// Returns the value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the `(key, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Renders the entries as `KEY=VALUE` strings.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.entries.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Inputs that decide the container environment.
#[derive(Debug, Clone, Default)]
pub struct EnvRequest<'a> {
    /// Keep the host environment instead of a filtered one.
    pub hostenv: bool,
    /// Image `KEY=VALUE` entries.
    pub image_env: &'a [String],
    /// User `-e` entries; bare names import the host value.
    pub user_env: &'a [String],
    /// Container user, empty meaning root.
    pub user: &'a str,
    /// Container identifier, exported as `container_uuid`.
    pub container_id: &'a str,
    /// Host path of the container root.
    pub container_root: &'a str,
    /// Execution mode name.
    pub execmode: &'a str,
}

/// Builds the container environment.
///
/// Later layers win: filtered host variables, then defaults, then the image
/// environment, then the user's entries.
///
/// # Errors
///
/// Returns [`BurrowError::Environment`] for a user entry whose key is empty,
/// contains a space or starts with a digit.
pub fn build(config: &BurrowConfig, request: &EnvRequest<'_>, host_env: &[(String, String)]) -> Result<EnvList> {
    let mut env = EnvList::default();
    for (key, value) in host_env {
        let keep = if request.hostenv {
            !config.invalid_host_env.contains(key)
        } else {
            config.valid_host_env.contains(key)
        };
        if keep {
            env.set(key, value);
        }
    }

    let (user, home) = match request.user {
        "" | "0" | "root" => ("root".to_owned(), "/root".to_owned()),
        name => (name.to_owned(), format!("/home/{name}")),
    };
    env.set("HOME", &home);
    env.set("USER", &user);
    env.set("LOGNAME", &user);
    env.set("SHLVL", "0");
    env.set("container_uuid", request.container_id);
    env.set("container_root", request.container_root);
    env.set("container_execmode", request.execmode);

    for entry in request.image_env {
        if let Some((key, value)) = entry.split_once('=') {
            if !key.is_empty() {
                env.set(key, value);
            }
        }
    }
    env.set_default("PATH", &config.root_path);

    for entry in check_user_env(request.user_env, host_env)? {
        let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        env.set(key, value);
    }
    Ok(env)
}

/// Normalizes and validates user-supplied environment entries.
///
/// Empty entries are dropped; a bare `NAME` takes the host value and is
/// dropped when the host has none.
///
/// # Errors
///
/// Returns [`BurrowError::Environment`] for the first malformed key.
pub fn check_user_env(entries: &[String], host_env: &[(String, String)]) -> Result<Vec<String>> {
    let mut checked = Vec::new();
    for entry in entries.iter().filter(|e| !e.is_empty()) {
        let Some((key, _)) = entry.split_once('=') else {
            if let Some((_, value)) = host_env.iter().find(|(k, v)| k == entry && !v.is_empty()) {
                checked.push(format!("{entry}={value}"));
            }
            continue;
        };
        if key.is_empty() || key.contains(' ') || key.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(BurrowError::Environment {
                entry: entry.clone(),
            });
        }
        checked.push(entry.clone());
    }
    Ok(checked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Vec<(String, String)> {
        [("TERM", "xterm"), ("HOME", "/home/me"), ("LD_PRELOAD", "x.so"), ("EDITOR", "vi")]
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn clean_environment_keeps_only_valid_host_variables() {
        let config = BurrowConfig::default();
        let env = build(&config, &EnvRequest::default(), &host()).expect("env");
        assert_eq!(env.get("TERM"), Some("xterm"));
        assert_eq!(env.get("EDITOR"), None);
        assert_eq!(env.get("HOME"), Some("/root"));
        assert_eq!(env.get("PATH"), Some(config.root_path.as_str()));
    }

    #[test]
    fn hostenv_drops_only_invalid_variables() {
        let config = BurrowConfig::default();
        let request = EnvRequest {
            hostenv: true,
            ..EnvRequest::default()
        };
        let env = build(&config, &request, &host()).expect("env");
        assert_eq!(env.get("EDITOR"), Some("vi"));
        assert_eq!(env.get("LD_PRELOAD"), None);
    }

    #[test]
    fn later_layers_win() {
        let config = BurrowConfig::default();
        let image = vec!["PATH=/opt/bin".to_owned(), "A=image".to_owned()];
        let user = vec!["A=user".to_owned(), "EDITOR".to_owned(), String::new()];
        let request = EnvRequest {
            image_env: &image,
            user_env: &user,
            user: "www",
            container_id: "c1",
            ..EnvRequest::default()
        };
        let env = build(&config, &request, &host()).expect("env");
        assert_eq!(env.get("PATH"), Some("/opt/bin"));
        assert_eq!(env.get("A"), Some("user"));
        assert_eq!(env.get("EDITOR"), Some("vi"));
        assert_eq!(env.get("HOME"), Some("/home/www"));
        assert_eq!(env.get("container_uuid"), Some("c1"));
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for bad in ["1A=x", "A B=x", "=x"] {
            let result = check_user_env(&[bad.to_owned()], &[]);
            assert!(matches!(result, Err(BurrowError::Environment { .. })), "{bad}");
        }
        assert_eq!(check_user_env(&["UNSET".to_owned()], &[]).expect("ok"), Vec::<String>::new());
    }
}
