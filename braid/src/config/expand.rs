//! Environment variable expansion for configuration files
//!
//! Supports exactly two forms: `${VAR}` and `${VAR:-default}`. Expansion
//! happens once at load time into an effective config; the on-disk file is
//! never mutated. Anything shell-like beyond these two forms (command
//! substitution, `$VAR` without braces) is deliberately not recognised.

use std::sync::OnceLock;

use regex::Regex;

use super::ConfigError;

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").unwrap())
}

/// Expand `${VAR}` and `${VAR:-default}` references in `input`.
///
/// A reference to an unset variable without a default is a
/// [`ConfigError::UnsetVariable`].
pub fn expand_env(input: &str) -> Result<String, ConfigError> {
    expand_with(input, |name| std::env::var(name).ok())
}

/// Expansion with a caller-supplied lookup, used by tests and by the MCP
/// server env tables (which may layer extra variables over the process
/// environment).
pub fn expand_with<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let re = pattern();
    let mut out = String::with_capacity(input.len());
    let mut last = 0;

    for caps in re.captures_iter(input) {
        let whole = caps.get(0).unwrap();
        let name = caps.get(1).unwrap().as_str();
        out.push_str(&input[last..whole.start()]);

        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => match caps.get(3) {
                Some(default) => out.push_str(default.as_str()),
                None => {
                    return Err(ConfigError::UnsetVariable {
                        name: name.to_string(),
                    })
                }
            },
        }

        last = whole.end();
    }

    out.push_str(&input[last..]);
    Ok(out)
}
