use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

pub use indexmap::{IndexMap, IndexSet};
pub use serde_json::Value as JsonValue;

pub use anyhow::{anyhow, bail, Context, Result};
pub use std::result::Result as StdResult;

#[doc(hidden)]
pub use serde_json;

/// Free-form diagnostic payload attached to a check outcome.  Only ever rendered.
pub type Details = IndexMap<String, JsonValue>;

/// Build a [`Details`] map from `key => value` pairs.  Values can be anything `serde_json::json!` accepts.
#[macro_export]
macro_rules! details {
    () => { $crate::Details::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut d = $crate::Details::new();
        $(d.insert($key.to_string(), $crate::serde_json::json!($value));)+
        d
    }};
}

pub mod baseline;
pub mod bcm;
pub mod checks;
pub mod command;
pub mod compare;
pub mod dbbackup;
pub mod filebackup;
pub mod render;
pub mod report;

mod config;
pub use config::*;

/// Restore the default SIGPIPE action so piping into `head` doesn't panic.
pub fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Local time in ISO-8601 form, without a UTC offset.
pub fn iso_timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

pub fn current_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| {
        let name = whoami::username();
        if name.is_empty() {
            "unknown".to_string()
        } else {
            name
        }
    })
}

/// Set up `env_logger` for a binary.  `RUST_LOG` wins over the `verbose` default.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .try_init();
}

pub fn write_json<T, P>(val: &T, path: P) -> Result<()>
where
    T: Serialize + ?Sized,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let f = std::fs::File::create(path)
        .with_context(|| format!("failed to create {:?}", path))?;
    serde_json::to_writer_pretty(f, val)
        .with_context(|| format!("failed to serialize into {:?}", path))
}

pub fn read_json<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let f = std::fs::File::open(path)
        .with_context(|| format!("failed to open {:?}", path))?;
    serde_json::from_reader(std::io::BufReader::new(f))
        .with_context(|| format!("invalid JSON in {:?}", path))
}

/// Non-blank lines of command output, trimmed.
pub fn non_empty_lines(output: &str) -> impl Iterator<Item = &str> {
    output.lines().map(str::trim).filter(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_macro() {
        let d = details! {
            "node" => "node001",
            "count" => 3,
            "names" => vec!["a", "b"],
        };
        assert_eq!(d.len(), 3);
        assert_eq!(d["node"], JsonValue::from("node001"));
        assert_eq!(d["count"], JsonValue::from(3));
        assert_eq!(d.keys().collect::<Vec<_>>(), ["node", "count", "names"]);
        assert!(details!().is_empty());
    }

    #[test]
    fn blank_lines_are_skipped() {
        let out = "\n  a|b \n\n\tc\n   \n";
        assert_eq!(non_empty_lines(out).collect::<Vec<_>>(), ["a|b", "c"]);
        assert_eq!(non_empty_lines("").count(), 0);
    }

    #[test]
    fn json_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let p = dir.path().join("x.json");
        let mut m = IndexMap::new();
        m.insert("b".to_string(), 2u64);
        m.insert("a".to_string(), 1u64);
        write_json(&m, &p)?;
        let back: IndexMap<String, u64> = read_json(&p)?;
        assert_eq!(back, m);
        assert!(read_json::<JsonValue, _>(dir.path().join("missing.json")).is_err());
        Ok(())
    }
}
