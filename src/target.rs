//! Proxy targets and the rotation cache over them
//!
//! A targets file is line-oriented: every non-blank line, trimmed, is one
//! target hostname. All targets share the configured port (443 by default).

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, error, info};

/// Host and port the proxy should forward traffic to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse the contents of a targets file, preserving line order
pub fn parse_targets(content: &str, default_port: u16) -> Vec<Target> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| Target::new(line, default_port))
        .collect()
}

/// Backing store that yields candidate targets
pub trait TargetSource: Send {
    /// Load every target, in source order.
    ///
    /// Fails with [`Error::IoFailure`] when the store cannot be read and
    /// with [`Error::EmptyConfiguration`] when it yields nothing.
    fn load(&self) -> Result<Vec<Target>>;

    /// Human-readable identifier used in logs
    fn describe(&self) -> String;
}

/// Targets file on disk, re-read on every load
#[derive(Debug, Clone)]
pub struct FileTargetSource {
    path: PathBuf,
    default_port: u16,
}

impl FileTargetSource {
    pub fn new(path: impl Into<PathBuf>, default_port: u16) -> Self {
        Self {
            path: path.into(),
            default_port,
        }
    }
}

impl TargetSource for FileTargetSource {
    fn load(&self) -> Result<Vec<Target>> {
        info!(path = %self.path.display(), "Reading targets file");

        let content = std::fs::read_to_string(&self.path).map_err(|source| {
            error!(
                path = %self.path.display(),
                error = %source,
                "Can't read targets file, please check your configuration"
            );
            Error::IoFailure {
                path: self.path.clone(),
                source,
            }
        })?;

        let targets = parse_targets(&content, self.default_port);
        if targets.is_empty() {
            error!(path = %self.path.display(), "Targets file read, but contained no entries");
            return Err(Error::EmptyConfiguration {
                path: self.path.clone(),
            });
        }

        debug!(path = %self.path.display(), count = targets.len(), "Targets loaded");
        Ok(targets)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Hands out targets one at a time, reloading the source once drained.
///
/// Each load is consumed front to back in source order. The source is only
/// consulted again after every target of the previous load has been handed
/// out, so edits to the file show up after at most one full rotation.
pub struct TargetRotator<S = FileTargetSource> {
    source: S,
    queue: VecDeque<Target>,
    reloads: u64,
}

impl<S: TargetSource> TargetRotator<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            queue: VecDeque::new(),
            reloads: 0,
        }
    }

    /// Pop the next target, reloading from the source if the queue is empty
    pub fn pick_next(&mut self) -> Result<Target> {
        if self.queue.is_empty() {
            self.reload()?;
        }

        // reload() guarantees at least one entry
        self.queue.pop_front().ok_or_else(|| Error::EmptyConfiguration {
            path: PathBuf::from(self.source.describe()),
        })
    }

    fn reload(&mut self) -> Result<()> {
        let targets = self.source.load()?;
        if targets.is_empty() {
            return Err(Error::EmptyConfiguration {
                path: PathBuf::from(self.source.describe()),
            });
        }
        self.reloads += 1;
        info!(
            source = %self.source.describe(),
            count = targets.len(),
            reloads = self.reloads,
            "Target list reloaded"
        );
        self.queue.extend(targets);
        Ok(())
    }

    /// Targets still queued from the current load
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// How many times the source has been loaded successfully
    pub fn reloads(&self) -> u64 {
        self.reloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn write_targets(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_parse_trims_and_skips_blank_lines() {
        let targets = parse_targets(
            "\n        google.com\n        something.obviously.invalid\n        ",
            443,
        );
        assert_eq!(
            targets,
            vec![
                Target::new("google.com", 443),
                Target::new("something.obviously.invalid", 443),
            ]
        );
    }

    #[test]
    fn test_every_line_is_a_hostname() {
        let targets = parse_targets("#edge.example.com\r\nhost:8443\n  a.example.com  \n", 443);
        assert_eq!(
            targets,
            vec![
                Target::new("#edge.example.com", 443),
                Target::new("host:8443", 443),
                Target::new("a.example.com", 443),
            ]
        );
    }

    #[test]
    fn test_marker_only_file_still_yields_targets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# not a comment").unwrap();

        let mut rotator = TargetRotator::new(FileTargetSource::new(file.path(), 443));
        assert_eq!(rotator.pick_next().unwrap(), Target::new("# not a comment", 443));
    }

    #[test]
    fn test_target_display() {
        assert_eq!(Target::new("google.com", 443).to_string(), "google.com:443");
        assert_eq!(Target::new("10.0.0.7", 8443).to_string(), "10.0.0.7:8443");
    }

    #[test]
    fn test_pick_in_file_order_then_reload() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "\n  google.com\n  something.obviously.invalid\n  ").unwrap();

        let mut rotator = TargetRotator::new(FileTargetSource::new(file.path(), 443));
        assert_eq!(rotator.pick_next().unwrap(), Target::new("google.com", 443));
        assert_eq!(
            rotator.pick_next().unwrap(),
            Target::new("something.obviously.invalid", 443)
        );
        assert_eq!(rotator.reloads(), 1);

        // Exhausted: the next pick reloads and starts over
        assert_eq!(rotator.pick_next().unwrap(), Target::new("google.com", 443));
        assert_eq!(rotator.reloads(), 2);
        assert_eq!(
            rotator.pick_next().unwrap(),
            Target::new("something.obviously.invalid", 443)
        );
        assert_eq!(rotator.pick_next().unwrap(), Target::new("google.com", 443));
        assert_eq!(rotator.remaining(), 1);

        // An edit is only observed once the current load is drained
        write_targets(file.path(), "\n  something.invalid1\n  something.invalid2\n  ");
        assert_eq!(
            rotator.pick_next().unwrap(),
            Target::new("something.obviously.invalid", 443)
        );
        assert_eq!(rotator.pick_next().unwrap(), Target::new("something.invalid1", 443));
        assert_eq!(rotator.pick_next().unwrap(), Target::new("something.invalid2", 443));
    }

    #[test]
    fn test_missing_file_is_io_failure() {
        let mut rotator =
            TargetRotator::new(FileTargetSource::new("/obviously/wrong/path/targets.txt", 443));
        assert!(matches!(rotator.pick_next(), Err(Error::IoFailure { .. })));
    }

    #[test]
    fn test_whitespace_only_file_is_empty_configuration() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, " \n    \n    \r\n   ").unwrap();

        let mut rotator = TargetRotator::new(FileTargetSource::new(file.path(), 443));
        let err = rotator.pick_next().unwrap_err();
        assert!(matches!(err, Error::EmptyConfiguration { .. }));
        assert_eq!(rotator.reloads(), 0);
    }

    #[test]
    fn test_source_emptied_between_rotations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "only.example.com").unwrap();

        let mut rotator = TargetRotator::new(FileTargetSource::new(file.path(), 443));
        assert_eq!(rotator.pick_next().unwrap().host, "only.example.com");

        write_targets(file.path(), "\n\n");
        assert!(matches!(
            rotator.pick_next(),
            Err(Error::EmptyConfiguration { .. })
        ));
        // Still failing loudly on the following call, never blocking
        assert!(matches!(
            rotator.pick_next(),
            Err(Error::EmptyConfiguration { .. })
        ));
    }

    struct StaticSource(Vec<Target>);

    impl TargetSource for StaticSource {
        fn load(&self) -> Result<Vec<Target>> {
            Ok(self.0.clone())
        }

        fn describe(&self) -> String {
            "static".to_string()
        }
    }

    #[test]
    fn test_source_returning_nothing_is_rejected() {
        let mut rotator = TargetRotator::new(StaticSource(Vec::new()));
        assert!(matches!(
            rotator.pick_next(),
            Err(Error::EmptyConfiguration { .. })
        ));
    }

    #[test]
    fn test_n_picks_then_reload() {
        let targets: Vec<Target> = (0..4)
            .map(|i| Target::new(format!("host{}.example.com", i), 443))
            .collect();
        let mut rotator = TargetRotator::new(StaticSource(targets.clone()));

        let picked: Vec<Target> = (0..4).map(|_| rotator.pick_next().unwrap()).collect();
        assert_eq!(picked, targets);
        assert_eq!(rotator.reloads(), 1);

        assert_eq!(rotator.pick_next().unwrap(), targets[0]);
        assert_eq!(rotator.reloads(), 2);
    }
}
