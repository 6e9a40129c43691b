//! Runtime-owned logging.
//!
//! The subscriber is installed once at startup; afterwards all changes flow
//! through a [`LogHandle`]: the level via a reloadable filter, the target via
//! a writer that consults shared state on every write. Level/target changes
//! arrive as explicit admin messages — there is no other mutable logging
//! state.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    Stdout,
    File(PathBuf),
}

impl LogTarget {
    /// Parse an admin `set-log-target` spec: `stderr | stdout | file:<path>`.
    pub fn parse(spec: &str) -> Result<Self, String> {
        match spec {
            "stderr" => Ok(Self::Stderr),
            "stdout" => Ok(Self::Stdout),
            other => match other.strip_prefix("file:") {
                Some(path) if !path.is_empty() => Ok(Self::File(PathBuf::from(path))),
                _ => Err(format!("invalid log target {spec:?}")),
            },
        }
    }
}

/// `MakeWriter` that re-reads the shared target on every write.
#[derive(Clone)]
pub struct SwitchableWriter {
    target: Arc<RwLock<LogTarget>>,
}

impl<'a> MakeWriter<'a> for SwitchableWriter {
    type Writer = Box<dyn io::Write + Send>;

    fn make_writer(&'a self) -> Self::Writer {
        let target = match self.target.read() {
            Ok(target) => target.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match target {
            LogTarget::Stderr => Box::new(io::stderr()),
            LogTarget::Stdout => Box::new(io::stdout()),
            LogTarget::File(path) => {
                match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(file) => Box::new(file),
                    // Never lose lines because the file went away.
                    Err(_) => Box::new(io::stderr()),
                }
            }
        }
    }
}

/// Handle the runtime hands to the admin channel.
#[derive(Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    target: Arc<RwLock<LogTarget>>,
}

impl LogHandle {
    /// Install the global subscriber and return the handle. Call once.
    pub fn init(level: &str, target: LogTarget) -> anyhow::Result<Self> {
        let filter = EnvFilter::try_new(level).with_context(|| format!("bad log level {level:?}"))?;
        let (filter_layer, filter_handle) = reload::Layer::new(filter);
        let shared_target = Arc::new(RwLock::new(target));
        let writer = SwitchableWriter {
            target: shared_target.clone(),
        };
        // try_init: a second runtime in the same process (tests) keeps the
        // first subscriber.
        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .try_init();
        Ok(Self {
            filter: filter_handle,
            target: shared_target,
        })
    }

    pub fn set_level(&self, level: &str) -> anyhow::Result<()> {
        let filter = EnvFilter::try_new(level).with_context(|| format!("bad log level {level:?}"))?;
        self.filter
            .reload(filter)
            .context("filter reload rejected")?;
        Ok(())
    }

    pub fn set_target(&self, spec: &str) -> Result<(), String> {
        let parsed = LogTarget::parse(spec)?;
        if let LogTarget::File(path) = &parsed {
            // Validate up front so the admin caller sees the failure.
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("cannot open {}: {e}", path.display()))?;
        }
        let mut target = match self.target.write() {
            Ok(target) => target,
            Err(poisoned) => poisoned.into_inner(),
        };
        *target = parsed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_spec_parsing() {
        assert_eq!(LogTarget::parse("stderr"), Ok(LogTarget::Stderr));
        assert_eq!(LogTarget::parse("stdout"), Ok(LogTarget::Stdout));
        assert_eq!(
            LogTarget::parse("file:/tmp/boxd.log"),
            Ok(LogTarget::File(PathBuf::from("/tmp/boxd.log")))
        );
        assert!(LogTarget::parse("file:").is_err());
        assert!(LogTarget::parse("syslog").is_err());
    }
}
