// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup shared by binaries and tests.
//!
//! Library code only uses the [`log`] macros. Every line is prefixed with the
//! arbor component that emitted it, so messages of the overlay, the nodes
//! and the protocols can be told apart. The filter can be overridden with
//! `RUST_LOG`.

use std::sync::Once;

use logforth::color::LevelColor;
use logforth::filter::EnvFilter;
use logforth::{Layout, append};

static INIT: Once = Once::new();

/// Prints `LEVEL component: message`, with the `arbor::` prefix stripped.
#[derive(Clone, Copy, Debug)]
struct ComponentLayout {
    no_color: bool,
}

impl Layout for ComponentLayout {
    fn format(
        &self,
        record: &log::Record,
        _: &[Box<dyn logforth::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        let colors = LevelColor::default();
        let level = colors.colorize_record_level(self.no_color, record.level());
        let target = record.target();
        let component = target.strip_prefix("arbor::").unwrap_or(target);
        let message = record.args();
        Ok(format!("{level:>5} {component}: {message}").into_bytes())
    }
}

/// Logs to stderr with colors, `arbor=debug,info` unless `RUST_LOG` is set.
pub fn enable_logforth() {
    install("arbor=debug,info", false);
}

/// Logs to stderr without colors, `warn` unless `RUST_LOG` is set.
///
/// May be called from every test; only the first call installs the logger.
pub fn enable_logforth_for_tests() {
    install("warn", true);
}

fn install(default_filter: &'static str, no_color: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::from_default_env_or(default_filter);
        let append = append::Stderr::default().with_layout(ComponentLayout { no_color });
        logforth::builder()
            .dispatch(|d| d.filter(filter).append(append))
            .apply();
    });
}

#[cfg(test)]
mod tests {
    use log::{Level, Record, debug, error, log_enabled, trace, warn};

    use super::*;

    #[test]
    fn installs_once() {
        enable_logforth();
        enable_logforth_for_tests();
        enable_logforth();

        assert!(log_enabled!(Level::Error));
        assert!(log_enabled!(Level::Warn));
        assert!(!log_enabled!(target: "other", Level::Debug));
        assert!(!log_enabled!(target: "other", Level::Trace));

        trace!("trace");
        debug!("debug");
        warn!("warn");
        error!("error");
    }

    #[test]
    fn lines_name_component() {
        let layout = ComponentLayout { no_color: true };
        let line = layout
            .format(
                &Record::builder()
                    .level(Level::Warn)
                    .target("arbor::overlay")
                    .args(format_args!("dropping envelope"))
                    .build(),
                &[],
            )
            .unwrap();
        let line = String::from_utf8(line).unwrap();
        assert_eq!(line.trim_start(), "WARN overlay: dropping envelope");

        let line = layout
            .format(
                &Record::builder()
                    .level(Level::Info)
                    .target("local_cluster")
                    .args(format_args!("collected 3 transactions"))
                    .build(),
                &[],
            )
            .unwrap();
        let line = String::from_utf8(line).unwrap();
        assert_eq!(line.trim_start(), "INFO local_cluster: collected 3 transactions");
    }
}
