// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process-wide logging setup. The macros re-exported from the crate root
//! (`error!`, `warn!`, `info!`, `debug!`) forward to the `log` facade;
//! this module installs the backend that renders them to stderr.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes logging for the process. Subsequent calls are no-ops, so
/// tests and the binary can both call this unconditionally.
///
/// The level defaults to `info` and can be overridden with the standard
/// `RUST_LOG` environment variable.
pub fn init() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_millis()
            .init();
    });
}
