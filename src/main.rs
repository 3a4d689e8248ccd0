// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use base::error;
use broiler::config::Config;
use broiler::config::RunCommand;
use broiler::linux;

fn main() {
    base::syslog::init();
    let cmd: RunCommand = argh::from_env();
    let ret = Config::from_args(cmd).and_then(linux::run_config);
    if let Err(e) = ret {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
