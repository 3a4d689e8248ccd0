// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Condvar as StdCondvar;
use std::sync::MutexGuard;
use std::time::Duration;

/// A Condvar wrapper whose wait methods panic on poison instead of
/// returning a `Result`.
#[derive(Default)]
pub struct Condvar {
    std: StdCondvar,
}

impl Condvar {
    pub fn new() -> Condvar {
        Condvar {
            std: StdCondvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        match self.std.wait(guard) {
            Ok(guard) => guard,
            Err(_) => panic!("condvar is poisoned"),
        }
    }

    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        match self.std.wait_timeout(guard, timeout) {
            Ok((guard, result)) => (guard, result.timed_out()),
            Err(_) => panic!("condvar is poisoned"),
        }
    }

    pub fn notify_one(&self) {
        self.std.notify_one()
    }

    pub fn notify_all(&self) {
        self.std.notify_all()
    }
}
