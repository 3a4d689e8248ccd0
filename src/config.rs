// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use argh::FromArgs;

/// Runs a Linux guest on /dev/kvm.
#[derive(FromArgs, Debug)]
pub struct RunCommand {
    /// bzImage kernel to boot
    #[argh(option, arg_name = "PATH")]
    pub kernel: PathBuf,

    /// raw disk image attached as a virtio-blk root device
    #[argh(option, arg_name = "PATH")]
    pub rootfs: Option<PathBuf>,

    /// kernel command line
    #[argh(
        option,
        default = "String::from(\"console=ttyS0 root=/dev/vda rw\")"
    )]
    pub cmdline: String,

    /// guest RAM size in MiB
    #[argh(option, default = "512")]
    pub memory: u64,

    /// number of vCPUs
    #[argh(option, default = "1")]
    pub cpus: u8,
}

/// Validated VM configuration derived from the command line.
#[derive(Debug)]
pub struct Config {
    pub kernel_path: PathBuf,
    pub disks: Vec<PathBuf>,
    pub cmdline: String,
    pub ram_size: u64,
    pub vcpu_count: u8,
}

impl Config {
    pub fn from_args(cmd: RunCommand) -> anyhow::Result<Config> {
        if cmd.memory == 0 {
            anyhow::bail!("--memory must be nonzero");
        }
        if cmd.cpus == 0 || cmd.cpus > 32 {
            anyhow::bail!("--cpus must be between 1 and 32");
        }
        Ok(Config {
            kernel_path: cmd.kernel,
            disks: cmd.rootfs.into_iter().collect(),
            cmdline: cmd.cmdline,
            ram_size: cmd.memory << 20,
            vcpu_count: cmd.cpus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<RunCommand, argh::EarlyExit> {
        RunCommand::from_args(&["broiler"], args)
    }

    #[test]
    fn defaults() {
        let cmd = parse(&["--kernel", "/tmp/bzImage"]).unwrap();
        let cfg = Config::from_args(cmd).unwrap();
        assert_eq!(cfg.ram_size, 512 << 20);
        assert_eq!(cfg.vcpu_count, 1);
        assert!(cfg.disks.is_empty());
        assert!(cfg.cmdline.contains("console=ttyS0"));
    }

    #[test]
    fn rejects_zero_cpus() {
        let cmd = parse(&["--kernel", "/tmp/bzImage", "--cpus", "0"]).unwrap();
        assert!(Config::from_args(cmd).is_err());
    }

    #[test]
    fn rootfs_becomes_disk() {
        let cmd = parse(&["--kernel", "k", "--rootfs", "/tmp/disk.img", "--memory", "128"]).unwrap();
        let cfg = Config::from_args(cmd).unwrap();
        assert_eq!(cfg.disks.len(), 1);
        assert_eq!(cfg.ram_size, 128 << 20);
    }
}
