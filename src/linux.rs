// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Builds the virtual machine out of its parts and runs it to
//! completion.

use std::fs::File;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use base::info;
use base::Event;
use devices::pci::PciConfigIo;
use devices::pci::PciConfigMmio;
use devices::pci::PciRoot;
use devices::pci::PCI_CONFIG_ADDRESS_PORT;
use devices::pci::PCI_MMCFG_SIZE;
use devices::virtio::Block;
use devices::virtio::VirtioPciDevice;
use devices::Bus;
use devices::BusType;
use devices::Cmos;
use devices::I8042Device;
use devices::IoEventPump;
use devices::IrqRouting;
use devices::Serial;
use devices::SERIAL_ADDR;
use devices::SERIAL_IRQS;
use disk::DiskImage;
use kvm::Kvm;
use kvm::Vcpu;
use kvm::Vm;
use resources::AddressAllocator;
use sync::Mutex;
use vm_memory::GuestMemory;
use x86_64::mptable::PciIrq;

use crate::config::Config;
use crate::vcpu;
use crate::vcpu::VcpuContext;
use crate::vcpu::VcpuRunMode;

/// Assembles the VM from `cfg` and runs vCPUs until the guest shuts
/// down. Teardown happens in reverse construction order as the locals
/// unwind.
pub fn run_config(cfg: Config) -> anyhow::Result<()> {
    let kvm = Arc::new(Kvm::new().context("failed to open /dev/kvm")?);
    for (cap, name) in kvm::required_extensions() {
        if !kvm.check_extension(*cap) {
            bail!("host kernel is missing required extension {}", name);
        }
    }

    let mem = GuestMemory::x86_layout(cfg.ram_size).context("failed to create guest memory")?;
    let vm = Arc::new(Vm::new(&kvm, mem.clone()).context("failed to create VM")?);
    vm.set_tss_addr(x86_64::KVM_TSS_ADDRESS)
        .context("failed to set TSS address")?;
    vm.create_pit2().context("failed to create PIT")?;
    vm.create_irq_chip().context("failed to create irqchip")?;
    let irq = Arc::new(IrqRouting::new(vm.clone()).context("failed to set up IRQ routing")?);

    // Guest firmware and kernel.
    let mut kernel_image = File::open(&cfg.kernel_path)
        .with_context(|| format!("failed to open kernel {}", cfg.kernel_path.display()))?;
    let boot = x86_64::bzimage::load_bzimage(&mem, &mut kernel_image, &cfg.cmdline)
        .context("failed to load kernel")?;
    x86_64::bios::setup_bios(&mem, cfg.ram_size).context("failed to set up BIOS")?;

    // The I/O dispatch fabric.
    let io_bus = Arc::new(Bus::new(BusType::Io));
    let mmio_bus = Arc::new(Bus::new(BusType::Mmio));
    io_bus.set_vm(vm.clone());
    mmio_bus.set_vm(vm.clone());

    devices::register_legacy_stub_ports(&io_bus)
        .context("failed to register legacy port stubs")?;

    // Legacy chipset devices.
    for (i, (addr, irq_line)) in SERIAL_ADDR.iter().zip(SERIAL_IRQS.iter()).enumerate() {
        let out: Option<Box<dyn std::io::Write + Send>> = if i == 0 {
            Some(Box::new(std::io::stdout()))
        } else {
            None
        };
        let serial = Arc::new(Mutex::new(Serial::new(irq.clone(), *irq_line, out)));
        io_bus
            .insert(serial, *addr, 8)
            .context("failed to register serial device")?;
    }
    let i8042 = Arc::new(Mutex::new(I8042Device::new(irq.clone())));
    io_bus
        .insert(i8042.clone(), devices::I8042_DATA_PORT, 1)
        .context("failed to register i8042 data port")?;
    io_bus
        .insert(i8042, devices::I8042_COMMAND_PORT, 1)
        .context("failed to register i8042 command port")?;
    io_bus
        .insert(
            Arc::new(Mutex::new(Cmos::new())),
            devices::RTC_BASE_ADDRESS,
            devices::RTC_LENGTH,
        )
        .context("failed to register CMOS")?;

    // PCI root and its configuration windows.
    let pci_root = Arc::new(Mutex::new(PciRoot::new(
        Arc::downgrade(&io_bus),
        Arc::downgrade(&mmio_bus),
    )));
    io_bus
        .insert(
            Arc::new(Mutex::new(PciConfigIo::new(pci_root.clone()))),
            PCI_CONFIG_ADDRESS_PORT as u64,
            8,
        )
        .context("failed to register PCI config ports")?;
    mmio_bus
        .insert(
            Arc::new(Mutex::new(PciConfigMmio::new(pci_root.clone()))),
            x86_64::PCI_MMCFG_START,
            PCI_MMCFG_SIZE,
        )
        .context("failed to register PCI mmconfig window")?;

    // Virtio block devices over the ioeventfd pump.
    let pump = Arc::new(IoEventPump::new(vm.clone()).context("failed to start ioeventfd pump")?);
    let mut pio_alloc = AddressAllocator::new(
        x86_64::PCI_IOPORT_ALLOC_BASE,
        x86_64::PCI_IOPORT_ALLOC_SIZE,
    );
    let mut mmio_alloc =
        AddressAllocator::new(x86_64::PCI_MMIO_ALLOC_BASE, x86_64::PCI_MMIO_ALLOC_SIZE);
    let mut pci_irqs = Vec::new();
    for path in &cfg.disks {
        let disk = DiskImage::open(path, false)
            .with_context(|| format!("failed to open disk {}", path.display()))?;
        let block = Block::new(disk);
        let transport = VirtioPciDevice::new(
            mem.clone(),
            Box::new(block),
            irq.clone(),
            pump.clone(),
            &mut pio_alloc,
            &mut mmio_alloc,
        )
        .context("failed to build virtio-pci transport")?;
        let (dev_num, irq_line) = pci_root.lock().add_device(transport);
        pci_irqs.push(PciIrq {
            dev_num,
            irq_pin: 1,
            irq_line,
        });
    }

    x86_64::mptable::setup_mptable(&mem, cfg.vcpu_count, &pci_irqs)
        .context("failed to write MP table")?;

    // vCPUs last: everything they can touch exists now.
    vcpu::setup_vcpu_signal_handler().context("failed to install vCPU signal handler")?;
    let run_mode = Arc::new(VcpuRunMode::new());
    let pause_evt = Event::new().context("failed to create pause event")?;
    let exit_evt = Event::new().context("failed to create exit event")?;
    let vm_panicked = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut handles = Vec::with_capacity(cfg.vcpu_count as usize);
    for cpu_id in 0..cfg.vcpu_count {
        let vcpu = Vcpu::new(cpu_id as usize, &kvm, &vm)
            .with_context(|| format!("failed to create vcpu{}", cpu_id))?;
        let handle = vcpu::run_vcpu(
            kvm.clone(),
            VcpuContext {
                vcpu,
                mem: mem.clone(),
                io_bus: io_bus.clone(),
                mmio_bus: mmio_bus.clone(),
                run_mode: run_mode.clone(),
                pause_evt: pause_evt.try_clone().context("failed to clone pause event")?,
                exit_evt: exit_evt.try_clone().context("failed to clone exit event")?,
                vm_panicked: vm_panicked.clone(),
                boot,
            },
        )
        .with_context(|| format!("failed to start vcpu{}", cpu_id))?;
        handles.push(handle);
    }

    info!(
        "started guest: {} MiB RAM, {} vcpu(s), {} disk(s)",
        cfg.ram_size >> 20,
        cfg.vcpu_count,
        cfg.disks.len()
    );

    // Whichever vCPU observes the shutdown flips the run mode and writes
    // the exit event; the rest must be kicked out of KVM_RUN.
    exit_evt.read().context("failed waiting for VM exit")?;
    vcpu::exit_all_vcpus(&run_mode, &handles);
    for handle in handles {
        handle.join();
    }
    pump.stop();
    if vm_panicked.load(std::sync::atomic::Ordering::SeqCst) {
        bail!("VM stopped on an unhandled exit");
    }
    info!("guest stopped");
    Ok(())
}
