// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A safe wrapper around the kernel's KVM interface: the system
//! descriptor, the VM descriptor with its user-memory slots, routing,
//! ioeventfd and coalesced-MMIO services, and per-vCPU run handling.

mod cap;

pub use crate::cap::required_extensions;
pub use crate::cap::Cap;

use std::collections::BTreeSet;
use std::os::unix::fs::OpenOptionsExt;

use base::errno_result;
use base::ioctl;
use base::ioctl_with_mut_ref;
use base::ioctl_with_ref;
use base::ioctl_with_val;
use base::AsRawDescriptor;
use base::Event;
use base::MemoryMapping;
use base::RawDescriptor;
use base::Result;
use base::SafeDescriptor;
use kvm_sys::*;
use resources::AddressRange;
use resources::RangeMap;
use sync::Mutex;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;
use vm_memory::MemoryType;

/// Helper for allocating a kernel struct with a trailing flexible array as
/// a `Vec<T>`, with room for `count` array elements of type `F`.
pub fn vec_with_array_field<T: Default, F>(count: usize) -> Vec<T> {
    let element_space = count * std::mem::size_of::<F>();
    let vec_size_bytes = std::mem::size_of::<T>() + element_space;
    let rounded = (vec_size_bytes + std::mem::size_of::<T>() - 1) / std::mem::size_of::<T>();
    let mut v = Vec::with_capacity(rounded);
    v.resize_with(rounded, T::default);
    v
}

/// A wrapper around opening and using `/dev/kvm`.
pub struct Kvm {
    kvm: SafeDescriptor,
}

impl Kvm {
    /// Opens `/dev/kvm` and verifies the API version.
    pub fn new() -> Result<Kvm> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open("/dev/kvm")?;
        let kvm = Kvm {
            kvm: SafeDescriptor::from(file),
        };
        // Safe because KVM_GET_API_VERSION takes no argument.
        let version = unsafe { ioctl(&kvm, KVM_GET_API_VERSION) };
        if version != KVM_API_VERSION {
            return Err(base::Error::new(libc::ENOSYS));
        }
        Ok(kvm)
    }

    /// Returns whether the host kernel advertises `cap`.
    pub fn check_extension(&self, cap: Cap) -> bool {
        // Safe because KVM_CHECK_EXTENSION reads its immediate argument.
        unsafe { ioctl_with_val(self, KVM_CHECK_EXTENSION, cap as u32 as libc::c_ulong) > 0 }
    }

    /// Size of the per-vCPU run-state mapping.
    pub fn get_vcpu_mmap_size(&self) -> Result<usize> {
        // Safe because KVM_GET_VCPU_MMAP_SIZE takes no argument.
        let res = unsafe { ioctl(self, KVM_GET_VCPU_MMAP_SIZE) };
        if res <= 0 {
            return errno_result();
        }
        Ok(res as usize)
    }

    /// Page offset of the coalesced-MMIO ring within the run mapping, if
    /// the host supports it.
    pub fn coalesced_mmio_page_offset(&self) -> Option<usize> {
        // Safe because KVM_CHECK_EXTENSION reads its immediate argument.
        let res = unsafe {
            ioctl_with_val(
                self,
                KVM_CHECK_EXTENSION,
                Cap::CoalescedMmio as u32 as libc::c_ulong,
            )
        };
        if res > 0 {
            Some(res as usize)
        } else {
            None
        }
    }

    /// Returns the CPUID leaves the host supports for guests.
    pub fn get_supported_cpuid(&self) -> Result<CpuId> {
        const MAX_KVM_CPUID_ENTRIES: usize = 256;
        let mut cpuid = CpuId::new(MAX_KVM_CPUID_ENTRIES);
        // Safe because the kernel writes at most `nent` entries into the
        // space CpuId allocated behind the header.
        let ret = unsafe { ioctl_with_mut_ref(self, KVM_GET_SUPPORTED_CPUID, cpuid.header_mut()) };
        if ret < 0 {
            return errno_result();
        }
        Ok(cpuid)
    }
}

impl AsRawDescriptor for Kvm {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.kvm.as_raw_descriptor()
    }
}

/// Owned CPUID leaf array, allocated with space for the kernel to fill the
/// flexible `entries` member behind `kvm_cpuid2`.
pub struct CpuId {
    storage: Vec<kvm_cpuid2>,
    allocated_len: usize,
}

impl CpuId {
    pub fn new(entries: usize) -> CpuId {
        let mut storage = vec_with_array_field::<kvm_cpuid2, kvm_cpuid_entry2>(entries);
        storage[0].nent = entries as u32;
        CpuId {
            storage,
            allocated_len: entries,
        }
    }

    pub fn header(&self) -> &kvm_cpuid2 {
        &self.storage[0]
    }

    pub fn header_mut(&mut self) -> &mut kvm_cpuid2 {
        &mut self.storage[0]
    }

    pub fn entries(&self) -> &[kvm_cpuid_entry2] {
        let len = std::cmp::min(self.storage[0].nent as usize, self.allocated_len);
        // Safe because the storage vector reserved space for
        // `allocated_len` entries behind the header.
        unsafe { self.storage[0].entries.as_slice(len) }
    }

    pub fn entries_mut(&mut self) -> &mut [kvm_cpuid_entry2] {
        let len = std::cmp::min(self.storage[0].nent as usize, self.allocated_len);
        // Safe for the same reason as `entries`.
        unsafe { self.storage[0].entries.as_mut_slice(len) }
    }
}

/// Address of an ioeventfd trigger on one of the two I/O buses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoEventAddress {
    Pio(u64),
    Mmio(u64),
}

/// A wrapper around creating and using a VM.
pub struct Vm {
    vm: SafeDescriptor,
    guest_mem: GuestMemory,
    mem_slots: Mutex<MemSlots>,
}

#[derive(Default)]
struct MemSlots {
    regions: RangeMap<u32>,
    used: BTreeSet<u32>,
}

impl MemSlots {
    fn lowest_free_slot(&self) -> u32 {
        let mut slot = 0;
        for used in &self.used {
            if *used != slot {
                break;
            }
            slot += 1;
        }
        slot
    }
}

impl Vm {
    /// Constructs a new VM and registers each RAM bank of `guest_mem` with
    /// the kernel before the guest can touch it.
    pub fn new(kvm: &Kvm, guest_mem: GuestMemory) -> Result<Vm> {
        // Safe because KVM_CREATE_VM takes no argument and we own the
        // returned descriptor.
        let ret = unsafe { ioctl(kvm, KVM_CREATE_VM) };
        if ret < 0 {
            return errno_result();
        }
        let vm = Vm {
            // Safe because the descriptor was just created for us.
            vm: unsafe { base::FromRawDescriptor::from_raw_descriptor(ret) },
            guest_mem,
            mem_slots: Mutex::new(MemSlots::default()),
        };
        let regions: Vec<vm_memory::MemoryRegion> = vm.guest_mem.regions().copied().collect();
        for region in regions {
            let host_addr = vm
                .guest_mem
                .get_host_address(region.guest_base)
                .map_err(|_| base::Error::new(libc::EFAULT))?;
            vm.add_memory_region(
                region.guest_base,
                region.size,
                host_addr as u64,
                region.type_,
            )?;
        }
        Ok(vm)
    }

    pub fn get_memory(&self) -> &GuestMemory {
        &self.guest_mem
    }

    /// Registers `[gpa, gpa + size)` backed by `host_addr` under the
    /// lowest free slot. Fails with `EEXIST` if the range overlaps an
    /// already registered region; nothing changes if the kernel rejects
    /// the region.
    pub fn add_memory_region(
        &self,
        gpa: GuestAddress,
        size: u64,
        host_addr: u64,
        _type: MemoryType,
    ) -> Result<u32> {
        let range = AddressRange::from_start_and_len(gpa.offset(), size)
            .ok_or(base::Error::new(libc::EINVAL))?;
        let mut slots = self.mem_slots.lock();
        if slots.regions.find_range(range).is_some() {
            return Err(base::Error::new(libc::EEXIST));
        }
        let slot = slots.lowest_free_slot();
        let region = kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: gpa.offset(),
            memory_size: size,
            userspace_addr: host_addr,
        };
        // Safe because the region struct is owned and the kernel only
        // reads it during the call.
        let ret = unsafe { ioctl_with_ref(self, KVM_SET_USER_MEMORY_REGION, &region) };
        if ret < 0 {
            return errno_result();
        }
        slots
            .regions
            .insert(range, slot)
            .expect("overlap checked above");
        slots.used.insert(slot);
        Ok(slot)
    }

    pub fn check_extension(&self, cap: Cap) -> bool {
        // Safe because KVM_CHECK_EXTENSION reads its immediate argument.
        unsafe { ioctl_with_val(self, KVM_CHECK_EXTENSION, cap as u32 as libc::c_ulong) > 0 }
    }

    /// Sets the address of the three-page TSS region used by older Intel
    /// virtualization.
    pub fn set_tss_addr(&self, addr: u32) -> Result<()> {
        // Safe because KVM_SET_TSS_ADDR takes an immediate argument.
        let ret = unsafe { ioctl_with_val(self, KVM_SET_TSS_ADDR, addr as libc::c_ulong) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Creates the in-kernel PIC/IOAPIC pair.
    pub fn create_irq_chip(&self) -> Result<()> {
        // Safe because KVM_CREATE_IRQCHIP takes no argument.
        let ret = unsafe { ioctl(self, KVM_CREATE_IRQCHIP) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Creates the in-kernel PIT.
    pub fn create_pit2(&self) -> Result<()> {
        let config = kvm_pit_config::default();
        // Safe because the config struct is owned and only read.
        let ret = unsafe { ioctl_with_ref(self, KVM_CREATE_PIT2, &config) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Asserts or deasserts the level of `irq`.
    pub fn set_irq_line(&self, irq: u32, active: bool) -> Result<()> {
        let irq_level = kvm_irq_level {
            irq,
            level: active.into(),
        };
        // Safe because the struct is owned and only read.
        let ret = unsafe { ioctl_with_ref(self, KVM_IRQ_LINE, &irq_level) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Replaces the whole GSI routing table in one call.
    pub fn set_gsi_routing(&self, entries: &[kvm_irq_routing_entry]) -> Result<()> {
        let mut routing =
            vec_with_array_field::<kvm_irq_routing, kvm_irq_routing_entry>(entries.len());
        routing[0].nr = entries.len() as u32;
        // Safe because space for `entries.len()` elements was allocated
        // behind the header.
        unsafe {
            routing[0]
                .entries
                .as_mut_slice(entries.len())
                .copy_from_slice(entries);
        }
        // Safe because the table is owned and only read by the kernel.
        let ret = unsafe { ioctl_with_ref(self, KVM_SET_GSI_ROUTING, &routing[0]) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Injects the MSI described by `msi` directly.
    pub fn signal_msi(&self, msi: &kvm_msi) -> Result<()> {
        // Safe because the struct is owned and only read.
        let ret = unsafe { ioctl_with_ref(self, KVM_SIGNAL_MSI, msi) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    fn ioeventfd(
        &self,
        evt: &Event,
        addr: IoEventAddress,
        len: u32,
        datamatch: Option<u64>,
        deassign: bool,
    ) -> Result<()> {
        let mut flags = 0;
        if deassign {
            flags |= KVM_IOEVENTFD_FLAG_DEASSIGN;
        }
        if matches!(addr, IoEventAddress::Pio(_)) {
            flags |= KVM_IOEVENTFD_FLAG_PIO;
        }
        if datamatch.is_some() {
            flags |= KVM_IOEVENTFD_FLAG_DATAMATCH;
        }
        let ioeventfd = kvm_ioeventfd {
            datamatch: datamatch.unwrap_or(0),
            addr: match addr {
                IoEventAddress::Pio(p) | IoEventAddress::Mmio(p) => p,
            },
            len,
            fd: evt.as_raw_descriptor(),
            flags,
            ..Default::default()
        };
        // Safe because the struct is owned and only read.
        let ret = unsafe { ioctl_with_ref(self, KVM_IOEVENTFD, &ioeventfd) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Arms `evt` to be written by the kernel whenever the guest makes a
    /// matching write to `addr`, instead of exiting to userspace.
    pub fn register_ioevent(
        &self,
        evt: &Event,
        addr: IoEventAddress,
        len: u32,
        datamatch: Option<u64>,
    ) -> Result<()> {
        self.ioeventfd(evt, addr, len, datamatch, false)
    }

    /// Disarms a previously registered ioeventfd.
    pub fn unregister_ioevent(
        &self,
        evt: &Event,
        addr: IoEventAddress,
        len: u32,
        datamatch: Option<u64>,
    ) -> Result<()> {
        self.ioeventfd(evt, addr, len, datamatch, true)
    }

    /// Tells the kernel to batch guest writes to `[addr, addr + size)`
    /// into the coalesced-MMIO ring instead of exiting.
    pub fn register_coalesced_mmio(&self, addr: u64, size: u64) -> Result<()> {
        let zone = kvm_coalesced_mmio_zone {
            addr,
            size: size as u32,
            pad: 0,
        };
        // Safe because the struct is owned and only read.
        let ret = unsafe { ioctl_with_ref(self, KVM_REGISTER_COALESCED_MMIO, &zone) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Removes a coalesced-MMIO zone added by `register_coalesced_mmio`.
    pub fn unregister_coalesced_mmio(&self, addr: u64, size: u64) -> Result<()> {
        let zone = kvm_coalesced_mmio_zone {
            addr,
            size: size as u32,
            pad: 0,
        };
        // Safe because the struct is owned and only read.
        let ret = unsafe { ioctl_with_ref(self, KVM_UNREGISTER_COALESCED_MMIO, &zone) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }
}

impl AsRawDescriptor for Vm {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.vm.as_raw_descriptor()
    }
}

/// The reason a `Vcpu::run` call returned, with the parameters the run
/// loop needs to dispatch it. Data for I/O exits stays in the shared run
/// page and is accessed through `io_data`/`mmio_data`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VcpuExit {
    Io {
        port: u16,
        size: usize,
        count: u32,
        write: bool,
        data_offset: u64,
    },
    Mmio {
        phys_addr: u64,
        len: usize,
        is_write: bool,
    },
    Intr,
    Shutdown,
    SystemEvent {
        type_: u32,
    },
    Unknown {
        hardware_exit_reason: u64,
    },
    FailEntry {
        hardware_entry_failure_reason: u64,
    },
    Other {
        exit_reason: u32,
    },
}

/// A wrapper around creating and running a vCPU.
pub struct Vcpu {
    vcpu: SafeDescriptor,
    id: usize,
    run_mmap: MemoryMapping,
    coalesced_offset: Option<usize>,
}

impl Vcpu {
    /// Creates vCPU `id` and maps its run-state page, locating the
    /// coalesced-MMIO ring within the mapping when the host provides one.
    pub fn new(id: usize, kvm: &Kvm, vm: &Vm) -> Result<Vcpu> {
        // Safe because KVM_CREATE_VCPU takes the id as an immediate and we
        // own the returned descriptor.
        let ret = unsafe { ioctl_with_val(vm, KVM_CREATE_VCPU, id as libc::c_ulong) };
        if ret < 0 {
            return errno_result();
        }
        // Safe because the descriptor was just created for us.
        let vcpu: SafeDescriptor = unsafe { base::FromRawDescriptor::from_raw_descriptor(ret) };
        let mmap_size = kvm.get_vcpu_mmap_size()?;
        let run_mmap = MemoryMapping::from_descriptor_offset(&vcpu, mmap_size, 0)
            .map_err(|_| base::Error::new(libc::ENOMEM))?;
        let coalesced_offset = kvm
            .coalesced_mmio_page_offset()
            .map(|pages| pages * 4096)
            .filter(|offset| offset + 4096 <= mmap_size);
        Ok(Vcpu {
            vcpu,
            id,
            run_mmap,
            coalesced_offset,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn run_struct(&self) -> &kvm_run {
        // Safe because the mapping holds a kvm_run written by the kernel
        // for the life of the vCPU and is page sized or larger.
        unsafe { &*(self.run_mmap.as_ptr() as *const kvm_run) }
    }

    /// Runs the guest until the next exit. An interrupted run (`EINTR` /
    /// `EAGAIN`) is not an error; the exit reason will read as `Intr`.
    pub fn run(&self) -> Result<VcpuExit> {
        // Safe because KVM_RUN takes no argument and the run page stays
        // mapped.
        let ret = unsafe { ioctl(self, KVM_RUN) };
        if ret < 0 {
            let err = base::Error::last();
            if err.errno() != libc::EINTR && err.errno() != libc::EAGAIN {
                return Err(err);
            }
        }
        let run = self.run_struct();
        let exit = match run.exit_reason {
            KVM_EXIT_IO => {
                // Safe because the kernel filled the io arm for this exit.
                let io = unsafe { run.exit.io };
                VcpuExit::Io {
                    port: io.port,
                    size: io.size as usize,
                    count: io.count,
                    write: io.direction == KVM_EXIT_IO_OUT,
                    data_offset: io.data_offset,
                }
            }
            KVM_EXIT_MMIO => {
                // Safe because the kernel filled the mmio arm.
                let mmio = unsafe { run.exit.mmio };
                VcpuExit::Mmio {
                    phys_addr: mmio.phys_addr,
                    len: mmio.len as usize,
                    is_write: mmio.is_write != 0,
                }
            }
            KVM_EXIT_INTR => VcpuExit::Intr,
            KVM_EXIT_SHUTDOWN => VcpuExit::Shutdown,
            KVM_EXIT_SYSTEM_EVENT => {
                // Safe because the kernel filled the system_event arm.
                let event = unsafe { run.exit.system_event };
                VcpuExit::SystemEvent {
                    type_: event.type_,
                }
            }
            KVM_EXIT_UNKNOWN => {
                // Safe because the kernel filled the hw arm.
                let hw = unsafe { run.exit.hw };
                VcpuExit::Unknown {
                    hardware_exit_reason: hw.hardware_exit_reason,
                }
            }
            KVM_EXIT_FAIL_ENTRY => {
                // Safe because the kernel filled the fail_entry arm.
                let fail = unsafe { run.exit.fail_entry };
                VcpuExit::FailEntry {
                    hardware_entry_failure_reason: fail.hardware_entry_failure_reason,
                }
            }
            other => VcpuExit::Other { exit_reason: other },
        };
        Ok(exit)
    }

    /// Accesses the string-I/O data window of the run page. `offset` comes
    /// from the Io exit; the kernel stages `count * size` bytes there.
    pub fn io_data(&self, offset: u64, len: usize) -> &mut [u8] {
        assert!(offset as usize + len <= self.run_mmap.size());
        // Safe because the range was checked against the run mapping and
        // the kernel does not touch it until the next KVM_RUN.
        unsafe {
            std::slice::from_raw_parts_mut(self.run_mmap.as_ptr().add(offset as usize), len)
        }
    }

    /// Accesses the fixed 8-byte MMIO data window of the run page.
    pub fn mmio_data(&self) -> &mut [u8] {
        let offset = 32 + 8; // exit union base + mmio.data
        // Safe because the run mapping is at least a page and the kernel
        // does not touch it until the next KVM_RUN.
        unsafe { std::slice::from_raw_parts_mut(self.run_mmap.as_ptr().add(offset), 8) }
    }

    /// Pops the next unread entry from the coalesced-MMIO ring, if any.
    pub fn pop_coalesced_mmio(&self) -> Option<kvm_coalesced_mmio> {
        let offset = self.coalesced_offset?;
        // Safe because the offset was validated against the mapping at
        // construction and the ring header is plain data.
        let ring = unsafe { &mut *(self.run_mmap.as_ptr().add(offset) as *mut kvm_coalesced_mmio_ring) };
        let first = unsafe { std::ptr::read_volatile(&ring.first) };
        let last = unsafe { std::ptr::read_volatile(&ring.last) };
        if first == last {
            return None;
        }
        // Safe because the kernel only produces entries within the
        // KVM_COALESCED_MMIO_MAX window of the ring page.
        let entry = unsafe {
            std::ptr::read_volatile(ring.coalesced_mmio.as_ptr().add(first as usize))
        };
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
        let next = (first + 1) % KVM_COALESCED_MMIO_MAX;
        // Safe because `first` is owned by userspace per the ring ABI.
        unsafe { std::ptr::write_volatile(&mut ring.first, next) };
        Some(entry)
    }

    pub fn get_regs(&self) -> Result<kvm_regs> {
        let mut regs = kvm_regs::default();
        // Safe because the kernel writes exactly a kvm_regs.
        let ret = unsafe { ioctl_with_mut_ref(self, KVM_GET_REGS, &mut regs) };
        if ret < 0 {
            return errno_result();
        }
        Ok(regs)
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<()> {
        // Safe because the struct is owned and only read.
        let ret = unsafe { ioctl_with_ref(self, KVM_SET_REGS, regs) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs> {
        let mut sregs = kvm_sregs::default();
        // Safe because the kernel writes exactly a kvm_sregs.
        let ret = unsafe { ioctl_with_mut_ref(self, KVM_GET_SREGS, &mut sregs) };
        if ret < 0 {
            return errno_result();
        }
        Ok(sregs)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()> {
        // Safe because the struct is owned and only read.
        let ret = unsafe { ioctl_with_ref(self, KVM_SET_SREGS, sregs) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    pub fn set_fpu(&self, fpu: &kvm_fpu) -> Result<()> {
        // Safe because the struct is owned and only read.
        let ret = unsafe { ioctl_with_ref(self, KVM_SET_FPU, fpu) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Seeds the given MSRs in one call.
    pub fn set_msrs(&self, entries: &[kvm_msr_entry]) -> Result<()> {
        let mut msrs = vec_with_array_field::<kvm_msrs, kvm_msr_entry>(entries.len());
        msrs[0].nmsrs = entries.len() as u32;
        // Safe because space for `entries.len()` elements was allocated
        // behind the header.
        unsafe {
            msrs[0]
                .entries
                .as_mut_slice(entries.len())
                .copy_from_slice(entries);
        }
        // Safe because the struct is owned and only read.
        let ret = unsafe { ioctl_with_ref(self, KVM_SET_MSRS, &msrs[0]) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    pub fn set_cpuid(&self, cpuid: &CpuId) -> Result<()> {
        // Safe because the storage holds the header plus allocated
        // entries and the kernel only reads it.
        let ret = unsafe { ioctl_with_ref(self, KVM_SET_CPUID2, cpuid.header()) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    pub fn get_lapic(&self) -> Result<kvm_lapic_state> {
        let mut state = kvm_lapic_state::default();
        // Safe because the kernel writes exactly a kvm_lapic_state.
        let ret = unsafe { ioctl_with_mut_ref(self, KVM_GET_LAPIC, &mut state) };
        if ret < 0 {
            return errno_result();
        }
        Ok(state)
    }

    pub fn set_lapic(&self, state: &kvm_lapic_state) -> Result<()> {
        // Safe because the struct is owned and only read.
        let ret = unsafe { ioctl_with_ref(self, KVM_SET_LAPIC, state) };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }
}

impl AsRawDescriptor for Vcpu {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.vcpu.as_raw_descriptor()
    }
}

/// Human readable name of a raw exit reason, for the panic dump.
pub fn exit_reason_name(reason: u32) -> &'static str {
    match reason {
        KVM_EXIT_UNKNOWN => "KVM_EXIT_UNKNOWN",
        KVM_EXIT_EXCEPTION => "KVM_EXIT_EXCEPTION",
        KVM_EXIT_IO => "KVM_EXIT_IO",
        KVM_EXIT_HYPERCALL => "KVM_EXIT_HYPERCALL",
        KVM_EXIT_DEBUG => "KVM_EXIT_DEBUG",
        KVM_EXIT_HLT => "KVM_EXIT_HLT",
        KVM_EXIT_MMIO => "KVM_EXIT_MMIO",
        KVM_EXIT_IRQ_WINDOW_OPEN => "KVM_EXIT_IRQ_WINDOW_OPEN",
        KVM_EXIT_SHUTDOWN => "KVM_EXIT_SHUTDOWN",
        KVM_EXIT_FAIL_ENTRY => "KVM_EXIT_FAIL_ENTRY",
        KVM_EXIT_INTR => "KVM_EXIT_INTR",
        KVM_EXIT_SET_TPR => "KVM_EXIT_SET_TPR",
        KVM_EXIT_TPR_ACCESS => "KVM_EXIT_TPR_ACCESS",
        KVM_EXIT_NMI => "KVM_EXIT_NMI",
        KVM_EXIT_INTERNAL_ERROR => "KVM_EXIT_INTERNAL_ERROR",
        KVM_EXIT_SYSTEM_EVENT => "KVM_EXIT_SYSTEM_EVENT",
        _ => "<unknown exit>",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kvm_available() -> bool {
        std::path::Path::new("/dev/kvm").exists()
    }

    #[test]
    fn vec_with_array_field_capacity() {
        let v = vec_with_array_field::<kvm_msrs, kvm_msr_entry>(10);
        assert!(v.len() * std::mem::size_of::<kvm_msrs>() >= 8 + 10 * 16);
    }

    #[test]
    fn cpuid_entry_slices() {
        let mut cpuid = CpuId::new(4);
        cpuid.entries_mut()[2].function = 0x8000_0002;
        assert_eq!(cpuid.entries().len(), 4);
        assert_eq!(cpuid.entries()[2].function, 0x8000_0002);
    }

    #[test]
    fn create_vm_and_vcpu() {
        if !kvm_available() {
            return;
        }
        let kvm = Kvm::new().unwrap();
        let mem = GuestMemory::x86_layout(16 << 20).unwrap();
        let vm = Vm::new(&kvm, mem).unwrap();
        vm.set_tss_addr(0xffbd000).unwrap();
        let vcpu = Vcpu::new(0, &kvm, &vm).unwrap();
        let regs = vcpu.get_regs().unwrap();
        let _ = regs.rip;
    }
}
