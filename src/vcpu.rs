// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-vCPU run loop: exit demultiplexing into the I/O buses, coalesced
//! MMIO draining, cooperative pause/exit, and the panic dump.

use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use base::error;
use base::info;
use base::Event;
use devices::Bus;
use kvm::Kvm;
use kvm::Vcpu;
use kvm::VcpuExit;
use kvm_sys::KVM_SYSTEM_EVENT_RESET;
use kvm_sys::KVM_SYSTEM_EVENT_SHUTDOWN;
use sync::Condvar;
use sync::Mutex;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;
use x86_64::BootParams;

/// Realtime signal used to yank a vCPU out of `KVM_RUN`. The handler does
/// nothing; the interrupted run returns `Intr` and the loop re-reads the
/// run mode.
fn sig_vcpu_kick() -> libc::c_int {
    libc::SIGRTMIN()
}

extern "C" fn handle_kick(_: libc::c_int) {}

/// Installs the kick handler process-wide. Must run before the first
/// vCPU thread starts. SA_RESTART is deliberately absent so `KVM_RUN`
/// observes the interruption.
pub fn setup_vcpu_signal_handler() -> base::Result<()> {
    // Safe because the handler is an empty extern "C" fn and the struct
    // is fully initialized.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_kick as usize;
        if libc::sigaction(sig_vcpu_kick(), &action, std::ptr::null_mut()) < 0 {
            return base::errno_result();
        }
    }
    Ok(())
}

fn block_sigalrm() {
    // Safe because the set is a local and the calls cannot fail with
    // valid arguments.
    unsafe {
        let mut sigset: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut sigset);
        libc::sigaddset(&mut sigset, libc::SIGALRM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &sigset, std::ptr::null_mut());
    }
}

/// The collective state all vCPU threads follow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VmRunMode {
    /// Guest code executes.
    Running,
    /// vCPUs park on the run-mode condvar until resumed.
    Suspending,
    /// vCPU threads wind down and return.
    Exiting,
}

/// Shared run-mode cell with the condvar vCPUs park on while suspended.
pub struct VcpuRunMode {
    mode: Mutex<VmRunMode>,
    cvar: Condvar,
}

impl VcpuRunMode {
    pub fn new() -> VcpuRunMode {
        VcpuRunMode {
            mode: Mutex::new(VmRunMode::Running),
            cvar: Condvar::new(),
        }
    }

    pub fn get_mode(&self) -> VmRunMode {
        *self.mode.lock()
    }

    pub fn set_and_notify(&self, mode: VmRunMode) {
        *self.mode.lock() = mode;
        self.cvar.notify_all();
    }

    /// Called from a vCPU thread between runs. Parks while suspending
    /// (signalling `pause_evt` once), and reports whether the thread
    /// should keep running.
    fn wait_until_runnable(&self, pause_evt: &Event) -> VmRunMode {
        let mut mode = self.mode.lock();
        loop {
            match *mode {
                VmRunMode::Running | VmRunMode::Exiting => return *mode,
                VmRunMode::Suspending => {
                    if let Err(e) = pause_evt.write(1) {
                        error!("failed to notify pause event: {}", e);
                    }
                    mode = self.cvar.wait(mode);
                }
            }
        }
    }
}

impl Default for VcpuRunMode {
    fn default() -> VcpuRunMode {
        VcpuRunMode::new()
    }
}

/// A running vCPU thread plus the pthread handle used to kick it.
pub struct VcpuHandle {
    join_handle: thread::JoinHandle<()>,
}

impl VcpuHandle {
    pub fn kick(&self) {
        // Safe because the thread is alive as long as the join handle.
        unsafe {
            libc::pthread_kill(self.join_handle.as_pthread_t(), sig_vcpu_kick());
        }
    }

    pub fn join(self) {
        let _ = self.join_handle.join();
    }
}

/// Suspends every vCPU: flips the mode, kicks the threads out of
/// `KVM_RUN`, and waits until each one has signalled `pause_evt`.
pub fn pause_all_vcpus(run_mode: &Arc<VcpuRunMode>, handles: &[VcpuHandle], pause_evt: &Event) {
    run_mode.set_and_notify(VmRunMode::Suspending);
    for handle in handles {
        handle.kick();
    }
    let mut paused = 0u64;
    while paused < handles.len() as u64 {
        match pause_evt.read() {
            Ok(count) => paused += count,
            Err(e) => {
                error!("failed waiting for paused vCPUs: {}", e);
                break;
            }
        }
    }
}

/// Resumes vCPUs parked by `pause_all_vcpus`.
pub fn resume_all_vcpus(run_mode: &Arc<VcpuRunMode>) {
    run_mode.set_and_notify(VmRunMode::Running);
}

/// Asks every vCPU thread to exit and unparks any suspended ones.
pub fn exit_all_vcpus(run_mode: &Arc<VcpuRunMode>, handles: &[VcpuHandle]) {
    run_mode.set_and_notify(VmRunMode::Exiting);
    for handle in handles {
        handle.kick();
    }
}

/// Everything one vCPU thread needs.
pub struct VcpuContext {
    pub vcpu: Vcpu,
    pub mem: GuestMemory,
    pub io_bus: Arc<Bus>,
    pub mmio_bus: Arc<Bus>,
    pub run_mode: Arc<VcpuRunMode>,
    pub pause_evt: Event,
    /// Written when this vCPU initiates VM teardown, so the main thread
    /// can kick the other vCPUs out of `KVM_RUN`.
    pub exit_evt: Event,
    /// Set when the VM dies on an unhandled exit rather than a guest
    /// initiated shutdown; the process exits nonzero.
    pub vm_panicked: Arc<AtomicBool>,
    pub boot: BootParams,
}

impl VcpuContext {
    /// Flags the whole VM for exit on behalf of this vCPU.
    fn request_exit(&self) {
        self.run_mode.set_and_notify(VmRunMode::Exiting);
        if let Err(e) = self.exit_evt.write(1) {
            error!("failed to signal exit event: {}", e);
        }
    }

    fn request_exit_panicked(&self) {
        self.vm_panicked.store(true, Ordering::SeqCst);
        self.request_exit();
    }
}

/// Spawns the thread for `ctx.vcpu`, resetting its state before entry.
pub fn run_vcpu(kvm: Arc<Kvm>, ctx: VcpuContext) -> base::Result<VcpuHandle> {
    let id = ctx.vcpu.id();
    let join_handle = thread::Builder::new()
        .name(format!("vcpu{}", id))
        .spawn(move || {
            block_sigalrm();
            if let Err(e) = x86_64::regs::reset_vcpu(&kvm, &ctx.vcpu, id, &ctx.boot) {
                error!("vcpu{}: reset failed: {}", id, e);
                ctx.request_exit();
                return;
            }
            vcpu_loop(&ctx, id);
        })
        .map_err(|_| base::Error::new(libc::EAGAIN))?;
    Ok(VcpuHandle { join_handle })
}

fn vcpu_loop(ctx: &VcpuContext, id: usize) {
    loop {
        if ctx.run_mode.wait_until_runnable(&ctx.pause_evt) == VmRunMode::Exiting {
            return;
        }
        match ctx.vcpu.run() {
            Ok(VcpuExit::Io {
                port,
                size,
                count,
                write,
                data_offset,
            }) => {
                let data = ctx.vcpu.io_data(data_offset, size * count as usize);
                for chunk in data.chunks_mut(size.max(1)).take(count as usize) {
                    if write {
                        ctx.io_bus.write(id, port as u64, chunk);
                    } else {
                        ctx.io_bus.read(id, port as u64, chunk);
                    }
                }
            }
            Ok(VcpuExit::Mmio {
                phys_addr,
                len,
                is_write,
            }) => {
                // Batched writes precede the access that forced the exit.
                drain_coalesced_mmio(ctx, id);
                let data = ctx.vcpu.mmio_data();
                let len = len.min(data.len());
                if is_write {
                    ctx.mmio_bus.write(id, phys_addr, &data[..len]);
                } else {
                    ctx.mmio_bus.read(id, phys_addr, &mut data[..len]);
                }
            }
            Ok(VcpuExit::Intr) => {}
            Ok(VcpuExit::Shutdown) => {
                info!("vcpu{}: guest shutdown", id);
                ctx.request_exit();
                return;
            }
            Ok(VcpuExit::SystemEvent { type_ }) => {
                // Reset and shutdown both tear the whole VM down.
                match type_ {
                    KVM_SYSTEM_EVENT_SHUTDOWN | KVM_SYSTEM_EVENT_RESET => {
                        info!("vcpu{}: system event {}", id, type_)
                    }
                    other => error!("vcpu{}: unknown system event type {}", id, other),
                }
                ctx.request_exit();
                return;
            }
            Ok(VcpuExit::Unknown {
                hardware_exit_reason,
            }) => {
                println!(
                    "vcpu{}: unknown hardware exit {:#x}",
                    id, hardware_exit_reason
                );
                dump_vcpu_state(ctx, id);
                ctx.request_exit_panicked();
                return;
            }
            Ok(VcpuExit::FailEntry {
                hardware_entry_failure_reason,
            }) => {
                println!(
                    "vcpu{}: entry failure {:#x}",
                    id, hardware_entry_failure_reason
                );
                dump_vcpu_state(ctx, id);
                ctx.request_exit_panicked();
                return;
            }
            Ok(VcpuExit::Other { exit_reason }) => {
                println!(
                    "vcpu{}: unhandled exit {} (\"{}\")",
                    id,
                    exit_reason,
                    kvm::exit_reason_name(exit_reason)
                );
                dump_vcpu_state(ctx, id);
                ctx.request_exit_panicked();
                return;
            }
            Err(e) => {
                error!("vcpu{}: KVM_RUN failed: {}", id, e);
                ctx.request_exit();
                return;
            }
        }
        drain_coalesced_mmio(ctx, id);
    }
}

/// Replays every batched MMIO write through the normal dispatch path, in
/// producer order.
fn drain_coalesced_mmio(ctx: &VcpuContext, id: usize) {
    while let Some(entry) = ctx.vcpu.pop_coalesced_mmio() {
        let len = (entry.len as usize).min(entry.data.len());
        ctx.mmio_bus.write(id, entry.phys_addr, &entry.data[..len]);
    }
}

fn dump_segment(name: &str, seg: &kvm_sys::kvm_segment) {
    println!(
        " {}        {:04x}      {:016x}  {:08x}  {:02x}    {} {}   {}  {} {} {} {}",
        name,
        seg.selector,
        seg.base,
        seg.limit,
        seg.type_,
        seg.present,
        seg.dpl,
        seg.db,
        seg.s,
        seg.l,
        seg.g,
        seg.avl
    );
}

/// The panic dump: registers, segments, code bytes around rip, and the
/// top of the stack.
fn dump_vcpu_state(ctx: &VcpuContext, id: usize) {
    let regs = match ctx.vcpu.get_regs() {
        Ok(regs) => regs,
        Err(e) => {
            error!("vcpu{}: cannot read registers for dump: {}", id, e);
            return;
        }
    };
    let sregs = match ctx.vcpu.get_sregs() {
        Ok(sregs) => sregs,
        Err(e) => {
            error!("vcpu{}: cannot read segment registers for dump: {}", id, e);
            return;
        }
    };

    println!("\n Registers:");
    println!(" ----------");
    println!(
        " rip: {:016x}   rsp: {:016x} flags: {:016x}",
        regs.rip, regs.rsp, regs.rflags
    );
    println!(
        " rax: {:016x}   rbx: {:016x}   rcx: {:016x}",
        regs.rax, regs.rbx, regs.rcx
    );
    println!(
        " rdx: {:016x}   rsi: {:016x}   rdi: {:016x}",
        regs.rdx, regs.rsi, regs.rdi
    );
    println!(
        " rbp: {:016x}    r8: {:016x}    r9: {:016x}",
        regs.rbp, regs.r8, regs.r9
    );
    println!(
        " r10: {:016x}   r11: {:016x}   r12: {:016x}",
        regs.r10, regs.r11, regs.r12
    );
    println!(
        " r13: {:016x}   r14: {:016x}   r15: {:016x}",
        regs.r13, regs.r14, regs.r15
    );
    println!(
        " cr0: {:016x}   cr2: {:016x}   cr3: {:016x}",
        sregs.cr0, sregs.cr2, sregs.cr3
    );
    println!(" cr4: {:016x}   cr8: {:016x}", sregs.cr4, sregs.cr8);

    println!("\n Segment registers:");
    println!(" ------------------");
    println!(" register  selector  base              limit     type  p dpl db s l g avl");
    dump_segment("cs ", &sregs.cs);
    dump_segment("ss ", &sregs.ss);
    dump_segment("ds ", &sregs.ds);
    dump_segment("es ", &sregs.es);
    dump_segment("fs ", &sregs.fs);
    dump_segment("gs ", &sregs.gs);

    // In real mode the code address still includes the segment base.
    let protected = sregs.cr0 & 0x1 != 0;
    let flat_ip = if protected {
        regs.rip
    } else {
        regs.rip + ((sregs.cs.selector as u64) << 4)
    };

    const CODE_BYTES: u64 = 64;
    const CODE_PROLOGUE: u64 = 43;
    println!("\n Code:");
    println!(" -----");
    println!(" rip: [<{:016x}>]", regs.rip);
    let code_start = flat_ip.saturating_sub(CODE_PROLOGUE);
    let mut line = String::from(" ");
    for n in 0..CODE_BYTES {
        let addr = GuestAddress(code_start + n);
        let byte: u8 = match ctx.mem.read_obj_from_addr(addr) {
            Ok(byte) => byte,
            Err(_) => break,
        };
        if code_start + n == flat_ip {
            line.push_str(&format!(" <{:02x}>", byte));
        } else {
            line.push_str(&format!(" {:02x}", byte));
        }
    }
    println!("{}", line);

    println!("\n Stack:");
    println!(" ------");
    println!(" rsp: [<{:016x}>]", regs.rsp);
    for n in (0..32u64).step_by(8) {
        let addr = GuestAddress(regs.rsp + n);
        let mut bytes = [0u8; 8];
        if ctx.mem.read_exact_at_addr(&mut bytes, addr).is_err() {
            println!(" {:#010x}: <unknown>", regs.rsp + n);
            continue;
        }
        println!(
            " {:#010x}: {:02x} {:02x} {:02x} {:02x}  {:02x} {:02x} {:02x} {:02x}",
            regs.rsp + n,
            bytes[0],
            bytes[1],
            bytes[2],
            bytes[3],
            bytes[4],
            bytes[5],
            bytes[6],
            bytes[7]
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_parks_and_resume_releases() {
        let run_mode = Arc::new(VcpuRunMode::new());
        let pause_evt = Event::new().unwrap();
        let thread_evt = pause_evt.try_clone().unwrap();
        let thread_mode = run_mode.clone();

        // Stand-in for a vCPU thread that only exercises the parking
        // logic.
        let worker = thread::spawn(move || {
            let mut iterations = 0u32;
            loop {
                match thread_mode.wait_until_runnable(&thread_evt) {
                    VmRunMode::Exiting => return iterations,
                    _ => iterations += 1,
                }
                std::thread::yield_now();
            }
        });

        run_mode.set_and_notify(VmRunMode::Suspending);
        // The worker checks in once it observes the suspend.
        assert!(pause_evt.read().unwrap() >= 1);
        run_mode.set_and_notify(VmRunMode::Exiting);
        worker.join().unwrap();
    }
}
