// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Eventfd-triggered MSI injection ("irqfd").
//!
//! The VMM binds an eventfd to an MSI descriptor; from then on every
//! signal on the eventfd makes the per-VM dispatcher issue one MSI
//! injection hypercall, with no process-context round trip.
//!
//! Teardown discipline mirrors the hot path's constraints: the dispatcher
//! never tears a binding down itself. When it observes a hang-up it only
//! detaches the fd from its poller and hands the binding's token to a
//! dedicated shutdown worker, which re-validates the binding is still
//! present before destroying it. An explicit `deassign` can race that
//! worker; whichever side finds the binding first wins, the other finds
//! nothing and backs off.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use hypervisor::{Hypervisor, MsiConfig};
use logger::{error, info, warn, IncMetric, METRICS};
use utils::epoll::{Epoll, EpollEvent, EVENT_ERR, EVENT_HUP, EVENT_IN};
use utils::eventfd::EventFd;

/// Deassign the binding instead of creating it.
pub const IRQFD_FLAG_DEASSIGN: u32 = 1 << 0;

/// Token the dispatcher's exit eventfd is registered under.
const EXIT_TOKEN: u64 = u64::max_value();

const EPOLL_EVENTS_LEN: usize = 32;

/// Errors corresponding to irqfd requests.
#[derive(Debug)]
pub enum Error {
    /// No irqfd state exists for the VM id.
    VmNotFound(u32),
    /// The eventfd is already bound to this VM.
    AlreadyAssigned(RawFd),
    /// No binding exists for the eventfd.
    NotAssigned(RawFd),
    /// Duplicating or probing the eventfd failed.
    EventFd(io::Error),
    /// Registering with the poller failed.
    Epoll(io::Error),
    /// Spawning a context thread failed.
    SpawnThread(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match *self {
            VmNotFound(vm_id) => write!(f, "No irqfd context for VM {}", vm_id),
            AlreadyAssigned(fd) => {
                write!(f, "Eventfd {} is already bound to this VM", fd)
            }
            NotAssigned(fd) => write!(f, "No binding found for eventfd {}", fd),
            EventFd(ref err) => write!(f, "Failed to take the eventfd: {}", err),
            Epoll(ref err) => write!(f, "Failed to register with the poller: {}", err),
            SpawnThread(ref err) => write!(f, "Failed to spawn irqfd thread: {}", err),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// One irqfd request as issued by the VMM.
#[derive(Clone, Copy, Debug)]
pub struct IrqfdConfig {
    /// The eventfd to watch.
    pub fd: RawFd,
    /// MSI address the signal translates to.
    pub msi_addr: u64,
    /// MSI data payload.
    pub msi_data: u32,
    /// `IRQFD_FLAG_*` bits.
    pub flags: u32,
}

/// An active eventfd to MSI binding.
///
/// Owns the duplicated eventfd reference; dropping the binding drops the
/// reference. List removal and poller detach must always happen together.
struct IrqfdBinding {
    id: u64,
    /// The fd number from the VMM's request; identity for dedup/deassign.
    fd: RawFd,
    event: EventFd,
    msi: MsiConfig,
}

struct ContextInner {
    vm_id: u32,
    hypervisor: Arc<dyn Hypervisor>,
    epoll: Epoll,
    bindings: Mutex<Vec<IrqfdBinding>>,
    /// Wakes the dispatcher out of its wait at teardown.
    exit_event: EventFd,
    /// Feed of binding tokens awaiting deferred shutdown. Dropped at
    /// teardown to disconnect the worker.
    shutdown_tx: Mutex<Option<Sender<u64>>>,
    next_id: AtomicU64,
}

impl ContextInner {
    fn inject(&self, msi: &MsiConfig) {
        // Fire and forget: the signaler has no return channel, so a failed
        // injection is counted and dropped, like a real interrupt
        // controller would.
        match self.hypervisor.inject_msi(self.vm_id, msi) {
            Ok(()) => METRICS.irqfd.injections.inc(),
            Err(e) => {
                METRICS.irqfd.injection_fails.inc();
                warn!("VM {}: dropped MSI injection: {}", self.vm_id, e);
            }
        }
    }

    /// Hang-up handling on the wake-up path: detach the fd from the poller
    /// so the hang-up stops re-firing, then defer the actual teardown to
    /// the shutdown worker.
    ///
    /// The binding holds its own reference to the eventfd's open file
    /// description, and an eventfd does not report a hang-up to surviving
    /// references when the VMM closes its copy. In this process model the
    /// path therefore only fires for poller-reported error states; stale
    /// bindings whose VMM reference is gone are reclaimed by `deassign` or
    /// `deinit`.
    fn queue_shutdown(&self, token: u64) {
        let fd = self
            .bindings
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.id == token)
            .map(|b| b.event.as_raw_fd());
        if let Some(fd) = fd {
            let _ = self.epoll.delete(fd);
        }
        if let Some(ref tx) = *self.shutdown_tx.lock().unwrap() {
            let _ = tx.send(token);
        }
    }

    /// Deferred teardown, in worker context. Re-checks the binding is
    /// still present: an explicit deassign may have won the race.
    fn shutdown_binding(&self, token: u64) {
        let removed = {
            let mut bindings = self.bindings.lock().unwrap();
            match bindings.iter().position(|b| b.id == token) {
                Some(idx) => Some(bindings.remove(idx)),
                None => None,
            }
        };
        if let Some(binding) = removed {
            let _ = self.epoll.delete(binding.event.as_raw_fd());
            METRICS.irqfd.hangup_shutdowns.inc();
            info!(
                "VM {}: irqfd {} shut down after eventfd hang-up",
                self.vm_id, binding.fd
            );
        }
    }
}

fn run_dispatcher(inner: Arc<ContextInner>) {
    let mut events = [EpollEvent::empty(); EPOLL_EVENTS_LEN];
    loop {
        let count = match inner.epoll.wait(-1, &mut events) {
            Ok(count) => count,
            Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
            Err(e) => {
                error!("VM {}: irqfd dispatcher wait failed: {}", inner.vm_id, e);
                return;
            }
        };
        for event in events.iter().take(count) {
            let token = event.data();
            if token == EXIT_TOKEN {
                return;
            }
            let mask = event.events();
            if mask & EVENT_IN != 0 {
                let bindings = inner.bindings.lock().unwrap();
                if let Some(binding) = bindings.iter().find(|b| b.id == token) {
                    // Consume the counter so the signal does not re-fire,
                    // then inject. One wake-up, one MSI.
                    match binding.event.read() {
                        Ok(_) => inner.inject(&binding.msi),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
                        Err(e) => {
                            warn!("VM {}: irqfd {} read failed: {}", inner.vm_id, binding.fd, e)
                        }
                    }
                }
            }
            if mask & (EVENT_HUP | EVENT_ERR) != 0 {
                inner.queue_shutdown(token);
            }
        }
    }
}

fn run_worker(inner: Arc<ContextInner>, rx: Receiver<u64>) {
    // Drains remaining queued work after the channel disconnects, then
    // stops.
    while let Ok(token) = rx.recv() {
        inner.shutdown_binding(token);
    }
}

/// Per-VM irqfd state: the binding table plus the two service threads.
///
/// Refcounted through `Arc`; the registry holds one reference, lookups
/// take transient ones. The threads only hold the inner state, so
/// dropping the last reference after `shutdown` frees everything.
pub struct VmIrqfdContext {
    inner: Arc<ContextInner>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl VmIrqfdContext {
    fn new(vm_id: u32, hypervisor: Arc<dyn Hypervisor>) -> Result<VmIrqfdContext> {
        let epoll = Epoll::new().map_err(Error::Epoll)?;
        let exit_event = EventFd::new(libc::EFD_NONBLOCK).map_err(Error::EventFd)?;
        epoll
            .add(exit_event.as_raw_fd(), EVENT_IN, EXIT_TOKEN)
            .map_err(Error::Epoll)?;

        let (tx, rx) = channel();
        let inner = Arc::new(ContextInner {
            vm_id,
            hypervisor,
            epoll,
            bindings: Mutex::new(Vec::new()),
            exit_event,
            shutdown_tx: Mutex::new(Some(tx)),
            next_id: AtomicU64::new(0),
        });

        let dispatcher_inner = inner.clone();
        let dispatcher = thread::Builder::new()
            .name(format!("irqfd-dispatch-vm{}", vm_id))
            .spawn(move || run_dispatcher(dispatcher_inner))
            .map_err(Error::SpawnThread)?;

        let worker_inner = inner.clone();
        let worker = thread::Builder::new()
            .name(format!("irqfd-shutdown-vm{}", vm_id))
            .spawn(move || run_worker(worker_inner, rx))
            .map_err(Error::SpawnThread)?;

        Ok(VmIrqfdContext {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn assign(&self, config: &IrqfdConfig) -> Result<()> {
        let event = dup_eventfd(config.fd).map_err(Error::EventFd)?;
        let probe = event.try_clone().map_err(Error::EventFd)?;
        let msi = MsiConfig {
            addr: config.msi_addr,
            data: config.msi_data,
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut bindings = self.inner.bindings.lock().unwrap();
            if bindings.iter().any(|b| b.fd == config.fd) {
                return Err(Error::AlreadyAssigned(config.fd));
            }
            self.inner
                .epoll
                .add(event.as_raw_fd(), EVENT_IN, id)
                .map_err(Error::Epoll)?;
            bindings.push(IrqfdBinding {
                id,
                fd: config.fd,
                event,
                msi,
            });
        }

        // Deliver an edge that raced ahead of the registration: consume it
        // and inject exactly once, outside the table lock. If the
        // dispatcher got there first, the probe reads nothing.
        match probe.read() {
            Ok(_) => self.inner.inject(&msi),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => warn!(
                "VM {}: irqfd {} pending probe failed: {}",
                self.inner.vm_id, config.fd, e
            ),
        }

        METRICS.irqfd.assigns.inc();
        info!(
            "VM {}: irqfd {} bound to MSI {:#x}/{:#x}",
            self.inner.vm_id, config.fd, msi.addr, msi.data
        );
        Ok(())
    }

    fn deassign(&self, fd: RawFd) -> Result<()> {
        let binding = {
            let mut bindings = self.inner.bindings.lock().unwrap();
            match bindings.iter().position(|b| b.fd == fd) {
                Some(idx) => bindings.remove(idx),
                None => return Err(Error::NotAssigned(fd)),
            }
        };
        let _ = self.inner.epoll.delete(binding.event.as_raw_fd());
        METRICS.irqfd.deassigns.inc();
        info!("VM {}: irqfd {} unbound", self.inner.vm_id, fd);
        Ok(())
        // Dropping the binding drops its eventfd reference.
    }

    /// Stops both threads, drains queued shutdown work and force-releases
    /// every binding still live.
    fn shutdown(&self) {
        let _ = self.inner.exit_event.write(1);
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
        // Disconnect the worker feed; it drains what was queued and stops.
        self.inner.shutdown_tx.lock().unwrap().take();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }

        let leftovers: Vec<IrqfdBinding> =
            self.inner.bindings.lock().unwrap().drain(..).collect();
        for binding in &leftovers {
            let _ = self.inner.epoll.delete(binding.event.as_raw_fd());
        }
        if !leftovers.is_empty() {
            info!(
                "VM {}: released {} live irqfd bindings at teardown",
                self.inner.vm_id,
                leftovers.len()
            );
        }
    }
}

/// Owns the VM id to irqfd context registry.
pub struct IrqfdManager {
    hypervisor: Arc<dyn Hypervisor>,
    /// Held briefly for registry updates, never across I/O.
    vms: Mutex<HashMap<u32, Arc<VmIrqfdContext>>>,
}

impl IrqfdManager {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> IrqfdManager {
        IrqfdManager {
            hypervisor,
            vms: Mutex::new(HashMap::new()),
        }
    }

    /// Single entry point matching the VMM-facing request: the
    /// `IRQFD_FLAG_DEASSIGN` bit selects teardown.
    pub fn irqfd(&self, vm_id: u32, config: &IrqfdConfig) -> Result<()> {
        if config.flags & IRQFD_FLAG_DEASSIGN != 0 {
            self.deassign(vm_id, config)
        } else {
            self.assign(vm_id, config)
        }
    }

    /// Binds an eventfd to an MSI descriptor. The per-VM context is
    /// created lazily on the first assignment.
    pub fn assign(&self, vm_id: u32, config: &IrqfdConfig) -> Result<()> {
        let ctx = self.get_or_create(vm_id)?;
        ctx.assign(config)
    }

    /// Removes an existing binding, inline (process context).
    pub fn deassign(&self, vm_id: u32, config: &IrqfdConfig) -> Result<()> {
        let ctx = self.get(vm_id).ok_or(Error::VmNotFound(vm_id))?;
        ctx.deassign(config.fd)
    }

    /// Tears down the VM's irqfd state: waits for in-flight shutdown work
    /// and releases every binding. Idempotent for unknown VM ids.
    pub fn deinit(&self, vm_id: u32) {
        let ctx = self.vms.lock().unwrap().remove(&vm_id);
        if let Some(ctx) = ctx {
            ctx.shutdown();
            info!("irqfd context for VM {} destroyed", vm_id);
        }
    }

    fn get(&self, vm_id: u32) -> Option<Arc<VmIrqfdContext>> {
        self.vms.lock().unwrap().get(&vm_id).cloned()
    }

    fn get_or_create(&self, vm_id: u32) -> Result<Arc<VmIrqfdContext>> {
        let mut vms = self.vms.lock().unwrap();
        if let Some(ctx) = vms.get(&vm_id) {
            return Ok(ctx.clone());
        }
        let ctx = Arc::new(VmIrqfdContext::new(vm_id, self.hypervisor.clone())?);
        vms.insert(vm_id, ctx.clone());
        info!("created irqfd context for VM {}", vm_id);
        Ok(ctx)
    }

    #[cfg(test)]
    fn context(&self, vm_id: u32) -> Option<Arc<VmIrqfdContext>> {
        self.get(vm_id)
    }

    #[cfg(test)]
    fn binding_count(&self, vm_id: u32) -> Option<usize> {
        self.get(vm_id)
            .map(|ctx| ctx.inner.bindings.lock().unwrap().len())
    }
}

/// Duplicates the VMM's eventfd so the binding holds its own reference,
/// and makes it non-blocking so neither the dispatcher nor the pending
/// probe can stall on a counter another consumer already drained.
fn dup_eventfd(fd: RawFd) -> io::Result<EventFd> {
    // Safe because we check the return value of every call and only wrap
    // the fd once it is fully ours.
    unsafe {
        let dup = libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0);
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = libc::fcntl(dup, libc::F_GETFL);
        if flags < 0 || libc::fcntl(dup, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let err = io::Error::last_os_error();
            libc::close(dup);
            return Err(err);
        }
        Ok(EventFd::from_raw_fd(dup))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeHypervisor;
    use std::time::{Duration, Instant};

    const MSI_ADDR: u64 = 0xfee0_0000;

    fn manager() -> (Arc<IrqfdManager>, Arc<FakeHypervisor>) {
        let hv = Arc::new(FakeHypervisor::new());
        (Arc::new(IrqfdManager::new(hv.clone())), hv)
    }

    fn config(fd: RawFd, data: u32) -> IrqfdConfig {
        IrqfdConfig {
            fd,
            msi_addr: MSI_ADDR,
            msi_data: data,
            flags: 0,
        }
    }

    fn deassign_config(fd: RawFd) -> IrqfdConfig {
        IrqfdConfig {
            fd,
            msi_addr: 0,
            msi_data: 0,
            flags: IRQFD_FLAG_DEASSIGN,
        }
    }

    fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_assign_and_deassign() {
        let (mgr, _hv) = manager();
        let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();

        mgr.irqfd(1, &config(event.as_raw_fd(), 0x20)).unwrap();
        assert_eq!(mgr.binding_count(1), Some(1));

        mgr.irqfd(1, &deassign_config(event.as_raw_fd())).unwrap();
        assert_eq!(mgr.binding_count(1), Some(0));

        // The VMM's own eventfd reference survives the unbind.
        event.write(3).unwrap();
        assert_eq!(event.read().unwrap(), 3);

        mgr.deinit(1);
    }

    #[test]
    fn test_duplicate_assign_is_rejected() {
        let (mgr, _hv) = manager();
        let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();

        mgr.assign(1, &config(event.as_raw_fd(), 0x20)).unwrap();
        match mgr.assign(1, &config(event.as_raw_fd(), 0x21)) {
            Err(Error::AlreadyAssigned(fd)) => assert_eq!(fd, event.as_raw_fd()),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(mgr.binding_count(1), Some(1));

        mgr.deinit(1);
    }

    #[test]
    fn test_deassign_without_binding() {
        let (mgr, _hv) = manager();
        let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();

        // No context exists for the VM yet.
        match mgr.deassign(1, &deassign_config(event.as_raw_fd())) {
            Err(Error::VmNotFound(1)) => (),
            other => panic!("unexpected result: {:?}", other),
        }

        mgr.assign(1, &config(event.as_raw_fd(), 0x20)).unwrap();
        mgr.deassign(1, &deassign_config(event.as_raw_fd())).unwrap();
        match mgr.deassign(1, &deassign_config(event.as_raw_fd())) {
            Err(Error::NotAssigned(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }

        mgr.deinit(1);
    }

    #[test]
    fn test_signal_injects_bound_msi() {
        let (mgr, hv) = manager();
        let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        mgr.assign(3, &config(event.as_raw_fd(), 0x40)).unwrap();

        event.write(1).unwrap();
        let msis = hv.wait_for_msis(1, Duration::from_secs(2));
        assert_eq!(msis.len(), 1);
        assert_eq!(msis[0].0, 3);
        assert_eq!(msis[0].1.addr, MSI_ADDR);
        assert_eq!(msis[0].1.data, 0x40);

        event.write(1).unwrap();
        assert_eq!(hv.wait_for_msis(2, Duration::from_secs(2)).len(), 2);

        mgr.deinit(3);
    }

    #[test]
    fn test_bindings_are_independent() {
        let (mgr, hv) = manager();
        let first = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        let second = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        mgr.assign(1, &config(first.as_raw_fd(), 0x40)).unwrap();
        mgr.assign(1, &config(second.as_raw_fd(), 0x41)).unwrap();

        second.write(1).unwrap();
        let msis = hv.wait_for_msis(1, Duration::from_secs(2));
        assert_eq!(msis.len(), 1);
        assert_eq!(msis[0].1.data, 0x41);

        first.write(1).unwrap();
        let msis = hv.wait_for_msis(2, Duration::from_secs(2));
        assert_eq!(msis.len(), 2);
        assert_eq!(msis[1].1.data, 0x40);

        mgr.deinit(1);
    }

    #[test]
    fn test_pending_signal_at_assign_injects_exactly_once() {
        let (mgr, hv) = manager();
        let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        // Device fired before the binding was established; the counter may
        // even have accumulated several edges.
        event.write(5).unwrap();

        mgr.assign(1, &config(event.as_raw_fd(), 0x22)).unwrap();
        assert_eq!(hv.wait_for_msis(1, Duration::from_secs(2)).len(), 1);
        // No second injection for the same pending counter.
        assert_eq!(hv.wait_for_msis(2, Duration::from_millis(200)).len(), 1);

        mgr.deinit(1);
    }

    #[test]
    fn test_failed_injection_is_dropped() {
        let (mgr, hv) = manager();
        hv.fail_msi.store(true, Ordering::Relaxed);
        let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        event.write(1).unwrap();

        // The pending probe injects synchronously, so the drop is visible
        // without waiting on the dispatcher.
        mgr.assign(1, &config(event.as_raw_fd(), 0x23)).unwrap();
        assert!(hv.msis().is_empty());
        // The binding stays live.
        assert_eq!(mgr.binding_count(1), Some(1));

        mgr.deinit(1);
    }

    #[test]
    fn test_queued_shutdown_runs_in_worker() {
        let (mgr, _hv) = manager();
        let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        mgr.assign(1, &config(event.as_raw_fd(), 0x30)).unwrap();

        let ctx = mgr.context(1).unwrap();
        let token = ctx.inner.bindings.lock().unwrap()[0].id;
        ctx.inner.queue_shutdown(token);

        assert!(wait_until(|| mgr.binding_count(1) == Some(0)));
        // A stale token for the already-removed binding is ignored.
        ctx.inner.shutdown_binding(token);

        mgr.deinit(1);
    }

    #[test]
    fn test_deassign_wins_race_with_queued_shutdown() {
        let (mgr, _hv) = manager();
        let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        mgr.assign(1, &config(event.as_raw_fd(), 0x30)).unwrap();

        let ctx = mgr.context(1).unwrap();
        let token = ctx.inner.bindings.lock().unwrap()[0].id;
        mgr.deassign(1, &deassign_config(event.as_raw_fd())).unwrap();
        // The worker finds nothing left to tear down.
        ctx.inner.queue_shutdown(token);
        assert!(wait_until(|| mgr.binding_count(1) == Some(0)));

        mgr.deinit(1);
    }

    #[test]
    fn test_deinit_releases_live_bindings_and_is_idempotent() {
        let (mgr, _hv) = manager();
        let first = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        let second = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        mgr.assign(4, &config(first.as_raw_fd(), 0x10)).unwrap();
        mgr.assign(4, &config(second.as_raw_fd(), 0x11)).unwrap();

        mgr.deinit(4);
        assert!(mgr.context(4).is_none());
        // A second teardown for the same VM is a no-op.
        mgr.deinit(4);
        // An unknown VM id is too.
        mgr.deinit(99);

        // The eventfds themselves stay usable by their owner.
        first.write(1).unwrap();
        assert_eq!(first.read().unwrap(), 1);
    }

    #[test]
    fn test_assign_from_other_threads() {
        let (mgr, hv) = manager();
        let mut events = Vec::new();
        let mut handles = Vec::new();
        for i in 0..4u32 {
            let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();
            let fd = event.as_raw_fd();
            events.push(event);
            let mgr = mgr.clone();
            handles.push(thread::spawn(move || {
                mgr.assign(1, &config(fd, 0x50 + i)).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mgr.binding_count(1), Some(4));

        for event in &events {
            event.write(1).unwrap();
        }
        assert_eq!(hv.wait_for_msis(4, Duration::from_secs(2)).len(), 4);

        mgr.deinit(1);
    }

    #[test]
    fn test_concurrent_assign_and_hangup_shutdown() {
        let (mgr, hv) = manager();

        // First wave of bindings; these will be hung up.
        let mut victims = Vec::new();
        for i in 0..8u32 {
            let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();
            mgr.assign(1, &config(event.as_raw_fd(), 0x60 + i)).unwrap();
            victims.push(event);
        }
        let ctx = mgr.context(1).unwrap();
        let tokens: Vec<u64> = ctx
            .inner
            .bindings
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.id)
            .collect();
        let hangups_before = METRICS.irqfd.hangup_shutdowns.count();

        // Second wave assigned from another thread while the first wave is
        // being hung up.
        let survivors: Vec<EventFd> = (0..8)
            .map(|_| EventFd::new(libc::EFD_NONBLOCK).unwrap())
            .collect();
        let fds: Vec<RawFd> = survivors.iter().map(|e| e.as_raw_fd()).collect();
        let assign_mgr = mgr.clone();
        let assigner = thread::spawn(move || {
            for (i, fd) in fds.into_iter().enumerate() {
                assign_mgr.assign(1, &config(fd, 0x70 + i as u32)).unwrap();
            }
        });
        let hangup_ctx = ctx.clone();
        let hangup_tokens = tokens.clone();
        let hangup = thread::spawn(move || {
            for token in hangup_tokens {
                hangup_ctx.inner.queue_shutdown(token);
            }
        });
        assigner.join().unwrap();
        hangup.join().unwrap();

        // Exactly the second wave survives, and each hang-up was torn down
        // by the worker.
        assert!(wait_until(|| mgr.binding_count(1) == Some(8)));
        assert!(wait_until(|| {
            METRICS.irqfd.hangup_shutdowns.count() >= hangups_before + 8
        }));
        // Replaying the hung-up tokens finds nothing further to remove.
        for token in tokens {
            ctx.inner.shutdown_binding(token);
        }
        assert_eq!(mgr.binding_count(1), Some(8));

        // The surviving bindings still dispatch.
        survivors[0].write(1).unwrap();
        assert_eq!(hv.wait_for_msis(1, Duration::from_secs(2)).len(), 1);

        mgr.deinit(1);
    }

    #[test]
    fn test_dup_eventfd_shares_the_counter() {
        let event = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        let dup = dup_eventfd(event.as_raw_fd()).unwrap();
        assert_ne!(dup.as_raw_fd(), event.as_raw_fd());

        event.write(7).unwrap();
        assert_eq!(dup.read().unwrap(), 7);
        // Counter drained; the non-blocking dup reports it instead of
        // stalling.
        assert_eq!(
            dup.read().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }
}
