//! # Worker Threads
//!
//! Host threads that drive an [`HfiDevice`]:
//!
//! - **dispatch**: woken by [`HfiDevice::isr`], runs the interrupt bottom
//!   half. Wake-ups coalesce, one pending wake-up is enough.
//! - **pm**: sleeps on the [`crate::pm::PmSchedule`] and runs the power
//!   collapse once a request survives its idle delay.

use alloc::boxed::Box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::device::HfiDevice;
use crate::{HfiError, Result};

/// How long the pm thread sleeps with nothing scheduled
const PM_IDLE_WAIT: Duration = Duration::from_millis(500);

/// Dispatch and power-collapse threads for one device
///
/// Dropping the workers stops and joins both threads.
#[derive(Debug)]
pub struct HfiWorkers {
    device: Arc<HfiDevice>,
    running: Arc<AtomicBool>,
    dispatch: Option<JoinHandle<()>>,
    pm: Option<JoinHandle<()>>,
}

impl HfiWorkers {
    /// Start both threads and hook them to the device
    pub fn spawn(device: Arc<HfiDevice>) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));

        let (tx, rx) = mpsc::sync_channel::<()>(1);
        let dispatch = {
            let device = device.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("cvp-dispatch".into())
                .spawn(move || dispatch_loop(&device, &rx, &running))
                .map_err(|e| {
                    log::error!("failed to spawn dispatch thread: {}", e);
                    HfiError::OutOfMemory
                })?
        };
        device.set_interrupt_notifier(Box::new(move || {
            // A full channel already has a wake-up queued
            let _ = tx.try_send(());
        }));

        let pm = {
            let device = device.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("cvp-pm".into())
                .spawn(move || pm_loop(&device, &running))
        };
        let pm = match pm {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("failed to spawn pm thread: {}", e);
                running.store(false, Ordering::SeqCst);
                device.clear_interrupt_notifier();
                let _ = dispatch.join();
                return Err(HfiError::OutOfMemory);
            }
        };
        let waker = pm.thread().clone();
        device
            .pm_schedule()
            .set_notifier(Box::new(move || waker.unpark()));

        log::info!("cvp workers started");
        Ok(Self {
            device,
            running,
            dispatch: Some(dispatch),
            pm: Some(pm),
        })
    }

    /// Whether both threads are still alive
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for HfiWorkers {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Dropping the sender ends the dispatch loop
        self.device.clear_interrupt_notifier();
        self.device.pm_schedule().clear_notifier();

        if let Some(pm) = self.pm.take() {
            pm.thread().unpark();
            if let Err(e) = pm.join() {
                log::error!("pm thread join error: {:?}", e);
            }
        }
        if let Some(dispatch) = self.dispatch.take() {
            if let Err(e) = dispatch.join() {
                log::error!("dispatch thread join error: {:?}", e);
            }
        }
        log::info!("cvp workers stopped");
    }
}

fn dispatch_loop(device: &HfiDevice, wake: &Receiver<()>, running: &AtomicBool) {
    while wake.recv().is_ok() {
        if !running.load(Ordering::Acquire) {
            break;
        }
        let delivered = device.process_interrupt();
        log::trace!("bottom half delivered {} events", delivered);
    }
    log::debug!("dispatch thread exiting");
}

fn pm_loop(device: &HfiDevice, running: &AtomicBool) {
    let pm = device.pm_schedule().clone();
    while running.load(Ordering::Acquire) {
        let Some(request) = pm.pending() else {
            thread::park_timeout(PM_IDLE_WAIT);
            continue;
        };

        let deadline = Instant::now() + Duration::from_millis(u64::from(request.delay_ms));
        loop {
            let now = Instant::now();
            if now >= deadline || !running.load(Ordering::Acquire) {
                break;
            }
            thread::park_timeout(deadline - now);
            if pm.pending() != Some(request) {
                break;
            }
        }

        if running.load(Ordering::Acquire) && pm.take(request.generation) {
            let outcome = device.pm_work();
            log::debug!("power collapse attempt: {:?}", outcome);
        }
    }
    log::debug!("pm thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HfiEvent;
    use crate::packet::ResponseKind;
    use crate::testing::TestRig;

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_isr_wakes_dispatch() {
        let mut rig = TestRig::new();
        rig.config.sw_power_collapsible = false;
        let dev = Arc::new(rig.device());
        dev.core_init().unwrap();
        let workers = HfiWorkers::spawn(dev.clone()).unwrap();

        let fw = rig.firmware();
        fw.post(ResponseKind::SysIdle, 0, 0);
        fw.raise_interrupt();
        dev.isr();

        assert!(wait_for(|| !rig.sink.events().is_empty()));
        assert!(matches!(rig.sink.events()[0], HfiEvent::System(_)));
        assert!(wait_for(|| rig.irq.is_enabled()));
        drop(workers);
    }

    #[test]
    fn test_idle_core_collapses() {
        let rig = TestRig::new();
        let dev = Arc::new(rig.device());
        dev.core_init().unwrap();
        let workers = HfiWorkers::spawn(dev.clone()).unwrap();
        assert!(workers.is_running());

        assert!(wait_for(|| !dev.is_powered()));
        assert!(dev.pm_schedule().pending().is_none());
    }

    #[test]
    fn test_running_session_keeps_power() {
        let rig = TestRig::new();
        let dev = Arc::new(rig.device());
        dev.core_init().unwrap();
        dev.session_init(1, 0).unwrap();
        let _workers = HfiWorkers::spawn(dev.clone()).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(dev.is_powered());
        assert!(dev.validate_session(crate::SessionHandle::from_wire_id(1 << 16)));
    }
}
