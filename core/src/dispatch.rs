//! # Response Dispatch
//!
//! Interrupt bottom half. Runs in two phases:
//!
//! 1. Under the device lock: acknowledge the interrupt, drain the message
//!    queue into a batch of [`HfiEvent`]s, flush the debug queue.
//! 2. With the lock released: hand each event to the [`EventSink`] in the
//!    order it was drained, so a sink may submit new commands.
//!
//! A fatal interrupt (watchdog or NOC error) produces exactly one
//! [`HfiEvent::Fatal`] and leaves the message queue untouched.

use alloc::sync::Arc;
use alloc::vec::Vec;

use cvp_hal::regs::{self, IntrStatus};
use spin::RwLock;

use crate::device::{CoreState, HfiCore};
use crate::packet::{parse_debug, DebugRecord, HfiResponse, ResponseKind};
use crate::queue::QueueRole;
use crate::session::SessionHandle;
use crate::{HfiError, Result};

/// Something the upper layer must hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HfiEvent {
    /// Firmware died (watchdog or NOC error), restart required
    Fatal {
        /// Latched wrapper interrupt status
        intr_status: u32,
    },
    /// System-level response
    System(HfiResponse),
    /// Response for a live session
    Session {
        /// Session the response belongs to
        session: SessionHandle,
        /// Caller cookie given at session init
        cookie: u64,
        /// The response
        response: HfiResponse,
    },
}

/// Why the core is asking for a subsystem restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// Register access while unpowered
    UnpoweredAccess,
    /// Power collapse kept failing
    PowerCollapseStuck,
    /// Resume sequence failed
    ResumeFailed,
    /// Regulator could not be switched
    RegulatorFault,
}

/// Receiver of firmware events
///
/// `on_event` runs without the device lock and may call back into the
/// device. `on_fatal` can be raised from inside the device lock and must
/// not.
pub trait EventSink: Send + Sync {
    /// Deliver one event
    fn on_event(&self, event: HfiEvent);

    /// The core needs a subsystem restart
    fn on_fatal(&self, reason: FatalReason);
}

/// Shared slot holding the registered sink
#[derive(Clone, Default)]
pub(crate) struct SinkSlot(Arc<RwLock<Option<Arc<dyn EventSink>>>>);

impl SinkSlot {
    pub(crate) fn set(&self, sink: Arc<dyn EventSink>) {
        *self.0.write() = Some(sink);
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn EventSink>> {
        self.0.read().clone()
    }

    pub(crate) fn raise_fatal(&self, reason: FatalReason) {
        log::error!("fatal: {:?}", reason);
        if let Some(sink) = self.get() {
            sink.on_fatal(reason);
        }
    }
}

impl HfiCore {
    /// Latch and acknowledge the wrapper interrupt
    pub(crate) fn clear_interrupt(&mut self) -> Result<()> {
        let status = self.regs.read(regs::WRAPPER_INTR_STATUS)?;
        let mask = (IntrStatus::A2HCPU | IntrStatus::FATAL).bits();
        if status & mask != 0 {
            self.intr_status |= status;
            self.reg_count += 1;
            log::debug!(
                "interrupt status {:#x}, reg {} spur {}",
                self.intr_status,
                self.reg_count,
                self.spur_count
            );
        } else {
            self.spur_count += 1;
        }
        self.regs.write(regs::CPU_CS_A2HSOFTINTCLR, 1)
    }

    /// Phase one: turn the message queue into events
    pub(crate) fn drain_responses(&mut self) -> Vec<HfiEvent> {
        let mut events = Vec::new();
        if self.state != CoreState::Booted {
            return events;
        }

        let status = IntrStatus::from_bits_truncate(self.intr_status);
        if status.intersects(IntrStatus::FATAL) {
            self.log_crash_report();
            if status.contains(IntrStatus::CPU_NOC_ERR) {
                log::error!("received firmware CPU NOC error");
            }
            if status.contains(IntrStatus::CORE_NOC_ERR) {
                log::error!("received CVP core NOC error");
            }
            if status.contains(IntrStatus::A2HWD) {
                log::error!("received CVP watchdog timeout");
            }
            events.push(HfiEvent::Fatal {
                intr_status: self.intr_status,
            });
            self.flush_debug_queue();
            return events;
        }

        loop {
            let raw = match self.msgq_read() {
                Ok(raw) => raw,
                Err(HfiError::CorruptPacket) => continue,
                Err(HfiError::QueueEmpty) => break,
                Err(e) => {
                    log::warn!("message queue read failed: {}", e);
                    break;
                }
            };
            let response = match self.packets.decode(&raw) {
                Ok(r) => r,
                Err(_) => {
                    log::warn!("corrupt or unknown packet found, discarding");
                    continue;
                }
            };
            if response.kind == ResponseKind::NoResponse {
                continue;
            }

            let kind = response.kind;
            self.process_system_msg(&response);

            let event = if kind.carries_session() {
                let session = response
                    .session_id
                    .and_then(|id| self.sessions.lookup_by_id(id));
                match session {
                    Some(s) => HfiEvent::Session {
                        session: s.handle,
                        cookie: s.cookie,
                        response,
                    },
                    None => {
                        log::error!(
                            "{:?} for unknown session {:#x?}, discarding",
                            kind,
                            response.session_id
                        );
                        continue;
                    }
                }
            } else {
                HfiEvent::System(response)
            };
            events.push(event);

            if events.len() >= self.config.max_packets_per_irq {
                log::warn!("too many packets in message queue");
                break;
            }
            // Nothing after a system error can be trusted
            if kind == ResponseKind::SysError {
                break;
            }
        }

        if self.config.sw_power_collapsible {
            self.pm.schedule(self.config.pc_delay_ms);
        }
        self.flush_debug_queue();
        events
    }

    fn msgq_read(&self) -> Result<Vec<u8>> {
        if self.state != CoreState::Booted {
            return Err(HfiError::InvalidState);
        }
        let mem = self.memory.as_ref().ok_or(HfiError::InvalidState)?;
        let out = mem.queue(QueueRole::Message).read()?;
        if out.tx_requested {
            if let Err(e) = self.regs.write(regs::CPU_CS_H2ASOFTINT, 1) {
                log::warn!("message queue doorbell failed: {}", e);
            }
        }
        Ok(out.packet)
    }

    fn process_system_msg(&self, response: &HfiResponse) {
        match response.kind {
            ResponseKind::SysError => self.log_crash_report(),
            ResponseKind::SysReleaseResourceDone => log::debug!("received SYS_RELEASE_RESOURCE"),
            ResponseKind::SysInitDone => log::debug!("received SYS_INIT_DONE"),
            _ => {}
        }
    }

    fn log_crash_report(&self) {
        if let Some(sfr) = self.memory.as_ref().and_then(|m| m.sfr.as_ref()) {
            log::error!("SFR message from firmware: {}", sfr.message());
        }
    }

    /// Re-emit every pending firmware log line
    pub(crate) fn flush_debug_queue(&self) -> usize {
        let Some(mem) = self.memory.as_ref() else {
            return 0;
        };
        let mut lines = 0;
        loop {
            let out = match mem.queue(QueueRole::Debug).read() {
                Ok(out) => out,
                Err(HfiError::CorruptPacket) => continue,
                Err(_) => break,
            };
            if out.tx_requested && self.regs.is_powered() {
                let _ = self.regs.write(regs::CPU_CS_H2ASOFTINT, 1);
            }
            match parse_debug(&out.packet) {
                DebugRecord::Text(line) => {
                    log::info!(target: "cvp::fw", "{}", line);
                    lines += 1;
                }
                DebugRecord::Other(_) => {}
                DebugRecord::Malformed => {
                    log::error!("invalid debug packet of {} bytes", out.packet.len());
                }
            }
        }
        lines
    }
}
