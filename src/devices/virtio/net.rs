//! Virtio-net back-end over a host TAP interface.
//!
//! Two queues: 0 is RX (device-writable buffers the guest posts for us to
//! fill), 1 is TX (device-readable frames the guest wants on the wire). A
//! 12-byte virtio-net header precedes every frame in both directions; this
//! back-end does no offloads, so the header is all zeros out and ignored in.
//!
//! Threads: the TX thread parks on the queue-1 doorbell and drains the
//! ring into the TAP fd; the RX thread parks in the TAP read and copies
//! each arriving frame into the next posted RX chain. Both publish to
//! their used ring and edge-inject the NIC IRQ, unless the driver asked
//! for suppression. A TAP read or write error latches the device FAILED;
//! a congested interface just drops frames, the way a real NIC does.

use super::{BarEffect, Transport};
use crate::boot::GuestMemory;
use crate::devices::pci::{ConfigSpace, PciDevice};
use crate::kvm::IrqTrigger;
use crate::tap::Tap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Queue indices.
const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;

/// Legacy virtio-net header; no flags, no GSO, no checksum offload.
const NET_HDR_SIZE: usize = 12;

/// VIRTIO_NET_F_MAC: the device supplies a MAC in config space.
const FEATURE_MAC: u32 = 1 << 5;

/// Fixed locally-administered MAC the guest sees.
const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// Largest ethernet frame we move, TSO-free.
const MAX_FRAME_SIZE: usize = 65536;

/// Virtio-net device model plus its TAP back-end.
pub struct VirtioNet {
    transport: Mutex<Transport>,
    config: Mutex<ConfigSpace>,
    tap: Tap,
    mem: Arc<GuestMemory>,
    irq: Arc<dyn IrqTrigger>,
    io_base: u16,
    tx_pending: Mutex<bool>,
    tx_doorbell: Condvar,
}

impl VirtioNet {
    pub fn new(
        tap: Tap,
        mem: Arc<GuestMemory>,
        irq: Arc<dyn IrqTrigger>,
        io_base: u16,
        irq_line: u8,
    ) -> Self {
        let mut config = ConfigSpace::new(0x1af4, 0x1000, 0x02_00_00, 1);
        config.set_bar0_io(io_base, 64);
        config.set_interrupt(irq_line, 1);

        Self {
            transport: Mutex::new(Transport::new(FEATURE_MAC, 2)),
            config: Mutex::new(config),
            tap,
            mem,
            irq,
            io_base,
            tx_pending: Mutex::new(false),
            tx_doorbell: Condvar::new(),
        }
    }

    /// Start the RX and TX threads. They run for the life of the process.
    pub fn start(self: &Arc<Self>) {
        let rx = Arc::clone(self);
        thread::Builder::new()
            .name("virtio-net-rx".into())
            .spawn(move || rx.rx_loop())
            .expect("spawn virtio-net rx thread");

        let tx = Arc::clone(self);
        thread::Builder::new()
            .name("virtio-net-tx".into())
            .spawn(move || tx.tx_loop())
            .expect("spawn virtio-net tx thread");
    }

    fn rx_loop(&self) {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        loop {
            let len = match self.tap.read_frame(&mut buf) {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) => {
                    // The receive path is gone; tell the guest the device
                    // is dead instead of going silent.
                    log::error!("virtio-net: tap read failed, rx stopped: {e}");
                    self.transport.lock().unwrap().set_failed();
                    return;
                }
            };
            self.deliver_frame(&buf[..len]);
        }
    }

    /// Copy one inbound frame into the next posted RX chain. No chain
    /// posted means the guest is not keeping up; the frame is dropped the
    /// way a real NIC with a full ring drops it.
    fn deliver_frame(&self, frame: &[u8]) {
        let mut transport = self.transport.lock().unwrap();
        if !transport.active() {
            return;
        }

        let chain = match transport.queues[RX_QUEUE as usize].pop_chain(&self.mem) {
            Ok(Some(chain)) => chain,
            Ok(None) => {
                log::debug!("virtio-net: rx ring empty, dropping {} bytes", frame.len());
                return;
            }
            Err(e) => {
                log::warn!("virtio-net: rx ring corrupt: {e}");
                transport.set_failed();
                return;
            }
        };

        let written = match chain.write_all(&self.mem, &encapsulate(frame)) {
            Ok(written) => written,
            Err(e) => {
                log::warn!("virtio-net: rx copy failed: {e}");
                transport.set_failed();
                return;
            }
        };

        if let Err(e) = transport.queues[RX_QUEUE as usize].push_used(&self.mem, chain.head, written)
        {
            log::warn!("virtio-net: rx used-ring update failed: {e}");
            transport.set_failed();
            return;
        }

        self.complete(&mut transport, RX_QUEUE);
    }

    fn tx_loop(&self) {
        loop {
            let mut pending = self.tx_pending.lock().unwrap();
            while !*pending {
                pending = self.tx_doorbell.wait(pending).unwrap();
            }
            *pending = false;
            drop(pending);

            self.process_tx();
        }
    }

    /// Drain the TX ring: each chain is one header-prefixed frame.
    fn process_tx(&self) {
        let mut transport = self.transport.lock().unwrap();
        if !transport.active() {
            return;
        }

        let mut sent = false;
        loop {
            let chain = match transport.queues[TX_QUEUE as usize].pop_chain(&self.mem) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("virtio-net: tx ring corrupt: {e}");
                    transport.set_failed();
                    return;
                }
            };

            match chain.read_all(&self.mem) {
                Ok(packet) if packet.len() > NET_HDR_SIZE => {
                    // A congested interface drops the frame (Ok(0)); a
                    // host error fails the device and drops the request.
                    if let Err(e) = self.tap.write_frame(&packet[NET_HDR_SIZE..]) {
                        log::warn!("virtio-net: tap write failed: {e}");
                        transport.set_failed();
                        return;
                    }
                }
                Ok(short) => {
                    log::debug!("virtio-net: runt tx packet ({} bytes)", short.len());
                }
                Err(e) => {
                    log::warn!("virtio-net: tx copy failed: {e}");
                    transport.set_failed();
                    return;
                }
            }

            // Nothing is written back into a TX chain.
            if let Err(e) = transport.queues[TX_QUEUE as usize].push_used(&self.mem, chain.head, 0) {
                log::warn!("virtio-net: tx used-ring update failed: {e}");
                transport.set_failed();
                return;
            }
            sent = true;
        }

        if sent {
            self.complete(&mut transport, TX_QUEUE);
        }
    }

    /// Used ring advanced: raise ISR and pulse the line unless the driver
    /// suppressed interrupts for this queue.
    fn complete(&self, transport: &mut Transport, queue: u16) {
        if transport.queues[queue as usize].interrupt_suppressed(&self.mem) {
            return;
        }
        transport.raise_isr();
        if let Err(e) = self.irq.trigger() {
            log::warn!("virtio-net: irq injection failed: {e}");
        }
    }

    fn ring_tx_doorbell(&self) {
        *self.tx_pending.lock().unwrap() = true;
        self.tx_doorbell.notify_one();
    }
}

/// Prefix a frame with the all-zero virtio-net header.
fn encapsulate(frame: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; NET_HDR_SIZE + frame.len()];
    packet[NET_HDR_SIZE..].copy_from_slice(frame);
    packet
}

impl PciDevice for VirtioNet {
    fn config_space(&self) -> &Mutex<ConfigSpace> {
        &self.config
    }

    fn io_range(&self) -> (u16, u16) {
        (self.io_base, self.io_base + 64)
    }

    fn io_in(&self, port: u16, data: &mut [u8]) {
        let offset = port - self.io_base;
        self.transport.lock().unwrap().bar_read(offset, data, &MAC);
    }

    fn io_out(&self, port: u16, data: &[u8]) {
        let offset = port - self.io_base;
        let effect = self.transport.lock().unwrap().bar_write(offset, data);
        if let BarEffect::Notify(queue) = effect {
            match queue {
                TX_QUEUE => self.ring_tx_doorbell(),
                // RX processing is driven by the TAP side; a kick just
                // means more buffers are posted.
                RX_QUEUE => {}
                other => log::debug!("virtio-net: notify for unknown queue {other}"),
            }
        }
    }
}
