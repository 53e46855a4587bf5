use std::time::{Duration, SystemTime};

use log::{debug, trace};

use super::SessionFinalizer;
use crate::protocol::{ParsedPacket, Transport};
use crate::reassembly::{PendingSession, SessionTable};

/// Idle limits after which open sessions are closed.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub tcp: Duration,
    pub udp: Duration,
    /// Minimum time between two sweeps.
    pub sweep_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            tcp: Duration::from_secs(600),
            udp: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub packets_seen: u64,
    pub packets_admitted: u64,
    pub sessions_stored: u64,
    pub sessions_dropped: u64,
}

/// Admission, reassembly and finalization on the capture thread.
pub struct Pipeline {
    table: SessionTable,
    finalizer: SessionFinalizer,
    timeouts: Timeouts,
    last_sweep: Option<SystemTime>,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(table: SessionTable, finalizer: SessionFinalizer, timeouts: Timeouts) -> Self {
        Pipeline {
            table,
            finalizer,
            timeouts,
            last_sweep: None,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn pending_sessions(&self) -> usize {
        self.table.len()
    }

    /// Admit a parsed packet if it belongs to a known service, and finalize
    /// its session if the packet closed it. Returns whether it was admitted.
    pub fn handle_packet(&mut self, packet: &ParsedPacket, timestamp: SystemTime) -> bool {
        self.stats.packets_seen += 1;
        if !packet.transport.is_session_transport() {
            return false;
        }
        let (Some(src), Some(dst)) = (packet.source(), packet.destination()) else {
            return false;
        };

        let service = self.finalizer.services().lookup_service(
            packet.transport,
            src.addr,
            src.port,
            dst.addr,
            dst.port,
        );
        let Some(service) = service else {
            trace!("{} {} -> {}", packet.transport, src, dst);
            return false;
        };
        self.stats.packets_admitted += 1;
        trace!("{} {} {} -> {}, {} bytes", packet.transport, service, src, dst, packet.payload.len());

        if let Some(closed) = self.table.process(packet, timestamp) {
            self.finish(closed);
        }
        true
    }

    /// Close every `transport` session idle for longer than `timeout`.
    /// Returns how many of them were stored.
    pub fn sweep(&mut self, transport: Transport, timeout: Duration, now: SystemTime) -> usize {
        let expired = self.table.sweep(transport, timeout, now);
        if !expired.is_empty() {
            debug!("Closing {} idle {} session(s)", expired.len(), transport);
        }
        expired
            .into_iter()
            .map(|s| self.finish(s))
            .filter(|&stored| stored)
            .count()
    }

    /// Sweep both transports if the sweep interval elapsed since the last run.
    pub fn maybe_sweep(&mut self, now: SystemTime) -> usize {
        let due = match self.last_sweep {
            None => true,
            Some(last) => now
                .duration_since(last)
                .is_ok_and(|since| since >= self.timeouts.sweep_interval),
        };
        if !due {
            return 0;
        }
        self.last_sweep = Some(now);
        let tcp = self.sweep(Transport::Tcp, self.timeouts.tcp, now);
        let udp = self.sweep(Transport::Udp, self.timeouts.udp, now);
        tcp + udp
    }

    /// Finalize every pending session, e.g. at the end of a capture file.
    pub fn flush(&mut self) -> usize {
        let pending = self.table.drain();
        debug!("Flushing {} pending session(s)", pending.len());
        pending.into_iter().map(|s| self.finish(s)).filter(|&stored| stored).count()
    }

    fn finish(&mut self, session: PendingSession) -> bool {
        let stored = self.finalizer.finalize(session);
        if stored {
            self.stats.sessions_stored += 1;
        } else {
            self.stats.sessions_dropped += 1;
        }
        stored
    }
}
