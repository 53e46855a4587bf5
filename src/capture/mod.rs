use anyhow::{Context, Result};
use log::{info, warn};
use pcap::{Capture, Device};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use crate::protocol::LinkType;

/// Read timeout of live captures; bounds how long the loop goes without an
/// `Idle` tick.
const READ_TIMEOUT_MS: i32 = 1000;

pub struct PacketData<'a> {
    pub data: &'a [u8],
    pub timestamp: SystemTime,
}

pub enum CaptureEvent<'a> {
    Packet(PacketData<'a>),
    /// The read timeout expired without traffic.
    Idle,
}

pub enum PacketSource {
    Live(Capture<pcap::Active>, LinkType),
    File(Capture<pcap::Offline>, LinkType),
}

impl PacketSource {
    pub fn link_type(&self) -> LinkType {
        match self {
            PacketSource::Live(_, lt) | PacketSource::File(_, lt) => *lt,
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, PacketSource::File(..))
    }

    pub fn live(interface: Option<&str>, snaplen: i32, promisc: bool) -> Result<Self> {
        let device = match interface {
            Some(name) => Device::list()?
                .into_iter()
                .find(|d| d.name == name)
                .context(format!("Interface '{}' not found", name))?,
            None => Device::lookup()?.context("No capture device found")?,
        };
        info!("Capturing on {}", device.name);

        let cap = Capture::from_device(device)?
            .snaplen(snaplen)
            .promisc(promisc)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .context("Failed to open capture device")?;

        let lt = link_type_from_pcap(cap.get_datalink());
        Ok(PacketSource::Live(cap, lt))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let cap = Capture::from_file(path)
            .context(format!("Failed to open pcap file: {}", path.display()))?;
        info!("Reading {}", path.display());

        let lt = link_type_from_pcap(cap.get_datalink());
        Ok(PacketSource::File(cap, lt))
    }

    /// Deliver packets and idle ticks to `f` until the file ends, `f`
    /// returns `false`, or `stop` is raised. Device errors end the loop
    /// with `Err`.
    pub fn run<F>(&mut self, stop: &Arc<AtomicBool>, mut f: F) -> Result<()>
    where
        F: FnMut(CaptureEvent) -> bool,
    {
        while !stop.load(Ordering::Relaxed) {
            let raw = match self {
                PacketSource::Live(cap, _) => cap.next_packet(),
                PacketSource::File(cap, _) => cap.next_packet(),
            };

            let event = match raw {
                Ok(packet) => {
                    let ts = {
                        let tv = packet.header.ts;
                        let secs = (tv.tv_sec as i64).max(0) as u64;
                        // tv_usec is microseconds (max 999_999) from libpcap's timeval.
                        // Clamp to valid range to guard against malformed pcap/pcapng files.
                        let usec = (tv.tv_usec as i64).clamp(0, 999_999) as u32;
                        std::time::UNIX_EPOCH + std::time::Duration::new(secs, usec * 1000)
                    };
                    CaptureEvent::Packet(PacketData {
                        data: packet.data,
                        timestamp: ts,
                    })
                }
                Err(pcap::Error::NoMorePackets) => break,
                Err(pcap::Error::TimeoutExpired) => CaptureEvent::Idle,
                Err(e) => return Err(e).context("Capture failed"),
            };

            if !f(event) {
                break;
            }
        }

        Ok(())
    }
}

/// Names and descriptions of the capture devices on this host.
pub fn list_interfaces() -> Result<Vec<(String, Option<String>)>> {
    Ok(Device::list()
        .context("Failed to list capture devices")?
        .into_iter()
        .map(|d| (d.name, d.desc))
        .collect())
}

fn link_type_from_pcap(dl: pcap::Linktype) -> LinkType {
    match dl.0 {
        1 => LinkType::Ethernet,     // DLT_EN10MB
        12 | 101 => LinkType::RawIp, // DLT_RAW
        113 => LinkType::LinuxSll,   // DLT_LINUX_SLL
        _ => {
            warn!(
                "Unsupported link type {} ({}), assuming Ethernet",
                dl.get_name().unwrap_or_default(),
                dl.0
            );
            LinkType::Ethernet
        }
    }
}
