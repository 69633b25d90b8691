use anyhow::{Context, Result};
use pcap::{Activated, Capture, Device};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::protocol::LinkType;

/// One captured frame, borrowed from the capture handle's buffer.
pub struct Frame<'a> {
    pub data: &'a [u8],
    pub timestamp: SystemTime,
}

enum Handle {
    Live(Capture<pcap::Active>),
    File(Capture<pcap::Offline>),
}

/// Where frames come from: a live interface or a capture file.
pub struct PacketSource {
    handle: Handle,
    link_type: LinkType,
}

impl PacketSource {
    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn live(interface: Option<&str>, snaplen: i32, bpf: Option<&str>) -> Result<Self> {
        let device = match interface {
            Some(name) => Device::list()?
                .into_iter()
                .find(|d| d.name == name)
                .context(format!("Interface '{}' not found", name))?,
            None => Device::lookup()?.context("No capture device found")?,
        };
        info!(device = %device.name, snaplen, "starting live capture");

        let mut cap = Capture::from_device(device)?
            .snaplen(snaplen)
            .promisc(true)
            .timeout(1000)
            .open()
            .context("Failed to open capture device")?;
        apply_filter(&mut cap, bpf)?;

        let link_type = link_type_from_pcap(cap.get_datalink());
        Ok(PacketSource {
            handle: Handle::Live(cap),
            link_type,
        })
    }

    pub fn from_file(path: &Path, bpf: Option<&str>) -> Result<Self> {
        let mut cap = Capture::from_file(path)
            .context(format!("Failed to open pcap file: {}", path.display()))?;
        apply_filter(&mut cap, bpf)?;

        let link_type = link_type_from_pcap(cap.get_datalink());
        Ok(PacketSource {
            handle: Handle::File(cap),
            link_type,
        })
    }

    /// Feed every frame to `f` until the source is exhausted or `f`
    /// returns `false`. Live read timeouts are retried.
    pub fn for_each_packet<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(Frame) -> bool,
    {
        loop {
            let next = match &mut self.handle {
                Handle::Live(cap) => cap.next_packet(),
                Handle::File(cap) => cap.next_packet(),
            };
            let packet = match next {
                Ok(packet) => packet,
                Err(pcap::Error::NoMorePackets) => return Ok(()),
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => return Err(e).context("Capture read failed"),
            };
            let tv = packet.header.ts;
            let frame = Frame {
                data: packet.data,
                timestamp: timeval_to_system_time(tv.tv_sec as i64, tv.tv_usec as i64),
            };
            if !f(frame) {
                return Ok(());
            }
        }
    }
}

fn apply_filter<T: Activated + ?Sized>(cap: &mut Capture<T>, bpf: Option<&str>) -> Result<()> {
    if let Some(filter) = bpf {
        cap.filter(filter, true)
            .context(format!("Invalid BPF filter: {}", filter))?;
    }
    Ok(())
}

/// Clamps negative seconds and out-of-range microseconds from malformed
/// capture files.
fn timeval_to_system_time(sec: i64, usec: i64) -> SystemTime {
    let secs = sec.max(0) as u64;
    let usec = usec.clamp(0, 999_999) as u32;
    UNIX_EPOCH + Duration::new(secs, usec * 1000)
}

fn link_type_from_pcap(dl: pcap::Linktype) -> LinkType {
    LinkType::from_dlt(dl.0).unwrap_or_else(|| {
        warn!(
            name = %dl.get_name().unwrap_or_default(),
            dlt = dl.0,
            "unsupported link type, assuming Ethernet"
        );
        LinkType::Ethernet
    })
}
