//! libpcap-backed capture implementation.

use std::time::{Duration, UNIX_EPOCH};

use bytes::Bytes;
use pcap::{Active, Capture, Device};

use super::{CaptureSpec, PacketSource, SourceOpener};
use crate::codec::{CapturedFrame, LinkType};
use crate::error::CaptureError;

/// Opens live libpcap sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveOpener;

impl SourceOpener for LiveOpener {
    fn open(&self, spec: &CaptureSpec) -> Result<Box<dyn PacketSource>, CaptureError> {
        Ok(Box::new(LiveCapture::open(spec)?))
    }
}

/// One live capture session on a named interface.
pub struct LiveCapture {
    handle: Capture<Active>,
    link_type: LinkType,
}

impl LiveCapture {
    /// Open the interface and apply the filter from `spec`.
    pub fn open(spec: &CaptureSpec) -> Result<Self, CaptureError> {
        let open_err = |source| CaptureError::Open {
            interface: spec.interface.clone(),
            source,
        };

        let mut handle = Capture::from_device(spec.interface.as_str())
            .map_err(open_err)?
            .promisc(spec.promiscuous)
            .snaplen(spec.snaplen as i32)
            .timeout(spec.poll_timeout.as_millis() as i32)
            .open()
            .map_err(open_err)?;

        if !spec.filter.is_empty() {
            handle
                .filter(&spec.filter, true)
                .map_err(|e| CaptureError::Filter {
                    filter: spec.filter.clone(),
                    source: e,
                })?;
        }

        let link_type = LinkType(handle.get_datalink().0 as u32);
        Ok(Self { handle, link_type })
    }
}

impl PacketSource for LiveCapture {
    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn next_frame(&mut self) -> Result<Option<CapturedFrame>, CaptureError> {
        match self.handle.next_packet() {
            Ok(packet) => {
                let header = *packet.header;
                let timestamp = UNIX_EPOCH
                    + Duration::new(header.ts.tv_sec as u64, header.ts.tv_usec as u32 * 1_000);
                Ok(Some(CapturedFrame::new(
                    timestamp,
                    header.len,
                    Bytes::copy_from_slice(packet.data),
                )))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(pcap::Error::NoMorePackets) => Err(CaptureError::SourceEnded),
            Err(e) => Err(CaptureError::Read(e)),
        }
    }
}

/// List capture-capable interfaces, one formatted line each.
pub fn list_interfaces() -> Result<Vec<String>, CaptureError> {
    let devices = Device::list().map_err(CaptureError::Devices)?;
    Ok(devices
        .into_iter()
        .map(|device| {
            let ips: Vec<String> = device
                .addresses
                .iter()
                .map(|addr| addr.addr.to_string())
                .collect();
            let ips = if ips.is_empty() {
                "no address".to_string()
            } else {
                ips.join(", ")
            };
            match device.desc {
                Some(desc) => format!("{}: {} [{}]", device.name, desc, ips),
                None => format!("{} [{}]", device.name, ips),
            }
        })
        .collect())
}
