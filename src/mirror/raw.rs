//! IPv4/UDP packet synthesis and the raw socket pool
//!
//! Mirrored datagrams keep the exporting agent as their source address, so
//! they are written with a hand-built IP header over `IPPROTO_RAW` sockets.

use std::collections::{BTreeSet, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use dashmap::DashMap;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info};

use crate::policy::validate::parse_mirror_target;
use crate::policy::TargetPool;
use crate::{FlowmirrorError, Result};

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
const DEFAULT_TTL: u8 = 64;
const UDP_PROTOCOL: u8 = 17;

/// Largest payload that fits one IPv4 datagram
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - IPV4_HEADER_LEN - UDP_HEADER_LEN;

/// Builds an IPv4 + UDP packet carrying `payload` from `src` to `dst`.
///
/// The UDP checksum is left at zero (optional for IPv4).
pub fn build_packet(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FlowmirrorError::PacketTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
    let total_len = IPV4_HEADER_LEN as u16 + udp_len;
    let mut buf = BytesMut::with_capacity(total_len as usize);

    buf.put_u8(0x45); // version 4, IHL 5
    buf.put_u8(0); // DSCP/ECN
    buf.put_u16(total_len);
    buf.put_u16(0); // identification
    buf.put_u16(0); // flags, fragment offset
    buf.put_u8(DEFAULT_TTL);
    buf.put_u8(UDP_PROTOCOL);
    buf.put_u16(0); // checksum, patched below
    buf.put_slice(&src.ip().octets());
    buf.put_slice(&dst.ip().octets());
    let checksum = ipv4_checksum(&buf[..IPV4_HEADER_LEN]);
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());

    buf.put_u16(src.port());
    buf.put_u16(dst.port());
    buf.put_u16(udp_len);
    buf.put_u16(0);
    buf.put_slice(payload);
    Ok(buf.to_vec())
}

/// RFC 1071 ones' complement checksum
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| {
            let hi = u32::from(pair[0]) << 8;
            let lo = pair.get(1).copied().map_or(0, u32::from);
            hi | lo
        })
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// An open raw socket
pub trait RawConn: Send + Sync {
    fn send(&self, packet: &[u8], dst: Ipv4Addr) -> io::Result<usize>;
}

/// Opens raw sockets; replaced by a recording fake in tests
pub trait RawTransport: Send + Sync {
    fn open(&self, dst: Ipv4Addr) -> io::Result<Arc<dyn RawConn>>;
}

/// `IPPROTO_RAW` sockets via socket2; requires CAP_NET_RAW
#[derive(Debug, Default)]
pub struct Socket2Transport;

struct Socket2Conn {
    socket: Socket,
}

impl RawConn for Socket2Conn {
    fn send(&self, packet: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        let addr = SockAddr::from(SocketAddrV4::new(dst, 0));
        self.socket.send_to(packet, &addr)
    }
}

impl RawTransport for Socket2Transport {
    fn open(&self, dst: Ipv4Addr) -> io::Result<Arc<dyn RawConn>> {
        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_RAW)),
        )?;
        debug!("Opened raw socket for {}", dst);
        Ok(Arc::new(Socket2Conn { socket }))
    }
}

/// A pooled socket; `epoch` changes every time the destination is reopened
#[derive(Clone)]
pub struct OpenSocket {
    pub conn: Arc<dyn RawConn>,
    pub epoch: u64,
}

/// Raw sockets keyed by destination IP
pub struct SocketPool {
    transport: Arc<dyn RawTransport>,
    sockets: DashMap<Ipv4Addr, OpenSocket>,
    epochs: AtomicU64,
}

impl SocketPool {
    pub fn new(transport: Arc<dyn RawTransport>) -> Self {
        Self {
            transport,
            sockets: DashMap::new(),
            epochs: AtomicU64::new(0),
        }
    }

    /// Socket for `dst`, opened on first use
    pub fn get_or_open(&self, dst: Ipv4Addr) -> io::Result<OpenSocket> {
        if let Some(socket) = self.sockets.get(&dst) {
            return Ok(socket.value().clone());
        }
        let socket = OpenSocket {
            conn: self.transport.open(dst)?,
            epoch: self.epochs.fetch_add(1, Ordering::Relaxed) + 1,
        };
        Ok(self.sockets.entry(dst).or_insert(socket).value().clone())
    }

    pub fn contains(&self, dst: Ipv4Addr) -> bool {
        self.sockets.contains_key(&dst)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

impl TargetPool for SocketPool {
    /// Closes sockets no rule references any more
    fn sync_targets(&self, targets: &BTreeSet<String>) {
        let live: HashSet<Ipv4Addr> = targets
            .iter()
            .filter_map(|target| match parse_mirror_target(target) {
                Ok(SocketAddr::V4(addr)) => Some(*addr.ip()),
                _ => None,
            })
            .collect();
        self.sockets.retain(|dst, _| {
            let keep = live.contains(dst);
            if !keep {
                info!("Recycle raw socket for {}", dst);
            }
            keep
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every packet instead of sending it; the next `fail_next`
    /// sends return ENOBUFS instead
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) sent: Arc<Mutex<Vec<(Ipv4Addr, Vec<u8>)>>>,
        pub(crate) opened: Mutex<usize>,
        pub(crate) fail_next: Arc<Mutex<usize>>,
    }

    struct RecordingConn {
        sent: Arc<Mutex<Vec<(Ipv4Addr, Vec<u8>)>>>,
        fail_next: Arc<Mutex<usize>>,
    }

    impl RawConn for RecordingConn {
        fn send(&self, packet: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
            let mut fail_next = self.fail_next.lock();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(io::Error::from_raw_os_error(libc::ENOBUFS));
            }
            self.sent.lock().push((dst, packet.to_vec()));
            Ok(packet.len())
        }
    }

    impl RawTransport for RecordingTransport {
        fn open(&self, _dst: Ipv4Addr) -> io::Result<Arc<dyn RawConn>> {
            *self.opened.lock() += 1;
            Ok(Arc::new(RecordingConn {
                sent: Arc::clone(&self.sent),
                fail_next: Arc::clone(&self.fail_next),
            }))
        }
    }

    #[test]
    fn test_build_packet_headers() {
        let src = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 9999);
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 2055);
        let packet = build_packet(src, dst, &[1, 2, 3, 4]).unwrap();

        assert_eq!(packet.len(), 32);
        assert_eq!(packet[0], 0x45);
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 32);
        assert_eq!(packet[8], 64);
        assert_eq!(packet[9], 17);
        assert_eq!(&packet[12..16], &[192, 168, 1, 1]);
        assert_eq!(&packet[16..20], &[10, 0, 0, 1]);
        // A valid header sums to zero
        assert_eq!(ipv4_checksum(&packet[..20]), 0);

        assert_eq!(u16::from_be_bytes([packet[20], packet[21]]), 9999);
        assert_eq!(u16::from_be_bytes([packet[22], packet[23]]), 2055);
        assert_eq!(u16::from_be_bytes([packet[24], packet[25]]), 12);
        assert_eq!(&packet[28..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_build_packet_length_bound() {
        let src = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 9999);
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 2055);

        let packet = build_packet(src, dst, &vec![0u8; 65507]).unwrap();
        assert_eq!(packet.len(), 65535);
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 65535);
        assert_eq!(u16::from_be_bytes([packet[24], packet[25]]), 65515);

        let err = build_packet(src, dst, &vec![0u8; 65508]).unwrap_err();
        assert!(matches!(
            err,
            FlowmirrorError::PacketTooLarge {
                len: 65508,
                max: 65507
            }
        ));
    }

    #[test]
    fn test_checksum_known_header() {
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(ipv4_checksum(&header), 0xb861);
    }

    #[test]
    fn test_pool_opens_once_and_recycles() {
        let transport = Arc::new(RecordingTransport::default());
        let pool = SocketPool::new(transport.clone());
        let a = Ipv4Addr::new(10, 0, 0, 1);
        let b = Ipv4Addr::new(10, 0, 0, 2);

        let first = pool.get_or_open(a).unwrap().epoch;
        assert_eq!(pool.get_or_open(a).unwrap().epoch, first);
        pool.get_or_open(b).unwrap();
        assert_eq!(*transport.opened.lock(), 2);
        assert_eq!(pool.len(), 2);

        let targets: BTreeSet<String> = ["10.0.0.1:9999".to_string()].into_iter().collect();
        pool.sync_targets(&targets);
        assert!(pool.contains(a));
        assert!(!pool.contains(b));

        pool.sync_targets(&BTreeSet::new());
        assert!(pool.is_empty());

        // a reopened destination gets a fresh epoch
        assert_ne!(pool.get_or_open(a).unwrap().epoch, first);
    }
}
