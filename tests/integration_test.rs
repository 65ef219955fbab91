use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowmirror::config::Options;
use flowmirror::error::{FlowmirrorError, Result};
use flowmirror::mirror::{RawConn, RawTransport};
use flowmirror::policy::{Direction, Policy, PolicyKind, Rule};
use flowmirror::service::Service;
use flowmirror_common::Version;
use tokio::net::UdpSocket;

#[derive(Default, Clone)]
struct CapturingTransport {
    sent: Arc<Mutex<Vec<(Ipv4Addr, Vec<u8>)>>>,
}

impl RawConn for CapturingTransport {
    fn send(&self, packet: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        self.sent.lock().unwrap().push((dst, packet.to_vec()));
        Ok(packet.len())
    }
}

impl RawTransport for CapturingTransport {
    fn open(&self, _dst: Ipv4Addr) -> io::Result<Arc<dyn RawConn>> {
        Ok(Arc::new(self.clone()))
    }
}

/// NetFlow v9 datagram: template 256 (IPV4_SRC_ADDR/4, L4_SRC_PORT/2) and
/// one data set with `records` records
fn v9_datagram(sequence: u32, records: u8) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&9u16.to_be_bytes());
    buf.extend_from_slice(&(1 + u16::from(records)).to_be_bytes());
    buf.extend_from_slice(&5000u32.to_be_bytes());
    buf.extend_from_slice(&1_700_000_000u32.to_be_bytes());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&5u32.to_be_bytes());
    buf.extend_from_slice(&[0, 0, 0, 16, 1, 0, 0, 2, 0, 8, 0, 4, 0, 7, 0, 2]);
    buf.extend_from_slice(&[1, 0]);
    buf.extend_from_slice(&(4 + u16::from(records) * 6).to_be_bytes());
    for i in 0..records {
        buf.extend_from_slice(&[192, 168, 0, i]);
        buf.extend_from_slice(&(1000 + u16::from(i)).to_be_bytes());
    }
    buf
}

fn test_options(dir: &std::path::Path) -> Options {
    Options {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        flow_forward_cfg: dir.join("flow-forward.conf"),
        queue_forward_cfg: dir.join("queue-forward.conf"),
        dynamic_workers: false,
        netflow9_port: 0,
        netflow9_workers: 2,
        netflow9_tpl_cache_file: Some(dir.join("netflowv9.templates")),
        ipfix_enabled: false,
        mq_name: "log".to_string(),
        ..Options::default()
    }
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..300 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test]
fn test_error_types() {
    let err = FlowmirrorError::AgentNotFound("10.9.9.9".to_string());
    assert!(err.to_string().contains("10.9.9.9"));

    let err = FlowmirrorError::InvalidState {
        protocol: "ipfix".to_string(),
        state: "running".to_string(),
    };
    assert!(err.to_string().contains("ipfix"));
}

#[test]
fn test_version_const() {
    assert!(!flowmirror::VERSION.is_empty());
}

#[tokio::test]
async fn test_collect_mirror_and_account_loss() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let transport = CapturingTransport::default();
    let service = Service::with_transport(test_options(dir.path()), Arc::new(transport.clone()))?;

    let reply = service.add_policy(
        PolicyKind::Mirror,
        Policy::new("p1", vec!["10.0.0.1:9999".to_string()])
            .with_rule(Rule::new("127.0.0.1", -1, Direction::Both)),
    );
    assert_eq!(reply.result, 1);
    assert!(dir.path().join("flow-forward.conf").exists());

    let bound = service.start().await?;
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].0, Version::NetflowV9);
    let addr = bound[0].1;

    let agent = UdpSocket::bind("127.0.0.1:0").await?;
    agent.send_to(&v9_datagram(100, 3), addr).await?;
    wait_for(|| transport.sent.lock().unwrap().len() == 1).await;
    agent.send_to(&v9_datagram(103, 1), addr).await?;
    wait_for(|| transport.sent.lock().unwrap().len() == 2).await;

    let status = service.collector_status();
    let netflow = &status["netflow9"];
    assert_eq!(netflow.udp_count, 2);
    assert_eq!(netflow.decoded_count, 2);
    assert_eq!(netflow.workers, 2);
    assert_eq!(service.netflow_packet_loss("127.0.0.1")?, 2);
    assert!(service.netflow_packet_loss("10.9.9.9").is_err());

    let mirror = &service.mirror_status()["netflow9"];
    assert_eq!(mirror.raw_sent_count, 2);
    assert_eq!(mirror.raw_error_count, 0);

    {
        let sent = transport.sent.lock().unwrap();
        let (dst, packet) = &sent[0];
        assert_eq!(*dst, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(&packet[12..16], &[127, 0, 0, 1]);
        assert_eq!(&packet[16..20], &[10, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([packet[22], packet[23]]), 9999);
        // mirrored header count: one template and three records
        assert_eq!(u16::from_be_bytes([packet[30], packet[31]]), 4);
    }

    service.shutdown().await;
    assert!(dir.path().join("netflowv9.templates").exists());
    assert_eq!(service.template_count(Version::NetflowV9), 1);
    Ok(())
}

#[tokio::test]
async fn test_policy_management_replies() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let service = Service::with_transport(
        test_options(dir.path()),
        Arc::new(CapturingTransport::default()),
    )?;

    let reply = service.add_policy(
        PolicyKind::Queue,
        Policy::new("q1", vec!["core".to_string()])
            .with_rule(Rule::new("10.0.0.9", 443, Direction::Ingress)),
    );
    assert!(reply.is_ok());
    assert_eq!(service.active_topics(), vec!["core".to_string()]);

    let reply = service.add_rule(
        PolicyKind::Queue,
        "q1",
        Rule::new("10.0.0.9", 443, Direction::Ingress),
    );
    assert_eq!(reply.result, -1);
    assert_eq!(reply.message, "already has same rule.");

    let reply = service.add_rule(
        PolicyKind::Queue,
        "q1",
        Rule::new("10.0.0.9", 80, Direction::Egress),
    );
    assert_eq!(reply.result, 2);

    let reply = service.delete_rule(PolicyKind::Queue, "q1", "443_0_10.0.0.9");
    assert_eq!(reply.result, 1);

    let policy = service.policy_by_id(PolicyKind::Queue, "q1").unwrap();
    assert_eq!(policy.rules.len(), 1);
    assert_eq!(policy.rules[0].port, 80);

    let reply = service.add_policy(
        PolicyKind::Mirror,
        Policy::new("bad", vec!["not-an-address".to_string()]),
    );
    assert_eq!(reply.result, -1);
    assert!(service.policies(PolicyKind::Mirror).is_empty());

    let reply = service.delete_policy(PolicyKind::Queue, "q1");
    assert!(reply.is_ok());
    assert!(service.active_topics().is_empty());
    assert_eq!(service.open_sockets(), 0);
    Ok(())
}
