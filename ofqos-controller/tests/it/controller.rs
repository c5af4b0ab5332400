use std::time::Duration;

use bytes::Bytes;
use ofqos_controller::{ControllerOptions, DatapathId, QosConfig};
use ofqos_wire::{Action, Body, FlowModCommand, Message, MeterModCommand, PortNo};
use tokio::{io::AsyncReadExt, net::TcpStream};

use crate::helpers::{
    controller, controller_with, eth_frame, eventually, tcp_frame, FakeSwitch, H1, H2, TIMEOUT,
};

#[tokio::test]
async fn switch_is_provisioned_on_connect() {
    let controller = controller(QosConfig::default()).await;
    let addr = *controller.local_addr().unwrap();

    let mut switch = FakeSwitch::connect(addr, 1).await;

    let Body::FlowMod(table_miss) = switch.recv().await.into_body() else {
        panic!("expected table miss first")
    };
    assert_eq!(table_miss.priority, 0);
    assert_eq!(table_miss.fields, Default::default());
    assert_eq!(table_miss.actions(), &[Action::to_controller()]);

    let sent = switch.drain(Duration::from_millis(200)).await;
    let mut meters: Vec<u32> = sent
        .iter()
        .filter_map(|b| match b {
            Body::MeterMod(m) if m.command == MeterModCommand::Add => Some(m.meter_id),
            _ => None,
        })
        .collect();
    meters.sort_unstable();
    assert_eq!(meters, vec![5000, 6000, 7000, 8000, 9000, 10000, 11000, 12000, 13000]);

    assert!(controller.registry().get(DatapathId(1)).is_ok());
    assert_eq!(controller.stats().active_switches(), 1);
}

#[tokio::test]
async fn qos_disabled_installs_no_meters() {
    let controller = controller(QosConfig { enabled: false, ..Default::default() }).await;
    let mut switch = FakeSwitch::connect(*controller.local_addr().unwrap(), 1).await;

    let sent = switch.drain(Duration::from_millis(200)).await;
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], Body::FlowMod(f) if f.priority == 0));
}

#[tokio::test]
async fn echo_is_answered() {
    let controller = controller(QosConfig::default()).await;
    let mut switch = FakeSwitch::connect(*controller.local_addr().unwrap(), 1).await;

    switch.send(Message::new(1234, Body::EchoRequest(Bytes::from_static(b"keepalive")))).await;
    let reply = switch.recv_until(|b| matches!(b, Body::EchoReply(_))).await;

    assert_eq!(reply.xid(), 1234);
    assert_eq!(reply.body(), &Body::EchoReply(Bytes::from_static(b"keepalive")));
}

#[tokio::test]
async fn unknown_destination_is_flooded_then_learned() {
    let controller = controller(QosConfig { enabled: false, ..Default::default() }).await;
    let mut switch = FakeSwitch::connect(*controller.local_addr().unwrap(), 1).await;
    switch.drain(Duration::from_millis(100)).await;

    // H1 on port 1 talks to H2, still unknown.
    switch.packet_in(1, eth_frame(H1, H2, 0x0806, &[0; 28])).await;
    let Body::PacketOut(flood) = switch.recv().await.into_body() else {
        panic!("expected packet out")
    };
    assert_eq!(flood.in_port, 1);
    assert_eq!(flood.actions, vec![Action::output(PortNo::FLOOD)]);
    assert!(!flood.data.is_empty());

    // H2 answers from port 2. H1 is known now.
    switch.packet_in(2, eth_frame(H2, H1, 0x0806, &[0; 28])).await;
    let Body::FlowMod(rule) = switch.recv().await.into_body() else { panic!("expected flow mod") };
    assert_eq!(rule.command, FlowModCommand::Add);
    assert_eq!(rule.priority, 1);
    assert_eq!(rule.idle_timeout, 30);
    assert_eq!(rule.fields.in_port, Some(2));
    assert_eq!(rule.actions(), &[Action::output(1)]);
    assert_eq!(rule.meter_id(), None);

    let Body::PacketOut(out) = switch.recv().await.into_body() else {
        panic!("expected packet out")
    };
    assert_eq!(out.actions, vec![Action::output(1)]);

    assert_eq!(controller.stats().packet_ins(), 2);
}

#[tokio::test]
async fn learned_tcp_flow_gets_class_meter() {
    let controller = controller(QosConfig::default()).await;
    let mut switch = FakeSwitch::connect(*controller.local_addr().unwrap(), 1).await;
    switch.drain(Duration::from_millis(200)).await;

    switch.packet_in(2, eth_frame(H2, H1, 0x0806, &[0; 28])).await;
    switch.recv().await;

    switch.packet_in(1, tcp_frame(H1, H2, 40000, 6001)).await;
    let Body::FlowMod(rule) = switch.recv().await.into_body() else { panic!("expected flow mod") };
    assert_eq!(rule.meter_id(), Some(6000));
    assert_eq!(rule.fields.eth_type, Some(0x0800));
    assert_eq!(rule.fields.ip_proto, Some(6));
    assert_eq!((rule.fields.tcp_src, rule.fields.tcp_dst), (Some(40000), Some(6001)));
    assert_eq!(rule.actions(), &[Action::output(2)]);
}

#[tokio::test]
async fn disconnect_purges_switch() {
    let controller = controller(QosConfig::default()).await;
    let mut switch = FakeSwitch::connect(*controller.local_addr().unwrap(), 7).await;
    switch.packet_in(3, eth_frame(H1, H2, 0x0806, &[0; 28])).await;

    let learning = controller.learning().clone();
    eventually(|| learning.table_len(DatapathId(7)) == 1).await;

    drop(switch);

    let registry = controller.registry().clone();
    eventually(|| registry.is_empty()).await;
    assert_eq!(learning.table_len(DatapathId(7)), 0);
    assert_eq!(controller.stats().active_switches(), 0);
}

#[tokio::test]
async fn many_switches() {
    let controller = controller(QosConfig::default()).await;
    let addr = *controller.local_addr().unwrap();

    let mut switches = Vec::new();
    for dpid in 1..=5 {
        switches.push(FakeSwitch::connect(addr, dpid).await);
    }

    let registry = controller.registry().clone();
    eventually(|| registry.len() == 5).await;

    let mut dpids: Vec<_> = registry.list().iter().map(|h| h.dpid()).collect();
    dpids.sort();
    assert_eq!(dpids, (1..=5).map(DatapathId).collect::<Vec<_>>());
}

#[tokio::test]
async fn largest_packet_in_keeps_switch_connected() {
    let controller = controller(QosConfig { enabled: false, ..Default::default() }).await;
    let mut switch = FakeSwitch::connect(*controller.local_addr().unwrap(), 3).await;
    switch.drain(Duration::from_millis(100)).await;

    // 42 bytes of header, fixed fields and in_port match around the frame.
    let frame = eth_frame(H1, H2, 0x0806, &vec![0; u16::MAX as usize - 42 - 14]);
    switch.packet_in(1, frame.clone()).await;

    let Body::PacketOut(flood) = switch.recv().await.into_body() else {
        panic!("expected packet out")
    };
    assert_eq!(flood.actions, vec![Action::output(PortNo::FLOOD)]);
    assert_eq!(flood.data, frame);

    switch.send(Message::new(9, Body::EchoRequest(Bytes::new()))).await;
    let reply = switch.recv_until(|b| matches!(b, Body::EchoReply(_))).await;
    assert_eq!(reply.xid(), 9);
    assert!(controller.registry().get(DatapathId(3)).is_ok());
    assert_eq!(controller.stats().failed_sends(), 0);
}

#[tokio::test]
async fn finished_sessions_free_switch_slots() {
    let options = ControllerOptions::default().max_switches(1);
    let controller = controller_with(options, QosConfig::default()).await;
    let addr = *controller.local_addr().unwrap();
    let registry = controller.registry().clone();

    let first = FakeSwitch::connect(addr, 1).await;
    eventually(|| registry.len() == 1).await;

    // Over the limit: closed without a hello.
    let mut rejected = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(TIMEOUT, rejected.read(&mut buf)).await.unwrap();
    assert_eq!(read.unwrap_or(0), 0);

    drop(first);
    eventually(|| registry.is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let _second = FakeSwitch::connect(addr, 2).await;
    eventually(|| registry.get(DatapathId(2)).is_ok()).await;
}
