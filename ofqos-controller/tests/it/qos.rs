use std::{sync::Arc, time::Duration};

use axum::{body::Body as HttpBody, http::Request};
use ofqos_controller::{
    api::{self, ApiVariant},
    policy::{PolicyUpdate, Protocol, Selector},
    QosConfig, UsageEvent, UsageMonitor, UsageSampler,
};
use ofqos_wire::{
    Body, MeterBand, MeterModCommand, MeterStats, Message, MultipartReply, MultipartRequest,
    PortNo, Stats, OFPM_ALL,
};
use tower::ServiceExt;

use crate::helpers::{controller, eventually, FakeSwitch};

#[tokio::test]
async fn api_update_reaches_connected_switch() {
    let controller = controller(QosConfig::default()).await;
    let mut switch = FakeSwitch::connect(*controller.local_addr().unwrap(), 1).await;
    switch.drain(Duration::from_millis(200)).await;

    let app = api::router(controller.policy().clone(), ApiVariant::TwoPort);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/qos/update")
                .body(HttpBody::from(r#"{"bw": 800, "port1": 3, "port2": 4}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let Body::MeterMod(meter) = switch.recv().await.into_body() else {
        panic!("expected meter mod")
    };
    assert_eq!(meter.command, MeterModCommand::Add);
    assert_eq!(meter.meter_id, 1);
    assert_eq!(meter.bands, vec![MeterBand::Drop { rate: 800, burst_size: 80 }]);

    for port in [3, 4] {
        let Body::FlowMod(rule) = switch.recv().await.into_body() else {
            panic!("expected flow mod")
        };
        assert_eq!(rule.priority, 10);
        assert_eq!((rule.idle_timeout, rule.hard_timeout), (10, 10));
        assert_eq!(rule.fields.in_port, Some(port));
        assert_eq!(rule.fields.ip_proto, Some(17));
        assert_eq!(rule.meter_id(), Some(1));
        assert_eq!(rule.actions(), &[ofqos_wire::Action::output(PortNo::NORMAL)]);
    }

    // Same selector, new budget: the meter is modified, never re-added.
    controller
        .policy()
        .update_policy(PolicyUpdate::new(400, Selector::port_list(Protocol::Udp, [4, 3])))
        .unwrap();
    let Body::MeterMod(meter) = switch.recv().await.into_body() else {
        panic!("expected meter mod")
    };
    assert_eq!(meter.command, MeterModCommand::Modify);
    assert_eq!(meter.meter_id, 1);
    assert_eq!(controller.policy().snapshot().len(), 1);
}

#[tokio::test]
async fn late_switch_gets_existing_policies() {
    let controller = controller(QosConfig::default()).await;
    controller
        .policy()
        .update_policy(PolicyUpdate::new(500, Selector::port_list(Protocol::Udp, [5001, 5002])))
        .unwrap();

    let mut switch = FakeSwitch::connect(*controller.local_addr().unwrap(), 1).await;
    let sent = switch.drain(Duration::from_millis(200)).await;

    assert!(sent
        .iter()
        .any(|b| matches!(b, Body::MeterMod(m) if m.meter_id == 1 && m.bands[0].rate() == 500)));
    let rules =
        sent.iter().filter(|b| matches!(b, Body::FlowMod(f) if f.meter_id() == Some(1))).count();
    assert_eq!(rules, 2);
}

#[tokio::test]
async fn meter_stats_drive_usage_alerts() {
    let controller = controller(QosConfig::default()).await;
    let mut switch = FakeSwitch::connect(*controller.local_addr().unwrap(), 1).await;
    switch.drain(Duration::from_millis(200)).await;

    controller
        .policy()
        .update_policy(PolicyUpdate::new(100, Selector::port_list(Protocol::Udp, [1, 2])))
        .unwrap();
    switch.drain(Duration::from_millis(100)).await;

    let sampler = controller.meter_stats().clone();
    let monitor = UsageMonitor::new(Arc::clone(controller.policy()), sampler.clone());

    // Two replies 10s apart, 250_000 bytes through meter 1: 200 kbit/s.
    for (bytes, secs) in [(0, 1), (250_000, 11)] {
        sampler.on_tick();
        let request = switch.recv().await;
        assert_eq!(
            request.body(),
            &Body::MultipartRequest(MultipartRequest::MeterStats { meter_id: OFPM_ALL })
        );

        let reply = MultipartReply {
            more: false,
            stats: Stats::Meter(vec![MeterStats {
                meter_id: 1,
                flow_count: 2,
                byte_in_count: bytes,
                duration_sec: secs,
                ..Default::default()
            }]),
        };
        switch.send(Message::new(request.xid(), Body::MultipartReply(reply))).await;
    }

    eventually(|| sampler.rate(1).is_some()).await;

    let events = monitor.run_once();
    assert_eq!(events.len(), 1);
    let UsageEvent::Exceeded { budget_kbps, usage_kbps, overage_kbps, .. } = &events[0] else {
        panic!("expected an alert, got {:?}", events[0])
    };
    assert_eq!((*budget_kbps, *usage_kbps, *overage_kbps), (100, 200, 100));
}
