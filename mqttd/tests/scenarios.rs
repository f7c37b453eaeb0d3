mod common;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;

use mqttd::hook::Authenticator;
use mqttd::packet::{Connect, ConnectAckReason, Packet, SubscribeReturnCode};
use mqttd::types::{Password, UserName};
use mqttd::{Broker, ClientInfo, QoS, Result};

use common::*;

#[tokio::test]
async fn multi_level_wildcard() {
    let broker = Broker::builder().build().await.unwrap();
    let mut a = connect(&broker, "a").await;
    let mut b = connect(&broker, "b").await;

    let status = subscribe(&mut a, 1, &[("hello/#", QoS::AtMostOnce)]).await;
    assert_eq!(status, vec![SubscribeReturnCode::Success(QoS::AtMostOnce)]);

    b.send(publish("hello/world", "hi", QoS::AtMostOnce, 0)).unwrap();
    let p = recv_publish(&mut a).await;
    assert_eq!(p.topic, "hello/world");
    assert_eq!(p.payload, Bytes::from("hi"));
    assert_eq!(p.qos, QoS::AtMostOnce);
    assert!(!p.retain);

    b.send(publish("hello", "parent", QoS::AtMostOnce, 0)).unwrap();
    assert_eq!(recv_publish(&mut a).await.topic, "hello");

    b.send(publish("hellox/world", "no", QoS::AtMostOnce, 0)).unwrap();
    sync(&mut b).await;
    silent(&mut a).await;
}

#[tokio::test]
async fn single_level_wildcard_qos1() {
    let recorder = Recorder::new();
    let broker = Broker::builder().listener(recorder.clone()).build().await.unwrap();
    let mut a = connect(&broker, "a").await;
    let mut b = connect(&broker, "b").await;

    let status = subscribe(&mut a, 1, &[("foo/+/baz", QoS::AtLeastOnce)]).await;
    assert_eq!(status, vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)]);

    b.send(publish("foo/bar/baz", "m1", QoS::AtLeastOnce, 7)).unwrap();
    assert_eq!(recv(&mut b).await, Packet::PublishAck { packet_id: pid(7) });

    let p = recv_publish(&mut a).await;
    assert_eq!(p.topic, "foo/bar/baz");
    assert_eq!(p.qos, QoS::AtLeastOnce);
    let packet_id = p.packet_id.unwrap();
    a.send(Packet::PublishAck { packet_id }).unwrap();
    sync(&mut a).await;
    assert!(recorder.has("delivered:a:foo/bar/baz"));

    b.send(publish("foo/bar/bar/baz", "m2", QoS::AtLeastOnce, 8)).unwrap();
    assert_eq!(recv(&mut b).await, Packet::PublishAck { packet_id: pid(8) });
    silent(&mut a).await;
    assert_eq!(recorder.count("delivered:"), 1);
}

#[tokio::test]
async fn overlapping_subscriptions_deliver_once() {
    let broker = Broker::builder().build().await.unwrap();
    let mut a = connect(&broker, "a").await;
    let mut b = connect(&broker, "b").await;

    let status = subscribe(&mut a, 1, &[("a/+", QoS::AtMostOnce), ("a/b", QoS::AtLeastOnce)]).await;
    assert_eq!(
        status,
        vec![SubscribeReturnCode::Success(QoS::AtMostOnce), SubscribeReturnCode::Success(QoS::AtLeastOnce)]
    );

    b.send(publish("a/b", "x", QoS::AtLeastOnce, 1)).unwrap();
    sync(&mut b).await;
    let p = recv_publish(&mut a).await;
    assert_eq!(p.qos, QoS::AtLeastOnce);
    silent(&mut a).await;

    b.send(publish("a/c", "y", QoS::AtLeastOnce, 2)).unwrap();
    let p = recv_publish(&mut a).await;
    assert_eq!(p.topic, "a/c");
    assert_eq!(p.qos, QoS::AtMostOnce);
    assert_eq!(p.packet_id, None);
}

struct Credentials;

#[async_trait]
impl Authenticator for Credentials {
    async fn authenticate(
        &self,
        _client: &ClientInfo,
        username: Option<&UserName>,
        password: Option<&Password>,
    ) -> Result<bool> {
        match (username.map(|u| &**u), password) {
            (Some("admin"), Some(p)) => Ok(*p == Bytes::from_static(b"secret")),
            (Some("broken"), _) => Err(anyhow!("auth backend unreachable")),
            _ => Ok(false),
        }
    }
}

#[tokio::test]
async fn authentication() {
    let recorder = Recorder::new();
    let broker = Broker::builder().authenticator(Credentials).listener(recorder.clone()).build().await.unwrap();

    let (mut peer, ack) = connect_with(&broker, Connect::new("c1").credentials("admin", "wrong")).await;
    assert_eq!(ack.return_code, ConnectAckReason::NotAuthorized);
    assert!(!ack.session_present);
    assert!(closed(&mut peer).await);

    let (mut peer, ack) = connect_with(&broker, Connect::new("c2").credentials("broken", "x")).await;
    assert_eq!(ack.return_code, ConnectAckReason::BadUserNameOrPassword);
    assert!(closed(&mut peer).await);

    let (_peer, ack) = connect_with(&broker, Connect::new("c3").credentials("admin", "secret")).await;
    assert_eq!(ack.return_code, ConnectAckReason::ConnectionAccepted);

    assert_eq!(recorder.count("connected:"), 1);
    assert!(recorder.has("connected:c3"));
    assert_eq!(broker.stats.connections.count(), 1);
}

#[tokio::test]
async fn retained_round_trip_and_clear() {
    let broker = Broker::builder().build().await.unwrap();
    let mut b = connect(&broker, "b").await;

    b.send(publish("r/1", "kept", QoS::AtLeastOnce, 1).retain(true)).unwrap();
    assert_eq!(recv(&mut b).await, Packet::PublishAck { packet_id: pid(1) });

    let mut a = connect(&broker, "a").await;
    let status = subscribe(&mut a, 1, &[("r/#", QoS::AtLeastOnce)]).await;
    assert_eq!(status, vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)]);
    let p = recv_publish(&mut a).await;
    assert_eq!(p.topic, "r/1");
    assert_eq!(p.payload, Bytes::from("kept"));
    assert!(p.retain);
    assert_eq!(p.qos, QoS::AtLeastOnce);

    let mut c = connect(&broker, "c").await;
    subscribe(&mut c, 1, &[("r/1", QoS::AtMostOnce)]).await;
    let p = recv_publish(&mut c).await;
    assert!(p.retain);
    assert_eq!(p.qos, QoS::AtMostOnce);

    b.send(publish("r/1", "", QoS::AtMostOnce, 0).retain(true)).unwrap();
    sync(&mut b).await;
    let p = recv_publish(&mut a).await;
    assert!(p.payload.is_empty());
    assert!(!p.retain);
    assert_eq!(broker.retain.count(), 0);

    let mut d = connect(&broker, "d").await;
    subscribe(&mut d, 1, &[("r/#", QoS::AtLeastOnce)]).await;
    silent(&mut d).await;
}

#[tokio::test]
async fn session_resume_and_offline_order() {
    let broker = Broker::builder().build().await.unwrap();

    let (mut c, ack) = connect_with(&broker, Connect::new("c").clean_session(false)).await;
    assert!(!ack.session_present);
    subscribe(&mut c, 1, &[("s/t", QoS::AtLeastOnce)]).await;
    c.send(Packet::Disconnect).unwrap();
    assert!(closed(&mut c).await);

    for payload in ["1", "2", "3"] {
        broker.publish(mqttd::Publish::new("s/t", payload, QoS::AtLeastOnce)).await.unwrap();
    }
    broker.publish(mqttd::Publish::new("s/t", "qos0", QoS::AtMostOnce)).await.unwrap();

    let (mut c, ack) = connect_with(&broker, Connect::new("c").clean_session(false)).await;
    assert!(ack.session_present);
    for expected in ["1", "2", "3"] {
        let p = recv_publish(&mut c).await;
        assert_eq!(p.payload, Bytes::from(expected));
        assert_eq!(p.qos, QoS::AtLeastOnce);
        c.send(Packet::PublishAck { packet_id: p.packet_id.unwrap() }).unwrap();
    }
    sync(&mut c).await;

    broker.publish(mqttd::Publish::new("s/t", "live", QoS::AtLeastOnce)).await.unwrap();
    assert_eq!(recv_publish(&mut c).await.payload, Bytes::from("live"));
    c.send(Packet::Disconnect).unwrap();
    assert!(closed(&mut c).await);

    let (mut c, ack) = connect_with(&broker, Connect::new("c")).await;
    assert!(!ack.session_present);
    broker.publish(mqttd::Publish::new("s/t", "gone", QoS::AtLeastOnce)).await.unwrap();
    silent(&mut c).await;
    c.send(Packet::Disconnect).unwrap();
    assert!(closed(&mut c).await);

    let (_c, ack) = connect_with(&broker, Connect::new("c").clean_session(false)).await;
    assert!(!ack.session_present);
}

#[tokio::test]
async fn unacknowledged_messages_are_redelivered() {
    let broker = Broker::builder().build().await.unwrap();
    let (mut c, _) = connect_with(&broker, Connect::new("c").clean_session(false)).await;
    subscribe(&mut c, 1, &[("u", QoS::AtLeastOnce)]).await;

    broker.publish(mqttd::Publish::new("u", "first", QoS::AtLeastOnce)).await.unwrap();
    let p = recv_publish(&mut c).await;
    assert!(!p.dup);
    c.close();
    assert!(closed(&mut c).await);

    broker.publish(mqttd::Publish::new("u", "second", QoS::AtLeastOnce)).await.unwrap();

    let (mut c, ack) = connect_with(&broker, Connect::new("c").clean_session(false)).await;
    assert!(ack.session_present);
    let p = recv_publish(&mut c).await;
    assert_eq!(p.payload, Bytes::from("first"));
    assert!(p.dup);
    let p = recv_publish(&mut c).await;
    assert_eq!(p.payload, Bytes::from("second"));
    assert!(!p.dup);
}

#[tokio::test]
async fn duplicate_client_id_kicks_first_connection() {
    let recorder = Recorder::new();
    let broker = Broker::builder().listener(recorder.clone()).build().await.unwrap();

    let mut first = connect(&broker, "dup").await;
    let mut second = connect(&broker, "dup").await;
    assert!(closed(&mut first).await);
    assert!(recorder.has("disconnected:dup:new connection request"));
    eventually(|| recorder.count("connected:dup") == 2).await;

    sync(&mut second).await;
    assert_eq!(broker.stats.connections.count(), 1);
}

#[tokio::test]
async fn inflight_window_overflow_disconnects() {
    let recorder = Recorder::new();
    let mut inner = mqttd_conf::Inner::default();
    inner.mqtt.max_inflight_messages = 2;
    let broker = Broker::builder()
        .settings(mqttd::Settings::from(inner))
        .listener(recorder.clone())
        .build()
        .await
        .unwrap();

    let mut c = connect(&broker, "slow").await;
    subscribe(&mut c, 1, &[("f", QoS::AtLeastOnce)]).await;
    for payload in ["1", "2", "3"] {
        broker.publish(mqttd::Publish::new("f", payload, QoS::AtLeastOnce)).await.unwrap();
    }

    assert_eq!(recv_publish(&mut c).await.payload, Bytes::from("1"));
    assert_eq!(recv_publish(&mut c).await.payload, Bytes::from("2"));
    assert!(closed(&mut c).await);
    eventually(|| recorder.has("disconnected:slow:inflight window full")).await;
}

#[tokio::test]
async fn offline_backlog_waits_for_window_credit() {
    let mut inner = mqttd_conf::Inner::default();
    inner.mqtt.max_inflight_messages = 1;
    let broker = Broker::builder().settings(mqttd::Settings::from(inner)).build().await.unwrap();

    let (mut c, _) = connect_with(&broker, Connect::new("c").clean_session(false)).await;
    subscribe(&mut c, 1, &[("f", QoS::AtLeastOnce)]).await;
    c.send(Packet::Disconnect).unwrap();
    assert!(closed(&mut c).await);
    for payload in ["1", "2", "3"] {
        broker.publish(mqttd::Publish::new("f", payload, QoS::AtLeastOnce)).await.unwrap();
    }

    let (mut c, ack) = connect_with(&broker, Connect::new("c").clean_session(false)).await;
    assert!(ack.session_present);
    for payload in ["1", "2", "3"] {
        let p = recv_publish(&mut c).await;
        assert_eq!(p.payload, Bytes::from(payload));
        silent(&mut c).await;
        c.send(Packet::PublishAck { packet_id: p.packet_id.unwrap() }).unwrap();
    }
    sync(&mut c).await;
    assert_eq!(broker.stats.connections.count(), 1);
}

#[tokio::test]
async fn live_traffic_behind_a_full_backlog_disconnects() {
    let recorder = Recorder::new();
    let mut inner = mqttd_conf::Inner::default();
    inner.mqtt.max_inflight_messages = 1;
    let broker = Broker::builder()
        .settings(mqttd::Settings::from(inner))
        .listener(recorder.clone())
        .build()
        .await
        .unwrap();

    let (mut c, _) = connect_with(&broker, Connect::new("lag").clean_session(false)).await;
    subscribe(&mut c, 1, &[("f", QoS::AtLeastOnce)]).await;
    c.send(Packet::Disconnect).unwrap();
    assert!(closed(&mut c).await);
    for payload in ["1", "2"] {
        broker.publish(mqttd::Publish::new("f", payload, QoS::AtLeastOnce)).await.unwrap();
    }

    let (mut c, ack) = connect_with(&broker, Connect::new("lag").clean_session(false)).await;
    assert!(ack.session_present);
    assert_eq!(recv_publish(&mut c).await.payload, Bytes::from("1"));
    silent(&mut c).await;

    //"2" still waits for credit, one more message is past the window
    broker.publish(mqttd::Publish::new("f", "3", QoS::AtLeastOnce)).await.unwrap();
    assert!(closed(&mut c).await);
    eventually(|| recorder.has("disconnected:lag:inflight window full")).await;

    let (mut c, ack) = connect_with(&broker, Connect::new("lag").clean_session(false)).await;
    assert!(ack.session_present);
    let p = recv_publish(&mut c).await;
    assert_eq!(p.payload, Bytes::from("1"));
    assert!(p.dup);
    c.send(Packet::PublishAck { packet_id: p.packet_id.unwrap() }).unwrap();
    for payload in ["2", "3"] {
        let p = recv_publish(&mut c).await;
        assert_eq!(p.payload, Bytes::from(payload));
        c.send(Packet::PublishAck { packet_id: p.packet_id.unwrap() }).unwrap();
    }
    sync(&mut c).await;
}
