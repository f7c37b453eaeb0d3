//! `$SYS/{broker_id}/...` notifications
//!
//! Client lifecycle and subscription changes are published as they happen, statistics are
//! published by a background task every `mqtt.stats_interval` while `mqtt.stats` is on.

use std::sync::Weak;

use bytes::Bytes;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerInner};
use crate::types::{ClientId, Publish, QoS, TopicFilter, TopicName};

#[inline]
pub fn topic(broker_id: &str, path: &str) -> TopicName {
    TopicName::from(format!("$SYS/{}/{}", broker_id, path))
}

#[inline]
async fn sys_publish<P: Into<Bytes>>(broker: &Broker, path: &str, payload: P) {
    let p = Publish::new(topic(&broker.id, path), payload.into(), QoS::AtMostOnce);
    if let Err(e) = broker.dispatch(p, None).await {
        log::warn!("$SYS/{}/{} publish error, {:?}", broker.id, path, e);
    }
}

//$SYS/{id}/new/clients
pub(crate) async fn new_client(broker: &Broker, client_id: &ClientId) {
    if broker.settings.mqtt.publish_new_client {
        sys_publish(broker, "new/clients", client_id.as_bytes().clone()).await;
    }
}

//$SYS/{id}/disconnect/clients
pub(crate) async fn client_disconnect(broker: &Broker, client_id: &ClientId) {
    if broker.settings.mqtt.publish_client_disconnect {
        sys_publish(broker, "disconnect/clients", client_id.as_bytes().clone()).await;
    }
}

//$SYS/{id}/new/subscribes
pub(crate) async fn new_subscribe(broker: &Broker, client_id: &ClientId, topic_filter: &TopicFilter) {
    if broker.settings.mqtt.publish_subscriptions {
        let body = json!({"clientId": client_id, "topic": topic_filter});
        sys_publish(broker, "new/subscribes", body.to_string()).await;
    }
}

//$SYS/{id}/new/unsubscribes
pub(crate) async fn new_unsubscribe(broker: &Broker, client_id: &ClientId, topic_filter: &TopicFilter) {
    if broker.settings.mqtt.publish_subscriptions {
        let body = json!({"clientId": client_id, "topic": topic_filter});
        sys_publish(broker, "new/unsubscribes", body.to_string()).await;
    }
}

/// Publish the broker counters once.
pub(crate) async fn send_stats(broker: &Broker) {
    let stats = &broker.stats;
    sys_publish(broker, "clients/connected", stats.connections.count().to_string()).await;
    sys_publish(broker, "publish/received", stats.publishes.count().to_string()).await;
    sys_publish(broker, "uptime", stats.uptime().to_string()).await;
}

/// Periodic stats task, ends when the broker is dropped or closed.
pub(crate) fn start_stats(inner: Weak<BrokerInner>) -> Option<JoinHandle<()>> {
    let interval = {
        let inner = inner.upgrade()?;
        if !inner.settings.mqtt.stats {
            return None;
        }
        inner.settings.mqtt.stats_interval
    };
    log::info!("$SYS stats publishing every {:?}", interval);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            let broker = match inner.upgrade() {
                Some(inner) => Broker::from(inner),
                None => break,
            };
            if broker.is_closed() {
                break;
            }
            send_stats(&broker).await;
        }
    }))
}
