//! Per client connection task
//!
//! A connection is read for its CONNECT, authenticated, then served by one `tokio::select!`
//! loop over the keepalive deadline, messages routed to this client and packets read from
//! the transport, so the packets of one client are handled strictly in order.

use std::collections::VecDeque;
use std::num::NonZeroU16;
use std::str::FromStr;
use std::sync::Arc;

use bitflags::bitflags;
use itertools::Itertools;
use tokio::sync::{mpsc, oneshot};

use mqttd_conf::OnQoS2Publish;

use crate::broker::Broker;
use crate::inflight::MomentStatus;
use crate::keepalive::KeepAlive;
use crate::packet::{Connect, ConnectAck, ConnectAckReason, Packet, SubscribeReturnCode};
use crate::session::Session;
use crate::sys;
use crate::topic::Topic;
use crate::transport::Transport;
use crate::types::{
    ClientId, ClientInfo, ClientInfoRef, ConnId, LastWill, Message, Publish, PublishAuth, QoS, Reason, Rx,
    TopicFilter,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u8 {
        const Kicked = 0b00000001;
        const DisconnectReceived = 0b00000010;
    }
}

/// Drive one client from its CONNECT packet until the connection is closed.
pub(crate) async fn serve<T: Transport>(broker: Broker, mut transport: T, conn_id: ConnId) {
    log::debug!("conn {} Connecting, remote_addr: {:?}", conn_id, transport.remote_addr());
    let connect = match read_connect(&broker, &mut transport).await {
        Some(connect) => connect,
        None => {
            let _ = transport.close().await;
            return;
        }
    };
    if let Some(conn) = handshake(broker, transport, *connect, conn_id).await {
        conn.run().await;
    }
}

async fn read_connect<T: Transport>(broker: &Broker, transport: &mut T) -> Option<Box<Connect>> {
    let connect_timeout = broker.settings.mqtt.connect_timeout;
    match tokio::time::timeout(connect_timeout, transport.recv()).await {
        Ok(Ok(Some(Packet::Connect(connect)))) => Some(connect),
        Ok(Ok(Some(p))) => {
            log::debug!("{:?} first packet is {}, not CONNECT", transport.remote_addr(), p.packet_type());
            None
        }
        Ok(Ok(None)) => None,
        Ok(Err(e)) => {
            log::debug!("{:?} read CONNECT error, {:?}", transport.remote_addr(), e);
            None
        }
        Err(_) => {
            log::info!("{:?} no CONNECT within {:?}", transport.remote_addr(), connect_timeout);
            None
        }
    }
}

async fn refuse<T: Transport>(mut transport: T, client_id: &ClientId, return_code: ConnectAckReason) {
    log::info!("{:?} connect refused, {}", client_id, return_code.reason());
    let ack = ConnectAck { return_code, session_present: false };
    if let Err(e) = transport.send(Packet::ConnectAck(ack)).await {
        log::debug!("{:?} send CONNACK error, {:?}", client_id, e);
    }
    let _ = transport.close().await;
}

async fn handshake<T: Transport>(
    broker: Broker,
    mut transport: T,
    connect: Connect,
    conn_id: ConnId,
) -> Option<Connection<T>> {
    let Connect { protocol, clean_session, keep_alive, last_will, mut client_id, username, password } = connect;

    if !protocol.is_supported() {
        log::info!("{:?} unsupported protocol level {}, closing", client_id, protocol.level());
        let _ = transport.close().await;
        return None;
    }

    if client_id.is_empty() {
        if !clean_session {
            refuse(transport, &client_id, ConnectAckReason::IdentifierRejected).await;
            return None;
        }
        client_id = ClientId::from(uuid::Uuid::new_v4().simple().to_string());
    } else if client_id.len() > broker.settings.mqtt.max_clientid_len {
        refuse(transport, &client_id, ConnectAckReason::IdentifierRejected).await;
        return None;
    }

    if broker.is_closed() {
        refuse(transport, &client_id, ConnectAckReason::ServiceUnavailable).await;
        return None;
    }
    if let Err(e) = broker.check_conn_limit() {
        log::warn!("{:?} {}", client_id, e);
        refuse(transport, &client_id, ConnectAckReason::ServiceUnavailable).await;
        return None;
    }

    let info = ClientInfo {
        client_id,
        username,
        remote_addr: transport.remote_addr(),
        protocol,
        clean_session,
        keep_alive,
        connected_at: mqttd_utils::timestamp_millis(),
    };

    log::debug!("{} Authenticating", info);
    match broker.hooks.authenticate(&info, info.username.as_ref(), password.as_ref()).await {
        Ok(true) => {}
        Ok(false) => {
            refuse(transport, &info.client_id, ConnectAckReason::NotAuthorized).await;
            return None;
        }
        Err(e) => {
            log::warn!("{} authenticate error, {:?}", info, e);
            refuse(transport, &info.client_id, ConnectAckReason::BadUserNameOrPassword).await;
            return None;
        }
    }

    let locker = broker.sessions.locker(&info.client_id);
    let guard = locker.lock().await;

    //take over a connection that still serves this client id
    if let Some(tx) = broker.sessions.online_tx(&info.client_id) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(Message::Kick(Reason::NewConnectionRequest, reply_tx)).is_ok() && reply_rx.await.is_err() {
            log::debug!("{} previous connection exited without reply", info);
        }
    }

    let max_inflight = broker.settings.mqtt.max_inflight_messages;
    let (session, session_present) =
        match broker.sessions.create_or_resume(&info.client_id, clean_session, max_inflight).await {
            Ok(res) => res,
            Err(e) => {
                log::warn!("{} create session error, {:?}", info, e);
                broker.hooks.client_error(&info, &e).await;
                refuse(transport, &info.client_id, ConnectAckReason::ServiceUnavailable).await;
                return None;
            }
        };

    let info = Arc::new(info);
    let (tx, rx) = mpsc::unbounded_channel();
    broker.sessions.register(info.clone(), conn_id, tx);
    broker.stats.connections.inc();
    drop(guard);

    let mut conn = Connection {
        broker,
        transport,
        info,
        session,
        rx,
        conn_id,
        last_will,
        pending: VecDeque::new(),
        flags: StateFlags::empty(),
        kick_replies: Vec::new(),
    };

    let ack = ConnectAck { return_code: ConnectAckReason::ConnectionAccepted, session_present };
    if let Err(reason) = conn.send(Packet::ConnectAck(ack)).await {
        conn.cleanup(reason).await;
        return None;
    }
    log::info!("{} connected, session_present: {}", conn.info, session_present);
    Some(conn)
}

struct Connection<T> {
    broker: Broker,
    transport: T,
    info: ClientInfoRef,
    session: Session,
    rx: Rx,
    conn_id: ConnId,
    last_will: Option<LastWill>,
    //QoS 1 messages waiting for in-flight credit
    pending: VecDeque<Publish>,
    flags: StateFlags,
    kick_replies: Vec<oneshot::Sender<()>>,
}

impl<T: Transport> Connection<T> {
    async fn run(mut self) {
        self.broker.hooks.client_connected(&self.info).await;
        sys::new_client(&self.broker, &self.info.client_id).await;

        let res = match self.resend_offline().await {
            Ok(()) => self.run_loop().await,
            Err(reason) => Err(reason),
        };
        let reason = match res {
            Ok(()) => Reason::RemoteClose,
            Err(reason) => reason,
        };
        self.cleanup(reason).await;
    }

    async fn run_loop(&mut self) -> std::result::Result<(), Reason> {
        let keep_alive = KeepAlive::new(self.info.keep_alive, self.broker.settings.mqtt.keepalive_backoff);
        log::debug!("{} keep_alive interval is {:?}", self.info, keep_alive.interval());
        let keep_alive_delay = keep_alive.sleep();
        tokio::pin!(keep_alive_delay);

        loop {
            tokio::select! {
                _ = &mut keep_alive_delay => {
                    return Err(Reason::KeepaliveTimeout);
                },

                msg = self.rx.recv() => {
                    match msg {
                        Some(Message::Forward(p)) => self.deliver(p).await?,
                        Some(Message::Kick(reason, reply)) => {
                            log::debug!("{} kicked, {}", self.info, reason);
                            self.flags.insert(StateFlags::Kicked);
                            self.kick_replies.push(reply);
                            return Err(reason);
                        }
                        None => return Err(Reason::ServerClosed),
                    }
                },

                pkt = self.transport.recv() => {
                    keep_alive_delay.as_mut().reset(keep_alive.deadline());
                    match pkt {
                        Ok(Some(pkt)) => self.process(pkt).await?,
                        Ok(None) => return Err(Reason::RemoteClose),
                        Err(e) => {
                            log::debug!("{} transport recv error, {:?}", self.info, e);
                            return Err(Reason::RemoteClose);
                        }
                    }
                }
            }
        }
    }

    async fn process(&mut self, pkt: Packet) -> std::result::Result<(), Reason> {
        log::debug!("{} recv {}", self.info, pkt.packet_type());
        match pkt {
            Packet::Publish(p) => self.on_publish(p).await,
            Packet::PublishAck { packet_id } => {
                if let Some(m) = self.session.acknowledge_inflight(packet_id.get()) {
                    self.broker.hooks.delivered(&self.info, &m.publish).await;
                } else {
                    log::debug!("{} PUBACK for unknown packet_id {}", self.info, packet_id);
                }
                self.flush_pending().await
            }
            Packet::PublishReceived { packet_id } => {
                self.session.inflight().update_status(packet_id.get(), MomentStatus::UnComplete);
                self.send(Packet::PublishRelease { packet_id }).await
            }
            Packet::PublishComplete { packet_id } => {
                self.session.acknowledge_inflight(packet_id.get());
                self.flush_pending().await
            }
            Packet::PublishRelease { packet_id } => self.send(Packet::PublishComplete { packet_id }).await,
            Packet::Subscribe { packet_id, topic_filters } => self.on_subscribe(packet_id, topic_filters).await,
            Packet::Unsubscribe { packet_id, topic_filters } => {
                self.on_unsubscribe(packet_id, topic_filters).await
            }
            Packet::PingRequest => {
                self.send(Packet::PingResponse).await?;
                self.broker.hooks.pingreq(&self.info).await;
                Ok(())
            }
            Packet::Disconnect => {
                self.flags.insert(StateFlags::DisconnectReceived);
                Err(Reason::DisconnectRequest)
            }
            Packet::Connect(_) => Err(Reason::ProtocolError("second CONNECT".into())),
            p => Err(Reason::ProtocolError(format!("unexpected {} from client", p.packet_type()).into())),
        }
    }

    async fn on_publish(&mut self, mut p: Publish) -> std::result::Result<(), Reason> {
        if let Err(e) = Topic::parse_name(&p.topic) {
            log::info!("{} publish to invalid topic, {:?}", self.info, e);
            return Err(Reason::ProtocolError("invalid topic name".into()));
        }

        let ack = match p.qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(packet_id(p.packet_id)?),
            QoS::ExactlyOnce => match self.broker.settings.mqtt.on_qos2_publish {
                OnQoS2Publish::Ignore => None,
                OnQoS2Publish::DropToQoS1 => {
                    p.qos = QoS::AtLeastOnce;
                    Some(packet_id(p.packet_id)?)
                }
                OnQoS2Publish::Disconnect => {
                    log::info!("{} QoS 2 publish not accepted, topic: {:?}", self.info, p.topic);
                    return Err(Reason::ProtocolError("QoS 2 publish".into()));
                }
            },
        };

        match self.broker.hooks.authorize_publish(&self.info, &p).await {
            PublishAuth::Allow(payload) => {
                if let Some(payload) = payload {
                    p.payload = payload;
                }
                if let Err(e) = self.broker.dispatch(p, Some(self.info.as_ref())).await {
                    log::warn!("{} publish dropped, {:?}", self.info, e);
                    self.broker.hooks.client_error(&self.info, &e).await;
                }
            }
            PublishAuth::Ignore => {
                log::debug!("{} publish ignored, topic: {:?}", self.info, p.topic);
            }
            PublishAuth::Reject => {
                log::info!("{} publish refused, topic: {:?}", self.info, p.topic);
                return Err(Reason::PublishRefused);
            }
        }

        if let Some(packet_id) = ack {
            self.send(Packet::PublishAck { packet_id }).await?;
        }
        Ok(())
    }

    async fn on_subscribe(
        &mut self,
        packet_id: NonZeroU16,
        topic_filters: Vec<(TopicFilter, QoS)>,
    ) -> std::result::Result<(), Reason> {
        let mut status = Vec::with_capacity(topic_filters.len());
        let mut granted = Vec::new();
        for (topic_filter, qos) in topic_filters {
            let code = self.subscribe(&topic_filter, qos).await;
            if let SubscribeReturnCode::Success(qos) = code {
                granted.push((topic_filter, qos));
            }
            status.push(code);
        }
        self.send(Packet::SubscribeAck { packet_id, status }).await?;

        for (topic_filter, qos) in granted {
            self.broker.hooks.subscribed(&self.info, &topic_filter, qos).await;
            sys::new_subscribe(&self.broker, &self.info.client_id, &topic_filter).await;

            let retaineds = match self.broker.retain.matches(&topic_filter) {
                Ok(retaineds) => retaineds,
                Err(e) => {
                    log::warn!("{} retained lookup error, {:?}", self.info, e);
                    continue;
                }
            };
            for mut p in retaineds {
                p.qos = p.qos.less_value(qos);
                p.retain = true;
                p.dup = false;
                p.packet_id = None;
                self.deliver(p).await?;
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &TopicFilter, qos: QoS) -> SubscribeReturnCode {
        if let Err(e) = Topic::from_str(topic_filter) {
            log::debug!("{} invalid topic filter {:?}, {:?}", self.info, topic_filter, e);
            return SubscribeReturnCode::Failure;
        }
        if !self.broker.hooks.authorize_subscribe(&self.info, topic_filter).await {
            log::debug!("{} subscribe refused, topic_filter: {:?}", self.info, topic_filter);
            return SubscribeReturnCode::Failure;
        }
        let qos = qos.less_value(QoS::AtLeastOnce);
        match self.broker.sessions.persist_subscription(&self.info.client_id, topic_filter, qos).await {
            Ok(_) => SubscribeReturnCode::Success(qos),
            Err(e) => {
                log::warn!("{} subscribe {:?} error, {:?}", self.info, topic_filter, e);
                self.broker.hooks.client_error(&self.info, &e).await;
                SubscribeReturnCode::Failure
            }
        }
    }

    async fn on_unsubscribe(
        &mut self,
        packet_id: NonZeroU16,
        topic_filters: Vec<TopicFilter>,
    ) -> std::result::Result<(), Reason> {
        for topic_filter in topic_filters.iter().unique() {
            match self.broker.sessions.remove_subscription(&self.info.client_id, topic_filter).await {
                Ok(true) => {
                    self.broker.hooks.unsubscribed(&self.info, topic_filter).await;
                    sys::new_unsubscribe(&self.broker, &self.info.client_id, topic_filter).await;
                }
                Ok(false) => {}
                Err(e) => log::debug!("{} unsubscribe {:?} error, {:?}", self.info, topic_filter, e),
            }
        }
        self.send(Packet::UnsubscribeAck { packet_id }).await
    }

    /// Send a routed message to the client, QoS 1 messages take an in-flight slot.
    ///
    /// Messages queued behind a backlog are capped at the in-flight window, a client that
    /// falls further behind is disconnected and the queue goes back to its session.
    async fn deliver(&mut self, mut p: Publish) -> std::result::Result<(), Reason> {
        if p.qos == QoS::AtMostOnce {
            p.packet_id = None;
            return self.send(Packet::Publish(p)).await;
        }
        if !self.pending.is_empty() {
            self.pending.push_back(p);
            if self.pending.len() > self.broker.settings.mqtt.max_inflight_messages {
                log::warn!("{} pending queue full, {} messages", self.info, self.pending.len());
                return Err(Reason::InflightWindowFull);
            }
            return Ok(());
        }
        let p = self.track(p)?;
        self.send(Packet::Publish(p)).await
    }

    fn track(&mut self, p: Publish) -> std::result::Result<Publish, Reason> {
        self.session.track_inflight(p).map_err(|e| {
            log::warn!("{} in-flight window full, {:?}", self.info, e);
            Reason::InflightWindowFull
        })
    }

    async fn flush_pending(&mut self) -> std::result::Result<(), Reason> {
        while self.session.inflight().has_credit() {
            match self.pending.pop_front() {
                Some(p) => {
                    let p = self.track(p)?;
                    self.send(Packet::Publish(p)).await?;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Queue what was stored while the client was away, ahead of new traffic.
    async fn resend_offline(&mut self) -> std::result::Result<(), Reason> {
        let packets = match self.broker.sessions.drain_offline(&self.info.client_id).await {
            Ok(packets) => packets,
            Err(e) => {
                log::warn!("{} load offline messages error, {:?}", self.info, e);
                self.broker.hooks.client_error(&self.info, &e).await;
                Vec::new()
            }
        };
        if packets.is_empty() {
            return Ok(());
        }
        log::debug!("{} resend {} offline messages", self.info, packets.len());
        for p in packets {
            if p.qos == QoS::AtMostOnce {
                self.send(Packet::Publish(p)).await?;
            } else {
                self.pending.push_back(p);
            }
        }
        self.flush_pending().await
    }

    async fn send(&mut self, packet: Packet) -> std::result::Result<(), Reason> {
        self.transport.send(packet).await.map_err(|e| {
            log::debug!("{} transport send error, {:?}", self.info, e);
            Reason::RemoteClose
        })
    }

    async fn cleanup(mut self, reason: Reason) {
        log::info!("{} Disconnecting, reason: {}, flags: {:?}", self.info, reason, self.flags);
        let broker = self.broker.clone();
        let client_id = self.info.client_id.clone();
        let clean_session = self.session.clean_session;

        if !clean_session {
            let unacked = self.session.inflight().to_inflight_messages().into_iter().map(|m| {
                let mut p = m.publish;
                p.dup = true;
                p
            });
            let unsent = unacked.chain(self.pending.drain(..)).collect::<Vec<_>>();
            for p in unsent {
                if let Err(e) = broker.sessions.enqueue_offline(&client_id, p).await {
                    log::warn!("{} store offline message error, {:?}", self.info, e);
                }
            }
        }

        if let Err(e) = broker.sessions.unregister(&client_id, self.conn_id).await {
            log::warn!("{} save session error, {:?}", self.info, e);
            broker.hooks.client_error(&self.info, &e).await;
        }

        self.rx.close();
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                Message::Forward(p) if !clean_session => {
                    if let Err(e) = broker.sessions.enqueue_offline(&client_id, p).await {
                        log::warn!("{} store offline message error, {:?}", self.info, e);
                    }
                }
                Message::Forward(_) => {}
                Message::Kick(_, reply) => self.kick_replies.push(reply),
            }
        }

        broker.stats.connections.dec();
        if let Err(e) = self.transport.close().await {
            log::debug!("{} transport close error, {:?}", self.info, e);
        }

        if !self.flags.contains(StateFlags::DisconnectReceived) {
            if let Some(last_will) = self.last_will.take() {
                publish_will(&broker, &self.info, last_will).await;
            }
        }

        broker.hooks.client_disconnected(&self.info, &reason).await;
        sys::client_disconnect(&broker, &client_id).await;

        log::debug!("{} Closed", self.info);
        for reply in self.kick_replies.drain(..) {
            let _ = reply.send(());
        }
    }
}

async fn publish_will(broker: &Broker, info: &ClientInfo, last_will: LastWill) {
    let mut p = Publish::from(&last_will);
    if let Err(e) = Topic::parse_name(&p.topic) {
        log::info!("{} invalid will topic, {:?}", info, e);
        return;
    }
    match broker.hooks.authorize_publish(info, &p).await {
        PublishAuth::Allow(payload) => {
            if let Some(payload) = payload {
                p.payload = payload;
            }
            log::debug!("{} publish will, topic: {:?}", info, p.topic);
            if let Err(e) = broker.dispatch(p, Some(info)).await {
                log::warn!("{} publish will error, {:?}", info, e);
            }
        }
        PublishAuth::Ignore | PublishAuth::Reject => {
            log::debug!("{} will message dropped by authorizer", info);
        }
    }
}

#[inline]
fn packet_id(packet_id: Option<NonZeroU16>) -> std::result::Result<NonZeroU16, Reason> {
    packet_id.ok_or_else(|| Reason::ProtocolError("packet_id is missing".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    fn is_send<F: std::future::Future + Send>(_: &F) {}

    #[tokio::test]
    async fn connection_task_is_send() {
        let broker = Broker::builder().build().await.unwrap();
        let (transport, _peer) = ChannelTransport::pair();
        let task = serve(broker, transport, 1);
        is_send(&task);
    }
}
