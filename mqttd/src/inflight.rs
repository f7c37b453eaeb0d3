use std::collections::VecDeque;
use std::num::NonZeroU16;

use crate::types::{PacketId, Publish, TimestampMillis};
use crate::{MqttError, Result};

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum MomentStatus {
    UnAck,
    UnReceived,
    UnComplete,
}

#[derive(Debug, Clone)]
pub struct OutInflightMessage {
    pub publish: Publish,
    pub status: MomentStatus,
    pub update_time: TimestampMillis,
}

impl OutInflightMessage {
    #[inline]
    pub fn new(status: MomentStatus, publish: Publish) -> Self {
        Self { publish, status, update_time: mqttd_utils::timestamp_millis() }
    }

    #[inline]
    fn update_status(&mut self, status: MomentStatus) {
        self.update_time = mqttd_utils::timestamp_millis();
        self.status = status;
    }
}

/// Outbound QoS 1 messages waiting for their acknowledgement, in send order.
///
/// Owned by a single connection task.
pub struct OutInflight {
    cap: usize,
    next: u16,
    queues: VecDeque<(PacketId, OutInflightMessage)>,
}

impl OutInflight {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { cap, next: 1, queues: VecDeque::new() }
    }

    #[inline]
    pub fn get(&self, packet_id: PacketId) -> Option<&OutInflightMessage> {
        self.queues.iter().find(|(id, _)| *id == packet_id).map(|(_, m)| m)
    }

    #[inline]
    pub fn front(&self) -> Option<(&PacketId, &OutInflightMessage)> {
        self.queues.front().map(|(id, m)| (id, m))
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<OutInflightMessage> {
        self.queues.pop_front().map(|(_, m)| m)
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.queues.len() < self.cap
    }

    /// Assign a packet id to `publish` and keep it until acknowledged.
    ///
    /// Fails without side effects when the window is full.
    #[inline]
    pub fn track(&mut self, mut publish: Publish) -> Result<Publish> {
        if !self.has_credit() {
            return Err(MqttError::InflightWindowFull(self.cap).into());
        }
        let packet_id = self.next_id()?;
        publish.packet_id = NonZeroU16::new(packet_id);
        self.queues.push_back((packet_id, OutInflightMessage::new(MomentStatus::UnAck, publish.clone())));
        Ok(publish)
    }

    /// Forget the message acknowledged by `packet_id`.
    #[inline]
    pub fn acknowledge(&mut self, packet_id: PacketId) -> Option<OutInflightMessage> {
        //acks mostly arrive in send order
        if matches!(self.queues.front(), Some((id, _)) if *id == packet_id) {
            return self.pop_front();
        }
        let pos = self.queues.iter().position(|(id, _)| *id == packet_id)?;
        self.queues.remove(pos).map(|(_, m)| m)
    }

    #[inline]
    pub fn update_status(&mut self, packet_id: PacketId, s: MomentStatus) {
        if let Some((_, m)) = self.queues.iter_mut().find(|(id, _)| *id == packet_id) {
            m.update_status(s);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    #[inline]
    pub fn exist(&self, packet_id: PacketId) -> bool {
        self.queues.iter().any(|(id, _)| *id == packet_id)
    }

    #[inline]
    pub fn next_id(&mut self) -> Result<PacketId> {
        for _ in 0..u16::MAX {
            let packet_id = self.next;
            self.next = self.next.wrapping_add(1);
            if packet_id == 0 {
                continue;
            }
            if !self.exist(packet_id) {
                return Ok(packet_id);
            }
        }
        Err(MqttError::PacketIdExhausted.into())
    }

    /// Drain every unacknowledged message, oldest first.
    #[inline]
    pub fn to_inflight_messages(&mut self) -> Vec<OutInflightMessage> {
        let mut inflight_messages = Vec::new();
        while let Some(msg) = self.pop_front() {
            inflight_messages.push(msg);
        }
        inflight_messages
    }
}
