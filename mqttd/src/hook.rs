use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{ClientInfo, Password, Publish, PublishAuth, QoS, Reason, TopicFilter, UserName};
use crate::{Error, Result};

#[async_trait]
pub trait Authenticator: Sync + Send {
    /// `Ok(true)` accepts the connection, `Ok(false)` refuses it as not authorized.
    async fn authenticate(
        &self,
        client: &ClientInfo,
        username: Option<&UserName>,
        password: Option<&Password>,
    ) -> Result<bool>;
}

/// Accepts every client.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    #[inline]
    async fn authenticate(
        &self,
        _client: &ClientInfo,
        _username: Option<&UserName>,
        _password: Option<&Password>,
    ) -> Result<bool> {
        Ok(true)
    }
}

#[async_trait]
pub trait Authorizer: Sync + Send {
    ///publish check acl
    #[inline]
    async fn authorize_publish(&self, _client: &ClientInfo, _publish: &Publish) -> Result<PublishAuth> {
        Ok(PublishAuth::Allow(None))
    }

    ///subscribe check acl
    #[inline]
    async fn authorize_subscribe(&self, _client: &ClientInfo, _topic_filter: &TopicFilter) -> Result<bool> {
        Ok(true)
    }

    ///Whether `publish` may be delivered to `client`
    #[inline]
    async fn authorize_forward(&self, _client: &ClientInfo, _publish: &Publish) -> Result<bool> {
        Ok(true)
    }
}

pub struct DefaultAuthorizer;

impl Authorizer for DefaultAuthorizer {}

/// Runs after authorization and before fan-out, an error drops the message.
#[async_trait]
pub trait PublishInterceptor: Sync + Send {
    async fn published(&self, publish: &Publish, from: Option<&ClientInfo>) -> Result<()>;
}

#[async_trait]
pub trait EventListener: Sync + Send {
    async fn on_ready(&self) {}

    async fn on_closed(&self) {}

    ///After the CONNACK was sent, the connection is active
    async fn on_client_connected(&self, _client: &ClientInfo) {}

    async fn on_client_disconnected(&self, _client: &ClientInfo, _reason: &Reason) {}

    async fn on_client_error(&self, _client: &ClientInfo, _err: &Error) {}

    ///Every accepted publish, client or programmatic
    async fn on_published(&self, _publish: &Publish, _from: Option<&ClientInfo>) {}

    ///QoS 1 message acknowledged by `client`
    async fn on_delivered(&self, _client: &ClientInfo, _publish: &Publish) {}

    async fn on_subscribed(&self, _client: &ClientInfo, _topic_filter: &TopicFilter, _qos: QoS) {}

    async fn on_unsubscribed(&self, _client: &ClientInfo, _topic_filter: &TopicFilter) {}

    async fn on_pingreq(&self, _client: &ClientInfo) {}
}

/// Every handler the broker was built with.
#[derive(Clone)]
pub struct Hooks {
    pub authenticator: Arc<dyn Authenticator>,
    pub authorizer: Arc<dyn Authorizer>,
    pub interceptor: Option<Arc<dyn PublishInterceptor>>,
    listeners: Vec<Arc<dyn EventListener>>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            authenticator: Arc::new(AllowAll),
            authorizer: Arc::new(DefaultAuthorizer),
            interceptor: None,
            listeners: Vec::new(),
        }
    }
}

impl Hooks {
    #[inline]
    pub fn add_listener(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    #[inline]
    pub async fn authenticate(
        &self,
        client: &ClientInfo,
        username: Option<&UserName>,
        password: Option<&Password>,
    ) -> Result<bool> {
        self.authenticator.authenticate(client, username, password).await
    }

    /// A hook error is reported and counts as `Reject`.
    #[inline]
    pub async fn authorize_publish(&self, client: &ClientInfo, publish: &Publish) -> PublishAuth {
        match self.authorizer.authorize_publish(client, publish).await {
            Ok(res) => res,
            Err(e) => {
                log::warn!("{} authorize_publish error, topic: {:?}, {:?}", client, publish.topic, e);
                self.client_error(client, &e).await;
                PublishAuth::Reject
            }
        }
    }

    /// A hook error is reported and counts as refused.
    #[inline]
    pub async fn authorize_subscribe(&self, client: &ClientInfo, topic_filter: &TopicFilter) -> bool {
        match self.authorizer.authorize_subscribe(client, topic_filter).await {
            Ok(allow) => allow,
            Err(e) => {
                log::warn!("{} authorize_subscribe error, topic_filter: {:?}, {:?}", client, topic_filter, e);
                self.client_error(client, &e).await;
                false
            }
        }
    }

    #[inline]
    pub async fn authorize_forward(&self, client: &ClientInfo, publish: &Publish) -> bool {
        match self.authorizer.authorize_forward(client, publish).await {
            Ok(allow) => allow,
            Err(e) => {
                log::warn!("{} authorize_forward error, topic: {:?}, {:?}", client, publish.topic, e);
                self.client_error(client, &e).await;
                false
            }
        }
    }

    #[inline]
    pub async fn intercept(&self, publish: &Publish, from: Option<&ClientInfo>) -> Result<()> {
        if let Some(interceptor) = self.interceptor.as_ref() {
            interceptor.published(publish, from).await?;
        }
        Ok(())
    }

    #[inline]
    pub async fn ready(&self) {
        for l in self.listeners.iter() {
            l.on_ready().await;
        }
    }

    #[inline]
    pub async fn closed(&self) {
        for l in self.listeners.iter() {
            l.on_closed().await;
        }
    }

    #[inline]
    pub async fn client_connected(&self, client: &ClientInfo) {
        for l in self.listeners.iter() {
            l.on_client_connected(client).await;
        }
    }

    #[inline]
    pub async fn client_disconnected(&self, client: &ClientInfo, reason: &Reason) {
        for l in self.listeners.iter() {
            l.on_client_disconnected(client, reason).await;
        }
    }

    #[inline]
    pub async fn client_error(&self, client: &ClientInfo, err: &Error) {
        for l in self.listeners.iter() {
            l.on_client_error(client, err).await;
        }
    }

    #[inline]
    pub async fn published(&self, publish: &Publish, from: Option<&ClientInfo>) {
        for l in self.listeners.iter() {
            l.on_published(publish, from).await;
        }
    }

    #[inline]
    pub async fn delivered(&self, client: &ClientInfo, publish: &Publish) {
        for l in self.listeners.iter() {
            l.on_delivered(client, publish).await;
        }
    }

    #[inline]
    pub async fn subscribed(&self, client: &ClientInfo, topic_filter: &TopicFilter, qos: QoS) {
        for l in self.listeners.iter() {
            l.on_subscribed(client, topic_filter, qos).await;
        }
    }

    #[inline]
    pub async fn unsubscribed(&self, client: &ClientInfo, topic_filter: &TopicFilter) {
        for l in self.listeners.iter() {
            l.on_unsubscribed(client, topic_filter).await;
        }
    }

    #[inline]
    pub async fn pingreq(&self, client: &ClientInfo) {
        for l in self.listeners.iter() {
            l.on_pingreq(client).await;
        }
    }
}
