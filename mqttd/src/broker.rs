//! Broker core
//!
//! [`Broker`] ties the router, the session and retained stores, persistence, hooks and
//! statistics together and dispatches every accepted publish to its subscribers.
//!
//! ```rust,no_run
//! # async fn demo() -> mqttd::Result<()> {
//! use mqttd::{Broker, ChannelTransport, Publish, QoS};
//!
//! let broker = Broker::builder().build().await?;
//! let _sub = broker.subscribe("sensors/#", QoS::AtMostOnce, |p: Publish| {
//!     println!("{:?}", p);
//! })?;
//!
//! let (transport, _peer) = ChannelTransport::pair();
//! broker.connect(transport);
//!
//! broker.publish(Publish::new("sensors/t1", "21.5", QoS::AtMostOnce)).await?;
//! broker.close().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use mqttd_conf::Settings;

use crate::hook::{Authenticator, Authorizer, EventListener, Hooks, PublishInterceptor};
use crate::persistence::{self, Persistence};
use crate::retain::RetainStore;
use crate::router::Router;
use crate::session::{Route, SessionStore};
use crate::stats::Stats;
use crate::topic::Topic;
use crate::transport::Transport;
use crate::types::{ClientId, ClientInfo, DashMap, Message, Publish, QoS, Reason, Subscriber, TopicFilter};
use crate::{connection, sys, MqttError, Result};

/// Receives messages routed to a programmatic subscription.
pub trait LocalHandler: Send + Sync + 'static {
    fn handle(&self, publish: Publish);
}

impl<F> LocalHandler for F
where
    F: Fn(Publish) + Send + Sync + 'static,
{
    #[inline]
    fn handle(&self, publish: Publish) {
        self(publish)
    }
}

/// Handle of a subscription made with [`Broker::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSubscription {
    pub id: u64,
    pub topic_filter: TopicFilter,
    pub qos: QoS,
}

pub struct BrokerInner {
    pub id: String,
    pub settings: Settings,
    pub router: Arc<Router>,
    pub retain: RetainStore,
    pub sessions: SessionStore,
    pub persistence: Arc<dyn Persistence>,
    pub hooks: Hooks,
    pub stats: Stats,
    locals: DashMap<u64, Arc<dyn LocalHandler>>,
    next_local_id: AtomicU64,
    next_conn_id: AtomicU64,
    closed: AtomicBool,
    stats_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Deref for Broker {
    type Target = BrokerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl From<Arc<BrokerInner>> for Broker {
    #[inline]
    fn from(inner: Arc<BrokerInner>) -> Self {
        Broker { inner }
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.id)
            .field("sessions", &self.sessions.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Broker {
    #[inline]
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    /// Serve one client over `transport` on a new task.
    pub fn connect<T: Transport>(&self, transport: T) -> JoinHandle<()> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(connection::serve(self.clone(), transport, conn_id))
    }

    /// Publish on behalf of the broker itself, `authorize_publish` is not consulted.
    pub async fn publish(&self, publish: Publish) -> Result<()> {
        if self.is_closed() {
            return Err(MqttError::BrokerClosed.into());
        }
        Topic::parse_name(&publish.topic).map_err(MqttError::from)?;
        self.dispatch(publish, None).await
    }

    /// Route matching messages to `handler`, at most at `qos`.
    pub fn subscribe<H: LocalHandler>(&self, topic_filter: &str, qos: QoS, handler: H) -> Result<LocalSubscription> {
        let id = self.next_local_id.fetch_add(1, Ordering::SeqCst);
        self.locals.insert(id, Arc::new(handler));
        if let Err(e) = self.router.subscribe(topic_filter, Subscriber::Local(id), qos) {
            self.locals.remove(&id);
            return Err(e);
        }
        Ok(LocalSubscription { id, topic_filter: TopicFilter::from(topic_filter), qos })
    }

    pub fn unsubscribe(&self, sub: &LocalSubscription) -> Result<bool> {
        let removed = self.router.unsubscribe(&sub.topic_filter, &Subscriber::Local(sub.id))?;
        self.locals.remove(&sub.id);
        Ok(removed)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Disconnect every client with "server closed" and release persistence.
    ///
    /// Only the first call does anything.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("broker {} closing, online clients: {}", self.id, self.stats.connections.count());
        if let Some(task) = self.stats_task.lock().take() {
            task.abort();
        }

        let kicks = self.sessions.online().into_iter().map(|(client_id, tx)| async move {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(Message::Kick(Reason::ServerClosed, reply_tx)).is_ok() && reply_rx.await.is_err() {
                log::debug!("{:?} connection exited before acknowledging close", client_id);
            }
        });
        join_all(kicks).await;

        let res = self.persistence.close().await;
        self.hooks.closed().await;
        res
    }

    /// Fan `publish` out to every matching subscriber.
    ///
    /// The interceptor runs first, an interceptor error drops the message before it can touch
    /// the retained store. A retained message that cannot be persisted is not published.
    pub(crate) async fn dispatch(&self, publish: Publish, from: Option<&ClientInfo>) -> Result<()> {
        self.hooks.intercept(&publish, from).await?;

        if publish.retain {
            if let Err(e) = self.persistence.store_retained(&publish).await {
                log::warn!("store retained message error, topic: {:?}, {:?}", publish.topic, e);
                return Err(e);
            }
            self.retain.set(&publish.topic, publish.payload.clone(), publish.qos)?;
        }

        if !publish.is_sys() {
            self.stats.publishes.inc();
        }
        self.hooks.published(&publish, from).await;

        let subscribers = self.router.match_subscribers(&publish.topic)?;
        log::debug!("{:?} matched {} subscribers", publish.topic, subscribers.len());
        for (subscriber, qos) in subscribers {
            match subscriber {
                Subscriber::Client(client_id) => self.forward(&client_id, &publish, qos).await,
                Subscriber::Local(id) => {
                    let handler = self.locals.get(&id).map(|h| h.value().clone());
                    if let Some(handler) = handler {
                        let mut p = publish.clone();
                        p.qos = p.qos.less_value(qos);
                        p.retain = false;
                        handler.handle(p);
                    }
                }
            }
        }
        Ok(())
    }

    async fn forward(&self, client_id: &ClientId, publish: &Publish, granted: QoS) {
        let (info, tx) = match self.sessions.route(client_id) {
            Route::Online(info, tx) => (Some(info), Some(tx)),
            Route::Offline(info) => (info, None),
            Route::Unknown => return,
        };
        if let Some(info) = info.as_ref() {
            if !self.hooks.authorize_forward(info, publish).await {
                log::debug!("{:?} forward refused, topic: {:?}", client_id, publish.topic);
                return;
            }
        }

        let mut p = publish.clone();
        p.qos = p.qos.less_value(granted);
        p.retain = false;
        p.dup = false;
        p.packet_id = None;

        let p = match tx {
            Some(tx) => match tx.send(Message::Forward(p)) {
                Ok(()) => return,
                Err(e) => match e.0 {
                    Message::Forward(p) => p,
                    Message::Kick(..) => return,
                },
            },
            None => p,
        };
        if let Err(e) = self.sessions.enqueue_offline(client_id, p).await {
            log::warn!("{:?} store offline message error, {:?}", client_id, e);
        }
    }

    #[inline]
    pub(crate) fn check_conn_limit(&self) -> std::result::Result<(), MqttError> {
        let max = self.settings.mqtt.max_connections;
        if self.stats.connections.count() as usize >= max {
            return Err(MqttError::TooManyConnections(max));
        }
        Ok(())
    }
}

/// Builds a [`Broker`] with its settings, handlers and persistence.
#[derive(Default)]
pub struct BrokerBuilder {
    settings: Option<Settings>,
    hooks: Hooks,
    persistence: Option<Arc<dyn Persistence>>,
}

impl BrokerBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn authenticator<A: Authenticator + 'static>(mut self, authenticator: A) -> Self {
        self.hooks.authenticator = Arc::new(authenticator);
        self
    }

    pub fn authorizer<A: Authorizer + 'static>(mut self, authorizer: A) -> Self {
        self.hooks.authorizer = Arc::new(authorizer);
        self
    }

    pub fn interceptor<I: PublishInterceptor + 'static>(mut self, interceptor: I) -> Self {
        self.hooks.interceptor = Some(Arc::new(interceptor));
        self
    }

    /// Add an event listener, any number may be added.
    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.hooks.add_listener(listener);
        self
    }

    /// Use `persistence` instead of the backend named in the settings.
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub async fn build(self) -> Result<Broker> {
        let settings = self.settings.unwrap_or_default();
        let persistence = match self.persistence {
            Some(p) => p,
            None => persistence::create(&settings.persistence)?,
        };

        let retain = RetainStore::new();
        for p in persistence.load_retained().await? {
            retain.set(&p.topic, p.payload, p.qos)?;
        }
        log::info!("restored {} retained messages", retain.count());

        let id = if settings.node.id.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            settings.node.id.clone()
        };

        let router = Arc::new(Router::new());
        let inner = Arc::new(BrokerInner {
            id,
            sessions: SessionStore::new(router.clone(), persistence.clone()),
            router,
            retain,
            persistence,
            hooks: self.hooks,
            stats: Stats::new(),
            settings,
            locals: DashMap::default(),
            next_local_id: AtomicU64::new(1),
            next_conn_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            stats_task: Mutex::new(None),
        });
        *inner.stats_task.lock() = sys::start_stats(Arc::downgrade(&inner));

        let broker = Broker::from(inner);
        broker.settings.logs();
        log::info!("broker {} ready", broker.id);
        broker.hooks.ready().await;
        Ok(broker)
    }
}
