//! fixed-size pool of clients sharing one origin.

use std::sync::{Arc, Weak};

use tokio::sync::broadcast;

use crate::{
    client::{Client, ClientOptions, Event},
    error::Error,
    handler::Handler,
    origin::Origin,
    request::RequestOpts,
    response::ResponseFuture,
};

/// pool configuration.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// number of clients, each owning one connection. default 100.
    pub connections: usize,
    pub client: ClientOptions,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connections: 100,
            client: ClientOptions::default(),
        }
    }
}

struct PoolInner {
    origin: Origin,
    clients: Vec<Client>,
    events: broadcast::Sender<Event>,
}

/// many clients, one origin. dispatch picks the least loaded member.
///
/// cheap to clone. member drivers wind down once the last pool clone drops.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new<O>(origin: O, opts: PoolOptions) -> Result<Self, Error>
    where
        O: TryInto<Origin>,
        O::Error: Into<Error>,
    {
        let origin: Origin = origin.try_into().map_err(Into::into)?;
        let (events, _) = broadcast::channel(64);

        let clients = (0..opts.connections.max(1))
            .map(|_| Client::new(origin.clone(), opts.client.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        // re-emit member events at pool level. each watcher exits with its
        // member's driver.
        for client in &clients {
            let mut rx = client.events();
            let tx = events.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let _ = tx.send(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                origin,
                clients,
                events,
            }),
        })
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    /// dispatch on the first non-busy client, else the first non-full one,
    /// else the head of the array.
    pub fn dispatch<H: Handler>(&self, opts: RequestOpts, handler: H) -> bool {
        let clients = &self.inner.clients;
        let client = clients
            .iter()
            .find(|c| !c.busy())
            .or_else(|| clients.iter().find(|c| !c.full()))
            .unwrap_or(&clients[0]);
        client.dispatch(opts, handler)
    }

    /// dispatch with a buffering handler and resolve the whole response.
    pub fn request(&self, opts: RequestOpts) -> ResponseFuture {
        let clients = &self.inner.clients;
        let client = clients
            .iter()
            .find(|c| !c.busy())
            .or_else(|| clients.iter().find(|c| !c.full()))
            .unwrap_or(&clients[0]);
        client.request(opts)
    }

    /// member and pool level events: connects, disconnects and drains.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub async fn close(&self) {
        for client in &self.inner.clients {
            client.close().await;
        }
    }

    pub async fn destroy(&self, err: Option<Error>) {
        for client in &self.inner.clients {
            client.destroy(err.clone()).await;
        }
    }

    /// members with a live connection.
    pub fn connected(&self) -> usize {
        self.inner.clients.iter().filter(|c| c.connected()).count()
    }

    pub fn pending(&self) -> usize {
        self.inner.clients.iter().map(Client::pending).sum()
    }

    pub fn running(&self) -> usize {
        self.inner.clients.iter().map(Client::running).sum()
    }

    pub fn size(&self) -> usize {
        self.inner.clients.iter().map(Client::size).sum()
    }

    /// non owning handle for observers that must not keep the pool alive.
    pub fn downgrade(&self) -> WeakPool {
        WeakPool {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// weak counterpart of [Pool].
#[derive(Clone)]
pub struct WeakPool {
    inner: Weak<PoolInner>,
}

impl WeakPool {
    pub fn upgrade(&self) -> Option<Pool> {
        self.inner.upgrade().map(|inner| Pool { inner })
    }
}
