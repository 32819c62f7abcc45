//! origin to pool mapping and the process wide default agent.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock, Weak},
};

use once_cell::sync::Lazy;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    client::Event,
    error::Error,
    handler::Handler,
    origin::Origin,
    pool::{Pool, PoolOptions},
    request::RequestOpts,
    response::{CollectHandler, ResponseFuture},
};

/// builds the pool for an origin the agent has not seen yet.
pub type PoolFactory = Arc<dyn Fn(&Origin, &PoolOptions) -> Result<Pool, Error> + Send + Sync>;

#[derive(Default)]
pub struct AgentOptions {
    pub pool: PoolOptions,
}

struct AgentInner {
    opts: AgentOptions,
    factory: PoolFactory,
    pools: Mutex<HashMap<Origin, Pool>>,
}

/// routes each request to a per-origin [Pool], creating pools lazily and
/// evicting them once idle and empty.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(opts: AgentOptions) -> Self {
        Self::with_factory(Arc::new(|origin, opts| Pool::new(origin.clone(), opts.clone())), opts)
    }

    pub fn with_factory(factory: PoolFactory, opts: AgentOptions) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                opts,
                factory,
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// dispatch onto the pool for `origin`. pool creation failures surface
    /// through `handler.on_error`.
    pub fn dispatch<H: Handler>(&self, origin: &Origin, opts: RequestOpts, handler: H) -> bool {
        match self.pool_for(origin) {
            Ok(pool) => pool.dispatch(opts, handler),
            Err(e) => {
                let mut handler: Box<dyn Handler> = Box::new(handler);
                handler.on_error(e);
                true
            }
        }
    }

    /// buffered request against an absolute url.
    pub fn request(&self, url: &str, mut opts: RequestOpts) -> ResponseFuture {
        let (mut handler, fut) = CollectHandler::new();
        match Origin::parse_with_path(url) {
            Ok((origin, path)) => {
                opts.path = path;
                self.dispatch(&origin, opts, handler);
            }
            Err(e) => handler.on_error(e),
        }
        fut
    }

    pub fn pool_count(&self) -> usize {
        self.inner.pools.lock().unwrap().len()
    }

    pub async fn close(&self) {
        let pools = std::mem::take(&mut *self.inner.pools.lock().unwrap());
        for pool in pools.values() {
            pool.close().await;
        }
    }

    pub async fn destroy(&self, err: Option<Error>) {
        let pools = std::mem::take(&mut *self.inner.pools.lock().unwrap());
        for pool in pools.values() {
            pool.destroy(err.clone()).await;
        }
    }

    fn pool_for(&self, origin: &Origin) -> Result<Pool, Error> {
        let mut pools = self.inner.pools.lock().unwrap();
        if let Some(pool) = pools.get(origin) {
            return Ok(pool.clone());
        }

        let pool = (self.inner.factory)(origin, &self.inner.opts.pool)?;
        pools.insert(origin.clone(), pool.clone());
        drop(pools);

        debug!(target: "client", origin = %origin, "pool created");
        spawn_eviction_watcher(Arc::downgrade(&self.inner), origin.clone(), &pool);

        Ok(pool)
    }
}

/// drop the pool entry once it is both disconnected and empty. driven by the
/// pool's own disconnect events, not by finalization; the watcher holds only
/// weak handles so it cannot keep either the agent or the pool alive.
fn spawn_eviction_watcher(agent: Weak<AgentInner>, origin: Origin, pool: &Pool) {
    let mut events = pool.events();
    let pool = pool.downgrade();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::Disconnect(_) | Event::ConnectionError(_)) => {
                    let Some(pool) = pool.upgrade() else { break };
                    if pool.connected() == 0 && pool.size() == 0 {
                        let Some(agent) = agent.upgrade() else { break };
                        agent.pools.lock().unwrap().remove(&origin);
                        debug!(target: "client", origin = %origin, "idle pool evicted");
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

static GLOBAL_AGENT: Lazy<RwLock<Agent>> = Lazy::new(|| RwLock::new(Agent::new(AgentOptions::default())));

/// the process wide default agent, created lazily on first use.
pub fn global_agent() -> Agent {
    GLOBAL_AGENT.read().unwrap().clone()
}

/// replace the process wide default agent.
pub fn set_global_agent(agent: Agent) {
    *GLOBAL_AGENT.write().unwrap() = agent;
}
