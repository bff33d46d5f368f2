//! Spawning, the shutdown barrier, plugins and surveillance.

use super::actor::Activation;
use super::actor::Actor;
use super::actor::ActorCell;
use super::actor::ActorService;
use super::actor::LifecycleState;
use super::actor::StateChange;
use super::behaviour::Answer;
use super::behaviour::Behaviour;
use super::behaviour::Command;
use super::config::SystemConfig;
use super::error::ActorResult;
use super::error::Error;

use parking_lot::RwLock;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use tokio::sync::Notify;
use tokio::sync::oneshot;

use tracing::Instrument;

/// A shared handle onto one group of actors.
///
/// Every actor spawned through a `System` counts towards its live total;
/// [`wait_finished`][System::wait_finished] returns once that total drops to zero. Plugins
/// are started by [`System::new`] before anything else and live until
/// [`quit_plugins`][System::quit_plugins] or [`shutdown`][System::shutdown].
#[derive(Clone)]
pub struct System {
    inner: Arc<SystemInner>,
}

struct SystemInner {
    config: SystemConfig,
    live: AtomicUsize,
    finished: Notify,
    plugins: RwLock<Vec<(String, ActorService)>>,
    surveillance: RwLock<Option<ActorService>>,
}

type PluginFactory = Box<dyn FnOnce(&System) -> ActorService + Send>;

/// The plugins a [`System`] starts, in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    entries: Vec<(String, PluginFactory)>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry { entries: Vec::new() }
    }

    /// Adds a plugin. `make` is called once, with the new system, and should spawn the plugin
    /// actor and return its handle.
    pub fn register<F>(mut self, name: &str, make: F) -> Self
    where
        F: FnOnce(&System) -> ActorService + Send + 'static,
    {
        self.entries.push((name.to_owned(), Box::new(make)));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        f.debug_list().entries(self.entries.iter().map(|(n, _)| n)).finish()
    }
}

impl System {
    /// Creates a system and starts surveillance (if configured) and then the plugins. Must be
    /// called from within a tokio runtime.
    pub fn new(config: SystemConfig, plugins: PluginRegistry) -> Self {
        tracing::debug!(name = %config.name, plugins = plugins.len(), "system starting");
        let surveillance = config.surveillance;
        let system = System {
            inner: Arc::new(SystemInner {
                config,
                live: AtomicUsize::new(0),
                finished: Notify::new(),
                plugins: RwLock::new(Vec::new()),
                surveillance: RwLock::new(None),
            }),
        };
        if surveillance {
            let s = system.spawn_named("surveillance", Surveillance::default());
            *system.inner.surveillance.write() = Some(s);
        }
        for (name, make) in plugins.entries.into_iter() {
            let service = make(&system);
            tracing::debug!(plugin = %name, ?service, "plugin started");
            system.inner.plugins.write().push((name, service));
        }
        system
    }

    pub fn config(&self) -> &SystemConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Starts `actor`, named after its type.
    pub fn spawn<A: Actor>(&self, actor: A) -> ActorService {
        let type_name = std::any::type_name::<A>();
        let path = type_name.split('<').next().unwrap_or(type_name);
        let name = path.rsplit("::").next().unwrap_or(path);
        self.spawn_named(name, actor)
    }

    /// Starts `actor` in its own task. `name` is used in log messages and by
    /// [`ActorService::name`].
    pub fn spawn_named<A: Actor>(&self, name: &str, actor: A) -> ActorService {
        let service = ActorService::new(name);
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        if let Some(s) = self.inner.surveillance.read().as_ref() {
            s.send_message(Spawned { service: service.clone() });
        }
        let span = crate::name!("actor", actor = %name);
        span.record("actor_id", &service.id());
        tokio::spawn(ActorCell::new(actor, service.clone(), self.clone()).run().instrument(span));
        service
    }

    pub(crate) fn actor_finished(&self, service: &ActorService) {
        tracing::trace!(?service, "actor finished");
        if self.inner.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.finished.notify_waiters();
        }
    }

    /// The number of spawned actors that have not reached `Dead`.
    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Resolves once every actor spawned in this system, plugins included, is dead.
    pub async fn wait_finished(&self) {
        loop {
            let notified = self.inner.finished.notified();
            if self.live_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn plugin(&self, name: &str) -> Option<ActorService> {
        self.inner.plugins.read().iter().find(|(n, _)| n == name).map(|(_, s)| s.clone())
    }

    pub fn surveillance(&self) -> Option<ActorService> {
        self.inner.surveillance.read().clone()
    }

    /// Asks every plugin, and surveillance, to quit, newest plugin first.
    pub fn quit_plugins(&self) {
        for (name, service) in self.inner.plugins.read().iter().rev() {
            tracing::debug!(plugin = %name, "stopping plugin");
            service.send_quit(None);
        }
        if let Some(s) = self.inner.surveillance.read().as_ref() {
            s.send_quit(None);
        }
    }

    /// Stops the long-lived actors and waits for everything to finish.
    pub async fn shutdown(&self) {
        self.quit_plugins();
        self.wait_finished().await;
        tracing::debug!(name = %self.name(), "system finished");
    }

    /// Sends `command` to `target` from outside any actor and waits for the reply.
    pub async fn ask<C: Command>(&self, target: &ActorService, command: C) -> Result<C::Reply, Error> {
        let (tx, rx) = oneshot::channel();
        self.spawn_named("ask", Asker { target: target.clone(), command: Some(command), reply: Some(tx) });
        rx.await.map_err(|_| Error::ActorDead)?
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "#<System {:?} live={}>", self.name(), self.live_count())
    }
}

//---------------------------------------------------------------------------

/// A one-shot actor relaying a single request for [`System::ask`].
struct Asker<C: Command> {
    target: ActorService,
    command: Option<C>,
    reply: Option<oneshot::Sender<Result<C::Reply, Error>>>,
}

impl<C: Command> Actor for Asker<C> {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new()
    }

    fn started(&mut self, t: &mut Activation<Self>) -> ActorResult {
        if let Some(command) = self.command.take() {
            let target = self.target.clone();
            t.request(&target, command, |a: &mut Self, _t, result| {
                if let Some(tx) = a.reply.take() {
                    let _ = tx.send(result);
                }
                Ok(())
            });
        }
        Ok(())
    }
}

//---------------------------------------------------------------------------

struct Spawned {
    service: ActorService,
}

/// Asks the surveillance actor for what it has seen so far.
#[derive(Debug, Clone)]
pub struct SurveillanceReport;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurveillanceSummary {
    pub spawned: usize,
    /// Actors not yet dead, by id, with their last reported state.
    pub live: BTreeMap<u64, (String, LifecycleState)>,
    pub dead: usize,
    /// Dead actors that terminated with an error.
    pub failed: usize,
}

impl Command for SurveillanceReport {
    type Reply = SurveillanceSummary;
}

#[derive(Default)]
struct Surveillance {
    summary: SurveillanceSummary,
}

impl Actor for Surveillance {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new()
            .on_message(|a: &mut Self, t, m: Spawned| {
                tracing::info!(actor = ?m.service, "spawned");
                a.summary.spawned += 1;
                t.subscribe_state(&m.service);
                Ok(())
            })
            .on_message(|a: &mut Self, _t, m: StateChange| {
                let id = m.actor.id();
                match &m.error {
                    None => tracing::info!(actor = ?m.actor, state = ?m.state, "state change"),
                    Some(e) => tracing::info!(actor = ?m.actor, state = ?m.state, error = %e, "state change"),
                }
                if m.state == LifecycleState::Dead {
                    a.summary.live.remove(&id);
                    a.summary.dead += 1;
                    if m.error.is_some() {
                        a.summary.failed += 1;
                    }
                } else {
                    a.summary.live.insert(id, (m.actor.name().to_owned(), m.state));
                }
                Ok(())
            })
            .on_command(|a: &mut Self, _t, _c: SurveillanceReport| Ok(Answer::Value(a.summary.clone())))
    }
}
