//! A name registry: actors register under names, others look them up or wait for them.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;

use troupe::Activation;
use troupe::Actor;
use troupe::ActorResult;
use troupe::ActorService;
use troupe::Answer;
use troupe::Behaviour;
use troupe::Command;
use troupe::Error;
use troupe::command::Promise;
use troupe::command::PromiseId;

/// Binds `name` to `service` until it is unregistered or `service` closes.
#[derive(Debug, Clone)]
pub struct Register {
    pub name: String,
    pub service: ActorService,
}

impl Command for Register {
    type Reply = ();
}

#[derive(Debug, Clone)]
pub struct Unregister {
    pub name: String,
}

impl Command for Unregister {
    type Reply = ();
}

#[derive(Debug, Clone)]
pub struct Lookup {
    pub name: String,
}

impl Command for Lookup {
    type Reply = ActorService;
}

/// Like [`Lookup`], but answered only once the name is registered.
#[derive(Debug, Clone)]
pub struct WaitFor {
    pub name: String,
}

impl Command for WaitFor {
    type Reply = ActorService;
}

/// Declares that `name` will never be registered. Waiters fail with
/// [`Error::NotGonnaHappen`].
#[derive(Debug, Clone)]
pub struct MarkUnregisterable {
    pub name: String,
}

impl Command for MarkUnregisterable {
    type Reply = ();
}

#[derive(Debug, Clone)]
pub struct List;

impl Command for List {
    type Reply = Vec<(String, ActorService)>;
}

#[derive(Default)]
pub struct Registry {
    names: BTreeMap<String, ActorService>,
    waiters: HashMap<String, Vec<Promise<ActorService>>>,
    unregisterable: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, t: &mut Activation<Self>, r: Register) -> ActorResult {
        if self.unregisterable.contains(&r.name) {
            return Err(Error::NotGonnaHappen);
        }
        if let Some(existing) = self.names.get(&r.name) {
            return if existing == &r.service { Ok(()) } else { Err(Error::AlreadyRegistered) };
        }
        if r.service.is_dead() || r.service.is_null() {
            return Err(Error::ActorDead);
        }
        tracing::debug!(name = %r.name, service = ?r.service, "registered");
        self.names.insert(r.name.clone(), r.service.clone());
        for waiter in self.waiters.remove(&r.name).unwrap_or_default().into_iter() {
            waiter.resolve(t, r.service.clone());
        }
        let Register { name, service } = r;
        let watched = service.clone();
        t.monitor(&watched, move |a: &mut Self, _t, error| {
            if a.names.get(&name) == Some(&service) {
                tracing::debug!(%name, ?error, "registered actor closed");
                a.names.remove(&name);
            }
            Ok(())
        });
        Ok(())
    }

    fn wait_for(&mut self, t: &mut Activation<Self>, name: String) -> Result<Answer<ActorService>, Error> {
        if let Some(service) = self.names.get(&name) {
            return Ok(Answer::Value(service.clone()));
        }
        if self.unregisterable.contains(&name) {
            return Err(Error::NotGonnaHappen);
        }
        let key = name.clone();
        let id = t.current_promise().cloned().ok_or(Error::NoCurrentCommand)?;
        let promise = t.promise_with_cancel(move |a: &mut Self, _t: &mut Activation<Self>| {
            a.forget_waiter(&key, &id);
            Ok(())
        })?;
        tracing::trace!(%name, "waiting");
        self.waiters.entry(name).or_default().push(promise);
        Ok(Answer::Pending)
    }

    fn forget_waiter(&mut self, name: &str, id: &PromiseId) {
        if let Some(ws) = self.waiters.get_mut(name) {
            ws.retain(|p| p.id() != id);
            if ws.is_empty() {
                self.waiters.remove(name);
            }
        }
    }

    fn mark_unregisterable(&mut self, t: &mut Activation<Self>, name: String) -> ActorResult {
        if self.names.contains_key(&name) {
            return Err(Error::AlreadyRegistered);
        }
        for waiter in self.waiters.remove(&name).unwrap_or_default().into_iter() {
            waiter.fail(t, Error::NotGonnaHappen);
        }
        self.unregisterable.insert(name);
        Ok(())
    }
}

impl Actor for Registry {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new()
            .on_command(|a: &mut Self, t, r: Register| {
                a.register(t, r)?;
                Ok(Answer::Value(()))
            })
            .on_command(|a: &mut Self, _t, u: Unregister| match a.names.remove(&u.name) {
                Some(service) => {
                    tracing::debug!(name = %u.name, ?service, "unregistered");
                    Ok(Answer::Value(()))
                }
                None => Err(Error::NotFound),
            })
            .on_command(|a: &mut Self, _t, l: Lookup| match a.names.get(&l.name) {
                Some(service) => Ok(Answer::Value(service.clone())),
                None => Err(Error::NotFound),
            })
            .on_command(|a: &mut Self, t, w: WaitFor| a.wait_for(t, w.name))
            .on_command(|a: &mut Self, t, m: MarkUnregisterable| {
                a.mark_unregisterable(t, m.name)?;
                Ok(Answer::Value(()))
            })
            .on_command(|a: &mut Self, _t, _l: List| {
                Ok(Answer::Value(a.names.iter().map(|(n, s)| (n.clone(), s.clone())).collect()))
            })
    }
}
