//! Extremely simple single-actor restart supervision. Vastly simplified compared to the
//! available options in [Erlang/OTP](https://erlang.org/doc/man/supervisor.html).

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use troupe::Activation;
use troupe::Actor;
use troupe::ActorResult;
use troupe::ActorService;
use troupe::Answer;
use troupe::Behaviour;
use troupe::Command;
use troupe::Error;
use troupe::System;
use troupe::actor::LifecycleState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    OnErrorOnly,
}

#[derive(Debug, Clone)]
pub struct RestartConfiguration {
    /// Restarts tolerated within `period` before backing off to `sleep_time`.
    pub intensity: usize,
    pub period: Duration,
    pub pause_time: Duration,
    pub sleep_time: Duration,
    pub restart_policy: RestartPolicy,
}

impl Default for RestartConfiguration {
    fn default() -> Self {
        Self {
            intensity: 1,
            period: Duration::from_secs(5),
            pause_time: Duration::from_millis(200),
            sleep_time: Duration::from_secs(10),
            restart_policy: RestartPolicy::Always,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervisee {
    NotRunning,
    Running,
    Recovering,
}

/// Asks a [`Restarter`] what its child is doing.
#[derive(Debug, Clone)]
pub struct ChildStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildReport {
    pub child: Option<ActorService>,
    pub state: Supervisee,
    /// How many times the child has been started, the first start included.
    pub starts: usize,
    pub last_error: Option<Error>,
}

impl Command for ChildStatus {
    type Reply = ChildReport;
}

type Factory = Box<dyn FnMut(&System) -> ActorService + Send>;

/// Keeps one child actor alive by monitoring it and starting a replacement when it closes.
pub struct Restarter {
    name: tracing::Span,
    config: RestartConfiguration,
    factory: Factory,
    restarts: VecDeque<Instant>,
    supervisee: Supervisee,
    child: Option<ActorService>,
    starts: usize,
    last_error: Option<Error>,
}

impl Restarter {
    pub fn new<F>(name: tracing::Span, config: RestartConfiguration, factory: F) -> Self
    where
        F: FnMut(&System) -> ActorService + Send + 'static,
    {
        Restarter {
            name,
            config,
            factory: Box::new(factory),
            restarts: VecDeque::new(),
            supervisee: Supervisee::NotRunning,
            child: None,
            starts: 0,
            last_error: None,
        }
    }

    /// Spawns a restarter in `system`, which starts its first child straight away.
    pub fn start<F>(system: &System, name: &str, config: RestartConfiguration, factory: F) -> ActorService
    where
        F: FnMut(&System) -> ActorService + Send + 'static,
    {
        let span = troupe::name!(parent: None, "restarter", supervisor = %name);
        system.spawn_named(name, Restarter::new(span, config, factory))
    }

    fn enter_state(&mut self, supervisee: Supervisee) {
        let _entry = self.name.enter();
        tracing::info!("{:?} --> {:?}", self.supervisee, supervisee);
        self.supervisee = supervisee;
    }

    fn ensure_started(&mut self, t: &mut Activation<Self>) -> ActorResult {
        let child = (self.factory)(t.system());
        self.starts += 1;
        self.enter_state(Supervisee::Running);
        t.monitor(&child, |a: &mut Self, t, error| a.child_closed(t, error));
        self.child = Some(child);
        Ok(())
    }

    fn child_closed(&mut self, t: &mut Activation<Self>, error: Option<Error>) -> ActorResult {
        let _name = self.name.clone();
        let _entry = _name.enter();
        tracing::debug!(?error, "supervisee closed");
        self.child = None;
        if t.state() != LifecycleState::Running {
            self.enter_state(Supervisee::NotRunning);
            return Ok(());
        }
        if error.is_none() && self.config.restart_policy == RestartPolicy::OnErrorOnly {
            tracing::trace!("Not restarting: normal exit, restart_policy is OnErrorOnly");
            self.enter_state(Supervisee::NotRunning);
            return Ok(());
        }
        tracing::trace!("Restarting: restart_policy is Always or exit was abnormal");
        self.last_error = error;
        self.enter_state(Supervisee::Recovering);
        let now = Instant::now();
        self.restarts.push_back(now);
        while let Some(stamp) = self.restarts.front() {
            if now.duration_since(*stamp) > self.config.period {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        let wait_time = if self.restarts.len() > self.config.intensity {
            self.config.sleep_time
        } else {
            self.config.pause_time
        };
        t.after(wait_time, |a: &mut Self, t| {
            a.enter_state(Supervisee::NotRunning);
            a.ensure_started(t)
        });
        Ok(())
    }
}

impl Actor for Restarter {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new().on_command(|a: &mut Self, _t, _c: ChildStatus| {
            Ok(Answer::Value(ChildReport {
                child: a.child.clone(),
                state: a.supervisee,
                starts: a.starts,
                last_error: a.last_error.clone(),
            }))
        })
    }

    fn started(&mut self, t: &mut Activation<Self>) -> ActorResult {
        {
            let _entry = self.name.enter();
            tracing::trace!(config = ?self.config);
        }
        self.ensure_started(t)
    }

    fn exit_hook(&mut self, t: &mut Activation<Self>) -> ActorResult {
        let _entry = self.name.enter();
        tracing::info!("Restarter terminating");
        if let Some(child) = self.child.take() {
            t.send_quit(&child, None);
        }
        Ok(())
    }
}
