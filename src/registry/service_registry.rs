use super::health::{Announcer, HealthCheck};
use super::service::{HealthStatus, ServiceInfo};
use super::RegistrySettings;
use crate::colored::Colorize;
use crate::zfx_id::Id;
use crate::Result;

use actix::{Actor, ActorFutureExt, AsyncContext, Context, Handler, WrapFuture};
use actix_derive::{Message, MessageResponse};
use futures::future::join_all;
use tracing::{debug, info};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

struct LocalService {
    info: ServiceInfo,
    consecutive_failures: u32,
}

struct RemoteService {
    info: ServiceInfo,
    refreshed: Instant,
}

pub struct ServiceRegistry {
    local_id: Id,
    settings: RegistrySettings,
    checker: Arc<dyn HealthCheck>,
    announcer: Arc<dyn Announcer>,
    local: HashMap<String, LocalService>,
    remote: HashMap<(Id, String), RemoteService>,
    checking: bool,
}

impl ServiceRegistry {
    pub fn new(
        local_id: Id,
        settings: RegistrySettings,
        checker: Arc<dyn HealthCheck>,
        announcer: Arc<dyn Announcer>,
    ) -> Self {
        ServiceRegistry {
            local_id,
            settings,
            checker,
            announcer,
            local: HashMap::new(),
            remote: HashMap::new(),
            checking: false,
        }
    }

    fn announce(&self, mut info: ServiceInfo, ctx: &mut Context<Self>) {
        info.touch();
        debug!("[{}] announcing {} ({:?})", "registry".cyan(), info.name, info.status);
        ctx.spawn(self.announcer.announce(info).into_actor(self));
    }

    /// Applies one health check result to a local service.
    fn record_check(&mut self, name: &str, healthy: bool, ctx: &mut Context<Self>) {
        let threshold = self.settings.unhealthy_threshold.max(1);
        let service = match self.local.get_mut(name) {
            Some(service) => service,
            // Deregistered while the check was running.
            None => return,
        };
        let mut announcement = None;
        if healthy {
            service.consecutive_failures = 0;
            if service.info.status == HealthStatus::Unhealthy {
                info!("[{}] {} is {:?} again", "registry".cyan(), name, HealthStatus::Healthy);
                service.info.status = HealthStatus::Healthy;
                announcement = Some(service.info.clone());
            }
        } else {
            service.consecutive_failures = service.consecutive_failures.saturating_add(1);
            debug!("[{}] {} failed check {}/{}", "registry".cyan(), name, service.consecutive_failures, threshold);
            if service.consecutive_failures == threshold {
                info!("[{}] {} is {:?}", "registry".cyan(), name, HealthStatus::Unhealthy);
                service.info.status = HealthStatus::Unhealthy;
                // Announced once so that peers stop routing to it; then silent.
                announcement = Some(service.info.clone());
            }
        }
        if let Some(info) = announcement {
            self.announce(info, ctx);
        }
    }

    fn check_health(&mut self, ctx: &mut Context<Self>) {
        if self.checking || self.local.is_empty() {
            return;
        }
        self.checking = true;
        let timeout = self.settings.check_timeout();
        let checks = self.local.values().map(|service| {
            let name = service.info.name.clone();
            let check = self.checker.check(&service.info);
            async move {
                let healthy = tokio::time::timeout(timeout, check).await.unwrap_or(false);
                (name, healthy)
            }
        });
        let round = join_all(checks).into_actor(self).map(|results, act, ctx| {
            act.checking = false;
            for (name, healthy) in results {
                act.record_check(&name, healthy, ctx);
            }
        });
        ctx.spawn(round);
    }

    fn reannounce(&mut self, ctx: &mut Context<Self>) {
        let healthy: Vec<ServiceInfo> =
            self.local.values().filter(|s| s.info.is_healthy()).map(|s| s.info.clone()).collect();
        for info in healthy {
            self.announce(info, ctx);
        }
    }

    fn evict_expired(&mut self) {
        let ttl = self.settings.ttl();
        let now = Instant::now();
        self.remote.retain(|(owner, name), service| {
            let fresh = now.duration_since(service.refreshed) <= ttl;
            if !fresh {
                info!("[{}] forgetting {} of {}", "registry".cyan(), name, owner);
            }
            fresh
        });
    }
}

impl Actor for ServiceRegistry {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Context<Self>) {
        debug!("[{}] started", "registry".cyan());
        ctx.run_interval(self.settings.check_interval(), |act, ctx| act.check_health(ctx));
        ctx.run_interval(self.settings.announce_interval(), |act, ctx| act.reannounce(ctx));
        ctx.run_interval(self.settings.eviction_interval(), |act, _ctx| act.evict_expired());
    }
}

/// Registers a local service and announces it right away.
#[derive(Debug, Clone, Message)]
#[rtype(result = "Result<()>")]
pub struct Register {
    pub service: ServiceInfo,
}

impl Handler<Register> for ServiceRegistry {
    type Result = Result<()>;

    fn handle(&mut self, msg: Register, ctx: &mut Context<Self>) -> Self::Result {
        msg.service.validate()?;
        let mut info = msg.service;
        info.owner = self.local_id;
        info.status = HealthStatus::Healthy;
        info!("[{}] registered {} {}", "registry".cyan(), info.name, info.version);
        let _ = self
            .local
            .insert(info.name.clone(), LocalService { info: info.clone(), consecutive_failures: 0 });
        self.announce(info, ctx);
        Ok(())
    }
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "bool")]
pub struct Deregister {
    pub name: String,
}

impl Handler<Deregister> for ServiceRegistry {
    type Result = bool;

    fn handle(&mut self, msg: Deregister, _ctx: &mut Context<Self>) -> Self::Result {
        self.local.remove(&msg.name).is_some()
    }
}

/// A service entry announced by another node.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct ReceiveAnnouncement {
    pub service: ServiceInfo,
}

impl Handler<ReceiveAnnouncement> for ServiceRegistry {
    type Result = ();

    fn handle(&mut self, msg: ReceiveAnnouncement, _ctx: &mut Context<Self>) -> Self::Result {
        let service = msg.service;
        if service.owner == self.local_id || service.validate().is_err() {
            return;
        }
        let key = (service.owner, service.name.clone());
        if let Some(previous) = self.remote.get(&key) {
            if previous.info.updated > service.updated {
                return;
            }
            if previous.info.status != service.status {
                info!("[{}] {} of {} is {:?}", "registry".cyan(), service.name, service.owner, service.status);
            }
        }
        let _ = self.remote.insert(key, RemoteService { info: service, refreshed: Instant::now() });
    }
}

#[derive(Debug, Clone, MessageResponse)]
pub struct Services {
    pub local: Vec<ServiceInfo>,
    pub remote: Vec<ServiceInfo>,
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "Services")]
pub struct GetServices;

impl Handler<GetServices> for ServiceRegistry {
    type Result = Services;

    fn handle(&mut self, _msg: GetServices, _ctx: &mut Context<Self>) -> Self::Result {
        Services {
            local: self.local.values().map(|s| s.info.clone()).collect(),
            remote: self.remote.values().map(|s| s.info.clone()).collect(),
        }
    }
}

/// Known providers of a service, local first, healthy before unhealthy.
#[derive(Debug, Clone, Message)]
#[rtype(result = "Vec<ServiceInfo>")]
pub struct FindService {
    pub name: String,
    pub healthy_only: bool,
}

impl Handler<FindService> for ServiceRegistry {
    type Result = Vec<ServiceInfo>;

    fn handle(&mut self, msg: FindService, _ctx: &mut Context<Self>) -> Self::Result {
        let local = self.local.get(&msg.name).map(|s| s.info.clone());
        let remote = self.remote.values().filter(|s| s.info.name == msg.name).map(|s| s.info.clone());
        let mut found: Vec<ServiceInfo> =
            local.into_iter().chain(remote).filter(|s| !msg.healthy_only || s.is_healthy()).collect();
        found.sort_by_key(|s| !s.is_healthy());
        found
    }
}
